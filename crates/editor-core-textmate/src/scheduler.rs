use crate::textmate::{
    CancellationToken, Generation, GrammarTokenizer, RegionPass, ScopedRange, SyntaxNode,
    SyntaxTree, TextEdit, TextSnapshot,
};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use std::ops::Range;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Tuning knobs for a [`HighlightScheduler`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HighlightConfig {
    parallel: bool,
    parallel_min_lines: usize,
}

impl Default for HighlightConfig {
    fn default() -> Self {
        Self {
            parallel: true,
            parallel_min_lines: 64,
        }
    }
}

impl HighlightConfig {
    /// Enable or disable the line-parallel full highlight.
    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    /// Documents with fewer lines are highlighted sequentially.
    pub fn with_parallel_min_lines(mut self, lines: usize) -> Self {
        self.parallel_min_lines = lines;
        self
    }

    /// Returns whether full highlights may fan out over lines.
    pub fn parallel(&self) -> bool {
        self.parallel
    }

    /// Minimum line count for a parallel full highlight.
    pub fn parallel_min_lines(&self) -> usize {
        self.parallel_min_lines
    }
}

/// A finished background re-tokenization.
struct Completion {
    generation: u64,
    range: Range<usize>,
    nodes: Vec<SyntaxNode>,
}

type CompletionCallback = Arc<dyn Fn() + Send + Sync>;

/// Per-document highlighting state.
///
/// Owns the document's [`SyntaxTree`] and keeps it current: [`highlight_all`] tokenizes
/// the whole snapshot, [`edit`] updates the cached ranges immediately and re-tokenizes
/// the dirty region on the rayon pool. Results come back over a channel and are applied
/// by [`poll`] or [`wait`] on the owning thread; a result computed for an older
/// generation is dropped.
///
/// [`highlight_all`]: Self::highlight_all
/// [`edit`]: Self::edit
/// [`poll`]: Self::poll
/// [`wait`]: Self::wait
pub struct HighlightScheduler {
    tokenizer: Arc<GrammarTokenizer>,
    config: HighlightConfig,
    tree: Option<SyntaxTree>,
    /// Dirty span (new-text offsets) not yet re-tokenized.
    pending: Option<Range<usize>>,
    generation: Generation,
    tx: Sender<Completion>,
    rx: Receiver<Completion>,
    notify: Option<CompletionCallback>,
}

impl std::fmt::Debug for HighlightScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HighlightScheduler")
            .field("tokenizer", &self.tokenizer)
            .field("config", &self.config)
            .field("nodes", &self.tree.as_ref().map(SyntaxTree::len))
            .field("pending", &self.pending)
            .field("generation", &self.generation.current())
            .finish_non_exhaustive()
    }
}

impl HighlightScheduler {
    /// Create a scheduler for one document using `tokenizer`.
    pub fn new(tokenizer: Arc<GrammarTokenizer>) -> Self {
        tokenizer.preload();
        let (tx, rx) = unbounded();
        Self {
            tokenizer,
            config: HighlightConfig::default(),
            tree: None,
            pending: None,
            generation: Generation::new(),
            tx,
            rx,
            notify: None,
        }
    }

    /// Replace the configuration.
    pub fn with_config(mut self, config: HighlightConfig) -> Self {
        self.config = config;
        self
    }

    /// Call `callback` from the worker thread whenever a background result is ready.
    pub fn with_completion_callback(mut self, callback: Arc<dyn Fn() + Send + Sync>) -> Self {
        self.notify = Some(callback);
        self
    }

    /// Get the tokenizer in use.
    pub fn tokenizer(&self) -> &Arc<GrammarTokenizer> {
        &self.tokenizer
    }

    /// Get the configuration.
    pub fn config(&self) -> &HighlightConfig {
        &self.config
    }

    /// The cached tree, once the document has been highlighted.
    pub fn tree(&self) -> Option<&SyntaxTree> {
        self.tree.as_ref()
    }

    /// Returns `true` while a dirty region awaits re-tokenization.
    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// The current edit generation.
    pub fn generation(&self) -> u64 {
        self.generation.current()
    }

    /// Tokenize the whole snapshot, replacing the cache. Cancels any background work.
    pub fn highlight_all(&mut self, snapshot: &TextSnapshot) -> &SyntaxTree {
        self.generation.bump();
        let token = self.generation.token();
        let parallel =
            self.config.parallel && snapshot.line_count() >= self.config.parallel_min_lines;
        let nodes = self
            .tokenizer
            .tokenize_document(snapshot, &token, parallel)
            .unwrap_or_default();
        debug!(
            lines = snapshot.line_count(),
            parallel,
            nodes = nodes.len(),
            "full highlight"
        );
        self.pending = None;
        self.tree.insert(SyntaxTree::new(nodes))
    }

    /// Record an edit and re-tokenize the dirty region in the background.
    ///
    /// `snapshot` is the text after the edit. Cached ranges are shifted right away, so
    /// [`tree`](Self::tree) stays usable (minus the dirty region) until [`poll`](Self::poll)
    /// applies the result. Returns the dirty span.
    pub fn edit(&mut self, snapshot: &TextSnapshot, edit: TextEdit) -> Range<usize> {
        let (dirty, request) = self.prepare(snapshot, edit);
        let generation = request.token.generation();
        let tokenizer = self.tokenizer.clone();
        let snapshot = snapshot.clone();
        let tx = self.tx.clone();
        let notify = self.notify.clone();
        debug!(
            generation,
            ?dirty,
            restart = request.restart,
            "scheduled incremental highlight"
        );

        rayon::spawn(move || {
            let Some(pass) = request.run(&tokenizer, &snapshot) else {
                debug!(generation, "incremental highlight cancelled");
                return;
            };
            let completion = Completion {
                generation,
                range: request.restart..pass.end,
                nodes: pass.nodes,
            };
            if tx.send(completion).is_ok()
                && let Some(notify) = notify
            {
                notify();
            }
        });
        dirty
    }

    /// Like [`edit`](Self::edit), but re-tokenizes on the calling thread. Returns the
    /// re-tokenized range.
    pub fn edit_sync(&mut self, snapshot: &TextSnapshot, edit: TextEdit) -> Range<usize> {
        let (_, request) = self.prepare(snapshot, edit);
        match request.run(&self.tokenizer, snapshot) {
            Some(pass) => {
                let range = request.restart..pass.end;
                self.apply(range.clone(), pass.nodes);
                range
            }
            None => request.restart..request.restart,
        }
    }

    /// Apply every finished background result. Returns the range updated by the current
    /// generation's result, if it arrived.
    pub fn poll(&mut self) -> Option<Range<usize>> {
        let mut applied = None;
        while let Ok(completion) = self.rx.try_recv() {
            applied = self.accept(completion).or(applied);
        }
        applied
    }

    /// Block until the current generation's result is applied, or `timeout` elapses.
    pub fn wait(&mut self, timeout: Duration) -> Option<Range<usize>> {
        if !self.is_pending() {
            return None;
        }
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.rx.recv_timeout(remaining) {
                Ok(completion) => {
                    if let Some(range) = self.accept(completion) {
                        return Some(range);
                    }
                }
                Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => return None,
            }
        }
    }

    /// Scoped ranges of the cached tree overlapping `range`.
    pub fn scoped_ranges(&self, range: Range<usize>) -> Vec<ScopedRange> {
        self.tree
            .as_ref()
            .map(|tree| tree.scoped_ranges_in(range))
            .unwrap_or_default()
    }

    fn accept(&mut self, completion: Completion) -> Option<Range<usize>> {
        if completion.generation != self.generation.current() {
            debug!(
                generation = completion.generation,
                current = self.generation.current(),
                "discarding stale highlight result"
            );
            return None;
        }
        self.apply(completion.range.clone(), completion.nodes);
        Some(completion.range)
    }

    fn apply(&mut self, range: Range<usize>, nodes: Vec<SyntaxNode>) {
        self.tree
            .get_or_insert_with(SyntaxTree::default)
            .replace(range, nodes);
        self.pending = None;
    }

    /// Update the cache for `edit`, widen the pending dirty span, and work out where
    /// re-tokenization starts and may stop.
    fn prepare(
        &mut self,
        snapshot: &TextSnapshot,
        edit: TextEdit,
    ) -> (Range<usize>, RegionRequest) {
        self.generation.bump();
        let len = snapshot.len();

        let dirty = match self.tree.as_mut() {
            Some(tree) => tree.apply_edit(&edit),
            None => 0..len,
        };
        let tree = self.tree.get_or_insert_with(SyntaxTree::default);
        let mut pending = match self.pending.take() {
            Some(old) => {
                let start = dirty.start.min(edit.map_position(old.start));
                start..dirty.end.max(edit.map_position(old.end))
            }
            None => dirty.clone(),
        };
        pending.end = pending.end.min(len);
        pending.start = pending.start.min(pending.end);

        // Matches on the dirty line may look ahead into the edit, and a region reaching
        // into the line moves the start back to where it opened. A region ending right at
        // the dirty line's start may have ended because of that line (`while`), so it goes
        // too; lines further up only ever looked at unchanged text.
        let mut reach = snapshot.line_start(pending.start).saturating_sub(1);
        let restart = loop {
            let line_start = snapshot.line_start(pending.start);
            match tree.remove_overlapping(reach.min(line_start)..pending.start) {
                Some(span) if span.start < line_start => pending.start = span.start,
                _ => break line_start,
            }
            reach = usize::MAX;
        };
        // The `\n` before a sync point must be unedited text, so the old walk was at
        // rest there with the same left context.
        let min_sync = snapshot.line_end(pending.end);
        let kept = tree.spans_from(restart);
        self.pending = Some(pending);

        let request = RegionRequest {
            restart,
            min_sync,
            kept,
            token: self.generation.token(),
        };
        (dirty, request)
    }
}

/// Inputs for one incremental re-tokenization, detached from the scheduler.
struct RegionRequest {
    restart: usize,
    min_sync: usize,
    kept: Vec<Range<usize>>,
    token: CancellationToken,
}

impl RegionRequest {
    fn run(
        &self,
        tokenizer: &Arc<GrammarTokenizer>,
        snapshot: &TextSnapshot,
    ) -> Option<RegionPass> {
        tokenizer.tokenize_region(
            snapshot,
            self.restart,
            self.min_sync,
            &self.kept,
            &self.token,
        )
    }
}
