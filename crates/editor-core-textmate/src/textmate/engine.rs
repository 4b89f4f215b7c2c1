use crate::textmate::cancel::CancellationToken;
use crate::textmate::compiler::{
    BeginEndNode, BeginWhileNode, CaptureRule, GrammarTokenizer, MatchNode, TokenizerNode,
};
use crate::textmate::regex::{CompiledRegex, RegexMatch};
use crate::textmate::scope::SyntaxScope;
use crate::textmate::text::TextSnapshot;
use crate::textmate::tree::{SyntaxNode, nest};
use rayon::prelude::*;
use std::cell::Cell;
use std::ops::Range;
use std::sync::Arc;
use tracing::trace;

/// Maximum nesting of regions and capture sub-tokenizations.
const MAX_DEPTH: usize = 256;

/// An open region on the current tokenize path.
struct RegionFrame<'a> {
    node: *const TokenizerNode,
    begin_at: usize,
    parent: Option<&'a RegionFrame<'a>>,
}

/// Offset a line task may not tokenize past.
///
/// Reaching it means a region opened on the line continues further, so the line task
/// stops and the merge re-walks the line sequentially.
struct Horizon {
    end: usize,
    overrun: Cell<bool>,
}

impl Horizon {
    fn new(end: usize) -> Self {
        Self {
            end,
            overrun: Cell::new(false),
        }
    }
}

/// Immutable view handed to every search/tokenize step; derived, never mutated.
#[derive(Clone)]
struct TokenizerContext<'a> {
    snapshot: &'a TextSnapshot,
    /// Where the search runs. Matches may not extend past `range.end`.
    range: Range<usize>,
    /// Matches must start strictly before this offset.
    upper_bound: Option<usize>,
    is_first_line: bool,
    /// Offset where `\G` may match.
    anchor: Option<usize>,
    /// End of the text visible to this step (document end, or a capture's end).
    bound: usize,
    depth: usize,
    /// The grammar that started the tokenization; answers `$base`.
    base: &'a Arc<GrammarTokenizer>,
    cancel: &'a CancellationToken,
    horizon: Option<&'a Horizon>,
    frame: Option<&'a RegionFrame<'a>>,
}

impl<'a> TokenizerContext<'a> {
    fn text(&self) -> &'a str {
        self.snapshot.as_str()
    }

    /// Whether work continuing at `pos` must stop: cancelled, or past the horizon.
    fn should_stop(&self, pos: usize) -> bool {
        if self.cancel.is_cancelled() {
            return true;
        }
        match self.horizon {
            Some(horizon) if pos >= horizon.end => {
                horizon.overrun.set(true);
                true
            }
            _ => false,
        }
    }

    /// The same context, searching from `pos`.
    fn at(&self, pos: usize) -> Self {
        Self {
            range: pos..self.bound,
            ..self.clone()
        }
    }

    /// A context confined to one capture group.
    fn capture(&self, range: Range<usize>) -> Self {
        Self {
            range: range.clone(),
            upper_bound: None,
            anchor: Some(range.start),
            bound: range.end,
            depth: self.depth + 1,
            ..self.clone()
        }
    }

    fn search(&self, regex: &CompiledRegex) -> Option<RegexMatch> {
        let allow_g = self.anchor == Some(self.range.start);
        let found = regex.search(self.text(), self.range.clone(), self.is_first_line, allow_g)?;
        match self.upper_bound {
            Some(bound) if found.start() >= bound => None,
            _ => Some(found),
        }
    }

    /// Whether a region rule may open at `begin`.
    fn may_open(&self, node: &Arc<TokenizerNode>, begin: &RegexMatch) -> bool {
        if self.depth >= MAX_DEPTH {
            trace!(at = begin.start(), "region nesting limit reached");
            return false;
        }
        if !begin.range().is_empty() {
            return true;
        }
        let key = Arc::as_ptr(node);
        let mut frame = self.frame;
        while let Some(f) = frame {
            if f.node == key && f.begin_at == begin.start() {
                return false;
            }
            frame = f.parent;
        }
        true
    }
}

/// A rule that matched during search, not yet expanded.
struct Candidate<'a> {
    node: Arc<TokenizerNode>,
    matched: RegexMatch,
    ctx: TokenizerContext<'a>,
    /// Tokenizer owning `node` when it was reached through another grammar.
    owner: Option<Arc<GrammarTokenizer>>,
}

struct TokenizerResult {
    nodes: Vec<SyntaxNode>,
    /// Offset after everything the match consumed.
    end: usize,
}

/// Output of a walk over a pattern list.
struct Pass {
    nodes: Vec<SyntaxNode>,
    /// Furthest offset consumed by any match.
    furthest: usize,
}

/// Output of an incremental re-tokenization.
#[derive(Debug)]
pub(crate) struct RegionPass {
    pub(crate) nodes: Vec<SyntaxNode>,
    /// Where the walk resynchronized with the cached tree (or the document end).
    pub(crate) end: usize,
}

fn search_node<'a>(
    node: &Arc<TokenizerNode>,
    ctx: &TokenizerContext<'a>,
    path: &mut Vec<*const TokenizerNode>,
) -> Option<Candidate<'a>> {
    let candidate = |matched| Candidate {
        node: node.clone(),
        matched,
        ctx: ctx.clone(),
        owner: None,
    };

    match &**node {
        TokenizerNode::Include(include) => {
            let (target, owner) = include.target(ctx.base)?;
            let mut found = enter(node, path, |path| search_node(&target, ctx, path))?;
            if found.owner.is_none() {
                found.owner = owner;
            }
            Some(found)
        }
        TokenizerNode::Group(group) => enter(node, path, |path| search_list(&group.patterns, ctx, path)),
        TokenizerNode::Match(rule) => ctx.search(&rule.regex).map(candidate),
        TokenizerNode::BeginEnd(rule) => {
            let begin = ctx.search(&rule.begin)?;
            ctx.may_open(node, &begin).then(|| candidate(begin))
        }
        TokenizerNode::BeginWhile(rule) => {
            let begin = ctx.search(&rule.begin)?;
            ctx.may_open(node, &begin).then(|| candidate(begin))
        }
    }
}

/// Run `f` with `node` on the search path, unless it is already there.
fn enter<'a>(
    node: &Arc<TokenizerNode>,
    path: &mut Vec<*const TokenizerNode>,
    f: impl FnOnce(&mut Vec<*const TokenizerNode>) -> Option<Candidate<'a>>,
) -> Option<Candidate<'a>> {
    let key = Arc::as_ptr(node);
    if path.contains(&key) {
        return None;
    }
    path.push(key);
    let found = f(path);
    path.pop();
    found
}

/// Earliest match among `patterns`; ties go to the first declared.
fn search_list<'a>(
    patterns: &[Arc<TokenizerNode>],
    ctx: &TokenizerContext<'a>,
    path: &mut Vec<*const TokenizerNode>,
) -> Option<Candidate<'a>> {
    if ctx.cancel.is_cancelled() {
        return None;
    }
    let mut best: Option<Candidate<'a>> = None;
    for node in patterns {
        let Some(candidate) = search_node(node, ctx, path) else {
            continue;
        };
        let start = candidate.matched.start();
        if start == ctx.range.start {
            return Some(candidate);
        }
        if best.as_ref().is_none_or(|b| start < b.matched.start()) {
            best = Some(candidate);
        }
    }
    best
}

impl Candidate<'_> {
    fn tokenize(self) -> TokenizerResult {
        match &*self.node {
            TokenizerNode::Match(rule) => tokenize_match(rule, &self.matched, &self.ctx),
            TokenizerNode::BeginEnd(rule) => {
                tokenize_begin_end(&self.node, rule, &self.matched, &self.ctx)
            }
            TokenizerNode::BeginWhile(rule) => {
                tokenize_begin_while(&self.node, rule, &self.matched, &self.ctx)
            }
            // Search only ever yields leaf rules.
            TokenizerNode::Include(_) | TokenizerNode::Group(_) => TokenizerResult {
                nodes: Vec::new(),
                end: self.matched.end(),
            },
        }
    }
}

/// Wrap `children` in a scoped node, or pass them through when there is no scope.
fn scoped(
    range: Range<usize>,
    scope: Option<SyntaxScope>,
    children: Vec<SyntaxNode>,
) -> Vec<SyntaxNode> {
    match scope {
        Some(scope) if !range.is_empty() => vec![SyntaxNode::new(range, Some(scope), children)],
        _ => children,
    }
}

/// Tokenize `patterns` from `ctx.range.start` while the position is before `limit`.
///
/// Matches are searched line by line and must start before both `limit` and the end of
/// their line. With `top_level`, every non-empty match becomes exactly one node covering
/// everything it consumed.
fn walk(
    patterns: &[Arc<TokenizerNode>],
    ctx: &TokenizerContext<'_>,
    limit: usize,
    top_level: bool,
) -> Pass {
    let mut nodes = Vec::new();
    let mut pos = ctx.range.start;
    let mut furthest = pos;
    if ctx.depth > MAX_DEPTH {
        trace!(at = pos, "tokenize depth limit reached");
        return Pass { nodes, furthest };
    }

    let limit = limit.min(ctx.bound);
    let first_line_end = ctx.snapshot.line_end(pos);
    while pos < limit {
        if ctx.should_stop(pos) {
            break;
        }
        let line_end = ctx.snapshot.line_end(pos).min(ctx.bound);
        let search = TokenizerContext {
            range: pos..line_end,
            upper_bound: Some(limit.min(line_end)),
            is_first_line: ctx.is_first_line && pos < first_line_end,
            ..ctx.clone()
        };
        let Some(candidate) = search_list(patterns, &search, &mut Vec::new()) else {
            pos = line_end;
            continue;
        };

        let start = candidate.matched.start();
        let result = candidate.tokenize();
        furthest = furthest.max(result.end);
        if top_level {
            push_top_level(&mut nodes, start..result.end, result.nodes);
        } else {
            nodes.extend(result.nodes);
        }
        pos = if result.end > pos {
            result.end
        } else {
            ctx.snapshot.next_char_boundary(pos)
        };
    }

    Pass { nodes, furthest }
}

fn push_top_level(forest: &mut Vec<SyntaxNode>, span: Range<usize>, mut nodes: Vec<SyntaxNode>) {
    if span.is_empty() {
        return;
    }
    let exact = nodes.len() == 1 && nodes[0].range == span && nodes[0].scope.is_some();
    match nodes.pop() {
        Some(node) if exact => forest.push(node),
        Some(node) => {
            nodes.push(node);
            forest.push(SyntaxNode::new(span, None, nodes));
        }
        None => forest.push(SyntaxNode::new(span, None, Vec::new())),
    }
}

fn captures(
    rules: &[CaptureRule],
    regex: &CompiledRegex,
    matched: &RegexMatch,
    ctx: &TokenizerContext<'_>,
) -> Vec<SyntaxNode> {
    let mut groups = Vec::new();
    for rule in rules {
        for &index in rule.indices(regex).iter() {
            groups.push((index, rule));
        }
    }
    groups.sort_by_key(|(index, _)| *index);

    let mut forest = Vec::new();
    for (index, rule) in groups {
        let Some(range) = matched.group(index).filter(|r| !r.is_empty()) else {
            continue;
        };
        let children = if rule.patterns.is_empty() {
            Vec::new()
        } else {
            walk(&rule.patterns, &ctx.capture(range.clone()), range.end, false).nodes
        };
        let scope = rule
            .name
            .as_ref()
            .and_then(|name| name.resolve(ctx.text(), matched));
        for node in scoped(range, scope, children) {
            nest(&mut forest, node);
        }
    }
    forest
}

fn tokenize_match(
    rule: &MatchNode,
    matched: &RegexMatch,
    ctx: &TokenizerContext<'_>,
) -> TokenizerResult {
    let range = matched.range();
    let children = captures(&rule.captures, &rule.regex, matched, ctx);
    let scope = rule
        .name
        .as_ref()
        .and_then(|name| name.resolve(ctx.text(), matched));
    TokenizerResult {
        nodes: scoped(range.clone(), scope, children),
        end: range.end,
    }
}

/// First match of an `end` regex at or after `from`, scanning line by line.
fn find_end(
    regex: &CompiledRegex,
    ctx: &TokenizerContext<'_>,
    from: usize,
    anchor: usize,
) -> Option<RegexMatch> {
    let first_line_end = ctx.snapshot.line_end(from);
    let mut pos = from;
    loop {
        let line_end = ctx.snapshot.line_end(pos).min(ctx.bound);
        let search = TokenizerContext {
            range: pos..line_end,
            upper_bound: None,
            is_first_line: ctx.is_first_line && pos < first_line_end,
            anchor: Some(anchor),
            ..ctx.clone()
        };
        if let Some(found) = search.search(regex)
            && (found.start() < line_end || line_end == ctx.bound)
        {
            return Some(found);
        }
        if line_end >= ctx.bound || ctx.should_stop(line_end) {
            return None;
        }
        pos = line_end;
    }
}

fn tokenize_begin_end(
    node: &Arc<TokenizerNode>,
    rule: &BeginEndNode,
    begin: &RegexMatch,
    ctx: &TokenizerContext<'_>,
) -> TokenizerResult {
    let text = ctx.text();
    let start = begin.start();
    let content_start = begin.end();
    let frame = RegionFrame {
        node: Arc::as_ptr(node),
        begin_at: start,
        parent: ctx.frame,
    };
    let inner = TokenizerContext {
        anchor: Some(content_start),
        depth: ctx.depth + 1,
        frame: Some(&frame),
        ..ctx.clone()
    };

    let mut nodes = captures(&rule.begin_captures, &rule.begin, begin, ctx);
    let end_regex = rule.end.resolve(text, begin);

    let mut content = Vec::new();
    let mut pos = content_start;
    let end = loop {
        let end = end_regex
            .as_deref()
            .and_then(|regex| find_end(regex, &inner, pos, content_start));
        let limit = match &end {
            Some(found) => found.start() + usize::from(rule.apply_end_pattern_last),
            None => ctx.bound,
        };
        let pass = walk(&rule.patterns, &inner.at(pos), limit, false);
        content.extend(pass.nodes);
        match end {
            // Content ran past the end match; look for `end` again after it.
            Some(found) if pass.furthest > found.start() && !ctx.should_stop(pass.furthest) => {
                pos = pass.furthest;
            }
            end => break end,
        }
    };

    let (content_end, region_end) = match &end {
        Some(found) => (found.start(), found.end()),
        None => (ctx.bound, ctx.bound),
    };
    let content_scope = rule
        .content_name
        .as_ref()
        .and_then(|name| name.resolve(text, begin));
    nodes.extend(scoped(content_start..content_end, content_scope, content));

    if let (Some(found), Some(regex)) = (&end, end_regex.as_deref()) {
        nodes.extend(captures(&rule.end_captures, regex, found, ctx));
    }

    let scope = rule.name.as_ref().and_then(|name| name.resolve(text, begin));
    TokenizerResult {
        nodes: scoped(start..region_end, scope, nodes),
        end: region_end,
    }
}

fn tokenize_begin_while(
    node: &Arc<TokenizerNode>,
    rule: &BeginWhileNode,
    begin: &RegexMatch,
    ctx: &TokenizerContext<'_>,
) -> TokenizerResult {
    let text = ctx.text();
    let snapshot = ctx.snapshot;
    let start = begin.start();
    let content_start = begin.end();
    let frame = RegionFrame {
        node: Arc::as_ptr(node),
        begin_at: start,
        parent: ctx.frame,
    };
    let inner = TokenizerContext {
        depth: ctx.depth + 1,
        frame: Some(&frame),
        ..ctx.clone()
    };

    let mut nodes = captures(&rule.begin_captures, &rule.begin, begin, ctx);
    let while_regex = rule.while_regex.resolve(text, begin);

    let mut content = Vec::new();
    let mut pos = content_start;
    let mut anchor = content_start;
    let mut line_end = snapshot.line_end(start).min(ctx.bound);
    let region_end = loop {
        let pass = walk(
            &rule.patterns,
            &TokenizerContext {
                anchor: Some(anchor),
                ..inner.at(pos)
            },
            line_end,
            false,
        );
        content.extend(pass.nodes);

        let reached = pass.furthest.max(line_end);
        if reached >= ctx.bound || ctx.should_stop(reached) {
            break reached.min(ctx.bound);
        }
        if !snapshot.is_line_start(reached) {
            // A nested region ended mid-line; the rest of that line is still content.
            pos = reached;
            anchor = reached;
            line_end = snapshot.line_end(reached).min(ctx.bound);
            continue;
        }

        let Some(regex) = while_regex.as_deref() else {
            break reached;
        };
        let next_line = reached..snapshot.line_end(reached).min(ctx.bound);
        let check = TokenizerContext {
            range: next_line.clone(),
            upper_bound: None,
            is_first_line: false,
            anchor: Some(next_line.start),
            ..inner.clone()
        };
        let Some(found) = check.search(regex) else {
            break reached;
        };
        content.extend(captures(&rule.while_captures, regex, &found, &inner));
        pos = found.end();
        anchor = found.end();
        line_end = next_line.end;
    };

    let content_scope = rule
        .content_name
        .as_ref()
        .and_then(|name| name.resolve(text, begin));
    nodes.extend(scoped(content_start..region_end, content_scope, content));

    let scope = rule.name.as_ref().and_then(|name| name.resolve(text, begin));
    TokenizerResult {
        nodes: scoped(start..region_end, scope, nodes),
        end: region_end,
    }
}

/// Returns `true` if a cached span strictly crosses `offset`.
fn crosses(spans: &[Range<usize>], offset: usize) -> bool {
    let index = spans.partition_point(|span| span.end <= offset);
    spans.get(index).is_some_and(|span| span.start < offset)
}

impl GrammarTokenizer {
    fn root_patterns(&self) -> &[Arc<TokenizerNode>] {
        match &**self.root() {
            TokenizerNode::Group(group) => &group.patterns,
            _ => &[],
        }
    }

    fn walk_top_level(
        self: &Arc<Self>,
        snapshot: &TextSnapshot,
        cancel: &CancellationToken,
        from: usize,
        limit: usize,
        horizon: Option<&Horizon>,
    ) -> Pass {
        let ctx = TokenizerContext {
            snapshot,
            range: from..snapshot.len(),
            upper_bound: None,
            is_first_line: snapshot.line_of(from) == 0,
            anchor: None,
            bound: snapshot.len(),
            depth: 0,
            base: self,
            cancel,
            horizon,
            frame: None,
        };
        walk(self.root_patterns(), &ctx, limit, true)
    }

    /// Tokenize a whole document.
    ///
    /// With `parallel`, lines are tokenized independently on the rayon pool, each task
    /// stopping at its line end, and merged in line order. A line whose region runs past
    /// its end is re-walked sequentially, and a line reached by an earlier line's region
    /// is resumed from where that region ended, so the result equals the sequential walk.
    /// Returns `None` if `cancel` fires.
    pub fn tokenize_document(
        self: &Arc<Self>,
        snapshot: &TextSnapshot,
        cancel: &CancellationToken,
        parallel: bool,
    ) -> Option<Vec<SyntaxNode>> {
        if !parallel {
            let pass = self.walk_top_level(snapshot, cancel, 0, snapshot.len(), None);
            return (!cancel.is_cancelled()).then_some(pass.nodes);
        }

        let lines: Vec<(Pass, bool)> = (0..snapshot.line_count())
            .into_par_iter()
            .map(|line| {
                let range = snapshot.line_range(line);
                let horizon = Horizon::new(range.end);
                let pass =
                    self.walk_top_level(snapshot, cancel, range.start, range.end, Some(&horizon));
                (pass, horizon.overrun.get())
            })
            .collect();

        let mut nodes = Vec::new();
        let mut frontier = 0;
        for (line, (pass, overrun)) in lines.into_iter().enumerate() {
            if cancel.is_cancelled() {
                return None;
            }
            let range = snapshot.line_range(line);
            if range.start >= frontier && !overrun {
                nodes.extend(pass.nodes);
                frontier = pass.furthest.max(range.end);
                continue;
            }
            let from = frontier.max(range.start);
            if from < range.end {
                trace!(line, from, overrun, "re-walking line sequentially");
                let resumed = self.walk_top_level(snapshot, cancel, from, range.end, None);
                nodes.extend(resumed.nodes);
                frontier = resumed.furthest.max(range.end);
            }
        }
        (!cancel.is_cancelled()).then_some(nodes)
    }

    /// Tokenize a string sequentially.
    pub fn tokenize_str(self: &Arc<Self>, text: &str) -> Vec<SyntaxNode> {
        let snapshot = TextSnapshot::new(text);
        self.tokenize_document(&snapshot, &CancellationToken::never(), false)
            .unwrap_or_default()
    }

    /// Re-tokenize from `restart` until the walk resynchronizes with the cached tree.
    ///
    /// `kept` are the spans of cached top-level nodes (sorted). The walk stops at the
    /// first line start at or after `min_sync` that no new node and no kept span crosses.
    pub(crate) fn tokenize_region(
        self: &Arc<Self>,
        snapshot: &TextSnapshot,
        restart: usize,
        min_sync: usize,
        kept: &[Range<usize>],
        cancel: &CancellationToken,
    ) -> Option<RegionPass> {
        let mut nodes = Vec::new();
        let mut pos = restart;
        while pos < snapshot.len() {
            if cancel.is_cancelled() {
                return None;
            }
            let line_end = snapshot.line_end(pos);
            let pass = self.walk_top_level(snapshot, cancel, pos, line_end, None);
            nodes.extend(pass.nodes);
            pos = pass.furthest.max(line_end);
            if pos >= min_sync && snapshot.is_line_start(pos) && !crosses(kept, pos) {
                break;
            }
        }
        if cancel.is_cancelled() {
            return None;
        }
        Some(RegionPass {
            nodes,
            end: pos.min(snapshot.len()),
        })
    }
}
