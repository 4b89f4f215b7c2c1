use crate::textmate::compiler::{GrammarResolver, GrammarTokenizer};
use crate::textmate::error::GrammarError;
use crate::textmate::grammar::{Grammar, GrammarFormat};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

/// The set of grammars known to the process, keyed by scope name.
///
/// Grammars are registered (or loaded from disk) once, compiled into tokenizers on first
/// request, and cached until the entry is replaced, reloaded, or unregistered. Any
/// change invalidates every cached tokenizer, since cross-grammar includes may point at
/// the old entry.
#[derive(Debug)]
pub struct GrammarRegistry {
    this: Weak<GrammarRegistry>,
    inner: RwLock<RegistryInner>,
}

#[derive(Debug, Default)]
struct RegistryInner {
    grammars: HashMap<String, Arc<Grammar>>,
    sources: HashMap<String, PathBuf>,
    tokenizers: HashMap<String, Arc<GrammarTokenizer>>,
}

impl GrammarRegistry {
    /// Create an empty registry.
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            inner: RwLock::default(),
        })
    }

    /// Register (or replace) a grammar under its scope.
    pub fn register(&self, grammar: Grammar) -> Arc<Grammar> {
        let grammar = Arc::new(grammar);
        let scope = grammar.scope.to_string();
        let mut inner = self.inner.write();
        inner.sources.remove(&scope);
        inner.grammars.insert(scope.clone(), grammar.clone());
        inner.tokenizers.clear();
        debug!(scope = %scope, "registered grammar");
        grammar
    }

    /// Decode and register a grammar from source text.
    pub fn load_from_str(
        &self,
        source: &str,
        format: GrammarFormat,
    ) -> Result<Arc<Grammar>, GrammarError> {
        let grammar = Grammar::from_slice(source.as_bytes(), format)?;
        Ok(self.register(grammar))
    }

    /// Load and register a grammar file, remembering its path for [`reload`](Self::reload).
    pub fn load_from_path(&self, path: impl AsRef<Path>) -> Result<Arc<Grammar>, GrammarError> {
        let path = path.as_ref();
        let grammar = self.register(Grammar::load(path)?);
        self.inner
            .write()
            .sources
            .insert(grammar.scope.to_string(), path.to_path_buf());
        Ok(grammar)
    }

    /// Like [`load_from_path`](Self::load_from_path), but a grammar that fails to load is
    /// logged and skipped; the file is then treated as plain text.
    pub fn try_load_path(&self, path: impl AsRef<Path>) -> Option<Arc<Grammar>> {
        let path = path.as_ref();
        match self.load_from_path(path) {
            Ok(grammar) => Some(grammar),
            Err(err) => {
                warn!(path = %path.display(), %err, "failed to load grammar");
                None
            }
        }
    }

    /// Load every grammar file in `dir` with a recognized extension. Returns how many loaded.
    pub fn load_dir(&self, dir: impl AsRef<Path>) -> Result<usize, GrammarError> {
        let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.is_file() && GrammarFormat::from_path(path).is_some())
            .collect();
        paths.sort();
        Ok(paths
            .iter()
            .filter(|path| self.try_load_path(path).is_some())
            .count())
    }

    /// Re-read a grammar registered with [`load_from_path`](Self::load_from_path).
    pub fn reload(&self, scope: &str) -> Result<Arc<Grammar>, GrammarError> {
        let path = self
            .inner
            .read()
            .sources
            .get(scope)
            .cloned()
            .ok_or_else(|| GrammarError::UnknownScope(scope.to_string()))?;
        self.load_from_path(path)
    }

    /// Remove a grammar. Returns the removed entry.
    pub fn unregister(&self, scope: &str) -> Option<Arc<Grammar>> {
        let mut inner = self.inner.write();
        inner.sources.remove(scope);
        let removed = inner.grammars.remove(scope);
        if removed.is_some() {
            inner.tokenizers.clear();
        }
        removed
    }

    /// Registered scope names, sorted.
    pub fn scopes(&self) -> Vec<String> {
        let mut scopes: Vec<_> = self.inner.read().grammars.keys().cloned().collect();
        scopes.sort();
        scopes
    }

    /// The grammar registered for `scope`.
    pub fn grammar(&self, scope: &str) -> Option<Arc<Grammar>> {
        self.inner.read().grammars.get(scope).cloned()
    }

    /// The tokenizer for `scope`, compiled on first request and cached.
    pub fn tokenizer(&self, scope: &str) -> Option<Arc<GrammarTokenizer>> {
        let grammar = {
            let inner = self.inner.read();
            if let Some(tokenizer) = inner.tokenizers.get(scope) {
                return Some(tokenizer.clone());
            }
            inner.grammars.get(scope)?.clone()
        };

        let resolver: Weak<dyn GrammarResolver> = self.this.clone();
        let built = GrammarTokenizer::with_resolver(grammar, resolver);

        let mut inner = self.inner.write();
        let current = inner.grammars.get(scope)?;
        if !Arc::ptr_eq(current, built.grammar()) {
            // Replaced while compiling; hand out the tokenizer without caching it.
            return Some(built);
        }
        Some(
            inner
                .tokenizers
                .entry(scope.to_string())
                .or_insert(built)
                .clone(),
        )
    }

    /// The grammar whose `fileTypes` best match `file_name` (longest matching entry).
    pub fn grammar_for_file_name(&self, file_name: &str) -> Option<Arc<Grammar>> {
        let inner = self.inner.read();
        let mut best: Option<(usize, &Arc<Grammar>)> = None;
        for grammar in inner.grammars.values() {
            let Some(len) = grammar.file_type_match_len(file_name) else {
                continue;
            };
            let better = best.is_none_or(|(best_len, current)| {
                len > best_len || (len == best_len && grammar.scope < current.scope)
            });
            if better {
                best = Some((len, grammar));
            }
        }
        best.map(|(_, grammar)| grammar.clone())
    }

    /// The grammar for a file path, by file name.
    pub fn grammar_for_path(&self, path: impl AsRef<Path>) -> Option<Arc<Grammar>> {
        let file_name = path.as_ref().file_name()?.to_str()?;
        self.grammar_for_file_name(file_name)
    }

    /// The first grammar (by scope name) whose `firstLineMatch` matches `line`.
    pub fn grammar_for_first_line(&self, line: &str) -> Option<Arc<Grammar>> {
        let inner = self.inner.read();
        let mut candidates: Vec<&Arc<Grammar>> = inner
            .grammars
            .values()
            .filter(|g| g.first_line_match.is_some())
            .collect();
        candidates.sort_by(|a, b| a.scope.cmp(&b.scope));
        candidates
            .into_iter()
            .find(|g| g.matches_first_line(line))
            .cloned()
    }
}

impl GrammarResolver for GrammarRegistry {
    fn resolve_scope(&self, scope: &str) -> Option<Arc<GrammarTokenizer>> {
        self.tokenizer(scope)
    }
}
