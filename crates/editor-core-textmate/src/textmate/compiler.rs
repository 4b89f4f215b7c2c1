use crate::textmate::definition::{CaptureKey, Captures, GrammarRef, Pattern};
use crate::textmate::grammar::Grammar;
use crate::textmate::regex::{
    CompiledRegex, RegexMatch, has_back_references, substitute_back_references,
};
use crate::textmate::scope::SyntaxScope;
use parking_lot::RwLock;
use std::borrow::Cow;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, LazyLock, OnceLock, Weak};
use tracing::{debug, trace};

/// Resolves grammars referenced by scope name (`include: source.css`).
///
/// Implemented by [`GrammarRegistry`](crate::textmate::GrammarRegistry).
pub trait GrammarResolver: Send + Sync {
    /// Return the tokenizer for `scope`, building it if needed.
    fn resolve_scope(&self, scope: &str) -> Option<Arc<GrammarTokenizer>>;
}

/// The compiled, shareable runtime form of a [`Grammar`].
///
/// Rules are compiled eagerly, but `include` targets are looked up lazily on first use
/// and memoized, so self- and mutually-recursive rules build without recursion. One
/// tokenizer is shared read-only by every document using the grammar.
pub struct GrammarTokenizer {
    scope: SyntaxScope,
    grammar: Arc<Grammar>,
    root: Arc<TokenizerNode>,
    repositories: Vec<Repository>,
    resolver: Option<Weak<dyn GrammarResolver>>,
}

impl std::fmt::Debug for GrammarTokenizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GrammarTokenizer")
            .field("scope", &self.scope)
            .field("repositories", &self.repositories.len())
            .finish_non_exhaustive()
    }
}

/// One repository scope: a grammar's top-level repository, or the `repository` of a
/// nested rule. Lookups walk `parent` links outwards.
#[derive(Debug, Default)]
struct Repository {
    entries: HashMap<String, Arc<TokenizerNode>>,
    parent: Option<usize>,
}

#[derive(Debug)]
/// A compiled rule.
pub enum TokenizerNode {
    /// Lazily resolved `include`.
    Include(IncludeNode),
    /// Single regex match.
    Match(MatchNode),
    /// `begin`/`end` region.
    BeginEnd(BeginEndNode),
    /// `begin`/`while` region.
    BeginWhile(BeginWhileNode),
    /// List of alternatives.
    Group(GroupNode),
}

/// An `include` whose target is resolved on first use.
pub struct IncludeNode {
    reference: Option<GrammarRef>,
    repository: usize,
    owner: Weak<GrammarTokenizer>,
    target: OnceLock<Option<IncludeTarget>>,
}

/// Memoized include target.
enum IncludeTarget {
    /// A rule of the owning tokenizer.
    Local(Weak<TokenizerNode>),
    /// A rule of another grammar.
    Foreign(ForeignTarget),
}

/// Link to a rule of another grammar's tokenizer.
///
/// The registry owns that tokenizer and drops it whenever its grammar set changes, so
/// the link is looked up again through the resolver once the cached tokenizer is gone.
struct ForeignTarget {
    scope: String,
    key: Option<String>,
    resolver: Weak<dyn GrammarResolver>,
    cached: RwLock<Weak<GrammarTokenizer>>,
}

impl ForeignTarget {
    fn get(&self) -> Option<(Arc<TokenizerNode>, Arc<GrammarTokenizer>)> {
        let cached = self.cached.read().upgrade();
        let grammar = match cached {
            Some(grammar) => grammar,
            None => {
                let Some(grammar) = self
                    .resolver
                    .upgrade()
                    .and_then(|resolver| resolver.resolve_scope(&self.scope))
                else {
                    trace!(scope = %self.scope, "cross-grammar include target missing");
                    return None;
                };
                *self.cached.write() = Arc::downgrade(&grammar);
                grammar
            }
        };
        let node = match &self.key {
            Some(key) => grammar.repository_entry(key)?.clone(),
            None => grammar.root.clone(),
        };
        Some((node, grammar))
    }
}

impl std::fmt::Debug for IncludeNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IncludeNode")
            .field("reference", &self.reference)
            .field("resolved", &self.target.get().is_some())
            .finish()
    }
}

#[derive(Debug)]
/// Compiled `match` rule.
pub struct MatchNode {
    pub(crate) regex: CompiledRegex,
    pub(crate) name: Option<ScopeName>,
    pub(crate) captures: Vec<CaptureRule>,
}

#[derive(Debug)]
/// Compiled `begin`/`end` rule.
pub struct BeginEndNode {
    pub(crate) begin: CompiledRegex,
    pub(crate) end: DependentRegex,
    pub(crate) name: Option<ScopeName>,
    pub(crate) content_name: Option<ScopeName>,
    pub(crate) begin_captures: Vec<CaptureRule>,
    pub(crate) end_captures: Vec<CaptureRule>,
    pub(crate) patterns: Vec<Arc<TokenizerNode>>,
    pub(crate) apply_end_pattern_last: bool,
}

#[derive(Debug)]
/// Compiled `begin`/`while` rule.
pub struct BeginWhileNode {
    pub(crate) begin: CompiledRegex,
    pub(crate) while_regex: DependentRegex,
    pub(crate) name: Option<ScopeName>,
    pub(crate) content_name: Option<ScopeName>,
    pub(crate) begin_captures: Vec<CaptureRule>,
    pub(crate) while_captures: Vec<CaptureRule>,
    pub(crate) patterns: Vec<Arc<TokenizerNode>>,
}

#[derive(Debug)]
/// Compiled list of alternatives.
pub struct GroupNode {
    pub(crate) patterns: Vec<Arc<TokenizerNode>>,
}

#[derive(Debug)]
/// An `end`/`while` regex, which may refer back to groups of the `begin` match.
pub(crate) enum DependentRegex {
    Static(CompiledRegex),
    BackReferenced(String),
    Never,
}

impl DependentRegex {
    fn new(source: Option<&str>) -> Self {
        match source {
            None => Self::Never,
            Some(source) if has_back_references(source) => Self::BackReferenced(source.to_string()),
            Some(source) => Self::Static(CompiledRegex::new(source)),
        }
    }

    /// The regex to use for a region opened by `begin`.
    pub(crate) fn resolve(&self, text: &str, begin: &RegexMatch) -> Option<Cow<'_, CompiledRegex>> {
        match self {
            Self::Static(regex) => Some(Cow::Borrowed(regex)),
            Self::BackReferenced(source) => Some(Cow::Owned(CompiledRegex::new(
                &substitute_back_references(source, text, begin),
            ))),
            Self::Never => None,
        }
    }
}

#[derive(Debug)]
pub(crate) struct CaptureRule {
    pub(crate) key: CaptureKey,
    pub(crate) name: Option<ScopeName>,
    pub(crate) patterns: Vec<Arc<TokenizerNode>>,
}

impl CaptureRule {
    /// Group indices this rule applies to for a match of `regex`.
    pub(crate) fn indices<'a>(&'a self, regex: &'a CompiledRegex) -> Cow<'a, [usize]> {
        match &self.key {
            CaptureKey::Index(index) => Cow::Owned(vec![*index]),
            CaptureKey::Name(name) => Cow::Borrowed(regex.group_indices(name)),
        }
    }
}

static CAPTURE_REFERENCE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"\$(?:(\d+)|\{(\d+)(?::/(downcase|upcase))?\})")
        .expect("valid capture reference regex")
});

/// A `name`/`contentName` value, possibly interpolating capture text
/// (`$1`, `${1}`, `${1:/downcase}`, `${1:/upcase}`).
#[derive(Debug, Clone)]
pub(crate) enum ScopeName {
    Fixed(SyntaxScope),
    Template(String),
}

impl ScopeName {
    fn new(name: Option<&str>) -> Option<Self> {
        let name = name?.trim();
        if name.is_empty() {
            None
        } else if CAPTURE_REFERENCE.is_match(name) {
            Some(Self::Template(name.to_string()))
        } else {
            Some(Self::Fixed(SyntaxScope::from(name)))
        }
    }

    pub(crate) fn resolve(&self, text: &str, captured: &RegexMatch) -> Option<SyntaxScope> {
        let template = match self {
            Self::Fixed(scope) => return Some(scope.clone()),
            Self::Template(template) => template,
        };

        let resolved = CAPTURE_REFERENCE.replace_all(template, |caps: &regex::Captures<'_>| {
            let index = caps
                .get(1)
                .or_else(|| caps.get(2))
                .and_then(|m| m.as_str().parse::<usize>().ok());
            let value = index
                .and_then(|i| captured.group(i))
                .and_then(|r| text.get(r))
                .unwrap_or_default()
                .trim_start_matches('.');
            match caps.get(3).map(|m| m.as_str()) {
                Some("downcase") => value.to_lowercase(),
                Some("upcase") => value.to_uppercase(),
                _ => value.to_string(),
            }
        });

        let resolved = resolved.trim();
        (!resolved.is_empty()).then(|| SyntaxScope::from(resolved))
    }
}

impl GrammarTokenizer {
    /// Compile a grammar with no cross-grammar resolution; `include: other.scope` is inert.
    pub fn new(grammar: Arc<Grammar>) -> Arc<Self> {
        Self::build(grammar, None)
    }

    /// Compile a grammar whose cross-grammar includes resolve through `resolver`.
    pub fn with_resolver(grammar: Arc<Grammar>, resolver: Weak<dyn GrammarResolver>) -> Arc<Self> {
        Self::build(grammar, Some(resolver))
    }

    fn build(grammar: Arc<Grammar>, resolver: Option<Weak<dyn GrammarResolver>>) -> Arc<Self> {
        Arc::new_cyclic(|owner| {
            let mut builder = Builder {
                owner,
                repositories: Vec::new(),
            };
            let top = builder.repository(&grammar.repository, None);
            let patterns = builder.list(&grammar.patterns, top);
            Self {
                scope: grammar.scope.clone(),
                root: Arc::new(TokenizerNode::Group(GroupNode { patterns })),
                repositories: builder.repositories,
                grammar,
                resolver,
            }
        })
    }

    /// Root scope of the grammar.
    pub fn scope(&self) -> &SyntaxScope {
        &self.scope
    }

    /// The grammar this tokenizer was compiled from.
    pub fn grammar(&self) -> &Arc<Grammar> {
        &self.grammar
    }

    /// Root rule (the grammar's top-level pattern list).
    pub fn root(&self) -> &Arc<TokenizerNode> {
        &self.root
    }

    /// A rule from the grammar's top-level repository.
    pub fn repository_entry(&self, key: &str) -> Option<&Arc<TokenizerNode>> {
        self.lookup(0, key)
    }

    fn lookup(&self, mut repository: usize, key: &str) -> Option<&Arc<TokenizerNode>> {
        loop {
            let current = self.repositories.get(repository)?;
            if let Some(node) = current.entries.get(key) {
                return Some(node);
            }
            repository = current.parent?;
        }
    }

    /// Resolve every include reachable from this grammar now instead of on first use.
    ///
    /// `$base` includes are contextual and stay dynamic.
    pub fn preload(&self) {
        let mut visited = HashSet::new();
        let mut stack: Vec<&TokenizerNode> = vec![&self.root];
        stack.extend(self.repositories.iter().flat_map(|r| r.entries.values().map(|n| &**n)));

        while let Some(node) = stack.pop() {
            if !visited.insert(node as *const TokenizerNode) {
                continue;
            }
            match node {
                TokenizerNode::Include(include) => {
                    include.resolve_static();
                }
                TokenizerNode::Match(node) => {
                    stack.extend(capture_nodes(&node.captures));
                }
                TokenizerNode::BeginEnd(node) => {
                    stack.extend(node.patterns.iter().map(|n| &**n));
                    stack.extend(capture_nodes(&node.begin_captures));
                    stack.extend(capture_nodes(&node.end_captures));
                }
                TokenizerNode::BeginWhile(node) => {
                    stack.extend(node.patterns.iter().map(|n| &**n));
                    stack.extend(capture_nodes(&node.begin_captures));
                    stack.extend(capture_nodes(&node.while_captures));
                }
                TokenizerNode::Group(node) => {
                    stack.extend(node.patterns.iter().map(|n| &**n));
                }
            }
        }
    }
}

fn capture_nodes(rules: &[CaptureRule]) -> impl Iterator<Item = &TokenizerNode> {
    rules.iter().flat_map(|r| r.patterns.iter().map(|n| &**n))
}

impl IncludeNode {
    /// The rule this include delegates to. `base` is the grammar that started the
    /// current tokenization and answers `$base`.
    ///
    /// A rule from another grammar comes with that grammar's tokenizer, which must stay
    /// alive while the rule is in use.
    pub(crate) fn target(
        &self,
        base: &Arc<GrammarTokenizer>,
    ) -> Option<(Arc<TokenizerNode>, Option<Arc<GrammarTokenizer>>)> {
        match self.reference.as_ref()? {
            GrammarRef::Base => Some((base.root.clone(), None)),
            _ => match self.resolve_static()? {
                IncludeTarget::Local(node) => Some((node.upgrade()?, None)),
                IncludeTarget::Foreign(foreign) => {
                    let (node, grammar) = foreign.get()?;
                    Some((node, Some(grammar)))
                }
            },
        }
    }

    fn resolve_static(&self) -> Option<&IncludeTarget> {
        self.target.get_or_init(|| self.lookup()).as_ref()
    }

    fn lookup(&self) -> Option<IncludeTarget> {
        let owner = self.owner.upgrade()?;
        let found = match self.reference.as_ref()? {
            GrammarRef::Base => return None,
            GrammarRef::SelfRoot => Some(owner.root.clone()),
            GrammarRef::Local(key) => owner.lookup(self.repository, key).cloned(),
            GrammarRef::Global { scope, key } if scope.as_str() == owner.scope.as_str() => {
                match key {
                    Some(key) => owner.repository_entry(key).cloned(),
                    None => Some(owner.root.clone()),
                }
            }
            GrammarRef::Global { scope, key } => match &owner.resolver {
                Some(resolver) => {
                    return Some(IncludeTarget::Foreign(ForeignTarget {
                        scope: scope.clone(),
                        key: key.clone(),
                        resolver: resolver.clone(),
                        cached: RwLock::new(Weak::new()),
                    }));
                }
                None => None,
            },
        };
        if found.is_none() {
            debug!(scope = %owner.scope, reference = ?self.reference, "unresolved include is inert");
        }
        found.map(|node| IncludeTarget::Local(Arc::downgrade(&node)))
    }
}

struct Builder<'a> {
    owner: &'a Weak<GrammarTokenizer>,
    repositories: Vec<Repository>,
}

impl Builder<'_> {
    fn repository(&mut self, entries: &HashMap<String, Pattern>, parent: Option<usize>) -> usize {
        let id = self.repositories.len();
        self.repositories.push(Repository {
            entries: HashMap::new(),
            parent,
        });
        let built = entries
            .iter()
            .filter_map(|(key, pattern)| Some((key.clone(), self.node(pattern, id)?)))
            .collect();
        self.repositories[id].entries = built;
        id
    }

    fn nested(&mut self, entries: &HashMap<String, Pattern>, parent: usize) -> usize {
        if entries.is_empty() {
            parent
        } else {
            self.repository(entries, Some(parent))
        }
    }

    fn list(&mut self, patterns: &[Pattern], repository: usize) -> Vec<Arc<TokenizerNode>> {
        patterns
            .iter()
            .filter_map(|p| self.node(p, repository))
            .collect()
    }

    fn captures(&mut self, captures: &Captures, repository: usize) -> Vec<CaptureRule> {
        captures
            .iter()
            .map(|(key, capture)| CaptureRule {
                key: key.clone(),
                name: ScopeName::new(capture.name.as_deref()),
                patterns: self.list(&capture.patterns, repository),
            })
            .collect()
    }

    fn node(&mut self, pattern: &Pattern, repository: usize) -> Option<Arc<TokenizerNode>> {
        if pattern.is_disabled() {
            return None;
        }
        let node = match pattern {
            Pattern::Include(rule) => TokenizerNode::Include(IncludeNode {
                reference: rule.reference.clone(),
                repository,
                owner: self.owner.clone(),
                target: OnceLock::new(),
            }),
            Pattern::Match(rule) => TokenizerNode::Match(MatchNode {
                regex: CompiledRegex::new(&rule.regex),
                name: ScopeName::new(rule.name.as_deref()),
                captures: self.captures(&rule.captures, repository),
            }),
            Pattern::BeginEnd(rule) => {
                let scope = self.nested(&rule.repository, repository);
                TokenizerNode::BeginEnd(BeginEndNode {
                    begin: CompiledRegex::new(&rule.begin),
                    end: DependentRegex::new(rule.end.as_deref()),
                    name: ScopeName::new(rule.name.as_deref()),
                    content_name: ScopeName::new(rule.content_name.as_deref()),
                    begin_captures: self.captures(&rule.begin_captures, scope),
                    end_captures: self.captures(&rule.end_captures, scope),
                    patterns: self.list(&rule.patterns, scope),
                    apply_end_pattern_last: rule.apply_end_pattern_last,
                })
            }
            Pattern::BeginWhile(rule) => {
                let scope = self.nested(&rule.repository, repository);
                TokenizerNode::BeginWhile(BeginWhileNode {
                    begin: CompiledRegex::new(&rule.begin),
                    while_regex: DependentRegex::new(Some(&rule.while_regex)),
                    name: ScopeName::new(rule.name.as_deref()),
                    content_name: ScopeName::new(rule.content_name.as_deref()),
                    begin_captures: self.captures(&rule.begin_captures, scope),
                    while_captures: self.captures(&rule.while_captures, scope),
                    patterns: self.list(&rule.patterns, scope),
                })
            }
            Pattern::Group(rule) => {
                let scope = self.nested(&rule.repository, repository);
                TokenizerNode::Group(GroupNode {
                    patterns: self.list(&rule.patterns, scope),
                })
            }
        };
        Some(Arc::new(node))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn captured(text: &str, source: &str) -> RegexMatch {
        CompiledRegex::new(source)
            .search(text, 0..text.len(), true, true)
            .unwrap()
    }

    #[test]
    fn test_scope_name_interpolation() {
        let text = "Fn .Main";
        let m = captured(text, r"(\w+) (\S+)");

        let name = ScopeName::new(Some("entity.name.$2.${1:/downcase}")).unwrap();
        assert_eq!(
            name.resolve(text, &m),
            Some(SyntaxScope::from("entity.name.Main.fn"))
        );

        let upper = ScopeName::new(Some("keyword.${1:/upcase}")).unwrap();
        assert_eq!(upper.resolve(text, &m), Some(SyntaxScope::from("keyword.FN")));

        let missing = ScopeName::new(Some("$7")).unwrap();
        assert_eq!(missing.resolve(text, &m), None);
        assert!(ScopeName::new(Some("  ")).is_none());
    }
}
