use serde::Deserialize;
use std::fmt;
use std::sync::Arc;

/// A dot-separated scope identifier such as `string.quoted.double.json`.
///
/// Cloning is cheap; scopes are shared between the compiled grammar and every node that
/// carries them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
#[serde(from = "String")]
pub struct SyntaxScope(Arc<str>);

impl SyntaxScope {
    /// Create a scope from its textual form.
    pub fn new(scope: impl Into<Arc<str>>) -> Self {
        Self(scope.into())
    }

    /// The textual form of the scope.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns `true` if `other` is this scope or a dotted refinement of it.
    ///
    /// `string.quoted` contains `string.quoted` and `string.quoted.double`, but not
    /// `string.quotedx`.
    pub fn contains(&self, other: &SyntaxScope) -> bool {
        let (outer, inner) = (self.as_str(), other.as_str());
        match inner.strip_prefix(outer) {
            Some("") => true,
            Some(rest) => !outer.is_empty() && rest.starts_with('.'),
            None => false,
        }
    }

    /// Iterate over the dot-separated segments.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('.')
    }
}

impl fmt::Display for SyntaxScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SyntaxScope {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for SyntaxScope {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl AsRef<str> for SyntaxScope {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

/// Maps scope selectors to caller-defined styles using longest-prefix matching.
///
/// This is the lookup a theme/render collaborator performs over the engine's
/// `(range, scope)` output: the most specific selector that contains the scope wins.
#[derive(Debug, Clone)]
pub struct ScopeStyleMap<T> {
    entries: Vec<(SyntaxScope, T)>,
}

impl<T> Default for ScopeStyleMap<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<T> ScopeStyleMap<T> {
    /// Create an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Associate a style with a scope selector, replacing any previous style for it.
    pub fn insert(&mut self, selector: impl Into<SyntaxScope>, style: T) {
        let selector = selector.into();
        match self.entries.iter_mut().find(|(s, _)| *s == selector) {
            Some(entry) => entry.1 = style,
            None => self.entries.push((selector, style)),
        }
    }

    /// Number of selectors in the map.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if the map has no selectors.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Resolve the style for a scope: the longest selector containing it.
    pub fn resolve(&self, scope: &SyntaxScope) -> Option<&T> {
        self.entries
            .iter()
            .filter(|(selector, _)| selector.contains(scope))
            .max_by_key(|(selector, _)| selector.as_str().len())
            .map(|(_, style)| style)
    }

    /// Resolve the style for a stack of nested scopes (outermost first).
    ///
    /// Inner scopes take precedence; the first inner-to-outer scope that has a matching
    /// selector decides the style.
    pub fn resolve_stack<'a>(
        &self,
        scopes: impl DoubleEndedIterator<Item = &'a SyntaxScope>,
    ) -> Option<&T> {
        scopes.rev().find_map(|scope| self.resolve(scope))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contains_respects_segment_boundaries() {
        let string = SyntaxScope::from("string.quoted");
        assert!(string.contains(&"string.quoted".into()));
        assert!(string.contains(&"string.quoted.double.json".into()));
        assert!(!string.contains(&"string.quotedx".into()));
        assert!(!string.contains(&"string".into()));
        assert!(!SyntaxScope::from("").contains(&"string".into()));
    }

    #[test]
    fn test_longest_selector_wins() {
        let mut map = ScopeStyleMap::new();
        map.insert("string", 1);
        map.insert("string.quoted.double", 2);
        map.insert("comment", 3);

        assert_eq!(map.resolve(&"string.quoted.double.json".into()), Some(&2));
        assert_eq!(map.resolve(&"string.quoted.single".into()), Some(&1));
        assert_eq!(map.resolve(&"keyword".into()), None);

        map.insert("string", 4);
        assert_eq!(map.len(), 3);
        assert_eq!(map.resolve(&"string.unquoted".into()), Some(&4));
    }

    #[test]
    fn test_resolve_stack_prefers_inner_scope() {
        let mut map = ScopeStyleMap::new();
        map.insert("string", "green");
        map.insert("constant.character.escape", "orange");

        let stack = [
            SyntaxScope::from("string.quoted.double"),
            SyntaxScope::from("constant.character.escape.demo"),
        ];
        assert_eq!(map.resolve_stack(stack.iter()), Some(&"orange"));
        assert_eq!(map.resolve_stack(stack[..1].iter()), Some(&"green"));
    }
}
