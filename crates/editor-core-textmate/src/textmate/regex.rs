//! Oniguruma regex compilation with `\A`/`\G` anchor variants.
//!
//! `\A` must only match at the true document start and `\G` only where the current
//! search is anchored, but the same rule is searched from many call sites. Instead of
//! rewriting per search, each pattern is compiled up to four times (anchors on/off) and
//! the call site picks a variant with [`CompiledRegex::get`]. A disabled anchor is
//! rewritten to an escaped `U+FFFF`, which never matches real text.

use crate::textmate::error::GrammarError;
use onig::{Regex, RegexOptions, Region, SearchOptions, Syntax};
use std::collections::HashMap;
use std::ops::Range;
use std::sync::Arc;
use tracing::warn;

const DISABLED_ANCHOR: char = '\u{FFFF}';

/// A regex compiled into its anchor variants.
#[derive(Debug, Clone)]
pub struct CompiledRegex {
    source: Arc<str>,
    /// Indexed by `(allow_a << 1) | allow_g`.
    variants: [Option<Arc<Regex>>; 4],
    anchors: Anchors,
    group_names: Arc<HashMap<String, Vec<usize>>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Anchors {
    a: bool,
    g: bool,
}

impl CompiledRegex {
    /// Compile `source`. A variant that fails to compile is left inert and logged.
    pub fn new(source: &str) -> Self {
        Self::compile(source, |variant, err| {
            warn!(pattern = source, variant, %err, "regex failed to compile; rule is inert");
        })
    }

    /// Compile `source`, failing on the first variant that does not compile.
    pub fn try_new(source: &str) -> Result<Self, GrammarError> {
        let mut failure = None;
        let compiled = Self::compile(source, |variant, err| {
            failure.get_or_insert_with(|| GrammarError::RegexCompile {
                pattern: variant.to_string(),
                message: err.to_string(),
            });
        });
        match failure {
            Some(err) => Err(err),
            None => Ok(compiled),
        }
    }

    fn compile(source: &str, mut on_error: impl FnMut(&str, &onig::Error)) -> Self {
        let anchors = scan_anchors(source);
        let mut variants: [Option<Arc<Regex>>; 4] = Default::default();
        let mut built: Vec<(String, Option<Arc<Regex>>)> = Vec::new();

        for (slot, variant) in variants.iter_mut().enumerate() {
            let allow_a = slot & 0b10 != 0;
            let allow_g = slot & 0b01 != 0;
            let text = rewrite_anchors(source, anchors, allow_a, allow_g);

            if let Some((_, shared)) = built.iter().find(|(s, _)| *s == text) {
                *variant = shared.clone();
                continue;
            }

            let regex = match compile_onig(&text) {
                Ok(regex) => Some(Arc::new(regex)),
                Err(err) => {
                    on_error(&text, &err);
                    None
                }
            };
            *variant = regex.clone();
            built.push((text, regex));
        }

        let mut group_names = HashMap::new();
        if let Some(regex) = variants.iter().flatten().next() {
            regex.foreach_name(|name, indices| {
                group_names.insert(
                    name.to_string(),
                    indices.iter().map(|&i| i as usize).collect(),
                );
                true
            });
        }

        Self {
            source: source.into(),
            variants,
            anchors,
            group_names: Arc::new(group_names),
        }
    }

    /// The regex source as written in the grammar.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Returns `true` if the source uses `\A` or `\G`.
    pub fn has_anchors(&self) -> bool {
        self.anchors.a || self.anchors.g
    }

    /// Returns `true` if no variant compiled.
    pub fn is_inert(&self) -> bool {
        self.variants.iter().all(Option::is_none)
    }

    /// The variant for a call site, or `None` if that variant failed to compile.
    pub fn get(&self, allow_a: bool, allow_g: bool) -> Option<&Regex> {
        let slot = (usize::from(allow_a) << 1) | usize::from(allow_g);
        self.variants[slot].as_deref()
    }

    /// Group indices carrying `name`.
    pub fn group_indices(&self, name: &str) -> &[usize] {
        self.group_names.get(name).map_or(&[], Vec::as_slice)
    }

    /// Search `text[range]` for the leftmost match.
    ///
    /// The regex sees `text[..range.end]`, so look-behind and `\A` observe the real
    /// document prefix while the match cannot extend past `range.end`. `\G` (when
    /// allowed) anchors at `range.start`.
    pub fn search(
        &self,
        text: &str,
        range: Range<usize>,
        allow_a: bool,
        allow_g: bool,
    ) -> Option<RegexMatch> {
        let regex = self.get(allow_a, allow_g)?;
        let haystack = text.get(..range.end)?;
        let mut region = Region::new();
        regex.search_with_options(
            haystack,
            range.start,
            range.end,
            SearchOptions::SEARCH_OPTION_NONE,
            Some(&mut region),
        )?;
        RegexMatch::from_region(&region)
    }
}

fn compile_onig(source: &str) -> Result<Regex, onig::Error> {
    Regex::with_options(
        source,
        RegexOptions::REGEX_OPTION_CAPTURE_GROUP,
        Syntax::default(),
    )
}

/// Byte offsets of every unescaped backslash in `source`.
fn escapes(source: &str) -> impl Iterator<Item = usize> + '_ {
    let bytes = source.as_bytes();
    let mut i = 0;
    std::iter::from_fn(move || {
        while i < bytes.len() {
            let at = i;
            if bytes[at] == b'\\' {
                i += 2;
                return Some(at);
            }
            i += 1;
        }
        None
    })
}

fn scan_anchors(source: &str) -> Anchors {
    let bytes = source.as_bytes();
    let mut anchors = Anchors::default();
    for at in escapes(source) {
        match bytes.get(at + 1) {
            Some(b'A') => anchors.a = true,
            Some(b'G') => anchors.g = true,
            _ => {}
        }
    }
    anchors
}

fn rewrite_anchors(source: &str, anchors: Anchors, allow_a: bool, allow_g: bool) -> String {
    let disable_a = anchors.a && !allow_a;
    let disable_g = anchors.g && !allow_g;
    if !disable_a && !disable_g {
        return source.to_string();
    }

    let bytes = source.as_bytes();
    let mut out = String::with_capacity(source.len() + 4);
    let mut copied = 0;
    for at in escapes(source) {
        let disable = match bytes.get(at + 1) {
            Some(b'A') => disable_a,
            Some(b'G') => disable_g,
            _ => false,
        };
        if disable {
            out.push_str(&source[copied..=at]);
            out.push(DISABLED_ANCHOR);
            copied = at + 2;
        }
    }
    out.push_str(&source[copied..]);
    out
}

/// Returns `true` if `source` contains a back-reference (`\1`..`\9...`).
pub(crate) fn has_back_references(source: &str) -> bool {
    let bytes = source.as_bytes();
    escapes(source).any(|at| matches!(bytes.get(at + 1), Some(b'1'..=b'9')))
}

/// Replace each back-reference in `source` with the escaped text of that group in
/// `captured`.
pub(crate) fn substitute_back_references(
    source: &str,
    text: &str,
    captured: &RegexMatch,
) -> String {
    let bytes = source.as_bytes();
    let mut out = String::with_capacity(source.len());
    let mut copied = 0;
    for at in escapes(source) {
        let digits = bytes[at + 1..]
            .iter()
            .take_while(|b| b.is_ascii_digit())
            .count();
        if digits == 0 || bytes[at + 1] == b'0' {
            continue;
        }
        let index: usize = source[at + 1..at + 1 + digits].parse().unwrap_or(0);
        let group = captured
            .group(index)
            .and_then(|r| text.get(r))
            .unwrap_or_default();
        out.push_str(&source[copied..at]);
        out.push_str(&regex::escape(group));
        copied = at + 1 + digits;
    }
    out.push_str(&source[copied..]);
    out
}

/// Group ranges of one successful match. Group 0 is always present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegexMatch {
    groups: Vec<Option<Range<usize>>>,
}

impl RegexMatch {
    fn from_region(region: &Region) -> Option<Self> {
        let groups: Vec<_> = (0..region.len())
            .map(|i| region.pos(i).map(|(start, end)| start..end))
            .collect();
        groups.first()?.as_ref()?;
        Some(Self { groups })
    }

    /// Range of the whole match.
    pub fn range(&self) -> Range<usize> {
        self.groups[0].clone().unwrap_or_default()
    }

    /// Start of the whole match.
    pub fn start(&self) -> usize {
        self.range().start
    }

    /// End of the whole match.
    pub fn end(&self) -> usize {
        self.range().end
    }

    /// Range of group `index`, if it participated in the match.
    pub fn group(&self, index: usize) -> Option<Range<usize>> {
        self.groups.get(index).cloned().flatten()
    }

    /// Number of groups, including group 0.
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    /// Always `false`; a match has at least group 0.
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rewrite_disables_only_unescaped_anchors() {
        let anchors = scan_anchors(r"\\A\G\Ax");
        assert_eq!(anchors, Anchors { a: true, g: true });

        let rewritten = rewrite_anchors(r"\\A\G\Ax", anchors, false, true);
        assert_eq!(rewritten, format!(r"\\A\G\{DISABLED_ANCHOR}x"));
    }

    #[test]
    fn test_variants_are_shared_without_anchors() {
        let regex = CompiledRegex::new("ab+");
        assert!(!regex.has_anchors());
        let variants: Vec<_> = regex.variants.iter().flatten().collect();
        assert_eq!(variants.len(), 4);
        assert!(variants.windows(2).all(|w| Arc::ptr_eq(w[0], w[1])));
    }

    #[test]
    fn test_back_reference_substitution_escapes_text() {
        let begin = CompiledRegex::new(r"<<(\S+)");
        let text = "<<a.b";
        let m = begin.search(text, 0..text.len(), true, true).unwrap();
        assert!(has_back_references(r"^\1$"));
        assert!(!has_back_references(r"\\1"));
        assert_eq!(substitute_back_references(r"^\1$", text, &m), r"^a\.b$");
    }
}
