use crate::textmate::error::GrammarError;
use serde::Deserialize;
use serde::de::{self, Deserializer, Visitor};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
/// Target of an `include` rule.
pub enum GrammarRef {
    /// `$self`: the owning grammar's root pattern list.
    SelfRoot,
    /// `$base`: the root pattern list of the grammar that started the tokenization.
    Base,
    /// `#key`: a repository entry, looked up from the innermost enclosing repository outwards.
    Local(String),
    /// `scope` or `scope#key`: another grammar's root, or one of its top-level repository entries.
    Global {
        /// Scope name of the referenced grammar.
        scope: String,
        /// Optional repository key inside the referenced grammar.
        key: Option<String>,
    },
}

impl GrammarRef {
    /// Parse the `include` string syntax. Returns `None` for an empty or malformed reference.
    pub fn parse(reference: &str) -> Option<Self> {
        let reference = reference.trim();
        match reference {
            "" => None,
            "$self" => Some(Self::SelfRoot),
            "$base" => Some(Self::Base),
            _ => match reference.split_once('#') {
                Some(("", "")) => None,
                Some(("", key)) => Some(Self::Local(key.to_string())),
                Some((scope, "")) => Some(Self::Global {
                    scope: scope.to_string(),
                    key: None,
                }),
                Some((scope, key)) => Some(Self::Global {
                    scope: scope.to_string(),
                    key: Some(key.to_string()),
                }),
                None => Some(Self::Global {
                    scope: reference.to_string(),
                    key: None,
                }),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
/// Key of a capture map entry: a group index or a named group.
pub enum CaptureKey {
    /// Numbered capture group (`0` is the whole match).
    Index(usize),
    /// Named capture group; applies to every group carrying that name.
    Name(String),
}

impl CaptureKey {
    fn from_text(text: &str) -> Self {
        match text.parse::<usize>() {
            Ok(index) => Self::Index(index),
            Err(_) => Self::Name(text.to_string()),
        }
    }
}

impl<'de> Deserialize<'de> for CaptureKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct KeyVisitor;

        impl Visitor<'_> for KeyVisitor {
            type Value = CaptureKey;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a capture group index or name")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
                usize::try_from(v)
                    .map(CaptureKey::Index)
                    .map_err(|_| E::custom("capture group index out of range"))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
                usize::try_from(v)
                    .map(CaptureKey::Index)
                    .map_err(|_| E::custom("negative capture group index"))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
                Ok(CaptureKey::from_text(v))
            }
        }

        deserializer.deserialize_any(KeyVisitor)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
/// Scope and sub-patterns applied to one capture group.
pub struct Capture {
    #[serde(default)]
    /// Scope-name template assigned to the captured text.
    pub name: Option<String>,

    #[serde(default)]
    /// Patterns applied to the captured text only.
    pub patterns: Vec<Pattern>,
}

/// A capture map (`captures`, `beginCaptures`, `endCaptures`, `whileCaptures`).
pub type Captures = BTreeMap<CaptureKey, Capture>;

#[derive(Debug, Clone, Copy, Default)]
/// A boolean grammar flag that may be written as `true`/`false` or `1`/`0`.
struct Flag(bool);

impl<'de> Deserialize<'de> for Flag {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct FlagVisitor;

        impl Visitor<'_> for FlagVisitor {
            type Value = Flag;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a boolean or integer flag")
            }

            fn visit_bool<E: de::Error>(self, v: bool) -> Result<Self::Value, E> {
                Ok(Flag(v))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
                Ok(Flag(v != 0))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
                Ok(Flag(v != 0))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
                Ok(Flag(matches!(v, "1" | "true" | "yes")))
            }
        }

        deserializer.deserialize_any(FlagVisitor)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct RawPattern {
    include: Option<String>,
    #[serde(rename = "match")]
    match_source: Option<String>,
    begin: Option<String>,
    end: Option<String>,
    #[serde(rename = "while")]
    while_source: Option<String>,
    name: Option<String>,
    content_name: Option<String>,
    captures: Option<Captures>,
    begin_captures: Option<Captures>,
    end_captures: Option<Captures>,
    while_captures: Option<Captures>,
    patterns: Option<Vec<Pattern>>,
    repository: Option<HashMap<String, Pattern>>,
    disabled: Flag,
    apply_end_pattern_last: Flag,
}

#[derive(Debug, Clone)]
/// An `include` rule.
pub struct IncludeRule {
    /// Parsed reference; `None` for a reference that can never resolve.
    pub reference: Option<GrammarRef>,
    /// Disabled rules are skipped when compiling.
    pub disabled: bool,
}

#[derive(Debug, Clone)]
/// A single-regex `match` rule.
pub struct MatchRule {
    /// Regex source.
    pub regex: String,
    /// Scope-name template for the whole match.
    pub name: Option<String>,
    /// Per-group scopes and sub-patterns.
    pub captures: Captures,
    /// Disabled rules are skipped when compiling.
    pub disabled: bool,
}

#[derive(Debug, Clone)]
/// A `begin`/`end` region rule.
pub struct BeginEndRule {
    /// Regex opening the region.
    pub begin: String,
    /// Regex closing the region; `None` means the region runs to the end of the document.
    pub end: Option<String>,
    /// Scope-name template for the whole region.
    pub name: Option<String>,
    /// Scope-name template for the text between `begin` and `end`.
    pub content_name: Option<String>,
    /// Captures applied to the `begin` match.
    pub begin_captures: Captures,
    /// Captures applied to the `end` match.
    pub end_captures: Captures,
    /// Patterns applied to the region content.
    pub patterns: Vec<Pattern>,
    /// Repository local to this rule.
    pub repository: HashMap<String, Pattern>,
    /// When set, content patterns win over `end` at the same offset.
    pub apply_end_pattern_last: bool,
    /// Disabled rules are skipped when compiling.
    pub disabled: bool,
}

#[derive(Debug, Clone)]
/// A `begin`/`while` region rule: the region continues while each following line matches.
pub struct BeginWhileRule {
    /// Regex opening the region.
    pub begin: String,
    /// Regex every continuation line must match.
    pub while_regex: String,
    /// Scope-name template for the whole region.
    pub name: Option<String>,
    /// Scope-name template for the region content.
    pub content_name: Option<String>,
    /// Captures applied to the `begin` match.
    pub begin_captures: Captures,
    /// Captures applied to each `while` match.
    pub while_captures: Captures,
    /// Patterns applied to the region content.
    pub patterns: Vec<Pattern>,
    /// Repository local to this rule.
    pub repository: HashMap<String, Pattern>,
    /// Disabled rules are skipped when compiling.
    pub disabled: bool,
}

#[derive(Debug, Clone, Default)]
/// A plain list of alternative patterns.
pub struct GroupRule {
    /// Alternatives, in declaration order.
    pub patterns: Vec<Pattern>,
    /// Repository local to this rule.
    pub repository: HashMap<String, Pattern>,
    /// Disabled rules are skipped when compiling.
    pub disabled: bool,
}

#[allow(clippy::large_enum_variant)]
#[derive(Debug, Clone, Deserialize)]
#[serde(try_from = "RawPattern")]
/// One grammar rule.
///
/// Decoding dispatches on the keys present, in priority order: `include`, `match`,
/// `begin` (with `while` and no `end` selecting [`Pattern::BeginWhile`]), and otherwise a
/// [`Pattern::Group`] of the rule's `patterns`.
pub enum Pattern {
    /// Delegate to another rule.
    Include(IncludeRule),
    /// Single regex match.
    Match(MatchRule),
    /// `begin`/`end` region.
    BeginEnd(BeginEndRule),
    /// `begin`/`while` region.
    BeginWhile(BeginWhileRule),
    /// List of alternatives.
    Group(GroupRule),
}

impl Pattern {
    /// Returns `true` if the rule carries `disabled: 1`.
    pub fn is_disabled(&self) -> bool {
        match self {
            Pattern::Include(rule) => rule.disabled,
            Pattern::Match(rule) => rule.disabled,
            Pattern::BeginEnd(rule) => rule.disabled,
            Pattern::BeginWhile(rule) => rule.disabled,
            Pattern::Group(rule) => rule.disabled,
        }
    }
}

impl TryFrom<RawPattern> for Pattern {
    type Error = GrammarError;

    fn try_from(raw: RawPattern) -> Result<Self, Self::Error> {
        let disabled = raw.disabled.0;

        if let Some(include) = raw.include {
            return Ok(Pattern::Include(IncludeRule {
                reference: GrammarRef::parse(&include),
                disabled,
            }));
        }

        if let Some(regex) = raw.match_source {
            return Ok(Pattern::Match(MatchRule {
                regex,
                name: raw.name,
                captures: raw.captures.unwrap_or_default(),
                disabled,
            }));
        }

        let Some(begin) = raw.begin else {
            if raw.end.is_some() || raw.while_source.is_some() {
                return Err(GrammarError::InvalidPattern(
                    "`end`/`while` without `begin`".to_string(),
                ));
            }
            return Ok(Pattern::Group(GroupRule {
                patterns: raw.patterns.unwrap_or_default(),
                repository: raw.repository.unwrap_or_default(),
                disabled,
            }));
        };

        let fallback = raw.captures.unwrap_or_default();

        match (raw.end, raw.while_source) {
            (None, Some(while_regex)) => Ok(Pattern::BeginWhile(BeginWhileRule {
                begin,
                while_regex,
                name: raw.name,
                content_name: raw.content_name,
                begin_captures: raw.begin_captures.unwrap_or_else(|| fallback.clone()),
                while_captures: raw.while_captures.unwrap_or(fallback),
                patterns: raw.patterns.unwrap_or_default(),
                repository: raw.repository.unwrap_or_default(),
                disabled,
            })),
            (end, _) => Ok(Pattern::BeginEnd(BeginEndRule {
                begin,
                end,
                name: raw.name,
                content_name: raw.content_name,
                begin_captures: raw.begin_captures.unwrap_or_else(|| fallback.clone()),
                end_captures: raw.end_captures.unwrap_or(fallback),
                patterns: raw.patterns.unwrap_or_default(),
                repository: raw.repository.unwrap_or_default(),
                apply_end_pattern_last: raw.apply_end_pattern_last.0,
                disabled,
            })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_grammar_refs() {
        assert_eq!(GrammarRef::parse("$self"), Some(GrammarRef::SelfRoot));
        assert_eq!(GrammarRef::parse("$base"), Some(GrammarRef::Base));
        assert_eq!(
            GrammarRef::parse("#string"),
            Some(GrammarRef::Local("string".to_string()))
        );
        assert_eq!(
            GrammarRef::parse("source.js#expression"),
            Some(GrammarRef::Global {
                scope: "source.js".to_string(),
                key: Some("expression".to_string()),
            })
        );
        assert_eq!(
            GrammarRef::parse("source.css"),
            Some(GrammarRef::Global {
                scope: "source.css".to_string(),
                key: None,
            })
        );
        assert_eq!(GrammarRef::parse(""), None);
        assert_eq!(GrammarRef::parse("#"), None);
    }

    #[test]
    fn test_capture_key_from_text() {
        assert_eq!(CaptureKey::from_text("2"), CaptureKey::Index(2));
        assert_eq!(
            CaptureKey::from_text("digits"),
            CaptureKey::Name("digits".to_string())
        );
    }
}
