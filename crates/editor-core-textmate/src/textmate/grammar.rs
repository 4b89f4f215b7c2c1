use crate::textmate::definition::Pattern;
use crate::textmate::error::GrammarError;
use crate::textmate::scope::SyntaxScope;
use onig::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, OnceLock};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// Source format of a grammar document.
pub enum GrammarFormat {
    /// `.tmLanguage.json`, `.tmGrammar.json`, or any `.json`.
    Json,
    /// `.tmLanguage.yaml`, `.yaml`, `.yml`.
    Yaml,
    /// `.tmLanguage` / `.plist` (XML property list).
    Plist,
}

impl GrammarFormat {
    /// Infer the format from a file name.
    pub fn from_path(path: impl AsRef<Path>) -> Option<Self> {
        let name = path.as_ref().file_name()?.to_str()?.to_ascii_lowercase();
        if name.ends_with(".json") {
            Some(Self::Json)
        } else if name.ends_with(".yaml") || name.ends_with(".yml") {
            Some(Self::Yaml)
        } else if name.ends_with(".tmlanguage") || name.ends_with(".plist") {
            Some(Self::Plist)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
/// A decoded TextMate grammar.
///
/// Immutable once parsed; compile it into a
/// [`GrammarTokenizer`](crate::textmate::GrammarTokenizer) to tokenize text.
pub struct Grammar {
    #[serde(rename = "scopeName")]
    /// Root scope (e.g. `source.json`).
    pub scope: SyntaxScope,

    #[serde(default)]
    /// Optional human-readable name.
    pub name: Option<String>,

    #[serde(default)]
    /// File extensions (or whole file names) associated with this grammar.
    pub file_types: Vec<String>,

    #[serde(default)]
    /// Optional regex used to detect the grammar from a document's first line.
    pub first_line_match: Option<String>,

    #[serde(default)]
    /// Regex marking a line that opens a folding region.
    pub folding_start_marker: Option<String>,

    #[serde(default)]
    /// Regex marking a line that closes a folding region.
    pub folding_end_marker: Option<String>,

    #[serde(default)]
    /// Root pattern list.
    pub patterns: Vec<Pattern>,

    #[serde(default)]
    /// Named rules referenced via `#key`.
    pub repository: HashMap<String, Pattern>,

    #[serde(skip)]
    first_line_regex: OnceLock<Option<Arc<Regex>>>,
}

impl Grammar {
    /// Decode a grammar document in the given format.
    pub fn from_slice(source: &[u8], format: GrammarFormat) -> Result<Self, GrammarError> {
        match format {
            GrammarFormat::Json => Ok(serde_json::from_slice(source)?),
            GrammarFormat::Yaml => Ok(serde_yaml::from_slice(source)?),
            GrammarFormat::Plist => Ok(plist::from_bytes(source)?),
        }
    }

    /// Decode a JSON grammar.
    pub fn from_json(source: &str) -> Result<Self, GrammarError> {
        Self::from_slice(source.as_bytes(), GrammarFormat::Json)
    }

    /// Decode a YAML grammar.
    pub fn from_yaml(source: &str) -> Result<Self, GrammarError> {
        Self::from_slice(source.as_bytes(), GrammarFormat::Yaml)
    }

    /// Decode an XML property-list grammar.
    pub fn from_plist(source: &[u8]) -> Result<Self, GrammarError> {
        Self::from_slice(source, GrammarFormat::Plist)
    }

    /// Read and decode a grammar file, inferring the format from its name.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, GrammarError> {
        let path = path.as_ref();
        let format = GrammarFormat::from_path(path)
            .ok_or_else(|| GrammarError::UnknownFormat(path.to_path_buf()))?;
        let bytes = std::fs::read(path)?;
        Self::from_slice(&bytes, format)
    }

    /// Returns `true` if `file_name` matches one of the grammar's `fileTypes`.
    ///
    /// An entry matches the whole file name (`Makefile`) or its extension (`rs` for
    /// `main.rs`, `d.ts` for `index.d.ts`).
    pub fn matches_file_name(&self, file_name: &str) -> bool {
        self.file_type_match_len(file_name).is_some()
    }

    /// Length of the longest `fileTypes` entry matching `file_name`.
    pub(crate) fn file_type_match_len(&self, file_name: &str) -> Option<usize> {
        self.file_types
            .iter()
            .filter(|ty| !ty.is_empty())
            .filter(|ty| {
                file_name == ty.as_str()
                    || file_name
                        .strip_suffix(ty.as_str())
                        .is_some_and(|stem| stem.ends_with('.'))
            })
            .map(|ty| ty.len())
            .max()
    }

    /// Returns `true` if `line` matches the grammar's `firstLineMatch` regex.
    ///
    /// The regex is compiled on first use.
    pub fn matches_first_line(&self, line: &str) -> bool {
        self.first_line_regex
            .get_or_init(|| {
                let source = self.first_line_match.as_deref()?;
                match Regex::new(source) {
                    Ok(regex) => Some(Arc::new(regex)),
                    Err(err) => {
                        warn!(scope = %self.scope, pattern = source, %err, "invalid firstLineMatch");
                        None
                    }
                }
            })
            .as_ref()
            .is_some_and(|regex| regex.find(line).is_some())
    }

    /// Compile the folding markers. Returns `Ok(None)` unless both markers are present.
    pub fn folding_markers(&self) -> Result<Option<FoldingMarkers>, GrammarError> {
        let (Some(start), Some(end)) = (
            self.folding_start_marker.as_deref(),
            self.folding_end_marker.as_deref(),
        ) else {
            return Ok(None);
        };
        Ok(Some(FoldingMarkers {
            start: compile_marker(start)?,
            end: compile_marker(end)?,
        }))
    }
}

fn compile_marker(source: &str) -> Result<Regex, GrammarError> {
    Regex::new(source).map_err(|e| GrammarError::RegexCompile {
        pattern: source.to_string(),
        message: e.to_string(),
    })
}

/// Compiled `foldingStartMarker`/`foldingEndMarker` pair, consumed by folding logic.
#[derive(Debug)]
pub struct FoldingMarkers {
    start: Regex,
    end: Regex,
}

impl FoldingMarkers {
    /// Returns `true` if `line` opens a folding region.
    pub fn is_start(&self, line: &str) -> bool {
        self.start.find(line).is_some()
    }

    /// Returns `true` if `line` closes a folding region.
    pub fn is_end(&self, line: &str) -> bool {
        self.end.find(line).is_some()
    }

    /// Pair start/end marker lines into `(start_line, end_line)` regions.
    ///
    /// Regions nest like brackets; unmatched markers are ignored and single-line regions
    /// are dropped.
    pub fn regions<'a>(&self, lines: impl IntoIterator<Item = &'a str>) -> Vec<(usize, usize)> {
        let mut open = Vec::new();
        let mut regions = Vec::new();
        for (line_no, line) in lines.into_iter().enumerate() {
            if self.is_end(line)
                && let Some(start) = open.pop()
            {
                regions.push((start, line_no));
            }
            if self.is_start(line) {
                open.push(line_no);
            }
        }
        regions.sort_unstable();
        regions
    }
}
