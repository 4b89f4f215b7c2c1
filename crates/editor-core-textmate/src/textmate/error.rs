use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
/// Errors produced while loading, decoding, or compiling TextMate grammars.
pub enum GrammarError {
    #[error("JSON parse error: {0}")]
    /// A JSON grammar document failed to decode.
    Json(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    /// A YAML grammar document failed to decode.
    Yaml(#[from] serde_yaml::Error),

    #[error("property list parse error: {0}")]
    /// A property-list (`.tmLanguage`) grammar document failed to decode.
    Plist(#[from] plist::Error),

    #[error("I/O error: {0}")]
    /// Filesystem I/O failed.
    Io(#[from] std::io::Error),

    #[error("unknown grammar format: {}", .0.display())]
    /// The grammar format could not be inferred from a file name.
    UnknownFormat(PathBuf),

    #[error("unknown grammar scope '{0}'")]
    /// No grammar (or no reloadable source) is registered for a scope.
    UnknownScope(String),

    #[error("invalid pattern: {0}")]
    /// A pattern object in the grammar document is malformed.
    InvalidPattern(String),

    #[error("regex compile error for pattern '{pattern}': {message}")]
    /// A regex pattern failed to compile.
    RegexCompile {
        /// The regex pattern string.
        pattern: String,
        /// The compiler error message.
        message: String,
    },
}
