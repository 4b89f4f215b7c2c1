//! TextMate grammar support.
//!
//! This module decodes `.tmLanguage` grammars (JSON, YAML or XML plist), compiles them
//! into shareable tokenizers, and turns text into a tree of scoped byte ranges.

mod cancel;
mod compiler;
mod definition;
mod engine;
mod error;
mod grammar;
mod regex;
mod scope;
mod set;
mod text;
mod tree;

pub use cancel::{CancellationToken, Generation};
pub use compiler::{
    BeginEndNode, BeginWhileNode, GrammarResolver, GrammarTokenizer, GroupNode, IncludeNode,
    MatchNode, TokenizerNode,
};
pub use definition::{
    BeginEndRule, BeginWhileRule, Capture, CaptureKey, Captures, GrammarRef, GroupRule,
    IncludeRule, MatchRule, Pattern,
};
pub use error::GrammarError;
pub use grammar::{FoldingMarkers, Grammar, GrammarFormat};
pub use self::regex::{CompiledRegex, RegexMatch};
pub use scope::{ScopeStyleMap, SyntaxScope};
pub use set::GrammarRegistry;
pub use text::{TextEdit, TextSnapshot};
pub use tree::{ScopedRange, SyntaxNode, SyntaxTree};

pub(crate) use engine::RegionPass;
