#![warn(missing_docs)]
//! `editor-core-textmate` - TextMate grammar highlighting for `editor-core`.
//!
//! This crate contains a TextMate (`.tmLanguage`) grammar engine that produces a tree of
//! scoped byte ranges, plus a per-document scheduler that keeps the tree current across
//! edits by re-tokenizing only the affected region in the background.

pub mod textmate;

mod scheduler;

pub use scheduler::{HighlightConfig, HighlightScheduler};
pub use textmate::*;
