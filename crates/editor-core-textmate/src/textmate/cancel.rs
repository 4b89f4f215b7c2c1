use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// A per-document, monotonically increasing edit generation.
///
/// Every edit bumps the generation; tokenize work started under an older generation
/// observes the bump through its [`CancellationToken`] and stops early.
#[derive(Debug, Clone, Default)]
pub struct Generation(Arc<AtomicU64>);

impl Generation {
    /// Create a counter at generation 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// The current generation.
    pub fn current(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    /// Advance to a new generation, cancelling every outstanding token. Returns the new value.
    pub fn bump(&self) -> u64 {
        self.0.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// A token bound to the current generation.
    pub fn token(&self) -> CancellationToken {
        CancellationToken {
            counter: Some(self.0.clone()),
            captured: self.current(),
        }
    }
}

/// Cancellation checkpoint handle passed through a tokenize call.
#[derive(Debug, Clone)]
pub struct CancellationToken {
    counter: Option<Arc<AtomicU64>>,
    captured: u64,
}

impl CancellationToken {
    /// A token that is never cancelled.
    pub fn never() -> Self {
        Self {
            counter: None,
            captured: 0,
        }
    }

    /// The generation this token was captured at.
    pub fn generation(&self) -> u64 {
        self.captured
    }

    /// Returns `true` once the owning generation has moved past the captured one.
    pub fn is_cancelled(&self) -> bool {
        self.counter
            .as_ref()
            .is_some_and(|counter| counter.load(Ordering::Acquire) != self.captured)
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::never()
    }
}
