//! Source identification type.

use std::sync::atomic::{AtomicU64, Ordering};

/// Handle of an input source registered with an [`AudioMixer`](crate::AudioMixer).
///
/// Handles are allocated by the mixer's registry and never reused within a
/// process, so a stale handle can never alias a newer registration.
///
/// # Example
///
/// ```
/// use conference_mixer::SourceId;
///
/// let a = SourceId::new(1);
/// assert_eq!(a.to_string(), "source-1");
/// assert_ne!(a, SourceId::new(2));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceId(u64);

impl SourceId {
    /// Creates a source ID from a raw value.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Allocates the next unused ID.
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw value.
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for SourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "source-{}", self.0)
    }
}
