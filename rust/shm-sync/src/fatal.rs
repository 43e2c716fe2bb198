//! Fail-fast handling for corrupted shared state.
//!
//! A [`FatalError`] is never returned to a caller. It is handed to
//! [`fail_fast`], which logs it and aborts the process: the word that broke
//! may be mapped into other processes, and unwinding past it would let them
//! keep working against an inconsistent structure.

use core::fmt;

/// Conditions that abort the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalError {
    /// A counter word holds a count outside `{0} ∪ [1, MAX_COUNT] ∪ {DISPOSED}`.
    CorruptCounter { value: u32 },
    /// The owner flag bits of a counter changed while a counter operation ran.
    ConcurrentMutation { expected: u32, observed: u32 },
    /// A slab free list points somewhere a free-list link can never point.
    FreeListCorrupted { index: u32, link: u32 },
    /// A lock holder tried to take the same lock again.
    ReentrantLock { wpid: u64 },
    /// Acquisition spun past the deadlock threshold with no liveness helper.
    Deadlock { holder: u64, iterations: u64 },
}

impl fmt::Display for FatalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CorruptCounter { value } => {
                write!(f, "corrupt counter word {value:#010x}")
            }
            Self::ConcurrentMutation { expected, observed } => write!(
                f,
                "counter flags mutated during operation: expected {expected:#010x}, observed {observed:#010x}"
            ),
            Self::FreeListCorrupted { index, link } => {
                write!(f, "free list corrupted at index {index} (link {link:#010x})")
            }
            Self::ReentrantLock { wpid } => {
                write!(f, "reentrant acquire of a shared spinlock by wpid {wpid}")
            }
            Self::Deadlock { holder, iterations } => write!(
                f,
                "deadlock: lock held by wpid {holder} after {iterations} attempts"
            ),
        }
    }
}

/// Log `error` and abort.
///
/// Unit tests build this as a panic so the fatal paths can be asserted with
/// `#[should_panic]`.
#[cold]
#[inline(never)]
#[track_caller]
pub fn fail_fast(error: FatalError) -> ! {
    tracing::error!(%error, ?error, "unrecoverable shared-memory state, aborting");

    #[cfg(test)]
    panic!("fatal: {error}");

    #[cfg(not(test))]
    std::process::abort();
}
