//! Bit-packed reference counter over a single 32-bit word.
//!
//! # Word layout
//!
//! ```text
//! 31        24 23                         0
//! +-----------+---------------------------+
//! |   flags   |           count           |
//! +-----------+---------------------------+
//! ```
//!
//! - `count == 0`: free, nobody retains the object
//! - `1..=MAX_COUNT`: number of active retains
//! - `DISPOSED` (all 24 bits set): the object is gone
//! - anything in between: the word is corrupt
//!
//! The flag byte belongs to whoever owns the memory. Counter operations
//! carry it through unchanged, and a flag change observed in the middle of a
//! CAS loop is treated as corruption rather than retried.

use core::fmt;
use core::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::fatal::{FatalError, fail_fast};
use crate::region::Region;

/// Mask selecting the count bits of a counter word.
pub const COUNT_MASK: u32 = 0x00FF_FFFF;

/// Mask selecting the owner flag bits of a counter word.
pub const FLAGS_MASK: u32 = !COUNT_MASK;

/// Largest legal retain count.
pub const MAX_COUNT: u32 = COUNT_MASK >> 1;

/// Count value marking a disposed counter.
pub const DISPOSED: u32 = COUNT_MASK;

/// Errors returned by counter transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterError {
    /// The counter was already disposed.
    Disposed,
    /// Decrement of a counter that is not retained.
    Underflow,
    /// Increment past [`MAX_COUNT`].
    Overflow,
    /// Dispose of a counter that is still retained.
    PositiveRefCount { count: u32 },
    /// The pointer is null or not 4-byte aligned.
    InvalidPointer,
}

impl fmt::Display for CounterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disposed => write!(f, "counter is disposed"),
            Self::Underflow => write!(f, "counter is not retained"),
            Self::Overflow => write!(f, "counter would exceed {MAX_COUNT}"),
            Self::PositiveRefCount { count } => {
                write!(f, "cannot dispose counter with {count} active retains")
            }
            Self::InvalidPointer => write!(f, "counter pointer is null or misaligned"),
        }
    }
}

impl std::error::Error for CounterError {}

/// Handle to a counter word living at a stable address.
///
/// The handle is `Copy` and does not own the word; whoever provided the
/// memory keeps it alive.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct BitPackedCounter {
    cell: NonNull<AtomicU32>,
}

// SAFETY: all access to the word goes through atomics.
unsafe impl Send for BitPackedCounter {}
unsafe impl Sync for BitPackedCounter {}

impl BitPackedCounter {
    /// Bind a counter to a raw word.
    ///
    /// # Safety
    ///
    /// `ptr` must stay valid, and only be accessed atomically, for as long as
    /// the returned handle (or any copy of it) is used.
    pub unsafe fn from_ptr(ptr: *mut u32) -> Result<Self, CounterError> {
        let Some(cell) = NonNull::new(ptr) else {
            return Err(CounterError::InvalidPointer);
        };
        if !(ptr as usize).is_multiple_of(align_of::<AtomicU32>()) {
            return Err(CounterError::InvalidPointer);
        }
        let counter = Self {
            cell: cell.cast::<AtomicU32>(),
        };
        checked_count(counter.word().load(Ordering::Acquire))?;
        Ok(counter)
    }

    /// Bind a counter to the word at `offset` in `region`.
    pub fn in_region(region: Region, offset: usize) -> Result<Self, CounterError> {
        let counter = Self::bind(region.atomic_u32(offset));
        checked_count(counter.word().load(Ordering::Acquire))?;
        Ok(counter)
    }

    /// Bind without validating the current value.
    #[inline]
    pub(crate) fn bind(word: &AtomicU32) -> Self {
        Self {
            cell: NonNull::from(word),
        }
    }

    #[inline]
    fn word(&self) -> &AtomicU32 {
        unsafe { self.cell.as_ref() }
    }

    /// Address of the counter word.
    #[inline]
    pub fn as_ptr(&self) -> *mut u32 {
        self.cell.as_ptr() as *mut u32
    }

    /// Current retain count, or [`DISPOSED`].
    #[inline]
    pub fn count(&self) -> u32 {
        self.word().load(Ordering::Acquire) & COUNT_MASK
    }

    /// Owner flag byte.
    #[inline]
    pub fn flags(&self) -> u8 {
        (self.word().load(Ordering::Acquire) >> 24) as u8
    }

    #[inline]
    pub fn is_retained(&self) -> bool {
        let count = self.count();
        count != 0 && count <= MAX_COUNT
    }

    #[inline]
    pub fn is_disposed(&self) -> bool {
        self.count() == DISPOSED
    }

    /// Add one retain and return the new count.
    pub fn increment(&self) -> Result<u32, CounterError> {
        let word = self.word();
        let mut current = word.load(Ordering::Acquire);
        loop {
            let count = checked_count(current)?;
            if count == MAX_COUNT {
                return Err(CounterError::Overflow);
            }
            match word.compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Ok(count + 1),
                Err(observed) => current = flags_unchanged(current, observed),
            }
        }
    }

    /// Drop one retain and return the new count.
    pub fn decrement(&self) -> Result<u32, CounterError> {
        let word = self.word();
        let mut current = word.load(Ordering::Acquire);
        loop {
            let count = checked_count(current)?;
            if count == 0 {
                return Err(CounterError::Underflow);
            }
            match word.compare_exchange(current, current - 1, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Ok(count - 1),
                Err(observed) => current = flags_unchanged(current, observed),
            }
        }
    }

    /// Add one retain unless the counter is free; returns 0 if it was free.
    pub fn increment_if_retained(&self) -> Result<u32, CounterError> {
        let word = self.word();
        let mut current = word.load(Ordering::Acquire);
        loop {
            let count = checked_count(current)?;
            if count == 0 {
                return Ok(0);
            }
            if count == MAX_COUNT {
                return Err(CounterError::Overflow);
            }
            match word.compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Ok(count + 1),
                Err(observed) => current = flags_unchanged(current, observed),
            }
        }
    }

    /// Drop the last retain.
    ///
    /// Returns 0 when this call took the count from 1 to 0, or the unchanged
    /// count when other retains remain. Exactly one caller observes the
    /// transition to zero.
    pub fn decrement_if_one(&self) -> Result<u32, CounterError> {
        let word = self.word();
        let mut current = word.load(Ordering::Acquire);
        loop {
            let count = checked_count(current)?;
            match count {
                0 => return Err(CounterError::Underflow),
                1 => {}
                _ => return Ok(count),
            }
            match word.compare_exchange(current, current - 1, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Ok(0),
                Err(observed) => current = flags_unchanged(current, observed),
            }
        }
    }

    /// Move a free counter to the disposed state.
    pub fn dispose(&self) -> Result<(), CounterError> {
        let word = self.word();
        let mut current = word.load(Ordering::Acquire);
        loop {
            let count = checked_count(current)?;
            if count != 0 {
                return Err(CounterError::PositiveRefCount { count });
            }
            match word.compare_exchange(
                current,
                current | DISPOSED,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(observed) => current = flags_unchanged(current, observed),
            }
        }
    }

    /// Dispose if free, without failing.
    ///
    /// Returns `0` if this call disposed the counter, the current count if it
    /// is still retained, and `-1` if it was already disposed.
    pub fn try_dispose(&self) -> i32 {
        let word = self.word();
        let mut current = word.load(Ordering::Acquire);
        loop {
            let count = match checked_count(current) {
                Ok(count) => count,
                Err(_) => return -1,
            };
            if count != 0 {
                return count as i32;
            }
            match word.compare_exchange(
                current,
                current | DISPOSED,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return 0,
                Err(observed) => current = flags_unchanged(current, observed),
            }
        }
    }
}

impl fmt::Debug for BitPackedCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BitPackedCounter")
            .field("addr", &self.cell)
            .field("count", &self.count())
            .field("flags", &self.flags())
            .finish()
    }
}

/// Count of a legal word; `Disposed` for the sentinel, fatal for the rest.
#[inline]
fn checked_count(value: u32) -> Result<u32, CounterError> {
    let count = value & COUNT_MASK;
    if count <= MAX_COUNT {
        Ok(count)
    } else if count == DISPOSED {
        Err(CounterError::Disposed)
    } else {
        fail_fast(FatalError::CorruptCounter { value })
    }
}

/// Returns `observed` if a failed CAS only lost a race on the count bits.
#[inline]
fn flags_unchanged(expected: u32, observed: u32) -> u32 {
    if expected & FLAGS_MASK != observed & FLAGS_MASK {
        fail_fast(FatalError::ConcurrentMutation { expected, observed });
    }
    observed
}
