//! Fixed-capacity slab of counter words.
//!
//! # Buffer layout
//!
//! ```text
//! word 0      free-list head: ABA tag (high 10 bits), !index of the first
//!             free word (low 22 bits, all ones = empty)
//! word 1      users counter: outstanding counters + 1 for the slab itself
//! word 2..N   free-list link (!index of the next free word, !1 = end of
//!             list) or a live counter
//! ```
//!
//! The head tag is bumped on every pop and push so that a pop that read a
//! stale successor cannot swing the head back onto a recycled word.
//!
//! Links are stored complemented so that a zeroed word (a fresh counter) can
//! never be mistaken for "next free word is index 0". With at most
//! [`MAX_WORDS`] words every link has its top count bits set, which puts it in
//! the corrupt range of a [`BitPackedCounter`]: a link is never a legal
//! counter value and a counter is never a legal link. In particular no link
//! reads as `DISPOSED`, so a counter that is already back on the free list
//! cannot be released a second time.

use core::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::counter::{BitPackedCounter, COUNT_MASK, CounterError, DISPOSED};
use crate::fatal::{FatalError, fail_fast};
use crate::region::{OffHeapSpan, Region};

/// Smallest slab: head, users counter and two counter words.
pub const MIN_WORDS: u32 = 4;

/// Largest slab; keeps every complemented link outside the legal count range.
pub const MAX_WORDS: u32 = 1 << 22;

const HEAD: u32 = 0;
const USERS: u32 = 1;
const FIRST_SLOT: u32 = 2;
const WORD_SIZE: usize = size_of::<u32>();

/// End-of-list link. Index 1 is never on the free list; `!0` would read as a
/// disposed counter.
const LIST_END: u32 = !USERS;

const INDEX_BITS: u32 = 22;
const INDEX_MASK: u32 = (1 << INDEX_BITS) - 1;

/// Errors returned by slab operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlabError {
    /// Word count outside `MIN_WORDS..=MAX_WORDS`.
    InvalidCapacity { words: usize },
    /// Only disposed counters may be returned to the slab.
    NotDisposed,
    /// The counter's address is not a counter word of this slab.
    NotFromThisSlab,
    /// The slab still has counters checked out.
    OutstandingCounters { outstanding: u32 },
    /// The slab was already disposed.
    AlreadyDisposed,
    /// No bucket of an allocator owns the counter.
    AlienCounter,
}

impl fmt::Display for SlabError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidCapacity { words } => write!(
                f,
                "slab needs {MIN_WORDS}..={MAX_WORDS} words, got {words}"
            ),
            Self::NotDisposed => write!(f, "counter must be disposed before release"),
            Self::NotFromThisSlab => write!(f, "counter does not belong to this slab"),
            Self::OutstandingCounters { outstanding } => {
                write!(f, "slab still has {outstanding} counters checked out")
            }
            Self::AlreadyDisposed => write!(f, "slab is already disposed"),
            Self::AlienCounter => write!(f, "counter does not belong to any bucket"),
        }
    }
}

impl std::error::Error for SlabError {}

/// A lock-free pool of counter words in one contiguous buffer.
pub struct CounterSlab {
    region: Region,
    words: u32,
    /// Set when this view allocated the buffer and must give it back.
    owner: Option<Arc<dyn OffHeapSpan>>,
}

unsafe impl Send for CounterSlab {}
unsafe impl Sync for CounterSlab {}

impl CounterSlab {
    /// Allocate a buffer of `words` words from `span` and initialize a slab in it.
    pub fn new(span: Arc<dyn OffHeapSpan>, words: usize) -> Result<Self, SlabError> {
        let words_u32 = check_words(words)?;
        let region = span.allocate(words * WORD_SIZE);
        // SAFETY: the buffer is fresh and only visible to us.
        let mut slab = unsafe { Self::init(region) }?;
        debug_assert_eq!(slab.words, words_u32);
        slab.owner = Some(span);
        Ok(slab)
    }

    /// Initialize a slab over the whole of `region` without taking ownership.
    ///
    /// # Safety
    ///
    /// The region must be writable, exclusively owned during initialization,
    /// and outlive the returned slab and every counter it issues.
    pub unsafe fn init(region: Region) -> Result<Self, SlabError> {
        let words = check_words(region.len() / WORD_SIZE)?;
        let slab = Self {
            region,
            words,
            owner: None,
        };

        slab.word(USERS).store(1, Ordering::Relaxed);
        for index in FIRST_SLOT..words - 1 {
            slab.word(index).store(encode_link(index + 1), Ordering::Relaxed);
        }
        slab.word(words - 1).store(LIST_END, Ordering::Relaxed);
        slab.word(HEAD)
            .store(pack_head(FIRST_SLOT, 0), Ordering::Release);

        Ok(slab)
    }

    /// Open a second, non-owning view onto a slab initialized elsewhere.
    ///
    /// # Safety
    ///
    /// The region must hold a slab initialized by [`CounterSlab::init`] or
    /// [`CounterSlab::new`] and outlive the returned view.
    pub unsafe fn attach(region: Region) -> Result<Self, SlabError> {
        let words = check_words(region.len() / WORD_SIZE)?;
        let slab = Self {
            region,
            words,
            owner: None,
        };
        if slab.users().is_disposed() {
            return Err(SlabError::AlreadyDisposed);
        }
        Ok(slab)
    }

    #[inline]
    fn word(&self, index: u32) -> &AtomicU32 {
        self.region.atomic_u32(index as usize * WORD_SIZE)
    }

    #[inline]
    fn users(&self) -> BitPackedCounter {
        BitPackedCounter::bind(self.word(USERS))
    }

    /// The buffer backing this slab.
    #[inline]
    pub fn region(&self) -> Region {
        self.region
    }

    /// Number of counters the slab can issue.
    #[inline]
    pub fn capacity(&self) -> u32 {
        self.words - FIRST_SLOT
    }

    /// Number of counters currently on the free list.
    #[inline]
    pub fn free_count(&self) -> u32 {
        let users = self.users().count();
        if users == 0 || users > self.words {
            return 0;
        }
        self.words - users - 1
    }

    /// Whether `index` can be the first word of the free list.
    #[inline]
    fn is_link_target(&self, index: u32) -> bool {
        index == 0 || (FIRST_SLOT..self.words).contains(&index)
    }

    /// The index a slot link points at (0 for end of list), or `None` if the
    /// word is not a link.
    #[inline]
    fn decode_link(&self, link: u32) -> Option<u32> {
        match !link {
            USERS => Some(0),
            next if (FIRST_SLOT..self.words).contains(&next) => Some(next),
            _ => None,
        }
    }

    /// Pop a free counter word, or `None` if the slab is exhausted.
    ///
    /// The returned counter is free (count 0, no flags).
    pub fn try_acquire(&self) -> Option<BitPackedCounter> {
        let head = self.word(HEAD);
        loop {
            let old_head = head.load(Ordering::Acquire);
            let (index, tag) = unpack_head(old_head);
            if index == 0 {
                return None;
            }
            if !self.is_link_target(index) {
                fail_fast(FatalError::FreeListCorrupted {
                    index,
                    link: old_head,
                });
            }

            let slot = self.word(index);
            let next_link = slot.load(Ordering::Acquire);
            let next = self.decode_link(next_link).filter(|&next| {
                next == 0
                    || self
                        .decode_link(self.word(next).load(Ordering::Acquire))
                        .is_some()
            });
            let Some(next) = next else {
                // A racing pop may have claimed `index` or `next`; only a list
                // that did not move under us is really broken.
                if head.load(Ordering::Acquire) == old_head
                    && slot.load(Ordering::Acquire) == next_link
                {
                    fail_fast(FatalError::FreeListCorrupted {
                        index,
                        link: next_link,
                    });
                }
                core::hint::spin_loop();
                continue;
            };

            let new_head = pack_head(next, tag.wrapping_add(1));
            if head
                .compare_exchange(old_head, new_head, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                core::hint::spin_loop();
                continue;
            }

            match self.users().increment() {
                Ok(_) => {}
                Err(CounterError::Disposed) => {
                    self.push(index);
                    return None;
                }
                Err(_) => fail_fast(FatalError::CorruptCounter {
                    value: self.word(USERS).load(Ordering::Acquire),
                }),
            }

            // The slot is ours once the head moved past it.
            if let Err(observed) =
                slot.compare_exchange(next_link, 0, Ordering::AcqRel, Ordering::Acquire)
            {
                fail_fast(FatalError::FreeListCorrupted {
                    index,
                    link: observed,
                });
            }

            return Some(BitPackedCounter::bind(slot));
        }
    }

    /// Return a disposed counter to the free list.
    ///
    /// A counter can be released once per acquisition; releasing it again
    /// fails with [`SlabError::NotDisposed`] because its word now holds a link.
    pub fn release(&self, counter: BitPackedCounter) -> Result<(), SlabError> {
        if !counter.is_disposed() {
            return Err(SlabError::NotDisposed);
        }
        let index = self
            .index_of(counter.as_ptr())
            .ok_or(SlabError::NotFromThisSlab)?;

        // Claim the word so that two racing releases cannot both push it.
        let slot = self.word(index);
        let disposed = slot.load(Ordering::Acquire);
        if disposed & COUNT_MASK != DISPOSED
            || slot
                .compare_exchange(disposed, LIST_END, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
        {
            return Err(SlabError::NotDisposed);
        }

        self.push(index);

        match self.users().decrement() {
            Ok(0) | Err(CounterError::Underflow) => fail_fast(FatalError::CorruptCounter {
                value: self.word(USERS).load(Ordering::Acquire),
            }),
            Ok(_) => Ok(()),
            Err(_) => Err(SlabError::AlreadyDisposed),
        }
    }

    fn push(&self, index: u32) {
        let head = self.word(HEAD);
        let slot = self.word(index);
        let mut old_head = head.load(Ordering::Acquire);
        loop {
            let (first, tag) = unpack_head(old_head);
            slot.store(encode_link(first), Ordering::Release);
            let new_head = pack_head(index, tag.wrapping_add(1));
            match head.compare_exchange(old_head, new_head, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return,
                Err(observed) => old_head = observed,
            }
        }
    }

    /// Whether `ptr` points at one of this slab's counter words.
    #[inline]
    pub fn owns(&self, ptr: *const u32) -> bool {
        self.index_of(ptr).is_some()
    }

    fn index_of(&self, ptr: *const u32) -> Option<u32> {
        let distance = (ptr as usize).wrapping_sub(self.region.as_ptr() as usize);
        if !distance.is_multiple_of(WORD_SIZE) {
            return None;
        }
        let index = distance / WORD_SIZE;
        if index < FIRST_SLOT as usize || index >= self.words as usize {
            return None;
        }
        Some(index as u32)
    }

    /// Drop the slab's own hold and give the buffer back.
    ///
    /// Fails, handing the slab back, while counters are still checked out.
    pub fn dispose(mut self) -> Result<(), (Self, SlabError)> {
        let users = self.users();
        match users.decrement_if_one() {
            Ok(0) => {}
            Ok(count) => {
                return Err((
                    self,
                    SlabError::OutstandingCounters {
                        outstanding: count - 1,
                    },
                ));
            }
            Err(CounterError::Disposed) => return Err((self, SlabError::AlreadyDisposed)),
            Err(_) => fail_fast(FatalError::CorruptCounter {
                value: self.word(USERS).load(Ordering::Acquire),
            }),
        }

        if users.dispose().is_err() {
            // A racing acquire through another view revived the slab.
            fail_fast(FatalError::CorruptCounter {
                value: self.word(USERS).load(Ordering::Acquire),
            });
        }

        if let Some(span) = self.owner.take() {
            // SAFETY: allocated from this span in `new`, no counters remain.
            unsafe { span.free(self.region) };
        }
        Ok(())
    }
}

impl Drop for CounterSlab {
    fn drop(&mut self) {
        let Some(span) = self.owner.take() else {
            return;
        };
        let users = self.users();
        let reclaimable = match users.decrement_if_one() {
            Ok(0) => users.dispose().is_ok(),
            Err(CounterError::Disposed) => true,
            _ => false,
        };
        if reclaimable {
            // SAFETY: allocated from this span in `new`, no counters remain.
            unsafe { span.free(self.region) };
        } else {
            tracing::warn!(
                words = self.words,
                outstanding = users.count().saturating_sub(1),
                "leaking counter slab dropped with outstanding counters"
            );
        }
    }
}

impl fmt::Debug for CounterSlab {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CounterSlab")
            .field("base", &self.region.as_ptr())
            .field("capacity", &self.capacity())
            .field("free", &self.free_count())
            .field("owned", &self.owner.is_some())
            .finish()
    }
}

#[inline]
fn encode_link(next: u32) -> u32 {
    if next == 0 { LIST_END } else { !next }
}

#[inline]
fn pack_head(index: u32, tag: u32) -> u32 {
    (tag << INDEX_BITS) | (!index & INDEX_MASK)
}

#[inline]
fn unpack_head(head: u32) -> (u32, u32) {
    (!head & INDEX_MASK, head >> INDEX_BITS)
}

fn check_words(words: usize) -> Result<u32, SlabError> {
    if words < MIN_WORDS as usize || words > MAX_WORDS as usize {
        return Err(SlabError::InvalidCapacity { words });
    }
    Ok(words as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::{HeapRegion, HeapSpan};
    use std::collections::HashSet;
    use std::thread;

    fn heap_slab(words: usize) -> CounterSlab {
        CounterSlab::new(Arc::new(HeapSpan), words).unwrap()
    }

    fn drain(slab: &CounterSlab) -> Vec<BitPackedCounter> {
        core::iter::from_fn(|| slab.try_acquire()).collect()
    }

    #[test]
    fn too_small_is_rejected() {
        let err = CounterSlab::new(Arc::new(HeapSpan), 3).unwrap_err();
        assert_eq!(err, SlabError::InvalidCapacity { words: 3 });
    }

    #[test]
    fn acquires_exactly_capacity_counters() {
        let slab = heap_slab(16);
        assert_eq!(slab.capacity(), 14);
        assert_eq!(slab.free_count(), 14);

        let counters = drain(&slab);
        assert_eq!(counters.len(), 14);
        assert_eq!(slab.free_count(), 0);
        assert!(slab.try_acquire().is_none());

        // Fresh counters are free and hand out words in ascending order.
        let base = slab.region().as_ptr() as usize;
        for (i, counter) in counters.iter().enumerate() {
            assert_eq!(counter.count(), 0);
            assert_eq!(counter.as_ptr() as usize, base + (i + 2) * 4);
        }

        for counter in counters {
            counter.dispose().unwrap();
            slab.release(counter).unwrap();
        }
        assert_eq!(slab.free_count(), 14);
        slab.dispose().unwrap();
    }

    #[test]
    fn released_words_are_reused_lifo() {
        let slab = heap_slab(8);
        let a = slab.try_acquire().unwrap();
        let b = slab.try_acquire().unwrap();

        a.dispose().unwrap();
        slab.release(a).unwrap();
        b.dispose().unwrap();
        slab.release(b).unwrap();

        let first = slab.try_acquire().unwrap();
        let second = slab.try_acquire().unwrap();
        assert_eq!(first.as_ptr(), b.as_ptr());
        assert_eq!(second.as_ptr(), a.as_ptr());
        assert_eq!(first.count(), 0);
        assert!(!first.is_disposed());
    }

    #[test]
    fn release_requires_disposed_counter() {
        let slab = heap_slab(8);
        let counter = slab.try_acquire().unwrap();
        counter.increment().unwrap();
        assert_eq!(slab.release(counter), Err(SlabError::NotDisposed));
        assert_eq!(slab.free_count(), 5);
    }

    #[test]
    fn release_rejects_foreign_counter() {
        let slab = heap_slab(8);
        let other = heap_slab(8);
        let counter = other.try_acquire().unwrap();
        counter.dispose().unwrap();
        assert_eq!(slab.release(counter), Err(SlabError::NotFromThisSlab));
        assert!(!slab.owns(counter.as_ptr()));
        assert!(other.owns(counter.as_ptr()));

        // Liveness is checked before ownership.
        let live = other.try_acquire().unwrap();
        live.increment().unwrap();
        assert_eq!(slab.release(live), Err(SlabError::NotDisposed));
    }

    #[test]
    fn second_release_of_a_counter_fails() {
        let slab = heap_slab(4);
        let a = slab.try_acquire().unwrap();
        let b = slab.try_acquire().unwrap();
        b.increment().unwrap();
        a.dispose().unwrap();

        // The free list was empty, so `a` now holds the end-of-list link.
        slab.release(a).unwrap();
        assert!(!a.is_disposed());
        assert_eq!(slab.release(a), Err(SlabError::NotDisposed));
        assert_eq!(slab.free_count(), 1);

        let (slab, err) = slab.dispose().unwrap_err();
        assert_eq!(err, SlabError::OutstandingCounters { outstanding: 1 });

        assert_eq!(b.decrement(), Ok(0));
        b.dispose().unwrap();
        slab.release(b).unwrap();
        slab.dispose().unwrap();
    }

    #[test]
    fn racing_releases_admit_one() {
        let slab = heap_slab(8);
        for _ in 0..200 {
            let counter = slab.try_acquire().unwrap();
            counter.dispose().unwrap();
            let released = thread::scope(|s| {
                let a = s.spawn(|| slab.release(counter).is_ok());
                let b = s.spawn(|| slab.release(counter).is_ok());
                usize::from(a.join().unwrap()) + usize::from(b.join().unwrap())
            });
            assert_eq!(released, 1);
        }
        assert_eq!(slab.free_count(), slab.capacity());
    }

    #[test]
    fn dispose_with_outstanding_counters_fails() {
        let slab = heap_slab(8);
        let counter = slab.try_acquire().unwrap();

        let (slab, err) = slab.dispose().unwrap_err();
        assert_eq!(err, SlabError::OutstandingCounters { outstanding: 1 });

        counter.dispose().unwrap();
        slab.release(counter).unwrap();
        slab.dispose().unwrap();
    }

    #[test]
    fn attached_view_shares_the_free_list() {
        let owner = HeapRegion::new_zeroed(64);
        let slab = unsafe { CounterSlab::init(owner.region()) }.unwrap();
        let view = unsafe { CounterSlab::attach(owner.region()) }.unwrap();

        let counter = slab.try_acquire().unwrap();
        assert_eq!(view.free_count(), slab.capacity() - 1);

        counter.dispose().unwrap();
        view.release(counter).unwrap();
        assert_eq!(slab.free_count(), slab.capacity());

        view.dispose().unwrap();
        let err = unsafe { CounterSlab::attach(owner.region()) }.unwrap_err();
        assert_eq!(err, SlabError::AlreadyDisposed);
        let (_, err) = slab.dispose().unwrap_err();
        assert_eq!(err, SlabError::AlreadyDisposed);
    }

    #[test]
    #[should_panic(expected = "free list corrupted")]
    fn head_pointing_at_users_word_is_fatal() {
        let owner = HeapRegion::new_zeroed(64);
        let slab = unsafe { CounterSlab::init(owner.region()) }.unwrap();
        owner
            .region()
            .atomic_u32(0)
            .store(pack_head(USERS, 3), Ordering::Release);
        let _ = slab.try_acquire();
    }

    #[test]
    #[should_panic(expected = "free list corrupted")]
    fn overwritten_link_is_fatal() {
        let owner = HeapRegion::new_zeroed(64);
        let slab = unsafe { CounterSlab::init(owner.region()) }.unwrap();
        // word 3 is the next free word after 2; make it look like a live counter.
        owner.region().atomic_u32(12).store(1, Ordering::Release);
        let _ = slab.try_acquire();
    }

    #[test]
    fn concurrent_acquire_release_never_aliases() {
        let slab = Arc::new(heap_slab(64));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let slab = slab.clone();
                thread::spawn(move || {
                    let mut seen = 0usize;
                    for _ in 0..2_000 {
                        if let Some(counter) = slab.try_acquire() {
                            // A word handed to two threads at once would trip these.
                            assert_eq!(counter.increment(), Ok(1));
                            assert_eq!(counter.decrement(), Ok(0));
                            counter.dispose().unwrap();
                            slab.release(counter).unwrap();
                            seen += 1;
                        }
                    }
                    seen
                })
            })
            .collect();
        let total: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert!(total > 0);
        assert_eq!(slab.free_count(), slab.capacity());

        let addrs: HashSet<_> = drain(&slab).iter().map(|c| c.as_ptr() as usize).collect();
        assert_eq!(addrs.len(), slab.capacity() as usize);
    }
}
