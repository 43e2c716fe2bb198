//! Fair spinlock over a 64-bit word in shared memory.
//!
//! # Lock word
//!
//! ```text
//!  63   62     56 55                                  0
//! +----+---------+-------------------------------------+
//! |sign|   tag   |                wpid                 |
//! +----+---------+-------------------------------------+
//! ```
//!
//! - `0`: unlocked
//! - `+value`: held by `wpid`
//! - `-value`: held by `wpid`, and a waiter has claimed priority for the
//!   next hand-off
//!
//! The tag is a per-thread id in `1..=127`. It only helps when reading a lock
//! word in a debugger; ownership is decided by the wpid alone. Because the
//! tag is never 0, neither is a held lock word, even for `Wpid::from_raw(0)`.
//!
//! # Acquisition
//!
//! After a failed fast-path CAS a waiter spins, then yields. A waiter that
//! sees the sign already set defers to whoever set it for up to
//! [`SpinLockConfig::deference_window`]. After
//! [`SpinLockConfig::priority_threshold`] attempts a waiter flips the sign
//! itself and, when a [`LockNotifier`] is configured, parks on the holder's
//! semaphore until the holder's release notification arrives. Every
//! [`SpinLockConfig::unlock_check_threshold`] attempts a waiter with a
//! [`LivenessHelper`] checks that the holder is alive and steals the word
//! from a dead one.

mod liveness;
mod notify;
mod protocol;
mod waiter;

use core::fmt;
use core::ptr::NonNull;
use std::cell::Cell;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

pub use liveness::{LivenessHelper, OsProcessLiveness, process_exists};
pub use notify::{LocalBus, LockNotifier, MessageHandler, NotificationBus, WakeSemaphore};

use protocol::{Acquisition, DeadlockPolicy, Verdict};
use waiter::Pause;

use crate::region::Region;
use crate::wpid::Wpid;

const THREAD_TAG_SHIFT: u32 = 56;
const THREAD_TAG_MASK: i64 = 0x7F << THREAD_TAG_SHIFT;

/// Tuning for a [`SharedSpinLock`].
#[derive(Debug, Clone)]
pub struct SpinLockConfig {
    /// Attempts before a waiter claims priority over the holder.
    pub priority_threshold: u64,
    /// Attempts between liveness checks of the holder.
    pub unlock_check_threshold: u64,
    /// Attempts after which a blocking acquire gives up.
    pub deadlock_threshold: u64,
    /// How long a waiter defers to an earlier priority waiter.
    pub deference_window: Duration,
    /// Longest single park on a holder's semaphore.
    pub semaphore_timeout: Duration,
}

impl Default for SpinLockConfig {
    fn default() -> Self {
        Self {
            priority_threshold: 5,
            unlock_check_threshold: 500,
            deadlock_threshold: 200_000,
            deference_window: Duration::from_secs(1),
            semaphore_timeout: Duration::from_millis(40),
        }
    }
}

/// Errors returned by [`SharedSpinLock`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpinLockError {
    /// The spin limit ran out while `holder` held the lock.
    TimedOut { holder: Wpid },
    /// Acquisition passed the deadlock threshold and the liveness helper
    /// retired the current instance.
    Retired { holder: Wpid },
    /// `wpid` released a lock it does not hold.
    NotHeld { wpid: Wpid },
}

impl fmt::Display for SpinLockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TimedOut { holder } => write!(f, "lock still held by {holder}"),
            Self::Retired { holder } => {
                write!(f, "gave up waiting on {holder}, instance retired")
            }
            Self::NotHeld { wpid } => write!(f, "lock is not held by {wpid}"),
        }
    }
}

impl std::error::Error for SpinLockError {}

/// Thread tag for the `n`-th thread to take a lock.
#[inline]
fn tag_for(n: u64) -> i64 {
    (n % 0x7F + 1) as i64
}

fn thread_tag() -> i64 {
    static NEXT: AtomicU64 = AtomicU64::new(0);
    thread_local! {
        static TAG: Cell<Option<i64>> = const { Cell::new(None) };
    }
    TAG.with(|tag| match tag.get() {
        Some(id) => id,
        None => {
            let id = tag_for(NEXT.fetch_add(1, Ordering::Relaxed));
            tag.set(Some(id));
            id
        }
    })
}

/// Lock value for `wpid` acquiring on the current thread.
#[inline]
fn tag(wpid: Wpid) -> i64 {
    (thread_tag() << THREAD_TAG_SHIFT) | (wpid.as_u64() as i64 & !THREAD_TAG_MASK)
}

/// The holder named by a lock value, ignoring sign and tag.
#[inline]
pub(crate) fn holder_of(value: i64) -> Wpid {
    Wpid::from_raw((value.unsigned_abs() as i64 & !THREAD_TAG_MASK) as u64)
}

/// A fair, deadlock-tolerant spinlock keyed by [`Wpid`].
pub struct SharedSpinLock {
    word: NonNull<AtomicI64>,
    config: SpinLockConfig,
    notifier: Option<Arc<LockNotifier>>,
}

// SAFETY: the word is only accessed atomically.
unsafe impl Send for SharedSpinLock {}
unsafe impl Sync for SharedSpinLock {}

impl SharedSpinLock {
    /// Bind a lock to a raw word.
    ///
    /// Uses the default config and the global notifier, if one is installed.
    ///
    /// # Safety
    ///
    /// `ptr` must be 8-byte aligned, stay valid for the lifetime of the
    /// lock, and only ever be accessed atomically.
    pub unsafe fn from_ptr(ptr: *mut i64) -> Option<Self> {
        let word = NonNull::new(ptr)?;
        if !(ptr as usize).is_multiple_of(align_of::<AtomicI64>()) {
            return None;
        }
        Some(Self::bind(word.cast()))
    }

    /// Bind a lock to the word at `offset` in `region`.
    pub fn in_region(region: Region, offset: usize) -> Self {
        Self::bind(NonNull::from(region.atomic_i64(offset)))
    }

    fn bind(word: NonNull<AtomicI64>) -> Self {
        Self {
            word,
            config: SpinLockConfig::default(),
            notifier: LockNotifier::global().cloned(),
        }
    }

    pub fn with_config(mut self, config: SpinLockConfig) -> Self {
        self.config = config;
        self
    }

    /// Use `notifier` for the blocking fallback, or disable it with `None`.
    pub fn with_notifier(mut self, notifier: Option<Arc<LockNotifier>>) -> Self {
        self.notifier = notifier;
        self
    }

    #[inline]
    fn word(&self) -> &AtomicI64 {
        unsafe { self.word.as_ref() }
    }

    #[inline]
    fn cas(&self, current: i64, new: i64) -> Result<(), i64> {
        self.word()
            .compare_exchange(current, new, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
    }

    pub fn config(&self) -> &SpinLockConfig {
        &self.config
    }

    /// Raw lock value.
    #[inline]
    pub fn value(&self) -> i64 {
        self.word().load(Ordering::Acquire)
    }

    /// Current holder, if locked.
    pub fn holder(&self) -> Option<Wpid> {
        match self.value() {
            0 => None,
            value => Some(holder_of(value)),
        }
    }

    pub fn is_locked(&self) -> bool {
        self.value() != 0
    }

    /// Whether a waiter has claimed priority over the current holder.
    pub fn is_contended(&self) -> bool {
        self.value() < 0
    }

    /// Single CAS attempt.
    pub fn try_acquire(&self, wpid: Wpid) -> Result<(), SpinLockError> {
        self.cas(0, tag(wpid)).map_err(|observed| SpinLockError::TimedOut {
            holder: holder_of(observed),
        })
    }

    /// Acquire the lock for `wpid`, blocking the calling thread.
    ///
    /// `spin_limit == 0` waits without bound; otherwise the call returns
    /// [`SpinLockError::TimedOut`] once the waiter has taken more than
    /// `spin_limit` back-off steps.
    pub fn acquire(
        &self,
        wpid: Wpid,
        spin_limit: u64,
        helper: Option<&dyn LivenessHelper>,
    ) -> Result<(), SpinLockError> {
        let tagged = tag(wpid);
        let observed = match self.cas(0, tagged) {
            Ok(()) => return Ok(()),
            Err(observed) => observed,
        };

        let mut acquisition = Acquisition::new(
            self,
            wpid,
            tagged,
            spin_limit,
            helper,
            DeadlockPolicy::Enforce,
            observed,
        );
        loop {
            match acquisition.pause() {
                Pause::Spin(hints) => (0..hints).for_each(|_| core::hint::spin_loop()),
                Pause::Yield { sleep: false } => std::thread::yield_now(),
                Pause::Yield { sleep: true } => std::thread::sleep(Duration::from_millis(1)),
                Pause::Block(marked) => {
                    if let Some(notifier) = &self.notifier {
                        let holder = holder_of(marked);
                        let woken = notifier
                            .semaphore(holder)
                            .wait_timeout(self.config.semaphore_timeout);
                        self.forget_stale(notifier, holder, marked, woken);
                    }
                }
            }
            match acquisition.attempt() {
                Verdict::Acquired => return Ok(()),
                Verdict::Fail(err) => return Err(err),
                Verdict::Defer => std::thread::sleep(Duration::from_millis(1)),
                Verdict::Retry => {}
            }
        }
    }

    /// Acquire the lock for `wpid`, suspending the calling task.
    ///
    /// Follows [`SharedSpinLock::acquire`] except that it never gives up on
    /// its own: past the deadlock threshold it keeps waiting.
    pub async fn acquire_async(
        &self,
        wpid: Wpid,
        spin_limit: u64,
        helper: Option<&dyn LivenessHelper>,
    ) -> Result<(), SpinLockError> {
        let tagged = tag(wpid);
        let observed = match self.cas(0, tagged) {
            Ok(()) => return Ok(()),
            Err(observed) => observed,
        };

        let mut acquisition = Acquisition::new(
            self,
            wpid,
            tagged,
            spin_limit,
            helper,
            DeadlockPolicy::Ignore,
            observed,
        );
        loop {
            match acquisition.pause() {
                Pause::Spin(hints) => (0..hints).for_each(|_| core::hint::spin_loop()),
                Pause::Yield { sleep: false } => tokio::task::yield_now().await,
                Pause::Yield { sleep: true } => {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
                Pause::Block(marked) => {
                    if let Some(notifier) = &self.notifier {
                        let holder = holder_of(marked);
                        let semaphore = notifier.semaphore(holder);
                        let woken = semaphore.wait_async(self.config.semaphore_timeout).await;
                        self.forget_stale(notifier, holder, marked, woken);
                    }
                }
            }
            match acquisition.attempt() {
                Verdict::Acquired => return Ok(()),
                Verdict::Fail(err) => return Err(err),
                Verdict::Defer => tokio::time::sleep(Duration::from_millis(1)).await,
                Verdict::Retry => {}
            }
        }
    }

    /// Drop a semaphore registered after its holder's release was published.
    fn forget_stale(&self, notifier: &LockNotifier, holder: Wpid, marked: i64, woken: bool) {
        if !woken && self.value() != marked {
            notifier.forget(holder);
        }
    }

    /// Release a lock held by `wpid`.
    pub fn release(&self, wpid: Wpid) -> Result<(), SpinLockError> {
        if self.cas(tag(wpid), 0).is_ok() {
            return Ok(());
        }

        // Either a waiter flipped the sign or we acquired on another thread.
        let mut current = self.value();
        loop {
            if current == 0 || holder_of(current) != wpid {
                return Err(SpinLockError::NotHeld { wpid });
            }
            match self.cas(current, 0) {
                Ok(()) => {
                    if let Some(notifier) = &self.notifier {
                        notifier.publish_release(current);
                    }
                    return Ok(());
                }
                Err(observed) => current = observed,
            }
        }
    }

    /// Acquire without a spin limit and release when the guard drops.
    pub fn lock(
        &self,
        wpid: Wpid,
        helper: Option<&dyn LivenessHelper>,
    ) -> Result<SpinLockGuard<'_>, SpinLockError> {
        self.acquire(wpid, 0, helper)?;
        Ok(SpinLockGuard { lock: self, wpid })
    }
}

impl fmt::Debug for SharedSpinLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedSpinLock")
            .field("addr", &self.word)
            .field("holder", &self.holder())
            .field("contended", &self.is_contended())
            .finish()
    }
}

/// Releases a [`SharedSpinLock`] on drop.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct SpinLockGuard<'a> {
    lock: &'a SharedSpinLock,
    wpid: Wpid,
}

impl SpinLockGuard<'_> {
    pub fn wpid(&self) -> Wpid {
        self.wpid
    }
}

impl Drop for SpinLockGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.lock.release(self.wpid) {
            tracing::warn!(%err, "lock guard dropped after losing the lock");
        }
    }
}
