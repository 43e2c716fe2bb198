//! Wide process ids.
//!
//! A [`Wpid`] names a *logical instance* rather than an OS process: the OS
//! pid is combined with a per-process instance counter, so two instances in
//! one process, or two containers that both run as pid 1, still get
//! different ids.
//!
//! ```text
//! wpid = pid * 10_000_000_000 + instance_id
//! ```
//!
//! The multiplier is decimal so a wpid stays readable in logs: the last ten
//! digits are the instance, the rest is the pid.

use core::fmt;
#[cfg(unix)]
use std::sync::Once;
use std::sync::atomic::{AtomicU32, Ordering};

use static_assertions::const_assert;

/// Multiplier separating the pid from the instance id.
pub const PID_MULTIPLIER: u64 = 10_000_000_000;

/// Largest pid that still leaves the top byte of a lock word free for the
/// thread tag and sign.
pub const MAX_PID: u32 = ((1u64 << 56) / PID_MULTIPLIER) as u32 - 1;

// Every instance id fits below the multiplier.
const_assert!((u32::MAX as u64) < PID_MULTIPLIER);
// Linux caps pid_max at 2^22.
const_assert!(MAX_PID as u64 >= 1 << 22);

static INSTANCE: AtomicU32 = AtomicU32::new(0);

/// Cached OS pid, 0 until first use. A forked child starts over.
static PID: AtomicU32 = AtomicU32::new(0);

#[cfg(unix)]
unsafe extern "C" fn forget_pid() {
    PID.store(0, Ordering::Relaxed);
}

fn current_pid() -> u32 {
    match PID.load(Ordering::Relaxed) {
        0 => {
            // Register before caching so a fork can never inherit a pid
            // without also clearing it.
            #[cfg(unix)]
            {
                static AT_FORK: Once = Once::new();
                AT_FORK.call_once(|| {
                    // SAFETY: the child hook only stores to an atomic.
                    let rc = unsafe { libc::pthread_atfork(None, None, Some(forget_pid)) };
                    if rc != 0 {
                        tracing::warn!(rc, "could not register fork hook, forked children may reuse the parent pid");
                    }
                });
            }
            let pid = std::process::id();
            PID.store(pid, Ordering::Relaxed);
            pid
        }
        pid => pid,
    }
}

/// A wide process id. Equality is bitwise.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Wpid(u64);

static_assertions::assert_eq_size!(Wpid, u64);

impl Wpid {
    /// Mint a new id for a logical instance of the current process.
    pub fn create() -> Self {
        let instance = INSTANCE.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        Self::from_parts(current_pid(), instance)
    }

    /// Compose an id from its parts.
    ///
    /// # Panics
    ///
    /// If `pid` exceeds [`MAX_PID`].
    pub fn from_parts(pid: u32, instance_id: u32) -> Self {
        assert!(pid <= MAX_PID, "pid {pid} does not fit a wide process id");
        Self(pid as u64 * PID_MULTIPLIER + instance_id as u64)
    }

    /// Reinterpret a raw value, e.g. one read out of a lock word.
    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// OS process id.
    #[inline]
    pub const fn pid(self) -> u32 {
        (self.0 / PID_MULTIPLIER) as u32
    }

    /// Logical instance within the process.
    #[inline]
    pub const fn instance_id(self) -> u32 {
        (self.0 % PID_MULTIPLIER) as u32
    }

    /// Whether the id was minted by the current process.
    #[inline]
    pub fn is_current_process(self) -> bool {
        self.pid() == current_pid()
    }
}

impl fmt::Debug for Wpid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Wpid({}:{})", self.pid(), self.instance_id())
    }
}

impl fmt::Display for Wpid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.pid(), self.instance_id())
    }
}

impl From<Wpid> for u64 {
    fn from(wpid: Wpid) -> Self {
        wpid.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parts_round_trip() {
        let wpid = Wpid::from_parts(4_194_303, u32::MAX);
        assert_eq!(wpid.pid(), 4_194_303);
        assert_eq!(wpid.instance_id(), u32::MAX);
        assert_eq!(wpid.to_string(), "4194303:4294967295");
    }

    #[test]
    fn created_ids_belong_to_this_process() {
        let a = Wpid::create();
        let b = Wpid::create();
        assert_ne!(a, b);
        assert_eq!(a.pid(), std::process::id());
        assert!(a.is_current_process());
        assert!(b.instance_id() > a.instance_id());
    }

    #[test]
    fn fits_below_the_thread_tag() {
        let wpid = Wpid::from_parts(MAX_PID, u32::MAX);
        assert!(wpid.as_u64() < 1 << 56);
    }

    #[test]
    #[should_panic(expected = "does not fit")]
    fn oversized_pid_is_rejected() {
        Wpid::from_parts(MAX_PID + 1, 0);
    }
}
