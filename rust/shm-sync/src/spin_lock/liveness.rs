//! Liveness of lock holders.
//!
//! A holder that crashes while holding a lock in shared memory never releases
//! it, and no OS mechanism does it on the holder's behalf. Waiters therefore
//! ask a [`LivenessHelper`] from time to time whether the holder still exists
//! and steal the lock word when it does not.

use std::collections::HashSet;
use std::sync::OnceLock;

use parking_lot::RwLock;

use crate::wpid::Wpid;

/// Answers liveness questions for [`SharedSpinLock`](super::SharedSpinLock)
/// waiters.
pub trait LivenessHelper: Send + Sync {
    /// The logical instance this helper speaks for.
    fn current_wpid(&self) -> Wpid;

    /// Whether `wpid` is still alive.
    ///
    /// Implementations should consult the instance heartbeat first and fall
    /// back to checking that the OS process exists.
    fn is_alive(&self, wpid: Wpid) -> bool;

    /// Retire the current instance. Called when acquisition gave up after
    /// the deadlock threshold.
    fn suicide(&self);

    /// A waiter stole a lock from the dead holder `dead`.
    fn on_force_unlock(&self, dead: Wpid) {
        let _ = dead;
    }

    /// Let other threads of the same instance wait on a lock the instance
    /// already holds instead of failing fast.
    fn allow_reentrant(&self) -> bool {
        false
    }
}

fn retired() -> &'static RwLock<HashSet<Wpid>> {
    static RETIRED: OnceLock<RwLock<HashSet<Wpid>>> = OnceLock::new();
    RETIRED.get_or_init(|| RwLock::new(HashSet::new()))
}

/// Whether an OS process with this pid exists.
#[cfg(unix)]
pub fn process_exists(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // SAFETY: signal 0 only performs the existence and permission checks.
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn process_exists(_pid: u32) -> bool {
    true
}

/// Liveness from a process-wide set of retired instances plus OS process
/// existence.
///
/// An instance of the current process is alive until it is retired through
/// [`LivenessHelper::suicide`]. Instances of other processes are alive while
/// their process exists.
#[derive(Debug, Clone)]
pub struct OsProcessLiveness {
    wpid: Wpid,
    allow_reentrant: bool,
}

impl OsProcessLiveness {
    /// A helper for a freshly minted instance.
    pub fn new() -> Self {
        Self::for_instance(Wpid::create())
    }

    pub fn for_instance(wpid: Wpid) -> Self {
        Self {
            wpid,
            allow_reentrant: false,
        }
    }

    pub fn allowing_reentrant(mut self, allow: bool) -> Self {
        self.allow_reentrant = allow;
        self
    }

    /// Whether `wpid` was retired in this process.
    pub fn is_retired(wpid: Wpid) -> bool {
        retired().read().contains(&wpid)
    }
}

impl Default for OsProcessLiveness {
    fn default() -> Self {
        Self::new()
    }
}

impl LivenessHelper for OsProcessLiveness {
    fn current_wpid(&self) -> Wpid {
        self.wpid
    }

    fn is_alive(&self, wpid: Wpid) -> bool {
        if Self::is_retired(wpid) {
            return false;
        }
        if wpid.is_current_process() {
            return true;
        }
        process_exists(wpid.pid())
    }

    fn suicide(&self) {
        tracing::info!(wpid = %self.wpid, "retiring instance");
        retired().write().insert(self.wpid);
    }

    fn on_force_unlock(&self, dead: Wpid) {
        tracing::warn!(dead = %dead, by = %self.wpid, "recovered lock from dead holder");
    }

    fn allow_reentrant(&self) -> bool {
        self.allow_reentrant
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_process_instances_are_alive_until_retired() {
        let helper = OsProcessLiveness::new();
        let me = helper.current_wpid();
        assert!(helper.is_alive(me));

        helper.suicide();
        assert!(OsProcessLiveness::is_retired(me));
        assert!(!helper.is_alive(me));
        assert!(helper.is_alive(Wpid::create()));
    }

    #[cfg(unix)]
    #[test]
    fn own_process_exists() {
        assert!(process_exists(std::process::id()));
        assert!(!process_exists(0));
    }
}
