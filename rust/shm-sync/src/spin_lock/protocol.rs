//! The contended-acquire state machine.
//!
//! Both the blocking and the async acquire drive the same [`Acquisition`]:
//! the driver asks for a [`Pause`], performs it in its own way (sleeping a
//! thread or suspending a task), then lets the state machine make one
//! attempt and act on the [`Verdict`].

use std::time::Instant;

use super::waiter::{Pause, SpinWaiter};
use super::{LivenessHelper, SharedSpinLock, SpinLockError, holder_of};
use crate::fatal::{FatalError, fail_fast};
use crate::wpid::Wpid;

/// Whether running past the deadlock threshold ends the acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DeadlockPolicy {
    /// Retire through the helper, or fail fast without one.
    Enforce,
    /// Keep waiting. The async acquire has no deadlock branch.
    Ignore,
}

/// Outcome of one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Verdict {
    Acquired,
    Retry,
    /// Back off: an earlier waiter already holds priority over the holder.
    Defer,
    Fail(SpinLockError),
}

pub(crate) struct Acquisition<'a> {
    lock: &'a SharedSpinLock,
    wpid: Wpid,
    tagged: i64,
    spin_limit: u64,
    helper: Option<&'a dyn LivenessHelper>,
    deadlock: DeadlockPolicy,
    /// Attempts so far.
    n: u64,
    /// The lock value we flipped negative, while it is still the holder.
    priority: Option<i64>,
    deferring_since: Option<Instant>,
    deference_abandoned: bool,
    observed: i64,
    waiter: SpinWaiter,
}

impl<'a> Acquisition<'a> {
    pub(crate) fn new(
        lock: &'a SharedSpinLock,
        wpid: Wpid,
        tagged: i64,
        spin_limit: u64,
        helper: Option<&'a dyn LivenessHelper>,
        deadlock: DeadlockPolicy,
        observed: i64,
    ) -> Self {
        Self {
            lock,
            wpid,
            tagged,
            spin_limit,
            helper,
            deadlock,
            n: 0,
            priority: None,
            deferring_since: None,
            deference_abandoned: false,
            observed,
            waiter: SpinWaiter::default(),
        }
    }

    #[inline]
    fn have_priority(&self) -> bool {
        self.priority.is_some()
    }

    /// The pause to take before the next attempt.
    pub(crate) fn pause(&mut self) -> Pause {
        if let Some(marked) = self.priority
            && self.waiter.next_will_yield()
            && self.lock.notifier.is_some()
            && self.lock.value() == marked
        {
            self.waiter.skip();
            return Pause::Block(marked);
        }
        self.waiter.next()
    }

    /// One CAS attempt plus the bookkeeping that follows a miss.
    pub(crate) fn attempt(&mut self) -> Verdict {
        let observed = match self.lock.cas(0, self.tagged) {
            Ok(()) => return Verdict::Acquired,
            Err(observed) => observed,
        };
        self.observed = observed;
        if observed == 0 {
            // Released between our load and CAS.
            return Verdict::Retry;
        }

        let holder = holder_of(observed);
        if holder == self.wpid && !self.helper.is_some_and(|h| h.allow_reentrant()) {
            fail_fast(FatalError::ReentrantLock {
                wpid: self.wpid.as_u64(),
            });
        }
        self.n += 1;

        // The value we marked was released or stolen; compete again.
        if let Some(marked) = self.priority
            && marked != observed
        {
            self.priority = None;
        }

        let lock = self.lock;
        let config = &lock.config;

        let mut defer = false;
        if observed < 0 && !self.have_priority() && !self.deference_abandoned {
            let since = *self.deferring_since.get_or_insert_with(Instant::now);
            if since.elapsed() < config.deference_window {
                defer = true;
            } else {
                self.abandon_deference(holder);
            }
        } else if observed > 0 {
            self.deferring_since = None;
        }

        if self.n >= config.priority_threshold
            && observed > 0
            && !self.have_priority()
            && lock.cas(observed, -observed).is_ok()
        {
            self.priority = Some(-observed);
            self.observed = -observed;
            tracing::trace!(wpid = %self.wpid, holder = %holder, "claimed lock priority");
        }

        if let Some(helper) = self.helper
            && self.n.is_multiple_of(config.unlock_check_threshold)
        {
            let current = self.observed;
            if !helper.is_alive(holder) && lock.cas(current, self.tagged).is_ok() {
                tracing::warn!(wpid = %self.wpid, dead = %holder, "force-unlocked lock held by dead instance");
                if let Some(notifier) = &lock.notifier {
                    notifier.forget(holder);
                }
                helper.on_force_unlock(holder);
                return Verdict::Acquired;
            }
        }

        if self.deadlock == DeadlockPolicy::Enforce && self.n > config.deadlock_threshold {
            match self.helper {
                Some(helper) => {
                    tracing::info!(
                        wpid = %self.wpid,
                        holder = %holder,
                        iterations = self.n,
                        "giving up on lock, retiring instance"
                    );
                    helper.suicide();
                    return Verdict::Fail(SpinLockError::Retired { holder });
                }
                None => fail_fast(FatalError::Deadlock {
                    holder: holder.as_u64(),
                    iterations: self.n,
                }),
            }
        }

        if self.spin_limit > 0 && self.waiter.count() > self.spin_limit {
            return Verdict::Fail(SpinLockError::TimedOut { holder });
        }

        if defer { Verdict::Defer } else { Verdict::Retry }
    }

    /// Stop deferring to a priority waiter that has not been served within
    /// the window, and become eligible to claim priority right away.
    fn abandon_deference(&mut self, holder: Wpid) {
        self.deference_abandoned = true;
        self.n = self.n.max(self.lock.config.priority_threshold);
        tracing::warn!(
            wpid = %self.wpid,
            holder = %holder,
            "lock waiter stopped deferring to the priority waiter"
        );
    }
}
