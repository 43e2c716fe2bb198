//! Adaptive spin/yield back-off.
//!
//! The first few steps busy-spin with a doubling number of pause hints, after
//! that every step gives the CPU away, with a short sleep every
//! [`SLEEP_EVERY`]th yield so a waiter on an oversubscribed machine cannot
//! starve the holder.

/// Steps that busy-spin before the waiter starts yielding.
pub(crate) const YIELD_THRESHOLD: u64 = 10;

/// Every n-th yielding step sleeps instead.
pub(crate) const SLEEP_EVERY: u64 = 20;

/// One back-off step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Pause {
    /// Busy-spin for this many pause hints.
    Spin(u32),
    /// Give up the time slice; `sleep` asks for a short sleep instead.
    Yield { sleep: bool },
    /// Wait on the semaphore of this lock value's holder.
    Block(i64),
}

#[derive(Debug, Default)]
pub(crate) struct SpinWaiter {
    count: u64,
}

impl SpinWaiter {
    /// Steps taken so far.
    #[inline]
    pub(crate) fn count(&self) -> u64 {
        self.count
    }

    #[inline]
    pub(crate) fn next_will_yield(&self) -> bool {
        self.count >= YIELD_THRESHOLD
    }

    /// Advance without producing a pause (the caller waits some other way).
    #[inline]
    pub(crate) fn skip(&mut self) {
        self.count += 1;
    }

    pub(crate) fn next(&mut self) -> Pause {
        let count = self.count;
        self.count += 1;
        if count < YIELD_THRESHOLD {
            Pause::Spin(1 << count)
        } else {
            let yields = count - YIELD_THRESHOLD + 1;
            Pause::Yield {
                sleep: yields.is_multiple_of(SLEEP_EVERY),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spins_then_yields() {
        let mut waiter = SpinWaiter::default();
        for i in 0..YIELD_THRESHOLD {
            assert!(!waiter.next_will_yield());
            assert_eq!(waiter.next(), Pause::Spin(1 << i));
        }
        assert!(waiter.next_will_yield());

        let sleeps = (0..SLEEP_EVERY * 3)
            .filter(|_| waiter.next() == Pause::Yield { sleep: true })
            .count();
        assert_eq!(sleeps, 3);
        assert_eq!(waiter.count(), YIELD_THRESHOLD + SLEEP_EVERY * 3);
    }
}
