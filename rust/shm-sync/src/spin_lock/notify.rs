//! Release notifications for blocked lock waiters.
//!
//! A waiter that won priority over a holder may park on a semaphore keyed by
//! that holder's [`Wpid`] instead of spinning. The holder, on a contended
//! release, publishes the released lock value on a [`NotificationBus`]; every
//! [`LockNotifier`] subscribed to the bus wakes the matching semaphore. The
//! bus may span processes (a multicast channel, say), the semaphores never do.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::{Condvar, Mutex, RwLock};
use tokio::sync::Notify;

use super::holder_of;
use crate::wpid::Wpid;

/// Handler invoked with every key published on a bus.
pub type MessageHandler = Arc<dyn Fn(i64) + Send + Sync>;

/// Publish/subscribe channel carrying released lock values.
pub trait NotificationBus: Send + Sync {
    fn send(&self, key: i64);

    /// Register `handler` to be called for every key sent on the bus.
    fn subscribe(&self, handler: MessageHandler);
}

/// An in-process [`NotificationBus`].
#[derive(Default)]
pub struct LocalBus {
    handlers: RwLock<Vec<MessageHandler>>,
}

impl LocalBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl NotificationBus for LocalBus {
    fn send(&self, key: i64) {
        let handlers = self.handlers.read().clone();
        for handler in handlers {
            handler(key);
        }
    }

    fn subscribe(&self, handler: MessageHandler) {
        self.handlers.write().push(handler);
    }
}

/// A binary semaphore that can be waited on from threads and from tasks.
#[derive(Default)]
pub struct WakeSemaphore {
    signalled: Mutex<bool>,
    cond: Condvar,
    notify: Notify,
}

impl WakeSemaphore {
    pub fn release(&self) {
        *self.signalled.lock() = true;
        self.cond.notify_one();
        self.notify.notify_one();
    }

    /// Block until released or `timeout` passes. Returns whether it was released.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut signalled = self.signalled.lock();
        if !*signalled {
            let _ = self.cond.wait_for(&mut signalled, timeout);
        }
        std::mem::replace(&mut *signalled, false)
    }

    /// Suspend until released or `timeout` passes. Returns whether it was released.
    pub async fn wait_async(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.notify.notified())
            .await
            .is_ok()
    }
}

/// Routes release notifications from a bus to per-holder semaphores.
pub struct LockNotifier {
    bus: Arc<dyn NotificationBus>,
    semaphores: RwLock<HashMap<Wpid, Arc<WakeSemaphore>>>,
}

static GLOBAL: OnceLock<Arc<LockNotifier>> = OnceLock::new();

impl LockNotifier {
    /// Create a notifier and subscribe it to `bus`.
    pub fn new(bus: Arc<dyn NotificationBus>) -> Arc<Self> {
        Arc::new_cyclic(|weak: &std::sync::Weak<Self>| {
            let weak = weak.clone();
            bus.subscribe(Arc::new(move |key| {
                if let Some(notifier) = weak.upgrade() {
                    notifier.on_message(key);
                }
            }));
            Self {
                bus: bus.clone(),
                semaphores: RwLock::new(HashMap::new()),
            }
        })
    }

    /// Install the process-wide notifier on first call; later calls return
    /// the notifier already installed.
    pub fn install_global(bus: Arc<dyn NotificationBus>) -> &'static Arc<LockNotifier> {
        GLOBAL.get_or_init(|| Self::new(bus))
    }

    /// The process-wide notifier, if one was installed.
    pub fn global() -> Option<&'static Arc<LockNotifier>> {
        GLOBAL.get()
    }

    /// Wake whoever waits on the holder named by the lock value `key`.
    ///
    /// The entry leaves the registry: parked waiters keep their handle and
    /// see the release, later waiters on that holder register afresh. The
    /// registry therefore only holds holders with a pending priority claim.
    pub fn on_message(&self, key: i64) {
        let holder = holder_of(key);
        if let Some(semaphore) = self.semaphores.write().remove(&holder) {
            semaphore.release();
        }
    }

    pub(crate) fn publish_release(&self, tagged: i64) {
        self.bus.send(tagged);
    }

    /// Semaphore for `holder`, created on first use.
    pub fn semaphore(&self, holder: Wpid) -> Arc<WakeSemaphore> {
        if let Some(semaphore) = self.semaphores.read().get(&holder) {
            return semaphore.clone();
        }
        let mut semaphores = self.semaphores.write();
        let len = semaphores.len();
        let semaphore = semaphores.entry(holder).or_default().clone();
        if semaphores.len() != len {
            tracing::debug!(holder = %holder, registered = semaphores.len(), "registered lock semaphore");
        }
        semaphore
    }

    /// Drop the semaphore of a holder that will never release again.
    pub(crate) fn forget(&self, holder: Wpid) {
        self.semaphores.write().remove(&holder);
    }

    /// Number of holders with a registered semaphore.
    pub fn registered(&self) -> usize {
        self.semaphores.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Instant;

    #[test]
    fn local_bus_fans_out() {
        let bus = LocalBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let hits = hits.clone();
            bus.subscribe(Arc::new(move |key| {
                assert_eq!(key, -7);
                hits.fetch_add(1, Ordering::SeqCst);
            }));
        }
        bus.send(-7);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn wait_times_out_without_release() {
        let semaphore = WakeSemaphore::default();
        let start = Instant::now();
        assert!(!semaphore.wait_timeout(Duration::from_millis(20)));
        assert!(start.elapsed() >= Duration::from_millis(15));
    }

    #[test]
    fn release_before_wait_is_not_lost() {
        let semaphore = WakeSemaphore::default();
        semaphore.release();
        assert!(semaphore.wait_timeout(Duration::from_secs(5)));
        assert!(!semaphore.wait_timeout(Duration::from_millis(1)));
    }

    #[test]
    fn bus_message_wakes_the_holders_semaphore() {
        let bus = LocalBus::new();
        let notifier = LockNotifier::new(bus.clone());
        let holder = Wpid::create();
        let semaphore = notifier.semaphore(holder);
        assert_eq!(notifier.registered(), 1);

        let waiter = {
            let semaphore = semaphore.clone();
            thread::spawn(move || semaphore.wait_timeout(Duration::from_secs(10)))
        };
        thread::sleep(Duration::from_millis(20));
        // Release notifications carry the negative, tagged lock value.
        bus.send(-((5i64 << 56) | holder.as_u64() as i64));
        assert!(waiter.join().unwrap());
        assert_eq!(notifier.registered(), 0);
    }

    #[test]
    fn registry_only_keeps_pending_holders() {
        let bus = LocalBus::new();
        let notifier = LockNotifier::new(bus.clone());
        let parked = Wpid::create();
        let _semaphore = notifier.semaphore(parked);

        for _ in 0..100 {
            let holder = Wpid::create();
            let semaphore = notifier.semaphore(holder);
            bus.send(holder.as_u64() as i64);
            assert!(semaphore.wait_timeout(Duration::from_millis(1)));
        }
        // Releases from holders nobody waits on leave no trace.
        bus.send(Wpid::create().as_u64() as i64);
        assert_eq!(notifier.registered(), 1);

        notifier.forget(parked);
        assert_eq!(notifier.registered(), 0);
    }

    #[tokio::test]
    async fn async_wait_is_released_by_notification() {
        let bus = LocalBus::new();
        let notifier = LockNotifier::new(bus.clone());
        let holder = Wpid::create();
        let semaphore = notifier.semaphore(holder);

        let task = tokio::spawn({
            let semaphore = semaphore.clone();
            async move { semaphore.wait_async(Duration::from_secs(10)).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        notifier.on_message(holder.as_u64() as i64);
        assert!(task.await.unwrap());
    }
}
