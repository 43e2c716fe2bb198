//! Raw-memory synchronization primitives for shared memory.
//!
//! Everything in this crate operates on plain memory words reached through a
//! stable address, never on kernel objects, so the state can live in an
//! off-heap buffer or in a mapping shared between processes.
//!
//! # Primitives
//!
//! - [`BitPackedCounter`]: a 24-bit reference count packed into a 32-bit word,
//!   with 8 owner flag bits and a `Disposed` sentinel
//! - [`CounterSlab`]: a fixed buffer of counter words with an intrusive,
//!   complement-encoded free list
//! - [`CounterAllocator`]: a growable set of slabs handing out counters
//! - [`Wpid`]: a wide process id naming a logical instance across processes
//! - [`SharedSpinLock`]: a fair spinlock over a 64-bit word keyed by [`Wpid`],
//!   with priority hand-off and recovery from dead holders
//!
//! # Failure model
//!
//! Misuse that leaves shared state consistent is reported through `Result`.
//! Anything that means a shared word holds a bit pattern it never should
//! (corruption, a reentrant lock, a deadlock with no one to recover it) goes
//! through [`fatal::fail_fast`] and aborts the process, because other
//! processes may already be reading the broken word.

pub mod counter;
pub mod counter_allocator;
pub mod counter_slab;
pub mod fatal;
pub mod region;
pub mod spin_lock;
pub mod wpid;

pub use counter::{BitPackedCounter, CounterError};
pub use counter_allocator::{CounterAllocator, CounterAllocatorConfig};
pub use counter_slab::{CounterSlab, SlabError};
pub use fatal::FatalError;
#[cfg(unix)]
pub use region::SharedMmapSpan;
pub use region::{HeapRegion, HeapSpan, OffHeapSpan, Region};
pub use spin_lock::{
    LivenessHelper, LocalBus, LockNotifier, NotificationBus, OsProcessLiveness, SharedSpinLock,
    SpinLockConfig, SpinLockError, SpinLockGuard,
};
pub use wpid::Wpid;
