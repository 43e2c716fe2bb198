//! Growable pool of counters spread over several slabs ("buckets").
//!
//! Acquisition scans the buckets without taking any lock. Only when every
//! bucket is exhausted does a caller take the growth lock, re-scan, and add a
//! bucket, doubling the bucket array when it has no empty slot left. Buckets
//! are never freed while the allocator lives.

use std::sync::{Arc, OnceLock};

use parking_lot::{Mutex, RwLock};

use crate::counter::BitPackedCounter;
use crate::counter_slab::{CounterSlab, MAX_WORDS, SlabError};
use crate::region::{HeapSpan, OffHeapSpan};

/// Environment variable overriding [`CounterAllocatorConfig::bucket_size`].
pub const BUCKET_SIZE_ENV: &str = "SHM_SYNC_COUNTER_BUCKET_SIZE";

/// Smallest accepted bucket size, in words.
pub const MIN_BUCKET_SIZE: usize = 8;

/// Configuration for a [`CounterAllocator`].
#[derive(Debug, Clone)]
pub struct CounterAllocatorConfig {
    /// Words per bucket (power of two, at least [`MIN_BUCKET_SIZE`]).
    /// Two words of each bucket are slab bookkeeping.
    pub bucket_size: usize,
    /// Initial length of the bucket array. Only the first bucket is created
    /// eagerly.
    pub initial_buckets: usize,
}

impl Default for CounterAllocatorConfig {
    fn default() -> Self {
        Self {
            bucket_size: 1024,
            initial_buckets: 4,
        }
    }
}

impl CounterAllocatorConfig {
    /// Defaults, with the bucket size taken from [`BUCKET_SIZE_ENV`] when it
    /// holds a valid value.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(raw) = std::env::var(BUCKET_SIZE_ENV) {
            match raw.trim().parse::<usize>() {
                Ok(size) if is_valid_bucket_size(size) => config.bucket_size = size,
                _ => tracing::warn!(
                    value = %raw,
                    default = config.bucket_size,
                    "ignoring invalid {BUCKET_SIZE_ENV}"
                ),
            }
        }
        config
    }
}

fn is_valid_bucket_size(size: usize) -> bool {
    size.is_power_of_two() && (MIN_BUCKET_SIZE..=MAX_WORDS as usize).contains(&size)
}

type Buckets = Arc<[Option<Arc<CounterSlab>>]>;

/// Process-wide source of [`BitPackedCounter`]s.
///
/// Use [`CounterAllocator::global`] for the shared instance, or construct a
/// private one for isolation.
pub struct CounterAllocator {
    bucket_size: usize,
    span: Arc<dyn OffHeapSpan>,
    /// Copy-on-write snapshot; readers clone the `Arc` and scan unlocked.
    buckets: RwLock<Buckets>,
    grow: Mutex<()>,
}

impl CounterAllocator {
    /// Create an allocator backed by the global heap.
    ///
    /// # Panics
    ///
    /// If the configured bucket size is not a power of two in
    /// `MIN_BUCKET_SIZE..=MAX_WORDS`.
    pub fn new(config: CounterAllocatorConfig) -> Self {
        Self::with_span(config, Arc::new(HeapSpan))
    }

    /// Create an allocator whose buckets come from `span`.
    pub fn with_span(config: CounterAllocatorConfig, span: Arc<dyn OffHeapSpan>) -> Self {
        assert!(
            is_valid_bucket_size(config.bucket_size),
            "bucket size must be a power of two in {MIN_BUCKET_SIZE}..={MAX_WORDS}, got {}",
            config.bucket_size
        );
        let mut allocator = Self {
            bucket_size: config.bucket_size,
            span,
            buckets: RwLock::new(Arc::from(Vec::new())),
            grow: Mutex::new(()),
        };
        let mut slots = vec![None; config.initial_buckets.max(1)];
        slots[0] = Some(allocator.new_bucket());
        allocator.buckets = RwLock::new(Arc::from(slots));
        allocator
    }

    /// The lazily created process-wide allocator, configured from the
    /// environment on first use.
    pub fn global() -> &'static CounterAllocator {
        static GLOBAL: OnceLock<CounterAllocator> = OnceLock::new();
        GLOBAL.get_or_init(|| CounterAllocator::new(CounterAllocatorConfig::from_env()))
    }

    fn new_bucket(&self) -> Arc<CounterSlab> {
        match CounterSlab::new(self.span.clone(), self.bucket_size) {
            Ok(slab) => Arc::new(slab),
            Err(err) => unreachable!("bucket size validated at construction: {err}"),
        }
    }

    #[inline]
    fn snapshot(&self) -> Buckets {
        self.buckets.read().clone()
    }

    fn scan(buckets: &Buckets) -> Option<BitPackedCounter> {
        buckets
            .iter()
            .flatten()
            .find_map(|bucket| bucket.try_acquire())
    }

    /// Take a free counter, adding a bucket if every bucket is exhausted.
    pub fn acquire_counter(&self) -> BitPackedCounter {
        if let Some(counter) = Self::scan(&self.snapshot()) {
            return counter;
        }
        self.acquire_slow()
    }

    #[cold]
    fn acquire_slow(&self) -> BitPackedCounter {
        let _grow = self.grow.lock();

        // Someone may have released a counter or grown the array meanwhile.
        let snapshot = self.snapshot();
        if let Some(counter) = Self::scan(&snapshot) {
            return counter;
        }

        // Take our counter before the bucket becomes visible to other scans.
        let bucket = self.new_bucket();
        let Some(counter) = bucket.try_acquire() else {
            unreachable!("fresh bucket has no free counter");
        };

        let mut slots = snapshot.to_vec();
        match slots.iter().position(Option::is_none) {
            Some(free) => slots[free] = Some(bucket),
            None => {
                let len = slots.len();
                slots.resize(len * 2, None);
                slots[len] = Some(bucket);
                tracing::debug!(from = len, to = len * 2, "doubled counter bucket array");
            }
        }
        let buckets = slots.iter().flatten().count();
        *self.buckets.write() = Arc::from(slots);
        tracing::debug!(buckets, bucket_size = self.bucket_size, "added counter bucket");

        counter
    }

    /// Return a disposed counter to the bucket that issued it.
    pub fn release_counter(&self, counter: BitPackedCounter) -> Result<(), SlabError> {
        let addr = counter.as_ptr() as usize;
        let extent = self.bucket_size * size_of::<u32>();
        for bucket in self.snapshot().iter().flatten() {
            let base = bucket.region().as_ptr() as usize;
            if addr.wrapping_sub(base) < extent {
                return bucket.release(counter);
            }
        }
        Err(SlabError::AlienCounter)
    }

    /// Words per bucket.
    #[inline]
    pub fn bucket_size(&self) -> usize {
        self.bucket_size
    }

    /// Number of buckets created so far.
    pub fn bucket_count(&self) -> usize {
        self.snapshot().iter().flatten().count()
    }

    /// Length of the bucket array, including empty slots.
    pub fn bucket_slots(&self) -> usize {
        self.snapshot().len()
    }

    /// Free counters across all buckets.
    pub fn free_count(&self) -> usize {
        self.snapshot()
            .iter()
            .flatten()
            .map(|bucket| bucket.free_count() as usize)
            .sum()
    }
}

impl std::fmt::Debug for CounterAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CounterAllocator")
            .field("bucket_size", &self.bucket_size)
            .field("buckets", &self.bucket_count())
            .field("slots", &self.bucket_slots())
            .finish()
    }
}
