//! Stable-address memory regions.
//!
//! A [`Region`] is a capability over a span of memory that never moves for
//! as long as its owner keeps it alive. Every primitive in this crate reaches
//! its words through a `Region` plus a byte offset, never through a Rust
//! reference to an owned value, so the same words can be mapped into other
//! processes.

use std::alloc::{Layout, alloc_zeroed, dealloc, handle_alloc_error};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicI64, AtomicU32};

/// Alignment of every region handed out by the spans in this module.
pub const REGION_ALIGN: usize = 64;

/// A raw, non-owning view of a stable memory span.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    base: NonNull<u8>,
    len: usize,
}

unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    /// Wrap a raw span.
    ///
    /// # Safety
    ///
    /// `base..base + len` must stay valid and must not move for every use of
    /// the returned region and of anything bound into it.
    pub unsafe fn from_raw(base: *mut u8, len: usize) -> Option<Self> {
        NonNull::new(base).map(|base| Self { base, len })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    /// Pointer to `offset` bytes into the region.
    ///
    /// # Panics
    ///
    /// If `offset` is past the end of the region.
    #[inline]
    pub fn offset(&self, offset: usize) -> *mut u8 {
        assert!(offset <= self.len, "offset {offset} outside region of {} bytes", self.len);
        unsafe { self.base.as_ptr().add(offset) }
    }

    /// The 32-bit atomic word at `offset`.
    ///
    /// # Panics
    ///
    /// If the word is out of bounds or misaligned.
    #[inline]
    pub fn atomic_u32(&self, offset: usize) -> &AtomicU32 {
        self.check_word::<AtomicU32>(offset);
        unsafe { AtomicU32::from_ptr(self.offset(offset) as *mut u32) }
    }

    /// The 64-bit atomic word at `offset`.
    ///
    /// # Panics
    ///
    /// If the word is out of bounds or misaligned.
    #[inline]
    pub fn atomic_i64(&self, offset: usize) -> &AtomicI64 {
        self.check_word::<AtomicI64>(offset);
        unsafe { AtomicI64::from_ptr(self.offset(offset) as *mut i64) }
    }

    fn check_word<T>(&self, offset: usize) {
        assert!(
            offset + size_of::<T>() <= self.len,
            "word at {offset} outside region of {} bytes",
            self.len
        );
        assert!(
            (self.base.as_ptr() as usize + offset).is_multiple_of(align_of::<T>()),
            "word at {offset} is misaligned"
        );
    }
}

/// A zeroed, 64-byte aligned heap allocation that owns its region.
pub struct HeapRegion {
    region: Region,
    layout: Layout,
}

unsafe impl Send for HeapRegion {}
unsafe impl Sync for HeapRegion {}

impl HeapRegion {
    pub fn new_zeroed(len: usize) -> Self {
        let layout = Layout::from_size_align(len.max(1), REGION_ALIGN)
            .expect("region layout overflows isize");
        let base = unsafe { alloc_zeroed(layout) };
        let Some(base) = NonNull::new(base) else {
            handle_alloc_error(layout);
        };
        Self {
            region: Region { base, len },
            layout,
        }
    }

    #[inline]
    pub fn region(&self) -> Region {
        self.region
    }
}

impl Drop for HeapRegion {
    fn drop(&mut self) {
        unsafe { dealloc(self.region.as_ptr(), self.layout) };
    }
}

/// Source of stable buffers for slabs.
pub trait OffHeapSpan: Send + Sync {
    /// Allocate a zeroed buffer of `len` bytes aligned to [`REGION_ALIGN`].
    fn allocate(&self, len: usize) -> Region;

    /// Return a buffer obtained from [`OffHeapSpan::allocate`].
    ///
    /// # Safety
    ///
    /// `region` must come from this span and must not be used afterwards.
    unsafe fn free(&self, region: Region);
}

/// Allocates slab buffers from the global heap.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeapSpan;

impl OffHeapSpan for HeapSpan {
    fn allocate(&self, len: usize) -> Region {
        let region = HeapRegion::new_zeroed(len);
        let out = region.region();
        std::mem::forget(region);
        out
    }

    unsafe fn free(&self, region: Region) {
        drop(HeapRegion {
            region,
            layout: Layout::from_size_align(region.len().max(1), REGION_ALIGN)
                .expect("region layout overflows isize"),
        });
    }
}

/// Allocates slab buffers as anonymous shared mappings.
///
/// The mapping is inherited across `fork`, so parent and child see the same
/// counter words.
#[cfg(unix)]
#[derive(Debug, Default, Clone, Copy)]
pub struct SharedMmapSpan;

#[cfg(unix)]
impl OffHeapSpan for SharedMmapSpan {
    fn allocate(&self, len: usize) -> Region {
        // SAFETY: anonymous mapping, no fd involved.
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len.max(1),
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            let err = std::io::Error::last_os_error();
            panic!("mmap of {len} bytes failed: {err}");
        }
        // mmap returns page-aligned, zero-filled memory.
        Region {
            base: NonNull::new(base as *mut u8).expect("mmap returned null"),
            len,
        }
    }

    unsafe fn free(&self, region: Region) {
        unsafe {
            libc::munmap(region.as_ptr() as *mut libc::c_void, region.len().max(1));
        }
    }
}
