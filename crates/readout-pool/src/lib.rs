//! Zero-copy DMA memory pool for the readout pipeline.
//!
//! The pool owns a single contiguous, page-aligned memory region registered
//! with the readout card for DMA. The region is carved into fixed-size pages
//! which circulate through the pipeline: free list -> card transfer queue ->
//! card ready queue -> equipment output -> aggregator -> consumer -> free
//! list. At any instant a page has exactly one owner.
//!
//! # Design
//!
//! - Pages are pre-carved at construction; the pool never grows. Exhaustion
//!   is a normal backpressure signal (`acquire` returns `None`), not an
//!   error.
//! - The free list is a lock-free `SegQueue` of page indices, so `acquire`
//!   and `release` are safe from any thread without a lock.
//! - [`PageRef`] is an RAII handle: the page returns to the free list when
//!   the last clone is dropped. The pool holds no back-reference to pages it
//!   has handed out, so there is no ownership cycle.
//! - A per-page ownership flag makes `release` idempotent: a second release
//!   of the same page is absorbed and counted instead of corrupting the free
//!   list.
//!
//! # Page layout
//!
//! The first `reserved_prefix` bytes of every page are reserved for an
//! in-band block header written by the readout equipment; the card DMAs the
//! payload starting at that offset. The pool itself treats pages as opaque
//! bytes.
//!
//! # Example
//!
//! ```
//! use readout_pool::MemoryPool;
//!
//! let pool = MemoryPool::new(4, 64 * 1024, 64).unwrap();
//! let page = pool.acquire().expect("pool fresh");
//! let r = pool.wrap(page);
//! assert_eq!(pool.available(), 3);
//! drop(r);
//! assert_eq!(pool.available(), 4);
//! ```

use crossbeam_queue::SegQueue;
use memmap2::MmapMut;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

/// Granularity the DMA engine requires for the region and its pages.
pub const DMA_PAGE_ALIGNMENT: usize = 4096;

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("page count must be greater than 0")]
    ZeroPages,

    #[error("page size {0} is not a non-zero multiple of {DMA_PAGE_ALIGNMENT}")]
    BadPageSize(usize),

    #[error("reserved prefix {reserved} does not fit in page size {page_size}")]
    ReservedTooLarge { reserved: usize, page_size: usize },

    #[error("failed to map DMA region of {0} bytes: {1}")]
    Map(usize, std::io::Error),
}

/// A raw page handed out by [`MemoryPool::acquire`].
///
/// Plain pointer + index pair; ownership is tracked by the pool, not the
/// type. Wrap it with [`MemoryPool::wrap`] to get RAII release, or give the
/// pointer back with [`MemoryPool::release_ptr`].
#[derive(Debug, Clone, Copy)]
pub struct RawPage {
    ptr: *mut u8,
    index: usize,
}

impl RawPage {
    #[must_use]
    pub fn ptr(&self) -> *mut u8 {
        self.ptr
    }

    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }
}

// SAFETY: a RawPage is a capability for a page slot the pool has marked as
// handed out; the pointer stays valid for the pool's lifetime and only one
// holder exists per slot until release.
unsafe impl Send for RawPage {}

/// Fixed-size DMA page pool.
///
/// Thread-safe for concurrent `acquire`/`release` from any number of
/// threads.
pub struct MemoryPool {
    /// Anonymous mapping backing the DMA region. Kept alive for the pool's
    /// lifetime; `base` points into it.
    #[allow(dead_code)]
    map: MmapMut,
    base: *mut u8,
    page_size: usize,
    page_count: usize,
    reserved_prefix: usize,
    /// Lock-free queue of free page indices.
    free_indices: SegQueue<usize>,
    /// Per-page ownership flags: true while the page is handed out.
    owned: Vec<AtomicBool>,
    available: AtomicUsize,
    total_acquired: AtomicU64,
    total_released: AtomicU64,
    double_releases: AtomicU64,
}

// SAFETY: the raw base pointer targets a mapping owned by the pool itself.
// Page bytes are only touched by whichever single holder owns the page at
// that moment; the pool's own shared state (free list, flags, counters) is
// atomic.
unsafe impl Send for MemoryPool {}
unsafe impl Sync for MemoryPool {}

impl MemoryPool {
    /// Map the DMA region and carve it into `page_count` pages of
    /// `page_size` bytes, each with `reserved_prefix` bytes of header
    /// space.
    pub fn new(
        page_count: usize,
        page_size: usize,
        reserved_prefix: usize,
    ) -> Result<Arc<Self>, PoolError> {
        if page_count == 0 {
            return Err(PoolError::ZeroPages);
        }
        if page_size == 0 || page_size % DMA_PAGE_ALIGNMENT != 0 {
            return Err(PoolError::BadPageSize(page_size));
        }
        if reserved_prefix >= page_size {
            return Err(PoolError::ReservedTooLarge {
                reserved: reserved_prefix,
                page_size,
            });
        }

        let total = page_count * page_size;
        let mut map = MmapMut::map_anon(total).map_err(|e| PoolError::Map(total, e))?;
        let base = map.as_mut_ptr();

        let free_indices = SegQueue::new();
        for i in 0..page_count {
            free_indices.push(i);
        }
        let owned = (0..page_count).map(|_| AtomicBool::new(false)).collect();

        info!(
            page_count,
            page_size,
            total_mb = total as f64 / (1024.0 * 1024.0),
            "memory pool mapped"
        );

        Ok(Arc::new(Self {
            map,
            base,
            page_size,
            page_count,
            reserved_prefix,
            free_indices,
            owned,
            available: AtomicUsize::new(page_count),
            total_acquired: AtomicU64::new(0),
            total_released: AtomicU64::new(0),
            double_releases: AtomicU64::new(0),
        }))
    }

    /// Take a free page. Non-blocking; `None` means the pool is exhausted,
    /// which callers report as backpressure and retry later.
    #[must_use]
    pub fn acquire(&self) -> Option<RawPage> {
        let index = self.free_indices.pop()?;
        let was_owned = self.owned[index].swap(true, Ordering::AcqRel);
        debug_assert!(!was_owned, "free list returned an owned page");
        self.available.fetch_sub(1, Ordering::Relaxed);
        self.total_acquired.fetch_add(1, Ordering::Relaxed);
        // SAFETY: index < page_count, so the offset stays inside the mapping.
        let ptr = unsafe { self.base.add(index * self.page_size) };
        Some(RawPage { ptr, index })
    }

    /// Return a page to the free list. Accepts pages from any holder on any
    /// thread. A repeated release of the same page is absorbed.
    pub fn release(&self, page: RawPage) {
        self.release_index(page.index);
    }

    /// Return a page identified by its raw address, as recovered from the
    /// card's superpage user data. Invalid addresses are dropped with a
    /// warning.
    pub fn release_ptr(&self, ptr: *mut u8) {
        match self.index_of(ptr) {
            Some(index) => self.release_index(index),
            None => {
                warn!(ptr = ?ptr, "refusing to release pointer outside pool");
            }
        }
    }

    fn release_index(&self, index: usize) {
        if self.owned[index].swap(false, Ordering::AcqRel) {
            self.free_indices.push(index);
            self.available.fetch_add(1, Ordering::Relaxed);
            self.total_released.fetch_add(1, Ordering::Relaxed);
        } else {
            // Already back in the pool: absorb, the free list must not see
            // the index twice.
            self.double_releases.fetch_add(1, Ordering::Relaxed);
            warn!(index, "double release of page absorbed");
        }
    }

    /// Wrap a raw page into an RAII reference that releases on last drop.
    #[must_use]
    pub fn wrap(self: &Arc<Self>, page: RawPage) -> PageRef {
        PageRef {
            inner: Arc::new(PageInner {
                pool: Arc::clone(self),
                page,
            }),
        }
    }

    /// Rebuild a page handle from a raw address recovered from a card's
    /// superpage user data. Returns `None` for addresses outside the pool.
    ///
    /// The caller must hold ownership of the page (it must not be in the
    /// free list), as for [`wrap`](Self::wrap).
    #[must_use]
    pub fn wrap_ptr(self: &Arc<Self>, ptr: *mut u8) -> Option<PageRef> {
        let index = self.index_of(ptr)?;
        Some(self.wrap(RawPage { ptr, index }))
    }

    /// Check that `ptr` is a page start inside the registered region.
    #[must_use]
    pub fn validate(&self, ptr: *const u8) -> bool {
        self.index_of(ptr as *mut u8).is_some()
    }

    fn index_of(&self, ptr: *mut u8) -> Option<usize> {
        let base = self.base as usize;
        let p = ptr as usize;
        if p < base || p >= base + self.base_size() {
            return None;
        }
        let offset = p - base;
        if offset % self.page_size != 0 {
            return None;
        }
        Some(offset / self.page_size)
    }

    /// Base address of the DMA region, for card registration.
    #[must_use]
    pub fn base_address(&self) -> *mut u8 {
        self.base
    }

    /// Total size of the DMA region in bytes.
    #[must_use]
    pub fn base_size(&self) -> usize {
        self.page_count * self.page_size
    }

    #[must_use]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    #[must_use]
    pub fn page_count(&self) -> usize {
        self.page_count
    }

    /// Bytes reserved at the start of every page for the in-band header.
    #[must_use]
    pub fn reserved_prefix(&self) -> usize {
        self.reserved_prefix
    }

    /// Number of pages currently in the free list.
    #[must_use]
    pub fn available(&self) -> usize {
        self.available.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn total_acquired(&self) -> u64 {
        self.total_acquired.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn total_released(&self) -> u64 {
        self.total_released.load(Ordering::Relaxed)
    }

    /// Number of absorbed duplicate releases (should stay 0).
    #[must_use]
    pub fn double_release_count(&self) -> u64 {
        self.double_releases.load(Ordering::Relaxed)
    }
}

struct PageInner {
    pool: Arc<MemoryPool>,
    page: RawPage,
}

impl Drop for PageInner {
    fn drop(&mut self) {
        self.pool.release(self.page);
    }
}

/// Shared handle to a pool page.
///
/// Clones share the same page; the page returns to the pool when the last
/// clone is dropped. The reference count equals the number of distinct
/// holders, matching the one-owner-per-stage discipline of the pipeline
/// (each stage moves the handle onward rather than keeping a copy).
#[derive(Clone)]
pub struct PageRef {
    inner: Arc<PageInner>,
}

impl PageRef {
    /// Raw address of the page start (header prefix included).
    #[must_use]
    pub fn as_ptr(&self) -> *mut u8 {
        self.inner.page.ptr
    }

    /// Full page length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.pool.page_size()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes reserved for the in-band header at the page start.
    #[must_use]
    pub fn reserved_prefix(&self) -> usize {
        self.inner.pool.reserved_prefix()
    }

    /// Pool this page belongs to.
    #[must_use]
    pub fn pool(&self) -> &Arc<MemoryPool> {
        &self.inner.pool
    }

    /// Number of live handles to this page.
    #[must_use]
    pub fn holders(&self) -> usize {
        Arc::strong_count(&self.inner)
    }
}

impl std::fmt::Debug for PageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageRef")
            .field("index", &self.inner.page.index)
            .field("ptr", &self.inner.page.ptr)
            .field("holders", &self.holders())
            .finish()
    }
}

// SAFETY: the handle only exposes the page's raw pointer; exclusive access
// to the bytes is guaranteed by the pipeline's one-owner-per-stage
// discipline, and the pool outlives the handle via the inner Arc.
unsafe impl Send for PageRef {}
unsafe impl Sync for PageRef {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn pool(pages: usize) -> Arc<MemoryPool> {
        MemoryPool::new(pages, 64 * 1024, 64).unwrap()
    }

    #[test]
    fn test_rejects_bad_geometry() {
        assert!(matches!(
            MemoryPool::new(0, 4096, 64),
            Err(PoolError::ZeroPages)
        ));
        assert!(matches!(
            MemoryPool::new(1, 1000, 64),
            Err(PoolError::BadPageSize(1000))
        ));
        assert!(matches!(
            MemoryPool::new(1, 4096, 4096),
            Err(PoolError::ReservedTooLarge { .. })
        ));
    }

    #[test]
    fn test_acquire_until_exhausted() {
        let pool = pool(2);
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert_ne!(a.ptr(), b.ptr());
        assert!(pool.acquire().is_none());
        assert_eq!(pool.available(), 0);

        pool.release(a);
        assert_eq!(pool.available(), 1);
        assert!(pool.acquire().is_some());
        pool.release(b);
    }

    #[test]
    fn test_wrap_releases_on_last_drop() {
        let pool = pool(1);
        let r = pool.wrap(pool.acquire().unwrap());
        let r2 = r.clone();
        assert_eq!(r.holders(), 2);
        drop(r);
        assert_eq!(pool.available(), 0);
        drop(r2);
        assert_eq!(pool.available(), 1);
        assert_eq!(pool.total_released(), 1);
    }

    #[test]
    fn test_double_release_absorbed() {
        let pool = pool(2);
        let a = pool.acquire().unwrap();
        pool.release(a);
        pool.release(a);
        assert_eq!(pool.double_release_count(), 1);
        assert_eq!(pool.available(), 2);
        // the free list must still hand out distinct pages
        let x = pool.acquire().unwrap();
        let y = pool.acquire().unwrap();
        assert_ne!(x.ptr(), y.ptr());
        assert!(pool.acquire().is_none());
    }

    #[test]
    fn test_validate_bounds_and_alignment() {
        let pool = pool(2);
        let a = pool.acquire().unwrap();
        assert!(pool.validate(a.ptr()));
        // misaligned interior pointer
        // SAFETY: one past the page start is still inside the mapping.
        let interior = unsafe { a.ptr().add(1) };
        assert!(!pool.validate(interior));
        // out of range
        // SAFETY: pointer arithmetic only, never dereferenced.
        let beyond = unsafe { pool.base_address().add(pool.base_size()) };
        assert!(!pool.validate(beyond));
        pool.release(a);
    }

    #[test]
    fn test_release_ptr_roundtrip() {
        let pool = pool(1);
        let a = pool.acquire().unwrap();
        pool.release_ptr(a.ptr());
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn test_concurrent_churn() {
        let pool = pool(8);
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let pool = Arc::clone(&pool);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        if let Some(p) = pool.acquire() {
                            pool.release(p);
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(pool.available(), 8);
        assert_eq!(pool.total_acquired(), pool.total_released());
        assert_eq!(pool.double_release_count(), 0);
    }
}
