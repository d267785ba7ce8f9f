//! Fixed-size page pool: a lock-amortized free list shared by the receive
//! and signal-descriptor pools.
//!
//! Grounded on `examples/original_source/comm/ic_sock_buf.c`: one global
//! free list guarded by a single mutex, batched transfer into a per-thread
//! local cache so the common acquire/release path touches no lock, and a
//! segment table bounding total growth. The C code chases a raw
//! `next_sock_buf_page` pointer; here the free-list link is a slot index
//! rather than a pointer, which keeps the whole module free of raw pointer
//! arithmetic while preserving the O(1) splice the spec requires.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicPtr, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::config::PoolConfig;
use crate::error::{Error, Result};

const MAX_SEGMENTS: usize = 8;
const NONE: u32 = u32::MAX;

/// Inline scratch area big enough to back small "piggyback" buffers without
/// a second allocation, mirroring `buf_area`/`opaque_area` in
/// `ic_sock_buf_page`.
const INLINE_SCRATCH_SIZE: usize = 96;

struct Slot {
    data: UnsafeCell<Box<[u8]>>,
    /// Valid payload length within `data`, set by whoever filled the page.
    len: AtomicU32,
    ref_count: AtomicU32,
    /// Free-list link, valid only while the slot is on a free list and thus
    /// only ever touched under the owning mutex.
    free_next: AtomicU32,
}

// `data` is only accessed mutably by the slot's sole owner (ref_count == 1)
// and only immutably once shared (ref_count > 1); see `PageHandle` docs.
unsafe impl Sync for Slot {}

struct FreeList {
    head: u32,
    len: u32,
}

struct PoolInner {
    page_size: u32,
    pages_per_segment: u32,
    max_segments: u32,
    segment_ptrs: [AtomicPtr<Slot>; MAX_SEGMENTS],
    segment_count: AtomicU32,
    /// Keeps segment allocations alive; growth is rare so a mutex here is fine.
    owned_segments: Mutex<Vec<Box<[Slot]>>>,
    free: Mutex<FreeList>,
    free_cond: Condvar,
}

/// A fixed-size buffer page pool. Cheap to clone (an `Arc` underneath).
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

/// Per-thread cache of page indices already known free and owned by this
/// thread alone. No locking is needed to pop/push this list.
#[derive(Default)]
pub struct LocalPageCache {
    indices: Vec<u32>,
}

impl LocalPageCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

impl Pool {
    pub fn new(cfg: PoolConfig) -> Result<Self> {
        let inner = PoolInner {
            page_size: cfg.page_size,
            pages_per_segment: cfg.pages_per_segment,
            max_segments: cfg.max_segments.min(MAX_SEGMENTS as u32),
            segment_ptrs: Default::default(),
            segment_count: AtomicU32::new(0),
            owned_segments: Mutex::new(Vec::new()),
            free: Mutex::new(FreeList { head: NONE, len: 0 }),
            free_cond: Condvar::new(),
        };
        let pool = Pool {
            inner: Arc::new(inner),
        };
        pool.grow(1)?;
        Ok(pool)
    }

    pub fn page_size(&self) -> u32 {
        self.inner.page_size
    }

    fn slot(&self, index: u32) -> &Slot {
        let per_seg = self.inner.pages_per_segment;
        let seg = (index / per_seg) as usize;
        let off = (index % per_seg) as usize;
        let ptr = self.inner.segment_ptrs[seg].load(Ordering::Acquire);
        debug_assert!(!ptr.is_null());
        unsafe { &*ptr.add(off) }
    }

    /// Allocate another backing segment of `pages_per_segment * n` pages and
    /// splice it onto the free list. Fails if the per-pool segment cap would
    /// be exceeded (`Error::OutOfMemory`), matching `ic_inc_sock_buf`.
    pub fn grow(&self, n: u32) -> Result<()> {
        let inner = &self.inner;
        let mut owned = inner.owned_segments.lock().unwrap();
        for _ in 0..n {
            let count = inner.segment_count.load(Ordering::Acquire);
            if count >= inner.max_segments {
                return Err(Error::OutOfMemory);
            }
            let per_seg = inner.pages_per_segment;
            let base_index = count * per_seg;
            let page_size = inner.page_size.max(1) as usize;
            let mut slots = Vec::with_capacity(per_seg as usize);
            for i in 0..per_seg {
                let buf_len = if inner.page_size == 0 {
                    INLINE_SCRATCH_SIZE
                } else {
                    page_size
                };
                let next = if i + 1 == per_seg {
                    NONE
                } else {
                    base_index + i + 1
                };
                slots.push(Slot {
                    data: UnsafeCell::new(vec![0u8; buf_len].into_boxed_slice()),
                    len: AtomicU32::new(0),
                    ref_count: AtomicU32::new(0),
                    free_next: AtomicU32::new(next),
                });
            }
            let boxed: Box<[Slot]> = slots.into_boxed_slice();
            let ptr = boxed.as_ptr() as *mut Slot;
            inner.segment_ptrs[count as usize].store(ptr, Ordering::Release);
            owned.push(boxed);
            inner.segment_count.store(count + 1, Ordering::Release);

            let mut free = inner.free.lock().unwrap();
            let tail = base_index + per_seg - 1;
            self.slot(tail).free_next.store(free.head, Ordering::Relaxed);
            free.head = base_index;
            free.len += per_seg;
            inner.free_cond.notify_all();
        }
        Ok(())
    }

    fn pop_global(&self, batch_n: u32, local: &mut LocalPageCache) -> Option<u32> {
        let inner = &self.inner;
        let mut free = inner.free.lock().unwrap();
        if free.head == NONE {
            return None;
        }
        let mut first = None;
        let mut taken = 0;
        let mut cursor = free.head;
        while taken < batch_n && cursor != NONE {
            let next = self.slot(cursor).free_next.load(Ordering::Relaxed);
            if first.is_none() {
                first = Some(cursor);
            } else {
                local.indices.push(cursor);
            }
            cursor = next;
            taken += 1;
        }
        free.head = cursor;
        free.len -= taken;
        first
    }

    /// Returns one page. Pops the caller's local cache first (no lock);
    /// otherwise takes up to `batch_n` pages from the global free list under
    /// the pool mutex, growing the pool by one segment if it is empty and
    /// has room.
    pub fn acquire(&self, local: &mut LocalPageCache, batch_n: u32) -> Result<PageHandle> {
        if let Some(index) = local.indices.pop() {
            return Ok(self.claim(index));
        }
        if let Some(index) = self.pop_global(batch_n.max(1), local) {
            return Ok(self.claim(index));
        }
        self.grow(1)?;
        if let Some(index) = self.pop_global(batch_n.max(1), local) {
            return Ok(self.claim(index));
        }
        Err(Error::OutOfMemory)
    }

    /// As `acquire`, but busy-polls with sleeps until `timeout` elapses.
    pub fn acquire_wait(
        &self,
        local: &mut LocalPageCache,
        batch_n: u32,
        timeout: Duration,
    ) -> Result<PageHandle> {
        let start = Instant::now();
        loop {
            match self.acquire(local, batch_n) {
                Ok(page) => return Ok(page),
                Err(Error::OutOfMemory) => {
                    if start.elapsed() >= timeout {
                        return Err(Error::OutOfMemory);
                    }
                    let guard = self.inner.free.lock().unwrap();
                    let remaining = timeout.saturating_sub(start.elapsed());
                    let _ = self
                        .inner
                        .free_cond
                        .wait_timeout(guard, remaining.min(Duration::from_millis(10)));
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Acquire a page sized for a "piggyback" buffer of `buf_size` bytes in
    /// a zero-page-size pool. Mirrors `get_sock_buf_page` in
    /// `ic_sock_buf.c`: fits in the slot's inline scratch area when
    /// possible, otherwise consumes a second slot as overflow storage.
    pub fn acquire_small(
        &self,
        local: &mut LocalPageCache,
        batch_n: u32,
        buf_size: u32,
    ) -> Result<PageHandle> {
        debug_assert_eq!(self.inner.page_size, 0, "acquire_small needs a page_size=0 pool");
        let first = self.acquire(local, batch_n)?;
        if buf_size as usize <= INLINE_SCRATCH_SIZE {
            return Ok(first);
        }
        match self.acquire(local, batch_n) {
            Ok(overflow) => Ok(first.attach_overflow(overflow)),
            Err(e) => {
                drop(first);
                Err(e)
            }
        }
    }

    fn claim(&self, index: u32) -> PageHandle {
        let slot = self.slot(index);
        slot.len.store(0, Ordering::Relaxed);
        slot.ref_count.store(1, Ordering::Release);
        PageHandle {
            pool: self.clone(),
            index,
            overflow: None,
        }
    }

    fn release_index(&self, index: u32) {
        let inner = &self.inner;
        let mut free = inner.free.lock().unwrap();
        self.slot(index).free_next.store(free.head, Ordering::Relaxed);
        free.head = index;
        free.len += 1;
        inner.free_cond.notify_one();
    }

    /// Number of pages currently on the global free list. Test/diagnostic use.
    pub fn free_count(&self) -> u32 {
        self.inner.free.lock().unwrap().len
    }
}

/// A move-only handle to one page. The atomic refcount lives in the pool's
/// slot, not in this handle, because several handles (one per signal
/// descriptor referencing the page) can alias the same underlying bytes.
/// The handle is returned to its pool the moment the last alias drops.
pub struct PageHandle {
    pool: Pool,
    index: u32,
    /// Set only for the zero-page-size overflow case (`acquire_small`).
    overflow: Option<Box<PageHandle>>,
}

impl PageHandle {
    pub fn len(&self) -> usize {
        self.pool.slot(self.index).len.load(Ordering::Acquire) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        unsafe { (&*self.pool.slot(self.index).data.get()).len() }
    }

    pub fn set_len(&self, len: usize) {
        debug_assert!(len <= self.capacity());
        self.pool.slot(self.index).len.store(len as u32, Ordering::Release);
    }

    /// Read-only view of the valid payload.
    pub fn as_slice(&self) -> &[u8] {
        let slot = self.pool.slot(self.index);
        let len = slot.len.load(Ordering::Acquire) as usize;
        unsafe { &(&*slot.data.get())[..len] }
    }

    /// Full backing buffer, for filling in new bytes. Only sound while this
    /// handle is the page's sole owner (refcount == 1); asserted in debug.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        let slot = self.pool.slot(self.index);
        debug_assert_eq!(slot.ref_count.load(Ordering::Acquire), 1, "page is shared");
        unsafe { &mut *slot.data.get() }
    }

    /// Add one reference to this page and return a new handle aliasing the
    /// same bytes; used when a signal descriptor needs to outlive the
    /// receive engine's in-flight page.
    pub fn share(&self) -> PageHandle {
        self.pool.slot(self.index).ref_count.fetch_add(1, Ordering::AcqRel);
        PageHandle {
            pool: self.pool.clone(),
            index: self.index,
            overflow: None,
        }
    }

    fn attach_overflow(mut self, overflow: PageHandle) -> PageHandle {
        self.overflow = Some(Box::new(overflow));
        self
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }
}

impl Drop for PageHandle {
    fn drop(&mut self) {
        let slot = self.pool.slot(self.index);
        if slot.ref_count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.pool.release_index(self.index);
        }
        // overflow handle drops on its own and follows the same path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;

    fn tiny_pool() -> Pool {
        Pool::new(PoolConfig {
            page_size: 64,
            max_segments: 2,
            pages_per_segment: 4,
            batch_n: 2,
        })
        .unwrap()
    }

    #[test]
    fn acquire_release_conserves_pages() {
        let pool = tiny_pool();
        let before = pool.free_count();
        let mut local = LocalPageCache::new();
        let page = pool.acquire(&mut local, 2).unwrap();
        drop(page);
        assert_eq!(pool.free_count() + local.len() as u32, before);
    }

    #[test]
    fn local_cache_avoids_global_lock_on_refill() {
        let pool = tiny_pool();
        let mut local = LocalPageCache::new();
        let a = pool.acquire(&mut local, 2).unwrap();
        let b = pool.acquire(&mut local, 2).unwrap();
        // batch_n=2 means the first acquire should have pulled both pages in.
        assert!(local.is_empty());
        drop(a);
        drop(b);
    }

    #[test]
    fn share_keeps_page_alive_until_all_drop() {
        let pool = tiny_pool();
        let mut local = LocalPageCache::new();
        let total_before = pool.free_count() + local.len() as u32;
        let page = pool.acquire(&mut local, 2).unwrap();
        let shared = page.share();
        drop(page);
        assert_eq!(pool.free_count() + local.len() as u32, total_before - 1);
        drop(shared);
        assert_eq!(pool.free_count() + local.len() as u32, total_before);
    }

    #[test]
    fn grow_respects_segment_cap() {
        let pool = Pool::new(PoolConfig {
            page_size: 32,
            max_segments: 1,
            pages_per_segment: 2,
            batch_n: 1,
        })
        .unwrap();
        assert!(matches!(pool.grow(1), Err(Error::OutOfMemory)));
    }

    #[test]
    fn out_of_memory_then_acquire_wait_succeeds_on_release() {
        let pool = Pool::new(PoolConfig {
            page_size: 16,
            max_segments: 1,
            pages_per_segment: 1,
            batch_n: 1,
        })
        .unwrap();
        let mut local = LocalPageCache::new();
        let held = pool.acquire(&mut local, 1).unwrap();
        assert!(matches!(pool.acquire(&mut local, 1), Err(Error::OutOfMemory)));

        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            drop(held);
        });
        let page = pool.acquire_wait(&mut local, 1, Duration::from_secs(1)).unwrap();
        handle.join().unwrap();
        drop(page);
    }

    #[test]
    fn acquire_small_uses_overflow_page_beyond_inline_scratch() {
        let pool = Pool::new(PoolConfig {
            page_size: 0,
            max_segments: 2,
            pages_per_segment: 4,
            batch_n: 2,
        })
        .unwrap();
        let mut local = LocalPageCache::new();
        let small = pool.acquire_small(&mut local, 2, 16).unwrap();
        assert!(small.overflow.is_none());
        let big = pool
            .acquire_small(&mut local, 2, (INLINE_SCRATCH_SIZE + 32) as u32)
            .unwrap();
        assert!(big.overflow.is_some());
    }
}
