//! Thread cache (front end): per-thread free lists, one per size class.
//!
//! The fast path touches nothing shared. A miss fetches a slow-start batch
//! from the central cache; a list growing past its watermark releases a
//! batch back. The cache never sees oversize requests; the allocator
//! routes those straight to the page cache.

use crate::central_cache::CentralCache;
use crate::freelist::{FreeCell, FreeList};
use crate::page_cache::PageCache;
use crate::pagemap::PageMap;
use crate::size_class::{self, BUCKETS, MAX_SMALL};
use crate::sync::SpinMutex;

pub struct ThreadCache {
    lists: [FreeList; BUCKETS],
}

impl Default for ThreadCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadCache {
    pub const fn new() -> Self {
        Self {
            lists: [const { FreeList::new() }; BUCKETS],
        }
    }

    /// Allocate `size` bytes (1..=[`MAX_SMALL`]) from this cache.
    ///
    /// # Safety
    ///
    /// `central` and `page_cache` must be the instances every other user of
    /// this cache's cells goes through (they share one page map).
    #[inline]
    pub unsafe fn allocate(
        &mut self,
        size: usize,
        central: &CentralCache,
        page_cache: &SpinMutex<PageCache>,
    ) -> *mut u8 {
        debug_assert!(size >= 1 && size <= MAX_SMALL);
        let index = size_class::bucket_index(size);
        let list = &mut self.lists[index];
        if !list.is_empty() {
            return list.pop() as *mut u8;
        }
        let aligned = size_class::round_up(size);
        unsafe { self.fetch_from_central(index, aligned, central, page_cache) }
    }

    /// Return a cell of `size` bytes to this cache, releasing a batch to
    /// the central cache when the bucket's list outgrows its watermark.
    ///
    /// # Safety
    ///
    /// `ptr` must come from a matching `allocate` (same size class, same
    /// shared tiers), and must not be freed again.
    #[inline]
    pub unsafe fn deallocate(
        &mut self,
        ptr: *mut u8,
        size: usize,
        central: &CentralCache,
        page_cache: &SpinMutex<PageCache>,
        pagemap: &PageMap,
    ) {
        debug_assert!(!ptr.is_null());
        debug_assert!(size >= 1 && size <= MAX_SMALL);
        let index = size_class::bucket_index(size);
        let list = &mut self.lists[index];
        unsafe { list.push(ptr as *mut FreeCell) };

        if list.len() >= list.max_size() {
            let aligned = size_class::round_up(size);
            unsafe { self.list_too_long(index, aligned, central, page_cache, pagemap) };
        }
    }

    /// Slow path: pull a batch from the central cache.
    ///
    /// Slow start: a bucket asks for `min(max_size, batch_bound)` cells,
    /// and its watermark grows by one each time it was the binding limit,
    /// so a cold bucket cannot hoard cells for a size it rarely uses.
    #[cold]
    unsafe fn fetch_from_central(
        &mut self,
        index: usize,
        aligned_size: usize,
        central: &CentralCache,
        page_cache: &SpinMutex<PageCache>,
    ) -> *mut u8 {
        let list = &mut self.lists[index];
        let batch = list.max_size().min(size_class::batch_bound(aligned_size));
        if list.max_size() == batch {
            list.grow_max_size();
        }

        let (n, start, end) = unsafe { central.fetch_range(index, aligned_size, batch, page_cache) };
        debug_assert!(n >= 1);

        if n > 1 {
            unsafe { list.push_range((*start).next, end, n - 1) };
        }
        start as *mut u8
    }

    /// The bucket crossed its watermark: detach exactly `max_size` cells
    /// and hand them back to the central cache.
    unsafe fn list_too_long(
        &mut self,
        index: usize,
        aligned_size: usize,
        central: &CentralCache,
        page_cache: &SpinMutex<PageCache>,
        pagemap: &PageMap,
    ) {
        let list = &mut self.lists[index];
        let n = list.max_size().min(list.len());
        let (start, _end) = unsafe { list.pop_range(n) };
        unsafe { central.release_cells(start, aligned_size, page_cache, pagemap) };
    }

    /// Flush every cached cell back to the central cache. Called on thread
    /// exit; afterwards the cache is empty but remains usable.
    ///
    /// # Safety
    ///
    /// Same contract as [`deallocate`](Self::deallocate).
    pub unsafe fn drain(
        &mut self,
        central: &CentralCache,
        page_cache: &SpinMutex<PageCache>,
        pagemap: &PageMap,
    ) {
        for index in 0..BUCKETS {
            let list = &mut self.lists[index];
            let n = list.len();
            if n == 0 {
                continue;
            }
            let aligned = size_class::bucket_size(index);
            let (start, _end) = unsafe { list.pop_range(n) };
            unsafe { central.release_cells(start, aligned, page_cache, pagemap) };
        }
    }
}

#[cfg(test)]
impl ThreadCache {
    pub(crate) fn list_len(&self, index: usize) -> usize {
        self.lists[index].len()
    }

    pub(crate) fn list_max_size(&self, index: usize) -> usize {
        self.lists[index].max_size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MAX_BATCH, MAX_PAGES};
    use alloc::boxed::Box;
    use alloc::vec::Vec;

    fn make_env() -> (&'static PageMap, SpinMutex<PageCache>, CentralCache) {
        let pm = Box::leak(Box::new(PageMap::new()));
        let pc = SpinMutex::new(PageCache::new(pm));
        let cc = CentralCache::new();
        (pm, pc, cc)
    }

    #[test]
    fn test_allocate_deallocate_cycle() {
        let (pm, pc, cc) = make_env();
        let mut tc = ThreadCache::new();
        unsafe {
            let p = tc.allocate(6, &cc, &pc);
            assert!(!p.is_null());
            assert_eq!(p as usize % 8, 0);
            tc.deallocate(p, 6, &cc, &pc, pm);
        }
    }

    #[test]
    fn test_fast_path_reuses_cached_cell() {
        let (pm, pc, cc) = make_env();
        let mut tc = ThreadCache::new();
        unsafe {
            // Two allocations prime the bucket so a free stays cached
            // (a single cached cell would trip the max_size=1 watermark).
            let a = tc.allocate(100, &cc, &pc);
            let b = tc.allocate(100, &cc, &pc);
            tc.deallocate(b, 100, &cc, &pc, pm);
            let c = tc.allocate(100, &cc, &pc);
            assert_eq!(b, c);
            tc.deallocate(a, 100, &cc, &pc, pm);
            tc.deallocate(c, 100, &cc, &pc, pm);
        }
    }

    #[test]
    fn test_matched_pairs_repeat() {
        // Matched allocate/deallocate pairs touch one bucket and settle
        // into a steady state.
        let (pm, pc, cc) = make_env();
        let mut tc = ThreadCache::new();
        unsafe {
            for _ in 0..10_000 {
                let p = tc.allocate(6, &cc, &pc);
                assert!(!p.is_null());
                assert_eq!(p as usize % 8, 0);
                tc.deallocate(p, 6, &cc, &pc, pm);
            }
            // Only bucket 0 was ever used.
            for index in 1..BUCKETS {
                assert_eq!(tc.list_len(index), 0);
            }
        }
    }

    #[test]
    fn test_slow_start_growth() {
        // 1025 allocations without frees: the watermark must have grown
        // past its initial value but never beyond the cap, and the cells
        // must all be distinct.
        let (_pm, pc, cc) = make_env();
        let mut tc = ThreadCache::new();
        unsafe {
            let mut ptrs = Vec::new();
            for _ in 0..1025 {
                let p = tc.allocate(6, &cc, &pc);
                assert!(!p.is_null());
                ptrs.push(p as usize);
            }
            let index = size_class::bucket_index(6);
            assert!(tc.list_max_size(index) >= 16);
            assert!(tc.list_max_size(index) <= MAX_BATCH);

            ptrs.sort_unstable();
            ptrs.dedup();
            assert_eq!(ptrs.len(), 1025, "allocations overlapped");
        }
    }

    #[test]
    fn test_watermark_monotonic_and_bounded() {
        let (pm, pc, cc) = make_env();
        let mut tc = ThreadCache::new();
        let index = size_class::bucket_index(32);
        unsafe {
            let mut last = tc.list_max_size(index);
            assert_eq!(last, 1);
            for round in 0..2000 {
                let p = tc.allocate(32, &cc, &pc);
                let now = tc.list_max_size(index);
                assert!(now >= last, "watermark shrank at round {round}");
                assert!(now <= MAX_BATCH);
                last = now;
                tc.deallocate(p, 32, &cc, &pc, pm);
            }
        }
    }

    #[test]
    fn test_list_too_long_releases_back() {
        let (pm, pc, cc) = make_env();
        let mut tc = ThreadCache::new();
        let index = size_class::bucket_index(16);
        unsafe {
            let mut ptrs = Vec::new();
            for _ in 0..500 {
                ptrs.push(tc.allocate(16, &cc, &pc));
            }
            for p in ptrs {
                tc.deallocate(p, 16, &cc, &pc, pm);
            }
            // The watermark trigger keeps the cached list bounded.
            assert!(tc.list_len(index) < 500);
            assert!(tc.list_len(index) <= tc.list_max_size(index));
        }
    }

    #[test]
    fn test_drain_returns_everything() {
        let (pm, pc, cc) = make_env();
        let mut tc = ThreadCache::new();
        unsafe {
            let mut ptrs = Vec::new();
            for size in [6usize, 120, 900, 4000, 60_000] {
                for _ in 0..20 {
                    ptrs.push((tc.allocate(size, &cc, &pc), size));
                }
            }
            for (p, size) in ptrs {
                tc.deallocate(p, size, &cc, &pc, pm);
            }
            tc.drain(&cc, &pc, pm);
            for index in 0..BUCKETS {
                assert_eq!(tc.list_len(index), 0);
            }
            // With every cell home, all spans returned and re-coalesced.
            let pc_guard = pc.lock();
            assert_eq!(pc_guard.total_free_pages() % (MAX_PAGES - 1), 0);
            assert!(pc_guard.free_span_count() >= 1);
        }
    }

    #[test]
    fn test_mixed_sizes_do_not_cross_buckets() {
        let (pm, pc, cc) = make_env();
        let mut tc = ThreadCache::new();
        unsafe {
            let a = tc.allocate(128, &cc, &pc);
            let b = tc.allocate(129, &cc, &pc);
            // Different buckets, so different spans and non-overlapping
            // cells.
            assert_ne!(
                size_class::bucket_index(128),
                size_class::bucket_index(129)
            );
            let (a, b) = (a as usize, b as usize);
            assert!(a.abs_diff(b) >= 128);
            tc.deallocate(a as *mut u8, 128, &cc, &pc, pm);
            tc.deallocate(b as *mut u8, 129, &cc, &pc, pm);
        }
    }
}
