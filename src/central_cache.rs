//! Central cache (middle tier): per-size-class span lists shared by every
//! thread.
//!
//! Each of the 208 buckets has its own lock, so threads working in
//! different size classes never contend. The two slow operations, carving
//! a fresh span into cells and returning an empty span to the page cache,
//! both happen with the bucket lock released, preserving the process-wide
//! lock order: a CC bucket lock is never held while the page-cache lock is
//! taken.

use crate::config::PAGE_SHIFT;
use crate::freelist::FreeCell;
use crate::page_cache::PageCache;
use crate::pagemap::PageMap;
use crate::size_class::{self, BUCKETS};
use crate::span::{Span, SpanList};
use crate::sync::SpinMutex;
use core::ptr;
#[cfg(feature = "debug")]
use std::println;

/// One span list per size class, each behind its own lock.
pub struct CentralCache {
    buckets: [SpinMutex<SpanList>; BUCKETS],
}

impl Default for CentralCache {
    fn default() -> Self {
        Self::new()
    }
}

impl CentralCache {
    pub const fn new() -> Self {
        Self {
            buckets: [const { SpinMutex::new(SpanList::new()) }; BUCKETS],
        }
    }

    /// Detach up to `batch` cells of `aligned_size` bytes from one span of
    /// bucket `index`. Returns `(actual_n, start, end)` with
    /// `actual_n >= 1`; the chain is null-terminated at `end`.
    ///
    /// On a miss the bucket lock is dropped while a span is fetched from
    /// the page cache and carved; carving is O(pages) and must not stall
    /// threads recycling cells into other spans of the same bucket.
    ///
    /// # Safety
    ///
    /// `index` must be the bucket for `aligned_size`; `page_cache` must be
    /// the instance registered with the same page map as every caller.
    pub unsafe fn fetch_range(
        &self,
        index: usize,
        aligned_size: usize,
        batch: usize,
        page_cache: &SpinMutex<PageCache>,
    ) -> (usize, *mut FreeCell, *mut FreeCell) {
        debug_assert!(batch >= 1);
        loop {
            {
                let mut bucket = self.buckets[index].lock();
                let end_pos = bucket.end();
                let mut it = bucket.begin();
                while it != end_pos {
                    if unsafe { !(*it).free_list.is_null() } {
                        return unsafe { Self::take_from_span(it, batch) };
                    }
                    it = unsafe { (*it).next };
                }
            }
            // Bucket exhausted: bring in a new span with no CC lock held.
            #[cfg(feature = "debug")]
            println!("[central_cache] bucket {index} empty, asking page cache");

            let span = {
                let mut pc = page_cache.lock();
                unsafe { pc.new_span(size_class::span_pages(aligned_size)) }
            };
            unsafe { Self::carve(span, aligned_size) };
            {
                let mut bucket = self.buckets[index].lock();
                unsafe { bucket.push_front(span) };
            }
            // Retry the scan; the fresh span is now visible (another thread
            // may legitimately win some of its cells first).
        }
    }

    /// Pop up to `batch` cells off `span`'s cell list. Caller holds the
    /// bucket lock and has checked the list is non-empty.
    unsafe fn take_from_span(
        span: *mut Span,
        batch: usize,
    ) -> (usize, *mut FreeCell, *mut FreeCell) {
        unsafe {
            let start = (*span).free_list;
            let mut end = start;
            let mut n = 1;
            while n < batch && !(*end).next.is_null() {
                end = (*end).next;
                n += 1;
            }
            (*span).free_list = (*end).next;
            (*end).next = ptr::null_mut();
            (*span).use_count += n;
            (n, start, end)
        }
    }

    /// Cut an intact span into equal cells linked in address order. Runs
    /// without any lock; the span is not yet published to a bucket.
    unsafe fn carve(span: *mut Span, aligned_size: usize) {
        unsafe {
            (*span).is_in_use = true;

            let base = (*span).base_addr();
            let cells = (*span).byte_len() / aligned_size;
            debug_assert!(cells >= 1);

            let mut tail = base as *mut FreeCell;
            (*span).free_list = tail;
            for i in 1..cells {
                let cell = base.add(i * aligned_size) as *mut FreeCell;
                (*tail).next = cell;
                tail = cell;
            }
            (*tail).next = ptr::null_mut();
            (*span).use_count = 0;
        }
    }

    /// Route a chain of freed cells back to their owning spans. Spans whose
    /// `use_count` reaches zero are handed back to the page cache, with the
    /// bucket lock released around the hand-off.
    ///
    /// # Safety
    ///
    /// Every cell in the chain must have been allocated from bucket
    /// `index`/`aligned_size`, and `page_cache`/`pagemap` must be the
    /// instances the cells came from.
    pub unsafe fn release_cells(
        &self,
        head: *mut FreeCell,
        aligned_size: usize,
        page_cache: &SpinMutex<PageCache>,
        pagemap: &PageMap,
    ) {
        let index = size_class::bucket_index(aligned_size);
        let mut cur = head;
        let mut bucket = self.buckets[index].lock();
        while !cur.is_null() {
            let next = unsafe { (*cur).next };

            // The map read needs no page-cache lock: entries for live cells
            // are always installed before their span's cells circulate.
            let page_id = (cur as usize) >> PAGE_SHIFT;
            let span = pagemap.get(page_id);
            debug_assert!(!span.is_null(), "freed cell not owned by any span");
            if span.is_null() {
                cur = next;
                continue;
            }

            unsafe {
                (*cur).next = (*span).free_list;
                (*span).free_list = cur;
                (*span).use_count -= 1;

                if (*span).use_count == 0 {
                    // Every carved cell is home: give the pages back. The
                    // cells were contiguous slices of the span, so the
                    // scrambled list can simply be forgotten.
                    bucket.remove(span);
                    (*span).free_list = ptr::null_mut();

                    #[cfg(feature = "debug")]
                    println!(
                        "[central_cache] span {} idle, returning to page cache",
                        (*span).page_id
                    );

                    drop(bucket);
                    {
                        let mut pc = page_cache.lock();
                        pc.release_span(span);
                    }
                    bucket = self.buckets[index].lock();
                }
            }
            cur = next;
        }
    }
}
