//! Page cache (back end): the process-wide owner of page runs.
//!
//! Free spans are filed by exact page count in `free_lists[1..MAX_PAGES-1]`.
//! A request is served by an exact hit, by splitting a larger span, or by
//! growing the heap with a `MAX_PAGES-1`-page run from the OS. Requests of
//! `MAX_PAGES` pages or more bypass the free lists entirely and are mapped
//! and unmapped directly.
//!
//! Every method runs under the single page-cache mutex held by the caller;
//! only the page map is written here, so lock-free readers elsewhere stay
//! coherent.

use crate::config::{MAX_PAGES, PAGE_SHIFT};
use crate::pagemap::PageMap;
use crate::platform;
use crate::span::{self, Span, SpanList};
use core::ptr;
#[cfg(feature = "debug")]
use std::println;

pub struct PageCache {
    /// free_lists[k] holds free spans of exactly k pages (index 0 unused).
    free_lists: [SpanList; MAX_PAGES],
    /// The shared page-ID -> span map.
    pagemap: &'static PageMap,
}

// SAFETY: PageCache is only accessed through a SpinMutex; the spans it
// links are pool-allocated and the pages OS-backed.
unsafe impl Send for PageCache {}

impl PageCache {
    pub const fn new(pagemap: &'static PageMap) -> Self {
        Self {
            free_lists: [const { SpanList::new() }; MAX_PAGES],
            pagemap,
        }
    }

    /// Hand out a span of exactly `k` pages, in-use and fully mapped.
    ///
    /// # Safety
    ///
    /// Caller must hold the page-cache mutex.
    pub unsafe fn new_span(&mut self, k: usize) -> *mut Span {
        assert!(k > 0);

        // Oversize: straight to the OS. A single map entry at the base page
        // suffices; these spans never split, so no interior cell address is
        // ever resolved against them.
        if k >= MAX_PAGES {
            #[cfg(feature = "debug")]
            println!("[page_cache] oversize map of {k} pages");

            let ptr = platform::os_alloc(k);
            let s = span::alloc_span();
            unsafe {
                (*s).page_id = (ptr as usize) >> PAGE_SHIFT;
                (*s).n = k;
                (*s).is_in_use = true;
                self.pagemap.set((*s).page_id, s);
            }
            return s;
        }

        // Exact hit.
        if !self.free_lists[k].is_empty() {
            let s = unsafe { self.free_lists[k].pop_front() };
            unsafe {
                (*s).is_in_use = true;
                self.pagemap.install_span(s);
            }
            return s;
        }

        // Split the first larger free span: carve k pages off its head.
        for n in k + 1..MAX_PAGES {
            if self.free_lists[n].is_empty() {
                continue;
            }
            let n_span = unsafe { self.free_lists[n].pop_front() };
            let k_span = span::alloc_span();
            unsafe {
                (*k_span).page_id = (*n_span).page_id;
                (*k_span).n = k;
                (*n_span).page_id += k;
                (*n_span).n -= k;

                let rest = (*n_span).n;
                self.free_lists[rest].push_front(n_span);
                // The narrowed remainder only needs its endpoints mapped;
                // the carved span gets every page so deallocation can
                // resolve any interior cell.
                self.pagemap.install_bounds(n_span);

                (*k_span).is_in_use = true;
                self.pagemap.install_span(k_span);
            }
            return k_span;
        }

        // Nothing to split: grow the heap by one maximal run and retry.
        #[cfg(feature = "debug")]
        println!("[page_cache] grow heap by {} pages", MAX_PAGES - 1);

        let run = MAX_PAGES - 1;
        let ptr = platform::os_alloc(run);
        let s = span::alloc_span();
        unsafe {
            (*s).page_id = (ptr as usize) >> PAGE_SHIFT;
            (*s).n = run;
            self.free_lists[run].push_front(s);
        }
        unsafe { self.new_span(k) }
    }

    /// Take back a span whose cells (if any) have all returned. Coalesces
    /// with free neighbors, then files the result; oversize spans go back
    /// to the OS.
    ///
    /// # Safety
    ///
    /// Caller must hold the page-cache mutex. `span` must be in-use,
    /// detached from any list, with valid `page_id`/`n`.
    pub unsafe fn release_span(&mut self, span: *mut Span) {
        if unsafe { (*span).n } >= MAX_PAGES {
            #[cfg(feature = "debug")]
            println!("[page_cache] oversize unmap of {} pages", unsafe {
                (*span).n
            });

            unsafe {
                let base = ((*span).page_id << PAGE_SHIFT) as *mut u8;
                let bytes = (*span).n << PAGE_SHIFT;
                // Drop the base entry so no stale lookup can reach the
                // recycled metadata.
                self.pagemap.set((*span).page_id, ptr::null_mut());
                platform::os_free(base, bytes);
                span::free_span(span);
            }
            return;
        }

        unsafe {
            (*span).free_list = ptr::null_mut();
            (*span).use_count = 0;
        }

        let span = unsafe { self.coalesce_left(span) };
        let span = unsafe { self.coalesce_right(span) };

        unsafe {
            (*span).is_in_use = false;
            let n = (*span).n;
            self.free_lists[n].push_front(span);
            self.pagemap.install_bounds(span);
        }
    }

    /// Absorb free spans ending immediately before `span`, repeatedly.
    unsafe fn coalesce_left(&mut self, span: *mut Span) -> *mut Span {
        loop {
            let start = unsafe { (*span).page_id };
            let Some(prev_id) = start.checked_sub(1) else {
                return span;
            };
            let prev = self.pagemap.get(prev_id);
            if prev.is_null() {
                return span;
            }
            unsafe {
                if (*prev).is_in_use {
                    return span;
                }
                // A boundary entry can be stale after earlier splits;
                // only merge when the recorded range really abuts ours.
                if (*prev).end_page() != start {
                    return span;
                }
                if (*prev).n + (*span).n > MAX_PAGES - 1 {
                    return span;
                }

                #[cfg(feature = "debug")]
                println!("[page_cache] merge left {} <- {}", (*prev).page_id, start);

                let prev_pages = (*prev).n;
                self.free_lists[prev_pages].remove(prev);
                (*span).page_id = (*prev).page_id;
                (*span).n += prev_pages;
                span::free_span(prev);
            }
        }
    }

    /// Absorb free spans starting immediately after `span`, repeatedly.
    unsafe fn coalesce_right(&mut self, span: *mut Span) -> *mut Span {
        loop {
            let next_id = unsafe { (*span).end_page() };
            let next = self.pagemap.get(next_id);
            if next.is_null() {
                return span;
            }
            unsafe {
                if (*next).is_in_use {
                    return span;
                }
                if (*next).page_id != next_id {
                    return span;
                }
                if (*next).n + (*span).n > MAX_PAGES - 1 {
                    return span;
                }

                #[cfg(feature = "debug")]
                println!("[page_cache] merge right {} -> {}", (*span).page_id, next_id);

                let next_pages = (*next).n;
                self.free_lists[next_pages].remove(next);
                (*span).n += next_pages;
                span::free_span(next);
            }
        }
    }
}

#[cfg(test)]
impl PageCache {
    /// Total pages across all free lists.
    pub(crate) fn total_free_pages(&self) -> usize {
        (1..MAX_PAGES)
            .map(|k| k * self.free_lists[k].len())
            .sum()
    }

    /// Number of free spans across all lists.
    pub(crate) fn free_span_count(&self) -> usize {
        (1..MAX_PAGES).map(|k| self.free_lists[k].len()).sum()
    }

    /// Number of free spans of exactly `k` pages.
    pub(crate) fn free_spans_of(&self, k: usize) -> usize {
        self.free_lists[k].len()
    }
}
