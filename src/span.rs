//! Span metadata and the intrusive lists that carry it.
//!
//! A span describes a contiguous run of pages. It is either intact (fresh
//! from the page cache), cut into equal cells for a central-cache bucket,
//! or an oversize run handed straight to a caller. Span structs live in a
//! dedicated metadata pool and are recycled, never freed to the OS.

use crate::config::{PAGE_SHIFT, PAGE_SIZE};
use crate::freelist::FreeCell;
use crate::pool::ObjectPool;
use crate::sync::SpinMutex;
use core::ptr;

/// Metadata for a contiguous run of pages.
#[repr(C)]
pub struct Span {
    /// Page number of the first page (address = page_id << PAGE_SHIFT).
    pub page_id: usize,
    /// Number of pages in the run.
    pub n: usize,
    /// Head of the cells carved from this span; null while intact or
    /// oversize.
    pub free_list: *mut FreeCell,
    /// Cells currently out to clients. Zero means every carved cell has
    /// returned.
    pub use_count: usize,
    /// True while the span is held out of the page cache.
    pub is_in_use: bool,
    /// Intrusive links for the circular list the span currently sits on.
    pub prev: *mut Span,
    pub next: *mut Span,
}

impl Span {
    /// Base address of the covered memory.
    #[inline]
    pub fn base_addr(&self) -> *mut u8 {
        (self.page_id << PAGE_SHIFT) as *mut u8
    }

    /// Total bytes covered.
    #[inline]
    pub fn byte_len(&self) -> usize {
        self.n * PAGE_SIZE
    }

    /// One past the last page ID.
    #[inline]
    pub fn end_page(&self) -> usize {
        self.page_id + self.n
    }
}

/// Intrusive circular doubly-linked span list with a sentinel head.
///
/// The sentinel is itself a pooled `Span`, allocated lazily the first time
/// the list is touched, so the list is const-constructible in statics.
pub struct SpanList {
    sentinel: *mut Span,
    len: usize,
}

// SAFETY: SpanList is only mutated under the owning tier's lock; the spans
// it links are pool-allocated and outlive any thread.
unsafe impl Send for SpanList {}

impl Default for SpanList {
    fn default() -> Self {
        Self::new()
    }
}

impl SpanList {
    pub const fn new() -> Self {
        Self {
            sentinel: ptr::null_mut(),
            len: 0,
        }
    }

    /// The sentinel node, allocating it on first use.
    fn sentinel(&mut self) -> *mut Span {
        if self.sentinel.is_null() {
            let s = alloc_span();
            unsafe {
                (*s).next = s;
                (*s).prev = s;
            }
            self.sentinel = s;
        }
        self.sentinel
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.sentinel.is_null() || unsafe { (*self.sentinel).next == self.sentinel }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// First span on the list, or [`end`](Self::end) when empty.
    #[inline]
    pub fn begin(&mut self) -> *mut Span {
        let head = self.sentinel();
        unsafe { (*head).next }
    }

    /// The sentinel: the off-the-end position for iteration.
    #[inline]
    pub fn end(&mut self) -> *mut Span {
        self.sentinel()
    }

    /// Link a detached span at the front.
    ///
    /// # Safety
    ///
    /// `span` must be valid and not on any list.
    pub unsafe fn push_front(&mut self, span: *mut Span) {
        debug_assert!(!span.is_null());
        let head = self.sentinel();
        unsafe {
            let first = (*head).next;
            (*span).prev = head;
            (*span).next = first;
            (*head).next = span;
            (*first).prev = span;
        }
        self.len += 1;
    }

    /// Detach and return the first span, or null when empty.
    ///
    /// # Safety
    ///
    /// The list's links must be well formed (maintained by `push_front`
    /// and `remove`).
    pub unsafe fn pop_front(&mut self) -> *mut Span {
        if self.is_empty() {
            return ptr::null_mut();
        }
        let first = unsafe { (*self.sentinel).next };
        unsafe { self.remove(first) };
        first
    }

    /// Unlink a span that is currently on this list.
    ///
    /// # Safety
    ///
    /// `span` must be on this list and must not be the sentinel.
    pub unsafe fn remove(&mut self, span: *mut Span) {
        debug_assert!(!span.is_null() && span != self.sentinel);
        unsafe {
            let prev = (*span).prev;
            let next = (*span).next;
            (*prev).next = next;
            (*next).prev = prev;
            (*span).prev = ptr::null_mut();
            (*span).next = ptr::null_mut();
        }
        self.len -= 1;
    }
}

/// Pool backing all span metadata.
static SPAN_POOL: SpinMutex<ObjectPool<Span>> = SpinMutex::new(ObjectPool::new());

/// Allocate a zero-initialized span struct from the metadata pool.
pub fn alloc_span() -> *mut Span {
    SPAN_POOL.lock().alloc()
}

/// Recycle a span struct.
///
/// # Safety
///
/// `span` must have come from [`alloc_span`] and must not be on any list.
pub unsafe fn free_span(span: *mut Span) {
    unsafe { SPAN_POOL.lock().free(span) };
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;

    #[test]
    fn test_alloc_span_zeroed_and_recycled() {
        let span = alloc_span();
        assert!(!span.is_null());
        unsafe {
            assert_eq!((*span).page_id, 0);
            assert_eq!((*span).n, 0);
            assert_eq!((*span).use_count, 0);
            assert!(!(*span).is_in_use);
            assert!((*span).free_list.is_null());
            assert!((*span).prev.is_null());
            assert!((*span).next.is_null());

            (*span).page_id = 42;
            (*span).n = 10;
            free_span(span);
        }

        // Reallocate: recycled spans come back zeroed. (The pool is shared
        // process-wide, so identity is not asserted.)
        let again = alloc_span();
        assert!(!again.is_null());
        unsafe {
            assert_eq!((*again).page_id, 0);
            free_span(again);
        }
    }

    #[test]
    fn test_span_addresses() {
        let span = alloc_span();
        unsafe {
            (*span).page_id = 100;
            (*span).n = 3;
            assert_eq!((*span).base_addr() as usize, 100 << PAGE_SHIFT);
            assert_eq!((*span).byte_len(), 3 * PAGE_SIZE);
            assert_eq!((*span).end_page(), 103);
            free_span(span);
        }
    }

    #[test]
    fn test_list_push_pop_remove() {
        let mut list = SpanList::new();
        assert!(list.is_empty());
        assert_eq!(list.len(), 0);

        let spans: Vec<*mut Span> = (0..3)
            .map(|i| {
                let s = alloc_span();
                unsafe { (*s).page_id = i };
                s
            })
            .collect();

        unsafe {
            list.push_front(spans[0]);
            list.push_front(spans[1]);
            list.push_front(spans[2]);
        }
        assert_eq!(list.len(), 3);
        assert_eq!(list.begin(), spans[2]);

        // Remove the middle element; neighbors re-link around it.
        unsafe { list.remove(spans[1]) };
        assert_eq!(list.len(), 2);
        unsafe {
            assert_eq!((*spans[2]).next, spans[0]);
            assert_eq!((*spans[0]).prev, spans[2]);
        }

        unsafe {
            assert_eq!(list.pop_front(), spans[2]);
            assert_eq!(list.pop_front(), spans[0]);
            assert!(list.pop_front().is_null());
        }
        assert!(list.is_empty());

        for s in spans {
            unsafe { free_span(s) };
        }
    }

    #[test]
    fn test_list_iteration_between_begin_and_end() {
        let mut list = SpanList::new();
        let spans: Vec<*mut Span> = (0..4)
            .map(|i| {
                let s = alloc_span();
                unsafe { (*s).page_id = i * 10 };
                s
            })
            .collect();
        for &s in &spans {
            unsafe { list.push_front(s) };
        }

        let mut seen = Vec::new();
        let end = list.end();
        let mut it = list.begin();
        while it != end {
            seen.push(unsafe { (*it).page_id });
            it = unsafe { (*it).next };
        }
        assert_eq!(seen, [30, 20, 10, 0]);

        loop {
            let s = unsafe { list.pop_front() };
            if s.is_null() {
                break;
            }
            unsafe { free_span(s) };
        }
    }
}
