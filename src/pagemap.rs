//! Page-ID -> span radix map.
//!
//! Three-level radix tree over the page-id space (48-bit virtual addresses
//! minus the page shift). Lookups are wait-free: links are `AtomicPtr`,
//! nodes are installed with Release and read with Acquire, and a node is
//! never deallocated once published. All writes happen under the page-cache
//! mutex. Interior and leaf nodes come from metadata pools whose slabs are
//! OS-backed, so the map never recurses into the allocator it serves.

use crate::config::PAGE_SHIFT;
use crate::pool::ObjectPool;
use crate::span::Span;
use crate::sync::SpinMutex;
use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};

/// Bits of page ID under a 48-bit virtual address space.
const BITS: usize = 48 - PAGE_SHIFT;
/// Bits consumed by each of the two interior levels (round up).
const INTERIOR_BITS: usize = (BITS + 2) / 3;
const INTERIOR_LEN: usize = 1 << INTERIOR_BITS;
/// Bits consumed at the leaf level.
const LEAF_BITS: usize = BITS - 2 * INTERIOR_BITS;
const LEAF_LEN: usize = 1 << LEAF_BITS;

#[repr(C)]
struct MidNode {
    children: [AtomicPtr<LeafNode>; INTERIOR_LEN],
}

#[repr(C)]
struct LeafNode {
    spans: [AtomicPtr<Span>; LEAF_LEN],
}

static MID_POOL: SpinMutex<ObjectPool<MidNode>> = SpinMutex::new(ObjectPool::new());
static LEAF_POOL: SpinMutex<ObjectPool<LeafNode>> = SpinMutex::new(ObjectPool::new());

/// Radix tree mapping page IDs to owning spans.
pub struct PageMap {
    root: [AtomicPtr<MidNode>; INTERIOR_LEN],
}

impl PageMap {
    #[allow(clippy::new_without_default)]
    pub const fn new() -> Self {
        Self {
            root: [const { AtomicPtr::new(ptr::null_mut()) }; INTERIOR_LEN],
        }
    }

    #[inline]
    fn split(page_id: usize) -> (usize, usize, usize) {
        let i1 = page_id >> (LEAF_BITS + INTERIOR_BITS);
        let i2 = (page_id >> LEAF_BITS) & (INTERIOR_LEN - 1);
        let i3 = page_id & (LEAF_LEN - 1);
        (i1, i2, i3)
    }

    /// Look up the span owning `page_id`. Null for ids never set. Wait-free
    /// and callable without any lock.
    #[inline]
    pub fn get(&self, page_id: usize) -> *mut Span {
        let (i1, i2, i3) = Self::split(page_id);
        if i1 >= INTERIOR_LEN {
            return ptr::null_mut();
        }
        let mid = self.root[i1].load(Ordering::Acquire);
        if mid.is_null() {
            return ptr::null_mut();
        }
        let leaf = unsafe { (*mid).children[i2].load(Ordering::Acquire) };
        if leaf.is_null() {
            return ptr::null_mut();
        }
        unsafe { (*leaf).spans[i3].load(Ordering::Acquire) }
    }

    /// Map one page ID to `span` (or null to clear).
    ///
    /// # Safety
    ///
    /// Must be called under the page-cache mutex; concurrent `set` calls
    /// would race on node installation.
    pub unsafe fn set(&self, page_id: usize, span: *mut Span) {
        let (i1, i2, i3) = Self::split(page_id);
        assert!(i1 < INTERIOR_LEN, "page id {page_id} out of map range");

        let mut mid = self.root[i1].load(Ordering::Acquire);
        if mid.is_null() {
            mid = MID_POOL.lock().alloc();
            // Publish fully-zeroed node before readers can see it.
            self.root[i1].store(mid, Ordering::Release);
        }

        let mut leaf = unsafe { (*mid).children[i2].load(Ordering::Acquire) };
        if leaf.is_null() {
            leaf = LEAF_POOL.lock().alloc();
            unsafe { (*mid).children[i2].store(leaf, Ordering::Release) };
        }

        unsafe { (*leaf).spans[i3].store(span, Ordering::Release) };
    }

    /// Map every page of `span` to it. Required for spans handed out of the
    /// page cache, because deallocation resolves arbitrary interior cells.
    ///
    /// # Safety
    ///
    /// Same as [`set`](Self::set).
    pub unsafe fn install_span(&self, span: *mut Span) {
        let start = unsafe { (*span).page_id };
        let count = unsafe { (*span).n };
        for page_id in start..start + count {
            unsafe { self.set(page_id, span) };
        }
    }

    /// Map only the first and last pages of `span`. Sufficient for free
    /// spans: coalescing reads exactly the pages adjacent to a released
    /// run, never an interior one.
    ///
    /// # Safety
    ///
    /// Same as [`set`](Self::set).
    pub unsafe fn install_bounds(&self, span: *mut Span) {
        let start = unsafe { (*span).page_id };
        let count = unsafe { (*span).n };
        unsafe { self.set(start, span) };
        if count > 1 {
            unsafe { self.set(start + count - 1, span) };
        }
    }
}
