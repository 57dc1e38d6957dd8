//! Top-level allocator: ties the three tiers together.
//!
//! The shared tiers are never-destroyed statics; the thread cache is native
//! TLS, created lazily on a thread's first allocation and drained back to
//! the central cache on exit where the platform allows it.
//!
//! Cache strategy (fastest to slowest):
//! - `nightly` feature: `#[thread_local]` with const-init (single TLS read)
//! - `std` feature: `std::thread_local!` with const-init
//! - neither: central free lists only (locked on every call)

use crate::central_cache::CentralCache;
use crate::config::{PAGE_SHIFT, PAGE_SIZE};
use crate::freelist::FreeCell;
use crate::page_cache::PageCache;
use crate::pagemap::PageMap;
use crate::size_class::{self, MAX_SMALL};
use crate::sync::SpinMutex;
use core::alloc::{GlobalAlloc, Layout};

#[cfg(any(feature = "nightly", feature = "std"))]
use crate::thread_cache::ThreadCache;

pub(crate) static PAGE_MAP: PageMap = PageMap::new();
pub(crate) static PAGE_CACHE: SpinMutex<PageCache> = SpinMutex::new(PageCache::new(&PAGE_MAP));
pub(crate) static CENTRAL_CACHE: CentralCache = CentralCache::new();

cfg_if::cfg_if! {
    if #[cfg(feature = "nightly")] {
        #[derive(Clone, Copy, PartialEq)]
        #[repr(u8)]
        enum TlsState {
            Uninitialized = 0,
            Active = 1,
            Destroyed = 2,
        }

        struct TlsSlot {
            state: TlsState,
            cache: ThreadCache,
        }

        #[thread_local]
        static mut TC: TlsSlot = TlsSlot {
            state: TlsState::Uninitialized,
            cache: ThreadCache::new(),
        };

        /// Raw pointer to this thread's cache.
        #[inline(always)]
        unsafe fn tc() -> *mut ThreadCache {
            unsafe { core::ptr::addr_of_mut!(TC.cache) }
        }

        /// Drain the cache and mark the slot Destroyed (reentrancy-safe).
        #[cold]
        #[allow(dead_code)] // Only reachable from the std cleanup guard.
        unsafe fn tc_destroy() {
            unsafe {
                if TC.state == TlsState::Active {
                    TC.state = TlsState::Destroyed;
                    (*tc()).drain(&CENTRAL_CACHE, &PAGE_CACHE, &PAGE_MAP);
                }
            }
        }

        #[cold]
        #[inline(never)]
        unsafe fn tc_init() {
            // Mark Active BEFORE registering cleanup: if registration
            // allocates, the reentrant call must find a usable cache.
            unsafe { TC.state = TlsState::Active };
            tc_cleanup::register();
        }

        #[cfg(feature = "std")]
        mod tc_cleanup {
            struct Guard;

            impl Drop for Guard {
                fn drop(&mut self) {
                    if unsafe { super::TC.state } == super::TlsState::Active {
                        unsafe { super::tc_destroy() };
                    }
                }
            }

            std::thread_local! {
                static GUARD: Guard = const { Guard };
            }

            pub(super) fn register() {
                // try_with: if std's TLS is already tearing down, skip;
                // the cache leaks its cells to the central tier instead.
                let _ = GUARD.try_with(|_| {});
            }
        }

        #[cfg(not(feature = "std"))]
        mod tc_cleanup {
            pub(super) fn register() {}
        }

        #[inline(always)]
        fn alloc_small(size: usize) -> *mut u8 {
            unsafe {
                if TC.state == TlsState::Active {
                    return (*tc()).allocate(size, &CENTRAL_CACHE, &PAGE_CACHE);
                }
            }
            alloc_small_slow(size)
        }

        #[cold]
        #[inline(never)]
        fn alloc_small_slow(size: usize) -> *mut u8 {
            unsafe {
                if TC.state == TlsState::Uninitialized {
                    tc_init();
                    return (*tc()).allocate(size, &CENTRAL_CACHE, &PAGE_CACHE);
                }
            }
            alloc_from_central(size)
        }

        #[inline(always)]
        unsafe fn dealloc_small(ptr: *mut u8, size: usize) {
            unsafe {
                if TC.state == TlsState::Active {
                    (*tc()).deallocate(ptr, size, &CENTRAL_CACHE, &PAGE_CACHE, &PAGE_MAP);
                    return;
                }
                dealloc_to_central(ptr, size);
            }
        }
    } else if #[cfg(feature = "std")] {
        // The TLS value itself must stay Drop-free: registering a TLS
        // destructor can allocate on some platforms, and a Drop here would
        // make that registration reentrant into the allocator. Threads
        // that exit with a populated cache strand those cells; the batch
        // watermark keeps the amount small.
        std::thread_local! {
            static TC_CELL: core::cell::UnsafeCell<ThreadCache> = const {
                core::cell::UnsafeCell::new(ThreadCache::new())
            };
        }

        #[inline(always)]
        fn alloc_small(size: usize) -> *mut u8 {
            TC_CELL
                .try_with(|cell| unsafe {
                    (*cell.get()).allocate(size, &CENTRAL_CACHE, &PAGE_CACHE)
                })
                .unwrap_or_else(|_| alloc_from_central(size))
        }

        #[inline(always)]
        unsafe fn dealloc_small(ptr: *mut u8, size: usize) {
            let done = TC_CELL.try_with(|cell| unsafe {
                (*cell.get()).deallocate(ptr, size, &CENTRAL_CACHE, &PAGE_CACHE, &PAGE_MAP);
            });
            if done.is_err() {
                unsafe { dealloc_to_central(ptr, size) };
            }
        }
    } else {
        #[inline(always)]
        fn alloc_small(size: usize) -> *mut u8 {
            alloc_from_central(size)
        }

        #[inline(always)]
        unsafe fn dealloc_small(ptr: *mut u8, size: usize) {
            unsafe { dealloc_to_central(ptr, size) };
        }
    }
}

/// No usable thread cache: take a single cell straight from the central
/// tier.
fn alloc_from_central(size: usize) -> *mut u8 {
    let index = size_class::bucket_index(size);
    let aligned = size_class::round_up(size);
    let (n, start, _end) =
        unsafe { CENTRAL_CACHE.fetch_range(index, aligned, 1, &PAGE_CACHE) };
    debug_assert_eq!(n, 1);
    start as *mut u8
}

unsafe fn dealloc_to_central(ptr: *mut u8, size: usize) {
    let aligned = size_class::round_up(size);
    let cell = ptr as *mut FreeCell;
    unsafe {
        (*cell).next = core::ptr::null_mut();
        CENTRAL_CACHE.release_cells(cell, aligned, &PAGE_CACHE, &PAGE_MAP);
    }
}

/// Oversize: whole page runs from the page cache, bypassing both caches.
fn allocate_pages(bytes: usize) -> *mut u8 {
    let k = (bytes >> PAGE_SHIFT).max(1);
    let span = {
        let mut pc = PAGE_CACHE.lock();
        unsafe { pc.new_span(k) }
    };
    unsafe { (*span).base_addr() }
}

unsafe fn deallocate_pages(ptr: *mut u8) {
    // The map read is lock-free; only the release itself takes the mutex.
    let span = PAGE_MAP.get((ptr as usize) >> PAGE_SHIFT);
    debug_assert!(!span.is_null(), "freed pointer not owned by the allocator");
    if span.is_null() {
        return;
    }
    let mut pc = PAGE_CACHE.lock();
    unsafe { pc.release_span(span) };
}

/// Allocate `size` bytes. The pointer is aligned to the size class's
/// alignment (at least 8 bytes; page-aligned for oversize requests) and
/// its contents are arbitrary. Aborts the process if the OS is out of
/// memory.
pub fn allocate(size: usize) -> *mut u8 {
    if size > MAX_SMALL {
        return allocate_pages(size_class::round_up(size));
    }
    let size = if size == 0 { 1 } else { size };
    alloc_small(size)
}

/// Release a pointer previously returned by [`allocate`].
///
/// # Safety
///
/// `ptr` must come from `allocate` and not have been freed since. `size`
/// must equal the originally requested size, or any size that rounds to
/// the same size class (same page count for oversize requests).
pub unsafe fn deallocate(ptr: *mut u8, size: usize) {
    if ptr.is_null() {
        return;
    }
    if size > MAX_SMALL {
        return unsafe { deallocate_pages(ptr) };
    }
    let size = if size == 0 { 1 } else { size };
    unsafe { dealloc_small(ptr, size) }
}

/// Where a `(size, align)` request is served from.
enum Route {
    Small(usize),
    Pages(usize),
    Unsupported,
}

fn route(size: usize, align: usize) -> Route {
    if align <= 8 {
        if size <= MAX_SMALL {
            Route::Small(size)
        } else {
            Route::Pages(size_class::round_up(size))
        }
    } else if align > PAGE_SIZE {
        // Aligned-alloc beyond page alignment is out of scope.
        Route::Unsupported
    } else {
        // Cells sit at multiples of the class size from a page-aligned
        // base, so a class serves this alignment only when its size is a
        // multiple of it. Otherwise page alignment always suffices.
        let effective = size.max(align);
        if effective <= MAX_SMALL && size_class::round_up(effective) % align == 0 {
            Route::Small(effective)
        } else {
            Route::Pages(size_class::round_up_to(effective, PAGE_SIZE))
        }
    }
}

/// The allocator as a [`GlobalAlloc`].
///
/// ```ignore
/// #[global_allocator]
/// static GLOBAL: spanalloc::SpanAlloc = spanalloc::SpanAlloc;
/// ```
pub struct SpanAlloc;

unsafe impl GlobalAlloc for SpanAlloc {
    #[inline]
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let size = layout.size();
        if size == 0 {
            return layout.align() as *mut u8;
        }
        match route(size, layout.align()) {
            Route::Small(effective) => allocate(effective),
            Route::Pages(bytes) => allocate_pages(bytes),
            Route::Unsupported => core::ptr::null_mut(),
        }
    }

    #[inline]
    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if layout.size() == 0 {
            return;
        }
        match route(layout.size(), layout.align()) {
            Route::Small(effective) => unsafe { deallocate(ptr, effective) },
            Route::Pages(_) => unsafe { deallocate_pages(ptr) },
            Route::Unsupported => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_small_is_aligned_and_usable() {
        for size in [1usize, 6, 8, 100, 128, 129, 1024, 5000, MAX_SMALL] {
            let p = allocate(size);
            assert!(!p.is_null());
            assert_eq!(p as usize % 8, 0, "size {size}");
            unsafe {
                p.write_bytes(0x5A, size);
                assert_eq!(*p, 0x5A);
                assert_eq!(*p.add(size - 1), 0x5A);
                deallocate(p, size);
            }
        }
    }

    #[test]
    fn test_oversize_round_trip() {
        let size = 300 * 1024;
        let p = allocate(size);
        assert!(!p.is_null());
        assert_eq!(p as usize % PAGE_SIZE, 0);
        unsafe {
            p.write_bytes(0xC3, size);
            assert_eq!(*p.add(size - 1), 0xC3);
            deallocate(p, size);
        }
    }

    #[test]
    fn test_oversize_beyond_page_cache_limit() {
        // More pages than the page cache files: served and released
        // directly against the OS.
        let size = (crate::config::MAX_PAGES + 1) * PAGE_SIZE;
        let p = allocate(size);
        assert!(!p.is_null());
        unsafe {
            *p = 1;
            *p.add(size - 1) = 2;
            deallocate(p, size);
        }
    }

    #[test]
    fn test_global_alloc_small_alignments() {
        let a = SpanAlloc;
        for align in [1usize, 2, 4, 8] {
            for size in [1usize, 7, 64, 1000] {
                let layout = Layout::from_size_align(size.max(align), align).unwrap();
                let p = unsafe { a.alloc(layout) };
                assert!(!p.is_null());
                assert_eq!(p as usize % align, 0);
                unsafe { a.dealloc(p, layout) };
            }
        }
    }

    #[test]
    fn test_global_alloc_over_aligned() {
        let a = SpanAlloc;
        for align in [16usize, 64, 256, 4096, PAGE_SIZE] {
            let layout = Layout::from_size_align(align, align).unwrap();
            let p = unsafe { a.alloc(layout) };
            assert!(!p.is_null(), "align {align}");
            assert_eq!(p as usize % align, 0, "align {align}");
            unsafe {
                p.write_bytes(0xEE, align);
                a.dealloc(p, layout);
            }
        }
    }

    #[test]
    fn test_global_alloc_class_not_multiple_of_align() {
        // 24-byte class is not 16-aligned, so this must take the page
        // path and still come back 16-aligned.
        let a = SpanAlloc;
        let layout = Layout::from_size_align(17, 16).unwrap();
        let p = unsafe { a.alloc(layout) };
        assert!(!p.is_null());
        assert_eq!(p as usize % 16, 0);
        unsafe { a.dealloc(p, layout) };
    }

    #[test]
    fn test_global_alloc_zero_size() {
        let a = SpanAlloc;
        let layout = Layout::from_size_align(0, 8).unwrap();
        let p = unsafe { a.alloc(layout) };
        assert_eq!(p as usize, 8);
        unsafe { a.dealloc(p, layout) };
    }

    #[test]
    fn test_global_alloc_unsupported_alignment() {
        let a = SpanAlloc;
        let layout = Layout::from_size_align(PAGE_SIZE * 2, PAGE_SIZE * 2).unwrap();
        let p = unsafe { a.alloc(layout) };
        assert!(p.is_null());
    }
}
