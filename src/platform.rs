//! OS interface: obtaining and releasing raw virtual memory.
//!
//! The entire contract with the OS is: given k pages, return a page-aligned
//! readable/writable virtual range; given a range and its byte length,
//! release it. Exhaustion is fatal (the allocator offers no recovery), so
//! failure panics here rather than threading nulls through every tier.

use crate::config::{PAGE_SHIFT, PAGE_SIZE};

#[cfg(unix)]
mod unix;

#[cfg(windows)]
mod windows;

/// Allocate `k_pages` pages of virtual memory, aligned to [`PAGE_SIZE`].
///
/// Panics if the OS refuses; under `panic = "abort"` this aborts the
/// process, which is the documented out-of-memory behavior.
#[inline]
pub fn os_alloc(k_pages: usize) -> *mut u8 {
    let bytes = k_pages << PAGE_SHIFT;
    let ptr = {
        #[cfg(unix)]
        {
            unsafe { unix::os_alloc(bytes) }
        }
        #[cfg(windows)]
        {
            unsafe { windows::os_alloc(bytes) }
        }
    };
    assert!(
        !ptr.is_null(),
        "system allocation of {} pages failed",
        k_pages
    );
    debug_assert!(ptr as usize % PAGE_SIZE == 0);
    ptr
}

/// Release a range previously obtained from [`os_alloc`].
///
/// # Safety
///
/// `ptr` must have been returned by `os_alloc` and `bytes` must be the full
/// length of that allocation. The range must no longer be referenced.
#[inline]
pub unsafe fn os_free(ptr: *mut u8, bytes: usize) {
    #[cfg(unix)]
    {
        unsafe { unix::os_free(ptr, bytes) };
    }
    #[cfg(windows)]
    {
        unsafe { windows::os_free(ptr, bytes) };
    }
}
