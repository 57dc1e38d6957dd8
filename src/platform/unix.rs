//! Unix virtual memory via mmap/munmap.

use crate::config::PAGE_SIZE;
use core::ffi::c_void;
use core::ptr;

const PROT_RW: i32 = 0x1 | 0x2; // PROT_READ | PROT_WRITE
const MAP_ANON_PRIVATE: i32 = 0x20 | 0x02; // MAP_ANONYMOUS | MAP_PRIVATE

unsafe extern "C" {
    fn mmap(
        addr: *mut c_void,
        length: usize,
        prot: i32,
        flags: i32,
        fd: i32,
        offset: i64,
    ) -> *mut c_void;

    fn munmap(addr: *mut c_void, length: usize) -> i32;
}

/// One anonymous private mapping of `len` bytes, or null.
unsafe fn map_anon(len: usize) -> *mut u8 {
    let p = unsafe { mmap(ptr::null_mut(), len, PROT_RW, MAP_ANON_PRIVATE, -1, 0) };
    if p as isize == -1 { ptr::null_mut() } else { p as *mut u8 }
}

/// The allocator's page size (8 KiB by default) exceeds the kernel's, and
/// mmap only promises kernel-page alignment. Map the exact size first and
/// keep it when the kernel happens to align it; otherwise remap with one
/// allocator page of slack and shave the misalignment delta off the ends.
pub unsafe fn os_alloc(size: usize) -> *mut u8 {
    let direct = unsafe { map_anon(size) };
    if direct.is_null() {
        return ptr::null_mut();
    }
    if direct as usize & (PAGE_SIZE - 1) == 0 {
        return direct;
    }
    unsafe { munmap(direct as *mut c_void, size) };

    let padded = unsafe { map_anon(size + PAGE_SIZE) };
    if padded.is_null() {
        return ptr::null_mut();
    }
    let rem = padded as usize & (PAGE_SIZE - 1);
    if rem == 0 {
        // Already aligned: the whole slack page hangs off the end.
        unsafe { munmap(padded.add(size) as *mut c_void, PAGE_SIZE) };
        return padded;
    }
    // The slack page splits into `delta` before the aligned start and
    // `rem` after the chosen range.
    let delta = PAGE_SIZE - rem;
    unsafe {
        munmap(padded as *mut c_void, delta);
        munmap(padded.add(delta + size) as *mut c_void, rem);
        padded.add(delta)
    }
}

pub unsafe fn os_free(ptr: *mut u8, size: usize) {
    unsafe { munmap(ptr as *mut c_void, size) };
}
