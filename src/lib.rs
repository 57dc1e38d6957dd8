#![no_std]
#![cfg_attr(feature = "nightly", feature(thread_local))]

//! spanalloc: a thread-caching memory allocator.
//!
//! Three strictly layered caches serve every request:
//! - Thread cache: per-thread free lists, no locks on the fast path
//! - Central cache: per-size-class span lists, one lock per bucket
//! - Page cache: span split/coalesce over OS page runs, one lock
//!
//! # Usage
//!
//! ```ignore
//! #[global_allocator]
//! static GLOBAL: spanalloc::SpanAlloc = spanalloc::SpanAlloc;
//! ```
//!
//! Or call [`allocate`]/[`deallocate`] directly when the caller tracks
//! allocation sizes itself.

#[cfg(test)]
extern crate alloc;
#[cfg(any(test, feature = "std"))]
extern crate std;

pub mod allocator;
pub mod central_cache;
pub mod config;
#[cfg(feature = "ffi")]
pub mod ffi;
pub mod freelist;
pub mod page_cache;
pub mod pagemap;
pub mod platform;
pub mod pool;
pub mod size_class;
pub mod span;
pub mod sync;
pub mod thread_cache;

pub use allocator::{SpanAlloc, allocate, deallocate};
pub use config::{PAGE_SHIFT, PAGE_SIZE};

// Panic handler for staticlib builds (no_std has no default panic handler).
// Only active when panic="abort" (i.e., the `fast` profile), not during normal checks.
#[cfg(all(feature = "ffi", not(test), not(feature = "std"), panic = "abort"))]
#[panic_handler]
fn panic(_: &core::panic::PanicInfo) -> ! {
    unsafe extern "C" {
        fn abort() -> !;
    }
    unsafe { abort() }
}
