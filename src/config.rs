//! Compile-time tunables, generated by build.rs from spanalloc.toml.
//!
//! Defaults: 8 KiB pages (`PAGE_SHIFT = 13`), `MAX_PAGES = 128`,
//! `MAX_BATCH = 512`, 128 KiB metadata slabs.

include!(concat!(env!("OUT_DIR"), "/config_gen.rs"));

const _: () = assert!(PAGE_SIZE == 1 << PAGE_SHIFT);
const _: () = assert!(MAX_PAGES >= 2);
const _: () = assert!(MAX_BATCH >= 2);
const _: () = assert!(METADATA_SLAB_SIZE % PAGE_SIZE == 0);
