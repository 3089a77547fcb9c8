//! Unit tests for x86_guest_pt crate.
//!
//! Page tables are built in a fake guest RAM and walked in every paging mode.

mod guest_mem;

mod paging_mode;
