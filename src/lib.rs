#![no_std]
#![doc = include_str!("../README.md")]

#[macro_use]
extern crate log;

#[cfg(test)]
extern crate alloc;

cfg_if::cfg_if! {
    if #[cfg(feature = "tracing")] {
        macro_rules! walk_trace {
            ($($arg:tt)*) => { trace!($($arg)*) };
        }
    } else {
        macro_rules! walk_trace {
            ($($arg:tt)*) => {};
        }
    }
}

mod addr;
mod ept;
mod error;
mod flags;
mod hal;
mod mode;
mod page_table;
mod translator;

#[cfg(test)]
mod tests;

pub use addr::{GuestPhysAddr, GuestVirtAddr, HostVirtAddr};
pub use ept::{EptAttrs, EptEntryFlags, EptMemType, EptPointer};
pub use error::{AccessKind, WalkError, WalkResult};
pub use flags::PageFlags;
pub use hal::{GuestCpuState, GuestPhysMemory, PagingFeatures};
pub use mode::{EntryFormat, LevelDesc, ModeDesc, PageSize, PagingMode};
pub use page_table::{GuestWalk, WalkedEntry};
pub use translator::GuestTranslator;
