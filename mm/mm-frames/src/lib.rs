//! # Physical Frame Allocator
//!
//! Tracks the present/in-use status of every 4 KiB physical page frame and
//! services frame reservation and release for the rest of the memory core.
//!
//! The frame table is a flat array indexed by frame number, never by
//! pointer, sized from the firmware memory map at boot:
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │                 FrameAllocator                   │
//! │   SpinLock around the table; reserve / release   │
//! └───────────────────────┬──────────────────────────┘
//! ┌───────────────────────▼──────────────────────────┐
//! │                   FrameTable                     │
//! │   one {present, in_use} slot per physical frame  │
//! └───────────────────────┬──────────────────────────┘
//! ┌───────────────────────▼──────────────────────────┐
//! │               firmware memory map                │
//! │   (base, length, kind) ranges from the loader    │
//! └──────────────────────────────────────────────────┘
//! ```
//!
//! Before paging is active the table storage itself must live at the highest
//! usable physical address (so it collides with nothing already in use) and
//! is reached through identity-mapped addresses; [`FrameTableSizing`]
//! computes that placement. The table borrows its slot storage with an
//! explicit lifetime, which also lets the test suite run the allocator
//! against synthetic memory maps without booting real hardware.

#![cfg_attr(not(test), no_std)]
#![allow(unsafe_code)]

mod allocator;
mod region;
mod table;

pub use allocator::FrameAllocator;
pub use region::{E820Entry, MemoryRegion, RegionKind, log_map};
pub use table::{FrameSlot, FrameTable, FrameTableSizing, LegacyLayout, MAX_FRAMES};
