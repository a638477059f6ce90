//! Zone-based kernel heap.
//!
//! The heap is a singly linked list of *zones*, each a page-multiple slab
//! obtained from a [`ZoneBacking`]. Every zone carries a chain of block
//! headers describing allocated and free byte runs. Allocation is first-fit
//! across zones; when no zone can satisfy a request the heap grows, either
//! by extending the last zone in place (when the backing hands back memory
//! directly after it) or by appending a fresh zone.

#![cfg_attr(not(test), no_std)]

mod heap;
mod zone;

pub use heap::{Heap, ZoneBacking};
pub use zone::MIN_ZONE_SIZE_PAGES;
