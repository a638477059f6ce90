//! # Two-Level Paging and Virtual Memory
//!
//! 32-bit x86 protected-mode paging for a small kernel: page-directory and
//! page-table management, per-process address spaces, and the virtual
//! memory mapper the rest of the kernel allocates pages through.
//!
//! ## Virtual address walk
//!
//! ```text
//! | 31‒22     | 21‒12 | 11‒0   |
//! | directory | table | offset |
//! ```
//!
//! CR3 points at a 1024-entry page directory; each present entry points at
//! a 1024-entry page table; each present table entry maps one 4 KiB frame.
//!
//! ## The flat window
//!
//! Directory slot [`WINDOW_DIRECTORY_SLOT`] of every address space points
//! back at the space's own root. Through that recursion the 4 MiB of
//! kernel virtual space at [`WINDOW_BASE`] exposes all 1024 page tables of
//! the *currently targeted* space as one flat array: window page `i` is
//! page table `i`, and window page 1022 is the directory itself.
//!
//! Most directory slots start out *sparse*, reserved but without a backing
//! table. Touching the window over a sparse slot faults; the page-fault
//! hook ([`FlatWindow::handle_fault`]) reserves a frame, installs it as a
//! zeroed table and retries the access. This way `map_page` can treat any
//! address space as a flat array without pre-allocating up to 1024 tables
//! that are mostly never used.
//!
//! ## What you get
//! - [`PageTableEntry`] / [`PageFlags`] entry types and the [`PageTable`]
//!   page wrapper.
//! - The [`PageTables`] accessor trait, the single seam over raw table
//!   memory. [`WindowTables`] is the hardware implementation over the flat
//!   window; [`IdentityTables`] serves the pre-paging bootstrap; tests run
//!   against simulated physical memory.
//! - Address-space bootstrap ([`setup_kernel_space`],
//!   [`create_process_space`], [`destroy_process_space`]).
//! - The mapper ([`map_page`], [`map_next_unallocated`], [`alloc_pages`],
//!   [`dealloc_pages`]) and the [`MemoryManager`] facade that serializes
//!   it all behind one edit lock.

#![cfg_attr(not(test), no_std)]
#![allow(clippy::cast_possible_truncation)]

pub mod arch;

mod access;
mod entry;
mod manager;
#[cfg(test)]
mod sim;
mod space;
mod table;
mod vmm;
mod window;

pub use access::{IdentityTables, WindowTables};
pub use entry::{PageFlags, PageTableEntry};
pub use manager::{HeapBacking, MemoryManager};
pub use space::{AddressSpace, create_process_space, destroy_process_space, setup_kernel_space};
pub use table::PageTable;
pub use vmm::{MAX_ALLOC_PAGES, MapError, alloc_pages, dealloc_pages, map_next_unallocated, map_page, unmap};
pub use window::{FaultContext, FaultOutcome, FlatWindow, PageFaultCode};

use mm_addr::{PhysicalAddress, VirtualAddress};

/// Directory slot holding the self-map that backs the flat window.
pub const WINDOW_DIRECTORY_SLOT: usize = 1022;

/// First virtual address of the flat window (4 MiB long).
pub const WINDOW_BASE: VirtualAddress = VirtualAddress::from_indices(WINDOW_DIRECTORY_SLOT, 0);

/// Directory slot of the auto-growing process stack.
pub const STACK_DIRECTORY_SLOT: usize = 1023;

/// Table slot of the topmost stack page within [`STACK_DIRECTORY_SLOT`].
pub const STACK_TABLE_SLOT: usize = 1023;

/// Identity-mapped pages at the bottom of every space (the first MiB);
/// the mapper never allocates virtual addresses below this.
pub const IDENTITY_PAGES: usize = 256;

/// Access to the paging structures of a target address space.
///
/// This is the only seam through which the mapper, the bootstrap code and
/// the fault hook touch raw table memory. Entries are addressed either by
/// (directory, table) position within the current target, or directly by
/// the physical frame holding a paging structure (used while a space is
/// still being wired up and has no self-map to reach it through).
pub trait PageTables {
    /// Root directory frame of the space currently exposed by the flat
    /// view.
    fn target(&self) -> PhysicalAddress;

    /// Point the flat view at another space's root.
    fn retarget(&mut self, root: PhysicalAddress);

    /// Read entry `index` of the paging structure stored in `frame`.
    fn read_frame_entry(&self, frame: PhysicalAddress, index: usize) -> PageTableEntry;

    /// Write entry `index` of the paging structure stored in `frame`.
    fn write_frame_entry(&mut self, frame: PhysicalAddress, index: usize, entry: PageTableEntry);

    /// Fill one frame with zeroes before it is installed as a table.
    fn zero_frame(&mut self, frame: PhysicalAddress);

    /// Drop any cached translation for `va`.
    fn invalidate(&mut self, va: VirtualAddress);

    /// Directory entry `index` of the target space.
    fn directory_entry(&self, index: usize) -> PageTableEntry {
        self.read_frame_entry(self.target(), index)
    }

    fn set_directory_entry(&mut self, index: usize, entry: PageTableEntry) {
        let root = self.target();
        self.write_frame_entry(root, index, entry);
    }

    /// Leaf entry at (`directory`, `table`) of the target space. The
    /// directory entry must be present.
    fn table_entry(&self, directory: usize, table: usize) -> PageTableEntry {
        let dir = self.directory_entry(directory);
        debug_assert!(dir.present());
        self.read_frame_entry(dir.frame_address(), table)
    }

    fn set_table_entry(&mut self, directory: usize, table: usize, entry: PageTableEntry) {
        let dir = self.directory_entry(directory);
        debug_assert!(dir.present());
        self.write_frame_entry(dir.frame_address(), table, entry);
    }
}
