//! [`PageTables`] implementations for real hardware.
//!
//! [`WindowTables`] is the post-boot accessor: it reads and writes paging
//! structures through the flat window plus a handful of fixed kernel
//! mappings wired up by [`setup_kernel_space`](crate::space::setup_kernel_space).
//! [`IdentityTables`] serves the short pre-paging window at boot, where
//! physical addresses are directly dereferenceable.
//!
//! Tests never construct either; they run against simulated frames.

use crate::entry::{PageFlags, PageTableEntry};
use crate::table::PageTable;
use crate::{PageTables, WINDOW_BASE, WINDOW_DIRECTORY_SLOT, arch};
use mm_addr::{PAGE_SIZE, PhysicalAddress, VirtualAddress};

/// Page-table-0 slot mapping the kernel directory at a fixed address.
pub(crate) const DIRECTORY_VIEW_SLOT: usize = 1022;
/// Page-table-0 slot mapping page table 0 itself, so its entries (and with
/// them the scratch slot) stay editable after paging is on.
pub(crate) const TABLE0_VIEW_SLOT: usize = 1023;
/// Page-table-0 slot remapped at will to reach arbitrary frames.
pub(crate) const SCRATCH_SLOT: usize = 1021;

const DIRECTORY_VIEW: VirtualAddress = VirtualAddress::from_indices(0, DIRECTORY_VIEW_SLOT);
const TABLE0_VIEW: VirtualAddress = VirtualAddress::from_indices(0, TABLE0_VIEW_SLOT);
const SCRATCH_VIEW: VirtualAddress = VirtualAddress::from_indices(0, SCRATCH_SLOT);

/// Window page exposing the target's directory (the self-map read through
/// itself).
const WINDOW_DIRECTORY: VirtualAddress =
    VirtualAddress::from_indices(WINDOW_DIRECTORY_SLOT, WINDOW_DIRECTORY_SLOT);

/// Paging-structure access through the flat window.
///
/// Positional reads and writes go through the window and may fault on
/// sparse directory slots, which is exactly what materializes the missing
/// table. Frame-addressed access goes through the scratch mapping instead
/// and never faults; space construction and teardown rely on that, since a
/// half-built space cannot be reached through a self-map yet.
pub struct WindowTables {
    directory: *mut PageTable,
    table0: *mut PageTable,
    kernel_root: PhysicalAddress,
    target: PhysicalAddress,
}

// One instance exists, owned by the memory manager behind its edit lock.
unsafe impl Send for WindowTables {}

impl WindowTables {
    /// # Safety
    ///
    /// Paging must be live on a directory produced by
    /// [`setup_kernel_space`](crate::space::setup_kernel_space), which
    /// installs the fixed directory/table-0 views this accessor
    /// dereferences.
    #[must_use]
    pub unsafe fn new(kernel_root: PhysicalAddress) -> Self {
        Self {
            directory: DIRECTORY_VIEW.as_mut_ptr(),
            table0: TABLE0_VIEW.as_mut_ptr(),
            kernel_root,
            target: kernel_root,
        }
    }

    /// Map `frame` at the scratch slot and return a pointer to it.
    fn scratch(&self, frame: PhysicalAddress) -> *mut PageTable {
        // SAFETY: table 0 is permanently mapped at TABLE0_VIEW; rewriting
        // the scratch slot only retargets SCRATCH_VIEW.
        unsafe {
            (*self.table0).entries[SCRATCH_SLOT] = PageTableEntry::leaf(frame, PageFlags::WRITABLE);
        }
        arch::invalidate_page(SCRATCH_VIEW);
        SCRATCH_VIEW.as_mut_ptr()
    }

    fn window_table(directory: usize) -> *mut PageTable {
        (WINDOW_BASE + (directory as u32) * PAGE_SIZE).as_mut_ptr()
    }
}

impl PageTables for WindowTables {
    fn target(&self) -> PhysicalAddress {
        self.target
    }

    fn retarget(&mut self, root: PhysicalAddress) {
        if root == self.target {
            return;
        }
        self.target = root;
        // SAFETY: the directory view is permanently mapped.
        unsafe {
            (*self.directory).entries[WINDOW_DIRECTORY_SLOT] = PageTableEntry::new()
                .with_present(true)
                .with_writable(true)
                .with_frame_address(root);
        }
        // The window spans 4 MiB; a full non-global flush is cheaper than
        // 1024 invlpgs.
        // SAFETY: reloading the root the CPU is already running on.
        unsafe { arch::reload_root(self.kernel_root) };
    }

    fn read_frame_entry(&self, frame: PhysicalAddress, index: usize) -> PageTableEntry {
        // SAFETY: scratch() just mapped the frame.
        unsafe { (*self.scratch(frame)).entries[index] }
    }

    fn write_frame_entry(&mut self, frame: PhysicalAddress, index: usize, entry: PageTableEntry) {
        // SAFETY: scratch() just mapped the frame.
        unsafe { (*self.scratch(frame)).entries[index] = entry };
    }

    fn zero_frame(&mut self, frame: PhysicalAddress) {
        let table = self.scratch(frame);
        // SAFETY: scratch() just mapped the frame; a frame is one page.
        unsafe { core::ptr::write_bytes(table.cast::<u8>(), 0, PAGE_SIZE as usize) };
    }

    fn invalidate(&mut self, va: VirtualAddress) {
        arch::invalidate_page(va);
    }

    fn directory_entry(&self, index: usize) -> PageTableEntry {
        // SAFETY: the self-map makes the target's directory visible at the
        // window's own slot.
        unsafe { (*WINDOW_DIRECTORY.as_mut_ptr::<PageTable>()).entries[index] }
    }

    fn set_directory_entry(&mut self, index: usize, entry: PageTableEntry) {
        // SAFETY: as above; the directory page is always present.
        unsafe { (*WINDOW_DIRECTORY.as_mut_ptr::<PageTable>()).entries[index] = entry };
    }

    fn table_entry(&self, directory: usize, table: usize) -> PageTableEntry {
        // SAFETY: window page `directory` maps that page table; a sparse
        // slot faults here and the hook installs the table before the read
        // retries.
        unsafe { (*Self::window_table(directory)).entries[table] }
    }

    fn set_table_entry(&mut self, directory: usize, table: usize, entry: PageTableEntry) {
        // SAFETY: as above.
        unsafe { (*Self::window_table(directory)).entries[table] = entry };
    }
}

/// Pre-paging accessor: physical and virtual addresses coincide, so table
/// frames are dereferenced directly.
///
/// Only valid between the firmware handoff and
/// [`arch::enable_paging`]; [`setup_kernel_space`](crate::space::setup_kernel_space)
/// is its one caller.
pub struct IdentityTables {
    target: PhysicalAddress,
}

impl IdentityTables {
    /// # Safety
    ///
    /// Paging must be disabled (or the whole of RAM identity-mapped), and
    /// every frame handed to accessor methods must be ordinary RAM.
    #[must_use]
    pub const unsafe fn new() -> Self {
        Self {
            target: PhysicalAddress::zero(),
        }
    }

    fn frame_ptr(frame: PhysicalAddress) -> *mut PageTable {
        frame.as_u32() as usize as *mut PageTable
    }
}

impl PageTables for IdentityTables {
    fn target(&self) -> PhysicalAddress {
        self.target
    }

    fn retarget(&mut self, root: PhysicalAddress) {
        self.target = root;
    }

    fn read_frame_entry(&self, frame: PhysicalAddress, index: usize) -> PageTableEntry {
        // SAFETY: identity mapping per the constructor contract.
        unsafe { (*Self::frame_ptr(frame)).entries[index] }
    }

    fn write_frame_entry(&mut self, frame: PhysicalAddress, index: usize, entry: PageTableEntry) {
        // SAFETY: identity mapping per the constructor contract.
        unsafe { (*Self::frame_ptr(frame)).entries[index] = entry };
    }

    fn zero_frame(&mut self, frame: PhysicalAddress) {
        // SAFETY: identity mapping per the constructor contract.
        unsafe { core::ptr::write_bytes(Self::frame_ptr(frame).cast::<u8>(), 0, PAGE_SIZE as usize) };
    }

    fn invalidate(&mut self, _va: VirtualAddress) {
        // Nothing cached yet.
    }
}
