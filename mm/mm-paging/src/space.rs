//! Address-space construction and teardown.

use crate::access::{DIRECTORY_VIEW_SLOT, SCRATCH_SLOT, TABLE0_VIEW_SLOT};
use crate::entry::{PageFlags, PageTableEntry};
use crate::vmm::MapError;
use crate::{IDENTITY_PAGES, PageTables, STACK_DIRECTORY_SLOT, STACK_TABLE_SLOT, WINDOW_DIRECTORY_SLOT, arch};
use mm_addr::{PhysicalAddress, TABLE_ENTRIES};
use mm_frames::FrameAllocator;

/// Page indices of the first MiB at which the identity mapping flips
/// between read-write and read-only. The ranges in between cover the
/// kernel image, the legacy video/BIOS area and the pieces of low RAM the
/// loader scribbles on; flipping at fixed boundaries reproduces the layout
/// the loader set up.
const PROTECTED_PAGE_BOUNDARIES: [usize; 5] = [0x7, 0xA, 0x80, 0xA0, 0xC0];

/// Opaque handle to one address space: the physical frame of its root
/// directory.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct AddressSpace {
    root: PhysicalAddress,
}

impl AddressSpace {
    #[must_use]
    pub const fn new(root: PhysicalAddress) -> Self {
        Self { root }
    }

    /// Physical address of the root page directory.
    #[must_use]
    pub const fn root(self) -> PhysicalAddress {
        self.root
    }
}

/// Build the kernel's own address space and switch the CPU onto it.
///
/// Reserves a root directory and one page table, identity-maps the first
/// MiB (alternating write protection at [`PROTECTED_PAGE_BOUNDARIES`]),
/// wires the self-map for the flat window, marks every other directory
/// slot sparse, and finally loads CR3 and enables paging with supervisor
/// write protection.
///
/// The accessor is left targeting the new space.
pub fn setup_kernel_space(
    tables: &mut impl PageTables,
    frames: &FrameAllocator,
) -> Result<AddressSpace, MapError> {
    let mut reserved = [PhysicalAddress::zero(); 2];
    let got = frames.reserve(2, &mut reserved);
    if got < 2 {
        frames.release(&reserved[..got]);
        log::error!("not enough physical memory for the kernel page directory");
        return Err(MapError::OutOfPhysicalMemory);
    }
    let [root, table0] = reserved;
    tables.zero_frame(root);
    tables.zero_frame(table0);
    tables.retarget(root);

    tables.set_directory_entry(
        0,
        PageTableEntry::new()
            .with_present(true)
            .with_writable(true)
            .with_frame_address(table0),
    );

    // Identity map the first MiB, flipping write access at each protected
    // boundary.
    let mut writable = true;
    for page in 0..IDENTITY_PAGES {
        if PROTECTED_PAGE_BOUNDARIES.contains(&page) {
            writable = !writable;
        }
        let flags = if writable {
            PageFlags::WRITABLE
        } else {
            PageFlags::empty()
        };
        tables.set_table_entry(
            0,
            page,
            PageTableEntry::leaf(PhysicalAddress::from_frame_index(page), flags),
        );
    }

    // Fixed views for the window accessor: the directory and table 0 at
    // known virtual addresses, plus a placeholder on the scratch slot so
    // the mapper never hands that page out.
    tables.set_table_entry(
        0,
        DIRECTORY_VIEW_SLOT,
        PageTableEntry::leaf(root, PageFlags::WRITABLE),
    );
    tables.set_table_entry(
        0,
        TABLE0_VIEW_SLOT,
        PageTableEntry::leaf(table0, PageFlags::WRITABLE),
    );
    tables.set_table_entry(
        0,
        SCRATCH_SLOT,
        PageTableEntry::leaf(PhysicalAddress::zero(), PageFlags::WRITABLE),
    );

    tables.set_directory_entry(
        WINDOW_DIRECTORY_SLOT,
        PageTableEntry::new()
            .with_present(true)
            .with_writable(true)
            .with_frame_address(root),
    );
    for slot in 1..TABLE_ENTRIES {
        if slot == WINDOW_DIRECTORY_SLOT {
            continue;
        }
        tables.set_directory_entry(slot, PageTableEntry::sparse_slot(true, false));
    }

    // SAFETY: the directory identity-maps the code and stack we are
    // running on (hosted builds get the stub).
    unsafe { arch::enable_paging(root) };
    log::info!("kernel address space rooted at {root}");
    Ok(AddressSpace::new(root))
}

/// Create a fresh process address space.
///
/// Costs exactly four frames: the root directory, a user-visible read-only
/// copy of the kernel's low mappings (so the IDT and interrupt stubs stay
/// reachable from ring 3), the stack page table, and the first stack page
/// at the top of the space. Every other directory slot is left sparse with
/// user/writable hints, so tables appear on demand as the process touches
/// its space.
///
/// A short frame reservation rolls back and reports
/// [`MapError::OutOfPhysicalMemory`].
pub fn create_process_space(
    tables: &mut impl PageTables,
    frames: &FrameAllocator,
    kernel: AddressSpace,
) -> Result<AddressSpace, MapError> {
    let mut reserved = [PhysicalAddress::zero(); 4];
    let got = frames.reserve(4, &mut reserved);
    if got < 4 {
        frames.release(&reserved[..got]);
        log::error!("not enough physical memory for a new address space");
        return Err(MapError::OutOfPhysicalMemory);
    }
    let [root, kernel_copy, stack_table, stack_page] = reserved;
    for frame in reserved {
        tables.zero_frame(frame);
    }

    // The space is not reachable through a self-map yet, so everything
    // below goes through frame-addressed writes.
    let kernel_table0 = tables.read_frame_entry(kernel.root(), 0).frame_address();
    for page in 0..IDENTITY_PAGES {
        let entry = tables.read_frame_entry(kernel_table0, page);
        if !entry.present() {
            continue;
        }
        tables.write_frame_entry(
            kernel_copy,
            page,
            entry.with_writable(false).with_user(true).with_global(true),
        );
    }

    tables.write_frame_entry(
        root,
        0,
        PageTableEntry::new()
            .with_present(true)
            .with_user(true)
            .with_frame_address(kernel_copy),
    );
    tables.write_frame_entry(
        root,
        STACK_DIRECTORY_SLOT,
        PageTableEntry::new()
            .with_present(true)
            .with_writable(true)
            .with_user(true)
            .with_frame_address(stack_table),
    );
    tables.write_frame_entry(
        stack_table,
        STACK_TABLE_SLOT,
        PageTableEntry::leaf(stack_page, PageFlags::WRITABLE | PageFlags::USER),
    );
    tables.write_frame_entry(
        root,
        WINDOW_DIRECTORY_SLOT,
        PageTableEntry::new()
            .with_present(true)
            .with_writable(true)
            .with_frame_address(root),
    );
    for slot in 1..TABLE_ENTRIES {
        if slot == WINDOW_DIRECTORY_SLOT || slot == STACK_DIRECTORY_SLOT {
            continue;
        }
        tables.write_frame_entry(root, slot, PageTableEntry::sparse_slot(true, true));
    }

    log::debug!("created address space rooted at {root}");
    Ok(AddressSpace::new(root))
}

/// Tear an address space down, releasing every frame it owns.
///
/// Walks all present directory slots except the self-map, releases every
/// present non-global leaf frame (global leaves are the kernel mappings
/// shared with every space), then the table frames, then the root. A
/// partially constructed space, with absent slots everywhere, walks the
/// same path and simply releases less.
pub fn destroy_process_space(
    tables: &mut impl PageTables,
    frames: &FrameAllocator,
    space: AddressSpace,
) {
    let root = space.root();
    let mut released = 1usize;
    for slot in 0..TABLE_ENTRIES {
        if slot == WINDOW_DIRECTORY_SLOT {
            // Points back at the root, which is released last.
            continue;
        }
        let dir = tables.read_frame_entry(root, slot);
        if !dir.present() {
            continue;
        }
        let table_frame = dir.frame_address();
        for index in 0..TABLE_ENTRIES {
            let leaf = tables.read_frame_entry(table_frame, index);
            if leaf.present() && !leaf.global() {
                frames.release(&[leaf.frame_address()]);
                released += 1;
            }
        }
        frames.release(&[table_frame]);
        released += 1;
    }
    frames.release(&[root]);
    log::debug!("destroyed address space rooted at {root}, released {released} frames");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::fixture;
    use crate::vmm;

    #[test]
    fn kernel_space_layout() {
        let (mut sim, frames) = fixture(64);
        let free_before = frames.free_frames();
        let kernel = setup_kernel_space(&mut sim, &frames).unwrap();
        assert_eq!(frames.free_frames(), free_before - 2);
        assert_eq!(sim.target(), kernel.root());

        let dir0 = sim.directory_entry(0);
        assert!(dir0.present() && dir0.writable() && !dir0.user());

        // Identity leaves alternate write access at the protected
        // boundaries: RW up to 0x7, RO to 0xA, RW to 0x80, RO to 0xA0,
        // RW to 0xC0, RO to the top of the MiB.
        for (page, writable) in [
            (0x0, true),
            (0x6, true),
            (0x7, false),
            (0x9, false),
            (0xA, true),
            (0x7F, true),
            (0x80, false),
            (0x9F, false),
            (0xA0, true),
            (0xBF, true),
            (0xC0, false),
            (0xFF, false),
        ] {
            let leaf = sim.table_entry(0, page);
            assert!(leaf.present(), "identity page {page:#x} missing");
            assert_eq!(leaf.frame_address().frame_index(), page);
            assert_eq!(leaf.writable(), writable, "page {page:#x}");
        }

        let self_map = sim.directory_entry(WINDOW_DIRECTORY_SLOT);
        assert!(self_map.present());
        assert_eq!(self_map.frame_address(), kernel.root());

        let sparse = sim.directory_entry(500);
        assert!(!sparse.present() && sparse.sparse());
        assert!(sparse.writable() && !sparse.user());
    }

    #[test]
    fn process_space_costs_exactly_four_frames() {
        let (mut sim, frames) = fixture(64);
        let kernel = setup_kernel_space(&mut sim, &frames).unwrap();
        let free_before = frames.free_frames();

        let proc = create_process_space(&mut sim, &frames, kernel).unwrap();
        assert_eq!(frames.free_frames(), free_before - 4);

        let root = proc.root();
        let dir0 = sim.read_frame_entry(root, 0);
        assert!(dir0.present() && dir0.user() && !dir0.writable());

        // Kernel mappings are copied read-only, user-visible and global.
        let kernel_table0 = sim.read_frame_entry(kernel.root(), 0).frame_address();
        let copy = dir0.frame_address();
        for page in [0usize, 0x7, 0xFF] {
            let original = sim.read_frame_entry(kernel_table0, page);
            let copied = sim.read_frame_entry(copy, page);
            assert!(copied.present() && copied.global() && copied.user());
            assert!(!copied.writable());
            assert_eq!(copied.frame_address(), original.frame_address());
        }

        let stack_dir = sim.read_frame_entry(root, STACK_DIRECTORY_SLOT);
        assert!(stack_dir.present() && stack_dir.writable() && stack_dir.user());
        let stack_leaf = sim.read_frame_entry(stack_dir.frame_address(), STACK_TABLE_SLOT);
        assert!(stack_leaf.present() && stack_leaf.writable() && stack_leaf.user());

        let self_map = sim.read_frame_entry(root, WINDOW_DIRECTORY_SLOT);
        assert!(self_map.present());
        assert_eq!(self_map.frame_address(), root);

        let sparse = sim.read_frame_entry(root, 5);
        assert!(!sparse.present() && sparse.sparse());
        assert!(sparse.writable() && sparse.user());
    }

    #[test]
    fn short_reservation_rolls_back() {
        // 6 frames total: frame 0 is reserved, the kernel space takes 2,
        // leaving 3. Creation needs 4 and must put the 3 back.
        let (mut sim, frames) = fixture(6);
        let kernel = setup_kernel_space(&mut sim, &frames).unwrap();
        assert_eq!(frames.free_frames(), 3);

        let err = create_process_space(&mut sim, &frames, kernel).unwrap_err();
        assert_eq!(err, MapError::OutOfPhysicalMemory);
        assert_eq!(frames.free_frames(), 3);
    }

    #[test]
    fn destroy_returns_every_frame() {
        let (mut sim, frames) = fixture(64);
        let kernel = setup_kernel_space(&mut sim, &frames).unwrap();
        let free_before = frames.free_frames();

        let proc = create_process_space(&mut sim, &frames, kernel).unwrap();

        // Map two extra pages into the new space, one of them through a
        // freshly materialized table, then tear everything down.
        sim.retarget(proc.root());
        let mut extra = [PhysicalAddress::zero(); 2];
        assert_eq!(frames.reserve(2, &mut extra), 2);
        vmm::map_page(&mut sim, &frames, extra[0], 600, 10, PageFlags::WRITABLE).unwrap();
        vmm::map_page(&mut sim, &frames, extra[1], 600, 11, PageFlags::WRITABLE).unwrap();
        assert!(frames.free_frames() < free_before - 4);

        sim.retarget(kernel.root());
        destroy_process_space(&mut sim, &frames, proc);
        assert_eq!(frames.free_frames(), free_before);
    }

    #[test]
    fn destroy_tolerates_partially_built_space() {
        let (mut sim, frames) = fixture(64);
        setup_kernel_space(&mut sim, &frames).unwrap();
        let free_before = frames.free_frames();

        // A space that failed mid-setup: a root and one empty table,
        // nothing else.
        let mut reserved = [PhysicalAddress::zero(); 2];
        assert_eq!(frames.reserve(2, &mut reserved), 2);
        let [root, table] = reserved;
        sim.zero_frame(root);
        sim.zero_frame(table);
        sim.write_frame_entry(
            root,
            3,
            PageTableEntry::new()
                .with_present(true)
                .with_writable(true)
                .with_frame_address(table),
        );
        assert_eq!(frames.free_frames(), free_before - 2);

        destroy_process_space(&mut sim, &frames, AddressSpace::new(root));
        assert_eq!(frames.free_frames(), free_before);
    }
}
