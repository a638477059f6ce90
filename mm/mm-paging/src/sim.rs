//! Simulated physical memory for the host test suite.
//!
//! Frames live in an ordinary `Vec`, indexed by frame number, and the
//! accessor methods poke them directly. Combined with a frame allocator
//! over a synthetic all-usable memory map this runs every mapping path
//! without hardware.

use crate::table::PageTable;
use crate::{PageTableEntry, PageTables};
use mm_addr::{PhysicalAddress, VirtualAddress};
use mm_frames::{FrameAllocator, FrameSlot, FrameTable, LegacyLayout, MemoryRegion, RegionKind};

pub(crate) struct SimPhys {
    frames: Vec<PageTable>,
    target: PhysicalAddress,
    pub(crate) invalidations: usize,
}

impl SimPhys {
    pub(crate) fn new(total: usize) -> Self {
        Self {
            frames: (0..total).map(|_| PageTable::zeroed()).collect(),
            target: PhysicalAddress::zero(),
            invalidations: 0,
        }
    }
}

impl PageTables for SimPhys {
    fn target(&self) -> PhysicalAddress {
        self.target
    }

    fn retarget(&mut self, root: PhysicalAddress) {
        self.target = root;
    }

    fn read_frame_entry(&self, frame: PhysicalAddress, index: usize) -> PageTableEntry {
        self.frames[frame.frame_index()].entries[index]
    }

    fn write_frame_entry(&mut self, frame: PhysicalAddress, index: usize, entry: PageTableEntry) {
        self.frames[frame.frame_index()].entries[index] = entry;
    }

    fn zero_frame(&mut self, frame: PhysicalAddress) {
        self.frames[frame.frame_index()] = PageTable::zeroed();
    }

    fn invalidate(&mut self, _va: VirtualAddress) {
        self.invalidations += 1;
    }
}

/// `total` frames of simulated RAM plus a frame allocator over them.
/// Only frame 0 starts out reserved.
pub(crate) fn fixture(total: usize) -> (SimPhys, FrameAllocator<'static>) {
    let slots = Box::leak(vec![FrameSlot::default(); total].into_boxed_slice());
    let map = [MemoryRegion::new(
        0,
        total as u64 * u64::from(mm_addr::PAGE_SIZE),
        RegionKind::Usable,
    )];
    let table = FrameTable::new(slots, &map, &LegacyLayout::none());
    (SimPhys::new(total), FrameAllocator::new(table))
}
