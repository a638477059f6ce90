//! The frame table proper: one slot per physical frame.

use crate::region::MemoryRegion;
use mm_addr::{PAGE_SIZE, PhysicalAddress, align_down};

/// Upper bound on tracked frames: 2^20 frames of 4 KiB cover the whole
/// 32-bit physical address space.
pub const MAX_FRAMES: usize = 1 << 20;

/// Tracking state of one physical frame.
#[derive(Copy, Clone, Default, Debug, Eq, PartialEq)]
pub struct FrameSlot {
    /// Backed by real RAM according to the firmware map.
    pub(crate) present: bool,
    /// Reserved by some owner; never set without `present`.
    pub(crate) in_use: bool,
}

/// Fixed reservations dictated by the legacy BIOS memory layout.
///
/// Ranges are (first frame, exclusive end frame). The standard set mirrors
/// the layout the original loader assumes: kernel image at 0x7000, kernel
/// stack below 0x80000 and the BIOS/hardware hole up to 1 MiB. A port to a
/// different loader should derive these from the firmware map instead and
/// pass its own list.
#[derive(Copy, Clone, Debug)]
pub struct LegacyLayout {
    reserved: &'static [(usize, usize)],
}

impl LegacyLayout {
    /// The classic BIOS layout.
    #[must_use]
    pub const fn standard() -> Self {
        Self {
            // kernel code/data, kernel stack, BIOS / hardware area
            reserved: &[(0x7, 0x11), (0x70, 0x80), (0x80, 0x100)],
        }
    }

    /// No fixed reservations beyond frame 0.
    #[must_use]
    pub const fn none() -> Self {
        Self { reserved: &[] }
    }
}

/// Placement and size of the frame-table storage, derived from the firmware
/// map before the table exists.
#[derive(Copy, Clone, Debug)]
pub struct FrameTableSizing {
    /// Number of frames the table must track.
    pub frame_count: usize,
    /// Bytes of slot storage required.
    pub storage_bytes: usize,
    /// Page-aligned physical address for the storage: the top of the highest
    /// usable region, so it collides with nothing already in use.
    pub placement: PhysicalAddress,
}

impl FrameTableSizing {
    #[must_use]
    pub fn for_map(map: &[MemoryRegion]) -> Self {
        let highest = map.iter().map(MemoryRegion::end).max().unwrap_or(0);
        let frame_count = usize::try_from(highest / u64::from(PAGE_SIZE))
            .unwrap_or(MAX_FRAMES)
            .min(MAX_FRAMES);
        let storage_bytes = frame_count * size_of::<FrameSlot>();

        let usable_top = map
            .iter()
            .filter(|r| r.kind.is_usable())
            .map(MemoryRegion::end)
            .max()
            .unwrap_or(0)
            .min(u64::from(u32::MAX) + 1);
        let placement = align_down(
            (usable_top as u32).wrapping_sub(storage_bytes as u32),
            PAGE_SIZE,
        );

        Self {
            frame_count,
            storage_bytes,
            placement: PhysicalAddress::new(placement),
        }
    }

    /// Borrow the storage at the computed placement as a slot slice.
    ///
    /// # Safety
    /// - Paging must not be active yet, or the placement range must be
    ///   identity mapped.
    /// - The range `[placement, placement + storage_bytes)` must be real,
    ///   writable RAM not otherwise in use.
    #[must_use]
    pub unsafe fn storage_in_place(&self) -> &'static mut [FrameSlot] {
        let base = self.placement.as_u32() as usize as *mut FrameSlot;
        unsafe { core::slice::from_raw_parts_mut(base, self.frame_count) }
    }
}

/// Flat array of frame slots indexed by frame number.
///
/// Slot storage is borrowed so tests can supply an ordinary buffer while the
/// kernel supplies the in-place storage from [`FrameTableSizing`].
pub struct FrameTable<'t> {
    slots: &'t mut [FrameSlot],
}

impl<'t> FrameTable<'t> {
    /// Build the table from the firmware map.
    ///
    /// Usable regions become present frames; every other region kind is
    /// marked present and in-use up front so the allocator never hands those
    /// frames out. `layout` then applies the fixed legacy reservations, and
    /// frame 0 is always reserved.
    pub fn new(
        slots: &'t mut [FrameSlot],
        map: &[MemoryRegion],
        layout: &LegacyLayout,
    ) -> Self {
        slots.fill(FrameSlot::default());
        let limit = slots.len();

        for region in map.iter().filter(|r| r.kind.is_usable()) {
            let first = region.first_frame().min(limit);
            let end = (region.first_frame() + region.frame_count()).min(limit);
            for slot in &mut slots[first..end] {
                slot.present = true;
            }
        }
        for region in map.iter().filter(|r| !r.kind.is_usable()) {
            let first = region.first_frame().min(limit);
            let end = (region.first_frame() + region.frame_count()).min(limit);
            for slot in &mut slots[first..end] {
                slot.present = true;
                slot.in_use = true;
            }
        }

        let mut table = Self { slots };
        table.reserve_range(0, 1);
        for &(first, end) in layout.reserved {
            table.reserve_range(first, end.saturating_sub(first));
        }

        log::info!(
            "frame table tracks {} frames ({} free)",
            table.frame_count(),
            table.free_frames()
        );
        table
    }

    /// Mark the table's own storage frames as in use.
    pub fn reserve_storage(&mut self, sizing: &FrameTableSizing) {
        let first = sizing.placement.frame_index();
        let count = sizing.storage_bytes.div_ceil(PAGE_SIZE as usize);
        self.reserve_range(first, count);
    }

    fn reserve_range(&mut self, first: usize, count: usize) {
        let len = self.slots.len();
        let end = first.saturating_add(count).min(len);
        for slot in &mut self.slots[first.min(len)..end] {
            slot.present = true;
            slot.in_use = true;
        }
    }

    /// Reserve up to `want` free frames, marking them in use.
    ///
    /// Frame addresses are written to `out` in ascending order; the return
    /// value is the number actually found. A short count means physical
    /// memory is exhausted; the partial result is still marked in use and
    /// the caller must release it if the overall operation fails.
    pub fn reserve(&mut self, want: usize, out: &mut [PhysicalAddress]) -> usize {
        assert!(out.len() >= want, "reserve output buffer too small");
        let mut found = 0;
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if found == want {
                break;
            }
            if slot.present && !slot.in_use {
                slot.in_use = true;
                out[found] = PhysicalAddress::from_frame_index(index);
                found += 1;
            }
        }
        if found < want {
            log::warn!("frame reservation short: wanted {want}, found {found}");
        }
        found
    }

    /// Mark each listed frame as no longer in use.
    ///
    /// # Panics
    /// Releasing frame 0 or a frame beyond the tracked range indicates
    /// caller corruption and halts the kernel.
    pub fn release(&mut self, frames: &[PhysicalAddress]) {
        for pa in frames {
            let index = pa.frame_index();
            assert!(index != 0, "attempt to release physical frame 0");
            assert!(
                index < self.slots.len(),
                "attempt to release untracked frame {index:#x}"
            );
            self.slots[index].in_use = false;
        }
    }

    /// Mark a single frame as in use (e.g. a caller-supplied frame being
    /// wired into a mapping).
    ///
    /// # Panics
    /// On out-of-range indices or frames the firmware map never backed.
    pub fn claim(&mut self, pa: PhysicalAddress) {
        let index = pa.frame_index();
        assert!(
            index < self.slots.len(),
            "attempt to claim untracked frame {index:#x}"
        );
        assert!(
            self.slots[index].present,
            "attempt to claim non-present frame {index:#x}"
        );
        self.slots[index].in_use = true;
    }

    #[must_use]
    pub fn frame_count(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn free_frames(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.present && !s.in_use)
            .count()
    }

    #[must_use]
    pub fn is_in_use(&self, index: usize) -> bool {
        self.slots.get(index).is_some_and(|s| s.in_use)
    }

    #[must_use]
    pub fn is_present(&self, index: usize) -> bool {
        self.slots.get(index).is_some_and(|s| s.present)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::RegionKind;

    fn usable(base: u64, pages: u64) -> MemoryRegion {
        MemoryRegion::new(base, pages * u64::from(PAGE_SIZE), RegionKind::Usable)
    }

    #[test]
    fn marks_reserved_regions_in_use() {
        let mut slots = vec![FrameSlot::default(); 64];
        let map = [
            usable(0, 64),
            MemoryRegion::new(
                32 * u64::from(PAGE_SIZE),
                8 * u64::from(PAGE_SIZE),
                RegionKind::Reserved,
            ),
        ];
        let table = FrameTable::new(&mut slots, &map, &LegacyLayout::none());
        assert!(table.is_in_use(0));
        assert!(!table.is_in_use(1));
        for i in 32..40 {
            assert!(table.is_in_use(i), "frame {i} should be reserved");
        }
        assert_eq!(table.free_frames(), 64 - 8 - 1);
    }

    #[test]
    fn standard_layout_reserves_legacy_ranges() {
        let mut slots = vec![FrameSlot::default(); 0x120];
        let map = [usable(0, 0x120)];
        let table = FrameTable::new(&mut slots, &map, &LegacyLayout::standard());
        assert!(table.is_in_use(0x7));
        assert!(table.is_in_use(0x10));
        assert!(!table.is_in_use(0x11));
        assert!(table.is_in_use(0x70));
        assert!(table.is_in_use(0xFF));
        assert!(!table.is_in_use(0x100));
    }

    #[test]
    fn sizing_places_storage_at_top_of_usable_ram() {
        let map = [usable(0, 0x100), usable(0x10_0000, 0x100)];
        let sizing = FrameTableSizing::for_map(&map);
        assert_eq!(sizing.frame_count, 0x200);
        assert_eq!(sizing.storage_bytes, 0x200 * size_of::<FrameSlot>());
        let top = 0x10_0000u32 + 0x100 * PAGE_SIZE;
        assert!(sizing.placement.as_u32() < top);
        assert!(sizing.placement.is_page_aligned());
        assert!(u64::from(sizing.placement.as_u32()) + sizing.storage_bytes as u64 <= u64::from(top));
    }

    #[test]
    fn storage_frames_are_reserved() {
        let map = [usable(0, 0x200)];
        let sizing = FrameTableSizing::for_map(&map);
        let mut slots = vec![FrameSlot::default(); sizing.frame_count];
        let mut table = FrameTable::new(&mut slots, &map, &LegacyLayout::none());
        table.reserve_storage(&sizing);

        let first = sizing.placement.frame_index();
        let count = sizing.storage_bytes.div_ceil(PAGE_SIZE as usize);
        for i in first..first + count {
            assert!(table.is_in_use(i), "storage frame {i} not reserved");
        }
    }

    #[test]
    fn frames_in_map_holes_are_not_allocatable() {
        let mut slots = vec![FrameSlot::default(); 32];
        // Frames 16..24 are covered by no region at all.
        let map = [usable(0, 16), usable(24 * u64::from(PAGE_SIZE), 8)];
        let mut table = FrameTable::new(&mut slots, &map, &LegacyLayout::none());
        let mut out = [PhysicalAddress::zero(); 32];
        let got = table.reserve(32, &mut out);
        assert_eq!(got, 16 + 8 - 1);
        for pa in &out[..got] {
            let idx = pa.frame_index();
            assert!(!(16..24).contains(&idx), "hole frame {idx} was handed out");
        }
    }
}
