//! Firmware memory map model.
//!
//! The bootloader hands over the BIOS INT 0x15 EAX=0xE820 map as a list of
//! 24-byte records; [`E820Entry`] matches that layout and [`MemoryRegion`]
//! is the owned form the rest of the crate consumes.

use mm_addr::PAGE_SIZE;

/// Classification of one firmware memory range.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RegionKind {
    /// Free RAM, available to the allocator.
    Usable,
    /// Reserved by firmware or hardware.
    Reserved,
    /// ACPI tables; reclaimable once parsed.
    AcpiReclaimable,
    /// ACPI non-volatile storage.
    AcpiNonVolatile,
    /// Faulty RAM reported by the firmware.
    Bad,
    /// Type code this kernel does not recognize; treated as reserved.
    Unknown(u32),
}

impl RegionKind {
    #[must_use]
    pub const fn from_e820_type(t: u32) -> Self {
        match t {
            1 => Self::Usable,
            2 => Self::Reserved,
            3 => Self::AcpiReclaimable,
            4 => Self::AcpiNonVolatile,
            5 => Self::Bad,
            other => Self::Unknown(other),
        }
    }

    #[must_use]
    pub const fn is_usable(self) -> bool {
        matches!(self, Self::Usable)
    }

    const fn describe(self) -> &'static str {
        match self {
            Self::Usable => "free memory",
            Self::Reserved => "reserved",
            Self::AcpiReclaimable => "acpi reclaimable",
            Self::AcpiNonVolatile => "acpi non-volatile",
            Self::Bad => "faulty",
            Self::Unknown(_) => "unknown",
        }
    }
}

/// One (base, length, kind) range of physical memory.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MemoryRegion {
    pub base: u64,
    pub length: u64,
    pub kind: RegionKind,
}

impl MemoryRegion {
    #[must_use]
    pub const fn new(base: u64, length: u64, kind: RegionKind) -> Self {
        Self { base, length, kind }
    }

    /// Index of the first frame in the region.
    #[must_use]
    pub const fn first_frame(&self) -> usize {
        (self.base / PAGE_SIZE as u64) as usize
    }

    /// Number of whole frames the region covers.
    #[must_use]
    pub const fn frame_count(&self) -> usize {
        (self.length / PAGE_SIZE as u64) as usize
    }

    /// Exclusive end address of the region.
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.base + self.length
    }
}

/// Raw 24-byte record as left in memory by the bootloader.
#[repr(C, packed)]
#[derive(Copy, Clone)]
pub struct E820Entry {
    pub base: u64,
    pub length: u64,
    pub kind: u32,
    pub extended_attributes: u32,
}

impl From<E820Entry> for MemoryRegion {
    fn from(raw: E820Entry) -> Self {
        Self {
            base: raw.base,
            length: raw.length,
            kind: RegionKind::from_e820_type(raw.kind),
        }
    }
}

/// Log the detected memory map, one line per region.
pub fn log_map(map: &[MemoryRegion]) {
    log::info!("detected memory map has {} entries:", map.len());
    for region in map {
        log::info!(
            "  {:#010x} + {:#010x} ({} pages): {}",
            region.base,
            region.length,
            region.frame_count(),
            region.kind.describe()
        );
    }
}
