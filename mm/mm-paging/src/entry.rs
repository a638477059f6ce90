//! Hardware page-directory / page-table entry layout (32-bit x86).
//!
//! The same 32-bit entry format is used at both levels of the walk: a
//! directory entry points at a page table, a table entry points at a 4 KiB
//! frame. Bit 9 is one of the OS-available bits and carries our *sparse*
//! marker; see [`PageTableEntry::sparse`].

use bitfield_struct::bitfield;
use mm_addr::PhysicalAddress;

/// One entry of a page directory or page table.
///
/// Reference: Intel SDM Vol. 3A, §4.3 "32-Bit Paging".
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct PageTableEntry {
    /// **Present** (bit 0): the entry maps something. When clear, the CPU
    /// faults on access and every hardware field below is ignored.
    pub present: bool,

    /// **Read/Write** (bit 1): writes allowed. With CR0.WP set this is
    /// enforced for supervisor accesses too.
    pub writable: bool,

    /// **User/Supervisor** (bit 2): ring-3 access allowed if set.
    pub user: bool,

    /// **Page Write-Through** (PWT, bit 3).
    pub write_through: bool,

    /// **Page Cache Disable** (PCD, bit 4).
    pub cache_disable: bool,

    /// **Accessed** (bit 5): set by the CPU on first access.
    pub accessed: bool,

    /// **Dirty** (bit 6): set by the CPU on first write (leaf entries).
    pub dirty: bool,

    /// **Page Size** (bit 7): 4 MiB pages when set on a directory entry.
    /// Always clear here; this kernel maps 4 KiB pages only.
    pub page_size: bool,

    /// **Global** (bit 8): survives CR3 reloads (leaf entries, CR4.PGE).
    ///
    /// Also doubles as the "owned by the kernel image" marker on the leaf
    /// entries copied into every process space: teardown skips global
    /// leaves so shared kernel frames are never released twice.
    pub global: bool,

    /// **Sparse** (OS-available bit 9): meaningful only while `present` is
    /// clear. Marks a directory slot as reserved for a page table that does
    /// not exist yet; the page-fault hook turns such a slot into a real
    /// table on first access. While sparse, [`writable`](Self::writable)
    /// and [`user`](Self::user) hold the hint bits the future table gets.
    pub sparse: bool,

    /// OS-available bits 10..11, unused.
    #[bits(2)]
    __: u8,

    /// Physical frame number (bits 12..31); the mapped frame for a leaf,
    /// the page-table frame for a directory entry.
    #[bits(20)]
    frame: u32,
}

impl PageTableEntry {
    /// Set the target frame by physical address (must be page-aligned).
    #[inline]
    #[must_use]
    pub const fn with_frame_address(self, pa: PhysicalAddress) -> Self {
        debug_assert!(pa.is_page_aligned());
        self.with_frame(pa.as_u32() >> mm_addr::PAGE_SHIFT)
    }

    /// Physical address of the target frame.
    #[inline]
    #[must_use]
    pub const fn frame_address(self) -> PhysicalAddress {
        PhysicalAddress::new(self.frame() << mm_addr::PAGE_SHIFT)
    }

    /// A present leaf entry for `frame` with `flags` applied.
    #[must_use]
    pub fn leaf(frame: PhysicalAddress, flags: PageFlags) -> Self {
        Self::new()
            .with_present(true)
            .with_writable(flags.contains(PageFlags::WRITABLE))
            .with_user(flags.contains(PageFlags::USER))
            .with_write_through(flags.contains(PageFlags::WRITE_THROUGH))
            .with_cache_disable(flags.contains(PageFlags::CACHE_DISABLE))
            .with_global(flags.contains(PageFlags::GLOBAL))
            .with_frame_address(frame)
    }

    /// A non-present sparse marker carrying the hint bits for the table the
    /// fault hook will install.
    #[must_use]
    pub fn sparse_slot(writable: bool, user: bool) -> Self {
        Self::new()
            .with_sparse(true)
            .with_writable(writable)
            .with_user(user)
    }
}

bitflags::bitflags! {
    /// Caller-facing protection flags for mapping requests.
    ///
    /// These mirror the hardware bits of [`PageTableEntry`]; `PRESENT` is
    /// implied by the mapping operations and not part of this set.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct PageFlags: u32 {
        /// Writes allowed.
        const WRITABLE      = 1 << 1;
        /// Ring-3 access allowed.
        const USER          = 1 << 2;
        /// Write-through caching.
        const WRITE_THROUGH = 1 << 3;
        /// Caching disabled (MMIO).
        const CACHE_DISABLE = 1 << 4;
        /// Mapping survives CR3 reloads; also marks shared kernel frames
        /// that address-space teardown must not release.
        const GLOBAL        = 1 << 8;
    }
}
