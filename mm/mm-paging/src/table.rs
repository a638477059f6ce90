//! In-memory page-directory / page-table page.

use crate::entry::PageTableEntry;
use mm_addr::TABLE_ENTRIES;

/// One 4 KiB paging structure: 1024 entries, page-aligned.
///
/// Directories and second-level tables share this layout; only the
/// interpretation of the frame field differs.
#[repr(C, align(4096))]
pub struct PageTable {
    pub entries: [PageTableEntry; TABLE_ENTRIES],
}

impl PageTable {
    /// An all-absent table.
    #[must_use]
    pub const fn zeroed() -> Self {
        Self {
            entries: [PageTableEntry::new(); TABLE_ENTRIES],
        }
    }
}

impl Default for PageTable {
    fn default() -> Self {
        Self::zeroed()
    }
}
