//! The virtual memory mapper.
//!
//! Low-level single-page mapping, first-fit scanning for free virtual
//! runs, and the composed allocate/deallocate operations the rest of the
//! kernel uses. Everything here acts on whatever address space the
//! accessor currently targets.

use crate::entry::{PageFlags, PageTableEntry};
use crate::{IDENTITY_PAGES, PageTables, WINDOW_DIRECTORY_SLOT};
use mm_addr::{PAGE_SIZE, PhysicalAddress, TABLE_ENTRIES, VirtualAddress};
use mm_frames::FrameAllocator;

/// Largest page count a single allocation may request.
pub const MAX_ALLOC_PAGES: usize = 512;

/// Mapper failure modes. Everything here is recoverable; corrupted state
/// panics instead.
#[derive(Copy, Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum MapError {
    /// Fewer physical frames available than requested.
    #[error("out of physical memory")]
    OutOfPhysicalMemory,

    /// No free virtual run of the requested length (or the request itself
    /// was empty or oversized).
    #[error("out of virtual address space")]
    OutOfVirtualSpace,

    /// Directory or table index outside `0..1024`.
    #[error("directory or table index out of range")]
    InvalidIndex,
}

/// Make sure directory slot `directory` has a backing page table,
/// materializing one if needed.
///
/// A sparse slot dictates the new table's writable/user bits through its
/// hint bits; a plain absent slot takes them from `flags`. Returns the
/// frame that was materialized, if any, so callers can roll back.
pub(crate) fn ensure_table(
    tables: &mut impl PageTables,
    frames: &FrameAllocator,
    directory: usize,
    flags: PageFlags,
) -> Result<Option<PhysicalAddress>, MapError> {
    let entry = tables.directory_entry(directory);
    if entry.present() {
        return Ok(None);
    }
    let (writable, user) = if entry.sparse() {
        (entry.writable(), entry.user())
    } else {
        (
            flags.contains(PageFlags::WRITABLE),
            flags.contains(PageFlags::USER),
        )
    };
    let mut frame = [PhysicalAddress::zero(); 1];
    if frames.reserve(1, &mut frame) != 1 {
        return Err(MapError::OutOfPhysicalMemory);
    }
    tables.zero_frame(frame[0]);
    tables.set_directory_entry(
        directory,
        PageTableEntry::new()
            .with_present(true)
            .with_writable(writable)
            .with_user(user)
            .with_frame_address(frame[0]),
    );
    Ok(Some(frame[0]))
}

/// Map one frame at (`directory`, `table`) of the target space.
///
/// This is the low-level primitive: no overlap checking, only bounds
/// checking. An existing entry at the slot is overwritten outright, which
/// also makes repeated identical calls converge on the same entry instead
/// of accumulating bits.
pub fn map_page(
    tables: &mut impl PageTables,
    frames: &FrameAllocator,
    frame: PhysicalAddress,
    directory: usize,
    table: usize,
    flags: PageFlags,
) -> Result<VirtualAddress, MapError> {
    if directory >= TABLE_ENTRIES || table >= TABLE_ENTRIES {
        log::error!("map_page: index ({directory}, {table}) out of range");
        return Err(MapError::InvalidIndex);
    }
    ensure_table(tables, frames, directory, flags)?;
    let va = VirtualAddress::from_indices(directory, table);
    tables.set_table_entry(directory, table, PageTableEntry::leaf(frame, flags));
    tables.invalidate(va);
    Ok(va)
}

/// Map `list` contiguously into the first sufficiently long free virtual
/// run, first-fit. Every mapped frame is marked in use in the frame
/// table, whether or not the caller reserved it beforehand.
///
/// The scan starts above the identity-mapped first MiB, never enters the
/// window slot, and resets its run whenever it crosses a present page.
/// Tables materialized for a run that then cannot be completed are backed
/// out, so a failed call leaves the space and the frame table untouched.
pub fn map_next_unallocated(
    tables: &mut impl PageTables,
    frames: &FrameAllocator,
    list: &[PhysicalAddress],
    flags: PageFlags,
) -> Result<VirtualAddress, MapError> {
    let count = list.len();
    if count == 0 || count > MAX_ALLOC_PAGES {
        log::error!("map_next_unallocated: bad page count {count}");
        return Err(MapError::OutOfVirtualSpace);
    }

    let total = TABLE_ENTRIES * TABLE_ENTRIES;
    let mut page = IDENTITY_PAGES;
    let mut run = 0usize;
    let mut base = None;
    while page < total {
        let directory = page / TABLE_ENTRIES;
        if directory == WINDOW_DIRECTORY_SLOT {
            run = 0;
            page = (directory + 1) * TABLE_ENTRIES;
            continue;
        }
        let span_end = (directory + 1) * TABLE_ENTRIES;
        if tables.directory_entry(directory).present() {
            while page < span_end {
                if tables.table_entry(directory, page % TABLE_ENTRIES).present() {
                    run = 0;
                } else {
                    run += 1;
                }
                page += 1;
                if run == count {
                    break;
                }
            }
        } else {
            // No table, so the whole remaining span is unmapped.
            let take = (span_end - page).min(count - run);
            run += take;
            page += take;
        }
        if run == count {
            base = Some(page - count);
            break;
        }
    }
    let Some(base) = base else {
        return Err(MapError::OutOfVirtualSpace);
    };

    // Materialize the (at most two) tables the run touches before
    // installing any leaf, keeping enough to undo on failure.
    let first_dir = base / TABLE_ENTRIES;
    let last_dir = (base + count - 1) / TABLE_ENTRIES;
    let mut installed = [(0usize, PageTableEntry::new(), PhysicalAddress::zero()); 2];
    let mut installed_len = 0;
    for directory in first_dir..=last_dir {
        let previous = tables.directory_entry(directory);
        match ensure_table(tables, frames, directory, flags) {
            Ok(Some(frame)) => {
                installed[installed_len] = (directory, previous, frame);
                installed_len += 1;
            }
            Ok(None) => {}
            Err(e) => {
                for &(slot, old, frame) in &installed[..installed_len] {
                    tables.set_directory_entry(slot, old);
                    frames.release(&[frame]);
                }
                return Err(e);
            }
        }
    }

    for (i, &frame) in list.iter().enumerate() {
        let p = base + i;
        let (directory, table) = (p / TABLE_ENTRIES, p % TABLE_ENTRIES);
        tables.set_table_entry(directory, table, PageTableEntry::leaf(frame, flags));
        tables.invalidate(VirtualAddress::from_indices(directory, table));
        // A caller-supplied frame may not have gone through reserve();
        // once it is mapped it must not be handed out again.
        frames.claim(frame);
    }
    let va = VirtualAddress::from_indices(base / TABLE_ENTRIES, base % TABLE_ENTRIES);
    log::trace!("mapped {count} pages at {va}");
    Ok(va)
}

/// Clear `count` mappings starting at `va` and invalidate each page.
///
/// The backing frames are left reserved; releasing them is the caller's
/// separate decision (see [`dealloc_pages`]).
pub fn unmap(tables: &mut impl PageTables, va: VirtualAddress, count: usize) {
    for i in 0..count {
        let page = va + (i as u32) * PAGE_SIZE;
        if !tables.directory_entry(page.directory_index()).present() {
            continue;
        }
        tables.set_table_entry(page.directory_index(), page.table_index(), PageTableEntry::new());
        tables.invalidate(page);
    }
}

/// Reserve `count` frames and map them into the first free virtual run.
///
/// Atomic from the caller's point of view: on any failure the reserved
/// frames are released again before the error is returned.
pub fn alloc_pages(
    tables: &mut impl PageTables,
    frames: &FrameAllocator,
    count: usize,
    flags: PageFlags,
) -> Result<VirtualAddress, MapError> {
    if count == 0 || count > MAX_ALLOC_PAGES {
        return Err(MapError::OutOfVirtualSpace);
    }
    let mut buf = [PhysicalAddress::zero(); MAX_ALLOC_PAGES];
    let got = frames.reserve(count, &mut buf[..count]);
    if got < count {
        frames.release(&buf[..got]);
        return Err(MapError::OutOfPhysicalMemory);
    }
    match map_next_unallocated(tables, frames, &buf[..count], flags) {
        Ok(va) => Ok(va),
        Err(e) => {
            frames.release(&buf[..count]);
            Err(e)
        }
    }
}

/// Unmap `count` pages at `va` and release the frames that were mapped
/// there. Absent entries are skipped.
pub fn dealloc_pages(
    tables: &mut impl PageTables,
    frames: &FrameAllocator,
    va: VirtualAddress,
    count: usize,
) {
    for i in 0..count {
        let page = va + (i as u32) * PAGE_SIZE;
        let directory = page.directory_index();
        if !tables.directory_entry(directory).present() {
            continue;
        }
        let entry = tables.table_entry(directory, page.table_index());
        if !entry.present() {
            continue;
        }
        tables.set_table_entry(directory, page.table_index(), PageTableEntry::new());
        tables.invalidate(page);
        frames.release(&[entry.frame_address()]);
    }
}
