//! Zone and block headers plus the raw-pointer routines that walk them.
//!
//! Layout of a zone in memory:
//!
//! ```text
//! +------------+--------------+---------+--------------+---------+----
//! | ZoneHeader | BlockHeader0 | payload | BlockHeader1 | payload | ...
//! +------------+--------------+---------+--------------+---------+----
//! ```
//!
//! Every byte of a zone is accounted for: the zone header, then an
//! alternating run of block headers and payloads covering the rest.

use core::mem::{align_of, size_of};
use core::ptr::{self, NonNull};

/// Marks a live zone header ("NEZO" when read as ASCII bytes).
pub(crate) const ZONE_MAGIC: u32 = 0x4F5A_454E;

/// Marks a live block header (" RPT" when read as ASCII bytes).
pub(crate) const BLOCK_MAGIC: u32 = 0x5450_5220;

/// Zones are never created or grown by fewer pages than this, so that a
/// burst of small allocations does not degenerate into a long chain of
/// tiny zones.
pub const MIN_ZONE_SIZE_PAGES: usize = 50;

pub(crate) const ZONE_HEADER_SIZE: usize = size_of::<ZoneHeader>();
pub(crate) const BLOCK_HEADER_SIZE: usize = size_of::<BlockHeader>();
pub(crate) const BLOCK_ALIGN: usize = align_of::<BlockHeader>();

/// Head of a zone. Lives at the zone's first byte.
#[repr(C)]
pub(crate) struct ZoneHeader {
    pub magic: u32,
    /// Total zone size in bytes, this header included.
    pub length: usize,
    /// Payload bytes currently handed out of this zone.
    pub allocated: usize,
    /// Set once the zone has seen any allocation traffic.
    pub dirty: bool,
    pub next: *mut ZoneHeader,
    pub first_block: *mut BlockHeader,
}

/// Precedes every payload, allocated or free.
#[repr(C)]
pub(crate) struct BlockHeader {
    pub magic: u32,
    /// Payload bytes following this header.
    pub length: usize,
    pub in_use: bool,
    pub next: *mut BlockHeader,
}

/// Rounds a request up so that any block carved after it stays aligned
/// for a [`BlockHeader`].
pub(crate) const fn round_request(bytes: usize) -> usize {
    (bytes + BLOCK_ALIGN - 1) & !(BLOCK_ALIGN - 1)
}

/// Writes a fresh zone header and a single free block spanning the rest
/// of the slab.
///
/// # Safety
///
/// `base` must point at `bytes` of writable memory aligned for
/// [`ZoneHeader`], with `bytes` large enough for both headers.
pub(crate) unsafe fn init_zone(base: NonNull<u8>, bytes: usize) -> *mut ZoneHeader {
    debug_assert!(bytes > ZONE_HEADER_SIZE + BLOCK_HEADER_SIZE);
    debug_assert_eq!(base.as_ptr() as usize % BLOCK_ALIGN, 0);

    let zone = base.as_ptr().cast::<ZoneHeader>();
    let block = unsafe { base.as_ptr().add(ZONE_HEADER_SIZE) }.cast::<BlockHeader>();
    unsafe {
        block.write(BlockHeader {
            magic: BLOCK_MAGIC,
            length: bytes - ZONE_HEADER_SIZE - BLOCK_HEADER_SIZE,
            in_use: false,
            next: ptr::null_mut(),
        });
        zone.write(ZoneHeader {
            magic: ZONE_MAGIC,
            length: bytes,
            allocated: 0,
            dirty: false,
            next: ptr::null_mut(),
            first_block: block,
        });
    }
    zone
}

/// First-fit scan of one zone for `bytes` of payload. A found block is
/// split when the leftover can hold another header and at least one byte.
///
/// # Safety
///
/// `zone` must point at an initialised zone.
pub(crate) unsafe fn zone_alloc(zone: *mut ZoneHeader, bytes: usize) -> Option<NonNull<u8>> {
    let want = round_request(bytes);
    let mut block = unsafe { (*zone).first_block };
    while !block.is_null() {
        unsafe {
            assert!(
                (*block).magic == BLOCK_MAGIC,
                "heap corruption: bad block magic at {block:p}"
            );
            if !(*block).in_use && (*block).length >= want {
                let spare = (*block).length - want;
                if spare > BLOCK_HEADER_SIZE {
                    let split = block
                        .cast::<u8>()
                        .add(BLOCK_HEADER_SIZE + want)
                        .cast::<BlockHeader>();
                    split.write(BlockHeader {
                        magic: BLOCK_MAGIC,
                        length: spare - BLOCK_HEADER_SIZE,
                        in_use: false,
                        next: (*block).next,
                    });
                    (*block).length = want;
                    (*block).next = split;
                }
                (*block).in_use = true;
                (*zone).allocated += (*block).length;
                (*zone).dirty = true;
                return NonNull::new(block.cast::<u8>().add(BLOCK_HEADER_SIZE));
            }
            block = (*block).next;
        }
    }
    None
}

/// Releases the block owning `payload` and merges it with the block
/// directly after it when that one is free too. Earlier neighbours are
/// left alone; a later free of the preceding block picks the merge up.
///
/// # Safety
///
/// `zone` must point at the initialised zone containing `payload`.
pub(crate) unsafe fn zone_free(zone: *mut ZoneHeader, payload: *mut u8) {
    let block = unsafe { payload.sub(BLOCK_HEADER_SIZE) }.cast::<BlockHeader>();
    unsafe {
        let zone_end = zone as usize + (*zone).length;
        assert!(
            (block as usize) >= zone as usize + ZONE_HEADER_SIZE && (block as usize) < zone_end,
            "heap corruption: block {block:p} lies outside its zone"
        );
        assert!(
            (*block).magic == BLOCK_MAGIC,
            "heap corruption: bad block magic at {block:p}"
        );
        assert!((*block).in_use, "double free of heap block at {block:p}");

        (*block).in_use = false;
        (*zone).allocated -= (*block).length;

        let next = (*block).next;
        if !next.is_null() && !(*next).in_use {
            assert!(
                (*next).magic == BLOCK_MAGIC,
                "heap corruption: bad block magic at {next:p}"
            );
            (*block).length += BLOCK_HEADER_SIZE + (*next).length;
            (*block).next = (*next).next;
            ptr::write_bytes(next.cast::<u8>(), 0, BLOCK_HEADER_SIZE);
        }
    }
}

/// Whether `addr` falls inside the zone's payload area.
///
/// # Safety
///
/// `zone` must point at an initialised zone.
pub(crate) unsafe fn zone_contains(zone: *mut ZoneHeader, addr: usize) -> bool {
    let start = zone as usize;
    addr > start && addr < start + unsafe { (*zone).length }
}

/// Returns the final block of the zone's chain.
///
/// # Safety
///
/// `zone` must point at an initialised zone.
pub(crate) unsafe fn last_block(zone: *mut ZoneHeader) -> *mut BlockHeader {
    let mut block = unsafe { (*zone).first_block };
    unsafe {
        while !(*block).next.is_null() {
            block = (*block).next;
        }
    }
    block
}

/// Walks one zone and panics at the first inconsistency: a broken magic,
/// a gap or overlap in the block chain, a block running past the zone
/// end, or a byte total that does not add back up to the zone length.
///
/// # Safety
///
/// `zone` must point at an initialised zone.
pub(crate) unsafe fn validate_zone(zone: *mut ZoneHeader) {
    unsafe {
        assert!(
            (*zone).magic == ZONE_MAGIC,
            "heap corruption: bad zone magic at {zone:p}"
        );
        let end = zone as usize + (*zone).length;
        let mut accounted = ZONE_HEADER_SIZE;
        let mut in_use_bytes = 0;
        let mut cursor = zone as usize + ZONE_HEADER_SIZE;
        let mut block = (*zone).first_block;
        while !block.is_null() {
            assert!(
                block as usize == cursor,
                "heap corruption: block chain gap before {block:p}"
            );
            assert!(
                (*block).magic == BLOCK_MAGIC,
                "heap corruption: bad block magic at {block:p}"
            );
            accounted += BLOCK_HEADER_SIZE + (*block).length;
            if (*block).in_use {
                in_use_bytes += (*block).length;
            }
            cursor = block as usize + BLOCK_HEADER_SIZE + (*block).length;
            assert!(cursor <= end, "heap corruption: block {block:p} runs past its zone");
            block = (*block).next;
        }
        assert!(
            accounted == (*zone).length,
            "heap corruption: zone at {zone:p} does not account for all its bytes"
        );
        assert!(
            in_use_bytes == (*zone).allocated,
            "heap corruption: allocation counter of zone at {zone:p} is off"
        );
    }
}
