//! The heap proper: zone chain management and the growth policy.

use core::ptr::{self, NonNull};

use crate::zone::{
    self, BLOCK_HEADER_SIZE, BLOCK_MAGIC, BlockHeader, MIN_ZONE_SIZE_PAGES, ZONE_MAGIC, ZoneHeader,
};

const PAGE_BYTES: usize = mm_addr::PAGE_SIZE as usize;

/// Source of fresh page-multiple slabs for the heap.
///
/// In the kernel this is backed by the virtual memory mapper; tests use a
/// plain in-process arena. Returned slabs must be page-aligned and span
/// exactly `pages * 4096` writable bytes.
pub trait ZoneBacking {
    /// Obtains `pages` fresh pages, or `None` when no more memory can be
    /// committed.
    fn grow(&mut self, pages: usize) -> Option<NonNull<u8>>;
}

/// A growable heap over a chain of zones.
///
/// Allocation is first-fit across the chain. When nothing fits, the heap
/// asks its backing for more pages and either stretches the last zone in
/// place (when the new slab directly follows it) or appends a new zone.
pub struct Heap<B: ZoneBacking> {
    backing: B,
    first: *mut ZoneHeader,
}

// The raw zone pointers track memory owned via `backing`; the chain is
// only ever touched through `&mut self`.
unsafe impl<B: ZoneBacking + Send> Send for Heap<B> {}

impl<B: ZoneBacking> Heap<B> {
    /// Creates the heap with one zone of `initial_pages` pages. Returns
    /// `None` when the backing cannot provide the initial slab.
    pub fn new(mut backing: B, initial_pages: usize) -> Option<Self> {
        let bytes = initial_pages * PAGE_BYTES;
        let slab = backing.grow(initial_pages)?;
        let first = unsafe { zone::init_zone(slab, bytes) };
        log::info!("heap: initial zone of {initial_pages} pages at {slab:p}");
        Some(Self { backing, first })
    }

    /// Allocates `bytes` of payload, growing the heap when required.
    /// Zero-byte requests are refused.
    pub fn alloc(&mut self, bytes: usize) -> Option<NonNull<u8>> {
        if bytes == 0 {
            log::warn!("heap: refusing zero-byte allocation");
            return None;
        }
        let mut zone = self.first;
        let last = loop {
            unsafe {
                assert!(
                    (*zone).magic == ZONE_MAGIC,
                    "heap corruption: bad zone magic at {zone:p}"
                );
                // Quick reject on the byte counters before walking blocks.
                if (*zone).length - (*zone).allocated > bytes {
                    if let Some(payload) = zone::zone_alloc(zone, bytes) {
                        return Some(payload);
                    }
                }
                if (*zone).next.is_null() {
                    break zone;
                }
                zone = (*zone).next;
            }
        };

        let pages = (bytes / PAGE_BYTES + 1).max(MIN_ZONE_SIZE_PAGES);
        let target = self.expand(last, pages)?;
        unsafe { zone::zone_alloc(target, bytes) }
    }

    /// Returns a previously allocated payload to the heap. A pointer that
    /// belongs to no zone is logged and ignored; freeing the same pointer
    /// twice or handing in a corrupted block panics.
    pub fn free(&mut self, payload: NonNull<u8>) {
        let addr = payload.as_ptr() as usize;
        let mut zone = self.first;
        while !zone.is_null() {
            unsafe {
                if zone::zone_contains(zone, addr) {
                    zone::zone_free(zone, payload.as_ptr());
                    return;
                }
                zone = (*zone).next;
            }
        }
        log::error!("heap: pointer {payload:p} does not belong to any zone, ignoring free");
    }

    /// Walks every zone and panics at the first inconsistency.
    pub fn validate(&self) {
        let mut zone = self.first;
        while !zone.is_null() {
            unsafe {
                zone::validate_zone(zone);
                zone = (*zone).next;
            }
        }
    }

    /// Payload bytes currently handed out.
    pub fn allocated_bytes(&self) -> usize {
        self.fold(0, |acc, zone| acc + unsafe { (*zone).allocated })
    }

    /// Total bytes across all zones, headers included.
    pub fn capacity_bytes(&self) -> usize {
        self.fold(0, |acc, zone| acc + unsafe { (*zone).length })
    }

    /// Number of zones in the chain.
    pub fn zone_count(&self) -> usize {
        self.fold(0, |acc, _| acc + 1)
    }

    fn fold<T, F: FnMut(T, *mut ZoneHeader) -> T>(&self, mut acc: T, mut f: F) -> T {
        let mut zone = self.first;
        while !zone.is_null() {
            acc = f(acc, zone);
            zone = unsafe { (*zone).next };
        }
        acc
    }

    /// Grows the heap by `pages + 1` pages and returns the zone that
    /// received the space.
    fn expand(&mut self, last: *mut ZoneHeader, pages: usize) -> Option<*mut ZoneHeader> {
        let bytes = (pages + 1) * PAGE_BYTES;
        let Some(slab) = self.backing.grow(pages + 1) else {
            log::error!("heap: backing refused to grow by {} pages", pages + 1);
            return None;
        };
        unsafe {
            if slab.as_ptr() as usize == last as usize + (*last).length {
                // Slab continues the last zone, so stretch it rather than
                // chaining a new one.
                let tail = zone::last_block(last);
                if (*tail).in_use {
                    let block = slab.as_ptr().cast::<BlockHeader>();
                    block.write(BlockHeader {
                        magic: BLOCK_MAGIC,
                        length: bytes - BLOCK_HEADER_SIZE,
                        in_use: false,
                        next: ptr::null_mut(),
                    });
                    (*tail).next = block;
                } else {
                    (*tail).length += bytes;
                }
                (*last).length += bytes;
                (*last).dirty = true;
                log::debug!("heap: extended zone at {last:p} by {bytes} bytes");
                Some(last)
            } else {
                let new_zone = zone::init_zone(slab, bytes);
                (*last).next = new_zone;
                log::debug!("heap: appended zone of {bytes} bytes at {new_zone:p}");
                Some(new_zone)
            }
        }
    }

    /// Snapshot of every block as `(payload length, in use)`, in chain
    /// order across all zones.
    #[cfg(test)]
    fn blocks(&self) -> Vec<(usize, bool)> {
        let mut out = Vec::new();
        let mut zone = self.first;
        while !zone.is_null() {
            unsafe {
                let mut block = (*zone).first_block;
                while !block.is_null() {
                    out.push(((*block).length, (*block).in_use));
                    block = (*block).next;
                }
                zone = (*zone).next;
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Carves page-aligned slabs out of one preallocated buffer. With
    /// `gap_pages == 0` successive slabs are contiguous, which lets the
    /// heap stretch its last zone in place; a nonzero gap forces every
    /// growth onto a fresh zone.
    struct SlabBacking {
        storage: Box<[u8]>,
        cursor: usize,
        gap_pages: usize,
        grown_before: bool,
    }

    impl SlabBacking {
        fn new(capacity_pages: usize, gap_pages: usize) -> Self {
            let storage = vec![0u8; (capacity_pages + 1) * PAGE_BYTES].into_boxed_slice();
            let base = storage.as_ptr() as usize;
            let cursor = base.next_multiple_of(PAGE_BYTES) - base;
            Self {
                storage,
                cursor,
                gap_pages,
                grown_before: false,
            }
        }
    }

    impl ZoneBacking for SlabBacking {
        fn grow(&mut self, pages: usize) -> Option<NonNull<u8>> {
            if self.grown_before {
                self.cursor += self.gap_pages * PAGE_BYTES;
            }
            self.grown_before = true;
            let need = pages * PAGE_BYTES;
            if self.cursor + need > self.storage.len() {
                return None;
            }
            let slab = unsafe { self.storage.as_mut_ptr().add(self.cursor) };
            self.cursor += need;
            NonNull::new(slab)
        }
    }

    fn heap_of(pages: usize, capacity_pages: usize) -> Heap<SlabBacking> {
        Heap::new(SlabBacking::new(capacity_pages, 0), pages).unwrap()
    }

    #[test]
    fn alloc_and_free_round_trip() {
        let mut heap = heap_of(4, 8);
        let a = heap.alloc(64).unwrap();
        unsafe { a.as_ptr().write_bytes(0xAB, 64) };
        assert!(heap.allocated_bytes() >= 64);
        heap.free(a);
        assert_eq!(heap.allocated_bytes(), 0);
        heap.validate();
    }

    #[test]
    fn freed_block_is_reused() {
        let mut heap = heap_of(4, 8);
        let a = heap.alloc(128).unwrap();
        let _b = heap.alloc(128).unwrap();
        heap.free(a);
        let c = heap.alloc(128).unwrap();
        assert_eq!(a.as_ptr(), c.as_ptr());
        heap.validate();
    }

    #[test]
    fn freeing_interior_block_leaves_it_whole() {
        // A four page zone with three live allocations; releasing the
        // middle one must leave a single free block of its full size
        // sitting between the two survivors.
        let mut heap = heap_of(4, 8);
        let small = heap.alloc(100).unwrap();
        let big = heap.alloc(5000).unwrap();
        let tiny = heap.alloc(50).unwrap();

        heap.free(big);
        heap.validate();

        let blocks = heap.blocks();
        let frees: Vec<usize> = blocks
            .iter()
            .filter(|(_, in_use)| !in_use)
            .map(|(len, _)| *len)
            .collect();
        // The hole where the 5000 byte payload sat, plus the zone tail.
        assert_eq!(frees.len(), 2);
        assert!(frees[0] >= 5000);

        let replacement = heap.alloc(5000).unwrap();
        assert_eq!(replacement.as_ptr(), big.as_ptr());
        heap.free(small);
        heap.free(tiny);
        heap.free(replacement);
        heap.validate();
    }

    #[test]
    fn free_merges_with_following_block_only() {
        let mut heap = heap_of(4, 8);
        let a = heap.alloc(256).unwrap();
        let b = heap.alloc(256).unwrap();
        let c = heap.alloc(256).unwrap();

        // Free back to front so every free finds its successor free.
        heap.free(c);
        heap.free(b);
        heap.free(a);
        heap.validate();
        assert_eq!(heap.blocks().len(), 1);

        // Front to back leaves holes: a free never merges backwards.
        let a = heap.alloc(256).unwrap();
        let b = heap.alloc(256).unwrap();
        let _c = heap.alloc(256).unwrap();
        heap.free(a);
        heap.free(b);
        heap.validate();
        // The holes left by `a` and `b` stay separate, plus the zone tail.
        let frees = heap.blocks().iter().filter(|(_, u)| !u).count();
        assert_eq!(frees, 3);
    }

    #[test]
    fn zero_byte_allocation_is_refused() {
        let mut heap = heap_of(4, 8);
        assert!(heap.alloc(0).is_none());
    }

    #[test]
    fn exhaustion_stretches_last_zone_in_place() {
        let mut heap = heap_of(2, 128);
        let mut held = Vec::new();
        // Drain the initial two pages.
        while let Some(p) = {
            let fits = heap.capacity_bytes() - heap.allocated_bytes() > 1024;
            if fits { heap.alloc(1024) } else { None }
        } {
            held.push(p);
        }
        let extra = heap.alloc(1024).unwrap();
        // Contiguous backing lets the single zone grow by MIN_ZONE_SIZE_PAGES.
        assert_eq!(heap.zone_count(), 1);
        assert!(heap.capacity_bytes() >= (2 + MIN_ZONE_SIZE_PAGES) * PAGE_BYTES);
        heap.validate();
        heap.free(extra);
        for p in held {
            heap.free(p);
        }
        heap.validate();
    }

    #[test]
    fn exhaustion_with_discontiguous_backing_appends_zone() {
        let mut heap = Heap::new(SlabBacking::new(128, 1), 2).unwrap();
        let big = heap.capacity_bytes();
        let _hold = heap.alloc(big - 256).unwrap();
        let _more = heap.alloc(8192).unwrap();
        assert_eq!(heap.zone_count(), 2);
        heap.validate();
    }

    #[test]
    fn large_request_grows_beyond_minimum() {
        let mut heap = heap_of(2, 256);
        let bytes = 100 * PAGE_BYTES;
        let p = heap.alloc(bytes).unwrap();
        assert!(heap.capacity_bytes() >= bytes);
        heap.free(p);
        heap.validate();
    }

    #[test]
    fn foreign_pointer_is_ignored() {
        let mut heap = heap_of(4, 8);
        let before = heap.allocated_bytes();
        let mut outside = 0u8;
        heap.free(NonNull::from(&mut outside).cast());
        assert_eq!(heap.allocated_bytes(), before);
        heap.validate();
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_panics() {
        let mut heap = heap_of(4, 8);
        let a = heap.alloc(64).unwrap();
        heap.free(a);
        heap.free(a);
    }

    #[test]
    fn mixed_traffic_keeps_zones_consistent() {
        let mut heap = heap_of(4, 256);
        let mut live = Vec::new();
        for round in 1..=64usize {
            live.push(heap.alloc(round * 24 + 1).unwrap());
            if round % 3 == 0 {
                let victim = live.swap_remove(round % live.len());
                heap.free(victim);
            }
            heap.validate();
        }
        for p in live {
            heap.free(p);
        }
        heap.validate();
        assert_eq!(heap.allocated_bytes(), 0);
    }
}
