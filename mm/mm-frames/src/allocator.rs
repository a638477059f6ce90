//! Lock-guarded front end over the frame table.

use crate::table::FrameTable;
use mm_addr::PhysicalAddress;
use mm_sync::SpinLock;

/// The physical frame allocator: a [`FrameTable`] behind its dedicated
/// spinlock.
///
/// Every operation acquires the lock for its whole duration. Callers must
/// not hold it across anything that can itself fault or block; on the
/// single-core interrupt model the mapping layer disables interrupts around
/// the sections that call in here from fault-prone code.
pub struct FrameAllocator<'t> {
    table: SpinLock<FrameTable<'t>>,
}

impl<'t> FrameAllocator<'t> {
    #[must_use]
    pub const fn new(table: FrameTable<'t>) -> Self {
        Self {
            table: SpinLock::new(table),
        }
    }

    /// Reserve up to `want` free frames; see [`FrameTable::reserve`].
    pub fn reserve(&self, want: usize, out: &mut [PhysicalAddress]) -> usize {
        self.table.with_lock(|t| t.reserve(want, out))
    }

    /// Release previously reserved frames; see [`FrameTable::release`].
    pub fn release(&self, frames: &[PhysicalAddress]) {
        self.table.with_lock(|t| t.release(frames));
    }

    /// Mark one frame in use; see [`FrameTable::claim`].
    pub fn claim(&self, pa: PhysicalAddress) {
        self.table.with_lock(|t| t.claim(pa));
    }

    #[must_use]
    pub fn frame_count(&self) -> usize {
        self.table.with_lock(|t| t.frame_count())
    }

    #[must_use]
    pub fn free_frames(&self) -> usize {
        self.table.with_lock(|t| t.free_frames())
    }

    #[must_use]
    pub fn is_in_use(&self, index: usize) -> bool {
        self.table.with_lock(|t| t.is_in_use(index))
    }
}
