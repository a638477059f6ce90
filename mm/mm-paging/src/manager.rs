//! The memory manager: one object tying frames, spaces, window and mapper
//! together behind a single edit lock.

use crate::space::{self, AddressSpace};
use crate::vmm::{self, MapError};
use crate::window::{FaultContext, FaultOutcome, FlatWindow};
use crate::{PageFlags, PageTables};
use core::ptr::NonNull;
use mm_addr::VirtualAddress;
use mm_frames::FrameAllocator;
use mm_heap::ZoneBacking;
use mm_sync::{IrqGuard, SpinLock};

/// Process-wide memory management state.
///
/// All mapping edits are serialized by one spinlock around the accessor,
/// taken with interrupts disabled: the edits can fault into
/// [`handle_page_fault`](Self::handle_page_fault), and on a single core
/// that hook must be the only thing that can re-enter while the lock is
/// held.
pub struct MemoryManager<'t, T: PageTables> {
    frames: FrameAllocator<'t>,
    kernel: AddressSpace,
    window: FlatWindow,
    tables: SpinLock<T>,
}

impl<'t, T: PageTables> MemoryManager<'t, T> {
    /// Wrap an accessor, frame allocator and the kernel space produced by
    /// [`space::setup_kernel_space`].
    pub const fn new(tables: T, frames: FrameAllocator<'t>, kernel: AddressSpace) -> Self {
        Self {
            frames,
            kernel,
            window: FlatWindow::new(),
            tables: SpinLock::new(tables),
        }
    }

    /// The physical frame allocator.
    pub const fn frames(&self) -> &FrameAllocator<'t> {
        &self.frames
    }

    /// The kernel's own address space.
    pub const fn kernel_space(&self) -> AddressSpace {
        self.kernel
    }

    /// Run one mapping edit against `space`, window retargeted there for
    /// the duration and back to the kernel afterwards.
    fn with_space<R>(&self, space: AddressSpace, f: impl FnOnce(&mut T) -> R) -> R {
        let _irq = IrqGuard::new();
        let mut tables = self.tables.lock();
        tables.retarget(space.root());
        let out = f(&mut *tables);
        tables.retarget(self.kernel.root());
        out
    }

    /// Reserve `count` frames and map them into the first free virtual
    /// run of `space`. See [`vmm::alloc_pages`].
    pub fn allocate_pages(
        &self,
        space: AddressSpace,
        count: usize,
        flags: PageFlags,
    ) -> Result<VirtualAddress, MapError> {
        self.with_space(space, |t| vmm::alloc_pages(t, &self.frames, count, flags))
    }

    /// Unmap `count` pages of `space` starting at `va` and release their
    /// frames.
    pub fn deallocate_pages(&self, space: AddressSpace, va: VirtualAddress, count: usize) {
        self.with_space(space, |t| vmm::dealloc_pages(t, &self.frames, va, count));
    }

    /// Map one frame at an explicit slot of `space`. See [`vmm::map_page`].
    pub fn map_page(
        &self,
        space: AddressSpace,
        frame: mm_addr::PhysicalAddress,
        directory: usize,
        table: usize,
        flags: PageFlags,
    ) -> Result<VirtualAddress, MapError> {
        self.with_space(space, |t| {
            vmm::map_page(t, &self.frames, frame, directory, table, flags)
        })
    }

    /// Create a process address space. See [`space::create_process_space`].
    pub fn create_process_space(&self) -> Result<AddressSpace, MapError> {
        let _irq = IrqGuard::new();
        let mut tables = self.tables.lock();
        space::create_process_space(&mut *tables, &self.frames, self.kernel)
    }

    /// Destroy a process address space, releasing all its frames.
    pub fn destroy_process_space(&self, space: AddressSpace) {
        assert!(
            space != self.kernel,
            "attempt to destroy the kernel address space"
        );
        let _irq = IrqGuard::new();
        let mut tables = self.tables.lock();
        if tables.target() == space.root() {
            tables.retarget(self.kernel.root());
        }
        space::destroy_process_space(&mut *tables, &self.frames, space);
    }

    /// Entry point for the CPU page-fault trampoline.
    pub fn handle_page_fault(&self, ctx: &FaultContext) -> FaultOutcome {
        // SAFETY: fault delivery runs with interrupts off on the single
        // core, strictly nested inside whatever holds the edit lock, so
        // there is no concurrent access to bypass.
        let tables = unsafe { &mut *self.tables.data_ptr() };
        self.window.handle_fault(ctx, tables, &self.frames)
    }

    /// A heap growth source drawing pages from `space` with `flags`.
    pub const fn heap_backing(&self, space: AddressSpace, flags: PageFlags) -> HeapBacking<'_, 't, T> {
        HeapBacking {
            manager: self,
            space,
            flags,
        }
    }
}

/// Grows a [`mm_heap::Heap`] by allocating mapped pages from an address
/// space.
pub struct HeapBacking<'m, 't, T: PageTables> {
    manager: &'m MemoryManager<'t, T>,
    space: AddressSpace,
    flags: PageFlags,
}

impl<T: PageTables> ZoneBacking for HeapBacking<'_, '_, T> {
    fn grow(&mut self, pages: usize) -> Option<NonNull<u8>> {
        let va = self
            .manager
            .allocate_pages(self.space, pages, self.flags)
            .ok()?;
        NonNull::new(va.as_mut_ptr())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::fixture;
    use crate::space::setup_kernel_space;
    use crate::window::PageFaultCode;
    use crate::WINDOW_BASE;
    use mm_addr::PAGE_SIZE;

    fn manager() -> MemoryManager<'static, crate::sim::SimPhys> {
        let (mut sim, frames) = fixture(64);
        let kernel = setup_kernel_space(&mut sim, &frames).unwrap();
        MemoryManager::new(sim, frames, kernel)
    }

    #[test]
    fn allocate_and_deallocate_round_trip() {
        let mgr = manager();
        let kernel = mgr.kernel_space();
        let free_before = mgr.frames().free_frames();

        let va = mgr.allocate_pages(kernel, 2, PageFlags::WRITABLE).unwrap();
        assert_eq!(mgr.frames().free_frames(), free_before - 2);
        mgr.deallocate_pages(kernel, va, 2);
        assert_eq!(mgr.frames().free_frames(), free_before);
    }

    #[test]
    fn process_lifecycle_restores_the_frame_table() {
        let mgr = manager();
        let free_before = mgr.frames().free_frames();

        let proc = mgr.create_process_space().unwrap();
        let va = mgr
            .allocate_pages(proc, 3, PageFlags::WRITABLE | PageFlags::USER)
            .unwrap();
        assert!(va.as_u32() >= 0x0010_0000);

        mgr.destroy_process_space(proc);
        assert_eq!(mgr.frames().free_frames(), free_before);
    }

    #[test]
    fn fault_hook_is_reachable_through_the_facade() {
        let mgr = manager();
        let slot = 321;
        let ctx = FaultContext {
            address: WINDOW_BASE + (slot as u32) * PAGE_SIZE,
            code: PageFaultCode::new(),
            instruction: mm_addr::VirtualAddress::new(0x9000),
            code_segment: 0x08,
            eflags: 0x0002,
        };
        assert_eq!(mgr.handle_page_fault(&ctx), FaultOutcome::Handled);
    }

    #[test]
    fn heap_backing_hands_out_mapped_runs() {
        let mgr = manager();
        let mut backing = mgr.heap_backing(mgr.kernel_space(), PageFlags::WRITABLE);
        let first = backing.grow(3).unwrap();
        let second = backing.grow(2).unwrap();
        // First-fit hands out consecutive runs from the same region.
        assert_eq!(
            first.as_ptr() as usize + 3 * PAGE_SIZE as usize,
            second.as_ptr() as usize
        );
    }
}
