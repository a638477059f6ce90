//! The flat page-table window's page-fault materialization hook.
//!
//! The window itself is pure address arithmetic (see the crate docs); what
//! lives here is the trap-side half: deciding whether a page fault is a
//! legitimate first touch of a sparse directory slot, and installing the
//! missing page table when it is.

use crate::vmm;
use crate::{PageTables, WINDOW_BASE, WINDOW_DIRECTORY_SLOT};
use bitfield_struct::bitfield;
use core::sync::atomic::{AtomicUsize, Ordering};
use mm_addr::{DIRECTORY_SPAN, VirtualAddress};
use mm_frames::FrameAllocator;

/// Page-fault error code (32-bit x86).
///
/// Reference: Intel SDM Vol. 3A, §6.15 "Interrupt 14, Page-Fault
/// Exception (#PF)".
#[bitfield(u32)]
pub struct PageFaultCode {
    /// 0 = non-present page, 1 = protection violation.
    pub present: bool,

    /// 0 = read, 1 = write access.
    pub write: bool,

    /// 0 = supervisor access, 1 = user-mode access.
    pub user: bool,

    /// Reserved bit set in a paging structure.
    pub reserved_bit: bool,

    /// Instruction fetch.
    pub instruction_fetch: bool,

    #[bits(27)]
    __: u32,
}

/// Everything the exception trampoline hands to the hook.
pub struct FaultContext {
    /// Faulting load/store address (CR2).
    pub address: VirtualAddress,
    /// Error code pushed by the CPU.
    pub code: PageFaultCode,
    /// Address of the faulting instruction.
    pub instruction: VirtualAddress,
    /// Code segment selector at the time of the fault.
    pub code_segment: u16,
    /// EFLAGS at the time of the fault.
    pub eflags: u32,
}

/// Verdict of [`FlatWindow::handle_fault`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FaultOutcome {
    /// The missing table was installed; retry the faulting instruction.
    Handled,
    /// Not a sparse-window miss; escalate to the generic fault reporter.
    NotHandled,
}

impl FaultOutcome {
    /// Value the exception trampoline expects: 0 retry, 1 escalate.
    #[must_use]
    pub const fn code(self) -> u32 {
        match self {
            Self::Handled => 0,
            Self::NotHandled => 1,
        }
    }
}

/// State of the window's fault hook.
pub struct FlatWindow {
    /// Nesting counter; nonzero while a materialization is in flight.
    depth: AtomicUsize,
}

impl FlatWindow {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            depth: AtomicUsize::new(0),
        }
    }

    /// Decide one page fault.
    ///
    /// Returns [`FaultOutcome::Handled`] only for a kernel-mode,
    /// non-present fault inside the window range whose directory slot is
    /// marked sparse. In that case the backing table is reserved, zeroed
    /// and installed before returning, so the retried access succeeds.
    ///
    /// Frame exhaustion during materialization is fatal: the faulting
    /// instruction cannot be resumed without the table, so there is
    /// nothing to return to.
    ///
    /// Re-entry (a fault raised while a materialization is already in
    /// flight) is refused rather than serviced; the frame-table lock is
    /// held somewhere below us and re-entering would deadlock it.
    pub fn handle_fault(
        &self,
        ctx: &FaultContext,
        tables: &mut impl PageTables,
        frames: &FrameAllocator,
    ) -> FaultOutcome {
        if ctx.code.present() {
            // Protection violation, not a missing table.
            return FaultOutcome::NotHandled;
        }
        if ctx.code.user() || ctx.code_segment & 3 != 0 {
            return FaultOutcome::NotHandled;
        }
        let va = ctx.address.as_u32();
        if va < WINDOW_BASE.as_u32() || va >= WINDOW_BASE.as_u32() + DIRECTORY_SPAN {
            return FaultOutcome::NotHandled;
        }

        // Window page i is page table i, so the table index of the fault
        // address names the directory slot that lacks its table.
        let slot = ctx.address.table_index();
        if slot == WINDOW_DIRECTORY_SLOT {
            // The self-map slot is wired at space construction; a miss
            // there is corruption, not laziness.
            return FaultOutcome::NotHandled;
        }
        let entry = tables.directory_entry(slot);
        if entry.present() || !entry.sparse() {
            return FaultOutcome::NotHandled;
        }

        if self.depth.fetch_add(1, Ordering::Acquire) > 0 {
            self.depth.fetch_sub(1, Ordering::Release);
            return FaultOutcome::NotHandled;
        }
        let installed = vmm::ensure_table(tables, frames, slot, crate::PageFlags::WRITABLE);
        self.depth.fetch_sub(1, Ordering::Release);
        match installed {
            Ok(_) => {
                log::debug!(
                    "window: materialized page table for directory slot {slot} (fault at {})",
                    ctx.address
                );
                FaultOutcome::Handled
            }
            Err(_) => {
                panic!("out of physical memory while materializing page table for directory slot {slot}")
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn force_depth(&self, depth: usize) {
        self.depth.store(depth, Ordering::Relaxed);
    }
}

impl Default for FlatWindow {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::fixture;
    use crate::space::setup_kernel_space;

    fn kernel_fault(address: VirtualAddress) -> FaultContext {
        FaultContext {
            address,
            code: PageFaultCode::new(),
            instruction: VirtualAddress::new(0x0000_9000),
            code_segment: 0x08,
            eflags: 0x0002,
        }
    }

    #[test]
    fn sparse_window_miss_is_materialized() {
        let (mut sim, frames) = fixture(64);
        setup_kernel_space(&mut sim, &frames).unwrap();
        let window = FlatWindow::new();
        let free_before = frames.free_frames();

        let slot = 300;
        let va = WINDOW_BASE + (slot as u32) * mm_addr::PAGE_SIZE;
        assert!(!sim.directory_entry(slot).present());

        let outcome = window.handle_fault(&kernel_fault(va), &mut sim, &frames);
        assert_eq!(outcome, FaultOutcome::Handled);
        assert_eq!(outcome.code(), 0);

        // The slot is now backed; the retried access cannot fault again.
        let dir = sim.directory_entry(slot);
        assert!(dir.present());
        assert!(dir.writable());
        assert_eq!(frames.free_frames(), free_before - 1);
        assert!(!sim.table_entry(slot, 0).present());
    }

    #[test]
    fn protection_violation_is_escalated() {
        let (mut sim, frames) = fixture(64);
        setup_kernel_space(&mut sim, &frames).unwrap();
        let window = FlatWindow::new();

        let mut ctx = kernel_fault(WINDOW_BASE + 5 * mm_addr::PAGE_SIZE);
        ctx.code = PageFaultCode::new().with_present(true).with_write(true);
        let outcome = window.handle_fault(&ctx, &mut sim, &frames);
        assert_eq!(outcome, FaultOutcome::NotHandled);
        assert_eq!(outcome.code(), 1);
    }

    #[test]
    fn user_mode_fault_is_escalated() {
        let (mut sim, frames) = fixture(64);
        setup_kernel_space(&mut sim, &frames).unwrap();
        let window = FlatWindow::new();

        let mut ctx = kernel_fault(WINDOW_BASE + 5 * mm_addr::PAGE_SIZE);
        ctx.code = PageFaultCode::new().with_user(true);
        ctx.code_segment = 0x1B;
        assert_eq!(
            window.handle_fault(&ctx, &mut sim, &frames),
            FaultOutcome::NotHandled
        );
    }

    #[test]
    fn fault_outside_window_is_escalated() {
        let (mut sim, frames) = fixture(64);
        setup_kernel_space(&mut sim, &frames).unwrap();
        let window = FlatWindow::new();

        let ctx = kernel_fault(VirtualAddress::new(0x1234_5000));
        assert_eq!(
            window.handle_fault(&ctx, &mut sim, &frames),
            FaultOutcome::NotHandled
        );
    }

    #[test]
    fn miss_on_non_sparse_slot_is_escalated() {
        let (mut sim, frames) = fixture(64);
        setup_kernel_space(&mut sim, &frames).unwrap();
        let window = FlatWindow::new();

        // Clear a slot entirely; without the sparse marker the hook must
        // not invent a table.
        let slot = 700;
        sim.set_directory_entry(slot, crate::PageTableEntry::new());
        let va = WINDOW_BASE + (slot as u32) * mm_addr::PAGE_SIZE;
        assert_eq!(
            window.handle_fault(&kernel_fault(va), &mut sim, &frames),
            FaultOutcome::NotHandled
        );
    }

    #[test]
    fn reentered_hook_refuses_to_allocate() {
        let (mut sim, frames) = fixture(64);
        setup_kernel_space(&mut sim, &frames).unwrap();
        let window = FlatWindow::new();
        window.force_depth(1);

        let free_before = frames.free_frames();
        let va = WINDOW_BASE + 400 * mm_addr::PAGE_SIZE;
        assert_eq!(
            window.handle_fault(&kernel_fault(va), &mut sim, &frames),
            FaultOutcome::NotHandled
        );
        assert_eq!(frames.free_frames(), free_before);
    }
}
