//! Privileged paging instructions.
//!
//! Real instructions are emitted only for freestanding x86 builds; hosted
//! builds (tests) get inert stubs with the same signatures so the callers
//! compile and run unchanged.

#[cfg(all(target_arch = "x86", target_os = "none"))]
use core::arch::asm;

use mm_addr::{PhysicalAddress, VirtualAddress};

/// Drop the TLB entry for one page of the current address space.
#[inline]
pub fn invalidate_page(va: VirtualAddress) {
    #[cfg(all(target_arch = "x86", target_os = "none"))]
    // SAFETY: invlpg only removes a cached translation.
    unsafe {
        asm!("invlpg [{0}]", in(reg) va.as_u32(), options(nostack, preserves_flags));
    }
    #[cfg(not(all(target_arch = "x86", target_os = "none")))]
    let _ = va;
}

/// Load `root` into CR3 and enable paging with supervisor write protection
/// (CR0.PG | CR0.WP | CR0.PE).
///
/// # Safety
///
/// `root` must be the physical address of a valid page directory whose
/// mappings cover the currently executing code and stack, or the CPU
/// triple-faults the instant paging turns on.
#[inline]
pub unsafe fn enable_paging(root: PhysicalAddress) {
    #[cfg(all(target_arch = "x86", target_os = "none"))]
    // SAFETY: contract passed through to the caller.
    unsafe {
        asm!(
            "mov cr3, {root}",
            "mov {tmp}, cr0",
            "or {tmp}, 0x80010001",
            "mov cr0, {tmp}",
            root = in(reg) root.as_u32(),
            tmp = out(reg) _,
            options(nostack),
        );
    }
    #[cfg(not(all(target_arch = "x86", target_os = "none")))]
    let _ = root;
}

/// Reload CR3, flushing every non-global TLB entry. Used after the flat
/// window is pointed at a different address space.
///
/// # Safety
///
/// `root` must be the physical address of the page directory the CPU is
/// meant to run on (normally the one already loaded).
#[inline]
pub unsafe fn reload_root(root: PhysicalAddress) {
    #[cfg(all(target_arch = "x86", target_os = "none"))]
    // SAFETY: contract passed through to the caller.
    unsafe {
        asm!("mov cr3, {0}", in(reg) root.as_u32(), options(nostack, preserves_flags));
    }
    #[cfg(not(all(target_arch = "x86", target_os = "none")))]
    let _ = root;
}
