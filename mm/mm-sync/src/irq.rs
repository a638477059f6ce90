//! Interrupt-flag save/disable/restore.
//!
//! The memory core disables interrupts around the critical sections that
//! call into fault-prone code; the page-fault hook must never find a lock it
//! needs already held on this core.

/// RAII guard that disables interrupts on creation and restores the prior
/// state on drop.
///
/// `IrqGuard::new()` snapshots EFLAGS.IF. If interrupts were enabled it
/// executes `cli`; on drop it executes `sti` only if they were previously
/// enabled, preserving the original state. Nesting is therefore safe.
pub struct IrqGuard {
    /// Whether interrupts were enabled (IF=1) when the guard was created.
    were_enabled: bool,
}

impl Default for IrqGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl IrqGuard {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        let enabled = interrupts_enabled();
        if enabled {
            disable_interrupts();
        }
        Self {
            were_enabled: enabled,
        }
    }
}

impl Drop for IrqGuard {
    fn drop(&mut self) {
        if self.were_enabled {
            enable_interrupts();
        }
    }
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
#[inline]
fn interrupts_enabled() -> bool {
    let eflags: u32;
    unsafe {
        core::arch::asm!("pushfd; pop {}", out(reg) eflags, options(nostack, preserves_flags));
    }
    eflags & (1 << 9) != 0
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
#[inline]
fn disable_interrupts() {
    unsafe { core::arch::asm!("cli", options(nomem, nostack, preserves_flags)) }
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
#[inline]
fn enable_interrupts() {
    unsafe { core::arch::asm!("sti", options(nomem, nostack, preserves_flags)) }
}

// Host builds have no interrupt flag to manipulate; the guard still
// exercises the enable/disable bookkeeping in tests.
#[cfg(not(all(target_arch = "x86", target_os = "none")))]
#[inline]
fn interrupts_enabled() -> bool {
    false
}

#[cfg(not(all(target_arch = "x86", target_os = "none")))]
#[inline]
fn disable_interrupts() {}

#[cfg(not(all(target_arch = "x86", target_os = "none")))]
#[inline]
fn enable_interrupts() {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nests_without_panicking() {
        let _outer = IrqGuard::new();
        {
            let _inner = IrqGuard::new();
        }
    }
}
