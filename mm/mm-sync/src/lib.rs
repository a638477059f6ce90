//! # Synchronization primitives for the memory core
//!
//! Concurrency here comes from hardware interrupt re-entrancy on a single
//! core, not from threads. Two tools cover it:
//!
//! - [`SpinLock`]: a plain test-and-set lock with no fairness guarantee.
//!   Callers must not block on I/O while holding it.
//! - [`IrqGuard`]: saves the interrupt-enable flag, disables interrupts, and
//!   restores the saved state on drop. Wrapping a fault-prone critical
//!   section in an `IrqGuard` turns potential re-entrant access into strictly
//!   serial access.
//!
//! The interrupt-flag assembly only exists on a bare-metal x86 target; host
//! builds (the test suite) get inert stubs so locking code paths still run.

#![cfg_attr(not(test), no_std)]
#![allow(unsafe_code)]

mod irq;
mod spin_lock;

pub use irq::IrqGuard;
pub use spin_lock::{SpinLock, SpinLockGuard};
