//! # Physical and Virtual Address Types
//!
//! Strongly typed wrappers for the raw 32-bit addresses used by the paging
//! and allocation code. Keeping physical and virtual addresses as distinct
//! types prevents accidental mix-ups at compile time while remaining
//! zero-cost wrappers around `u32`.
//!
//! ## Address anatomy (32-bit x86, 4 KiB pages)
//!
//! ```text
//! | 31‒22     | 21‒12    | 11‒0   |
//! | directory | table    | offset |
//! ```
//!
//! A virtual address selects one of 1024 page-directory entries (each
//! covering 4 MiB), then one of 1024 page-table entries (each covering one
//! 4 KiB page), then a byte offset within that page. Physical addresses are
//! frame-granular: frame `i` starts at byte `i * 4096`.

#![cfg_attr(not(test), no_std)]

use core::fmt;
use core::ops::{Add, AddAssign};

/// Size of one page / physical frame in bytes.
pub const PAGE_SIZE: u32 = 4096;
/// log2([`PAGE_SIZE`]).
pub const PAGE_SHIFT: u32 = 12;
/// Entries per page directory or page table.
pub const TABLE_ENTRIES: usize = 1024;
/// Bytes of virtual address space covered by one directory entry (4 MiB).
pub const DIRECTORY_SPAN: u32 = PAGE_SIZE * TABLE_ENTRIES as u32;

/// Physical memory address (RAM or MMIO).
///
/// Frame-oriented helpers treat the address as `frame_index * PAGE_SIZE`.
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalAddress(u32);

impl PhysicalAddress {
    #[inline]
    #[must_use]
    pub const fn new(v: u32) -> Self {
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }

    /// Base address of physical frame `index`.
    #[inline]
    #[must_use]
    pub const fn from_frame_index(index: usize) -> Self {
        Self((index as u32) << PAGE_SHIFT)
    }

    #[inline]
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Index of the frame containing this address.
    #[inline]
    #[must_use]
    pub const fn frame_index(self) -> usize {
        (self.0 >> PAGE_SHIFT) as usize
    }

    /// Address rounded down to its frame base.
    #[inline]
    #[must_use]
    pub const fn frame_base(self) -> Self {
        Self(align_down(self.0, PAGE_SIZE))
    }

    #[inline]
    #[must_use]
    pub const fn is_page_aligned(self) -> bool {
        self.0 & (PAGE_SIZE - 1) == 0
    }
}

impl Add<u32> for PhysicalAddress {
    type Output = Self;
    fn add(self, rhs: u32) -> Self {
        Self(self.0 + rhs)
    }
}

impl AddAssign<u32> for PhysicalAddress {
    fn add_assign(&mut self, rhs: u32) {
        self.0 += rhs;
    }
}

impl fmt::Debug for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysicalAddress({:#010x})", self.0)
    }
}

impl fmt::Display for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// Virtual (page-table translated) memory address.
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtualAddress(u32);

impl VirtualAddress {
    #[inline]
    #[must_use]
    pub const fn new(v: u32) -> Self {
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Page-directory index (bits 31..22).
    #[inline]
    #[must_use]
    pub const fn directory_index(self) -> usize {
        (self.0 >> 22) as usize
    }

    /// Page-table index within the directory entry (bits 21..12).
    #[inline]
    #[must_use]
    pub const fn table_index(self) -> usize {
        ((self.0 >> PAGE_SHIFT) & 0x3FF) as usize
    }

    /// Byte offset within the page (bits 11..0).
    #[inline]
    #[must_use]
    pub const fn page_offset(self) -> u32 {
        self.0 & (PAGE_SIZE - 1)
    }

    /// Reassemble a page-aligned address from its directory/table indices.
    ///
    /// Both indices must be below [`TABLE_ENTRIES`]; the caller checks.
    #[inline]
    #[must_use]
    pub const fn from_indices(directory: usize, table: usize) -> Self {
        Self((directory as u32) * DIRECTORY_SPAN + (table as u32) * PAGE_SIZE)
    }

    #[inline]
    #[must_use]
    pub const fn is_page_aligned(self) -> bool {
        self.0 & (PAGE_SIZE - 1) == 0
    }

    /// Usable only where virtual addresses are directly dereferenceable,
    /// i.e. in the address space the mapping lives in.
    #[inline]
    #[must_use]
    pub const fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as usize as *mut T
    }
}

impl Add<u32> for VirtualAddress {
    type Output = Self;
    fn add(self, rhs: u32) -> Self {
        Self(self.0 + rhs)
    }
}

impl AddAssign<u32> for VirtualAddress {
    fn add_assign(&mut self, rhs: u32) {
        self.0 += rhs;
    }
}

impl fmt::Debug for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtualAddress({:#010x})", self.0)
    }
}

impl fmt::Display for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// Align `x` down to the nearest multiple of `a`.
///
/// `a` must be non-zero and a power of two; no runtime check is performed.
#[inline(always)]
#[must_use]
pub const fn align_down(x: u32, a: u32) -> u32 {
    x & !(a - 1)
}

/// Align `x` up to the nearest multiple of `a`.
///
/// `a` must be non-zero and a power of two. `x + (a - 1)` must not overflow.
#[inline(always)]
#[must_use]
pub const fn align_up(x: u32, a: u32) -> u32 {
    (x + a - 1) & !(a - 1)
}
