//! # Virtual and Physical Memory Address Types
//!
//! Strongly typed wrappers for raw memory addresses and page bases used by
//! the kernel's physical and virtual memory managers.
//!
//! ## Overview
//!
//! | Type | Description |
//! |------|-------------|
//! | [`MemoryAddress`] | A raw 64-bit address with no intent attached. |
//! | [`PhysicalAddress`] / [`PhysicalPage<S>`] | Physical memory (RAM or MMIO) and `S`-aligned frames. |
//! | [`VirtualAddress`] / [`VirtualPage<S>`] | Page-table translated memory and `S`-aligned pages. |
//! | [`VirtualAddressParts`] | The four 9-bit table indices plus the 12-bit offset of a virtual address. |
//!
//! Physical and virtual addresses never convert implicitly. The kernel maps
//! physical memory linearly at [`KERNEL_VMA`], and the only sanctioned
//! conversions are [`PhysicalAddress::from_virtual`] and
//! [`VirtualAddress::from_physical`], which subtract or add that offset.
//!
//! ## Page Sizes
//!
//! - [`Size4K`]: 4 KiB base pages
//! - [`Size2M`]: 2 MiB huge pages
//! - [`Size1G`]: 1 GiB huge pages
//!
//! ## Typical Usage
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let pa = PhysicalAddress::new(0x0010_2042);
//! let va = VirtualAddress::from_physical(pa);
//! assert_eq!(va.as_u64(), KERNEL_VMA + 0x0010_2042);
//! assert_eq!(PhysicalAddress::from_virtual(va), pa);
//!
//! let parts = va.parts();
//! assert_eq!((parts.pml4, parts.pml3), (511, 510));
//! assert_eq!(VirtualAddress::from_parts(parts), va);
//!
//! let frame = pa.page::<Size4K>();
//! assert_eq!(frame.base().as_u64(), 0x0010_2000);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code, clippy::inline_always)]

mod memory_address;
mod page;
mod page_size;
mod physical_address;
mod virtual_address;

pub use memory_address::MemoryAddress;
pub use page::{PhysicalPage, VirtualPage};
pub use page_size::{PageSize, Size1G, Size2M, Size4K};
pub use physical_address::PhysicalAddress;
pub use virtual_address::{VirtualAddress, VirtualAddressParts};

/// Virtual base of the kernel's direct map: physical address `p` is visible
/// at virtual address `KERNEL_VMA + p`.
pub const KERNEL_VMA: u64 = 0xFFFF_FFFF_8000_0000;

/// Round `value` up to a multiple of `align` (a power of two).
///
/// Returns `None` on overflow.
#[inline]
#[must_use]
pub const fn align_up(value: u64, align: u64) -> Option<u64> {
    debug_assert!(align.is_power_of_two());
    match value.checked_add(align - 1) {
        Some(v) => Some(v & !(align - 1)),
        None => None,
    }
}

/// Round `value` down to a multiple of `align` (a power of two).
#[inline]
#[must_use]
pub const fn align_down(value: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    value & !(align - 1)
}

#[inline]
#[must_use]
pub const fn is_aligned(value: u64, align: u64) -> bool {
    value & (align - 1) == 0
}
