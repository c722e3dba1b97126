//! # Virtual Memory Support
//!
//! x86-64 paging structures and the hardware seam used by the kernel's
//! memory managers.
//!
//! ## What you get
//! - [`PageTableEntry`]: the hardware entry format, declared with `bitfield-struct`.
//! - [`PageEntryFlags`]: every non-address bit of an entry as a flag set.
//! - [`PageTable`]: a 4 KiB-aligned table of 512 entries with lookup by
//!   [`PageTableLevel`] and virtual address.
//! - [`PageFaultErrorCode`]: the `#PF` error code.
//! - [`Mmu`]: how the memory managers reach virtual memory and the TLB,
//!   implemented for the running CPU by [`HardwareMmu`].
//!
//! ## x86-64 Virtual Address → Physical Address Walk
//!
//! ```text
//! | 47‒39 | 38‒30 | 29‒21 | 20‒12 | 11‒0   |
//! |  PML4 |  PML3 |  PML2 |  PML1 | Offset |
//! ```
//!
//! Each field indexes one table of 512 entries. A PML3 entry with the PS bit
//! maps 1 GiB, a PML2 entry with the PS bit maps 2 MiB, and a PML1 entry maps
//! 4 KiB. Walking the intermediate levels (checking `present`, following
//! the frame to the next table) is the job of the memory manager; this crate
//! only indexes a single table.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code, clippy::inline_always)]

mod entry;
mod mmu;
mod page_fault;
mod table;

pub use crate::entry::{ADDRESS_MASK, PageEntryFlags, PageTableEntry};
pub use crate::mmu::{HardwareMmu, Mmu, invalidate_tlb_page};
pub use crate::page_fault::PageFaultErrorCode;
pub use crate::table::{ENTRY_COUNT, PageTable, PageTableLevel};
