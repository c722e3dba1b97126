//! # Virtual Memory Manager
//!
//! Two stages share this module:
//!
//! 1. **Bootstrap** ([`BootstrapMapper`]): before the heap exists, the only
//!    way to grow the direct map is to write 2 MiB leaves into the boot page
//!    tables. Intermediate tables are viewed through the temporary mapping
//!    window, since they may not be reachable through the direct map yet.
//! 2. **Kernel address space** ([`KernelAddressSpace`]): once the heap is up,
//!    page tables come from the heap's 4 KiB class and every logical region
//!    of the kernel is a [`VmArea`] kept in sync with the page tables.
//!
//! All page-table accesses go through [`Mmu`](kernel_vmem::Mmu).

mod address_space;
mod bootstrap;
mod vm_area;

pub use address_space::{KernelAddressSpace, MAX_VM_AREAS, PageTableSource};
pub use bootstrap::{BootstrapMapper, temp_slot_address};
pub use vm_area::{VmArea, VmAreaKind};

use crate::pmm::PmmError;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_vmem::PageTableLevel;

#[derive(Debug, Clone, Copy, Eq, PartialEq, thiserror::Error)]
pub enum VmmError {
    #[error("{virt} is already mapped to {existing}")]
    AlreadyMapped {
        virt: VirtualAddress,
        existing: PhysicalAddress,
    },
    #[error("no {level:?} table present for {virt}")]
    NotPresent {
        virt: VirtualAddress,
        level: PageTableLevel,
    },
    #[error("{virt} lies inside a huge page at {level:?}")]
    HugePage {
        virt: VirtualAddress,
        level: PageTableLevel,
    },
    #[error("address {0:#x} is not aligned to the mapping size")]
    Unaligned(u64),
    #[error("bootstrap mapping used after the kernel address space took over")]
    BootstrapFinished,
    #[error("VM area overlaps the existing {kind:?} area")]
    Overlap { kind: VmAreaKind },
    #[error("no free VM area slot")]
    TooManyAreas,
    #[error("out of memory for page tables")]
    OutOfMemory,
    #[error(transparent)]
    Pmm(#[from] PmmError),
}
