//! # Kernel Memory Management
//!
//! Everything the kernel needs to own memory, from the first allocation
//! after boot to the general-purpose heap:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │  MemorySubsystem     bring-up order, stage checks     │
//! └──────┬─────────────────────┬──────────────────┬───────┘
//!        │                     │                  │
//! ┌──────▼──────┐   ┌──────────▼─────────┐  ┌─────▼───────┐
//! │ Eternal     │   │ KernelAddressSpace │  │ KernelHeap  │
//! │ bump alloc  │   │ VM areas, map/unmap│  │ slab classes│
//! └──────┬──────┘   └──────────┬─────────┘  └─────▲───────┘
//!        │                     │ page tables       │
//! ┌──────▼──────────┐   ┌──────▼─────────────┐     │
//! │ BootstrapMapper │   │ PhysicalMemory-    │─────┘
//! │ TempMap         │   │ Manager (pages)    │
//! └─────────────────┘   └────────────────────┘
//! ```
//!
//! ## Modules
//! - [`pmm`]: page descriptors with reference counts, first-fit ranges.
//! - [`eternal`]: the bump allocator used before the heap exists.
//! - [`vmm`]: the bootstrap mapper, VM areas and the kernel address space.
//! - [`slab`]: fixed-size slot caches over caller-provided buffers.
//! - [`heap`]: nine slab caches, one per power-of-two size class.
//! - [`global`]: the `kmalloc`/`kfree` surface and [`GlobalAlloc`](core::alloc::GlobalAlloc).
//! - [`subsystem`]: ties it all together.
//!
//! All memory access goes through [`kernel_vmem::Mmu`], so the whole stack
//! runs against simulated physical memory in tests.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code, clippy::inline_always)]

pub mod eternal;
pub mod exclusive;
pub mod global;
pub mod heap;
pub mod pmm;
pub mod slab;
pub mod subsystem;
pub mod vmm;

pub use crate::eternal::{EternalAllocator, EternalError};
pub use crate::exclusive::ExclusiveCell;
pub use crate::global::GlobalHeap;
pub use crate::heap::{HeapError, HeapStats, KernelHeap, SizeClass};
pub use crate::pmm::{MemoryStats, PhysicalFrame, PhysicalMemoryManager, PhysicalRange, PmmError};
pub use crate::subsystem::{BootTables, MemoryError, MemorySubsystem};
pub use crate::vmm::{KernelAddressSpace, VmArea, VmAreaKind, VmmError};
