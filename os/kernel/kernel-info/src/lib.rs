//! # Kernel Memory Configuration and Boot Interface
//!
//! Compile-time memory layout and the boot-time inputs consumed by the memory
//! subsystem.
//!
//! ### Memory Layout ([`memory`])
//! * Direct map of physical memory at [`memory::KERNEL_VMA`]
//! * Heap, stack and temporary-mapping areas at the top of the address space
//! * The slab heap budget ([`memory::HeapConfig`])
//!
//! ### Boot Information ([`boot`])
//! * The firmware memory map ([`boot::MemoryMapTag`], [`boot::MemoryMapEntry`])
//! * Kernel section addresses from the linker script ([`boot::KernelLayout`])
//!
//! All checks on the layout are `const` assertions; a misconfigured layout
//! fails to compile.

#![cfg_attr(not(any(test, doctest)), no_std)]

pub mod boot;
pub mod memory;
