//! A small simulated machine: 16 MiB of "physical" memory, boot page tables
//! laid out the way the boot code leaves them, and an MMU that walks them.

#![allow(dead_code)]

use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::cell::RefCell;
use std::ptr::NonNull;

use kernel_alloc::BootTables;
use kernel_info::boot::{KernelLayout, MemoryMapEntry, Section};
use kernel_info::memory::KERNEL_VMA;
use kernel_memory_addresses::{PageSize, PhysicalAddress, Size1G, Size2M, Size4K, VirtualAddress};
use kernel_vmem::{Mmu, PageEntryFlags, PageTableEntry, PageTableLevel};

pub const RAM_SIZE: u64 = 16 * 1024 * 1024;

/// Low memory ends at the legacy VGA hole.
pub const LOW_MEMORY_END: u64 = 0x9_F000;

pub const IMAGE_START: u64 = 0x10_0000;
pub const TEXT_END: u64 = 0x14_0000;
pub const RODATA_END: u64 = 0x15_0000;
pub const DATA_END: u64 = 0x16_0000;
pub const IMAGE_END: u64 = 0x18_0000;

/// Boot tables live in the image's bss.
pub const BOOT_PML4: u64 = 0x17_0000;
pub const BOOT_PML3: u64 = 0x17_1000;
pub const BOOT_PML2: u64 = 0x17_2000;
pub const BOOT_PML2_HIGH: u64 = 0x17_3000;
pub const BOOT_TEMP_PML1: u64 = 0x17_4000;

/// Where the boot loader left the multiboot information.
pub const MULTIBOOT_INFO: u64 = 0x9000;
pub const MULTIBOOT_INFO_LEN: u64 = 0x240;

pub struct SimulatedMachine {
    ram: NonNull<u8>,
    invalidations: RefCell<Vec<VirtualAddress>>,
}

impl SimulatedMachine {
    pub fn new() -> Self {
        let ram = NonNull::new(unsafe { alloc_zeroed(Self::layout_of_ram()) }).expect("host memory");
        let machine = Self {
            ram,
            invalidations: RefCell::new(Vec::new()),
        };

        let kernel = VirtualAddress::new(KERNEL_VMA);
        let top = VirtualAddress::new(u64::MAX);
        machine.write_entry(BOOT_PML4, kernel.pml4_index(), PageTableEntry::table(BOOT_PML3.into()));
        machine.write_entry(BOOT_PML3, kernel.pml3_index(), PageTableEntry::table(BOOT_PML2.into()));
        machine.write_entry(BOOT_PML3, top.pml3_index(), PageTableEntry::table(BOOT_PML2_HIGH.into()));
        machine.write_entry(BOOT_PML2, 0, PageTableEntry::huge(PhysicalAddress::ZERO, PageEntryFlags::TABLE));
        machine.write_entry(BOOT_PML2_HIGH, top.pml2_index(), PageTableEntry::table(BOOT_TEMP_PML1.into()));
        machine
    }

    fn layout_of_ram() -> Layout {
        Layout::from_size_align(RAM_SIZE as usize, 4096).expect("RAM layout")
    }

    pub fn boot_tables(&self) -> BootTables {
        BootTables {
            pml4: VirtualAddress::from_physical(BOOT_PML4.into()),
            temp_pml1: VirtualAddress::from_physical(BOOT_TEMP_PML1.into()),
            mapped_end: VirtualAddress::new(KERNEL_VMA + Size2M::SIZE),
        }
    }

    pub fn kernel_layout(&self) -> KernelLayout {
        KernelLayout {
            text: Section::new(KERNEL_VMA + IMAGE_START, KERNEL_VMA + TEXT_END),
            rodata: Section::new(KERNEL_VMA + TEXT_END, KERNEL_VMA + RODATA_END),
            data: Section::new(KERNEL_VMA + RODATA_END, KERNEL_VMA + DATA_END),
            bss: Section::new(KERNEL_VMA + DATA_END, KERNEL_VMA + IMAGE_END),
            image_end: VirtualAddress::new(KERNEL_VMA + IMAGE_END),
        }
    }

    /// The firmware memory map of this machine.
    pub fn memory_map(&self) -> Vec<MemoryMapEntry> {
        vec![
            MemoryMapEntry::available(0, LOW_MEMORY_END),
            MemoryMapEntry::new(LOW_MEMORY_END, 0x10_0000 - LOW_MEMORY_END, MemoryMapEntry::RESERVED),
            MemoryMapEntry::available(0x10_0000, RAM_SIZE - 0x10_0000),
        ]
    }

    /// Pages in the memory map, as the page pool will count them.
    pub fn available_pages(&self) -> usize {
        ((LOW_MEMORY_END / Size4K::SIZE) + (RAM_SIZE - 0x10_0000) / Size4K::SIZE) as usize
    }

    pub fn multiboot_info(&self) -> (PhysicalAddress, u64) {
        (MULTIBOOT_INFO.into(), MULTIBOOT_INFO_LEN)
    }

    /// Every page invalidated so far.
    pub fn invalidations(&self) -> Vec<VirtualAddress> {
        self.invalidations.borrow().clone()
    }

    pub fn read_entry(&self, table: u64, index: usize) -> PageTableEntry {
        PageTableEntry::from_bits(self.read_u64(table + index as u64 * 8))
    }

    pub fn write_entry(&self, table: u64, index: usize, entry: PageTableEntry) {
        self.write_u64(table + index as u64 * 8, entry.into_bits());
    }

    pub fn read_u64(&self, pa: u64) -> u64 {
        unsafe { self.physical(pa).cast::<u64>().read() }
    }

    pub fn write_u64(&self, pa: u64, value: u64) {
        unsafe { self.physical(pa).cast::<u64>().write(value) }
    }

    /// Host pointer of physical address `pa`.
    pub fn physical(&self, pa: u64) -> *mut u8 {
        assert!(pa < RAM_SIZE, "physical address {pa:#x} outside RAM");
        unsafe { self.ram.as_ptr().add(pa as usize) }
    }

    /// Walk the boot PML4 like the CPU would.
    pub fn walk(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        let mut table = BOOT_PML4;
        for level in PageTableLevel::ALL {
            let entry = self.read_entry(table, level.index(va));
            if !entry.is_present() {
                return None;
            }
            let base = entry.physical_address();
            match level {
                PageTableLevel::Pml3 if entry.is_huge() => return Some(base + va.page_offset::<Size1G>()),
                PageTableLevel::Pml2 if entry.is_huge() => return Some(base + va.page_offset::<Size2M>()),
                PageTableLevel::Pml1 => return Some(base + va.page_offset::<Size4K>()),
                _ => table = base.as_u64(),
            }
        }
        None
    }
}

impl Drop for SimulatedMachine {
    fn drop(&mut self) {
        unsafe { dealloc(self.ram.as_ptr(), Self::layout_of_ram()) };
    }
}

unsafe impl Mmu for SimulatedMachine {
    fn pointer<T>(&self, va: VirtualAddress) -> *mut T {
        let pa = self
            .walk(va)
            .unwrap_or_else(|| panic!("page fault: {va} is not mapped"));
        self.physical(pa.as_u64()).cast()
    }

    fn address<T>(&self, ptr: *const T) -> VirtualAddress {
        let offset = (ptr as usize)
            .checked_sub(self.ram.as_ptr() as usize)
            .filter(|&offset| (offset as u64) < RAM_SIZE)
            .expect("pointer outside simulated RAM");
        VirtualAddress::new(KERNEL_VMA + offset as u64)
    }

    fn invalidate_page(&self, va: VirtualAddress) {
        self.invalidations.borrow_mut().push(va.align_down::<Size4K>());
    }
}
