mod common;

use common::{BOOT_PML2, BOOT_PML3, BOOT_PML4, SimulatedMachine};
use kernel_alloc::VmmError;
use kernel_alloc::vmm::{BootstrapMapper, temp_slot_address};
use kernel_info::memory::{KERNEL_VMA, TEMP_WINDOW_BASE};
use kernel_memory_addresses::{PageSize, PhysicalAddress, Size2M, Size4K, VirtualAddress};
use kernel_vmem::{Mmu, PageTable, PageTableLevel};

fn mapper(machine: &SimulatedMachine) -> BootstrapMapper<'_, SimulatedMachine> {
    let tables = machine.boot_tables();
    BootstrapMapper::new(machine, tables.pml4, tables.temp_pml1)
}

#[test]
fn temp_slots_sit_at_the_top_of_the_window() {
    assert_eq!(temp_slot_address(PageTableLevel::Pml4).as_u64(), TEMP_WINDOW_BASE + 508 * 4096);
    assert_eq!(temp_slot_address(PageTableLevel::Pml1).as_u64(), TEMP_WINDOW_BASE + 511 * 4096);
}

#[test]
fn temp_map_shows_any_frame() {
    let machine = SimulatedMachine::new();
    let mut mapper = mapper(&machine);
    machine.write_u64(0x80_0010, 0x1234_5678);

    let va = mapper.temp_map(PhysicalAddress::new(0x80_0010), PageTableLevel::Pml2);
    assert_eq!(va, temp_slot_address(PageTableLevel::Pml2) + 0x10);
    assert_eq!(unsafe { machine.pointer::<u64>(va).read() }, 0x1234_5678);

    // Remapping the same level replaces the view.
    machine.write_u64(0x90_0010, 7);
    let again = mapper.temp_map(PhysicalAddress::new(0x90_0010), PageTableLevel::Pml2);
    assert_eq!(again, va);
    assert_eq!(unsafe { machine.pointer::<u64>(again).read() }, 7);
    assert!(machine.invalidations().contains(&temp_slot_address(PageTableLevel::Pml2)));
}

#[test]
fn temp_map_reads_page_tables() {
    let machine = SimulatedMachine::new();
    let mut mapper = mapper(&machine);
    let va = mapper.temp_map(PhysicalAddress::new(BOOT_PML3), PageTableLevel::Pml3);
    let table = machine.pointer::<PageTable>(va);
    let entry = unsafe { *(*table).entry(PageTableLevel::Pml3, VirtualAddress::new(KERNEL_VMA)) };
    assert_eq!(entry.physical_address(), PhysicalAddress::new(BOOT_PML2));
}

#[test]
fn maps_huge_pages_once() {
    let machine = SimulatedMachine::new();
    let mut mapper = mapper(&machine);
    let va = VirtualAddress::new(KERNEL_VMA + 0x40_0000);
    let pa = PhysicalAddress::new(0x40_0000);

    assert_eq!(machine.walk(va), None);
    mapper.kernel_bootstrap_map(pa, va).unwrap();
    assert_eq!(machine.walk(va + 0x1_2345), Some(pa + 0x1_2345));
    let entry = machine.read_entry(BOOT_PML2, 2);
    assert!(entry.is_present() && entry.is_huge());
    assert!(machine.invalidations().contains(&va));

    // The same mapping again changes nothing.
    mapper.kernel_bootstrap_map(pa, va).unwrap();
    assert_eq!(machine.read_entry(BOOT_PML2, 2), entry);
    assert_eq!(mapper.translate(va + 8), Some(pa + 8));
}

#[test]
fn rejects_conflicting_and_unaligned_mappings() {
    let machine = SimulatedMachine::new();
    let mut mapper = mapper(&machine);

    assert_eq!(
        mapper.kernel_bootstrap_map(PhysicalAddress::new(0x60_0000), VirtualAddress::new(KERNEL_VMA)),
        Err(VmmError::AlreadyMapped {
            virt: VirtualAddress::new(KERNEL_VMA),
            existing: PhysicalAddress::ZERO
        })
    );
    assert_eq!(
        mapper.kernel_bootstrap_map(PhysicalAddress::new(0x1000), VirtualAddress::new(KERNEL_VMA + Size2M::SIZE)),
        Err(VmmError::Unaligned(0x1000))
    );
    assert_eq!(
        mapper.kernel_bootstrap_map(
            PhysicalAddress::new(Size2M::SIZE),
            VirtualAddress::new(KERNEL_VMA + Size4K::SIZE)
        ),
        Err(VmmError::Unaligned(KERNEL_VMA + Size4K::SIZE))
    );
}

#[test]
fn needs_the_boot_tables_above() {
    let machine = SimulatedMachine::new();
    let mut mapper = mapper(&machine);
    // Nothing in the boot PML4 covers the start of kernel space.
    let va = VirtualAddress::new(0xFFFF_8000_0000_0000);
    assert!(!machine.read_entry(BOOT_PML4, va.pml4_index()).is_present());
    assert_eq!(
        mapper.kernel_bootstrap_map(PhysicalAddress::ZERO, va),
        Err(VmmError::NotPresent {
            virt: va,
            level: PageTableLevel::Pml4
        })
    );
    assert_eq!(mapper.translate(va), None);
}

#[test]
fn refuses_to_map_once_finished() {
    let machine = SimulatedMachine::new();
    let mut mapper = mapper(&machine);
    mapper.finish();
    assert!(mapper.is_finished());
    assert_eq!(
        mapper.kernel_bootstrap_map(PhysicalAddress::new(0x40_0000), VirtualAddress::new(KERNEL_VMA + 0x40_0000)),
        Err(VmmError::BootstrapFinished)
    );
}
