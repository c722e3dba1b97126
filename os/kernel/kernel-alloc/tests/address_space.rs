mod common;

use std::mem::MaybeUninit;
use std::ptr::NonNull;

use common::{BOOT_PML4, SimulatedMachine};
use kernel_alloc::vmm::PageTableSource;
use kernel_alloc::{KernelAddressSpace, VmArea, VmAreaKind, VmmError};
use kernel_info::memory::{HEAP_AREA_BASE, KERNEL_VMA};
use kernel_memory_addresses::{PageSize, PhysicalAddress, Size4K, VirtualAddress};
use kernel_vmem::{PageEntryFlags, PageTable, PageTableLevel};

/// Hands out page tables from a fixed run of simulated frames.
struct Frames<'m> {
    machine: &'m SimulatedMachine,
    next: u64,
    end: u64,
}

impl<'m> Frames<'m> {
    fn new(machine: &'m SimulatedMachine) -> Self {
        Self {
            machine,
            next: 0x20_000,
            end: 0x28_000,
        }
    }
}

impl PageTableSource for Frames<'_> {
    fn allocate_table(&mut self) -> Result<NonNull<PageTable>, VmmError> {
        if self.next == self.end {
            return Err(VmmError::OutOfMemory);
        }
        let ptr = self.machine.physical(self.next);
        self.next += Size4K::SIZE;
        Ok(NonNull::new(ptr.cast()).unwrap())
    }
}

fn space(machine: &SimulatedMachine) -> KernelAddressSpace<'_, SimulatedMachine> {
    KernelAddressSpace::new(machine, PhysicalAddress::new(BOOT_PML4))
}

#[test]
fn maps_translates_and_unmaps() {
    let machine = SimulatedMachine::new();
    let mut space = space(&machine);
    let mut tables = Frames::new(&machine);
    let va = VirtualAddress::new(HEAP_AREA_BASE + 0x5000);
    let pa = PhysicalAddress::new(0x30_0000);

    space.map_page(va, pa, PageEntryFlags::KERNEL_DATA, &mut tables).unwrap();
    assert_eq!(space.translate(va + 0x10), Some(pa + 0x10));
    assert_eq!(machine.walk(va), Some(pa));
    assert_eq!(tables.next, 0x21_000, "one PML1 table created");

    assert_eq!(
        space.map_page(va, pa, PageEntryFlags::KERNEL_DATA, &mut tables),
        Err(VmmError::AlreadyMapped { virt: va, existing: pa })
    );

    assert_eq!(space.unmap_page(va), Ok(pa));
    assert_eq!(space.translate(va), None);
    assert_eq!(
        space.unmap_page(va),
        Err(VmmError::NotPresent {
            virt: va,
            level: PageTableLevel::Pml1
        })
    );
}

#[test]
fn translate_follows_huge_pages() {
    let machine = SimulatedMachine::new();
    let mut space = space(&machine);
    assert_eq!(
        space.translate(VirtualAddress::new(KERNEL_VMA + 0x12_3456)),
        Some(PhysicalAddress::new(0x12_3456))
    );
    assert_eq!(space.translate(VirtualAddress::new(KERNEL_VMA + 0x20_0000)), None);
    assert_eq!(
        space.unmap_page(VirtualAddress::new(KERNEL_VMA)),
        Err(VmmError::HugePage {
            virt: VirtualAddress::new(KERNEL_VMA),
            level: PageTableLevel::Pml2
        })
    );
}

#[test]
fn rejects_unaligned_addresses() {
    let machine = SimulatedMachine::new();
    let mut space = space(&machine);
    let mut tables = Frames::new(&machine);
    let va = VirtualAddress::new(HEAP_AREA_BASE + 8);
    assert_eq!(
        space.map_page(va, PhysicalAddress::new(0x30_0000), PageEntryFlags::KERNEL_DATA, &mut tables),
        Err(VmmError::Unaligned(va.as_u64()))
    );
}

#[test]
fn range_mapping_is_all_or_nothing() {
    let machine = SimulatedMachine::new();
    let mut space = space(&machine);
    let mut tables = Frames::new(&machine);
    let base = VirtualAddress::new(HEAP_AREA_BASE);
    let pa = PhysicalAddress::new(0x30_0000);

    space
        .map_page(base + 2 * Size4K::SIZE, pa, PageEntryFlags::KERNEL_DATA, &mut tables)
        .unwrap();
    let result = space.map_range(base, PhysicalAddress::new(0x40_0000), 4, PageEntryFlags::KERNEL_DATA, &mut tables);
    assert!(matches!(result, Err(VmmError::AlreadyMapped { .. })));
    assert_eq!(space.translate(base), None);
    assert_eq!(space.translate(base + Size4K::SIZE), None);
    assert_eq!(space.translate(base + 2 * Size4K::SIZE), Some(pa));

    space.unmap_page(base + 2 * Size4K::SIZE).unwrap();
    space
        .map_range(base, PhysicalAddress::new(0x40_0000), 4, PageEntryFlags::KERNEL_DATA, &mut tables)
        .unwrap();
    assert_eq!(space.translate(base + 3 * Size4K::SIZE), Some(PhysicalAddress::new(0x40_3000)));
    space.unmap_range(base, 4).unwrap();
    assert_eq!(space.translate(base + 3 * Size4K::SIZE), None);
}

#[test]
fn runs_out_of_tables() {
    let machine = SimulatedMachine::new();
    let mut space = space(&machine);
    let mut tables = Frames {
        machine: &machine,
        next: 0x20_000,
        end: 0x20_000,
    };
    assert_eq!(
        space.map_page(
            VirtualAddress::new(HEAP_AREA_BASE),
            PhysicalAddress::new(0x30_0000),
            PageEntryFlags::KERNEL_DATA,
            &mut tables
        ),
        Err(VmmError::OutOfMemory)
    );
}

#[test]
fn areas_stay_sorted_and_disjoint() {
    let machine = SimulatedMachine::new();
    let mut space = space(&machine);
    let heap = VmArea::new(VmAreaKind::Heap, VirtualAddress::new(HEAP_AREA_BASE), 0x10_0000, PageEntryFlags::KERNEL_DATA);
    let text = VmArea::new(
        VmAreaKind::Text,
        VirtualAddress::new(KERNEL_VMA + 0x10_0000),
        0x4_0000,
        PageEntryFlags::KERNEL_CODE,
    );
    space.add_area(heap).unwrap();
    space.add_area(text).unwrap();

    let kinds: Vec<_> = space.areas().map(VmArea::kind).collect();
    assert_eq!(kinds, [VmAreaKind::Text, VmAreaKind::Heap]);

    let overlapping = VmArea::new(
        VmAreaKind::Stack,
        VirtualAddress::new(HEAP_AREA_BASE + 0xF_F000),
        0x2000,
        PageEntryFlags::KERNEL_DATA,
    );
    assert_eq!(space.add_area(overlapping), Err(VmmError::Overlap { kind: VmAreaKind::Heap }));

    assert_eq!(
        space.get_vm_area(VirtualAddress::new(KERNEL_VMA + 0x13_FFFF)).map(VmArea::kind),
        Some(VmAreaKind::Text)
    );
    assert!(space.get_vm_area(VirtualAddress::new(KERNEL_VMA + 0x14_0000)).is_none());
    assert!(space.is_kernel_address(VirtualAddress::new(KERNEL_VMA)));
    assert!(!space.is_kernel_address(VirtualAddress::new(0x40_0000)));
}

#[test]
fn sync_maps_only_what_is_missing() {
    let machine = SimulatedMachine::new();
    let mut space = space(&machine);
    let mut tables = Frames::new(&machine);

    let area = VmArea::new(VmAreaKind::Heap, VirtualAddress::new(HEAP_AREA_BASE), 0x10_0000, PageEntryFlags::KERNEL_DATA);
    let backing = leaked_range();
    space.add_area(area.with_backing(backing)).unwrap();

    assert_eq!(space.sync_area(VmAreaKind::Heap, &mut tables), Ok(4));
    assert_eq!(space.sync_area(VmAreaKind::Heap, &mut tables), Ok(0));
    assert_eq!(space.sync_area(VmAreaKind::Stack, &mut tables), Ok(0));
    assert_eq!(
        space.translate(VirtualAddress::new(HEAP_AREA_BASE + 0x3000)),
        Some(PhysicalAddress::new(0x40_3000))
    );
    assert_eq!(
        machine.walk(VirtualAddress::new(HEAP_AREA_BASE + 0x3FFF)),
        Some(PhysicalAddress::new(0x40_3FFF))
    );
}

/// A four-page range at 0x40_0000 from a throwaway page pool.
fn leaked_range() -> kernel_alloc::PhysicalRange {
    use kernel_alloc::PhysicalMemoryManager;
    use kernel_alloc::pmm::PageDescriptor;
    use kernel_info::boot::{MemoryMapEntry, MemoryMapTag};

    let entries = [MemoryMapEntry::available(0x40_0000, 0x1_0000)];
    let mut storage: &'static mut [MaybeUninit<PageDescriptor>] =
        Box::leak(vec![MaybeUninit::uninit(); 16].into_boxed_slice());
    let pmm = Box::leak(Box::new(
        PhysicalMemoryManager::initialize(Some(&MemoryMapTag::new(&entries)), &mut storage).unwrap(),
    ));
    pmm.allocate_range(4).unwrap()
}
