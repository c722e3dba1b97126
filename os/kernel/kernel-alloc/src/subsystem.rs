//! # Memory Subsystem
//!
//! [`MemorySubsystem`] owns every memory manager of the kernel and brings
//! them up in order:
//!
//! 1. [`bootstrap`](MemorySubsystem::bootstrap): adopt the boot page tables;
//!    the eternal allocator starts right after the kernel image.
//! 2. [`initialize_pmm`](MemorySubsystem::initialize_pmm): build the page
//!    pool from the firmware memory map, storing the descriptors in eternal
//!    memory.
//! 3. [`initialize_vmm`](MemorySubsystem::initialize_vmm): carve the heap
//!    from eternal memory, retire the eternal allocator and the bootstrap
//!    mapper, and build the kernel address space with its VM areas.
//!
//! Nothing in here is global; the kernel keeps one instance for its lifetime
//! and tests build as many as they like.

use crate::eternal::{EternalAllocator, EternalError};
use crate::exclusive::ExclusiveCell;
use crate::heap::{HeapError, KernelHeap};
use crate::pmm::{DescriptorStorage, PageDescriptor, PhysicalMemoryManager, PmmError};
use crate::vmm::{BootstrapMapper, KernelAddressSpace, PageTableSource, VmArea, VmAreaKind, VmmError};
use core::mem::MaybeUninit;
use core::ptr::NonNull;
use kernel_info::boot::{KernelLayout, MemoryMapTag};
use kernel_info::memory::{
    DIRECT_MAP_LIMIT, ETERNAL_AREA_SIZE, HEAP_AREA_BASE, HEAP_AREA_INITIAL_PAGES, HEAP_AREA_SIZE, HeapConfig,
    KERNEL_VMA, STACK_AREA_BASE, STACK_SIZE, TEMP_WINDOW_BASE, TEMP_WINDOW_SIZE,
};
use kernel_memory_addresses::{PageSize, PhysicalAddress, Size4K, VirtualAddress};
use kernel_vmem::{Mmu, PageEntryFlags, PageTable};
use log::{debug, error, info};

#[derive(Debug, Clone, Copy, Eq, PartialEq, thiserror::Error)]
pub enum MemoryError {
    #[error(transparent)]
    Pmm(#[from] PmmError),
    #[error(transparent)]
    Eternal(#[from] EternalError),
    #[error(transparent)]
    Vmm(#[from] VmmError),
    #[error(transparent)]
    Heap(#[from] HeapError),
    #[error("memory subsystem: {0}")]
    Stage(&'static str),
}

/// The page tables set up by the boot code.
#[derive(Debug, Clone, Copy)]
pub struct BootTables {
    /// The active PML4.
    pub pml4: VirtualAddress,
    /// The PML1 table behind the temporary mapping window.
    pub temp_pml1: VirtualAddress,
    /// End of the direct map already present in the boot tables.
    pub mapped_end: VirtualAddress,
}

pub struct MemorySubsystem<'m, M: Mmu> {
    mmu: &'m M,
    layout: KernelLayout,
    root: PhysicalAddress,
    bootstrap: BootstrapMapper<'m, M>,
    eternal: EternalAllocator,
    heap: &'m ExclusiveCell<KernelHeap>,
    heap_config: HeapConfig,
    pmm: Option<PhysicalMemoryManager<'m>>,
    address_space: Option<KernelAddressSpace<'m, M>>,
    vmm_failed: bool,
}

impl<'m, M: Mmu> MemorySubsystem<'m, M> {
    /// Adopt the boot page tables. `heap` is the (uninitialized) kernel heap
    /// that [`initialize_vmm`](Self::initialize_vmm) will fill per `heap_config`.
    pub fn bootstrap(
        mmu: &'m M,
        tables: BootTables,
        layout: &KernelLayout,
        heap: &'m ExclusiveCell<KernelHeap>,
        heap_config: HeapConfig,
    ) -> Self {
        let start = layout.image_end.align_up::<Size4K>();
        let limit = VirtualAddress::new(KERNEL_VMA + DIRECT_MAP_LIMIT).min(start + ETERNAL_AREA_SIZE);
        info!(
            "Memory: kernel image {}..{}, eternal window {start}..{limit}",
            layout.image_start(),
            layout.image_end
        );
        Self {
            mmu,
            layout: *layout,
            root: PhysicalAddress::from_virtual(tables.pml4),
            bootstrap: BootstrapMapper::new(mmu, tables.pml4, tables.temp_pml1),
            eternal: EternalAllocator::new(start, limit, tables.mapped_end),
            heap,
            heap_config,
            pmm: None,
            address_space: None,
            vmm_failed: false,
        }
    }

    /// Build the physical page pool from the firmware memory map.
    ///
    /// # Errors
    /// - [`PmmError::InvalidParameter`] for a missing or malformed tag.
    /// - [`PmmError::StorageExhausted`] when eternal memory cannot hold the pool.
    /// - [`MemoryError::Stage`] when called twice.
    pub fn initialize_pmm(&mut self, tag: Option<&MemoryMapTag<'_>>) -> Result<&PhysicalMemoryManager<'m>, MemoryError> {
        if self.pmm.is_some() {
            return Err(MemoryError::Stage("physical memory manager already initialized"));
        }
        let mut storage = EternalStorage {
            mmu: self.mmu,
            eternal: &mut self.eternal,
            bootstrap: &mut self.bootstrap,
        };
        let pmm = PhysicalMemoryManager::initialize(tag, &mut storage)?;
        Ok(self.pmm.insert(pmm))
    }

    /// Bring up the heap and the kernel address space.
    ///
    /// `multiboot` is the physical location and size of the boot information
    /// blob, which becomes a VM area of its own.
    ///
    /// # Errors
    /// - [`MemoryError::Stage`] before [`initialize_pmm`](Self::initialize_pmm),
    ///   when called twice, or when the kernel sections are not 4 KiB aligned.
    ///   Nothing has changed when these are returned.
    /// - Eternal, heap, PMM or VMM errors from the individual steps. These are
    ///   terminal: the eternal allocator and the bootstrap mapper may already
    ///   be retired, and every later call returns [`MemoryError::Stage`].
    pub fn initialize_vmm(&mut self, multiboot: Option<(PhysicalAddress, u64)>) -> Result<(), MemoryError> {
        if self.vmm_failed {
            return Err(MemoryError::Stage("virtual memory manager initialization failed"));
        }
        if self.address_space.is_some() {
            return Err(MemoryError::Stage("virtual memory manager already initialized"));
        }
        if self.pmm.is_none() {
            return Err(MemoryError::Stage("physical memory manager not initialized"));
        }
        if !self.layout.is_page_aligned() {
            return Err(MemoryError::Stage("kernel sections must be 4 KiB aligned"));
        }

        let result = self.build_address_space(multiboot);
        if let Err(e) = &result {
            error!("VMM: initialization failed: {e}");
            self.vmm_failed = true;
        }
        result
    }

    fn build_address_space(&mut self, multiboot: Option<(PhysicalAddress, u64)>) -> Result<(), MemoryError> {
        let Some(pmm) = self.pmm.as_mut() else {
            return Err(MemoryError::Stage("physical memory manager not initialized"));
        };

        let heap_bytes = self.heap_config.region_bytes();
        let heap_va = self
            .eternal
            .allocate_aligned(heap_bytes as u64, Size4K::SIZE, &mut self.bootstrap)?;
        let region = NonNull::new(self.mmu.pointer::<u8>(heap_va)).ok_or(MemoryError::Stage("heap region not addressable"))?;
        let config = self.heap_config;
        self.heap.with(|heap| {
            if heap.is_initialized() {
                return Err(MemoryError::Stage("kernel heap already initialized"));
            }
            // SAFETY: the region was just taken from eternal memory and is mapped.
            unsafe { heap.initialize(region, heap_bytes, &config) }.map_err(MemoryError::from)
        })?;

        self.eternal.disable();
        self.bootstrap.finish();

        let mut space = KernelAddressSpace::new(self.mmu, self.root);
        let sections = [
            (VmAreaKind::Text, self.layout.text, PageEntryFlags::KERNEL_CODE),
            (VmAreaKind::Rodata, self.layout.rodata, PageEntryFlags::KERNEL_RODATA),
            (VmAreaKind::Data, self.layout.data, PageEntryFlags::KERNEL_DATA),
            (VmAreaKind::Bss, self.layout.bss, PageEntryFlags::KERNEL_DATA),
        ];
        for (kind, section, flags) in sections {
            if section.is_empty() {
                continue;
            }
            claim_area(&mut space, pmm, kind, section.start, section.len(), flags)?;
        }

        if let Some((pa, len)) = multiboot.filter(|&(_, len)| len > 0) {
            let start = pa.align_down::<Size4K>();
            let end = (pa + len).align_up::<Size4K>();
            let va = VirtualAddress::from_physical(start);
            claim_area(&mut space, pmm, VmAreaKind::MultibootInfo, va, end - start, PageEntryFlags::KERNEL_RODATA)?;
        }

        let eternal_start = self.eternal.start();
        let eternal_end = self.eternal.next().align_up::<Size4K>();
        if eternal_end > eternal_start {
            claim_area(
                &mut space,
                pmm,
                VmAreaKind::EternalHeap,
                eternal_start,
                eternal_end - eternal_start,
                PageEntryFlags::KERNEL_DATA,
            )?;
        }

        let heap_backing = pmm.allocate_range(HEAP_AREA_INITIAL_PAGES)?;
        space.add_area(
            VmArea::new(
                VmAreaKind::Heap,
                VirtualAddress::new(HEAP_AREA_BASE),
                HEAP_AREA_SIZE,
                PageEntryFlags::KERNEL_DATA,
            )
            .with_backing(heap_backing),
        )?;

        let stack_pages = (STACK_SIZE / Size4K::SIZE) as usize;
        let stack_backing = pmm.allocate_range(stack_pages)?;
        space.add_area(
            VmArea::new(
                VmAreaKind::Stack,
                VirtualAddress::new(STACK_AREA_BASE),
                STACK_SIZE,
                PageEntryFlags::KERNEL_DATA,
            )
            .with_backing(stack_backing),
        )?;

        space.add_area(VmArea::new(
            VmAreaKind::TempMapping,
            VirtualAddress::new(TEMP_WINDOW_BASE),
            TEMP_WINDOW_SIZE,
            PageEntryFlags::KERNEL_DATA,
        ))?;

        let mut tables = HeapTables(self.heap);
        let mut mapped = 0;
        for kind in [
            VmAreaKind::Text,
            VmAreaKind::Rodata,
            VmAreaKind::Data,
            VmAreaKind::Bss,
            VmAreaKind::MultibootInfo,
            VmAreaKind::EternalHeap,
            VmAreaKind::Heap,
            VmAreaKind::Stack,
        ] {
            mapped += space.sync_area(kind, &mut tables)?;
        }

        let stats = pmm.get_memory_stats();
        info!(
            "VMM: kernel address space ready, {} areas, {mapped} pages mapped, {} of {} pages in use",
            space.areas().count(),
            stats.used_pages,
            stats.total_pages
        );
        self.address_space = Some(space);
        Ok(())
    }

    /// `kmalloc_eternal`: bootstrap-only allocation that is never freed.
    ///
    /// # Errors
    /// [`EternalError::Disabled`] once the heap is up, or any other
    /// [`EternalError`].
    pub fn allocate_eternal(&mut self, size: usize) -> Result<NonNull<u8>, MemoryError> {
        let va = self.eternal.allocate(size as u64, &mut self.bootstrap)?;
        self.eternal_pointer(va)
    }

    /// `kmalloc_eternal_aligned`.
    ///
    /// # Errors
    /// As [`allocate_eternal`](Self::allocate_eternal).
    pub fn allocate_eternal_aligned(&mut self, size: usize, align: usize) -> Result<NonNull<u8>, MemoryError> {
        let va = self
            .eternal
            .allocate_aligned(size as u64, align as u64, &mut self.bootstrap)?;
        self.eternal_pointer(va)
    }

    /// `disable_kmalloc_eternal`: reject all further eternal allocations.
    pub fn disable_eternal(&mut self) {
        self.eternal.disable();
    }

    /// Map `pages` pages of kernel memory after initialization.
    ///
    /// # Errors
    /// [`MemoryError::Stage`] before [`initialize_vmm`](Self::initialize_vmm),
    /// otherwise as [`KernelAddressSpace::map_range`].
    pub fn map_range(
        &mut self,
        va: VirtualAddress,
        pa: PhysicalAddress,
        pages: usize,
        flags: PageEntryFlags,
    ) -> Result<(), MemoryError> {
        let space = self
            .address_space
            .as_mut()
            .ok_or(MemoryError::Stage("virtual memory manager not initialized"))?;
        space.map_range(va, pa, pages, flags, &mut HeapTables(self.heap))?;
        Ok(())
    }

    /// # Errors
    /// [`MemoryError::Stage`] before [`initialize_vmm`](Self::initialize_vmm),
    /// otherwise as [`KernelAddressSpace::unmap_range`].
    pub fn unmap_range(&mut self, va: VirtualAddress, pages: usize) -> Result<(), MemoryError> {
        let space = self
            .address_space
            .as_mut()
            .ok_or(MemoryError::Stage("virtual memory manager not initialized"))?;
        space.unmap_range(va, pages)?;
        Ok(())
    }

    /// Whether the heap and the kernel address space are up.
    #[inline]
    pub const fn is_initialized(&self) -> bool {
        self.address_space.is_some()
    }

    #[inline]
    pub const fn layout(&self) -> &KernelLayout {
        &self.layout
    }

    #[inline]
    pub const fn pmm(&self) -> Option<&PhysicalMemoryManager<'m>> {
        self.pmm.as_ref()
    }

    /// The page pool, once nothing in it can still be handed out by accident.
    ///
    /// Until [`initialize_vmm`](Self::initialize_vmm) has claimed the kernel
    /// image and the eternal area those frames look free, so this returns
    /// `None` before then.
    pub fn pmm_mut(&mut self) -> Option<&mut PhysicalMemoryManager<'m>> {
        if self.is_initialized() { self.pmm.as_mut() } else { None }
    }

    #[inline]
    pub const fn heap(&self) -> &'m ExclusiveCell<KernelHeap> {
        self.heap
    }

    #[inline]
    pub const fn address_space(&self) -> Option<&KernelAddressSpace<'m, M>> {
        self.address_space.as_ref()
    }

    pub fn address_space_mut(&mut self) -> Option<&mut KernelAddressSpace<'m, M>> {
        self.address_space.as_mut()
    }

    #[inline]
    pub const fn eternal(&self) -> &EternalAllocator {
        &self.eternal
    }

    pub fn bootstrap_mapper(&mut self) -> &mut BootstrapMapper<'m, M> {
        &mut self.bootstrap
    }

    fn eternal_pointer(&self, va: VirtualAddress) -> Result<NonNull<u8>, MemoryError> {
        NonNull::new(self.mmu.pointer(va)).ok_or(MemoryError::Stage("eternal memory not addressable"))
    }
}

/// Claim the frames behind `[start, start + bytes)` and register them as a VM area.
fn claim_area<M: Mmu>(
    space: &mut KernelAddressSpace<'_, M>,
    pmm: &mut PhysicalMemoryManager<'_>,
    kind: VmAreaKind,
    start: VirtualAddress,
    bytes: u64,
    flags: PageEntryFlags,
) -> Result<(), MemoryError> {
    let pages = usize::try_from(bytes / Size4K::SIZE).map_err(|_| MemoryError::Stage("VM area too large"))?;
    let backing = pmm.allocate_range_at(PhysicalAddress::from_virtual(start), pages)?;
    debug!("VMM: {kind:?} claims {pages} pages at {}", backing.start());
    space.add_area(VmArea::new(kind, start, bytes, flags).with_backing(backing))?;
    Ok(())
}

/// Descriptor storage carved from eternal memory.
struct EternalStorage<'s, 'm, M: Mmu> {
    mmu: &'m M,
    eternal: &'s mut EternalAllocator,
    bootstrap: &'s mut BootstrapMapper<'m, M>,
}

impl<'m, M: Mmu> DescriptorStorage<'m> for EternalStorage<'_, 'm, M> {
    fn reserve_descriptors(&mut self, count: usize) -> Result<&'m mut [MaybeUninit<PageDescriptor>], PmmError> {
        let bytes = count
            .checked_mul(size_of::<PageDescriptor>())
            .ok_or(PmmError::StorageExhausted { bytes: usize::MAX })?;
        let va = self
            .eternal
            .allocate_aligned(bytes as u64, align_of::<PageDescriptor>() as u64, &mut *self.bootstrap)
            .map_err(|e| {
                error!("PMM: no eternal memory for the page pool: {e}");
                PmmError::StorageExhausted { bytes }
            })?;
        let ptr = self.mmu.pointer::<MaybeUninit<PageDescriptor>>(va);
        debug!("PMM: {count} descriptors at {va}");
        // SAFETY: eternal memory is mapped, never freed and handed out once.
        Ok(unsafe { core::slice::from_raw_parts_mut(ptr, count) })
    }
}

/// Page tables from the kernel heap's 4096-byte class.
struct HeapTables<'h>(&'h ExclusiveCell<KernelHeap>);

impl PageTableSource for HeapTables<'_> {
    fn allocate_table(&mut self) -> Result<NonNull<PageTable>, VmmError> {
        self.0.with(PageTableSource::allocate_table)
    }
}
