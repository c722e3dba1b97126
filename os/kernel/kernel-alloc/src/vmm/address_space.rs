use super::{VmArea, VmAreaKind, VmmError};
use core::ptr::NonNull;
use kernel_info::memory::KERNEL_SPACE_START;
use kernel_memory_addresses::{PageSize, PhysicalAddress, Size1G, Size2M, Size4K, VirtualAddress};
use kernel_vmem::{Mmu, PageEntryFlags, PageTable, PageTableEntry, PageTableLevel};
use log::{debug, error, trace};

/// Capacity of the VM area table.
pub const MAX_VM_AREAS: usize = 16;

/// Supplies zeroed, 4 KiB-aligned page tables once the heap exists.
pub trait PageTableSource {
    /// # Errors
    /// [`VmmError::OutOfMemory`] when no table can be allocated.
    fn allocate_table(&mut self) -> Result<NonNull<PageTable>, VmmError>;
}

/// The kernel's address space: the PML4 root and its VM areas.
///
/// Page tables are reached through the direct map, so every table must live
/// in directly mapped memory. Tables allocated from the heap satisfy this.
pub struct KernelAddressSpace<'m, M: Mmu> {
    mmu: &'m M,
    root: PhysicalAddress,
    areas: [Option<VmArea>; MAX_VM_AREAS],
}

impl<'m, M: Mmu> KernelAddressSpace<'m, M> {
    /// Adopt the PML4 in frame `root` (normally the boot-time table).
    pub const fn new(mmu: &'m M, root: PhysicalAddress) -> Self {
        Self {
            mmu,
            root,
            areas: [const { None }; MAX_VM_AREAS],
        }
    }

    #[inline]
    pub const fn root(&self) -> PhysicalAddress {
        self.root
    }

    /// Register a VM area.
    ///
    /// # Errors
    /// - [`VmmError::Overlap`] when it intersects an existing area.
    /// - [`VmmError::TooManyAreas`] when all slots are taken.
    pub fn add_area(&mut self, area: VmArea) -> Result<(), VmmError> {
        if let Some(existing) = self.areas().find(|a| a.overlaps(&area)) {
            error!(
                "VMM: {:?} area {}..{} overlaps {:?}",
                area.kind(),
                area.start(),
                area.end(),
                existing.kind()
            );
            return Err(VmmError::Overlap { kind: existing.kind() });
        }
        let Some(slot) = self.areas.iter_mut().find(|a| a.is_none()) else {
            return Err(VmmError::TooManyAreas);
        };
        debug!(
            "VMM: {:?} area {} (+{:#x}), {} backed pages",
            area.kind(),
            area.start(),
            area.size(),
            area.backed_pages()
        );
        *slot = Some(area);
        self.areas
            .sort_unstable_by_key(|a| a.as_ref().map_or(u64::MAX, |a| a.start().as_u64()));
        Ok(())
    }

    /// All areas in ascending address order.
    pub fn areas(&self) -> impl Iterator<Item = &VmArea> {
        self.areas.iter().flatten()
    }

    /// The area containing `va`.
    pub fn get_vm_area(&self, va: VirtualAddress) -> Option<&VmArea> {
        self.areas().find(|a| a.contains(va))
    }

    pub fn area(&self, kind: VmAreaKind) -> Option<&VmArea> {
        self.areas().find(|a| a.kind() == kind)
    }

    /// Whether `va` is a canonical higher-half address.
    #[inline]
    pub const fn is_kernel_address(&self, va: VirtualAddress) -> bool {
        va.is_canonical() && va.as_u64() >= KERNEL_SPACE_START
    }

    /// Make the page tables agree with the backing of the `kind` area.
    ///
    /// Pages already mapped to their backing frame (for example by a boot
    /// huge page) are left alone. Returns the number of pages newly mapped.
    ///
    /// # Errors
    /// [`VmmError::AlreadyMapped`] when a page maps some other frame, or any
    /// error of [`map_page`](Self::map_page).
    pub fn sync_area(&mut self, kind: VmAreaKind, tables: &mut impl PageTableSource) -> Result<usize, VmmError> {
        let Some(area) = self.area(kind) else {
            return Ok(0);
        };
        let Some(backing) = area.backing() else {
            return Ok(0);
        };
        let (start, flags, pages, phys) = (area.start(), area.flags(), area.backed_pages(), backing.start());

        let mut mapped = 0;
        for n in 0..pages as u64 {
            let va = start + n * Size4K::SIZE;
            let pa = phys + n * Size4K::SIZE;
            match self.translate(va) {
                Some(existing) if existing == pa => {}
                Some(existing) => {
                    error!("VMM: {kind:?} page {va} maps {existing}, expected {pa}");
                    return Err(VmmError::AlreadyMapped { virt: va, existing });
                }
                None => {
                    self.map_page(va, pa, flags, tables)?;
                    mapped += 1;
                }
            }
        }
        debug!("VMM: synced {kind:?} area, {mapped} of {pages} pages mapped");
        Ok(mapped)
    }

    /// Map the 4 KiB page at `va` to the frame at `pa`, creating missing tables.
    ///
    /// # Errors
    /// - [`VmmError::Unaligned`] unless both addresses are 4 KiB aligned.
    /// - [`VmmError::AlreadyMapped`] when `va` is mapped already.
    /// - [`VmmError::HugePage`] when `va` is covered by a huge page.
    /// - [`VmmError::OutOfMemory`] when a table cannot be allocated.
    pub fn map_page(
        &mut self,
        va: VirtualAddress,
        pa: PhysicalAddress,
        flags: PageEntryFlags,
        tables: &mut impl PageTableSource,
    ) -> Result<(), VmmError> {
        if !va.is_aligned::<Size4K>() {
            return Err(VmmError::Unaligned(va.as_u64()));
        }
        if !pa.is_aligned::<Size4K>() {
            return Err(VmmError::Unaligned(pa.as_u64()));
        }

        let mut table = self.root;
        for level in [PageTableLevel::Pml4, PageTableLevel::Pml3, PageTableLevel::Pml2] {
            let entry = self.entry_mut(table, level, va);
            if !entry.is_present() {
                let fresh = tables.allocate_table()?;
                let fresh_pa = PhysicalAddress::from_virtual(self.mmu.address(fresh.as_ptr()));
                trace!("VMM: new {:?} table at {fresh_pa} for {va}", level.next());
                *self.entry_mut(table, level, va) = PageTableEntry::table(fresh_pa);
                table = fresh_pa;
                continue;
            }
            if entry.is_huge() {
                return Err(VmmError::HugePage { virt: va, level });
            }
            table = entry.physical_address();
        }

        let leaf = self.entry_mut(table, PageTableLevel::Pml1, va);
        if leaf.is_present() {
            return Err(VmmError::AlreadyMapped {
                virt: va,
                existing: leaf.physical_address(),
            });
        }
        *leaf = PageTableEntry::leaf(pa, flags | PageEntryFlags::PRESENT);
        self.mmu.invalidate_page(va);
        trace!("VMM: mapped {va} -> {pa}");
        Ok(())
    }

    /// Map `pages` consecutive pages. Either all pages get mapped or none.
    ///
    /// # Errors
    /// Any error of [`map_page`](Self::map_page); pages mapped before the
    /// failure are unmapped again.
    pub fn map_range(
        &mut self,
        va: VirtualAddress,
        pa: PhysicalAddress,
        pages: usize,
        flags: PageEntryFlags,
        tables: &mut impl PageTableSource,
    ) -> Result<(), VmmError> {
        for n in 0..pages as u64 {
            let offset = n * Size4K::SIZE;
            if let Err(e) = self.map_page(va + offset, pa + offset, flags, tables) {
                for undo in 0..n {
                    // Pages before `n` were mapped by this call.
                    let page = va + undo * Size4K::SIZE;
                    if let Err(undo_err) = self.unmap_page(page) {
                        error!("VMM: rollback of {page} failed: {undo_err}");
                    }
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// Remove the 4 KiB mapping of `va` and return the frame it mapped.
    ///
    /// Page tables emptied by this call are kept.
    ///
    /// # Errors
    /// - [`VmmError::NotPresent`] when `va` is not mapped.
    /// - [`VmmError::HugePage`] when `va` is covered by a huge page.
    pub fn unmap_page(&mut self, va: VirtualAddress) -> Result<PhysicalAddress, VmmError> {
        let mut table = self.root;
        for level in PageTableLevel::ALL {
            let entry = self.entry_mut(table, level, va);
            if !entry.is_present() {
                return Err(VmmError::NotPresent { virt: va, level });
            }
            if level == PageTableLevel::Pml1 {
                let pa = entry.physical_address();
                entry.clear();
                self.mmu.invalidate_page(va);
                trace!("VMM: unmapped {va} (was {pa})");
                return Ok(pa);
            }
            if entry.is_huge() {
                return Err(VmmError::HugePage { virt: va, level });
            }
            table = entry.physical_address();
        }
        Err(VmmError::NotPresent {
            virt: va,
            level: PageTableLevel::Pml1,
        })
    }

    /// Unmap `pages` consecutive pages, stopping at the first failure.
    ///
    /// # Errors
    /// Any error of [`unmap_page`](Self::unmap_page).
    pub fn unmap_range(&mut self, va: VirtualAddress, pages: usize) -> Result<(), VmmError> {
        for n in 0..pages as u64 {
            self.unmap_page(va + n * Size4K::SIZE)?;
        }
        Ok(())
    }

    /// Resolve `va` through 1 GiB, 2 MiB and 4 KiB leaves.
    pub fn translate(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        let mut table = self.root;
        for level in PageTableLevel::ALL {
            // SAFETY: page tables are reachable through the direct map.
            let entry = unsafe { *(*self.mmu.table(table)).entry(level, va) };
            if !entry.is_present() {
                return None;
            }
            let base = entry.physical_address();
            match level {
                PageTableLevel::Pml3 if entry.is_huge() => return Some(base + va.page_offset::<Size1G>()),
                PageTableLevel::Pml2 if entry.is_huge() => return Some(base + va.page_offset::<Size2M>()),
                PageTableLevel::Pml1 => return Some(base + va.page_offset::<Size4K>()),
                _ => table = base,
            }
        }
        None
    }

    #[allow(clippy::mut_from_ref)]
    fn entry_mut(&self, table: PhysicalAddress, level: PageTableLevel, va: VirtualAddress) -> &mut PageTableEntry {
        // SAFETY: page tables are reachable through the direct map and only
        // touched by this address space.
        unsafe { (*self.mmu.table(table)).entry_mut(level, va) }
    }
}
