use super::VmmError;
use kernel_info::memory::{TEMP_SLOT_FIRST_INDEX, TEMP_WINDOW_BASE};
use kernel_memory_addresses::{PageSize, PhysicalAddress, Size1G, Size2M, Size4K, VirtualAddress};
use kernel_vmem::{Mmu, PageEntryFlags, PageTable, PageTableEntry, PageTableLevel};
use log::{error, trace};

/// Virtual address of the temp-mapping slot reserved for `level`.
#[inline]
#[must_use]
pub const fn temp_slot_address(level: PageTableLevel) -> VirtualAddress {
    VirtualAddress::new(TEMP_WINDOW_BASE + ((TEMP_SLOT_FIRST_INDEX + level.ordinal()) as u64) * Size4K::SIZE)
}

/// Maps 2 MiB pages into the boot page tables before the heap exists.
///
/// The boot tables provide the PML4, the PML3/PML2 tables covering the
/// direct map, and a PML1 table behind the temporary mapping window. This
/// mapper never allocates tables: a missing intermediate level is an error.
pub struct BootstrapMapper<'m, M: Mmu> {
    mmu: &'m M,
    pml4: VirtualAddress,
    temp_table: VirtualAddress,
    finished: bool,
}

impl<'m, M: Mmu> BootstrapMapper<'m, M> {
    /// `pml4` and `temp_table` are the (already mapped) virtual addresses of
    /// the boot PML4 and of the PML1 table backing the temp window.
    pub const fn new(mmu: &'m M, pml4: VirtualAddress, temp_table: VirtualAddress) -> Self {
        Self {
            mmu,
            pml4,
            temp_table,
            finished: false,
        }
    }

    #[inline]
    pub const fn is_finished(&self) -> bool {
        self.finished
    }

    /// Hand over to the kernel address space. Further bootstrap mappings fail.
    pub fn finish(&mut self) {
        self.finished = true;
    }

    /// Show the frame containing `pa` in the temp slot of `level` and return
    /// the virtual address of `pa` inside that slot.
    ///
    /// Each level has exactly one slot; mapping again at the same level
    /// replaces the previous view.
    pub fn temp_map(&mut self, pa: PhysicalAddress, level: PageTableLevel) -> VirtualAddress {
        let slot = temp_slot_address(level);
        let table = self.mmu.pointer::<PageTable>(self.temp_table);
        // SAFETY: the temp PML1 table is part of the mapped boot image.
        let entry = unsafe { (*table).entry_mut(PageTableLevel::Pml1, slot) };
        *entry = PageTableEntry::leaf(pa.align_down::<Size4K>(), PageEntryFlags::TABLE);
        self.mmu.invalidate_page(slot);
        slot + pa.page_offset::<Size4K>()
    }

    /// Map the 2 MiB page at `va` to the frame at `pa`.
    ///
    /// Re-mapping a page to the frame it already maps is a no-op.
    ///
    /// # Errors
    /// - [`VmmError::BootstrapFinished`] after [`finish`](Self::finish).
    /// - [`VmmError::Unaligned`] unless both addresses are 2 MiB aligned.
    /// - [`VmmError::NotPresent`] when the PML4 or PML3 entry is missing.
    /// - [`VmmError::AlreadyMapped`] when the slot maps something else.
    pub fn kernel_bootstrap_map(&mut self, pa: PhysicalAddress, va: VirtualAddress) -> Result<(), VmmError> {
        if self.finished {
            error!("VMM: bootstrap map of {va} after bootstrap finished");
            return Err(VmmError::BootstrapFinished);
        }
        if !va.is_aligned::<Size2M>() {
            return Err(VmmError::Unaligned(va.as_u64()));
        }
        if !pa.is_aligned::<Size2M>() {
            return Err(VmmError::Unaligned(pa.as_u64()));
        }

        let pml3 = self.next_table(self.pml4, PageTableLevel::Pml4, va)?;
        // SAFETY: the PML3 view sits in its temp slot, mapped above.
        let e3 = unsafe { *(*self.mmu.pointer::<PageTable>(pml3)).entry(PageTableLevel::Pml3, va) };
        if !e3.is_present() {
            error!("VMM: no PML2 table for {va}");
            return Err(VmmError::NotPresent {
                virt: va,
                level: PageTableLevel::Pml3,
            });
        }
        if e3.is_huge() {
            let existing = e3.physical_address() + va.page_offset::<Size1G>();
            return if existing == pa {
                Ok(())
            } else {
                Err(VmmError::AlreadyMapped { virt: va, existing })
            };
        }

        let pml2 = self.temp_map(e3.physical_address(), PageTableLevel::Pml2);
        // SAFETY: the PML2 view sits in its temp slot.
        let entry = unsafe { (*self.mmu.pointer::<PageTable>(pml2)).entry_mut(PageTableLevel::Pml2, va) };
        if entry.is_present() {
            let existing = entry.physical_address();
            if entry.is_huge() && existing == pa {
                trace!("VMM: {va} already maps {pa}");
                return Ok(());
            }
            error!("VMM: bootstrap map {va} -> {pa} conflicts with {existing}");
            return Err(VmmError::AlreadyMapped { virt: va, existing });
        }

        *entry = PageTableEntry::huge(pa, PageEntryFlags::TABLE);
        self.mmu.invalidate_page(va);
        trace!("VMM: bootstrap mapped {va} -> {pa} (2M)");
        Ok(())
    }

    /// Resolve `va` through the boot tables.
    pub fn translate(&mut self, va: VirtualAddress) -> Option<PhysicalAddress> {
        let mut table = self.pml4;
        let mut level = PageTableLevel::Pml4;
        loop {
            // SAFETY: `table` is either the boot PML4 or a temp slot view.
            let entry = unsafe { *(*self.mmu.pointer::<PageTable>(table)).entry(level, va) };
            if !entry.is_present() {
                return None;
            }
            let base = entry.physical_address();
            match level {
                PageTableLevel::Pml3 if entry.is_huge() => return Some(base + va.page_offset::<Size1G>()),
                PageTableLevel::Pml2 if entry.is_huge() => return Some(base + va.page_offset::<Size2M>()),
                PageTableLevel::Pml1 => return Some(base + va.page_offset::<Size4K>()),
                _ => {}
            }
            level = level.next()?;
            table = self.temp_map(base, level);
        }
    }

    /// Follow the entry for `va` in `table` (at `level`) and map the next
    /// table into its temp slot.
    fn next_table(
        &mut self,
        table: VirtualAddress,
        level: PageTableLevel,
        va: VirtualAddress,
    ) -> Result<VirtualAddress, VmmError> {
        // SAFETY: `table` is the mapped boot PML4.
        let entry = unsafe { *(*self.mmu.pointer::<PageTable>(table)).entry(level, va) };
        if !entry.is_present() {
            error!("VMM: no {level:?} entry for {va}");
            return Err(VmmError::NotPresent { virt: va, level });
        }
        let Some(next) = level.next() else {
            return Err(VmmError::NotPresent { virt: va, level });
        };
        Ok(self.temp_map(entry.physical_address(), next))
    }
}

impl<M: Mmu> crate::eternal::BootstrapMap for BootstrapMapper<'_, M> {
    fn bootstrap_map(&mut self, pa: PhysicalAddress, va: VirtualAddress) -> Result<(), VmmError> {
        self.kernel_bootstrap_map(pa, va)
    }
}
