use crate::PageTableEntry;
use kernel_memory_addresses::VirtualAddress;

/// Entries per table.
pub const ENTRY_COUNT: usize = 512;

/// One of the four paging levels, from root to leaf.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum PageTableLevel {
    Pml4,
    Pml3,
    Pml2,
    Pml1,
}

impl PageTableLevel {
    pub const ALL: [Self; 4] = [Self::Pml4, Self::Pml3, Self::Pml2, Self::Pml1];

    /// Bit position of this level's index inside a virtual address.
    #[inline]
    #[must_use]
    pub const fn shift(self) -> u32 {
        match self {
            Self::Pml4 => 39,
            Self::Pml3 => 30,
            Self::Pml2 => 21,
            Self::Pml1 => 12,
        }
    }

    /// The 9-bit index of `va` at this level. Always in `0..512`.
    #[inline]
    #[must_use]
    pub const fn index(self, va: VirtualAddress) -> usize {
        va.table_index(self.shift())
    }

    /// Bytes covered by one entry at this level.
    #[inline]
    #[must_use]
    pub const fn entry_span(self) -> u64 {
        1 << self.shift()
    }

    /// The level below, or `None` for [`PageTableLevel::Pml1`].
    #[inline]
    #[must_use]
    pub const fn next(self) -> Option<Self> {
        match self {
            Self::Pml4 => Some(Self::Pml3),
            Self::Pml3 => Some(Self::Pml2),
            Self::Pml2 => Some(Self::Pml1),
            Self::Pml1 => None,
        }
    }

    /// Position from the root (`Pml4` = 0).
    #[inline]
    #[must_use]
    pub const fn ordinal(self) -> usize {
        match self {
            Self::Pml4 => 0,
            Self::Pml3 => 1,
            Self::Pml2 => 2,
            Self::Pml1 => 3,
        }
    }

    /// Whether an entry at this level may be a huge leaf.
    #[inline]
    #[must_use]
    pub const fn allows_huge(self) -> bool {
        matches!(self, Self::Pml3 | Self::Pml2)
    }
}

/// One 4 KiB page-table page of 512 entries.
#[repr(C, align(4096))]
#[derive(Clone)]
pub struct PageTable {
    entries: [PageTableEntry; ENTRY_COUNT],
}

const _: () = {
    assert!(size_of::<PageTable>() == 4096);
    assert!(align_of::<PageTable>() == 4096);
};

impl PageTable {
    #[inline]
    #[must_use]
    pub const fn zeroed() -> Self {
        Self {
            entries: [PageTableEntry::new(); ENTRY_COUNT],
        }
    }

    /// The entry that translates `va` when this table sits at `level`.
    #[inline]
    #[must_use]
    pub const fn entry(&self, level: PageTableLevel, va: VirtualAddress) -> &PageTableEntry {
        &self.entries[level.index(va)]
    }

    #[inline]
    pub const fn entry_mut(&mut self, level: PageTableLevel, va: VirtualAddress) -> &mut PageTableEntry {
        &mut self.entries[level.index(va)]
    }

    #[inline]
    #[must_use]
    pub const fn get(&self, index: usize) -> &PageTableEntry {
        &self.entries[index]
    }

    #[inline]
    pub const fn get_mut(&mut self, index: usize) -> &mut PageTableEntry {
        &mut self.entries[index]
    }

    /// Clear every entry.
    pub fn zero(&mut self) {
        for e in &mut self.entries {
            e.clear();
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(PageTableEntry::is_unused)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PageTableEntry> {
        self.entries.iter()
    }
}

impl Default for PageTable {
    fn default() -> Self {
        Self::zeroed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PageEntryFlags;
    use kernel_memory_addresses::PhysicalAddress;

    #[test]
    fn entry_uses_level_index() {
        let va = VirtualAddress::new(0xFFFF_FFFF_8020_3000);
        let mut t = PageTable::zeroed();
        *t.entry_mut(PageTableLevel::Pml2, va) =
            PageTableEntry::huge(PhysicalAddress::new(0x20_0000), PageEntryFlags::TABLE);
        assert!(t.get(1).is_huge());
        assert!(t.entry(PageTableLevel::Pml2, va).is_present());
        assert!(!t.entry(PageTableLevel::Pml1, va).is_present());
        assert_eq!(PageTableLevel::Pml1.index(va), 3);
        assert_eq!(PageTableLevel::Pml4.index(va), 511);
        t.zero();
        assert!(t.is_empty());
    }

    #[test]
    fn levels_walk_root_to_leaf() {
        let mut level = Some(PageTableLevel::Pml4);
        let mut seen = 0;
        while let Some(l) = level {
            assert_eq!(l.ordinal(), seen);
            seen += 1;
            level = l.next();
        }
        assert_eq!(seen, 4);
        assert_eq!(PageTableLevel::Pml2.entry_span(), 2 * 1024 * 1024);
        assert!(PageTableLevel::Pml3.allows_huge());
        assert!(!PageTableLevel::Pml1.allows_huge());
    }
}
