use crate::pmm::PhysicalRange;
use kernel_memory_addresses::{PageSize, Size4K, VirtualAddress};
use kernel_vmem::PageEntryFlags;

/// What a VM area holds.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum VmAreaKind {
    Text,
    Rodata,
    Data,
    Bss,
    MultibootInfo,
    /// Everything handed out by the eternal allocator, including the page pool and the heap.
    EternalHeap,
    /// Reserved for heap growth; only the first pages are backed.
    Heap,
    Stack,
    TempMapping,
}

/// A named, contiguous virtual range with uniform protection.
///
/// When `backing` is set, page `n` of the area maps page `n` of the backing
/// range. The backing may be shorter than the area.
#[derive(Debug)]
pub struct VmArea {
    kind: VmAreaKind,
    start: VirtualAddress,
    size: u64,
    flags: PageEntryFlags,
    backing: Option<PhysicalRange>,
}

impl VmArea {
    pub const fn new(kind: VmAreaKind, start: VirtualAddress, size: u64, flags: PageEntryFlags) -> Self {
        Self {
            kind,
            start,
            size,
            flags,
            backing: None,
        }
    }

    #[must_use]
    pub fn with_backing(mut self, backing: PhysicalRange) -> Self {
        self.backing = Some(backing);
        self
    }

    #[inline]
    pub const fn kind(&self) -> VmAreaKind {
        self.kind
    }

    #[inline]
    pub const fn start(&self) -> VirtualAddress {
        self.start
    }

    #[inline]
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// Exclusive end. Wraps to zero for the area ending at the top of the address space.
    #[inline]
    pub const fn end(&self) -> VirtualAddress {
        self.start.wrapping_add(self.size)
    }

    /// Inclusive last address.
    #[inline]
    pub const fn last(&self) -> VirtualAddress {
        self.start.wrapping_add(self.size.wrapping_sub(1))
    }

    #[inline]
    pub const fn flags(&self) -> PageEntryFlags {
        self.flags
    }

    #[inline]
    pub const fn backing(&self) -> Option<&PhysicalRange> {
        self.backing.as_ref()
    }

    #[inline]
    pub fn contains(&self, va: VirtualAddress) -> bool {
        self.size != 0 && va >= self.start && va <= self.last()
    }

    pub fn overlaps(&self, other: &Self) -> bool {
        self.size != 0 && other.size != 0 && self.start <= other.last() && other.start <= self.last()
    }

    /// Pages of the area that have a backing frame.
    pub fn backed_pages(&self) -> usize {
        let area_pages = usize::try_from(self.size / Size4K::SIZE).unwrap_or(usize::MAX);
        self.backing.as_ref().map_or(0, |b| b.pages().min(area_pages))
    }
}
