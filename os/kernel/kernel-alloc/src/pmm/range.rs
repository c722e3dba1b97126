use kernel_memory_addresses::{PageSize, PhysicalAddress, PhysicalPage, Size4K};

/// Ownership of one physical frame handed out by
/// [`PhysicalMemoryManager::allocate_page`](super::PhysicalMemoryManager::allocate_page).
///
/// Release it with [`return_page`](super::PhysicalMemoryManager::return_page).
#[must_use = "a physical frame leaks unless returned to the memory manager"]
#[derive(Debug, Eq, PartialEq)]
pub struct PhysicalFrame {
    pub(super) page: PhysicalPage<Size4K>,
    pub(super) index: usize,
}

impl PhysicalFrame {
    #[inline]
    pub const fn page(&self) -> PhysicalPage<Size4K> {
        self.page
    }

    #[inline]
    pub const fn address(&self) -> PhysicalAddress {
        self.page.base()
    }

    /// A single-page range holding the same reference.
    #[inline]
    pub const fn into_range(self) -> PhysicalRange {
        PhysicalRange {
            start: self.page,
            pages: 1,
            index: self.index,
        }
    }
}

/// Ownership of `pages` physically contiguous frames.
///
/// While a range is held every frame in it has a reference count of at least
/// one and is off the free list. Ranges are moved, never copied; a second
/// reference comes from
/// [`share_range`](super::PhysicalMemoryManager::share_range).
#[must_use = "a physical range leaks unless returned to the memory manager"]
#[derive(Debug, Eq, PartialEq)]
pub struct PhysicalRange {
    pub(super) start: PhysicalPage<Size4K>,
    pub(super) pages: usize,
    pub(super) index: usize,
}

impl PhysicalRange {
    #[inline]
    pub const fn start(&self) -> PhysicalAddress {
        self.start.base()
    }

    /// Exclusive end address.
    #[inline]
    pub const fn end(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.start.base().as_u64() + self.len_bytes())
    }

    #[inline]
    pub const fn pages(&self) -> usize {
        self.pages
    }

    #[inline]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn len_bytes(&self) -> u64 {
        self.pages as u64 * Size4K::SIZE
    }

    /// Physical address of page `n` of the range.
    #[inline]
    pub fn page(&self, n: usize) -> Option<PhysicalPage<Size4K>> {
        (n < self.pages).then(|| self.start.forward(n as u64))
    }

    #[inline]
    pub fn contains(&self, pa: PhysicalAddress) -> bool {
        pa >= self.start() && pa < self.end()
    }
}
