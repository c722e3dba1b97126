//! # Physical Memory Manager
//!
//! A pool of [`PageDescriptor`]s, one per 4 KiB frame of available RAM,
//! built from the firmware memory map.
//!
//! Free descriptors are threaded on an index-based doubly linked list, so a
//! frame can leave the free list in O(1) no matter where it sits. A frame is
//! on the free list exactly when its reference count is zero.
//!
//! ```text
//!  descriptors (sorted by address, stored in eternal memory)
//! +------+------+------+------+------+------+
//! | 0x1M | +4K  | +8K  | +12K | ...  | 1G-4K|
//! | rc=0 | rc=1 | rc=0 | rc=2 |      | rc=0 |
//! +------+------+------+------+------+------+
//!    ^  prev/next   ^                   ^
//!    +--------------+---- free list ----+
//! ```
//!
//! Allocation hands out move-only tokens ([`PhysicalFrame`], [`PhysicalRange`]).
//! They are given back explicitly with [`PhysicalMemoryManager::return_page`]
//! and [`PhysicalMemoryManager::return_range`].

mod range;

pub use range::{PhysicalFrame, PhysicalRange};

use core::mem::MaybeUninit;
use kernel_info::boot::MemoryMapTag;
use kernel_info::memory::DIRECT_MAP_LIMIT;
use kernel_memory_addresses::{PageSize, PhysicalAddress, PhysicalPage, Size4K, align_down, align_up};
use log::{debug, error, info, trace, warn};

/// Free-list terminator.
const NONE: u32 = u32::MAX;

#[derive(Debug, Clone, Copy, Eq, PartialEq, thiserror::Error)]
pub enum PmmError {
    #[error("invalid parameter: {0}")]
    InvalidParameter(&'static str),
    #[error("out of physical memory")]
    OutOfMemory,
    #[error("no contiguous run of {pages} free pages")]
    NoContiguousRange { pages: usize },
    #[error("physical address {0} is not managed")]
    NotManaged(PhysicalAddress),
    #[error("{pages} pages at {address} are not a managed contiguous range")]
    RangeNotManaged { address: PhysicalAddress, pages: usize },
    #[error("physical page {0} is not allocated")]
    NotAllocated(PhysicalAddress),
    #[error("no storage for {bytes} bytes of page descriptors")]
    StorageExhausted { bytes: usize },
}

/// Bookkeeping for one physical frame.
#[derive(Debug, Clone, Copy)]
pub struct PageDescriptor {
    address: PhysicalPage<Size4K>,
    ref_count: u32,
    prev: u32,
    next: u32,
}

impl PageDescriptor {
    #[inline]
    #[must_use]
    pub const fn address(&self) -> PhysicalAddress {
        self.address.base()
    }

    #[inline]
    #[must_use]
    pub const fn ref_count(&self) -> u32 {
        self.ref_count
    }

    #[inline]
    #[must_use]
    pub const fn is_free(&self) -> bool {
        self.ref_count == 0
    }
}

/// Where the descriptor array lives.
pub trait DescriptorStorage<'a> {
    /// Hand out uninitialized room for `count` descriptors that lives for `'a`.
    ///
    /// # Errors
    /// [`PmmError::StorageExhausted`] when the storage cannot hold `count` descriptors.
    fn reserve_descriptors(&mut self, count: usize) -> Result<&'a mut [MaybeUninit<PageDescriptor>], PmmError>;
}

/// A caller-provided buffer; every reservation is carved off its front.
impl<'a> DescriptorStorage<'a> for &'a mut [MaybeUninit<PageDescriptor>] {
    fn reserve_descriptors(&mut self, count: usize) -> Result<&'a mut [MaybeUninit<PageDescriptor>], PmmError> {
        if count > self.len() {
            return Err(PmmError::StorageExhausted {
                bytes: count * size_of::<PageDescriptor>(),
            });
        }
        let buffer = core::mem::take(self);
        let (head, tail) = buffer.split_at_mut(count);
        *self = tail;
        Ok(head)
    }
}

/// Pool size and usage, for diagnostics.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct MemoryStats {
    pub total_pages: usize,
    pub used_pages: usize,
}

impl MemoryStats {
    #[must_use]
    pub const fn free_pages(&self) -> usize {
        self.total_pages - self.used_pages
    }

    #[must_use]
    pub const fn total_bytes(&self) -> u64 {
        self.total_pages as u64 * Size4K::SIZE
    }

    #[must_use]
    pub const fn used_bytes(&self) -> u64 {
        self.used_pages as u64 * Size4K::SIZE
    }
}

pub struct PhysicalMemoryManager<'a> {
    pages: &'a mut [PageDescriptor],
    free_head: u32,
    free_len: usize,
}

impl<'a> PhysicalMemoryManager<'a> {
    /// Build the page pool from the available regions of `tag`.
    ///
    /// Regions are consumed in ascending address order, clipped to whole
    /// frames below [`DIRECT_MAP_LIMIT`]. Frames covered by more than one
    /// region are described once. All frames start out free.
    ///
    /// # Errors
    /// - [`PmmError::InvalidParameter`] for a missing or malformed tag, or a
    ///   map without any usable frame.
    /// - [`PmmError::StorageExhausted`] when `storage` cannot hold the pool.
    pub fn initialize(
        tag: Option<&MemoryMapTag<'_>>,
        storage: &mut impl DescriptorStorage<'a>,
    ) -> Result<Self, PmmError> {
        let Some(tag) = tag else {
            error!("PMM: no memory map tag");
            return Err(PmmError::InvalidParameter("missing memory map tag"));
        };
        if !tag.is_well_formed() {
            error!(
                "PMM: malformed memory map tag (type {}, entry size {})",
                tag.tag_type, tag.entry_size
            );
            return Err(PmmError::InvalidParameter("malformed memory map tag"));
        }

        for e in tag.available().filter(|e| e.end() > DIRECT_MAP_LIMIT) {
            warn!(
                "PMM: region {:#x}..{:#x} clipped at the direct map limit {DIRECT_MAP_LIMIT:#x}",
                e.base_addr,
                e.end()
            );
        }

        let mut total = 0usize;
        for (start, end) in Regions::new(tag) {
            debug!("PMM: region {start:#x}..{end:#x} ({} pages)", (end - start) / Size4K::SIZE);
            total += frames(start, end);
        }
        if total == 0 {
            error!("PMM: memory map contains no usable frames");
            return Err(PmmError::InvalidParameter("no available memory"));
        }
        if total >= NONE as usize {
            return Err(PmmError::InvalidParameter("memory map too large"));
        }

        let slots = storage.reserve_descriptors(total)?;
        let mut written = 0;
        for (start, end) in Regions::new(tag) {
            let mut pa = start;
            while pa < end {
                slots[written].write(PageDescriptor {
                    address: PhysicalPage::containing(PhysicalAddress::new(pa)),
                    ref_count: 0,
                    prev: NONE,
                    next: NONE,
                });
                written += 1;
                pa += Size4K::SIZE;
            }
        }
        debug_assert_eq!(written, total);

        // SAFETY: all `total` slots were written above.
        let pages = unsafe { &mut *(core::ptr::from_mut(slots) as *mut [PageDescriptor]) };

        let mut pmm = Self {
            pages,
            free_head: NONE,
            free_len: 0,
        };
        for i in (0..total).rev() {
            pmm.push_free(i);
        }

        info!(
            "PMM: {total} pages ({} KiB) in pool, descriptors use {} KiB",
            total as u64 * Size4K::SIZE / 1024,
            total * size_of::<PageDescriptor>() / 1024
        );
        Ok(pmm)
    }

    /// Number of frames described by the pool.
    #[inline]
    #[must_use]
    pub fn pool_size(&self) -> usize {
        self.pages.len()
    }

    #[inline]
    #[must_use]
    pub const fn free_pages(&self) -> usize {
        self.free_len
    }

    #[must_use]
    pub fn get_memory_stats(&self) -> MemoryStats {
        let used_pages = self.pages.iter().filter(|d| !d.is_free()).count();
        MemoryStats {
            total_pages: self.pages.len(),
            used_pages,
        }
    }

    /// Descriptor of the frame containing `pa`.
    #[must_use]
    pub fn descriptor(&self, pa: PhysicalAddress) -> Option<&PageDescriptor> {
        self.index_of(pa).map(|i| &self.pages[i])
    }

    #[must_use]
    pub fn ref_count(&self, pa: PhysicalAddress) -> Option<u32> {
        self.descriptor(pa).map(PageDescriptor::ref_count)
    }

    #[must_use]
    pub fn is_free(&self, pa: PhysicalAddress) -> Option<bool> {
        self.descriptor(pa).map(PageDescriptor::is_free)
    }

    /// Take one frame off the free list.
    ///
    /// # Errors
    /// [`PmmError::OutOfMemory`] when no frame is free.
    pub fn allocate_page(&mut self) -> Result<PhysicalFrame, PmmError> {
        let head = self.free_head;
        if head == NONE {
            warn!("PMM: out of memory");
            return Err(PmmError::OutOfMemory);
        }
        let index = head as usize;
        self.unlink(index);
        self.pages[index].ref_count = 1;
        let page = self.pages[index].address;
        trace!("PMM: allocated page {:?}", page.base());
        Ok(PhysicalFrame { page, index })
    }

    /// First-fit search for `pages` physically contiguous free frames.
    ///
    /// Either all `pages` frames are claimed with a reference count of one,
    /// or nothing changes.
    ///
    /// # Errors
    /// - [`PmmError::InvalidParameter`] for `pages == 0`.
    /// - [`PmmError::OutOfMemory`] when fewer than `pages` frames are free.
    /// - [`PmmError::NoContiguousRange`] when free frames exist but not in one run.
    pub fn allocate_range(&mut self, pages: usize) -> Result<PhysicalRange, PmmError> {
        if pages == 0 {
            return Err(PmmError::InvalidParameter("empty range"));
        }
        if pages > self.free_len {
            warn!("PMM: {pages} pages requested, {} free", self.free_len);
            return Err(PmmError::OutOfMemory);
        }

        let mut run_start = 0;
        let mut run_len = 0;
        for i in 0..self.pages.len() {
            if !self.pages[i].is_free() {
                run_len = 0;
                continue;
            }
            if run_len > 0 && self.pages[i - 1].address.forward(1) == self.pages[i].address {
                run_len += 1;
            } else {
                run_start = i;
                run_len = 1;
            }
            if run_len == pages {
                for j in run_start..run_start + pages {
                    self.unlink(j);
                    self.pages[j].ref_count = 1;
                }
                let start = self.pages[run_start].address;
                debug!("PMM: allocated {pages} pages at {:?}", start.base());
                return Ok(PhysicalRange {
                    start,
                    pages,
                    index: run_start,
                });
            }
        }

        warn!("PMM: no contiguous run of {pages} pages");
        Err(PmmError::NoContiguousRange { pages })
    }

    /// Claim `pages` frames starting at a known address, whatever their state.
    ///
    /// Used while building the kernel address space to take ownership of
    /// frames that are already in use (the kernel image, early allocations).
    /// Free frames leave the free list; every frame gains one reference.
    ///
    /// # Errors
    /// - [`PmmError::NotManaged`] when `pa` is not in the pool.
    /// - [`PmmError::RangeNotManaged`] when the run leaves the pool or has a hole.
    pub fn allocate_range_at(&mut self, pa: PhysicalAddress, pages: usize) -> Result<PhysicalRange, PmmError> {
        if pages == 0 {
            return Err(PmmError::InvalidParameter("empty range"));
        }
        let first = self.index_of(pa).ok_or(PmmError::NotManaged(pa))?;
        let start = self.pages[first].address;
        let last = first + pages - 1;
        if last >= self.pages.len() || self.pages[last].address != start.forward(pages as u64 - 1) {
            error!("PMM: {pages} pages at {pa} are not a managed contiguous range");
            return Err(PmmError::RangeNotManaged { address: pa, pages });
        }

        for i in first..=last {
            if self.pages[i].is_free() {
                self.unlink(i);
            }
            self.pages[i].ref_count += 1;
        }
        debug!("PMM: claimed {pages} pages at {:?}", start.base());
        Ok(PhysicalRange {
            start,
            pages,
            index: first,
        })
    }

    /// Take another reference on every frame of `range`.
    #[must_use = "the shared range must be returned as well"]
    pub fn share_range(&mut self, range: &PhysicalRange) -> PhysicalRange {
        for d in &mut self.pages[range.index..range.index + range.pages] {
            d.ref_count += 1;
        }
        PhysicalRange {
            start: range.start,
            pages: range.pages,
            index: range.index,
        }
    }

    /// Drop one reference on a frame; at zero it goes back on the free list.
    ///
    /// # Errors
    /// [`PmmError::NotAllocated`] if the frame is already free.
    pub fn return_page(&mut self, frame: PhysicalFrame) -> Result<(), PmmError> {
        self.return_range(frame.into_range())
    }

    /// Drop one reference on every frame of `range`.
    ///
    /// # Errors
    /// [`PmmError::NotAllocated`] if any frame is already free; nothing is
    /// changed in that case.
    pub fn return_range(&mut self, range: PhysicalRange) -> Result<(), PmmError> {
        let span = range.index..range.index + range.pages;
        if let Some(d) = self.pages[span.clone()].iter().find(|d| d.is_free()) {
            error!("PMM: returning free page {}", d.address());
            return Err(PmmError::NotAllocated(d.address()));
        }
        for i in span.rev() {
            self.pages[i].ref_count -= 1;
            if self.pages[i].is_free() {
                self.push_free(i);
            }
        }
        trace!("PMM: returned {} pages at {}", range.pages, range.start());
        Ok(())
    }

    /// Check that the free list holds exactly the frames with a zero
    /// reference count and that its links are consistent.
    #[must_use]
    pub fn verify(&self) -> bool {
        let mut count = 0;
        let mut prev = NONE;
        let mut cursor = self.free_head;
        while cursor != NONE {
            let Some(d) = self.pages.get(cursor as usize) else {
                return false;
            };
            if !d.is_free() || d.prev != prev || count >= self.pages.len() {
                return false;
            }
            count += 1;
            prev = cursor;
            cursor = d.next;
        }
        count == self.free_len && self.pages.iter().filter(|d| d.is_free()).count() == count
    }

    fn index_of(&self, pa: PhysicalAddress) -> Option<usize> {
        let page = PhysicalPage::<Size4K>::containing(pa);
        self.pages.binary_search_by_key(&page, |d| d.address).ok()
    }

    #[allow(clippy::cast_possible_truncation)]
    fn push_free(&mut self, index: usize) {
        let old = self.free_head;
        self.pages[index].prev = NONE;
        self.pages[index].next = old;
        if old != NONE {
            self.pages[old as usize].prev = index as u32;
        }
        self.free_head = index as u32;
        self.free_len += 1;
    }

    fn unlink(&mut self, index: usize) {
        let PageDescriptor { prev, next, .. } = self.pages[index];
        if prev == NONE {
            self.free_head = next;
        } else {
            self.pages[prev as usize].next = next;
        }
        if next != NONE {
            self.pages[next as usize].prev = prev;
        }
        self.pages[index].prev = NONE;
        self.pages[index].next = NONE;
        self.free_len -= 1;
    }
}

#[inline]
#[allow(clippy::cast_possible_truncation)]
const fn frames(start: u64, end: u64) -> usize {
    ((end - start) / Size4K::SIZE) as usize
}

/// Available regions of a memory map in ascending order, clipped to whole
/// frames below [`DIRECT_MAP_LIMIT`] and with overlaps removed.
struct Regions<'t, 'a> {
    tag: &'t MemoryMapTag<'a>,
    cursor: u64,
}

impl<'t, 'a> Regions<'t, 'a> {
    const fn new(tag: &'t MemoryMapTag<'a>) -> Self {
        Self { tag, cursor: 0 }
    }
}

impl Iterator for Regions<'_, '_> {
    type Item = (u64, u64);

    fn next(&mut self) -> Option<Self::Item> {
        let mut best: Option<(u64, u64)> = None;
        for e in self.tag.available() {
            let Some(start) = align_up(e.base_addr.max(self.cursor), Size4K::SIZE) else {
                continue;
            };
            let end = align_down(e.end().min(DIRECT_MAP_LIMIT), Size4K::SIZE);
            if start >= end {
                continue;
            }
            if best.is_none_or(|(s, _)| start < s) {
                best = Some((start, end));
            }
        }
        let (start, end) = best?;
        self.cursor = end;
        Some((start, end))
    }
}
