//! # Kernel Heap
//!
//! Nine slab allocators, one per power-of-two size class from 16 to 4096
//! bytes. A request goes to the smallest class that fits; a free probes the
//! classes in ascending order for the one whose buffer holds the pointer.
//!
//! The heap is carved from a single region whose per-class budget comes from
//! [`HeapConfig`]. Requests above 4096 bytes are not supported.

use crate::slab::SlabAllocator;
use crate::vmm::{PageTableSource, VmmError};
use core::ptr::NonNull;
use kernel_info::memory::{HEAP_CLASS_COUNT, HEAP_CLASS_SIZES, HeapConfig};
use kernel_vmem::PageTable;
use log::{debug, info};

/// Every class buffer starts on a page boundary.
const PAGE_SIZE: usize = 4096;

#[derive(Debug, Clone, Copy, Eq, PartialEq, thiserror::Error)]
pub enum HeapError {
    #[error("heap exhausted for a {size} byte request")]
    OutOfMemory { size: usize },
    #[error("unsupported allocation of {size} bytes")]
    Unsupported { size: usize },
    #[error("heap corruption detected at {address:#x}")]
    HeapCorruption { address: usize },
    #[error("double free of {address:#x}")]
    DoubleFree { address: usize },
    #[error("{address:#x} was not allocated from the kernel heap")]
    InvalidPointer { address: usize },
    #[error("heap region too small: {provided} bytes for a {required} byte configuration")]
    RegionTooSmall { provided: usize, required: usize },
    #[error("global heap not installed")]
    NotInstalled,
    #[error("global heap already installed")]
    AlreadyInstalled,
}

/// A slab size class.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum SizeClass {
    B16,
    B32,
    B64,
    B128,
    B256,
    B512,
    B1024,
    B2048,
    B4096,
}

impl SizeClass {
    pub const ALL: [Self; HEAP_CLASS_COUNT] = [
        Self::B16,
        Self::B32,
        Self::B64,
        Self::B128,
        Self::B256,
        Self::B512,
        Self::B1024,
        Self::B2048,
        Self::B4096,
    ];

    /// Largest supported request.
    pub const MAX_SIZE: usize = 4096;

    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Slot size in bytes.
    #[inline]
    #[must_use]
    pub const fn size(self) -> usize {
        HEAP_CLASS_SIZES[self.index()]
    }
}

/// The smallest class whose slots hold `size` bytes.
///
/// Zero-sized requests get the smallest class.
///
/// # Errors
/// [`HeapError::Unsupported`] above [`SizeClass::MAX_SIZE`].
pub const fn size_class_for(size: usize) -> Result<SizeClass, HeapError> {
    let mut i = 0;
    while i < HEAP_CLASS_COUNT {
        if size <= HEAP_CLASS_SIZES[i] {
            return Ok(SizeClass::ALL[i]);
        }
        i += 1;
    }
    Err(HeapError::Unsupported { size })
}

/// Capacity and free slots of one class.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct ClassStats {
    pub slot_size: usize,
    pub capacity: usize,
    pub free: usize,
}

#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct HeapStats {
    pub classes: [ClassStats; HEAP_CLASS_COUNT],
}

impl HeapStats {
    #[must_use]
    pub fn used_bytes(&self) -> usize {
        self.classes
            .iter()
            .map(|c| (c.capacity - c.free) * c.slot_size)
            .sum()
    }
}

/// Run `$body` with `$slab` bound to the allocator of `$class`.
macro_rules! with_class {
    ($heap:expr, $class:expr, |$slab:ident| $body:expr) => {
        match $class {
            SizeClass::B16 => { let $slab = &mut $heap.s16; $body }
            SizeClass::B32 => { let $slab = &mut $heap.s32; $body }
            SizeClass::B64 => { let $slab = &mut $heap.s64; $body }
            SizeClass::B128 => { let $slab = &mut $heap.s128; $body }
            SizeClass::B256 => { let $slab = &mut $heap.s256; $body }
            SizeClass::B512 => { let $slab = &mut $heap.s512; $body }
            SizeClass::B1024 => { let $slab = &mut $heap.s1024; $body }
            SizeClass::B2048 => { let $slab = &mut $heap.s2048; $body }
            SizeClass::B4096 => { let $slab = &mut $heap.s4096; $body }
        }
    };
}

pub struct KernelHeap {
    s16: SlabAllocator<16>,
    s32: SlabAllocator<32>,
    s64: SlabAllocator<64>,
    s128: SlabAllocator<128>,
    s256: SlabAllocator<256>,
    s512: SlabAllocator<512>,
    s1024: SlabAllocator<1024>,
    s2048: SlabAllocator<2048>,
    s4096: SlabAllocator<4096>,
    initialized: bool,
}

impl KernelHeap {
    /// A heap without memory; every allocation fails until [`initialize`](Self::initialize).
    #[must_use]
    pub const fn new() -> Self {
        Self {
            s16: SlabAllocator::new(),
            s32: SlabAllocator::new(),
            s64: SlabAllocator::new(),
            s128: SlabAllocator::new(),
            s256: SlabAllocator::new(),
            s512: SlabAllocator::new(),
            s1024: SlabAllocator::new(),
            s2048: SlabAllocator::new(),
            s4096: SlabAllocator::new(),
            initialized: false,
        }
    }

    #[inline]
    #[must_use]
    pub const fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Split `[region, region + len)` among the size classes per `config`.
    ///
    /// # Safety
    /// The region must be valid for reads and writes of `len` bytes, 4096-byte
    /// aligned, and owned by the heap from now on.
    ///
    /// # Errors
    /// [`HeapError::RegionTooSmall`] when `len` is below [`HeapConfig::region_bytes`].
    pub unsafe fn initialize(&mut self, region: NonNull<u8>, len: usize, config: &HeapConfig) -> Result<(), HeapError> {
        let required = config.region_bytes();
        if len < required {
            return Err(HeapError::RegionTooSmall { provided: len, required });
        }
        debug_assert!(region.as_ptr().addr().is_multiple_of(PAGE_SIZE));

        let mut offset = 0;
        for class in SizeClass::ALL {
            let bytes = config.class_bytes[class.index()];
            // SAFETY: `offset + bytes <= required <= len`.
            let buffer = unsafe { region.add(offset) };
            // SAFETY: each class gets its own page-aligned slice of the region.
            with_class!(self, class, |slab| unsafe { slab.initialize(buffer, bytes) })?;
            debug!("Heap: {}-byte class, {} KiB at {:p}", class.size(), bytes / 1024, buffer.as_ptr());
            offset += bytes.next_multiple_of(PAGE_SIZE);
        }
        self.initialized = true;
        info!("Heap: {} KiB in {} size classes", required / 1024, HEAP_CLASS_COUNT);
        Ok(())
    }

    /// Allocate `size` bytes from the smallest fitting class.
    ///
    /// # Errors
    /// [`HeapError::Unsupported`] above 4096 bytes, [`HeapError::OutOfMemory`]
    /// when the class is exhausted, [`HeapError::HeapCorruption`] from the slab.
    pub fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, HeapError> {
        let class = size_class_for(size)?;
        with_class!(self, class, |slab| slab.allocate())
    }

    /// Allocate `size` bytes aligned to `align`.
    ///
    /// Slots are aligned to their own size, so the request is served from the
    /// class that fits `max(size, align)`.
    ///
    /// # Errors
    /// As [`allocate`](Self::allocate); [`HeapError::Unsupported`] for an
    /// alignment that is not a power of two.
    pub fn allocate_aligned(&mut self, size: usize, align: usize) -> Result<NonNull<u8>, HeapError> {
        if !align.is_power_of_two() {
            return Err(HeapError::Unsupported { size });
        }
        self.allocate(size.max(align))
    }

    /// Return `ptr` to the class that owns it.
    ///
    /// # Errors
    /// [`HeapError::InvalidPointer`] when no class owns `ptr`,
    /// [`HeapError::DoubleFree`] when it is not allocated.
    pub fn free(&mut self, ptr: NonNull<u8>) -> Result<(), HeapError> {
        for class in SizeClass::ALL {
            if self.owns(class, ptr.as_ptr()) {
                return with_class!(self, class, |slab| slab.free(ptr));
            }
        }
        Err(HeapError::InvalidPointer {
            address: ptr.as_ptr().addr(),
        })
    }

    /// Whether `ptr` lies in one of the heap's buffers.
    #[must_use]
    pub fn contains(&self, ptr: *const u8) -> bool {
        self.class_of(ptr).is_some()
    }

    /// The class whose buffer holds `ptr`.
    #[must_use]
    pub fn class_of(&self, ptr: *const u8) -> Option<SizeClass> {
        SizeClass::ALL.into_iter().find(|&class| self.owns(class, ptr))
    }

    #[must_use]
    pub fn stats(&self) -> HeapStats {
        let mut stats = HeapStats::default();
        for class in SizeClass::ALL {
            stats.classes[class.index()] = self.cache_stats(class).unwrap_or(ClassStats {
                slot_size: class.size(),
                capacity: 0,
                free: 0,
            });
        }
        stats
    }

    fn owns(&self, class: SizeClass, ptr: *const u8) -> bool {
        match class {
            SizeClass::B16 => self.s16.contains_slab(ptr),
            SizeClass::B32 => self.s32.contains_slab(ptr),
            SizeClass::B64 => self.s64.contains_slab(ptr),
            SizeClass::B128 => self.s128.contains_slab(ptr),
            SizeClass::B256 => self.s256.contains_slab(ptr),
            SizeClass::B512 => self.s512.contains_slab(ptr),
            SizeClass::B1024 => self.s1024.contains_slab(ptr),
            SizeClass::B2048 => self.s2048.contains_slab(ptr),
            SizeClass::B4096 => self.s4096.contains_slab(ptr),
        }
    }

    fn cache_stats(&self, class: SizeClass) -> Option<ClassStats> {
        let cache = match class {
            SizeClass::B16 => self.s16.cache(),
            SizeClass::B32 => self.s32.cache(),
            SizeClass::B64 => self.s64.cache(),
            SizeClass::B128 => self.s128.cache(),
            SizeClass::B256 => self.s256.cache(),
            SizeClass::B512 => self.s512.cache(),
            SizeClass::B1024 => self.s1024.cache(),
            SizeClass::B2048 => self.s2048.cache(),
            SizeClass::B4096 => self.s4096.cache(),
        }?;
        Some(ClassStats {
            slot_size: cache.slot_size(),
            capacity: cache.capacity(),
            free: cache.slots_left(),
        })
    }
}

impl Default for KernelHeap {
    fn default() -> Self {
        Self::new()
    }
}

/// Page tables come from the 4096-byte class.
impl PageTableSource for KernelHeap {
    fn allocate_table(&mut self) -> Result<NonNull<PageTable>, VmmError> {
        let ptr = self
            .allocate_aligned(size_of::<PageTable>(), align_of::<PageTable>())
            .map_err(|_| VmmError::OutOfMemory)?;
        Ok(ptr.cast())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::alloc::{Layout, alloc_zeroed, dealloc};

    struct Region {
        ptr: NonNull<u8>,
        layout: Layout,
    }

    impl Region {
        fn new(size: usize) -> Self {
            let layout = Layout::from_size_align(size, 4096).unwrap();
            let ptr = NonNull::new(unsafe { alloc_zeroed(layout) }).unwrap();
            Self { ptr, layout }
        }
    }

    impl Drop for Region {
        fn drop(&mut self) {
            unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
        }
    }

    fn heap(config: &HeapConfig) -> (KernelHeap, Region) {
        let region = Region::new(config.region_bytes());
        let mut heap = KernelHeap::new();
        unsafe { heap.initialize(region.ptr, config.region_bytes(), config) }.unwrap();
        (heap, region)
    }

    #[test]
    fn size_class_selection() {
        let cases = [(0, 16), (1, 16), (16, 16), (17, 32), (256, 256), (257, 512), (4096, 4096)];
        for (size, class) in cases {
            assert_eq!(size_class_for(size).unwrap().size(), class, "size {size}");
        }
        assert_eq!(size_class_for(4097), Err(HeapError::Unsupported { size: 4097 }));
    }

    #[test]
    fn allocate_routes_to_class() {
        let (mut heap, _region) = heap(&HeapConfig::uniform(4));
        for (size, class) in [(1, SizeClass::B16), (16, SizeClass::B16), (17, SizeClass::B32), (256, SizeClass::B256), (4096, SizeClass::B4096)] {
            let p = heap.allocate(size).unwrap();
            assert_eq!(heap.class_of(p.as_ptr()), Some(class));
            heap.free(p).unwrap();
        }
        assert_eq!(heap.allocate(8192), Err(HeapError::Unsupported { size: 8192 }));
    }

    #[test]
    fn aligned_allocation_uses_larger_class() {
        let (mut heap, _region) = heap(&HeapConfig::uniform(4));
        let p = heap.allocate_aligned(24, 256).unwrap();
        assert!(p.as_ptr().addr().is_multiple_of(256));
        assert_eq!(heap.class_of(p.as_ptr()), Some(SizeClass::B256));
        assert!(matches!(heap.allocate_aligned(8, 24), Err(HeapError::Unsupported { .. })));
        assert!(matches!(heap.allocate_aligned(8, 8192), Err(HeapError::Unsupported { .. })));
    }

    #[test]
    fn free_rejects_foreign_and_double_free() {
        let (mut heap, _region) = heap(&HeapConfig::uniform(4));
        let p = heap.allocate(100).unwrap();
        heap.free(p).unwrap();
        assert!(matches!(heap.free(p), Err(HeapError::DoubleFree { .. })));

        let mut outside = 0u64;
        let foreign = NonNull::from(&mut outside).cast::<u8>();
        assert!(!heap.contains(foreign.as_ptr()));
        assert!(matches!(heap.free(foreign), Err(HeapError::InvalidPointer { .. })));
    }

    #[test]
    fn stats_track_usage() {
        let config = HeapConfig::uniform(8);
        let (mut heap, _region) = heap(&config);
        let before = heap.stats();
        assert_eq!(before.used_bytes(), 0);
        assert_eq!(before.classes[SizeClass::B4096.index()].capacity, 7);

        let a = heap.allocate(40).unwrap();
        let b = heap.allocate(40).unwrap();
        let stats = heap.stats();
        assert_eq!(stats.used_bytes(), 128);
        assert_eq!(
            stats.classes[SizeClass::B64.index()].free + 2,
            before.classes[SizeClass::B64.index()].free
        );
        heap.free(a).unwrap();
        heap.free(b).unwrap();
        assert_eq!(heap.stats(), before);
    }

    #[test]
    fn class_exhaustion_is_reported() {
        let (mut heap, _region) = heap(&HeapConfig::uniform(2));
        // Two 4096-byte slots, one holds the bitmap.
        let table = heap.allocate_table().unwrap();
        assert!(table.as_ptr().addr().is_multiple_of(4096));
        assert_eq!(heap.allocate_table(), Err(VmmError::OutOfMemory));
        assert_eq!(heap.allocate(4000), Err(HeapError::OutOfMemory { size: 4096 }));
    }

    #[test]
    fn uninitialized_heap_and_small_region() {
        let mut heap = KernelHeap::new();
        assert!(!heap.is_initialized());
        assert!(matches!(heap.allocate(8), Err(HeapError::OutOfMemory { .. })));

        let region = Region::new(4096);
        assert_eq!(
            unsafe { heap.initialize(region.ptr, 4096, &HeapConfig::DEFAULT) },
            Err(HeapError::RegionTooSmall {
                provided: 4096,
                required: HeapConfig::DEFAULT.region_bytes()
            })
        );
    }
}
