//! # Slab Caches
//!
//! A [`SlabCache`] carves one contiguous buffer into equal slots. Free slots
//! form a singly linked list threaded through the slots themselves; each free
//! slot starts with a [`FREE_MAGIC`] tag so a clobbered free list is noticed
//! on the next allocation.
//!
//! Whether a slot is handed out is tracked separately, one bit per slot, in a
//! bitmap kept in the first slots of the buffer. A pointer freed twice finds
//! its bit already clear.
//!
//! ```text
//! +--------+--------+--------+--------+--------+-----
//! | bitmap | slot 1 | slot 2 | slot 3 | slot 4 | ...
//! +--------+--------+--------+--------+--------+-----
//!            used     free ----------> free
//!                     magic,next       magic,NONE
//! ```

use crate::heap::HeapError;
use core::ptr::{self, NonNull};
use log::{trace, warn};

/// Tag at the head of every free slot.
pub const FREE_MAGIC: u64 = 0x51AB_F4EE_D00D_CAFE;

/// Smallest slot size; a free slot must hold its header.
pub const MIN_SLOT_SIZE: usize = 16;

/// Free-list terminator.
const NONE: u32 = u32::MAX;

/// Header written into every free slot.
#[repr(C)]
struct FreeSlot {
    magic: u64,
    next: u32,
}

const _: () = assert!(size_of::<FreeSlot>() <= MIN_SLOT_SIZE);

/// One buffer of equally sized slots.
pub struct SlabCache {
    base: NonNull<u8>,
    slot_size: usize,
    slot_count: usize,
    /// Slots at the front taken by the allocation bitmap.
    reserved: usize,
    free_head: u32,
    slots_left: usize,
}

// SAFETY: the cache owns its buffer exclusively; the raw pointer is never shared.
unsafe impl Send for SlabCache {}

impl SlabCache {
    /// Take over `[buffer, buffer + total_size)` and split it into `slot_size` slots.
    ///
    /// The buffer is zeroed and every usable slot is put on the free list.
    ///
    /// # Safety
    /// The buffer must be valid for reads and writes of `total_size` bytes,
    /// aligned to `slot_size`, and not used by anything else for as long as
    /// the cache lives.
    ///
    /// # Errors
    /// [`HeapError::Unsupported`] for a slot size that is not a power of two
    /// of at least [`MIN_SLOT_SIZE`] bytes.
    #[allow(clippy::cast_possible_truncation)]
    pub unsafe fn initialize(buffer: NonNull<u8>, total_size: usize, slot_size: usize) -> Result<Self, HeapError> {
        if slot_size < MIN_SLOT_SIZE || !slot_size.is_power_of_two() {
            return Err(HeapError::Unsupported { size: slot_size });
        }
        debug_assert!(buffer.as_ptr().addr().is_multiple_of(slot_size));

        let slot_count = (total_size / slot_size).min(NONE as usize);
        let bitmap_bytes = slot_count.div_ceil(8);
        let reserved = bitmap_bytes.div_ceil(slot_size).min(slot_count);

        // SAFETY: the caller hands us the whole buffer.
        unsafe { ptr::write_bytes(buffer.as_ptr(), 0, total_size) };

        let mut cache = Self {
            base: buffer,
            slot_size,
            slot_count,
            reserved,
            free_head: NONE,
            slots_left: 0,
        };
        for index in (reserved..slot_count).rev() {
            cache.push_free(index as u32);
        }
        trace!(
            "Slab cache of {slot_count} x {slot_size} bytes at {:p}, {} usable",
            buffer.as_ptr(),
            cache.slots_left
        );
        Ok(cache)
    }

    #[inline]
    #[must_use]
    pub const fn slot_size(&self) -> usize {
        self.slot_size
    }

    /// Slots available to callers when nothing is allocated.
    #[inline]
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.slot_count - self.reserved
    }

    #[inline]
    #[must_use]
    pub const fn slots_left(&self) -> usize {
        self.slots_left
    }

    /// Whether `ptr` points into this cache's buffer.
    #[inline]
    #[must_use]
    pub fn contains_slab(&self, ptr: *const u8) -> bool {
        let base = self.base.as_ptr().addr();
        let addr = ptr.addr();
        addr >= base && addr < base + self.slot_count * self.slot_size
    }

    /// Hand out one zeroed slot.
    ///
    /// # Errors
    /// - [`HeapError::OutOfMemory`] when every slot is taken.
    /// - [`HeapError::HeapCorruption`] when the free-list head lost its tag
    ///   or is marked allocated.
    pub fn allocate(&mut self) -> Result<NonNull<u8>, HeapError> {
        if self.free_head == NONE {
            return Err(HeapError::OutOfMemory { size: self.slot_size });
        }
        let index = self.free_head as usize;
        let slot = self.slot(index);
        // SAFETY: `index` is a slot of this cache; slots are 8-byte aligned.
        let header = unsafe { ptr::read(slot.as_ptr().cast::<FreeSlot>()) };
        if header.magic != FREE_MAGIC || self.is_allocated(index) {
            return Err(HeapError::HeapCorruption {
                address: slot.as_ptr().addr(),
            });
        }
        if header.next != NONE && (header.next as usize >= self.slot_count || (header.next as usize) < self.reserved) {
            return Err(HeapError::HeapCorruption {
                address: slot.as_ptr().addr(),
            });
        }

        self.free_head = header.next;
        self.set_allocated(index, true);
        self.slots_left -= 1;
        // SAFETY: the slot now belongs to the caller.
        unsafe { ptr::write_bytes(slot.as_ptr(), 0, self.slot_size) };
        Ok(slot)
    }

    /// Put a slot back on the free list.
    ///
    /// # Errors
    /// - [`HeapError::InvalidPointer`] when `ptr` is not the start of a usable slot.
    /// - [`HeapError::DoubleFree`] when the slot is not allocated.
    #[allow(clippy::cast_possible_truncation)]
    pub fn free(&mut self, ptr: NonNull<u8>) -> Result<(), HeapError> {
        let address = ptr.as_ptr().addr();
        let offset = address.wrapping_sub(self.base.as_ptr().addr());
        if !self.contains_slab(ptr.as_ptr()) || !offset.is_multiple_of(self.slot_size) {
            return Err(HeapError::InvalidPointer { address });
        }
        let index = offset / self.slot_size;
        if index < self.reserved {
            return Err(HeapError::InvalidPointer { address });
        }
        if !self.is_allocated(index) {
            return Err(HeapError::DoubleFree { address });
        }
        self.set_allocated(index, false);
        self.push_free(index as u32);
        Ok(())
    }

    fn push_free(&mut self, index: u32) {
        let slot = self.slot(index as usize);
        // SAFETY: `index` is a slot of this cache that nobody else owns.
        unsafe {
            ptr::write(
                slot.as_ptr().cast::<FreeSlot>(),
                FreeSlot {
                    magic: FREE_MAGIC,
                    next: self.free_head,
                },
            );
        }
        self.free_head = index;
        self.slots_left += 1;
    }

    #[inline]
    fn slot(&self, index: usize) -> NonNull<u8> {
        // SAFETY: callers pass indices below `slot_count`.
        unsafe { self.base.add(index * self.slot_size) }
    }

    fn is_allocated(&self, index: usize) -> bool {
        // SAFETY: the bitmap lives in the reserved slots.
        let byte = unsafe { *self.base.as_ptr().add(index / 8) };
        byte & (1 << (index % 8)) != 0
    }

    fn set_allocated(&mut self, index: usize, allocated: bool) {
        // SAFETY: the bitmap lives in the reserved slots.
        let byte = unsafe { &mut *self.base.as_ptr().add(index / 8) };
        if allocated {
            *byte |= 1 << (index % 8);
        } else {
            *byte &= !(1 << (index % 8));
        }
    }
}

/// The slab allocator of one size class.
///
/// Holds a single cache; when it runs dry, allocation fails.
pub struct SlabAllocator<const N: usize> {
    cache: Option<SlabCache>,
}

impl<const N: usize> SlabAllocator<N> {
    pub const SLOT_SIZE: usize = N;

    /// An allocator without backing memory.
    #[must_use]
    pub const fn new() -> Self {
        Self { cache: None }
    }

    /// Back this allocator with `[buffer, buffer + size)`.
    ///
    /// # Safety
    /// As [`SlabCache::initialize`].
    ///
    /// # Errors
    /// As [`SlabCache::initialize`].
    pub unsafe fn initialize(&mut self, buffer: NonNull<u8>, size: usize) -> Result<(), HeapError> {
        // SAFETY: forwarded from the caller.
        self.cache = Some(unsafe { SlabCache::initialize(buffer, size, N)? });
        Ok(())
    }

    #[inline]
    #[must_use]
    pub const fn cache(&self) -> Option<&SlabCache> {
        self.cache.as_ref()
    }

    /// # Errors
    /// [`HeapError::OutOfMemory`] without backing memory or when the cache is
    /// exhausted; [`HeapError::HeapCorruption`] from the cache.
    pub fn allocate(&mut self) -> Result<NonNull<u8>, HeapError> {
        let Some(cache) = self.cache.as_mut() else {
            return Err(HeapError::OutOfMemory { size: N });
        };
        cache.allocate().inspect_err(|e| {
            if matches!(e, HeapError::OutOfMemory { .. }) {
                warn!("Slab allocator for {N} bytes exhausted");
            }
        })
    }

    /// # Errors
    /// [`HeapError::InvalidPointer`] if `ptr` is not in this allocator,
    /// otherwise as [`SlabCache::free`].
    pub fn free(&mut self, ptr: NonNull<u8>) -> Result<(), HeapError> {
        match self.cache.as_mut() {
            Some(cache) => cache.free(ptr),
            None => Err(HeapError::InvalidPointer {
                address: ptr.as_ptr().addr(),
            }),
        }
    }

    #[inline]
    #[must_use]
    pub fn contains_slab(&self, ptr: *const u8) -> bool {
        self.cache.as_ref().is_some_and(|c| c.contains_slab(ptr))
    }
}

impl<const N: usize> Default for SlabAllocator<N> {
    fn default() -> Self {
        Self::new()
    }
}
