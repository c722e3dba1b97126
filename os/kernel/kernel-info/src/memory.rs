//! # Memory Layout
//!
//! ```text
//! KERNEL_SPACE_START   0xFFFF_8000_0000_0000  start of the higher half
//! KERNEL_VMA           0xFFFF_FFFF_8000_0000  direct map of physical memory, kernel image at +1 MiB
//!                      ... DIRECT_MAP_LIMIT (1 GiB) of physical memory ...
//! HEAP_AREA_BASE       0xFFFF_FFFF_C000_0000  growable kernel heap area
//! STACK_AREA_BASE      0xFFFF_FFFF_FFA0_0000  kernel stack area
//! TEMP_WINDOW_BASE     0xFFFF_FFFF_FFE0_0000  temporary mapping window (last 2 MiB)
//! ```

pub use kernel_memory_addresses::KERNEL_VMA;

/// Start of the canonical higher half; everything above belongs to the kernel.
pub const KERNEL_SPACE_START: u64 = 0xFFFF_8000_0000_0000;

/// Amount of physical memory reachable through the direct map at [`KERNEL_VMA`].
///
/// Frames above this limit are not handed to the physical memory manager.
pub const DIRECT_MAP_LIMIT: u64 = 1024 * 1024 * 1024;

/// Size of a base page.
pub const PAGE_SIZE: u64 = 4096;

/// Size of a huge page used by the bootstrap mapper.
pub const HUGE_PAGE_SIZE: u64 = 2 * 1024 * 1024;

/// Largest window the eternal allocator may use past the kernel image.
pub const ETERNAL_AREA_SIZE: u64 = 64 * 1024 * 1024;

/// Base of the growable kernel heap area.
pub const HEAP_AREA_BASE: u64 = 0xFFFF_FFFF_C000_0000;

/// Reserved virtual size of the kernel heap area.
pub const HEAP_AREA_SIZE: u64 = 256 * 1024 * 1024;

/// Pages of the heap area backed with physical memory at boot.
pub const HEAP_AREA_INITIAL_PAGES: usize = 16;

/// Base of the kernel stack area.
pub const STACK_AREA_BASE: u64 = 0xFFFF_FFFF_FFA0_0000;

/// Size of the kernel stack.
pub const STACK_SIZE: u64 = 64 * 1024;

/// Base of the temporary mapping window; the window spans the last 2 MiB.
pub const TEMP_WINDOW_BASE: u64 = 0xFFFF_FFFF_FFE0_0000;

/// Size of the temporary mapping window.
pub const TEMP_WINDOW_SIZE: u64 = HUGE_PAGE_SIZE;

/// Number of temporary mapping slots, one per page-table level.
pub const TEMP_SLOT_COUNT: usize = 4;

/// Index of the first temp slot inside the window's page table.
pub const TEMP_SLOT_FIRST_INDEX: usize = 512 - TEMP_SLOT_COUNT;

/// Number of slab size classes (16 B through 4096 B).
pub const HEAP_CLASS_COUNT: usize = 9;

/// Slot sizes of the slab classes, ascending.
pub const HEAP_CLASS_SIZES: [usize; HEAP_CLASS_COUNT] = [16, 32, 64, 128, 256, 512, 1024, 2048, 4096];

/// Byte budget for each slab class of the kernel heap.
///
/// Entry `i` is the backing buffer size of the class [`HEAP_CLASS_SIZES`]`[i]`.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct HeapConfig {
    pub class_bytes: [usize; HEAP_CLASS_COUNT],
}

impl HeapConfig {
    /// The boot heap: about 2 MiB, weighted towards small objects and page tables.
    pub const DEFAULT: Self = Self {
        class_bytes: [
            64 * 1024,
            64 * 1024,
            128 * 1024,
            128 * 1024,
            128 * 1024,
            128 * 1024,
            256 * 1024,
            256 * 1024,
            1024 * 1024,
        ],
    };

    /// Same number of slots in every class.
    #[must_use]
    pub const fn uniform(slots_per_class: usize) -> Self {
        let mut class_bytes = [0; HEAP_CLASS_COUNT];
        let mut i = 0;
        while i < HEAP_CLASS_COUNT {
            class_bytes[i] = HEAP_CLASS_SIZES[i] * slots_per_class;
            i += 1;
        }
        Self { class_bytes }
    }

    /// Total bytes across all classes.
    #[must_use]
    pub const fn total_bytes(&self) -> usize {
        let mut total = 0;
        let mut i = 0;
        while i < HEAP_CLASS_COUNT {
            total += self.class_bytes[i];
            i += 1;
        }
        total
    }

    /// Bytes needed to lay out all classes with each class starting on a page boundary.
    #[must_use]
    pub const fn region_bytes(&self) -> usize {
        let page = PAGE_SIZE as usize;
        let mut total = 0;
        let mut i = 0;
        while i < HEAP_CLASS_COUNT {
            total += self.class_bytes[i].next_multiple_of(page);
            i += 1;
        }
        total
    }
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

const _: () = {
    assert!(KERNEL_VMA >= KERNEL_SPACE_START);
    assert!(KERNEL_VMA + DIRECT_MAP_LIMIT <= HEAP_AREA_BASE);
    assert!(HEAP_AREA_BASE + HEAP_AREA_SIZE <= STACK_AREA_BASE);
    assert!(STACK_AREA_BASE + STACK_SIZE <= TEMP_WINDOW_BASE);
    assert!(TEMP_WINDOW_BASE.wrapping_add(TEMP_WINDOW_SIZE) == 0);
    assert!(HEAP_AREA_BASE.is_multiple_of(HUGE_PAGE_SIZE));
    assert!(STACK_AREA_BASE.is_multiple_of(HUGE_PAGE_SIZE));
    assert!(STACK_SIZE.is_multiple_of(PAGE_SIZE));
    assert!(ETERNAL_AREA_SIZE <= DIRECT_MAP_LIMIT);
    assert!(HEAP_AREA_INITIAL_PAGES as u64 * PAGE_SIZE <= HEAP_AREA_SIZE);
    let mut i = 0;
    while i < HEAP_CLASS_COUNT {
        assert!(HEAP_CLASS_SIZES[i].is_power_of_two());
        assert!(HeapConfig::DEFAULT.class_bytes[i].is_multiple_of(PAGE_SIZE as usize));
        i += 1;
    }
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_heap_is_about_two_megabytes() {
        assert_eq!(HeapConfig::DEFAULT.total_bytes(), 2176 * 1024);
        assert_eq!(HeapConfig::uniform(2).class_bytes[0], 32);
        assert_eq!(HeapConfig::uniform(2).class_bytes[8], 8192);
        assert_eq!(HeapConfig::uniform(2).region_bytes(), 8 * 4096 + 8192);
        assert_eq!(HeapConfig::DEFAULT.region_bytes(), HeapConfig::DEFAULT.total_bytes());
    }
}
