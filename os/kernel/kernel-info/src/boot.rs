//! # Boot Information
//!
//! The firmware memory map as handed over by a multiboot2 loader, and the
//! section layout exported by the linker script.

use kernel_memory_addresses::{PhysicalAddress, Size4K, VirtualAddress};

/// Multiboot2 tag type of the memory map.
pub const MEMORY_MAP_TAG_TYPE: u32 = 6;

/// One firmware-reported physical memory region.
#[repr(C)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct MemoryMapEntry {
    pub base_addr: u64,
    pub length: u64,
    pub kind: u32,
    pub reserved: u32,
}

impl MemoryMapEntry {
    /// RAM usable by the kernel.
    pub const AVAILABLE: u32 = 1;
    pub const RESERVED: u32 = 2;
    pub const ACPI_RECLAIMABLE: u32 = 3;
    pub const NVS: u32 = 4;
    pub const BAD_RAM: u32 = 5;

    #[must_use]
    pub const fn new(base_addr: u64, length: u64, kind: u32) -> Self {
        Self {
            base_addr,
            length,
            kind,
            reserved: 0,
        }
    }

    #[must_use]
    pub const fn available(base_addr: u64, length: u64) -> Self {
        Self::new(base_addr, length, Self::AVAILABLE)
    }

    #[inline]
    #[must_use]
    pub const fn is_available(&self) -> bool {
        self.kind == Self::AVAILABLE
    }

    /// Exclusive end address, saturating at `u64::MAX`.
    #[inline]
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.base_addr.saturating_add(self.length)
    }
}

/// A parsed memory-map tag.
///
/// `tag_type` and `entry_size` are the raw header fields; consumers validate
/// them against [`MEMORY_MAP_TAG_TYPE`] and [`MemoryMapTag::ENTRY_SIZE`].
#[derive(Debug, Copy, Clone)]
pub struct MemoryMapTag<'a> {
    pub tag_type: u32,
    pub entry_size: u32,
    pub entries: &'a [MemoryMapEntry],
}

impl<'a> MemoryMapTag<'a> {
    #[allow(clippy::cast_possible_truncation)]
    pub const ENTRY_SIZE: u32 = size_of::<MemoryMapEntry>() as u32;

    /// A well-formed tag over `entries`.
    #[must_use]
    pub const fn new(entries: &'a [MemoryMapEntry]) -> Self {
        Self {
            tag_type: MEMORY_MAP_TAG_TYPE,
            entry_size: Self::ENTRY_SIZE,
            entries,
        }
    }

    #[must_use]
    pub const fn is_well_formed(&self) -> bool {
        self.tag_type == MEMORY_MAP_TAG_TYPE && self.entry_size == Self::ENTRY_SIZE
    }

    pub fn available(&self) -> impl Iterator<Item = &'a MemoryMapEntry> + 'a {
        self.entries.iter().filter(|e| e.is_available())
    }
}

/// A virtual section `[start, end)` of the kernel image.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Section {
    pub start: VirtualAddress,
    pub end: VirtualAddress,
}

impl Section {
    #[must_use]
    pub const fn new(start: u64, end: u64) -> Self {
        Self {
            start: VirtualAddress::new(start),
            end: VirtualAddress::new(end),
        }
    }

    #[inline]
    #[must_use]
    pub const fn len(&self) -> u64 {
        self.end.as_u64().saturating_sub(self.start.as_u64())
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Physical load address of the section start.
    #[inline]
    #[must_use]
    pub const fn physical_start(&self) -> PhysicalAddress {
        PhysicalAddress::from_virtual(self.start)
    }
}

/// Kernel image layout, built from linker-script symbols.
///
/// Every section starts and ends on a 4 KiB boundary; each one becomes a VM
/// area with its own protection, so two sections never share a page.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct KernelLayout {
    pub text: Section,
    pub rodata: Section,
    pub data: Section,
    pub bss: Section,
    /// First virtual address past the loaded image; the eternal allocator starts here.
    pub image_end: VirtualAddress,
}

impl KernelLayout {
    /// Lowest section start.
    #[must_use]
    pub fn image_start(&self) -> VirtualAddress {
        [self.text, self.rodata, self.data, self.bss]
            .iter()
            .map(|s| s.start)
            .min()
            .unwrap_or(self.image_end)
    }

    /// Whether every section boundary lies on a 4 KiB page boundary.
    #[must_use]
    pub fn is_page_aligned(&self) -> bool {
        [self.text, self.rodata, self.data, self.bss]
            .iter()
            .all(|s| s.start.is_aligned::<Size4K>() && s.end.is_aligned::<Size4K>())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_abi_matches_multiboot() {
        assert_eq!(size_of::<MemoryMapEntry>(), 24);
        assert_eq!(MemoryMapTag::ENTRY_SIZE, 24);
    }

    #[test]
    fn layout_alignment() {
        let mut layout = KernelLayout {
            text: Section::new(0x1000, 0x3000),
            rodata: Section::new(0x3000, 0x4000),
            data: Section::new(0x4000, 0x6000),
            bss: Section::new(0x6000, 0x6000),
            image_end: VirtualAddress::new(0x6000),
        };
        assert!(layout.is_page_aligned());
        assert_eq!(layout.image_start(), VirtualAddress::new(0x1000));

        layout.text.end = VirtualAddress::new(0x2800);
        layout.rodata.start = VirtualAddress::new(0x2800);
        assert!(!layout.is_page_aligned());
    }

    #[test]
    fn filters_available_regions() {
        let entries = [
            MemoryMapEntry::available(0, 0x9F000),
            MemoryMapEntry::new(0x9F000, 0x1000, MemoryMapEntry::RESERVED),
            MemoryMapEntry::available(0x10_0000, 0x40_0000),
        ];
        let tag = MemoryMapTag::new(&entries);
        assert!(tag.is_well_formed());
        assert_eq!(tag.available().count(), 2);
    }
}
