use bitfield_struct::bitfield;
use kernel_memory_addresses::PhysicalAddress;

/// Physical frame bits (12..=51) of an entry.
pub const ADDRESS_MASK: u64 = 0x000F_FFFF_FFFF_F000;

/// Mask for the 40-bit frame field.
const FRAME_MASK: u64 = (1 << 40) - 1;

/// A single 64-bit x86-64 page table entry.
///
/// The same layout serves all four levels. Whether an entry is a leaf depends
/// on the level and the `huge_page` (PS) bit: PML1 entries are always leaves,
/// PML2/PML3 entries are leaves when `huge_page` is set, PML4 entries never are.
///
/// | Bits   | Field             |
/// |--------|-------------------|
/// | 0      | `present`         |
/// | 1      | `writable`        |
/// | 2      | `user_accessible` |
/// | 3      | `write_through`   |
/// | 4      | `cache_disabled`  |
/// | 5      | `accessed`        |
/// | 6      | `dirty`           |
/// | 7      | `huge_page`       |
/// | 8      | `global`          |
/// | 9–11   | `available_low`   |
/// | 12–51  | `frame`           |
/// | 52–62  | `available_high`  |
/// | 63     | `no_execute`      |
///
/// The frame field always holds `physical_address >> 12`; use
/// [`set_physical_address`](Self::set_physical_address) rather than writing it directly.
///
/// ```rust
/// # use kernel_vmem::{PageTableEntry, PageEntryFlags};
/// # use kernel_memory_addresses::PhysicalAddress;
/// let mut e = PageTableEntry::new();
/// e.set_physical_address(PhysicalAddress::new(0x0040_0000));
/// e.set_flags(PageEntryFlags::PRESENT | PageEntryFlags::WRITABLE | PageEntryFlags::HUGE_PAGE);
/// assert_eq!(e.physical_address().as_u64(), 0x0040_0000);
/// assert!(e.is_huge());
/// ```
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct PageTableEntry {
    pub present: bool,
    pub writable: bool,
    pub user_accessible: bool,
    pub write_through: bool,
    pub cache_disabled: bool,
    /// Set by the CPU on first access.
    pub accessed: bool,
    /// Set by the CPU on first write (leaf only).
    pub dirty: bool,
    /// PS bit: leaf at PML3 (1 GiB) or PML2 (2 MiB).
    pub huge_page: bool,
    /// Survives CR3 reloads (leaf only).
    pub global: bool,
    #[bits(3)]
    pub available_low: u8,
    #[bits(40)]
    frame: u64,
    #[bits(11)]
    pub available_high: u16,
    pub no_execute: bool,
}

const _: () = assert!(size_of::<PageTableEntry>() == 8);

bitflags::bitflags! {
    /// Every non-address bit of a [`PageTableEntry`].
    #[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
    pub struct PageEntryFlags: u64 {
        const PRESENT = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER_ACCESSIBLE = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const CACHE_DISABLED = 1 << 4;
        const ACCESSED = 1 << 5;
        const DIRTY = 1 << 6;
        const HUGE_PAGE = 1 << 7;
        const GLOBAL = 1 << 8;
        const AVAILABLE_LOW = 0b111 << 9;
        const AVAILABLE_HIGH = 0x7FF << 52;
        const NO_EXECUTE = 1 << 63;
    }
}

impl PageEntryFlags {
    /// Flags of an intermediate (non-leaf) entry owned by the kernel.
    pub const TABLE: Self = Self::PRESENT.union(Self::WRITABLE);

    /// Kernel read/write data.
    pub const KERNEL_DATA: Self = Self::PRESENT.union(Self::WRITABLE).union(Self::NO_EXECUTE);

    /// Kernel code.
    pub const KERNEL_CODE: Self = Self::PRESENT;

    /// Kernel read-only data.
    pub const KERNEL_RODATA: Self = Self::PRESENT.union(Self::NO_EXECUTE);
}

impl PageTableEntry {
    /// An intermediate entry pointing at the table in frame `table`.
    #[inline]
    #[must_use]
    pub const fn table(table: PhysicalAddress) -> Self {
        Self::with_address_and_flags(table, PageEntryFlags::TABLE)
    }

    /// A 4 KiB leaf.
    #[inline]
    #[must_use]
    pub const fn leaf(frame: PhysicalAddress, flags: PageEntryFlags) -> Self {
        Self::with_address_and_flags(frame, flags.difference(PageEntryFlags::HUGE_PAGE))
    }

    /// A 2 MiB or 1 GiB leaf (PS set).
    #[inline]
    #[must_use]
    pub const fn huge(frame: PhysicalAddress, flags: PageEntryFlags) -> Self {
        Self::with_address_and_flags(frame, flags.union(PageEntryFlags::HUGE_PAGE))
    }

    #[inline]
    #[must_use]
    pub const fn with_address_and_flags(address: PhysicalAddress, flags: PageEntryFlags) -> Self {
        let mut e = Self::new();
        e.set_physical_address(address);
        e.set_flags(flags);
        e
    }

    /// Store `address >> 12` in the frame field. The low 12 bits are dropped.
    #[inline]
    pub const fn set_physical_address(&mut self, address: PhysicalAddress) {
        self.set_frame((address.as_u64() >> 12) & FRAME_MASK);
    }

    #[inline]
    #[must_use]
    pub const fn physical_address(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.frame() << 12)
    }

    #[inline]
    #[must_use]
    pub const fn flags(&self) -> PageEntryFlags {
        PageEntryFlags::from_bits_truncate(self.into_bits() & !ADDRESS_MASK)
    }

    /// Replace all non-address bits, leaving the frame untouched.
    #[inline]
    pub const fn set_flags(&mut self, flags: PageEntryFlags) {
        let bits = (self.into_bits() & ADDRESS_MASK) | (flags.bits() & !ADDRESS_MASK);
        *self = Self::from_bits(bits);
    }

    #[inline]
    #[must_use]
    pub const fn is_present(&self) -> bool {
        self.present()
    }

    #[inline]
    #[must_use]
    pub const fn is_huge(&self) -> bool {
        self.huge_page()
    }

    #[inline]
    #[must_use]
    pub const fn is_unused(&self) -> bool {
        self.into_bits() == 0
    }

    #[inline]
    pub const fn clear(&mut self) {
        *self = Self::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_and_flags_round_trip() {
        let flag_sets = [
            PageEntryFlags::empty(),
            PageEntryFlags::PRESENT,
            PageEntryFlags::TABLE,
            PageEntryFlags::KERNEL_DATA | PageEntryFlags::GLOBAL,
            PageEntryFlags::PRESENT | PageEntryFlags::HUGE_PAGE | PageEntryFlags::AVAILABLE_LOW,
            PageEntryFlags::all(),
        ];
        let addresses = [0u64, 0x1000, 0x0020_0000, 0x0000_0012_3456_7000, 0x000F_FFFF_FFFF_F000];

        for &pa in &addresses {
            for &flags in &flag_sets {
                let mut e = PageTableEntry::new();
                e.set_physical_address(PhysicalAddress::new(pa));
                e.set_flags(flags);
                assert_eq!(e.physical_address().as_u64(), pa);
                assert_eq!(e.flags(), flags);
            }
        }
    }

    #[test]
    fn frame_field_is_shifted() {
        let e = PageTableEntry::table(PhysicalAddress::new(0x0012_3000));
        assert_eq!(e.into_bits(), 0x0012_3000 | 0b11);
        assert!(e.is_present());
        assert!(e.writable());
        assert!(!e.is_huge());
    }

    #[test]
    fn low_bits_of_address_are_dropped() {
        let mut e = PageTableEntry::new();
        e.set_physical_address(PhysicalAddress::new(0x5123));
        assert_eq!(e.physical_address().as_u64(), 0x5000);
        assert!(e.flags().is_empty());
    }

    #[test]
    fn set_flags_keeps_frame() {
        let mut e = PageTableEntry::huge(PhysicalAddress::new(0x0040_0000), PageEntryFlags::TABLE);
        assert!(e.is_huge());
        e.set_flags(PageEntryFlags::PRESENT);
        assert_eq!(e.physical_address().as_u64(), 0x0040_0000);
        assert!(!e.writable());
        e.clear();
        assert!(e.is_unused());
    }
}
