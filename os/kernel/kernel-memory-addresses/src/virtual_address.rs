use crate::{KERNEL_VMA, MemoryAddress, PageSize, PhysicalAddress, VirtualPage};
use core::fmt;
use core::ops::{Add, AddAssign, Sub};

/// Bits per page-table index.
const INDEX_BITS: u32 = 9;
const INDEX_MASK: u64 = (1 << INDEX_BITS) - 1;
const OFFSET_MASK: u64 = 0xFFF;

/// A virtual address, translated by the page tables.
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtualAddress(MemoryAddress);

/// The canonical decomposition of a 48-bit virtual address.
///
/// ```text
///  63      48 47    39 38    30 29    21 20    12 11         0
/// +----------+--------+--------+--------+--------+------------+
/// | sign ext |  PML4  |  PML3  |  PML2  |  PML1  |   offset   |
/// +----------+--------+--------+--------+--------+------------+
/// ```
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct VirtualAddressParts {
    pub pml4: u16,
    pub pml3: u16,
    pub pml2: u16,
    pub pml1: u16,
    pub offset: u16,
}

impl VirtualAddress {
    pub const ZERO: Self = Self::new(0);

    #[inline]
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(MemoryAddress::new(value))
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0.as_u64()
    }

    #[inline]
    #[must_use]
    pub const fn as_memory_address(self) -> MemoryAddress {
        self.0
    }

    /// Translate a physical address into the kernel's direct-mapped window
    /// by adding the fixed [`KERNEL_VMA`] offset.
    #[inline]
    #[must_use]
    pub const fn from_physical(pa: PhysicalAddress) -> Self {
        Self::new(pa.as_u64().wrapping_add(KERNEL_VMA))
    }

    /// Extract the 9-bit table index found at bit `shift`.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn table_index(self, shift: u32) -> usize {
        ((self.as_u64() >> shift) & INDEX_MASK) as usize
    }

    #[inline]
    #[must_use]
    pub const fn pml4_index(self) -> usize {
        self.table_index(39)
    }

    #[inline]
    #[must_use]
    pub const fn pml3_index(self) -> usize {
        self.table_index(30)
    }

    #[inline]
    #[must_use]
    pub const fn pml2_index(self) -> usize {
        self.table_index(21)
    }

    #[inline]
    #[must_use]
    pub const fn pml1_index(self) -> usize {
        self.table_index(12)
    }

    /// Split into the four table indices and the 12-bit page offset.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn parts(self) -> VirtualAddressParts {
        VirtualAddressParts {
            pml4: self.pml4_index() as u16,
            pml3: self.pml3_index() as u16,
            pml2: self.pml2_index() as u16,
            pml1: self.pml1_index() as u16,
            offset: (self.as_u64() & OFFSET_MASK) as u16,
        }
    }

    /// Rebuild a canonical address from its parts, sign-extending bit 47.
    ///
    /// Index fields are truncated to 9 bits and the offset to 12 bits.
    #[must_use]
    #[allow(clippy::cast_lossless)]
    pub const fn from_parts(parts: VirtualAddressParts) -> Self {
        let raw = ((parts.pml4 as u64 & INDEX_MASK) << 39)
            | ((parts.pml3 as u64 & INDEX_MASK) << 30)
            | ((parts.pml2 as u64 & INDEX_MASK) << 21)
            | ((parts.pml1 as u64 & INDEX_MASK) << 12)
            | (parts.offset as u64 & OFFSET_MASK);
        Self::new(sign_extend_48(raw))
    }

    /// Bits 63..48 must all equal bit 47.
    #[inline]
    #[must_use]
    pub const fn is_canonical(self) -> bool {
        sign_extend_48(self.as_u64()) == self.as_u64()
    }

    #[inline]
    #[must_use]
    pub const fn page<S: PageSize>(self) -> VirtualPage<S> {
        VirtualPage::containing(self)
    }

    #[inline]
    #[must_use]
    pub const fn page_offset<S: PageSize>(self) -> u64 {
        self.0.page_offset::<S>()
    }

    #[inline]
    #[must_use]
    pub const fn is_aligned<S: PageSize>(self) -> bool {
        self.0.is_aligned::<S>()
    }

    #[inline]
    #[must_use]
    pub const fn align_down<S: PageSize>(self) -> Self {
        Self(self.0.align_down::<S>())
    }

    #[inline]
    #[must_use]
    pub const fn align_up<S: PageSize>(self) -> Self {
        Self(self.0.align_up::<S>())
    }

    #[inline]
    #[must_use]
    pub const fn checked_add(self, rhs: u64) -> Option<Self> {
        match self.0.checked_add(rhs) {
            Some(a) => Some(Self(a)),
            None => None,
        }
    }

    #[inline]
    #[must_use]
    pub const fn wrapping_add(self, rhs: u64) -> Self {
        Self(self.0.wrapping_add(rhs))
    }
}

#[inline]
#[allow(clippy::cast_possible_wrap, clippy::cast_sign_loss)]
const fn sign_extend_48(raw: u64) -> u64 {
    (((raw << 16) as i64) >> 16) as u64
}

impl fmt::Debug for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VA(0x{:016X})", self.as_u64())
    }
}

impl fmt::Display for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl From<u64> for VirtualAddress {
    #[inline]
    fn from(v: u64) -> Self {
        Self::new(v)
    }
}

impl From<VirtualAddress> for u64 {
    #[inline]
    fn from(a: VirtualAddress) -> Self {
        a.as_u64()
    }
}

impl Add<u64> for VirtualAddress {
    type Output = Self;

    #[inline]
    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl AddAssign<u64> for VirtualAddress {
    #[inline]
    fn add_assign(&mut self, rhs: u64) {
        self.0 += rhs;
    }
}

impl Sub for VirtualAddress {
    type Output = u64;

    #[inline]
    fn sub(self, rhs: Self) -> Self::Output {
        self.0 - rhs.0
    }
}
