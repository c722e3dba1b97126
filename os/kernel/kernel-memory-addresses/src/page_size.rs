use core::fmt;
use core::hash::Hash;

mod sealed {
    pub trait Sealed {}
}

/// Marker trait for the x86-64 page sizes.
///
/// Implemented only by [`Size4K`], [`Size2M`] and [`Size1G`].
pub trait PageSize:
    sealed::Sealed + Copy + Eq + Ord + Hash + fmt::Debug + fmt::Display
{
    /// Page size in bytes (power of two).
    const SIZE: u64;
    /// log2(SIZE), i.e. the number of offset bits inside a page.
    const SHIFT: u32;
    /// Mask covering the in-page offset bits.
    const MASK: u64 = Self::SIZE - 1;
    /// Short human-readable name, e.g. `"2M"`.
    const NAME: &'static str;
}

macro_rules! page_size {
    ($(#[$meta:meta])* $name:ident, $shift:expr, $label:literal) => {
        $(#[$meta])*
        #[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
        pub struct $name;

        impl sealed::Sealed for $name {}

        impl PageSize for $name {
            const SIZE: u64 = 1 << $shift;
            const SHIFT: u32 = $shift;
            const NAME: &'static str = $label;
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(Self::NAME)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(Self::NAME)
            }
        }
    };
}

page_size!(
    /// 4 KiB base page, mapped by a PML1 entry.
    Size4K, 12, "4K"
);
page_size!(
    /// 2 MiB huge page, mapped by a PML2 entry with the huge bit set.
    Size2M, 21, "2M"
);
page_size!(
    /// 1 GiB huge page, mapped by a PML3 entry with the huge bit set.
    Size1G, 30, "1G"
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_match_shifts() {
        assert_eq!(Size4K::SIZE, 4096);
        assert_eq!(Size2M::SIZE, 2 * 1024 * 1024);
        assert_eq!(Size1G::SIZE, 1024 * 1024 * 1024);
        assert_eq!(Size2M::MASK, 0x1F_FFFF);
    }
}
