use crate::{PageSize, PhysicalAddress, Size4K, VirtualAddress};
use core::fmt;
use core::marker::PhantomData;

macro_rules! page_type {
    ($(#[$meta:meta])* $name:ident, $addr:ident, $tag:literal) => {
        $(#[$meta])*
        #[repr(transparent)]
        pub struct $name<S: PageSize = Size4K> {
            base: $addr,
            _size: PhantomData<S>,
        }

        impl<S: PageSize> $name<S> {
            /// Wrap an address that is already `S`-aligned.
            ///
            /// Returns `None` for unaligned input.
            #[inline]
            #[must_use]
            pub const fn from_base(base: $addr) -> Option<Self> {
                if base.is_aligned::<S>() {
                    Some(Self { base, _size: PhantomData })
                } else {
                    None
                }
            }

            /// The page that contains `addr`.
            #[inline]
            #[must_use]
            pub const fn containing(addr: $addr) -> Self {
                Self { base: addr.align_down::<S>(), _size: PhantomData }
            }

            #[inline]
            #[must_use]
            pub const fn base(self) -> $addr {
                self.base
            }

            /// Address `offset` bytes into this page (`offset` is masked to the page size).
            #[inline]
            #[must_use]
            pub const fn join(self, offset: u64) -> $addr {
                $addr::new(self.base.as_u64() | (offset & S::MASK))
            }

            /// The page `count` pages after this one.
            #[inline]
            #[must_use]
            pub const fn forward(self, count: u64) -> Self {
                Self {
                    base: $addr::new(self.base.as_u64().wrapping_add(count << S::SHIFT)),
                    _size: PhantomData,
                }
            }

            /// Page-granular frame number (`base >> S::SHIFT`).
            #[inline]
            #[must_use]
            pub const fn number(self) -> u64 {
                self.base.as_u64() >> S::SHIFT
            }
        }

        impl<S: PageSize> Copy for $name<S> {}

        impl<S: PageSize> Clone for $name<S> {
            fn clone(&self) -> Self {
                *self
            }
        }

        impl<S: PageSize> PartialEq for $name<S> {
            fn eq(&self, other: &Self) -> bool {
                self.base == other.base
            }
        }

        impl<S: PageSize> Eq for $name<S> {}

        impl<S: PageSize> PartialOrd for $name<S> {
            fn partial_cmp(&self, other: &Self) -> Option<core::cmp::Ordering> {
                Some(self.cmp(other))
            }
        }

        impl<S: PageSize> Ord for $name<S> {
            fn cmp(&self, other: &Self) -> core::cmp::Ordering {
                self.base.cmp(&other.base)
            }
        }

        impl<S: PageSize> core::hash::Hash for $name<S> {
            fn hash<H: core::hash::Hasher>(&self, state: &mut H) {
                self.base.hash(state);
            }
        }

        impl<S: PageSize> fmt::Debug for $name<S> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($tag, "<{}>(0x{:016X})"), S::NAME, self.base.as_u64())
            }
        }
    };
}

page_type!(
    /// An `S`-aligned physical frame.
    PhysicalPage, PhysicalAddress, "PhysicalPage"
);
page_type!(
    /// An `S`-aligned virtual page.
    VirtualPage, VirtualAddress, "VirtualPage"
);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Size2M;

    #[test]
    fn containing_aligns_down() {
        let page = PhysicalPage::<Size4K>::containing(PhysicalAddress::new(0x1234));
        assert_eq!(page.base().as_u64(), 0x1000);
        assert_eq!(page.join(0x34).as_u64(), 0x1034);
        assert_eq!(page.forward(2).base().as_u64(), 0x3000);
        assert_eq!(page.number(), 1);
    }

    #[test]
    fn from_base_rejects_unaligned() {
        assert!(VirtualPage::<Size2M>::from_base(VirtualAddress::new(0x1000)).is_none());
        assert!(VirtualPage::<Size2M>::from_base(VirtualAddress::new(0x20_0000)).is_some());
    }
}
