//! # Eternal Allocator
//!
//! A bump allocator for the time before the heap exists. It hands out kernel
//! virtual memory directly after the loaded image and never frees anything.
//!
//! The window is reached through the direct map, but only the 2 MiB pages the
//! boot tables map are present at first. Every allocation that moves the
//! break past the mapped end first maps the missing 2 MiB pages through a
//! [`BootstrapMap`]. The page tables touched by that mapping are the boot
//! tables, so mapping never needs to allocate.

use crate::vmm::VmmError;
use kernel_memory_addresses::{PageSize, PhysicalAddress, Size2M, VirtualAddress, align_up};
use log::{error, info, trace};

/// Granularity of eternal allocations.
pub const ETERNAL_ALIGN: u64 = 8;

#[derive(Debug, Clone, Copy, Eq, PartialEq, thiserror::Error)]
pub enum EternalError {
    #[error("eternal allocator used after it was disabled")]
    Disabled,
    #[error("eternal window exhausted: {requested} bytes requested, {available} available")]
    Exhausted { requested: u64, available: u64 },
    #[error("invalid alignment {0}")]
    InvalidAlignment(u64),
    #[error("failed to map eternal memory: {0}")]
    Map(#[from] VmmError),
}

/// Installs a 2 MiB mapping while only the boot page tables exist.
pub trait BootstrapMap {
    /// Map the 2 MiB page at `va` to the frame at `pa`.
    ///
    /// # Errors
    /// Whatever prevents the mapping; see [`VmmError`].
    fn bootstrap_map(&mut self, pa: PhysicalAddress, va: VirtualAddress) -> Result<(), VmmError>;
}

#[derive(Debug)]
pub struct EternalAllocator {
    start: VirtualAddress,
    next: VirtualAddress,
    limit: VirtualAddress,
    mapped_end: VirtualAddress,
    disabled: bool,
}

impl EternalAllocator {
    /// A window `[start, limit)` of which everything below `mapped_end` is
    /// already mapped. `mapped_end` is rounded down to 2 MiB.
    #[must_use]
    pub const fn new(start: VirtualAddress, limit: VirtualAddress, mapped_end: VirtualAddress) -> Self {
        Self {
            start,
            next: start,
            limit,
            mapped_end: mapped_end.align_down::<Size2M>(),
            disabled: false,
        }
    }

    #[inline]
    #[must_use]
    pub const fn start(&self) -> VirtualAddress {
        self.start
    }

    /// The current break: first byte not yet handed out.
    #[inline]
    #[must_use]
    pub const fn next(&self) -> VirtualAddress {
        self.next
    }

    #[inline]
    #[must_use]
    pub const fn mapped_end(&self) -> VirtualAddress {
        self.mapped_end
    }

    #[inline]
    #[must_use]
    pub fn used(&self) -> u64 {
        self.next - self.start
    }

    #[inline]
    #[must_use]
    pub fn remaining(&self) -> u64 {
        self.limit - self.next
    }

    #[inline]
    #[must_use]
    pub const fn is_disabled(&self) -> bool {
        self.disabled
    }

    /// Allocate `size` bytes (rounded up to 8, at least 8).
    ///
    /// # Errors
    /// - [`EternalError::Disabled`] after [`disable`](Self::disable).
    /// - [`EternalError::Exhausted`] when the window is full.
    /// - [`EternalError::Map`] when backing the memory fails.
    pub fn allocate(&mut self, size: u64, mapper: &mut impl BootstrapMap) -> Result<VirtualAddress, EternalError> {
        self.bump(self.next, size, mapper)
    }

    /// Allocate `size` bytes starting at a multiple of `align`.
    ///
    /// # Errors
    /// As [`allocate`](Self::allocate), plus [`EternalError::InvalidAlignment`]
    /// when `align` is not a power of two.
    pub fn allocate_aligned(
        &mut self,
        size: u64,
        align: u64,
        mapper: &mut impl BootstrapMap,
    ) -> Result<VirtualAddress, EternalError> {
        if !align.is_power_of_two() {
            return Err(EternalError::InvalidAlignment(align));
        }
        let at = align_up(self.next.as_u64(), align.max(ETERNAL_ALIGN)).ok_or(EternalError::Exhausted {
            requested: size,
            available: self.remaining(),
        })?;
        self.bump(VirtualAddress::new(at), size, mapper)
    }

    /// Stop serving allocations. Called once the heap is up.
    pub fn disable(&mut self) {
        info!(
            "Eternal allocator disabled after {} KiB ({} .. {})",
            self.used() / 1024,
            self.start,
            self.next
        );
        self.disabled = true;
    }

    fn bump(
        &mut self,
        at: VirtualAddress,
        size: u64,
        mapper: &mut impl BootstrapMap,
    ) -> Result<VirtualAddress, EternalError> {
        if self.disabled {
            error!("Eternal allocator used after disable ({size} bytes)");
            return Err(EternalError::Disabled);
        }
        let exhausted = EternalError::Exhausted {
            requested: size,
            available: self.remaining(),
        };
        let rounded = align_up(size.max(1), ETERNAL_ALIGN).ok_or(exhausted)?;
        let end = at.checked_add(rounded).ok_or(exhausted)?;
        if at < self.next || end > self.limit {
            error!("Eternal allocator exhausted: {size} bytes requested");
            return Err(exhausted);
        }

        self.ensure_mapped(end, mapper)?;
        self.next = end;
        trace!("Eternal allocation of {rounded} bytes at {at}");
        Ok(at)
    }

    fn ensure_mapped(&mut self, end: VirtualAddress, mapper: &mut impl BootstrapMap) -> Result<(), EternalError> {
        while self.mapped_end < end {
            let va = self.mapped_end;
            mapper.bootstrap_map(PhysicalAddress::from_virtual(va), va)?;
            self.mapped_end = va + Size2M::SIZE;
        }
        Ok(())
    }
}
