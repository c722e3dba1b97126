use crate::PageTable;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};

/// Access to virtual memory and the TLB.
///
/// All page-table reads and writes of the memory managers go through this
/// trait, so they can run on the real CPU or against a simulated machine.
///
/// # Safety
/// Implementors must return pointers that are valid for reads and writes of
/// `T` whenever `va` is mapped in the active address space, and
/// [`address`](Mmu::address) must be the inverse of [`pointer`](Mmu::pointer).
pub unsafe trait Mmu {
    /// Pointer through which the CPU accesses `va`.
    fn pointer<T>(&self, va: VirtualAddress) -> *mut T;

    /// Virtual address of a pointer obtained from [`pointer`](Mmu::pointer).
    fn address<T>(&self, ptr: *const T) -> VirtualAddress;

    /// Drop any cached translation for the page containing `va`.
    fn invalidate_page(&self, va: VirtualAddress);

    /// The page table in frame `table`, reached through the direct map.
    #[inline]
    fn table(&self, table: PhysicalAddress) -> *mut PageTable {
        self.pointer(VirtualAddress::from_physical(table))
    }
}

/// The x86-64 MMU of the running CPU.
#[derive(Debug, Default, Copy, Clone)]
pub struct HardwareMmu;

unsafe impl Mmu for HardwareMmu {
    #[inline(always)]
    fn pointer<T>(&self, va: VirtualAddress) -> *mut T {
        va.as_u64() as *mut T
    }

    #[inline(always)]
    fn address<T>(&self, ptr: *const T) -> VirtualAddress {
        VirtualAddress::new(ptr as u64)
    }

    #[inline(always)]
    fn invalidate_page(&self, va: VirtualAddress) {
        invalidate_tlb_page(va);
    }
}

/// Invalidate the TLB entry for the page containing `va` on this CPU.
#[inline(always)]
#[allow(clippy::missing_const_for_fn)]
pub fn invalidate_tlb_page(va: VirtualAddress) {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        core::arch::asm!(
            "invlpg [{}]",
            in(reg) va.as_u64(),
            options(nostack, preserves_flags)
        );
    }
    #[cfg(not(target_arch = "x86_64"))]
    let _ = va;
}
