//! # Kernel Global Allocator
//!
//! [`GlobalHeap`] puts a [`KernelHeap`] behind `alloc`'s allocation API and
//! behind the raw `kmalloc`/`kfree` calls. The heap lives in a `'static`
//! [`ExclusiveCell`] installed once the memory subsystem has initialized it:
//!
//! ```rust,ignore
//! static HEAP: ExclusiveCell<KernelHeap> = ExclusiveCell::new(KernelHeap::new());
//!
//! #[global_allocator]
//! static GLOBAL: GlobalHeap = GlobalHeap::new();
//!
//! let mut memory = MemorySubsystem::bootstrap(&HardwareMmu, tables, &layout, &HEAP, HeapConfig::DEFAULT);
//! memory.initialize_pmm(Some(&tag))?;
//! memory.initialize_vmm(multiboot)?;
//! GLOBAL.install(&HEAP)?;
//! ```
//!
//! Before installation every allocation returns null. Heap corruption and
//! double frees detected through the allocator API halt the kernel with a
//! panic.

use crate::exclusive::ExclusiveCell;
use crate::heap::{HeapError, KernelHeap};
use core::alloc::{GlobalAlloc, Layout};
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicPtr, Ordering};
use log::info;

pub struct GlobalHeap {
    heap: AtomicPtr<ExclusiveCell<KernelHeap>>,
}

impl GlobalHeap {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            heap: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Route all allocations to `heap`.
    ///
    /// # Errors
    /// [`HeapError::AlreadyInstalled`] on a second call.
    pub fn install(&self, heap: &'static ExclusiveCell<KernelHeap>) -> Result<(), HeapError> {
        self.heap
            .compare_exchange(
                ptr::null_mut(),
                ptr::from_ref(heap).cast_mut(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map_err(|_| HeapError::AlreadyInstalled)?;
        info!("Global heap installed");
        Ok(())
    }

    #[inline]
    pub fn is_installed(&self) -> bool {
        !self.heap.load(Ordering::Acquire).is_null()
    }

    /// Allocate `size` bytes.
    ///
    /// # Errors
    /// [`HeapError::NotInstalled`], or any error of [`KernelHeap::allocate`].
    pub fn kmalloc(&self, size: usize) -> Result<NonNull<u8>, HeapError> {
        self.heap()?.with(|h| h.allocate(size))
    }

    /// Allocate `size` bytes aligned to `align`.
    ///
    /// # Errors
    /// [`HeapError::NotInstalled`], or any error of [`KernelHeap::allocate_aligned`].
    pub fn kmalloc_aligned(&self, size: usize, align: usize) -> Result<NonNull<u8>, HeapError> {
        self.heap()?.with(|h| h.allocate_aligned(size, align))
    }

    /// Release memory from [`kmalloc`](Self::kmalloc).
    ///
    /// # Errors
    /// [`HeapError::NotInstalled`], or any error of [`KernelHeap::free`].
    pub fn kfree(&self, ptr: NonNull<u8>) -> Result<(), HeapError> {
        self.heap()?.with(|h| h.free(ptr))
    }

    fn heap(&self) -> Result<&'static ExclusiveCell<KernelHeap>, HeapError> {
        let heap = self.heap.load(Ordering::Acquire);
        // SAFETY: only `install` stores a non-null pointer, taken from a `'static` reference.
        unsafe { heap.as_ref() }.ok_or(HeapError::NotInstalled)
    }
}

impl Default for GlobalHeap {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl GlobalAlloc for GlobalHeap {
    /// Null when the heap is missing, exhausted, or the layout exceeds a page.
    ///
    /// # Panics
    /// On detected heap corruption.
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        match self.kmalloc_aligned(layout.size(), layout.align()) {
            Ok(p) => p.as_ptr(),
            Err(HeapError::OutOfMemory { .. } | HeapError::Unsupported { .. } | HeapError::NotInstalled) => {
                ptr::null_mut()
            }
            Err(e) => panic!("kernel heap: {e}"),
        }
    }

    /// # Panics
    /// On double frees, foreign pointers, or a missing heap.
    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        let Some(ptr) = NonNull::new(ptr) else {
            return;
        };
        if let Err(e) = self.kfree(ptr) {
            panic!("kernel heap: {e}");
        }
    }
}
