use core::{
    cell::UnsafeCell,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicBool, Ordering},
};

/// Interior mutability for single-core kernel state.
///
/// Like a spin lock without the spinning: on one core a second access while
/// the first is still active can only come from re-entry (an interrupt
/// handler, a nested call), which would deadlock a spin lock. Here it panics
/// instead.
pub struct ExclusiveCell<T> {
    /// * `false`: free
    /// * `true`: borrowed
    busy: AtomicBool,
    inner: UnsafeCell<T>,
}

// Safety: at most one guard exists at a time; only T: Send may cross threads.
unsafe impl<T: Send> Sync for ExclusiveCell<T> {}

impl<T> ExclusiveCell<T> {
    pub const fn new(inner: T) -> Self {
        Self {
            busy: AtomicBool::new(false),
            inner: UnsafeCell::new(inner),
        }
    }

    /// Borrow the value, or `None` if it is already borrowed.
    #[inline]
    pub fn try_borrow(&self) -> Option<ExclusiveGuard<'_, T>> {
        self.busy
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
            .then(|| ExclusiveGuard { cell: self })
    }

    /// Borrow the value.
    ///
    /// # Panics
    /// On re-entrant access.
    #[inline]
    #[track_caller]
    pub fn borrow(&self) -> ExclusiveGuard<'_, T> {
        self.try_borrow()
            .unwrap_or_else(|| panic!("re-entrant access to {}", core::any::type_name::<T>()))
    }

    /// Closure convenience, built on the guard.
    ///
    /// # Panics
    /// On re-entrant access.
    #[inline]
    #[track_caller]
    pub fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut g = self.borrow();
        f(&mut g)
    }

    #[inline]
    pub fn is_borrowed(&self) -> bool {
        self.busy.load(Ordering::Relaxed)
    }

    /// Mutable access when you have `&mut self` (no borrow possible).
    #[inline]
    pub const fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }

    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}

pub struct ExclusiveGuard<'a, T> {
    cell: &'a ExclusiveCell<T>,
}

impl<T> Deref for ExclusiveGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.cell.inner.get() }
    }
}

impl<T> DerefMut for ExclusiveGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.cell.inner.get() }
    }
}

impl<T> Drop for ExclusiveGuard<'_, T> {
    fn drop(&mut self) {
        self.cell.busy.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_releases_on_drop() {
        let cell = ExclusiveCell::new(1u32);
        {
            let mut g = cell.borrow();
            *g += 1;
            assert!(cell.is_borrowed());
            assert!(cell.try_borrow().is_none());
            // A failed attempt must not release the outer borrow.
            assert!(cell.is_borrowed());
        }
        assert!(!cell.is_borrowed());
        assert_eq!(cell.with(|v| *v), 2);
        assert_eq!(cell.into_inner(), 2);
    }

    #[test]
    #[should_panic(expected = "re-entrant access")]
    fn nested_access_panics() {
        let cell = ExclusiveCell::new(0u8);
        cell.with(|_| cell.with(|v| *v));
    }
}
