//! Locking shim used for kernel-internal state.
//!
//! With `std` the lock is a `parking_lot::Mutex`; on bare-metal targets it is a
//! `spin::Mutex`. Either way the lock only models "interrupts masked" on the
//! host and is never held across a context switch.

#[cfg(not(feature = "std"))]
pub use alloc::sync::Arc;
#[cfg(feature = "std")]
pub use std::sync::Arc;

#[cfg(feature = "std")]
pub type MutexGuard<'a, T> = parking_lot::MutexGuard<'a, T>;
#[cfg(not(feature = "std"))]
pub type MutexGuard<'a, T> = spin::MutexGuard<'a, T>;

pub struct Mutex<T> {
    #[cfg(feature = "std")]
    inner: parking_lot::Mutex<T>,
    #[cfg(not(feature = "std"))]
    inner: spin::Mutex<T>,
}

impl<T> Mutex<T> {
    pub const fn new(value: T) -> Self {
        Self {
            #[cfg(feature = "std")]
            inner: parking_lot::const_mutex(value),
            #[cfg(not(feature = "std"))]
            inner: spin::Mutex::new(value),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.inner.lock()
    }
}
