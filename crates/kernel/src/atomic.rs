//! Atomic words with two interchangeable backends.
//!
//! [`exclusive`] maps onto `core::sync::atomic` (LDREX/STREX retry loops on
//! ARMv7-M). [`guarded`] performs each read-modify-write inside
//! `critical_section::with`, for cores without exclusive-access instructions.
//! Both implement [`AtomicWord`]; every counter helper is a compare-exchange
//! loop written once in the trait, so the two backends behave identically.
//!
//! The crate-level [`Atomic8`], [`Atomic16`], [`Atomic32`] and [`AtomicPtr`]
//! aliases select `exclusive` unless the `guarded-atomics` feature is enabled.

use core::ops::{BitAnd, BitOr};

/// Unsigned integer payload of an atomic word.
pub trait Word: Copy + Eq + Ord + BitOr<Output = Self> + BitAnd<Output = Self> {
    const ZERO: Self;
    const ONE: Self;

    fn wrapping_add(self, rhs: Self) -> Self;
    fn wrapping_sub(self, rhs: Self) -> Self;
}

macro_rules! impl_word {
    ($($ty:ty),*) => {$(
        impl Word for $ty {
            const ZERO: Self = 0;
            const ONE: Self = 1;

            fn wrapping_add(self, rhs: Self) -> Self {
                <$ty>::wrapping_add(self, rhs)
            }

            fn wrapping_sub(self, rhs: Self) -> Self {
                <$ty>::wrapping_sub(self, rhs)
            }
        }
    )*};
}

impl_word!(u8, u16, u32);

/// Common interface of both backends.
pub trait AtomicWord {
    type Value: Copy + PartialEq;

    fn load(&self) -> Self::Value;

    fn store(&self, value: Self::Value);

    /// Replaces the value with `new` if it equals `*expected`.
    ///
    /// On failure the value actually observed is written back into
    /// `expected`, so a retry loop needs no extra load.
    fn compare_exchange(&self, expected: &mut Self::Value, new: Self::Value) -> bool;

    /// Applies `f` until the exchange succeeds or `f` declines.
    ///
    /// Returns the previous value on success, `None` if `f` returned `None`.
    fn fetch_update(&self, mut f: impl FnMut(Self::Value) -> Option<Self::Value>) -> Option<Self::Value> {
        let mut current = self.load();
        loop {
            let next = f(current)?;
            let mut observed = current;
            if self.compare_exchange(&mut observed, next) {
                return Some(current);
            }
            current = observed;
        }
    }

    /// Wrapping increment; returns the previous value.
    fn increment(&self) -> Self::Value
    where
        Self::Value: Word,
    {
        self.fetch_update(|v| Some(v.wrapping_add(<Self::Value as Word>::ONE)))
            .unwrap_or(<Self::Value as Word>::ZERO)
    }

    /// Wrapping decrement; returns the previous value.
    fn decrement(&self) -> Self::Value
    where
        Self::Value: Word,
    {
        self.fetch_update(|v| Some(v.wrapping_sub(<Self::Value as Word>::ONE)))
            .unwrap_or(<Self::Value as Word>::ZERO)
    }

    /// Increments only while the value is below `limit`.
    fn increment_below(&self, limit: Self::Value) -> Option<Self::Value>
    where
        Self::Value: Word,
    {
        self.fetch_update(|v| (v < limit).then(|| v.wrapping_add(<Self::Value as Word>::ONE)))
    }

    /// Decrements only a non-zero value.
    fn decrement_nonzero(&self) -> Option<Self::Value>
    where
        Self::Value: Word,
    {
        self.fetch_update(|v| (v != <Self::Value as Word>::ZERO).then(|| v.wrapping_sub(<Self::Value as Word>::ONE)))
    }

    fn fetch_or(&self, bits: Self::Value) -> Self::Value
    where
        Self::Value: Word,
    {
        self.fetch_update(|v| Some(v | bits))
            .unwrap_or(<Self::Value as Word>::ZERO)
    }

    fn fetch_and(&self, bits: Self::Value) -> Self::Value
    where
        Self::Value: Word,
    {
        self.fetch_update(|v| Some(v & bits))
            .unwrap_or(<Self::Value as Word>::ZERO)
    }
}

/// Lock-free backend over `core::sync::atomic`.
pub mod exclusive {
    use core::sync::atomic::{self, Ordering};

    use super::AtomicWord;

    macro_rules! exclusive_word {
        ($name:ident, $inner:ty, $value:ty) => {
            pub struct $name($inner);

            impl $name {
                pub const fn new(value: $value) -> Self {
                    Self(<$inner>::new(value))
                }
            }

            impl AtomicWord for $name {
                type Value = $value;

                fn load(&self) -> $value {
                    self.0.load(Ordering::Acquire)
                }

                fn store(&self, value: $value) {
                    self.0.store(value, Ordering::Release)
                }

                fn compare_exchange(&self, expected: &mut $value, new: $value) -> bool {
                    match self
                        .0
                        .compare_exchange(*expected, new, Ordering::AcqRel, Ordering::Acquire)
                    {
                        Ok(_) => true,
                        Err(actual) => {
                            *expected = actual;
                            false
                        }
                    }
                }
            }
        };
    }

    exclusive_word!(Atomic8, atomic::AtomicU8, u8);
    exclusive_word!(Atomic16, atomic::AtomicU16, u16);
    exclusive_word!(Atomic32, atomic::AtomicU32, u32);

    pub struct AtomicPtr<T>(atomic::AtomicPtr<T>);

    impl<T> AtomicPtr<T> {
        pub const fn new(ptr: *mut T) -> Self {
            Self(atomic::AtomicPtr::new(ptr))
        }
    }

    impl<T> AtomicWord for AtomicPtr<T> {
        type Value = *mut T;

        fn load(&self) -> *mut T {
            self.0.load(Ordering::Acquire)
        }

        fn store(&self, value: *mut T) {
            self.0.store(value, Ordering::Release)
        }

        fn compare_exchange(&self, expected: &mut *mut T, new: *mut T) -> bool {
            match self
                .0
                .compare_exchange(*expected, new, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => true,
                Err(actual) => {
                    *expected = actual;
                    false
                }
            }
        }
    }
}

/// Backend that serialises every access through a critical section.
pub mod guarded {
    use core::cell::Cell;
    use core::marker::PhantomData;

    use critical_section::Mutex;

    use super::AtomicWord;

    macro_rules! guarded_word {
        ($name:ident, $value:ty) => {
            pub struct $name(Mutex<Cell<$value>>);

            impl $name {
                pub const fn new(value: $value) -> Self {
                    Self(Mutex::new(Cell::new(value)))
                }
            }

            impl AtomicWord for $name {
                type Value = $value;

                fn load(&self) -> $value {
                    critical_section::with(|cs| self.0.borrow(cs).get())
                }

                fn store(&self, value: $value) {
                    critical_section::with(|cs| self.0.borrow(cs).set(value))
                }

                fn compare_exchange(&self, expected: &mut $value, new: $value) -> bool {
                    critical_section::with(|cs| {
                        let cell = self.0.borrow(cs);
                        let current = cell.get();
                        if current == *expected {
                            cell.set(new);
                            true
                        } else {
                            *expected = current;
                            false
                        }
                    })
                }
            }
        };
    }

    guarded_word!(Atomic8, u8);
    guarded_word!(Atomic16, u16);
    guarded_word!(Atomic32, u32);

    /// Pointer stored as an address so the cell stays `Sync`.
    pub struct AtomicPtr<T> {
        addr: Mutex<Cell<usize>>,
        _marker: PhantomData<fn() -> *mut T>,
    }

    impl<T> AtomicPtr<T> {
        pub fn new(ptr: *mut T) -> Self {
            Self {
                addr: Mutex::new(Cell::new(ptr as usize)),
                _marker: PhantomData,
            }
        }
    }

    impl<T> AtomicWord for AtomicPtr<T> {
        type Value = *mut T;

        fn load(&self) -> *mut T {
            critical_section::with(|cs| self.addr.borrow(cs).get() as *mut T)
        }

        fn store(&self, value: *mut T) {
            critical_section::with(|cs| self.addr.borrow(cs).set(value as usize))
        }

        fn compare_exchange(&self, expected: &mut *mut T, new: *mut T) -> bool {
            critical_section::with(|cs| {
                let cell = self.addr.borrow(cs);
                let current = cell.get() as *mut T;
                if current == *expected {
                    cell.set(new as usize);
                    true
                } else {
                    *expected = current;
                    false
                }
            })
        }
    }
}

#[cfg(not(feature = "guarded-atomics"))]
pub use exclusive::{Atomic16, Atomic32, Atomic8, AtomicPtr};
#[cfg(feature = "guarded-atomics")]
pub use guarded::{Atomic16, Atomic32, Atomic8, AtomicPtr};

#[cfg(test)]
mod tests {
    use super::*;

    macro_rules! backend_tests {
        ($module:ident) => {
            mod $module {
                use super::super::$module::{Atomic16, Atomic32, Atomic8, AtomicPtr};
                use super::super::AtomicWord;

                #[test]
                fn failed_exchange_reports_actual_value() {
                    let word = Atomic32::new(5);
                    let mut expected = 4;
                    assert!(!word.compare_exchange(&mut expected, 9));
                    assert_eq!(expected, 5);
                    assert!(word.compare_exchange(&mut expected, 9));
                    assert_eq!(word.load(), 9);
                }

                #[test]
                fn increment_and_decrement_wrap() {
                    let word = Atomic8::new(u8::MAX);
                    assert_eq!(word.increment(), u8::MAX);
                    assert_eq!(word.load(), 0);
                    assert_eq!(word.decrement(), 0);
                    assert_eq!(word.load(), u8::MAX);
                }

                #[test]
                fn bounded_counters_stop_at_their_limits() {
                    let count = Atomic16::new(1);
                    assert_eq!(count.increment_below(2), Some(1));
                    assert_eq!(count.increment_below(2), None);
                    assert_eq!(count.load(), 2);

                    assert_eq!(count.decrement_nonzero(), Some(2));
                    assert_eq!(count.decrement_nonzero(), Some(1));
                    assert_eq!(count.decrement_nonzero(), None);
                    assert_eq!(count.load(), 0);
                }

                #[test]
                fn bit_operations_return_previous_word() {
                    let flags = Atomic32::new(0b0011);
                    assert_eq!(flags.fetch_or(0b0100), 0b0011);
                    assert_eq!(flags.fetch_and(!0b0001), 0b0111);
                    assert_eq!(flags.load(), 0b0110);
                }

                #[test]
                fn pointer_exchange() {
                    let mut a = 1u32;
                    let mut b = 2u32;
                    let pa: *mut u32 = &mut a;
                    let pb: *mut u32 = &mut b;

                    let ptr = AtomicPtr::new(pa);
                    let mut expected = pb;
                    assert!(!ptr.compare_exchange(&mut expected, pb));
                    assert_eq!(expected, pa);
                    assert!(ptr.compare_exchange(&mut expected, pb));
                    assert_eq!(ptr.load(), pb);
                }
            }
        };
    }

    backend_tests!(exclusive);
    backend_tests!(guarded);

    #[test]
    fn backends_agree_on_a_mixed_sequence() {
        let a = super::exclusive::Atomic16::new(0);
        let b = super::guarded::Atomic16::new(0);
        for step in 0u16..40 {
            let (ra, rb) = match step % 4 {
                0 => (a.increment_below(10), b.increment_below(10)),
                1 => (Some(a.fetch_or(step)), Some(b.fetch_or(step))),
                2 => (a.decrement_nonzero(), b.decrement_nonzero()),
                _ => (Some(a.fetch_and(!step)), Some(b.fetch_and(!step))),
            };
            assert_eq!(ra, rb);
            assert_eq!(a.load(), b.load());
        }
    }
}
