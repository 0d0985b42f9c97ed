//! Typed control-block slabs addressed by generation-checked handles.
//!
//! Every kernel object lives in a fixed-capacity [`ObjectPool`] sized from
//! [`crate::KernelConfig`] when the kernel is built. A handle ([`Key`]) is the
//! slot index plus the slot's generation at allocation time; deleting an object
//! bumps the generation so stale handles fail with
//! [`KernelError::InvalidHandle`] instead of aliasing a new object.
//!
//! Parts of an object that interrupt handlers touch without the scheduler lock
//! live in side tables ([`SlotTable`]) at the same index, guarded by a [`Tag`]
//! or a [`Leaf`] lock.

use core::fmt;

use alloc::vec::Vec;

use crate::atomic::{Atomic32, AtomicWord};
use crate::error::{KernelError, KernelResult};
use crate::sync::Mutex;

/// Slot index plus generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Key {
    index: u16,
    generation: u16,
}

impl Key {
    pub(crate) const fn new(index: u16, generation: u16) -> Self {
        Self { index, generation }
    }

    pub const fn index(&self) -> u16 {
        self.index
    }

    pub const fn generation(&self) -> u16 {
        self.generation
    }

    /// Packs the key into four little-endian bytes.
    pub fn to_bytes(self) -> [u8; 4] {
        let i = self.index.to_le_bytes();
        let g = self.generation.to_le_bytes();
        [i[0], i[1], g[0], g[1]]
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        match bytes {
            [i0, i1, g0, g1, ..] => Some(Self {
                index: u16::from_le_bytes([*i0, *i1]),
                generation: u16::from_le_bytes([*g0, *g1]),
            }),
            _ => None,
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.index, self.generation)
    }
}

/// Declares a typed handle over [`Key`].
macro_rules! object_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[cfg_attr(feature = "defmt", derive(defmt::Format))]
        pub struct $name(pub(crate) $crate::slots::Key);

        impl $name {
            pub const fn key(&self) -> $crate::slots::Key {
                self.0
            }

            pub const fn index(&self) -> u16 {
                self.0.index()
            }
        }

        impl core::fmt::Display for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                write!(f, "{}#{}", stringify!($name), self.0)
            }
        }
    };
}

pub(crate) use object_id;

struct Slot<T> {
    generation: u16,
    value: Option<T>,
}

/// Fixed-capacity slab of control blocks.
pub(crate) struct ObjectPool<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u16>,
}

impl<T> ObjectPool<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.min(u16::MAX as usize);
        let mut slots = Vec::with_capacity(capacity);
        slots.extend((0..capacity).map(|_| Slot {
            generation: 0,
            value: None,
        }));
        // Lowest index is handed out first.
        let free = (0..capacity as u16).rev().collect();
        Self { slots, free }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn insert(&mut self, value: T) -> KernelResult<Key> {
        let index = self.free.pop().ok_or(KernelError::NoMemory)?;
        let slot = &mut self.slots[index as usize];
        slot.value = Some(value);
        Ok(Key::new(index, slot.generation))
    }

    pub fn get(&self, key: Key) -> KernelResult<&T> {
        match self.slots.get(key.index as usize) {
            Some(Slot {
                generation,
                value: Some(value),
            }) if *generation == key.generation => Ok(value),
            _ => Err(KernelError::InvalidHandle),
        }
    }

    pub fn get_mut(&mut self, key: Key) -> KernelResult<&mut T> {
        match self.slots.get_mut(key.index as usize) {
            Some(Slot {
                generation,
                value: Some(value),
            }) if *generation == key.generation => Ok(value),
            _ => Err(KernelError::InvalidHandle),
        }
    }

    pub fn contains(&self, key: Key) -> bool {
        self.get(key).is_ok()
    }

    pub fn remove(&mut self, key: Key) -> KernelResult<T> {
        self.get(key)?;
        let slot = &mut self.slots[key.index as usize];
        slot.generation = slot.generation.wrapping_add(1);
        let value = slot.value.take().ok_or(KernelError::InvalidHandle)?;
        self.free.push(key.index);
        Ok(value)
    }

    /// Raw index access for intrusive links; the caller guarantees liveness.
    pub fn at(&self, index: u16) -> &T {
        self.slots
            .get(index as usize)
            .and_then(|slot| slot.value.as_ref())
            .expect("dangling slot index: kernel invariant broken")
    }

    pub fn at_mut(&mut self, index: u16) -> &mut T {
        self.slots
            .get_mut(index as usize)
            .and_then(|slot| slot.value.as_mut())
            .expect("dangling slot index: kernel invariant broken")
    }

    pub fn try_at(&self, index: u16) -> Option<&T> {
        self.slots.get(index as usize)?.value.as_ref()
    }

    pub fn try_at_mut(&mut self, index: u16) -> Option<&mut T> {
        self.slots.get_mut(index as usize)?.value.as_mut()
    }

    /// Handle of the live object at `index`.
    pub fn key_at(&self, index: u16) -> Option<Key> {
        let slot = self.slots.get(index as usize)?;
        slot.value
            .as_ref()
            .map(|_| Key::new(index, slot.generation))
    }

    pub fn iter(&self) -> impl Iterator<Item = (Key, &T)> + '_ {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.value
                .as_ref()
                .map(|value| (Key::new(index as u16, slot.generation), value))
        })
    }
}

/// Fixed table indexed by slot index, parallel to an [`ObjectPool`].
pub(crate) struct SlotTable<T> {
    entries: Vec<T>,
}

impl<T> SlotTable<T> {
    pub fn new(capacity: usize, mut init: impl FnMut() -> T) -> Self {
        let mut entries = Vec::with_capacity(capacity);
        entries.extend((0..capacity).map(|_| init()));
        Self { entries }
    }

    pub fn at(&self, index: u16) -> KernelResult<&T> {
        self.entries
            .get(index as usize)
            .ok_or(KernelError::InvalidHandle)
    }
}

const LIVE: u32 = 1 << 16;

/// Lock-free liveness marker: holds the generation of the bound key.
pub(crate) struct Tag(Atomic32);

impl Tag {
    pub fn new() -> Self {
        Self(Atomic32::new(0))
    }

    pub fn bind(&self, key: Key) {
        self.0.store(LIVE | key.generation as u32);
    }

    pub fn unbind(&self) {
        self.0.store(0);
    }

    pub fn matches(&self, key: Key) -> bool {
        self.0.load() == LIVE | key.generation as u32
    }
}

/// Storage guarded by its own lock, bound to one key at a time.
pub(crate) struct Leaf<T> {
    inner: Mutex<Option<(Key, T)>>,
}

impl<T> Leaf<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(None),
        }
    }

    pub fn bind(&self, key: Key, value: T) {
        *self.inner.lock() = Some((key, value));
    }

    pub fn unbind(&self) -> Option<T> {
        self.inner.lock().take().map(|(_, value)| value)
    }

    pub fn with<R>(&self, key: Key, f: impl FnOnce(&mut T) -> R) -> KernelResult<R> {
        let mut guard = self.inner.lock();
        match guard.as_mut() {
            Some((bound, value)) if *bound == key => Ok(f(value)),
            _ => Err(KernelError::InvalidHandle),
        }
    }
}
