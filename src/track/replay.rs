//! Replay-side index to handle mapping
//!
//! Dense array from the capture's 32-bit indices to the real handles created
//! during replay, plus the reverse direction. Sized up front from the limits
//! sidecar so reads are plain array loads; reads are safe concurrently with
//! writes to other slots.

use {
    crate::stream::NULL_VALUE,
    ash::vk::Handle,
    dashmap::DashMap,
    std::{
        marker::PhantomData,
        sync::atomic::{AtomicU64, Ordering},
    },
};

pub struct ReplayRemap<T> {
    slots: Vec<AtomicU64>,
    reverse: DashMap<u64, u32>,
    _handle: PhantomData<T>,
}

impl<T: Handle> ReplayRemap<T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            reverse: DashMap::new(),
            _handle: PhantomData,
        }
    }

    /// Size the table. Called once, before any concurrent use.
    pub fn resize(&mut self, len: u32) {
        assert!(self.slots.is_empty());
        self.slots = (0..len).map(|_| AtomicU64::new(0)).collect();
    }

    pub fn len(&self) -> usize {
        self.reverse.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reverse.is_empty()
    }

    pub fn capacity(&self) -> u32 {
        self.slots.len() as u32
    }

    /// Store the real handle for an index. The slot must not be taken yet.
    pub fn set(&self, index: u32, handle: T) {
        let raw = handle.as_raw();
        assert_ne!(raw, 0, "cannot map a null handle");
        let prior = self.slots[index as usize].swap(raw, Ordering::Release);
        assert_eq!(prior, 0, "slot {index} set twice");
        self.reverse.insert(raw, index);
    }

    /// Store the real handle for an index, replacing any previous value.
    pub fn replace(&self, index: u32, handle: T) {
        let raw = handle.as_raw();
        self.slots[index as usize].store(raw, Ordering::Release);
        self.reverse.insert(raw, index);
    }

    /// The real handle for an index. [`NULL_VALUE`] maps to the null handle.
    ///
    /// # Panics
    ///
    /// Panics when a real index has no handle stored yet; the caller is
    /// expected to have waited out the cross-thread dependency first.
    pub fn at(&self, index: u32) -> T {
        if index == NULL_VALUE {
            return T::from_raw(0);
        }

        let raw = self.slots[index as usize].load(Ordering::Acquire);
        assert_ne!(raw, 0, "index {index} has no handle yet");

        T::from_raw(raw)
    }

    /// The index behind a real handle. The null handle maps to index 0.
    pub fn index_of(&self, handle: T) -> u32 {
        let raw = handle.as_raw();
        if raw == 0 {
            return 0;
        }

        *self
            .reverse
            .get(&raw)
            .unwrap_or_else(|| panic!("unknown handle {raw:#x}"))
    }

    pub fn contains(&self, index: u32) -> bool {
        index != NULL_VALUE && self.slots[index as usize].load(Ordering::Acquire) != 0
    }

    /// Forget the handle stored at an index.
    pub fn unset(&self, index: u32) {
        if index == NULL_VALUE {
            return;
        }

        let raw = self.slots[index as usize].swap(0, Ordering::Release);
        assert_ne!(raw, 0, "slot {index} was never set");
        self.reverse.remove(&raw);
    }

    pub fn clear(&mut self) {
        self.slots.clear();
        self.reverse.clear();
    }
}

impl<T: Handle> Default for ReplayRemap<T> {
    fn default() -> Self {
        Self::new()
    }
}
