//! RCU-style append-only vector
//!
//! Many readers, rare appends. Readers take the current backing slab through
//! an atomic pointer and index into it without locking; appends run under a
//! mutex and, when the slab is full, publish a doubled slab and retire the
//! old one so outstanding readers stay valid. Elements are heap-allocated
//! once and never move, so a published `&T` is stable for the life of the
//! vector.

use {
    parking_lot::Mutex,
    std::{
        ptr,
        sync::atomic::{AtomicPtr, AtomicU32, Ordering},
    },
};

const INITIAL_CAPACITY: usize = 64;

struct Slab<T> {
    slots: Box<[AtomicPtr<T>]>,
}

impl<T> Slab<T> {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| AtomicPtr::new(ptr::null_mut())).collect(),
        }
    }
}

/// Append-only vector of pointer-stable elements.
pub struct TraceVec<T> {
    len: AtomicU32,
    current: AtomicPtr<Slab<T>>,
    writer: Mutex<Vec<*mut Slab<T>>>,
}

// Raw slab pointers are only ever dereferenced through the publication
// protocol below; elements themselves cross threads.
unsafe impl<T: Send + Sync> Send for TraceVec<T> {}
unsafe impl<T: Send + Sync> Sync for TraceVec<T> {}

impl<T> TraceVec<T> {
    pub fn new() -> Self {
        let slab = Box::into_raw(Box::new(Slab::with_capacity(INITIAL_CAPACITY)));

        Self {
            len: AtomicU32::new(0),
            current: AtomicPtr::new(slab),
            writer: Mutex::new(Vec::new()),
        }
    }

    /// Number of published elements.
    pub fn len(&self) -> u32 {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read a published element. Lock-free.
    ///
    /// # Panics
    ///
    /// Panics if `index` has not been published yet.
    pub fn at(&self, index: u32) -> &T {
        let len = self.len.load(Ordering::Acquire);
        assert!(index < len, "index {index} out of bounds (len {len})");

        // The acquire on len synchronizes with the release in push(), which
        // ordered both the element store and any slab swap before it.
        let slab = unsafe { &*self.current.load(Ordering::Acquire) };
        let element = slab.slots[index as usize].load(Ordering::Acquire);
        debug_assert!(!element.is_null());

        unsafe { &*element }
    }

    /// Append an element, returning its index and a stable reference.
    pub fn push(&self, value: T) -> (u32, &T) {
        let mut retired = self.writer.lock();

        let len = self.len.load(Ordering::Relaxed) as usize;
        let slab_ptr = self.current.load(Ordering::Relaxed);
        let slab = unsafe { &*slab_ptr };
        let slab = if len == slab.slots.len() {
            let bigger = Slab::<T>::with_capacity(len * 2);
            for (slot, old) in bigger.slots.iter().zip(slab.slots.iter()) {
                slot.store(old.load(Ordering::Relaxed), Ordering::Relaxed);
            }
            let bigger = Box::into_raw(Box::new(bigger));
            self.current.store(bigger, Ordering::Release);
            retired.push(slab_ptr);
            unsafe { &*bigger }
        } else {
            slab
        };

        let element = Box::into_raw(Box::new(value));
        slab.slots[len].store(element, Ordering::Release);
        self.len.store(len as u32 + 1, Ordering::Release);

        (len as u32, unsafe { &*element })
    }

    /// Iterate the published elements. Elements pushed concurrently with the
    /// iteration may or may not be seen.
    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        (0..self.len()).map(move |index| self.at(index))
    }

    /// Drop all elements and retired slabs. Exclusive access required, which
    /// the receiver type guarantees.
    pub fn clear(&mut self) {
        let len = self.len.load(Ordering::Relaxed) as usize;
        let slab = unsafe { &*self.current.load(Ordering::Relaxed) };
        for slot in slab.slots.iter().take(len) {
            let element = slot.swap(ptr::null_mut(), Ordering::Relaxed);
            if !element.is_null() {
                drop(unsafe { Box::from_raw(element) });
            }
        }
        for retired in self.writer.get_mut().drain(..) {
            drop(unsafe { Box::from_raw(retired) });
        }
        self.len.store(0, Ordering::Release);
    }
}

impl<T> Default for TraceVec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for TraceVec<T> {
    fn drop(&mut self) {
        self.clear();
        drop(unsafe { Box::from_raw(self.current.load(Ordering::Relaxed)) });
    }
}

#[cfg(test)]
mod tests {
    use {super::*, std::sync::Arc, std::thread};

    #[test]
    fn push_and_read() {
        let vec = TraceVec::new();
        for value in 0..1000u64 {
            let (index, stored) = vec.push(value);
            assert_eq!(index, value as u32);
            assert_eq!(*stored, value);
        }
        assert_eq!(vec.len(), 1000);
        for index in 0..1000u32 {
            assert_eq!(*vec.at(index), index as u64);
        }
    }

    #[test]
    fn references_survive_growth() {
        let vec = TraceVec::new();
        let (_, first) = vec.push(42u64);
        for value in 0..4096u64 {
            vec.push(value);
        }
        // the slab has been doubled several times by now
        assert_eq!(*first, 42);
        assert_eq!(*vec.at(0), 42);
    }

    #[test]
    fn concurrent_readers_see_published_values() {
        let vec = Arc::new(TraceVec::new());
        let writer = Arc::clone(&vec);
        let producer = thread::spawn(move || {
            for value in 0..10_000u64 {
                writer.push(value);
            }
        });

        let mut seen = 0;
        while seen < 10_000 {
            let len = vec.len();
            for index in seen..len {
                assert_eq!(*vec.at(index), index as u64);
            }
            seen = len;
        }
        producer.join().unwrap();
    }

    #[test]
    fn clear_resets() {
        let mut vec = TraceVec::new();
        for value in 0..100u32 {
            vec.push(value);
        }
        vec.clear();
        assert_eq!(vec.len(), 0);
        vec.push(7u32);
        assert_eq!(*vec.at(0), 7);
    }
}
