//! Capture-side handle to record mapping
//!
//! Maps opaque Vulkan handles to pointer-stable records. Inserts of distinct
//! keys may run concurrently with lookups; reads are lock-free. A destroyed
//! handle keeps its record (for post-mortem iteration and the sidecar
//! snapshot) but its map entry turns into a null sentinel.

use {
    super::{vector::TraceVec, Tracked},
    dashmap::DashMap,
    parking_lot::{Mutex, RwLock},
};

/// Map slot: the record's dense index, or `None` once the handle was
/// destroyed.
type Slot = Option<u32>;

pub struct TraceRemap<T> {
    lookup: DashMap<u64, Slot>,
    storage: TraceVec<RwLock<T>>,
    insert: Mutex<()>,
}

impl<T: Tracked> TraceRemap<T> {
    pub fn new() -> Self {
        Self {
            lookup: DashMap::new(),
            storage: TraceVec::new(),
            insert: Mutex::new(()),
        }
    }

    /// Register a new handle. The record gets the next dense index and its
    /// creation frame stamped.
    ///
    /// # Panics
    ///
    /// Panics on the null handle or when the handle is already live.
    pub fn add(&self, handle: u64, frame: u32) -> &RwLock<T> {
        let _guard = self.insert.lock();
        assert_ne!(handle, 0, "cannot track the null handle");

        let mut record = T::default();
        let (index, _) = {
            let base = record.base_mut();
            base.creation.frame = frame;
            base.last_modified.frame = frame;
            let index = self.storage.len();
            base.index = index;
            base.enter_created();
            self.storage.push(RwLock::new(record))
        };

        let prior = self.lookup.insert(handle, Some(index));
        assert!(
            !matches!(prior, Some(Some(_))),
            "handle {handle:#x} inserted twice"
        );

        self.storage.at(index)
    }

    /// Stamp the record destroyed and null out the map entry. The record and
    /// its index stay reserved forever.
    pub fn unset(&self, handle: u64, frame: u32) -> Option<&RwLock<T>> {
        if handle == 0 {
            return None;
        }

        let index = {
            let mut slot = self.lookup.get_mut(&handle)?;
            slot.take()?
        };
        let record = self.storage.at(index);
        {
            let mut record = record.write();
            let base = record.base_mut();
            base.destroyed.frame = frame;
            base.enter_destroyed();
        }

        Some(record)
    }

    /// Look a live handle up. Lock-free relative to inserts of other keys.
    pub fn at(&self, handle: u64) -> Option<&RwLock<T>> {
        let index = (*self.lookup.get(&handle)?)?;

        Some(self.storage.at(index))
    }

    /// Look any handle up, destroyed ones included.
    pub fn index_of(&self, handle: u64) -> Option<u32> {
        *self.lookup.get(&handle)?
    }

    pub fn contains(&self, handle: u64) -> bool {
        handle != 0 && self.lookup.get(&handle).map(|slot| slot.is_some()).unwrap_or(false)
    }

    /// Fetch a record by its dense index, live or destroyed.
    pub fn at_index(&self, index: u32) -> &RwLock<T> {
        self.storage.at(index)
    }

    /// Number of records ever created.
    pub fn len(&self) -> u32 {
        self.storage.len()
    }

    pub fn is_empty(&self) -> bool {
        self.storage.is_empty()
    }

    /// Iterate all records in index order. Only safe for consistent results
    /// once concurrent inserts have stopped.
    pub fn iter(&self) -> impl Iterator<Item = &RwLock<T>> + '_ {
        self.storage.iter()
    }

    /// Drop everything. Single-threaded by construction (`&mut`).
    pub fn clear(&mut self) {
        self.lookup.clear();
        self.storage.clear();
    }
}

impl<T: Tracked> Default for TraceRemap<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::track::MemoryRecord,
        std::sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
    };

    #[test]
    fn indices_follow_insertion_order() {
        let remap = TraceRemap::<MemoryRecord>::new();
        for handle in 1..=2048u64 {
            let record = remap.add(handle, handle as u32);
            assert_eq!(record.read().base.index, handle as u32 - 1);
        }
        for handle in 1..=2048u64 {
            let record = remap.at(handle).unwrap();
            assert_eq!(record.read().base.creation.frame, handle as u32);
        }
        assert_eq!(remap.len(), 2048);
    }

    #[test]
    fn unset_keeps_the_record() {
        let remap = TraceRemap::<MemoryRecord>::new();
        remap.add(0x1000, 0);
        remap.add(0x2000, 0);
        remap.unset(0x1000, 7).unwrap();

        assert!(!remap.contains(0x1000));
        assert!(remap.at(0x1000).is_none());
        assert!(remap.contains(0x2000));

        // post-mortem iteration still sees both
        assert_eq!(remap.iter().count(), 2);
        let dead = remap.at_index(0);
        assert!(dead.read().base.is_destroyed());
        assert_eq!(dead.read().base.destroyed.frame, 7);

        // the index is never reused
        remap.add(0x3000, 0);
        assert_eq!(remap.at(0x3000).unwrap().read().base.index, 2);
    }

    #[test]
    #[should_panic]
    fn double_add_is_forbidden() {
        let remap = TraceRemap::<MemoryRecord>::new();
        remap.add(0x1000, 0);
        remap.add(0x1000, 0);
    }

    #[test]
    fn concurrent_adds_of_distinct_keys() {
        let remap = Arc::new(TraceRemap::<MemoryRecord>::new());
        let stop = Arc::new(AtomicBool::new(false));

        let reader = {
            let remap = Arc::clone(&remap);
            let stop = Arc::clone(&stop);
            std::thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    for handle in (1..1000u64).step_by(7) {
                        if let Some(record) = remap.at(handle) {
                            assert!(record.read().base.index < 1000);
                        }
                    }
                }
            })
        };

        let writers: Vec<_> = (0..4)
            .map(|lane| {
                let remap = Arc::clone(&remap);
                std::thread::spawn(move || {
                    for handle in (1..1000u64).filter(|h| h % 4 == lane) {
                        remap.add(handle, 0);
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }
        stop.store(true, Ordering::Relaxed);
        reader.join().unwrap();

        // indices are dense and unique
        let mut seen = vec![false; remap.len() as usize];
        for record in remap.iter() {
            let index = record.read().base.index as usize;
            assert!(!seen[index]);
            seen[index] = true;
        }
        assert!(seen.iter().all(|&v| v));
    }
}
