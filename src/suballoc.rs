//! Vulkan memory suballocator
//!
//! Replay packs objects into large device memory heaps instead of mirroring
//! the application's allocation pattern. Each thread owns its own set of
//! heaps; only the owning thread ever places into or reclaims from a heap,
//! so lookups stay lock-light. Frees may arrive from any thread and are
//! queued onto the owning heap, to be reclaimed the next time an allocation
//! visits it.
//!
//! Device memory itself comes from an external collaborator behind
//! [`DeviceMemoryOps`]; this module decides placement only.

use {
    crate::stream::NULL_VALUE,
    ash::vk::{self, Handle},
    log::{debug, error, trace},
    parking_lot::{Mutex, RwLock},
    std::sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

/// Default heap size: 32 MiB.
pub const DEFAULT_HEAP_SIZE: vk::DeviceSize = 1024 * 1024 * 32;

// 1 GiB allocation ceiling, for sanity's sake
const MAX_ALLOCATION: vk::DeviceSize = 1024 * 1024 * 1024;

pub const fn aligned_size(size: u64, alignment: u64) -> u64 {
    size + alignment - 1 - (size + alignment - 1) % alignment
}

/// What kind of resource a sub-allocation backs.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ResourceKind {
    Image,
    Buffer,
    Tensor,
}

/// A device memory allocation request passed out to the collaborator.
#[derive(Clone, Copy, Debug)]
pub struct HeapAllocation {
    pub size: vk::DeviceSize,
    pub memory_type_index: u32,
    pub allocate_flags: vk::MemoryAllocateFlags,

    /// Set when the allocation must be dedicated to one object; carries the
    /// raw handle for the dedicated-allocation info chain.
    pub dedicated: Option<(ResourceKind, u64)>,
}

/// The five external entry points the suballocator needs.
pub trait DeviceMemoryOps: Send + Sync {
    /// Allocate device memory, or `None` when the device is out of memory.
    fn allocate(&self, info: &HeapAllocation) -> Option<vk::DeviceMemory>;

    fn free(&self, memory: vk::DeviceMemory);
}

/// One placement request.
#[derive(Clone, Copy, Debug)]
pub struct AllocationRequest {
    pub kind: ResourceKind,

    /// Dense index of the object; drives the lookup table.
    pub index: u32,

    /// Raw object handle, forwarded for dedicated allocations.
    pub handle: u64,

    pub size: vk::DeviceSize,
    pub alignment: vk::DeviceSize,
    pub memory_type_bits: u32,
    pub property_flags: vk::MemoryPropertyFlags,
    pub tiling: vk::ImageTiling,
    pub prefers_dedicated: bool,
    pub allocate_flags: vk::MemoryAllocateFlags,
}

/// Where an object ended up.
#[derive(Clone, Copy, Debug)]
pub struct Location {
    pub memory: vk::DeviceMemory,
    pub offset: vk::DeviceSize,
    pub size: vk::DeviceSize,

    /// True exactly once, the first time the object's memory is looked up.
    pub needs_init: bool,

    /// The memory type is not host coherent, so writes require a flush.
    pub needs_flush: bool,
}

#[derive(Clone, Copy, Debug)]
struct Sub {
    kind: ResourceKind,
    index: u32,
    offset: vk::DeviceSize,
    size: vk::DeviceSize,
}

struct HeapInner {
    free: vk::DeviceSize,

    /// Sorted by offset. Only the owning thread mutates this, under the lock.
    subs: Vec<Sub>,
}

struct Heap {
    tid: u16,
    memory_type_index: u32,
    tiling: vk::ImageTiling,
    memory: vk::DeviceMemory,
    total: vk::DeviceSize,
    inner: Mutex<HeapInner>,

    /// Cross-thread free queue; reclaimed when an allocation visits the heap.
    deletes: Mutex<Vec<vk::DeviceSize>>,
}

struct Placement {
    heap: Arc<Heap>,
    offset: vk::DeviceSize,
    size: vk::DeviceSize,
}

#[derive(Default)]
struct LookupSlot {
    place: Mutex<Option<Placement>>,
    initialized: AtomicBool,
}

/// The per-thread GPU memory pool set.
pub struct Suballocator {
    min_heap_size: vk::DeviceSize,
    properties: vk::PhysicalDeviceMemoryProperties,
    heaps: RwLock<Vec<Arc<Heap>>>,
    virtual_swap: Mutex<Vec<vk::DeviceMemory>>,
    images: Vec<LookupSlot>,
    buffers: Vec<LookupSlot>,
    tensors: Vec<LookupSlot>,
    ops: Arc<dyn DeviceMemoryOps>,
}

impl Suballocator {
    /// Size the lookup tables from the trace limits and take the device's
    /// memory properties. Heap size -1 semantics are handled by the caller
    /// passing [`DEFAULT_HEAP_SIZE`].
    pub fn new(
        ops: Arc<dyn DeviceMemoryOps>,
        properties: vk::PhysicalDeviceMemoryProperties,
        num_images: u32,
        num_buffers: u32,
        num_tensors: u32,
        min_heap_size: vk::DeviceSize,
    ) -> Self {
        Self {
            min_heap_size,
            properties,
            heaps: RwLock::new(Vec::new()),
            virtual_swap: Mutex::new(Vec::new()),
            images: (0..num_images).map(|_| LookupSlot::default()).collect(),
            buffers: (0..num_buffers).map(|_| LookupSlot::default()).collect(),
            tensors: (0..num_tensors).map(|_| LookupSlot::default()).collect(),
            ops,
        }
    }

    fn slots(&self, kind: ResourceKind) -> &[LookupSlot] {
        match kind {
            ResourceKind::Image => &self.images,
            ResourceKind::Buffer => &self.buffers,
            ResourceKind::Tensor => &self.tensors,
        }
    }

    fn needs_flush(&self, memory_type_index: u32) -> bool {
        !self.properties.memory_types[memory_type_index as usize]
            .property_flags
            .contains(vk::MemoryPropertyFlags::HOST_COHERENT)
    }

    fn type_flags(&self, memory_type_index: u32) -> vk::MemoryPropertyFlags {
        self.properties.memory_types[memory_type_index as usize].property_flags
    }

    /// Pick a memory type matching the filter and property request. Retries
    /// once with the optional cached/lazy bits stripped before giving up.
    fn find_memory_type(&self, type_filter: u32, properties: &mut vk::MemoryPropertyFlags) -> u32 {
        for _ in 0..2 {
            for i in 0..self.properties.memory_type_count {
                if type_filter & (1 << i) != 0
                    && self.properties.memory_types[i as usize]
                        .property_flags
                        .contains(*properties)
                {
                    return i;
                }
            }
            // Oops, try to simplify our request!
            *properties &= !(vk::MemoryPropertyFlags::HOST_CACHED
                | vk::MemoryPropertyFlags::LAZILY_ALLOCATED);
        }
        self.dump();
        panic!(
            "failed to find required memory type (filter={type_filter:#x}, props={properties:?})"
        );
    }

    fn set_place(&self, kind: ResourceKind, index: u32, place: Placement) {
        assert!(place.offset + place.size <= place.heap.total);
        *self.slots(kind)[index as usize].place.lock() = Some(place);
    }

    fn new_heap(
        &self,
        tid: u16,
        req: &AllocationRequest,
        memory_type_index: u32,
        bind: &mut dyn FnMut(vk::DeviceMemory, vk::DeviceSize, vk::DeviceSize),
    ) -> Location {
        let dedicated = req.prefers_dedicated;
        let size = if dedicated {
            req.size
        } else {
            self.min_heap_size.max(req.size)
        };
        assert!(size < MAX_ALLOCATION);

        let info = HeapAllocation {
            size,
            memory_type_index,
            allocate_flags: req.allocate_flags,
            dedicated: dedicated.then_some((req.kind, req.handle)),
        };
        let memory = self.ops.allocate(&info).unwrap_or_else(|| {
            self.dump();
            panic!(
                "failed to allocate {size} bytes of memory for memory type {memory_type_index} and tiling {:?}",
                req.tiling
            );
        });

        debug!(
            "allocating new memory pool with size={size} free={} (memoryTypeIndex={memory_type_index}, tiling={:?})",
            size - req.size,
            req.tiling
        );

        let heap = Arc::new(Heap {
            tid,
            memory_type_index,
            tiling: req.tiling,
            memory,
            total: size,
            inner: Mutex::new(HeapInner {
                free: size - req.size,
                subs: vec![Sub {
                    kind: req.kind,
                    index: req.index,
                    offset: 0,
                    size: req.size,
                }],
            }),
            deletes: Mutex::new(Vec::new()),
        });
        self.heaps.write().push(Arc::clone(&heap));
        self.set_place(
            req.kind,
            req.index,
            Placement {
                heap,
                offset: 0,
                size: req.size,
            },
        );
        bind(memory, 0, req.size);

        Location {
            memory,
            offset: 0,
            size: req.size,
            needs_init: true,
            needs_flush: self.needs_flush(memory_type_index),
        }
    }

    /// This is a safe time to actually delete things: only the allocating
    /// walk visits a heap's sub list.
    fn process_deletes(&self, heap: &Heap, inner: &mut HeapInner) {
        let pending: Vec<_> = heap.deletes.lock().drain(..).collect();
        for offset in pending {
            if let Some(at) = inner.subs.iter().position(|s| s.offset == offset) {
                inner.free += inner.subs[at].size;
                trace!(
                    "finalized delete in heap off={offset} size={}, total free is {}",
                    inner.subs[at].size,
                    inner.free
                );
                inner.subs.remove(at);
            }
        }
    }

    /// Place an object, preferring existing heaps of this thread before
    /// allocating a new one. The `bind` callback receives the chosen
    /// `(memory, offset, size)` so the caller can issue the bind call.
    #[profiling::function]
    pub fn add(
        &self,
        tid: u16,
        req: &AllocationRequest,
        mut bind: impl FnMut(vk::DeviceMemory, vk::DeviceSize, vk::DeviceSize),
    ) -> Location {
        let mut flags = req.property_flags;
        if flags.intersects(
            vk::MemoryPropertyFlags::HOST_COHERENT | vk::MemoryPropertyFlags::HOST_CACHED,
        ) {
            // do not require this bit in these cases
            flags &= !vk::MemoryPropertyFlags::DEVICE_LOCAL;
        }
        let memory_type_index = self.find_memory_type(req.memory_type_bits, &mut flags);

        if req.prefers_dedicated {
            return self.new_heap(tid, req, memory_type_index, &mut bind);
        }

        let heaps: Vec<Arc<Heap>> = self.heaps.read().clone();
        for heap in &heaps {
            let mut inner = heap.inner.lock();
            self.process_deletes(heap, &mut inner);

            if heap.tid != tid
                || heap.memory_type_index != memory_type_index
                || heap.tiling != req.tiling
                || !self.type_flags(heap.memory_type_index).contains(flags)
                || inner.free < req.size
            {
                continue;
            }

            if let Some(offset) = place_in(&mut inner, heap.total, req) {
                inner.free -= req.size;
                trace!(
                    "inserting object into memory at offset={offset} size={}, free is {}",
                    req.size,
                    inner.free
                );
                drop(inner);
                self.set_place(
                    req.kind,
                    req.index,
                    Placement {
                        heap: Arc::clone(heap),
                        offset,
                        size: req.size,
                    },
                );
                bind(heap.memory, offset, req.size);

                return Location {
                    memory: heap.memory,
                    offset,
                    size: req.size,
                    needs_init: true,
                    needs_flush: self.needs_flush(memory_type_index),
                };
            }
        }

        // if we get here, we need to create another heap
        self.new_heap(tid, req, memory_type_index, &mut bind)
    }

    /// Queue a free onto the owning heap. Safe from any thread; it is also
    /// possible to delete something that has not been bound yet.
    pub fn del(&self, kind: ResourceKind, index: u32) {
        if index == NULL_VALUE {
            return;
        }

        trace!("deleting {kind:?}={index}");
        let mut slot = self.slots(kind)[index as usize].place.lock();
        if let Some(place) = slot.take() {
            place.heap.deletes.lock().push(place.offset);
        }
    }

    /// Where an object's memory lives. `needs_init` is set the first time an
    /// object is looked up.
    pub fn find_memory(&self, kind: ResourceKind, index: u32) -> Location {
        let slot = &self.slots(kind)[index as usize];
        let guard = slot.place.lock();
        let Some(place) = guard.as_ref() else {
            drop(guard);
            self.dump();
            panic!("{kind:?} {index} is missing its memory!");
        };
        let needs_init = !slot.initialized.swap(true, Ordering::Relaxed);

        Location {
            memory: place.heap.memory,
            offset: place.offset,
            size: place.size,
            needs_init,
            needs_flush: self.needs_flush(place.heap.memory_type_index),
        }
    }

    pub fn find_image_memory(&self, index: u32) -> Location {
        self.find_memory(ResourceKind::Image, index)
    }

    pub fn find_buffer_memory(&self, index: u32) -> Location {
        self.find_memory(ResourceKind::Buffer, index)
    }

    pub fn find_tensor_memory(&self, index: u32) -> Location {
        self.find_memory(ResourceKind::Tensor, index)
    }

    /// Bind virtual swapchain images into one fresh allocation, or one
    /// dedicated allocation per image. These heaps have a disjoint lifetime
    /// from the pooled ones.
    pub fn add_virtual_swapchain_images(
        &self,
        handles: &[u64],
        size: vk::DeviceSize,
        alignment: vk::DeviceSize,
        memory_type_bits: u32,
        dedicated: bool,
        mut bind: impl FnMut(usize, vk::DeviceMemory, vk::DeviceSize),
    ) {
        let mut flags = vk::MemoryPropertyFlags::DEVICE_LOCAL;
        let memory_type_index = self.find_memory_type(memory_type_bits, &mut flags);
        let image_size = aligned_size(size, alignment);

        if dedicated {
            for (at, &handle) in handles.iter().enumerate() {
                let info = HeapAllocation {
                    size: image_size,
                    memory_type_index,
                    allocate_flags: vk::MemoryAllocateFlags::empty(),
                    dedicated: Some((ResourceKind::Image, handle)),
                };
                let memory = self.ops.allocate(&info).unwrap_or_else(|| {
                    panic!("failed to allocate dedicated memory for virtual swapchain!")
                });
                self.virtual_swap.lock().push(memory);
                bind(at, memory, 0);
            }
        } else {
            let info = HeapAllocation {
                size: image_size * handles.len() as u64,
                memory_type_index,
                allocate_flags: vk::MemoryAllocateFlags::empty(),
                dedicated: None,
            };
            let memory = self
                .ops
                .allocate(&info)
                .unwrap_or_else(|| panic!("failed to allocate memory for virtual swapchain!"));
            self.virtual_swap.lock().push(memory);
            for at in 0..handles.len() {
                bind(at, memory, at as u64 * image_size);
            }
        }
    }

    /// Free every heap and clear the lookup tables.
    pub fn destroy(&mut self) {
        for heap in self.heaps.get_mut().drain(..) {
            self.ops.free(heap.memory);
        }
        for memory in self.virtual_swap.get_mut().drain(..) {
            self.ops.free(memory);
        }
        for slot in self
            .images
            .iter_mut()
            .chain(self.buffers.iter_mut())
            .chain(self.tensors.iter_mut())
        {
            *slot.place.get_mut() = None;
            *slot.initialized.get_mut() = false;
        }
    }

    /// Dump the allocator state to the diagnostic sink.
    pub fn dump(&self) {
        error!("SUBALLOCATOR CONTENTS");
        for (kind, slots) in [
            (ResourceKind::Image, &self.images),
            (ResourceKind::Buffer, &self.buffers),
            (ResourceKind::Tensor, &self.tensors),
        ] {
            error!("{kind:?}s:");
            for (index, slot) in slots.iter().enumerate() {
                if let Some(place) = slot.place.lock().as_ref() {
                    error!(
                        "\t{index}: memory={:#x} offset={} size={}",
                        place.heap.memory.as_raw(),
                        place.offset,
                        place.size
                    );
                }
            }
        }
        error!("Heaps:");
        for heap in self.heaps.read().iter() {
            let inner = heap.inner.lock();
            error!(
                "\ttid={} type={} mem={:#x} free={} total={} subs={} deletes={}",
                heap.tid,
                heap.memory_type_index,
                heap.memory.as_raw(),
                inner.free,
                heap.total,
                inner.subs.len(),
                heap.deletes.lock().len()
            );
        }
    }

    /// Number of heaps currently alive, virtual swapchain ones excluded.
    pub fn heap_count(&self) -> usize {
        self.heaps.read().len()
    }

    /// Walk all heaps verifying non-overlap, monotonic offsets, lookup
    /// consistency, and `free + used == total`. Returns the number of live
    /// sub-allocations checked.
    pub fn self_test(&self) -> usize {
        let mut live = 0;
        for heap in self.heaps.read().iter() {
            let inner = heap.inner.lock();
            let deletes = heap.deletes.lock().clone();

            let mut freed = inner.subs.first().map(|s| s.offset).unwrap_or(heap.total);
            let mut used = 0;
            let mut prev_end: Option<vk::DeviceSize> = None;
            assert!(inner.free <= heap.total);

            for sub in &inner.subs {
                assert!(sub.size > 0);
                if let Some(prev) = prev_end {
                    assert!(sub.offset >= prev, "overlapping sub-allocations");
                    freed += sub.offset - prev;
                }
                used += sub.size;
                prev_end = Some(sub.offset + sub.size);

                // pending deletes have already left the lookup table
                if deletes.contains(&sub.offset) {
                    continue;
                }

                let slot = &self.slots(sub.kind)[sub.index as usize];
                let place = slot.place.lock();
                let place = place.as_ref().expect("sub-allocation missing its lookup");
                assert_eq!(place.heap.memory, heap.memory);
                assert_eq!(place.offset, sub.offset);
                assert_eq!(place.size, sub.size);
                live += 1;
            }
            if let Some(prev) = prev_end {
                freed += heap.total - prev;
            }
            assert_eq!(inner.free, freed, "free byte accounting is off");
            assert_eq!(freed + used, heap.total);
        }

        live
    }
}

/// Try the placements in order: the front, aligned holes between neighbors,
/// then the end slack. Front placement needs no alignment: allocations
/// returned by the driver are guaranteed to meet any alignment requirement.
fn place_in(inner: &mut HeapInner, total: vk::DeviceSize, req: &AllocationRequest) -> Option<u64> {
    if inner.subs.is_empty() || inner.subs[0].offset >= req.size {
        inner.subs.insert(
            0,
            Sub {
                kind: req.kind,
                index: req.index,
                offset: 0,
                size: req.size,
            },
        );
        return Some(0);
    }

    for at in 0..inner.subs.len() {
        let start = inner.subs[at].offset + inner.subs[at].size;
        let limit = inner
            .subs
            .get(at + 1)
            .map(|next| next.offset)
            .unwrap_or(total);
        let aligned = aligned_size(start, req.alignment.max(1));
        if aligned + req.size <= limit {
            inner.subs.insert(
                at + 1,
                Sub {
                    kind: req.kind,
                    index: req.index,
                    offset: aligned,
                    size: req.size,
                },
            );
            return Some(aligned);
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        std::sync::atomic::{AtomicU64, Ordering},
    };

    struct FakeOps {
        next: AtomicU64,
        freed: Mutex<Vec<vk::DeviceMemory>>,
    }

    impl FakeOps {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                next: AtomicU64::new(1),
                freed: Mutex::new(Vec::new()),
            })
        }
    }

    impl DeviceMemoryOps for FakeOps {
        fn allocate(&self, _info: &HeapAllocation) -> Option<vk::DeviceMemory> {
            Some(vk::DeviceMemory::from_raw(
                self.next.fetch_add(1, Ordering::Relaxed),
            ))
        }

        fn free(&self, memory: vk::DeviceMemory) {
            self.freed.lock().push(memory);
        }
    }

    fn host_visible_properties() -> vk::PhysicalDeviceMemoryProperties {
        let mut properties = vk::PhysicalDeviceMemoryProperties::default();
        properties.memory_type_count = 2;
        properties.memory_types[0].property_flags = vk::MemoryPropertyFlags::DEVICE_LOCAL;
        properties.memory_types[1].property_flags =
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        properties
    }

    fn buffer_request(index: u32, size: u64) -> AllocationRequest {
        AllocationRequest {
            kind: ResourceKind::Buffer,
            index,
            handle: index as u64 + 1,
            size,
            alignment: 256,
            memory_type_bits: 0b10,
            property_flags: vk::MemoryPropertyFlags::HOST_VISIBLE,
            tiling: vk::ImageTiling::LINEAR,
            prefers_dedicated: false,
            allocate_flags: vk::MemoryAllocateFlags::empty(),
        }
    }

    #[test]
    fn packs_into_one_heap() {
        let alloc = Suballocator::new(
            FakeOps::new(),
            host_visible_properties(),
            16,
            16,
            0,
            DEFAULT_HEAP_SIZE,
        );
        for index in 0..10 {
            alloc.add(0, &buffer_request(index, 4096), |_, _, _| ());
        }
        assert_eq!(alloc.heap_count(), 1);
        assert_eq!(alloc.self_test(), 10);

        let location = alloc.find_buffer_memory(0);
        assert!(location.needs_init);
        assert!(!location.needs_flush);
        let location = alloc.find_buffer_memory(0);
        assert!(!location.needs_init);
    }

    #[test]
    fn deferred_free_reclaims_before_new_heap() {
        let alloc = Arc::new(Suballocator::new(
            FakeOps::new(),
            host_visible_properties(),
            16,
            16,
            0,
            DEFAULT_HEAP_SIZE,
        ));
        for index in 0..10 {
            alloc.add(0, &buffer_request(index, 1024 * 1024), |_, _, _| ());
        }
        assert_eq!(alloc.heap_count(), 1);

        // free the middle five from a non-owning thread
        let other = Arc::clone(&alloc);
        std::thread::spawn(move || {
            for index in 3..8 {
                other.del(ResourceKind::Buffer, index);
            }
        })
        .join()
        .unwrap();

        // same-size allocations must reuse the reclaimed space
        for index in 10..15 {
            alloc.add(0, &buffer_request(index, 1024 * 1024), |_, _, _| ());
        }
        assert_eq!(alloc.heap_count(), 1);
        assert_eq!(alloc.self_test(), 10);
    }

    #[test]
    fn dedicated_gets_its_own_heap() {
        let alloc = Suballocator::new(
            FakeOps::new(),
            host_visible_properties(),
            16,
            16,
            0,
            DEFAULT_HEAP_SIZE,
        );
        alloc.add(0, &buffer_request(0, 4096), |_, _, _| ());
        let mut request = buffer_request(1, 4096);
        request.prefers_dedicated = true;
        let location = alloc.add(0, &request, |_, _, _| ());
        assert_eq!(location.offset, 0);
        assert_eq!(alloc.heap_count(), 2);
        alloc.self_test();
    }

    #[test]
    fn threads_do_not_share_heaps() {
        let alloc = Suballocator::new(
            FakeOps::new(),
            host_visible_properties(),
            16,
            16,
            0,
            DEFAULT_HEAP_SIZE,
        );
        alloc.add(0, &buffer_request(0, 4096), |_, _, _| ());
        alloc.add(1, &buffer_request(1, 4096), |_, _, _| ());
        assert_eq!(alloc.heap_count(), 2);
        alloc.self_test();
    }

    #[test]
    fn alignment_is_respected() {
        let alloc = Suballocator::new(
            FakeOps::new(),
            host_visible_properties(),
            16,
            16,
            0,
            DEFAULT_HEAP_SIZE,
        );
        let mut request = buffer_request(0, 100);
        request.alignment = 4096;
        alloc.add(0, &request, |_, _, _| ());
        let mut request = buffer_request(1, 100);
        request.alignment = 4096;
        let location = alloc.add(0, &request, |_, offset, _| {
            assert_eq!(offset % 4096, 0);
        });
        assert_eq!(location.offset % 4096, 0);
        alloc.self_test();
    }

    #[test]
    fn bind_callback_sees_the_placement() {
        let alloc = Suballocator::new(
            FakeOps::new(),
            host_visible_properties(),
            16,
            16,
            0,
            DEFAULT_HEAP_SIZE,
        );
        let mut seen = None;
        let location = alloc.add(0, &buffer_request(0, 4096), |memory, offset, size| {
            seen = Some((memory, offset, size));
        });
        assert_eq!(
            seen,
            Some((location.memory, location.offset, location.size))
        );
    }

    #[test]
    fn virtual_swapchain_is_disjoint() {
        let alloc = Suballocator::new(
            FakeOps::new(),
            host_visible_properties(),
            16,
            16,
            0,
            DEFAULT_HEAP_SIZE,
        );
        let mut binds = Vec::new();
        alloc.add_virtual_swapchain_images(&[11, 12, 13], 1000, 256, 0b01, false, |at, _, offset| {
            binds.push((at, offset));
        });
        assert_eq!(binds, vec![(0, 0), (1, 1024), (2, 2048)]);
        assert_eq!(alloc.heap_count(), 0);
    }

    #[test]
    fn destroy_frees_everything() {
        let ops = FakeOps::new();
        let mut alloc = Suballocator::new(
            Arc::clone(&ops) as Arc<dyn DeviceMemoryOps>,
            host_visible_properties(),
            16,
            16,
            0,
            DEFAULT_HEAP_SIZE,
        );
        alloc.add(0, &buffer_request(0, 4096), |_, _, _| ());
        alloc.add_virtual_swapchain_images(&[1], 100, 64, 0b01, true, |_, _, _| ());
        alloc.destroy();
        assert_eq!(ops.freed.lock().len(), 2);
        assert_eq!(alloc.heap_count(), 0);
    }
}
