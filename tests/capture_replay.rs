//! End-to-end capture and replay: traces written by the capture coordinator
//! must replay deterministically, including cross-thread handle dependencies
//! and differential memory updates.

use {
    ash::vk::{self, Handle},
    lava::{
        capture::Tracer,
        config::{CaptureInfo, ReplayInfo},
        memscan::{self, FlushReason},
        replay::{FunctionRegistry, HostMemoryWindow, Player, UpdateCallback},
        stream::Compression,
        suballoc::{
            AllocationRequest, DeviceMemoryOps, HeapAllocation, Location, ResourceKind,
            DEFAULT_HEAP_SIZE,
        },
        track::{
            address::{find_address_candidates, AddressRemapper},
            fake_handle, AliasRef, BufferRecord, ChangeSource,
        },
    },
    parking_lot::Mutex,
    std::{
        sync::{
            atomic::{AtomicBool, AtomicU64, Ordering},
            mpsc, Arc,
        },
        thread,
        time::Duration,
    },
};

struct FakeOps {
    next: AtomicU64,
}

impl FakeOps {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            next: AtomicU64::new(1),
        })
    }
}

impl DeviceMemoryOps for FakeOps {
    fn allocate(&self, _info: &HeapAllocation) -> Option<vk::DeviceMemory> {
        Some(vk::DeviceMemory::from_raw(
            self.next.fetch_add(1, Ordering::Relaxed),
        ))
    }

    fn free(&self, _memory: vk::DeviceMemory) {}
}

fn host_visible_properties() -> vk::PhysicalDeviceMemoryProperties {
    let mut properties = vk::PhysicalDeviceMemoryProperties::default();
    properties.memory_type_count = 1;
    properties.memory_types[0].property_flags =
        vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
    properties
}

fn test_capture_info(dir: &std::path::Path) -> CaptureInfo {
    CaptureInfo::new(dir.join("trace"))
        .compression(Compression::Snap)
        .chunk_size(4096)
        .build()
}

/// A handle created on one thread and first referenced on another forces
/// the referencing thread to wait until the create call has been replayed.
#[test]
fn cross_thread_handle_dependency() {
    let dir = tempfile::tempdir().unwrap();
    let tracer = Arc::new(Tracer::new(test_capture_info(dir.path())).unwrap());
    let nop = tracer.register_function("vkNop");
    let create = tracer.register_function("vkCreateBuffer");
    let use_buffer = tracer.register_function("vkCmdUseBuffer");

    // Thread 0 registers first so its stream id is stable.
    let writer = tracer.writer();
    assert_eq!(writer.tid(), 0);

    // Thread 1 starts early: one filler call, then it blocks until thread 0
    // hands over the buffer and records the first use.
    let (send, recv) = mpsc::channel();
    let (ready_send, ready_recv) = mpsc::channel();
    let worker = {
        let tracer = Arc::clone(&tracer);
        thread::spawn(move || {
            let writer = tracer.writer();
            assert_eq!(writer.tid(), 1);
            {
                let _stream = writer.begin_call(nop);
            }
            ready_send.send(()).unwrap();
            let wire: lava::stream::WireHandle = recv.recv().unwrap();
            assert_eq!(wire.thread, 0);
            let mut stream = writer.begin_call(use_buffer);
            stream.write_handle(wire);
        })
    };
    ready_recv.recv().unwrap();

    // Thread 0: a run of filler calls, then the create.
    for _ in 0..5 {
        let _stream = writer.begin_call(nop);
    }
    {
        let mut stream = writer.begin_call(create);
        stream.write_u64(4096);
        let record = tracer.records.buffers.add(0x1000, tracer.global_frame());
        let wire = {
            let mut record = record.write();
            record.base.last_modified = writer.source(create);
            record.binding.size = 4096;
            record.binding.object_type = vk::ObjectType::BUFFER;
            record.base.wire_handle()
        };
        stream.write_handle(wire);
        send.send(wire).unwrap();
    }
    worker.join().unwrap();

    tracer.new_frame();
    let tracer = Arc::try_unwrap(tracer).ok().expect("writers keep no tracer refs");
    let pack = tracer.finish().unwrap();

    // Replay: the create decoder is artificially slow, so the use decoder
    // can only pass if the handle wait really blocks.
    let created = Arc::new(AtomicBool::new(false));
    let use_saw_create = Arc::new(AtomicBool::new(false));
    let registry = FunctionRegistry::new()
        .decoder("vkNop", |_reader| {
            thread::sleep(Duration::from_millis(2));
        })
        .decoder("vkCreateBuffer", {
            let created = Arc::clone(&created);
            move |reader| {
                let _size = reader.stream.read_u64();
                let index = reader.read_handle();
                reader
                    .maps()
                    .buffers
                    .set(index, fake_handle::<vk::Buffer>(index));
                created.store(true, Ordering::Release);
            }
        })
        .decoder("vkCmdUseBuffer", {
            let created = Arc::clone(&created);
            let use_saw_create = Arc::clone(&use_saw_create);
            move |reader| {
                let index = reader.read_handle();
                if created.load(Ordering::Acquire) && reader.maps().buffers.contains(index) {
                    use_saw_create.store(true, Ordering::Release);
                }
            }
        });

    let player = Player::open(
        &pack,
        ReplayInfo::default(),
        registry,
        FakeOps::new(),
        host_visible_properties(),
        Arc::new(HostMemoryWindow::new()),
        None,
    )
    .unwrap();
    player.run().unwrap();

    assert!(use_saw_create.load(Ordering::Acquire));
}

/// Differentially captured memory must arrive bit-exact in the replayed
/// object's suballocated backing store.
#[test]
fn memory_updates_round_trip() {
    const SIZE: usize = 4096;

    let dir = tempfile::tempdir().unwrap();
    let tracer = Tracer::new(test_capture_info(dir.path())).unwrap();
    let create_device = tracer.register_function("vkCreateDevice");
    let create_buffer = tracer.register_function("vkCreateBuffer");
    let submit = tracer.register_function("vkQueueSubmit");
    let writer = tracer.writer();

    // device
    {
        let mut stream = writer.begin_call(create_device);
        let record = tracer.records.devices.add(0xd00d, 0);
        let wire = {
            let mut record = record.write();
            record.base.last_modified = writer.source(create_device);
            record.base.wire_handle()
        };
        stream.write_handle(wire);
    }

    // buffer, bound at offset 0 of the memory below
    {
        let mut stream = writer.begin_call(create_buffer);
        stream.write_u64(SIZE as u64);
        let record = tracer.records.buffers.add(0xb0b0, 0);
        let wire = {
            let mut record = record.write();
            record.base.last_modified = writer.source(create_buffer);
            record.binding.object_type = vk::ObjectType::BUFFER;
            record.binding.offset = 0;
            record.binding.size = SIZE as u64;
            record.binding.accessible = true;
            record.base.wire_handle()
        };
        stream.write_handle(wire);
    }

    // the mapped memory the application writes into
    let mut host = vec![0u8; SIZE];
    {
        let record = tracer.records.memories.add(0xa110c, 0);
        let mut record = record.write();
        record.backing = vk::DeviceMemory::from_raw(0xa110c);
        record.property_flags =
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        record.allocation_size = SIZE as u64;
        record.mapped_offset = 0;
        record.mapped_size = SIZE as u64;
        record.mapped_ptr = host.as_mut_ptr();
        record.shadow = Some(vec![0u8; SIZE]);
        record.exposed.add_os(0, SIZE as u64);
        record.bind(
            0,
            AliasRef {
                object_type: vk::ObjectType::BUFFER,
                index: 0,
            },
        );
    }

    // the application scribbles into the mapping
    host[100..108].copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
    host[4000] = 77;

    // queue submit triggers the differential scan
    {
        let _stream = writer.begin_call(submit);
    }
    let device_wire = tracer
        .records
        .devices
        .at(0xd00d)
        .unwrap()
        .read()
        .base
        .wire_handle();
    let written = memscan::flush_mapped_memory(
        &tracer.records,
        &writer,
        device_wire,
        0xa110c,
        FlushReason::QueueSubmit,
        None,
    );
    assert_eq!(written, 24); // two touched words around 100, one around 4000

    // a second flush with no further writes emits nothing
    let written = memscan::flush_mapped_memory(
        &tracer.records,
        &writer,
        device_wire,
        0xa110c,
        FlushReason::QueueSubmit,
        None,
    );
    assert_eq!(written, 0);

    tracer.new_frame();
    let pack = tracer.finish().unwrap();

    // Replay with a host-memory backing; the create decoder places the
    // buffer through the suballocator just like a real device would.
    let window = Arc::new(HostMemoryWindow::new());
    let location: Arc<Mutex<Option<Location>>> = Arc::new(Mutex::new(None));
    let registry = FunctionRegistry::new()
        .decoder("vkCreateDevice", |reader| {
            let index = reader.read_handle();
            reader
                .maps()
                .devices
                .set(index, fake_handle::<vk::Device>(index));
        })
        .decoder("vkCreateBuffer", {
            let location = Arc::clone(&location);
            move |reader| {
                let size = reader.stream.read_u64();
                let index = reader.read_handle();
                reader
                    .maps()
                    .buffers
                    .set(index, fake_handle::<vk::Buffer>(index));
                let placed = reader.allocator().add(
                    reader.tid(),
                    &AllocationRequest {
                        kind: ResourceKind::Buffer,
                        index,
                        handle: fake_handle::<vk::Buffer>(index).as_raw(),
                        size,
                        alignment: 256,
                        memory_type_bits: 0b1,
                        property_flags: vk::MemoryPropertyFlags::HOST_VISIBLE,
                        tiling: vk::ImageTiling::LINEAR,
                        prefers_dedicated: false,
                        allocate_flags: vk::MemoryAllocateFlags::empty(),
                    },
                    |_, _, _| (),
                );
                *location.lock() = Some(placed);
            }
        })
        .decoder("vkQueueSubmit", |_reader| ());

    let player = Player::open(
        &pack,
        ReplayInfo::new().heap_size(DEFAULT_HEAP_SIZE).build(),
        registry,
        FakeOps::new(),
        host_visible_properties(),
        Arc::clone(&window) as Arc<_>,
        None,
    )
    .unwrap();
    assert_eq!(player.metadata().threads, 1);
    player.run().unwrap();

    let placed = location.lock().expect("buffer was placed during replay");
    let replayed = window.read(placed.memory, placed.offset, SIZE as u64);
    assert_eq!(replayed, host);
}

/// Applied update segments feed the device-address candidate scanner
/// through the update-callback seam, the way the offline tool variant
/// rebuilds its per-buffer candidate lists.
#[test]
fn device_address_candidates_found_during_replay() {
    const SIZE: usize = 4096;

    let dir = tempfile::tempdir().unwrap();
    let tracer = Tracer::new(test_capture_info(dir.path())).unwrap();
    let create_buffer = tracer.register_function("vkCreateBuffer");
    let writer = tracer.writer();

    {
        let mut stream = writer.begin_call(create_buffer);
        stream.write_u64(SIZE as u64);
        let record = tracer.records.buffers.add(0xb0b0, 0);
        let wire = {
            let mut record = record.write();
            record.base.last_modified = writer.source(create_buffer);
            record.binding.object_type = vk::ObjectType::BUFFER;
            record.binding.size = SIZE as u64;
            record.binding.accessible = true;
            record.base.wire_handle()
        };
        stream.write_handle(wire);
    }

    let mut host = vec![0u8; SIZE];
    {
        let record = tracer.records.memories.add(0xa110c, 0);
        let mut record = record.write();
        record.backing = vk::DeviceMemory::from_raw(0xa110c);
        record.property_flags =
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        record.allocation_size = SIZE as u64;
        record.mapped_size = SIZE as u64;
        record.mapped_ptr = host.as_mut_ptr();
        record.shadow = Some(vec![0u8; SIZE]);
        record.exposed.add_os(0, SIZE as u64);
        record.bind(
            0,
            AliasRef {
                object_type: vk::ObjectType::BUFFER,
                index: 0,
            },
        );
    }

    // one word that looks like a device address, one that does not
    host[256..264].copy_from_slice(&0x10040u64.to_le_bytes());
    host[512..520].copy_from_slice(&0xdead_beefu64.to_le_bytes());

    memscan::flush_mapped_memory(
        &tracer.records,
        &writer,
        lava::stream::WireHandle::NULL,
        0xa110c,
        FlushReason::QueueSubmit,
        None,
    );
    tracer.new_frame();
    let pack = tracer.finish().unwrap();

    // The remapper knows the captured buffer's address range; a replay-side
    // record accumulates candidates from every applied segment.
    let mut ranges = AddressRemapper::new();
    ranges.add(0x10000, 0x1000, 0x90000, 0);
    let ranges = Arc::new(ranges);
    let scanned = Arc::new(Mutex::new(BufferRecord::default()));

    let update_callback: UpdateCallback = Arc::new({
        let ranges = Arc::clone(&ranges);
        let scanned = Arc::clone(&scanned);
        move |kind, index, offset, segment: &[u8]| {
            if kind != ResourceKind::Buffer {
                return;
            }
            let source = ChangeSource::new(0, 0, 0, index as u16);
            find_address_candidates(
                &[ranges.as_ref()],
                &mut scanned.lock(),
                segment,
                offset,
                source,
            );
        }
    });

    let registry = FunctionRegistry::new().decoder("vkCreateBuffer", |reader| {
        let size = reader.stream.read_u64();
        let index = reader.read_handle();
        reader
            .maps()
            .buffers
            .set(index, fake_handle::<vk::Buffer>(index));
        reader.allocator().add(
            reader.tid(),
            &AllocationRequest {
                kind: ResourceKind::Buffer,
                index,
                handle: fake_handle::<vk::Buffer>(index).as_raw(),
                size,
                alignment: 256,
                memory_type_bits: 0b1,
                property_flags: vk::MemoryPropertyFlags::HOST_VISIBLE,
                tiling: vk::ImageTiling::LINEAR,
                prefers_dedicated: false,
                allocate_flags: vk::MemoryAllocateFlags::empty(),
            },
            |_, _, _| (),
        );
    });

    let player = Player::open(
        &pack,
        ReplayInfo::default(),
        registry,
        FakeOps::new(),
        host_visible_properties(),
        Arc::new(HostMemoryWindow::new()),
        Some(update_callback),
    )
    .unwrap();
    player.run().unwrap();

    // only the plausible word was recorded, keyed by its buffer offset
    let scanned = scanned.lock();
    assert_eq!(scanned.candidates.len(), 1);
    let found = scanned.candidates[&256];
    assert_eq!(found.address, 0x10040);
    assert_eq!(ranges.translate_address(found.address), 0x90040);
}

/// Update packets for objects the replay never placed must abort the run
/// instead of corrupting memory.
#[test]
fn update_without_placement_fails() {
    const SIZE: usize = 64;

    let dir = tempfile::tempdir().unwrap();
    let tracer = Tracer::new(test_capture_info(dir.path())).unwrap();
    let create_buffer = tracer.register_function("vkCreateBuffer");
    let writer = tracer.writer();

    {
        let mut stream = writer.begin_call(create_buffer);
        let record = tracer.records.buffers.add(0xb0b0, 0);
        let wire = {
            let mut record = record.write();
            record.base.last_modified = writer.source(create_buffer);
            record.binding.object_type = vk::ObjectType::BUFFER;
            record.binding.size = SIZE as u64;
            record.binding.accessible = true;
            record.base.wire_handle()
        };
        stream.write_handle(wire);
    }

    let mut host = vec![1u8; SIZE];
    {
        let record = tracer.records.memories.add(0xa110c, 0);
        let mut record = record.write();
        record.backing = vk::DeviceMemory::from_raw(0xa110c);
        record.property_flags =
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        record.allocation_size = SIZE as u64;
        record.mapped_size = SIZE as u64;
        record.mapped_ptr = host.as_mut_ptr();
        record.shadow = Some(vec![0u8; SIZE]);
        record.exposed.add_os(0, SIZE as u64);
        record.bind(
            0,
            AliasRef {
                object_type: vk::ObjectType::BUFFER,
                index: 0,
            },
        );
    }
    let device_wire = lava::stream::WireHandle::NULL;
    memscan::flush_mapped_memory(
        &tracer.records,
        &writer,
        device_wire,
        0xa110c,
        FlushReason::Explicit,
        None,
    );
    tracer.new_frame();
    let pack = tracer.finish().unwrap();

    // the create decoder "forgets" to place the buffer
    let registry = FunctionRegistry::new().decoder("vkCreateBuffer", |reader| {
        let index = reader.read_handle();
        reader
            .maps()
            .buffers
            .set(index, fake_handle::<vk::Buffer>(index));
    });

    let player = Player::open(
        &pack,
        ReplayInfo::default(),
        registry,
        FakeOps::new(),
        host_visible_properties(),
        Arc::new(HostMemoryWindow::new()),
        None,
    )
    .unwrap();
    assert!(player.run().is_err());
}
