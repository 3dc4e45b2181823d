//! Capture coordinator
//!
//! One [`Tracer`] owns everything a capture run needs: the function
//! dictionary, the global frame counter, the per-thread stream writers in
//! first-touch order, the per-type object registries and the feature usage
//! tally. There is no global instance; a tracing shim creates one `Tracer`
//! at startup and passes it around (or wraps it in its own facade).
//!
//! Locking discipline: the global frame mutex is the coarsest lock, then the
//! registry insert locks, then individual record locks. Never take a coarser
//! lock while holding a finer one.

use {
    crate::{
        config::CaptureInfo,
        feature::FeatureUsage,
        pak::{PakError, PakFile},
        sidecar::{
            self, ApplicationInfo, DeviceSnapshot, Dictionary, FrameEntry, FrameStats, Limits,
            Metadata, ThreadFrames, Tracking, TrackingEntry,
        },
        stream::{PacketTag, StreamWriter},
        track::{
            remap::TraceRemap, vector::TraceVec, AccelerationStructureRecord, BufferRecord,
            ChangeSource, CommandBufferRecord, DeviceRecord, FenceRecord, ImageRecord,
            MemoryRecord, PipelineRecord, ShaderModuleRecord, SwapchainRecord, TensorRecord,
            Tracked,
        },
    },
    log::{debug, info},
    parking_lot::{Mutex, MutexGuard},
    serde_json::json,
    std::{
        collections::HashMap,
        fs, io,
        path::PathBuf,
        sync::{
            atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
            Arc, Weak,
        },
        thread::{self, ThreadId},
    },
};

pub const VERSION_MAJOR: u32 = 0;
pub const VERSION_MINOR: u32 = 0;
pub const VERSION_PATCH: u32 = 1;

/// Per-type object registries of one capture.
#[derive(Default)]
pub struct TraceRecords {
    pub devices: TraceRemap<DeviceRecord>,
    pub memories: TraceRemap<MemoryRecord>,
    pub buffers: TraceRemap<BufferRecord>,
    pub images: TraceRemap<ImageRecord>,
    pub tensors: TraceRemap<TensorRecord>,
    pub acceleration_structures: TraceRemap<AccelerationStructureRecord>,
    pub command_buffers: TraceRemap<CommandBufferRecord>,
    pub shader_modules: TraceRemap<ShaderModuleRecord>,
    pub pipelines: TraceRemap<PipelineRecord>,
    pub swapchains: TraceRemap<SwapchainRecord>,
    pub fences: TraceRemap<FenceRecord>,
}

fn tracking_entries<T: Tracked>(
    remap: &TraceRemap<T>,
    extra: impl Fn(&T) -> serde_json::Value,
) -> Vec<TrackingEntry> {
    remap
        .iter()
        .map(|record| {
            let record = record.read();
            let base = record.base();
            let mut entry = TrackingEntry {
                index: base.index,
                frame_created: base.creation.frame,
                frame_destroyed: base.destroyed.frame,
                name: base.name.clone(),
                ..Default::default()
            };
            if let serde_json::Value::Object(extras) = extra(&record) {
                for (key, value) in extras {
                    entry.extra.insert(key, value);
                }
            }
            entry
        })
        .collect()
}

impl TraceRecords {
    /// The per-type maximum counts, for `limits.json`.
    pub fn limits(&self) -> Limits {
        let mut limits = Limits::new();
        limits.insert("VkDevice".to_string(), self.devices.len());
        limits.insert("VkDeviceMemory".to_string(), self.memories.len());
        limits.insert("VkBuffer".to_string(), self.buffers.len());
        limits.insert("VkImage".to_string(), self.images.len());
        limits.insert("VkTensorARM".to_string(), self.tensors.len());
        limits.insert(
            "VkAccelerationStructureKHR".to_string(),
            self.acceleration_structures.len(),
        );
        limits.insert("VkCommandBuffer".to_string(), self.command_buffers.len());
        limits.insert("VkShaderModule".to_string(), self.shader_modules.len());
        limits.insert("VkPipeline".to_string(), self.pipelines.len());
        limits.insert("VkSwapchainKHR".to_string(), self.swapchains.len());
        limits.insert("VkFence".to_string(), self.fences.len());
        limits
    }

    /// The full record snapshot, for `tracking.json`.
    pub fn tracking(&self) -> Tracking {
        let mut tracking = Tracking::new();
        tracking.insert(
            "VkDevice".to_string(),
            tracking_entries(&self.devices, |_| json!({})),
        );
        tracking.insert(
            "VkDeviceMemory".to_string(),
            tracking_entries(&self.memories, |memory| {
                json!({
                    "allocationSize": memory.allocation_size,
                    "propertyFlags": memory.property_flags.as_raw(),
                })
            }),
        );
        tracking.insert(
            "VkBuffer".to_string(),
            tracking_entries(&self.buffers, |buffer| {
                let mut value = json!({
                    "size": buffer.binding.size,
                    "offset": buffer.binding.offset,
                    "memory_index": buffer.binding.memory_index,
                    "usage": buffer.usage.as_raw(),
                    "flags": buffer.flags.as_raw(),
                    "written": buffer.binding.written,
                    "updates": buffer.binding.updates,
                });
                if let Some(alias) = buffer.binding.alias {
                    value["alias_index"] = json!(alias.index);
                    value["alias_type"] = json!(alias.object_type.as_raw());
                }
                value
            }),
        );
        tracking.insert(
            "VkImage".to_string(),
            tracking_entries(&self.images, |image| {
                let mut value = json!({
                    "width": image.extent.width,
                    "height": image.extent.height,
                    "depth": image.extent.depth,
                    "format": image.format.as_raw(),
                    "tiling": image.tiling.as_raw(),
                    "usage": image.usage.as_raw(),
                    "mipLevels": image.mip_levels,
                    "arrayLayers": image.array_layers,
                    "swapchain_image": image.is_swapchain_image,
                    "memory_index": image.binding.memory_index,
                    "offset": image.binding.offset,
                });
                if let Some(alias) = image.binding.alias {
                    value["alias_index"] = json!(alias.index);
                    value["alias_type"] = json!(alias.object_type.as_raw());
                }
                value
            }),
        );
        tracking.insert(
            "VkTensorARM".to_string(),
            tracking_entries(&self.tensors, |tensor| {
                json!({
                    "dimensions": tensor.dimensions.clone(),
                    "format": tensor.format.as_raw(),
                    "memory_index": tensor.binding.memory_index,
                })
            }),
        );
        tracking.insert(
            "VkAccelerationStructureKHR".to_string(),
            tracking_entries(&self.acceleration_structures, |accel| {
                json!({
                    "buffer_index": accel.buffer_index,
                    "offset": accel.offset,
                    "type": accel.ty.as_raw(),
                })
            }),
        );
        tracking.insert(
            "VkCommandBuffer".to_string(),
            tracking_entries(&self.command_buffers, |cmd| {
                json!({ "pool_index": cmd.pool_index, "commands": cmd.commands.len() })
            }),
        );
        tracking.insert(
            "VkShaderModule".to_string(),
            tracking_entries(&self.shader_modules, |module| {
                json!({ "size": module.code.len() * 4, "device_index": module.device_index })
            }),
        );
        tracking.insert(
            "VkPipeline".to_string(),
            tracking_entries(&self.pipelines, |pipeline| {
                json!({
                    "bind_point": pipeline.bind_point.as_raw(),
                    "stages": pipeline.stages.len(),
                })
            }),
        );
        tracking.insert(
            "VkSwapchainKHR".to_string(),
            tracking_entries(&self.swapchains, |swapchain| {
                json!({
                    "width": swapchain.width,
                    "height": swapchain.height,
                    "format": swapchain.format.as_raw(),
                    "image_count": swapchain.image_count,
                })
            }),
        );
        tracking.insert(
            "VkFence".to_string(),
            tracking_entries(&self.fences, |_| json!({})),
        );
        tracking
    }
}

/// Per-frame flush statistics, accumulated by the memory scan driver and
/// drained at every frame boundary.
#[derive(Debug, Default)]
pub struct FlushStats {
    pub flushes_queue: AtomicU32,
    pub flushes_event: AtomicU32,
    pub memory_devices: AtomicU32,
    pub memory_dumps: AtomicU32,
    pub memory_scans: AtomicU32,
    pub memory_bytes: AtomicU64,
    pub memory_changed_bytes: AtomicU64,
    pub memory_scans_unchanged: AtomicU32,
}

impl FlushStats {
    fn drain(&self, frame: u32) -> FrameStats {
        FrameStats {
            frame,
            flushes_queue: self.flushes_queue.swap(0, Ordering::Relaxed),
            flushes_event: self.flushes_event.swap(0, Ordering::Relaxed),
            memory_devices: self.memory_devices.swap(0, Ordering::Relaxed),
            memory_dumps: self.memory_dumps.swap(0, Ordering::Relaxed),
            memory_scans: self.memory_scans.swap(0, Ordering::Relaxed),
            memory_bytes: self.memory_bytes.swap(0, Ordering::Relaxed),
            memory_changed_bytes: self.memory_changed_bytes.swap(0, Ordering::Relaxed),
            memory_scans_unchanged: self.memory_scans_unchanged.swap(0, Ordering::Relaxed),
        }
    }

    fn merge(into: &mut FrameStats, from: FrameStats) {
        into.flushes_queue += from.flushes_queue;
        into.flushes_event += from.flushes_event;
        into.memory_devices += from.memory_devices;
        into.memory_dumps += from.memory_dumps;
        into.memory_scans += from.memory_scans;
        into.memory_bytes += from.memory_bytes;
        into.memory_changed_bytes += from.memory_changed_bytes;
        into.memory_scans_unchanged += from.memory_scans_unchanged;
    }
}

struct Shared {
    info: CaptureInfo,

    /// Working directory the streams and sidecars land in before packing.
    path: PathBuf,

    /// The global frame mutex. Guards frame transitions and the thread
    /// registry growth.
    frame_lock: Mutex<()>,

    global_frame: AtomicU32,
    threads: TraceVec<Arc<ThreadWriter>>,
    by_thread: Mutex<HashMap<ThreadId, Arc<ThreadWriter>>>,
    dictionary: Mutex<Dictionary>,
    frame_stats: Mutex<Vec<FrameStats>>,
    application: Mutex<ApplicationInfo>,
    device: Mutex<DeviceSnapshot>,
}

/// Per-thread stream controller. Obtained through [`Tracer::writer`]; only
/// the owning thread appends call packets, other threads may only flag
/// pending barriers.
pub struct ThreadWriter {
    tid: u16,
    thread_name: Option<String>,
    shared: Weak<Shared>,
    stream: Mutex<StreamWriter>,
    pending_barrier: AtomicBool,
    local_call: AtomicU32,
    local_frame: AtomicU32,
    frames: Mutex<Vec<FrameEntry>>,
    pub stats: FlushStats,

    /// Per-call staging for parameter copies; reset at every call preamble.
    pub pool: Mutex<crate::scratch::ScratchPool>,
}

impl ThreadWriter {
    pub fn tid(&self) -> u16 {
        self.tid
    }

    pub fn local_call_number(&self) -> u32 {
        self.local_call.load(Ordering::Relaxed)
    }

    /// The change source of the call currently being encoded.
    pub fn source(&self, call_id: u16) -> ChangeSource {
        let frame = self
            .shared
            .upgrade()
            .map(|shared| shared.global_frame.load(Ordering::Relaxed))
            .unwrap_or_default();

        ChangeSource {
            thread: self.tid as i8,
            call: self.local_call.load(Ordering::Relaxed),
            frame,
            call_id,
        }
    }

    /// Lock the raw stream, for packet emission outside the call protocol
    /// (memory update packets).
    pub fn stream(&self) -> MutexGuard<'_, StreamWriter> {
        self.stream.lock()
    }

    /// Start one API call packet: checkpoint the stream, inject a pending
    /// barrier if one was flagged, write the packet preamble and count the
    /// call. The returned guard is the stream to encode parameters into.
    pub fn begin_call(&self, function_id: u16) -> MutexGuard<'_, StreamWriter> {
        self.begin_tagged_call(PacketTag::ApiCall, function_id)
    }

    /// The Vulkan SC variant of [`Self::begin_call`].
    pub fn begin_sc_call(&self, function_id: u16) -> MutexGuard<'_, StreamWriter> {
        self.begin_tagged_call(PacketTag::ScApiCall, function_id)
    }

    fn begin_tagged_call(&self, tag: PacketTag, function_id: u16) -> MutexGuard<'_, StreamWriter> {
        self.pool.lock().reset();

        let mut stream = self.stream.lock();
        stream.freeze();

        if self.pending_barrier.swap(false, Ordering::Relaxed) {
            drop(stream);
            self.inject_thread_barrier();
            stream = self.stream.lock();
        }

        stream.write_u8(tag as u8);
        stream.write_u16(function_id);
        stream.write_u32(0); // reserved for future use
        self.local_call.fetch_add(1, Ordering::Release);

        stream
    }

    /// Write a barrier packet naming, for every active thread, the latest
    /// call number it must have reached before this stream may continue.
    pub fn inject_thread_barrier(&self) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let _frame = shared.frame_lock.lock();
        self.inject_thread_barrier_locked(&shared);
    }

    fn inject_thread_barrier_locked(&self, shared: &Shared) {
        let mut stream = self.stream.lock();
        stream.write_u8(PacketTag::ThreadBarrier as u8);
        let count = shared.threads.len();
        stream.write_u8(count as u8);
        for at in 0..count {
            let call = shared.threads.at(at).local_call_number();
            stream.write_u32(call);
        }
        debug!(
            "injected thread barrier on thread {} with {count} targets",
            self.tid
        );
    }

    /// Make every other thread wait for us: flag a pending barrier on each.
    pub fn push_thread_barriers(&self) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let _frame = shared.frame_lock.lock();
        for at in 0..shared.threads.len() {
            let other = shared.threads.at(at);
            if other.tid != self.tid {
                other.pending_barrier.store(true, Ordering::Relaxed);
            }
        }
    }

    fn new_frame(&self, global_frame: u32) -> FrameStats {
        let position = self.stream.lock().uncompressed_bytes();
        let local_frame = self.local_frame.fetch_add(1, Ordering::Relaxed);
        self.frames.lock().push(FrameEntry {
            global_frame,
            local_frame,
            position,
        });

        self.stats.drain(global_frame)
    }

    fn finish(&self, path: &std::path::Path) {
        let mut stream = self.stream.lock();
        let uncompressed_size = stream.uncompressed_bytes();
        stream.finalize();
        drop(stream);

        let frames = self.frames.lock().clone();
        let highest_global_frame = frames.iter().map(|f| f.global_frame).max().unwrap_or(0);
        sidecar::write_json(
            path.join(format!("frames_{}.json", self.tid)),
            &ThreadFrames {
                thread_name: self.thread_name.clone(),
                uncompressed_size,
                highest_global_frame,
                frames,
            },
        );
    }
}

/// Top level context of one capture run.
pub struct Tracer {
    shared: Arc<Shared>,
    pub records: TraceRecords,
    pub features: FeatureUsage,
}

impl Tracer {
    pub fn new(info: CaptureInfo) -> io::Result<Self> {
        let path = info.destination.with_extension("tmp");
        fs::create_dir_all(&path)?;
        info!("base path is set to {}", path.display());

        Ok(Self {
            shared: Arc::new(Shared {
                info,
                path,
                frame_lock: Mutex::new(()),
                global_frame: AtomicU32::new(0),
                threads: TraceVec::new(),
                by_thread: Mutex::new(HashMap::new()),
                dictionary: Mutex::new(Dictionary::new()),
                frame_stats: Mutex::new(Vec::new()),
                application: Mutex::new(ApplicationInfo::default()),
                device: Mutex::new(DeviceSnapshot::default()),
            }),
            records: TraceRecords::default(),
            features: FeatureUsage::new(),
        })
    }

    pub fn global_frame(&self) -> u32 {
        self.shared.global_frame.load(Ordering::Relaxed)
    }

    pub fn thread_count(&self) -> u32 {
        self.shared.threads.len()
    }

    /// Map a function name to its stream id, assigning the next free id on
    /// first sight.
    pub fn register_function(&self, name: &str) -> u16 {
        let mut dictionary = self.shared.dictionary.lock();
        if let Some(&id) = dictionary.get(name) {
            return id;
        }
        let id = dictionary.len() as u16;
        dictionary.insert(name.to_string(), id);
        id
    }

    pub fn set_application_info(&self, application: ApplicationInfo) {
        *self.shared.application.lock() = application;
    }

    pub fn set_device_snapshot(&self, device: DeviceSnapshot) {
        *self.shared.device.lock() = device;
    }

    /// The calling thread's stream writer, created in first-touch order on
    /// first use. A new stream starts with a barrier packet recording where
    /// every existing thread currently is.
    pub fn writer(&self) -> Arc<ThreadWriter> {
        let id = thread::current().id();
        if let Some(writer) = self.shared.by_thread.lock().get(&id) {
            return Arc::clone(writer);
        }

        let _frame = self.shared.frame_lock.lock();
        let tid = self.shared.threads.len() as u16;
        let stream = StreamWriter::create(
            self.shared.path.join(format!("thread_{tid}.bin")),
            self.shared.info.compression,
            self.shared.info.chunk_size,
            self.shared.info.multithread_compress,
            self.shared.info.multithread_writeout,
        )
        .unwrap_or_else(|err| panic!("failed to create stream for thread {tid}: {err}"));

        let writer = Arc::new(ThreadWriter {
            tid,
            thread_name: thread::current().name().map(str::to_string),
            shared: Arc::downgrade(&self.shared),
            stream: Mutex::new(stream),
            pending_barrier: AtomicBool::new(false),
            local_call: AtomicU32::new(0),
            local_frame: AtomicU32::new(0),
            frames: Mutex::new(Vec::new()),
            stats: FlushStats::default(),
            pool: Mutex::new(crate::scratch::ScratchPool::default()),
        });
        writer.inject_thread_barrier_locked(&self.shared);
        self.shared.threads.push(Arc::clone(&writer));
        self.shared.by_thread.lock().insert(id, Arc::clone(&writer));
        debug!(
            "created thread {tid}, currently {} threads",
            self.shared.threads.len()
        );

        writer
    }

    /// Frame boundary: record every thread's stream position, drain the
    /// flush statistics and advance the global frame.
    pub fn new_frame(&self) {
        let _frame = self.shared.frame_lock.lock();
        let global_frame = self.shared.global_frame.load(Ordering::Relaxed);

        let mut combined = FrameStats {
            frame: global_frame,
            ..Default::default()
        };
        for at in 0..self.shared.threads.len() {
            let stats = self.shared.threads.at(at).new_frame(global_frame);
            FlushStats::merge(&mut combined, stats);
        }
        self.shared.frame_stats.lock().push(combined);

        self.shared.global_frame.fetch_add(1, Ordering::Release);
    }

    /// Finalize every stream, emit the sidecars, and pack the whole
    /// directory into the archive. Returns the archive path.
    pub fn finish(self) -> Result<PathBuf, PakError> {
        let _frame = self.shared.frame_lock.lock();
        let path = &self.shared.path;

        sidecar::write_json(path.join("dictionary.json"), &*self.shared.dictionary.lock());
        sidecar::write_json(
            path.join("metadata.json"),
            &Metadata {
                version_major: VERSION_MAJOR,
                version_minor: VERSION_MINOR,
                version_patch: VERSION_PATCH,
                // +1 since zero-indexed
                global_frames: self.shared.global_frame.load(Ordering::Relaxed) + 1,
                threads: self.shared.threads.len(),
                compression: self.shared.info.compression,
                application: self.shared.application.lock().clone(),
                device: self.shared.device.lock().clone(),
            },
        );
        sidecar::write_json(path.join("limits.json"), &self.records.limits());
        sidecar::write_json(path.join("tracking.json"), &self.records.tracking());
        sidecar::write_json(
            path.join("debug.json"),
            &sidecar::DebugSidecar {
                global_frames: self.shared.global_frame.load(Ordering::Relaxed) + 1,
                frames: self.shared.frame_stats.lock().clone(),
            },
        );

        for at in 0..self.shared.threads.len() {
            self.shared.threads.at(at).finish(path);
        }

        let pack = self.shared.info.destination.with_extension("vk");
        PakFile::pack_directory(&pack, path, true)?;
        info!("wrapped up trace at {}", pack.display());

        Ok(pack)
    }
}
