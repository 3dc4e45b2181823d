//! Replay coordinator
//!
//! Opens a trace archive, reconstructs the dictionary and handle tables,
//! and runs one worker thread per captured stream. Each worker dispatches
//! packets through a table of registered per-function decoders; the core
//! never calls Vulkan itself.
//!
//! Cross-thread ordering is re-established exactly where the capture
//! recorded it: handle reads and barrier packets spin until the originating
//! thread's call counter has caught up.

use {
    crate::{
        config::ReplayInfo,
        pak::{PakError, PakFile},
        scratch::ScratchPool,
        sidecar::{Dictionary, Limits, Metadata, ThreadFrames},
        stream::{PacketTag, StreamReader, WireHandle},
        suballoc::{DeviceMemoryOps, ResourceKind, Suballocator},
        track::{replay::ReplayRemap, ChangeSource, TensorHandle},
    },
    ash::vk,
    dashmap::DashMap,
    log::{debug, error, info},
    parking_lot::Mutex,
    std::{
        collections::HashMap,
        io,
        path::Path,
        sync::{
            atomic::{AtomicBool, AtomicU32, Ordering},
            Arc,
        },
        thread,
        time::Duration,
    },
    thiserror::Error,
};

/// Dictionary translation result for functions the registry does not know.
pub const UNSUPPORTED_FUNCTION: u16 = u16::MAX;

const SPIN_SLEEP: Duration = Duration::from_micros(10);

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error(transparent)]
    Pak(#[from] PakError),

    #[error("archive i/o failed: {0}")]
    Io(#[from] io::Error),

    #[error("unknown packet tag {0}, the stream cannot be resynchronized")]
    BadPacket(u8),

    #[error("function \"{name}\" (stream id {id}) is unsupported, aborting the stream")]
    Unsupported { id: u16, name: String },

    #[error("replay thread {0} failed: {1}")]
    Worker(u16, String),
}

/// All replay-side handle tables, sized from `limits.json`.
#[derive(Default)]
pub struct ReplayMaps {
    pub devices: ReplayRemap<vk::Device>,
    pub memories: ReplayRemap<vk::DeviceMemory>,
    pub buffers: ReplayRemap<vk::Buffer>,
    pub images: ReplayRemap<vk::Image>,
    pub tensors: ReplayRemap<TensorHandle>,
    pub acceleration_structures: ReplayRemap<vk::AccelerationStructureKHR>,
    pub command_buffers: ReplayRemap<vk::CommandBuffer>,
    pub shader_modules: ReplayRemap<vk::ShaderModule>,
    pub pipelines: ReplayRemap<vk::Pipeline>,
    pub swapchains: ReplayRemap<vk::SwapchainKHR>,
    pub fences: ReplayRemap<vk::Fence>,
}

impl ReplayMaps {
    fn resize_from(&mut self, limits: &Limits) {
        let get = |name: &str| limits.get(name).copied().unwrap_or(0);
        self.devices.resize(get("VkDevice"));
        self.memories.resize(get("VkDeviceMemory"));
        self.buffers.resize(get("VkBuffer"));
        self.images.resize(get("VkImage"));
        self.tensors.resize(get("VkTensorARM"));
        self.acceleration_structures
            .resize(get("VkAccelerationStructureKHR"));
        self.command_buffers.resize(get("VkCommandBuffer"));
        self.shader_modules.resize(get("VkShaderModule"));
        self.pipelines.resize(get("VkPipeline"));
        self.swapchains.resize(get("VkSwapchainKHR"));
        self.fences.resize(get("VkFence"));
    }
}

/// One per-function decoder. It reads the packet body off the thread's
/// stream; anything it creates goes into the replay maps.
pub type Decoder = Arc<dyn Fn(&mut ThreadReader) + Send + Sync>;

/// Called for every applied update-packet segment, with the object's kind,
/// index and the segment's offset and bytes. The offline tool variant hangs
/// its device-address candidate scan off this.
pub type UpdateCallback = Arc<dyn Fn(ResourceKind, u32, u64, &[u8]) + Send + Sync>;

/// The decoders and post-dispatch callbacks an embedder registers before
/// replay starts.
#[derive(Default)]
pub struct FunctionRegistry {
    decoders: HashMap<String, Decoder>,
    post: HashMap<String, Vec<Decoder>>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decoder(
        mut self,
        name: impl Into<String>,
        decode: impl Fn(&mut ThreadReader) + Send + Sync + 'static,
    ) -> Self {
        self.decoders.insert(name.into(), Arc::new(decode));
        self
    }

    /// Post-processing callbacks run in registration order after the
    /// decoder finishes.
    pub fn post(
        mut self,
        name: impl Into<String>,
        callback: impl Fn(&mut ThreadReader) + Send + Sync + 'static,
    ) -> Self {
        self.post
            .entry(name.into())
            .or_default()
            .push(Arc::new(callback));
        self
    }
}

/// Resolves update-packet targets to writable mapped bytes. On a live
/// device this maps the suballocator heap; headless processing backs it
/// with plain host memory.
pub trait MemoryWindow: Send + Sync {
    fn with_mapped(
        &self,
        memory: vk::DeviceMemory,
        offset: u64,
        size: u64,
        apply: &mut dyn FnMut(&mut [u8]),
    );
}

/// Host-memory backing, one growable buffer per device memory handle.
#[derive(Default)]
pub struct HostMemoryWindow {
    regions: DashMap<u64, Vec<u8>>,
}

impl HostMemoryWindow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read(&self, memory: vk::DeviceMemory, offset: u64, size: u64) -> Vec<u8> {
        use ash::vk::Handle;
        self.regions
            .get(&memory.as_raw())
            .map(|region| {
                region[offset as usize..(offset + size) as usize].to_vec()
            })
            .unwrap_or_else(|| vec![0; size as usize])
    }
}

impl MemoryWindow for HostMemoryWindow {
    fn with_mapped(
        &self,
        memory: vk::DeviceMemory,
        offset: u64,
        size: u64,
        apply: &mut dyn FnMut(&mut [u8]),
    ) {
        use ash::vk::Handle;
        let mut region = self.regions.entry(memory.as_raw()).or_default();
        if (region.len() as u64) < offset + size {
            region.resize((offset + size) as usize, 0);
        }
        apply(&mut region[offset as usize..(offset + size) as usize]);
    }
}

struct Shared {
    info: ReplayInfo,
    metadata: Metadata,

    /// stream id -> registry table index, or [`UNSUPPORTED_FUNCTION`].
    dictionary_remap: Vec<u16>,

    /// registry table: names, decoders and post callbacks by table index.
    names: Vec<String>,
    decoders: Vec<Option<Decoder>>,
    post: Vec<Vec<Decoder>>,

    /// Thread-local call numbers, indexed by capture thread id.
    call_numbers: Vec<AtomicU32>,

    /// Per-thread clean-exit flags.
    terminated: Vec<AtomicBool>,

    terminate: AtomicBool,

    /// Current global frame (only use for logging).
    global_frame: AtomicU32,

    maps: ReplayMaps,
    allocator: Suballocator,
    memory: Arc<dyn MemoryWindow>,
    update_callback: Option<UpdateCallback>,
    first_error: Mutex<Option<ReplayError>>,
}

/// One worker thread's view of the replay.
pub struct ThreadReader {
    tid: u16,
    pub stream: StreamReader,
    pub pool: ScratchPool,

    /// The change source of the packet currently being dispatched.
    pub current: ChangeSource,

    shared: Arc<Shared>,
    local_frame: u32,
    preload_target: Option<u64>,
}

impl ThreadReader {
    pub fn tid(&self) -> u16 {
        self.tid
    }

    pub fn maps(&self) -> &ReplayMaps {
        &self.shared.maps
    }

    pub fn allocator(&self) -> &Suballocator {
        &self.shared.allocator
    }

    pub fn global_frame(&self) -> u32 {
        self.shared.global_frame.load(Ordering::Relaxed)
    }

    /// Read a handle triplet. When the handle originates on another thread,
    /// spin until that thread has replayed the call that last modified it.
    pub fn read_handle(&mut self) -> u32 {
        let WireHandle {
            index,
            thread,
            call,
        } = self.stream.read_handle();
        if thread < 0 || thread as u16 == self.tid {
            return index;
        }

        let target = &self.shared.call_numbers[thread as usize];
        while (call as u32) > target.load(Ordering::Acquire) {
            thread::sleep(SPIN_SLEEP);
        }

        index
    }

    pub fn read_handle_array(&mut self, count: usize) -> Vec<u32> {
        (0..count).map(|_| self.read_handle()).collect()
    }

    fn read_barrier(&mut self) {
        let count = self.stream.read_u8() as usize;
        for other in 0..count {
            let call = self.stream.read_u32();
            if other == self.tid as usize {
                continue;
            }
            while call > self.shared.call_numbers[other].load(Ordering::Acquire) {
                thread::sleep(SPIN_SLEEP);
            }
        }
        debug!(
            "[t{:02}] passed thread barrier, waited for {count} threads",
            self.tid
        );
    }

    fn apply_update(&mut self, tag: PacketTag) {
        let _device = self.read_handle();
        let index = self.read_handle();
        let kind = match tag {
            PacketTag::ImageUpdate => ResourceKind::Image,
            PacketTag::BufferUpdate => ResourceKind::Buffer,
            _ => ResourceKind::Tensor,
        };

        let location = self.shared.allocator.find_memory(kind, index);
        let memory = Arc::clone(&self.shared.memory);
        let callback = self.shared.update_callback.clone();
        let stream = &mut self.stream;
        memory.with_mapped(location.memory, location.offset, location.size, &mut |bytes| {
            stream.read_patch(Some(bytes), |offset, segment| {
                if let Some(callback) = &callback {
                    callback(kind, index, offset, segment);
                }
            });
        });
    }

    /// Advance this thread's frame counter. Returns true when the end of
    /// the configured frame range has been reached and replay should wind
    /// down.
    pub fn new_frame(&mut self) -> bool {
        if self.shared.info.start_frame == self.current.frame {
            info!("==== starting frame range ====");
        }
        self.current.frame += 1;
        self.local_frame += 1;
        self.shared.global_frame.fetch_add(1, Ordering::Relaxed);

        if let Some(end) = self.shared.info.end_frame {
            if self.current.frame >= end {
                self.shared.terminate.store(true, Ordering::Release);
                return true;
            }
        }

        false
    }

    /// Read and dispatch one packet. `None` means the stream is exhausted.
    pub fn step(&mut self) -> Result<Option<PacketTag>, ReplayError> {
        if self.stream.done() {
            return Ok(None);
        }

        let raw = self.stream.read_u8();
        let tag = PacketTag::from_u8(raw).ok_or(ReplayError::BadPacket(raw))?;
        match tag {
            PacketTag::ApiCall | PacketTag::ScApiCall => {
                let stream_id = self.stream.read_u16();
                let _reserved = self.stream.read_u32();
                let table_id = self
                    .shared
                    .dictionary_remap
                    .get(stream_id as usize)
                    .copied()
                    .unwrap_or(UNSUPPORTED_FUNCTION);
                if table_id == UNSUPPORTED_FUNCTION {
                    // length unknown, resynchronization is impossible
                    return Err(ReplayError::Unsupported {
                        id: stream_id,
                        name: format!("<stream id {stream_id}>"),
                    });
                }

                self.current.call += 1;
                self.current.call_id = table_id;
                let decoder =
                    self.shared.decoders[table_id as usize]
                        .clone()
                        .ok_or_else(|| ReplayError::Unsupported {
                            id: stream_id,
                            name: self.shared.names[table_id as usize].clone(),
                        })?;
                decoder(self);

                let post = self.shared.post[table_id as usize].clone();
                for callback in post {
                    callback(self);
                }

                // cross-thread ordering comes from the explicit per-call
                // waits pairing with this release
                self.shared.call_numbers[self.tid as usize].fetch_add(1, Ordering::Release);
                self.pool.reset();
            }
            PacketTag::ThreadBarrier => self.read_barrier(),
            PacketTag::ImageUpdate | PacketTag::BufferUpdate | PacketTag::TensorUpdate => {
                self.apply_update(tag)
            }
        }

        Ok(Some(tag))
    }

    fn run(&mut self) -> Result<(), ReplayError> {
        if let Some(target) = self.preload_target.take() {
            self.stream.initiate_preload(target);
            self.stream.reset_preload();
        }

        loop {
            if self.shared.terminate.load(Ordering::Acquire) {
                debug!("[t{:02}] terminating on request", self.tid);
                return Ok(());
            }
            match self.step()? {
                Some(_) => (),
                None => return Ok(()),
            }
        }
    }
}

/// Top level context of one replay run.
pub struct Player {
    shared: Arc<Shared>,
    readers: Vec<ThreadReader>,
}

impl Player {
    /// Open an archive and prepare one reader per captured thread.
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        path: impl AsRef<Path>,
        info: ReplayInfo,
        registry: FunctionRegistry,
        memory_ops: Arc<dyn DeviceMemoryOps>,
        memory_properties: vk::PhysicalDeviceMemoryProperties,
        memory: Arc<dyn MemoryWindow>,
        update_callback: Option<UpdateCallback>,
    ) -> Result<Self, ReplayError> {
        let pack = PakFile::open(path)?;
        let metadata: Metadata = pack.read_json("metadata.json")?;
        let dictionary: Dictionary = pack.read_json("dictionary.json")?;
        let limits: Limits = pack.read_json("limits.json")?;

        info!(
            "opening trace: {} ({} threads, {} frames)",
            metadata.application.application_name, metadata.threads, metadata.global_frames
        );

        // Build the registry table and translate the archive's function ids
        // into it by name.
        let mut names = Vec::new();
        let mut decoders = Vec::new();
        let mut post = Vec::new();
        let mut by_name = HashMap::new();
        for (name, decoder) in registry.decoders {
            by_name.insert(name.clone(), names.len() as u16);
            names.push(name);
            decoders.push(Some(decoder));
            post.push(Vec::new());
        }
        for (name, callbacks) in registry.post {
            if let Some(&at) = by_name.get(&name) {
                post[at as usize] = callbacks;
            }
        }

        let max_stream_id = dictionary.values().copied().max().unwrap_or(0);
        let mut dictionary_remap = vec![UNSUPPORTED_FUNCTION; max_stream_id as usize + 1];
        for (name, stream_id) in &dictionary {
            if let Some(&at) = by_name.get(name) {
                dictionary_remap[*stream_id as usize] = at;
            } else {
                debug!("function \"{name}\" has no decoder registered");
            }
        }

        let mut maps = ReplayMaps::default();
        maps.resize_from(&limits);

        let allocator = Suballocator::new(
            memory_ops,
            memory_properties,
            limits.get("VkImage").copied().unwrap_or(0),
            limits.get("VkBuffer").copied().unwrap_or(0),
            limits.get("VkTensorARM").copied().unwrap_or(0),
            info.heap_size,
        );

        let threads = metadata.threads;
        let shared = Arc::new(Shared {
            metadata,
            dictionary_remap,
            names,
            decoders,
            post,
            call_numbers: (0..threads).map(|_| AtomicU32::new(0)).collect(),
            terminated: (0..threads).map(|_| AtomicBool::new(false)).collect(),
            terminate: AtomicBool::new(false),
            global_frame: AtomicU32::new(0),
            maps,
            allocator,
            memory,
            update_callback,
            first_error: Mutex::new(None),
            info,
        });

        let mut readers = Vec::with_capacity(threads as usize);
        for tid in 0..threads as u16 {
            let slice = pack.open_inside(&format!("thread_{tid}.bin"))?;
            let stream = StreamReader::new(
                Box::new(slice),
                shared.metadata.compression,
                shared.info.readahead_chunks,
                shared.info.multithread_read,
            );

            // preload up to the start frame's stream position
            let preload_target = if shared.info.preload {
                let frames: ThreadFrames = pack.read_json(&format!("frames_{tid}.json"))?;
                frames
                    .frames
                    .iter()
                    .find(|f| f.global_frame >= shared.info.start_frame)
                    .map(|f| f.position)
            } else {
                None
            };

            readers.push(ThreadReader {
                tid,
                stream,
                pool: ScratchPool::default(),
                current: ChangeSource {
                    thread: tid as i8,
                    ..Default::default()
                },
                shared: Arc::clone(&shared),
                local_frame: 0,
                preload_target,
            });
        }

        Ok(Self { shared, readers })
    }

    pub fn metadata(&self) -> &Metadata {
        &self.shared.metadata
    }

    pub fn maps(&self) -> &ReplayMaps {
        &self.shared.maps
    }

    pub fn allocator(&self) -> &Suballocator {
        &self.shared.allocator
    }

    /// Dump trace information to the log.
    pub fn dump_info(&self) {
        let meta = &self.shared.metadata;
        info!("App name: {}", meta.application.application_name);
        info!("App engine: {}", meta.application.engine_name);
        info!("Traced device: {}", meta.device.device_name);
        info!("Frames: {}", meta.global_frames);
        info!("Threads: {}", meta.threads);
    }

    /// Ask every worker to wind down at the next packet boundary.
    pub fn terminate(&self) {
        self.shared.terminate.store(true, Ordering::Release);
    }

    /// Whether a worker has already exited cleanly, so the coordinator can
    /// skip it when winding down.
    pub fn thread_terminated(&self, tid: u16) -> bool {
        self.shared.terminated[tid as usize].load(Ordering::Acquire)
    }

    /// Run every stream to completion. Returns the first fatal error of any
    /// worker, after every worker has stopped.
    pub fn run(mut self) -> Result<(), ReplayError> {
        let workers: Vec<_> = self
            .readers
            .drain(..)
            .map(|mut reader| {
                let shared = Arc::clone(&self.shared);
                thread::Builder::new()
                    .name(format!("replay-{}", reader.tid))
                    .spawn(move || {
                        let tid = reader.tid;
                        if let Err(err) = reader.run() {
                            error!("replay thread {tid} failed: {err}");
                            let mut first = shared.first_error.lock();
                            if first.is_none() {
                                *first = Some(err);
                            }
                            shared.terminate.store(true, Ordering::Release);
                        }
                        shared.terminated[tid as usize].store(true, Ordering::Release);
                    })
                    .expect("failed to spawn replay thread")
            })
            .collect();

        for worker in workers {
            if worker.join().is_err() {
                let mut first = self.shared.first_error.lock();
                if first.is_none() {
                    *first = Some(ReplayError::Worker(
                        u16::MAX,
                        "replay thread panicked".to_string(),
                    ));
                }
            }
        }

        match self.shared.first_error.lock().take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
