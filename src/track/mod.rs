//! Object tracking
//!
//! Every captured object gets one record in a per-type registry. Records are
//! pointer-stable for the life of the run: destruction marks them, it never
//! frees them. Capture looks records up by their opaque Vulkan handle
//! ([`remap::TraceRemap`]); replay looks real handles up by dense index
//! ([`replay::ReplayRemap`]).

pub mod address;
pub mod remap;
pub mod replay;
pub mod vector;

use {
    crate::range::RangeSet,
    ash::vk::{self, Handle},
    std::collections::BTreeMap,
};

/// Timestamp of a mutation: which thread, which call on that thread, which
/// global frame, and the function that did it.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ChangeSource {
    pub thread: i8,
    pub call: u32,
    pub frame: u32,
    pub call_id: u16,
}

impl ChangeSource {
    pub fn new(thread: i8, call: u32, frame: u32, call_id: u16) -> Self {
        Self {
            thread,
            call,
            frame,
            call_id,
        }
    }
}

/// Lifecycle of a tracked object. Transitions are monotone; `Bound` only
/// applies to memory-backed objects.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum TrackState {
    #[default]
    Uninitialized,
    Initialized,
    Created,
    Bound,
    Destroyed,
}

/// Base record of every captured object.
#[derive(Clone, Debug)]
pub struct Trackable {
    /// Stable dense identifier, unique within the object's type.
    pub index: u32,

    pub state: TrackState,

    /// Optional display name, set through the debug-utils naming path.
    pub name: String,

    pub creation: ChangeSource,
    pub last_modified: ChangeSource,
    pub destroyed: ChangeSource,
}

impl Default for Trackable {
    fn default() -> Self {
        Self {
            index: crate::stream::INVALID_INDEX,
            state: TrackState::Uninitialized,
            name: String::new(),
            creation: ChangeSource::default(),
            last_modified: ChangeSource::default(),
            destroyed: ChangeSource::default(),
        }
    }
}

impl Trackable {
    /// Replay initializes first and creates later; capture goes straight to
    /// created.
    pub fn enter_initialized(&mut self) {
        assert_eq!(self.state, TrackState::Uninitialized);
        self.state = TrackState::Initialized;
    }

    pub fn enter_created(&mut self) {
        assert!(matches!(
            self.state,
            TrackState::Uninitialized | TrackState::Initialized
        ));
        self.state = TrackState::Created;
    }

    pub fn enter_bound(&mut self) {
        assert_eq!(self.state, TrackState::Created);
        self.state = TrackState::Bound;
    }

    pub fn enter_destroyed(&mut self) {
        assert!(matches!(self.state, TrackState::Created | TrackState::Bound));
        self.state = TrackState::Destroyed;
    }

    pub fn is_destroyed(&self) -> bool {
        self.state == TrackState::Destroyed
    }

    /// The wire form of this object for handle encoding.
    pub fn wire_handle(&self) -> crate::stream::WireHandle {
        crate::stream::WireHandle {
            index: self.index,
            thread: self.last_modified.thread,
            call: self.last_modified.call as u16,
        }
    }

    pub fn self_test(&self) {
        assert_eq!(
            self.state == TrackState::Uninitialized,
            self.index == crate::stream::INVALID_INDEX
        );
    }
}

/// Objects `Trackable` records embed into, so registries can stamp the base.
pub trait Tracked: Default {
    fn base(&self) -> &Trackable;
    fn base_mut(&mut self) -> &mut Trackable;
}

macro_rules! tracked {
    ($ty:ty) => {
        impl Tracked for $ty {
            fn base(&self) -> &Trackable {
                &self.base
            }

            fn base_mut(&mut self) -> &mut Trackable {
                &mut self.base
            }
        }
    };
}

/// Mint a replay-side stand-in handle for a dense index. The only place
/// index values and handle bits may be converted into each other.
pub fn fake_handle<T: Handle>(index: u32) -> T {
    T::from_raw(index as u64 + 1)
}

/// Tensor handles are an extension type the core Vulkan headers do not
/// carry; a local opaque handle stands in for them.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
#[repr(transparent)]
pub struct TensorHandle(u64);

impl Handle for TensorHandle {
    const TYPE: vk::ObjectType = vk::ObjectType::UNKNOWN;

    fn as_raw(self) -> u64 {
        self.0
    }

    fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

/// Reference to another object of a possibly different type, used for
/// aliasing links.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct AliasRef {
    pub object_type: vk::ObjectType,
    pub index: u32,
}

/// One device memory allocation as the application sees it.
#[derive(Debug)]
pub struct MemoryRecord {
    pub base: Trackable,

    /// Native handle of the memory.
    pub backing: vk::DeviceMemory,

    pub property_flags: vk::MemoryPropertyFlags,

    /// Total size of the allocation.
    pub allocation_size: vk::DeviceSize,

    /// Current mapping, if any.
    pub mapped_offset: vk::DeviceSize,
    pub mapped_size: vk::DeviceSize,
    pub mapped_ptr: *mut u8,

    /// Byte-for-byte clone of the allocation, compared against when diffing.
    /// Present iff the memory has been mapped at least once.
    pub shadow: Option<Vec<u8>>,

    /// All memory exposed to the application through mapping.
    pub exposed: RangeSet,

    /// offset -> objects bound there; used to find aliasing objects so they
    /// can be recreated together on replay.
    pub bindings: BTreeMap<vk::DeviceSize, Vec<AliasRef>>,
}

impl Default for MemoryRecord {
    fn default() -> Self {
        Self {
            base: Trackable::default(),
            backing: vk::DeviceMemory::null(),
            property_flags: vk::MemoryPropertyFlags::empty(),
            allocation_size: 0,
            mapped_offset: 0,
            mapped_size: 0,
            mapped_ptr: std::ptr::null_mut(),
            shadow: None,
            exposed: RangeSet::new(),
            bindings: BTreeMap::new(),
        }
    }
}

// mapped_ptr refers to application memory and is only dereferenced while the
// record lock is held by the memory scan.
unsafe impl Send for MemoryRecord {}
unsafe impl Sync for MemoryRecord {}

tracked!(MemoryRecord);

impl MemoryRecord {
    pub fn is_host_visible(&self) -> bool {
        self.property_flags
            .contains(vk::MemoryPropertyFlags::HOST_VISIBLE)
    }

    pub fn is_mapped(&self) -> bool {
        !self.mapped_ptr.is_null()
    }

    /// The live mapped bytes of the whole allocation window currently mapped.
    ///
    /// # Safety
    ///
    /// Caller must hold this record's lock and the pointer must still map
    /// `mapped_size` bytes.
    pub unsafe fn mapped_slice(&self) -> &[u8] {
        std::slice::from_raw_parts(self.mapped_ptr, self.mapped_size as usize)
    }

    /// Record a binding at `offset`, linking 1-to-1 aliases when another
    /// object already claimed the same offset.
    pub fn bind(&mut self, offset: vk::DeviceSize, new: AliasRef) -> Option<AliasRef> {
        let slot = self.bindings.entry(offset).or_default();
        let alias = slot.first().copied();
        slot.push(new);

        alias
    }

    pub fn unbind(&mut self, offset: vk::DeviceSize, gone: AliasRef) {
        if let Some(slot) = self.bindings.get_mut(&offset) {
            slot.retain(|r| *r != gone);
            if slot.is_empty() {
                self.bindings.remove(&offset);
            }
        }
    }

    pub fn self_test(&self) {
        assert!(self.backing != vk::DeviceMemory::null());
        assert!(self.mapped_offset + self.mapped_size <= self.allocation_size);
        assert!(self.exposed.span().last <= self.allocation_size);
        if let Some(shadow) = &self.shadow {
            assert_eq!(shadow.len() as u64, self.allocation_size);
        }
        self.base.self_test();
    }
}

/// The part shared by everything bound to device memory.
#[derive(Clone, Debug, Default)]
pub struct Binding {
    pub backing: vk::DeviceMemory,
    pub memory_index: u32,
    pub offset: vk::DeviceSize,
    pub size: vk::DeviceSize,
    pub requirements: vk::MemoryRequirements,
    pub object_type: vk::ObjectType,

    /// Bytes written out for this object and how many times it was updated.
    pub written: u64,
    pub updates: u32,

    /// Whether the backing memory is host visible and understandable.
    pub accessible: bool,

    /// Set when this object shares its `(memory, offset)` with another.
    pub alias: Option<AliasRef>,

    pub device_address: vk::DeviceAddress,
    pub memory_flags: vk::MemoryPropertyFlags,
}

/// Buffer objects.
#[derive(Debug, Default)]
pub struct BufferRecord {
    pub base: Trackable,
    pub binding: Binding,
    pub flags: vk::BufferCreateFlags,
    pub sharing_mode: vk::SharingMode,
    pub usage: vk::BufferUsageFlags,

    /// Device-address candidates found in this buffer's bytes, keyed by the
    /// offset they were found at. Replay/post-processing only.
    pub candidates: BTreeMap<vk::DeviceSize, address::AddressCandidate>,
}

tracked!(BufferRecord);

impl BufferRecord {
    pub fn self_test(&self) {
        if self.base.state == TrackState::Bound {
            assert!(self.binding.size != 0);
            assert!(self.binding.backing != vk::DeviceMemory::null());
        }
        self.base.self_test();
    }
}

/// Image objects.
#[derive(Debug, Default)]
pub struct ImageRecord {
    pub base: Trackable,
    pub binding: Binding,
    pub flags: vk::ImageCreateFlags,
    pub image_type: vk::ImageType,
    pub tiling: vk::ImageTiling,
    pub usage: vk::ImageUsageFlags,
    pub sharing_mode: vk::SharingMode,
    pub format: vk::Format,
    pub samples: vk::SampleCountFlags,
    pub extent: vk::Extent3D,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub initial_layout: vk::ImageLayout,
    pub current_layout: vk::ImageLayout,
    pub is_swapchain_image: bool,
}

tracked!(ImageRecord);

/// Tensor tiling is its own small enum on the capture side; the extension
/// enum is not part of the core Vulkan headers.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum TensorTiling {
    #[default]
    Optimal,
    Linear,
}

/// Tensor objects.
#[derive(Debug, Default)]
pub struct TensorRecord {
    pub base: Trackable,
    pub binding: Binding,
    pub sharing_mode: vk::SharingMode,
    pub tiling: TensorTiling,
    pub format: vk::Format,
    pub dimensions: Vec<i64>,
    pub strides: Vec<i64>,
}

tracked!(TensorRecord);

/// Acceleration structure objects. Placed inside a buffer rather than bound
/// to memory directly, but still carries a binding for address tracking.
#[derive(Debug, Default)]
pub struct AccelerationStructureRecord {
    pub base: Trackable,
    pub binding: Binding,
    pub buffer_index: u32,
    pub ty: vk::AccelerationStructureTypeKHR,
    pub offset: vk::DeviceSize,
    pub flags: vk::AccelerationStructureCreateFlagsKHR,
}

tracked!(AccelerationStructureRecord);

/// Shader modules (SPIR-V word sequences).
#[derive(Debug, Default)]
pub struct ShaderModuleRecord {
    pub base: Trackable,
    pub device_index: u32,
    pub code: Vec<u32>,
    pub enables_device_address: bool,
    pub calls: u32,
}

tracked!(ShaderModuleRecord);

/// One shader stage of a pipeline.
#[derive(Clone, Debug, Default)]
pub struct ShaderStage {
    pub index: u32,
    pub flags: vk::PipelineShaderStageCreateFlags,
    pub stage: vk::ShaderStageFlags,
    pub module_index: u32,
    pub entry_point: String,
    pub specialization: Vec<vk::SpecializationMapEntry>,
    pub specialization_data: Vec<u8>,
}

/// A ray tracing shader group.
#[derive(Clone, Copy, Debug, Default)]
pub struct RayTracingGroup {
    pub ty: vk::RayTracingShaderGroupTypeKHR,
    pub general: u32,
    pub closest_hit: u32,
    pub any_hit: u32,
    pub intersection: u32,
}

/// Pipeline objects.
#[derive(Debug, Default)]
pub struct PipelineRecord {
    pub base: Trackable,
    pub device_index: u32,
    pub bind_point: vk::PipelineBindPoint,
    pub flags: vk::PipelineCreateFlags,
    pub stages: Vec<ShaderStage>,
    pub groups: Vec<RayTracingGroup>,
}

tracked!(PipelineRecord);

/// Commands recorded into a command buffer that matter for memory tracking
/// and post-processing. Variable-length payloads are owned by the record.
#[derive(Clone, Debug)]
pub enum RecordedCommand {
    BindPipeline {
        bind_point: vk::PipelineBindPoint,
        pipeline_index: u32,
    },
    BindDescriptorSets {
        bind_point: vk::PipelineBindPoint,
        first_set: u32,
        sets: Vec<u32>,
        dynamic_offsets: Vec<u32>,
    },
    PushDescriptorSet {
        bind_point: vk::PipelineBindPoint,
        set: u32,
    },
    PushConstants {
        stages: vk::ShaderStageFlags,
        offset: u32,
        values: Vec<u8>,
    },
    UpdateBuffer {
        buffer_index: u32,
        offset: vk::DeviceSize,
        values: Vec<u8>,
    },
    CopyBuffer {
        src_index: u32,
        dst_index: u32,
        regions: Vec<vk::BufferCopy>,
    },
    BindShaders {
        stages: Vec<vk::ShaderStageFlags>,
        shader_indices: Vec<u32>,
    },
    Draw,
    Dispatch,
    TraceRays,
}

/// Key of an object in the touched-memory map: its type and index.
pub type TouchKey = (vk::ObjectType, u32);

/// Per-object exposure accumulated while commands reference bound memory.
pub type TouchedMap = std::collections::HashMap<TouchKey, RangeSet>;

/// Merge the ranges of `other` into `touched`.
pub fn touch_merge(touched: &mut TouchedMap, other: &TouchedMap) {
    for (key, ranges) in other {
        let slot = touched.entry(*key).or_default();
        for span in ranges.iter() {
            slot.add(span.first, span.last);
        }
    }
}

/// Command buffer objects.
#[derive(Debug, Default)]
pub struct CommandBufferRecord {
    pub base: Trackable,
    pub device_index: u32,
    pub pool_index: u32,
    pub level: vk::CommandBufferLevel,
    pub commands: Vec<RecordedCommand>,
    pub touched: TouchedMap,
}

tracked!(CommandBufferRecord);

impl CommandBufferRecord {
    /// Track a memory region this command buffer may read on the device.
    pub fn touch(&mut self, key: TouchKey, offset: vk::DeviceSize, size: vk::DeviceSize) {
        self.touched.entry(key).or_default().add_os(offset, size);
    }
}

/// Swapchain objects; the replay side swaps these for virtual images.
#[derive(Debug, Default)]
pub struct SwapchainRecord {
    pub base: Trackable,
    pub device_index: u32,
    pub width: u32,
    pub height: u32,
    pub format: vk::Format,
    pub image_count: u32,
    pub image_indices: Vec<u32>,
}

tracked!(SwapchainRecord);

/// Device objects.
#[derive(Debug, Default)]
pub struct DeviceRecord {
    pub base: Trackable,
    pub physical_device_index: u32,

    /// Trust the application to notify us about memory updates?
    pub explicit_host_updates: bool,
}

tracked!(DeviceRecord);

/// Fence objects. The frame delay fuse spreads fence waits over frames on
/// replay.
#[derive(Debug, Default)]
pub struct FenceRecord {
    pub base: Trackable,
    pub flags: vk::FenceCreateFlags,
    pub frame_delay: i32,
}

tracked!(FenceRecord);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_machine_is_monotone() {
        let mut t = Trackable::default();
        t.index = 0;
        t.enter_initialized();
        t.enter_created();
        t.enter_bound();
        t.enter_destroyed();
        assert!(t.is_destroyed());
    }

    #[test]
    #[should_panic]
    fn destroyed_cannot_rebind() {
        let mut t = Trackable::default();
        t.enter_created();
        t.enter_destroyed();
        t.enter_bound();
    }

    #[test]
    fn fake_handles_are_never_null() {
        let buffer: vk::Buffer = fake_handle(0);
        assert_eq!(buffer.as_raw(), 1);
        let memory: vk::DeviceMemory = fake_handle(41);
        assert_eq!(memory.as_raw(), 42);
    }

    #[test]
    fn aliasing_links_one_to_one() {
        let mut memory = MemoryRecord::default();
        let a = AliasRef {
            object_type: vk::ObjectType::BUFFER,
            index: 0,
        };
        let b = AliasRef {
            object_type: vk::ObjectType::IMAGE,
            index: 3,
        };
        assert_eq!(memory.bind(256, a), None);
        assert_eq!(memory.bind(256, b), Some(a));
        memory.unbind(256, a);
        assert_eq!(memory.bind(256, a), Some(b));
    }

    #[test]
    fn touch_accumulates() {
        let mut cmd = CommandBufferRecord::default();
        let key = (vk::ObjectType::BUFFER, 5);
        cmd.touch(key, 0, 16);
        cmd.touch(key, 16, 16);
        assert_eq!(cmd.touched[&key].bytes(), 32);
        assert_eq!(cmd.touched[&key].len(), 1);

        let mut other = TouchedMap::default();
        other.entry(key).or_default().add_os(100, 10);
        touch_merge(&mut cmd.touched, &other);
        assert_eq!(cmd.touched[&key].len(), 2);
    }
}
