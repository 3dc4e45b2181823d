//! JSON sidecar files
//!
//! Next to the binary streams a trace archive carries a handful of JSON
//! files for replay bootstrapping and human diagnostics. Serde models for
//! each of them live here, along with the helpers for writing one out.

use {
    log::error,
    serde::{Deserialize, Serialize},
    std::{collections::BTreeMap, fs::File, io, path::Path},
};

/// `dictionary.json`: function name to stream id.
pub type Dictionary = BTreeMap<String, u16>;

/// `limits.json`: highest index ever used, per tracked type. Drives replay
/// pre-allocation.
pub type Limits = BTreeMap<String, u32>;

/// What the application told the instance about itself.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct ApplicationInfo {
    #[serde(rename = "applicationName")]
    pub application_name: String,
    #[serde(rename = "applicationVersion")]
    pub application_version: String,
    #[serde(rename = "engineName")]
    pub engine_name: String,
    #[serde(rename = "engineVersion")]
    pub engine_version: String,
    #[serde(rename = "apiVersion")]
    pub api_version: String,
}

/// Snapshot of the capture-time device, as presented to the application.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct DeviceSnapshot {
    #[serde(rename = "deviceName")]
    pub device_name: String,
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    #[serde(rename = "driverVersion")]
    pub driver_version: u32,
    #[serde(rename = "vendorID")]
    pub vendor_id: u32,
    #[serde(rename = "deviceID")]
    pub device_id: u32,
    #[serde(default, rename = "deviceExtensions")]
    pub device_extensions: Vec<String>,
}

/// `metadata.json`: capture counters and environment.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct Metadata {
    pub version_major: u32,
    pub version_minor: u32,
    pub version_patch: u32,

    /// Number of frames in the whole trace (one past the highest zero-based
    /// frame).
    pub global_frames: u32,

    /// Number of per-thread streams.
    pub threads: u32,

    /// Chunk codec the streams were written with.
    pub compression: crate::stream::Compression,

    #[serde(rename = "applicationInfo")]
    pub application: ApplicationInfo,

    #[serde(rename = "devicePresented")]
    pub device: DeviceSnapshot,
}

/// One frame boundary of one thread.
#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
pub struct FrameEntry {
    pub global_frame: u32,
    pub local_frame: u32,

    /// Start position in the uncompressed byte stream for this frame.
    pub position: u64,
}

/// `frames_<tid>.json`: per-thread frame list.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct ThreadFrames {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_name: Option<String>,
    pub uncompressed_size: u64,
    pub highest_global_frame: u32,
    pub frames: Vec<FrameEntry>,
}

/// One record descriptor inside `tracking.json`. Type-specific attributes
/// ride in `extra`.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct TrackingEntry {
    pub index: u32,
    pub frame_created: u32,
    pub frame_destroyed: u32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// `tracking.json`: per-type record descriptors.
pub type Tracking = BTreeMap<String, Vec<TrackingEntry>>;

/// Per-frame capture statistics, one entry in `debug.json`.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize)]
pub struct FrameStats {
    pub frame: u32,
    pub flushes_queue: u32,
    pub flushes_event: u32,
    pub memory_devices: u32,
    pub memory_dumps: u32,
    pub memory_scans: u32,
    pub memory_bytes: u64,
    pub memory_changed_bytes: u64,
    pub memory_scans_unchanged: u32,
}

/// `debug.json`: capture statistics for every frame.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct DebugSidecar {
    pub global_frames: u32,
    pub frames: Vec<FrameStats>,
}

/// Write one sidecar. Failures are logged, not fatal: a trace without its
/// diagnostics is still a trace.
pub fn write_json<T: Serialize>(path: impl AsRef<Path>, value: &T) {
    let path = path.as_ref();
    match File::create(path) {
        Ok(file) => {
            if let Err(err) = serde_json::to_writer_pretty(io::BufWriter::new(file), value) {
                error!("failed to write {}: {err}", path.display());
            }
        }
        Err(err) => error!("failed to create {}: {err}", path.display()),
    }
}
