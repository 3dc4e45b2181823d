//! Capture and replay options
//!
//! Everything here has a sensible default and an optional environment
//! override, so a tracing layer can run with zero configuration while still
//! being steerable from the outside.

use {
    crate::{
        stream::{reader::DEFAULT_READAHEAD_CHUNKS, Compression, DEFAULT_CHUNK_SIZE},
        suballoc::DEFAULT_HEAP_SIZE,
    },
    derive_builder::{Builder, UninitializedFieldError},
    log::warn,
    std::{env, path::PathBuf},
};

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let value = env::var(name).ok()?;
    match value.parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            warn!("ignoring unparsable {name}={value}");
            None
        }
    }
}

fn env_bool(name: &str) -> Option<bool> {
    env_parse::<u32>(name).map(|v| v != 0)
}

fn env_compression() -> Option<Compression> {
    let name = env::var("LAVA_COMPRESSION").ok()?;
    let level = env_parse::<u32>("LAVA_COMPRESSION_LEVEL");
    let parsed = Compression::parse(&name, level);
    if parsed.is_none() {
        warn!("ignoring unknown LAVA_COMPRESSION={name}");
    }
    parsed
}

/// Options of one capture run.
#[derive(Builder, Clone, Debug)]
#[builder(
    build_fn(private, name = "fallible_build", error = "CaptureInfoBuilderError"),
    derive(Debug),
    pattern = "owned"
)]
pub struct CaptureInfo {
    /// Base name of the trace; the archive lands at `<destination>.vk`.
    pub destination: PathBuf,

    /// Staging chunk size of the per-thread streams.
    #[builder(default = "DEFAULT_CHUNK_SIZE")]
    pub chunk_size: usize,

    #[builder(default)]
    pub compression: Compression,

    /// Run chunk compression on a worker thread per stream.
    #[builder(default = "true")]
    pub multithread_compress: bool,

    /// Run file write-out on a worker thread per stream.
    #[builder(default = "true")]
    pub multithread_writeout: bool,

    /// Skip differential scans when the application hands in marked ranges.
    #[builder(default)]
    pub trust_host_flushes: bool,

    #[builder(default = "DEFAULT_HEAP_SIZE")]
    pub heap_size: u64,
}

impl CaptureInfo {
    pub fn new(destination: impl Into<PathBuf>) -> CaptureInfoBuilder {
        CaptureInfoBuilder::default().destination(destination.into())
    }

    /// Defaults overridden by the documented `LAVA_*` environment knobs.
    pub fn from_env(fallback_destination: impl Into<PathBuf>) -> Self {
        let mut builder = Self::new(
            env::var("LAVA_DESTINATION")
                .map(PathBuf::from)
                .unwrap_or_else(|_| fallback_destination.into()),
        );
        if let Some(size) = env_parse("LAVA_CHUNK_SIZE") {
            builder = builder.chunk_size(size);
        }
        if let Some(compression) = env_compression() {
            builder = builder.compression(compression);
        }
        if let Some(disabled) = env_bool("LAVA_DISABLE_MULTITHREAD_COMPRESS") {
            builder = builder.multithread_compress(!disabled);
        }
        if let Some(disabled) = env_bool("LAVA_DISABLE_MULTITHREAD_WRITEOUT") {
            builder = builder.multithread_writeout(!disabled);
        }
        if let Some(trust) = env_bool("LAVA_TRUST_HOST_FLUSHES") {
            builder = builder.trust_host_flushes(trust);
        }
        if let Some(size) = env_parse("LAVA_HEAP_SIZE") {
            builder = builder.heap_size(size);
        }
        builder.build()
    }
}

impl CaptureInfoBuilder {
    /// Builds a new `CaptureInfo`.
    ///
    /// # Panics
    ///
    /// If `destination` has not been set this function will panic.
    pub fn build(self) -> CaptureInfo {
        match self.fallible_build() {
            Err(CaptureInfoBuilderError(err)) => panic!("{err}"),
            Ok(info) => info,
        }
    }
}

#[derive(Debug)]
struct CaptureInfoBuilderError(UninitializedFieldError);

impl From<UninitializedFieldError> for CaptureInfoBuilderError {
    fn from(err: UninitializedFieldError) -> Self {
        Self(err)
    }
}

/// Options of one replay run.
#[derive(Builder, Clone, Debug)]
#[builder(
    build_fn(private, name = "fallible_build", error = "ReplayInfoBuilderError"),
    derive(Debug),
    pattern = "owned"
)]
pub struct ReplayInfo {
    /// First global frame of interest.
    #[builder(default)]
    pub start_frame: u32,

    /// One past the last global frame to play, or `None` for the whole
    /// trace.
    #[builder(default)]
    pub end_frame: Option<u32>,

    /// Chunks each stream decompressor may buffer ahead.
    #[builder(default = "DEFAULT_READAHEAD_CHUNKS")]
    pub readahead_chunks: usize,

    /// Decompress the streams up to the start frame before dispatch begins.
    #[builder(default)]
    pub preload: bool,

    /// Run each stream's decompressor on a worker thread.
    #[builder(default = "true")]
    pub multithread_read: bool,

    /// Use dedicated allocations where the capture recorded a preference.
    #[builder(default = "true")]
    pub dedicated_allocation: bool,

    #[builder(default = "DEFAULT_HEAP_SIZE")]
    pub heap_size: u64,
}

impl ReplayInfo {
    pub fn new() -> ReplayInfoBuilder {
        ReplayInfoBuilder::default()
    }

    /// Defaults overridden by the documented `LAVA_*` environment knobs.
    pub fn from_env() -> Self {
        let mut builder = Self::new();
        if let Some(chunks) = env_parse("LAVA_READAHEAD") {
            builder = builder.readahead_chunks(chunks);
        }
        if let Some(disabled) = env_bool("LAVA_DISABLE_MULTITHREAD_READ") {
            builder = builder.multithread_read(!disabled);
        }
        if let Some(preload) = env_bool("LAVA_PRELOAD") {
            builder = builder.preload(preload);
        }
        if let Some(dedicated) = env_bool("LAVA_DEDICATED_ALLOCATION") {
            builder = builder.dedicated_allocation(dedicated);
        }
        if let Some(size) = env_parse("LAVA_HEAP_SIZE") {
            builder = builder.heap_size(size);
        }
        builder.build()
    }
}

impl ReplayInfoBuilder {
    /// Builds a new `ReplayInfo`.
    pub fn build(self) -> ReplayInfo {
        match self.fallible_build() {
            Err(ReplayInfoBuilderError(err)) => panic!("{err}"),
            Ok(info) => info,
        }
    }
}

#[derive(Debug)]
struct ReplayInfoBuilderError(UninitializedFieldError);

impl From<UninitializedFieldError> for ReplayInfoBuilderError {
    fn from(err: UninitializedFieldError) -> Self {
        Self(err)
    }
}

impl Default for ReplayInfo {
    fn default() -> Self {
        Self::new().build()
    }
}
