//! Capture a live stream of Vulkan commands into a compact, portable trace
//! archive, and replay it deterministically somewhere else.
//!
//! # Architecture
//!
//! Every application thread that issues API calls gets its own append-only
//! binary stream ([`stream`]), chunked and compressed on worker threads.
//! Objects are tracked in per-type registries ([`track`]) whose dense
//! indices, not raw handles, travel on the wire. Mapped memory is captured
//! differentially ([`memscan`]) against shadow copies. The whole trace packs
//! into a single archive file ([`pak`]) together with JSON sidecars
//! ([`sidecar`]).
//!
//! On the way back, [`replay`] runs one worker per captured stream and
//! re-establishes cross-thread ordering from barrier packets and handle
//! references, while [`suballoc`] packs recreated resources into large
//! device memory heaps.
//!
//! The core forwards nothing to Vulkan itself: call forwarding, device
//! memory allocation and window-system plumbing enter through the small
//! traits on [`replay`] and [`suballoc`].
//!
//! # Example
//!
//! Capturing two calls and packing the archive:
//!
//! ```no_run
//! use lava::{capture::Tracer, config::CaptureInfo};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let tracer = Tracer::new(CaptureInfo::new("/tmp/myapp").build())?;
//! let create_buffer = tracer.register_function("vkCreateBuffer");
//!
//! let writer = tracer.writer();
//! let mut stream = writer.begin_call(create_buffer);
//! stream.write_u64(65536); // size
//! drop(stream);
//!
//! tracer.new_frame();
//! let archive = tracer.finish()?;
//! # Ok(()) }
//! ```

pub mod capture;
pub mod config;
pub mod feature;
pub mod memscan;
pub mod pak;
pub mod range;
pub mod replay;
pub mod scratch;
pub mod sidecar;
pub mod stream;
pub mod suballoc;
pub mod track;

/// The types almost every embedder needs.
pub mod prelude {
    pub use {
        super::{
            capture::{ThreadWriter, Tracer},
            config::{CaptureInfo, ReplayInfo},
            replay::{FunctionRegistry, Player},
            stream::{Compression, PacketTag, WireHandle},
            track::ChangeSource,
        },
        log::{debug, error, info, trace, warn},
    };
}

/// Only required when you are not running a capture or replay but still
/// using the container types and you want debugging setup.
pub fn init_debug() {
    pretty_env_logger::init();
}
