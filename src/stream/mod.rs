//! Per-thread binary packet streams
//!
//! Each traced thread owns one append-only byte stream, written and read back
//! through chunked compression pipelines. This module holds what both sides
//! share: the packet taxonomy, the wire form of object handles, and the
//! interchangeable compression codec.

pub mod reader;
pub mod writer;

pub use self::{reader::StreamReader, writer::StreamWriter};

use {
    brotli::{CompressorWriter as BrotliWriter, Decompressor as BrotliReader},
    serde::{Deserialize, Serialize},
    snap::{read::FrameDecoder as SnapReader, write::FrameEncoder as SnapWriter},
    std::io::{self, Read, Write},
};

/// Index value meaning "no object".
pub const INVALID_INDEX: u32 = u32::MAX;

/// Index value standing in for a null handle on the wire.
pub const NULL_VALUE: u32 = u32::MAX - 1;

/// Size of the per-chunk header: compressed then uncompressed size, both `u64`.
pub const CHUNK_HEADER_SIZE: usize = 16;

/// Default staging chunk size.
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024 * 64;

/// In-stream packet types.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum PacketTag {
    ApiCall = 2,
    ThreadBarrier = 3,
    ImageUpdate = 4,
    BufferUpdate = 5,
    ScApiCall = 6,
    TensorUpdate = 7,
}

impl PacketTag {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            2 => Self::ApiCall,
            3 => Self::ThreadBarrier,
            4 => Self::ImageUpdate,
            5 => Self::BufferUpdate,
            6 => Self::ScApiCall,
            7 => Self::TensorUpdate,
            _ => return None,
        })
    }
}

/// Wire form of an object handle: dense index, originating thread and the
/// last call on that thread which modified the object.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct WireHandle {
    pub index: u32,
    pub thread: i8,
    pub call: u16,
}

impl WireHandle {
    pub const NULL: Self = Self {
        index: NULL_VALUE,
        thread: -1,
        call: 0,
    };

    pub fn is_null(self) -> bool {
        self.index == NULL_VALUE
    }
}

/// Describes Brotli-based compression.
#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
pub struct BrotliParams {
    /// Buffer size.
    pub buf_size: usize,

    /// Compression quality.
    pub quality: u32,

    /// Window size.
    pub window_size: u32,
}

impl Default for BrotliParams {
    fn default() -> Self {
        Self {
            buf_size: 4096,
            quality: 2,
            window_size: 22,
        }
    }
}

/// The chunk payload codec. Interchangeable; the chunk header does not depend
/// on the choice.
#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
pub enum Compression {
    Brotli(BrotliParams),
    Snap,
    None,
}

impl Compression {
    /// Parse the `LAVA_COMPRESSION` form: a codec name with an optional level.
    pub fn parse(name: &str, level: Option<u32>) -> Option<Self> {
        Some(match name {
            "brotli" => Self::Brotli(BrotliParams {
                quality: level.unwrap_or_else(|| BrotliParams::default().quality),
                ..Default::default()
            }),
            "snap" | "snappy" => Self::Snap,
            "none" | "uncompressed" => Self::None,
            _ => return None,
        })
    }

    pub fn compress(self, data: &[u8]) -> io::Result<Vec<u8>> {
        match self {
            Self::Brotli(b) => {
                let mut res = Vec::with_capacity(data.len() / 2 + 64);
                let mut w = BrotliWriter::new(&mut res, b.buf_size, b.quality, b.window_size);
                w.write_all(data)?;
                drop(w);

                Ok(res)
            }
            Self::Snap => {
                let mut res = Vec::with_capacity(data.len() / 2 + 64);
                let mut w = SnapWriter::new(&mut res);
                w.write_all(data)?;
                w.flush()?;
                drop(w);

                Ok(res)
            }
            Self::None => Ok(data.to_vec()),
        }
    }

    pub fn decompress(self, data: &[u8], uncompressed_size: usize) -> io::Result<Vec<u8>> {
        let mut res = Vec::with_capacity(uncompressed_size);
        match self {
            Self::Brotli(b) => {
                BrotliReader::new(data, b.buf_size).read_to_end(&mut res)?;
            }
            Self::Snap => {
                SnapReader::new(data).read_to_end(&mut res)?;
            }
            Self::None => res.extend_from_slice(data),
        }

        if res.len() != uncompressed_size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "chunk decompressed to {} bytes, header said {}",
                    res.len(),
                    uncompressed_size
                ),
            ));
        }

        Ok(res)
    }
}

impl Default for Compression {
    fn default() -> Self {
        Self::Brotli(Default::default())
    }
}
