//! Chunked stream writer
//!
//! An append-only byte stream split across three cooperating workers: the
//! producing thread fills a staging chunk, a compressor thread turns full
//! chunks into framed compressed chunks, and a serializer thread pushes them
//! to disk. Either background stage can be disabled, in which case its work
//! happens on the producing thread.
//!
//! Bytes are never reordered with respect to the producing thread's writes.

use {
    super::{Compression, WireHandle, CHUNK_HEADER_SIZE, DEFAULT_CHUNK_SIZE},
    byteorder::{ByteOrder, LittleEndian},
    crossbeam_channel::{unbounded, Receiver, Sender},
    log::{debug, error, trace},
    std::{
        fs::File,
        io::{self, Write},
        path::Path,
        thread::{Builder as ThreadBuilder, JoinHandle},
    },
};

/// Writer half of one per-thread packet stream.
pub struct StreamWriter {
    chunk: Vec<u8>,
    chunk_size: usize,
    compression: Compression,
    uncompressed_bytes: u64,
    checkpoint_bytes: u64,
    stages: Stages,
}

enum Stages {
    /// Compressor and serializer both run on their own threads.
    Threaded {
        to_compress: Sender<Vec<u8>>,
        compressor: JoinHandle<()>,
        serializer: JoinHandle<()>,
    },

    /// Compression happens on the producing thread, write-out on a worker.
    InlineCompress {
        to_serialize: Sender<Vec<u8>>,
        serializer: JoinHandle<()>,
    },

    /// Everything happens on the producing thread.
    Synchronous { file: File },

    /// Finalized; further writes are discarded.
    Finished,
}

impl StreamWriter {
    pub fn create(
        path: impl AsRef<Path>,
        compression: Compression,
        chunk_size: usize,
        threaded_compress: bool,
        threaded_writeout: bool,
    ) -> io::Result<Self> {
        let path = path.as_ref();
        let file = File::create(path)?;

        debug!(
            "created stream {} (chunk size {}, compress thread {}, write thread {})",
            path.display(),
            chunk_size,
            threaded_compress,
            threaded_writeout
        );

        let stages = if threaded_writeout {
            let (to_serialize, from_compress) = unbounded::<Vec<u8>>();
            let serializer = ThreadBuilder::new()
                .name("serializer".to_string())
                .spawn(move || serializer(from_compress, file))
                .expect("failed to spawn serializer thread");

            if threaded_compress {
                let (to_compress, from_producer) = unbounded::<Vec<u8>>();
                let compressor = ThreadBuilder::new()
                    .name("compressor".to_string())
                    .spawn(move || compressor(from_producer, to_serialize, compression))
                    .expect("failed to spawn compressor thread");

                Stages::Threaded {
                    to_compress,
                    compressor,
                    serializer,
                }
            } else {
                Stages::InlineCompress {
                    to_serialize,
                    serializer,
                }
            }
        } else {
            Stages::Synchronous { file }
        };

        Ok(Self {
            chunk: Vec::with_capacity(chunk_size),
            chunk_size,
            compression,
            uncompressed_bytes: 0,
            checkpoint_bytes: 0,
            stages,
        })
    }

    pub fn with_defaults(path: impl AsRef<Path>) -> io::Result<Self> {
        Self::create(path, Compression::default(), DEFAULT_CHUNK_SIZE, true, true)
    }

    /// Total uncompressed bytes appended so far.
    pub fn uncompressed_bytes(&self) -> u64 {
        self.uncompressed_bytes
    }

    /// Remember the current stream position.
    pub fn freeze(&mut self) {
        self.checkpoint_bytes = self.uncompressed_bytes;
    }

    /// Bytes appended since the last [`Self::freeze`].
    pub fn thaw(&self) -> u64 {
        self.uncompressed_bytes - self.checkpoint_bytes
    }

    fn flush_chunk(&mut self, needed: usize) {
        let fresh = Vec::with_capacity(self.chunk_size.max(needed));
        let full = std::mem::replace(&mut self.chunk, fresh);
        if full.is_empty() {
            return;
        }

        match &mut self.stages {
            Stages::Threaded { to_compress, .. } => {
                // The worker only ever quits on an unrecoverable error, which
                // it has already logged; drop the data.
                let _ = to_compress.send(full);
            }
            Stages::InlineCompress { to_serialize, .. } => {
                if let Some(framed) = frame_chunk(self.compression, &full) {
                    let _ = to_serialize.send(framed);
                }
            }
            Stages::Synchronous { file } => {
                if let Some(framed) = frame_chunk(self.compression, &full) {
                    if let Err(err) = write_retrying(file, &framed) {
                        error!("failed to write out stream chunk: {err}");
                    }
                }
            }
            Stages::Finished => (),
        }
    }

    #[inline]
    fn check_space(&mut self, size: usize) {
        if self.chunk.len() + size > self.chunk.capacity() {
            self.flush_chunk(size);
        }
    }

    #[inline]
    fn push(&mut self, bytes: &[u8]) {
        debug_assert!(self.chunk.len() + bytes.len() <= self.chunk.capacity());

        self.chunk.extend_from_slice(bytes);
        self.uncompressed_bytes += bytes.len() as u64;
    }

    pub fn write_u8(&mut self, value: u8) {
        self.check_space(1);
        self.push(&[value]);
    }

    pub fn write_i8(&mut self, value: i8) {
        self.write_u8(value as u8);
    }

    pub fn write_u16(&mut self, value: u16) {
        let mut buf = [0; 2];
        LittleEndian::write_u16(&mut buf, value);
        self.check_space(2);
        self.push(&buf);
    }

    pub fn write_i16(&mut self, value: i16) {
        self.write_u16(value as u16);
    }

    pub fn write_u32(&mut self, value: u32) {
        let mut buf = [0; 4];
        LittleEndian::write_u32(&mut buf, value);
        self.check_space(4);
        self.push(&buf);
    }

    pub fn write_i32(&mut self, value: i32) {
        self.write_u32(value as u32);
    }

    pub fn write_u64(&mut self, value: u64) {
        let mut buf = [0; 8];
        LittleEndian::write_u64(&mut buf, value);
        self.check_space(8);
        self.push(&buf);
    }

    pub fn write_i64(&mut self, value: i64) {
        self.write_u64(value as u64);
    }

    /// Floats travel bit-copied through their unsigned counterparts.
    pub fn write_f32(&mut self, value: f32) {
        self.write_u32(value.to_bits());
    }

    pub fn write_f64(&mut self, value: f64) {
        self.write_u64(value.to_bits());
    }

    pub fn write_bytes(&mut self, values: &[u8]) {
        if !values.is_empty() {
            self.check_space(values.len());
            self.push(values);
        }
    }

    pub fn write_u32_array(&mut self, values: &[u32]) {
        self.check_space(values.len() * 4);
        for &value in values {
            let mut buf = [0; 4];
            LittleEndian::write_u32(&mut buf, value);
            self.push(&buf);
        }
    }

    pub fn write_u64_array(&mut self, values: &[u64]) {
        self.check_space(values.len() * 8);
        for &value in values {
            let mut buf = [0; 8];
            LittleEndian::write_u64(&mut buf, value);
            self.push(&buf);
        }
    }

    /// Length-prefixed string: `u16` length, no terminator.
    pub fn write_str(&mut self, text: &str) {
        debug_assert!(text.len() <= u16::MAX as usize);

        self.write_u16(text.len() as u16);
        self.write_bytes(text.as_bytes());
        trace!("wrote string \"{text}\" (len={})", text.len());
    }

    /// A missing string is written as a zero length.
    pub fn write_string(&mut self, text: Option<&str>) {
        match text {
            Some(text) => self.write_str(text),
            None => self.write_u16(0),
        }
    }

    pub fn write_string_array(&mut self, strs: &[&str]) {
        for text in strs {
            self.write_str(text);
        }
    }

    pub fn write_handle(&mut self, handle: WireHandle) {
        self.write_u32(handle.index);
        self.write_i8(handle.thread);
        self.write_u16(handle.call);
    }

    /// Write out a diff of a memory area against its shadow copy, updating
    /// the shadow as changed bytes are emitted. The scan starts at `offset`
    /// and compares in 8-byte strides. Returns the number of payload bytes
    /// written out.
    #[profiling::function]
    pub fn write_patch(&mut self, shadow: &mut [u8], live: &[u8], offset: u64) -> u64 {
        assert_eq!(shadow.len(), live.len());
        assert!(offset as usize <= live.len());

        let mut pos = offset as usize;
        let mut total_left = live.len() - pos;
        let mut cursor = offset as u32;
        let mut changed = 0u64;

        while total_left > 0 {
            // Skip identical 8-byte words
            while total_left >= 8 && shadow[pos..pos + 8] == live[pos..pos + 8] {
                pos += 8;
                cursor += 8;
                total_left -= 8;
            }

            let record_offset = cursor;
            let run_start = pos;
            let mut run_len = 0usize;

            // Skip differing 8-byte words
            while total_left >= 8 && shadow[pos..pos + 8] != live[pos..pos + 8] {
                pos += 8;
                run_len += 8;
                total_left -= 8;
            }

            if run_len == 0
                && total_left < 8
                && shadow[pos..pos + total_left] == live[pos..pos + total_left]
            {
                // Unchanged trailing remainder, nothing more to do
                total_left = 0;
            } else if total_left < 8 {
                // The remainder rides along with the current diff run
                run_len += total_left;
                pos += total_left;
                total_left = 0;
            }

            if run_len > 0 {
                // Header and payload must land in one chunk so the reader can
                // copy the payload straight out of it.
                self.check_space(8 + run_len);

                let mut buf = [0; 8];
                LittleEndian::write_u32(&mut buf[0..4], record_offset);
                LittleEndian::write_u32(&mut buf[4..8], run_len as u32);
                self.push(&buf);
                self.push(&live[run_start..run_start + run_len]);

                shadow[run_start..run_start + run_len]
                    .copy_from_slice(&live[run_start..run_start + run_len]);
                changed += run_len as u64;

                // Later record offsets are relative to the end of this run
                cursor = 0;
            }
        }

        // Terminate with zero offset, zero size
        self.write_u32(0);
        self.write_u32(0);

        changed
    }

    /// Write a region of memory verbatim in patch form.
    pub fn write_memory(&mut self, data: &[u8], offset: u64, size: u64) {
        self.write_u32(offset as u32);
        self.write_u32(size as u32);
        self.check_space(size as usize);
        self.push(&data[offset as usize..(offset + size) as usize]);
        self.write_u32(0);
        self.write_u32(0);
    }

    /// Flush pending chunks, wind down the worker threads and close the file.
    ///
    /// The stream is unusable afterwards; further writes are discarded.
    pub fn finalize(&mut self) {
        if matches!(self.stages, Stages::Finished) {
            return;
        }

        self.flush_chunk(0);

        match std::mem::replace(&mut self.stages, Stages::Finished) {
            Stages::Threaded {
                to_compress,
                compressor,
                serializer,
            } => {
                drop(to_compress);
                if compressor.join().is_err() {
                    error!("compressor thread panicked");
                }
                if serializer.join().is_err() {
                    error!("serializer thread panicked");
                }
            }
            Stages::InlineCompress {
                to_serialize,
                serializer,
            } => {
                drop(to_serialize);
                if serializer.join().is_err() {
                    error!("serializer thread panicked");
                }
            }
            Stages::Synchronous { mut file } => {
                if let Err(err) = file.flush() {
                    error!("failed to flush stream: {err}");
                }
            }
            Stages::Finished => (),
        }
    }
}

impl Drop for StreamWriter {
    fn drop(&mut self) {
        self.finalize();
    }
}

/// Compress one chunk and put the 16-byte header in front of it.
fn frame_chunk(compression: Compression, raw: &[u8]) -> Option<Vec<u8>> {
    match compression.compress(raw) {
        Ok(packed) => {
            let mut framed = Vec::with_capacity(CHUNK_HEADER_SIZE + packed.len());
            let mut header = [0; CHUNK_HEADER_SIZE];
            LittleEndian::write_u64(&mut header[0..8], packed.len() as u64);
            LittleEndian::write_u64(&mut header[8..16], raw.len() as u64);
            framed.extend_from_slice(&header);
            framed.extend_from_slice(&packed);

            Some(framed)
        }
        Err(err) => {
            error!("failed to compress chunk of {} bytes: {err}", raw.len());

            None
        }
    }
}

fn write_retrying(file: &mut File, mut buf: &[u8]) -> io::Result<()> {
    while !buf.is_empty() {
        match file.write(buf) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "stream file refused more bytes",
                ))
            }
            Ok(written) => buf = &buf[written..],
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
                ) =>
            {
                continue
            }
            Err(err) => return Err(err),
        }
    }

    Ok(())
}

/// Moves chunks from the uncompressed queue to the compressed queue until the
/// producer hangs up, then drains and exits.
fn compressor(rx: Receiver<Vec<u8>>, tx: Sender<Vec<u8>>, compression: Compression) {
    while let Ok(raw) = rx.recv() {
        match frame_chunk(compression, &raw) {
            Some(framed) => {
                if tx.send(framed).is_err() {
                    error!("serializer hung up early - aborting compression");
                    break;
                }
            }
            // compress failure was already logged; nothing downstream can
            // recover the stream, so stop feeding it
            None => break,
        }
    }
}

/// Moves chunks from the compressed queue to disk until the compressor hangs
/// up, then drains and exits.
fn serializer(rx: Receiver<Vec<u8>>, mut file: File) {
    while let Ok(framed) = rx.recv() {
        if let Err(err) = write_retrying(&mut file, &framed) {
            error!("failed to write out stream ({} bytes left): {err}", framed.len());
            break;
        }
    }

    if let Err(err) = file.flush() {
        error!("failed to flush stream file: {err}");
    }
}
