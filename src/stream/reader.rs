//! Chunked stream reader
//!
//! Inverse of the writer: a decompressor worker reads framed chunks from the
//! archive and feeds uncompressed chunks through a bounded queue to the
//! consuming thread. A preload primitive lets replay block until a target
//! amount of the stream has been decompressed, for deterministic frame
//! warm-up.

use {
    super::{Compression, WireHandle, CHUNK_HEADER_SIZE},
    byteorder::{ByteOrder, LittleEndian},
    crossbeam_channel::{unbounded, Receiver, TryRecvError},
    log::{debug, error, trace},
    std::{
        io::{self, Read},
        sync::{
            atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering},
            Arc,
        },
        thread::{sleep, Builder as ThreadBuilder, JoinHandle},
        time::Duration,
    },
};

/// Chunks the decompressor may buffer ahead of the consumer by default.
pub const DEFAULT_READAHEAD_CHUNKS: usize = 3;

struct FeedState {
    /// Uncompressed bytes produced so far.
    produced: AtomicU64,

    /// Chunks currently queued between decompressor and consumer.
    queued: AtomicUsize,

    /// Readahead watermark; the decompressor idles above it.
    readahead: AtomicUsize,

    /// The decompressor reached the end of its input.
    done: AtomicBool,

    /// Unique number of times the consumer caught up with the decompressor.
    caught: AtomicU32,
}

enum Feed {
    Threaded {
        rx: Receiver<Vec<u8>>,
        worker: Option<JoinHandle<()>>,
    },
    Inline {
        source: Box<dyn Read + Send>,
        compression: Compression,
    },
}

/// Reader half of one per-thread packet stream.
pub struct StreamReader {
    chunk: Vec<u8>,
    uidx: usize,
    consumed_bytes: u64,
    feed: Feed,
    state: Arc<FeedState>,
    default_readahead: usize,
}

impl StreamReader {
    /// Read framed chunks from `source`, decompressing on a worker thread.
    pub fn new(
        source: Box<dyn Read + Send>,
        compression: Compression,
        readahead_chunks: usize,
        multithreaded: bool,
    ) -> Self {
        let state = Arc::new(FeedState {
            produced: AtomicU64::new(0),
            queued: AtomicUsize::new(0),
            readahead: AtomicUsize::new(readahead_chunks),
            done: AtomicBool::new(false),
            caught: AtomicU32::new(0),
        });

        let feed = if multithreaded {
            let (tx, rx) = unbounded::<Vec<u8>>();
            let worker_state = Arc::clone(&state);
            let worker = ThreadBuilder::new()
                .name("decompressor".to_string())
                .spawn(move || {
                    let mut source = source;
                    loop {
                        while worker_state.queued.load(Ordering::Acquire)
                            >= worker_state.readahead.load(Ordering::Relaxed)
                        {
                            sleep(Duration::from_millis(10));
                        }

                        match read_framed_chunk(&mut source, compression) {
                            Ok(Some(chunk)) => {
                                worker_state
                                    .produced
                                    .fetch_add(chunk.len() as u64, Ordering::Release);
                                worker_state.queued.fetch_add(1, Ordering::Release);
                                if tx.send(chunk).is_err() {
                                    break;
                                }
                            }
                            Ok(None) => break,
                            Err(err) => {
                                error!("failed to decompress stream chunk: {err}");
                                break;
                            }
                        }
                    }
                    worker_state.done.store(true, Ordering::Release);
                })
                .expect("failed to spawn decompressor thread");

            Feed::Threaded {
                rx,
                worker: Some(worker),
            }
        } else {
            Feed::Inline {
                source,
                compression,
            }
        };

        Self {
            chunk: Vec::new(),
            uidx: 0,
            consumed_bytes: 0,
            feed,
            state,
            default_readahead: readahead_chunks,
        }
    }

    /// Total uncompressed bytes consumed so far.
    pub fn consumed_bytes(&self) -> u64 {
        self.consumed_bytes
    }

    /// Unique number of times the consumer had to wait for the decompressor.
    pub fn times_caught_decompressor(&self) -> u32 {
        self.state.caught.load(Ordering::Relaxed)
    }

    /// Block until at least `target` uncompressed bytes have been produced
    /// (or the stream ends). Lifts the readahead watermark for the duration.
    pub fn initiate_preload(&self, target: u64) {
        self.state.readahead.store(usize::MAX, Ordering::Relaxed);
        while self.state.produced.load(Ordering::Acquire) < target
            && !self.state.done.load(Ordering::Acquire)
        {
            sleep(Duration::from_millis(10));
        }
        debug!(
            "preload reached {} bytes (target {target})",
            self.state.produced.load(Ordering::Relaxed)
        );
    }

    /// Restore the readahead watermark after a preload.
    pub fn reset_preload(&self) {
        self.state
            .readahead
            .store(self.default_readahead, Ordering::Relaxed);
    }

    fn install_chunk(&mut self, chunk: Vec<u8>) {
        debug_assert_eq!(self.remaining(), 0, "tried to skip past unread stream bytes");

        self.chunk = chunk;
        self.uidx = 0;
    }

    /// Wait for the next uncompressed chunk, or `None` at end of stream.
    fn fetch_chunk(&mut self) -> Option<Vec<u8>> {
        match &mut self.feed {
            Feed::Threaded { rx, .. } => {
                let mut caught = false;
                loop {
                    match rx.try_recv() {
                        Ok(chunk) => {
                            self.state.queued.fetch_sub(1, Ordering::Release);
                            return Some(chunk);
                        }
                        Err(TryRecvError::Disconnected) => return None,
                        Err(TryRecvError::Empty) => {
                            if !caught {
                                caught = true;
                                self.state.caught.fetch_add(1, Ordering::Relaxed);
                            }
                            sleep(Duration::from_millis(10));
                        }
                    }
                }
            }
            Feed::Inline {
                source,
                compression,
            } => match read_framed_chunk(source, *compression) {
                Ok(Some(chunk)) => {
                    self.state
                        .produced
                        .fetch_add(chunk.len() as u64, Ordering::Relaxed);
                    Some(chunk)
                }
                Ok(None) => {
                    self.state.done.store(true, Ordering::Relaxed);
                    None
                }
                Err(err) => {
                    error!("failed to decompress stream chunk: {err}");
                    self.state.done.store(true, Ordering::Relaxed);
                    None
                }
            },
        }
    }

    fn next_chunk(&mut self) -> bool {
        match self.fetch_chunk() {
            Some(chunk) => {
                self.install_chunk(chunk);
                true
            }
            None => false,
        }
    }

    #[inline]
    fn remaining(&self) -> usize {
        self.chunk.len() - self.uidx
    }

    #[inline]
    fn check_space(&mut self, size: usize) {
        if self.remaining() == 0 && size > 0 && !self.next_chunk() {
            panic!("truncated stream: wanted {size} more bytes at end of input");
        }
        assert!(
            size <= self.remaining(),
            "desynchronized stream: wanted {size} bytes, chunk has {}",
            self.remaining()
        );
    }

    /// True once every byte of the stream has been consumed.
    pub fn done(&mut self) -> bool {
        if self.remaining() > 0 {
            return false;
        }

        !self.next_chunk()
    }

    #[inline]
    fn take(&mut self, size: usize) -> &[u8] {
        let at = self.uidx;
        self.uidx += size;
        self.consumed_bytes += size as u64;
        &self.chunk[at..at + size]
    }

    pub fn read_u8(&mut self) -> u8 {
        self.check_space(1);
        self.take(1)[0]
    }

    pub fn read_i8(&mut self) -> i8 {
        self.read_u8() as i8
    }

    pub fn read_u16(&mut self) -> u16 {
        self.check_space(2);
        LittleEndian::read_u16(self.take(2))
    }

    pub fn read_i16(&mut self) -> i16 {
        self.read_u16() as i16
    }

    pub fn read_u32(&mut self) -> u32 {
        self.check_space(4);
        LittleEndian::read_u32(self.take(4))
    }

    pub fn read_i32(&mut self) -> i32 {
        self.read_u32() as i32
    }

    pub fn read_u64(&mut self) -> u64 {
        self.check_space(8);
        LittleEndian::read_u64(self.take(8))
    }

    pub fn read_i64(&mut self) -> i64 {
        self.read_u64() as i64
    }

    pub fn read_f32(&mut self) -> f32 {
        f32::from_bits(self.read_u32())
    }

    pub fn read_f64(&mut self) -> f64 {
        f64::from_bits(self.read_u64())
    }

    pub fn read_bytes_into(&mut self, dst: &mut [u8]) {
        if dst.is_empty() {
            return;
        }

        self.check_space(dst.len());
        dst.copy_from_slice(self.take(dst.len()));
    }

    pub fn read_vec(&mut self, len: usize) -> Vec<u8> {
        let mut dst = vec![0u8; len];
        self.read_bytes_into(&mut dst);
        dst
    }

    /// Discard `len` bytes.
    pub fn skip(&mut self, len: usize) {
        if len > 0 {
            self.check_space(len);
            let _ = self.take(len);
        }
    }

    pub fn read_u32_vec(&mut self, count: usize) -> Vec<u32> {
        let mut dst = Vec::with_capacity(count);
        for _ in 0..count {
            dst.push(self.read_u32());
        }
        dst
    }

    pub fn read_u64_vec(&mut self, count: usize) -> Vec<u64> {
        let mut dst = Vec::with_capacity(count);
        for _ in 0..count {
            dst.push(self.read_u64());
        }
        dst
    }

    pub fn read_string(&mut self) -> String {
        let len = self.read_u16() as usize;
        let bytes = self.read_vec(len);
        let text = String::from_utf8_lossy(&bytes).into_owned();
        trace!("read string \"{text}\" (len={len})");

        text
    }

    pub fn read_string_array(&mut self, count: usize) -> Vec<String> {
        (0..count).map(|_| self.read_string()).collect()
    }

    pub fn read_handle(&mut self) -> WireHandle {
        WireHandle {
            index: self.read_u32(),
            thread: self.read_i8(),
            call: self.read_u16(),
        }
    }

    /// Reapply a sparse patch into `buf`, invoking `on_segment` for each
    /// applied segment with its target offset. Returns the number of patched
    /// bytes. With no buffer the patch is consumed and dropped.
    pub fn read_patch(
        &mut self,
        mut buf: Option<&mut [u8]>,
        mut on_segment: impl FnMut(u64, &[u8]),
    ) -> u64 {
        let mut cursor = 0u64;
        let mut changed = 0u64;
        loop {
            let offset = self.read_u32();
            cursor += offset as u64;
            let size = self.read_u32() as usize;
            if offset == 0 && size == 0 {
                break;
            }
            if size > 0 {
                self.check_space(size);
                let payload = self.take(size);
                if let Some(buf) = buf.as_deref_mut() {
                    assert!(
                        cursor as usize + size <= buf.len(),
                        "patch segment spills past target buffer"
                    );
                    buf[cursor as usize..cursor as usize + size].copy_from_slice(payload);
                    on_segment(cursor, &buf[cursor as usize..cursor as usize + size]);
                }
                cursor += size as u64;
                changed += size as u64;
            }
        }

        changed
    }
}

impl Drop for StreamReader {
    fn drop(&mut self) {
        if let Feed::Threaded { rx, worker } = &mut self.feed {
            // unblock the worker if it is parked on the watermark
            self.state.readahead.store(usize::MAX, Ordering::Relaxed);
            while rx.try_recv().is_ok() {}
            if let Some(worker) = worker.take() {
                if worker.join().is_err() {
                    error!("decompressor thread panicked");
                }
            }
        }
    }
}

/// Read one `(compressed size, uncompressed size)` header and its payload.
/// Returns `None` on a clean end of input.
fn read_framed_chunk(
    source: &mut (impl Read + ?Sized),
    compression: Compression,
) -> io::Result<Option<Vec<u8>>> {
    let mut header = [0u8; CHUNK_HEADER_SIZE];
    let mut at = 0;
    while at < header.len() {
        match source.read(&mut header[at..]) {
            Ok(0) if at == 0 => return Ok(None),
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "truncated chunk header",
                ))
            }
            Ok(read) => at += read,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }

    let compressed_size = LittleEndian::read_u64(&header[0..8]) as usize;
    let uncompressed_size = LittleEndian::read_u64(&header[8..16]) as usize;
    let mut payload = vec![0u8; compressed_size];
    source.read_exact(&mut payload)?;

    compression.decompress(&payload, uncompressed_size).map(Some)
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::stream::writer::StreamWriter,
        std::fs::File,
    };

    fn reopen(path: &std::path::Path, compression: Compression, multithreaded: bool) -> StreamReader {
        StreamReader::new(
            Box::new(File::open(path).unwrap()),
            compression,
            DEFAULT_READAHEAD_CHUNKS,
            multithreaded,
        )
    }

    #[test]
    fn primitives_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.bin");
        let mut writer =
            StreamWriter::create(&path, Compression::None, 64, false, false).unwrap();
        writer.write_u8(8);
        writer.write_u16(16);
        writer.write_u32(32);
        writer.write_u64(64);
        writer.write_f32(1.5);
        writer.write_f64(-2.25);
        writer.write_str("test1");
        writer.finalize();

        for multithreaded in [false, true] {
            let mut reader = reopen(&path, Compression::None, multithreaded);
            assert_eq!(reader.read_u8(), 8);
            assert_eq!(reader.read_u16(), 16);
            assert_eq!(reader.read_u32(), 32);
            assert_eq!(reader.read_u64(), 64);
            assert_eq!(reader.read_f32(), 1.5);
            assert_eq!(reader.read_f64(), -2.25);
            assert_eq!(reader.read_string(), "test1");
            assert!(reader.done());
        }
    }

    #[test]
    fn patch_applies() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.bin");
        let mut writer =
            StreamWriter::create(&path, Compression::None, 4096, false, false).unwrap();

        let mut shadow = vec![0u8; 32];
        let mut live = vec![0u8; 32];
        live[3] = 3;
        live[24] = 24;
        writer.write_patch(&mut shadow, &live, 0);
        writer.finalize();

        let mut reader = reopen(&path, Compression::None, false);
        let mut target = vec![0u8; 32];
        let mut segments = Vec::new();
        let changed = reader.read_patch(Some(&mut target), |offset, bytes| {
            segments.push((offset, bytes.len()));
        });
        assert_eq!(changed, 16);
        assert_eq!(target, live);
        assert_eq!(segments, vec![(0, 8), (24, 8)]);
    }

    #[test]
    fn preload_runs_to_completion() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.bin");
        let mut writer =
            StreamWriter::create(&path, Compression::Snap, 256, false, false).unwrap();
        for value in 0..4096u32 {
            writer.write_u32(value);
        }
        writer.finalize();

        let reader = reopen(&path, Compression::Snap, true);
        reader.initiate_preload(4096 * 4);
        reader.reset_preload();
        let mut reader = reader;
        for value in 0..4096u32 {
            assert_eq!(reader.read_u32(), value);
        }
        assert!(reader.done());
    }
}
