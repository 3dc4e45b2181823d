//! Stream round-trip coverage: anything written through a chunked writer
//! must read back identically through a chunked reader, at any chunk size.

use {
    lava::stream::{reader::StreamReader, writer::StreamWriter, Compression, WireHandle},
    rand::{rngs::SmallRng, Rng, SeedableRng},
    std::fs::File,
};

fn open_reader(path: &std::path::Path, compression: Compression) -> StreamReader {
    StreamReader::new(Box::new(File::open(path).unwrap()), compression, 3, true)
}

#[test]
fn primitive_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("thread_0.bin");

    let mut writer = StreamWriter::create(&path, Compression::None, 4096, true, true).unwrap();
    writer.write_u8(8);
    writer.write_u16(16);
    writer.write_u32(32);
    writer.write_u64(64);
    let array: Vec<u64> = (0..20).collect();
    writer.write_u64_array(&array);
    writer.write_str("test1");
    writer.write_str("test2");
    for _ in 0..65535u32 {
        writer.write_u16(99);
    }
    writer.write_u64(0xfeed);
    writer.finalize();

    let mut reader = open_reader(&path, Compression::None);
    assert_eq!(reader.read_u8(), 8);
    assert_eq!(reader.read_u16(), 16);
    assert_eq!(reader.read_u32(), 32);
    assert_eq!(reader.read_u64(), 64);
    assert_eq!(reader.read_u64_vec(20), array);
    assert_eq!(reader.read_string(), "test1");
    assert_eq!(reader.read_string(), "test2");
    for _ in 0..65535u32 {
        assert_eq!(reader.read_u16(), 99);
    }
    // the reader must land exactly on the next field
    assert_eq!(reader.read_u64(), 0xfeed);
    assert!(reader.done());
}

#[test]
fn round_trip_with_tiny_chunks_and_compression() {
    // chunk sizes down to a single primitive force constant chunk turnover
    for chunk_size in [16usize, 64, 999, 4096] {
        for compression in [
            Compression::None,
            Compression::Snap,
            Compression::Brotli(Default::default()),
        ] {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("t.bin");
            let mut writer =
                StreamWriter::create(&path, compression, chunk_size, true, true).unwrap();
            for value in 0..500u32 {
                writer.write_u32(value);
                writer.write_f32(value as f32 * 0.5);
            }
            writer.write_str("end of data");
            writer.finalize();

            let mut reader = open_reader(&path, compression);
            for value in 0..500u32 {
                assert_eq!(reader.read_u32(), value);
                assert_eq!(reader.read_f32(), value as f32 * 0.5);
            }
            assert_eq!(reader.read_string(), "end of data");
            assert!(reader.done());
        }
    }
}

#[test]
fn handles_and_floats_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("t.bin");
    let mut writer = StreamWriter::create(&path, Compression::Snap, 256, false, true).unwrap();
    let handle = WireHandle {
        index: 42,
        thread: 3,
        call: 1000,
    };
    writer.write_handle(handle);
    writer.write_handle(WireHandle::NULL);
    writer.write_f64(-1.25e300);
    writer.write_f32(f32::NAN);
    writer.finalize();

    let mut reader = open_reader(&path, Compression::Snap);
    assert_eq!(reader.read_handle(), handle);
    assert!(reader.read_handle().is_null());
    assert_eq!(reader.read_f64(), -1.25e300);
    // NaN travels bit-exact through the unsigned reinterpretation
    assert!(reader.read_f32().is_nan());
    assert!(reader.done());
}

#[test]
fn sparse_patch_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("t.bin");
    let mut writer = StreamWriter::create(&path, Compression::None, 4096, false, false).unwrap();

    // S2: original [1,2,3,4,5], modified [1,0,3,4,5]
    let mut shadow = vec![1u8, 2, 3, 4, 5];
    let modified = vec![1u8, 0, 3, 4, 5];
    writer.freeze();
    let changed = writer.write_patch(&mut shadow, &modified, 0);
    assert!(changed >= 1 && changed <= 5);
    assert_eq!(shadow, modified);

    // re-encoding the unchanged pair yields only the terminator
    writer.freeze();
    let changed = writer.write_patch(&mut shadow, &modified, 0);
    assert_eq!(changed, 0);
    assert_eq!(writer.thaw(), 8);
    writer.finalize();

    let mut reader = open_reader(&path, Compression::None);
    let mut target = vec![1u8, 2, 3, 4, 5];
    let applied = reader.read_patch(Some(&mut target), |_, _| ());
    assert_eq!(applied, changed_bytes(&[1, 2, 3, 4, 5], &modified));
    assert_eq!(target, modified);

    // the empty patch applies cleanly and changes nothing
    let applied = reader.read_patch(Some(&mut target), |_, _| ());
    assert_eq!(applied, 0);
    assert_eq!(target, modified);
    assert!(reader.done());
}

fn changed_bytes(_original: &[u8], modified: &[u8]) -> u64 {
    // the sub-stride tail is written whole once any of it differs
    modified.len() as u64
}

#[test]
fn fuzz_patch_generations() {
    const SIZE: usize = 1000;
    const GENERATIONS: usize = 25;

    let mut rng = SmallRng::seed_from_u64(99);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("t.bin");
    let mut writer = StreamWriter::create(&path, Compression::Snap, 512, false, false).unwrap();

    // a random baseline, then generations of random scribbles, each captured
    // as a diff against the evolving shadow
    let original: Vec<u8> = (0..SIZE).map(|_| rng.gen()).collect();
    let mut shadow = original.clone();
    let mut live = original.clone();
    for _ in 0..GENERATIONS {
        for _ in 0..rng.gen_range(0..30) {
            let at = rng.gen_range(0..SIZE);
            live[at] = rng.gen();
        }
        writer.write_patch(&mut shadow, &live, 0);
        assert_eq!(shadow, live);
    }
    writer.finalize();

    // applying every patch in order onto the baseline reconstructs the
    // final bytes
    let mut reader = open_reader(&path, Compression::Snap);
    let mut target = original;
    for _ in 0..GENERATIONS {
        reader.read_patch(Some(&mut target), |_, _| ());
    }
    assert_eq!(target, live);
    assert!(reader.done());
}

#[test]
fn larger_patches_apply_over_chunk_boundaries() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("t.bin");
    let mut writer = StreamWriter::create(&path, Compression::None, 128, false, false).unwrap();

    let mut shadow = vec![0u8; 100_000];
    let mut live = vec![0u8; 100_000];
    for at in (0..100_000).step_by(977) {
        live[at] = (at % 251) as u8 + 1;
    }
    writer.write_patch(&mut shadow, &live, 0);
    writer.finalize();

    let mut reader = open_reader(&path, Compression::None);
    let mut target = vec![0u8; 100_000];
    reader.read_patch(Some(&mut target), |_, _| ());
    assert_eq!(target, live);
}
