//! Pack archive container
//!
//! A trace is one pack file holding the per-thread binary streams plus the
//! JSON sidecar files. The layout is a 9-byte signature followed by linked
//! index blocks; each block is a `u16` entry count, `count` entries of
//! `(u64 position, u64 length, [u8; 40] name)`, then (version 1) a `u64`
//! pointer to the next index block, zero-terminated. Version 0 archives have
//! exactly one index and cannot be appended to.

use {
    byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt},
    log::{debug, warn},
    serde::de::DeserializeOwned,
    std::{
        fs::{self, File, OpenOptions},
        io::{self, BufReader, Read, Seek, SeekFrom, Write},
        path::{Path, PathBuf},
    },
    thiserror::Error,
};

/// Current archive signature, including the terminating null.
pub const SIGNATURE: &[u8; 9] = b"LAVA0001\0";

/// Signature of archives written before indices could be chained.
pub const LEGACY_SIGNATURE: &[u8; 9] = b"LAVATUBE\0";

const NAME_LEN: usize = 40;

#[derive(Debug, Error)]
pub enum PakError {
    #[error("archive i/o failed: {0}")]
    Io(#[from] io::Error),

    #[error("not recognized as a trace archive (signature {0:?})")]
    BadSignature([u8; 9]),

    #[error("\"{0}\" not found inside the archive")]
    NotFound(String),

    #[error("\"{0}\" does not fit in a {max} byte archive name", max = NAME_LEN - 1)]
    NameTooLong(String),

    #[error("version 0 archives cannot be appended to")]
    NotAppendable,

    #[error("\"{0}\" is not valid JSON: {1}")]
    BadJson(String, #[source] serde_json::Error),
}

/// One file inside the archive.
#[derive(Clone, Debug)]
pub struct PakEntry {
    pub name: String,
    pub position: u64,
    pub length: u64,
}

/// An opened archive with all linked indices parsed.
pub struct PakFile {
    path: PathBuf,
    version: u8,
    entries: Vec<PakEntry>,

    /// Absolute offset of the final next-index pointer, where an append
    /// splices in.
    last_index_ptr_pos: u64,
}

impl PakFile {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, PakError> {
        let path = path.as_ref().to_path_buf();
        let mut file = BufReader::new(File::open(&path)?);

        let mut signature = [0u8; 9];
        file.read_exact(&mut signature)?;
        let version = if &signature == SIGNATURE {
            1
        } else if &signature == LEGACY_SIGNATURE {
            0
        } else {
            return Err(PakError::BadSignature(signature));
        };

        let mut entries = Vec::new();
        let mut last_index_ptr_pos = 0;
        loop {
            let count = file.read_u16::<LittleEndian>()?;
            for _ in 0..count {
                let position = file.read_u64::<LittleEndian>()?;
                let length = file.read_u64::<LittleEndian>()?;
                let mut name = [0u8; NAME_LEN];
                file.read_exact(&mut name)?;
                let end = name.iter().position(|&b| b == 0).unwrap_or(NAME_LEN);
                entries.push(PakEntry {
                    name: String::from_utf8_lossy(&name[..end]).into_owned(),
                    position,
                    length,
                });
            }

            if version == 0 {
                break;
            }

            last_index_ptr_pos = file.stream_position()?;
            let next = file.read_u64::<LittleEndian>()?;
            if next == 0 {
                break;
            }

            file.seek(SeekFrom::Start(next))?;
        }

        debug!(
            "opened archive {} (version {version}, {} files)",
            path.display(),
            entries.len()
        );

        Ok(Self {
            path,
            version,
            entries,
            last_index_ptr_pos,
        })
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn entries(&self) -> &[PakEntry] {
        &self.entries
    }

    /// Entry names starting with the given prefix, in index order.
    pub fn names_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.entries
            .iter()
            .filter(|e| e.name.starts_with(prefix))
            .map(|e| e.name.clone())
            .collect()
    }

    /// Open one file inside the archive as a bounded reader with its own
    /// file handle.
    pub fn open_inside(&self, name: &str) -> Result<PakSlice, PakError> {
        let entry = self
            .entries
            .iter()
            .find(|e| e.name == name)
            .ok_or_else(|| PakError::NotFound(name.to_string()))?;

        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(entry.position))?;

        Ok(PakSlice {
            file,
            remaining: entry.length,
        })
    }

    /// Parse one contained file as JSON.
    pub fn read_json<T: DeserializeOwned>(&self, name: &str) -> Result<T, PakError> {
        let mut slice = self.open_inside(name)?;
        let mut data = Vec::with_capacity(slice.remaining as usize);
        slice.read_to_end(&mut data)?;

        serde_json::from_slice(&data).map_err(|err| PakError::BadJson(name.to_string(), err))
    }

    /// Append one file to a version 1 archive, per the append protocol:
    /// rewrite the final next-index pointer to the current end of file, then
    /// write a one-entry index block, a zero terminator and the file bytes.
    pub fn append(pack: impl AsRef<Path>, file: impl AsRef<Path>) -> Result<(), PakError> {
        let parsed = Self::open(&pack)?;
        if parsed.version == 0 {
            return Err(PakError::NotAppendable);
        }

        let file = file.as_ref();
        let name = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let name = encode_name(&name)?;
        let payload = fs::read(file)?;

        let mut out = OpenOptions::new().write(true).open(pack.as_ref())?;
        let end = out.seek(SeekFrom::End(0))?;

        out.seek(SeekFrom::Start(parsed.last_index_ptr_pos))?;
        out.write_u64::<LittleEndian>(end)?;

        // one-entry index block: count, entry, terminator, then the payload
        let position = end + 2 + 8 + 8 + NAME_LEN as u64 + 8;
        out.seek(SeekFrom::Start(end))?;
        out.write_u16::<LittleEndian>(1)?;
        out.write_u64::<LittleEndian>(position)?;
        out.write_u64::<LittleEndian>(payload.len() as u64)?;
        out.write_all(&name)?;
        out.write_u64::<LittleEndian>(0)?;
        out.write_all(&payload)?;
        out.flush()?;

        Ok(())
    }

    /// Pack every non-hidden file of a directory into a new archive. With
    /// `erase` the source files (and the directory, if then empty) are
    /// removed afterwards.
    pub fn pack_directory(
        pack: impl AsRef<Path>,
        directory: impl AsRef<Path>,
        erase: bool,
    ) -> Result<(), PakError> {
        let directory = directory.as_ref();
        let mut names: Vec<PathBuf> = fs::read_dir(directory)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.is_file()
                    && !path
                        .file_name()
                        .map(|n| n.to_string_lossy().starts_with('.'))
                        .unwrap_or(true)
            })
            .collect();
        names.sort();

        let mut out = File::create(pack.as_ref())?;
        out.write_all(SIGNATURE)?;
        out.write_u16::<LittleEndian>(names.len() as u16)?;

        // Reserve the index, then stream the files in and come back to fix
        // the entries up.
        let index_pos = 9 + 2;
        let entry_size = (8 + 8 + NAME_LEN) as u64;
        let zeroes = vec![0u8; names.len() * entry_size as usize + 8];
        out.write_all(&zeroes)?;

        let mut entries = Vec::with_capacity(names.len());
        for path in &names {
            let position = out.stream_position()?;
            let mut src = File::open(path)?;
            let length = io::copy(&mut src, &mut out)?;
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            entries.push((encode_name(&name)?, position, length));
        }

        out.seek(SeekFrom::Start(index_pos))?;
        for (name, position, length) in &entries {
            out.write_u64::<LittleEndian>(*position)?;
            out.write_u64::<LittleEndian>(*length)?;
            out.write_all(name)?;
        }
        out.write_u64::<LittleEndian>(0)?;
        out.sync_all()?;

        if erase {
            for path in &names {
                if let Err(err) = fs::remove_file(path) {
                    warn!("could not remove {}: {err}", path.display());
                }
            }
            if let Err(err) = fs::remove_dir(directory) {
                warn!("could not remove {}: {err}", directory.display());
            }
        }

        Ok(())
    }

    /// Extract every contained file into a directory.
    pub fn unpack_directory(
        pack: impl AsRef<Path>,
        directory: impl AsRef<Path>,
    ) -> Result<(), PakError> {
        let directory = directory.as_ref();
        fs::create_dir_all(directory)?;

        let parsed = Self::open(pack)?;
        for entry in parsed.entries() {
            let mut src = parsed.open_inside(&entry.name)?;
            let mut dst = File::create(directory.join(&entry.name))?;
            io::copy(&mut src, &mut dst)?;
        }

        Ok(())
    }
}

fn encode_name(name: &str) -> Result<[u8; NAME_LEN], PakError> {
    if name.len() >= NAME_LEN {
        return Err(PakError::NameTooLong(name.to_string()));
    }

    let mut fixed = [0u8; NAME_LEN];
    fixed[..name.len()].copy_from_slice(name.as_bytes());

    Ok(fixed)
}

/// A bounded window into the archive, readable like a plain file.
pub struct PakSlice {
    file: File,
    remaining: u64,
}

impl PakSlice {
    pub fn len(&self) -> u64 {
        self.remaining
    }

    pub fn is_empty(&self) -> bool {
        self.remaining == 0
    }
}

impl Read for PakSlice {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 {
            return Ok(0);
        }

        let take = buf.len().min(self.remaining as usize);
        let read = self.file.read(&mut buf[..take])?;
        self.remaining -= read as u64;

        Ok(read)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_source_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("metadata.json"), b"{\"threads\": 2}").unwrap();
        fs::write(dir.path().join("thread_0.bin"), vec![1u8; 100]).unwrap();
        fs::write(dir.path().join("thread_1.bin"), vec![2u8; 50]).unwrap();
        fs::write(dir.path().join(".hidden"), b"nope").unwrap();
        dir
    }

    #[test]
    fn pack_and_reopen() {
        let src = make_source_dir();
        let out = tempfile::tempdir().unwrap();
        let pack = out.path().join("trace.vk");
        PakFile::pack_directory(&pack, src.path(), false).unwrap();

        let parsed = PakFile::open(&pack).unwrap();
        assert_eq!(parsed.version(), 1);
        assert_eq!(parsed.entries().len(), 3);
        assert!(parsed.entries().iter().all(|e| e.name != ".hidden"));

        let mut slice = parsed.open_inside("thread_1.bin").unwrap();
        assert_eq!(slice.len(), 50);
        let mut data = Vec::new();
        slice.read_to_end(&mut data).unwrap();
        assert_eq!(data, vec![2u8; 50]);

        let names = parsed.names_with_prefix("thread_");
        assert_eq!(names, vec!["thread_0.bin", "thread_1.bin"]);
    }

    #[test]
    fn append_chains_an_index() {
        let src = make_source_dir();
        let out = tempfile::tempdir().unwrap();
        let pack = out.path().join("trace.vk");
        PakFile::pack_directory(&pack, src.path(), false).unwrap();

        let extra = out.path().join("notes.json");
        fs::write(&extra, b"{\"note\": 1}").unwrap();
        PakFile::append(&pack, &extra).unwrap();

        let parsed = PakFile::open(&pack).unwrap();
        assert_eq!(parsed.entries().len(), 4);
        let mut slice = parsed.open_inside("notes.json").unwrap();
        let mut data = Vec::new();
        slice.read_to_end(&mut data).unwrap();
        assert_eq!(data, b"{\"note\": 1}");

        #[derive(serde::Deserialize)]
        struct Notes {
            note: u32,
        }
        let notes: Notes = parsed.read_json("notes.json").unwrap();
        assert_eq!(notes.note, 1);
    }

    #[test]
    fn unpack_round_trips() {
        let src = make_source_dir();
        let out = tempfile::tempdir().unwrap();
        let pack = out.path().join("trace.vk");
        PakFile::pack_directory(&pack, src.path(), false).unwrap();

        let back = out.path().join("unpacked");
        PakFile::unpack_directory(&pack, &back).unwrap();
        assert_eq!(fs::read(back.join("thread_0.bin")).unwrap(), vec![1u8; 100]);
    }

    #[test]
    fn rejects_foreign_files() {
        let out = tempfile::tempdir().unwrap();
        let bogus = out.path().join("bogus.vk");
        fs::write(&bogus, b"PNG\x89abcdefghijklmnop").unwrap();
        assert!(matches!(
            PakFile::open(&bogus),
            Err(PakError::BadSignature(_))
        ));
    }

    #[test]
    fn rejects_long_names() {
        let out = tempfile::tempdir().unwrap();
        let dir = out.path().join("src");
        fs::create_dir(&dir).unwrap();
        fs::write(dir.join("a".repeat(45)), b"data").unwrap();
        let pack = out.path().join("trace.vk");
        assert!(matches!(
            PakFile::pack_directory(&pack, &dir, false),
            Err(PakError::NameTooLong(_))
        ));
    }

    #[test]
    fn erase_removes_sources() {
        let src = make_source_dir();
        let out = tempfile::tempdir().unwrap();
        let pack = out.path().join("trace.vk");
        let src_path = src.path().to_path_buf();
        PakFile::pack_directory(&pack, &src_path, true).unwrap();
        // .hidden survives, so the directory itself remains
        assert!(!src_path.join("thread_0.bin").exists());
        assert!(src_path.join(".hidden").exists());
    }
}
