//! Chunk storage on a local directory.
//!
//! Data files hold length-prefixed pairs followed by a trailer carrying the
//! pair count and a crc32 over every preceding byte. Bloom files hold the
//! serialized filter followed by its crc32.

use std::{
    fs::{self, File, OpenOptions},
    io::{self, BufReader, BufWriter, Read, Write},
    path::{Path, PathBuf},
};

use bytes::Bytes;

use super::{AscendingKeys, ChunkReader, ChunkStorage, ChunkWriter, Entry};
use crate::{bloom::BloomFilter, chunk::ChunkId, merge::MergeError};

const DATA_EXT: &str = "data";
const BLOOM_EXT: &str = "bloom";
const TRAILER_LEN: u64 = 12;

/// Chunk stores kept as files under one directory.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    /// Use `root` for chunk files, creating it if needed.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, MergeError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Directory holding the chunk files.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, uri: &str) -> Result<PathBuf, MergeError> {
        if uri.is_empty() || uri.contains(|c: char| c == '/' || c == '\\') || uri.starts_with('.') {
            return Err(MergeError::MissingStore(uri.to_string()));
        }
        Ok(self.root.join(uri))
    }

    fn remove_file(&self, uri: &str) -> Result<(), MergeError> {
        match fs::remove_file(self.resolve(uri)?) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                Err(MergeError::MissingStore(uri.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }
}

/// Flush directory entries created or renamed under `dir`.
pub(crate) fn sync_dir(dir: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        File::open(dir)?.sync_all()
    }
    #[cfg(not(unix))]
    {
        let _ = dir;
        Ok(())
    }
}

fn file_name(id: ChunkId, ext: &str) -> String {
    format!("chunk-{id}.{ext}")
}

fn open_missing_as(uri: &str, path: &Path) -> Result<File, MergeError> {
    File::open(path).map_err(|err| match err.kind() {
        io::ErrorKind::NotFound => MergeError::MissingStore(uri.to_string()),
        _ => err.into(),
    })
}

impl ChunkStorage for LocalStorage {
    fn chunk_ref(&self, id: ChunkId) -> String {
        file_name(id, DATA_EXT)
    }

    fn create_chunk_store(
        &self,
        id: ChunkId,
    ) -> Result<(String, Box<dyn ChunkWriter>), MergeError> {
        let uri = self.chunk_ref(id);
        let path = self.resolve(&uri)?;
        let file = OpenOptions::new().write(true).create_new(true).open(&path)?;
        let writer = FileWriter {
            dir: self.root.clone(),
            path,
            out: BufWriter::new(file),
            hasher: crc32fast::Hasher::new(),
            count: 0,
            order: AscendingKeys::default(),
        };
        Ok((uri, Box::new(writer)))
    }

    fn open_chunk_reader(&self, data_ref: &str) -> Result<ChunkReader, MergeError> {
        let path = self.resolve(data_ref)?;
        let file = open_missing_as(data_ref, &path)?;
        let len = file.metadata()?.len();
        if len < TRAILER_LEN {
            return Err(MergeError::Checksum(data_ref.to_string()));
        }
        Ok(Box::new(FileReader {
            uri: data_ref.to_string(),
            input: BufReader::new(file),
            remaining: len - TRAILER_LEN,
            hasher: crc32fast::Hasher::new(),
            count: 0,
            done: false,
        }))
    }

    fn remove_chunk_store(&self, data_ref: &str) -> Result<(), MergeError> {
        self.remove_file(data_ref)
    }

    fn contains_chunk_store(&self, data_ref: &str) -> bool {
        self.resolve(data_ref)
            .map(|path| path.is_file())
            .unwrap_or(false)
    }

    fn put_bloom(&self, id: ChunkId, filter: &BloomFilter) -> Result<String, MergeError> {
        let uri = file_name(id, BLOOM_EXT);
        let path = self.resolve(&uri)?;
        let staging = path.with_extension("bloom.tmp");
        let mut body = filter.to_bytes();
        let crc = crc32fast::hash(&body);
        body.extend_from_slice(&crc.to_le_bytes());
        let staged = (|| -> io::Result<()> {
            let mut file = File::create(&staging)?;
            file.write_all(&body)?;
            file.sync_all()?;
            fs::rename(&staging, &path)
        })();
        if let Err(err) = staged {
            // staging may not exist if create failed
            let _ = fs::remove_file(&staging);
            return Err(err.into());
        }
        sync_dir(&self.root)?;
        Ok(uri)
    }

    fn load_bloom(&self, bloom_ref: &str) -> Result<BloomFilter, MergeError> {
        let path = self.resolve(bloom_ref)?;
        let mut bytes = Vec::new();
        open_missing_as(bloom_ref, &path)?.read_to_end(&mut bytes)?;
        if bytes.len() < 4 {
            return Err(MergeError::Checksum(bloom_ref.to_string()));
        }
        let (body, trailer) = bytes.split_at(bytes.len() - 4);
        let mut crc = [0u8; 4];
        crc.copy_from_slice(trailer);
        if crc32fast::hash(body) != u32::from_le_bytes(crc) {
            return Err(MergeError::Checksum(bloom_ref.to_string()));
        }
        BloomFilter::from_bytes(body)
    }

    fn remove_bloom(&self, bloom_ref: &str) -> Result<(), MergeError> {
        self.remove_file(bloom_ref)
    }
}

struct FileWriter {
    dir: PathBuf,
    path: PathBuf,
    out: BufWriter<File>,
    hasher: crc32fast::Hasher,
    count: u64,
    order: AscendingKeys,
}

impl FileWriter {
    fn put(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.hasher.update(bytes);
        self.out.write_all(bytes)
    }

    fn put_field(&mut self, field: &[u8]) -> Result<(), MergeError> {
        let len = u32::try_from(field.len()).map_err(|_| {
            MergeError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "chunk field exceeds u32::MAX bytes",
            ))
        })?;
        self.put(&len.to_le_bytes())?;
        self.put(field)?;
        Ok(())
    }
}

impl ChunkWriter for FileWriter {
    fn insert(&mut self, key: Bytes, value: Bytes) -> Result<(), MergeError> {
        self.order.check(&key)?;
        self.put_field(&key)?;
        self.put_field(&value)?;
        self.count += 1;
        Ok(())
    }

    fn finish(mut self: Box<Self>) -> Result<u64, MergeError> {
        let crc = self.hasher.clone().finalize();
        self.out.write_all(&self.count.to_le_bytes())?;
        self.out.write_all(&crc.to_le_bytes())?;
        self.out.flush()?;
        self.out.get_ref().sync_all()?;
        sync_dir(&self.dir)?;
        Ok(self.count)
    }

    fn abort(self: Box<Self>) -> Result<(), MergeError> {
        let FileWriter { path, out, .. } = *self;
        drop(out);
        fs::remove_file(path)?;
        Ok(())
    }
}

struct FileReader {
    uri: String,
    input: BufReader<File>,
    remaining: u64,
    hasher: crc32fast::Hasher,
    count: u64,
    done: bool,
}

impl FileReader {
    fn read_exact_hashed(&mut self, buf: &mut [u8]) -> Result<(), MergeError> {
        if (buf.len() as u64) > self.remaining {
            return Err(MergeError::Checksum(self.uri.clone()));
        }
        self.input.read_exact(buf)?;
        self.hasher.update(buf);
        self.remaining -= buf.len() as u64;
        Ok(())
    }

    fn read_field(&mut self) -> Result<Bytes, MergeError> {
        let mut len = [0u8; 4];
        self.read_exact_hashed(&mut len)?;
        let len = u64::from(u32::from_le_bytes(len));
        if len > self.remaining {
            return Err(MergeError::Checksum(self.uri.clone()));
        }
        let mut field = vec![0u8; len as usize];
        self.read_exact_hashed(&mut field)?;
        Ok(Bytes::from(field))
    }

    fn read_entry(&mut self) -> Result<Entry, MergeError> {
        let key = self.read_field()?;
        let value = self.read_field()?;
        self.count += 1;
        Ok((key, value))
    }

    fn verify_trailer(&mut self) -> Result<(), MergeError> {
        let mut count = [0u8; 8];
        let mut crc = [0u8; 4];
        self.input.read_exact(&mut count)?;
        self.input.read_exact(&mut crc)?;
        let expected = self.hasher.clone().finalize();
        if u64::from_le_bytes(count) != self.count || u32::from_le_bytes(crc) != expected {
            return Err(MergeError::Checksum(self.uri.clone()));
        }
        Ok(())
    }
}

impl Iterator for FileReader {
    type Item = Result<Entry, MergeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let result = if self.remaining == 0 {
            self.done = true;
            match self.verify_trailer() {
                Ok(()) => return None,
                Err(err) => Err(err),
            }
        } else {
            self.read_entry()
        };
        if result.is_err() {
            self.done = true;
        }
        Some(result)
    }
}
