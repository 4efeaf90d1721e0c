//! Durable tree metadata: the commit point of every structural change.

use std::{
    collections::HashMap,
    fs::{self, File},
    io::{self, Write},
    path::PathBuf,
    sync::{Mutex, PoisonError},
};

use serde::{Deserialize, Serialize};

use crate::{chunk::ChunkId, merge::MergeError, storage::local::sync_dir};

const META_SUFFIX: &str = "meta.json";
const CRC_LEN: usize = 4;

/// Persisted form of a chunk descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMeta {
    /// Chunk identifier.
    pub id: ChunkId,
    /// Reference to the sorted data store.
    pub data_ref: String,
    /// Reference to the bloom filter, absent for empty chunks.
    pub bloom_ref: Option<String>,
    /// Number of key/value pairs.
    pub record_count: u64,
    /// Whether the data was durable when the metadata was written.
    pub on_disk: bool,
}

/// Shape of a tree: live chunks newest first, the retired pool, and the
/// generation stamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeSnapshot {
    /// Incremented on every restructuring of `live`.
    pub generation: u64,
    /// Live chunks; index 0 is the mutable head.
    pub live: Vec<ChunkMeta>,
    /// Retired pool slots; `None` marks a vacancy.
    pub retired: Vec<Option<ChunkMeta>>,
    /// Number of vacant retired slots.
    pub free_slot_count: usize,
}

impl TreeSnapshot {
    /// Sum of record counts over the live chunks.
    pub fn live_records(&self) -> u64 {
        self.live.iter().map(|chunk| chunk.record_count).sum()
    }

    /// Sum of record counts over the retired chunks.
    pub fn retired_records(&self) -> u64 {
        self.retired
            .iter()
            .flatten()
            .map(|chunk| chunk.record_count)
            .sum()
    }
}

/// Everything needed to reopen a tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeMetadata {
    /// Tree name.
    pub name: String,
    /// Highest chunk id handed out so far.
    pub last_chunk_id: u64,
    /// Tree shape.
    #[serde(flatten)]
    pub state: TreeSnapshot,
}

/// Durable home of tree metadata.
pub trait MetadataStore: Send + Sync {
    /// Durably replace the metadata of `metadata.name`.
    fn write_tree_metadata(&self, metadata: &TreeMetadata) -> Result<(), MergeError>;

    /// Read back the metadata last written for `name`.
    fn read_tree_metadata(&self, name: &str) -> Result<Option<TreeMetadata>, MergeError>;
}

/// Metadata kept in process memory.
#[derive(Debug, Default)]
pub struct MemMetadataStore {
    docs: Mutex<HashMap<String, TreeMetadata>>,
}

impl MemMetadataStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl MetadataStore for MemMetadataStore {
    fn write_tree_metadata(&self, metadata: &TreeMetadata) -> Result<(), MergeError> {
        self.docs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(metadata.name.clone(), metadata.clone());
        Ok(())
    }

    fn read_tree_metadata(&self, name: &str) -> Result<Option<TreeMetadata>, MergeError> {
        Ok(self
            .docs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned())
    }
}

/// Metadata stored as `<dir>/<tree>.meta.json` with a crc32 trailer.
///
/// Writes go to a staging file that is synced and then renamed over the
/// previous document, so a crash leaves either the old or the new metadata.
#[derive(Debug, Clone)]
pub struct FileMetadataStore {
    dir: PathBuf,
}

impl FileMetadataStore {
    /// Keep metadata documents under `dir`, creating it if needed.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, MergeError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Location of the document for tree `name`.
    pub fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.{META_SUFFIX}"))
    }
}

impl MetadataStore for FileMetadataStore {
    fn write_tree_metadata(&self, metadata: &TreeMetadata) -> Result<(), MergeError> {
        let path = self.path_for(&metadata.name);
        let staging = path.with_extension("json.tmp");
        let mut body = serde_json::to_vec(metadata)?;
        let crc = crc32fast::hash(&body);
        body.extend_from_slice(&crc.to_le_bytes());
        {
            let mut file = File::create(&staging)?;
            file.write_all(&body)?;
            file.sync_all()?;
        }
        fs::rename(&staging, &path)?;
        sync_dir(&self.dir)?;
        Ok(())
    }

    fn read_tree_metadata(&self, name: &str) -> Result<Option<TreeMetadata>, MergeError> {
        let path = self.path_for(name);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        if bytes.len() < CRC_LEN {
            return Err(MergeError::Checksum(path.display().to_string()));
        }
        let (body, trailer) = bytes.split_at(bytes.len() - CRC_LEN);
        let mut crc = [0u8; CRC_LEN];
        crc.copy_from_slice(trailer);
        if crc32fast::hash(body) != u32::from_le_bytes(crc) {
            return Err(MergeError::Checksum(path.display().to_string()));
        }
        Ok(Some(serde_json::from_slice(body)?))
    }
}
