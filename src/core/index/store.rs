//! Index persistence adapters
//!
//! An [`IndexStore`] saves and loads an [`ArenaSnapshot`]: the key index plus
//! the allocator layout it refers to. Durable stores also get the arena pages
//! written next to them by the engine, so a restart can reopen the cache.

use super::IndexRecord;
use crate::allocator::AllocatorState;
use crate::arena::PageRecord;
use crate::error::{CacheError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const SNAPSHOT_VERSION: u32 = 1;

/// Everything needed to reopen an arena cache
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArenaSnapshot {
    pub version: u32,
    pub entries: Vec<IndexRecord>,
    pub allocator: AllocatorState,
    /// Page checksums; empty when pages were not persisted
    pub pages: Vec<PageRecord>,
}

/// Pluggable persistence for the arena engine's directory
pub trait IndexStore: Send {
    /// Load the last saved snapshot, if any
    fn load(&mut self) -> Result<Option<ArenaSnapshot>>;

    /// Replace the saved snapshot
    fn save(&mut self, snapshot: &ArenaSnapshot) -> Result<()>;

    /// Whether saved snapshots survive the process
    fn is_durable(&self) -> bool;
}

/// Volatile store: keeps the last snapshot in memory only
#[derive(Debug, Default)]
pub struct MemoryIndexStore {
    snapshot: Option<ArenaSnapshot>,
}

impl MemoryIndexStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_snapshot(&self) -> Option<&ArenaSnapshot> {
        self.snapshot.as_ref()
    }
}

impl IndexStore for MemoryIndexStore {
    fn load(&mut self) -> Result<Option<ArenaSnapshot>> {
        Ok(self.snapshot.clone())
    }

    fn save(&mut self, snapshot: &ArenaSnapshot) -> Result<()> {
        self.snapshot = Some(snapshot.clone());
        Ok(())
    }

    fn is_durable(&self) -> bool {
        false
    }
}

/// Durable store writing the snapshot as a JSON document
#[derive(Debug, Clone)]
pub struct JsonIndexStore {
    path: PathBuf,
}

impl JsonIndexStore {
    pub const FILE_NAME: &'static str = "index.json";

    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        JsonIndexStore {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Store at `<dir>/index.json`
    pub fn in_dir<P: AsRef<Path>>(dir: P) -> Self {
        Self::new(dir.as_ref().join(Self::FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl IndexStore for JsonIndexStore {
    fn load(&mut self) -> Result<Option<ArenaSnapshot>> {
        if !self.path.exists() {
            return Ok(None);
        }

        let data = fs::read(&self.path)?;
        let snapshot: ArenaSnapshot = serde_json::from_slice(&data)?;

        if snapshot.version != SNAPSHOT_VERSION {
            return Err(CacheError::Config(format!(
                "unsupported index snapshot version {} (expected {})",
                snapshot.version, SNAPSHOT_VERSION
            )));
        }

        Ok(Some(snapshot))
    }

    fn save(&mut self, snapshot: &ArenaSnapshot) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let data = serde_json::to_vec(snapshot)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, data)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn is_durable(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::{Allocation, FreeBlock};
    use crate::index::IndexEntry;
    use crate::key::{ContentHash, FileKey, FileType, Guid};
    use tempfile::TempDir;

    fn snapshot() -> ArenaSnapshot {
        ArenaSnapshot {
            version: SNAPSHOT_VERSION,
            entries: vec![IndexRecord {
                key: FileKey::new(
                    FileType::Asset,
                    Guid::from_bytes([7u8; 16]),
                    ContentHash::from_bytes([9u8; 16]),
                ),
                entry: IndexEntry::new(Allocation { page: 0, offset: 0, length: 32 }, 30),
            }],
            allocator: AllocatorState {
                pages: vec![128],
                free_blocks: vec![FreeBlock::new(0, 32, 96)],
            },
            pages: vec![PageRecord { length: 128, crc32: 42 }],
        }
    }

    #[test]
    fn test_memory_store_is_volatile() {
        let mut store = MemoryIndexStore::new();
        assert!(!store.is_durable());
        assert!(store.load().unwrap().is_none());

        store.save(&snapshot()).unwrap();
        assert_eq!(store.load().unwrap(), Some(snapshot()));
    }

    #[test]
    fn test_json_store_round_trip() {
        let dir = TempDir::new().unwrap();
        let mut store = JsonIndexStore::in_dir(dir.path());
        assert!(store.is_durable());
        assert!(store.load().unwrap().is_none());

        store.save(&snapshot()).unwrap();

        let mut reopened = JsonIndexStore::in_dir(dir.path());
        assert_eq!(reopened.load().unwrap(), Some(snapshot()));
    }

    #[test]
    fn test_json_store_rejects_other_versions() {
        let dir = TempDir::new().unwrap();
        let mut store = JsonIndexStore::in_dir(dir.path());

        let mut future = snapshot();
        future.version = SNAPSHOT_VERSION + 1;
        store.save(&future).unwrap();

        assert!(matches!(store.load(), Err(CacheError::Config(_))));
    }

    #[test]
    fn test_json_store_rejects_garbage() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(JsonIndexStore::FILE_NAME), b"not json").unwrap();

        let mut store = JsonIndexStore::in_dir(dir.path());
        assert!(matches!(store.load(), Err(CacheError::Serialization(_))));
    }
}
