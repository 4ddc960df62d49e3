//! Key index for the arena engine
//!
//! Maps each [`FileKey`] to the arena range holding its bytes. The index
//! itself is a plain in-memory map; durability is delegated to an
//! [`IndexStore`] adapter.

pub mod store;

pub use store::{ArenaSnapshot, IndexStore, JsonIndexStore, MemoryIndexStore, SNAPSHOT_VERSION};

use crate::allocator::Allocation;
use crate::engine::epoch_secs;
use crate::error::{CacheError, Result};
use crate::key::FileKey;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::SystemTime;

/// Location and size of one committed entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub allocation: Allocation,
    /// Stored byte count (at most `allocation.length`)
    pub size: u64,
    /// Commit time (Unix epoch seconds)
    pub committed_at: u64,
}

impl IndexEntry {
    pub fn new(allocation: Allocation, size: u64) -> Self {
        IndexEntry {
            allocation,
            size,
            committed_at: epoch_secs(SystemTime::now()),
        }
    }
}

/// Serialized form of one index entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexRecord {
    pub key: FileKey,
    pub entry: IndexEntry,
}

#[derive(Debug, Default)]
pub struct KeyIndex {
    entries: HashMap<FileKey, IndexEntry>,
}

impl KeyIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild an index, rejecting duplicate keys
    pub fn from_records(records: Vec<IndexRecord>) -> Result<Self> {
        let mut entries = HashMap::with_capacity(records.len());
        for record in records {
            let key = record.key.clone();
            if entries.insert(record.key, record.entry).is_some() {
                return Err(CacheError::Transaction(format!(
                    "duplicate index record for {}",
                    key
                )));
            }
        }
        Ok(KeyIndex { entries })
    }

    pub fn to_records(&self) -> Vec<IndexRecord> {
        let mut records: Vec<IndexRecord> = self
            .entries
            .iter()
            .map(|(key, entry)| IndexRecord {
                key: key.clone(),
                entry: *entry,
            })
            .collect();
        records.sort_by(|a, b| a.key.cmp(&b.key));
        records
    }

    /// Insert or replace an entry, returning the replaced one
    pub fn insert(&mut self, key: FileKey, entry: IndexEntry) -> Option<IndexEntry> {
        self.entries.insert(key, entry)
    }

    pub fn get(&self, key: &FileKey) -> Option<&IndexEntry> {
        self.entries.get(key)
    }

    pub fn remove(&mut self, key: &FileKey) -> Option<IndexEntry> {
        self.entries.remove(key)
    }

    pub fn contains(&self, key: &FileKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&FileKey, &IndexEntry)> {
        self.entries.iter()
    }

    pub fn allocations(&self) -> impl Iterator<Item = &Allocation> {
        self.entries.values().map(|entry| &entry.allocation)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
