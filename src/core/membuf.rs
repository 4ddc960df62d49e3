//! In-memory arena engine
//!
//! Committed files are copied into a paged [`Arena`] and located through a
//! [`KeyIndex`]. All arena and index mutation happens under one lock, so
//! allocation and release never interleave. The index is persisted through a
//! pluggable [`IndexStore`]; with a durable store the arena pages are written
//! next to it and reloaded on the next `init`.
//!
//! ## Commit
//!
//! Every file of a transaction is placed into freshly reserved ranges first.
//! If any reservation fails the arena is rolled back to its state before the
//! commit and nothing becomes visible. Only then are index entries swapped
//! in; ranges of replaced entries go back to the free list.

use crate::allocator::{Allocation, AllocatorStats};
use crate::arena::Arena;
use crate::cluster::coordinator::{reject, spawn_server};
use crate::cluster::{ClusterOp, ClusterPayload, CoordinatorChannel};
use crate::config::{CacheConfig, MembufOptions, Persistence};
use crate::engine::{check_owner, next_engine_id, Capabilities, CacheEngine, FileInfo};
use crate::error::{CacheError, Result};
use crate::index::{
    ArenaSnapshot, IndexEntry, IndexStore, JsonIndexStore, KeyIndex, MemoryIndexStore,
    SNAPSHOT_VERSION,
};
use crate::key::{ContentHash, FileKey, FileType, Guid};
use crate::stream::FileStream;
use crate::transaction::{PutTransaction, Staging};
use parking_lot::Mutex;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Directory under `cache_path` holding persisted arena pages
pub const PAGES_DIR: &str = "pages";

/// Entry count plus allocator accounting
#[derive(Debug, Clone, PartialEq)]
pub struct MembufStats {
    pub entries: usize,
    pub arena: AllocatorStats,
}

struct Store {
    arena: Arena,
    index: KeyIndex,
    persistence: Box<dyn IndexStore>,
    pages_dir: Option<PathBuf>,
    /// Store was injected with `with_index_store` and outlives this session
    injected: bool,
}

impl Store {
    fn open(
        opts: &MembufOptions,
        mut persistence: Box<dyn IndexStore>,
        pages_dir: Option<PathBuf>,
        injected: bool,
    ) -> Result<Self> {
        let restored = match &pages_dir {
            Some(dir) => match persistence.load() {
                Ok(Some(snapshot)) => match restore_snapshot(opts, snapshot, dir) {
                    Ok(restored) => Some(restored),
                    Err(e) => {
                        tracing::warn!("Discarding persisted arena: {}", e);
                        None
                    }
                },
                Ok(None) => None,
                Err(e) => {
                    tracing::warn!("Cannot load persisted index: {}", e);
                    None
                }
            },
            None => None,
        };

        let (arena, index) = match restored {
            Some((arena, index)) => {
                tracing::info!(
                    "Restored {} entries in {} pages",
                    index.len(),
                    arena.page_count()
                );
                (arena, index)
            }
            None => (Arena::new(opts)?, KeyIndex::new()),
        };

        Ok(Store {
            arena,
            index,
            persistence,
            pages_dir,
            injected,
        })
    }

    fn commit(&mut self, guid: &Guid, hash: &ContentHash, files: Vec<(FileType, Vec<u8>)>) -> Result<()> {
        let checkpoint = self.arena.checkpoint();

        let mut placed = Vec::with_capacity(files.len());
        for (file_type, bytes) in files {
            match self.place(&bytes) {
                Ok(allocation) => placed.push((
                    FileKey::new(file_type, guid.clone(), hash.clone()),
                    IndexEntry::new(allocation, bytes.len() as u64),
                )),
                Err(e) => {
                    self.arena.rollback(checkpoint);
                    return Err(e);
                }
            }
        }

        for (key, entry) in placed {
            tracing::debug!(
                "Committed {} ({} bytes at page {} offset {})",
                key,
                entry.size,
                entry.allocation.page,
                entry.allocation.offset
            );
            if let Some(previous) = self.index.insert(key, entry) {
                self.release(previous.allocation);
            }
        }

        Ok(())
    }

    fn place(&mut self, bytes: &[u8]) -> Result<Allocation> {
        if bytes.is_empty() {
            return Err(CacheError::InvalidSize(0));
        }

        let allocation = self.arena.reserve(bytes.len() as u64)?;
        self.arena.write(&allocation, bytes)?;
        Ok(allocation)
    }

    fn release(&mut self, allocation: Allocation) {
        if let Err(e) = self.arena.release(allocation) {
            tracing::warn!("Leaking {:?}: {}", allocation, e);
        }
    }

    fn entry(&self, key: &FileKey) -> Result<&IndexEntry> {
        self.index
            .get(key)
            .ok_or_else(|| CacheError::NotFound(key.clone()))
    }

    fn flush(&mut self) -> Result<()> {
        let pages = match &self.pages_dir {
            Some(dir) => self.arena.save_pages(dir)?,
            None => Vec::new(),
        };

        let snapshot = ArenaSnapshot {
            version: SNAPSHOT_VERSION,
            entries: self.index.to_records(),
            allocator: self.arena.allocator().to_state(),
            pages,
        };
        self.persistence.save(&snapshot)?;

        tracing::debug!(
            "Flushed index: {} entries, {} pages",
            snapshot.entries.len(),
            snapshot.allocator.pages.len()
        );
        Ok(())
    }
}

fn restore_snapshot(
    opts: &MembufOptions,
    snapshot: ArenaSnapshot,
    pages_dir: &Path,
) -> Result<(Arena, KeyIndex)> {
    let arena = Arena::restore(opts, snapshot.allocator, &snapshot.pages, pages_dir)?;
    let index = KeyIndex::from_records(snapshot.entries)?;

    arena.allocator().verify(index.allocations())?;
    if let Some((key, _)) = index
        .iter()
        .find(|(_, entry)| entry.size == 0 || entry.size > entry.allocation.length)
    {
        return Err(CacheError::Allocation(format!(
            "index entry {} does not fit its allocation",
            key
        )));
    }

    Ok((arena, index))
}

fn default_store(config: &CacheConfig) -> Result<Box<dyn IndexStore>> {
    match config.membuf.persistence {
        Persistence::Volatile => Ok(Box::new(MemoryIndexStore::new())),
        Persistence::Json => Ok(Box::new(JsonIndexStore::in_dir(
            config.require_cache_path()?,
        ))),
    }
}

struct Inner {
    id: u64,
    store: Mutex<Option<Store>>,
    injected_store: Mutex<Option<Box<dyn IndexStore>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    stop: Arc<AtomicBool>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(mut store) = self.store.get_mut().take() {
            if let Err(e) = store.flush() {
                tracing::warn!("Failed to flush arena index on drop: {}", e);
            }
        }
    }
}

/// Arena-backed cache engine
///
/// Cloning gives another handle to the same engine.
#[derive(Clone)]
pub struct MembufEngine {
    inner: Arc<Inner>,
}

impl Default for MembufEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MembufEngine {
    pub fn new() -> Self {
        MembufEngine {
            inner: Arc::new(Inner {
                id: next_engine_id(),
                store: Mutex::new(None),
                injected_store: Mutex::new(None),
                workers: Mutex::new(Vec::new()),
                stop: Arc::new(AtomicBool::new(false)),
            }),
        }
    }

    /// Use `store` for index persistence instead of the configured adapter
    ///
    /// A durable store still needs `cache_path` for the arena pages.
    pub fn with_index_store<S: IndexStore + 'static>(self, store: S) -> Self {
        *self.inner.injected_store.lock() = Some(Box::new(store));
        self
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.store.lock().is_some()
    }

    fn with_store<T>(&self, f: impl FnOnce(&mut Store) -> Result<T>) -> Result<T> {
        let mut guard = self.inner.store.lock();
        let store = guard.as_mut().ok_or(CacheError::NotInitialized)?;
        f(store)
    }

    /// Remove one entry and return its range to the free list
    ///
    /// Returns whether the key was present.
    pub fn evict(&self, key: &FileKey) -> Result<bool> {
        self.with_store(|store| match store.index.remove(key) {
            Some(entry) => {
                store.release(entry.allocation);
                tracing::debug!("Evicted {}", key);
                Ok(true)
            }
            None => Ok(false),
        })
    }

    pub fn stats(&self) -> Result<MembufStats> {
        self.with_store(|store| {
            Ok(MembufStats {
                entries: store.index.len(),
                arena: store.arena.stats(),
            })
        })
    }

    /// Persist the index (and pages, for durable stores)
    pub fn flush(&self) -> Result<()> {
        self.with_store(|store| store.flush())
    }

    /// Check allocator accounting against the index
    pub fn check_invariants(&self) -> Result<()> {
        self.with_store(|store| store.arena.allocator().verify(store.index.allocations()))
    }

    fn serve(&self, op: ClusterOp) -> Result<ClusterPayload> {
        match op {
            ClusterOp::Commit { guid, hash, files } => {
                let files = files
                    .into_iter()
                    .map(|file| (file.file_type, file.bytes))
                    .collect();
                self.with_store(|store| store.commit(&guid, &hash, files))?;
                Ok(ClusterPayload::Committed)
            }
            ClusterOp::FileInfo { key } => Ok(ClusterPayload::Info(self.get_file_info(
                key.file_type,
                &key.guid,
                &key.hash,
            )?)),
            ClusterOp::ReadFile { key } => Ok(ClusterPayload::Bytes(self.read_file(
                key.file_type,
                &key.guid,
                &key.hash,
            )?)),
        }
    }
}

impl CacheEngine for MembufEngine {
    const CAPABILITIES: Capabilities = Capabilities {
        clustering: true,
        durable: false,
    };

    fn init(&self, config: &CacheConfig) -> Result<()> {
        config.validate_membuf()?;

        let mut guard = self.inner.store.lock();
        if guard.is_some() {
            return Err(CacheError::Config(
                "arena engine is already initialized".to_string(),
            ));
        }

        if let Some(root) = &config.cache_path {
            fs::create_dir_all(root)?;
        }

        let injected = self.inner.injected_store.lock().take();
        let durable = match &injected {
            Some(store) => store.is_durable(),
            None => config.membuf.persistence == Persistence::Json,
        };

        let pages_dir = match (&config.cache_path, durable) {
            (Some(root), true) => Some(root.join(PAGES_DIR)),
            (None, true) => {
                *self.inner.injected_store.lock() = injected;
                return Err(CacheError::Config(
                    "cache_path is required by a durable index store".to_string(),
                ));
            }
            (_, false) => None,
        };

        let (persistence, is_injected) = match injected {
            Some(store) => (store, true),
            None => (default_store(config)?, false),
        };

        let store = Store::open(&config.membuf, persistence, pages_dir, is_injected)?;
        tracing::info!(
            "Arena engine initialized: {} pages, {} bytes, {} entries",
            store.arena.page_count(),
            store.arena.stats().total_size,
            store.index.len()
        );
        *guard = Some(store);
        Ok(())
    }

    fn shutdown(&self) -> Result<()> {
        self.inner.stop.store(true, Ordering::Release);
        let workers = std::mem::take(&mut *self.inner.workers.lock());
        for worker in workers {
            if worker.join().is_err() {
                tracing::warn!("Cluster worker thread panicked");
            }
        }
        self.inner.stop.store(false, Ordering::Release);

        let store = self.inner.store.lock().take();
        let Some(mut store) = store else {
            return Ok(());
        };

        let result = store.flush();
        if store.injected {
            *self.inner.injected_store.lock() = Some(store.persistence);
        }

        tracing::info!("Arena engine shut down");
        result
    }

    fn register_cluster_worker(&self, channel: Box<dyn CoordinatorChannel>) {
        let engine = Arc::downgrade(&self.inner);
        let handler = move |op: ClusterOp| match engine.upgrade() {
            Some(inner) => MembufEngine { inner }.serve(op),
            None => Err(CacheError::NotInitialized),
        };

        match spawn_server(channel, Arc::clone(&self.inner.stop), handler) {
            Ok(handle) => {
                self.inner.workers.lock().push(handle);
                tracing::info!("Registered cluster worker");
            }
            Err(failed) => reject(
                failed.channel,
                &format!("cannot start cluster worker thread: {}", failed.error),
            ),
        }
    }

    fn create_put_transaction(&self, guid: Guid, hash: ContentHash) -> Result<PutTransaction> {
        if !self.is_initialized() {
            return Err(CacheError::NotInitialized);
        }
        Ok(PutTransaction::new(guid, hash, Staging::Memory, self.inner.id))
    }

    fn end_put_transaction(&self, trx: &mut PutTransaction) -> Result<()> {
        check_owner(self.inner.id, trx)?;
        trx.finalize()?;

        let mut guard = self.inner.store.lock();
        let store = guard.as_mut().ok_or(CacheError::NotInitialized)?;

        let mut files = Vec::new();
        for file in trx.take_completed()? {
            files.push((file.file_type, file.data.into_bytes()?));
        }

        store.commit(trx.guid(), trx.hash(), files)?;
        trx.mark_committed();
        Ok(())
    }

    fn get_file_info(
        &self,
        file_type: FileType,
        guid: &Guid,
        hash: &ContentHash,
    ) -> Result<FileInfo> {
        let key = FileKey::new(file_type, guid.clone(), hash.clone());
        self.with_store(|store| {
            let entry = store.entry(&key)?;
            Ok(FileInfo {
                size: entry.size,
                committed_at: entry.committed_at,
            })
        })
    }

    fn get_file_stream(
        &self,
        file_type: FileType,
        guid: &Guid,
        hash: &ContentHash,
    ) -> Result<FileStream> {
        let key = FileKey::new(file_type, guid.clone(), hash.clone());
        let bytes = self.with_store(|store| {
            let entry = *store.entry(&key)?;
            Ok(store.arena.read(&entry.allocation, entry.size)?.to_vec())
        })?;
        Ok(FileStream::from_bytes(bytes))
    }
}
