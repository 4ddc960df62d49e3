//! # Artifact Cache - Pluggable Build-Artifact Storage
//!
//! `artifact-cache` stores up to three byte streams (info, asset and resource)
//! per `(guid, hash)` key behind one contract with two engines:
//!
//! - **membuf**: an in-memory arena with a free-list allocator that grows by
//!   whole pages, splits and coalesces free blocks, and can persist its index
//!   and pages
//! - **fs**: one file per entry under a cache root, written through temporary
//!   files and renamed into place
//!
//! Writes go through a [`PutTransaction`]: every file declared in it must be
//! written to its exact size, or none of them become visible.
//!
//! ## Quick Start
//!
//! ```rust
//! use artifact_cache::{Cache, CacheConfig, ContentHash, FileType, Guid, Result};
//! use std::io::Write;
//!
//! # fn main() -> Result<()> {
//! let cache = Cache::open(&CacheConfig::membuf().with_page_sizes(64 * 1024, 64 * 1024))?;
//!
//! let guid = Guid::from_bytes([0x42; 16]);
//! let hash = ContentHash::from_bytes([0x07; 16]);
//!
//! let mut trx = cache.create_put_transaction(guid.clone(), hash.clone())?;
//! let mut info = trx.get_write_stream(FileType::Info, 5)?;
//! info.write_all(b"hello")?;
//! cache.end_put_transaction(&mut trx)?;
//!
//! assert_eq!(cache.get_file_info(FileType::Info, &guid, &hash)?.size, 5);
//! cache.shutdown()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Clustering
//!
//! ```rust
//! use artifact_cache::{
//!     local_channel, CacheConfig, CacheEngine, ClusterClient, ContentHash, FileType, Guid,
//!     MembufEngine, Result,
//! };
//!
//! # fn main() -> Result<()> {
//! let config = CacheConfig::membuf().with_page_sizes(64 * 1024, 64 * 1024);
//!
//! let owner = MembufEngine::new();
//! owner.init(&config)?;
//!
//! let (worker_side, owner_side) = local_channel();
//! owner.register_cluster_worker(Box::new(owner_side));
//!
//! let worker = ClusterClient::new(Box::new(worker_side));
//! worker.init(&config)?;
//! worker.put_files(Guid::from_bytes([1]), ContentHash::from_bytes([2]), &[(FileType::Asset, b"bytes")])?;
//!
//! let size = owner.get_file_info(FileType::Asset, &Guid::from_bytes([1]), &ContentHash::from_bytes([2]))?.size;
//! assert_eq!(size, 5);
//! owner.shutdown()?;
//! # Ok(())
//! # }
//! ```

pub mod core;

// Engine modules are addressed as crate::<module> throughout
pub(crate) use crate::core::{
    allocator, arena, cluster, config, engine, error, index, key, stream, transaction,
};

pub use crate::core::{
    allocator::{Allocation, AllocatorStats, FitPolicy, FreeBlock, FreeListAllocator},
    cluster::{
        decode_frame, encode_frame, local_channel, ClusterClient, ClusterFile, ClusterOp,
        ClusterPayload, ClusterReply, ClusterRequest, CoordinatorChannel, RemoteDetail,
        RemoteError, WorkerChannel,
    },
    config::{CacheConfig, EngineKind, MembufOptions, Persistence},
    engine::{CacheEngine, Capabilities, FileInfo},
    error::{CacheError, ErrorKind, Result},
    fs::FsEngine,
    index::{IndexStore, JsonIndexStore, MemoryIndexStore},
    key::{ContentHash, FileKey, FileType, Guid},
    membuf::{MembufEngine, MembufStats},
    stream::FileStream,
    transaction::{CommittedFile, FinalizeOutcome, PutStream, PutTransaction, TransactionState},
};

use tracing::debug;

macro_rules! dispatch {
    ($cache:expr, $engine:ident => $call:expr) => {
        match $cache {
            Cache::Membuf($engine) => $call,
            Cache::Fs($engine) => $call,
        }
    };
}

/// Engine chosen by configuration
///
/// Delegates every contract operation to the selected engine.
pub enum Cache {
    Membuf(MembufEngine),
    Fs(FsEngine),
}

impl Cache {
    /// Build the configured engine and initialize it
    pub fn open(config: &CacheConfig) -> Result<Self> {
        config.validate()?;
        debug!("Opening {:?} cache", config.engine);

        let cache = match config.engine {
            EngineKind::Membuf => Cache::Membuf(MembufEngine::new()),
            EngineKind::Fs => Cache::Fs(FsEngine::new()),
        };
        cache.init(config)?;
        Ok(cache)
    }

    pub fn kind(&self) -> EngineKind {
        match self {
            Cache::Membuf(_) => EngineKind::Membuf,
            Cache::Fs(_) => EngineKind::Fs,
        }
    }

    pub fn capabilities(&self) -> Capabilities {
        dispatch!(self, engine => engine.capabilities())
    }

    pub fn init(&self, config: &CacheConfig) -> Result<()> {
        dispatch!(self, engine => engine.init(config))
    }

    pub fn shutdown(&self) -> Result<()> {
        dispatch!(self, engine => engine.shutdown())
    }

    pub fn register_cluster_worker(&self, channel: Box<dyn CoordinatorChannel>) {
        dispatch!(self, engine => engine.register_cluster_worker(channel))
    }

    pub fn create_put_transaction(&self, guid: Guid, hash: ContentHash) -> Result<PutTransaction> {
        dispatch!(self, engine => engine.create_put_transaction(guid, hash))
    }

    pub fn end_put_transaction(&self, trx: &mut PutTransaction) -> Result<()> {
        dispatch!(self, engine => engine.end_put_transaction(trx))
    }

    pub fn get_file_info(&self, file_type: FileType, guid: &Guid, hash: &ContentHash) -> Result<FileInfo> {
        dispatch!(self, engine => engine.get_file_info(file_type, guid, hash))
    }

    pub fn get_file_stream(
        &self,
        file_type: FileType,
        guid: &Guid,
        hash: &ContentHash,
    ) -> Result<FileStream> {
        dispatch!(self, engine => engine.get_file_stream(file_type, guid, hash))
    }

    pub fn put_files(&self, guid: Guid, hash: ContentHash, files: &[(FileType, &[u8])]) -> Result<()> {
        dispatch!(self, engine => engine.put_files(guid, hash, files))
    }

    pub fn read_file(&self, file_type: FileType, guid: &Guid, hash: &ContentHash) -> Result<Vec<u8>> {
        dispatch!(self, engine => engine.read_file(file_type, guid, hash))
    }

    /// Remove one entry; returns whether it existed
    pub fn evict(&self, key: &FileKey) -> Result<bool> {
        dispatch!(self, engine => engine.evict(key))
    }

    /// The arena engine, if that is what was configured
    pub fn as_membuf(&self) -> Option<&MembufEngine> {
        match self {
            Cache::Membuf(engine) => Some(engine),
            Cache::Fs(_) => None,
        }
    }
}
