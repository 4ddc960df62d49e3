//! Shared cache contract
//!
//! Every storage engine implements [`CacheEngine`]. Callers open a
//! [`PutTransaction`] per `(guid, hash)`, write each file type through its
//! bounded stream, then hand the transaction back with
//! [`end_put_transaction`](CacheEngine::end_put_transaction). Committed
//! entries are immutable and readable independently of each other.

use crate::cluster::CoordinatorChannel;
use crate::config::CacheConfig;
use crate::error::{CacheError, Result};
use crate::key::{ContentHash, FileType, Guid};
use crate::stream::FileStream;
use crate::transaction::PutTransaction;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Static feature descriptor of an engine type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    /// Accepts worker channels through `register_cluster_worker`
    pub clustering: bool,
    /// Committed entries survive a restart
    pub durable: bool,
}

/// Metadata of a committed entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    /// Stored byte count
    pub size: u64,
    /// Commit time as Unix epoch seconds
    pub committed_at: u64,
}

pub trait CacheEngine: Send + Sync {
    const CAPABILITIES: Capabilities;

    fn capabilities(&self) -> Capabilities {
        Self::CAPABILITIES
    }

    /// Prepare the engine, creating its storage root if needed
    fn init(&self, config: &CacheConfig) -> Result<()>;

    /// Release every held resource; idempotent and safe without `init`
    fn shutdown(&self) -> Result<()>;

    /// Serve requests arriving on a worker's channel
    ///
    /// Engines without clustering support ignore the channel. Failures are
    /// reported over the channel, never returned here.
    fn register_cluster_worker(&self, channel: Box<dyn CoordinatorChannel>);

    fn create_put_transaction(&self, guid: Guid, hash: ContentHash) -> Result<PutTransaction>;

    /// Finalize `trx` if needed and make all of its files visible together
    ///
    /// A transaction that failed to finalize returns the finalize error and
    /// leaves the store untouched.
    fn end_put_transaction(&self, trx: &mut PutTransaction) -> Result<()>;

    fn get_file_info(&self, file_type: FileType, guid: &Guid, hash: &ContentHash)
        -> Result<FileInfo>;

    fn get_file_stream(
        &self,
        file_type: FileType,
        guid: &Guid,
        hash: &ContentHash,
    ) -> Result<FileStream>;

    /// Store complete files in one transaction
    fn put_files(&self, guid: Guid, hash: ContentHash, files: &[(FileType, &[u8])]) -> Result<()> {
        let mut trx = self.create_put_transaction(guid, hash)?;
        for (file_type, bytes) in files {
            let mut stream = trx.get_write_stream(*file_type, bytes.len() as u64)?;
            stream.write_all(bytes)?;
        }
        self.end_put_transaction(&mut trx)
    }

    /// Read a whole entry into memory
    fn read_file(&self, file_type: FileType, guid: &Guid, hash: &ContentHash) -> Result<Vec<u8>> {
        Ok(self.get_file_stream(file_type, guid, hash)?.read_all()?)
    }
}

/// Unique id per engine instance, used to match transactions to their engine
pub(crate) fn next_engine_id() -> u64 {
    static NEXT_ID: AtomicU64 = AtomicU64::new(1);
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

pub(crate) fn check_owner(engine_id: u64, trx: &PutTransaction) -> Result<()> {
    if trx.owner() != engine_id {
        return Err(CacheError::Transaction(format!(
            "transaction {}-{} was created by another engine",
            trx.guid(),
            trx.hash()
        )));
    }
    Ok(())
}

pub(crate) fn epoch_secs(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
