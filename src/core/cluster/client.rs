//! Worker-side engine proxying to the owning process

use super::{ClusterFile, ClusterOp, ClusterPayload, ClusterRequest, RemoteError, WorkerChannel};
use crate::cluster::CoordinatorChannel;
use crate::config::CacheConfig;
use crate::engine::{check_owner, next_engine_id, Capabilities, CacheEngine, FileInfo};
use crate::error::{CacheError, Result};
use crate::key::{ContentHash, FileKey, FileType, Guid};
use crate::stream::FileStream;
use crate::transaction::{PutTransaction, Staging};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Cache engine for worker processes
///
/// Transactions are staged in local memory. Committing ships the finalized
/// files to the owner in one request, and reads are answered by the owner.
/// Requests are serialized over the single channel.
pub struct ClusterClient {
    id: u64,
    channel: Mutex<Box<dyn WorkerChannel>>,
    next_request: AtomicU64,
    timeout: Duration,
    initialized: AtomicBool,
}

impl ClusterClient {
    pub fn new(channel: Box<dyn WorkerChannel>) -> Self {
        ClusterClient {
            id: next_engine_id(),
            channel: Mutex::new(channel),
            next_request: AtomicU64::new(1),
            timeout: DEFAULT_REQUEST_TIMEOUT,
            initialized: AtomicBool::new(false),
        }
    }

    /// Limit how long a request waits for its reply
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn ensure_initialized(&self) -> Result<()> {
        if self.initialized.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(CacheError::NotInitialized)
        }
    }

    fn request(&self, op: ClusterOp) -> Result<ClusterPayload> {
        self.ensure_initialized()?;

        let id = self.next_request.fetch_add(1, Ordering::Relaxed);
        let mut channel = self.channel.lock();
        channel.send_request(&ClusterRequest { id, op })?;

        loop {
            let reply = channel.recv_reply(self.timeout)?.ok_or_else(|| {
                CacheError::Cluster(format!("request {} timed out after {:?}", id, self.timeout))
            })?;

            if reply.id != id {
                // Late reply to a request that already timed out
                tracing::warn!("Ignoring cluster reply {} while waiting for {}", reply.id, id);
                continue;
            }

            return reply.result.map_err(RemoteError::into_error);
        }
    }
}

impl CacheEngine for ClusterClient {
    const CAPABILITIES: Capabilities = Capabilities {
        clustering: false,
        durable: false,
    };

    fn init(&self, _config: &CacheConfig) -> Result<()> {
        self.initialized.store(true, Ordering::Release);
        tracing::info!("Cluster client initialized");
        Ok(())
    }

    fn shutdown(&self) -> Result<()> {
        self.initialized.store(false, Ordering::Release);
        Ok(())
    }

    fn register_cluster_worker(&self, _channel: Box<dyn CoordinatorChannel>) {
        tracing::debug!("Cluster client does not accept workers; channel ignored");
    }

    fn create_put_transaction(&self, guid: Guid, hash: ContentHash) -> Result<PutTransaction> {
        self.ensure_initialized()?;
        Ok(PutTransaction::new(guid, hash, Staging::Memory, self.id))
    }

    fn end_put_transaction(&self, trx: &mut PutTransaction) -> Result<()> {
        check_owner(self.id, trx)?;
        trx.finalize()?;

        let completed = trx.take_completed()?;
        let mut files = Vec::with_capacity(completed.len());
        for file in completed {
            files.push(ClusterFile {
                file_type: file.file_type,
                bytes: file.data.into_bytes()?,
            });
        }

        if !files.is_empty() {
            let op = ClusterOp::Commit {
                guid: trx.guid().clone(),
                hash: trx.hash().clone(),
                files,
            };
            match self.request(op)? {
                ClusterPayload::Committed => {}
                other => return Err(unexpected("commit", &other)),
            }
        }

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
        match self.request(ClusterOp::FileInfo { key })? {
            ClusterPayload::Info(info) => Ok(info),
            other => Err(unexpected("file-info", &other)),
        }
    }

    fn get_file_stream(
        &self,
        file_type: FileType,
        guid: &Guid,
        hash: &ContentHash,
    ) -> Result<FileStream> {
        let key = FileKey::new(file_type, guid.clone(), hash.clone());
        match self.request(ClusterOp::ReadFile { key })? {
            ClusterPayload::Bytes(bytes) => Ok(FileStream::from_bytes(bytes)),
            other => Err(unexpected("read-file", &other)),
        }
    }
}

fn unexpected(op: &str, payload: &ClusterPayload) -> CacheError {
    CacheError::Cluster(format!("unexpected {:?} reply to {}", payload, op))
}
