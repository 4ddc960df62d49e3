//! Put transactions
//!
//! A [`PutTransaction`] collects up to one byte stream per [`FileType`] for a
//! single `(guid, hash)` pair. Each stream is bounded by the size declared
//! when it was requested. Finalizing checks that every stream reached exactly
//! its declared size; if any did not, the whole transaction fails and all of
//! its buffers are dropped, including those of complete siblings.
//!
//! State machine:
//!
//! ```text
//! Open ──finalize──▶ Finalizing ──▶ Finalized
//!                               └─▶ Failed
//! ```
//!
//! Staged bytes live in memory or in temporary files, depending on the engine
//! that created the transaction. They are released when the transaction is
//! committed, discarded or dropped.

use crate::error::{CacheError, Result};
use crate::key::{ContentHash, FileType, Guid};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::NamedTempFile;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Open,
    Finalizing,
    Finalized,
    Failed,
}

/// Result of the first `finalize` call, replayed by every later call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizeOutcome {
    Finalized,
    Failed {
        file_type: FileType,
        expected: u64,
        written: u64,
    },
    Discarded,
}

impl FinalizeOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, FinalizeOutcome::Finalized)
    }

    pub fn error(&self) -> Option<CacheError> {
        match *self {
            FinalizeOutcome::Finalized => None,
            FinalizeOutcome::Failed {
                file_type,
                expected,
                written,
            } => Some(CacheError::IncompleteWrite {
                file_type,
                expected,
                written,
            }),
            FinalizeOutcome::Discarded => Some(CacheError::Transaction(
                "transaction was discarded".to_string(),
            )),
        }
    }

    pub fn into_result(self) -> Result<()> {
        match self.error() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Descriptor of one file that passed finalize
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommittedFile {
    pub file_type: FileType,
    pub size: u64,
}

/// Where an engine wants pending bytes kept
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Staging {
    Memory,
    /// Temporary files in this directory
    Directory(PathBuf),
}

enum Sink {
    Memory(Vec<u8>),
    TempFile(NamedTempFile),
}

struct PendingFile {
    declared: u64,
    written: u64,
    sink: Option<Sink>,
    sealed: bool,
}

impl PendingFile {
    /// Refuse further writes and drop the staged bytes
    fn close(&mut self) {
        self.sealed = true;
        self.sink = None;
    }

    fn is_complete(&self) -> bool {
        self.written == self.declared
    }
}

/// Bytes of a finalized file, handed to the engine at commit
pub enum StagedData {
    Memory(Vec<u8>),
    TempFile(NamedTempFile),
}

impl StagedData {
    pub fn into_bytes(self) -> io::Result<Vec<u8>> {
        match self {
            StagedData::Memory(bytes) => Ok(bytes),
            StagedData::TempFile(mut file) => {
                file.seek(SeekFrom::Start(0))?;
                let mut bytes = Vec::new();
                file.read_to_end(&mut bytes)?;
                Ok(bytes)
            }
        }
    }
}

pub struct CompletedFile {
    pub file_type: FileType,
    pub size: u64,
    pub data: StagedData,
}

type Observer = Box<dyn FnOnce(&FinalizeOutcome) + Send>;

pub struct PutTransaction {
    guid: Guid,
    hash: ContentHash,
    owner: u64,
    staging: Staging,
    state: TransactionState,
    pending: BTreeMap<FileType, Arc<Mutex<PendingFile>>>,
    files: Vec<CommittedFile>,
    outcome: Option<FinalizeOutcome>,
    observers: Vec<Observer>,
    handed_off: bool,
    committed: bool,
}

impl PutTransaction {
    pub(crate) fn new(guid: Guid, hash: ContentHash, staging: Staging, owner: u64) -> Self {
        PutTransaction {
            guid,
            hash,
            owner,
            staging,
            state: TransactionState::Open,
            pending: BTreeMap::new(),
            files: Vec::new(),
            outcome: None,
            observers: Vec::new(),
            handed_off: false,
            committed: false,
        }
    }

    pub fn guid(&self) -> &Guid {
        &self.guid
    }

    pub fn hash(&self) -> &ContentHash {
        &self.hash
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Outcome of finalize, once it has run
    pub fn outcome(&self) -> Option<FinalizeOutcome> {
        self.outcome
    }

    /// Files accepted by a successful finalize; empty before that
    pub fn files(&self) -> &[CommittedFile] {
        &self.files
    }

    /// Whether an engine has made this transaction's files visible
    pub fn is_committed(&self) -> bool {
        self.committed
    }

    pub(crate) fn owner(&self) -> u64 {
        self.owner
    }

    /// Open a bounded stream accepting exactly `size` bytes for `file_type`
    ///
    /// Requesting a stream again for the same type discards the bytes staged
    /// by the earlier request; its stream stops accepting writes.
    pub fn get_write_stream(&mut self, file_type: FileType, size: u64) -> Result<PutStream> {
        if size == 0 {
            return Err(CacheError::InvalidSize(0));
        }
        if self.state != TransactionState::Open {
            return Err(CacheError::Transaction(format!(
                "cannot open a {} stream on a {:?} transaction",
                file_type, self.state
            )));
        }

        let sink = match &self.staging {
            Staging::Memory => Sink::Memory(Vec::new()),
            Staging::Directory(dir) => {
                let prefix = format!("{}-{}.{}.", self.guid, self.hash, file_type);
                Sink::TempFile(tempfile::Builder::new().prefix(&prefix).tempfile_in(dir)?)
            }
        };

        let file = Arc::new(Mutex::new(PendingFile {
            declared: size,
            written: 0,
            sink: Some(sink),
            sealed: false,
        }));

        if let Some(previous) = self.pending.insert(file_type, Arc::clone(&file)) {
            previous.lock().close();
            tracing::debug!("Replaced pending {} stream for {}", file_type, self.guid);
        }

        Ok(PutStream { file_type, file })
    }

    /// Same as [`get_write_stream`](Self::get_write_stream) for a raw type
    /// code and a signed size
    pub fn get_write_stream_for(&mut self, code: &str, size: i64) -> Result<PutStream> {
        let file_type = FileType::from_code(code)?;
        if size <= 0 {
            return Err(CacheError::InvalidSize(size));
        }
        self.get_write_stream(file_type, size as u64)
    }

    /// Register a callback run once, right after finalize settles
    ///
    /// Runs immediately if the transaction already finalized or failed.
    pub fn on_finalize<F>(&mut self, observer: F)
    where
        F: FnOnce(&FinalizeOutcome) + Send + 'static,
    {
        match self.outcome {
            Some(outcome) => observer(&outcome),
            None => self.observers.push(Box::new(observer)),
        }
    }

    /// Check every pending file and settle the transaction
    ///
    /// Idempotent: later calls return the first outcome.
    pub fn finalize(&mut self) -> Result<()> {
        if let Some(outcome) = self.outcome {
            return outcome.into_result();
        }

        self.state = TransactionState::Finalizing;

        let incomplete = self.pending.iter().find_map(|(file_type, file)| {
            let file = file.lock();
            (!file.is_complete()).then_some((*file_type, file.declared, file.written))
        });

        let outcome = match incomplete {
            Some((file_type, expected, written)) => {
                self.release_buffers();
                self.state = TransactionState::Failed;
                tracing::warn!(
                    "Transaction {}-{} failed: {} has {} of {} bytes",
                    self.guid,
                    self.hash,
                    file_type,
                    written,
                    expected
                );
                FinalizeOutcome::Failed {
                    file_type,
                    expected,
                    written,
                }
            }
            None => {
                for (file_type, file) in &self.pending {
                    let mut file = file.lock();
                    file.sealed = true;
                    self.files.push(CommittedFile {
                        file_type: *file_type,
                        size: file.declared,
                    });
                }
                self.state = TransactionState::Finalized;
                FinalizeOutcome::Finalized
            }
        };

        self.settle(outcome);
        outcome.into_result()
    }

    /// Abandon the transaction and release everything it staged
    pub fn discard(&mut self) {
        if self.committed {
            return;
        }

        self.release_buffers();
        self.handed_off = true;

        if self.outcome.is_none() {
            self.state = TransactionState::Failed;
            self.settle(FinalizeOutcome::Discarded);
        }
    }

    /// Hand the finalized files to an engine
    ///
    /// Only possible once per transaction.
    pub fn take_completed(&mut self) -> Result<Vec<CompletedFile>> {
        match self.outcome {
            None => {
                return Err(CacheError::Transaction(
                    "transaction has not been finalized".to_string(),
                ))
            }
            Some(FinalizeOutcome::Finalized) => {}
            Some(outcome) => {
                return Err(outcome.error().unwrap_or_else(|| {
                    CacheError::Transaction("transaction did not finalize".to_string())
                }))
            }
        }

        if self.handed_off {
            return Err(CacheError::Transaction(format!(
                "transaction {}-{} was already committed",
                self.guid, self.hash
            )));
        }
        self.handed_off = true;

        let mut completed = Vec::with_capacity(self.pending.len());
        for (file_type, file) in std::mem::take(&mut self.pending) {
            let mut file = file.lock();
            let data = match file.sink.take() {
                Some(Sink::Memory(bytes)) => StagedData::Memory(bytes),
                Some(Sink::TempFile(temp)) => StagedData::TempFile(temp),
                None => {
                    return Err(CacheError::Transaction(format!(
                        "staged bytes for {} are gone",
                        file_type
                    )))
                }
            };
            completed.push(CompletedFile {
                file_type,
                size: file.declared,
                data,
            });
        }

        Ok(completed)
    }

    pub(crate) fn mark_committed(&mut self) {
        self.committed = true;
    }

    fn settle(&mut self, outcome: FinalizeOutcome) {
        self.outcome = Some(outcome);
        for observer in self.observers.drain(..) {
            observer(&outcome);
        }
    }

    fn release_buffers(&mut self) {
        for file in self.pending.values() {
            file.lock().close();
        }
        self.pending.clear();
    }
}

impl Drop for PutTransaction {
    fn drop(&mut self) {
        if !self.pending.is_empty() {
            if self.state == TransactionState::Open {
                tracing::debug!(
                    "Abandoned transaction {}-{} with {} pending files",
                    self.guid,
                    self.hash,
                    self.pending.len()
                );
            }
            self.release_buffers();
        }
    }
}

impl fmt::Debug for PutTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PutTransaction")
            .field("guid", &self.guid)
            .field("hash", &self.hash)
            .field("state", &self.state)
            .field("pending", &self.pending.keys().collect::<Vec<_>>())
            .field("files", &self.files)
            .field("committed", &self.committed)
            .finish()
    }
}

/// Bounded writer for one pending file
///
/// Accepts at most the declared number of bytes. A write that would overflow
/// fails with `InvalidInput` and writes nothing; writes after the transaction
/// settled fail with `BrokenPipe`.
pub struct PutStream {
    file_type: FileType,
    file: Arc<Mutex<PendingFile>>,
}

impl PutStream {
    pub fn file_type(&self) -> FileType {
        self.file_type
    }

    pub fn declared_size(&self) -> u64 {
        self.file.lock().declared
    }

    pub fn written(&self) -> u64 {
        self.file.lock().written
    }

    pub fn remaining(&self) -> u64 {
        let file = self.file.lock();
        file.declared - file.written
    }
}

impl Write for PutStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut file = self.file.lock();
        if file.sealed {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                format!("{} stream is closed", self.file_type),
            ));
        }

        let remaining = file.declared - file.written;
        if buf.len() as u64 > remaining {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "{} bytes exceed the {} bytes left in the {} stream",
                    buf.len(),
                    remaining,
                    self.file_type
                ),
            ));
        }
        if buf.is_empty() {
            return Ok(0);
        }

        match file.sink.as_mut() {
            Some(Sink::Memory(bytes)) => bytes.extend_from_slice(buf),
            Some(Sink::TempFile(temp)) => temp.write_all(buf)?,
            None => {
                return Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    format!("{} stream is closed", self.file_type),
                ))
            }
        }
        file.written += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.file.lock().sink.as_mut() {
            Some(Sink::TempFile(temp)) => temp.flush(),
            _ => Ok(()),
        }
    }
}
