//! Filesystem engine
//!
//! Each entry is an ordinary file under the cache root:
//!
//! ```text
//! <root>/<first two hex chars of guid>/<guid>-<hash>.<type>
//! ```
//!
//! Pending bytes are staged as temporary files in `<root>/.staging` and
//! renamed into place on commit. The directory layout is the shared state,
//! so workers open the same root directly instead of registering with a
//! coordinator.

use crate::cluster::CoordinatorChannel;
use crate::config::CacheConfig;
use crate::engine::{check_owner, epoch_secs, next_engine_id, Capabilities, CacheEngine, FileInfo};
use crate::error::{CacheError, Result};
use crate::key::{ContentHash, FileKey, FileType, Guid};
use crate::stream::FileStream;
use crate::transaction::{PutTransaction, Staging, StagedData};
use parking_lot::RwLock;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::TempPath;

/// Staging directory name under the cache root
pub const STAGING_DIR: &str = ".staging";

pub struct FsEngine {
    id: u64,
    root: RwLock<Option<PathBuf>>,
}

impl Default for FsEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl FsEngine {
    pub fn new() -> Self {
        FsEngine {
            id: next_engine_id(),
            root: RwLock::new(None),
        }
    }

    fn root(&self) -> Result<PathBuf> {
        self.root.read().clone().ok_or(CacheError::NotInitialized)
    }

    /// Location of an entry under the cache root
    pub fn entry_path(root: &Path, key: &FileKey) -> PathBuf {
        let hex = key.guid.to_hex();
        let shard = hex.get(..2).unwrap_or("00");
        root.join(shard).join(key.file_name())
    }

    /// Delete one entry; returns whether it existed
    pub fn evict(&self, key: &FileKey) -> Result<bool> {
        let path = Self::entry_path(&self.root()?, key);
        match fs::remove_file(&path) {
            Ok(()) => {
                tracing::debug!("Evicted {}", key);
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn open_entry(&self, key: &FileKey) -> Result<File> {
        let path = Self::entry_path(&self.root()?, key);
        File::open(&path).map_err(|e| not_found_or(e, key))
    }
}

fn not_found_or(err: io::Error, key: &FileKey) -> CacheError {
    if err.kind() == io::ErrorKind::NotFound {
        CacheError::NotFound(key.clone())
    } else {
        CacheError::Io(err)
    }
}

/// Move staged bytes to `target`, which must not exist
fn persist(data: StagedData, target: &Path) -> Result<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }

    match data {
        StagedData::TempFile(temp) => {
            temp.as_file().sync_data()?;
            temp.persist(target).map_err(|e| e.error)?;
        }
        StagedData::Memory(bytes) => {
            let tmp = target.with_extension("tmp");
            let written = File::create(&tmp).and_then(|mut file| {
                file.write_all(&bytes)?;
                file.sync_data()?;
                fs::rename(&tmp, target)
            });
            if let Err(e) = written {
                let _ = fs::remove_file(&tmp);
                return Err(e.into());
            }
        }
    }
    Ok(())
}

/// Move an existing entry out of the way, into the staging directory
fn set_aside(staging: &Path, target: &Path) -> Result<Option<TempPath>> {
    match fs::symlink_metadata(target) {
        Ok(metadata) if metadata.is_file() => {
            let backup = tempfile::Builder::new()
                .prefix("replaced.")
                .tempfile_in(staging)?
                .into_temp_path();
            match fs::rename(target, &backup) {
                Ok(()) => Ok(Some(backup)),
                // Evicted concurrently
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
                Err(e) => Err(e.into()),
            }
        }
        Ok(_) => Err(CacheError::Io(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("{} exists and is not a regular file", target.display()),
        ))),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Entry written by an in-progress commit
struct Placed {
    target: PathBuf,
    /// Previous file at `target`; deleted when dropped
    replaced: Option<TempPath>,
    written: bool,
}

/// Files moved by one commit, undone together if any step fails
struct FsCommit<'a> {
    staging: &'a Path,
    placed: Vec<Placed>,
}

impl<'a> FsCommit<'a> {
    fn new(staging: &'a Path) -> Self {
        FsCommit {
            staging,
            placed: Vec::new(),
        }
    }

    fn place(&mut self, data: StagedData, target: PathBuf) -> Result<()> {
        let replaced = set_aside(self.staging, &target)?;
        self.placed.push(Placed {
            target,
            replaced,
            written: false,
        });

        if let Some(placed) = self.placed.last_mut() {
            persist(data, &placed.target)?;
            placed.written = true;
        }
        Ok(())
    }

    /// Remove new files and move replaced ones back
    fn rollback(self) {
        for placed in self.placed.into_iter().rev() {
            if placed.written {
                if let Err(e) = fs::remove_file(&placed.target) {
                    tracing::warn!("Cannot remove {}: {}", placed.target.display(), e);
                }
            }
            if let Some(replaced) = placed.replaced {
                if let Err(e) = fs::rename(&replaced, &placed.target) {
                    tracing::warn!("Cannot restore {}: {}", placed.target.display(), e);
                }
            }
        }
    }
}

/// Remove temp files left behind by an interrupted process
fn clear_staging(dir: &Path) -> Result<()> {
    let mut removed = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            fs::remove_file(entry.path())?;
            removed += 1;
        }
    }
    if removed > 0 {
        tracing::warn!("Removed {} stale staging files from {}", removed, dir.display());
    }
    Ok(())
}

impl CacheEngine for FsEngine {
    const CAPABILITIES: Capabilities = Capabilities {
        clustering: false,
        durable: true,
    };

    fn init(&self, config: &CacheConfig) -> Result<()> {
        let root = config.require_cache_path()?.to_path_buf();

        let mut guard = self.root.write();
        if guard.is_some() {
            return Err(CacheError::Config(
                "filesystem engine is already initialized".to_string(),
            ));
        }

        let staging = root.join(STAGING_DIR);
        fs::create_dir_all(&staging)?;
        clear_staging(&staging)?;

        tracing::info!("Filesystem engine initialized at {}", root.display());
        *guard = Some(root);
        Ok(())
    }

    fn shutdown(&self) -> Result<()> {
        if self.root.write().take().is_some() {
            tracing::info!("Filesystem engine shut down");
        }
        Ok(())
    }

    fn register_cluster_worker(&self, _channel: Box<dyn CoordinatorChannel>) {
        tracing::debug!("Filesystem engine does not support clustering; channel ignored");
    }

    fn create_put_transaction(&self, guid: Guid, hash: ContentHash) -> Result<PutTransaction> {
        let staging = self.root()?.join(STAGING_DIR);
        Ok(PutTransaction::new(
            guid,
            hash,
            Staging::Directory(staging),
            self.id,
        ))
    }

    fn end_put_transaction(&self, trx: &mut PutTransaction) -> Result<()> {
        check_owner(self.id, trx)?;
        trx.finalize()?;

        let root = self.root()?;
        let staging = root.join(STAGING_DIR);
        let completed = trx.take_completed()?;

        let mut commit = FsCommit::new(&staging);
        for file in completed {
            let key = FileKey::new(file.file_type, trx.guid().clone(), trx.hash().clone());
            if let Err(e) = commit.place(file.data, Self::entry_path(&root, &key)) {
                tracing::warn!("Rolling back commit of {}: {}", key, e);
                commit.rollback();
                return Err(e);
            }
            tracing::debug!("Committed {} ({} bytes)", key, file.size);
        }
        // Dropping the commit deletes the replaced files
        drop(commit);

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
        let metadata = self.open_entry(&key)?.metadata()?;

        Ok(FileInfo {
            size: metadata.len(),
            committed_at: metadata.modified().map(epoch_secs).unwrap_or(0),
        })
    }

    fn get_file_stream(
        &self,
        file_type: FileType,
        guid: &Guid,
        hash: &ContentHash,
    ) -> Result<FileStream> {
        let key = FileKey::new(file_type, guid.clone(), hash.clone());
        let file = self.open_entry(&key)?;
        let len = file.metadata()?.len();
        Ok(FileStream::from_file(file, len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn engine(dir: &TempDir) -> FsEngine {
        let engine = FsEngine::new();
        engine.init(&CacheConfig::fs(dir.path())).unwrap();
        engine
    }

    fn ids() -> (Guid, ContentHash) {
        (
            Guid::from_bytes([0xAB, 0xCD, 0xEF]),
            ContentHash::from_bytes([0x01, 0x02]),
        )
    }

    #[test]
    fn test_requires_cache_path() {
        let engine = FsEngine::new();
        let config = CacheConfig {
            engine: crate::config::EngineKind::Fs,
            ..Default::default()
        };
        assert!(matches!(engine.init(&config), Err(CacheError::Config(_))));
    }

    #[test]
    fn test_commit_layout() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        let (guid, hash) = ids();

        engine
            .put_files(guid.clone(), hash.clone(), &[(FileType::Asset, b"asset bytes")])
            .unwrap();

        let path = dir.path().join("ab").join("abcdef-0102.asset");
        assert_eq!(fs::read(path).unwrap(), b"asset bytes");
        assert_eq!(engine.get_file_info(FileType::Asset, &guid, &hash).unwrap().size, 11);
        assert_eq!(engine.read_file(FileType::Asset, &guid, &hash).unwrap(), b"asset bytes");

        // Staged file was renamed, not copied
        assert_eq!(fs::read_dir(dir.path().join(STAGING_DIR)).unwrap().count(), 0);
    }

    #[test]
    fn test_incomplete_transaction_leaves_nothing() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        let (guid, hash) = ids();

        let mut trx = engine.create_put_transaction(guid.clone(), hash.clone()).unwrap();
        let mut info = trx.get_write_stream(FileType::Info, 1024).unwrap();
        info.write_all(&[0u8; 512]).unwrap();
        let mut asset = trx.get_write_stream(FileType::Asset, 1).unwrap();
        asset.write_all(b"a").unwrap();

        assert!(matches!(
            engine.end_put_transaction(&mut trx),
            Err(CacheError::IncompleteWrite { .. })
        ));
        assert!(engine.get_file_info(FileType::Info, &guid, &hash).unwrap_err().is_not_found());
        assert!(engine.get_file_info(FileType::Asset, &guid, &hash).unwrap_err().is_not_found());
        assert_eq!(fs::read_dir(dir.path().join(STAGING_DIR)).unwrap().count(), 0);
    }

    #[test]
    fn test_failed_commit_restores_replaced_entries() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        let (guid, hash) = ids();
        engine
            .put_files(
                guid.clone(),
                hash.clone(),
                &[(FileType::Info, &b"old"[..]), (FileType::Asset, &b"old asset"[..])],
            )
            .unwrap();

        // A directory squatting on the resource path makes the last move fail
        let blocked = dir.path().join("ab").join("abcdef-0102.resource");
        fs::create_dir_all(&blocked).unwrap();

        let result = engine.put_files(
            guid.clone(),
            hash.clone(),
            &[
                (FileType::Info, &b"new"[..]),
                (FileType::Asset, &b"new asset"[..]),
                (FileType::Resource, &b"r"[..]),
            ],
        );
        assert!(matches!(result, Err(CacheError::Io(_))));

        assert_eq!(engine.read_file(FileType::Info, &guid, &hash).unwrap(), b"old");
        assert_eq!(engine.read_file(FileType::Asset, &guid, &hash).unwrap(), b"old asset");
        assert!(blocked.is_dir());
        assert_eq!(fs::read_dir(dir.path().join(STAGING_DIR)).unwrap().count(), 0);
    }

    #[test]
    fn test_failed_commit_removes_new_entries() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        let (guid, hash) = ids();
        fs::create_dir_all(dir.path().join("ab").join("abcdef-0102.resource")).unwrap();

        assert!(engine
            .put_files(
                guid.clone(),
                hash.clone(),
                &[(FileType::Info, &b"info"[..]), (FileType::Resource, &b"r"[..])],
            )
            .is_err());
        assert!(engine.get_file_info(FileType::Info, &guid, &hash).unwrap_err().is_not_found());
        assert_eq!(fs::read_dir(dir.path().join(STAGING_DIR)).unwrap().count(), 0);
    }

    #[test]
    fn test_overwrite_drops_replaced_file() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        let (guid, hash) = ids();

        for bytes in [&b"first"[..], &b"second"[..]] {
            engine
                .put_files(guid.clone(), hash.clone(), &[(FileType::Info, bytes)])
                .unwrap();
        }

        assert_eq!(engine.read_file(FileType::Info, &guid, &hash).unwrap(), b"second");
        assert_eq!(fs::read_dir(dir.path().join(STAGING_DIR)).unwrap().count(), 0);
    }

    #[test]
    fn test_evict() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        let (guid, hash) = ids();
        engine
            .put_files(guid.clone(), hash.clone(), &[(FileType::Info, b"i")])
            .unwrap();

        let key = FileKey::new(FileType::Info, guid.clone(), hash.clone());
        assert!(engine.evict(&key).unwrap());
        assert!(!engine.evict(&key).unwrap());
        assert!(engine.get_file_stream(FileType::Info, &guid, &hash).is_err());
    }

    #[test]
    fn test_init_clears_stale_staging() {
        let dir = TempDir::new().unwrap();
        let staging = dir.path().join(STAGING_DIR);
        fs::create_dir_all(&staging).unwrap();
        fs::write(staging.join("leftover"), b"junk").unwrap();

        let _engine = engine(&dir);
        assert_eq!(fs::read_dir(&staging).unwrap().count(), 0);
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        engine.shutdown().unwrap();
        engine.shutdown().unwrap();
        assert!(matches!(
            engine.create_put_transaction(Guid::from_bytes([1]), ContentHash::from_bytes([2])),
            Err(CacheError::NotInitialized)
        ));
    }
}
