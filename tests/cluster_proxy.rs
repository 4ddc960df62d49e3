//! Worker processes proxying through the arena owner

use artifact_cache::{
    local_channel, CacheConfig, CacheEngine, CacheError, ClusterClient, ContentHash, FileType,
    FsEngine, Guid, MembufEngine,
};
use std::io::Write;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn config() -> CacheConfig {
    CacheConfig::membuf()
        .with_page_sizes(32 * 1024, 32 * 1024)
        .with_min_free_block_size(64)
}

fn owner() -> MembufEngine {
    let engine = MembufEngine::new();
    engine.init(&config()).unwrap();
    engine
}

fn worker_for(owner: &MembufEngine) -> ClusterClient {
    let (worker_side, owner_side) = local_channel();
    owner.register_cluster_worker(Box::new(owner_side));

    let client = ClusterClient::new(Box::new(worker_side)).with_timeout(Duration::from_secs(10));
    client.init(&config()).unwrap();
    client
}

#[test]
fn test_worker_commit_is_visible_to_owner() {
    let owner = owner();
    let worker = worker_for(&owner);
    let guid = Guid::from_bytes([1u8; 16]);
    let hash = ContentHash::from_bytes([2u8; 16]);

    let mut trx = worker
        .create_put_transaction(guid.clone(), hash.clone())
        .unwrap();
    let mut info = trx.get_write_stream(FileType::Info, 1024).unwrap();
    info.write_all(&[0x5A; 1024]).unwrap();
    let mut asset = trx.get_write_stream(FileType::Asset, 3).unwrap();
    asset.write_all(b"abc").unwrap();
    worker.end_put_transaction(&mut trx).unwrap();
    assert!(trx.is_committed());

    assert_eq!(owner.get_file_info(FileType::Info, &guid, &hash).unwrap().size, 1024);
    assert_eq!(owner.read_file(FileType::Asset, &guid, &hash).unwrap(), b"abc");

    // Reads from the worker are answered by the owner
    assert_eq!(worker.get_file_info(FileType::Info, &guid, &hash).unwrap().size, 1024);
    assert_eq!(worker.read_file(FileType::Info, &guid, &hash).unwrap(), vec![0x5A; 1024]);

    owner.shutdown().unwrap();
}

#[test]
fn test_incomplete_worker_transaction_never_reaches_owner() {
    let owner = owner();
    let worker = worker_for(&owner);
    let guid = Guid::from_bytes([3u8; 16]);
    let hash = ContentHash::from_bytes([4u8; 16]);

    let mut trx = worker
        .create_put_transaction(guid.clone(), hash.clone())
        .unwrap();
    let mut info = trx.get_write_stream(FileType::Info, 1024).unwrap();
    info.write_all(&[0u8; 512]).unwrap();

    assert!(matches!(
        worker.end_put_transaction(&mut trx),
        Err(CacheError::IncompleteWrite { .. })
    ));
    assert!(owner
        .get_file_info(FileType::Info, &guid, &hash)
        .unwrap_err()
        .is_not_found());
    assert_eq!(owner.stats().unwrap().entries, 0);

    owner.shutdown().unwrap();
}

#[test]
fn test_remote_errors_keep_their_kind() {
    let owner = MembufEngine::new();
    let tight = config().with_page_sizes(1024, 1024).with_max_page_count(1);
    owner.init(&tight).unwrap();
    let worker = worker_for(&owner);

    let guid = Guid::from_bytes([5u8; 16]);
    let hash = ContentHash::from_bytes([6u8; 16]);

    let err = worker
        .get_file_info(FileType::Resource, &guid, &hash)
        .unwrap_err();
    assert!(err.is_not_found());

    let err = worker
        .put_files(guid.clone(), hash.clone(), &[(FileType::Asset, &[0u8; 4096][..])])
        .unwrap_err();
    assert!(matches!(err, CacheError::Allocation(_)));

    owner.shutdown().unwrap();
}

#[test]
fn test_many_workers_share_one_arena() {
    let owner = owner();
    let workers: Vec<Arc<ClusterClient>> = (0..4).map(|_| Arc::new(worker_for(&owner))).collect();

    let handles: Vec<_> = workers
        .iter()
        .enumerate()
        .map(|(w, worker)| {
            let worker = Arc::clone(worker);
            thread::spawn(move || {
                for i in 0..25u8 {
                    let guid = Guid::from_bytes([w as u8, i]);
                    let hash = ContentHash::from_bytes([i]);
                    let payload = vec![i; 100 + i as usize * 10];
                    worker
                        .put_files(guid, hash, &[(FileType::Asset, payload.as_slice())])
                        .unwrap();
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(owner.stats().unwrap().entries, 100);
    owner.check_invariants().unwrap();

    let payload = owner
        .read_file(
            FileType::Asset,
            &Guid::from_bytes([3u8, 24]),
            &ContentHash::from_bytes([24u8]),
        )
        .unwrap();
    assert_eq!(payload, vec![24u8; 340]);

    owner.shutdown().unwrap();
}

#[test]
fn test_owner_shutdown_disconnects_workers() {
    let owner = owner();
    let worker = worker_for(&owner);
    owner.shutdown().unwrap();

    let err = worker
        .get_file_info(
            FileType::Info,
            &Guid::from_bytes([1]),
            &ContentHash::from_bytes([1]),
        )
        .unwrap_err();
    assert!(matches!(err, CacheError::Cluster(_)));
}

#[test]
fn test_worker_requires_init() {
    let (worker_side, _owner_side) = local_channel();
    let worker = ClusterClient::new(Box::new(worker_side));
    assert!(matches!(
        worker.create_put_transaction(Guid::from_bytes([1]), ContentHash::from_bytes([1])),
        Err(CacheError::NotInitialized)
    ));
}

#[test]
fn test_fs_engine_ignores_workers() {
    let dir = tempfile::TempDir::new().unwrap();
    let engine = FsEngine::new();
    engine.init(&CacheConfig::fs(dir.path())).unwrap();

    let (worker_side, owner_side) = local_channel();
    engine.register_cluster_worker(Box::new(owner_side));

    // The channel was dropped, so the worker sees a disconnect right away
    let worker = ClusterClient::new(Box::new(worker_side));
    worker.init(&CacheConfig::fs(dir.path())).unwrap();
    assert!(matches!(
        worker.get_file_info(FileType::Info, &Guid::from_bytes([1]), &ContentHash::from_bytes([1])),
        Err(CacheError::Cluster(_))
    ));
}
