//! Concurrent transactions against one arena engine

use artifact_cache::{CacheConfig, CacheEngine, ContentHash, FileType, Guid, MembufEngine};
use rand::Rng;
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

fn engine() -> MembufEngine {
    let engine = MembufEngine::new();
    engine
        .init(
            &CacheConfig::membuf()
                .with_page_sizes(256 * 1024, 256 * 1024)
                .with_min_free_block_size(128)
                .with_max_page_count(32),
        )
        .unwrap();
    engine
}

#[test]
fn test_8_writers_4_readers() {
    let engine = engine();

    // Pre-populate
    for i in 0..50u8 {
        engine
            .put_files(
                Guid::from_bytes([0xFF, i]),
                ContentHash::from_bytes([i]),
                &[(FileType::Info, format!("data{}", i).as_bytes())],
            )
            .unwrap();
    }

    let reads = Arc::new(AtomicUsize::new(0));
    let handles: Vec<_> = (0..12u8)
        .map(|thread_id| {
            let engine = engine.clone();
            let reads = Arc::clone(&reads);
            thread::spawn(move || {
                let mut rng = rand::thread_rng();
                if thread_id < 8 {
                    for i in 0..100u8 {
                        let len = rng.gen_range(1..4096);
                        let mut trx = engine
                            .create_put_transaction(
                                Guid::from_bytes([thread_id, i]),
                                ContentHash::from_bytes([0u8; 4]),
                            )
                            .unwrap();
                        let mut stream = trx.get_write_stream(FileType::Asset, len).unwrap();
                        stream.write_all(&vec![thread_id; len as usize]).unwrap();
                        engine.end_put_transaction(&mut trx).unwrap();
                    }
                } else {
                    for _ in 0..1000 {
                        let idx = rng.gen_range(0..50u8);
                        let bytes = engine
                            .read_file(
                                FileType::Info,
                                &Guid::from_bytes([0xFF, idx]),
                                &ContentHash::from_bytes([idx]),
                            )
                            .unwrap();
                        assert_eq!(bytes, format!("data{}", idx).as_bytes());
                        reads.fetch_add(1, Ordering::Relaxed);
                    }
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(reads.load(Ordering::Relaxed), 4000);
    assert_eq!(engine.stats().unwrap().entries, 50 + 800);
    engine.check_invariants().unwrap();
}

#[test]
fn test_concurrent_overwrites_of_one_key() {
    let engine = engine();
    let guid = Guid::from_bytes([7u8; 16]);
    let hash = ContentHash::from_bytes([7u8; 16]);

    let handles: Vec<_> = (0..8u8)
        .map(|thread_id| {
            let engine = engine.clone();
            let guid = guid.clone();
            let hash = hash.clone();
            thread::spawn(move || {
                for _ in 0..50 {
                    let payload = vec![thread_id; 1000 + thread_id as usize];
                    engine
                        .put_files(guid.clone(), hash.clone(), &[(FileType::Resource, payload.as_slice())])
                        .unwrap();
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    // Some writer won; its bytes are intact and nothing leaked
    let bytes = engine.read_file(FileType::Resource, &guid, &hash).unwrap();
    let winner = bytes[0];
    assert_eq!(bytes, vec![winner; 1000 + winner as usize]);

    let stats = engine.stats().unwrap();
    assert_eq!(stats.entries, 1);
    assert!(stats.arena.allocated_size < 2 * 1024 + 128);
    engine.check_invariants().unwrap();
}

#[test]
fn test_abandoned_transactions_under_load() {
    let engine = engine();

    let handles: Vec<_> = (0..4u8)
        .map(|thread_id| {
            let engine = engine.clone();
            thread::spawn(move || {
                for i in 0..200u8 {
                    let mut trx = engine
                        .create_put_transaction(Guid::from_bytes([thread_id, i]), ContentHash::from_bytes([1]))
                        .unwrap();
                    let mut stream = trx.get_write_stream(FileType::Info, 64).unwrap();
                    stream.write_all(&[i; 32]).unwrap();
                    if i % 2 == 0 {
                        assert!(engine.end_put_transaction(&mut trx).is_err());
                    }
                    // Odd iterations drop the transaction unfinished
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    let stats = engine.stats().unwrap();
    assert_eq!(stats.entries, 0);
    assert_eq!(stats.arena.allocated_size, 0);
}
