//! Arena growth through the engine

use artifact_cache::{
    CacheConfig, CacheEngine, CacheError, ContentHash, FileKey, FileType, FitPolicy, Guid,
    MembufEngine,
};

fn engine(initial: u64, grow: u64, max_pages: u32) -> MembufEngine {
    let engine = MembufEngine::new();
    engine
        .init(
            &CacheConfig::membuf()
                .with_page_sizes(initial, grow)
                .with_min_free_block_size(64)
                .with_max_page_count(max_pages),
        )
        .unwrap();
    engine
}

fn put(engine: &MembufEngine, n: u8, len: usize) -> Result<(), CacheError> {
    engine.put_files(
        Guid::from_bytes([n]),
        ContentHash::from_bytes([0]),
        &[(FileType::Asset, vec![n; len].as_slice())],
    )
}

#[test]
fn test_starts_with_initial_page() {
    let engine = engine(10_000, 4_000, 8);
    let stats = engine.stats().unwrap();
    assert_eq!(stats.arena.page_count, 1);
    assert_eq!(stats.arena.total_size, 10_000);
    assert_eq!(stats.arena.free_size, 10_000);
}

#[test]
fn test_grows_by_whole_growth_units() {
    let engine = engine(10_000, 4_000, 8);
    put(&engine, 1, 10_000).unwrap();

    // 9000 bytes need ceil(9000 / 4000) = 3 growth units
    put(&engine, 2, 9_000).unwrap();
    let stats = engine.stats().unwrap();
    assert_eq!(stats.arena.page_count, 2);
    assert_eq!(stats.arena.total_size, 10_000 + 12_000);
    assert_eq!(stats.arena.free_size, 3_000);
}

#[test]
fn test_free_space_is_reused_before_growing() {
    let engine = engine(10_000, 4_000, 8);
    put(&engine, 1, 4_000).unwrap();
    put(&engine, 2, 4_000).unwrap();

    engine
        .evict(&FileKey::new(
            FileType::Asset,
            Guid::from_bytes([1]),
            ContentHash::from_bytes([0]),
        ))
        .unwrap();

    put(&engine, 3, 3_500).unwrap();
    assert_eq!(engine.stats().unwrap().arena.page_count, 1);
    engine.check_invariants().unwrap();
}

#[test]
fn test_page_limit_fails_without_side_effects() {
    let engine = engine(4_096, 4_096, 2);
    put(&engine, 1, 4_096).unwrap();
    put(&engine, 2, 4_096).unwrap();
    let before = engine.stats().unwrap();

    let err = put(&engine, 3, 1).unwrap_err();
    assert!(matches!(err, CacheError::Allocation(_)));
    assert_eq!(engine.stats().unwrap(), before);

    // Freed space is usable again
    engine
        .evict(&FileKey::new(
            FileType::Asset,
            Guid::from_bytes([2]),
            ContentHash::from_bytes([0]),
        ))
        .unwrap();
    put(&engine, 3, 1).unwrap();
}

#[test]
fn test_best_fit_prefers_snug_block() {
    let engine = MembufEngine::new();
    engine
        .init(
            &CacheConfig::membuf()
                .with_page_sizes(10_000, 10_000)
                .with_min_free_block_size(16)
                .with_fit_policy(FitPolicy::BestFit),
        )
        .unwrap();

    // Layout: [a 3000][b 1000][c 1000][d 1000][rest 4000]
    for (n, len) in [(1u8, 3000usize), (2, 1000), (3, 1000), (4, 1000)] {
        put(&engine, n, len).unwrap();
    }
    for n in [1u8, 3] {
        engine
            .evict(&FileKey::new(
                FileType::Asset,
                Guid::from_bytes([n]),
                ContentHash::from_bytes([0]),
            ))
            .unwrap();
    }

    // Free: 3000 at 0, 1000 at 4000, 4000 at 6000; 900 bytes fit best in the 1000 hole
    put(&engine, 5, 900).unwrap();
    let stats = engine.stats().unwrap();
    assert_eq!(stats.arena.largest_free_block, 4000);
    assert_eq!(stats.arena.free_block_count, 3);
    assert_eq!(stats.arena.free_size, 3000 + 100 + 4000);
}
