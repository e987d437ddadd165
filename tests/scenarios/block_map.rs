//! Block-map contract scenarios: mapping idempotence, leaf allocation
//! reporting, and pool fairness at the public surface.

use std::sync::Arc;
use std::time::Duration;

use quarry_block::forest::{Forest, ForestConfig};
use quarry_block::journal::FakeJournal;
use quarry_block::slab::FakeDepot;
use quarry_block::store::MemoryStore;
use quarry_block::{
    BlockLayer, BlockMapEntry, BlockMapState, DataVioPool, ReadOnlyNotifier,
};
use quarry_block::logical::ReadOutcome;

fn block_layer() -> Arc<BlockLayer> {
    let store = Arc::new(MemoryStore::new());
    let journal = Arc::new(FakeJournal::new(32));
    let depot = Arc::new(FakeDepot::new(1000, 1_000_000));
    let read_only = Arc::new(ReadOnlyNotifier::new());
    let forest = Arc::new(Forest::new(
        ForestConfig {
            nonce: 0xcafe,
            root_count: 4,
            root_origin: 8,
            physical_blocks: 1 << 30,
            era_period: 32,
        },
        store as _,
        journal as _,
        Arc::clone(&depot) as _,
        Arc::clone(&read_only),
    ));
    let pool = DataVioPool::new(16, 0);
    Arc::new(BlockLayer::new(forest, depot as _, pool, read_only))
}

#[tokio::test]
async fn write_then_read_is_idempotent() {
    let layer = block_layer();
    layer.write_block(1234, &[1u8; 4096]).await.unwrap();
    let first = match layer.read_block(1234).await.unwrap() {
        ReadOutcome::Mapped(entry) => entry,
        other => panic!("expected mapping, got {other:?}"),
    };
    assert_eq!(first.state, BlockMapState::Uncompressed);

    // Reading again returns the same mapping.
    match layer.read_block(1234).await.unwrap() {
        ReadOutcome::Mapped(entry) => assert_eq!(entry, first),
        other => panic!("expected mapping, got {other:?}"),
    }

    // Unmapping reads back as unmapped.
    layer.discard_block(1234).await.unwrap();
    assert_eq!(layer.read_block(1234).await.unwrap(), ReadOutcome::Unmapped);
}

#[tokio::test]
async fn leaf_pbn_reported_iff_allocated() {
    let layer = block_layer();
    let forest = layer.forest();

    // Before any write along this path there is no leaf.
    assert_eq!(forest.find_block_map_page_pbn(50_000).await.unwrap(), None);

    let lbns = [0u64, 811, 812, 50_000, 812 * 812 + 17];
    for &lbn in &lbns {
        layer.write_block(lbn, &[9u8; 4096]).await.unwrap();
    }
    for &lbn in &lbns {
        assert!(
            forest.find_block_map_page_pbn(lbn).await.unwrap().is_some(),
            "leaf for {lbn} was allocated along the way"
        );
    }
    // A neighbour sharing the leaf reports the same page without
    // allocating anything new.
    assert_eq!(
        forest.find_block_map_page_pbn(0).await.unwrap(),
        forest.find_block_map_page_pbn(811).await.unwrap()
    );
    // An untouched subtree still has none.
    assert_eq!(
        forest.find_block_map_page_pbn(812 * 812 * 400).await.unwrap(),
        None
    );
}

#[tokio::test]
async fn mappings_survive_writeback_and_reload() {
    let store = Arc::new(MemoryStore::new());
    let journal = Arc::new(FakeJournal::new(32));
    let depot = Arc::new(FakeDepot::new(1000, 1_000_000));
    let read_only = Arc::new(ReadOnlyNotifier::new());
    let config = ForestConfig {
        nonce: 0xcafe,
        root_count: 2,
        root_origin: 8,
        physical_blocks: 1 << 30,
        era_period: 32,
    };
    let forest = Forest::new(
        config,
        Arc::clone(&store) as _,
        journal as _,
        depot as _,
        read_only,
    );
    let entry = BlockMapEntry::new(7777, BlockMapState::Uncompressed).unwrap();
    forest.update(99, entry).await.unwrap();
    forest.flush_all().await.unwrap();

    let journal2 = Arc::new(FakeJournal::new(32));
    let depot2 = Arc::new(FakeDepot::new(500_000, 1_000_000));
    let reloaded = Forest::new(
        config,
        store as _,
        journal2 as _,
        depot2 as _,
        Arc::new(ReadOnlyNotifier::new()),
    );
    reloaded.load_roots().await.unwrap();
    assert_eq!(reloaded.lookup(99).await.unwrap(), entry);
}

#[tokio::test]
async fn pool_serves_same_limiter_in_arrival_order() {
    let pool = DataVioPool::new(1, 1);
    let held = pool.acquire(false).await;

    let pool_first = Arc::clone(&pool);
    let first = tokio::spawn(async move {
        let vio = pool_first.acquire(false).await;
        let at = std::time::Instant::now();
        pool_first.release(vio);
        at
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    let pool_second = Arc::clone(&pool);
    let second = tokio::spawn(async move {
        let vio = pool_second.acquire(false).await;
        let at = std::time::Instant::now();
        pool_second.release(vio);
        at
    });
    tokio::time::sleep(Duration::from_millis(10)).await;

    pool.release(held);
    let first_served = first.await.unwrap();
    let second_served = second.await.unwrap();
    assert!(first_served <= second_served, "wakeups follow arrival order");
}
