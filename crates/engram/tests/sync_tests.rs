//! Integration tests for dual-write sync

use std::sync::Arc;
use std::time::Duration;

use engram::memory::types::{RecordType, Tier};
use engram::storage::{LanceStore, RecordFilter};
use engram::sync::{EntityRow, ImportanceClass, PreferenceRow, SyncBridge};
use engram::testing::test_embedder;
use tempfile::tempdir;

async fn create_bridge() -> (Arc<LanceStore>, SyncBridge, tempfile::TempDir) {
    let dir = tempdir().unwrap();
    let store = engram::testing::open_test_store(dir.path()).await.unwrap();
    let bridge = SyncBridge::new(
        Arc::clone(&store),
        test_embedder(),
        Duration::from_secs(5),
    );
    (store, bridge, dir)
}

#[tokio::test]
async fn test_preference_write_creates_row_and_mirror() {
    let (store, bridge, _dir) = create_bridge().await;

    let row = PreferenceRow::new(
        "editor.theme".to_string(),
        "dark".to_string(),
        ImportanceClass::Explicit,
    );
    let stored = bridge.write_preference(&row).await.unwrap();

    let mirror_id = stored.memory_block_id.expect("mirror id recorded");
    let mirror = store.get(mirror_id).await.unwrap().expect("mirror exists");

    assert_eq!(mirror.record_type, RecordType::Preference);
    assert_eq!(mirror.title, "editor.theme");
    assert_eq!(mirror.content, "editor.theme: dark");
    assert_eq!(mirror.origin.as_deref(), Some(stored.origin_key().as_str()));
    assert_eq!(mirror.lineage, vec![stored.origin_key()]);
    // explicit importance pins into the permanent tier
    assert_eq!(mirror.tier, Tier::Permanent);
    assert!(mirror.pinned);
    assert!(mirror.embedding.is_some());

    let aux = store.get_preference(row.id).await.unwrap().unwrap();
    assert_eq!(aux.memory_block_id, Some(mirror_id));
}

#[tokio::test]
async fn test_entity_write_creates_row_and_mirror() {
    let (store, bridge, _dir) = create_bridge().await;

    let row = EntityRow::new(
        "Acme".to_string(),
        "company".to_string(),
        "Primary client since 2023".to_string(),
        ImportanceClass::Learned,
    );
    let stored = bridge.write_entity(&row).await.unwrap();

    let mirror = store
        .get(stored.memory_block_id.unwrap())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(mirror.record_type, RecordType::Entity);
    assert_eq!(mirror.content, "Acme (company): Primary client since 2023");
    assert_eq!(mirror.tier, Tier::LongTerm);
    assert!(!mirror.pinned);
}

#[tokio::test]
async fn test_rewrite_upserts_mirror_preserving_id() {
    let (store, bridge, _dir) = create_bridge().await;

    let mut row = PreferenceRow::new(
        "lang".to_string(),
        "rust".to_string(),
        ImportanceClass::Learned,
    );
    let first = bridge.write_preference(&row).await.unwrap();
    let first_mirror = store
        .get(first.memory_block_id.unwrap())
        .await
        .unwrap()
        .unwrap();

    row.value = "zig".to_string();
    let second = bridge.write_preference(&row).await.unwrap();

    // same mirror record, new content; no duplicate for the origin
    assert_eq!(second.memory_block_id, first.memory_block_id);

    let second_mirror = store
        .get(second.memory_block_id.unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(second_mirror.content, "lang: zig");
    assert_eq!(second_mirror.created_at, first_mirror.created_at);

    let mirrors = store
        .list_filtered(
            &RecordFilter::new().with_origin(row.origin_key()),
            10,
            0,
        )
        .await
        .unwrap();
    assert_eq!(mirrors.len(), 1);
}

#[tokio::test]
async fn test_mirror_is_searchable() {
    let (store, bridge, _dir) = create_bridge().await;

    let row = PreferenceRow::new(
        "notifications".to_string(),
        "muted after 18:00".to_string(),
        ImportanceClass::Explicit,
    );
    bridge.write_preference(&row).await.unwrap();

    let hits = engram::memory::retrieval::search(
        &store,
        test_embedder(),
        "notifications: muted after 18:00",
        RecordFilter::new(),
        5,
    )
    .await
    .unwrap();

    assert!(!hits.is_empty());
    assert_eq!(hits[0].record.record_type, RecordType::Preference);
}

#[tokio::test]
async fn test_observed_importance_starts_short_term_unpinned() {
    let (store, bridge, _dir) = create_bridge().await;

    let row = EntityRow::new(
        "cafe".to_string(),
        "place".to_string(),
        "Mentioned once in passing".to_string(),
        ImportanceClass::Observed,
    );
    let stored = bridge.write_entity(&row).await.unwrap();

    let mirror = store
        .get(stored.memory_block_id.unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(mirror.tier, Tier::ShortTerm);
    assert!(!mirror.pinned);
}
