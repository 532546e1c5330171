//! Shared helpers for integration tests
//!
//! All helpers use the deterministic hash embedder with a small dimension so
//! tests run without a model download and similarity is reproducible.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use crate::api::AppState;
use crate::config::{BriefConfig, RetentionConfig};
use crate::embedding::{Embedder, HashEmbedder};
use crate::error::Result;
use crate::maintenance::{MaintenanceRunner, RetentionPolicy};
use crate::memory::types::{MemoryRecord, RecordType, Tier};
use crate::storage::{LanceStore, TtlCache};

/// Embedding dimension used by every test helper
pub const TEST_DIMENSION: usize = 16;

/// Open a fresh store in the given directory with all tables created
pub async fn open_test_store(dir: &Path) -> Result<Arc<LanceStore>> {
    let mut store = LanceStore::connect(dir, TEST_DIMENSION).await?;
    store.ensure_tables().await?;
    Ok(Arc::new(store))
}

pub fn test_embedder() -> Arc<dyn Embedder> {
    Arc::new(HashEmbedder::new(TEST_DIMENSION))
}

/// A record with an embedding already attached, ready to insert
pub fn embedded_record(title: &str, content: &str, tier: Tier) -> MemoryRecord {
    let embedder = HashEmbedder::new(TEST_DIMENSION);
    let mut record = MemoryRecord::new(
        title.to_string(),
        content.to_string(),
        RecordType::Fact,
    );
    record.tier = tier;
    record.embedding = embedder.embed(content).ok();
    record
}

/// Full application state over the given store, suitable for router tests.
/// Auth is enabled when `auth_token` is non-empty.
pub fn test_state(store: Arc<LanceStore>, auth_token: &str) -> AppState {
    let policy = RetentionPolicy::from_config(&RetentionConfig::default());
    let runner = Arc::new(MaintenanceRunner::new(Arc::clone(&store), policy));

    AppState {
        store,
        embedder: test_embedder(),
        cache: Arc::new(TtlCache::new(Duration::from_secs(30))),
        runner,
        maintenance_guard: Arc::new(Mutex::new(())),
        auth_token: auth_token.to_string(),
        embed_timeout: Duration::from_secs(5),
        brief: BriefConfig::default(),
        record_summary: false,
    }
}
