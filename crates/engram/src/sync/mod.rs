//! Dual-write sync of auxiliary tables into the memory store
//!
//! Preferences and entities live in their own structured tables but are also
//! mirrored as memory records so semantic search sees them. The mirror is
//! written first; if either write fails the whole operation fails, so the
//! caller never observes an aux row without its mirror.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::embedding::{Embedder, embed_with_timeout};
use crate::error::Result;
use crate::memory::types::{MemoryRecord, RecordType, Tier};
use crate::storage::LanceStore;

/// How strongly a preference or entity should be retained
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportanceClass {
    /// Built-in, must never age out
    System,
    /// Stated directly by the user
    Explicit,
    /// Derived from repeated behavior
    Learned,
    /// Guessed from indirect signals
    Inferred,
    /// Seen once, unconfirmed
    Observed,
}

impl ImportanceClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImportanceClass::System => "system",
            ImportanceClass::Explicit => "explicit",
            ImportanceClass::Learned => "learned",
            ImportanceClass::Inferred => "inferred",
            ImportanceClass::Observed => "observed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "system" => Some(ImportanceClass::System),
            "explicit" => Some(ImportanceClass::Explicit),
            "learned" => Some(ImportanceClass::Learned),
            "inferred" => Some(ImportanceClass::Inferred),
            "observed" => Some(ImportanceClass::Observed),
            _ => None,
        }
    }

    /// Tier the mirror record starts in
    pub fn tier(&self) -> Tier {
        match self {
            ImportanceClass::System | ImportanceClass::Explicit => Tier::Permanent,
            ImportanceClass::Learned => Tier::LongTerm,
            ImportanceClass::Inferred => Tier::MediumTerm,
            ImportanceClass::Observed => Tier::ShortTerm,
        }
    }

    /// Whether the mirror record is pinned against eviction
    pub fn pinned(&self) -> bool {
        matches!(self, ImportanceClass::System | ImportanceClass::Explicit)
    }
}

/// A row in the structured preferences table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreferenceRow {
    pub id: Uuid,
    pub key: String,
    pub value: String,
    pub importance: ImportanceClass,
    pub updated_at: DateTime<Utc>,
    /// Id of the mirror memory record, once written
    pub memory_block_id: Option<Uuid>,
}

impl PreferenceRow {
    pub fn new(key: String, value: String, importance: ImportanceClass) -> Self {
        Self {
            id: Uuid::new_v4(),
            key,
            value,
            importance,
            updated_at: Utc::now(),
            memory_block_id: None,
        }
    }

    pub fn origin_key(&self) -> String {
        format!("preference:{}", self.id)
    }
}

/// A row in the structured entities table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityRow {
    pub id: Uuid,
    pub name: String,
    pub kind: String,
    pub description: String,
    pub importance: ImportanceClass,
    pub updated_at: DateTime<Utc>,
    /// Id of the mirror memory record, once written
    pub memory_block_id: Option<Uuid>,
}

impl EntityRow {
    pub fn new(name: String, kind: String, description: String, importance: ImportanceClass) -> Self {
        Self {
            id: Uuid::new_v4(),
            name,
            kind,
            description,
            importance,
            updated_at: Utc::now(),
            memory_block_id: None,
        }
    }

    pub fn origin_key(&self) -> String {
        format!("entity:{}", self.id)
    }
}

/// Writes aux rows and their memory mirrors as one logical operation
pub struct SyncBridge {
    store: Arc<LanceStore>,
    embedder: Arc<dyn Embedder>,
    embed_timeout: Duration,
}

impl SyncBridge {
    pub fn new(store: Arc<LanceStore>, embedder: Arc<dyn Embedder>, embed_timeout: Duration) -> Self {
        Self {
            store,
            embedder,
            embed_timeout,
        }
    }

    /// Write a preference and its mirror. Repeated writes for the same row id
    /// upsert both sides, last writer wins.
    pub async fn write_preference(&self, row: &PreferenceRow) -> Result<PreferenceRow> {
        let content = format!("{}: {}", row.key, row.value);
        let mirror_id = self
            .write_mirror(
                &row.origin_key(),
                row.key.clone(),
                content,
                RecordType::Preference,
                row.importance,
            )
            .await?;

        let mut stored = row.clone();
        stored.memory_block_id = Some(mirror_id);
        self.store.upsert_preference(&stored).await?;

        debug!(preference = %row.id, mirror = %mirror_id, "Synced preference");
        Ok(stored)
    }

    /// Write an entity and its mirror. Same upsert semantics as preferences.
    pub async fn write_entity(&self, row: &EntityRow) -> Result<EntityRow> {
        let content = format!("{} ({}): {}", row.name, row.kind, row.description);
        let mirror_id = self
            .write_mirror(
                &row.origin_key(),
                row.name.clone(),
                content,
                RecordType::Entity,
                row.importance,
            )
            .await?;

        let mut stored = row.clone();
        stored.memory_block_id = Some(mirror_id);
        self.store.upsert_entity(&stored).await?;

        debug!(entity = %row.id, mirror = %mirror_id, "Synced entity");
        Ok(stored)
    }

    /// Upsert the mirror record keyed by origin. An existing mirror keeps its
    /// id and created_at so references and history survive rewrites.
    async fn write_mirror(
        &self,
        origin: &str,
        title: String,
        content: String,
        record_type: RecordType,
        importance: ImportanceClass,
    ) -> Result<Uuid> {
        let embedding = embed_with_timeout(
            Arc::clone(&self.embedder),
            content.clone(),
            self.embed_timeout,
        )
        .await;

        let existing = self.store.get_by_origin(origin).await?;

        let mut record = MemoryRecord::new(title, content, record_type);
        record.tier = importance.tier();
        record.pinned = importance.pinned();
        record.origin = Some(origin.to_string());
        record.lineage = vec![origin.to_string()];
        record.embedding = embedding;

        match existing {
            Some(previous) => {
                record.id = previous.id;
                record.created_at = previous.created_at;
                self.store.replace(&record).await?;
            }
            None => {
                self.store.insert(&record).await?;
            }
        }

        Ok(record.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_importance_tier_mapping() {
        assert_eq!(ImportanceClass::System.tier(), Tier::Permanent);
        assert_eq!(ImportanceClass::Explicit.tier(), Tier::Permanent);
        assert_eq!(ImportanceClass::Learned.tier(), Tier::LongTerm);
        assert_eq!(ImportanceClass::Inferred.tier(), Tier::MediumTerm);
        assert_eq!(ImportanceClass::Observed.tier(), Tier::ShortTerm);
    }

    #[test]
    fn test_only_strong_importance_pins() {
        assert!(ImportanceClass::System.pinned());
        assert!(ImportanceClass::Explicit.pinned());
        assert!(!ImportanceClass::Learned.pinned());
        assert!(!ImportanceClass::Inferred.pinned());
        assert!(!ImportanceClass::Observed.pinned());
    }

    #[test]
    fn test_origin_keys_are_namespaced() {
        let pref = PreferenceRow::new("theme".into(), "dark".into(), ImportanceClass::Explicit);
        assert!(pref.origin_key().starts_with("preference:"));

        let entity = EntityRow::new(
            "acme".into(),
            "company".into(),
            "Client".into(),
            ImportanceClass::Learned,
        );
        assert!(entity.origin_key().starts_with("entity:"));
    }

    #[test]
    fn test_importance_parse_roundtrip() {
        for class in [
            ImportanceClass::System,
            ImportanceClass::Explicit,
            ImportanceClass::Learned,
            ImportanceClass::Inferred,
            ImportanceClass::Observed,
        ] {
            assert_eq!(ImportanceClass::parse(class.as_str()), Some(class));
        }
        assert_eq!(ImportanceClass::parse("critical"), None);
    }
}
