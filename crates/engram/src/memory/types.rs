//! Core types for the Engram memory store
//!
//! Defines the canonical MemoryRecord entity and the closed sets used to
//! classify it: record types and retention tiers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{EngramError, Result};

/// A single record stored in the canonical memory table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRecord {
    /// Unique identifier, generated at creation, immutable
    pub id: Uuid,
    /// Short human-readable label
    pub title: String,
    /// The text that gets embedded for semantic search
    pub content: String,
    /// Classification of what kind of record this is
    pub record_type: RecordType,
    /// Retention tier; mutable through promotion/demotion
    pub tier: Tier,
    /// Secondary ranking signal in [0, 1]
    pub confidence: f32,
    /// Unordered tags used for filtering
    pub tags: Vec<String>,
    /// Ordered provenance strings, append-only in practice
    pub source: Vec<String>,
    /// Soft references to originating records (e.g. "preference:42")
    pub lineage: Vec<String>,
    /// Dual-write upsert key; set only on mirrored records
    pub origin: Option<String>,
    /// When true the record is exempt from eviction regardless of tier/age
    pub pinned: bool,
    /// Soft-delete marker set by Forget
    pub forgotten: bool,
    /// Auditable reason recorded by Forget
    pub forget_reason: Option<String>,
    /// Open key-value bag, opaque to the store's invariants
    pub meta: serde_json::Map<String, serde_json::Value>,
    /// When this record was created
    pub created_at: DateTime<Utc>,
    /// Updated on read-relevant access; basis for age-based eviction
    pub last_used_at: DateTime<Utc>,
    /// Updated on promotion/demotion; grants a grace period after tier moves
    pub tier_changed_at: DateTime<Utc>,
    /// How many times this record has been returned by Search
    pub access_count: u32,
    /// Embedding vector, present iff generation succeeded at write time
    pub embedding: Option<Vec<f32>>,
}

impl MemoryRecord {
    /// Create a new record with defaults: short_term tier, confidence 1.0
    pub fn new(title: String, content: String, record_type: RecordType) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            title,
            content,
            record_type,
            tier: Tier::ShortTerm,
            confidence: 1.0,
            tags: Vec::new(),
            source: Vec::new(),
            lineage: Vec::new(),
            origin: None,
            pinned: false,
            forgotten: false,
            forget_reason: None,
            meta: serde_json::Map::new(),
            created_at: now,
            last_used_at: now,
            tier_changed_at: now,
            access_count: 0,
            embedding: None,
        }
    }

    /// Age basis for retention decisions: the later of last use and the most
    /// recent tier change, so a freshly demoted record gets a grace period.
    pub fn retention_basis(&self) -> DateTime<Utc> {
        self.last_used_at.max(self.tier_changed_at)
    }
}

/// Closed set of record classifications
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordType {
    Fact,
    Event,
    Task,
    Preference,
    Insight,
    Entity,
    Conversation,
    Knowledge,
}

impl RecordType {
    pub const ALL: [RecordType; 8] = [
        RecordType::Fact,
        RecordType::Event,
        RecordType::Task,
        RecordType::Preference,
        RecordType::Insight,
        RecordType::Entity,
        RecordType::Conversation,
        RecordType::Knowledge,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RecordType::Fact => "fact",
            RecordType::Event => "event",
            RecordType::Task => "task",
            RecordType::Preference => "preference",
            RecordType::Insight => "insight",
            RecordType::Entity => "entity",
            RecordType::Conversation => "conversation",
            RecordType::Knowledge => "knowledge",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "fact" => Ok(RecordType::Fact),
            "event" => Ok(RecordType::Event),
            "task" => Ok(RecordType::Task),
            "preference" => Ok(RecordType::Preference),
            "insight" => Ok(RecordType::Insight),
            "entity" => Ok(RecordType::Entity),
            "conversation" => Ok(RecordType::Conversation),
            "knowledge" => Ok(RecordType::Knowledge),
            other => Err(EngramError::Validation(format!(
                "unknown record type: {other}"
            ))),
        }
    }
}

/// Retention tier controlling eviction policy and ranking bias
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Session,
    ShortTerm,
    MediumTerm,
    LongTerm,
    Permanent,
}

impl Tier {
    pub const ALL: [Tier; 5] = [
        Tier::Session,
        Tier::ShortTerm,
        Tier::MediumTerm,
        Tier::LongTerm,
        Tier::Permanent,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Session => "session",
            Tier::ShortTerm => "short_term",
            Tier::MediumTerm => "medium_term",
            Tier::LongTerm => "long_term",
            Tier::Permanent => "permanent",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "session" => Ok(Tier::Session),
            "short_term" => Ok(Tier::ShortTerm),
            "medium_term" => Ok(Tier::MediumTerm),
            "long_term" => Ok(Tier::LongTerm),
            "permanent" => Ok(Tier::Permanent),
            other => Err(EngramError::Validation(format!("unknown tier: {other}"))),
        }
    }

    /// Monotonic ranking weight in [0, 1] used as a small search bias
    pub fn rank(&self) -> f32 {
        match self {
            Tier::Session => 0.0,
            Tier::ShortTerm => 0.25,
            Tier::MediumTerm => 0.5,
            Tier::LongTerm => 0.75,
            Tier::Permanent => 1.0,
        }
    }

    /// The next tier down; `None` for the lowest
    pub fn demoted(&self) -> Option<Tier> {
        match self {
            Tier::Session => None,
            Tier::ShortTerm => Some(Tier::Session),
            Tier::MediumTerm => Some(Tier::ShortTerm),
            Tier::LongTerm => Some(Tier::MediumTerm),
            Tier::Permanent => Some(Tier::LongTerm),
        }
    }

    /// The next tier up, capped at long_term. Permanent is never reached by
    /// automatic promotion; it is only ever assigned explicitly.
    pub fn promoted(&self) -> Option<Tier> {
        match self {
            Tier::Session => Some(Tier::ShortTerm),
            Tier::ShortTerm => Some(Tier::MediumTerm),
            Tier::MediumTerm => Some(Tier::LongTerm),
            Tier::LongTerm | Tier::Permanent => None,
        }
    }
}

/// Validate a caller-supplied confidence value
pub fn validate_confidence(confidence: f32) -> Result<f32> {
    if !(0.0..=1.0).contains(&confidence) || confidence.is_nan() {
        return Err(EngramError::Validation(format!(
            "confidence must be in [0, 1], got {confidence}"
        )));
    }
    Ok(confidence)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_defaults() {
        let record = MemoryRecord::new(
            "title".to_string(),
            "content".to_string(),
            RecordType::Fact,
        );

        assert_eq!(record.tier, Tier::ShortTerm);
        assert_eq!(record.confidence, 1.0);
        assert!(!record.pinned);
        assert!(!record.forgotten);
        assert!(record.embedding.is_none());
        assert!(record.tags.is_empty());
        assert_eq!(record.access_count, 0);
    }

    #[test]
    fn test_record_serialization_roundtrip() {
        let mut record = MemoryRecord::new(
            "prefs".to_string(),
            "User prefers dark mode".to_string(),
            RecordType::Preference,
        );
        record.embedding = Some(vec![0.1; 8]);
        record.tags = vec!["ui".to_string()];

        let json = serde_json::to_string(&record).expect("serialize");
        let back: MemoryRecord = serde_json::from_str(&json).expect("deserialize");

        assert_eq!(back.id, record.id);
        assert_eq!(back.content, record.content);
        assert_eq!(back.tier, record.tier);
        assert_eq!(back.embedding, record.embedding);
    }

    #[test]
    fn test_tier_parse_roundtrip() {
        for tier in Tier::ALL {
            assert_eq!(Tier::parse(tier.as_str()).unwrap(), tier);
        }
        assert!(Tier::parse("hot").is_err());
    }

    #[test]
    fn test_record_type_parse_roundtrip() {
        for rt in RecordType::ALL {
            assert_eq!(RecordType::parse(rt.as_str()).unwrap(), rt);
        }
        assert!(RecordType::parse("episodic").is_err());
    }

    #[test]
    fn test_tier_rank_is_monotonic() {
        let ranks: Vec<f32> = Tier::ALL.iter().map(Tier::rank).collect();
        for pair in ranks.windows(2) {
            assert!(pair[0] < pair[1]);
        }
    }

    #[test]
    fn test_tier_promotion_caps_at_long_term() {
        assert_eq!(Tier::MediumTerm.promoted(), Some(Tier::LongTerm));
        assert_eq!(Tier::LongTerm.promoted(), None);
        assert_eq!(Tier::Permanent.promoted(), None);
    }

    #[test]
    fn test_validate_confidence() {
        assert!(validate_confidence(0.0).is_ok());
        assert!(validate_confidence(1.0).is_ok());
        assert!(validate_confidence(-0.1).is_err());
        assert!(validate_confidence(1.1).is_err());
        assert!(validate_confidence(f32::NAN).is_err());
    }

    #[test]
    fn test_retention_basis_uses_later_timestamp() {
        let mut record = MemoryRecord::new(
            "t".to_string(),
            "c".to_string(),
            RecordType::Fact,
        );
        record.last_used_at = Utc::now() - chrono::Duration::days(10);
        record.tier_changed_at = Utc::now();
        assert_eq!(record.retention_basis(), record.tier_changed_at);
    }
}
