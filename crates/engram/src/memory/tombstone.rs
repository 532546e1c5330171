//! Audit trail for hard-deleted records
//!
//! Every hard delete leaves a tombstone so that "no record is silently
//! resurrected" and every removal stays attributable to a policy or an
//! explicit caller action.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::memory::types::Tier;

/// Why a record was hard-deleted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeleteReason {
    /// Age exceeded the tier's retention window
    Expired,
    /// Confidence stayed below the low threshold past the early window
    LowConfidence,
    /// Explicit Forget on a session-tier record
    Forgotten,
    /// Dual-write mirror replaced by a newer write for the same origin
    MirrorSuperseded,
}

impl DeleteReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeleteReason::Expired => "expired",
            DeleteReason::LowConfidence => "low_confidence",
            DeleteReason::Forgotten => "forgotten",
            DeleteReason::MirrorSuperseded => "mirror_superseded",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "expired" => Some(DeleteReason::Expired),
            "low_confidence" => Some(DeleteReason::LowConfidence),
            "forgotten" => Some(DeleteReason::Forgotten),
            "mirror_superseded" => Some(DeleteReason::MirrorSuperseded),
            _ => None,
        }
    }
}

/// Audit record left behind by a hard delete
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tombstone {
    /// Id of the deleted record
    pub original_id: Uuid,
    /// Title of the deleted record, kept for human audit
    pub title: String,
    /// Tier the record was in when deleted
    pub tier: Tier,
    /// Why the record was deleted
    pub reason: DeleteReason,
    /// Free-form detail, e.g. the caller-supplied forget reason
    pub detail: Option<String>,
    /// When the delete happened
    pub deleted_at: DateTime<Utc>,
}

impl Tombstone {
    pub fn new(
        original_id: Uuid,
        title: String,
        tier: Tier,
        reason: DeleteReason,
        detail: Option<String>,
    ) -> Self {
        Self {
            original_id,
            title,
            tier,
            reason,
            detail,
            deleted_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_parse_roundtrip() {
        for reason in [
            DeleteReason::Expired,
            DeleteReason::LowConfidence,
            DeleteReason::Forgotten,
            DeleteReason::MirrorSuperseded,
        ] {
            assert_eq!(DeleteReason::parse(reason.as_str()), Some(reason));
        }
        assert_eq!(DeleteReason::parse("storage_pressure"), None);
    }

    #[test]
    fn test_tombstone_carries_detail() {
        let t = Tombstone::new(
            Uuid::new_v4(),
            "old note".to_string(),
            Tier::Session,
            DeleteReason::Forgotten,
            Some("user asked".to_string()),
        );
        assert_eq!(t.reason, DeleteReason::Forgotten);
        assert_eq!(t.detail.as_deref(), Some("user asked"));
    }
}
