//! Filter types for record queries
//!
//! Builds SQL WHERE clauses for LanceDB scans and vector searches. All
//! fields are optional; multiple filters combine with AND logic.

use chrono::{DateTime, Utc};

use crate::memory::types::{RecordType, Tier};

fn escape(s: &str) -> String {
    s.replace('\'', "''")
}

// Lance's filter planner does not coerce bare integer literals to timestamp
// columns; render cutoffs as typed timestamp literals instead.
fn timestamp_literal(ts: &DateTime<Utc>) -> String {
    format!("timestamp '{}'", ts.format("%Y-%m-%dT%H:%M:%S%.6f"))
}

/// Filter criteria for memory record queries.
#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
    /// Restrict to these tiers (OR within the list)
    pub tiers: Option<Vec<Tier>>,
    /// Restrict to these record types (OR within the list)
    pub record_types: Option<Vec<RecordType>>,
    /// Every listed tag must be present (AND across tags)
    pub tags: Option<Vec<String>>,
    /// Minimum confidence (inclusive)
    pub min_confidence: Option<f32>,
    /// Strict upper bound on confidence
    pub below_confidence: Option<f32>,
    /// Minimum access count (inclusive)
    pub min_access_count: Option<u32>,
    /// Filter on pin state
    pub pinned: Option<bool>,
    /// Include soft-forgotten records; off by default
    pub include_forgotten: bool,
    /// Only records that carry an embedding
    pub only_embedded: bool,
    /// Exact dual-write origin key
    pub origin: Option<String>,
    /// Both last_used_at and tier_changed_at strictly before this instant
    /// (equivalent to max(last_used_at, tier_changed_at) < cutoff)
    pub stale_before: Option<DateTime<Utc>>,
    /// last_used_at at or after this instant
    pub used_since: Option<DateTime<Utc>>,
    /// last_used_at or created_at at or after this instant
    pub active_since: Option<DateTime<Utc>>,
}

impl RecordFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tiers(mut self, tiers: Vec<Tier>) -> Self {
        self.tiers = Some(tiers);
        self
    }

    pub fn with_record_types(mut self, types: Vec<RecordType>) -> Self {
        self.record_types = Some(types);
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = Some(tags);
        self
    }

    pub fn with_min_confidence(mut self, min: f32) -> Self {
        self.min_confidence = Some(min);
        self
    }

    pub fn with_below_confidence(mut self, below: f32) -> Self {
        self.below_confidence = Some(below);
        self
    }

    pub fn with_min_access_count(mut self, min: u32) -> Self {
        self.min_access_count = Some(min);
        self
    }

    pub fn with_pinned(mut self, pinned: bool) -> Self {
        self.pinned = Some(pinned);
        self
    }

    pub fn with_forgotten_included(mut self) -> Self {
        self.include_forgotten = true;
        self
    }

    pub fn embedded_only(mut self) -> Self {
        self.only_embedded = true;
        self
    }

    pub fn with_origin(mut self, origin: String) -> Self {
        self.origin = Some(origin);
        self
    }

    pub fn stale_before(mut self, cutoff: DateTime<Utc>) -> Self {
        self.stale_before = Some(cutoff);
        self
    }

    pub fn used_since(mut self, since: DateTime<Utc>) -> Self {
        self.used_since = Some(since);
        self
    }

    pub fn active_since(mut self, since: DateTime<Utc>) -> Self {
        self.active_since = Some(since);
        self
    }

    /// Build a SQL WHERE clause from this filter.
    /// Forgotten records are excluded unless explicitly included, so even a
    /// "default" filter produces a clause.
    pub fn to_sql_clause(&self) -> Option<String> {
        let mut conditions = Vec::new();

        if !self.include_forgotten {
            conditions.push("forgotten = false".to_string());
        }

        if let Some(ref tiers) = self.tiers {
            if !tiers.is_empty() {
                if tiers.len() == 1 {
                    conditions.push(format!("tier = '{}'", tiers[0].as_str()));
                } else {
                    let in_clause = tiers
                        .iter()
                        .map(|t| format!("'{}'", t.as_str()))
                        .collect::<Vec<_>>()
                        .join(", ");
                    conditions.push(format!("tier IN ({in_clause})"));
                }
            }
        }

        if let Some(ref types) = self.record_types {
            if !types.is_empty() {
                if types.len() == 1 {
                    conditions.push(format!("record_type = '{}'", types[0].as_str()));
                } else {
                    let in_clause = types
                        .iter()
                        .map(|t| format!("'{}'", t.as_str()))
                        .collect::<Vec<_>>()
                        .join(", ");
                    conditions.push(format!("record_type IN ({in_clause})"));
                }
            }
        }

        // Tags are stored comma-joined; substring match against the padded
        // form avoids matching "rust" inside "trust".
        if let Some(ref tags) = self.tags {
            for tag in tags {
                let pattern = escape(tag);
                conditions.push(format!("(',' || tags || ',') LIKE '%,{pattern},%'"));
            }
        }

        if let Some(min) = self.min_confidence {
            conditions.push(format!("confidence >= {min}"));
        }

        if let Some(below) = self.below_confidence {
            conditions.push(format!("confidence < {below}"));
        }

        if let Some(min) = self.min_access_count {
            conditions.push(format!("access_count >= {min}"));
        }

        if let Some(pinned) = self.pinned {
            conditions.push(format!("pinned = {pinned}"));
        }

        if self.only_embedded {
            conditions.push("has_embedding = true".to_string());
        }

        if let Some(ref origin) = self.origin {
            conditions.push(format!("origin = '{}'", escape(origin)));
        }

        if let Some(ref cutoff) = self.stale_before {
            let literal = timestamp_literal(cutoff);
            conditions.push(format!(
                "last_used_at < {literal} AND tier_changed_at < {literal}"
            ));
        }

        if let Some(ref since) = self.used_since {
            conditions.push(format!("last_used_at >= {}", timestamp_literal(since)));
        }

        if let Some(ref since) = self.active_since {
            let literal = timestamp_literal(since);
            conditions.push(format!(
                "(last_used_at >= {literal} OR created_at >= {literal})"
            ));
        }

        if conditions.is_empty() {
            None
        } else {
            Some(conditions.join(" AND "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter_excludes_forgotten() {
        let sql = RecordFilter::new().to_sql_clause().unwrap();
        assert_eq!(sql, "forgotten = false");
    }

    #[test]
    fn test_forgotten_included_filter_is_empty() {
        let filter = RecordFilter::new().with_forgotten_included();
        assert!(filter.to_sql_clause().is_none());
    }

    #[test]
    fn test_single_tier_filter() {
        let filter = RecordFilter::new().with_tiers(vec![Tier::Permanent]);
        let sql = filter.to_sql_clause().unwrap();
        assert!(sql.contains("tier = 'permanent'"));
    }

    #[test]
    fn test_multiple_tiers_filter() {
        let filter = RecordFilter::new().with_tiers(vec![Tier::Session, Tier::ShortTerm]);
        let sql = filter.to_sql_clause().unwrap();
        assert!(sql.contains("tier IN ('session', 'short_term')"));
    }

    #[test]
    fn test_record_type_filter() {
        let filter = RecordFilter::new()
            .with_record_types(vec![RecordType::Preference, RecordType::Entity]);
        let sql = filter.to_sql_clause().unwrap();
        assert!(sql.contains("record_type IN ('preference', 'entity')"));
    }

    #[test]
    fn test_tag_filter_is_anded_and_delimited() {
        let filter =
            RecordFilter::new().with_tags(vec!["rust".to_string(), "async".to_string()]);
        let sql = filter.to_sql_clause().unwrap();
        assert!(sql.contains("LIKE '%,rust,%'"));
        assert!(sql.contains("LIKE '%,async,%'"));
    }

    #[test]
    fn test_stale_before_covers_both_timestamps() {
        use chrono::TimeZone;
        let cutoff = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let sql = RecordFilter::new().stale_before(cutoff).to_sql_clause().unwrap();
        assert!(sql.contains("last_used_at < "));
        assert!(sql.contains("tier_changed_at < "));
    }

    #[test]
    fn test_confidence_band() {
        let sql = RecordFilter::new()
            .with_min_confidence(0.3)
            .with_below_confidence(0.9)
            .to_sql_clause()
            .unwrap();
        assert!(sql.contains("confidence >= 0.3"));
        assert!(sql.contains("confidence < 0.9"));
    }

    #[test]
    fn test_origin_filter_escapes_quotes() {
        let filter = RecordFilter::new().with_origin("preference:it's".to_string());
        let sql = filter.to_sql_clause().unwrap();
        assert!(sql.contains("origin = 'preference:it''s'"));
    }

    #[test]
    fn test_combined_filters_join_with_and() {
        let filter = RecordFilter::new()
            .with_tiers(vec![Tier::LongTerm])
            .with_pinned(false)
            .embedded_only();
        let sql = filter.to_sql_clause().unwrap();
        assert!(sql.contains("tier = 'long_term'"));
        assert!(sql.contains("pinned = false"));
        assert!(sql.contains("has_embedding = true"));
        assert!(sql.contains(" AND "));
    }
}
