//! Semantic search and the daily brief
//!
//! Search embeds the query, over-fetches ANN candidates, then reranks with
//! exact cosine similarity blended with a small tier/confidence bias. The
//! bias is bounded so similarity always dominates: two records with equal
//! similarity sort by tier and confidence, but a clearly better match can
//! never be displaced by tier alone.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::debug;

use crate::embedding::{Embedder, cosine_similarity};
use crate::error::{EngramError, Result};
use crate::memory::types::{MemoryRecord, Tier};
use crate::storage::{LanceStore, RecordFilter};

/// Maximum fraction the tier/confidence bias can move a score
const BIAS_SPAN: f32 = 0.10;
/// Tier weight within the bias blend
const TIER_WEIGHT: f32 = 0.7;
/// Confidence weight within the bias blend
const CONFIDENCE_WEIGHT: f32 = 0.3;
/// ANN over-fetch factor before the exact rerank
const CANDIDATE_MULTIPLIER: usize = 3;

/// Maximum items a daily brief returns
pub const BRIEF_CAP: usize = 20;

/// A search hit with its ranking components
#[derive(Debug, Clone, Serialize)]
pub struct RankedRecord {
    #[serde(flatten)]
    pub record: MemoryRecord,
    /// Exact cosine similarity to the query
    pub similarity: f32,
    /// Final composite score used for ordering
    pub score: f32,
}

/// Composite score: similarity scaled by a bounded tier/confidence bias
pub fn composite_score(similarity: f32, tier: Tier, confidence: f32) -> f32 {
    let bias = TIER_WEIGHT * tier.rank() + CONFIDENCE_WEIGHT * confidence;
    similarity * ((1.0 - BIAS_SPAN) + BIAS_SPAN * bias)
}

/// Semantic search over embedded, non-forgotten records.
///
/// Every returned record is touched: access_count incremented and
/// last_used_at refreshed, which is what ultimately drives promotion.
pub async fn search(
    store: &LanceStore,
    embedder: Arc<dyn Embedder>,
    query: &str,
    filter: RecordFilter,
    k: usize,
) -> Result<Vec<RankedRecord>> {
    if query.trim().is_empty() {
        return Err(EngramError::Validation("query must not be empty".to_string()));
    }
    if k == 0 {
        return Err(EngramError::Validation("k must be positive".to_string()));
    }

    let query_text = query.to_string();
    let query_embedding = tokio::task::spawn_blocking(move || embedder.embed(&query_text))
        .await
        .map_err(|e| EngramError::Embedding(format!("Embedding task failed: {e}")))??;

    let filter = RecordFilter {
        only_embedded: true,
        ..filter
    };

    let candidates = store
        .search_embedded(&query_embedding, &filter, k * CANDIDATE_MULTIPLIER)
        .await?;

    debug!(
        candidates = candidates.len(),
        k, "Reranking search candidates"
    );

    let mut ranked: Vec<RankedRecord> = candidates
        .into_iter()
        .filter_map(|record| {
            let similarity = record
                .embedding
                .as_ref()
                .map(|e| cosine_similarity(&query_embedding, e))?;
            let score = composite_score(similarity, record.tier, record.confidence);
            Some(RankedRecord {
                record,
                similarity,
                score,
            })
        })
        .collect();

    ranked.sort_by(|a, b| b.score.total_cmp(&a.score));
    ranked.truncate(k);

    let now = Utc::now();
    for hit in &ranked {
        store.touch(hit.record.id, now).await?;
    }

    Ok(ranked)
}

/// An item in the daily brief
#[derive(Debug, Clone, Serialize)]
pub struct BriefItem {
    #[serde(flatten)]
    pub record: MemoryRecord,
    /// Recency/confidence blend used for ordering
    pub relevance: f32,
}

fn brief_relevance(record: &MemoryRecord, now: DateTime<Utc>, window: Duration) -> f32 {
    let freshest = record.last_used_at.max(record.created_at);
    let age = (now - freshest).num_seconds().max(0) as f32;
    let span = window.num_seconds().max(1) as f32;
    let recency = (1.0 - age / span).clamp(0.0, 1.0);
    0.6 * recency + 0.4 * record.confidence
}

/// Digest of recent activity: records created or used within the window,
/// excluding session-tier scratch and forgotten records. Does not count as
/// access, so browsing the brief never drives promotion.
pub async fn daily_brief(
    store: &LanceStore,
    window_hours: u32,
    cap: usize,
) -> Result<Vec<BriefItem>> {
    if window_hours == 0 {
        return Err(EngramError::Validation(
            "brief window must be positive".to_string(),
        ));
    }

    let now = Utc::now();
    let window = Duration::hours(window_hours as i64);
    let cutoff = now - window;

    let filter = RecordFilter::new()
        .with_tiers(vec![
            Tier::ShortTerm,
            Tier::MediumTerm,
            Tier::LongTerm,
            Tier::Permanent,
        ])
        .active_since(cutoff);

    // Bounded scan; the window keeps the candidate set small in practice
    let candidates = store.list_filtered(&filter, 1000, 0).await?;

    let mut items: Vec<BriefItem> = candidates
        .into_iter()
        .map(|record| {
            let relevance = brief_relevance(&record, now, window);
            BriefItem { record, relevance }
        })
        .collect();

    items.sort_by(|a, b| {
        b.relevance
            .total_cmp(&a.relevance)
            .then_with(|| b.record.tier.rank().total_cmp(&a.record.tier.rank()))
    });
    items.truncate(cap.min(BRIEF_CAP));

    Ok(items)
}
