//! Endpoint handlers

use std::sync::Arc;

use axum::Json;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use serde::Deserialize;
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use crate::embedding::embed_with_timeout;
use crate::error::{EngramError, Result};
use crate::memory::retrieval;
use crate::memory::tombstone::DeleteReason;
use crate::memory::types::{MemoryRecord, RecordType, Tier, validate_confidence};
use crate::storage::RecordFilter;

use super::AppState;

const SEARCH_CACHE_PREFIX: &str = "search:";
const BRIEF_CACHE_PREFIX: &str = "brief:";

fn invalidate_reads(state: &AppState) {
    state.cache.invalidate_prefix(SEARCH_CACHE_PREFIX);
    state.cache.invalidate_prefix(BRIEF_CACHE_PREFIX);
}

#[derive(Debug, Deserialize)]
pub struct AddRequest {
    pub title: String,
    pub content: String,
    #[serde(rename = "type")]
    pub record_type: String,
    pub tier: Option<String>,
    pub confidence: Option<f32>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub source: Vec<String>,
    #[serde(default)]
    pub meta: serde_json::Map<String, serde_json::Value>,
    /// Skip synchronous embedding when false; the record lands degraded
    #[serde(default = "default_embed")]
    pub embed: bool,
}

fn default_embed() -> bool {
    true
}

/// POST /memory/add
///
/// Persists the record even when embedding fails or times out; the response
/// reports degraded mode so the caller knows search will not find it.
pub async fn add(
    State(state): State<AppState>,
    Json(request): Json<AddRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>)> {
    if request.title.trim().is_empty() {
        return Err(EngramError::Validation("title must not be empty".to_string()));
    }
    if request.content.trim().is_empty() {
        return Err(EngramError::Validation("content must not be empty".to_string()));
    }
    // commas are the list delimiter in storage and in query parameters
    for value in request.tags.iter().chain(request.source.iter()) {
        if value.contains(',') {
            return Err(EngramError::Validation(format!(
                "tag and source values must not contain commas: {value:?}"
            )));
        }
    }

    let record_type = RecordType::parse(&request.record_type)?;
    let tier = match request.tier.as_deref() {
        Some(raw) => Tier::parse(raw)?,
        None => Tier::ShortTerm,
    };
    let confidence = match request.confidence {
        Some(value) => validate_confidence(value)?,
        None => 1.0,
    };

    let embedding = if request.embed {
        embed_with_timeout(
            Arc::clone(&state.embedder),
            request.content.clone(),
            state.embed_timeout,
        )
        .await
    } else {
        None
    };
    let degraded = embedding.is_none();

    let mut record = MemoryRecord::new(request.title, request.content, record_type);
    record.tier = tier;
    record.confidence = confidence;
    record.tags = request.tags;
    record.source = request.source;
    record.meta = request.meta;
    record.embedding = embedding;

    state.store.insert(&record).await?;
    invalidate_reads(&state);

    info!(id = %record.id, tier = tier.as_str(), degraded, "Added memory record");

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "id": record.id,
            "tier": tier.as_str(),
            "confidence": confidence,
            "degraded": degraded,
        })),
    ))
}

#[derive(Debug, Deserialize)]
pub struct SearchParams {
    pub q: String,
    pub k: Option<i64>,
    /// Comma-separated tier names
    pub tiers: Option<String>,
    /// Comma-separated record types
    pub types: Option<String>,
    /// Comma-separated tags, all required
    pub tags: Option<String>,
    pub min_confidence: Option<f32>,
}

fn split_csv(raw: &str) -> Vec<&str> {
    raw.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .collect()
}

/// GET /memory/search
pub async fn search(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> Result<Json<serde_json::Value>> {
    let k = params.k.unwrap_or(10);
    if k <= 0 {
        return Err(EngramError::Validation("k must be positive".to_string()));
    }
    let k = k as usize;

    // JSON-encoded key: components stay unambiguous even when a query or
    // tag contains the character another field would be joined with
    let cache_key = format!(
        "{SEARCH_CACHE_PREFIX}{}",
        json!([
            &params.q,
            k,
            &params.tiers,
            &params.types,
            &params.tags,
            params.min_confidence,
        ])
    );
    if let Some(cached) = state.cache.get(&cache_key) {
        // a cached answer still counts as access for the listed records
        let now = chrono::Utc::now();
        if let Some(ids) = cached.get("ids").and_then(|v| v.as_array()) {
            for id in ids {
                if let Some(id) = id.as_str().and_then(|s| Uuid::parse_str(s).ok()) {
                    state.store.touch(id, now).await?;
                }
            }
        }
        if let Some(body) = cached.get("body") {
            return Ok(Json(body.clone()));
        }
    }

    let mut filter = RecordFilter::new();
    if let Some(raw) = params.tiers.as_deref() {
        let tiers = split_csv(raw)
            .into_iter()
            .map(Tier::parse)
            .collect::<Result<Vec<_>>>()?;
        filter = filter.with_tiers(tiers);
    }
    if let Some(raw) = params.types.as_deref() {
        let types = split_csv(raw)
            .into_iter()
            .map(RecordType::parse)
            .collect::<Result<Vec<_>>>()?;
        filter = filter.with_record_types(types);
    }
    if let Some(raw) = params.tags.as_deref() {
        let tags = split_csv(raw).into_iter().map(str::to_string).collect();
        filter = filter.with_tags(tags);
    }
    if let Some(min) = params.min_confidence {
        filter = filter.with_min_confidence(validate_confidence(min)?);
    }

    let hits = retrieval::search(
        &state.store,
        Arc::clone(&state.embedder),
        &params.q,
        filter,
        k,
    )
    .await?;

    let hit_ids: Vec<Uuid> = hits.iter().map(|hit| hit.record.id).collect();
    let body = json!({
        "query": params.q,
        "count": hits.len(),
        "results": hits,
    });
    state.cache.put(cache_key, json!({"ids": hit_ids, "body": body}));

    Ok(Json(body))
}

#[derive(Debug, Deserialize)]
pub struct PinRequest {
    pub id: Uuid,
    pub pin: bool,
}

/// POST /memory/pin
pub async fn pin(
    State(state): State<AppState>,
    Json(request): Json<PinRequest>,
) -> Result<Json<serde_json::Value>> {
    let updated = state.store.update_pin(request.id, request.pin).await?;
    if !updated {
        return Err(EngramError::NotFound(format!("record {}", request.id)));
    }
    invalidate_reads(&state);

    Ok(Json(json!({
        "id": request.id,
        "pinned": request.pin,
    })))
}

#[derive(Debug, Deserialize)]
pub struct ForgetRequest {
    pub id: Uuid,
    pub reason: String,
}

/// POST /memory/forget
///
/// Session-tier records are hard-deleted with a tombstone; everything else
/// is soft-forgotten with the reason kept for audit, plus a demotion.
pub async fn forget(
    State(state): State<AppState>,
    Json(request): Json<ForgetRequest>,
) -> Result<Json<serde_json::Value>> {
    if request.reason.trim().is_empty() {
        return Err(EngramError::Validation("reason must not be empty".to_string()));
    }

    let record = state
        .store
        .get(request.id)
        .await?
        .ok_or_else(|| EngramError::NotFound(format!("record {}", request.id)))?;

    let deleted = if record.tier == Tier::Session {
        state
            .store
            .delete_with_tombstone(&record, DeleteReason::Forgotten, Some(request.reason.clone()))
            .await?;
        true
    } else {
        let demoted = record.tier.demoted().unwrap_or(record.tier);
        state
            .store
            .mark_forgotten(record.id, &request.reason, demoted, chrono::Utc::now())
            .await?;
        false
    };
    invalidate_reads(&state);

    info!(id = %request.id, deleted, "Forgot memory record");

    Ok(Json(json!({
        "id": request.id,
        "forgotten": true,
        "deleted": deleted,
    })))
}

#[derive(Debug, Deserialize)]
pub struct BriefParams {
    pub hours: Option<u32>,
}

/// GET /daily_brief
pub async fn daily_brief(
    State(state): State<AppState>,
    Query(params): Query<BriefParams>,
) -> Result<Json<serde_json::Value>> {
    let hours = params.hours.unwrap_or(state.brief.default_window_hours);

    let cache_key = format!("{BRIEF_CACHE_PREFIX}{hours}");
    if let Some(cached) = state.cache.get(&cache_key) {
        return Ok(Json(cached));
    }

    let items = retrieval::daily_brief(&state.store, hours, state.brief.max_items).await?;

    let body = json!({
        "window_hours": hours,
        "count": items.len(),
        "items": items,
    });
    state.cache.put(cache_key, body.clone());

    Ok(Json(body))
}

/// POST /memory/maintenance
///
/// Waits for the guard, so a manual run queues behind (never overlaps) a
/// scheduled one.
pub async fn maintenance(State(state): State<AppState>) -> Result<Json<serde_json::Value>> {
    let _permit = state.maintenance_guard.lock().await;

    let summary = state.runner.run().await?;
    if state.record_summary {
        state.runner.record_summary(&summary).await?;
    }
    state.cache.clear();

    Ok(Json(serde_json::to_value(&summary).map_err(|e| {
        EngramError::Serialization(e.to_string())
    })?))
}

/// GET /healthz
///
/// Unauthenticated liveness probe: verifies the store answers and reports
/// the embedder's availability without failing on it.
pub async fn healthz(State(state): State<AppState>) -> Result<Json<serde_json::Value>> {
    let records = state.store.total_count().await?;

    Ok(Json(json!({
        "status": "ok",
        "records": records,
        "embedder": {
            "name": state.embedder.name(),
            "available": state.embedder.is_available(),
        },
    })))
}
