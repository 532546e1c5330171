use std::path::Path;
use std::sync::Arc;

use arrow_array::{
    Array, BooleanArray, FixedSizeListArray, Float32Array, Int32Array, RecordBatch,
    RecordBatchIterator, StringArray, TimestampMicrosecondArray,
};
use arrow_schema::{DataType, Field, Schema, TimeUnit};
use chrono::{DateTime, TimeZone, Utc};
use futures::TryStreamExt;
use lancedb::Table;
use lancedb::connection::Connection;
use lancedb::index::Index;
use lancedb::index::vector::IvfPqIndexBuilder;
use lancedb::query::{ExecutableQuery, QueryBase};
use uuid::Uuid;

use crate::error::{EngramError, Result};
use crate::memory::tombstone::{DeleteReason, Tombstone};
use crate::memory::types::{MemoryRecord, RecordType, Tier};
use crate::storage::filter::RecordFilter;
use crate::sync::{EntityRow, ImportanceClass, PreferenceRow};

const MEMORIES_TABLE: &str = "memories";
const TOMBSTONES_TABLE: &str = "tombstones";
const PREFERENCES_TABLE: &str = "preferences";
const ENTITIES_TABLE: &str = "entities";

// IVF-PQ needs at least this many rows for training
const VECTOR_INDEX_MIN_ROWS: usize = 256;

fn escape(s: &str) -> String {
    s.replace('\'', "''")
}

fn join_list(items: &[String]) -> String {
    items.join(",")
}

fn split_list(s: &str) -> Vec<String> {
    if s.is_empty() {
        Vec::new()
    } else {
        s.split(',').map(|p| p.to_string()).collect()
    }
}

/// Durable storage for memory records plus a similarity index over their
/// embedding vectors. Owns the canonical data; also holds the tombstone
/// audit table and the auxiliary preference/entity tables that feed the
/// dual-write sync.
pub struct LanceStore {
    connection: Connection,
    dimension: i32,
    memories_table: Option<Table>,
    tombstones_table: Option<Table>,
    preferences_table: Option<Table>,
    entities_table: Option<Table>,
}

impl LanceStore {
    pub async fn connect(path: &Path, dimension: usize) -> Result<Self> {
        let uri = path
            .to_str()
            .ok_or_else(|| EngramError::Storage("Invalid path encoding".to_string()))?;

        let connection = lancedb::connect(uri)
            .execute()
            .await
            .map_err(|e| EngramError::Storage(format!("Failed to connect to LanceDB: {e}")))?;

        Ok(Self {
            connection,
            dimension: dimension as i32,
            memories_table: None,
            tombstones_table: None,
            preferences_table: None,
            entities_table: None,
        })
    }

    pub fn dimension(&self) -> usize {
        self.dimension as usize
    }

    fn memories_schema(&self) -> Arc<Schema> {
        Arc::new(Schema::new(vec![
            Field::new("id", DataType::Utf8, false),
            Field::new("title", DataType::Utf8, false),
            Field::new("content", DataType::Utf8, false),
            Field::new("record_type", DataType::Utf8, false),
            Field::new("tier", DataType::Utf8, false),
            Field::new("confidence", DataType::Float32, false),
            Field::new("tags", DataType::Utf8, false),
            Field::new("source", DataType::Utf8, false),
            Field::new("lineage", DataType::Utf8, false),
            Field::new("origin", DataType::Utf8, true),
            Field::new("pinned", DataType::Boolean, false),
            Field::new("forgotten", DataType::Boolean, false),
            Field::new("forget_reason", DataType::Utf8, true),
            Field::new("meta", DataType::Utf8, false),
            Field::new(
                "created_at",
                DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into())),
                false,
            ),
            Field::new(
                "last_used_at",
                DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into())),
                false,
            ),
            Field::new(
                "tier_changed_at",
                DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into())),
                false,
            ),
            Field::new("access_count", DataType::Int32, false),
            Field::new("has_embedding", DataType::Boolean, false),
            Field::new(
                "embedding",
                DataType::FixedSizeList(
                    Arc::new(Field::new("item", DataType::Float32, true)),
                    self.dimension,
                ),
                false,
            ),
        ]))
    }

    fn tombstones_schema() -> Arc<Schema> {
        Arc::new(Schema::new(vec![
            Field::new("original_id", DataType::Utf8, false),
            Field::new("title", DataType::Utf8, false),
            Field::new("tier", DataType::Utf8, false),
            Field::new("reason", DataType::Utf8, false),
            Field::new("detail", DataType::Utf8, true),
            Field::new(
                "deleted_at",
                DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into())),
                false,
            ),
        ]))
    }

    fn preferences_schema() -> Arc<Schema> {
        Arc::new(Schema::new(vec![
            Field::new("id", DataType::Utf8, false),
            Field::new("key", DataType::Utf8, false),
            Field::new("value", DataType::Utf8, false),
            Field::new("importance", DataType::Utf8, false),
            Field::new(
                "updated_at",
                DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into())),
                false,
            ),
            Field::new("memory_block_id", DataType::Utf8, true),
        ]))
    }

    fn entities_schema() -> Arc<Schema> {
        Arc::new(Schema::new(vec![
            Field::new("id", DataType::Utf8, false),
            Field::new("name", DataType::Utf8, false),
            Field::new("kind", DataType::Utf8, false),
            Field::new("description", DataType::Utf8, false),
            Field::new("importance", DataType::Utf8, false),
            Field::new(
                "updated_at",
                DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into())),
                false,
            ),
            Field::new("memory_block_id", DataType::Utf8, true),
        ]))
    }

    /// Open every table this store needs, creating any that are missing.
    pub async fn ensure_tables(&mut self) -> Result<()> {
        let existing = self
            .connection
            .table_names()
            .execute()
            .await
            .map_err(|e| EngramError::Storage(format!("Failed to list tables: {e}")))?;

        self.memories_table = Some(
            self.ensure_table(&existing, MEMORIES_TABLE, self.memories_schema())
                .await?,
        );
        self.tombstones_table = Some(
            self.ensure_table(&existing, TOMBSTONES_TABLE, Self::tombstones_schema())
                .await?,
        );
        self.preferences_table = Some(
            self.ensure_table(&existing, PREFERENCES_TABLE, Self::preferences_schema())
                .await?,
        );
        self.entities_table = Some(
            self.ensure_table(&existing, ENTITIES_TABLE, Self::entities_schema())
                .await?,
        );

        Ok(())
    }

    async fn ensure_table(
        &self,
        existing: &[String],
        name: &str,
        schema: Arc<Schema>,
    ) -> Result<Table> {
        if existing.contains(&name.to_string()) {
            self.connection
                .open_table(name)
                .execute()
                .await
                .map_err(|e| EngramError::Storage(format!("Failed to open table {name}: {e}")))
        } else {
            let batches = RecordBatchIterator::new(Vec::new(), schema);
            self.connection
                .create_table(name, Box::new(batches))
                .execute()
                .await
                .map_err(|e| EngramError::Storage(format!("Failed to create table {name}: {e}")))
        }
    }

    pub async fn table_exists(&self, name: &str) -> Result<bool> {
        let names = self
            .connection
            .table_names()
            .execute()
            .await
            .map_err(|e| EngramError::Storage(format!("Failed to list tables: {e}")))?;

        Ok(names.contains(&name.to_string()))
    }

    fn memories(&self) -> Result<&Table> {
        self.memories_table
            .as_ref()
            .ok_or_else(|| EngramError::Storage("Memories table not initialized".to_string()))
    }

    fn tombstones(&self) -> Result<&Table> {
        self.tombstones_table
            .as_ref()
            .ok_or_else(|| EngramError::Storage("Tombstones table not initialized".to_string()))
    }

    fn preferences(&self) -> Result<&Table> {
        self.preferences_table
            .as_ref()
            .ok_or_else(|| EngramError::Storage("Preferences table not initialized".to_string()))
    }

    fn entities(&self) -> Result<&Table> {
        self.entities_table
            .as_ref()
            .ok_or_else(|| EngramError::Storage("Entities table not initialized".to_string()))
    }

    /// Create the ANN index over the embedding column once the table is big
    /// enough for training. A no-op below the row threshold.
    pub async fn create_vector_index(&self) -> Result<()> {
        let table = self.memories()?;

        let row_count = table
            .count_rows(None)
            .await
            .map_err(|e| EngramError::Storage(format!("Failed to count rows: {e}")))?;

        if row_count < VECTOR_INDEX_MIN_ROWS {
            return Ok(());
        }

        let ivf_pq = IvfPqIndexBuilder::default()
            .num_partitions(256)
            .num_sub_vectors(16);

        table
            .create_index(&["embedding"], Index::IvfPq(ivf_pq))
            .execute()
            .await
            .map_err(|e| EngramError::Storage(format!("Failed to create vector index: {e}")))?;

        Ok(())
    }

    fn records_to_batch(&self, records: &[MemoryRecord]) -> Result<RecordBatch> {
        let dim = self.dimension as usize;

        let ids: Vec<String> = records.iter().map(|r| r.id.to_string()).collect();
        let id_refs: Vec<&str> = ids.iter().map(String::as_str).collect();

        let titles: Vec<&str> = records.iter().map(|r| r.title.as_str()).collect();
        let contents: Vec<&str> = records.iter().map(|r| r.content.as_str()).collect();

        let record_types: Vec<&str> = records.iter().map(|r| r.record_type.as_str()).collect();
        let tiers: Vec<&str> = records.iter().map(|r| r.tier.as_str()).collect();
        let confidences: Vec<f32> = records.iter().map(|r| r.confidence).collect();

        let tags: Vec<String> = records.iter().map(|r| join_list(&r.tags)).collect();
        let tag_refs: Vec<&str> = tags.iter().map(String::as_str).collect();

        let sources: Vec<String> = records.iter().map(|r| join_list(&r.source)).collect();
        let source_refs: Vec<&str> = sources.iter().map(String::as_str).collect();

        let lineages: Vec<String> = records.iter().map(|r| join_list(&r.lineage)).collect();
        let lineage_refs: Vec<&str> = lineages.iter().map(String::as_str).collect();

        let origins: Vec<Option<&str>> = records.iter().map(|r| r.origin.as_deref()).collect();

        let pinned: Vec<bool> = records.iter().map(|r| r.pinned).collect();
        let forgotten: Vec<bool> = records.iter().map(|r| r.forgotten).collect();
        let forget_reasons: Vec<Option<&str>> =
            records.iter().map(|r| r.forget_reason.as_deref()).collect();

        let metas: Vec<String> = records
            .iter()
            .map(|r| serde_json::Value::Object(r.meta.clone()).to_string())
            .collect();
        let meta_refs: Vec<&str> = metas.iter().map(String::as_str).collect();

        let created_at: Vec<i64> = records
            .iter()
            .map(|r| r.created_at.timestamp_micros())
            .collect();
        let last_used_at: Vec<i64> = records
            .iter()
            .map(|r| r.last_used_at.timestamp_micros())
            .collect();
        let tier_changed_at: Vec<i64> = records
            .iter()
            .map(|r| r.tier_changed_at.timestamp_micros())
            .collect();

        let access_counts: Vec<i32> = records.iter().map(|r| r.access_count as i32).collect();

        let has_embedding: Vec<bool> = records.iter().map(|r| r.embedding.is_some()).collect();

        // Records without an embedding store a zero vector; the has_embedding
        // flag keeps them out of semantic search.
        let embeddings: Vec<Option<Vec<Option<f32>>>> = records
            .iter()
            .map(|r| match &r.embedding {
                Some(v) => Some(v.iter().map(|&x| Some(x)).collect()),
                None => Some(vec![Some(0.0); dim]),
            })
            .collect();

        RecordBatch::try_new(
            self.memories_schema(),
            vec![
                Arc::new(StringArray::from(id_refs)),
                Arc::new(StringArray::from(titles)),
                Arc::new(StringArray::from(contents)),
                Arc::new(StringArray::from(record_types)),
                Arc::new(StringArray::from(tiers)),
                Arc::new(Float32Array::from(confidences)),
                Arc::new(StringArray::from(tag_refs)),
                Arc::new(StringArray::from(source_refs)),
                Arc::new(StringArray::from(lineage_refs)),
                Arc::new(StringArray::from(origins)),
                Arc::new(BooleanArray::from(pinned)),
                Arc::new(BooleanArray::from(forgotten)),
                Arc::new(StringArray::from(forget_reasons)),
                Arc::new(StringArray::from(meta_refs)),
                Arc::new(TimestampMicrosecondArray::from(created_at).with_timezone("UTC")),
                Arc::new(TimestampMicrosecondArray::from(last_used_at).with_timezone("UTC")),
                Arc::new(TimestampMicrosecondArray::from(tier_changed_at).with_timezone("UTC")),
                Arc::new(Int32Array::from(access_counts)),
                Arc::new(BooleanArray::from(has_embedding)),
                Arc::new(FixedSizeListArray::from_iter_primitive::<
                    arrow_array::types::Float32Type,
                    _,
                    _,
                >(embeddings, self.dimension)),
            ],
        )
        .map_err(|e| EngramError::Storage(format!("Failed to create RecordBatch: {e}")))
    }

    fn column_string<'a>(batch: &'a RecordBatch, index: usize, name: &str) -> Result<&'a StringArray> {
        batch
            .column(index)
            .as_any()
            .downcast_ref::<StringArray>()
            .ok_or_else(|| EngramError::Storage(format!("Failed to get {name} column")))
    }

    fn column_bool<'a>(batch: &'a RecordBatch, index: usize, name: &str) -> Result<&'a BooleanArray> {
        batch
            .column(index)
            .as_any()
            .downcast_ref::<BooleanArray>()
            .ok_or_else(|| EngramError::Storage(format!("Failed to get {name} column")))
    }

    fn column_timestamp<'a>(
        batch: &'a RecordBatch,
        index: usize,
        name: &str,
    ) -> Result<&'a TimestampMicrosecondArray> {
        batch
            .column(index)
            .as_any()
            .downcast_ref::<TimestampMicrosecondArray>()
            .ok_or_else(|| EngramError::Storage(format!("Failed to get {name} column")))
    }

    fn parse_timestamp(micros: i64, name: &str) -> Result<DateTime<Utc>> {
        Utc.timestamp_micros(micros)
            .single()
            .ok_or_else(|| EngramError::Storage(format!("Failed to parse {name} timestamp")))
    }

    fn batch_to_record(batch: &RecordBatch, row: usize) -> Result<MemoryRecord> {
        let id_array = Self::column_string(batch, 0, "id")?;
        let title_array = Self::column_string(batch, 1, "title")?;
        let content_array = Self::column_string(batch, 2, "content")?;
        let record_type_array = Self::column_string(batch, 3, "record_type")?;
        let tier_array = Self::column_string(batch, 4, "tier")?;
        let confidence_array = batch
            .column(5)
            .as_any()
            .downcast_ref::<Float32Array>()
            .ok_or_else(|| EngramError::Storage("Failed to get confidence column".to_string()))?;
        let tags_array = Self::column_string(batch, 6, "tags")?;
        let source_array = Self::column_string(batch, 7, "source")?;
        let lineage_array = Self::column_string(batch, 8, "lineage")?;
        let origin_array = Self::column_string(batch, 9, "origin")?;
        let pinned_array = Self::column_bool(batch, 10, "pinned")?;
        let forgotten_array = Self::column_bool(batch, 11, "forgotten")?;
        let forget_reason_array = Self::column_string(batch, 12, "forget_reason")?;
        let meta_array = Self::column_string(batch, 13, "meta")?;
        let created_at_array = Self::column_timestamp(batch, 14, "created_at")?;
        let last_used_at_array = Self::column_timestamp(batch, 15, "last_used_at")?;
        let tier_changed_at_array = Self::column_timestamp(batch, 16, "tier_changed_at")?;
        let access_count_array = batch
            .column(17)
            .as_any()
            .downcast_ref::<Int32Array>()
            .ok_or_else(|| EngramError::Storage("Failed to get access_count column".to_string()))?;
        let has_embedding_array = Self::column_bool(batch, 18, "has_embedding")?;
        let embedding_array = batch
            .column(19)
            .as_any()
            .downcast_ref::<FixedSizeListArray>()
            .ok_or_else(|| EngramError::Storage("Failed to get embedding column".to_string()))?;

        let id = Uuid::parse_str(id_array.value(row))
            .map_err(|e| EngramError::Storage(format!("Failed to parse UUID: {e}")))?;

        let record_type = RecordType::parse(record_type_array.value(row))
            .map_err(|e| EngramError::Storage(format!("Corrupt record_type: {e}")))?;
        let tier = Tier::parse(tier_array.value(row))
            .map_err(|e| EngramError::Storage(format!("Corrupt tier: {e}")))?;

        let origin = if origin_array.is_null(row) {
            None
        } else {
            let value = origin_array.value(row);
            if value.is_empty() {
                None
            } else {
                Some(value.to_string())
            }
        };

        let forget_reason = if forget_reason_array.is_null(row) {
            None
        } else {
            let value = forget_reason_array.value(row);
            if value.is_empty() {
                None
            } else {
                Some(value.to_string())
            }
        };

        let meta = match serde_json::from_str::<serde_json::Value>(meta_array.value(row)) {
            Ok(serde_json::Value::Object(map)) => map,
            _ => serde_json::Map::new(),
        };

        let embedding = if has_embedding_array.value(row) {
            let list = embedding_array.value(row);
            let values = list
                .as_any()
                .downcast_ref::<Float32Array>()
                .ok_or_else(|| EngramError::Storage("Failed to get embedding values".to_string()))?;
            Some((0..values.len()).map(|i| values.value(i)).collect())
        } else {
            None
        };

        Ok(MemoryRecord {
            id,
            title: title_array.value(row).to_string(),
            content: content_array.value(row).to_string(),
            record_type,
            tier,
            confidence: confidence_array.value(row),
            tags: split_list(tags_array.value(row)),
            source: split_list(source_array.value(row)),
            lineage: split_list(lineage_array.value(row)),
            origin,
            pinned: pinned_array.value(row),
            forgotten: forgotten_array.value(row),
            forget_reason,
            meta,
            created_at: Self::parse_timestamp(created_at_array.value(row), "created_at")?,
            last_used_at: Self::parse_timestamp(last_used_at_array.value(row), "last_used_at")?,
            tier_changed_at: Self::parse_timestamp(
                tier_changed_at_array.value(row),
                "tier_changed_at",
            )?,
            access_count: access_count_array.value(row) as u32,
            embedding,
        })
    }

    async fn collect_records<S, E>(stream: S) -> Result<Vec<MemoryRecord>>
    where
        S: futures::Stream<Item = std::result::Result<RecordBatch, E>>,
        E: std::fmt::Display,
    {
        let batches: Vec<RecordBatch> = stream
            .try_collect()
            .await
            .map_err(|e| EngramError::Storage(format!("Failed to collect query results: {e}")))?;

        let mut records = Vec::new();
        for batch in &batches {
            for row in 0..batch.num_rows() {
                records.push(Self::batch_to_record(batch, row)?);
            }
        }
        Ok(records)
    }

    /// Insert a single record
    pub async fn insert(&self, record: &MemoryRecord) -> Result<()> {
        self.insert_batch(std::slice::from_ref(record)).await
    }

    /// Insert multiple records in one batch
    pub async fn insert_batch(&self, records: &[MemoryRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let table = self.memories()?;
        let batch = self.records_to_batch(records)?;
        let schema = batch.schema();
        let batches = RecordBatchIterator::new(vec![Ok(batch)], schema);

        table
            .add(Box::new(batches))
            .execute()
            .await
            .map_err(|e| EngramError::Storage(format!("Failed to insert records: {e}")))?;

        Ok(())
    }

    /// Get a record by id, including soft-forgotten ones
    pub async fn get(&self, id: Uuid) -> Result<Option<MemoryRecord>> {
        let table = self.memories()?;

        let stream = table
            .query()
            .only_if(format!("id = '{id}'"))
            .execute()
            .await
            .map_err(|e| EngramError::Storage(format!("Failed to query record: {e}")))?;

        let mut records = Self::collect_records(stream).await?;
        Ok(records.drain(..).next())
    }

    /// Look up the mirror record for a dual-write origin key
    pub async fn get_by_origin(&self, origin: &str) -> Result<Option<MemoryRecord>> {
        let table = self.memories()?;

        let stream = table
            .query()
            .only_if(format!("origin = '{}'", escape(origin)))
            .execute()
            .await
            .map_err(|e| EngramError::Storage(format!("Failed to query by origin: {e}")))?;

        let mut records = Self::collect_records(stream).await?;
        Ok(records.drain(..).next())
    }

    /// Delete a record by id. Returns true if a record was deleted.
    pub async fn delete(&self, id: Uuid) -> Result<bool> {
        let table = self.memories()?;

        let exists = self.get(id).await?.is_some();
        if exists {
            table
                .delete(&format!("id = '{id}'"))
                .await
                .map_err(|e| EngramError::Storage(format!("Failed to delete record: {e}")))?;
        }

        Ok(exists)
    }

    /// Replace a record in place as a single merge keyed on id, so readers
    /// never observe the record missing mid-rewrite. Inserts when the id is
    /// new. Used by the dual-write mirror for last-writer-wins upserts.
    pub async fn replace(&self, record: &MemoryRecord) -> Result<()> {
        let table = self.memories()?;

        let batch = self.records_to_batch(std::slice::from_ref(record))?;
        let schema = batch.schema();
        let batches = RecordBatchIterator::new(vec![Ok(batch)], schema);

        let mut merge_insert = table.merge_insert(&["id"]);
        merge_insert
            .when_matched_update_all(None)
            .when_not_matched_insert_all();
        merge_insert
            .execute(Box::new(batches))
            .await
            .map_err(|e| EngramError::Storage(format!("Failed to replace record: {e}")))?;

        Ok(())
    }

    /// Mark a record as used: bump access_count, refresh last_used_at
    pub async fn touch(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let table = self.memories()?;
        let micros = now.timestamp_micros();

        let result = table
            .update()
            .only_if(format!("id = '{id}'"))
            .column("access_count", "access_count + 1")
            .column("last_used_at", format!("{micros}"))
            .execute()
            .await
            .map_err(|e| EngramError::Storage(format!("Failed to touch record: {e}")))?;

        Ok(result.rows_updated > 0)
    }

    /// Set the pin flag. Returns false if the id is unknown.
    pub async fn update_pin(&self, id: Uuid, pinned: bool) -> Result<bool> {
        let table = self.memories()?;

        let result = table
            .update()
            .only_if(format!("id = '{id}'"))
            .column("pinned", format!("{pinned}"))
            .execute()
            .await
            .map_err(|e| EngramError::Storage(format!("Failed to update pin: {e}")))?;

        Ok(result.rows_updated > 0)
    }

    /// Move a record to a new tier, stamping tier_changed_at
    pub async fn update_tier(&self, id: Uuid, tier: Tier, now: DateTime<Utc>) -> Result<bool> {
        let table = self.memories()?;

        let result = table
            .update()
            .only_if(format!("id = '{id}'"))
            .column("tier", format!("'{}'", tier.as_str()))
            .column("tier_changed_at", format!("{}", now.timestamp_micros()))
            .execute()
            .await
            .map_err(|e| EngramError::Storage(format!("Failed to update tier: {e}")))?;

        Ok(result.rows_updated > 0)
    }

    /// Promote a record: new tier, reset access counter so the promotion
    /// criterion does not re-fire on the next maintenance pass
    pub async fn promote_tier(&self, id: Uuid, tier: Tier, now: DateTime<Utc>) -> Result<bool> {
        let table = self.memories()?;

        let result = table
            .update()
            .only_if(format!("id = '{id}'"))
            .column("tier", format!("'{}'", tier.as_str()))
            .column("tier_changed_at", format!("{}", now.timestamp_micros()))
            .column("access_count", "0")
            .execute()
            .await
            .map_err(|e| EngramError::Storage(format!("Failed to promote record: {e}")))?;

        Ok(result.rows_updated > 0)
    }

    /// Soft-forget: mark forgotten with an auditable reason and demote
    pub async fn mark_forgotten(
        &self,
        id: Uuid,
        reason: &str,
        demoted_tier: Tier,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let table = self.memories()?;

        let result = table
            .update()
            .only_if(format!("id = '{id}'"))
            .column("forgotten", "true")
            .column("forget_reason", format!("'{}'", escape(reason)))
            .column("tier", format!("'{}'", demoted_tier.as_str()))
            .column("tier_changed_at", format!("{}", now.timestamp_micros()))
            .execute()
            .await
            .map_err(|e| EngramError::Storage(format!("Failed to mark forgotten: {e}")))?;

        Ok(result.rows_updated > 0)
    }

    /// Attach an embedding to a record that was persisted in degraded mode
    pub async fn backfill_embedding(&self, id: Uuid, embedding: &[f32]) -> Result<bool> {
        if embedding.len() != self.dimension as usize {
            return Err(EngramError::Storage(format!(
                "embedding dimension mismatch: expected {}, got {}",
                self.dimension,
                embedding.len()
            )));
        }

        let Some(mut record) = self.get(id).await? else {
            return Ok(false);
        };
        record.embedding = Some(embedding.to_vec());
        self.replace(&record).await?;
        Ok(true)
    }

    /// Vector search over embedded records, restricted by the filter
    pub async fn search_embedded(
        &self,
        embedding: &[f32],
        filter: &RecordFilter,
        limit: usize,
    ) -> Result<Vec<MemoryRecord>> {
        let table = self.memories()?;

        let mut query = table
            .query()
            .nearest_to(embedding)
            .map_err(|e| EngramError::Storage(format!("Failed to create vector query: {e}")))?
            .limit(limit);

        if let Some(sql_filter) = filter.to_sql_clause() {
            query = query.only_if(sql_filter);
        }

        let stream = query
            .execute()
            .await
            .map_err(|e| EngramError::Storage(format!("Failed to execute search: {e}")))?;

        Self::collect_records(stream).await
    }

    /// Plain filtered scan with paging
    pub async fn list_filtered(
        &self,
        filter: &RecordFilter,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<MemoryRecord>> {
        let table = self.memories()?;

        let mut query = table.query().limit(limit).offset(offset);
        if let Some(sql_filter) = filter.to_sql_clause() {
            query = query.only_if(sql_filter);
        }

        let stream = query
            .execute()
            .await
            .map_err(|e| EngramError::Storage(format!("Failed to list records: {e}")))?;

        Self::collect_records(stream).await
    }

    /// Count records matching the filter
    pub async fn count_filtered(&self, filter: &RecordFilter) -> Result<usize> {
        let table = self.memories()?;

        table
            .count_rows(filter.to_sql_clause())
            .await
            .map_err(|e| EngramError::Storage(format!("Failed to count records: {e}")))
    }

    /// Count records in a tier (forgotten included, for stats)
    pub async fn count_by_tier(&self, tier: Tier) -> Result<usize> {
        let table = self.memories()?;

        table
            .count_rows(Some(format!("tier = '{}'", tier.as_str())))
            .await
            .map_err(|e| EngramError::Storage(format!("Failed to count by tier: {e}")))
    }

    /// Total record count across all tiers
    pub async fn total_count(&self) -> Result<usize> {
        let table = self.memories()?;

        table
            .count_rows(None)
            .await
            .map_err(|e| EngramError::Storage(format!("Failed to count records: {e}")))
    }

    // ------------------------------------------------------------------
    // Tombstones
    // ------------------------------------------------------------------

    fn tombstones_to_batch(tombstones: &[Tombstone]) -> Result<RecordBatch> {
        let ids: Vec<String> = tombstones
            .iter()
            .map(|t| t.original_id.to_string())
            .collect();
        let id_refs: Vec<&str> = ids.iter().map(String::as_str).collect();

        let titles: Vec<&str> = tombstones.iter().map(|t| t.title.as_str()).collect();
        let tiers: Vec<&str> = tombstones.iter().map(|t| t.tier.as_str()).collect();
        let reasons: Vec<&str> = tombstones.iter().map(|t| t.reason.as_str()).collect();
        let details: Vec<Option<&str>> = tombstones.iter().map(|t| t.detail.as_deref()).collect();
        let deleted_at: Vec<i64> = tombstones
            .iter()
            .map(|t| t.deleted_at.timestamp_micros())
            .collect();

        RecordBatch::try_new(
            Self::tombstones_schema(),
            vec![
                Arc::new(StringArray::from(id_refs)),
                Arc::new(StringArray::from(titles)),
                Arc::new(StringArray::from(tiers)),
                Arc::new(StringArray::from(reasons)),
                Arc::new(StringArray::from(details)),
                Arc::new(TimestampMicrosecondArray::from(deleted_at).with_timezone("UTC")),
            ],
        )
        .map_err(|e| EngramError::Storage(format!("Failed to create tombstone batch: {e}")))
    }

    fn batch_to_tombstone(batch: &RecordBatch, row: usize) -> Result<Tombstone> {
        let id_array = Self::column_string(batch, 0, "original_id")?;
        let title_array = Self::column_string(batch, 1, "title")?;
        let tier_array = Self::column_string(batch, 2, "tier")?;
        let reason_array = Self::column_string(batch, 3, "reason")?;
        let detail_array = Self::column_string(batch, 4, "detail")?;
        let deleted_at_array = Self::column_timestamp(batch, 5, "deleted_at")?;

        let original_id = Uuid::parse_str(id_array.value(row))
            .map_err(|e| EngramError::Storage(format!("Failed to parse UUID: {e}")))?;
        let tier = Tier::parse(tier_array.value(row))
            .map_err(|e| EngramError::Storage(format!("Corrupt tombstone tier: {e}")))?;
        let reason = DeleteReason::parse(reason_array.value(row)).ok_or_else(|| {
            EngramError::Storage(format!(
                "Unknown delete reason: {}",
                reason_array.value(row)
            ))
        })?;

        let detail = if detail_array.is_null(row) {
            None
        } else {
            let value = detail_array.value(row);
            if value.is_empty() {
                None
            } else {
                Some(value.to_string())
            }
        };

        Ok(Tombstone {
            original_id,
            title: title_array.value(row).to_string(),
            tier,
            reason,
            detail,
            deleted_at: Self::parse_timestamp(deleted_at_array.value(row), "deleted_at")?,
        })
    }

    pub async fn insert_tombstone(&self, tombstone: &Tombstone) -> Result<()> {
        let table = self.tombstones()?;

        let batch = Self::tombstones_to_batch(std::slice::from_ref(tombstone))?;
        let schema = batch.schema();
        let batches = RecordBatchIterator::new(vec![Ok(batch)], schema);

        table
            .add(Box::new(batches))
            .execute()
            .await
            .map_err(|e| EngramError::Storage(format!("Failed to insert tombstone: {e}")))?;

        Ok(())
    }

    pub async fn get_tombstone(&self, original_id: Uuid) -> Result<Option<Tombstone>> {
        let table = self.tombstones()?;

        let stream = table
            .query()
            .only_if(format!("original_id = '{original_id}'"))
            .execute()
            .await
            .map_err(|e| EngramError::Storage(format!("Failed to query tombstone: {e}")))?;

        let batches: Vec<RecordBatch> = stream
            .try_collect()
            .await
            .map_err(|e| EngramError::Storage(format!("Failed to collect tombstones: {e}")))?;

        for batch in &batches {
            if batch.num_rows() > 0 {
                return Ok(Some(Self::batch_to_tombstone(batch, 0)?));
            }
        }
        Ok(None)
    }

    pub async fn list_tombstones(&self) -> Result<Vec<Tombstone>> {
        let table = self.tombstones()?;

        let stream = table
            .query()
            .execute()
            .await
            .map_err(|e| EngramError::Storage(format!("Failed to list tombstones: {e}")))?;

        let batches: Vec<RecordBatch> = stream
            .try_collect()
            .await
            .map_err(|e| EngramError::Storage(format!("Failed to collect tombstones: {e}")))?;

        let mut tombstones = Vec::new();
        for batch in &batches {
            for row in 0..batch.num_rows() {
                tombstones.push(Self::batch_to_tombstone(batch, row)?);
            }
        }
        Ok(tombstones)
    }

    /// Tombstone a record and then delete it. The tombstone lands first so a
    /// crash between the two steps leaves an audit entry, never a silent loss.
    pub async fn delete_with_tombstone(
        &self,
        record: &MemoryRecord,
        reason: DeleteReason,
        detail: Option<String>,
    ) -> Result<bool> {
        let tombstone = Tombstone::new(
            record.id,
            record.title.clone(),
            record.tier,
            reason,
            detail,
        );
        self.insert_tombstone(&tombstone).await?;
        self.delete(record.id).await
    }

    // ------------------------------------------------------------------
    // Auxiliary tables (dual-write sources)
    // ------------------------------------------------------------------

    fn preferences_to_batch(rows: &[PreferenceRow]) -> Result<RecordBatch> {
        let ids: Vec<String> = rows.iter().map(|r| r.id.to_string()).collect();
        let id_refs: Vec<&str> = ids.iter().map(String::as_str).collect();

        let keys: Vec<&str> = rows.iter().map(|r| r.key.as_str()).collect();
        let values: Vec<&str> = rows.iter().map(|r| r.value.as_str()).collect();
        let importances: Vec<&str> = rows.iter().map(|r| r.importance.as_str()).collect();
        let updated_at: Vec<i64> = rows
            .iter()
            .map(|r| r.updated_at.timestamp_micros())
            .collect();
        let block_ids: Vec<Option<String>> =
            rows.iter().map(|r| r.memory_block_id.map(|u| u.to_string())).collect();
        let block_id_refs: Vec<Option<&str>> = block_ids.iter().map(|s| s.as_deref()).collect();

        RecordBatch::try_new(
            Self::preferences_schema(),
            vec![
                Arc::new(StringArray::from(id_refs)),
                Arc::new(StringArray::from(keys)),
                Arc::new(StringArray::from(values)),
                Arc::new(StringArray::from(importances)),
                Arc::new(TimestampMicrosecondArray::from(updated_at).with_timezone("UTC")),
                Arc::new(StringArray::from(block_id_refs)),
            ],
        )
        .map_err(|e| EngramError::Storage(format!("Failed to create preference batch: {e}")))
    }

    fn batch_to_preference(batch: &RecordBatch, row: usize) -> Result<PreferenceRow> {
        let id_array = Self::column_string(batch, 0, "id")?;
        let key_array = Self::column_string(batch, 1, "key")?;
        let value_array = Self::column_string(batch, 2, "value")?;
        let importance_array = Self::column_string(batch, 3, "importance")?;
        let updated_at_array = Self::column_timestamp(batch, 4, "updated_at")?;
        let block_id_array = Self::column_string(batch, 5, "memory_block_id")?;

        Ok(PreferenceRow {
            id: Uuid::parse_str(id_array.value(row))
                .map_err(|e| EngramError::Storage(format!("Failed to parse UUID: {e}")))?,
            key: key_array.value(row).to_string(),
            value: value_array.value(row).to_string(),
            importance: ImportanceClass::parse(importance_array.value(row)).ok_or_else(|| {
                EngramError::Storage(format!(
                    "Unknown importance class: {}",
                    importance_array.value(row)
                ))
            })?,
            updated_at: Self::parse_timestamp(updated_at_array.value(row), "updated_at")?,
            memory_block_id: if block_id_array.is_null(row) {
                None
            } else {
                Uuid::parse_str(block_id_array.value(row)).ok()
            },
        })
    }

    /// Last-writer-wins upsert of an auxiliary preference row, merged
    /// atomically on id
    pub async fn upsert_preference(&self, row: &PreferenceRow) -> Result<()> {
        let table = self.preferences()?;

        let batch = Self::preferences_to_batch(std::slice::from_ref(row))?;
        let schema = batch.schema();
        let batches = RecordBatchIterator::new(vec![Ok(batch)], schema);

        let mut merge_insert = table.merge_insert(&["id"]);
        merge_insert
            .when_matched_update_all(None)
            .when_not_matched_insert_all();
        merge_insert
            .execute(Box::new(batches))
            .await
            .map_err(|e| EngramError::Storage(format!("Failed to upsert preference: {e}")))?;

        Ok(())
    }

    pub async fn get_preference(&self, id: Uuid) -> Result<Option<PreferenceRow>> {
        let table = self.preferences()?;

        let stream = table
            .query()
            .only_if(format!("id = '{id}'"))
            .execute()
            .await
            .map_err(|e| EngramError::Storage(format!("Failed to query preference: {e}")))?;

        let batches: Vec<RecordBatch> = stream
            .try_collect()
            .await
            .map_err(|e| EngramError::Storage(format!("Failed to collect preferences: {e}")))?;

        for batch in &batches {
            if batch.num_rows() > 0 {
                return Ok(Some(Self::batch_to_preference(batch, 0)?));
            }
        }
        Ok(None)
    }

    fn entities_to_batch(rows: &[EntityRow]) -> Result<RecordBatch> {
        let ids: Vec<String> = rows.iter().map(|r| r.id.to_string()).collect();
        let id_refs: Vec<&str> = ids.iter().map(String::as_str).collect();

        let names: Vec<&str> = rows.iter().map(|r| r.name.as_str()).collect();
        let kinds: Vec<&str> = rows.iter().map(|r| r.kind.as_str()).collect();
        let descriptions: Vec<&str> = rows.iter().map(|r| r.description.as_str()).collect();
        let importances: Vec<&str> = rows.iter().map(|r| r.importance.as_str()).collect();
        let updated_at: Vec<i64> = rows
            .iter()
            .map(|r| r.updated_at.timestamp_micros())
            .collect();
        let block_ids: Vec<Option<String>> =
            rows.iter().map(|r| r.memory_block_id.map(|u| u.to_string())).collect();
        let block_id_refs: Vec<Option<&str>> = block_ids.iter().map(|s| s.as_deref()).collect();

        RecordBatch::try_new(
            Self::entities_schema(),
            vec![
                Arc::new(StringArray::from(id_refs)),
                Arc::new(StringArray::from(names)),
                Arc::new(StringArray::from(kinds)),
                Arc::new(StringArray::from(descriptions)),
                Arc::new(StringArray::from(importances)),
                Arc::new(TimestampMicrosecondArray::from(updated_at).with_timezone("UTC")),
                Arc::new(StringArray::from(block_id_refs)),
            ],
        )
        .map_err(|e| EngramError::Storage(format!("Failed to create entity batch: {e}")))
    }

    fn batch_to_entity(batch: &RecordBatch, row: usize) -> Result<EntityRow> {
        let id_array = Self::column_string(batch, 0, "id")?;
        let name_array = Self::column_string(batch, 1, "name")?;
        let kind_array = Self::column_string(batch, 2, "kind")?;
        let description_array = Self::column_string(batch, 3, "description")?;
        let importance_array = Self::column_string(batch, 4, "importance")?;
        let updated_at_array = Self::column_timestamp(batch, 5, "updated_at")?;
        let block_id_array = Self::column_string(batch, 6, "memory_block_id")?;

        Ok(EntityRow {
            id: Uuid::parse_str(id_array.value(row))
                .map_err(|e| EngramError::Storage(format!("Failed to parse UUID: {e}")))?,
            name: name_array.value(row).to_string(),
            kind: kind_array.value(row).to_string(),
            description: description_array.value(row).to_string(),
            importance: ImportanceClass::parse(importance_array.value(row)).ok_or_else(|| {
                EngramError::Storage(format!(
                    "Unknown importance class: {}",
                    importance_array.value(row)
                ))
            })?,
            updated_at: Self::parse_timestamp(updated_at_array.value(row), "updated_at")?,
            memory_block_id: if block_id_array.is_null(row) {
                None
            } else {
                Uuid::parse_str(block_id_array.value(row)).ok()
            },
        })
    }

    /// Last-writer-wins upsert of an auxiliary entity row, merged
    /// atomically on id
    pub async fn upsert_entity(&self, row: &EntityRow) -> Result<()> {
        let table = self.entities()?;

        let batch = Self::entities_to_batch(std::slice::from_ref(row))?;
        let schema = batch.schema();
        let batches = RecordBatchIterator::new(vec![Ok(batch)], schema);

        let mut merge_insert = table.merge_insert(&["id"]);
        merge_insert
            .when_matched_update_all(None)
            .when_not_matched_insert_all();
        merge_insert
            .execute(Box::new(batches))
            .await
            .map_err(|e| EngramError::Storage(format!("Failed to upsert entity: {e}")))?;

        Ok(())
    }

    pub async fn get_entity(&self, id: Uuid) -> Result<Option<EntityRow>> {
        let table = self.entities()?;

        let stream = table
            .query()
            .only_if(format!("id = '{id}'"))
            .execute()
            .await
            .map_err(|e| EngramError::Storage(format!("Failed to query entity: {e}")))?;

        let batches: Vec<RecordBatch> = stream
            .try_collect()
            .await
            .map_err(|e| EngramError::Storage(format!("Failed to collect entities: {e}")))?;

        for batch in &batches {
            if batch.num_rows() > 0 {
                return Ok(Some(Self::batch_to_entity(batch, 0)?));
            }
        }
        Ok(None)
    }
}
