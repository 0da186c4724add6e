//! Unified vector store.
//!
//! One logical table of `{id, vector, content, metadata}` rows backed by a
//! usearch HNSW index (cosine metric), an in-process row table persisted
//! as a JSON sidecar, and a tantivy full-text index mirroring `content`.
//! File metadata exists only denormalized inside rows; `list_file_metadata`
//! reconstructs it by dedup-over-max-`processedAt` with a short-TTL cache.
//!
//! The synchronizer is the only writer. Readers are concurrent and see a
//! monotonically advancing view once a batch lands.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use usearch::ffi::{IndexOptions, MetricKind, ScalarKind};

use crate::config::Deadlines;
use crate::error::{with_deadline, AppError, AppResult};
use crate::fts::FtsIndex;
use crate::ports::{self, EmbeddingPort};

/// Version stamp written into every row's metadata.
pub const PROCESSING_VERSION: &str = "1.0";

const INITIAL_CAPACITY: usize = 65_536;
const META_CACHE_TTL: Duration = Duration::from_secs(300);
const SAVE_THROTTLE: Duration = Duration::from_secs(10);
const SENTINEL_ID: &str = "__schema_sentinel__";

/// Denormalized snapshot of the owning file, carried by every chunk row.
/// Field names follow the public column schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordMetadata {
    pub file_id: String,
    pub file_name: String,
    pub file_path: String,
    pub file_size: u64,
    pub file_type: String,
    pub file_hash: String,
    pub chunk_index: u32,
    pub total_chunks: u32,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    pub processed_at: DateTime<Utc>,
    pub model_version: String,
    pub processing_version: String,
    pub source_type: String,
    pub status: String,
}

impl RecordMetadata {
    /// Stringified field lookup by public column name, used by equality
    /// filters.
    pub fn field(&self, key: &str) -> Option<String> {
        match key {
            "fileId" => Some(self.file_id.clone()),
            "fileName" => Some(self.file_name.clone()),
            "filePath" => Some(self.file_path.clone()),
            "fileSize" => Some(self.file_size.to_string()),
            "fileType" => Some(self.file_type.clone()),
            "fileHash" => Some(self.file_hash.clone()),
            "chunkIndex" => Some(self.chunk_index.to_string()),
            "totalChunks" => Some(self.total_chunks.to_string()),
            "createdAt" => Some(self.created_at.to_rfc3339()),
            "modifiedAt" => Some(self.modified_at.to_rfc3339()),
            "processedAt" => Some(self.processed_at.to_rfc3339()),
            "modelVersion" => Some(self.model_version.clone()),
            "processingVersion" => Some(self.processing_version.clone()),
            "sourceType" => Some(self.source_type.clone()),
            "status" => Some(self.status.clone()),
            _ => None,
        }
    }
}

/// One row of the store: a chunk with its vector and denormalized file
/// metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorRecord {
    pub id: String,
    pub vector: Vec<f32>,
    pub content: String,
    pub metadata: RecordMetadata,
}

/// Per-file view reconstructed from the newest row of each `fileId`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetaSnapshot {
    pub file_id: String,
    pub file_name: String,
    pub file_path: String,
    pub file_size: u64,
    pub file_type: String,
    pub file_hash: String,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    pub processed_at: DateTime<Utc>,
    pub chunk_count: usize,
}

#[derive(Debug, Clone, Default)]
pub struct VectorSearchOptions {
    pub top_k: usize,
    pub score_threshold: Option<f32>,
    pub file_types: Option<Vec<String>>,
    pub metadata_filters: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct ScoredRecord {
    pub record: VectorRecord,
    pub score: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub count: usize,
    pub documents: usize,
    pub dimensions: usize,
}

#[derive(Serialize, Deserialize)]
struct PersistedRow {
    key: u64,
    record: VectorRecord,
}

#[derive(Serialize, Deserialize)]
struct PersistedRows {
    next_key: u64,
    rows: Vec<PersistedRow>,
}

struct StoreInner {
    index: usearch::Index,
    rows: HashMap<String, VectorRecord>,
    keys: HashMap<String, u64>,
    ids: HashMap<u64, String>,
    next_key: u64,
    dirty: bool,
    last_save: Instant,
}

struct MetaCache {
    built_at: Instant,
    snapshots: HashMap<String, FileMetaSnapshot>,
}

pub struct VectorStore {
    inner: RwLock<StoreInner>,
    fts: FtsIndex,
    dims: usize,
    batch_size: usize,
    deadlines: Deadlines,
    index_path: PathBuf,
    rows_path: PathBuf,
    meta_cache: Mutex<Option<MetaCache>>,
}

impl VectorStore {
    /// Open (or create) the store under `data_dir`, warm the embedder, and
    /// on first creation run the sentinel-row pass that exercises the full
    /// write/delete path before any real data arrives.
    pub async fn open(
        data_dir: &Path,
        embedder: &dyn EmbeddingPort,
        batch_size: usize,
        deadlines: Deadlines,
    ) -> AppResult<Self> {
        let budget = deadlines.connect();
        with_deadline("store.open", budget, async {
            let dims = embedder.info().dimensions;
            if dims == 0 {
                return Err(AppError::VectorStore(
                    "embedder reports zero dimensions".to_string(),
                ));
            }

            let store_dir = data_dir.join("store");
            std::fs::create_dir_all(&store_dir)?;
            let fts = FtsIndex::open(&data_dir.join("fts"))?;

            let index_path = store_dir.join("index.usearch");
            let rows_path = store_dir.join("rows.json");

            let index = Self::new_index(dims)?;
            let mut fresh = true;
            let mut rows = HashMap::new();
            let mut keys = HashMap::new();
            let mut ids = HashMap::new();
            let mut next_key = 0u64;

            if rows_path.exists() {
                match Self::load_rows(&rows_path) {
                    Ok(persisted) => {
                        next_key = persisted.next_key;
                        for row in persisted.rows {
                            keys.insert(row.record.id.clone(), row.key);
                            ids.insert(row.key, row.record.id.clone());
                            rows.insert(row.record.id.clone(), row.record);
                        }
                        fresh = false;
                    }
                    Err(e) => {
                        warn!(error = %e, "row sidecar unreadable, starting fresh");
                    }
                }
            }

            let loaded = !fresh
                && index_path.exists()
                && index
                    .load(index_path.to_string_lossy().as_ref())
                    .map(|_| index.size() == rows.len())
                    .unwrap_or(false);
            if !fresh && !loaded {
                // Vectors are also in the rows sidecar, so a lost or stale
                // HNSW file is rebuilt rather than dropping data.
                warn!("vector index missing or stale, rebuilding from rows");
                Self::reserve(&index, rows.len() + INITIAL_CAPACITY)?;
                for (id, key) in &keys {
                    if let Some(record) = rows.get(id) {
                        if let Err(e) = index.add(*key, &record.vector) {
                            warn!(id = %id, error = %e, "failed to restore vector");
                        }
                    }
                }
            }
            if fresh {
                Self::reserve(&index, INITIAL_CAPACITY)?;
            }

            let store = Self {
                inner: RwLock::new(StoreInner {
                    index,
                    rows,
                    keys,
                    ids,
                    next_key,
                    dirty: false,
                    last_save: Instant::now(),
                }),
                fts,
                dims,
                batch_size,
                deadlines,
                index_path,
                rows_path,
                meta_cache: Mutex::new(None),
            };

            ports::warm_up(embedder).await?;

            if fresh {
                store.sentinel_pass().await?;
            }

            info!(
                dimensions = dims,
                rows = store.inner.read().rows.len(),
                "vector store open"
            );
            Ok(store)
        })
        .await
    }

    fn new_index(dims: usize) -> AppResult<usearch::Index> {
        let options = IndexOptions {
            dimensions: dims,
            metric: MetricKind::Cos,
            quantization: ScalarKind::F32,
            connectivity: 16,
            expansion_add: 128,
            expansion_search: 64,
            multi: false,
        };
        usearch::Index::new(&options)
            .map_err(|e| AppError::VectorStore(format!("create vector index: {}", e)))
    }

    fn reserve(index: &usearch::Index, capacity: usize) -> AppResult<()> {
        index
            .reserve(capacity)
            .map_err(|e| AppError::VectorStore(format!("reserve vector index: {}", e)))
    }

    fn load_rows(path: &Path) -> AppResult<PersistedRows> {
        let json = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }

    /// Insert a freshly created table's sentinel row and delete it again,
    /// exercising the complete write path before real data arrives.
    async fn sentinel_pass(&self) -> AppResult<()> {
        let mut vector = vec![0.0f32; self.dims];
        vector[0] = 1.0;
        let now = Utc::now();
        let sentinel = VectorRecord {
            id: SENTINEL_ID.to_string(),
            vector,
            content: "schema sentinel".to_string(),
            metadata: RecordMetadata {
                file_id: SENTINEL_ID.to_string(),
                file_name: String::new(),
                file_path: String::new(),
                file_size: 0,
                file_type: "other".to_string(),
                file_hash: String::new(),
                chunk_index: 0,
                total_chunks: 1,
                created_at: now,
                modified_at: now,
                processed_at: now,
                model_version: String::new(),
                processing_version: PROCESSING_VERSION.to_string(),
                source_type: "system".to_string(),
                status: "transient".to_string(),
            },
        };
        self.add(vec![sentinel]).await?;
        self.delete_by_ids(&[SENTINEL_ID.to_string()]).await?;
        Ok(())
    }

    pub fn dimensions(&self) -> usize {
        self.dims
    }

    /// At-least-once upsert by id, in batches. Rows whose vector length
    /// does not match the store dimension are dropped with a warning, not
    /// failing the batch. Returns the number of rows accepted.
    pub async fn add(&self, records: Vec<VectorRecord>) -> AppResult<usize> {
        with_deadline("store.add", self.deadlines.read(), async {
            let mut accepted = 0usize;
            for batch in records.chunks(self.batch_size) {
                let mut fts_docs = Vec::with_capacity(batch.len());
                {
                    let mut inner = self.inner.write();
                    let needed = inner.index.size() + batch.len() + 1;
                    if needed > inner.index.capacity() {
                        Self::reserve(&inner.index, (needed * 2).max(INITIAL_CAPACITY))?;
                    }
                    for record in batch {
                        if record.vector.len() != self.dims {
                            warn!(
                                id = %record.id,
                                got = record.vector.len(),
                                want = self.dims,
                                "dropping row with invalid vector length"
                            );
                            continue;
                        }
                        if let Some(old_key) = inner.keys.remove(&record.id) {
                            let _ = inner.index.remove(old_key);
                            inner.ids.remove(&old_key);
                        }
                        let key = inner.next_key;
                        inner.next_key += 1;
                        if let Err(e) = inner.index.add(key, &record.vector) {
                            warn!(id = %record.id, error = %e, "failed to add vector");
                            continue;
                        }
                        inner.keys.insert(record.id.clone(), key);
                        inner.ids.insert(key, record.id.clone());
                        fts_docs.push((
                            record.id.clone(),
                            record.metadata.file_id.clone(),
                            record.content.clone(),
                        ));
                        inner.rows.insert(record.id.clone(), record.clone());
                        accepted += 1;
                    }
                    inner.dirty = true;
                }
                self.fts.add(&fts_docs).await?;
            }
            self.invalidate_cache();
            self.maybe_save(false)?;
            Ok(accepted)
        })
        .await
    }

    /// Exact deletion by id; idempotent.
    pub async fn delete_by_ids(&self, ids: &[String]) -> AppResult<usize> {
        with_deadline("store.delete", self.deadlines.read(), async {
            let removed = self.remove_rows(ids);
            self.fts.delete_ids(ids).await?;
            self.invalidate_cache();
            self.maybe_save(false)?;
            Ok(removed)
        })
        .await
    }

    /// Remove every row belonging to `file_id`; idempotent.
    pub async fn delete_by_file_id(&self, file_id: &str) -> AppResult<usize> {
        with_deadline("store.delete", self.deadlines.read(), async {
            let ids: Vec<String> = {
                let inner = self.inner.read();
                inner
                    .rows
                    .values()
                    .filter(|r| r.metadata.file_id == file_id)
                    .map(|r| r.id.clone())
                    .collect()
            };
            let removed = self.remove_rows(&ids);
            self.fts.delete_file_id(file_id).await?;
            self.invalidate_cache();
            self.maybe_save(false)?;
            Ok(removed)
        })
        .await
    }

    /// Truncate the table.
    pub async fn delete_all(&self) -> AppResult<()> {
        with_deadline("store.delete", self.deadlines.read(), async {
            {
                let mut inner = self.inner.write();
                inner.rows.clear();
                inner.keys.clear();
                inner.ids.clear();
                inner.index = Self::new_index(self.dims)?;
                Self::reserve(&inner.index, INITIAL_CAPACITY)?;
                inner.dirty = true;
            }
            self.fts.delete_all().await?;
            self.invalidate_cache();
            self.maybe_save(true)?;
            Ok(())
        })
        .await
    }

    fn remove_rows(&self, ids: &[String]) -> usize {
        let mut inner = self.inner.write();
        let mut removed = 0usize;
        for id in ids {
            if inner.rows.remove(id).is_some() {
                removed += 1;
            }
            if let Some(key) = inner.keys.remove(id) {
                let _ = inner.index.remove(key);
                inner.ids.remove(&key);
            }
        }
        if removed > 0 {
            inner.dirty = true;
        }
        removed
    }

    /// Up to `top_k` rows ordered by descending similarity (`1 - cosine
    /// distance`). Filters are evaluated before the top-k cut: with
    /// filters present the HNSW index is over-fetched and widened until
    /// enough survivors exist or the whole index has been considered.
    pub async fn vector_search(
        &self,
        query: &[f32],
        opts: &VectorSearchOptions,
    ) -> AppResult<Vec<ScoredRecord>> {
        with_deadline("store.vector_search", self.deadlines.search(), async {
            if query.len() != self.dims {
                return Err(AppError::VectorStore(format!(
                    "query vector has {} dimensions, store has {}",
                    query.len(),
                    self.dims
                )));
            }
            if opts.top_k == 0 {
                return Ok(Vec::new());
            }

            let inner = self.inner.read();
            let total = inner.index.size();
            if total == 0 {
                return Ok(Vec::new());
            }

            let filtered = opts.score_threshold.is_some()
                || opts.file_types.is_some()
                || !opts.metadata_filters.is_empty();
            let mut k = if filtered {
                (opts.top_k * 4).max(64)
            } else {
                opts.top_k
            };

            loop {
                k = k.min(total);
                let matches = inner
                    .index
                    .search(query, k)
                    .map_err(|e| AppError::VectorStore(format!("vector search: {}", e)))?;

                let mut hits = Vec::new();
                for (key, distance) in matches.keys.iter().zip(matches.distances.iter()) {
                    let Some(id) = inner.ids.get(key) else { continue };
                    let Some(record) = inner.rows.get(id) else { continue };
                    let score = 1.0 - distance;
                    if !passes_filters(record, score, opts) {
                        continue;
                    }
                    hits.push(ScoredRecord {
                        record: record.clone(),
                        score,
                    });
                }

                if hits.len() >= opts.top_k || k >= total {
                    hits.truncate(opts.top_k);
                    return Ok(hits);
                }
                k = (k * 2).max(k + 1);
            }
        })
        .await
    }

    /// Scored full-text hits over `content`, joined back to full records.
    pub async fn lexical_search(&self, query: &str, limit: usize) -> AppResult<Vec<ScoredRecord>> {
        with_deadline("store.lexical_search", self.deadlines.search(), async {
            let hits = self.fts.search(query, limit)?;
            let inner = self.inner.read();
            Ok(hits
                .into_iter()
                .filter_map(|h| {
                    inner.rows.get(&h.id).map(|r| ScoredRecord {
                        record: r.clone(),
                        score: h.score,
                    })
                })
                .collect())
        })
        .await
    }

    /// Per-file snapshots, deduplicated by `fileId` keeping the row with
    /// the greatest `processedAt`. Cached in-process for five minutes;
    /// every mutating operation invalidates the cache before returning.
    pub fn list_file_metadata(&self) -> HashMap<String, FileMetaSnapshot> {
        {
            let cache = self.meta_cache.lock();
            if let Some(c) = cache.as_ref() {
                if c.built_at.elapsed() < META_CACHE_TTL {
                    return c.snapshots.clone();
                }
            }
        }

        let snapshots = self.build_snapshots();
        *self.meta_cache.lock() = Some(MetaCache {
            built_at: Instant::now(),
            snapshots: snapshots.clone(),
        });
        snapshots
    }

    fn build_snapshots(&self) -> HashMap<String, FileMetaSnapshot> {
        let inner = self.inner.read();
        let mut by_file: HashMap<String, FileMetaSnapshot> = HashMap::new();
        for record in inner.rows.values() {
            let m = &record.metadata;
            let entry = by_file.get_mut(&m.file_id);
            match entry {
                Some(snapshot) => {
                    snapshot.chunk_count += 1;
                    if m.processed_at > snapshot.processed_at {
                        snapshot.file_name = m.file_name.clone();
                        snapshot.file_path = m.file_path.clone();
                        snapshot.file_size = m.file_size;
                        snapshot.file_type = m.file_type.clone();
                        snapshot.file_hash = m.file_hash.clone();
                        snapshot.created_at = m.created_at;
                        snapshot.modified_at = m.modified_at;
                        snapshot.processed_at = m.processed_at;
                    }
                }
                None => {
                    by_file.insert(
                        m.file_id.clone(),
                        FileMetaSnapshot {
                            file_id: m.file_id.clone(),
                            file_name: m.file_name.clone(),
                            file_path: m.file_path.clone(),
                            file_size: m.file_size,
                            file_type: m.file_type.clone(),
                            file_hash: m.file_hash.clone(),
                            created_at: m.created_at,
                            modified_at: m.modified_at,
                            processed_at: m.processed_at,
                            chunk_count: 1,
                        },
                    );
                }
            }
        }
        by_file
    }

    pub fn stats(&self) -> StoreStats {
        let inner = self.inner.read();
        let documents = inner
            .rows
            .values()
            .map(|r| r.metadata.file_id.as_str())
            .collect::<std::collections::HashSet<_>>()
            .len();
        StoreStats {
            count: inner.rows.len(),
            documents,
            dimensions: self.dims,
        }
    }

    fn invalidate_cache(&self) {
        *self.meta_cache.lock() = None;
    }

    /// Persist dirty state. Saves are throttled during watcher-driven
    /// churn; `flush` forces one.
    pub fn flush(&self) -> AppResult<()> {
        self.maybe_save(true)
    }

    fn maybe_save(&self, force: bool) -> AppResult<()> {
        let mut inner = self.inner.write();
        if !inner.dirty {
            return Ok(());
        }
        if !force && inner.last_save.elapsed() < SAVE_THROTTLE {
            return Ok(());
        }

        let persisted = PersistedRows {
            next_key: inner.next_key,
            rows: inner
                .rows
                .values()
                .filter_map(|r| {
                    inner.keys.get(&r.id).map(|key| PersistedRow {
                        key: *key,
                        record: r.clone(),
                    })
                })
                .collect(),
        };
        let json = serde_json::to_string(&persisted)?;
        let tmp = self.rows_path.with_extension("json.tmp");
        std::fs::write(&tmp, &json)?;
        std::fs::rename(&tmp, &self.rows_path)?;

        inner
            .index
            .save(self.index_path.to_string_lossy().as_ref())
            .map_err(|e| AppError::VectorStore(format!("save vector index: {}", e)))?;

        inner.dirty = false;
        inner.last_save = Instant::now();
        Ok(())
    }
}

fn passes_filters(record: &VectorRecord, score: f32, opts: &VectorSearchOptions) -> bool {
    if let Some(threshold) = opts.score_threshold {
        if score < threshold {
            return false;
        }
    }
    if let Some(types) = &opts.file_types {
        if !types.iter().any(|t| t == &record.metadata.file_type) {
            return false;
        }
    }
    for (key, expected) in &opts.metadata_filters {
        match record.metadata.field(key) {
            Some(actual) if &actual == expected => {}
            _ => return false,
        }
    }
    true
}
