//! Reconciliation between the watched directory and the vector store.
//!
//! Runs at startup and on demand, and handles individual watcher events.
//! Decisions follow the stored per-file snapshots: hash, then size, then
//! mtime. Orphaned file ids are deleted only after verifying the stored
//! path is truly gone, which guards against transient scan failures.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use futures_util::stream::{self, StreamExt};
use ignore::WalkBuilder;
use rayon::prelude::*;
use tokio::sync::{broadcast, Mutex, Semaphore};
use tracing::{debug, info, warn};

use crate::chunker::{self, ChunkParams, TextChunk};
use crate::config::{is_excluded_directory, is_supported_extension, AppConfig};
use crate::context::ContextSynthesizer;
use crate::error::{with_deadline, AppError, AppResult};
use crate::metadata::{self, FileMetadata};
use crate::ports::EmbeddingPort;
use crate::service::IndexEvent;
use crate::store::{FileMetaSnapshot, RecordMetadata, VectorRecord, VectorStore, PROCESSING_VERSION};
use crate::watcher::{ChangeKind, FileEvent};

/// Result of one reconciliation pass.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct SyncReport {
    pub processed: usize,
    pub skipped: usize,
    pub deleted: usize,
    pub failed: usize,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    Ingested { chunks: usize },
    Skipped,
    Unsupported,
}

pub struct Synchronizer {
    config: AppConfig,
    store: Arc<VectorStore>,
    embedder: Arc<dyn EmbeddingPort>,
    synthesizer: Option<Arc<ContextSynthesizer>>,
    events: broadcast::Sender<IndexEvent>,
    /// Per-fileId coalescing gate: at most one ingest per file is in
    /// flight; a concurrent request awaits the first and then no-ops via
    /// the change check.
    inflight: DashMap<String, Arc<Mutex<()>>>,
    /// Global ingest-concurrency limit.
    permits: Arc<Semaphore>,
    active: AtomicUsize,
}

struct ActiveGuard<'a>(&'a AtomicUsize);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Synchronizer {
    pub fn new(
        config: AppConfig,
        store: Arc<VectorStore>,
        embedder: Arc<dyn EmbeddingPort>,
        synthesizer: Option<Arc<ContextSynthesizer>>,
        events: broadcast::Sender<IndexEvent>,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.ingest_concurrency));
        Self {
            config,
            store,
            embedder,
            synthesizer,
            events,
            inflight: DashMap::new(),
            permits,
            active: AtomicUsize::new(0),
        }
    }

    /// Number of ingest tasks currently running, used by shutdown to
    /// bound its drain wait.
    pub fn active_ingests(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Reconcile the watched root with the store: ingest new and changed
    /// files, remove orphans, skip everything unchanged. A second pass
    /// over an unchanged tree performs zero writes.
    pub async fn sync_all(&self) -> AppResult<SyncReport> {
        let started = Instant::now();
        let _ = self.events.send(IndexEvent::SyncStarted);

        let stored = self.store.list_file_metadata();

        let root = self.config.documents_dir.clone();
        let data_dir = self.config.data_dir.clone();
        let max_depth = self.config.watcher_max_scan_depth;
        let metas = tokio::task::spawn_blocking(move || {
            let paths = scan_documents(&root, &data_dir, max_depth);
            extract_all(&paths)
        })
        .await
        .map_err(|e| AppError::Io(std::io::Error::other(e)))?;

        let on_disk_ids: HashSet<&str> = metas.iter().map(|m| m.file_id.as_str()).collect();

        // Orphans: stored file ids whose path no longer exists on disk.
        // The extra stat keeps transiently unreadable files alive.
        let mut deleted = 0usize;
        for (file_id, snapshot) in &stored {
            if on_disk_ids.contains(file_id.as_str()) {
                continue;
            }
            if std::fs::metadata(&snapshot.file_path).is_ok() {
                debug!(
                    path = %snapshot.file_path,
                    "file missing from scan but still present, retaining rows"
                );
                continue;
            }
            self.store.delete_by_file_id(file_id).await?;
            deleted += 1;
            let _ = self.events.send(IndexEvent::FileRemoved {
                file_id: file_id.clone(),
            });
        }

        let outcomes: Vec<AppResult<IngestOutcome>> = stream::iter(
            metas
                .into_iter()
                .map(|meta| async move { self.ingest_path(&meta.path).await }),
        )
        .buffer_unordered(self.config.ingest_concurrency)
        .collect()
        .await;

        let mut report = SyncReport {
            deleted,
            ..Default::default()
        };
        for outcome in outcomes {
            match outcome {
                Ok(IngestOutcome::Ingested { .. }) => report.processed += 1,
                Ok(IngestOutcome::Skipped) | Ok(IngestOutcome::Unsupported) => {
                    report.skipped += 1
                }
                Err(e) => {
                    // One failing file never aborts the pass.
                    warn!(error = %e, "file ingest failed, continuing sync");
                    report.failed += 1;
                }
            }
        }

        self.store.flush()?;
        report.duration_ms = started.elapsed().as_millis() as u64;
        let _ = self.events.send(IndexEvent::SyncCompleted {
            processed: report.processed,
            skipped: report.skipped,
            deleted: report.deleted,
            failed: report.failed,
            duration_ms: report.duration_ms,
        });

        info!(
            processed = report.processed,
            skipped = report.skipped,
            deleted = report.deleted,
            failed = report.failed,
            duration_ms = report.duration_ms,
            "sync complete"
        );
        Ok(report)
    }

    /// Ingest a single file: chunk, optionally synthesize context, embed,
    /// and replace the file's rows in the store. No-ops when the stored
    /// snapshot already matches the file on disk.
    pub async fn ingest_path(&self, path: &Path) -> AppResult<IngestOutcome> {
        let ext = path
            .extension()
            .unwrap_or_default()
            .to_string_lossy()
            .to_lowercase();
        if !is_supported_extension(&ext) {
            return Ok(IngestOutcome::Unsupported);
        }

        let file_id = metadata::file_id_for_path(path);
        let gate = self
            .inflight
            .entry(file_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone();
        let _gate = gate.lock().await;
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| AppError::Io(std::io::Error::other(e)))?;
        self.active.fetch_add(1, Ordering::SeqCst);
        let _active = ActiveGuard(&self.active);

        let meta = {
            let p = path.to_path_buf();
            tokio::task::spawn_blocking(move || metadata::extract(&p))
                .await
                .map_err(|e| AppError::Io(std::io::Error::other(e)))??
        };

        let stored = self.store.list_file_metadata();
        if !should_process(&meta, stored.get(&meta.file_id)) {
            return Ok(IngestOutcome::Skipped);
        }

        let params = ChunkParams {
            chunk_size: self.config.chunk_size,
            chunk_overlap: self.config.chunk_overlap,
            min_chunk_size: self.config.min_chunk_size,
        };
        let file_type = meta.file_type;
        let (text, chunks) = {
            let p = path.to_path_buf();
            tokio::task::spawn_blocking(move || -> AppResult<(String, Vec<TextChunk>)> {
                let text = metadata::read_text(&p)?;
                let chunks = chunker::chunk(&text, file_type, &params);
                Ok((text, chunks))
            })
            .await
            .map_err(|e| AppError::Io(std::io::Error::other(e)))??
        };

        if chunks.is_empty() {
            // The file emptied out; drop whatever was stored for it.
            self.store.delete_by_file_id(&meta.file_id).await?;
            let _ = self.events.send(IndexEvent::FileIngested {
                file_id: meta.file_id.clone(),
                path: meta.path.display().to_string(),
                chunks: 0,
            });
            return Ok(IngestOutcome::Ingested { chunks: 0 });
        }

        // Texts to embed: contextual text when synthesis produced one,
        // the raw chunk otherwise.
        let embed_texts: Vec<String> = match &self.synthesizer {
            Some(synth) => {
                let contexts = synth.synthesize_file(&text, &meta, &chunks).await;
                chunks
                    .iter()
                    .zip(contexts)
                    .map(|(c, ctx)| ctx.unwrap_or_else(|| c.content.clone()))
                    .collect()
            }
            None => chunks.iter().map(|c| c.content.clone()).collect(),
        };

        // Embed in batches; chunk order is preserved.
        let mut vectors = Vec::with_capacity(embed_texts.len());
        for batch in embed_texts.chunks(self.config.embedding_batch_size) {
            let embedded = with_deadline(
                "embedding.documents",
                self.config.deadlines.embedding(),
                self.embedder.embed_documents(batch),
            )
            .await?;
            vectors.extend(embedded);
        }

        let records = self.build_records(&meta, &chunks, vectors);
        let total = records.len();

        // Replace rather than merge: no straddling chunks from an earlier
        // version may remain.
        self.store.delete_by_file_id(&meta.file_id).await?;
        self.store.add(records).await?;

        let _ = self.events.send(IndexEvent::FileIngested {
            file_id: meta.file_id.clone(),
            path: meta.path.display().to_string(),
            chunks: total,
        });
        debug!(file = %meta.name, chunks = total, "file ingested");
        Ok(IngestOutcome::Ingested { chunks: total })
    }

    fn build_records(
        &self,
        meta: &FileMetadata,
        chunks: &[TextChunk],
        vectors: Vec<Vec<f32>>,
    ) -> Vec<VectorRecord> {
        let processed_at = chrono::Utc::now();
        let model_version = self.embedder.info().model;
        let total = chunks.len() as u32;

        chunks
            .iter()
            .zip(vectors)
            .enumerate()
            .map(|(index, (chunk, vector))| VectorRecord {
                id: metadata::chunk_id(&meta.file_id, index),
                vector,
                content: chunk.content.clone(),
                metadata: RecordMetadata {
                    file_id: meta.file_id.clone(),
                    file_name: meta.name.clone(),
                    file_path: meta.path.display().to_string(),
                    file_size: meta.size,
                    file_type: meta.file_type.to_string(),
                    file_hash: meta.hash.clone(),
                    chunk_index: index as u32,
                    total_chunks: total,
                    created_at: meta.created_at,
                    modified_at: meta.modified_at,
                    processed_at,
                    model_version: model_version.clone(),
                    processing_version: PROCESSING_VERSION.to_string(),
                    source_type: "local_file".to_string(),
                    status: "indexed".to_string(),
                },
            })
            .collect()
    }

    /// React to one debounced watcher event.
    pub async fn handle_event(&self, event: FileEvent) {
        match event.kind {
            ChangeKind::Added | ChangeKind::Changed => {
                let ingest: std::pin::Pin<
                    Box<dyn std::future::Future<Output = AppResult<IngestOutcome>> + Send + '_>,
                > = Box::pin(self.ingest_path(&event.path));
                if let Err(e) = ingest.await {
                    warn!(path = %event.path.display(), error = %e, "event ingest failed");
                }
            }
            ChangeKind::Deleted => {
                // Two-step check: only drop rows when the path is really
                // gone, not merely unreadable for a moment.
                if std::fs::metadata(&event.path).is_ok() {
                    debug!(path = %event.path.display(), "delete event but path exists, ignoring");
                    return;
                }
                let file_id = metadata::file_id_for_path(&event.path);
                match self.store.delete_by_file_id(&file_id).await {
                    Ok(removed) if removed > 0 => {
                        let _ = self.events.send(IndexEvent::FileRemoved { file_id });
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(path = %event.path.display(), error = %e, "delete failed");
                    }
                }
            }
        }
    }
}

/// Decide whether a file must be (re-)ingested given its stored snapshot.
/// Comparison order: content hash, then byte size, then mtime; a snapshot
/// missing comparison fields defaults to processing.
pub fn should_process(meta: &FileMetadata, stored: Option<&FileMetaSnapshot>) -> bool {
    let Some(snapshot) = stored else {
        return true;
    };
    if snapshot.file_hash.is_empty() {
        return true;
    }
    if snapshot.file_hash != meta.hash {
        return true;
    }
    if snapshot.file_size != meta.size {
        return true;
    }
    if snapshot.modified_at != meta.modified_at {
        return true;
    }
    false
}

/// Collect ingestible document paths under the root. Dotfiles and
/// dot-directories are skipped by the walker itself; the store's data
/// directory, tool caches, and symlinks are filtered here.
fn scan_documents(root: &Path, data_dir: &Path, max_depth: usize) -> Vec<PathBuf> {
    WalkBuilder::new(root)
        .max_depth(Some(max_depth))
        .follow_links(false)
        .build()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_some_and(|ft| ft.is_file()))
        .filter(|entry| !entry.path_is_symlink())
        .filter(|entry| !entry.path().starts_with(data_dir))
        .filter(|entry| !has_excluded_component(entry.path()))
        .filter(|entry| {
            let ext = entry
                .path()
                .extension()
                .unwrap_or_default()
                .to_string_lossy()
                .to_lowercase();
            is_supported_extension(&ext)
        })
        .map(|entry| entry.into_path())
        .collect()
}

fn has_excluded_component(path: &Path) -> bool {
    path.components().any(|c| {
        if let std::path::Component::Normal(name) = c {
            is_excluded_directory(&name.to_string_lossy())
        } else {
            false
        }
    })
}

/// Extract metadata for all scanned paths in parallel. Unreadable files
/// are skipped with a warning, never aborting the scan.
fn extract_all(paths: &[PathBuf]) -> Vec<FileMetadata> {
    paths
        .par_iter()
        .filter_map(|path| match metadata::extract(path) {
            Ok(meta) => Some(meta),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "skipping unreadable file");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn meta(hash: &str, size: u64, modified_at: chrono::DateTime<chrono::Utc>) -> FileMetadata {
        FileMetadata {
            file_id: "f".repeat(16),
            path: PathBuf::from("/docs/a.md"),
            name: "a.md".into(),
            size,
            file_type: crate::metadata::FileType::Markdown,
            hash: hash.to_string(),
            created_at: modified_at,
            modified_at,
        }
    }

    fn snapshot(hash: &str, size: u64, modified_at: chrono::DateTime<chrono::Utc>) -> FileMetaSnapshot {
        FileMetaSnapshot {
            file_id: "f".repeat(16),
            file_name: "a.md".into(),
            file_path: "/docs/a.md".into(),
            file_size: size,
            file_type: "markdown".into(),
            file_hash: hash.to_string(),
            created_at: modified_at,
            modified_at,
            processed_at: modified_at,
            chunk_count: 3,
        }
    }

    #[test]
    fn unknown_file_is_processed() {
        let now = Utc::now();
        assert!(should_process(&meta("h1", 10, now), None));
    }

    #[test]
    fn unchanged_file_is_skipped() {
        let now = Utc::now();
        let m = meta("h1", 10, now);
        let s = snapshot("h1", 10, now);
        assert!(!should_process(&m, Some(&s)));
    }

    #[test]
    fn hash_change_forces_processing() {
        let now = Utc::now();
        assert!(should_process(&meta("h2", 10, now), Some(&snapshot("h1", 10, now))));
    }

    #[test]
    fn size_change_forces_processing() {
        let now = Utc::now();
        assert!(should_process(&meta("h1", 11, now), Some(&snapshot("h1", 10, now))));
    }

    #[test]
    fn mtime_change_forces_processing() {
        let now = Utc::now();
        let later = now + chrono::Duration::seconds(5);
        assert!(should_process(&meta("h1", 10, later), Some(&snapshot("h1", 10, now))));
    }

    #[test]
    fn snapshot_without_hash_forces_processing() {
        let now = Utc::now();
        assert!(should_process(&meta("h1", 10, now), Some(&snapshot("", 10, now))));
    }

    #[test]
    fn scan_skips_hidden_and_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::write(root.join("note.md"), "hello").unwrap();
        std::fs::write(root.join(".hidden.md"), "hidden").unwrap();
        std::fs::write(root.join("binary.exe"), "nope").unwrap();
        std::fs::create_dir_all(root.join("node_modules")).unwrap();
        std::fs::write(root.join("node_modules").join("dep.md"), "dep").unwrap();

        let data_dir = root.join("data");
        std::fs::create_dir_all(&data_dir).unwrap();
        std::fs::write(data_dir.join("internal.json"), "{}").unwrap();

        let found = scan_documents(root, &data_dir, 20);
        assert_eq!(found.len(), 1);
        assert!(found[0].ends_with("note.md"));
    }
}
