//! Public façade over the engine.
//!
//! Owns every component and the lifecycle: wire ports, open the store
//! (which warms the embedder), register the watcher, run the startup
//! sync, then report ready. All external entry points go through here.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::{AppConfig, SUPPORTED_EXTENSIONS};
use crate::context::ContextSynthesizer;
use crate::embedder::{build_embedder, build_generator};
use crate::error::AppResult;
use crate::ports::{EmbeddingPort, GeneratorPort};
use crate::query::{QueryDefaults, QueryPipeline, SearchOptions, SearchResult};
use crate::store::{FileMetaSnapshot, VectorStore};
use crate::sync::{IngestOutcome, SyncReport, Synchronizer};
use crate::watcher::FileWatcher;

/// Progress events broadcast to whoever subscribes (a host process, the
/// test suite). Senders never block; lagging receivers just miss events.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data")]
pub enum IndexEvent {
    #[serde(rename = "sync_started")]
    SyncStarted,
    #[serde(rename = "file_ingested")]
    FileIngested {
        file_id: String,
        path: String,
        chunks: usize,
    },
    #[serde(rename = "file_removed")]
    FileRemoved { file_id: String },
    #[serde(rename = "sync_complete")]
    SyncCompleted {
        processed: usize,
        skipped: usize,
        deleted: usize,
        failed: usize,
        duration_ms: u64,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VectorStoreStatus {
    pub count: usize,
    pub dimensions: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusConfig {
    pub documents_dir: String,
    pub embedding_service: String,
    pub chunk_size: usize,
    pub similarity_top_k: usize,
}

/// Public status shape.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub ready: bool,
    pub documents_count: usize,
    pub chunks_count: usize,
    pub vector_store: VectorStoreStatus,
    pub config: StatusConfig,
    pub supported_formats: Vec<String>,
}

pub struct CoordinatorService {
    config: AppConfig,
    store: Arc<VectorStore>,
    pipeline: QueryPipeline,
    synchronizer: Arc<Synchronizer>,
    event_tx: broadcast::Sender<IndexEvent>,
    ready: AtomicBool,
    watcher: Mutex<Option<FileWatcher>>,
    watcher_task: Mutex<Option<JoinHandle<()>>>,
}

impl CoordinatorService {
    /// Build ports from configuration and initialize.
    pub async fn initialize(config: AppConfig) -> AppResult<Arc<Self>> {
        config.validate()?;
        let embedder = build_embedder(&config).await?;
        let generator = build_generator(&config);
        Self::initialize_with_ports(config, embedder, generator).await
    }

    /// Initialize with injected ports. Lifecycle: open store (warms the
    /// embedder), register the watcher, run the startup sync, ready.
    pub async fn initialize_with_ports(
        mut config: AppConfig,
        embedder: Arc<dyn EmbeddingPort>,
        generator: Option<Arc<dyn GeneratorPort>>,
    ) -> AppResult<Arc<Self>> {
        config.validate()?;
        std::fs::create_dir_all(&config.data_dir)?;
        std::fs::create_dir_all(&config.documents_dir)?;
        if let Ok(canonical) = dunce::canonicalize(&config.documents_dir) {
            config.documents_dir = canonical;
        }

        let store = Arc::new(
            VectorStore::open(
                &config.data_dir,
                embedder.as_ref(),
                config.embedding_batch_size,
                config.deadlines,
            )
            .await?,
        );

        let (event_tx, _) = broadcast::channel(1024);

        let synthesizer = generator.map(|g| {
            Arc::new(ContextSynthesizer::new(
                g,
                config.contextual_chunking_model.clone(),
                embedder.info().max_tokens,
            ))
        });

        let synchronizer = Arc::new(Synchronizer::new(
            config.clone(),
            store.clone(),
            embedder.clone(),
            synthesizer,
            event_tx.clone(),
        ));

        let pipeline = QueryPipeline::new(
            store.clone(),
            embedder.clone(),
            QueryDefaults {
                top_k: config.similarity_top_k,
                score_threshold: config.similarity_threshold,
                semantic_weight: config.semantic_weight,
            },
            config.deadlines,
        );

        let service = Arc::new(Self {
            config,
            store,
            pipeline,
            synchronizer,
            event_tx,
            ready: AtomicBool::new(false),
            watcher: Mutex::new(None),
            watcher_task: Mutex::new(None),
        });

        let (watcher, mut events) = FileWatcher::start(
            &service.config.documents_dir,
            &service.config.data_dir,
            Duration::from_millis(service.config.watcher_debounce_ms),
            service.config.watcher_max_processing_queue,
        )?;
        *service.watcher.lock() = Some(watcher);

        let sync_for_events = service.synchronizer.clone();
        let task = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                sync_for_events.handle_event(event).await;
            }
        });
        *service.watcher_task.lock() = Some(task);

        service.synchronizer.sync_all().await?;
        service.ready.store(true, Ordering::SeqCst);
        info!(
            documents_dir = %service.config.documents_dir.display(),
            "coordinator ready"
        );
        Ok(service)
    }

    /// Ingest one file immediately, bypassing the watcher.
    pub async fn ingest(&self, path: &std::path::Path) -> AppResult<IngestOutcome> {
        self.synchronizer.ingest_path(path).await
    }

    pub async fn search(
        &self,
        query: &str,
        opts: &SearchOptions,
    ) -> AppResult<Vec<SearchResult>> {
        self.pipeline.search(query, opts).await
    }

    /// Per-file snapshots sorted by file name.
    pub fn list_files(&self) -> Vec<FileMetaSnapshot> {
        let mut files: Vec<FileMetaSnapshot> =
            self.store.list_file_metadata().into_values().collect();
        files.sort_by(|a, b| a.file_name.cmp(&b.file_name));
        files
    }

    /// Run a full reconciliation pass; with `clear_cache` the store is
    /// truncated first so every file re-ingests from scratch.
    pub async fn force_reindex(&self, clear_cache: bool) -> AppResult<SyncReport> {
        if clear_cache {
            self.store.delete_all().await?;
        }
        self.synchronizer.sync_all().await
    }

    pub fn status(&self) -> StatusReport {
        let stats = self.store.stats();
        StatusReport {
            ready: self.ready.load(Ordering::SeqCst),
            documents_count: stats.documents,
            chunks_count: stats.count,
            vector_store: VectorStoreStatus {
                count: stats.count,
                dimensions: stats.dimensions,
            },
            config: StatusConfig {
                documents_dir: self.config.documents_dir.display().to_string(),
                embedding_service: self.config.embedding_service.clone(),
                chunk_size: self.config.chunk_size,
                similarity_top_k: self.config.similarity_top_k,
            },
            supported_formats: SUPPORTED_EXTENSIONS
                .iter()
                .map(|e| format!(".{}", e))
                .collect(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<IndexEvent> {
        self.event_tx.subscribe()
    }

    /// Stop the watcher, drain in-flight ingests (bounded wait), and
    /// flush the store.
    pub async fn shutdown(&self) {
        self.ready.store(false, Ordering::SeqCst);

        // Dropping the debouncer closes the event channel, which ends the
        // forwarding task.
        let watcher = self.watcher.lock().take();
        drop(watcher);
        let task = self.watcher_task.lock().take();
        if let Some(mut task) = task {
            if tokio::time::timeout(Duration::from_secs(5), &mut task)
                .await
                .is_err()
            {
                task.abort();
            }
        }

        let drain_deadline = std::time::Instant::now() + Duration::from_secs(10);
        while self.synchronizer.active_ingests() > 0 {
            if std::time::Instant::now() >= drain_deadline {
                warn!(
                    active = self.synchronizer.active_ingests(),
                    "shutdown drain deadline reached with ingests still active"
                );
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        if let Err(e) = self.store.flush() {
            warn!(error = %e, "final store flush failed");
        }
        info!("coordinator shut down");
    }
}
