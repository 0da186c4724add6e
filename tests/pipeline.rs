//! End-to-end scenarios driving the full ingestion and retrieval pipeline
//! through the coordinator, with the builtin embedder.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use docdex::config::{AppConfig, Deadlines};
use docdex::embedder::HashEmbedder;
use docdex::error::{AppError, AppResult};
use docdex::metadata;
use docdex::ports::{EmbedderInfo, EmbeddingPort};
use docdex::query::{SearchOptions, SearchType};
use docdex::service::CoordinatorService;

fn test_config(root: &Path, data: &Path) -> AppConfig {
    AppConfig {
        documents_dir: root.to_path_buf(),
        data_dir: data.to_path_buf(),
        chunk_size: 1000,
        chunk_overlap: 200,
        min_chunk_size: 200,
        similarity_top_k: 10,
        similarity_threshold: 0.0,
        semantic_weight: 0.7,
        embedding_service: "builtin".into(),
        embedding_model: "builtin".into(),
        contextual_chunking_model: String::new(),
        embedding_batch_size: 100,
        watcher_debounce_ms: 50,
        watcher_max_processing_queue: 100,
        watcher_max_scan_depth: 20,
        ingest_concurrency: 4,
        deadlines: Deadlines::default(),
    }
}

/// A debounce long enough that tests driving sync explicitly are not
/// raced by the watcher.
fn with_quiet_watcher(mut config: AppConfig) -> AppConfig {
    config.watcher_debounce_ms = 3_000;
    config
}

async fn start_service(config: AppConfig) -> Arc<CoordinatorService> {
    let embedder: Arc<dyn EmbeddingPort> = Arc::new(HashEmbedder::new("builtin".into()));
    CoordinatorService::initialize_with_ports(config, embedder, None)
        .await
        .expect("service init")
}

/// A markdown document of roughly 3,500 characters: a heading plus four
/// paragraphs of 870 characters each, with a unique marker word per
/// paragraph.
fn sample_markdown(markers: [&str; 4]) -> String {
    let mut doc = String::from("# Operations Handbook\n\n");
    let paragraphs: Vec<String> = markers
        .iter()
        .enumerate()
        .map(|(i, marker)| {
            let mut p = format!("Paragraph {} mentions {} early on. ", i, marker);
            while p.len() < 870 {
                p.push_str("Procedures are documented step by step for every operator. ");
            }
            p.truncate(870);
            p
        })
        .collect();
    doc.push_str(&paragraphs.join("\n\n"));
    doc
}

#[tokio::test]
async fn cold_start_on_empty_directory() {
    let root = tempfile::tempdir().unwrap();
    let data = tempfile::tempdir().unwrap();
    let service = start_service(test_config(root.path(), data.path())).await;

    let status = service.status();
    assert!(status.ready);
    assert_eq!(status.documents_count, 0);
    assert_eq!(status.chunks_count, 0);
    assert!(status.vector_store.dimensions > 0);
    assert!(status.supported_formats.contains(&".md".to_string()));

    service.shutdown().await;
}

#[tokio::test]
async fn markdown_file_produces_dense_bounded_chunks() {
    let root = tempfile::tempdir().unwrap();
    let data = tempfile::tempdir().unwrap();
    std::fs::write(
        root.path().join("handbook.md"),
        sample_markdown(["alphamarker", "betamarker", "gammamarker", "deltamarker"]),
    )
    .unwrap();

    let service = start_service(test_config(root.path(), data.path())).await;

    let status = service.status();
    assert_eq!(status.documents_count, 1);
    assert_eq!(status.chunks_count, 4);

    let results = service
        .search(
            "operator procedures",
            &SearchOptions {
                search_type: SearchType::Semantic,
                top_k: Some(10),
                score_threshold: Some(0.0),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let indices: HashSet<u32> = results.iter().map(|r| r.chunk_index).collect();
    assert_eq!(indices, HashSet::from([0, 1, 2, 3]));
    for r in &results {
        assert!(r.content.len() <= 2000);
        assert_eq!(r.metadata.total_chunks, 4);
    }
    let first = results.iter().find(|r| r.chunk_index == 0).unwrap();
    assert!(first.content.contains("# Operations Handbook"));

    service.shutdown().await;
}

#[tokio::test]
async fn in_place_edit_leaves_no_straddlers() {
    let root = tempfile::tempdir().unwrap();
    let data = tempfile::tempdir().unwrap();
    let path = root.path().join("handbook.md");
    std::fs::write(
        &path,
        sample_markdown(["alphamarker", "zebraoriginal", "gammamarker", "deltamarker"]),
    )
    .unwrap();

    let service =
        start_service(with_quiet_watcher(test_config(root.path(), data.path()))).await;
    assert_eq!(service.status().chunks_count, 4);

    // Change only the second paragraph.
    std::fs::write(
        &path,
        sample_markdown(["alphamarker", "zebrareplacement", "gammamarker", "deltamarker"]),
    )
    .unwrap();
    let report = service.force_reindex(false).await.unwrap();
    assert_eq!(report.processed, 1);

    // Row count equals the new chunk count; nothing from the old version
    // remains reachable.
    assert_eq!(service.status().chunks_count, 4);

    let lexical = |q: &'static str| {
        let service = service.clone();
        async move {
            service
                .search(
                    q,
                    &SearchOptions {
                        search_type: SearchType::Lexical,
                        score_threshold: Some(0.0),
                        ..Default::default()
                    },
                )
                .await
                .unwrap()
        }
    };

    let old_hits = lexical("zebraoriginal").await;
    assert!(
        old_hits.iter().all(|r| !r.content.contains("zebraoriginal")),
        "stale chunk content still retrievable"
    );
    let new_hits = lexical("zebrareplacement").await;
    assert!(new_hits.iter().any(|r| r.content.contains("zebrareplacement")));

    service.shutdown().await;
}

#[tokio::test]
async fn deleting_a_file_removes_all_of_its_rows() {
    let root = tempfile::tempdir().unwrap();
    let data = tempfile::tempdir().unwrap();
    let path = root.path().join("gone.md");
    std::fs::write(
        &path,
        sample_markdown(["alphamarker", "betamarker", "gammamarker", "uniquedeleted"]),
    )
    .unwrap();

    let service =
        start_service(with_quiet_watcher(test_config(root.path(), data.path()))).await;
    assert_eq!(service.status().documents_count, 1);

    std::fs::remove_file(&path).unwrap();
    let report = service.force_reindex(false).await.unwrap();
    assert_eq!(report.deleted, 1);

    let status = service.status();
    assert_eq!(status.documents_count, 0);
    assert_eq!(status.chunks_count, 0);

    let hits = service
        .search(
            "uniquedeleted",
            &SearchOptions {
                search_type: SearchType::Hybrid,
                score_threshold: Some(0.0),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(hits.iter().all(|r| !r.content.contains("uniquedeleted")));

    service.shutdown().await;
}

#[tokio::test]
async fn repeated_sync_is_idempotent() {
    let root = tempfile::tempdir().unwrap();
    let data = tempfile::tempdir().unwrap();
    std::fs::write(
        root.path().join("stable.md"),
        sample_markdown(["alphamarker", "betamarker", "gammamarker", "deltamarker"]),
    )
    .unwrap();

    let service = start_service(test_config(root.path(), data.path())).await;

    let report = service.force_reindex(false).await.unwrap();
    assert_eq!(report.processed, 0);
    assert_eq!(report.deleted, 0);
    assert_eq!(report.failed, 0);
    assert_eq!(report.skipped, 1);

    service.shutdown().await;
}

#[tokio::test]
async fn chunk_ids_are_stable_across_clean_reindexes() {
    let root = tempfile::tempdir().unwrap();
    let data = tempfile::tempdir().unwrap();
    let path = root.path().join("stable.md");
    std::fs::write(
        &path,
        sample_markdown(["alphamarker", "betamarker", "gammamarker", "deltamarker"]),
    )
    .unwrap();

    let service = start_service(test_config(root.path(), data.path())).await;

    let ids_of = |service: &Arc<CoordinatorService>| {
        let files = service.list_files();
        let file = &files[0];
        (0..file.chunk_count)
            .map(|i| metadata::chunk_id(&file.file_id, i))
            .collect::<HashSet<String>>()
    };

    let before = ids_of(&service);
    service.force_reindex(true).await.unwrap();
    let after = ids_of(&service);
    assert_eq!(before, after);

    service.shutdown().await;
}

#[tokio::test]
async fn hybrid_query_prefers_lexical_match_between_similar_rows() {
    let root = tempfile::tempdir().unwrap();
    let data = tempfile::tempdir().unwrap();
    // Two nearly identical documents; only one contains the query token.
    std::fs::write(
        root.path().join("a.md"),
        "The reactor design uses molten salt cooling with passive safety systems.",
    )
    .unwrap();
    std::fs::write(
        root.path().join("b.md"),
        "The reactor design uses molten salt cooling with zirconium cladding layers.",
    )
    .unwrap();

    let service = start_service(test_config(root.path(), data.path())).await;

    let results = service
        .search(
            "zirconium cladding",
            &SearchOptions {
                search_type: SearchType::Hybrid,
                score_threshold: Some(0.0),
                semantic_weight: Some(0.5),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert!(!results.is_empty());
    assert_eq!(results[0].metadata.file_name, "b.md");
    assert!(results[0].hybrid_score.is_some());

    service.shutdown().await;
}

#[tokio::test]
async fn lexical_results_carry_keyword_scores() {
    let root = tempfile::tempdir().unwrap();
    let data = tempfile::tempdir().unwrap();
    std::fs::write(
        root.path().join("notes.md"),
        "Deployment checklist: rotate credentials, verify backups, update runbooks.",
    )
    .unwrap();

    let service = start_service(test_config(root.path(), data.path())).await;

    let results = service
        .search(
            "deployment checklist",
            &SearchOptions {
                search_type: SearchType::Lexical,
                score_threshold: Some(0.0),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert!(!results.is_empty());
    assert!(results[0].keyword_score.is_some());
    assert!(results[0].semantic_score.is_none());

    service.shutdown().await;
}

#[tokio::test]
async fn file_type_filter_narrows_results() {
    let root = tempfile::tempdir().unwrap();
    let data = tempfile::tempdir().unwrap();
    std::fs::write(root.path().join("a.md"), "shared subject in markdown form").unwrap();
    std::fs::write(root.path().join("b.txt"), "shared subject in plain text form").unwrap();

    let service = start_service(test_config(root.path(), data.path())).await;

    let results = service
        .search(
            "shared subject",
            &SearchOptions {
                search_type: SearchType::Semantic,
                score_threshold: Some(0.0),
                file_types: Some(vec!["text".to_string()]),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert!(!results.is_empty());
    assert!(results.iter().all(|r| r.metadata.file_type == "text"));

    service.shutdown().await;
}

/// Embedder whose document path is slow enough to blow a tight deadline,
/// while the query path stays fast.
struct SlowDocEmbedder {
    inner: HashEmbedder,
}

#[async_trait]
impl EmbeddingPort for SlowDocEmbedder {
    async fn embed_query(&self, text: &str) -> AppResult<Vec<f32>> {
        self.inner.embed_query(text).await
    }

    async fn embed_documents(&self, texts: &[String]) -> AppResult<Vec<Vec<f32>>> {
        tokio::time::sleep(Duration::from_millis(200)).await;
        self.inner.embed_documents(texts).await
    }

    fn info(&self) -> EmbedderInfo {
        self.inner.info()
    }
}

#[tokio::test]
async fn slow_embedder_skips_file_but_search_stays_available() {
    let root = tempfile::tempdir().unwrap();
    let data = tempfile::tempdir().unwrap();
    std::fs::write(root.path().join("doc.md"), "content that will never embed").unwrap();

    let mut config = test_config(root.path(), data.path());
    config.deadlines.embedding_ms = 10;

    let embedder: Arc<dyn EmbeddingPort> = Arc::new(SlowDocEmbedder {
        inner: HashEmbedder::new("builtin".into()),
    });
    let service = CoordinatorService::initialize_with_ports(config, embedder, None)
        .await
        .expect("service init");

    // The startup sync already ran; the file failed per-file without
    // failing initialization.
    let status = service.status();
    assert!(status.ready);
    assert_eq!(status.chunks_count, 0);

    let report = service.force_reindex(false).await.unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(report.processed, 0);

    // Query embedding is fast, so search still answers (with no rows).
    let results = service
        .search(
            "anything",
            &SearchOptions {
                search_type: SearchType::Semantic,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(results.is_empty());

    service.shutdown().await;
}

#[tokio::test]
async fn direct_ingest_errors_on_unreadable_file() {
    let root = tempfile::tempdir().unwrap();
    let data = tempfile::tempdir().unwrap();
    let service = start_service(test_config(root.path(), data.path())).await;

    let missing = root.path().join("never-written.md");
    let err = service.ingest(&missing).await.unwrap_err();
    assert!(matches!(err, AppError::FileUnreadable { .. }));

    service.shutdown().await;
}

#[tokio::test]
async fn watcher_picks_up_new_files() {
    let root = tempfile::tempdir().unwrap();
    let data = tempfile::tempdir().unwrap();
    let service = start_service(test_config(root.path(), data.path())).await;
    assert_eq!(service.status().chunks_count, 0);

    std::fs::write(
        root.path().join("arrival.md"),
        "A fresh document about orchard irrigation schedules.",
    )
    .unwrap();

    let deadline = std::time::Instant::now() + Duration::from_secs(15);
    loop {
        if service.status().chunks_count > 0 {
            break;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "watcher never ingested the new file"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let results = service
        .search(
            "orchard irrigation",
            &SearchOptions {
                search_type: SearchType::Semantic,
                score_threshold: Some(0.0),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(!results.is_empty());

    service.shutdown().await;
}

#[tokio::test]
async fn index_survives_service_restart() {
    let root = tempfile::tempdir().unwrap();
    let data = tempfile::tempdir().unwrap();
    std::fs::write(
        root.path().join("kept.md"),
        "Persistent knowledge about beekeeping and hive maintenance.",
    )
    .unwrap();

    {
        let service = start_service(test_config(root.path(), data.path())).await;
        assert_eq!(service.status().documents_count, 1);
        service.shutdown().await;
    }

    let service = start_service(test_config(root.path(), data.path())).await;
    let status = service.status();
    assert_eq!(status.documents_count, 1);
    assert!(status.chunks_count > 0);

    // The restarted sync recognized the stored snapshot and rewrote nothing.
    let report = service.force_reindex(false).await.unwrap();
    assert_eq!(report.processed, 0);
    assert_eq!(report.skipped, 1);

    let results = service
        .search(
            "beekeeping hive",
            &SearchOptions {
                search_type: SearchType::Hybrid,
                score_threshold: Some(0.0),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(!results.is_empty());

    service.shutdown().await;
}

/// Generator that always answers with a fixed context sentence and counts
/// its invocations.
struct CountingGenerator {
    calls: std::sync::atomic::AtomicUsize,
}

#[async_trait]
impl docdex::ports::GeneratorPort for CountingGenerator {
    async fn generate(
        &self,
        _model: &str,
        _prompt: &str,
        _opts: &docdex::ports::GenerateOptions,
    ) -> AppResult<String> {
        self.calls
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok("Describes the maintenance workflow for the appliance.".to_string())
    }
}

#[tokio::test]
async fn context_synthesis_runs_during_ingest_but_content_stays_raw() {
    let root = tempfile::tempdir().unwrap();
    let data = tempfile::tempdir().unwrap();
    std::fs::write(
        root.path().join("manual.md"),
        "Clean the filter monthly. Replace the gasket when worn.",
    )
    .unwrap();

    let mut config = test_config(root.path(), data.path());
    config.contextual_chunking_model = "ctx-model".to_string();

    let generator = Arc::new(CountingGenerator {
        calls: std::sync::atomic::AtomicUsize::new(0),
    });
    let embedder: Arc<dyn EmbeddingPort> = Arc::new(HashEmbedder::new("builtin".into()));
    let service =
        CoordinatorService::initialize_with_ports(config, embedder, Some(generator.clone()))
            .await
            .expect("service init");

    assert!(generator.calls.load(std::sync::atomic::Ordering::SeqCst) >= 1);

    // Stored content is the raw chunk; the synthesized sentence only
    // influenced the embedding.
    let results = service
        .search(
            "filter gasket",
            &SearchOptions {
                search_type: SearchType::Lexical,
                score_threshold: Some(0.0),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(!results.is_empty());
    assert!(results[0].content.contains("Clean the filter monthly"));
    assert!(!results[0].content.contains("maintenance workflow"));

    service.shutdown().await;
}

#[tokio::test]
async fn sync_progress_events_are_broadcast() {
    use docdex::service::IndexEvent;

    let root = tempfile::tempdir().unwrap();
    let data = tempfile::tempdir().unwrap();
    std::fs::write(root.path().join("a.md"), "event payload document").unwrap();

    let service =
        start_service(with_quiet_watcher(test_config(root.path(), data.path()))).await;
    let mut events = service.subscribe();

    std::fs::write(root.path().join("b.md"), "second event payload document").unwrap();
    service.force_reindex(false).await.unwrap();

    let mut saw_started = false;
    let mut saw_ingested = false;
    let mut saw_completed = false;
    while let Ok(event) = events.try_recv() {
        match event {
            IndexEvent::SyncStarted => saw_started = true,
            IndexEvent::FileIngested { chunks, .. } => {
                assert!(chunks > 0);
                saw_ingested = true;
            }
            IndexEvent::SyncCompleted { processed, .. } => {
                assert_eq!(processed, 1);
                saw_completed = true;
            }
            _ => {}
        }
    }
    assert!(saw_started && saw_ingested && saw_completed);

    service.shutdown().await;
}

#[tokio::test]
async fn concurrent_ingests_of_one_file_coalesce() {
    let root = tempfile::tempdir().unwrap();
    let data = tempfile::tempdir().unwrap();
    let service =
        start_service(with_quiet_watcher(test_config(root.path(), data.path()))).await;

    let path = root.path().join("contended.md");
    std::fs::write(&path, "a document two callers race to ingest").unwrap();

    let (a, b) = tokio::join!(service.ingest(&path), service.ingest(&path));
    let outcomes = [a.unwrap(), b.unwrap()];

    use docdex::sync::IngestOutcome;
    let ingested = outcomes
        .iter()
        .filter(|o| matches!(o, IngestOutcome::Ingested { .. }))
        .count();
    let skipped = outcomes
        .iter()
        .filter(|o| matches!(o, IngestOutcome::Skipped))
        .count();
    assert_eq!(ingested, 1, "exactly one caller does the work");
    assert_eq!(skipped, 1, "the coalesced caller no-ops");
    assert_eq!(service.status().chunks_count, 1);

    service.shutdown().await;
}

#[tokio::test]
async fn metadata_filter_restricts_results_to_one_file() {
    let root = tempfile::tempdir().unwrap();
    let data = tempfile::tempdir().unwrap();
    let path_a = root.path().join("a.md");
    let path_b = root.path().join("b.md");
    std::fs::write(&path_a, "shared wording in document a").unwrap();
    std::fs::write(&path_b, "shared wording in document b").unwrap();

    let service = start_service(test_config(root.path(), data.path())).await;

    let files = service.list_files();
    let target = files.iter().find(|f| f.file_name == "b.md").unwrap();

    let mut filters = std::collections::HashMap::new();
    filters.insert("fileId".to_string(), target.file_id.clone());
    let results = service
        .search(
            "shared wording",
            &SearchOptions {
                search_type: SearchType::Semantic,
                score_threshold: Some(0.0),
                metadata_filters: filters,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert!(!results.is_empty());
    assert!(results.iter().all(|r| r.metadata.file_id == target.file_id));

    service.shutdown().await;
}

#[tokio::test]
async fn unsupported_files_are_ignored() {
    let root = tempfile::tempdir().unwrap();
    let data = tempfile::tempdir().unwrap();
    std::fs::write(root.path().join("image.png"), [0u8, 1, 2, 3]).unwrap();
    std::fs::write(root.path().join("real.md"), "actual document body").unwrap();

    let service = start_service(test_config(root.path(), data.path())).await;
    assert_eq!(service.status().documents_count, 1);

    service.shutdown().await;
}
