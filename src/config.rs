use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};

/// Maximum allowed length for search queries (characters).
pub const MAX_SEARCH_QUERY_LENGTH: usize = 1000;

/// Canonical list of document extensions the engine ingests (without the
/// leading dot, lowercase). The directory scanner, the file watcher, and
/// the synchronizer all use this single list so they never diverge.
pub const SUPPORTED_EXTENSIONS: &[&str] = &[
    "txt", "md", "pdf", "docx", "doc", "rtf", "csv", "json", "xml", "html",
];

/// Check whether a file extension (without leading dot, lowercase) is in
/// the shared supported-extensions list.
pub fn is_supported_extension(ext: &str) -> bool {
    SUPPORTED_EXTENSIONS.contains(&ext)
}

/// Directory names that are never descended into during scans. These cover
/// tool caches and store internals even when no ignore file is present.
pub fn is_excluded_directory(name: &str) -> bool {
    matches!(
        name,
        "node_modules"
            | ".git"
            | "target"
            | "dist"
            | "build"
            | "out"
            | "__pycache__"
            | ".cache"
            | "vendor"
            | ".vscode"
            | ".idea"
            | "logs"
    )
}

/// Deadlines for external calls and store operations. All configurable;
/// exceeding one raises `OperationTimeout`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Deadlines {
    pub connect_ms: u64,
    pub read_ms: u64,
    pub embedding_ms: u64,
    pub search_ms: u64,
}

impl Default for Deadlines {
    fn default() -> Self {
        Self {
            connect_ms: 30_000,
            read_ms: 60_000,
            embedding_ms: 15_000,
            search_ms: 30_000,
        }
    }
}

impl Deadlines {
    pub fn connect(&self) -> Duration {
        Duration::from_millis(self.connect_ms)
    }
    pub fn read(&self) -> Duration {
        Duration::from_millis(self.read_ms)
    }
    pub fn embedding(&self) -> Duration {
        Duration::from_millis(self.embedding_ms)
    }
    pub fn search(&self) -> Duration {
        Duration::from_millis(self.search_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Watched root directory.
    pub documents_dir: PathBuf,
    /// Store and index data live under this directory.
    pub data_dir: PathBuf,

    /// Target chunk length in characters.
    pub chunk_size: usize,
    /// Overlap between adjacent chunks in characters.
    pub chunk_overlap: usize,
    /// Chunks below this length are merged with a neighbor.
    pub min_chunk_size: usize,

    /// Default `topK` for search.
    pub similarity_top_k: usize,
    /// Default `scoreThreshold` for search.
    pub similarity_threshold: f32,
    /// Weight given to the semantic strategy during hybrid fusion.
    pub semantic_weight: f32,

    /// Selects the embedder implementation ("builtin" or "ollama").
    pub embedding_service: String,
    /// Model name passed to the embedding service.
    pub embedding_model: String,
    /// Model passed to the generator port for context synthesis.
    /// Empty disables synthesis entirely.
    pub contextual_chunking_model: String,
    /// Batch size for store writes.
    pub embedding_batch_size: usize,

    /// Debounce window for filesystem events.
    pub watcher_debounce_ms: u64,
    /// Bounded in-flight watcher queue; newest events are shed when full.
    pub watcher_max_processing_queue: usize,
    /// Maximum directory depth during scans.
    pub watcher_max_scan_depth: usize,

    /// Global limit on concurrent file ingests.
    pub ingest_concurrency: usize,

    pub deadlines: Deadlines,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let documents_dir = std::env::var("DOCDEX_DOCUMENTS_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));

        let data_dir = std::env::var("DOCDEX_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                dirs::data_local_dir()
                    .map(|d| d.join("docdex"))
                    .unwrap_or_else(|| PathBuf::from(".docdex-data"))
            });

        let mut deadlines = Deadlines::default();
        if let Some(v) = env_parse("DOCDEX_CONNECT_TIMEOUT_MS") {
            deadlines.connect_ms = v;
        }
        if let Some(v) = env_parse("DOCDEX_READ_TIMEOUT_MS") {
            deadlines.read_ms = v;
        }
        if let Some(v) = env_parse("DOCDEX_EMBEDDING_TIMEOUT_MS") {
            deadlines.embedding_ms = v;
        }
        if let Some(v) = env_parse("DOCDEX_SEARCH_TIMEOUT_MS") {
            deadlines.search_ms = v;
        }

        Self {
            documents_dir,
            data_dir,
            chunk_size: env_parse("DOCDEX_CHUNK_SIZE").unwrap_or(1000),
            chunk_overlap: env_parse("DOCDEX_CHUNK_OVERLAP").unwrap_or(200),
            min_chunk_size: env_parse("DOCDEX_MIN_CHUNK_SIZE").unwrap_or(200),
            similarity_top_k: env_parse("DOCDEX_SIMILARITY_TOP_K").unwrap_or(10),
            similarity_threshold: env_parse("DOCDEX_SIMILARITY_THRESHOLD").unwrap_or(0.1),
            semantic_weight: env_parse("DOCDEX_SEMANTIC_WEIGHT").unwrap_or(0.7),
            embedding_service: std::env::var("DOCDEX_EMBEDDING_SERVICE")
                .unwrap_or_else(|_| "builtin".to_string()),
            embedding_model: std::env::var("DOCDEX_EMBEDDING_MODEL")
                .unwrap_or_else(|_| "nomic-embed-text".to_string()),
            contextual_chunking_model: std::env::var("DOCDEX_CONTEXT_MODEL")
                .unwrap_or_default(),
            embedding_batch_size: env_parse("DOCDEX_EMBEDDING_BATCH_SIZE").unwrap_or(100),
            watcher_debounce_ms: env_parse("DOCDEX_WATCHER_DEBOUNCE_MS").unwrap_or(200),
            watcher_max_processing_queue: env_parse("DOCDEX_WATCHER_MAX_QUEUE").unwrap_or(1000),
            watcher_max_scan_depth: env_parse("DOCDEX_WATCHER_MAX_SCAN_DEPTH").unwrap_or(20),
            ingest_concurrency: env_parse("DOCDEX_INGEST_CONCURRENCY").unwrap_or(4),
            deadlines,
        }
    }

    /// Validate the configuration at startup. A bad configuration aborts
    /// initialization.
    pub fn validate(&self) -> AppResult<()> {
        if self.chunk_size == 0 {
            return Err(AppError::ConfigInvalid("chunk_size must be > 0".into()));
        }
        if self.chunk_overlap >= self.chunk_size {
            return Err(AppError::ConfigInvalid(format!(
                "chunk_overlap ({}) must be smaller than chunk_size ({})",
                self.chunk_overlap, self.chunk_size
            )));
        }
        if self.min_chunk_size > self.chunk_size {
            return Err(AppError::ConfigInvalid(format!(
                "min_chunk_size ({}) must not exceed chunk_size ({})",
                self.min_chunk_size, self.chunk_size
            )));
        }
        if self.similarity_top_k == 0 {
            return Err(AppError::ConfigInvalid("similarity_top_k must be > 0".into()));
        }
        if !(0.0..=1.0).contains(&self.similarity_threshold) {
            return Err(AppError::ConfigInvalid(format!(
                "similarity_threshold ({}) must be within [0, 1]",
                self.similarity_threshold
            )));
        }
        if !(0.0..=1.0).contains(&self.semantic_weight) {
            return Err(AppError::ConfigInvalid(format!(
                "semantic_weight ({}) must be within [0, 1]",
                self.semantic_weight
            )));
        }
        if self.embedding_batch_size == 0 {
            return Err(AppError::ConfigInvalid(
                "embedding_batch_size must be > 0".into(),
            ));
        }
        if self.ingest_concurrency == 0 {
            return Err(AppError::ConfigInvalid(
                "ingest_concurrency must be > 0".into(),
            ));
        }
        match self.embedding_service.as_str() {
            "builtin" | "ollama" => {}
            other => {
                return Err(AppError::ConfigInvalid(format!(
                    "unknown embedding_service '{}'",
                    other
                )));
            }
        }
        Ok(())
    }

    /// Whether per-chunk context synthesis is enabled.
    pub fn context_synthesis_enabled(&self) -> bool {
        !self.contextual_chunking_model.is_empty()
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
