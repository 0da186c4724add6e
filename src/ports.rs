//! Narrow ports over the external model backends.
//!
//! The core never talks to a transport directly: everything goes through
//! [`EmbeddingPort`] and [`GeneratorPort`] so implementations can be
//! swapped or mocked. Vectors come back raw; normalization and storage
//! belong to the vector store.

use async_trait::async_trait;
use serde::Serialize;

use crate::error::AppResult;

/// Static description of an embedder implementation.
#[derive(Debug, Clone, Serialize)]
pub struct EmbedderInfo {
    pub service: String,
    pub model: String,
    pub dimensions: usize,
    pub max_tokens: usize,
}

/// Dense fixed-dimension text embedder.
#[async_trait]
pub trait EmbeddingPort: Send + Sync {
    async fn embed_query(&self, text: &str) -> AppResult<Vec<f32>>;
    async fn embed_documents(&self, texts: &[String]) -> AppResult<Vec<Vec<f32>>>;
    fn info(&self) -> EmbedderInfo;
}

/// Sampling options forwarded to the text-generation backend.
#[derive(Debug, Clone, Copy)]
pub struct GenerateOptions {
    pub temperature: f32,
    pub top_p: f32,
    pub num_predict: Option<u32>,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            temperature: 0.1,
            top_p: 0.8,
            num_predict: None,
        }
    }
}

/// Non-streaming text generation.
#[async_trait]
pub trait GeneratorPort: Send + Sync {
    async fn generate(
        &self,
        model: &str,
        prompt: &str,
        opts: &GenerateOptions,
    ) -> AppResult<String>;
}

/// Warm the embedder with one single call and one 3-element batch call.
/// Run once at store open so the first real ingest does not pay model
/// spin-up latency.
pub async fn warm_up(embedder: &dyn EmbeddingPort) -> AppResult<()> {
    embedder.embed_query("warm-up").await?;
    embedder
        .embed_documents(&[
            "warm-up one".to_string(),
            "warm-up two".to_string(),
            "warm-up three".to_string(),
        ])
        .await?;
    Ok(())
}
