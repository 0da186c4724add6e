//! Embedder and generator implementations behind the ports.
//!
//! Two embedding services ship with the engine:
//! - `builtin`: a deterministic feature-hashing embedder that needs no
//!   model download or network. Default, and the one the test suite uses.
//! - `ollama`: HTTP client for an Ollama-compatible server (`/api/embed`,
//!   `/api/generate`, non-streaming).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

use crate::config::AppConfig;
use crate::error::{AppError, AppResult};
use crate::ports::{EmbedderInfo, EmbeddingPort, GenerateOptions, GeneratorPort};

/// Build the embedder selected by `embedding_service`.
pub async fn build_embedder(config: &AppConfig) -> AppResult<Arc<dyn EmbeddingPort>> {
    match config.embedding_service.as_str() {
        "builtin" => Ok(Arc::new(HashEmbedder::new(config.embedding_model.clone()))),
        "ollama" => {
            let base_url = std::env::var("DOCDEX_OLLAMA_URL")
                .unwrap_or_else(|_| "http://localhost:11434".to_string());
            let embedder = OllamaEmbedder::connect(
                base_url,
                config.embedding_model.clone(),
                config.deadlines.connect(),
                config.deadlines.embedding(),
            )
            .await?;
            Ok(Arc::new(embedder))
        }
        other => Err(AppError::ConfigInvalid(format!(
            "unknown embedding_service '{}'",
            other
        ))),
    }
}

/// Build the generator used for context synthesis, if one is configured.
pub fn build_generator(config: &AppConfig) -> Option<Arc<dyn GeneratorPort>> {
    if !config.context_synthesis_enabled() {
        return None;
    }
    let base_url = std::env::var("DOCDEX_OLLAMA_URL")
        .unwrap_or_else(|_| "http://localhost:11434".to_string());
    Some(Arc::new(OllamaGenerator::new(
        base_url,
        config.deadlines.read(),
    )))
}

// ---------------------------------------------------------------------------
// Builtin feature-hashing embedder
// ---------------------------------------------------------------------------

/// Embedding dimension of the builtin embedder.
const HASH_DIM: usize = 256;

/// Token budget the builtin embedder advertises. Large enough that the
/// context synthesizer's budget math behaves like it would against a real
/// model.
const HASH_MAX_TOKENS: usize = 8192;

/// Deterministic embedder: word and character-trigram features hashed into
/// a fixed-dimension vector, L2-normalized. Stable across processes and
/// restarts, which the persisted store relies on.
pub struct HashEmbedder {
    model: String,
}

impl HashEmbedder {
    pub fn new(model: String) -> Self {
        Self { model }
    }

    fn embed_one(text: &str) -> Vec<f32> {
        let mut vec = vec![0.0f32; HASH_DIM];
        let lowered = text.to_lowercase();

        for word in lowered.split(|c: char| !c.is_alphanumeric()) {
            if word.len() < 2 {
                continue;
            }
            bump(&mut vec, word, 1.0);
            let chars: Vec<char> = word.chars().collect();
            for window in chars.windows(3) {
                let tri: String = window.iter().collect();
                bump(&mut vec, &tri, 0.5);
            }
        }

        let norm = vec.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vec {
                *v /= norm;
            }
        }
        vec
    }
}

fn bump(vec: &mut [f32], feature: &str, weight: f32) {
    let h = fnv1a(feature.as_bytes());
    let idx = (h % vec.len() as u64) as usize;
    let sign = if (h >> 32) & 1 == 0 { 1.0 } else { -1.0 };
    vec[idx] += sign * weight;
}

/// FNV-1a; stable across platforms and releases, unlike the std hasher.
fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in bytes {
        hash ^= *b as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

#[async_trait]
impl EmbeddingPort for HashEmbedder {
    async fn embed_query(&self, text: &str) -> AppResult<Vec<f32>> {
        Ok(Self::embed_one(text))
    }

    async fn embed_documents(&self, texts: &[String]) -> AppResult<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| Self::embed_one(t)).collect())
    }

    fn info(&self) -> EmbedderInfo {
        EmbedderInfo {
            service: "builtin".to_string(),
            model: self.model.clone(),
            dimensions: HASH_DIM,
            max_tokens: HASH_MAX_TOKENS,
        }
    }
}

// ---------------------------------------------------------------------------
// Ollama HTTP embedder
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct OllamaEmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

pub struct OllamaEmbedder {
    client: reqwest::Client,
    base_url: String,
    model: String,
    dimensions: usize,
    max_tokens: usize,
}

impl OllamaEmbedder {
    /// Connect to an Ollama-compatible server and probe the model once to
    /// learn its embedding dimension.
    pub async fn connect(
        base_url: String,
        model: String,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> AppResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(request_timeout)
            .build()
            .map_err(|e| AppError::EmbeddingFailure(format!("http client: {}", e)))?;

        let mut embedder = Self {
            client,
            base_url,
            model,
            dimensions: 0,
            max_tokens: 8192,
        };

        let probe = embedder.request(&["dimension probe".to_string()]).await?;
        let dims = probe
            .first()
            .map(|v| v.len())
            .filter(|d| *d > 0)
            .ok_or_else(|| {
                AppError::EmbeddingFailure("probe returned no embedding".to_string())
            })?;
        embedder.dimensions = dims;

        info!(
            model = %embedder.model,
            dimensions = dims,
            "Connected to Ollama embedder"
        );
        Ok(embedder)
    }

    async fn request(&self, texts: &[String]) -> AppResult<Vec<Vec<f32>>> {
        let url = format!("{}/api/embed", self.base_url.trim_end_matches('/'));
        let body = json!({ "model": self.model, "input": texts });

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| AppError::EmbeddingFailure(e.to_string()))?;

        if !response.status().is_success() {
            return Err(AppError::EmbeddingFailure(format!(
                "embed request returned {}",
                response.status()
            )));
        }

        let parsed: OllamaEmbedResponse = response
            .json()
            .await
            .map_err(|e| AppError::EmbeddingFailure(e.to_string()))?;

        if parsed.embeddings.len() != texts.len() {
            return Err(AppError::EmbeddingFailure(format!(
                "embed count mismatch: asked {}, got {}",
                texts.len(),
                parsed.embeddings.len()
            )));
        }
        Ok(parsed.embeddings)
    }
}

#[async_trait]
impl EmbeddingPort for OllamaEmbedder {
    async fn embed_query(&self, text: &str) -> AppResult<Vec<f32>> {
        let mut vectors = self.request(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| AppError::EmbeddingFailure("empty embed response".to_string()))
    }

    async fn embed_documents(&self, texts: &[String]) -> AppResult<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        self.request(texts).await
    }

    fn info(&self) -> EmbedderInfo {
        EmbedderInfo {
            service: "ollama".to_string(),
            model: self.model.clone(),
            dimensions: self.dimensions,
            max_tokens: self.max_tokens,
        }
    }
}

// ---------------------------------------------------------------------------
// Ollama HTTP generator
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct OllamaGenerateResponse {
    response: String,
}

pub struct OllamaGenerator {
    client: reqwest::Client,
    base_url: String,
}

impl OllamaGenerator {
    pub fn new(base_url: String, request_timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .unwrap_or_default();
        Self { client, base_url }
    }
}

#[async_trait]
impl GeneratorPort for OllamaGenerator {
    async fn generate(
        &self,
        model: &str,
        prompt: &str,
        opts: &GenerateOptions,
    ) -> AppResult<String> {
        let url = format!("{}/api/generate", self.base_url.trim_end_matches('/'));
        let mut options = json!({
            "temperature": opts.temperature,
            "top_p": opts.top_p,
        });
        if let Some(n) = opts.num_predict {
            options["num_predict"] = json!(n);
        }
        let body = json!({
            "model": model,
            "prompt": prompt,
            "stream": false,
            "options": options,
        });

        debug!(model, prompt_len = prompt.len(), "generate request");

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| AppError::GeneratorFailure(e.to_string()))?;

        if !response.status().is_success() {
            return Err(AppError::GeneratorFailure(format!(
                "generate request returned {}",
                response.status()
            )));
        }

        let parsed: OllamaGenerateResponse = response
            .json()
            .await
            .map_err(|e| AppError::GeneratorFailure(e.to_string()))?;
        Ok(parsed.response)
    }
}
