//! Optional per-chunk context synthesis.
//!
//! Before embedding, each chunk can be prefixed with a one-sentence
//! description produced by the generator port, improving retrieval of
//! fragments that depend on surrounding context. Synthesis is strictly
//! best-effort: every failure path falls back to a deterministic context
//! and never aborts ingest.

use std::sync::Arc;
use std::sync::LazyLock;

use futures_util::stream::{self, StreamExt};
use regex::Regex;
use tracing::{debug, warn};

use crate::chunker::TextChunk;
use crate::metadata::FileMetadata;
use crate::ports::{GenerateOptions, GeneratorPort};

/// Chunks synthesized concurrently within one file.
const SYNTHESIS_BATCH: usize = 5;

/// Below this context target (tokens) synthesis is skipped entirely.
const MIN_CONTEXT_TOKENS: usize = 20;

/// Document excerpt length (chars) handed to the generator prompt.
const DOCUMENT_EXCERPT_CHARS: usize = 8000;

/// Conservative token estimate: `ceil(chars / 3)`, an upper bound that
/// also covers CJK-heavy text.
pub fn token_estimate(text: &str) -> usize {
    text.chars().count().div_ceil(3)
}

pub struct ContextSynthesizer {
    generator: Arc<dyn GeneratorPort>,
    model: String,
    /// The embedder's declared token ceiling M.
    max_tokens: usize,
}

impl ContextSynthesizer {
    pub fn new(generator: Arc<dyn GeneratorPort>, model: String, max_tokens: usize) -> Self {
        Self {
            generator,
            model,
            max_tokens,
        }
    }

    /// Produce the text to embed for every chunk of one file, in chunk
    /// order. `Some(text)` is the contextual text (`context + "\n\n" +
    /// content`); `None` means the chunk must be embedded raw because the
    /// combined text would exceed the embedder's ceiling.
    pub async fn synthesize_file(
        &self,
        document: &str,
        meta: &FileMetadata,
        chunks: &[TextChunk],
    ) -> Vec<Option<String>> {
        let excerpt = excerpt(document, DOCUMENT_EXCERPT_CHARS);
        stream::iter(chunks.iter().map(|c| self.synthesize_chunk(&excerpt, meta, c)))
            .buffered(SYNTHESIS_BATCH)
            .collect()
            .await
    }

    async fn synthesize_chunk(
        &self,
        document_excerpt: &str,
        meta: &FileMetadata,
        chunk: &TextChunk,
    ) -> Option<String> {
        let safety = self.max_tokens / 10;
        let context_budget = self.max_tokens / 5;
        let available = self
            .max_tokens
            .saturating_sub(token_estimate(&chunk.content))
            .saturating_sub(safety);
        let target = context_budget.min(available);

        let context = if target < MIN_CONTEXT_TOKENS {
            debug!(
                file = %meta.name,
                target,
                "context budget too small, using static fallback"
            );
            format!("[Content from {} file]", meta.file_type)
        } else {
            match self.generate_context(document_excerpt, chunk, target).await {
                Ok(text) => text,
                Err(e) => {
                    warn!(file = %meta.name, error = %e, "context synthesis failed, falling back");
                    file_level_fallback(meta, document_excerpt)
                }
            }
        };

        let contextual = format!("{}\n\n{}", context, chunk.content);
        if token_estimate(&contextual) > self.max_tokens {
            // Downgrade: the caller embeds the raw chunk content instead.
            return None;
        }
        Some(contextual)
    }

    async fn generate_context(
        &self,
        document_excerpt: &str,
        chunk: &TextChunk,
        target: usize,
    ) -> crate::error::AppResult<String> {
        let prompt = format!(
            "<document>\n{}\n</document>\n\nHere is the chunk we want to situate within the whole document:\n<chunk>\n{}\n</chunk>\n\nWrite one short sentence describing what this chunk covers and how it relates to the document. Answer with the sentence only.",
            document_excerpt, chunk.content
        );

        let opts = GenerateOptions {
            temperature: 0.1,
            top_p: 0.8,
            num_predict: Some((target as f32 * 1.2) as u32),
        };

        let raw = self.generator.generate(&self.model, &prompt, &opts).await?;
        Ok(clean_response(&raw, target))
    }
}

/// Deterministic file-level context used whenever the generator fails.
fn file_level_fallback(meta: &FileMetadata, document_excerpt: &str) -> String {
    format!(
        "Content extracted from {} ({}). Starts with: \"{}\"",
        meta.name,
        meta.file_type,
        excerpt(document_excerpt, 200).trim()
    )
}

fn excerpt(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    text.chars().take(max_chars).collect()
}

static THINK_SPANS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<think>.*?</think>").unwrap());
static LEADING_LABEL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(description|answer|context|summary|response|sentence)\s*:\s*").unwrap()
});
static BLANK_RUNS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n{3,}").unwrap());

/// Clean a generator response: strip reasoning spans and leading labels,
/// collapse blank lines, and truncate to the token target at the nearest
/// sentence boundary (hard cut with an ellipsis when none fits).
fn clean_response(raw: &str, target_tokens: usize) -> String {
    let without_think = THINK_SPANS.replace_all(raw, "");
    let without_label = LEADING_LABEL.replace(without_think.trim(), "");
    let collapsed = BLANK_RUNS.replace_all(&without_label, "\n\n");
    let text = collapsed.trim();

    if token_estimate(text) <= target_tokens {
        return text.to_string();
    }

    let char_limit = target_tokens * 3;
    let prefix: String = text.chars().take(char_limit).collect();

    // Prefer cutting at the last complete sentence inside the budget.
    let cut = prefix
        .rmatch_indices(['.', '?', '!'])
        .next()
        .map(|(i, m)| i + m.len());
    match cut {
        Some(end) if end > 0 => prefix[..end].trim().to_string(),
        _ => {
            let hard: String = text.chars().take(target_tokens * 3).collect();
            format!("{}\u{2026}", hard.trim_end())
        }
    }
}
