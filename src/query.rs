//! Query pipeline: process -> select strategies -> execute -> fuse ->
//! rerank -> post-filter.
//!
//! Hybrid search fuses the semantic and lexical result sets with
//! configurable weights, keyed by `(fileName, chunkIndex)`. When the
//! store's full-text index fails, the lexical strategy is emulated by
//! keyword-scoring a widened vector candidate set.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::{Deadlines, MAX_SEARCH_QUERY_LENGTH};
use crate::error::{with_deadline, AppError, AppResult};
use crate::ports::EmbeddingPort;
use crate::store::{RecordMetadata, VectorSearchOptions, VectorStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchType {
    #[default]
    Semantic,
    Lexical,
    Hybrid,
}

#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    pub search_type: SearchType,
    pub top_k: Option<usize>,
    pub score_threshold: Option<f32>,
    pub file_types: Option<Vec<String>>,
    pub metadata_filters: HashMap<String, String>,
    pub semantic_weight: Option<f32>,
}

/// Public result shape.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResult {
    pub content: String,
    pub score: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub semantic_score: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keyword_score: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hybrid_score: Option<f32>,
    pub metadata: RecordMetadata,
    pub chunk_index: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryIntent {
    pub kind: String,
    pub confidence: f32,
}

#[derive(Debug, Clone)]
pub struct ProcessedQuery {
    pub original: String,
    pub normalized: String,
    pub keywords: Vec<String>,
    pub intent: QueryIntent,
}

/// Normalize the query and extract keyword tokens longer than two chars.
/// The intent classifier is a stub for now: everything is treated as a
/// factual lookup.
pub fn process_query(query: &str) -> ProcessedQuery {
    let normalized = query.trim().to_lowercase();
    let mut seen = std::collections::HashSet::new();
    let keywords = normalized
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() > 2)
        .filter(|t| seen.insert(t.to_string()))
        .map(|t| t.to_string())
        .collect();
    ProcessedQuery {
        original: query.to_string(),
        normalized,
        keywords,
        intent: QueryIntent {
            kind: "factual".to_string(),
            confidence: 0.8,
        },
    }
}

#[derive(Debug, Clone, Copy)]
pub struct QueryDefaults {
    pub top_k: usize,
    pub score_threshold: f32,
    pub semantic_weight: f32,
}

/// One strategy's hit before fusion.
#[derive(Debug, Clone)]
struct StrategyHit {
    record: crate::store::VectorRecord,
    score: f32,
    semantic: Option<f32>,
    keyword: Option<f32>,
}

#[derive(Debug, Clone)]
struct FusedHit {
    record: crate::store::VectorRecord,
    score: f32,
    semantic: Option<f32>,
    keyword: Option<f32>,
    hybrid: Option<f32>,
}

pub struct QueryPipeline {
    store: Arc<VectorStore>,
    embedder: Arc<dyn EmbeddingPort>,
    defaults: QueryDefaults,
    deadlines: Deadlines,
}

impl QueryPipeline {
    pub fn new(
        store: Arc<VectorStore>,
        embedder: Arc<dyn EmbeddingPort>,
        defaults: QueryDefaults,
        deadlines: Deadlines,
    ) -> Self {
        Self {
            store,
            embedder,
            defaults,
            deadlines,
        }
    }

    pub async fn search(
        &self,
        query: &str,
        opts: &SearchOptions,
    ) -> AppResult<Vec<SearchResult>> {
        if query.trim().is_empty() {
            return Ok(Vec::new());
        }
        if query.len() > MAX_SEARCH_QUERY_LENGTH {
            return Err(AppError::VectorStore(format!(
                "query too long ({} chars, maximum {})",
                query.len(),
                MAX_SEARCH_QUERY_LENGTH
            )));
        }

        let processed = process_query(query);
        let top_k = opts.top_k.unwrap_or(self.defaults.top_k);
        // Widened candidate pool so fusion and post-filtering have
        // something to cut from.
        let fetch = (top_k * 2).max(top_k);

        let store_opts = VectorSearchOptions {
            top_k: fetch,
            score_threshold: None,
            file_types: opts.file_types.clone(),
            metadata_filters: opts.metadata_filters.clone(),
        };

        let sets: Vec<(f32, Vec<StrategyHit>)> = match opts.search_type {
            SearchType::Semantic => {
                let hits = self.run_semantic(&processed, &store_opts).await?;
                vec![(1.0, hits)]
            }
            SearchType::Lexical => {
                let hits = self.run_lexical(&processed, opts, fetch).await?;
                vec![(1.0, hits)]
            }
            SearchType::Hybrid => {
                let weight = opts
                    .semantic_weight
                    .unwrap_or(self.defaults.semantic_weight)
                    .clamp(0.0, 1.0);
                let (semantic, lexical) = tokio::join!(
                    self.run_semantic(&processed, &store_opts),
                    self.run_lexical(&processed, opts, fetch),
                );
                vec![(weight, semantic?), (1.0 - weight, lexical?)]
            }
        };

        let mut fused = fuse(sets);
        rerank(&mut fused, &processed.keywords);

        let threshold = opts
            .score_threshold
            .unwrap_or(self.defaults.score_threshold);
        fused.retain(|h| h.score >= threshold);
        fused.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        fused.truncate(top_k);

        Ok(fused
            .into_iter()
            .map(|h| SearchResult {
                content: h.record.content.clone(),
                score: h.score,
                semantic_score: h.semantic,
                keyword_score: h.keyword,
                hybrid_score: h.hybrid,
                chunk_index: h.record.metadata.chunk_index,
                metadata: h.record.metadata,
            })
            .collect())
    }

    async fn run_semantic(
        &self,
        processed: &ProcessedQuery,
        store_opts: &VectorSearchOptions,
    ) -> AppResult<Vec<StrategyHit>> {
        let vector = with_deadline(
            "embedding.query",
            self.deadlines.embedding(),
            self.embedder.embed_query(&processed.original),
        )
        .await?;

        let hits = self.store.vector_search(&vector, store_opts).await?;
        Ok(hits
            .into_iter()
            .map(|h| StrategyHit {
                score: h.score,
                semantic: Some(h.score),
                keyword: None,
                record: h.record,
            })
            .collect())
    }

    async fn run_lexical(
        &self,
        processed: &ProcessedQuery,
        opts: &SearchOptions,
        fetch: usize,
    ) -> AppResult<Vec<StrategyHit>> {
        match self.store.lexical_search(&processed.normalized, fetch).await {
            Ok(hits) => {
                // BM25 scores are unbounded; normalize by the best hit so
                // fusion weights apply on a [0, 1] scale.
                let max = hits.iter().map(|h| h.score).fold(0.0f32, f32::max);
                Ok(hits
                    .into_iter()
                    .filter(|h| metadata_matches(&h.record.metadata, opts))
                    .map(|h| {
                        let normalized = if max > 0.0 { h.score / max } else { 0.0 };
                        StrategyHit {
                            score: normalized,
                            semantic: None,
                            keyword: Some(normalized),
                            record: h.record,
                        }
                    })
                    .collect())
            }
            Err(e) => {
                warn!(error = %e, "full-text index unavailable, emulating lexical search");
                self.lexical_via_vectors(processed, opts, fetch).await
            }
        }
    }

    /// Emulated lexical strategy: widened vector search re-ranked by
    /// keyword match density. Rows with no keyword match keep a heavily
    /// penalized similarity score so they rank behind any real match.
    async fn lexical_via_vectors(
        &self,
        processed: &ProcessedQuery,
        opts: &SearchOptions,
        fetch: usize,
    ) -> AppResult<Vec<StrategyHit>> {
        let vector = with_deadline(
            "embedding.query",
            self.deadlines.embedding(),
            self.embedder.embed_query(&processed.original),
        )
        .await?;

        let store_opts = VectorSearchOptions {
            top_k: fetch * 2,
            score_threshold: None,
            file_types: opts.file_types.clone(),
            metadata_filters: opts.metadata_filters.clone(),
        };
        let candidates = self.store.vector_search(&vector, &store_opts).await?;

        debug!(candidates = candidates.len(), "keyword-scoring vector candidates");
        let mut hits: Vec<StrategyHit> = candidates
            .into_iter()
            .map(|c| {
                let keyword = keyword_density(&c.record.content, &processed.keywords);
                let score = if keyword > 0.0 { keyword } else { c.score * 0.3 };
                StrategyHit {
                    score,
                    semantic: None,
                    keyword: Some(score),
                    record: c.record,
                }
            })
            .collect();
        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(fetch);
        Ok(hits)
    }
}

/// Fraction of query keywords present in the content.
fn keyword_density(content: &str, keywords: &[String]) -> f32 {
    if keywords.is_empty() {
        return 0.0;
    }
    let lowered = content.to_lowercase();
    let matched = keywords.iter().filter(|k| lowered.contains(k.as_str())).count();
    matched as f32 / keywords.len() as f32
}

/// Weighted fusion keyed by `(fileName, chunkIndex)`. With a single set
/// the strategy score passes through unchanged; with two or more sets the
/// row keeps `max(score)` per strategy and accumulates
/// `hybrid = sum(weight * score)`.
fn fuse(sets: Vec<(f32, Vec<StrategyHit>)>) -> Vec<FusedHit> {
    if sets.len() == 1 {
        let (_, hits) = sets.into_iter().next().unwrap_or((0.0, Vec::new()));
        return hits
            .into_iter()
            .map(|h| FusedHit {
                score: h.score,
                semantic: h.semantic,
                keyword: h.keyword,
                hybrid: None,
                record: h.record,
            })
            .collect();
    }

    let mut merged: HashMap<(String, u32), FusedHit> = HashMap::new();
    for (weight, hits) in sets {
        for hit in hits {
            let key = (
                hit.record.metadata.file_name.clone(),
                hit.record.metadata.chunk_index,
            );
            match merged.get_mut(&key) {
                Some(existing) => {
                    existing.score = existing.score.max(hit.score);
                    if let Some(s) = hit.semantic {
                        existing.semantic = Some(existing.semantic.unwrap_or(0.0).max(s));
                    }
                    if let Some(k) = hit.keyword {
                        existing.keyword = Some(existing.keyword.unwrap_or(0.0).max(k));
                    }
                    *existing.hybrid.get_or_insert(0.0) += weight * hit.score;
                }
                None => {
                    merged.insert(
                        key,
                        FusedHit {
                            score: hit.score,
                            semantic: hit.semantic,
                            keyword: hit.keyword,
                            hybrid: Some(weight * hit.score),
                            record: hit.record,
                        },
                    );
                }
            }
        }
    }

    // The fused ranking orders by the accumulated hybrid score.
    let mut out: Vec<FusedHit> = merged
        .into_values()
        .map(|mut h| {
            h.score = h.hybrid.unwrap_or(h.score);
            h
        })
        .collect();
    out.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    out
}

/// Heuristic local reranker: short chunks get a small boost, very long
/// chunks a small penalty, and chunks whose first sentence contains a
/// query keyword rank up. Scores are clamped to [0, 1].
fn rerank(hits: &mut [FusedHit], keywords: &[String]) {
    for hit in hits.iter_mut() {
        let len = hit.record.content.len();
        let mut score = hit.score;
        if len < 500 {
            score *= 1.1;
        }
        if len >= 2000 {
            score *= 0.9;
        }
        let first = first_sentence(&hit.record.content).to_lowercase();
        if keywords.iter().any(|k| first.contains(k.as_str())) {
            score *= 1.15;
        }
        hit.score = score.clamp(0.0, 1.0);
    }
}

fn first_sentence(content: &str) -> &str {
    match content.find(['.', '?', '!']) {
        Some(end) => &content[..=end],
        None => content,
    }
}

fn metadata_matches(metadata: &RecordMetadata, opts: &SearchOptions) -> bool {
    if let Some(types) = &opts.file_types {
        if !types.iter().any(|t| t == &metadata.file_type) {
            return false;
        }
    }
    for (key, expected) in &opts.metadata_filters {
        match metadata.field(key) {
            Some(actual) if &actual == expected => {}
            _ => return false,
        }
    }
    true
}
