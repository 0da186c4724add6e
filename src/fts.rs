//! Full-text index over chunk content.
//!
//! A thin tantivy wrapper owned by the vector store. It mirrors the row
//! set: every stored chunk has exactly one document here, keyed by chunk
//! id, so lexical hits can be joined back to full records.

use std::path::Path;

use tantivy::collector::TopDocs;
use tantivy::query::QueryParser;
use tantivy::schema::{Field, Schema, Value, STORED, STRING, TEXT};
use tantivy::{Index, IndexReader, IndexWriter, TantivyDocument, Term};

use crate::error::{AppError, AppResult};

/// Heap given to writers for batch operations.
const WRITER_HEAP_BYTES: usize = 15_000_000;

#[derive(Clone)]
struct FtsSchema {
    id: Field,
    file_id: Field,
    content: Field,
    schema: Schema,
}

impl FtsSchema {
    fn build() -> Self {
        let mut builder = Schema::builder();
        let id = builder.add_text_field("id", STRING | STORED);
        let file_id = builder.add_text_field("file_id", STRING | STORED);
        let content = builder.add_text_field("content", TEXT);
        let schema = builder.build();
        Self {
            id,
            file_id,
            content,
            schema,
        }
    }
}

/// One lexical hit: chunk id plus raw BM25 score.
#[derive(Debug, Clone)]
pub struct FtsHit {
    pub id: String,
    pub score: f32,
}

pub struct FtsIndex {
    index: Index,
    reader: IndexReader,
    schema: FtsSchema,
    /// Tantivy allows a single IndexWriter per index; concurrent mutators
    /// serialize here.
    writer_lock: tokio::sync::Mutex<()>,
}

impl FtsIndex {
    pub fn open(dir: &Path) -> AppResult<Self> {
        std::fs::create_dir_all(dir)?;
        let schema = FtsSchema::build();

        let index = if dir.join("meta.json").exists() {
            Index::open_in_dir(dir)
                .map_err(|e| AppError::VectorStore(format!("open full-text index: {}", e)))?
        } else {
            Index::create_in_dir(dir, schema.schema.clone())
                .map_err(|e| AppError::VectorStore(format!("create full-text index: {}", e)))?
        };

        let reader = index
            .reader()
            .map_err(|e| AppError::VectorStore(format!("full-text reader: {}", e)))?;

        Ok(Self {
            index,
            reader,
            schema,
            writer_lock: tokio::sync::Mutex::new(()),
        })
    }

    fn writer(&self) -> AppResult<IndexWriter> {
        self.index
            .writer(WRITER_HEAP_BYTES)
            .map_err(|e| AppError::VectorStore(format!("full-text writer: {}", e)))
    }

    fn commit(&self, mut writer: IndexWriter) -> AppResult<()> {
        writer
            .commit()
            .map_err(|e| AppError::VectorStore(format!("full-text commit: {}", e)))?;
        self.reader
            .reload()
            .map_err(|e| AppError::VectorStore(format!("full-text reload: {}", e)))?;
        Ok(())
    }

    /// Upsert documents by chunk id.
    pub async fn add(&self, docs: &[(String, String, String)]) -> AppResult<()> {
        if docs.is_empty() {
            return Ok(());
        }
        let _guard = self.writer_lock.lock().await;
        let writer = self.writer()?;
        for (id, file_id, content) in docs {
            writer.delete_term(Term::from_field_text(self.schema.id, id));
            let mut doc = TantivyDocument::new();
            doc.add_text(self.schema.id, id);
            doc.add_text(self.schema.file_id, file_id);
            doc.add_text(self.schema.content, content);
            writer
                .add_document(doc)
                .map_err(|e| AppError::VectorStore(format!("full-text add: {}", e)))?;
        }
        self.commit(writer)
    }

    pub async fn delete_ids(&self, ids: &[String]) -> AppResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let _guard = self.writer_lock.lock().await;
        let writer = self.writer()?;
        for id in ids {
            writer.delete_term(Term::from_field_text(self.schema.id, id));
        }
        self.commit(writer)
    }

    pub async fn delete_file_id(&self, file_id: &str) -> AppResult<()> {
        let _guard = self.writer_lock.lock().await;
        let writer = self.writer()?;
        writer.delete_term(Term::from_field_text(self.schema.file_id, file_id));
        self.commit(writer)
    }

    pub async fn delete_all(&self) -> AppResult<()> {
        let _guard = self.writer_lock.lock().await;
        let writer = self.writer()?;
        writer
            .delete_all_documents()
            .map_err(|e| AppError::VectorStore(format!("full-text truncate: {}", e)))?;
        self.commit(writer)
    }

    /// Scored full-text hits over chunk content. Malformed query syntax is
    /// parsed leniently rather than failing the search.
    pub fn search(&self, query: &str, limit: usize) -> AppResult<Vec<FtsHit>> {
        let searcher = self.reader.searcher();
        let parser = QueryParser::for_index(&self.index, vec![self.schema.content]);
        let (parsed, _errors) = parser.parse_query_lenient(query);

        let top = searcher
            .search(&parsed, &TopDocs::with_limit(limit.max(1)))
            .map_err(|e| AppError::VectorStore(format!("full-text search: {}", e)))?;

        let mut hits = Vec::with_capacity(top.len());
        for (score, address) in top {
            let doc: TantivyDocument = searcher
                .doc(address)
                .map_err(|e| AppError::VectorStore(format!("full-text fetch: {}", e)))?;
            if let Some(id) = doc.get_first(self.schema.id).and_then(|v| v.as_str()) {
                hits.push(FtsHit {
                    id: id.to_string(),
                    score,
                });
            }
        }
        Ok(hits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(id: &str, file: &str, content: &str) -> (String, String, String) {
        (id.to_string(), file.to_string(), content.to_string())
    }

    #[tokio::test]
    async fn add_then_search_finds_matching_content() {
        let dir = tempfile::tempdir().unwrap();
        let fts = FtsIndex::open(dir.path()).unwrap();

        fts.add(&[
            doc("c1", "f1", "the database index needs tuning"),
            doc("c2", "f1", "a completely unrelated cooking recipe"),
        ])
        .await
        .unwrap();

        let hits = fts.search("database tuning", 10).unwrap();
        assert_eq!(hits[0].id, "c1");
    }

    #[tokio::test]
    async fn upsert_by_id_keeps_one_document() {
        let dir = tempfile::tempdir().unwrap();
        let fts = FtsIndex::open(dir.path()).unwrap();

        fts.add(&[doc("c1", "f1", "first version text")]).await.unwrap();
        fts.add(&[doc("c1", "f1", "second version text")]).await.unwrap();

        let hits = fts.search("version text", 10).unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn delete_by_file_id_removes_all_rows() {
        let dir = tempfile::tempdir().unwrap();
        let fts = FtsIndex::open(dir.path()).unwrap();

        fts.add(&[
            doc("c1", "f1", "alpha body"),
            doc("c2", "f1", "alpha tail"),
            doc("c3", "f2", "alpha other file"),
        ])
        .await
        .unwrap();

        fts.delete_file_id("f1").await.unwrap();

        let hits = fts.search("alpha", 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "c3");
    }

    #[tokio::test]
    async fn delete_ids_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let fts = FtsIndex::open(dir.path()).unwrap();

        fts.add(&[doc("c1", "f1", "to be removed")]).await.unwrap();
        fts.delete_ids(&["c1".to_string()]).await.unwrap();
        fts.delete_ids(&["c1".to_string()]).await.unwrap();

        assert!(fts.search("removed", 10).unwrap().is_empty());
    }
}
