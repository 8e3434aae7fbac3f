//! Retrieval service: the chunk → embed → index pipeline and its query
//! counterpart.
//!
//! Ingest short-circuits on an unchanged content hash before touching the
//! embedder, batches segment texts to amortize per-call overhead, and
//! swaps the document's entries into the index as one transition. Search
//! embeds the query and returns ranked hits with provenance.

use std::sync::Arc;

use sqlx::SqlitePool;

use crate::chunk::chunk;
use crate::config::ChunkingConfig;
use crate::embedding::Embedder;
use crate::error::{Error, Result};
use crate::index::VectorIndex;
use crate::models::{Document, IndexEntry, IngestOutcome, SearchFilter, SearchHit};

pub struct RetrievalService {
    pool: SqlitePool,
    index: Arc<VectorIndex>,
    embedder: Arc<dyn Embedder>,
    chunking: ChunkingConfig,
    batch_size: usize,
}

impl RetrievalService {
    pub fn new(
        pool: SqlitePool,
        index: Arc<VectorIndex>,
        embedder: Arc<dyn Embedder>,
        chunking: ChunkingConfig,
        batch_size: usize,
    ) -> Self {
        Self {
            pool,
            index,
            embedder,
            chunking,
            batch_size,
        }
    }

    pub fn index(&self) -> &Arc<VectorIndex> {
        &self.index
    }

    /// Chunk, embed, and index one document. Re-ingest of unchanged
    /// content is a no-op, short-circuited before the embedder.
    pub async fn ingest(
        &self,
        user_id: &str,
        doc: &Document,
        tags: &[String],
    ) -> Result<IngestOutcome> {
        let recorded = self.recorded_hash(user_id, &doc.key).await?;
        if recorded.as_deref() == Some(doc.hash.as_str()) {
            tracing::debug!(user_id, key = %doc.key, "content unchanged, skipping ingest");
            return Ok(IngestOutcome::Unchanged);
        }

        let segments = chunk(
            &doc.key,
            &doc.body,
            self.chunking.strategy,
            self.chunking.max_chars,
            self.chunking.overlap_chars,
        )?;

        let texts: Vec<String> = segments.iter().map(|s| s.text.clone()).collect();
        let vectors = self.embed_batched(&texts).await?;

        let entries: Vec<IndexEntry> = segments
            .into_iter()
            .zip(vectors)
            .map(|(segment, vector)| IndexEntry {
                dims: vector.len(),
                model: self.embedder.model().to_string(),
                tags: tags.to_vec(),
                doc_updated_at: doc.updated_at,
                segment,
                vector,
            })
            .collect();

        let count = entries.len();
        self.index.replace_document(user_id, &doc.key, &entries).await?;
        self.record_document(user_id, doc).await?;

        tracing::info!(user_id, key = %doc.key, segments = count, "document indexed");
        Ok(IngestOutcome::Indexed { segments: count })
    }

    /// Embed the query text and rank the user's partition against it.
    pub async fn search(
        &self,
        user_id: &str,
        query_text: &str,
        top_k: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<SearchHit>> {
        if query_text.trim().is_empty() {
            return Ok(Vec::new());
        }

        let mut vectors = self.embedder.embed(&[query_text.to_string()]).await?;
        let query_vector = vectors
            .pop()
            .ok_or_else(|| Error::ProviderFatal("empty embedding response".to_string()))?;

        self.index.query(user_id, &query_vector, top_k, filter).await
    }

    /// Drop a document from the index and the ingest bookkeeping.
    pub async fn forget_document(&self, user_id: &str, key: &str) -> Result<()> {
        self.index.delete_by_document(user_id, key).await?;
        sqlx::query("DELETE FROM documents WHERE user_id = ? AND key = ?")
            .bind(user_id)
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Embed in `batch_size` chunks. A failed batch falls back to per-item
    /// requests so one oversized or unlucky segment doesn't sink the whole
    /// document; fatal provider errors propagate immediately.
    async fn embed_batched(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size.max(1)) {
            match self.embedder.embed(batch).await {
                Ok(vectors) => out.extend(vectors),
                Err(e) if batch.len() > 1 && !matches!(e, Error::ProviderFatal(_)) => {
                    tracing::warn!(
                        batch = batch.len(),
                        error = %e,
                        "batch embed failed, retrying per item"
                    );
                    for text in batch {
                        let mut vectors =
                            self.embedder.embed(std::slice::from_ref(text)).await?;
                        out.push(vectors.pop().ok_or_else(|| {
                            Error::ProviderFatal("empty embedding response".to_string())
                        })?);
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }

    async fn recorded_hash(&self, user_id: &str, key: &str) -> Result<Option<String>> {
        Ok(
            sqlx::query_scalar("SELECT hash FROM documents WHERE user_id = ? AND key = ?")
                .bind(user_id)
                .bind(key)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    async fn record_document(&self, user_id: &str, doc: &Document) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO documents (user_id, key, hash, updated_at) VALUES (?, ?, ?, ?)
            ON CONFLICT(user_id, key) DO UPDATE SET
                hash = excluded.hash,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(user_id)
        .bind(&doc.key)
        .bind(&doc.hash)
        .bind(doc.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use crate::config::ChunkingConfig;
    use crate::embedding::HashEmbedder;
    use crate::index::EmbeddingSpace;
    use crate::models::{content_hash, ChunkStrategy, DocumentOrigin};
    use crate::{db, migrate};

    /// Counts embed calls so tests can assert the short-circuit path.
    struct CountingEmbedder {
        inner: HashEmbedder,
        calls: AtomicUsize,
    }

    impl CountingEmbedder {
        fn new(dims: usize) -> Self {
            Self {
                inner: HashEmbedder::new(dims),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Embedder for CountingEmbedder {
        fn model(&self) -> &str {
            self.inner.model()
        }
        fn dims(&self) -> usize {
            self.inner.dims()
        }
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.embed(texts).await
        }
    }

    fn doc(user_id: &str, key: &str, body: &str) -> Document {
        Document {
            key: key.to_string(),
            user_id: user_id.to_string(),
            body: body.to_string(),
            hash: content_hash(body),
            updated_at: 100,
            origin: DocumentOrigin::Local(std::path::PathBuf::from(key)),
        }
    }

    async fn setup(
        embedder: Arc<dyn Embedder>,
    ) -> (tempfile::TempDir, RetrievalService) {
        let dir = tempfile::TempDir::new().unwrap();
        let pool = db::connect(&dir.path().join("nm.sqlite")).await.unwrap();
        migrate::run_migrations(&pool).await.unwrap();
        let index = Arc::new(VectorIndex::new(
            pool.clone(),
            EmbeddingSpace {
                model: embedder.model().to_string(),
                dims: embedder.dims(),
            },
        ));
        let service = RetrievalService::new(
            pool,
            index,
            embedder,
            ChunkingConfig {
                strategy: ChunkStrategy::Paragraph,
                max_chars: 200,
                overlap_chars: 20,
            },
            16,
        );
        (dir, service)
    }

    #[tokio::test]
    async fn test_ingest_then_search_roundtrip() {
        let (_dir, service) = setup(Arc::new(HashEmbedder::new(32))).await;
        let rust = doc("ana", "rust.md", "Ownership and borrowing rules.\n\nLifetimes tie references together.");
        let cooking = doc("ana", "cooking.md", "Slow roasted vegetables.\n\nSeason generously with salt.");
        service.ingest("ana", &rust, &[]).await.unwrap();
        service.ingest("ana", &cooking, &[]).await.unwrap();

        // The hash embedder scores an exact segment text at cosine 1.0.
        let hits = service
            .search(
                "ana",
                "Ownership and borrowing rules.\n\nLifetimes tie references together.",
                5,
                &SearchFilter::default(),
            )
            .await
            .unwrap();
        assert!(!hits.is_empty());
        assert_eq!(hits[0].document_key, "rust.md");
        assert!(hits[0].score > 0.99);
        assert!(!hits[0].snippet.is_empty());
    }

    #[tokio::test]
    async fn test_unchanged_reingest_is_noop() {
        let embedder = Arc::new(CountingEmbedder::new(16));
        let (_dir, service) = setup(embedder.clone()).await;

        let note = doc("ana", "note.md", "Stable content.");
        let outcome = service.ingest("ana", &note, &[]).await.unwrap();
        assert!(matches!(outcome, IngestOutcome::Indexed { .. }));
        let calls_after_first = embedder.calls.load(Ordering::SeqCst);
        let stats_after_first = service.index().partition_stats("ana").await.unwrap();

        let outcome = service.ingest("ana", &note, &[]).await.unwrap();
        assert_eq!(outcome, IngestOutcome::Unchanged);
        assert_eq!(embedder.calls.load(Ordering::SeqCst), calls_after_first);
        let stats = service.index().partition_stats("ana").await.unwrap();
        assert_eq!(stats.segments, stats_after_first.segments);
    }

    #[tokio::test]
    async fn test_edit_replaces_previous_segments() {
        let (_dir, service) = setup(Arc::new(HashEmbedder::new(16))).await;

        let v1 = doc("ana", "note.md", "One.\n\nTwo.\n\nThree.");
        service.ingest("ana", &v1, &[]).await.unwrap();

        let mut v2 = doc("ana", "note.md", "Replaced body.");
        v2.updated_at = 200;
        let outcome = service.ingest("ana", &v2, &[]).await.unwrap();
        assert_eq!(outcome.segments_written(), 1);

        let stats = service.index().partition_stats("ana").await.unwrap();
        assert_eq!(stats.documents, 1);
        assert_eq!(stats.segments, 1);
    }

    #[tokio::test]
    async fn test_empty_document_clears_entries() {
        let (_dir, service) = setup(Arc::new(HashEmbedder::new(16))).await;
        service
            .ingest("ana", &doc("ana", "note.md", "Some content."), &[])
            .await
            .unwrap();

        let outcome = service.ingest("ana", &doc("ana", "note.md", ""), &[]).await.unwrap();
        assert_eq!(outcome.segments_written(), 0);
        let stats = service.index().partition_stats("ana").await.unwrap();
        assert_eq!(stats.segments, 0);
    }

    #[tokio::test]
    async fn test_blank_query_returns_no_hits() {
        let (_dir, service) = setup(Arc::new(HashEmbedder::new(16))).await;
        let hits = service
            .search("ana", "   ", 5, &SearchFilter::default())
            .await
            .unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn test_forget_document_removes_entries_and_bookkeeping() {
        let (_dir, service) = setup(Arc::new(HashEmbedder::new(16))).await;
        let note = doc("ana", "note.md", "Some content.");
        service.ingest("ana", &note, &[]).await.unwrap();

        service.forget_document("ana", "note.md").await.unwrap();
        let stats = service.index().partition_stats("ana").await.unwrap();
        assert_eq!(stats.segments, 0);

        // With the bookkeeping row gone, the next ingest is not
        // short-circuited.
        let outcome = service.ingest("ana", &note, &[]).await.unwrap();
        assert!(matches!(outcome, IngestOutcome::Indexed { .. }));
    }
}
