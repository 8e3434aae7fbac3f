//! Per-user partitioned vector index over SQLite.
//!
//! Every access function takes the owning user id and folds it into the
//! SQL partition key — isolation is structural, not a filter a caller
//! could forget. Vectors are stored as little-endian f32 BLOBs and ranked
//! by brute-force cosine similarity, which is ample for a personal
//! knowledge base.
//!
//! The central invariant: re-indexing a document (delete + upsert of its
//! fresh segments) is observed as a single transition. Both halves run in
//! one SQLite transaction, and a per-document async lock serializes
//! re-indexes of the same document while leaving reads and other
//! documents untouched.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};

use serde::Serialize;
use sqlx::{Row, SqlitePool};
use tokio::sync::{Mutex as TokioMutex, OwnedMutexGuard};

use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use crate::error::{Error, Result};
use crate::models::{IndexEntry, SearchFilter, SearchHit};

const SNIPPET_CHARS: usize = 240;

/// The embedding space an index partition is configured for. Entries from
/// any other space are rejected on write.
#[derive(Debug, Clone)]
pub struct EmbeddingSpace {
    pub model: String,
    pub dims: usize,
}

/// Counts for one user's partition.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct PartitionStats {
    pub documents: u64,
    pub segments: u64,
}

pub struct VectorIndex {
    pool: SqlitePool,
    space: EmbeddingSpace,
    doc_locks: StdMutex<HashMap<(String, String), Arc<TokioMutex<()>>>>,
    quarantined: StdRwLock<HashSet<String>>,
}

impl VectorIndex {
    pub fn new(pool: SqlitePool, space: EmbeddingSpace) -> Self {
        Self {
            pool,
            space,
            doc_locks: StdMutex::new(HashMap::new()),
            quarantined: StdRwLock::new(HashSet::new()),
        }
    }

    pub fn space(&self) -> &EmbeddingSpace {
        &self.space
    }

    /// Insert or replace entries. Entries sharing a segment id with a live
    /// entry replace it. All entries land in one transaction or none do.
    pub async fn upsert(&self, user_id: &str, entries: &[IndexEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        self.check_writable(user_id)?;
        self.validate_space(entries)?;

        let mut keys: Vec<&str> = entries
            .iter()
            .map(|e| e.segment.document_key.as_str())
            .collect();
        keys.sort_unstable();
        keys.dedup();
        let _guards = self.lock_documents(user_id, &keys).await;

        let mut tx = self.pool.begin().await?;
        for entry in entries {
            insert_entry(&mut tx, user_id, entry).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Remove every entry belonging to a document. Safe to call on a
    /// document with zero entries.
    pub async fn delete_by_document(&self, user_id: &str, document_key: &str) -> Result<u64> {
        self.check_writable(user_id)?;
        let _guard = self.lock_document(user_id, document_key).await;

        let result = sqlx::query(
            "DELETE FROM index_entries WHERE user_id = ? AND document_key = ?",
        )
        .bind(user_id)
        .bind(document_key)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Replace a document's entries with a fresh set in one observable
    /// transition: no window where the document is indexed twice or
    /// absent. An empty `entries` slice clears the document.
    pub async fn replace_document(
        &self,
        user_id: &str,
        document_key: &str,
        entries: &[IndexEntry],
    ) -> Result<()> {
        self.check_writable(user_id)?;
        self.validate_space(entries)?;
        for entry in entries {
            if entry.segment.document_key != document_key {
                return Err(Error::Configuration(format!(
                    "entry for `{}` passed to replace_document(`{document_key}`)",
                    entry.segment.document_key
                )));
            }
        }

        let _guard = self.lock_document(user_id, document_key).await;

        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM index_entries WHERE user_id = ? AND document_key = ?")
            .bind(user_id)
            .bind(document_key)
            .execute(&mut *tx)
            .await?;
        for entry in entries {
            insert_entry(&mut tx, user_id, entry).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Rank the user's entries against a query vector.
    ///
    /// Ties break by most-recent document modification time, then by
    /// segment id, so results are fully deterministic.
    pub async fn query(
        &self,
        user_id: &str,
        query_vector: &[f32],
        top_k: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<SearchHit>> {
        if query_vector.len() != self.space.dims {
            return Err(Error::EmbeddingSpaceMismatch {
                expected_model: self.space.model.clone(),
                expected_dims: self.space.dims,
                got_model: self.space.model.clone(),
                got_dims: query_vector.len(),
            });
        }

        let rows = sqlx::query(
            "SELECT segment_id, document_key, seq, text, vector, tags_json, doc_updated_at
             FROM index_entries WHERE user_id = ?",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        struct Scored {
            segment_id: String,
            document_key: String,
            seq: i64,
            score: f64,
            snippet: String,
            doc_updated_at: i64,
        }

        let mut scored = Vec::new();
        for row in rows {
            let document_key: String = row.get("document_key");
            if let Some(keys) = &filter.document_keys {
                if !keys.contains(&document_key) {
                    continue;
                }
            }
            if let Some(wanted) = &filter.tags {
                let tags: Vec<String> =
                    serde_json::from_str(row.get::<String, _>("tags_json").as_str())
                        .unwrap_or_default();
                if !wanted.iter().any(|t| tags.contains(t)) {
                    continue;
                }
            }

            let vector = blob_to_vec(row.get::<Vec<u8>, _>("vector").as_slice());
            let score = cosine_similarity(query_vector, &vector) as f64;
            let text: String = row.get("text");
            scored.push(Scored {
                segment_id: row.get("segment_id"),
                document_key,
                seq: row.get("seq"),
                score,
                snippet: text.chars().take(SNIPPET_CHARS).collect(),
                doc_updated_at: row.get("doc_updated_at"),
            });
        }

        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.doc_updated_at.cmp(&a.doc_updated_at))
                .then_with(|| a.segment_id.cmp(&b.segment_id))
        });
        scored.truncate(top_k);

        Ok(scored
            .into_iter()
            .map(|s| SearchHit {
                document_key: s.document_key,
                segment_seq: s.seq,
                score: s.score,
                snippet: s.snippet,
                doc_updated_at: s.doc_updated_at,
            })
            .collect())
    }

    /// Check partition invariants: one live entry per segment id and a
    /// uniform embedding space. A violation quarantines the partition —
    /// writes fail until manual repair, reads continue.
    pub async fn verify_partition(&self, user_id: &str) -> Result<()> {
        let duplicate: Option<String> = sqlx::query_scalar(
            "SELECT segment_id FROM index_entries WHERE user_id = ?
             GROUP BY segment_id HAVING COUNT(*) > 1 LIMIT 1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(segment_id) = duplicate {
            self.quarantine(user_id);
            return Err(Error::IndexCorruption {
                user_id: user_id.to_string(),
                detail: format!("duplicate live entries for segment `{segment_id}`"),
            });
        }

        let alien: Option<i64> = sqlx::query_scalar(
            "SELECT dims FROM index_entries
             WHERE user_id = ? AND (dims != ? OR model != ?) LIMIT 1",
        )
        .bind(user_id)
        .bind(self.space.dims as i64)
        .bind(&self.space.model)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(dims) = alien {
            self.quarantine(user_id);
            return Err(Error::IndexCorruption {
                user_id: user_id.to_string(),
                detail: format!(
                    "entry with {dims}-dim vector in a {}-dim `{}` partition",
                    self.space.dims, self.space.model
                ),
            });
        }

        Ok(())
    }

    pub async fn partition_stats(&self, user_id: &str) -> Result<PartitionStats> {
        let row = sqlx::query(
            "SELECT COUNT(DISTINCT document_key) AS documents, COUNT(*) AS segments
             FROM index_entries WHERE user_id = ?",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(PartitionStats {
            documents: row.get::<i64, _>("documents") as u64,
            segments: row.get::<i64, _>("segments") as u64,
        })
    }

    /// Drop every entry in the user's partition and lift any quarantine.
    /// The index can then be rebuilt from the notes tree.
    pub async fn clear_partition(&self, user_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM index_entries WHERE user_id = ?")
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        self.quarantined.write().unwrap().remove(user_id);
        Ok(())
    }

    fn quarantine(&self, user_id: &str) {
        tracing::error!(user_id, "index partition quarantined");
        self.quarantined.write().unwrap().insert(user_id.to_string());
    }

    fn check_writable(&self, user_id: &str) -> Result<()> {
        if self.quarantined.read().unwrap().contains(user_id) {
            return Err(Error::IndexCorruption {
                user_id: user_id.to_string(),
                detail: "partition is quarantined pending repair".to_string(),
            });
        }
        Ok(())
    }

    fn validate_space(&self, entries: &[IndexEntry]) -> Result<()> {
        for entry in entries {
            if entry.dims != self.space.dims
                || entry.vector.len() != self.space.dims
                || entry.model != self.space.model
            {
                return Err(Error::EmbeddingSpaceMismatch {
                    expected_model: self.space.model.clone(),
                    expected_dims: self.space.dims,
                    got_model: entry.model.clone(),
                    got_dims: entry.vector.len(),
                });
            }
        }
        Ok(())
    }

    fn doc_lock_handle(&self, user_id: &str, document_key: &str) -> Arc<TokioMutex<()>> {
        let mut locks = self.doc_locks.lock().unwrap();
        locks
            .entry((user_id.to_string(), document_key.to_string()))
            .or_insert_with(|| Arc::new(TokioMutex::new(())))
            .clone()
    }

    async fn lock_document(&self, user_id: &str, document_key: &str) -> OwnedMutexGuard<()> {
        self.doc_lock_handle(user_id, document_key).lock_owned().await
    }

    /// Acquire several document locks in sorted key order so concurrent
    /// multi-document upserts cannot deadlock.
    async fn lock_documents(&self, user_id: &str, sorted_keys: &[&str]) -> Vec<OwnedMutexGuard<()>> {
        let mut guards = Vec::with_capacity(sorted_keys.len());
        for key in sorted_keys {
            guards.push(self.lock_document(user_id, key).await);
        }
        guards
    }
}

async fn insert_entry(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    user_id: &str,
    entry: &IndexEntry,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO index_entries
            (user_id, segment_id, document_key, seq, text, vector, dims, model, tags_json, doc_updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(user_id, segment_id) DO UPDATE SET
            document_key = excluded.document_key,
            seq = excluded.seq,
            text = excluded.text,
            vector = excluded.vector,
            dims = excluded.dims,
            model = excluded.model,
            tags_json = excluded.tags_json,
            doc_updated_at = excluded.doc_updated_at
        "#,
    )
    .bind(user_id)
    .bind(&entry.segment.id)
    .bind(&entry.segment.document_key)
    .bind(entry.segment.seq)
    .bind(&entry.segment.text)
    .bind(vec_to_blob(&entry.vector))
    .bind(entry.dims as i64)
    .bind(&entry.model)
    .bind(serde_json::to_string(&entry.tags)?)
    .bind(entry.doc_updated_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChunkStrategy, Segment};
    use crate::{db, migrate};

    async fn setup() -> (tempfile::TempDir, VectorIndex) {
        let dir = tempfile::TempDir::new().unwrap();
        let pool = db::connect(&dir.path().join("index.sqlite")).await.unwrap();
        migrate::run_migrations(&pool).await.unwrap();
        let index = VectorIndex::new(
            pool,
            EmbeddingSpace {
                model: "hash-v1".to_string(),
                dims: 3,
            },
        );
        (dir, index)
    }

    fn entry(key: &str, seq: i64, vector: [f32; 3], updated_at: i64) -> IndexEntry {
        let text = format!("{key} segment {seq}");
        IndexEntry {
            segment: Segment {
                id: format!("{key}#{seq}"),
                document_key: key.to_string(),
                seq,
                hash: crate::models::content_hash(&text),
                text,
                overlap: 0,
                strategy: ChunkStrategy::Paragraph,
                heading: None,
            },
            vector: vector.to_vec(),
            dims: 3,
            model: "hash-v1".to_string(),
            tags: Vec::new(),
            doc_updated_at: updated_at,
        }
    }

    #[tokio::test]
    async fn test_query_is_partition_scoped() {
        let (_dir, index) = setup().await;
        index
            .upsert("ana", &[entry("a.md", 0, [1.0, 0.0, 0.0], 10)])
            .await
            .unwrap();
        index
            .upsert("bob", &[entry("b.md", 0, [1.0, 0.0, 0.0], 10)])
            .await
            .unwrap();

        let hits = index
            .query("ana", &[1.0, 0.0, 0.0], 10, &SearchFilter::default())
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].document_key, "a.md");
    }

    #[tokio::test]
    async fn test_replace_document_is_one_transition() {
        let (_dir, index) = setup().await;
        let old: Vec<IndexEntry> = (0..3)
            .map(|i| entry("doc.md", i, [1.0, 0.0, 0.0], 10))
            .collect();
        index.upsert("ana", &old).await.unwrap();

        let fresh: Vec<IndexEntry> = (0..2)
            .map(|i| entry("doc.md", i, [0.0, 1.0, 0.0], 20))
            .collect();
        index.replace_document("ana", "doc.md", &fresh).await.unwrap();

        let stats = index.partition_stats("ana").await.unwrap();
        assert_eq!(stats.segments, 2);
        let hits = index
            .query("ana", &[0.0, 1.0, 0.0], 10, &SearchFilter::default())
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits.iter().all(|h| h.doc_updated_at == 20));
    }

    #[tokio::test]
    async fn test_replace_rejects_foreign_entries() {
        let (_dir, index) = setup().await;
        let err = index
            .replace_document("ana", "doc.md", &[entry("other.md", 0, [1.0, 0.0, 0.0], 5)])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[tokio::test]
    async fn test_delete_missing_document_is_noop() {
        let (_dir, index) = setup().await;
        let removed = index.delete_by_document("ana", "ghost.md").await.unwrap();
        assert_eq!(removed, 0);
    }

    #[tokio::test]
    async fn test_tiebreak_recency_then_segment_id() {
        let (_dir, index) = setup().await;
        // Identical vectors: identical scores for every entry.
        index
            .upsert(
                "ana",
                &[
                    entry("old.md", 0, [1.0, 0.0, 0.0], 10),
                    entry("new.md", 0, [1.0, 0.0, 0.0], 30),
                    entry("new.md", 1, [1.0, 0.0, 0.0], 30),
                ],
            )
            .await
            .unwrap();

        let hits = index
            .query("ana", &[1.0, 0.0, 0.0], 10, &SearchFilter::default())
            .await
            .unwrap();
        assert_eq!(hits[0].document_key, "new.md");
        assert_eq!(hits[0].segment_seq, 0);
        assert_eq!(hits[1].document_key, "new.md");
        assert_eq!(hits[1].segment_seq, 1);
        assert_eq!(hits[2].document_key, "old.md");
    }

    #[tokio::test]
    async fn test_space_mismatch_is_hard_error() {
        let (_dir, index) = setup().await;
        let mut bad = entry("a.md", 0, [1.0, 0.0, 0.0], 10);
        bad.vector = vec![1.0, 0.0];
        bad.dims = 2;
        let err = index.upsert("ana", &[bad]).await.unwrap_err();
        assert!(matches!(err, Error::EmbeddingSpaceMismatch { .. }));

        let err = index
            .query("ana", &[1.0, 0.0], 10, &SearchFilter::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::EmbeddingSpaceMismatch { .. }));
    }

    #[tokio::test]
    async fn test_filter_by_document_keys() {
        let (_dir, index) = setup().await;
        index
            .upsert(
                "ana",
                &[
                    entry("a.md", 0, [1.0, 0.0, 0.0], 10),
                    entry("b.md", 0, [1.0, 0.0, 0.0], 10),
                ],
            )
            .await
            .unwrap();

        let filter = SearchFilter {
            document_keys: Some(vec!["b.md".to_string()]),
            tags: None,
        };
        let hits = index.query("ana", &[1.0, 0.0, 0.0], 10, &filter).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].document_key, "b.md");
    }

    #[tokio::test]
    async fn test_corruption_quarantines_writes_not_reads() {
        let (_dir, index) = setup().await;
        index
            .upsert("ana", &[entry("a.md", 0, [1.0, 0.0, 0.0], 10)])
            .await
            .unwrap();

        // Plant an alien-space row behind the validation layer.
        sqlx::query(
            "INSERT INTO index_entries
                (user_id, segment_id, document_key, seq, text, vector, dims, model, tags_json, doc_updated_at)
             VALUES ('ana', 'x#0', 'x.md', 0, 'alien', X'00000000', 1, 'other-model', '[]', 0)",
        )
        .execute(&index.pool)
        .await
        .unwrap();

        let err = index.verify_partition("ana").await.unwrap_err();
        assert!(matches!(err, Error::IndexCorruption { .. }));

        let err = index
            .upsert("ana", &[entry("a.md", 1, [1.0, 0.0, 0.0], 10)])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::IndexCorruption { .. }));

        // Reads continue; another user's partition is unaffected.
        index
            .query("ana", &[1.0, 0.0, 0.0], 10, &SearchFilter::default())
            .await
            .unwrap();
        index
            .upsert("bob", &[entry("b.md", 0, [1.0, 0.0, 0.0], 10)])
            .await
            .unwrap();

        // Clearing the partition lifts the quarantine for a rebuild.
        index.clear_partition("ana").await.unwrap();
        index
            .upsert("ana", &[entry("a.md", 0, [1.0, 0.0, 0.0], 10)])
            .await
            .unwrap();
    }
}
