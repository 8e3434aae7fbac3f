//! Knowledge Base Manager: the top-level façade binding one verified user
//! identity to a notes tree, an index partition, and a sync engine.
//!
//! Every exposed operation carries the bound user id into the layers
//! below; there is no unscoped access path. Authentication happens
//! outside the core — the id arriving here is assumed verified.

use std::sync::Arc;

use sqlx::SqlitePool;

use crate::config::Config;
use crate::embedding::Embedder;
use crate::error::Result;
use crate::index::{EmbeddingSpace, PartitionStats, VectorIndex};
use crate::local::NotesTree;
use crate::models::{
    ChosenVersion, Conflict, IngestOutcome, SearchFilter, SearchHit, SyncReport, SyncStatus,
};
use crate::remote::RemoteStore;
use crate::retrieval::RetrievalService;
use crate::sync::SyncEngine;
use crate::{db, migrate};

pub struct KnowledgeBase {
    user_id: String,
    pool: SqlitePool,
    notes: Arc<NotesTree>,
    index: Arc<VectorIndex>,
    retrieval: Arc<RetrievalService>,
    sync: Arc<SyncEngine>,
    default_top_k: usize,
}

impl KnowledgeBase {
    /// Open (or create) the knowledge base for the configured user,
    /// wiring the provider implementations into the core.
    pub async fn open(
        config: &Config,
        embedder: Arc<dyn Embedder>,
        remote: Arc<dyn RemoteStore>,
    ) -> Result<Self> {
        let pool = db::connect(&config.db.path).await?;
        migrate::run_migrations(&pool).await?;

        let notes = Arc::new(NotesTree::open(&config.notes)?);
        let index = Arc::new(VectorIndex::new(
            pool.clone(),
            EmbeddingSpace {
                model: embedder.model().to_string(),
                dims: embedder.dims(),
            },
        ));
        let retrieval = Arc::new(RetrievalService::new(
            pool.clone(),
            index.clone(),
            embedder,
            config.chunking.clone(),
            config.embedding.batch_size,
        ));
        let sync = Arc::new(SyncEngine::new(
            pool.clone(),
            config.user.id.clone(),
            notes.clone(),
            remote,
            retrieval.clone(),
        ));

        Ok(Self {
            user_id: config.user.id.clone(),
            pool,
            notes,
            index,
            retrieval,
            sync,
            default_top_k: config.retrieval.top_k,
        })
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn notes(&self) -> &Arc<NotesTree> {
        &self.notes
    }

    /// Chunk, embed, and index one note from the tree.
    pub async fn ingest_document(&self, key: &str) -> Result<IngestOutcome> {
        let doc = self.notes.load_document(&self.user_id, key)?;
        self.retrieval.ingest(&self.user_id, &doc, &[]).await
    }

    /// Ingest every note in the tree. Unchanged notes short-circuit.
    /// Returns (documents seen, segments written).
    pub async fn ingest_all(&self) -> Result<(usize, usize)> {
        let scan = self.notes.scan()?;
        let mut segments = 0usize;
        for key in scan.keys() {
            let outcome = self.ingest_document(key).await?;
            segments += outcome.segments_written();
        }
        Ok((scan.len(), segments))
    }

    /// Drop the user's index partition and rebuild it from the notes
    /// tree. This is the recovery path for a lost or corrupted index —
    /// documents are the source of truth, never the index.
    pub async fn rebuild_index(&self) -> Result<(usize, usize)> {
        self.index.clear_partition(&self.user_id).await?;
        sqlx::query("DELETE FROM documents WHERE user_id = ?")
            .bind(&self.user_id)
            .execute(&self.pool)
            .await?;
        self.ingest_all().await
    }

    /// Semantic search over the user's partition.
    pub async fn search(
        &self,
        query: &str,
        top_k: Option<usize>,
        filter: &SearchFilter,
    ) -> Result<Vec<SearchHit>> {
        self.retrieval
            .search(
                &self.user_id,
                query,
                top_k.unwrap_or(self.default_top_k),
                filter,
            )
            .await
    }

    /// Run one sync cycle against the remote store.
    pub async fn trigger_sync(&self) -> Result<SyncReport> {
        self.sync.run_cycle().await
    }

    /// Request cancellation of the in-flight sync cycle.
    pub fn cancel_sync(&self) {
        self.sync.cancel();
    }

    pub async fn sync_status(&self) -> Result<SyncStatus> {
        self.sync.status().await
    }

    pub async fn pending_conflicts(&self) -> Result<Vec<Conflict>> {
        self.sync.pending_conflicts().await
    }

    /// Keep the chosen side of a conflicted document everywhere.
    pub async fn resolve_conflict(&self, key: &str, chosen: ChosenVersion) -> Result<()> {
        self.sync.resolve(key, chosen).await
    }

    /// Keys currently present in the notes tree.
    pub async fn list_documents(&self) -> Result<Vec<String>> {
        Ok(self.notes.scan()?.into_keys().collect())
    }

    pub async fn stats(&self) -> Result<PartitionStats> {
        self.index.partition_stats(&self.user_id).await
    }

    /// Check index invariants for this user's partition.
    pub async fn verify_index(&self) -> Result<()> {
        self.index.verify_partition(&self.user_id).await
    }
}
