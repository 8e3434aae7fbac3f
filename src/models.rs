//! Core data models used throughout notemesh.
//!
//! These types represent the documents, segments, index entries, and sync
//! state that flow through the ingestion, retrieval, and reconciliation
//! pipelines.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A note held in one user's knowledge base.
///
/// The `key` is a stable, path-derived identifier (POSIX-style relative
/// path). The body lives in the notes tree; rows in the `documents` table
/// mirror only the hash and timestamp for ingest short-circuiting.
#[derive(Debug, Clone)]
pub struct Document {
    pub key: String,
    pub user_id: String,
    pub body: String,
    /// SHA-256 hex of `body`.
    pub hash: String,
    /// Unix seconds of the last modification.
    pub updated_at: i64,
    pub origin: DocumentOrigin,
}

/// Where a document's content came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentOrigin {
    Local(PathBuf),
    Remote(String),
}

/// Chunking strategy applied to a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStrategy {
    /// Character windows of `max_chars` advancing by `max_chars - overlap`.
    Fixed,
    /// Sentence-boundary packing up to `max_chars`.
    Sentence,
    /// Paragraph-boundary packing up to `max_chars`.
    Paragraph,
    /// Markdown heading sections, fixed-size fallback inside oversized ones.
    Heading,
}

impl ChunkStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkStrategy::Fixed => "fixed",
            ChunkStrategy::Sentence => "sentence",
            ChunkStrategy::Paragraph => "paragraph",
            ChunkStrategy::Heading => "heading",
        }
    }
}

/// A retrieval-sized slice of one document at a point in time.
///
/// Segments are immutable: a document edit regenerates all of them. Ids are
/// deterministic (`"{document_key}#{seq}"`) so a re-chunk of identical
/// content produces identical segments.
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    pub id: String,
    pub document_key: String,
    /// Contiguous from 0 within the document.
    pub seq: i64,
    pub text: String,
    /// Chars at the start of this segment repeated from the end of the
    /// previous one. Zero everywhere except fixed-size splits.
    pub overlap: usize,
    pub strategy: ChunkStrategy,
    /// Governing heading for [`ChunkStrategy::Heading`] segments.
    pub heading: Option<String>,
    /// SHA-256 hex of `text`.
    pub hash: String,
}

/// A segment's embedding plus the metadata used for filtering.
///
/// The owning user is NOT part of the entry: partitioning is enforced by
/// the index access functions, never by a field a caller could omit.
#[derive(Debug, Clone)]
pub struct IndexEntry {
    pub segment: Segment,
    pub vector: Vec<f32>,
    pub dims: usize,
    /// Embedding model identifier; must match the index's configured space.
    pub model: String,
    pub tags: Vec<String>,
    /// Modification time of the parent document, used for tie-breaking.
    pub doc_updated_at: i64,
}

/// A ranked search hit with enough provenance to attribute an answer.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub document_key: String,
    pub segment_seq: i64,
    pub score: f64,
    pub snippet: String,
    pub doc_updated_at: i64,
}

/// Optional metadata filter applied inside one user's partition.
#[derive(Debug, Clone, Default)]
pub struct SearchFilter {
    pub document_keys: Option<Vec<String>>,
    pub tags: Option<Vec<String>>,
}

/// Result of one ingest call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Content hash matched the recorded one; nothing touched.
    Unchanged,
    /// Document was (re-)chunked, embedded, and swapped into the index.
    Indexed { segments: usize },
}

impl IngestOutcome {
    pub fn segments_written(&self) -> usize {
        match self {
            IngestOutcome::Unchanged => 0,
            IngestOutcome::Indexed { segments } => *segments,
        }
    }
}

/// Last reconciled state of one knowledge base: document key → content hash.
pub type SyncSnapshot = BTreeMap<String, String>;

/// Direction of a reconciliation transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Local change wins: local → remote.
    Push,
    /// Remote change wins: remote → local.
    Pull,
}

/// A single step of a reconciliation plan.
///
/// Plans are transient (one sync cycle) and ordered: creations and updates
/// come before deletions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanOp {
    Create { key: String, direction: Direction },
    Update { key: String, direction: Direction },
    Delete { key: String, direction: Direction },
    Conflict { key: String },
}

impl PlanOp {
    pub fn key(&self) -> &str {
        match self {
            PlanOp::Create { key, .. }
            | PlanOp::Update { key, .. }
            | PlanOp::Delete { key, .. }
            | PlanOp::Conflict { key } => key,
        }
    }
}

/// Sync engine phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Idle,
    Scanning,
    Diffing,
    Reconciling,
    Applying,
    Reindexing,
    ConflictPending,
    Failed,
}

/// A document whose sync step failed and is pending retry next cycle.
#[derive(Debug, Clone, Serialize)]
pub struct FailedDoc {
    pub key: String,
    pub error: String,
}

/// Outcome of one sync cycle, broken down per document — never an opaque
/// "sync failed".
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    pub cycle_id: String,
    /// Keys created or updated (either direction) and re-indexed.
    pub applied: Vec<String>,
    /// Keys deleted (either direction) and removed from the index.
    pub deleted: Vec<String>,
    /// Keys whose apply or reindex step failed; retried next cycle.
    pub failed: Vec<FailedDoc>,
    /// Keys blocked on manual conflict resolution.
    pub conflicts: Vec<String>,
    /// Keys already in sync.
    pub unchanged: usize,
    /// True when the cycle was cancelled between plan steps.
    pub cancelled: bool,
}

/// Current engine state as exposed to callers.
#[derive(Debug, Clone, Serialize)]
pub struct SyncStatus {
    pub phase: SyncPhase,
    pub pending_conflicts: usize,
    pub last_report: Option<SyncReport>,
}

/// A conflicted document surfaced for manual resolution.
///
/// `None` on a side means that side deleted the document.
#[derive(Debug, Clone, Serialize)]
pub struct Conflict {
    pub key: String,
    pub local: Option<String>,
    pub remote: Option<String>,
    pub detected_at: i64,
}

/// Which side of a conflict to keep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChosenVersion {
    Local,
    Remote,
}

/// SHA-256 hex digest of a document body or segment text.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_hash_stable() {
        assert_eq!(content_hash("alpha"), content_hash("alpha"));
        assert_ne!(content_hash("alpha"), content_hash("beta"));
    }

    #[test]
    fn test_ingest_outcome_segments() {
        assert_eq!(IngestOutcome::Unchanged.segments_written(), 0);
        assert_eq!(IngestOutcome::Indexed { segments: 4 }.segments_written(), 4);
    }
}
