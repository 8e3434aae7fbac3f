//! Sync engine: reconciles one user's local notes tree with the shared
//! remote store, then re-indexes whatever changed.
//!
//! A cycle walks `Scanning → Diffing → Reconciling → Applying →
//! Reindexing → Idle`, entering `Failed` on unrecoverable errors (prior
//! sync state untouched, safe to retry) and ending in `ConflictPending`
//! when concurrent edits cannot be reconciled automatically.
//!
//! Divergence is classified against the last reconciled snapshot
//! (key → content hash). Both-changed-different-content documents are
//! never auto-merged: both versions are persisted and surfaced for manual
//! resolution, while every non-conflicting operation still applies.
//! Last-writer-wins would silently lose data and is rejected.
//!
//! The snapshot advances only after reindexing, in one transaction, and
//! only for documents whose apply and reindex steps both succeeded. A
//! crash or cancellation mid-cycle re-derives the same pending work next
//! cycle; applies are idempotent, and re-ingest of already-indexed
//! content short-circuits on its hash.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock as StdRwLock};

use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::local::{LocalDoc, NotesTree};
use crate::models::{
    content_hash, ChosenVersion, Conflict, Direction, FailedDoc, PlanOp, SyncPhase, SyncReport,
    SyncSnapshot, SyncStatus,
};
use crate::remote::RemoteStore;
use crate::retrieval::RetrievalService;

pub struct SyncEngine {
    pool: SqlitePool,
    user_id: String,
    notes: Arc<NotesTree>,
    remote: Arc<dyn RemoteStore>,
    retrieval: Arc<RetrievalService>,
    state: StdRwLock<(SyncPhase, Option<SyncReport>)>,
    cancel: AtomicBool,
    cycle_gate: tokio::sync::Mutex<()>,
}

/// What one applied plan op did, pending reindex.
enum AppliedChange {
    /// Content now identical on both sides with this hash.
    Upserted(String),
    Deleted,
}

impl SyncEngine {
    pub fn new(
        pool: SqlitePool,
        user_id: String,
        notes: Arc<NotesTree>,
        remote: Arc<dyn RemoteStore>,
        retrieval: Arc<RetrievalService>,
    ) -> Self {
        Self {
            pool,
            user_id,
            notes,
            remote,
            retrieval,
            state: StdRwLock::new((SyncPhase::Idle, None)),
            cancel: AtomicBool::new(false),
            cycle_gate: tokio::sync::Mutex::new(()),
        }
    }

    /// Request cancellation of the in-flight cycle. Checked between
    /// per-document steps, never mid-document.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn phase(&self) -> SyncPhase {
        self.state.read().unwrap().0
    }

    pub async fn status(&self) -> Result<SyncStatus> {
        let (phase, last_report) = self.state.read().unwrap().clone();
        Ok(SyncStatus {
            phase,
            pending_conflicts: self.pending_conflicts().await?.len(),
            last_report,
        })
    }

    /// Run one full sync cycle. Cycles for the same engine are serialized.
    pub async fn run_cycle(&self) -> Result<SyncReport> {
        let _gate = self.cycle_gate.lock().await;
        self.cancel.store(false, Ordering::SeqCst);

        let mut report = SyncReport {
            cycle_id: Uuid::new_v4().to_string(),
            ..Default::default()
        };

        self.set_phase(SyncPhase::Scanning);
        let local = match self.notes.scan() {
            Ok(local) => local,
            Err(e) => return self.fail(e),
        };
        let remote_listing = match self.remote.list(&self.user_id).await {
            Ok(listing) => listing,
            Err(e) => return self.fail(e),
        };
        let snapshot = match self.load_snapshot().await {
            Ok(snapshot) => snapshot,
            Err(e) => return self.fail(e),
        };

        self.set_phase(SyncPhase::Diffing);
        let diff = diff_states(&local, &remote_listing, &snapshot);
        report.unchanged = diff.unchanged;

        self.set_phase(SyncPhase::Reconciling);
        // The next snapshot starts as the old one; entries advance only as
        // documents complete their apply + reindex steps.
        let mut next = snapshot.clone();
        for key in diff.both_deleted {
            next.remove(&key);
        }

        for op in &diff.plan {
            if let PlanOp::Conflict { key } = op {
                match self.record_conflict(key).await {
                    Ok(()) => report.conflicts.push(key.clone()),
                    Err(e) => report.failed.push(FailedDoc {
                        key: key.clone(),
                        error: e.to_string(),
                    }),
                }
            }
        }

        self.set_phase(SyncPhase::Applying);
        let mut applied: Vec<(String, AppliedChange)> = Vec::new();
        for op in &diff.plan {
            if matches!(op, PlanOp::Conflict { .. }) {
                continue;
            }
            if self.cancelled(&mut report) {
                break;
            }
            match self.apply_op(op).await {
                Ok(change) => applied.push((op.key().to_string(), change)),
                Err(e) => {
                    tracing::warn!(key = op.key(), error = %e, "apply failed, will retry next cycle");
                    report.failed.push(FailedDoc {
                        key: op.key().to_string(),
                        error: e.to_string(),
                    });
                }
            }
        }

        self.set_phase(SyncPhase::Reindexing);
        // Documents already equal on both sides skipped Applying but may
        // still need their index refreshed (e.g. a cycle interrupted after
        // Applying, or both sides edited to identical content). Ingest
        // short-circuits on the recorded hash, so the steady-state cost is
        // one lookup per document.
        for (key, hash) in diff.settled {
            if self.cancelled(&mut report) {
                break;
            }
            match self.reindex_one(&key, &AppliedChange::Upserted(hash.clone())).await {
                Ok(()) => {
                    next.insert(key, hash);
                }
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "reindex failed, will retry next cycle");
                    report.failed.push(FailedDoc {
                        key,
                        error: e.to_string(),
                    });
                }
            }
        }
        for (key, change) in applied {
            if self.cancelled(&mut report) {
                break;
            }
            match self.reindex_one(&key, &change).await {
                Ok(()) => match change {
                    AppliedChange::Upserted(hash) => {
                        next.insert(key.clone(), hash);
                        report.applied.push(key);
                    }
                    AppliedChange::Deleted => {
                        next.remove(&key);
                        report.deleted.push(key);
                    }
                },
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "reindex failed, will retry next cycle");
                    report.failed.push(FailedDoc {
                        key,
                        error: e.to_string(),
                    });
                }
            }
        }

        if let Err(e) = self.store_snapshot(&next).await {
            return self.fail(e);
        }

        let phase = if self.pending_conflicts().await?.is_empty() {
            SyncPhase::Idle
        } else {
            SyncPhase::ConflictPending
        };
        tracing::info!(
            cycle = %report.cycle_id,
            applied = report.applied.len(),
            deleted = report.deleted.len(),
            failed = report.failed.len(),
            conflicts = report.conflicts.len(),
            "sync cycle finished"
        );
        *self.state.write().unwrap() = (phase, Some(report.clone()));
        Ok(report)
    }

    /// Conflicts pending manual resolution, both versions included.
    pub async fn pending_conflicts(&self) -> Result<Vec<Conflict>> {
        let rows = sqlx::query(
            "SELECT key, local_body, remote_body, detected_at
             FROM conflicts WHERE user_id = ? ORDER BY key",
        )
        .bind(&self.user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| Conflict {
                key: row.get("key"),
                local: row.get("local_body"),
                remote: row.get("remote_body"),
                detected_at: row.get("detected_at"),
            })
            .collect())
    }

    /// Resolve one conflict by keeping the chosen side everywhere: notes
    /// tree, remote store, index, and snapshot. Choosing a deleted side
    /// applies the deletion.
    pub async fn resolve(&self, key: &str, chosen: ChosenVersion) -> Result<()> {
        let row = sqlx::query(
            "SELECT local_body, remote_body FROM conflicts WHERE user_id = ? AND key = ?",
        )
        .bind(&self.user_id)
        .bind(key)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| Error::NotFound(format!("no pending conflict for `{key}`")))?;

        let body: Option<String> = match chosen {
            ChosenVersion::Local => row.get("local_body"),
            ChosenVersion::Remote => row.get("remote_body"),
        };

        match body {
            Some(body) => {
                self.notes.write(key, &body)?;
                self.remote.push(&self.user_id, key, &body).await?;
                let doc = self.notes.load_document(&self.user_id, key)?;
                self.retrieval.ingest(&self.user_id, &doc, &[]).await?;
                sqlx::query(
                    r#"
                    INSERT INTO sync_state (user_id, key, hash) VALUES (?, ?, ?)
                    ON CONFLICT(user_id, key) DO UPDATE SET hash = excluded.hash
                    "#,
                )
                .bind(&self.user_id)
                .bind(key)
                .bind(content_hash(&body))
                .execute(&self.pool)
                .await?;
            }
            None => {
                self.notes.remove(key)?;
                self.remote.delete(&self.user_id, key).await?;
                self.retrieval.forget_document(&self.user_id, key).await?;
                sqlx::query("DELETE FROM sync_state WHERE user_id = ? AND key = ?")
                    .bind(&self.user_id)
                    .bind(key)
                    .execute(&self.pool)
                    .await?;
            }
        }

        sqlx::query("DELETE FROM conflicts WHERE user_id = ? AND key = ?")
            .bind(&self.user_id)
            .bind(key)
            .execute(&self.pool)
            .await?;

        tracing::info!(key, ?chosen, "conflict resolved");
        if self.phase() == SyncPhase::ConflictPending && self.pending_conflicts().await?.is_empty()
        {
            self.set_phase(SyncPhase::Idle);
        }
        Ok(())
    }

    async fn apply_op(&self, op: &PlanOp) -> Result<AppliedChange> {
        match op {
            PlanOp::Create { key, direction } | PlanOp::Update { key, direction } => {
                match direction {
                    Direction::Push => {
                        let body = self.notes.read(key)?;
                        self.remote.push(&self.user_id, key, &body).await?;
                        Ok(AppliedChange::Upserted(content_hash(&body)))
                    }
                    Direction::Pull => {
                        let body = self.remote.fetch(&self.user_id, key).await?;
                        self.notes.write(key, &body)?;
                        Ok(AppliedChange::Upserted(content_hash(&body)))
                    }
                }
            }
            PlanOp::Delete { key, direction } => {
                match direction {
                    // Local deletion propagates out.
                    Direction::Push => self.remote.delete(&self.user_id, key).await?,
                    // Remote deletion lands locally.
                    Direction::Pull => self.notes.remove(key)?,
                }
                Ok(AppliedChange::Deleted)
            }
            PlanOp::Conflict { key } => Err(Error::Configuration(format!(
                "conflict op for `{key}` cannot be applied"
            ))),
        }
    }

    async fn reindex_one(&self, key: &str, change: &AppliedChange) -> Result<()> {
        match change {
            AppliedChange::Upserted(_) => {
                let doc = self.notes.load_document(&self.user_id, key)?;
                self.retrieval.ingest(&self.user_id, &doc, &[]).await?;
                Ok(())
            }
            AppliedChange::Deleted => self.retrieval.forget_document(&self.user_id, key).await,
        }
    }

    async fn record_conflict(&self, key: &str) -> Result<()> {
        let local = self.notes.try_read(key)?;
        let remote = match self.remote.fetch(&self.user_id, key).await {
            Ok(body) => Some(body),
            Err(Error::NotFound(_)) => None,
            Err(e) => return Err(e),
        };
        tracing::warn!(key, "concurrent edits diverged, surfacing conflict");

        sqlx::query(
            r#"
            INSERT INTO conflicts (user_id, key, local_body, remote_body, detected_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(user_id, key) DO UPDATE SET
                local_body = excluded.local_body,
                remote_body = excluded.remote_body,
                detected_at = excluded.detected_at
            "#,
        )
        .bind(&self.user_id)
        .bind(key)
        .bind(&local)
        .bind(&remote)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_snapshot(&self) -> Result<SyncSnapshot> {
        let rows = sqlx::query("SELECT key, hash FROM sync_state WHERE user_id = ?")
            .bind(&self.user_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| (row.get("key"), row.get("hash")))
            .collect())
    }

    /// Replace the snapshot in one transaction — it is never partially
    /// persisted.
    async fn store_snapshot(&self, snapshot: &SyncSnapshot) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM sync_state WHERE user_id = ?")
            .bind(&self.user_id)
            .execute(&mut *tx)
            .await?;
        for (key, hash) in snapshot {
            sqlx::query("INSERT INTO sync_state (user_id, key, hash) VALUES (?, ?, ?)")
                .bind(&self.user_id)
                .bind(key)
                .bind(hash)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    fn cancelled(&self, report: &mut SyncReport) -> bool {
        if self.cancel.load(Ordering::SeqCst) {
            report.cancelled = true;
            true
        } else {
            false
        }
    }

    fn set_phase(&self, phase: SyncPhase) {
        tracing::debug!(user_id = %self.user_id, ?phase, "sync phase");
        self.state.write().unwrap().0 = phase;
    }

    fn fail<T>(&self, e: Error) -> Result<T> {
        tracing::error!(user_id = %self.user_id, error = %e, "sync cycle failed");
        self.set_phase(SyncPhase::Failed);
        Err(e)
    }
}

/// Classification of one knowledge base against the last reconciled
/// snapshot.
struct Diff {
    /// Ordered plan: creations and updates before deletions, conflicts
    /// carried for reporting.
    plan: Vec<PlanOp>,
    /// Keys equal on both sides, with their content hash. Includes
    /// both-changed-same-content documents, which may still need a
    /// reindex.
    settled: Vec<(String, String)>,
    /// Keys deleted on both sides; drop from the snapshot.
    both_deleted: Vec<String>,
    unchanged: usize,
}

/// Three-way diff of local tree, remote listing, and snapshot.
///
/// Deletions are ordered after creations and updates so a concurrent
/// query never observes the index shrink before replacement content
/// lands.
fn diff_states(
    local: &BTreeMap<String, LocalDoc>,
    remote: &BTreeMap<String, String>,
    snapshot: &SyncSnapshot,
) -> Diff {
    let mut keys: Vec<&String> = local
        .keys()
        .chain(remote.keys())
        .chain(snapshot.keys())
        .collect();
    keys.sort();
    keys.dedup();

    let mut upserts = Vec::new();
    let mut deletes = Vec::new();
    let mut conflicts = Vec::new();
    let mut settled = Vec::new();
    let mut both_deleted = Vec::new();
    let mut unchanged = 0usize;

    for key in keys {
        let l = local.get(key).map(|d| d.hash.as_str());
        let r = remote.get(key).map(|h| h.as_str());
        let s = snapshot.get(key).map(|h| h.as_str());

        match (l, r) {
            (Some(l), Some(r)) if l == r => {
                unchanged += 1;
                settled.push((key.clone(), l.to_string()));
            }
            (Some(l), Some(r)) => {
                if s == Some(l) {
                    // Local untouched since the snapshot: remote changed.
                    upserts.push(op_for(key, s.is_some(), Direction::Pull));
                } else if s == Some(r) {
                    upserts.push(op_for(key, s.is_some(), Direction::Push));
                } else {
                    conflicts.push(PlanOp::Conflict { key: key.clone() });
                }
            }
            (Some(l), None) => match s {
                None => upserts.push(PlanOp::Create {
                    key: key.clone(),
                    direction: Direction::Push,
                }),
                Some(s) if s == l => deletes.push(PlanOp::Delete {
                    key: key.clone(),
                    direction: Direction::Pull,
                }),
                // Edited here, deleted there.
                Some(_) => conflicts.push(PlanOp::Conflict { key: key.clone() }),
            },
            (None, Some(r)) => match s {
                None => upserts.push(PlanOp::Create {
                    key: key.clone(),
                    direction: Direction::Pull,
                }),
                Some(s) if s == r => deletes.push(PlanOp::Delete {
                    key: key.clone(),
                    direction: Direction::Push,
                }),
                Some(_) => conflicts.push(PlanOp::Conflict { key: key.clone() }),
            },
            (None, None) => both_deleted.push(key.clone()),
        }
    }

    let mut plan = conflicts;
    plan.extend(upserts);
    plan.extend(deletes);

    Diff {
        plan,
        settled,
        both_deleted,
        unchanged,
    }
}

fn op_for(key: &str, known: bool, direction: Direction) -> PlanOp {
    if known {
        PlanOp::Update {
            key: key.to_string(),
            direction,
        }
    } else {
        PlanOp::Create {
            key: key.to_string(),
            direction,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_doc(hash: &str) -> LocalDoc {
        LocalDoc {
            hash: hash.to_string(),
            updated_at: 0,
        }
    }

    fn maps(
        local: &[(&str, &str)],
        remote: &[(&str, &str)],
        snapshot: &[(&str, &str)],
    ) -> (
        BTreeMap<String, LocalDoc>,
        BTreeMap<String, String>,
        SyncSnapshot,
    ) {
        (
            local
                .iter()
                .map(|(k, h)| (k.to_string(), local_doc(h)))
                .collect(),
            remote
                .iter()
                .map(|(k, h)| (k.to_string(), h.to_string()))
                .collect(),
            snapshot
                .iter()
                .map(|(k, h)| (k.to_string(), h.to_string()))
                .collect(),
        )
    }

    #[test]
    fn test_diff_local_create_pushes() {
        let (l, r, s) = maps(&[("a.md", "h1")], &[], &[]);
        let diff = diff_states(&l, &r, &s);
        assert_eq!(
            diff.plan,
            vec![PlanOp::Create {
                key: "a.md".to_string(),
                direction: Direction::Push
            }]
        );
    }

    #[test]
    fn test_diff_remote_create_pulls() {
        let (l, r, s) = maps(&[], &[("a.md", "h1")], &[]);
        let diff = diff_states(&l, &r, &s);
        assert_eq!(
            diff.plan,
            vec![PlanOp::Create {
                key: "a.md".to_string(),
                direction: Direction::Pull
            }]
        );
    }

    #[test]
    fn test_diff_remote_edit_pulls_update() {
        let (l, r, s) = maps(&[("a.md", "h1")], &[("a.md", "h2")], &[("a.md", "h1")]);
        let diff = diff_states(&l, &r, &s);
        assert_eq!(
            diff.plan,
            vec![PlanOp::Update {
                key: "a.md".to_string(),
                direction: Direction::Pull
            }]
        );
    }

    #[test]
    fn test_diff_both_edited_same_is_settled() {
        let (l, r, s) = maps(&[("a.md", "h2")], &[("a.md", "h2")], &[("a.md", "h1")]);
        let diff = diff_states(&l, &r, &s);
        assert!(diff.plan.is_empty());
        assert_eq!(diff.settled, vec![("a.md".to_string(), "h2".to_string())]);
    }

    #[test]
    fn test_diff_both_edited_differently_conflicts() {
        let (l, r, s) = maps(&[("a.md", "h2")], &[("a.md", "h3")], &[("a.md", "h1")]);
        let diff = diff_states(&l, &r, &s);
        assert_eq!(
            diff.plan,
            vec![PlanOp::Conflict {
                key: "a.md".to_string()
            }]
        );
    }

    #[test]
    fn test_diff_delete_vs_edit_is_conflict() {
        // Deleted remotely, edited locally.
        let (l, r, s) = maps(&[("a.md", "h2")], &[], &[("a.md", "h1")]);
        let diff = diff_states(&l, &r, &s);
        assert_eq!(
            diff.plan,
            vec![PlanOp::Conflict {
                key: "a.md".to_string()
            }]
        );

        // Deleted locally, edited remotely.
        let (l, r, s) = maps(&[], &[("a.md", "h2")], &[("a.md", "h1")]);
        let diff = diff_states(&l, &r, &s);
        assert_eq!(
            diff.plan,
            vec![PlanOp::Conflict {
                key: "a.md".to_string()
            }]
        );
    }

    #[test]
    fn test_diff_clean_deletes_propagate() {
        let (l, r, s) = maps(&[("kept.md", "h1")], &[("kept.md", "h1")], &[("gone.md", "h9"), ("kept.md", "h1")]);
        // gone.md was deleted on both sides.
        let diff = diff_states(&l, &r, &s);
        assert!(diff.plan.is_empty());
        assert_eq!(diff.both_deleted, vec!["gone.md".to_string()]);
        assert_eq!(diff.unchanged, 1);
    }

    #[test]
    fn test_diff_orders_deletes_after_upserts() {
        let (l, r, s) = maps(
            &[("new.md", "h1")],
            &[("old.md", "h2")],
            &[("old.md", "h2")],
        );
        // new.md is a local create; old.md was deleted locally.
        let diff = diff_states(&l, &r, &s);
        assert_eq!(diff.plan.len(), 2);
        assert!(matches!(diff.plan[0], PlanOp::Create { .. }));
        assert!(matches!(diff.plan[1], PlanOp::Delete { .. }));
    }
}
