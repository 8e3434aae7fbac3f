use sqlx::SqlitePool;

use crate::error::Result;

/// Create the schema. Idempotent — safe to run on every startup.
///
/// The index tables and the sync snapshot are independently loadable: a
/// missing index is rebuilt from the notes tree, a missing snapshot forces
/// a full re-scan on the next sync. Neither loss destroys documents.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    // Ingest bookkeeping: last indexed content hash per document.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            user_id TEXT NOT NULL,
            key TEXT NOT NULL,
            hash TEXT NOT NULL,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (user_id, key)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // One live row per (user, segment): the vector plus filter metadata.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS index_entries (
            user_id TEXT NOT NULL,
            segment_id TEXT NOT NULL,
            document_key TEXT NOT NULL,
            seq INTEGER NOT NULL,
            text TEXT NOT NULL,
            vector BLOB NOT NULL,
            dims INTEGER NOT NULL,
            model TEXT NOT NULL,
            tags_json TEXT NOT NULL DEFAULT '[]',
            doc_updated_at INTEGER NOT NULL,
            PRIMARY KEY (user_id, segment_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_entries_document
         ON index_entries(user_id, document_key)",
    )
    .execute(pool)
    .await?;

    // Last reconciled snapshot: document key -> content hash.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sync_state (
            user_id TEXT NOT NULL,
            key TEXT NOT NULL,
            hash TEXT NOT NULL,
            PRIMARY KEY (user_id, key)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Conflicts pending manual resolution; NULL body = deleted on that side.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS conflicts (
            user_id TEXT NOT NULL,
            key TEXT NOT NULL,
            local_body TEXT,
            remote_body TEXT,
            detected_at INTEGER NOT NULL,
            PRIMARY KEY (user_id, key)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}
