//! Error taxonomy for the retrieval and sync engine.
//!
//! Variants separate what callers must do next: configuration problems are
//! fatal to the call, transient provider failures are retried with bounded
//! backoff, fatal provider failures surface immediately, and index
//! corruption halts writes to the affected partition until repair.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Invalid parameters or configuration. Fatal to the call, never retried.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Transient provider failure (network, rate limit, 5xx). Retryable.
    #[error("provider unavailable: {0}")]
    ProviderTransient(String),

    /// Quota or auth failure. Not retryable within the current session.
    #[error("provider rejected request: {0}")]
    ProviderFatal(String),

    /// Input the provider cannot accept (e.g. text over its length limit).
    /// The caller must re-chunk smaller, not retry as-is.
    #[error("provider rejected input: {0}")]
    InvalidInput(String),

    /// A vector's dimension or model does not match the index's configured
    /// embedding space. Never silently coerced.
    #[error(
        "embedding space mismatch: index is {expected_dims}-dim `{expected_model}`, \
         got {got_dims}-dim `{got_model}`"
    )]
    EmbeddingSpaceMismatch {
        expected_model: String,
        expected_dims: usize,
        got_model: String,
        got_dims: usize,
    },

    /// An index invariant was violated. Writes to the partition are halted
    /// until manual repair; reads continue.
    #[error("index corruption in partition `{user_id}`: {detail}")]
    IndexCorruption { user_id: String, detail: String },

    /// The remote store could not be reached. The sync cycle fails with the
    /// prior sync state untouched and is safe to retry later.
    #[error("remote store unavailable: {0}")]
    RemoteUnavailable(String),

    #[error("document not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Db(#[from] sqlx::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Whether a bounded-backoff retry is worth attempting.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::ProviderTransient(_) | Error::RemoteUnavailable(_)
        )
    }
}
