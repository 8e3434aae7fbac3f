use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::models::ChunkStrategy;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub user: UserConfig,
    pub db: DbConfig,
    pub notes: NotesConfig,
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub sync: SyncConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct UserConfig {
    /// Verified user identity. Authentication happens outside the core;
    /// every operation is scoped to this id's partition.
    pub id: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct NotesConfig {
    /// Root of the local document tree.
    pub root: PathBuf,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
}

fn default_include_globs() -> Vec<String> {
    vec!["**/*.md".to_string(), "**/*.txt".to_string()]
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_strategy")]
    pub strategy: ChunkStrategy,
    #[serde(default = "default_max_chars")]
    pub max_chars: usize,
    #[serde(default = "default_overlap")]
    pub overlap_chars: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            strategy: default_strategy(),
            max_chars: default_max_chars(),
            overlap_chars: default_overlap(),
        }
    }
}

fn default_strategy() -> ChunkStrategy {
    ChunkStrategy::Heading
}
fn default_max_chars() -> usize {
    2000
}
fn default_overlap() -> usize {
    200
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// `"hash"` (deterministic, offline) or `"http"` (OpenAI-compatible API).
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_dims")]
    pub dims: usize,
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: default_dims(),
            endpoint: default_endpoint(),
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_provider() -> String {
    "hash".to_string()
}
fn default_dims() -> usize {
    256
}
fn default_endpoint() -> String {
    "https://api.openai.com/v1/embeddings".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
        }
    }
}

fn default_top_k() -> usize {
    8
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct SyncConfig {
    /// Root of the shared remote directory (e.g. a synced mount). Sync
    /// commands fail with a configuration error when unset.
    pub remote_root: Option<PathBuf>,
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if config.user.id.trim().is_empty() {
        anyhow::bail!("user.id must not be empty");
    }

    // Validate chunking
    if config.chunking.max_chars == 0 {
        anyhow::bail!("chunking.max_chars must be > 0");
    }
    if config.chunking.overlap_chars >= config.chunking.max_chars {
        anyhow::bail!("chunking.overlap_chars must be < chunking.max_chars");
    }

    // Validate retrieval
    if config.retrieval.top_k == 0 {
        anyhow::bail!("retrieval.top_k must be >= 1");
    }

    // Validate embedding
    if config.embedding.dims == 0 {
        anyhow::bail!("embedding.dims must be > 0");
    }
    if config.embedding.batch_size == 0 {
        anyhow::bail!("embedding.batch_size must be > 0");
    }
    match config.embedding.provider.as_str() {
        "hash" => {}
        "http" => {
            if config.embedding.model.is_none() {
                anyhow::bail!("embedding.model must be specified when provider is 'http'");
            }
        }
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be hash or http.",
            other
        ),
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_config(dir: &tempfile::TempDir, body: &str) -> PathBuf {
        let path = dir.path().join("notemesh.toml");
        std::fs::write(&path, body).unwrap();
        path
    }

    const MINIMAL: &str = r#"
[user]
id = "ana"

[db]
path = "/tmp/nm.sqlite"

[notes]
root = "/tmp/notes"

[chunking]
max_chars = 800
overlap_chars = 80
"#;

    #[test]
    fn test_minimal_config_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = write_config(&dir, MINIMAL);
        let config = load_config(&path).unwrap();
        assert_eq!(config.user.id, "ana");
        assert_eq!(config.embedding.provider, "hash");
        assert_eq!(config.embedding.dims, 256);
        assert_eq!(config.retrieval.top_k, 8);
        assert!(config.sync.remote_root.is_none());
    }

    #[test]
    fn test_overlap_must_be_smaller_than_max() {
        let dir = tempfile::TempDir::new().unwrap();
        let body = MINIMAL.replace("overlap_chars = 80", "overlap_chars = 800");
        let path = write_config(&dir, &body);
        assert!(load_config(&path).is_err());
    }

    #[test]
    fn test_http_provider_requires_model() {
        let dir = tempfile::TempDir::new().unwrap();
        let body = format!("{MINIMAL}\n[embedding]\nprovider = \"http\"\n");
        let path = write_config(&dir, &body);
        let err = load_config(&path).unwrap_err();
        assert!(err.to_string().contains("embedding.model"));
    }

    #[test]
    fn test_unknown_provider_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let body = format!("{MINIMAL}\n[embedding]\nprovider = \"quantum\"\n");
        let path = write_config(&dir, &body);
        assert!(load_config(&path).is_err());
    }
}
