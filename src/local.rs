//! Local notes tree.
//!
//! The document tree on disk is the local source of truth for one user's
//! knowledge base. Keys are POSIX-style relative paths under the
//! configured root; scanning applies include/exclude globs and hashes
//! content for diffing against the sync snapshot.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use globset::{Glob, GlobSet, GlobSetBuilder};
use walkdir::WalkDir;

use crate::config::NotesConfig;
use crate::error::{Error, Result};
use crate::models::{content_hash, Document, DocumentOrigin};

/// Scan result for one file: content hash plus modification time.
#[derive(Debug, Clone)]
pub struct LocalDoc {
    pub hash: String,
    pub updated_at: i64,
}

pub struct NotesTree {
    root: PathBuf,
    include: GlobSet,
    exclude: GlobSet,
}

impl NotesTree {
    pub fn open(config: &NotesConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.root)?;

        let include = build_globset(&config.include_globs)?;

        let mut default_excludes = vec!["**/.git/**".to_string()];
        default_excludes.extend(config.exclude_globs.clone());
        let exclude = build_globset(&default_excludes)?;

        Ok(Self {
            root: config.root.clone(),
            include,
            exclude,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Walk the tree and return `key → (hash, mtime)` for every matching
    /// file. Pure read; deterministic ordering via the BTreeMap.
    pub fn scan(&self) -> Result<BTreeMap<String, LocalDoc>> {
        let mut docs = BTreeMap::new();

        for entry in WalkDir::new(&self.root) {
            let entry = entry.map_err(|e| Error::Io(e.into()))?;
            if !entry.file_type().is_file() {
                continue;
            }

            let path = entry.path();
            let relative = path.strip_prefix(&self.root).unwrap_or(path);
            let key = relative.to_string_lossy().replace('\\', "/");

            if self.exclude.is_match(&key) || !self.include.is_match(&key) {
                continue;
            }

            let body = std::fs::read_to_string(path).unwrap_or_default();
            docs.insert(
                key,
                LocalDoc {
                    hash: content_hash(&body),
                    updated_at: file_mtime(path),
                },
            );
        }

        Ok(docs)
    }

    pub fn read(&self, key: &str) -> Result<String> {
        let path = self.resolve(key)?;
        if !path.is_file() {
            return Err(Error::NotFound(key.to_string()));
        }
        Ok(std::fs::read_to_string(path)?)
    }

    pub fn try_read(&self, key: &str) -> Result<Option<String>> {
        match self.read(key) {
            Ok(body) => Ok(Some(body)),
            Err(Error::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn write(&self, key: &str, body: &str) -> Result<()> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, body)?;
        Ok(())
    }

    /// Remove a note. Removing an absent key is a no-op.
    pub fn remove(&self, key: &str) -> Result<()> {
        let path = self.resolve(key)?;
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Load a full [`Document`] for ingestion.
    pub fn load_document(&self, user_id: &str, key: &str) -> Result<Document> {
        let path = self.resolve(key)?;
        let body = self.read(key)?;
        Ok(Document {
            key: key.to_string(),
            user_id: user_id.to_string(),
            hash: content_hash(&body),
            updated_at: file_mtime(&path),
            body,
            origin: DocumentOrigin::Local(path),
        })
    }

    fn resolve(&self, key: &str) -> Result<PathBuf> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }
}

/// Reject keys that would escape the tree root or are not plain relative
/// paths.
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(Error::Configuration("document key must not be empty".to_string()));
    }
    let path = Path::new(key);
    let plain = path
        .components()
        .all(|c| matches!(c, Component::Normal(_)));
    if !plain {
        return Err(Error::Configuration(format!(
            "document key must be a plain relative path: {key}"
        )));
    }
    Ok(())
}

fn file_mtime(path: &Path) -> i64 {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern)
            .map_err(|e| Error::Configuration(format!("invalid glob '{pattern}': {e}")))?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| Error::Configuration(e.to_string()))
}
