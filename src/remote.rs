//! Remote storage capability.
//!
//! The sync engine talks to a shared remote repository through the
//! [`RemoteStore`] trait so backends are swappable: [`DirRemote`] targets a
//! shared directory (a synced mount, a network share), [`MemoryRemote`] is
//! the in-process twin used by tests. The engine never assumes more than
//! list/fetch/push/delete semantics, all scoped to one user's namespace.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;
use walkdir::WalkDir;

use crate::error::{Error, Result};
use crate::local::validate_key;
use crate::models::content_hash;

/// Remote document store, GitHub-like: a flat namespace of
/// `key → content` per user, with content hashes for cheap diffing.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// List the user's remote documents as `key → content hash`.
    async fn list(&self, user_id: &str) -> Result<BTreeMap<String, String>>;
    /// Fetch one document's content.
    async fn fetch(&self, user_id: &str, key: &str) -> Result<String>;
    /// Create or overwrite one document. Idempotent.
    async fn push(&self, user_id: &str, key: &str, body: &str) -> Result<()>;
    /// Delete one document. Deleting an absent key is a no-op.
    async fn delete(&self, user_id: &str, key: &str) -> Result<()>;
}

// ============ Directory Remote ============

/// Remote store backed by a shared directory, laid out as
/// `<root>/<user_id>/<key>`.
pub struct DirRemote {
    root: PathBuf,
}

impl DirRemote {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn user_dir(&self, user_id: &str) -> Result<PathBuf> {
        validate_key(user_id)?;
        Ok(self.root.join(user_id))
    }

    fn doc_path(&self, user_id: &str, key: &str) -> Result<PathBuf> {
        validate_key(key)?;
        Ok(self.user_dir(user_id)?.join(key))
    }
}

#[async_trait]
impl RemoteStore for DirRemote {
    async fn list(&self, user_id: &str) -> Result<BTreeMap<String, String>> {
        let dir = self.user_dir(user_id)?;
        let mut docs = BTreeMap::new();
        if !dir.is_dir() {
            // Nothing pushed yet for this user.
            return Ok(docs);
        }

        for entry in WalkDir::new(&dir) {
            let entry =
                entry.map_err(|e| Error::RemoteUnavailable(e.to_string()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            let relative = path.strip_prefix(&dir).unwrap_or(path);
            let key = relative.to_string_lossy().replace('\\', "/");
            let body = std::fs::read_to_string(path)
                .map_err(|e| Error::RemoteUnavailable(e.to_string()))?;
            docs.insert(key, content_hash(&body));
        }
        Ok(docs)
    }

    async fn fetch(&self, user_id: &str, key: &str) -> Result<String> {
        let path = self.doc_path(user_id, key)?;
        match std::fs::read_to_string(&path) {
            Ok(body) => Ok(body),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::NotFound(key.to_string()))
            }
            Err(e) => Err(Error::RemoteUnavailable(e.to_string())),
        }
    }

    async fn push(&self, user_id: &str, key: &str, body: &str) -> Result<()> {
        let path = self.doc_path(user_id, key)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::RemoteUnavailable(e.to_string()))?;
        }
        std::fs::write(&path, body).map_err(|e| Error::RemoteUnavailable(e.to_string()))
    }

    async fn delete(&self, user_id: &str, key: &str) -> Result<()> {
        let path = self.doc_path(user_id, key)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::RemoteUnavailable(e.to_string())),
        }
    }
}

// ============ In-Memory Remote ============

/// In-memory remote for tests: a `user → key → body` map behind an RwLock,
/// plus a switch that simulates the remote being unreachable.
#[derive(Default)]
pub struct MemoryRemote {
    docs: RwLock<HashMap<String, BTreeMap<String, String>>>,
    unavailable: AtomicBool,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Toggle simulated unavailability: while set, every operation fails
    /// with [`Error::RemoteUnavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::RemoteUnavailable("simulated outage".to_string()));
        }
        Ok(())
    }

    /// Direct content lookup for test assertions.
    pub fn get(&self, user_id: &str, key: &str) -> Option<String> {
        self.docs
            .read()
            .unwrap()
            .get(user_id)
            .and_then(|docs| docs.get(key).cloned())
    }
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    async fn list(&self, user_id: &str) -> Result<BTreeMap<String, String>> {
        self.check_available()?;
        let docs = self.docs.read().unwrap();
        Ok(docs
            .get(user_id)
            .map(|docs| {
                docs.iter()
                    .map(|(k, body)| (k.clone(), content_hash(body)))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn fetch(&self, user_id: &str, key: &str) -> Result<String> {
        self.check_available()?;
        self.get(user_id, key)
            .ok_or_else(|| Error::NotFound(key.to_string()))
    }

    async fn push(&self, user_id: &str, key: &str, body: &str) -> Result<()> {
        self.check_available()?;
        let mut docs = self.docs.write().unwrap();
        docs.entry(user_id.to_string())
            .or_default()
            .insert(key.to_string(), body.to_string());
        Ok(())
    }

    async fn delete(&self, user_id: &str, key: &str) -> Result<()> {
        self.check_available()?;
        let mut docs = self.docs.write().unwrap();
        if let Some(user_docs) = docs.get_mut(user_id) {
            user_docs.remove(key);
        }
        Ok(())
    }
}
