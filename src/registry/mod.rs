//! Capability registry: verb -> manifest lookup.
//!
//! [`FileRegistry`] scans a directory of manifests (`*.json`, or
//! `<dir>/manifest.json`) on every lookup, so capabilities published while
//! the dispatcher runs are found on the next poll. [`InMemoryRegistry`] is
//! for tests and embedding.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use thiserror::Error;

use crate::plugins::manifest::CapabilityManifest;

/// Manifest file name inside a capability directory.
pub const MANIFEST_FILE_NAME: &str = "manifest.json";

/// Largest manifest file read from disk (1MB)
const MAX_MANIFEST_BYTES: u64 = 1024 * 1024;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry directory {path} unreadable: {message}")]
    Io { path: String, message: String },

    #[error("registry unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait CapabilityRegistry: Send + Sync {
    /// Find the manifest registered for a verb (case-insensitive).
    async fn find_by_verb(
        &self,
        verb: &str,
    ) -> Result<Option<Arc<CapabilityManifest>>, RegistryError>;

    async fn list(&self) -> Result<Vec<Arc<CapabilityManifest>>, RegistryError>;
}

/// Manifests stored as files under one directory.
#[derive(Debug, Clone)]
pub struct FileRegistry {
    root: PathBuf,
}

impl FileRegistry {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Candidate manifest files, sorted by path.
    fn manifest_paths(&self) -> Result<Vec<PathBuf>, RegistryError> {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(RegistryError::Io {
                    path: self.root.display().to_string(),
                    message: e.to_string(),
                })
            }
        };

        let mut paths = Vec::new();
        for entry in entries.filter_map(Result::ok) {
            let path = entry.path();
            if path.is_dir() {
                let manifest = path.join(MANIFEST_FILE_NAME);
                if manifest.is_file() {
                    paths.push(manifest);
                }
            } else if path.extension().is_some_and(|ext| ext == "json") {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths)
    }

    fn read_manifest(path: &Path) -> Option<CapabilityManifest> {
        let too_large = std::fs::metadata(path)
            .map(|m| m.len() > MAX_MANIFEST_BYTES)
            .unwrap_or(true);
        if too_large {
            tracing::warn!(path = %path.display(), "skipping unreadable or oversized manifest");
            return None;
        }
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to read manifest");
                return None;
            }
        };
        match CapabilityManifest::from_json(&text) {
            Ok(manifest) => Some(manifest),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "skipping invalid manifest");
                None
            }
        }
    }

    fn scan(&self) -> Result<Vec<Arc<CapabilityManifest>>, RegistryError> {
        Ok(self
            .manifest_paths()?
            .iter()
            .filter_map(|p| Self::read_manifest(p))
            .map(Arc::new)
            .collect())
    }
}

#[async_trait]
impl CapabilityRegistry for FileRegistry {
    async fn find_by_verb(
        &self,
        verb: &str,
    ) -> Result<Option<Arc<CapabilityManifest>>, RegistryError> {
        let registry = self.clone();
        let verb = verb.to_string();
        let found = tokio::task::spawn_blocking(move || -> Result<_, RegistryError> {
            let mut matches = registry
                .scan()?
                .into_iter()
                .filter(|m| m.verb.eq_ignore_ascii_case(&verb));
            let first = matches.next();
            if let Some(first) = &first {
                let extra = matches.count();
                if extra > 0 {
                    tracing::warn!(
                        verb = %verb,
                        capability_id = %first.id,
                        ignored = extra,
                        "multiple capabilities registered for verb; using the first"
                    );
                }
            }
            Ok(first)
        })
        .await
        .map_err(|e| RegistryError::Unavailable(e.to_string()))??;
        Ok(found)
    }

    async fn list(&self) -> Result<Vec<Arc<CapabilityManifest>>, RegistryError> {
        let registry = self.clone();
        tokio::task::spawn_blocking(move || registry.scan())
            .await
            .map_err(|e| RegistryError::Unavailable(e.to_string()))?
    }
}

/// Manifests held in memory.
#[derive(Debug, Default)]
pub struct InMemoryRegistry {
    manifests: RwLock<Vec<Arc<CapabilityManifest>>>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a manifest, replacing any with the same id.
    pub fn register(&self, manifest: CapabilityManifest) -> Arc<CapabilityManifest> {
        let manifest = Arc::new(manifest);
        let mut manifests = self.manifests.write();
        manifests.retain(|m| m.id != manifest.id);
        manifests.push(Arc::clone(&manifest));
        manifest
    }

    pub fn remove(&self, id: &str) -> bool {
        let mut manifests = self.manifests.write();
        let before = manifests.len();
        manifests.retain(|m| m.id != id);
        manifests.len() != before
    }

    pub fn len(&self) -> usize {
        self.manifests.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.manifests.read().is_empty()
    }
}

#[async_trait]
impl CapabilityRegistry for InMemoryRegistry {
    async fn find_by_verb(
        &self,
        verb: &str,
    ) -> Result<Option<Arc<CapabilityManifest>>, RegistryError> {
        Ok(self
            .manifests
            .read()
            .iter()
            .find(|m| m.verb.eq_ignore_ascii_case(verb))
            .cloned())
    }

    async fn list(&self) -> Result<Vec<Arc<CapabilityManifest>>, RegistryError> {
        Ok(self.manifests.read().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn manifest_json(id: &str, verb: &str) -> String {
        format!(
            r#"{{"id":"{id}","verb":"{verb}","language":"javascript","entryPoint":{{"main":"index.js"}}}}"#
        )
    }

    #[tokio::test]
    async fn test_file_registry_finds_by_verb() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("echo.json"), manifest_json("echo", "ECHO")).unwrap();
        std::fs::create_dir_all(dir.path().join("search")).unwrap();
        std::fs::write(
            dir.path().join("search").join(MANIFEST_FILE_NAME),
            manifest_json("search", "SEARCH"),
        )
        .unwrap();
        std::fs::write(dir.path().join("broken.json"), "{nope").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let registry = FileRegistry::new(dir.path());
        let echo = registry.find_by_verb("echo").await.unwrap().unwrap();
        assert_eq!(echo.id, "echo");
        let search = registry.find_by_verb("SEARCH").await.unwrap().unwrap();
        assert_eq!(search.id, "search");
        assert!(registry.find_by_verb("MISSING").await.unwrap().is_none());
        assert_eq!(registry.list().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_file_registry_sees_new_manifests() {
        let dir = tempdir().unwrap();
        let registry = FileRegistry::new(dir.path());
        assert!(registry.find_by_verb("LATE").await.unwrap().is_none());
        std::fs::write(dir.path().join("late.json"), manifest_json("late", "LATE")).unwrap();
        assert!(registry.find_by_verb("LATE").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_missing_directory_is_empty() {
        let dir = tempdir().unwrap();
        let registry = FileRegistry::new(dir.path().join("absent"));
        assert!(registry.find_by_verb("ECHO").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_root_that_is_a_file_is_an_error() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("file");
        std::fs::write(&file, "x").unwrap();
        let registry = FileRegistry::new(&file);
        assert!(matches!(
            registry.find_by_verb("ECHO").await,
            Err(RegistryError::Io { .. })
        ));
    }

    #[tokio::test]
    async fn test_in_memory_register_replaces_by_id() {
        let registry = InMemoryRegistry::new();
        registry.register(CapabilityManifest::from_json(&manifest_json("a", "ONE")).unwrap());
        registry.register(CapabilityManifest::from_json(&manifest_json("a", "TWO")).unwrap());
        assert_eq!(registry.len(), 1);
        assert!(registry.find_by_verb("ONE").await.unwrap().is_none());
        assert!(registry.find_by_verb("two").await.unwrap().is_some());
        assert!(registry.remove("a"));
        assert!(registry.is_empty());
    }
}
