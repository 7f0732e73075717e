//! Content-addressed module loader.
//!
//! Resolves a manifest's entry reference to an immutable set of source files
//! and materializes it under `<cache>/<sha256>/`. The digest covers every
//! file path and its contents, so two manifests with identical sources share
//! one cached copy and a changed byte always yields a new one.
//!
//! The cached copy is read-only and is re-hashed before every reuse; a copy
//! that no longer matches its digest is discarded and rebuilt. Capabilities
//! never run inside it. Each load copies the verified files into a fresh
//! per-invocation workspace, removed when the [`LoadedModule`] is dropped, so
//! nothing one invocation writes is visible to the next.
//!
//! Sources come from, in priority order:
//!
//! 1. the embedded `entryPoint.source` (for `main`) and `entryPoint.files`
//! 2. a local package directory (`entryPoint.package`)
//!
//! Embedded files override package files with the same relative path.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tempfile::TempDir;
use thiserror::Error;

use super::error::DispatchError;
use super::manifest::{CapabilityManifest, PackageRef};
use crate::logging::targets;

/// Maximum total size of a capability's sources (50MB)
pub const MAX_MODULE_SIZE: u64 = 50 * 1024 * 1024;

/// Maximum number of files in one capability package
pub const MAX_MODULE_FILES: usize = 10_000;

const COMPLETE_MARKER: &str = ".capdispatch-complete";

/// Module loading errors
#[derive(Error, Debug)]
pub enum LoaderError {
    #[error("entry file {0} not found in capability sources")]
    EntryNotFound(String),

    #[error("invalid source path {0}")]
    InvalidPath(String),

    #[error("package directory {path} unreadable: {message}")]
    PackageRead { path: String, message: String },

    #[error("capability sources exceed {max} bytes")]
    TooLarge { max: u64 },

    #[error("capability package has more than {0} files")]
    TooManyFiles(usize),

    #[error("failed to materialize module: {0}")]
    Materialize(String),
}

impl From<LoaderError> for DispatchError {
    fn from(e: LoaderError) -> Self {
        DispatchError::ModuleLoadFailed(e.to_string())
    }
}

/// A resolved capability module with its own working directory.
#[derive(Debug, Clone)]
pub struct LoadedModule {
    /// Hex SHA-256 over all source files.
    pub digest: String,
    /// Per-invocation working directory holding a copy of the sources.
    pub root: PathBuf,
    /// Entry file, relative to `root`.
    pub entry: String,
    /// Entry file contents.
    pub entry_bytes: Arc<[u8]>,
    _workspace: Arc<TempDir>,
}

impl LoadedModule {
    /// A single-file module in a throwaway workspace.
    #[cfg(test)]
    pub(crate) fn in_memory(entry: &str, bytes: Vec<u8>) -> Self {
        let mut sources = BTreeMap::new();
        sources.insert(entry.to_string(), bytes.clone());
        let workspace = tempfile::tempdir().expect("workspace tempdir");
        write_tree(workspace.path(), &sources).expect("workspace sources");
        Self {
            digest: digest_sources(&sources),
            root: workspace.path().to_path_buf(),
            entry: entry.to_string(),
            entry_bytes: bytes.into(),
            _workspace: Arc::new(workspace),
        }
    }

    pub fn entry_text(&self) -> Result<&str, DispatchError> {
        std::str::from_utf8(&self.entry_bytes).map_err(|e| {
            DispatchError::ModuleLoadFailed(format!("entry {} is not UTF-8: {e}", self.entry))
        })
    }
}

/// Hex SHA-256 over `(path, contents)` pairs in path order.
pub fn digest_sources(sources: &BTreeMap<String, Vec<u8>>) -> String {
    let mut hasher = Sha256::new();
    for (path, contents) in sources {
        hasher.update((path.len() as u64).to_le_bytes());
        hasher.update(path.as_bytes());
        hasher.update((contents.len() as u64).to_le_bytes());
        hasher.update(contents);
    }
    hex::encode(hasher.finalize())
}

/// Loads capability sources, keeps a verified copy in a content-addressed
/// cache directory and hands each invocation its own workspace.
#[derive(Debug, Clone)]
pub struct ModuleLoader {
    registry_root: PathBuf,
    cache_dir: PathBuf,
}

impl ModuleLoader {
    /// `registry_root` resolves relative package paths; `cache_dir` holds the
    /// materialized modules.
    pub fn new(registry_root: impl Into<PathBuf>, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            registry_root: registry_root.into(),
            cache_dir: cache_dir.into(),
        }
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Where the verified copy of the sources with `digest` is kept.
    pub fn cached_root(&self, digest: &str) -> PathBuf {
        self.cache_dir.join(digest)
    }

    /// Resolve and hash a manifest's sources, refresh the cached copy if it
    /// fails verification, then copy it into a fresh workspace.
    pub fn load(&self, manifest: &CapabilityManifest) -> Result<LoadedModule, LoaderError> {
        let entry = normalize_relative(&manifest.entry_point.main)?;
        let sources = self.collect_sources(manifest)?;
        let entry_bytes = sources
            .get(&entry)
            .cloned()
            .ok_or_else(|| LoaderError::EntryNotFound(entry.clone()))?;

        let digest = digest_sources(&sources);
        let cached = self.cached_root(&digest);
        let files = match read_verified(&cached, &digest) {
            Some(files) => files,
            None => {
                if cached.exists() {
                    tracing::warn!(
                        target: targets::SANDBOX,
                        capability_id = %manifest.id,
                        digest = %digest,
                        "cached module does not match its digest; rebuilding"
                    );
                    remove_stale(&cached)?;
                }
                self.materialize(&cached, &sources)?;
                sources
            }
        };

        let workspace = self.workspace(&files)?;
        tracing::debug!(
            capability_id = %manifest.id,
            digest = %digest,
            files = files.len(),
            workspace = %workspace.path().display(),
            "module loaded"
        );

        Ok(LoadedModule {
            digest,
            root: workspace.path().to_path_buf(),
            entry,
            entry_bytes: entry_bytes.into(),
            _workspace: Arc::new(workspace),
        })
    }

    /// A writable copy of `files` for one invocation.
    fn workspace(&self, files: &BTreeMap<String, Vec<u8>>) -> Result<TempDir, LoaderError> {
        let err = |e: std::io::Error| LoaderError::Materialize(e.to_string());
        fs::create_dir_all(&self.cache_dir).map_err(err)?;
        let workspace = tempfile::Builder::new()
            .prefix(".invocation-")
            .tempdir_in(&self.cache_dir)
            .map_err(err)?;
        write_tree(workspace.path(), files).map_err(err)?;
        Ok(workspace)
    }

    fn collect_sources(
        &self,
        manifest: &CapabilityManifest,
    ) -> Result<BTreeMap<String, Vec<u8>>, LoaderError> {
        let entry_point = &manifest.entry_point;
        let mut sources = BTreeMap::new();

        if let Some(PackageRef::Local { path }) = &entry_point.package {
            let dir = if Path::new(path).is_absolute() {
                PathBuf::from(path)
            } else {
                self.registry_root.join(path)
            };
            read_package_dir(&dir, &dir, &mut sources)?;
        }

        for (path, contents) in &entry_point.files {
            sources.insert(normalize_relative(path)?, contents.clone().into_bytes());
        }
        if let Some(source) = &entry_point.source {
            sources.insert(
                normalize_relative(&entry_point.main)?,
                source.clone().into_bytes(),
            );
        }

        let total: u64 = sources.values().map(|c| c.len() as u64).sum();
        if total > MAX_MODULE_SIZE {
            return Err(LoaderError::TooLarge {
                max: MAX_MODULE_SIZE,
            });
        }
        Ok(sources)
    }

    /// Write sources into a staging directory, then rename it into place.
    /// A concurrent loader that wins the rename leaves identical contents, so
    /// losing the race is not an error.
    fn materialize(
        &self,
        root: &Path,
        sources: &BTreeMap<String, Vec<u8>>,
    ) -> Result<(), LoaderError> {
        let err = |e: std::io::Error| LoaderError::Materialize(e.to_string());

        fs::create_dir_all(&self.cache_dir).map_err(err)?;
        let staging = tempfile::Builder::new()
            .prefix(".staging-")
            .tempdir_in(&self.cache_dir)
            .map_err(err)?;

        write_tree(staging.path(), sources).map_err(err)?;
        for path in sources.keys() {
            let target = staging.path().join(path);
            let mut permissions = fs::metadata(&target).map_err(err)?.permissions();
            permissions.set_readonly(true);
            fs::set_permissions(&target, permissions).map_err(err)?;
        }
        fs::write(staging.path().join(COMPLETE_MARKER), b"").map_err(err)?;

        let staging_path = staging.into_path();
        match fs::rename(&staging_path, root) {
            Ok(()) => Ok(()),
            Err(_) if root.join(COMPLETE_MARKER).exists() => {
                let _ = fs::remove_dir_all(&staging_path);
                Ok(())
            }
            Err(e) => {
                let _ = fs::remove_dir_all(&staging_path);
                // a stale partial directory from an interrupted run
                if root.exists() {
                    fs::remove_dir_all(root).map_err(err)?;
                    return self.materialize(root, sources);
                }
                Err(err(e))
            }
        }
    }
}

/// Re-read a cached copy; `None` unless it is complete and hashes to `digest`.
fn read_verified(cached: &Path, digest: &str) -> Option<BTreeMap<String, Vec<u8>>> {
    if !cached.join(COMPLETE_MARKER).is_file() {
        return None;
    }
    let mut files = BTreeMap::new();
    read_package_dir(cached, cached, &mut files).ok()?;
    files.remove(COMPLETE_MARKER);
    (digest_sources(&files) == digest).then_some(files)
}

fn remove_stale(cached: &Path) -> Result<(), LoaderError> {
    match fs::remove_dir_all(cached) {
        Ok(()) => Ok(()),
        // another loader already cleared it
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(LoaderError::Materialize(e.to_string())),
    }
}

fn write_tree(dir: &Path, files: &BTreeMap<String, Vec<u8>>) -> std::io::Result<()> {
    for (path, contents) in files {
        let target = dir.join(path);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&target, contents)?;
    }
    Ok(())
}

/// Reject absolute and parent-relative paths; normalize separators.
fn normalize_relative(raw: &str) -> Result<String, LoaderError> {
    let mut parts = Vec::new();
    for component in Path::new(raw).components() {
        match component {
            Component::Normal(part) => match part.to_str() {
                Some(p) => parts.push(p.to_string()),
                None => return Err(LoaderError::InvalidPath(raw.to_string())),
            },
            Component::CurDir => {}
            _ => return Err(LoaderError::InvalidPath(raw.to_string())),
        }
    }
    if parts.is_empty() || raw.contains('\\') || raw.contains('\0') {
        return Err(LoaderError::InvalidPath(raw.to_string()));
    }
    Ok(parts.join("/"))
}

/// Recursively read regular files under `dir`. Symlinks are skipped.
fn read_package_dir(
    base: &Path,
    dir: &Path,
    sources: &mut BTreeMap<String, Vec<u8>>,
) -> Result<(), LoaderError> {
    let read_err = |e: std::io::Error| LoaderError::PackageRead {
        path: dir.display().to_string(),
        message: e.to_string(),
    };

    for entry in fs::read_dir(dir).map_err(read_err)? {
        let entry = entry.map_err(read_err)?;
        let file_type = entry.file_type().map_err(read_err)?;
        let path = entry.path();
        if file_type.is_symlink() {
            tracing::debug!(path = %path.display(), "skipping symlink in capability package");
            continue;
        }
        if file_type.is_dir() {
            read_package_dir(base, &path, sources)?;
        } else if file_type.is_file() {
            if sources.len() >= MAX_MODULE_FILES {
                return Err(LoaderError::TooManyFiles(MAX_MODULE_FILES));
            }
            let relative = path
                .strip_prefix(base)
                .map_err(|_| LoaderError::InvalidPath(path.display().to_string()))?;
            let relative = normalize_relative(&relative.to_string_lossy())?;
            let contents = fs::read(&path).map_err(read_err)?;
            sources.insert(relative, contents);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::manifest::{EntryPoint, Language, SecurityBlock};
    use tempfile::TempDir;

    fn manifest(entry_point: EntryPoint) -> CapabilityManifest {
        CapabilityManifest {
            id: "loader-test".to_string(),
            verb: "LOAD".to_string(),
            version: "1.0.0".to_string(),
            language: Language::Python,
            description: String::new(),
            entry_point,
            security: SecurityBlock::default(),
            configuration: Vec::new(),
            input_definitions: Vec::new(),
            output_definitions: Vec::new(),
        }
    }

    fn embedded(main: &str, source: &str) -> EntryPoint {
        EntryPoint {
            main: main.to_string(),
            source: Some(source.to_string()),
            ..EntryPoint::default()
        }
    }

    #[test]
    fn test_embedded_source_materialized() {
        let cache = TempDir::new().unwrap();
        let loader = ModuleLoader::new(cache.path(), cache.path().join("modules"));
        let module = loader.load(&manifest(embedded("main.py", "print(1)"))).unwrap();
        assert_eq!(module.entry, "main.py");
        assert_eq!(&*module.entry_bytes, b"print(1)");
        assert_eq!(module.digest.len(), 64);
        assert_eq!(
            fs::read_to_string(module.root.join("main.py")).unwrap(),
            "print(1)"
        );
        let cached = loader.cached_root(&module.digest);
        assert_eq!(fs::read_to_string(cached.join("main.py")).unwrap(), "print(1)");
        assert!(fs::metadata(cached.join("main.py")).unwrap().permissions().readonly());
        assert_ne!(module.root, cached);
    }

    #[test]
    fn test_identical_sources_share_cache_not_workspace() {
        let cache = TempDir::new().unwrap();
        let loader = ModuleLoader::new(cache.path(), cache.path().join("modules"));
        let a = loader.load(&manifest(embedded("main.py", "x = 1"))).unwrap();
        let b = loader.load(&manifest(embedded("main.py", "x = 1"))).unwrap();
        let c = loader.load(&manifest(embedded("main.py", "x = 2"))).unwrap();
        assert_eq!(a.digest, b.digest);
        assert_ne!(a.root, b.root);
        assert_ne!(a.digest, c.digest);
    }

    #[test]
    fn test_workspace_writes_do_not_reach_next_load() {
        let cache = TempDir::new().unwrap();
        let loader = ModuleLoader::new(cache.path(), cache.path().join("modules"));
        let m = manifest(embedded("main.py", "x = 1"));

        let first = loader.load(&m).unwrap();
        fs::create_dir_all(first.root.join("data")).unwrap();
        fs::write(first.root.join("data/count.json"), "1").unwrap();
        fs::write(first.root.join("main.py"), "x = 666").unwrap();
        let first_root = first.root.clone();
        drop(first);
        assert!(!first_root.exists());

        let second = loader.load(&m).unwrap();
        assert!(!second.root.join("data").exists());
        assert_eq!(fs::read_to_string(second.root.join("main.py")).unwrap(), "x = 1");
    }

    #[test]
    fn test_tampered_cache_is_rebuilt() {
        let cache = TempDir::new().unwrap();
        let loader = ModuleLoader::new(cache.path(), cache.path().join("modules"));
        let m = manifest(embedded("main.py", "x = 1"));
        let digest = loader.load(&m).unwrap().digest;

        let cached = loader.cached_root(&digest);
        fs::remove_file(cached.join("main.py")).unwrap();
        fs::write(cached.join("main.py"), "x = 666").unwrap();
        fs::write(cached.join("planted.py"), "evil").unwrap();

        let module = loader.load(&m).unwrap();
        assert_eq!(module.digest, digest);
        assert_eq!(fs::read_to_string(module.root.join("main.py")).unwrap(), "x = 1");
        assert!(!module.root.join("planted.py").exists());
        assert_eq!(fs::read_to_string(cached.join("main.py")).unwrap(), "x = 1");
        assert!(!cached.join("planted.py").exists());
    }

    #[test]
    fn test_incomplete_cache_is_rebuilt() {
        let cache = TempDir::new().unwrap();
        let loader = ModuleLoader::new(cache.path(), cache.path().join("modules"));
        let m = manifest(embedded("main.py", "x = 1"));
        let digest = loader.load(&m).unwrap().digest;

        let cached = loader.cached_root(&digest);
        fs::remove_file(cached.join(COMPLETE_MARKER)).unwrap();
        let module = loader.load(&m).unwrap();
        assert!(cached.join(COMPLETE_MARKER).is_file());
        assert_eq!(&*module.entry_bytes, b"x = 1");
    }

    #[test]
    fn test_local_package_with_override() {
        let registry = TempDir::new().unwrap();
        let pkg = registry.path().join("pkgs/echo");
        fs::create_dir_all(pkg.join("lib")).unwrap();
        fs::write(pkg.join("main.py"), "import lib.util").unwrap();
        fs::write(pkg.join("lib/util.py"), "VALUE = 1").unwrap();

        let loader = ModuleLoader::new(registry.path(), registry.path().join("cache"));
        let mut entry = EntryPoint {
            main: "main.py".to_string(),
            package: Some(PackageRef::Local {
                path: "pkgs/echo".to_string(),
            }),
            ..EntryPoint::default()
        };
        entry
            .files
            .insert("lib/util.py".to_string(), "VALUE = 2".to_string());

        let module = loader.load(&manifest(entry)).unwrap();
        assert_eq!(&*module.entry_bytes, b"import lib.util");
        assert_eq!(
            fs::read_to_string(module.root.join("lib/util.py")).unwrap(),
            "VALUE = 2"
        );
    }

    #[test]
    fn test_missing_entry() {
        let cache = TempDir::new().unwrap();
        let loader = ModuleLoader::new(cache.path(), cache.path());
        let entry = EntryPoint {
            main: "main.py".to_string(),
            ..EntryPoint::default()
        };
        assert!(matches!(
            loader.load(&manifest(entry)),
            Err(LoaderError::EntryNotFound(_))
        ));
    }

    #[test]
    fn test_rejects_escaping_paths() {
        let cache = TempDir::new().unwrap();
        let loader = ModuleLoader::new(cache.path(), cache.path());
        assert!(matches!(
            loader.load(&manifest(embedded("../main.py", "x"))),
            Err(LoaderError::InvalidPath(_))
        ));
        let mut entry = embedded("main.py", "x");
        entry
            .files
            .insert("/etc/evil".to_string(), "x".to_string());
        assert!(loader.load(&manifest(entry)).is_err());
    }

    #[test]
    fn test_loader_error_maps_to_module_load_failed() {
        let err: DispatchError = LoaderError::EntryNotFound("x".to_string()).into();
        assert_eq!(
            err.kind(),
            crate::plugins::error::ErrorKind::ModuleLoadFailed
        );
    }

    #[test]
    fn test_digest_depends_on_paths() {
        let mut a = BTreeMap::new();
        a.insert("a".to_string(), b"bc".to_vec());
        let mut b = BTreeMap::new();
        b.insert("ab".to_string(), b"c".to_vec());
        assert_ne!(digest_sources(&a), digest_sources(&b));
    }
}
