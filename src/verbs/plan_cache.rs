//! Plans produced by escalation, keyed by action verb.
//!
//! Entries never expire here. [`FilePlanCache`] stores one JSON file per verb
//! and replaces it with write-then-rename, so a repeated `put` for the same
//! verb leaves exactly one well-formed entry.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PlanCacheError {
    #[error("plan cache I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("plan cache entry is malformed: {0}")]
    Malformed(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedPlan {
    pub action_verb: String,
    pub plan: Value,
    pub cached_at: DateTime<Utc>,
}

impl CachedPlan {
    pub fn new(action_verb: &str, plan: Value) -> Self {
        Self {
            action_verb: action_verb.to_string(),
            plan,
            cached_at: Utc::now(),
        }
    }
}

pub trait PlanCache: Send + Sync {
    fn get(&self, verb: &str) -> Result<Option<CachedPlan>, PlanCacheError>;

    fn put(&self, verb: &str, plan: Value) -> Result<CachedPlan, PlanCacheError>;
}

/// Verbs are matched case-insensitively everywhere.
fn cache_key(verb: &str) -> String {
    verb.trim().to_ascii_uppercase()
}

#[derive(Debug, Default)]
pub struct InMemoryPlanCache {
    plans: RwLock<HashMap<String, CachedPlan>>,
}

impl InMemoryPlanCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.plans.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.plans.read().is_empty()
    }
}

impl PlanCache for InMemoryPlanCache {
    fn get(&self, verb: &str) -> Result<Option<CachedPlan>, PlanCacheError> {
        Ok(self.plans.read().get(&cache_key(verb)).cloned())
    }

    fn put(&self, verb: &str, plan: Value) -> Result<CachedPlan, PlanCacheError> {
        let entry = CachedPlan::new(verb, plan);
        self.plans.write().insert(cache_key(verb), entry.clone());
        Ok(entry)
    }
}

/// One `<name>.json` file per verb under a directory.
#[derive(Debug, Clone)]
pub struct FilePlanCache {
    dir: PathBuf,
}

impl FilePlanCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Verbs are free-form text; names that are not plain identifiers are
    /// hashed so they cannot escape the directory.
    fn entry_path(&self, verb: &str) -> PathBuf {
        let key = cache_key(verb);
        let plain = !key.is_empty()
            && key.len() <= 64
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        let name = if plain {
            key
        } else {
            format!("h-{}", hex::encode(Sha256::digest(key.as_bytes())))
        };
        self.dir.join(format!("{name}.json"))
    }
}

impl PlanCache for FilePlanCache {
    fn get(&self, verb: &str) -> Result<Option<CachedPlan>, PlanCacheError> {
        let path = self.entry_path(verb);
        let content = match fs::read(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_slice(&content)?))
    }

    fn put(&self, verb: &str, plan: Value) -> Result<CachedPlan, PlanCacheError> {
        fs::create_dir_all(&self.dir)?;
        let entry = CachedPlan::new(verb, plan);
        let path = self.entry_path(verb);
        let content = serde_json::to_vec_pretty(&entry)?;

        let temp_path = path.with_extension(format!("json.{}.tmp", uuid::Uuid::new_v4().simple()));
        {
            let mut file = File::create(&temp_path)?;
            file.write_all(&content)?;
            file.sync_all()?;
        }
        if let Err(e) = fs::rename(&temp_path, &path) {
            let _ = fs::remove_file(&temp_path);
            return Err(e.into());
        }
        Ok(entry)
    }
}
