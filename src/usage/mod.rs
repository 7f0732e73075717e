//! Usage tracking module
//!
//! Counts capability invocations per capability with persistent JSON
//! storage. Recording is keyed by invocation id, so a retried invocation is
//! counted once.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fs::{self, File};
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Recent records kept on disk; also the idempotency window.
pub const MAX_RECENT_RECORDS: usize = 10_000;

/// Default path for usage data storage
pub fn default_usage_path() -> PathBuf {
    crate::config::resolve_state_dir().join("usage.json")
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Error)]
pub enum UsageError {
    #[error("usage storage error: {0}")]
    Io(#[from] std::io::Error),

    #[error("usage serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// One capability invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageRecord {
    pub invocation_id: String,
    pub capability_id: String,
    pub verb: String,
    /// Unix ms
    pub timestamp: u64,
}

/// Aggregated usage for one capability.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityUsage {
    pub capability_id: String,
    pub verb: String,
    pub invocations: u64,
    pub first_used_at: u64,
    pub last_used_at: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageData {
    #[serde(default)]
    pub capabilities: HashMap<String, CapabilityUsage>,
    #[serde(default)]
    pub recent: VecDeque<UsageRecord>,
}

/// Records invocations. Failures are reported to the caller, which logs
/// and continues.
pub trait UsageRecorder: Send + Sync {
    /// Returns `false` when the invocation id was already recorded.
    fn record(
        &self,
        invocation_id: &str,
        capability_id: &str,
        verb: &str,
    ) -> Result<bool, UsageError>;

    /// Persist anything still buffered.
    fn flush(&self) -> Result<(), UsageError> {
        Ok(())
    }
}

/// Discards everything.
#[derive(Debug, Default)]
pub struct NoopUsageRecorder;

impl UsageRecorder for NoopUsageRecorder {
    fn record(&self, _: &str, _: &str, _: &str) -> Result<bool, UsageError> {
        Ok(true)
    }
}

#[derive(Debug)]
struct TrackerState {
    data: UsageData,
    seen: HashSet<String>,
    dirty: bool,
    last_save: Option<Instant>,
}

/// Usage tracker with persistence
#[derive(Debug)]
pub struct UsageTracker {
    path: PathBuf,
    state: RwLock<TrackerState>,
    save_interval: Duration,
}

impl UsageTracker {
    /// Create an empty tracker writing to `path`
    pub fn new(path: PathBuf) -> Self {
        Self::with_data(path, UsageData::default())
    }

    fn with_data(path: PathBuf, data: UsageData) -> Self {
        let seen = data.recent.iter().map(|r| r.invocation_id.clone()).collect();
        Self {
            path,
            state: RwLock::new(TrackerState {
                data,
                seen,
                dirty: false,
                last_save: None,
            }),
            save_interval: Duration::from_secs(5),
        }
    }

    /// Minimum interval between saves; zero saves on every record.
    pub fn with_save_interval(mut self, interval: Duration) -> Self {
        self.save_interval = interval;
        self
    }

    /// Load usage data from disk or create default
    pub fn load_or_default(path: PathBuf) -> Self {
        if path.exists() {
            match File::open(&path) {
                Ok(file) => match serde_json::from_reader(BufReader::new(file)) {
                    Ok(data) => return Self::with_data(path, data),
                    Err(e) => {
                        tracing::warn!(path = %path.display(), "failed to parse usage data: {}", e);
                    }
                },
                Err(e) => {
                    tracing::warn!(path = %path.display(), "failed to open usage file: {}", e);
                }
            }
        }
        Self::new(path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write pending changes now.
    pub fn flush(&self) -> Result<(), UsageError> {
        let mut state = self.state.write();
        self.save_locked(&mut state)
    }

    pub fn capability_usage(&self, capability_id: &str) -> Option<CapabilityUsage> {
        self.state.read().data.capabilities.get(capability_id).cloned()
    }

    pub fn total_invocations(&self) -> u64 {
        self.state
            .read()
            .data
            .capabilities
            .values()
            .map(|c| c.invocations)
            .sum()
    }

    fn save_locked(&self, state: &mut TrackerState) -> Result<(), UsageError> {
        if !state.dirty {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_vec_pretty(&state.data)?;
        let temp_path = self.path.with_extension("json.tmp");
        {
            let mut file = File::create(&temp_path)?;
            file.write_all(&content)?;
            file.sync_all()?;
        }
        fs::rename(&temp_path, &self.path)?;
        state.dirty = false;
        state.last_save = Some(Instant::now());
        Ok(())
    }
}

impl UsageRecorder for UsageTracker {
    fn flush(&self) -> Result<(), UsageError> {
        UsageTracker::flush(self)
    }

    fn record(
        &self,
        invocation_id: &str,
        capability_id: &str,
        verb: &str,
    ) -> Result<bool, UsageError> {
        let mut state = self.state.write();
        if state.seen.contains(invocation_id) {
            return Ok(false);
        }

        let timestamp = now_ms();
        let usage = state
            .data
            .capabilities
            .entry(capability_id.to_string())
            .or_insert_with(|| CapabilityUsage {
                capability_id: capability_id.to_string(),
                verb: verb.to_string(),
                first_used_at: timestamp,
                ..CapabilityUsage::default()
            });
        usage.invocations += 1;
        usage.last_used_at = timestamp;
        usage.verb = verb.to_string();

        state.data.recent.push_back(UsageRecord {
            invocation_id: invocation_id.to_string(),
            capability_id: capability_id.to_string(),
            verb: verb.to_string(),
            timestamp,
        });
        state.seen.insert(invocation_id.to_string());
        while state.data.recent.len() > MAX_RECENT_RECORDS {
            if let Some(old) = state.data.recent.pop_front() {
                state.seen.remove(&old.invocation_id);
            }
        }
        state.dirty = true;

        let due = match state.last_save {
            Some(ts) => ts.elapsed() >= self.save_interval,
            None => true,
        };
        if due {
            self.save_locked(&mut state)?;
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_record_is_idempotent_per_invocation() {
        let dir = tempdir().unwrap();
        let tracker = UsageTracker::new(dir.path().join("usage.json"));
        assert!(tracker.record("inv-1", "echo", "ECHO").unwrap());
        assert!(!tracker.record("inv-1", "echo", "ECHO").unwrap());
        assert!(tracker.record("inv-2", "echo", "ECHO").unwrap());
        let usage = tracker.capability_usage("echo").unwrap();
        assert_eq!(usage.invocations, 2);
        assert_eq!(usage.verb, "ECHO");
        assert!(usage.last_used_at >= usage.first_used_at);
    }

    #[test]
    fn test_persists_and_reloads() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested/usage.json");
        let tracker = UsageTracker::new(path.clone()).with_save_interval(Duration::ZERO);
        tracker.record("inv-1", "echo", "ECHO").unwrap();
        tracker.record("inv-2", "search", "SEARCH").unwrap();
        tracker.flush().unwrap();
        assert!(path.exists());
        assert!(!path.with_extension("json.tmp").exists());

        let reloaded = UsageTracker::load_or_default(path);
        assert_eq!(reloaded.total_invocations(), 2);
        // the idempotency window survives a restart
        assert!(!reloaded.record("inv-1", "echo", "ECHO").unwrap());
    }

    #[test]
    fn test_corrupt_file_starts_fresh() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("usage.json");
        fs::write(&path, "{not json").unwrap();
        let tracker = UsageTracker::load_or_default(path);
        assert_eq!(tracker.total_invocations(), 0);
    }

    #[test]
    fn test_noop_recorder() {
        assert!(NoopUsageRecorder.record("a", "b", "C").unwrap());
    }
}
