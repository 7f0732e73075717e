//! Structured audit logging for security-relevant dispatch events.
//!
//! Provides a global, non-blocking audit log that writes JSONL entries to
//! `{audit_dir}/audit.jsonl`. Events are sent through a bounded mpsc channel
//! and flushed to disk by a background Tokio task, so callers never block on
//! I/O. Every call is a no-op until [`AuditLog::init`] runs.
//!
//! ```no_run
//! use capdispatch::logging::audit::{self, AuditEvent, AuditLog};
//! use std::path::PathBuf;
//!
//! # async fn example() {
//! AuditLog::init(PathBuf::from("/var/lib/capdispatch")).await;
//! audit::audit(AuditEvent::CapabilityBlocked {
//!     capability_id: "echo".into(),
//!     verb: "ECHO".into(),
//!     reason: "manifest is unsigned".into(),
//! });
//! # }
//! ```

use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use super::redact::redact_json_value;

/// Maximum audit log file size before rotation (50 MB).
const MAX_FILE_SIZE: u64 = 50 * 1024 * 1024;

/// Bounded channel capacity for non-blocking writes.
const CHANNEL_CAPACITY: usize = 10_000;

const AUDIT_FILE_NAME: &str = "audit.jsonl";

const AUDIT_ROTATED_NAME: &str = "audit.jsonl.1";

// ---------------------------------------------------------------------------
// AuditEvent
// ---------------------------------------------------------------------------

/// Security-relevant events tracked by the audit log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditEvent {
    /// Trust or permission gate refused a capability.
    CapabilityBlocked {
        capability_id: String,
        verb: String,
        reason: String,
    },
    /// A manifest declares permissions that widen the sandbox.
    DangerousPermission {
        capability_id: String,
        permissions: Vec<String>,
    },
    CapabilityExecuted {
        capability_id: String,
        verb: String,
        invocation_id: String,
        success: bool,
        elapsed_ms: u64,
    },
    PlanCached {
        verb: String,
    },
    /// Escalation asked the generator for a new capability.
    CapabilityRequested {
        verb: String,
        accepted: bool,
    },
}

impl AuditEvent {
    /// Return the snake_case event name (matches the serde tag).
    pub fn event_name(&self) -> &'static str {
        match self {
            AuditEvent::CapabilityBlocked { .. } => "capability_blocked",
            AuditEvent::DangerousPermission { .. } => "dangerous_permission",
            AuditEvent::CapabilityExecuted { .. } => "capability_executed",
            AuditEvent::PlanCached { .. } => "plan_cached",
            AuditEvent::CapabilityRequested { .. } => "capability_requested",
        }
    }
}

// ---------------------------------------------------------------------------
// AuditEntry
// ---------------------------------------------------------------------------

/// A single line in the audit JSONL file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditEntry {
    /// RFC 3339 timestamp.
    pub ts: String,
    /// Snake-case event name.
    pub event: String,
    /// Event-specific payload, redacted.
    pub data: Value,
}

impl AuditEntry {
    fn from_event(event: &AuditEvent) -> Self {
        let mut data = serde_json::to_value(event).unwrap_or(Value::Null);
        redact_json_value(&mut data);
        Self {
            ts: Utc::now().to_rfc3339(),
            event: event.event_name().to_string(),
            data,
        }
    }
}

// ---------------------------------------------------------------------------
// AuditLog (global singleton)
// ---------------------------------------------------------------------------

static AUDIT_LOG: OnceLock<AuditLog> = OnceLock::new();

/// Global audit log backed by a bounded mpsc channel and a background writer.
pub struct AuditLog {
    tx: mpsc::Sender<WriterMessage>,
    dir: PathBuf,
}

impl AuditLog {
    /// Initialize the global audit log.
    ///
    /// Spawns a background Tokio task that drains the channel and writes JSONL.
    /// Calling this more than once is a no-op.
    pub async fn init(dir: PathBuf) {
        if AUDIT_LOG.get().is_some() {
            return;
        }
        if let Err(e) = fs::create_dir_all(&dir) {
            tracing::error!("audit: failed to create audit dir: {e}");
            return;
        }

        let (tx, rx) = mpsc::channel::<WriterMessage>(CHANNEL_CAPACITY);
        let log_path = dir.join(AUDIT_FILE_NAME);
        let rotated_path = dir.join(AUDIT_ROTATED_NAME);

        tokio::spawn(writer_task(rx, log_path, rotated_path));

        let _ = AUDIT_LOG.set(AuditLog { tx, dir });
    }

    /// Send an event to the background writer (non-blocking best-effort).
    pub fn log(&self, event: AuditEvent) {
        // try_send so callers never block; drop if the channel is full.
        let entry = AuditEntry::from_event(&event);
        if let Err(e) = self.tx.try_send(WriterMessage::Entry(entry)) {
            tracing::warn!("audit: channel full or closed, dropping event: {e}");
        }
    }
}

// ---------------------------------------------------------------------------
// Background writer task
// ---------------------------------------------------------------------------

enum WriterMessage {
    Entry(AuditEntry),
    /// Acknowledged once every earlier entry is on disk.
    Flush(oneshot::Sender<()>),
}

async fn writer_task(
    mut rx: mpsc::Receiver<WriterMessage>,
    log_path: PathBuf,
    rotated_path: PathBuf,
) {
    while let Some(message) = rx.recv().await {
        match message {
            WriterMessage::Entry(entry) => {
                if let Err(e) = append_entry(&entry, &log_path, &rotated_path) {
                    tracing::error!("audit: failed to write entry: {e}");
                }
            }
            WriterMessage::Flush(ack) => {
                let _ = ack.send(());
            }
        }
    }
}

fn append_entry(entry: &AuditEntry, log_path: &Path, rotated_path: &Path) -> std::io::Result<()> {
    let line = serde_json::to_string(entry)?;

    // rotate before writing
    if let Ok(meta) = fs::metadata(log_path) {
        if meta.len() >= MAX_FILE_SIZE {
            fs::rename(log_path, rotated_path)?;
        }
    }

    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)?;
    writeln!(file, "{line}")?;
    file.sync_all()
}

// ---------------------------------------------------------------------------
// Public convenience API
// ---------------------------------------------------------------------------

/// Log an audit event. No-ops silently if [`AuditLog::init`] has not been called.
pub fn audit(event: AuditEvent) {
    if let Some(log) = AUDIT_LOG.get() {
        log.log(event);
    }
}

/// Wait until every event logged so far has been written. Returns
/// immediately when the log is not initialized.
pub async fn flush() {
    let Some(log) = AUDIT_LOG.get() else {
        return;
    };
    let (ack, done) = oneshot::channel();
    if log.tx.send(WriterMessage::Flush(ack)).await.is_ok() {
        let _ = done.await;
    }
}

/// Read the most recent audit entries, most-recent last. Empty when the log
/// is not initialized or the file does not exist.
pub fn recent_audit_events(limit: usize) -> Vec<AuditEntry> {
    match AUDIT_LOG.get() {
        Some(log) => read_tail_entries(&log.dir.join(AUDIT_FILE_NAME), limit),
        None => Vec::new(),
    }
}

/// Read the last `limit` entries from a JSONL file.
fn read_tail_entries(path: &Path, limit: usize) -> Vec<AuditEntry> {
    let file = match fs::File::open(path) {
        Ok(f) => f,
        Err(_) => return Vec::new(),
    };

    let mut entries: Vec<AuditEntry> = BufReader::new(file)
        .lines()
        .map_while(Result::ok)
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| serde_json::from_str(&line).ok())
        .collect();

    if entries.len() > limit {
        entries.split_off(entries.len() - limit)
    } else {
        entries
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_event_names_are_unique() {
        let events = vec![
            AuditEvent::CapabilityBlocked {
                capability_id: "c".into(),
                verb: "V".into(),
                reason: "r".into(),
            },
            AuditEvent::DangerousPermission {
                capability_id: "c".into(),
                permissions: vec!["process.spawn".into()],
            },
            AuditEvent::CapabilityExecuted {
                capability_id: "c".into(),
                verb: "V".into(),
                invocation_id: "i".into(),
                success: true,
                elapsed_ms: 3,
            },
            AuditEvent::PlanCached { verb: "V".into() },
            AuditEvent::CapabilityRequested {
                verb: "V".into(),
                accepted: false,
            },
        ];
        let mut names: Vec<&str> = events.iter().map(|e| e.event_name()).collect();
        let total = names.len();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), total, "event names must be unique");
    }

    #[test]
    fn test_event_json_contains_type_tag() {
        let ev = AuditEvent::PlanCached {
            verb: "RESEARCH".into(),
        };
        let json: Value = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "plan_cached");
        assert_eq!(json["verb"], "RESEARCH");
    }

    #[test]
    fn test_entry_data_is_redacted() {
        let entry = AuditEntry::from_event(&AuditEvent::CapabilityBlocked {
            capability_id: "c".into(),
            verb: "V".into(),
            reason: "request carried Bearer abc.def".into(),
        });
        assert_eq!(entry.event, "capability_blocked");
        assert_eq!(entry.data["reason"], "request carried [REDACTED]");
    }

    #[test]
    fn test_append_and_tail_read() {
        let dir = TempDir::new().unwrap();
        let log_path = dir.path().join(AUDIT_FILE_NAME);
        let rotated = dir.path().join(AUDIT_ROTATED_NAME);
        for i in 0..5 {
            let entry = AuditEntry::from_event(&AuditEvent::PlanCached {
                verb: format!("V{i}"),
            });
            append_entry(&entry, &log_path, &rotated).unwrap();
        }
        std::fs::OpenOptions::new()
            .append(true)
            .open(&log_path)
            .and_then(|mut f| writeln!(f, "not json"))
            .unwrap();

        let tail = read_tail_entries(&log_path, 2);
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].data["verb"], "V3");
        assert_eq!(tail[1].data["verb"], "V4");
        assert!(read_tail_entries(&dir.path().join("missing"), 5).is_empty());
    }

    #[test]
    fn test_audit_without_init_is_noop() {
        audit(AuditEvent::PlanCached { verb: "X".into() });
    }
}
