//! Append-only audit journal.
//!
//! Every gateway call produces exactly one entry. Entries carry a digest and
//! the sorted top-level keys of the parameters, never the values.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::observability::metrics;
use crate::policy::Risk;
use crate::store::file::{lock, DEFAULT_LOCK_TIMEOUT};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Ok,
    Error,
    Replayed,
}

/// One journal line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Unix seconds.
    pub ts: f64,
    pub request_id: String,
    pub tenant: String,
    pub method: String,
    pub risk: Risk,
    pub outcome: Outcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub params_digest: String,
    pub param_keys: Vec<String>,
    pub latency_ms: u64,
    pub retries: u32,
    pub allowlisted: bool,
    pub rest_v3: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
}

/// Destination for audit entries.
pub trait AuditSink: Send + Sync {
    fn append(&self, entry: &AuditEntry) -> std::io::Result<()>;
}

/// JSON lines appended under an exclusive file lock.
#[derive(Debug, Clone)]
pub struct FileAuditSink {
    path: PathBuf,
}

impl FileAuditSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl AuditSink for FileAuditSink {
    fn append(&self, entry: &AuditEntry) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let mut line = serde_json::to_vec(entry).map_err(std::io::Error::other)?;
        line.push(b'\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        lock(&file, true, DEFAULT_LOCK_TIMEOUT)?;
        file.write_all(&line)?;
        file.flush()
    }
}

/// Keeps entries in memory.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    entries: Mutex<Vec<AuditEntry>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries
            .lock()
            .map(|entries| entries.clone())
            .unwrap_or_default()
    }
}

impl AuditSink for MemoryAuditSink {
    fn append(&self, entry: &AuditEntry) -> std::io::Result<()> {
        self.entries
            .lock()
            .map_err(|_| std::io::Error::other("audit buffer poisoned"))?
            .push(entry.clone());
        Ok(())
    }
}

/// Best-effort journal front-end. Write failures never fail the call.
pub struct AuditLogger {
    sink: Option<Arc<dyn AuditSink>>,
    failures: AtomicU64,
}

impl AuditLogger {
    pub fn new(sink: Arc<dyn AuditSink>) -> Self {
        Self {
            sink: Some(sink),
            failures: AtomicU64::new(0),
        }
    }

    /// A logger that drops every entry.
    pub fn disabled() -> Self {
        Self {
            sink: None,
            failures: AtomicU64::new(0),
        }
    }

    pub fn record(&self, entry: &AuditEntry) {
        let Some(sink) = &self.sink else { return };
        if let Err(e) = sink.append(entry) {
            self.failures.fetch_add(1, Ordering::Relaxed);
            metrics::record_audit_failure();
            tracing::warn!(
                request_id = %entry.request_id,
                method = %entry.method,
                error = %e,
                "Failed to write audit entry"
            );
        }
    }

    /// Entries that could not be written.
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(outcome: Outcome) -> AuditEntry {
        AuditEntry {
            ts: 1_700_000_000.0,
            request_id: "req-1".into(),
            tenant: "portal".into(),
            method: "crm.lead.add".into(),
            risk: Risk::Write,
            outcome,
            error_code: None,
            error_message: None,
            params_digest: "abc".into(),
            param_keys: vec!["fields".into()],
            latency_ms: 12,
            retries: 0,
            allowlisted: true,
            rest_v3: false,
            plan_id: None,
            idempotency_key: Some("k".into()),
        }
    }

    struct FailingSink;

    impl AuditSink for FailingSink {
        fn append(&self, _: &AuditEntry) -> std::io::Result<()> {
            Err(std::io::Error::other("disk full"))
        }
    }

    #[test]
    fn test_file_sink_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("audit.jsonl");
        let logger = AuditLogger::new(Arc::new(FileAuditSink::new(&path)));
        logger.record(&entry(Outcome::Ok));
        logger.record(&entry(Outcome::Replayed));

        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<AuditEntry> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1].outcome, Outcome::Replayed);
        assert!(!content.contains("error_code"));
    }

    #[test]
    fn test_failures_are_counted_not_raised() {
        let logger = AuditLogger::new(Arc::new(FailingSink));
        logger.record(&entry(Outcome::Error));
        logger.record(&entry(Outcome::Ok));
        assert_eq!(logger.failures(), 2);
    }

    #[test]
    fn test_disabled_logger() {
        let logger = AuditLogger::disabled();
        logger.record(&entry(Outcome::Ok));
        assert_eq!(logger.failures(), 0);
    }
}
