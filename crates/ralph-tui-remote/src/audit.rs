//! Append-only audit log for auth attempts and config-push / orchestration
//! control actions (spec.md §4.7, SPEC_FULL.md §6). Grounded on the core
//! crate's append-only iteration-log convention
//! (`ralph_tui_core::log_sink::IterationLogSink`), generalized to a single
//! shared file opened once per server lifetime.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::Utc;
use serde::Serialize;

fn audit_log_path() -> PathBuf {
    directories::ProjectDirs::from("", "", "ralph-tui")
        .map(|dirs| dirs.config_dir().join("audit.jsonl"))
        .unwrap_or_else(|| PathBuf::from(".ralph-tui").join("audit.jsonl"))
}

#[derive(Debug, Clone, Serialize)]
struct AuditRecord<'a> {
    timestamp: chrono::DateTime<Utc>,
    client_id: &'a str,
    action: &'a str,
    outcome: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<&'a str>,
}

/// One append-only `O_APPEND`-opened file, shared by every connection this
/// server lifetime handles.
pub struct AuditLog {
    file: Mutex<std::fs::File>,
}

impl AuditLog {
    pub fn open() -> std::io::Result<Self> {
        let path = audit_log_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { file: Mutex::new(file) })
    }

    /// Record one audited event. Failures to write are logged, not
    /// propagated — an audit write must never abort the action it records.
    pub fn record(&self, client_id: &str, action: &str, outcome: &str, detail: Option<&str>) {
        let record = AuditRecord {
            timestamp: Utc::now(),
            client_id,
            action,
            outcome,
            detail,
        };
        let Ok(mut line) = serde_json::to_string(&record) else {
            return;
        };
        line.push('\n');

        let mut file = self.file.lock().expect("audit log mutex poisoned");
        if let Err(e) = file.write_all(line.as_bytes()) {
            tracing::warn!(error = %e, "failed to append audit log entry");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audit_record_serializes_without_detail() {
        let record = AuditRecord {
            timestamp: Utc::now(),
            client_id: "c1",
            action: "auth",
            outcome: "success",
            detail: None,
        };
        let json = serde_json::to_string(&record).unwrap();
        assert!(!json.contains("detail"));
        assert!(json.contains("\"action\":\"auth\""));
    }
}
