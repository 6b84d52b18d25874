//! Local record of events the transport could not take
//!
//! Every undelivered event is logged with `warn!`. When a diagnostics file is
//! configured the full wire payload is also appended to it as one JSON line,
//! so an operator can reconcile what was missed during an outage.

use serde::Serialize;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

#[derive(Serialize)]
struct DiagnosticRecord<'a, T> {
    reason: &'a str,
    event: &'a T,
}

/// Diagnostic sink for undelivered events
pub struct DiagnosticSink {
    file_path: Option<PathBuf>,
    records: u64,
}

impl DiagnosticSink {
    pub fn new(file_path: Option<&str>) -> Self {
        if let Some(path) = file_path {
            info!(file_path = %path, "diagnostics_file_enabled");
        }
        Self { file_path: file_path.map(PathBuf::from), records: 0 }
    }

    /// Record one undelivered event. `event` is the wire payload.
    pub fn record<T: Serialize>(&mut self, event_id: &str, event_type: &str, event: &T, reason: &str) {
        self.records += 1;
        warn!(event_id = %event_id, event_type = %event_type, reason = %reason, "event_undelivered");

        let Some(path) = self.file_path.as_deref() else {
            return;
        };
        let result = serde_json::to_string(&DiagnosticRecord { reason, event })
            .map_err(std::io::Error::from)
            .and_then(|line| append_line(path, &line));
        if let Err(e) = result {
            error!(file = %path.display(), error = %e, "diagnostics_write_failed");
        }
    }

    /// Number of events recorded since start
    pub fn records(&self) -> u64 {
        self.records
    }
}

/// Append a line, creating parent directories on first use
fn append_line(path: &Path, line: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{}", line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_records_without_file() {
        let mut sink = DiagnosticSink::new(None);
        sink.record("e1", "zone_enter", &json!({"a": 1}), "transport_disconnected");
        assert_eq!(sink.records(), 1);
    }

    #[test]
    fn test_writes_jsonl() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("undelivered.jsonl");
        let mut sink = DiagnosticSink::new(path.to_str());

        sink.record("e1", "zone_enter", &json!({"event_id": "e1"}), "transport_disconnected");
        sink.record("e2", "zone_exit", &json!({"event_id": "e2"}), "publish_failed");

        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);

        let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["reason"], "publish_failed");
        assert_eq!(second["event"]["event_id"], "e2");
    }
}
