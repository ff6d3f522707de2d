//! Append-only lifecycle event log: newline-delimited JSON, one record per
//! event, consumed by the observability pipeline outside this process.

use serde::Serialize;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EventLogError {
    #[error("failed to serialize event")]
    Serialize(#[from] serde_json::Error),

    #[error("failed to append event")]
    Io(#[from] std::io::Error),
}

/// Outcome recorded when a runner goes away.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopStatus {
    Normal,
    Abnormal,
    Crashed,
}

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    RunnerInstalled {
        timestamp: i64,
        flavor: String,
        runner_name: String,
        duration: Option<i64>,
    },
    RunnerStart {
        timestamp: i64,
        flavor: String,
        runner_name: String,
        idle: i64,
    },
    RunnerStop {
        timestamp: i64,
        flavor: String,
        runner_name: String,
        status: StopStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        workflow: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        repository: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        job_duration: Option<i64>,
    },
    Reconciliation {
        timestamp: i64,
        flavor: String,
        crashed: usize,
        idle: usize,
        busy: usize,
        active: usize,
        #[serde(skip_serializing_if = "Option::is_none")]
        expected: Option<u32>,
        duration: f64,
    },
}

/// Serialized writer over one local file. Clones share the file and the
/// line-level lock, so concurrent per-runner tasks never interleave
/// records.
#[derive(Clone, Debug)]
pub struct EventLog {
    path: PathBuf,
    lock: Arc<Mutex<()>>,
}

impl EventLog {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn append(&self, event: &Event) -> Result<(), EventLogError> {
        let mut line = serde_json::to_string(event)?;
        line.push('\n');

        let guard = self
            .lock
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        drop(guard);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn events_append_as_ndjson() {
        let tmp = TempDir::new().unwrap();
        let log = EventLog::new(tmp.path().join("sub").join("metrics.jsonl"));

        log.append(&Event::RunnerInstalled {
            timestamp: 1_700_000_000,
            flavor: "unit-0".into(),
            runner_name: "mgr-a-abc12".into(),
            duration: Some(120),
        })
        .unwrap();
        log.append(&Event::Reconciliation {
            timestamp: 1_700_000_100,
            flavor: "unit-0".into(),
            crashed: 0,
            idle: 3,
            busy: 0,
            active: 3,
            expected: Some(3),
            duration: 4.2,
        })
        .unwrap();

        let contents = std::fs::read_to_string(tmp.path().join("sub").join("metrics.jsonl")).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["event"], "runner_installed");
        assert_eq!(first["runner_name"], "mgr-a-abc12");

        let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["event"], "reconciliation");
        assert_eq!(second["expected"], 3);
    }

    #[test]
    fn stop_event_omits_absent_job_fields() {
        let tmp = TempDir::new().unwrap();
        let log = EventLog::new(tmp.path().join("metrics.jsonl"));

        log.append(&Event::RunnerStop {
            timestamp: 1,
            flavor: "unit-0".into(),
            runner_name: "mgr-a-abc12".into(),
            status: StopStatus::Crashed,
            workflow: None,
            repository: None,
            job_duration: None,
        })
        .unwrap();

        let contents = std::fs::read_to_string(tmp.path().join("metrics.jsonl")).unwrap();
        let record: serde_json::Value = serde_json::from_str(contents.trim()).unwrap();
        assert_eq!(record["status"], "crashed");
        assert!(record.get("workflow").is_none());
    }

    #[test]
    fn reconciliation_omits_expected_in_reactive_mode() {
        let tmp = TempDir::new().unwrap();
        let log = EventLog::new(tmp.path().join("metrics.jsonl"));

        log.append(&Event::Reconciliation {
            timestamp: 1,
            flavor: "unit-0".into(),
            crashed: 1,
            idle: 0,
            busy: 2,
            active: 2,
            expected: None,
            duration: 0.5,
        })
        .unwrap();

        let contents = std::fs::read_to_string(tmp.path().join("metrics.jsonl")).unwrap();
        let record: serde_json::Value = serde_json::from_str(contents.trim()).unwrap();
        assert!(record.get("expected").is_none());
    }
}
