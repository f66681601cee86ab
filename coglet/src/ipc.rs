//! Worker protocol: IPC status pings and working-directory file formats.
//!
//! Three channels between a runner and its worker subprocess:
//! - **IPC pings** (`POST /_ipc`): `{name, pid, status}` state notifications.
//! - **Working directory files**: `config.json`, `openapi.json`,
//!   `request-{id}.json`, `response-{id}.json`, and the `stop` sentinel.
//! - **stdout/stderr**: log lines (see `logs`).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::prediction::PredictionStatus;

/// Worker state notification carried by an IPC ping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IpcStatus {
    /// Setup finished, or the last in-flight prediction completed.
    Ready,
    /// At least one prediction is in flight.
    Busy,
    /// One or more response files were updated and should be re-read.
    Output,
}

/// Body of `POST /_ipc`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcPing {
    pub name: String,
    pub pid: u32,
    pub status: IpcStatus,
}

/// `config.json`: worker settings written once by `Runner::configure`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerSettings {
    pub module: String,
    pub predictor: String,
    pub max_concurrency: usize,
}

/// `response-{id}.json`: the worker's view of one prediction, re-read on
/// every OUTPUT ping and merged into the store record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseFile {
    pub status: PredictionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metrics: HashMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

pub fn config_path(dir: &Path) -> PathBuf {
    dir.join("config.json")
}

pub fn schema_path(dir: &Path) -> PathBuf {
    dir.join("openapi.json")
}

pub fn request_path(dir: &Path, id: &str) -> PathBuf {
    dir.join(format!("request-{id}.json"))
}

pub fn response_path(dir: &Path, id: &str) -> PathBuf {
    dir.join(format!("response-{id}.json"))
}

pub fn stop_path(dir: &Path) -> PathBuf {
    dir.join("stop")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_roundtrips() {
        let ping = IpcPing {
            name: "default".to_string(),
            pid: 4242,
            status: IpcStatus::Ready,
        };
        let json = serde_json::to_value(&ping).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"name": "default", "pid": 4242, "status": "READY"})
        );

        let parsed: IpcPing =
            serde_json::from_str(r#"{"name":"proc-ab12","pid":7,"status":"OUTPUT"}"#).unwrap();
        assert_eq!(parsed.status, IpcStatus::Output);
        assert_eq!(parsed.name, "proc-ab12");
    }

    #[test]
    fn response_file_parses_minimal() {
        let parsed: ResponseFile = serde_json::from_str(r#"{"status":"processing"}"#).unwrap();
        assert_eq!(parsed.status, PredictionStatus::Processing);
        assert!(parsed.output.is_none());
        assert!(parsed.metrics.is_empty());
    }

    #[test]
    fn response_file_parses_terminal() {
        let parsed: ResponseFile = serde_json::from_str(
            r#"{"status":"failed","error":"boom","metrics":{"tokens":3}}"#,
        )
        .unwrap();
        assert_eq!(parsed.status, PredictionStatus::Failed);
        assert_eq!(parsed.error.as_deref(), Some("boom"));
        assert_eq!(parsed.metrics["tokens"], serde_json::json!(3));
    }

    #[test]
    fn paths_are_scoped_to_the_working_dir() {
        let dir = Path::new("/work/default");
        assert_eq!(
            request_path(dir, "p1"),
            PathBuf::from("/work/default/request-p1.json")
        );
        assert_eq!(
            response_path(dir, "p1"),
            PathBuf::from("/work/default/response-p1.json")
        );
        assert_eq!(stop_path(dir), PathBuf::from("/work/default/stop"));
    }
}
