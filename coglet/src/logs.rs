//! Worker stdout/stderr parsing and log attribution.
//!
//! Workers emit two kinds of lines:
//! - Structured JSON records (`{"severity": ..., "message": ...,
//!   "prediction_id": ...?}`), re-emitted through `tracing` and never
//!   appended to a prediction.
//! - Free-form text, optionally tagged `[pid=<prediction-id>] `, appended to
//!   the matching prediction's logs.

use serde::Deserialize;

/// Which worker stream a line arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogSource {
    Stdout,
    Stderr,
}

impl LogSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

/// A structured log record from the worker.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerLogRecord {
    pub severity: String,
    pub message: String,
    #[serde(default)]
    pub prediction_id: Option<String>,
}

/// One parsed line of worker output.
#[derive(Debug, Clone)]
pub enum WorkerLine {
    /// Structured record; routed to the logger.
    Structured(WorkerLogRecord),
    /// Free-form text tagged with a prediction ID.
    Tagged { prediction_id: String, text: String },
    /// Free-form text with no attribution hint.
    Plain(String),
}

const PID_TAG: &str = "[pid=";

pub fn parse_line(line: &str) -> WorkerLine {
    let trimmed = line.trim_end_matches(['\r', '\n']);

    if trimmed.starts_with('{')
        && let Ok(record) = serde_json::from_str::<WorkerLogRecord>(trimmed)
    {
        return WorkerLine::Structured(record);
    }

    if let Some(rest) = trimmed.strip_prefix(PID_TAG)
        && let Some(end) = rest.find(']')
    {
        let id = &rest[..end];
        if !id.is_empty() {
            let text = rest[end + 1..].strip_prefix(' ').unwrap_or(&rest[end + 1..]);
            return WorkerLine::Tagged {
                prediction_id: id.to_string(),
                text: text.to_string(),
            };
        }
    }

    WorkerLine::Plain(trimmed.to_string())
}

/// Re-emit a structured worker record at its severity under the worker
/// target. Does not touch prediction state.
pub fn emit_structured(runner: &str, record: &WorkerLogRecord) {
    let prediction_id = record.prediction_id.as_deref().unwrap_or("");
    match record.severity.to_ascii_lowercase().as_str() {
        "error" => {
            tracing::error!(target: "coglet::worker", runner, prediction_id, "{}", record.message)
        }
        "warn" | "warning" => {
            tracing::warn!(target: "coglet::worker", runner, prediction_id, "{}", record.message)
        }
        "debug" => {
            tracing::debug!(target: "coglet::worker", runner, prediction_id, "{}", record.message)
        }
        "trace" => {
            tracing::trace!(target: "coglet::worker", runner, prediction_id, "{}", record.message)
        }
        _ => tracing::info!(target: "coglet::worker", runner, prediction_id, "{}", record.message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_structured_record() {
        let line = r#"{"severity": "info", "message": "loading weights"}"#;
        match parse_line(line) {
            WorkerLine::Structured(r) => {
                assert_eq!(r.severity, "info");
                assert_eq!(r.message, "loading weights");
                assert!(r.prediction_id.is_none());
            }
            other => panic!("expected structured, got {:?}", other),
        }
    }

    #[test]
    fn parses_structured_record_with_prediction_id() {
        let line = r#"{"severity": "warn", "message": "slow step", "prediction_id": "p1"}"#;
        match parse_line(line) {
            WorkerLine::Structured(r) => {
                assert_eq!(r.prediction_id.as_deref(), Some("p1"));
            }
            other => panic!("expected structured, got {:?}", other),
        }
    }

    #[test]
    fn parses_tagged_line() {
        match parse_line("[pid=pred-42] step 3 of 10\n") {
            WorkerLine::Tagged {
                prediction_id,
                text,
            } => {
                assert_eq!(prediction_id, "pred-42");
                assert_eq!(text, "step 3 of 10");
            }
            other => panic!("expected tagged, got {:?}", other),
        }
    }

    #[test]
    fn malformed_json_is_plain() {
        match parse_line(r#"{"severity": truncated"#) {
            WorkerLine::Plain(text) => assert!(text.starts_with('{')),
            other => panic!("expected plain, got {:?}", other),
        }
    }

    #[test]
    fn json_without_log_fields_is_plain() {
        match parse_line(r#"{"foo": "bar"}"#) {
            WorkerLine::Plain(_) => {}
            other => panic!("expected plain, got {:?}", other),
        }
    }

    #[test]
    fn empty_tag_is_plain() {
        match parse_line("[pid=] no id here") {
            WorkerLine::Plain(_) => {}
            other => panic!("expected plain, got {:?}", other),
        }
    }

    #[test]
    fn untagged_text_is_plain() {
        match parse_line("Downloading model...") {
            WorkerLine::Plain(text) => assert_eq!(text, "Downloading model..."),
            other => panic!("expected plain, got {:?}", other),
        }
    }
}
