//! Health status types for the coglet runtime.

use serde::{Deserialize, Serialize};

/// Aggregate health of the runtime, as reported by `/health-check`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Health {
    /// Just started, status unknown
    #[default]
    Unknown,
    /// Running setup()
    Starting,
    /// Ready to accept predictions
    Ready,
    /// At capacity
    Busy,
    /// setup() failed
    SetupFailed,
    /// Unrecoverable error or shutting down
    Defunct,
}

/// Status of the setup phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SetupStatus {
    Starting,
    Succeeded,
    Failed,
}

/// Result of the setup phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetupResult {
    /// When setup started (ISO 8601 format).
    pub started_at: String,
    /// When setup completed (ISO 8601 format), if finished.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<SetupStatus>,
    /// Captured logs during setup.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub logs: String,
}

impl SetupResult {
    /// Create a new SetupResult with the current time as started_at.
    pub fn starting() -> Self {
        Self {
            started_at: chrono::Utc::now().to_rfc3339(),
            completed_at: None,
            status: Some(SetupStatus::Starting),
            logs: String::new(),
        }
    }

    /// Mark setup as succeeded with accumulated logs.
    pub fn succeeded(mut self, logs: String) -> Self {
        self.completed_at = Some(chrono::Utc::now().to_rfc3339());
        self.status = Some(SetupStatus::Succeeded);
        self.logs = logs;
        self
    }

    /// Mark setup as failed with error logs.
    pub fn failed(mut self, logs: String) -> Self {
        self.completed_at = Some(chrono::Utc::now().to_rfc3339());
        self.status = Some(SetupStatus::Failed);
        self.logs = logs;
        self
    }

    pub fn is_finished(&self) -> bool {
        matches!(
            self.status,
            Some(SetupStatus::Succeeded) | Some(SetupStatus::Failed)
        )
    }
}

/// Aggregate concurrency: current in-flight across all runners vs the
/// configured global cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Concurrency {
    pub current: usize,
    pub max: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_default_is_unknown() {
        assert_eq!(Health::default(), Health::Unknown);
    }

    #[test]
    fn health_serializes_screaming_snake_case() {
        assert_eq!(
            serde_json::to_value(Health::SetupFailed).unwrap(),
            serde_json::json!("SETUP_FAILED")
        );
        assert_eq!(
            serde_json::to_value(Health::Ready).unwrap(),
            serde_json::json!("READY")
        );
    }

    #[test]
    fn health_deserializes_screaming_snake_case() {
        assert_eq!(
            serde_json::from_str::<Health>("\"READY\"").unwrap(),
            Health::Ready
        );
        assert_eq!(
            serde_json::from_str::<Health>("\"SETUP_FAILED\"").unwrap(),
            Health::SetupFailed
        );
    }

    #[test]
    fn setup_status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_value(SetupStatus::Succeeded).unwrap(),
            serde_json::json!("succeeded")
        );
    }

    #[test]
    fn setup_result_lifecycle() {
        let setup = SetupResult::starting();
        assert!(!setup.is_finished());

        let done = setup.clone().succeeded("weights loaded\n".to_string());
        assert!(done.is_finished());
        assert_eq!(done.status, Some(SetupStatus::Succeeded));
        assert_eq!(done.logs, "weights loaded\n");
        assert!(done.completed_at.is_some());

        let failed = setup.failed("import error\n".to_string());
        assert_eq!(failed.status, Some(SetupStatus::Failed));
    }

    #[test]
    fn concurrency_serializes() {
        let c = Concurrency { current: 2, max: 4 };
        assert_eq!(
            serde_json::to_value(c).unwrap(),
            serde_json::json!({"current": 2, "max": 4})
        );
    }
}
