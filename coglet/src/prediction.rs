//! Prediction request/response model.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::webhook::WebhookEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PredictionStatus {
    Starting,
    Processing,
    Succeeded,
    Failed,
    Canceled,
}

impl PredictionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Canceled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Processing => "processing",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }
}

/// A normalized prediction request, after the HTTP layer has validated the
/// body and filled in defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionRequest {
    pub id: String,
    pub input: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook: Option<String>,
    #[serde(default, skip_serializing_if = "HashSet::is_empty")]
    pub webhook_events_filter: HashSet<WebhookEvent>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_file_prefix: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub procedure_source_url: Option<String>,
}

impl PredictionRequest {
    pub fn new(id: impl Into<String>, input: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            input,
            webhook: None,
            webhook_events_filter: HashSet::new(),
            context: HashMap::new(),
            output_file_prefix: None,
            created_at: Utc::now(),
            procedure_source_url: None,
        }
    }

    /// Generate a prediction ID (UUIDv7, time-ordered).
    pub fn generate_id() -> String {
        uuid::Uuid::now_v7().to_string()
    }
}

/// The response record for one prediction. The owning runner mutates logs,
/// output, and status; everything else is fixed at admission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionResponse {
    pub id: String,
    pub status: PredictionStatus,
    pub input: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    pub logs: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metrics: HashMap<String, serde_json::Value>,
}

impl PredictionResponse {
    pub fn from_request(req: &PredictionRequest) -> Self {
        Self {
            id: req.id.clone(),
            status: PredictionStatus::Starting,
            input: req.input.clone(),
            output: None,
            logs: String::new(),
            error: None,
            created_at: req.created_at,
            started_at: None,
            completed_at: None,
            metrics: HashMap::new(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn set_processing(&mut self) {
        if !self.status.is_terminal() {
            self.status = PredictionStatus::Processing;
            if self.started_at.is_none() {
                self.started_at = Some(Utc::now());
            }
        }
    }

    pub fn append_logs(&mut self, chunk: &str) {
        self.logs.push_str(chunk);
    }

    /// Transition to a terminal status. Fills completed_at and the
    /// `predict_time` metric; user metrics never override it.
    pub fn mark_terminal(&mut self, status: PredictionStatus, error: Option<String>) {
        debug_assert!(status.is_terminal());
        if self.status.is_terminal() {
            return;
        }
        self.status = status;
        if let Some(e) = error {
            self.error = Some(e);
        }
        if self.started_at.is_none() {
            self.started_at = Some(self.created_at);
        }
        if self.completed_at.is_none() {
            self.completed_at = Some(Utc::now());
        }
        let predict_time = match (self.started_at, self.completed_at) {
            (Some(s), Some(c)) => (c - s).num_milliseconds() as f64 / 1000.0,
            _ => 0.0,
        };
        self.metrics.insert(
            "predict_time".to_string(),
            serde_json::json!(predict_time.max(0.0)),
        );
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_else(|_| serde_json::json!({"id": self.id}))
    }
}
