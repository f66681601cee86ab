//! HTTP route handlers.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use axum::{
    Router,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json},
    routing::{get, post, put},
};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::Config;
use crate::health::{Concurrency, Health, SetupResult};
use crate::ipc::IpcPing;
use crate::manager::{CancellationToken, ManagerError, RunnerManager};
use crate::prediction::PredictionRequest;
use crate::version::VersionInfo;
use crate::webhook::WebhookEvent;

#[derive(Debug, Serialize)]
pub struct HealthCheckResponse {
    pub status: Health,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub setup: Option<SetupResult>,
    pub concurrency: Concurrency,
    pub version: VersionInfo,
}

async fn root() -> impl IntoResponse {
    Json(serde_json::json!({
        "message": "coglet prediction server",
        "version": crate::version::COGLET_VERSION,
    }))
}

async fn health_check(State(manager): State<Arc<RunnerManager>>) -> Json<HealthCheckResponse> {
    let status = manager.status();

    if matches!(status, Health::Ready | Health::Busy) {
        write_readiness_file(manager.config());
    }

    Json(HealthCheckResponse {
        status,
        setup: manager.setup_result(),
        concurrency: manager.concurrency(),
        version: VersionInfo::new(),
    })
}

/// Create the readiness file for the K8s readiness probe. Idempotent; only
/// applies inside Kubernetes.
fn write_readiness_file(config: &Config) {
    if std::env::var("KUBERNETES_SERVICE_HOST").is_err() {
        return;
    }

    let file = &config.readiness_path;
    if file.exists() {
        return;
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};

        if let Some(dir) = file.parent() {
            let mut builder = std::fs::DirBuilder::new();
            builder.recursive(true).mode(0o700);
            if let Err(e) = builder.create(dir) {
                tracing::warn!(dir = %dir.display(), error = %e, "Failed to create readiness directory");
                return;
            }
        }

        if let Err(e) = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(file)
        {
            tracing::warn!(path = %file.display(), error = %e, "Failed to write readiness file");
        }
    }

    #[cfg(not(unix))]
    if let Err(e) = std::fs::write(file, b"") {
        tracing::warn!(path = %file.display(), error = %e, "Failed to write readiness file");
    }
}

async fn openapi_schema(State(manager): State<Arc<RunnerManager>>) -> impl IntoResponse {
    match manager.schema() {
        (Some(schema), true) => (StatusCode::OK, Json(schema)),
        _ => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "error": "OpenAPI schema not available"
            })),
        ),
    }
}

fn should_respond_async(headers: &HeaderMap) -> bool {
    headers
        .get("prefer")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == "respond-async")
        .unwrap_or(false)
}

fn bad_request(msg: &str) -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({
            "status": "failed",
            "error": msg,
        })),
    )
}

fn map_error(e: ManagerError) -> (StatusCode, Json<serde_json::Value>) {
    let status = match &e {
        ManagerError::NoCapacity | ManagerError::Conflict(_) | ManagerError::Duplicate(_) => {
            StatusCode::CONFLICT
        }
        ManagerError::Defunct | ManagerError::ShuttingDown | ManagerError::NotReady => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        ManagerError::SetupFailed(_) | ManagerError::Internal(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
        ManagerError::PredictionNotFound(_) | ManagerError::RunnerNotFound(_) => {
            StatusCode::NOT_FOUND
        }
        ManagerError::Canceled => StatusCode::BAD_REQUEST,
        // Guarded at the call sites; an async-only request is answered 202
        ManagerError::AsyncPrediction => StatusCode::ACCEPTED,
    };
    (
        status,
        Json(serde_json::json!({
            "status": "failed",
            "error": e.to_string(),
        })),
    )
}

/// Decode and validate a prediction request body.
fn parse_request(
    config: &Config,
    path_id: Option<String>,
    headers: &HeaderMap,
    body: Option<serde_json::Value>,
) -> Result<(PredictionRequest, bool), (StatusCode, Json<serde_json::Value>)> {
    let body = body.unwrap_or_else(|| serde_json::json!({}));
    let obj = body
        .as_object()
        .ok_or_else(|| bad_request("request body must be a JSON object"))?;

    let body_id = match obj.get("id") {
        None | Some(serde_json::Value::Null) => None,
        Some(serde_json::Value::String(s)) if !s.is_empty() => Some(s.clone()),
        Some(serde_json::Value::String(_)) => None,
        Some(_) => return Err(bad_request("id must be a string")),
    };
    if let (Some(path_id), Some(body_id)) = (&path_id, &body_id)
        && path_id != body_id
    {
        return Err(bad_request(
            "prediction ID must match the ID supplied in the URL",
        ));
    }
    let id = path_id
        .or(body_id)
        .unwrap_or_else(PredictionRequest::generate_id);

    let input = match obj.get("input") {
        None | Some(serde_json::Value::Null) => serde_json::json!({}),
        Some(v) if v.is_object() => v.clone(),
        Some(_) => return Err(bad_request("input must be a JSON object")),
    };

    let webhook = match obj.get("webhook") {
        None | Some(serde_json::Value::Null) => None,
        Some(serde_json::Value::String(s)) if !s.is_empty() => Some(s.clone()),
        Some(serde_json::Value::String(_)) => None,
        Some(_) => return Err(bad_request("webhook must be a string")),
    };

    let webhook_events_filter: HashSet<WebhookEvent> = match obj.get("webhook_events_filter") {
        None | Some(serde_json::Value::Null) => HashSet::new(),
        Some(v) => serde_json::from_value(v.clone())
            .map_err(|_| bad_request("webhook_events_filter must be a list of events"))?,
    };

    let respond_async = should_respond_async(headers);
    if respond_async && webhook.is_none() {
        return Err(bad_request("Prefer: respond-async requires a webhook"));
    }

    let context: HashMap<String, serde_json::Value> = match obj.get("context") {
        None | Some(serde_json::Value::Null) => HashMap::new(),
        Some(v) if v.is_object() => serde_json::from_value(v.clone()).unwrap_or_default(),
        Some(_) => return Err(bad_request("context must be a JSON object")),
    };

    let mut procedure_source_url = None;
    if config.use_procedure_mode {
        let url = context
            .get("procedure_source_url")
            .and_then(|v| v.as_str())
            .unwrap_or("");
        let token = context
            .get("replicate_api_token")
            .and_then(|v| v.as_str())
            .unwrap_or("");
        if url.is_empty() || token.is_empty() {
            return Err(bad_request(
                "procedure requests require procedure_source_url and replicate_api_token in context",
            ));
        }
        procedure_source_url = Some(url.to_string());
    }

    let output_file_prefix = obj
        .get("output_file_prefix")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(String::from);

    let created_at = obj
        .get("created_at")
        .and_then(|v| v.as_str())
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);

    Ok((
        PredictionRequest {
            id,
            input,
            webhook,
            webhook_events_filter,
            context,
            output_file_prefix,
            created_at,
            procedure_source_url,
        },
        respond_async,
    ))
}

async fn handle_prediction(
    manager: Arc<RunnerManager>,
    path_id: Option<String>,
    headers: HeaderMap,
    body: Option<serde_json::Value>,
) -> (StatusCode, Json<serde_json::Value>) {
    // Idempotent PUT: an already-tracked ID answers with its current state.
    if let Some(ref id) = path_id
        && let Some(state) = manager.snapshot(id)
    {
        return (StatusCode::ACCEPTED, Json(state.to_json()));
    }

    let (request, respond_async) = match parse_request(manager.config(), path_id, &headers, body) {
        Ok(parsed) => parsed,
        Err(rejection) => return rejection,
    };

    let cancel = CancellationToken::new();
    if respond_async || request.webhook.is_some() {
        match manager.predict_async(&request, &cancel).await {
            Ok(snapshot) => (StatusCode::ACCEPTED, Json(snapshot.to_json())),
            Err(e) => map_error(e),
        }
    } else {
        match manager.predict_sync(&request, &cancel).await {
            // Terminal failure/cancellation is prediction data, not an HTTP
            // error.
            Ok(response) => (StatusCode::OK, Json(response.to_json())),
            Err(e) => map_error(e),
        }
    }
}

async fn create_prediction(
    State(manager): State<Arc<RunnerManager>>,
    headers: HeaderMap,
    body: Option<Json<serde_json::Value>>,
) -> impl IntoResponse {
    handle_prediction(manager, None, headers, body.map(|Json(b)| b)).await
}

async fn create_prediction_idempotent(
    State(manager): State<Arc<RunnerManager>>,
    Path(prediction_id): Path<String>,
    headers: HeaderMap,
    body: Option<Json<serde_json::Value>>,
) -> impl IntoResponse {
    handle_prediction(manager, Some(prediction_id), headers, body.map(|Json(b)| b)).await
}

async fn cancel_prediction(
    State(manager): State<Arc<RunnerManager>>,
    Path(prediction_id): Path<String>,
) -> impl IntoResponse {
    match manager.cancel(&prediction_id) {
        Ok(()) => (StatusCode::OK, Json(serde_json::json!({}))),
        Err(_) => (StatusCode::NOT_FOUND, Json(serde_json::json!({}))),
    }
}

/// Worker status pings. Always 200: unknown runners are a tolerated race,
/// not a client error the worker could act on.
async fn ipc_ping(
    State(manager): State<Arc<RunnerManager>>,
    Json(ping): Json<IpcPing>,
) -> impl IntoResponse {
    if let Err(e) = manager.handle_runner_ipc(ping).await {
        tracing::warn!(error = %e, "Dropped IPC ping");
    }
    (StatusCode::OK, Json(serde_json::json!({})))
}

async fn shutdown(State(manager): State<Arc<RunnerManager>>) -> impl IntoResponse {
    tracing::info!("Shutdown requested via HTTP");
    manager.trigger_shutdown();
    (StatusCode::OK, Json(serde_json::json!({})))
}

pub fn routes(manager: Arc<RunnerManager>) -> Router {
    let prefix = if manager.config().use_procedure_mode {
        "/procedures"
    } else {
        "/predictions"
    };

    Router::new()
        .route("/", get(root))
        .route("/health-check", get(health_check))
        .route("/openapi.json", get(openapi_schema))
        .route("/shutdown", post(shutdown))
        .route("/_ipc", post(ipc_ping))
        .route(prefix, post(create_prediction))
        .route(
            &format!("{prefix}/{{id}}"),
            put(create_prediction_idempotent),
        )
        .route(
            &format!("{prefix}/{{id}}/cancel"),
            post(cancel_prediction),
        )
        .with_state(manager)
}
