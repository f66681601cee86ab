//! Webhook delivery for async predictions.
//!
//! Implements the cog webhook protocol:
//! - Throttling (default 500ms between logs/output updates)
//! - Terminal webhooks retried with exponential backoff
//! - WEBHOOK_AUTH_TOKEN bearer authentication
//! - Events filtering (start, output, logs, completed)

use std::collections::HashSet;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::version::COGLET_VERSION;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WebhookEvent {
    Start,
    Output,
    Logs,
    Completed,
}

impl WebhookEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed)
    }

    /// Events subject to the rate-limit window.
    pub fn is_throttled(&self) -> bool {
        matches!(self, Self::Logs | Self::Output)
    }

    pub fn all() -> HashSet<WebhookEvent> {
        [Self::Start, Self::Output, Self::Logs, Self::Completed]
            .into_iter()
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub response_interval: Duration,
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub retry_status_codes: Vec<u16>,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            response_interval: Duration::from_millis(
                std::env::var("COG_THROTTLE_RESPONSE_INTERVAL")
                    .ok()
                    .and_then(|s| s.parse::<f64>().ok())
                    .map(|s| (s * 1000.0) as u64)
                    .unwrap_or(500),
            ),
            max_retries: 12,
            backoff_base: Duration::from_millis(100),
            retry_status_codes: vec![429, 500, 502, 503, 504],
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("webhook request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("webhook returned status {0}")]
    Status(u16),
    #[error("failed to build webhook client: {0}")]
    Client(String),
}

/// Shared webhook sender. One instance serves every prediction; the
/// per-prediction rate-limit timestamp is threaded in by the delivery task.
pub struct WebhookSender {
    config: WebhookConfig,
    client: reqwest::Client,
}

impl WebhookSender {
    pub fn new(config: WebhookConfig) -> Result<Self, WebhookError> {
        let mut headers = reqwest::header::HeaderMap::new();

        if let Ok(token) = std::env::var("WEBHOOK_AUTH_TOKEN")
            && let Ok(value) = reqwest::header::HeaderValue::from_str(&format!("Bearer {}", token))
        {
            headers.insert(reqwest::header::AUTHORIZATION, value);
        }

        let user_agent = format!("coglet/{}", COGLET_VERSION);
        if let Ok(value) = reqwest::header::HeaderValue::from_str(&user_agent) {
            headers.insert(reqwest::header::USER_AGENT, value);
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| WebhookError::Client(e.to_string()))?;

        Ok(Self { config, client })
    }

    /// POST a payload. Terminal events are retried with exponential backoff;
    /// everything else is a single attempt.
    pub async fn send(
        &self,
        url: &str,
        event: WebhookEvent,
        payload: &serde_json::Value,
    ) -> Result<(), WebhookError> {
        if url.is_empty() {
            return Ok(());
        }

        if event.is_terminal() {
            return self.send_with_retries(url, payload).await;
        }

        let response = self.client.post(url).json(payload).send().await?;
        let status = response.status().as_u16();
        if !response.status().is_success() {
            return Err(WebhookError::Status(status));
        }
        Ok(())
    }

    /// Event-filtered, rate-limited send. `last_updated` is the caller-owned
    /// throttle timestamp for this prediction; only `logs`/`output` events
    /// consult or advance it.
    pub async fn send_conditional(
        &self,
        url: &str,
        payload: &serde_json::Value,
        event: WebhookEvent,
        allowed_events: &HashSet<WebhookEvent>,
        last_updated: &mut Instant,
    ) -> Result<(), WebhookError> {
        if url.is_empty() {
            return Ok(());
        }

        if !allowed_events.is_empty() && !allowed_events.contains(&event) {
            return Ok(());
        }

        if event.is_throttled() {
            if last_updated.elapsed() < self.config.response_interval {
                return Ok(());
            }
            *last_updated = Instant::now();
        }

        self.send(url, event, payload).await
    }

    async fn send_with_retries(
        &self,
        url: &str,
        payload: &serde_json::Value,
    ) -> Result<(), WebhookError> {
        let mut attempt = 0;
        loop {
            match self.client.post(url).json(payload).send().await {
                Ok(response) => {
                    let status = response.status().as_u16();
                    if response.status().is_success() {
                        tracing::debug!(status = %status, "Terminal webhook sent successfully");
                        return Ok(());
                    }

                    if self.config.retry_status_codes.contains(&status) {
                        attempt += 1;
                        if attempt > self.config.max_retries {
                            tracing::error!(
                                status = %status,
                                attempts = attempt,
                                "Terminal webhook failed after max retries"
                            );
                            return Err(WebhookError::Status(status));
                        }

                        let backoff = self.config.backoff_base * (1 << attempt.min(10));
                        tracing::warn!(
                            status = %status,
                            attempt = attempt,
                            backoff_ms = backoff.as_millis(),
                            "Terminal webhook failed, retrying"
                        );
                        tokio::time::sleep(backoff).await;
                        continue;
                    }

                    tracing::error!(
                        status = %status,
                        "Terminal webhook failed with non-retryable status"
                    );
                    return Err(WebhookError::Status(status));
                }
                Err(e) => {
                    attempt += 1;
                    if attempt > self.config.max_retries {
                        tracing::error!(
                            error = %e,
                            attempts = attempt,
                            "Terminal webhook failed after max retries"
                        );
                        return Err(WebhookError::Transport(e));
                    }

                    let backoff = self.config.backoff_base * (1 << attempt.min(10));
                    tracing::warn!(
                        error = %e,
                        attempt = attempt,
                        backoff_ms = backoff.as_millis(),
                        "Terminal webhook request error, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn config_defaults() {
        let config = WebhookConfig::default();
        assert_eq!(config.response_interval, Duration::from_millis(500));
        assert_eq!(config.max_retries, 12);
        assert!(config.retry_status_codes.contains(&503));
    }

    #[test]
    fn event_classification() {
        assert!(!WebhookEvent::Start.is_terminal());
        assert!(!WebhookEvent::Output.is_terminal());
        assert!(!WebhookEvent::Logs.is_terminal());
        assert!(WebhookEvent::Completed.is_terminal());

        assert!(WebhookEvent::Logs.is_throttled());
        assert!(WebhookEvent::Output.is_throttled());
        assert!(!WebhookEvent::Start.is_throttled());
        assert!(!WebhookEvent::Completed.is_throttled());
    }

    #[test]
    fn event_serializes_lowercase() {
        assert_eq!(
            serde_json::to_value(WebhookEvent::Completed).unwrap(),
            serde_json::json!("completed")
        );
        assert_eq!(
            serde_json::from_str::<WebhookEvent>("\"logs\"").unwrap(),
            WebhookEvent::Logs
        );
    }

    fn test_config() -> WebhookConfig {
        WebhookConfig {
            response_interval: Duration::from_millis(500),
            max_retries: 2,
            backoff_base: Duration::from_millis(1),
            ..Default::default()
        }
    }

    fn throttle_clock() -> Instant {
        // Far enough in the past that the first throttled send always goes out
        Instant::now() - Duration::from_secs(10)
    }

    #[tokio::test]
    async fn terminal_posts_json() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/webhook"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let url = format!("{}/webhook", server.uri());
        let sender = WebhookSender::new(test_config()).unwrap();

        sender
            .send(
                &url,
                WebhookEvent::Completed,
                &serde_json::json!({"id": "pred_123", "status": "succeeded"}),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn terminal_retries_on_500() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/webhook"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(1)
            .mount(&server)
            .await;

        Mock::given(method("POST"))
            .and(path("/webhook"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let url = format!("{}/webhook", server.uri());
        let sender = WebhookSender::new(test_config()).unwrap();

        sender
            .send(
                &url,
                WebhookEvent::Completed,
                &serde_json::json!({"status": "succeeded"}),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn terminal_no_retry_on_400() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/webhook"))
            .respond_with(ResponseTemplate::new(400))
            .expect(1)
            .mount(&server)
            .await;

        let url = format!("{}/webhook", server.uri());
        let sender = WebhookSender::new(test_config()).unwrap();

        let result = sender
            .send(
                &url,
                WebhookEvent::Completed,
                &serde_json::json!({"status": "succeeded"}),
            )
            .await;

        assert!(matches!(result, Err(WebhookError::Status(400))));
    }

    #[tokio::test]
    async fn conditional_respects_filter() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/webhook"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let url = format!("{}/webhook", server.uri());
        let sender = WebhookSender::new(test_config()).unwrap();
        let allowed: HashSet<_> = [WebhookEvent::Completed].into_iter().collect();
        let mut last = throttle_clock();

        sender
            .send_conditional(
                &url,
                &serde_json::json!({"status": "processing"}),
                WebhookEvent::Logs,
                &allowed,
                &mut last,
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn conditional_empty_url_is_noop() {
        let sender = WebhookSender::new(test_config()).unwrap();
        let mut last = throttle_clock();

        sender
            .send_conditional(
                "",
                &serde_json::json!({}),
                WebhookEvent::Completed,
                &WebhookEvent::all(),
                &mut last,
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn conditional_throttles_logs_and_output() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/webhook"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let url = format!("{}/webhook", server.uri());
        let sender = WebhookSender::new(test_config()).unwrap();
        let allowed = WebhookEvent::all();
        let mut last = throttle_clock();

        sender
            .send_conditional(
                &url,
                &serde_json::json!({"logs": "a"}),
                WebhookEvent::Logs,
                &allowed,
                &mut last,
            )
            .await
            .unwrap();
        // Inside the window: both skipped
        sender
            .send_conditional(
                &url,
                &serde_json::json!({"logs": "ab"}),
                WebhookEvent::Logs,
                &allowed,
                &mut last,
            )
            .await
            .unwrap();
        sender
            .send_conditional(
                &url,
                &serde_json::json!({"output": "x"}),
                WebhookEvent::Output,
                &allowed,
                &mut last,
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn start_and_completed_are_never_throttled() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/webhook"))
            .respond_with(ResponseTemplate::new(200))
            .expect(3)
            .mount(&server)
            .await;

        let url = format!("{}/webhook", server.uri());
        let sender = WebhookSender::new(test_config()).unwrap();
        let allowed = WebhookEvent::all();
        // A fresh timestamp keeps logs/output inside the throttle window
        let mut last = Instant::now();

        sender
            .send_conditional(
                &url,
                &serde_json::json!({"status": "starting"}),
                WebhookEvent::Start,
                &allowed,
                &mut last,
            )
            .await
            .unwrap();
        sender
            .send_conditional(
                &url,
                &serde_json::json!({"status": "starting"}),
                WebhookEvent::Start,
                &allowed,
                &mut last,
            )
            .await
            .unwrap();
        sender
            .send_conditional(
                &url,
                &serde_json::json!({"status": "succeeded"}),
                WebhookEvent::Completed,
                &allowed,
                &mut last,
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn auth_token_sets_bearer_header() {
        // SAFETY: test runs single-threaded within this process section;
        // the var is removed before the test ends.
        unsafe { std::env::set_var("WEBHOOK_AUTH_TOKEN", "s3cret") };

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/webhook"))
            .and(header("authorization", "Bearer s3cret"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let url = format!("{}/webhook", server.uri());
        let sender = WebhookSender::new(test_config()).unwrap();

        sender
            .send(
                &url,
                WebhookEvent::Completed,
                &serde_json::json!({"status": "succeeded"}),
            )
            .await
            .unwrap();

        unsafe { std::env::remove_var("WEBHOOK_AUTH_TOKEN") };
    }
}
