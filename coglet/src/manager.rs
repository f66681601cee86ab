//! Runner manager: the scheduler that owns every runner.
//!
//! Selects a runner for each request, enforces global and per-runner
//! concurrency under a single mutex, spawns and evicts procedure runners,
//! drives webhook delivery, and drains everything on shutdown.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use tokio::sync::watch;
pub use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::health::{Concurrency, Health, SetupResult, SetupStatus};
use crate::ipc::{IpcPing, IpcStatus, WorkerSettings};
use crate::prediction::{PredictionRequest, PredictionResponse};
use crate::runner::{CommandSpawner, Runner, RunnerConfig, RunnerError, RunnerState, WorkerSpawner};
use crate::store::OutputStream;
use crate::webhook::{WebhookConfig, WebhookEvent, WebhookSender};

#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("Setup failed: {0}")]
    SetupFailed(String),
    #[error("Setup has not finished yet")]
    NotReady,
    #[error("Service is unavailable")]
    Defunct,
    #[error("Service is shutting down")]
    ShuttingDown,
    #[error("At capacity (all prediction slots busy)")]
    NoCapacity,
    #[error("{0}")]
    Conflict(String),
    #[error("prediction {0} already exists")]
    Duplicate(String),
    #[error("prediction {0} not found")]
    PredictionNotFound(String),
    #[error("runner {0} not found")]
    RunnerNotFound(String),
    #[error("request canceled before admission")]
    Canceled,
    #[error("prediction carries a webhook; it must be started asynchronously")]
    AsyncPrediction,
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<RunnerError> for ManagerError {
    fn from(e: RunnerError) -> Self {
        match e {
            RunnerError::NoCapacity => ManagerError::NoCapacity,
            RunnerError::NotReady => ManagerError::NotReady,
            RunnerError::Defunct => ManagerError::Defunct,
            RunnerError::ShuttingDown => ManagerError::ShuttingDown,
            RunnerError::Duplicate(id) => ManagerError::Duplicate(id),
            RunnerError::PredictionNotFound(id) => ManagerError::PredictionNotFound(id),
            RunnerError::WorkerSpawn(msg) => ManagerError::SetupFailed(msg),
            RunnerError::AlreadyConfigured => {
                ManagerError::Internal("runner already configured".to_string())
            }
            RunnerError::Io(e) => ManagerError::Internal(e.to_string()),
        }
    }
}

/// Affinity key for a procedure source URL.
fn procedure_key(url: &str) -> String {
    let digest = Sha256::digest(url.as_bytes());
    let mut key = String::with_capacity(8);
    for byte in digest.iter().take(4) {
        key.push_str(&format!("{byte:02x}"));
    }
    key
}

/// Worker exit code folded into the manager's exit severity. Signal deaths
/// count as non-clean.
fn exit_severity(code: Option<i32>) -> i32 {
    match code {
        Some(0) => 0,
        Some(c) if c > 0 => c,
        _ => 1,
    }
}

const DEFAULT_RUNNER: &str = "default";

struct ManagerState {
    runners: HashMap<String, Arc<Runner>>,
    started: bool,
    draining: bool,
    exit_max: i32,
    /// Synthetic setup result for procedure mode, where there is no default
    /// runner to report one.
    procedure_setup: Option<SetupResult>,
    proc_seq: u64,
}

/// One placement decision, taken under the manager mutex.
enum Placement {
    Admitted {
        runner: Arc<Runner>,
        snapshot: PredictionResponse,
        caller: OutputStream,
        monitor: OutputStream,
    },
    Evict(Arc<Runner>),
    Launch(Arc<Runner>),
    WaitReady(Arc<Runner>),
}

pub struct RunnerManager {
    config: Config,
    spawner: Arc<dyn WorkerSpawner>,
    webhook: WebhookSender,
    state: Mutex<ManagerState>,
    /// Sum of in-flight predictions across all runners.
    current: AtomicUsize,
    shutdown_tx: watch::Sender<bool>,
}

impl RunnerManager {
    pub fn new(config: Config) -> Result<Arc<Self>, ManagerError> {
        Self::with_spawner(config, Arc::new(CommandSpawner))
    }

    pub fn with_spawner(
        config: Config,
        spawner: Arc<dyn WorkerSpawner>,
    ) -> Result<Arc<Self>, ManagerError> {
        let webhook = WebhookSender::new(WebhookConfig::default())
            .map_err(|e| ManagerError::Internal(e.to_string()))?;
        let (shutdown_tx, _) = watch::channel(false);
        Ok(Arc::new(Self {
            config,
            spawner,
            webhook,
            state: Mutex::new(ManagerState {
                runners: HashMap::new(),
                started: false,
                draining: false,
                exit_max: 0,
                procedure_setup: None,
                proc_seq: 0,
            }),
            current: AtomicUsize::new(0),
            shutdown_tx,
        }))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            module: self.config.module.clone(),
            predictor: self.config.predictor.clone(),
            max_concurrency: self.config.max_concurrency,
        }
    }

    /// Start the manager. In default mode this spawns and configures the
    /// default runner and waits for its setup to finish.
    pub async fn start(&self) -> Result<(), ManagerError> {
        if self.config.use_procedure_mode {
            let mut state = self.state.lock().unwrap();
            state.started = true;
            state.procedure_setup = Some(SetupResult::starting().succeeded(String::new()));
            tracing::info!(max_runners = self.config.max_runners, "Procedure mode ready");
            return Ok(());
        }

        let runner = Runner::new(
            RunnerConfig::from_config(
                &self.config,
                DEFAULT_RUNNER,
                self.config.working_directory.clone(),
            ),
            Arc::clone(&self.spawner),
        );
        runner.configure(self.worker_settings())?;
        {
            let mut state = self.state.lock().unwrap();
            state
                .runners
                .insert(DEFAULT_RUNNER.to_string(), Arc::clone(&runner));
            state.started = true;
        }

        runner.start().await?;
        let reached = runner.wait_until_ready(self.config.setup_timeout).await;
        if !reached.accepts_predictions() {
            let setup = runner.setup_result();
            let detail = if setup.logs.is_empty() {
                "worker setup failed".to_string()
            } else {
                setup.logs
            };
            return Err(ManagerError::SetupFailed(detail));
        }
        Ok(())
    }

    fn get_runner(&self, name: &str) -> Option<Arc<Runner>> {
        self.state.lock().unwrap().runners.get(name).cloned()
    }

    #[cfg(test)]
    pub(crate) fn runner(&self, name: &str) -> Option<Arc<Runner>> {
        self.get_runner(name)
    }

    #[cfg(test)]
    pub(crate) fn runner_names(&self) -> Vec<String> {
        self.state.lock().unwrap().runners.keys().cloned().collect()
    }

    /// Admit a request: pick (or create) a runner, reserve capacity, hand
    /// the request to the worker, and wire up the delivery task.
    async fn admit(
        self: &Arc<Self>,
        req: &PredictionRequest,
        cancel: &CancellationToken,
    ) -> Result<(PredictionResponse, OutputStream), ManagerError> {
        // Placement can require an eviction or a fresh runner; retry the
        // decision a bounded number of times as the runner set changes.
        for _ in 0..4 {
            if cancel.is_cancelled() {
                return Err(ManagerError::Canceled);
            }

            let placement = {
                let mut state = self.state.lock().unwrap();
                if !state.started {
                    return Err(ManagerError::NotReady);
                }
                if state.draining {
                    return Err(ManagerError::ShuttingDown);
                }
                if self.config.use_procedure_mode {
                    self.place_procedure(&mut state, req)?
                } else {
                    self.place_default(&state, req)?
                }
            };

            match placement {
                Placement::Admitted {
                    runner,
                    snapshot,
                    caller,
                    monitor,
                } => {
                    self.spawn_monitor(Arc::clone(&runner), req, monitor, snapshot.clone());
                    if let Err(e) = runner.dispatch(req) {
                        // dispatch() already rolled the admission back; the
                        // monitor observes the closed stream and releases
                        // the global slot.
                        return Err(e.into());
                    }
                    return Ok((snapshot, caller));
                }
                Placement::Evict(victim) => {
                    tracing::info!(
                        runner = victim.name(),
                        "Evicting idle runner to free a slot"
                    );
                    victim.stop().await;
                    self.fold_exit(&victim);
                }
                Placement::Launch(runner) => {
                    self.launch_procedure_runner(&runner).await?;
                }
                Placement::WaitReady(runner) => {
                    let reached = runner.wait_until_ready(self.config.ready_timeout).await;
                    if !reached.accepts_predictions() {
                        self.remove_runner(runner.name());
                        return Err(ManagerError::Conflict(
                            "procedure runner failed to become ready".to_string(),
                        ));
                    }
                }
            }
        }

        Err(ManagerError::Conflict(
            "could not place prediction".to_string(),
        ))
    }

    /// Default mode: there is exactly one runner; admit there or 409.
    fn place_default(
        &self,
        state: &ManagerState,
        req: &PredictionRequest,
    ) -> Result<Placement, ManagerError> {
        let runner = state
            .runners
            .get(DEFAULT_RUNNER)
            .cloned()
            .ok_or(ManagerError::NotReady)?;

        let snapshot = match runner.admit(req) {
            Ok(snapshot) => snapshot,
            Err(RunnerError::NoCapacity) => {
                return Err(ManagerError::Conflict(
                    "already running a prediction".to_string(),
                ));
            }
            Err(e) => return Err(self.map_runner_error(&runner, e)),
        };
        self.finish_admission(runner, req, snapshot)
    }

    /// Procedure mode selection:
    /// 1. global cap, 2. match by source URL, 3. evict an idle runner,
    /// 4. spawn a new one.
    fn place_procedure(
        &self,
        state: &mut ManagerState,
        req: &PredictionRequest,
    ) -> Result<Placement, ManagerError> {
        if self.current.load(Ordering::Acquire) >= self.config.global_max_concurrency() {
            return Err(ManagerError::NoCapacity);
        }

        let url = req
            .procedure_source_url
            .clone()
            .ok_or_else(|| ManagerError::Conflict("missing procedure source URL".to_string()))?;

        // Reap exited runners before counting live ones.
        let exited: Vec<String> = state
            .runners
            .iter()
            .filter(|(_, r)| r.state() == RunnerState::Exited)
            .map(|(name, _)| name.clone())
            .collect();
        for name in exited {
            if let Some(runner) = state.runners.remove(&name) {
                state.exit_max = state.exit_max.max(exit_severity(runner.exit_code()));
            }
        }

        let matching: Vec<Arc<Runner>> = state
            .runners
            .values()
            .filter(|r| r.procedure_source_url() == Some(url.as_str()))
            .cloned()
            .collect();

        // Least-loaded first, most-recently-used breaking ties.
        let mut candidates: Vec<Arc<Runner>> = matching
            .iter()
            .filter(|r| {
                r.state().accepts_predictions()
                    && r.in_flight() < r.max_concurrency()
                    && !r.shutdown_requested()
            })
            .cloned()
            .collect();
        candidates.sort_by(|a, b| {
            a.in_flight()
                .cmp(&b.in_flight())
                .then_with(|| b.last_activity().cmp(&a.last_activity()))
        });
        if let Some(runner) = candidates.into_iter().next() {
            let snapshot = runner.admit(req).map_err(ManagerError::from)?;
            return self.finish_admission(runner, req, snapshot);
        }

        // A matching runner is still setting up; wait for it instead of
        // spawning a sibling.
        if let Some(runner) = matching.iter().find(|r| {
            matches!(
                r.state(),
                RunnerState::Initializing | RunnerState::SetupRunning
            )
        }) {
            return Ok(Placement::WaitReady(Arc::clone(runner)));
        }

        if state.runners.len() >= self.config.max_runners {
            // Evict the least-recently-used idle runner serving another URL.
            let mut idle: Vec<Arc<Runner>> = state
                .runners
                .values()
                .filter(|r| {
                    r.state() == RunnerState::Ready
                        && r.in_flight() == 0
                        && r.procedure_source_url() != Some(url.as_str())
                })
                .cloned()
                .collect();
            idle.sort_by_key(|r| r.last_activity());
            let victim = idle
                .into_iter()
                .next()
                .ok_or(ManagerError::NoCapacity)?;
            state.runners.remove(victim.name());
            return Ok(Placement::Evict(victim));
        }

        let key = procedure_key(&url);
        let mut name = format!("proc-{key}");
        if state.runners.contains_key(&name) {
            state.proc_seq += 1;
            name = format!("{name}-{}", state.proc_seq);
        }
        let mut runner_config = RunnerConfig::from_config(
            &self.config,
            name.as_str(),
            self.config.working_directory.join(&name),
        );
        runner_config.procedure_source_url = Some(url);
        let runner = Runner::new(runner_config, Arc::clone(&self.spawner));
        state.runners.insert(name, Arc::clone(&runner));
        Ok(Placement::Launch(runner))
    }

    /// Reserve the global slot and open both snapshot streams for a freshly
    /// admitted prediction. Called with the manager mutex held.
    fn finish_admission(
        &self,
        runner: Arc<Runner>,
        req: &PredictionRequest,
        snapshot: PredictionResponse,
    ) -> Result<Placement, ManagerError> {
        let caller = runner.subscribe(&req.id)?;
        let monitor = runner.subscribe(&req.id)?;
        self.current.fetch_add(1, Ordering::AcqRel);
        Ok(Placement::Admitted {
            runner,
            snapshot,
            caller,
            monitor,
        })
    }

    async fn launch_procedure_runner(&self, runner: &Arc<Runner>) -> Result<(), ManagerError> {
        tracing::info!(
            runner = runner.name(),
            source_url = runner.procedure_source_url().unwrap_or(""),
            "Spawning procedure runner"
        );
        if let Err(e) = runner.configure(self.worker_settings()) {
            self.remove_runner(runner.name());
            return Err(e.into());
        }
        if let Err(e) = runner.start().await {
            self.remove_runner(runner.name());
            return Err(ManagerError::Conflict(format!(
                "failed to start procedure runner: {e}"
            )));
        }
        let reached = runner.wait_until_ready(self.config.ready_timeout).await;
        if !reached.accepts_predictions() {
            self.remove_runner(runner.name());
            runner.force_kill();
            return Err(ManagerError::Conflict(
                "procedure runner failed to become ready".to_string(),
            ));
        }
        Ok(())
    }

    fn remove_runner(&self, name: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(runner) = state.runners.remove(name) {
            state.exit_max = state.exit_max.max(exit_severity(runner.exit_code()));
        }
    }

    fn fold_exit(&self, runner: &Arc<Runner>) {
        let mut state = self.state.lock().unwrap();
        state.exit_max = state.exit_max.max(exit_severity(runner.exit_code()));
    }

    /// Release an exited procedure runner's table entry once it is drained.
    fn reap(&self, runner: &Arc<Runner>) {
        if !self.config.use_procedure_mode {
            return;
        }
        if runner.state() == RunnerState::Exited {
            self.remove_runner(runner.name());
        }
    }

    fn map_runner_error(&self, runner: &Runner, e: RunnerError) -> ManagerError {
        match e {
            RunnerError::Defunct => {
                let setup = runner.setup_result();
                if setup.status == Some(SetupStatus::Failed) {
                    let detail = if setup.logs.is_empty() {
                        "worker setup failed".to_string()
                    } else {
                        setup.logs
                    };
                    ManagerError::SetupFailed(detail)
                } else {
                    ManagerError::Defunct
                }
            }
            other => other.into(),
        }
    }

    /// Per-prediction delivery task: consumes the snapshot stream, emits
    /// webhook events, and releases the global slot at end-of-stream.
    fn spawn_monitor(
        self: &Arc<Self>,
        runner: Arc<Runner>,
        req: &PredictionRequest,
        mut stream: OutputStream,
        initial: PredictionResponse,
    ) {
        let manager = Arc::clone(self);
        let url = req.webhook.clone().unwrap_or_default();
        let allowed = if req.webhook_events_filter.is_empty() {
            WebhookEvent::all()
        } else {
            req.webhook_events_filter.clone()
        };

        tokio::spawn(async move {
            // Allow the first throttled event straight through
            let mut last_updated = Instant::now() - Duration::from_secs(10);
            let mut prev = initial.clone();

            if !url.is_empty()
                && let Err(e) = manager
                    .webhook
                    .send_conditional(
                        &url,
                        &initial.to_json(),
                        WebhookEvent::Start,
                        &allowed,
                        &mut last_updated,
                    )
                    .await
            {
                tracing::warn!(error = %e, prediction_id = %initial.id, "Failed to send start webhook");
            }

            while let Some(snapshot) = stream.next().await {
                if url.is_empty() {
                    prev = snapshot;
                    continue;
                }
                if snapshot.is_terminal() {
                    if allowed.contains(&WebhookEvent::Completed)
                        && let Err(e) = manager
                            .webhook
                            .send(&url, WebhookEvent::Completed, &snapshot.to_json())
                            .await
                    {
                        tracing::error!(
                            error = %e,
                            prediction_id = %snapshot.id,
                            "Failed to deliver terminal webhook"
                        );
                    }
                    prev = snapshot;
                    continue;
                }

                let event = if snapshot.output != prev.output {
                    WebhookEvent::Output
                } else if snapshot.logs != prev.logs {
                    WebhookEvent::Logs
                } else {
                    prev = snapshot;
                    continue;
                };
                if let Err(e) = manager
                    .webhook
                    .send_conditional(&url, &snapshot.to_json(), event, &allowed, &mut last_updated)
                    .await
                {
                    tracing::warn!(error = %e, prediction_id = %snapshot.id, "Failed to deliver webhook");
                }
                prev = snapshot;
            }

            manager.current.fetch_sub(1, Ordering::AcqRel);
            manager.reap(&runner);
        });
    }

    /// Admit and block until the terminal snapshot.
    pub async fn predict_sync(
        self: &Arc<Self>,
        req: &PredictionRequest,
        cancel: &CancellationToken,
    ) -> Result<PredictionResponse, ManagerError> {
        if req.webhook.is_some() {
            return Err(ManagerError::AsyncPrediction);
        }
        let (snapshot, stream) = self.admit(req, cancel).await?;
        // A dropped caller does not cancel the prediction; cancellation is
        // only ever explicit via cancel().
        Ok(stream.wait_terminal().await.unwrap_or(snapshot))
    }

    /// Admit and return the starting snapshot immediately; the delivery
    /// task streams webhook events in the background.
    pub async fn predict_async(
        self: &Arc<Self>,
        req: &PredictionRequest,
        cancel: &CancellationToken,
    ) -> Result<PredictionResponse, ManagerError> {
        let (snapshot, _stream) = self.admit(req, cancel).await?;
        Ok(snapshot)
    }

    /// Locate the owning runner and forward the cancel.
    pub fn cancel(&self, id: &str) -> Result<(), ManagerError> {
        let runner = {
            let state = self.state.lock().unwrap();
            state.runners.values().find(|r| r.tracks(id)).cloned()
        };
        match runner {
            Some(runner) => Ok(runner.cancel(id)?),
            None => Err(ManagerError::PredictionNotFound(id.to_string())),
        }
    }

    pub fn snapshot(&self, id: &str) -> Option<PredictionResponse> {
        let state = self.state.lock().unwrap();
        state.runners.values().find_map(|r| r.snapshot(id))
    }

    /// Dispatch an IPC ping to the owning runner.
    pub async fn handle_runner_ipc(&self, ping: IpcPing) -> Result<(), ManagerError> {
        let runner = self.get_runner(&ping.name);
        match runner {
            Some(runner) => {
                runner.handle_ipc(ping.status, ping.pid).await;
                Ok(())
            }
            None => {
                // A READY from a just-evicted procedure runner is an
                // expected race.
                if self.config.use_procedure_mode && ping.status == IpcStatus::Ready {
                    tracing::debug!(runner = %ping.name, "Ignoring READY from unknown procedure runner");
                    Ok(())
                } else {
                    Err(ManagerError::RunnerNotFound(ping.name))
                }
            }
        }
    }

    pub fn status(&self) -> Health {
        let state = self.state.lock().unwrap();
        if !state.started {
            return Health::Starting;
        }
        if state.draining {
            return Health::Defunct;
        }
        if self.config.use_procedure_mode {
            if self.current.load(Ordering::Acquire) >= self.config.global_max_concurrency() {
                return Health::Busy;
            }
            return Health::Ready;
        }

        match state.runners.get(DEFAULT_RUNNER) {
            None => Health::Starting,
            Some(runner) => match runner.state() {
                RunnerState::Initializing | RunnerState::SetupRunning => Health::Starting,
                RunnerState::Ready => Health::Ready,
                RunnerState::Busy => Health::Busy,
                RunnerState::Defunct | RunnerState::Exited => {
                    if runner.setup_result().status == Some(SetupStatus::Failed) {
                        Health::SetupFailed
                    } else {
                        Health::Defunct
                    }
                }
            },
        }
    }

    pub fn concurrency(&self) -> Concurrency {
        Concurrency {
            current: self.current.load(Ordering::Acquire),
            max: self.config.global_max_concurrency(),
        }
    }

    /// The default runner's OpenAPI schema, if setup has produced one.
    pub fn schema(&self) -> (Option<serde_json::Value>, bool) {
        let runner = self.get_runner(DEFAULT_RUNNER);
        let schema = runner
            .and_then(|r| r.schema())
            .and_then(|raw| serde_json::from_str(&raw).ok());
        let available = schema.is_some();
        (schema, available)
    }

    pub fn setup_result(&self) -> Option<SetupResult> {
        let state = self.state.lock().unwrap();
        if self.config.use_procedure_mode {
            return state.procedure_setup.clone();
        }
        state
            .runners
            .get(DEFAULT_RUNNER)
            .map(|r| r.setup_result())
    }

    /// Graceful drain: reject new work, stop every runner concurrently.
    pub async fn stop(&self) {
        let runners: Vec<Arc<Runner>> = {
            let mut state = self.state.lock().unwrap();
            if state.draining {
                return;
            }
            state.draining = true;
            state.runners.values().cloned().collect()
        };
        tracing::info!(runners = runners.len(), "Draining all runners");

        futures::future::join_all(runners.iter().map(|r| r.stop())).await;

        let mut state = self.state.lock().unwrap();
        for runner in runners {
            state.exit_max = state.exit_max.max(exit_severity(runner.exit_code()));
            state.runners.remove(runner.name());
        }
    }

    pub fn force_kill_all(&self) {
        let runners: Vec<Arc<Runner>> = {
            let state = self.state.lock().unwrap();
            state.runners.values().cloned().collect()
        };
        for runner in runners {
            runner.force_kill();
        }
    }

    /// Max severity of worker terminations: 0 when every worker exited
    /// cleanly.
    pub fn exit_code(&self) -> i32 {
        let state = self.state.lock().unwrap();
        let mut max = state.exit_max;
        for runner in state.runners.values() {
            if runner.state() == RunnerState::Exited {
                max = max.max(exit_severity(runner.exit_code()));
            }
        }
        max
    }

    pub fn trigger_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }
}
