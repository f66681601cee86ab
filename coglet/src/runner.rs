//! Runner: supervisor for a single worker subprocess.
//!
//! A runner owns its worker process and its prediction store. It admits
//! predictions up to its concurrency cap, relays requests through the
//! working directory, ingests IPC status pings, attributes worker logs, and
//! drains on shutdown.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Notify, watch};

use crate::config::Config;
use crate::file_output;
use crate::health::SetupResult;
use crate::ipc::{self, IpcStatus, ResponseFile, WorkerSettings};
use crate::logs::{self, LogSource, WorkerLine};
use crate::prediction::{PredictionRequest, PredictionResponse, PredictionStatus};
use crate::store::{OutputStream, PredictionStore, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerState {
    Initializing,
    SetupRunning,
    Ready,
    Busy,
    Defunct,
    Exited,
}

impl RunnerState {
    pub fn accepts_predictions(&self) -> bool {
        matches!(self, Self::Ready | Self::Busy)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::SetupRunning => "setup_running",
            Self::Ready => "ready",
            Self::Busy => "busy",
            Self::Defunct => "defunct",
            Self::Exited => "exited",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("worker failed to spawn: {0}")]
    WorkerSpawn(String),
    #[error("runner already configured")]
    AlreadyConfigured,
    #[error("no capacity (all prediction slots busy)")]
    NoCapacity,
    #[error("runner not ready")]
    NotReady,
    #[error("runner is defunct")]
    Defunct,
    #[error("runner is shutting down")]
    ShuttingDown,
    #[error("prediction {0} already exists")]
    Duplicate(String),
    #[error("prediction {0} not found")]
    PredictionNotFound(String),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<StoreError> for RunnerError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Duplicate(id) => RunnerError::Duplicate(id),
            StoreError::NotFound(id) => RunnerError::PredictionNotFound(id),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("spawn failed: {0}")]
    Other(String),
}

/// Everything a spawner needs to launch one worker.
#[derive(Debug, Clone)]
pub struct WorkerLaunch {
    pub runner_name: String,
    pub working_dir: PathBuf,
    pub command: Vec<String>,
    pub env: Vec<(String, String)>,
}

/// Extension point for different worker spawn strategies.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self, launch: &WorkerLaunch) -> Result<Child, SpawnError>;
}

/// Default spawner: exec the configured argv with the worker environment.
pub struct CommandSpawner;

impl WorkerSpawner for CommandSpawner {
    fn spawn(&self, launch: &WorkerLaunch) -> Result<Child, SpawnError> {
        let program = launch
            .command
            .first()
            .ok_or_else(|| SpawnError::Other("empty worker command".to_string()))?;
        let child = Command::new(program)
            .args(&launch.command[1..])
            .envs(launch.env.iter().cloned())
            .current_dir(&launch.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        Ok(child)
    }
}

/// Signals the runner may send its worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkerSignal {
    Cancel,
    Terminate,
    Kill,
}

#[cfg(unix)]
fn signal_worker(pid: u32, signal: WorkerSignal) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let sig = match signal {
        WorkerSignal::Cancel => Signal::SIGUSR1,
        WorkerSignal::Terminate => Signal::SIGTERM,
        WorkerSignal::Kill => Signal::SIGKILL,
    };
    if let Err(e) = kill(Pid::from_raw(pid as i32), sig) {
        tracing::warn!(pid, signal = ?signal, error = %e, "Failed to signal worker");
    }
}

#[cfg(not(unix))]
fn signal_worker(pid: u32, signal: WorkerSignal) {
    tracing::warn!(pid, signal = ?signal, "Worker signals are not supported on this platform");
}

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub name: String,
    pub working_dir: PathBuf,
    pub max_concurrency: usize,
    pub command: Vec<String>,
    pub ipc_url: String,
    pub procedure_source_url: Option<String>,
    pub setup_timeout: Duration,
    pub cancel_timeout: Duration,
    pub drain_timeout: Duration,
}

impl RunnerConfig {
    pub fn from_config(config: &Config, name: impl Into<String>, working_dir: PathBuf) -> Self {
        Self {
            name: name.into(),
            working_dir,
            max_concurrency: config.max_concurrency,
            command: config.worker_command.clone(),
            ipc_url: config.ipc_url.clone(),
            procedure_source_url: None,
            setup_timeout: config.setup_timeout,
            cancel_timeout: config.cancel_timeout,
            drain_timeout: config.drain_timeout,
        }
    }
}

struct RunnerInner {
    state: RunnerState,
    pid: Option<u32>,
    in_flight: HashSet<String>,
    /// Per-prediction upload prefix, kept until the terminal snapshot.
    output_prefixes: HashMap<String, String>,
    shutdown_requested: bool,
    settings: Option<WorkerSettings>,
    setup: SetupResult,
    schema: Option<String>,
    last_activity: Instant,
    exit_code: Option<i32>,
}

enum PlainRoute {
    Setup,
    Prediction(String),
    Drop,
}

pub struct Runner {
    config: RunnerConfig,
    inner: Mutex<RunnerInner>,
    store: PredictionStore,
    state_tx: watch::Sender<RunnerState>,
    drained: Notify,
    spawner: Arc<dyn WorkerSpawner>,
    http: reqwest::Client,
}

impl Runner {
    pub fn new(config: RunnerConfig, spawner: Arc<dyn WorkerSpawner>) -> Arc<Self> {
        let (state_tx, _) = watch::channel(RunnerState::Initializing);
        Arc::new(Self {
            config,
            inner: Mutex::new(RunnerInner {
                state: RunnerState::Initializing,
                pid: None,
                in_flight: HashSet::new(),
                output_prefixes: HashMap::new(),
                shutdown_requested: false,
                settings: None,
                setup: SetupResult::starting(),
                schema: None,
                last_activity: Instant::now(),
                exit_code: None,
            }),
            store: PredictionStore::new(),
            state_tx,
            drained: Notify::new(),
            spawner,
            http: reqwest::Client::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn working_dir(&self) -> &std::path::Path {
        &self.config.working_dir
    }

    pub fn state(&self) -> RunnerState {
        self.inner.lock().unwrap().state
    }

    pub fn state_rx(&self) -> watch::Receiver<RunnerState> {
        self.state_tx.subscribe()
    }

    pub fn pid(&self) -> Option<u32> {
        self.inner.lock().unwrap().pid
    }

    pub fn schema(&self) -> Option<String> {
        self.inner.lock().unwrap().schema.clone()
    }

    pub fn setup_result(&self) -> SetupResult {
        self.inner.lock().unwrap().setup.clone()
    }

    pub fn in_flight(&self) -> usize {
        self.inner.lock().unwrap().in_flight.len()
    }

    pub fn last_activity(&self) -> Instant {
        self.inner.lock().unwrap().last_activity
    }

    pub fn shutdown_requested(&self) -> bool {
        self.inner.lock().unwrap().shutdown_requested
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.inner.lock().unwrap().exit_code
    }

    pub fn procedure_source_url(&self) -> Option<&str> {
        self.config.procedure_source_url.as_deref()
    }

    pub fn max_concurrency(&self) -> usize {
        self.config.max_concurrency
    }

    pub fn tracks(&self, id: &str) -> bool {
        self.store.contains(id)
    }

    pub fn snapshot(&self, id: &str) -> Option<PredictionResponse> {
        self.store.snapshot(id)
    }

    pub fn subscribe(&self, id: &str) -> Result<OutputStream, RunnerError> {
        Ok(self.store.subscribe(id)?)
    }

    fn set_state(&self, inner: &mut RunnerInner, state: RunnerState) {
        if inner.state != state {
            tracing::debug!(
                runner = %self.config.name,
                from = inner.state.as_str(),
                to = state.as_str(),
                "Runner state transition"
            );
            inner.state = state;
            self.state_tx.send_replace(state);
        }
    }

    fn build_launch(&self) -> WorkerLaunch {
        let mut env = vec![
            (
                "COGLET_RUNNER_NAME".to_string(),
                self.config.name.clone(),
            ),
            ("COGLET_IPC_URL".to_string(), self.config.ipc_url.clone()),
            (
                "COGLET_WORKING_DIR".to_string(),
                self.config.working_dir.display().to_string(),
            ),
        ];
        if let Some(ref url) = self.config.procedure_source_url {
            env.push(("COGLET_PROCEDURE_SOURCE_URL".to_string(), url.clone()));
        }
        WorkerLaunch {
            runner_name: self.config.name.clone(),
            working_dir: self.config.working_dir.clone(),
            command: self.config.command.clone(),
            env,
        }
    }

    /// Spawn the worker subprocess and wire up log pumps, the reaper, and
    /// the setup watchdog.
    pub async fn start(self: &Arc<Self>) -> Result<(), RunnerError> {
        tokio::fs::create_dir_all(&self.config.working_dir).await?;

        let launch = self.build_launch();
        let mut child = self
            .spawner
            .spawn(&launch)
            .map_err(|e| RunnerError::WorkerSpawn(e.to_string()))?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let pid = child.id();

        {
            let mut inner = self.inner.lock().unwrap();
            inner.pid = pid;
            self.set_state(&mut inner, RunnerState::SetupRunning);
        }
        tracing::info!(runner = %self.config.name, pid, "Worker subprocess started");

        if let Some(out) = stdout {
            let runner = Arc::clone(self);
            tokio::spawn(async move { pump_logs(runner, out, LogSource::Stdout).await });
        }
        if let Some(err) = stderr {
            let runner = Arc::clone(self);
            tokio::spawn(async move { pump_logs(runner, err, LogSource::Stderr).await });
        }

        let runner = Arc::clone(self);
        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => status.code().unwrap_or(-1),
                Err(e) => {
                    tracing::error!(runner = %runner.config.name, error = %e, "Failed to reap worker");
                    -1
                }
            };
            runner.on_worker_exit(code);
        });

        let runner = Arc::clone(self);
        let setup_timeout = self.config.setup_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(setup_timeout).await;
            if runner.state() == RunnerState::SetupRunning {
                tracing::error!(runner = %runner.config.name, "Worker setup timed out");
                runner.mark_defunct("setup timed out");
            }
        });

        Ok(())
    }

    /// Write worker settings. Idempotent for identical values; differing
    /// values after the first call fail.
    pub fn configure(&self, settings: WorkerSettings) -> Result<(), RunnerError> {
        {
            let mut inner = self.inner.lock().unwrap();
            match &inner.settings {
                Some(existing) if *existing == settings => return Ok(()),
                Some(_) => return Err(RunnerError::AlreadyConfigured),
                None => inner.settings = Some(settings.clone()),
            }
        }

        std::fs::create_dir_all(&self.config.working_dir)?;
        let body = serde_json::to_vec_pretty(&settings)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(ipc::config_path(&self.config.working_dir), body)?;
        Ok(())
    }

    /// Atomic admission: capacity, state, and uniqueness checked and the
    /// record inserted under one lock. No I/O.
    pub fn admit(&self, req: &PredictionRequest) -> Result<PredictionResponse, RunnerError> {
        let response = PredictionResponse::from_request(req);

        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            RunnerState::Defunct | RunnerState::Exited => return Err(RunnerError::Defunct),
            RunnerState::Ready | RunnerState::Busy => {}
            _ => return Err(RunnerError::NotReady),
        }
        if inner.shutdown_requested {
            return Err(RunnerError::ShuttingDown);
        }
        if inner.in_flight.len() >= self.config.max_concurrency {
            return Err(RunnerError::NoCapacity);
        }
        if inner.in_flight.contains(&req.id) {
            return Err(RunnerError::Duplicate(req.id.clone()));
        }
        self.store.insert(response.clone())?;
        inner.in_flight.insert(req.id.clone());
        if let Some(ref prefix) = req.output_file_prefix {
            inner.output_prefixes.insert(req.id.clone(), prefix.clone());
        }
        inner.last_activity = Instant::now();
        if inner.state == RunnerState::Ready {
            self.set_state(&mut inner, RunnerState::Busy);
        }
        Ok(response)
    }

    /// Hand an admitted request to the worker by writing its request file.
    /// Rolls the admission back on failure.
    pub fn dispatch(&self, req: &PredictionRequest) -> Result<(), RunnerError> {
        let body = match serde_json::to_vec_pretty(req) {
            Ok(body) => body,
            Err(e) => {
                self.abort(&req.id);
                return Err(RunnerError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    e,
                )));
            }
        };
        let path = ipc::request_path(&self.config.working_dir, &req.id);
        if let Err(e) = std::fs::write(&path, body) {
            self.abort(&req.id);
            return Err(e.into());
        }
        tracing::info!(
            target: "coglet::prediction",
            runner = %self.config.name,
            prediction_id = %req.id,
            "Starting prediction"
        );
        Ok(())
    }

    /// Admit, dispatch, and subscribe in one call.
    pub fn predict(
        &self,
        req: &PredictionRequest,
    ) -> Result<(PredictionResponse, OutputStream), RunnerError> {
        let snapshot = self.admit(req)?;
        self.dispatch(req)?;
        let stream = self.subscribe(&req.id)?;
        Ok((snapshot, stream))
    }

    /// Roll back an admission that never reached the worker.
    pub fn abort(&self, id: &str) {
        self.store.discard(id);
        let mut inner = self.inner.lock().unwrap();
        inner.in_flight.remove(id);
        inner.output_prefixes.remove(id);
        if inner.in_flight.is_empty() {
            if inner.state == RunnerState::Busy {
                self.set_state(&mut inner, RunnerState::Ready);
            }
            self.drained.notify_waiters();
        }
    }

    /// Request cooperative cancellation. Idempotent; the first request
    /// signals the worker and arms the defunct watchdog.
    pub fn cancel(self: &Arc<Self>, id: &str) -> Result<(), RunnerError> {
        let first = self
            .store
            .request_cancel(id)
            .map_err(|_| RunnerError::PredictionNotFound(id.to_string()))?;
        if !first {
            return Ok(());
        }

        tracing::info!(
            target: "coglet::prediction",
            runner = %self.config.name,
            prediction_id = %id,
            "Cancel requested"
        );
        if let Some(pid) = self.pid() {
            signal_worker(pid, WorkerSignal::Cancel);
        }

        let runner = Arc::clone(self);
        let id = id.to_string();
        let grace = self.config.cancel_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if runner.store.contains(&id) {
                tracing::error!(
                    runner = %runner.config.name,
                    prediction_id = %id,
                    "Worker did not acknowledge cancel, marking runner defunct"
                );
                runner.mark_defunct("cancel not acknowledged");
            }
        });
        Ok(())
    }

    /// Ingest an IPC status ping from the worker.
    pub async fn handle_ipc(&self, status: IpcStatus, pid: u32) {
        {
            let inner = self.inner.lock().unwrap();
            if let Some(expected) = inner.pid
                && expected != pid
            {
                tracing::warn!(
                    runner = %self.config.name,
                    expected,
                    got = pid,
                    "IPC ping from unexpected pid, dropping"
                );
                return;
            }
        }

        match status {
            IpcStatus::Ready => self.on_ready_ping(),
            IpcStatus::Busy => {
                let mut inner = self.inner.lock().unwrap();
                if inner.state == RunnerState::Ready {
                    self.set_state(&mut inner, RunnerState::Busy);
                }
            }
            IpcStatus::Output => self.scan_responses().await,
        }
    }

    fn on_ready_ping(&self) {
        let completing_setup = self.inner.lock().unwrap().state == RunnerState::SetupRunning;

        if completing_setup {
            // Schema is written by the worker before it reports ready.
            let schema = std::fs::read_to_string(ipc::schema_path(&self.config.working_dir)).ok();

            let mut inner = self.inner.lock().unwrap();
            if inner.state == RunnerState::SetupRunning {
                inner.schema = schema;
                let logs = std::mem::take(&mut inner.setup.logs);
                inner.setup = inner.setup.clone().succeeded(logs);
                let next = if inner.in_flight.is_empty() {
                    RunnerState::Ready
                } else {
                    RunnerState::Busy
                };
                self.set_state(&mut inner, next);
                tracing::info!(
                    runner = %self.config.name,
                    has_schema = inner.schema.is_some(),
                    "Worker setup succeeded"
                );
                return;
            }
        }

        let mut inner = self.inner.lock().unwrap();
        if inner.state.accepts_predictions() {
            let next = if inner.in_flight.is_empty() {
                RunnerState::Ready
            } else {
                RunnerState::Busy
            };
            self.set_state(&mut inner, next);
        }
    }

    /// Re-read every in-flight response file and merge updates.
    async fn scan_responses(&self) {
        let ids: Vec<String> = {
            let inner = self.inner.lock().unwrap();
            inner.in_flight.iter().cloned().collect()
        };

        for id in ids {
            let path = ipc::response_path(&self.config.working_dir, &id);
            let bytes = match tokio::fs::read(&path).await {
                Ok(bytes) => bytes,
                // Not written yet: nothing to merge
                Err(_) => continue,
            };
            let report: ResponseFile = match serde_json::from_slice(&bytes) {
                Ok(report) => report,
                Err(e) => {
                    tracing::warn!(
                        runner = %self.config.name,
                        prediction_id = %id,
                        error = %e,
                        "Ignoring malformed response file"
                    );
                    continue;
                }
            };
            self.apply_report(&id, report).await;
        }
    }

    async fn apply_report(&self, id: &str, mut report: ResponseFile) {
        if report.status.is_terminal()
            && let Some(output) = report.output.take()
        {
            let prefix = {
                let inner = self.inner.lock().unwrap();
                inner.output_prefixes.get(id).cloned()
            };
            let resolved =
                file_output::resolve_outputs(&self.http, output, prefix.as_deref()).await;
            report.output = Some(resolved);
        }

        let result = self.store.update(id, |r| {
            if let Some(started) = report.started_at
                && r.started_at.is_none()
            {
                r.started_at = Some(started);
            }
            for (k, v) in report.metrics.clone() {
                r.metrics.insert(k, v);
            }
            if let Some(output) = report.output.clone() {
                r.output = Some(output);
            }
            match report.status {
                PredictionStatus::Starting => {}
                PredictionStatus::Processing => r.set_processing(),
                terminal => {
                    if let Some(completed) = report.completed_at {
                        r.completed_at = Some(completed);
                    }
                    r.mark_terminal(terminal, report.error.clone());
                }
            }
        });

        match result {
            Ok(snapshot) if snapshot.is_terminal() => {
                tracing::info!(
                    target: "coglet::prediction",
                    runner = %self.config.name,
                    prediction_id = %id,
                    status = snapshot.status.as_str(),
                    "Prediction finished"
                );
                self.finish_prediction(id);
            }
            Ok(_) => {}
            Err(_) => {
                // Raced with crash handling; the record is already gone
            }
        }
    }

    fn finish_prediction(&self, id: &str) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.in_flight.remove(id);
            inner.output_prefixes.remove(id);
            inner.last_activity = Instant::now();
            if inner.in_flight.is_empty() {
                if inner.state == RunnerState::Busy {
                    self.set_state(&mut inner, RunnerState::Ready);
                }
                self.drained.notify_waiters();
            }
        }

        for path in [
            ipc::request_path(&self.config.working_dir, id),
            ipc::response_path(&self.config.working_dir, id),
        ] {
            if let Err(e) = std::fs::remove_file(&path)
                && e.kind() != std::io::ErrorKind::NotFound
            {
                tracing::warn!(path = %path.display(), error = %e, "Failed to remove protocol file");
            }
        }
    }

    /// Route one line of worker output.
    pub fn handle_worker_line(&self, line: &str, source: LogSource) {
        match logs::parse_line(line) {
            WorkerLine::Structured(record) => logs::emit_structured(&self.config.name, &record),
            WorkerLine::Tagged {
                prediction_id,
                text,
            } => {
                let mut chunk = text;
                chunk.push('\n');
                if self.store.append_logs(&prediction_id, &chunk).is_err() {
                    tracing::warn!(
                        runner = %self.config.name,
                        prediction_id = %prediction_id,
                        "Log line for unknown prediction dropped"
                    );
                }
            }
            WorkerLine::Plain(text) => {
                let route = {
                    let mut inner = self.inner.lock().unwrap();
                    match inner.state {
                        RunnerState::Initializing | RunnerState::SetupRunning => {
                            inner.setup.logs.push_str(&text);
                            inner.setup.logs.push('\n');
                            PlainRoute::Setup
                        }
                        _ if inner.in_flight.len() == 1 => {
                            PlainRoute::Prediction(inner.in_flight.iter().next().cloned().unwrap())
                        }
                        _ => PlainRoute::Drop,
                    }
                };
                match route {
                    PlainRoute::Setup => {
                        tracing::info!(
                            target: "coglet::setup",
                            runner = %self.config.name,
                            source = source.as_str(),
                            "{}",
                            text
                        );
                    }
                    PlainRoute::Prediction(id) => {
                        let mut chunk = text;
                        chunk.push('\n');
                        let _ = self.store.append_logs(&id, &chunk);
                    }
                    PlainRoute::Drop => {
                        tracing::warn!(
                            runner = %self.config.name,
                            source = source.as_str(),
                            "Unattributable worker output dropped: {}",
                            text
                        );
                    }
                }
            }
        }
    }

    /// The runner can no longer serve predictions. Fails all in-flight work.
    pub fn mark_defunct(&self, reason: &str) {
        {
            let mut inner = self.inner.lock().unwrap();
            if matches!(inner.state, RunnerState::Defunct | RunnerState::Exited) {
                return;
            }
            if !inner.setup.is_finished() {
                let logs = std::mem::take(&mut inner.setup.logs);
                inner.setup = inner.setup.clone().failed(logs);
            }
            self.set_state(&mut inner, RunnerState::Defunct);
            inner.in_flight.clear();
            inner.output_prefixes.clear();
        }
        let failed = self.store.fail_all(reason);
        if !failed.is_empty() {
            tracing::warn!(
                runner = %self.config.name,
                count = failed.len(),
                reason,
                "Failed in-flight predictions"
            );
        }
        self.drained.notify_waiters();
    }

    /// Called by the reaper when the worker process is gone.
    fn on_worker_exit(&self, code: i32) {
        let setup_failed = {
            let mut inner = self.inner.lock().unwrap();
            inner.exit_code = Some(code);
            let setup_failed = matches!(
                inner.state,
                RunnerState::Initializing | RunnerState::SetupRunning
            );
            if setup_failed && !inner.setup.is_finished() {
                let logs = std::mem::take(&mut inner.setup.logs);
                inner.setup = inner.setup.clone().failed(logs);
            }
            let had_in_flight = !inner.in_flight.is_empty();
            if setup_failed || had_in_flight {
                self.set_state(&mut inner, RunnerState::Defunct);
            }
            self.set_state(&mut inner, RunnerState::Exited);
            inner.in_flight.clear();
            inner.output_prefixes.clear();
            setup_failed
        };

        let failed = self.store.fail_all("worker crashed");
        self.drained.notify_waiters();
        tracing::info!(
            runner = %self.config.name,
            code,
            setup_failed,
            failed_predictions = failed.len(),
            "Worker exited"
        );
    }

    /// Graceful drain: stop admitting, let in-flight finish, ask the worker
    /// to exit, escalate SIGTERM then SIGKILL.
    pub async fn stop(&self) {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.state == RunnerState::Exited {
                return;
            }
            inner.shutdown_requested = true;
        }
        tracing::info!(runner = %self.config.name, "Draining runner");

        let drain = async {
            loop {
                let mut notified = std::pin::pin!(self.drained.notified());
                // Register before the check so a completion between the
                // check and the await is not lost.
                notified.as_mut().enable();
                if self.inner.lock().unwrap().in_flight.is_empty() {
                    break;
                }
                notified.await;
            }
        };
        if tokio::time::timeout(self.config.drain_timeout, drain)
            .await
            .is_err()
        {
            tracing::warn!(
                runner = %self.config.name,
                in_flight = self.in_flight(),
                "Drain timed out with predictions in flight"
            );
        }

        if self.state() == RunnerState::Exited {
            return;
        }

        if let Err(e) = std::fs::write(ipc::stop_path(&self.config.working_dir), b"") {
            tracing::warn!(runner = %self.config.name, error = %e, "Failed to write stop file");
        }
        if self.wait_for_exit(self.config.drain_timeout).await {
            return;
        }

        if let Some(pid) = self.pid() {
            tracing::warn!(runner = %self.config.name, pid, "Worker ignored stop request, sending SIGTERM");
            signal_worker(pid, WorkerSignal::Terminate);
        }
        if self.wait_for_exit(self.config.drain_timeout).await {
            return;
        }

        tracing::error!(runner = %self.config.name, "Worker ignored SIGTERM, sending SIGKILL");
        self.force_kill();
        let _ = self.wait_for_exit(Duration::from_secs(5)).await;
    }

    /// Immediate SIGKILL.
    pub fn force_kill(&self) {
        if let Some(pid) = self.pid() {
            signal_worker(pid, WorkerSignal::Kill);
        }
    }

    pub async fn wait_for_exit(&self, timeout: Duration) -> bool {
        let mut rx = self.state_tx.subscribe();
        tokio::time::timeout(timeout, rx.wait_for(|s| *s == RunnerState::Exited))
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false)
    }

    /// Wait until the runner leaves setup, successfully or not.
    pub async fn wait_until_ready(&self, timeout: Duration) -> RunnerState {
        let mut rx = self.state_tx.subscribe();
        let _ = tokio::time::timeout(
            timeout,
            rx.wait_for(|s| {
                matches!(
                    s,
                    RunnerState::Ready | RunnerState::Busy | RunnerState::Defunct | RunnerState::Exited
                )
            }),
        )
        .await;
        self.state()
    }
}

async fn pump_logs<R>(runner: Arc<Runner>, stream: R, source: LogSource)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => runner.handle_worker_line(&line, source),
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(
                    runner = %runner.config.name,
                    source = source.as_str(),
                    error = %e,
                    "Worker log stream error"
                );
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Spawns a long-lived worker that ignores SIGUSR1 (cancel tests need a
    /// worker that survives the signal).
    struct ShellSpawner(&'static str);

    impl WorkerSpawner for ShellSpawner {
        fn spawn(&self, _launch: &WorkerLaunch) -> Result<Child, SpawnError> {
            let child = Command::new("/bin/sh")
                .args(["-c", self.0])
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .spawn()?;
            Ok(child)
        }
    }

    struct FailSpawner;

    impl WorkerSpawner for FailSpawner {
        fn spawn(&self, _launch: &WorkerLaunch) -> Result<Child, SpawnError> {
            Err(SpawnError::Other("no such interpreter".to_string()))
        }
    }

    fn sleeper() -> Arc<dyn WorkerSpawner> {
        Arc::new(ShellSpawner("trap '' USR1; sleep 30"))
    }

    fn test_config(dir: &std::path::Path, max_concurrency: usize) -> RunnerConfig {
        RunnerConfig {
            name: "default".to_string(),
            working_dir: dir.to_path_buf(),
            max_concurrency,
            command: vec!["unused".to_string()],
            ipc_url: "http://127.0.0.1:5000".to_string(),
            procedure_source_url: None,
            setup_timeout: Duration::from_secs(30),
            cancel_timeout: Duration::from_millis(200),
            drain_timeout: Duration::from_millis(200),
        }
    }

    async fn ready_runner(dir: &std::path::Path, max_concurrency: usize) -> Arc<Runner> {
        let runner = Runner::new(test_config(dir, max_concurrency), sleeper());
        runner.start().await.unwrap();
        let pid = runner.pid().unwrap();
        runner.handle_ipc(IpcStatus::Ready, pid).await;
        assert_eq!(runner.state(), RunnerState::Ready);
        runner
    }

    fn request(id: &str) -> PredictionRequest {
        PredictionRequest::new(id, serde_json::json!({"s": "world"}))
    }

    #[tokio::test]
    async fn start_transitions_to_setup_running() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Runner::new(test_config(dir.path(), 1), sleeper());

        assert_eq!(runner.state(), RunnerState::Initializing);
        runner.start().await.unwrap();
        assert_eq!(runner.state(), RunnerState::SetupRunning);
        assert!(runner.pid().is_some());

        runner.force_kill();
    }

    #[tokio::test]
    async fn spawn_failure_surfaces() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Runner::new(test_config(dir.path(), 1), Arc::new(FailSpawner));

        let err = runner.start().await.unwrap_err();
        assert!(matches!(err, RunnerError::WorkerSpawn(_)));
    }

    #[tokio::test]
    async fn configure_is_idempotent_for_same_values() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Runner::new(test_config(dir.path(), 1), sleeper());

        let settings = WorkerSettings {
            module: "predict".to_string(),
            predictor: "Predictor".to_string(),
            max_concurrency: 1,
        };
        runner.configure(settings.clone()).unwrap();
        runner.configure(settings.clone()).unwrap();

        let different = WorkerSettings {
            module: "other".to_string(),
            ..settings
        };
        assert!(matches!(
            runner.configure(different),
            Err(RunnerError::AlreadyConfigured)
        ));

        let written = std::fs::read_to_string(ipc::config_path(dir.path())).unwrap();
        assert!(written.contains("\"module\": \"predict\""));
    }

    #[tokio::test]
    async fn ready_ping_completes_setup_and_ingests_schema() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Runner::new(test_config(dir.path(), 1), sleeper());
        runner.start().await.unwrap();

        runner.handle_worker_line("loading weights", LogSource::Stdout);
        std::fs::write(ipc::schema_path(dir.path()), r#"{"openapi":"3.0.2"}"#).unwrap();

        let pid = runner.pid().unwrap();
        runner.handle_ipc(IpcStatus::Ready, pid).await;

        assert_eq!(runner.state(), RunnerState::Ready);
        let setup = runner.setup_result();
        assert_eq!(setup.status, Some(crate::health::SetupStatus::Succeeded));
        assert!(setup.logs.contains("loading weights"));
        assert!(runner.schema().unwrap().contains("3.0.2"));

        runner.force_kill();
    }

    #[tokio::test]
    async fn ping_from_wrong_pid_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Runner::new(test_config(dir.path(), 1), sleeper());
        runner.start().await.unwrap();

        let pid = runner.pid().unwrap();
        runner.handle_ipc(IpcStatus::Ready, pid.wrapping_add(1)).await;
        assert_eq!(runner.state(), RunnerState::SetupRunning);

        runner.force_kill();
    }

    #[tokio::test]
    async fn admit_rejects_before_ready() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Runner::new(test_config(dir.path(), 1), sleeper());
        runner.start().await.unwrap();

        assert!(matches!(
            runner.admit(&request("p1")),
            Err(RunnerError::NotReady)
        ));

        runner.force_kill();
    }

    #[tokio::test]
    async fn admission_enforces_capacity_and_uniqueness() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ready_runner(dir.path(), 1).await;

        let (snapshot, _stream) = runner.predict(&request("p1")).unwrap();
        assert_eq!(snapshot.status, PredictionStatus::Starting);
        assert_eq!(runner.state(), RunnerState::Busy);
        assert_eq!(runner.in_flight(), 1);

        assert!(matches!(
            runner.admit(&request("p2")),
            Err(RunnerError::NoCapacity)
        ));
        assert!(std::fs::metadata(ipc::request_path(dir.path(), "p1")).is_ok());

        runner.force_kill();
    }

    #[tokio::test]
    async fn duplicate_ids_lose() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ready_runner(dir.path(), 4).await;

        runner.predict(&request("p1")).unwrap();
        assert!(matches!(
            runner.admit(&request("p1")),
            Err(RunnerError::Duplicate(id)) if id == "p1"
        ));

        runner.force_kill();
    }

    #[tokio::test]
    async fn concurrent_admissions_respect_the_cap() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ready_runner(dir.path(), 2).await;

        let mut handles = Vec::new();
        for i in 0..8 {
            let runner = Arc::clone(&runner);
            handles.push(tokio::spawn(async move {
                runner.admit(&request(&format!("p{i}"))).is_ok()
            }));
        }
        let mut admitted = 0;
        for h in handles {
            if h.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 2);
        assert_eq!(runner.in_flight(), 2);

        runner.force_kill();
    }

    #[tokio::test]
    async fn output_ping_merges_response_and_finishes() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ready_runner(dir.path(), 1).await;
        let pid = runner.pid().unwrap();

        let (_snapshot, stream) = runner.predict(&request("p1")).unwrap();

        std::fs::write(
            ipc::response_path(dir.path(), "p1"),
            r#"{"status":"processing"}"#,
        )
        .unwrap();
        runner.handle_ipc(IpcStatus::Output, pid).await;

        std::fs::write(
            ipc::response_path(dir.path(), "p1"),
            r#"{"status":"succeeded","output":"hello world","metrics":{"tokens":5}}"#,
        )
        .unwrap();
        runner.handle_ipc(IpcStatus::Output, pid).await;

        let terminal = stream.wait_terminal().await.unwrap();
        assert_eq!(terminal.status, PredictionStatus::Succeeded);
        assert_eq!(terminal.output, Some(serde_json::json!("hello world")));
        assert_eq!(terminal.metrics["tokens"], serde_json::json!(5));
        assert!(terminal.metrics.contains_key("predict_time"));

        assert_eq!(runner.in_flight(), 0);
        assert_eq!(runner.state(), RunnerState::Ready);
        assert!(std::fs::metadata(ipc::request_path(dir.path(), "p1")).is_err());
        assert!(std::fs::metadata(ipc::response_path(dir.path(), "p1")).is_err());

        runner.force_kill();
    }

    #[tokio::test]
    async fn prediction_error_keeps_runner_alive() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ready_runner(dir.path(), 1).await;
        let pid = runner.pid().unwrap();

        let (_snapshot, stream) = runner.predict(&request("p1")).unwrap();
        std::fs::write(
            ipc::response_path(dir.path(), "p1"),
            r#"{"status":"failed","error":"ValueError: bad input"}"#,
        )
        .unwrap();
        runner.handle_ipc(IpcStatus::Output, pid).await;

        let terminal = stream.wait_terminal().await.unwrap();
        assert_eq!(terminal.status, PredictionStatus::Failed);
        assert_eq!(terminal.error.as_deref(), Some("ValueError: bad input"));

        // Runner still serves
        assert_eq!(runner.state(), RunnerState::Ready);
        assert!(runner.admit(&request("p2")).is_ok());

        runner.force_kill();
    }

    #[tokio::test]
    async fn worker_crash_fails_in_flight() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ready_runner(dir.path(), 1).await;

        let (_snapshot, stream) = runner.predict(&request("p1")).unwrap();
        runner.force_kill();

        let terminal = stream.wait_terminal().await.unwrap();
        assert_eq!(terminal.status, PredictionStatus::Failed);
        assert_eq!(terminal.error.as_deref(), Some("worker crashed"));

        assert!(runner.wait_for_exit(Duration::from_secs(5)).await);
        assert!(matches!(
            runner.admit(&request("p2")),
            Err(RunnerError::Defunct)
        ));
    }

    #[tokio::test]
    async fn exit_before_ready_fails_setup() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Runner::new(
            test_config(dir.path(), 1),
            Arc::new(ShellSpawner("echo 'ImportError: no module'; exit 3")),
        );
        runner.start().await.unwrap();

        assert!(runner.wait_for_exit(Duration::from_secs(5)).await);
        let setup = runner.setup_result();
        assert_eq!(setup.status, Some(crate::health::SetupStatus::Failed));
        assert!(setup.logs.contains("ImportError"));
        assert_eq!(runner.exit_code(), Some(3));
        assert!(matches!(
            runner.admit(&request("p1")),
            Err(RunnerError::Defunct)
        ));
    }

    #[tokio::test]
    async fn cancel_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ready_runner(dir.path(), 1).await;
        let pid = runner.pid().unwrap();

        let (_snapshot, stream) = runner.predict(&request("p1")).unwrap();

        runner.cancel("p1").unwrap();
        runner.cancel("p1").unwrap();
        runner.cancel("p1").unwrap();

        // Worker acknowledges before the watchdog fires
        std::fs::write(
            ipc::response_path(dir.path(), "p1"),
            r#"{"status":"canceled"}"#,
        )
        .unwrap();
        runner.handle_ipc(IpcStatus::Output, pid).await;

        let terminal = stream.wait_terminal().await.unwrap();
        assert_eq!(terminal.status, PredictionStatus::Canceled);
        assert_eq!(runner.state(), RunnerState::Ready);

        runner.force_kill();
    }

    #[tokio::test]
    async fn cancel_unknown_prediction_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ready_runner(dir.path(), 1).await;

        assert!(matches!(
            runner.cancel("nope"),
            Err(RunnerError::PredictionNotFound(_))
        ));

        runner.force_kill();
    }

    #[tokio::test]
    async fn unacknowledged_cancel_marks_runner_defunct() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ready_runner(dir.path(), 1).await;

        let (_snapshot, stream) = runner.predict(&request("p1")).unwrap();
        runner.cancel("p1").unwrap();

        // Watchdog (200ms) fires with the prediction still in flight
        let terminal = stream.wait_terminal().await.unwrap();
        assert_eq!(terminal.status, PredictionStatus::Failed);
        assert_eq!(runner.state(), RunnerState::Defunct);

        runner.force_kill();
    }

    #[tokio::test]
    async fn shutdown_rejects_new_predictions() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ready_runner(dir.path(), 1).await;

        let stopper = {
            let runner = Arc::clone(&runner);
            tokio::spawn(async move { runner.stop().await })
        };
        // Give stop() a moment to set the flag
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(matches!(
            runner.admit(&request("p1")),
            Err(RunnerError::ShuttingDown)
        ));

        stopper.await.unwrap();
        assert_eq!(runner.state(), RunnerState::Exited);
        assert!(std::fs::metadata(ipc::stop_path(dir.path())).is_ok());
    }

    #[tokio::test]
    async fn setup_logs_attribute_before_ready() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Runner::new(test_config(dir.path(), 1), sleeper());

        runner.handle_worker_line("Downloading model...", LogSource::Stdout);
        runner.handle_worker_line("done", LogSource::Stderr);

        let setup = runner.setup_result();
        assert_eq!(setup.logs, "Downloading model...\ndone\n");
    }

    #[tokio::test]
    async fn tagged_lines_attribute_to_their_prediction() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ready_runner(dir.path(), 2).await;

        runner.predict(&request("p1")).unwrap();
        runner.predict(&request("p2")).unwrap();

        runner.handle_worker_line("[pid=p1] step 1", LogSource::Stdout);
        runner.handle_worker_line("[pid=p2] other", LogSource::Stdout);
        runner.handle_worker_line("[pid=p1] step 2", LogSource::Stdout);

        assert_eq!(runner.snapshot("p1").unwrap().logs, "step 1\nstep 2\n");
        assert_eq!(runner.snapshot("p2").unwrap().logs, "other\n");

        runner.force_kill();
    }

    #[tokio::test]
    async fn untagged_lines_attribute_to_sole_prediction() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ready_runner(dir.path(), 2).await;

        runner.predict(&request("p1")).unwrap();
        runner.handle_worker_line("Traceback (most recent call last):", LogSource::Stderr);
        runner.handle_worker_line("  ValueError: oops", LogSource::Stderr);

        let logs = runner.snapshot("p1").unwrap().logs;
        assert!(logs.contains("Traceback"));
        assert!(logs.contains("ValueError"));

        // A second in-flight prediction makes plain lines unattributable
        runner.predict(&request("p2")).unwrap();
        runner.handle_worker_line("now ambiguous", LogSource::Stdout);
        assert!(!runner.snapshot("p1").unwrap().logs.contains("ambiguous"));
        assert!(!runner.snapshot("p2").unwrap().logs.contains("ambiguous"));

        runner.force_kill();
    }

    #[tokio::test]
    async fn structured_records_do_not_mutate_predictions() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ready_runner(dir.path(), 1).await;

        runner.predict(&request("p1")).unwrap();
        runner.handle_worker_line(
            r#"{"severity": "info", "message": "internal detail", "prediction_id": "p1"}"#,
            LogSource::Stdout,
        );

        assert_eq!(runner.snapshot("p1").unwrap().logs, "");

        runner.force_kill();
    }

    #[tokio::test]
    async fn worker_stdout_lines_flow_through_pump() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Runner::new(
            test_config(dir.path(), 1),
            Arc::new(ShellSpawner("echo 'pulling weights'; sleep 30")),
        );
        runner.start().await.unwrap();

        // Give the pump a moment to read the line
        for _ in 0..50 {
            if runner.setup_result().logs.contains("pulling weights") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(runner.setup_result().logs.contains("pulling weights"));

        runner.force_kill();
    }
}
