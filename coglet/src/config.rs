//! Runtime configuration.
//!
//! All paths and limits are injected through this struct; nothing in the
//! crate reads mutable process-global state. The binary populates it from
//! `COGLET_*` environment variables.

use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    /// Each request carries a URL to a code bundle loaded into a dedicated
    /// runner; toggles the `/procedures` path prefix.
    pub use_procedure_mode: bool,
    /// Root for runner working directories.
    pub working_directory: PathBuf,
    /// Maximum number of live runners (procedure mode).
    pub max_runners: usize,
    /// Per-runner prediction concurrency.
    pub max_concurrency: usize,
    /// Worker module reference (default mode).
    pub module: String,
    /// Predictor entrypoint within the module (default mode).
    pub predictor: String,
    /// Worker launch argv.
    pub worker_command: Vec<String>,
    /// Optional unix socket also serving `/_ipc`.
    pub ipc_socket: Option<PathBuf>,
    /// Base URL workers post status pings to.
    pub ipc_url: String,

    pub setup_timeout: Duration,
    pub cancel_timeout: Duration,
    pub drain_timeout: Duration,
    /// How long a procedure request waits for a fresh runner to reach ready.
    pub ready_timeout: Duration,

    pub host: String,
    pub port: u16,
    /// If true, ignore SIGTERM and wait for explicit /shutdown or SIGINT.
    /// Used in Kubernetes to allow graceful draining.
    pub await_explicit_shutdown: bool,
    /// Readiness file created on first healthy check under Kubernetes.
    pub readiness_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            use_procedure_mode: false,
            working_directory: PathBuf::from("."),
            max_runners: 1,
            max_concurrency: 1,
            module: "predict".to_string(),
            predictor: "Predictor".to_string(),
            worker_command: vec![
                "python3".to_string(),
                "-m".to_string(),
                "coglet.worker".to_string(),
            ],
            ipc_socket: None,
            ipc_url: "http://127.0.0.1:5000".to_string(),
            setup_timeout: Duration::from_secs(300),
            cancel_timeout: Duration::from_secs(10),
            drain_timeout: Duration::from_secs(30),
            ready_timeout: Duration::from_secs(60),
            host: "0.0.0.0".to_string(),
            port: 5000,
            await_explicit_shutdown: false,
            readiness_path: PathBuf::from("/var/run/cog/ready"),
        }
    }
}

impl Config {
    /// Build from `COGLET_*` environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        config.use_procedure_mode = env_flag("COGLET_PROCEDURE_MODE");
        if let Some(dir) = env_var("COGLET_WORKING_DIR") {
            config.working_directory = PathBuf::from(dir);
        }
        if let Some(n) = env_parse::<usize>("COGLET_MAX_RUNNERS") {
            config.max_runners = n.max(1);
        }
        if let Some(n) = env_parse::<usize>("COGLET_MAX_CONCURRENCY") {
            config.max_concurrency = n.max(1);
        }
        if let Some(module) = env_var("COGLET_MODULE") {
            config.module = module;
        }
        if let Some(predictor) = env_var("COGLET_PREDICTOR") {
            config.predictor = predictor;
        }
        if let Some(command) = env_var("COGLET_WORKER_COMMAND") {
            let argv: Vec<String> = command.split_whitespace().map(str::to_string).collect();
            if !argv.is_empty() {
                config.worker_command = argv;
            }
        }
        if let Some(path) = env_var("COGLET_IPC_SOCKET") {
            config.ipc_socket = Some(PathBuf::from(path));
        }
        if let Some(host) = env_var("COGLET_HOST") {
            config.host = host;
        }
        if let Some(port) = env_parse::<u16>("COGLET_PORT") {
            config.port = port;
        }
        if let Some(secs) = env_parse::<u64>("COGLET_SETUP_TIMEOUT") {
            config.setup_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("COGLET_CANCEL_TIMEOUT") {
            config.cancel_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("COGLET_DRAIN_TIMEOUT") {
            config.drain_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("COGLET_READY_TIMEOUT") {
            config.ready_timeout = Duration::from_secs(secs);
        }
        config.await_explicit_shutdown = env_flag("COGLET_AWAIT_EXPLICIT_SHUTDOWN");
        if let Some(path) = env_var("COGLET_READINESS_PATH") {
            config.readiness_path = PathBuf::from(path);
        }
        config.ipc_url = env_var("COGLET_IPC_URL")
            .unwrap_or_else(|| format!("http://127.0.0.1:{}", config.port));

        config
    }

    /// Global concurrency cap: per-runner cap in default mode, the product
    /// of runners and per-runner cap in procedure mode.
    pub fn global_max_concurrency(&self) -> usize {
        if self.use_procedure_mode {
            self.max_runners * self.max_concurrency
        } else {
            self.max_concurrency
        }
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    env_var(name).and_then(|v| v.parse().ok())
}

fn env_flag(name: &str) -> bool {
    matches!(
        env_var(name).as_deref(),
        Some("1") | Some("true") | Some("yes")
    )
}
