//! coglet: multi-runner prediction server for cog models.

mod health;
mod prediction;
mod version;

pub mod config;
pub mod file_output;
pub mod http;
pub mod ipc;
pub mod logs;
pub mod manager;
pub mod runner;
pub mod store;
pub mod webhook;

pub use config::Config;

pub use health::{Concurrency, Health, SetupResult, SetupStatus};
pub use manager::{CancellationToken, ManagerError, RunnerManager};
pub use prediction::{PredictionRequest, PredictionResponse, PredictionStatus};
pub use runner::{
    CommandSpawner, Runner, RunnerConfig, RunnerError, RunnerState, WorkerLaunch, WorkerSpawner,
};
pub use store::{OutputStream, PredictionStore};
pub use version::{COGLET_VERSION, VersionInfo};
pub use webhook::{WebhookConfig, WebhookError, WebhookEvent, WebhookSender};
