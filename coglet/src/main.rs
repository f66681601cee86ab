use std::process::ExitCode;
use std::sync::Arc;

use coglet::{Config, RunnerManager};

fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if std::env::var("COGLET_LOG_JSON").as_deref() == Ok("1") {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    let config = Config::from_env();
    tracing::info!(
        version = coglet::COGLET_VERSION,
        procedure_mode = config.use_procedure_mode,
        max_runners = config.max_runners,
        max_concurrency = config.max_concurrency,
        "coglet starting"
    );

    let manager = match RunnerManager::new(config) {
        Ok(manager) => manager,
        Err(e) => {
            tracing::error!(error = %e, "Failed to initialize runner manager");
            return ExitCode::from(1);
        }
    };

    // Setup runs in the background so the HTTP surface (health checks, IPC)
    // is reachable while the worker is still loading.
    {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move {
            if let Err(e) = manager.start().await {
                tracing::error!(error = %e, "Manager startup failed");
            }
        });
    }

    if let Err(e) = coglet::http::serve(Arc::clone(&manager)).await {
        tracing::error!(error = %e, "Server error");
        return ExitCode::from(1);
    }

    let code = u8::try_from(manager.exit_code().clamp(0, 255)).unwrap_or(1);
    ExitCode::from(code)
}
