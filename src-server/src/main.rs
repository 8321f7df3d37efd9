//! manuscript-server: HTTP front end for long-form generation jobs.

mod handlers;
mod state;

use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use thiserror::Error;
use tokio::signal;
use tower_http::trace::TraceLayer;

use manuscript::logging::{self, LogFormat};
use manuscript::{load_config, JobService, ManuscriptError};

use crate::state::AppState;

#[derive(Debug, Parser)]
#[command(name = "manuscript-server", version, about = "Serve long-form generation jobs over HTTP")]
struct Args {
    /// Path to the JSON config file.
    #[arg(short, long, env = "MANUSCRIPT_CONFIG")]
    config: PathBuf,

    #[arg(short, long, env = "MANUSCRIPT_LISTEN", default_value = "127.0.0.1:8080")]
    listen: SocketAddr,

    /// `plain` or `json`.
    #[arg(long, env = "MANUSCRIPT_LOG_FORMAT", default_value = "plain")]
    log_format: LogFormat,

    /// Seconds to wait for running jobs on shutdown.
    #[arg(long, default_value_t = 30)]
    shutdown_grace_secs: u64,
}

#[derive(Debug, Error)]
enum ServerError {
    #[error(transparent)]
    Manuscript(#[from] ManuscriptError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    if let Err(e) = logging::init(args.log_format) {
        eprintln!("Failed to initialize logging: {}", e);
        return ExitCode::FAILURE;
    }

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<(), ServerError> {
    let config = load_config(&args.config).map_err(ManuscriptError::from)?;
    log::info!("Loaded config from {}", args.config.display());

    let service = Arc::new(JobService::from_config(&config)?);
    let sweeper = service.spawn_stall_sweeper(config.stall.sweep_interval());

    let app = handlers::router(AppState::new(Arc::clone(&service))).layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(args.listen).await?;
    log::info!("Listening on http://{}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    log::info!("Shutting down, waiting up to {}s for running jobs", args.shutdown_grace_secs);
    service
        .shutdown(Duration::from_secs(args.shutdown_grace_secs))
        .await;
    sweeper.abort();

    Ok(())
}

/// Resolves once `listener` reports its signal. A listener that could not
/// be installed never resolves, so it cannot trigger a shutdown by itself.
async fn await_signal<E>(name: &str, listener: impl Future<Output = Result<(), E>>)
where
    E: std::fmt::Display,
{
    match listener.await {
        Ok(()) => log::info!("Received {}", name),
        Err(err) => {
            log::error!("Failed to listen for {}: {}", name, err);
            std::future::pending::<()>().await
        }
    }
}

/// Resolves on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = await_signal("Ctrl+C", signal::ctrl_c());

    #[cfg(unix)]
    let terminate = await_signal("SIGTERM", async {
        let mut sig = signal::unix::signal(signal::unix::SignalKind::terminate())?;
        sig.recv().await;
        Ok::<(), std::io::Error>(())
    });

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
