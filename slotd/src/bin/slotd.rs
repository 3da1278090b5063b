// slotd: device daemon
//
// Responsibilities:
// - Serve the WebSocket control socket and advertise it over mDNS
// - Supervise the user application (run, stop, debug, install, clean)
// - Install self-updates into the current slot, rolling back on failure
// - Record fatal errors and replay them to the next client
//
// Exit code 0 after an update or a settings change tells the launcher to
// start the daemon again.

use anyhow::{Context, Result};
use slotd_lib::daemon::{
    config::Config,
    crash::{self, CrashRecorder},
    server::{ExitReason, SessionServer},
};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Resolves on SIGINT or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

async fn serve(config: Config, recorder: &CrashRecorder) -> Result<ExitReason> {
    let pending = match recorder.take_pending() {
        Ok(pending) => pending,
        Err(e) => {
            warn!(path = %recorder.path().display(), "Failed to read crash record: {}", e);
            None
        }
    };
    if pending.is_some() {
        warn!("Previous run crashed; reporting to the next client");
    }

    let server = SessionServer::bind(config, pending)
        .await
        .context("Failed to start control socket")?;
    info!(port = server.local_port(), "slotd ready");
    server.run(shutdown_signal()).await
}

#[tokio::main]
async fn main() {
    init_logging();

    let config = Config::from_env();
    let recorder = CrashRecorder::new(config.crash_log());
    crash::install_panic_hook(recorder.clone());

    match serve(config, &recorder).await {
        Ok(reason) => {
            info!(?reason, "slotd exiting");
        }
        Err(e) => crash::record_fatal(&recorder, &format!("{:#}", e), 1),
    }
}
