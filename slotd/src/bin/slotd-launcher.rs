// slotd-launcher: start slotd from the first healthy slot
//
// Tries current, previous, then default. Stays the parent of the chosen
// daemon, forwards SIGINT/SIGTERM to it, and exits with its exit code so the
// init system decides when to launch again.

use slotd_lib::daemon::{bootstrap::BootstrapChain, config::Config};
use std::env;
use tokio::process::Child;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn forward(child: &Child, sig: libc::c_int) {
    let Some(pid) = child.id() else {
        return;
    };
    // SAFETY: kill(2) has no memory-safety preconditions
    let rc = unsafe { libc::kill(pid as libc::pid_t, sig) };
    if rc != 0 {
        warn!(pid, sig, "Failed to forward signal: {}", std::io::Error::last_os_error());
    }
}

/// Wait for the daemon, passing termination signals through. Returns its exit code.
async fn supervise(mut child: Child) -> i32 {
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => Some(s),
        Err(e) => {
            warn!("Failed to listen for SIGTERM: {}", e);
            None
        }
    };
    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(s) => Some(s),
        Err(e) => {
            warn!("Failed to listen for SIGINT: {}", e);
            None
        }
    };

    loop {
        tokio::select! {
            status = child.wait() => {
                return match status {
                    Ok(status) => {
                        info!(code = ?status.code(), "Daemon exited");
                        // Killed by a signal: report the conventional 128+n
                        status.code().unwrap_or_else(|| {
                            use std::os::unix::process::ExitStatusExt;
                            128 + status.signal().unwrap_or(0)
                        })
                    }
                    Err(e) => {
                        error!("Failed to wait on daemon: {}", e);
                        1
                    }
                };
            }
            Some(_) = async { sigterm.as_mut()?.recv().await } => {
                forward(&child, libc::SIGTERM);
            }
            Some(_) = async { sigint.as_mut()?.recv().await } => {
                forward(&child, libc::SIGINT);
            }
        }
    }
}

#[tokio::main]
async fn main() {
    init_logging();

    let config = Config::from_env();
    let args: Vec<String> = env::args().skip(1).collect();
    let chain = BootstrapChain::from_config(&config).with_args(args);

    let launched = match chain.launch().await {
        Ok(launched) => launched,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };

    info!(slot = %launched.slot, "Supervising daemon");
    let code = supervise(launched.child).await;
    std::process::exit(code);
}
