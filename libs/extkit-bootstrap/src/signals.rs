use std::fmt;

use tokio::signal;

/// Which signal asked the host to stop. `extd` logs it and starts the
/// manager's ordered cleanup; both map to exit code 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    Interrupt,
    Terminate,
}

impl fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ShutdownSignal::Interrupt => "SIGINT",
            ShutdownSignal::Terminate => "SIGTERM",
        })
    }
}

/// Resolve once the process is asked to stop.
///
/// Watches Ctrl+C everywhere and SIGTERM on unix. A SIGTERM handler that
/// cannot be installed degrades to Ctrl+C-only instead of failing host
/// startup; shutdown must stay reachable even then.
pub async fn shutdown_signal() -> ShutdownSignal {
    let received = watch().await;
    tracing::info!(signal = %received, "shutdown signal received");
    received
}

#[cfg(unix)]
async fn watch() -> ShutdownSignal {
    use tokio::signal::unix::{signal as unix_signal, SignalKind};

    let mut terminate = match unix_signal(SignalKind::terminate()) {
        Ok(stream) => Some(stream),
        Err(e) => {
            tracing::error!(error = %e, "cannot watch SIGTERM; only Ctrl+C will stop the host");
            None
        }
    };

    match terminate.as_mut() {
        Some(terminate) => tokio::select! {
            _ = signal::ctrl_c() => ShutdownSignal::Interrupt,
            _ = terminate.recv() => ShutdownSignal::Terminate,
        },
        None => {
            let _ = signal::ctrl_c().await;
            ShutdownSignal::Interrupt
        }
    }
}

#[cfg(not(unix))]
async fn watch() -> ShutdownSignal {
    let _ = signal::ctrl_c().await;
    ShutdownSignal::Interrupt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signals_display_their_conventional_names() {
        assert_eq!(ShutdownSignal::Interrupt.to_string(), "SIGINT");
        assert_eq!(ShutdownSignal::Terminate.to_string(), "SIGTERM");
    }
}
