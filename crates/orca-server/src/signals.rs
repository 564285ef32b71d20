//! Termination and fault notifications.
//!
//! Listeners only call [`ShutdownTrigger::trigger`]; the drain itself runs
//! on the supervisor task.

use orca_core::{ShutdownReason, ShutdownTrigger};
use tokio::task::{JoinError, JoinHandle};
use tracing::info;

/// Installed termination signal handlers.
#[cfg(unix)]
pub struct SignalListener {
    sigterm: tokio::signal::unix::Signal,
    sigint: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl SignalListener {
    /// Register SIGTERM and SIGINT handlers.
    pub fn install() -> std::io::Result<Self> {
        use tokio::signal::unix::{SignalKind, signal};

        Ok(Self {
            sigterm: signal(SignalKind::terminate())?,
            sigint: signal(SignalKind::interrupt())?,
        })
    }

    /// Forward the first signal received to `trigger`.
    pub fn spawn(mut self, trigger: ShutdownTrigger) -> JoinHandle<()> {
        tokio::spawn(async move {
            let name = tokio::select! {
                _ = self.sigterm.recv() => "SIGTERM",
                _ = self.sigint.recv() => "SIGINT",
            };
            info!(signal = name, "Received termination signal");
            trigger.trigger(ShutdownReason::Signal(name.to_string()));
        })
    }
}

#[cfg(not(unix))]
pub struct SignalListener;

#[cfg(not(unix))]
impl SignalListener {
    pub fn install() -> std::io::Result<Self> {
        Ok(Self)
    }

    pub fn spawn(self, trigger: ShutdownTrigger) -> JoinHandle<()> {
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received ctrl-c");
                trigger.trigger(ShutdownReason::Signal("ctrl-c".to_string()));
            }
        })
    }
}

/// Fault reason for a supervised task that panicked or failed.
pub fn fault_reason<T>(
    task: &str,
    result: &Result<anyhow::Result<T>, JoinError>,
) -> Option<ShutdownReason> {
    match result {
        Ok(Ok(_)) => None,
        Ok(Err(e)) => Some(ShutdownReason::Fault(format!("{} failed: {:#}", task, e))),
        Err(e) if e.is_panic() => Some(ShutdownReason::Fault(format!("{} panicked", task))),
        Err(e) => Some(ShutdownReason::Fault(format!("{} aborted: {}", task, e))),
    }
}
