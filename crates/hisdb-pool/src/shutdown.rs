//! Graceful shutdown on process termination.

use std::io;
use std::time::Duration;

use crate::error::ShutdownError;
use crate::factory::PoolFactory;
use crate::manager::PoolManager;

/// Default deadline for closing every pool at shutdown.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// How a bounded shutdown ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Every materialized pool closed cleanly.
    Clean,
    /// Some pools failed to close; the rest were closed.
    PartialFailure(ShutdownError),
    /// Closing did not finish within the deadline.
    TimedOut(Duration),
}

impl ShutdownOutcome {
    /// Check if every pool closed cleanly.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        matches!(self, Self::Clean)
    }
}

/// Close `manager` within `deadline`.
///
/// Failures and timeouts are logged and reported in the outcome; they are
/// never returned as errors since the process is exiting anyway.
pub async fn close_within<F: PoolFactory>(
    manager: &PoolManager<F>,
    deadline: Duration,
) -> ShutdownOutcome {
    tracing::info!(?deadline, "closing connection pools");

    match tokio::time::timeout(deadline, manager.close()).await {
        Ok(Ok(())) => ShutdownOutcome::Clean,
        Ok(Err(error)) => {
            tracing::error!(%error, "connection pools closed with errors");
            ShutdownOutcome::PartialFailure(error)
        }
        Err(_) => {
            tracing::error!(?deadline, "timed out closing connection pools");
            ShutdownOutcome::TimedOut(deadline)
        }
    }
}

/// Wait until the process receives Ctrl-C or, on Unix, SIGTERM.
pub async fn wait_for_signal() -> io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut terminate = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result?,
            _ = terminate.recv() => {}
        }
    }

    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await?;

    tracing::info!("termination signal received");
    Ok(())
}

/// Wait for a termination signal, then close `manager` within `deadline`.
pub async fn shutdown_on_signal<F: PoolFactory>(
    manager: &PoolManager<F>,
    deadline: Duration,
) -> io::Result<ShutdownOutcome> {
    wait_for_signal().await?;
    Ok(close_within(manager, deadline).await)
}
