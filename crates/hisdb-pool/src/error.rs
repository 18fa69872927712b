//! Error types for configuration loading, pool construction, and shutdown.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while loading the pool configuration.
///
/// Configuration errors are fatal at startup. The type is `Clone` so that a
/// failed one-time initialization can be replayed to every later caller.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    /// The configuration source could not be read.
    #[error("cannot read configuration from {}: {source}", .path.display())]
    Unreadable {
        /// Path that was read, after environment expansion.
        path: PathBuf,
        /// Underlying I/O failure.
        #[source]
        source: Arc<std::io::Error>,
    },

    /// The configuration text is not a well-formed document.
    #[error("malformed configuration: {0}")]
    Malformed(#[source] Arc<serde_yaml::Error>),

    /// The document parsed but describes an unusable pool setup.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Errors raised by a native pool or one of its connections.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    /// Opening a connection failed.
    #[error("failed to open connection: {0}")]
    Open(String),

    /// The liveness probe reported a failure.
    #[error("liveness probe failed: {0}")]
    Probe(String),

    /// The operation did not finish within its deadline.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Closing one or more connections failed.
    #[error("failed to close connection: {0}")]
    Close(String),

    /// The pool has been closed.
    #[error("pool is closed")]
    PoolClosed,

    /// No connection became available before the acquisition timeout.
    #[error("no connection available within {0:?}")]
    AcquisitionTimeout(Duration),
}

impl ConnectionError {
    /// Check if this error is transient and may succeed on retry.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Open(_) | Self::Probe(_) | Self::Timeout(_) | Self::AcquisitionTimeout(_)
        )
    }
}

/// Errors returned by the pool manager.
#[derive(Debug, Error)]
pub enum ManagerError {
    /// The named pool could not be opened or failed its liveness probe.
    #[error("pool '{name}' is unavailable: {source}")]
    Connection {
        /// Logical pool name.
        name: String,
        /// Underlying failure.
        #[source]
        source: ConnectionError,
    },

    /// Constructing the named pool exceeded its deadline.
    #[error("pool '{name}' was not ready within {deadline:?}")]
    Timeout {
        /// Logical pool name.
        name: String,
        /// Deadline that was exceeded.
        deadline: Duration,
    },

    /// The manager has been closed; no pool will be created.
    #[error("pool manager is closed")]
    Closed,

    /// No pool with this name is configured.
    #[error("no pool named '{0}' is configured")]
    UnknownPool(String),

    /// The process-wide manager has not been constructed yet.
    #[error("pool manager has not been initialized")]
    NotInitialized,

    /// Constructing the manager failed while loading configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl ManagerError {
    /// Check if the caller should answer with "service unavailable".
    ///
    /// These failures leave the manager usable; a later call retries the
    /// construction from scratch.
    #[must_use]
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Timeout { .. })
    }
}

/// A single pool that failed to close during shutdown.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{pool}: {error}")]
pub struct PoolCloseFailure {
    /// Logical pool name.
    pub pool: String,
    /// Why the close failed.
    pub error: ConnectionError,
}

/// Aggregate of every per-pool failure seen while closing the manager.
///
/// Closing continues past individual failures, so this also records the
/// pools that did close cleanly.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{}", describe_shutdown(.failures, .closed))]
pub struct ShutdownError {
    /// Pools whose close failed, in close order.
    pub failures: Vec<PoolCloseFailure>,
    /// Pools that closed without error.
    pub closed: Vec<String>,
}

impl ShutdownError {
    /// Names of the pools that failed to close.
    pub fn failed_pools(&self) -> impl Iterator<Item = &str> {
        self.failures.iter().map(|f| f.pool.as_str())
    }
}

fn describe_shutdown(failures: &[PoolCloseFailure], closed: &[String]) -> String {
    let failed = failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ");
    format!(
        "failed to close {} of {} pool(s) [{failed}]; closed cleanly: [{}]",
        failures.len(),
        failures.len() + closed.len(),
        closed.join(", ")
    )
}
