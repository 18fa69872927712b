//! # hisdb-pool
//!
//! Lifecycle management for the named SQL Server connection pools of the
//! hospital administration service.
//!
//! Two logical databases are configured, `principal` and `secundaria`. A
//! single [`PoolManager`] owns both pools, materializes each on first use,
//! and shares it with every caller afterwards.
//!
//! ## Features
//!
//! - YAML configuration with `${VAR}` environment substitution
//! - Lazy, race-free pool construction bounded by a connection timeout
//! - Liveness verification before a pool is handed out
//! - Aggregated health report with per-pool detail
//! - Ordered shutdown that closes every pool and reports partial failures
//! - Native TDS connections through `mssql-client` (`tds` feature)
//!
//! ## Example
//!
//! ```rust,ignore
//! use hisdb_pool::{ConfigLoader, HealthChecker, ManagerCell, PoolManager, SqlPoolFactory};
//! use hisdb_pool::tds::TdsConnector;
//!
//! static MANAGER: ManagerCell<SqlPoolFactory<TdsConnector>> = ManagerCell::new();
//!
//! let loader = ConfigLoader::from_path("${CONFIG_DIR}/database.yaml");
//! let manager = MANAGER.get_or_init(|| {
//!     PoolManager::from_loader(&loader, SqlPoolFactory::new(TdsConnector::new()))
//! })?;
//!
//! let principal = manager.get_pool("principal").await?;
//! let mut conn = principal.get().await?;
//! conn.client().simple_query("SELECT 1").await?;
//!
//! let report = HealthChecker::default().check(&manager).await;
//! assert_eq!(report.http_status(), 200);
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod config;
pub mod descriptor;
pub mod env;
pub mod error;
pub mod factory;
pub mod health;
pub mod lifecycle;
pub mod manager;
pub mod pool;
pub mod shutdown;
#[cfg(feature = "tds")]
pub mod tds;

pub use config::{
    ConfigLoader, GlobalConfiguration, PRINCIPAL, PoolConfiguration, PoolSizing, SECUNDARIA,
};
pub use descriptor::ConnectionDescriptor;
pub use error::{ConfigError, ConnectionError, ManagerError, PoolCloseFailure, ShutdownError};
pub use factory::{ManagedPool, PoolFactory, SqlPoolFactory};
pub use health::{HealthChecker, HealthReport, HealthStatus, PoolHealth};
pub use lifecycle::{Connection, ConnectionMetadata, Connector};
pub use manager::{Criticality, CriticalityPolicy, ManagerCell, NamedPool, PoolManager};
pub use pool::{PoolLimits, PoolStatus, PooledConnection, SqlPool};
pub use shutdown::{ShutdownOutcome, close_within, wait_for_signal};
