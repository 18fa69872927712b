//! Pool construction.
//!
//! A [`PoolFactory`] turns one pool's configuration into a ready, verified
//! native pool. The manager calls it at most once per name at a time and
//! never keeps a pool that failed verification.

use std::time::Instant;

use async_trait::async_trait;

use crate::config::PoolConfiguration;
use crate::descriptor::ConnectionDescriptor;
use crate::error::ConnectionError;
use crate::lifecycle::Connector;
use crate::pool::{PoolLimits, SqlPool};

/// A native pool as seen by the manager and the health checker.
#[async_trait]
pub trait ManagedPool: Send + Sync + 'static {
    /// Run a liveness probe against the pool.
    async fn ping(&self) -> Result<(), ConnectionError>;

    /// Release every resource held by the pool.
    async fn close(&self) -> Result<(), ConnectionError>;
}

/// Opens verified native pools.
#[async_trait]
pub trait PoolFactory: Send + Sync + 'static {
    /// Pool type produced by this factory.
    type Pool: ManagedPool;

    /// Open the pool called `name` and verify it answers a liveness probe.
    ///
    /// Implementations must release anything they opened before returning an
    /// error, and should honor `config.pool.connection_timeout_ms`.
    async fn open(&self, name: &str, config: &PoolConfiguration)
    -> Result<Self::Pool, ConnectionError>;
}

#[async_trait]
impl<C: Connector> ManagedPool for SqlPool<C> {
    async fn ping(&self) -> Result<(), ConnectionError> {
        SqlPool::ping(self).await
    }

    async fn close(&self) -> Result<(), ConnectionError> {
        SqlPool::close(self).await
    }
}

/// Factory producing [`SqlPool`]s from a [`Connector`].
#[derive(Debug, Clone)]
pub struct SqlPoolFactory<C> {
    connector: C,
    application_name: Option<String>,
}

impl<C: Connector + Clone> SqlPoolFactory<C> {
    /// Create a factory opening connections through `connector`.
    #[must_use]
    pub fn new(connector: C) -> Self {
        Self {
            connector,
            application_name: None,
        }
    }

    /// Report `name` to SQL Server as the application name.
    #[must_use]
    pub fn application_name(mut self, name: impl Into<String>) -> Self {
        self.application_name = Some(name.into());
        self
    }

    /// The connector used for new pools.
    #[must_use]
    pub fn connector(&self) -> &C {
        &self.connector
    }
}

#[async_trait]
impl<C: Connector + Clone> PoolFactory for SqlPoolFactory<C> {
    type Pool = SqlPool<C>;

    async fn open(
        &self,
        name: &str,
        config: &PoolConfiguration,
    ) -> Result<SqlPool<C>, ConnectionError> {
        let mut descriptor = ConnectionDescriptor::from_config(config);
        if let Some(app) = &self.application_name {
            descriptor = descriptor.application_name(app.clone());
        }
        let limits = PoolLimits::from_sizing(&config.pool);
        let deadline = limits.connection_timeout;
        let started = Instant::now();

        tracing::debug!(pool = name, server = %descriptor, "opening connection pool");
        let pool = SqlPool::open(self.connector.clone(), descriptor, limits).await?;

        let remaining = deadline.saturating_sub(started.elapsed());
        let probe = match tokio::time::timeout(remaining, pool.ping()).await {
            Ok(result) => result,
            Err(_) => Err(ConnectionError::Timeout(deadline)),
        };

        if let Err(error) = probe {
            tracing::warn!(pool = name, %error, "liveness probe failed; releasing pool");
            if let Err(close_error) = pool.close().await {
                tracing::warn!(pool = name, %close_error, "error releasing unverified pool");
            }
            return Err(error);
        }

        tracing::debug!(
            pool = name,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "connection pool verified"
        );
        Ok(pool)
    }
}
