//! Bounded connection pool.
//!
//! [`SqlPool`] keeps between `min_connections` and `max_connections` open
//! connections produced by a [`Connector`]. Checkout is bounded by a
//! semaphore and by the connection timeout; connections go back to the idle
//! queue when the [`PooledConnection`] guard is dropped. Idle connections
//! past their idle timeout or maximum lifetime are discarded on checkout.

use std::collections::VecDeque;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::PoolSizing;
use crate::descriptor::ConnectionDescriptor;
use crate::error::{ConfigError, ConnectionError};
use crate::lifecycle::{Connection, ConnectionMetadata, Connector};

/// Maximum lifetime of a pooled connection.
pub const DEFAULT_MAX_LIFETIME: Duration = Duration::from_secs(30 * 60);

/// Size bounds and timeouts for a [`SqlPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolLimits {
    /// Connections opened when the pool is created.
    pub min_connections: u32,
    /// Maximum number of connections open at once.
    pub max_connections: u32,
    /// Time to wait for a connection before timing out.
    pub connection_timeout: Duration,
    /// Time a connection can be idle before being closed.
    pub idle_timeout: Duration,
    /// Maximum lifetime of a connection.
    pub max_lifetime: Duration,
}

impl Default for PoolLimits {
    fn default() -> Self {
        Self::from_sizing(&PoolSizing::default())
    }
}

impl PoolLimits {
    /// Create limits with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Derive limits from a pool's configured sizing.
    #[must_use]
    pub fn from_sizing(sizing: &PoolSizing) -> Self {
        Self {
            min_connections: sizing.min,
            max_connections: sizing.max,
            connection_timeout: sizing.connection_timeout(),
            idle_timeout: sizing.idle_timeout(),
            max_lifetime: DEFAULT_MAX_LIFETIME,
        }
    }

    /// Set the minimum number of connections.
    #[must_use]
    pub fn min_connections(mut self, count: u32) -> Self {
        self.min_connections = count;
        self
    }

    /// Set the maximum number of connections.
    #[must_use]
    pub fn max_connections(mut self, count: u32) -> Self {
        self.max_connections = count;
        self
    }

    /// Set the connection acquisition timeout.
    #[must_use]
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// Set the idle connection timeout.
    #[must_use]
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Set the maximum connection lifetime.
    #[must_use]
    pub fn max_lifetime(mut self, lifetime: Duration) -> Self {
        self.max_lifetime = lifetime;
        self
    }

    /// Validate the limits.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid(
                "max_connections must be greater than 0".into(),
            ));
        }
        if self.min_connections > self.max_connections {
            return Err(ConfigError::Invalid(
                "min_connections cannot be greater than max_connections".into(),
            ));
        }
        Ok(())
    }
}

struct IdleConnection<T> {
    conn: T,
    metadata: ConnectionMetadata,
}

struct PoolInner<C: Connector> {
    connector: C,
    descriptor: ConnectionDescriptor,
    limits: PoolLimits,
    idle: Mutex<VecDeque<IdleConnection<C::Connection>>>,
    permits: Arc<Semaphore>,
    closed: AtomicBool,
    next_connection_id: AtomicU64,
    open_connections: AtomicU32,
}

impl<C: Connector> PoolInner<C> {
    async fn open_connection(&self) -> Result<IdleConnection<C::Connection>, ConnectionError> {
        let timeout = self.limits.connection_timeout;
        let conn = match tokio::time::timeout(timeout, self.connector.connect(&self.descriptor)).await
        {
            Ok(result) => result?,
            Err(_) => return Err(ConnectionError::Timeout(timeout)),
        };

        let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        self.open_connections.fetch_add(1, Ordering::AcqRel);
        tracing::debug!(connection_id = id, server = %self.descriptor.host, "connection opened");

        Ok(IdleConnection {
            conn,
            metadata: ConnectionMetadata::new(id),
        })
    }

    /// Pop the most recently used idle connection that is still fit for use.
    async fn take_idle(&self) -> Option<IdleConnection<C::Connection>> {
        loop {
            let candidate = self.idle.lock().pop_back();
            let idle = candidate?;

            let stale = idle.metadata.is_idle_expired(self.limits.idle_timeout)
                || idle.metadata.is_expired(self.limits.max_lifetime)
                || !idle.conn.is_valid();
            if !stale {
                return Some(idle);
            }

            tracing::debug!(connection_id = idle.metadata.id, "discarding stale connection");
            self.discard(idle.conn, idle.metadata.id).await;
        }
    }

    async fn discard(&self, conn: C::Connection, id: u64) {
        self.open_connections.fetch_sub(1, Ordering::AcqRel);
        if let Err(error) = conn.close().await {
            tracing::debug!(connection_id = id, %error, "error closing discarded connection");
        }
    }

    fn checkin(&self, conn: C::Connection, mut metadata: ConnectionMetadata) {
        let mut idle = self.idle.lock();
        if self.closed.load(Ordering::Acquire) || !conn.is_valid() {
            drop(idle);
            self.open_connections.fetch_sub(1, Ordering::AcqRel);
            tracing::trace!(connection_id = metadata.id, "dropping returned connection");
            return;
        }

        metadata.mark_checkin();
        tracing::trace!(connection_id = metadata.id, "returning connection to pool");
        idle.push_back(IdleConnection { conn, metadata });
    }
}

/// A bounded pool of connections produced by a [`Connector`].
pub struct SqlPool<C: Connector> {
    inner: Arc<PoolInner<C>>,
}

impl<C: Connector> Clone for SqlPool<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: Connector> SqlPool<C> {
    /// Open a pool and its `min_connections` initial connections.
    ///
    /// Opening the initial connections is bounded by the connection timeout
    /// as a whole. If any of them fails or time runs out, the ones already
    /// opened are closed before the error is returned.
    pub async fn open(
        connector: C,
        descriptor: ConnectionDescriptor,
        limits: PoolLimits,
    ) -> Result<Self, ConnectionError> {
        limits
            .validate()
            .map_err(|e| ConnectionError::Open(e.to_string()))?;

        let pool = Self {
            inner: Arc::new(PoolInner {
                connector,
                descriptor,
                limits,
                idle: Mutex::new(VecDeque::with_capacity(limits.max_connections as usize)),
                permits: Arc::new(Semaphore::new(limits.max_connections as usize)),
                closed: AtomicBool::new(false),
                next_connection_id: AtomicU64::new(1),
                open_connections: AtomicU32::new(0),
            }),
        };

        let deadline = limits.connection_timeout;
        let fill = async {
            for _ in 0..limits.min_connections {
                let idle = pool.inner.open_connection().await?;
                pool.inner.idle.lock().push_back(idle);
            }
            Ok::<_, ConnectionError>(())
        };
        let filled = match tokio::time::timeout(deadline, fill).await {
            Ok(result) => result,
            Err(_) => Err(ConnectionError::Timeout(deadline)),
        };
        if let Err(error) = filled {
            if let Err(close_error) = pool.close().await {
                tracing::warn!(%close_error, "error releasing partially opened pool");
            }
            return Err(error);
        }

        tracing::info!(
            server = %pool.inner.descriptor.host,
            database = %pool.inner.descriptor.database,
            min = limits.min_connections,
            max = limits.max_connections,
            "connection pool created"
        );

        Ok(pool)
    }

    /// Get a connection from the pool.
    ///
    /// Reuses an idle connection when one is available, otherwise opens a new
    /// one. Waits at most the connection timeout for a free slot.
    pub async fn get(&self) -> Result<PooledConnection<C>, ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::PoolClosed);
        }

        let wait = self.inner.limits.connection_timeout;
        let permit =
            match tokio::time::timeout(wait, Arc::clone(&self.inner.permits).acquire_owned()).await {
                Ok(Ok(permit)) => permit,
                Ok(Err(_)) => return Err(ConnectionError::PoolClosed),
                Err(_) => return Err(ConnectionError::AcquisitionTimeout(wait)),
            };

        tracing::trace!("acquiring connection from pool");

        let IdleConnection { conn, mut metadata } = match self.inner.take_idle().await {
            Some(idle) => idle,
            None => self.inner.open_connection().await?,
        };
        metadata.mark_checkout();

        Ok(PooledConnection {
            conn: Some(conn),
            metadata,
            pool: Arc::clone(&self.inner),
            _permit: permit,
        })
    }

    /// Check out a connection and run a liveness probe on it.
    ///
    /// A connection that fails the probe is discarded instead of returned.
    pub async fn ping(&self) -> Result<(), ConnectionError> {
        let mut conn = self.get().await?;
        match conn.ping().await {
            Ok(()) => Ok(()),
            Err(error) => {
                conn.discard().await;
                Err(error)
            }
        }
    }

    /// Close the pool and every idle connection.
    ///
    /// Connections still checked out are dropped when they are returned.
    /// Closing an already closed pool is a no-op.
    pub async fn close(&self) -> Result<(), ConnectionError> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.inner.permits.close();

        let drained: Vec<_> = self.inner.idle.lock().drain(..).collect();
        let mut failures = Vec::new();
        for idle in drained {
            self.inner.open_connections.fetch_sub(1, Ordering::AcqRel);
            if let Err(error) = idle.conn.close().await {
                failures.push(format!("connection {}: {error}", idle.metadata.id));
            }
        }

        tracing::info!(
            server = %self.inner.descriptor.host,
            database = %self.inner.descriptor.database,
            "connection pool closed"
        );

        if failures.is_empty() {
            Ok(())
        } else {
            Err(ConnectionError::Close(failures.join("; ")))
        }
    }

    /// Check if the pool is closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Get the current pool status.
    #[must_use]
    pub fn status(&self) -> PoolStatus {
        let available = self.inner.idle.lock().len() as u32;
        let total = self.inner.open_connections.load(Ordering::Acquire);
        PoolStatus {
            available,
            in_use: total.saturating_sub(available),
            total,
            max: self.inner.limits.max_connections,
        }
    }

    /// The limits this pool was opened with.
    #[must_use]
    pub fn limits(&self) -> &PoolLimits {
        &self.inner.limits
    }

    /// The descriptor used to open connections.
    #[must_use]
    pub fn descriptor(&self) -> &ConnectionDescriptor {
        &self.inner.descriptor
    }
}

impl<C: Connector> fmt::Debug for SqlPool<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqlPool")
            .field("descriptor", &self.inner.descriptor)
            .field("limits", &self.inner.limits)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Status information about the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    /// Number of idle connections available.
    pub available: u32,
    /// Number of connections currently in use.
    pub in_use: u32,
    /// Total number of open connections.
    pub total: u32,
    /// Maximum allowed connections.
    pub max: u32,
}

impl PoolStatus {
    /// Calculate the utilization percentage.
    #[must_use]
    pub fn utilization(&self) -> f64 {
        if self.max == 0 {
            return 0.0;
        }
        (f64::from(self.in_use) / f64::from(self.max)) * 100.0
    }
}

/// A connection checked out of a [`SqlPool`].
///
/// When dropped, the connection is returned to the pool.
pub struct PooledConnection<C: Connector> {
    conn: Option<C::Connection>,
    metadata: ConnectionMetadata,
    pool: Arc<PoolInner<C>>,
    _permit: OwnedSemaphorePermit,
}

impl<C: Connector> PooledConnection<C> {
    /// Get the connection metadata.
    #[must_use]
    pub fn metadata(&self) -> &ConnectionMetadata {
        &self.metadata
    }

    /// Close the connection instead of returning it to the pool.
    pub async fn discard(mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.discard(conn, self.metadata.id).await;
        }
    }
}

impl<C: Connector> fmt::Debug for PooledConnection<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}

impl<C: Connector> Deref for PooledConnection<C> {
    type Target = C::Connection;

    #[allow(clippy::expect_used)]
    fn deref(&self) -> &Self::Target {
        self.conn.as_ref().expect("connection is present until drop")
    }
}

impl<C: Connector> DerefMut for PooledConnection<C> {
    #[allow(clippy::expect_used)]
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().expect("connection is present until drop")
    }
}

impl<C: Connector> Drop for PooledConnection<C> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.checkin(conn, self.metadata.clone());
        }
    }
}
