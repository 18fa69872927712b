//! Connection lifecycle management.
//!
//! This module defines the seams between the pool and the wire-level
//! driver: a [`Connector`] opens connections from a
//! [`ConnectionDescriptor`], and each [`Connection`] knows how to answer a
//! liveness probe and close itself.

use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::descriptor::ConnectionDescriptor;
use crate::error::ConnectionError;

/// Query used for liveness probes.
pub const PROBE_QUERY: &str = "SELECT 1";

/// A single open database connection.
///
/// `#[async_trait]` keeps the returned futures `Send`, so pools can be
/// driven from any task on a multi-threaded runtime.
#[async_trait]
pub trait Connection: Send + 'static {
    /// Verify the connection is alive, typically with `SELECT 1`.
    async fn ping(&mut self) -> Result<(), ConnectionError>;

    /// Close the connection gracefully.
    async fn close(self) -> Result<(), ConnectionError>;

    /// Cheap local check that the connection is still usable.
    ///
    /// Unlike [`ping`](Self::ping) this does not touch the network.
    fn is_valid(&self) -> bool {
        true
    }
}

/// Opens connections for a pool.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Connection type produced by this connector.
    type Connection: Connection;

    /// Open one connection described by `descriptor`.
    async fn connect(
        &self,
        descriptor: &ConnectionDescriptor,
    ) -> Result<Self::Connection, ConnectionError>;
}

/// Metadata about a pooled connection.
#[derive(Debug, Clone)]
pub struct ConnectionMetadata {
    /// Unique identifier for this connection within its pool.
    pub id: u64,
    /// When the connection was created.
    pub created_at: Instant,
    /// When the connection was last checked out or returned.
    pub last_used_at: Instant,
    /// Number of times the connection has been checked out.
    pub checkout_count: u64,
}

impl ConnectionMetadata {
    /// Create metadata for a new connection.
    #[must_use]
    pub fn new(id: u64) -> Self {
        let now = Instant::now();
        Self {
            id,
            created_at: now,
            last_used_at: now,
            checkout_count: 0,
        }
    }

    /// Check if the connection has exceeded its maximum lifetime.
    #[must_use]
    pub fn is_expired(&self, max_lifetime: Duration) -> bool {
        self.created_at.elapsed() > max_lifetime
    }

    /// Check if the connection has been idle too long.
    #[must_use]
    pub fn is_idle_expired(&self, idle_timeout: Duration) -> bool {
        self.last_used_at.elapsed() > idle_timeout
    }

    /// Mark the connection as checked out.
    pub fn mark_checkout(&mut self) {
        self.last_used_at = Instant::now();
        self.checkout_count += 1;
    }

    /// Mark the connection as returned to idle.
    pub fn mark_checkin(&mut self) {
        self.last_used_at = Instant::now();
    }
}
