//! Aggregated health reporting.
//!
//! The checker only looks at pools that are already materialized; it never
//! opens a pool. Each materialized pool gets one liveness probe bounded by
//! the checker's deadline, and all probes run concurrently.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use futures_util::future::join_all;
use serde::{Serialize, Serializer};

use crate::factory::{ManagedPool, PoolFactory};
use crate::manager::{Criticality, PoolManager};

/// Default deadline for one health check.
pub const DEFAULT_HEALTH_DEADLINE: Duration = Duration::from_secs(2);

/// Aggregate health of the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Every critical pool answered its probe.
    Healthy,
    /// At least one critical pool is missing or failed its probe.
    Unhealthy,
}

/// Health of a single pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolHealth {
    /// The probe succeeded.
    Ok,
    /// The pool has not been materialized.
    NotReady,
    /// The probe failed or timed out.
    Failed(String),
}

impl PoolHealth {
    /// Check if the pool answered its probe.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }
}

impl fmt::Display for PoolHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => f.write_str("ok"),
            Self::NotReady => f.write_str("not ready"),
            Self::Failed(detail) => f.write_str(detail),
        }
    }
}

impl Serialize for PoolHealth {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Result of one health check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    /// Aggregate status.
    pub status: HealthStatus,
    /// Per-pool detail, keyed by pool name.
    pub per_pool: BTreeMap<String, PoolHealth>,
}

impl HealthReport {
    /// Check if the aggregate status is healthy.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }

    /// HTTP status code for a health endpoint: 200 or 503.
    #[must_use]
    pub fn http_status(&self) -> u16 {
        match self.status {
            HealthStatus::Healthy => 200,
            HealthStatus::Unhealthy => 503,
        }
    }
}

/// Probes the pools held by a [`PoolManager`].
#[derive(Debug, Clone, Copy)]
pub struct HealthChecker {
    deadline: Duration,
}

impl Default for HealthChecker {
    fn default() -> Self {
        Self::new(DEFAULT_HEALTH_DEADLINE)
    }
}

impl HealthChecker {
    /// Create a checker bounding each probe by `deadline`.
    #[must_use]
    pub fn new(deadline: Duration) -> Self {
        Self { deadline }
    }

    /// The per-probe deadline.
    #[must_use]
    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    /// Probe every materialized pool and aggregate the result.
    pub async fn check<F: PoolFactory>(&self, manager: &PoolManager<F>) -> HealthReport {
        let deadline = self.deadline;
        let probes = manager.snapshot().into_iter().map(|snapshot| async move {
            let health = match &snapshot.pool {
                None => PoolHealth::NotReady,
                Some(pool) => match tokio::time::timeout(deadline, pool.pool().ping()).await {
                    Ok(Ok(())) => PoolHealth::Ok,
                    Ok(Err(error)) => PoolHealth::Failed(error.to_string()),
                    Err(_) => PoolHealth::Failed(format!("probe timed out after {deadline:?}")),
                },
            };
            (snapshot.name, snapshot.criticality, health)
        });

        let mut status = HealthStatus::Healthy;
        let mut per_pool = BTreeMap::new();
        for (name, criticality, health) in join_all(probes).await {
            if !health.is_ok() {
                if criticality == Criticality::Critical {
                    tracing::warn!(pool = %name, %health, "critical pool unhealthy");
                    status = HealthStatus::Unhealthy;
                } else {
                    tracing::debug!(pool = %name, %health, "optional pool unhealthy");
                }
            }
            per_pool.insert(name, health);
        }

        HealthReport { status, per_pool }
    }
}
