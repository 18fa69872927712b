//! The connection pool manager.
//!
//! [`PoolManager`] owns one slot per configured pool name. Slots start empty
//! and are filled on first use by [`PoolManager::get_pool`], which uses
//! double-checked locking:
//!
//! 1. Load the slot without taking any lock. A materialized pool is
//!    returned immediately; this is the steady-state path.
//! 2. Otherwise take the lifecycle lock in shared mode, check the closed
//!    flag, take the slot's construction mutex, and re-check the slot. Only
//!    the first caller builds the pool; everyone queued behind it finds the
//!    slot filled.
//!
//! The lifecycle lock is shared during construction so that different names
//! are built concurrently. [`PoolManager::close`] takes it exclusively, so a
//! close waits for in-flight constructions and then tears everything down.
//! A slot is filled at most once; after close its pool stays allocated,
//! closed, until the manager is dropped.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use once_cell::sync::OnceCell;

use crate::config::{ConfigLoader, GlobalConfiguration, PRINCIPAL, PoolConfiguration};
use crate::error::{ConfigError, ConnectionError, ManagerError, PoolCloseFailure, ShutdownError};
use crate::factory::{ManagedPool, PoolFactory};

/// Extra time a factory gets past its deadline to release what it opened.
const CONSTRUCTION_GRACE: Duration = Duration::from_millis(500);

/// Whether a pool's health decides the aggregate health of the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Criticality {
    /// Absence or probe failure makes the service unhealthy.
    Critical,
    /// Reported per pool without affecting the aggregate.
    Optional,
}

/// Fixed assignment of [`Criticality`] to pool names.
///
/// Names not listed as critical are optional. The default marks only
/// [`PRINCIPAL`] as critical.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CriticalityPolicy {
    critical: BTreeSet<String>,
}

impl Default for CriticalityPolicy {
    fn default() -> Self {
        Self::none().critical(PRINCIPAL)
    }
}

impl CriticalityPolicy {
    /// A policy in which every pool is optional.
    #[must_use]
    pub fn none() -> Self {
        Self {
            critical: BTreeSet::new(),
        }
    }

    /// Mark `name` as critical.
    #[must_use]
    pub fn critical(mut self, name: impl Into<String>) -> Self {
        self.critical.insert(name.into());
        self
    }

    /// Mark `name` as optional.
    #[must_use]
    pub fn optional(mut self, name: &str) -> Self {
        self.critical.remove(name);
        self
    }

    /// Criticality of the pool called `name`.
    #[must_use]
    pub fn of(&self, name: &str) -> Criticality {
        if self.critical.contains(name) {
            Criticality::Critical
        } else {
            Criticality::Optional
        }
    }
}

/// A materialized pool together with its name and configuration.
///
/// Dereferences to the native pool.
pub struct NamedPool<P> {
    name: String,
    pool: P,
    config: PoolConfiguration,
    criticality: Criticality,
}

impl<P> NamedPool<P> {
    /// Logical pool name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The native pool.
    #[must_use]
    pub fn pool(&self) -> &P {
        &self.pool
    }

    /// Configuration the pool was opened with.
    #[must_use]
    pub fn config(&self) -> &PoolConfiguration {
        &self.config
    }

    /// Criticality assigned by the manager's policy.
    #[must_use]
    pub fn criticality(&self) -> Criticality {
        self.criticality
    }
}

impl<P> Deref for NamedPool<P> {
    type Target = P;

    fn deref(&self) -> &P {
        &self.pool
    }
}

impl<P> fmt::Debug for NamedPool<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NamedPool")
            .field("name", &self.name)
            .field("database", &self.config.database_name)
            .field("criticality", &self.criticality)
            .finish_non_exhaustive()
    }
}

struct Slot<P> {
    ready: OnceCell<Arc<NamedPool<P>>>,
    init: tokio::sync::Mutex<()>,
}

impl<P> Slot<P> {
    fn new() -> Self {
        Self {
            ready: OnceCell::new(),
            init: tokio::sync::Mutex::new(()),
        }
    }

    fn current(&self) -> Option<Arc<NamedPool<P>>> {
        self.ready.get().cloned()
    }
}

/// State of one configured pool, as seen without constructing anything.
#[derive(Debug)]
pub struct PoolSnapshot<P> {
    /// Logical pool name.
    pub name: String,
    /// Criticality from the manager's policy.
    pub criticality: Criticality,
    /// The pool, if it has been materialized.
    pub pool: Option<Arc<NamedPool<P>>>,
}

/// Owns the named pools of the process.
///
/// Construct one per process (see [`ManagerCell`]) and share it by `Arc`.
pub struct PoolManager<F: PoolFactory> {
    config: Arc<GlobalConfiguration>,
    factory: F,
    policy: CriticalityPolicy,
    slots: BTreeMap<String, Slot<F::Pool>>,
    lifecycle: tokio::sync::RwLock<()>,
    closed: AtomicBool,
}

impl<F: PoolFactory> PoolManager<F> {
    /// Create a manager for every pool in `config`. No pool is opened yet.
    #[must_use]
    pub fn new(config: Arc<GlobalConfiguration>, factory: F) -> Self {
        let slots = config
            .pool_names()
            .map(|name| (name.to_string(), Slot::new()))
            .collect();

        Self {
            config,
            factory,
            policy: CriticalityPolicy::default(),
            slots,
            lifecycle: tokio::sync::RwLock::new(()),
            closed: AtomicBool::new(false),
        }
    }

    /// Load configuration through `loader` and create a manager from it.
    pub fn from_loader(loader: &ConfigLoader, factory: F) -> Result<Self, ConfigError> {
        Ok(Self::new(loader.load()?, factory))
    }

    /// Replace the criticality policy.
    #[must_use]
    pub fn with_policy(mut self, policy: CriticalityPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Get the pool called `name`, opening it on first use.
    ///
    /// Concurrent first calls for the same name share one construction and
    /// all receive the same pool. A failed or timed-out construction leaves
    /// nothing behind, so the next call starts afresh.
    pub async fn get_pool(&self, name: &str) -> Result<Arc<NamedPool<F::Pool>>, ManagerError> {
        let slot = self
            .slots
            .get(name)
            .ok_or_else(|| ManagerError::UnknownPool(name.to_string()))?;

        if self.is_closed() {
            return Err(ManagerError::Closed);
        }
        if let Some(pool) = slot.current() {
            return Ok(pool);
        }

        self.materialize(name, slot).await
    }

    async fn materialize(
        &self,
        name: &str,
        slot: &Slot<F::Pool>,
    ) -> Result<Arc<NamedPool<F::Pool>>, ManagerError> {
        let _lifecycle = self.lifecycle.read().await;
        if self.is_closed() {
            return Err(ManagerError::Closed);
        }

        let _init = slot.init.lock().await;
        if let Some(pool) = slot.current() {
            return Ok(pool);
        }

        let config = self
            .config
            .pool(name)
            .ok_or_else(|| ManagerError::UnknownPool(name.to_string()))?;
        let deadline = config.pool.connection_timeout();
        let started = Instant::now();

        // The factory enforces `deadline` itself and cleans up on expiry;
        // this outer bound only catches factories that ignore it.
        tracing::debug!(pool = name, "materializing connection pool");
        let opened = tokio::time::timeout(
            deadline + CONSTRUCTION_GRACE,
            self.factory.open(name, config),
        )
        .await;
        let pool = match opened {
            Ok(Ok(pool)) => pool,
            Ok(Err(ConnectionError::Timeout(_))) | Err(_) => {
                tracing::warn!(pool = name, ?deadline, "connection pool construction timed out");
                return Err(ManagerError::Timeout {
                    name: name.to_string(),
                    deadline,
                });
            }
            Ok(Err(source)) => {
                tracing::warn!(pool = name, error = %source, "connection pool construction failed");
                return Err(ManagerError::Connection {
                    name: name.to_string(),
                    source,
                });
            }
        };

        let named = Arc::new(NamedPool {
            name: name.to_string(),
            pool,
            config: config.clone(),
            criticality: self.policy.of(name),
        });
        let named = Arc::clone(slot.ready.get_or_init(|| named));

        tracing::info!(
            pool = name,
            database = %config.database_name,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "connection pool ready"
        );
        Ok(named)
    }

    /// Materialize every pool in `names`, stopping at the first failure.
    ///
    /// Used at startup to verify credentials of pools that must be available
    /// before traffic arrives.
    pub async fn warm_up<'a, I>(&self, names: I) -> Result<(), ManagerError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        for name in names {
            self.get_pool(name).await?;
        }
        Ok(())
    }

    /// Close every materialized pool.
    ///
    /// Marks the manager closed before tearing anything down, so no pool can
    /// be created afterwards. Every pool is closed even if an earlier one
    /// fails; all failures are returned together. Calling this again is a
    /// no-op that succeeds.
    pub async fn close(&self) -> Result<(), ShutdownError> {
        let _lifecycle = self.lifecycle.write().await;
        if self.closed.swap(true, Ordering::AcqRel) {
            tracing::debug!("pool manager already closed");
            return Ok(());
        }

        let mut failures = Vec::new();
        let mut closed = Vec::new();
        for (name, slot) in &self.slots {
            let Some(named) = slot.current() else {
                continue;
            };

            match named.pool.close().await {
                Ok(()) => {
                    tracing::info!(pool = %name, "connection pool closed");
                    closed.push(name.clone());
                }
                Err(error) => {
                    tracing::error!(pool = %name, %error, "failed to close connection pool");
                    failures.push(PoolCloseFailure {
                        pool: name.clone(),
                        error,
                    });
                }
            }
        }

        if failures.is_empty() {
            tracing::info!(closed = closed.len(), "pool manager closed");
            Ok(())
        } else {
            Err(ShutdownError { failures, closed })
        }
    }

    /// Check if the manager has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Check if the pool called `name` is currently materialized.
    ///
    /// Always false once the manager is closed.
    #[must_use]
    pub fn is_materialized(&self, name: &str) -> bool {
        self.slots
            .get(name)
            .is_some_and(|slot| self.live(slot).is_some())
    }

    fn live(&self, slot: &Slot<F::Pool>) -> Option<Arc<NamedPool<F::Pool>>> {
        if self.is_closed() {
            None
        } else {
            slot.current()
        }
    }

    /// Configured pool names in sorted order.
    pub fn pool_names(&self) -> impl Iterator<Item = &str> {
        self.slots.keys().map(String::as_str)
    }

    /// The configuration the manager was created with.
    #[must_use]
    pub fn configuration(&self) -> &GlobalConfiguration {
        &self.config
    }

    /// Criticality of the pool called `name`.
    #[must_use]
    pub fn criticality(&self, name: &str) -> Criticality {
        self.policy.of(name)
    }

    /// The factory used to open pools.
    #[must_use]
    pub fn factory(&self) -> &F {
        &self.factory
    }

    /// Current state of every configured pool.
    ///
    /// Only reads slots; never opens a pool.
    #[must_use]
    pub fn snapshot(&self) -> Vec<PoolSnapshot<F::Pool>> {
        self.slots
            .iter()
            .map(|(name, slot)| PoolSnapshot {
                name: name.clone(),
                criticality: self.policy.of(name),
                pool: self.live(slot),
            })
            .collect()
    }
}

impl<F: PoolFactory> fmt::Debug for PoolManager<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let materialized: Vec<&str> = self
            .slots
            .iter()
            .filter(|(_, slot)| self.live(slot).is_some())
            .map(|(name, _)| name.as_str())
            .collect();
        f.debug_struct("PoolManager")
            .field("pools", &self.slots.keys().collect::<Vec<_>>())
            .field("materialized", &materialized)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// One-shot holder for the process-wide [`PoolManager`].
///
/// The first [`get_or_init`](Self::get_or_init) runs the constructor; every
/// later call returns the same manager, or the same error if construction
/// failed. Construction is never retried.
pub struct ManagerCell<F: PoolFactory> {
    cell: OnceCell<Result<Arc<PoolManager<F>>, ConfigError>>,
}

impl<F: PoolFactory> ManagerCell<F> {
    /// Create an empty cell. Usable in a `static`.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            cell: OnceCell::new(),
        }
    }

    /// Return the manager, constructing it with `init` on the first call.
    pub fn get_or_init<I>(&self, init: I) -> Result<Arc<PoolManager<F>>, ConfigError>
    where
        I: FnOnce() -> Result<PoolManager<F>, ConfigError>,
    {
        self.cell
            .get_or_init(|| match init() {
                Ok(manager) => {
                    tracing::info!(
                        pools = ?manager.pool_names().collect::<Vec<_>>(),
                        "pool manager initialized"
                    );
                    Ok(Arc::new(manager))
                }
                Err(error) => {
                    tracing::error!(%error, "pool manager construction failed");
                    Err(error)
                }
            })
            .clone()
    }

    /// Return the manager if it has been constructed successfully.
    pub fn get(&self) -> Result<Arc<PoolManager<F>>, ManagerError> {
        match self.cell.get() {
            Some(Ok(manager)) => Ok(Arc::clone(manager)),
            Some(Err(error)) => Err(ManagerError::Config(error.clone())),
            None => Err(ManagerError::NotInitialized),
        }
    }
}

impl<F: PoolFactory> Default for ManagerCell<F> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SECUNDARIA;

    #[test]
    fn test_default_policy_marks_principal_critical() {
        let policy = CriticalityPolicy::default();

        assert_eq!(policy.of(PRINCIPAL), Criticality::Critical);
        assert_eq!(policy.of(SECUNDARIA), Criticality::Optional);
        assert_eq!(policy.of("reporting"), Criticality::Optional);
    }

    #[test]
    fn test_policy_builder() {
        let policy = CriticalityPolicy::default()
            .critical(SECUNDARIA)
            .optional(PRINCIPAL);

        assert_eq!(policy.of(PRINCIPAL), Criticality::Optional);
        assert_eq!(policy.of(SECUNDARIA), Criticality::Critical);
        assert_eq!(CriticalityPolicy::none().of(PRINCIPAL), Criticality::Optional);
    }
}
