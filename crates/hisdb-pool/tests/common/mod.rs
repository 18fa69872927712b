//! Scripted pool factory and connector shared by the integration tests.

#![allow(dead_code, clippy::unwrap_used)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use hisdb_pool::{
    Connection, ConnectionDescriptor, ConnectionError, Connector, GlobalConfiguration,
    ManagedPool, PRINCIPAL, PoolConfiguration, PoolFactory, PoolSizing, SECUNDARIA,
};

/// Parameters for a pool with the given connection timeout.
pub fn pool_config(connection_timeout_ms: u64) -> PoolConfiguration {
    PoolConfiguration {
        host: "10.0.0.5".into(),
        port: 1433,
        database_name: "hospital".into(),
        user: "his_app".into(),
        password: "s3cret".into(),
        encrypt: false,
        trust_server_certificate: true,
        pool: PoolSizing {
            min: 1,
            max: 4,
            idle_timeout_ms: 60_000,
            connection_timeout_ms,
        },
    }
}

/// `principal` and `secundaria`, both with the given connection timeout.
pub fn two_pools(connection_timeout_ms: u64) -> Arc<GlobalConfiguration> {
    Arc::new(
        GlobalConfiguration::from_pools([
            (PRINCIPAL, pool_config(connection_timeout_ms)),
            (SECUNDARIA, pool_config(connection_timeout_ms)),
        ])
        .unwrap(),
    )
}

/// Shared, mutable behavior of a [`MockFactory`] and the pools it opens.
#[derive(Debug, Default)]
pub struct Script {
    pub opens: AtomicU32,
    pub closes: AtomicU32,
    pub pings: AtomicU32,
    pub open_delay_ms: AtomicU64,
    pub fail_open: AtomicBool,
    pub fail_close: Mutex<HashSet<String>>,
    pub fail_ping: Mutex<HashSet<String>>,
    pub hang_ping: Mutex<HashSet<String>>,
    pub opened_names: Mutex<Vec<String>>,
}

impl Script {
    pub fn opens(&self) -> u32 {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> u32 {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn set_open_delay(&self, delay: Duration) {
        self.open_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn fail_close_of(&self, name: &str) {
        self.fail_close.lock().unwrap().insert(name.to_string());
    }

    pub fn fail_ping_of(&self, name: &str) {
        self.fail_ping.lock().unwrap().insert(name.to_string());
    }

    pub fn hang_ping_of(&self, name: &str) {
        self.hang_ping.lock().unwrap().insert(name.to_string());
    }
}

#[derive(Clone, Default)]
pub struct MockFactory {
    pub script: Arc<Script>,
}

#[derive(Debug)]
pub struct MockPool {
    pub name: String,
    pub id: u32,
    script: Arc<Script>,
}

#[async_trait]
impl ManagedPool for MockPool {
    async fn ping(&self) -> Result<(), ConnectionError> {
        self.script.pings.fetch_add(1, Ordering::SeqCst);
        let hang = self.script.hang_ping.lock().unwrap().contains(&self.name);
        if hang {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        if self.script.fail_ping.lock().unwrap().contains(&self.name) {
            return Err(ConnectionError::Probe("login failed for user 'his_app'".into()));
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), ConnectionError> {
        self.script.closes.fetch_add(1, Ordering::SeqCst);
        if self.script.fail_close.lock().unwrap().contains(&self.name) {
            return Err(ConnectionError::Close("socket reset".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl PoolFactory for MockFactory {
    type Pool = MockPool;

    async fn open(
        &self,
        name: &str,
        _config: &PoolConfiguration,
    ) -> Result<MockPool, ConnectionError> {
        let id = self.script.opens.fetch_add(1, Ordering::SeqCst) + 1;
        self.script
            .opened_names
            .lock()
            .unwrap()
            .push(name.to_string());

        let delay = self.script.open_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.script.fail_open.load(Ordering::SeqCst) {
            return Err(ConnectionError::Open("connection refused".into()));
        }

        Ok(MockPool {
            name: name.to_string(),
            id,
            script: Arc::clone(&self.script),
        })
    }
}

/// Counters observed through a [`MockConnector`].
#[derive(Default)]
pub struct Wire {
    pub connects: AtomicU32,
    pub disconnects: AtomicU32,
    pub fail_ping: AtomicBool,
    pub ping_delay_ms: AtomicU64,
    pub connect_delay_ms: AtomicU64,
}

impl Wire {
    /// Connections opened and not yet closed.
    pub fn live(&self) -> u32 {
        self.connects.load(Ordering::SeqCst) - self.disconnects.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Default)]
pub struct MockConnector {
    pub wire: Arc<Wire>,
}

pub struct MockConnection {
    wire: Arc<Wire>,
}

#[async_trait]
impl Connection for MockConnection {
    async fn ping(&mut self) -> Result<(), ConnectionError> {
        let delay = self.wire.ping_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.wire.fail_ping.load(Ordering::SeqCst) {
            return Err(ConnectionError::Probe("database 'hospital' is offline".into()));
        }
        Ok(())
    }

    async fn close(self) -> Result<(), ConnectionError> {
        self.wire.disconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl Connector for MockConnector {
    type Connection = MockConnection;

    async fn connect(
        &self,
        _descriptor: &ConnectionDescriptor,
    ) -> Result<MockConnection, ConnectionError> {
        let delay = self.wire.connect_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.wire.connects.fetch_add(1, Ordering::SeqCst);
        Ok(MockConnection {
            wire: Arc::clone(&self.wire),
        })
    }
}

/// Route `tracing` output to the test harness.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("hisdb_pool=debug")
        .try_init();
}
