//! Connection descriptor assembled from a pool's configuration.

use std::fmt;
use std::time::Duration;

use crate::config::PoolConfiguration;

/// Application name reported to SQL Server.
pub const DEFAULT_APPLICATION_NAME: &str = "hisdb-pool";

/// Everything a connector needs to open one connection.
///
/// `Debug` and `Display` never include the password.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionDescriptor {
    /// Server hostname or IP address.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// Database name.
    pub database: String,
    /// SQL login.
    pub user: String,
    password: String,
    /// Whether to require TLS.
    pub encrypt: bool,
    /// Whether to trust the server certificate without validation.
    pub trust_server_certificate: bool,
    /// Timeout for establishing one connection.
    pub connect_timeout: Duration,
    /// Application name (shown in SQL Server management tools).
    pub application_name: String,
}

impl ConnectionDescriptor {
    /// Assemble a descriptor from a pool's configuration.
    #[must_use]
    pub fn from_config(config: &PoolConfiguration) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            database: config.database_name.clone(),
            user: config.user.clone(),
            password: config.password.clone(),
            encrypt: config.encrypt,
            trust_server_certificate: config.trust_server_certificate,
            connect_timeout: config.pool.connection_timeout(),
            application_name: DEFAULT_APPLICATION_NAME.to_string(),
        }
    }

    /// Set the application name.
    #[must_use]
    pub fn application_name(mut self, name: impl Into<String>) -> Self {
        self.application_name = name.into();
        self
    }

    /// The login password.
    #[must_use]
    pub fn password(&self) -> &str {
        &self.password
    }

    /// Render an ADO.NET-style connection string.
    ///
    /// Values are emitted verbatim; the format has no escaping for `;`.
    #[must_use]
    pub fn to_connection_string(&self) -> String {
        self.render(&self.password)
    }

    fn render(&self, password: &str) -> String {
        format!(
            "Server={},{};Database={};User Id={};Password={};Encrypt={};\
             TrustServerCertificate={};Connect Timeout={};Application Name={}",
            self.host,
            self.port,
            self.database,
            self.user,
            password,
            self.encrypt,
            self.trust_server_certificate,
            connect_timeout_secs(self.connect_timeout),
            self.application_name,
        )
    }
}

/// Whole seconds, rounded up so sub-second timeouts never become 0 (no limit).
fn connect_timeout_secs(timeout: Duration) -> u64 {
    let secs = timeout.as_secs();
    if timeout.subsec_nanos() > 0 || secs == 0 {
        secs + 1
    } else {
        secs
    }
}

impl fmt::Display for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render("***"))
    }
}

impl fmt::Debug for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionDescriptor")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("encrypt", &self.encrypt)
            .field("trust_server_certificate", &self.trust_server_certificate)
            .field("connect_timeout", &self.connect_timeout)
            .finish_non_exhaustive()
    }
}
