//! Pool configuration and the one-time configuration loader.
//!
//! The document is YAML with one entry per logical pool under `database`:
//!
//! ```yaml
//! database:
//!   principal:
//!     host: ${DB_HOST}
//!     port: 1433
//!     name: hospital
//!     user: ${DB_USER}
//!     password: ${DB_PASSWORD}
//!     encrypt: false
//!     trust_server_certificate: true
//!     pool:
//!       min: 2
//!       max: 20
//!       idle_timeout_ms: 300000
//!       connection_timeout_ms: 5000
//! ```
//!
//! Placeholders are substituted in the raw text before the document is
//! parsed, so they may appear in any scalar, including numbers.
//! Connection values (`host`, `name`, `user`, `password`) must not contain
//! `;` after substitution.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::OnceCell;
use serde::Deserialize;

use crate::env::{self, EnvLookup};
use crate::error::ConfigError;

/// Logical name of the primary database.
pub const PRINCIPAL: &str = "principal";

/// Logical name of the secondary database.
pub const SECUNDARIA: &str = "secundaria";

/// Default SQL Server port.
pub const DEFAULT_PORT: u16 = 1433;

/// Sizing and timeouts for one pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PoolSizing {
    /// Connections opened eagerly and kept idle.
    pub min: u32,
    /// Upper bound on open connections.
    pub max: u32,
    /// Idle time after which a connection is discarded.
    pub idle_timeout_ms: u64,
    /// Deadline for opening the pool, probing it, and acquiring a connection.
    pub connection_timeout_ms: u64,
}

impl Default for PoolSizing {
    fn default() -> Self {
        Self {
            min: 1,
            max: 10,
            idle_timeout_ms: 600_000,
            connection_timeout_ms: 30_000,
        }
    }
}

impl PoolSizing {
    /// Idle timeout as a [`Duration`].
    #[must_use]
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// Connection timeout as a [`Duration`].
    #[must_use]
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }
}

/// Connection parameters for one logical pool.
#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct PoolConfiguration {
    /// Server hostname or IP address.
    pub host: String,
    /// Server port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Database name.
    #[serde(rename = "name")]
    pub database_name: String,
    /// SQL login.
    pub user: String,
    /// SQL login password.
    #[serde(default)]
    pub password: String,
    /// Whether to require TLS.
    #[serde(default)]
    pub encrypt: bool,
    /// Whether to trust the server certificate without validation.
    #[serde(default)]
    pub trust_server_certificate: bool,
    /// Pool sizing and timeouts.
    #[serde(default)]
    pub pool: PoolSizing,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

impl fmt::Debug for PoolConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolConfiguration")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database_name", &self.database_name)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("encrypt", &self.encrypt)
            .field("trust_server_certificate", &self.trust_server_certificate)
            .field("pool", &self.pool)
            .finish()
    }
}

impl PoolConfiguration {
    /// Validate the parameters of the pool called `name`.
    ///
    /// Host, database name, user and password end up in a connection string,
    /// so none of them may contain `;`.
    pub fn validate(&self, name: &str) -> Result<(), ConfigError> {
        let invalid = |reason: &str| Err(ConfigError::Invalid(format!("pool '{name}': {reason}")));

        if self.host.trim().is_empty() {
            return invalid("host must not be empty");
        }
        if self.port == 0 {
            return invalid("port must be greater than 0");
        }
        if self.pool.max == 0 {
            return invalid("pool.max must be greater than 0");
        }
        if self.pool.min > self.pool.max {
            return invalid("pool.min cannot be greater than pool.max");
        }
        if self.pool.connection_timeout_ms == 0 {
            return invalid("pool.connection_timeout_ms must be greater than 0");
        }
        // Connection strings split on ';' and have no quoting.
        for (field, value) in [
            ("host", &self.host),
            ("name", &self.database_name),
            ("user", &self.user),
            ("password", &self.password),
        ] {
            if value.contains(';') {
                return invalid(&format!("{field} must not contain ';'"));
            }
        }
        Ok(())
    }
}

/// Every configured pool, keyed by logical name.
///
/// Loaded once per process and shared read-only afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct GlobalConfiguration {
    database: BTreeMap<String, PoolConfiguration>,
}

impl GlobalConfiguration {
    /// Build a configuration from `(name, pool)` pairs.
    pub fn from_pools<I, S>(pools: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (S, PoolConfiguration)>,
        S: Into<String>,
    {
        let config = Self {
            database: pools
                .into_iter()
                .map(|(name, pool)| (name.into(), pool))
                .collect(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Parse already-expanded YAML text.
    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_yaml::from_str(text).map_err(|e| ConfigError::Malformed(Arc::new(e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Parameters for the pool called `name`.
    #[must_use]
    pub fn pool(&self, name: &str) -> Option<&PoolConfiguration> {
        self.database.get(name)
    }

    /// Configured pool names in sorted order.
    pub fn pool_names(&self) -> impl Iterator<Item = &str> {
        self.database.keys().map(String::as_str)
    }

    /// Iterate over `(name, parameters)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &PoolConfiguration)> {
        self.database.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of configured pools.
    #[must_use]
    pub fn len(&self) -> usize {
        self.database.len()
    }

    /// Whether no pool is configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.database.is_empty()
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.database.is_empty() {
            return Err(ConfigError::Invalid("no pools configured under 'database'".into()));
        }
        for (name, pool) in &self.database {
            pool.validate(name)?;
        }
        Ok(())
    }
}

enum Source {
    Path(PathBuf),
    Text(String),
}

/// Loads [`GlobalConfiguration`] once and caches it.
///
/// The first successful [`load`](Self::load) reads the source; later calls
/// return the cached value without touching the source again. A failed load
/// is not cached.
pub struct ConfigLoader {
    source: Source,
    env: EnvLookup,
    cache: OnceCell<Arc<GlobalConfiguration>>,
}

impl ConfigLoader {
    /// Load from a YAML file. Placeholders in the path itself are expanded too.
    #[must_use]
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        Self::with_source(Source::Path(path.into()))
    }

    /// Load from in-memory YAML text.
    #[must_use]
    pub fn from_source(text: impl Into<String>) -> Self {
        Self::with_source(Source::Text(text.into()))
    }

    fn with_source(source: Source) -> Self {
        Self {
            source,
            env: env::process_env(),
            cache: OnceCell::new(),
        }
    }

    /// Resolve placeholders with `lookup` instead of the process environment.
    #[must_use]
    pub fn with_env<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        self.env = Arc::new(lookup);
        self
    }

    /// Load the configuration, reading the source only on the first success.
    pub fn load(&self) -> Result<Arc<GlobalConfiguration>, ConfigError> {
        self.cache
            .get_or_try_init(|| self.read().map(Arc::new))
            .map(Arc::clone)
    }

    /// Whether a configuration has been loaded and cached.
    #[must_use]
    pub fn is_loaded(&self) -> bool {
        self.cache.get().is_some()
    }

    fn read(&self) -> Result<GlobalConfiguration, ConfigError> {
        let raw = match &self.source {
            Source::Path(path) => {
                let path = PathBuf::from(env::expand_with(&path.to_string_lossy(), &*self.env));
                std::fs::read_to_string(&path).map_err(|e| ConfigError::Unreadable {
                    path: path.clone(),
                    source: Arc::new(e),
                })?
            }
            Source::Text(text) => text.clone(),
        };

        let config = GlobalConfiguration::from_yaml(&env::expand_with(&raw, &*self.env))?;
        tracing::info!(
            pools = config.len(),
            names = ?config.pool_names().collect::<Vec<_>>(),
            "pool configuration loaded"
        );
        Ok(config)
    }
}

impl fmt::Debug for ConfigLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let source = match &self.source {
            Source::Path(path) => path.display().to_string(),
            Source::Text(_) => "<inline>".to_string(),
        };
        f.debug_struct("ConfigLoader")
            .field("source", &source)
            .field("loaded", &self.is_loaded())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    const DOCUMENT: &str = r#"
database:
  principal:
    host: ${DB_HOST}
    port: 1433
    name: hospital
    user: ${DB_USER}
    password: ${DB_PASSWORD}
    encrypt: true
    trust_server_certificate: true
    pool:
      min: 2
      max: 20
      idle_timeout_ms: 300000
      connection_timeout_ms: 5000
  secundaria:
    host: billing.internal
    name: facturacion
    user: reader
    password: secret
"#;

    fn env(name: &str) -> Option<String> {
        match name {
            "DB_HOST" => Some("10.0.0.5".into()),
            "DB_USER" => Some("triage_app".into()),
            "DB_PASSWORD" => Some("s3cret".into()),
            _ => None,
        }
    }

    fn temp_path(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("hisdb-pool-{tag}-{}.yml", std::process::id()))
    }

    #[test]
    fn test_placeholders_are_substituted() {
        let loader = ConfigLoader::from_source(DOCUMENT).with_env(env);
        let config = loader.load().unwrap();

        let principal = config.pool(PRINCIPAL).unwrap();
        assert_eq!(principal.host, "10.0.0.5");
        assert_eq!(principal.user, "triage_app");
        assert_eq!(principal.password, "s3cret");
        assert_eq!(principal.database_name, "hospital");
        assert!(principal.encrypt);
        assert_eq!(principal.pool.min, 2);
        assert_eq!(principal.pool.max, 20);
        assert_eq!(principal.pool.connection_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_defaults_apply_to_omitted_fields() {
        let config = ConfigLoader::from_source(DOCUMENT)
            .with_env(env)
            .load()
            .unwrap();

        let secundaria = config.pool(SECUNDARIA).unwrap();
        assert_eq!(secundaria.port, DEFAULT_PORT);
        assert!(!secundaria.encrypt);
        assert!(!secundaria.trust_server_certificate);
        assert_eq!(secundaria.pool, PoolSizing::default());
        assert_eq!(config.pool_names().collect::<Vec<_>>(), vec![PRINCIPAL, SECUNDARIA]);
    }

    #[test]
    fn test_numeric_placeholder() {
        let text = "database:\n  principal:\n    host: db\n    port: ${DB_PORT}\n    name: h\n    user: u\n";
        let config = ConfigLoader::from_source(text)
            .with_env(|name| (name == "DB_PORT").then(|| "14330".to_string()))
            .load()
            .unwrap();

        assert_eq!(config.pool(PRINCIPAL).unwrap().port, 14330);
    }

    #[test]
    fn test_unreadable_source() {
        let loader = ConfigLoader::from_path("/nonexistent/hisdb-pool/config.yml");
        let err = loader.load().unwrap_err();

        assert!(matches!(err, ConfigError::Unreadable { .. }));
        assert!(!loader.is_loaded());
    }

    #[test]
    fn test_path_placeholders_are_expanded() {
        let path = temp_path("path-expansion");
        std::fs::write(&path, DOCUMENT).unwrap();
        let dir = path.parent().unwrap().to_string_lossy().into_owned();
        let file = path.file_name().unwrap().to_string_lossy().into_owned();

        let loader = ConfigLoader::from_path(format!("${{CONFIG_DIR}}/{file}")).with_env(
            move |name| match name {
                "CONFIG_DIR" => Some(dir.clone()),
                other => env(other),
            },
        );
        let config = loader.load().unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.pool(PRINCIPAL).unwrap().host, "10.0.0.5");
    }

    #[test]
    fn test_malformed_structure() {
        let err = ConfigLoader::from_source("database: [principal, {host")
            .load()
            .unwrap_err();
        assert!(matches!(err, ConfigError::Malformed(_)));

        let err = ConfigLoader::from_source("database:\n  principal:\n    port: 1433\n")
            .load()
            .unwrap_err();
        assert!(matches!(err, ConfigError::Malformed(_)), "missing host: {err}");
    }

    #[test]
    fn test_invalid_sizing() {
        let text = "database:\n  principal:\n    host: db\n    name: h\n    user: u\n    pool:\n      min: 5\n      max: 2\n";
        let err = ConfigLoader::from_source(text).load().unwrap_err();

        assert!(matches!(err, ConfigError::Invalid(_)));
        assert!(err.to_string().contains("pool.min cannot be greater than pool.max"));
    }

    #[test]
    fn test_empty_host_after_substitution_is_invalid() {
        let text = "database:\n  principal:\n    host: \"${DB_HOST}\"\n    name: h\n    user: u\n";
        let err = ConfigLoader::from_source(text)
            .with_env(|_| None)
            .load()
            .unwrap_err();

        assert!(err.to_string().contains("host must not be empty"));
    }

    #[test]
    fn test_semicolon_in_connection_values_is_invalid() {
        let text = "database:\n  principal:\n    host: db\n    name: h\n    user: u\n    password: ${DB_PASSWORD}\n";
        let err = ConfigLoader::from_source(text)
            .with_env(|_| Some("pa;ss".to_string()))
            .load()
            .unwrap_err();

        assert!(matches!(err, ConfigError::Invalid(_)));
        assert!(err.to_string().contains("password must not contain ';'"));
        assert!(!err.to_string().contains("pa;ss"));
    }

    #[test]
    fn test_no_pools_is_invalid() {
        let err = ConfigLoader::from_source("database: {}\n").load().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_load_is_cached_after_success() {
        let path = temp_path("cached");
        std::fs::write(&path, DOCUMENT).unwrap();

        let loader = ConfigLoader::from_path(&path).with_env(env);
        let first = loader.load().unwrap();
        std::fs::remove_file(&path).unwrap();
        let second = loader.load().expect("cached value must not re-read the file");

        assert!(loader.is_loaded());
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_debug_redacts_password() {
        let config = ConfigLoader::from_source(DOCUMENT)
            .with_env(env)
            .load()
            .unwrap();
        let debug = format!("{:?}", config.pool(PRINCIPAL).unwrap());

        assert!(!debug.contains("s3cret"));
        assert!(debug.contains("<redacted>"));
    }
}
