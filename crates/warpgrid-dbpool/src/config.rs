//! Registry configuration loaded from TOML.
//!
//! ```toml
//! [defaults]
//! max = 16
//! timeout = 300
//! check_interval_ms = 5000
//!
//! [[database]]
//! id = 0
//! name = "main"
//! params = { type = "postgres", host = "db.local", port = 5432, user = "app" }
//! options = { max = 32, maxspare = 8 }
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::connection::{Connection, ConnectionFactory};
use crate::error::{PoolError, PoolResult};
use crate::options::{PoolOptions, PoolSettings};
use crate::params::ConnectParams;
use crate::registry::PoolRegistry;

/// Top-level registry configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RegistryConfig {
    #[serde(default)]
    pub defaults: DefaultsConfig,
    #[serde(default, rename = "database")]
    pub databases: Vec<DatabaseConfig>,
}

/// The `[defaults]` table: template options plus the maintenance interval.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(try_from = "toml::Table")]
pub struct DefaultsConfig {
    /// Sweep interval for the maintenance thread; 0 leaves it stopped.
    pub check_interval_ms: u64,
    pub options: PoolOptions,
}

impl TryFrom<toml::Table> for DefaultsConfig {
    type Error = String;

    fn try_from(mut table: toml::Table) -> Result<Self, Self::Error> {
        let check_interval_ms = match table.remove("check_interval_ms") {
            None => 0,
            Some(toml::Value::Integer(ms)) => u64::try_from(ms)
                .map_err(|_| format!("check_interval_ms must not be negative, got {ms}"))?,
            Some(other) => {
                return Err(format!(
                    "check_interval_ms must be an integer, got {}",
                    other.type_str()
                ));
            }
        };
        let options = toml::Value::Table(table)
            .try_into()
            .map_err(|e: toml::de::Error| e.to_string())?;
        Ok(Self {
            check_interval_ms,
            options,
        })
    }
}

/// One `[[database]]` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub id: u32,
    pub name: String,
    /// Scalar values are accepted and stored as strings (`port = 5432`).
    pub params: BTreeMap<String, toml::Value>,
    pub options: Option<PoolOptions>,
}

impl DatabaseConfig {
    /// Convert the params table to a [`ConnectParams`] bag.
    pub fn connect_params(&self) -> PoolResult<ConnectParams> {
        self.params
            .iter()
            .map(|(key, value)| {
                let value = match value {
                    toml::Value::String(s) => s.clone(),
                    toml::Value::Integer(i) => i.to_string(),
                    toml::Value::Float(f) => f.to_string(),
                    toml::Value::Boolean(b) => b.to_string(),
                    other => {
                        return Err(PoolError::Config(format!(
                            "database `{}`: param `{key}` must be a scalar, got {}",
                            self.name,
                            other.type_str()
                        )));
                    }
                };
                Ok((key.clone(), value))
            })
            .collect()
    }
}

impl RegistryConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: RegistryConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn from_toml_str(s: &str) -> anyhow::Result<Self> {
        let config: RegistryConfig = toml::from_str(s)?;
        Ok(config)
    }

    pub fn check_interval(&self) -> Option<Duration> {
        match self.defaults.check_interval_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }
}

impl<C: Connection> PoolRegistry<C> {
    /// Build a registry from `config`: apply the defaults, define every
    /// database in file order, then start maintenance if an interval is set.
    pub fn from_config(
        factory: Arc<dyn ConnectionFactory<Connection = C>>,
        config: &RegistryConfig,
    ) -> PoolResult<Self> {
        let registry = Self::with_defaults(
            factory,
            PoolSettings::default().merged(&config.defaults.options),
        );

        let no_options = PoolOptions::default();
        for db in &config.databases {
            let params = db.connect_params()?;
            let options = db.options.as_ref().unwrap_or(&no_options);
            registry.define_database(db.id, &db.name, params, options)?;
        }

        if let Some(interval) = config.check_interval() {
            registry.start_pool_check(interval)?;
        }
        Ok(registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NullConnection;

    impl Connection for NullConnection {
        fn ping(&mut self) -> bool {
            true
        }

        fn close(&mut self) {}
    }

    #[derive(Default)]
    struct CountingFactory {
        connects: AtomicUsize,
    }

    impl ConnectionFactory for CountingFactory {
        type Connection = NullConnection;

        fn connect(&self, _params: &ConnectParams) -> anyhow::Result<NullConnection> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(NullConnection)
        }
    }

    const SAMPLE: &str = r#"
        [defaults]
        max = 16
        timeout = 120
        check_interval_ms = 50

        [[database]]
        id = 0
        name = "main"
        params = { type = "postgres", host = "db.local", port = 5432, user = "app" }

        [[database]]
        id = 3
        name = "reports"
        params = { type = "mysql", host = "reports.local", port = 3306 }
        options = { max = 4, maxspare = 2 }
    "#;

    #[test]
    fn parse_full_config() {
        let config = RegistryConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.defaults.options.max, Some(16));
        assert_eq!(config.defaults.options.timeout, Some(Duration::from_secs(120)));
        assert_eq!(config.check_interval(), Some(Duration::from_millis(50)));
        assert_eq!(config.databases.len(), 2);

        let params = config.databases[0].connect_params().unwrap();
        assert_eq!(params.get("port"), Some("5432"));
        assert_eq!(params.get("host"), Some("db.local"));
        assert_eq!(config.databases[1].options.as_ref().unwrap().max_spare, Some(2));
    }

    #[test]
    fn empty_config_has_no_databases_and_no_maintenance() {
        let config = RegistryConfig::from_toml_str("").unwrap();
        assert!(config.databases.is_empty());
        assert_eq!(config.check_interval(), None);
    }

    #[test]
    fn unknown_default_key_is_rejected() {
        let result = RegistryConfig::from_toml_str("[defaults]\nmaximum = 3\n");
        assert!(result.is_err());
    }

    #[test]
    fn negative_check_interval_is_rejected() {
        let result = RegistryConfig::from_toml_str("[defaults]\ncheck_interval_ms = -5\n");
        assert!(result.is_err());
    }

    #[test]
    fn non_scalar_param_is_rejected() {
        let config = RegistryConfig::from_toml_str(
            r#"
            [[database]]
            id = 1
            name = "bad"
            params = { host = ["a", "b"] }
            "#,
        )
        .unwrap();
        let err = config.databases[0].connect_params().unwrap_err();
        assert!(matches!(err, PoolError::Config(msg) if msg.contains("host")));
    }

    #[test]
    fn missing_required_field_fails_to_parse() {
        let result = RegistryConfig::from_toml_str("[[database]]\nid = 1\n");
        assert!(result.is_err());
    }

    #[test]
    fn from_file_reads_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let config = RegistryConfig::from_file(file.path()).unwrap();
        assert_eq!(config.databases[1].name, "reports");
    }

    #[test]
    fn from_file_missing_path_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(RegistryConfig::from_file(&dir.path().join("absent.toml")).is_err());
    }

    #[test]
    fn registry_from_config_defines_pools() {
        let config = RegistryConfig::from_toml_str(SAMPLE).unwrap();
        let factory = Arc::new(CountingFactory::default());
        let registry: PoolRegistry<NullConnection> =
            PoolRegistry::from_config(factory.clone(), &config).unwrap();

        assert_eq!(registry.ids(), vec![0, 3]);
        assert_eq!(registry.pool("main").unwrap().settings().max, 16);
        let reports = registry.pool("reports").unwrap().settings();
        assert_eq!(reports.max, 4);
        assert_eq!(reports.max_spare, 2);
        assert_eq!(reports.idle_timeout, Duration::from_secs(120));
        assert!(registry.is_checking());
        assert_eq!(factory.connects.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn registry_from_config_rejects_duplicate_names() {
        let config = RegistryConfig::from_toml_str(
            r#"
            [[database]]
            id = 1
            name = "dup"
            params = { host = "a" }

            [[database]]
            id = 2
            name = "dup"
            params = { host = "b" }
            "#,
        )
        .unwrap();
        let factory = Arc::new(CountingFactory::default());
        let result: PoolResult<PoolRegistry<NullConnection>> =
            PoolRegistry::from_config(factory, &config);
        assert!(matches!(result, Err(PoolError::DuplicateName { existing: 1, .. })));
    }
}
