use std::path::Path;

use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Deserializer, Serialize};
use validator::{Validate, ValidationError};

use crate::error::ListenerError;

/// Prefix of the environment variables overriding file configuration.
pub const ENV_PREFIX: &str = "PROMETHEUS_";

/// Listener configuration, consumed once at test start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ListenerConfig {
    /// Which fixed attribute families become labels
    #[validate(nested)]
    pub save: SaveConfig,
    /// Collector kind backing the assertion metric
    pub assertion_kind: AssertionKind,
    /// Additional sample attributes exposed as labels, by attribute name
    pub extra_labels: Vec<String>,
    /// Caller-defined sample variable names, in the order the host reports them
    pub sample_variables: Vec<String>,
    /// Label cardinality eviction
    #[validate(nested)]
    pub cache: CacheConfig,
    /// Exposition endpoint
    #[validate(nested)]
    pub server: ServerConfig,
    /// Emit JSON log lines instead of the human readable format
    pub log_json: bool,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            save: SaveConfig::default(),
            assertion_kind: AssertionKind::Counter,
            extra_labels: Vec::new(),
            sample_variables: Vec::new(),
            cache: CacheConfig::default(),
            server: ServerConfig::default(),
            log_json: false,
        }
    }
}

impl ListenerConfig {
    /// Load configuration: defaults, then the YAML file at `path` if it
    /// exists, then `PROMETHEUS_*` environment variables (`__` splits nested
    /// keys, e.g. `PROMETHEUS_SERVER__PORT`).
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ListenerError> {
        let mut figment = Figment::from(Serialized::defaults(ListenerConfig::default()));

        let path = path.as_ref();
        if path.exists() {
            figment = figment.merge(Yaml::file(path));
        } else {
            tracing::debug!(path = %path.display(), "config file not found, using defaults");
        }

        let config: Self = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from defaults and the environment only.
    pub fn from_env() -> Result<Self, ListenerError> {
        let config: Self = Figment::from(Serialized::defaults(ListenerConfig::default()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Eviction TTL in milliseconds, `None` when eviction is disabled.
    pub fn cache_ttl_ms(&self) -> Option<u64> {
        (self.cache.ttl_ms > 0).then_some(self.cache.ttl_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct SaveConfig {
    pub label: bool,
    pub code: bool,
    pub success: bool,
    pub assertions: bool,
    pub threads: bool,
}

impl Default for SaveConfig {
    fn default() -> Self {
        Self {
            label: true,
            code: true,
            success: true,
            assertions: true,
            threads: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct CacheConfig {
    /// Idle time after which a label combination is evicted. 0 disables eviction.
    pub ttl_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
#[validate(schema(function = "validate_thread_bounds"))]
pub struct ServerConfig {
    pub host: String,
    #[validate(range(min = 1))]
    pub port: u16,
    #[validate(range(min = 1))]
    pub thread_min: usize,
    #[validate(range(min = 1))]
    pub thread_max: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9207,
            thread_min: 4,
            thread_max: 4,
        }
    }
}

fn validate_thread_bounds(server: &ServerConfig) -> Result<(), ValidationError> {
    if server.thread_min > server.thread_max {
        let mut err = ValidationError::new("thread_bounds");
        err.message = Some("thread_min must not exceed thread_max".into());
        return Err(err);
    }
    Ok(())
}

/// Collector kind for the assertion metric.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AssertionKind {
    #[default]
    Counter,
    Summary,
}

impl AssertionKind {
    /// Anything other than `summary` (case-insensitive) selects a counter.
    pub fn from_name(name: &str) -> Self {
        if name.trim().eq_ignore_ascii_case("summary") {
            AssertionKind::Summary
        } else {
            AssertionKind::Counter
        }
    }
}

impl<'de> Deserialize<'de> for AssertionKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        Ok(AssertionKind::from_name(&name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = ListenerConfig::default();
        assert!(config.save.label && config.save.code && config.save.success);
        assert_eq!(config.assertion_kind, AssertionKind::Counter);
        assert_eq!(config.server.port, 9207);
        assert_eq!(config.cache_ttl_ms(), None);
        config.validate().expect("default config should validate");
    }

    #[test]
    fn test_assertion_kind_parsing() {
        assert_eq!(AssertionKind::from_name("Summary"), AssertionKind::Summary);
        assert_eq!(AssertionKind::from_name("counter"), AssertionKind::Counter);
        assert_eq!(AssertionKind::from_name("histogram"), AssertionKind::Counter);
    }

    #[test]
    fn test_thread_bounds_rejected() {
        let mut config = ListenerConfig::default();
        config.server.thread_min = 8;
        config.server.thread_max = 2;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_yaml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "assertion_kind: SUMMARY\nsample_variables: [user, region]\ncache:\n  ttl_ms: 1500\nsave:\n  code: false"
        )
        .unwrap();

        let config = ListenerConfig::load(file.path()).unwrap();
        assert_eq!(config.assertion_kind, AssertionKind::Summary);
        assert_eq!(config.sample_variables, vec!["user", "region"]);
        assert_eq!(config.cache_ttl_ms(), Some(1500));
        assert!(!config.save.code);
        assert!(config.save.label);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = ListenerConfig::load(dir.path().join("absent.yaml")).unwrap();
        assert_eq!(config.server, ServerConfig::default());
    }

    #[test]
    fn test_environment_override() {
        figment::Jail::expect_with(|jail| {
            jail.create_file("listener.yaml", "server:\n  port: 9300\n")?;
            jail.set_env("PROMETHEUS_SERVER__PORT", "9400");
            jail.set_env("PROMETHEUS_CACHE__TTL_MS", "250");

            let config = ListenerConfig::load("listener.yaml").map_err(|e| e.to_string())?;
            assert_eq!(config.server.port, 9400);
            assert_eq!(config.cache.ttl_ms, 250);
            Ok(())
        });
    }
}
