//! Runtime configuration.
//!
//! [`SyncConfig::default`] is usable as is for a local-only session. For real
//! deployments [`SyncConfig::from_env`] reads `TASKSYNC_*` variables, after
//! loading a `.env` file from the working directory if one exists.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Which local store to open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocalStorage {
    /// SQLite where the platform can run it, nothing otherwise.
    #[default]
    Auto,
    Sqlite,
    /// No local persistence; mutations go straight to the remote store.
    None,
}

impl FromStr for LocalStorage {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(LocalStorage::Auto),
            "sqlite" => Ok(LocalStorage::Sqlite),
            "none" | "null" => Ok(LocalStorage::None),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub database_url: String,
    pub local_storage: LocalStorage,
    pub remote_url: Option<String>,
    pub api_key: Option<String>,
    pub sync_interval_secs: u64,
    pub backoff_base_secs: u64,
    pub backoff_max_secs: u64,
    /// Rejected pushes before an entry is parked as failed.
    pub max_push_attempts: u32,
    pub request_timeout_secs: u64,
    pub probe_interval_secs: u64,
    /// Start a cycle right after every local mutation.
    pub sync_on_mutation: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite:./tasksync.db?mode=rwc".to_string(),
            local_storage: LocalStorage::Auto,
            remote_url: None,
            api_key: None,
            sync_interval_secs: 300,
            backoff_base_secs: 2,
            backoff_max_secs: 300,
            max_push_attempts: 5,
            request_timeout_secs: 15,
            probe_interval_secs: 10,
            sync_on_mutation: true,
        }
    }
}

fn parse_var<T: FromStr>(var: &'static str, value: String) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::Invalid { var, value })
}

impl SyncConfig {
    /// Build a config from `TASKSYNC_*` environment variables, falling back
    /// to the defaults for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        if let Ok(path) = dotenvy::dotenv() {
            log::debug!("Loaded environment from {}", path.display());
        }
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build a config from an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(v) = lookup("TASKSYNC_DATABASE_URL") {
            config.database_url = v;
        }
        if let Some(v) = lookup("TASKSYNC_LOCAL_STORAGE") {
            config.local_storage = parse_var("TASKSYNC_LOCAL_STORAGE", v)?;
        }
        config.remote_url = lookup("TASKSYNC_REMOTE_URL").filter(|v| !v.is_empty());
        config.api_key = lookup("TASKSYNC_API_KEY").filter(|v| !v.is_empty());
        if let Some(v) = lookup("TASKSYNC_SYNC_INTERVAL_SECS") {
            config.sync_interval_secs = parse_var("TASKSYNC_SYNC_INTERVAL_SECS", v)?;
        }
        if let Some(v) = lookup("TASKSYNC_BACKOFF_BASE_SECS") {
            config.backoff_base_secs = parse_var("TASKSYNC_BACKOFF_BASE_SECS", v)?;
        }
        if let Some(v) = lookup("TASKSYNC_BACKOFF_MAX_SECS") {
            config.backoff_max_secs = parse_var("TASKSYNC_BACKOFF_MAX_SECS", v)?;
        }
        if let Some(v) = lookup("TASKSYNC_MAX_PUSH_ATTEMPTS") {
            config.max_push_attempts = parse_var("TASKSYNC_MAX_PUSH_ATTEMPTS", v)?;
        }
        if let Some(v) = lookup("TASKSYNC_REQUEST_TIMEOUT_SECS") {
            config.request_timeout_secs = parse_var("TASKSYNC_REQUEST_TIMEOUT_SECS", v)?;
        }
        if let Some(v) = lookup("TASKSYNC_PROBE_INTERVAL_SECS") {
            config.probe_interval_secs = parse_var("TASKSYNC_PROBE_INTERVAL_SECS", v)?;
        }
        if let Some(v) = lookup("TASKSYNC_SYNC_ON_MUTATION") {
            config.sync_on_mutation = parse_var("TASKSYNC_SYNC_ON_MUTATION", v)?;
        }
        if config.max_push_attempts == 0 {
            return Err(ConfigError::Invalid {
                var: "TASKSYNC_MAX_PUSH_ATTEMPTS",
                value: "0".to_string(),
            });
        }
        Ok(config)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_secs(self.backoff_base_secs)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_secs(self.backoff_max_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = SyncConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, SyncConfig::default());
        assert_eq!(config.sync_interval(), Duration::from_secs(300));
    }

    #[test]
    fn test_reads_overrides() {
        let config = SyncConfig::from_lookup(lookup(&[
            ("TASKSYNC_LOCAL_STORAGE", "none"),
            ("TASKSYNC_REMOTE_URL", "https://example.test"),
            ("TASKSYNC_MAX_PUSH_ATTEMPTS", "3"),
            ("TASKSYNC_SYNC_ON_MUTATION", "false"),
        ]))
        .unwrap();
        assert_eq!(config.local_storage, LocalStorage::None);
        assert_eq!(config.remote_url.as_deref(), Some("https://example.test"));
        assert_eq!(config.max_push_attempts, 3);
        assert!(!config.sync_on_mutation);
    }

    #[test]
    fn test_rejects_garbage() {
        let err = SyncConfig::from_lookup(lookup(&[("TASKSYNC_BACKOFF_MAX_SECS", "soon")]))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                var: "TASKSYNC_BACKOFF_MAX_SECS",
                ..
            }
        ));
        assert!(SyncConfig::from_lookup(lookup(&[("TASKSYNC_MAX_PUSH_ATTEMPTS", "0")])).is_err());
    }

    #[test]
    fn test_deserializes_partial_json() {
        let config: SyncConfig = serde_json::from_str(r#"{"local_storage": "sqlite"}"#).unwrap();
        assert_eq!(config.local_storage, LocalStorage::Sqlite);
        assert_eq!(config.max_push_attempts, 5);
    }
}
