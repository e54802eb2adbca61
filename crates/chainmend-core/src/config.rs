//! Configuration management for chainmend.
//!
//! One TOML file with a section per component. Every section is
//! `#[serde(default)]`, so an empty file is a valid configuration.
//!
//! Resolution order for the file itself:
//! 1. explicit `--config` path
//! 2. `$CHAINMEND_CONFIG`
//! 3. `<config_dir>/chainmend/chainmend.toml` when it exists
//! 4. built-in defaults
//!
//! Environment overrides are layered on top of the file, CLI flags on top of
//! those.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::binlog::BinaryLogConfig;
use crate::error::ConfigError;
use crate::logging::LogConfig;
use crate::remote::RemoteConfig;
use crate::repair::RepairConfig;
use crate::replica::ReplicaConfig;

pub const CONFIG_ENV: &str = "CHAINMEND_CONFIG";
pub const CONFIG_FILE_NAME: &str = "chainmend.toml";

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pretty => write!(f, "pretty"),
            Self::Json => write!(f, "json"),
        }
    }
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown log format: {other} (expected pretty or json)")),
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub replica: ReplicaConfig,
    pub remote: RemoteConfig,
    pub binlog: BinaryLogConfig,
    pub repair: RepairConfig,
    pub logging: LogConfig,
}

impl Config {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|e| ConfigError::ParseFailed(e.to_string()))
    }

    /// Load from a file that must exist.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.display().to_string(), e.to_string()))?;
        Self::from_toml_str(&text)
    }

    /// Resolve the config file and load it, falling back to defaults when
    /// no file is found.
    pub fn load_resolved(
        explicit: Option<&Path>,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(Self, Option<PathBuf>), ConfigError> {
        match resolve_config_path(explicit, &lookup) {
            Some(path) => Ok((Self::load(&path)?, Some(path))),
            None => Ok((Self::default(), None)),
        }
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::SerializeFailed(e.to_string()))
    }

    /// Apply `CHAINMEND_*` overrides read through `lookup`.
    ///
    /// Empty values are ignored.
    pub fn apply_env_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(url) = get("CHAINMEND_NODE_URL") {
            self.remote.node_url = url.trim().to_string();
        }
        if let Some(raw) = get("CHAINMEND_WORKERS") {
            self.repair.workers =
                raw.trim()
                    .parse()
                    .map_err(|_| ConfigError::InvalidOverride {
                        key: "CHAINMEND_WORKERS".to_string(),
                        value: raw.clone(),
                    })?;
        }
        if let Some(dir) = get("CHAINMEND_STATE_CHANGE_DIR") {
            self.binlog.dir = Some(PathBuf::from(dir.trim()));
        }
        if let Some(path) = get("CHAINMEND_REPLICA_PATH") {
            self.replica.path = PathBuf::from(path.trim());
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.remote.validate()?;
        self.binlog.validate()?;
        self.repair.validate()?;
        if self.replica.path.as_os_str().is_empty() {
            return Err(ConfigError::ValidationError(
                "replica.path must be non-empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Locate the config file to load, if any.
pub fn resolve_config_path(
    explicit: Option<&Path>,
    lookup: impl Fn(&str) -> Option<String>,
) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    if let Some(path) = lookup(CONFIG_ENV).filter(|v| !v.trim().is_empty()) {
        return Some(PathBuf::from(path.trim()));
    }
    default_config_path().filter(|path| path.is_file())
}

/// `<config_dir>/chainmend/chainmend.toml`, whether or not it exists.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("chainmend").join(CONFIG_FILE_NAME))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn empty_file_is_default() {
        let config = Config::from_toml_str("").unwrap();
        assert_eq!(config, Config::default());
        config.validate().unwrap();
    }

    #[test]
    fn partial_sections_keep_defaults() {
        let config = Config::from_toml_str(
            r#"
            [remote]
            node_url = "https://node.example:17001"

            [repair]
            workers = 8

            [binlog]
            dir = "/var/lib/node/state-changes"
            layout = "extended"

            [logging]
            format = "json"
            "#,
        )
        .unwrap();

        assert_eq!(config.remote.node_url, "https://node.example:17001");
        assert_eq!(config.remote.timeout_secs, 30);
        assert_eq!(config.repair.workers, 8);
        assert_eq!(config.repair.commit_interval, 10_000);
        assert_eq!(
            config.binlog.dir.as_deref(),
            Some(Path::new("/var/lib/node/state-changes"))
        );
        assert_eq!(config.binlog.layout, crate::binlog::IndexLayout::Extended);
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn malformed_toml_is_parse_error() {
        let err = Config::from_toml_str("[repair\nworkers = ").unwrap_err();
        assert!(matches!(err, ConfigError::ParseFailed(_)));
    }

    #[test]
    fn serialized_config_loads_back() {
        let mut config = Config::default();
        config.repair.workers = 3;
        config.binlog.dir = Some(PathBuf::from("/tmp/log"));
        let text = config.to_toml_string().unwrap();
        assert_eq!(Config::from_toml_str(&text).unwrap(), config);
    }

    #[test]
    fn env_overrides_apply() {
        let mut config = Config::default();
        config
            .apply_env_overrides(env(&[
                ("CHAINMEND_NODE_URL", "http://10.0.0.2:17001"),
                ("CHAINMEND_WORKERS", " 16 "),
                ("CHAINMEND_STATE_CHANGE_DIR", "/data/sc"),
                ("CHAINMEND_REPLICA_PATH", "/data/replica.db"),
            ]))
            .unwrap();
        assert_eq!(config.remote.node_url, "http://10.0.0.2:17001");
        assert_eq!(config.repair.workers, 16);
        assert_eq!(config.binlog.dir, Some(PathBuf::from("/data/sc")));
        assert_eq!(config.replica.path, PathBuf::from("/data/replica.db"));
    }

    #[test]
    fn empty_env_values_are_ignored() {
        let mut config = Config::default();
        config
            .apply_env_overrides(env(&[("CHAINMEND_NODE_URL", "  ")]))
            .unwrap();
        assert_eq!(config.remote.node_url, RemoteConfig::default().node_url);
    }

    #[test]
    fn bad_worker_override_is_rejected() {
        let mut config = Config::default();
        let err = config
            .apply_env_overrides(env(&[("CHAINMEND_WORKERS", "many")]))
            .unwrap_err();
        assert!(
            matches!(err, ConfigError::InvalidOverride { ref key, .. } if key == "CHAINMEND_WORKERS")
        );
    }

    #[test]
    fn validation_rejects_bad_values() {
        let mut config = Config::default();
        config.repair.workers = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.repair.sequential_max = config.repair.parallel_max;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.remote.node_url = String::new();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.repair.commit_interval = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.repair.fetch_window = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn explicit_path_wins_over_env() {
        let lookup = env(&[(CONFIG_ENV, "/from/env.toml")]);
        assert_eq!(
            resolve_config_path(Some(Path::new("/explicit.toml")), &lookup),
            Some(PathBuf::from("/explicit.toml"))
        );
        assert_eq!(
            resolve_config_path(None, &lookup),
            Some(PathBuf::from("/from/env.toml"))
        );
    }

    #[test]
    fn load_missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::load(&dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound(_)));
    }

    #[test]
    fn load_resolved_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chainmend.toml");
        std::fs::write(&path, "[repair]\nworkers = 7\n").unwrap();
        let (config, used) = Config::load_resolved(Some(&path), env(&[])).unwrap();
        assert_eq!(config.repair.workers, 7);
        assert_eq!(used, Some(path));
    }

    #[test]
    fn log_format_parses_case_insensitively() {
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("pretty".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert!("xml".parse::<LogFormat>().is_err());
    }
}
