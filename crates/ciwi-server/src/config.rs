//! Server configuration.
//!
//! Sources, lowest precedence first: built-in defaults, the optional
//! `ciwi-server.yaml` file, `CIWI_SERVER_*` environment variables, and
//! command-line flags.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_FILE: &str = "ciwi-server.yaml";
pub const ENV_PREFIX: &str = "CIWI_SERVER";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address the HTTP server listens on.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// Root for the database and artifact files.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Defaults to `<data_dir>/ciwi.db`.
    #[serde(default)]
    pub database_path: Option<PathBuf>,
    /// Defaults to `<data_dir>/artifacts`.
    #[serde(default)]
    pub artifacts_dir: Option<PathBuf>,
    /// Root that `/config/load` paths are resolved against.
    #[serde(default = "default_config_dir")]
    pub config_dir: PathBuf,
    #[serde(default)]
    pub log_format: LogFormat,
    /// Name reported by `/server-info`.
    #[serde(default = "default_name")]
    pub name: String,
}

fn default_bind_addr() -> String {
    "0.0.0.0:8112".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("ciwi-data")
}

fn default_config_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_name() -> String {
    "ciwi".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            data_dir: default_data_dir(),
            database_path: None,
            artifacts_dir: None,
            config_dir: default_config_dir(),
            log_format: LogFormat::default(),
            name: default_name(),
        }
    }
}

/// Values given on the command line.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub bind_addr: Option<String>,
    pub data_dir: Option<PathBuf>,
    pub config_dir: Option<PathBuf>,
    pub log_format: Option<LogFormat>,
}

impl ServerConfig {
    /// Load from `file` (required only when given explicitly) and the
    /// environment, then apply `overrides`.
    pub fn load(file: Option<&Path>, overrides: Overrides) -> Result<Self, config::ConfigError> {
        let (path, required) = match file {
            Some(path) => (path.to_path_buf(), true),
            None => (PathBuf::from(DEFAULT_CONFIG_FILE), false),
        };
        let loaded: ServerConfig = config::Config::builder()
            .add_source(config::File::from(path).required(required))
            .add_source(config::Environment::with_prefix(ENV_PREFIX))
            .build()?
            .try_deserialize()?;
        Ok(loaded.with_overrides(overrides))
    }

    fn with_overrides(mut self, overrides: Overrides) -> Self {
        if let Some(bind_addr) = overrides.bind_addr {
            self.bind_addr = bind_addr;
        }
        if let Some(data_dir) = overrides.data_dir {
            self.data_dir = data_dir;
        }
        if let Some(config_dir) = overrides.config_dir {
            self.config_dir = config_dir;
        }
        if let Some(log_format) = overrides.log_format {
            self.log_format = log_format;
        }
        self
    }

    pub fn database_path(&self) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("ciwi.db"))
    }

    pub fn artifacts_dir(&self) -> PathBuf {
        self.artifacts_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("artifacts"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "0.0.0.0:8112");
        assert_eq!(config.database_path(), PathBuf::from("ciwi-data/ciwi.db"));
        assert_eq!(config.artifacts_dir(), PathBuf::from("ciwi-data/artifacts"));
    }

    #[test]
    fn test_file_then_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.yaml");
        std::fs::write(
            &path,
            "bind_addr: 127.0.0.1:9000\ndata_dir: /var/lib/ciwi\nlog_format: json\n",
        )
        .unwrap();

        let config = ServerConfig::load(Some(&path), Overrides::default()).unwrap();
        assert_eq!(config.bind_addr, "127.0.0.1:9000");
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.database_path(), PathBuf::from("/var/lib/ciwi/ciwi.db"));
        assert_eq!(config.name, "ciwi");

        let config = ServerConfig::load(
            Some(&path),
            Overrides {
                bind_addr: Some("127.0.0.1:9100".into()),
                log_format: Some(LogFormat::Text),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(config.bind_addr, "127.0.0.1:9100");
        assert_eq!(config.log_format, LogFormat::Text);
    }

    #[test]
    fn test_missing_explicit_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.yaml");
        assert!(ServerConfig::load(Some(&missing), Overrides::default()).is_err());
    }
}
