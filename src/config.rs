//! Server configuration: TOML file, then environment overrides.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::conn::WsConfig;

const ENV_PREFIX: &str = "SARHUB_";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: Box<toml::de::Error>,
    },
    #[error("invalid config: {reason}")]
    Invalid { reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Address the server listens on, `host:port`.
    pub listen_addr: String,
    /// Append-only mutation log backing the shared state.
    pub state_file: PathBuf,
    /// Capacity of the shared mutation fan-in channel.
    pub mutation_buffer: usize,
    pub ping_interval_ms: u64,
    pub connection_timeout_ms: u64,
    /// Per-connection outbound/inbound frame queue sizes.
    pub send_queue: usize,
    pub recv_queue: usize,
    pub max_ws_payload: usize,
    /// Optional filter rules applied to what gets recorded in the log.
    pub log_filter: Vec<String>,
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:4850".to_string(),
            state_file: PathBuf::from("sarhub.mutlog"),
            mutation_buffer: 64,
            ping_interval_ms: 15_000,
            connection_timeout_ms: 45_000,
            send_queue: 16,
            recv_queue: 16,
            max_ws_payload: 1024 * 1024,
            log_filter: Vec::new(),
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub stdout: bool,
    /// Optional `tracing` filter directive overriding the verbosity flag.
    pub filter: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            stdout: true,
            filter: None,
        }
    }
}

impl Config {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn ws_config(&self) -> WsConfig {
        WsConfig {
            ping_interval: self.ping_interval(),
            timeout: self.connection_timeout(),
            send_queue: self.send_queue,
            recv_queue: self.recv_queue,
            max_payload: self.max_ws_payload,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: &str| {
            Err(ConfigError::Invalid {
                reason: reason.to_string(),
            })
        };

        if self.listen_addr.is_empty() {
            return invalid("listen_addr must not be empty");
        }
        if self.mutation_buffer == 0 {
            return invalid("mutation_buffer must be > 0");
        }
        if self.ping_interval_ms == 0 {
            return invalid("ping_interval_ms must be > 0");
        }
        if self.connection_timeout_ms == 0 {
            return invalid("connection_timeout_ms must be > 0");
        }
        if self.send_queue == 0 || self.recv_queue == 0 {
            return invalid("queue sizes must be > 0");
        }
        Ok(())
    }

    /// Load from a TOML file, apply environment overrides, and validate.
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let display = path.display().to_string();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: display.clone(),
            source,
        })?;
        let mut config: Config = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: display,
            source: Box::new(source),
        })?;
        apply_env_overrides(&mut config);
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides when no file is given.
    pub fn load_or_default(path: Option<&Path>) -> Result<Config, ConfigError> {
        match path {
            Some(path) => Self::load(path),
            None => {
                let mut config = Config::default();
                apply_env_overrides(&mut config);
                config.validate()?;
                Ok(config)
            }
        }
    }
}

pub fn apply_env_overrides(config: &mut Config) {
    apply_overrides_from(config, |name| std::env::var(format!("{ENV_PREFIX}{name}")).ok());
}

fn apply_overrides_from(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(addr) = lookup("LISTEN_ADDR") {
        config.listen_addr = addr;
    }
    if let Some(path) = lookup("STATE_FILE") {
        config.state_file = PathBuf::from(path);
    }
    if let Some(filter) = lookup("LOG_FILTER") {
        config.log_filter = filter
            .split(',')
            .map(str::trim)
            .filter(|rule| !rule.is_empty())
            .map(str::to_string)
            .collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn parses_a_toml_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "listen_addr = \"0.0.0.0:9000\"\n\
             state_file = \"/var/lib/sarhub/state.mutlog\"\n\
             ping_interval_ms = 5000\n\
             log_filter = [\"!incidents/**\"]\n\
             [logging]\n\
             stdout = false\n",
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.listen_addr, "0.0.0.0:9000");
        assert_eq!(config.ping_interval(), Duration::from_secs(5));
        assert_eq!(config.log_filter, ["!incidents/**"]);
        assert!(!config.logging.stdout);
        // Unspecified fields keep their defaults.
        assert_eq!(config.mutation_buffer, 64);
    }

    #[test]
    fn env_overrides_win() {
        let mut config = Config::default();
        apply_overrides_from(&mut config, |name| match name {
            "LISTEN_ADDR" => Some("10.0.0.1:1234".to_string()),
            "LOG_FILTER" => Some("/a, !/a/b".to_string()),
            _ => None,
        });

        assert_eq!(config.listen_addr, "10.0.0.1:1234");
        assert_eq!(config.log_filter, ["/a", "!/a/b"]);
    }

    #[test]
    fn zero_durations_are_rejected() {
        let mut config = Config::default();
        config.ping_interval_ms = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { .. })
        ));

        let mut config = Config::default();
        config.connection_timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let err = Config::load(Path::new("/nonexistent/sarhub.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
