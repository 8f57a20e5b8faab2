//! TOML-loadable daemon configuration (SPEC_FULL.md §A.3), following the
//! same `serde` + `thiserror` load pattern used for the onyx/obsidian
//! engine configs.

use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

use crate::params::DEFAULT_MIN_PERIODS;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Root configuration for a dspd-compatible server process.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub socket_path: String,
    pub shm_dir: String,
    pub max_clients: usize,
    pub ring: RingConfig,
    pub log: LogConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        DaemonConfig {
            socket_path: "/run/dspd/socket".to_string(),
            shm_dir: "/dev/shm/dspd".to_string(),
            max_clients: 64,
            ring: RingConfig::default(),
            log: LogConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RingConfig {
    pub min_periods: u32,
    pub default_buffer_frames: u32,
}

impl Default for RingConfig {
    fn default() -> Self {
        RingConfig {
            min_periods: DEFAULT_MIN_PERIODS,
            default_buffer_frames: 4096,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// `tracing_subscriber::EnvFilter` directive string, e.g. "info" or
    /// "dspd_pcm=debug,dspd_transport=trace".
    pub filter: String,
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            filter: "info".to_string(),
            json: false,
        }
    }
}

impl DaemonConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Ok(toml::from_str(&text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_self_consistent() {
        let cfg = DaemonConfig::default();
        assert_eq!(cfg.max_clients, 64);
        assert_eq!(cfg.ring.min_periods, DEFAULT_MIN_PERIODS);
    }

    #[test]
    fn parses_partial_toml_over_defaults() {
        let cfg: DaemonConfig = toml::from_str("max_clients = 8\n[log]\nfilter = \"debug\"\n")
            .expect("valid toml");
        assert_eq!(cfg.max_clients, 8);
        assert_eq!(cfg.log.filter, "debug");
        assert_eq!(cfg.socket_path, "/run/dspd/socket");
    }

    #[test]
    fn missing_file_is_read_error() {
        let err = DaemonConfig::load("/nonexistent/dspd.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
