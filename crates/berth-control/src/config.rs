//! Configuration for berth-control.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::Deserialize;

use crate::error::{ControlError, ControlResult};

/// Top-level configuration for the control service.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ControlConfig {
    /// HTTP server configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// Model catalog configuration.
    #[serde(default)]
    pub catalog: CatalogConfig,

    /// Port allocation configuration.
    #[serde(default)]
    pub ports: PortConfig,

    /// Isolated environment provisioning configuration.
    #[serde(default)]
    pub environments: EnvConfig,

    /// Worker deployment configuration.
    #[serde(default)]
    pub deploy: DeployConfig,
}

impl ControlConfig {
    /// Load configuration from the default sources.
    ///
    /// Configuration is loaded in the following order (later sources override earlier):
    /// 1. Default values
    /// 2. `berth.toml` in the current directory (if present)
    /// 3. Environment variables with `BERTH_CONTROL_` prefix
    pub fn load() -> ControlResult<Self> {
        Figment::new()
            .merge(Toml::file("berth.toml"))
            .merge(Env::prefixed("BERTH_CONTROL_").split("__"))
            .extract()
            .map_err(|e| ControlError::Config(e.to_string()))
            .and_then(Self::validated)
    }

    /// Load configuration from a specific TOML file.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> ControlResult<Self> {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("BERTH_CONTROL_").split("__"))
            .extract()
            .map_err(|e| ControlError::Config(e.to_string()))
            .and_then(Self::validated)
    }

    fn validated(self) -> ControlResult<Self> {
        if self.ports.min > self.ports.max {
            return Err(ControlError::Config(format!(
                "invalid port range: {} > {}",
                self.ports.min, self.ports.max
            )));
        }
        if self.deploy.fallback_gpu_count == 0 {
            return Err(ControlError::Config(
                "deploy.fallback_gpu_count must be at least 1".to_owned(),
            ));
        }
        Ok(self)
    }
}

/// HTTP server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address to listen on.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 8020)
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

/// Model catalog configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CatalogConfig {
    /// Path to the models catalog JSON file.
    #[serde(default = "default_catalog_path")]
    pub path: PathBuf,
}

fn default_catalog_path() -> PathBuf {
    PathBuf::from("models_config.json")
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            path: default_catalog_path(),
        }
    }
}

/// Port allocation configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PortConfig {
    /// Lowest port handed out to workers.
    #[serde(default = "default_port_min")]
    pub min: u16,

    /// Highest port handed out to workers.
    #[serde(default = "default_port_max")]
    pub max: u16,

    /// Timeout for the host-occupancy connect probe, in milliseconds.
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
}

const fn default_port_min() -> u16 {
    8001
}

const fn default_port_max() -> u16 {
    9999
}

const fn default_probe_timeout_ms() -> u64 {
    250
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            min: default_port_min(),
            max: default_port_max(),
            probe_timeout_ms: default_probe_timeout_ms(),
        }
    }
}

/// Isolated environment provisioning configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct EnvConfig {
    /// Base directory holding per-model environments.
    #[serde(default = "default_env_base_dir")]
    pub base_dir: PathBuf,

    /// Interpreter used for environment creation.
    #[serde(default = "default_python_bin")]
    pub python_bin: String,

    /// Explicitly versioned interpreter tried when the primary fails.
    #[serde(default = "default_versioned_python_bin")]
    pub versioned_python_bin: String,
}

fn default_env_base_dir() -> PathBuf {
    PathBuf::from("/var/lib/berth/envs")
}

fn default_python_bin() -> String {
    "python3".to_owned()
}

fn default_versioned_python_bin() -> String {
    "python3.10".to_owned()
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            base_dir: default_env_base_dir(),
            python_bin: default_python_bin(),
            versioned_python_bin: default_versioned_python_bin(),
        }
    }
}

/// Worker deployment configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DeployConfig {
    /// Launcher binary for worker processes.
    #[serde(default = "default_launcher")]
    pub launcher: String,

    /// Directory for per-deployment log files.
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,

    /// GPU visibility list size used when GPU-count detection fails.
    #[serde(default = "default_fallback_gpu_count")]
    pub fallback_gpu_count: u32,

    /// Grace period for stopping a worker before forced kill, in seconds.
    #[serde(default = "default_stop_timeout_secs")]
    pub stop_timeout_secs: u64,
}

fn default_launcher() -> String {
    "swift".to_owned()
}

fn default_log_dir() -> PathBuf {
    PathBuf::from(".")
}

const fn default_fallback_gpu_count() -> u32 {
    8
}

const fn default_stop_timeout_secs() -> u64 {
    30
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            launcher: default_launcher(),
            log_dir: default_log_dir(),
            fallback_gpu_count: default_fallback_gpu_count(),
            stop_timeout_secs: default_stop_timeout_secs(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = ControlConfig::default();
        assert_eq!(config.server.listen_addr.port(), 8020);
        assert_eq!(config.ports.min, 8001);
        assert_eq!(config.ports.max, 9999);
        assert_eq!(config.deploy.launcher, "swift");
        assert_eq!(config.deploy.stop_timeout_secs, 30);
        assert!(config.validated().is_ok());
    }

    #[test]
    fn config_from_toml() {
        let toml = r#"
            [server]
            listen_addr = "127.0.0.1:9000"

            [ports]
            min = 18001
            max = 18999

            [deploy]
            launcher = "swift"
            log_dir = "/var/log/berth"
            fallback_gpu_count = 4
        "#;

        let config: ControlConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.server.listen_addr.port(), 9000);
        assert_eq!(config.ports.min, 18001);
        assert_eq!(config.deploy.fallback_gpu_count, 4);
        assert_eq!(config.deploy.log_dir, PathBuf::from("/var/log/berth"));
    }

    #[test]
    fn inverted_port_range_is_rejected() {
        let config = ControlConfig {
            ports: PortConfig {
                min: 9000,
                max: 8000,
                probe_timeout_ms: 100,
            },
            ..ControlConfig::default()
        };
        assert!(config.validated().is_err());
    }
}
