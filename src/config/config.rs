//! Configuration structures and loading.
//!
//! The daemon reads a JSON configuration file (the format the on-disk
//! config doc in the external interfaces names) and layers CLI overrides
//! on top. Every path is resolved to an absolute path under the base
//! directory before the rest of the daemon ever sees it.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Top-level daemon configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Configuration {
    /// Enable debug-level logging regardless of `RUST_LOG`.
    #[serde(default)]
    pub debug: bool,

    /// Unix socket configuration.
    #[serde(default)]
    pub api: ApiConfiguration,

    /// On-disk layout under the base directory.
    #[serde(default)]
    pub system: SystemConfiguration,

    /// Runtime Adapter configuration (the out-of-scope VM framework's
    /// entry points, passed through unopened).
    #[serde(default)]
    pub runtime: RuntimeConfiguration,

    /// Network control-plane configuration.
    #[serde(default)]
    pub network: NetworkConfiguration,
}

impl Configuration {
    /// Load configuration from a JSON file, falling back to defaults for
    /// any field the file omits. Missing files are not an error — the
    /// daemon runs with defaults rooted at `~/.arca`.
    pub fn load(path: &str) -> Result<Self> {
        let config_path = std::path::Path::new(path);

        let mut config: Configuration = if config_path.exists() {
            let content = std::fs::read_to_string(config_path)
                .with_context(|| format!("failed to read config file: {}", path))?;
            serde_json::from_str(&content)
                .with_context(|| "failed to parse configuration".to_string())?
        } else {
            Configuration::default()
        };

        let base_dir = config
            .system
            .base_directory
            .clone()
            .unwrap_or_else(default_base_directory);

        config.system.resolve_paths(&base_dir);

        std::fs::create_dir_all(&config.system.base_directory())?;
        std::fs::create_dir_all(config.system.layers_directory())?;
        std::fs::create_dir_all(config.system.containers_directory())?;

        if let Some(parent) = config.api.socket_path().parent() {
            std::fs::create_dir_all(parent)?;
        }

        Ok(config)
    }
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            debug: false,
            api: ApiConfiguration::default(),
            system: SystemConfiguration::default(),
            runtime: RuntimeConfiguration::default(),
            network: NetworkConfiguration::default(),
        }
    }
}

/// Unix socket the HTTP router listens on.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfiguration {
    /// Socket path. Relative paths are resolved against the base directory.
    #[serde(default)]
    pub socket_path: Option<PathBuf>,
}

impl Default for ApiConfiguration {
    fn default() -> Self {
        Self { socket_path: None }
    }
}

impl ApiConfiguration {
    pub fn socket_path(&self) -> PathBuf {
        self.socket_path
            .clone()
            .unwrap_or_else(|| default_base_directory().join("arca.sock"))
    }
}

/// On-disk layout: `state.db`, `layers/`, `containers/`, `arca.sock`.
#[derive(Debug, Clone, Deserialize)]
pub struct SystemConfiguration {
    /// Base directory everything else nests under. Defaults to `~/.arca`.
    #[serde(default)]
    pub base_directory: Option<PathBuf>,

    /// Logging verbosity (`error`, `warn`, `info`, `debug`, `trace`).
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for SystemConfiguration {
    fn default() -> Self {
        Self {
            base_directory: None,
            log_level: default_log_level(),
        }
    }
}

impl SystemConfiguration {
    fn resolve_paths(&mut self, base_dir: &PathBuf) {
        self.base_directory = Some(base_dir.clone());
    }

    pub fn base_directory(&self) -> PathBuf {
        self.base_directory.clone().unwrap_or_else(default_base_directory)
    }

    pub fn state_db_path(&self) -> PathBuf {
        self.base_directory().join("state.db")
    }

    pub fn layers_directory(&self) -> PathBuf {
        self.base_directory().join("layers")
    }

    pub fn containers_directory(&self) -> PathBuf {
        self.base_directory().join("containers")
    }
}

fn default_base_directory() -> PathBuf {
    let home = std::env::var_os("HOME").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("."));
    home.join(".arca")
}

fn default_log_level() -> String {
    "info".into()
}

/// Passed through to the out-of-scope VM runtime without interpretation.
#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeConfiguration {
    /// Path to the guest kernel image handed to the VM runtime's `createVM`.
    #[serde(default)]
    pub kernel_path: Option<PathBuf>,
}

impl Default for RuntimeConfiguration {
    fn default() -> Self {
        Self { kernel_path: None }
    }
}

/// Network backend selection, per the on-disk config doc's recognized
/// options.
#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfiguration {
    /// Which Network Controller backend to construct: "bridge" (the
    /// full-featured control-plane-agent backend) or "nat" (the reduced
    /// host-native backend described in §9's pluggability note).
    #[serde(default = "default_network_backend")]
    pub backend: String,

    /// Control-plane RPC deadline, in seconds.
    #[serde(default = "default_control_plane_timeout")]
    pub control_plane_timeout_secs: u64,
}

impl Default for NetworkConfiguration {
    fn default() -> Self {
        Self {
            backend: default_network_backend(),
            control_plane_timeout_secs: default_control_plane_timeout(),
        }
    }
}

fn default_network_backend() -> String {
    "bridge".into()
}

fn default_control_plane_timeout() -> u64 {
    10
}
