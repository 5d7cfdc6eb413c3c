//! Daemon configuration handling.

use anyhow::{Context, Result};
use directories::ProjectDirs;
use keyward_core::{HttpClientConfig, ServiceConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Contents of `daemon.toml`.
///
/// ```toml
/// callback_url = "https://app.example.com/keyring"
/// log_level = "debug"
///
/// [http]
/// timeout_secs = 10
///
/// [[services]]
/// name = "pinboard"
/// flow = "basic"
///
/// [services.endpoints.verify]
/// url = "https://api.pinboard.in/v1/posts/update"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Path to the Unix socket.
    pub socket_path: PathBuf,

    /// Path to the configuration file that was loaded.
    #[serde(skip)]
    pub config_path: PathBuf,

    /// Directory holding `tokens.json`.
    pub data_dir: PathBuf,

    /// Logging level, used when `RUST_LOG` is unset.
    pub log_level: String,

    /// Host URL that receives `request`, `verify`, `created`, `delete` and
    /// `manage` actions.
    pub callback_url: String,

    /// Outgoing HTTP settings.
    pub http: HttpClientConfig,

    /// Keep secrets in the OS keyring when one is available.
    pub prefer_keyring: bool,

    /// Register the built-in presets after the configured services.
    pub presets: bool,

    /// Request tokens older than this are pruned.
    pub request_token_ttl_secs: u64,

    /// Service definitions. Earlier entries win over later ones and over
    /// presets with the same name.
    pub services: Vec<ServiceConfig>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        let dirs = project_dirs();
        let data_dir = dirs
            .as_ref()
            .map(|d| d.data_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from(".keyward"));

        let socket_path = dirs
            .as_ref()
            .map(|d| d.runtime_dir().unwrap_or(d.data_dir()).join("keyward.sock"))
            .unwrap_or_else(|| PathBuf::from("/tmp/keyward.sock"));

        Self {
            socket_path,
            config_path: PathBuf::new(),
            data_dir,
            log_level: "info".to_string(),
            callback_url: "http://localhost:8080/keyring".to_string(),
            http: HttpClientConfig::default(),
            prefer_keyring: true,
            presets: true,
            request_token_ttl_secs: 3600,
            services: Vec::new(),
        }
    }
}

impl DaemonConfig {
    /// Path of the token file.
    pub fn tokens_path(&self) -> PathBuf {
        self.data_dir.join("tokens.json")
    }
}

/// Default location of `daemon.toml`.
pub fn default_config_path() -> PathBuf {
    project_dirs()
        .map(|d| d.config_dir().join("daemon.toml"))
        .unwrap_or_else(|| PathBuf::from("keyward-daemon.toml"))
}

/// Load configuration from the default location or create defaults.
pub fn load_config() -> Result<DaemonConfig> {
    load_config_from(&default_config_path())
}

/// Load configuration from `config_path`, falling back to defaults when the
/// file does not exist.
pub fn load_config_from(config_path: &Path) -> Result<DaemonConfig> {
    let mut config = if config_path.exists() {
        let contents = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config from {:?}", config_path))?;
        toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config from {:?}", config_path))?
    } else {
        DaemonConfig::default()
    };

    config.config_path = config_path.to_path_buf();

    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("Failed to create data directory {:?}", config.data_dir))?;

    Ok(config)
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("com", "raibid-labs", "keyward")
}
