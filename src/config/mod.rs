//! Relay configuration.
//!
//! Loaded from YAML files and environment variables into a single
//! [`RelaySettings`] struct.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::bus::{RedisConfig, BROADCAST_IDENTITY, DEFAULT_CHANNEL_PREFIX};
use crate::peers::PeerRegistry;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "relay.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "ARENA_RELAY_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "ARENA_RELAY";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "ARENA_RELAY_LOG";

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{0}': {1}")]
    FileRead(String, String),

    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl From<::config::ConfigError> for ConfigError {
    fn from(e: ::config::ConfigError) -> Self {
        ConfigError::Parse(e.to_string())
    }
}

/// Top-level relay configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelaySettings {
    /// Connect to the bus at all. Off unless configured.
    pub enabled: bool,
    /// This process publishes instead of listening.
    pub master: bool,
    /// Identity of this process; also its channel suffix.
    pub server_name: String,
    /// Prepended to every identity to form a channel name.
    pub channel_prefix: String,
    /// Followers also listen on the shared broadcast channel.
    pub listen_broadcast: bool,
    pub redis: RedisConfig,
    /// Servers a master publishes to, in configuration order.
    ///
    /// Read from the YAML text of each file directly so identities keep
    /// their case; not settable from the environment.
    #[serde(skip_deserializing)]
    pub peers: PeerRegistry,
}

/// The `peers` section of one configuration file.
#[derive(Deserialize)]
struct PeersSection {
    #[serde(default)]
    peers: Option<PeerRegistry>,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            enabled: false,
            master: false,
            server_name: String::new(),
            channel_prefix: DEFAULT_CHANNEL_PREFIX.to_string(),
            listen_broadcast: false,
            redis: RedisConfig::default(),
            peers: PeerRegistry::default(),
        }
    }
}

impl RelaySettings {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `relay.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    ///
    /// The `peers` section is taken whole from the last file that has one.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut files = vec![DEFAULT_CONFIG_FILE.to_string()];
        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
            files.push(config_path.to_string());
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
            files.push(config_path);
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let mut settings: RelaySettings = config.try_deserialize()?;

        // `config` lowercases map keys, which would rename peers.
        for file in files.iter().filter_map(|name| resolve_file(name)) {
            let content = std::fs::read_to_string(&file)
                .map_err(|e| ConfigError::FileRead(file.display().to_string(), e.to_string()))?;
            if let Some(peers) = peers_section(&content)? {
                settings.peers = peers;
            }
        }

        Ok(settings)
    }

    /// Load configuration from a single YAML file, without environment overrides.
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::FileRead(path.to_string(), e.to_string()))?;

        let mut settings: RelaySettings =
            serde_yaml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        if let Some(peers) = peers_section(&content)? {
            settings.peers = peers;
        }
        Ok(settings)
    }

    /// Check invariants the deserializer cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.enabled {
            return Ok(());
        }

        let name = self.server_name.trim();
        if name.is_empty() {
            return Err(ConfigError::Invalid(
                "server_name must be set when the relay is enabled".to_string(),
            ));
        }
        if name == BROADCAST_IDENTITY {
            return Err(ConfigError::Invalid(format!(
                "server_name '{}' is reserved",
                BROADCAST_IDENTITY
            )));
        }
        if self.redis.port == 0 {
            return Err(ConfigError::Invalid("redis.port must be non-zero".to_string()));
        }
        Ok(())
    }
}

/// Find a file the way `config` does: as given, then with a YAML extension.
fn resolve_file(name: &str) -> Option<PathBuf> {
    let path = Path::new(name);
    if path.is_file() {
        return Some(path.to_path_buf());
    }
    ["yaml", "yml"]
        .iter()
        .map(|ext| path.with_extension(ext))
        .find(|candidate| candidate.is_file())
}

fn peers_section(content: &str) -> Result<Option<PeerRegistry>, ConfigError> {
    if content.trim().is_empty() {
        return Ok(None);
    }
    let section: PeersSection =
        serde_yaml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
    Ok(section.peers)
}
