//! Configuration loading and management

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Main configuration for the daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Address the WebSocket listener binds to
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Time a session may stay unauthenticated, in seconds
    #[serde(default = "default_session_timeout")]
    pub session_timeout_secs: u64,

    /// Outbound inactivity before a keepalive is sent, in seconds
    #[serde(default = "default_keepalive")]
    pub keepalive_secs: u64,

    /// Watcher quiescence window in milliseconds
    #[serde(default = "default_quiescence")]
    pub quiescence_millis: u64,

    /// Directories served to peers
    #[serde(default)]
    pub contexts: Vec<ContextConfig>,

    /// User directory file, relative to the config directory unless absolute
    #[serde(default = "default_users_file")]
    pub users_file: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    pub id: String,
    pub path: PathBuf,
}

fn default_listen() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_session_timeout() -> u64 {
    60
}

fn default_keepalive() -> u64 {
    40
}

fn default_quiescence() -> u64 {
    200
}

fn default_users_file() -> String {
    "users.json".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            session_timeout_secs: default_session_timeout(),
            keepalive_secs: default_keepalive(),
            quiescence_millis: default_quiescence(),
            contexts: Vec::new(),
            users_file: default_users_file(),
        }
    }
}

impl Config {
    /// Load configuration from the config directory
    pub fn load(config_path: &Path) -> Result<Self> {
        let config_file = config_path.join("config.json");

        if config_file.exists() {
            let content = std::fs::read_to_string(&config_file)
                .with_context(|| format!("Failed to read config file: {:?}", config_file))?;
            let config: Config = serde_json::from_str(&content)
                .with_context(|| "Failed to parse config.json")?;
            tracing::info!("Loaded configuration from {:?}", config_file);
            Ok(config)
        } else {
            tracing::info!("No config file found at {:?}, using defaults", config_file);
            let config = Config::default();

            std::fs::create_dir_all(config_path)
                .with_context(|| format!("Failed to create config directory: {:?}", config_path))?;

            // Write default config for reference
            let content = serde_json::to_string_pretty(&config)?;
            std::fs::write(&config_file, content)
                .with_context(|| format!("Failed to write default config: {:?}", config_file))?;
            tracing::info!("Created default config at {:?}", config_file);

            Ok(config)
        }
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }

    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }

    pub fn quiescence(&self) -> Duration {
        Duration::from_millis(self.quiescence_millis)
    }

    /// Resolve the users file against the config directory.
    pub fn users_path(&self, config_path: &Path) -> PathBuf {
        let path = Path::new(&self.users_file);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            config_path.join(path)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_config_writes_defaults() {
        let temp = TempDir::new().unwrap();

        let config = Config::load(temp.path()).unwrap();

        assert_eq!(config.session_timeout(), Duration::from_secs(60));
        assert_eq!(config.keepalive(), Duration::from_secs(40));
        assert_eq!(config.quiescence(), Duration::from_millis(200));
        assert!(temp.path().join("config.json").exists());
    }

    #[test]
    fn test_partial_config_uses_field_defaults() {
        let temp = TempDir::new().unwrap();
        std::fs::write(
            temp.path().join("config.json"),
            r#"{"contexts": [{"id": "web", "path": "/srv/web"}], "users_file": "/etc/admin/users.json"}"#,
        )
        .unwrap();

        let config = Config::load(temp.path()).unwrap();

        assert_eq!(config.listen, "127.0.0.1:8080");
        assert_eq!(config.contexts[0].id, "web");
        assert_eq!(
            config.users_path(temp.path()),
            PathBuf::from("/etc/admin/users.json")
        );
    }
}
