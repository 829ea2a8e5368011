//! Configuration loading for the collaboration server, editor and CLI.
//!
//! Values come from defaults, then a TOML file, then `COLLAB_` prefixed
//! environment variables.

use std::path::PathBuf;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::{CollaborationError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "config.toml";

/// Directory name under the platform config/data dirs.
const APP_DIR_NAME: &str = "collab";

/// Default database file name.
const DATABASE_FILE_NAME: &str = "documents.db";

/// Default file the CLI keeps its session token in.
const SESSION_FILE_NAME: &str = "session.json";

/// Environment variable prefix.
const ENV_PREFIX: &str = "COLLAB_";

/// Application configuration.
///
/// Precedence, highest first:
/// 1. Environment variables (`COLLAB_SERVER_BIND`, `COLLAB_EDITOR_CONTENT_DEBOUNCE_MS`, ...)
/// 2. TOML config file at `~/.config/collab/config.toml`
/// 3. Default values
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub editor: EditorConfig,
    pub dashboard: DashboardConfig,
    pub auth: AuthConfig,
    pub client: ClientConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the WebSocket server listens on.
    pub bind: String,
}

/// Where documents and accounts are kept.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Path to the SQLite database.
    /// Defaults to `~/.local/share/collab/documents.db`
    pub database_path: Option<PathBuf>,
    /// Keep everything in memory; nothing survives a restart.
    pub in_memory: bool,
}

/// Timing of the editor's debounced writes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EditorConfig {
    pub content_debounce_ms: u64,
    pub title_debounce_ms: u64,
    /// How long "Saved" stays up before going back to idle.
    pub status_clear_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DashboardConfig {
    /// Characters of content shown in a listing preview.
    pub preview_chars: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub min_password_len: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// WebSocket URL of the server.
    pub server_url: String,
    /// Defaults to `~/.local/share/collab/session.json`
    pub session_file: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:9001".to_string(),
        }
    }
}

impl Default for EditorConfig {
    fn default() -> Self {
        Self {
            content_debounce_ms: 600,
            title_debounce_ms: 800,
            status_clear_ms: 1000,
        }
    }
}

impl EditorConfig {
    pub fn content_debounce(&self) -> Duration {
        Duration::from_millis(self.content_debounce_ms)
    }

    pub fn title_debounce(&self) -> Duration {
        Duration::from_millis(self.title_debounce_ms)
    }

    pub fn status_clear(&self) -> Duration {
        Duration::from_millis(self.status_clear_ms)
    }
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self { preview_chars: 60 }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            min_password_len: 6,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:9001".to_string(),
            session_file: None,
        }
    }
}

impl Config {
    /// Load configuration from the default file and the environment.
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// Load configuration with an optional custom config path.
    pub fn load_from(config_path: Option<PathBuf>) -> Result<Self> {
        let config_file = config_path.unwrap_or_else(Self::default_config_path);
        Self::figment(config_file).extract::<Config>()?.validated()
    }

    fn figment(config_file: PathBuf) -> Figment {
        // Only the first underscore separates section from key, so
        // COLLAB_EDITOR_CONTENT_DEBOUNCE_MS lands in editor.content_debounce_ms
        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(config_file))
            .merge(
                Env::prefixed(ENV_PREFIX)
                    .map(|key| key.as_str().replacen('_', ".", 1).into()),
            )
    }

    fn validated(self) -> Result<Self> {
        self.validate()?;
        Ok(self)
    }

    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from(".config"))
            .join(APP_DIR_NAME)
            .join(CONFIG_FILE_NAME)
    }

    pub fn default_data_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from(".local/share"))
            .join(APP_DIR_NAME)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |message: &str| Err(CollaborationError::ConfigError(message.to_string()));

        if self.editor.content_debounce_ms == 0 {
            return invalid("editor.content_debounce_ms must be greater than 0");
        }
        if self.editor.title_debounce_ms == 0 {
            return invalid("editor.title_debounce_ms must be greater than 0");
        }
        if self.dashboard.preview_chars == 0 {
            return invalid("dashboard.preview_chars must be greater than 0");
        }
        if self.auth.min_password_len == 0 {
            return invalid("auth.min_password_len must be at least 1");
        }
        if self.server.bind.trim().is_empty() {
            return invalid("server.bind must not be empty");
        }
        Ok(())
    }

    /// Database path, resolving the default if not set.
    pub fn database_path(&self) -> PathBuf {
        self.storage
            .database_path
            .clone()
            .unwrap_or_else(|| Self::default_data_dir().join(DATABASE_FILE_NAME))
    }

    /// Session file path, resolving the default if not set.
    pub fn session_file(&self) -> PathBuf {
        self.client
            .session_file
            .clone()
            .unwrap_or_else(|| Self::default_data_dir().join(SESSION_FILE_NAME))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.server.bind, "127.0.0.1:9001");
        assert!(!config.storage.in_memory);
        assert_eq!(config.editor.content_debounce(), Duration::from_millis(600));
        assert_eq!(config.editor.title_debounce(), Duration::from_millis(800));
        assert_eq!(config.editor.status_clear(), Duration::from_millis(1000));
        assert_eq!(config.dashboard.preview_chars, 60);
        assert_eq!(config.auth.min_password_len, 6);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_zero_debounce() {
        let mut config = Config::default();
        config.editor.content_debounce_ms = 0;

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("content_debounce_ms"));
    }

    #[test]
    fn test_validate_preview_and_password() {
        let mut config = Config::default();
        config.dashboard.preview_chars = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.auth.min_password_len = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_paths_default_and_custom() {
        let mut config = Config::default();
        assert!(config
            .database_path()
            .to_string_lossy()
            .contains(DATABASE_FILE_NAME));
        assert!(config
            .session_file()
            .to_string_lossy()
            .contains(SESSION_FILE_NAME));

        config.storage.database_path = Some(PathBuf::from("/tmp/custom.db"));
        assert_eq!(config.database_path(), PathBuf::from("/tmp/custom.db"));
    }

    #[test]
    fn test_file_and_env_layers() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "collab.toml",
                r#"
                [server]
                bind = "0.0.0.0:7000"

                [editor]
                title_debounce_ms = 250
                "#,
            )?;
            jail.set_env("COLLAB_EDITOR_CONTENT_DEBOUNCE_MS", "300");
            jail.set_env("COLLAB_SERVER_BIND", "127.0.0.1:7001");

            let config = Config::load_from(Some(PathBuf::from("collab.toml")))
                .map_err(|e| e.to_string())?;
            assert_eq!(config.server.bind, "127.0.0.1:7001");
            assert_eq!(config.editor.content_debounce_ms, 300);
            assert_eq!(config.editor.title_debounce_ms, 250);
            assert_eq!(config.editor.status_clear_ms, 1000);
            Ok(())
        });
    }

    #[test]
    fn test_file_tables_fill_their_sections() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "collab.toml",
                r#"
                [storage]
                in_memory = true

                [client]
                server_url = "ws://docs.example.com:9001"
                "#,
            )?;

            let config = Config::load_from(Some(PathBuf::from("collab.toml")))
                .map_err(|e| e.to_string())?;
            assert!(config.storage.in_memory);
            assert_eq!(config.client.server_url, "ws://docs.example.com:9001");
            assert_eq!(config.server.bind, "127.0.0.1:9001");
            Ok(())
        });
    }

    #[test]
    fn test_invalid_file_value_is_rejected() {
        Jail::expect_with(|jail| {
            jail.create_file("collab.toml", "[dashboard]\npreview_chars = 0\n")?;
            let result = Config::load_from(Some(PathBuf::from("collab.toml")));
            assert!(matches!(result, Err(CollaborationError::ConfigError(_))));
            Ok(())
        });
    }
}
