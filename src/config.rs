use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

const CONFIG_FILE_NAME: &str = "config.toml";

/// Playback-layer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub service: ServiceConfig,
    pub playback: PlaybackConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service: ServiceConfig::default(),
            playback: PlaybackConfig::default(),
        }
    }
}

/// Streaming service endpoints and client registration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// OAuth client id issued by the streaming service
    pub client_id: String,
    /// OAuth client secret (code/refresh exchanges only)
    pub client_secret: String,
    /// Registered redirect URI for interactive grants
    pub redirect_uri: String,
    /// Authorization dialog endpoint
    pub authorize_url: String,
    /// Token exchange endpoint
    pub token_url: String,
    /// REST API base
    pub api_base_url: String,
    /// Scopes requested during interactive login
    pub scope: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: String::new(),
            redirect_uri: "encore://auth-callback".to_string(),
            authorize_url: "https://accounts.spotify.com/authorize".to_string(),
            token_url: "https://accounts.spotify.com/api/token".to_string(),
            api_base_url: "https://api.spotify.com/v1".to_string(),
            scope: "streaming user-read-email user-read-private user-modify-playback-state"
                .to_string(),
        }
    }
}

/// Playback behavior tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Hard timeout for the device connect handshake, in seconds
    pub connect_timeout_secs: u64,
    /// How often the host should poll device progress, in seconds
    pub progress_poll_interval_secs: u64,
    /// Remaining-duration window treated as end of track, in milliseconds
    pub end_of_track_threshold_ms: u64,
    /// Delay between an unplayable-track signal and advancing, in milliseconds
    pub advance_debounce_ms: u64,
    /// Error-message substrings from the play command that are known to fire
    /// even though audio actually starts. Matches are treated as success.
    pub benign_error_markers: Vec<String>,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 15,
            progress_poll_interval_secs: 3,
            end_of_track_threshold_ms: 1500,
            advance_debounce_ms: 750,
            benign_error_markers: vec!["Restriction violated".to_string()],
        }
    }
}

impl Config {
    /// Get the configuration file path
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to get config directory")?
            .join("encore");

        fs::create_dir_all(&config_dir).context("Failed to create config directory")?;

        Ok(config_dir.join(CONFIG_FILE_NAME))
    }

    /// Load configuration from file, or create default if not exists
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;

        if path.exists() {
            let contents = fs::read_to_string(&path).context("Failed to read config file")?;

            let config: Config = toml::from_str(&contents).context("Failed to parse config file")?;

            Ok(config)
        } else {
            let config = Config::default();
            config.save()?;
            Ok(config)
        }
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(&path, contents).context("Failed to write config file")?;

        Ok(())
    }

    /// Generate example config content for documentation
    pub fn example_config() -> String {
        let config = Config::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}
