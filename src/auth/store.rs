use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dirs::config_dir;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use tokio::sync::Mutex;

use super::endpoint::TokenGrant;

const CREDENTIALS_FILE: &str = "credentials.json";
const LOGIN_STATE_FILE: &str = "login_state";

/// OAuth token bundle for the streaming service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenBundle {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    /// Absolute expiry instant, never a duration.
    pub expires_at: DateTime<Utc>,
    /// True when the bundle carries an end-user identity rather than
    /// app-level client credentials.
    pub user_authenticated: bool,
}

impl TokenBundle {
    /// The state a session starts in before any exchange has run.
    pub fn empty() -> Self {
        Self {
            access_token: None,
            refresh_token: None,
            expires_at: DateTime::<Utc>::MIN_UTC,
            user_authenticated: false,
        }
    }

    /// Build a bundle from a token-endpoint grant.
    pub fn from_grant(grant: TokenGrant, user_authenticated: bool) -> Self {
        Self {
            access_token: Some(grant.access_token),
            refresh_token: grant.refresh_token,
            expires_at: Utc::now() + Duration::seconds(grant.expires_in),
            user_authenticated,
        }
    }

    /// Expired, with a 5-minute skew so a token about to lapse is not
    /// handed out for a call that would outlive it. The skew is added on
    /// the clock side; subtracting it from `expires_at` would overflow on
    /// the minimum instant an empty bundle carries.
    pub fn is_expired(&self) -> bool {
        Utc::now() + Duration::minutes(5) >= self.expires_at
    }

    /// Whether the bundle can satisfy a caller right now without a network
    /// exchange.
    pub fn is_usable(&self) -> bool {
        self.access_token.is_some() && !self.is_expired()
    }

    /// A user bundle without a refresh token cannot be rebuilt silently
    /// after a restart; loading one from storage treats it as invalid.
    pub fn reusable_after_restart(&self) -> bool {
        !self.user_authenticated || self.refresh_token.is_some()
    }
}

/// Persistence for the token bundle and the interactive-login state nonce.
#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn load(&self) -> Result<Option<TokenBundle>>;
    async fn save(&self, bundle: &TokenBundle) -> Result<()>;
    async fn clear(&self) -> Result<()>;

    /// CSRF `state` nonce persisted across the redirect round trip.
    async fn load_login_state(&self) -> Result<Option<String>>;
    async fn save_login_state(&self, state: &str) -> Result<()>;
    async fn clear_login_state(&self) -> Result<()>;
}

/// JSON-file store under the platform config directory.
pub struct FileTokenStore {
    dir: PathBuf,
}

impl FileTokenStore {
    pub fn new() -> Result<Self> {
        let mut dir = config_dir().ok_or_else(|| anyhow!("Could not find config directory"))?;
        dir.push("encore");
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Store rooted at an explicit directory.
    pub fn at(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn credentials_path(&self) -> PathBuf {
        self.dir.join(CREDENTIALS_FILE)
    }

    fn login_state_path(&self) -> PathBuf {
        self.dir.join(LOGIN_STATE_FILE)
    }
}

#[async_trait]
impl TokenStore for FileTokenStore {
    async fn load(&self) -> Result<Option<TokenBundle>> {
        let path = self.credentials_path();
        if !path.exists() {
            return Ok(None);
        }

        let contents = fs::read_to_string(&path).context("Failed to read saved credentials")?;
        let bundle: TokenBundle =
            serde_json::from_str(&contents).context("Failed to parse saved credentials")?;
        Ok(Some(bundle))
    }

    async fn save(&self, bundle: &TokenBundle) -> Result<()> {
        let contents = serde_json::to_string_pretty(bundle)?;
        fs::write(self.credentials_path(), contents).context("Failed to write credentials")?;
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        let path = self.credentials_path();
        if path.exists() {
            fs::remove_file(&path).context("Failed to remove saved credentials")?;
        }
        Ok(())
    }

    async fn load_login_state(&self) -> Result<Option<String>> {
        let path = self.login_state_path();
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(fs::read_to_string(&path)?.trim().to_string()))
    }

    async fn save_login_state(&self, state: &str) -> Result<()> {
        fs::write(self.login_state_path(), state).context("Failed to write login state")?;
        Ok(())
    }

    async fn clear_login_state(&self) -> Result<()> {
        let path = self.login_state_path();
        if path.exists() {
            fs::remove_file(&path)?;
        }
        Ok(())
    }
}

/// In-memory store for tests and ephemeral sessions.
#[derive(Default)]
pub struct MemoryTokenStore {
    bundle: Mutex<Option<TokenBundle>>,
    login_state: Mutex<Option<String>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TokenStore for MemoryTokenStore {
    async fn load(&self) -> Result<Option<TokenBundle>> {
        Ok(self.bundle.lock().await.clone())
    }

    async fn save(&self, bundle: &TokenBundle) -> Result<()> {
        *self.bundle.lock().await = Some(bundle.clone());
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        *self.bundle.lock().await = None;
        Ok(())
    }

    async fn load_login_state(&self) -> Result<Option<String>> {
        Ok(self.login_state.lock().await.clone())
    }

    async fn save_login_state(&self, state: &str) -> Result<()> {
        *self.login_state.lock().await = Some(state.to_string());
        Ok(())
    }

    async fn clear_login_state(&self) -> Result<()> {
        *self.login_state.lock().await = None;
        Ok(())
    }
}
