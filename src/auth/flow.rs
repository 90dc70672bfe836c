use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use rand::{distributions::Alphanumeric, Rng};
use tokio::sync::Mutex;

use super::endpoint::TokenEndpoint;
use super::store::{TokenBundle, TokenStore};
use crate::config::ServiceConfig;

/// What came back through the registered redirect URI.
#[derive(Debug, Clone)]
pub enum AuthorizationReply {
    /// Authorization-code redirect: one-time code plus echoed state nonce.
    Code { code: String, state: Option<String> },
    /// Implicit redirect: a short-lived token delivered in the fragment.
    Token {
        access_token: String,
        expires_in: i64,
        state: Option<String>,
    },
}

/// Drives the platform's authorization dialog (popup, browser tab, or
/// in-app web view) for a given URL. Resolves with `None` when the user
/// dismisses the dialog without completing it.
#[async_trait]
pub trait AuthPrompt: Send + Sync {
    async fn authorize(&self, url: &str) -> Result<Option<AuthorizationReply>>;
}

/// One platform variant of the interactive user-identity grant.
#[async_trait]
pub trait LoginFlow: Send + Sync {
    /// Run the interactive grant. `Ok(None)` means the user backed out.
    async fn login(&self) -> Result<Option<TokenBundle>>;

    /// Rebuild a lapsed user bundle. The authorization-code variant uses the
    /// stored refresh token; the implicit variant has nothing to refresh
    /// with and repeats the dialog.
    async fn renew(&self, current: &TokenBundle) -> Result<Option<TokenBundle>>;
}

fn new_state_nonce() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(char::from)
        .collect()
}

fn authorize_url(service: &ServiceConfig, response_type: &str, state: &str) -> String {
    format!(
        "{}?client_id={}&response_type={}&redirect_uri={}&scope={}&state={}",
        service.authorize_url,
        urlencoding::encode(&service.client_id),
        response_type,
        urlencoding::encode(&service.redirect_uri),
        urlencoding::encode(&service.scope),
        state,
    )
}

/// Native variant: authorization-code grant with a secure-storage refresh
/// token, so later expiries never need another dialog.
pub struct AuthCodeFlow {
    endpoint: Arc<dyn TokenEndpoint>,
    prompt: Arc<dyn AuthPrompt>,
    service: ServiceConfig,
    /// Nonce for the dialog currently on screen. The code flow completes in
    /// one process lifetime, so memory is enough.
    pending_state: Mutex<Option<String>>,
}

impl AuthCodeFlow {
    pub fn new(
        endpoint: Arc<dyn TokenEndpoint>,
        prompt: Arc<dyn AuthPrompt>,
        service: ServiceConfig,
    ) -> Self {
        Self {
            endpoint,
            prompt,
            service,
            pending_state: Mutex::new(None),
        }
    }
}

#[async_trait]
impl LoginFlow for AuthCodeFlow {
    async fn login(&self) -> Result<Option<TokenBundle>> {
        let state = new_state_nonce();
        *self.pending_state.lock().await = Some(state.clone());

        let url = authorize_url(&self.service, "code", &state);
        let reply = self.prompt.authorize(&url).await?;
        let expected = self.pending_state.lock().await.take();

        match reply {
            None => Ok(None),
            Some(AuthorizationReply::Code { code, state }) => {
                if state != expected {
                    return Err(anyhow!("Authorization state nonce mismatch"));
                }
                let grant = self.endpoint.exchange_code(&code).await?;
                if grant.refresh_token.is_none() {
                    return Err(anyhow!("Code exchange returned no refresh token"));
                }
                Ok(Some(TokenBundle::from_grant(grant, true)))
            }
            Some(AuthorizationReply::Token { .. }) => {
                Err(anyhow!("Unexpected implicit reply on the code flow"))
            }
        }
    }

    async fn renew(&self, current: &TokenBundle) -> Result<Option<TokenBundle>> {
        let refresh_token = current
            .refresh_token
            .as_deref()
            .ok_or_else(|| anyhow!("No refresh token to renew with"))?;

        let mut grant = self.endpoint.refresh(refresh_token).await?;
        // The endpoint may rotate the refresh token; keep the old one when
        // it does not.
        if grant.refresh_token.is_none() {
            grant.refresh_token = current.refresh_token.clone();
        }
        Ok(Some(TokenBundle::from_grant(grant, true)))
    }
}

/// Web variant: implicit grant. The token arrives in the redirect fragment,
/// there is no refresh token, and the state nonce is persisted through the
/// store because the redirect may land in a fresh page load.
pub struct ImplicitFlow {
    prompt: Arc<dyn AuthPrompt>,
    store: Arc<dyn TokenStore>,
    service: ServiceConfig,
}

impl ImplicitFlow {
    pub fn new(
        prompt: Arc<dyn AuthPrompt>,
        store: Arc<dyn TokenStore>,
        service: ServiceConfig,
    ) -> Self {
        Self {
            prompt,
            store,
            service,
        }
    }

    async fn run_dialog(&self) -> Result<Option<TokenBundle>> {
        let state = new_state_nonce();
        self.store.save_login_state(&state).await?;

        let url = authorize_url(&self.service, "token", &state);
        let reply = self.prompt.authorize(&url).await?;

        let expected = self.store.load_login_state().await?;
        self.store.clear_login_state().await?;

        match reply {
            None => Ok(None),
            Some(AuthorizationReply::Token {
                access_token,
                expires_in,
                state,
            }) => {
                if state != expected {
                    return Err(anyhow!("Authorization state nonce mismatch"));
                }
                Ok(Some(TokenBundle::from_grant(
                    super::endpoint::TokenGrant {
                        access_token,
                        refresh_token: None,
                        expires_in,
                    },
                    true,
                )))
            }
            Some(AuthorizationReply::Code { .. }) => {
                Err(anyhow!("Unexpected code reply on the implicit flow"))
            }
        }
    }
}

#[async_trait]
impl LoginFlow for ImplicitFlow {
    async fn login(&self) -> Result<Option<TokenBundle>> {
        self.run_dialog().await
    }

    async fn renew(&self, _current: &TokenBundle) -> Result<Option<TokenBundle>> {
        // Nothing to refresh with; the dialog has to be repeated.
        self.run_dialog().await
    }
}
