pub mod endpoint;
pub mod flow;
pub mod store;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::single_flight::SingleFlight;

pub use endpoint::{HttpTokenEndpoint, TokenEndpoint, TokenGrant};
pub use flow::{AuthCodeFlow, AuthPrompt, AuthorizationReply, ImplicitFlow, LoginFlow};
pub use store::{FileTokenStore, MemoryTokenStore, TokenBundle, TokenStore};

/// Read-only token access handed to collaborators (device backend, REST
/// client). Always calls back into the manager so a mid-session refresh is
/// picked up transparently.
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// A currently valid access token, acquiring or refreshing as needed.
    async fn access_token(&self) -> Option<String>;

    /// Whether the session carries an end-user identity.
    async fn user_authenticated(&self) -> bool;
}

/// Owns the OAuth lifecycle for one signed-in session: client-credential
/// acquisition, the interactive user grant (via the injected platform
/// flow), refresh, and expiry-based reuse. Concurrent callers collapse into
/// one in-flight exchange.
#[derive(Clone)]
pub struct TokenManager {
    inner: Arc<Inner>,
}

struct Inner {
    endpoint: Arc<dyn TokenEndpoint>,
    store: Arc<dyn TokenStore>,
    flow: Arc<dyn LoginFlow>,
    bundle: Mutex<TokenBundle>,
    flight: SingleFlight<Option<String>>,
}

impl TokenManager {
    /// Build a manager, hydrating from the store. A persisted user bundle
    /// without a refresh token cannot be rebuilt silently and is discarded.
    pub async fn new(
        endpoint: Arc<dyn TokenEndpoint>,
        store: Arc<dyn TokenStore>,
        flow: Arc<dyn LoginFlow>,
    ) -> Self {
        let bundle = match store.load().await {
            Ok(Some(saved)) if saved.reusable_after_restart() => saved,
            Ok(Some(_)) => {
                info!("Discarding saved user credentials with no refresh token");
                TokenBundle::empty()
            }
            Ok(None) => TokenBundle::empty(),
            Err(e) => {
                warn!("Failed to load saved credentials: {e}");
                TokenBundle::empty()
            }
        };

        Self {
            inner: Arc::new(Inner {
                endpoint,
                store,
                flow,
                bundle: Mutex::new(bundle),
                flight: SingleFlight::new(),
            }),
        }
    }

    /// Return a valid access token, reusing the current one when it has not
    /// lapsed, refreshing a user bundle when it has, and otherwise falling
    /// back to the app-identity client-credentials exchange. `None` only
    /// when every path failed.
    pub async fn authenticate(&self) -> Option<String> {
        if let Some(token) = self.inner.usable_token().await {
            return Some(token);
        }

        let inner = Arc::clone(&self.inner);
        self.inner
            .flight
            .run(move || async move { inner.acquire().await })
            .await
    }

    pub async fn is_user_authenticated(&self) -> bool {
        self.inner.bundle.lock().await.user_authenticated
    }

    /// Peek at the current token without triggering any exchange.
    pub async fn access_token_if_valid(&self) -> Option<String> {
        self.inner.usable_token().await
    }

    /// Run the interactive user grant. `Ok(false)` when the user backed out
    /// of the dialog.
    pub async fn connect_user(&self) -> Result<bool> {
        match self.inner.flow.login().await? {
            Some(bundle) => {
                self.inner.store.save(&bundle).await?;
                *self.inner.bundle.lock().await = bundle;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Rebuild the user bundle. Fails closed: any refresh failure clears the
    /// bundle entirely so no stale access token survives.
    pub async fn refresh(&self) -> bool {
        let snapshot = self.inner.bundle.lock().await.clone();
        if !snapshot.user_authenticated {
            return false;
        }
        self.inner.renew_user_bundle(&snapshot).await
    }

    /// Drop the in-memory bundle and the persisted copy. Device-session
    /// teardown is sequenced by the owning session.
    pub async fn disconnect(&self) {
        self.inner.clear().await;
    }
}

impl Inner {
    async fn usable_token(&self) -> Option<String> {
        let bundle = self.bundle.lock().await;
        if bundle.is_usable() {
            bundle.access_token.clone()
        } else {
            None
        }
    }

    async fn acquire(&self) -> Option<String> {
        // A caller that raced in behind a completed exchange reuses it.
        if let Some(token) = self.usable_token().await {
            return Some(token);
        }

        let snapshot = self.bundle.lock().await.clone();
        if snapshot.user_authenticated {
            if self.renew_user_bundle(&snapshot).await {
                return self.usable_token().await;
            }
            // Refresh failed closed; fall back to the app identity.
        }

        match self.endpoint.client_credentials().await {
            Ok(grant) => self.install(TokenBundle::from_grant(grant, false)).await,
            Err(e) => {
                // Transient app-credential failure: retry on next call, the
                // persisted bundle is left alone.
                warn!("Client-credentials exchange failed: {e}");
                None
            }
        }
    }

    /// Persist first, then swap into memory and hand the token out.
    async fn install(&self, bundle: TokenBundle) -> Option<String> {
        if let Err(e) = self.store.save(&bundle).await {
            warn!("Failed to persist token bundle: {e}");
        }
        let mut guard = self.bundle.lock().await;
        *guard = bundle;
        guard.access_token.clone()
    }

    async fn renew_user_bundle(&self, current: &TokenBundle) -> bool {
        match self.flow.renew(current).await {
            Ok(Some(bundle)) => self.install(bundle).await.is_some(),
            Ok(None) => {
                info!("User dismissed the re-authorization dialog");
                self.clear().await;
                false
            }
            Err(e) => {
                warn!("Token refresh failed, clearing session: {e}");
                self.clear().await;
                false
            }
        }
    }

    async fn clear(&self) {
        *self.bundle.lock().await = TokenBundle::empty();
        if let Err(e) = self.store.clear().await {
            warn!("Failed to clear saved credentials: {e}");
        }
        if let Err(e) = self.store.clear_login_state().await {
            warn!("Failed to clear login state: {e}");
        }
    }
}

#[async_trait]
impl TokenSource for TokenManager {
    async fn access_token(&self) -> Option<String> {
        self.authenticate().await
    }

    async fn user_authenticated(&self) -> bool {
        self.is_user_authenticated().await
    }
}
