use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use reqwest::Client as HttpClient;

use crate::auth::{
    AuthCodeFlow, AuthPrompt, FileTokenStore, HttpTokenEndpoint, ImplicitFlow, LoginFlow,
    TokenEndpoint, TokenManager, TokenSource, TokenStore,
};
use crate::config::Config;
use crate::device::{DeviceBackend, DeviceSessionController};
use crate::enhancer::PlaylistEnhancer;
use crate::queue::{PreviewPlayer, TrackQueueController};
use crate::resolver::{EmptyFallbackCatalog, PlaybackResolver, TrackResolver};
use crate::spotify::{SpotifyClient, StreamingApi};

/// One signed-in (or app-identity) playback session: tokens, the managed
/// device, the play queue, and playlist enrichment, wired together from the
/// host-provided platform pieces.
pub struct Session {
    tokens: TokenManager,
    device: DeviceSessionController,
    api: Arc<dyn StreamingApi>,
    queue: TrackQueueController,
    enhancer: PlaylistEnhancer,
    progress_poll_interval: Duration,
}

impl Session {
    /// Native hosts: authorization-code grant with a persisted refresh
    /// token, so a restart never repeats the login dialog.
    pub async fn native(
        config: Config,
        prompt: Arc<dyn AuthPrompt>,
        backend: Arc<dyn DeviceBackend>,
        preview: Arc<dyn PreviewPlayer>,
    ) -> Result<Self> {
        let http = HttpClient::new();
        let endpoint: Arc<dyn TokenEndpoint> =
            Arc::new(HttpTokenEndpoint::new(http.clone(), &config.service));
        let store: Arc<dyn TokenStore> = Arc::new(FileTokenStore::new()?);
        let flow: Arc<dyn LoginFlow> = Arc::new(AuthCodeFlow::new(
            Arc::clone(&endpoint),
            prompt,
            config.service.clone(),
        ));

        Ok(Self::from_parts(config, http, endpoint, store, flow, backend, preview).await)
    }

    /// Web hosts: implicit grant. No refresh token exists, so a lapsed
    /// session repeats the dialog instead of refreshing silently.
    pub async fn web(
        config: Config,
        prompt: Arc<dyn AuthPrompt>,
        backend: Arc<dyn DeviceBackend>,
        preview: Arc<dyn PreviewPlayer>,
    ) -> Result<Self> {
        let http = HttpClient::new();
        let endpoint: Arc<dyn TokenEndpoint> =
            Arc::new(HttpTokenEndpoint::new(http.clone(), &config.service));
        let store: Arc<dyn TokenStore> = Arc::new(FileTokenStore::new()?);
        let flow: Arc<dyn LoginFlow> = Arc::new(ImplicitFlow::new(
            prompt,
            Arc::clone(&store),
            config.service.clone(),
        ));

        Ok(Self::from_parts(config, http, endpoint, store, flow, backend, preview).await)
    }

    /// Assembly seam for hosts with their own storage or grant plumbing,
    /// and for tests.
    pub async fn from_parts(
        config: Config,
        http: HttpClient,
        endpoint: Arc<dyn TokenEndpoint>,
        store: Arc<dyn TokenStore>,
        flow: Arc<dyn LoginFlow>,
        backend: Arc<dyn DeviceBackend>,
        preview: Arc<dyn PreviewPlayer>,
    ) -> Self {
        let tokens = TokenManager::new(endpoint, store, flow).await;
        let token_source: Arc<dyn TokenSource> = Arc::new(tokens.clone());

        let device = DeviceSessionController::new(
            backend,
            Arc::clone(&token_source),
            Duration::from_secs(config.playback.connect_timeout_secs),
        );

        let api: Arc<dyn StreamingApi> = Arc::new(SpotifyClient::new(
            http,
            config.service.api_base_url.clone(),
            Arc::clone(&token_source),
            config.playback.benign_error_markers.clone(),
        ));

        let resolver: Arc<dyn TrackResolver> = Arc::new(PlaybackResolver::new(
            token_source,
            device.clone(),
            Arc::clone(&api),
            Arc::new(EmptyFallbackCatalog),
        ));

        let queue = TrackQueueController::new(
            resolver,
            device.clone(),
            preview,
            Duration::from_millis(config.playback.advance_debounce_ms),
            config.playback.end_of_track_threshold_ms,
        );

        Self {
            tokens,
            device,
            api: Arc::clone(&api),
            queue,
            enhancer: PlaylistEnhancer::new(api),
            progress_poll_interval: Duration::from_secs(
                config.playback.progress_poll_interval_secs,
            ),
        }
    }

    pub fn tokens(&self) -> &TokenManager {
        &self.tokens
    }

    pub fn device(&self) -> &DeviceSessionController {
        &self.device
    }

    pub fn queue(&self) -> &TrackQueueController {
        &self.queue
    }

    pub fn enhancer(&self) -> &PlaylistEnhancer {
        &self.enhancer
    }

    /// How often the host should call
    /// [`poll_device_progress`](TrackQueueController::poll_device_progress).
    pub fn progress_poll_interval(&self) -> Duration {
        self.progress_poll_interval
    }

    /// Whether the signed-in account can use full-track device playback.
    /// Hosts call this to decide whether to surface device controls; the
    /// resolver finds out on its own from the play command.
    pub async fn check_premium(&self) -> Result<bool> {
        self.api.check_premium().await
    }

    /// Run the interactive user grant. `Ok(false)` when the user backed
    /// out of the dialog.
    pub async fn connect_user(&self) -> Result<bool> {
        self.tokens.connect_user().await
    }

    /// Sign out: the device session goes down first so no command races a
    /// token that is about to vanish, then the credentials are dropped.
    pub async fn disconnect(&self) {
        self.device.teardown().await;
        self.tokens.disconnect().await;
    }
}
