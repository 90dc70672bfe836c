use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::auth::TokenSource;
use crate::device::DeviceSessionController;
use crate::spotify::{PlayCommandError, StreamingApi};

/// The one answer the UI ever gets for "play this track". Playback never
/// hard-fails visibly; every failure mode degrades to a shorter audio
/// experience or a silent skip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackRoute {
    /// Audio is playing on the managed device.
    Device,
    /// Play this short preview clip through a plain audio element.
    Preview(String),
    /// Nothing playable here; move on to the next queue entry.
    Advance,
}

/// Resolver seam so the queue controller is testable against fakes.
#[async_trait]
pub trait TrackResolver: Send + Sync {
    async fn resolve(&self, track_id: &str) -> PlaybackRoute;
}

/// Last-resort preview lookup consulted when the live catalog fails.
/// Production wires the empty catalog; hosts may inject a cached one.
pub trait FallbackCatalog: Send + Sync {
    fn preview_for(&self, track_id: &str) -> Option<String>;
}

/// The production default: no fallback entries.
pub struct EmptyFallbackCatalog;

impl FallbackCatalog for EmptyFallbackCatalog {
    fn preview_for(&self, _track_id: &str) -> Option<String> {
        None
    }
}

/// Decides and executes the playback strategy for a track: device playback
/// when the session can, preview clip when it cannot, advance when nothing
/// is playable.
pub struct PlaybackResolver {
    tokens: Arc<dyn TokenSource>,
    device: DeviceSessionController,
    api: Arc<dyn StreamingApi>,
    fallback: Arc<dyn FallbackCatalog>,
}

impl PlaybackResolver {
    pub fn new(
        tokens: Arc<dyn TokenSource>,
        device: DeviceSessionController,
        api: Arc<dyn StreamingApi>,
        fallback: Arc<dyn FallbackCatalog>,
    ) -> Self {
        Self {
            tokens,
            device,
            api,
            fallback,
        }
    }

    async fn try_device(&self, track_id: &str) -> Option<PlaybackRoute> {
        if !self.tokens.user_authenticated().await {
            return None;
        }
        if !self.device.ensure_ready().await {
            return None;
        }
        let device_id = self.device.device_id().await?;

        match self.api.play_on_device(&device_id, track_id).await {
            Ok(()) => Some(PlaybackRoute::Device),
            Err(PlayCommandError::Benign(msg)) => {
                // Known service quirk: the command errors even though audio
                // starts. Treated as success, never retried.
                debug!("Ignoring benign play-command error: {msg}");
                Some(PlaybackRoute::Device)
            }
            Err(PlayCommandError::PremiumRequired) => {
                debug!("No premium entitlement; falling back to preview");
                None
            }
            Err(PlayCommandError::NotPlayable) => {
                debug!("Track {track_id} not playable on device");
                None
            }
            Err(PlayCommandError::Other(e)) => {
                warn!("Device play command failed: {e}");
                None
            }
        }
    }

    async fn preview_route(&self, track_id: &str) -> PlaybackRoute {
        match self.api.get_track(track_id).await {
            Ok(track) => match track.preview_url {
                Some(url) => PlaybackRoute::Preview(url),
                None => PlaybackRoute::Advance,
            },
            Err(e) => {
                warn!("Track lookup failed for {track_id}: {e}");
                match self.fallback.preview_for(track_id) {
                    Some(url) => PlaybackRoute::Preview(url),
                    None => PlaybackRoute::Advance,
                }
            }
        }
    }
}

#[async_trait]
impl TrackResolver for PlaybackResolver {
    async fn resolve(&self, track_id: &str) -> PlaybackRoute {
        if track_id.trim().is_empty() {
            debug!("Empty track id; advancing");
            return PlaybackRoute::Advance;
        }

        if let Some(route) = self.try_device(track_id).await {
            return route;
        }

        self.preview_route(track_id).await
    }
}
