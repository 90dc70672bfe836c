use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::auth::TokenSource;

/// Position snapshot from the playback device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlayerSnapshot {
    pub paused: bool,
    pub position_ms: u64,
    pub duration_ms: u64,
}

/// Events the playback SDK emits during and after the device handshake.
#[derive(Debug, Clone)]
pub enum DeviceEvent {
    /// The device registered with the service and can accept playback.
    Ready { device_id: String },
    /// The device lost its registration (e.g. playback transferred away).
    NotReady,
    InitializationError(String),
    AuthenticationError(String),
    AccountError(String),
    PlaybackError(String),
    StateChanged(PlayerSnapshot),
}

/// Host-side adapter around the streaming service's playback SDK. The web
/// shell backs this with the real script-loaded player; tests drive it with
/// channels.
#[async_trait]
pub trait DeviceBackend: Send + Sync {
    /// Fetch the SDK itself (script load on web, no-op where it is bundled).
    async fn load(&self) -> Result<()>;

    /// Construct the device bound to a token supplier and start the
    /// handshake. Events arrive on the returned channel. The supplier is
    /// called back for every token the SDK needs, so a mid-session refresh
    /// is picked up without reconnecting.
    async fn connect(&self, tokens: Arc<dyn TokenSource>)
        -> Result<mpsc::Receiver<DeviceEvent>>;

    /// Deregister the device from the service and release the player.
    /// Called on sign-out; the SDK script itself stays loaded.
    async fn disconnect(&self) -> Result<()>;

    async fn pause(&self) -> Result<()>;
    async fn resume(&self) -> Result<()>;
    async fn next(&self) -> Result<()>;
    async fn previous(&self) -> Result<()>;
    async fn state(&self) -> Result<Option<PlayerSnapshot>>;
}
