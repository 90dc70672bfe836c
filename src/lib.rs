//! Playback integration layer for an event-discovery host app: OAuth
//! session management against a streaming service, the managed playback
//! device lifecycle, per-track playback routing with graceful degradation,
//! the play queue, and playlist metadata enrichment.

pub mod auth;
pub mod config;
pub mod device;
pub mod enhancer;
pub mod queue;
pub mod resolver;
pub mod session;
pub mod single_flight;
pub mod spotify;

pub use auth::{AuthPrompt, AuthorizationReply, TokenManager, TokenSource};
pub use config::Config;
pub use device::{DeviceBackend, DeviceEvent, DeviceSessionController, DeviceState, PlayerSnapshot};
pub use enhancer::{Playlist, PlaylistEnhancer};
pub use queue::{NullPreviewPlayer, PlayQueueState, PreviewPlayer, TrackQueueController};
pub use resolver::{FallbackCatalog, PlaybackResolver, PlaybackRoute, TrackResolver};
pub use session::Session;
pub use spotify::{PlayCommandError, SpotifyClient, StreamingApi, TrackDescriptor};
