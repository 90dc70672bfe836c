use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::device::DeviceSessionController;
use crate::resolver::{PlaybackRoute, TrackResolver};
use crate::spotify::TrackDescriptor;

/// Queue state read by the UI layer. Mutated only by the controller.
#[derive(Debug, Clone, Default)]
pub struct PlayQueueState {
    pub ordered_tracks: Vec<TrackDescriptor>,
    pub current_index: usize,
    pub using_device_playback: bool,
    pub last_error: Option<String>,
}

/// Host-side sink for preview clips: an audio element on web, a native
/// player elsewhere.
pub trait PreviewPlayer: Send + Sync {
    fn play(&self, url: &str);
    fn pause(&self);
    fn resume(&self);
    fn stop(&self);
}

/// No-audio sink for hosts that have not wired one yet.
pub struct NullPreviewPlayer;

impl PreviewPlayer for NullPreviewPlayer {
    fn play(&self, _url: &str) {}
    fn pause(&self) {}
    fn resume(&self) {}
    fn stop(&self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ActiveMode {
    Idle,
    Device,
    Preview,
}

struct QueueInner {
    state: PlayQueueState,
    mode: ActiveMode,
    paused: bool,
}

/// Holds the ordered play queue, advances on completion or failure signals
/// from the resolver, and stops after a full unplayable cycle instead of
/// looping forever.
pub struct TrackQueueController {
    resolver: Arc<dyn TrackResolver>,
    device: DeviceSessionController,
    preview: Arc<dyn PreviewPlayer>,
    advance_debounce: Duration,
    end_threshold_ms: u64,
    inner: Mutex<QueueInner>,
}

impl TrackQueueController {
    pub fn new(
        resolver: Arc<dyn TrackResolver>,
        device: DeviceSessionController,
        preview: Arc<dyn PreviewPlayer>,
        advance_debounce: Duration,
        end_threshold_ms: u64,
    ) -> Self {
        Self {
            resolver,
            device,
            preview,
            advance_debounce,
            end_threshold_ms,
            inner: Mutex::new(QueueInner {
                state: PlayQueueState::default(),
                mode: ActiveMode::Idle,
                paused: false,
            }),
        }
    }

    /// Replace the queue and reset to the first entry. Stops any preview
    /// audio currently running.
    pub async fn set_queue(&self, tracks: Vec<TrackDescriptor>) {
        self.preview.stop();
        let mut inner = self.inner.lock().await;
        inner.state = PlayQueueState {
            ordered_tracks: tracks,
            current_index: 0,
            using_device_playback: false,
            last_error: None,
        };
        inner.mode = ActiveMode::Idle;
        inner.paused = false;
    }

    /// Snapshot for the UI.
    pub async fn queue_state(&self) -> PlayQueueState {
        self.inner.lock().await.state.clone()
    }

    /// Start playback at `index` (wrapped into range), or at the current
    /// index when `None`. No-op on an empty queue.
    pub async fn play(&self, index: Option<usize>) {
        {
            let mut inner = self.inner.lock().await;
            let len = inner.state.ordered_tracks.len();
            if len == 0 {
                return;
            }
            if let Some(i) = index {
                inner.state.current_index = i % len;
            }
        }
        self.resolve_from_current().await;
    }

    /// Advance one entry (wrapping) and play it. No-op on an empty queue.
    pub async fn next(&self) {
        self.step(1).await;
    }

    /// Step back one entry (wrapping) and play it. No-op on an empty queue.
    pub async fn previous(&self) {
        self.step_back().await;
    }

    /// The currently playing item finished: move on and resolve the next
    /// entry.
    pub async fn on_track_ended(&self) {
        self.next().await;
    }

    /// Play/pause toggle. Resumes through whichever mode was last active;
    /// starts resolution from the current index when nothing is active.
    pub async fn toggle(&self) {
        let (mode, paused) = {
            let inner = self.inner.lock().await;
            (inner.mode, inner.paused)
        };

        match (mode, paused) {
            (ActiveMode::Idle, _) => self.play(None).await,
            (ActiveMode::Device, false) => {
                if let Err(e) = self.device.pause().await {
                    warn!("Device pause failed: {e}");
                }
                self.inner.lock().await.paused = true;
            }
            (ActiveMode::Device, true) => {
                if let Err(e) = self.device.resume().await {
                    warn!("Device resume failed: {e}");
                }
                self.inner.lock().await.paused = false;
            }
            (ActiveMode::Preview, false) => {
                self.preview.pause();
                self.inner.lock().await.paused = true;
            }
            (ActiveMode::Preview, true) => {
                self.preview.resume();
                self.inner.lock().await.paused = false;
            }
        }
    }

    /// Host-driven poll (every few seconds while device playback is
    /// active) that detects end of track; the service pushes no completion
    /// event for device playback.
    pub async fn poll_device_progress(&self) {
        let active = {
            let inner = self.inner.lock().await;
            inner.mode == ActiveMode::Device && !inner.paused
        };
        if !active {
            return;
        }

        if let Some(snapshot) = self.device.get_state().await {
            if snapshot.duration_ms > 0
                && snapshot.position_ms + self.end_threshold_ms >= snapshot.duration_ms
            {
                debug!("Device track near end; advancing");
                self.on_track_ended().await;
            }
        }
    }

    async fn step(&self, delta: usize) {
        {
            let mut inner = self.inner.lock().await;
            let len = inner.state.ordered_tracks.len();
            if len == 0 {
                return;
            }
            inner.state.current_index = (inner.state.current_index + delta) % len;
        }
        self.resolve_from_current().await;
    }

    async fn step_back(&self) {
        {
            let mut inner = self.inner.lock().await;
            let len = inner.state.ordered_tracks.len();
            if len == 0 {
                return;
            }
            inner.state.current_index = (inner.state.current_index + len - 1) % len;
        }
        self.resolve_from_current().await;
    }

    /// Resolve the current entry, skipping unplayable tracks with a
    /// debounce between attempts. After one full cycle with nothing
    /// playable the queue settles into a single inert state instead of
    /// spinning.
    async fn resolve_from_current(&self) {
        let mut remaining = {
            let inner = self.inner.lock().await;
            inner.state.ordered_tracks.len()
        };
        if remaining == 0 {
            return;
        }

        loop {
            let track_id = {
                let inner = self.inner.lock().await;
                inner.state.ordered_tracks[inner.state.current_index]
                    .service_track_id
                    .clone()
            };

            match self.resolver.resolve(&track_id).await {
                PlaybackRoute::Device => {
                    let mut inner = self.inner.lock().await;
                    inner.mode = ActiveMode::Device;
                    inner.paused = false;
                    inner.state.using_device_playback = true;
                    inner.state.last_error = None;
                    return;
                }
                PlaybackRoute::Preview(url) => {
                    self.preview.play(&url);
                    let mut inner = self.inner.lock().await;
                    inner.mode = ActiveMode::Preview;
                    inner.paused = false;
                    inner.state.using_device_playback = false;
                    inner.state.last_error = None;
                    return;
                }
                PlaybackRoute::Advance => {
                    remaining -= 1;
                    if remaining == 0 {
                        warn!("Exhausted the queue without a playable track");
                        self.preview.stop();
                        let mut inner = self.inner.lock().await;
                        inner.mode = ActiveMode::Idle;
                        inner.paused = false;
                        inner.state.using_device_playback = false;
                        inner.state.last_error = Some("no playable track".to_string());
                        return;
                    }

                    // Debounce so a fully unplayable queue does not spin
                    // through itself in one tight burst.
                    tokio::time::sleep(self.advance_debounce).await;

                    let mut inner = self.inner.lock().await;
                    let len = inner.state.ordered_tracks.len();
                    inner.state.current_index = (inner.state.current_index + 1) % len;
                }
            }
        }
    }
}
