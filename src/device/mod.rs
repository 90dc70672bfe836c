pub mod backend;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use crate::auth::TokenSource;
use crate::single_flight::SingleFlight;

pub use backend::{DeviceBackend, DeviceEvent, PlayerSnapshot};

/// Lifecycle of the playback device session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceState {
    Uninitialized,
    /// SDK fetch in progress.
    Loading,
    /// Device constructed, waiting for the readiness handshake.
    Connecting,
    Ready { device_id: String },
    Failed,
}

/// Lazily loads the playback SDK, owns the one device instance per session,
/// and tracks readiness through the SDK's event stream. Only meaningful for
/// user-authenticated sessions; everyone else gets `false` from
/// [`ensure_ready`](DeviceSessionController::ensure_ready) without any
/// loading.
#[derive(Clone)]
pub struct DeviceSessionController {
    inner: Arc<Inner>,
}

struct Inner {
    backend: Arc<dyn DeviceBackend>,
    tokens: Arc<dyn TokenSource>,
    connect_timeout: Duration,
    /// The SDK script is fetched once per process; reconnects and even
    /// teardown do not unload it.
    sdk_loaded: AtomicBool,
    state: Mutex<DeviceState>,
    events: Mutex<Option<mpsc::Receiver<DeviceEvent>>>,
    snapshot: Mutex<Option<PlayerSnapshot>>,
    flight: SingleFlight<bool>,
}

impl DeviceSessionController {
    pub fn new(
        backend: Arc<dyn DeviceBackend>,
        tokens: Arc<dyn TokenSource>,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                backend,
                tokens,
                connect_timeout,
                sdk_loaded: AtomicBool::new(false),
                state: Mutex::new(DeviceState::Uninitialized),
                events: Mutex::new(None),
                snapshot: Mutex::new(None),
                flight: SingleFlight::new(),
            }),
        }
    }

    /// Bring the device to `Ready`, running the load/connect sequence if
    /// needed. Idempotent; concurrent callers share one in-flight sequence.
    /// `false` for sessions without a user identity and for any handshake
    /// failure (a later call retries from the load step).
    pub async fn ensure_ready(&self) -> bool {
        self.inner.pump_events().await;

        if !self.inner.tokens.user_authenticated().await {
            return false;
        }
        if self.inner.ready_device().await.is_some() {
            return true;
        }

        let inner = Arc::clone(&self.inner);
        self.inner
            .flight
            .run(move || async move { inner.connect_sequence().await })
            .await
    }

    /// Current state, after applying any pending SDK events.
    pub async fn state(&self) -> DeviceState {
        self.inner.pump_events().await;
        self.inner.state.lock().await.clone()
    }

    /// Device id to target playback commands at, when `Ready`.
    pub async fn device_id(&self) -> Option<String> {
        self.inner.pump_events().await;
        self.inner.ready_device().await
    }

    pub async fn pause(&self) -> Result<()> {
        if !self.controllable("pause").await {
            return Ok(());
        }
        self.inner.backend.pause().await
    }

    pub async fn resume(&self) -> Result<()> {
        if !self.controllable("resume").await {
            return Ok(());
        }
        self.inner.backend.resume().await
    }

    pub async fn next(&self) -> Result<()> {
        if !self.controllable("next").await {
            return Ok(());
        }
        self.inner.backend.next().await
    }

    pub async fn previous(&self) -> Result<()> {
        if !self.controllable("previous").await {
            return Ok(());
        }
        self.inner.backend.previous().await
    }

    /// Latest playback position, or `None` when no device is ready.
    pub async fn get_state(&self) -> Option<PlayerSnapshot> {
        self.inner.pump_events().await;
        self.inner.ready_device().await?;

        match self.inner.backend.state().await {
            Ok(snapshot) => {
                if let Some(s) = snapshot {
                    *self.inner.snapshot.lock().await = Some(s);
                }
                snapshot
            }
            Err(e) => {
                warn!("Failed to read device state: {e}");
                self.inner.snapshot.lock().await.clone()
            }
        }
    }

    /// Drop the device session entirely (sign-out/disconnect path). The
    /// backend is told to deregister so the device does not linger with
    /// the service.
    pub async fn teardown(&self) {
        if let Err(e) = self.inner.backend.disconnect().await {
            warn!("Device disconnect failed: {e}");
        }
        *self.inner.events.lock().await = None;
        *self.inner.snapshot.lock().await = None;
        *self.inner.state.lock().await = DeviceState::Uninitialized;
    }

    async fn controllable(&self, name: &str) -> bool {
        self.inner.pump_events().await;
        if self.inner.ready_device().await.is_none() {
            debug!("Ignoring {name}: no device ready");
            return false;
        }
        true
    }
}

impl Inner {
    async fn ready_device(&self) -> Option<String> {
        match &*self.state.lock().await {
            DeviceState::Ready { device_id } => Some(device_id.clone()),
            _ => None,
        }
    }

    async fn set_state(&self, next: DeviceState) {
        *self.state.lock().await = next;
    }

    /// Apply events the SDK delivered since the last call. Keeps demotions
    /// (`not_ready`) visible without a background task.
    async fn pump_events(&self) {
        let mut events = self.events.lock().await;
        let Some(rx) = events.as_mut() else {
            return;
        };

        loop {
            match rx.try_recv() {
                Ok(event) => self.apply_event(event).await,
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    warn!("Device event stream closed");
                    *events = None;
                    self.set_state(DeviceState::Failed).await;
                    break;
                }
            }
        }
    }

    async fn apply_event(&self, event: DeviceEvent) {
        match event {
            DeviceEvent::Ready { device_id } => {
                self.set_state(DeviceState::Ready { device_id }).await;
            }
            DeviceEvent::NotReady => {
                // Demoted (e.g. playback transferred elsewhere); the next
                // ensure_ready reconnects.
                debug!("Device demoted to not-ready");
                self.set_state(DeviceState::Connecting).await;
            }
            DeviceEvent::InitializationError(m)
            | DeviceEvent::AuthenticationError(m)
            | DeviceEvent::AccountError(m) => {
                warn!("Device session failed: {m}");
                self.set_state(DeviceState::Failed).await;
            }
            DeviceEvent::PlaybackError(m) => {
                warn!("Device playback error: {m}");
            }
            DeviceEvent::StateChanged(s) => {
                *self.snapshot.lock().await = Some(s);
            }
        }
    }

    async fn connect_sequence(&self) -> bool {
        // A caller that raced in behind a completed handshake reuses it.
        if self.ready_device().await.is_some() {
            return true;
        }

        self.set_state(DeviceState::Loading).await;
        if !self.sdk_loaded.load(Ordering::SeqCst) {
            if let Err(e) = self.backend.load().await {
                warn!("Playback SDK load failed: {e}");
                self.set_state(DeviceState::Failed).await;
                return false;
            }
            self.sdk_loaded.store(true, Ordering::SeqCst);
        }

        self.set_state(DeviceState::Connecting).await;
        let mut rx = match self.backend.connect(Arc::clone(&self.tokens)).await {
            Ok(rx) => rx,
            Err(e) => {
                warn!("Device construction failed: {e}");
                self.set_state(DeviceState::Failed).await;
                return false;
            }
        };

        let handshake = async {
            while let Some(event) = rx.recv().await {
                match event {
                    DeviceEvent::Ready { device_id } => return Some(device_id),
                    DeviceEvent::InitializationError(m)
                    | DeviceEvent::AuthenticationError(m)
                    | DeviceEvent::AccountError(m) => {
                        warn!("Device handshake failed: {m}");
                        return None;
                    }
                    DeviceEvent::PlaybackError(m) => warn!("Device playback error: {m}"),
                    DeviceEvent::StateChanged(s) => {
                        *self.snapshot.lock().await = Some(s);
                    }
                    DeviceEvent::NotReady => {}
                }
            }
            None
        };

        match tokio::time::timeout(self.connect_timeout, handshake).await {
            Ok(Some(device_id)) => {
                debug!("Device ready: {device_id}");
                *self.events.lock().await = Some(rx);
                self.set_state(DeviceState::Ready { device_id }).await;
                true
            }
            Ok(None) => {
                self.set_state(DeviceState::Failed).await;
                false
            }
            Err(_) => {
                warn!(
                    "Device handshake timed out after {}s",
                    self.connect_timeout.as_secs()
                );
                self.set_state(DeviceState::Failed).await;
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeTokens {
        user: bool,
    }

    #[async_trait]
    impl TokenSource for FakeTokens {
        async fn access_token(&self) -> Option<String> {
            Some("token".to_string())
        }

        async fn user_authenticated(&self) -> bool {
            self.user
        }
    }

    struct FakeBackend {
        /// Events buffered into the channel as soon as connect() runs.
        script: Mutex<Vec<DeviceEvent>>,
        /// Sender kept alive so the handshake can time out instead of
        /// seeing a closed stream, and so tests can push late events.
        tx: Mutex<Option<mpsc::Sender<DeviceEvent>>>,
        loads: AtomicUsize,
        connects: AtomicUsize,
        pauses: AtomicUsize,
        disconnects: AtomicUsize,
        load_delay: Option<Duration>,
    }

    impl FakeBackend {
        fn scripted(events: Vec<DeviceEvent>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(events),
                tx: Mutex::new(None),
                loads: AtomicUsize::new(0),
                connects: AtomicUsize::new(0),
                pauses: AtomicUsize::new(0),
                disconnects: AtomicUsize::new(0),
                load_delay: None,
            })
        }

        fn slow(events: Vec<DeviceEvent>, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(events),
                tx: Mutex::new(None),
                loads: AtomicUsize::new(0),
                connects: AtomicUsize::new(0),
                pauses: AtomicUsize::new(0),
                disconnects: AtomicUsize::new(0),
                load_delay: Some(delay),
            })
        }

        async fn push(&self, event: DeviceEvent) {
            let tx = self.tx.lock().await;
            tx.as_ref().unwrap().send(event).await.unwrap();
        }

        async fn set_script(&self, events: Vec<DeviceEvent>) {
            *self.script.lock().await = events;
        }
    }

    #[async_trait]
    impl DeviceBackend for FakeBackend {
        async fn load(&self) -> Result<()> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.load_delay {
                tokio::time::sleep(delay).await;
            }
            Ok(())
        }

        async fn connect(
            &self,
            _tokens: Arc<dyn TokenSource>,
        ) -> Result<mpsc::Receiver<DeviceEvent>> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            let (tx, rx) = mpsc::channel(16);
            for event in self.script.lock().await.drain(..) {
                tx.send(event).await.unwrap();
            }
            *self.tx.lock().await = Some(tx);
            Ok(rx)
        }

        async fn disconnect(&self) -> Result<()> {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn pause(&self) -> Result<()> {
            self.pauses.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn resume(&self) -> Result<()> {
            Ok(())
        }

        async fn next(&self) -> Result<()> {
            Ok(())
        }

        async fn previous(&self) -> Result<()> {
            Ok(())
        }

        async fn state(&self) -> Result<Option<PlayerSnapshot>> {
            Ok(Some(PlayerSnapshot {
                paused: false,
                position_ms: 1000,
                duration_ms: 30000,
            }))
        }
    }

    fn ready_event() -> DeviceEvent {
        DeviceEvent::Ready {
            device_id: "dev-1".to_string(),
        }
    }

    fn controller(backend: Arc<FakeBackend>, user: bool) -> DeviceSessionController {
        DeviceSessionController::new(
            backend,
            Arc::new(FakeTokens { user }),
            Duration::from_secs(15),
        )
    }

    #[tokio::test]
    async fn handshake_reaches_ready_and_is_idempotent() {
        let backend = FakeBackend::scripted(vec![ready_event()]);
        let ctl = controller(backend.clone(), true);

        assert!(ctl.ensure_ready().await);
        assert_eq!(ctl.device_id().await.as_deref(), Some("dev-1"));

        assert!(ctl.ensure_ready().await);
        assert_eq!(backend.loads.load(Ordering::SeqCst), 1);
        assert_eq!(backend.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn not_user_authenticated_never_loads() {
        let backend = FakeBackend::scripted(vec![ready_event()]);
        let ctl = controller(backend.clone(), false);

        assert!(!ctl.ensure_ready().await);
        assert_eq!(backend.loads.load(Ordering::SeqCst), 0);
        assert_eq!(ctl.state().await, DeviceState::Uninitialized);
    }

    #[tokio::test]
    async fn initialization_error_fails_and_later_call_retries() {
        let backend =
            FakeBackend::scripted(vec![DeviceEvent::InitializationError("bad sdk".into())]);
        let ctl = controller(backend.clone(), true);

        assert!(!ctl.ensure_ready().await);
        assert_eq!(ctl.state().await, DeviceState::Failed);

        backend.set_script(vec![ready_event()]).await;
        assert!(ctl.ensure_ready().await);
        assert_eq!(backend.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_handshake_times_out_to_failed() {
        let backend = FakeBackend::scripted(vec![]);
        let ctl = controller(backend.clone(), true);

        assert!(!ctl.ensure_ready().await);
        assert_eq!(ctl.state().await, DeviceState::Failed);
    }

    #[tokio::test]
    async fn not_ready_event_demotes_without_discarding() {
        let backend = FakeBackend::scripted(vec![ready_event()]);
        let ctl = controller(backend.clone(), true);

        assert!(ctl.ensure_ready().await);
        backend.push(DeviceEvent::NotReady).await;

        assert_eq!(ctl.state().await, DeviceState::Connecting);
        assert!(ctl.device_id().await.is_none());

        // Reconnection redoes the handshake but not the script fetch.
        backend.set_script(vec![ready_event()]).await;
        assert!(ctl.ensure_ready().await);
        assert_eq!(backend.connects.load(Ordering::SeqCst), 2);
        assert_eq!(backend.loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_ensure_ready_shares_one_sequence() {
        let backend = FakeBackend::slow(vec![ready_event()], Duration::from_millis(20));
        let ctl = controller(backend.clone(), true);
        let ctl2 = ctl.clone();

        let (a, b) = tokio::join!(ctl.ensure_ready(), ctl2.ensure_ready());
        assert!(a && b);
        assert_eq!(backend.loads.load(Ordering::SeqCst), 1);
        assert_eq!(backend.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn controls_are_noops_without_a_ready_device() {
        let backend = FakeBackend::scripted(vec![]);
        let ctl = controller(backend.clone(), true);

        ctl.pause().await.unwrap();
        assert_eq!(backend.pauses.load(Ordering::SeqCst), 0);
        assert!(ctl.get_state().await.is_none());
    }

    #[tokio::test]
    async fn teardown_resets_to_uninitialized() {
        let backend = FakeBackend::scripted(vec![ready_event()]);
        let ctl = controller(backend.clone(), true);

        assert!(ctl.ensure_ready().await);
        ctl.teardown().await;
        assert_eq!(backend.disconnects.load(Ordering::SeqCst), 1);
        assert_eq!(ctl.state().await, DeviceState::Uninitialized);
        assert!(ctl.get_state().await.is_none());
    }
}
