//! In-process doubles for the peer stack and capture devices, plus a rig that
//! wires several participants to one shared store.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::config::{validate_server, SignalingConfig};
use crate::controller::{Collaborators, StreamLifecycleController};
use crate::error::Result;
use crate::peer::{
    AcquireError, ConnectionState, IceCandidate, LocalTrack, MediaConstraints, MediaDevices,
    PeerEvent, RemoteTrack, RtcBackend, RtcPeer, SdpType, ServerConfig, SessionDescription,
    TrackKind,
};
use crate::store::{MemoryMetadataStore, MemorySessionStore, SignedRecordingStore};
use crate::utils::random_id;

/// Peer backend that negotiates instantly and in memory.
///
/// With auto-connect on, a peer reports `Connecting` then `Connected` as soon
/// as it holds both a local and a remote description.
pub struct MockBackend {
    auto_connect: AtomicBool,
    local_candidates: usize,
    peers: Mutex<Vec<Arc<MockPeer>>>,
    failing_track_adds: Arc<AtomicUsize>,
    reachable: Mutex<Vec<String>>,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBackend {
    pub fn new() -> Self {
        Self {
            auto_connect: AtomicBool::new(true),
            local_candidates: 0,
            peers: Mutex::new(Vec::new()),
            failing_track_adds: Arc::new(AtomicUsize::new(0)),
            reachable: Mutex::new(Vec::new()),
        }
    }

    /// Peers never connect on their own; drive them with [`MockPeer::emit_state`].
    pub fn manual() -> Self {
        Self {
            auto_connect: AtomicBool::new(false),
            ..Self::new()
        }
    }

    /// Switches auto-connect for peers opened from now on.
    pub fn set_auto_connect(&self, on: bool) {
        self.auto_connect.store(on, Ordering::SeqCst);
    }

    /// Each peer gathers `count` host candidates after setting its local description.
    pub fn with_local_candidates(mut self, count: usize) -> Self {
        self.local_candidates = count;
        self
    }

    /// Makes probes of `url` succeed.
    pub fn with_reachable(self, url: impl Into<String>) -> Self {
        self.reachable.lock().push(url.into());
        self
    }

    pub fn fail_next_track_adds(&self, count: usize) {
        self.failing_track_adds.store(count, Ordering::SeqCst);
    }

    pub fn peers(&self) -> Vec<Arc<MockPeer>> {
        self.peers.lock().clone()
    }

    pub fn last_peer(&self) -> Option<Arc<MockPeer>> {
        self.peers.lock().last().cloned()
    }

    /// Peers opened and not yet closed.
    pub fn live_peers(&self) -> usize {
        self.peers.lock().iter().filter(|p| !p.is_closed()).count()
    }
}

#[async_trait]
impl RtcBackend for MockBackend {
    async fn connect(
        &self,
        stream_id: &str,
        _ice_servers: &[ServerConfig],
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> anyhow::Result<Arc<dyn RtcPeer>> {
        let mut peers = self.peers.lock();
        let peer = Arc::new(MockPeer {
            stream_id: stream_id.to_string(),
            index: peers.len(),
            token: random_id(),
            auto_connect: self.auto_connect.load(Ordering::SeqCst),
            local_candidates: self.local_candidates,
            events,
            failing_track_adds: self.failing_track_adds.clone(),
            local: Mutex::new(None),
            remote: Mutex::new(None),
            applied: Mutex::new(Vec::new()),
            tracks: AtomicUsize::new(0),
            state: Mutex::new(ConnectionState::New),
            closed: AtomicBool::new(false),
        });
        peers.push(peer.clone());
        Ok(peer)
    }

    async fn probe(&self, server: &ServerConfig) -> bool {
        validate_server(server).is_ok() && self.reachable.lock().contains(&server.url)
    }
}

pub struct MockPeer {
    stream_id: String,
    index: usize,
    // Keeps descriptions of different participants' peers distinct
    token: String,
    auto_connect: bool,
    local_candidates: usize,
    events: mpsc::UnboundedSender<PeerEvent>,
    failing_track_adds: Arc<AtomicUsize>,
    local: Mutex<Option<SessionDescription>>,
    remote: Mutex<Option<SessionDescription>>,
    applied: Mutex<Vec<IceCandidate>>,
    tracks: AtomicUsize,
    state: Mutex<ConnectionState>,
    closed: AtomicBool,
}

impl MockPeer {
    /// Reports a connection state change as the real stack would.
    pub fn emit_state(&self, state: ConnectionState) {
        *self.state.lock() = state;
        let _ = self.events.send(PeerEvent::StateChanged(state));
    }

    pub fn emit_track(&self, track: RemoteTrack) {
        let _ = self.events.send(PeerEvent::Track(track));
    }

    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.applied.lock().clone()
    }

    pub fn applied_names(&self) -> Vec<String> {
        self.applied
            .lock()
            .iter()
            .map(|c| c.candidate.clone())
            .collect()
    }

    pub fn track_count(&self) -> usize {
        self.tracks.load(Ordering::SeqCst)
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        self.local.lock().clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.remote.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> anyhow::Result<()> {
        if self.is_closed() {
            anyhow::bail!("peer connection is closed");
        }
        Ok(())
    }

    fn set_local(&self, description: SessionDescription) {
        *self.local.lock() = Some(description);
        for n in 0..self.local_candidates {
            let candidate = IceCandidate::new(format!(
                "candidate:{n} 1 udp 2122260223 192.0.2.{} {} typ host",
                self.index + 1,
                50000 + n
            ));
            let _ = self.events.send(PeerEvent::LocalCandidate(candidate));
        }
        let _ = self.events.send(PeerEvent::GatheringComplete);
        self.maybe_connect();
    }

    fn maybe_connect(&self) {
        let negotiated = self.local.lock().is_some() && self.remote.lock().is_some();
        if self.auto_connect && negotiated {
            self.emit_state(ConnectionState::Connecting);
            self.emit_state(ConnectionState::Connected);
        }
    }
}

#[async_trait]
impl RtcPeer for MockPeer {
    async fn add_track(&self, _track: &LocalTrack) -> anyhow::Result<()> {
        self.ensure_open()?;
        let failing = self
            .failing_track_adds
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            anyhow::bail!("sender not ready");
        }
        self.tracks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn create_offer(&self) -> anyhow::Result<SessionDescription> {
        self.ensure_open()?;
        let offer = SessionDescription::offer(format!(
            "v=0 mock-offer {} peer-{} {}",
            self.stream_id, self.index, self.token
        ));
        self.set_local(offer.clone());
        Ok(offer)
    }

    async fn create_answer(&self) -> anyhow::Result<SessionDescription> {
        self.ensure_open()?;
        let has_offer = self
            .remote
            .lock()
            .as_ref()
            .is_some_and(|d| d.sdp_type == SdpType::Offer);
        if !has_offer {
            anyhow::bail!("no remote offer");
        }
        let answer = SessionDescription::answer(format!(
            "v=0 mock-answer {} peer-{} {}",
            self.stream_id, self.index, self.token
        ));
        self.set_local(answer.clone());
        Ok(answer)
    }

    async fn set_remote_description(&self, description: &SessionDescription) -> anyhow::Result<()> {
        self.ensure_open()?;
        *self.remote.lock() = Some(description.clone());
        self.maybe_connect();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> anyhow::Result<()> {
        self.ensure_open()?;
        if self.remote.lock().is_none() {
            anyhow::bail!("remote description is not set");
        }
        self.applied.lock().push(candidate.clone());
        Ok(())
    }

    fn connection_state(&self) -> ConnectionState {
        *self.state.lock()
    }

    async fn close(&self) -> anyhow::Result<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.emit_state(ConnectionState::Closed);
        }
        Ok(())
    }
}

type FailureFn = Box<dyn Fn() -> AcquireError + Send + Sync>;

/// Capture devices that hand out one audio and one video track.
#[derive(Default)]
pub struct SyntheticDevices {
    acquisitions: AtomicUsize,
    delay: Option<Duration>,
    failure: Mutex<Option<FailureFn>>,
}

impl SyntheticDevices {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every acquisition takes `delay`, like a permission prompt would.
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn fail_with(&self, failure: impl Fn() -> AcquireError + Send + Sync + 'static) {
        *self.failure.lock() = Some(Box::new(failure));
    }

    pub fn succeed(&self) {
        *self.failure.lock() = None;
    }

    /// Successful acquisitions so far.
    pub fn acquisitions(&self) -> usize {
        self.acquisitions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaDevices for SyntheticDevices {
    async fn acquire(
        &self,
        constraints: &MediaConstraints,
    ) -> std::result::Result<Vec<LocalTrack>, AcquireError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(failure) = self.failure.lock().as_ref() {
            return Err(failure());
        }
        let n = self.acquisitions.fetch_add(1, Ordering::SeqCst) + 1;
        let mut tracks = Vec::new();
        if constraints.audio {
            tracks.push(LocalTrack::new(TrackKind::Audio, format!("mic-{n}"), "local"));
        }
        if constraints.video {
            tracks.push(LocalTrack::new(TrackKind::Video, format!("cam-{n}"), "local"));
        }
        Ok(tracks)
    }
}

/// Stores shared by every participant of a test, and a config with short timeouts.
pub struct TestRig {
    pub sessions: Arc<MemorySessionStore>,
    pub metadata: Arc<MemoryMetadataStore>,
    pub recordings: Arc<SignedRecordingStore>,
    pub config: SignalingConfig,
}

pub struct Participant {
    pub controller: StreamLifecycleController,
    pub backend: Arc<MockBackend>,
    pub devices: Arc<SyntheticDevices>,
}

impl Default for TestRig {
    fn default() -> Self {
        Self::new()
    }
}

impl TestRig {
    pub fn new() -> Self {
        let mut config = SignalingConfig::default();
        config.connect_timeout_ms = 1_000;
        config.grace_period_ms = 200;
        config.publish_retry.initial_backoff_ms = 1;
        Self {
            sessions: Arc::new(MemorySessionStore::new()),
            metadata: Arc::new(MemoryMetadataStore::new()),
            recordings: Arc::new(SignedRecordingStore::new(
                "https://media.example.test/recordings",
                b"test-signing-secret",
            )),
            config,
        }
    }

    pub fn participant(&self, id: &str) -> Result<Participant> {
        self.participant_with(id, MockBackend::new(), SyntheticDevices::new())
    }

    pub fn participant_with(
        &self,
        id: &str,
        backend: MockBackend,
        devices: SyntheticDevices,
    ) -> Result<Participant> {
        self.participant_configured(id, backend, devices, self.config.clone())
    }

    pub fn participant_configured(
        &self,
        id: &str,
        backend: MockBackend,
        devices: SyntheticDevices,
        config: SignalingConfig,
    ) -> Result<Participant> {
        let backend = Arc::new(backend);
        let devices = Arc::new(devices);
        let controller = StreamLifecycleController::new(
            id,
            config,
            Collaborators {
                sessions: self.sessions.clone(),
                notifier: self.sessions.clone(),
                metadata: self.metadata.clone(),
                recordings: self.recordings.clone(),
                backend: backend.clone(),
                devices: devices.clone(),
            },
        )?;
        Ok(Participant {
            controller,
            backend,
            devices,
        })
    }
}

/// Polls `condition` every few milliseconds until it holds or `within` passes.
pub async fn eventually<F, Fut>(within: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if condition().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
