//! Peer connection management: one connection per active stream, with the
//! remote-description and candidate-buffering rules applied uniformly on top of
//! whichever [`RtcBackend`] is plugged in.

pub mod backend;
pub mod connection;
pub mod ice;
pub mod media;
pub mod retry;
pub mod state;
pub mod types;

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::{RetryPolicy, SignalingConfig};
use crate::error::{Error, Phase, Result};
use crate::utils::random_id;

pub use backend::{RtcBackend, RtcPeer};
pub use connection::WebRtcBackend;
pub use media::{
    AcquireError, LocalMedia, LocalTrack, MediaConstraints, MediaDevices, MediaHandle,
    RemoteMedia, RemoteTrack, TrackKind,
};
pub use retry::with_retry;
pub use state::PeerState;
pub use types::{
    CandidateDisposition, ConnectionState, IceCandidate, PeerEvent, SdpType, ServerConfig,
    SessionDescription,
};

fn backend_error(phase: Phase, e: anyhow::Error) -> Error {
    Error::negotiation(phase, format!("{:#}", e))
}

/// One peer connection for one stream.
pub struct Connection {
    id: String,
    stream_id: String,
    peer: Arc<dyn RtcPeer>,
    state: Mutex<PeerState>,
    // Serializes description/candidate operations on this connection
    negotiation: tokio::sync::Mutex<()>,
    events: Mutex<Option<mpsc::UnboundedReceiver<PeerEvent>>>,
}

impl Connection {
    fn new(
        stream_id: &str,
        peer: Arc<dyn RtcPeer>,
        events: mpsc::UnboundedReceiver<PeerEvent>,
    ) -> Self {
        Self {
            id: random_id(),
            stream_id: stream_id.to_string(),
            peer,
            state: Mutex::new(PeerState::default()),
            negotiation: tokio::sync::Mutex::new(()),
            events: Mutex::new(Some(events)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// Event stream of this connection. Can be taken once.
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<PeerEvent>> {
        self.events.lock().take()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state.lock().connection_state
    }

    /// Records a state reported through [`PeerEvent::StateChanged`].
    pub fn record_state(&self, state: ConnectionState) {
        let mut st = self.state.lock();
        if !st.closed {
            st.connection_state = state;
        }
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.state.lock().remote.clone()
    }

    pub fn pending_candidates(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    fn ensure_open(&self, phase: Phase) -> Result<()> {
        if self.is_closed() {
            return Err(Error::negotiation(phase, "connection is closed"));
        }
        Ok(())
    }

    /// Creates an offer; the local description is set in the same step.
    pub async fn create_offer(&self) -> Result<SessionDescription> {
        let _guard = self.negotiation.lock().await;
        self.ensure_open(Phase::CreateOffer)?;
        let offer = self
            .peer
            .create_offer()
            .await
            .map_err(|e| backend_error(Phase::CreateOffer, e))?;
        debug!(conn = %self.id, stream = %self.stream_id, "offer created");
        Ok(offer)
    }

    /// Creates an answer to the applied remote offer; the local description is
    /// set in the same step.
    pub async fn create_answer(&self) -> Result<SessionDescription> {
        let _guard = self.negotiation.lock().await;
        self.ensure_open(Phase::CreateAnswer)?;
        let has_offer = matches!(
            self.state.lock().remote,
            Some(SessionDescription {
                sdp_type: SdpType::Offer,
                ..
            })
        );
        if !has_offer {
            return Err(Error::negotiation(
                Phase::CreateAnswer,
                "no remote offer has been applied",
            ));
        }
        let answer = self
            .peer
            .create_answer()
            .await
            .map_err(|e| backend_error(Phase::CreateAnswer, e))?;
        debug!(conn = %self.id, stream = %self.stream_id, "answer created");
        Ok(answer)
    }

    /// Applies the remote description and flushes buffered candidates in
    /// arrival order.
    ///
    /// Re-applying an identical description is a no-op (`Ok(false)`), which
    /// absorbs duplicate deliveries from the change feed. A different
    /// description within the same round is a negotiation error.
    pub async fn set_remote_description(&self, description: SessionDescription) -> Result<bool> {
        let _guard = self.negotiation.lock().await;
        self.ensure_open(Phase::ApplyRemoteDescription)?;
        match &self.state.lock().remote {
            Some(existing) if *existing == description => {
                debug!(conn = %self.id, "identical remote description ignored");
                return Ok(false);
            }
            Some(_) => {
                return Err(Error::negotiation(
                    Phase::ApplyRemoteDescription,
                    "conflicting remote description for this negotiation round",
                ));
            }
            None => {}
        }

        self.peer
            .set_remote_description(&description)
            .await
            .map_err(|e| backend_error(Phase::ApplyRemoteDescription, e))?;

        let pending = {
            let mut st = self.state.lock();
            st.remote = Some(description);
            st.take_pending()
        };
        if !pending.is_empty() {
            debug!(conn = %self.id, count = pending.len(), "flushing buffered candidates");
        }
        for candidate in pending {
            if let Err(e) = self.peer.add_ice_candidate(&candidate).await {
                warn!(conn = %self.id, candidate = %candidate.candidate, "failed to apply buffered candidate: {:#}", e);
            }
        }
        Ok(true)
    }

    /// Applies a remote candidate, or buffers it until the remote description
    /// is set.
    pub async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<CandidateDisposition> {
        let _guard = self.negotiation.lock().await;
        self.ensure_open(Phase::ApplyCandidate)?;
        let ready = self.state.lock().buffer_unless_ready(candidate);
        match ready {
            None => {
                debug!(conn = %self.id, "remote description not set yet, candidate queued");
                Ok(CandidateDisposition::Buffered)
            }
            Some(candidate) => {
                self.peer
                    .add_ice_candidate(&candidate)
                    .await
                    .map_err(|e| backend_error(Phase::ApplyCandidate, e))?;
                Ok(CandidateDisposition::Applied)
            }
        }
    }

    /// Hands back the published tracks so that closing this connection leaves
    /// them running for the next one.
    pub fn detach_local_tracks(&self) -> Vec<Arc<LocalTrack>> {
        std::mem::take(&mut self.state.lock().local_tracks)
    }

    /// Stops the published local tracks and closes the connection. Returns
    /// `false` if it was already closed.
    pub async fn close(&self) -> bool {
        let Some(tracks) = self.state.lock().close() else {
            return false;
        };
        for track in &tracks {
            track.stop();
        }
        if let Err(e) = self.peer.close().await {
            warn!(conn = %self.id, "closing peer connection failed: {:#}", e);
        }
        info!(conn = %self.id, stream = %self.stream_id, "connection closed");
        true
    }
}

/// Owns the live connection of every stream and the capture devices.
pub struct PeerConnectionManager {
    backend: Arc<dyn RtcBackend>,
    devices: Arc<dyn MediaDevices>,
    ice_servers: Vec<ServerConfig>,
    publish_retry: RetryPolicy,
    connections: Mutex<HashMap<String, Arc<Connection>>>,
}

impl PeerConnectionManager {
    pub fn new(
        backend: Arc<dyn RtcBackend>,
        devices: Arc<dyn MediaDevices>,
        config: &SignalingConfig,
    ) -> Self {
        Self {
            backend,
            devices,
            ice_servers: config.ice_servers.clone(),
            publish_retry: config.publish_retry.clone(),
            connections: Mutex::new(HashMap::new()),
        }
    }

    /// Opens a connection for `stream_id`, closing the previous one first.
    pub async fn open(&self, stream_id: &str) -> Result<Arc<Connection>> {
        let previous = self.connections.lock().remove(stream_id);
        if let Some(previous) = previous {
            info!(stream = %stream_id, conn = %previous.id(), "closing previous connection before reopening");
            previous.close().await;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let peer = self
            .backend
            .connect(stream_id, &self.ice_servers, tx)
            .await
            .map_err(|e| backend_error(Phase::OpenConnection, e))?;
        let conn = Arc::new(Connection::new(stream_id, peer, rx));
        info!(stream = %stream_id, conn = %conn.id(), "connection opened");
        self.connections
            .lock()
            .insert(stream_id.to_string(), conn.clone());
        Ok(conn)
    }

    pub async fn acquire_local_media(&self, constraints: &MediaConstraints) -> Result<MediaHandle> {
        let tracks = self.devices.acquire(constraints).await.map_err(|e| match e {
            AcquireError::PermissionDenied => Error::PermissionDenied,
            AcquireError::NotFound => Error::DeviceUnavailable,
            AcquireError::Other(reason) => Error::DeviceBusy(reason),
        })?;
        if tracks.is_empty() {
            return Err(Error::DeviceUnavailable);
        }
        debug!(count = tracks.len(), "local media acquired");
        Ok(MediaHandle::new(tracks))
    }

    /// Publishes every track of `media` on `conn`, retrying per the publish
    /// policy.
    pub async fn attach_local_tracks(&self, conn: &Connection, media: &MediaHandle) -> Result<()> {
        for track in media.tracks() {
            conn.ensure_open(Phase::PublishTracks)?;
            with_retry(&self.publish_retry, "publish track", || conn.peer.add_track(track))
                .await
                .map_err(|e| backend_error(Phase::PublishTracks, e))?;
            track.mark_sending();
            conn.state.lock().local_tracks.push(track.clone());
        }
        Ok(())
    }

    /// Closes `conn` and forgets it. Safe to call repeatedly.
    pub async fn close(&self, conn: &Arc<Connection>) {
        {
            let mut connections = self.connections.lock();
            if connections
                .get(conn.stream_id())
                .is_some_and(|current| Arc::ptr_eq(current, conn))
            {
                connections.remove(conn.stream_id());
            }
        }
        conn.close().await;
    }

    pub fn connection(&self, stream_id: &str) -> Option<Arc<Connection>> {
        self.connections.lock().get(stream_id).cloned()
    }

    pub fn open_connections(&self) -> usize {
        self.connections.lock().len()
    }

    pub async fn probe_ice_server(&self, server: &ServerConfig) -> bool {
        self.backend.probe(server).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::testing::{MockBackend, SyntheticDevices};

    fn manager() -> (PeerConnectionManager, Arc<MockBackend>, Arc<SyntheticDevices>) {
        let backend = Arc::new(MockBackend::manual());
        let devices = Arc::new(SyntheticDevices::new());
        let mut config = SignalingConfig::default();
        config.publish_retry.initial_backoff_ms = 1;
        let manager = PeerConnectionManager::new(backend.clone(), devices.clone(), &config);
        (manager, backend, devices)
    }

    #[tokio::test]
    async fn identical_remote_description_is_a_no_op() {
        let (manager, _, _) = manager();
        let conn = manager.open("room-1").await.unwrap();
        let offer = SessionDescription::offer("offer-1");

        assert!(conn.set_remote_description(offer.clone()).await.unwrap());
        assert!(!conn.set_remote_description(offer).await.unwrap());

        let err = conn
            .set_remote_description(SessionDescription::offer("offer-2"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NegotiationError);
    }

    #[tokio::test]
    async fn early_candidates_are_flushed_in_arrival_order() {
        let (manager, backend, _) = manager();
        let conn = manager.open("room-1").await.unwrap();
        for name in ["c1", "c2", "c3"] {
            let disposition = conn.add_ice_candidate(IceCandidate::new(name)).await.unwrap();
            assert_eq!(disposition, CandidateDisposition::Buffered);
        }
        let peer = backend.last_peer().unwrap();
        assert!(peer.applied_candidates().is_empty());

        conn.set_remote_description(SessionDescription::offer("offer-1"))
            .await
            .unwrap();
        let applied = conn.add_ice_candidate(IceCandidate::new("c4")).await.unwrap();
        assert_eq!(applied, CandidateDisposition::Applied);

        assert_eq!(peer.applied_names(), vec!["c1", "c2", "c3", "c4"]);
        assert_eq!(conn.pending_candidates(), 0);
    }

    #[tokio::test]
    async fn answer_requires_a_remote_offer() {
        let (manager, _, _) = manager();
        let conn = manager.open("room-1").await.unwrap();
        let err = conn.create_answer().await.unwrap_err();
        assert_eq!(err.phase(), Some(Phase::CreateAnswer));
    }

    #[tokio::test]
    async fn reopening_closes_the_previous_connection() {
        let (manager, backend, devices) = manager();
        let media = manager
            .acquire_local_media(&MediaConstraints::default())
            .await
            .unwrap();
        let first = manager.open("room-1").await.unwrap();
        manager.attach_local_tracks(&first, &media).await.unwrap();
        assert!(media.tracks().iter().all(|t| t.is_sending()));

        let second = manager.open("room-1").await.unwrap();
        assert!(first.is_closed());
        assert!(!second.is_closed());
        assert!(media.tracks().iter().all(|t| !t.is_live()));
        assert_eq!(backend.live_peers(), 1);
        assert_eq!(manager.open_connections(), 1);
        assert_eq!(devices.acquisitions(), 1);
    }

    #[tokio::test]
    async fn detached_tracks_survive_the_reopen() {
        let (manager, _, _) = manager();
        let media = manager
            .acquire_local_media(&MediaConstraints::default())
            .await
            .unwrap();
        let first = manager.open("room-1").await.unwrap();
        manager.attach_local_tracks(&first, &media).await.unwrap();

        assert_eq!(first.detach_local_tracks().len(), media.tracks().len());
        let second = manager.open("room-1").await.unwrap();
        assert!(first.is_closed());
        assert!(media.tracks().iter().all(|t| t.is_live()));

        manager.attach_local_tracks(&second, &media).await.unwrap();
        manager.close(&second).await;
        assert!(media.tracks().iter().all(|t| !t.is_live()));
    }

    #[tokio::test]
    async fn close_is_idempotent_and_rejects_further_negotiation() {
        let (manager, backend, _) = manager();
        let conn = manager.open("room-1").await.unwrap();
        manager.close(&conn).await;
        manager.close(&conn).await;
        assert_eq!(backend.live_peers(), 0);
        assert_eq!(manager.open_connections(), 0);
        assert_eq!(conn.connection_state(), ConnectionState::Closed);

        let err = conn.create_offer().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NegotiationError);
    }

    #[tokio::test]
    async fn publishing_retries_transient_failures() {
        let (manager, backend, _) = manager();
        backend.fail_next_track_adds(2);
        let media = manager
            .acquire_local_media(&MediaConstraints::default())
            .await
            .unwrap();
        let conn = manager.open("room-1").await.unwrap();
        manager.attach_local_tracks(&conn, &media).await.unwrap();
        assert_eq!(backend.last_peer().unwrap().track_count(), media.tracks().len());
    }

    #[tokio::test]
    async fn acquisition_failures_map_to_error_kinds() {
        let (manager, _, devices) = manager();
        devices.fail_with(|| AcquireError::PermissionDenied);
        let err = manager
            .acquire_local_media(&MediaConstraints::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);

        devices.fail_with(|| AcquireError::NotFound);
        let err = manager
            .acquire_local_media(&MediaConstraints::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DeviceUnavailable);

        devices.fail_with(|| AcquireError::Other("in use by another app".into()));
        let err = manager
            .acquire_local_media(&MediaConstraints::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DeviceBusy);
    }
}
