//! Public entry point: start, join, end and renegotiate streams, and fetch
//! recordings.
//!
//! Calls for the same stream id are serialized, so a double-clicked "start"
//! produces one session row and one camera acquisition.

use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::SignalingConfig;
use crate::error::{Error, ErrorKind, Result};
use crate::peer::{
    LocalMedia, MediaDevices, PeerConnectionManager, RemoteMedia, RtcBackend, ServerConfig,
};
use crate::signaling::{Role, SignalingCoordinator, SignalingState, StreamContext};
use crate::store::{ChangeNotifier, RecordingStore, SessionStore, StreamMetadataStore};

/// External services a controller talks to.
pub struct Collaborators {
    pub sessions: Arc<dyn SessionStore>,
    pub notifier: Arc<dyn ChangeNotifier>,
    pub metadata: Arc<dyn StreamMetadataStore>,
    pub recordings: Arc<dyn RecordingStore>,
    pub backend: Arc<dyn RtcBackend>,
    pub devices: Arc<dyn MediaDevices>,
}

pub struct StreamLifecycleController {
    coordinator: SignalingCoordinator,
    metadata: Arc<dyn StreamMetadataStore>,
    recordings: Arc<dyn RecordingStore>,
    config: Arc<SignalingConfig>,
    streams: Mutex<HashMap<String, Arc<StreamContext>>>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl StreamLifecycleController {
    pub fn new(
        participant_id: &str,
        config: SignalingConfig,
        deps: Collaborators,
    ) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let peers = Arc::new(PeerConnectionManager::new(
            deps.backend,
            deps.devices,
            &config,
        ));
        let coordinator = SignalingCoordinator::new(
            participant_id,
            deps.sessions,
            deps.notifier,
            deps.metadata.clone(),
            peers,
            config.clone(),
        );
        Ok(Self {
            coordinator,
            metadata: deps.metadata,
            recordings: deps.recordings,
            config,
            streams: Mutex::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn participant_id(&self) -> &str {
        self.coordinator.participant_id()
    }

    fn stream_lock(&self, stream_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .entry(stream_id.to_string())
            .or_default()
            .clone()
    }

    fn context(&self, stream_id: &str) -> Option<Arc<StreamContext>> {
        self.streams.lock().get(stream_id).cloned()
    }

    /// Drops a leftover terminal context, releasing anything it still holds.
    async fn discard_terminal(&self, stream_id: &str) {
        let stale = {
            let mut streams = self.streams.lock();
            match streams.get(stream_id) {
                Some(ctx) if ctx.state().is_terminal() => streams.remove(stream_id),
                _ => None,
            }
        };
        if let Some(ctx) = stale {
            debug!(stream = %stream_id, state = %ctx.state(), "discarding finished context");
            self.coordinator.end(&ctx).await;
        }
    }

    /// Starts hosting `stream_id` and returns the local preview.
    ///
    /// Idempotent while the stream is live: a second call returns the same
    /// preview without touching the devices or the store.
    pub async fn start_stream(&self, stream_id: &str) -> Result<LocalMedia> {
        let lock = self.stream_lock(stream_id);
        let _guard = lock.lock().await;

        if let Some(ctx) = self.context(stream_id) {
            if !ctx.state().is_terminal() {
                return match ctx.role() {
                    Role::Host => {
                        debug!(stream = %stream_id, "stream already started");
                        ctx.local_media().ok_or(Error::DeviceUnavailable)
                    }
                    Role::Viewer => Err(Error::SessionConflict {
                        stream_id: stream_id.to_string(),
                        holder: format!("{} (as viewer)", self.participant_id()),
                    }),
                };
            }
        }
        self.discard_terminal(stream_id).await;

        let ctx = self.coordinator.start_host(stream_id).await?;
        let preview = ctx.local_media().ok_or(Error::DeviceUnavailable)?;
        if let Err(e) = self.metadata.mark_active(stream_id).await {
            warn!(stream = %stream_id, "marking stream active failed: {}", e);
            self.coordinator.end(&ctx).await;
            return Err(e.into());
        }
        self.streams
            .lock()
            .insert(stream_id.to_string(), ctx);
        info!(stream = %stream_id, participant = %self.participant_id(), "stream started");
        Ok(preview)
    }

    /// Joins `stream_id` as a viewer; resolves once connected.
    pub async fn join_stream(&self, stream_id: &str) -> Result<RemoteMedia> {
        let lock = self.stream_lock(stream_id);
        let _guard = lock.lock().await;

        if let Some(ctx) = self.context(stream_id) {
            if !ctx.state().is_terminal() {
                return match ctx.role() {
                    Role::Viewer => Ok(ctx.remote_media()),
                    Role::Host => Err(Error::SessionConflict {
                        stream_id: stream_id.to_string(),
                        holder: format!("{} (as host)", self.participant_id()),
                    }),
                };
            }
        }
        self.discard_terminal(stream_id).await;

        let ctx = self.coordinator.join_viewer(stream_id).await?;
        let remote = ctx.remote_media();
        self.streams
            .lock()
            .insert(stream_id.to_string(), ctx);
        info!(stream = %stream_id, participant = %self.participant_id(), "joined stream");
        Ok(remote)
    }

    /// Tears down everything held for `stream_id` and records the end of the
    /// stream. Safe to call repeatedly and for streams that never connected.
    pub async fn end_stream(&self, stream_id: &str) -> Result<()> {
        let lock = self.stream_lock(stream_id);
        let _guard = lock.lock().await;

        let ctx = self.streams.lock().remove(stream_id);
        let hosted = match &ctx {
            Some(ctx) => {
                self.coordinator.end(ctx).await;
                ctx.role() == Role::Host
            }
            None => true,
        };
        if hosted {
            self.metadata.mark_ended(stream_id, Utc::now()).await?;
        }
        self.forget_lock(stream_id, &lock);
        info!(stream = %stream_id, participant = %self.participant_id(), "stream ended");
        Ok(())
    }

    /// Drops the per-stream lock once nothing is held for the stream and no
    /// other call is waiting on it.
    fn forget_lock(&self, stream_id: &str, held: &Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.locks.lock();
        let idle = locks
            .get(stream_id)
            .is_some_and(|lock| Arc::ptr_eq(lock, held) && Arc::strong_count(lock) == 2);
        if idle && !self.streams.lock().contains_key(stream_id) {
            locks.remove(stream_id);
        }
    }

    /// Publishes a fresh offer for a hosted stream on a new connection. The
    /// viewer follows on its own when it sees the new round.
    pub async fn renegotiate(&self, stream_id: &str) -> Result<LocalMedia> {
        let lock = self.stream_lock(stream_id);
        let _guard = lock.lock().await;

        let previous = match self.context(stream_id) {
            Some(ctx) if ctx.role() == Role::Host => ctx,
            _ => return Err(Error::StreamNotStarted(stream_id.to_string())),
        };
        info!(stream = %stream_id, generation = previous.generation(), "renegotiating");
        self.coordinator.end(&previous).await;
        self.streams.lock().remove(stream_id);

        let ctx = match self.coordinator.start_host(stream_id).await {
            Ok(ctx) => ctx,
            Err(e) => {
                // Nobody hosts the stream any more, unless someone else took it
                if e.kind() != ErrorKind::SessionConflict {
                    if let Err(mark) = self.metadata.mark_ended(stream_id, Utc::now()).await {
                        warn!(stream = %stream_id, "marking stream ended failed: {}", mark);
                    }
                }
                return Err(e);
            }
        };
        let preview = ctx.local_media().ok_or(Error::DeviceUnavailable)?;
        self.streams
            .lock()
            .insert(stream_id.to_string(), ctx);
        Ok(preview)
    }

    /// Time-limited URL of the stream's recording.
    pub async fn fetch_recording_url(&self, stream_id: &str) -> Result<String> {
        self.recordings
            .signed_url(stream_id, self.config.recording_url_ttl())
            .await?
            .ok_or_else(|| Error::RecordingNotFound(stream_id.to_string()))
    }

    pub fn state(&self, stream_id: &str) -> Option<SignalingState> {
        self.context(stream_id).map(|ctx| ctx.state())
    }

    pub fn watch_state(&self, stream_id: &str) -> Option<watch::Receiver<SignalingState>> {
        self.context(stream_id).map(|ctx| ctx.watch_state())
    }

    pub fn local_media(&self, stream_id: &str) -> Option<LocalMedia> {
        self.context(stream_id).and_then(|ctx| ctx.local_media())
    }

    pub fn remote_media(&self, stream_id: &str) -> Option<RemoteMedia> {
        self.context(stream_id).map(|ctx| ctx.remote_media())
    }

    pub async fn probe_ice_server(&self, server: &ServerConfig) -> bool {
        self.coordinator.peers().probe_ice_server(server).await
    }

    /// Ends every stream this controller holds.
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.streams.lock().keys().cloned().collect();
        for id in ids {
            if let Err(e) = self.end_stream(&id).await {
                warn!(stream = %id, "ending stream during shutdown failed: {}", e);
            }
        }
    }
}
