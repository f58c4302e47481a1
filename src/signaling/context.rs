//! Per-stream signaling context: the state machine value and every resource
//! owned on behalf of one stream.

use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::info;

use crate::error::{Error, ErrorKind, Phase};
use crate::peer::{Connection, LocalMedia, MediaHandle, RemoteMedia};

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Host,
    Viewer,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Role::Host => "host",
            Role::Viewer => "viewer",
        })
    }
}

/// Why a context ended up in [`SignalingState::Failed`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub kind: ErrorKind,
    pub message: String,
}

impl Failure {
    pub fn from_error(error: &Error) -> Self {
        Self {
            kind: error.kind(),
            message: error.to_string(),
        }
    }

    /// Error handed to a caller still waiting on the context.
    pub(crate) fn to_error(&self, stream_id: &str) -> Error {
        match self.kind {
            ErrorKind::ConnectionFailed => Error::ConnectionFailed(stream_id.to_string()),
            _ => Error::negotiation(Phase::AwaitConnection, &self.message),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SignalingState {
    #[default]
    Idle,
    Initializing,
    OfferCreated,
    AwaitingOffer,
    AnswerCreated,
    AwaitingAnswer,
    Connected,
    /// Connection dropped, waiting out the grace period.
    Recovering,
    Ended,
    Failed(Failure),
}

impl SignalingState {
    pub fn failed(error: &Error) -> Self {
        SignalingState::Failed(Failure::from_error(error))
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SignalingState::Ended | SignalingState::Failed(_))
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, SignalingState::Connected)
    }
}

impl fmt::Display for SignalingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalingState::Idle => f.write_str("idle"),
            SignalingState::Initializing => f.write_str("initializing"),
            SignalingState::OfferCreated => f.write_str("offer-created"),
            SignalingState::AwaitingOffer => f.write_str("awaiting-offer"),
            SignalingState::AnswerCreated => f.write_str("answer-created"),
            SignalingState::AwaitingAnswer => f.write_str("awaiting-answer"),
            SignalingState::Connected => f.write_str("connected"),
            SignalingState::Recovering => f.write_str("recovering"),
            SignalingState::Ended => f.write_str("ended"),
            SignalingState::Failed(failure) => write!(f, "failed ({})", failure.message),
        }
    }
}

/// Everything one participant holds for one stream: the connection, local
/// capture, remote tracks and the driver task reacting to store and peer events.
pub struct StreamContext {
    stream_id: String,
    role: Role,
    state: watch::Sender<SignalingState>,
    generation: AtomicU32,
    connection: Mutex<Option<Arc<Connection>>>,
    local_media: Mutex<Option<MediaHandle>>,
    remote_media: RemoteMedia,
    pub(crate) driver: Mutex<Option<JoinHandle<()>>>,
    pub(crate) shutdown: Notify,
}

impl StreamContext {
    pub(crate) fn new(stream_id: &str, role: Role) -> Arc<Self> {
        let (state, _) = watch::channel(SignalingState::Idle);
        Arc::new(Self {
            stream_id: stream_id.to_string(),
            role,
            state,
            generation: AtomicU32::new(0),
            connection: Mutex::new(None),
            local_media: Mutex::new(None),
            remote_media: RemoteMedia::new(),
            driver: Mutex::new(None),
            shutdown: Notify::new(),
        })
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> SignalingState {
        self.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<SignalingState> {
        self.state.subscribe()
    }

    /// Negotiation round this context currently takes part in.
    pub fn generation(&self) -> u32 {
        self.generation.load(Ordering::Acquire)
    }

    pub(crate) fn set_generation(&self, generation: u32) {
        self.generation.store(generation, Ordering::Release);
    }

    /// Moves to `next`. `Ended` is final, and `Failed` only gives way to `Ended`.
    pub(crate) fn set_state(&self, next: SignalingState) {
        let mut from = None;
        self.state.send_if_modified(|current| {
            let allowed = match current {
                SignalingState::Ended => false,
                SignalingState::Failed(_) => next == SignalingState::Ended,
                _ => *current != next,
            };
            if allowed {
                from = Some(std::mem::replace(current, next.clone()));
            }
            allowed
        });
        if let Some(from) = from {
            info!(stream = %self.stream_id, role = %self.role, %from, to = %next, "signaling state changed");
        }
    }

    pub fn connection(&self) -> Option<Arc<Connection>> {
        self.connection.lock().clone()
    }

    pub(crate) fn set_connection(&self, conn: Arc<Connection>) -> Option<Arc<Connection>> {
        self.connection.lock().replace(conn)
    }

    pub(crate) fn take_connection(&self) -> Option<Arc<Connection>> {
        self.connection.lock().take()
    }

    /// Preview of the local tracks, if this participant publishes any.
    pub fn local_media(&self) -> Option<LocalMedia> {
        self.local_media.lock().as_ref().map(MediaHandle::preview)
    }

    /// Installs `media`; a handle it replaces is dropped, which stops its tracks.
    pub(crate) fn set_local_media(&self, media: MediaHandle) {
        let previous = self.local_media.lock().replace(media);
        drop(previous);
    }

    pub(crate) fn take_local_media(&self) -> Option<MediaHandle> {
        self.local_media.lock().take()
    }

    pub fn remote_media(&self) -> RemoteMedia {
        self.remote_media.clone()
    }
}

impl fmt::Debug for StreamContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamContext")
            .field("stream_id", &self.stream_id)
            .field("role", &self.role)
            .field("state", &*self.state.borrow())
            .field("generation", &self.generation())
            .finish()
    }
}
