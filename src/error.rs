//! Error taxonomy for media acquisition, negotiation and session persistence.
//!
//! Every failure surfaces as one [`Error`]: `Display` gives the human-readable
//! message and [`Error::kind`] the machine-checkable kind the UI layer matches on.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::store::StoreError;

pub type Result<T> = std::result::Result<T, Error>;

/// Negotiation phase in which a failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    AcquireMedia,
    OpenConnection,
    PublishTracks,
    CreateOffer,
    CreateAnswer,
    ApplyRemoteDescription,
    ApplyCandidate,
    PersistOffer,
    PersistAnswer,
    AwaitConnection,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::AcquireMedia => "acquire-media",
            Phase::OpenConnection => "open-connection",
            Phase::PublishTracks => "publish-tracks",
            Phase::CreateOffer => "create-offer",
            Phase::CreateAnswer => "create-answer",
            Phase::ApplyRemoteDescription => "apply-remote-description",
            Phase::ApplyCandidate => "apply-candidate",
            Phase::PersistOffer => "persist-offer",
            Phase::PersistAnswer => "persist-answer",
            Phase::AwaitConnection => "await-connection",
        };
        f.write_str(name)
    }
}

/// Machine-checkable error kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    PermissionDenied,
    DeviceUnavailable,
    DeviceBusy,
    NegotiationError,
    NegotiationTimeout,
    ConnectionFailed,
    StreamNotStarted,
    SessionConflict,
    SessionStoreError,
    RecordingNotFound,
    Config,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("camera or microphone access was denied")]
    PermissionDenied,

    #[error("no capture device is available")]
    DeviceUnavailable,

    #[error("capture device could not be acquired: {0}")]
    DeviceBusy(String),

    #[error("negotiation failed during {phase}: {reason}")]
    Negotiation { phase: Phase, reason: String },

    #[error("negotiation timed out during {phase} after {}s", .after.as_secs_f32())]
    NegotiationTimeout { phase: Phase, after: Duration },

    #[error("peer connection for stream {0} failed")]
    ConnectionFailed(String),

    #[error("stream {0} has not started yet")]
    StreamNotStarted(String),

    #[error("stream {stream_id} is held by {holder}")]
    SessionConflict { stream_id: String, holder: String },

    #[error("session store error: {0}")]
    SessionStore(#[from] StoreError),

    #[error("no recording exists for stream {0}")]
    RecordingNotFound(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    pub fn negotiation(phase: Phase, reason: impl fmt::Display) -> Self {
        Error::Negotiation {
            phase,
            reason: reason.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::PermissionDenied => ErrorKind::PermissionDenied,
            Error::DeviceUnavailable => ErrorKind::DeviceUnavailable,
            Error::DeviceBusy(_) => ErrorKind::DeviceBusy,
            Error::Negotiation { .. } => ErrorKind::NegotiationError,
            Error::NegotiationTimeout { .. } => ErrorKind::NegotiationTimeout,
            Error::ConnectionFailed(_) => ErrorKind::ConnectionFailed,
            Error::StreamNotStarted(_) => ErrorKind::StreamNotStarted,
            Error::SessionConflict { .. } => ErrorKind::SessionConflict,
            Error::SessionStore(_) => ErrorKind::SessionStoreError,
            Error::RecordingNotFound(_) => ErrorKind::RecordingNotFound,
            Error::Config(_) => ErrorKind::Config,
        }
    }

    /// Whether calling `start`/`join` again may succeed without user action.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::DeviceBusy(_)
            | Error::NegotiationTimeout { .. }
            | Error::ConnectionFailed(_)
            | Error::StreamNotStarted(_) => true,
            Error::SessionStore(e) => e.is_transient(),
            _ => false,
        }
    }

    /// Phase the failure belongs to, when one is known.
    pub fn phase(&self) -> Option<Phase> {
        match self {
            Error::PermissionDenied | Error::DeviceUnavailable | Error::DeviceBusy(_) => {
                Some(Phase::AcquireMedia)
            }
            Error::Negotiation { phase, .. } | Error::NegotiationTimeout { phase, .. } => {
                Some(*phase)
            }
            Error::ConnectionFailed(_) => Some(Phase::AwaitConnection),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_and_retryability() {
        let timeout = Error::NegotiationTimeout {
            phase: Phase::AwaitConnection,
            after: Duration::from_secs(15),
        };
        assert_eq!(timeout.kind(), ErrorKind::NegotiationTimeout);
        assert!(timeout.is_retryable());
        assert_eq!(timeout.to_string(), "negotiation timed out during await-connection after 15s");

        assert!(!Error::PermissionDenied.is_retryable());
        assert!(Error::StreamNotStarted("room-1".into()).is_retryable());
        assert_eq!(
            Error::SessionStore(StoreError::Unavailable("down".into())).kind(),
            ErrorKind::SessionStoreError
        );
        assert!(Error::SessionStore(StoreError::Unavailable("down".into())).is_retryable());
        assert!(!Error::SessionStore(StoreError::NotFound("x".into())).is_retryable());
    }

    #[test]
    fn negotiation_error_names_the_phase() {
        let err = Error::negotiation(Phase::CreateOffer, "connection closed");
        assert_eq!(err.phase(), Some(Phase::CreateOffer));
        assert_eq!(
            err.to_string(),
            "negotiation failed during create-offer: connection closed"
        );
        assert_eq!(Error::DeviceUnavailable.phase(), Some(Phase::AcquireMedia));
    }
}
