//! External collaborators: the session record store, its change feed, stream
//! metadata and recorded media.

pub mod memory;
pub mod recording;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::peer::types::{IceCandidate, SessionDescription};
use crate::session::StreamSession;

pub use memory::{MemoryMetadataStore, MemorySessionStore};
pub use recording::SignedRecordingStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("session {0} does not exist")]
    NotFound(String),

    #[error("session {0} has no offer to answer")]
    AnswerBeforeOffer(String),

    #[error("session {stream_id} moved to generation {actual} (expected {expected})")]
    StaleGeneration {
        stream_id: String,
        expected: u32,
        actual: u32,
    },

    #[error("session {stream_id} was already answered by {viewer} in this round")]
    AlreadyAnswered { stream_id: String, viewer: String },

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Durable per-stream signaling record.
///
/// The offer belongs to the host and the answer of each generation to the
/// first viewer that writes it; the candidate lists are append-only. Host and
/// viewer never overwrite each other's values.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, id: &str) -> StoreResult<Option<StreamSession>>;

    /// Returns the existing row untouched if one exists.
    async fn get_or_create(&self, id: &str, host_id: &str) -> StoreResult<StreamSession>;

    /// Starts a new negotiation round: bumps the generation, clears the answer.
    async fn update_offer(
        &self,
        id: &str,
        host_id: &str,
        offer: SessionDescription,
    ) -> StoreResult<StreamSession>;

    /// Sets the answer of `generation`. The viewer already holding the round
    /// may replace its own answer; anyone else gets `AlreadyAnswered`.
    async fn update_answer(
        &self,
        id: &str,
        generation: u32,
        viewer_id: &str,
        answer: SessionDescription,
    ) -> StoreResult<StreamSession>;

    /// Clears the answer of `generation` if `viewer_id` wrote it, so the round
    /// is free for another attempt. Returns whether anything was cleared.
    async fn withdraw_answer(&self, id: &str, generation: u32, viewer_id: &str) -> StoreResult<bool>;

    async fn append_offer_candidate(
        &self,
        id: &str,
        generation: u32,
        candidate: IceCandidate,
    ) -> StoreResult<()>;

    async fn append_answer_candidate(
        &self,
        id: &str,
        generation: u32,
        candidate: IceCandidate,
    ) -> StoreResult<()>;
}

/// Notification that a session row was updated. Carries no payload; readers
/// always re-fetch the row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionChanged {
    pub session_id: String,
}

/// Push side of the store: at-least-once notification on every row update.
pub trait ChangeNotifier: Send + Sync {
    fn subscribe(&self, session_id: &str) -> Subscription;
}

/// Live subscription to one session's change feed. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    session_id: String,
    rx: broadcast::Receiver<SessionChanged>,
}

impl Subscription {
    pub fn new(session_id: impl Into<String>, rx: broadcast::Receiver<SessionChanged>) -> Self {
        Self {
            session_id: session_id.into(),
            rx,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Waits for the next change. Missed notifications collapse into one,
    /// since the reader pulls the whole row anyway. `None` once the feed closes.
    pub async fn recv(&mut self) -> Option<()> {
        match self.rx.recv().await {
            Ok(_) => Some(()),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::debug!(session = %self.session_id, skipped, "change feed lagged");
                Some(())
            }
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }

    pub fn unsubscribe(self) {
        tracing::debug!(session = %self.session_id, "unsubscribed from change feed");
    }
}

/// The `is_active`/`ended_at` part of the externally owned stream record.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct StreamStatus {
    pub is_active: bool,
    pub ended_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait StreamMetadataStore: Send + Sync {
    async fn status(&self, stream_id: &str) -> StoreResult<Option<StreamStatus>>;

    async fn mark_active(&self, stream_id: &str) -> StoreResult<()>;

    /// Keeps the first `ended_at` when called repeatedly.
    async fn mark_ended(&self, stream_id: &str, at: DateTime<Utc>) -> StoreResult<()>;
}

/// Object storage for recorded streams.
#[async_trait]
pub trait RecordingStore: Send + Sync {
    /// Time-limited URL for the recording of `stream_id`, `None` if there is none.
    async fn signed_url(&self, stream_id: &str, ttl: Duration) -> StoreResult<Option<String>>;
}
