//! The low-level peer connection primitive.
//!
//! [`PeerConnectionManager`](crate::peer::PeerConnectionManager) layers the
//! buffering, idempotency and cleanup rules on top of these traits, so
//! implementations only translate calls to the underlying stack.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::peer::media::LocalTrack;
use crate::peer::types::{ConnectionState, IceCandidate, PeerEvent, ServerConfig, SessionDescription};

/// Factory for peer connections.
#[async_trait]
pub trait RtcBackend: Send + Sync {
    /// Opens a connection configured with `ice_servers`. Every callback the
    /// connection fires is forwarded on `events`.
    async fn connect(
        &self,
        stream_id: &str,
        ice_servers: &[ServerConfig],
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> anyhow::Result<Arc<dyn RtcPeer>>;

    /// Reports whether `server` hands out a candidate of its type in time.
    async fn probe(&self, server: &ServerConfig) -> bool;
}

#[async_trait]
pub trait RtcPeer: Send + Sync {
    async fn add_track(&self, track: &LocalTrack) -> anyhow::Result<()>;

    /// Creates an offer and installs it as the local description.
    async fn create_offer(&self) -> anyhow::Result<SessionDescription>;

    /// Creates an answer and installs it as the local description.
    async fn create_answer(&self) -> anyhow::Result<SessionDescription>;

    async fn set_remote_description(&self, description: &SessionDescription) -> anyhow::Result<()>;

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> anyhow::Result<()>;

    fn connection_state(&self) -> ConnectionState;

    async fn close(&self) -> anyhow::Result<()>;
}
