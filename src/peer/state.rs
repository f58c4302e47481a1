use std::collections::VecDeque;
use std::sync::Arc;

use crate::peer::media::LocalTrack;
use crate::peer::types::{ConnectionState, IceCandidate, SessionDescription};

/// Per-connection mutable state.
#[derive(Debug, Default)]
pub struct PeerState {
    /// Remote description applied in this negotiation round
    pub remote: Option<SessionDescription>,

    /// Candidates received before the remote description, in arrival order
    pub pending: VecDeque<IceCandidate>,

    /// Latest state reported by the connection
    pub connection_state: ConnectionState,

    /// Local tracks published on this connection
    pub local_tracks: Vec<Arc<LocalTrack>>,

    pub closed: bool,
}

impl PeerState {
    /// Queues `candidate` unless a remote description is present.
    /// Returns the candidate back when it can be applied right away.
    pub fn buffer_unless_ready(&mut self, candidate: IceCandidate) -> Option<IceCandidate> {
        if self.remote.is_some() {
            Some(candidate)
        } else {
            self.pending.push_back(candidate);
            None
        }
    }

    pub fn take_pending(&mut self) -> Vec<IceCandidate> {
        self.pending.drain(..).collect()
    }

    /// Marks the state closed and hands back the tracks to stop.
    /// Returns `None` if it was already closed.
    pub fn close(&mut self) -> Option<Vec<Arc<LocalTrack>>> {
        if self.closed {
            return None;
        }
        self.closed = true;
        self.connection_state = ConnectionState::Closed;
        self.pending.clear();
        Some(std::mem::take(&mut self.local_tracks))
    }
}
