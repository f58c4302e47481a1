//! The shared session record both peers signal through.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::peer::types::{IceCandidate, SessionDescription};

/// Which participant wrote a piece of the record.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    /// Host: offer and `offer_candidates`
    Offer,
    /// Viewer: answer and `answer_candidates`
    Answer,
}

/// Candidate tagged with the negotiation round it belongs to.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CandidateEntry {
    pub generation: u32,
    #[serde(flatten)]
    pub candidate: IceCandidate,
}

/// One row per stream. `offer_candidates`/`answer_candidates` only grow.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StreamSession {
    pub id: String,
    pub host_id: String,
    /// Bumped each time a new offer is written
    pub generation: u32,
    pub offer: Option<SessionDescription>,
    pub answer: Option<SessionDescription>,
    /// Viewer that wrote `answer`
    #[serde(default)]
    pub answered_by: Option<String>,
    pub offer_candidates: Vec<CandidateEntry>,
    pub answer_candidates: Vec<CandidateEntry>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StreamSession {
    pub fn new(id: impl Into<String>, host_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            host_id: host_id.into(),
            generation: 0,
            offer: None,
            answer: None,
            answered_by: None,
            offer_candidates: Vec::new(),
            answer_candidates: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn candidates(&self, side: Side) -> &[CandidateEntry] {
        match side {
            Side::Offer => &self.offer_candidates,
            Side::Answer => &self.answer_candidates,
        }
    }

    pub fn description(&self, side: Side) -> Option<&SessionDescription> {
        match side {
            Side::Offer => self.offer.as_ref(),
            Side::Answer => self.answer.as_ref(),
        }
    }
}

/// Position in one candidate list up to which entries have been handled.
///
/// The lists are append-only, so an index is stable across re-reads and a
/// repeated notification never yields an entry twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CandidateCursor {
    pub side: Side,
    pub generation: u32,
    pub consumed: usize,
}

impl CandidateCursor {
    pub fn new(side: Side, generation: u32) -> Self {
        Self {
            side,
            generation,
            consumed: 0,
        }
    }

    /// Starts past whatever is already in the list.
    pub fn at_end(side: Side, generation: u32, session: &StreamSession) -> Self {
        Self {
            side,
            generation,
            consumed: session.candidates(side).len(),
        }
    }

    /// Unseen candidates of this cursor's generation, in append order.
    /// Advances the cursor past everything returned or skipped.
    pub fn advance(&mut self, session: &StreamSession) -> Vec<IceCandidate> {
        let entries = session.candidates(self.side);
        if entries.len() <= self.consumed {
            return Vec::new();
        }
        let fresh = entries[self.consumed..]
            .iter()
            .filter(|e| e.generation == self.generation)
            .map(|e| e.candidate.clone())
            .collect();
        self.consumed = entries.len();
        fresh
    }
}
