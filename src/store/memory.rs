//! In-process session store, change feed and stream metadata.
//!
//! Suitable for a single process hosting both roles (tests, local demos) and
//! as a reference for adapters over a hosted database.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::broadcast;
use tracing::debug;

use super::{
    ChangeNotifier, SessionChanged, SessionStore, StoreError, StoreResult, StreamMetadataStore,
    StreamStatus, Subscription,
};
use crate::peer::types::{IceCandidate, SessionDescription};
use crate::session::{CandidateEntry, Side, StreamSession};

const FEED_CAPACITY: usize = 64;

#[derive(Default)]
pub struct MemorySessionStore {
    rows: Mutex<HashMap<String, StreamSession>>,
    feeds: Mutex<HashMap<String, broadcast::Sender<SessionChanged>>>,
    created: AtomicUsize,
    fail_appends: AtomicBool,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of rows ever created.
    pub fn created_count(&self) -> usize {
        self.created.load(Ordering::Acquire)
    }

    /// Makes candidate appends fail with `Unavailable` while set.
    pub fn set_append_failures(&self, on: bool) {
        self.fail_appends.store(on, Ordering::Release);
    }

    fn feed(&self, id: &str) -> broadcast::Sender<SessionChanged> {
        self.feeds
            .lock()
            .entry(id.to_string())
            .or_insert_with(|| broadcast::channel(FEED_CAPACITY).0)
            .clone()
    }

    fn publish(&self, id: &str) {
        // No receivers is fine: nobody is waiting on this row.
        let _ = self.feed(id).send(SessionChanged {
            session_id: id.to_string(),
        });
    }

    fn update<T>(
        &self,
        id: &str,
        f: impl FnOnce(&mut StreamSession) -> StoreResult<T>,
    ) -> StoreResult<T> {
        let out = {
            let mut rows = self.rows.lock();
            let row = rows
                .get_mut(id)
                .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
            let out = f(row)?;
            row.updated_at = Utc::now();
            out
        };
        self.publish(id);
        Ok(out)
    }

    fn append(
        &self,
        id: &str,
        side: Side,
        generation: u32,
        candidate: IceCandidate,
    ) -> StoreResult<()> {
        if self.fail_appends.load(Ordering::Acquire) {
            return Err(StoreError::Unavailable("candidate append rejected".into()));
        }
        self.update(id, |row| {
            let entry = CandidateEntry {
                generation,
                candidate,
            };
            match side {
                Side::Offer => row.offer_candidates.push(entry),
                Side::Answer => row.answer_candidates.push(entry),
            }
            Ok(())
        })
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn get(&self, id: &str) -> StoreResult<Option<StreamSession>> {
        Ok(self.rows.lock().get(id).cloned())
    }

    async fn get_or_create(&self, id: &str, host_id: &str) -> StoreResult<StreamSession> {
        let mut rows = self.rows.lock();
        if let Some(existing) = rows.get(id) {
            return Ok(existing.clone());
        }
        let row = StreamSession::new(id, host_id);
        rows.insert(id.to_string(), row.clone());
        self.created.fetch_add(1, Ordering::AcqRel);
        debug!(session = %id, host = %host_id, "session row created");
        Ok(row)
    }

    async fn update_offer(
        &self,
        id: &str,
        host_id: &str,
        offer: SessionDescription,
    ) -> StoreResult<StreamSession> {
        self.update(id, |row| {
            row.generation += 1;
            row.host_id = host_id.to_string();
            row.offer = Some(offer);
            row.answer = None;
            row.answered_by = None;
            Ok(row.clone())
        })
    }

    async fn update_answer(
        &self,
        id: &str,
        generation: u32,
        viewer_id: &str,
        answer: SessionDescription,
    ) -> StoreResult<StreamSession> {
        self.update(id, |row| {
            if row.offer.is_none() {
                return Err(StoreError::AnswerBeforeOffer(id.to_string()));
            }
            if row.generation != generation {
                return Err(StoreError::StaleGeneration {
                    stream_id: id.to_string(),
                    expected: generation,
                    actual: row.generation,
                });
            }
            match &row.answered_by {
                Some(holder) if row.answer.is_some() && holder != viewer_id => {
                    return Err(StoreError::AlreadyAnswered {
                        stream_id: id.to_string(),
                        viewer: holder.clone(),
                    });
                }
                _ => {
                    row.answer = Some(answer);
                    row.answered_by = Some(viewer_id.to_string());
                }
            }
            Ok(row.clone())
        })
    }

    async fn withdraw_answer(&self, id: &str, generation: u32, viewer_id: &str) -> StoreResult<bool> {
        let cleared = {
            let mut rows = self.rows.lock();
            let row = rows
                .get_mut(id)
                .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
            let held = row.generation == generation
                && row.answer.is_some()
                && row.answered_by.as_deref() == Some(viewer_id);
            if held {
                row.answer = None;
                row.answered_by = None;
                row.updated_at = Utc::now();
            }
            held
        };
        if cleared {
            debug!(session = %id, generation, viewer = %viewer_id, "answer withdrawn");
            self.publish(id);
        }
        Ok(cleared)
    }

    async fn append_offer_candidate(
        &self,
        id: &str,
        generation: u32,
        candidate: IceCandidate,
    ) -> StoreResult<()> {
        self.append(id, Side::Offer, generation, candidate)
    }

    async fn append_answer_candidate(
        &self,
        id: &str,
        generation: u32,
        candidate: IceCandidate,
    ) -> StoreResult<()> {
        self.append(id, Side::Answer, generation, candidate)
    }
}

impl ChangeNotifier for MemorySessionStore {
    fn subscribe(&self, session_id: &str) -> Subscription {
        Subscription::new(session_id, self.feed(session_id).subscribe())
    }
}

#[derive(Default)]
pub struct MemoryMetadataStore {
    streams: Mutex<HashMap<String, StreamStatus>>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StreamMetadataStore for MemoryMetadataStore {
    async fn status(&self, stream_id: &str) -> StoreResult<Option<StreamStatus>> {
        Ok(self.streams.lock().get(stream_id).cloned())
    }

    async fn mark_active(&self, stream_id: &str) -> StoreResult<()> {
        let mut streams = self.streams.lock();
        let status = streams.entry(stream_id.to_string()).or_default();
        status.is_active = true;
        status.ended_at = None;
        Ok(())
    }

    async fn mark_ended(&self, stream_id: &str, at: DateTime<Utc>) -> StoreResult<()> {
        let mut streams = self.streams.lock();
        let status = streams.entry(stream_id.to_string()).or_default();
        status.is_active = false;
        status.ended_at.get_or_insert(at);
        Ok(())
    }
}
