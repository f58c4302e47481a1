//! The task that keeps one stream's negotiation moving once the initial
//! offer/answer step is done.
//!
//! It reacts to three sources: change notifications on the session row
//! (always answered by re-reading the whole row), events from the peer
//! connection, and the grace-period timer while recovering.

use std::ops::ControlFlow;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

use super::context::{SignalingState, StreamContext};
use super::{Role, SignalingCoordinator};
use crate::error::Error;
use crate::peer::ice::classify_candidates;
use crate::peer::{Connection, ConnectionState, IceCandidate, PeerEvent};
use crate::session::{CandidateCursor, StreamSession};
use crate::store::Subscription;

pub(crate) struct Driver {
    pub(crate) coordinator: SignalingCoordinator,
    pub(crate) ctx: Arc<StreamContext>,
    pub(crate) subscription: Subscription,
    pub(crate) events: mpsc::UnboundedReceiver<PeerEvent>,
    pub(crate) conn: Arc<Connection>,
    /// Position in the remote side's candidate list.
    pub(crate) cursor: CandidateCursor,
    pub(crate) grace_deadline: Option<Instant>,
    /// Local candidates of the current connection, for the gathering summary.
    pub(crate) gathered: Vec<IceCandidate>,
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl Driver {
    pub(crate) async fn run(mut self) {
        debug!(stream = %self.ctx.stream_id(), role = %self.ctx.role(), "signaling driver started");

        // Anything written between the subscription and now was not notified
        let mut flow = self.sync().await;
        while flow.is_continue() {
            let grace = self.grace_deadline;
            flow = tokio::select! {
                _ = self.ctx.shutdown.notified() => ControlFlow::Break(()),
                changed = self.subscription.recv() => match changed {
                    Some(()) => self.sync().await,
                    None => {
                        warn!(stream = %self.ctx.stream_id(), "change feed closed");
                        ControlFlow::Break(())
                    }
                },
                event = self.events.recv() => match event {
                    Some(event) => self.on_peer_event(event).await,
                    None => {
                        debug!(stream = %self.ctx.stream_id(), "peer event stream ended");
                        ControlFlow::Break(())
                    }
                },
                _ = sleep_until_opt(grace) => self.on_grace_expired().await,
            };
        }

        let Driver {
            ctx, subscription, ..
        } = self;
        subscription.unsubscribe();
        debug!(stream = %ctx.stream_id(), role = %ctx.role(), "signaling driver stopped");
    }

    /// Pulls the current row and applies whatever is new in it.
    async fn sync(&mut self) -> ControlFlow<()> {
        let session = match self.coordinator.sessions.get(self.ctx.stream_id()).await {
            Ok(Some(session)) => session,
            Ok(None) => {
                warn!(stream = %self.ctx.stream_id(), "session row is gone");
                return ControlFlow::Continue(());
            }
            Err(e) => {
                // Next notification triggers another read
                warn!(stream = %self.ctx.stream_id(), "re-reading session failed: {}", e);
                return ControlFlow::Continue(());
            }
        };
        match self.ctx.role() {
            Role::Host => self.sync_host(session).await,
            Role::Viewer => self.sync_viewer(session).await,
        }
    }

    async fn sync_host(&mut self, session: StreamSession) -> ControlFlow<()> {
        if session.generation != self.ctx.generation() {
            // Only another host writes offers while we are driving this round
            let holder = session.host_id.clone();
            return self
                .fail(Error::SessionConflict {
                    stream_id: session.id,
                    holder,
                })
                .await;
        }

        match (self.conn.remote_description(), session.answer.clone()) {
            (None, Some(answer)) => match self.conn.set_remote_description(answer).await {
                Ok(true) => info!(
                    stream = %session.id,
                    generation = session.generation,
                    viewer = session.answered_by.as_deref().unwrap_or("-"),
                    "remote answer applied"
                ),
                Ok(false) => {}
                Err(e) => return self.fail(e).await,
            },
            (Some(applied), Some(answer)) if applied == answer => {}
            // The viewer withdrew or replaced its answer: the applied one is dead
            (Some(_), _) => return self.restart_round(&session).await,
            (None, None) => {}
        }
        self.apply_remote_candidates(&session).await;
        ControlFlow::Continue(())
    }

    /// Publishes a fresh offer on a new connection, keeping the local media.
    async fn restart_round(&mut self, session: &StreamSession) -> ControlFlow<()> {
        info!(
            stream = %session.id,
            generation = session.generation,
            "answer of this round changed, offering again"
        );
        self.grace_deadline = None;
        let (conn, cursor, events) = match self.coordinator.restart_round(&self.ctx).await {
            Ok(restarted) => restarted,
            Err(e) => return self.fail(e).await,
        };
        self.conn = conn;
        self.events = events;
        self.cursor = cursor;
        self.gathered.clear();
        ControlFlow::Continue(())
    }

    async fn sync_viewer(&mut self, session: StreamSession) -> ControlFlow<()> {
        let current = self.ctx.generation();
        if session.generation > current && session.offer.is_some() {
            return self.follow_renegotiation(session).await;
        }
        if session.generation == current {
            self.apply_remote_candidates(&session).await;
        }
        ControlFlow::Continue(())
    }

    async fn apply_remote_candidates(&mut self, session: &StreamSession) {
        for candidate in self.cursor.advance(session) {
            if let Err(e) = self.conn.add_ice_candidate(candidate).await {
                warn!(stream = %session.id, "remote candidate rejected: {}", e);
            }
        }
    }

    /// The host published a new offer: answer it on a fresh connection.
    async fn follow_renegotiation(&mut self, session: StreamSession) -> ControlFlow<()> {
        info!(
            stream = %session.id,
            from = self.ctx.generation(),
            to = session.generation,
            "host renegotiated, answering the new offer"
        );
        self.ctx.set_state(SignalingState::AwaitingOffer);
        self.ctx.remote_media().clear();
        self.grace_deadline = None;

        let answered = self.coordinator.answer_latest_offer(&self.ctx, session.clone()).await;
        let (conn, cursor) = match answered {
            Ok(answered) => answered,
            Err(e) => return self.fail(e).await,
        };
        let Some(events) = conn.take_events() else {
            return self
                .fail(Error::ConnectionFailed(session.id.clone()))
                .await;
        };
        self.conn = conn;
        self.events = events;
        self.cursor = cursor;
        self.gathered.clear();
        ControlFlow::Continue(())
    }

    async fn on_peer_event(&mut self, event: PeerEvent) -> ControlFlow<()> {
        match event {
            PeerEvent::LocalCandidate(candidate) => {
                self.gathered.push(candidate.clone());
                self.coordinator.publish_candidate(&self.ctx, candidate).await;
                ControlFlow::Continue(())
            }
            PeerEvent::GatheringComplete => {
                debug!(stream = %self.ctx.stream_id(), "local candidate gathering complete");
                classify_candidates(&self.gathered);
                ControlFlow::Continue(())
            }
            PeerEvent::Track(track) => {
                info!(stream = %self.ctx.stream_id(), track = %track.id, kind = ?track.kind, "remote track attached");
                self.ctx.remote_media().push(track);
                ControlFlow::Continue(())
            }
            PeerEvent::StateChanged(state) => self.on_connection_state(state).await,
        }
    }

    async fn on_connection_state(&mut self, state: ConnectionState) -> ControlFlow<()> {
        self.conn.record_state(state);
        match state {
            ConnectionState::Connected => {
                if self.grace_deadline.take().is_some() {
                    info!(stream = %self.ctx.stream_id(), "connection recovered within the grace period");
                }
                self.ctx.set_state(SignalingState::Connected);
                ControlFlow::Continue(())
            }
            ConnectionState::Disconnected => {
                if self.grace_deadline.is_none() {
                    let grace = self.coordinator.config.grace_period();
                    warn!(stream = %self.ctx.stream_id(), ?grace, "connection lost, waiting for it to recover");
                    self.grace_deadline = Some(Instant::now() + grace);
                    self.ctx.set_state(SignalingState::Recovering);
                }
                ControlFlow::Continue(())
            }
            ConnectionState::Failed => {
                let stream_id = self.ctx.stream_id().to_string();
                self.fail(Error::ConnectionFailed(stream_id)).await
            }
            ConnectionState::Closed if self.conn.is_closed() => ControlFlow::Break(()),
            ConnectionState::Closed => {
                let stream_id = self.ctx.stream_id().to_string();
                self.fail(Error::ConnectionFailed(stream_id)).await
            }
            ConnectionState::New | ConnectionState::Connecting => ControlFlow::Continue(()),
        }
    }

    async fn on_grace_expired(&mut self) -> ControlFlow<()> {
        self.grace_deadline = None;
        if self.conn.connection_state() == ConnectionState::Connected {
            return ControlFlow::Continue(());
        }
        warn!(stream = %self.ctx.stream_id(), "connection did not recover within the grace period");
        let stream_id = self.ctx.stream_id().to_string();
        self.fail(Error::ConnectionFailed(stream_id)).await
    }

    /// Releases everything and parks the context in `Failed`. No automatic retry.
    async fn fail(&mut self, error: Error) -> ControlFlow<()> {
        error!(stream = %self.ctx.stream_id(), role = %self.ctx.role(), "signaling failed: {}", error);
        self.coordinator.release(&self.ctx).await;
        self.ctx.set_state(SignalingState::failed(&error));
        ControlFlow::Break(())
    }
}
