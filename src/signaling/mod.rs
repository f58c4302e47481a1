//! Offer/answer/candidate exchange through the shared session store.
//!
//! The host writes an offer and trickles its candidates into the session row;
//! the viewer reads the offer, writes an answer and trickles its own. Each side
//! learns about the other's writes through a change notification and then
//! pulls the whole row, so a missed or duplicated notification costs one
//! extra read and nothing else.

mod context;
mod driver;

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::{SignalingConfig, ViewerMode};
use crate::error::{Error, Phase, Result};
use crate::peer::{
    Connection, IceCandidate, MediaConstraints, MediaHandle, PeerConnectionManager, PeerEvent,
};
use crate::session::{CandidateCursor, Side, StreamSession};
use crate::store::{ChangeNotifier, SessionStore, StoreError, StreamMetadataStore};

pub use context::{Failure, Role, SignalingState, StreamContext};
use driver::Driver;

/// How long a driver gets to finish its current step when asked to stop.
const DRIVER_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Answers attempted when the host keeps publishing newer offers meanwhile.
const MAX_ANSWER_ATTEMPTS: u32 = 3;

/// Runs the host and viewer protocols for one participant.
#[derive(Clone)]
pub struct SignalingCoordinator {
    participant_id: Arc<str>,
    pub(crate) sessions: Arc<dyn SessionStore>,
    notifier: Arc<dyn ChangeNotifier>,
    metadata: Arc<dyn StreamMetadataStore>,
    peers: Arc<PeerConnectionManager>,
    pub(crate) config: Arc<SignalingConfig>,
}

impl SignalingCoordinator {
    pub fn new(
        participant_id: &str,
        sessions: Arc<dyn SessionStore>,
        notifier: Arc<dyn ChangeNotifier>,
        metadata: Arc<dyn StreamMetadataStore>,
        peers: Arc<PeerConnectionManager>,
        config: Arc<SignalingConfig>,
    ) -> Self {
        Self {
            participant_id: participant_id.into(),
            sessions,
            notifier,
            metadata,
            peers,
            config,
        }
    }

    pub fn participant_id(&self) -> &str {
        &self.participant_id
    }

    pub fn peers(&self) -> &PeerConnectionManager {
        &self.peers
    }

    /// Host side: capture, publish and offer. Returns once the offer is
    /// persisted; the connection completes in the background.
    pub async fn start_host(&self, stream_id: &str) -> Result<Arc<StreamContext>> {
        let ctx = StreamContext::new(stream_id, Role::Host);
        ctx.set_state(SignalingState::Initializing);
        match self.negotiate_host(&ctx).await {
            Ok(driver) => {
                self.spawn_driver(&ctx, driver);
                Ok(ctx)
            }
            Err(e) => {
                warn!(stream = %stream_id, "starting stream failed: {}", e);
                self.release(&ctx).await;
                ctx.set_state(SignalingState::failed(&e));
                Err(e)
            }
        }
    }

    async fn negotiate_host(&self, ctx: &Arc<StreamContext>) -> Result<Driver> {
        let stream_id = ctx.stream_id();
        let media = self
            .peers
            .acquire_local_media(&MediaConstraints::default())
            .await?;
        let conn = self.peers.open(stream_id).await?;
        ctx.set_connection(conn.clone());

        let session = self
            .sessions
            .get_or_create(stream_id, &self.participant_id)
            .await?;
        self.ensure_host_may_publish(&session).await?;
        let subscription = self.notifier.subscribe(stream_id);

        self.peers.attach_local_tracks(&conn, &media).await?;
        ctx.set_local_media(media);

        let (cursor, events) = self.publish_offer(ctx, &conn).await?;
        Ok(Driver {
            coordinator: self.clone(),
            ctx: ctx.clone(),
            subscription,
            events,
            conn,
            cursor,
            grace_deadline: None,
            gathered: Vec::new(),
        })
    }

    /// Offers on `conn` as the next negotiation round and waits for the answer.
    async fn publish_offer(
        &self,
        ctx: &StreamContext,
        conn: &Connection,
    ) -> Result<(CandidateCursor, mpsc::UnboundedReceiver<PeerEvent>)> {
        let stream_id = ctx.stream_id();
        let offer = conn.create_offer().await?;
        ctx.set_state(SignalingState::OfferCreated);
        let session = self
            .sessions
            .update_offer(stream_id, &self.participant_id, offer)
            .await?;
        ctx.set_generation(session.generation);
        info!(stream = %stream_id, generation = session.generation, "offer published");

        let cursor = CandidateCursor::at_end(Side::Answer, session.generation, &session);
        let events = conn
            .take_events()
            .ok_or_else(|| Error::negotiation(Phase::OpenConnection, "peer events already taken"))?;
        ctx.set_state(SignalingState::AwaitingAnswer);
        Ok((cursor, events))
    }

    /// Host side: starts a new round on a fresh connection that publishes the
    /// media already captured.
    pub(crate) async fn restart_round(
        &self,
        ctx: &StreamContext,
    ) -> Result<(
        Arc<Connection>,
        CandidateCursor,
        mpsc::UnboundedReceiver<PeerEvent>,
    )> {
        let media = ctx.take_local_media().ok_or(Error::DeviceUnavailable)?;
        let reopened = self.reopen_publishing(ctx, &media).await;
        ctx.set_local_media(media);
        let conn = reopened?;
        let (cursor, events) = self.publish_offer(ctx, &conn).await?;
        Ok((conn, cursor, events))
    }

    async fn reopen_publishing(
        &self,
        ctx: &StreamContext,
        media: &MediaHandle,
    ) -> Result<Arc<Connection>> {
        if let Some(previous) = ctx.connection() {
            previous.detach_local_tracks();
        }
        let conn = self.peers.open(ctx.stream_id()).await?;
        if let Some(previous) = ctx.set_connection(conn.clone()) {
            self.peers.close(&previous).await;
        }
        self.peers.attach_local_tracks(&conn, media).await?;
        Ok(conn)
    }

    /// A row held by another participant may only be taken over once its
    /// stream is no longer live.
    async fn ensure_host_may_publish(&self, session: &StreamSession) -> Result<()> {
        if *session.host_id == *self.participant_id {
            return Ok(());
        }
        let live = self
            .metadata
            .status(&session.id)
            .await?
            .is_some_and(|status| status.is_active);
        if live {
            return Err(Error::SessionConflict {
                stream_id: session.id.clone(),
                holder: session.host_id.clone(),
            });
        }
        debug!(stream = %session.id, previous = %session.host_id, "taking over an inactive session");
        Ok(())
    }

    /// Viewer side: answer the stored offer and wait until connected, bounded
    /// by the connect timeout.
    pub async fn join_viewer(&self, stream_id: &str) -> Result<Arc<StreamContext>> {
        let ctx = StreamContext::new(stream_id, Role::Viewer);
        ctx.set_state(SignalingState::AwaitingOffer);
        let driver = match self.negotiate_viewer(&ctx).await {
            Ok(driver) => driver,
            Err(e) => {
                warn!(stream = %stream_id, "joining stream failed: {}", e);
                self.release(&ctx).await;
                ctx.set_state(SignalingState::failed(&e));
                return Err(e);
            }
        };
        self.spawn_driver(&ctx, driver);

        if let Err(e) = self.await_connected(&ctx).await {
            warn!(stream = %stream_id, "joining stream failed: {}", e);
            self.stop_driver(&ctx).await;
            self.release(&ctx).await;
            self.withdraw_answer(&ctx).await;
            ctx.set_state(SignalingState::failed(&e));
            return Err(e);
        }
        Ok(ctx)
    }

    async fn negotiate_viewer(&self, ctx: &Arc<StreamContext>) -> Result<Driver> {
        let stream_id = ctx.stream_id();
        let subscription = self.notifier.subscribe(stream_id);
        let session = self.offered_session(stream_id).await?;

        let (conn, cursor) = self.answer_latest_offer(ctx, session).await?;
        let events = conn
            .take_events()
            .ok_or_else(|| Error::negotiation(Phase::OpenConnection, "peer events already taken"))?;
        Ok(Driver {
            coordinator: self.clone(),
            ctx: ctx.clone(),
            subscription,
            events,
            conn,
            cursor,
            grace_deadline: None,
            gathered: Vec::new(),
        })
    }

    /// The row of a live stream, with an offer to answer.
    async fn offered_session(&self, stream_id: &str) -> Result<StreamSession> {
        let session = self
            .sessions
            .get(stream_id)
            .await?
            .filter(|session| session.offer.is_some())
            .ok_or_else(|| Error::StreamNotStarted(stream_id.to_string()))?;
        let live = self
            .metadata
            .status(stream_id)
            .await?
            .is_some_and(|status| status.is_active);
        if !live {
            debug!(stream = %stream_id, generation = session.generation, "offer left over from a stream that is not live");
            return Err(Error::StreamNotStarted(stream_id.to_string()));
        }
        Ok(session)
    }

    /// Answers `session`, re-reading the row if the host moved on to a newer
    /// round while the answer was being made.
    pub(crate) async fn answer_latest_offer(
        &self,
        ctx: &StreamContext,
        mut session: StreamSession,
    ) -> Result<(Arc<Connection>, CandidateCursor)> {
        let mut attempts = 1;
        loop {
            match self.answer_offer(ctx, &session).await {
                Err(Error::SessionStore(StoreError::StaleGeneration { actual, .. }))
                    if attempts < MAX_ANSWER_ATTEMPTS =>
                {
                    attempts += 1;
                    debug!(stream = %ctx.stream_id(), generation = actual, "offer superseded, answering the newer one");
                    session = self.offered_session(ctx.stream_id()).await?;
                }
                answered => return answered,
            }
        }
    }

    /// Opens a fresh connection, applies the offer with the candidates stored
    /// so far and persists the answer for the session's current generation.
    async fn answer_offer(
        &self,
        ctx: &StreamContext,
        session: &StreamSession,
    ) -> Result<(Arc<Connection>, CandidateCursor)> {
        let stream_id = ctx.stream_id();
        let offer = session
            .offer
            .clone()
            .ok_or_else(|| Error::StreamNotStarted(stream_id.to_string()))?;

        let conn = self.peers.open(stream_id).await?;
        if let Some(previous) = ctx.set_connection(conn.clone()) {
            self.peers.close(&previous).await;
        }
        if self.config.viewer_mode == ViewerMode::TwoWay {
            let media = self
                .peers
                .acquire_local_media(&MediaConstraints::default())
                .await?;
            self.peers.attach_local_tracks(&conn, &media).await?;
            ctx.set_local_media(media);
        }

        conn.set_remote_description(offer).await?;
        let mut cursor = CandidateCursor::new(Side::Offer, session.generation);
        for candidate in cursor.advance(session) {
            if let Err(e) = conn.add_ice_candidate(candidate).await {
                warn!(stream = %stream_id, "remote candidate rejected: {}", e);
            }
        }

        let answer = conn.create_answer().await?;
        ctx.set_generation(session.generation);
        self.sessions
            .update_answer(stream_id, session.generation, &self.participant_id, answer)
            .await
            .map_err(|e| match e {
                StoreError::AlreadyAnswered { stream_id, viewer } => Error::SessionConflict {
                    stream_id,
                    holder: viewer,
                },
                other => other.into(),
            })?;
        ctx.set_state(SignalingState::AnswerCreated);
        info!(stream = %stream_id, generation = session.generation, "answer published");
        Ok((conn, cursor))
    }

    /// Frees the round a failed join had answered, so the host can start over.
    async fn withdraw_answer(&self, ctx: &StreamContext) {
        let stream_id = ctx.stream_id();
        match self
            .sessions
            .withdraw_answer(stream_id, ctx.generation(), &self.participant_id)
            .await
        {
            Ok(true) => info!(stream = %stream_id, generation = ctx.generation(), "answer withdrawn"),
            Ok(false) => {}
            Err(e) => warn!(stream = %stream_id, "withdrawing answer failed: {}", e),
        }
    }

    async fn await_connected(&self, ctx: &StreamContext) -> Result<()> {
        let after = self.config.connect_timeout();
        let mut states = ctx.watch_state();
        let reached = timeout(
            after,
            states.wait_for(|state| state.is_connected() || state.is_terminal()),
        )
        .await;
        let state = match reached {
            Err(_) => {
                return Err(Error::NegotiationTimeout {
                    phase: Phase::AwaitConnection,
                    after,
                })
            }
            Ok(Err(_)) => return Err(Error::ConnectionFailed(ctx.stream_id().to_string())),
            Ok(Ok(state)) => state.clone(),
        };
        match state {
            SignalingState::Failed(failure) => Err(failure.to_error(ctx.stream_id())),
            SignalingState::Ended => Err(Error::negotiation(
                Phase::AwaitConnection,
                "stream was ended while connecting",
            )),
            _ => Ok(()),
        }
    }

    /// Trickles a local candidate into the row. A failed append loses only
    /// that candidate; negotiation carries on with the rest.
    pub(crate) async fn publish_candidate(&self, ctx: &StreamContext, candidate: IceCandidate) {
        let stream_id = ctx.stream_id();
        let generation = ctx.generation();
        let appended = match ctx.role() {
            Role::Host => {
                self.sessions
                    .append_offer_candidate(stream_id, generation, candidate)
                    .await
            }
            Role::Viewer => {
                self.sessions
                    .append_answer_candidate(stream_id, generation, candidate)
                    .await
            }
        };
        if let Err(e) = appended {
            warn!(stream = %stream_id, role = %ctx.role(), "storing local candidate failed, continuing without it: {}", e);
        }
    }

    fn spawn_driver(&self, ctx: &Arc<StreamContext>, driver: Driver) {
        let handle = tokio::spawn(driver.run());
        if let Some(previous) = ctx.driver.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Asks the driver to stop after its current step and waits for it.
    pub(crate) async fn stop_driver(&self, ctx: &StreamContext) {
        let handle = ctx.driver.lock().take();
        let Some(mut handle) = handle else {
            return;
        };
        ctx.shutdown.notify_one();
        if timeout(DRIVER_STOP_TIMEOUT, &mut handle).await.is_err() {
            warn!(stream = %ctx.stream_id(), "signaling driver did not stop in time, aborting it");
            handle.abort();
        }
    }

    /// Stops local tracks, closes the connection and drops remote tracks.
    /// Safe to call repeatedly.
    pub(crate) async fn release(&self, ctx: &StreamContext) {
        if let Some(media) = ctx.take_local_media() {
            media.release();
        }
        if let Some(conn) = ctx.take_connection() {
            self.peers.close(&conn).await;
        }
        ctx.remote_media().clear();
    }

    /// Ends the context: driver stopped, resources released, state `Ended`.
    pub async fn end(&self, ctx: &StreamContext) {
        self.stop_driver(ctx).await;
        self.release(ctx).await;
        ctx.set_state(SignalingState::Ended);
    }
}
