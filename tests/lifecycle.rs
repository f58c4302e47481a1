//! Start/join/end scenarios between participants sharing one session store.

mod common;

use chrono::Utc;
use common::{eventually, init_test_tracing, row, WAIT};
use std::time::Duration;
use stream_signal::peer::{AcquireError, ConnectionState, RemoteTrack, TrackKind};
use stream_signal::store::{SessionStore, StreamMetadataStore};
use stream_signal::testing::{MockBackend, SyntheticDevices, TestRig};
use stream_signal::{ErrorKind, SignalingState, ViewerMode};

#[tokio::test]
async fn viewer_gets_stream_not_started_until_the_host_offers() -> anyhow::Result<()> {
    init_test_tracing();
    let rig = TestRig::new();
    let alice = rig.participant("alice")?;
    let bob = rig.participant("bob")?;

    let err = bob.controller.join_stream("room-1").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::StreamNotStarted);
    assert!(err.is_retryable());

    // A row without an offer is still "not started"
    rig.sessions.get_or_create("room-1", "alice").await?;
    let err = bob.controller.join_stream("room-1").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::StreamNotStarted);
    assert_eq!(bob.backend.live_peers(), 0);

    alice.controller.start_stream("room-1").await?;
    bob.controller.join_stream("room-1").await?;
    assert_eq!(bob.controller.state("room-1"), Some(SignalingState::Connected));
    assert!(
        eventually(WAIT, || async {
            alice.controller.state("room-1") == Some(SignalingState::Connected)
        })
        .await
    );

    let session = row(&rig, "room-1").await;
    assert_eq!(session.host_id, "alice");
    assert!(session.answer.is_some());
    assert_eq!(rig.sessions.created_count(), 1);
    Ok(())
}

#[tokio::test]
async fn concurrent_starts_share_one_row_and_one_capture() -> anyhow::Result<()> {
    init_test_tracing();
    let rig = TestRig::new();
    let alice = rig.participant_with(
        "alice",
        MockBackend::new(),
        SyntheticDevices::with_delay(Duration::from_millis(50)),
    )?;

    let (first, second) = tokio::join!(
        alice.controller.start_stream("room-1"),
        alice.controller.start_stream("room-1")
    );
    let (first, second) = (first?, second?);

    assert_eq!(alice.devices.acquisitions(), 1);
    assert_eq!(rig.sessions.created_count(), 1);
    assert_eq!(alice.backend.peers().len(), 1);
    let ids = |media: &stream_signal::LocalMedia| {
        media
            .tracks()
            .iter()
            .map(|t| t.id().to_string())
            .collect::<Vec<_>>()
    };
    assert_eq!(ids(&first), ids(&second));
    assert_eq!(row(&rig, "room-1").await.generation, 1);
    Ok(())
}

#[tokio::test]
async fn end_stream_is_idempotent_and_leaves_nothing_live() -> anyhow::Result<()> {
    init_test_tracing();
    let rig = TestRig::new();
    let alice = rig.participant("alice")?;
    let bob = rig.participant("bob")?;

    let preview = alice.controller.start_stream("room-1").await?;
    bob.controller.join_stream("room-1").await?;
    assert!(rig.metadata.status("room-1").await?.unwrap().is_active);

    alice.controller.end_stream("room-1").await?;
    let status = rig.metadata.status("room-1").await?.unwrap();
    alice.controller.end_stream("room-1").await?;

    assert!(!preview.is_live());
    assert!(preview.tracks().iter().all(|t| !t.is_sending()));
    assert_eq!(alice.backend.live_peers(), 0);
    assert!(alice.controller.state("room-1").is_none());

    let again = rig.metadata.status("room-1").await?.unwrap();
    assert!(!again.is_active);
    assert!(again.ended_at.is_some());
    assert_eq!(again.ended_at, status.ended_at);

    bob.controller.end_stream("room-1").await?;
    assert_eq!(bob.backend.live_peers(), 0);

    // Never started here at all
    alice.controller.end_stream("room-9").await?;
    Ok(())
}

#[tokio::test]
async fn failed_connection_releases_everything_and_restart_is_clean() -> anyhow::Result<()> {
    init_test_tracing();
    let rig = TestRig::new();
    let alice = rig.participant_with("alice", MockBackend::manual(), SyntheticDevices::new())?;

    let preview = alice.controller.start_stream("room-1").await?;
    assert_eq!(
        alice.controller.state("room-1"),
        Some(SignalingState::AwaitingAnswer)
    );
    alice
        .backend
        .last_peer()
        .unwrap()
        .emit_state(ConnectionState::Failed);

    assert!(
        eventually(WAIT, || async {
            matches!(alice.controller.state("room-1"), Some(SignalingState::Failed(_)))
        })
        .await
    );
    assert!(!preview.is_live());
    assert_eq!(alice.backend.live_peers(), 0);

    // No automatic retry; an explicit start begins from scratch
    let restarted = alice.controller.start_stream("room-1").await?;
    assert!(restarted.is_live());
    assert_eq!(alice.devices.acquisitions(), 2);
    assert_eq!(alice.backend.live_peers(), 1);
    assert_eq!(row(&rig, "room-1").await.generation, 2);
    Ok(())
}

#[tokio::test]
async fn join_times_out_when_the_connection_never_comes_up() -> anyhow::Result<()> {
    init_test_tracing();
    let rig = TestRig::new();
    let alice = rig.participant("alice")?;
    let bob = rig.participant_with("bob", MockBackend::manual(), SyntheticDevices::new())?;

    alice.controller.start_stream("room-1").await?;
    let err = bob.controller.join_stream("room-1").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NegotiationTimeout);
    assert!(err.is_retryable());
    assert_eq!(bob.backend.live_peers(), 0);
    assert!(bob.controller.state("room-1").is_none());
    Ok(())
}

#[tokio::test]
async fn join_can_be_retried_after_a_timeout() -> anyhow::Result<()> {
    init_test_tracing();
    let rig = TestRig::new();
    let alice = rig.participant("alice")?;
    let bob = rig.participant_with("bob", MockBackend::manual(), SyntheticDevices::new())?;

    alice.controller.start_stream("room-1").await?;
    let err = bob.controller.join_stream("room-1").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NegotiationTimeout);
    assert!(err.is_retryable());

    bob.backend.set_auto_connect(true);
    bob.controller.join_stream("room-1").await?;

    // The host drops the dead answer and negotiates a new round with the retry
    assert!(
        eventually(WAIT, || async {
            let session = row(&rig, "room-1").await;
            let answer = bob.backend.last_peer().and_then(|p| p.local_description());
            let applied = alice.backend.last_peer().and_then(|p| p.remote_description());
            session.generation >= 2
                && session.answer.is_some()
                && session.answer == answer
                && applied == answer
                && bob.controller.state("room-1") == Some(SignalingState::Connected)
                && alice.controller.state("room-1") == Some(SignalingState::Connected)
        })
        .await
    );
    assert_eq!(row(&rig, "room-1").await.answered_by.as_deref(), Some("bob"));
    assert_eq!(alice.backend.live_peers(), 1);
    assert_eq!(bob.backend.live_peers(), 1);
    Ok(())
}

#[tokio::test]
async fn joining_an_ended_stream_leaves_the_row_alone() -> anyhow::Result<()> {
    init_test_tracing();
    let rig = TestRig::new();
    let alice = rig.participant("alice")?;
    let bob = rig.participant("bob")?;

    alice.controller.start_stream("room-1").await?;
    alice.controller.end_stream("room-1").await?;
    let ended = row(&rig, "room-1").await;
    assert!(ended.offer.is_some());

    let err = bob.controller.join_stream("room-1").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::StreamNotStarted);
    assert!(bob.backend.peers().is_empty());
    let after = row(&rig, "room-1").await;
    assert!(after.answer.is_none());
    assert_eq!(after, ended);
    Ok(())
}

#[tokio::test]
async fn second_viewer_cannot_take_an_answered_round() -> anyhow::Result<()> {
    init_test_tracing();
    let rig = TestRig::new();
    let alice = rig.participant("alice")?;
    let bob = rig.participant("bob")?;
    let dave = rig.participant("dave")?;

    alice.controller.start_stream("room-1").await?;
    bob.controller.join_stream("room-1").await?;
    let answered = row(&rig, "room-1").await;

    let err = dave.controller.join_stream("room-1").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SessionConflict);
    assert!(!err.is_retryable());
    assert_eq!(dave.backend.live_peers(), 0);
    assert!(dave.controller.state("room-1").is_none());

    let session = row(&rig, "room-1").await;
    assert_eq!(session.generation, answered.generation);
    assert_eq!(session.answer, answered.answer);
    assert_eq!(session.answered_by.as_deref(), Some("bob"));
    assert_ne!(
        dave.backend.last_peer().unwrap().local_description(),
        session.answer
    );
    assert_eq!(alice.controller.state("room-1"), Some(SignalingState::Connected));
    assert_eq!(bob.controller.state("room-1"), Some(SignalingState::Connected));
    Ok(())
}

#[tokio::test]
async fn denied_permission_fails_start_without_leaking() -> anyhow::Result<()> {
    init_test_tracing();
    let rig = TestRig::new();
    let alice = rig.participant("alice")?;

    alice.devices.fail_with(|| AcquireError::PermissionDenied);
    let err = alice.controller.start_stream("room-1").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PermissionDenied);
    assert!(!err.is_retryable());
    assert!(alice.backend.peers().is_empty());
    assert!(rig.metadata.status("room-1").await?.is_none());

    alice.devices.succeed();
    alice.controller.start_stream("room-1").await?;
    assert_eq!(alice.backend.live_peers(), 1);
    Ok(())
}

#[tokio::test]
async fn second_host_is_refused_while_the_stream_is_live() -> anyhow::Result<()> {
    init_test_tracing();
    let rig = TestRig::new();
    let alice = rig.participant("alice")?;
    let carol = rig.participant("carol")?;

    alice.controller.start_stream("room-1").await?;
    let err = carol.controller.start_stream("room-1").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SessionConflict);
    assert_eq!(carol.backend.live_peers(), 0);
    assert!(carol.devices.acquisitions() <= 1);
    assert_eq!(row(&rig, "room-1").await.host_id, "alice");

    // Once ended, the row can be taken over
    alice.controller.end_stream("room-1").await?;
    carol.controller.start_stream("room-1").await?;
    let session = row(&rig, "room-1").await;
    assert_eq!(session.host_id, "carol");
    assert_eq!(session.generation, 2);
    Ok(())
}

#[tokio::test]
async fn recording_urls_are_signed_and_missing_ones_reported() -> anyhow::Result<()> {
    init_test_tracing();
    let rig = TestRig::new();
    let alice = rig.participant("alice")?;
    rig.recordings.insert("room-1", "rooms/room-1.webm");

    let url = alice.controller.fetch_recording_url("room-1").await?;
    assert!(url.contains("rooms/room-1.webm"));
    assert!(rig.recordings.verify(&url, Utc::now()));

    let err = alice
        .controller
        .fetch_recording_url("room-2")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RecordingNotFound);
    Ok(())
}

#[tokio::test]
async fn viewer_follows_a_host_renegotiation() -> anyhow::Result<()> {
    init_test_tracing();
    let rig = TestRig::new();
    let alice = rig.participant("alice")?;
    let bob = rig.participant("bob")?;

    let before = alice.controller.start_stream("room-1").await?;
    bob.controller.join_stream("room-1").await?;

    let after = alice.controller.renegotiate("room-1").await?;
    assert!(!before.is_live());
    assert!(after.is_live());

    assert!(
        eventually(WAIT, || async {
            let session = row(&rig, "room-1").await;
            session.generation == 2 && session.answer.is_some()
        })
        .await
    );
    assert!(
        eventually(WAIT, || async {
            bob.backend.peers().len() == 2
                && bob.controller.state("room-1") == Some(SignalingState::Connected)
                && alice.controller.state("room-1") == Some(SignalingState::Connected)
        })
        .await
    );
    assert_eq!(bob.backend.live_peers(), 1);
    assert_eq!(alice.backend.live_peers(), 1);
    Ok(())
}

#[tokio::test]
async fn two_way_viewer_publishes_and_releases_its_own_media() -> anyhow::Result<()> {
    init_test_tracing();
    let rig = TestRig::new();
    let alice = rig.participant("alice")?;
    let mut config = rig.config.clone();
    config.viewer_mode = ViewerMode::TwoWay;
    let bob = rig.participant_configured("bob", MockBackend::new(), SyntheticDevices::new(), config)?;

    alice.controller.start_stream("room-1").await?;
    bob.controller.join_stream("room-1").await?;
    let own = bob.controller.local_media("room-1").expect("viewer media");
    assert!(own.tracks().iter().all(|t| t.is_sending()));
    assert_eq!(bob.devices.acquisitions(), 1);
    assert_eq!(bob.backend.last_peer().unwrap().track_count(), 2);

    bob.controller.end_stream("room-1").await?;
    assert!(!own.is_live());
    // A viewer leaving does not end the host's stream
    assert!(rig.metadata.status("room-1").await?.unwrap().is_active);
    Ok(())
}

#[tokio::test]
async fn remote_tracks_reach_the_viewer() -> anyhow::Result<()> {
    init_test_tracing();
    let rig = TestRig::new();
    let alice = rig.participant("alice")?;
    let bob = rig.participant("bob")?;

    alice.controller.start_stream("room-1").await?;
    let remote = bob.controller.join_stream("room-1").await?;
    let peer = bob.backend.last_peer().unwrap();
    peer.emit_track(RemoteTrack::new("cam-1", TrackKind::Video, "room-1"));
    peer.emit_track(RemoteTrack::new("mic-1", TrackKind::Audio, "room-1"));

    assert!(eventually(WAIT, || async { remote.tracks().len() == 2 }).await);

    bob.controller.end_stream("room-1").await?;
    assert!(remote.tracks().is_empty());
    Ok(())
}
