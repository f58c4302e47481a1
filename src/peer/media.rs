//! Local capture tracks and remote track bookkeeping.
//!
//! Local tracks are owned by the participant that acquired them and must be
//! stopped on every exit path; [`MediaHandle`] stops them on drop. Remote tracks
//! are only ever observed.

use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

/// What to request from the capture devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

/// Raw failure reported by a capture backend.
#[derive(Debug, Error)]
pub enum AcquireError {
    #[error("permission denied")]
    PermissionDenied,
    #[error("no matching capture device")]
    NotFound,
    #[error("{0}")]
    Other(String),
}

/// Camera/microphone access. The host application supplies the implementation.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn acquire(
        &self,
        constraints: &MediaConstraints,
    ) -> std::result::Result<Vec<LocalTrack>, AcquireError>;
}

/// One captured audio or video track, publishable on a peer connection.
pub struct LocalTrack {
    id: String,
    kind: TrackKind,
    rtc: Arc<TrackLocalStaticSample>,
    live: AtomicBool,
    sending: AtomicBool,
}

impl LocalTrack {
    pub fn new(kind: TrackKind, id: impl Into<String>, stream_label: impl Into<String>) -> Self {
        let id = id.into();
        let mime_type = match kind {
            TrackKind::Audio => MIME_TYPE_OPUS,
            TrackKind::Video => MIME_TYPE_VP8,
        };
        let rtc = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: mime_type.to_owned(),
                ..Default::default()
            },
            id.clone(),
            stream_label.into(),
        ));
        Self {
            id,
            kind,
            rtc,
            live: AtomicBool::new(true),
            sending: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    /// Sample writer for the capture pipeline.
    pub fn rtc(&self) -> Arc<TrackLocalStaticSample> {
        self.rtc.clone()
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    pub fn is_sending(&self) -> bool {
        self.sending.load(Ordering::Acquire)
    }

    pub(crate) fn mark_sending(&self) {
        self.sending.store(true, Ordering::Release);
    }

    /// Feeds one encoded frame from the capture pipeline. Returns `false`
    /// once the track is stopped.
    pub async fn write_sample(&self, data: Bytes, duration: Duration) -> anyhow::Result<bool> {
        if !self.is_live() {
            return Ok(false);
        }
        self.rtc
            .write_sample(&Sample {
                data,
                duration,
                ..Default::default()
            })
            .await
            .with_context(|| format!("writing sample to track {}", self.id))?;
        Ok(true)
    }

    /// Stops capture and publishing. Safe to call more than once.
    pub fn stop(&self) {
        self.sending.store(false, Ordering::Release);
        if self.live.swap(false, Ordering::AcqRel) {
            tracing::debug!(track = %self.id, kind = ?self.kind, "local track stopped");
        }
    }
}

impl fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("live", &self.is_live())
            .field("sending", &self.is_sending())
            .finish()
    }
}

/// Owning handle over acquired local tracks; stops them when dropped.
#[derive(Debug)]
pub struct MediaHandle {
    tracks: Vec<Arc<LocalTrack>>,
}

impl MediaHandle {
    pub fn new(tracks: Vec<LocalTrack>) -> Self {
        Self {
            tracks: tracks.into_iter().map(Arc::new).collect(),
        }
    }

    pub fn tracks(&self) -> &[Arc<LocalTrack>] {
        &self.tracks
    }

    /// Non-owning view for local preview rendering.
    pub fn preview(&self) -> LocalMedia {
        LocalMedia {
            tracks: self.tracks.clone(),
        }
    }

    pub fn release(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

impl Drop for MediaHandle {
    fn drop(&mut self) {
        self.release();
    }
}

/// Local tracks as seen by the UI for preview; does not own them.
#[derive(Debug, Clone)]
pub struct LocalMedia {
    tracks: Vec<Arc<LocalTrack>>,
}

impl LocalMedia {
    pub fn tracks(&self) -> &[Arc<LocalTrack>] {
        &self.tracks
    }

    pub fn is_live(&self) -> bool {
        self.tracks.iter().any(|t| t.is_live())
    }
}

/// A track published by the remote side.
#[derive(Clone)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: TrackKind,
    pub stream_label: String,
    rtc: Option<Arc<TrackRemote>>,
}

impl RemoteTrack {
    pub fn new(id: impl Into<String>, kind: TrackKind, stream_label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            stream_label: stream_label.into(),
            rtc: None,
        }
    }

    pub(crate) fn with_rtc(mut self, rtc: Arc<TrackRemote>) -> Self {
        self.rtc = Some(rtc);
        self
    }

    /// RTP reader, present when the track came from a webrtc connection.
    pub fn rtc(&self) -> Option<Arc<TrackRemote>> {
        self.rtc.clone()
    }
}

impl fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("stream_label", &self.stream_label)
            .finish()
    }
}

/// Remote tracks for one stream, filled in as the remote side publishes.
#[derive(Clone)]
pub struct RemoteMedia {
    tracks: Arc<watch::Sender<Vec<RemoteTrack>>>,
}

impl RemoteMedia {
    pub(crate) fn new() -> Self {
        let (tx, _) = watch::channel(Vec::new());
        Self {
            tracks: Arc::new(tx),
        }
    }

    pub fn tracks(&self) -> Vec<RemoteTrack> {
        self.tracks.borrow().clone()
    }

    /// Receiver that wakes whenever a track arrives or the set is cleared.
    pub fn subscribe(&self) -> watch::Receiver<Vec<RemoteTrack>> {
        self.tracks.subscribe()
    }

    pub(crate) fn push(&self, track: RemoteTrack) {
        self.tracks.send_modify(|tracks| {
            if !tracks.iter().any(|t| t.id == track.id) {
                tracks.push(track);
            }
        });
    }

    pub(crate) fn clear(&self) {
        self.tracks.send_modify(|tracks| tracks.clear());
    }
}

impl fmt::Debug for RemoteMedia {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteMedia")
            .field("tracks", &*self.tracks.borrow())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dropping_the_handle_stops_tracks() {
        let handle = MediaHandle::new(vec![
            LocalTrack::new(TrackKind::Audio, "mic", "room-1"),
            LocalTrack::new(TrackKind::Video, "cam", "room-1"),
        ]);
        let preview = handle.preview();
        handle.tracks()[0].mark_sending();
        assert!(preview.is_live());

        drop(handle);
        assert!(!preview.is_live());
        assert!(preview.tracks().iter().all(|t| !t.is_sending()));
    }

    #[tokio::test]
    async fn stopped_tracks_take_no_samples() {
        let track = LocalTrack::new(TrackKind::Audio, "mic", "room-1");
        let frame = Bytes::from_static(&[0xf8, 0xff, 0xfe]);
        assert!(track
            .write_sample(frame.clone(), Duration::from_millis(20))
            .await
            .unwrap());

        track.stop();
        assert!(!track
            .write_sample(frame, Duration::from_millis(20))
            .await
            .unwrap());
    }

    #[test]
    fn remote_tracks_are_deduplicated_by_id() {
        let media = RemoteMedia::new();
        media.push(RemoteTrack::new("v1", TrackKind::Video, "room-1"));
        media.push(RemoteTrack::new("v1", TrackKind::Video, "room-1"));
        media.push(RemoteTrack::new("a1", TrackKind::Audio, "room-1"));
        assert_eq!(media.tracks().len(), 2);

        media.clear();
        assert!(media.tracks().is_empty());
    }
}
