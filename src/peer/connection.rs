//! webrtc-rs implementation of the peer connection primitive.

use anyhow::Context;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::logger::{dump_candidate, dump_selected_pair};
use crate::peer::backend::{RtcBackend, RtcPeer};
use crate::peer::ice::{check_ice_server_availability, to_rtc_ice_servers};
use crate::peer::media::{LocalTrack, RemoteTrack, TrackKind};
use crate::peer::types::{
    ConnectionState, IceCandidate, PeerEvent, SdpType, ServerConfig, SessionDescription,
};

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Backend over a shared webrtc-rs `API` with the default codecs and interceptors.
pub struct WebRtcBackend {
    api: API,
}

impl WebRtcBackend {
    pub fn new() -> anyhow::Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .context("registering default codecs")?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .context("registering default interceptors")?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self { api })
    }
}

fn rtc_config(ice_servers: &[ServerConfig]) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: to_rtc_ice_servers(ice_servers),
        ice_candidate_pool_size: 10,
        bundle_policy: RTCBundlePolicy::MaxBundle,
        rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
        ..Default::default()
    }
}

fn map_state(state: RTCPeerConnectionState) -> ConnectionState {
    match state {
        RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
        RTCPeerConnectionState::Connected => ConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => ConnectionState::Failed,
        RTCPeerConnectionState::Closed => ConnectionState::Closed,
        _ => ConnectionState::New,
    }
}

fn to_candidate(cand: &RTCIceCandidate) -> Option<IceCandidate> {
    cand.to_json().ok().map(|init| IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    })
}

fn remote_track(track: &Arc<TrackRemote>) -> RemoteTrack {
    let kind = match track.kind() {
        RTPCodecType::Audio => TrackKind::Audio,
        _ => TrackKind::Video,
    };
    RemoteTrack::new(track.id(), kind, track.stream_id()).with_rtc(track.clone())
}

#[async_trait]
impl RtcBackend for WebRtcBackend {
    async fn connect(
        &self,
        stream_id: &str,
        ice_servers: &[ServerConfig],
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> anyhow::Result<Arc<dyn RtcPeer>> {
        let pc = Arc::new(
            self.api
                .new_peer_connection(rtc_config(ice_servers))
                .await
                .context("creating peer connection")?,
        );

        let tx = events.clone();
        pc.on_ice_candidate(Box::new(move |cand: Option<RTCIceCandidate>| {
            match cand {
                Some(c) => {
                    dump_candidate("LOCAL", &c);
                    if let Some(candidate) = to_candidate(&c) {
                        let _ = tx.send(PeerEvent::LocalCandidate(candidate));
                    }
                }
                None => {
                    debug!("ICE candidate gathering completed");
                    let _ = tx.send(PeerEvent::GatheringComplete);
                }
            }
            Box::pin(async {})
        }));

        pc.on_ice_gathering_state_change(Box::new(move |state| {
            debug!(?state, "ICE gathering state changed");
            Box::pin(async {})
        }));

        let tx = events.clone();
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            info!(track = %track.id(), kind = %track.kind(), "remote track arrived");
            let _ = tx.send(PeerEvent::Track(remote_track(&track)));
            Box::pin(async {})
        }));

        let tx = events;
        let pc_stats = Arc::downgrade(&pc);
        let label = stream_id.to_string();
        pc.on_peer_connection_state_change(Box::new(move |st: RTCPeerConnectionState| {
            info!(stream = %label, state = %st, "peer connection state changed");
            if matches!(
                st,
                RTCPeerConnectionState::Disconnected | RTCPeerConnectionState::Failed
            ) {
                if let Some(pc) = pc_stats.upgrade() {
                    tokio::spawn(async move {
                        dump_selected_pair(&pc, "BEFORE-FAIL").await;
                    });
                }
            }
            let _ = tx.send(PeerEvent::StateChanged(map_state(st)));
            Box::pin(async {})
        }));

        Ok(Arc::new(WebRtcPeer { pc }))
    }

    async fn probe(&self, server: &ServerConfig) -> bool {
        check_ice_server_availability(&self.api, server, PROBE_TIMEOUT).await
    }
}

pub struct WebRtcPeer {
    pc: Arc<RTCPeerConnection>,
}

impl WebRtcPeer {
    async fn local_description(&self, fallback: RTCSessionDescription) -> RTCSessionDescription {
        self.pc.local_description().await.unwrap_or(fallback)
    }
}

#[async_trait]
impl RtcPeer for WebRtcPeer {
    async fn add_track(&self, track: &LocalTrack) -> anyhow::Result<()> {
        let sender = self
            .pc
            .add_track(track.rtc() as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .with_context(|| format!("adding local track {}", track.id()))?;

        // RTCP has to be drained for the interceptors (NACK, reports) to run
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while sender.read(&mut buf).await.is_ok() {}
        });
        Ok(())
    }

    async fn create_offer(&self) -> anyhow::Result<SessionDescription> {
        let offer = self.pc.create_offer(None).await.context("creating offer")?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .context("setting local offer")?;
        let local = self.local_description(offer).await;
        Ok(SessionDescription::offer(local.sdp))
    }

    async fn create_answer(&self) -> anyhow::Result<SessionDescription> {
        let answer = self.pc.create_answer(None).await.context("creating answer")?;
        self.pc
            .set_local_description(answer.clone())
            .await
            .context("setting local answer")?;
        let local = self.local_description(answer).await;
        Ok(SessionDescription::answer(local.sdp))
    }

    async fn set_remote_description(&self, description: &SessionDescription) -> anyhow::Result<()> {
        let sdp = description.sdp.clone();
        let remote = match description.sdp_type {
            SdpType::Offer => RTCSessionDescription::offer(sdp),
            SdpType::Answer => RTCSessionDescription::answer(sdp),
        }
        .context("parsing remote description")?;
        self.pc
            .set_remote_description(remote)
            .await
            .context("setting remote description")
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> anyhow::Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate.clone(),
            sdp_mid: candidate.sdp_mid.clone(),
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment.clone(),
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .context("adding remote candidate")
    }

    fn connection_state(&self) -> ConnectionState {
        map_state(self.pc.connection_state())
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.pc.close().await.context("closing peer connection")
    }
}

impl Drop for WebRtcPeer {
    fn drop(&mut self) {
        if self.pc.connection_state() != RTCPeerConnectionState::Closed {
            warn!("peer connection dropped without close");
        }
    }
}
