use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, warn};
use webrtc::api::API;
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::RTCPeerConnection;

use crate::config::validate_server;
use crate::peer::types::{IceCandidate, ServerConfig};
use crate::utils::add_ice_url_scheme;

/// Counts of gathered candidates by type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CandidateMix {
    pub host: usize,
    pub srflx: usize,
    pub relay: usize,
}

pub fn classify_candidates(candidates: &[IceCandidate]) -> CandidateMix {
    let mut mix = CandidateMix::default();
    for candidate in candidates {
        if candidate.candidate.contains("typ host") {
            mix.host += 1;
        } else if candidate.candidate.contains("typ srflx") {
            mix.srflx += 1;
        } else if candidate.candidate.contains("typ relay") {
            mix.relay += 1;
        }
    }

    debug!(
        host = mix.host,
        srflx = mix.srflx,
        relay = mix.relay,
        "candidate analysis"
    );
    if mix.relay == 0 && !candidates.is_empty() {
        warn!("no TURN relay candidates gathered; peers behind symmetric NAT may not connect");
    }
    mix
}

pub fn to_rtc_ice_servers(servers: &[ServerConfig]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|config| RTCIceServer {
            urls: vec![add_ice_url_scheme(config)],
            username: config.username.clone().unwrap_or_default(),
            credential: config.credential.clone().unwrap_or_default(),
        })
        .collect()
}

/// Gathers candidates against a single server and waits for one of the type
/// that server should produce: srflx for STUN, relay for TURN.
pub async fn check_ice_server_availability(
    api: &API,
    config: &ServerConfig,
    wait: Duration,
) -> bool {
    if let Err(e) = validate_server(config) {
        debug!(server = %config.id, "not probing invalid ICE server: {}", e);
        return false;
    }

    let rtc_config = RTCConfiguration {
        ice_servers: to_rtc_ice_servers(std::slice::from_ref(config)),
        ..Default::default()
    };

    match api.new_peer_connection(rtc_config).await {
        Ok(pc) => check_via_ice_gathering(Arc::new(pc), config.is_turn(), wait).await,
        Err(e) => {
            debug!(server = %config.id, "failed to create probe connection: {}", e);
            false
        }
    }
}

async fn check_via_ice_gathering(pc: Arc<RTCPeerConnection>, turn: bool, wait: Duration) -> bool {
    let wanted = if turn { "typ relay" } else { "typ srflx" };

    let (gathering_tx, mut gathering_rx) = mpsc::channel(10);
    pc.on_ice_gathering_state_change(Box::new(move |state| {
        let tx = gathering_tx.clone();
        Box::pin(async move {
            let _ = tx.send(state).await;
        })
    }));

    let (found_tx, mut found_rx) = mpsc::channel(10);
    pc.on_ice_candidate(Box::new(move |candidate| {
        let tx = found_tx.clone();
        Box::pin(async move {
            if let Some(c) = candidate {
                if let Ok(json) = c.to_json() {
                    if json.candidate.contains(wanted) {
                        let _ = tx.send(()).await;
                    }
                }
            }
        })
    }));

    // A data channel plus a local offer is enough to start gathering
    if let Err(e) = pc.create_data_channel("probe", None).await {
        debug!("probe data channel failed: {}", e);
        let _ = pc.close().await;
        return false;
    }
    let started = match pc.create_offer(None).await {
        Ok(offer) => pc.set_local_description(offer).await.is_ok(),
        Err(_) => false,
    };
    if !started {
        let _ = pc.close().await;
        return false;
    }

    let reachable = tokio::select! {
        found = timeout(wait, found_rx.recv()) => matches!(found, Ok(Some(()))),
        _ = async {
            while let Some(state) = gathering_rx.recv().await {
                if state == RTCIceGathererState::Complete {
                    break;
                }
            }
        } => false,
    };

    let _ = pc.close().await;
    reachable
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_candidate_types() {
        let candidates = vec![
            IceCandidate::new("candidate:1 1 udp 2122260223 192.168.1.4 51000 typ host"),
            IceCandidate::new("candidate:2 1 udp 1686052607 203.0.113.7 51000 typ srflx raddr 0.0.0.0 rport 0"),
            IceCandidate::new("candidate:3 1 udp 41885439 198.51.100.2 3478 typ relay raddr 0.0.0.0 rport 0"),
            IceCandidate::new("candidate:4 1 udp 2122260223 10.0.0.9 51001 typ host"),
        ];
        assert_eq!(
            classify_candidates(&candidates),
            CandidateMix {
                host: 2,
                srflx: 1,
                relay: 1
            }
        );
    }

    #[test]
    fn rtc_servers_get_schemes_and_credentials() {
        let servers = vec![
            ServerConfig::stun("s", "stun.example.org:3478"),
            ServerConfig {
                id: "t".into(),
                r#type: "turn".into(),
                url: "turn.example.org:3478".into(),
                username: Some("user".into()),
                credential: Some("pass".into()),
            },
        ];
        let rtc = to_rtc_ice_servers(&servers);
        assert_eq!(rtc[0].urls, vec!["stun:stun.example.org:3478".to_string()]);
        assert_eq!(rtc[1].urls, vec!["turn:turn.example.org:3478".to_string()]);
        assert_eq!(rtc[1].username, "user");
    }
}
