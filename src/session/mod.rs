//! Per-peer sessions: PeerConnection lifecycle, signaling dance, channel
//! binding, and the registry that owns every live session.

pub mod callee;
pub mod caller;
pub mod registry;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use thiserror::Error;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_H264, MIME_TYPE_OPUS};
use webrtc::api::APIBuilder;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::policy::ice_transport_policy::RTCIceTransportPolicy;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};

use crate::config::IceSettings;
use crate::files::{DatagramSink, SinkError};
use crate::wire::{
    Envelope, AUDIO_PAYLOAD_TYPE, TYPE_CANDIDATE, VIDEO_CLOCK_RATE, VIDEO_PAYLOAD_TYPE,
};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("webrtc error: {0}")]
    WebRtc(#[from] webrtc::Error),
    #[error("negotiation failed: {0}")]
    Negotiation(String),
    #[error("media failed: {0}")]
    Media(#[from] crate::media::MediaError),
    #[error("peer {0} is not online")]
    PeerOffline(String),
}

/// Local identity a session signs its traffic with.
#[derive(Debug, Clone)]
pub struct SessionIdentity {
    pub local_id: String,
    pub local_pwd_md5: String,
}

/// What a session carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionMode {
    VideoAndFile,
    FileOnly,
}

impl SessionMode {
    pub fn is_only_file(&self) -> bool {
        matches!(self, SessionMode::FileOnly)
    }
}

/// Lifecycle of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    New,
    Negotiating,
    Connected,
    Draining,
    Closed,
}

impl SessionState {
    pub fn label(&self) -> &'static str {
        match self {
            SessionState::New => "new",
            SessionState::Negotiating => "negotiating",
            SessionState::Connected => "connected",
            SessionState::Draining => "draining",
            SessionState::Closed => "closed",
        }
    }
}

/// Builds a PeerConnection with H.264/Opus codecs at the protocol's payload
/// types and the installation's ICE servers. `only_relay` drops STUN and
/// pins the transport policy to TURN.
pub(crate) async fn build_peer_connection(
    ice: &IceSettings,
    only_relay: bool,
) -> Result<Arc<RTCPeerConnection>, SessionError> {
    let mut media = MediaEngine::default();
    media.register_codec(
        RTCRtpCodecParameters {
            capability: RTCRtpCodecCapability {
                mime_type: MIME_TYPE_H264.to_owned(),
                clock_rate: VIDEO_CLOCK_RATE,
                channels: 0,
                sdp_fmtp_line:
                    "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f"
                        .to_owned(),
                rtcp_feedback: vec![],
            },
            payload_type: VIDEO_PAYLOAD_TYPE,
            ..Default::default()
        },
        RTPCodecType::Video,
    )?;
    media.register_codec(
        RTCRtpCodecParameters {
            capability: RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48_000,
                channels: 2,
                sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
                rtcp_feedback: vec![],
            },
            payload_type: AUDIO_PAYLOAD_TYPE,
            ..Default::default()
        },
        RTPCodecType::Audio,
    )?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media)
        .map_err(|err| SessionError::Negotiation(err.to_string()))?;
    let api = APIBuilder::new()
        .with_media_engine(media)
        .with_interceptor_registry(registry)
        .build();

    let config = RTCConfiguration {
        ice_servers: ice_servers(ice, only_relay),
        ice_transport_policy: if only_relay {
            RTCIceTransportPolicy::Relay
        } else {
            RTCIceTransportPolicy::All
        },
        ..Default::default()
    };

    let pc = api.new_peer_connection(config).await?;
    Ok(Arc::new(pc))
}

fn ice_servers(ice: &IceSettings, only_relay: bool) -> Vec<RTCIceServer> {
    let mut servers = Vec::new();
    if !only_relay {
        servers.push(RTCIceServer {
            urls: vec![format!("stun:{}:{}", ice.host, ice.port)],
            ..Default::default()
        });
    }
    servers.push(RTCIceServer {
        urls: vec![format!("turn:{}:{}?transport=udp", ice.host, ice.port)],
        username: ice.username.clone(),
        credential: ice.password.clone(),
        ..Default::default()
    });
    servers.push(RTCIceServer {
        urls: vec![format!("turn:{}:{}?transport=tcp", ice.host, ice.port)],
        username: ice.username.clone(),
        credential: ice.password.clone(),
        ..Default::default()
    });
    servers
}

/// Envelope carrying a local session description to the peer.
pub(crate) fn description_envelope(
    role: &str,
    kind: &str,
    local_id: &str,
    remote_id: &str,
    sdp: &str,
) -> Envelope {
    let mut env = Envelope::new(role, kind);
    env.sender = Some(local_id.to_string());
    env.receiver = Some(remote_id.to_string());
    env.data = Some(serde_json::Value::String(sdp.to_string()));
    env
}

/// Envelope carrying one trickled ICE candidate.
pub(crate) fn candidate_envelope(
    role: &str,
    local_id: &str,
    remote_id: &str,
    candidate: &str,
    mid: &str,
) -> Envelope {
    let mut env = Envelope::new(role, TYPE_CANDIDATE);
    env.sender = Some(local_id.to_string());
    env.receiver = Some(remote_id.to_string());
    env.data = Some(serde_json::Value::String(candidate.to_string()));
    env.mid = Some(mid.to_string());
    env
}

pub(crate) fn candidate_init(data: &str, mid: &str) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: data.to_string(),
        sdp_mid: Some(mid.to_string()),
        sdp_mline_index: None,
        ..Default::default()
    }
}

/// Envelope filter: a session only looks at traffic from its peer, addressed
/// to this installation, carrying the expected role.
pub(crate) fn envelope_is_for(
    env: &Envelope,
    expected_role: &str,
    local_id: &str,
    remote_id: &str,
) -> bool {
    env.role == expected_role
        && env.sender.as_deref() == Some(remote_id)
        && env.receiver.as_deref() == Some(local_id)
}

/// A live data channel as a [`DatagramSink`].
pub(crate) struct DataChannelSink(pub Arc<RTCDataChannel>);

#[async_trait]
impl DatagramSink for DataChannelSink {
    async fn send_binary(&self, payload: Vec<u8>) -> Result<(), SinkError> {
        self.0
            .send(&Bytes::from(payload))
            .await
            .map(|_| ())
            .map_err(|err| SinkError::Send(err.to_string()))
    }

    async fn send_text(&self, payload: String) -> Result<(), SinkError> {
        self.0
            .send_text(payload)
            .await
            .map(|_| ())
            .map_err(|err| SinkError::Send(err.to_string()))
    }
}

/// Queues remote candidates that arrive before the remote description; the
/// underlying stack rejects early delivery.
#[derive(Debug, Default)]
pub(crate) struct CandidateGate {
    remote_description_set: bool,
    pending: Vec<RTCIceCandidateInit>,
}

impl CandidateGate {
    /// Either returns the candidate for immediate delivery or buffers it.
    pub fn admit(&mut self, candidate: RTCIceCandidateInit) -> Option<RTCIceCandidateInit> {
        if self.remote_description_set {
            Some(candidate)
        } else {
            self.pending.push(candidate);
            None
        }
    }

    /// Marks the description applied and drains everything buffered.
    pub fn open(&mut self) -> Vec<RTCIceCandidateInit> {
        self.remote_description_set = true;
        std::mem::take(&mut self.pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{ROLE_CLI, ROLE_CTL, TYPE_ANSWER};

    #[test]
    fn ice_server_set_has_stun_and_both_turn_transports() {
        let ice = IceSettings {
            host: "turn.example".into(),
            port: 3478,
            username: "user".into(),
            password: "pass".into(),
        };
        let servers = ice_servers(&ice, false);
        assert_eq!(servers.len(), 3);
        assert_eq!(servers[0].urls[0], "stun:turn.example:3478");
        assert!(servers[1].urls[0].contains("transport=udp"));
        assert!(servers[2].urls[0].contains("transport=tcp"));

        let relay_only = ice_servers(&ice, true);
        assert_eq!(relay_only.len(), 2);
        assert!(relay_only.iter().all(|s| s.urls[0].starts_with("turn:")));
    }

    #[test]
    fn candidate_gate_buffers_until_description() {
        let mut gate = CandidateGate::default();
        assert!(gate.admit(candidate_init("candidate:1", "0")).is_none());
        assert!(gate.admit(candidate_init("candidate:2", "0")).is_none());
        let drained = gate.open();
        assert_eq!(drained.len(), 2);
        // After the description, candidates pass straight through.
        assert!(gate.admit(candidate_init("candidate:3", "0")).is_some());
    }

    #[test]
    fn envelope_filter_checks_addressing() {
        let env = description_envelope(ROLE_CTL, TYPE_ANSWER, "CTL-1", "CLI-1", "sdp");
        assert!(envelope_is_for(&env, ROLE_CTL, "CLI-1", "CTL-1"));
        assert!(!envelope_is_for(&env, ROLE_CLI, "CLI-1", "CTL-1"));
        assert!(!envelope_is_for(&env, ROLE_CTL, "OTHER", "CTL-1"));
    }
}
