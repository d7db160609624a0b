use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use tokio::sync::broadcast;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;

use crate::error::ProtocolError;

/// Routing key of a remote endpoint on the rendezvous server.
pub type PeerAddress = String;

/// Packets buffered per track before a slow recorder starts lagging.
const TRACK_BUFFER: usize = 512;

/// SDP with its type, as exchanged over signaling
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: String,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: "offer".into(),
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: "answer".into(),
            sdp: sdp.into(),
        }
    }

    /// Whether the description names at least one audio or video m-line.
    pub fn has_media_sections(&self) -> bool {
        self.sdp
            .lines()
            .any(|line| line.starts_with("m=audio") || line.starts_with("m=video"))
    }
}

/// An inbound offer together with the routing data that came with it.
#[derive(Debug, Clone)]
pub struct SessionOffer {
    pub description: SessionDescription,
    pub connection_id: Option<String>,
    pub attributes: Map<String, Value>,
}

impl SessionOffer {
    /// Builds an offer from a PeerJS OFFER payload or a bare `{type, sdp}` object.
    pub fn from_payload(payload: Value) -> Result<Self, ProtocolError> {
        let Value::Object(mut attributes) = payload else {
            return Err(ProtocolError::MissingField("payload"));
        };

        let description = match attributes.remove("sdp") {
            Some(Value::String(sdp)) => {
                // bare {type, sdp} object; PeerJS reuses `type` for the connection kind
                let sdp_type = match attributes.get("type").and_then(Value::as_str) {
                    Some(kind @ ("offer" | "answer" | "pranswer")) => Some(kind.to_string()),
                    _ => None,
                };
                match sdp_type {
                    Some(sdp_type) => {
                        attributes.remove("type");
                        SessionDescription { sdp_type, sdp }
                    }
                    None => SessionDescription::offer(sdp),
                }
            }
            Some(value @ Value::Object(_)) => serde_json::from_value(value)?,
            _ => return Err(ProtocolError::MissingField("payload.sdp")),
        };

        let connection_id = match attributes.remove("connectionId") {
            Some(Value::String(id)) if !id.is_empty() => Some(id),
            _ => None,
        };

        Ok(Self {
            description,
            connection_id,
            attributes,
        })
    }
}

/// ICE candidate for a WebRTC connection
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    #[serde(default)]
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl From<RTCIceCandidateInit> for IceCandidate {
    fn from(init: RTCIceCandidateInit) -> Self {
        Self {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_mline_index: init.sdp_mline_index,
            username_fragment: init.username_fragment,
        }
    }
}

impl From<IceCandidate> for RTCIceCandidateInit {
    fn from(candidate: IceCandidate) -> Self {
        Self {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        }
    }
}

/// ICE server configuration
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub r#type: String, // 'stun' or 'turn'
    pub url: String,
    pub username: Option<String>,
    pub credential: Option<String>,
}

impl ServerConfig {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            r#type: "stun".into(),
            url: url.into(),
            username: None,
            credential: None,
        }
    }

    /// Parses `[turn:|stun:][user:pass@]host:port`.
    pub fn parse(spec: &str) -> Self {
        let (r#type, rest) = if let Some(rest) = spec.strip_prefix("turn:") {
            ("turn", rest)
        } else if let Some(rest) = spec.strip_prefix("turns:") {
            ("turn", rest)
        } else {
            ("stun", spec.strip_prefix("stun:").unwrap_or(spec))
        };

        let (username, credential, host) = match rest.rsplit_once('@') {
            Some((auth, host)) => {
                let (user, pass) = auth.split_once(':').unwrap_or((auth, ""));
                (Some(user.to_string()), Some(pass.to_string()), host)
            }
            None => (None, None, rest),
        };

        Self {
            r#type: r#type.into(),
            url: host.to_string(),
            username,
            credential,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Audio => f.write_str("audio"),
            TrackKind::Video => f.write_str("video"),
        }
    }
}

/// Negotiated RTP parameters of an inbound track.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackCodec {
    pub mime_type: String,
    pub clock_rate: u32,
    pub channels: u16,
    pub payload_type: u8,
    pub fmtp: String,
}

impl TrackCodec {
    /// Encoding name as used in an `a=rtpmap` line (`video/VP8` -> `VP8`).
    pub fn encoding_name(&self) -> &str {
        self.mime_type
            .split_once('/')
            .map(|(_, name)| name)
            .unwrap_or(&self.mime_type)
    }
}

/// A live inbound media stream. Cloning shares the packet fan-out.
#[derive(Debug, Clone)]
pub struct MediaTrack {
    id: String,
    kind: TrackKind,
    codec: TrackCodec,
    packets: broadcast::Sender<Bytes>,
}

impl MediaTrack {
    pub fn new(id: impl Into<String>, kind: TrackKind, codec: TrackCodec) -> Self {
        let (packets, _) = broadcast::channel(TRACK_BUFFER);
        Self {
            id: id.into(),
            kind,
            codec,
            packets,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn codec(&self) -> &TrackCodec {
        &self.codec
    }

    /// New receiver of raw RTP packets.
    pub fn subscribe(&self) -> broadcast::Receiver<Bytes> {
        self.packets.subscribe()
    }

    /// Pushes one marshalled RTP packet to every subscriber; returns how many got it.
    pub fn publish(&self, packet: Bytes) -> usize {
        self.packets.send(packet).unwrap_or(0)
    }
}

/// Peer connection state as reported by the engine
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl From<RTCPeerConnectionState> for ConnectionState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => {
                ConnectionState::New
            }
            RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
            RTCPeerConnectionState::Connected => ConnectionState::Connected,
            RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
            RTCPeerConnectionState::Failed => ConnectionState::Failed,
            RTCPeerConnectionState::Closed => ConnectionState::Closed,
        }
    }
}
