use serde::{Deserialize, Serialize};

/// Identifier the relay assigns to every accepted socket.
pub type ConnectionId = String;

pub type RoomId = String;

pub const DEFAULT_DISPLAY_NAME: &str = "Guest";

/// `{id, name}` pair used by every membership event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerSummary {
    pub id: ConnectionId,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalType {
    Offer,
    Answer,
    IceCandidate,
}

/// Negotiation envelope routed by the relay. `data` is opaque to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalEnvelope {
    pub to: ConnectionId,
    #[serde(default)]
    pub from: ConnectionId,
    #[serde(rename = "type")]
    pub kind: SignalType,
    #[serde(default)]
    pub data: serde_json::Value,
}

// Client -> relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientMessage {
    #[serde(rename = "join-room", rename_all = "camelCase")]
    JoinRoom {
        room_id: RoomId,
        #[serde(default)]
        display_name: Option<String>,
    },
    #[serde(rename = "leave-room", rename_all = "camelCase")]
    LeaveRoom { room_id: RoomId },
    #[serde(rename = "signal")]
    Signal(SignalEnvelope),
    #[serde(rename = "video-play", rename_all = "camelCase")]
    VideoPlay { room_id: RoomId },
    #[serde(rename = "video-pause", rename_all = "camelCase")]
    VideoPause { room_id: RoomId },
    #[serde(rename = "video-seek", rename_all = "camelCase")]
    VideoSeek { time: f64, room_id: RoomId },
}

// Relay -> client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerMessage {
    #[serde(rename = "welcome")]
    Welcome { id: ConnectionId },
    #[serde(rename = "existingPeers")]
    ExistingPeers(Vec<PeerSummary>),
    #[serde(rename = "room-joined")]
    RoomJoined { members: Vec<PeerSummary> },
    #[serde(rename = "new-peer")]
    NewPeer(PeerSummary),
    #[serde(rename = "peer-left")]
    PeerLeft { id: ConnectionId },
    #[serde(rename = "signal")]
    Signal(SignalEnvelope),
    #[serde(rename = "video-play", rename_all = "camelCase")]
    VideoPlay { room_id: RoomId },
    #[serde(rename = "video-pause", rename_all = "camelCase")]
    VideoPause { room_id: RoomId },
    #[serde(rename = "video-seek", rename_all = "camelCase")]
    VideoSeek { time: f64, room_id: RoomId },
    #[serde(rename = "error")]
    Error { message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
    Rollback,
}

/// Payload of `offer` and `answer` envelopes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Payload of `ice-candidate` envelopes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default)]
    pub sdp_m_line_index: Option<u16>,
}

/// Trims a requested display name, falling back to [`DEFAULT_DISPLAY_NAME`].
pub fn normalize_display_name(name: Option<&str>) -> String {
    match name.map(str::trim) {
        Some(n) if !n.is_empty() => n.to_string(),
        _ => DEFAULT_DISPLAY_NAME.to_string(),
    }
}
