//! SFU REST Contract
//!
//! Request and response bodies for the room/transport/producer/consumer
//! endpoints, plus the events the server pushes about other participants.
//! Codec-level parameter blobs are opaque to the client and travel as JSON.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{MediaKind, TransportDirection};

/// Endpoint paths, relative to the API base URL.
pub mod endpoints {
    pub const ROOM_CREATE: &str = "/api/webrtc/room/create";
    pub const ROOM_JOIN: &str = "/api/webrtc/room/join";
    pub const ROOM_LEAVE: &str = "/api/webrtc/room/leave";
    pub const TRANSPORT_CREATE: &str = "/api/webrtc/transport/create";
    pub const TRANSPORT_CONNECT: &str = "/api/webrtc/transport/connect";
    pub const PRODUCE: &str = "/api/webrtc/produce";
    pub const CONSUME: &str = "/api/webrtc/consume";
    pub const PARTICIPANT_MUTE: &str = "/api/webrtc/participant/mute";
    pub const PARTICIPANT_REMOVE: &str = "/api/webrtc/participant/remove";
}

/// Router RTP capabilities, or the capability set of a loaded device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RtpCapabilities(pub Value);

/// DTLS parameters exchanged when a transport connects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DtlsParameters(pub Value);

/// RTP parameters of a producer or consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RtpParameters(pub Value);

/// Reply to room create / room join.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomHandshake {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,
    pub rtp_capabilities: RtpCapabilities,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomRequest {
    pub room_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTransportRequest {
    pub room_id: String,
    pub direction: TransportDirection,
}

/// Server-side transport parameters used to build a local transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportOptions {
    pub id: String,
    #[serde(default)]
    pub ice_parameters: Value,
    #[serde(default)]
    pub ice_candidates: Vec<Value>,
    pub dtls_parameters: DtlsParameters,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectTransportRequest {
    pub transport_id: String,
    pub dtls_parameters: DtlsParameters,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProduceRequest {
    pub room_id: String,
    pub transport_id: String,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProduceResponse {
    pub producer_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeRequest {
    pub room_id: String,
    pub producer_id: String,
    pub rtp_capabilities: RtpCapabilities,
}

/// Consumer descriptor returned by the consume endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerDescriptor {
    pub id: String,
    pub producer_id: String,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MuteParticipantRequest {
    pub room_id: String,
    pub user_id: String,
    pub is_muted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoveParticipantRequest {
    pub room_id: String,
    pub user_id: String,
}

/// Server-pushed events about the room roster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RoomEvent {
    /// A remote participant started publishing a track.
    #[serde(rename_all = "camelCase")]
    NewProducer {
        user_id: String,
        producer_id: String,
        kind: MediaKind,
    },
    #[serde(rename_all = "camelCase")]
    ParticipantMuted { user_id: String, is_muted: bool },
    #[serde(rename_all = "camelCase")]
    ParticipantVideo { user_id: String, is_video_off: bool },
    #[serde(rename_all = "camelCase")]
    ParticipantLeft { user_id: String },
    /// The room was closed by the server.
    #[serde(rename_all = "camelCase")]
    RoomClosed {
        #[serde(default)]
        reason: Option<String>,
    },
}
