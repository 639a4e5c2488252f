//! Signaling Protocol
//!
//! Messages exchanged over the signaling channel. Every frame is a JSON object
//! tagged by `type`; decoding happens once, at the channel boundary, into
//! [`SignalMessage`].

use serde::{Deserialize, Serialize};

/// SDP description type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// A session description as carried on the wire (`{type, sdp}`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    /// Build an offer description.
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    /// Build an answer description.
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// An ICE candidate in its JSON init form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        default,
        rename = "sdpMLineIndex",
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

/// Signaling messages, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalMessage {
    /// Client announces itself in a room.
    #[serde(rename_all = "camelCase")]
    JoinRoom {
        room_id: String,
        user_id: String,
        is_spectator: bool,
    },
    /// Client SDP offer.
    #[serde(rename_all = "camelCase")]
    Offer {
        sdp: SessionDescription,
        room_id: String,
        user_id: String,
    },
    /// Server SDP answer.
    Answer { sdp: SessionDescription },
    /// Trickled ICE candidate (both directions; the server may omit the ids).
    #[serde(rename_all = "camelCase")]
    IceCandidate {
        candidate: IceCandidate,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
    },
    /// Pull-stream URL for spectators.
    #[serde(rename_all = "camelCase")]
    SpectatorUrl { stream_url: String },
    /// Server-initiated end of call.
    #[serde(rename_all = "camelCase")]
    TerminateCall { reason: String, redirect_url: String },
}

impl SignalMessage {
    /// Decode a text frame.
    pub fn decode(text: &str) -> crate::Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Encode into a text frame.
    pub fn encode(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Wire tag of the message.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::JoinRoom { .. } => "JOIN_ROOM",
            Self::Offer { .. } => "OFFER",
            Self::Answer { .. } => "ANSWER",
            Self::IceCandidate { .. } => "ICE_CANDIDATE",
            Self::SpectatorUrl { .. } => "SPECTATOR_URL",
            Self::TerminateCall { .. } => "TERMINATE_CALL",
        }
    }
}

/// Typed payload of a `TERMINATE_CALL` message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminationSignal {
    pub reason: String,
    pub redirect_url: String,
}

impl TerminationSignal {
    pub fn new(reason: impl Into<String>, redirect_url: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            redirect_url: redirect_url.into(),
        }
    }

    /// Reason in human-readable form (`PAYMENT_EXPIRED` -> `PAYMENT EXPIRED`).
    #[must_use]
    pub fn reason_text(&self) -> String {
        self.reason.replace('_', " ")
    }
}

impl From<TerminationSignal> for SignalMessage {
    fn from(signal: TerminationSignal) -> Self {
        Self::TerminateCall {
            reason: signal.reason,
            redirect_url: signal.redirect_url,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn join_room_uses_camel_case_fields() {
        let msg = SignalMessage::JoinRoom {
            room_id: "room42".into(),
            user_id: "u1".into(),
            is_spectator: false,
        };
        let value: serde_json::Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"type": "JOIN_ROOM", "roomId": "room42", "userId": "u1", "isSpectator": false})
        );
    }

    #[test]
    fn terminate_call_decodes() {
        let msg = SignalMessage::decode(
            r#"{"type":"TERMINATE_CALL","reason":"PAYMENT_EXPIRED","redirectUrl":"/models"}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            SignalMessage::TerminateCall {
                reason: "PAYMENT_EXPIRED".into(),
                redirect_url: "/models".into(),
            }
        );
    }

    #[test]
    fn server_ice_candidate_without_ids_decodes() {
        let msg = SignalMessage::decode(
            r#"{"type":"ICE_CANDIDATE","candidate":{"candidate":"candidate:1 1 udp 1 10.0.0.1 5000 typ host","sdpMid":"0","sdpMLineIndex":0}}"#,
        )
        .unwrap();
        match msg {
            SignalMessage::IceCandidate {
                candidate,
                room_id,
                user_id,
            } => {
                assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
                assert_eq!(candidate.sdp_mline_index, Some(0));
                assert!(room_id.is_none());
                assert!(user_id.is_none());
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn answer_carries_typed_description() {
        let msg =
            SignalMessage::decode(r#"{"type":"ANSWER","sdp":{"type":"answer","sdp":"v=0"}}"#)
                .unwrap();
        assert_eq!(
            msg,
            SignalMessage::Answer {
                sdp: SessionDescription::answer("v=0")
            }
        );
    }

    #[test]
    fn unknown_type_is_rejected() {
        assert!(SignalMessage::decode(r#"{"type":"CHAT","text":"hi"}"#).is_err());
    }

    #[test]
    fn reason_text_replaces_underscores() {
        let signal = TerminationSignal::new("PAYMENT_EXPIRED", "/models");
        assert_eq!(signal.reason_text(), "PAYMENT EXPIRED");
    }
}
