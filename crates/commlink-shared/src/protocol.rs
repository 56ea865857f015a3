use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{SignalingError, TransportError};
use crate::types::{Message, PaymentEvent, PaymentUpdate, UserId};

/// Frames the client sends over the persistent connection.
///
/// Serialized as a JSON object whose `type` field is the discriminant,
/// e.g. `{"type":"call_invite","target_id":2}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundFrame {
    /// Keep-alive
    Ping,
    /// Typing indicator for the active conversation
    Typing { recipient_id: UserId },
    /// Call offer notification
    CallInvite { target_id: UserId },
    /// SDP offer relay
    WebrtcOffer { target_id: UserId, sdp: String },
    /// SDP answer relay
    WebrtcAnswer { target_id: UserId, sdp: String },
    /// Trickled ICE candidate relay
    WebrtcIce {
        target_id: UserId,
        candidate: IceCandidate,
    },
    /// Terminate call
    CallEnd { target_id: UserId },
}

impl OutboundFrame {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::Typing { .. } => "typing",
            Self::CallInvite { .. } => "call_invite",
            Self::WebrtcOffer { .. } => "webrtc_offer",
            Self::WebrtcAnswer { .. } => "webrtc_answer",
            Self::WebrtcIce { .. } => "webrtc_ice",
            Self::CallEnd { .. } => "call_end",
        }
    }

    pub fn to_json(&self) -> Result<String, TransportError> {
        serde_json::to_string(self).map_err(|e| TransportError::Encode(e.to_string()))
    }
}

/// Frames pushed by the server.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundFrame {
    NewMessage {
        message: Message,
    },
    PaymentCreated {
        payment: PaymentEvent,
    },
    PaymentUpdated {
        payment: PaymentUpdate,
    },
    CallInvite {
        from: UserId,
    },
    WebrtcOffer {
        from: UserId,
        #[serde(deserialize_with = "sdp_text")]
        sdp: String,
    },
    WebrtcAnswer {
        from: UserId,
        #[serde(deserialize_with = "sdp_text")]
        sdp: String,
    },
    WebrtcIce {
        from: UserId,
        candidate: IceCandidate,
    },
    CallEnd {
        from: UserId,
    },
    Typing {
        user_id: UserId,
    },
    Pong,
    Error {
        #[serde(default)]
        message: String,
    },
}

impl InboundFrame {
    pub fn kind(&self) -> FrameKind {
        match self {
            Self::NewMessage { .. } => FrameKind::NewMessage,
            Self::PaymentCreated { .. } => FrameKind::PaymentCreated,
            Self::PaymentUpdated { .. } => FrameKind::PaymentUpdated,
            Self::CallInvite { .. } => FrameKind::CallInvite,
            Self::WebrtcOffer { .. } => FrameKind::WebrtcOffer,
            Self::WebrtcAnswer { .. } => FrameKind::WebrtcAnswer,
            Self::WebrtcIce { .. } => FrameKind::WebrtcIce,
            Self::CallEnd { .. } => FrameKind::CallEnd,
            Self::Typing { .. } => FrameKind::Typing,
            Self::Pong => FrameKind::Pong,
            Self::Error { .. } => FrameKind::Error,
        }
    }
}

/// Recognized inbound discriminants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    NewMessage,
    PaymentCreated,
    PaymentUpdated,
    CallInvite,
    WebrtcOffer,
    WebrtcAnswer,
    WebrtcIce,
    CallEnd,
    Typing,
    Pong,
    Error,
}

impl FrameKind {
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "new_message" => Some(Self::NewMessage),
            "payment_created" => Some(Self::PaymentCreated),
            "payment_updated" => Some(Self::PaymentUpdated),
            "call_invite" => Some(Self::CallInvite),
            "webrtc_offer" => Some(Self::WebrtcOffer),
            "webrtc_answer" => Some(Self::WebrtcAnswer),
            "webrtc_ice" => Some(Self::WebrtcIce),
            "call_end" => Some(Self::CallEnd),
            "typing" => Some(Self::Typing),
            "pong" => Some(Self::Pong),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

/// ICE candidate in the shape of `RTCIceCandidateInit`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default, skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u16>,
    #[serde(rename = "usernameFragment", default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
            username_fragment: None,
        }
    }
}

/// Decode one inbound text frame.
///
/// Returns `Ok(Some(frame))` for recognized types, `Ok(None)` for unknown
/// types, `Err` for non-JSON input, a missing `type`, or a recognized type
/// whose payload does not match.
pub fn decode_inbound(text: &str) -> Result<Option<InboundFrame>, SignalingError> {
    let value: serde_json::Value =
        serde_json::from_str(text).map_err(|e| SignalingError::Malformed(e.to_string()))?;

    let tag = value
        .get("type")
        .and_then(|t| t.as_str())
        .ok_or(SignalingError::MissingType)?;

    if FrameKind::from_tag(tag).is_none() {
        return Ok(None);
    }

    let tag = tag.to_string();
    serde_json::from_value(value)
        .map(Some)
        .map_err(|e| SignalingError::Malformed(format!("{tag}: {e}")))
}

/// Browsers relay either the bare SDP string or the whole
/// `RTCSessionDescription` object `{type, sdp}`.
fn sdp_text<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Sdp {
        Text(String),
        Description { sdp: String },
    }

    match Sdp::deserialize(d)? {
        Sdp::Text(s) | Sdp::Description { sdp: s } => Ok(s),
    }
}

/// Outbound half of the persistent connection as seen by the components
/// that emit frames.
pub trait FrameSink {
    fn is_open(&self) -> bool;

    fn send_frame(&self, frame: &OutboundFrame) -> Result<(), TransportError>;
}
