//! Classifies inbound frames and names the subsystem that owns each one.
//!
//! Every recognized discriminant maps to exactly one [`Routed`] variant. Frames
//! that do not parse, or carry a type this client does not know, are
//! dropped here with a log line and never reach the user.

use tracing::{debug, warn};

use commlink_shared::protocol::{decode_inbound, FrameKind, IceCandidate, InboundFrame};
use commlink_shared::types::{Message, PaymentEvent, PaymentUpdate, UserId};

#[derive(Debug, Clone, PartialEq)]
pub enum ChatSignal {
    Delivered(Message),
    Typing(UserId),
}

#[derive(Debug, Clone, PartialEq)]
pub enum PaymentSignal {
    Created(PaymentEvent),
    Updated(PaymentUpdate),
}

#[derive(Debug, Clone, PartialEq)]
pub enum CallSignal {
    Invite { from: UserId },
    Offer { from: UserId, sdp: String },
    Answer { from: UserId, sdp: String },
    Candidate { from: UserId, candidate: IceCandidate },
    End { from: UserId },
}

/// An inbound frame with its destination.
#[derive(Debug, Clone, PartialEq)]
pub enum Routed {
    Chat(ChatSignal),
    Payment(PaymentSignal),
    Call(CallSignal),
    /// Recognized but needs no handling (`pong`, `error`).
    Ignored(FrameKind),
}

/// Parse one text frame. `None` means the frame was dropped.
pub fn route(text: &str) -> Option<Routed> {
    let frame = match decode_inbound(text) {
        Ok(Some(frame)) => frame,
        Ok(None) => {
            debug!(len = text.len(), "Dropping frame of unknown type");
            return None;
        }
        Err(e) => {
            warn!(error = %e, "Dropping malformed frame");
            return None;
        }
    };

    let routed = match frame {
        InboundFrame::NewMessage { message } => Routed::Chat(ChatSignal::Delivered(message)),
        InboundFrame::Typing { user_id } => Routed::Chat(ChatSignal::Typing(user_id)),
        InboundFrame::PaymentCreated { payment } => {
            Routed::Payment(PaymentSignal::Created(payment))
        }
        InboundFrame::PaymentUpdated { payment } => {
            Routed::Payment(PaymentSignal::Updated(payment))
        }
        InboundFrame::CallInvite { from } => Routed::Call(CallSignal::Invite { from }),
        InboundFrame::WebrtcOffer { from, sdp } => Routed::Call(CallSignal::Offer { from, sdp }),
        InboundFrame::WebrtcAnswer { from, sdp } => {
            Routed::Call(CallSignal::Answer { from, sdp })
        }
        InboundFrame::WebrtcIce { from, candidate } => {
            Routed::Call(CallSignal::Candidate { from, candidate })
        }
        InboundFrame::CallEnd { from } => Routed::Call(CallSignal::End { from }),
        InboundFrame::Pong => Routed::Ignored(FrameKind::Pong),
        InboundFrame::Error { message } => {
            warn!(message = %message, "Server reported an error");
            Routed::Ignored(FrameKind::Error)
        }
    };

    Some(routed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_routes_chat_frames() {
        let routed = route(
            r#"{"type":"new_message","message":{"id":4,"content":"hi","sender_id":2,"receiver_id":1,"timestamp":"2024-03-01T10:00:00"}}"#,
        )
        .unwrap();
        match routed {
            Routed::Chat(ChatSignal::Delivered(m)) => {
                assert_eq!(m.content, "hi");
                assert_eq!(m.sender_id, UserId(2));
            }
            other => panic!("unexpected {other:?}"),
        }

        assert_eq!(
            route(r#"{"type":"typing","user_id":2}"#),
            Some(Routed::Chat(ChatSignal::Typing(UserId(2))))
        );
    }

    #[test]
    fn test_routes_payment_frames() {
        let routed = route(
            r#"{"type":"payment_updated","payment":{"id":"pi_1","status":"succeeded"}}"#,
        );
        assert_eq!(
            routed,
            Some(Routed::Payment(PaymentSignal::Updated(PaymentUpdate {
                id: "pi_1".into(),
                status: "succeeded".into(),
            })))
        );
    }

    #[test]
    fn test_routes_call_frames() {
        assert_eq!(
            route(r#"{"type":"call_invite","from":1}"#),
            Some(Routed::Call(CallSignal::Invite { from: UserId(1) }))
        );
        assert_eq!(
            route(r#"{"type":"webrtc_offer","from":1,"sdp":{"type":"offer","sdp":"v=0"}}"#),
            Some(Routed::Call(CallSignal::Offer {
                from: UserId(1),
                sdp: "v=0".into()
            }))
        );
        assert_eq!(
            route(r#"{"type":"call_end","from":3}"#),
            Some(Routed::Call(CallSignal::End { from: UserId(3) }))
        );
    }

    #[test]
    fn test_drops_unknown_and_malformed() {
        assert_eq!(route(r#"{"type":"presence","user_id":2}"#), None);
        assert_eq!(route("not json"), None);
        assert_eq!(route(r#"{"from":1}"#), None);
        assert_eq!(route(r#"{"type":"webrtc_answer","from":"x"}"#), None);
    }

    #[test]
    fn test_pong_and_error_go_nowhere() {
        let pong = route(r#"{"type":"pong"}"#).unwrap();
        assert_eq!(pong, Routed::Ignored(FrameKind::Pong));

        let err = route(r#"{"type":"error","message":"Invalid JSON"}"#).unwrap();
        assert_eq!(err, Routed::Ignored(FrameKind::Error));
    }
}
