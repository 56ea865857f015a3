use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use commlink_net::{PaymentIntent, UserSummary};
use commlink_shared::types::{ConnectionMode, Message, PaymentEvent, UserId};

/// Everything the presentation layer is told about.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ClientEvent {
    ConnectionChanged {
        mode: ConnectionMode,
    },
    ConnectFailed {
        error: String,
        retry_in_secs: Option<u64>,
    },
    HistoryLoaded {
        peer: UserId,
        messages: Vec<Message>,
    },
    MessageAppended {
        message: Message,
        pending: Option<Uuid>,
    },
    MessageConfirmed {
        key: Uuid,
        message: Message,
    },
    MessageFailed {
        key: Uuid,
        error: String,
    },
    Unread {
        from: UserId,
        preview: String,
    },
    PeerTyping {
        peer: UserId,
        at: DateTime<Utc>,
    },
    PaymentsChanged {
        sent: Vec<PaymentEvent>,
        received: Vec<PaymentEvent>,
    },
    PaymentIntentCreated {
        recipient: UserId,
        amount: i64,
        intent: PaymentIntent,
    },
    SearchResults {
        query: String,
        users: Vec<UserSummary>,
    },
    CallPhase {
        phase: String,
        peer: Option<UserId>,
    },
    IncomingCall {
        from: UserId,
    },
    CallEnded {
        peer: UserId,
        reason: String,
    },
    CallToggles {
        muted: bool,
        video_enabled: bool,
    },
    Error {
        message: String,
    },
    LoggedOut,
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ConnectionChanged { .. } => "connection-changed",
            Self::ConnectFailed { .. } => "connect-failed",
            Self::HistoryLoaded { .. } => "history-loaded",
            Self::MessageAppended { .. } => "message-appended",
            Self::MessageConfirmed { .. } => "message-confirmed",
            Self::MessageFailed { .. } => "message-failed",
            Self::Unread { .. } => "unread",
            Self::PeerTyping { .. } => "peer-typing",
            Self::PaymentsChanged { .. } => "payments-changed",
            Self::PaymentIntentCreated { .. } => "payment-intent-created",
            Self::SearchResults { .. } => "search-results",
            Self::CallPhase { .. } => "call-phase",
            Self::IncomingCall { .. } => "incoming-call",
            Self::CallEnded { .. } => "call-ended",
            Self::CallToggles { .. } => "call-toggles",
            Self::Error { .. } => "error",
            Self::LoggedOut => "logged-out",
        }
    }

    pub fn error(message: impl ToString) -> Self {
        Self::Error {
            message: message.to_string(),
        }
    }
}

pub fn emit_event(events: &mpsc::UnboundedSender<ClientEvent>, event: ClientEvent) {
    let name = event.name();
    if events.send(event).is_err() {
        tracing::error!(event = name, "Failed to emit event");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_json_shape() {
        let json = serde_json::to_string(&ClientEvent::ConnectionChanged {
            mode: ConnectionMode::Connected,
        })
        .unwrap();
        assert_eq!(json, r#"{"event":"connection_changed","mode":"Connected"}"#);

        let json = serde_json::to_string(&ClientEvent::LoggedOut).unwrap();
        assert_eq!(json, r#"{"event":"logged_out"}"#);
    }

    #[test]
    fn test_emit_after_receiver_dropped_does_not_panic() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        emit_event(&tx, ClientEvent::error("gone"));
    }
}
