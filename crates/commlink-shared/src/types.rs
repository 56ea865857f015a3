use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

// User identity = opaque integer assigned by the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub i64);

impl UserId {
    /// Server-assigned identifiers start at 1.
    pub fn is_valid(&self) -> bool {
        self.0 > 0
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for UserId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse::<i64>().map(UserId)
    }
}

/// Bearer token obtained from the token-login endpoint.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }

    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.0)
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Credential(<redacted>)")
    }
}

/// A direct message between two users.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Server-side row id. Absent on local echoes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub content: String,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    #[serde(with = "lenient_utc")]
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_username: Option<String>,
}

impl Message {
    /// True if this message was exchanged between `a` and `b`, in either direction.
    pub fn is_between(&self, a: UserId, b: UserId) -> bool {
        (self.sender_id == a && self.receiver_id == b)
            || (self.sender_id == b && self.receiver_id == a)
    }

    /// The other party from `local`'s point of view.
    pub fn counterpart(&self, local: UserId) -> UserId {
        if self.sender_id == local {
            self.receiver_id
        } else {
            self.sender_id
        }
    }
}

/// A payment lifecycle record pushed by the server (Stripe-style intent).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentEvent {
    pub id: String,
    /// Amount in the smallest currency unit (cents).
    pub amount: i64,
    pub currency: String,
    pub status: String,
    /// Unix seconds.
    pub created: i64,
    pub sender_id: UserId,
    pub recipient_id: UserId,
    #[serde(default)]
    pub description: Option<String>,
}

/// Status-only update for an existing payment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentUpdate {
    pub id: String,
    pub status: String,
}

/// Public profile as returned by the user endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: UserId,
    pub username: String,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionMode {
    Connected,
    Connecting,
    Disconnected,
}

/// Timestamps arrive either as RFC 3339 or as naive ISO-8601 (server-side UTC
/// without an offset). Both deserialize to `DateTime<Utc>`.
pub mod lenient_utc {
    use super::*;

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&ts.to_rfc3339())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(d)?;
        parse(&raw).ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp: {raw}")))
    }

    pub fn parse(raw: &str) -> Option<DateTime<Utc>> {
        if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
            return Some(ts.with_timezone(&Utc));
        }
        NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
            .ok()
            .map(|naive| naive.and_utc())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    #[test]
    fn test_naive_server_timestamp_is_utc() {
        let json = r#"{
            "id": 7,
            "content": "hi",
            "sender_id": 1,
            "receiver_id": 2,
            "timestamp": "2025-03-04T10:11:12.345678"
        }"#;
        let msg: Message = serde_json::from_str(json).unwrap();
        assert_eq!(msg.id, Some(7));
        assert_eq!(msg.timestamp.hour(), 10);
        assert_eq!(msg.sender_username, None);
    }

    #[test]
    fn test_rfc3339_timestamp_with_offset() {
        let ts = lenient_utc::parse("2025-03-04T12:00:00+02:00").unwrap();
        assert_eq!(ts.hour(), 10);
        assert!(lenient_utc::parse("yesterday").is_none());
    }

    #[test]
    fn test_message_counterpart() {
        let msg = Message {
            id: None,
            content: "x".into(),
            sender_id: UserId(1),
            receiver_id: UserId(2),
            timestamp: Utc::now(),
            sender_username: None,
        };
        assert!(msg.is_between(UserId(2), UserId(1)));
        assert!(!msg.is_between(UserId(1), UserId(3)));
        assert_eq!(msg.counterpart(UserId(1)), UserId(2));
        assert_eq!(msg.counterpart(UserId(2)), UserId(1));
    }

    #[test]
    fn test_credential_debug_is_redacted() {
        let cred = Credential::new("secret-token");
        assert!(!format!("{cred:?}").contains("secret"));
        assert_eq!(cred.bearer(), "Bearer secret-token");
    }
}
