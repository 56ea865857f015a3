//! Client for the collaborator HTTP surface (auth, chat history, payments).

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use commlink_shared::constants::MIN_SEARCH_QUERY_LEN;
use commlink_shared::error::{ApplicationError, AuthError, CommlinkError};
use commlink_shared::types::{lenient_utc, Credential, Message, PaymentEvent, UserId, UserProfile};

const REQUEST_TIMEOUT_SECS: u64 = 15;

/// The collaborator calls the session makes on its own.
///
/// Implemented by [`ApiClient`]; tests substitute an in-memory fake.
#[async_trait]
pub trait ServiceApi: Send + Sync + 'static {
    async fn fetch_messages(&self, peer: UserId) -> Result<Vec<Message>, ApplicationError>;

    async fn send_message(
        &self,
        content: &str,
        receiver: UserId,
    ) -> Result<Message, ApplicationError>;

    async fn sent_payments(&self) -> Result<Vec<PaymentEvent>, ApplicationError>;

    async fn received_payments(&self) -> Result<Vec<PaymentEvent>, ApplicationError>;

    async fn create_payment_intent(
        &self,
        amount: i64,
        recipient: UserId,
    ) -> Result<PaymentIntent, ApplicationError>;

    async fn search_users(&self, query: &str) -> Result<Vec<UserSummary>, ApplicationError>;
}

#[derive(Debug, Clone, Serialize)]
pub struct Registration {
    pub username: String,
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    #[allow(dead_code)]
    token_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSummary {
    pub id: UserId,
    pub username: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ConversationSummary {
    pub user_id: UserId,
    pub last_message: String,
    #[serde(with = "lenient_utc")]
    pub last_message_time: DateTime<Utc>,
    #[serde(default)]
    pub unread_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentIntent {
    pub client_secret: String,
    #[serde(default)]
    pub payment_intent_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    #[serde(default)]
    pub database: Option<String>,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        self.status == "healthy"
    }
}

#[derive(Serialize)]
struct SendMessageBody<'a> {
    content: &'a str,
    receiver_id: UserId,
}

#[derive(Serialize)]
struct PaymentIntentBody {
    amount: i64,
    recipient_id: UserId,
}

pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    credential: Option<Credential>,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Result<Self, ApplicationError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| ApplicationError::Request(e.to_string()))?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            credential: None,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn credential(&self) -> Option<&Credential> {
        self.credential.as_ref()
    }

    pub fn set_credential(&mut self, credential: Credential) {
        self.credential = Some(credential);
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> Result<reqwest::RequestBuilder, ApplicationError> {
        match &self.credential {
            Some(c) if !c.is_empty() => Ok(builder.bearer_auth(c.as_str())),
            _ => Err(ApplicationError::Status {
                status: 401,
                detail: "Not authenticated".into(),
            }),
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApplicationError> {
        let builder = self.authorized(self.http.get(self.url(path)))?;
        let resp = builder.send().await.map_err(request_error)?;
        decode(resp).await
    }

    pub async fn register(&self, registration: &Registration) -> Result<UserProfile, ApplicationError> {
        let resp = self
            .http
            .post(self.url("/auth/register"))
            .json(registration)
            .send()
            .await
            .map_err(request_error)?;
        decode(resp).await
    }

    /// Exchange username and password for a bearer credential.
    pub async fn login(&self, username: &str, password: &str) -> Result<Credential, CommlinkError> {
        let resp = self
            .http
            .post(self.url("/auth/token"))
            .form(&[("username", username), ("password", password)])
            .send()
            .await
            .map_err(request_error)?;

        if resp.status() == StatusCode::UNAUTHORIZED {
            return Err(AuthError::Rejected { status: 401 }.into());
        }
        let token: TokenResponse = decode(resp).await?;
        if token.access_token.is_empty() {
            return Err(AuthError::MissingCredential.into());
        }
        Ok(Credential::new(token.access_token))
    }

    pub async fn current_user(&self) -> Result<UserProfile, ApplicationError> {
        self.get_json("/users/me").await
    }

    pub async fn conversations(&self) -> Result<Vec<ConversationSummary>, ApplicationError> {
        self.get_json("/chat/conversations").await
    }

    pub async fn mark_read(&self, peer: UserId) -> Result<(), ApplicationError> {
        let path = format!("/chat/conversations/{peer}/read");
        let builder = self.authorized(self.http.post(self.url(&path)))?;
        let resp = builder.send().await.map_err(request_error)?;
        ensure_success(resp).await.map(|_| ())
    }

    pub async fn health(&self) -> Result<HealthStatus, ApplicationError> {
        let resp = self
            .http
            .get(self.url("/health"))
            .send()
            .await
            .map_err(request_error)?;
        decode(resp).await
    }
}

#[async_trait]
impl ServiceApi for ApiClient {
    async fn fetch_messages(&self, peer: UserId) -> Result<Vec<Message>, ApplicationError> {
        self.get_json(&format!("/chat/messages/{peer}")).await
    }

    async fn send_message(
        &self,
        content: &str,
        receiver: UserId,
    ) -> Result<Message, ApplicationError> {
        let body = SendMessageBody {
            content,
            receiver_id: receiver,
        };
        let builder = self.authorized(self.http.post(self.url("/chat/send")).json(&body))?;
        let resp = builder.send().await.map_err(request_error)?;
        decode(resp).await
    }

    async fn sent_payments(&self) -> Result<Vec<PaymentEvent>, ApplicationError> {
        self.get_json("/payment/sent").await
    }

    async fn received_payments(&self) -> Result<Vec<PaymentEvent>, ApplicationError> {
        self.get_json("/payment/received").await
    }

    async fn create_payment_intent(
        &self,
        amount: i64,
        recipient: UserId,
    ) -> Result<PaymentIntent, ApplicationError> {
        validate_payment(amount, recipient)?;
        let body = PaymentIntentBody {
            amount,
            recipient_id: recipient,
        };
        let builder =
            self.authorized(self.http.post(self.url("/payment/create-intent")).json(&body))?;
        let resp = builder.send().await.map_err(request_error)?;
        decode(resp).await
    }

    async fn search_users(&self, query: &str) -> Result<Vec<UserSummary>, ApplicationError> {
        let query = validate_search(query)?;
        let builder = self.authorized(
            self.http
                .get(self.url("/users/search"))
                .query(&[("query", query)]),
        )?;
        let resp = builder.send().await.map_err(request_error)?;
        decode(resp).await
    }
}

pub fn validate_payment(amount: i64, recipient: UserId) -> Result<(), ApplicationError> {
    if amount <= 0 {
        return Err(ApplicationError::InvalidInput("amount must be positive".into()));
    }
    if !recipient.is_valid() {
        return Err(ApplicationError::InvalidInput("invalid recipient".into()));
    }
    Ok(())
}

pub fn validate_search(query: &str) -> Result<&str, ApplicationError> {
    let query = query.trim();
    if query.chars().count() < MIN_SEARCH_QUERY_LEN {
        return Err(ApplicationError::InvalidInput(format!(
            "search query must be at least {MIN_SEARCH_QUERY_LEN} characters"
        )));
    }
    Ok(query)
}

fn request_error(e: reqwest::Error) -> ApplicationError {
    warn!(error = %e, "Request failed");
    ApplicationError::Request(e.to_string())
}

async fn ensure_success(resp: Response) -> Result<Response, ApplicationError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    let detail = detail_from_body(&body)
        .unwrap_or_else(|| status.canonical_reason().unwrap_or("error").to_string());
    debug!(status = status.as_u16(), detail = %detail, "Request rejected");
    Err(ApplicationError::Status {
        status: status.as_u16(),
        detail,
    })
}

async fn decode<T: DeserializeOwned>(resp: Response) -> Result<T, ApplicationError> {
    let resp = ensure_success(resp).await?;
    resp.json::<T>()
        .await
        .map_err(|e| ApplicationError::Decode(e.to_string()))
}

/// Pull the `detail` field out of an error body. The server sends either a
/// string or a list of validation errors.
pub fn detail_from_body(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    match value.get("detail")? {
        serde_json::Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detail_from_body() {
        assert_eq!(
            detail_from_body(r#"{"detail":"Recipient not found"}"#).as_deref(),
            Some("Recipient not found")
        );
        let nested = detail_from_body(r#"{"detail":[{"loc":["body","amount"]}]}"#).unwrap();
        assert!(nested.contains("amount"));
        assert_eq!(detail_from_body("Internal Server Error"), None);
        assert_eq!(detail_from_body(r#"{"error":"x"}"#), None);
    }

    #[test]
    fn test_payment_validation() {
        assert!(validate_payment(500, UserId(2)).is_ok());
        assert!(matches!(
            validate_payment(0, UserId(2)),
            Err(ApplicationError::InvalidInput(_))
        ));
        assert!(matches!(
            validate_payment(100, UserId(0)),
            Err(ApplicationError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_search_validation() {
        assert_eq!(validate_search("  al ").unwrap(), "al");
        assert!(validate_search("a").is_err());
        assert!(validate_search("   ").is_err());
    }

    #[test]
    fn test_conversation_summary_accepts_naive_timestamp() {
        let raw = r#"{"user_id":4,"last_message":"hi","last_message_time":"2025-03-01T10:00:00.123456","unread_count":0}"#;
        let summary: ConversationSummary = serde_json::from_str(raw).unwrap();
        assert_eq!(summary.user_id, UserId(4));
        assert_eq!(summary.last_message, "hi");
    }

    #[tokio::test]
    async fn test_authorized_call_without_credential() {
        let client = ApiClient::new("http://127.0.0.1:1/").unwrap();
        assert_eq!(client.base_url(), "http://127.0.0.1:1");
        let err = client.fetch_messages(UserId(2)).await.unwrap_err();
        assert_eq!(
            err,
            ApplicationError::Status {
                status: 401,
                detail: "Not authenticated".into()
            }
        );
    }

    #[tokio::test]
    async fn test_invalid_payment_never_hits_network() {
        let mut client = ApiClient::new("http://127.0.0.1:1").unwrap();
        client.set_credential(Credential::new("t"));
        let err = client.create_payment_intent(-5, UserId(2)).await.unwrap_err();
        assert!(matches!(err, ApplicationError::InvalidInput(_)));
    }
}
