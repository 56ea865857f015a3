use std::time::Duration;

use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue};
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};

use commlink_shared::constants::WS_PATH_PREFIX;
use commlink_shared::error::{AuthError, ConnectError, TransportError};
use commlink_shared::types::{Credential, UserId};

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Derive the WebSocket base URL from the HTTP API base
/// (`http://` -> `ws://`, `https://` -> `wss://`).
pub fn ws_base_from_api(api_url: &str) -> String {
    match api_url.strip_prefix("http") {
        Some(rest) => format!("ws{rest}"),
        None => api_url.to_string(),
    }
}

/// Full endpoint of the persistent connection for `user_id`.
pub fn endpoint_for(ws_base: &str, user_id: UserId) -> String {
    format!("{}{}/{}", ws_base.trim_end_matches('/'), WS_PATH_PREFIX, user_id)
}

/// Perform the WebSocket handshake, presenting `credential` as a bearer token.
pub async fn open_socket(
    endpoint: &str,
    credential: &Credential,
    timeout: Duration,
) -> Result<WsStream, ConnectError> {
    if credential.is_empty() {
        return Err(AuthError::MissingCredential.into());
    }

    let mut request = endpoint
        .into_client_request()
        .map_err(|e| TransportError::InvalidEndpoint(e.to_string()))?;
    let bearer =
        HeaderValue::from_str(&credential.bearer()).map_err(|_| AuthError::InvalidCredential)?;
    request.headers_mut().insert(AUTHORIZATION, bearer);

    debug!(endpoint = %endpoint, "Opening WebSocket");

    let (stream, response) = match tokio::time::timeout(timeout, connect_async(request)).await {
        Err(_) => return Err(TransportError::Timeout.into()),
        Ok(Err(e)) => return Err(classify_handshake_error(e)),
        Ok(Ok(pair)) => pair,
    };

    info!(endpoint = %endpoint, status = %response.status(), "WebSocket handshake complete");
    Ok(stream)
}

fn classify_handshake_error(e: WsError) -> ConnectError {
    match e {
        WsError::Http(response) => {
            let status = response.status().as_u16();
            if status == 401 || status == 403 {
                AuthError::Rejected { status }.into()
            } else {
                TransportError::Handshake(format!("HTTP {status}")).into()
            }
        }
        WsError::Url(e) => TransportError::InvalidEndpoint(e.to_string()).into(),
        other => TransportError::Handshake(other.to_string()).into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ws_base_from_api() {
        assert_eq!(ws_base_from_api("http://localhost:8000"), "ws://localhost:8000");
        assert_eq!(
            ws_base_from_api("https://comm-app-backend.onrender.com"),
            "wss://comm-app-backend.onrender.com"
        );
        assert_eq!(ws_base_from_api("ws://already"), "ws://already");
    }

    #[test]
    fn test_endpoint_for_user() {
        assert_eq!(
            endpoint_for("ws://localhost:8000/", UserId(42)),
            "ws://localhost:8000/chat/ws/42"
        );
    }

    #[tokio::test]
    async fn test_empty_credential_is_auth_error() {
        let result = open_socket(
            "ws://127.0.0.1:1/chat/ws/1",
            &Credential::new("  "),
            Duration::from_secs(1),
        )
        .await;
        assert!(matches!(
            result,
            Err(ConnectError::Auth(AuthError::MissingCredential))
        ));
    }

    #[tokio::test]
    async fn test_invalid_endpoint() {
        let result = open_socket("not a url", &Credential::new("t"), Duration::from_secs(1)).await;
        assert!(matches!(
            result,
            Err(ConnectError::Transport(TransportError::InvalidEndpoint(_)))
        ));
    }
}
