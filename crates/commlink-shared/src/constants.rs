/// Application name
pub const APP_NAME: &str = "Commlink";

/// Default collaborator API base URL (local development server)
pub const DEFAULT_API_URL: &str = "http://localhost:8000";

/// Path of the persistent connection, suffixed with the user id
pub const WS_PATH_PREFIX: &str = "/chat/ws";

/// Keep-alive ping interval in seconds
pub const KEEPALIVE_INTERVAL_SECS: u64 = 30;

/// Received-payments reconciliation poll interval in seconds
pub const PAYMENT_POLL_INTERVAL_SECS: u64 = 10;

/// Calls that have not reached Active within this many seconds are ended
pub const CALL_SETUP_TIMEOUT_SECS: u64 = 45;

/// WebSocket handshake timeout in seconds
pub const CONNECT_TIMEOUT_SECS: u64 = 10;

/// Reconnect backoff bounds in seconds
pub const RECONNECT_MIN_SECS: u64 = 1;
pub const RECONNECT_MAX_SECS: u64 = 30;

/// Minimum length of a user search query
pub const MIN_SEARCH_QUERY_LEN: usize = 2;

/// Default STUN server for ICE gathering
pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";
