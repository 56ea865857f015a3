//! Client configuration loaded from environment variables.
//!
//! Every setting has a default so the client starts against a local
//! development server with zero configuration.

use std::time::Duration;

use tracing::warn;

use commlink_net::{ws_base_from_api, ConnectionConfig};
use commlink_shared::constants::{
    CALL_SETUP_TIMEOUT_SECS, CONNECT_TIMEOUT_SECS, DEFAULT_API_URL, DEFAULT_STUN_SERVER,
    KEEPALIVE_INTERVAL_SECS, PAYMENT_POLL_INTERVAL_SECS,
};

#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    /// HTTP base of the collaborator API.
    /// Env: `COMMLINK_API_URL`
    /// Default: `http://localhost:8000`
    pub api_url: String,

    /// WebSocket base for the persistent connection.
    /// Env: `COMMLINK_WS_URL`
    /// Default: `api_url` with the `http` scheme swapped for `ws`.
    pub ws_url: String,

    /// Env: `COMMLINK_KEEPALIVE_SECS`
    /// Default: 30 s
    pub keepalive_interval: Duration,

    /// Received-payments poll. `None` disables polling.
    /// Env: `COMMLINK_PAYMENT_POLL_SECS` (0 = off)
    /// Default: 10 s
    pub payment_poll_interval: Option<Duration>,

    /// Calls not Active within this window are ended. `None` disables it.
    /// Env: `COMMLINK_CALL_SETUP_TIMEOUT_SECS` (0 = off)
    /// Default: 45 s
    pub call_setup_timeout: Option<Duration>,

    /// Env: `COMMLINK_CONNECT_TIMEOUT_SECS`
    /// Default: 10 s
    pub connect_timeout: Duration,

    /// Reconnect after the connection drops.
    /// Env: `COMMLINK_RECONNECT` (true/false)
    /// Default: `true`
    pub reconnect: bool,

    /// STUN/TURN URLs, comma separated.
    /// Env: `COMMLINK_ICE_SERVERS`
    pub ice_servers: Vec<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            ws_url: ws_base_from_api(DEFAULT_API_URL),
            keepalive_interval: Duration::from_secs(KEEPALIVE_INTERVAL_SECS),
            payment_poll_interval: Some(Duration::from_secs(PAYMENT_POLL_INTERVAL_SECS)),
            call_setup_timeout: Some(Duration::from_secs(CALL_SETUP_TIMEOUT_SECS)),
            connect_timeout: Duration::from_secs(CONNECT_TIMEOUT_SECS),
            reconnect: true,
            ice_servers: vec![DEFAULT_STUN_SERVER.to_string()],
        }
    }
}

impl ClientConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(url) = lookup("COMMLINK_API_URL") {
            let url = url.trim().trim_end_matches('/').to_string();
            if url.starts_with("http://") || url.starts_with("https://") {
                config.ws_url = ws_base_from_api(&url);
                config.api_url = url;
            } else {
                warn!(value = %url, "Invalid COMMLINK_API_URL, using default");
            }
        }

        if let Some(url) = lookup("COMMLINK_WS_URL") {
            let url = url.trim().trim_end_matches('/').to_string();
            if url.starts_with("ws://") || url.starts_with("wss://") {
                config.ws_url = url;
            } else {
                warn!(value = %url, "Invalid COMMLINK_WS_URL, using default");
            }
        }

        if let Some(secs) = seconds(&lookup, "COMMLINK_KEEPALIVE_SECS") {
            if secs > 0 {
                config.keepalive_interval = Duration::from_secs(secs);
            }
        }

        if let Some(secs) = seconds(&lookup, "COMMLINK_PAYMENT_POLL_SECS") {
            config.payment_poll_interval = (secs > 0).then(|| Duration::from_secs(secs));
        }

        if let Some(secs) = seconds(&lookup, "COMMLINK_CALL_SETUP_TIMEOUT_SECS") {
            config.call_setup_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }

        if let Some(secs) = seconds(&lookup, "COMMLINK_CONNECT_TIMEOUT_SECS") {
            if secs > 0 {
                config.connect_timeout = Duration::from_secs(secs);
            }
        }

        if let Some(val) = lookup("COMMLINK_RECONNECT") {
            config.reconnect = val != "false" && val != "0";
        }

        if let Some(val) = lookup("COMMLINK_ICE_SERVERS") {
            let servers: Vec<String> = val
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
            if !servers.is_empty() {
                config.ice_servers = servers;
            }
        }

        config
    }

    pub fn connection(&self) -> ConnectionConfig {
        ConnectionConfig {
            ws_url: self.ws_url.clone(),
            keepalive_interval: self.keepalive_interval,
            connect_timeout: self.connect_timeout,
        }
    }
}

fn seconds<F>(lookup: &F, key: &str) -> Option<u64>
where
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    match raw.trim().parse::<u64>() {
        Ok(n) => Some(n),
        Err(_) => {
            warn!(key, value = %raw, "Invalid number, using default");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> ClientConfig {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ClientConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_default_config() {
        let config = config_from(&[]);
        assert_eq!(config, ClientConfig::default());
        assert_eq!(config.ws_url, "ws://localhost:8000");
        assert_eq!(config.keepalive_interval, Duration::from_secs(30));
        assert_eq!(config.payment_poll_interval, Some(Duration::from_secs(10)));
        assert!(config.reconnect);
    }

    #[test]
    fn test_api_url_derives_ws_url() {
        let config = config_from(&[("COMMLINK_API_URL", "https://api.example.com/")]);
        assert_eq!(config.api_url, "https://api.example.com");
        assert_eq!(config.ws_url, "wss://api.example.com");

        let config = config_from(&[
            ("COMMLINK_API_URL", "https://api.example.com"),
            ("COMMLINK_WS_URL", "wss://rt.example.com"),
        ]);
        assert_eq!(config.ws_url, "wss://rt.example.com");
    }

    #[test]
    fn test_zero_disables_poll_and_timeout() {
        let config = config_from(&[
            ("COMMLINK_PAYMENT_POLL_SECS", "0"),
            ("COMMLINK_CALL_SETUP_TIMEOUT_SECS", "0"),
            ("COMMLINK_RECONNECT", "false"),
        ]);
        assert_eq!(config.payment_poll_interval, None);
        assert_eq!(config.call_setup_timeout, None);
        assert!(!config.reconnect);
    }

    #[test]
    fn test_invalid_values_keep_defaults() {
        let config = config_from(&[
            ("COMMLINK_KEEPALIVE_SECS", "soon"),
            ("COMMLINK_API_URL", "localhost"),
            ("COMMLINK_ICE_SERVERS", " , "),
        ]);
        assert_eq!(config, ClientConfig::default());
    }

    #[test]
    fn test_ice_server_list() {
        let config = config_from(&[(
            "COMMLINK_ICE_SERVERS",
            "stun:a.example:3478, turn:b.example:3478",
        )]);
        assert_eq!(
            config.ice_servers,
            vec!["stun:a.example:3478", "turn:b.example:3478"]
        );
    }
}
