//! The single persistent connection to the server.
//!
//! The socket runs in a dedicated tokio task. The rest of the client talks
//! to it through a [`ConnectionHandle`] (outbound frames, close) and receives
//! [`ConnectionEvent`]s (open, inbound text, close) on one unbounded channel,
//! in the order the socket produced them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};

use commlink_shared::constants::{CONNECT_TIMEOUT_SECS, DEFAULT_API_URL, KEEPALIVE_INTERVAL_SECS};
use commlink_shared::error::{ConnectError, TransportError};
use commlink_shared::protocol::{FrameSink, OutboundFrame};
use commlink_shared::types::{Credential, UserId};

use crate::transport::{endpoint_for, open_socket, ws_base_from_api, WsStream};

/// Configuration for the persistent connection.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// WebSocket base URL; the endpoint is `<ws_url>/chat/ws/<user id>`.
    pub ws_url: String,
    /// Interval between keep-alive pings.
    pub keepalive_interval: Duration,
    /// Upper bound on the WebSocket handshake.
    pub connect_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            ws_url: ws_base_from_api(DEFAULT_API_URL),
            keepalive_interval: Duration::from_secs(KEEPALIVE_INTERVAL_SECS),
            connect_timeout: Duration::from_secs(CONNECT_TIMEOUT_SECS),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// `close()` was called locally.
    Local,
    /// The server closed the socket (inactivity, shutdown, ...).
    Remote(String),
    /// Read or write failure on the socket.
    Error(String),
}

/// Notifications sent *from* the connection to the session.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// The handshake succeeded; the handle is live.
    Opened { handle: ConnectionHandle },
    /// The handshake failed; no connection exists.
    Failed { conn_id: u64, error: ConnectError },
    /// One inbound text frame, uninterpreted.
    Frame { conn_id: u64, text: String },
    /// The socket is gone and the keep-alive is cancelled.
    Closed { conn_id: u64, reason: CloseReason },
}

#[derive(Debug)]
enum Outgoing {
    Text(String),
    Close,
}

/// Cheap, cloneable handle to a live socket task.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    conn_id: u64,
    outbound: mpsc::UnboundedSender<Outgoing>,
    live: Arc<AtomicBool>,
}

impl ConnectionHandle {
    pub fn id(&self) -> u64 {
        self.conn_id
    }

    pub fn is_open(&self) -> bool {
        self.live.load(Ordering::SeqCst) && !self.outbound.is_closed()
    }

    /// Queue a frame for the socket task.
    pub fn send(&self, frame: &OutboundFrame) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::NotConnected);
        }
        let text = frame.to_json()?;
        self.outbound.send(Outgoing::Text(text)).map_err(|_| {
            self.live.store(false, Ordering::SeqCst);
            TransportError::NotConnected
        })
    }

    /// Ask the socket task to send a close frame and stop.
    pub fn close(&self) {
        self.live.store(false, Ordering::SeqCst);
        let _ = self.outbound.send(Outgoing::Close);
    }
}

/// Open a connection and spawn its socket task.
///
/// The socket task reports on `events`: first `Opened` with a clone of the
/// returned handle, then inbound frames, then exactly one `Closed`.
pub async fn connect(
    config: &ConnectionConfig,
    conn_id: u64,
    user_id: UserId,
    credential: &Credential,
    events: mpsc::UnboundedSender<ConnectionEvent>,
) -> Result<ConnectionHandle, ConnectError> {
    let endpoint = endpoint_for(&config.ws_url, user_id);
    let stream = open_socket(&endpoint, credential, config.connect_timeout).await?;

    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let handle = ConnectionHandle {
        conn_id,
        outbound: outbound_tx,
        live: Arc::new(AtomicBool::new(true)),
    };

    tokio::spawn(socket_loop(
        stream,
        handle.clone(),
        outbound_rx,
        events,
        config.keepalive_interval,
    ));

    Ok(handle)
}

async fn socket_loop(
    stream: WsStream,
    handle: ConnectionHandle,
    mut outbound_rx: mpsc::UnboundedReceiver<Outgoing>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    keepalive: Duration,
) {
    let conn_id = handle.conn_id;
    let live = handle.live.clone();
    let (mut sink, mut stream) = stream.split();

    let mut ticker = tokio::time::interval_at(Instant::now() + keepalive, keepalive);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(conn = conn_id, "Connection open");
    // Nothing from this socket may reach the channel ahead of the handle.
    let _ = events.send(ConnectionEvent::Opened { handle });

    let reason = loop {
        tokio::select! {
            out = outbound_rx.recv() => match out {
                Some(Outgoing::Text(text)) => {
                    if let Err(e) = sink.send(WsMessage::Text(text)).await {
                        break CloseReason::Error(e.to_string());
                    }
                }
                Some(Outgoing::Close) | None => {
                    let _ = sink.send(WsMessage::Close(None)).await;
                    break CloseReason::Local;
                }
            },

            _ = ticker.tick() => {
                match OutboundFrame::Ping.to_json() {
                    Ok(ping) => {
                        if let Err(e) = sink.send(WsMessage::Text(ping)).await {
                            break CloseReason::Error(e.to_string());
                        }
                        debug!(conn = conn_id, "Keep-alive sent");
                    }
                    Err(e) => warn!(error = %e, "Failed to encode keep-alive"),
                }
            }

            incoming = stream.next() => match incoming {
                Some(Ok(WsMessage::Text(text))) => {
                    let _ = events.send(ConnectionEvent::Frame { conn_id, text });
                }
                Some(Ok(WsMessage::Binary(bytes))) => match String::from_utf8(bytes) {
                    Ok(text) => {
                        let _ = events.send(ConnectionEvent::Frame { conn_id, text });
                    }
                    Err(_) => debug!(conn = conn_id, "Dropping non-UTF-8 binary frame"),
                },
                Some(Ok(WsMessage::Close(frame))) => {
                    break CloseReason::Remote(
                        frame.map(|f| f.reason.to_string()).unwrap_or_default(),
                    );
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => break CloseReason::Error(e.to_string()),
                None => break CloseReason::Remote("stream ended".into()),
            },
        }
    };

    live.store(false, Ordering::SeqCst);
    info!(conn = conn_id, reason = ?reason, "Connection closed");
    let _ = events.send(ConnectionEvent::Closed { conn_id, reason });
}

#[derive(Debug)]
enum LinkState {
    Idle,
    Connecting { conn_id: u64 },
    Open(ConnectionHandle),
}

/// Owns the (at most one) connection of an authenticated session.
///
/// Connect attempts run in the background; their outcome arrives as
/// [`ConnectionEvent::Opened`] or [`ConnectionEvent::Failed`] and must be fed
/// back through [`ConnectionManager::observe`] before anything else looks at
/// the event.
pub struct ConnectionManager {
    config: ConnectionConfig,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    state: LinkState,
    next_id: u64,
}

impl ConnectionManager {
    pub fn new(config: ConnectionConfig, events: mpsc::UnboundedSender<ConnectionEvent>) -> Self {
        Self {
            config,
            events,
            state: LinkState::Idle,
            next_id: 1,
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(&self.state, LinkState::Open(handle) if handle.is_open())
    }

    /// Start a connect attempt. Returns `false` (no-op) when a connection is
    /// already open or an attempt is in flight.
    pub fn connect(&mut self, user_id: UserId, credential: Credential) -> bool {
        match &self.state {
            LinkState::Open(handle) if handle.is_open() => {
                debug!(conn = handle.id(), "Connect ignored: already open");
                return false;
            }
            LinkState::Connecting { conn_id } => {
                debug!(conn = *conn_id, "Connect ignored: attempt in flight");
                return false;
            }
            _ => {}
        }

        let conn_id = self.next_id;
        self.next_id += 1;
        self.state = LinkState::Connecting { conn_id };

        let config = self.config.clone();
        let events = self.events.clone();
        info!(conn = conn_id, user = %user_id, "Connecting");

        tokio::spawn(async move {
            if let Err(error) = connect(&config, conn_id, user_id, &credential, events.clone()).await {
                let _ = events.send(ConnectionEvent::Failed { conn_id, error });
            }
        });

        true
    }

    /// Apply a connection event to the manager's own bookkeeping.
    ///
    /// Returns `false` when the event belongs to a superseded connection and
    /// must be ignored by the caller.
    pub fn observe(&mut self, event: &ConnectionEvent) -> bool {
        match event {
            ConnectionEvent::Opened { handle } => match self.state {
                LinkState::Connecting { conn_id } if conn_id == handle.id() => {
                    self.state = LinkState::Open(handle.clone());
                    true
                }
                _ => {
                    debug!(conn = handle.id(), "Closing superseded connection");
                    handle.close();
                    false
                }
            },
            ConnectionEvent::Failed { conn_id, error } => match self.state {
                LinkState::Connecting { conn_id: current } if current == *conn_id => {
                    warn!(conn = *conn_id, error = %error, "Connect failed");
                    self.state = LinkState::Idle;
                    true
                }
                _ => false,
            },
            ConnectionEvent::Frame { conn_id, .. } => self.is_current(*conn_id),
            ConnectionEvent::Closed { conn_id, .. } => {
                if self.is_current(*conn_id) {
                    self.state = LinkState::Idle;
                    true
                } else {
                    false
                }
            }
        }
    }

    fn is_current(&self, conn_id: u64) -> bool {
        matches!(&self.state, LinkState::Open(handle) if handle.id() == conn_id)
    }

    /// Send a frame on the open connection. Without one, the frame is
    /// dropped with a warning and `NotConnected` is returned.
    pub fn send(&self, frame: &OutboundFrame) -> Result<(), TransportError> {
        match &self.state {
            LinkState::Open(handle) => handle.send(frame).map_err(|e| {
                warn!(frame = frame.kind(), error = %e, "Frame not sent");
                e
            }),
            _ => {
                warn!(frame = frame.kind(), "Frame dropped: no open connection");
                Err(TransportError::NotConnected)
            }
        }
    }

    /// Close the connection (or abandon an in-flight attempt).
    pub fn close(&mut self) {
        match std::mem::replace(&mut self.state, LinkState::Idle) {
            LinkState::Open(handle) => handle.close(),
            LinkState::Connecting { conn_id } => {
                debug!(conn = conn_id, "Abandoning connect attempt");
            }
            LinkState::Idle => {}
        }
    }
}

impl FrameSink for ConnectionManager {
    fn is_open(&self) -> bool {
        ConnectionManager::is_open(self)
    }

    fn send_frame(&self, frame: &OutboundFrame) -> Result<(), TransportError> {
        self.send(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> (ConnectionManager, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ConnectionManager::new(ConnectionConfig::default(), tx), rx)
    }

    fn fake_handle(conn_id: u64) -> (ConnectionHandle, mpsc::UnboundedReceiver<Outgoing>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = ConnectionHandle {
            conn_id,
            outbound: tx,
            live: Arc::new(AtomicBool::new(true)),
        };
        (handle, rx)
    }

    #[test]
    fn test_send_without_connection_fails() {
        let (mgr, _rx) = manager();
        assert!(!mgr.is_open());
        assert_eq!(
            mgr.send(&OutboundFrame::Ping),
            Err(TransportError::NotConnected)
        );
    }

    #[test]
    fn test_handle_send_and_close() {
        let (handle, mut rx) = fake_handle(1);
        handle.send(&OutboundFrame::Ping).unwrap();
        match rx.try_recv().unwrap() {
            Outgoing::Text(text) => assert_eq!(text, r#"{"type":"ping"}"#),
            other => panic!("unexpected {other:?}"),
        }

        handle.close();
        assert!(!handle.is_open());
        assert!(matches!(rx.try_recv().unwrap(), Outgoing::Close));
        assert_eq!(
            handle.send(&OutboundFrame::Ping),
            Err(TransportError::NotConnected)
        );
    }

    #[tokio::test]
    async fn test_second_connect_while_connecting_is_noop() {
        let (mut mgr, _rx) = manager();
        assert!(mgr.connect(UserId(1), Credential::new("t")));
        assert!(!mgr.is_open());
        assert!(!mgr.connect(UserId(1), Credential::new("t")));
    }

    #[tokio::test]
    async fn test_observe_tracks_current_connection() {
        let (mut mgr, _rx) = manager();
        assert!(mgr.connect(UserId(1), Credential::new("t")));

        let (handle, _out) = fake_handle(1);
        assert!(mgr.observe(&ConnectionEvent::Opened {
            handle: handle.clone()
        }));
        assert!(mgr.is_open());
        assert!(!mgr.connect(UserId(1), Credential::new("t")));

        // Frames and closes from other connections are not ours.
        assert!(!mgr.observe(&ConnectionEvent::Frame {
            conn_id: 9,
            text: "{}".into()
        }));
        assert!(!mgr.observe(&ConnectionEvent::Closed {
            conn_id: 9,
            reason: CloseReason::Local
        }));
        assert!(mgr.is_open());

        assert!(mgr.observe(&ConnectionEvent::Closed {
            conn_id: 1,
            reason: CloseReason::Remote("bye".into())
        }));
        assert!(!mgr.is_open());
    }

    #[tokio::test]
    async fn test_opened_after_close_is_superseded() {
        let (mut mgr, _rx) = manager();
        assert!(mgr.connect(UserId(1), Credential::new("t")));
        mgr.close();

        let (handle, mut out) = fake_handle(1);
        assert!(!mgr.observe(&ConnectionEvent::Opened { handle }));
        assert!(!mgr.is_open());
        assert!(matches!(out.try_recv().unwrap(), Outgoing::Close));
    }
}
