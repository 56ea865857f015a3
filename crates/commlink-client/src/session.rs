//! The session loop.
//!
//! A single task owns the [`SessionState`], the connection manager and the
//! call driver. It waits on every input at once (user commands, connection
//! events, call completions, API completions, the payment poll and the
//! reconnect timer) and runs each handler to completion before taking the
//! next input. Anything slow is spawned and reports back through a channel.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use commlink_media::{
    CallCompletion, CallDriver, CallEffect, CallError, CallMachine, CallNotice, EndReason,
    MediaRuntime,
};
use commlink_net::api::{validate_payment, validate_search};
use commlink_net::{ConnectionEvent, ConnectionManager, PaymentIntent, ServiceApi, UserSummary};
use commlink_shared::constants::{RECONNECT_MAX_SECS, RECONNECT_MIN_SECS};
use commlink_shared::error::{ApplicationError, ConnectError};
use commlink_shared::protocol::FrameSink;
use commlink_shared::types::{
    ConnectionMode, Credential, Message, PaymentEvent, UserId, UserProfile,
};

use crate::chat::Delivery;
use crate::commands::{typing_frame, Command, CommandError};
use crate::config::ClientConfig;
use crate::events::{emit_event, ClientEvent};
use crate::router::{self, CallSignal, ChatSignal, PaymentSignal, Routed};
use crate::state::SessionState;

const UNREAD_PREVIEW_CHARS: usize = 80;

/// Results of collaborator calls, posted back into the loop.
enum ApiCompletion {
    History {
        peer: UserId,
        result: Result<Vec<Message>, ApplicationError>,
    },
    Sent {
        key: Uuid,
        result: Result<Message, ApplicationError>,
    },
    SentPayments(Result<Vec<PaymentEvent>, ApplicationError>),
    ReceivedPayments {
        result: Result<Vec<PaymentEvent>, ApplicationError>,
        /// Poll failures are logged only.
        requested: bool,
    },
    PaymentIntent {
        recipient: UserId,
        amount: i64,
        result: Result<PaymentIntent, ApplicationError>,
    },
    Search {
        query: String,
        result: Result<Vec<UserSummary>, ApplicationError>,
    },
}

/// Exponential reconnect delay.
#[derive(Debug)]
struct Backoff {
    min: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max,
            current: min,
        }
    }

    fn next(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    fn reset(&mut self) {
        self.current = self.min;
    }
}

/// Handles returned by [`spawn_session`].
pub struct SessionHandle {
    pub commands: mpsc::UnboundedSender<Command>,
    pub events: mpsc::UnboundedReceiver<ClientEvent>,
    pub task: JoinHandle<()>,
}

/// Start the session loop for an authenticated user.
///
/// The loop connects immediately and runs until [`Command::Logout`] is
/// received or the command sender is dropped.
pub fn spawn_session(
    config: ClientConfig,
    user: UserProfile,
    credential: Credential,
    api: Arc<dyn ServiceApi>,
    media: Arc<dyn MediaRuntime>,
) -> SessionHandle {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (conn_tx, conn_rx) = mpsc::unbounded_channel();
    let (call_tx, call_rx) = mpsc::unbounded_channel();
    let (api_tx, api_rx) = mpsc::unbounded_channel();

    let session = Session {
        connection: ConnectionManager::new(config.connection(), conn_tx),
        driver: CallDriver::new(media, call_tx),
        state: SessionState::new(user, credential, &config),
        backoff: Backoff::new(
            Duration::from_secs(RECONNECT_MIN_SECS),
            Duration::from_secs(RECONNECT_MAX_SECS),
        ),
        config,
        api,
        api_tx,
        events: event_tx,
        reconnect_at: None,
        logged_out: false,
    };

    let task = tokio::spawn(session.run(cmd_rx, conn_rx, call_rx, api_rx));

    SessionHandle {
        commands: cmd_tx,
        events: event_rx,
        task,
    }
}

struct Session {
    config: ClientConfig,
    state: SessionState,
    connection: ConnectionManager,
    driver: CallDriver,
    api: Arc<dyn ServiceApi>,
    api_tx: mpsc::UnboundedSender<ApiCompletion>,
    events: mpsc::UnboundedSender<ClientEvent>,
    backoff: Backoff,
    reconnect_at: Option<Instant>,
    logged_out: bool,
}

impl Session {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut conn_rx: mpsc::UnboundedReceiver<ConnectionEvent>,
        mut call_rx: mpsc::UnboundedReceiver<CallCompletion>,
        mut api_rx: mpsc::UnboundedReceiver<ApiCompletion>,
    ) {
        info!(user = %self.state.user.id, "Session started");
        let mut poll = self.config.payment_poll_interval.map(|every| {
            let mut ticker = time::interval_at(Instant::now() + every, every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });

        self.open_connection();

        loop {
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(Command::Logout) => {
                        self.logout();
                        emit_event(&self.events, ClientEvent::LoggedOut);
                        break;
                    }
                    Some(cmd) => self.handle_command(cmd),
                    None => {
                        debug!("Command channel closed");
                        self.logout();
                        break;
                    }
                },
                Some(event) = conn_rx.recv() => self.handle_connection_event(event),
                Some(completion) = call_rx.recv() => self.handle_call_completion(completion),
                Some(completion) = api_rx.recv() => self.handle_api_completion(completion),
                _ = next_poll(&mut poll) => self.fetch_received(false),
                _ = reconnect_due(self.reconnect_at) => {
                    self.reconnect_at = None;
                    self.open_connection();
                }
            }
        }

        info!(user = %self.state.user.id, "Session ended");
    }

    fn open_connection(&mut self) {
        if self.logged_out {
            return;
        }
        let user = self.state.user.id;
        if self.connection.connect(user, self.state.credential.clone()) {
            self.set_mode(ConnectionMode::Connecting);
        }
    }

    fn set_mode(&mut self, mode: ConnectionMode) {
        if self.state.connection_mode != mode {
            self.state.connection_mode = mode;
            emit_event(&self.events, ClientEvent::ConnectionChanged { mode });
        }
    }

    /// Arm the reconnect timer. `None` when reconnecting is off.
    fn schedule_reconnect(&mut self) -> Option<Duration> {
        if self.logged_out || !self.config.reconnect {
            return None;
        }
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..250));
        let delay = self.backoff.next() + jitter;
        self.reconnect_at = Some(Instant::now() + delay);
        info!(delay_ms = delay.as_millis() as u64, "Reconnect scheduled");
        Some(delay)
    }

    fn logout(&mut self) {
        self.logged_out = true;
        self.reconnect_at = None;
        if !self.state.call.is_idle() {
            match self.state.call.hang_up(&self.connection) {
                Ok(effects) => self.apply_call_effects(effects),
                Err(e) => debug!(error = %e, "Hang up on logout failed"),
            }
        }
        self.connection.close();
        self.set_mode(ConnectionMode::Disconnected);
        info!(user = %self.state.user.id, "Logged out");
    }

    fn handle_connection_event(&mut self, event: ConnectionEvent) {
        if !self.connection.observe(&event) {
            return;
        }

        match event {
            ConnectionEvent::Opened { handle } => {
                info!(conn = handle.id(), "Connected");
                self.backoff.reset();
                self.set_mode(ConnectionMode::Connected);
                self.refresh_payments();
            }
            ConnectionEvent::Failed { error, .. } => {
                self.set_mode(ConnectionMode::Disconnected);
                let retry = match &error {
                    // A rejected credential will not get better by retrying.
                    ConnectError::Auth(_) => None,
                    ConnectError::Transport(_) => self.schedule_reconnect(),
                };
                emit_event(
                    &self.events,
                    ClientEvent::ConnectFailed {
                        error: error.to_string(),
                        retry_in_secs: retry.map(|d| d.as_secs()),
                    },
                );
            }
            ConnectionEvent::Frame { text, .. } => self.handle_frame(&text),
            ConnectionEvent::Closed { conn_id, reason } => {
                info!(conn = conn_id, reason = ?reason, "Connection closed");
                self.set_mode(ConnectionMode::Disconnected);
                let effects = self.state.call.on_transport_closed(&self.connection);
                self.apply_call_effects(effects);
                self.schedule_reconnect();
            }
        }
    }

    fn handle_frame(&mut self, text: &str) {
        let Some(routed) = router::route(text) else {
            return;
        };

        match routed {
            Routed::Chat(ChatSignal::Delivered(message)) => self.on_message(message),
            Routed::Chat(ChatSignal::Typing(from)) => {
                if self.state.chat.on_typing(from, Utc::now()) {
                    if let Some(at) = self.state.chat.peer_typing_at() {
                        emit_event(&self.events, ClientEvent::PeerTyping { peer: from, at });
                    }
                }
            }
            Routed::Payment(PaymentSignal::Created(payment)) => {
                if self.state.payments.on_created(payment) {
                    self.emit_payments();
                }
            }
            Routed::Payment(PaymentSignal::Updated(update)) => {
                if self.state.payments.on_updated(&update) {
                    self.emit_payments();
                }
            }
            Routed::Call(signal) => {
                let call = &mut self.state.call;
                let sink = &self.connection;
                let effects = match signal {
                    CallSignal::Invite { from } => call.handle_invite(from, sink),
                    CallSignal::Offer { from, sdp } => call.handle_offer(from, sdp, sink),
                    CallSignal::Answer { from, sdp } => call.handle_answer(from, sdp, sink),
                    CallSignal::Candidate { from, candidate } => {
                        call.handle_remote_candidate(from, candidate)
                    }
                    CallSignal::End { from } => call.handle_remote_end(from, sink),
                };
                self.apply_call_effects(effects);
            }
            Routed::Ignored(kind) => debug!(kind = ?kind, "Frame needs no handling"),
        }
    }

    fn on_message(&mut self, message: Message) {
        match self.state.chat.on_delivered(message.clone()) {
            Delivery::Appended => emit_event(
                &self.events,
                ClientEvent::MessageAppended {
                    message,
                    pending: None,
                },
            ),
            Delivery::Duplicate => {}
            Delivery::OtherConversation(from) => {
                if message.sender_id != self.state.user.id {
                    let preview = message.content.chars().take(UNREAD_PREVIEW_CHARS).collect();
                    emit_event(&self.events, ClientEvent::Unread { from, preview });
                }
            }
        }
    }

    fn handle_call_completion(&mut self, completion: CallCompletion) {
        let effects = self.state.call.on_completion(completion, &self.connection);
        self.apply_call_effects(effects);
    }

    fn apply_call_effects(&mut self, effects: Vec<CallEffect>) {
        for notice in self.driver.run(effects) {
            match notice {
                CallNotice::PhaseChanged { phase, peer } => emit_event(
                    &self.events,
                    ClientEvent::CallPhase {
                        phase: phase.to_string(),
                        peer,
                    },
                ),
                CallNotice::IncomingCall { from } => {
                    emit_event(&self.events, ClientEvent::IncomingCall { from })
                }
                CallNotice::Ended { peer, reason } => {
                    if let EndReason::Failed(e) = &reason {
                        emit_event(&self.events, ClientEvent::error(e));
                    }
                    emit_event(
                        &self.events,
                        ClientEvent::CallEnded {
                            peer,
                            reason: end_reason_text(&reason),
                        },
                    );
                }
            }
        }
    }

    fn handle_command(&mut self, cmd: Command) {
        debug!(command = cmd.name(), "Handling command");
        let result = match cmd {
            Command::OpenConversation(peer) => self.open_conversation(peer),
            Command::SendMessage(text) => self.send_message(&text),
            Command::Typing => self.send_typing(),
            Command::StartCall(peer) => self.call_action(|call, sink| call.start_call(peer, sink)),
            Command::AcceptCall => self.call_action(|call, sink| call.accept(sink)),
            Command::DeclineCall => self.call_action(|call, sink| call.decline(sink)),
            Command::HangUp => self.call_action(|call, sink| call.hang_up(sink)),
            Command::ToggleMute => self.toggle_media(true),
            Command::ToggleVideo => self.toggle_media(false),
            Command::CreatePayment { recipient, amount } => {
                self.create_payment(recipient, amount)
            }
            Command::SearchUsers(query) => self.search_users(&query),
            Command::RefreshPayments => {
                self.refresh_payments();
                Ok(())
            }
            Command::Logout => Ok(()),
        };

        if let Err(e) = result {
            warn!(error = %e, "Command rejected");
            emit_event(&self.events, ClientEvent::error(e));
        }
    }

    fn call_action<F>(&mut self, action: F) -> Result<(), CommandError>
    where
        F: FnOnce(&mut CallMachine, &dyn FrameSink) -> Result<Vec<CallEffect>, CallError>,
    {
        let effects = action(&mut self.state.call, &self.connection)?;
        self.apply_call_effects(effects);
        Ok(())
    }

    fn toggle_media(&mut self, audio: bool) -> Result<(), CommandError> {
        let call = &mut self.state.call;
        if audio {
            call.set_audio_enabled(!call.audio_enabled())?;
        } else {
            call.set_video_enabled(!call.video_enabled())?;
        }
        emit_event(
            &self.events,
            ClientEvent::CallToggles {
                muted: !call.audio_enabled(),
                video_enabled: call.video_enabled(),
            },
        );
        Ok(())
    }

    fn open_conversation(&mut self, peer: UserId) -> Result<(), CommandError> {
        if !peer.is_valid() || peer == self.state.user.id {
            return Err(ApplicationError::InvalidInput(format!("invalid peer {peer}")).into());
        }
        self.state.chat.open(peer);
        self.spawn_api(move |api| async move {
            ApiCompletion::History {
                peer,
                result: api.fetch_messages(peer).await,
            }
        });
        Ok(())
    }

    fn send_message(&mut self, text: &str) -> Result<(), CommandError> {
        let peer = self.state.chat.peer().ok_or(CommandError::NoConversation)?;
        let Some(pending) = self.state.chat.send_local(text, peer, Utc::now()) else {
            debug!("Blank message not sent");
            return Ok(());
        };

        if let Some(echo) = self.state.chat.entries().last() {
            emit_event(
                &self.events,
                ClientEvent::MessageAppended {
                    message: echo.message.clone(),
                    pending: echo.pending,
                },
            );
        }

        let key = pending.key;
        self.spawn_api(move |api| async move {
            ApiCompletion::Sent {
                key,
                result: api.send_message(&pending.content, pending.receiver).await,
            }
        });
        Ok(())
    }

    fn send_typing(&mut self) -> Result<(), CommandError> {
        let peer = self.state.chat.peer().ok_or(CommandError::NoConversation)?;
        // Best effort; the manager already logs a failed send.
        let _ = self.connection.send(&typing_frame(peer));
        Ok(())
    }

    fn create_payment(&mut self, recipient: UserId, amount: i64) -> Result<(), CommandError> {
        validate_payment(amount, recipient)?;
        if recipient == self.state.user.id {
            return Err(ApplicationError::InvalidInput("cannot pay yourself".into()).into());
        }
        self.spawn_api(move |api| async move {
            ApiCompletion::PaymentIntent {
                recipient,
                amount,
                result: api.create_payment_intent(amount, recipient).await,
            }
        });
        Ok(())
    }

    fn search_users(&mut self, query: &str) -> Result<(), CommandError> {
        let query = validate_search(query)?.to_string();
        self.spawn_api(move |api| async move {
            let result = api.search_users(&query).await;
            ApiCompletion::Search { query, result }
        });
        Ok(())
    }

    fn refresh_payments(&mut self) {
        self.spawn_api(|api| async move { ApiCompletion::SentPayments(api.sent_payments().await) });
        self.fetch_received(true);
    }

    fn fetch_received(&mut self, requested: bool) {
        self.spawn_api(move |api| async move {
            ApiCompletion::ReceivedPayments {
                result: api.received_payments().await,
                requested,
            }
        });
    }

    fn spawn_api<F, Fut>(&self, call: F)
    where
        F: FnOnce(Arc<dyn ServiceApi>) -> Fut + Send + 'static,
        Fut: Future<Output = ApiCompletion> + Send + 'static,
    {
        let api = self.api.clone();
        let tx = self.api_tx.clone();
        tokio::spawn(async move {
            let completion = call(api).await;
            let _ = tx.send(completion);
        });
    }

    fn handle_api_completion(&mut self, completion: ApiCompletion) {
        match completion {
            ApiCompletion::History { peer, result } => match result {
                Ok(history) => {
                    if self.state.chat.load_history(peer, history) {
                        let messages = self.state.chat.messages().cloned().collect();
                        emit_event(&self.events, ClientEvent::HistoryLoaded { peer, messages });
                    }
                }
                Err(e) => self.report(e),
            },
            ApiCompletion::Sent { key, result } => {
                let canonical = result.as_ref().ok().cloned();
                match self.state.chat.reconcile_sent(key, result) {
                    Ok(()) => {
                        if let Some(message) = canonical {
                            emit_event(&self.events, ClientEvent::MessageConfirmed { key, message });
                        }
                    }
                    Err(e) => {
                        emit_event(
                            &self.events,
                            ClientEvent::MessageFailed {
                                key,
                                error: e.to_string(),
                            },
                        );
                        self.report(e);
                    }
                }
            }
            ApiCompletion::SentPayments(result) => match result {
                Ok(snapshot) => {
                    if self.state.payments.reconcile_sent(snapshot) {
                        self.emit_payments();
                    }
                }
                Err(e) => self.report(e),
            },
            ApiCompletion::ReceivedPayments { result, requested } => match result {
                Ok(snapshot) => {
                    if self.state.payments.reconcile_received(snapshot) {
                        self.emit_payments();
                    }
                }
                Err(e) if requested => self.report(e),
                Err(e) => warn!(error = %e, "Payment poll failed"),
            },
            ApiCompletion::PaymentIntent {
                recipient,
                amount,
                result,
            } => match result {
                Ok(intent) => {
                    info!(recipient = %recipient, amount, "Payment intent created");
                    emit_event(
                        &self.events,
                        ClientEvent::PaymentIntentCreated {
                            recipient,
                            amount,
                            intent,
                        },
                    );
                }
                Err(e) => self.report(e),
            },
            ApiCompletion::Search { query, result } => match result {
                Ok(users) => emit_event(&self.events, ClientEvent::SearchResults { query, users }),
                Err(e) => self.report(e),
            },
        }
    }

    fn report(&self, error: ApplicationError) {
        warn!(error = %error, "Request failed");
        emit_event(&self.events, ClientEvent::error(error));
    }

    fn emit_payments(&self) {
        emit_event(
            &self.events,
            ClientEvent::PaymentsChanged {
                sent: self.state.payments.sent().to_vec(),
                received: self.state.payments.received().to_vec(),
            },
        );
    }
}

async fn next_poll(poll: &mut Option<Interval>) {
    match poll {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn reconnect_due(at: Option<Instant>) {
    match at {
        Some(at) => time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

fn end_reason_text(reason: &EndReason) -> String {
    match reason {
        EndReason::LocalHangup => "hung up".into(),
        EndReason::Declined => "declined".into(),
        EndReason::RemoteEnded => "ended by peer".into(),
        EndReason::TransportLost => "connection lost".into(),
        EndReason::Failed(e) => e.to_string(),
    }
}
