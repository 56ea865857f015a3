//! Session state owned by the session loop.
//!
//! One [`SessionState`] exists per authenticated session. Only the loop
//! task touches it, so nothing here is behind a lock.

use commlink_media::CallMachine;
use commlink_shared::types::{ConnectionMode, Credential, UserProfile};

use crate::chat::ChatSession;
use crate::config::ClientConfig;
use crate::payments::PaymentTracker;

pub struct SessionState {
    /// The authenticated user.
    pub user: UserProfile,

    /// Bearer credential used for the persistent connection and the API.
    pub credential: Credential,

    /// Current state of the persistent connection as shown to the user.
    pub connection_mode: ConnectionMode,

    /// Active conversation and its message view.
    pub chat: ChatSession,

    /// Sent/received payment ledgers.
    pub payments: PaymentTracker,

    /// The single call session. Idle when no call is in progress.
    pub call: CallMachine,
}

impl SessionState {
    pub fn new(user: UserProfile, credential: Credential, config: &ClientConfig) -> Self {
        let local = user.id;
        Self {
            user,
            credential,
            connection_mode: ConnectionMode::Disconnected,
            chat: ChatSession::new(local),
            payments: PaymentTracker::new(local),
            call: CallMachine::new(local, config.call_setup_timeout),
        }
    }
}
