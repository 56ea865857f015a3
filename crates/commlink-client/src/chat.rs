//! The active conversation.
//!
//! Holds the ordered message view for one peer at a time. Outgoing messages
//! are echoed locally under a client key before the server has answered;
//! the server's canonical copy replaces the echo in place once the send
//! completes.

use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

use commlink_shared::error::ApplicationError;
use commlink_shared::types::{Message, UserId};

#[derive(Debug, Clone, PartialEq)]
pub struct ChatEntry {
    pub message: Message,
    /// Client key of an unconfirmed local echo.
    pub pending: Option<Uuid>,
}

/// What happened to an inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Appended,
    /// Already in the view (same server id).
    Duplicate,
    /// Belongs to another conversation; carries the counterpart.
    OtherConversation(UserId),
}

/// An optimistic send waiting for the collaborator to answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingSend {
    pub key: Uuid,
    pub content: String,
    pub receiver: UserId,
}

pub struct ChatSession {
    local: UserId,
    peer: Option<UserId>,
    entries: Vec<ChatEntry>,
    peer_typing_at: Option<DateTime<Utc>>,
}

impl ChatSession {
    pub fn new(local: UserId) -> Self {
        Self {
            local,
            peer: None,
            entries: Vec::new(),
            peer_typing_at: None,
        }
    }

    pub fn peer(&self) -> Option<UserId> {
        self.peer
    }

    pub fn entries(&self) -> &[ChatEntry] {
        &self.entries
    }

    pub fn messages(&self) -> impl Iterator<Item = &Message> {
        self.entries.iter().map(|e| &e.message)
    }

    /// Last typing indicator from the active peer.
    pub fn peer_typing_at(&self) -> Option<DateTime<Utc>> {
        self.peer_typing_at
    }

    /// Switch to `peer`, clearing the current view. History is loaded
    /// separately.
    pub fn open(&mut self, peer: UserId) {
        debug!(peer = %peer, "Opening conversation");
        self.peer = Some(peer);
        self.entries.clear();
        self.peer_typing_at = None;
    }

    /// Replace the view with the fetched history for `peer`.
    ///
    /// Returns `false` if the user has switched to another conversation
    /// while the fetch was in flight.
    pub fn load_history(&mut self, peer: UserId, history: Vec<Message>) -> bool {
        if self.peer != Some(peer) {
            debug!(peer = %peer, "Discarding history for inactive conversation");
            return false;
        }
        self.entries = history
            .into_iter()
            .map(|message| ChatEntry {
                message,
                pending: None,
            })
            .collect();
        true
    }

    pub fn on_delivered(&mut self, message: Message) -> Delivery {
        let Some(peer) = self.peer.filter(|p| message.is_between(self.local, *p)) else {
            return Delivery::OtherConversation(message.counterpart(self.local));
        };
        if self.contains_server_id(message.id) {
            debug!(peer = %peer, id = ?message.id, "Duplicate message ignored");
            return Delivery::Duplicate;
        }
        self.entries.push(ChatEntry {
            message,
            pending: None,
        });
        Delivery::Appended
    }

    /// Echo `content` into the active conversation and hand back the send
    /// to perform. Blank content is rejected with no echo.
    pub fn send_local(
        &mut self,
        content: &str,
        receiver: UserId,
        now: DateTime<Utc>,
    ) -> Option<PendingSend> {
        let content = content.trim();
        if content.is_empty() {
            return None;
        }

        let key = Uuid::new_v4();
        if self.peer == Some(receiver) {
            self.entries.push(ChatEntry {
                message: Message {
                    id: None,
                    content: content.to_string(),
                    sender_id: self.local,
                    receiver_id: receiver,
                    timestamp: now,
                    sender_username: None,
                },
                pending: Some(key),
            });
        }

        Some(PendingSend {
            key,
            content: content.to_string(),
            receiver,
        })
    }

    /// Settle the echo created under `key`.
    ///
    /// On success the canonical copy takes the echo's slot (or is appended
    /// if the echo is gone and the copy belongs here). On failure the echo is
    /// removed and the error handed back for the user.
    pub fn reconcile_sent(
        &mut self,
        key: Uuid,
        outcome: Result<Message, ApplicationError>,
    ) -> Result<(), ApplicationError> {
        let slot = self.entries.iter().position(|e| e.pending == Some(key));

        match outcome {
            Ok(canonical) => {
                if self.contains_server_id(canonical.id) {
                    // The push copy arrived first.
                    if let Some(i) = slot {
                        self.entries.remove(i);
                    }
                    return Ok(());
                }
                match slot {
                    Some(i) => {
                        self.entries[i] = ChatEntry {
                            message: canonical,
                            pending: None,
                        };
                    }
                    None => {
                        if self
                            .peer
                            .is_some_and(|p| canonical.is_between(self.local, p))
                        {
                            self.entries.push(ChatEntry {
                                message: canonical,
                                pending: None,
                            });
                        }
                    }
                }
                Ok(())
            }
            Err(e) => {
                if let Some(i) = slot {
                    self.entries.remove(i);
                }
                Err(e)
            }
        }
    }

    /// Record a typing indicator. Only the active peer's counts.
    pub fn on_typing(&mut self, from: UserId, at: DateTime<Utc>) -> bool {
        if self.peer == Some(from) {
            self.peer_typing_at = Some(at);
            true
        } else {
            false
        }
    }

    fn contains_server_id(&self, id: Option<i64>) -> bool {
        id.is_some_and(|id| self.entries.iter().any(|e| e.message.id == Some(id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ME: UserId = UserId(1);
    const BOB: UserId = UserId(2);
    const CAROL: UserId = UserId(3);

    fn msg(id: i64, from: UserId, to: UserId, content: &str) -> Message {
        Message {
            id: Some(id),
            content: content.into(),
            sender_id: from,
            receiver_id: to,
            timestamp: Utc::now(),
            sender_username: None,
        }
    }

    fn contents(chat: &ChatSession) -> Vec<&str> {
        chat.messages().map(|m| m.content.as_str()).collect()
    }

    #[test]
    fn test_history_replaces_view() {
        let mut chat = ChatSession::new(ME);
        chat.open(BOB);
        chat.on_delivered(msg(9, BOB, ME, "stale"));

        assert!(chat.load_history(BOB, vec![msg(1, ME, BOB, "hi"), msg(2, BOB, ME, "yo")]));
        assert_eq!(contents(&chat), vec!["hi", "yo"]);

        // switched away before the fetch landed
        chat.open(CAROL);
        assert!(!chat.load_history(BOB, vec![msg(3, BOB, ME, "late")]));
        assert!(chat.entries().is_empty());
    }

    #[test]
    fn test_delivery_filtering_and_dedupe() {
        let mut chat = ChatSession::new(ME);
        assert_eq!(
            chat.on_delivered(msg(1, BOB, ME, "hello")),
            Delivery::OtherConversation(BOB)
        );

        chat.open(BOB);
        assert_eq!(chat.on_delivered(msg(1, BOB, ME, "hello")), Delivery::Appended);
        assert_eq!(chat.on_delivered(msg(1, BOB, ME, "hello")), Delivery::Duplicate);
        assert_eq!(
            chat.on_delivered(msg(2, CAROL, ME, "psst")),
            Delivery::OtherConversation(CAROL)
        );
        assert_eq!(contents(&chat), vec!["hello"]);
    }

    #[test]
    fn test_blank_send_is_rejected() {
        let mut chat = ChatSession::new(ME);
        chat.open(BOB);
        assert!(chat.send_local("   \n", BOB, Utc::now()).is_none());
        assert!(chat.entries().is_empty());
    }

    #[test]
    fn test_echo_replaced_by_canonical_copy() {
        let mut chat = ChatSession::new(ME);
        chat.open(BOB);
        chat.on_delivered(msg(1, BOB, ME, "first"));

        let pending = chat.send_local("  reply ", BOB, Utc::now()).unwrap();
        assert_eq!(pending.content, "reply");
        assert_eq!(chat.entries()[1].pending, Some(pending.key));
        assert_eq!(chat.entries()[1].message.id, None);

        chat.on_delivered(msg(2, BOB, ME, "second"));
        chat.reconcile_sent(pending.key, Ok(msg(7, ME, BOB, "reply")))
            .unwrap();

        assert_eq!(contents(&chat), vec!["first", "reply", "second"]);
        assert_eq!(chat.entries()[1].message.id, Some(7));
        assert_eq!(chat.entries()[1].pending, None);
    }

    #[test]
    fn test_failed_send_removes_echo() {
        let mut chat = ChatSession::new(ME);
        chat.open(BOB);
        let pending = chat.send_local("lost", BOB, Utc::now()).unwrap();

        let err = ApplicationError::Status {
            status: 404,
            detail: "Recipient not found".into(),
        };
        assert_eq!(chat.reconcile_sent(pending.key, Err(err.clone())), Err(err));
        assert!(chat.entries().is_empty());
    }

    #[test]
    fn test_push_copy_before_response_is_not_doubled() {
        let mut chat = ChatSession::new(ME);
        chat.open(BOB);
        let pending = chat.send_local("echo", BOB, Utc::now()).unwrap();

        chat.on_delivered(msg(5, ME, BOB, "echo"));
        chat.reconcile_sent(pending.key, Ok(msg(5, ME, BOB, "echo")))
            .unwrap();

        assert_eq!(contents(&chat), vec!["echo"]);
        assert_eq!(chat.entries()[0].pending, None);
    }

    #[test]
    fn test_typing_only_for_active_peer() {
        let mut chat = ChatSession::new(ME);
        let now = Utc::now();
        assert!(!chat.on_typing(BOB, now));

        chat.open(BOB);
        assert!(!chat.on_typing(CAROL, now));
        assert!(chat.on_typing(BOB, now));
        assert_eq!(chat.peer_typing_at(), Some(now));

        chat.open(CAROL);
        assert_eq!(chat.peer_typing_at(), None);
    }
}
