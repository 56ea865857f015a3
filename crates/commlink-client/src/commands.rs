//! Local user actions accepted by the session loop.

use thiserror::Error;

use commlink_media::CallError;
use commlink_shared::error::ApplicationError;
use commlink_shared::protocol::OutboundFrame;
use commlink_shared::types::UserId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Switch the chat view to `peer` and load its history.
    OpenConversation(UserId),
    /// Send to the active conversation.
    SendMessage(String),
    /// Tell the active peer we are typing.
    Typing,
    StartCall(UserId),
    AcceptCall,
    DeclineCall,
    HangUp,
    ToggleMute,
    ToggleVideo,
    CreatePayment { recipient: UserId, amount: i64 },
    SearchUsers(String),
    RefreshPayments,
    /// Tear down the session. No reconnect follows.
    Logout,
}

/// Why a command was refused.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CommandError {
    #[error("No conversation open")]
    NoConversation,

    #[error("Call: {0}")]
    Call(#[from] CallError),

    #[error("{0}")]
    Application(#[from] ApplicationError),

    #[error("Usage: {0}")]
    Usage(&'static str),
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Self::OpenConversation(_) => "open_conversation",
            Self::SendMessage(_) => "send_message",
            Self::Typing => "typing",
            Self::StartCall(_) => "start_call",
            Self::AcceptCall => "accept_call",
            Self::DeclineCall => "decline_call",
            Self::HangUp => "hang_up",
            Self::ToggleMute => "toggle_mute",
            Self::ToggleVideo => "toggle_video",
            Self::CreatePayment { .. } => "create_payment",
            Self::SearchUsers(_) => "search_users",
            Self::RefreshPayments => "refresh_payments",
            Self::Logout => "logout",
        }
    }

    /// Parse one line of terminal input.
    ///
    /// Lines starting with `/` are commands; anything else is a message for
    /// the active conversation. Blank lines yield `None`.
    pub fn parse(line: &str) -> Result<Option<Self>, CommandError> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }
        let Some(rest) = line.strip_prefix('/') else {
            return Ok(Some(Self::SendMessage(line.to_string())));
        };

        let mut parts = rest.split_whitespace();
        let verb = parts.next().unwrap_or_default();
        let cmd = match verb {
            "chat" => Self::OpenConversation(user_arg(parts.next(), "/chat <user-id>")?),
            "call" => Self::StartCall(user_arg(parts.next(), "/call <user-id>")?),
            "accept" => Self::AcceptCall,
            "decline" => Self::DeclineCall,
            "hangup" => Self::HangUp,
            "mute" => Self::ToggleMute,
            "video" => Self::ToggleVideo,
            "pay" => {
                const USAGE: &str = "/pay <user-id> <amount-in-cents>";
                let recipient = user_arg(parts.next(), USAGE)?;
                let amount = parts
                    .next()
                    .and_then(|a| a.parse::<i64>().ok())
                    .ok_or(CommandError::Usage(USAGE))?;
                Self::CreatePayment { recipient, amount }
            }
            "search" => {
                let query = rest
                    .trim_start()
                    .strip_prefix("search")
                    .unwrap_or_default()
                    .trim();
                if query.is_empty() {
                    return Err(CommandError::Usage("/search <query>"));
                }
                Self::SearchUsers(query.to_string())
            }
            "payments" => Self::RefreshPayments,
            "typing" => Self::Typing,
            "quit" | "logout" => Self::Logout,
            _ => return Err(CommandError::Usage("unknown command")),
        };
        Ok(Some(cmd))
    }
}

fn user_arg(arg: Option<&str>, usage: &'static str) -> Result<UserId, CommandError> {
    arg.and_then(|a| a.parse::<UserId>().ok())
        .ok_or(CommandError::Usage(usage))
}

/// Frame for the typing indicator towards `peer`.
pub fn typing_frame(peer: UserId) -> OutboundFrame {
    OutboundFrame::Typing { recipient_id: peer }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_text_is_a_message() {
        assert_eq!(
            Command::parse("  hello there "),
            Ok(Some(Command::SendMessage("hello there".into())))
        );
        assert_eq!(Command::parse("   "), Ok(None));
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!(
            Command::parse("/chat 2"),
            Ok(Some(Command::OpenConversation(UserId(2))))
        );
        assert_eq!(Command::parse("/call 7"), Ok(Some(Command::StartCall(UserId(7)))));
        assert_eq!(Command::parse("/hangup"), Ok(Some(Command::HangUp)));
        assert_eq!(
            Command::parse("/pay 3 2500"),
            Ok(Some(Command::CreatePayment {
                recipient: UserId(3),
                amount: 2500
            }))
        );
        assert_eq!(
            Command::parse("/search  ali ce"),
            Ok(Some(Command::SearchUsers("ali ce".into())))
        );
        assert_eq!(Command::parse("/quit"), Ok(Some(Command::Logout)));
    }

    #[test]
    fn test_parse_rejects_bad_arguments() {
        assert!(matches!(Command::parse("/call bob"), Err(CommandError::Usage(_))));
        assert!(matches!(Command::parse("/pay 3"), Err(CommandError::Usage(_))));
        assert!(matches!(Command::parse("/search"), Err(CommandError::Usage(_))));
        assert!(matches!(Command::parse("/dance"), Err(CommandError::Usage(_))));
    }

    #[test]
    fn test_typing_frame_shape() {
        let json = typing_frame(UserId(4)).to_json().unwrap();
        assert_eq!(json, r#"{"type":"typing","recipient_id":4}"#);
    }
}
