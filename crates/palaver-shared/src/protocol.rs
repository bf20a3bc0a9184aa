//! Real-time wire protocol.
//!
//! Every frame is a JSON text message of the form
//! `{"event": "<name>", "data": <payload>}`. Inbound frames decode into
//! [`ClientEvent`] with loosely typed fields, then go through
//! `Command::try_from`, which is the only place ids and payloads are
//! validated.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ChatError;
use crate::models::Message;
use crate::types::{MessageId, UserId};
use crate::validation::{validate_emoji, validate_text, MessageContent};

/// Frames sent by clients.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ClientEvent {
    /// Only valid as the first frame of an unauthenticated socket.
    Authenticate { token: String },

    #[serde(rename_all = "camelCase")]
    JoinChat { other_user_id: String },

    #[serde(rename_all = "camelCase")]
    Typing { other_user_id: String },

    #[serde(rename_all = "camelCase")]
    StopTyping { other_user_id: String },

    #[serde(rename_all = "camelCase")]
    SendMessage {
        to: String,
        #[serde(default)]
        text: Option<String>,
        #[serde(default)]
        image: Option<String>,
        #[serde(default)]
        temp_id: Option<Value>,
    },

    #[serde(rename_all = "camelCase")]
    EditMessage { message_id: String, new_text: String },

    #[serde(rename_all = "camelCase")]
    UnsendMessage { message_id: String },

    #[serde(rename_all = "camelCase")]
    ReactToMessage { message_id: String, emoji: String },

    #[serde(rename_all = "camelCase")]
    MarkSeen { other_user_id: String },
}

impl ClientEvent {
    pub fn parse(frame: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(frame)
    }
}

/// A validated inbound event, ready for dispatch.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Authenticate { token: String },
    JoinChat { other: UserId },
    Typing { other: UserId },
    StopTyping { other: UserId },
    SendMessage {
        to: UserId,
        content: MessageContent,
        /// Opaque client correlation value, echoed back verbatim.
        temp_id: Value,
    },
    EditMessage { message_id: MessageId, new_text: String },
    UnsendMessage { message_id: MessageId },
    React { message_id: MessageId, emoji: String },
    MarkSeen { other: UserId },
}

impl Command {
    /// Event name, for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Authenticate { .. } => "authenticate",
            Command::JoinChat { .. } => "joinChat",
            Command::Typing { .. } => "typing",
            Command::StopTyping { .. } => "stopTyping",
            Command::SendMessage { .. } => "sendMessage",
            Command::EditMessage { .. } => "editMessage",
            Command::UnsendMessage { .. } => "unsendMessage",
            Command::React { .. } => "reactToMessage",
            Command::MarkSeen { .. } => "markSeen",
        }
    }
}

fn user_ref(raw: &str, field: &'static str) -> Result<UserId, ChatError> {
    UserId::parse(raw).map_err(|_| ChatError::InvalidReference(field))
}

fn message_ref(raw: &str) -> Result<MessageId, ChatError> {
    MessageId::parse(raw).map_err(|_| ChatError::InvalidReference("messageId"))
}

impl TryFrom<ClientEvent> for Command {
    type Error = ChatError;

    fn try_from(event: ClientEvent) -> Result<Self, Self::Error> {
        let command = match event {
            ClientEvent::Authenticate { token } => Command::Authenticate { token },
            ClientEvent::JoinChat { other_user_id } => Command::JoinChat {
                other: user_ref(&other_user_id, "otherUserId")?,
            },
            ClientEvent::Typing { other_user_id } => Command::Typing {
                other: user_ref(&other_user_id, "otherUserId")?,
            },
            ClientEvent::StopTyping { other_user_id } => Command::StopTyping {
                other: user_ref(&other_user_id, "otherUserId")?,
            },
            ClientEvent::SendMessage {
                to,
                text,
                image,
                temp_id,
            } => {
                let to = user_ref(&to, "to")?;
                let content = MessageContent::new(text.as_deref(), image.as_deref())?;
                Command::SendMessage {
                    to,
                    content,
                    temp_id: temp_id.unwrap_or(Value::Null),
                }
            }
            ClientEvent::EditMessage {
                message_id,
                new_text,
            } => Command::EditMessage {
                message_id: message_ref(&message_id)?,
                new_text: validate_text(&new_text)?,
            },
            ClientEvent::UnsendMessage { message_id } => Command::UnsendMessage {
                message_id: message_ref(&message_id)?,
            },
            ClientEvent::ReactToMessage { message_id, emoji } => Command::React {
                message_id: message_ref(&message_id)?,
                emoji: validate_emoji(&emoji)?,
            },
            ClientEvent::MarkSeen { other_user_id } => Command::MarkSeen {
                other: user_ref(&other_user_id, "otherUserId")?,
            },
        };
        Ok(command)
    }
}

/// Frames sent by the server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ServerEvent {
    OnlineUsers(Vec<UserId>),

    JoinedChat { room: String },

    Typing { from: UserId },

    StopTyping { from: UserId },

    #[serde(rename_all = "camelCase")]
    Message {
        message: Message,
        #[serde(default)]
        temp_id: Value,
    },

    #[serde(rename_all = "camelCase")]
    MessageNotification {
        message: Message,
        #[serde(default)]
        temp_id: Value,
    },

    MessageUpdate { message: Message },

    #[serde(rename_all = "camelCase")]
    MessageDelete { message_id: MessageId },

    #[serde(rename_all = "camelCase")]
    SeenUpdate { by: UserId, other_user_id: UserId },

    ErrorMessage { message: String },

    FriendRequest { from: UserId },

    FriendAccept { from: UserId },

    FriendCancel { from: UserId },

    FriendDecline { from: UserId },

    ChatCleared { from: UserId },
}

impl ServerEvent {
    pub fn error(message: impl Into<String>) -> Self {
        ServerEvent::ErrorMessage {
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::OnlineUsers(_) => "onlineUsers",
            ServerEvent::JoinedChat { .. } => "joinedChat",
            ServerEvent::Typing { .. } => "typing",
            ServerEvent::StopTyping { .. } => "stopTyping",
            ServerEvent::Message { .. } => "message",
            ServerEvent::MessageNotification { .. } => "messageNotification",
            ServerEvent::MessageUpdate { .. } => "messageUpdate",
            ServerEvent::MessageDelete { .. } => "messageDelete",
            ServerEvent::SeenUpdate { .. } => "seenUpdate",
            ServerEvent::ErrorMessage { .. } => "errorMessage",
            ServerEvent::FriendRequest { .. } => "friendRequest",
            ServerEvent::FriendAccept { .. } => "friendAccept",
            ServerEvent::FriendCancel { .. } => "friendCancel",
            ServerEvent::FriendDecline { .. } => "friendDecline",
            ServerEvent::ChatCleared { .. } => "chatCleared",
        }
    }
}

/// Social-graph notifications pushed to a user's personal channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocialNotice {
    FriendRequest,
    FriendAccept,
    FriendCancel,
    FriendDecline,
    ChatCleared,
}

impl SocialNotice {
    pub fn into_event(self, from: UserId) -> ServerEvent {
        match self {
            SocialNotice::FriendRequest => ServerEvent::FriendRequest { from },
            SocialNotice::FriendAccept => ServerEvent::FriendAccept { from },
            SocialNotice::FriendCancel => ServerEvent::FriendCancel { from },
            SocialNotice::FriendDecline => ServerEvent::FriendDecline { from },
            SocialNotice::ChatCleared => ServerEvent::ChatCleared { from },
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_parse_send_message() {
        let to = UserId::new();
        let frame = json!({
            "event": "sendMessage",
            "data": { "to": to.to_string(), "text": "  hi ", "tempId": "tmp-1" }
        })
        .to_string();

        let cmd = Command::try_from(ClientEvent::parse(&frame).unwrap()).unwrap();
        match cmd {
            Command::SendMessage {
                to: parsed,
                content,
                temp_id,
            } => {
                assert_eq!(parsed, to);
                assert_eq!(content.into_parts().0.as_deref(), Some("hi"));
                assert_eq!(temp_id, json!("tmp-1"));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_missing_temp_id_becomes_null() {
        let frame = json!({
            "event": "sendMessage",
            "data": { "to": UserId::new().to_string(), "text": "x" }
        })
        .to_string();
        let cmd = Command::try_from(ClientEvent::parse(&frame).unwrap()).unwrap();
        assert!(matches!(cmd, Command::SendMessage { temp_id: Value::Null, .. }));
    }

    #[test]
    fn test_invalid_ids_are_invalid_references() {
        let frame = json!({ "event": "joinChat", "data": { "otherUserId": "nope" } }).to_string();
        let err = Command::try_from(ClientEvent::parse(&frame).unwrap()).unwrap_err();
        assert_eq!(err, ChatError::InvalidReference("otherUserId"));
        assert!(err.client_message().is_none());
    }

    #[test]
    fn test_empty_message_is_validation_failure() {
        let frame = json!({
            "event": "sendMessage",
            "data": { "to": UserId::new().to_string(), "text": "   " }
        })
        .to_string();
        let err = Command::try_from(ClientEvent::parse(&frame).unwrap()).unwrap_err();
        assert!(matches!(err, ChatError::Validation(_)));
    }

    #[test]
    fn test_unknown_event_fails_to_parse() {
        assert!(ClientEvent::parse(r#"{"event":"selfDestruct","data":{}}"#).is_err());
        assert!(ClientEvent::parse("not json").is_err());
    }

    #[test]
    fn test_server_event_shapes() {
        let from = UserId::new();
        let json = serde_json::to_value(SocialNotice::ChatCleared.into_event(from)).unwrap();
        assert_eq!(json, json!({ "event": "chatCleared", "data": { "from": from.to_string() } }));

        let users = vec![from];
        let json = serde_json::to_value(ServerEvent::OnlineUsers(users)).unwrap();
        assert_eq!(json, json!({ "event": "onlineUsers", "data": [from.to_string()] }));

        let other = UserId::new();
        let json = serde_json::to_value(ServerEvent::SeenUpdate {
            by: from,
            other_user_id: other,
        })
        .unwrap();
        assert_eq!(json["data"]["otherUserId"], other.to_string());
    }

    #[test]
    fn test_message_event_keeps_null_temp_id() {
        let msg = Message::new(UserId::new(), UserId::new(), Some("x".into()), None);
        let json = serde_json::to_value(ServerEvent::Message {
            message: msg,
            temp_id: Value::Null,
        })
        .unwrap();
        assert_eq!(json["event"], "message");
        assert!(json["data"].as_object().unwrap().contains_key("tempId"));
        assert!(json["data"]["tempId"].is_null());
    }
}
