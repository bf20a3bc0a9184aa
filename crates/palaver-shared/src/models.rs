//! Domain models shared by the store, the router and the REST surface.
//!
//! Every struct serializes in camelCase, which is the shape clients see on
//! both the socket and the HTTP API.

use std::collections::BTreeSet;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

use crate::rooms::room_for;
use crate::types::{MessageId, RequestId, UserId};

// ---------------------------------------------------------------------------
// User
// ---------------------------------------------------------------------------

/// A registered user together with their social graph edges.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: UserId,
    pub username: String,
    /// Avatar URL, empty when unset.
    pub avatar: String,
    pub status: String,
    /// Persisted mirror of live presence.
    pub online: bool,
    pub friends: BTreeSet<UserId>,
    pub blocked_users: BTreeSet<UserId>,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn is_friend(&self, other: &UserId) -> bool {
        self.friends.contains(other)
    }

    pub fn has_blocked(&self, other: &UserId) -> bool {
        self.blocked_users.contains(other)
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    Image,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::Image => "image",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "text" => Some(MessageKind::Text),
            "image" => Some(MessageKind::Image),
            _ => None,
        }
    }
}

/// One reactor's emoji on a message. A reactor holds at most one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Reaction {
    pub user_id: UserId,
    pub emoji: String,
}

/// A direct message between two users.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub text: Option<String>,
    pub image: Option<String>,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub timestamp: DateTime<Utc>,
    pub seen: bool,
    pub is_edited: bool,
    /// In insertion order; a replaced emoji keeps its position.
    pub reactions: Vec<Reaction>,
}

impl Message {
    /// Fresh unseen message. Kind is `image` whenever an image is attached.
    /// The timestamp is kept at microsecond precision, which is what the
    /// store persists.
    pub fn new(
        sender_id: UserId,
        receiver_id: UserId,
        text: Option<String>,
        image: Option<String>,
    ) -> Self {
        let kind = if image.is_some() {
            MessageKind::Image
        } else {
            MessageKind::Text
        };
        Self {
            id: MessageId::new(),
            sender_id,
            receiver_id,
            text,
            image,
            kind,
            timestamp: Utc::now().trunc_subsecs(6),
            seen: false,
            is_edited: false,
            reactions: Vec::new(),
        }
    }

    pub fn involves(&self, user: &UserId) -> bool {
        self.sender_id == *user || self.receiver_id == *user
    }

    /// Pairing channel this message belongs to.
    pub fn room(&self) -> String {
        room_for(&self.sender_id, &self.receiver_id)
    }
}

/// What a reaction request did to a reactor's slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReactionOutcome {
    Added,
    Replaced,
    Removed,
}

impl ReactionOutcome {
    /// Same emoji toggles off, a different one replaces, none yet appends.
    pub fn decide(existing: Option<&str>, requested: &str) -> Self {
        match existing {
            None => ReactionOutcome::Added,
            Some(current) if current == requested => ReactionOutcome::Removed,
            Some(_) => ReactionOutcome::Replaced,
        }
    }
}

// ---------------------------------------------------------------------------
// Friend requests
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Pending,
    Accepted,
    Declined,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Accepted => "accepted",
            RequestStatus::Declined => "declined",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(RequestStatus::Pending),
            "accepted" => Some(RequestStatus::Accepted),
            "declined" => Some(RequestStatus::Declined),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FriendRequest {
    pub id: RequestId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub status: RequestStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FriendRequest {
    /// The participant that is not `me`.
    pub fn counterpart(&self, me: &UserId) -> UserId {
        if self.sender_id == *me {
            self.receiver_id
        } else {
            self.sender_id
        }
    }
}

// ---------------------------------------------------------------------------
// Directory
// ---------------------------------------------------------------------------

/// Relationship of a directory entry to the viewer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FriendshipStatus {
    Me,
    None,
    Sent,
    Received,
    Accepted,
}

/// A user as seen by a particular viewer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryEntry {
    pub id: UserId,
    pub username: String,
    pub avatar: String,
    pub status: String,
    /// Masked to false when a block exists in either direction.
    pub online: bool,
    pub is_me: bool,
    pub is_blocked_by_me: bool,
    pub has_blocked_me: bool,
    pub unread_count: u32,
    pub friendship_status: FriendshipStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<RequestId>,
}
