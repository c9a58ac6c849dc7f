/// Shared types for the chat layer
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::cmp::Ordering;

/// Public profile summary of a chat participant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSummary {
    #[serde(alias = "_id")]
    pub id: String,
    #[serde(alias = "username")]
    pub display_name: String,
    #[serde(default, alias = "profilePicture")]
    pub avatar: Option<String>,
}

/// A 1:1 channel between the local user and one peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    #[serde(alias = "_id")]
    pub id: String,
    #[serde(alias = "otherUser")]
    pub peer: UserSummary,
    #[serde(default)]
    pub unread_count: u32,
}

/// Delivery state of a message.
///
/// Ordered along the happy path; `Failed` sits outside the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Sending,
    Sent,
    Delivered,
    Read,
    Failed,
}

impl MessageStatus {
    fn rank(self) -> Option<u8> {
        match self {
            MessageStatus::Sending => Some(0),
            MessageStatus::Sent => Some(1),
            MessageStatus::Delivered => Some(2),
            MessageStatus::Read => Some(3),
            MessageStatus::Failed => None,
        }
    }

    /// Whether moving from `self` to `next` is allowed.
    ///
    /// Happy-path statuses only move forward. `Failed` can be entered from
    /// `Sending` and left only by a resend (back to `Sending`) or a late
    /// server confirmation.
    pub fn can_advance_to(self, next: MessageStatus) -> bool {
        match (self.rank(), next.rank()) {
            (Some(current), Some(target)) => target > current,
            (Some(0), None) => true,
            (Some(_), None) => false,
            (None, Some(_)) => true,
            (None, None) => false,
        }
    }
}

fn default_status() -> MessageStatus {
    MessageStatus::Delivered
}

/// History responses may embed the sender's profile instead of its id
fn sender_ref<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum SenderRef {
        Id(String),
        Profile {
            #[serde(alias = "_id")]
            id: String,
        },
    }

    Ok(match SenderRef::deserialize(deserializer)? {
        SenderRef::Id(id) => id,
        SenderRef::Profile { id } => id,
    })
}

/// A single chat message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(alias = "_id")]
    pub id: String,
    #[serde(alias = "chatId")]
    pub conversation_id: String,
    #[serde(alias = "sender", deserialize_with = "sender_ref")]
    pub sender_id: String,
    #[serde(alias = "content")]
    pub body: String,
    pub created_at: DateTime<Utc>,
    #[serde(default = "default_status")]
    pub status: MessageStatus,
}

impl Message {
    /// Display order: newest first, ties broken by id (descending)
    pub fn display_cmp(&self, other: &Message) -> Ordering {
        other
            .created_at
            .cmp(&self.created_at)
            .then_with(|| other.id.cmp(&self.id))
    }

    pub fn is_from(&self, user_id: &str) -> bool {
        self.sender_id == user_id
    }
}

/// One batch of historical messages
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedPage {
    pub page: u32,
    pub messages: Vec<Message>,
    pub has_more: bool,
}

/// Peer presence as reported by the real-time server
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Presence {
    pub online: bool,
    pub last_seen: Option<DateTime<Utc>>,
}
