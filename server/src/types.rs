//! Shared event types for the UniLink hub.
//!
//! Every event delivered to a client is a JSON envelope of the form
//! `{"type": <kind>, "payload": {...}}`. The kind selects how the hub
//! resolves the audience; the payload shape is fixed per kind.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Timestamps as the platform backend writes them: `2025-03-01 09:30:00`,
/// UTC, no offset. RFC 3339 is accepted on input as well.
pub mod timestamp {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{de, Deserialize, Deserializer, Serializer};

    /// `strftime` layout of wire timestamps.
    pub const FORMAT: &str = "%Y-%m-%d %H:%M:%S";

    pub fn serialize<S>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(&value.format(FORMAT))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).ok_or_else(|| de::Error::custom(format!("invalid timestamp '{raw}'")))
    }

    /// Parses either the backend layout or RFC 3339.
    pub fn parse(raw: &str) -> Option<DateTime<Utc>> {
        NaiveDateTime::parse_from_str(raw, FORMAT)
            .map(|naive| naive.and_utc())
            .or_else(|_| DateTime::parse_from_rfc3339(raw).map(|dt| dt.with_timezone(&Utc)))
            .ok()
    }
}

/// Identifier of a platform user.
pub type UserId = u64;

/// Identifier of a college.
pub type CollegeId = u64;

/// Identifier of a study group.
pub type GroupId = u64;

/// Author of a chat message as shown to recipients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageSender {
    pub id: UserId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_picture: Option<String>,
}

/// A chat message posted to a direct or group conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: u64,
    pub content: String,

    /// Content type of the message body (`text`, `image`, ...).
    #[serde(rename = "type", default = "default_message_type")]
    pub message_type: String,

    /// `dm` or `group`, as sent by the backend. Routing only looks at
    /// `conversation_id`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_type: Option<String>,

    /// Wire-level conversation identifier, `dm_<a>_<b>` or `group_<id>`.
    pub conversation_id: String,

    pub sender: MessageSender,

    #[serde(default)]
    pub is_read: bool,

    #[serde(with = "timestamp")]
    pub created_at: DateTime<Utc>,
}

fn default_message_type() -> String {
    "text".to_string()
}

/// A college announcement, optionally narrowed to a department and semester.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Announcement {
    pub id: u64,
    pub college_id: CollegeId,
    pub title: String,
    pub content: String,
    pub priority: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub department: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub semester: Option<u32>,
    pub author_name: String,
    #[serde(with = "timestamp")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "timestamp")]
    pub updated_at: DateTime<Utc>,
}

/// Public profile fields attached to friend lifecycle events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FriendProfile {
    pub id: UserId,
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub student_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_picture: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub department: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub semester: Option<u32>,
}

/// A friend request was sent from `user_id` to `friend_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FriendRequest {
    pub id: u64,
    pub user_id: UserId,
    pub friend_id: UserId,
    pub sender: FriendProfile,
    #[serde(with = "timestamp")]
    pub created_at: DateTime<Utc>,
}

/// Outcome of a friend request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FriendRequestStatus {
    Accepted,
    Rejected,
}

/// The recipient of a friend request answered it. `user_id` is the original
/// requester and the one who is notified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FriendRequestUpdate {
    pub id: u64,
    pub user_id: UserId,
    pub friend_id: UserId,
    pub status: FriendRequestStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accepter: Option<FriendProfile>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejecter_id: Option<UserId>,
    #[serde(with = "timestamp")]
    pub updated_at: DateTime<Utc>,
}

/// `removed_by_id` ended the friendship with `removed_user`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FriendRemoved {
    pub id: u64,
    pub removed_by_id: UserId,
    pub removed_user: UserId,
    pub remover_name: String,
    #[serde(with = "timestamp")]
    pub updated_at: DateTime<Utc>,
}

/// An event published into the hub.
///
/// Serialized as an adjacently tagged envelope so the wire format matches
/// what browser clients already consume:
///
/// ```
/// use unilink_hub::types::{Event, FriendRemoved};
/// use chrono::Utc;
///
/// let event = Event::FriendRemoved(FriendRemoved {
///     id: 9,
///     removed_by_id: 1,
///     removed_user: 2,
///     remover_name: "Asha".to_string(),
///     updated_at: Utc::now(),
/// });
///
/// let json = serde_json::to_value(&event).unwrap();
/// assert_eq!(json["type"], "friendRemoved");
/// assert_eq!(json["payload"]["removedUser"], 2);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum Event {
    NewMessage(ChatMessage),
    NewAnnouncement(Announcement),
    NewFriendRequest(FriendRequest),
    FriendRequestUpdate(FriendRequestUpdate),
    FriendRemoved(FriendRemoved),
}

impl Event {
    /// Wire name of the event kind, used for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NewMessage(_) => "newMessage",
            Self::NewAnnouncement(_) => "newAnnouncement",
            Self::NewFriendRequest(_) => "newFriendRequest",
            Self::FriendRequestUpdate(_) => "friendRequestUpdate",
            Self::FriendRemoved(_) => "friendRemoved",
        }
    }
}

/// Errors produced when parsing a conversation identifier.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConversationError {
    #[error("conversation id is empty")]
    Empty,

    #[error("unknown conversation prefix in '{0}'")]
    UnknownPrefix(String),

    #[error("malformed conversation id '{0}'")]
    Malformed(String),
}

/// A parsed conversation identifier.
///
/// Direct conversations always store their participants in ascending order,
/// so `dm_9_4` and `dm_4_9` name the same conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConversationId {
    Direct { low: UserId, high: UserId },
    Group(GroupId),
}

impl ConversationId {
    /// Direct conversation between two users, in canonical order.
    pub fn direct(a: UserId, b: UserId) -> Self {
        Self::Direct {
            low: a.min(b),
            high: a.max(b),
        }
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Direct { low, high } => write!(f, "dm_{low}_{high}"),
            Self::Group(id) => write!(f, "group_{id}"),
        }
    }
}

impl FromStr for ConversationId {
    type Err = ConversationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ConversationError::Empty);
        }

        if let Some(rest) = s.strip_prefix("dm_") {
            let (a, b) = rest
                .split_once('_')
                .ok_or_else(|| ConversationError::Malformed(s.to_string()))?;
            let a: UserId = a
                .parse()
                .map_err(|_| ConversationError::Malformed(s.to_string()))?;
            let b: UserId = b
                .parse()
                .map_err(|_| ConversationError::Malformed(s.to_string()))?;
            return Ok(Self::direct(a, b));
        }

        if let Some(rest) = s.strip_prefix("group_") {
            let id = rest
                .parse()
                .map_err(|_| ConversationError::Malformed(s.to_string()))?;
            return Ok(Self::Group(id));
        }

        Err(ConversationError::UnknownPrefix(s.to_string()))
    }
}
