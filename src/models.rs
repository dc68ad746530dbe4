//! Data models for the StockDesk realtime core

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ============================================================================
// Session
// ============================================================================

/// Identity handed to the core by the authentication layer at connect time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthSession {
    pub user_id: String,
    pub token: String,
}

// ============================================================================
// Rooms & participants
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomKind {
    Direct,
    Group,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    pub user_id: String,
    pub display_name: Option<String>,
    /// Console-level role of the user (e.g. "manager"), supplied by the
    /// directory; not the room admin flag.
    pub role: Option<String>,
    #[serde(default)]
    pub online: bool,
    #[serde(default)]
    pub is_admin: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Room {
    pub id: String,
    pub name: String,
    pub kind: RoomKind,
    pub participants: Vec<Participant>,
    #[serde(default)]
    pub unread_count: i32,
    #[serde(default)]
    pub last_message: Option<String>,
    #[serde(default)]
    pub last_message_time: Option<i64>,
}

impl Room {
    pub fn is_group_chat(&self) -> bool {
        self.kind == RoomKind::Group
    }

    pub fn participant(&self, user_id: &str) -> Option<&Participant> {
        self.participants.iter().find(|p| p.user_id == user_id)
    }

    pub fn is_admin(&self, user_id: &str) -> bool {
        self.participant(user_id).map(|p| p.is_admin).unwrap_or(false)
    }
}

// ============================================================================
// Messages
// ============================================================================

/// Classification of message content for rendering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ContentKind {
    Plain,
    Code { lang: Option<String> },
    Json,
    Html,
}

impl Default for ContentKind {
    fn default() -> Self {
        Self::Plain
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Sent,
    Delivered,
    Failed,
}

impl Default for MessageStatus {
    fn default() -> Self {
        Self::Pending
    }
}

/// Preview of an earlier message carried by a forwarded copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardedRef {
    pub message_id: String,
    pub room_id: String,
    pub sender_name: Option<String>,
    pub preview: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub id: String,
    pub file_name: String,
    pub mime_type: String,
    /// Relative reference; the embedding application resolves it to a
    /// fetchable location.
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub room_id: String,
    pub sender_id: String,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub content_kind: ContentKind,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    /// emoji -> user ids that reacted with it.
    #[serde(default)]
    pub reactions: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub forwarded_from: Option<ForwardedRef>,
    /// Server-assigned ordering number; `None` while locally optimistic.
    #[serde(default)]
    pub seq: Option<u64>,
    /// Creation time, UTC milliseconds.
    pub timestamp: i64,
    #[serde(default)]
    pub status: MessageStatus,
    #[serde(default)]
    pub deleted: bool,
}

impl Message {
    /// Ordering within a room: server sequence first, optimistic entries at
    /// the tail ordered by creation time.
    pub fn sort_key(&self) -> (u64, i64) {
        (self.seq.unwrap_or(u64::MAX), self.timestamp)
    }

    pub fn preview(&self) -> Option<String> {
        if self.deleted {
            return None;
        }
        self.content
            .clone()
            .or_else(|| self.attachments.first().map(|a| a.file_name.clone()))
    }
}

// ============================================================================
// Calls
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallType {
    Audio,
    Video,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallDirection {
    Incoming,
    Outgoing,
}

/// Phase of the single active call. No session at all means idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallPhase {
    Calling,
    Ringing,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallSession {
    pub call_id: String,
    pub room_id: String,
    /// Remote participants. One entry for direct calls, the invited set for
    /// group calls.
    pub peers: Vec<String>,
    pub call_type: CallType,
    pub direction: CallDirection,
    pub is_group: bool,
    pub phase: CallPhase,
    /// Set when media comes up, UTC milliseconds. Used for duration display.
    pub connected_at: Option<i64>,
    pub recording: bool,
}
