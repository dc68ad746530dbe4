//! Wire protocol for the realtime gateway.
//!
//! Frames are JSON envelopes of the form `{"type": ..., "payload": ...}`,
//! decoded into closed tagged enums, one per event category, so unhandled
//! event kinds fail at the match instead of at runtime string checks.

use crate::error::Result;
use crate::models::*;
use serde::{Deserialize, Serialize};

// ============================================================================
// Outbound (client -> gateway)
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientEvent {
    Authenticate { token: String },
    Heartbeat,
    Typing { room_id: String, is_typing: bool },
    Message(MessageCommand),
    Room(RoomCommand),
    Call(CallCommand),
}

impl ClientEvent {
    /// Events that may be evicted from a full offline queue. Message and
    /// room mutations are never dropped silently.
    pub fn is_droppable(&self) -> bool {
        matches!(self, ClientEvent::Heartbeat | ClientEvent::Typing { .. })
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageCommand {
    Send {
        temp_id: String,
        room_id: String,
        content: Option<String>,
        content_kind: ContentKind,
        attachments: Vec<Attachment>,
        forwarded_from: Option<ForwardedRef>,
        timestamp: i64,
    },
    Delete {
        op_id: String,
        room_id: String,
        message_id: String,
    },
    React {
        op_id: String,
        room_id: String,
        message_id: String,
        emoji: String,
        add: bool,
    },
    Forward {
        forwards: Vec<ForwardItem>,
    },
    History {
        request_id: String,
        room_id: String,
        before_seq: Option<u64>,
        limit: u32,
    },
}

/// One forwarded copy: the source message and the room it lands in. The
/// `temp_id` names the optimistic copy until the server acks it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardItem {
    pub temp_id: String,
    pub source_message_id: String,
    pub source_room_id: String,
    pub target_room_id: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RoomCommand {
    Create {
        temp_id: String,
        name: String,
        room_kind: RoomKind,
        participant_ids: Vec<String>,
    },
    Rename {
        op_id: String,
        room_id: String,
        name: String,
    },
    AddMembers {
        op_id: String,
        room_id: String,
        user_ids: Vec<String>,
    },
    RemoveMember {
        op_id: String,
        room_id: String,
        user_id: String,
        transfer_admin_to: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CallCommand {
    Invite {
        call_id: String,
        room_id: String,
        peer_ids: Vec<String>,
        call_type: CallType,
        group: bool,
    },
    Accept { call_id: String },
    Reject { call_id: String, busy: bool },
    End { call_id: String },
    Recording { call_id: String, enabled: bool },
}

// ============================================================================
// Inbound (gateway -> client)
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    Authenticated { user_id: String },
    AuthRejected { reason: String },
    Typing { room_id: String, user_id: String, is_typing: bool },
    Message(MessageEvent),
    Room(RoomEvent),
    Presence(PresenceEvent),
    Call(CallEvent),
}

impl ServerEvent {
    pub fn decode(frame: &str) -> Result<Self> {
        Ok(serde_json::from_str(frame)?)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageEvent {
    /// A message authored by someone else (or another device).
    New { message: Message },
    /// Confirmation of an optimistic send; reconciles the temp id in place.
    Ack {
        temp_id: String,
        message_id: String,
        room_id: String,
        seq: u64,
    },
    /// The server refused a message-domain mutation. `op_id` is the temp id
    /// for sends, the operation id for deletes and reactions.
    Rejected {
        op_id: String,
        room_id: String,
        reason: String,
    },
    Deleted {
        op_id: Option<String>,
        room_id: String,
        message_id: String,
    },
    Reaction {
        op_id: Option<String>,
        room_id: String,
        message_id: String,
        emoji: String,
        user_id: String,
        added: bool,
    },
    /// One page of history, oldest-first within the page.
    History {
        request_id: String,
        room_id: String,
        messages: Vec<Message>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RoomEvent {
    /// Ack of a local create (temp_id set) or a push when someone adds us.
    Created {
        temp_id: Option<String>,
        room: Room,
    },
    Renamed {
        op_id: Option<String>,
        room_id: String,
        name: String,
    },
    MembersAdded {
        op_id: Option<String>,
        room_id: String,
        members: Vec<Participant>,
    },
    MemberRemoved {
        op_id: Option<String>,
        room_id: String,
        user_id: String,
        new_admin: Option<String>,
    },
    Rejected {
        op_id: String,
        reason: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PresenceEvent {
    Online { user_id: String },
    Offline { user_id: String },
    Heartbeat { user_id: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CallEvent {
    Invite {
        call_id: String,
        room_id: String,
        from: String,
        peer_ids: Vec<String>,
        call_type: CallType,
        group: bool,
    },
    Answered {
        call_id: String,
        user_id: Option<String>,
    },
    Rejected { call_id: String, busy: bool },
    Ended { call_id: String },
    MediaReady { call_id: String },
    Recording { call_id: String, enabled: bool },
}
