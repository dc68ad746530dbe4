//! Room and message store.
//!
//! Normalized in-memory model of rooms, participants, and messages. Every
//! mutating operation applies optimistically, records its exact inverse in a
//! pending-operation ledger keyed by a client op id, and rolls back if the
//! gateway rejects it. Server re-deliveries are idempotent by identifier.

use crate::connection::ConnectionManager;
use crate::error::{Error, Result};
use crate::models::*;
use crate::notify::{Notification, NotificationHub};
use crate::protocol::{
    ClientEvent, ForwardItem, MessageCommand, MessageEvent, RoomCommand, RoomEvent,
};
use crate::CoreConfig;
use chrono::Utc;
use log::{debug, warn};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::Instant;
use uuid::Uuid;

/// Inverse information for an in-flight optimistic mutation. The ledger key
/// is the temp id for sends and created rooms, a generated op id otherwise.
enum PendingOp {
    Send { room_id: String },
    Delete { room_id: String, message_id: String },
    React {
        room_id: String,
        message_id: String,
        emoji: String,
        added: bool,
    },
    CreateRoom,
    Rename { room_id: String, prev_name: String },
    AddMembers { room_id: String, user_ids: Vec<String> },
    RemoveMember {
        room_id: String,
        participant: Participant,
        admin_grantee: Option<String>,
    },
}

impl PendingOp {
    fn room_id_mut(&mut self) -> Option<&mut String> {
        match self {
            PendingOp::Send { room_id }
            | PendingOp::Delete { room_id, .. }
            | PendingOp::React { room_id, .. }
            | PendingOp::Rename { room_id, .. }
            | PendingOp::AddMembers { room_id, .. }
            | PendingOp::RemoveMember { room_id, .. } => Some(room_id),
            PendingOp::CreateRoom => None,
        }
    }
}

struct HistoryRequest {
    room_id: String,
    epoch: u64,
    requested_at: Instant,
}

pub struct RoomStore {
    config: Arc<CoreConfig>,
    conn: Arc<ConnectionManager>,
    notify: Arc<NotificationHub>,
    local_user: RwLock<Option<String>>,
    rooms: RwLock<HashMap<String, Room>>,
    /// Message sequences for materialized rooms only. Rooms without an entry
    /// here are tracked as unread counters, not message lists.
    messages: RwLock<HashMap<String, Vec<Message>>>,
    has_more: RwLock<HashMap<String, bool>>,
    pending: Mutex<HashMap<String, PendingOp>>,
    /// (focused room, epoch). The epoch bumps on every focus change and
    /// invalidates history responses issued under an older focus.
    focus: Mutex<(Option<String>, u64)>,
    history_requests: Mutex<HashMap<String, HistoryRequest>>,
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

impl RoomStore {
    pub fn new(
        config: Arc<CoreConfig>,
        conn: Arc<ConnectionManager>,
        notify: Arc<NotificationHub>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            conn,
            notify,
            local_user: RwLock::new(None),
            rooms: RwLock::new(HashMap::new()),
            messages: RwLock::new(HashMap::new()),
            has_more: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            focus: Mutex::new((None, 0)),
            history_requests: Mutex::new(HashMap::new()),
        })
    }

    pub fn set_local_user(&self, user_id: &str) {
        *self.local_user.write() = Some(user_id.to_string());
    }

    fn local_user(&self) -> Result<String> {
        self.local_user.read().clone().ok_or(Error::NotConnected)
    }

    /// Install the room list fetched by the console at bootstrap. Existing
    /// entries are replaced by id; message sequences are untouched.
    pub fn seed_rooms(&self, rooms: Vec<Room>) {
        let mut map = self.rooms.write();
        for room in rooms {
            map.insert(room.id.clone(), room);
        }
    }

    // ============================================================
    // Snapshots
    // ============================================================

    pub fn rooms(&self) -> Vec<Room> {
        let mut rooms: Vec<Room> = self.rooms.read().values().cloned().collect();
        rooms.sort_by(|a, b| {
            b.last_message_time
                .cmp(&a.last_message_time)
                .then_with(|| a.name.cmp(&b.name))
        });
        rooms
    }

    pub fn room(&self, room_id: &str) -> Option<Room> {
        self.rooms.read().get(room_id).cloned()
    }

    pub fn messages(&self, room_id: &str) -> Vec<Message> {
        self.messages
            .read()
            .get(room_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn has_more(&self, room_id: &str) -> bool {
        self.has_more.read().get(room_id).copied().unwrap_or(true)
    }

    // ============================================================
    // Focus & history
    // ============================================================

    /// Switch the focused room: bumps the focus epoch (invalidating any
    /// in-flight history responses for the previous focus), materializes the
    /// room, clears its unread counter, and requests the newest page.
    pub fn open_room(&self, room_id: &str) -> Result<String> {
        if !self.rooms.read().contains_key(room_id) {
            return Err(Error::UnknownRoom(room_id.to_string()));
        }
        {
            let mut focus = self.focus.lock();
            focus.0 = Some(room_id.to_string());
            focus.1 += 1;
        }
        self.messages
            .write()
            .entry(room_id.to_string())
            .or_default();
        if let Some(room) = self.rooms.write().get_mut(room_id) {
            room.unread_count = 0;
        }
        self.load_messages(room_id, None)
    }

    /// Request one page of history older than `before_seq` (newest page when
    /// `None`). The page arrives as a history event; the returned request id
    /// identifies it.
    pub fn load_messages(&self, room_id: &str, before_seq: Option<u64>) -> Result<String> {
        if !self.rooms.read().contains_key(room_id) {
            return Err(Error::UnknownRoom(room_id.to_string()));
        }
        let request_id = Uuid::new_v4().to_string();
        let epoch = self.focus.lock().1;
        self.history_requests.lock().insert(
            request_id.clone(),
            HistoryRequest {
                room_id: room_id.to_string(),
                epoch,
                requested_at: Instant::now(),
            },
        );
        self.conn.send(ClientEvent::Message(MessageCommand::History {
            request_id: request_id.clone(),
            room_id: room_id.to_string(),
            before_seq,
            limit: self.config.history_page_size,
        }));
        Ok(request_id)
    }

    /// Fail history requests that never got a response. A page arriving
    /// after this is discarded as unknown rather than applied late.
    pub fn expire_history_requests(&self) {
        let now = Instant::now();
        let cutoff = self.config.history_timeout;
        let mut timed_out = Vec::new();
        self.history_requests.lock().retain(|_, request| {
            if now.duration_since(request.requested_at) >= cutoff {
                timed_out.push(request.room_id.clone());
                false
            } else {
                true
            }
        });
        for room_id in timed_out {
            warn!("history request for {} timed out", room_id);
            self.notify.emit(Notification::HistoryTimedOut { room_id });
        }
    }

    /// Request the page older than the oldest confirmed message currently
    /// held. Returns `None` without a request when the history is exhausted.
    pub fn load_more_messages(&self, room_id: &str) -> Result<Option<String>> {
        if !self.has_more(room_id) {
            return Ok(None);
        }
        let oldest = self
            .messages
            .read()
            .get(room_id)
            .and_then(|list| list.iter().filter_map(|m| m.seq).min());
        self.load_messages(room_id, oldest).map(Some)
    }

    // ============================================================
    // Message mutations
    // ============================================================

    pub fn send_message(
        &self,
        room_id: &str,
        content: Option<String>,
        content_kind: ContentKind,
        attachments: Vec<Attachment>,
    ) -> Result<String> {
        let sender = self.local_user()?;
        if !self.rooms.read().contains_key(room_id) {
            return Err(Error::UnknownRoom(room_id.to_string()));
        }
        let temp_id = Uuid::new_v4().to_string();
        let timestamp = now_ms();
        let message = Message {
            id: temp_id.clone(),
            room_id: room_id.to_string(),
            sender_id: sender,
            content: content.clone(),
            content_kind: content_kind.clone(),
            attachments: attachments.clone(),
            reactions: Default::default(),
            forwarded_from: None,
            seq: None,
            timestamp,
            status: MessageStatus::Pending,
            deleted: false,
        };
        self.insert_message(message, true);
        self.pending.lock().insert(
            temp_id.clone(),
            PendingOp::Send {
                room_id: room_id.to_string(),
            },
        );
        self.conn.send(ClientEvent::Message(MessageCommand::Send {
            temp_id: temp_id.clone(),
            room_id: room_id.to_string(),
            content,
            content_kind,
            attachments,
            forwarded_from: None,
            timestamp,
        }));
        self.notify.emit(Notification::MessageNew {
            room_id: room_id.to_string(),
            message_id: temp_id.clone(),
        });
        Ok(temp_id)
    }

    /// Forward messages into target rooms. Each copy is a new message
    /// carrying a preview reference to its original; the originals stay
    /// untouched in their source rooms. A non-empty note goes out afterwards
    /// as one ordinary message per target room.
    pub fn forward_message(
        &self,
        message_ids: &[String],
        target_room_ids: &[String],
        note: Option<&str>,
    ) -> Result<Vec<String>> {
        let sender = self.local_user()?;
        let mut sources = Vec::new();
        {
            let messages = self.messages.read();
            for id in message_ids {
                let found = messages
                    .values()
                    .flatten()
                    .find(|m| m.id == *id && !m.deleted)
                    .cloned()
                    .ok_or_else(|| Error::UnknownMessage(id.clone()))?;
                sources.push(found);
            }
        }
        {
            let rooms = self.rooms.read();
            for target in target_room_ids {
                if !rooms.contains_key(target) {
                    return Err(Error::UnknownRoom(target.clone()));
                }
            }
        }

        let timestamp = now_ms();
        let mut temp_ids = Vec::new();
        let mut forwards = Vec::new();
        for target in target_room_ids {
            for source in &sources {
                let temp_id = Uuid::new_v4().to_string();
                let sender_name = self.room(&source.room_id).and_then(|room| {
                    room.participant(&source.sender_id)
                        .and_then(|p| p.display_name.clone())
                });
                // Attachments are owned by one message; copies get fresh ids.
                let attachments: Vec<Attachment> = source
                    .attachments
                    .iter()
                    .map(|a| Attachment {
                        id: Uuid::new_v4().to_string(),
                        file_name: a.file_name.clone(),
                        mime_type: a.mime_type.clone(),
                        url: a.url.clone(),
                    })
                    .collect();
                let message = Message {
                    id: temp_id.clone(),
                    room_id: target.clone(),
                    sender_id: sender.clone(),
                    content: source.content.clone(),
                    content_kind: source.content_kind.clone(),
                    attachments,
                    reactions: Default::default(),
                    forwarded_from: Some(ForwardedRef {
                        message_id: source.id.clone(),
                        room_id: source.room_id.clone(),
                        sender_name,
                        preview: source.preview(),
                    }),
                    seq: None,
                    timestamp,
                    status: MessageStatus::Pending,
                    deleted: false,
                };
                self.insert_message(message, true);
                self.pending.lock().insert(
                    temp_id.clone(),
                    PendingOp::Send {
                        room_id: target.clone(),
                    },
                );
                self.notify.emit(Notification::MessageNew {
                    room_id: target.clone(),
                    message_id: temp_id.clone(),
                });
                forwards.push(ForwardItem {
                    temp_id: temp_id.clone(),
                    source_message_id: source.id.clone(),
                    source_room_id: source.room_id.clone(),
                    target_room_id: target.clone(),
                    timestamp,
                });
                temp_ids.push(temp_id);
            }
        }
        self.conn
            .send(ClientEvent::Message(MessageCommand::Forward { forwards }));

        if let Some(note) = note.filter(|n| !n.trim().is_empty()) {
            for target in target_room_ids {
                self.send_message(target, Some(note.to_string()), ContentKind::Plain, Vec::new())?;
            }
        }
        Ok(temp_ids)
    }

    /// Soft-delete a message. Only the sender or a room admin may delete;
    /// the flag is set optimistically and cleared again if the server
    /// rejects the intent.
    pub fn delete_message(&self, message_id: &str) -> Result<()> {
        let local = self.local_user()?;
        let room_id = self
            .find_room_of(message_id)
            .ok_or_else(|| Error::UnknownMessage(message_id.to_string()))?;

        {
            let mut messages = self.messages.write();
            let msg = messages
                .get_mut(&room_id)
                .and_then(|list| list.iter_mut().find(|m| m.id == message_id))
                .ok_or_else(|| Error::UnknownMessage(message_id.to_string()))?;
            if msg.sender_id != local
                && !self
                    .rooms
                    .read()
                    .get(&room_id)
                    .map(|r| r.is_admin(&local))
                    .unwrap_or(false)
            {
                return Err(Error::NotPermitted(
                    "only the sender or a room admin can delete a message".into(),
                ));
            }
            if msg.deleted {
                return Ok(());
            }
            msg.deleted = true;
        }

        let op_id = Uuid::new_v4().to_string();
        self.pending.lock().insert(
            op_id.clone(),
            PendingOp::Delete {
                room_id: room_id.clone(),
                message_id: message_id.to_string(),
            },
        );
        self.conn.send(ClientEvent::Message(MessageCommand::Delete {
            op_id,
            room_id: room_id.clone(),
            message_id: message_id.to_string(),
        }));
        self.notify.emit(Notification::MessageDeleted {
            room_id,
            message_id: message_id.to_string(),
        });
        Ok(())
    }

    /// Toggle the local user's reaction on a message.
    pub fn react_to_message(&self, message_id: &str, emoji: &str) -> Result<()> {
        let local = self.local_user()?;
        let room_id = self
            .find_room_of(message_id)
            .ok_or_else(|| Error::UnknownMessage(message_id.to_string()))?;

        let added = {
            let mut messages = self.messages.write();
            let msg = messages
                .get_mut(&room_id)
                .and_then(|list| list.iter_mut().find(|m| m.id == message_id))
                .ok_or_else(|| Error::UnknownMessage(message_id.to_string()))?;
            toggle_reaction(msg, emoji, &local)
        };

        let op_id = Uuid::new_v4().to_string();
        self.pending.lock().insert(
            op_id.clone(),
            PendingOp::React {
                room_id: room_id.clone(),
                message_id: message_id.to_string(),
                emoji: emoji.to_string(),
                added,
            },
        );
        self.conn.send(ClientEvent::Message(MessageCommand::React {
            op_id,
            room_id: room_id.clone(),
            message_id: message_id.to_string(),
            emoji: emoji.to_string(),
            add: added,
        }));
        self.notify.emit(Notification::ReactionChanged {
            room_id,
            message_id: message_id.to_string(),
            emoji: emoji.to_string(),
        });
        Ok(())
    }

    /// Re-send a message that previously failed.
    pub fn retry_failed(&self, message_id: &str) -> Result<()> {
        let room_id = self
            .find_room_of(message_id)
            .ok_or_else(|| Error::UnknownMessage(message_id.to_string()))?;
        let message = {
            let mut messages = self.messages.write();
            let msg = messages
                .get_mut(&room_id)
                .and_then(|list| list.iter_mut().find(|m| m.id == message_id))
                .ok_or_else(|| Error::UnknownMessage(message_id.to_string()))?;
            if msg.status != MessageStatus::Failed {
                return Err(Error::InvalidState("message has not failed".into()));
            }
            msg.status = MessageStatus::Pending;
            msg.clone()
        };
        self.pending.lock().insert(
            message.id.clone(),
            PendingOp::Send {
                room_id: room_id.clone(),
            },
        );
        self.conn.send(ClientEvent::Message(MessageCommand::Send {
            temp_id: message.id.clone(),
            room_id,
            content: message.content.clone(),
            content_kind: message.content_kind.clone(),
            attachments: message.attachments.clone(),
            forwarded_from: message.forwarded_from.clone(),
            timestamp: message.timestamp,
        }));
        self.notify.emit(Notification::MessageUpdated {
            room_id: message.room_id,
            message_id: message.id,
        });
        Ok(())
    }

    /// Drop a failed message entirely, restoring the pre-send sequence.
    pub fn discard_failed(&self, message_id: &str) -> Result<()> {
        let room_id = self
            .find_room_of(message_id)
            .ok_or_else(|| Error::UnknownMessage(message_id.to_string()))?;
        {
            let mut messages = self.messages.write();
            let list = messages
                .get_mut(&room_id)
                .ok_or_else(|| Error::UnknownRoom(room_id.clone()))?;
            let pos = list
                .iter()
                .position(|m| m.id == message_id)
                .ok_or_else(|| Error::UnknownMessage(message_id.to_string()))?;
            if list[pos].status != MessageStatus::Failed {
                return Err(Error::InvalidState("message has not failed".into()));
            }
            list.remove(pos);
        }
        self.notify.emit(Notification::MessageDeleted {
            room_id,
            message_id: message_id.to_string(),
        });
        Ok(())
    }

    /// Invoked by the connection layer when an outbound send expires in the
    /// offline queue without reaching the gateway.
    pub fn mark_send_failed(&self, temp_id: &str) {
        let Some(room_id) = self.find_room_of(temp_id) else {
            return;
        };
        {
            let mut messages = self.messages.write();
            if let Some(msg) = messages
                .get_mut(&room_id)
                .and_then(|list| list.iter_mut().find(|m| m.id == temp_id))
            {
                if msg.status != MessageStatus::Pending {
                    return;
                }
                msg.status = MessageStatus::Failed;
            }
        }
        self.pending.lock().remove(temp_id);
        self.notify.emit(Notification::MessageUpdated {
            room_id,
            message_id: temp_id.to_string(),
        });
    }

    // ============================================================
    // Room mutations
    // ============================================================

    pub fn create_room(
        &self,
        name: &str,
        participant_ids: Vec<String>,
        kind: RoomKind,
    ) -> Result<String> {
        let local = self.local_user()?;
        let temp_id = Uuid::new_v4().to_string();
        let mut participants = vec![Participant {
            user_id: local.clone(),
            display_name: None,
            role: None,
            online: true,
            is_admin: true,
        }];
        for user_id in &participant_ids {
            if *user_id != local && !participants.iter().any(|p| p.user_id == *user_id) {
                participants.push(Participant {
                    user_id: user_id.clone(),
                    display_name: None,
                    role: None,
                    online: false,
                    is_admin: false,
                });
            }
        }
        let room = Room {
            id: temp_id.clone(),
            name: name.to_string(),
            kind,
            participants,
            unread_count: 0,
            last_message: None,
            last_message_time: None,
        };
        self.rooms.write().insert(temp_id.clone(), room);
        self.messages.write().insert(temp_id.clone(), Vec::new());
        self.pending
            .lock()
            .insert(temp_id.clone(), PendingOp::CreateRoom);
        self.conn.send(ClientEvent::Room(RoomCommand::Create {
            temp_id: temp_id.clone(),
            name: name.to_string(),
            room_kind: kind,
            participant_ids,
        }));
        self.notify.emit(Notification::MembershipChanged {
            room_id: temp_id.clone(),
        });
        Ok(temp_id)
    }

    pub fn rename_room(&self, room_id: &str, name: &str) -> Result<()> {
        self.local_user()?;
        let prev_name = {
            let mut rooms = self.rooms.write();
            let room = rooms
                .get_mut(room_id)
                .ok_or_else(|| Error::UnknownRoom(room_id.to_string()))?;
            let prev = room.name.clone();
            room.name = name.to_string();
            prev
        };
        let op_id = Uuid::new_v4().to_string();
        self.pending.lock().insert(
            op_id.clone(),
            PendingOp::Rename {
                room_id: room_id.to_string(),
                prev_name,
            },
        );
        self.conn.send(ClientEvent::Room(RoomCommand::Rename {
            op_id,
            room_id: room_id.to_string(),
            name: name.to_string(),
        }));
        self.notify.emit(Notification::RoomRenamed {
            room_id: room_id.to_string(),
            name: name.to_string(),
        });
        Ok(())
    }

    pub fn add_members(&self, room_id: &str, user_ids: Vec<String>) -> Result<()> {
        self.local_user()?;
        let added = {
            let mut rooms = self.rooms.write();
            let room = rooms
                .get_mut(room_id)
                .ok_or_else(|| Error::UnknownRoom(room_id.to_string()))?;
            let mut added = Vec::new();
            for user_id in user_ids {
                // A user appears in the participant set at most once.
                if room.participants.iter().any(|p| p.user_id == user_id) {
                    continue;
                }
                room.participants.push(Participant {
                    user_id: user_id.clone(),
                    display_name: None,
                    role: None,
                    online: false,
                    is_admin: false,
                });
                added.push(user_id);
            }
            added
        };
        if added.is_empty() {
            return Ok(());
        }
        let op_id = Uuid::new_v4().to_string();
        self.pending.lock().insert(
            op_id.clone(),
            PendingOp::AddMembers {
                room_id: room_id.to_string(),
                user_ids: added.clone(),
            },
        );
        self.conn.send(ClientEvent::Room(RoomCommand::AddMembers {
            op_id,
            room_id: room_id.to_string(),
            user_ids: added,
        }));
        self.notify.emit(Notification::MembershipChanged {
            room_id: room_id.to_string(),
        });
        Ok(())
    }

    pub fn remove_member(
        &self,
        room_id: &str,
        user_id: &str,
        transfer_admin_to: Option<String>,
    ) -> Result<()> {
        self.local_user()?;
        let (participant, admin_grantee) = {
            let mut rooms = self.rooms.write();
            let room = rooms
                .get_mut(room_id)
                .ok_or_else(|| Error::UnknownRoom(room_id.to_string()))?;
            let pos = room
                .participants
                .iter()
                .position(|p| p.user_id == user_id)
                .ok_or_else(|| Error::InvalidState("user is not a participant".into()))?;
            let participant = room.participants.remove(pos);
            let mut admin_grantee = None;
            if let Some(target) = transfer_admin_to.as_deref() {
                if let Some(p) = room
                    .participants
                    .iter_mut()
                    .find(|p| p.user_id == target && !p.is_admin)
                {
                    p.is_admin = true;
                    admin_grantee = Some(target.to_string());
                }
            }
            (participant, admin_grantee)
        };
        let op_id = Uuid::new_v4().to_string();
        self.pending.lock().insert(
            op_id.clone(),
            PendingOp::RemoveMember {
                room_id: room_id.to_string(),
                participant,
                admin_grantee,
            },
        );
        self.conn.send(ClientEvent::Room(RoomCommand::RemoveMember {
            op_id,
            room_id: room_id.to_string(),
            user_id: user_id.to_string(),
            transfer_admin_to,
        }));
        self.notify.emit(Notification::MembershipChanged {
            room_id: room_id.to_string(),
        });
        Ok(())
    }

    // ============================================================
    // Inbound event application
    // ============================================================

    pub fn apply_message_event(&self, event: MessageEvent) {
        match event {
            MessageEvent::New { mut message } => {
                if !self.rooms.read().contains_key(&message.room_id) {
                    debug!("message for unknown room {}, ignoring", message.room_id);
                    return;
                }
                message.status = MessageStatus::Delivered;
                let room_id = message.room_id.clone();
                let message_id = message.id.clone();
                let loaded = self.messages.read().contains_key(&room_id);
                if loaded {
                    // Re-delivery after reconnect lands here; identifiers
                    // make it a no-op.
                    if !self.insert_message(message, false) {
                        return;
                    }
                } else {
                    // Unloaded room: only the unread channel moves.
                    self.touch_room_meta(&message);
                }
                let focused = self.focus.lock().0.clone();
                if focused.as_deref() != Some(room_id.as_str()) {
                    if let Some(room) = self.rooms.write().get_mut(&room_id) {
                        room.unread_count += 1;
                    }
                }
                self.notify.emit(Notification::MessageNew {
                    room_id,
                    message_id,
                });
            }
            MessageEvent::Ack {
                temp_id,
                message_id,
                room_id,
                seq,
            } => {
                {
                    let mut messages = self.messages.write();
                    if let Some(list) = messages.get_mut(&room_id) {
                        if list.iter().any(|m| m.id == message_id) {
                            // The server copy arrived first during catch-up;
                            // drop the optimistic twin instead of duplicating.
                            list.retain(|m| m.id != temp_id);
                        } else if let Some(msg) = list.iter_mut().find(|m| m.id == temp_id) {
                            msg.id = message_id.clone();
                            msg.seq = Some(seq);
                            msg.status = MessageStatus::Sent;
                        }
                        list.sort_by_key(|m| m.sort_key());
                    }
                }
                self.pending.lock().remove(&temp_id);
                self.notify.emit(Notification::MessageUpdated {
                    room_id,
                    message_id,
                });
            }
            MessageEvent::Rejected {
                op_id,
                room_id: _,
                reason,
            } => {
                warn!("message mutation rejected: {}", reason);
                self.rollback(&op_id);
            }
            MessageEvent::Deleted {
                op_id,
                room_id,
                message_id,
            } => {
                if let Some(op_id) = op_id {
                    if self.pending.lock().remove(&op_id).is_some() {
                        // Confirmation of our own optimistic delete.
                        return;
                    }
                }
                let changed = {
                    let mut messages = self.messages.write();
                    messages
                        .get_mut(&room_id)
                        .and_then(|list| list.iter_mut().find(|m| m.id == message_id))
                        .filter(|m| !m.deleted)
                        .map(|m| {
                            m.deleted = true;
                        })
                        .is_some()
                };
                if changed {
                    self.notify.emit(Notification::MessageDeleted {
                        room_id,
                        message_id,
                    });
                }
            }
            MessageEvent::Reaction {
                op_id,
                room_id,
                message_id,
                emoji,
                user_id,
                added,
            } => {
                if let Some(op_id) = op_id {
                    if self.pending.lock().remove(&op_id).is_some() {
                        return;
                    }
                }
                let changed = {
                    let mut messages = self.messages.write();
                    let Some(msg) = messages
                        .get_mut(&room_id)
                        .and_then(|list| list.iter_mut().find(|m| m.id == message_id))
                    else {
                        return;
                    };
                    apply_reaction(msg, &emoji, &user_id, added)
                };
                if changed {
                    self.notify.emit(Notification::ReactionChanged {
                        room_id,
                        message_id,
                        emoji,
                    });
                }
            }
            MessageEvent::History {
                request_id,
                room_id,
                messages,
            } => self.apply_history(request_id, room_id, messages),
        }
    }

    fn apply_history(&self, request_id: String, room_id: String, page: Vec<Message>) {
        let Some(request) = self.history_requests.lock().remove(&request_id) else {
            debug!("history page for unknown request, discarding");
            return;
        };
        if request.epoch != self.focus.lock().1 {
            debug!("history page for {} outlived its focus, discarding", room_id);
            return;
        }
        if request.room_id != room_id {
            warn!("history page room mismatch, discarding");
            return;
        }
        let full_page = page.len() as u32 >= self.config.history_page_size;
        {
            let mut messages = self.messages.write();
            let list = messages.entry(room_id.clone()).or_default();
            for mut message in page {
                if list.iter().any(|m| m.id == message.id) {
                    continue;
                }
                message.status = MessageStatus::Delivered;
                list.push(message);
            }
            list.sort_by_key(|m| m.sort_key());
        }
        self.has_more.write().insert(room_id.clone(), full_page);
        self.notify.emit(Notification::MessagesLoaded { room_id });
    }

    pub fn apply_room_event(&self, event: RoomEvent) {
        match event {
            RoomEvent::Created { temp_id, room } => {
                if let Some(temp_id) = temp_id {
                    if self.pending.lock().remove(&temp_id).is_some() {
                        self.reconcile_room(&temp_id, room);
                        return;
                    }
                }
                // Pushed room: we were invited, or a reconnect replayed it.
                let room_id = room.id.clone();
                self.rooms.write().insert(room_id.clone(), room);
                self.notify
                    .emit(Notification::MembershipChanged { room_id });
            }
            RoomEvent::Renamed {
                op_id,
                room_id,
                name,
            } => {
                if let Some(op_id) = op_id {
                    if self.pending.lock().remove(&op_id).is_some() {
                        return;
                    }
                }
                let changed = {
                    let mut rooms = self.rooms.write();
                    rooms
                        .get_mut(&room_id)
                        .filter(|room| room.name != name)
                        .map(|room| room.name = name.clone())
                        .is_some()
                };
                if changed {
                    self.notify
                        .emit(Notification::RoomRenamed { room_id, name });
                }
            }
            RoomEvent::MembersAdded {
                op_id,
                room_id,
                members,
            } => {
                if let Some(op_id) = op_id {
                    self.pending.lock().remove(&op_id);
                }
                let changed = {
                    let mut rooms = self.rooms.write();
                    let Some(room) = rooms.get_mut(&room_id) else {
                        return;
                    };
                    let mut changed = false;
                    for member in members {
                        match room
                            .participants
                            .iter_mut()
                            .find(|p| p.user_id == member.user_id)
                        {
                            // The server copy carries names and roles the
                            // optimistic stub lacked.
                            Some(existing) => *existing = member,
                            None => {
                                room.participants.push(member);
                                changed = true;
                            }
                        }
                    }
                    changed
                };
                if changed {
                    self.notify
                        .emit(Notification::MembershipChanged { room_id });
                }
            }
            RoomEvent::MemberRemoved {
                op_id,
                room_id,
                user_id,
                new_admin,
            } => {
                if let Some(op_id) = op_id {
                    self.pending.lock().remove(&op_id);
                }
                let changed = {
                    let mut rooms = self.rooms.write();
                    let Some(room) = rooms.get_mut(&room_id) else {
                        return;
                    };
                    let before = room.participants.len();
                    room.participants.retain(|p| p.user_id != user_id);
                    let mut changed = room.participants.len() != before;
                    if let Some(new_admin) = new_admin {
                        if let Some(p) = room
                            .participants
                            .iter_mut()
                            .find(|p| p.user_id == new_admin && !p.is_admin)
                        {
                            p.is_admin = true;
                            changed = true;
                        }
                    }
                    changed
                };
                if changed {
                    self.notify
                        .emit(Notification::MembershipChanged { room_id });
                }
            }
            RoomEvent::Rejected { op_id, reason } => {
                warn!("room mutation rejected: {}", reason);
                self.rollback(&op_id);
            }
        }
    }

    /// Replace a temp room id with the server-assigned room, carrying the
    /// message sequence and focus along.
    fn reconcile_room(&self, temp_id: &str, room: Room) {
        let room_id = room.id.clone();
        {
            let mut rooms = self.rooms.write();
            rooms.remove(temp_id);
            rooms.insert(room_id.clone(), room);
        }
        {
            let mut messages = self.messages.write();
            if let Some(mut list) = messages.remove(temp_id) {
                for message in &mut list {
                    message.room_id = room_id.clone();
                }
                messages.insert(room_id.clone(), list);
            }
        }
        {
            let mut focus = self.focus.lock();
            if focus.0.as_deref() == Some(temp_id) {
                focus.0 = Some(room_id.clone());
            }
        }
        {
            // In-flight ops against the temp room must roll back against the
            // server room if they are later rejected.
            let mut pending = self.pending.lock();
            for op in pending.values_mut() {
                if let Some(rid) = op.room_id_mut() {
                    if rid == temp_id {
                        *rid = room_id.clone();
                    }
                }
            }
        }
        self.notify
            .emit(Notification::MembershipChanged { room_id });
    }

    /// Apply the recorded inverse of a rejected optimistic mutation.
    fn rollback(&self, op_id: &str) {
        let Some(op) = self.pending.lock().remove(op_id) else {
            debug!("rejection for unknown op {}, ignoring", op_id);
            return;
        };
        match op {
            PendingOp::Send { room_id } => {
                // The message stays visible, flagged failed, so the caller
                // can retry or discard it.
                {
                    let mut messages = self.messages.write();
                    if let Some(msg) = messages
                        .get_mut(&room_id)
                        .and_then(|list| list.iter_mut().find(|m| m.id == op_id))
                    {
                        msg.status = MessageStatus::Failed;
                    }
                }
                self.notify.emit(Notification::MessageUpdated {
                    room_id,
                    message_id: op_id.to_string(),
                });
            }
            PendingOp::Delete {
                room_id,
                message_id,
            } => {
                {
                    let mut messages = self.messages.write();
                    if let Some(msg) = messages
                        .get_mut(&room_id)
                        .and_then(|list| list.iter_mut().find(|m| m.id == message_id))
                    {
                        msg.deleted = false;
                    }
                }
                self.notify.emit(Notification::MessageUpdated {
                    room_id,
                    message_id,
                });
            }
            PendingOp::React {
                room_id,
                message_id,
                emoji,
                added,
            } => {
                let local = match self.local_user() {
                    Ok(user) => user,
                    Err(_) => return,
                };
                {
                    let mut messages = self.messages.write();
                    if let Some(msg) = messages
                        .get_mut(&room_id)
                        .and_then(|list| list.iter_mut().find(|m| m.id == message_id))
                    {
                        apply_reaction(msg, &emoji, &local, !added);
                    }
                }
                self.notify.emit(Notification::ReactionChanged {
                    room_id,
                    message_id,
                    emoji,
                });
            }
            PendingOp::CreateRoom => {
                self.rooms.write().remove(op_id);
                self.messages.write().remove(op_id);
                self.notify.emit(Notification::MembershipChanged {
                    room_id: op_id.to_string(),
                });
            }
            PendingOp::Rename { room_id, prev_name } => {
                {
                    let mut rooms = self.rooms.write();
                    if let Some(room) = rooms.get_mut(&room_id) {
                        room.name = prev_name.clone();
                    }
                }
                self.notify.emit(Notification::RoomRenamed {
                    room_id,
                    name: prev_name,
                });
            }
            PendingOp::AddMembers { room_id, user_ids } => {
                {
                    let mut rooms = self.rooms.write();
                    if let Some(room) = rooms.get_mut(&room_id) {
                        room.participants
                            .retain(|p| !user_ids.contains(&p.user_id));
                    }
                }
                self.notify
                    .emit(Notification::MembershipChanged { room_id });
            }
            PendingOp::RemoveMember {
                room_id,
                participant,
                admin_grantee,
            } => {
                {
                    let mut rooms = self.rooms.write();
                    if let Some(room) = rooms.get_mut(&room_id) {
                        if let Some(grantee) = admin_grantee {
                            if let Some(p) = room
                                .participants
                                .iter_mut()
                                .find(|p| p.user_id == grantee)
                            {
                                p.is_admin = false;
                            }
                        }
                        if !room
                            .participants
                            .iter()
                            .any(|p| p.user_id == participant.user_id)
                        {
                            room.participants.push(participant);
                        }
                    }
                }
                self.notify
                    .emit(Notification::MembershipChanged { room_id });
            }
        }
    }

    // ============================================================
    // Internals
    // ============================================================

    /// Insert a message in sequence order, deduplicating by id. Returns
    /// false on a duplicate. With `materialize` false the room's list must
    /// already exist.
    fn insert_message(&self, message: Message, materialize: bool) -> bool {
        {
            let mut messages = self.messages.write();
            let list = if materialize {
                messages.entry(message.room_id.clone()).or_default()
            } else {
                match messages.get_mut(&message.room_id) {
                    Some(list) => list,
                    None => return false,
                }
            };
            if list.iter().any(|m| m.id == message.id) {
                return false;
            }
            list.push(message.clone());
            list.sort_by_key(|m| m.sort_key());
        }
        self.touch_room_meta(&message);
        true
    }

    fn touch_room_meta(&self, message: &Message) {
        let mut rooms = self.rooms.write();
        if let Some(room) = rooms.get_mut(&message.room_id) {
            if room.last_message_time.map(|t| t <= message.timestamp).unwrap_or(true) {
                room.last_message = message.preview();
                room.last_message_time = Some(message.timestamp);
            }
        }
    }

    fn find_room_of(&self, message_id: &str) -> Option<String> {
        self.messages.read().iter().find_map(|(room_id, list)| {
            list.iter()
                .any(|m| m.id == message_id)
                .then(|| room_id.clone())
        })
    }
}

fn toggle_reaction(message: &mut Message, emoji: &str, user_id: &str) -> bool {
    let reactors = message.reactions.entry(emoji.to_string()).or_default();
    if let Some(pos) = reactors.iter().position(|u| u == user_id) {
        reactors.remove(pos);
        if reactors.is_empty() {
            message.reactions.remove(emoji);
        }
        false
    } else {
        reactors.push(user_id.to_string());
        true
    }
}

/// Idempotent application of a reaction change; returns whether anything
/// changed.
fn apply_reaction(message: &mut Message, emoji: &str, user_id: &str, added: bool) -> bool {
    if added {
        let reactors = message.reactions.entry(emoji.to_string()).or_default();
        if reactors.iter().any(|u| u == user_id) {
            return false;
        }
        reactors.push(user_id.to_string());
        true
    } else {
        let Some(reactors) = message.reactions.get_mut(emoji) else {
            return false;
        };
        let Some(pos) = reactors.iter().position(|u| u == user_id) else {
            return false;
        };
        reactors.remove(pos);
        if reactors.is_empty() {
            message.reactions.remove(emoji);
        }
        true
    }
}
