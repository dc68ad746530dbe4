//! Notification fan-out to the embedding application.
//!
//! Subscribers register per category and receive state-change notifications
//! in arrival order, at most once each. A panicking subscriber is isolated
//! and logged; later subscribers still run.

use crate::models::CallPhase;
use log::warn;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    Message,
    Reaction,
    Membership,
    Presence,
    Typing,
    Call,
    Connection,
}

#[derive(Debug, Clone)]
pub enum Notification {
    MessageNew { room_id: String, message_id: String },
    MessageUpdated { room_id: String, message_id: String },
    MessageDeleted { room_id: String, message_id: String },
    /// A page of history was merged into the room.
    MessagesLoaded { room_id: String },
    /// A history request went unanswered past the load timeout.
    HistoryTimedOut { room_id: String },
    ReactionChanged { room_id: String, message_id: String, emoji: String },
    MembershipChanged { room_id: String },
    RoomRenamed { room_id: String, name: String },
    PresenceChanged { user_id: String, online: bool },
    TypingChanged { room_id: String },
    /// `phase: None` means the call ended and the session is cleared.
    CallStateChanged { call_id: Option<String>, phase: Option<CallPhase> },
    /// Ring timeout elapsed without an answer or a local decision.
    CallMissed { call_id: String, room_id: String },
    ConnectionChanged { connected: bool },
}

impl Notification {
    pub fn category(&self) -> Category {
        match self {
            Notification::MessageNew { .. }
            | Notification::MessageUpdated { .. }
            | Notification::MessageDeleted { .. }
            | Notification::MessagesLoaded { .. }
            | Notification::HistoryTimedOut { .. } => Category::Message,
            Notification::ReactionChanged { .. } => Category::Reaction,
            Notification::MembershipChanged { .. } | Notification::RoomRenamed { .. } => {
                Category::Membership
            }
            Notification::PresenceChanged { .. } => Category::Presence,
            Notification::TypingChanged { .. } => Category::Typing,
            Notification::CallStateChanged { .. } | Notification::CallMissed { .. } => {
                Category::Call
            }
            Notification::ConnectionChanged { .. } => Category::Connection,
        }
    }
}

pub type Subscriber = Box<dyn Fn(&Notification) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

#[derive(Default)]
pub struct NotificationHub {
    subscribers: Mutex<HashMap<Category, Vec<(u64, Subscriber)>>>,
    next_id: AtomicU64,
}

impl NotificationHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, category: Category, f: F) -> SubscriptionId
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .lock()
            .entry(category)
            .or_default()
            .push((id, Box::new(f)));
        SubscriptionId(id)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        for list in self.subscribers.lock().values_mut() {
            list.retain(|(sub_id, _)| *sub_id != id.0);
        }
    }

    pub fn emit(&self, notification: Notification) {
        let subscribers = self.subscribers.lock();
        let Some(list) = subscribers.get(&notification.category()) else {
            return;
        };
        for (id, subscriber) in list {
            if catch_unwind(AssertUnwindSafe(|| subscriber(&notification))).is_err() {
                warn!("notification subscriber {} panicked, skipping", id);
            }
        }
    }
}
