//! Presence and typing tracker.
//!
//! Typing state is working memory with a short deadline: outbound pings are
//! debounced to one "started" signal per quiet window, and inbound entries
//! expire on their own so a remote client that disconnects mid-type never
//! leaves a stuck indicator. Online/offline is a heartbeat-refreshed map
//! where staleness counts as offline.

use crate::connection::ConnectionManager;
use crate::notify::{Notification, NotificationHub};
use crate::protocol::{ClientEvent, PresenceEvent};
use crate::CoreConfig;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::Instant;

struct PresenceEntry {
    online: bool,
    last_seen: Instant,
}

pub struct PresenceTracker {
    config: Arc<CoreConfig>,
    conn: Arc<ConnectionManager>,
    notify: Arc<NotificationHub>,
    /// room -> user -> expiry deadline for inbound typing signals.
    remote_typing: Mutex<HashMap<String, HashMap<String, Instant>>>,
    /// room -> deadline for our own outbound typing state.
    local_typing: Mutex<HashMap<String, Instant>>,
    online: Mutex<HashMap<String, PresenceEntry>>,
}

impl PresenceTracker {
    pub fn new(
        config: Arc<CoreConfig>,
        conn: Arc<ConnectionManager>,
        notify: Arc<NotificationHub>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            conn,
            notify,
            remote_typing: Mutex::new(HashMap::new()),
            local_typing: Mutex::new(HashMap::new()),
            online: Mutex::new(HashMap::new()),
        })
    }

    /// Record local typing activity. The first keystroke in a quiet window
    /// sends the "started" ping immediately; further keystrokes only push
    /// the deadline out. The stopped ping goes out on explicit stop or when
    /// the window lapses without activity.
    pub fn set_typing(&self, room_id: &str, is_typing: bool) {
        let now = Instant::now();
        if is_typing {
            let deadline = now + self.config.typing_quiet_period;
            let mut local = self.local_typing.lock();
            let fresh = match local.get(room_id) {
                Some(existing) => *existing <= now,
                None => true,
            };
            local.insert(room_id.to_string(), deadline);
            drop(local);
            if fresh {
                self.conn.send(ClientEvent::Typing {
                    room_id: room_id.to_string(),
                    is_typing: true,
                });
            }
        } else if self.local_typing.lock().remove(room_id).is_some() {
            self.conn.send(ClientEvent::Typing {
                room_id: room_id.to_string(),
                is_typing: false,
            });
        }
    }

    /// Apply an inbound typing signal from another participant.
    pub fn apply_typing(&self, room_id: &str, user_id: &str, is_typing: bool) {
        let now = Instant::now();
        let changed = {
            let mut remote = self.remote_typing.lock();
            if is_typing {
                let users = remote.entry(room_id.to_string()).or_default();
                let was_typing = users
                    .get(user_id)
                    .map(|deadline| *deadline > now)
                    .unwrap_or(false);
                users.insert(user_id.to_string(), now + self.config.typing_quiet_period);
                !was_typing
            } else {
                remote
                    .get_mut(room_id)
                    .map(|users| users.remove(user_id).is_some())
                    .unwrap_or(false)
            }
        };
        if changed {
            self.notify.emit(Notification::TypingChanged {
                room_id: room_id.to_string(),
            });
        }
    }

    pub fn apply_presence(&self, event: PresenceEvent) {
        let now = Instant::now();
        let (user_id, online) = match event {
            PresenceEvent::Online { user_id } | PresenceEvent::Heartbeat { user_id } => {
                (user_id, true)
            }
            PresenceEvent::Offline { user_id } => (user_id, false),
        };
        let changed = {
            let mut map = self.online.lock();
            let entry = map.entry(user_id.clone()).or_insert(PresenceEntry {
                online: false,
                last_seen: now,
            });
            let changed = entry.online != online;
            entry.online = online;
            if online {
                entry.last_seen = now;
            }
            changed
        };
        if changed {
            self.notify
                .emit(Notification::PresenceChanged { user_id, online });
        }
    }

    /// Users currently typing in a room. Expired entries are filtered even
    /// if the sweep has not run yet.
    pub fn typing_users(&self, room_id: &str) -> Vec<String> {
        let now = Instant::now();
        let remote = self.remote_typing.lock();
        let mut users: Vec<String> = remote
            .get(room_id)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|(_, deadline)| **deadline > now)
                    .map(|(user, _)| user.clone())
                    .collect()
            })
            .unwrap_or_default();
        users.sort();
        users
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        let now = Instant::now();
        self.online
            .lock()
            .get(user_id)
            .map(|entry| {
                entry.online && now.duration_since(entry.last_seen) < self.config.presence_timeout
            })
            .unwrap_or(false)
    }

    /// Timer-driven expiry, called from the maintenance loop: lapse local
    /// typing into an outbound stop, purge remote entries, and flip stale
    /// presence to offline exactly once per user.
    pub fn sweep(&self) {
        let now = Instant::now();

        let mut stopped = Vec::new();
        self.local_typing.lock().retain(|room_id, deadline| {
            if *deadline <= now {
                stopped.push(room_id.clone());
                false
            } else {
                true
            }
        });
        for room_id in stopped {
            self.conn.send(ClientEvent::Typing {
                room_id,
                is_typing: false,
            });
        }

        let mut changed_rooms = Vec::new();
        {
            let mut remote = self.remote_typing.lock();
            for (room_id, users) in remote.iter_mut() {
                let before = users.len();
                users.retain(|_, deadline| *deadline > now);
                if users.len() != before {
                    changed_rooms.push(room_id.clone());
                }
            }
            remote.retain(|_, users| !users.is_empty());
        }
        for room_id in changed_rooms {
            self.notify.emit(Notification::TypingChanged { room_id });
        }

        let mut went_offline = Vec::new();
        {
            let mut online = self.online.lock();
            for (user_id, entry) in online.iter_mut() {
                if entry.online
                    && now.duration_since(entry.last_seen) >= self.config.presence_timeout
                {
                    entry.online = false;
                    went_offline.push(user_id.clone());
                }
            }
        }
        for user_id in went_offline {
            self.notify.emit(Notification::PresenceChanged {
                user_id,
                online: false,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::Category;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::advance;

    fn tracker() -> (Arc<PresenceTracker>, Arc<ConnectionManager>, Arc<NotificationHub>) {
        let mut config = CoreConfig::default();
        config.typing_quiet_period = Duration::from_millis(800);
        config.presence_timeout = Duration::from_secs(45);
        let config = Arc::new(config);
        let (event_tx, _event_rx) = mpsc::unbounded_channel();
        let hub = Arc::new(NotificationHub::new());
        let conn = ConnectionManager::new(config.clone(), event_tx, hub.clone());
        let tracker = PresenceTracker::new(config, conn.clone(), hub.clone());
        (tracker, conn, hub)
    }

    #[tokio::test(start_paused = true)]
    async fn remote_typing_expires_without_a_stop_signal() {
        let (tracker, _conn, hub) = tracker();
        let changes = Arc::new(AtomicUsize::new(0));
        let counter = changes.clone();
        hub.subscribe(Category::Typing, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tracker.apply_typing("r1", "u2", true);
        assert_eq!(tracker.typing_users("r1"), vec!["u2".to_string()]);
        assert_eq!(changes.load(Ordering::SeqCst), 1);

        advance(Duration::from_millis(900)).await;
        // Lazy view already excludes the lapsed entry.
        assert!(tracker.typing_users("r1").is_empty());

        tracker.sweep();
        assert_eq!(changes.load(Ordering::SeqCst), 2);
        tracker.sweep();
        assert_eq!(changes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn refreshed_typing_outlives_the_original_deadline() {
        let (tracker, _conn, _hub) = tracker();
        tracker.apply_typing("r1", "u2", true);
        advance(Duration::from_millis(500)).await;
        tracker.apply_typing("r1", "u2", true);
        advance(Duration::from_millis(500)).await;
        assert_eq!(tracker.typing_users("r1"), vec!["u2".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn local_typing_is_debounced_to_one_start_per_window() {
        let (tracker, conn, _hub) = tracker();

        tracker.set_typing("r1", true);
        tracker.set_typing("r1", true);
        tracker.set_typing("r1", true);
        // Disconnected, so outbound pings land in the offline queue.
        assert_eq!(conn.queued_len(), 1);

        advance(Duration::from_millis(900)).await;
        tracker.sweep();
        // Quiet window lapsed: the stop ping went out on its own.
        assert_eq!(conn.queued_len(), 2);

        tracker.set_typing("r1", true);
        assert_eq!(conn.queued_len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_stop_sends_eagerly_and_only_once() {
        let (tracker, conn, _hub) = tracker();
        tracker.set_typing("r1", true);
        tracker.set_typing("r1", false);
        tracker.set_typing("r1", false);
        assert_eq!(conn.queued_len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_presence_goes_offline_exactly_once() {
        let (tracker, _conn, hub) = tracker();
        let offline_events = Arc::new(AtomicUsize::new(0));
        let counter = offline_events.clone();
        hub.subscribe(Category::Presence, move |n| {
            if matches!(n, Notification::PresenceChanged { online: false, .. }) {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        tracker.apply_presence(PresenceEvent::Heartbeat {
            user_id: "u2".into(),
        });
        assert!(tracker.is_online("u2"));

        // Several sweep intervals of staleness still produce one transition.
        advance(Duration::from_secs(46)).await;
        assert!(!tracker.is_online("u2"));
        tracker.sweep();
        tracker.sweep();
        tracker.sweep();
        assert_eq!(offline_events.load(Ordering::SeqCst), 1);

        // A fresh heartbeat brings the user back.
        tracker.apply_presence(PresenceEvent::Heartbeat {
            user_id: "u2".into(),
        });
        assert!(tracker.is_online("u2"));
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_offline_event_is_idempotent() {
        let (tracker, _conn, hub) = tracker();
        let changes = Arc::new(AtomicUsize::new(0));
        let counter = changes.clone();
        hub.subscribe(Category::Presence, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tracker.apply_presence(PresenceEvent::Online { user_id: "u2".into() });
        tracker.apply_presence(PresenceEvent::Offline { user_id: "u2".into() });
        tracker.apply_presence(PresenceEvent::Offline { user_id: "u2".into() });
        assert_eq!(changes.load(Ordering::SeqCst), 2);
    }
}
