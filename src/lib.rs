//! StockDesk Realtime Core Library
//!
//! Client-resident coordination core for the StockDesk console: keeps chat
//! rooms and messages consistent between locally-optimistic edits and the
//! server-authoritative event stream, and drives the call signaling state
//! machine over the same gateway connection. The core renders nothing; it
//! manages state and emits change notifications the console subscribes to.

pub mod call;
pub mod connection;
pub mod error;
pub mod models;
pub mod notify;
pub mod presence;
pub mod protocol;
pub mod store;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub use call::CallManager;
pub use connection::ConnectionManager;
pub use error::{Error, Result};
pub use models::*;
pub use notify::{Category, Notification, NotificationHub, SubscriptionId};
pub use presence::PresenceTracker;
pub use protocol::*;
pub use store::RoomStore;

/// Gateway endpoint configuration
#[derive(Clone, Debug)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
}

impl GatewayConfig {
    pub fn new(host: &str, port: u16, use_tls: bool) -> Self {
        Self {
            host: host.to_string(),
            port,
            use_tls,
        }
    }

    pub fn ws_url(&self) -> String {
        let scheme = if self.use_tls { "wss" } else { "ws" };
        format!("{}://{}:{}/rt", scheme, self.host, self.port)
    }
}

/// Core tunables. Defaults are production values; tests shrink the windows.
#[derive(Clone, Debug)]
pub struct CoreConfig {
    pub gateway: GatewayConfig,
    pub handshake_timeout: Duration,
    pub reconnect_base_delay: Duration,
    pub reconnect_max_delay: Duration,
    pub reconnect_max_attempts: u32,
    pub outbound_queue_capacity: usize,
    /// Queued outbound events older than this are failed, not held forever.
    pub send_timeout: Duration,
    pub typing_quiet_period: Duration,
    pub presence_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub ring_timeout: Duration,
    pub history_page_size: u32,
    /// Unanswered history requests are failed after this long.
    pub history_timeout: Duration,
    pub sweep_interval: Duration,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            gateway: GatewayConfig::new("localhost", 8443, true),
            handshake_timeout: Duration::from_secs(10),
            reconnect_base_delay: Duration::from_millis(500),
            reconnect_max_delay: Duration::from_secs(30),
            reconnect_max_attempts: 8,
            outbound_queue_capacity: 256,
            send_timeout: Duration::from_secs(30),
            typing_quiet_period: Duration::from_millis(800),
            presence_timeout: Duration::from_secs(45),
            heartbeat_interval: Duration::from_secs(15),
            ring_timeout: Duration::from_secs(45),
            history_page_size: 50,
            history_timeout: Duration::from_secs(15),
            sweep_interval: Duration::from_millis(500),
        }
    }
}

/// Main client instance: owns the coordination components, the ordered
/// event loop applying gateway events to them, and the maintenance timers.
pub struct StockdeskClient {
    conn: Arc<ConnectionManager>,
    store: Arc<RoomStore>,
    presence: Arc<PresenceTracker>,
    calls: Arc<CallManager>,
    notify: Arc<NotificationHub>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl StockdeskClient {
    /// Build a client instance. Must run inside a tokio runtime; the event
    /// router and maintenance tasks are spawned here and torn down by
    /// [`shutdown`](Self::shutdown).
    pub fn new(config: CoreConfig) -> Self {
        let config = Arc::new(config);
        let notify = Arc::new(NotificationHub::new());
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let conn = ConnectionManager::new(config.clone(), event_tx, notify.clone());
        let store = RoomStore::new(config.clone(), conn.clone(), notify.clone());
        let presence = PresenceTracker::new(config.clone(), conn.clone(), notify.clone());
        let calls = CallManager::new(config.clone(), conn.clone(), notify.clone());

        // A send that expires in the offline queue becomes a failed message,
        // never a silent drop.
        let failed_store = Arc::downgrade(&store);
        conn.set_send_failure_handler(move |event| {
            let Some(store) = failed_store.upgrade() else {
                return;
            };
            match event {
                ClientEvent::Message(MessageCommand::Send { temp_id, .. }) => {
                    store.mark_send_failed(temp_id)
                }
                ClientEvent::Message(MessageCommand::Forward { forwards }) => {
                    for item in forwards {
                        store.mark_send_failed(&item.temp_id);
                    }
                }
                _ => {}
            }
        });

        // Single consumer: events are applied strictly in arrival order.
        let router = (store.clone(), presence.clone(), calls.clone());
        let router_task = tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                route(&router.0, &router.1, &router.2, event);
            }
        });

        let weak_presence = Arc::downgrade(&presence);
        let weak_conn = Arc::downgrade(&conn);
        let weak_store = Arc::downgrade(&store);
        let sweep_interval = config.sweep_interval;
        let heartbeat_interval = config.heartbeat_interval;
        let maintenance_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_interval);
            let mut last_heartbeat = tokio::time::Instant::now();
            loop {
                ticker.tick().await;
                let (Some(presence), Some(conn), Some(store)) = (
                    weak_presence.upgrade(),
                    weak_conn.upgrade(),
                    weak_store.upgrade(),
                ) else {
                    break;
                };
                presence.sweep();
                conn.expire_queued();
                store.expire_history_requests();
                if conn.is_connected() && last_heartbeat.elapsed() >= heartbeat_interval {
                    conn.send(ClientEvent::Heartbeat);
                    last_heartbeat = tokio::time::Instant::now();
                }
            }
        });

        Self {
            conn,
            store,
            presence,
            calls,
            notify,
            tasks: Mutex::new(vec![router_task, maintenance_task]),
        }
    }

    // ============= Session =============

    /// Connect to the gateway with the credential supplied by the auth
    /// layer. Fails on transport errors, rejected credentials, or a
    /// handshake timeout.
    pub async fn connect(&self, session: &AuthSession) -> Result<()> {
        self.store.set_local_user(&session.user_id);
        self.calls.set_local_user(&session.user_id);
        self.conn.clone().connect(&session.token).await
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_connected()
    }

    /// Outbound events currently held for the next reconnect.
    pub fn queued_outbound(&self) -> usize {
        self.conn.queued_len()
    }

    /// Tear the core down: stops the router and maintenance timers, closes
    /// the transport, and clears the call session.
    pub fn shutdown(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.conn.shutdown();
        self.calls.teardown();
    }

    // ============= Notifications =============

    pub fn subscribe<F>(&self, category: Category, f: F) -> SubscriptionId
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        self.notify.subscribe(category, f)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.notify.unsubscribe(id)
    }

    /// Apply one decoded gateway event. Normally driven by the connection
    /// read loop; exposed so an embedder owning its own transport (or a
    /// test) can feed the core directly.
    pub fn handle_event(&self, event: ServerEvent) {
        route(&self.store, &self.presence, &self.calls, event);
    }

    // ============= Rooms & messages =============

    pub fn seed_rooms(&self, rooms: Vec<Room>) {
        self.store.seed_rooms(rooms)
    }

    pub fn rooms(&self) -> Vec<Room> {
        self.store.rooms()
    }

    pub fn room(&self, room_id: &str) -> Option<Room> {
        self.store.room(room_id)
    }

    pub fn messages(&self, room_id: &str) -> Vec<Message> {
        self.store.messages(room_id)
    }

    pub fn has_more_messages(&self, room_id: &str) -> bool {
        self.store.has_more(room_id)
    }

    pub fn open_room(&self, room_id: &str) -> Result<String> {
        self.store.open_room(room_id)
    }

    pub fn load_messages(&self, room_id: &str, before_seq: Option<u64>) -> Result<String> {
        self.store.load_messages(room_id, before_seq)
    }

    pub fn load_more_messages(&self, room_id: &str) -> Result<Option<String>> {
        self.store.load_more_messages(room_id)
    }

    pub fn send_message(
        &self,
        room_id: &str,
        content: Option<String>,
        content_kind: ContentKind,
        attachments: Vec<Attachment>,
    ) -> Result<String> {
        self.store
            .send_message(room_id, content, content_kind, attachments)
    }

    pub fn forward_message(
        &self,
        message_ids: &[String],
        target_room_ids: &[String],
        note: Option<&str>,
    ) -> Result<Vec<String>> {
        self.store
            .forward_message(message_ids, target_room_ids, note)
    }

    pub fn delete_message(&self, message_id: &str) -> Result<()> {
        self.store.delete_message(message_id)
    }

    pub fn react_to_message(&self, message_id: &str, emoji: &str) -> Result<()> {
        self.store.react_to_message(message_id, emoji)
    }

    pub fn retry_failed(&self, message_id: &str) -> Result<()> {
        self.store.retry_failed(message_id)
    }

    pub fn discard_failed(&self, message_id: &str) -> Result<()> {
        self.store.discard_failed(message_id)
    }

    pub fn create_room(
        &self,
        name: &str,
        participant_ids: Vec<String>,
        kind: RoomKind,
    ) -> Result<String> {
        self.store.create_room(name, participant_ids, kind)
    }

    pub fn rename_room(&self, room_id: &str, name: &str) -> Result<()> {
        self.store.rename_room(room_id, name)
    }

    pub fn add_members(&self, room_id: &str, user_ids: Vec<String>) -> Result<()> {
        self.store.add_members(room_id, user_ids)
    }

    pub fn remove_member(
        &self,
        room_id: &str,
        user_id: &str,
        transfer_admin_to: Option<String>,
    ) -> Result<()> {
        self.store.remove_member(room_id, user_id, transfer_admin_to)
    }

    // ============= Presence & typing =============

    pub fn set_typing(&self, room_id: &str, is_typing: bool) {
        self.presence.set_typing(room_id, is_typing)
    }

    pub fn typing_users(&self, room_id: &str) -> Vec<String> {
        self.presence.typing_users(room_id)
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        self.presence.is_online(user_id)
    }

    // ============= Calls =============

    pub fn call_user(
        &self,
        room_id: &str,
        peer_ids: Vec<String>,
        call_type: CallType,
        group: bool,
    ) -> Result<String> {
        self.calls.call_user(room_id, peer_ids, call_type, group)
    }

    pub fn accept_call(&self) -> Result<()> {
        self.calls.accept_call()
    }

    pub fn reject_call(&self) -> Result<()> {
        self.calls.reject_call()
    }

    pub fn end_call(&self) -> Result<()> {
        self.calls.end_call()
    }

    pub fn toggle_recording(&self) -> Result<bool> {
        self.calls.toggle_recording()
    }

    pub fn call_state(&self) -> Option<CallSession> {
        self.calls.call_state()
    }
}

/// Route one gateway event to the component owning its category.
fn route(store: &RoomStore, presence: &PresenceTracker, calls: &CallManager, event: ServerEvent) {
    match event {
        ServerEvent::Authenticated { user_id } => {
            store.set_local_user(&user_id);
            calls.set_local_user(&user_id);
        }
        ServerEvent::AuthRejected { reason } => {
            log::warn!("gateway rejected credentials: {}", reason)
        }
        ServerEvent::Typing {
            room_id,
            user_id,
            is_typing,
        } => presence.apply_typing(&room_id, &user_id, is_typing),
        ServerEvent::Message(event) => store.apply_message_event(event),
        ServerEvent::Room(event) => store.apply_room_event(event),
        ServerEvent::Presence(event) => presence.apply_presence(event),
        ServerEvent::Call(event) => calls.apply_call_event(event),
    }
}
