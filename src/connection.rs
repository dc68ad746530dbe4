//! Gateway connection manager.
//!
//! Owns the single persistent WebSocket to the realtime gateway: the
//! authenticate handshake, the split read/write tasks, reconnection with
//! jittered exponential backoff, and the bounded offline queue for outbound
//! events while the transport is down.

use crate::error::{Error, Result};
use crate::notify::{Notification, NotificationHub};
use crate::protocol::{ClientEvent, ServerEvent};
use crate::CoreConfig;
use futures_util::{SinkExt, StreamExt};
use log::{debug, warn};
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    Disconnected,
    Connecting,
    Connected,
}

struct QueuedEvent {
    event: ClientEvent,
    queued_at: Instant,
}

pub type SendFailureHandler = Box<dyn Fn(&ClientEvent) + Send + Sync>;

pub struct ConnectionManager {
    config: Arc<CoreConfig>,
    state: Mutex<ConnState>,
    token: Mutex<Option<String>>,
    ws_tx: Mutex<Option<mpsc::UnboundedSender<String>>>,
    queue: Mutex<VecDeque<QueuedEvent>>,
    attempts: Mutex<u32>,
    reconnecting: AtomicBool,
    event_tx: mpsc::UnboundedSender<ServerEvent>,
    notify: Arc<NotificationHub>,
    on_send_failure: RwLock<Option<SendFailureHandler>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ConnectionManager {
    pub fn new(
        config: Arc<CoreConfig>,
        event_tx: mpsc::UnboundedSender<ServerEvent>,
        notify: Arc<NotificationHub>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            state: Mutex::new(ConnState::Disconnected),
            token: Mutex::new(None),
            ws_tx: Mutex::new(None),
            queue: Mutex::new(VecDeque::new()),
            attempts: Mutex::new(0),
            reconnecting: AtomicBool::new(false),
            event_tx,
            notify,
            on_send_failure: RwLock::new(None),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Register the callback invoked when an outbound event is dropped or
    /// expires in the offline queue. `send` itself never fails into the
    /// caller.
    pub fn set_send_failure_handler<F>(&self, handler: F)
    where
        F: Fn(&ClientEvent) + Send + Sync + 'static,
    {
        *self.on_send_failure.write() = Some(Box::new(handler));
    }

    pub fn is_connected(&self) -> bool {
        *self.state.lock() == ConnState::Connected
    }

    pub fn queued_len(&self) -> usize {
        self.queue.lock().len()
    }

    /// Establish the transport and run the authenticate handshake. Resets
    /// the reconnect attempt counter; a prior terminal disconnect does not
    /// poison a manual retry.
    pub async fn connect(self: Arc<Self>, token: &str) -> Result<()> {
        *self.token.lock() = Some(token.to_string());
        *self.attempts.lock() = 0;
        self.clone().dial(token.to_string()).await
    }

    async fn dial(self: Arc<Self>, token: String) -> Result<()> {
        *self.state.lock() = ConnState::Connecting;
        let url = Url::parse(&self.config.gateway.ws_url())
            .map_err(|e| Error::Connection(e.to_string()))?;

        let result = self.clone().dial_inner(url, &token).await;
        if result.is_err() {
            *self.state.lock() = ConnState::Disconnected;
        }
        result
    }

    async fn dial_inner(self: Arc<Self>, url: Url, token: &str) -> Result<()> {
        let (mut ws, _) = connect_async(url.as_str())
            .await
            .map_err(|e| Error::Connection(e.to_string()))?;

        // Authenticate before handing the stream to the io tasks. The
        // gateway answers with `authenticated` or `auth_rejected`.
        let auth = ClientEvent::Authenticate {
            token: token.to_string(),
        }
        .encode()?;
        ws.send(WsMessage::Text(auth)).await?;

        let handshake = self.config.handshake_timeout;
        loop {
            match timeout(handshake, ws.next()).await {
                Ok(Some(Ok(WsMessage::Text(text)))) => match ServerEvent::decode(&text) {
                    Ok(ServerEvent::Authenticated { .. }) => break,
                    Ok(ServerEvent::AuthRejected { reason }) => return Err(Error::Auth(reason)),
                    Ok(_) => debug!("ignoring gateway event before authentication"),
                    Err(e) => debug!("undecodable handshake frame: {}", e),
                },
                Ok(Some(Ok(_))) => {}
                Ok(Some(Err(e))) => return Err(Error::Connection(e.to_string())),
                Ok(None) => return Err(Error::TransportInterrupted),
                Err(_) => return Err(Error::Timeout("authentication handshake".into())),
            }
        }

        let (mut write, mut read) = ws.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        *self.ws_tx.lock() = Some(tx);
        *self.state.lock() = ConnState::Connected;
        *self.attempts.lock() = 0;
        self.notify
            .emit(Notification::ConnectionChanged { connected: true });

        // Write task
        let write_task = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if write.send(WsMessage::Text(frame)).await.is_err() {
                    break;
                }
            }
        });

        // Read task; decoded events flow into the single ordered router
        // channel, so handling order matches arrival order.
        let reader = self.clone();
        let read_task = tokio::spawn(async move {
            while let Some(frame) = read.next().await {
                match frame {
                    Ok(WsMessage::Text(text)) => match ServerEvent::decode(&text) {
                        Ok(event) => {
                            if reader.event_tx.send(event).is_err() {
                                break;
                            }
                        }
                        Err(e) => debug!("undecodable gateway frame: {}", e),
                    },
                    Ok(WsMessage::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }
            reader.on_transport_closed();
        });

        {
            let mut tasks = self.tasks.lock();
            tasks.push(write_task);
            tasks.push(read_task);
        }

        self.flush();
        Ok(())
    }

    fn on_transport_closed(self: Arc<Self>) {
        {
            let mut state = self.state.lock();
            if *state == ConnState::Disconnected {
                // Deliberate shutdown, not an unexpected close.
                return;
            }
            *state = ConnState::Disconnected;
        }
        *self.ws_tx.lock() = None;
        warn!("gateway connection lost, scheduling reconnect");
        self.spawn_reconnect();
    }

    fn spawn_reconnect(self: Arc<Self>) {
        if self.reconnecting.swap(true, Ordering::SeqCst) {
            return;
        }
        let mgr = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                let attempt = {
                    let mut attempts = mgr.attempts.lock();
                    let current = *attempts;
                    *attempts += 1;
                    current
                };
                if attempt >= mgr.config.reconnect_max_attempts {
                    warn!("giving up after {} reconnect attempts", attempt);
                    mgr.notify
                        .emit(Notification::ConnectionChanged { connected: false });
                    break;
                }

                let delay = jittered(backoff_delay(
                    attempt,
                    mgr.config.reconnect_base_delay,
                    mgr.config.reconnect_max_delay,
                ));
                debug!("reconnect attempt {} in {:?}", attempt + 1, delay);
                sleep(delay).await;

                let token = match mgr.token.lock().clone() {
                    Some(token) => token,
                    None => break,
                };
                match mgr.clone().dial(token).await {
                    Ok(()) => {
                        debug!("reconnected to gateway");
                        break;
                    }
                    Err(e) => debug!("reconnect attempt {} failed: {}", attempt + 1, e),
                }
            }
            mgr.reconnecting.store(false, Ordering::SeqCst);
        });
        self.tasks.lock().push(handle);
    }

    /// Enqueue an outbound event. Never surfaces transport errors to the
    /// caller; failures are reported through the send-failure handler.
    pub fn send(&self, event: ClientEvent) {
        if *self.state.lock() == ConnState::Connected {
            if let Some(tx) = self.ws_tx.lock().as_ref() {
                match event.encode() {
                    Ok(frame) => {
                        if tx.send(frame).is_ok() {
                            return;
                        }
                    }
                    Err(e) => {
                        warn!("failed to encode outbound event: {}", e);
                        self.report_failure(&event);
                        return;
                    }
                }
            }
            // Writer went away under us; hold the event for the reconnect.
        }
        self.enqueue(event);
    }

    fn enqueue(&self, event: ClientEvent) {
        let mut queue = self.queue.lock();
        queue.push_back(QueuedEvent {
            event,
            queued_at: Instant::now(),
        });
        if queue.len() > self.config.outbound_queue_capacity {
            // Evict the oldest droppable event first. Message and room
            // mutations stay queued; expire_queued bounds their age.
            if let Some(pos) = queue.iter().position(|q| q.event.is_droppable()) {
                queue.remove(pos);
                debug!("offline queue full, dropped oldest droppable event");
            }
        }
    }

    /// Fail queued events older than the send timeout. Droppable events go
    /// silently; anything else is surfaced through the failure handler.
    pub fn expire_queued(&self) {
        let now = Instant::now();
        let cutoff = self.config.send_timeout;
        let mut expired = Vec::new();
        {
            let mut queue = self.queue.lock();
            while queue
                .front()
                .map(|front| now.duration_since(front.queued_at) >= cutoff)
                .unwrap_or(false)
            {
                if let Some(item) = queue.pop_front() {
                    expired.push(item);
                }
            }
        }
        for item in expired {
            if item.event.is_droppable() {
                debug!("expired queued droppable event");
            } else {
                warn!("outbound event expired before reconnect");
                self.report_failure(&item.event);
            }
        }
    }

    fn flush(&self) {
        let drained: Vec<QueuedEvent> = self.queue.lock().drain(..).collect();
        for item in drained {
            self.send(item.event);
        }
    }

    fn report_failure(&self, event: &ClientEvent) {
        if let Some(handler) = self.on_send_failure.read().as_ref() {
            handler(event);
        }
    }

    /// Tear the connection down without triggering reconnection.
    pub fn shutdown(&self) {
        *self.state.lock() = ConnState::Disconnected;
        *self.ws_tx.lock() = None;
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

/// Deterministic half of the backoff policy: base doubling per attempt,
/// capped at the ceiling.
pub(crate) fn backoff_delay(attempt: u32, base: Duration, ceiling: Duration) -> Duration {
    base.checked_mul(1u32 << attempt.min(16))
        .unwrap_or(ceiling)
        .min(ceiling)
}

fn jittered(delay: Duration) -> Duration {
    delay.mul_f64(rand::thread_rng().gen_range(0.5..=1.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MessageCommand;
    use crate::CoreConfig;

    fn test_manager(capacity: usize) -> Arc<ConnectionManager> {
        let mut config = CoreConfig::default();
        config.outbound_queue_capacity = capacity;
        config.send_timeout = Duration::from_secs(5);
        let (event_tx, _event_rx) = mpsc::unbounded_channel();
        let hub = Arc::new(NotificationHub::new());
        ConnectionManager::new(Arc::new(config), event_tx, hub)
    }

    fn message_send(temp_id: &str) -> ClientEvent {
        ClientEvent::Message(MessageCommand::Send {
            temp_id: temp_id.into(),
            room_id: "r1".into(),
            content: Some("hi".into()),
            content_kind: Default::default(),
            attachments: Vec::new(),
            forwarded_from: None,
            timestamp: 0,
        })
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let base = Duration::from_millis(500);
        let cap = Duration::from_secs(30);
        assert_eq!(backoff_delay(0, base, cap), Duration::from_millis(500));
        assert_eq!(backoff_delay(1, base, cap), Duration::from_secs(1));
        assert_eq!(backoff_delay(3, base, cap), Duration::from_secs(4));
        assert_eq!(backoff_delay(10, base, cap), cap);
        assert_eq!(backoff_delay(32, base, cap), cap);
    }

    #[tokio::test]
    async fn queues_sends_while_disconnected() {
        let conn = test_manager(8);
        conn.send(message_send("t1"));
        conn.send(ClientEvent::Heartbeat);
        assert_eq!(conn.queued_len(), 2);
    }

    #[tokio::test]
    async fn overflow_evicts_droppable_events_before_message_sends() {
        let conn = test_manager(2);
        conn.send(ClientEvent::Typing {
            room_id: "r1".into(),
            is_typing: true,
        });
        conn.send(message_send("t1"));
        conn.send(message_send("t2"));
        // Typing ping was the oldest droppable; both sends survive.
        assert_eq!(conn.queued_len(), 2);
        let queue = conn.queue.lock();
        assert!(queue
            .iter()
            .all(|q| matches!(q.event, ClientEvent::Message(_))));
    }

    #[tokio::test]
    async fn overflow_never_drops_message_sends() {
        let conn = test_manager(2);
        conn.send(message_send("t1"));
        conn.send(message_send("t2"));
        conn.send(message_send("t3"));
        assert_eq!(conn.queued_len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_message_sends_reach_the_failure_handler() {
        let conn = test_manager(8);
        let failed: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = failed.clone();
        conn.set_send_failure_handler(move |event| {
            if let ClientEvent::Message(MessageCommand::Send { temp_id, .. }) = event {
                sink.lock().push(temp_id.clone());
            }
        });

        conn.send(message_send("t1"));
        conn.send(ClientEvent::Heartbeat);

        tokio::time::advance(Duration::from_secs(6)).await;
        conn.expire_queued();

        assert_eq!(conn.queued_len(), 0);
        // The heartbeat expired silently; the message send was surfaced.
        assert_eq!(*failed.lock(), vec!["t1".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn unexpired_events_stay_queued() {
        let conn = test_manager(8);
        conn.send(message_send("t1"));
        tokio::time::advance(Duration::from_secs(1)).await;
        conn.expire_queued();
        assert_eq!(conn.queued_len(), 1);
    }
}
