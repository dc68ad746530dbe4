//! Call signaling state machine.
//!
//! At most one call session exists system-wide. Phases move
//! `Calling -> Connecting -> Connected` for outgoing calls and
//! `Ringing -> Connecting -> Connected` for incoming ones; any non-idle
//! phase drops straight back to idle on reject, end, timeout, or error.
//! Invites that arrive while a session exists are answered busy without
//! touching local state.

use crate::connection::ConnectionManager;
use crate::error::{Error, Result};
use crate::models::{CallDirection, CallPhase, CallSession, CallType};
use crate::notify::{Notification, NotificationHub};
use crate::protocol::{CallCommand, CallEvent, ClientEvent};
use crate::CoreConfig;
use chrono::Utc;
use log::debug;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use uuid::Uuid;

pub struct CallManager {
    config: Arc<CoreConfig>,
    conn: Arc<ConnectionManager>,
    notify: Arc<NotificationHub>,
    local_user: RwLock<Option<String>>,
    session: Arc<Mutex<Option<CallSession>>>,
    ring_timer: Mutex<Option<JoinHandle<()>>>,
}

impl CallManager {
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
            session: Arc::new(Mutex::new(None)),
            ring_timer: Mutex::new(None),
        })
    }

    pub fn set_local_user(&self, user_id: &str) {
        *self.local_user.write() = Some(user_id.to_string());
    }

    pub fn call_state(&self) -> Option<CallSession> {
        self.session.lock().clone()
    }

    /// Place an outgoing call. Legal only while idle; a second concurrent
    /// call is refused without touching the active session.
    pub fn call_user(
        &self,
        room_id: &str,
        peer_ids: Vec<String>,
        call_type: CallType,
        group: bool,
    ) -> Result<String> {
        let call_id = Uuid::new_v4().to_string();
        {
            let mut session = self.session.lock();
            if session.is_some() {
                return Err(Error::InvalidState("a call is already active".into()));
            }
            let mut peers = Vec::new();
            for peer in &peer_ids {
                if !peers.contains(peer) {
                    peers.push(peer.clone());
                }
            }
            *session = Some(CallSession {
                call_id: call_id.clone(),
                room_id: room_id.to_string(),
                peers,
                call_type,
                direction: CallDirection::Outgoing,
                is_group: group,
                phase: CallPhase::Calling,
                connected_at: None,
                recording: false,
            });
        }
        self.conn.send(ClientEvent::Call(CallCommand::Invite {
            call_id: call_id.clone(),
            room_id: room_id.to_string(),
            peer_ids,
            call_type,
            group,
        }));
        self.emit_state(Some(&call_id), Some(CallPhase::Calling));
        self.arm_ring_timer(call_id.clone());
        Ok(call_id)
    }

    /// Answer the ringing call.
    pub fn accept_call(&self) -> Result<()> {
        let call_id = {
            let mut session = self.session.lock();
            match session.as_mut() {
                Some(s) if s.phase == CallPhase::Ringing => {
                    s.phase = CallPhase::Connecting;
                    s.call_id.clone()
                }
                _ => return Err(Error::InvalidState("no ringing call to accept".into())),
            }
        };
        self.cancel_ring_timer();
        self.conn.send(ClientEvent::Call(CallCommand::Accept {
            call_id: call_id.clone(),
        }));
        self.emit_state(Some(&call_id), Some(CallPhase::Connecting));
        Ok(())
    }

    /// Decline a ringing call, or cancel one we placed that is still
    /// unanswered.
    pub fn reject_call(&self) -> Result<()> {
        let (call_id, phase) = {
            let mut session = self.session.lock();
            match session.as_ref().map(|s| (s.call_id.clone(), s.phase)) {
                Some((call_id, phase))
                    if phase == CallPhase::Ringing || phase == CallPhase::Calling =>
                {
                    *session = None;
                    (call_id, phase)
                }
                _ => {
                    return Err(Error::InvalidState(
                        "no ringing or unanswered call to reject".into(),
                    ))
                }
            }
        };
        self.cancel_ring_timer();
        let command = if phase == CallPhase::Ringing {
            CallCommand::Reject {
                call_id: call_id.clone(),
                busy: false,
            }
        } else {
            CallCommand::End {
                call_id: call_id.clone(),
            }
        };
        self.conn.send(ClientEvent::Call(command));
        self.emit_state(None, None);
        Ok(())
    }

    /// Hang up from any non-idle phase.
    pub fn end_call(&self) -> Result<()> {
        let call_id = {
            let mut session = self.session.lock();
            match session.take() {
                Some(s) => s.call_id,
                None => return Err(Error::InvalidState("no active call".into())),
            }
        };
        self.cancel_ring_timer();
        self.conn
            .send(ClientEvent::Call(CallCommand::End { call_id }));
        self.emit_state(None, None);
        Ok(())
    }

    /// Flip recording on the connected call. Outside `Connected` this is a
    /// reported no-op: an error back to the caller, no state change.
    pub fn toggle_recording(&self) -> Result<bool> {
        let (call_id, enabled) = {
            let mut session = self.session.lock();
            match session.as_mut() {
                Some(s) if s.phase == CallPhase::Connected => {
                    s.recording = !s.recording;
                    (s.call_id.clone(), s.recording)
                }
                _ => {
                    return Err(Error::InvalidState(
                        "recording can only be toggled on a connected call".into(),
                    ))
                }
            }
        };
        self.conn.send(ClientEvent::Call(CallCommand::Recording {
            call_id: call_id.clone(),
            enabled,
        }));
        self.emit_state(Some(&call_id), Some(CallPhase::Connected));
        Ok(enabled)
    }

    pub fn apply_call_event(&self, event: CallEvent) {
        match event {
            CallEvent::Invite {
                call_id,
                room_id,
                from,
                peer_ids,
                call_type,
                group,
            } => {
                {
                    let mut session = self.session.lock();
                    if session.is_some() {
                        drop(session);
                        debug!("busy, auto-rejecting incoming call {}", call_id);
                        self.conn.send(ClientEvent::Call(CallCommand::Reject {
                            call_id,
                            busy: true,
                        }));
                        return;
                    }
                    let local = self.local_user.read().clone();
                    let mut peers = vec![from.clone()];
                    for peer in peer_ids {
                        let is_local = local.as_deref() == Some(peer.as_str());
                        if !is_local && !peers.contains(&peer) {
                            peers.push(peer);
                        }
                    }
                    *session = Some(CallSession {
                        call_id: call_id.clone(),
                        room_id,
                        peers,
                        call_type,
                        direction: CallDirection::Incoming,
                        is_group: group,
                        phase: CallPhase::Ringing,
                        connected_at: None,
                        recording: false,
                    });
                }
                self.emit_state(Some(&call_id), Some(CallPhase::Ringing));
                self.arm_ring_timer(call_id);
            }
            CallEvent::Answered { call_id, .. } => {
                let advanced = {
                    let mut session = self.session.lock();
                    match session.as_mut() {
                        Some(s) if s.call_id == call_id && s.phase == CallPhase::Calling => {
                            s.phase = CallPhase::Connecting;
                            true
                        }
                        _ => false,
                    }
                };
                if advanced {
                    self.cancel_ring_timer();
                    self.emit_state(Some(&call_id), Some(CallPhase::Connecting));
                }
            }
            CallEvent::Rejected { call_id, busy } => {
                let cleared = {
                    let mut session = self.session.lock();
                    let matches = session
                        .as_ref()
                        .map(|s| s.call_id == call_id)
                        .unwrap_or(false);
                    if matches {
                        *session = None;
                    }
                    matches
                };
                if cleared {
                    debug!("call {} rejected (busy: {})", call_id, busy);
                    self.cancel_ring_timer();
                    self.emit_state(None, None);
                }
            }
            CallEvent::Ended { call_id } => {
                // Remote hangup behaves exactly like a local end.
                let cleared = {
                    let mut session = self.session.lock();
                    let matches = session
                        .as_ref()
                        .map(|s| s.call_id == call_id)
                        .unwrap_or(false);
                    if matches {
                        *session = None;
                    }
                    matches
                };
                if cleared {
                    self.cancel_ring_timer();
                    self.emit_state(None, None);
                }
            }
            CallEvent::MediaReady { call_id } => {
                let connected = {
                    let mut session = self.session.lock();
                    match session.as_mut() {
                        Some(s) if s.call_id == call_id && s.phase == CallPhase::Connecting => {
                            s.phase = CallPhase::Connected;
                            s.connected_at = Some(Utc::now().timestamp_millis());
                            true
                        }
                        _ => false,
                    }
                };
                if connected {
                    self.emit_state(Some(&call_id), Some(CallPhase::Connected));
                }
            }
            CallEvent::Recording { call_id, enabled } => {
                let changed = {
                    let mut session = self.session.lock();
                    match session.as_mut() {
                        Some(s)
                            if s.call_id == call_id
                                && s.phase == CallPhase::Connected
                                && s.recording != enabled =>
                        {
                            s.recording = enabled;
                            true
                        }
                        _ => false,
                    }
                };
                if changed {
                    self.emit_state(Some(&call_id), Some(CallPhase::Connected));
                }
            }
        }
    }

    /// Drop the session and its timer without signaling the gateway. Used on
    /// logout/teardown.
    pub fn teardown(&self) {
        self.cancel_ring_timer();
        *self.session.lock() = None;
    }

    fn emit_state(&self, call_id: Option<&str>, phase: Option<CallPhase>) {
        self.notify.emit(Notification::CallStateChanged {
            call_id: call_id.map(|id| id.to_string()),
            phase,
        });
    }

    /// Expire an unanswered call back to idle after the ring window. The
    /// timer is replaced on every new call and cancelled on any transition
    /// out of the pending phases.
    fn arm_ring_timer(&self, call_id: String) {
        self.cancel_ring_timer();
        let session = self.session.clone();
        let conn = self.conn.clone();
        let notify = self.notify.clone();
        let ring_timeout = self.config.ring_timeout;
        let handle = tokio::spawn(async move {
            sleep(ring_timeout).await;
            let expired = {
                let mut session = session.lock();
                let still_pending = session
                    .as_ref()
                    .map(|s| {
                        s.call_id == call_id
                            && (s.phase == CallPhase::Calling || s.phase == CallPhase::Ringing)
                    })
                    .unwrap_or(false);
                if still_pending {
                    session.take()
                } else {
                    None
                }
            };
            if let Some(expired) = expired {
                if expired.direction == CallDirection::Outgoing {
                    // Tell the gateway we gave up ringing the peers.
                    conn.send(ClientEvent::Call(CallCommand::End {
                        call_id: expired.call_id.clone(),
                    }));
                }
                notify.emit(Notification::CallMissed {
                    call_id: expired.call_id,
                    room_id: expired.room_id,
                });
                notify.emit(Notification::CallStateChanged {
                    call_id: None,
                    phase: None,
                });
            }
        });
        *self.ring_timer.lock() = Some(handle);
    }

    fn cancel_ring_timer(&self) {
        if let Some(handle) = self.ring_timer.lock().take() {
            handle.abort();
        }
    }
}
