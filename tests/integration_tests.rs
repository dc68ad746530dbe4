//! Integration tests for the StockDesk realtime core
//!
//! Each test drives the public client API and feeds decoded gateway events
//! through `handle_event`, the same entry point the connection read loop
//! uses.

use parking_lot::Mutex;
use std::sync::Arc;
use stockdesk_core::*;

fn client(user_id: &str) -> StockdeskClient {
    let client = StockdeskClient::new(CoreConfig::default());
    client.handle_event(ServerEvent::Authenticated {
        user_id: user_id.to_string(),
    });
    client
}

fn room(id: &str, members: &[(&str, bool)]) -> Room {
    Room {
        id: id.to_string(),
        name: id.to_string(),
        kind: RoomKind::Group,
        participants: members
            .iter()
            .map(|(user_id, is_admin)| Participant {
                user_id: user_id.to_string(),
                display_name: None,
                role: None,
                online: false,
                is_admin: *is_admin,
            })
            .collect(),
        unread_count: 0,
        last_message: None,
        last_message_time: None,
    }
}

fn server_message(id: &str, room_id: &str, sender: &str, seq: u64) -> Message {
    Message {
        id: id.to_string(),
        room_id: room_id.to_string(),
        sender_id: sender.to_string(),
        content: Some(format!("msg {}", id)),
        content_kind: ContentKind::Plain,
        attachments: Vec::new(),
        reactions: Default::default(),
        forwarded_from: None,
        seq: Some(seq),
        timestamp: seq as i64 * 1000,
        status: MessageStatus::Delivered,
        deleted: false,
    }
}

fn confirmed_ids(client: &StockdeskClient, room_id: &str) -> Vec<String> {
    client
        .messages(room_id)
        .into_iter()
        .filter(|m| m.status != MessageStatus::Failed)
        .map(|m| m.id)
        .collect()
}

#[tokio::test]
async fn rejected_send_rolls_back_to_the_pre_send_sequence() {
    let alice = client("alice");
    alice.seed_rooms(vec![room("general", &[("alice", true), ("bob", false)])]);
    alice.open_room("general").unwrap();
    alice.handle_event(ServerEvent::Message(MessageEvent::New {
        message: server_message("m1", "general", "bob", 1),
    }));
    let before = confirmed_ids(&alice, "general");

    let temp_id = alice
        .send_message("general", Some("hello".into()), ContentKind::Plain, vec![])
        .unwrap();
    alice.handle_event(ServerEvent::Message(MessageEvent::Rejected {
        op_id: temp_id.clone(),
        room_id: "general".into(),
        reason: "rate limited".into(),
    }));

    // Confirmed sequence is exactly what it was before the send; the failed
    // message is still visible for retry or discard.
    assert_eq!(confirmed_ids(&alice, "general"), before);
    let failed = alice
        .messages("general")
        .into_iter()
        .find(|m| m.id == temp_id)
        .unwrap();
    assert_eq!(failed.status, MessageStatus::Failed);

    alice.discard_failed(&temp_id).unwrap();
    assert_eq!(
        alice
            .messages("general")
            .into_iter()
            .map(|m| m.id)
            .collect::<Vec<_>>(),
        before
    );
    alice.shutdown();
}

#[tokio::test]
async fn offline_send_is_queued_and_reconciled_without_duplication() {
    let alice = client("alice");
    alice.seed_rooms(vec![room("general", &[("alice", true), ("bob", false)])]);
    assert!(!alice.is_connected());

    let temp_id = alice
        .send_message("general", Some("restock?".into()), ContentKind::Plain, vec![])
        .unwrap();
    // The send is held for reconnection, never dropped.
    assert_eq!(alice.queued_outbound(), 1);
    assert_eq!(alice.messages("general").len(), 1);
    assert_eq!(alice.messages("general")[0].status, MessageStatus::Pending);

    // After reconnection the gateway acks it with a server id and sequence.
    alice.handle_event(ServerEvent::Message(MessageEvent::Ack {
        temp_id: temp_id.clone(),
        message_id: "srv-9".into(),
        room_id: "general".into(),
        seq: 9,
    }));
    let messages = alice.messages("general");
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].id, "srv-9");
    assert_eq!(messages[0].seq, Some(9));
    assert_eq!(messages[0].status, MessageStatus::Sent);

    // A replay of the same message during catch-up stays a single entry.
    alice.handle_event(ServerEvent::Message(MessageEvent::New {
        message: server_message("srv-9", "general", "alice", 9),
    }));
    assert_eq!(alice.messages("general").len(), 1);
    alice.shutdown();
}

#[tokio::test]
async fn loading_the_same_page_twice_adds_no_duplicates() {
    let alice = client("alice");
    alice.seed_rooms(vec![room("general", &[("alice", false), ("bob", false)])]);

    let first = alice.open_room("general").unwrap();
    let page: Vec<Message> = (1..=4)
        .map(|i| server_message(&format!("m{}", i), "general", "bob", i))
        .collect();
    alice.handle_event(ServerEvent::Message(MessageEvent::History {
        request_id: first,
        room_id: "general".into(),
        messages: page.clone(),
    }));
    assert_eq!(alice.messages("general").len(), 4);
    // A short page means the history is exhausted.
    assert!(!alice.has_more_messages("general"));

    // Force another request anyway and replay the identical page.
    let again = alice.open_room("general").unwrap();
    alice.handle_event(ServerEvent::Message(MessageEvent::History {
        request_id: again,
        room_id: "general".into(),
        messages: page,
    }));
    let ids: Vec<String> = alice
        .messages("general")
        .into_iter()
        .map(|m| m.id)
        .collect();
    assert_eq!(ids, vec!["m1", "m2", "m3", "m4"]);
    alice.shutdown();
}

#[tokio::test]
async fn forwarding_to_two_rooms_leaves_the_original_untouched() {
    let alice = client("alice");
    alice.seed_rooms(vec![
        room("source", &[("alice", false), ("bob", false)]),
        room("target-a", &[("alice", false)]),
        room("target-b", &[("alice", false)]),
    ]);
    alice.open_room("source").unwrap();
    alice.handle_event(ServerEvent::Message(MessageEvent::New {
        message: server_message("orig", "source", "bob", 1),
    }));
    let original = alice.messages("source")[0].clone();

    let temp_ids = alice
        .forward_message(
            &["orig".to_string()],
            &["target-a".to_string(), "target-b".to_string()],
            None,
        )
        .unwrap();
    assert_eq!(temp_ids.len(), 2);

    for target in ["target-a", "target-b"] {
        let messages = alice.messages(target);
        assert_eq!(messages.len(), 1);
        let copy = &messages[0];
        assert_ne!(copy.id, "orig");
        assert_eq!(copy.sender_id, "alice");
        assert_eq!(copy.content, original.content);
        let forwarded = copy.forwarded_from.as_ref().unwrap();
        assert_eq!(forwarded.message_id, "orig");
        assert_eq!(forwarded.room_id, "source");
    }

    // The original never moved and never changed.
    let source = alice.messages("source");
    assert_eq!(source.len(), 1);
    assert_eq!(source[0].id, "orig");
    assert_eq!(source[0].room_id, "source");
    assert!(source[0].forwarded_from.is_none());
    alice.shutdown();
}

#[tokio::test]
async fn forward_note_becomes_one_extra_message_per_target() {
    let alice = client("alice");
    alice.seed_rooms(vec![
        room("source", &[("alice", false), ("bob", false)]),
        room("target-a", &[("alice", false)]),
        room("target-b", &[("alice", false)]),
    ]);
    alice.open_room("source").unwrap();
    alice.handle_event(ServerEvent::Message(MessageEvent::New {
        message: server_message("orig", "source", "bob", 1),
    }));

    alice
        .forward_message(
            &["orig".to_string()],
            &["target-a".to_string(), "target-b".to_string()],
            Some("see bob's count"),
        )
        .unwrap();

    for target in ["target-a", "target-b"] {
        let messages = alice.messages(target);
        assert_eq!(messages.len(), 2);
        assert!(messages[0].forwarded_from.is_some());
        assert_eq!(messages[1].content.as_deref(), Some("see bob's count"));
        assert!(messages[1].forwarded_from.is_none());
    }
    alice.shutdown();
}

#[tokio::test]
async fn full_call_lifecycle_between_two_clients() {
    let alice = client("alice");
    let bob = client("bob");

    // Alice places the call.
    let call_id = alice
        .call_user("room-1", vec!["bob".into()], CallType::Video, false)
        .unwrap();
    assert_eq!(alice.call_state().unwrap().phase, CallPhase::Calling);

    // Bob's client receives the invite and rings.
    bob.handle_event(ServerEvent::Call(CallEvent::Invite {
        call_id: call_id.clone(),
        room_id: "room-1".into(),
        from: "alice".into(),
        peer_ids: vec!["bob".into()],
        call_type: CallType::Video,
        group: false,
    }));
    let ringing = bob.call_state().unwrap();
    assert_eq!(ringing.phase, CallPhase::Ringing);
    assert_eq!(ringing.direction, CallDirection::Incoming);
    assert_eq!(ringing.peers, vec!["alice".to_string()]);

    // Bob answers; Alice hears about it.
    bob.accept_call().unwrap();
    assert_eq!(bob.call_state().unwrap().phase, CallPhase::Connecting);
    alice.handle_event(ServerEvent::Call(CallEvent::Answered {
        call_id: call_id.clone(),
        user_id: Some("bob".into()),
    }));
    assert_eq!(alice.call_state().unwrap().phase, CallPhase::Connecting);

    // Media comes up on both sides.
    alice.handle_event(ServerEvent::Call(CallEvent::MediaReady {
        call_id: call_id.clone(),
    }));
    bob.handle_event(ServerEvent::Call(CallEvent::MediaReady {
        call_id: call_id.clone(),
    }));
    assert_eq!(alice.call_state().unwrap().phase, CallPhase::Connected);
    assert_eq!(bob.call_state().unwrap().phase, CallPhase::Connected);
    assert!(alice.call_state().unwrap().connected_at.is_some());

    // Alice hangs up; both sessions clear.
    alice.end_call().unwrap();
    assert!(alice.call_state().is_none());
    bob.handle_event(ServerEvent::Call(CallEvent::Ended { call_id }));
    assert!(bob.call_state().is_none());

    alice.shutdown();
    bob.shutdown();
}

#[tokio::test]
async fn invite_during_an_active_call_is_busy_rejected_without_state_change() {
    let alice = client("alice");
    let call_id = alice
        .call_user("room-1", vec!["bob".into()], CallType::Audio, false)
        .unwrap();
    let queued_before = alice.queued_outbound();

    alice.handle_event(ServerEvent::Call(CallEvent::Invite {
        call_id: "intruder".into(),
        room_id: "room-2".into(),
        from: "cara".into(),
        peer_ids: vec!["alice".into()],
        call_type: CallType::Audio,
        group: false,
    }));

    let session = alice.call_state().unwrap();
    assert_eq!(session.call_id, call_id);
    assert_eq!(session.phase, CallPhase::Calling);
    // Exactly one busy reject went out.
    assert_eq!(alice.queued_outbound(), queued_before + 1);
    alice.shutdown();
}

#[tokio::test]
async fn notifications_fan_out_per_category() {
    let alice = client("alice");
    alice.seed_rooms(vec![room("general", &[("alice", false), ("bob", false)])]);
    alice.open_room("general").unwrap();

    let message_ids = Arc::new(Mutex::new(Vec::new()));
    let sink = message_ids.clone();
    alice.subscribe(Category::Message, move |n| {
        if let Notification::MessageNew { message_id, .. } = n {
            sink.lock().push(message_id.clone());
        }
    });
    let presence_seen = Arc::new(Mutex::new(Vec::new()));
    let sink = presence_seen.clone();
    alice.subscribe(Category::Presence, move |n| {
        if let Notification::PresenceChanged { user_id, online } = n {
            sink.lock().push((user_id.clone(), *online));
        }
    });

    alice.handle_event(ServerEvent::Message(MessageEvent::New {
        message: server_message("m1", "general", "bob", 1),
    }));
    alice.handle_event(ServerEvent::Presence(PresenceEvent::Online {
        user_id: "bob".into(),
    }));

    assert_eq!(*message_ids.lock(), vec!["m1".to_string()]);
    assert_eq!(*presence_seen.lock(), vec![("bob".to_string(), true)]);
    assert!(alice.is_online("bob"));
    alice.shutdown();
}

#[tokio::test]
async fn unread_counts_track_unfocused_rooms() {
    let alice = client("alice");
    alice.seed_rooms(vec![
        room("general", &[("alice", false), ("bob", false)]),
        room("ops", &[("alice", false), ("bob", false)]),
    ]);
    alice.open_room("general").unwrap();

    alice.handle_event(ServerEvent::Message(MessageEvent::New {
        message: server_message("o1", "ops", "bob", 1),
    }));
    alice.handle_event(ServerEvent::Message(MessageEvent::New {
        message: server_message("g1", "general", "bob", 1),
    }));

    // "ops" was never materialized; only its unread channel moved.
    assert!(alice.messages("ops").is_empty());
    assert_eq!(alice.room("ops").unwrap().unread_count, 1);
    // The focused room materializes and stays read.
    assert_eq!(alice.messages("general").len(), 1);
    assert_eq!(alice.room("general").unwrap().unread_count, 0);

    // Opening the room clears the counter.
    alice.open_room("ops").unwrap();
    assert_eq!(alice.room("ops").unwrap().unread_count, 0);
    alice.shutdown();
}

#[tokio::test]
async fn membership_changes_apply_through_the_wire() {
    let alice = client("alice");
    alice.seed_rooms(vec![room("general", &[("alice", true), ("bob", false)])]);

    alice
        .add_members("general", vec!["cara".into()])
        .unwrap();
    assert!(alice.room("general").unwrap().participant("cara").is_some());

    // Server enriches the optimistic stub with directory data.
    alice.handle_event(ServerEvent::Room(RoomEvent::MembersAdded {
        op_id: None,
        room_id: "general".into(),
        members: vec![Participant {
            user_id: "cara".into(),
            display_name: Some("Cara Ruiz".into()),
            role: Some("buyer".into()),
            online: true,
            is_admin: false,
        }],
    }));
    let cara = alice.room("general").unwrap().participant("cara").cloned().unwrap();
    assert_eq!(cara.display_name.as_deref(), Some("Cara Ruiz"));

    // A remote rename lands idempotently.
    alice.handle_event(ServerEvent::Room(RoomEvent::Renamed {
        op_id: None,
        room_id: "general".into(),
        name: "warehouse".into(),
    }));
    assert_eq!(alice.room("general").unwrap().name, "warehouse");
    alice.shutdown();
}
