//! End-to-end tests: a real hub on a loopback socket, real replicas on real
//! WebSocket connections, verifying the full sync pipeline.

use std::sync::Arc;
use std::time::Duration;

use collabfs::{
    ActivityAction, ActivityPatch, ConnectionState, ControlMessage, Frame, Hub, HubConfig,
    OpKind, Replica, ReplicaConfig, ReplicaEvent, WriteMode,
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;

/// Find a free port for testing.
async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Start a hub on a free port, return (port, hub handle).
async fn start_hub() -> (u16, Arc<Hub>) {
    let port = free_port().await;
    let config = HubConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        broadcast_capacity: 64,
        ..HubConfig::default()
    };
    let hub = Hub::new(config).unwrap();
    tokio::spawn(hub.clone().run());
    // Give the listener time to bind.
    tokio::time::sleep(Duration::from_millis(50)).await;
    (port, hub)
}

fn config_for(port: u16, session: &str, user: &str) -> ReplicaConfig {
    let mut config =
        ReplicaConfig::new(format!("ws://127.0.0.1:{port}"), session).with_user(user);
    config.reconnect_base = Duration::from_millis(50);
    config
}

async fn connect(
    port: u16,
    session: &str,
    user: &str,
) -> (Replica, mpsc::Receiver<ReplicaEvent>) {
    let mut replica = Replica::new(config_for(port, session, user)).unwrap();
    let events = replica.take_event_rx().unwrap();
    replica.connect().await.unwrap();
    (replica, events)
}

/// Poll a condition until it holds or five seconds elapse.
async fn wait_until<F: Fn() -> bool>(what: &str, cond: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn next_event(rx: &mut mpsc::Receiver<ReplicaEvent>) -> ReplicaEvent {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

/// Drain events until one matches the predicate.
async fn wait_for_event<F: Fn(&ReplicaEvent) -> bool>(
    rx: &mut mpsc::Receiver<ReplicaEvent>,
    pred: F,
) -> ReplicaEvent {
    loop {
        let event = next_event(rx).await;
        if pred(&event) {
            return event;
        }
    }
}

#[tokio::test]
async fn test_single_client_write_visible_to_late_joiner() {
    let (port, _hub) = start_hub().await;

    let (alice, mut alice_events) = connect(port, "s1", "A").await;
    wait_for_event(&mut alice_events, |e| matches!(e, ReplicaEvent::Synced)).await;
    alice.write_file("/a.txt", "hello", WriteMode::Overwrite);

    let (bob, mut bob_events) = connect(port, "s1", "B").await;
    wait_for_event(&mut bob_events, |e| matches!(e, ReplicaEvent::Synced)).await;
    wait_until("bob to see /a.txt", || {
        bob.read_file("/a.txt").as_deref() == Some("hello")
    })
    .await;

    let files = bob.list_files(None);
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].0, "/a.txt");
    assert_eq!(files[0].1.size_bytes, 5);
    assert_eq!(files[0].1.last_modified_by, "A");

    let ops = bob.operations();
    assert_eq!(ops.len(), 1);
    assert_eq!(ops[0].kind, OpKind::Create);
    assert_eq!(ops[0].path, "/a.txt");
    assert!(ops[0].success);
}

#[tokio::test]
async fn test_joined_frame_carries_session_stats() {
    let (port, _hub) = start_hub().await;

    let (alice, mut alice_events) = connect(port, "stats", "A").await;
    let joined = wait_for_event(&mut alice_events, |e| {
        matches!(e, ReplicaEvent::Joined { .. })
    })
    .await;
    match joined {
        ReplicaEvent::Joined { stats } => {
            assert_eq!(stats.session_id, "stats");
            assert_eq!(stats.participant_count, 1);
            assert_eq!(stats.file_count, 0);
        }
        _ => unreachable!(),
    }
    drop(alice);
}

#[tokio::test]
async fn test_concurrent_inserts_converge_over_hub() {
    let (port, _hub) = start_hub().await;

    let (alice, mut alice_events) = connect(port, "s2", "A").await;
    let (bob, mut bob_events) = connect(port, "s2", "B").await;
    wait_for_event(&mut alice_events, |e| matches!(e, ReplicaEvent::Synced)).await;
    wait_for_event(&mut bob_events, |e| matches!(e, ReplicaEvent::Synced)).await;

    alice.write_file("/f", "AB", WriteMode::Overwrite);
    wait_until("bob to see AB", || bob.read_file("/f").as_deref() == Some("AB")).await;

    // Both insert at index 1 without waiting for each other.
    alice.insert_text("/f", 1, "X");
    bob.insert_text("/f", 1, "Y");

    wait_until("both replicas to converge on a 4-char merge", || {
        let a = alice.read_file("/f").unwrap_or_default();
        let b = bob.read_file("/f").unwrap_or_default();
        a == b && a.len() == 4
    })
    .await;

    let merged = alice.read_file("/f").unwrap();
    assert!(merged.starts_with('A') && merged.ends_with('B'), "{merged}");
    assert!(merged.contains('X') && merged.contains('Y'), "{merged}");
}

#[tokio::test]
async fn test_three_clients_converge() {
    let (port, _hub) = start_hub().await;

    let (alice, mut ea) = connect(port, "s3", "A").await;
    let (bob, mut eb) = connect(port, "s3", "B").await;
    let (carol, mut ec) = connect(port, "s3", "C").await;
    for events in [&mut ea, &mut eb, &mut ec] {
        wait_for_event(events, |e| matches!(e, ReplicaEvent::Synced)).await;
    }

    alice.write_file("/shared", "from-alice", WriteMode::Overwrite);
    bob.write_file("/bob", "from-bob", WriteMode::Overwrite);

    for replica in [&alice, &bob, &carol] {
        wait_until("replica to hold both files", || {
            replica.read_file("/shared").as_deref() == Some("from-alice")
                && replica.read_file("/bob").as_deref() == Some("from-bob")
        })
        .await;
    }
    assert_eq!(carol.list_files(None).len(), 2);
}

#[tokio::test]
async fn test_structural_ops_audited_on_all_replicas() {
    let (port, _hub) = start_hub().await;

    let (alice, mut ea) = connect(port, "s-move", "A").await;
    let (bob, mut eb) = connect(port, "s-move", "B").await;
    wait_for_event(&mut ea, |e| matches!(e, ReplicaEvent::Synced)).await;
    wait_for_event(&mut eb, |e| matches!(e, ReplicaEvent::Synced)).await;

    alice.write_file("/old", "data", WriteMode::Overwrite);
    wait_until("bob to see /old", || bob.read_file("/old").is_some()).await;

    let move_res = alice.move_file("/old", "/new");
    assert!(move_res.success);
    wait_until("bob to see the move", || {
        bob.read_file("/new").as_deref() == Some("data") && bob.read_file("/old").is_none()
    })
    .await;

    // Bob's delete of the now-missing source fails and is logged.
    let delete_res = bob.delete_file("/old");
    assert!(!delete_res.success);

    wait_until("the failed delete to reach alice's op log", || {
        alice
            .operations()
            .iter()
            .any(|op| op.kind == OpKind::Delete && !op.success)
    })
    .await;

    // Both replicas carry the full audit trail.
    for replica in [&alice, &bob] {
        let ops = replica.operations();
        assert!(ops.iter().any(|op| op.kind == OpKind::Move && op.success));
        assert!(ops.iter().any(|op| op.kind == OpKind::Delete && !op.success));
    }
}

#[tokio::test]
async fn test_reconnect_resync() {
    let (port, _hub) = start_hub().await;

    let (mut alice, mut ea) = connect(port, "s4", "A").await;
    let (bob, mut eb) = connect(port, "s4", "B").await;
    wait_for_event(&mut ea, |e| matches!(e, ReplicaEvent::Synced)).await;
    wait_for_event(&mut eb, |e| matches!(e, ReplicaEvent::Synced)).await;

    alice.write_file("/x", "1", WriteMode::Overwrite);
    wait_until("bob to see /x", || bob.read_file("/x").as_deref() == Some("1")).await;

    alice.disconnect().await;
    assert_eq!(alice.state().await, ConnectionState::Disconnected);

    bob.write_file("/x", "12", WriteMode::Overwrite);

    alice.connect().await.unwrap();
    wait_until("alice to resync /x after reconnect", || {
        alice.read_file("/x").as_deref() == Some("12")
    })
    .await;
}

#[tokio::test]
async fn test_offline_edit_folded_in_on_reconnect() {
    let (port, _hub) = start_hub().await;

    let (mut alice, mut ea) = connect(port, "s-offline", "A").await;
    let (bob, mut eb) = connect(port, "s-offline", "B").await;
    wait_for_event(&mut ea, |e| matches!(e, ReplicaEvent::Synced)).await;
    wait_for_event(&mut eb, |e| matches!(e, ReplicaEvent::Synced)).await;

    alice.disconnect().await;
    alice.write_file("/offline.txt", "made offline", WriteMode::Overwrite);

    alice.connect().await.unwrap();
    wait_until("bob to receive alice's offline edit", || {
        bob.read_file("/offline.txt").as_deref() == Some("made offline")
    })
    .await;
}

#[tokio::test]
async fn test_participant_events() {
    let (port, _hub) = start_hub().await;

    let (_alice, mut ea) = connect(port, "s5", "A").await;
    wait_for_event(&mut ea, |e| matches!(e, ReplicaEvent::Synced)).await;

    let (mut bob, mut eb) = connect(port, "s5", "B").await;
    wait_for_event(&mut eb, |e| matches!(e, ReplicaEvent::Synced)).await;

    let joined = wait_for_event(&mut ea, |e| {
        matches!(e, ReplicaEvent::ParticipantJoined { .. })
    })
    .await;
    match joined {
        ReplicaEvent::ParticipantJoined { user_id } => assert_eq!(user_id, "B"),
        _ => unreachable!(),
    }

    bob.disconnect().await;
    let left = wait_for_event(&mut ea, |e| {
        matches!(e, ReplicaEvent::ParticipantLeft { .. })
    })
    .await;
    match left {
        ReplicaEvent::ParticipantLeft { user_id } => assert_eq!(user_id, "B"),
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn test_activity_update_reaches_peers_both_ways() {
    let (port, _hub) = start_hub().await;

    let (alice, mut ea) = connect(port, "s6", "A").await;
    let (bob, mut eb) = connect(port, "s6", "B").await;
    wait_for_event(&mut ea, |e| matches!(e, ReplicaEvent::Synced)).await;
    wait_for_event(&mut eb, |e| matches!(e, ReplicaEvent::Synced)).await;

    alice.update_activity(ActivityPatch {
        action: ActivityAction::Editing,
        current_file: Some("/a.txt".into()),
    });

    // Immediate presence via the custom frame.
    let event = wait_for_event(&mut eb, |e| {
        matches!(e, ReplicaEvent::ActivityUpdate { .. })
    })
    .await;
    match event {
        ReplicaEvent::ActivityUpdate { user_id, activity } => {
            assert_eq!(user_id, "A");
            assert_eq!(activity.action, ActivityAction::Editing);
            assert_eq!(activity.current_file.as_deref(), Some("/a.txt"));
        }
        _ => unreachable!(),
    }

    // Eventually-equal CRDT representation on the peer's document.
    wait_until("bob's activity container to carry alice's record", || {
        bob.doc()
            .activity_of("A")
            .map(|a| a.action == ActivityAction::Editing)
            .unwrap_or(false)
    })
    .await;
}

#[tokio::test]
async fn test_awareness_relayed_opaque() {
    let (port, _hub) = start_hub().await;

    let (alice, mut ea) = connect(port, "s7", "A").await;
    let (_bob, mut eb) = connect(port, "s7", "B").await;
    wait_for_event(&mut ea, |e| matches!(e, ReplicaEvent::Synced)).await;
    wait_for_event(&mut eb, |e| matches!(e, ReplicaEvent::Synced)).await;

    // Arbitrary bytes: the hub must not interpret them.
    alice.send_awareness(vec![0xDE, 0xAD, 0xBE, 0xEF]);

    let event = wait_for_event(&mut eb, |e| matches!(e, ReplicaEvent::Awareness(_))).await;
    match event {
        ReplicaEvent::Awareness(payload) => assert_eq!(payload, vec![0xDE, 0xAD, 0xBE, 0xEF]),
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn test_malformed_frame_closes_only_sender() {
    let (port, _hub) = start_hub().await;

    let (alice, mut ea) = connect(port, "s8", "A").await;
    wait_for_event(&mut ea, |e| matches!(e, ReplicaEvent::Synced)).await;

    // A rogue connection sends garbage.
    let url = format!("ws://127.0.0.1:{port}");
    let (mut rogue, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    rogue
        .send(Message::Binary(vec![0xFF, 0x00, 0x42].into()))
        .await
        .unwrap();

    // The rogue stream is closed by the hub.
    let closed = timeout(Duration::from_secs(5), async {
        loop {
            match rogue.next().await {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(_)) => break,
                _ => {}
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "hub did not close the rogue stream");

    // Alice is unaffected.
    alice.write_file("/still-alive", "yes", WriteMode::Overwrite);
    let (bob, mut eb) = connect(port, "s8", "B").await;
    wait_for_event(&mut eb, |e| matches!(e, ReplicaEvent::Synced)).await;
    wait_until("bob to sync after the rogue was dropped", || {
        bob.read_file("/still-alive").as_deref() == Some("yes")
    })
    .await;
}

#[tokio::test]
async fn test_sync_before_join_rejected() {
    let (port, _hub) = start_hub().await;

    let url = format!("ws://127.0.0.1:{port}");
    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    let frame = Frame::update(vec![1, 2, 3]).encode().unwrap();
    ws.send(Message::Binary(frame.into())).await.unwrap();

    // The hub answers with an error frame and closes.
    let outcome = timeout(Duration::from_secs(5), async {
        let mut saw_error = false;
        loop {
            match ws.next().await {
                Some(Ok(Message::Binary(data))) => {
                    let bytes: Vec<u8> = data.into();
                    if let Ok(Frame::Control(ControlMessage::Error { .. })) =
                        Frame::decode(&bytes)
                    {
                        saw_error = true;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break saw_error,
                Some(Err(_)) => break saw_error,
                _ => {}
            }
        }
    })
    .await;
    assert_eq!(outcome.unwrap(), true, "expected an error frame before close");
}

#[tokio::test]
async fn test_invalid_session_id_rejected() {
    let (port, _hub) = start_hub().await;

    let mut replica = Replica::new(config_for(port, "../escape", "A")).unwrap();
    let mut events = replica.take_event_rx().unwrap();
    replica.connect().await.unwrap();

    let event = wait_for_event(&mut events, |e| {
        matches!(
            e,
            ReplicaEvent::HubError(_) | ReplicaEvent::Disconnected { .. }
        )
    })
    .await;
    // Either the error frame arrives first or the close beats it; both are
    // acceptable, but no Synced must ever show up.
    match event {
        ReplicaEvent::HubError(_) | ReplicaEvent::Disconnected { .. } => {}
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn test_hub_stats_track_connections() {
    let (port, hub) = start_hub().await;

    let (alice, mut ea) = connect(port, "s9", "A").await;
    wait_for_event(&mut ea, |e| matches!(e, ReplicaEvent::Synced)).await;

    let stats = hub.stats().await;
    assert_eq!(stats.active_connections, 1);
    assert_eq!(stats.active_sessions, 1);
    assert!(stats.total_frames > 0);

    drop(alice);
    wait_until_async_stats(&hub).await;
}

/// Wait for the hub to observe the dropped connection.
async fn wait_until_async_stats(hub: &Arc<Hub>) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if hub.stats().await.active_connections == 0 {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("hub never noticed the closed connection");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
