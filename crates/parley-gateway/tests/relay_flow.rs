/// End-to-end relay behaviour through the `Dispatcher`, with channel-backed
/// connections and an in-memory SQLite log standing in for sockets and disk.
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::mpsc::UnboundedReceiver;

use parley_db::Database;
use parley_gateway::{
    Appended, ConnectionId, Dispatcher, GatewayError, MessageStore, OutboundMessage, RelayConfig,
    StoreError,
};
use parley_types::events::{ErrorReason, GatewayEvent};
use parley_types::models::{ChatMessage, Identity, Role, RoomKey, UserId};

fn alice() -> Identity {
    Identity::new(UserId::new("A").unwrap(), Role::Initiator)
}

fn bob() -> Identity {
    Identity::new(UserId::new("B").unwrap(), Role::Responder)
}

fn room() -> RoomKey {
    RoomKey::parse("A_B").unwrap()
}

fn draft(from: &Identity, to: &str, body: &str) -> OutboundMessage {
    OutboundMessage {
        id: None,
        room_key: "A_B".into(),
        sender: from.clone(),
        receiver_id: to.into(),
        body: body.into(),
    }
}

fn dispatcher_with(store: Arc<dyn MessageStore>) -> Dispatcher {
    Dispatcher::new(store, RelayConfig::default())
}

fn dispatcher() -> Dispatcher {
    dispatcher_with(Arc::new(Database::open_in_memory().unwrap()))
}

fn drain(rx: &mut UnboundedReceiver<GatewayEvent>) -> Vec<GatewayEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn chat_messages(events: &[GatewayEvent]) -> Vec<&ChatMessage> {
    events
        .iter()
        .filter_map(|e| match e {
            GatewayEvent::ChatMessage(m) => Some(m),
            _ => None,
        })
        .collect()
}

fn notifications(events: &[GatewayEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, GatewayEvent::NotificationDelivered(_)))
        .count()
}

async fn joined(
    dispatcher: &Dispatcher,
    who: Identity,
) -> (ConnectionId, UnboundedReceiver<GatewayEvent>) {
    let (conn, rx) = dispatcher.connect(who).await;
    dispatcher.join_room(conn, "A_B").await.unwrap();
    (conn, rx)
}

#[tokio::test]
async fn hello_then_urgent_scenario() {
    let dispatcher = dispatcher();
    let (a_conn, mut a_rx) = joined(&dispatcher, alice()).await;
    let (b_conn, mut b_rx) = joined(&dispatcher, bob()).await;

    // B is in the room: one chatMessage, none echoed to A
    dispatcher.send_chat(a_conn, draft(&alice(), "B", "hello")).await.unwrap();

    let b_events = drain(&mut b_rx);
    let received = chat_messages(&b_events);
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].sender_id, alice().user_id);
    assert_eq!(received[0].body, "hello");
    assert!(chat_messages(&drain(&mut a_rx)).is_empty());

    // B navigates away: no chatMessage, exactly one notification
    dispatcher.leave_room(b_conn, "A_B").await.unwrap();
    dispatcher.send_chat(a_conn, draft(&alice(), "B", "urgent")).await.unwrap();

    let b_events = drain(&mut b_rx);
    assert!(chat_messages(&b_events).is_empty());
    assert_eq!(notifications(&b_events), 1);
    match &b_events[0] {
        GatewayEvent::NotificationDelivered(n) => {
            assert_eq!(n.sender_id, alice().user_id);
            assert_eq!(n.excerpt, "urgent");
        }
        other => panic!("unexpected event: {other:?}"),
    }

    let history = dispatcher.history(&bob(), &room()).await.unwrap();
    let bodies: Vec<_> = history.iter().map(|m| m.body.as_str()).collect();
    assert_eq!(bodies, vec!["hello", "urgent"]);
}

#[tokio::test]
async fn invalid_messages_have_no_side_effects() {
    let dispatcher = dispatcher();
    let (a_conn, _a_rx) = joined(&dispatcher, alice()).await;
    let (_b_conn, mut b_rx) = joined(&dispatcher, bob()).await;

    let to_self = dispatcher.send_chat(a_conn, draft(&alice(), "A", "me")).await;
    assert!(matches!(to_self, Err(GatewayError::InvalidMessage(_))));

    let outsider = Identity::new(UserId::new("C").unwrap(), Role::Initiator);
    let spoofed = dispatcher.send_chat(a_conn, draft(&outsider, "B", "hi")).await;
    assert!(matches!(spoofed, Err(GatewayError::InvalidMessage(_))));

    assert!(drain(&mut b_rx).is_empty());
    assert!(dispatcher.history(&alice(), &room()).await.unwrap().is_empty());
}

#[tokio::test]
async fn recipients_see_persistence_order() {
    let dispatcher = dispatcher();
    let (a_conn, mut a_rx) = joined(&dispatcher, alice()).await;
    let (b_conn, mut b_rx) = joined(&dispatcher, bob()).await;
    // A passive second device for B observes both sides
    let (_watch_conn, mut watch_rx) = joined(&dispatcher, bob()).await;

    let mut tasks = Vec::new();
    for i in 0..20 {
        let d = dispatcher.clone();
        tasks.push(tokio::spawn(async move {
            if i % 2 == 0 {
                d.send_chat(a_conn, draft(&alice(), "B", &format!("a{i}"))).await
            } else {
                d.send_chat(b_conn, draft(&bob(), "A", &format!("b{i}"))).await
            }
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let persisted: Vec<_> = dispatcher
        .history(&alice(), &room())
        .await
        .unwrap()
        .into_iter()
        .map(|m| m.id)
        .collect();
    assert_eq!(persisted.len(), 20);

    let watched: Vec<_> = chat_messages(&drain(&mut watch_rx))
        .iter()
        .map(|m| m.id)
        .collect();
    assert_eq!(watched, persisted);

    // Each participant sees the counterpart's messages as a subsequence of the log
    let a_seen: Vec<_> = chat_messages(&drain(&mut a_rx)).iter().map(|m| m.id).collect();
    let b_seen: Vec<_> = chat_messages(&drain(&mut b_rx)).iter().map(|m| m.id).collect();
    let subsequence = |seen: &[uuid::Uuid]| {
        let mut log = persisted.iter();
        seen.iter().all(|id| log.any(|p| p == id))
    };
    assert_eq!(a_seen.len(), 10);
    assert_eq!(b_seen.len(), 10);
    assert!(subsequence(&a_seen[..]));
    assert!(subsequence(&b_seen[..]));
}

#[tokio::test]
async fn clearing_a_room_empties_history_and_tells_viewers() {
    let dispatcher = dispatcher();
    let (a_conn, _a_rx) = joined(&dispatcher, alice()).await;
    let (_b_conn, mut b_rx) = joined(&dispatcher, bob()).await;

    dispatcher.send_chat(a_conn, draft(&alice(), "B", "one")).await.unwrap();
    dispatcher.send_chat(a_conn, draft(&alice(), "B", "two")).await.unwrap();
    drain(&mut b_rx);

    assert_eq!(dispatcher.clear_room(&alice(), &room()).await.unwrap(), 2);
    assert!(dispatcher.history(&bob(), &room()).await.unwrap().is_empty());

    let events = drain(&mut b_rx);
    assert!(matches!(
        events.as_slice(),
        [GatewayEvent::RoomCleared { cleared_by, .. }] if *cleared_by == alice().user_id
    ));

    let outsider = Identity::new(UserId::new("C").unwrap(), Role::Responder);
    assert!(matches!(
        dispatcher.clear_room(&outsider, &room()).await,
        Err(GatewayError::Forbidden(_))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn clear_racing_sends_keeps_history_and_live_view_in_step() {
    let dispatcher = dispatcher();
    let (a_conn, _a_rx) = joined(&dispatcher, alice()).await;
    let (_watch_conn, mut watch_rx) = joined(&dispatcher, bob()).await;

    let mut sends = Vec::new();
    for i in 0..10 {
        let d = dispatcher.clone();
        sends.push(tokio::spawn(async move {
            d.send_chat(a_conn, draft(&alice(), "B", &format!("m{i}"))).await
        }));
    }
    let d = dispatcher.clone();
    let clear = tokio::spawn(async move { d.clear_room(&bob(), &room()).await });

    for send in sends {
        send.await.unwrap().unwrap();
    }
    let deleted = clear.await.unwrap().unwrap();

    let events = drain(&mut watch_rx);
    let cleared_at = events
        .iter()
        .position(|e| matches!(e, GatewayEvent::RoomCleared { .. }))
        .expect("viewer was told about the clear");
    let before = chat_messages(&events[..cleared_at]);
    let after: Vec<_> = chat_messages(&events[cleared_at + 1..])
        .iter()
        .map(|m| m.id)
        .collect();

    // Everything relayed before the clear is gone, everything after it is the log
    assert_eq!(before.len(), deleted);
    assert_eq!(before.len() + after.len(), 10);
    let history: Vec<_> = dispatcher
        .history(&bob(), &room())
        .await
        .unwrap()
        .into_iter()
        .map(|m| m.id)
        .collect();
    assert_eq!(history, after);
}

#[tokio::test]
async fn reversed_room_key_is_the_same_room() {
    let dispatcher = dispatcher();
    let (_b_conn, mut b_rx) = joined(&dispatcher, bob()).await;

    let (a_conn, _a_rx) = dispatcher.connect(alice()).await;
    let key = dispatcher.join_room(a_conn, "B_A").await.unwrap();
    assert_eq!(key, room());
    assert_eq!(dispatcher.subscriber_count(&room()).await, 2);

    let mut reversed = draft(&alice(), "B", "hello");
    reversed.room_key = "B_A".into();
    let message = dispatcher.send_chat(a_conn, reversed).await.unwrap();
    assert_eq!(message.room_key.as_str(), "A_B");

    assert_eq!(chat_messages(&drain(&mut b_rx)).len(), 1);
    let history = dispatcher.history(&bob(), &room()).await.unwrap();
    assert_eq!(history.len(), 1);
    let reversed_key = RoomKey::parse("B_A").unwrap();
    assert_eq!(dispatcher.history(&bob(), &reversed_key).await.unwrap(), history);
}

#[tokio::test]
async fn notification_to_offline_user_is_silent() {
    let dispatcher = dispatcher();
    let (a_conn, _a_rx) = dispatcher.connect(alice()).await;

    // B has never connected; the send still succeeds
    let message = dispatcher
        .send_chat(a_conn, draft(&alice(), "B", "anyone?"))
        .await
        .unwrap();
    assert_eq!(message.receiver_role, Role::Responder);
    assert_eq!(dispatcher.notify(&alice(), "B", "ping").await.unwrap(), 0);
}

#[tokio::test]
async fn second_device_of_sender_gets_the_message() {
    let dispatcher = dispatcher();
    let (a_phone, mut phone_rx) = joined(&dispatcher, alice()).await;
    let (_a_laptop, mut laptop_rx) = joined(&dispatcher, alice()).await;

    dispatcher.send_chat(a_phone, draft(&alice(), "B", "from phone")).await.unwrap();

    assert!(chat_messages(&drain(&mut phone_rx)).is_empty());
    assert_eq!(chat_messages(&drain(&mut laptop_rx)).len(), 1);
}

#[tokio::test]
async fn join_requires_participation() {
    let dispatcher = dispatcher();
    let outsider = Identity::new(UserId::new("C").unwrap(), Role::Initiator);
    let (conn, _rx) = dispatcher.connect(outsider).await;

    let err = dispatcher.join_room(conn, "A_B").await.unwrap_err();
    assert_eq!(err.reason(), ErrorReason::Forbidden);
    assert_eq!(dispatcher.subscriber_count(&room()).await, 0);

    let err = dispatcher.join_room(conn, "not-a-room").await.unwrap_err();
    assert_eq!(err.reason(), ErrorReason::InvalidMessage);
}

#[tokio::test]
async fn disconnect_releases_membership() {
    let dispatcher = dispatcher();
    let (a_conn, _a_rx) = joined(&dispatcher, alice()).await;
    let (b_conn, mut b_rx) = joined(&dispatcher, bob()).await;

    assert_eq!(dispatcher.disconnect(b_conn).await, Some(bob()));
    assert!(!dispatcher.is_connected(b_conn).await);
    assert_eq!(dispatcher.subscriber_count(&room()).await, 1);
    assert!(dispatcher.connections_of(&bob().user_id).await.is_empty());

    dispatcher.send_chat(a_conn, draft(&alice(), "B", "gone?")).await.unwrap();
    // Receiver side was closed by unbind
    assert!(drain(&mut b_rx).is_empty());
    assert_eq!(dispatcher.disconnect(b_conn).await, None);
}

/// Store that refuses every write.
struct BrokenStore;

impl MessageStore for BrokenStore {
    fn append_message(&self, _message: &ChatMessage) -> Result<Appended, StoreError> {
        Err(StoreError::Backend("disk full".into()))
    }

    fn fetch_messages(&self, _room_key: &RoomKey) -> Result<Vec<ChatMessage>, StoreError> {
        Ok(Vec::new())
    }

    fn delete_room_messages(&self, _room_key: &RoomKey) -> Result<usize, StoreError> {
        Err(StoreError::Backend("disk full".into()))
    }
}

#[tokio::test]
async fn persistence_failure_broadcasts_nothing() {
    let dispatcher = dispatcher_with(Arc::new(BrokenStore));
    let (a_conn, _a_rx) = joined(&dispatcher, alice()).await;
    let (_b_conn, mut b_rx) = joined(&dispatcher, bob()).await;

    let err = dispatcher
        .send_chat(a_conn, draft(&alice(), "B", "lost"))
        .await
        .unwrap_err();
    assert_eq!(err.reason(), ErrorReason::PersistenceFailure);

    // Neither the room broadcast nor the notification went out
    assert!(drain(&mut b_rx).is_empty());

    let err = dispatcher.clear_room(&bob(), &room()).await.unwrap_err();
    assert_eq!(err.reason(), ErrorReason::PersistenceFailure);
    assert!(drain(&mut b_rx).is_empty());
}

/// Store whose writes hang until released.
struct SlowStore {
    inner: Database,
    released: AtomicBool,
}

impl MessageStore for SlowStore {
    fn append_message(&self, message: &ChatMessage) -> Result<Appended, StoreError> {
        while !self.released.load(Ordering::Acquire) {
            std::thread::sleep(Duration::from_millis(5));
        }
        self.inner.append_message(message)
    }

    fn fetch_messages(&self, room_key: &RoomKey) -> Result<Vec<ChatMessage>, StoreError> {
        self.inner.fetch_messages(room_key)
    }

    fn delete_room_messages(&self, room_key: &RoomKey) -> Result<usize, StoreError> {
        MessageStore::delete_room_messages(&self.inner, room_key)
    }
}

#[tokio::test]
async fn persist_timeout_surfaces_as_persistence_failure() {
    let store = Arc::new(SlowStore {
        inner: Database::open_in_memory().unwrap(),
        released: AtomicBool::new(false),
    });
    let dispatcher = Dispatcher::new(
        store.clone(),
        RelayConfig {
            persist_timeout: Some(Duration::from_millis(50)),
            ..RelayConfig::default()
        },
    );
    let (a_conn, _a_rx) = joined(&dispatcher, alice()).await;
    let (_b_conn, mut b_rx) = joined(&dispatcher, bob()).await;

    let err = dispatcher
        .send_chat(a_conn, draft(&alice(), "B", "slow"))
        .await
        .unwrap_err();
    assert_eq!(err.reason(), ErrorReason::PersistenceFailure);
    assert!(drain(&mut b_rx).is_empty());

    store.released.store(true, Ordering::Release);
}

#[tokio::test]
async fn retry_after_timeout_keeps_one_copy() {
    let store = Arc::new(SlowStore {
        inner: Database::open_in_memory().unwrap(),
        released: AtomicBool::new(false),
    });
    let dispatcher = Dispatcher::new(
        store.clone(),
        RelayConfig {
            persist_timeout: Some(Duration::from_millis(50)),
            ..RelayConfig::default()
        },
    );
    let (a_conn, _a_rx) = joined(&dispatcher, alice()).await;
    let (b_conn, mut b_rx) = joined(&dispatcher, bob()).await;

    let id = uuid::Uuid::new_v4();
    let mut first = draft(&alice(), "B", "are you there?");
    first.id = Some(id);
    let err = dispatcher.send_chat(a_conn, first.clone()).await.unwrap_err();
    assert_eq!(err.reason(), ErrorReason::PersistenceFailure);

    // The timed-out write still lands in the background
    store.released.store(true, Ordering::Release);
    let mut landed = false;
    for _ in 0..200 {
        if dispatcher.history(&alice(), &room()).await.unwrap().len() == 1 {
            landed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(landed);
    assert!(drain(&mut b_rx).is_empty());

    let message = dispatcher.send_chat(a_conn, first).await.unwrap();
    assert_eq!(message.id, id);
    assert_eq!(dispatcher.history(&alice(), &room()).await.unwrap().len(), 1);
    assert_eq!(chat_messages(&drain(&mut b_rx)).len(), 1);

    // Same id, different send
    let mut stolen = draft(&bob(), "A", "mine now");
    stolen.id = Some(id);
    let err = dispatcher.send_chat(b_conn, stolen).await.unwrap_err();
    assert_eq!(err.reason(), ErrorReason::InvalidMessage);
    assert_eq!(dispatcher.history(&alice(), &room()).await.unwrap().len(), 1);
}
