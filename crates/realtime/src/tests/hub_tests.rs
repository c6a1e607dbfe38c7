use std::sync::Mutex;

use coordination::{MemoryStore, PubSubTransport};
use shared::{domain::InstanceId, protocol::ServerEvent};
use tokio::sync::oneshot;

use super::*;

#[derive(Default)]
struct ChangeLog {
    changes: Mutex<Vec<String>>,
}

impl ChangeLog {
    fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.changes.lock().expect("lock"))
    }
}

impl ChannelControl for ChangeLog {
    fn listen(&self, channel: &str) {
        self.changes.lock().expect("lock").push(format!("+{channel}"));
    }

    fn unlisten(&self, channel: &str) {
        self.changes.lock().expect("lock").push(format!("-{channel}"));
    }

    fn applied(&self) -> oneshot::Receiver<()> {
        let (done, applied) = oneshot::channel();
        let _ = done.send(());
        applied
    }
}

fn typing(room: i64, user: i64) -> ServerEvent {
    ServerEvent::TypingStart {
        room_id: RoomId(room),
        user_id: UserId(user),
    }
}

fn envelope(event: ServerEvent, exclude: Option<ConnectionId>) -> BusEnvelope {
    BusEnvelope {
        origin: InstanceId::from("test"),
        exclude,
        event,
    }
}

#[tokio::test]
async fn routes_room_channels_to_joined_connections_only() {
    let hub = LocalHub::new();
    let (tx_a, mut rx_a) = mpsc::channel(8);
    let (tx_b, mut rx_b) = mpsc::channel(8);
    let a = ConnectionId::from("a");
    let b = ConnectionId::from("b");
    hub.register(a.clone(), UserId(1), tx_a);
    hub.register(b.clone(), UserId(2), tx_b);
    assert!(hub.join(&a, RoomId(7)));

    assert_eq!(hub.deliver("room:7", &envelope(typing(7, 3), None)), 1);
    assert_eq!(rx_a.recv().await, Some(OutboundFrame::Event(typing(7, 3))));
    assert!(rx_b.try_recv().is_err());

    assert!(hub.leave(&a, RoomId(7)));
    assert_eq!(hub.deliver("room:7", &envelope(typing(7, 3), None)), 0);
}

#[tokio::test]
async fn routes_user_channels_to_every_device_except_excluded() {
    let hub = LocalHub::new();
    let (tx_phone, mut rx_phone) = mpsc::channel(8);
    let (tx_laptop, mut rx_laptop) = mpsc::channel(8);
    let phone = ConnectionId::from("phone");
    let laptop = ConnectionId::from("laptop");
    hub.register(phone.clone(), UserId(1), tx_phone);
    hub.register(laptop.clone(), UserId(1), tx_laptop);

    let delivered = hub.deliver("user:1", &envelope(typing(1, 1), Some(phone.clone())));
    assert_eq!(delivered, 1);
    assert!(rx_laptop.recv().await.is_some());
    assert!(rx_phone.try_recv().is_err());

    assert_eq!(hub.deliver("user:2", &envelope(typing(1, 1), None)), 0);
    assert_eq!(hub.deliver("bogus", &envelope(typing(1, 1), None)), 0);
}

#[tokio::test]
async fn unregister_reports_rooms_and_disconnects() {
    let hub = LocalHub::new();
    let (tx, _rx) = mpsc::channel(8);
    let conn = ConnectionId::from("c");
    hub.register(conn.clone(), UserId(1), tx);
    hub.join(&conn, RoomId(2));
    hub.join(&conn, RoomId(1));
    assert_eq!(hub.rooms_of(&conn), vec![RoomId(1), RoomId(2)]);
    assert_eq!(hub.len(), 1);

    let mut rooms = hub.unregister(&conn).expect("registered");
    rooms.sort();
    assert_eq!(rooms, vec![RoomId(1), RoomId(2)]);
    assert!(!hub.is_connected(&conn));
    assert!(hub.is_empty());
    assert!(!hub.send_to(&conn, OutboundFrame::Event(typing(1, 1))));
    assert!(hub.unregister(&conn).is_none());
}

#[tokio::test]
async fn full_queue_drops_instead_of_blocking() {
    let hub = LocalHub::new();
    let (tx, mut rx) = mpsc::channel(1);
    let conn = ConnectionId::from("slow");
    hub.register(conn.clone(), UserId(1), tx);

    assert!(hub.send_to(&conn, OutboundFrame::Event(typing(1, 1))));
    assert!(!hub.send_to(&conn, OutboundFrame::Event(typing(1, 2))));
    assert_eq!(rx.recv().await, Some(OutboundFrame::Event(typing(1, 1))));
}

#[tokio::test]
async fn channels_follow_the_first_and_last_holder() {
    let hub = LocalHub::new();
    let (tx_a, _rx_a) = mpsc::channel(8);
    let (tx_b, _rx_b) = mpsc::channel(8);
    let a = ConnectionId::from("a");
    let b = ConnectionId::from("b");
    hub.register(a.clone(), UserId(1), tx_a);

    let log = Arc::new(ChangeLog::default());
    hub.attach_channels(log.clone());
    assert_eq!(log.take(), vec!["+user:1"]);

    hub.register(b.clone(), UserId(1), tx_b);
    hub.join(&a, RoomId(7));
    hub.join(&b, RoomId(7));
    hub.join(&b, RoomId(7));
    assert_eq!(log.take(), vec!["+room:7"]);
    assert_eq!(hub.channels(), vec!["room:7", "user:1"]);

    assert!(hub.leave(&a, RoomId(7)));
    assert!(log.take().is_empty());
    hub.unregister(&b);
    assert_eq!(log.take(), vec!["-room:7"]);
    hub.unregister(&a);
    assert_eq!(log.take(), vec!["-user:1"]);
    assert!(hub.channels().is_empty());
}

#[tokio::test]
async fn bus_traffic_for_unheld_channels_never_arrives() {
    let store = MemoryStore::new();
    let subscription = store.subscribe().await.expect("subscribe");
    let hub = LocalHub::new();
    hub.attach_channels(subscription.control);
    let (tx, _rx) = mpsc::channel(8);
    let conn = ConnectionId::from("c");
    hub.register(conn.clone(), UserId(1), tx);
    hub.join(&conn, RoomId(7));
    hub.channels_applied().await;

    store.publish("room:8", "other".into()).await.expect("publish");
    store.publish("room:7", "mine".into()).await.expect("publish");
    let mut messages = subscription.messages;
    let first = futures::StreamExt::next(&mut messages).await.expect("message");
    assert_eq!(first.channel, "room:7");
}

#[tokio::test]
async fn reservations_count_against_the_budget_until_dropped() {
    let hub = LocalHub::new();
    let first = hub.reserve(2).expect("first");
    let second = hub.reserve(2).expect("second");
    assert!(hub.reserve(2).is_none());

    drop(second);
    let third = hub.reserve(2).expect("freed by drop");

    let (tx, _rx) = mpsc::channel(8);
    hub.register(first.connection_id().clone(), UserId(1), tx);
    drop(first);
    assert_eq!(hub.len(), 1);
    assert!(hub.reserve(2).is_none());
    drop(third);
    assert!(hub.reserve(2).is_some());
}
