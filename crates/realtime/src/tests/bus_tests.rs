use std::{sync::Mutex, time::Duration};

use coordination::{keys, MemoryStore};
use shared::domain::{RoomId, UserId};

use super::*;

#[derive(Default)]
struct Recorder {
    seen: Mutex<Vec<(String, BusEnvelope)>>,
}

impl BusHandler for Recorder {
    fn handle(&self, channel: &str, envelope: BusEnvelope) {
        self.seen
            .lock()
            .expect("lock")
            .push((channel.to_string(), envelope));
    }
}

impl Recorder {
    fn channels(&self) -> Vec<String> {
        self.seen
            .lock()
            .expect("lock")
            .iter()
            .map(|(channel, _)| channel.clone())
            .collect()
    }
}

fn typing() -> ServerEvent {
    ServerEvent::TypingStop {
        room_id: RoomId(7),
        user_id: UserId(1),
    }
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn events_cross_instances_on_listened_channels_only() {
    let store = MemoryStore::new();
    let first = FanoutBus::new(Arc::new(store.clone()), InstanceId::from("one"));
    let second = FanoutBus::new(Arc::new(store.clone()), InstanceId::from("two"));

    let recorder = Arc::new(Recorder::default());
    let (channels, _listener) = second.subscribe(recorder.clone()).await.expect("subscribe");
    channels.listen(&keys::room_channel(RoomId(7)));

    first.publish("room:8", typing()).await.expect("publish");
    first.publish("room:7", typing()).await.expect("publish");
    settle().await;

    assert_eq!(recorder.channels(), vec!["room:7".to_string()]);
    let seen = recorder.seen.lock().expect("lock");
    assert_eq!(seen[0].1.origin, InstanceId::from("one"));
    assert_eq!(seen[0].1.event, typing());
}

#[tokio::test]
async fn exclusion_travels_with_the_envelope() {
    let store = MemoryStore::new();
    let bus = FanoutBus::new(Arc::new(store), InstanceId::from("one"));
    let recorder = Arc::new(Recorder::default());
    let (channels, _listener) = bus.subscribe(recorder.clone()).await.expect("subscribe");
    channels.listen(&keys::user_channel(UserId(1)));

    bus.publish_excluding("user:1", typing(), Some(ConnectionId::from("c-1")))
        .await
        .expect("publish");
    settle().await;

    let seen = recorder.seen.lock().expect("lock");
    assert_eq!(seen[0].1.exclude, Some(ConnectionId::from("c-1")));
}

#[tokio::test]
async fn losing_the_subscription_marks_bus_unhealthy() {
    let store = MemoryStore::new();
    let bus = FanoutBus::new(Arc::new(store.clone()), InstanceId::from("one"));
    assert!(!bus.is_healthy());

    let (_channels, listener) = bus
        .subscribe(Arc::new(Recorder::default()))
        .await
        .expect("subscribe");
    assert!(bus.is_healthy());

    store.sever_bus();
    tokio::time::timeout(Duration::from_secs(1), listener)
        .await
        .expect("listener exits")
        .expect("join");
    assert!(!bus.is_healthy());
    assert!(bus.publish("room:1", typing()).await.is_err());
}

#[tokio::test]
async fn failed_publish_still_reaches_local_handler() {
    let store = MemoryStore::new();
    let bus = FanoutBus::new(Arc::new(store.clone()), InstanceId::from("one"));
    let recorder = Arc::new(Recorder::default());
    let (_channels, listener) = bus.subscribe(recorder.clone()).await.expect("subscribe");
    store.sever_bus();
    let _ = tokio::time::timeout(Duration::from_secs(1), listener).await;

    assert!(bus.publish("room:7", typing()).await.is_err());
    assert_eq!(recorder.channels(), vec!["room:7".to_string()]);
}
