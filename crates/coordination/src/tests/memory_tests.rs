use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use shared::domain::{CallId, CallKind, CallState, RoomId, UserId};

use crate::{CallRecord, CallTransition, CoordinationStore, MemoryStore, PubSubTransport};

const TTL: Duration = Duration::from_secs(90);

fn ringing(call_id: &CallId) -> CallRecord {
    CallRecord {
        call_id: call_id.clone(),
        caller_id: UserId(1),
        callee_id: UserId(2),
        room_id: None,
        kind: CallKind::Voice,
        state: CallState::Ringing,
        started_at: Utc::now(),
        answered_at: None,
    }
}

#[tokio::test]
async fn session_counts_track_add_and_remove() {
    let store = MemoryStore::new();
    let user = UserId(5);
    assert_eq!(store.add_session(user, "a", 1_000, TTL).await.unwrap(), 1);
    assert_eq!(store.add_session(user, "b", 1_000, TTL).await.unwrap(), 2);
    assert_eq!(store.online_users().await.unwrap(), vec![user]);

    assert_eq!(store.remove_session(user, "a").await.unwrap(), Some(1));
    assert_eq!(store.online_users().await.unwrap(), vec![user]);
    assert_eq!(store.remove_session(user, "b").await.unwrap(), Some(0));
    assert!(store.online_users().await.unwrap().is_empty());

    // Removing a handle twice reports that it was already gone.
    assert_eq!(store.remove_session(user, "b").await.unwrap(), None);
}

#[tokio::test]
async fn stale_sessions_are_pruned_on_read() {
    let store = MemoryStore::new();
    let user = UserId(5);
    store.add_session(user, "old", 1_000, TTL).await.unwrap();
    store.add_session(user, "fresh", 5_000, TTL).await.unwrap();

    assert_eq!(
        store.live_sessions(user, 2_000).await.unwrap(),
        vec!["fresh".to_string()]
    );
    assert!(store.touch_session(user, "fresh", 9_000, TTL).await.unwrap());
    assert!(!store.touch_session(user, "old", 9_000, TTL).await.unwrap());

    assert!(store.live_sessions(user, 10_000).await.unwrap().is_empty());
    assert!(store.online_users().await.unwrap().is_empty());
}

#[tokio::test]
async fn sliding_window_counts_only_recent_hits() {
    let store = MemoryStore::new();
    let window = Duration::from_millis(1_000);

    let first = store.record_hit("k", 10_000, window).await.unwrap();
    assert_eq!(first.count, 1);
    assert_eq!(first.oldest_ms, 10_000);

    store.record_hit("k", 10_400, window).await.unwrap();
    let third = store.record_hit("k", 10_900, window).await.unwrap();
    assert_eq!(third.count, 3);
    assert_eq!(third.oldest_ms, 10_000);

    // The first hit sits exactly on the window edge and is dropped.
    let later = store.record_hit("k", 11_000, window).await.unwrap();
    assert_eq!(later.count, 3);
    assert_eq!(later.oldest_ms, 10_400);

    let other = store.record_hit("other", 11_000, window).await.unwrap();
    assert_eq!(other.count, 1);
}

#[tokio::test]
async fn typing_flags_expire_and_clear() {
    let store = MemoryStore::new();
    let room = RoomId(3);
    let ttl = Duration::from_secs(5);
    store.set_typing(room, UserId(1), 1_000, ttl).await.unwrap();
    store.set_typing(room, UserId(2), 3_000, ttl).await.unwrap();

    assert_eq!(
        store.typing_users(room, 4_000).await.unwrap(),
        vec![UserId(1), UserId(2)]
    );
    assert_eq!(store.typing_users(room, 7_000).await.unwrap(), vec![UserId(2)]);

    assert!(store.clear_typing(room, UserId(2)).await.unwrap());
    assert!(!store.clear_typing(room, UserId(2)).await.unwrap());
    assert!(store.typing_users(room, 7_000).await.unwrap().is_empty());
}

#[tokio::test]
async fn busy_marker_is_owned_by_one_call() {
    let store = MemoryStore::new();
    let user = UserId(2);
    let first = CallId::generate();
    let second = CallId::generate();

    assert!(store.claim_busy(user, &first, TTL).await.unwrap());
    assert!(!store.claim_busy(user, &second, TTL).await.unwrap());
    assert_eq!(store.busy_call(user).await.unwrap(), Some(first.clone()));

    assert!(!store.release_busy(user, &second).await.unwrap());
    assert!(store.release_busy(user, &first).await.unwrap());
    assert_eq!(store.busy_call(user).await.unwrap(), None);
    assert!(store.claim_busy(user, &second, TTL).await.unwrap());
}

#[tokio::test]
async fn call_transitions_compare_and_set() {
    let store = MemoryStore::new();
    let call_id = CallId::generate();
    store.put_call(&ringing(&call_id), TTL).await.unwrap();

    match store
        .transition_call(&call_id, &[CallState::Ringing], CallState::Active)
        .await
        .unwrap()
    {
        CallTransition::Applied(record) => assert_eq!(record.state, CallState::Active),
        other => panic!("unexpected {other:?}"),
    }

    assert_eq!(
        store
            .transition_call(&call_id, &[CallState::Ringing], CallState::Missed)
            .await
            .unwrap(),
        CallTransition::Mismatch(CallState::Active)
    );

    store.delete_call(&call_id).await.unwrap();
    assert_eq!(
        store
            .transition_call(&call_id, &[CallState::Active], CallState::Ended)
            .await
            .unwrap(),
        CallTransition::Missing
    );
    assert!(store.get_call(&call_id).await.unwrap().is_none());
}

#[tokio::test]
async fn answering_stamps_the_call_in_one_step() {
    let store = MemoryStore::new();
    let call_id = CallId::generate();
    store
        .put_call(&ringing(&call_id), Duration::from_millis(50))
        .await
        .unwrap();

    let answered_at = Utc::now();
    match store.answer_call(&call_id, answered_at, TTL).await.unwrap() {
        CallTransition::Applied(record) => {
            assert_eq!(record.state, CallState::Active);
            assert_eq!(record.answered_at, Some(answered_at));
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(
        store.answer_call(&call_id, Utc::now(), TTL).await.unwrap(),
        CallTransition::Mismatch(CallState::Active)
    );

    // The answer re-armed the short ringing expiry.
    tokio::time::sleep(Duration::from_millis(80)).await;
    let stored = store.get_call(&call_id).await.unwrap().expect("still live");
    assert_eq!(stored.answered_at, Some(answered_at));

    store.delete_call(&call_id).await.unwrap();
    assert_eq!(
        store.answer_call(&call_id, Utc::now(), TTL).await.unwrap(),
        CallTransition::Missing
    );
}

#[tokio::test]
async fn busy_marker_extension_requires_ownership() {
    let store = MemoryStore::new();
    let user = UserId(3);
    let call = CallId::generate();
    let other = CallId::generate();
    assert!(store
        .claim_busy(user, &call, Duration::from_millis(50))
        .await
        .unwrap());

    assert!(!store.extend_busy(user, &other, TTL).await.unwrap());
    assert!(store.extend_busy(user, &call, TTL).await.unwrap());
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(store.busy_call(user).await.unwrap(), Some(call));
    assert!(!store.extend_busy(UserId(4), &other, TTL).await.unwrap());
}

#[tokio::test]
async fn subscriptions_receive_only_listened_channels() {
    let store = MemoryStore::new();
    let mut first = store.subscribe().await.unwrap();
    let mut second = store.subscribe().await.unwrap();
    first.control.listen("room:7");
    first.control.listen("room:8");
    second.control.listen("room:8");
    first.control.applied().await.unwrap();

    store.publish("user:1", "skip".into()).await.unwrap();
    store.publish("room:7", "hello".into()).await.unwrap();
    store.publish("room:8", "eight".into()).await.unwrap();

    let received = first.messages.next().await.expect("message");
    assert_eq!(received.channel, "room:7");
    assert_eq!(received.payload, "hello");
    assert_eq!(first.messages.next().await.expect("message").channel, "room:8");
    assert_eq!(second.messages.next().await.expect("message").payload, "eight");

    first.control.unlisten("room:7");
    store.publish("room:7", "gone".into()).await.unwrap();
    store.publish("room:8", "still".into()).await.unwrap();
    assert_eq!(first.messages.next().await.expect("message").payload, "still");
}

#[tokio::test]
async fn severing_the_bus_ends_streams_and_rejects_publishes() {
    let store = MemoryStore::new();
    let mut subscription = store.subscribe().await.unwrap();
    subscription.control.listen("room:1");
    store.sever_bus();

    let ended = tokio::time::timeout(Duration::from_secs(1), subscription.messages.next())
        .await
        .expect("stream should end promptly");
    assert!(ended.is_none());
    assert!(store.publish("room:1", "x".into()).await.is_err());
    assert!(store.subscribe().await.is_err());
}
