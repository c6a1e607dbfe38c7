use crate::{
    config::RealtimeConfig,
    support::{fast_config, harness, harness_with},
};

use super::*;

fn text(room_id: RoomId, content: &str) -> SendRequest {
    SendRequest {
        room_id,
        content: content.to_string(),
        kind: MessageKind::Text,
        metadata: None,
        temp_id: Some(format!("tmp-{content}")),
    }
}

fn new_messages(events: &[ServerEvent]) -> Vec<MessageId> {
    events
        .iter()
        .filter_map(|event| match event {
            ServerEvent::MessageNew { message } => Some(message.message_id),
            _ => None,
        })
        .collect()
}

fn statuses(events: &[ServerEvent]) -> Vec<(MessageId, ReceiptStatus)> {
    events
        .iter()
        .filter_map(|event| match event {
            ServerEvent::MessageStatus {
                message_id, status, ..
            } => Some((*message_id, *status)),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn send_creates_receipts_for_other_members_and_skips_sender_connection() {
    let h = harness().await;
    let alice = h.user("alice").await;
    let bob = h.user("bob").await;
    let carol = h.user("carol").await;
    let room = h.room(&[alice, bob, carol]).await;
    let mut sender = h.connect(alice).await;
    let mut reader = h.connect(bob).await;
    sender.drain().await;
    reader.drain().await;

    let ack = h
        .realtime
        .delivery()
        .send(&sender.session, text(room, "hello"))
        .await
        .expect("send");
    assert_eq!(ack.temp_id.as_deref(), Some("tmp-hello"));
    assert_eq!(ack.message.sender_id, alice);
    assert_eq!(ack.message.content, "hello");

    let receipts = h
        .storage
        .receipts_for_message(ack.message.message_id)
        .await
        .expect("receipts");
    let mut recipients: Vec<UserId> = receipts.iter().map(|r| r.user_id).collect();
    recipients.sort();
    assert_eq!(recipients, vec![bob, carol]);
    assert!(receipts
        .iter()
        .all(|r| r.delivered_at.is_none() && r.read_at.is_none()));

    assert_eq!(
        new_messages(&reader.drain().await),
        vec![ack.message.message_id]
    );
    assert!(new_messages(&sender.drain().await).is_empty());
}

#[tokio::test]
async fn rejects_invalid_content_and_non_members_without_persisting() {
    let h = harness().await;
    let alice = h.user("alice").await;
    let mallory = h.user("mallory").await;
    let room = h.room(&[alice]).await;
    let outsider = h.connect(mallory).await;
    let member = h.connect(alice).await;
    let delivery = h.realtime.delivery();

    let err = delivery
        .send(&member.session, text(room, "   "))
        .await
        .expect_err("empty");
    assert!(matches!(err, RealtimeError::Validation(_)));

    let long = "x".repeat(h.realtime.config().max_message_chars + 1);
    let err = delivery
        .send(&member.session, text(room, &long))
        .await
        .expect_err("too long");
    assert!(matches!(err, RealtimeError::Validation(_)));

    let err = delivery
        .send(&outsider.session, text(room, "let me in"))
        .await
        .expect_err("non-member");
    assert!(matches!(err, RealtimeError::Authorization(_)));

    assert_eq!(h.storage.count_messages_in_room(room).await.expect("count"), 0);
}

#[tokio::test]
async fn message_over_send_limit_is_rejected_with_retry_hint() {
    let h = harness().await;
    let alice = h.user("alice").await;
    let bob = h.user("bob").await;
    let room = h.room(&[alice, bob]).await;
    let sender = h.connect(alice).await;
    let delivery = h.realtime.delivery();
    let limit = h.realtime.config().send_limit.max;

    for n in 0..limit {
        delivery
            .send(&sender.session, text(room, &format!("m{n}")))
            .await
            .expect("within limit");
    }
    let err = delivery
        .send(&sender.session, text(room, "one too many"))
        .await
        .expect_err("limited");
    let RealtimeError::RateLimited { retry_after_ms } = err else {
        panic!("expected rate limit, got {err:?}");
    };
    assert!(retry_after_ms > 0);
    assert_eq!(
        h.storage.count_messages_in_room(room).await.expect("count"),
        i64::from(limit)
    );
}

#[tokio::test]
async fn read_receipt_implies_delivery_and_reaches_sender() {
    let h = harness().await;
    let alice = h.user("alice").await;
    let bob = h.user("bob").await;
    let room = h.room(&[alice, bob]).await;
    let mut sender = h.connect(alice).await;
    let reader = h.connect(bob).await;
    let delivery = h.realtime.delivery();
    let ack = delivery
        .send(&sender.session, text(room, "hi"))
        .await
        .expect("send");
    let message_id = ack.message.message_id;
    sender.drain().await;

    assert!(delivery
        .mark_read(&reader.session, message_id)
        .await
        .expect("read"));
    assert!(!delivery
        .mark_read(&reader.session, message_id)
        .await
        .expect("read again"));
    assert!(!delivery
        .mark_delivered(&reader.session, message_id)
        .await
        .expect("late delivered"));

    let receipt = h
        .storage
        .receipt(message_id, bob)
        .await
        .expect("load")
        .expect("receipt");
    assert!(receipt.read_at.is_some());
    assert_eq!(receipt.read_at, receipt.delivered_at);
    assert_eq!(
        statuses(&sender.drain().await),
        vec![(message_id, ReceiptStatus::Read)]
    );
}

#[tokio::test]
async fn receipts_for_unknown_messages_or_non_recipients_are_not_found() {
    let h = harness().await;
    let alice = h.user("alice").await;
    let bob = h.user("bob").await;
    let room = h.room(&[alice, bob]).await;
    let sender = h.connect(alice).await;
    let delivery = h.realtime.delivery();
    let ack = delivery
        .send(&sender.session, text(room, "hi"))
        .await
        .expect("send");

    let err = delivery
        .mark_delivered(&sender.session, MessageId(9999))
        .await
        .expect_err("unknown message");
    assert!(matches!(err, RealtimeError::NotFound(_)));
    let err = delivery
        .mark_read(&sender.session, ack.message.message_id)
        .await
        .expect_err("sender has no receipt");
    assert!(matches!(err, RealtimeError::NotFound(_)));
}

#[tokio::test]
async fn reconnect_replays_backlog_in_batches_exactly_once() {
    let h = harness_with(RealtimeConfig {
        replay_batch_size: 2,
        ..fast_config()
    })
    .await;
    let alice = h.user("alice").await;
    let bob = h.user("bob").await;
    let room = h.room(&[alice, bob]).await;
    let mut sender = h.connect(alice).await;

    let mut sent = Vec::new();
    for n in 0..5 {
        let ack = h
            .realtime
            .delivery()
            .send(&sender.session, text(room, &format!("m{n}")))
            .await
            .expect("send");
        sent.push(ack.message.message_id);
    }
    sender.drain().await;

    let mut reader = h.connect(bob).await;
    let events = reader.drain().await;
    let batches: Vec<(u32, Vec<MessageId>)> = events
        .iter()
        .filter_map(|event| match event {
            ServerEvent::MessagesOffline { messages, batch } => Some((
                *batch,
                messages.iter().map(|m| m.message_id).collect(),
            )),
            _ => None,
        })
        .collect();
    assert_eq!(
        batches,
        vec![
            (1, sent[0..2].to_vec()),
            (2, sent[2..4].to_vec()),
            (3, sent[4..5].to_vec()),
        ]
    );
    for message_id in &sent {
        let receipt = h
            .storage
            .receipt(*message_id, bob)
            .await
            .expect("load")
            .expect("receipt");
        assert!(receipt.delivered_at.is_some());
        assert!(receipt.read_at.is_none());
    }
    let delivered: Vec<MessageId> = statuses(&sender.drain().await)
        .into_iter()
        .filter(|(_, status)| *status == ReceiptStatus::Delivered)
        .map(|(id, _)| id)
        .collect();
    assert_eq!(delivered, sent);

    h.realtime.gatekeeper().disconnect(&reader.session).await;
    let mut again = h.connect(bob).await;
    assert!(!again
        .drain()
        .await
        .iter()
        .any(|event| matches!(event, ServerEvent::MessagesOffline { .. })));
}

#[tokio::test]
async fn replay_stops_when_connection_is_gone() {
    let h = harness().await;
    let alice = h.user("alice").await;
    let bob = h.user("bob").await;
    let room = h.room(&[alice, bob]).await;
    let sender = h.connect(alice).await;
    let reader = h.connect(bob).await;
    h.realtime.gatekeeper().disconnect(&reader.session).await;

    let ack = h
        .realtime
        .delivery()
        .send(&sender.session, text(room, "later"))
        .await
        .expect("send");
    let replayed = h
        .realtime
        .delivery()
        .replay_offline(&reader.session)
        .await
        .expect("replay");
    assert_eq!(replayed, 0);
    let receipt = h
        .storage
        .receipt(ack.message.message_id, bob)
        .await
        .expect("load")
        .expect("receipt");
    assert!(receipt.delivered_at.is_none());
}

#[tokio::test]
async fn sending_clears_the_senders_typing_flag() {
    let h = harness().await;
    let alice = h.user("alice").await;
    let bob = h.user("bob").await;
    let room = h.room(&[alice, bob]).await;
    let sender = h.connect(alice).await;
    let mut reader = h.connect(bob).await;
    h.realtime
        .typing()
        .start(&sender.session, room)
        .await
        .expect("typing");
    reader.drain().await;

    h.realtime
        .delivery()
        .send(&sender.session, text(room, "done typing"))
        .await
        .expect("send");
    let events = reader.drain().await;
    assert!(events
        .iter()
        .any(|event| matches!(event, ServerEvent::TypingStop { user_id, .. } if *user_id == alice)));
    assert!(h
        .realtime
        .typing()
        .typing_in(room)
        .await
        .expect("snapshot")
        .is_empty());
}
