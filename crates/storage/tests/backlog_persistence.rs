use std::sync::Arc;

use chrono::Utc;
use shared::domain::MessageKind;
use storage::{MessageRepository, NewMessage, ReceiptUpdate, Storage};

fn temp_database_url(label: &str) -> (std::path::PathBuf, String) {
    let suffix = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    let root = std::env::temp_dir().join(format!("relay_{label}_{suffix}"));
    let db_path = root.join("relay.db");
    let url = format!("sqlite://{}", db_path.to_string_lossy().replace('\\', "/"));
    (root, url)
}

#[tokio::test]
async fn undelivered_backlog_survives_a_restart_until_delivered() {
    let (root, url) = temp_database_url("backlog");

    let (bob, message_id) = {
        let storage = Storage::new(&url).await.expect("db");
        let alice = storage.create_user("alice").await.expect("alice");
        let bob = storage.create_user("bob").await.expect("bob");
        let room = storage
            .create_room("general", &[alice, bob])
            .await
            .expect("room");
        let repo: Arc<dyn MessageRepository> = Arc::new(storage);
        let message = repo
            .create_message(NewMessage {
                room_id: room,
                sender_id: alice,
                content: "while you were away".into(),
                kind: MessageKind::Text,
                metadata: None,
            })
            .await
            .expect("message");
        repo.create_receipts(message.message_id, &[bob])
            .await
            .expect("receipts");
        (bob, message.message_id)
    };

    let repo: Arc<dyn MessageRepository> = Arc::new(Storage::new(&url).await.expect("reopen"));
    let backlog = repo.get_undelivered_for_user(bob, 50).await.expect("backlog");
    assert_eq!(backlog.len(), 1);
    assert_eq!(backlog[0].message_id, message_id);
    assert_eq!(backlog[0].sender_username.as_deref(), Some("alice"));

    assert_eq!(
        repo.mark_delivered(message_id, bob, Utc::now())
            .await
            .expect("deliver"),
        ReceiptUpdate::Applied
    );
    drop(repo);

    let repo: Arc<dyn MessageRepository> = Arc::new(Storage::new(&url).await.expect("reopen"));
    assert!(repo
        .get_undelivered_for_user(bob, 50)
        .await
        .expect("backlog")
        .is_empty());

    std::fs::remove_dir_all(root).expect("cleanup");
}
