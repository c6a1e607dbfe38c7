use std::{sync::Arc, time::Duration};

use coordination::MemoryStore;
use shared::{
    domain::{InstanceId, RoomId, UserId},
    protocol::{OutboundFrame, ServerEvent},
};
use storage::Storage;
use tokio::sync::mpsc;

use crate::{config::RealtimeConfig, JwtAuthenticator, Realtime, Session};

pub const SECRET: &str = "test-secret";

pub fn fast_config() -> RealtimeConfig {
    RealtimeConfig {
        typing_ttl: Duration::from_secs(2),
        typing_auto_stop: Duration::from_millis(150),
        replay_batch_delay: Duration::from_millis(5),
        ..RealtimeConfig::default()
    }
}

pub struct Harness {
    pub realtime: Realtime,
    pub storage: Storage,
    pub store: MemoryStore,
    pub auth: JwtAuthenticator,
}

pub struct Client {
    pub session: Session,
    pub rx: mpsc::Receiver<OutboundFrame>,
}

pub async fn harness() -> Harness {
    harness_with(fast_config()).await
}

pub async fn harness_with(config: RealtimeConfig) -> Harness {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let store = MemoryStore::new();
    let auth = JwtAuthenticator::new(SECRET);
    let realtime = Realtime::new(
        config,
        InstanceId::from("test-instance"),
        Arc::new(storage.clone()),
        Arc::new(store.clone()),
        Arc::new(store.clone()),
        auth.clone(),
    );
    realtime.start().await.expect("bus");
    Harness {
        realtime,
        storage,
        store,
        auth,
    }
}

impl Harness {
    pub async fn user(&self, name: &str) -> UserId {
        self.storage.create_user(name).await.expect("user")
    }

    pub async fn room(&self, members: &[UserId]) -> RoomId {
        self.storage.create_room("room", members).await.expect("room")
    }

    pub fn token(&self, user_id: UserId) -> String {
        self.auth.mint(user_id, "user", 600).expect("token")
    }

    /// Admits and attaches a connection, waiting for its offline replay.
    pub async fn connect(&self, user_id: UserId) -> Client {
        let token = self.token(user_id);
        let session = self
            .realtime
            .gatekeeper()
            .admit(Some(&token), None)
            .await
            .expect("admit");
        let (tx, rx) = mpsc::channel(256);
        let attachment = self
            .realtime
            .gatekeeper()
            .attach(&session, tx)
            .await
            .expect("attach");
        attachment.replay.await.expect("replay task");
        Client { session, rx }
    }
}

pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(60)).await;
}

impl Client {
    /// Everything queued so far, after letting in-flight bus traffic land.
    pub async fn drain(&mut self) -> Vec<ServerEvent> {
        settle().await;
        let mut events = Vec::new();
        while let Ok(frame) = self.rx.try_recv() {
            if let OutboundFrame::Event(event) = frame {
                events.push(event);
            }
        }
        events
    }

    pub async fn next_event(&mut self) -> ServerEvent {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(2), self.rx.recv())
                .await
                .expect("event in time")
                .expect("channel open");
            if let OutboundFrame::Event(event) = frame {
                return event;
            }
        }
    }
}
