use std::{net::IpAddr, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use coordination::{now_ms, CoordinationStore, StoreError};
use shared::domain::{ConnectionId, InstanceId, UserId};

use crate::hub::ConnectionSlot;

/// Identity of one admitted connection. Built once at admission and passed
/// by reference to every handler; never mutated. Holds its place under the
/// instance's connection budget until the last clone is dropped.
#[derive(Debug, Clone)]
pub struct Session {
    pub connection_id: ConnectionId,
    pub user_id: UserId,
    pub username: String,
    pub instance_id: InstanceId,
    pub remote_addr: Option<IpAddr>,
    pub connected_at: DateTime<Utc>,
    pub(crate) slot: ConnectionSlot,
}

impl Session {
    /// Key of this session in the user's shared session map.
    pub fn handle(&self) -> String {
        session_handle(&self.instance_id, &self.connection_id)
    }
}

pub fn session_handle(instance_id: &InstanceId, connection_id: &ConnectionId) -> String {
    format!("{instance_id}:{connection_id}")
}

/// Session bookkeeping in the coordination store. Entries carry a liveness
/// timestamp; anything not refreshed within `ttl` is treated as stranded by a
/// crashed instance and pruned on the next read.
#[derive(Clone)]
pub struct SessionRegistry {
    store: Arc<dyn CoordinationStore>,
    ttl: Duration,
}

impl SessionRegistry {
    pub fn new(store: Arc<dyn CoordinationStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    /// Returns the user's session count including this one.
    pub async fn register(&self, session: &Session) -> Result<usize, StoreError> {
        self.store
            .add_session(session.user_id, &session.handle(), now_ms(), self.ttl)
            .await
    }

    pub async fn touch(&self, session: &Session) -> Result<bool, StoreError> {
        self.touch_handle(session.user_id, &session.handle()).await
    }

    pub async fn touch_handle(&self, user_id: UserId, handle: &str) -> Result<bool, StoreError> {
        self.store
            .touch_session(user_id, handle, now_ms(), self.ttl)
            .await
    }

    /// Puts back a handle pruned while its connection stayed open.
    pub async fn restore_handle(&self, user_id: UserId, handle: &str) -> Result<usize, StoreError> {
        self.store
            .add_session(user_id, handle, now_ms(), self.ttl)
            .await
    }

    /// Returns how many sessions the user still holds, or `None` when this
    /// one was already released.
    pub async fn release(&self, session: &Session) -> Result<Option<usize>, StoreError> {
        self.store
            .remove_session(session.user_id, &session.handle())
            .await
    }

    pub async fn live_handles(&self, user_id: UserId) -> Result<Vec<String>, StoreError> {
        let ttl_ms = i64::try_from(self.ttl.as_millis()).unwrap_or(i64::MAX / 2);
        self.store
            .live_sessions(user_id, now_ms() - ttl_ms)
            .await
    }
}
