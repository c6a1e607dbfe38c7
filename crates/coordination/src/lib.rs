//! Shared coordination substrate for every server instance: ephemeral
//! presence, typing and rate-window state plus the cross-instance pub/sub
//! bus. Two backends implement the same traits: [`RedisStore`] for
//! multi-instance deployments and [`MemoryStore`] for a single process.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use shared::domain::{CallId, CallKind, CallState, RoomId, UserId};
use thiserror::Error;
use tokio::sync::oneshot;

pub mod keys;
mod memory;
mod redis_store;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("coordination store unreachable: {0}")]
    Backend(String),
    #[error("coordination bus disconnected")]
    Disconnected,
    #[error("corrupt coordination record: {0}")]
    Corrupt(String),
}

/// Sliding-window contents right after an attempt was recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowState {
    pub count: usize,
    pub oldest_ms: i64,
}

/// Live call state shared across instances.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallRecord {
    pub call_id: CallId,
    pub caller_id: UserId,
    pub callee_id: UserId,
    pub room_id: Option<RoomId>,
    pub kind: CallKind,
    pub state: CallState,
    pub started_at: DateTime<Utc>,
    pub answered_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallTransition {
    Applied(CallRecord),
    Mismatch(CallState),
    Missing,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub channel: String,
    pub payload: String,
}

/// Ends when the underlying subscription is lost.
pub type BusStream = BoxStream<'static, BusMessage>;

/// Adjusts which channels a live subscription receives. Changes are applied
/// in call order, so a listen and an unlisten of the same channel never
/// overtake each other.
pub trait ChannelControl: Send + Sync {
    fn listen(&self, channel: &str);

    fn unlisten(&self, channel: &str);

    /// Resolves once every change queued before it has taken effect.
    fn applied(&self) -> oneshot::Receiver<()>;
}

/// One instance's subscription: starts with no channels.
pub struct BusSubscription {
    pub control: Arc<dyn ChannelControl>,
    pub messages: BusStream,
}

#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Records a session handle and marks the user online. Returns the
    /// user's session count after the insert.
    async fn add_session(
        &self,
        user_id: UserId,
        handle: &str,
        now_ms: i64,
        ttl: Duration,
    ) -> Result<usize, StoreError>;

    /// Refreshes a handle's liveness timestamp. `false` when it is unknown.
    async fn touch_session(
        &self,
        user_id: UserId,
        handle: &str,
        now_ms: i64,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    /// Removes a handle; the user leaves the online set in the same atomic
    /// step when no handles remain. Returns the remaining count, or `None`
    /// when the handle was already gone.
    async fn remove_session(
        &self,
        user_id: UserId,
        handle: &str,
    ) -> Result<Option<usize>, StoreError>;

    /// Drops handles last refreshed before `stale_before_ms` and returns the
    /// survivors.
    async fn live_sessions(
        &self,
        user_id: UserId,
        stale_before_ms: i64,
    ) -> Result<Vec<String>, StoreError>;

    async fn online_users(&self) -> Result<Vec<UserId>, StoreError>;

    /// Atomically trims entries older than `now_ms - window`, records this
    /// attempt and re-arms the key expiry.
    async fn record_hit(
        &self,
        key: &str,
        now_ms: i64,
        window: Duration,
    ) -> Result<WindowState, StoreError>;

    async fn set_typing(
        &self,
        room_id: RoomId,
        user_id: UserId,
        now_ms: i64,
        ttl: Duration,
    ) -> Result<(), StoreError>;

    /// `true` when a flag was present.
    async fn clear_typing(&self, room_id: RoomId, user_id: UserId) -> Result<bool, StoreError>;

    async fn typing_users(&self, room_id: RoomId, now_ms: i64) -> Result<Vec<UserId>, StoreError>;

    /// Sets the busy marker only if the user holds none.
    async fn claim_busy(
        &self,
        user_id: UserId,
        call_id: &CallId,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    async fn busy_call(&self, user_id: UserId) -> Result<Option<CallId>, StoreError>;

    /// Clears the marker only while it still names `call_id`.
    async fn release_busy(&self, user_id: UserId, call_id: &CallId) -> Result<bool, StoreError>;

    async fn put_call(&self, record: &CallRecord, ttl: Duration) -> Result<(), StoreError>;

    async fn get_call(&self, call_id: &CallId) -> Result<Option<CallRecord>, StoreError>;

    /// Moves the busy marker's expiry to `ttl` from now, only while it still
    /// names `call_id`.
    async fn extend_busy(
        &self,
        user_id: UserId,
        call_id: &CallId,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    /// Compare-and-set on the call state.
    async fn transition_call(
        &self,
        call_id: &CallId,
        expected: &[CallState],
        next: CallState,
    ) -> Result<CallTransition, StoreError>;

    /// `ringing` to `active` in one step, stamping the answer time and
    /// re-arming the record's expiry to `ttl`.
    async fn answer_call(
        &self,
        call_id: &CallId,
        answered_at: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<CallTransition, StoreError>;

    async fn delete_call(&self, call_id: &CallId) -> Result<(), StoreError>;
}

#[async_trait]
pub trait PubSubTransport: Send + Sync {
    async fn publish(&self, channel: &str, payload: String) -> Result<(), StoreError>;

    async fn subscribe(&self) -> Result<BusSubscription, StoreError>;
}

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

#[cfg(test)]
#[path = "tests/memory_tests.rs"]
mod memory_tests;
