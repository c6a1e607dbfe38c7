use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use shared::domain::{CallId, CallKind, CallState, MessageId, MessageKind, RoomId, UserId};

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub room_id: RoomId,
    pub sender_id: UserId,
    pub content: String,
    pub kind: MessageKind,
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredMessage {
    pub message_id: MessageId,
    pub room_id: RoomId,
    pub sender_id: UserId,
    pub sender_username: Option<String>,
    pub content: String,
    pub kind: MessageKind,
    pub metadata: Option<Value>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredReceipt {
    pub message_id: MessageId,
    pub user_id: UserId,
    pub delivered_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
}

/// Outcome of a receipt transition. Transitions are monotonic, so repeating
/// one reports `Unchanged` instead of touching the row again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiptUpdate {
    Applied,
    Unchanged,
    Missing,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallLog {
    pub call_id: CallId,
    pub caller_id: UserId,
    pub callee_id: UserId,
    pub room_id: Option<RoomId>,
    pub kind: CallKind,
    pub status: CallState,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_secs: Option<u64>,
}

/// Durable message/room/call persistence consumed by the real-time layer.
/// Every method is atomic at the single-statement level; callers never rely
/// on a transaction spanning two methods.
#[async_trait]
pub trait MessageRepository: Send + Sync {
    async fn create_message(&self, message: NewMessage) -> Result<StoredMessage>;

    async fn get_message_by_id(&self, message_id: MessageId) -> Result<Option<StoredMessage>>;

    async fn create_receipts(&self, message_id: MessageId, recipients: &[UserId]) -> Result<()>;

    async fn mark_delivered(
        &self,
        message_id: MessageId,
        user_id: UserId,
        at: DateTime<Utc>,
    ) -> Result<ReceiptUpdate>;

    /// Sets `read_at`, and `delivered_at` too when it was never set.
    async fn mark_read(
        &self,
        message_id: MessageId,
        user_id: UserId,
        at: DateTime<Utc>,
    ) -> Result<ReceiptUpdate>;

    /// Oldest-first messages whose receipt for `user_id` is still undelivered.
    async fn get_undelivered_for_user(
        &self,
        user_id: UserId,
        limit: u32,
    ) -> Result<Vec<StoredMessage>>;

    async fn get_room_members(&self, room_id: RoomId) -> Result<Vec<UserId>>;

    async fn is_room_member(&self, room_id: RoomId, user_id: UserId) -> Result<bool>;

    async fn rooms_for_user(&self, user_id: UserId) -> Result<Vec<RoomId>>;

    async fn update_last_seen(&self, user_id: UserId, at: DateTime<Utc>) -> Result<()>;

    async fn create_call_log(&self, log: &CallLog) -> Result<()>;

    /// A log that already holds a final status is left alone; returns
    /// whether the update applied.
    async fn update_call_status(
        &self,
        call_id: &CallId,
        status: CallState,
        duration_secs: Option<u64>,
        at: DateTime<Utc>,
    ) -> Result<bool>;

    async fn health_check(&self) -> Result<()>;
}
