use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use shared::domain::{CallId, CallKind, CallState, MessageId, MessageKind, RoomId, UserId};

mod repository;

pub use repository::{
    CallLog, MessageRepository, NewMessage, ReceiptUpdate, StoredMessage, StoredReceipt,
};

const MESSAGE_COLUMNS: &str = "m.id, m.room_id, m.sender_user_id, u.username, m.content, m.kind, m.metadata, m.created_at";

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true);
        // Each in-memory connection is a separate database.
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn create_user(&self, username: &str) -> Result<UserId> {
        let rec = sqlx::query(
            "INSERT INTO users (username) VALUES (?)
             ON CONFLICT(username) DO UPDATE SET username=excluded.username
             RETURNING id",
        )
        .bind(username)
        .fetch_one(&self.pool)
        .await?;
        Ok(UserId(rec.get::<i64, _>(0)))
    }

    pub async fn username_for_user(&self, user_id: UserId) -> Result<Option<String>> {
        let row = sqlx::query("SELECT username FROM users WHERE id = ?")
            .bind(user_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<String, _>(0)))
    }

    pub async fn last_seen(&self, user_id: UserId) -> Result<Option<DateTime<Utc>>> {
        let row = sqlx::query("SELECT last_seen_at FROM users WHERE id = ?")
            .bind(user_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.and_then(|r| r.get::<Option<DateTime<Utc>>, _>(0)))
    }

    /// Creates a room and enrols `members` in it.
    pub async fn create_room(&self, name: &str, members: &[UserId]) -> Result<RoomId> {
        let rec = sqlx::query("INSERT INTO rooms (name) VALUES (?) RETURNING id")
            .bind(name)
            .fetch_one(&self.pool)
            .await?;
        let room_id = RoomId(rec.get::<i64, _>(0));
        for member in members {
            self.add_room_member(room_id, *member).await?;
        }
        Ok(room_id)
    }

    pub async fn add_room_member(&self, room_id: RoomId, user_id: UserId) -> Result<()> {
        sqlx::query(
            "INSERT INTO room_members (room_id, user_id) VALUES (?, ?)
             ON CONFLICT(room_id, user_id) DO NOTHING",
        )
        .bind(room_id.0)
        .bind(user_id.0)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn receipt(
        &self,
        message_id: MessageId,
        user_id: UserId,
    ) -> Result<Option<StoredReceipt>> {
        let row = sqlx::query(
            "SELECT delivered_at, read_at FROM receipts WHERE message_id = ? AND user_id = ?",
        )
        .bind(message_id.0)
        .bind(user_id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| StoredReceipt {
            message_id,
            user_id,
            delivered_at: r.get::<Option<DateTime<Utc>>, _>(0),
            read_at: r.get::<Option<DateTime<Utc>>, _>(1),
        }))
    }

    pub async fn receipts_for_message(&self, message_id: MessageId) -> Result<Vec<StoredReceipt>> {
        let rows = sqlx::query(
            "SELECT user_id, delivered_at, read_at FROM receipts WHERE message_id = ? ORDER BY user_id",
        )
        .bind(message_id.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| StoredReceipt {
                message_id,
                user_id: UserId(r.get::<i64, _>(0)),
                delivered_at: r.get::<Option<DateTime<Utc>>, _>(1),
                read_at: r.get::<Option<DateTime<Utc>>, _>(2),
            })
            .collect())
    }

    pub async fn count_messages_in_room(&self, room_id: RoomId) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages WHERE room_id = ?")
            .bind(room_id.0)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn call_log(&self, call_id: &CallId) -> Result<Option<CallLog>> {
        let row = sqlx::query(
            "SELECT caller_id, callee_id, room_id, kind, status, started_at, ended_at, duration_secs
             FROM call_logs WHERE call_id = ?",
        )
        .bind(call_id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| -> Result<CallLog> {
            let status = r.get::<String, _>(4);
            Ok(CallLog {
                call_id: call_id.clone(),
                caller_id: UserId(r.get::<i64, _>(0)),
                callee_id: UserId(r.get::<i64, _>(1)),
                room_id: r.get::<Option<i64>, _>(2).map(RoomId),
                kind: CallKind::parse(&r.get::<String, _>(3)),
                status: CallState::parse(&status)
                    .with_context(|| format!("unknown call status '{status}'"))?,
                started_at: r.get::<DateTime<Utc>, _>(5),
                ended_at: r.get::<Option<DateTime<Utc>>, _>(6),
                duration_secs: r
                    .get::<Option<i64>, _>(7)
                    .map(|d| u64::try_from(d).unwrap_or_default()),
            })
        })
        .transpose()
    }

    async fn receipt_exists(&self, message_id: MessageId, user_id: UserId) -> Result<bool> {
        let found: Option<i64> =
            sqlx::query_scalar("SELECT 1 FROM receipts WHERE message_id = ? AND user_id = ?")
                .bind(message_id.0)
                .bind(user_id.0)
                .fetch_optional(&self.pool)
                .await?;
        Ok(found.is_some())
    }

    async fn receipt_outcome(
        &self,
        rows_affected: u64,
        message_id: MessageId,
        user_id: UserId,
    ) -> Result<ReceiptUpdate> {
        if rows_affected > 0 {
            return Ok(ReceiptUpdate::Applied);
        }
        if self.receipt_exists(message_id, user_id).await? {
            Ok(ReceiptUpdate::Unchanged)
        } else {
            Ok(ReceiptUpdate::Missing)
        }
    }
}

fn message_from_row(r: &SqliteRow) -> Result<StoredMessage> {
    let metadata = r
        .get::<Option<String>, _>(6)
        .map(|raw| serde_json::from_str(&raw))
        .transpose()
        .context("stored message metadata is not valid json")?;
    Ok(StoredMessage {
        message_id: MessageId(r.get::<i64, _>(0)),
        room_id: RoomId(r.get::<i64, _>(1)),
        sender_id: UserId(r.get::<i64, _>(2)),
        sender_username: r.get::<Option<String>, _>(3),
        content: r.get::<String, _>(4),
        kind: MessageKind::parse(&r.get::<String, _>(5)),
        metadata,
        created_at: r.get::<DateTime<Utc>, _>(7),
    })
}

#[async_trait]
impl MessageRepository for Storage {
    async fn create_message(&self, message: NewMessage) -> Result<StoredMessage> {
        let metadata = message
            .metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let rec = sqlx::query(
            "INSERT INTO messages (room_id, sender_user_id, content, kind, metadata, created_at)
             VALUES (?, ?, ?, ?, ?, ?) RETURNING id",
        )
        .bind(message.room_id.0)
        .bind(message.sender_id.0)
        .bind(&message.content)
        .bind(message.kind.as_str())
        .bind(metadata)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await
        .context("failed to insert message")?;
        let message_id = MessageId(rec.get::<i64, _>(0));
        self.get_message_by_id(message_id)
            .await?
            .with_context(|| format!("message {message_id} vanished after insert"))
    }

    async fn get_message_by_id(&self, message_id: MessageId) -> Result<Option<StoredMessage>> {
        let row = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS}
             FROM messages m
             LEFT JOIN users u ON u.id = m.sender_user_id
             WHERE m.id = ?"
        ))
        .bind(message_id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(message_from_row).transpose()
    }

    async fn create_receipts(&self, message_id: MessageId, recipients: &[UserId]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for recipient in recipients {
            sqlx::query(
                "INSERT INTO receipts (message_id, user_id) VALUES (?, ?)
                 ON CONFLICT(message_id, user_id) DO NOTHING",
            )
            .bind(message_id.0)
            .bind(recipient.0)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("failed to create receipt for user {recipient}"))?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn mark_delivered(
        &self,
        message_id: MessageId,
        user_id: UserId,
        at: DateTime<Utc>,
    ) -> Result<ReceiptUpdate> {
        let result = sqlx::query(
            "UPDATE receipts SET delivered_at = ?
             WHERE message_id = ? AND user_id = ? AND delivered_at IS NULL",
        )
        .bind(at)
        .bind(message_id.0)
        .bind(user_id.0)
        .execute(&self.pool)
        .await?;
        self.receipt_outcome(result.rows_affected(), message_id, user_id)
            .await
    }

    async fn mark_read(
        &self,
        message_id: MessageId,
        user_id: UserId,
        at: DateTime<Utc>,
    ) -> Result<ReceiptUpdate> {
        let result = sqlx::query(
            "UPDATE receipts SET read_at = ?, delivered_at = COALESCE(delivered_at, ?)
             WHERE message_id = ? AND user_id = ? AND read_at IS NULL",
        )
        .bind(at)
        .bind(at)
        .bind(message_id.0)
        .bind(user_id.0)
        .execute(&self.pool)
        .await?;
        self.receipt_outcome(result.rows_affected(), message_id, user_id)
            .await
    }

    async fn get_undelivered_for_user(
        &self,
        user_id: UserId,
        limit: u32,
    ) -> Result<Vec<StoredMessage>> {
        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS}
             FROM receipts r
             INNER JOIN messages m ON m.id = r.message_id
             LEFT JOIN users u ON u.id = m.sender_user_id
             WHERE r.user_id = ? AND r.delivered_at IS NULL
             ORDER BY m.created_at ASC, m.id ASC
             LIMIT ?"
        ))
        .bind(user_id.0)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(message_from_row).collect()
    }

    async fn get_room_members(&self, room_id: RoomId) -> Result<Vec<UserId>> {
        let rows = sqlx::query("SELECT user_id FROM room_members WHERE room_id = ? ORDER BY user_id")
            .bind(room_id.0)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|r| UserId(r.get::<i64, _>(0)))
            .collect())
    }

    async fn is_room_member(&self, room_id: RoomId, user_id: UserId) -> Result<bool> {
        let found: Option<i64> =
            sqlx::query_scalar("SELECT 1 FROM room_members WHERE room_id = ? AND user_id = ?")
                .bind(room_id.0)
                .bind(user_id.0)
                .fetch_optional(&self.pool)
                .await?;
        Ok(found.is_some())
    }

    async fn rooms_for_user(&self, user_id: UserId) -> Result<Vec<RoomId>> {
        let rows = sqlx::query("SELECT room_id FROM room_members WHERE user_id = ? ORDER BY room_id")
            .bind(user_id.0)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|r| RoomId(r.get::<i64, _>(0)))
            .collect())
    }

    async fn update_last_seen(&self, user_id: UserId, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE users SET last_seen_at = ? WHERE id = ?")
            .bind(at)
            .bind(user_id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn create_call_log(&self, log: &CallLog) -> Result<()> {
        sqlx::query(
            "INSERT INTO call_logs (call_id, caller_id, callee_id, room_id, kind, status, started_at, ended_at, duration_secs)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(log.call_id.as_str())
        .bind(log.caller_id.0)
        .bind(log.callee_id.0)
        .bind(log.room_id.map(|r| r.0))
        .bind(log.kind.as_str())
        .bind(log.status.as_str())
        .bind(log.started_at)
        .bind(log.ended_at)
        .bind(log.duration_secs.map(|d| i64::try_from(d).unwrap_or(i64::MAX)))
        .execute(&self.pool)
        .await
        .context("failed to insert call log")?;
        Ok(())
    }

    async fn update_call_status(
        &self,
        call_id: &CallId,
        status: CallState,
        duration_secs: Option<u64>,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let ended_at = status.is_terminal().then_some(at);
        let result = sqlx::query(
            "UPDATE call_logs
             SET status = ?, ended_at = COALESCE(?, ended_at), duration_secs = COALESCE(?, duration_secs)
             WHERE call_id = ? AND status IN ('ringing', 'active')",
        )
        .bind(status.as_str())
        .bind(ended_at)
        .bind(duration_secs.map(|d| i64::try_from(d).unwrap_or(i64::MAX)))
        .bind(call_id.as_str())
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to update call {call_id}"))?;
        Ok(result.rows_affected() > 0)
    }

    async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
