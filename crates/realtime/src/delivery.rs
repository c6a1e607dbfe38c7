use chrono::Utc;
use coordination::keys;
use serde_json::Value;
use shared::{
    domain::{MessageId, MessageKind, ReceiptStatus, RoomId, UserId},
    protocol::{MessageAck, MessagePayload, OutboundFrame, ServerEvent},
};
use storage::{NewMessage, ReceiptUpdate, StoredMessage};
use tracing::{debug, info, warn};

use crate::{
    context::RealtimeContext, error::RealtimeError, rate_limit::RateLimiter, session::Session,
    typing::TypingAggregator,
};

#[derive(Debug, Clone, PartialEq)]
pub struct SendRequest {
    pub room_id: RoomId,
    pub content: String,
    pub kind: MessageKind,
    pub metadata: Option<Value>,
    pub temp_id: Option<String>,
}

fn to_payload(message: StoredMessage) -> MessagePayload {
    MessagePayload {
        message_id: message.message_id,
        room_id: message.room_id,
        sender_id: message.sender_id,
        sender_username: message.sender_username,
        content: message.content,
        kind: message.kind,
        metadata: message.metadata,
        created_at: message.created_at,
    }
}

#[derive(Clone)]
pub struct DeliveryPipeline {
    ctx: RealtimeContext,
    limiter: RateLimiter,
    typing: TypingAggregator,
}

impl DeliveryPipeline {
    pub fn new(ctx: RealtimeContext, limiter: RateLimiter, typing: TypingAggregator) -> Self {
        Self {
            ctx,
            limiter,
            typing,
        }
    }

    /// Persists and fans out one message. Validation, rate limiting and
    /// membership are checked before anything is written; once the message
    /// and its receipts are stored the send succeeds even if the broadcast
    /// fails.
    pub async fn send(
        &self,
        session: &Session,
        request: SendRequest,
    ) -> Result<MessageAck, RealtimeError> {
        let SendRequest {
            room_id,
            content,
            kind,
            metadata,
            temp_id,
        } = request;
        let user_id = session.user_id;

        if content.trim().is_empty() {
            return Err(RealtimeError::Validation("message content is empty".into()));
        }
        let max = self.ctx.config.max_message_chars;
        if content.chars().count() > max {
            return Err(RealtimeError::Validation(format!(
                "message exceeds {max} characters"
            )));
        }

        self.limiter
            .enforce("send", &user_id.to_string(), self.ctx.config.send_limit)
            .await?;

        if !self.ctx.repo.is_room_member(room_id, user_id).await? {
            return Err(RealtimeError::Authorization(format!(
                "not a member of room {room_id}"
            )));
        }

        let stored = self
            .ctx
            .repo
            .create_message(NewMessage {
                room_id,
                sender_id: user_id,
                content,
                kind,
                metadata,
            })
            .await?;
        let recipients: Vec<UserId> = self
            .ctx
            .repo
            .get_room_members(room_id)
            .await?
            .into_iter()
            .filter(|member| *member != user_id)
            .collect();
        self.ctx
            .repo
            .create_receipts(stored.message_id, &recipients)
            .await?;

        let message = to_payload(stored);
        if let Err(error) = self
            .ctx
            .bus
            .publish_excluding(
                &keys::room_channel(room_id),
                ServerEvent::MessageNew {
                    message: message.clone(),
                },
                Some(session.connection_id.clone()),
            )
            .await
        {
            warn!(message_id = %message.message_id, %room_id, %error, "message broadcast failed");
        }
        self.typing.clear_after_send(session, room_id).await;

        debug!(message_id = %message.message_id, %room_id, recipients = recipients.len(), "message sent");
        Ok(MessageAck { temp_id, message })
    }

    pub async fn mark_delivered(
        &self,
        session: &Session,
        message_id: MessageId,
    ) -> Result<bool, RealtimeError> {
        self.apply_receipt(session.user_id, message_id, ReceiptStatus::Delivered)
            .await
    }

    /// Read implies delivered: an undelivered receipt gets both timestamps.
    pub async fn mark_read(
        &self,
        session: &Session,
        message_id: MessageId,
    ) -> Result<bool, RealtimeError> {
        self.apply_receipt(session.user_id, message_id, ReceiptStatus::Read)
            .await
    }

    async fn apply_receipt(
        &self,
        user_id: UserId,
        message_id: MessageId,
        status: ReceiptStatus,
    ) -> Result<bool, RealtimeError> {
        let message = self
            .ctx
            .repo
            .get_message_by_id(message_id)
            .await?
            .ok_or_else(|| RealtimeError::NotFound(format!("message {message_id}")))?;
        let at = Utc::now();
        let outcome = match status {
            ReceiptStatus::Delivered => self.ctx.repo.mark_delivered(message_id, user_id, at),
            ReceiptStatus::Read => self.ctx.repo.mark_read(message_id, user_id, at),
        }
        .await?;
        match outcome {
            ReceiptUpdate::Applied => {
                self.publish_status(message.room_id, message_id, user_id, status, at)
                    .await;
                Ok(true)
            }
            ReceiptUpdate::Unchanged => Ok(false),
            ReceiptUpdate::Missing => Err(RealtimeError::NotFound(format!(
                "receipt for message {message_id}"
            ))),
        }
    }

    async fn publish_status(
        &self,
        room_id: RoomId,
        message_id: MessageId,
        user_id: UserId,
        status: ReceiptStatus,
        at: chrono::DateTime<Utc>,
    ) {
        let event = ServerEvent::MessageStatus {
            message_id,
            room_id,
            user_id,
            status,
            at,
        };
        if let Err(error) = self
            .ctx
            .bus
            .publish(&keys::room_channel(room_id), event)
            .await
        {
            warn!(%message_id, %room_id, %error, "receipt status broadcast failed");
        }
    }

    /// Flushes the user's undelivered backlog to one fresh connection in
    /// fixed-size batches, oldest first, marking each batch delivered once
    /// it is queued. Stops early if the connection goes away; whatever is
    /// still undelivered is picked up by the next connect.
    pub async fn replay_offline(&self, session: &Session) -> Result<usize, RealtimeError> {
        let user_id = session.user_id;
        let batch_size = self.ctx.config.replay_batch_size.max(1);
        let mut batch_number = 0u32;
        let mut replayed = 0usize;

        loop {
            let backlog = self
                .ctx
                .repo
                .get_undelivered_for_user(user_id, batch_size)
                .await?;
            if backlog.is_empty() {
                break;
            }
            if batch_number > 0 {
                tokio::time::sleep(self.ctx.config.replay_batch_delay).await;
            }
            batch_number += 1;

            let ids: Vec<(MessageId, RoomId)> = backlog
                .iter()
                .map(|message| (message.message_id, message.room_id))
                .collect();
            let frame = OutboundFrame::Event(ServerEvent::MessagesOffline {
                messages: backlog.into_iter().map(to_payload).collect(),
                batch: batch_number,
            });
            if !self.ctx.hub.send_to(&session.connection_id, frame) {
                debug!(%user_id, connection_id = %session.connection_id, "replay target gone");
                break;
            }

            let at = Utc::now();
            let mut progressed = 0usize;
            for (message_id, room_id) in ids {
                match self.ctx.repo.mark_delivered(message_id, user_id, at).await {
                    Ok(ReceiptUpdate::Applied) => {
                        progressed += 1;
                        self.publish_status(
                            room_id,
                            message_id,
                            user_id,
                            ReceiptStatus::Delivered,
                            at,
                        )
                        .await;
                    }
                    Ok(_) => {}
                    Err(error) => {
                        warn!(%user_id, %message_id, %error, "marking replayed message delivered failed")
                    }
                }
            }
            replayed += progressed;
            if progressed == 0 {
                break;
            }
        }

        if replayed > 0 {
            info!(%user_id, replayed, batches = batch_number, "offline backlog replayed");
        }
        Ok(replayed)
    }
}

#[cfg(test)]
#[path = "tests/delivery_tests.rs"]
mod tests;
