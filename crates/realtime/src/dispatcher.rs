use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use shared::{
    error::ApiError,
    protocol::{AckFrame, ClientEvent, ClientFrame, OutboundFrame, RoomSnapshot, ServerEvent},
};
use tracing::{debug, warn};

use crate::{
    calls::Initiation, delivery::SendRequest, error::RealtimeError, session::Session, Realtime,
};

fn to_data<T: Serialize>(value: &T) -> Option<Value> {
    serde_json::to_value(value).ok()
}

impl Realtime {
    /// Parses and handles one inbound text frame, returning the reply for
    /// the originating connection, if any.
    pub async fn handle_text(&self, session: &Session, text: &str) -> Option<OutboundFrame> {
        match ClientFrame::parse(text) {
            Ok(frame) => self.handle_frame(session, frame).await,
            Err(error) => Some(OutboundFrame::Event(ServerEvent::Error(error))),
        }
    }

    /// Frames carrying an `ack` id always get an [`AckFrame`]. Without one,
    /// only failures are reported, as an `error` event.
    pub async fn handle_frame(&self, session: &Session, frame: ClientFrame) -> Option<OutboundFrame> {
        let ack = frame.ack;
        let event = match frame.into_event() {
            Ok((event, _)) => event,
            Err(error) => return Some(reply_error(ack, error)),
        };

        if matches!(event, ClientEvent::Heartbeat) {
            return Some(match self.heartbeat(session).await {
                Ok(server_time) => match ack {
                    Some(ack) => OutboundFrame::Ack(AckFrame::success(
                        ack,
                        Some(json!({ "server_time": server_time })),
                    )),
                    None => OutboundFrame::Event(ServerEvent::HeartbeatAck { server_time }),
                },
                Err(error) => reply_error(ack, error.into()),
            });
        }

        match (ack, self.dispatch(session, event, ack).await) {
            (Some(ack), Ok(data)) => Some(OutboundFrame::Ack(AckFrame::success(ack, data))),
            (None, Ok(_)) => None,
            (ack, Err(error)) => {
                debug!(user_id = %session.user_id, %error, "client event rejected");
                Some(reply_error(ack, error.into()))
            }
        }
    }

    async fn dispatch(
        &self,
        session: &Session,
        event: ClientEvent,
        ack: Option<u64>,
    ) -> Result<Option<Value>, RealtimeError> {
        match event {
            ClientEvent::RoomJoin { room_id } => {
                if !self.ctx.repo.is_room_member(room_id, session.user_id).await? {
                    return Err(RealtimeError::Authorization(format!(
                        "not a member of room {room_id}"
                    )));
                }
                self.ctx.hub.join(&session.connection_id, room_id);
                self.ctx.hub.channels_applied().await;
                let typing = self.typing.typing_in(room_id).await?;
                Ok(to_data(&RoomSnapshot { room_id, typing }))
            }
            ClientEvent::RoomLeave { room_id } => {
                self.ctx.hub.leave(&session.connection_id, room_id);
                Ok(None)
            }
            ClientEvent::MessageSend {
                room_id,
                content,
                kind,
                metadata,
                temp_id,
            } => {
                if ack.is_none() {
                    return Err(RealtimeError::Validation(
                        "message:send requires an ack id".into(),
                    ));
                }
                let sent = self
                    .delivery
                    .send(
                        session,
                        SendRequest {
                            room_id,
                            content,
                            kind,
                            metadata,
                            temp_id,
                        },
                    )
                    .await?;
                Ok(to_data(&sent))
            }
            ClientEvent::MessageDelivered { message_id } => {
                self.delivery
                    .mark_delivered(session, message_id)
                    .await
                    .inspect_err(|error| warn!(%message_id, %error, "mark delivered failed"))?;
                Ok(None)
            }
            ClientEvent::MessageRead { message_id } => {
                self.delivery
                    .mark_read(session, message_id)
                    .await
                    .inspect_err(|error| warn!(%message_id, %error, "mark read failed"))?;
                Ok(None)
            }
            ClientEvent::TypingStart { room_id } => {
                self.typing.start(session, room_id).await?;
                Ok(None)
            }
            ClientEvent::TypingStop { room_id } => {
                self.typing.stop(session, room_id).await?;
                Ok(None)
            }
            ClientEvent::CallInitiate {
                callee_id,
                kind,
                room_id,
            } => match self.calls.initiate(session, callee_id, kind, room_id).await? {
                Initiation::Ringing(call) => Ok(to_data(&call)),
                Initiation::Busy { callee_id } => {
                    Ok(Some(json!({ "state": "busy", "callee_id": callee_id })))
                }
            },
            ClientEvent::CallAccept { call_id } => {
                self.calls.accept(session, &call_id).await?;
                Ok(None)
            }
            ClientEvent::CallReject { call_id } => {
                self.calls.reject(session, &call_id).await?;
                Ok(None)
            }
            ClientEvent::CallEnd {
                call_id,
                duration_secs,
            } => {
                let status = self.calls.end(session, &call_id, duration_secs).await?;
                Ok(Some(json!({ "status": status })))
            }
            ClientEvent::CallSignal {
                call_id,
                to,
                kind,
                payload,
            } => {
                self.calls
                    .relay_signal(session, call_id, to, kind, payload)
                    .await?;
                Ok(None)
            }
            ClientEvent::Heartbeat => Ok(None),
        }
    }

    /// Refreshes the session's liveness. A session already pruned as stale
    /// is registered again.
    async fn heartbeat(&self, session: &Session) -> Result<chrono::DateTime<Utc>, RealtimeError> {
        if !self.presence.registry().touch(session).await? {
            debug!(user_id = %session.user_id, "heartbeat for pruned session, re-registering");
            self.presence.mark_online(session).await?;
        }
        Ok(Utc::now())
    }
}

fn reply_error(ack: Option<u64>, error: ApiError) -> OutboundFrame {
    match ack {
        Some(ack) => OutboundFrame::Ack(AckFrame::failure(ack, error)),
        None => OutboundFrame::Event(ServerEvent::Error(error)),
    }
}

#[cfg(test)]
#[path = "tests/dispatcher_tests.rs"]
mod tests;
