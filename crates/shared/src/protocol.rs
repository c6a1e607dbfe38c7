use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    domain::{
        CallId, CallKind, CallState, ConnectionId, InstanceId, MessageId, MessageKind,
        PresenceStatus, ReceiptStatus, RoomId, SignalKind, UserId,
    },
    error::{ApiError, ErrorCode},
};

/// Raw inbound frame as it arrives on the socket. `ack` is present when the
/// client expects a correlated acknowledgment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientFrame {
    pub event: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack: Option<u64>,
}

impl ClientFrame {
    pub fn parse(text: &str) -> Result<Self, ApiError> {
        serde_json::from_str(text)
            .map_err(|e| ApiError::new(ErrorCode::Validation, format!("malformed frame: {e}")))
    }

    pub fn new(event: ClientEvent, ack: Option<u64>) -> Self {
        let tagged = serde_json::to_value(event).unwrap_or(Value::Null);
        let event = tagged
            .get("event")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let data = tagged.get("data").cloned().unwrap_or(Value::Null);
        Self { event, data, ack }
    }

    pub fn into_event(self) -> Result<(ClientEvent, Option<u64>), ApiError> {
        let mut tagged = serde_json::Map::new();
        tagged.insert("event".into(), Value::String(self.event.clone()));
        if !self.data.is_null() {
            tagged.insert("data".into(), self.data);
        }
        let event = serde_json::from_value(Value::Object(tagged)).map_err(|e| {
            ApiError::new(
                ErrorCode::Validation,
                format!("invalid `{}` payload: {e}", self.event),
            )
        })?;
        Ok((event, self.ack))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientEvent {
    #[serde(rename = "room:join")]
    RoomJoin { room_id: RoomId },
    #[serde(rename = "room:leave")]
    RoomLeave { room_id: RoomId },
    #[serde(rename = "message:send")]
    MessageSend {
        room_id: RoomId,
        content: String,
        #[serde(default = "default_message_kind")]
        kind: MessageKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        temp_id: Option<String>,
    },
    #[serde(rename = "message:delivered")]
    MessageDelivered { message_id: MessageId },
    #[serde(rename = "message:read")]
    MessageRead { message_id: MessageId },
    #[serde(rename = "typing:start")]
    TypingStart { room_id: RoomId },
    #[serde(rename = "typing:stop")]
    TypingStop { room_id: RoomId },
    #[serde(rename = "call:initiate")]
    CallInitiate {
        callee_id: UserId,
        kind: CallKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room_id: Option<RoomId>,
    },
    #[serde(rename = "call:accept")]
    CallAccept { call_id: CallId },
    #[serde(rename = "call:reject")]
    CallReject { call_id: CallId },
    #[serde(rename = "call:end")]
    CallEnd {
        call_id: CallId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration_secs: Option<u64>,
    },
    #[serde(rename = "call:signal")]
    CallSignal {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        call_id: Option<CallId>,
        to: UserId,
        kind: SignalKind,
        payload: Value,
    },
    #[serde(rename = "heartbeat")]
    Heartbeat,
}

fn default_message_kind() -> MessageKind {
    MessageKind::Text
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagePayload {
    pub message_id: MessageId,
    pub room_id: RoomId,
    pub sender_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_username: Option<String>,
    pub content: String,
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    pub created_at: DateTime<Utc>,
}

/// Direct reply to the sender of `message:send`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageAck {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp_id: Option<String>,
    pub message: MessagePayload,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomSnapshot {
    pub room_id: RoomId,
    pub typing: Vec<UserId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallPayload {
    pub call_id: CallId,
    pub caller_id: UserId,
    pub callee_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<RoomId>,
    pub kind: CallKind,
    pub state: CallState,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    #[serde(rename = "session:ready")]
    SessionReady {
        connection_id: ConnectionId,
        user_id: UserId,
        instance_id: InstanceId,
        rooms: Vec<RoomId>,
    },
    #[serde(rename = "message:new")]
    MessageNew { message: MessagePayload },
    #[serde(rename = "message:status")]
    MessageStatus {
        message_id: MessageId,
        room_id: RoomId,
        user_id: UserId,
        status: ReceiptStatus,
        at: DateTime<Utc>,
    },
    #[serde(rename = "messages:offline")]
    MessagesOffline {
        messages: Vec<MessagePayload>,
        batch: u32,
    },
    #[serde(rename = "presence:change")]
    PresenceChange {
        user_id: UserId,
        status: PresenceStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        last_seen: Option<DateTime<Utc>>,
    },
    #[serde(rename = "typing:start")]
    TypingStart { room_id: RoomId, user_id: UserId },
    #[serde(rename = "typing:stop")]
    TypingStop { room_id: RoomId, user_id: UserId },
    #[serde(rename = "call:ringing")]
    CallRinging { call: CallPayload },
    #[serde(rename = "call:accepted")]
    CallAccepted { call_id: CallId, by: UserId },
    #[serde(rename = "call:rejected")]
    CallRejected { call_id: CallId, by: UserId },
    #[serde(rename = "call:ended")]
    CallEnded {
        call_id: CallId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        by: Option<UserId>,
        status: CallState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration_secs: Option<u64>,
    },
    #[serde(rename = "call:missed")]
    CallMissed { call_id: CallId },
    #[serde(rename = "call:busy")]
    CallBusy { callee_id: UserId },
    #[serde(rename = "call:signal")]
    CallSignal {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        call_id: Option<CallId>,
        from: UserId,
        kind: SignalKind,
        payload: Value,
    },
    #[serde(rename = "heartbeat:ack")]
    HeartbeatAck { server_time: DateTime<Utc> },
    #[serde(rename = "error")]
    Error(ApiError),
}

impl ServerEvent {
    /// Call id carried by terminal call events, used to retire ring timers.
    pub fn settled_call(&self) -> Option<&CallId> {
        match self {
            ServerEvent::CallAccepted { call_id, .. }
            | ServerEvent::CallRejected { call_id, .. }
            | ServerEvent::CallEnded { call_id, .. }
            | ServerEvent::CallMissed { call_id } => Some(call_id),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AckFrame {
    pub ack: u64,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiError>,
}

impl AckFrame {
    pub fn success(ack: u64, data: Option<Value>) -> Self {
        Self {
            ack,
            ok: true,
            data,
            error: None,
        }
    }

    pub fn failure(ack: u64, error: ApiError) -> Self {
        Self {
            ack,
            ok: false,
            data: None,
            error: Some(error),
        }
    }
}

/// Everything a connection writer may put on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OutboundFrame {
    Ack(AckFrame),
    Event(ServerEvent),
}
