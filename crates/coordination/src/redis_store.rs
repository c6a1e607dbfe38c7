use std::{pin::pin, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use redis::{
    aio::{MultiplexedConnection, PubSub},
    Script,
};
use shared::domain::{CallId, CallState, RoomId, UserId};
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use crate::{
    keys, BusMessage, BusSubscription, CallRecord, CallTransition, ChannelControl,
    CoordinationStore, PubSubTransport, StoreError, WindowState,
};

const BUS_CAPACITY: usize = 4096;

const RECORD_HIT: &str = r#"
redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', tonumber(ARGV[1]) - tonumber(ARGV[2]))
redis.call('ZADD', KEYS[1], ARGV[1], ARGV[3])
local count = redis.call('ZCARD', KEYS[1])
redis.call('PEXPIRE', KEYS[1], ARGV[2])
local oldest = redis.call('ZRANGE', KEYS[1], 0, 0, 'WITHSCORES')
return {count, oldest[2]}
"#;

const ADD_SESSION: &str = r#"
redis.call('HSET', KEYS[1], ARGV[1], ARGV[2])
redis.call('PEXPIRE', KEYS[1], ARGV[3])
redis.call('SADD', KEYS[2], ARGV[4])
return redis.call('HLEN', KEYS[1])
"#;

const TOUCH_SESSION: &str = r#"
if redis.call('HEXISTS', KEYS[1], ARGV[1]) == 0 then
  return 0
end
redis.call('HSET', KEYS[1], ARGV[1], ARGV[2])
redis.call('PEXPIRE', KEYS[1], ARGV[3])
return 1
"#;

const REMOVE_SESSION: &str = r#"
local removed = redis.call('HDEL', KEYS[1], ARGV[1])
local remaining = redis.call('HLEN', KEYS[1])
if remaining == 0 then
  redis.call('SREM', KEYS[2], ARGV[2])
end
if removed == 0 then
  return -1
end
return remaining
"#;

const LIVE_SESSIONS: &str = r#"
local entries = redis.call('HGETALL', KEYS[1])
local live = {}
for i = 1, #entries, 2 do
  if tonumber(entries[i + 1]) < tonumber(ARGV[1]) then
    redis.call('HDEL', KEYS[1], entries[i])
  else
    table.insert(live, entries[i])
  end
end
if #live == 0 then
  redis.call('SREM', KEYS[2], ARGV[2])
end
return live
"#;

const RELEASE_BUSY: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  redis.call('DEL', KEYS[1])
  return 1
end
return 0
"#;

const EXTEND_BUSY: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return 0
"#;

const TRANSITION_CALL: &str = r#"
local state = redis.call('HGET', KEYS[1], 'state')
if not state then
  return {0, '', ''}
end
for i = 2, #ARGV do
  if ARGV[i] == state then
    redis.call('HSET', KEYS[1], 'state', ARGV[1])
    local answered = redis.call('HGET', KEYS[1], 'answered_at') or ''
    return {2, redis.call('HGET', KEYS[1], 'data'), answered}
  end
end
return {1, state, ''}
"#;

const ANSWER_CALL: &str = r#"
local state = redis.call('HGET', KEYS[1], 'state')
if not state then
  return {0, ''}
end
if state ~= 'ringing' then
  return {1, state}
end
redis.call('HSET', KEYS[1], 'state', 'active', 'answered_at', ARGV[1])
redis.call('PEXPIRE', KEYS[1], ARGV[2])
return {2, redis.call('HGET', KEYS[1], 'data')}
"#;

impl From<redis::RedisError> for StoreError {
    fn from(value: redis::RedisError) -> Self {
        StoreError::Backend(value.to_string())
    }
}

/// Redis-backed coordination store. Multi-step operations run as Lua
/// scripts so each is a single atomic command on the server.
#[derive(Clone)]
pub struct RedisStore {
    client: redis::Client,
    conn: MultiplexedConnection,
}

impl RedisStore {
    pub async fn connect(redis_url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self { client, conn })
    }

    pub async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    fn conn(&self) -> MultiplexedConnection {
        self.conn.clone()
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[async_trait]
impl CoordinationStore for RedisStore {
    async fn add_session(
        &self,
        user_id: UserId,
        handle: &str,
        now_ms: i64,
        ttl: Duration,
    ) -> Result<usize, StoreError> {
        let count: usize = Script::new(ADD_SESSION)
            .key(keys::user_sessions(user_id))
            .key(keys::ONLINE_USERS)
            .arg(handle)
            .arg(now_ms)
            .arg(millis(ttl))
            .arg(user_id.0)
            .invoke_async(&mut self.conn())
            .await?;
        Ok(count)
    }

    async fn touch_session(
        &self,
        user_id: UserId,
        handle: &str,
        now_ms: i64,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let touched: i64 = Script::new(TOUCH_SESSION)
            .key(keys::user_sessions(user_id))
            .arg(handle)
            .arg(now_ms)
            .arg(millis(ttl))
            .invoke_async(&mut self.conn())
            .await?;
        Ok(touched == 1)
    }

    async fn remove_session(
        &self,
        user_id: UserId,
        handle: &str,
    ) -> Result<Option<usize>, StoreError> {
        let remaining: i64 = Script::new(REMOVE_SESSION)
            .key(keys::user_sessions(user_id))
            .key(keys::ONLINE_USERS)
            .arg(handle)
            .arg(user_id.0)
            .invoke_async(&mut self.conn())
            .await?;
        Ok(usize::try_from(remaining).ok())
    }

    async fn live_sessions(
        &self,
        user_id: UserId,
        stale_before_ms: i64,
    ) -> Result<Vec<String>, StoreError> {
        let mut live: Vec<String> = Script::new(LIVE_SESSIONS)
            .key(keys::user_sessions(user_id))
            .key(keys::ONLINE_USERS)
            .arg(stale_before_ms)
            .arg(user_id.0)
            .invoke_async(&mut self.conn())
            .await?;
        live.sort();
        Ok(live)
    }

    async fn online_users(&self) -> Result<Vec<UserId>, StoreError> {
        let members: Vec<i64> = redis::cmd("SMEMBERS")
            .arg(keys::ONLINE_USERS)
            .query_async(&mut self.conn())
            .await?;
        let mut users: Vec<UserId> = members.into_iter().map(UserId).collect();
        users.sort();
        Ok(users)
    }

    async fn record_hit(
        &self,
        key: &str,
        now_ms: i64,
        window: Duration,
    ) -> Result<WindowState, StoreError> {
        // Members must be unique even for hits landing in the same millisecond.
        let member = format!("{now_ms}-{}", uuid::Uuid::new_v4().simple());
        let (count, oldest): (usize, String) = Script::new(RECORD_HIT)
            .key(key)
            .arg(now_ms)
            .arg(millis(window))
            .arg(member)
            .invoke_async(&mut self.conn())
            .await?;
        let oldest_ms = oldest
            .parse::<f64>()
            .map_err(|_| StoreError::Corrupt(format!("window score '{oldest}'")))?
            as i64;
        Ok(WindowState { count, oldest_ms })
    }

    async fn set_typing(
        &self,
        room_id: RoomId,
        user_id: UserId,
        now_ms: i64,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let key = keys::typing_room(room_id);
        let expires = now_ms + i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX / 2);
        redis::pipe()
            .atomic()
            .cmd("ZADD")
            .arg(&key)
            .arg(expires)
            .arg(user_id.0)
            .ignore()
            .cmd("PEXPIRE")
            .arg(&key)
            .arg(millis(ttl))
            .ignore()
            .query_async::<_, ()>(&mut self.conn())
            .await?;
        Ok(())
    }

    async fn clear_typing(&self, room_id: RoomId, user_id: UserId) -> Result<bool, StoreError> {
        let removed: i64 = redis::cmd("ZREM")
            .arg(keys::typing_room(room_id))
            .arg(user_id.0)
            .query_async(&mut self.conn())
            .await?;
        Ok(removed > 0)
    }

    async fn typing_users(&self, room_id: RoomId, now_ms: i64) -> Result<Vec<UserId>, StoreError> {
        let key = keys::typing_room(room_id);
        let (members,): (Vec<i64>,) = redis::pipe()
            .atomic()
            .cmd("ZREMRANGEBYSCORE")
            .arg(&key)
            .arg("-inf")
            .arg(now_ms)
            .ignore()
            .cmd("ZRANGE")
            .arg(&key)
            .arg(0)
            .arg(-1)
            .query_async(&mut self.conn())
            .await?;
        let mut users: Vec<UserId> = members.into_iter().map(UserId).collect();
        users.sort();
        Ok(users)
    }

    async fn claim_busy(
        &self,
        user_id: UserId,
        call_id: &CallId,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let reply: Option<String> = redis::cmd("SET")
            .arg(keys::busy_marker(user_id))
            .arg(call_id.as_str())
            .arg("NX")
            .arg("PX")
            .arg(millis(ttl))
            .query_async(&mut self.conn())
            .await?;
        Ok(reply.is_some())
    }

    async fn busy_call(&self, user_id: UserId) -> Result<Option<CallId>, StoreError> {
        let owner: Option<String> = redis::cmd("GET")
            .arg(keys::busy_marker(user_id))
            .query_async(&mut self.conn())
            .await?;
        Ok(owner.map(CallId))
    }

    async fn release_busy(&self, user_id: UserId, call_id: &CallId) -> Result<bool, StoreError> {
        let released: i64 = Script::new(RELEASE_BUSY)
            .key(keys::busy_marker(user_id))
            .arg(call_id.as_str())
            .invoke_async(&mut self.conn())
            .await?;
        Ok(released == 1)
    }

    async fn extend_busy(
        &self,
        user_id: UserId,
        call_id: &CallId,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let extended: i64 = Script::new(EXTEND_BUSY)
            .key(keys::busy_marker(user_id))
            .arg(call_id.as_str())
            .arg(millis(ttl))
            .invoke_async(&mut self.conn())
            .await?;
        Ok(extended == 1)
    }

    async fn put_call(&self, record: &CallRecord, ttl: Duration) -> Result<(), StoreError> {
        let key = keys::call_session(&record.call_id);
        let data =
            serde_json::to_string(record).map_err(|e| StoreError::Corrupt(e.to_string()))?;
        redis::pipe()
            .atomic()
            .cmd("HSET")
            .arg(&key)
            .arg("state")
            .arg(record.state.as_str())
            .arg("data")
            .arg(data)
            .ignore()
            .cmd("PEXPIRE")
            .arg(&key)
            .arg(millis(ttl))
            .ignore()
            .query_async::<_, ()>(&mut self.conn())
            .await?;
        Ok(())
    }

    async fn get_call(&self, call_id: &CallId) -> Result<Option<CallRecord>, StoreError> {
        let (state, data, answered): (Option<String>, Option<String>, Option<String>) =
            redis::cmd("HMGET")
                .arg(keys::call_session(call_id))
                .arg("state")
                .arg("data")
                .arg("answered_at")
                .query_async(&mut self.conn())
                .await?;
        let (Some(state), Some(data)) = (state, data) else {
            return Ok(None);
        };
        decode_call(&data, &state, answered.as_deref()).map(Some)
    }

    async fn transition_call(
        &self,
        call_id: &CallId,
        expected: &[CallState],
        next: CallState,
    ) -> Result<CallTransition, StoreError> {
        let script = Script::new(TRANSITION_CALL);
        let mut invocation = script.key(keys::call_session(call_id));
        invocation.arg(next.as_str());
        for state in expected {
            invocation.arg(state.as_str());
        }
        let (outcome, body, answered): (i64, String, String) =
            invocation.invoke_async(&mut self.conn()).await?;
        let answered = (!answered.is_empty()).then_some(answered.as_str());
        match outcome {
            2 => decode_call(&body, next.as_str(), answered).map(CallTransition::Applied),
            1 => mismatch(&body),
            _ => Ok(CallTransition::Missing),
        }
    }

    async fn answer_call(
        &self,
        call_id: &CallId,
        answered_at: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<CallTransition, StoreError> {
        let answered = answered_at.to_rfc3339();
        let (outcome, body): (i64, String) = Script::new(ANSWER_CALL)
            .key(keys::call_session(call_id))
            .arg(&answered)
            .arg(millis(ttl))
            .invoke_async(&mut self.conn())
            .await?;
        match outcome {
            2 => decode_call(&body, CallState::Active.as_str(), Some(answered.as_str()))
                .map(CallTransition::Applied),
            1 => mismatch(&body),
            _ => Ok(CallTransition::Missing),
        }
    }

    async fn delete_call(&self, call_id: &CallId) -> Result<(), StoreError> {
        redis::cmd("DEL")
            .arg(keys::call_session(call_id))
            .query_async::<_, ()>(&mut self.conn())
            .await?;
        Ok(())
    }
}

/// The hash keeps `state` and `answered_at` beside the JSON body so scripts
/// can change them without re-encoding it; those fields win over the body.
fn decode_call(data: &str, state: &str, answered: Option<&str>) -> Result<CallRecord, StoreError> {
    let mut record: CallRecord =
        serde_json::from_str(data).map_err(|e| StoreError::Corrupt(e.to_string()))?;
    record.state =
        CallState::parse(state).ok_or_else(|| StoreError::Corrupt(format!("call state '{state}'")))?;
    if let Some(answered) = answered {
        let at = DateTime::parse_from_rfc3339(answered)
            .map_err(|_| StoreError::Corrupt(format!("answer time '{answered}'")))?;
        record.answered_at = Some(at.with_timezone(&Utc));
    }
    Ok(record)
}

fn mismatch(state: &str) -> Result<CallTransition, StoreError> {
    CallState::parse(state)
        .map(CallTransition::Mismatch)
        .ok_or_else(|| StoreError::Corrupt(format!("call state '{state}'")))
}

#[async_trait]
impl PubSubTransport for RedisStore {
    async fn publish(&self, channel: &str, payload: String) -> Result<(), StoreError> {
        let _receivers: i64 = redis::cmd("PUBLISH")
            .arg(channel)
            .arg(payload)
            .query_async(&mut self.conn())
            .await?;
        Ok(())
    }

    /// One dedicated pub/sub connection per instance. A background task
    /// owns it, forwarding messages and applying channel changes in order.
    async fn subscribe(&self) -> Result<BusSubscription, StoreError> {
        let pubsub = self.client.get_async_pubsub().await?;
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (messages, message_rx) = mpsc::channel(BUS_CAPACITY);
        tokio::spawn(run_subscription(pubsub, command_rx, messages));
        Ok(BusSubscription {
            control: Arc::new(RedisChannels { commands }),
            messages: Box::pin(ReceiverStream::new(message_rx)),
        })
    }
}

enum ChannelCommand {
    Listen(String),
    Unlisten(String),
    Applied(oneshot::Sender<()>),
}

struct RedisChannels {
    commands: mpsc::UnboundedSender<ChannelCommand>,
}

impl ChannelControl for RedisChannels {
    fn listen(&self, channel: &str) {
        let _ = self.commands.send(ChannelCommand::Listen(channel.to_string()));
    }

    fn unlisten(&self, channel: &str) {
        let _ = self.commands.send(ChannelCommand::Unlisten(channel.to_string()));
    }

    fn applied(&self) -> oneshot::Receiver<()> {
        let (done, applied) = oneshot::channel();
        let _ = self.commands.send(ChannelCommand::Applied(done));
        applied
    }
}

enum Step {
    Message(Option<redis::Msg>),
    Command(Option<ChannelCommand>),
}

/// Ends, closing the message stream, when the connection drops or a
/// channel change fails.
async fn run_subscription(
    mut pubsub: PubSub,
    mut commands: mpsc::UnboundedReceiver<ChannelCommand>,
    messages: mpsc::Sender<BusMessage>,
) {
    let mut controls_open = true;
    loop {
        let step = {
            let mut incoming = pin!(pubsub.on_message());
            tokio::select! {
                msg = incoming.next() => Step::Message(msg),
                command = commands.recv(), if controls_open => Step::Command(command),
            }
        };
        match step {
            Step::Message(None) => break,
            Step::Message(Some(msg)) => {
                let channel = msg.get_channel_name().to_string();
                match msg.get_payload::<String>() {
                    Ok(payload) => {
                        if messages.send(BusMessage { channel, payload }).await.is_err() {
                            break;
                        }
                    }
                    Err(error) => warn!(%channel, %error, "dropping non-utf8 bus payload"),
                }
            }
            Step::Command(None) => controls_open = false,
            Step::Command(Some(ChannelCommand::Listen(channel))) => {
                if let Err(error) = pubsub.subscribe(&channel).await {
                    warn!(%channel, %error, "channel subscribe failed");
                    break;
                }
            }
            Step::Command(Some(ChannelCommand::Unlisten(channel))) => {
                if let Err(error) = pubsub.unsubscribe(&channel).await {
                    warn!(%channel, %error, "channel unsubscribe failed");
                    break;
                }
            }
            Step::Command(Some(ChannelCommand::Applied(done))) => {
                let _ = done.send(());
            }
        }
    }
    debug!("redis subscription closed");
}
