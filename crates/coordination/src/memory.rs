use std::{
    collections::{BTreeMap, HashMap, HashSet, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use shared::domain::{CallId, CallState, RoomId, UserId};
use tokio::{
    sync::{broadcast, oneshot},
    time::Instant,
};
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tracing::warn;

use crate::{
    BusMessage, BusSubscription, CallRecord, CallTransition, ChannelControl, CoordinationStore,
    PubSubTransport, StoreError, WindowState,
};

const BUS_CAPACITY: usize = 4096;

#[derive(Default)]
struct MemoryState {
    sessions: HashMap<UserId, HashMap<String, i64>>,
    online: HashSet<UserId>,
    windows: HashMap<String, VecDeque<i64>>,
    typing: HashMap<RoomId, BTreeMap<UserId, i64>>,
    busy: HashMap<UserId, (CallId, Instant)>,
    calls: HashMap<CallId, (CallRecord, Instant)>,
}

/// In-process coordination store. Every operation runs under one lock, so
/// each is atomic the way the scripted Redis operations are. Clones share
/// state, which lets several instances in one process coordinate.
#[derive(Clone)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
    bus: Arc<Mutex<Option<broadcast::Sender<BusMessage>>>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(BUS_CAPACITY);
        Self {
            state: Arc::new(Mutex::new(MemoryState::default())),
            bus: Arc::new(Mutex::new(Some(sender))),
        }
    }

    /// Drops the bus, ending every open subscription as a lost broker
    /// connection would.
    pub fn sever_bus(&self) {
        lock(&self.bus).take();
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        lock(&self.state)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn add_session(
        &self,
        user_id: UserId,
        handle: &str,
        now_ms: i64,
        _ttl: Duration,
    ) -> Result<usize, StoreError> {
        let mut state = self.state();
        let sessions = state.sessions.entry(user_id).or_default();
        sessions.insert(handle.to_string(), now_ms);
        let count = sessions.len();
        state.online.insert(user_id);
        Ok(count)
    }

    async fn touch_session(
        &self,
        user_id: UserId,
        handle: &str,
        now_ms: i64,
        _ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut state = self.state();
        let Some(stamp) = state
            .sessions
            .get_mut(&user_id)
            .and_then(|sessions| sessions.get_mut(handle))
        else {
            return Ok(false);
        };
        *stamp = now_ms;
        Ok(true)
    }

    async fn remove_session(
        &self,
        user_id: UserId,
        handle: &str,
    ) -> Result<Option<usize>, StoreError> {
        let mut state = self.state();
        let (removed, remaining) = match state.sessions.get_mut(&user_id) {
            Some(sessions) => (sessions.remove(handle).is_some(), sessions.len()),
            None => (false, 0),
        };
        if remaining == 0 {
            state.sessions.remove(&user_id);
            state.online.remove(&user_id);
        }
        Ok(removed.then_some(remaining))
    }

    async fn live_sessions(
        &self,
        user_id: UserId,
        stale_before_ms: i64,
    ) -> Result<Vec<String>, StoreError> {
        let mut state = self.state();
        let live: Vec<String> = match state.sessions.get_mut(&user_id) {
            Some(sessions) => {
                sessions.retain(|_, stamp| *stamp >= stale_before_ms);
                let mut handles: Vec<String> = sessions.keys().cloned().collect();
                handles.sort();
                handles
            }
            None => Vec::new(),
        };
        if live.is_empty() {
            state.sessions.remove(&user_id);
            state.online.remove(&user_id);
        }
        Ok(live)
    }

    async fn online_users(&self) -> Result<Vec<UserId>, StoreError> {
        let mut users: Vec<UserId> = self.state().online.iter().copied().collect();
        users.sort();
        Ok(users)
    }

    async fn record_hit(
        &self,
        key: &str,
        now_ms: i64,
        window: Duration,
    ) -> Result<WindowState, StoreError> {
        let window_ms = i64::try_from(window.as_millis()).unwrap_or(i64::MAX);
        let mut state = self.state();
        // Expired windows are dropped wholesale, mirroring the key TTL.
        state
            .windows
            .retain(|_, hits| hits.back().is_some_and(|last| *last > now_ms - window_ms));
        let hits = state.windows.entry(key.to_string()).or_default();
        while hits.front().is_some_and(|first| *first <= now_ms - window_ms) {
            hits.pop_front();
        }
        hits.push_back(now_ms);
        Ok(WindowState {
            count: hits.len(),
            oldest_ms: hits.front().copied().unwrap_or(now_ms),
        })
    }

    async fn set_typing(
        &self,
        room_id: RoomId,
        user_id: UserId,
        now_ms: i64,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let expires = now_ms + i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX / 2);
        self.state()
            .typing
            .entry(room_id)
            .or_default()
            .insert(user_id, expires);
        Ok(())
    }

    async fn clear_typing(&self, room_id: RoomId, user_id: UserId) -> Result<bool, StoreError> {
        let mut state = self.state();
        let Some(room) = state.typing.get_mut(&room_id) else {
            return Ok(false);
        };
        let removed = room.remove(&user_id).is_some();
        if room.is_empty() {
            state.typing.remove(&room_id);
        }
        Ok(removed)
    }

    async fn typing_users(&self, room_id: RoomId, now_ms: i64) -> Result<Vec<UserId>, StoreError> {
        let mut state = self.state();
        let Some(room) = state.typing.get_mut(&room_id) else {
            return Ok(Vec::new());
        };
        room.retain(|_, expires| *expires > now_ms);
        Ok(room.keys().copied().collect())
    }

    async fn claim_busy(
        &self,
        user_id: UserId,
        call_id: &CallId,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut state = self.state();
        let now = Instant::now();
        if let Some((_, expires)) = state.busy.get(&user_id) {
            if *expires > now {
                return Ok(false);
            }
        }
        state.busy.insert(user_id, (call_id.clone(), now + ttl));
        Ok(true)
    }

    async fn busy_call(&self, user_id: UserId) -> Result<Option<CallId>, StoreError> {
        let mut state = self.state();
        let current = state.busy.get(&user_id).cloned();
        match current {
            Some((call_id, expires)) if expires > Instant::now() => Ok(Some(call_id)),
            Some(_) => {
                state.busy.remove(&user_id);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn release_busy(&self, user_id: UserId, call_id: &CallId) -> Result<bool, StoreError> {
        let mut state = self.state();
        let owned = state
            .busy
            .get(&user_id)
            .is_some_and(|(owner, _)| owner == call_id);
        if owned {
            state.busy.remove(&user_id);
        }
        Ok(owned)
    }

    async fn extend_busy(
        &self,
        user_id: UserId,
        call_id: &CallId,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut state = self.state();
        let now = Instant::now();
        match state.busy.get_mut(&user_id) {
            Some((owner, expires)) if owner == call_id && *expires > now => {
                *expires = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn put_call(&self, record: &CallRecord, ttl: Duration) -> Result<(), StoreError> {
        self.state().calls.insert(
            record.call_id.clone(),
            (record.clone(), Instant::now() + ttl),
        );
        Ok(())
    }

    async fn get_call(&self, call_id: &CallId) -> Result<Option<CallRecord>, StoreError> {
        let mut state = self.state();
        let current = state.calls.get(call_id).cloned();
        match current {
            Some((record, expires)) if expires > Instant::now() => Ok(Some(record)),
            Some(_) => {
                state.calls.remove(call_id);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn transition_call(
        &self,
        call_id: &CallId,
        expected: &[CallState],
        next: CallState,
    ) -> Result<CallTransition, StoreError> {
        let mut state = self.state();
        let expired = match state.calls.get(call_id) {
            Some((_, expires)) => *expires <= Instant::now(),
            None => return Ok(CallTransition::Missing),
        };
        if expired {
            state.calls.remove(call_id);
            return Ok(CallTransition::Missing);
        }
        let Some((record, _)) = state.calls.get_mut(call_id) else {
            return Ok(CallTransition::Missing);
        };
        if !expected.contains(&record.state) {
            return Ok(CallTransition::Mismatch(record.state));
        }
        record.state = next;
        Ok(CallTransition::Applied(record.clone()))
    }

    async fn answer_call(
        &self,
        call_id: &CallId,
        answered_at: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<CallTransition, StoreError> {
        let mut state = self.state();
        let now = Instant::now();
        let expired = match state.calls.get(call_id) {
            Some((_, expires)) => *expires <= now,
            None => return Ok(CallTransition::Missing),
        };
        if expired {
            state.calls.remove(call_id);
            return Ok(CallTransition::Missing);
        }
        let Some((record, expires)) = state.calls.get_mut(call_id) else {
            return Ok(CallTransition::Missing);
        };
        if record.state != CallState::Ringing {
            return Ok(CallTransition::Mismatch(record.state));
        }
        record.state = CallState::Active;
        record.answered_at = Some(answered_at);
        *expires = now + ttl;
        Ok(CallTransition::Applied(record.clone()))
    }

    async fn delete_call(&self, call_id: &CallId) -> Result<(), StoreError> {
        self.state().calls.remove(call_id);
        Ok(())
    }
}

#[async_trait]
impl PubSubTransport for MemoryStore {
    async fn publish(&self, channel: &str, payload: String) -> Result<(), StoreError> {
        let bus = lock(&self.bus);
        let sender = bus.as_ref().ok_or(StoreError::Disconnected)?;
        // No receivers just means no instance is listening yet.
        let _ = sender.send(BusMessage {
            channel: channel.to_string(),
            payload,
        });
        Ok(())
    }

    async fn subscribe(&self) -> Result<BusSubscription, StoreError> {
        let receiver = lock(&self.bus)
            .as_ref()
            .ok_or(StoreError::Disconnected)?
            .subscribe();
        let control = Arc::new(MemoryChannels::default());
        let channels = Arc::clone(&control.channels);
        let messages = BroadcastStream::new(receiver).filter_map(move |item| {
            let matched = match item {
                Ok(message) if lock(&channels).contains(&message.channel) => Some(message),
                Ok(_) => None,
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    warn!(skipped, "in-memory bus subscriber lagged");
                    None
                }
            };
            futures::future::ready(matched)
        });
        Ok(BusSubscription {
            control,
            messages: Box::pin(messages),
        })
    }
}

/// Channel filter of one in-process subscription. Changes apply immediately.
#[derive(Default)]
struct MemoryChannels {
    channels: Arc<Mutex<HashSet<String>>>,
}

impl ChannelControl for MemoryChannels {
    fn listen(&self, channel: &str) {
        lock(&self.channels).insert(channel.to_string());
    }

    fn unlisten(&self, channel: &str) {
        lock(&self.channels).remove(channel);
    }

    fn applied(&self) -> oneshot::Receiver<()> {
        let (done, applied) = oneshot::channel();
        let _ = done.send(());
        applied
    }
}
