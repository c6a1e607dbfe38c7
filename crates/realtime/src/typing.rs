use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};

use coordination::{keys, now_ms};
use shared::{
    domain::{ConnectionId, RoomId, UserId},
    protocol::ServerEvent,
};
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use crate::{
    context::RealtimeContext, error::RealtimeError, rate_limit::RateLimiter, session::Session,
};

struct AutoStop {
    generation: u64,
    handle: AbortHandle,
}

#[derive(Default)]
struct Timers {
    next_generation: u64,
    pending: HashMap<(UserId, RoomId), AutoStop>,
}

/// Typing indicators. The flag itself lives in the coordination store with a
/// short TTL; this instance only keeps the auto-stop timers for its users.
#[derive(Clone)]
pub struct TypingAggregator {
    ctx: RealtimeContext,
    limiter: RateLimiter,
    timers: Arc<Mutex<Timers>>,
}

impl TypingAggregator {
    pub fn new(ctx: RealtimeContext, limiter: RateLimiter) -> Self {
        Self {
            ctx,
            limiter,
            timers: Arc::new(Mutex::new(Timers::default())),
        }
    }

    fn timers(&self) -> MutexGuard<'_, Timers> {
        self.timers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Refreshes the flag and the auto-stop timer on every call, but only
    /// broadcasts `typing:start` when the per-room rate limit allows.
    pub async fn start(&self, session: &Session, room_id: RoomId) -> Result<bool, RealtimeError> {
        if !self.ctx.hub.in_room(&session.connection_id, room_id) {
            return Err(RealtimeError::Authorization(format!(
                "not joined to room {room_id}"
            )));
        }
        let user_id = session.user_id;
        let decision = self
            .limiter
            .check(
                "typing",
                &format!("{user_id}:{room_id}"),
                self.ctx.config.typing_limit,
            )
            .await?;
        self.ctx
            .store
            .set_typing(room_id, user_id, now_ms(), self.ctx.config.typing_ttl)
            .await?;
        self.arm(user_id, room_id);

        if !decision.allowed {
            debug!(%user_id, %room_id, "typing start debounced");
            return Ok(false);
        }
        self.ctx
            .bus
            .publish_excluding(
                &keys::room_channel(room_id),
                ServerEvent::TypingStart { room_id, user_id },
                Some(session.connection_id.clone()),
            )
            .await?;
        Ok(true)
    }

    /// Clears the flag and any pending timer. Broadcasts `typing:stop` only
    /// when the user was actually typing.
    pub async fn stop(&self, session: &Session, room_id: RoomId) -> Result<bool, RealtimeError> {
        self.stop_user(
            session.user_id,
            room_id,
            Some(session.connection_id.clone()),
        )
        .await
    }

    async fn stop_user(
        &self,
        user_id: UserId,
        room_id: RoomId,
        exclude: Option<ConnectionId>,
    ) -> Result<bool, RealtimeError> {
        let had_timer = self.disarm(user_id, room_id);
        let had_flag = self.ctx.store.clear_typing(room_id, user_id).await?;
        if !(had_timer || had_flag) {
            return Ok(false);
        }
        self.ctx
            .bus
            .publish_excluding(
                &keys::room_channel(room_id),
                ServerEvent::TypingStop { room_id, user_id },
                exclude,
            )
            .await?;
        Ok(true)
    }

    /// Side effect of sending a message; failures are only logged.
    pub async fn clear_after_send(&self, session: &Session, room_id: RoomId) {
        if let Err(error) = self.stop(session, room_id).await {
            warn!(user_id = %session.user_id, %room_id, %error, "typing cleanup after send failed");
        }
    }

    /// Cancels every pending timer of the user and clears their flags.
    pub async fn cancel_all_for(&self, user_id: UserId) -> Vec<RoomId> {
        let rooms: Vec<RoomId> = {
            let mut timers = self.timers();
            let keys: Vec<(UserId, RoomId)> = timers
                .pending
                .keys()
                .filter(|(owner, _)| *owner == user_id)
                .copied()
                .collect();
            keys.into_iter()
                .filter_map(|key| timers.pending.remove(&key).map(|timer| (key, timer)))
                .map(|((_, room_id), timer)| {
                    timer.handle.abort();
                    room_id
                })
                .collect()
        };
        for room_id in &rooms {
            if let Err(error) = self.stop_user(user_id, *room_id, None).await {
                warn!(%user_id, %room_id, %error, "typing cleanup on disconnect failed");
            }
        }
        rooms
    }

    pub async fn typing_in(&self, room_id: RoomId) -> Result<Vec<UserId>, RealtimeError> {
        Ok(self.ctx.store.typing_users(room_id, now_ms()).await?)
    }

    pub fn pending_timers(&self) -> usize {
        self.timers().pending.len()
    }

    fn arm(&self, user_id: UserId, room_id: RoomId) {
        let mut timers = self.timers();
        timers.next_generation += 1;
        let generation = timers.next_generation;
        let delay = self.ctx.config.typing_auto_stop;
        let this = self.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            this.expire(user_id, room_id, generation).await;
        });
        let replaced = timers.pending.insert(
            (user_id, room_id),
            AutoStop {
                generation,
                handle: task.abort_handle(),
            },
        );
        if let Some(previous) = replaced {
            previous.handle.abort();
        }
    }

    fn disarm(&self, user_id: UserId, room_id: RoomId) -> bool {
        match self.timers().pending.remove(&(user_id, room_id)) {
            Some(timer) => {
                timer.handle.abort();
                true
            }
            None => false,
        }
    }

    async fn expire(&self, user_id: UserId, room_id: RoomId, generation: u64) {
        {
            let mut timers = self.timers();
            let current = timers
                .pending
                .get(&(user_id, room_id))
                .is_some_and(|timer| timer.generation == generation);
            if !current {
                return;
            }
            // Removed without aborting: this task is the one running.
            timers.pending.remove(&(user_id, room_id));
        }
        debug!(%user_id, %room_id, "typing auto-stop");
        if let Err(error) = self.stop_user(user_id, room_id, None).await {
            warn!(%user_id, %room_id, %error, "typing auto-stop failed");
        }
    }
}

#[cfg(test)]
#[path = "tests/typing_tests.rs"]
mod tests;
