use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use coordination::{keys, StoreError};
use shared::{
    domain::{PresenceStatus, UserId},
    protocol::ServerEvent,
};
use tracing::{debug, warn};

use crate::{
    context::RealtimeContext,
    error::RealtimeError,
    session::{session_handle, Session, SessionRegistry},
};

/// Online/offline derived from live sessions, with `busy` as an overlay set
/// by call signaling. Transitions are announced in every room of the user.
#[derive(Clone)]
pub struct PresenceTracker {
    ctx: RealtimeContext,
    registry: SessionRegistry,
}

impl PresenceTracker {
    pub fn new(ctx: RealtimeContext, registry: SessionRegistry) -> Self {
        Self { ctx, registry }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Registers the session. Only the first session of a user announces
    /// `online`; returns whether this call did.
    pub async fn mark_online(&self, session: &Session) -> Result<bool, StoreError> {
        let count = self.registry.register(session).await?;
        debug!(user_id = %session.user_id, count, "session registered");
        if count != 1 {
            return Ok(false);
        }
        self.broadcast(session.user_id, PresenceStatus::Online, None)
            .await;
        Ok(true)
    }

    /// Idempotent. The removal and the count are one atomic store step, so a
    /// concurrent reconnect is never lost; `offline` is announced only when
    /// nothing remains. `was_attached` says this instance held the connection
    /// until now: a missing entry then means it was pruned as stale rather
    /// than already released. Returns whether the user went offline.
    pub async fn mark_offline(
        &self,
        session: &Session,
        was_attached: bool,
    ) -> Result<bool, StoreError> {
        let remaining = match self.registry.release(session).await? {
            Some(remaining) => remaining,
            None if was_attached => self.registry.live_handles(session.user_id).await?.len(),
            None => return Ok(false),
        };
        if remaining > 0 {
            debug!(user_id = %session.user_id, remaining, "session released");
            return Ok(false);
        }
        let last_seen = Utc::now();
        if let Err(error) = self.ctx.repo.update_last_seen(session.user_id, last_seen).await {
            warn!(user_id = %session.user_id, %error, "failed to update last seen");
        }
        self.broadcast(session.user_id, PresenceStatus::Offline, Some(last_seen))
            .await;
        Ok(true)
    }

    /// Refreshes every session held by this instance so an open connection
    /// never ages out between client heartbeats. Entries already pruned are
    /// put back without an announcement. Returns how many were refreshed.
    pub async fn refresh_local(&self) -> usize {
        let mut refreshed = 0;
        for (connection_id, user_id) in self.ctx.hub.owned() {
            let handle = session_handle(&self.ctx.instance_id, &connection_id);
            let outcome = match self.registry.touch_handle(user_id, &handle).await {
                Ok(true) => Ok(()),
                Ok(false) if self.ctx.hub.is_registered(&connection_id) => {
                    debug!(%user_id, %connection_id, "restoring pruned session");
                    self.registry.restore_handle(user_id, &handle).await.map(|_| ())
                }
                Ok(false) => continue,
                Err(error) => Err(error),
            };
            match outcome {
                Ok(()) => refreshed += 1,
                Err(error) => warn!(%user_id, %connection_id, %error, "session refresh failed"),
            }
        }
        refreshed
    }

    pub async fn is_online(&self, user_id: UserId) -> Result<bool, StoreError> {
        Ok(!self.registry.live_handles(user_id).await?.is_empty())
    }

    pub async fn list_online_session_handles(
        &self,
        user_id: UserId,
    ) -> Result<BTreeSet<String>, StoreError> {
        Ok(self.registry.live_handles(user_id).await?.into_iter().collect())
    }

    pub async fn online_users(&self) -> Result<Vec<UserId>, RealtimeError> {
        Ok(self.ctx.store.online_users().await?)
    }

    /// Announces the busy overlay or its removal. Restoring `online` is
    /// skipped for users with no live session.
    pub async fn set_busy(&self, user_id: UserId, busy: bool) {
        if busy {
            self.broadcast(user_id, PresenceStatus::Busy, None).await;
            return;
        }
        match self.is_online(user_id).await {
            Ok(true) => self.broadcast(user_id, PresenceStatus::Online, None).await,
            Ok(false) => {}
            Err(error) => warn!(%user_id, %error, "presence lookup failed"),
        }
    }

    async fn broadcast(
        &self,
        user_id: UserId,
        status: PresenceStatus,
        last_seen: Option<DateTime<Utc>>,
    ) {
        let rooms = match self.ctx.repo.rooms_for_user(user_id).await {
            Ok(rooms) => rooms,
            Err(error) => {
                warn!(%user_id, %error, "cannot resolve rooms for presence broadcast");
                return;
            }
        };
        let event = ServerEvent::PresenceChange {
            user_id,
            status,
            last_seen,
        };
        for room_id in rooms {
            if let Err(error) = self
                .ctx
                .bus
                .publish(&keys::room_channel(room_id), event.clone())
                .await
            {
                warn!(%user_id, %room_id, %error, "presence broadcast failed");
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/presence_tests.rs"]
mod tests;
