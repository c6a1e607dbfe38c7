use std::net::IpAddr;

use chrono::Utc;
use shared::{
    domain::RoomId,
    protocol::{OutboundFrame, ServerEvent},
};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{info, warn};

use crate::{
    auth::JwtAuthenticator, calls::CallSignaling, context::RealtimeContext,
    delivery::DeliveryPipeline, error::RealtimeError, presence::PresenceTracker,
    rate_limit::RateLimiter, session::Session, typing::TypingAggregator,
};

/// Result of attaching an admitted session to its transport.
pub struct Attachment {
    pub rooms: Vec<RoomId>,
    /// Background offline replay for this connection.
    pub replay: JoinHandle<()>,
}

#[derive(Clone)]
pub struct Gatekeeper {
    ctx: RealtimeContext,
    auth: JwtAuthenticator,
    limiter: RateLimiter,
    presence: PresenceTracker,
    delivery: DeliveryPipeline,
    typing: TypingAggregator,
    calls: CallSignaling,
}

impl Gatekeeper {
    pub fn new(
        ctx: RealtimeContext,
        auth: JwtAuthenticator,
        limiter: RateLimiter,
        presence: PresenceTracker,
        delivery: DeliveryPipeline,
        typing: TypingAggregator,
        calls: CallSignaling,
    ) -> Self {
        Self {
            ctx,
            auth,
            limiter,
            presence,
            delivery,
            typing,
            calls,
        }
    }

    /// Decides whether a connection attempt may proceed. Nothing about the
    /// user is touched until the credential checks out.
    pub async fn admit(
        &self,
        token: Option<&str>,
        remote_addr: Option<IpAddr>,
    ) -> Result<Session, RealtimeError> {
        if !self.ctx.bus.is_healthy() {
            return Err(RealtimeError::Unavailable(
                "fan-out bus disconnected, not accepting connections".into(),
            ));
        }
        let identity = self.auth.authenticate(token.unwrap_or_default())?;

        let config = &self.ctx.config;
        self.limiter
            .enforce(
                "connect",
                self.ctx.instance_id.as_str(),
                config.admission_global_limit,
            )
            .await?;
        if let Some(addr) = remote_addr {
            self.limiter
                .enforce("connect_addr", &addr.to_string(), config.admission_address_limit)
                .await?;
        }
        let Some(slot) = self.ctx.hub.reserve(config.connection_budget) else {
            return Err(RealtimeError::Unavailable(
                "instance connection budget exhausted".into(),
            ));
        };

        Ok(Session {
            connection_id: slot.connection_id().clone(),
            user_id: identity.user_id,
            username: identity.username,
            instance_id: self.ctx.instance_id.clone(),
            remote_addr,
            connected_at: Utc::now(),
            slot,
        })
    }

    /// Registers the session, joins the user's rooms, announces presence and
    /// starts the offline replay.
    pub async fn attach(
        &self,
        session: &Session,
        outbound: mpsc::Sender<OutboundFrame>,
    ) -> Result<Attachment, RealtimeError> {
        let connection_id = &session.connection_id;
        self.ctx
            .hub
            .register(connection_id.clone(), session.user_id, outbound);

        let rooms = match self.ctx.repo.rooms_for_user(session.user_id).await {
            Ok(rooms) => rooms,
            Err(error) => {
                self.ctx.hub.unregister(connection_id);
                return Err(error.into());
            }
        };
        for room_id in &rooms {
            self.ctx.hub.join(connection_id, *room_id);
        }
        self.ctx.hub.channels_applied().await;
        if let Err(error) = self.presence.mark_online(session).await {
            self.ctx.hub.unregister(connection_id);
            return Err(error.into());
        }

        self.ctx.hub.send_to(
            connection_id,
            OutboundFrame::Event(ServerEvent::SessionReady {
                connection_id: connection_id.clone(),
                user_id: session.user_id,
                instance_id: session.instance_id.clone(),
                rooms: rooms.clone(),
            }),
        );

        let delivery = self.delivery.clone();
        let replay_session = session.clone();
        let replay = tokio::spawn(async move {
            if let Err(error) = delivery.replay_offline(&replay_session).await {
                warn!(user_id = %replay_session.user_id, %error, "offline replay failed");
            }
        });

        info!(
            user_id = %session.user_id,
            %connection_id,
            rooms = rooms.len(),
            "connection attached"
        );
        Ok(Attachment { rooms, replay })
    }

    /// Teardown never fails; secondary cleanup errors are only logged.
    pub async fn disconnect(&self, session: &Session) {
        let user_id = session.user_id;
        let was_attached = self.ctx.hub.unregister(&session.connection_id).is_some();
        self.typing.cancel_all_for(user_id).await;

        let went_offline = match self.presence.mark_offline(session, was_attached).await {
            Ok(went_offline) => went_offline,
            Err(error) => {
                warn!(%user_id, connection_id = %session.connection_id, %error, "failed to release session");
                false
            }
        };
        if went_offline {
            if let Err(error) = self.calls.abandon(user_id).await {
                warn!(%user_id, %error, "failed to end call on disconnect");
            }
        }
        info!(%user_id, connection_id = %session.connection_id, went_offline, "connection closed");
    }
}

#[cfg(test)]
#[path = "tests/gatekeeper_tests.rs"]
mod tests;
