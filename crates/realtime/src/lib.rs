//! Real-time delivery and coordination layer: admission, presence, message
//! delivery with receipts and offline replay, typing indicators and call
//! signaling, coordinated across instances through a shared store and bus.

use std::{sync::Arc, time::Duration};

use coordination::{CoordinationStore, PubSubTransport, StoreError};
use shared::domain::InstanceId;
use storage::MessageRepository;
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tracing::debug;

pub mod auth;
pub mod bus;
pub mod calls;
pub mod config;
pub mod context;
pub mod delivery;
mod dispatcher;
pub mod error;
pub mod gatekeeper;
pub mod hub;
pub mod presence;
pub mod rate_limit;
pub mod session;
pub mod typing;

use bus::{BusEnvelope, BusHandler, FanoutBus};
use calls::CallSignaling;
use config::RealtimeConfig;
use context::RealtimeContext;
use delivery::DeliveryPipeline;
use error::RealtimeError;
use gatekeeper::Gatekeeper;
use hub::LocalHub;
use presence::PresenceTracker;
use rate_limit::RateLimiter;
use session::SessionRegistry;
use typing::TypingAggregator;

pub use auth::JwtAuthenticator;
pub use session::Session;

/// One server instance's real-time layer, wired once per process and shared
/// by every connection task.
#[derive(Clone)]
pub struct Realtime {
    ctx: RealtimeContext,
    gatekeeper: Gatekeeper,
    presence: PresenceTracker,
    delivery: DeliveryPipeline,
    typing: TypingAggregator,
    calls: CallSignaling,
}

impl Realtime {
    pub fn new(
        config: RealtimeConfig,
        instance_id: InstanceId,
        repo: Arc<dyn MessageRepository>,
        store: Arc<dyn CoordinationStore>,
        transport: Arc<dyn PubSubTransport>,
        auth: JwtAuthenticator,
    ) -> Self {
        let ctx = RealtimeContext {
            config: Arc::new(config),
            bus: FanoutBus::new(transport, instance_id.clone()),
            instance_id,
            repo,
            store: Arc::clone(&store),
            hub: LocalHub::new(),
        };
        let limiter = RateLimiter::new(store);
        let registry = SessionRegistry::new(Arc::clone(&ctx.store), ctx.config.session_ttl);
        let presence = PresenceTracker::new(ctx.clone(), registry);
        let typing = TypingAggregator::new(ctx.clone(), limiter.clone());
        let delivery = DeliveryPipeline::new(ctx.clone(), limiter.clone(), typing.clone());
        let calls = CallSignaling::new(ctx.clone(), presence.clone());
        let gatekeeper = Gatekeeper::new(
            ctx.clone(),
            auth,
            limiter,
            presence.clone(),
            delivery.clone(),
            typing.clone(),
            calls.clone(),
        );
        Self {
            ctx,
            gatekeeper,
            presence,
            delivery,
            typing,
            calls,
        }
    }

    /// Opens the bus subscription, which from then on follows the user and
    /// room channels of local connections, and starts refreshing local
    /// sessions. Admission stays closed until this succeeds.
    pub async fn start(&self) -> Result<JoinHandle<()>, StoreError> {
        let router = Arc::new(BusRouter {
            hub: self.ctx.hub.clone(),
            calls: self.calls.clone(),
        });
        let (channels, listener) = self.ctx.bus.subscribe(router).await?;
        self.ctx.hub.attach_channels(channels);
        self.spawn_session_refresh();
        Ok(listener)
    }

    fn spawn_session_refresh(&self) {
        let presence = self.presence.clone();
        let period = (self.ctx.config.session_ttl / 3).max(Duration::from_millis(10));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let refreshed = presence.refresh_local().await;
                debug!(refreshed, "local sessions refreshed");
            }
        });
    }

    /// Healthy when the repository answers and the bus is subscribed.
    pub async fn health(&self) -> Result<(), RealtimeError> {
        if !self.ctx.bus.is_healthy() {
            return Err(RealtimeError::Unavailable("fan-out bus disconnected".into()));
        }
        self.ctx.repo.health_check().await?;
        Ok(())
    }

    pub fn config(&self) -> &RealtimeConfig {
        &self.ctx.config
    }

    pub fn instance_id(&self) -> &InstanceId {
        &self.ctx.instance_id
    }

    pub fn hub(&self) -> &LocalHub {
        &self.ctx.hub
    }

    pub fn gatekeeper(&self) -> &Gatekeeper {
        &self.gatekeeper
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    pub fn delivery(&self) -> &DeliveryPipeline {
        &self.delivery
    }

    pub fn typing(&self) -> &TypingAggregator {
        &self.typing
    }

    pub fn calls(&self) -> &CallSignaling {
        &self.calls
    }
}

/// Routes bus traffic onto local connections. Terminal call events also
/// retire any ring timer this instance holds for the call.
struct BusRouter {
    hub: LocalHub,
    calls: CallSignaling,
}

impl BusHandler for BusRouter {
    fn handle(&self, channel: &str, envelope: BusEnvelope) {
        if let Some(call_id) = envelope.event.settled_call() {
            self.calls.cancel_ring_timer(call_id);
        }
        self.hub.deliver(channel, &envelope);
    }
}

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod support;
