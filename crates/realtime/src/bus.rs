use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, OnceLock,
};

use coordination::{BusSubscription, ChannelControl, PubSubTransport, StoreError};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use shared::{
    domain::{ConnectionId, InstanceId},
    protocol::ServerEvent,
};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// What travels on a bus channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusEnvelope {
    pub origin: InstanceId,
    /// Connection that must not receive the event, typically the sender,
    /// who is answered directly instead.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclude: Option<ConnectionId>,
    pub event: ServerEvent,
}

pub trait BusHandler: Send + Sync {
    fn handle(&self, channel: &str, envelope: BusEnvelope);
}

/// Cross-instance publish/subscribe. Every event goes through the shared
/// transport, including those whose recipients are local, so there is one
/// delivery path regardless of where a recipient is connected. Only when the
/// transport rejects a publish is the event handed to the local handler
/// directly.
#[derive(Clone)]
pub struct FanoutBus {
    transport: Arc<dyn PubSubTransport>,
    instance_id: InstanceId,
    healthy: Arc<AtomicBool>,
    local: Arc<OnceLock<Arc<dyn BusHandler>>>,
}

impl FanoutBus {
    pub fn new(transport: Arc<dyn PubSubTransport>, instance_id: InstanceId) -> Self {
        Self {
            transport,
            instance_id,
            healthy: Arc::new(AtomicBool::new(false)),
            local: Arc::new(OnceLock::new()),
        }
    }

    /// `false` until a subscription is running and again once it is lost.
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    pub async fn publish(&self, channel: &str, event: ServerEvent) -> Result<(), StoreError> {
        self.publish_excluding(channel, event, None).await
    }

    pub async fn publish_excluding(
        &self,
        channel: &str,
        event: ServerEvent,
        exclude: Option<ConnectionId>,
    ) -> Result<(), StoreError> {
        let envelope = BusEnvelope {
            origin: self.instance_id.clone(),
            exclude,
            event,
        };
        let payload =
            serde_json::to_string(&envelope).map_err(|e| StoreError::Corrupt(e.to_string()))?;
        if let Err(error) = self.transport.publish(channel, payload).await {
            if let Some(local) = self.local.get() {
                local.handle(channel, envelope);
            }
            return Err(error);
        }
        Ok(())
    }

    /// Opens the subscription and starts the listener task. The returned
    /// control decides which channels arrive; it starts with none. When the
    /// subscription ends the bus reports unhealthy, which closes admission;
    /// local delivery keeps working.
    pub async fn subscribe(
        &self,
        handler: Arc<dyn BusHandler>,
    ) -> Result<(Arc<dyn ChannelControl>, JoinHandle<()>), StoreError> {
        let BusSubscription {
            control,
            mut messages,
        } = self.transport.subscribe().await?;
        let _ = self.local.set(Arc::clone(&handler));
        self.healthy.store(true, Ordering::SeqCst);
        info!(instance_id = %self.instance_id, "fan-out bus subscribed");

        let healthy = Arc::clone(&self.healthy);
        let instance_id = self.instance_id.clone();
        let listener = tokio::spawn(async move {
            while let Some(message) = messages.next().await {
                match serde_json::from_str::<BusEnvelope>(&message.payload) {
                    Ok(envelope) => handler.handle(&message.channel, envelope),
                    Err(error) => {
                        warn!(channel = %message.channel, %error, "dropping undecodable bus message")
                    }
                }
            }
            healthy.store(false, Ordering::SeqCst);
            error!(%instance_id, "fan-out bus subscription lost; refusing new connections");
        });
        Ok((control, listener))
    }
}

#[cfg(test)]
#[path = "tests/bus_tests.rs"]
mod tests;
