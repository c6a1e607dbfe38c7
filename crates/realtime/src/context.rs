use std::sync::Arc;

use coordination::CoordinationStore;
use shared::domain::InstanceId;
use storage::MessageRepository;

use crate::{bus::FanoutBus, config::RealtimeConfig, hub::LocalHub};

/// Collaborators every component of one instance shares.
#[derive(Clone)]
pub struct RealtimeContext {
    pub config: Arc<RealtimeConfig>,
    pub instance_id: InstanceId,
    pub repo: Arc<dyn MessageRepository>,
    pub store: Arc<dyn CoordinationStore>,
    pub bus: FanoutBus,
    pub hub: LocalHub,
}
