use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use coordination::{keys, ChannelControl};
use shared::{
    domain::{ConnectionId, RoomId, UserId},
    protocol::OutboundFrame,
};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

use crate::bus::{BusEnvelope, BusHandler};

struct LocalConnection {
    user_id: UserId,
    outbound: mpsc::Sender<OutboundFrame>,
    rooms: HashSet<RoomId>,
}

#[derive(Default)]
struct HubState {
    connections: HashMap<ConnectionId, LocalConnection>,
    /// Admitted but not yet attached.
    reserved: HashSet<ConnectionId>,
    /// Local holders per bus channel.
    interest: HashMap<String, usize>,
    control: Option<Arc<dyn ChannelControl>>,
}

impl HubState {
    fn retain(&mut self, channel: String) {
        let holders = self.interest.entry(channel.clone()).or_insert(0);
        *holders += 1;
        if *holders == 1 {
            if let Some(control) = &self.control {
                control.listen(&channel);
            }
        }
    }

    fn release(&mut self, channel: &str) {
        let Some(holders) = self.interest.get_mut(channel) else {
            return;
        };
        *holders -= 1;
        if *holders == 0 {
            self.interest.remove(channel);
            if let Some(control) = &self.control {
                control.unlisten(channel);
            }
        }
    }

    fn release_connection(&mut self, conn: &LocalConnection) {
        self.release(&keys::user_channel(conn.user_id));
        for room_id in &conn.rooms {
            self.release(&keys::room_channel(*room_id));
        }
    }
}

/// Connections owned by this instance, and the routing of bus channels onto
/// their outbound queues. The instance listens on exactly the user and room
/// channels its connections hold.
#[derive(Clone, Default)]
pub struct LocalHub {
    state: Arc<RwLock<HubState>>,
}

/// A place under the connection budget, held from admission until the
/// connection is registered or the admission is abandoned.
#[derive(Clone)]
pub struct ConnectionSlot(Arc<SlotInner>);

struct SlotInner {
    hub: LocalHub,
    connection_id: ConnectionId,
}

impl ConnectionSlot {
    pub fn connection_id(&self) -> &ConnectionId {
        &self.0.connection_id
    }
}

impl fmt::Debug for ConnectionSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ConnectionSlot")
            .field(&self.0.connection_id)
            .finish()
    }
}

impl Drop for SlotInner {
    fn drop(&mut self) {
        self.hub.write().reserved.remove(&self.connection_id);
    }
}

impl LocalHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HubState> {
        self.state
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HubState> {
        self.state
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Claims a place for a new connection if fewer than `budget` are
    /// attached or pending.
    pub fn reserve(&self, budget: usize) -> Option<ConnectionSlot> {
        let mut state = self.write();
        if state.connections.len() + state.reserved.len() >= budget {
            return None;
        }
        let connection_id = ConnectionId::generate();
        state.reserved.insert(connection_id.clone());
        Some(ConnectionSlot(Arc::new(SlotInner {
            hub: self.clone(),
            connection_id,
        })))
    }

    /// Hands the channel set to a live subscription, listening on every
    /// channel already held.
    pub fn attach_channels(&self, control: Arc<dyn ChannelControl>) {
        let mut state = self.write();
        for channel in state.interest.keys() {
            control.listen(channel);
        }
        state.control = Some(control);
    }

    /// Waits until every channel change made so far is in effect.
    pub async fn channels_applied(&self) {
        let control = self.read().control.clone();
        if let Some(control) = control {
            let _ = control.applied().await;
        }
    }

    pub fn channels(&self) -> Vec<String> {
        let mut channels: Vec<String> = self.read().interest.keys().cloned().collect();
        channels.sort();
        channels
    }

    pub fn register(
        &self,
        connection_id: ConnectionId,
        user_id: UserId,
        outbound: mpsc::Sender<OutboundFrame>,
    ) {
        let mut state = self.write();
        state.reserved.remove(&connection_id);
        let replaced = state.connections.insert(
            connection_id,
            LocalConnection {
                user_id,
                outbound,
                rooms: HashSet::new(),
            },
        );
        if let Some(previous) = replaced {
            state.release_connection(&previous);
        }
        state.retain(keys::user_channel(user_id));
    }

    /// Returns the rooms the connection was in, or `None` when it was not
    /// registered here.
    pub fn unregister(&self, connection_id: &ConnectionId) -> Option<Vec<RoomId>> {
        let mut state = self.write();
        let conn = state.connections.remove(connection_id)?;
        state.release_connection(&conn);
        Some(conn.rooms.into_iter().collect())
    }

    pub fn len(&self) -> usize {
        self.read().connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().connections.is_empty()
    }

    pub fn is_connected(&self, connection_id: &ConnectionId) -> bool {
        self.read()
            .connections
            .get(connection_id)
            .is_some_and(|conn| !conn.outbound.is_closed())
    }

    pub fn is_registered(&self, connection_id: &ConnectionId) -> bool {
        self.read().connections.contains_key(connection_id)
    }

    /// Every registered connection with its user.
    pub fn owned(&self) -> Vec<(ConnectionId, UserId)> {
        self.read()
            .connections
            .iter()
            .map(|(id, conn)| (id.clone(), conn.user_id))
            .collect()
    }

    pub fn join(&self, connection_id: &ConnectionId, room_id: RoomId) -> bool {
        let mut state = self.write();
        let joined = match state.connections.get_mut(connection_id) {
            Some(conn) => conn.rooms.insert(room_id),
            None => return false,
        };
        if joined {
            state.retain(keys::room_channel(room_id));
        }
        true
    }

    pub fn leave(&self, connection_id: &ConnectionId, room_id: RoomId) -> bool {
        let mut state = self.write();
        let left = state
            .connections
            .get_mut(connection_id)
            .is_some_and(|conn| conn.rooms.remove(&room_id));
        if left {
            state.release(&keys::room_channel(room_id));
        }
        left
    }

    pub fn in_room(&self, connection_id: &ConnectionId, room_id: RoomId) -> bool {
        self.read()
            .connections
            .get(connection_id)
            .is_some_and(|conn| conn.rooms.contains(&room_id))
    }

    pub fn rooms_of(&self, connection_id: &ConnectionId) -> Vec<RoomId> {
        let mut rooms: Vec<RoomId> = self
            .read()
            .connections
            .get(connection_id)
            .map(|conn| conn.rooms.iter().copied().collect())
            .unwrap_or_default();
        rooms.sort();
        rooms
    }

    /// Queues a frame for one connection. `false` when it is gone.
    pub fn send_to(&self, connection_id: &ConnectionId, frame: OutboundFrame) -> bool {
        let outbound = match self.read().connections.get(connection_id) {
            Some(conn) => conn.outbound.clone(),
            None => return false,
        };
        enqueue(connection_id, &outbound, frame)
    }

    pub fn deliver(&self, channel: &str, envelope: &BusEnvelope) -> usize {
        let targets: Vec<(ConnectionId, mpsc::Sender<OutboundFrame>)> = {
            let state = self.read();
            let matches = |conn: &LocalConnection| match Target::parse(channel) {
                Some(Target::Room(room_id)) => conn.rooms.contains(&room_id),
                Some(Target::User(user_id)) => conn.user_id == user_id,
                None => false,
            };
            state
                .connections
                .iter()
                .filter(|(id, conn)| envelope.exclude.as_ref() != Some(*id) && matches(conn))
                .map(|(id, conn)| (id.clone(), conn.outbound.clone()))
                .collect()
        };
        targets
            .iter()
            .filter(|(id, outbound)| {
                enqueue(id, outbound, OutboundFrame::Event(envelope.event.clone()))
            })
            .count()
    }
}

fn enqueue(
    connection_id: &ConnectionId,
    outbound: &mpsc::Sender<OutboundFrame>,
    frame: OutboundFrame,
) -> bool {
    match outbound.try_send(frame) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            warn!(%connection_id, "outbound queue full, dropping frame");
            false
        }
        Err(TrySendError::Closed(_)) => {
            debug!(%connection_id, "outbound queue closed");
            false
        }
    }
}

enum Target {
    Room(RoomId),
    User(UserId),
}

impl Target {
    fn parse(channel: &str) -> Option<Self> {
        let (kind, id) = channel.split_once(':')?;
        let id = id.parse::<i64>().ok()?;
        match kind {
            "room" => Some(Target::Room(RoomId(id))),
            "user" => Some(Target::User(UserId(id))),
            _ => None,
        }
    }
}

impl BusHandler for LocalHub {
    fn handle(&self, channel: &str, envelope: BusEnvelope) {
        self.deliver(channel, &envelope);
    }
}

#[cfg(test)]
#[path = "tests/hub_tests.rs"]
mod tests;
