//! Shared relay state.
//!
//! DESIGN
//! ======
//! `AppState` is injected into Axum handlers via the `State` extractor. It
//! holds the live rooms, each a map of connected clients to the sender half
//! of their outbound queue. The relay never interprets replication frames:
//! it stamps the room and the authenticated sender, then fans the frame out
//! to every other client in the room.
//!
//! A client is one connection. The same participant may hold several (a
//! reconnect racing the old socket's teardown); fan-out skips all of them.
//!
//! Delivery is best-effort per client: a client whose queue is full misses
//! the frame and everyone else still gets it. Frames from one sender go out
//! in the order they arrived.

use std::collections::HashMap;
use std::sync::Arc;

use frames::Frame;
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::board::object::ParticipantId;
use crate::services::transport::Link;

/// One live connection.
pub type ClientId = Uuid;

// =============================================================================
// ROOM
// =============================================================================

#[derive(Debug)]
pub struct Client {
    pub participant: ParticipantId,
    pub tx: mpsc::Sender<Frame>,
}

/// Clients connected to one room.
#[derive(Debug, Default)]
pub struct Room {
    pub clients: HashMap<ClientId, Client>,
}

// =============================================================================
// APP STATE
// =============================================================================

#[derive(Clone)]
pub struct AppState {
    pub rooms: Arc<RwLock<HashMap<String, Room>>>,
    pub client_queue_capacity: usize,
}

impl AppState {
    #[must_use]
    pub fn new(client_queue_capacity: usize) -> Self {
        Self { rooms: Arc::new(RwLock::new(HashMap::new())), client_queue_capacity: client_queue_capacity.max(1) }
    }

    /// Register a connection and return its id and inbound queue.
    pub async fn join(&self, room: &str, participant: ParticipantId) -> (ClientId, mpsc::Receiver<Frame>) {
        let client_id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(self.client_queue_capacity);
        let mut rooms = self.rooms.write().await;
        let entry = rooms.entry(room.to_owned()).or_default();
        entry.clients.insert(client_id, Client { participant, tx });
        info!(room, %participant, %client_id, clients = entry.clients.len(), "relay: client joined");
        (client_id, rx)
    }

    /// Drop a connection. Empty rooms are evicted.
    pub async fn leave(&self, room: &str, client_id: ClientId) {
        let mut rooms = self.rooms.write().await;
        let Some(entry) = rooms.get_mut(room) else {
            return;
        };
        if let Some(client) = entry.clients.remove(&client_id) {
            info!(room, participant = %client.participant, %client_id, "relay: client left");
        }
        if entry.clients.is_empty() {
            rooms.remove(room);
            debug!(room, "relay: room evicted");
        }
    }

    /// Stamp `frame` with the room and sender, then queue it for every other
    /// participant in the room. Returns how many clients received it.
    pub async fn broadcast(&self, room: &str, sender: ParticipantId, mut frame: Frame) -> usize {
        frame.room = Some(room.to_owned());
        frame.sender = sender.to_string();

        let rooms = self.rooms.read().await;
        let Some(entry) = rooms.get(room) else {
            return 0;
        };
        let mut delivered = 0;
        for (client_id, client) in &entry.clients {
            if client.participant == sender {
                continue;
            }
            match client.tx.try_send(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(room, %client_id, kind = frame.kind.as_str(), "relay: client queue full; frame dropped");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!(room, %client_id, "relay: client queue closed");
                }
            }
        }
        delivered
    }

    /// Attach an in-process participant to a room. Frames it sends are
    /// relayed like any websocket client's; the membership ends when the
    /// participant drops its outbound sender.
    pub async fn join_local(&self, room: &str, participant: ParticipantId) -> Link {
        let (client_id, inbound) = self.join(room, participant).await;
        let (outbound, mut rx) = mpsc::channel::<Frame>(self.client_queue_capacity);
        let state = self.clone();
        let room = room.to_owned();
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                state.broadcast(&room, participant, frame).await;
            }
            state.leave(&room, client_id).await;
        });
        Link { outbound, inbound }
    }

    /// Connections currently in `room`.
    pub async fn room_size(&self, room: &str) -> usize {
        self.rooms.read().await.get(room).map_or(0, |entry| entry.clients.len())
    }
}

#[cfg(test)]
#[path = "state_test.rs"]
mod tests;
