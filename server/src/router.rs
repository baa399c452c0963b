use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};
use youplace_shared::{Pixel, RoomKey, RoomTiling, ServerMessage, Viewport};

use crate::state::ObservabilityCounters;

pub type ClientId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewportError {
    UnknownClient,
    TooLarge { rooms: u64, max: u64 },
}

impl fmt::Display for ViewportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownClient => f.write_str("client is not registered"),
            Self::TooLarge { rooms, max } => {
                write!(f, "viewport spans {rooms} rooms (max {max}); zoom in to see pixels")
            }
        }
    }
}

impl std::error::Error for ViewportError {}

/// Rooms entered and left by one viewport change.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RoomDiff {
    pub joined: Vec<RoomKey>,
    pub left: Vec<RoomKey>,
}

impl RoomDiff {
    pub fn is_empty(&self) -> bool {
        self.joined.is_empty() && self.left.is_empty()
    }
}

/// Receiving half of a connection's outbound queue.
pub struct ClientReceiver {
    pub rx: mpsc::Receiver<Bytes>,
    lagged: Arc<AtomicBool>,
}

impl ClientReceiver {
    /// Returns true once after the queue overflowed; the caller owes the client a snapshot.
    pub fn take_lagged(&self) -> bool {
        self.lagged.swap(false, Ordering::AcqRel)
    }
}

struct ClientEntry {
    user_id: Option<String>,
    tx: mpsc::Sender<Bytes>,
    lagged: Arc<AtomicBool>,
    viewport: Option<Viewport>,
    rooms: HashSet<RoomKey>,
}

enum Delivery {
    Queued,
    Dropped,
    Closed,
}

/// Room membership and fan-out for live connections.
///
/// Lock order is client entry before room entry. Fan-out copies the member set
/// out of the room map before touching any client, so it never holds both.
pub struct ViewportRouter {
    tiling: RoomTiling,
    max_rooms_per_client: u64,
    queue_capacity: usize,
    next_client_id: AtomicU64,
    clients: DashMap<ClientId, ClientEntry>,
    rooms: DashMap<RoomKey, HashSet<ClientId>>,
    users: DashMap<String, HashSet<ClientId>>,
    observability: Arc<ObservabilityCounters>,
}

impl ViewportRouter {
    pub fn new(
        tiling: RoomTiling,
        max_rooms_per_client: u64,
        queue_capacity: usize,
        observability: Arc<ObservabilityCounters>,
    ) -> Self {
        Self {
            tiling,
            max_rooms_per_client: max_rooms_per_client.max(1),
            queue_capacity: queue_capacity.max(1),
            next_client_id: AtomicU64::new(1),
            clients: DashMap::new(),
            rooms: DashMap::new(),
            users: DashMap::new(),
            observability,
        }
    }

    pub const fn tiling(&self) -> RoomTiling {
        self.tiling
    }

    pub fn register(&self, user_id: Option<String>) -> (ClientId, ClientReceiver) {
        let client_id = self.next_client_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let lagged = Arc::new(AtomicBool::new(false));

        if let Some(user_id) = user_id.as_ref() {
            self.users
                .entry(user_id.clone())
                .or_default()
                .insert(client_id);
        }
        self.clients.insert(
            client_id,
            ClientEntry {
                user_id,
                tx,
                lagged: Arc::clone(&lagged),
                viewport: None,
                rooms: HashSet::new(),
            },
        );
        debug!(client_id, "client registered");

        (client_id, ClientReceiver { rx, lagged })
    }

    pub fn unregister(&self, client_id: ClientId) {
        let Some((_, entry)) = self.clients.remove(&client_id) else {
            return;
        };
        for room in &entry.rooms {
            self.leave_room(*room, client_id);
        }
        if let Some(user_id) = entry.user_id.as_ref() {
            self.users.remove_if_mut(user_id, |_, tabs| {
                tabs.remove(&client_id);
                tabs.is_empty()
            });
        }
        debug!(client_id, rooms = entry.rooms.len(), "client unregistered");
    }

    /// Replace the client's viewport and diff-join the overlapping rooms.
    ///
    /// A viewport covering more than the room cap leaves every room.
    pub fn update_viewport(
        &self,
        client_id: ClientId,
        viewport: Viewport,
    ) -> Result<RoomDiff, ViewportError> {
        let viewport = viewport.normalized();
        let mut entry = self
            .clients
            .get_mut(&client_id)
            .ok_or(ViewportError::UnknownClient)?;

        let room_count = self.tiling.room_count(&viewport);
        if room_count > self.max_rooms_per_client {
            entry.viewport = None;
            let left: Vec<RoomKey> = entry.rooms.drain().collect();
            for room in &left {
                self.leave_room(*room, client_id);
            }
            return Err(ViewportError::TooLarge {
                rooms: room_count,
                max: self.max_rooms_per_client,
            });
        }

        let wanted: HashSet<RoomKey> = self.tiling.rooms_for(&viewport).into_iter().collect();
        let mut diff = RoomDiff::default();
        for room in entry.rooms.difference(&wanted) {
            diff.left.push(*room);
        }
        for room in wanted.difference(&entry.rooms) {
            diff.joined.push(*room);
        }
        diff.joined.sort_unstable();
        diff.left.sort_unstable();

        for room in &diff.left {
            self.leave_room(*room, client_id);
        }
        for room in &diff.joined {
            self.rooms.entry(*room).or_default().insert(client_id);
        }
        entry.rooms = wanted;
        entry.viewport = Some(viewport);

        Ok(diff)
    }

    /// Drop all room memberships, e.g. when the viewport left the grid.
    pub fn clear_viewport(&self, client_id: ClientId) -> Result<RoomDiff, ViewportError> {
        let mut entry = self
            .clients
            .get_mut(&client_id)
            .ok_or(ViewportError::UnknownClient)?;
        entry.viewport = None;
        let mut left: Vec<RoomKey> = entry.rooms.drain().collect();
        left.sort_unstable();
        for room in &left {
            self.leave_room(*room, client_id);
        }
        Ok(RoomDiff {
            joined: Vec::new(),
            left,
        })
    }

    /// Queue a `pixels_update` for every member of the pixel's room. Never blocks.
    ///
    /// Returns the number of connections the event was queued for.
    pub fn broadcast(&self, pixel: &Pixel) -> usize {
        let room = self.tiling.room_of(pixel.cell);
        let members: Vec<ClientId> = match self.rooms.get(&room) {
            Some(members) => members.iter().copied().collect(),
            None => return 0,
        };
        if members.is_empty() {
            return 0;
        }

        let Some(payload) = encode(&ServerMessage::PixelsUpdate {
            pixels: vec![pixel.clone()],
        }) else {
            return 0;
        };

        let mut delivered = 0;
        for client_id in members {
            if matches!(self.deliver(client_id, payload.clone()), Delivery::Queued) {
                delivered += 1;
            }
        }
        delivered
    }

    pub fn send_to(&self, client_id: ClientId, message: &ServerMessage) -> bool {
        let Some(payload) = encode(message) else {
            return false;
        };
        matches!(self.deliver(client_id, payload), Delivery::Queued)
    }

    /// Fan a message out to every tab of a user.
    pub fn notify_user(&self, user_id: &str, message: &ServerMessage) -> usize {
        let tabs: Vec<ClientId> = match self.users.get(user_id) {
            Some(tabs) => tabs.iter().copied().collect(),
            None => return 0,
        };
        let Some(payload) = encode(message) else {
            return 0;
        };
        tabs.into_iter()
            .filter(|client_id| {
                matches!(self.deliver(*client_id, payload.clone()), Delivery::Queued)
            })
            .count()
    }

    pub fn viewport_of(&self, client_id: ClientId) -> Option<Viewport> {
        self.clients.get(&client_id).and_then(|entry| entry.viewport)
    }

    pub fn rooms_of(&self, client_id: ClientId) -> Vec<RoomKey> {
        let mut rooms: Vec<RoomKey> = self
            .clients
            .get(&client_id)
            .map(|entry| entry.rooms.iter().copied().collect())
            .unwrap_or_default();
        rooms.sort_unstable();
        rooms
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn connected_users(&self) -> Vec<String> {
        self.users.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn active_rooms(&self) -> usize {
        self.rooms.len()
    }

    fn deliver(&self, client_id: ClientId, payload: Bytes) -> Delivery {
        let outcome = {
            let Some(entry) = self.clients.get(&client_id) else {
                return Delivery::Closed;
            };
            match entry.tx.try_send(payload) {
                Ok(()) => Delivery::Queued,
                Err(TrySendError::Full(_)) => {
                    if !entry.lagged.swap(true, Ordering::AcqRel) {
                        warn!(client_id, "outbound queue full; client will be resynced");
                    }
                    Delivery::Dropped
                }
                Err(TrySendError::Closed(_)) => Delivery::Closed,
            }
        };

        match outcome {
            Delivery::Dropped => self.observability.record_dropped_broadcasts(1),
            Delivery::Closed => self.unregister(client_id),
            Delivery::Queued => {}
        }
        outcome
    }

    fn leave_room(&self, room: RoomKey, client_id: ClientId) {
        self.rooms.remove_if_mut(&room, |_, members| {
            members.remove(&client_id);
            members.is_empty()
        });
    }
}

pub(crate) fn encode(message: &ServerMessage) -> Option<Bytes> {
    match serde_json::to_vec(message) {
        Ok(json) => Some(Bytes::from(json)),
        Err(e) => {
            warn!(error = %e, "failed to serialize server message");
            None
        }
    }
}
