use std::sync::Arc;

use dashmap::DashMap;
use rand::Rng;
use tokio::sync::{broadcast, mpsc};

use crate::dots::DotsCommand;
use crate::game::RoomCommand;
use crate::types::{RoomSummary, ServerMsg};

/// One event on a room's broadcast channel. Every WebSocket session
/// subscribed to the room filters these for itself; delivery is to the
/// membership at send time only, nothing is queued for absent sockets.
#[derive(Debug, Clone)]
pub enum RoomEvent {
    /// Deliver to a single socket.
    SendTo { socket_id: String, msg: ServerMsg },
    /// Deliver to every socket in the room.
    Broadcast { msg: ServerMsg },
    /// Deliver to every socket except the sender.
    BroadcastExcept { exclude: String, msg: ServerMsg },
    /// Deliver to a single socket and detach it from the room.
    Kick { socket_id: String, msg: ServerMsg },
}

/// Handle to a running quiz room task.
#[derive(Clone)]
pub struct RoomHandle {
    pub code: String,
    pub cmd_tx: mpsc::Sender<RoomCommand>,
    pub event_tx: broadcast::Sender<RoomEvent>,
}

/// Handle to a running line-drawing room task.
#[derive(Clone)]
pub struct DotsHandle {
    pub code: String,
    pub cmd_tx: mpsc::Sender<DotsCommand>,
    pub event_tx: broadcast::Sender<RoomEvent>,
}

/// Process-wide registry of live rooms. Rooms are ephemeral and in-memory;
/// the registry starts empty and needs no teardown beyond process exit.
pub struct Registry {
    /// code -> quiz room handle
    pub rooms: DashMap<String, RoomHandle>,
    /// code -> dots room handle
    pub dots_rooms: DashMap<String, DotsHandle>,
    /// code -> latest admin projection, recomputed by room tasks
    summaries: DashMap<String, RoomSummary>,
    /// cross-room admin subscription
    pub admin_tx: broadcast::Sender<ServerMsg>,
}

impl Registry {
    pub fn new() -> Arc<Self> {
        let (admin_tx, _) = broadcast::channel(256);
        Arc::new(Self {
            rooms: DashMap::new(),
            dots_rooms: DashMap::new(),
            summaries: DashMap::new(),
            admin_tx,
        })
    }

    /// Allocate a 6-digit code not used by any live room of either kind.
    /// Collisions are unlikely but must be checked, so re-roll until free.
    pub fn allocate_code(&self) -> String {
        loop {
            let mut rng = rand::rng();
            let code: String = (0..6)
                .map(|_| char::from(b'0' + rng.random_range(0..10)))
                .collect();
            if !self.rooms.contains_key(&code) && !self.dots_rooms.contains_key(&code) {
                return code;
            }
        }
    }

    pub fn remove_room(&self, code: &str) {
        if self.rooms.remove(code).is_some() {
            tracing::info!("Room {} destroyed", code);
        }
        self.drop_summary(code);
    }

    pub fn remove_dots_room(&self, code: &str) {
        if self.dots_rooms.remove(code).is_some() {
            tracing::info!("Dots room {} destroyed", code);
        }
        self.drop_summary(code);
    }

    /// Store a room's fresh projection and push the full listing to the
    /// admin pool. Called by room tasks after every mutation; a listing
    /// that is stale by one event is fine.
    pub fn publish_summary(&self, summary: RoomSummary) {
        self.summaries.insert(summary.code.clone(), summary);
        self.publish_admin_rooms();
    }

    fn drop_summary(&self, code: &str) {
        self.summaries.remove(code);
        self.publish_admin_rooms();
    }

    pub fn room_listing(&self) -> Vec<RoomSummary> {
        let mut rooms: Vec<RoomSummary> =
            self.summaries.iter().map(|e| e.value().clone()).collect();
        rooms.sort_by(|a, b| a.code.cmp(&b.code));
        rooms
    }

    fn publish_admin_rooms(&self) {
        // No admin subscribed is the normal case
        let _ = self.admin_tx.send(ServerMsg::AdminRooms {
            rooms: self.room_listing(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{QuestionProgress, RoomKind};

    fn summary(code: &str) -> RoomSummary {
        RoomSummary {
            code: code.to_string(),
            kind: RoomKind::Quiz,
            title: "t".into(),
            state: "lobby".into(),
            mode: None,
            player_count: 0,
            players: vec![],
            progress: QuestionProgress {
                current: 0,
                total: 1,
            },
        }
    }

    #[test]
    fn codes_are_six_digits() {
        let registry = Registry::new();
        for _ in 0..100 {
            let code = registry.allocate_code();
            assert_eq!(code.len(), 6);
            assert!(code.chars().all(|c| c.is_ascii_digit()));
        }
    }

    #[test]
    fn listing_tracks_publish_and_remove() {
        let registry = Registry::new();
        registry.publish_summary(summary("111111"));
        registry.publish_summary(summary("222222"));
        assert_eq!(registry.room_listing().len(), 2);

        registry.remove_room("111111");
        let listing = registry.room_listing();
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].code, "222222");
    }

    #[test]
    fn admin_pool_receives_listing_updates() {
        let registry = Registry::new();
        let mut rx = registry.admin_tx.subscribe();
        registry.publish_summary(summary("333333"));
        match rx.try_recv().unwrap() {
            ServerMsg::AdminRooms { rooms } => assert_eq!(rooms.len(), 1),
            other => panic!("unexpected message: {other:?}"),
        }
    }
}
