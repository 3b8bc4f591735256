//! Room Registry
//!
//! Owns every live room. Constructed once at startup and handed to the
//! gateway; rooms are created on demand and torn down when their last peer
//! leaves (or by an explicit close).

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info};

use super::error::SessionError;
use super::room::Room;
use crate::config::Config;
use crate::engine::{MediaEngine, RoomId};

/// Registry mapping room ids to live rooms.
pub struct RoomRegistry {
    engine: Arc<dyn MediaEngine>,
    config: Arc<Config>,
    rooms: RwLock<HashMap<RoomId, Arc<Room>>>,
}

impl RoomRegistry {
    #[must_use]
    pub fn new(engine: Arc<dyn MediaEngine>, config: Arc<Config>) -> Self {
        Self {
            engine,
            config,
            rooms: RwLock::new(HashMap::new()),
        }
    }

    /// Create a room. Fails with [`SessionError::RoomExists`] if the id is
    /// already taken; the original room is left untouched.
    pub async fn create_room(&self, room_id: RoomId) -> Result<Arc<Room>, SessionError> {
        // Cheap check before asking the engine for a router.
        if self.rooms.read().await.contains_key(&room_id) {
            return Err(SessionError::RoomExists(room_id));
        }

        let room = Arc::new(
            Room::new(room_id.clone(), self.engine.as_ref(), self.config.clone()).await?,
        );

        {
            let mut rooms = self.rooms.write().await;
            if rooms.contains_key(&room_id) {
                // Lost the creation race; discard our router.
                drop(rooms);
                room.close().await;
                return Err(SessionError::RoomExists(room_id));
            }
            rooms.insert(room_id.clone(), room.clone());
        }

        info!(room_id = %room_id, "Room created");
        Ok(room)
    }

    /// Look up a room. No mutation.
    pub async fn get_room(&self, room_id: &RoomId) -> Option<Arc<Room>> {
        self.rooms.read().await.get(room_id).cloned()
    }

    /// Remove and tear down a room regardless of occupancy.
    pub async fn close_room(&self, room_id: &RoomId) -> Result<(), SessionError> {
        let room = self
            .rooms
            .write()
            .await
            .remove(room_id)
            .ok_or_else(|| SessionError::RoomNotFound(room_id.clone()))?;
        room.close().await;
        info!(room_id = %room_id, "Room closed");
        Ok(())
    }

    /// Remove and tear down a room if its peer set is empty, releasing the
    /// router handle.
    pub async fn close_if_empty(&self, room_id: &RoomId) {
        let removed = {
            let mut rooms = self.rooms.write().await;
            match rooms.get(room_id) {
                Some(room) if room.is_empty().await => rooms.remove(room_id),
                _ => None,
            }
        };

        if let Some(room) = removed {
            room.close().await;
            debug!(room_id = %room_id, "Removed empty room");
        }
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }
}
