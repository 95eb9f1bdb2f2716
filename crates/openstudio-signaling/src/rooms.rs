//! Room membership: a room is a tri-level-role mapping from peer id to
//! role, created on first use and destroyed the instant it empties.

use crate::protocol::{Participant, Role};
use openstudio_common::ids::{PeerId, RoomId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, thiserror::Error)]
pub enum RoomError {
    #[error("room {0:?} does not exist")]
    NotFound(String),
    #[error("peer is already in room {0:?}")]
    AlreadyInRoom(String),
}

struct Room {
    /// Insertion order, preserved so `room-joined` lists participants the
    /// way they arrived rather than in hash order.
    order: Vec<PeerId>,
    roles: HashMap<PeerId, Role>,
}

impl Room {
    fn new() -> Self {
        Self { order: Vec::new(), roles: HashMap::new() }
    }

    fn insert(&mut self, peer_id: PeerId, role: Role) {
        self.order.push(peer_id.clone());
        self.roles.insert(peer_id, role);
    }

    fn remove(&mut self, peer_id: &PeerId) {
        self.order.retain(|p| p != peer_id);
        self.roles.remove(peer_id);
    }

    fn is_empty(&self) -> bool {
        self.roles.is_empty()
    }

    fn participants(&self) -> Vec<Participant> {
        self.order
            .iter()
            .filter_map(|id| self.roles.get(id).map(|role| Participant { peer_id: id.as_str().to_string(), role: *role }))
            .collect()
    }

    fn other_members(&self, except: &PeerId) -> Vec<PeerId> {
        self.order.iter().filter(|p| *p != except).cloned().collect()
    }
}

/// Outcome of departure: the room the peer left, and whether it was the
/// room's last member (in which case the room no longer exists).
pub struct Departure {
    pub room_id: RoomId,
    pub remaining_members: Vec<PeerId>,
    pub was_last: bool,
}

pub struct RoomManager {
    rooms: Arc<RwLock<HashMap<RoomId, Room>>>,
    peer_room: Arc<RwLock<HashMap<PeerId, RoomId>>>,
}

impl RoomManager {
    pub fn new() -> Self {
        Self {
            rooms: Arc::new(RwLock::new(HashMap::new())),
            peer_room: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn role_of(&self, peer_id: &PeerId) -> Option<Role> {
        let room_id = self.peer_room.read().await.get(peer_id)?.clone();
        self.rooms.read().await.get(&room_id)?.roles.get(peer_id).copied()
    }

    pub async fn room_of(&self, peer_id: &PeerId) -> Option<RoomId> {
        self.peer_room.read().await.get(peer_id).cloned()
    }

    pub async fn participants_of(&self, room_id: &RoomId) -> Vec<Participant> {
        self.rooms
            .read()
            .await
            .get(room_id)
            .map(Room::participants)
            .unwrap_or_default()
    }

    /// `create-room`: always mints a fresh room id, any role may call it.
    pub async fn create_room(&self, peer_id: PeerId, role: Role) -> Result<RoomId, RoomError> {
        let (room_id, _) = self.create_or_join(None, peer_id, role).await?;
        Ok(room_id)
    }

    /// `join-room`: the room must already exist.
    pub async fn join_existing(&self, room_id: RoomId, peer_id: PeerId, role: Role) -> Result<(), RoomError> {
        if self.peer_room.read().await.contains_key(&peer_id) {
            return Err(RoomError::AlreadyInRoom(peer_id.as_str().to_string()));
        }
        let mut rooms = self.rooms.write().await;
        let room = rooms.get_mut(&room_id).ok_or_else(|| RoomError::NotFound(room_id.as_str().to_string()))?;
        room.insert(peer_id.clone(), role);
        self.peer_room.write().await.insert(peer_id, room_id);
        Ok(())
    }

    /// `create-or-join-room`: idempotent, creates the room if the given id
    /// (or a generated one, if none was given) doesn't exist yet.
    pub async fn create_or_join(
        &self,
        room_id: Option<RoomId>,
        peer_id: PeerId,
        role: Role,
    ) -> Result<(RoomId, bool), RoomError> {
        if self.peer_room.read().await.contains_key(&peer_id) {
            return Err(RoomError::AlreadyInRoom(peer_id.as_str().to_string()));
        }

        let mut rooms = self.rooms.write().await;
        let room_id = room_id.unwrap_or_else(RoomId::generate);
        let created = !rooms.contains_key(&room_id);
        let room = rooms.entry(room_id.clone()).or_insert_with(Room::new);
        room.insert(peer_id.clone(), role);
        drop(rooms);

        self.peer_room.write().await.insert(peer_id, room_id.clone());
        Ok((room_id, created))
    }

    /// Remove a peer from whatever room it's in. Destroys the room
    /// immediately if that was the last member.
    pub async fn remove_peer(&self, peer_id: &PeerId) -> Option<Departure> {
        let room_id = self.peer_room.write().await.remove(peer_id)?;
        let mut rooms = self.rooms.write().await;
        let room = rooms.get_mut(&room_id)?;
        room.remove(peer_id);
        let remaining_members = room.other_members(peer_id);
        let was_last = room.is_empty();
        if was_last {
            rooms.remove(&room_id);
        }
        Some(Departure { room_id, remaining_members, was_last })
    }

    pub async fn other_members(&self, room_id: &RoomId, except: &PeerId) -> Vec<PeerId> {
        self.rooms
            .read()
            .await
            .get(room_id)
            .map(|r| r.other_members(except))
            .unwrap_or_default()
    }
}

impl Default for RoomManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_then_join_reports_created_flag_correctly() {
        let rooms = RoomManager::new();
        let (room_id, created) = rooms
            .create_or_join(None, PeerId::from("host"), Role::Host)
            .await
            .unwrap();
        assert!(created);

        let (same_room, created_again) = rooms
            .create_or_join(Some(room_id.clone()), PeerId::from("guest"), Role::Guest)
            .await
            .unwrap();
        assert_eq!(same_room, room_id);
        assert!(!created_again);
    }

    #[tokio::test]
    async fn join_existing_rejects_unknown_room() {
        let rooms = RoomManager::new();
        let err = rooms
            .join_existing(RoomId::from("ghost".to_string()), PeerId::from("a"), Role::Guest)
            .await
            .unwrap_err();
        assert!(matches!(err, RoomError::NotFound(_)));
    }

    #[tokio::test]
    async fn a_peer_cannot_join_two_rooms() {
        let rooms = RoomManager::new();
        rooms.create_or_join(None, PeerId::from("a"), Role::Host).await.unwrap();
        let err = rooms
            .create_or_join(None, PeerId::from("a"), Role::Guest)
            .await
            .unwrap_err();
        assert!(matches!(err, RoomError::AlreadyInRoom(_)));
    }

    #[tokio::test]
    async fn room_is_destroyed_when_last_member_departs() {
        let rooms = RoomManager::new();
        let (room_id, _) = rooms.create_or_join(None, PeerId::from("a"), Role::Host).await.unwrap();
        let departure = rooms.remove_peer(&PeerId::from("a")).await.unwrap();
        assert!(departure.was_last);
        assert_eq!(departure.room_id, room_id);

        // the id is free again
        let (reused, created) = rooms.create_or_join(Some(room_id), PeerId::from("b"), Role::Guest).await.unwrap();
        assert!(created);
        let _ = reused;
    }

    #[tokio::test]
    async fn departing_member_list_excludes_the_leaver() {
        let rooms = RoomManager::new();
        let (room_id, _) = rooms.create_or_join(None, PeerId::from("a"), Role::Host).await.unwrap();
        rooms.join_existing(room_id, PeerId::from("b"), Role::Guest).await.unwrap();

        let departure = rooms.remove_peer(&PeerId::from("a")).await.unwrap();
        assert!(!departure.was_last);
        assert_eq!(departure.remaining_members, vec![PeerId::from("b")]);
    }
}
