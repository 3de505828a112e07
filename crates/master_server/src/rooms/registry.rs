use super::RoomAccessValidator;
use crate::error::RoomAccessError;
use crate::games::GamesProvider;
use crate::peer::{Peer, PeerId};
use dashmap::DashMap;
use master_protocol::{GameInfoPacket, GameKind, Properties, RoomOptions};
use std::collections::HashSet;
use std::sync::atomic::{AtomicI32, Ordering};
use tracing::{debug, info};

/// A room registered by a game server process.
#[derive(Debug, Clone)]
pub struct RegisteredRoom {
    pub id: i32,
    pub owner: PeerId,
    pub options: RoomOptions,
    /// Peers whose tickets were validated and who have not left.
    pub players: HashSet<PeerId>,
}

impl RegisteredRoom {
    pub fn online_players(&self) -> u32 {
        self.players.len() as u32
    }

    /// Full when `max_players` is set and reached.
    pub fn is_full(&self) -> bool {
        self.options.max_players > 0 && self.online_players() >= self.options.max_players
    }

    pub fn game_info(&self) -> GameInfoPacket {
        GameInfoPacket {
            id: self.id,
            kind: GameKind::Room,
            name: self.options.name.clone(),
            address: self.options.address.clone(),
            is_password_protected: !self.options.password.is_empty(),
            max_players: self.options.max_players,
            online_players: self.online_players(),
            properties: self.options.properties.clone(),
        }
    }
}

/// Rooms currently registered with the master.
///
/// Also the default access validator (existence, password, capacity,
/// ownership) and a games provider listing public rooms.
pub struct RoomRegistry {
    rooms: DashMap<i32, RegisteredRoom>,
    next_id: AtomicI32,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self {
            rooms: DashMap::new(),
            next_id: AtomicI32::new(1),
        }
    }

    /// Registers a room owned by `owner` and returns its id.
    pub fn register(&self, owner: PeerId, options: RoomOptions) -> i32 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        info!("🏠 Room {} '{}' registered by peer {}", id, options.name, owner);
        self.rooms.insert(
            id,
            RegisteredRoom {
                id,
                owner,
                options,
                players: HashSet::new(),
            },
        );
        id
    }

    /// Inserts a room under a chosen id. Used when room ids are assigned
    /// outside the master.
    pub fn insert(&self, room: RegisteredRoom) {
        self.next_id.fetch_max(room.id.saturating_add(1), Ordering::Relaxed);
        self.rooms.insert(room.id, room);
    }

    /// Removes a room. Only its owner may do so.
    pub fn destroy(&self, room_id: i32, requester: PeerId) -> Result<RegisteredRoom, RoomAccessError> {
        match self.rooms.get(&room_id) {
            None => return Err(RoomAccessError::UnknownRoom(room_id)),
            Some(room) if room.owner != requester => {
                return Err(RoomAccessError::NotOwner(room_id))
            }
            Some(_) => {}
        }
        let (_, room) = self
            .rooms
            .remove(&room_id)
            .ok_or(RoomAccessError::UnknownRoom(room_id))?;
        info!("🏚️ Room {} destroyed", room_id);
        Ok(room)
    }

    /// Removes every room owned by `owner`, returning their ids.
    pub fn remove_owned_by(&self, owner: PeerId) -> Vec<i32> {
        let ids: Vec<i32> = self
            .rooms
            .iter()
            .filter(|entry| entry.owner == owner)
            .map(|entry| *entry.key())
            .collect();
        ids.into_iter()
            .filter(|id| self.rooms.remove(id).is_some())
            .collect()
    }

    pub fn room(&self, room_id: i32) -> Option<RegisteredRoom> {
        self.rooms.get(&room_id).map(|room| room.clone())
    }

    pub fn player_joined(&self, room_id: i32, peer_id: PeerId) -> bool {
        match self.rooms.get_mut(&room_id) {
            Some(mut room) => {
                room.players.insert(peer_id);
                debug!(room_id, peer_id, "Player joined room");
                true
            }
            None => false,
        }
    }

    pub fn player_left(&self, room_id: i32, peer_id: PeerId) -> bool {
        self.rooms
            .get_mut(&room_id)
            .map(|mut room| room.players.remove(&peer_id))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RoomAccessValidator for RoomRegistry {
    fn validate(
        &self,
        room_id: i32,
        password: &str,
        _properties: &Properties,
        _requester: &Peer,
    ) -> Result<(), RoomAccessError> {
        let room = self
            .rooms
            .get(&room_id)
            .ok_or(RoomAccessError::UnknownRoom(room_id))?;

        if !room.options.password.is_empty() && room.options.password != password {
            return Err(RoomAccessError::Rejected("Invalid password".to_string()));
        }
        if room.is_full() {
            return Err(RoomAccessError::Rejected("Room is full".to_string()));
        }
        Ok(())
    }

    fn owns_room(&self, room_id: i32, peer: PeerId) -> bool {
        self.rooms
            .get(&room_id)
            .is_some_and(|room| room.owner == peer)
    }
}

impl GamesProvider for RoomRegistry {
    fn games(&self, _filters: &Properties, _requester: &Peer) -> Vec<GameInfoPacket> {
        let mut games: Vec<GameInfoPacket> = self
            .rooms
            .iter()
            .filter(|room| room.options.is_public)
            .map(|room| room.game_info())
            .collect();
        games.sort_by_key(|game| game.id);
        games
    }
}
