use super::{RoomAccessAuthority, RoomAccessValidator, RoomRegistry};
use crate::dispatcher::handler_fn;
use crate::error::ServerError;
use crate::games::GamesPlugin;
use crate::peer::Peer;
use crate::response::Response;
use crate::server::{DisconnectListener, MasterPlugin, MasterServer};
use async_trait::async_trait;
use master_protocol::{
    OpCode, PlayerLeftRoomPacket, ResponseStatus, RoomAccessRequestPacket,
    RoomAccessValidatePacket, RoomOptions, UsernameAndPeerIdPacket,
};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::{debug, info};

/// Room registration and access tickets.
///
/// Handles `RegisterRoom`, `DestroyRoom`, `GetRoomAccess`,
/// `ValidateRoomAccess` and `PlayerLeftRoom`, lists public rooms through
/// `FindGames`, and drops a peer's rooms when it disconnects.
pub struct RoomsPlugin {
    registry: Arc<RoomRegistry>,
    authority: Arc<RoomAccessAuthority>,
    ticket_ttl: OnceLock<Option<Duration>>,
}

impl RoomsPlugin {
    /// Uses the room registry as the access validator.
    pub fn new() -> Self {
        let registry = Arc::new(RoomRegistry::new());
        let authority = Arc::new(RoomAccessAuthority::new(registry.clone()));
        Self::from_parts(registry, authority)
    }

    /// Uses a custom access validator.
    pub fn with_validator(validator: Arc<dyn RoomAccessValidator>) -> Self {
        Self::from_parts(
            Arc::new(RoomRegistry::new()),
            Arc::new(RoomAccessAuthority::new(validator)),
        )
    }

    fn from_parts(registry: Arc<RoomRegistry>, authority: Arc<RoomAccessAuthority>) -> Self {
        Self {
            registry,
            authority,
            ticket_ttl: OnceLock::new(),
        }
    }

    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }

    pub fn authority(&self) -> &Arc<RoomAccessAuthority> {
        &self.authority
    }

    fn register_room(&self, peer: &Peer, options: RoomOptions, required_level: i32) -> Response {
        if peer.permission_level() < required_level {
            return Response::failure(ResponseStatus::Unauthorized, "Insufficient permissions");
        }
        let room_id = self.registry.register(peer.id(), options);
        Response::success(&room_id)
    }

    fn destroy_room(&self, peer: &Peer, room_id: i32) -> Response {
        match self.registry.destroy(room_id, peer.id()) {
            Ok(_) => {
                let revoked = self.authority.revoke_room(room_id);
                debug!(room_id, revoked, "Revoked tickets of destroyed room");
                Response::ok()
            }
            Err(e) => Response::failure(e.status(), e.to_string()),
        }
    }

    fn get_access(&self, peer: &Peer, request: RoomAccessRequestPacket) -> Response {
        match self.authority.request_access(
            request.room_id,
            &request.password,
            &request.properties,
            peer,
        ) {
            Ok(ticket) => Response::success(&ticket),
            Err(e) => Response::failure(e.status(), e.to_string()),
        }
    }

    fn validate_access(&self, peer: &Peer, request: RoomAccessValidatePacket) -> Response {
        if !self.authority.validator().owns_room(request.room_id, peer.id()) {
            return Response::failure(
                ResponseStatus::Unauthorized,
                format!("Peer does not own room {}", request.room_id),
            );
        }
        match self
            .authority
            .validate_ticket(&request.token, request.room_id, &request.username)
        {
            Ok(access) => {
                self.registry.player_joined(request.room_id, access.peer_id);
                Response::success(&UsernameAndPeerIdPacket {
                    username: access.username,
                    peer_id: access.peer_id,
                })
            }
            Err(e) => Response::failure(e.status(), e.to_string()),
        }
    }

    fn player_left(&self, peer: &Peer, packet: PlayerLeftRoomPacket) -> Response {
        if !self.authority.validator().owns_room(packet.room_id, peer.id()) {
            return Response::failure(ResponseStatus::Unauthorized, "Not the room owner");
        }
        if self.registry.player_left(packet.room_id, packet.peer_id) {
            Response::ok()
        } else {
            Response::failure(ResponseStatus::Failed, "Player is not in the room")
        }
    }
}

impl Default for RoomsPlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl DisconnectListener for RoomsPlugin {
    fn on_peer_disconnected(&self, peer: &Arc<Peer>) {
        for room_id in self.registry.remove_owned_by(peer.id()) {
            self.authority.revoke_room(room_id);
            info!("🏚️ Room {} removed: owner {} disconnected", room_id, peer.id());
        }
    }
}

#[async_trait]
impl MasterPlugin for RoomsPlugin {
    fn name(&self) -> &'static str {
        "rooms"
    }

    async fn install(self: Arc<Self>, server: &Arc<MasterServer>) -> Result<(), ServerError> {
        let config = server.config();
        let _ = self.ticket_ttl.set(config.ticket_ttl);
        let room_level = config.room_permission_level;
        let dispatcher = server.dispatcher();

        let plugin = self.clone();
        dispatcher
            .register_handler(
                OpCode::RegisterRoom,
                handler_fn(move |peer, message| {
                    let plugin = plugin.clone();
                    async move {
                        let options: RoomOptions = message.deserialize()?;
                        Ok(plugin.register_room(&peer, options, room_level))
                    }
                }),
            )
            .await;

        let plugin = self.clone();
        dispatcher
            .register_handler(
                OpCode::DestroyRoom,
                handler_fn(move |peer, message| {
                    let plugin = plugin.clone();
                    async move {
                        let room_id: i32 = message.deserialize()?;
                        Ok(plugin.destroy_room(&peer, room_id))
                    }
                }),
            )
            .await;

        let plugin = self.clone();
        dispatcher
            .register_handler(
                OpCode::GetRoomAccess,
                handler_fn(move |peer, message| {
                    let plugin = plugin.clone();
                    async move {
                        let request: RoomAccessRequestPacket = message.deserialize()?;
                        Ok(plugin.get_access(&peer, request))
                    }
                }),
            )
            .await;

        let plugin = self.clone();
        dispatcher
            .register_handler(
                OpCode::ValidateRoomAccess,
                handler_fn(move |peer, message| {
                    let plugin = plugin.clone();
                    async move {
                        let request: RoomAccessValidatePacket = message.deserialize()?;
                        Ok(plugin.validate_access(&peer, request))
                    }
                }),
            )
            .await;

        let plugin = self.clone();
        dispatcher
            .register_handler(
                OpCode::PlayerLeftRoom,
                handler_fn(move |peer, message| {
                    let plugin = plugin.clone();
                    async move {
                        let packet: PlayerLeftRoomPacket = message.deserialize()?;
                        Ok(plugin.player_left(&peer, packet))
                    }
                }),
            )
            .await;

        match server.registry().get::<GamesPlugin>() {
            Some(games) => games.add_provider(self.registry.clone()),
            None => debug!("No games plugin installed; rooms will not be listed"),
        }

        server.add_disconnect_listener(self.clone());
        server.registry().insert(self.registry.clone());
        server.registry().insert(self.authority.clone());
        server.registry().insert(self);
        Ok(())
    }

    fn maintain(&self) {
        let ttl = self.ticket_ttl.get().copied().flatten();
        let purged = self.authority.purge(ttl);
        if purged > 0 {
            debug!(purged, "Purged room access tickets");
        }
    }
}
