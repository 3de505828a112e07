//! Rooms and the room access ticket protocol.
//!
//! A client asks the master for access to a room and receives a single-use
//! bearer token. The client hands the token to the room process, which asks
//! the master to validate it. The master answers with the username the
//! ticket was issued to and consumes the ticket.

mod authority;
mod plugin;
mod registry;

pub use authority::{RoomAccessAuthority, RoomAccessTicket, ValidatedAccess};
pub use plugin::RoomsPlugin;
pub use registry::{RegisteredRoom, RoomRegistry};

use crate::error::RoomAccessError;
use crate::peer::{Peer, PeerId};
use master_protocol::Properties;

/// Decides whether a peer may receive a ticket for a room.
pub trait RoomAccessValidator: Send + Sync {
    fn validate(
        &self,
        room_id: i32,
        password: &str,
        properties: &Properties,
        requester: &Peer,
    ) -> Result<(), RoomAccessError>;

    /// Whether `peer` may validate tickets for, or report players of, `room_id`.
    fn owns_room(&self, _room_id: i32, _peer: PeerId) -> bool {
        true
    }
}
