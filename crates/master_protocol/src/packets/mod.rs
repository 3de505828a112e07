//! Payload packets carried by the reserved opcodes.

mod common;
mod rooms;
mod spawner;

pub use common::{GameInfoPacket, GameKind, LogInPacket};
pub use rooms::{
    PlayerLeftRoomPacket, RoomAccessPacket, RoomAccessRequestPacket, RoomAccessValidatePacket,
    RoomOptions, UsernameAndPeerIdPacket,
};
pub use spawner::{
    ClientsSpawnRequestPacket, KillSpawnedProcessPacket, RegisterSpawnedProcessPacket,
    SpawnFinalizationPacket, SpawnRequestPacket, SpawnStatus, SpawnStatusUpdatePacket,
    SpawnerOptions,
};
