//! Reserved opcodes shared by the master, spawners, rooms and clients.
//!
//! Opcodes are plain `u16` values on the wire so applications can register
//! handlers for their own codes; the ones below are reserved by the
//! framework.

use std::fmt;

#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpCode {
    Echo = 1,
    LogIn = 2,
    FindGames = 3,

    RegisterRoom = 10,
    DestroyRoom = 11,
    GetRoomAccess = 12,
    ValidateRoomAccess = 13,
    PlayerLeftRoom = 14,

    RegisterSpawner = 20,
    /// Client asks the master to spawn a process.
    RequestSpawn = 21,
    /// Master orders a spawner to start a process.
    SpawnProcess = 22,
    ProcessStarted = 23,
    ProcessKilled = 24,
    RegisterSpawnedProcess = 25,
    SpawnFinalization = 26,
    KillSpawnedProcess = 27,
    AbortSpawnRequest = 28,
    GetSpawnFinalizationData = 29,
    /// Master pushes status changes to the requester of a spawn.
    SpawnStatusChange = 30,
}

impl OpCode {
    pub const ALL: [OpCode; 19] = [
        OpCode::Echo,
        OpCode::LogIn,
        OpCode::FindGames,
        OpCode::RegisterRoom,
        OpCode::DestroyRoom,
        OpCode::GetRoomAccess,
        OpCode::ValidateRoomAccess,
        OpCode::PlayerLeftRoom,
        OpCode::RegisterSpawner,
        OpCode::RequestSpawn,
        OpCode::SpawnProcess,
        OpCode::ProcessStarted,
        OpCode::ProcessKilled,
        OpCode::RegisterSpawnedProcess,
        OpCode::SpawnFinalization,
        OpCode::KillSpawnedProcess,
        OpCode::AbortSpawnRequest,
        OpCode::GetSpawnFinalizationData,
        OpCode::SpawnStatusChange,
    ];

    pub fn from_u16(value: u16) -> Option<Self> {
        Self::ALL.iter().copied().find(|op| *op as u16 == value)
    }
}

impl From<OpCode> for u16 {
    fn from(op: OpCode) -> u16 {
        op as u16
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Formats a raw opcode for logs, using the reserved name when there is one.
pub fn describe(opcode: u16) -> String {
    match OpCode::from_u16(opcode) {
        Some(op) => format!("{op}({opcode})"),
        None => format!("custom({opcode})"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_reserved_opcode_round_trips() {
        for op in OpCode::ALL {
            assert_eq!(OpCode::from_u16(op.into()), Some(op));
        }
        assert_eq!(OpCode::from_u16(999), None);
    }

    #[test]
    fn reserved_values_are_unique() {
        let mut values: Vec<u16> = OpCode::ALL.iter().map(|op| *op as u16).collect();
        values.sort_unstable();
        values.dedup();
        assert_eq!(values.len(), OpCode::ALL.len());
    }
}
