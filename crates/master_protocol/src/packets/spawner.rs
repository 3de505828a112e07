use crate::codec::{Packet, PacketReader, PacketWriter, Properties};
use crate::error::ProtocolError;
use std::fmt;

/// Lifecycle of a spawn task.
///
/// ```text
/// None → InQueue → StartingProcess → WaitingForProcess → ProcessRegistered → Finalized
/// any non-terminal state → Killed
/// ```
#[repr(i8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SpawnStatus {
    Killed = -1,
    None = 0,
    InQueue = 1,
    StartingProcess = 2,
    WaitingForProcess = 3,
    ProcessRegistered = 4,
    Finalized = 5,
}

impl SpawnStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, SpawnStatus::Finalized | SpawnStatus::Killed)
    }

    /// True once the spawner has acknowledged launching the process, or the
    /// task ended.
    pub fn is_done_starting_process(self) -> bool {
        self == SpawnStatus::Killed || self >= SpawnStatus::WaitingForProcess
    }

    /// Legal successors: any later state along the main chain (steps may be
    /// skipped, never revisited), or `Killed` from any non-terminal state.
    pub fn can_transition_to(self, next: SpawnStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            SpawnStatus::Killed => true,
            SpawnStatus::None => false,
            _ => next > self,
        }
    }
}

impl TryFrom<i8> for SpawnStatus {
    type Error = ProtocolError;

    fn try_from(value: i8) -> Result<Self, ProtocolError> {
        Ok(match value {
            -1 => SpawnStatus::Killed,
            0 => SpawnStatus::None,
            1 => SpawnStatus::InQueue,
            2 => SpawnStatus::StartingProcess,
            3 => SpawnStatus::WaitingForProcess,
            4 => SpawnStatus::ProcessRegistered,
            5 => SpawnStatus::Finalized,
            other => {
                return Err(ProtocolError::malformed(format!(
                    "unknown spawn status {other}"
                )))
            }
        })
    }
}

impl fmt::Display for SpawnStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl Packet for SpawnStatus {
    fn write(&self, writer: &mut PacketWriter) {
        writer.write_i8(*self as i8);
    }

    fn read(reader: &mut PacketReader<'_>) -> Result<Self, ProtocolError> {
        SpawnStatus::try_from(reader.read_i8()?)
    }
}

/// Spawner → master registration.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SpawnerOptions {
    pub region: String,
    /// 0 means unbounded.
    pub max_processes: u32,
}

impl Packet for SpawnerOptions {
    fn write(&self, writer: &mut PacketWriter) {
        writer.write_string(&self.region);
        writer.write_u32(self.max_processes);
    }

    fn read(reader: &mut PacketReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            region: reader.read_string()?,
            max_processes: reader.read_u32()?,
        })
    }
}

/// Client → master: please spawn a process.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ClientsSpawnRequestPacket {
    pub region: String,
    pub options: Properties,
}

impl Packet for ClientsSpawnRequestPacket {
    fn write(&self, writer: &mut PacketWriter) {
        writer.write_string(&self.region);
        writer.write_map(&self.options);
    }

    fn read(reader: &mut PacketReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            region: reader.read_string()?,
            options: reader.read_map()?,
        })
    }
}

/// Master → spawner: start a process for this task.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SpawnRequestPacket {
    pub spawn_id: u32,
    pub spawn_code: String,
    pub options: Properties,
}

impl Packet for SpawnRequestPacket {
    fn write(&self, writer: &mut PacketWriter) {
        writer.write_u32(self.spawn_id);
        writer.write_string(&self.spawn_code);
        writer.write_map(&self.options);
    }

    fn read(reader: &mut PacketReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            spawn_id: reader.read_u32()?,
            spawn_code: reader.read_string()?,
            options: reader.read_map()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct KillSpawnedProcessPacket {
    pub spawn_id: u32,
}

impl Packet for KillSpawnedProcessPacket {
    fn write(&self, writer: &mut PacketWriter) {
        writer.write_u32(self.spawn_id);
    }

    fn read(reader: &mut PacketReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            spawn_id: reader.read_u32()?,
        })
    }
}

/// Spawned process → master, on first contact.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RegisterSpawnedProcessPacket {
    pub spawn_id: u32,
    pub spawn_code: String,
}

impl Packet for RegisterSpawnedProcessPacket {
    fn write(&self, writer: &mut PacketWriter) {
        writer.write_u32(self.spawn_id);
        writer.write_string(&self.spawn_code);
    }

    fn read(reader: &mut PacketReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            spawn_id: reader.read_u32()?,
            spawn_code: reader.read_string()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SpawnFinalizationPacket {
    pub spawn_id: u32,
    pub finalization_data: Properties,
}

impl Packet for SpawnFinalizationPacket {
    fn write(&self, writer: &mut PacketWriter) {
        writer.write_u32(self.spawn_id);
        writer.write_map(&self.finalization_data);
    }

    fn read(reader: &mut PacketReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            spawn_id: reader.read_u32()?,
            finalization_data: reader.read_map()?,
        })
    }
}

/// Spawn id plus its current status. Used both as the `RequestSpawn`
/// response and as the `SpawnStatusChange` push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpawnStatusUpdatePacket {
    pub spawn_id: u32,
    pub status: SpawnStatus,
}

impl Packet for SpawnStatusUpdatePacket {
    fn write(&self, writer: &mut PacketWriter) {
        writer.write_u32(self.spawn_id);
        self.status.write(writer);
    }

    fn read(reader: &mut PacketReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            spawn_id: reader.read_u32()?,
            status: SpawnStatus::read(reader)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHAIN: [SpawnStatus; 6] = [
        SpawnStatus::None,
        SpawnStatus::InQueue,
        SpawnStatus::StartingProcess,
        SpawnStatus::WaitingForProcess,
        SpawnStatus::ProcessRegistered,
        SpawnStatus::Finalized,
    ];

    #[test]
    fn chain_only_moves_forward() {
        for (i, from) in CHAIN.iter().enumerate() {
            for (j, to) in CHAIN.iter().enumerate() {
                let expected = j > i && !from.is_terminal() && *to != SpawnStatus::None;
                assert_eq!(from.can_transition_to(*to), expected, "{from} -> {to}");
            }
        }
    }

    #[test]
    fn killed_reachable_from_every_non_terminal_state() {
        for status in CHAIN {
            assert_eq!(
                status.can_transition_to(SpawnStatus::Killed),
                status != SpawnStatus::Finalized
            );
        }
        assert!(!SpawnStatus::Killed.can_transition_to(SpawnStatus::Killed));
        assert!(!SpawnStatus::Killed.can_transition_to(SpawnStatus::InQueue));
    }

    #[test]
    fn status_update_decodes_negative_status() {
        let packet = SpawnStatusUpdatePacket {
            spawn_id: 3,
            status: SpawnStatus::Killed,
        };
        let decoded = SpawnStatusUpdatePacket::from_bytes(&packet.to_bytes()).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn unknown_status_byte_is_rejected() {
        assert!(SpawnStatus::from_bytes(&[9]).is_err());
    }
}
