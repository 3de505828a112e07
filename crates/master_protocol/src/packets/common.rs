use crate::codec::{Packet, PacketReader, PacketWriter, Properties};
use crate::error::ProtocolError;

/// Opaque credentials presented with `LogIn`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LogInPacket {
    pub username: String,
    pub token: String,
}

impl Packet for LogInPacket {
    fn write(&self, writer: &mut PacketWriter) {
        writer.write_string(&self.username);
        writer.write_string(&self.token);
    }

    fn read(reader: &mut PacketReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            username: reader.read_string()?,
            token: reader.read_string()?,
        })
    }
}

/// What kind of joinable entity a game listing describes.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GameKind {
    Room = 0,
    Lobby = 1,
    Custom = 2,
}

impl TryFrom<u8> for GameKind {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, ProtocolError> {
        match value {
            0 => Ok(GameKind::Room),
            1 => Ok(GameKind::Lobby),
            2 => Ok(GameKind::Custom),
            other => Err(ProtocolError::malformed(format!("unknown game kind {other}"))),
        }
    }
}

/// One entry of a `FindGames` response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GameInfoPacket {
    pub id: i32,
    pub kind: GameKind,
    pub name: String,
    pub address: String,
    pub is_password_protected: bool,
    pub max_players: u32,
    pub online_players: u32,
    pub properties: Properties,
}

impl Packet for GameInfoPacket {
    fn write(&self, writer: &mut PacketWriter) {
        writer.write_i32(self.id);
        writer.write_u8(self.kind as u8);
        writer.write_string(&self.name);
        writer.write_string(&self.address);
        writer.write_bool(self.is_password_protected);
        writer.write_u32(self.max_players);
        writer.write_u32(self.online_players);
        writer.write_map(&self.properties);
    }

    fn read(reader: &mut PacketReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            id: reader.read_i32()?,
            kind: GameKind::try_from(reader.read_u8()?)?,
            name: reader.read_string()?,
            address: reader.read_string()?,
            is_password_protected: reader.read_bool()?,
            max_players: reader.read_u32()?,
            online_players: reader.read_u32()?,
            properties: reader.read_map()?,
        })
    }
}

impl Packet for Vec<GameInfoPacket> {
    fn write(&self, writer: &mut PacketWriter) {
        writer.write_list(self);
    }

    fn read(reader: &mut PacketReader<'_>) -> Result<Self, ProtocolError> {
        reader.read_list()
    }
}
