use crate::codec::{Packet, PacketReader, PacketWriter, Properties};
use crate::error::ProtocolError;

/// Options a room process registers itself with.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RoomOptions {
    pub name: String,
    /// Public address players connect to, e.g. `"10.0.0.4:7777"`.
    pub address: String,
    pub is_public: bool,
    /// 0 means unlimited.
    pub max_players: u32,
    /// Empty means no password.
    pub password: String,
    pub properties: Properties,
}

impl Packet for RoomOptions {
    fn write(&self, writer: &mut PacketWriter) {
        writer.write_string(&self.name);
        writer.write_string(&self.address);
        writer.write_bool(self.is_public);
        writer.write_u32(self.max_players);
        writer.write_string(&self.password);
        writer.write_map(&self.properties);
    }

    fn read(reader: &mut PacketReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            name: reader.read_string()?,
            address: reader.read_string()?,
            is_public: reader.read_bool()?,
            max_players: reader.read_u32()?,
            password: reader.read_string()?,
            properties: reader.read_map()?,
        })
    }
}

/// Client → master: ask for a ticket into a room.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RoomAccessRequestPacket {
    pub room_id: i32,
    pub password: String,
    pub properties: Properties,
}

impl Packet for RoomAccessRequestPacket {
    fn write(&self, writer: &mut PacketWriter) {
        writer.write_i32(self.room_id);
        writer.write_string(&self.password);
        writer.write_map(&self.properties);
    }

    fn read(reader: &mut PacketReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            room_id: reader.read_i32()?,
            password: reader.read_string()?,
            properties: reader.read_map()?,
        })
    }
}

/// Master → client: the issued ticket.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RoomAccessPacket {
    pub room_id: i32,
    pub token: String,
    pub username: String,
}

impl Packet for RoomAccessPacket {
    fn write(&self, writer: &mut PacketWriter) {
        writer.write_i32(self.room_id);
        writer.write_string(&self.token);
        writer.write_string(&self.username);
    }

    fn read(reader: &mut PacketReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            room_id: reader.read_i32()?,
            token: reader.read_string()?,
            username: reader.read_string()?,
        })
    }
}

/// Room → master: confirm a ticket presented by a connecting player.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RoomAccessValidatePacket {
    pub room_id: i32,
    pub token: String,
    /// Empty to skip the username check.
    pub username: String,
}

impl Packet for RoomAccessValidatePacket {
    fn write(&self, writer: &mut PacketWriter) {
        writer.write_i32(self.room_id);
        writer.write_string(&self.token);
        writer.write_string(&self.username);
    }

    fn read(reader: &mut PacketReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            room_id: reader.read_i32()?,
            token: reader.read_string()?,
            username: reader.read_string()?,
        })
    }
}

/// Identity returned to a room after a successful ticket validation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UsernameAndPeerIdPacket {
    pub username: String,
    pub peer_id: u64,
}

impl Packet for UsernameAndPeerIdPacket {
    fn write(&self, writer: &mut PacketWriter) {
        writer.write_string(&self.username);
        writer.write_u64(self.peer_id);
    }

    fn read(reader: &mut PacketReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            username: reader.read_string()?,
            peer_id: reader.read_u64()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PlayerLeftRoomPacket {
    pub room_id: i32,
    pub peer_id: u64,
}

impl Packet for PlayerLeftRoomPacket {
    fn write(&self, writer: &mut PacketWriter) {
        writer.write_i32(self.room_id);
        writer.write_u64(self.peer_id);
    }

    fn read(reader: &mut PacketReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            room_id: reader.read_i32()?,
            peer_id: reader.read_u64()?,
        })
    }
}
