//! Message envelope shared by every peer.
//!
//! Wire layout of one frame:
//!
//! ```text
//! +-------+--------+--------+----------------------+-----------+
//! | flags | opcode | status | correlation id (opt) | payload.. |
//! |  u8   |  u16   |   u8   |         u32          |           |
//! +-------+--------+--------+----------------------+-----------+
//! ```
//!
//! The correlation id is present only when `flags` marks the message as a
//! request (the sender expects a response) or as a response.

use crate::codec::{Packet, PacketReader, PacketWriter};
use crate::error::ProtocolError;
use std::fmt;

const FLAG_EXPECTS_RESPONSE: u8 = 0x01;
const FLAG_IS_RESPONSE: u8 = 0x02;
const KNOWN_FLAGS: u8 = FLAG_EXPECTS_RESPONSE | FLAG_IS_RESPONSE;

/// Correlation id assigned by the sender of a request.
pub type CorrelationId = u32;

/// Outcome carried by a response.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseStatus {
    Success = 0,
    Error = 1,
    NotHandled = 2,
    Timeout = 3,
    Unauthorized = 4,
    Failed = 5,
    NotConnected = 6,
    /// Local teardown; pending requests fail with this status.
    ConnectionClosed = 7,
}

impl ResponseStatus {
    pub fn is_success(self) -> bool {
        self == ResponseStatus::Success
    }
}

impl TryFrom<u8> for ResponseStatus {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, ProtocolError> {
        Ok(match value {
            0 => ResponseStatus::Success,
            1 => ResponseStatus::Error,
            2 => ResponseStatus::NotHandled,
            3 => ResponseStatus::Timeout,
            4 => ResponseStatus::Unauthorized,
            5 => ResponseStatus::Failed,
            6 => ResponseStatus::NotConnected,
            7 => ResponseStatus::ConnectionClosed,
            other => {
                return Err(ProtocolError::malformed(format!(
                    "unknown response status {other}"
                )))
            }
        })
    }
}

impl fmt::Display for ResponseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Whether a message starts an exchange, answers one, or neither.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Fire-and-forget.
    OneWay,
    /// The sender waits for a response carrying the same id.
    Request(CorrelationId),
    /// Answer to the request with this id.
    Response(CorrelationId),
}

/// A decoded protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub opcode: u16,
    pub status: ResponseStatus,
    pub kind: MessageKind,
    pub payload: Vec<u8>,
}

impl Message {
    /// Creates a fire-and-forget message.
    pub fn one_way(opcode: impl Into<u16>, payload: Vec<u8>) -> Self {
        Self {
            opcode: opcode.into(),
            status: ResponseStatus::Success,
            kind: MessageKind::OneWay,
            payload,
        }
    }

    /// Creates a request expecting a response correlated by `id`.
    pub fn request(opcode: impl Into<u16>, id: CorrelationId, payload: Vec<u8>) -> Self {
        Self {
            opcode: opcode.into(),
            status: ResponseStatus::Success,
            kind: MessageKind::Request(id),
            payload,
        }
    }

    /// Creates the response to request `id`.
    pub fn response(
        opcode: u16,
        id: CorrelationId,
        status: ResponseStatus,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            opcode,
            status,
            kind: MessageKind::Response(id),
            payload,
        }
    }

    pub fn expects_response(&self) -> bool {
        matches!(self.kind, MessageKind::Request(_))
    }

    pub fn correlation_id(&self) -> Option<CorrelationId> {
        match self.kind {
            MessageKind::OneWay => None,
            MessageKind::Request(id) | MessageKind::Response(id) => Some(id),
        }
    }

    /// Decodes the payload as a packet.
    pub fn deserialize<P: Packet>(&self) -> Result<P, ProtocolError> {
        P::from_bytes(&self.payload)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut writer = PacketWriter::with_capacity(8 + self.payload.len());

        let flags = match self.kind {
            MessageKind::OneWay => 0,
            MessageKind::Request(_) => FLAG_EXPECTS_RESPONSE,
            MessageKind::Response(_) => FLAG_IS_RESPONSE,
        };
        writer.write_u8(flags);
        writer.write_u16(self.opcode);
        writer.write_u8(self.status as u8);
        if let Some(id) = self.correlation_id() {
            writer.write_u32(id);
        }

        let mut bytes = writer.into_bytes();
        bytes.extend_from_slice(&self.payload);
        bytes
    }

    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        let mut reader = PacketReader::new(data);

        let flags = reader.read_u8()?;
        if flags & !KNOWN_FLAGS != 0 {
            return Err(ProtocolError::malformed(format!("unknown flags {flags:#04x}")));
        }
        let opcode = reader.read_u16()?;
        let status = ResponseStatus::try_from(reader.read_u8()?)?;

        let kind = match (
            flags & FLAG_EXPECTS_RESPONSE != 0,
            flags & FLAG_IS_RESPONSE != 0,
        ) {
            (false, false) => MessageKind::OneWay,
            (true, false) => MessageKind::Request(reader.read_u32()?),
            (false, true) => MessageKind::Response(reader.read_u32()?),
            (true, true) => {
                return Err(ProtocolError::malformed(
                    "message cannot be both a request and a response",
                ))
            }
        };

        Ok(Self {
            opcode,
            status,
            kind,
            payload: reader.rest().to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_layout() {
        let message = Message::request(0x0102u16, 7, vec![0xaa]);
        assert_eq!(
            message.encode(),
            vec![0x01, 0x01, 0x02, 0x00, 0x00, 0x00, 0x00, 0x07, 0xaa]
        );
    }

    #[test]
    fn one_way_has_no_correlation_id() {
        let message = Message::one_way(5u16, b"hi".to_vec());
        let encoded = message.encode();
        assert_eq!(encoded.len(), 4 + 2);

        let decoded = Message::decode(&encoded).unwrap();
        assert_eq!(decoded.correlation_id(), None);
        assert!(!decoded.expects_response());
        assert_eq!(decoded.payload, b"hi");
    }

    #[test]
    fn response_keeps_status_and_id() {
        let message = Message::response(9, 42, ResponseStatus::Unauthorized, Vec::new());
        let decoded = Message::decode(&message.encode()).unwrap();
        assert_eq!(decoded.kind, MessageKind::Response(42));
        assert_eq!(decoded.status, ResponseStatus::Unauthorized);
    }

    #[test]
    fn conflicting_flags_are_malformed() {
        let bytes = [0x03, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x01];
        assert!(matches!(
            Message::decode(&bytes),
            Err(ProtocolError::MalformedMessage(_))
        ));
    }

    #[test]
    fn unknown_status_is_malformed() {
        let bytes = [0x00, 0x00, 0x01, 0xee];
        assert!(Message::decode(&bytes).is_err());
    }

    #[test]
    fn truncated_header_is_malformed() {
        assert!(Message::decode(&[0x01, 0x00]).is_err());
        assert!(Message::decode(&[0x01, 0x00, 0x01, 0x00, 0x00]).is_err());
        assert!(Message::decode(&[]).is_err());
    }
}
