//! Binary packet codec.
//!
//! Every payload carried by a [`Message`](crate::Message) is a [`Packet`]:
//! a type that knows how to write its fields into a [`PacketWriter`] and read
//! them back from a [`PacketReader`]. The format is deliberately simple:
//!
//! * integers are fixed width, big-endian
//! * `bool` is a single byte (`0` or `1`)
//! * strings and byte blobs are prefixed with a `u32` length
//! * string maps are prefixed with a `u32` entry count, followed by
//!   key/value string pairs
//! * nested packets are written inline with the same rules
//!
//! Decoding never panics; running out of input, invalid UTF-8 or trailing
//! bytes all produce [`ProtocolError::MalformedMessage`].

use crate::error::ProtocolError;
use std::collections::HashMap;

/// String key/value bag used for spawn options, room properties and
/// finalization data.
pub type Properties = HashMap<String, String>;

/// A structured payload with a binary representation.
pub trait Packet: Sized + Send + Sync + 'static {
    /// Appends the packet's fields to `writer`.
    fn write(&self, writer: &mut PacketWriter);

    /// Reads the packet's fields from `reader`.
    fn read(reader: &mut PacketReader<'_>) -> Result<Self, ProtocolError>;

    /// Encodes the packet into a standalone byte vector.
    fn to_bytes(&self) -> Vec<u8> {
        let mut writer = PacketWriter::new();
        self.write(&mut writer);
        writer.into_bytes()
    }

    /// Decodes a packet that must occupy the whole buffer.
    fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        let mut reader = PacketReader::new(data);
        let packet = Self::read(&mut reader)?;
        reader.finish()?;
        Ok(packet)
    }
}

/// Growable output buffer for packet encoding.
#[derive(Debug, Default, Clone)]
pub struct PacketWriter {
    buffer: Vec<u8>,
}

impl PacketWriter {
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity),
        }
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buffer.push(value);
    }

    pub fn write_i8(&mut self, value: i8) {
        self.buffer.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_u16(&mut self, value: u16) {
        self.buffer.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_u32(&mut self, value: u32) {
        self.buffer.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_i32(&mut self, value: i32) {
        self.buffer.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_u64(&mut self, value: u64) {
        self.buffer.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_bool(&mut self, value: bool) {
        self.buffer.push(u8::from(value));
    }

    /// Writes a `u32` length prefix followed by the raw bytes.
    pub fn write_bytes(&mut self, value: &[u8]) {
        self.write_u32(value.len() as u32);
        self.buffer.extend_from_slice(value);
    }

    pub fn write_string(&mut self, value: &str) {
        self.write_bytes(value.as_bytes());
    }

    /// Writes a string map. Entries are sorted by key so identical maps
    /// always encode to identical bytes.
    pub fn write_map(&mut self, map: &Properties) {
        let mut entries: Vec<(&String, &String)> = map.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));

        self.write_u32(entries.len() as u32);
        for (key, value) in entries {
            self.write_string(key);
            self.write_string(value);
        }
    }

    /// Writes a `u32` element count followed by each packet.
    pub fn write_list<P: Packet>(&mut self, items: &[P]) {
        self.write_u32(items.len() as u32);
        for item in items {
            item.write(self);
        }
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }
}

/// Cursor over an input buffer for packet decoding.
#[derive(Debug)]
pub struct PacketReader<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> PacketReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, position: 0 }
    }

    fn take(&mut self, count: usize) -> Result<&'a [u8], ProtocolError> {
        let end = self
            .position
            .checked_add(count)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| {
                ProtocolError::malformed(format!(
                    "needed {} bytes at offset {}, only {} available",
                    count,
                    self.position,
                    self.remaining()
                ))
            })?;

        let slice = &self.data[self.position..end];
        self.position = end;
        Ok(slice)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N], ProtocolError> {
        let mut array = [0u8; N];
        array.copy_from_slice(self.take(N)?);
        Ok(array)
    }

    pub fn read_u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_i8(&mut self) -> Result<i8, ProtocolError> {
        Ok(i8::from_be_bytes(self.take_array()?))
    }

    pub fn read_u16(&mut self) -> Result<u16, ProtocolError> {
        Ok(u16::from_be_bytes(self.take_array()?))
    }

    pub fn read_u32(&mut self) -> Result<u32, ProtocolError> {
        Ok(u32::from_be_bytes(self.take_array()?))
    }

    pub fn read_i32(&mut self) -> Result<i32, ProtocolError> {
        Ok(i32::from_be_bytes(self.take_array()?))
    }

    pub fn read_u64(&mut self) -> Result<u64, ProtocolError> {
        Ok(u64::from_be_bytes(self.take_array()?))
    }

    pub fn read_bool(&mut self) -> Result<bool, ProtocolError> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(ProtocolError::malformed(format!("invalid bool byte {other}"))),
        }
    }

    pub fn read_string(&mut self) -> Result<String, ProtocolError> {
        let len = self.read_u32()? as usize;
        let raw = self.take(len)?;
        std::str::from_utf8(raw)
            .map(str::to_owned)
            .map_err(|e| ProtocolError::malformed(format!("invalid UTF-8 string: {e}")))
    }

    pub fn read_map(&mut self) -> Result<Properties, ProtocolError> {
        let count = self.read_u32()? as usize;
        // Every entry needs at least two length prefixes.
        if count > self.remaining() / 8 {
            return Err(ProtocolError::malformed(format!(
                "map announces {count} entries but only {} bytes remain",
                self.remaining()
            )));
        }

        let mut map = Properties::with_capacity(count);
        for _ in 0..count {
            let key = self.read_string()?;
            let value = self.read_string()?;
            map.insert(key, value);
        }
        Ok(map)
    }

    pub fn read_list<P: Packet>(&mut self) -> Result<Vec<P>, ProtocolError> {
        let count = self.read_u32()? as usize;
        if count > self.remaining() {
            return Err(ProtocolError::malformed(format!(
                "list announces {count} items but only {} bytes remain",
                self.remaining()
            )));
        }

        let mut items = Vec::with_capacity(count);
        for _ in 0..count {
            items.push(P::read(self)?);
        }
        Ok(items)
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.position
    }

    /// Returns the rest of the buffer without copying.
    pub fn rest(&mut self) -> &'a [u8] {
        let rest = &self.data[self.position..];
        self.position = self.data.len();
        rest
    }

    /// Fails if any input was left unread.
    pub fn finish(&self) -> Result<(), ProtocolError> {
        if self.remaining() == 0 {
            Ok(())
        } else {
            Err(ProtocolError::malformed(format!(
                "{} trailing bytes after packet",
                self.remaining()
            )))
        }
    }
}

// Primitive payloads used by simple request/response pairs.

impl Packet for () {
    fn write(&self, _writer: &mut PacketWriter) {}

    fn read(_reader: &mut PacketReader<'_>) -> Result<Self, ProtocolError> {
        Ok(())
    }
}

impl Packet for String {
    fn write(&self, writer: &mut PacketWriter) {
        writer.write_string(self);
    }

    fn read(reader: &mut PacketReader<'_>) -> Result<Self, ProtocolError> {
        reader.read_string()
    }
}

impl Packet for u32 {
    fn write(&self, writer: &mut PacketWriter) {
        writer.write_u32(*self);
    }

    fn read(reader: &mut PacketReader<'_>) -> Result<Self, ProtocolError> {
        reader.read_u32()
    }
}

impl Packet for i32 {
    fn write(&self, writer: &mut PacketWriter) {
        writer.write_i32(*self);
    }

    fn read(reader: &mut PacketReader<'_>) -> Result<Self, ProtocolError> {
        reader.read_i32()
    }
}

impl Packet for u64 {
    fn write(&self, writer: &mut PacketWriter) {
        writer.write_u64(*self);
    }

    fn read(reader: &mut PacketReader<'_>) -> Result<Self, ProtocolError> {
        reader.read_u64()
    }
}

impl Packet for Properties {
    fn write(&self, writer: &mut PacketWriter) {
        writer.write_map(self);
    }

    fn read(reader: &mut PacketReader<'_>) -> Result<Self, ProtocolError> {
        reader.read_map()
    }
}
