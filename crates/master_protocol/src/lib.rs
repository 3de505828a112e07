//! # Master Protocol
//!
//! Wire protocol spoken between the master server, spawners, rooms, spawned
//! processes and game clients.
//!
//! ## Layers
//!
//! - [`transport`]: `u32` length-prefixed frames over any async byte stream
//! - [`message`]: the envelope inside a frame (flags, opcode, status,
//!   correlation id, payload)
//! - [`codec`]: the [`Packet`] contract and the binary reader/writer used by
//!   every payload
//! - [`packets`]: payloads of the reserved [`OpCode`]s
//!
//! ## Example
//!
//! ```rust
//! use master_protocol::{Message, OpCode, Packet, SpawnerOptions};
//!
//! let options = SpawnerOptions { region: "EU".into(), max_processes: 4 };
//! let message = Message::request(OpCode::RegisterSpawner, 1, options.to_bytes());
//!
//! let decoded = Message::decode(&message.encode()).unwrap();
//! assert_eq!(decoded.deserialize::<SpawnerOptions>().unwrap(), options);
//! ```

pub mod codec;
pub mod error;
pub mod message;
pub mod opcodes;
pub mod packets;
pub mod transport;

pub use codec::{Packet, PacketReader, PacketWriter, Properties};
pub use error::ProtocolError;
pub use message::{CorrelationId, Message, MessageKind, ResponseStatus};
pub use opcodes::OpCode;
pub use packets::*;
pub use transport::{FrameReader, FrameWriter, MAX_FRAME_SIZE};
