//! Error types for the master server crate.
//!
//! Each concern gets its own enum so callers can match on what actually
//! went wrong. Handler-level failures that should reach the remote peer are
//! expressed as [`Response`](crate::Response)s instead; these types cover
//! the local side.

use crate::peer::PeerId;
use master_protocol::{ProtocolError, ResponseStatus, SpawnStatus};
use thiserror::Error;

/// Errors raised by the server core (listener, registry, plugin wiring).
#[derive(Error, Debug)]
pub enum ServerError {
    /// Network-related error (bind, accept, socket options).
    #[error("Network error: {0}")]
    Network(String),
    /// A component was looked up before anything registered it.
    #[error("Missing component: {0}")]
    MissingComponent(&'static str),
    /// The peer is not connected.
    #[error("Peer {0} is not connected")]
    NotConnected(PeerId),
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    /// Internal server error (invalid state, failed wiring, etc.)
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Unexpected failure inside a message handler.
///
/// Expected outcomes (bad password, wrong owner, ...) are returned as
/// non-success responses. A `HandlerError` is turned into a generic
/// `Error` response by the dispatcher, except for undecodable payloads
/// which disconnect the sender.
#[derive(Error, Debug)]
pub enum HandlerError {
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("Handler failed: {0}")]
    Internal(String),
}

/// Errors of the spawn orchestration flow, on either side of the wire.
#[derive(Error, Debug)]
pub enum SpawnError {
    #[error("Spawn task {0} not found")]
    TaskNotFound(u32),
    #[error("Unauthorized: {0}")]
    Unauthorized(String),
    #[error("Spawn task {spawn_id}: cannot move from {from} to {to}")]
    InvalidStateTransition {
        spawn_id: u32,
        from: SpawnStatus,
        to: SpawnStatus,
    },
    /// No registered spawner in the region has a free slot.
    #[error("No spawner with free capacity in region '{0}'")]
    CapacityExhausted(String),
    #[error("Peer {0} already registered a spawner")]
    AlreadyRegistered(PeerId),
    #[error("Spawn task {0} has no finalization data")]
    NotFinalized(u32),
    #[error("Failed to launch process: {0}")]
    Launch(String),
    #[error("Missing spawn argument: {0}")]
    MissingArgument(&'static str),
    #[error(transparent)]
    Session(#[from] SessionError),
}

impl SpawnError {
    /// Status reported to the remote peer.
    pub fn status(&self) -> ResponseStatus {
        match self {
            SpawnError::Unauthorized(_) => ResponseStatus::Unauthorized,
            SpawnError::Session(e) => e.status(),
            SpawnError::MissingArgument(_) => ResponseStatus::Error,
            _ => ResponseStatus::Failed,
        }
    }
}

/// Errors of the room access ticket flow.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RoomAccessError {
    #[error("Requester is not connected")]
    NotConnected,
    #[error("Room {0} does not exist")]
    UnknownRoom(i32),
    #[error("Peer does not own room {0}")]
    NotOwner(i32),
    /// The access validator refused the request.
    #[error("{0}")]
    Rejected(String),
    /// The ticket is unknown, consumed or does not match.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),
}

impl RoomAccessError {
    /// Status reported to the remote peer.
    pub fn status(&self) -> ResponseStatus {
        match self {
            RoomAccessError::NotConnected => ResponseStatus::NotConnected,
            RoomAccessError::UnknownRoom(_) | RoomAccessError::Rejected(_) => {
                ResponseStatus::Failed
            }
            RoomAccessError::NotOwner(_) | RoomAccessError::Unauthorized(_) => {
                ResponseStatus::Unauthorized
            }
        }
    }
}

/// Errors seen by the client side of a connection.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Not connected to the master server")]
    NotConnected,
    /// The remote side answered with a non-success status.
    #[error("Request failed with {status}: {message}")]
    Request {
        status: ResponseStatus,
        message: String,
    },
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

impl SessionError {
    pub fn status(&self) -> ResponseStatus {
        match self {
            SessionError::NotConnected => ResponseStatus::NotConnected,
            SessionError::Request { status, .. } => *status,
            SessionError::Protocol(_) => ResponseStatus::Error,
        }
    }
}
