//! # Master Server
//!
//! Core of a master server for multiplayer game backends. Game clients,
//! room (game server) processes, spawners and spawned processes all keep a
//! connection to one master, which brokers game listings, hands out room
//! access tickets and orchestrates process spawning.
//!
//! ## Design Philosophy
//!
//! The server core only moves messages. Every feature is a [`MasterPlugin`]
//! that installs opcode handlers on the shared [`Dispatcher`], publishes its
//! state in the [`ComponentRegistry`] and cleans up through a
//! [`DisconnectListener`]:
//!
//! * [`AuthPlugin`] - `Echo` and `LogIn`
//! * [`GamesPlugin`] - `FindGames` over every [`GamesProvider`]
//! * [`RoomsPlugin`] - room registration and single-use access tickets
//! * [`SpawnerPlugin`] - spawner registration and the spawn task lifecycle
//!
//! ## Messaging
//!
//! Every connection is a [`Peer`] with a reader task and a writer task.
//! Messages from one peer are handled one at a time, in arrival order.
//! Requests carry a correlation id and resolve exactly once: with the
//! response, a timeout, or the connection closing.
//!
//! The client side of a connection is a [`ClientSession`], which reconnects
//! with exponential backoff until stopped.
//!
//! ## Example
//!
//! ```rust,no_run
//! use master_server::{MasterConfig, MasterServer};
//!
//! # async fn run() -> Result<(), master_server::ServerError> {
//! let server = MasterServer::with_default_plugins(MasterConfig::default()).await?;
//! server.run().await
//! # }
//! ```

pub use auth::{AcceptAllAuthenticator, AuthPlugin, Authenticator, Grant};
pub use config::{MasterConfig, SessionConfig, SpawnerConfig};
pub use connection::DisconnectReason;
pub use dispatcher::{handler_fn, Dispatcher, MessageHandler, INTERNAL_ERROR_MESSAGE};
pub use error::{HandlerError, RoomAccessError, ServerError, SessionError, SpawnError};
pub use games::{GamesPlugin, GamesProvider};
pub use peer::{ConnectionState, Peer, PeerExtensions, PeerId, PeerTable};
pub use pending::PendingRequests;
pub use registry::ComponentRegistry;
pub use response::Response;
pub use rooms::{RoomAccessAuthority, RoomAccessValidator, RoomRegistry, RoomsPlugin};
pub use server::{DisconnectListener, MasterPlugin, MasterServer};
pub use session::{ClientSession, Connector, SessionEvent, SessionState, TcpConnector};
pub use spawner::{
    CommandLauncher, SpawnOrchestrator, SpawnTaskController, SpawnedProcessArgs,
    SpawnerController, SpawnerPlugin,
};

pub mod auth;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod games;
pub mod peer;
pub mod pending;
pub mod registry;
pub mod response;
pub mod rooms;
pub mod server;
pub mod session;
pub mod spawner;
