//! Connected endpoints and their per-peer state.
//!
//! A [`Peer`] is the handle every handler receives. It owns the outbound
//! queue feeding the connection's writer task, the table of requests it is
//! waiting on, and a fixed set of extension slots that plugins fill in
//! (login identity, permission level, spawner marker, spawn request).

use crate::error::ServerError;
use crate::pending::PendingRequests;
use crate::response::Response;
use dashmap::DashMap;
use master_protocol::{CorrelationId, Message, Packet, ResponseStatus};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace};

/// Identifier of a peer, unique within one process.
pub type PeerId = u64;

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Connected,
            _ => ConnectionState::Disconnected,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            ConnectionState::Connecting => 0,
            ConnectionState::Connected => 1,
            ConnectionState::Disconnected => 2,
        }
    }
}

/// Permission level of a peer. Higher is more privileged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SecurityExtension {
    pub permission_level: i32,
}

/// Identity attached by a successful `LogIn`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserExtension {
    pub username: String,
    pub token: String,
}

/// Marks a peer that registered itself as a spawner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnerExtension {
    pub region: String,
    pub max_processes: u32,
}

/// One slot per extension kind. Cleared when the peer disconnects.
#[derive(Debug, Clone, Default)]
pub struct PeerExtensions {
    pub security: SecurityExtension,
    pub user: Option<UserExtension>,
    pub spawner: Option<SpawnerExtension>,
    /// Latest spawn task requested by this peer as a client.
    pub spawn_request: Option<u32>,
}

/// A connected endpoint.
pub struct Peer {
    id: PeerId,
    remote_addr: Option<String>,
    state: AtomicU8,
    outbound: mpsc::UnboundedSender<Message>,
    pending: PendingRequests,
    extensions: Mutex<PeerExtensions>,
    closed: watch::Sender<bool>,
}

impl Peer {
    /// Creates a peer in the `Connected` state together with the receiving
    /// end of its outbound queue, which the connection's writer task drains.
    pub fn new(
        id: PeerId,
        remote_addr: Option<String>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Message>) {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(false);
        let peer = Arc::new(Self {
            id,
            remote_addr,
            state: AtomicU8::new(ConnectionState::Connected.as_u8()),
            outbound,
            pending: PendingRequests::new(),
            extensions: Mutex::new(PeerExtensions::default()),
            closed,
        });
        (peer, outbound_rx)
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn remote_addr(&self) -> Option<&str> {
        self.remote_addr.as_deref()
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn pending(&self) -> &PendingRequests {
        &self.pending
    }

    /// Locks the extension table.
    pub fn extensions(&self) -> MutexGuard<'_, PeerExtensions> {
        // A poisoned lock only means a panic elsewhere mid-update; the
        // table itself is plain data.
        self.extensions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Logged-in username, or `Guest-<id>`.
    pub fn username(&self) -> String {
        self.extensions()
            .user
            .as_ref()
            .map(|user| user.username.clone())
            .unwrap_or_else(|| format!("Guest-{}", self.id))
    }

    pub fn permission_level(&self) -> i32 {
        self.extensions().security.permission_level
    }

    /// Queues a raw message for the writer task.
    pub fn send_message(&self, message: Message) -> Result<(), ServerError> {
        if !self.is_connected() {
            return Err(ServerError::NotConnected(self.id));
        }
        trace!(peer = self.id, opcode = message.opcode, "Queueing message");
        self.outbound
            .send(message)
            .map_err(|_| ServerError::NotConnected(self.id))
    }

    /// Sends a fire-and-forget message.
    pub fn send<P: Packet>(&self, opcode: impl Into<u16>, packet: &P) -> Result<(), ServerError> {
        self.send_message(Message::one_way(opcode, packet.to_bytes()))
    }

    /// Answers request `id`.
    pub fn respond(
        &self,
        opcode: u16,
        id: CorrelationId,
        response: Response,
    ) -> Result<(), ServerError> {
        self.send_message(Message::response(
            opcode,
            id,
            response.status,
            response.payload,
        ))
    }

    /// Sends a request and waits for its response.
    ///
    /// Never fails: a closed connection yields `NotConnected` or
    /// `ConnectionClosed`, an elapsed deadline yields `Timeout`.
    pub async fn request<P: Packet>(
        &self,
        opcode: impl Into<u16>,
        packet: &P,
        timeout: Duration,
    ) -> Response {
        let opcode = opcode.into();
        let (id, mut rx) = self.pending.register();

        if self
            .send_message(Message::request(opcode, id, packet.to_bytes()))
            .is_err()
        {
            self.pending
                .resolve(id, Response::with_status(ResponseStatus::NotConnected));
        }

        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => Response::with_status(ResponseStatus::ConnectionClosed),
            Err(_) => {
                if self.pending.expire(id) {
                    debug!(peer = self.id, id, opcode, "Request timed out");
                }
                // Whoever claimed the slot first has already sent into it.
                rx.await
                    .unwrap_or_else(|_| Response::with_status(ResponseStatus::ConnectionClosed))
            }
        }
    }

    /// Closes the connection. Pending requests fail with `ConnectionClosed`
    /// and extensions are cleared. Idempotent.
    pub fn disconnect(&self) {
        let previous = self
            .state
            .swap(ConnectionState::Disconnected.as_u8(), Ordering::AcqRel);
        if ConnectionState::from_u8(previous) == ConnectionState::Disconnected {
            return;
        }

        self.closed.send_replace(true);
        let failed = self.pending.fail_all(ResponseStatus::ConnectionClosed);
        *self.extensions() = PeerExtensions::default();
        debug!(peer = self.id, failed_requests = failed, "Peer disconnected");
    }

    /// Resolves once [`disconnect`](Self::disconnect) has been called.
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        // The sender lives in `self`, so the channel cannot close first.
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .field("state", &self.state())
            .finish()
    }
}

/// Connected peers by id.
#[derive(Default)]
pub struct PeerTable {
    peers: DashMap<PeerId, Arc<Peer>>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, peer: Arc<Peer>) {
        self.peers.insert(peer.id(), peer);
    }

    pub fn remove(&self, id: PeerId) -> Option<Arc<Peer>> {
        self.peers.remove(&id).map(|(_, peer)| peer)
    }

    pub fn get(&self, id: PeerId) -> Option<Arc<Peer>> {
        self.peers.get(&id).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn all(&self) -> Vec<Arc<Peer>> {
        self.peers.iter().map(|entry| entry.value().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use master_protocol::MessageKind;

    #[test]
    fn guests_are_named_by_id() {
        let (peer, _rx) = Peer::new(17, None);
        assert_eq!(peer.username(), "Guest-17");

        peer.extensions().user = Some(UserExtension {
            username: "alice".into(),
            token: String::new(),
        });
        assert_eq!(peer.username(), "alice");
    }

    #[tokio::test]
    async fn request_times_out_without_answer() {
        let (peer, mut rx) = Peer::new(1, None);
        let response = peer
            .request(5u16, &(), Duration::from_millis(20))
            .await;
        assert_eq!(response.status, ResponseStatus::Timeout);

        // The request did go out.
        let sent = rx.recv().await.unwrap();
        assert!(matches!(sent.kind, MessageKind::Request(1)));
        assert!(peer.pending().is_empty());
    }

    #[tokio::test]
    async fn disconnect_fails_waiting_requests() {
        let (peer, _rx) = Peer::new(1, None);
        let waiter = {
            let peer = peer.clone();
            tokio::spawn(async move { peer.request(5u16, &(), Duration::from_secs(30)).await })
        };

        while peer.pending().is_empty() {
            tokio::task::yield_now().await;
        }
        peer.disconnect();

        let response = waiter.await.unwrap();
        assert_eq!(response.status, ResponseStatus::ConnectionClosed);
        assert!(!peer.is_connected());
        assert!(peer.send(5u16, &()).is_err());
    }

    #[tokio::test]
    async fn request_on_closed_peer_is_not_connected() {
        let (peer, _rx) = Peer::new(1, None);
        peer.disconnect();
        let response = peer.request(5u16, &(), Duration::from_secs(1)).await;
        assert_eq!(response.status, ResponseStatus::NotConnected);
    }
}
