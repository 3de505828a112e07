//! The master server: listener, peer table and plugin wiring.
//!
//! `MasterServer` owns no game logic itself. Plugins install message
//! handlers on its dispatcher, publish their state in the component
//! registry and subscribe to peer disconnects; the server only accepts
//! connections and routes messages.

use crate::auth::AuthPlugin;
use crate::config::MasterConfig;
use crate::connection::{run_connection, DisconnectReason};
use crate::dispatcher::Dispatcher;
use crate::error::ServerError;
use crate::games::GamesPlugin;
use crate::peer::{Peer, PeerId, PeerTable};
use crate::registry::ComponentRegistry;
use crate::rooms::RoomsPlugin;
use crate::session::stop_requested;
use crate::spawner::SpawnerPlugin;
use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// A feature installed into the master server.
#[async_trait]
pub trait MasterPlugin: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Registers handlers, listeners and components.
    async fn install(self: Arc<Self>, server: &Arc<MasterServer>) -> Result<(), ServerError>;

    /// Periodic housekeeping, called from the maintenance task.
    fn maintain(&self) {}
}

/// Notified synchronously after a peer disconnected and left the peer table.
pub trait DisconnectListener: Send + Sync {
    fn on_peer_disconnected(&self, peer: &Arc<Peer>);
}

/// The master server.
pub struct MasterServer {
    config: MasterConfig,
    peers: Arc<PeerTable>,
    dispatcher: Arc<Dispatcher>,
    registry: ComponentRegistry,
    plugins: RwLock<Vec<Arc<dyn MasterPlugin>>>,
    disconnect_listeners: RwLock<Vec<Arc<dyn DisconnectListener>>>,
    next_peer_id: AtomicU64,
    shutdown: watch::Sender<bool>,
}

impl MasterServer {
    /// Creates a server with no plugins installed.
    pub fn new(config: MasterConfig) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            config,
            peers: Arc::new(PeerTable::new()),
            dispatcher: Arc::new(Dispatcher::new()),
            registry: ComponentRegistry::new(),
            plugins: RwLock::new(Vec::new()),
            disconnect_listeners: RwLock::new(Vec::new()),
            next_peer_id: AtomicU64::new(1),
            shutdown,
        })
    }

    /// Creates a server with the built-in plugins installed.
    pub async fn with_default_plugins(config: MasterConfig) -> Result<Arc<Self>, ServerError> {
        let server = Self::new(config);
        server.install_default_plugins().await?;
        Ok(server)
    }

    /// Installs login, games listing, rooms and spawners, in dependency order.
    pub async fn install_default_plugins(self: &Arc<Self>) -> Result<(), ServerError> {
        self.add_plugin(Arc::new(AuthPlugin::default())).await?;
        self.add_plugin(Arc::new(GamesPlugin::new())).await?;
        self.add_plugin(Arc::new(RoomsPlugin::default())).await?;
        self.add_plugin(Arc::new(SpawnerPlugin::new())).await?;
        Ok(())
    }

    pub async fn add_plugin<P: MasterPlugin>(self: &Arc<Self>, plugin: Arc<P>) -> Result<(), ServerError> {
        let name = plugin.name();
        plugin.clone().install(self).await.map_err(|e| {
            error!("Failed to install plugin {}: {}", name, e);
            e
        })?;
        write_lock(&self.plugins).push(plugin);
        info!("🔌 Installed plugin: {}", name);
        Ok(())
    }

    pub fn plugin_names(&self) -> Vec<&'static str> {
        read_lock(&self.plugins).iter().map(|p| p.name()).collect()
    }

    pub fn add_disconnect_listener(&self, listener: Arc<dyn DisconnectListener>) {
        write_lock(&self.disconnect_listeners).push(listener);
    }

    pub fn config(&self) -> &MasterConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn registry(&self) -> &ComponentRegistry {
        &self.registry
    }

    pub fn peers(&self) -> &Arc<PeerTable> {
        &self.peers
    }

    pub fn peer(&self, id: PeerId) -> Option<Arc<Peer>> {
        self.peers.get(id)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Binds the configured address. Must be called inside a runtime.
    pub fn bind(&self) -> Result<TcpListener, ServerError> {
        let address = self.config.bind_address;
        let socket = Socket::new(Domain::for_address(address), Type::STREAM, Some(Protocol::TCP))
            .map_err(|e| ServerError::Network(format!("Socket creation failed: {e}")))?;
        if let Err(e) = socket.set_reuse_address(true) {
            warn!("Failed to set SO_REUSEADDR: {}", e);
        }
        socket
            .set_nonblocking(true)
            .map_err(|e| ServerError::Network(format!("Failed to set non-blocking: {e}")))?;
        socket
            .bind(&address.into())
            .map_err(|e| ServerError::Network(format!("Bind failed: {e}")))?;
        socket
            .listen(1024)
            .map_err(|e| ServerError::Network(format!("Listen failed: {e}")))?;

        let std_listener: StdTcpListener = socket.into();
        TcpListener::from_std(std_listener)
            .map_err(|e| ServerError::Network(format!("Tokio listener creation failed: {e}")))
    }

    /// Binds and serves until [`shutdown`](Self::shutdown).
    pub async fn run(self: Arc<Self>) -> Result<(), ServerError> {
        let listener = self.bind()?;
        self.serve(listener).await
    }

    /// Accepts connections on `listener` until shutdown.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<(), ServerError> {
        let local: Option<SocketAddr> = listener.local_addr().ok();
        info!("🚀 Master server listening on {:?}", local);

        let mut shutdown = self.shutdown.subscribe();
        let maintenance = tokio::spawn(Self::maintenance_loop(self.clone()));

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, address)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!("Failed to set TCP_NODELAY for {}: {}", address, e);
                        }
                        self.accept_stream(stream, Some(address.to_string()));
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
                _ = stop_requested(&mut shutdown) => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        maintenance.abort();
        for peer in self.peers.all() {
            peer.disconnect();
        }
        info!("Server stopped");
        Ok(())
    }

    /// Stops `serve` and disconnects every peer.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Attaches an already-established byte stream as a new peer.
    pub fn accept_stream<S>(self: &Arc<Self>, stream: S, remote_addr: Option<String>) -> Arc<Peer>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let id = self.next_peer_id.fetch_add(1, Ordering::Relaxed);
        let (peer, outbound) = Peer::new(id, remote_addr);
        self.peers.insert(peer.clone());
        info!(
            "👋 Peer {} connected from {}",
            id,
            peer.remote_addr().unwrap_or("memory")
        );

        let server = self.clone();
        let connection_peer = peer.clone();
        tokio::spawn(async move {
            let reason = run_connection(
                stream,
                connection_peer.clone(),
                outbound,
                server.dispatcher.clone(),
            )
            .await;
            server.handle_disconnect(&connection_peer, reason);
        });

        peer
    }

    fn handle_disconnect(&self, peer: &Arc<Peer>, reason: DisconnectReason) {
        self.peers.remove(peer.id());
        let listeners = read_lock(&self.disconnect_listeners).clone();
        for listener in listeners {
            listener.on_peer_disconnected(peer);
        }
        info!("👋 Peer {} disconnected: {}", peer.id(), reason);
    }

    async fn maintenance_loop(server: Arc<Self>) {
        let period = server
            .config
            .maintenance_interval
            .max(Duration::from_millis(10));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let plugins = read_lock(&server.plugins).clone();
            for plugin in plugins {
                plugin.maintain();
            }
        }
    }

    /// Runs one maintenance pass immediately.
    pub fn run_maintenance(&self) {
        let plugins = read_lock(&self.plugins).clone();
        for plugin in plugins {
            plugin.maintain();
        }
    }
}

fn read_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use master_protocol::OpCode;
    use std::sync::atomic::AtomicUsize;

    struct CountingListener(AtomicUsize);

    impl DisconnectListener for CountingListener {
        fn on_peer_disconnected(&self, _peer: &Arc<Peer>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn disconnect_removes_peer_and_notifies_listeners() {
        let server = MasterServer::new(MasterConfig::default());
        let listener = Arc::new(CountingListener(AtomicUsize::new(0)));
        server.add_disconnect_listener(listener.clone());

        let (local, remote) = tokio::io::duplex(64);
        let peer = server.accept_stream(local, None);
        assert_eq!(server.peer_count(), 1);
        assert_eq!(peer.id(), 1);

        drop(remote);
        while server.peer_count() > 0 {
            tokio::task::yield_now().await;
        }
        // The listener runs right after the table removal, in the same task.
        while listener.0.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(listener.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn spawned_serve_accepts_tcp_and_stops_on_shutdown() {
        let server = MasterServer::new(MasterConfig::default());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let serving = tokio::spawn(server.clone().serve(listener));

        let _stream = tokio::net::TcpStream::connect(address).await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            while server.peer_count() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        let peer = server.peers().all().pop().unwrap();

        server.shutdown();
        tokio::time::timeout(Duration::from_secs(2), serving)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(!peer.is_connected());
    }

    #[tokio::test]
    async fn default_plugins_install_in_order() {
        let server = MasterServer::with_default_plugins(MasterConfig::default())
            .await
            .unwrap();
        assert_eq!(server.plugin_names(), vec!["auth", "games", "rooms", "spawners"]);

        let dispatcher = server.dispatcher();
        for opcode in [
            OpCode::LogIn,
            OpCode::FindGames,
            OpCode::ValidateRoomAccess,
            OpCode::RequestSpawn,
            OpCode::SpawnFinalization,
        ] {
            assert!(dispatcher.has_handler(opcode).await, "{opcode:?} has no handler");
        }
        assert!(!dispatcher.has_handler(OpCode::SpawnProcess).await);
    }
}
