#![allow(dead_code)]

use async_trait::async_trait;
use master_server::session::BoxedStream;
use master_server::spawner::{LaunchRequest, ProcessLauncher, SpawnedProcess};
use master_server::{
    ClientSession, Connector, MasterConfig, MasterServer, PeerId, SessionConfig, SpawnError,
};
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};

/// Connects sessions straight into a server over in-memory pipes.
pub struct MemoryConnector {
    server: Arc<MasterServer>,
    accepted: Mutex<Vec<PeerId>>,
}

impl MemoryConnector {
    pub fn new(server: &Arc<MasterServer>) -> Arc<Self> {
        Arc::new(Self {
            server: server.clone(),
            accepted: Mutex::new(Vec::new()),
        })
    }

    /// Server-side id of the most recent connection.
    pub fn last_peer(&self) -> Option<PeerId> {
        self.accepted.lock().unwrap().last().copied()
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> io::Result<BoxedStream> {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let peer = self.server.accept_stream(server, Some("memory".into()));
        self.accepted.lock().unwrap().push(peer.id());
        Ok(Box::new(client))
    }

    fn target(&self) -> String {
        "memory".into()
    }
}

pub fn fast_session_config() -> SessionConfig {
    SessionConfig {
        initial_backoff: Duration::from_millis(10),
        max_backoff: Duration::from_millis(50),
        request_timeout: Duration::from_secs(2),
    }
}

pub async fn start_master() -> Arc<MasterServer> {
    let config = MasterConfig {
        request_timeout: Duration::from_secs(2),
        ..MasterConfig::default()
    };
    MasterServer::with_default_plugins(config)
        .await
        .expect("default plugins install")
}

/// A connected session plus the id the server gave it.
pub async fn connect(server: &Arc<MasterServer>) -> (ClientSession, PeerId) {
    let connector = MemoryConnector::new(server);
    let session = ClientSession::new(connector.clone(), fast_session_config());
    session.start();
    assert!(
        session.wait_connected(Duration::from_secs(2)).await,
        "session did not connect"
    );
    let peer_id = connector.last_peer().expect("connection accepted");
    (session, peer_id)
}

/// Polls `condition` until it holds, failing after two seconds.
pub async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Records launches and hands out processes that run until killed.
pub struct FakeLauncher {
    launches: mpsc::UnboundedSender<LaunchRequest>,
}

impl FakeLauncher {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<LaunchRequest>) {
        let (launches, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { launches }), rx)
    }
}

#[async_trait]
impl ProcessLauncher for FakeLauncher {
    async fn launch(&self, request: &LaunchRequest) -> Result<Box<dyn SpawnedProcess>, SpawnError> {
        let _ = self.launches.send(request.clone());
        Ok(Box::new(FakeProcess {
            exit: Arc::new(Notify::new()),
        }))
    }
}

struct FakeProcess {
    exit: Arc<Notify>,
}

#[async_trait]
impl SpawnedProcess for FakeProcess {
    fn id(&self) -> Option<u32> {
        None
    }

    async fn wait(&mut self) -> io::Result<Option<i32>> {
        self.exit.notified().await;
        Ok(Some(0))
    }

    async fn kill(&mut self) -> io::Result<()> {
        self.exit.notify_one();
        Ok(())
    }
}

pub async fn next_launch(launches: &mut mpsc::UnboundedReceiver<LaunchRequest>) -> LaunchRequest {
    tokio::time::timeout(Duration::from_secs(2), launches.recv())
        .await
        .expect("launch within two seconds")
        .expect("launcher alive")
}
