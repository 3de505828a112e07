//! Reconnecting client connection to the master.
//!
//! Spawners, rooms and spawned processes all talk to the master through a
//! [`ClientSession`]. The session owns a background task that connects,
//! runs the connection, and reconnects with exponential backoff until
//! [`ClientSession::stop`] is called.
//!
//! ```text
//! Disconnected → Connecting → Connected → Disconnected → Connecting → ...
//! ```
//!
//! Backoff starts at `initial_backoff`, doubles after every failed attempt
//! up to `max_backoff`, and is reset by a successful connect and by the
//! following disconnect.

use crate::config::SessionConfig;
use crate::connection::run_connection;
use crate::dispatcher::Dispatcher;
use crate::error::SessionError;
use crate::peer::{Peer, PeerId};
use crate::response::Response;
use async_trait::async_trait;
use master_protocol::{Packet, ResponseStatus};
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Peer id used for the master on the client side.
pub const MASTER_PEER_ID: PeerId = 0;

/// Byte stream usable by a session.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// Opens the transport for a session.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self) -> io::Result<BoxedStream>;

    /// Target shown in logs.
    fn target(&self) -> String;
}

/// Connects over TCP.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    address: String,
}

impl TcpConnector {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> io::Result<BoxedStream> {
        let stream = TcpStream::connect(&self.address).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }

    fn target(&self) -> String {
        self.address.clone()
    }
}

/// Delay sequence between failed connection attempts.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Delay to wait after a failure; doubles the following one.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }

    pub fn initial(&self) -> Duration {
        self.initial
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Emitted once per successful connect and once per disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    Started,
    Stopped,
}

struct SessionInner {
    connector: Arc<dyn Connector>,
    dispatcher: Arc<Dispatcher>,
    config: SessionConfig,
    state: watch::Sender<SessionState>,
    events: broadcast::Sender<SessionEvent>,
    peer: Mutex<Option<Arc<Peer>>>,
    stop: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Client side of a master connection. Cheap to clone.
#[derive(Clone)]
pub struct ClientSession {
    inner: Arc<SessionInner>,
}

impl ClientSession {
    pub fn new(connector: Arc<dyn Connector>, config: SessionConfig) -> Self {
        Self::with_dispatcher(connector, config, Arc::new(Dispatcher::new()))
    }

    pub fn with_dispatcher(
        connector: Arc<dyn Connector>,
        config: SessionConfig,
        dispatcher: Arc<Dispatcher>,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Disconnected);
        let (events, _) = broadcast::channel(16);
        let (stop, _) = watch::channel(false);
        Self {
            inner: Arc::new(SessionInner {
                connector,
                dispatcher,
                config,
                state,
                events,
                peer: Mutex::new(None),
                stop,
                task: Mutex::new(None),
            }),
        }
    }

    /// Session connecting to `address` over TCP.
    pub fn tcp(address: impl Into<String>, config: SessionConfig) -> Self {
        Self::new(Arc::new(TcpConnector::new(address)), config)
    }

    /// Handlers for messages the master sends to this client.
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.inner.dispatcher
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    /// The live connection to the master, if any.
    pub fn peer(&self) -> Option<Arc<Peer>> {
        lock(&self.inner.peer).clone()
    }

    /// Starts the connect loop. No-op while it is already running.
    pub fn start(&self) {
        let mut task = lock(&self.inner.task);
        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            debug!("Session already running");
            return;
        }
        self.inner.stop.send_replace(false);
        *task = Some(tokio::spawn(connect_loop(self.inner.clone())));
    }

    /// Closes the connection and stops reconnecting. Pending requests fail
    /// with `ConnectionClosed`.
    pub async fn stop(&self) {
        self.inner.stop.send_replace(true);
        if let Some(peer) = self.peer() {
            peer.disconnect();
        }
        let handle = lock(&self.inner.task).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("Session task ended abnormally: {}", e);
            }
        }
    }

    /// Waits until connected, up to `timeout`.
    pub async fn wait_connected(&self, timeout: Duration) -> bool {
        let mut state = self.inner.state.subscribe();
        let connected = tokio::time::timeout(
            timeout,
            state.wait_for(|state| *state == SessionState::Connected),
        )
        .await;
        matches!(connected, Ok(Ok(_)))
    }

    pub fn send<P: Packet>(&self, opcode: impl Into<u16>, packet: &P) -> Result<(), SessionError> {
        let peer = self.peer().ok_or(SessionError::NotConnected)?;
        peer.send(opcode, packet)
            .map_err(|_| SessionError::NotConnected)
    }

    /// Sends a request with the configured timeout.
    pub async fn request<P: Packet>(&self, opcode: impl Into<u16>, packet: &P) -> Response {
        self.request_with_timeout(opcode, packet, self.inner.config.request_timeout)
            .await
    }

    pub async fn request_with_timeout<P: Packet>(
        &self,
        opcode: impl Into<u16>,
        packet: &P,
        timeout: Duration,
    ) -> Response {
        match self.peer() {
            Some(peer) => peer.request(opcode, packet, timeout).await,
            None => Response::with_status(ResponseStatus::NotConnected),
        }
    }

    /// Sends a request and decodes a successful response as `R`.
    pub async fn call<P: Packet, R: Packet>(
        &self,
        opcode: impl Into<u16>,
        packet: &P,
    ) -> Result<R, SessionError> {
        self.request(opcode, packet).await.into_packet()
    }
}

async fn connect_loop(inner: Arc<SessionInner>) {
    let mut backoff = Backoff::new(inner.config.initial_backoff, inner.config.max_backoff);
    let mut stop = inner.stop.subscribe();
    let target = inner.connector.target();

    while !*stop.borrow() {
        inner.state.send_replace(SessionState::Connecting);
        debug!("Connecting to {}", target);

        let attempt = tokio::select! {
            attempt = inner.connector.connect() => attempt,
            _ = stop_requested(&mut stop) => break,
        };

        match attempt {
            Ok(stream) => {
                backoff.reset();
                let (peer, outbound) = Peer::new(MASTER_PEER_ID, Some(target.clone()));
                *lock(&inner.peer) = Some(peer.clone());
                if *stop.borrow() {
                    // stop() ran between the connect and publishing the peer.
                    peer.disconnect();
                }

                inner.state.send_replace(SessionState::Connected);
                let _ = inner.events.send(SessionEvent::Started);
                info!("🔗 Connected to {}", target);

                let reason =
                    run_connection(stream, peer, outbound, inner.dispatcher.clone()).await;

                *lock(&inner.peer) = None;
                inner.state.send_replace(SessionState::Disconnected);
                let _ = inner.events.send(SessionEvent::Stopped);
                backoff.reset();
                info!("Disconnected from {}: {}", target, reason);

                if sleep_unless_stopped(&mut stop, backoff.initial()).await {
                    break;
                }
            }
            Err(e) => {
                inner.state.send_replace(SessionState::Disconnected);
                let delay = backoff.next_delay();
                warn!("Failed to connect to {}: {}; retrying in {:?}", target, e, delay);
                if sleep_unless_stopped(&mut stop, delay).await {
                    break;
                }
            }
        }
    }

    inner.state.send_replace(SessionState::Disconnected);
    debug!("Session for {} stopped", target);
}

/// Returns true when stopped during the wait.
async fn sleep_unless_stopped(stop: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    let stopped = tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        _ = stop_requested(stop) => true,
    };
    stopped || *stop.borrow()
}

/// Resolves once `stop` holds `true`. The borrowed value is released here so
/// callers stay `Send` across later awaits.
pub(crate) async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|stop| *stop).await;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    #[test]
    fn backoff_doubles_to_ceiling_and_resets() {
        let mut backoff = Backoff::new(Duration::from_millis(500), Duration::from_secs(4));
        let delays: Vec<u128> = (0..6).map(|_| backoff.next_delay().as_millis()).collect();
        assert_eq!(delays, vec![500, 1000, 2000, 4000, 4000, 4000]);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(500));
    }

    #[test]
    fn backoff_is_non_decreasing_until_reset() {
        let mut backoff = Backoff::new(Duration::from_millis(500), Duration::from_secs(4));
        let mut previous = Duration::ZERO;
        for _ in 0..20 {
            let delay = backoff.next_delay();
            assert!(delay >= previous);
            assert!(delay <= Duration::from_secs(4));
            previous = delay;
        }
    }

    /// Fails a fixed number of times, then hands out in-memory streams.
    struct FlakyConnector {
        failures: usize,
        attempts: Mutex<Vec<Instant>>,
        calls: AtomicUsize,
        remotes: Mutex<Vec<tokio::io::DuplexStream>>,
    }

    impl FlakyConnector {
        fn new(failures: usize) -> Arc<Self> {
            Arc::new(Self {
                failures,
                attempts: Mutex::new(Vec::new()),
                calls: AtomicUsize::new(0),
                remotes: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Connector for FlakyConnector {
        async fn connect(&self) -> io::Result<BoxedStream> {
            lock(&self.attempts).push(Instant::now());
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
                return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"));
            }
            let (local, remote) = tokio::io::duplex(64);
            lock(&self.remotes).push(remote);
            Ok(Box::new(local))
        }

        fn target(&self) -> String {
            "flaky".into()
        }
    }

    fn fast_config() -> SessionConfig {
        SessionConfig {
            initial_backoff: Duration::from_millis(20),
            max_backoff: Duration::from_millis(80),
            request_timeout: Duration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn reconnects_with_growing_delays() {
        let connector = FlakyConnector::new(3);
        let session = ClientSession::new(connector.clone(), fast_config());
        let mut events = session.subscribe();

        session.start();
        session.start();
        assert!(session.wait_connected(Duration::from_secs(5)).await);
        assert_eq!(events.recv().await.unwrap(), SessionEvent::Started);

        let attempts = lock(&connector.attempts).clone();
        assert_eq!(attempts.len(), 4, "second start() must not spawn another loop");
        let gaps: Vec<Duration> = attempts.windows(2).map(|w| w[1] - w[0]).collect();
        assert!(gaps[0] >= Duration::from_millis(20));
        assert!(gaps[1] >= Duration::from_millis(40));
        assert!(gaps[2] >= Duration::from_millis(80));

        session.stop().await;
        assert_eq!(events.recv().await.unwrap(), SessionEvent::Stopped);
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn stop_during_backoff_ends_loop() {
        let connector = FlakyConnector::new(usize::MAX);
        let config = SessionConfig {
            initial_backoff: Duration::from_secs(30),
            ..fast_config()
        };
        let session = ClientSession::new(connector.clone(), config);
        session.start();

        while lock(&connector.attempts).is_empty() {
            tokio::task::yield_now().await;
        }
        tokio::time::timeout(Duration::from_secs(2), session.stop())
            .await
            .expect("stop cancels the backoff wait");
        assert_eq!(lock(&connector.attempts).len(), 1);
    }

    #[tokio::test]
    async fn requests_without_connection_are_not_connected() {
        let session = ClientSession::tcp("127.0.0.1:1", fast_config());
        let response = session.request(1u16, &()).await;
        assert_eq!(response.status, ResponseStatus::NotConnected);
        assert!(matches!(session.send(1u16, &()), Err(SessionError::NotConnected)));
    }
}
