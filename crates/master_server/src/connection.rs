//! Drives one framed connection for a [`Peer`].
//!
//! The reader side runs in the caller's task and dispatches inbound
//! messages in arrival order. The writer side is a separate task draining
//! the peer's outbound queue. Either side ending closes the peer.

use crate::dispatcher::Dispatcher;
use crate::peer::Peer;
use master_protocol::{FrameReader, FrameWriter, Message, ProtocolError};
use std::fmt;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Why a connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The remote side closed the stream.
    RemoteClosed,
    /// [`Peer::disconnect`] was called locally.
    Local,
    /// The remote side sent bytes that are not a valid message.
    ProtocolViolation(String),
    /// Transport failure.
    Io(String),
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::RemoteClosed => write!(f, "closed by remote"),
            DisconnectReason::Local => write!(f, "closed locally"),
            DisconnectReason::ProtocolViolation(reason) => write!(f, "protocol violation: {reason}"),
            DisconnectReason::Io(reason) => write!(f, "I/O error: {reason}"),
        }
    }
}

/// Runs the connection until it closes. When this returns, the peer is
/// disconnected and its pending requests have failed.
pub async fn run_connection<S>(
    stream: S,
    peer: Arc<Peer>,
    outbound: mpsc::UnboundedReceiver<Message>,
    dispatcher: Arc<Dispatcher>,
) -> DisconnectReason
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let writer = tokio::spawn(write_loop(FrameWriter::new(write_half), outbound, peer.clone()));
    let mut reader = FrameReader::new(read_half);

    let reason = loop {
        let frame = tokio::select! {
            _ = peer.closed() => break DisconnectReason::Local,
            frame = reader.read_frame() => frame,
        };

        match frame {
            Ok(Some(bytes)) => match Message::decode(&bytes) {
                Ok(message) => {
                    dispatcher.dispatch(&peer, message).await;
                    if !peer.is_connected() {
                        break DisconnectReason::Local;
                    }
                }
                Err(e) => {
                    warn!(peer = peer.id(), "Undecodable message: {}", e);
                    break DisconnectReason::ProtocolViolation(e.to_string());
                }
            },
            Ok(None) => break DisconnectReason::RemoteClosed,
            Err(ProtocolError::Io(e)) => break DisconnectReason::Io(e.to_string()),
            Err(e) => {
                warn!(peer = peer.id(), "Invalid frame: {}", e);
                break DisconnectReason::ProtocolViolation(e.to_string());
            }
        }
    };

    peer.disconnect();
    if let Err(e) = writer.await {
        debug!(peer = peer.id(), "Writer task ended abnormally: {}", e);
    }
    debug!(peer = peer.id(), "Connection finished: {}", reason);
    reason
}

async fn write_loop<W>(
    mut writer: FrameWriter<W>,
    mut outbound: mpsc::UnboundedReceiver<Message>,
    peer: Arc<Peer>,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let message = tokio::select! {
            message = outbound.recv() => message,
            _ = peer.closed() => None,
        };
        let Some(message) = message else { break };

        if let Err(e) = writer.write_frame(&message.encode()).await {
            debug!(peer = peer.id(), "Write failed: {}", e);
            peer.disconnect();
            return;
        }
    }

    // Flush whatever was queued before the close, e.g. a final response.
    while let Ok(message) = outbound.try_recv() {
        if writer.write_frame(&message.encode()).await.is_err() {
            break;
        }
    }
    let _ = writer.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::handler_fn;
    use crate::response::Response;
    use master_protocol::ResponseStatus;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn garbage_frame_is_a_protocol_violation() {
        let (local, mut remote) = tokio::io::duplex(1024);
        let (peer, outbound) = Peer::new(1, None);
        let task = tokio::spawn(run_connection(local, peer.clone(), outbound, Arc::new(Dispatcher::new())));

        // Valid frame, invalid flags byte.
        remote.write_all(&4u32.to_be_bytes()).await.unwrap();
        remote.write_all(&[0xff, 0, 1, 0]).await.unwrap();

        let reason = task.await.unwrap();
        assert!(matches!(reason, DisconnectReason::ProtocolViolation(_)));
        assert!(!peer.is_connected());
    }

    #[tokio::test]
    async fn requests_are_answered_over_the_stream() {
        let dispatcher = Arc::new(Dispatcher::new());
        dispatcher
            .register_handler(1u16, handler_fn(|_peer, message: Message| async move {
                Ok(Response::new(ResponseStatus::Success, message.payload))
            }))
            .await;

        let (local, remote) = tokio::io::duplex(1024);
        let (server_peer, outbound) = Peer::new(1, None);
        tokio::spawn(run_connection(local, server_peer, outbound, dispatcher));

        let (client_peer, client_outbound) = Peer::new(2, None);
        let client = tokio::spawn(run_connection(
            remote,
            client_peer.clone(),
            client_outbound,
            Arc::new(Dispatcher::new()),
        ));

        let response = client_peer
            .request(1u16, &"ping".to_string(), std::time::Duration::from_secs(5))
            .await;
        assert_eq!(response.status, ResponseStatus::Success);
        assert_eq!(response.message(), "ping");

        client_peer.disconnect();
        assert_eq!(client.await.unwrap(), DisconnectReason::Local);
    }

    #[tokio::test]
    async fn remote_close_is_reported() {
        let (local, remote) = tokio::io::duplex(64);
        let (peer, outbound) = Peer::new(1, None);
        let task = tokio::spawn(run_connection(local, peer, outbound, Arc::new(Dispatcher::new())));
        drop(remote);
        assert_eq!(task.await.unwrap(), DisconnectReason::RemoteClosed);
    }
}
