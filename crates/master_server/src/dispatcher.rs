//! Opcode routing for inbound messages.
//!
//! The dispatcher is shared by every connection of a process. Responses are
//! matched to the receiving peer's pending requests; everything else is
//! routed to the handler registered for its opcode.
//!
//! ## Failure handling
//!
//! - no handler: `NotHandled` when the sender waits for an answer, a warning
//!   otherwise
//! - handler error or panic: a generic `Error` response, never propagated
//! - undecodable payload: the sender is disconnected

use crate::error::HandlerError;
use crate::peer::Peer;
use crate::response::Response;
use async_trait::async_trait;
use futures::FutureExt;
use master_protocol::opcodes::describe;
use master_protocol::{Message, MessageKind, ResponseStatus};
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, warn};

/// Text of the response sent when a handler fails unexpectedly.
pub const INTERNAL_ERROR_MESSAGE: &str = "Internal server error";

/// Handles messages for one opcode.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Produces the response for `message`. The response is discarded when
    /// the sender did not ask for one.
    async fn handle(&self, peer: Arc<Peer>, message: Message) -> Result<Response, HandlerError>;
}

/// Adapter turning an async closure into a [`MessageHandler`].
pub struct FnHandler<F> {
    handler: F,
}

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(Arc<Peer>, Message) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Response, HandlerError>> + Send,
{
    async fn handle(&self, peer: Arc<Peer>, message: Message) -> Result<Response, HandlerError> {
        (self.handler)(peer, message).await
    }
}

/// Wraps a closure as a shareable handler.
pub fn handler_fn<F, Fut>(handler: F) -> Arc<dyn MessageHandler>
where
    F: Fn(Arc<Peer>, Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Response, HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler { handler })
}

/// Routes inbound messages by opcode.
#[derive(Default)]
pub struct Dispatcher {
    handlers: RwLock<HashMap<u16, Arc<dyn MessageHandler>>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `opcode`, replacing any previous one.
    pub async fn register_handler(&self, opcode: impl Into<u16>, handler: Arc<dyn MessageHandler>) {
        let opcode = opcode.into();
        let mut handlers = self.handlers.write().await;
        if handlers.insert(opcode, handler).is_some() {
            warn!("Replaced handler for opcode {}", describe(opcode));
        } else {
            debug!("Registered handler for opcode {}", describe(opcode));
        }
    }

    pub async fn has_handler(&self, opcode: impl Into<u16>) -> bool {
        self.handlers.read().await.contains_key(&opcode.into())
    }

    /// Processes one inbound message from `peer`.
    pub async fn dispatch(&self, peer: &Arc<Peer>, message: Message) {
        let request_id = match message.kind {
            MessageKind::Response(id) => {
                let response = Response::new(message.status, message.payload);
                if !peer.pending().resolve(id, response) {
                    debug!(
                        peer = peer.id(),
                        id, "Dropping response to an unknown or expired request"
                    );
                }
                return;
            }
            MessageKind::Request(id) => Some(id),
            MessageKind::OneWay => None,
        };

        let opcode = message.opcode;
        let handler = self.handlers.read().await.get(&opcode).cloned();
        let Some(handler) = handler else {
            match request_id {
                Some(id) => {
                    let _ = peer.respond(opcode, id, Response::with_status(ResponseStatus::NotHandled));
                }
                None => warn!(
                    peer = peer.id(),
                    "No handler for one-way message {}",
                    describe(opcode)
                ),
            }
            return;
        };

        let outcome = AssertUnwindSafe(handler.handle(peer.clone(), message))
            .catch_unwind()
            .await;

        let response = match outcome {
            Ok(Ok(response)) => response,
            Ok(Err(HandlerError::Protocol(e))) => {
                warn!(
                    peer = peer.id(),
                    "Malformed payload for {}: {}; disconnecting",
                    describe(opcode),
                    e
                );
                peer.disconnect();
                return;
            }
            Ok(Err(e)) => {
                error!(peer = peer.id(), "Handler for {} failed: {}", describe(opcode), e);
                Response::failure(ResponseStatus::Error, INTERNAL_ERROR_MESSAGE)
            }
            Err(_) => {
                error!(peer = peer.id(), "Handler for {} panicked", describe(opcode));
                Response::failure(ResponseStatus::Error, INTERNAL_ERROR_MESSAGE)
            }
        };

        match request_id {
            Some(id) => {
                if peer.respond(opcode, id, response).is_err() {
                    debug!(peer = peer.id(), "Peer left before the response to {} was sent", describe(opcode));
                }
            }
            None if !response.is_success() => debug!(
                peer = peer.id(),
                status = %response.status,
                "One-way {} was not processed: {}",
                describe(opcode),
                response.message()
            ),
            None => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use master_protocol::{Packet, ProtocolError};
    use tokio::sync::mpsc::UnboundedReceiver;

    async fn response_to(
        dispatcher: &Dispatcher,
        peer: &Arc<Peer>,
        rx: &mut UnboundedReceiver<Message>,
        message: Message,
    ) -> Message {
        dispatcher.dispatch(peer, message).await;
        rx.try_recv().expect("a response was queued")
    }

    #[tokio::test]
    async fn unknown_opcode_is_not_handled() {
        let dispatcher = Dispatcher::new();
        let (peer, mut rx) = Peer::new(1, None);

        let reply = response_to(&dispatcher, &peer, &mut rx, Message::request(900u16, 4, Vec::new())).await;
        assert_eq!(reply.status, ResponseStatus::NotHandled);
        assert_eq!(reply.kind, MessageKind::Response(4));
    }

    #[tokio::test]
    async fn unknown_one_way_is_dropped() {
        let dispatcher = Dispatcher::new();
        let (peer, mut rx) = Peer::new(1, None);

        dispatcher.dispatch(&peer, Message::one_way(900u16, Vec::new())).await;
        assert!(rx.try_recv().is_err());
        assert!(peer.is_connected());
    }

    #[tokio::test]
    async fn handler_result_is_sent_back() {
        let dispatcher = Dispatcher::new();
        dispatcher
            .register_handler(
                7u16,
                handler_fn(|_peer, message: Message| async move {
                    let value: u32 = message.deserialize()?;
                    Ok(Response::success(&(value * 2)))
                }),
            )
            .await;
        let (peer, mut rx) = Peer::new(1, None);

        let reply = response_to(&dispatcher, &peer, &mut rx, Message::request(7u16, 1, 21u32.to_bytes())).await;
        assert_eq!(reply.status, ResponseStatus::Success);
        assert_eq!(u32::from_bytes(&reply.payload).unwrap(), 42);
    }

    #[tokio::test]
    async fn failing_and_panicking_handlers_answer_with_generic_error() {
        let dispatcher = Dispatcher::new();
        dispatcher
            .register_handler(
                1u16,
                handler_fn(|_peer, _message| async move {
                    Err(HandlerError::Internal("database exploded".into()))
                }),
            )
            .await;
        dispatcher
            .register_handler(
                2u16,
                handler_fn(|_peer, _message| async move {
                    if true {
                        panic!("handler bug");
                    }
                    Ok(Response::ok())
                }),
            )
            .await;
        let (peer, mut rx) = Peer::new(1, None);

        for opcode in [1u16, 2u16] {
            let reply = response_to(&dispatcher, &peer, &mut rx, Message::request(opcode, 9, Vec::new())).await;
            assert_eq!(reply.status, ResponseStatus::Error);
            assert_eq!(String::from_bytes(&reply.payload).unwrap(), INTERNAL_ERROR_MESSAGE);
        }
        assert!(peer.is_connected());
    }

    #[tokio::test]
    async fn malformed_payload_disconnects_sender() {
        let dispatcher = Dispatcher::new();
        dispatcher
            .register_handler(
                3u16,
                handler_fn(|_peer, message: Message| async move {
                    let _: u32 = message.deserialize()?;
                    Ok(Response::ok())
                }),
            )
            .await;
        let (peer, _rx) = Peer::new(1, None);

        dispatcher.dispatch(&peer, Message::request(3u16, 1, vec![1])).await;
        assert!(!peer.is_connected());
    }

    #[tokio::test]
    async fn responses_resolve_pending_requests() {
        let dispatcher = Dispatcher::new();
        let (peer, _rx) = Peer::new(1, None);
        let (id, waiter) = peer.pending().register();

        dispatcher
            .dispatch(&peer, Message::response(5, id, ResponseStatus::Failed, Vec::new()))
            .await;
        assert_eq!(waiter.await.unwrap().status, ResponseStatus::Failed);

        // A duplicate is ignored.
        dispatcher
            .dispatch(&peer, Message::response(5, id, ResponseStatus::Success, Vec::new()))
            .await;
        assert!(peer.pending().is_empty());
    }

    #[test]
    fn protocol_errors_convert_into_handler_errors() {
        let err: HandlerError = ProtocolError::malformed("x").into();
        assert!(matches!(err, HandlerError::Protocol(_)));
    }
}
