//! Login and echo.
//!
//! Identity is an opaque token checked by an [`Authenticator`]. A successful
//! `LogIn` fills the peer's user and security extensions; peers that never
//! log in are known as `Guest-<peer id>`.

use crate::dispatcher::handler_fn;
use crate::error::ServerError;
use crate::peer::UserExtension;
use crate::response::Response;
use crate::server::{MasterPlugin, MasterServer};
use async_trait::async_trait;
use master_protocol::{LogInPacket, OpCode, ResponseStatus};
use std::sync::Arc;
use tracing::info;

/// Accepted login: the permission level to grant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Grant {
    pub permission_level: i32,
}

/// Decides whether a username/token pair may log in.
#[async_trait]
pub trait Authenticator: Send + Sync + 'static {
    /// Returns the grant, or the reason for refusing.
    async fn authenticate(&self, username: &str, token: &str) -> Result<Grant, String>;
}

/// Accepts any non-empty username with permission level 0.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAllAuthenticator;

#[async_trait]
impl Authenticator for AcceptAllAuthenticator {
    async fn authenticate(&self, username: &str, _token: &str) -> Result<Grant, String> {
        if username.trim().is_empty() {
            return Err("Username must not be empty".to_string());
        }
        Ok(Grant::default())
    }
}

/// Installs the `Echo` and `LogIn` handlers.
pub struct AuthPlugin {
    authenticator: Arc<dyn Authenticator>,
}

impl AuthPlugin {
    pub fn new(authenticator: Arc<dyn Authenticator>) -> Self {
        Self { authenticator }
    }
}

impl Default for AuthPlugin {
    fn default() -> Self {
        Self::new(Arc::new(AcceptAllAuthenticator))
    }
}

#[async_trait]
impl MasterPlugin for AuthPlugin {
    fn name(&self) -> &'static str {
        "auth"
    }

    async fn install(self: Arc<Self>, server: &Arc<MasterServer>) -> Result<(), ServerError> {
        let dispatcher = server.dispatcher();

        dispatcher
            .register_handler(
                OpCode::Echo,
                handler_fn(|_peer, message| async move {
                    let text: String = message.deserialize()?;
                    Ok(Response::success(&text))
                }),
            )
            .await;

        let authenticator = self.authenticator.clone();
        dispatcher
            .register_handler(
                OpCode::LogIn,
                handler_fn(move |peer, message| {
                    let authenticator = authenticator.clone();
                    async move {
                        let credentials: LogInPacket = message.deserialize()?;
                        if peer.extensions().user.is_some() {
                            return Ok(Response::failure(ResponseStatus::Failed, "Already logged in"));
                        }

                        match authenticator
                            .authenticate(&credentials.username, &credentials.token)
                            .await
                        {
                            Ok(grant) => {
                                {
                                    let mut extensions = peer.extensions();
                                    extensions.security.permission_level = grant.permission_level;
                                    extensions.user = Some(UserExtension {
                                        username: credentials.username.clone(),
                                        token: credentials.token,
                                    });
                                }
                                info!("🔐 Peer {} logged in as {}", peer.id(), credentials.username);
                                Ok(Response::success(&credentials.username))
                            }
                            Err(reason) => Ok(Response::failure(ResponseStatus::Unauthorized, reason)),
                        }
                    }
                }),
            )
            .await;

        server.registry().insert(self);
        Ok(())
    }
}
