//! `FindGames`: joinable games collected from every registered provider.

use crate::dispatcher::handler_fn;
use crate::error::ServerError;
use crate::peer::Peer;
use crate::response::Response;
use crate::server::{MasterPlugin, MasterServer};
use async_trait::async_trait;
use master_protocol::{GameInfoPacket, OpCode, Properties};
use std::sync::{Arc, RwLock};
use tracing::debug;

/// Source of game listings (rooms, lobbies, ...).
pub trait GamesProvider: Send + Sync {
    fn games(&self, filters: &Properties, requester: &Peer) -> Vec<GameInfoPacket>;
}

/// Aggregates [`GamesProvider`]s.
///
/// Results are concatenated in provider registration order. Overlapping
/// entries from different providers are returned as-is.
pub struct GamesPlugin {
    providers: RwLock<Vec<Arc<dyn GamesProvider>>>,
}

impl GamesPlugin {
    pub fn new() -> Self {
        Self {
            providers: RwLock::new(Vec::new()),
        }
    }

    pub fn add_provider(&self, provider: Arc<dyn GamesProvider>) {
        self.providers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(provider);
    }

    pub fn find_games(&self, filters: &Properties, requester: &Peer) -> Vec<GameInfoPacket> {
        let providers = self
            .providers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        providers
            .iter()
            .flat_map(|provider| provider.games(filters, requester))
            .collect()
    }
}

impl Default for GamesPlugin {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MasterPlugin for GamesPlugin {
    fn name(&self) -> &'static str {
        "games"
    }

    async fn install(self: Arc<Self>, server: &Arc<MasterServer>) -> Result<(), ServerError> {
        let games = self.clone();
        server
            .dispatcher()
            .register_handler(
                OpCode::FindGames,
                handler_fn(move |peer, message| {
                    let games = games.clone();
                    async move {
                        let filters: Properties = message.deserialize()?;
                        let list = games.find_games(&filters, &peer);
                        debug!(peer = peer.id(), count = list.len(), "FindGames");
                        Ok(Response::success(&list))
                    }
                }),
            )
            .await;

        server.registry().insert(self);
        Ok(())
    }
}
