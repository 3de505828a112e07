use super::orchestrator::{SpawnEffect, SpawnOrchestrator, SpawnStatusSink};
use crate::dispatcher::{handler_fn, Dispatcher};
use crate::error::{HandlerError, ServerError, SpawnError};
use crate::peer::{Peer, PeerId, PeerTable, SpawnerExtension};
use crate::response::Response;
use crate::server::{DisconnectListener, MasterPlugin, MasterServer};
use async_trait::async_trait;
use master_protocol::{
    ClientsSpawnRequestPacket, KillSpawnedProcessPacket, Message, OpCode,
    RegisterSpawnedProcessPacket, ResponseStatus, SpawnFinalizationPacket, SpawnStatus,
    SpawnStatusUpdatePacket, SpawnerOptions,
};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::{debug, error, info, warn};

impl SpawnStatusSink for PeerTable {
    fn status_changed(&self, requester: PeerId, update: SpawnStatusUpdatePacket) {
        let Some(peer) = self.get(requester) else {
            return;
        };
        if let Err(e) = peer.send(OpCode::SpawnStatusChange, &update) {
            debug!(requester, spawn_id = update.spawn_id, "Status update not delivered: {}", e);
        }
    }
}

/// Spawners and spawn tasks.
///
/// The orchestrator is created at install time, once the server
/// configuration is known.
pub struct SpawnerPlugin {
    service: OnceLock<Arc<SpawnService>>,
}

impl SpawnerPlugin {
    pub fn new() -> Self {
        Self {
            service: OnceLock::new(),
        }
    }

    /// `None` until installed.
    pub fn orchestrator(&self) -> Option<&Arc<SpawnOrchestrator>> {
        self.service.get().map(|service| &service.orchestrator)
    }
}

impl Default for SpawnerPlugin {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MasterPlugin for SpawnerPlugin {
    fn name(&self) -> &'static str {
        "spawners"
    }

    async fn install(self: Arc<Self>, server: &Arc<MasterServer>) -> Result<(), ServerError> {
        let config = server.config();
        let orchestrator = Arc::new(SpawnOrchestrator::new(
            config.spawn_code_length,
            server.peers().clone(),
        ));
        let service = Arc::new(SpawnService {
            orchestrator: orchestrator.clone(),
            peers: server.peers().clone(),
            request_timeout: config.request_timeout,
            enable_client_spawn_requests: config.enable_client_spawn_requests,
            spawner_permission_level: config.spawner_permission_level,
            eviction_grace: config.task_eviction_grace,
        });
        self.service
            .set(service.clone())
            .map_err(|_| ServerError::Internal("spawner plugin installed twice".to_string()))?;

        let dispatcher = server.dispatcher();
        route(dispatcher, OpCode::RegisterSpawner, &service, SpawnService::register_spawner).await;
        route(dispatcher, OpCode::RequestSpawn, &service, SpawnService::request_spawn).await;
        route(
            dispatcher,
            OpCode::RegisterSpawnedProcess,
            &service,
            SpawnService::register_spawned_process,
        )
        .await;
        route(dispatcher, OpCode::SpawnFinalization, &service, SpawnService::finalize).await;
        route(dispatcher, OpCode::ProcessStarted, &service, SpawnService::process_started).await;
        route(dispatcher, OpCode::ProcessKilled, &service, SpawnService::process_killed).await;
        route(dispatcher, OpCode::KillSpawnedProcess, &service, SpawnService::kill).await;
        route(dispatcher, OpCode::AbortSpawnRequest, &service, SpawnService::abort).await;
        route(
            dispatcher,
            OpCode::GetSpawnFinalizationData,
            &service,
            SpawnService::finalization_data,
        )
        .await;

        server.add_disconnect_listener(self.clone());
        server.registry().insert(orchestrator);
        server.registry().insert(self);
        Ok(())
    }

    fn maintain(&self) {
        if let Some(service) = self.service.get() {
            service.orchestrator.evict_terminal(service.eviction_grace);
        }
    }
}

type SyncHandler = fn(&Arc<SpawnService>, &Arc<Peer>, Message) -> Result<Response, HandlerError>;

async fn route(
    dispatcher: &Dispatcher,
    opcode: OpCode,
    service: &Arc<SpawnService>,
    handle: SyncHandler,
) {
    let service = service.clone();
    dispatcher
        .register_handler(
            opcode,
            handler_fn(move |peer, message| {
                let result = handle(&service, &peer, message);
                async move { result }
            }),
        )
        .await;
}

fn failure(e: SpawnError) -> Response {
    Response::failure(e.status(), e.to_string())
}

struct SpawnService {
    orchestrator: Arc<SpawnOrchestrator>,
    peers: Arc<PeerTable>,
    request_timeout: Duration,
    enable_client_spawn_requests: bool,
    spawner_permission_level: i32,
    eviction_grace: Duration,
}

impl SpawnService {
    /// Carries out orchestrator effects. Each command runs in its own task.
    fn execute(self: &Arc<Self>, effects: Vec<SpawnEffect>) {
        for effect in effects {
            match effect {
                SpawnEffect::StartProcess { spawner, request } => {
                    let service = self.clone();
                    tokio::spawn(async move {
                        let spawn_id = request.spawn_id;
                        let response = match service.peers.get(spawner) {
                            Some(peer) => {
                                peer.request(OpCode::SpawnProcess, &request, service.request_timeout)
                                    .await
                            }
                            None => Response::with_status(ResponseStatus::NotConnected),
                        };

                        if response.is_success() {
                            if let Err(e) = service.orchestrator.process_started(spawn_id, spawner) {
                                debug!(spawn_id, "Start acknowledgement ignored: {}", e);
                            }
                            return;
                        }

                        warn!(
                            spawn_id,
                            spawner,
                            "Spawner failed to start process: {} {}",
                            response.status,
                            response.message()
                        );
                        match service.orchestrator.kill_spawn(spawn_id) {
                            Ok(effects) => service.execute(effects),
                            Err(e) => debug!(spawn_id, "Kill after failed start skipped: {}", e),
                        }
                    });
                }
                SpawnEffect::KillProcess { spawner, spawn_id } => {
                    let Some(peer) = self.peers.get(spawner) else {
                        continue;
                    };
                    let timeout = self.request_timeout;
                    tokio::spawn(async move {
                        let response = peer
                            .request(
                                OpCode::KillSpawnedProcess,
                                &KillSpawnedProcessPacket { spawn_id },
                                timeout,
                            )
                            .await;
                        if !response.is_success() {
                            debug!(
                                spawn_id,
                                spawner,
                                "Kill command not confirmed: {}",
                                response.status
                            );
                        }
                    });
                }
            }
        }
    }

    fn register_spawner(
        self: &Arc<Self>,
        peer: &Arc<Peer>,
        message: Message,
    ) -> Result<Response, HandlerError> {
        if peer.permission_level() < self.spawner_permission_level {
            return Ok(Response::failure(
                ResponseStatus::Unauthorized,
                "Insufficient permissions",
            ));
        }
        let options: SpawnerOptions = message.deserialize()?;

        let effects = match self.orchestrator.register_spawner(peer.id(), &options) {
            Ok(effects) => effects,
            Err(e) => return Ok(failure(e)),
        };
        peer.extensions().spawner = Some(SpawnerExtension {
            region: options.region,
            max_processes: options.max_processes,
        });
        self.execute(effects);
        Ok(Response::success(&peer.id()))
    }

    fn request_spawn(
        self: &Arc<Self>,
        peer: &Arc<Peer>,
        message: Message,
    ) -> Result<Response, HandlerError> {
        if !self.enable_client_spawn_requests {
            return Ok(Response::failure(ResponseStatus::Unauthorized, "Unauthorized"));
        }
        let request: ClientsSpawnRequestPacket = message.deserialize()?;

        let previous = peer.extensions().spawn_request;
        let busy = previous
            .and_then(|spawn_id| self.orchestrator.task(spawn_id))
            .is_some_and(|task| !task.status.is_done_starting_process());
        if busy {
            return Ok(Response::failure(
                ResponseStatus::Failed,
                "You already have an active request",
            ));
        }

        let (update, effects) =
            self.orchestrator
                .request_spawn(&request.region, request.options, Some(peer.id()));
        peer.extensions().spawn_request = Some(update.spawn_id);
        info!(
            "🎲 Peer {} requested spawn {} in region '{}'",
            peer.id(),
            update.spawn_id,
            request.region
        );
        self.execute(effects);
        Ok(Response::success(&update))
    }

    fn register_spawned_process(
        self: &Arc<Self>,
        peer: &Arc<Peer>,
        message: Message,
    ) -> Result<Response, HandlerError> {
        let packet: RegisterSpawnedProcessPacket = message.deserialize()?;
        Ok(
            match self
                .orchestrator
                .register_spawned_process(packet.spawn_id, &packet.spawn_code, peer.id())
            {
                Ok(options) => Response::success(&options),
                Err(e) => {
                    error!("Process registration for spawn {} refused: {}", packet.spawn_id, e);
                    failure(e)
                }
            },
        )
    }

    fn finalize(
        self: &Arc<Self>,
        peer: &Arc<Peer>,
        message: Message,
    ) -> Result<Response, HandlerError> {
        let packet: SpawnFinalizationPacket = message.deserialize()?;
        Ok(
            match self
                .orchestrator
                .finalize_spawn(packet.spawn_id, packet.finalization_data, peer.id())
            {
                Ok(effects) => {
                    self.execute(effects);
                    Response::ok()
                }
                Err(e) => failure(e),
            },
        )
    }

    fn process_started(
        self: &Arc<Self>,
        peer: &Arc<Peer>,
        message: Message,
    ) -> Result<Response, HandlerError> {
        let spawn_id: u32 = message.deserialize()?;
        Ok(match self.orchestrator.process_started(spawn_id, peer.id()) {
            Ok(_) => Response::ok(),
            Err(e) => {
                debug!(spawn_id, "ProcessStarted ignored: {}", e);
                failure(e)
            }
        })
    }

    fn process_killed(
        self: &Arc<Self>,
        peer: &Arc<Peer>,
        message: Message,
    ) -> Result<Response, HandlerError> {
        let spawn_id: u32 = message.deserialize()?;
        Ok(match self.orchestrator.process_killed(spawn_id, peer.id()) {
            Ok(effects) => {
                self.execute(effects);
                Response::ok()
            }
            Err(e) => {
                debug!(spawn_id, "ProcessKilled ignored: {}", e);
                failure(e)
            }
        })
    }

    /// Kill requested by the task's requester or by the process controlling it.
    fn kill(
        self: &Arc<Self>,
        peer: &Arc<Peer>,
        message: Message,
    ) -> Result<Response, HandlerError> {
        let packet: KillSpawnedProcessPacket = message.deserialize()?;
        let allowed = self
            .orchestrator
            .task(packet.spawn_id)
            .map(|task| task.requester == Some(peer.id()) || task.controller == Some(peer.id()));

        Ok(match allowed {
            None => failure(SpawnError::TaskNotFound(packet.spawn_id)),
            Some(false) => Response::failure(
                ResponseStatus::Unauthorized,
                "Not allowed to kill this spawn task",
            ),
            Some(true) => match self.orchestrator.kill_spawn(packet.spawn_id) {
                Ok(effects) => {
                    self.execute(effects);
                    Response::ok()
                }
                Err(e) => failure(e),
            },
        })
    }

    fn abort(
        self: &Arc<Self>,
        peer: &Arc<Peer>,
        _message: Message,
    ) -> Result<Response, HandlerError> {
        let current = peer
            .extensions()
            .spawn_request
            .and_then(|spawn_id| self.orchestrator.task(spawn_id));
        let Some(task) = current else {
            return Ok(Response::failure(
                ResponseStatus::Failed,
                "There's nothing to abort",
            ));
        };

        Ok(match task.status {
            SpawnStatus::Finalized => Response::failure(
                ResponseStatus::Failed,
                "You can't abort a completed request",
            ),
            SpawnStatus::Killed => Response::ok(),
            _ => match self.orchestrator.abort(task.id, peer.id()) {
                Ok(effects) => {
                    self.execute(effects);
                    Response::ok()
                }
                Err(e) => failure(e),
            },
        })
    }

    fn finalization_data(
        self: &Arc<Self>,
        peer: &Arc<Peer>,
        message: Message,
    ) -> Result<Response, HandlerError> {
        let spawn_id: u32 = message.deserialize()?;
        Ok(match self.orchestrator.finalization_data(spawn_id, peer.id()) {
            Ok(data) => Response::success(&data),
            Err(e) => failure(e),
        })
    }
}

impl DisconnectListener for SpawnerPlugin {
    fn on_peer_disconnected(&self, peer: &Arc<Peer>) {
        if let Some(service) = self.service.get() {
            let effects = service.orchestrator.peer_disconnected(peer.id());
            service.execute(effects);
        }
    }
}
