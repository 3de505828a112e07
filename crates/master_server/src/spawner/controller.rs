use super::launcher::{LaunchRequest, ProcessLauncher, SpawnedProcess};
use crate::config::SpawnerConfig;
use crate::dispatcher::handler_fn;
use crate::error::{HandlerError, SpawnError};
use crate::response::Response;
use crate::session::{ClientSession, SessionEvent};
use master_protocol::{
    KillSpawnedProcessPacket, Message, OpCode, ResponseStatus, SpawnRequestPacket, SpawnerOptions,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Spawner side of the orchestration.
///
/// Registers with the master every time the session connects, starts a
/// process for each `SpawnProcess` command and reports exits with
/// `ProcessKilled`.
pub struct SpawnerController {
    session: ClientSession,
    config: SpawnerConfig,
    launcher: Arc<dyn ProcessLauncher>,
    processes: Mutex<HashMap<u32, oneshot::Sender<()>>>,
    spawner_id: Mutex<Option<u64>>,
    events_task: Mutex<Option<JoinHandle<()>>>,
}

impl SpawnerController {
    pub fn new(
        session: ClientSession,
        config: SpawnerConfig,
        launcher: Arc<dyn ProcessLauncher>,
    ) -> Arc<Self> {
        Arc::new(Self {
            session,
            config,
            launcher,
            processes: Mutex::new(HashMap::new()),
            spawner_id: Mutex::new(None),
            events_task: Mutex::new(None),
        })
    }

    pub fn session(&self) -> &ClientSession {
        &self.session
    }

    /// Id assigned by the master on the last registration.
    pub fn spawner_id(&self) -> Option<u64> {
        *lock(&self.spawner_id)
    }

    pub fn running_processes(&self) -> usize {
        lock(&self.processes).len()
    }

    /// Installs the command handlers and starts the session.
    pub async fn start(self: &Arc<Self>) {
        let dispatcher = self.session.dispatcher();

        let weak = Arc::downgrade(self);
        dispatcher
            .register_handler(
                OpCode::SpawnProcess,
                handler_fn(move |_peer, message| {
                    let controller = weak.clone();
                    async move {
                        match controller.upgrade() {
                            Some(controller) => controller.handle_spawn(message).await,
                            None => Ok(Response::with_status(ResponseStatus::NotHandled)),
                        }
                    }
                }),
            )
            .await;

        let weak = Arc::downgrade(self);
        dispatcher
            .register_handler(
                OpCode::KillSpawnedProcess,
                handler_fn(move |_peer, message| {
                    let controller = weak.clone();
                    async move {
                        let packet: KillSpawnedProcessPacket = message.deserialize()?;
                        Ok(match controller.upgrade() {
                            Some(controller) if controller.kill(packet.spawn_id) => Response::ok(),
                            _ => Response::failure(ResponseStatus::Failed, "Unknown spawn task"),
                        })
                    }
                }),
            )
            .await;

        // Subscribe before starting so the first `Started` is not missed.
        let events = self.session.subscribe();
        let task = tokio::spawn(registration_loop(Arc::downgrade(self), events));
        if let Some(previous) = lock(&self.events_task).replace(task) {
            previous.abort();
        }
        self.session.start();
    }

    /// Registers this spawner with the master.
    pub async fn register(&self) -> Result<u64, SpawnError> {
        let options = SpawnerOptions {
            region: self.config.region.clone(),
            max_processes: self.config.max_processes,
        };
        let id: u64 = self.session.call(OpCode::RegisterSpawner, &options).await?;
        *lock(&self.spawner_id) = Some(id);
        info!(
            "🏭 Registered as spawner {} (region '{}', max processes {})",
            id, options.region, options.max_processes
        );
        Ok(id)
    }

    async fn handle_spawn(self: Arc<Self>, message: Message) -> Result<Response, HandlerError> {
        let request: SpawnRequestPacket = message.deserialize()?;
        let spawn_id = request.spawn_id;

        // Capacity is tracked by the master; finalized rooms keep running here.

        let launch = LaunchRequest {
            spawn_id,
            spawn_code: request.spawn_code,
            master_address: self.config.address_for_processes().to_string(),
            options: request.options,
        };
        let process = match self.launcher.launch(&launch).await {
            Ok(process) => process,
            Err(e) => {
                error!("Failed to start process for spawn task {}: {}", spawn_id, e);
                return Ok(Response::failure(e.status(), e.to_string()));
            }
        };
        info!("🚀 Started process {:?} for spawn task {}", process.id(), spawn_id);

        let (kill_tx, kill_rx) = oneshot::channel();
        lock(&self.processes).insert(spawn_id, kill_tx);
        tokio::spawn(self.clone().supervise(spawn_id, process, kill_rx));

        if let Err(e) = self.session.send(OpCode::ProcessStarted, &spawn_id) {
            debug!(spawn_id, "ProcessStarted not sent: {}", e);
        }
        Ok(Response::ok())
    }

    async fn supervise(
        self: Arc<Self>,
        spawn_id: u32,
        mut process: Box<dyn SpawnedProcess>,
        kill_rx: oneshot::Receiver<()>,
    ) {
        let exit = tokio::select! {
            exit = process.wait() => exit,
            _ = kill_rx => {
                if let Err(e) = process.kill().await {
                    warn!(spawn_id, "Failed to kill process: {}", e);
                }
                process.wait().await
            }
        };

        lock(&self.processes).remove(&spawn_id);
        match exit {
            Ok(code) => info!("Process for spawn task {} exited with {:?}", spawn_id, code),
            Err(e) => warn!(spawn_id, "Lost track of process: {}", e),
        }
        if let Err(e) = self.session.send(OpCode::ProcessKilled, &spawn_id) {
            debug!(spawn_id, "ProcessKilled not sent: {}", e);
        }
    }

    /// Kills the process of `spawn_id`. False when there is none.
    pub fn kill(&self, spawn_id: u32) -> bool {
        match lock(&self.processes).remove(&spawn_id) {
            Some(kill) => {
                let _ = kill.send(());
                info!("Killing process of spawn task {}", spawn_id);
                true
            }
            None => false,
        }
    }

    /// Kills every process and disconnects from the master.
    pub async fn stop(&self) {
        if let Some(task) = lock(&self.events_task).take() {
            task.abort();
        }
        let kills: Vec<_> = lock(&self.processes).drain().collect();
        for (spawn_id, kill) in kills {
            debug!(spawn_id, "Killing process on shutdown");
            let _ = kill.send(());
        }
        self.session.stop().await;
    }
}

async fn registration_loop(
    controller: Weak<SpawnerController>,
    mut events: broadcast::Receiver<SessionEvent>,
) {
    loop {
        match events.recv().await {
            Ok(SessionEvent::Started) => {
                let Some(controller) = controller.upgrade() else {
                    return;
                };
                if let Err(e) = controller.register().await {
                    error!("Spawner registration failed: {}", e);
                }
            }
            Ok(SessionEvent::Stopped) => debug!("Connection to master lost"),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(skipped, "Session events lagged");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
