use crate::error::SpawnError;
use crate::peer::PeerId;
use master_protocol::{
    Properties, SpawnRequestPacket, SpawnStatus, SpawnStatusUpdatePacket, SpawnerOptions,
};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Receives every status change of a task that has a requester.
///
/// Called with the orchestrator lock held, so updates for one task arrive
/// in transition order. Implementations must not block.
pub trait SpawnStatusSink: Send + Sync {
    fn status_changed(&self, requester: PeerId, update: SpawnStatusUpdatePacket);
}

/// Discards status updates.
pub struct NoStatusSink;

impl SpawnStatusSink for NoStatusSink {
    fn status_changed(&self, _requester: PeerId, _update: SpawnStatusUpdatePacket) {}
}

/// A spawner known to the master. Its id is the id of the owning peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnerRegistration {
    pub id: PeerId,
    pub region: String,
    /// 0 means unbounded.
    pub max_processes: u32,
    pub active: u32,
    order: u64,
}

impl SpawnerRegistration {
    pub fn has_capacity(&self) -> bool {
        self.max_processes == 0 || self.active < self.max_processes
    }

    fn serves(&self, region: &str) -> bool {
        region.is_empty() || self.region == region
    }
}

/// One request to start a process.
#[derive(Debug, Clone)]
pub struct SpawnTask {
    pub id: u32,
    pub requester: Option<PeerId>,
    pub region: String,
    pub options: Properties,
    pub spawner: Option<PeerId>,
    pub status: SpawnStatus,
    /// Registration code the spawned process must present.
    pub code: String,
    pub controller: Option<PeerId>,
    pub finalization_data: Option<Properties>,
    /// Every status the task went through, starting with `None`.
    pub history: Vec<SpawnStatus>,
    pub created_at: Instant,
    pub updated_at: Instant,
    holds_slot: bool,
}

/// Work the caller must carry out after the lock is released.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpawnEffect {
    /// Send `SpawnProcess` to the spawner and wait for its acknowledgement.
    StartProcess {
        spawner: PeerId,
        request: SpawnRequestPacket,
    },
    /// Best-effort `KillSpawnedProcess` to the spawner.
    KillProcess { spawner: PeerId, spawn_id: u32 },
}

#[derive(Default)]
struct OrchestratorState {
    spawners: HashMap<PeerId, SpawnerRegistration>,
    tasks: HashMap<u32, SpawnTask>,
    queue: VecDeque<u32>,
    next_spawn_id: u32,
    next_order: u64,
}

/// Owns spawners and spawn tasks and drives the task state machine.
///
/// All state sits behind one mutex. Operations never wait on the network:
/// commands for spawners come back as [`SpawnEffect`]s.
pub struct SpawnOrchestrator {
    state: Mutex<OrchestratorState>,
    sink: Arc<dyn SpawnStatusSink>,
    code_length: usize,
}

impl SpawnOrchestrator {
    pub fn new(code_length: usize, sink: Arc<dyn SpawnStatusSink>) -> Self {
        Self {
            state: Mutex::new(OrchestratorState {
                next_spawn_id: 1,
                ..OrchestratorState::default()
            }),
            sink,
            code_length: code_length.clamp(1, 32),
        }
    }

    fn lock(&self) -> MutexGuard<'_, OrchestratorState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Registers `peer` as a spawner and hands it any queued work it can take.
    pub fn register_spawner(
        &self,
        peer: PeerId,
        options: &SpawnerOptions,
    ) -> Result<Vec<SpawnEffect>, SpawnError> {
        let mut state = self.lock();
        if state.spawners.contains_key(&peer) {
            return Err(SpawnError::AlreadyRegistered(peer));
        }
        let order = state.next_order;
        state.next_order += 1;
        state.spawners.insert(
            peer,
            SpawnerRegistration {
                id: peer,
                region: options.region.clone(),
                max_processes: options.max_processes,
                active: 0,
                order,
            },
        );
        info!(
            "🏭 Spawner {} registered (region '{}', max processes {})",
            peer, options.region, options.max_processes
        );
        Ok(self.assign_queued(&mut state))
    }

    /// Removes a spawner. Every unfinished task assigned to it is killed.
    pub fn unregister_spawner(&self, peer: PeerId) -> Vec<u32> {
        let mut state = self.lock();
        if state.spawners.remove(&peer).is_none() {
            return Vec::new();
        }

        let mut killed = Vec::new();
        for task in state.tasks.values_mut() {
            if task.spawner == Some(peer) && !task.status.is_terminal() {
                task.holds_slot = false;
                self.set_status(task, SpawnStatus::Killed);
                killed.push(task.id);
            }
        }
        killed.sort_unstable();
        info!("🏭 Spawner {} removed, {} task(s) killed", peer, killed.len());
        killed
    }

    /// Creates a task and assigns it to the least loaded spawner serving
    /// `region` (any spawner when empty). Without free capacity the task
    /// stays `InQueue` until a spawner registers or a slot frees up.
    pub fn request_spawn(
        &self,
        region: &str,
        options: Properties,
        requester: Option<PeerId>,
    ) -> (SpawnStatusUpdatePacket, Vec<SpawnEffect>) {
        let mut state = self.lock();
        let spawn_id = state.next_spawn_id;
        state.next_spawn_id = state.next_spawn_id.wrapping_add(1).max(1);

        let now = Instant::now();
        let mut task = SpawnTask {
            id: spawn_id,
            requester,
            region: region.to_string(),
            options,
            spawner: None,
            status: SpawnStatus::None,
            code: self.generate_code(),
            controller: None,
            finalization_data: None,
            history: vec![SpawnStatus::None],
            created_at: now,
            updated_at: now,
            holds_slot: false,
        };
        self.set_status(&mut task, SpawnStatus::InQueue);
        debug!(spawn_id, region, "Spawn task created");

        state.tasks.insert(spawn_id, task);
        state.queue.push_back(spawn_id);
        let effects = self.assign_queued(&mut state);

        let status = state
            .tasks
            .get(&spawn_id)
            .map(|task| task.status)
            .unwrap_or(SpawnStatus::InQueue);
        (SpawnStatusUpdatePacket { spawn_id, status }, effects)
    }

    /// The spawner acknowledged the start command. Returns whether the
    /// status changed; a repeated or late acknowledgement is a no-op.
    pub fn process_started(&self, spawn_id: u32, spawner: PeerId) -> Result<bool, SpawnError> {
        let mut state = self.lock();
        let task = state
            .tasks
            .get_mut(&spawn_id)
            .ok_or(SpawnError::TaskNotFound(spawn_id))?;
        if task.spawner != Some(spawner) {
            return Err(SpawnError::Unauthorized(format!(
                "Spawn task {spawn_id} is not assigned to spawner {spawner}"
            )));
        }
        if task.status.is_done_starting_process() {
            return Ok(false);
        }
        self.transition(task, SpawnStatus::WaitingForProcess)?;
        Ok(true)
    }

    /// A spawned process connected back. On success `controller` is bound
    /// to the task and the task options are returned. A wrong code leaves
    /// the task untouched.
    pub fn register_spawned_process(
        &self,
        spawn_id: u32,
        code: &str,
        controller: PeerId,
    ) -> Result<Properties, SpawnError> {
        let mut state = self.lock();
        let task = state
            .tasks
            .get_mut(&spawn_id)
            .ok_or(SpawnError::TaskNotFound(spawn_id))?;
        if task.code != code {
            warn!(spawn_id, peer = controller, "Spawned process presented a wrong code");
            return Err(SpawnError::Unauthorized(
                "Invalid registration code".to_string(),
            ));
        }
        self.transition(task, SpawnStatus::ProcessRegistered)?;
        task.controller = Some(controller);
        info!("🎮 Process for spawn task {} registered as peer {}", spawn_id, controller);
        Ok(task.options.clone())
    }

    /// The controller reports the process ready. Frees the spawner slot.
    pub fn finalize_spawn(
        &self,
        spawn_id: u32,
        data: Properties,
        controller: PeerId,
    ) -> Result<Vec<SpawnEffect>, SpawnError> {
        let mut state = self.lock();
        let state = &mut *state;
        let task = state
            .tasks
            .get_mut(&spawn_id)
            .ok_or(SpawnError::TaskNotFound(spawn_id))?;
        if task.controller != Some(controller) {
            return Err(SpawnError::Unauthorized(
                "Only the registered process may finalize its task".to_string(),
            ));
        }
        self.transition(task, SpawnStatus::Finalized)?;
        task.finalization_data = Some(data);
        let released = release_slot(&mut state.spawners, task);
        info!("✅ Spawn task {} finalized", spawn_id);

        Ok(if released {
            self.assign_queued(state)
        } else {
            Vec::new()
        })
    }

    /// Kills an unfinished task and tells its spawner to stop the process.
    pub fn kill_spawn(&self, spawn_id: u32) -> Result<Vec<SpawnEffect>, SpawnError> {
        let mut state = self.lock();
        self.kill_locked(&mut state, spawn_id, true)
    }

    /// The spawner reports that the process exited. Tasks that already
    /// ended are left alone.
    pub fn process_killed(
        &self,
        spawn_id: u32,
        spawner: PeerId,
    ) -> Result<Vec<SpawnEffect>, SpawnError> {
        let mut state = self.lock();
        let task = state
            .tasks
            .get(&spawn_id)
            .ok_or(SpawnError::TaskNotFound(spawn_id))?;
        if task.spawner != Some(spawner) {
            return Err(SpawnError::Unauthorized(format!(
                "Spawn task {spawn_id} is not assigned to spawner {spawner}"
            )));
        }
        if task.status.is_terminal() {
            return Ok(Vec::new());
        }
        self.kill_locked(&mut state, spawn_id, false)
    }

    /// The requester gives up on its own task.
    pub fn abort(&self, spawn_id: u32, requester: PeerId) -> Result<Vec<SpawnEffect>, SpawnError> {
        let mut state = self.lock();
        let task = state
            .tasks
            .get(&spawn_id)
            .ok_or(SpawnError::TaskNotFound(spawn_id))?;
        if task.requester != Some(requester) {
            return Err(SpawnError::Unauthorized("You're not the requester".to_string()));
        }
        self.kill_locked(&mut state, spawn_id, true)
    }

    /// Cleans up after a disconnected peer: its spawner registration, the
    /// tasks it controls, and its requests still waiting in the queue.
    pub fn peer_disconnected(&self, peer: PeerId) -> Vec<SpawnEffect> {
        self.unregister_spawner(peer);

        let mut state = self.lock();
        let mut doomed: Vec<u32> = state
            .tasks
            .values()
            .filter(|task| !task.status.is_terminal())
            .filter(|task| {
                task.controller == Some(peer)
                    || (task.requester == Some(peer) && task.status == SpawnStatus::InQueue)
            })
            .map(|task| task.id)
            .collect();
        doomed.sort_unstable();

        let mut effects = Vec::new();
        for spawn_id in doomed {
            match self.kill_locked(&mut state, spawn_id, true) {
                Ok(more) => effects.extend(more),
                Err(e) => debug!(spawn_id, "Cleanup kill skipped: {}", e),
            }
        }
        effects
    }

    /// Finalization data of a task, for its requester only.
    pub fn finalization_data(
        &self,
        spawn_id: u32,
        requester: PeerId,
    ) -> Result<Properties, SpawnError> {
        let state = self.lock();
        let task = state
            .tasks
            .get(&spawn_id)
            .ok_or(SpawnError::TaskNotFound(spawn_id))?;
        if task.requester != Some(requester) {
            return Err(SpawnError::Unauthorized("You're not the requester".to_string()));
        }
        task.finalization_data
            .clone()
            .ok_or(SpawnError::NotFinalized(spawn_id))
    }

    /// Drops finished and killed tasks last updated more than `grace` ago.
    pub fn evict_terminal(&self, grace: Duration) -> usize {
        let mut state = self.lock();
        let before = state.tasks.len();
        state
            .tasks
            .retain(|_, task| !(task.status.is_terminal() && task.updated_at.elapsed() >= grace));
        let evicted = before - state.tasks.len();
        if evicted > 0 {
            debug!(evicted, "Evicted finished spawn tasks");
        }
        evicted
    }

    pub fn task(&self, spawn_id: u32) -> Option<SpawnTask> {
        self.lock().tasks.get(&spawn_id).cloned()
    }

    pub fn spawner(&self, peer: PeerId) -> Option<SpawnerRegistration> {
        self.lock().spawners.get(&peer).cloned()
    }

    pub fn spawner_count(&self) -> usize {
        self.lock().spawners.len()
    }

    pub fn task_count(&self) -> usize {
        self.lock().tasks.len()
    }

    /// Ids of tasks waiting for a spawner, oldest first.
    pub fn queued(&self) -> Vec<u32> {
        let state = self.lock();
        state
            .queue
            .iter()
            .copied()
            .filter(|id| {
                state
                    .tasks
                    .get(id)
                    .is_some_and(|task| task.status == SpawnStatus::InQueue)
            })
            .collect()
    }

    fn kill_locked(
        &self,
        state: &mut OrchestratorState,
        spawn_id: u32,
        notify_spawner: bool,
    ) -> Result<Vec<SpawnEffect>, SpawnError> {
        let task = state
            .tasks
            .get_mut(&spawn_id)
            .ok_or(SpawnError::TaskNotFound(spawn_id))?;
        let previous = task.status;
        self.transition(task, SpawnStatus::Killed)?;
        let released = release_slot(&mut state.spawners, task);
        info!("💀 Spawn task {} killed (was {})", spawn_id, previous);

        let mut effects = Vec::new();
        if notify_spawner && previous >= SpawnStatus::StartingProcess {
            if let Some(spawner) = task.spawner {
                effects.push(SpawnEffect::KillProcess { spawner, spawn_id });
            }
        }
        if released {
            effects.extend(self.assign_queued(state));
        }
        Ok(effects)
    }

    /// Assigns queued tasks in arrival order. Tasks nobody can take keep
    /// their place.
    fn assign_queued(&self, state: &mut OrchestratorState) -> Vec<SpawnEffect> {
        let mut effects = Vec::new();
        let mut waiting = VecDeque::with_capacity(state.queue.len());

        while let Some(spawn_id) = state.queue.pop_front() {
            let Some(task) = state.tasks.get_mut(&spawn_id) else {
                continue;
            };
            if task.status != SpawnStatus::InQueue {
                continue;
            }
            match select_spawner(&mut state.spawners, &task.region) {
                Ok(spawner) => {
                    spawner.active += 1;
                    task.spawner = Some(spawner.id);
                    task.holds_slot = true;
                    self.set_status(task, SpawnStatus::StartingProcess);
                    debug!(spawn_id, spawner = spawner.id, "Spawn task assigned");
                    effects.push(SpawnEffect::StartProcess {
                        spawner: spawner.id,
                        request: SpawnRequestPacket {
                            spawn_id,
                            spawn_code: task.code.clone(),
                            options: task.options.clone(),
                        },
                    });
                }
                Err(e) => {
                    debug!(spawn_id, "Spawn task stays queued: {}", e);
                    waiting.push_back(spawn_id);
                }
            }
        }

        state.queue = waiting;
        effects
    }

    fn transition(&self, task: &mut SpawnTask, next: SpawnStatus) -> Result<(), SpawnError> {
        if !task.status.can_transition_to(next) {
            return Err(SpawnError::InvalidStateTransition {
                spawn_id: task.id,
                from: task.status,
                to: next,
            });
        }
        self.set_status(task, next);
        Ok(())
    }

    fn set_status(&self, task: &mut SpawnTask, next: SpawnStatus) {
        task.status = next;
        task.history.push(next);
        task.updated_at = Instant::now();
        if let Some(requester) = task.requester {
            self.sink.status_changed(
                requester,
                SpawnStatusUpdatePacket {
                    spawn_id: task.id,
                    status: next,
                },
            );
        }
    }

    fn generate_code(&self) -> String {
        Uuid::new_v4()
            .simple()
            .to_string()
            .chars()
            .take(self.code_length)
            .collect()
    }
}

/// Least loaded spawner with a free slot; registration order breaks ties.
fn select_spawner<'a>(
    spawners: &'a mut HashMap<PeerId, SpawnerRegistration>,
    region: &str,
) -> Result<&'a mut SpawnerRegistration, SpawnError> {
    spawners
        .values_mut()
        .filter(|spawner| spawner.serves(region) && spawner.has_capacity())
        .min_by_key(|spawner| (spawner.active, spawner.order))
        .ok_or_else(|| SpawnError::CapacityExhausted(region.to_string()))
}

fn release_slot(spawners: &mut HashMap<PeerId, SpawnerRegistration>, task: &mut SpawnTask) -> bool {
    if !task.holds_slot {
        return false;
    }
    task.holds_slot = false;
    match task.spawner.and_then(|id| spawners.get_mut(&id)) {
        Some(spawner) => {
            spawner.active = spawner.active.saturating_sub(1);
            true
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const S1: PeerId = 10;
    const S2: PeerId = 11;
    const CLIENT: PeerId = 20;
    const PROCESS: PeerId = 30;

    #[derive(Default)]
    struct RecordingSink(Mutex<Vec<(PeerId, SpawnStatusUpdatePacket)>>);

    impl SpawnStatusSink for RecordingSink {
        fn status_changed(&self, requester: PeerId, update: SpawnStatusUpdatePacket) {
            self.0.lock().unwrap().push((requester, update));
        }
    }

    fn orchestrator() -> SpawnOrchestrator {
        SpawnOrchestrator::new(6, Arc::new(NoStatusSink))
    }

    fn eu(max_processes: u32) -> SpawnerOptions {
        SpawnerOptions {
            region: "EU".into(),
            max_processes,
        }
    }

    fn started_id(effects: &[SpawnEffect]) -> Option<(PeerId, u32)> {
        effects.iter().find_map(|effect| match effect {
            SpawnEffect::StartProcess { spawner, request } => Some((*spawner, request.spawn_id)),
            _ => None,
        })
    }

    #[test]
    fn single_slot_spawner_queues_second_request() {
        let orchestrator = orchestrator();
        orchestrator.register_spawner(S1, &eu(1)).unwrap();

        let (first, effects) = orchestrator.request_spawn("EU", Properties::new(), Some(CLIENT));
        assert_eq!(first.status, SpawnStatus::StartingProcess);
        assert_eq!(started_id(&effects), Some((S1, first.spawn_id)));
        assert_eq!(orchestrator.spawner(S1).unwrap().active, 1);

        let (second, effects) = orchestrator.request_spawn("EU", Properties::new(), Some(CLIENT));
        assert_eq!(second.status, SpawnStatus::InQueue);
        assert!(effects.is_empty());
        assert_eq!(orchestrator.queued(), vec![second.spawn_id]);

        let code = orchestrator.task(first.spawn_id).unwrap().code;
        orchestrator.register_spawned_process(first.spawn_id, &code, PROCESS).unwrap();
        let effects = orchestrator
            .finalize_spawn(first.spawn_id, Properties::new(), PROCESS)
            .unwrap();

        assert_eq!(orchestrator.task(first.spawn_id).unwrap().status, SpawnStatus::Finalized);
        assert_eq!(started_id(&effects), Some((S1, second.spawn_id)));
        assert_eq!(
            orchestrator.task(second.spawn_id).unwrap().status,
            SpawnStatus::StartingProcess
        );
        assert_eq!(orchestrator.spawner(S1).unwrap().active, 1);
        assert!(orchestrator.queued().is_empty());
    }

    #[test]
    fn queued_task_waits_for_a_spawner_in_its_region() {
        let orchestrator = orchestrator();
        let (task, effects) = orchestrator.request_spawn("EU", Properties::new(), None);
        assert!(effects.is_empty());

        let effects = orchestrator
            .register_spawner(
                S2,
                &SpawnerOptions {
                    region: "US".into(),
                    max_processes: 0,
                },
            )
            .unwrap();
        assert!(effects.is_empty());

        let effects = orchestrator.register_spawner(S1, &eu(0)).unwrap();
        assert_eq!(started_id(&effects), Some((S1, task.spawn_id)));
    }

    #[test]
    fn least_loaded_spawner_wins_with_registration_order_as_tie_break() {
        let orchestrator = orchestrator();
        orchestrator.register_spawner(S1, &eu(0)).unwrap();
        orchestrator.register_spawner(S2, &eu(0)).unwrap();

        let picks: Vec<PeerId> = (0..4)
            .map(|_| {
                let (_, effects) = orchestrator.request_spawn("", Properties::new(), None);
                started_id(&effects).unwrap().0
            })
            .collect();
        assert_eq!(picks, vec![S1, S2, S1, S2]);
    }

    #[test]
    fn wrong_code_leaves_task_untouched() {
        let orchestrator = orchestrator();
        orchestrator.register_spawner(S1, &eu(1)).unwrap();
        let (task, _) = orchestrator.request_spawn("EU", Properties::new(), None);
        orchestrator.process_started(task.spawn_id, S1).unwrap();

        let before = orchestrator.task(task.spawn_id).unwrap();
        let err = orchestrator
            .register_spawned_process(task.spawn_id, "nope", PROCESS)
            .unwrap_err();
        assert!(matches!(err, SpawnError::Unauthorized(_)));

        let after = orchestrator.task(task.spawn_id).unwrap();
        assert_eq!(after.status, SpawnStatus::WaitingForProcess);
        assert_eq!(after.history, before.history);
        assert_eq!(after.controller, None);

        assert!(matches!(
            orchestrator.register_spawned_process(999, &before.code, PROCESS),
            Err(SpawnError::TaskNotFound(999))
        ));
    }

    #[test]
    fn only_the_controller_finalizes() {
        let orchestrator = orchestrator();
        orchestrator.register_spawner(S1, &eu(1)).unwrap();
        let (task, _) = orchestrator.request_spawn("EU", Properties::new(), None);
        let code = orchestrator.task(task.spawn_id).unwrap().code;

        assert!(orchestrator
            .finalize_spawn(task.spawn_id, Properties::new(), PROCESS)
            .is_err());

        orchestrator.register_spawned_process(task.spawn_id, &code, PROCESS).unwrap();
        assert!(matches!(
            orchestrator.finalize_spawn(task.spawn_id, Properties::new(), CLIENT),
            Err(SpawnError::Unauthorized(_))
        ));
        assert_eq!(
            orchestrator.task(task.spawn_id).unwrap().status,
            SpawnStatus::ProcessRegistered
        );
    }

    #[test]
    fn kill_frees_the_slot_and_rejects_terminal_tasks() {
        let orchestrator = orchestrator();
        orchestrator.register_spawner(S1, &eu(1)).unwrap();
        let (first, _) = orchestrator.request_spawn("EU", Properties::new(), None);
        let (second, _) = orchestrator.request_spawn("EU", Properties::new(), None);

        let effects = orchestrator.kill_spawn(first.spawn_id).unwrap();
        assert!(effects.contains(&SpawnEffect::KillProcess {
            spawner: S1,
            spawn_id: first.spawn_id
        }));
        assert_eq!(started_id(&effects), Some((S1, second.spawn_id)));

        assert!(matches!(
            orchestrator.kill_spawn(first.spawn_id),
            Err(SpawnError::InvalidStateTransition {
                from: SpawnStatus::Killed,
                to: SpawnStatus::Killed,
                ..
            })
        ));
    }

    #[test]
    fn late_acknowledgement_is_ignored() {
        let orchestrator = orchestrator();
        orchestrator.register_spawner(S1, &eu(1)).unwrap();
        let (task, _) = orchestrator.request_spawn("EU", Properties::new(), None);
        let code = orchestrator.task(task.spawn_id).unwrap().code;

        orchestrator.register_spawned_process(task.spawn_id, &code, PROCESS).unwrap();
        assert!(!orchestrator.process_started(task.spawn_id, S1).unwrap());
        assert!(matches!(
            orchestrator.process_started(task.spawn_id, S2),
            Err(SpawnError::Unauthorized(_))
        ));
        assert_eq!(
            orchestrator.task(task.spawn_id).unwrap().status,
            SpawnStatus::ProcessRegistered
        );
    }

    #[test]
    fn spawner_disconnect_kills_its_tasks() {
        let orchestrator = orchestrator();
        orchestrator.register_spawner(S1, &eu(0)).unwrap();
        let (a, _) = orchestrator.request_spawn("EU", Properties::new(), None);
        let (b, _) = orchestrator.request_spawn("EU", Properties::new(), None);

        let effects = orchestrator.peer_disconnected(S1);
        assert!(effects.is_empty());
        assert_eq!(orchestrator.spawner_count(), 0);
        for id in [a.spawn_id, b.spawn_id] {
            assert_eq!(orchestrator.task(id).unwrap().status, SpawnStatus::Killed);
        }
    }

    #[test]
    fn requester_disconnect_drops_only_queued_requests() {
        let orchestrator = orchestrator();
        orchestrator.register_spawner(S1, &eu(1)).unwrap();
        let (running, _) = orchestrator.request_spawn("EU", Properties::new(), Some(CLIENT));
        let (queued, _) = orchestrator.request_spawn("EU", Properties::new(), Some(CLIENT));

        orchestrator.peer_disconnected(CLIENT);
        assert_eq!(
            orchestrator.task(running.spawn_id).unwrap().status,
            SpawnStatus::StartingProcess
        );
        assert_eq!(orchestrator.task(queued.spawn_id).unwrap().status, SpawnStatus::Killed);
    }

    #[test]
    fn requester_sees_every_status_in_order() {
        let sink = Arc::new(RecordingSink::default());
        let orchestrator = SpawnOrchestrator::new(6, sink.clone());
        orchestrator.register_spawner(S1, &eu(1)).unwrap();

        let (task, _) = orchestrator.request_spawn("EU", Properties::new(), Some(CLIENT));
        let code = orchestrator.task(task.spawn_id).unwrap().code;
        orchestrator.process_started(task.spawn_id, S1).unwrap();
        orchestrator.register_spawned_process(task.spawn_id, &code, PROCESS).unwrap();
        orchestrator
            .finalize_spawn(task.spawn_id, Properties::new(), PROCESS)
            .unwrap();

        let seen: Vec<SpawnStatus> = sink
            .0
            .lock()
            .unwrap()
            .iter()
            .map(|(requester, update)| {
                assert_eq!(*requester, CLIENT);
                update.status
            })
            .collect();
        assert_eq!(
            seen,
            vec![
                SpawnStatus::InQueue,
                SpawnStatus::StartingProcess,
                SpawnStatus::WaitingForProcess,
                SpawnStatus::ProcessRegistered,
                SpawnStatus::Finalized,
            ]
        );
    }

    #[test]
    fn finalization_data_is_for_the_requester() {
        let orchestrator = orchestrator();
        orchestrator.register_spawner(S1, &eu(1)).unwrap();
        let (task, _) = orchestrator.request_spawn("EU", Properties::new(), Some(CLIENT));
        assert!(matches!(
            orchestrator.finalization_data(task.spawn_id, CLIENT),
            Err(SpawnError::NotFinalized(_))
        ));

        let code = orchestrator.task(task.spawn_id).unwrap().code;
        orchestrator.register_spawned_process(task.spawn_id, &code, PROCESS).unwrap();
        let data = Properties::from([("address".to_string(), "10.0.0.5:7777".to_string())]);
        orchestrator.finalize_spawn(task.spawn_id, data.clone(), PROCESS).unwrap();

        assert_eq!(orchestrator.finalization_data(task.spawn_id, CLIENT).unwrap(), data);
        assert!(matches!(
            orchestrator.finalization_data(task.spawn_id, PROCESS),
            Err(SpawnError::Unauthorized(_))
        ));
    }

    #[test]
    fn terminal_tasks_are_evicted_after_grace() {
        let orchestrator = orchestrator();
        let (task, _) = orchestrator.request_spawn("", Properties::new(), None);
        orchestrator.request_spawn("", Properties::new(), None);
        orchestrator.kill_spawn(task.spawn_id).unwrap();

        assert_eq!(orchestrator.evict_terminal(Duration::from_secs(60)), 0);
        assert_eq!(orchestrator.evict_terminal(Duration::ZERO), 1);
        assert_eq!(orchestrator.task_count(), 1);
    }

    #[test]
    fn codes_have_configured_length() {
        let orchestrator = SpawnOrchestrator::new(8, Arc::new(NoStatusSink));
        let (a, _) = orchestrator.request_spawn("", Properties::new(), None);
        let (b, _) = orchestrator.request_spawn("", Properties::new(), None);
        let a = orchestrator.task(a.spawn_id).unwrap().code;
        let b = orchestrator.task(b.spawn_id).unwrap().code;
        assert_eq!(a.len(), 8);
        assert_ne!(a, b);
    }
}
