//! On-demand process spawning.
//!
//! Three parties take part:
//!
//! - the master runs the [`SpawnOrchestrator`] through the
//!   [`SpawnerPlugin`]: it queues requests, picks a spawner and tracks every
//!   task through its lifecycle
//! - a spawner process runs a [`SpawnerController`], which starts and kills
//!   processes on the master's command
//! - the started process uses [`SpawnedProcessArgs`] and a
//!   [`SpawnTaskController`] to register with the master and finalize
//!
//! ```text
//! client ──RequestSpawn──▶ master ──SpawnProcess──▶ spawner ──▶ process
//! process ──RegisterSpawnedProcess / SpawnFinalization──▶ master
//! master ──SpawnStatusChange──▶ client
//! ```

mod controller;
mod launcher;
mod orchestrator;
mod plugin;
mod spawned;

pub use controller::SpawnerController;
pub use launcher::{CommandLauncher, LaunchRequest, ProcessLauncher, SpawnedProcess};
pub use orchestrator::{
    NoStatusSink, SpawnEffect, SpawnOrchestrator, SpawnStatusSink, SpawnTask, SpawnerRegistration,
};
pub use plugin::SpawnerPlugin;
pub use spawned::{
    SpawnTaskController, SpawnedProcessArgs, MASTER_ADDRESS_ENV, SPAWN_CODE_ENV, SPAWN_ID_ENV,
};
