use super::spawned::{MASTER_ADDRESS_ENV, SPAWN_CODE_ENV, SPAWN_ID_ENV};
use crate::error::SpawnError;
use async_trait::async_trait;
use master_protocol::Properties;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::{Child, Command};
use tracing::debug;

/// Everything a spawned process needs to find its task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    pub spawn_id: u32,
    pub spawn_code: String,
    pub master_address: String,
    pub options: Properties,
}

impl LaunchRequest {
    /// `--spawn-id`, `--spawn-code` and `--master`, then every option as
    /// `--key value` in key order.
    pub fn arguments(&self) -> Vec<String> {
        let mut args = vec![
            "--spawn-id".to_string(),
            self.spawn_id.to_string(),
            "--spawn-code".to_string(),
            self.spawn_code.clone(),
            "--master".to_string(),
            self.master_address.clone(),
        ];
        let mut options: Vec<_> = self.options.iter().collect();
        options.sort();
        for (key, value) in options {
            args.push(format!("--{key}"));
            args.push(value.clone());
        }
        args
    }

    pub fn environment(&self) -> [(&'static str, String); 3] {
        [
            (SPAWN_ID_ENV, self.spawn_id.to_string()),
            (SPAWN_CODE_ENV, self.spawn_code.clone()),
            (MASTER_ADDRESS_ENV, self.master_address.clone()),
        ]
    }
}

/// A running process started for a spawn task.
#[async_trait]
pub trait SpawnedProcess: Send {
    /// OS process id, when there is one.
    fn id(&self) -> Option<u32>;

    /// Waits for exit and returns the exit code, if any.
    async fn wait(&mut self) -> io::Result<Option<i32>>;

    async fn kill(&mut self) -> io::Result<()>;
}

/// Starts processes for the spawner controller.
#[async_trait]
pub trait ProcessLauncher: Send + Sync + 'static {
    async fn launch(&self, request: &LaunchRequest) -> Result<Box<dyn SpawnedProcess>, SpawnError>;
}

/// Runs an executable with the spawn arguments appended to fixed ones.
#[derive(Debug, Clone)]
pub struct CommandLauncher {
    executable: PathBuf,
    args: Vec<String>,
}

impl CommandLauncher {
    pub fn new(executable: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            executable: executable.into(),
            args,
        }
    }
}

#[async_trait]
impl ProcessLauncher for CommandLauncher {
    async fn launch(&self, request: &LaunchRequest) -> Result<Box<dyn SpawnedProcess>, SpawnError> {
        let mut command = Command::new(&self.executable);
        command
            .args(&self.args)
            .args(request.arguments())
            .envs(request.environment())
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let child = command
            .spawn()
            .map_err(|e| SpawnError::Launch(format!("{}: {}", self.executable.display(), e)))?;
        debug!(
            spawn_id = request.spawn_id,
            pid = child.id(),
            "Started {}",
            self.executable.display()
        );
        Ok(Box::new(ChildProcess(child)))
    }
}

struct ChildProcess(Child);

#[async_trait]
impl SpawnedProcess for ChildProcess {
    fn id(&self) -> Option<u32> {
        self.0.id()
    }

    async fn wait(&mut self) -> io::Result<Option<i32>> {
        Ok(self.0.wait().await?.code())
    }

    async fn kill(&mut self) -> io::Result<()> {
        self.0.kill().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arguments_carry_spawn_identity_and_sorted_options() {
        let request = LaunchRequest {
            spawn_id: 4,
            spawn_code: "abc123".into(),
            master_address: "10.0.0.1:5000".into(),
            options: Properties::from([
                ("map".to_string(), "dust".to_string()),
                ("mode".to_string(), "ffa".to_string()),
            ]),
        };
        assert_eq!(
            request.arguments(),
            vec![
                "--spawn-id", "4", "--spawn-code", "abc123", "--master", "10.0.0.1:5000",
                "--map", "dust", "--mode", "ffa",
            ]
        );
        assert_eq!(request.environment()[0], (SPAWN_ID_ENV, "4".to_string()));
    }

    #[tokio::test]
    async fn missing_executable_is_a_launch_error() {
        let launcher = CommandLauncher::new("/nonexistent/game_server", Vec::new());
        let request = LaunchRequest {
            spawn_id: 1,
            spawn_code: "x".into(),
            master_address: "127.0.0.1:5000".into(),
            options: Properties::new(),
        };
        assert!(matches!(
            launcher.launch(&request).await,
            Err(SpawnError::Launch(_))
        ));
    }
}
