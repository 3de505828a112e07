use crate::error::SpawnError;
use crate::session::ClientSession;
use master_protocol::{OpCode, Properties, RegisterSpawnedProcessPacket, SpawnFinalizationPacket};
use tracing::info;

pub const SPAWN_ID_ENV: &str = "MASTER_SPAWN_ID";
pub const SPAWN_CODE_ENV: &str = "MASTER_SPAWN_CODE";
pub const MASTER_ADDRESS_ENV: &str = "MASTER_ADDRESS";

/// Spawn identity handed to a process by its spawner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnedProcessArgs {
    pub spawn_id: u32,
    pub spawn_code: String,
    pub master_address: Option<String>,
}

impl SpawnedProcessArgs {
    /// Reads the process arguments, falling back to the environment.
    pub fn from_env() -> Result<Self, SpawnError> {
        Self::parse(std::env::args().skip(1), |key| std::env::var(key).ok())
    }

    /// Command line values win over `env`. Unrelated arguments are ignored.
    pub fn parse<I, E>(args: I, env: E) -> Result<Self, SpawnError>
    where
        I: IntoIterator<Item = String>,
        E: Fn(&str) -> Option<String>,
    {
        let mut spawn_id = None;
        let mut spawn_code = None;
        let mut master_address = None;

        let mut args = args.into_iter();
        while let Some(arg) = args.next() {
            let slot = match arg.as_str() {
                "--spawn-id" => &mut spawn_id,
                "--spawn-code" => &mut spawn_code,
                "--master" => &mut master_address,
                _ => continue,
            };
            *slot = args.next();
        }

        let spawn_id = spawn_id
            .or_else(|| env(SPAWN_ID_ENV))
            .ok_or(SpawnError::MissingArgument("spawn id"))?;
        let spawn_id = spawn_id
            .trim()
            .parse()
            .map_err(|_| SpawnError::MissingArgument("spawn id"))?;

        Ok(Self {
            spawn_id,
            spawn_code: spawn_code
                .or_else(|| env(SPAWN_CODE_ENV))
                .ok_or(SpawnError::MissingArgument("spawn code"))?,
            master_address: master_address.or_else(|| env(MASTER_ADDRESS_ENV)),
        })
    }
}

/// The spawned process's handle on its spawn task.
pub struct SpawnTaskController {
    session: ClientSession,
    spawn_id: u32,
    options: Properties,
}

impl SpawnTaskController {
    /// Registers with the master using the spawn code. Returns the
    /// controller together with the options the task was requested with.
    pub async fn register(
        session: ClientSession,
        args: &SpawnedProcessArgs,
    ) -> Result<Self, SpawnError> {
        let options: Properties = session
            .call(
                OpCode::RegisterSpawnedProcess,
                &RegisterSpawnedProcessPacket {
                    spawn_id: args.spawn_id,
                    spawn_code: args.spawn_code.clone(),
                },
            )
            .await?;
        info!("🔐 Registered as the process of spawn task {}", args.spawn_id);
        Ok(Self {
            session,
            spawn_id: args.spawn_id,
            options,
        })
    }

    pub fn spawn_id(&self) -> u32 {
        self.spawn_id
    }

    pub fn options(&self) -> &Properties {
        &self.options
    }

    /// Reports the process ready, with data for the requester (usually
    /// how to connect to it).
    pub async fn finalize(&self, data: Properties) -> Result<(), SpawnError> {
        self.session
            .call::<_, ()>(
                OpCode::SpawnFinalization,
                &SpawnFinalizationPacket {
                    spawn_id: self.spawn_id,
                    finalization_data: data,
                },
            )
            .await?;
        info!("Spawn task {} finalized", self.spawn_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|arg| arg.to_string()).collect()
    }

    #[test]
    fn command_line_wins_over_environment() {
        let env = |key: &str| match key {
            SPAWN_ID_ENV => Some("9".to_string()),
            SPAWN_CODE_ENV => Some("fromenv".to_string()),
            MASTER_ADDRESS_ENV => Some("10.0.0.1:5000".to_string()),
            _ => None,
        };
        let parsed = SpawnedProcessArgs::parse(
            args(&["--map", "dust", "--spawn-id", "4", "--spawn-code", "abc123"]),
            env,
        )
        .unwrap();
        assert_eq!(
            parsed,
            SpawnedProcessArgs {
                spawn_id: 4,
                spawn_code: "abc123".into(),
                master_address: Some("10.0.0.1:5000".into()),
            }
        );
    }

    #[test]
    fn missing_values_are_reported() {
        let none = |_: &str| None;
        assert!(matches!(
            SpawnedProcessArgs::parse(args(&["--spawn-code", "x"]), none),
            Err(SpawnError::MissingArgument("spawn id"))
        ));
        assert!(matches!(
            SpawnedProcessArgs::parse(args(&["--spawn-id", "x"]), none),
            Err(SpawnError::MissingArgument("spawn id"))
        ));
        assert!(matches!(
            SpawnedProcessArgs::parse(args(&["--spawn-id", "1"]), none),
            Err(SpawnError::MissingArgument("spawn code"))
        ));
    }
}
