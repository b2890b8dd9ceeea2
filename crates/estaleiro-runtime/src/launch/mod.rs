//! Launcher e supervisor do processo servidor dentro do contêiner

pub mod config;
pub mod descriptor;
pub mod lifecycle;
pub mod policy;
pub mod runner;
pub mod supervisor;

pub use config::{LaunchMode, LogDestination, RuntimeConfig, WorkerClass};
pub use descriptor::{container_command, LaunchDescriptor};
pub(crate) use descriptor::shell_quote;
pub use lifecycle::{PhaseEvent, RuntimePhase, RuntimeStatus};
pub use policy::RestartPolicy;
pub use supervisor::{CommandSpawner, Supervisor, SupervisorOptions};

use std::future::Future;
use thiserror::Error;

/// Códigos de saída do launcher (sysexits onde existe equivalente)
pub mod exit {
    pub const INVALID_CONFIG: i32 = 64;
    pub const CRASH_LOOP: i32 = 70;
    pub const BIND_FAILED: i32 = 71;
    pub const SPAWN_FAILED: i32 = 127;
}

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("configuração inválida: {0}")]
    InvalidConfig(String),

    #[error("executando como root (uid 0) com --require-non-root")]
    RunningAsRoot,

    #[error("falha ao fazer bind em {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("falha ao iniciar '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("crash-loop: {crashes} crashes em {window_secs}s, desistindo")]
    CrashLoop { crashes: usize, window_secs: u64 },

    #[error("transição inválida: {event:?} em {from}")]
    InvalidTransition {
        from: RuntimePhase,
        event: PhaseEvent,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl LaunchError {
    pub fn exit_code(&self) -> i32 {
        match self {
            LaunchError::InvalidConfig(_) | LaunchError::RunningAsRoot => exit::INVALID_CONFIG,
            LaunchError::Bind { .. } => exit::BIND_FAILED,
            LaunchError::Spawn { .. } => exit::SPAWN_FAILED,
            LaunchError::CrashLoop { .. } => exit::CRASH_LOOP,
            LaunchError::InvalidTransition { .. } | LaunchError::Io(_) => 1,
        }
    }
}

/// Valida a configuração, verifica privilégios, prepara o modo escolhido e
/// supervisiona até `shutdown` completar ou o pool desistir.
///
/// Retorna o código de saída que o contêiner deve propagar.
pub async fn launch<F>(config: RuntimeConfig, shutdown: F) -> Result<i32, LaunchError>
where
    F: Future<Output = ()>,
{
    config.validate()?;
    check_identity(config.require_non_root, runner::effective_uid())?;

    let descriptor = LaunchDescriptor::for_config(&config);
    tracing::info!(
        mode = %config.mode,
        bind = %config.bind_address(),
        concurrency = config.concurrency_ceiling(),
        command = %descriptor.command_line(),
        "iniciando servidor"
    );

    let spawner = match config.mode {
        LaunchMode::Exec => CommandSpawner::new(descriptor),
        LaunchMode::Prefork => {
            // Bind antes de qualquer worker: porta ocupada falha aqui
            let listener = runner::bind_listener(&config.bind_address())?;
            CommandSpawner::with_listener(descriptor, listener)
        }
    };

    Supervisor::new(spawner, SupervisorOptions::from_config(&config))
        .run(shutdown)
        .await
}

/// Root só é fatal quando pedido explicitamente
pub fn check_identity(require_non_root: bool, euid: u32) -> Result<(), LaunchError> {
    if euid != 0 {
        return Ok(());
    }
    if require_non_root {
        return Err(LaunchError::RunningAsRoot);
    }
    tracing::warn!(
        gap = "GAP-001",
        "processo rodando como root; defina um usuário sem privilégios na imagem"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(LaunchError::InvalidConfig("x".into()).exit_code(), 64);
        assert_eq!(LaunchError::RunningAsRoot.exit_code(), 64);
        assert_eq!(
            LaunchError::CrashLoop {
                crashes: 11,
                window_secs: 60
            }
            .exit_code(),
            70
        );
        let bind = LaunchError::Bind {
            addr: "0.0.0.0:8000".into(),
            source: std::io::Error::from(std::io::ErrorKind::AddrInUse),
        };
        assert_eq!(bind.exit_code(), 71);
    }

    #[test]
    fn test_root_is_refused_only_when_required() {
        assert!(check_identity(false, 1000).is_ok());
        assert!(check_identity(true, 1000).is_ok());
        assert!(check_identity(false, 0).is_ok());
        assert!(matches!(
            check_identity(true, 0),
            Err(LaunchError::RunningAsRoot)
        ));
    }

    #[tokio::test]
    async fn test_launch_rejects_invalid_config_before_spawning() {
        let config = RuntimeConfig {
            workers: 0,
            server: "/nonexistent/never-run".to_string(),
            ..RuntimeConfig::default()
        };
        let err = launch(config, std::future::pending()).await.unwrap_err();
        assert_eq!(err.exit_code(), exit::INVALID_CONFIG);
    }

    #[tokio::test]
    async fn test_prefork_detects_port_in_use_before_workers() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();

        let config = RuntimeConfig {
            host: "127.0.0.1".to_string(),
            port,
            mode: LaunchMode::Prefork,
            server: "/nonexistent/never-run".to_string(),
            ..RuntimeConfig::default()
        };
        let err = launch(config, std::future::pending()).await.unwrap_err();
        assert!(matches!(err, LaunchError::Bind { .. }));
        assert_eq!(err.exit_code(), exit::BIND_FAILED);
    }
}
