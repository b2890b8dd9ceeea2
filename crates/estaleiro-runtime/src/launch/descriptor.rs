//! Linha de comando do gerenciador de processos a partir da configuração

use super::config::{LaunchMode, RuntimeConfig};
use serde::Serialize;

/// Descritor de FD onde workers do modo prefork encontram o socket herdado
pub const INHERITED_LISTENER_FD: i32 = 3;

/// Programa, argumentos e ambiente explícito de um processo a iniciar
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LaunchDescriptor {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl LaunchDescriptor {
    /// Descritor para o modo configurado. No prefork cada worker é um
    /// gerenciador com um único worker preso ao socket herdado.
    pub fn for_config(config: &RuntimeConfig) -> Self {
        match config.mode {
            LaunchMode::Exec => Self::exec(config),
            LaunchMode::Prefork => Self::prefork_worker(config),
        }
    }

    /// Um único gerenciador com `--workers N`; restarts de worker são dele
    pub fn exec(config: &RuntimeConfig) -> Self {
        let bind = config.bind_address();
        Self::build(config, &bind, config.workers)
    }

    pub fn prefork_worker(config: &RuntimeConfig) -> Self {
        let bind = format!("fd://{INHERITED_LISTENER_FD}");
        Self::build(config, &bind, 1)
    }

    fn build(config: &RuntimeConfig, bind: &str, workers: u32) -> Self {
        let args = server_args(config, bind, &workers.to_string());

        let env = config
            .process_env
            .runtime_vars()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

        Self {
            program: config.server.clone(),
            args,
            env,
        }
    }

    /// Linha para logs e para o modo `--dry-run`
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Argumentos do servidor WSGI; `bind` e `workers` podem ser expressões de shell
pub(crate) fn server_args(config: &RuntimeConfig, bind: &str, workers: &str) -> Vec<String> {
    let mut args = vec![
        config.wsgi_app.clone(),
        "--bind".to_string(),
        bind.to_string(),
        "--workers".to_string(),
        workers.to_string(),
        "--worker-class".to_string(),
        config.worker_class.to_string(),
    ];

    if config.effective_threads() > 1 {
        args.push("--threads".to_string());
        args.push(config.effective_threads().to_string());
    }

    args.extend([
        "--timeout".to_string(),
        config.timeout.to_string(),
        "--graceful-timeout".to_string(),
        config.graceful_timeout.to_string(),
        "--access-logfile".to_string(),
        config.access_log.to_string(),
        "--error-logfile".to_string(),
        config.error_log.to_string(),
    ]);

    args
}

/// Comando do contêiner em forma exec via `sh -c`, para que a plataforma
/// possa sobrescrever porta e número de workers (`PORT`, `WEB_CONCURRENCY`).
/// Só `bind` e `workers` ficam sem aspas; o resto chega literal ao servidor.
pub fn container_command(config: &RuntimeConfig) -> Vec<String> {
    let bind = format!("{}:${{PORT:-{}}}", shell_quote(&config.host), config.port);
    let workers = format!("${{WEB_CONCURRENCY:-{}}}", config.workers);
    let args = server_args(config, &bind, &workers)
        .into_iter()
        .map(|arg| {
            if arg == bind || arg == workers {
                arg
            } else {
                shell_quote(&arg)
            }
        });

    let line = std::iter::once(format!("exec {}", shell_quote(&config.server)))
        .chain(args)
        .collect::<Vec<_>>()
        .join(" ");

    vec!["sh".to_string(), "-c".to_string(), line]
}

/// Aspas simples para valores com caracteres fora do conjunto seguro
pub(crate) fn shell_quote(value: &str) -> String {
    let safe = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-./:=@%+,".contains(c));
    if safe {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', r"'\''"))
    }
}
