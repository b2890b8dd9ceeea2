//! Configuração do processo servidor (bind, workers, threads, timeouts, logs)

use super::policy::RestartPolicy;
use super::LaunchError;
use crate::process_env::ProcessEnv;
use estaleiro_probe::HealthPolicy;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum WorkerClass {
    /// Pool de threads cooperativas por worker
    Gthread,
    /// Um request por vez por worker
    Sync,
}

impl std::fmt::Display for WorkerClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerClass::Gthread => write!(f, "gthread"),
            WorkerClass::Sync => write!(f, "sync"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LaunchMode {
    /// Um único gerenciador de processos com `--workers N`
    Exec,
    /// O estaleiro segura o socket e supervisiona N workers
    Prefork,
}

impl std::fmt::Display for LaunchMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LaunchMode::Exec => write!(f, "exec"),
            LaunchMode::Prefork => write!(f, "prefork"),
        }
    }
}

/// Destino de um stream de log: `-` (stdout/stderr) ou arquivo
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum LogDestination {
    Stream,
    File(PathBuf),
}

impl FromStr for LogDestination {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "" => Err("destino de log vazio".to_string()),
            "-" => Ok(LogDestination::Stream),
            path => Ok(LogDestination::File(PathBuf::from(path))),
        }
    }
}

impl TryFrom<String> for LogDestination {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<LogDestination> for String {
    fn from(value: LogDestination) -> Self {
        value.to_string()
    }
}

impl std::fmt::Display for LogDestination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogDestination::Stream => write!(f, "-"),
            LogDestination::File(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Descritor de configuração do processo em execução
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeConfig {
    pub host: String,
    pub port: u16,
    pub workers: u32,
    pub worker_class: WorkerClass,
    pub threads: u32,
    /// Segundos até um request em andamento ser abortado
    pub timeout: u64,
    /// Segundos de espera após SIGTERM antes de SIGKILL
    pub graceful_timeout: u64,
    pub access_log: LogDestination,
    pub error_log: LogDestination,
    /// Entry point WSGI (`pacote.wsgi:application`)
    pub wsgi_app: String,
    /// Executável do gerenciador de processos
    pub server: String,
    pub mode: LaunchMode,
    pub restart: RestartPolicy,
    pub process_env: ProcessEnv,
    /// Sonda interna opcional contra `/`
    pub self_probe: Option<HealthPolicy>,
    pub state_file: Option<PathBuf>,
    pub require_non_root: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            workers: 4,
            worker_class: WorkerClass::Gthread,
            threads: 2,
            timeout: 120,
            graceful_timeout: 30,
            access_log: LogDestination::Stream,
            error_log: LogDestination::Stream,
            wsgi_app: "ecommerce.wsgi:application".to_string(),
            server: "gunicorn".to_string(),
            mode: LaunchMode::Exec,
            restart: RestartPolicy::default(),
            process_env: ProcessEnv::default(),
            self_probe: None,
            state_file: None,
            require_non_root: false,
        }
    }
}

impl RuntimeConfig {
    pub fn validate(&self) -> Result<(), LaunchError> {
        let invalid = |msg: &str| Err(LaunchError::InvalidConfig(msg.to_string()));

        if self.workers == 0 {
            return invalid("workers deve ser pelo menos 1");
        }
        if self.threads == 0 {
            return invalid("threads deve ser pelo menos 1");
        }
        if self.timeout == 0 {
            return invalid("timeout deve ser pelo menos 1 segundo");
        }
        if self.wsgi_app.trim().is_empty() || !self.wsgi_app.contains(':') {
            return invalid("wsgi_app deve ter o formato 'modulo:objeto'");
        }
        if self.server.trim().is_empty() {
            return invalid("server não pode ser vazio");
        }
        if let Some(policy) = &self.self_probe {
            policy
                .validate()
                .map_err(|e| LaunchError::InvalidConfig(format!("self_probe: {e}")))?;
        }
        self.restart
            .validate()
            .map_err(|e| LaunchError::InvalidConfig(format!("restart: {e}")))?;
        Ok(())
    }

    /// Threads efetivas: o modelo `sync` sempre atende um request por vez
    pub fn effective_threads(&self) -> u32 {
        match self.worker_class {
            WorkerClass::Gthread => self.threads,
            WorkerClass::Sync => 1,
        }
    }

    /// Teto de requests simultâneos; o excedente espera na fila de accept
    pub fn concurrency_ceiling(&self) -> u32 {
        self.workers * self.effective_threads()
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    pub fn graceful_timeout(&self) -> Duration {
        Duration::from_secs(self.graceful_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_observed_deployment() {
        let config = RuntimeConfig::default();
        assert_eq!(config.bind_address(), "0.0.0.0:8000");
        assert_eq!(config.workers, 4);
        assert_eq!(config.worker_class, WorkerClass::Gthread);
        assert_eq!(config.threads, 2);
        assert_eq!(config.timeout(), Duration::from_secs(120));
        assert_eq!(config.access_log, LogDestination::Stream);
        assert_eq!(config.concurrency_ceiling(), 8);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_sync_workers_ignore_threads() {
        let config = RuntimeConfig {
            worker_class: WorkerClass::Sync,
            threads: 8,
            ..RuntimeConfig::default()
        };
        assert_eq!(config.effective_threads(), 1);
        assert_eq!(config.concurrency_ceiling(), 4);
    }

    #[test]
    fn test_zero_workers_rejected() {
        let config = RuntimeConfig {
            workers: 0,
            ..RuntimeConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(LaunchError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_wsgi_app_needs_callable() {
        let config = RuntimeConfig {
            wsgi_app: "ecommerce.wsgi".to_string(),
            ..RuntimeConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_log_destination_parse() {
        assert_eq!("-".parse::<LogDestination>().unwrap(), LogDestination::Stream);
        assert_eq!(
            "/var/log/access.log".parse::<LogDestination>().unwrap(),
            LogDestination::File(PathBuf::from("/var/log/access.log"))
        );
        assert!("".parse::<LogDestination>().is_err());
    }

    #[test]
    fn test_config_from_toml_with_defaults() {
        let config: RuntimeConfig = toml::from_str(
            r#"
            workers = 2
            worker_class = "sync"
            access_log = "/tmp/access.log"
            "#,
        )
        .unwrap();

        assert_eq!(config.workers, 2);
        assert_eq!(config.worker_class, WorkerClass::Sync);
        assert_eq!(
            config.access_log,
            LogDestination::File(PathBuf::from("/tmp/access.log"))
        );
        assert_eq!(config.port, 8000);
    }
}
