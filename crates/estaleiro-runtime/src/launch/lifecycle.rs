//! Ciclo de vida do processo servidor e estado persistido dos workers

use super::config::LaunchMode;
use super::LaunchError;
use anyhow::Context;
use estaleiro_probe::HealthStatus;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// Fase do runtime
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RuntimePhase {
    /// Processo iniciado, porta ainda não atende
    Starting,
    /// Porta atendendo conexões
    Serving,
    /// Sonda excedeu o orçamento de retries; quem age é o orquestrador
    Unhealthy,
    /// Sinal recebido ou crash-loop; workers sendo encerrados
    Stopping,
    /// Nada mais rodando
    Terminated,
}

impl std::fmt::Display for RuntimePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuntimePhase::Starting => write!(f, "starting"),
            RuntimePhase::Serving => write!(f, "serving"),
            RuntimePhase::Unhealthy => write!(f, "unhealthy"),
            RuntimePhase::Stopping => write!(f, "stopping"),
            RuntimePhase::Terminated => write!(f, "terminated"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseEvent {
    Bound,
    ProbeFailed,
    ProbeRecovered,
    ShutdownRequested,
    /// Disjuntor de restarts aberto ou gerenciador saiu sozinho
    Fatal,
    AllExited,
}

impl RuntimePhase {
    /// Aplica um evento; transições fora da máquina de estados são erro
    pub fn on(self, event: PhaseEvent) -> Result<RuntimePhase, LaunchError> {
        use PhaseEvent::*;
        use RuntimePhase::*;

        let next = match (self, event) {
            (Starting, Bound) => Serving,
            (Serving | Unhealthy, ProbeFailed) => Unhealthy,
            (Serving | Unhealthy, ProbeRecovered) => Serving,
            (Starting | Serving | Unhealthy | Stopping, ShutdownRequested | Fatal) => Stopping,
            (Stopping, AllExited) => Terminated,
            (from, event) => return Err(LaunchError::InvalidTransition { from, event }),
        };
        Ok(next)
    }

    pub fn is_running(self) -> bool {
        matches!(
            self,
            RuntimePhase::Starting | RuntimePhase::Serving | RuntimePhase::Unhealthy
        )
    }
}

/// Estado de um slot de worker
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Running,
    /// Morreu e aguarda o atraso de backoff
    Backoff,
    Exited,
    Failed,
}

/// Informações de um worker supervisionado
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub slot: usize,
    pub status: WorkerStatus,
    pub pid: Option<u32>,
    pub started_at: Option<u64>,
    pub stopped_at: Option<u64>,
    pub exit_code: Option<i32>,
    pub restart_count: u32,
}

impl WorkerInfo {
    pub fn new(slot: usize) -> Self {
        Self {
            slot,
            status: WorkerStatus::Exited,
            pid: None,
            started_at: None,
            stopped_at: None,
            exit_code: None,
            restart_count: 0,
        }
    }

    pub fn mark_started(&mut self, pid: Option<u32>) {
        if self.started_at.is_some() {
            self.restart_count += 1;
        }
        self.status = WorkerStatus::Running;
        self.pid = pid;
        self.started_at = Some(current_timestamp());
        self.stopped_at = None;
        self.exit_code = None;
    }

    pub fn mark_exited(&mut self, exit_code: i32) {
        self.status = if exit_code == 0 {
            WorkerStatus::Exited
        } else {
            WorkerStatus::Failed
        };
        self.pid = None;
        self.stopped_at = Some(current_timestamp());
        self.exit_code = Some(exit_code);
    }

    pub fn mark_backoff(&mut self) {
        self.status = WorkerStatus::Backoff;
    }

    /// Uptime em segundos (se rodando)
    pub fn uptime_secs(&self) -> Option<u64> {
        match (self.status == WorkerStatus::Running, self.started_at) {
            (true, Some(started)) => Some(current_timestamp().saturating_sub(started)),
            _ => None,
        }
    }

    pub fn uptime_human(&self) -> String {
        match self.uptime_secs() {
            Some(secs) => format_duration(secs),
            None => "parado".to_string(),
        }
    }
}

/// Fotografia do runtime, gravada em JSON para ferramentas externas
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeStatus {
    pub phase: RuntimePhase,
    pub mode: LaunchMode,
    pub bind: String,
    pub supervisor_pid: u32,
    pub workers: Vec<WorkerInfo>,
    pub health: Option<HealthStatus>,
    pub last_health_check: Option<u64>,
    pub updated_at: u64,
}

impl RuntimeStatus {
    pub fn new(mode: LaunchMode, bind: String, slots: usize) -> Self {
        Self {
            phase: RuntimePhase::Starting,
            mode,
            bind,
            supervisor_pid: std::process::id(),
            workers: (0..slots).map(WorkerInfo::new).collect(),
            health: None,
            last_health_check: None,
            updated_at: current_timestamp(),
        }
    }

    pub fn update_health(&mut self, health: HealthStatus) {
        self.health = Some(health);
        self.last_health_check = Some(current_timestamp());
    }

    pub fn total_restarts(&self) -> u32 {
        self.workers.iter().map(|w| w.restart_count).sum()
    }

    pub fn running_workers(&self) -> usize {
        self.workers
            .iter()
            .filter(|w| w.status == WorkerStatus::Running)
            .count()
    }

    /// Salva estado em disco
    pub fn save(&mut self, path: &Path) -> anyhow::Result<()> {
        self.updated_at = current_timestamp();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Falha ao criar diretório de estado")?;
        }
        let json = serde_json::to_string_pretty(self).context("Falha ao serializar estado")?;

        // Escreve ao lado e renomeia para leitores nunca verem JSON pela metade
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json).context("Falha ao salvar estado")?;
        fs::rename(&tmp, path).context("Falha ao salvar estado")?;
        Ok(())
    }

    /// Carrega estado do disco
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Falha ao ler arquivo de estado {}", path.display()))?;
        serde_json::from_str(&content).context("Falha ao parsear estado")
    }

    pub fn print_summary(&self) {
        println!("\n📦 Runtime ({})", self.mode);
        println!("─────────────────────────────────────");
        println!("Fase:      {}", self.phase);
        println!("Bind:      {}", self.bind);
        println!("PID:       {}", self.supervisor_pid);
        if let Some(health) = self.health {
            println!("Saúde:     {}", health);
        }
        println!(
            "Workers:   {}/{} rodando, {} restarts",
            self.running_workers(),
            self.workers.len(),
            self.total_restarts()
        );
        for worker in &self.workers {
            println!(
                "  #{:<2} {:<8} pid={:<8} uptime={:<10} restarts={}",
                worker.slot,
                format!("{:?}", worker.status).to_lowercase(),
                worker.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string()),
                worker.uptime_human(),
                worker.restart_count
            );
        }
        println!("─────────────────────────────────────");
    }
}

/// Retorna timestamp atual
pub(crate) fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Formata duração em formato legível
fn format_duration(secs: u64) -> String {
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else if secs < 86400 {
        let hours = secs / 3600;
        let mins = (secs % 3600) / 60;
        format!("{}h {}m", hours, mins)
    } else {
        let days = secs / 86400;
        let hours = (secs % 86400) / 3600;
        format!("{}d {}h", days, hours)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        let phase = RuntimePhase::Starting;
        let phase = phase.on(PhaseEvent::Bound).unwrap();
        assert_eq!(phase, RuntimePhase::Serving);

        let phase = phase.on(PhaseEvent::ShutdownRequested).unwrap();
        assert_eq!(phase, RuntimePhase::Stopping);

        let phase = phase.on(PhaseEvent::AllExited).unwrap();
        assert_eq!(phase, RuntimePhase::Terminated);
        assert!(!phase.is_running());
    }

    #[test]
    fn test_unhealthy_does_not_terminate() {
        let phase = RuntimePhase::Serving.on(PhaseEvent::ProbeFailed).unwrap();
        assert_eq!(phase, RuntimePhase::Unhealthy);
        assert!(phase.is_running());

        let phase = phase.on(PhaseEvent::ProbeRecovered).unwrap();
        assert_eq!(phase, RuntimePhase::Serving);
    }

    #[test]
    fn test_invalid_transitions_rejected() {
        assert!(RuntimePhase::Starting.on(PhaseEvent::ProbeFailed).is_err());
        assert!(RuntimePhase::Serving.on(PhaseEvent::AllExited).is_err());
        assert!(RuntimePhase::Terminated
            .on(PhaseEvent::ShutdownRequested)
            .is_err());
        assert!(RuntimePhase::Serving.on(PhaseEvent::Bound).is_err());
    }

    #[test]
    fn test_crash_loop_goes_through_stopping() {
        let phase = RuntimePhase::Serving.on(PhaseEvent::Fatal).unwrap();
        assert_eq!(phase, RuntimePhase::Stopping);
        assert_eq!(
            phase.on(PhaseEvent::AllExited).unwrap(),
            RuntimePhase::Terminated
        );
    }

    #[test]
    fn test_worker_restart_count() {
        let mut info = WorkerInfo::new(0);
        info.mark_started(Some(100));
        assert_eq!(info.restart_count, 0);

        info.mark_exited(1);
        assert_eq!(info.status, WorkerStatus::Failed);
        assert_eq!(info.pid, None);

        info.mark_started(Some(101));
        assert_eq!(info.restart_count, 1);
        assert_eq!(info.status, WorkerStatus::Running);
    }

    #[test]
    fn test_status_roundtrip_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run").join("state.json");

        let mut status = RuntimeStatus::new(LaunchMode::Prefork, "0.0.0.0:8000".to_string(), 2);
        status.workers[1].mark_started(Some(42));
        status.update_health(HealthStatus::Healthy);
        status.save(&path).unwrap();

        let loaded = RuntimeStatus::load(&path).unwrap();
        assert_eq!(loaded.phase, RuntimePhase::Starting);
        assert_eq!(loaded.workers.len(), 2);
        assert_eq!(loaded.workers[1].pid, Some(42));
        assert_eq!(loaded.health, Some(HealthStatus::Healthy));
        assert_eq!(loaded.running_workers(), 1);
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(30), "30s");
        assert_eq!(format_duration(90), "1m 30s");
        assert_eq!(format_duration(3665), "1h 1m");
        assert_eq!(format_duration(90000), "1d 1h");
    }
}
