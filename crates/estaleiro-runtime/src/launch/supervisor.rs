//! Supervisor: mantém o pool de processos vivo, aplica a política de restart,
//! reage a sinais e publica o estado.

use super::config::{LaunchMode, RuntimeConfig};
use super::descriptor::LaunchDescriptor;
use super::lifecycle::{PhaseEvent, RuntimePhase, RuntimeStatus};
use super::policy::{CrashLedger, RestartDecision, RestartPolicy};
use super::{runner, LaunchError};
use estaleiro_probe::{HealthPolicy, HealthStatus, HttpProbe};
use std::future::Future;
use std::io;
use std::net::TcpListener;
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;
use std::time::Duration;
use tokio::process::Child;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const READINESS_TIMEOUT: Duration = Duration::from_millis(250);

/// Ponto de extensão para criar processos de um slot
pub trait WorkerSpawner: Send {
    fn spawn(&mut self, slot: usize) -> io::Result<Child>;

    /// Nome do programa, para mensagens de erro
    fn program(&self) -> &str;
}

/// Spawner real: descritor fixo e, no prefork, o socket compartilhado
pub struct CommandSpawner {
    descriptor: LaunchDescriptor,
    listener: Option<TcpListener>,
}

impl CommandSpawner {
    pub fn new(descriptor: LaunchDescriptor) -> Self {
        Self {
            descriptor,
            listener: None,
        }
    }

    pub fn with_listener(descriptor: LaunchDescriptor, listener: TcpListener) -> Self {
        Self {
            descriptor,
            listener: Some(listener),
        }
    }
}

impl WorkerSpawner for CommandSpawner {
    fn spawn(&mut self, slot: usize) -> io::Result<Child> {
        let fd = self.listener.as_ref().map(|l| l.as_raw_fd());
        runner::spawn(&self.descriptor, slot, fd)
    }

    fn program(&self) -> &str {
        &self.descriptor.program
    }
}

/// Como o supervisor descobre que o servidor passou a atender
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    /// O socket já existe (prefork): atende assim que os workers sobem
    Immediate,
    /// O filho faz o próprio bind: espera a porta aceitar conexões
    PortOpen { host: String, port: u16 },
}

#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    pub mode: LaunchMode,
    pub slots: usize,
    pub restart: RestartPolicy,
    pub graceful_timeout: Duration,
    pub readiness: Readiness,
    pub bind: String,
    pub self_probe: Option<(HealthPolicy, String)>,
    pub state_file: Option<PathBuf>,
}

impl SupervisorOptions {
    pub fn from_config(config: &RuntimeConfig) -> Self {
        let (slots, restart, readiness) = match config.mode {
            // O gerenciador reinicia os próprios workers; a saída dele é a nossa
            LaunchMode::Exec => (
                1,
                RestartPolicy::never(),
                Readiness::PortOpen {
                    host: config.host.clone(),
                    port: config.port,
                },
            ),
            LaunchMode::Prefork => (
                config.workers as usize,
                config.restart.clone(),
                Readiness::Immediate,
            ),
        };

        let self_probe = config.self_probe.clone().map(|policy| {
            let host = match config.host.as_str() {
                "0.0.0.0" | "" => "127.0.0.1",
                other => other,
            };
            (policy, format!("http://{}:{}/", host, config.port))
        });

        Self {
            mode: config.mode,
            slots,
            restart,
            graceful_timeout: config.graceful_timeout(),
            readiness,
            bind: config.bind_address(),
            self_probe,
            state_file: config.state_file.clone(),
        }
    }
}

struct Slot {
    child: Option<Child>,
    started: Option<Instant>,
    restart_at: Option<Instant>,
    consecutive_crashes: u32,
}

/// Por que o loop principal parou
enum Stop {
    Shutdown,
    CrashLoop { crashes: usize },
    ManagerExited { code: i32 },
}

pub struct Supervisor<S: WorkerSpawner> {
    spawner: S,
    options: SupervisorOptions,
    slots: Vec<Slot>,
    ledger: CrashLedger,
    status: RuntimeStatus,
}

impl<S: WorkerSpawner> Supervisor<S> {
    pub fn new(spawner: S, options: SupervisorOptions) -> Self {
        let slots = (0..options.slots)
            .map(|_| Slot {
                child: None,
                started: None,
                restart_at: None,
                consecutive_crashes: 0,
            })
            .collect();
        let status = RuntimeStatus::new(options.mode, options.bind.clone(), options.slots);

        Self {
            spawner,
            ledger: CrashLedger::new(options.restart.clone()),
            options,
            slots,
            status,
        }
    }

    /// Roda até `shutdown` completar ou o pool não poder continuar.
    pub async fn run<F>(mut self, shutdown: F) -> Result<i32, LaunchError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        for slot in 0..self.slots.len() {
            if let Err(source) = self.start(slot) {
                self.stop_all().await;
                return Err(LaunchError::Spawn {
                    program: self.spawner.program().to_string(),
                    source,
                });
            }
        }
        if self.options.readiness == Readiness::Immediate {
            self.transition(PhaseEvent::Bound)?;
        }
        self.persist();

        let mut health = self.start_self_probe();
        let mut tick = tokio::time::interval(POLL_INTERVAL);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let stop = loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("sinal de parada recebido");
                    break Stop::Shutdown;
                }
                changed = next_health(&mut health) => match changed {
                    Some(status) => self.on_health(status)?,
                    None => health = None,
                },
                _ = tick.tick() => {
                    if let Some(stop) = self.poll().await {
                        break stop;
                    }
                }
            }
        };

        let event = match stop {
            Stop::Shutdown => PhaseEvent::ShutdownRequested,
            _ => PhaseEvent::Fatal,
        };
        self.transition(event)?;
        self.persist();

        let stopped_code = self.stop_all().await;
        self.transition(PhaseEvent::AllExited)?;
        self.persist();

        match stop {
            Stop::Shutdown => Ok(stopped_code),
            Stop::ManagerExited { code } => Ok(code),
            Stop::CrashLoop { crashes } => Err(LaunchError::CrashLoop {
                crashes,
                window_secs: self.options.restart.window_secs,
            }),
        }
    }

    fn start(&mut self, slot: usize) -> io::Result<()> {
        let child = self.spawner.spawn(slot)?;
        let pid = child.id();
        tracing::info!(slot, pid, "processo iniciado");

        let state = &mut self.slots[slot];
        state.child = Some(child);
        state.started = Some(Instant::now());
        state.restart_at = None;
        self.status.workers[slot].mark_started(pid);
        Ok(())
    }

    /// Uma volta do loop: prontidão, timers de restart e filhos que saíram
    async fn poll(&mut self) -> Option<Stop> {
        if self.status.phase == RuntimePhase::Starting {
            if let Readiness::PortOpen { host, port } = &self.options.readiness {
                if runner::port_accepts(host, *port, READINESS_TIMEOUT).await {
                    tracing::info!(bind = %self.options.bind, "servidor atendendo");
                    if self.transition(PhaseEvent::Bound).is_ok() {
                        self.persist();
                    }
                }
            }
        }

        let now = Instant::now();
        for slot in 0..self.slots.len() {
            if let Some(at) = self.slots[slot].restart_at {
                if now >= at {
                    if let Err(err) = self.start(slot) {
                        tracing::error!(slot, error = %err, "falha ao reiniciar processo");
                        if let Some(stop) = self.on_exit(slot, 1, now) {
                            return Some(stop);
                        }
                    }
                    self.persist();
                }
                continue;
            }

            let exited = match self.slots[slot].child.as_mut().map(|c| c.try_wait()) {
                None | Some(Ok(None)) => None,
                Some(Ok(Some(status))) => Some(runner::exit_code(status)),
                Some(Err(err)) => {
                    tracing::error!(slot, error = %err, "falha ao consultar processo");
                    Some(1)
                }
            };

            if let Some(code) = exited {
                self.slots[slot].child = None;
                if let Some(stop) = self.on_exit(slot, code, now) {
                    return Some(stop);
                }
            }
        }
        None
    }

    fn on_exit(&mut self, slot: usize, code: i32, now: Instant) -> Option<Stop> {
        self.status.workers[slot].mark_exited(code);
        tracing::warn!(slot, code, "processo saiu");

        let state = &mut self.slots[slot];
        let survived_window = state
            .started
            .map(|started| now.duration_since(started) >= self.options.restart.window())
            .unwrap_or(false);
        if survived_window {
            state.consecutive_crashes = 0;
        }
        state.consecutive_crashes += 1;

        let decision = self.ledger.record(now, state.consecutive_crashes);
        let stop = match decision {
            RestartDecision::Restart { delay } => {
                tracing::info!(slot, delay_ms = delay.as_millis() as u64, "restart agendado");
                state.restart_at = Some(now + delay);
                self.status.workers[slot].mark_backoff();
                None
            }
            RestartDecision::Trip => {
                let crashes = self.ledger.recent(now);
                tracing::error!(
                    crashes,
                    window_secs = self.options.restart.window_secs,
                    "crash-loop detectado, encerrando pool"
                );
                Some(Stop::CrashLoop { crashes })
            }
            RestartDecision::GiveUp => Some(Stop::ManagerExited { code }),
        };

        self.persist();
        stop
    }

    fn on_health(&mut self, health: HealthStatus) -> Result<(), LaunchError> {
        self.status.update_health(health);
        let event = match health {
            HealthStatus::Healthy => Some(PhaseEvent::ProbeRecovered),
            HealthStatus::Unhealthy => Some(PhaseEvent::ProbeFailed),
            HealthStatus::Starting => None,
        };
        if let Some(event) = event {
            if matches!(
                self.status.phase,
                RuntimePhase::Serving | RuntimePhase::Unhealthy
            ) {
                self.transition(event)?;
            }
        }
        if health == HealthStatus::Unhealthy {
            tracing::warn!("sonda interna marcou o servidor como unhealthy");
        }
        self.persist();
        Ok(())
    }

    /// SIGTERM para todos, espera o prazo comum, SIGKILL para quem restou.
    /// Retorna o primeiro código não-zero, ou 0.
    async fn stop_all(&mut self) -> i32 {
        let graceful = self.options.graceful_timeout;
        let mut codes = Vec::new();

        for slot in self.slots.iter_mut() {
            slot.restart_at = None;
            if let Some(child) = slot.child.as_ref() {
                if let Some(pid) = child.id() {
                    if let Err(err) = runner::send_signal(pid, libc::SIGTERM) {
                        tracing::warn!(pid, error = %err, "falha ao enviar SIGTERM");
                    }
                }
            }
        }

        let deadline = Instant::now() + graceful;
        for (index, slot) in self.slots.iter_mut().enumerate() {
            let Some(mut child) = slot.child.take() else {
                continue;
            };
            let remaining = deadline.saturating_duration_since(Instant::now());
            match runner::stop_child(&mut child, remaining).await {
                Ok(status) => {
                    let code = runner::exit_code(status);
                    self.status.workers[index].mark_exited(code);
                    codes.push(code);
                }
                Err(err) => {
                    tracing::error!(slot = index, error = %err, "falha ao parar processo");
                    codes.push(1);
                }
            }
        }

        codes.into_iter().find(|c| *c != 0).unwrap_or(0)
    }

    fn start_self_probe(&self) -> Option<watch::Receiver<HealthStatus>> {
        let (policy, url) = self.options.self_probe.clone()?;
        let probe = match HttpProbe::new(&url, policy.timeout) {
            Ok(probe) => probe,
            Err(err) => {
                tracing::warn!(url = %url, error = %err, "sonda interna desativada");
                return None;
            }
        };

        let (tx, rx) = watch::channel(HealthStatus::Starting);
        tokio::spawn(async move {
            estaleiro_probe::watch(&probe, &policy, tx).await;
        });
        Some(rx)
    }

    fn transition(&mut self, event: PhaseEvent) -> Result<(), LaunchError> {
        let next = self.status.phase.on(event)?;
        if next != self.status.phase {
            tracing::info!(from = %self.status.phase, to = %next, "fase do runtime");
        }
        self.status.phase = next;
        Ok(())
    }

    fn persist(&mut self) {
        if let Some(path) = self.options.state_file.clone() {
            if let Err(err) = self.status.save(&path) {
                tracing::warn!(path = %path.display(), error = %err, "falha ao gravar estado");
            }
        }
    }
}

async fn next_health(rx: &mut Option<watch::Receiver<HealthStatus>>) -> Option<HealthStatus> {
    match rx {
        Some(rx) => match rx.changed().await {
            Ok(()) => Some(*rx.borrow()),
            Err(_) => None,
        },
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    /// Spawner de teste: o mesmo script de shell em todos os slots
    struct ScriptSpawner(String);

    impl ScriptSpawner {
        fn all(script: &str) -> Self {
            Self(script.to_string())
        }
    }

    impl WorkerSpawner for ScriptSpawner {
        fn spawn(&mut self, slot: usize) -> io::Result<Child> {
            let descriptor = LaunchDescriptor {
                program: "sh".to_string(),
                args: vec!["-c".to_string(), self.0.clone()],
                env: Vec::new(),
            };
            runner::spawn(&descriptor, slot, None)
        }

        fn program(&self) -> &str {
            "sh"
        }
    }

    fn options(mode: LaunchMode, slots: usize, restart: RestartPolicy) -> SupervisorOptions {
        SupervisorOptions {
            mode,
            slots,
            restart,
            graceful_timeout: Duration::from_secs(5),
            readiness: Readiness::Immediate,
            bind: "127.0.0.1:0".to_string(),
            self_probe: None,
            state_file: None,
        }
    }

    fn fast_restarts(max_restarts: u32) -> RestartPolicy {
        RestartPolicy {
            backoff_base_ms: 10,
            backoff_max_ms: 40,
            max_restarts,
            window_secs: 60,
            ..RestartPolicy::default()
        }
    }

    #[tokio::test]
    async fn test_exec_mode_propagates_manager_exit_code() {
        let supervisor = Supervisor::new(
            ScriptSpawner::all("exit 7"),
            options(LaunchMode::Exec, 1, RestartPolicy::never()),
        );
        let code = supervisor.run(std::future::pending()).await.unwrap();
        assert_eq!(code, 7);
    }

    #[tokio::test]
    async fn test_crash_loop_trips_breaker() {
        let supervisor = Supervisor::new(
            ScriptSpawner::all("exit 1"),
            options(LaunchMode::Prefork, 2, fast_restarts(3)),
        );
        let err = supervisor.run(std::future::pending()).await.unwrap_err();
        assert!(matches!(err, LaunchError::CrashLoop { crashes: 4, .. }));
        assert_eq!(err.exit_code(), 70);
    }

    #[tokio::test]
    async fn test_crashed_worker_is_restarted() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("crashed-once");
        // Primeira execução morre; as seguintes ficam de pé
        let script = format!(
            "if [ -e {m} ]; then sleep 30; else touch {m}; exit 1; fi",
            m = marker.display()
        );
        let state_file = dir.path().join("state.json");
        let mut opts = options(LaunchMode::Prefork, 1, fast_restarts(5));
        opts.state_file = Some(state_file.clone());

        let (tx, rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            Supervisor::new(ScriptSpawner::all(&script), opts)
                .run(async {
                    let _ = rx.await;
                })
                .await
        });

        let mut restarted = false;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            if let Ok(status) = RuntimeStatus::load(&state_file) {
                if status.workers[0].restart_count == 1 && status.running_workers() == 1 {
                    restarted = true;
                    break;
                }
            }
        }
        assert!(restarted, "worker não foi reiniciado");

        tx.send(()).unwrap();
        let code = handle.await.unwrap().unwrap();
        assert_eq!(code, 128 + libc::SIGTERM);

        let status = RuntimeStatus::load(&state_file).unwrap();
        assert_eq!(status.phase, RuntimePhase::Terminated);
    }

    #[tokio::test]
    async fn test_shutdown_stops_all_workers() {
        let dir = tempfile::tempdir().unwrap();
        let state_file = dir.path().join("state.json");
        // Trata SIGTERM e sai limpo, como o gerenciador faz
        let script = "trap 'exit 0' TERM; while true; do sleep 0.1; done";
        let mut opts = options(LaunchMode::Prefork, 3, fast_restarts(5));
        opts.state_file = Some(state_file.clone());

        let (tx, rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            Supervisor::new(ScriptSpawner::all(script), opts)
                .run(async {
                    let _ = rx.await;
                })
                .await
        });

        tokio::time::sleep(Duration::from_millis(300)).await;
        let status = RuntimeStatus::load(&state_file).unwrap();
        assert_eq!(status.phase, RuntimePhase::Serving);
        assert_eq!(status.running_workers(), 3);

        tx.send(()).unwrap();
        let code = handle.await.unwrap().unwrap();
        assert_eq!(code, 0);

        let status = RuntimeStatus::load(&state_file).unwrap();
        assert_eq!(status.phase, RuntimePhase::Terminated);
        assert_eq!(status.running_workers(), 0);
    }

    #[tokio::test]
    async fn test_spawn_failure_is_reported() {
        struct Broken;
        impl WorkerSpawner for Broken {
            fn spawn(&mut self, _slot: usize) -> io::Result<Child> {
                Err(io::Error::from(io::ErrorKind::NotFound))
            }
            fn program(&self) -> &str {
                "gunicorn"
            }
        }

        let err = Supervisor::new(Broken, options(LaunchMode::Exec, 1, RestartPolicy::never()))
            .run(std::future::pending())
            .await
            .unwrap_err();
        assert!(matches!(err, LaunchError::Spawn { ref program, .. } if program == "gunicorn"));
    }

    #[tokio::test]
    async fn test_excess_connections_queue_in_backlog() {
        // Workers ocupados que nunca aceitam: o kernel enfileira as conexões
        let listener = runner::bind_listener("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let descriptor = LaunchDescriptor {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), "sleep 30".to_string()],
            env: Vec::new(),
        };
        let spawner = CommandSpawner::with_listener(descriptor, listener);

        let (tx, rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            Supervisor::new(spawner, options(LaunchMode::Prefork, 2, fast_restarts(5)))
                .run(async {
                    let _ = rx.await;
                })
                .await
        });

        // Concorrência máxima de 2 workers x 2 threads, mais excedente
        let mut clients = Vec::new();
        for _ in 0..8 {
            let stream = tokio::time::timeout(
                Duration::from_secs(2),
                tokio::net::TcpStream::connect(addr),
            )
            .await
            .expect("conexão deveria ficar na fila")
            .expect("conexão recusada");
            clients.push(stream);
        }
        assert_eq!(clients.len(), 8);

        tx.send(()).unwrap();
        handle.await.unwrap().unwrap();
    }
}
