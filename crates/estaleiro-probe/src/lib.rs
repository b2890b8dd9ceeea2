//! Sonda de liveness para processos HTTP supervisionados pelo estaleiro.
//!
//! A semântica segue o `HEALTHCHECK` de contêineres:
//! - a primeira verificação acontece depois de um `interval`;
//! - falhas dentro do `start_period` não contam para o orçamento de retries;
//! - `retries` falhas consecutivas marcam o processo como `unhealthy`;
//! - qualquer sucesso marca como `healthy` e zera o contador.
//!
//! O crate não encerra processos: quem consome o veredito decide o que fazer.

mod http;
mod policy;
mod tracker;

pub use http::HttpProbe;
pub use policy::HealthPolicy;
pub use tracker::{HealthStatus, HealthTracker};

use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// Resultado de uma única verificação
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// Resposta recebida com status de sucesso
    Success { status: u16, elapsed: Duration },
    /// Conexão recusada, timeout ou status de erro
    Failure { reason: String },
}

impl ProbeOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ProbeOutcome::Success { .. })
    }
}

/// Algo que sabe verificar se o processo ainda atende tráfego.
#[async_trait]
pub trait Probe: Send + Sync {
    async fn check(&self) -> ProbeOutcome;
}

/// Veredito final de uma espera por saúde
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub status: HealthStatus,
    pub elapsed: Duration,
    pub checks: u32,
    pub last: Option<ProbeOutcome>,
}

/// Executa uma verificação respeitando o timeout da política, mesmo que a
/// sonda ignore o próprio limite.
pub async fn check_once<P: Probe + ?Sized>(probe: &P, policy: &HealthPolicy) -> ProbeOutcome {
    match tokio::time::timeout(policy.timeout, probe.check()).await {
        Ok(outcome) => outcome,
        Err(_) => ProbeOutcome::Failure {
            reason: format!("timeout após {:?}", policy.timeout),
        },
    }
}

/// Verifica periodicamente até o processo ficar `Healthy` ou `Unhealthy`.
pub async fn wait_for_verdict<P: Probe + ?Sized>(probe: &P, policy: &HealthPolicy) -> Verdict {
    let started = Instant::now();
    let mut tracker = HealthTracker::new(policy.clone());
    let mut checks = 0;

    loop {
        tokio::time::sleep(policy.interval).await;

        let check_started = started.elapsed();
        let outcome = check_once(probe, policy).await;
        checks += 1;
        tracker.record(check_started, &outcome);

        match tracker.status() {
            HealthStatus::Starting => continue,
            status => {
                return Verdict {
                    status,
                    elapsed: started.elapsed(),
                    checks,
                    last: Some(outcome),
                }
            }
        }
    }
}

/// Loop contínuo de verificação que publica cada mudança de estado no canal.
///
/// Termina quando todos os receivers forem descartados.
pub async fn watch<P: Probe + ?Sized>(
    probe: &P,
    policy: &HealthPolicy,
    tx: watch::Sender<HealthStatus>,
) {
    let started = Instant::now();
    let mut tracker = HealthTracker::new(policy.clone());

    loop {
        tokio::time::sleep(policy.interval).await;
        if tx.is_closed() {
            return;
        }

        let check_started = started.elapsed();
        let outcome = check_once(probe, policy).await;
        if let Some(changed) = tracker.record(check_started, &outcome) {
            tracing::info!(status = %changed, outcome = ?outcome, "estado de saúde mudou");
            if tx.send(changed).is_err() {
                return;
            }
        }
    }
}
