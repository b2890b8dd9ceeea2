//! Política de restart de workers: backoff exponencial por slot e um
//! disjuntor de crash-loop para o pool inteiro.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RestartPolicy {
    /// Reinicia workers que morreram
    pub enabled: bool,
    /// Primeiro atraso de restart, em milissegundos
    pub backoff_base_ms: u64,
    /// Teto do atraso, em milissegundos
    pub backoff_max_ms: u64,
    /// Crashes tolerados dentro da janela antes de desistir
    pub max_restarts: u32,
    /// Janela do disjuntor; um worker que sobrevive a ela zera o backoff
    pub window_secs: u64,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            backoff_base_ms: 500,
            backoff_max_ms: 30_000,
            max_restarts: 10,
            window_secs: 60,
        }
    }
}

/// O que fazer com um worker que acabou de morrer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    Restart { delay: Duration },
    /// Crash-loop: o pool deve parar e sair com erro
    Trip,
    /// Restart desabilitado: o código de saída do worker vira o do launcher
    GiveUp,
}

impl RestartPolicy {
    /// Sem restarts: quem cuida é o orquestrador
    pub fn never() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.enabled && self.backoff_base_ms == 0 {
            return Err("backoff_base_ms deve ser maior que zero".to_string());
        }
        if self.backoff_max_ms < self.backoff_base_ms {
            return Err("backoff_max_ms deve ser >= backoff_base_ms".to_string());
        }
        if self.window_secs == 0 {
            return Err("window_secs deve ser maior que zero".to_string());
        }
        Ok(())
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    /// Atraso do n-ésimo restart consecutivo (n começa em 1): `base * 2^(n-1)`
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32);
        let delay = self.backoff_base_ms.saturating_mul(1u64 << exp);
        Duration::from_millis(delay.min(self.backoff_max_ms))
    }
}

/// Registro de crashes do pool, usado pelo disjuntor
#[derive(Debug)]
pub struct CrashLedger {
    policy: RestartPolicy,
    crashes: VecDeque<Instant>,
}

impl CrashLedger {
    pub fn new(policy: RestartPolicy) -> Self {
        Self {
            policy,
            crashes: VecDeque::new(),
        }
    }

    pub fn policy(&self) -> &RestartPolicy {
        &self.policy
    }

    /// Crashes ainda dentro da janela
    pub fn recent(&self, now: Instant) -> usize {
        let window = self.policy.window();
        self.crashes
            .iter()
            .filter(|t| now.duration_since(**t) < window)
            .count()
    }

    /// Registra um crash de um worker que já tinha `attempt` crashes seguidos
    /// (contando este) e decide o próximo passo.
    pub fn record(&mut self, now: Instant, attempt: u32) -> RestartDecision {
        if !self.policy.enabled {
            return RestartDecision::GiveUp;
        }

        let window = self.policy.window();
        while let Some(oldest) = self.crashes.front() {
            if now.duration_since(*oldest) >= window {
                self.crashes.pop_front();
            } else {
                break;
            }
        }
        self.crashes.push_back(now);

        if self.crashes.len() as u32 > self.policy.max_restarts {
            return RestartDecision::Trip;
        }

        RestartDecision::Restart {
            delay: self.policy.backoff(attempt),
        }
    }
}
