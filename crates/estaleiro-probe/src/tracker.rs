use crate::policy::HealthPolicy;
use crate::ProbeOutcome;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Starting,
    Healthy,
    Unhealthy,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Starting => write!(f, "starting"),
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Acumula resultados de verificações e decide o estado de saúde
#[derive(Debug, Clone)]
pub struct HealthTracker {
    policy: HealthPolicy,
    status: HealthStatus,
    consecutive_failures: u32,
}

impl HealthTracker {
    pub fn new(policy: HealthPolicy) -> Self {
        Self {
            policy,
            status: HealthStatus::Starting,
            consecutive_failures: 0,
        }
    }

    pub fn status(&self) -> HealthStatus {
        self.status
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Registra uma verificação que começou `since_start` depois do início
    /// do processo. Retorna o novo estado quando houve mudança.
    pub fn record(&mut self, since_start: Duration, outcome: &ProbeOutcome) -> Option<HealthStatus> {
        let previous = self.status;

        if outcome.is_success() {
            self.consecutive_failures = 0;
            self.status = HealthStatus::Healthy;
        } else if since_start >= self.policy.start_period {
            self.consecutive_failures += 1;
            if self.consecutive_failures >= self.policy.retries {
                self.status = HealthStatus::Unhealthy;
            }
        }

        (self.status != previous).then_some(self.status)
    }
}
