use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Parâmetros da verificação periódica (equivalentes às flags do HEALTHCHECK)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HealthPolicy {
    /// Intervalo entre o fim de uma verificação e o início da próxima
    #[serde(with = "secs")]
    pub interval: Duration,

    /// Tempo máximo de uma verificação
    #[serde(with = "secs")]
    pub timeout: Duration,

    /// Janela inicial em que falhas não contam
    #[serde(with = "secs")]
    pub start_period: Duration,

    /// Falhas consecutivas até declarar `unhealthy`
    pub retries: u32,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(10),
            start_period: Duration::from_secs(5),
            retries: 3,
        }
    }
}

impl HealthPolicy {
    /// Rejeita políticas que nunca chegariam a um veredito
    pub fn validate(&self) -> Result<(), String> {
        if self.interval.is_zero() {
            return Err("interval deve ser maior que zero".to_string());
        }
        if self.timeout.is_zero() {
            return Err("timeout deve ser maior que zero".to_string());
        }
        if self.retries == 0 {
            return Err("retries deve ser pelo menos 1".to_string());
        }
        Ok(())
    }

    /// Quantas verificações podem começar dentro do start period
    fn uncounted_checks(&self) -> u32 {
        let start = self.start_period.as_nanos().saturating_sub(1);
        let interval = self.interval.as_nanos().max(1);
        (start / interval) as u32
    }

    /// Limite superior para declarar `unhealthy` um processo que nunca responde
    pub fn unhealthy_deadline(&self) -> Duration {
        (self.interval + self.timeout) * (self.retries + self.uncounted_checks())
    }

    /// Limite superior para declarar `healthy` um processo que já responde
    pub fn healthy_deadline(&self) -> Duration {
        self.start_period + self.interval
    }
}

mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_matches_container_healthcheck() {
        let policy = HealthPolicy::default();
        assert_eq!(policy.interval, Duration::from_secs(30));
        assert_eq!(policy.timeout, Duration::from_secs(10));
        assert_eq!(policy.start_period, Duration::from_secs(5));
        assert_eq!(policy.retries, 3);
        assert!(policy.validate().is_ok());
    }

    #[test]
    fn test_unhealthy_deadline() {
        let policy = HealthPolicy::default();
        assert_eq!(policy.unhealthy_deadline(), Duration::from_secs(120));

        let long_start = HealthPolicy {
            start_period: Duration::from_secs(35),
            ..HealthPolicy::default()
        };
        assert_eq!(long_start.unhealthy_deadline(), Duration::from_secs(160));
    }

    #[test]
    fn test_zero_retries_rejected() {
        let policy = HealthPolicy {
            retries: 0,
            ..HealthPolicy::default()
        };
        assert!(policy.validate().is_err());
    }
}
