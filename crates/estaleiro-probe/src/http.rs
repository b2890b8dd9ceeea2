use crate::{Probe, ProbeOutcome};
use async_trait::async_trait;
use std::time::{Duration, Instant};

/// Faz um GET no caminho raiz (ou na URL informada) do processo
#[derive(Debug, Clone)]
pub struct HttpProbe {
    url: String,
    client: reqwest::Client,
}

impl HttpProbe {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        Ok(Self {
            url: url.into(),
            client,
        })
    }

    /// Sonda para `http://<host>:<port>/`
    pub fn for_port(host: &str, port: u16, timeout: Duration) -> Result<Self, reqwest::Error> {
        Self::new(format!("http://{host}:{port}/"), timeout)
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Probe for HttpProbe {
    async fn check(&self) -> ProbeOutcome {
        let started = Instant::now();
        match self.client.get(&self.url).send().await {
            // Redirecionamentos contam como sucesso (equivalente a `curl -f`)
            Ok(response) if response.status().as_u16() < 400 => ProbeOutcome::Success {
                status: response.status().as_u16(),
                elapsed: started.elapsed(),
            },
            Ok(response) => ProbeOutcome::Failure {
                reason: format!("status HTTP {}", response.status().as_u16()),
            },
            Err(e) => ProbeOutcome::Failure {
                reason: e.to_string(),
            },
        }
    }
}
