//! Readiness probes.

use std::time::Duration;

use async_trait::async_trait;

use crate::network::EmulatorPorts;

/// A side-effect free liveness check against a starting emulator.
///
/// Returns `false` while the emulator is not yet serving and `true` once it is.
#[async_trait]
pub trait LivenessProbe: Send + Sync {
    /// Performs one check.
    async fn ping(&self, ports: &EmulatorPorts) -> bool;
}

/// Requests the latest sealed block from the REST API.
#[derive(Clone, Debug)]
pub struct RestProbe {
    client: reqwest::Client,
}

impl RestProbe {
    /// Creates a probe whose requests give up after `timeout`.
    pub fn new(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!("falling back to default http client: {e}");
                reqwest::Client::new()
            });
        Self { client }
    }
}

impl Default for RestProbe {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

#[async_trait]
impl LivenessProbe for RestProbe {
    async fn ping(&self, ports: &EmulatorPorts) -> bool {
        let url = format!(
            "http://127.0.0.1:{}/v1/blocks?height=sealed",
            ports.rest()
        );
        match self.client.get(&url).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                tracing::trace!("readiness probe failed: {e}");
                false
            }
        }
    }
}
