//! HTTP readiness probe.
//!
//! Polls a health endpoint until it answers with the ready status, sleeping
//! `attempt * backoff_step` between attempts. Gives up after
//! `max_attempts`; there is no unbounded retry.

use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ProbeConfig;
use crate::error::{Error, Result};

/// Outcome of a successful readiness probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub base_url: String,
    /// Identifier of the instance that answered, so consumers can tell when
    /// the instance was replaced.
    pub fingerprint: String,
}

pub struct ReadinessProbe {
    client: Client,
    config: ProbeConfig,
    cancel: Option<CancellationToken>,
}

impl ReadinessProbe {
    pub fn new(config: ProbeConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            config,
            cancel: None,
        })
    }

    /// Abort the wait early when `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Wait until `GET base_url + path` returns the ready status.
    pub async fn wait_until_ready(
        &self,
        base_url: &str,
        path: &str,
        fingerprint: &str,
    ) -> Result<HealthCheckResult> {
        let url = Url::parse(base_url)
            .and_then(|base| base.join(path))
            .map_err(|e| Error::Config(format!("invalid health check url {base_url}{path}: {e}")))?;
        let max_attempts = self.config.max_attempts.max(1);

        debug!(url = %url, max_attempts, "Waiting for service to become ready");

        let mut attempt: u32 = 1;
        loop {
            let outcome = tokio::select! {
                outcome = self.probe_once(&url) => outcome,
                _ = cancelled(self.cancel.as_ref()) => {
                    return Err(Error::ProbeCancelled { url: url.to_string(), attempts: attempt });
                }
            };

            let message = match outcome {
                Ok(()) => {
                    info!(url = %url, attempt, "Service is ready");
                    return Ok(HealthCheckResult {
                        base_url: base_url.to_string(),
                        fingerprint: fingerprint.to_string(),
                    });
                }
                Err(message) => message,
            };

            // The first failure is usually the instance still starting up.
            if attempt > 1 {
                warn!(url = %url, attempt, error = %message, "Health check failed");
            } else {
                debug!(url = %url, attempt, error = %message, "Health check failed");
            }

            if attempt >= max_attempts {
                return Err(Error::ReadinessTimeout {
                    url: url.to_string(),
                    attempts: attempt,
                    last_error: message,
                });
            }

            let delay = self.config.backoff_step * attempt;
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancelled(self.cancel.as_ref()) => {
                    return Err(Error::ProbeCancelled { url: url.to_string(), attempts: attempt });
                }
            }
            attempt += 1;
        }
    }

    async fn probe_once(&self, url: &Url) -> std::result::Result<(), String> {
        let resp = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| e.to_string())?;
        let status = resp.status();
        if status.as_u16() != self.config.ready_status {
            return Err(format!(
                "expected {}, got: {}",
                self.config.ready_status, status
            ));
        }
        Ok(())
    }
}

async fn cancelled(token: Option<&CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}
