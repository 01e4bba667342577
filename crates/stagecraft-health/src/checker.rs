//! Health check probe logic.
//!
//! Performs HTTP health checks against a stage's load balancer and tracks
//! consecutive results with hysteresis.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, info, warn};

use stagecraft_core::{HealthEndpoint, HealthVerdict, StageDescriptor};

use crate::settings::HealthSettings;

/// Result of a single health probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    /// The health endpoint returned 2xx within the timeout.
    Healthy,
    /// The health endpoint returned non-2xx.
    Unhealthy,
    /// The probe could not be executed (connection error or timeout).
    Failed,
}

impl ProbeResult {
    pub fn is_success(&self) -> bool {
        matches!(self, ProbeResult::Healthy)
    }
}

/// Something that can probe a stage's health endpoint.
pub trait Prober: Send + Sync + 'static {
    fn probe(
        &self,
        stage: &StageDescriptor,
        timeout: Duration,
    ) -> impl Future<Output = ProbeResult> + Send;
}

/// Probes `GET http://{address}{path}` on the stage's health endpoint.
///
/// One connection per check. A 2xx answer is `Healthy`, any other status is
/// `Unhealthy`, and anything that stops the exchange (refused connection,
/// broken handshake, timeout) is `Failed`.
#[derive(Debug, Default, Clone)]
pub struct HttpProber;

impl HttpProber {
    const USER_AGENT: &'static str = concat!("stagecraft-health/", env!("CARGO_PKG_VERSION"));

    /// Check one endpoint, bounded by `timeout` end to end.
    pub async fn check(&self, endpoint: &HealthEndpoint, timeout: Duration) -> ProbeResult {
        match tokio::time::timeout(timeout, Self::exchange(endpoint)).await {
            Ok(Ok(status)) if status.is_success() => ProbeResult::Healthy,
            Ok(Ok(status)) => {
                debug!(%status, address = %endpoint.address, path = %endpoint.path, "health endpoint not ok");
                ProbeResult::Unhealthy
            }
            Ok(Err(reason)) => {
                debug!(%reason, address = %endpoint.address, path = %endpoint.path, "health check failed");
                ProbeResult::Failed
            }
            Err(_) => {
                debug!(?timeout, address = %endpoint.address, "health check timed out");
                ProbeResult::Failed
            }
        }
    }

    async fn exchange(endpoint: &HealthEndpoint) -> Result<http::StatusCode, String> {
        let stream = tokio::net::TcpStream::connect(endpoint.address.as_str())
            .await
            .map_err(|e| format!("connect: {e}"))?;
        let (mut sender, conn) = hyper::client::conn::http1::handshake(hyper_util::rt::TokioIo::new(stream))
            .await
            .map_err(|e| format!("handshake: {e}"))?;
        tokio::spawn(conn);

        let request = http::Request::get(endpoint.path.as_str())
            .header(http::header::HOST, endpoint.address.as_str())
            .header(http::header::USER_AGENT, Self::USER_AGENT)
            .body(http_body_util::Empty::<bytes::Bytes>::new())
            .map_err(|e| format!("request: {e}"))?;
        let response = sender
            .send_request(request)
            .await
            .map_err(|e| format!("send: {e}"))?;
        Ok(response.status())
    }
}

impl Prober for HttpProber {
    async fn probe(&self, stage: &StageDescriptor, timeout: Duration) -> ProbeResult {
        self.check(&stage.health_endpoint, timeout).await
    }
}

/// Tracks consecutive probe results for one stage.
///
/// The verdict starts `Degraded` and only flips at a threshold, so a single
/// stray result never changes it.
#[derive(Debug)]
pub struct HealthTracker {
    verdict: HealthVerdict,
    consecutive_failures: u32,
    consecutive_successes: u32,
    healthy_threshold: u32,
    unhealthy_threshold: u32,
}

impl HealthTracker {
    /// Create a new tracker from health settings.
    pub fn new(settings: &HealthSettings) -> Self {
        Self::with_thresholds(settings.healthy_threshold, settings.unhealthy_threshold)
    }

    /// Create a tracker with explicit thresholds.
    pub fn with_thresholds(healthy_threshold: u32, unhealthy_threshold: u32) -> Self {
        Self {
            verdict: HealthVerdict::Degraded,
            consecutive_failures: 0,
            consecutive_successes: 0,
            healthy_threshold: healthy_threshold.max(1),
            unhealthy_threshold: unhealthy_threshold.max(1),
        }
    }

    /// Record a probe result and return the resulting verdict.
    pub fn record(&mut self, result: ProbeResult) -> HealthVerdict {
        if result.is_success() {
            self.consecutive_failures = 0;
            self.consecutive_successes += 1;

            if self.consecutive_successes >= self.healthy_threshold
                && self.verdict != HealthVerdict::Healthy
            {
                info!(successes = self.consecutive_successes, "stage marked healthy");
                self.verdict = HealthVerdict::Healthy;
            }
        } else {
            self.consecutive_successes = 0;
            self.consecutive_failures += 1;

            if self.consecutive_failures >= self.unhealthy_threshold
                && self.verdict != HealthVerdict::Unhealthy
            {
                warn!(
                    failures = self.consecutive_failures,
                    threshold = self.unhealthy_threshold,
                    "stage marked unhealthy"
                );
                self.verdict = HealthVerdict::Unhealthy;
            }
        }

        self.verdict
    }

    /// Current verdict.
    pub fn verdict(&self) -> HealthVerdict {
        self.verdict
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn consecutive_successes(&self) -> u32 {
        self.consecutive_successes
    }
}
