//! Backend health poller
//!
//! Periodically runs a backend health check and pushes the result into the
//! health registry:
//! - check returned Ok -> SERVING
//! - check failed or exceeded its timeout -> NOT_SERVING
//!
//! Failures never escape the poller; they only show up as a status flip.

use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::server::{ServingStatus, ShutdownSignal, StatusReporter};

/// Default interval between checks
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Default deadline for a single check
pub const DEFAULT_CHECK_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum HealthCheckError {
    #[error("Backend unreachable: {0}")]
    Unreachable(String),

    #[error("Backend returned status {0}")]
    BadStatus(u16),

    #[error("Backend check timed out after {0:?}")]
    Timeout(Duration),
}

/// Health check of a dependent backend
///
/// Implementations do not need their own deadline: the poller drops the
/// check future once its timeout elapses.
#[async_trait]
pub trait BackendHealth: Send + Sync {
    async fn check(&self) -> Result<(), HealthCheckError>;
}

/// Healthy when a TCP connection to `addr` can be opened
pub struct TcpBackend {
    addr: SocketAddr,
}

impl TcpBackend {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }
}

#[async_trait]
impl BackendHealth for TcpBackend {
    async fn check(&self) -> Result<(), HealthCheckError> {
        tokio::net::TcpStream::connect(self.addr)
            .await
            .map(|_| ())
            .map_err(|e| HealthCheckError::Unreachable(format!("{}: {}", self.addr, e)))
    }
}

/// Healthy when `GET url` answers with a 2xx status
pub struct HttpBackend {
    client: reqwest::Client,
    url: String,
}

impl HttpBackend {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }

    pub fn with_client(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl BackendHealth for HttpBackend {
    async fn check(&self) -> Result<(), HealthCheckError> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| HealthCheckError::Unreachable(format!("{}: {}", self.url, e)))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(HealthCheckError::BadStatus(status.as_u16()))
        }
    }
}

/// Drives a `BackendHealth` and reports into one registry entry
pub struct HealthPoller {
    backend: Arc<dyn BackendHealth>,
    reporter: StatusReporter,
    interval: Duration,
    timeout: Duration,
}

impl HealthPoller {
    pub fn new(backend: Arc<dyn BackendHealth>, reporter: StatusReporter) -> Self {
        Self {
            backend,
            reporter,
            interval: DEFAULT_POLL_INTERVAL,
            timeout: DEFAULT_CHECK_TIMEOUT,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run one check and push its result; returns the status pushed
    pub async fn poll_once(&self) -> ServingStatus {
        let outcome = match tokio::time::timeout(self.timeout, self.backend.check()).await {
            Ok(result) => result,
            Err(_) => Err(HealthCheckError::Timeout(self.timeout)),
        };

        let status = match outcome {
            Ok(()) => ServingStatus::Serving,
            Err(e) => {
                debug!(service = %self.reporter.service(), error = %e, "Backend health check failed");
                ServingStatus::NotServing
            }
        };

        if !self.reporter.set(status) {
            debug!(service = %self.reporter.service(), ?status, "Status update not applied");
        }
        status
    }

    /// Poll now and then every interval until `shutdown` fires
    pub async fn run(self, mut shutdown: ShutdownSignal) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            service = %self.reporter.service(),
            interval = ?self.interval,
            timeout = ?self.timeout,
            "Health poller started"
        );

        let mut last = None;
        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                _ = ticker.tick() => {
                    let status = self.poll_once().await;
                    if last != Some(status) {
                        if status == ServingStatus::Serving {
                            info!(service = %self.reporter.service(), "Backend healthy");
                        } else {
                            warn!(service = %self.reporter.service(), "Backend unhealthy");
                        }
                        last = Some(status);
                    }
                }
            }
        }

        info!(service = %self.reporter.service(), "Health poller stopped");
    }
}

#[cfg(test)]
#[path = "poller_test.rs"]
mod tests;
