use axum::{http::StatusCode, routing::post, Extension, Json, Router};
use clap::Parser;
use mtls_harness::config::{
    ListenConfig, DEFAULT_CA_FILE, DEFAULT_CERT_FILE, DEFAULT_KEY_FILE, DEFAULT_PORT,
    DEFAULT_PROTOCOL,
};
use mtls_harness::poller::{BackendHealth, HealthPoller, HttpBackend, TcpBackend};
use mtls_harness::server::{HarnessServer, PeerIdentity, ServingStatus};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

/// Name the demo service is registered and health-reported under
const HARNESS_SERVICE: &str = "Harness";

#[derive(Debug, Parser)]
#[command(name = "mtls-harness")]
#[command(about = "mTLS server harness with health checking and graceful drain", long_about = None)]
struct Cli {
    /// Port to listen on
    #[arg(long, env = "HARNESS_PORT", default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Listen protocol: tcp, tcp4 or tcp6
    #[arg(long, env = "HARNESS_PROTO", default_value = DEFAULT_PROTOCOL)]
    proto: String,

    /// Server certificate (PEM)
    #[arg(long, env = "HARNESS_CERT_FILE", default_value = DEFAULT_CERT_FILE)]
    certfile: PathBuf,

    /// Server private key (PEM)
    #[arg(long, env = "HARNESS_KEY_FILE", default_value = DEFAULT_KEY_FILE)]
    keyfile: PathBuf,

    /// CA bundle used to verify client certificates (PEM)
    #[arg(long, env = "HARNESS_CA_FILE", default_value = DEFAULT_CA_FILE)]
    cafile: PathBuf,

    /// Seconds between backend health checks
    #[arg(
        long,
        env = "HARNESS_POLL_FREQ",
        default_value_t = 30,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    poll_freq: u64,

    /// Seconds before a backend health check counts as failed
    #[arg(long, env = "HARNESS_CHECK_TIMEOUT", default_value_t = 30)]
    check_timeout: u64,

    /// Upper bound in seconds on draining in-flight calls (unbounded if unset)
    #[arg(long, env = "HARNESS_DRAIN_TIMEOUT")]
    drain_timeout: Option<u64>,

    /// Backend checked by opening a TCP connection
    #[arg(long, conflicts_with = "backend_url")]
    backend_addr: Option<SocketAddr>,

    /// Backend checked with GET, healthy on 2xx
    #[arg(long)]
    backend_url: Option<String>,

    /// Answer Check for unregistered services with 404 instead of UNKNOWN
    #[arg(long)]
    strict_health: bool,
}

impl Cli {
    fn listen_config(&self) -> ListenConfig {
        ListenConfig::default()
            .with_port(self.port)
            .with_protocol(self.proto.clone())
            .with_cert_files(&self.certfile, &self.keyfile, &self.cafile)
            .with_drain_timeout(self.drain_timeout.map(Duration::from_secs))
            .with_strict_health(self.strict_health)
    }

    fn backend(&self) -> anyhow::Result<Option<Arc<dyn BackendHealth>>> {
        if let Some(addr) = self.backend_addr {
            return Ok(Some(Arc::new(TcpBackend::new(addr))));
        }
        let Some(url) = &self.backend_url else {
            return Ok(None);
        };

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(self.check_timeout))
            .build()?;
        Ok(Some(Arc::new(HttpBackend::with_client(client, url.clone()))))
    }
}

async fn who_am_i(
    identity: Option<Extension<PeerIdentity>>,
) -> Result<Json<PeerIdentity>, StatusCode> {
    identity
        .map(|Extension(identity)| Json(identity))
        .ok_or(StatusCode::UNAUTHORIZED)
}

fn harness_service() -> Router {
    Router::new().route("/WhoAmI", post(who_am_i))
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut server = HarnessServer::new(cli.listen_config())?;
    server.register_service(HARNESS_SERVICE, harness_service())?;

    match cli.backend()? {
        Some(backend) => {
            let poller = HealthPoller::new(backend, server.status_reporter(HARNESS_SERVICE))
                .with_interval(Duration::from_secs(cli.poll_freq))
                .with_timeout(Duration::from_secs(cli.check_timeout));
            tokio::spawn(poller.run(server.shutdown_signal()));
        }
        None => {
            // Nothing to poll; the demo service is ready as soon as it is mounted
            server.set_serving_status(HARNESS_SERVICE, ServingStatus::Serving);
        }
    }

    server.listen_and_serve().await?;
    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    info!(port = cli.port, protocol = %cli.proto, "Starting mtls-harness");

    if let Err(e) = run(cli).await {
        error!(error = %e, "mtls-harness failed");
        std::process::exit(1);
    }
}

#[cfg(test)]
#[path = "main_test.rs"]
mod tests;
