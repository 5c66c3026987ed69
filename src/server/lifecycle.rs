//! Server lifecycle: construction, registration, serving and drain
//!
//! ```text
//! CREATED --bind--> LISTENING --shutdown--> DRAINING --drained--> STOPPED
//! ```
//!
//! Shutdown is requested by SIGINT/SIGTERM, by `ShutdownController::shutdown`
//! or by an external `ShutdownSignal`. The first request drains the server:
//! 1. LISTENING -> DRAINING
//! 2. Every health entry is marked NOT_SERVING
//! 3. The listener stops accepting; in-flight connections finish
//! 4. DRAINING -> STOPPED

use axum::{middleware, Router};
use socket2::{Domain, Socket, Type};
use std::collections::BTreeSet;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, TcpListener};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::acceptor::PeerCertAcceptor;
use super::auth::{run_chain, Interceptor, InterceptorChain, PeerIdentityInterceptor};
use super::health::{health_routes, qualified_service_name, HealthRegistry, ServingStatus};
use super::shutdown::{shutdown_channel, wait_for_signal, ShutdownController, ShutdownSignal};
use super::tls::{load_credential, CredentialError, TransportCredential};
use crate::config::{ListenConfig, Protocol};

/// Errors binding the listening socket
#[derive(Debug, Error)]
pub enum BindError {
    #[error("Unsupported listen protocol: {0:?}")]
    UnsupportedProtocol(String),

    #[error("Failed to bind {addr}: {source}")]
    Io {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

/// Errors surfaced by the lifecycle manager
#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Credential(#[from] CredentialError),

    #[error(transparent)]
    Bind(#[from] BindError),

    #[error("Service {0:?} is already registered")]
    DuplicateService(String),

    #[error("Invalid service name {0:?}: must be non-empty, contain no '/', and not shadow the health routes")]
    InvalidServiceName(String),

    #[error("Server listen error: {0}")]
    Serve(#[source] std::io::Error),
}

/// Lifecycle state of a server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Created,
    Listening,
    Draining,
    Stopped,
}

/// Shared, observable server state
///
/// Transitions are compare-and-set, so each one happens at most once.
#[derive(Clone)]
pub struct StateTracker {
    sender: Arc<watch::Sender<ServerState>>,
}

impl StateTracker {
    pub fn new() -> Self {
        Self {
            sender: Arc::new(watch::channel(ServerState::Created).0),
        }
    }

    pub fn current(&self) -> ServerState {
        *self.sender.borrow()
    }

    /// Move `from` -> `to`; returns `false` if the state was not `from`
    pub fn transition(&self, from: ServerState, to: ServerState) -> bool {
        let moved = self.sender.send_if_modified(|state| {
            if *state == from {
                *state = to;
                true
            } else {
                false
            }
        });
        if moved {
            info!(?from, ?to, "Server state changed");
        }
        moved
    }

    pub fn subscribe(&self) -> watch::Receiver<ServerState> {
        self.sender.subscribe()
    }
}

impl Default for StateTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle for pushing one service's status into the health registry
#[derive(Clone)]
pub struct StatusReporter {
    registry: HealthRegistry,
    service: String,
}

impl StatusReporter {
    pub fn new(registry: HealthRegistry, service: impl Into<String>) -> Self {
        Self {
            registry,
            service: service.into(),
        }
    }

    /// Fully-qualified registry key this reporter writes
    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn set(&self, status: ServingStatus) -> bool {
        self.registry.set_serving_status(&self.service, status)
    }
}

/// Begin draining: LISTENING -> DRAINING, health NOT_SERVING, then `stop_accepting`
///
/// Returns `false` (and does nothing) unless the server was LISTENING.
pub fn begin_drain(
    state: &StateTracker,
    health: &HealthRegistry,
    stop_accepting: impl FnOnce(),
) -> bool {
    if !state.transition(ServerState::Listening, ServerState::Draining) {
        debug!(state = ?state.current(), "Drain already started or server not listening");
        return false;
    }
    health.shutdown();
    stop_accepting();
    true
}

/// Pending-connection queue length for the listener
const LISTEN_BACKLOG: i32 = 1024;

fn listen_on(addr: SocketAddr, only_v6: bool) -> io::Result<TcpListener> {
    let socket = Socket::new(
        Domain::for_address(addr),
        Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;
    if addr.is_ipv6() {
        socket.set_only_v6(only_v6)?;
    }
    #[cfg(unix)]
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

/// Bind the wildcard address for `protocol`
///
/// `Tcp` binds a dual-stack `[::]` socket; on hosts without IPv6 it falls
/// back to `0.0.0.0`.
fn bind_listener(protocol: Protocol, port: u16) -> Result<TcpListener, BindError> {
    let addr = protocol.socket_addr(port);
    match (protocol, listen_on(addr, protocol == Protocol::Tcp6)) {
        (_, Ok(listener)) => Ok(listener),
        (Protocol::Tcp, Err(e))
            if !matches!(
                e.kind(),
                io::ErrorKind::AddrInUse | io::ErrorKind::PermissionDenied
            ) =>
        {
            let fallback = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
            warn!(error = %e, %fallback, "Dual-stack listener unavailable, using IPv4 only");
            listen_on(fallback, false).map_err(|source| BindError::Io {
                addr: fallback,
                source,
            })
        }
        (_, Err(source)) => Err(BindError::Io { addr, source }),
    }
}

/// Path prefixes owned by the health routes
const RESERVED_SERVICE_NAMES: [&str; 3] = ["grpc.health.v1.Health", "healthz", "readyz"];

/// mTLS server that has not started listening yet
pub struct HarnessServer {
    config: ListenConfig,
    credential: TransportCredential,
    health: HealthRegistry,
    services: Router,
    service_names: BTreeSet<String>,
    interceptors: Vec<Arc<dyn Interceptor>>,
    state: StateTracker,
    shutdown: ShutdownController,
}

impl HarnessServer {
    /// Load credentials from the configured files and build the server
    pub fn new(config: ListenConfig) -> Result<Self, ServerError> {
        let credential = load_credential(&config.cert_file, &config.key_file, &config.ca_file)?;
        Ok(Self::with_credential(config, credential))
    }

    /// Build the server around already-loaded credentials
    pub fn with_credential(config: ListenConfig, credential: TransportCredential) -> Self {
        let health = HealthRegistry::with_strict(config.strict_health);
        let (shutdown, _) = shutdown_channel();

        Self {
            config,
            credential,
            health,
            services: Router::new(),
            service_names: BTreeSet::new(),
            interceptors: vec![Arc::new(PeerIdentityInterceptor) as Arc<dyn Interceptor>],
            state: StateTracker::new(),
            shutdown,
        }
    }

    /// Mount a business service under `/<name>`
    ///
    /// Also creates the service's UNKNOWN health entry, so readiness probes
    /// see it before its first status update.
    pub fn register_service(&mut self, name: &str, router: Router) -> Result<(), ServerError> {
        if name.is_empty() || name.contains('/') || RESERVED_SERVICE_NAMES.contains(&name) {
            return Err(ServerError::InvalidServiceName(name.to_string()));
        }
        if !self.service_names.insert(name.to_string()) {
            return Err(ServerError::DuplicateService(name.to_string()));
        }

        let services = std::mem::take(&mut self.services);
        self.services = services.nest(&format!("/{}", name), router);
        self.health.register(&qualified_service_name(name));

        info!(service = name, "Registered service");
        Ok(())
    }

    /// Append a stage to the interceptor chain
    pub fn add_interceptor(&mut self, interceptor: impl Interceptor) {
        self.interceptors.push(Arc::new(interceptor));
    }

    /// Set the health status of `service` (namespaced as `grpc.health.v1.<service>`)
    pub fn set_serving_status(&self, service: &str, status: ServingStatus) -> bool {
        self.health.set_serving_status(&qualified_service_name(service), status)
    }

    /// Reporter bound to `service`'s namespaced health entry
    pub fn status_reporter(&self, service: &str) -> StatusReporter {
        StatusReporter::new(self.health.clone(), qualified_service_name(service))
    }

    pub fn health(&self) -> HealthRegistry {
        self.health.clone()
    }

    pub fn state(&self) -> ServerState {
        self.state.current()
    }

    pub fn state_tracker(&self) -> StateTracker {
        self.state.clone()
    }

    pub fn config(&self) -> &ListenConfig {
        &self.config
    }

    /// Controller that triggers the same drain as a termination signal
    pub fn shutdown_handle(&self) -> ShutdownController {
        self.shutdown.clone()
    }

    /// Fires once the server starts draining
    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.signal()
    }

    fn build_router(&self) -> Router {
        let chain = InterceptorChain::new(self.interceptors.clone());

        Router::new()
            .merge(health_routes(self.health.clone()))
            .merge(self.services.clone())
            .layer(middleware::from_fn_with_state(chain, run_chain))
    }

    /// Bind the configured port and move to LISTENING
    ///
    /// Bind failures leave the server in CREATED.
    pub fn bind(self) -> Result<ListeningServer, ServerError> {
        let protocol = Protocol::parse(&self.config.protocol)
            .ok_or_else(|| BindError::UnsupportedProtocol(self.config.protocol.clone()))?;
        let listener = bind_listener(protocol, self.config.port)?;
        let local_addr = listener.local_addr().map_err(|source| BindError::Io {
            addr: protocol.socket_addr(self.config.port),
            source,
        })?;

        let router = self.build_router();
        self.state.transition(ServerState::Created, ServerState::Listening);
        info!(addr = %local_addr, protocol = %self.config.protocol, "mTLS server listening");

        Ok(ListeningServer {
            listener,
            local_addr,
            router,
            acceptor: PeerCertAcceptor::new(&self.credential),
            config: self.config,
            health: self.health,
            state: self.state,
            shutdown: self.shutdown,
        })
    }

    /// Bind and serve until shut down
    pub async fn listen_and_serve(self) -> Result<(), ServerError> {
        self.bind()?.serve().await
    }

    /// Bind and serve until shut down or `cancel` fires
    pub async fn listen_and_serve_with_shutdown(
        self,
        cancel: ShutdownSignal,
    ) -> Result<(), ServerError> {
        self.bind()?.serve_with_shutdown(cancel).await
    }
}

/// Bound server, ready to accept connections
pub struct ListeningServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    router: Router,
    acceptor: PeerCertAcceptor,
    config: ListenConfig,
    health: HealthRegistry,
    state: StateTracker,
    shutdown: ShutdownController,
}

async fn wait_for_shutdown_request(
    handle_signals: bool,
    mut requested: ShutdownSignal,
    external: Option<ShutdownSignal>,
) -> &'static str {
    let os_signal = async {
        if !handle_signals {
            return std::future::pending().await;
        }
        match wait_for_signal().await {
            Ok(name) => name,
            Err(e) => {
                warn!(error = %e, "Failed to register signal handlers, relying on explicit shutdown");
                std::future::pending().await
            }
        }
    };
    let cancelled = async {
        match external {
            Some(mut signal) => signal.wait().await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        name = os_signal => name,
        _ = requested.wait() => "shutdown requested",
        _ = cancelled => "context cancelled",
    }
}

impl ListeningServer {
    /// Address actually bound (resolves port 0)
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn health(&self) -> HealthRegistry {
        self.health.clone()
    }

    pub fn state(&self) -> ServerState {
        self.state.current()
    }

    pub fn state_tracker(&self) -> StateTracker {
        self.state.clone()
    }

    pub fn shutdown_handle(&self) -> ShutdownController {
        self.shutdown.clone()
    }

    /// Serve until a termination signal or `shutdown_handle().shutdown()`
    pub async fn serve(self) -> Result<(), ServerError> {
        self.run(None).await
    }

    /// Serve until a termination signal, an explicit shutdown, or `cancel` fires
    pub async fn serve_with_shutdown(self, cancel: ShutdownSignal) -> Result<(), ServerError> {
        self.run(Some(cancel)).await
    }

    async fn run(self, external: Option<ShutdownSignal>) -> Result<(), ServerError> {
        let handle = axum_server::Handle::new();

        let watcher = {
            let handle = handle.clone();
            let health = self.health.clone();
            let state = self.state.clone();
            let shutdown = self.shutdown.clone();
            let drain_timeout = self.config.drain_timeout;
            let handle_signals = self.config.handle_signals;

            tokio::spawn(async move {
                let reason =
                    wait_for_shutdown_request(handle_signals, shutdown.signal(), external).await;
                info!(reason, "Stop requested, draining");

                begin_drain(&state, &health, || {
                    // Propagate to collaborators (poller) watching the server's signal
                    shutdown.shutdown();
                    handle.graceful_shutdown(drain_timeout);
                });
            })
        };

        let result = axum_server::from_tcp(self.listener)
            .acceptor(self.acceptor)
            .handle(handle)
            .serve(self.router.into_make_service())
            .await;

        watcher.abort();

        match result {
            Ok(()) => {
                self.state.transition(ServerState::Draining, ServerState::Stopped);
                info!("mTLS server bye");
                Ok(())
            }
            Err(e) => {
                // Listener failed underneath us; nothing is left to drain
                self.health.shutdown();
                self.state.transition(ServerState::Listening, ServerState::Stopped);
                self.state.transition(ServerState::Draining, ServerState::Stopped);
                Err(ServerError::Serve(e))
            }
        }
    }
}
