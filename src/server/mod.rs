//! mTLS server harness
//!
//! - `tls` - loads PEM credentials into a client-verifying rustls config
//! - `acceptor` / `auth` - peer certificate capture and the interceptor chain
//! - `health` - health registry and the Check/Watch/probe endpoints
//! - `lifecycle` - bind, serve, and drain on shutdown
//! - `shutdown` - cancellation channel and SIGTERM/SIGINT handling

mod acceptor;
mod auth;
mod health;
mod lifecycle;
pub mod shutdown;
mod tls;

pub use acceptor::{PeerCertAcceptor, PeerCertificates};
pub use auth::{
    run_chain, Chain, Interceptor, InterceptorChain, PeerIdentity, PeerIdentityInterceptor,
};
pub use health::{
    health_routes, qualified_service_name, HealthCheckRequest, HealthCheckResponse, HealthError,
    HealthRegistry, ServingStatus, StatusWatch, CHECK_PATH, HEALTH_SERVICE_PREFIX,
    OVERALL_SERVICE, WATCH_PATH,
};
pub use lifecycle::{
    begin_drain, BindError, HarnessServer, ListeningServer, ServerError, ServerState,
    StateTracker, StatusReporter,
};
pub use shutdown::{shutdown_channel, wait_for_signal, ShutdownController, ShutdownSignal};
pub use tls::{
    build_server_config, load_credential, Artifact, CredentialError, CredentialPem,
    TransportCredential,
};

#[cfg(test)]
mod test_pki;

#[cfg(test)]
#[path = "tls_test.rs"]
mod tls_tests;

#[cfg(test)]
#[path = "auth_test.rs"]
mod auth_tests;

#[cfg(test)]
#[path = "health_test.rs"]
mod health_tests;

#[cfg(test)]
#[path = "lifecycle_test.rs"]
mod lifecycle_tests;

#[cfg(test)]
#[path = "shutdown_test.rs"]
mod shutdown_tests;
