//! Per-call interceptors
//!
//! Every request runs through an ordered chain of `Interceptor` stages before
//! reaching its handler. Each stage gets the request and a `Chain` it can
//! `proceed` with; whatever the rest of the chain returns is the call's
//! response.
//!
//! `PeerIdentityInterceptor` is always installed first. It turns the peer
//! certificate chain captured at the TLS layer into a `PeerIdentity` request
//! extension and logs it. It never rejects a call; authorization stages can
//! be added after it and read the identity from the request.

use async_trait::async_trait;
use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use rustls::pki_types::CertificateDer;
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

use super::acceptor::PeerCertificates;

/// One stage of the call pipeline
#[async_trait]
pub trait Interceptor: Send + Sync + 'static {
    /// Handle `request`, normally by calling `next.proceed(request)`
    async fn intercept(&self, request: Request, next: Chain<'_>) -> Response;
}

/// Remaining stages of the pipeline, ending in the routed handler
pub struct Chain<'a> {
    stages: &'a [Arc<dyn Interceptor>],
    handler: Next,
}

impl Chain<'_> {
    /// Run the remaining stages and the handler
    pub async fn proceed(self, request: Request) -> Response {
        match self.stages.split_first() {
            Some((stage, rest)) => {
                stage
                    .intercept(
                        request,
                        Chain {
                            stages: rest,
                            handler: self.handler,
                        },
                    )
                    .await
            }
            None => self.handler.run(request).await,
        }
    }
}

/// Ordered interceptor list, composed once when the server is built
#[derive(Clone, Default)]
pub struct InterceptorChain {
    stages: Arc<Vec<Arc<dyn Interceptor>>>,
}

impl InterceptorChain {
    pub fn new(stages: Vec<Arc<dyn Interceptor>>) -> Self {
        Self {
            stages: Arc::new(stages),
        }
    }
}

/// axum middleware entry point, used with `middleware::from_fn_with_state`
pub async fn run_chain(
    State(chain): State<InterceptorChain>,
    request: Request,
    next: Next,
) -> Response {
    Chain {
        stages: &chain.stages,
        handler: next,
    }
    .proceed(request)
    .await
}

/// Identity of the caller, from its verified leaf certificate
#[derive(Debug, Clone, Serialize)]
pub struct PeerIdentity {
    /// Distinguished name, e.g. `CN=client, O=example`
    pub subject: String,
    pub common_name: Option<String>,
    /// Full DER chain, leaf first
    #[serde(skip)]
    pub chain: Arc<[CertificateDer<'static>]>,
}

impl PeerIdentity {
    /// Parse the leaf of `certs`; `None` if there is no leaf or it is not X.509
    pub fn from_certificates(certs: &PeerCertificates) -> Option<Self> {
        let leaf = certs.leaf()?;
        let (_, cert) = x509_parser::parse_x509_certificate(leaf.as_ref()).ok()?;

        let subject = cert.subject().to_string();
        let common_name = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .map(str::to_string);

        Some(Self {
            subject,
            common_name,
            chain: certs.0.clone(),
        })
    }
}

/// Surfaces the caller's certificate identity to the rest of the pipeline
pub struct PeerIdentityInterceptor;

#[async_trait]
impl Interceptor for PeerIdentityInterceptor {
    async fn intercept(&self, mut request: Request, next: Chain<'_>) -> Response {
        let identity = request
            .extensions()
            .get::<PeerCertificates>()
            .filter(|certs| !certs.is_empty())
            .and_then(PeerIdentity::from_certificates);

        match identity {
            Some(identity) => {
                debug!(
                    subject = %identity.subject,
                    chain_len = identity.chain.len(),
                    path = %request.uri().path(),
                    "Request certificate subject"
                );
                request.extensions_mut().insert(identity);
            }
            None => {
                debug!(
                    path = %request.uri().path(),
                    "No peer certificate on request"
                );
            }
        }

        next.proceed(request).await
    }
}
