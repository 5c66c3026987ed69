//! TLS acceptor that exposes the client's certificate chain to handlers
//!
//! Wraps axum-server's `RustlsAcceptor`. Once the handshake (including
//! client certificate verification) has succeeded, the negotiated peer chain
//! is attached to every request on that connection as a `PeerCertificates`
//! extension. Connections failing verification never reach this point.

use axum_server::accept::Accept;
use axum_server::tls_rustls::{RustlsAcceptor, RustlsConfig};
use futures::future::BoxFuture;
use rustls::pki_types::CertificateDer;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::server::TlsStream;
use tower_http::add_extension::AddExtension;

use super::tls::TransportCredential;

/// Verified client certificate chain, leaf first
///
/// Empty if the connection somehow completed without a client certificate.
#[derive(Debug, Clone)]
pub struct PeerCertificates(pub Arc<[CertificateDer<'static>]>);

impl PeerCertificates {
    pub fn leaf(&self) -> Option<&CertificateDer<'static>> {
        self.0.first()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Clone)]
pub struct PeerCertAcceptor {
    inner: RustlsAcceptor,
}

impl PeerCertAcceptor {
    pub fn new(credential: &TransportCredential) -> Self {
        let config = RustlsConfig::from_config(credential.server_config());
        Self {
            inner: RustlsAcceptor::new(config),
        }
    }
}

impl<I, S> Accept<I, S> for PeerCertAcceptor
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    S: Send + 'static,
{
    type Stream = TlsStream<I>;
    type Service = AddExtension<S, PeerCertificates>;
    type Future = BoxFuture<'static, io::Result<(Self::Stream, Self::Service)>>;

    fn accept(&self, stream: I, service: S) -> Self::Future {
        let acceptor = self.inner.clone();

        Box::pin(async move {
            let (stream, service) = acceptor.accept(stream, service).await?;
            let (_, connection) = stream.get_ref();
            let chain: Arc<[CertificateDer<'static>]> = connection
                .peer_certificates()
                .map(|certs| certs.iter().map(|c| c.clone().into_owned()).collect())
                .unwrap_or_else(|| Arc::from(Vec::new()));

            Ok((stream, AddExtension::new(service, PeerCertificates(chain))))
        })
    }
}
