//! Mutual TLS credential loading
//!
//! Turns on-disk PEM material into a rustls server configuration that
//! requires every client to present a certificate chain signed by the
//! configured CA bundle. Anonymous clients are refused during the handshake,
//! before any request reaches the router.
//!
//! ## Inputs
//! ```text
//! cert.pem  server leaf (+ intermediates)
//! key.pem   server private key (PKCS#1, PKCS#8 or SEC1)
//! ca.crt    one or more trust anchors for client certificates
//! ```

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::RootCertStore;
use std::fmt;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Which input file an error refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Artifact {
    Certificate,
    PrivateKey,
    CaBundle,
}

impl fmt::Display for Artifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Artifact::Certificate => f.write_str("server certificate"),
            Artifact::PrivateKey => f.write_str("private key"),
            Artifact::CaBundle => f.write_str("CA bundle"),
        }
    }
}

/// Errors that can occur while loading transport credentials
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("Failed to read {artifact} from {path}: {source}")]
    ReadFile {
        artifact: Artifact,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed PEM in {artifact} {path}: {reason}")]
    InvalidPem {
        artifact: Artifact,
        path: PathBuf,
        reason: String,
    },

    #[error("No certificate found in {path}")]
    MissingCertificate { path: PathBuf },

    #[error("No private key found in {path}")]
    MissingKey { path: PathBuf },

    #[error("CA bundle {path} contains no usable certificates")]
    EmptyCaBundle { path: PathBuf },

    #[error("Failed to build client certificate verifier: {0}")]
    ClientVerifier(String),

    #[error("Server certificate {cert} and private key {key} are not usable together: {reason}")]
    KeyMismatch {
        cert: PathBuf,
        key: PathBuf,
        reason: String,
    },

    #[error("Failed to set protocol versions: {0}")]
    ProtocolVersions(String),
}

/// PEM-encoded inputs, tagged with the path they came from
///
/// Paths are only used for error messages, so in-memory material can use
/// any descriptive label.
#[derive(Clone)]
pub struct CredentialPem {
    pub cert_path: PathBuf,
    pub cert_pem: Vec<u8>,
    pub key_path: PathBuf,
    pub key_pem: Vec<u8>,
    pub ca_path: PathBuf,
    pub ca_pem: Vec<u8>,
}

/// Immutable server-side TLS configuration with mandatory client auth
#[derive(Clone)]
pub struct TransportCredential {
    config: Arc<rustls::ServerConfig>,
    trusted_cas: usize,
}

impl TransportCredential {
    /// rustls configuration handed to the acceptor
    pub fn server_config(&self) -> Arc<rustls::ServerConfig> {
        self.config.clone()
    }

    /// Number of trust anchors loaded from the CA bundle
    pub fn trusted_ca_count(&self) -> usize {
        self.trusted_cas
    }
}

impl fmt::Debug for TransportCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportCredential")
            .field("trusted_cas", &self.trusted_cas)
            .field("alpn", &self.config.alpn_protocols)
            .finish()
    }
}

fn read_artifact(artifact: Artifact, path: &Path) -> Result<Vec<u8>, CredentialError> {
    std::fs::read(path).map_err(|source| CredentialError::ReadFile {
        artifact,
        path: path.to_path_buf(),
        source,
    })
}

fn parse_certs(
    artifact: Artifact,
    path: &Path,
    pem: &[u8],
) -> Result<Vec<CertificateDer<'static>>, CredentialError> {
    rustls_pemfile::certs(&mut BufReader::new(pem))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| CredentialError::InvalidPem {
            artifact,
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
}

fn parse_key(path: &Path, pem: &[u8]) -> Result<PrivateKeyDer<'static>, CredentialError> {
    rustls_pemfile::private_key(&mut BufReader::new(pem))
        .map_err(|e| CredentialError::InvalidPem {
            artifact: Artifact::PrivateKey,
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?
        .ok_or_else(|| CredentialError::MissingKey {
            path: path.to_path_buf(),
        })
}

/// Build the trust store for client certificates
///
/// Entries that decode as PEM but are not acceptable trust anchors are
/// skipped; the bundle must still yield at least one anchor.
fn build_client_roots(path: &Path, pem: &[u8]) -> Result<RootCertStore, CredentialError> {
    let certs = parse_certs(Artifact::CaBundle, path, pem)?;

    let mut roots = RootCertStore::empty();
    let (added, ignored) = roots.add_parsable_certificates(certs);
    if ignored > 0 {
        tracing::warn!(
            path = %path.display(),
            ignored,
            "Skipped unparsable certificates in CA bundle"
        );
    }
    if added == 0 {
        return Err(CredentialError::EmptyCaBundle {
            path: path.to_path_buf(),
        });
    }

    Ok(roots)
}

/// Build a rustls ServerConfig from PEM material
///
/// The resulting config rejects clients that do not present a certificate
/// chaining to one of the CA bundle's anchors.
pub fn build_server_config(pem: &CredentialPem) -> Result<TransportCredential, CredentialError> {
    let cert_chain = parse_certs(Artifact::Certificate, &pem.cert_path, &pem.cert_pem)?;
    if cert_chain.is_empty() {
        return Err(CredentialError::MissingCertificate {
            path: pem.cert_path.clone(),
        });
    }

    let key = parse_key(&pem.key_path, &pem.key_pem)?;

    let roots = build_client_roots(&pem.ca_path, &pem.ca_pem)?;
    let trusted_cas = roots.len();

    let provider = Arc::new(rustls::crypto::ring::default_provider());

    let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider.clone())
        .build()
        .map_err(|e| CredentialError::ClientVerifier(e.to_string()))?;

    let mut config = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| CredentialError::ProtocolVersions(e.to_string()))?
        .with_client_cert_verifier(verifier)
        .with_single_cert(cert_chain, key)
        .map_err(|e| CredentialError::KeyMismatch {
            cert: pem.cert_path.clone(),
            key: pem.key_path.clone(),
            reason: e.to_string(),
        })?;

    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    Ok(TransportCredential {
        config: Arc::new(config),
        trusted_cas,
    })
}

/// Load the server certificate, key and client CA bundle from disk
///
/// Called once while constructing the server. Any failure names the
/// offending artifact; no partial credential is returned.
pub fn load_credential(
    cert_file: &Path,
    key_file: &Path,
    ca_file: &Path,
) -> Result<TransportCredential, CredentialError> {
    let pem = CredentialPem {
        cert_pem: read_artifact(Artifact::Certificate, cert_file)?,
        cert_path: cert_file.to_path_buf(),
        key_pem: read_artifact(Artifact::PrivateKey, key_file)?,
        key_path: key_file.to_path_buf(),
        ca_pem: read_artifact(Artifact::CaBundle, ca_file)?,
        ca_path: ca_file.to_path_buf(),
    };

    let credential = build_server_config(&pem)?;
    tracing::info!(
        cert = %cert_file.display(),
        ca = %ca_file.display(),
        trusted_cas = credential.trusted_ca_count(),
        "Loaded mTLS credentials"
    );

    Ok(credential)
}
