//! Throwaway PKI for tests
//!
//! ```text
//! harness-test-ca
//!     ├── server cert (localhost, 127.0.0.1)
//!     └── client cert (CN = test-client)
//! rogue-ca
//!     └── rogue client cert (CN = rogue-client)
//! ```

#![allow(clippy::unwrap_used, clippy::expect_used)]

use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair, KeyUsagePurpose, SanType,
};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use tempfile::TempDir;

use crate::config::ListenConfig;

pub const CLIENT_CN: &str = "test-client";

/// PEM strings for a CA, a server leaf and a client leaf
pub struct TestPki {
    pub ca_cert_pem: String,
    pub server_cert_pem: String,
    pub server_key_pem: String,
    pub client_cert_pem: String,
    pub client_key_pem: String,
    pub rogue_ca_pem: String,
    pub rogue_cert_pem: String,
    pub rogue_key_pem: String,
}

fn generate_ca(name: &str) -> (Certificate, KeyPair) {
    let mut params = CertificateParams::default();
    params.distinguished_name.push(DnType::CommonName, name);
    params
        .distinguished_name
        .push(DnType::OrganizationName, "mtls-harness");
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];

    let key_pair = KeyPair::generate().unwrap();
    let cert = params.self_signed(&key_pair).unwrap();
    (cert, key_pair)
}

fn generate_leaf(
    ca_cert: &Certificate,
    ca_key: &KeyPair,
    common_name: &str,
    usage: ExtendedKeyUsagePurpose,
) -> (String, String) {
    let mut params = CertificateParams::new(vec!["localhost".to_string()]).unwrap();
    params.subject_alt_names.push(SanType::IpAddress(IpAddr::V4(Ipv4Addr::LOCALHOST)));
    params
        .distinguished_name
        .push(DnType::CommonName, common_name);
    params
        .distinguished_name
        .push(DnType::OrganizationName, "mtls-harness");
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![usage];

    let key_pair = KeyPair::generate().unwrap();
    let cert = params.signed_by(&key_pair, ca_cert, ca_key).unwrap();
    (cert.pem(), key_pair.serialize_pem())
}

impl TestPki {
    pub fn generate() -> Self {
        let (ca_cert, ca_key) = generate_ca("harness-test-ca");
        let (server_cert_pem, server_key_pem) = generate_leaf(
            &ca_cert,
            &ca_key,
            "localhost",
            ExtendedKeyUsagePurpose::ServerAuth,
        );
        let (client_cert_pem, client_key_pem) = generate_leaf(
            &ca_cert,
            &ca_key,
            CLIENT_CN,
            ExtendedKeyUsagePurpose::ClientAuth,
        );

        let (rogue_ca, rogue_ca_key) = generate_ca("rogue-ca");
        let (rogue_cert_pem, rogue_key_pem) = generate_leaf(
            &rogue_ca,
            &rogue_ca_key,
            "rogue-client",
            ExtendedKeyUsagePurpose::ClientAuth,
        );

        Self {
            ca_cert_pem: ca_cert.pem(),
            server_cert_pem,
            server_key_pem,
            client_cert_pem,
            client_key_pem,
            rogue_ca_pem: rogue_ca.pem(),
            rogue_cert_pem,
            rogue_key_pem,
        }
    }

    /// Write cert.pem, key.pem and ca.crt into a fresh temp directory
    pub fn write_files(&self) -> PkiFiles {
        let dir = tempfile::tempdir().unwrap();
        let cert = dir.path().join("cert.pem");
        let key = dir.path().join("key.pem");
        let ca = dir.path().join("ca.crt");
        std::fs::write(&cert, &self.server_cert_pem).unwrap();
        std::fs::write(&key, &self.server_key_pem).unwrap();
        std::fs::write(&ca, &self.ca_cert_pem).unwrap();
        PkiFiles {
            _dir: dir,
            cert,
            key,
            ca,
        }
    }

    /// Client certificate and key concatenated, as reqwest expects
    pub fn client_identity_pem(&self) -> Vec<u8> {
        format!("{}{}", self.client_cert_pem, self.client_key_pem).into_bytes()
    }

    pub fn rogue_identity_pem(&self) -> Vec<u8> {
        format!("{}{}", self.rogue_cert_pem, self.rogue_key_pem).into_bytes()
    }
}

/// Paths to written PEM files; the directory lives as long as this value
pub struct PkiFiles {
    _dir: TempDir,
    pub cert: PathBuf,
    pub key: PathBuf,
    pub ca: PathBuf,
}

impl PkiFiles {
    /// Config listening on an ephemeral port with signal handling disabled
    pub fn listen_config(&self) -> ListenConfig {
        ListenConfig::default()
            .with_port(0)
            .with_cert_files(&self.cert, &self.key, &self.ca)
            .with_signal_handling(false)
    }
}

/// HTTPS client presenting the given identity and trusting the test CA
pub fn https_client(pki: &TestPki, identity_pem: Option<Vec<u8>>) -> reqwest::Client {
    https_client_via(pki, identity_pem, IpAddr::V4(Ipv4Addr::LOCALHOST))
}

/// Like `https_client`, with `localhost` pinned to `ip`
pub fn https_client_via(
    pki: &TestPki,
    identity_pem: Option<Vec<u8>>,
    ip: IpAddr,
) -> reqwest::Client {
    let ca = reqwest::Certificate::from_pem(pki.ca_cert_pem.as_bytes()).unwrap();
    let mut builder = reqwest::Client::builder()
        .use_rustls_tls()
        .tls_built_in_root_certs(false)
        .add_root_certificate(ca)
        .resolve("localhost", SocketAddr::new(ip, 0))
        .timeout(std::time::Duration::from_secs(5));
    if let Some(pem) = identity_pem {
        builder = builder.identity(reqwest::Identity::from_pem(&pem).unwrap());
    }
    builder.build().unwrap()
}
