//! Listener configuration
//!
//! Read once when the server is constructed and never mutated afterwards,
//! so several independently configured servers can live in one process.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default listen port
pub const DEFAULT_PORT: u16 = 6000;

/// Default listen protocol
pub const DEFAULT_PROTOCOL: &str = "tcp";

/// Default server certificate path
pub const DEFAULT_CERT_FILE: &str = "/etc/mTLS/cert.pem";

/// Default server private key path
pub const DEFAULT_KEY_FILE: &str = "/etc/mTLS/key.pem";

/// Default client CA bundle path
pub const DEFAULT_CA_FILE: &str = "/etc/mTLS/ca.crt";

/// Stream protocol the listener binds with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// "tcp": dual-stack `[::]`, accepting IPv4 and IPv6 clients
    Tcp,
    /// "tcp4": IPv4 wildcard only
    Tcp4,
    /// "tcp6": IPv6 wildcard only
    Tcp6,
}

impl Protocol {
    /// Parse a protocol name; `None` for anything that is not stream TCP
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "tcp" => Some(Protocol::Tcp),
            "tcp4" => Some(Protocol::Tcp4),
            "tcp6" => Some(Protocol::Tcp6),
            _ => None,
        }
    }

    fn wildcard(self) -> IpAddr {
        match self {
            Protocol::Tcp4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            Protocol::Tcp | Protocol::Tcp6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        }
    }

    /// Wildcard socket address for this protocol
    pub fn socket_addr(self, port: u16) -> SocketAddr {
        SocketAddr::new(self.wildcard(), port)
    }
}

/// Everything the lifecycle manager needs to bind and secure its listener
#[derive(Debug, Clone)]
pub struct ListenConfig {
    pub port: u16,
    /// Protocol name as given by the operator ("tcp", "tcp4", "tcp6")
    pub protocol: String,
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
    pub ca_file: PathBuf,
    /// Upper bound on the drain phase; `None` waits for every connection
    pub drain_timeout: Option<Duration>,
    /// Install SIGINT/SIGTERM handlers while serving
    pub handle_signals: bool,
    /// Report never-registered services as not found instead of UNKNOWN
    pub strict_health: bool,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            protocol: DEFAULT_PROTOCOL.to_string(),
            cert_file: PathBuf::from(DEFAULT_CERT_FILE),
            key_file: PathBuf::from(DEFAULT_KEY_FILE),
            ca_file: PathBuf::from(DEFAULT_CA_FILE),
            drain_timeout: None,
            handle_signals: true,
            strict_health: false,
        }
    }
}

impl ListenConfig {
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = protocol.into();
        self
    }

    pub fn with_cert_files(
        mut self,
        cert_file: impl AsRef<Path>,
        key_file: impl AsRef<Path>,
        ca_file: impl AsRef<Path>,
    ) -> Self {
        self.cert_file = cert_file.as_ref().to_path_buf();
        self.key_file = key_file.as_ref().to_path_buf();
        self.ca_file = ca_file.as_ref().to_path_buf();
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub fn with_signal_handling(mut self, enabled: bool) -> Self {
        self.handle_signals = enabled;
        self
    }

    pub fn with_strict_health(mut self, strict: bool) -> Self {
        self.strict_health = strict;
        self
    }
}
