//! Engine and channel configuration.
//!
//! Certificates and keys are carried inline as PEM strings. Timeouts are in
//! milliseconds.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub fn default_true() -> bool {
    true
}

pub fn default_handshake_timeout_ms() -> u64 {
    10_000
}

pub fn default_read_timeout_ms() -> u64 {
    30_000
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    Client,
    Server,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    /// TLS over a reliable byte stream.
    #[default]
    Stream,
    /// DTLS over datagrams.
    Datagram,
}

/// PEM-encoded certificate chain and private key.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct LocalCertificate {
    pub cert: String,
    pub key: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct EngineConfig {
    #[serde(default)]
    pub role: Role,
    #[serde(default)]
    pub mode: TransportMode,
    /// Host name for SNI and certificate name verification.
    #[serde(alias = "host", default)]
    pub peer_host: Option<String>,
    /// `sha-256 AA:BB:..` fingerprint the peer's leaf certificate must match.
    #[serde(alias = "fingerprint", default)]
    pub expected_peer_fingerprint: Option<String>,
    #[serde(default)]
    pub local_cert: Option<LocalCertificate>,
    /// Maximum record size on the wire. Required for datagram mode.
    #[serde(default)]
    pub mtu: Option<usize>,
    #[serde(alias = "verify", default = "default_true")]
    pub verify_peer: bool,
    /// Extra trust anchors, appended to the built-in root set.
    #[serde(default)]
    pub trusted_roots_pem: Option<String>,
    #[serde(alias = "alpn_protocol", default)]
    pub alpn_protocols: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            role: Role::Client,
            mode: TransportMode::Stream,
            peer_host: None,
            expected_peer_fingerprint: None,
            local_cert: None,
            mtu: None,
            verify_peer: true,
            trusted_roots_pem: None,
            alpn_protocols: vec![],
        }
    }
}

impl EngineConfig {
    /// Client verifying `host` against the trust store.
    pub fn client(host: impl Into<String>) -> Self {
        Self {
            peer_host: Some(host.into()),
            ..Default::default()
        }
    }

    pub fn server(cert_pem: impl Into<String>, key_pem: impl Into<String>) -> Self {
        Self {
            role: Role::Server,
            local_cert: Some(LocalCertificate {
                cert: cert_pem.into(),
                key: key_pem.into(),
            }),
            ..Default::default()
        }
    }

    pub fn with_expected_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.expected_peer_fingerprint = Some(fingerprint.into());
        self
    }

    pub fn with_local_cert(mut self, cert_pem: impl Into<String>, key_pem: impl Into<String>) -> Self {
        self.local_cert = Some(LocalCertificate {
            cert: cert_pem.into(),
            key: key_pem.into(),
        });
        self
    }

    pub fn with_trusted_roots(mut self, roots_pem: impl Into<String>) -> Self {
        self.trusted_roots_pem = Some(roots_pem.into());
        self
    }

    pub fn with_mtu(mut self, mtu: usize) -> Self {
        self.mtu = Some(mtu);
        self
    }

    pub fn with_mode(mut self, mode: TransportMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_verify_peer(mut self, verify_peer: bool) -> Self {
        self.verify_peer = verify_peer;
        self
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct ChannelConfig {
    #[serde(flatten)]
    pub engine: EngineConfig,
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            read_timeout_ms: default_read_timeout_ms(),
        }
    }
}

impl ChannelConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn from_yaml_str(yaml: &str) -> std::io::Result<Self> {
        serde_yaml::from_str::<ChannelConfig>(yaml).map_err(|e| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("Could not parse channel config YAML: {e}"),
            )
        })
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref();
        let config_str = std::fs::read_to_string(path).map_err(|e| {
            std::io::Error::new(
                e.kind(),
                format!("Could not read config file {}: {e}", path.display()),
            )
        })?;
        Self::from_yaml_str(&config_str)
    }
}
