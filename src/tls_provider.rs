use std::fmt::Debug;
use std::sync::{Arc, OnceLock};

use crate::config::{EngineConfig, TransportMode};
use crate::error::SecureError;
#[cfg(feature = "tls-openssl")]
use crate::openssl_engine::OpensslProvider;
use crate::rustls_engine::RustlsProvider;
use crate::tls_engine::TlsEngine;

/// Builds engines for one TLS library.
pub trait TlsProvider: Debug + Send + Sync {
    fn name(&self) -> &'static str;

    fn create_engine(&self, config: &EngineConfig) -> Result<Box<dyn TlsEngine>, SecureError>;
}

/// Stream sessions go to rustls. Datagram sessions go to OpenSSL when the
/// `tls-openssl` feature is enabled, and are rejected by rustls otherwise.
#[derive(Debug, Default)]
pub struct DefaultProvider {
    stream: RustlsProvider,
    #[cfg(feature = "tls-openssl")]
    datagram: OpensslProvider,
}

impl DefaultProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn provider_for(&self, mode: TransportMode) -> &dyn TlsProvider {
        match mode {
            TransportMode::Stream => &self.stream,
            #[cfg(feature = "tls-openssl")]
            TransportMode::Datagram => &self.datagram,
            #[cfg(not(feature = "tls-openssl"))]
            TransportMode::Datagram => &self.stream,
        }
    }
}

impl TlsProvider for DefaultProvider {
    fn name(&self) -> &'static str {
        "default"
    }

    fn create_engine(&self, config: &EngineConfig) -> Result<Box<dyn TlsEngine>, SecureError> {
        let provider = self.provider_for(config.mode);
        log::trace!("Using {} provider for {:?} mode", provider.name(), config.mode);
        provider.create_engine(config)
    }
}

/// Process-wide provider, initialized on first use.
pub fn default_provider() -> Arc<dyn TlsProvider> {
    static INSTANCE: OnceLock<Arc<dyn TlsProvider>> = OnceLock::new();
    INSTANCE
        .get_or_init(|| Arc::new(DefaultProvider::new()))
        .clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_provider_is_shared() {
        let a = default_provider();
        let b = default_provider();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.name(), "default");
    }

    #[test]
    fn test_default_provider_routes_by_mode() {
        let provider = DefaultProvider::new();
        assert_eq!(provider.provider_for(TransportMode::Stream).name(), "rustls");
        #[cfg(feature = "tls-openssl")]
        assert_eq!(
            provider.provider_for(TransportMode::Datagram).name(),
            "openssl"
        );
    }

    #[cfg(feature = "tls-openssl")]
    #[test]
    fn test_default_provider_creates_datagram_engine() {
        let cert = crate::test_util::TestCert::generate("localhost");
        let config = cert
            .pinned_client_config()
            .with_mode(TransportMode::Datagram)
            .with_mtu(1200);
        let engine =
            crate::tls_engine::create_engine(default_provider().as_ref(), &config).unwrap();
        assert!(!engine.is_handshake_complete());
        assert_eq!(engine.expected_peer_fingerprint(), Some(cert.fingerprint().as_str()));
    }

    #[test]
    fn test_default_provider_across_threads() {
        let handles: Vec<_> = (0..4)
            .map(|_| std::thread::spawn(default_provider))
            .collect();
        let first = default_provider();
        for handle in handles {
            assert!(Arc::ptr_eq(&first, &handle.join().unwrap()));
        }
    }
}
