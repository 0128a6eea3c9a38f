//! Throwaway certificates for tests.

use crate::config::EngineConfig;
use crate::fingerprint::certificate_fingerprint;

pub struct TestCert {
    pub cert_pem: String,
    pub key_pem: String,
    pub cert_der: Vec<u8>,
}

impl TestCert {
    pub fn generate(host: &str) -> Self {
        let certified = rcgen::generate_simple_self_signed(vec![host.to_string()]).unwrap();
        Self {
            cert_pem: certified.cert.pem(),
            key_pem: certified.key_pair.serialize_pem(),
            cert_der: certified.cert.der().to_vec(),
        }
    }

    pub fn fingerprint(&self) -> String {
        certificate_fingerprint(&self.cert_der)
    }

    pub fn server_config(&self) -> EngineConfig {
        EngineConfig::server(self.cert_pem.clone(), self.key_pem.clone())
    }

    /// Client that pins this certificate instead of checking a trust store.
    pub fn pinned_client_config(&self) -> EngineConfig {
        EngineConfig::default().with_expected_fingerprint(self.fingerprint())
    }
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}
