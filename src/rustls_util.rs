use std::sync::Arc;
use std::sync::OnceLock;

use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::CipherSuite;

use crate::config::{EngineConfig, LocalCertificate};
use crate::error::SecureError;

/// Suites the engine is willing to negotiate. AES-192-GCM has no TLS suite,
/// so 128 and 256 are the only sizes on offer.
const AES_GCM_SUITES: [CipherSuite; 6] = [
    CipherSuite::TLS13_AES_256_GCM_SHA384,
    CipherSuite::TLS13_AES_128_GCM_SHA256,
    CipherSuite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
    CipherSuite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
    CipherSuite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
    CipherSuite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
];

pub fn get_crypto_provider() -> Result<Arc<rustls::crypto::CryptoProvider>, SecureError> {
    static INSTANCE: OnceLock<Arc<rustls::crypto::CryptoProvider>> = OnceLock::new();
    let provider = INSTANCE
        .get_or_init(|| {
            let mut provider = rustls::crypto::aws_lc_rs::default_provider();
            provider
                .cipher_suites
                .retain(|suite| AES_GCM_SUITES.contains(&suite.suite()));
            Arc::new(provider)
        })
        .clone();

    if provider.cipher_suites.is_empty() {
        return Err(SecureError::EngineInit(
            "crypto provider offers no AES-GCM cipher suite".to_string(),
        ));
    }
    Ok(provider)
}

fn get_supported_algorithms() -> Result<rustls::crypto::WebPkiSupportedAlgorithms, SecureError> {
    Ok(get_crypto_provider()?.signature_verification_algorithms)
}

fn get_webpki_roots() -> &'static rustls::RootCertStore {
    static INSTANCE: OnceLock<rustls::RootCertStore> = OnceLock::new();
    INSTANCE.get_or_init(|| rustls::RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    })
}

/// Built-in roots plus any extra PEM trust anchors.
fn build_root_store(extra_roots_pem: Option<&str>) -> Result<Arc<rustls::RootCertStore>, SecureError> {
    let mut root_store = get_webpki_roots().clone();
    if let Some(pem) = extra_roots_pem {
        for cert in parse_certificates(pem)? {
            root_store.add(cert).map_err(|e| {
                SecureError::EngineInit(format!("could not add trusted root certificate: {e}"))
            })?;
        }
    }
    Ok(Arc::new(root_store))
}

pub fn parse_certificates(pem: &str) -> Result<Vec<CertificateDer<'static>>, SecureError> {
    let certs = CertificateDer::pem_slice_iter(pem.as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| SecureError::EngineInit(format!("invalid certificate PEM: {e}")))?;
    if certs.is_empty() {
        return Err(SecureError::EngineInit(
            "no certificate found in PEM data".to_string(),
        ));
    }
    Ok(certs)
}

fn parse_local_certificate(
    local: &LocalCertificate,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), SecureError> {
    let certs = parse_certificates(&local.cert)?;
    let key = PrivateKeyDer::from_pem_slice(local.key.as_bytes())
        .map_err(|e| SecureError::EngineInit(format!("invalid private key PEM: {e}")))?;
    Ok((certs, key))
}

fn alpn_bytes(alpn_protocols: &[String]) -> Vec<Vec<u8>> {
    alpn_protocols
        .iter()
        .map(|s| s.as_bytes().to_vec())
        .collect()
}

pub fn create_client_config(config: &EngineConfig) -> Result<Arc<rustls::ClientConfig>, SecureError> {
    let builder = rustls::ClientConfig::builder_with_provider(get_crypto_provider()?)
        .with_safe_default_protocol_versions()
        .map_err(|e| SecureError::EngineInit(format!("no usable protocol version: {e}")))?;

    let builder = if config.expected_peer_fingerprint.is_some() || !config.verify_peer {
        // Pinned peers are checked against the fingerprint once the handshake
        // completes; unpinned and unverified peers are not checked at all.
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(SignatureOnlyVerifier::new(false)?))
    } else {
        let webpki_verifier = rustls::client::WebPkiServerVerifier::builder_with_provider(
            build_root_store(config.trusted_roots_pem.as_deref())?,
            get_crypto_provider()?,
        )
        .build()
        .map_err(|e| SecureError::EngineInit(format!("could not build certificate verifier: {e}")))?;
        builder.with_webpki_verifier(webpki_verifier)
    };

    let mut client_config = match config.local_cert {
        Some(ref local) => {
            let (certs, key) = parse_local_certificate(local)?;
            builder.with_client_auth_cert(certs, key).map_err(|e| {
                SecureError::EngineInit(format!("could not use client certificate: {e}"))
            })?
        }
        None => builder.with_no_client_auth(),
    };

    client_config.alpn_protocols = alpn_bytes(&config.alpn_protocols);
    client_config.enable_sni = config.peer_host.is_some();
    client_config.max_fragment_size = config.mtu;

    Ok(Arc::new(client_config))
}

pub fn create_server_config(config: &EngineConfig) -> Result<Arc<rustls::ServerConfig>, SecureError> {
    let local = config.local_cert.as_ref().ok_or_else(|| {
        SecureError::EngineInit("server role requires a local certificate".to_string())
    })?;
    let (certs, key) = parse_local_certificate(local)?;

    let builder = rustls::ServerConfig::builder_with_provider(get_crypto_provider()?)
        .with_safe_default_protocol_versions()
        .map_err(|e| SecureError::EngineInit(format!("no usable protocol version: {e}")))?;

    let builder = if config.expected_peer_fingerprint.is_some() {
        builder.with_client_cert_verifier(Arc::new(SignatureOnlyVerifier::new(true)?))
    } else if let (true, Some(roots_pem)) = (config.verify_peer, config.trusted_roots_pem.as_deref()) {
        // Client certificates are only validated against explicitly
        // configured anchors, never the public web roots.
        let mut roots = rustls::RootCertStore::empty();
        for cert in parse_certificates(roots_pem)? {
            roots.add(cert).map_err(|e| {
                SecureError::EngineInit(format!("could not add trusted client root: {e}"))
            })?;
        }
        let verifier = rustls::server::WebPkiClientVerifier::builder_with_provider(
            Arc::new(roots),
            get_crypto_provider()?,
        )
        .build()
        .map_err(|e| SecureError::EngineInit(format!("could not build client verifier: {e}")))?;
        builder.with_client_cert_verifier(verifier)
    } else {
        builder.with_no_client_auth()
    };

    let mut server_config = builder
        .with_single_cert(certs, key)
        .map_err(|e| SecureError::EngineInit(format!("bad certificate/key: {e}")))?;

    server_config.alpn_protocols = alpn_bytes(&config.alpn_protocols);
    server_config.max_fragment_size = config.mtu;
    server_config.ignore_client_order = true;

    Ok(Arc::new(server_config))
}

/// Accepts any certificate chain but still checks that the peer holds the
/// key for the certificate it presented. Used for fingerprint pinning,
/// where the engine compares the leaf fingerprint after the handshake, and
/// for explicitly unverified connections.
#[derive(Debug)]
pub struct SignatureOnlyVerifier {
    supported_algs: rustls::crypto::WebPkiSupportedAlgorithms,
    require_client_cert: bool,
}

impl SignatureOnlyVerifier {
    pub fn new(require_client_cert: bool) -> Result<Self, SecureError> {
        Ok(Self {
            supported_algs: get_supported_algorithms()?,
            require_client_cert,
        })
    }
}

impl rustls::client::danger::ServerCertVerifier for SignatureOnlyVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.supported_algs)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.supported_algs)
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.supported_algs.supported_schemes()
    }
}

impl rustls::server::danger::ClientCertVerifier for SignatureOnlyVerifier {
    fn offer_client_auth(&self) -> bool {
        self.require_client_cert
    }

    fn client_auth_mandatory(&self) -> bool {
        self.require_client_cert
    }

    fn root_hint_subjects(&self) -> &[rustls::DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::server::danger::ClientCertVerified, rustls::Error> {
        Ok(rustls::server::danger::ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.supported_algs)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.supported_algs)
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.supported_algs.supported_schemes()
    }
}
