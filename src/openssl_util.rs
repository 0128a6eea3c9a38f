use openssl::error::ErrorStack;
use openssl::pkey::PKey;
use openssl::ssl::{AlpnError, Ssl, SslContextBuilder, SslMethod, SslOptions, SslVerifyMode};
use openssl::x509::X509;

use crate::config::{EngineConfig, LocalCertificate, Role, TransportMode};
use crate::error::SecureError;

/// TLS 1.2 and DTLS 1.2 suites. GCM needs 1.2, so older versions never
/// negotiate.
const AES_GCM_CIPHER_LIST: &str = "ECDHE-ECDSA-AES256-GCM-SHA384:\
ECDHE-ECDSA-AES128-GCM-SHA256:\
ECDHE-RSA-AES256-GCM-SHA384:\
ECDHE-RSA-AES128-GCM-SHA256";

const AES_GCM_TLS13_SUITES: &str = "TLS_AES_256_GCM_SHA384:TLS_AES_128_GCM_SHA256";

/// Smallest MTU OpenSSL will run a DTLS handshake with.
const MIN_DATAGRAM_MTU: usize = 256;

fn init_err(context: &str, e: ErrorStack) -> SecureError {
    SecureError::EngineInit(format!("{context}: {e}"))
}

/// Build a configured, role-bound `Ssl` for one session.
pub fn create_ssl(config: &EngineConfig) -> Result<Ssl, SecureError> {
    let method = match config.mode {
        TransportMode::Stream => SslMethod::tls(),
        TransportMode::Datagram => SslMethod::dtls(),
    };
    let mut builder =
        SslContextBuilder::new(method).map_err(|e| init_err("could not create SSL context", e))?;

    let mut options = SslOptions::NO_COMPRESSION | SslOptions::NO_TICKET;
    if config.mode == TransportMode::Datagram {
        // There is no socket to query: fragment to the configured MTU.
        options |= SslOptions::NO_QUERY_MTU | SslOptions::NO_SESSION_RESUMPTION_ON_RENEGOTIATION;
    }
    builder.set_options(options);

    builder
        .set_cipher_list(AES_GCM_CIPHER_LIST)
        .map_err(|e| init_err("no AES-GCM cipher suite available", e))?;
    if config.mode == TransportMode::Stream {
        builder
            .set_ciphersuites(AES_GCM_TLS13_SUITES)
            .map_err(|e| init_err("no AES-GCM TLS 1.3 cipher suite available", e))?;
    }

    match config.local_cert {
        Some(ref local) => set_local_certificate(&mut builder, local)?,
        None if config.role == Role::Server => {
            return Err(SecureError::EngineInit(
                "server engine requires a local certificate".to_string(),
            ));
        }
        None => {}
    }

    let pinned = config.expected_peer_fingerprint.is_some();
    match config.role {
        // Any chain is accepted here; the pin is checked when the handshake
        // completes.
        Role::Client if pinned => builder.set_verify_callback(SslVerifyMode::PEER, |_, _| true),
        Role::Server if pinned => builder.set_verify_callback(
            SslVerifyMode::PEER | SslVerifyMode::FAIL_IF_NO_PEER_CERT,
            |_, _| true,
        ),
        Role::Client if config.verify_peer => {
            builder
                .set_default_verify_paths()
                .map_err(|e| init_err("could not load default trust store", e))?;
            add_trusted_roots(&mut builder, config.trusted_roots_pem.as_deref())?;
            builder.set_verify(SslVerifyMode::PEER);
        }
        Role::Server if config.verify_peer && config.trusted_roots_pem.is_some() => {
            add_trusted_roots(&mut builder, config.trusted_roots_pem.as_deref())?;
            builder.set_verify(SslVerifyMode::PEER | SslVerifyMode::FAIL_IF_NO_PEER_CERT);
        }
        _ => builder.set_verify(SslVerifyMode::NONE),
    }

    if !config.alpn_protocols.is_empty() {
        let supported = alpn_bytes(&config.alpn_protocols)?;
        match config.role {
            Role::Client => {
                let wire: Vec<u8> = supported
                    .iter()
                    .flat_map(|p| std::iter::once(p.len() as u8).chain(p.iter().copied()))
                    .collect();
                builder
                    .set_alpn_protos(&wire)
                    .map_err(|e| init_err("could not set ALPN protocols", e))?;
            }
            Role::Server => builder.set_alpn_select_callback(move |_, offered| {
                select_alpn(&supported, offered).ok_or(AlpnError::NOACK)
            }),
        }
    }

    let context = builder.build();
    let mut ssl = Ssl::new(&context).map_err(|e| init_err("could not create session", e))?;

    match config.role {
        Role::Client => {
            ssl.set_connect_state();
            match config.peer_host {
                Some(ref host) => {
                    ssl.set_hostname(host)
                        .map_err(|e| init_err("could not set SNI host name", e))?;
                    if config.verify_peer && !pinned {
                        ssl.param_mut()
                            .set_host(host)
                            .map_err(|e| init_err("could not set verified host name", e))?;
                    }
                }
                None if config.verify_peer && !pinned => {
                    return Err(SecureError::EngineInit(
                        "certificate verification requires a peer host name".to_string(),
                    ));
                }
                None => {}
            }
        }
        Role::Server => ssl.set_accept_state(),
    }

    if config.mode == TransportMode::Datagram {
        let mtu = config.mtu.ok_or_else(|| {
            SecureError::EngineInit("datagram mode requires an mtu".to_string())
        })?;
        if mtu < MIN_DATAGRAM_MTU {
            return Err(SecureError::EngineInit(format!(
                "mtu {mtu} is below the DTLS minimum of {MIN_DATAGRAM_MTU}"
            )));
        }
        let mtu_u32 = u32::try_from(mtu)
            .map_err(|_| SecureError::EngineInit(format!("mtu {mtu} is out of range")))?;
        ssl.set_mtu(mtu_u32)
            .map_err(|e| init_err(&format!("mtu {mtu} rejected"), e))?;
    }

    Ok(ssl)
}

fn set_local_certificate(
    builder: &mut SslContextBuilder,
    local: &LocalCertificate,
) -> Result<(), SecureError> {
    let mut chain = X509::stack_from_pem(local.cert.as_bytes())
        .map_err(|e| init_err("invalid certificate PEM", e))?
        .into_iter();
    let leaf = chain.next().ok_or_else(|| {
        SecureError::EngineInit("no certificate found in PEM data".to_string())
    })?;
    let key = PKey::private_key_from_pem(local.key.as_bytes())
        .map_err(|e| init_err("invalid private key PEM", e))?;

    builder
        .set_certificate(&leaf)
        .map_err(|e| init_err("could not use certificate", e))?;
    for cert in chain {
        builder
            .add_extra_chain_cert(cert)
            .map_err(|e| init_err("could not add chain certificate", e))?;
    }
    builder
        .set_private_key(&key)
        .map_err(|e| init_err("could not use private key", e))?;
    builder
        .check_private_key()
        .map_err(|e| init_err("private key does not match certificate", e))
}

fn add_trusted_roots(
    builder: &mut SslContextBuilder,
    roots_pem: Option<&str>,
) -> Result<(), SecureError> {
    let Some(pem) = roots_pem else {
        return Ok(());
    };
    let certs =
        X509::stack_from_pem(pem.as_bytes()).map_err(|e| init_err("invalid certificate PEM", e))?;
    if certs.is_empty() {
        return Err(SecureError::EngineInit(
            "no certificate found in PEM data".to_string(),
        ));
    }
    for cert in certs {
        builder
            .cert_store_mut()
            .add_cert(cert)
            .map_err(|e| init_err("could not add trusted root certificate", e))?;
    }
    Ok(())
}

fn alpn_bytes(alpn_protocols: &[String]) -> Result<Vec<Vec<u8>>, SecureError> {
    alpn_protocols
        .iter()
        .map(|p| {
            if p.is_empty() || p.len() > u8::MAX as usize {
                Err(SecureError::EngineInit(format!(
                    "invalid ALPN protocol name length: {p:?}"
                )))
            } else {
                Ok(p.as_bytes().to_vec())
            }
        })
        .collect()
}

/// First of our protocols, in our order, that the peer also offered.
/// `offered` is in ALPN wire format.
fn select_alpn<'a>(supported: &[Vec<u8>], offered: &'a [u8]) -> Option<&'a [u8]> {
    let mut offered_protocols = Vec::new();
    let mut rest = offered;
    while let Some((&len, tail)) = rest.split_first() {
        let len = len as usize;
        if tail.len() < len {
            return None;
        }
        let (protocol, tail) = tail.split_at(len);
        offered_protocols.push(protocol);
        rest = tail;
    }

    supported.iter().find_map(|want| {
        offered_protocols
            .iter()
            .copied()
            .find(|protocol| *protocol == want.as_slice())
    })
}
