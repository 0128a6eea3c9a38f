//! `TlsEngine` backed by a buffered `rustls::Connection`.
//!
//! The connection never touches a socket. Handshake output is drained into
//! the caller's write callback, application records are written into and
//! read from caller buffers.

use std::io::{ErrorKind, Read, Write};

use rustls::pki_types::ServerName;

use crate::config::{EngineConfig, Role, TransportMode};
use crate::error::SecureError;
use crate::fingerprint::{certificate_fingerprint, fingerprint_matches, parse_fingerprint};
use crate::rustls_connection_util::{drain_rustls_connection, feed_rustls_connection};
use crate::rustls_util::{create_client_config, create_server_config};
use crate::tls_engine::{HandshakeProgress, HandshakeWriter, TlsEngine};
use crate::tls_provider::TlsProvider;
use crate::tls_record::{max_ciphertext_len, MAX_PLAINTEXT_FRAGMENT, TLS_RECORD_HEADER_SIZE};

#[derive(Debug, Default)]
pub struct RustlsProvider;

impl RustlsProvider {
    pub fn new() -> Self {
        Self
    }
}

impl TlsProvider for RustlsProvider {
    fn name(&self) -> &'static str {
        "rustls"
    }

    fn create_engine(&self, config: &EngineConfig) -> Result<Box<dyn TlsEngine>, SecureError> {
        Ok(Box::new(RustlsEngine::new(config)?))
    }
}

pub struct RustlsEngine {
    connection: rustls::Connection,
    expected_peer_fingerprint: Option<String>,
    expected_digest: Option<Vec<u8>>,
    fragment_len: usize,
    handshake_complete: bool,
    handshake_steps: usize,
    failed: bool,
    outgoing: Vec<u8>,
}

impl std::fmt::Debug for RustlsEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RustlsEngine")
            .field("expected_peer_fingerprint", &self.expected_peer_fingerprint)
            .field("handshake_complete", &self.handshake_complete)
            .field("failed", &self.failed)
            .finish()
    }
}

impl RustlsEngine {
    pub fn new(config: &EngineConfig) -> Result<Self, SecureError> {
        if config.mode == TransportMode::Datagram {
            return Err(SecureError::EngineInit(
                "rustls provider does not support datagram (DTLS) mode".to_string(),
            ));
        }

        let expected_digest = config
            .expected_peer_fingerprint
            .as_deref()
            .map(parse_fingerprint)
            .transpose()
            .map_err(|e| SecureError::EngineInit(e.to_string()))?;

        let connection = match config.role {
            Role::Client => {
                let server_name = client_server_name(config)?;
                let mut client_conn =
                    rustls::ClientConnection::new(create_client_config(config)?, server_name)
                        .map_err(|e| {
                            SecureError::EngineInit(format!("could not create client session: {e}"))
                        })?;
                client_conn.set_buffer_limit(None);
                rustls::Connection::Client(client_conn)
            }
            Role::Server => {
                let mut server_conn = rustls::ServerConnection::new(create_server_config(config)?)
                    .map_err(|e| {
                        SecureError::EngineInit(format!("could not create server session: {e}"))
                    })?;
                server_conn.set_buffer_limit(None);
                rustls::Connection::Server(server_conn)
            }
        };

        // rustls counts the record header against max_fragment_size.
        let fragment_len = config
            .mtu
            .map(|mtu| mtu.saturating_sub(TLS_RECORD_HEADER_SIZE))
            .unwrap_or(MAX_PLAINTEXT_FRAGMENT);

        Ok(Self {
            connection,
            expected_peer_fingerprint: config.expected_peer_fingerprint.clone(),
            expected_digest,
            fragment_len,
            handshake_complete: false,
            handshake_steps: 0,
            failed: false,
            outgoing: Vec::new(),
        })
    }

    fn ensure_usable(&self, make_err: fn(String) -> SecureError) -> Result<(), SecureError> {
        if self.failed {
            Err(make_err("engine is in a failed state".to_string()))
        } else {
            Ok(())
        }
    }

    fn fail(&mut self, err: SecureError) -> SecureError {
        self.failed = true;
        err
    }

    /// Drain queued TLS output into `write`. Returns the byte count.
    fn flush_to(&mut self, write: &mut HandshakeWriter<'_>) -> std::io::Result<usize> {
        self.outgoing.clear();
        let n = drain_rustls_connection(&mut self.connection, &mut self.outgoing)?;
        if n > 0 {
            write(&self.outgoing)?;
        }
        Ok(n)
    }

    fn verify_peer_fingerprint(&self) -> Result<(), SecureError> {
        let Some(ref expected) = self.expected_digest else {
            return Ok(());
        };

        let cert = self
            .connection
            .peer_certificates()
            .and_then(|certs| certs.first())
            .ok_or_else(|| {
                SecureError::Handshake(
                    "peer presented no certificate to check against the pinned fingerprint"
                        .to_string(),
                )
            })?;

        if fingerprint_matches(expected, cert.as_ref()) {
            Ok(())
        } else {
            Err(SecureError::Handshake(format!(
                "peer fingerprint mismatch: expected {}, got {}",
                self.expected_peer_fingerprint.as_deref().unwrap_or_default(),
                certificate_fingerprint(cert.as_ref())
            )))
        }
    }

    /// Copy buffered plaintext into `output`, returning the byte count.
    fn read_plaintext(&mut self, output: &mut [u8]) -> Result<usize, SecureError> {
        let mut written = 0;
        while written < output.len() {
            match self.connection.reader().read(&mut output[written..]) {
                // close_notify received
                Ok(0) => break,
                Ok(n) => written += n,
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => {
                    return Err(SecureError::Decrypt(format!(
                        "failed to read decrypted data: {e}"
                    )));
                }
            }
        }
        Ok(written)
    }
}

fn client_server_name(config: &EngineConfig) -> Result<ServerName<'static>, SecureError> {
    match config.peer_host {
        Some(ref host) => ServerName::try_from(host.clone())
            .map_err(|e| SecureError::EngineInit(format!("invalid peer host {host}: {e}"))),
        None if config.verify_peer && config.expected_peer_fingerprint.is_none() => {
            Err(SecureError::EngineInit(
                "certificate verification requires a peer host name".to_string(),
            ))
        }
        // Never sent on the wire: SNI is disabled without a host.
        None => ServerName::try_from("localhost")
            .map_err(|e| SecureError::EngineInit(format!("invalid placeholder host: {e}"))),
    }
}

impl TlsEngine for RustlsEngine {
    fn handshake(
        &mut self,
        input: Option<&[u8]>,
        write: &mut HandshakeWriter<'_>,
    ) -> Result<HandshakeProgress, SecureError> {
        self.ensure_usable(SecureError::Handshake)?;
        self.handshake_steps += 1;

        let data = input.unwrap_or_default();
        let mut offset = 0;
        loop {
            if offset < data.len() {
                offset += feed_rustls_connection(&mut self.connection, &data[offset..])
                    .map_err(|e| self.fail(SecureError::Handshake(e.to_string())))?;
            }

            if let Err(e) = self.connection.process_new_packets() {
                self.failed = true;
                // Best effort: let the peer see the alert.
                if let Err(write_err) = self.flush_to(write) {
                    log::debug!("Failed to send TLS alert: {write_err}");
                }
                log::error!(
                    "TLS handshake failed at step {}: {}",
                    self.handshake_steps,
                    e
                );
                return Err(SecureError::Handshake(e.to_string()));
            }

            if offset >= data.len() {
                break;
            }
        }

        let finished = !self.connection.is_handshaking();

        // Check the pin before our final flight goes out, so a rejected peer
        // never sees a completed handshake from this side.
        if finished && !self.handshake_complete {
            if let Err(e) = self.verify_peer_fingerprint() {
                log::error!("TLS handshake failed: {e}");
                return Err(self.fail(e));
            }
        }

        let written = self
            .flush_to(write)
            .map_err(|e| self.fail(SecureError::Transport(e)))?;

        log::debug!(
            "TLS handshake step {}: read {} bytes, wrote {} bytes, is_handshaking={}",
            self.handshake_steps,
            data.len(),
            written,
            !finished
        );

        if !finished {
            return Ok(HandshakeProgress::Continue);
        }

        if !self.handshake_complete {
            self.handshake_complete = true;
            log::debug!(
                "TLS handshake complete after {} steps ({:?})",
                self.handshake_steps,
                self.connection.protocol_version()
            );
        }
        Ok(HandshakeProgress::Complete)
    }

    fn encrypt(&mut self, plaintext: &[u8], output: &mut [u8]) -> Result<usize, SecureError> {
        self.ensure_usable(SecureError::Encrypt)?;
        if !self.handshake_complete {
            return Err(SecureError::Encrypt("handshake not complete".to_string()));
        }
        if plaintext.is_empty() {
            return Ok(0);
        }

        let required = self.max_encrypted_len(plaintext.len());
        if output.len() < required {
            return Err(SecureError::Encrypt(format!(
                "output buffer too small: need {}, have {}",
                required,
                output.len()
            )));
        }

        let result = self.connection.writer().write_all(plaintext);
        result.map_err(|e| self.fail(SecureError::Encrypt(e.to_string())))?;

        self.outgoing.clear();
        let n = drain_rustls_connection(&mut self.connection, &mut self.outgoing)
            .map_err(|e| self.fail(SecureError::Encrypt(e.to_string())))?;

        // Pending post-handshake messages can push past the estimate.
        if n > output.len() {
            return Err(self.fail(SecureError::Encrypt(format!(
                "output buffer too small: need {}, have {}",
                n,
                output.len()
            ))));
        }

        output[..n].copy_from_slice(&self.outgoing);
        log::trace!("Encrypted {} plaintext bytes into {} bytes", plaintext.len(), n);
        Ok(n)
    }

    fn decrypt(&mut self, ciphertext: &[u8], output: &mut [u8]) -> Result<usize, SecureError> {
        self.ensure_usable(SecureError::Decrypt)?;
        if !self.handshake_complete {
            return Err(SecureError::Decrypt("handshake not complete".to_string()));
        }

        let mut written = self.read_plaintext(output)?;
        let mut offset = 0;
        while offset < ciphertext.len() {
            offset += feed_rustls_connection(&mut self.connection, &ciphertext[offset..])
                .map_err(|e| self.fail(SecureError::Decrypt(e.to_string())))?;

            let state = self
                .connection
                .process_new_packets()
                .map_err(|e| self.fail(SecureError::Decrypt(e.to_string())))?;

            let available = state.plaintext_bytes_to_read();
            if available > output.len() - written {
                return Err(self.fail(SecureError::Decrypt(format!(
                    "output buffer too small: need {}, have {}",
                    written + available,
                    output.len()
                ))));
            }
            written += self.read_plaintext(&mut output[written..])?;

            if state.peer_has_closed() {
                log::debug!("TLS peer sent close_notify");
            }
        }

        log::trace!("Decrypted {} bytes into {} bytes", ciphertext.len(), written);
        Ok(written)
    }

    fn max_encrypted_len(&self, plaintext_len: usize) -> usize {
        max_ciphertext_len(plaintext_len, self.fragment_len)
    }

    fn is_handshake_complete(&self) -> bool {
        self.handshake_complete
    }

    fn expected_peer_fingerprint(&self) -> Option<&str> {
        self.expected_peer_fingerprint.as_deref()
    }

    fn peer_fingerprint(&self) -> Option<String> {
        self.connection
            .peer_certificates()
            .and_then(|certs| certs.first())
            .map(|cert| certificate_fingerprint(cert.as_ref()))
    }

    fn protocol_version(&self) -> Option<String> {
        self.connection
            .protocol_version()
            .map(|version| format!("{version:?}"))
    }

    fn alpn_protocol(&self) -> Option<Vec<u8>> {
        self.connection.alpn_protocol().map(|p| p.to_vec())
    }
}
