//! `TlsEngine` backed by OpenSSL, the engine for datagram (DTLS) sessions.
//!
//! The `SslStream` runs over [`MemoryBio`]: input handed to the engine is
//! queued for OpenSSL to read, and everything OpenSSL writes is collected
//! and passed back to the caller. In datagram mode every queued input is one
//! datagram and every OpenSSL write is one outbound datagram, so handshake
//! flights reach the write callback one datagram per call.
//!
//! Application data is split so that each record fits the configured MTU.

use std::collections::VecDeque;
use std::io::{self, Read, Write};

use openssl::ssl::{ErrorCode, SslStream};

use crate::config::{EngineConfig, TransportMode};
use crate::error::SecureError;
use crate::fingerprint::{certificate_fingerprint, fingerprint_matches, parse_fingerprint};
use crate::openssl_util::create_ssl;
use crate::tls_engine::{HandshakeProgress, HandshakeWriter, TlsEngine};
use crate::tls_provider::TlsProvider;
use crate::tls_record::{
    max_ciphertext_len, DTLS_RECORD_HEADER_SIZE, MAX_PLAINTEXT_FRAGMENT, TLS_RECORD_HEADER_SIZE,
};

/// Explicit nonce plus tag of the AES-GCM suites on offer.
const AEAD_RECORD_OVERHEAD: usize = 8 + 16;

#[derive(Debug, Default)]
pub struct OpensslProvider;

impl OpensslProvider {
    pub fn new() -> Self {
        Self
    }
}

impl TlsProvider for OpensslProvider {
    fn name(&self) -> &'static str {
        "openssl"
    }

    fn create_engine(&self, config: &EngineConfig) -> Result<Box<dyn TlsEngine>, SecureError> {
        Ok(Box::new(OpensslEngine::new(config)?))
    }
}

/// In-memory stand-in for a socket underneath `SslStream`.
#[derive(Debug)]
struct MemoryBio {
    datagram: bool,
    incoming: VecDeque<Vec<u8>>,
    outgoing: Vec<Vec<u8>>,
}

impl MemoryBio {
    fn new(mode: TransportMode) -> Self {
        Self {
            datagram: mode == TransportMode::Datagram,
            incoming: VecDeque::new(),
            outgoing: Vec::new(),
        }
    }

    fn push_incoming(&mut self, data: &[u8]) {
        if !data.is_empty() {
            self.incoming.push_back(data.to_vec());
        }
    }
}

impl Read for MemoryBio {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let Some(front) = self.incoming.front_mut() else {
            return Err(io::ErrorKind::WouldBlock.into());
        };

        let n = front.len().min(buf.len());
        buf[..n].copy_from_slice(&front[..n]);
        // A datagram is consumed whole, even by a short read.
        if self.datagram || n == front.len() {
            self.incoming.pop_front();
        } else {
            front.drain(..n);
        }
        Ok(n)
    }
}

impl Write for MemoryBio {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if !self.datagram {
            if let Some(last) = self.outgoing.last_mut() {
                last.extend_from_slice(buf);
                return Ok(buf.len());
            }
        }
        self.outgoing.push(buf.to_vec());
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub struct OpensslEngine {
    stream: SslStream<MemoryBio>,
    expected_peer_fingerprint: Option<String>,
    expected_digest: Option<Vec<u8>>,
    fragment_len: usize,
    handshake_complete: bool,
    handshake_steps: usize,
    failed: bool,
}

impl std::fmt::Debug for OpensslEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpensslEngine")
            .field("datagram", &self.stream.get_ref().datagram)
            .field("expected_peer_fingerprint", &self.expected_peer_fingerprint)
            .field("handshake_complete", &self.handshake_complete)
            .field("failed", &self.failed)
            .finish()
    }
}

impl OpensslEngine {
    pub fn new(config: &EngineConfig) -> Result<Self, SecureError> {
        let expected_digest = config
            .expected_peer_fingerprint
            .as_deref()
            .map(parse_fingerprint)
            .transpose()
            .map_err(|e| SecureError::EngineInit(e.to_string()))?;

        let ssl = create_ssl(config)?;
        let stream = SslStream::new(ssl, MemoryBio::new(config.mode))
            .map_err(|e| SecureError::EngineInit(format!("could not create session: {e}")))?;

        let header_len = match config.mode {
            TransportMode::Stream => TLS_RECORD_HEADER_SIZE,
            TransportMode::Datagram => DTLS_RECORD_HEADER_SIZE,
        };
        let fragment_len = config
            .mtu
            .map(|mtu| {
                mtu.saturating_sub(header_len + AEAD_RECORD_OVERHEAD)
                    .clamp(1, MAX_PLAINTEXT_FRAGMENT)
            })
            .unwrap_or(MAX_PLAINTEXT_FRAGMENT);

        Ok(Self {
            stream,
            expected_peer_fingerprint: config.expected_peer_fingerprint.clone(),
            expected_digest,
            fragment_len,
            handshake_complete: false,
            handshake_steps: 0,
            failed: false,
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

    /// Hand every queued outbound chunk to `write`. Returns the byte count.
    fn flush_to(&mut self, write: &mut HandshakeWriter<'_>) -> io::Result<usize> {
        let mut written = 0;
        for chunk in std::mem::take(&mut self.stream.get_mut().outgoing) {
            write(&chunk)?;
            written += chunk.len();
        }
        Ok(written)
    }

    fn peer_certificate_der(&self) -> Option<Vec<u8>> {
        self.stream
            .ssl()
            .peer_certificate()
            .and_then(|cert| cert.to_der().ok())
    }

    fn verify_peer_fingerprint(&self) -> Result<(), SecureError> {
        let Some(ref expected) = self.expected_digest else {
            return Ok(());
        };

        let der = self.peer_certificate_der().ok_or_else(|| {
            SecureError::Handshake(
                "peer presented no certificate to check against the pinned fingerprint"
                    .to_string(),
            )
        })?;

        if fingerprint_matches(expected, &der) {
            Ok(())
        } else {
            Err(SecureError::Handshake(format!(
                "peer fingerprint mismatch: expected {}, got {}",
                self.expected_peer_fingerprint.as_deref().unwrap_or_default(),
                certificate_fingerprint(&der)
            )))
        }
    }
}

impl TlsEngine for OpensslEngine {
    fn handshake(
        &mut self,
        input: Option<&[u8]>,
        write: &mut HandshakeWriter<'_>,
    ) -> Result<HandshakeProgress, SecureError> {
        self.ensure_usable(SecureError::Handshake)?;
        if self.handshake_complete {
            return Ok(HandshakeProgress::Complete);
        }
        self.handshake_steps += 1;

        let input_len = input.map_or(0, <[u8]>::len);
        if let Some(data) = input {
            self.stream.get_mut().push_incoming(data);
        }

        let finished = match self.stream.do_handshake() {
            Ok(()) => true,
            Err(e) if e.code() == ErrorCode::WANT_READ => false,
            Err(e) => {
                self.failed = true;
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
        };

        if finished {
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
            input_len,
            written,
            !finished
        );

        if !finished {
            return Ok(HandshakeProgress::Continue);
        }

        self.handshake_complete = true;
        log::debug!(
            "TLS handshake complete after {} steps ({})",
            self.handshake_steps,
            self.stream.ssl().version_str()
        );
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

        for chunk in plaintext.chunks(self.fragment_len) {
            let result = self.stream.ssl_write(chunk);
            match result {
                Ok(n) if n == chunk.len() => {}
                Ok(n) => {
                    return Err(self.fail(SecureError::Encrypt(format!(
                        "short write: {}/{} bytes",
                        n,
                        chunk.len()
                    ))));
                }
                Err(e) => return Err(self.fail(SecureError::Encrypt(e.to_string()))),
            }
        }

        let mut n = 0;
        for record in std::mem::take(&mut self.stream.get_mut().outgoing) {
            if n + record.len() > output.len() {
                return Err(self.fail(SecureError::Encrypt(format!(
                    "output buffer too small: need more than {}",
                    output.len()
                ))));
            }
            output[n..n + record.len()].copy_from_slice(&record);
            n += record.len();
        }

        log::trace!("Encrypted {} plaintext bytes into {} bytes", plaintext.len(), n);
        Ok(n)
    }

    /// In datagram mode `ciphertext` is one datagram. Records that fail
    /// authentication there are dropped, as DTLS does, and yield no output.
    fn decrypt(&mut self, ciphertext: &[u8], output: &mut [u8]) -> Result<usize, SecureError> {
        self.ensure_usable(SecureError::Decrypt)?;
        if !self.handshake_complete {
            return Err(SecureError::Decrypt("handshake not complete".to_string()));
        }
        self.stream.get_mut().push_incoming(ciphertext);

        let mut written = 0;
        while written < output.len() {
            match self.stream.ssl_read(&mut output[written..]) {
                Ok(n) => written += n,
                Err(e) if e.code() == ErrorCode::WANT_READ => break,
                Err(e) if e.code() == ErrorCode::ZERO_RETURN => {
                    log::debug!("TLS peer sent close_notify");
                    break;
                }
                Err(e) => return Err(self.fail(SecureError::Decrypt(e.to_string()))),
            }
        }

        let leftover = self.stream.ssl().pending();
        if leftover > 0 {
            return Err(self.fail(SecureError::Decrypt(format!(
                "output buffer too small: need {}, have {}",
                written + leftover,
                output.len()
            ))));
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
        self.peer_certificate_der()
            .map(|der| certificate_fingerprint(&der))
    }

    fn protocol_version(&self) -> Option<String> {
        self.handshake_complete
            .then(|| self.stream.ssl().version_str().to_string())
    }

    fn alpn_protocol(&self) -> Option<Vec<u8>> {
        self.stream.ssl().selected_alpn_protocol().map(<[u8]>::to_vec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Role;
    use crate::tls_engine::create_engine;
    use crate::test_util::{init_logging, TestCert};
    use crate::tls_record::{is_application_data_record, is_handshake_record};

    const MTU: usize = 512;

    fn chunk_sink(out: &mut Vec<Vec<u8>>) -> impl FnMut(&[u8]) -> io::Result<()> + '_ {
        move |datagram: &[u8]| {
            out.push(datagram.to_vec());
            Ok(())
        }
    }

    fn datagram_pair(cert: &TestCert) -> (Box<dyn TlsEngine>, Box<dyn TlsEngine>) {
        let provider = OpensslProvider::new();
        let client = create_engine(
            &provider,
            &cert
                .pinned_client_config()
                .with_mode(TransportMode::Datagram)
                .with_mtu(MTU),
        )
        .unwrap();
        let server = create_engine(
            &provider,
            &cert
                .server_config()
                .with_mode(TransportMode::Datagram)
                .with_mtu(MTU),
        )
        .unwrap();
        (client, server)
    }

    /// Run both handshakes, delivering one datagram per call. Every datagram
    /// must fit the MTU.
    fn complete_datagram_handshake(
        client: &mut dyn TlsEngine,
        server: &mut dyn TlsEngine,
        mtu: usize,
    ) -> Result<(), SecureError> {
        let mut to_server = Vec::new();
        let mut to_client = Vec::new();

        assert_eq!(
            client.handshake(None, &mut chunk_sink(&mut to_server))?,
            HandshakeProgress::Continue
        );
        // DTLS record header, whatever version the hello record advertises.
        assert!(is_handshake_record(&to_server[0]));
        assert_eq!(to_server[0][1], 0xfe);
        server.handshake(None, &mut chunk_sink(&mut to_client))?;
        assert!(to_client.is_empty());

        for _ in 0..20 {
            for datagram in std::mem::take(&mut to_server) {
                assert!(datagram.len() <= mtu, "{} > {}", datagram.len(), mtu);
                server.handshake(Some(&datagram), &mut chunk_sink(&mut to_client))?;
            }
            for datagram in std::mem::take(&mut to_client) {
                assert!(datagram.len() <= mtu, "{} > {}", datagram.len(), mtu);
                client.handshake(Some(&datagram), &mut chunk_sink(&mut to_server))?;
            }
            if client.is_handshake_complete() && server.is_handshake_complete() {
                return Ok(());
            }
        }
        panic!("handshake did not converge");
    }

    /// Split concatenated DTLS records at their header lengths.
    fn split_dtls_records(mut wire: &[u8]) -> Vec<&[u8]> {
        let mut records = Vec::new();
        while wire.len() >= DTLS_RECORD_HEADER_SIZE {
            let len = u16::from_be_bytes([wire[11], wire[12]]) as usize;
            let (record, rest) = wire.split_at(DTLS_RECORD_HEADER_SIZE + len);
            records.push(record);
            wire = rest;
        }
        assert!(wire.is_empty());
        records
    }

    fn datagram_roundtrip(
        sender: &mut dyn TlsEngine,
        receiver: &mut dyn TlsEngine,
        plaintext: &[u8],
    ) {
        let mut wire = vec![0u8; sender.max_encrypted_len(plaintext.len())];
        let n = sender.encrypt(plaintext, &mut wire).unwrap();

        let mut out = vec![0u8; plaintext.len()];
        let mut received = 0;
        for record in split_dtls_records(&wire[..n]) {
            assert!(record.len() <= MTU);
            assert!(is_application_data_record(record));
            received += receiver.decrypt(record, &mut out[received..]).unwrap();
        }
        assert_eq!(received, plaintext.len());
        assert_eq!(out, plaintext);
    }

    #[test]
    fn test_datagram_handshake_and_roundtrip() {
        init_logging();
        let cert = TestCert::generate("localhost");
        let (mut client, mut server) = datagram_pair(&cert);
        complete_datagram_handshake(client.as_mut(), server.as_mut(), MTU).unwrap();

        assert_eq!(client.protocol_version().as_deref(), Some("DTLSv1.2"));
        assert_eq!(client.peer_fingerprint(), Some(cert.fingerprint()));

        for size in [1usize, 100, 2000] {
            let plaintext: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
            datagram_roundtrip(client.as_mut(), server.as_mut(), &plaintext);
            datagram_roundtrip(server.as_mut(), client.as_mut(), &plaintext);
        }
    }

    #[test]
    fn test_datagram_large_write_is_split_to_mtu() {
        let cert = TestCert::generate("localhost");
        let (mut client, mut server) = datagram_pair(&cert);
        complete_datagram_handshake(client.as_mut(), server.as_mut(), MTU).unwrap();

        let plaintext = vec![7u8; 4000];
        let mut wire = vec![0u8; client.max_encrypted_len(plaintext.len())];
        let n = client.encrypt(&plaintext, &mut wire).unwrap();
        let records = split_dtls_records(&wire[..n]);
        assert!(records.len() >= 4000 / MTU);
        assert!(records.iter().all(|r| r.len() <= MTU));
    }

    #[test]
    fn test_datagram_server_pins_client_certificate() {
        let server_cert = TestCert::generate("localhost");
        let client_cert = TestCert::generate("client");
        let provider = OpensslProvider::new();

        let mut client = create_engine(
            &provider,
            &server_cert
                .pinned_client_config()
                .with_local_cert(client_cert.cert_pem.clone(), client_cert.key_pem.clone())
                .with_mode(TransportMode::Datagram)
                .with_mtu(1200),
        )
        .unwrap();
        let mut server = create_engine(
            &provider,
            &server_cert
                .server_config()
                .with_expected_fingerprint(client_cert.fingerprint())
                .with_mode(TransportMode::Datagram)
                .with_mtu(1200),
        )
        .unwrap();

        complete_datagram_handshake(client.as_mut(), server.as_mut(), 1200).unwrap();
        assert_eq!(server.peer_fingerprint(), Some(client_cert.fingerprint()));
    }

    #[test]
    fn test_datagram_fingerprint_mismatch_fails_handshake() {
        let cert = TestCert::generate("localhost");
        let other = TestCert::generate("localhost");
        let provider = OpensslProvider::new();

        let mut client = create_engine(
            &provider,
            &other
                .pinned_client_config()
                .with_mode(TransportMode::Datagram)
                .with_mtu(MTU),
        )
        .unwrap();
        let mut server = create_engine(
            &provider,
            &cert
                .server_config()
                .with_mode(TransportMode::Datagram)
                .with_mtu(MTU),
        )
        .unwrap();

        let err = complete_datagram_handshake(client.as_mut(), server.as_mut(), MTU)
            .err()
            .unwrap();
        assert!(err.is_handshake());
        assert!(err.to_string().contains("mismatch"));
        assert!(!client.is_handshake_complete());

        // Failed engines stay failed.
        let mut sink = Vec::new();
        assert!(client
            .handshake(None, &mut chunk_sink(&mut sink))
            .is_err());
    }

    #[test]
    fn test_datagram_tampered_record_is_dropped() {
        let cert = TestCert::generate("localhost");
        let (mut client, mut server) = datagram_pair(&cert);
        complete_datagram_handshake(client.as_mut(), server.as_mut(), MTU).unwrap();

        let mut wire = vec![0u8; client.max_encrypted_len(5)];
        let n = client.encrypt(b"hello", &mut wire).unwrap();
        wire[n - 1] ^= 0xff;
        let mut out = [0u8; 64];
        assert_eq!(server.decrypt(&wire[..n], &mut out).unwrap(), 0);

        // The session survives, unlike a stream session.
        datagram_roundtrip(client.as_mut(), server.as_mut(), b"still here");
    }

    #[test]
    fn test_decrypt_before_handshake_fails() {
        let cert = TestCert::generate("localhost");
        let (mut client, mut server) = datagram_pair(&cert);

        let mut flight = Vec::new();
        client
            .handshake(None, &mut chunk_sink(&mut flight))
            .unwrap();
        let mut out = [0u8; 256];
        let err = server.decrypt(&flight[0], &mut out).err().unwrap();
        assert!(err.to_string().contains("handshake not complete"));

        let err = client.encrypt(b"early", &mut out).err().unwrap();
        assert!(matches!(err, SecureError::Encrypt(_)));
    }

    #[test]
    fn test_stream_mode_interoperates_with_rustls() {
        use crate::rustls_engine::RustlsProvider;

        let cert = TestCert::generate("localhost");
        let mut client =
            create_engine(&OpensslProvider::new(), &cert.pinned_client_config()).unwrap();
        let mut server = create_engine(&RustlsProvider::new(), &cert.server_config()).unwrap();
        assert_eq!(
            client.expected_peer_fingerprint(),
            Some(cert.fingerprint().as_str())
        );

        let mut to_server = Vec::new();
        let mut to_client = Vec::new();
        client
            .handshake(None, &mut chunk_sink(&mut to_server))
            .unwrap();
        for _ in 0..10 {
            for chunk in std::mem::take(&mut to_server) {
                server
                    .handshake(Some(&chunk), &mut chunk_sink(&mut to_client))
                    .unwrap();
            }
            if client.is_handshake_complete() && server.is_handshake_complete() {
                break;
            }
            for chunk in std::mem::take(&mut to_client) {
                client
                    .handshake(Some(&chunk), &mut chunk_sink(&mut to_server))
                    .unwrap();
            }
        }
        assert!(client.is_handshake_complete() && server.is_handshake_complete());
        assert_eq!(client.protocol_version().as_deref(), Some("TLSv1.3"));

        let mut wire = vec![0u8; server.max_encrypted_len(5)];
        let n = server.encrypt(b"hello", &mut wire).unwrap();
        let mut out = [0u8; 5];
        // Session tickets may still be in flight ahead of the data.
        let mut received = 0;
        for chunk in std::mem::take(&mut to_client) {
            received += client.decrypt(&chunk, &mut out).unwrap();
        }
        received += client.decrypt(&wire[..n], &mut out[received..]).unwrap();
        assert_eq!(received, 5);
        assert_eq!(&out, b"hello");
    }

    #[test]
    fn test_provider_reports_name() {
        let provider = OpensslProvider::new();
        assert_eq!(provider.name(), "openssl");
        let config = EngineConfig {
            role: Role::Server,
            ..EngineConfig::default()
        };
        assert!(matches!(
            create_engine(&provider, &config).err(),
            Some(SecureError::EngineInit(_))
        ));
    }
}
