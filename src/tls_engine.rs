//! Socket-agnostic TLS engine interface.
//!
//! An engine owns one TLS session. The handshake is a re-entrant step
//! function fed one record at a time; afterwards `encrypt`/`decrypt` convert
//! between plaintext and wire records over caller-provided buffers.

use std::io;

use crate::config::EngineConfig;
use crate::error::SecureError;
use crate::tls_provider::TlsProvider;
use crate::tls_record::{max_ciphertext_len, MAX_PLAINTEXT_FRAGMENT};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeProgress {
    /// More peer input is needed.
    Continue,
    Complete,
}

/// Sink for outbound handshake bytes. Invoked synchronously, zero or more
/// times per `handshake` call.
pub type HandshakeWriter<'a> = dyn FnMut(&[u8]) -> io::Result<()> + 'a;

pub trait TlsEngine: Send + std::fmt::Debug {
    /// Advance the handshake.
    ///
    /// The first call passes `None` and emits the opening flight, if the
    /// role has one. Each later call feeds one or more received records.
    /// Everything the engine wants to send is passed to `write` before this
    /// returns. When an expected peer fingerprint is configured, a mismatch
    /// at completion is reported as `SecureError::Handshake`.
    fn handshake(
        &mut self,
        input: Option<&[u8]>,
        write: &mut HandshakeWriter<'_>,
    ) -> Result<HandshakeProgress, SecureError>;

    /// Encrypt `plaintext` into wire records in `output`, returning the
    /// number of bytes written. Empty plaintext writes nothing.
    fn encrypt(&mut self, plaintext: &[u8], output: &mut [u8]) -> Result<usize, SecureError>;

    /// Decrypt complete wire records from `ciphertext` into `output`.
    ///
    /// `Ok(0)` is a success: the input held only control records.
    fn decrypt(&mut self, ciphertext: &[u8], output: &mut [u8]) -> Result<usize, SecureError>;

    /// Output space `encrypt` needs for `plaintext_len` bytes.
    fn max_encrypted_len(&self, plaintext_len: usize) -> usize {
        max_ciphertext_len(plaintext_len, MAX_PLAINTEXT_FRAGMENT)
    }

    fn is_handshake_complete(&self) -> bool;

    fn expected_peer_fingerprint(&self) -> Option<&str>;

    /// Fingerprint of the peer's leaf certificate, once it has been received.
    fn peer_fingerprint(&self) -> Option<String>;

    /// Negotiated protocol version name, e.g. `TLSv1_3`.
    fn protocol_version(&self) -> Option<String> {
        None
    }

    fn alpn_protocol(&self) -> Option<Vec<u8>> {
        None
    }
}

pub fn create_engine(
    provider: &dyn TlsProvider,
    config: &EngineConfig,
) -> Result<Box<dyn TlsEngine>, SecureError> {
    log::debug!(
        "Creating {:?} {:?} TLS engine with provider {}",
        config.role,
        config.mode,
        provider.name()
    );
    provider.create_engine(config)
}

/// Drop the engine held in `slot`. Calling it again on the emptied slot does
/// nothing.
pub fn destroy_engine(slot: &mut Option<Box<dyn TlsEngine>>) {
    if slot.take().is_some() {
        log::trace!("TLS engine destroyed");
    }
}
