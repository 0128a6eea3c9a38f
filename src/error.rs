//! Error taxonomy for the engine and channel layers.
//!
//! Every variant is terminal for the connection it came from: there is no
//! safe way to resume a TLS session after a framing, crypto or transport
//! failure, so callers discard the channel and reconnect if they want to.

use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SecureError {
    /// The crypto provider could not be initialized or the engine
    /// configuration could not be honored.
    #[error("TLS engine initialization failed: {0}")]
    EngineInit(String),

    /// Protocol-level handshake failure, including a peer fingerprint
    /// mismatch after an otherwise successful handshake.
    #[error("TLS handshake failed: {0}")]
    Handshake(String),

    /// Malformed or truncated record header.
    #[error("malformed TLS record: {0}")]
    RecordFraming(String),

    #[error("TLS encrypt failed: {0}")]
    Encrypt(String),

    #[error("TLS decrypt failed: {0}")]
    Decrypt(String),

    /// Propagated from the socket transport (timeout, reset, EOF).
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),
}

impl SecureError {
    /// Returns true if the underlying transport gave up waiting for data.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            SecureError::Transport(e)
                if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock)
        )
    }

    pub fn is_handshake(&self) -> bool {
        matches!(self, SecureError::Handshake(_))
    }
}

impl From<SecureError> for io::Error {
    fn from(e: SecureError) -> Self {
        match e {
            SecureError::Transport(inner) => inner,
            SecureError::EngineInit(msg) => {
                io::Error::other(format!("TLS engine initialization failed: {msg}"))
            }
            other => io::Error::new(io::ErrorKind::InvalidData, other.to_string()),
        }
    }
}
