//! Secure channel: a TLS engine driven over a blocking byte-stream transport.
//!
//! The handshake is run record by record off the wire. Afterwards `write`
//! encrypts and sends in one transport call, and `read` returns exactly the
//! requested number of plaintext bytes, keeping any surplus from a decrypted
//! record in a FIFO pending buffer for the next call.

use std::time::Duration;

use crate::config::{ChannelConfig, EngineConfig, Role, TransportMode};
use crate::error::SecureError;
use crate::grow_buffer::GrowBuffer;
use crate::tls_engine::{create_engine, HandshakeProgress, TlsEngine};
use crate::tls_provider::{default_provider, TlsProvider};
use crate::tls_record::{RecordHeader, MAX_PLAINTEXT_FRAGMENT, TLS_RECORD_HEADER_SIZE};
use crate::transport::Transport;

/// Slack added on top of the engine's ciphertext estimate for writes, and
/// on top of the record size for decrypt output.
pub const SECURE_PADDING: usize = 1024;

/// A TLS 1.3 handshake with client auth takes well under a dozen records.
const MAX_HANDSHAKE_RECORDS: usize = 100;

const INITIAL_RAW_BUFFER_SIZE: usize = TLS_RECORD_HEADER_SIZE + MAX_PLAINTEXT_FRAGMENT;

pub struct SecureChannel<T: Transport> {
    transport: T,
    engine: Box<dyn TlsEngine>,
    /// Most recently read wire record, header included.
    raw: GrowBuffer,
    /// Engine output: ciphertext on write, plaintext on read.
    scratch: GrowBuffer,
    /// Decrypted bytes not yet returned by `read`.
    pending: GrowBuffer,
}

impl<T: Transport> std::fmt::Debug for SecureChannel<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureChannel")
            .field("handshake_complete", &self.engine.is_handshake_complete())
            .field("pending_len", &self.pending.len())
            .field("raw_capacity", &self.raw.capacity())
            .finish()
    }
}

/// Read one complete record into `raw`, returning its total length.
///
/// The header's length is authoritative: the full payload is read before
/// anything is handed to the engine.
fn read_record<T: Transport>(
    transport: &mut T,
    raw: &mut GrowBuffer,
    timeout: Duration,
) -> Result<usize, SecureError> {
    transport.read_exact(raw.reset_to(TLS_RECORD_HEADER_SIZE), timeout)?;

    let header = RecordHeader::parse(raw.as_slice()).map_err(|e| {
        log::error!("Dropping connection: {e}");
        e
    })?;
    log::trace!(
        "TLS record header: type=0x{:02x} version=0x{:04x} length={}",
        header.content_type,
        header.version,
        header.payload_len
    );

    let payload_len = header.payload_len as usize;
    raw.ensure_capacity(header.record_len());
    transport.read_exact(&mut raw.write_slice()[..payload_len], timeout)?;
    raw.advance_write(payload_len);

    Ok(header.record_len())
}

impl<T: Transport> SecureChannel<T> {
    /// Connect as a client to `host`, verifying its certificate against the
    /// built-in trust store.
    pub fn connect(transport: T, host: &str, timeout: Duration) -> Result<Self, SecureError> {
        Self::connect_with(
            transport,
            default_provider().as_ref(),
            &EngineConfig::client(host),
            timeout,
        )
    }

    pub fn connect_with(
        transport: T,
        provider: &dyn TlsProvider,
        config: &EngineConfig,
        timeout: Duration,
    ) -> Result<Self, SecureError> {
        if config.role != Role::Client {
            return Err(SecureError::EngineInit(
                "connect requires a client engine configuration".to_string(),
            ));
        }
        Self::establish(transport, provider, config, timeout)
    }

    pub fn accept_with(
        transport: T,
        provider: &dyn TlsProvider,
        config: &EngineConfig,
        timeout: Duration,
    ) -> Result<Self, SecureError> {
        if config.role != Role::Server {
            return Err(SecureError::EngineInit(
                "accept requires a server engine configuration".to_string(),
            ));
        }
        Self::establish(transport, provider, config, timeout)
    }

    /// Connect or accept, depending on the configured role, with the default
    /// provider and the configured handshake timeout.
    pub fn connect_config(transport: T, config: &ChannelConfig) -> Result<Self, SecureError> {
        Self::establish(
            transport,
            default_provider().as_ref(),
            &config.engine,
            config.handshake_timeout(),
        )
    }

    fn establish(
        transport: T,
        provider: &dyn TlsProvider,
        config: &EngineConfig,
        timeout: Duration,
    ) -> Result<Self, SecureError> {
        // Records are framed off a byte stream; DTLS engines are driven
        // datagram by datagram by their owner instead.
        if config.mode != TransportMode::Stream {
            return Err(SecureError::EngineInit(
                "secure channel requires a stream-mode engine configuration".to_string(),
            ));
        }
        let engine = create_engine(provider, config)?;
        let mut channel = Self {
            transport,
            engine,
            raw: GrowBuffer::new(INITIAL_RAW_BUFFER_SIZE),
            scratch: GrowBuffer::new(INITIAL_RAW_BUFFER_SIZE + SECURE_PADDING),
            pending: GrowBuffer::new(0),
        };

        if let Err(e) = channel.handshake(timeout) {
            log::debug!("TLS {:?} handshake failed: {}", config.role, e);
            return Err(e);
        }
        Ok(channel)
    }

    fn handshake(&mut self, timeout: Duration) -> Result<(), SecureError> {
        let Self {
            transport,
            engine,
            raw,
            ..
        } = self;

        match engine.handshake(None, &mut |bytes: &[u8]| transport.write_all(bytes))? {
            HandshakeProgress::Continue => {}
            HandshakeProgress::Complete => {
                return Err(SecureError::Handshake(
                    "handshake completed before any peer input".to_string(),
                ));
            }
        }

        for record in 1..=MAX_HANDSHAKE_RECORDS {
            let record_len = read_record(transport, raw, timeout)?;
            log::debug!("TLS handshake record {record}: {record_len} bytes");

            let progress =
                engine.handshake(Some(raw.as_slice()), &mut |bytes: &[u8]| {
                    transport.write_all(bytes)
                })?;
            if progress == HandshakeProgress::Complete {
                log::debug!("TLS handshake complete after {record} records");
                return Ok(());
            }
        }

        log::error!("TLS handshake exceeded {MAX_HANDSHAKE_RECORDS} records");
        Err(SecureError::Handshake(format!(
            "handshake did not complete within {MAX_HANDSHAKE_RECORDS} records"
        )))
    }

    /// Encrypt `data` and send it. Nothing is written if encryption fails.
    pub fn write(&mut self, data: &[u8]) -> Result<(), SecureError> {
        let needed = self.engine.max_encrypted_len(data.len()) + SECURE_PADDING;
        self.scratch.clear();
        self.scratch.ensure_capacity(needed);

        let n = self.engine.encrypt(data, self.scratch.write_slice())?;
        self.scratch.advance_write(n);

        log::trace!("Writing {} bytes as {} bytes of records", data.len(), n);
        self.transport.write_all(self.scratch.as_slice())?;
        Ok(())
    }

    /// Fill `buf` completely with decrypted data.
    ///
    /// Blocks until enough records have arrived; `timeout` bounds each wait
    /// for transport data. Never returns a short read: on failure, bytes
    /// already decrypted stay pending.
    pub fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<(), SecureError> {
        while self.pending.len() < buf.len() {
            let record_len = read_record(&mut self.transport, &mut self.raw, timeout)?;

            self.scratch.clear();
            self.scratch
                .ensure_capacity(record_len.max(MAX_PLAINTEXT_FRAGMENT) + SECURE_PADDING);
            let n = self
                .engine
                .decrypt(self.raw.as_slice(), self.scratch.write_slice())
                .map_err(|e| {
                    log::error!("Dropping connection: {e}");
                    e
                })?;
            self.scratch.advance_write(n);

            log::trace!(
                "Decrypted {} byte record into {} bytes, {} pending",
                record_len,
                n,
                self.pending.len() + n
            );
            self.pending.extend_from_slice(self.scratch.as_slice());
        }

        self.pending.take_front(buf);
        Ok(())
    }

    /// Decrypted bytes waiting to be read.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn engine(&self) -> &dyn TlsEngine {
        self.engine.as_ref()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Drop the session and hand back the transport, still open.
    pub fn into_transport(self) -> T {
        self.transport
    }

    /// Drop the channel held in `slot`. The transport is not shut down by
    /// the channel itself. Calling it again on the emptied slot does nothing.
    pub fn destroy(slot: &mut Option<Self>) {
        if let Some(channel) = slot.take() {
            log::trace!("Destroying secure channel with {} pending bytes", channel.pending_len());
        }
    }
}
