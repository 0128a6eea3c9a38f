//! secure-transport - a blocking TLS record layer over byte-stream sockets.
//!
//! Two layers:
//!
//! - **TLS engine** ([`TlsEngine`]): one TLS session with a re-entrant
//!   handshake step function and buffer-to-buffer encrypt/decrypt. It never
//!   touches a socket. Engines come from a [`TlsProvider`]. The default one
//!   uses rustls (aws-lc-rs crypto backend) for stream sessions and, with the
//!   `tls-openssl` feature, OpenSSL for datagram (DTLS) sessions.
//! - **Secure channel** ([`SecureChannel`]): an engine driven over a
//!   [`Transport`]. It runs the handshake record by record off the wire,
//!   then exposes exact-size reads and single-call writes of plaintext.
//!
//! # Example
//!
//! ```no_run
//! use std::net::TcpStream;
//! use std::time::Duration;
//!
//! use secure_transport::{SecureChannel, TcpTransport};
//!
//! let stream = TcpStream::connect("example.com:443")?;
//! let transport = TcpTransport::new(stream)?;
//! let mut channel = SecureChannel::connect(transport, "example.com", Duration::from_secs(10))?;
//!
//! channel.write(b"GET / HTTP/1.0\r\nHost: example.com\r\n\r\n")?;
//! let mut status = [0u8; 12];
//! channel.read(&mut status, Duration::from_secs(10))?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod config;
pub mod error;
pub mod fingerprint;
pub mod grow_buffer;
pub mod memory_transport;
#[cfg(feature = "tls-openssl")]
pub mod openssl_engine;
pub mod rustls_engine;
pub mod secure_channel;
pub mod tcp_transport;
pub mod tls_engine;
pub mod tls_provider;
pub mod tls_record;
pub mod transport;

#[cfg(feature = "tls-openssl")]
mod openssl_util;
mod rustls_connection_util;
mod rustls_util;

#[cfg(test)]
mod test_util;

pub use config::{ChannelConfig, EngineConfig, LocalCertificate, Role, TransportMode};
pub use error::SecureError;
pub use memory_transport::{memory_pair, MemoryTransport};
#[cfg(feature = "tls-openssl")]
pub use openssl_engine::{OpensslEngine, OpensslProvider};
pub use rustls_engine::{RustlsEngine, RustlsProvider};
pub use secure_channel::SecureChannel;
pub use tcp_transport::TcpTransport;
pub use tls_engine::{create_engine, destroy_engine, HandshakeProgress, TlsEngine};
pub use tls_provider::{default_provider, DefaultProvider, TlsProvider};
pub use tls_record::{is_application_data_record, is_handshake_record};
pub use transport::Transport;
