//! In-memory duplex transport.
//!
//! `memory_pair()` returns two connected ends. Bytes written on one end are
//! read from the other. Dropping an end closes both directions: the peer's
//! reads drain what is buffered and then fail with `UnexpectedEof`, and its
//! writes fail with `BrokenPipe`.

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Buf, BytesMut};
use parking_lot::{Condvar, Mutex};

use crate::transport::Transport;

#[derive(Debug, Default)]
struct PipeState {
    buf: BytesMut,
    closed: bool,
}

#[derive(Debug, Default)]
struct Pipe {
    state: Mutex<PipeState>,
    readable: Condvar,
}

impl Pipe {
    fn close(&self) {
        self.state.lock().closed = true;
        self.readable.notify_all();
    }
}

#[derive(Debug)]
pub struct MemoryTransport {
    incoming: Arc<Pipe>,
    outgoing: Arc<Pipe>,
    max_read_chunk: usize,
    read_calls: Arc<AtomicUsize>,
}

pub fn memory_pair() -> (MemoryTransport, MemoryTransport) {
    let a_to_b = Arc::new(Pipe::default());
    let b_to_a = Arc::new(Pipe::default());
    (
        MemoryTransport::new(b_to_a.clone(), a_to_b.clone()),
        MemoryTransport::new(a_to_b, b_to_a),
    )
}

impl MemoryTransport {
    fn new(incoming: Arc<Pipe>, outgoing: Arc<Pipe>) -> Self {
        Self {
            incoming,
            outgoing,
            max_read_chunk: usize::MAX,
            read_calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Deliver at most `n` bytes per underlying read, so a large
    /// `read_exact` is satisfied in many small pieces.
    pub fn with_max_read_chunk(mut self, n: usize) -> Self {
        self.max_read_chunk = n.max(1);
        self
    }

    /// Number of underlying chunk reads performed so far.
    pub fn read_calls(&self) -> usize {
        self.read_calls.load(Ordering::Relaxed)
    }

    /// Shared handle to the read counter, usable after the transport has
    /// been moved into a channel.
    pub fn read_counter(&self) -> Arc<AtomicUsize> {
        self.read_calls.clone()
    }

    /// Bytes written by the peer and not yet read.
    pub fn buffered(&self) -> usize {
        self.incoming.state.lock().buf.len()
    }

    fn read_chunk(&self, dst: &mut [u8], timeout: Duration) -> io::Result<usize> {
        let deadline = Instant::now()
            .checked_add(timeout)
            .unwrap_or_else(|| Instant::now() + Duration::from_secs(86_400 * 365));
        let mut state = self.incoming.state.lock();
        loop {
            if !state.buf.is_empty() {
                let n = dst.len().min(state.buf.len()).min(self.max_read_chunk);
                dst[..n].copy_from_slice(&state.buf[..n]);
                state.buf.advance(n);
                self.read_calls.fetch_add(1, Ordering::Relaxed);
                return Ok(n);
            }
            if state.closed {
                return Ok(0);
            }
            if self
                .incoming
                .readable
                .wait_until(&mut state, deadline)
                .timed_out()
                && state.buf.is_empty()
                && !state.closed
            {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("no data within {timeout:?}"),
                ));
            }
        }
    }
}

impl Transport for MemoryTransport {
    fn read_exact(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.read_chunk(&mut buf[filled..], timeout)? {
                0 => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("pipe closed after {}/{} bytes", filled, buf.len()),
                    ));
                }
                n => filled += n,
            }
        }
        Ok(())
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        let mut state = self.outgoing.state.lock();
        if state.closed {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed"));
        }
        state.buf.extend_from_slice(buf);
        drop(state);
        self.outgoing.readable.notify_all();
        Ok(())
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.incoming.close();
        self.outgoing.close();
    }
}
