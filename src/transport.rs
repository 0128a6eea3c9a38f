//! Blocking byte-stream transport consumed by the secure channel.

use std::io;
use std::time::Duration;

/// A connected, blocking byte stream.
///
/// Both operations are all-or-nothing: they either move exactly `buf.len()`
/// bytes or fail. The channel never closes a transport; shutting one down
/// from another thread is how a blocked read is cancelled.
pub trait Transport: Send {
    /// Fill `buf` completely. `timeout` bounds each wait for more data, so
    /// a peer that keeps dribbling bytes never times out.
    fn read_exact(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<()>;

    /// Send all of `buf`, retrying short writes.
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()>;
}

impl<T: Transport + ?Sized> Transport for &mut T {
    #[inline]
    fn read_exact(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<()> {
        (**self).read_exact(buf, timeout)
    }

    #[inline]
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        (**self).write_all(buf)
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    #[inline]
    fn read_exact(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<()> {
        (**self).read_exact(buf, timeout)
    }

    #[inline]
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        (**self).write_all(buf)
    }
}
