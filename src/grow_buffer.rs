//! Growable byte buffer for record and pending-plaintext storage.
//!
//! Storage is a zero-filled allocation whose capacity only ever grows, plus an
//! explicit count of valid bytes at the front. Consumption from the front
//! shifts the remaining bytes down with `copy_within()`, so the valid region
//! is always `[0, len)` and can be handed to decrypt/encrypt as one
//! contiguous slice.

/// Owned byte buffer with monotonic capacity and explicit length tracking.
///
/// # Example
/// ```
/// use secure_transport::grow_buffer::GrowBuffer;
///
/// let mut buf = GrowBuffer::new(4);
/// buf.extend_from_slice(b"hello");
/// assert!(buf.capacity() >= 5);
///
/// let mut out = [0u8; 2];
/// buf.take_front(&mut out);
/// assert_eq!(&out, b"he");
/// assert_eq!(buf.as_slice(), b"llo");
/// ```
#[derive(Debug, Default)]
pub struct GrowBuffer {
    /// Backing storage, always fully initialized; its length is the capacity.
    data: Vec<u8>,
    /// Number of valid bytes at the front of `data`.
    len: usize,
}

impl GrowBuffer {
    #[inline]
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity],
            len: 0,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Grow storage to at least `capacity` bytes. Never shrinks.
    ///
    /// Valid bytes are preserved. Slices handed out earlier cannot outlive
    /// this call, so there is no aliasing across the reallocation.
    #[inline]
    pub fn ensure_capacity(&mut self, capacity: usize) {
        if capacity > self.data.len() {
            self.data.resize(capacity, 0);
        }
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// Writable region after the valid bytes. Call `advance_write(n)` after
    /// filling a prefix of it.
    #[inline]
    pub fn write_slice(&mut self) -> &mut [u8] {
        &mut self.data[self.len..]
    }

    #[inline]
    pub fn advance_write(&mut self, n: usize) {
        debug_assert!(
            self.len + n <= self.data.len(),
            "GrowBuffer advance_write overflow: len={}, n={}, capacity={}",
            self.len,
            n,
            self.data.len()
        );
        self.len += n;
    }

    /// Append bytes, growing to exactly `len + data.len()` when short.
    #[inline]
    pub fn extend_from_slice(&mut self, data: &[u8]) {
        let end = self.len + data.len();
        self.ensure_capacity(end);
        self.data[self.len..end].copy_from_slice(data);
        self.len = end;
    }

    /// Discard the contents and expose exactly `n` bytes of storage to be
    /// filled by the caller. The buffer's length becomes `n`.
    #[inline]
    pub fn reset_to(&mut self, n: usize) -> &mut [u8] {
        self.ensure_capacity(n);
        self.len = n;
        &mut self.data[..n]
    }

    /// Move the first `dst.len()` bytes into `dst` and shift the remainder
    /// to the front.
    ///
    /// # Panics
    /// Panics if fewer than `dst.len()` bytes are buffered.
    #[inline]
    pub fn take_front(&mut self, dst: &mut [u8]) {
        let n = dst.len();
        assert!(
            n <= self.len,
            "GrowBuffer take_front underflow: n={}, len={}",
            n,
            self.len
        );
        dst.copy_from_slice(&self.data[..n]);
        self.data.copy_within(n..self.len, 0);
        self.len -= n;
    }

    #[inline]
    pub fn clear(&mut self) {
        self.len = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_new_buffer() {
        let buf = GrowBuffer::new(1024);
        assert_eq!(buf.len(), 0);
        assert!(buf.is_empty());
        assert_eq!(buf.capacity(), 1024);
    }

    #[test]
    fn test_extend_grows_capacity() {
        let mut buf = GrowBuffer::new(4);
        buf.extend_from_slice(b"hello world");
        assert_eq!(buf.len(), 11);
        assert_eq!(buf.capacity(), 11);
        assert_eq!(buf.as_slice(), b"hello world");
    }

    #[test]
    fn test_capacity_never_shrinks() {
        let mut buf = GrowBuffer::new(0);
        buf.ensure_capacity(4096);
        buf.ensure_capacity(16);
        assert_eq!(buf.capacity(), 4096);

        buf.extend_from_slice(b"abc");
        buf.clear();
        assert_eq!(buf.capacity(), 4096);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_take_front_shifts_remainder() {
        let mut buf = GrowBuffer::new(16);
        buf.extend_from_slice(b"hello world");

        let mut out = [0u8; 6];
        buf.take_front(&mut out);
        assert_eq!(&out, b"hello ");
        assert_eq!(buf.as_slice(), b"world");
        assert_eq!(buf.len(), 5);
    }

    #[test]
    fn test_take_front_everything() {
        let mut buf = GrowBuffer::new(8);
        buf.extend_from_slice(b"abcd");
        let mut out = [0u8; 4];
        buf.take_front(&mut out);
        assert_eq!(&out, b"abcd");
        assert!(buf.is_empty());
    }

    #[test]
    #[should_panic(expected = "underflow")]
    fn test_take_front_underflow_panics() {
        let mut buf = GrowBuffer::new(8);
        buf.extend_from_slice(b"ab");
        let mut out = [0u8; 3];
        buf.take_front(&mut out);
    }

    #[test]
    fn test_reset_to_exposes_exact_window() {
        let mut buf = GrowBuffer::new(2);
        buf.extend_from_slice(b"xy");

        let window = buf.reset_to(5);
        assert_eq!(window.len(), 5);
        window.copy_from_slice(b"12345");
        assert_eq!(buf.as_slice(), b"12345");
        assert_eq!(buf.capacity(), 5);
    }

    #[test]
    fn test_write_slice_and_advance() {
        let mut buf = GrowBuffer::new(16);
        buf.extend_from_slice(b"ab");
        buf.write_slice()[..3].copy_from_slice(b"cde");
        buf.advance_write(3);
        assert_eq!(buf.as_slice(), b"abcde");
    }

    proptest! {
        // Bytes come back in the order they were appended no matter how the
        // append boundaries line up with the take boundaries.
        #[test]
        fn prop_fifo_across_chunk_boundaries(
            chunks in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..64), 0..16),
            cuts in prop::collection::vec(1usize..48, 0..32),
        ) {
            let expected: Vec<u8> = chunks.concat();
            let mut buf = GrowBuffer::new(0);
            for chunk in &chunks {
                buf.extend_from_slice(chunk);
                prop_assert!(buf.len() <= buf.capacity());
            }

            let mut out = Vec::new();
            let mut cuts = cuts.into_iter();
            while !buf.is_empty() {
                let n = cuts.next().unwrap_or(usize::MAX).min(buf.len());
                let mut piece = vec![0u8; n];
                buf.take_front(&mut piece);
                out.extend_from_slice(&piece);
            }
            prop_assert_eq!(out, expected);
        }
    }
}
