use std::ops::Deref;

/// Growable byte buffer with cheap front consumption.
///
/// Connections use one for inbound bytes (the parser consumes from the
/// front) and one for outbound bytes (the flush path consumes what the
/// socket accepted). Consumption advances a start cursor; the storage is
/// compacted lazily so hot paths never memmove per call.
#[derive(Default, Debug)]
pub struct ByteBuf {
    data: Vec<u8>,
    start: usize,
}

impl ByteBuf {
    pub fn new() -> ByteBuf {
        ByteBuf::default()
    }

    pub fn len(&self) -> usize {
        self.data.len() - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.data.len()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data[self.start..]
    }

    pub fn extend_from_slice(&mut self, bytes: &[u8]) {
        self.maybe_compact();
        self.data.extend_from_slice(bytes);
    }

    /// Append `extra` uninitialized-capacity room and hand out the writable
    /// tail. The caller commits written bytes with [`ByteBuf::grow`].
    pub fn spare_capacity(&mut self, extra: usize) -> &mut [u8] {
        self.maybe_compact();
        let len = self.data.len();
        self.data.resize(len + extra, 0);
        &mut self.data[len..]
    }

    /// Shrink the logical end back after a partial fill of
    /// [`ByteBuf::spare_capacity`].
    pub fn truncate_back(&mut self, unused: usize) {
        let len = self.data.len();
        self.data.truncate(len - unused);
    }

    /// Drop `n` bytes from the front.
    pub fn consume(&mut self, n: usize) {
        debug_assert!(n <= self.len());
        self.start += n;
        if self.start == self.data.len() {
            self.data.clear();
            self.start = 0;
        }
    }

    pub fn clear(&mut self) {
        self.data.clear();
        self.start = 0;
    }

    /// Release memory if the allocation grew far beyond what is currently
    /// buffered. Called from maintenance ticks, never from the hot path.
    pub fn shrink_if_oversized(&mut self, threshold: usize) {
        if self.data.capacity() > threshold && self.len() * 4 < self.data.capacity() {
            self.compact();
            self.data.shrink_to(threshold.max(self.data.len()));
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    fn maybe_compact(&mut self) {
        // Only pay the memmove when the dead prefix dominates the buffer.
        if self.start > 0 && self.start >= self.data.len() / 2 {
            self.compact();
        }
    }

    fn compact(&mut self) {
        if self.start > 0 {
            self.data.drain(..self.start);
            self.start = 0;
        }
    }
}

impl Deref for ByteBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extend_consume_roundtrip() {
        let mut buf = ByteBuf::new();
        buf.extend_from_slice(b"hello world");
        buf.consume(6);
        assert_eq!(buf.as_slice(), b"world");
        buf.extend_from_slice(b"!");
        assert_eq!(buf.as_slice(), b"world!");
        buf.consume(6);
        assert!(buf.is_empty());
        assert_eq!(buf.len(), 0);
    }

    #[test]
    fn spare_capacity_fill() {
        let mut buf = ByteBuf::new();
        buf.extend_from_slice(b"ab");
        let spare = buf.spare_capacity(4);
        spare[..3].copy_from_slice(b"cde");
        buf.truncate_back(1);
        assert_eq!(buf.as_slice(), b"abcde");
    }

    #[test]
    fn shrink_releases_oversized_allocation() {
        let mut buf = ByteBuf::new();
        buf.extend_from_slice(&vec![0u8; 1 << 20]);
        buf.consume((1 << 20) - 8);
        buf.shrink_if_oversized(4096);
        assert!(buf.capacity() <= 4096);
        assert_eq!(buf.len(), 8);
    }
}
