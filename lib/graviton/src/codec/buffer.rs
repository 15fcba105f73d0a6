use std::io;

// Read granularity for ingress.
const CHUNK_SIZE: usize = 65536;
// Compact once the dead prefix grows past this.
const COMPACT_THRESHOLD: usize = 65536;

/// A dynamically sized buffered FIFO byte queue. Data is appended at the
/// tail and read from the head; the dead prefix left behind by reads is
/// reclaimed lazily.
pub struct Buffer {
    data: Vec<u8>,
    head: usize,
}

impl Buffer {
    #[inline]
    pub fn new() -> Buffer {
        Buffer {
            data: Vec::new(),
            head: 0,
        }
    }

    /// The number of unread bytes in the buffer.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len() - self.head
    }

    /// Returns true in case the buffer holds no unread data.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head == self.data.len()
    }

    /// Slice containing the unread data.
    #[inline]
    pub fn read_slice(&self) -> &[u8] {
        &self.data[self.head..]
    }

    /// Advance the head past `count` consumed bytes.
    #[inline]
    pub fn consume(&mut self, count: usize) {
        self.head += count;
        debug_assert!(self.head <= self.data.len());
        if self.head == self.data.len() {
            self.data.clear();
            self.head = 0;
        } else if self.head >= COMPACT_THRESHOLD {
            self.data.drain(..self.head);
            self.head = 0;
        }
    }

    #[inline]
    pub fn clear(&mut self) {
        self.data.clear();
        self.head = 0;
    }

    /// Append bytes at the tail.
    #[inline]
    pub fn extend(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// The current tail position. Stable across writes; invalidated by
    /// `consume`, so a mark must not be held across reads.
    #[inline]
    pub fn mark(&self) -> usize {
        self.data.len()
    }

    /// Drop everything written after `mark`.
    #[inline]
    pub fn truncate_to(&mut self, mark: usize) {
        debug_assert!(mark >= self.head);
        self.data.truncate(mark);
    }

    /// Overwrite four bytes at `mark` in place.
    #[inline]
    pub fn patch_u32(&mut self, mark: usize, value: u32) {
        self.data[mark..mark + 4].copy_from_slice(&value.to_be_bytes());
    }

    /// Read all available data off `reader` into the buffer. Returns the
    /// number of bytes transferred; zero-sized reads (peer closed) surface
    /// as `UnexpectedEof`.
    pub fn ingress<R: io::Read + ?Sized>(&mut self, reader: &mut R) -> io::Result<usize> {
        let mut total = 0;
        loop {
            let len = self.data.len();
            self.data.resize(len + CHUNK_SIZE, 0);
            match reader.read(&mut self.data[len..]) {
                Ok(0) => {
                    self.data.truncate(len);
                    return Err(io::ErrorKind::UnexpectedEof.into());
                }
                Ok(n) => {
                    self.data.truncate(len + n);
                    total += n;
                }
                Err(err) => {
                    self.data.truncate(len);
                    if err.kind() == io::ErrorKind::WouldBlock {
                        return Ok(total);
                    }
                    if err.kind() == io::ErrorKind::Interrupted {
                        continue;
                    }
                    return Err(err);
                }
            }
        }
    }

    /// Write the buffered data to `writer`, advancing the head past what was
    /// accepted. Returns the number of bytes transferred.
    pub fn egress<W: io::Write + ?Sized>(&mut self, writer: &mut W) -> io::Result<usize> {
        let mut total = 0;
        while !self.is_empty() {
            match writer.write(self.read_slice()) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    self.consume(n);
                    total += n;
                }
                Err(err) => {
                    if err.kind() == io::ErrorKind::WouldBlock {
                        break;
                    }
                    if err.kind() == io::ErrorKind::Interrupted {
                        continue;
                    }
                    return Err(err);
                }
            }
        }
        Ok(total)
    }
}

impl Default for Buffer {
    fn default() -> Buffer {
        Buffer::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extend_consume_roundtrip() {
        let mut buffer = Buffer::new();
        buffer.extend(b"hello");
        buffer.extend(b" world");
        assert_eq!(buffer.read_slice(), b"hello world");
        buffer.consume(6);
        assert_eq!(buffer.read_slice(), b"world");
        buffer.consume(5);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_truncate_to_mark() {
        let mut buffer = Buffer::new();
        buffer.extend(b"keep");
        let mark = buffer.mark();
        buffer.extend(b"discard");
        buffer.truncate_to(mark);
        assert_eq!(buffer.read_slice(), b"keep");
    }

    #[test]
    fn test_patch_u32() {
        let mut buffer = Buffer::new();
        let mark = buffer.mark();
        buffer.extend(&[0; 4]);
        buffer.extend(b"body");
        buffer.patch_u32(mark, 4);
        assert_eq!(buffer.read_slice(), &[0, 0, 0, 4, b'b', b'o', b'd', b'y']);
    }

    #[test]
    fn test_egress_to_vec() {
        let mut buffer = Buffer::new();
        buffer.extend(b"payload");
        let mut sink = Vec::new();
        let sent = buffer.egress(&mut sink).unwrap();
        assert_eq!(sent, 7);
        assert_eq!(sink, b"payload");
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_ingress_from_slice() {
        let mut buffer = Buffer::new();
        let mut source: &[u8] = b"incoming";
        // A slice reader reports EOF once drained; data read before that
        // must be preserved.
        let err = buffer.ingress(&mut source).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
        assert_eq!(buffer.read_slice(), b"incoming");
    }

    #[test]
    fn test_compaction_preserves_data() {
        let mut buffer = Buffer::new();
        let blob = vec![7u8; COMPACT_THRESHOLD + 100];
        buffer.extend(&blob);
        buffer.consume(COMPACT_THRESHOLD);
        assert_eq!(buffer.len(), 100);
        assert_eq!(buffer.read_slice(), &blob[COMPACT_THRESHOLD..]);
    }
}
