//! Fixed-capacity byte ring used for per-connection read buffering in the
//! CSTP HTTP handshake and frame decoder.

use thiserror::Error;

/// Errors raised by [`StreamBuffer`] operations.
#[derive(Debug, Error)]
pub enum BufferError {
    /// `write` would push `used_size` past `max_size`.
    #[error("buffer out of memory: {requested} would exceed capacity {capacity}")]
    OutOfMemory { requested: usize, capacity: usize },
    /// `add_used` would push `used_size` past `max_size`.
    #[error("invalid write index adjustment")]
    InvalidAdjust,
}

/// A single-producer/single-consumer byte ring with compaction.
pub struct StreamBuffer {
    data: Vec<u8>,
    max_size: usize,
    used_size: usize,
    read_index: usize,
}

impl StreamBuffer {
    /// Allocate a buffer with the given fixed capacity.
    pub fn new(max_size: usize) -> Self {
        Self {
            data: vec![0u8; max_size],
            max_size,
            used_size: 0,
            read_index: 0,
        }
    }

    /// Append `src`, failing if it would overflow capacity.
    pub fn write(&mut self, src: &[u8]) -> Result<usize, BufferError> {
        if self.used_size + src.len() > self.max_size {
            return Err(BufferError::OutOfMemory {
                requested: self.used_size + src.len(),
                capacity: self.max_size,
            });
        }
        self.data[self.used_size..self.used_size + src.len()].copy_from_slice(src);
        self.used_size += src.len();
        Ok(src.len())
    }

    /// The mutable tail past the write watermark; the caller writes into it
    /// directly then commits with [`add_used`](Self::add_used).
    pub fn writable_tail(&mut self) -> &mut [u8] {
        &mut self.data[self.used_size..]
    }

    /// Commit `len` bytes written into [`writable_tail`](Self::writable_tail).
    pub fn add_used(&mut self, len: usize) -> Result<(), BufferError> {
        if self.used_size + len > self.max_size {
            return Err(BufferError::InvalidAdjust);
        }
        self.used_size += len;
        Ok(())
    }

    /// Advance `read_index` by `min(n, unread)` and return the consumed
    /// slice (aliasing the buffer — valid until the next mutation).
    pub fn read_n(&mut self, n: usize) -> &[u8] {
        let unread = self.used_size - self.read_index;
        let take = n.min(unread);
        let start = self.read_index;
        self.read_index += take;
        &self.data[start..start + take]
    }

    /// Search `data[read_index..used_size]` for `token`; on a match return
    /// the slice from the (absolute) `read_index` through the end of the
    /// match and advance `read_index` to that point, otherwise return
    /// `None`. Anchored at the true absolute offset (see grounding ledger
    /// for why this differs from the reference implementation).
    pub fn read_until(&mut self, token: &[u8]) -> Option<&[u8]> {
        let window = &self.data[self.read_index..self.used_size];
        let pos = find_subslice(window, token)?;
        let start = self.read_index;
        let end = start + pos + token.len();
        self.read_index = end;
        Some(&self.data[start..end])
    }

    /// Return the entire used region.
    pub fn read_all(&self) -> &[u8] {
        &self.data[..self.used_size]
    }

    /// Rewind/forward `read_index`, clamped to `[0, used_size]`.
    pub fn seek(&mut self, pos: usize) {
        self.read_index = pos.min(self.used_size);
    }

    /// Reset both watermarks to zero.
    pub fn reset(&mut self) {
        self.used_size = 0;
        self.read_index = 0;
    }

    /// Number of bytes written.
    pub fn used_size(&self) -> usize {
        self.used_size
    }

    /// Total capacity.
    pub fn total_size(&self) -> usize {
        self.max_size
    }

    /// Bytes written but not yet read.
    pub fn unread_size(&self) -> usize {
        self.used_size - self.read_index
    }

    /// Compact by moving `data[read_index..used_size]` to the front,
    /// resetting `read_index` to 0 and `used_size` to the length of the
    /// moved region (exactly the unread length — see grounding ledger).
    pub fn remove_read(&mut self) {
        if self.read_index == self.used_size {
            self.reset();
            return;
        }
        let unread = self.used_size - self.read_index;
        self.data.copy_within(self.read_index..self.used_size, 0);
        self.used_size = unread;
        self.read_index = 0;
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || needle.len() > haystack.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_n_round_trips() {
        let mut buf = StreamBuffer::new(64);
        buf.write(b"hello world").unwrap();
        assert_eq!(buf.read_n(5), b"hello");
        assert_eq!(buf.read_n(100), b" world");
    }

    #[test]
    fn write_rejects_overflow() {
        let mut buf = StreamBuffer::new(4);
        assert!(buf.write(b"hello").is_err());
    }

    #[test]
    fn read_until_anchors_at_absolute_read_index() {
        let mut buf = StreamBuffer::new(64);
        buf.write(b"AAAA\r\nBBBB\r\n").unwrap();
        assert_eq!(buf.read_until(b"\r\n"), Some(&b"AAAA\r\n"[..]));
        // second call starts searching from the new read_index, not index 0
        assert_eq!(buf.read_until(b"\r\n"), Some(&b"BBBB\r\n"[..]));
        assert_eq!(buf.read_until(b"\r\n"), None);
    }

    #[test]
    fn remove_read_compacts_exactly_the_unread_tail() {
        let mut buf = StreamBuffer::new(16);
        buf.write(b"0123456789").unwrap();
        buf.read_n(4); // read_index = 4
        buf.remove_read();
        assert_eq!(buf.used_size(), 6);
        assert_eq!(buf.read_all(), b"456789");
        // writable tail must now start right after the compacted data, not
        // leak stale bytes from before compaction.
        assert_eq!(buf.writable_tail().len(), 10);
    }

    #[test]
    fn seek_clamps_to_used_size() {
        let mut buf = StreamBuffer::new(16);
        buf.write(b"abc").unwrap();
        buf.seek(1000);
        assert_eq!(buf.unread_size(), 0);
    }
}
