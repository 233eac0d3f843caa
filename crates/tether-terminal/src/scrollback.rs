use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;

/// Bounded in-memory output history
///
/// Holds raw output chunks, oldest first. Once the byte total exceeds the cap
/// the oldest chunks are evicted; a single chunk larger than the cap is
/// truncated to its tail. Used as a fallback when no tmux history exists.
#[derive(Debug)]
pub struct ScrollbackBuffer {
    chunks: VecDeque<Bytes>,
    len: usize,
    max_bytes: usize,
}

impl ScrollbackBuffer {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            chunks: VecDeque::new(),
            len: 0,
            max_bytes,
        }
    }

    pub fn push(&mut self, chunk: Bytes) {
        if chunk.is_empty() || self.max_bytes == 0 {
            return;
        }

        let chunk = if chunk.len() > self.max_bytes {
            chunk.slice(chunk.len() - self.max_bytes..)
        } else {
            chunk
        };

        self.len += chunk.len();
        self.chunks.push_back(chunk);

        while self.len > self.max_bytes {
            match self.chunks.pop_front() {
                Some(old) => self.len -= old.len(),
                None => break,
            }
        }
    }

    /// Concatenated contents, oldest first.
    pub fn snapshot(&self) -> Bytes {
        if self.chunks.len() == 1 {
            return self.chunks[0].clone();
        }
        let mut out = BytesMut::with_capacity(self.len);
        for chunk in &self.chunks {
            out.extend_from_slice(chunk);
        }
        out.freeze()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.max_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_and_snapshot_in_order() {
        let mut buf = ScrollbackBuffer::new(1024);
        buf.push(Bytes::from_static(b"hello "));
        buf.push(Bytes::from_static(b"world"));
        assert_eq!(&buf.snapshot()[..], b"hello world");
        assert_eq!(buf.len(), 11);
    }

    #[test]
    fn test_evicts_oldest_chunks_past_cap() {
        let mut buf = ScrollbackBuffer::new(10);
        buf.push(Bytes::from_static(b"aaaa"));
        buf.push(Bytes::from_static(b"bbbb"));
        buf.push(Bytes::from_static(b"cccc"));
        assert_eq!(&buf.snapshot()[..], b"bbbbcccc");
        assert!(buf.len() <= buf.capacity());
    }

    #[test]
    fn test_oversized_chunk_keeps_tail() {
        let mut buf = ScrollbackBuffer::new(4);
        buf.push(Bytes::from_static(b"abcdefgh"));
        assert_eq!(&buf.snapshot()[..], b"efgh");
    }

    #[test]
    fn test_zero_capacity_stores_nothing() {
        let mut buf = ScrollbackBuffer::new(0);
        buf.push(Bytes::from_static(b"data"));
        assert!(buf.is_empty());
        assert!(buf.snapshot().is_empty());
    }
}
