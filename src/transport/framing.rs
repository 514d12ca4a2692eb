//! Byte stream to text record framing.
//!
//! Records are normally newline terminated. One TESS-W firmware build sends
//! JSON objects back to back with no terminator at all; for it the framer is
//! switched to `}` and keeps the delimiter as part of the record.

use tracing::warn;

/// Longest record kept while waiting for a delimiter.
pub const MAX_FRAME_LEN: usize = 4096;

/// Splits a byte stream into records.
#[derive(Debug, Clone)]
pub struct LineFramer {
    delimiter: u8,
    buf: Vec<u8>,
}

impl Default for LineFramer {
    fn default() -> Self {
        Self::new(b'\n')
    }
}

impl LineFramer {
    /// Framer splitting on `delimiter`.
    pub fn new(delimiter: u8) -> Self {
        Self {
            delimiter,
            buf: Vec::with_capacity(256),
        }
    }

    /// Current delimiter.
    pub fn delimiter(&self) -> u8 {
        self.delimiter
    }

    /// Changes the delimiter. Buffered bytes are kept.
    pub fn set_delimiter(&mut self, delimiter: u8) {
        self.delimiter = delimiter;
    }

    /// Appends received bytes.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
        if self.buf.len() > MAX_FRAME_LEN && !self.buf.contains(&self.delimiter) {
            warn!(
                len = self.buf.len(),
                "Discarding oversized record without delimiter"
            );
            self.buf.clear();
        }
    }

    /// Pops the next complete record, decoded as Latin-1.
    pub fn next_frame(&mut self) -> Option<String> {
        let pos = self.buf.iter().position(|&b| b == self.delimiter)?;
        let mut frame: Vec<u8> = self.buf.drain(..=pos).collect();
        if self.delimiter == b'\n' {
            frame.pop();
            if frame.last() == Some(&b'\r') {
                frame.pop();
            }
        }
        Some(frame.iter().map(|&b| b as char).collect())
    }

    /// Bytes waiting for a delimiter.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_newline_records_across_pushes() {
        let mut f = LineFramer::default();
        f.push(b"{\"freq\":1");
        assert_eq!(f.next_frame(), None);
        f.push(b".5}\r\n{\"freq\":2}\n");
        assert_eq!(f.next_frame().as_deref(), Some("{\"freq\":1.5}"));
        assert_eq!(f.next_frame().as_deref(), Some("{\"freq\":2}"));
        assert_eq!(f.next_frame(), None);
        assert_eq!(f.pending(), 0);
    }

    #[test]
    fn brace_mode_keeps_closing_brace() {
        let mut f = LineFramer::new(b'}');
        f.push(b"{\"udp\":1,\"freq\":3}{\"udp\":2,\"freq\":4}");
        assert_eq!(f.next_frame().as_deref(), Some("{\"udp\":1,\"freq\":3}"));
        assert_eq!(f.next_frame().as_deref(), Some("{\"udp\":2,\"freq\":4}"));
    }

    #[test]
    fn latin1_bytes_decode_without_loss() {
        let mut f = LineFramer::default();
        f.push(&[b'T', 0xB0, b'C', b'\n']);
        assert_eq!(f.next_frame().as_deref(), Some("T°C"));
    }

    #[test]
    fn oversized_garbage_is_dropped() {
        let mut f = LineFramer::default();
        f.push(&vec![b'x'; MAX_FRAME_LEN + 1]);
        assert_eq!(f.pending(), 0);
    }
}
