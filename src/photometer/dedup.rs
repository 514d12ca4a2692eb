//! Drops protocol-level retransmissions.

use crate::core::Reading;

/// Forwards a reading unless it repeats the sequence number of the previously
/// forwarded one. Readings without a sequence number always pass.
#[derive(Debug, Default, Clone)]
pub struct Deduplicator {
    last_sequence: Option<u64>,
}

impl Deduplicator {
    /// True when `reading` should be forwarded.
    pub fn accept(&mut self, reading: &Reading) -> bool {
        match reading.sequence {
            None => true,
            Some(seq) if self.last_sequence == Some(seq) => false,
            Some(seq) => {
                self.last_sequence = Some(seq);
                true
            }
        }
    }
}
