use bytes::{Buf, BytesMut};

/// How an incoming segment relates to what this direction has already seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeqCheck {
    /// First segment, or starts exactly where the previous one ended.
    /// `skip` is non-zero when the segment overlaps already-seen bytes and
    /// only its tail is new.
    InOrder { skip: usize },
    /// Ends at or before the highest byte already seen.
    Duplicate,
    /// Starts `missing` bytes past the highest byte already seen.
    Gap { missing: usize },
}

/// Append-only byte buffer for one direction of a flow.
///
/// Bytes are appended at the tail as segments arrive and released from the
/// head as the decoder consumes complete messages. The consumed prefix is
/// dropped immediately (`BytesMut::advance`), so the buffer only ever holds
/// the unparsed remainder.
#[derive(Debug)]
pub struct DirectionalBuffer {
    data: BytesMut,
    /// Sequence number one past the highest byte seen (seq + len).
    next_seq: Option<u32>,
    /// Timestamp of the segment that delivered the oldest unconsumed byte.
    pending_since: Option<i64>,
    /// Total bytes released from the head.
    consumed: u64,
    /// FIN seen in this direction.
    pub fin_received: bool,
    /// Statistics.
    pub segment_count: u64,
    pub duplicate_count: u64,
    pub gap_count: u64,
}

impl Default for DirectionalBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl DirectionalBuffer {
    pub fn new() -> Self {
        Self {
            data: BytesMut::new(),
            next_seq: None,
            pending_since: None,
            consumed: 0,
            fin_received: false,
            segment_count: 0,
            duplicate_count: 0,
            gap_count: 0,
        }
    }

    /// Classify a segment by its sequence range and record its end.
    ///
    /// Duplicates leave the recorded sequence untouched. Payload-less
    /// segments never count as duplicates or gaps.
    pub fn check_seq(&mut self, seq: u32, len: usize) -> SeqCheck {
        self.segment_count += 1;
        let end = seq_add(seq, len);

        let Some(next) = self.next_seq else {
            if len > 0 {
                self.next_seq = Some(end);
            }
            return SeqCheck::InOrder { skip: 0 };
        };

        if len == 0 {
            return SeqCheck::InOrder { skip: 0 };
        }

        if seq_le(end, next) {
            self.duplicate_count += 1;
            return SeqCheck::Duplicate;
        }

        self.next_seq = Some(end);
        if seq_lt(seq, next) {
            SeqCheck::InOrder {
                skip: next.wrapping_sub(seq) as usize,
            }
        } else if seq == next {
            SeqCheck::InOrder { skip: 0 }
        } else {
            self.gap_count += 1;
            SeqCheck::Gap {
                missing: seq.wrapping_sub(next) as usize,
            }
        }
    }

    /// Append payload bytes at the tail.
    ///
    /// Returns `false` (without appending) when the unconsumed length would
    /// exceed `max_len`; the caller is expected to tear the flow down.
    #[must_use]
    pub fn append(&mut self, payload: &[u8], timestamp: i64, max_len: usize) -> bool {
        if payload.is_empty() {
            return true;
        }
        if self.data.len() + payload.len() > max_len {
            return false;
        }
        if self.data.is_empty() {
            self.pending_since = Some(timestamp);
        }
        self.data.extend_from_slice(payload);
        true
    }

    /// Unconsumed bytes, starting at the parse cursor.
    pub fn unconsumed(&self) -> &[u8] {
        &self.data
    }

    /// Release `n` bytes from the head after the decoder finished a message.
    ///
    /// The remaining bytes arrived with the current segment at the latest,
    /// so their timestamp becomes `now`.
    pub fn consume(&mut self, n: usize, now: i64) {
        let n = n.min(self.data.len());
        self.data.advance(n);
        self.consumed += n as u64;
        self.pending_since = if self.data.is_empty() { None } else { Some(now) };
    }

    /// Drop every buffered byte (decoder reset or gap).
    pub fn clear(&mut self) {
        self.consumed += self.data.len() as u64;
        self.data.clear();
        self.pending_since = None;
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Timestamp of the oldest unconsumed byte, if any.
    pub fn pending_since(&self) -> Option<i64> {
        self.pending_since
    }

    /// Total bytes consumed or discarded since the flow started.
    pub fn consumed(&self) -> u64 {
        self.consumed
    }
}

/// Sequence number comparison with wraparound (RFC 1982).
#[inline]
fn seq_lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

#[inline]
fn seq_le(a: u32, b: u32) -> bool {
    a == b || seq_lt(a, b)
}

#[inline]
fn seq_add(seq: u32, len: usize) -> u32 {
    seq.wrapping_add(len as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX: usize = 1024;

    #[test]
    fn test_first_segment_always_accepted() {
        let mut buf = DirectionalBuffer::new();
        assert_eq!(buf.check_seq(123_456, 5), SeqCheck::InOrder { skip: 0 });
        assert!(buf.append(b"hello", 10, MAX));
        assert_eq!(buf.unconsumed(), b"hello");
        assert_eq!(buf.pending_since(), Some(10));
    }

    #[test]
    fn test_in_order() {
        let mut buf = DirectionalBuffer::new();
        assert_eq!(buf.check_seq(1000, 5), SeqCheck::InOrder { skip: 0 });
        assert!(buf.append(b"hello", 1, MAX));
        assert_eq!(buf.check_seq(1005, 6), SeqCheck::InOrder { skip: 0 });
        assert!(buf.append(b" world", 2, MAX));
        assert_eq!(buf.unconsumed(), b"hello world");
        // Timestamp stays at the first byte
        assert_eq!(buf.pending_since(), Some(1));
    }

    #[test]
    fn test_retransmission_rejected() {
        let mut buf = DirectionalBuffer::new();
        buf.check_seq(1000, 5);
        assert!(buf.append(b"hello", 0, MAX));

        assert_eq!(buf.check_seq(1000, 5), SeqCheck::Duplicate);
        assert_eq!(buf.check_seq(1002, 3), SeqCheck::Duplicate);
        assert_eq!(buf.duplicate_count, 2);
        assert_eq!(buf.unconsumed(), b"hello");
    }

    #[test]
    fn test_overlap_keeps_new_tail() {
        let mut buf = DirectionalBuffer::new();
        buf.check_seq(1000, 5);
        assert!(buf.append(b"hello", 0, MAX));

        // "lo world" overlaps the last two bytes
        assert_eq!(buf.check_seq(1003, 8), SeqCheck::InOrder { skip: 2 });
    }

    #[test]
    fn test_gap_reported() {
        let mut buf = DirectionalBuffer::new();
        buf.check_seq(1000, 5);
        assert_eq!(buf.check_seq(1010, 5), SeqCheck::Gap { missing: 5 });
        assert_eq!(buf.gap_count, 1);
        // The late segment that filled the hole is now behind the high mark
        assert_eq!(buf.check_seq(1005, 5), SeqCheck::Duplicate);
    }

    #[test]
    fn test_wraparound() {
        let mut buf = DirectionalBuffer::new();
        buf.check_seq(u32::MAX - 2, 3);
        assert_eq!(buf.check_seq(0, 4), SeqCheck::InOrder { skip: 0 });
        assert_eq!(buf.check_seq(u32::MAX - 2, 3), SeqCheck::Duplicate);
    }

    #[test]
    fn test_empty_payload_is_neutral() {
        let mut buf = DirectionalBuffer::new();
        buf.check_seq(1000, 5);
        assert_eq!(buf.check_seq(1005, 0), SeqCheck::InOrder { skip: 0 });
        assert_eq!(buf.check_seq(900, 0), SeqCheck::InOrder { skip: 0 });
        assert_eq!(buf.duplicate_count, 0);
    }

    #[test]
    fn test_overflow_refused() {
        let mut buf = DirectionalBuffer::new();
        assert!(buf.append(&[0u8; 8], 0, 10));
        assert!(!buf.append(&[0u8; 3], 0, 10));
        assert_eq!(buf.len(), 8);
    }

    #[test]
    fn test_consume_compacts() {
        let mut buf = DirectionalBuffer::new();
        assert!(buf.append(b"GET / HTTP/1.1\r\n\r\nGET", 5, MAX));
        buf.consume(18, 7);
        assert_eq!(buf.unconsumed(), b"GET");
        assert_eq!(buf.consumed(), 18);
        assert_eq!(buf.pending_since(), Some(7));

        buf.consume(3, 8);
        assert!(buf.is_empty());
        assert_eq!(buf.pending_since(), None);
    }
}
