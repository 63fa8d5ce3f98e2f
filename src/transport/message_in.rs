//! Inbound reassembly (§3, §4.5).

use std::collections::BTreeMap;

/// Outcome of inserting a DATA segment into an [`InboundMessage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// First time this offset has been seen; `bytes_remaining` dropped.
    Inserted,
    /// Exact duplicate by offset — silently dropped (§4.5).
    Duplicate,
    /// `offset + length` ran past the message end; counted as a short
    /// packet rather than inserted (§4.5).
    OutOfBounds,
}

/// Ordered reassembly buffer for one message's DATA segments.
///
/// Invariant: offsets received are distinct and each segment fits inside
/// `[0, length)`; `bytes_remaining == length - sum(received segment
/// lengths)` (§8 invariant 2).
pub struct InboundMessage {
    pub length: u32,
    /// Bytes the sender may send without a further grant (§3);
    /// monotonically non-decreasing (§8 invariant 3).
    pub incoming: u32,
    /// Received segments keyed by start offset; may contain gaps.
    segments: BTreeMap<u32, Vec<u8>>,
    pub bytes_remaining: u32,
    /// True iff `length` exceeds the unscheduled window (§3).
    pub scheduled: bool,
    /// Grantable-set membership flag, mirrored by
    /// [`crate::transport::grant::GrantScheduler`]'s own bookkeeping.
    pub in_grantable: bool,
}

impl InboundMessage {
    pub fn new(length: u32, unscheduled_window: u32) -> Self {
        Self {
            length,
            incoming: length.min(unscheduled_window),
            segments: BTreeMap::new(),
            bytes_remaining: length,
            scheduled: length > unscheduled_window,
            in_grantable: false,
        }
    }

    /// Inserts a received DATA segment (§4.5). `incoming` is advanced to
    /// `max(incoming, packet_incoming)` regardless of outcome, since a
    /// duplicate can still carry fresher grant information.
    pub fn on_data(&mut self, offset: u32, payload: &[u8], packet_incoming: u32) -> InsertOutcome {
        self.incoming = self.incoming.max(packet_incoming).min(self.length);

        let seg_len = payload.len() as u32;
        if offset.saturating_add(seg_len) > self.length {
            return InsertOutcome::OutOfBounds;
        }
        if self.segments.contains_key(&offset) {
            return InsertOutcome::Duplicate;
        }
        self.segments.insert(offset, payload.to_vec());
        self.bytes_remaining = self.bytes_remaining.saturating_sub(seg_len);
        InsertOutcome::Inserted
    }

    pub fn is_complete(&self) -> bool {
        self.bytes_remaining == 0
    }

    /// Concatenates the reassembled bytes. Only meaningful once
    /// [`Self::is_complete`] is true.
    pub fn reassembled(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.length as usize);
        for (_, payload) in self.segments.iter() {
            out.extend_from_slice(payload);
        }
        out
    }

    /// First missing byte range below `incoming` (§4.5): the first gap in
    /// the offset-sorted segment set, or — if there is no gap but
    /// `incoming` extends past the contiguous prefix already received —
    /// the range from the end of that prefix to `incoming`.
    pub fn get_resend_range(&self) -> Option<(u32, u32)> {
        let mut expected = 0u32;
        for (&offset, payload) in self.segments.iter() {
            if offset > expected {
                return Some((expected, offset - expected));
            }
            expected = expected.max(offset + payload.len() as u32);
        }
        if self.incoming > expected {
            return Some((expected, self.incoming - expected));
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_byte_message_completes_immediately() {
        let m = InboundMessage::new(0, 10_000);
        assert!(m.is_complete());
    }

    #[test]
    fn duplicate_segment_is_dropped_and_remaining_unchanged() {
        let mut m = InboundMessage::new(10, 10_000);
        assert_eq!(m.on_data(0, &[1, 2, 3], 10), InsertOutcome::Inserted);
        let remaining = m.bytes_remaining;
        assert_eq!(m.on_data(0, &[1, 2, 3], 10), InsertOutcome::Duplicate);
        assert_eq!(m.bytes_remaining, remaining);
    }

    #[test]
    fn out_of_bounds_segment_is_rejected() {
        let mut m = InboundMessage::new(10, 10_000);
        assert_eq!(m.on_data(8, &[1, 2, 3, 4], 10), InsertOutcome::OutOfBounds);
        assert_eq!(m.bytes_remaining, 10);
    }

    #[test]
    fn permutation_of_segments_yields_same_result() {
        let mut a = InboundMessage::new(9, 10_000);
        let mut b = InboundMessage::new(9, 10_000);
        a.on_data(0, &[1, 2, 3], 9);
        a.on_data(3, &[4, 5, 6], 9);
        a.on_data(6, &[7, 8, 9], 9);
        b.on_data(6, &[7, 8, 9], 9);
        b.on_data(0, &[1, 2, 3], 9);
        b.on_data(3, &[4, 5, 6], 9);
        assert!(a.is_complete() && b.is_complete());
        assert_eq!(a.reassembled(), b.reassembled());
    }

    #[test]
    fn resend_range_finds_first_gap() {
        let mut m = InboundMessage::new(30, 10_000);
        m.on_data(0, &[0; 10], 30);
        m.on_data(20, &[0; 10], 30);
        assert_eq!(m.get_resend_range(), Some((10, 10)));
    }

    #[test]
    fn resend_range_covers_incoming_when_no_gap() {
        let mut m = InboundMessage::new(100, 10_000);
        m.on_data(0, &[0; 10], 50);
        assert_eq!(m.get_resend_range(), Some((10, 40)));
    }

    #[test]
    fn resend_range_is_none_once_complete() {
        let mut m = InboundMessage::new(5, 10_000);
        m.on_data(0, &[0; 5], 5);
        assert!(m.is_complete());
        assert_eq!(m.get_resend_range(), None);
    }
}
