//! TCP sequence-space arithmetic and stream-key/reassembly plumbing
//! shared by the marker and masker (spec §4.5.1, design note on
//! modular-32 comparison).
//!
//! Grounded in jonasbb's `TcpBuffer`/`BoundedBuffer` pattern: a `BTreeMap`
//! of not-yet-contiguous fragments keyed by sequence number, plus a
//! bounded byte budget past which the stream is abandoned rather than
//! buffered indefinitely.

use std::collections::BTreeMap;
use std::net::IpAddr;

/// 32-bit modular sequence comparison (spec §9 design note: "provide a
/// central helper and forbid raw comparisons"). `a < b` iff
/// `(b - a) mod 2^32 < 2^31`.
pub fn seq_lt(a: u32, b: u32) -> bool {
    b.wrapping_sub(a) < 0x8000_0000
}

pub fn seq_le(a: u32, b: u32) -> bool {
    a == b || seq_lt(a, b)
}

/// Distance from `a` to `b` going forward (modular), i.e. the number of
/// bytes between `a` (inclusive) and `b` (exclusive) assuming `b` is
/// "ahead of or at" `a`.
pub fn seq_distance(a: u32, b: u32) -> u32 {
    b.wrapping_sub(a)
}

/// A bidirectional TCP flow identified by its unordered endpoint pair,
/// with a canonical direction chosen so both packets of a flow hash to
/// the same key (spec §3 `TCPStreamKey`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamKey {
    pub low: (IpAddr, u16),
    pub high: (IpAddr, u16),
}

/// Which half of the bidirectional flow a packet belongs to, relative to
/// the stream key's canonical (low, high) ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    LowToHigh,
    HighToLow,
}

impl StreamKey {
    /// Build the canonical key and this packet's direction from its
    /// observed (src, dst) endpoints.
    pub fn from_endpoints(src: (IpAddr, u16), dst: (IpAddr, u16)) -> (StreamKey, Direction) {
        if src <= dst {
            (StreamKey { low: src, high: dst }, Direction::LowToHigh)
        } else {
            (StreamKey { low: dst, high: src }, Direction::HighToLow)
        }
    }
}

/// Half-open byte range in sequence space for one direction of one
/// stream, not yet delivered contiguously.
struct PendingFragment {
    data: Vec<u8>,
}

/// Per-direction reassembly state: tracks the next contiguous sequence
/// number expected and buffers anything that arrives ahead of it, up to
/// a byte budget.
pub struct ReassemblyState {
    pub initial_seq: Option<u32>,
    pub expected_next_seq: Option<u32>,
    pending: BTreeMap<u32, PendingFragment>,
    pending_bytes: usize,
    max_bytes: usize,
    pub abandoned: bool,
}

impl ReassemblyState {
    pub fn new(max_bytes: usize) -> Self {
        ReassemblyState {
            initial_seq: None,
            expected_next_seq: None,
            pending: BTreeMap::new(),
            pending_bytes: 0,
            max_bytes,
            abandoned: false,
        }
    }

    /// Feed one packet's payload at `seq`. Returns the contiguous bytes
    /// now available starting at the (pre-call) `expected_next_seq`,
    /// along with that starting sequence number, or `None` if nothing
    /// new became contiguous (e.g. this segment is ahead of the gap, or
    /// is a pure retransmission).
    pub fn feed(&mut self, seq: u32, payload: &[u8]) -> Option<(u32, Vec<u8>)> {
        if payload.is_empty() || self.abandoned {
            return None;
        }

        if self.initial_seq.is_none() {
            self.initial_seq = Some(seq);
            self.expected_next_seq = Some(seq);
        }
        let expected = self.expected_next_seq.unwrap();

        let seg_end = seq.wrapping_add(payload.len() as u32);
        if seq_lt(seg_end, expected) || seg_end == expected {
            // Fully covered by already-delivered bytes: retransmission.
            return None;
        }

        if seq == expected {
            let mut out = payload.to_vec();
            let mut next = seg_end;
            self.expected_next_seq = Some(next);
            // Pull any now-contiguous buffered fragments forward.
            while let Some((&frag_seq, _)) = self.pending.iter().next() {
                if frag_seq != next {
                    break;
                }
                let frag = self.pending.remove(&frag_seq).unwrap();
                self.pending_bytes -= frag.data.len();
                next = next.wrapping_add(frag.data.len() as u32);
                out.extend_from_slice(&frag.data);
                self.expected_next_seq = Some(next);
            }
            Some((expected, out))
        } else if seq_lt(expected, seq) {
            // Out of order: buffer until the gap closes, subject to the
            // byte budget (spec §5 resource bounds).
            if self.pending_bytes + payload.len() > self.max_bytes {
                self.abandoned = true;
                return None;
            }
            self.pending_bytes += payload.len();
            self.pending.insert(seq, PendingFragment { data: payload.to_vec() });
            None
        } else {
            // Partially overlapping an already-delivered region: take
            // only the new tail.
            let overlap = seq_distance(seq, expected) as usize;
            if overlap >= payload.len() {
                return None;
            }
            let new_bytes = &payload[overlap..];
            let out = new_bytes.to_vec();
            let next = expected.wrapping_add(new_bytes.len() as u32);
            self.expected_next_seq = Some(next);
            Some((expected, out))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seq_lt_handles_wraparound() {
        assert!(seq_lt(0xFFFF_FFFE, 2));
        assert!(!seq_lt(2, 0xFFFF_FFFE));
    }

    #[test]
    fn stream_key_is_order_independent() {
        let a = ("10.0.0.1".parse().unwrap(), 1234u16);
        let b = ("10.0.0.2".parse().unwrap(), 80u16);
        let (k1, d1) = StreamKey::from_endpoints(a, b);
        let (k2, d2) = StreamKey::from_endpoints(b, a);
        assert_eq!(k1, k2);
        assert_ne!(d1, d2);
    }

    #[test]
    fn feed_in_order_returns_immediately() {
        let mut state = ReassemblyState::new(1024);
        let (start, bytes) = state.feed(100, b"hello").unwrap();
        assert_eq!(start, 100);
        assert_eq!(bytes, b"hello");
        assert_eq!(state.expected_next_seq, Some(105));
    }

    #[test]
    fn feed_out_of_order_then_fill_gap() {
        let mut state = ReassemblyState::new(1024);
        assert!(state.feed(105, b"world").is_none());
        let (start, bytes) = state.feed(100, b"hello").unwrap();
        assert_eq!(start, 100);
        assert_eq!(bytes, b"helloworld");
    }

    #[test]
    fn retransmission_yields_nothing_new() {
        let mut state = ReassemblyState::new(1024);
        state.feed(100, b"hello").unwrap();
        assert!(state.feed(100, b"hello").is_none());
    }

    #[test]
    fn buffer_cap_abandons_direction() {
        let mut state = ReassemblyState::new(4);
        state.feed(100, b"x").unwrap();
        // Out-of-order fragment larger than remaining budget.
        state.feed(200, b"abcdef");
        assert!(state.abandoned);
    }
}
