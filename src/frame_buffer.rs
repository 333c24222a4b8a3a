//! Accumulates the packets sharing one RTP timestamp, and tracks whether they add up to a frame
//! the decoder can use.

use crate::config::DecodableSettings;
use crate::packet::{FrameType, NaluCompleteness, Packet};
use crate::seq;
use std::time::Instant;

/// ```plain
///  Free --first packet--> Incomplete --all packets--> Complete ----> Decoding --release--> Free
///    |                         |                          ^             ^
///    |                         +--tolerable loss--> Decodable ----------+
///    +--zero-length packet--> Empty --media packet--> Incomplete
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    /// Unused slot
    Free,
    /// Holds only zero-length (padding / FEC placeholder) packets
    Empty,
    /// One or more media packets stored, but not all of them
    Incomplete,
    /// Every packet from first to marker is present
    Complete,
    /// Incomplete, but judged good enough to hand to the decoder
    Decodable,
    /// Checked out by the decode thread
    Decoding,
}

/// Outcome of adding one packet to a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FrameInsert {
    Incomplete,
    Complete,
    Duplicate,
    /// a zero-length packet, which only extends the frame's sequence number span
    Empty,
    /// the packet's timestamp differs from the frame's
    TimestampMismatch,
    /// sequence number beyond the marker packet, or too many packets in the frame
    Rejected,
}

/// Inputs to the decision of whether an incomplete frame may be decoded anyway.
pub(crate) struct DecodableContext<'a> {
    pub rtt_ms: u32,
    pub avg_packets_per_frame: f32,
    pub settings: &'a DecodableSettings,
}

#[derive(Debug)]
pub struct FrameBuffer {
    state: FrameState,
    timestamp: u32,
    frame_type: FrameType,
    /// sorted by sequence number
    packets: Vec<Packet>,
    length: usize,
    marker_seq: Option<u16>,
    empty_seq_low: Option<u16>,
    empty_seq_high: Option<u16>,
    first_arrival: Option<Instant>,
    latest_arrival: Option<Instant>,
    retransmitted: bool,
    counted: bool,
    not_decodable_packets: usize,
}
impl Default for FrameBuffer {
    fn default() -> Self {
        FrameBuffer {
            state: FrameState::Free,
            timestamp: 0,
            frame_type: FrameType::Empty,
            packets: Vec::new(),
            length: 0,
            marker_seq: None,
            empty_seq_low: None,
            empty_seq_high: None,
            first_arrival: None,
            latest_arrival: None,
            retransmitted: false,
            counted: false,
            not_decodable_packets: 0,
        }
    }
}
impl FrameBuffer {
    pub fn state(&self) -> FrameState {
        self.state
    }
    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }
    pub fn frame_type(&self) -> FrameType {
        self.frame_type
    }
    pub fn length(&self) -> usize {
        self.length
    }
    pub fn num_packets(&self) -> usize {
        self.packets.len()
    }
    pub fn packets(&self) -> &[Packet] {
        &self.packets[..]
    }
    pub fn is_key_frame(&self) -> bool {
        self.frame_type == FrameType::Key
    }
    pub fn retransmitted(&self) -> bool {
        self.retransmitted
    }
    pub fn first_arrival(&self) -> Option<Instant> {
        self.first_arrival
    }
    pub fn latest_arrival(&self) -> Option<Instant> {
        self.latest_arrival
    }
    pub fn not_decodable_packets(&self) -> usize {
        self.not_decodable_packets
    }
    pub fn marker_seen(&self) -> bool {
        self.marker_seq.is_some()
    }

    /// Lowest sequence number seen for this frame, including zero-length packets
    pub fn low_seq(&self) -> Option<u16> {
        self.packets.first().map(|p| p.seq()).or(self.empty_seq_low)
    }

    /// Highest sequence number seen for this frame, including zero-length packets
    pub fn high_seq(&self) -> Option<u16> {
        match (self.packets.last().map(|p| p.seq()), self.empty_seq_high) {
            (Some(media), Some(empty)) => Some(seq::latest_sequence_number(media, empty)),
            (media, empty) => media.or(empty),
        }
    }

    pub fn have_first_packet(&self) -> bool {
        self.packets.first().map_or(false, |p| p.is_first_packet())
    }

    pub fn have_last_packet(&self) -> bool {
        self.packets.last().map_or(false, |p| p.marker())
    }

    pub(crate) fn is_counted(&self) -> bool {
        self.counted
    }
    pub(crate) fn set_counted(&mut self) {
        self.counted = true;
    }

    pub(crate) fn set_state(&mut self, state: FrameState) {
        debug_assert!(
            match state {
                FrameState::Free | FrameState::Empty => true,
                FrameState::Incomplete => self.state == FrameState::Free || self.state == FrameState::Empty,
                FrameState::Complete => self.state != FrameState::Decoding,
                FrameState::Decodable => self.state == FrameState::Incomplete,
                FrameState::Decoding => self.state != FrameState::Free,
            },
            "illegal frame state transition {:?} -> {:?}",
            self.state,
            state
        );
        self.state = state;
    }

    /// Reserves a free slot for the given timestamp ahead of its first packet.
    pub(crate) fn claim(&mut self, timestamp: u32) {
        debug_assert_eq!(self.state, FrameState::Free);
        self.timestamp = timestamp;
    }

    /// Returns the slot to `Free`, dropping all packets.
    pub(crate) fn reset(&mut self) {
        *self = FrameBuffer::default();
    }

    pub(crate) fn insert(&mut self, packet: Packet, max_packets: usize) -> FrameInsert {
        if self.state == FrameState::Free {
            self.timestamp = packet.timestamp();
            self.first_arrival = Some(packet.arrival());
        } else if self.timestamp != packet.timestamp() {
            return FrameInsert::TimestampMismatch;
        }

        if packet.frame_type() == FrameType::Empty {
            self.inform_of_empty_packet(packet.seq());
            self.latest_arrival = Some(packet.arrival());
            if self.state == FrameState::Free {
                self.set_state(FrameState::Empty);
            }
            return FrameInsert::Empty;
        }

        if self.packets.len() >= max_packets {
            return FrameInsert::Rejected;
        }
        if let Some(marker_seq) = self.marker_seq {
            if seq::is_newer_sequence_number(packet.seq(), marker_seq) {
                return FrameInsert::Rejected;
            }
        }
        let pos = match self.insertion_point(packet.seq()) {
            Ok(pos) => pos,
            Err(()) => return FrameInsert::Duplicate,
        };
        // a complete frame already spans its first packet to its marker
        if self.state == FrameState::Complete {
            return FrameInsert::Rejected;
        }

        if packet.is_first_packet() || self.frame_type == FrameType::Empty {
            // the first packet of a frame determines its type
            self.frame_type = packet.frame_type();
        }
        if packet.marker() {
            self.marker_seq = Some(packet.seq());
        }
        self.retransmitted |= packet.retransmitted();
        self.length += packet.len();
        self.latest_arrival = Some(packet.arrival());
        self.packets.insert(pos, packet);

        if self.state == FrameState::Free || self.state == FrameState::Empty {
            self.set_state(FrameState::Incomplete);
        }
        if self.is_complete() {
            self.set_state(FrameState::Complete);
            FrameInsert::Complete
        } else {
            FrameInsert::Incomplete
        }
    }

    /// Index at which a packet with the given sequence number keeps `packets` sorted, or `Err` if
    /// that sequence number is already present.  Searches from the back, since packets mostly
    /// arrive in order.
    fn insertion_point(&self, seq: u16) -> Result<usize, ()> {
        for (i, p) in self.packets.iter().enumerate().rev() {
            if p.seq() == seq {
                return Err(());
            }
            if seq::is_newer_sequence_number(seq, p.seq()) {
                return Ok(i + 1);
            }
        }
        Ok(0)
    }

    fn inform_of_empty_packet(&mut self, seq: u16) {
        self.empty_seq_high = Some(match self.empty_seq_high {
            Some(high) => seq::latest_sequence_number(seq, high),
            None => seq,
        });
        match self.empty_seq_low {
            Some(low) if !seq::is_newer_sequence_number(low, seq) => (),
            _ => self.empty_seq_low = Some(seq),
        }
    }

    /// Complete means: the lowest packet starts the frame, the highest carries the marker bit,
    /// and there is no gap in between.
    pub fn is_complete(&self) -> bool {
        self.have_first_packet()
            && self.have_last_packet()
            && self
                .packets
                .windows(2)
                .all(|w| w[0].seq().wrapping_add(1) == w[1].seq())
    }

    /// Moves an `Incomplete` frame to `Decodable` if the missing packets look tolerable.  The
    /// caller decides whether decoding with errors is permitted at all.
    pub(crate) fn update_decodable(&mut self, ctx: &DecodableContext<'_>) -> bool {
        if self.state != FrameState::Incomplete {
            return false;
        }
        let num = self.packets.len() as f32;
        let avg = ctx.avg_packets_per_frame;
        if ctx.rtt_ms < ctx.settings.rtt_threshold_ms
            || self.frame_type == FrameType::Key
            || !self.have_first_packet()
            || (num <= ctx.settings.high_packet_fraction * avg
                && num > ctx.settings.low_packet_fraction * avg)
        {
            return false;
        }
        self.set_state(FrameState::Decodable);
        true
    }

    /// Drops the packets of any fragment broken by a sequence number gap, since the decoder
    /// can't use a partial fragment.  Returns the number of bytes removed.
    pub(crate) fn make_decodable(&mut self) -> usize {
        if self.packets.is_empty() {
            return 0;
        }
        let mut keep = vec![true; self.packets.len()];
        let mut i = 0;
        if !self.packets[0].nalu().starts_fragment() {
            let end = self.find_fragment_end(0);
            keep[0..=end].iter_mut().for_each(|k| *k = false);
            i = end;
        }
        let mut prev = i;
        while i < self.packets.len() {
            let in_sequence =
                i == prev || self.packets[prev].seq().wrapping_add(1) == self.packets[i].seq();
            if !self.packets[i].nalu().starts_fragment() && !in_sequence {
                let end = self.find_fragment_end(i);
                keep[i..=end].iter_mut().for_each(|k| *k = false);
                i = end;
            }
            prev = i;
            i += 1;
        }

        let mut removed = 0;
        let mut idx = 0;
        let mut not_decodable = 0;
        self.packets.retain(|p| {
            let k = keep[idx];
            idx += 1;
            if !k {
                removed += p.len();
                not_decodable += 1;
            }
            k
        });
        self.not_decodable_packets += not_decodable;
        self.length -= removed;
        removed
    }

    fn find_fragment_end(&self, start: usize) -> usize {
        if self.packets[start].nalu().ends_fragment() {
            return start;
        }
        for j in start + 1..self.packets.len() {
            let nalu = self.packets[j].nalu();
            if nalu.starts_fragment() {
                return j - 1;
            }
            if nalu == NaluCompleteness::End {
                return j;
            }
        }
        self.packets.len() - 1
    }

    /// Hands the frame's packets to the caller; the slot keeps its metadata until reset.
    pub(crate) fn take_packets(&mut self) -> Vec<Packet> {
        std::mem::replace(&mut self.packets, Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::tests::pk;
    use crate::packet::FrameType::*;

    const MAX: usize = 800;

    #[test]
    fn in_order_completion() {
        let mut f = FrameBuffer::default();
        assert_eq!(f.insert(pk(10, 3000, true, false, Key), MAX), FrameInsert::Incomplete);
        assert_eq!(f.state(), FrameState::Incomplete);
        assert_eq!(f.frame_type(), Key);
        assert_eq!(f.insert(pk(11, 3000, false, false, Key), MAX), FrameInsert::Incomplete);
        assert_eq!(f.insert(pk(12, 3000, false, true, Key), MAX), FrameInsert::Complete);
        assert_eq!(f.state(), FrameState::Complete);
        assert_eq!(f.low_seq(), Some(10));
        assert_eq!(f.high_seq(), Some(12));
        assert_eq!(f.length(), 30);
    }

    #[test]
    fn complete_only_after_every_packet_in_any_order() {
        let seqs: Vec<u16> = vec![65533, 65534, 65535, 0, 1, 2];
        // a handful of fixed permutations, including the marker first and last
        let orders: Vec<Vec<usize>> = vec![
            vec![0, 1, 2, 3, 4, 5],
            vec![5, 4, 3, 2, 1, 0],
            vec![5, 0, 2, 4, 1, 3],
            vec![3, 1, 5, 0, 4, 2],
            vec![2, 5, 1, 0, 3, 4],
        ];
        for order in orders {
            let mut f = FrameBuffer::default();
            for (n, &i) in order.iter().enumerate() {
                let first = i == 0;
                let marker = i == seqs.len() - 1;
                let res = f.insert(pk(seqs[i], 90_000, first, marker, Delta), MAX);
                if n == order.len() - 1 {
                    assert_eq!(res, FrameInsert::Complete, "order {:?}", order);
                } else {
                    assert_eq!(res, FrameInsert::Incomplete, "order {:?}", order);
                    assert!(!f.is_complete());
                }
            }
            let got: Vec<u16> = f.packets().iter().map(|p| p.seq()).collect();
            assert_eq!(got, seqs);
        }
    }

    #[test]
    fn missing_first_packet_is_not_complete() {
        let mut f = FrameBuffer::default();
        f.insert(pk(5, 0, false, false, Delta), MAX);
        assert_eq!(f.insert(pk(6, 0, false, true, Delta), MAX), FrameInsert::Incomplete);
    }

    #[test]
    fn duplicate_and_mismatch() {
        let mut f = FrameBuffer::default();
        f.insert(pk(5, 100, true, false, Delta), MAX);
        assert_eq!(f.insert(pk(5, 100, true, false, Delta), MAX), FrameInsert::Duplicate);
        assert_eq!(f.num_packets(), 1);
        assert_eq!(f.insert(pk(6, 101, false, false, Delta), MAX), FrameInsert::TimestampMismatch);
    }

    #[test]
    fn beyond_marker_rejected() {
        let mut f = FrameBuffer::default();
        f.insert(pk(5, 100, false, true, Delta), MAX);
        assert_eq!(f.insert(pk(6, 100, false, false, Delta), MAX), FrameInsert::Rejected);
        assert_eq!(f.insert(pk(4, 100, true, false, Delta), MAX), FrameInsert::Complete);
    }

    #[test]
    fn complete_frame_takes_no_more_packets() {
        let mut f = FrameBuffer::default();
        f.insert(pk(5, 100, true, true, Delta), MAX);
        assert_eq!(f.insert(pk(4, 100, false, false, Delta), MAX), FrameInsert::Rejected);
        assert_eq!(f.insert(pk(5, 100, true, true, Delta), MAX), FrameInsert::Duplicate);
        assert_eq!(f.num_packets(), 1);
        assert_eq!(f.state(), FrameState::Complete);
    }

    #[test]
    fn too_many_packets() {
        let mut f = FrameBuffer::default();
        f.insert(pk(1, 100, true, false, Delta), 2);
        f.insert(pk(2, 100, false, false, Delta), 2);
        assert_eq!(f.insert(pk(3, 100, false, false, Delta), 2), FrameInsert::Rejected);
    }

    #[test]
    fn empty_packets() {
        let mut f = FrameBuffer::default();
        let empty = |seq| {
            crate::packet::Packet::new(
                seq,
                100,
                false,
                crate::packet::tests::video(false, Delta),
                vec![],
                Instant::now(),
            )
        };
        assert_eq!(f.insert(empty(20), MAX), FrameInsert::Empty);
        assert_eq!(f.state(), FrameState::Empty);
        f.insert(empty(18), MAX);
        f.insert(empty(19), MAX);
        assert_eq!(f.low_seq(), Some(18));
        assert_eq!(f.high_seq(), Some(20));
        assert_eq!(f.insert(pk(17, 100, true, true, Delta), MAX), FrameInsert::Complete);
        assert_eq!(f.low_seq(), Some(17));
        assert_eq!(f.high_seq(), Some(20));
    }

    #[test]
    fn decodable_heuristics() {
        let settings = DecodableSettings::default();
        let ctx = |rtt_ms, avg| DecodableContext {
            rtt_ms,
            avg_packets_per_frame: avg,
            settings: &settings,
        };
        let mut f = FrameBuffer::default();
        f.insert(pk(1, 100, true, false, Delta), MAX);
        f.insert(pk(2, 100, false, false, Delta), MAX);
        f.insert(pk(4, 100, false, true, Delta), MAX);
        // low RTT: wait for the retransmission instead
        assert!(!f.update_decodable(&ctx(50, 4.0)));
        // 3 packets against an average of 10 is suspiciously few
        assert!(!f.update_decodable(&ctx(200, 10.0)));
        assert!(f.update_decodable(&ctx(200, 3.0)));
        assert_eq!(f.state(), FrameState::Decodable);

        let mut key = FrameBuffer::default();
        key.insert(pk(1, 100, true, false, Key), MAX);
        key.insert(pk(3, 100, false, true, Key), MAX);
        assert!(!key.update_decodable(&ctx(200, 2.0)));
    }

    #[test]
    fn make_decodable_drops_broken_fragment() {
        // 1(start) 2 3(end) with packet 2 lost: the tail of the fragment goes
        let mut f = FrameBuffer::default();
        f.insert(pk(1, 100, true, false, Delta), MAX);
        f.insert(pk(3, 100, false, true, Delta), MAX);
        assert_eq!(f.make_decodable(), 10);
        assert_eq!(f.num_packets(), 1);
        assert_eq!(f.not_decodable_packets(), 1);

        let mut g = FrameBuffer::default();
        g.insert(pk(11, 200, false, false, Delta), MAX);
        g.insert(pk(12, 200, false, true, Delta), MAX);
        // no first packet: the leading fragment can't be decoded
        assert_eq!(g.make_decodable(), 20);
        assert_eq!(g.num_packets(), 0);
        assert_eq!(g.not_decodable_packets(), 2);
        assert_eq!(g.length(), 0);
    }
}
