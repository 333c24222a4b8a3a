//! What has already been handed to the decoder, and therefore what incoming data is too late to
//! be of use.

use crate::frame_buffer::FrameBuffer;
use crate::packet::Packet;
use crate::seq;

/// How a packet relates to the last frame handed to the decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketAge {
    /// belongs to a frame older than the last decoded one
    Old,
    /// belongs to the frame that was last decoded
    Duplicate,
    Future,
}

#[derive(Debug, Default, Clone)]
pub struct DecodingState {
    /// `None` until the first frame is decoded
    last: Option<Last>,
}

#[derive(Debug, Clone, Copy)]
struct Last {
    seq: u16,
    timestamp: u32,
}

impl DecodingState {
    pub fn in_initial_state(&self) -> bool {
        self.last.is_none()
    }

    pub fn time_stamp(&self) -> Option<u32> {
        self.last.map(|l| l.timestamp)
    }

    pub fn sequence_num(&self) -> Option<u16> {
        self.last.map(|l| l.seq)
    }

    pub fn reset(&mut self) {
        self.last = None;
    }

    /// Records `frame` as the most recently decoded one.
    pub fn set_state(&mut self, frame: &FrameBuffer) {
        if let Some(seq) = frame.high_seq() {
            self.last = Some(Last {
                seq,
                timestamp: frame.timestamp(),
            });
        }
    }

    /// Positions the state just before `frame`, so that `frame` becomes the continuous next one.
    pub fn set_state_one_back(&mut self, frame: &FrameBuffer) {
        if let Some(seq) = frame.low_seq() {
            self.last = Some(Last {
                seq: seq.wrapping_sub(1),
                timestamp: frame.timestamp().wrapping_sub(1),
            });
        }
    }

    /// A frame is old if its timestamp is not newer than the last decoded one.
    pub fn is_old_frame(&self, frame: &FrameBuffer) -> bool {
        self.is_old_timestamp(frame.timestamp())
    }

    pub fn is_old_packet(&self, packet: &Packet) -> bool {
        self.is_old_timestamp(packet.timestamp())
    }

    fn is_old_timestamp(&self, timestamp: u32) -> bool {
        match self.last {
            None => false,
            Some(last) => !seq::is_newer_timestamp(timestamp, last.timestamp),
        }
    }

    pub fn classify(&self, packet: &Packet) -> PacketAge {
        match self.last {
            Some(last) if packet.timestamp() == last.timestamp => PacketAge::Duplicate,
            Some(last) if !seq::is_newer_timestamp(packet.timestamp(), last.timestamp) => {
                PacketAge::Old
            }
            _ => PacketAge::Future,
        }
    }

    /// A late packet of the last decoded frame may still move the sequence number on, so that
    /// the next frame is recognised as continuous.
    pub fn update_old_packet(&mut self, packet: &Packet) {
        if let Some(ref mut last) = self.last {
            if packet.timestamp() == last.timestamp {
                last.seq = seq::latest_sequence_number(packet.seq(), last.seq);
            }
        }
    }

    /// Moves past an empty frame that directly follows the decoded state.
    pub fn update_empty_frame(&mut self, frame: &FrameBuffer) {
        if self.continuous_frame(frame) {
            self.set_state(frame);
        }
    }

    /// `true` if decoding `frame` next would not skip any packets.  Before anything has been
    /// decoded, only a key frame qualifies.
    pub fn continuous_frame(&self, frame: &FrameBuffer) -> bool {
        match self.last {
            None => frame.is_key_frame(),
            Some(last) => frame.low_seq() == Some(last.seq.wrapping_add(1)),
        }
    }
}
