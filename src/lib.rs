//! Receive side of an RTP video stream: reassembles packets into frames, tracks which sequence
//! numbers need retransmitting, recovers losses from
//! [RED](https://tools.ietf.org/html/rfc2198)-encapsulated
//! [ULPFEC](https://tools.ietf.org/html/rfc5109) data, and hands frames to a decoder thread in
//! timestamp order once they are complete (or once waiting any longer is pointless).
//!
//! The network thread feeds datagrams to a [`VideoReceiver`](struct.VideoReceiver.html), while
//! the decoder thread blocks in
//! [`JitterBuffer::get_complete_frame_for_decoding()`](struct.JitterBuffer.html#method.get_complete_frame_for_decoding),
//! returning each frame with `release_frame()` once done with it.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms, future_incompatible)]

mod config;
mod decoding_state;
pub mod fec;
mod frame_buffer;
mod frame_pool;
mod jitter_buffer;
mod jitter_estimator;
mod nack;
mod packet;
mod receiver;
pub mod seq;
pub mod ulpfec;

pub use crate::config::{DecodableSettings, JitterBufferConfig, JitterEstimatorConfig, NackMode};
pub use crate::frame_pool::FrameHandle;
pub use crate::jitter_buffer::{EncodedFrame, GetFrameError, InsertOutcome, JitterBuffer};
pub use crate::packet::{
    FrameType, GenericPayloadParser, NaluCompleteness, Packet, PacketError, ParsedPayload,
    PayloadParser, VideoHeader,
};
pub use crate::receiver::{ReceiveError, ReceiveStatistics, VideoReceiver};

/// Accepts RTP packets coming out of the FEC stage.
pub trait Receiver {
    fn receive(&mut self, packets: impl Iterator<Item = (Vec<u8>, PacketStatus)>);
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum PacketStatus {
    /// The packet was received from the network
    Received,
    /// The packet was rebuilt from FEC data
    Recovered,
}
