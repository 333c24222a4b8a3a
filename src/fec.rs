//! Unwraps RED (RFC 2198) encapsulated packets into their media and FEC parts, and runs FEC
//! recovery over what was received.
//!
//! Media found inside RED packets is handed straight to the `Receiver` as `Received`; packets
//! rebuilt by the `FecDecoder` follow as `Recovered` once the frame they belong to looks complete.
//! Either way, what the receiver sees is a plain RTP datagram.

use crate::packet::{rtp_payload_bounds, PacketError, RtpHeaderMut};
use crate::seq;
use crate::{PacketStatus, Receiver};
use arrayvec::ArrayVec;
use rtp_rs::RtpReader;
use std::fmt;

/// RED header of a block that is followed by another block
const RED_HEADER_LEN_MULTI: usize = 4;
/// RED header of the final block
const RED_HEADER_LEN_LAST: usize = 1;

#[derive(Debug)]
pub enum FecError {
    /// A RED packet arrived before `set_fec_payload_type()`
    FecPayloadTypeNotConfigured,
    Packet(PacketError),
    /// The RED header claims more bytes than the packet holds
    Truncated { needed: usize, available: usize },
    /// Only redundancy for the same timestamp is supported
    TimestampOffset(u16),
    /// At most one media block plus one FEC block is supported
    TooManyBlocks,
    BlockLengthTooLarge { block_length: usize, available: usize },
    MalformedFecHeader(&'static str),
    /// The FEC data did not yield a plausible packet
    RecoveryFailed { seq: u16 },
}
impl From<PacketError> for FecError {
    fn from(v: PacketError) -> Self {
        FecError::Packet(v)
    }
}
impl fmt::Display for FecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FecError::FecPayloadTypeNotConfigured => write!(f, "FEC payload type not configured"),
            FecError::Packet(e) => write!(f, "{}", e),
            FecError::Truncated { needed, available } => write!(
                f,
                "RED packet truncated: needed {} bytes, only {} available",
                needed, available
            ),
            FecError::TimestampOffset(o) => write!(f, "unsupported RED timestamp offset {}", o),
            FecError::TooManyBlocks => write!(f, "more than two RED blocks"),
            FecError::BlockLengthTooLarge {
                block_length,
                available,
            } => write!(
                f,
                "RED block length {} exceeds the {} bytes available",
                block_length, available
            ),
            FecError::MalformedFecHeader(reason) => write!(f, "malformed FEC header: {}", reason),
            FecError::RecoveryFailed { seq } => write!(f, "recovery of seq {} failed", seq),
        }
    }
}
impl std::error::Error for FecError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FecError::Packet(e) => Some(e),
            _ => None,
        }
    }
}

/// A media or FEC packet queued for the FEC decoder.
#[derive(Debug, Clone)]
pub struct ReceivedPacket {
    pub is_fec: bool,
    pub seq: u16,
    /// SSRC of the protected stream
    pub ssrc: u32,
    /// A whole RTP packet for media; for FEC, the FEC header and payload
    pub data: Vec<u8>,
}

/// A media packet known to the FEC decoder, either received or rebuilt from FEC data.
#[derive(Debug, Clone)]
pub struct RecoveredPacket {
    pub seq: u16,
    /// `false` for packets that arrived normally
    pub was_recovered: bool,
    /// Already passed on to the receiver
    pub returned: bool,
    /// A whole RTP packet
    pub data: Vec<u8>,
}

/// The XOR recovery scheme itself.
pub trait FecDecoder {
    /// Consumes `received`, adding received media to `recovered` and rebuilding any protected
    /// packets that the FEC data allows.  Packets far behind `last_fec_seq` may be forgotten.
    ///
    /// A decoder may clear `frame_complete` to hold recovered packets back until more of their
    /// frame has arrived, and must set it again once they can be released.
    fn decode(
        &mut self,
        received: &mut Vec<ReceivedPacket>,
        recovered: &mut Vec<RecoveredPacket>,
        last_fec_seq: u16,
        frame_complete: &mut bool,
    ) -> Result<(), FecError>;

    fn reset(&mut self);
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FecStatistics {
    pub red_packets: u64,
    pub fec_packets: u64,
    pub malformed_packets: u64,
    pub recovered_packets: u64,
    /// recovered packets that turned out not to be valid RTP
    pub recovered_parse_failures: u64,
}

pub struct ReceiverFec<D: FecDecoder> {
    decoder: D,
    fec_payload_type: Option<u8>,
    received: Vec<ReceivedPacket>,
    recovered: Vec<RecoveredPacket>,
    last_fec_seq: Option<u16>,
    frame_complete: bool,
    stats: FecStatistics,
}

impl<D: FecDecoder> ReceiverFec<D> {
    pub fn new(decoder: D) -> ReceiverFec<D> {
        ReceiverFec {
            decoder,
            fec_payload_type: None,
            received: Vec::new(),
            recovered: Vec::new(),
            last_fec_seq: None,
            frame_complete: true,
            stats: FecStatistics::default(),
        }
    }

    pub fn set_fec_payload_type(&mut self, payload_type: u8) {
        self.fec_payload_type = Some(payload_type);
    }

    pub fn statistics(&self) -> &FecStatistics {
        &self.stats
    }

    pub fn reset(&mut self) {
        self.received.clear();
        self.recovered.clear();
        self.last_fec_seq = None;
        self.frame_complete = true;
        self.decoder.reset();
    }

    /// Splits the RED packet `rtp` into its blocks.  Media is passed to `recv` immediately, and
    /// both media and FEC are queued for `process_received_fec()`.  Returns `true` if the packet
    /// carried FEC data.
    ///
    /// Malformed packets are counted and reported as errors; they never disturb what was queued
    /// before.
    pub fn add_received_red_packet<R: Receiver>(
        &mut self,
        rtp: &[u8],
        recv: &mut R,
    ) -> Result<bool, FecError> {
        let fec_payload_type = self
            .fec_payload_type
            .ok_or(FecError::FecPayloadTypeNotConfigured)?;
        self.stats.red_packets += 1;
        let blocks = match split_red(rtp, fec_payload_type) {
            Ok(blocks) => blocks,
            Err(e) => {
                self.stats.malformed_packets += 1;
                log::warn!("dropping malformed RED packet: {}", e);
                return Err(e);
            }
        };
        let mut is_fec = false;
        for block in blocks {
            if block.data.is_empty() {
                continue;
            }
            if block.is_fec {
                is_fec = true;
                self.stats.fec_packets += 1;
                self.last_fec_seq = Some(match self.last_fec_seq {
                    Some(last) => seq::latest_sequence_number(block.seq, last),
                    None => block.seq,
                });
            } else {
                recv.receive(std::iter::once((block.data.clone(), PacketStatus::Received)));
            }
            self.received.push(block);
        }
        Ok(is_fec)
    }

    /// Runs the decoder over everything queued, and passes newly recovered packets to `recv`
    /// unless the decoder is holding them back (which `force_frame_decode` overrides).
    pub fn process_received_fec<R: Receiver>(
        &mut self,
        force_frame_decode: bool,
        recv: &mut R,
    ) -> Result<(), FecError> {
        let mut res = Ok(());
        if !self.received.is_empty() {
            let last_fec_seq = self.last_fec_seq.unwrap_or(0);
            res = self.decoder.decode(
                &mut self.received,
                &mut self.recovered,
                last_fec_seq,
                &mut self.frame_complete,
            );
            self.received.clear();
            if let Err(ref e) = res {
                self.stats.malformed_packets += 1;
                log::warn!("FEC decode failed: {}", e);
            }
        }
        // packets recovered before a decode error are still good
        if !(force_frame_decode || self.frame_complete) {
            return res;
        }
        let stats = &mut self.stats;
        let mut ready = Vec::new();
        for pk in self.recovered.iter_mut().filter(|p| !p.returned) {
            pk.returned = true;
            if let Err(e) = RtpReader::new(&pk.data[..]) {
                stats.recovered_parse_failures += 1;
                log::warn!("recovered packet seq {} is not valid RTP: {:?}", pk.seq, e);
                continue;
            }
            stats.recovered_packets += 1;
            log::debug!("recovered seq {}", pk.seq);
            ready.push((pk.data.clone(), PacketStatus::Recovered));
        }
        if !ready.is_empty() {
            recv.receive(ready.into_iter());
        }
        res
    }
}

/// Splits a RED packet into at most two blocks: a media block, rebuilt into a standalone RTP
/// packet, and a trailing FEC block.
fn split_red(
    rtp: &[u8],
    fec_payload_type: u8,
) -> Result<ArrayVec<[ReceivedPacket; 2]>, FecError> {
    let (header_len, payload_end) = rtp_payload_bounds(rtp)?;
    let reader = RtpReader::new(rtp).map_err(|e| PacketError::InvalidRtpHeader(format!("{:?}", e)))?;
    let seq: u16 = reader.sequence_number().into();
    let ssrc = reader.ssrc();
    let payload = &rtp[header_len..payload_end];
    if payload.is_empty() {
        return Err(FecError::Truncated {
            needed: RED_HEADER_LEN_LAST,
            available: 0,
        });
    }
    let block_payload_type = payload[0] & 0x7f;
    let mut blocks = ArrayVec::new();

    if payload[0] & 0x80 == 0 {
        // a single block
        let data = &payload[RED_HEADER_LEN_LAST..];
        let block = if block_payload_type == fec_payload_type {
            ReceivedPacket {
                is_fec: true,
                seq,
                ssrc,
                data: data.to_vec(),
            }
        } else {
            ReceivedPacket {
                is_fec: false,
                seq,
                ssrc,
                data: media_packet(&rtp[..header_len], block_payload_type, data),
            }
        };
        blocks.push(block);
        return Ok(blocks);
    }

    if payload.len() < RED_HEADER_LEN_MULTI + RED_HEADER_LEN_LAST {
        return Err(FecError::Truncated {
            needed: RED_HEADER_LEN_MULTI + RED_HEADER_LEN_LAST,
            available: payload.len(),
        });
    }
    let timestamp_offset = (u16::from(payload[1]) << 8 | u16::from(payload[2])) >> 2;
    if timestamp_offset != 0 {
        return Err(FecError::TimestampOffset(timestamp_offset));
    }
    let block_length = usize::from(payload[2] & 0b11) << 8 | usize::from(payload[3]);
    if payload[RED_HEADER_LEN_MULTI] & 0x80 != 0 {
        return Err(FecError::TooManyBlocks);
    }
    let available = payload.len() - RED_HEADER_LEN_MULTI - RED_HEADER_LEN_LAST;
    if block_length > available {
        return Err(FecError::BlockLengthTooLarge {
            block_length,
            available,
        });
    }
    let body = &payload[RED_HEADER_LEN_MULTI + RED_HEADER_LEN_LAST..];
    let (first, second) = body.split_at(block_length);
    if block_length > 0 {
        blocks.push(ReceivedPacket {
            is_fec: false,
            seq,
            ssrc,
            data: media_packet(&rtp[..header_len], block_payload_type, first),
        });
    }
    // the final block is taken to be FEC, whatever payload type it names
    blocks.push(ReceivedPacket {
        is_fec: true,
        seq,
        ssrc,
        data: second.to_vec(),
    });
    Ok(blocks)
}

/// Copies the RTP header of the RED packet, with its payload type replaced by that of the
/// media block, followed by the block itself.
fn media_packet(header: &[u8], payload_type: u8, data: &[u8]) -> Vec<u8> {
    let mut pk = Vec::with_capacity(header.len() + data.len());
    pk.extend_from_slice(header);
    {
        let mut rtp = RtpHeaderMut::new(&mut pk[..]);
        rtp.set_payload_type(payload_type);
        // any padding stayed behind in the RED packet
        rtp.clear_padding();
    }
    pk.extend_from_slice(data);
    pk
}
