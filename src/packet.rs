//! The unit of media that flows into the jitter buffer, and the helpers that build it from an RTP
//! datagram.

use rtp_rs::RtpReader;
use std::fmt;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    /// Independently decodable
    Key,
    /// Depends on previously decoded frames
    Delta,
    /// Zero-length packet (padding, or a placeholder left by FEC); carries no media
    Empty,
}

/// How a packet relates to the codec fragment (NAL unit, partition) it carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NaluCompleteness {
    /// The packet carries a whole fragment
    Complete,
    /// The packet starts a fragment that continues in later packets
    Start,
    /// Neither the start nor the end of a fragment
    Incomplete,
    /// The packet ends a fragment started in earlier packets
    End,
}
impl NaluCompleteness {
    fn from_flags(is_first_packet: bool, marker: bool) -> NaluCompleteness {
        match (is_first_packet, marker) {
            (true, true) => NaluCompleteness::Complete,
            (true, false) => NaluCompleteness::Start,
            (false, true) => NaluCompleteness::End,
            (false, false) => NaluCompleteness::Incomplete,
        }
    }

    pub(crate) fn starts_fragment(self) -> bool {
        self == NaluCompleteness::Complete || self == NaluCompleteness::Start
    }

    pub(crate) fn ends_fragment(self) -> bool {
        self == NaluCompleteness::Complete || self == NaluCompleteness::End
    }
}

/// Per-packet metadata produced by the codec-specific payload parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoHeader {
    pub is_first_packet: bool,
    pub frame_type: FrameType,
}

#[derive(Debug)]
pub struct ParsedPayload<'a> {
    pub video: VideoHeader,
    /// the media bytes, with any payload descriptor removed
    pub data: &'a [u8],
}

/// Extracts frame-level metadata from an RTP payload.  The bitstream itself is opaque to this
/// crate; implementations only need to say whether the payload begins a frame, and whether that
/// frame is a key frame.
pub trait PayloadParser {
    fn parse<'a>(&self, payload: &'a [u8]) -> Result<ParsedPayload<'a>, PacketError>;
}

/// The generic video payload format: a single descriptor byte, where bit 0 flags a key frame
/// and bit 1 flags the first packet of a frame.
#[derive(Debug, Default, Clone, Copy)]
pub struct GenericPayloadParser;
impl GenericPayloadParser {
    pub const KEY_FRAME_BIT: u8 = 0b0000_0001;
    pub const FIRST_PACKET_BIT: u8 = 0b0000_0010;
}
impl PayloadParser for GenericPayloadParser {
    fn parse<'a>(&self, payload: &'a [u8]) -> Result<ParsedPayload<'a>, PacketError> {
        let (descriptor, data) = payload
            .split_first()
            .ok_or(PacketError::MissingPayloadDescriptor)?;
        let frame_type = if data.is_empty() {
            FrameType::Empty
        } else if descriptor & Self::KEY_FRAME_BIT != 0 {
            FrameType::Key
        } else {
            FrameType::Delta
        };
        Ok(ParsedPayload {
            video: VideoHeader {
                is_first_packet: descriptor & Self::FIRST_PACKET_BIT != 0,
                frame_type,
            },
            data,
        })
    }
}

#[derive(Debug)]
pub enum PacketError {
    /// The RTP header could not be parsed
    InvalidRtpHeader(String),
    /// CSRC list, header extension or padding claim more bytes than the datagram holds
    Truncated { needed: usize, available: usize },
    /// The payload was too short to contain the codec payload descriptor
    MissingPayloadDescriptor,
    /// The codec payload descriptor was present but invalid
    MalformedPayloadDescriptor,
}
impl fmt::Display for PacketError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketError::InvalidRtpHeader(e) => write!(f, "invalid RTP header: {}", e),
            PacketError::Truncated { needed, available } => write!(
                f,
                "RTP packet truncated: needed {} bytes, only {} available",
                needed, available
            ),
            PacketError::MissingPayloadDescriptor => write!(f, "missing payload descriptor"),
            PacketError::MalformedPayloadDescriptor => write!(f, "malformed payload descriptor"),
        }
    }
}
impl std::error::Error for PacketError {}

/// Byte offsets of the payload within an RTP datagram: `(header_len, payload_end)`, so that the
/// payload is `buf[header_len..payload_end]` and anything after `payload_end` is padding.
pub(crate) fn rtp_payload_bounds(buf: &[u8]) -> Result<(usize, usize), PacketError> {
    RtpReader::new(buf).map_err(|e| PacketError::InvalidRtpHeader(format!("{:?}", e)))?;
    let csrc_count = usize::from(buf[0] & 0b0000_1111);
    let mut header_len = RtpReader::MIN_HEADER_LEN + 4 * csrc_count;
    if buf[0] & 0b0001_0000 != 0 {
        // 2 bytes 'defined by profile', 2 bytes length in 32-bit words
        if buf.len() < header_len + 4 {
            return Err(PacketError::Truncated {
                needed: header_len + 4,
                available: buf.len(),
            });
        }
        let words = usize::from(buf[header_len + 2]) << 8 | usize::from(buf[header_len + 3]);
        header_len += 4 + 4 * words;
    }
    let padding = if buf[0] & 0b0010_0000 != 0 {
        usize::from(buf[buf.len() - 1])
    } else {
        0
    };
    if buf.len() < header_len + padding {
        return Err(PacketError::Truncated {
            needed: header_len + padding,
            available: buf.len(),
        });
    }
    Ok((header_len, buf.len() - padding))
}

/// A single received (or recovered) media packet.  Immutable once built; ownership moves into
/// the frame buffer it belongs to.
#[derive(Debug, Clone)]
pub struct Packet {
    seq: u16,
    timestamp: u32,
    ssrc: u32,
    payload_type: u8,
    marker: bool,
    is_first_packet: bool,
    frame_type: FrameType,
    nalu: NaluCompleteness,
    arrival: Instant,
    retransmitted: bool,
    payload: Vec<u8>,
}
impl Packet {
    pub fn new(
        seq: u16,
        timestamp: u32,
        marker: bool,
        video: VideoHeader,
        payload: Vec<u8>,
        arrival: Instant,
    ) -> Packet {
        let frame_type = if payload.is_empty() {
            FrameType::Empty
        } else {
            video.frame_type
        };
        Packet {
            seq,
            timestamp,
            ssrc: 0,
            payload_type: 0,
            marker,
            is_first_packet: video.is_first_packet,
            frame_type,
            nalu: NaluCompleteness::from_flags(video.is_first_packet, marker),
            arrival,
            retransmitted: false,
            payload,
        }
    }

    /// Builds a packet from a complete RTP datagram, using `parser` to interpret the codec
    /// payload descriptor.
    pub fn parse(
        rtp: &[u8],
        arrival: Instant,
        parser: &dyn PayloadParser,
    ) -> Result<Packet, PacketError> {
        let (header_len, payload_end) = rtp_payload_bounds(rtp)?;
        let reader =
            RtpReader::new(rtp).map_err(|e| PacketError::InvalidRtpHeader(format!("{:?}", e)))?;
        let payload = &rtp[header_len..payload_end];
        let (video, data) = if payload.is_empty() {
            // padding-only packet; there is no descriptor to parse
            let video = VideoHeader {
                is_first_packet: false,
                frame_type: FrameType::Empty,
            };
            (video, payload)
        } else {
            let parsed = parser.parse(payload)?;
            (parsed.video, parsed.data)
        };
        Ok(Packet::new(
            reader.sequence_number().into(),
            reader.timestamp(),
            reader.mark(),
            video,
            data.to_vec(),
            arrival,
        )
        .with_ssrc(reader.ssrc())
        .with_payload_type(reader.payload_type()))
    }

    pub fn with_ssrc(mut self, ssrc: u32) -> Packet {
        self.ssrc = ssrc;
        self
    }

    pub fn with_payload_type(mut self, payload_type: u8) -> Packet {
        self.payload_type = payload_type;
        self
    }

    pub fn with_retransmitted(mut self, retransmitted: bool) -> Packet {
        self.retransmitted = retransmitted;
        self
    }

    pub fn seq(&self) -> u16 {
        self.seq
    }
    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }
    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }
    pub fn payload_type(&self) -> u8 {
        self.payload_type
    }
    pub fn marker(&self) -> bool {
        self.marker
    }
    pub fn is_first_packet(&self) -> bool {
        self.is_first_packet
    }
    pub fn frame_type(&self) -> FrameType {
        self.frame_type
    }
    pub fn nalu(&self) -> NaluCompleteness {
        self.nalu
    }
    pub fn arrival(&self) -> Instant {
        self.arrival
    }
    pub fn retransmitted(&self) -> bool {
        self.retransmitted
    }
    pub fn payload(&self) -> &[u8] {
        &self.payload[..]
    }
    pub fn len(&self) -> usize {
        self.payload.len()
    }
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// In-place editing of the fixed 12-byte part of an RTP header.
pub(crate) struct RtpHeaderMut<'buf>(&'buf mut [u8]);
impl RtpHeaderMut<'_> {
    pub(crate) fn new(buf: &mut [u8]) -> RtpHeaderMut<'_> {
        assert!(buf.len() >= RtpReader::MIN_HEADER_LEN);
        RtpHeaderMut(buf)
    }
    pub(crate) fn set_version(&mut self, v: u8) {
        assert!(v <= 0b11);
        self.0[0] = self.0[0] & 0b0011_1111 | (v << 6);
    }
    pub(crate) fn clear_padding(&mut self) {
        self.0[0] &= 0b1101_1111;
    }
    pub(crate) fn set_payload_type(&mut self, pt: u8) {
        assert!(pt <= 0b0111_1111);
        self.0[1] = self.0[1] & 0b1000_0000 | pt;
    }
    pub(crate) fn set_sequence(&mut self, seq: u16) {
        self.0[2..4].copy_from_slice(&seq.to_be_bytes());
    }
    pub(crate) fn set_timestamp(&mut self, ts: u32) {
        self.0[4..8].copy_from_slice(&ts.to_be_bytes());
    }
    pub(crate) fn set_ssrc(&mut self, ssrc: u32) {
        self.0[8..12].copy_from_slice(&ssrc.to_be_bytes());
    }
}
