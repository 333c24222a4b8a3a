//! The receive path: RTP datagrams in, packets inserted into the jitter buffer.

use crate::fec::{FecDecoder, FecError, FecStatistics, ReceiverFec};
use crate::jitter_buffer::{GetFrameError, InsertOutcome, JitterBuffer};
use crate::packet::{Packet, PacketError, PayloadParser};
use crate::ulpfec::UlpfecDecoder;
use crate::{PacketStatus, Receiver};
use rtp_rs::RtpReader;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug)]
pub enum ReceiveError {
    Packet(PacketError),
    Fec(FecError),
}
impl From<PacketError> for ReceiveError {
    fn from(v: PacketError) -> Self {
        ReceiveError::Packet(v)
    }
}
impl From<FecError> for ReceiveError {
    fn from(v: FecError) -> Self {
        ReceiveError::Fec(v)
    }
}
impl fmt::Display for ReceiveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReceiveError::Packet(e) => write!(f, "{}", e),
            ReceiveError::Fec(e) => write!(f, "{}", e),
        }
    }
}
impl std::error::Error for ReceiveError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ReceiveError::Packet(e) => Some(e),
            ReceiveError::Fec(e) => Some(e),
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReceiveStatistics {
    pub inserted: u64,
    pub old: u64,
    pub duplicate: u64,
    pub complete: u64,
    pub decodable: u64,
    pub discarded: u64,
    pub rejected: u64,
    /// packets that could not be parsed, whether from the wire or from FEC
    pub malformed: u64,
    pub recovered: u64,
    /// times the jitter buffer had to be flushed
    pub flushes: u64,
    /// packets that arrived while the jitter buffer was stopped
    pub not_running: u64,
}
impl ReceiveStatistics {
    fn record(&mut self, outcome: InsertOutcome) {
        match outcome {
            InsertOutcome::Inserted => self.inserted += 1,
            InsertOutcome::OldPacket => self.old += 1,
            InsertOutcome::DuplicatePacket => self.duplicate += 1,
            InsertOutcome::Complete => self.complete += 1,
            InsertOutcome::Decodable => self.decodable += 1,
            InsertOutcome::FrameDiscarded => self.discarded += 1,
            InsertOutcome::Rejected => self.rejected += 1,
        }
    }
}

/// Parses each RTP packet handed to it and inserts the result into the jitter buffer.
struct Inserter<'a> {
    jitter_buffer: &'a JitterBuffer,
    parser: &'a dyn PayloadParser,
    arrival: Instant,
    stats: &'a mut ReceiveStatistics,
    request_key_frame: &'a mut bool,
}
impl Inserter<'_> {
    fn insert(&mut self, packet: Packet) {
        match self.jitter_buffer.insert(packet) {
            Ok(outcome) => {
                log::trace!("inserted: {:?}", outcome);
                self.stats.record(outcome)
            }
            Err(GetFrameError::FlushRequired) => {
                log::warn!("jitter buffer full of key frames, flushing");
                self.jitter_buffer.flush();
                self.stats.flushes += 1;
                *self.request_key_frame = true;
            }
            Err(GetFrameError::Flushed) => {
                log::debug!("jitter buffer flushed itself; requesting key frame");
                self.stats.flushes += 1;
                *self.request_key_frame = true;
            }
            Err(GetFrameError::NotRunning) => self.stats.not_running += 1,
            Err(GetFrameError::OldPacket) => self.stats.old += 1,
        }
    }
}
impl Receiver for Inserter<'_> {
    fn receive(&mut self, packets: impl Iterator<Item = (Vec<u8>, PacketStatus)>) {
        for (rtp, status) in packets {
            match Packet::parse(&rtp[..], self.arrival, self.parser) {
                Ok(packet) => {
                    if status == PacketStatus::Recovered {
                        self.stats.recovered += 1;
                    }
                    self.insert(packet)
                }
                Err(e) => {
                    self.stats.malformed += 1;
                    log::warn!("dropping {:?} packet: {}", status, e);
                }
            }
        }
    }
}

/// Feeds RTP datagrams for one video stream into a `JitterBuffer`, unwrapping RED and
/// recovering lost packets from FEC on the way.
///
/// ```no_run
/// # use rtp_video_jitter::*;
/// # use std::sync::Arc;
/// # use std::time::Instant;
/// let jb = Arc::new(JitterBuffer::new(JitterBufferConfig::default()));
/// jb.start();
/// let mut receiver = VideoReceiver::new(jb.clone(), GenericPayloadParser);
/// receiver.set_red_payload_type(100);
/// receiver.set_fec_payload_type(127);
/// # let datagram = [0u8; 0];
/// if let Err(e) = receiver.on_rtp_packet(&datagram[..], Instant::now()) {
///     eprintln!("dropped: {}", e);
/// }
/// ```
pub struct VideoReceiver<P: PayloadParser, D: FecDecoder = UlpfecDecoder> {
    jitter_buffer: Arc<JitterBuffer>,
    parser: P,
    red_payload_type: Option<u8>,
    fec: ReceiverFec<D>,
    stats: ReceiveStatistics,
    request_key_frame: bool,
}

impl<P: PayloadParser> VideoReceiver<P, UlpfecDecoder> {
    pub fn new(jitter_buffer: Arc<JitterBuffer>, parser: P) -> Self {
        Self::with_fec_decoder(jitter_buffer, parser, UlpfecDecoder::default())
    }
}

impl<P: PayloadParser, D: FecDecoder> VideoReceiver<P, D> {
    pub fn with_fec_decoder(jitter_buffer: Arc<JitterBuffer>, parser: P, decoder: D) -> Self {
        VideoReceiver {
            jitter_buffer,
            parser,
            red_payload_type: None,
            fec: ReceiverFec::new(decoder),
            stats: ReceiveStatistics::default(),
            request_key_frame: false,
        }
    }

    /// Packets with this payload type are treated as RED.  Without it, every packet is taken to
    /// be plain media.
    pub fn set_red_payload_type(&mut self, payload_type: u8) {
        self.red_payload_type = Some(payload_type);
    }

    pub fn set_fec_payload_type(&mut self, payload_type: u8) {
        self.fec.set_fec_payload_type(payload_type);
    }

    pub fn jitter_buffer(&self) -> &Arc<JitterBuffer> {
        &self.jitter_buffer
    }

    pub fn statistics(&self) -> &ReceiveStatistics {
        &self.stats
    }

    pub fn fec_statistics(&self) -> &FecStatistics {
        self.fec.statistics()
    }

    /// `true` if the jitter buffer was flushed since the last call, so the sender should be
    /// asked for a key frame.
    pub fn request_key_frame(&mut self) -> bool {
        std::mem::replace(&mut self.request_key_frame, false)
    }

    /// Handles one RTP datagram.  An `Err` means the packet was malformed and has been dropped
    /// (and counted); the receiver remains usable either way.
    pub fn on_rtp_packet(&mut self, rtp: &[u8], arrival: Instant) -> Result<(), ReceiveError> {
        let payload_type = match RtpReader::new(rtp) {
            Ok(reader) => reader.payload_type(),
            Err(e) => {
                self.stats.malformed += 1;
                return Err(PacketError::InvalidRtpHeader(format!("{:?}", e)).into());
            }
        };
        let mut inserter = Inserter {
            jitter_buffer: &self.jitter_buffer,
            parser: &self.parser,
            arrival,
            stats: &mut self.stats,
            request_key_frame: &mut self.request_key_frame,
        };
        if Some(payload_type) == self.red_payload_type {
            let res = match self.fec.add_received_red_packet(rtp, &mut inserter) {
                Ok(_) => self.fec.process_received_fec(false, &mut inserter),
                Err(e) => Err(e),
            };
            match res {
                Err(FecError::FecPayloadTypeNotConfigured) => (),
                Err(_) => inserter.stats.malformed += 1,
                Ok(()) => (),
            }
            Ok(res?)
        } else {
            match Packet::parse(rtp, arrival, &self.parser) {
                Ok(packet) => {
                    inserter.insert(packet);
                    Ok(())
                }
                Err(e) => {
                    inserter.stats.malformed += 1;
                    Err(e.into())
                }
            }
        }
    }

    /// Forgets all FEC state, for example after the stream's SSRC changes.
    pub fn reset_fec(&mut self) {
        self.fec.reset();
    }
}
