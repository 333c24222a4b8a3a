//! XOR parity recovery of lost media packets, using the generic FEC format of RFC 5109 at
//! protection level 0.
//!
//! Each FEC packet protects the media packets whose sequence numbers are selected by its mask.
//! If exactly one of those is missing, it is the XOR of the FEC packet with all the others.

use crate::fec::{FecDecoder, FecError, ReceivedPacket, RecoveredPacket};
use crate::packet::RtpHeaderMut;
use crate::seq::is_newer_sequence_number;
use rtp_rs::{RtpReader, Seq};

const FEC_HEADER_LEN: usize = 10;
const LEVEL_HEADER_LEN_SHORT_MASK: usize = 4;
const LEVEL_HEADER_LEN_LONG_MASK: usize = 8;
const RTP_HEADER_LEN: usize = 12;

/// Media packets further than this behind the latest FEC packet are forgotten
const OLD_SEQUENCE_THRESHOLD: u16 = 0x3fff;
/// Largest number of media packets a single FEC packet can protect
pub const MAX_MEDIA_PACKETS: usize = 48;
const MAX_FEC_PACKETS: usize = MAX_MEDIA_PACKETS;
const MAX_TRACKED_MEDIA_PACKETS: usize = MAX_MEDIA_PACKETS * 2;

/// The parsed form of the FEC header plus the level 0 header.
#[derive(Debug)]
struct FecPacket {
    seq: u16,
    ssrc: u32,
    protected: Vec<u16>,
    /// P, X, CC and M, PT recovery bits
    header_recovery: [u8; 2],
    ts_recovery: u32,
    length_recovery: u16,
    /// protection-length bytes of payload parity
    payload: Vec<u8>,
}

impl FecPacket {
    fn parse(rx: &ReceivedPacket) -> Result<FecPacket, FecError> {
        let data = &rx.data[..];
        if data.len() < FEC_HEADER_LEN + LEVEL_HEADER_LEN_SHORT_MASK {
            return Err(FecError::MalformedFecHeader("shorter than FEC header"));
        }
        if data[0] & 0b1000_0000 != 0 {
            return Err(FecError::MalformedFecHeader("extension flag set"));
        }
        let long_mask = data[0] & 0b0100_0000 != 0;
        let level_header_len = if long_mask {
            LEVEL_HEADER_LEN_LONG_MASK
        } else {
            LEVEL_HEADER_LEN_SHORT_MASK
        };
        let header_len = FEC_HEADER_LEN + level_header_len;
        if data.len() < header_len {
            return Err(FecError::MalformedFecHeader("shorter than level header"));
        }
        let sn_base: Seq = u16::from_be_bytes([data[2], data[3]]).into();
        let protection_length = usize::from(u16::from_be_bytes([data[10], data[11]]));
        if data.len() < header_len + protection_length {
            return Err(FecError::MalformedFecHeader("protection length too large"));
        }
        let mask = &data[12..header_len];
        let protected: Vec<u16> = (0..mask.len() * 8)
            .filter(|i| mask[i / 8] & (0b1000_0000 >> (i % 8)) != 0)
            .map(|i| (sn_base + i as u16).into())
            .collect();
        if protected.is_empty() {
            return Err(FecError::MalformedFecHeader("empty mask"));
        }
        Ok(FecPacket {
            seq: rx.seq,
            ssrc: rx.ssrc,
            protected,
            header_recovery: [data[0], data[1]],
            ts_recovery: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            length_recovery: u16::from_be_bytes([data[8], data[9]]),
            payload: data[header_len..header_len + protection_length].to_vec(),
        })
    }

    fn find_single_missing(&self, media: &[RecoveredPacket]) -> Missing {
        let mut missing = None;
        for &seq in &self.protected {
            if !media.iter().any(|m| m.seq == seq) {
                if missing.is_some() {
                    return Missing::Many;
                }
                missing = Some(seq);
            }
        }
        match missing {
            Some(seq) => Missing::One(seq),
            None => Missing::None,
        }
    }

    fn recover(&self, missing: u16, media: &[RecoveredPacket]) -> Result<Vec<u8>, FecError> {
        let mut header = self.header_recovery;
        let mut ts = self.ts_recovery;
        let mut length = self.length_recovery;
        let mut payload = self.payload.clone();
        for &seq in self.protected.iter().filter(|&&s| s != missing) {
            let pk = media
                .iter()
                .find(|m| m.seq == seq)
                .ok_or(FecError::RecoveryFailed { seq: missing })?;
            let reader = RtpReader::new(&pk.data[..]).map_err(|e| {
                log::warn!("protected packet {} is not valid RTP: {:?}", seq, e);
                FecError::RecoveryFailed { seq: missing }
            })?;
            xor(&mut header[..], &pk.data[..2]);
            ts ^= reader.timestamp();
            let body = &pk.data[RTP_HEADER_LEN..];
            length ^= body.len() as u16;
            let n = body.len().min(payload.len());
            xor(&mut payload[..n], &body[..n]);
        }
        let length = usize::from(length);
        if length > payload.len() {
            return Err(FecError::RecoveryFailed { seq: missing });
        }
        let mut pk = Vec::with_capacity(RTP_HEADER_LEN + length);
        pk.extend_from_slice(&header);
        pk.extend_from_slice(&[0; RTP_HEADER_LEN - 2]);
        {
            let mut rtp = RtpHeaderMut::new(&mut pk[..]);
            rtp.set_version(2);
            rtp.set_sequence(missing);
            rtp.set_timestamp(ts);
            rtp.set_ssrc(self.ssrc);
        }
        pk.extend_from_slice(&payload[..length]);
        Ok(pk)
    }
}

enum Missing {
    None,
    One(u16),
    Many,
}

/// `dst ^= src`, byte for byte.
fn xor(dst: &mut [u8], src: &[u8]) {
    assert_eq!(dst.len(), src.len());
    for (d, s) in dst.iter_mut().zip(src) {
        *d ^= *s;
    }
}

#[derive(Default)]
pub struct UlpfecDecoder {
    fec_packets: Vec<FecPacket>,
}

impl UlpfecDecoder {
    fn insert_fec(&mut self, rx: &ReceivedPacket) -> Result<(), FecError> {
        if self.fec_packets.iter().any(|f| f.seq == rx.seq) {
            return Ok(());
        }
        let fec = FecPacket::parse(rx)?;
        self.fec_packets.push(fec);
        if self.fec_packets.len() > MAX_FEC_PACKETS {
            self.fec_packets.remove(0);
        }
        Ok(())
    }

    fn insert_media(recovered: &mut Vec<RecoveredPacket>, rx: ReceivedPacket) {
        if recovered.iter().any(|r| r.seq == rx.seq) {
            return;
        }
        recovered.push(RecoveredPacket {
            seq: rx.seq,
            was_recovered: false,
            // the receiver has already been given this one
            returned: true,
            data: rx.data,
        });
        if recovered.len() > MAX_TRACKED_MEDIA_PACKETS {
            recovered.remove(0);
        }
    }

    fn discard_old(&mut self, recovered: &mut Vec<RecoveredPacket>, last_fec_seq: u16) {
        let horizon = last_fec_seq.wrapping_sub(OLD_SEQUENCE_THRESHOLD);
        recovered.retain(|r| !r.returned || !is_newer_sequence_number(horizon, r.seq));
        self.fec_packets
            .retain(|f| !is_newer_sequence_number(horizon, f.seq));
    }

    /// Keeps recovering until no FEC packet is left with exactly one missing packet, since every
    /// recovery may complete the set protected by another FEC packet.
    fn attempt_recover(&mut self, recovered: &mut Vec<RecoveredPacket>, frame_complete: &mut bool) {
        loop {
            let mut progress = false;
            let mut i = 0;
            while i < self.fec_packets.len() {
                let fec = &self.fec_packets[i];
                match fec.find_single_missing(recovered) {
                    Missing::Many => {
                        i += 1;
                        continue;
                    }
                    Missing::None => (),
                    Missing::One(seq) => match fec.recover(seq, recovered) {
                        Ok(data) => {
                            if let Ok(reader) = RtpReader::new(&data[..]) {
                                *frame_complete |= reader.mark();
                            }
                            recovered.push(RecoveredPacket {
                                seq,
                                was_recovered: true,
                                returned: false,
                                data,
                            });
                            if recovered.len() > MAX_TRACKED_MEDIA_PACKETS {
                                recovered.remove(0);
                            }
                            progress = true;
                        }
                        Err(e) => log::warn!("FEC packet {}: {}", fec.seq, e),
                    },
                }
                // nothing more to be had from this one
                self.fec_packets.remove(i);
            }
            if !progress {
                break;
            }
        }
    }
}

impl FecDecoder for UlpfecDecoder {
    fn decode(
        &mut self,
        received: &mut Vec<ReceivedPacket>,
        recovered: &mut Vec<RecoveredPacket>,
        last_fec_seq: u16,
        frame_complete: &mut bool,
    ) -> Result<(), FecError> {
        let mut result = Ok(());
        for rx in received.drain(..) {
            if rx.is_fec {
                if let Err(e) = self.insert_fec(&rx) {
                    if result.is_ok() {
                        result = Err(e);
                    }
                }
            } else {
                Self::insert_media(recovered, rx);
            }
        }
        self.discard_old(recovered, last_fec_seq);
        self.attempt_recover(recovered, frame_complete);
        result
    }

    fn reset(&mut self) {
        self.fec_packets.clear();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn media(seq: u16, ts: u32, marker: bool, payload: &[u8]) -> Vec<u8> {
        let mut pk = vec![0x80, if marker { 0x80 | 96 } else { 96 }];
        pk.extend_from_slice(&seq.to_be_bytes());
        pk.extend_from_slice(&ts.to_be_bytes());
        pk.extend_from_slice(&0x1234_5678u32.to_be_bytes());
        pk.extend_from_slice(payload);
        pk
    }

    /// Builds the FEC payload protecting `packets`, which must have consecutive sequence numbers.
    pub(crate) fn encode(packets: &[Vec<u8>]) -> Vec<u8> {
        assert!(!packets.is_empty() && packets.len() <= 16);
        let protection_length = packets.iter().map(|p| p.len() - RTP_HEADER_LEN).max().unwrap();
        let mut header = [0u8; 2];
        let mut ts = 0u32;
        let mut length = 0u16;
        let mut payload = vec![0; protection_length];
        for p in packets {
            let reader = RtpReader::new(&p[..]).unwrap();
            xor(&mut header[..], &p[..2]);
            ts ^= reader.timestamp();
            let body = &p[RTP_HEADER_LEN..];
            length ^= body.len() as u16;
            xor(&mut payload[..body.len()], body);
        }
        let sn_base: u16 = RtpReader::new(&packets[0][..]).unwrap().sequence_number().into();
        let mask: u16 = !(0xffffu16 >> packets.len());
        let mut out = vec![header[0] & 0b0011_1111, header[1]];
        out.extend_from_slice(&sn_base.to_be_bytes());
        out.extend_from_slice(&ts.to_be_bytes());
        out.extend_from_slice(&length.to_be_bytes());
        out.extend_from_slice(&(protection_length as u16).to_be_bytes());
        out.extend_from_slice(&mask.to_be_bytes());
        out.extend_from_slice(&payload);
        out
    }

    fn rx_media(data: &[u8]) -> ReceivedPacket {
        let seq = RtpReader::new(data).unwrap().sequence_number().into();
        ReceivedPacket {
            is_fec: false,
            seq,
            ssrc: 0x1234_5678,
            data: data.to_vec(),
        }
    }

    fn rx_fec(seq: u16, data: Vec<u8>) -> ReceivedPacket {
        ReceivedPacket {
            is_fec: true,
            seq,
            ssrc: 0x1234_5678,
            data,
        }
    }

    #[test]
    fn recovers_single_loss() {
        let packets = vec![
            media(100, 9000, false, &[1, 2, 3, 4, 5]),
            media(101, 9000, false, &[6, 7]),
            media(102, 9000, true, &[8, 9, 10]),
        ];
        let fec = encode(&packets);
        let mut decoder = UlpfecDecoder::default();
        let mut received = vec![rx_media(&packets[0]), rx_media(&packets[2]), rx_fec(102, fec)];
        let mut recovered = vec![];
        let mut complete = false;
        decoder
            .decode(&mut received, &mut recovered, 102, &mut complete)
            .unwrap();
        assert!(received.is_empty());
        let r: Vec<_> = recovered.iter().filter(|r| r.was_recovered).collect();
        assert_eq!(r.len(), 1);
        assert_eq!(r[0].seq, 101);
        assert_eq!(r[0].data, packets[1]);
        assert!(!r[0].returned);
        // 101 carried no marker
        assert!(!complete);
    }

    #[test]
    fn recovered_marker_completes_frame() {
        let packets = vec![media(7, 0, false, &[1; 20]), media(8, 0, true, &[2; 3])];
        let fec = encode(&packets);
        let mut decoder = UlpfecDecoder::default();
        let mut received = vec![rx_media(&packets[0]), rx_fec(9, fec)];
        let mut recovered = vec![];
        let mut complete = false;
        decoder
            .decode(&mut received, &mut recovered, 9, &mut complete)
            .unwrap();
        assert!(complete);
        assert_eq!(recovered.last().unwrap().data, packets[1]);
    }

    #[test]
    fn cascading_recovery() {
        let packets: Vec<_> = (0..4)
            .map(|i| media(200 + i, 3000, i == 3, &[i as u8; 8]))
            .collect();
        // one FEC covers 200..=201, the other 200..=203
        let fec_a = encode(&packets[..2]);
        let fec_b = encode(&packets[..]);
        let mut decoder = UlpfecDecoder::default();
        let mut received = vec![
            rx_media(&packets[0]),
            rx_media(&packets[2]),
            rx_fec(204, fec_b),
            rx_fec(205, fec_a),
        ];
        let mut recovered = vec![];
        let mut complete = false;
        decoder
            .decode(&mut received, &mut recovered, 205, &mut complete)
            .unwrap();
        let mut seqs: Vec<_> = recovered
            .iter()
            .filter(|r| r.was_recovered)
            .map(|r| r.seq)
            .collect();
        seqs.sort();
        assert_eq!(seqs, vec![201, 203]);
        assert!(complete);
    }

    #[test]
    fn too_many_losses() {
        let packets: Vec<_> = (0..3).map(|i| media(i, 0, false, &[0; 4])).collect();
        let fec = encode(&packets);
        let mut decoder = UlpfecDecoder::default();
        let mut received = vec![rx_media(&packets[0]), rx_fec(3, fec)];
        let mut recovered = vec![];
        let mut complete = false;
        decoder
            .decode(&mut received, &mut recovered, 3, &mut complete)
            .unwrap();
        assert!(recovered.iter().all(|r| !r.was_recovered));
        // the FEC packet is kept until a later arrival makes it useful
        received.push(rx_media(&packets[1]));
        decoder
            .decode(&mut received, &mut recovered, 3, &mut complete)
            .unwrap();
        let r = recovered.iter().find(|r| r.was_recovered).unwrap();
        assert_eq!(r.data, packets[2]);
    }

    #[test]
    fn malformed_fec_header() {
        let mut decoder = UlpfecDecoder::default();
        let mut received = vec![rx_fec(1, vec![0; 6])];
        let mut recovered = vec![];
        let mut complete = false;
        match decoder.decode(&mut received, &mut recovered, 1, &mut complete) {
            Err(FecError::MalformedFecHeader(_)) => (),
            other => panic!("unexpected {:?}", other),
        }
        assert!(received.is_empty());
    }
}
