//! Reorders incoming packets into frames and hands complete frames, in timestamp order, to a
//! decode thread.
//!
//! The buffer is shared between a producer, which calls `get_frame()` / `insert_packet()` (or
//! just `insert()`) as packets come off the network, and a single consumer blocking in
//! `get_complete_frame_for_decoding()`.  All state sits behind one mutex; two condition variables
//! signal "a packet arrived" and "a frame is ready".

use crate::config::{JitterBufferConfig, NackMode};
use crate::decoding_state::DecodingState;
use crate::frame_buffer::{DecodableContext, FrameBuffer, FrameInsert, FrameState};
use crate::frame_pool::{FrameHandle, FramePool, PoolExhausted, Recycled};
use crate::jitter_estimator::{InterFrameDelay, JitterEstimator};
use crate::nack::NackList;
use crate::packet::{FrameType, Packet};
use crate::seq;
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::time::{Duration, Instant};

/// A packet arriving this long after an incomplete frame was taken for decoding no longer
/// contributes to that frame's jitter sample
const MAX_LATE_PACKET: Duration = Duration::from_secs(2);

/// What became of a packet passed to `insert_packet()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// Stored; its frame is not yet complete
    Inserted,
    /// Belongs to a frame older than the last one decoded
    OldPacket,
    DuplicatePacket,
    /// Completed its frame
    Complete,
    /// An incomplete frame, this one or an older one, may now be decoded
    Decodable,
    /// Its frame was thrown away, either because it grew beyond the packet limit or because it
    /// was recycled while the packet was on its way in
    FrameDiscarded,
    /// Sequence number beyond the frame's marker packet
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GetFrameError {
    /// `start()` has not been called, or `stop()` has
    NotRunning,
    /// The packet belongs to a frame older than the last one decoded
    OldPacket,
    /// No slot is free and none can be recycled without dropping a key frame; the caller should
    /// `flush()` and request a key frame
    FlushRequired,
    /// Too much old data arrived in a row, and the buffer flushed itself
    Flushed,
}
impl fmt::Display for GetFrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GetFrameError::NotRunning => write!(f, "jitter buffer not running"),
            GetFrameError::OldPacket => write!(f, "packet older than the last decoded frame"),
            GetFrameError::FlushRequired => write!(f, "no frame slot available, flush required"),
            GetFrameError::Flushed => write!(f, "jitter buffer flushed after too much old data"),
        }
    }
}
impl std::error::Error for GetFrameError {}

/// A frame taken out of the buffer for decoding.  Pass `handle()` to `release_frame()` once the
/// decoder is done with it.
#[derive(Debug)]
pub struct EncodedFrame {
    handle: FrameHandle,
    timestamp: u32,
    frame_type: FrameType,
    packets: Vec<Packet>,
    length: usize,
    complete: bool,
    missing_previous: bool,
    retransmitted: bool,
}
impl EncodedFrame {
    pub fn handle(&self) -> FrameHandle {
        self.handle
    }
    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }
    pub fn frame_type(&self) -> FrameType {
        self.frame_type
    }
    /// In sequence number order
    pub fn packets(&self) -> &[Packet] {
        &self.packets[..]
    }
    pub fn into_packets(self) -> Vec<Packet> {
        self.packets
    }
    pub fn length(&self) -> usize {
        self.length
    }
    /// `false` for a frame handed out with packets missing
    pub fn is_complete(&self) -> bool {
        self.complete
    }
    /// `true` if packets between the previously decoded frame and this one were never received
    pub fn missing_previous_frame(&self) -> bool {
        self.missing_previous
    }
    pub fn retransmitted(&self) -> bool {
        self.retransmitted
    }
    /// The payloads of all packets, concatenated
    pub fn data(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(self.length);
        for p in &self.packets {
            data.extend_from_slice(p.payload());
        }
        data
    }
}

/// An incomplete frame given to the decoder, whose jitter sample waits for late packets
struct WaitingForCompletion {
    timestamp: u32,
    frame_size: usize,
    latest_packet_time: Instant,
}

struct Inner {
    config: JitterBufferConfig,
    running: bool,
    pool: FramePool,
    decoding_state: DecodingState,
    nack: NackList,
    estimator: JitterEstimator,
    inter_frame_delay: InterFrameDelay,
    waiting_for_completion: Option<WaitingForCompletion>,
    first_packet_since_reset: bool,
    rtt_ms: u32,
    avg_packets_per_frame: f32,
    frame_counter: u32,
    consecutive_old_packets: u32,
    consecutive_old_frames: u32,
    key_frames: u32,
    delta_frames: u32,
    num_discarded_packets: u32,
    num_not_decodable_packets: u32,
    drop_count: u32,
    incoming_frame_count: u32,
    incoming_bit_count: u64,
    incoming_frame_rate: u32,
    incoming_bit_rate: u32,
    time_last_incoming_frame_count: Option<Instant>,
}

/// Frames that are neither free nor checked out by the decoder, oldest first
fn undelivered(pool: &FramePool) -> impl Iterator<Item = (FrameHandle, &FrameBuffer)> + '_ {
    pool.iter().filter(|(_, f)| {
        let state = f.state();
        state != FrameState::Free && state != FrameState::Decoding
    })
}

impl Inner {
    fn new(config: JitterBufferConfig) -> Inner {
        Inner {
            running: false,
            pool: FramePool::new(config.max_frames),
            decoding_state: DecodingState::default(),
            nack: NackList::new(config.max_nack_list_size, config.max_packet_age_to_nack),
            estimator: JitterEstimator::new(config.estimator.clone()),
            inter_frame_delay: InterFrameDelay::default(),
            waiting_for_completion: None,
            first_packet_since_reset: true,
            rtt_ms: config.default_rtt_ms,
            avg_packets_per_frame: 0.0,
            frame_counter: 0,
            consecutive_old_packets: 0,
            consecutive_old_frames: 0,
            key_frames: 0,
            delta_frames: 0,
            num_discarded_packets: 0,
            num_not_decodable_packets: 0,
            drop_count: 0,
            incoming_frame_count: 0,
            incoming_bit_count: 0,
            incoming_frame_rate: 0,
            incoming_bit_rate: 0,
            time_last_incoming_frame_count: None,
            config,
        }
    }

    fn start(&mut self) {
        self.running = true;
        self.incoming_frame_count = 0;
        self.incoming_frame_rate = 0;
        self.incoming_bit_count = 0;
        self.incoming_bit_rate = 0;
        self.time_last_incoming_frame_count = Some(Instant::now());
        self.key_frames = 0;
        self.delta_frames = 0;
        self.consecutive_old_frames = 0;
        self.consecutive_old_packets = 0;
        self.num_discarded_packets = 0;
        self.num_not_decodable_packets = 0;
        self.drop_count = 0;
        self.avg_packets_per_frame = 0.0;
        self.frame_counter = 0;
        self.waiting_for_completion = None;
        self.first_packet_since_reset = true;
        self.rtt_ms = self.config.default_rtt_ms;
        self.decoding_state.reset();
        self.estimator.reset();
        self.inter_frame_delay.reset();
    }

    fn stop(&mut self) {
        self.running = false;
        self.decoding_state.reset();
        self.pool.release_all();
        self.nack.clear();
        self.waiting_for_completion = None;
    }

    /// Drops every frame not currently checked out by the decoder, and forgets the decoding
    /// state, so that the stream restarts from the next key frame.
    fn flush(&mut self) {
        for handle in self.pool.handles() {
            let decoding = self
                .pool
                .get(handle)
                .map_or(false, |f| f.state() == FrameState::Decoding);
            if !decoding {
                self.pool.release(handle);
            }
        }
        self.decoding_state.reset();
        self.num_not_decodable_packets = 0;
        self.consecutive_old_frames = 0;
        self.consecutive_old_packets = 0;
        self.estimator.reset();
        self.inter_frame_delay.reset();
        self.waiting_for_completion = None;
        self.first_packet_since_reset = true;
        self.nack.clear();
        log::debug!("jitter buffer flushed");
    }

    fn wait_for_retransmissions(&self) -> bool {
        match self.config.nack_mode {
            NackMode::Disabled => false,
            NackMode::Enabled => match self.config.high_rtt_nack_threshold_ms {
                // too slow a round trip to be worth waiting for
                Some(high) => self.rtt_ms < high,
                None => true,
            },
        }
    }

    fn get_frame(&mut self, packet: &Packet) -> Result<FrameHandle, GetFrameError> {
        if !self.running {
            return Err(GetFrameError::NotRunning);
        }
        if self.decoding_state.is_old_packet(packet) {
            if !packet.is_empty() {
                self.num_discarded_packets += 1;
                self.consecutive_old_packets += 1;
            }
            self.decoding_state.update_old_packet(packet);
            if self.consecutive_old_packets > self.config.max_consecutive_old_packets {
                log::warn!(
                    "{} consecutive old packets, flushing",
                    self.consecutive_old_packets
                );
                self.flush();
                return Err(GetFrameError::Flushed);
            }
            return Err(GetFrameError::OldPacket);
        }
        self.consecutive_old_packets = 0;

        match self.pool.get_frame(packet.timestamp()) {
            Ok((handle, None)) => Ok(handle),
            Ok((handle, Some(recycled))) => {
                self.on_recycled(recycled);
                Ok(handle)
            }
            Err(PoolExhausted) => {
                log::warn!(
                    "all {} frame slots hold key frames, flush required",
                    self.pool.capacity()
                );
                Err(GetFrameError::FlushRequired)
            }
        }
    }

    fn on_recycled(&mut self, recycled: Recycled) {
        log::warn!(
            "no free frame slot, recycled {} frames",
            recycled.released
        );
        self.drop_count += recycled.released as u32;
        let key_frame = recycled.key_frame.or_else(|| {
            undelivered(&self.pool)
                .find(|(_, f)| f.is_key_frame())
                .map(|(h, _)| h)
        });
        let pool = &self.pool;
        match key_frame.and_then(|h| pool.get(h)) {
            Some(frame) => {
                // resume from the key frame; it must be decoded next
                if !self.decoding_state.is_old_frame(frame) {
                    self.decoding_state.set_state_one_back(frame);
                }
                if let Some(seq) = self.decoding_state.sequence_num() {
                    self.nack.drop_up_to(seq);
                }
            }
            None => {
                self.decoding_state.reset();
                self.nack.clear();
            }
        }
    }

    fn insert_packet(
        &mut self,
        handle: FrameHandle,
        packet: Packet,
    ) -> Result<InsertOutcome, GetFrameError> {
        if !self.running {
            return Err(GetFrameError::NotRunning);
        }
        if self.first_packet_since_reset {
            self.inter_frame_delay.reset();
            self.first_packet_since_reset = false;
        }
        // the decoder may have moved on since get_frame()
        if self.decoding_state.is_old_packet(&packet) {
            self.decoding_state.update_old_packet(&packet);
            self.drop_count += 1;
            self.consecutive_old_frames += 1;
            if self.consecutive_old_frames > self.config.max_consecutive_old_frames {
                log::warn!(
                    "{} consecutive old frames, flushing",
                    self.consecutive_old_frames
                );
                self.flush();
                return Err(GetFrameError::Flushed);
            }
            return Ok(InsertOutcome::OldPacket);
        }
        self.consecutive_old_frames = 0;

        // empty packets have no size, and would bias the jitter estimate
        if packet.frame_type() != FrameType::Empty {
            self.track_waiting_for_completion(&packet);
        }

        let packet = if self.config.nack_mode == NackMode::Enabled {
            let was_missing = self
                .nack
                .on_packet(packet.seq(), self.decoding_state.sequence_num());
            if was_missing {
                packet.with_retransmitted(true)
            } else {
                packet
            }
        } else {
            packet
        };

        let decode_with_errors = !self.wait_for_retransmissions();
        let arrival = packet.arrival();
        let len = packet.len();
        let seq = packet.seq();
        let frame = match self.pool.get_mut(handle) {
            Some(frame) if frame.state() != FrameState::Decoding => frame,
            _ => {
                log::debug!("frame for seq {} went away before insertion", seq);
                return Ok(InsertOutcome::FrameDiscarded);
            }
        };
        match frame.insert(packet, self.config.max_packets_per_frame) {
            FrameInsert::Duplicate => Ok(InsertOutcome::DuplicatePacket),
            FrameInsert::Empty => Ok(InsertOutcome::Inserted),
            FrameInsert::TimestampMismatch | FrameInsert::Rejected => {
                if frame.num_packets() >= self.config.max_packets_per_frame {
                    log::warn!(
                        "frame ts={} exceeds {} packets, discarding it",
                        frame.timestamp(),
                        self.config.max_packets_per_frame
                    );
                    self.pool.release(handle);
                    self.drop_count += 1;
                    return Ok(InsertOutcome::FrameDiscarded);
                }
                log::trace!("packet seq {} rejected by frame ts={}", seq, frame.timestamp());
                if frame.state() == FrameState::Free {
                    self.pool.release(handle);
                }
                Ok(InsertOutcome::Rejected)
            }
            FrameInsert::Incomplete => {
                self.incoming_bit_count += len as u64 * 8;
                // the packets of a frame still arriving in order are not yet lost
                if decode_with_errors && self.update_decodable_frames(arrival) {
                    Ok(InsertOutcome::Decodable)
                } else {
                    Ok(InsertOutcome::Inserted)
                }
            }
            FrameInsert::Complete => {
                self.incoming_bit_count += len as u64 * 8;
                if frame.length() > 0 && !frame.is_counted() {
                    frame.set_counted();
                    self.incoming_frame_count += 1;
                    if frame.is_key_frame() {
                        self.key_frames += 1;
                    } else {
                        self.delta_frames += 1;
                    }
                    // retransmitted frames only tell the estimator a NACK happened
                    let sample = match frame.latest_arrival() {
                        Some(t) if !frame.retransmitted() => {
                            Some((frame.timestamp(), t, frame.length()))
                        }
                        _ => None,
                    };
                    if let Some((timestamp, latest, length)) = sample {
                        self.update_jitter_estimate(timestamp, latest, length, false);
                    }
                }
                Ok(InsertOutcome::Complete)
            }
        }
    }

    fn track_waiting_for_completion(&mut self, packet: &Packet) {
        let mut waiting = match self.waiting_for_completion.take() {
            Some(w) => w,
            None => return,
        };
        if waiting.timestamp == packet.timestamp() {
            waiting.frame_size += packet.len();
            waiting.latest_packet_time = packet.arrival();
            self.waiting_for_completion = Some(waiting);
        } else if waiting.latest_packet_time + MAX_LATE_PACKET <= packet.arrival() {
            self.update_jitter_estimate(
                waiting.timestamp,
                waiting.latest_packet_time,
                waiting.frame_size,
                true,
            );
        } else {
            self.waiting_for_completion = Some(waiting);
        }
    }

    fn update_jitter_estimate(
        &mut self,
        timestamp: u32,
        latest_packet_time: Instant,
        frame_size: usize,
        incomplete: bool,
    ) {
        let clock_rate = self.config.estimator.clock_rate_khz;
        // reordered frames are left out of the estimate
        if let Some(delay) =
            self.inter_frame_delay
                .calculate_delay(timestamp, latest_packet_time, clock_rate)
        {
            self.estimator
                .update_estimate(delay, frame_size as u32, incomplete);
        }
    }

    fn update_average_packets_per_frame(&mut self, num_packets: usize) {
        let n = num_packets as f32;
        let s = &self.config.decodable;
        if self.frame_counter > s.fast_converge_frames {
            self.avg_packets_per_frame = self.avg_packets_per_frame
                * (1.0 - s.normal_converge_multiplier)
                + n * s.normal_converge_multiplier;
        } else if self.frame_counter > 0 {
            self.avg_packets_per_frame = self.avg_packets_per_frame
                * (1.0 - s.fast_converge_multiplier)
                + n * s.fast_converge_multiplier;
            self.frame_counter += 1;
        } else {
            self.avg_packets_per_frame = n;
            self.frame_counter += 1;
        }
    }

    /// Releases frames that can no longer be decoded, because the decoder has already moved past
    /// their timestamp, and empty frames directly following the decoding state.
    fn clean_up_old_or_empty_frames(&mut self) {
        loop {
            let (handle, has_media) = {
                let mut frames = undelivered(&self.pool);
                let (handle, frame) = match frames.next() {
                    Some(next) => next,
                    None => break,
                };
                let more = frames.next().is_some();
                if frame.state() == FrameState::Empty && more {
                    self.decoding_state.update_empty_frame(frame);
                }
                if !self.decoding_state.is_old_frame(frame) {
                    break;
                }
                if frame.length() > 0 {
                    log::debug!(
                        "dropping frame ts={} in state {:?}, decoder has moved on",
                        frame.timestamp(),
                        frame.state()
                    );
                }
                (handle, frame.length() > 0)
            };
            if has_media {
                self.drop_count += 1;
            }
            self.pool.release(handle);
        }
        if let Some(seq) = self.decoding_state.sequence_num() {
            self.nack.drop_up_to(seq);
        }
    }

    /// Re-evaluates incomplete frames against the decodability heuristic once their loss is
    /// evident: their retransmissions are overdue, or (when we are not waiting for
    /// retransmissions) a newer frame has started.
    fn update_decodable_frames(&mut self, now: Instant) -> bool {
        let wait = self.wait_for_retransmissions();
        let deadline = self.config.decodable.retransmission_deadline(self.rtt_ms);
        let newest = undelivered(&self.pool).map(|(_, f)| f.timestamp()).last();
        let ctx = DecodableContext {
            rtt_ms: self.rtt_ms,
            avg_packets_per_frame: self.avg_packets_per_frame,
            settings: &self.config.decodable,
        };
        let mut changed = false;
        for handle in self.pool.handles() {
            if let Some(frame) = self.pool.get_mut(handle) {
                if frame.state() != FrameState::Incomplete {
                    continue;
                }
                let superseded =
                    newest.map_or(false, |n| seq::is_newer_timestamp(n, frame.timestamp()));
                let overdue = frame.first_arrival().map_or(false, |t| now >= t + deadline);
                let due = if wait { overdue } else { superseded || overdue };
                if due && frame.update_decodable(&ctx) {
                    changed = true;
                }
            }
        }
        changed
    }

    /// The earliest future instant at which an incomplete frame's retransmission deadline
    /// passes.
    fn next_retransmission_deadline(&self, now: Instant) -> Option<Instant> {
        if !self.wait_for_retransmissions() {
            return None;
        }
        let deadline = self.config.decodable.retransmission_deadline(self.rtt_ms);
        undelivered(&self.pool)
            .filter(|(_, f)| f.state() == FrameState::Incomplete)
            .filter_map(|(_, f)| f.first_arrival())
            .map(|t| t + deadline)
            .filter(|&t| t > now)
            .min()
    }

    /// The oldest frame if it can be decoded without a gap, or failing that, a complete key
    /// frame to resume from.
    fn find_oldest_complete_continuous(&mut self, now: Instant) -> Option<FrameHandle> {
        self.update_decodable_frames(now);
        if let Some((handle, frame)) = undelivered(&self.pool).next() {
            let ready =
                frame.state() == FrameState::Complete || frame.state() == FrameState::Decodable;
            if ready && self.decoding_state.continuous_frame(frame) {
                return Some(handle);
            }
        }
        let decoding_state = &self.decoding_state;
        undelivered(&self.pool)
            .find(|(_, f)| {
                f.state() == FrameState::Complete
                    && f.is_key_frame()
                    && !decoding_state.is_old_frame(f)
            })
            .map(|(h, _)| h)
    }

    /// Checks the frame out to the decoder.
    fn extract_and_set_decode(&mut self, handle: FrameHandle) -> Option<EncodedFrame> {
        let frame = self.pool.get(handle)?;
        let timestamp = frame.timestamp();
        let frame_type = frame.frame_type();
        let complete = frame.state() == FrameState::Complete;
        let retransmitted = frame.retransmitted();
        let length = frame.length();
        let num_packets = frame.num_packets();
        let latest_arrival = frame.latest_arrival();
        let missing_previous = !self.decoding_state.continuous_frame(frame);
        self.decoding_state.set_state(frame);

        if retransmitted {
            self.estimator.frame_nacked();
        } else if length > 0 {
            if let Some(w) = self.waiting_for_completion.take() {
                self.update_jitter_estimate(
                    w.timestamp,
                    w.latest_packet_time,
                    w.frame_size,
                    true,
                );
            }
            // complete frames were sampled on insertion; this one is sampled once the rest of
            // it turns up, or gives up
            if let (Some(arrival), false) = (latest_arrival, complete) {
                self.waiting_for_completion = Some(WaitingForCompletion {
                    timestamp,
                    frame_size: length,
                    latest_packet_time: arrival,
                });
            }
        }
        if num_packets > 0 {
            self.update_average_packets_per_frame(num_packets);
        }

        let frame = self.pool.get_mut(handle)?;
        if !complete {
            frame.make_decodable();
        }
        self.num_not_decodable_packets += frame.not_decodable_packets() as u32;
        frame.set_state(FrameState::Decoding);
        let packets = frame.take_packets();
        if let Some(seq) = self.decoding_state.sequence_num() {
            self.nack.drop_up_to(seq);
        }
        log::trace!(
            "frame ts={} ({} packets, complete={}) to decoder",
            timestamp,
            packets.len(),
            complete
        );
        Some(EncodedFrame {
            handle,
            timestamp,
            frame_type,
            length: packets.iter().map(|p| p.len()).sum(),
            packets,
            complete,
            missing_previous,
            retransmitted,
        })
    }

    fn incoming_rate_statistics(&mut self, now: Instant) -> (u32, u32) {
        let last = self.time_last_incoming_frame_count.unwrap_or(now);
        let diff_ms = now.saturating_duration_since(last).as_millis() as u64;
        if diff_ms < 1000 && self.incoming_frame_rate > 0 && self.incoming_bit_rate > 0 {
            // report the previous figures until a full second has passed
            return (self.incoming_frame_rate, self.incoming_bit_rate);
        }
        if self.incoming_frame_count == 0 {
            self.time_last_incoming_frame_count = Some(now);
            self.incoming_frame_rate = 0;
            self.incoming_bit_rate = 0;
            return (0, 0);
        }
        let diff_ms = diff_ms.max(1);
        let rate = (0.5 + (self.incoming_frame_count as f32 * 1000.0) / diff_ms as f32).max(1.0);
        // average this and the previous measurement
        let frame_rate = (self.incoming_frame_rate + rate as u32) / 2;
        self.incoming_frame_rate = rate as u32;
        let bit_rate = (10 * ((100 * self.incoming_bit_count) / diff_ms)) as u32;
        self.incoming_bit_rate = bit_rate;
        self.incoming_frame_count = 0;
        self.incoming_bit_count = 0;
        self.time_last_incoming_frame_count = Some(now);
        (frame_rate, bit_rate)
    }
}

pub struct JitterBuffer {
    inner: Mutex<Inner>,
    /// a packet was inserted
    packet_event: Condvar,
    /// a frame became complete or decodable
    frame_event: Condvar,
}

impl JitterBuffer {
    /// Creates a stopped buffer; call `start()` before inserting packets.
    pub fn new(config: JitterBufferConfig) -> JitterBuffer {
        JitterBuffer {
            inner: Mutex::new(Inner::new(config)),
            packet_event: Condvar::new(),
            frame_event: Condvar::new(),
        }
    }

    pub fn start(&self) {
        self.inner.lock().start();
    }

    /// Stops the buffer, dropping all frames.  Any thread blocked in a retrieval call returns
    /// immediately with `GetFrameError::NotRunning`.
    pub fn stop(&self) {
        self.inner.lock().stop();
        self.frame_event.notify_all();
        self.packet_event.notify_all();
    }

    pub fn running(&self) -> bool {
        self.inner.lock().running
    }

    /// Drops every frame not currently held by the decoder and resets the decoding state.
    pub fn flush(&self) {
        self.inner.lock().flush();
    }

    /// Finds or allocates the frame that `packet` belongs to.
    pub fn get_frame(&self, packet: &Packet) -> Result<FrameHandle, GetFrameError> {
        self.inner.lock().get_frame(packet)
    }

    /// Adds `packet` to the frame previously returned by `get_frame()` for it.
    pub fn insert_packet(
        &self,
        handle: FrameHandle,
        packet: Packet,
    ) -> Result<InsertOutcome, GetFrameError> {
        let mut inner = self.inner.lock();
        let outcome = inner.insert_packet(handle, packet);
        self.signal(&outcome);
        outcome
    }

    /// `get_frame()` followed by `insert_packet()`, under a single lock.
    pub fn insert(&self, packet: Packet) -> Result<InsertOutcome, GetFrameError> {
        let mut inner = self.inner.lock();
        let outcome = match inner.get_frame(&packet) {
            Ok(handle) => inner.insert_packet(handle, packet),
            Err(GetFrameError::OldPacket) => Ok(InsertOutcome::OldPacket),
            Err(e) => Err(e),
        };
        self.signal(&outcome);
        outcome
    }

    fn signal(&self, outcome: &Result<InsertOutcome, GetFrameError>) {
        match outcome {
            Ok(InsertOutcome::Complete) | Ok(InsertOutcome::Decodable) => {
                self.packet_event.notify_all();
                self.frame_event.notify_all();
            }
            Ok(InsertOutcome::Inserted) => {
                self.packet_event.notify_all();
            }
            _ => (),
        }
    }

    /// Blocks until the timestamp of the next frame due for decoding is known, returning it
    /// along with the frame's type, or `None` on timeout or once stopped.
    pub fn next_timestamp(&self, max_wait: Duration) -> Option<(u32, FrameType)> {
        let deadline = Instant::now() + max_wait;
        let mut inner = self.inner.lock();
        loop {
            if !inner.running {
                return None;
            }
            inner.clean_up_old_or_empty_frames();
            if let Some((_, frame)) = undelivered(&inner.pool).next() {
                return Some((frame.timestamp(), frame.frame_type()));
            }
            if Instant::now() >= deadline {
                return None;
            }
            self.packet_event.wait_until(&mut inner, deadline);
        }
    }

    /// Blocks for up to `max_wait` until the oldest frame is complete (or judged decodable) and
    /// continuous with what was decoded before, then checks it out to the caller.  A complete key
    /// frame is handed out ahead of older frames that are not ready.
    ///
    /// Returns `Ok(None)` on timeout.
    pub fn get_complete_frame_for_decoding(
        &self,
        max_wait: Duration,
    ) -> Result<Option<EncodedFrame>, GetFrameError> {
        let deadline = Instant::now() + max_wait;
        let mut inner = self.inner.lock();
        loop {
            if !inner.running {
                return Err(GetFrameError::NotRunning);
            }
            let now = Instant::now();
            inner.clean_up_old_or_empty_frames();
            if let Some(handle) = inner.find_oldest_complete_continuous(now) {
                return Ok(inner.extract_and_set_decode(handle));
            }
            if now >= deadline {
                return Ok(None);
            }
            let wake = inner
                .next_retransmission_deadline(now)
                .map_or(deadline, |t| t.min(deadline));
            self.frame_event.wait_until(&mut inner, wake);
        }
    }

    /// Returns the oldest frame without waiting, even if it is incomplete, as long as a later
    /// frame has started arriving.  While waiting for retransmissions this behaves like a
    /// non-blocking `get_complete_frame_for_decoding()`.
    pub fn get_frame_for_decoding(&self) -> Result<Option<EncodedFrame>, GetFrameError> {
        let mut inner = self.inner.lock();
        if !inner.running {
            return Err(GetFrameError::NotRunning);
        }
        inner.clean_up_old_or_empty_frames();
        if inner.wait_for_retransmissions() {
            let found = inner.find_oldest_complete_continuous(Instant::now());
            return Ok(found.and_then(|h| inner.extract_and_set_decode(h)));
        }
        let oldest = {
            let mut frames = undelivered(&inner.pool);
            match frames.next() {
                None => return Ok(None),
                Some((handle, frame)) => {
                    if frames.next().is_none() && frame.state() != FrameState::Complete {
                        return Ok(None);
                    }
                    handle
                }
            }
        };
        Ok(inner.extract_and_set_decode(oldest))
    }

    /// Returns a frame checked out for decoding to the pool.  Stale handles are ignored.
    pub fn release_frame(&self, handle: FrameHandle) {
        let mut inner = self.inner.lock();
        let decoding = inner
            .pool
            .get(handle)
            .map_or(false, |f| f.state() == FrameState::Decoding);
        if decoding {
            inner.pool.release(handle);
        }
    }

    /// `true` if the next frame can be decoded without a gap, or if there is not yet anything
    /// to decide.
    pub fn complete_sequence_with_next_frame(&self) -> bool {
        let mut inner = self.inner.lock();
        inner.clean_up_old_or_empty_frames();
        let mut frames = undelivered(&inner.pool);
        let oldest = match frames.next() {
            None => return true,
            Some((_, frame)) => frame,
        };
        if oldest.state() != FrameState::Complete {
            // a lone incomplete frame may simply still be arriving
            return frames.next().is_none();
        }
        oldest.low_seq().is_some() && inner.decoding_state.continuous_frame(oldest)
    }

    /// The missing sequence numbers, oldest first, and whether loss has become unrecoverable so
    /// that a key frame should be requested instead.
    pub fn get_nack_list(&self) -> (Vec<u16>, bool) {
        let mut inner = self.inner.lock();
        if inner.config.nack_mode == NackMode::Disabled {
            return (Vec::new(), false);
        }
        inner.nack.get()
    }

    pub fn set_nack_mode(
        &self,
        mode: NackMode,
        low_rtt_nack_threshold_ms: Option<u32>,
        high_rtt_nack_threshold_ms: Option<u32>,
    ) {
        let mut inner = self.inner.lock();
        inner.config.nack_mode = mode;
        if mode == NackMode::Disabled {
            inner.nack.clear();
        }
        inner.config.low_rtt_nack_threshold_ms = low_rtt_nack_threshold_ms;
        inner.config.high_rtt_nack_threshold_ms = high_rtt_nack_threshold_ms;
        // don't let the default RTT add delay when the high threshold is in use
        if inner.rtt_ms == inner.config.default_rtt_ms && high_rtt_nack_threshold_ms.is_some() {
            inner.rtt_ms = 0;
        }
        if !inner.wait_for_retransmissions() {
            inner.estimator.reset_nack_count();
        }
    }

    pub fn nack_mode(&self) -> NackMode {
        self.inner.lock().config.nack_mode
    }

    pub fn set_nack_settings(&self, max_nack_list_size: usize, max_packet_age_to_nack: u16) {
        let mut inner = self.inner.lock();
        inner.config.max_nack_list_size = max_nack_list_size;
        inner.config.max_packet_age_to_nack = max_packet_age_to_nack;
        inner
            .nack
            .set_limits(max_nack_list_size, max_packet_age_to_nack);
    }

    pub fn update_rtt(&self, rtt_ms: u32) {
        let mut inner = self.inner.lock();
        inner.rtt_ms = rtt_ms;
        if !inner.wait_for_retransmissions() {
            inner.estimator.reset_nack_count();
        }
    }

    pub fn set_max_jitter_estimate(&self, enable: bool) {
        self.inner.lock().estimator.set_max_jitter_estimate(enable);
    }

    /// Current jitter estimate in milliseconds, including the RTT when retransmissions are
    /// being relied upon.
    pub fn estimated_jitter_ms(&self) -> u32 {
        let mut inner = self.inner.lock();
        let rtt_multiplier = match inner.config.low_rtt_nack_threshold_ms {
            // FEC covers for loss at this RTT, so don't pay for retransmissions
            Some(low) if inner.rtt_ms >= low => 0.0,
            _ => 1.0,
        };
        let rtt_ms = inner.rtt_ms;
        inner.estimator.jitter_estimate(rtt_ms, rtt_multiplier)
    }

    /// Arrival time of the latest packet of the frame, and whether any of its packets was
    /// retransmitted.
    pub fn last_packet_time(&self, handle: FrameHandle) -> Option<(Instant, bool)> {
        let inner = self.inner.lock();
        let frame = inner.pool.get(handle)?;
        let retransmitted = frame.retransmitted();
        frame.latest_arrival().map(|t| (t, retransmitted))
    }

    pub fn last_decoded_timestamp(&self) -> Option<u32> {
        self.inner.lock().decoding_state.time_stamp()
    }

    /// Completed frames received since `start()`, as `(delta, key)`.
    pub fn frame_statistics(&self) -> (u32, u32) {
        let inner = self.inner.lock();
        (inner.delta_frames, inner.key_frames)
    }

    /// Packets removed from frames handed out incomplete, since they could not be decoded.
    pub fn num_not_decodable_packets(&self) -> u32 {
        self.inner.lock().num_not_decodable_packets
    }

    /// Media packets that arrived after their frame had been decoded or dropped.
    pub fn num_discarded_packets(&self) -> u32 {
        self.inner.lock().num_discarded_packets
    }

    /// Frames dropped without being decoded.
    pub fn drop_count(&self) -> u32 {
        self.inner.lock().drop_count
    }

    /// Incoming frame rate (frames/s) and bit rate (bits/s) since the previous call.
    pub fn incoming_rate_statistics(&self, now: Instant) -> (u32, u32) {
        self.inner.lock().incoming_rate_statistics(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::tests::{pk, video};
    use crate::packet::FrameType::*;

    fn started(config: JitterBufferConfig) -> JitterBuffer {
        let jb = JitterBuffer::new(config);
        jb.start();
        jb
    }

    /// Inserts a whole frame of `n` packets starting at `seq`.
    fn frame(jb: &JitterBuffer, seq: u16, n: u16, ts: u32, frame_type: FrameType) -> InsertOutcome {
        let mut last = InsertOutcome::Inserted;
        for i in 0..n {
            last = jb
                .insert(pk(seq.wrapping_add(i), ts, i == 0, i == n - 1, frame_type))
                .unwrap();
        }
        last
    }

    fn no_wait() -> Duration {
        Duration::from_millis(0)
    }

    #[test]
    fn not_running() {
        let jb = JitterBuffer::new(JitterBufferConfig::default());
        assert_eq!(
            jb.insert(pk(1, 0, true, true, Key)),
            Err(GetFrameError::NotRunning)
        );
        assert_eq!(
            jb.get_complete_frame_for_decoding(no_wait()).unwrap_err(),
            GetFrameError::NotRunning
        );
    }

    #[test]
    fn reorders_and_waits_for_missing_packet() {
        let jb = started(JitterBufferConfig::default());
        for &s in &[5u16, 6, 8] {
            assert_eq!(
                jb.insert(pk(s, 1000, s == 5, false, Key)).unwrap(),
                InsertOutcome::Inserted
            );
        }
        assert_eq!(
            jb.insert(pk(9, 1000, false, true, Key)).unwrap(),
            InsertOutcome::Inserted
        );
        assert!(jb
            .get_complete_frame_for_decoding(Duration::from_millis(50))
            .unwrap()
            .is_none());
        assert_eq!(jb.get_nack_list(), (vec![7], false));
        assert_eq!(
            jb.insert(pk(7, 1000, false, false, Key)).unwrap(),
            InsertOutcome::Complete
        );
        let frame = jb.get_complete_frame_for_decoding(no_wait()).unwrap().unwrap();
        let seqs: Vec<u16> = frame.packets().iter().map(|p| p.seq()).collect();
        assert_eq!(seqs, vec![5, 6, 7, 8, 9]);
        assert!(frame.is_complete());
        assert!(frame.retransmitted());
        assert_eq!(frame.length(), 50);
        assert_eq!(frame.data().len(), 50);
        assert!(jb.get_nack_list().0.is_empty());
        jb.release_frame(frame.handle());
    }

    #[test]
    fn duplicate_and_old_packets() {
        let jb = started(JitterBufferConfig::default());
        frame(&jb, 10, 2, 3000, Key);
        assert_eq!(
            jb.insert(pk(11, 3000, false, true, Key)).unwrap(),
            InsertOutcome::DuplicatePacket
        );
        let f = jb.get_complete_frame_for_decoding(no_wait()).unwrap().unwrap();
        jb.release_frame(f.handle());
        assert_eq!(jb.last_decoded_timestamp(), Some(3000));
        assert_eq!(
            jb.insert(pk(11, 3000, false, true, Key)).unwrap(),
            InsertOutcome::OldPacket
        );
        assert_eq!(
            jb.get_frame(&pk(9, 0, true, true, Delta)),
            Err(GetFrameError::OldPacket)
        );
        assert_eq!(jb.num_discarded_packets(), 2);
    }

    #[test]
    fn delivers_in_timestamp_order_once() {
        let jb = started(JitterBufferConfig::default());
        // frames inserted out of order
        frame(&jb, 4, 2, 9000, Delta);
        frame(&jb, 0, 2, 3000, Key);
        frame(&jb, 2, 2, 6000, Delta);
        let mut got = vec![];
        while let Some(f) = jb.get_complete_frame_for_decoding(no_wait()).unwrap() {
            assert!(!f.missing_previous_frame());
            got.push(f.timestamp());
            jb.release_frame(f.handle());
        }
        assert_eq!(got, vec![3000, 6000, 9000]);
        assert_eq!(jb.frame_statistics(), (2, 1));
    }

    #[test]
    fn delta_frame_needs_previous_frame() {
        let jb = started(JitterBufferConfig::default());
        frame(&jb, 0, 1, 3000, Key);
        let f = jb.get_complete_frame_for_decoding(no_wait()).unwrap().unwrap();
        jb.release_frame(f.handle());
        // seq 1 lost entirely
        frame(&jb, 2, 1, 9000, Delta);
        assert!(!jb.complete_sequence_with_next_frame());
        assert!(jb.get_complete_frame_for_decoding(no_wait()).unwrap().is_none());
        frame(&jb, 1, 1, 6000, Delta);
        assert!(jb.complete_sequence_with_next_frame());
        let ts: Vec<u32> = (0..2)
            .map(|_| {
                let f = jb.get_complete_frame_for_decoding(no_wait()).unwrap().unwrap();
                jb.release_frame(f.handle());
                f.timestamp()
            })
            .collect();
        assert_eq!(ts, vec![6000, 9000]);
    }

    #[test]
    fn key_frame_skips_incomplete_frames() {
        let jb = started(JitterBufferConfig::default());
        frame(&jb, 0, 1, 3000, Key);
        let f = jb.get_complete_frame_for_decoding(no_wait()).unwrap().unwrap();
        jb.release_frame(f.handle());
        // incomplete delta, then a complete key frame
        jb.insert(pk(1, 6000, true, false, Delta)).unwrap();
        frame(&jb, 5, 2, 9000, Key);
        let f = jb.get_complete_frame_for_decoding(no_wait()).unwrap().unwrap();
        assert_eq!(f.timestamp(), 9000);
        assert!(f.missing_previous_frame());
        jb.release_frame(f.handle());
        // the delta is dropped at the next retrieval
        assert!(jb.get_complete_frame_for_decoding(no_wait()).unwrap().is_none());
        assert_eq!(jb.drop_count(), 1);
        assert_eq!(
            jb.insert(pk(2, 6000, false, true, Delta)).unwrap(),
            InsertOutcome::OldPacket
        );
    }

    #[test]
    fn capacity_recycles_delta_frames() {
        let config = JitterBufferConfig {
            max_frames: 4,
            ..JitterBufferConfig::default()
        };
        let jb = started(config);
        // deltas that can never be decoded, since no key frame precedes them
        for i in 0..6u16 {
            frame(&jb, i * 2, 2, 3000 * (u32::from(i) + 1), Delta);
        }
        assert!(jb.drop_count() >= 2);
        assert!(jb.get_complete_frame_for_decoding(no_wait()).unwrap().is_none());
    }

    #[test]
    fn capacity_exhausted_by_key_frames() {
        let config = JitterBufferConfig {
            max_frames: 2,
            ..JitterBufferConfig::default()
        };
        let jb = started(config);
        // incomplete key frames: never handed out, never recycled
        jb.insert(pk(0, 3000, true, false, Key)).unwrap();
        jb.insert(pk(2, 6000, true, false, Key)).unwrap();
        assert_eq!(
            jb.insert(pk(4, 9000, true, false, Key)),
            Err(GetFrameError::FlushRequired)
        );
        jb.flush();
        assert_eq!(
            jb.insert(pk(4, 9000, true, true, Key)).unwrap(),
            InsertOutcome::Complete
        );
    }

    #[test]
    fn decodable_once_retransmission_deadline_passes() {
        let config = JitterBufferConfig {
            default_rtt_ms: 100,
            ..JitterBufferConfig::default()
        };
        let jb = started(config);
        frame(&jb, 0, 2, 3000, Key);
        let f = jb.get_complete_frame_for_decoding(no_wait()).unwrap().unwrap();
        jb.release_frame(f.handle());
        // seq 3 missing; 2 packets against an average of 2 per frame is tolerable
        jb.insert(pk(2, 6000, true, false, Delta)).unwrap();
        jb.insert(pk(4, 6000, false, true, Delta)).unwrap();
        jb.insert(pk(5, 9000, true, true, Delta)).unwrap();
        assert!(jb.get_complete_frame_for_decoding(no_wait()).unwrap().is_none());
        // rtt 100 ms * 1.5
        let f = jb
            .get_complete_frame_for_decoding(Duration::from_millis(500))
            .unwrap()
            .unwrap();
        assert_eq!(f.timestamp(), 6000);
        assert!(!f.is_complete());
        // the broken fragment is dropped
        assert_eq!(f.packets().len(), 1);
        jb.release_frame(f.handle());
        assert_eq!(jb.num_not_decodable_packets(), 1);
    }

    #[test]
    fn nack_disabled_hands_out_incomplete_frames() {
        let config = JitterBufferConfig {
            nack_mode: NackMode::Disabled,
            ..JitterBufferConfig::default()
        };
        let jb = started(config);
        frame(&jb, 0, 2, 3000, Key);
        jb.insert(pk(2, 6000, true, false, Delta)).unwrap();
        // lone incomplete frame: might still be arriving
        let f = jb.get_frame_for_decoding().unwrap().unwrap();
        assert_eq!(f.timestamp(), 3000);
        jb.release_frame(f.handle());
        assert!(jb.get_frame_for_decoding().unwrap().is_none());
        jb.insert(pk(5, 9000, true, true, Delta)).unwrap();
        let f = jb.get_frame_for_decoding().unwrap().unwrap();
        assert_eq!(f.timestamp(), 6000);
        assert!(!f.is_complete());
        jb.release_frame(f.handle());
        assert_eq!(jb.get_nack_list(), (vec![], false));
    }

    #[test]
    fn consecutive_old_packets_flush() {
        let config = JitterBufferConfig {
            max_consecutive_old_packets: 3,
            ..JitterBufferConfig::default()
        };
        let jb = started(config);
        frame(&jb, 100, 1, 90_000, Key);
        let f = jb.get_complete_frame_for_decoding(no_wait()).unwrap().unwrap();
        jb.release_frame(f.handle());
        for s in 0..3 {
            assert_eq!(
                jb.insert(pk(s, 1000, false, false, Delta)).unwrap(),
                InsertOutcome::OldPacket
            );
        }
        assert_eq!(
            jb.insert(pk(3, 1000, false, false, Delta)),
            Err(GetFrameError::Flushed)
        );
        assert_eq!(jb.last_decoded_timestamp(), None);
    }

    #[test]
    fn stale_handle_is_ignored() {
        let jb = started(JitterBufferConfig::default());
        frame(&jb, 0, 1, 3000, Key);
        let f = jb.get_complete_frame_for_decoding(no_wait()).unwrap().unwrap();
        let handle = f.handle();
        assert!(jb.last_packet_time(handle).is_some());
        jb.release_frame(handle);
        assert!(jb.last_packet_time(handle).is_none());
        jb.release_frame(handle);
    }

    #[test]
    fn next_timestamp_reports_oldest() {
        let jb = started(JitterBufferConfig::default());
        assert_eq!(jb.next_timestamp(Duration::from_millis(10)), None);
        jb.insert(pk(4, 6000, true, false, Delta)).unwrap();
        jb.insert(pk(1, 3000, true, false, Key)).unwrap();
        assert_eq!(jb.next_timestamp(no_wait()), Some((3000, Key)));
    }

    #[test]
    fn rate_statistics() {
        let jb = started(JitterBufferConfig::default());
        let start = Instant::now();
        frame(&jb, 0, 2, 3000, Key);
        frame(&jb, 2, 2, 6000, Delta);
        let (fps, bps) = jb.incoming_rate_statistics(start + Duration::from_secs(2));
        // two frames over (at least) two seconds, averaged with the initial zero
        assert!(fps <= 1, "fps {}", fps);
        assert!(bps > 0 && bps <= 4 * 10 * 8, "bps {}", bps);
    }

    #[test]
    fn jitter_estimate_includes_os_jitter() {
        let jb = started(JitterBufferConfig::default());
        assert!(jb.estimated_jitter_ms() >= 10);
    }

    fn nack_disabled() -> JitterBufferConfig {
        JitterBufferConfig {
            nack_mode: NackMode::Disabled,
            ..JitterBufferConfig::default()
        }
    }

    #[test]
    fn frame_still_arriving_is_not_handed_out() {
        let jb = started(nack_disabled());
        frame(&jb, 0, 10, 0, Key);
        let f = jb.get_complete_frame_for_decoding(no_wait()).unwrap().unwrap();
        jb.release_frame(f.handle());
        for i in 0..10u16 {
            let outcome = jb.insert(pk(10 + i, 3000, i == 0, i == 9, Delta)).unwrap();
            if i < 9 {
                assert_eq!(outcome, InsertOutcome::Inserted, "packet {}", i);
                assert!(jb.get_complete_frame_for_decoding(no_wait()).unwrap().is_none());
            } else {
                assert_eq!(outcome, InsertOutcome::Complete);
            }
        }
        let f = jb.get_complete_frame_for_decoding(no_wait()).unwrap().unwrap();
        assert_eq!(f.timestamp(), 3000);
        assert!(f.is_complete());
        assert_eq!(f.packets().len(), 10);
        jb.release_frame(f.handle());
    }

    #[test]
    fn decodable_once_newer_frame_starts() {
        let jb = started(nack_disabled());
        frame(&jb, 0, 10, 0, Key);
        let f = jb.get_complete_frame_for_decoding(no_wait()).unwrap().unwrap();
        jb.release_frame(f.handle());
        // last packet of the frame at 3000 is lost
        for i in 0..9u16 {
            assert_eq!(
                jb.insert(pk(10 + i, 3000, i == 0, false, Delta)).unwrap(),
                InsertOutcome::Inserted
            );
        }
        assert_eq!(
            jb.insert(pk(20, 6000, true, false, Delta)).unwrap(),
            InsertOutcome::Decodable
        );
        let f = jb.get_complete_frame_for_decoding(no_wait()).unwrap().unwrap();
        assert_eq!(f.timestamp(), 3000);
        assert!(!f.is_complete());
        assert_eq!(f.packets().len(), 9);
        jb.release_frame(f.handle());
    }

    #[test]
    fn oversized_frame_discarded() {
        let jb = started(JitterBufferConfig {
            max_packets_per_frame: 2,
            ..JitterBufferConfig::default()
        });
        jb.insert(pk(0, 3000, true, false, Key)).unwrap();
        jb.insert(pk(1, 3000, false, false, Key)).unwrap();
        assert_eq!(
            jb.insert(pk(2, 3000, false, true, Key)).unwrap(),
            InsertOutcome::FrameDiscarded
        );
        assert_eq!(jb.drop_count(), 1);
        assert_eq!(jb.next_timestamp(no_wait()), None);
    }

    #[test]
    fn frame_flushed_between_get_and_insert() {
        let jb = started(JitterBufferConfig::default());
        let first = pk(0, 3000, true, false, Key);
        let handle = jb.get_frame(&first).unwrap();
        assert_eq!(jb.insert_packet(handle, first).unwrap(), InsertOutcome::Inserted);
        let second = pk(1, 3000, false, true, Key);
        assert_eq!(jb.get_frame(&second).unwrap(), handle);
        jb.flush();
        assert_eq!(
            jb.insert_packet(handle, second).unwrap(),
            InsertOutcome::FrameDiscarded
        );
        assert!(jb.get_complete_frame_for_decoding(no_wait()).unwrap().is_none());
    }

    #[test]
    fn high_rtt_stops_waiting_for_retransmissions() {
        let jb = started(JitterBufferConfig::default());
        jb.set_nack_mode(NackMode::Enabled, None, Some(150));
        jb.update_rtt(50);
        frame(&jb, 8, 2, 0, Key);
        let f = jb.get_complete_frame_for_decoding(no_wait()).unwrap().unwrap();
        jb.release_frame(f.handle());
        jb.insert(pk(10, 3000, true, false, Delta)).unwrap();
        jb.insert(pk(12, 3000, false, true, Delta)).unwrap();
        frame(&jb, 13, 1, 6000, Delta);
        assert_eq!(jb.get_nack_list(), (vec![11], false));
        // still worth waiting for seq 11
        assert!(jb.get_complete_frame_for_decoding(no_wait()).unwrap().is_none());

        jb.update_rtt(200);
        let f = jb.get_complete_frame_for_decoding(no_wait()).unwrap().unwrap();
        assert_eq!(f.timestamp(), 3000);
        assert!(!f.is_complete());
        jb.release_frame(f.handle());
    }

    #[test]
    fn next_timestamp_woken_by_insert() {
        let jb = std::sync::Arc::new(started(JitterBufferConfig::default()));
        let waiter = {
            let jb = jb.clone();
            std::thread::spawn(move || {
                let start = Instant::now();
                (jb.next_timestamp(Duration::from_secs(10)), start.elapsed())
            })
        };
        std::thread::sleep(Duration::from_millis(20));
        jb.insert(pk(1, 3000, true, false, Key)).unwrap();
        let (next, waited) = waiter.join().unwrap();
        assert_eq!(next, Some((3000, Key)));
        assert!(waited < Duration::from_secs(5));
    }

    #[test]
    fn estimate_fed_by_frames_never_retrieved() {
        let fresh = started(JitterBufferConfig::default()).estimated_jitter_ms();
        let kept = started(JitterBufferConfig::default());
        let drained = started(JitterBufferConfig::default());
        let base = Instant::now();
        for i in 0..60u16 {
            let jitter = if i % 2 == 0 { 0 } else { 40 };
            let arrival = base + Duration::from_millis(u64::from(i) * 33 + jitter);
            let frame_type = if i == 0 { Key } else { Delta };
            let packet = Packet::new(
                i,
                u32::from(i) * 3000,
                true,
                video(true, frame_type),
                vec![0; 1000],
                arrival,
            );
            kept.insert(packet.clone()).unwrap();
            drained.insert(packet).unwrap();
            let f = drained
                .get_complete_frame_for_decoding(no_wait())
                .unwrap()
                .unwrap();
            drained.release_frame(f.handle());
        }
        assert_eq!(kept.estimated_jitter_ms(), drained.estimated_jitter_ms());
        assert!(kept.estimated_jitter_ms() > fresh);
    }
}
