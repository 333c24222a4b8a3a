//! Tracks sequence numbers presumed lost, for a retransmission requester to NACK.

use crate::seq::SequenceUnwrapper;
use std::collections::BTreeSet;

/// The set of missing sequence numbers between the last decoded packet and the newest packet
/// received.  Numbers are kept unwrapped so that the set stays ordered across wraparound.
#[derive(Debug)]
pub struct NackList {
    missing: BTreeSet<i64>,
    unwrapper: SequenceUnwrapper,
    /// high-water mark, unwrapped
    latest: Option<i64>,
    max_size: usize,
    max_age: u16,
    request_key_frame: bool,
}

impl NackList {
    pub fn new(max_size: usize, max_age: u16) -> NackList {
        NackList {
            missing: BTreeSet::new(),
            unwrapper: SequenceUnwrapper::default(),
            latest: None,
            max_size,
            max_age,
            request_key_frame: false,
        }
    }

    pub fn set_limits(&mut self, max_size: usize, max_age: u16) {
        self.max_size = max_size;
        self.max_age = max_age;
    }

    /// Accounts for a received packet.  Returns `true` if the packet had been presumed lost, i.e.
    /// it is (most likely) a retransmission.
    ///
    /// `last_decoded` is the sequence number of the last packet handed to the decoder; nothing
    /// at or before it is worth asking for again.
    pub fn on_packet(&mut self, seq: u16, last_decoded: Option<u16>) -> bool {
        let s = self.unwrapper.unwrap(seq);
        let mut latest = match (self.latest, last_decoded) {
            (Some(l), Some(d)) => l.max(self.unwrapper.peek(d)),
            (Some(l), None) => l,
            (None, Some(d)) => self.unwrapper.peek(d),
            (None, None) => {
                self.latest = Some(s);
                return false;
            }
        };
        if s <= latest {
            self.latest = Some(latest);
            return self.missing.remove(&s);
        }

        let oldest_worth_nacking = s - i64::from(self.max_age);
        if latest + 1 < oldest_worth_nacking {
            log::debug!(
                "gap of {} packets before seq {} exceeds max age {}",
                s - latest - 1,
                seq,
                self.max_age
            );
            self.request_key_frame = true;
        }
        self.missing
            .extend((latest + 1).max(oldest_worth_nacking)..s);
        latest = s;
        self.latest = Some(latest);

        if self.missing.len() > self.max_size {
            self.drop_older_than(latest - i64::from(self.max_age));
            if self.missing.len() > self.max_size {
                log::debug!(
                    "NACK list of {} entries too large, requesting key frame",
                    self.missing.len()
                );
                self.missing.clear();
                self.request_key_frame = true;
            }
        }
        if let Some(&oldest) = self.missing.iter().next() {
            if oldest < latest - i64::from(self.max_age) {
                log::debug!("missing packet too old to NACK, requesting key frame");
                self.drop_older_than(latest - i64::from(self.max_age));
                self.request_key_frame = true;
            }
        }
        false
    }

    fn drop_older_than(&mut self, limit: i64) {
        self.missing = self.missing.split_off(&limit);
    }

    /// Forgets missing packets at or before `seq`, once the decoder has moved past them.
    pub fn drop_up_to(&mut self, seq: u16) {
        let limit = self.unwrapper.peek(seq);
        self.drop_older_than(limit + 1);
    }

    /// The missing sequence numbers, oldest first, and whether loss has become unrecoverable so
    /// that a key frame should be requested.  Reading the flag clears it.
    pub fn get(&mut self) -> (Vec<u16>, bool) {
        let list = self.missing.iter().map(|&s| s as u16).collect();
        (list, std::mem::replace(&mut self.request_key_frame, false))
    }

    pub fn len(&self) -> usize {
        self.missing.len()
    }

    pub fn is_empty(&self) -> bool {
        self.missing.is_empty()
    }

    pub fn clear(&mut self) {
        self.missing.clear();
        self.unwrapper.reset();
        self.latest = None;
        self.request_key_frame = false;
    }
}
