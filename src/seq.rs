//! Wraparound-aware ordering for 16-bit RTP sequence numbers and 32-bit RTP timestamps.
//!
//! Every comparison of sequence numbers or timestamps in this crate goes through these
//! functions.  The relations are only meaningful while true reordering stays below half of the
//! number space (32768 packets, or 2^31 timestamp ticks).

/// `true` iff `a` is strictly newer than `b`, i.e. the forward distance from `b` to `a` is less
/// than half the sequence number space.
pub fn is_newer_sequence_number(a: u16, b: u16) -> bool {
    a != b && a.wrapping_sub(b) < 0x8000
}

/// Returns whichever of the two sequence numbers is the newer one.
pub fn latest_sequence_number(a: u16, b: u16) -> u16 {
    if is_newer_sequence_number(a, b) {
        a
    } else {
        b
    }
}

/// `true` iff timestamp `a` is strictly newer than `b`.
pub fn is_newer_timestamp(a: u32, b: u32) -> bool {
    a != b && a.wrapping_sub(b) < 0x8000_0000
}

/// Returns whichever of the two timestamps is the newer one.
pub fn latest_timestamp(a: u32, b: u32) -> u32 {
    if is_newer_timestamp(a, b) {
        a
    } else {
        b
    }
}

/// Extends 16-bit sequence numbers into a monotonic `i64` space, so that values can be used as
/// keys of ordered collections.  Each value is placed relative to the previously unwrapped one.
#[derive(Debug, Default, Clone)]
pub struct SequenceUnwrapper {
    last: Option<i64>,
}
impl SequenceUnwrapper {
    pub fn unwrap(&mut self, seq: u16) -> i64 {
        let value = self.peek(seq);
        self.last = Some(value);
        value
    }

    /// Like `unwrap()`, but without moving the reference point.
    pub fn peek(&self, seq: u16) -> i64 {
        match self.last {
            None => i64::from(seq),
            Some(last) => last + i64::from(seq.wrapping_sub(last as u16) as i16),
        }
    }

    pub fn reset(&mut self) {
        self.last = None;
    }
}

/// The 32-bit timestamp counterpart of `SequenceUnwrapper`.
#[derive(Debug, Default, Clone)]
pub struct TimestampUnwrapper {
    last: Option<i64>,
}
impl TimestampUnwrapper {
    pub fn unwrap(&mut self, ts: u32) -> i64 {
        let value = match self.last {
            None => i64::from(ts),
            Some(last) => last + i64::from(ts.wrapping_sub(last as u32) as i32),
        };
        self.last = Some(value);
        value
    }

    pub fn reset(&mut self) {
        self.last = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// small deterministic generator, so that the property checks below are reproducible
    struct Lcg(u64);
    impl Lcg {
        fn next(&mut self) -> u32 {
            self.0 = self
                .0
                .wrapping_mul(6_364_136_223_846_793_005)
                .wrapping_add(1_442_695_040_888_963_407);
            (self.0 >> 33) as u32
        }
    }

    #[test]
    fn newer_basics() {
        assert!(is_newer_sequence_number(1, 0));
        assert!(!is_newer_sequence_number(0, 1));
        assert!(!is_newer_sequence_number(7, 7));
        assert!(is_newer_sequence_number(0, 0xffff));
        assert!(is_newer_sequence_number(10, 0xfff0));
        assert!(!is_newer_sequence_number(0xfff0, 10));
        // exactly half way round: neither is newer
        assert!(!is_newer_sequence_number(0x8000, 0));
        assert!(!is_newer_sequence_number(0, 0x8000));
        assert!(is_newer_sequence_number(0x7fff, 0));
    }

    #[test]
    fn newer_is_invariant_under_shift() {
        let mut rng = Lcg(42);
        for _ in 0..20_000 {
            let a = rng.next() as u16;
            let b = rng.next() as u16;
            let k = rng.next() as u16;
            assert_eq!(
                is_newer_sequence_number(a, b),
                is_newer_sequence_number(a.wrapping_add(k), b.wrapping_add(k)),
                "a={} b={} k={}",
                a,
                b,
                k
            );
        }
    }

    #[test]
    fn newer_is_antisymmetric() {
        let mut rng = Lcg(7);
        for _ in 0..20_000 {
            let a = rng.next() as u16;
            let b = rng.next() as u16;
            assert!(!(is_newer_sequence_number(a, b) && is_newer_sequence_number(b, a)));
        }
    }

    #[test]
    fn timestamps() {
        assert!(is_newer_timestamp(3000, 0));
        assert!(is_newer_timestamp(1000, 0xffff_fc18));
        assert!(!is_newer_timestamp(0xffff_fc18, 1000));
        assert_eq!(latest_timestamp(0xffff_fc18, 1000), 1000);
        assert_eq!(latest_timestamp(1000, 0xffff_fc18), 1000);
        let mut rng = Lcg(99);
        for _ in 0..10_000 {
            let a = rng.next();
            let b = rng.next();
            let k = rng.next();
            assert_eq!(
                is_newer_timestamp(a, b),
                is_newer_timestamp(a.wrapping_add(k), b.wrapping_add(k))
            );
        }
    }

    #[test]
    fn latest() {
        assert_eq!(latest_sequence_number(0xfffe, 2), 2);
        assert_eq!(latest_sequence_number(2, 0xfffe), 2);
        assert_eq!(latest_sequence_number(5, 5), 5);
    }

    #[test]
    fn unwrap_across_wrap() {
        let mut u = SequenceUnwrapper::default();
        assert_eq!(u.unwrap(0xfffe), 0xfffe);
        assert_eq!(u.unwrap(0xffff), 0xffff);
        assert_eq!(u.unwrap(0), 0x1_0000);
        assert_eq!(u.unwrap(3), 0x1_0003);
        // reordered packet from before the wrap
        assert_eq!(u.unwrap(0xfffd), 0xfffd);
        assert_eq!(u.peek(1), 0x1_0001);

        let mut t = TimestampUnwrapper::default();
        assert_eq!(t.unwrap(0xffff_ff00), 0xffff_ff00);
        assert_eq!(t.unwrap(0x100), 0x1_0000_0100);
    }
}
