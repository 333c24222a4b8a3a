//! Tunables for the jitter buffer.  The defaults are the values the receive pipeline has
//! historically run with; most of the decodability thresholds are heuristics rather than derived
//! quantities, so they are exposed here instead of being baked into the logic.

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackMode {
    /// Track missing packets and wait (up to an RTT-derived deadline) for retransmissions
    Enabled,
    /// Never wait for retransmissions; incomplete frames may be decoded with errors
    Disabled,
}

#[derive(Debug, Clone)]
pub struct JitterBufferConfig {
    /// Number of frame slots in the pool
    pub max_frames: usize,
    pub nack_mode: NackMode,
    /// RTT below which we rely on retransmissions alone.  Informational for callers sizing
    /// their render delay.
    pub low_rtt_nack_threshold_ms: Option<u32>,
    /// RTT at or above which we stop waiting for retransmissions, even with NACK enabled.
    /// `None` means always wait.
    pub high_rtt_nack_threshold_ms: Option<u32>,
    /// Upper bound on the number of missing sequence numbers tracked
    pub max_nack_list_size: usize,
    /// Missing packets older than this many sequence numbers are not worth requesting
    pub max_packet_age_to_nack: u16,
    /// Flush after this many consecutive packets older than the decoding state
    pub max_consecutive_old_packets: u32,
    /// Flush after this many consecutive frames completing too late to be decoded
    pub max_consecutive_old_frames: u32,
    /// Round-trip time assumed until `update_rtt()` is called
    pub default_rtt_ms: u32,
    /// Frames with more packets than this are rejected
    pub max_packets_per_frame: usize,
    pub decodable: DecodableSettings,
    pub estimator: JitterEstimatorConfig,
}
impl Default for JitterBufferConfig {
    fn default() -> Self {
        JitterBufferConfig {
            max_frames: 300,
            nack_mode: NackMode::Enabled,
            low_rtt_nack_threshold_ms: None,
            high_rtt_nack_threshold_ms: None,
            max_nack_list_size: 250,
            max_packet_age_to_nack: 450,
            max_consecutive_old_packets: 300,
            max_consecutive_old_frames: 60,
            default_rtt_ms: 200,
            max_packets_per_frame: 800,
            decodable: DecodableSettings::default(),
            estimator: JitterEstimatorConfig::default(),
        }
    }
}

/// Controls when an incomplete frame may be handed to the decoder at the cost of a glitch.
#[derive(Debug, Clone)]
pub struct DecodableSettings {
    /// Below this RTT a retransmission is cheap enough that incomplete frames are never decoded
    pub rtt_threshold_ms: u32,
    /// An incomplete frame holding between `low_packet_fraction` and `high_packet_fraction` of
    /// the average packets-per-frame is probably missing too much to be useful
    pub low_packet_fraction: f32,
    pub high_packet_fraction: f32,
    /// Number of frames for which the packets-per-frame average converges quickly
    pub fast_converge_frames: u32,
    pub fast_converge_multiplier: f32,
    pub normal_converge_multiplier: f32,
    /// With NACK enabled, an incomplete frame is re-evaluated for decodability once this many
    /// RTTs have passed since its first packet arrived
    pub retransmission_deadline_rtt_multiplier: f32,
}
impl Default for DecodableSettings {
    fn default() -> Self {
        DecodableSettings {
            rtt_threshold_ms: 100,
            low_packet_fraction: 0.2,
            high_packet_fraction: 0.8,
            fast_converge_frames: 5,
            fast_converge_multiplier: 0.4,
            normal_converge_multiplier: 0.2,
            retransmission_deadline_rtt_multiplier: 1.5,
        }
    }
}
impl DecodableSettings {
    pub(crate) fn retransmission_deadline(&self, rtt_ms: u32) -> Duration {
        let ms = f64::from(rtt_ms) * f64::from(self.retransmission_deadline_rtt_multiplier);
        Duration::from_micros((ms * 1000.0) as u64)
    }
}

#[derive(Debug, Clone)]
pub struct JitterEstimatorConfig {
    /// Frame-size filter factor
    pub phi: f64,
    /// Max-frame-size decay factor
    pub psi: f64,
    pub alpha_count_max: f64,
    pub theta_low: f64,
    /// Deviations larger than this many standard deviations are clamped
    pub num_std_dev_delay_outlier: f64,
    pub num_std_dev_frame_size_outlier: f64,
    pub noise_std_devs: f64,
    pub noise_std_dev_offset: f64,
    /// Added to every estimate to account for scheduling jitter on the receiver
    pub os_jitter_ms: f64,
    /// Samples needed before the filtered estimate is trusted
    pub startup_samples: u32,
    /// RTP clock rate of the video stream
    pub clock_rate_khz: f64,
}
impl Default for JitterEstimatorConfig {
    fn default() -> Self {
        JitterEstimatorConfig {
            phi: 0.97,
            psi: 0.9999,
            alpha_count_max: 400.0,
            theta_low: 0.000_001,
            num_std_dev_delay_outlier: 15.0,
            num_std_dev_frame_size_outlier: 3.0,
            noise_std_devs: 2.33,
            noise_std_dev_offset: 30.0,
            os_jitter_ms: 10.0,
            startup_samples: 30,
            clock_rate_khz: 90.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deadline_scales_with_rtt() {
        let s = DecodableSettings::default();
        assert_eq!(s.retransmission_deadline(100), Duration::from_millis(150));
        assert_eq!(s.retransmission_deadline(0), Duration::from_millis(0));
    }
}
