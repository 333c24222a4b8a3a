//! Estimates how much delay the network adds on top of the frames' capture spacing, so that a
//! renderer can size its playout delay.
//!
//! The model is `delay = slope * frame_size_delta + noise`: a Kalman filter tracks the slope (the
//! inverse of the channel capacity) and the offset, while the residual is tracked as a running
//! mean and variance.  The estimate is the delay a maximum-sized frame adds over an average one,
//! plus a noise margin.

use crate::config::JitterEstimatorConfig;
use crate::seq::TimestampUnwrapper;
use std::time::Instant;

/// Samples summed before the frame-size average switches to filtering
const FRAME_SIZE_STARTUP_SAMPLES: u32 = 5;
/// Retransmitted frames seen before the RTT is added to the estimate
const NACK_LIMIT: u32 = 3;
const MAX_ESTIMATE_MS: f64 = 10_000.0;

pub struct JitterEstimator {
    config: JitterEstimatorConfig,
    theta: [f64; 2],
    theta_cov: [[f64; 2]; 2],
    q_cov: [[f64; 2]; 2],
    var_noise: f64,
    avg_noise: f64,
    alpha_count: f64,
    avg_frame_size: f64,
    var_frame_size: f64,
    max_frame_size: f64,
    prev_frame_size: u32,
    fs_sum: u64,
    fs_count: u32,
    prev_estimate: Option<f64>,
    filter_jitter_estimate: f64,
    startup_count: u32,
    nack_count: u32,
    /// Largest estimate handed out since `set_max_jitter_estimate(true)`
    max_estimate: Option<u32>,
}

impl JitterEstimator {
    pub fn new(config: JitterEstimatorConfig) -> JitterEstimator {
        let mut est = JitterEstimator {
            config,
            theta: [0.0; 2],
            theta_cov: [[0.0; 2]; 2],
            q_cov: [[0.0; 2]; 2],
            var_noise: 0.0,
            avg_noise: 0.0,
            alpha_count: 1.0,
            avg_frame_size: 0.0,
            var_frame_size: 0.0,
            max_frame_size: 0.0,
            prev_frame_size: 0,
            fs_sum: 0,
            fs_count: 0,
            prev_estimate: None,
            filter_jitter_estimate: 0.0,
            startup_count: 0,
            nack_count: 0,
            max_estimate: None,
        };
        est.reset();
        est
    }

    pub fn reset(&mut self) {
        // 512 kbit/s expressed in bytes per ms
        self.theta = [1.0 / (512e3 / 8.0), 0.0];
        self.var_noise = 4.0;
        self.theta_cov = [[1e-4, 0.0], [0.0, 1e2]];
        self.q_cov = [[2.5e-10, 0.0], [0.0, 1e-10]];
        self.avg_frame_size = 500.0;
        self.max_frame_size = 500.0;
        self.var_frame_size = 100.0;
        self.prev_estimate = None;
        self.prev_frame_size = 0;
        self.avg_noise = 0.0;
        self.alpha_count = 1.0;
        self.filter_jitter_estimate = 0.0;
        self.nack_count = 0;
        self.fs_sum = 0;
        self.fs_count = 0;
        self.startup_count = 0;
        if self.max_estimate.is_some() {
            self.max_estimate = Some(0);
        }
    }

    /// Feeds one frame: `frame_delay_ms` as produced by `InterFrameDelay`, and the frame's size.
    pub fn update_estimate(&mut self, frame_delay_ms: i64, frame_size: u32, incomplete: bool) {
        if frame_size == 0 {
            return;
        }
        let size = f64::from(frame_size);
        let delta_fs = f64::from(frame_size) - f64::from(self.prev_frame_size);
        if self.fs_count < FRAME_SIZE_STARTUP_SAMPLES {
            self.fs_sum += u64::from(frame_size);
            self.fs_count += 1;
        } else if self.fs_count == FRAME_SIZE_STARTUP_SAMPLES {
            self.avg_frame_size = self.fs_sum as f64 / f64::from(self.fs_count);
            self.fs_count += 1;
        }
        let phi = self.config.phi;
        if !incomplete || size > self.avg_frame_size {
            let avg = phi * self.avg_frame_size + (1.0 - phi) * size;
            // large frames (key frames, most likely) don't move the average
            if size < self.avg_frame_size + 2.0 * self.var_frame_size.sqrt() {
                self.avg_frame_size = avg;
            }
            self.var_frame_size = (phi * self.var_frame_size
                + (1.0 - phi) * (size - avg) * (size - avg))
                .max(1.0);
        }
        self.max_frame_size = (self.config.psi * self.max_frame_size).max(size);

        if self.prev_frame_size == 0 {
            self.prev_frame_size = frame_size;
            return;
        }
        self.prev_frame_size = frame_size;

        let delay = frame_delay_ms as f64;
        let deviation = self.deviation_from_expected_delay(delay, delta_fs);
        let outlier_limit = self.config.num_std_dev_delay_outlier * self.var_noise.sqrt();
        if deviation.abs() < outlier_limit
            || size
                > self.avg_frame_size
                    + self.config.num_std_dev_frame_size_outlier * self.var_frame_size.sqrt()
        {
            self.estimate_random_jitter(deviation, incomplete);
            // a normal frame arriving right behind a delayed large one says nothing about the
            // channel
            if (!incomplete || deviation >= 0.0) && delta_fs > -0.25 * self.max_frame_size {
                self.kalman_estimate_channel(delay, delta_fs);
            }
        } else {
            let clamped = if deviation >= 0.0 {
                outlier_limit
            } else {
                -outlier_limit
            };
            self.estimate_random_jitter(clamped, incomplete);
        }

        if self.startup_count >= self.config.startup_samples {
            self.filter_jitter_estimate = self.calculate_estimate();
        } else {
            self.startup_count += 1;
        }
    }

    /// Counts a frame that needed a retransmission.
    pub fn frame_nacked(&mut self) {
        if self.nack_count < NACK_LIMIT {
            self.nack_count += 1;
        }
    }

    pub fn reset_nack_count(&mut self) {
        self.nack_count = 0;
    }

    /// When enabled, `jitter_estimate()` never returns less than its largest previous result.
    pub fn set_max_jitter_estimate(&mut self, enable: bool) {
        self.max_estimate = if enable { Some(0) } else { None };
    }

    /// The jitter estimate in milliseconds.  `rtt_multiplier` scales how much of the RTT is
    /// added once retransmissions have been observed.
    pub fn jitter_estimate(&mut self, rtt_ms: u32, rtt_multiplier: f64) -> u32 {
        let mut jitter = self.calculate_estimate() + self.config.os_jitter_ms;
        if self.filter_jitter_estimate > jitter {
            jitter = self.filter_jitter_estimate;
        }
        if self.nack_count >= NACK_LIMIT {
            jitter += f64::from(rtt_ms) * rtt_multiplier;
        }
        let jitter = (jitter + 0.5) as u32;
        match self.max_estimate {
            Some(ref mut max) => {
                *max = (*max).max(jitter);
                *max
            }
            None => jitter,
        }
    }

    fn deviation_from_expected_delay(&self, delay_ms: f64, delta_fs: f64) -> f64 {
        delay_ms - (self.theta[0] * delta_fs + self.theta[1])
    }

    fn kalman_estimate_channel(&mut self, delay_ms: f64, delta_fs: f64) {
        // prediction: M = M + Q
        for i in 0..2 {
            for j in 0..2 {
                self.theta_cov[i][j] += self.q_cov[i][j];
            }
        }
        let mh = [
            self.theta_cov[0][0] * delta_fs + self.theta_cov[0][1],
            self.theta_cov[1][0] * delta_fs + self.theta_cov[1][1],
        ];
        if self.max_frame_size < 1.0 {
            return;
        }
        // small size changes make for noisy measurements
        let sigma = ((300.0 * (-delta_fs.abs() / self.max_frame_size).exp() + 1.0)
            * self.var_noise.sqrt())
        .max(1.0);
        let hmh_sigma = delta_fs * mh[0] + mh[1] + sigma;
        if hmh_sigma.abs() < 1e-9 {
            log::warn!("degenerate jitter filter update ignored");
            return;
        }
        let gain = [mh[0] / hmh_sigma, mh[1] / hmh_sigma];

        let residual = delay_ms - (delta_fs * self.theta[0] + self.theta[1]);
        self.theta[0] += gain[0] * residual;
        self.theta[1] += gain[1] * residual;
        if self.theta[0] < self.config.theta_low {
            self.theta[0] = self.config.theta_low;
        }

        // correction: M = (I - K*h) * M
        let t00 = self.theta_cov[0][0];
        let t01 = self.theta_cov[0][1];
        self.theta_cov[0][0] = (1.0 - gain[0] * delta_fs) * t00 - gain[0] * self.theta_cov[1][0];
        self.theta_cov[0][1] = (1.0 - gain[0] * delta_fs) * t01 - gain[0] * self.theta_cov[1][1];
        self.theta_cov[1][0] = self.theta_cov[1][0] * (1.0 - gain[1]) - gain[1] * delta_fs * t00;
        self.theta_cov[1][1] = self.theta_cov[1][1] * (1.0 - gain[1]) - gain[1] * delta_fs * t01;
    }

    fn estimate_random_jitter(&mut self, d_dt: f64, incomplete: bool) {
        let alpha = (self.alpha_count - 1.0) / self.alpha_count;
        self.alpha_count = (self.alpha_count + 1.0).min(self.config.alpha_count_max);
        let avg_noise = alpha * self.avg_noise + (1.0 - alpha) * d_dt;
        let var_noise = alpha * self.var_noise
            + (1.0 - alpha) * (d_dt - self.avg_noise) * (d_dt - self.avg_noise);
        if !incomplete || var_noise > self.var_noise {
            self.avg_noise = avg_noise;
            self.var_noise = var_noise;
        }
        // a zero variance would turn every later sample into an outlier
        if self.var_noise < 1.0 {
            self.var_noise = 1.0;
        }
    }

    fn noise_threshold(&self) -> f64 {
        (self.config.noise_std_devs * self.var_noise.sqrt() - self.config.noise_std_dev_offset)
            .max(1.0)
    }

    fn calculate_estimate(&mut self) -> f64 {
        let mut ret =
            self.theta[0] * (self.max_frame_size - self.avg_frame_size) + self.noise_threshold();
        if ret < 1.0 {
            ret = match self.prev_estimate {
                Some(prev) if prev > 0.01 => prev,
                _ => 1.0,
            };
        }
        let ret = ret.min(MAX_ESTIMATE_MS);
        self.prev_estimate = Some(ret);
        ret
    }
}

/// Turns (timestamp, arrival time) pairs of consecutive frames into the extra delay the network
/// added between them.
#[derive(Debug, Default)]
pub struct InterFrameDelay {
    unwrapper: TimestampUnwrapper,
    prev: Option<(i64, Instant)>,
}
impl InterFrameDelay {
    /// Returns `None` for a frame that was reordered behind an already seen later frame.  The
    /// very first frame yields a delay of zero.
    pub fn calculate_delay(
        &mut self,
        timestamp: u32,
        arrival: Instant,
        clock_rate_khz: f64,
    ) -> Option<i64> {
        let ts = self.unwrapper.unwrap(timestamp);
        let (prev_ts, prev_arrival) = match self.prev {
            None => {
                self.prev = Some((ts, arrival));
                return Some(0);
            }
            Some(prev) => prev,
        };
        if ts < prev_ts {
            return None;
        }
        let ts_delta_ms = ((ts - prev_ts) as f64 / clock_rate_khz + 0.5) as i64;
        let arrival_delta_ms = if arrival >= prev_arrival {
            arrival.duration_since(prev_arrival).as_millis() as i64
        } else {
            -(prev_arrival.duration_since(arrival).as_millis() as i64)
        };
        self.prev = Some((ts, arrival));
        Some(arrival_delta_ms - ts_delta_ms)
    }

    pub fn reset(&mut self) {
        self.unwrapper.reset();
        self.prev = None;
    }
}
