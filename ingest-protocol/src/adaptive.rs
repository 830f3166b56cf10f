//! Adaptive control
//!
//! Three controllers driven by periodic [`NetworkSample`]s:
//!
//! - [`BitrateController`] picks one of the advertised bitrate variants on
//!   the receiving side.
//! - [`EncoderController`] turns receiver reports into target bitrates for
//!   an external encoder on the sending side.
//! - [`FecTuner`] adjusts the parity overhead in adaptive FEC mode.
//!
//! All three switch only after a run of consistent samples so a single
//! noisy interval does not cause oscillation.

use crate::error::ErrorCode;
use std::time::{Duration, Instant};

/// Network conditions observed over one sampling interval
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct NetworkSample {
    /// Loss before recovery, 0.0 to 1.0
    pub loss_rate: f64,
    /// Packets still missing after recovery, 0.0 to 1.0
    pub residual_loss: f64,
    pub rtt: Duration,
    /// Largest arrival-to-delivery delay seen in the interval
    pub recovery_latency: Duration,
    /// Payload throughput in bits per second
    pub throughput_bps: u64,
}

/// Unicast adaptive bitrate settings
#[derive(Debug, Clone, PartialEq)]
pub struct AdaptiveConfig {
    pub enabled: bool,
    /// Start at the highest variant not above this; 0 starts at the highest
    /// variant allowed by `max_bitrate`
    pub initial_bitrate: u32,
    /// 0 means no limit
    pub max_bitrate: u32,
    /// Recovery latency above which a sample counts as degraded
    pub down_threshold: Duration,
    /// Loss rate above which a sample counts as degraded
    pub loss_ceiling: f64,
    /// Consecutive degraded samples before switching down
    pub down_hold: u32,
    /// Consecutive clean samples before switching up
    pub up_hold: u32,
    pub sample_interval: Duration,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        AdaptiveConfig {
            enabled: true,
            initial_bitrate: 0,
            max_bitrate: 0,
            down_threshold: Duration::from_millis(500),
            loss_ceiling: 0.10,
            down_hold: 3,
            up_hold: 10,
            sample_interval: Duration::from_secs(1),
        }
    }
}

/// Chooses among advertised bitrate variants
#[derive(Debug, Clone)]
pub struct BitrateController {
    config: AdaptiveConfig,
    /// Ascending, only variants within `max_bitrate`
    variants: Vec<u32>,
    current: usize,
    manual: bool,
    degraded_run: u32,
    clean_run: u32,
}

impl BitrateController {
    pub fn new(config: AdaptiveConfig, advertised: &[u32]) -> Self {
        let mut variants: Vec<u32> = advertised
            .iter()
            .copied()
            .filter(|&b| b > 0 && (config.max_bitrate == 0 || b <= config.max_bitrate))
            .collect();
        variants.sort_unstable();
        variants.dedup();

        let ceiling = match config.initial_bitrate {
            0 => u32::MAX,
            initial => initial,
        };
        let current = variants
            .iter()
            .rposition(|&b| b <= ceiling)
            .unwrap_or(0);

        BitrateController {
            config,
            variants,
            current,
            manual: false,
            degraded_run: 0,
            clean_run: 0,
        }
    }

    pub fn variants(&self) -> &[u32] {
        &self.variants
    }

    pub fn current_index(&self) -> usize {
        self.current
    }

    pub fn current_bitrate(&self) -> Option<u32> {
        self.variants.get(self.current).copied()
    }

    pub fn is_manual(&self) -> bool {
        self.manual
    }

    /// Feed one sample; returns the new bitrate when a switch happens
    pub fn observe(&mut self, sample: &NetworkSample) -> Option<u32> {
        if !self.config.enabled || self.manual || self.variants.len() < 2 {
            return None;
        }
        let current = self.variants[self.current];

        if self.is_degraded(sample, current) {
            self.clean_run = 0;
            self.degraded_run += 1;
            if self.degraded_run >= self.config.down_hold && self.current > 0 {
                self.degraded_run = 0;
                self.current -= 1;
                tracing::info!("bitrate down {} -> {}", current, self.variants[self.current]);
                return Some(self.variants[self.current]);
            }
        } else {
            self.degraded_run = 0;
            self.clean_run += 1;
            if self.clean_run >= self.config.up_hold && self.current + 1 < self.variants.len() {
                self.clean_run = 0;
                self.current += 1;
                tracing::info!("bitrate up {} -> {}", current, self.variants[self.current]);
                return Some(self.variants[self.current]);
            }
        }
        None
    }

    fn is_degraded(&self, sample: &NetworkSample, current: u32) -> bool {
        let slow = sample.throughput_bps > 0
            && sample.throughput_bps < current as u64 * 3 / 4;
        sample.recovery_latency > self.config.down_threshold
            || sample.loss_rate > self.config.loss_ceiling
            || slow
    }

    /// Manual selection by bitrate; 0 returns to automatic switching
    ///
    /// Returns the bitrate to request from the sender when it changed.
    pub fn select(&mut self, bitrate: u32) -> Result<Option<u32>, ErrorCode> {
        if bitrate == 0 {
            self.manual = false;
            self.degraded_run = 0;
            self.clean_run = 0;
            return Ok(None);
        }
        if self.variants.is_empty() {
            return Err(ErrorCode::NotSupported);
        }
        let index = self
            .variants
            .iter()
            .position(|&b| b == bitrate)
            .ok_or(ErrorCode::InvalidParameter)?;
        let changed = index != self.current;
        let bitrate = self.select_index(index)?;
        Ok(changed.then_some(bitrate))
    }

    /// Manual selection by position in [`variants`](Self::variants)
    pub fn select_index(&mut self, index: usize) -> Result<u32, ErrorCode> {
        if self.variants.is_empty() {
            return Err(ErrorCode::NotSupported);
        }
        let bitrate = *self.variants.get(index).ok_or(ErrorCode::InvalidParameter)?;
        self.manual = true;
        self.current = index;
        Ok(bitrate)
    }
}

/// Encoder feedback bounds for the sending side
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EncoderControl {
    pub min_bitrate: u32,
    pub max_bitrate: u32,
    /// 0 (gentle) to 100 (aggressive) step size
    pub aggressiveness: u8,
    pub update_interval: Duration,
}

impl Default for EncoderControl {
    fn default() -> Self {
        EncoderControl {
            min_bitrate: 500_000,
            max_bitrate: 8_000_000,
            aggressiveness: 50,
            update_interval: Duration::from_secs(1),
        }
    }
}

/// Target handed to the encoder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncoderFeedback {
    pub bitrate: u32,
    /// Set when unrecovered loss reached the receiver
    pub force_iframe: bool,
}

const ENCODER_LOSS_THRESHOLD: f64 = 0.02;
const IFRAME_RESIDUAL_THRESHOLD: f64 = 0.001;

pub struct EncoderController {
    control: EncoderControl,
    current: u32,
    last_update: Option<Instant>,
}

impl EncoderController {
    pub fn new(control: EncoderControl) -> Self {
        EncoderController {
            current: control.max_bitrate,
            control,
            last_update: None,
        }
    }

    pub fn current_bitrate(&self) -> u32 {
        self.current
    }

    /// Feedback for the encoder, at most once per `update_interval`
    pub fn observe(&mut self, sample: &NetworkSample, now: Instant) -> Option<EncoderFeedback> {
        if let Some(last) = self.last_update {
            if now.saturating_duration_since(last) < self.control.update_interval {
                return None;
            }
        }
        self.last_update = Some(now);

        let step = 0.05 + 0.25 * self.control.aggressiveness.min(100) as f64 / 100.0;
        let target = if sample.loss_rate > ENCODER_LOSS_THRESHOLD {
            self.current as f64 * (1.0 - step)
        } else {
            self.current as f64 * (1.0 + step / 2.0)
        };
        let target =
            (target.round() as u32).clamp(self.control.min_bitrate, self.control.max_bitrate);
        let force_iframe = sample.residual_loss > IFRAME_RESIDUAL_THRESHOLD;

        if target == self.current && !force_iframe {
            return None;
        }
        self.current = target;
        Some(EncoderFeedback {
            bitrate: target,
            force_iframe,
        })
    }
}

/// Parity overhead tuner for adaptive FEC
///
/// Raises the overhead when loss stays above `increase_threshold` for
/// `stable_threshold` samples and lowers it when loss stays below
/// `decrease_threshold` for as long.
#[derive(Debug, Clone)]
pub struct FecTuner {
    overhead: u8,
    min_overhead: u8,
    max_overhead: u8,
    step: u8,
    increase_threshold: f64,
    decrease_threshold: f64,
    stable_count: u32,
    stable_threshold: u32,
}

impl FecTuner {
    pub fn new(initial_overhead: u8) -> Self {
        FecTuner {
            overhead: initial_overhead.clamp(5, 50),
            min_overhead: 5,
            max_overhead: 50,
            step: 5,
            increase_threshold: 0.02,
            decrease_threshold: 0.005,
            stable_count: 0,
            stable_threshold: 3,
        }
    }

    pub fn set_range(&mut self, min: u8, max: u8) {
        self.min_overhead = min;
        self.max_overhead = max.max(min);
        self.overhead = self.overhead.clamp(self.min_overhead, self.max_overhead);
    }

    pub fn set_thresholds(&mut self, increase: f64, decrease: f64) {
        self.increase_threshold = increase;
        self.decrease_threshold = decrease;
    }

    pub fn overhead(&self) -> u8 {
        self.overhead
    }

    /// Returns the new overhead when it changed
    pub fn update(&mut self, loss_rate: f64) -> Option<u8> {
        let old = self.overhead;

        if loss_rate > self.increase_threshold && self.overhead < self.max_overhead {
            self.stable_count += 1;
            if self.stable_count >= self.stable_threshold {
                // Jump straight to cover the observed loss when it is far off.
                let needed = (loss_rate * 200.0).ceil().min(100.0) as u8;
                self.overhead = needed
                    .max(self.overhead.saturating_add(self.step))
                    .min(self.max_overhead);
                self.stable_count = 0;
            }
        } else if loss_rate < self.decrease_threshold && self.overhead > self.min_overhead {
            self.stable_count += 1;
            if self.stable_count >= self.stable_threshold {
                self.overhead = self.overhead.saturating_sub(self.step).max(self.min_overhead);
                self.stable_count = 0;
            }
        } else {
            self.stable_count = 0;
        }

        (self.overhead != old).then_some(self.overhead)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clean() -> NetworkSample {
        NetworkSample {
            rtt: Duration::from_millis(20),
            recovery_latency: Duration::from_millis(30),
            ..NetworkSample::default()
        }
    }

    fn lossy() -> NetworkSample {
        NetworkSample {
            loss_rate: 0.2,
            ..clean()
        }
    }

    #[test]
    fn test_initial_variant_respects_limits() {
        let config = AdaptiveConfig {
            initial_bitrate: 3_000_000,
            max_bitrate: 4_000_000,
            ..AdaptiveConfig::default()
        };
        let controller =
            BitrateController::new(config, &[5_000_000, 1_000_000, 2_500_000, 4_000_000]);
        assert_eq!(controller.variants(), &[1_000_000, 2_500_000, 4_000_000]);
        assert_eq!(controller.current_bitrate(), Some(2_500_000));
    }

    #[test]
    fn test_down_switch_needs_hold() {
        let mut controller =
            BitrateController::new(AdaptiveConfig::default(), &[1_000_000, 2_000_000]);
        assert_eq!(controller.current_bitrate(), Some(2_000_000));

        assert_eq!(controller.observe(&lossy()), None);
        assert_eq!(controller.observe(&lossy()), None);
        assert_eq!(controller.observe(&clean()), None);
        assert_eq!(controller.observe(&lossy()), None);
        assert_eq!(controller.observe(&lossy()), None);
        assert_eq!(controller.observe(&lossy()), Some(1_000_000));
    }

    #[test]
    fn test_up_switch_after_clean_run() {
        let config = AdaptiveConfig {
            initial_bitrate: 1_000_000,
            ..AdaptiveConfig::default()
        };
        let mut controller = BitrateController::new(config, &[1_000_000, 2_000_000]);
        for _ in 0..9 {
            assert_eq!(controller.observe(&clean()), None);
        }
        assert_eq!(controller.observe(&clean()), Some(2_000_000));
    }

    #[test]
    fn test_latency_over_threshold_degrades() {
        let mut controller =
            BitrateController::new(AdaptiveConfig::default(), &[1_000_000, 2_000_000]);
        let slow = NetworkSample {
            recovery_latency: Duration::from_millis(800),
            ..clean()
        };
        controller.observe(&slow);
        controller.observe(&slow);
        assert_eq!(controller.observe(&slow), Some(1_000_000));
    }

    #[test]
    fn test_manual_override() {
        let mut controller =
            BitrateController::new(AdaptiveConfig::default(), &[1_000_000, 2_000_000]);
        assert_eq!(controller.select(1_000_000), Ok(Some(1_000_000)));
        assert!(controller.is_manual());
        for _ in 0..20 {
            assert_eq!(controller.observe(&clean()), None);
        }
        assert_eq!(controller.select(3), Err(ErrorCode::InvalidParameter));
        assert_eq!(controller.select(0), Ok(None));
        assert!(!controller.is_manual());

        let mut empty = BitrateController::new(AdaptiveConfig::default(), &[]);
        assert_eq!(empty.select(1_000_000), Err(ErrorCode::NotSupported));
        assert_eq!(empty.select_index(0), Err(ErrorCode::NotSupported));
    }

    #[test]
    fn test_encoder_feedback_bounds() {
        let start = Instant::now();
        let mut controller = EncoderController::new(EncoderControl {
            min_bitrate: 1_000_000,
            max_bitrate: 2_000_000,
            aggressiveness: 100,
            update_interval: Duration::from_millis(500),
        });

        let feedback = controller.observe(&lossy(), start).unwrap();
        assert_eq!(feedback.bitrate, 1_400_000);
        assert!(controller.observe(&lossy(), start + Duration::from_millis(100)).is_none());

        let feedback = controller
            .observe(&lossy(), start + Duration::from_millis(600))
            .unwrap();
        assert_eq!(feedback.bitrate, 1_000_000);

        let residual = NetworkSample {
            residual_loss: 0.01,
            ..lossy()
        };
        let feedback = controller
            .observe(&residual, start + Duration::from_millis(1200))
            .unwrap();
        assert_eq!(feedback.bitrate, 1_000_000);
        assert!(feedback.force_iframe);
    }

    #[test]
    fn test_fec_tuner_hysteresis() {
        let mut tuner = FecTuner::new(10);
        assert_eq!(tuner.update(0.05), None);
        assert_eq!(tuner.update(0.05), None);
        assert_eq!(tuner.update(0.05), Some(15));

        assert_eq!(tuner.update(0.001), None);
        assert_eq!(tuner.update(0.01), None);
        assert_eq!(tuner.update(0.001), None);
        assert_eq!(tuner.update(0.001), None);
        assert_eq!(tuner.update(0.001), Some(10));
    }

    #[test]
    fn test_fec_tuner_jumps_on_heavy_loss() {
        let mut tuner = FecTuner::new(10);
        tuner.update(0.2);
        tuner.update(0.2);
        assert_eq!(tuner.update(0.2), Some(40));
    }
}
