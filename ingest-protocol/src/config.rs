//! Error-correction and latency configuration

use crate::handshake::FecParams;
use std::time::Duration;

/// How the latency budget evolves over the life of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LatencyMode {
    /// Always `max_latency`
    #[default]
    Static,
    /// Start at half of `max_latency` and grow after every give-up
    Increasing,
    /// Follow a multiple of the measured round trip
    Dynamic,
}

/// Parity generation mode requested from the sender
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FecMode {
    #[default]
    Off,
    /// Fixed `fec_overhead`
    On,
    /// Overhead tuned from observed loss
    Adaptive,
}

impl FecMode {
    pub fn as_u8(self) -> u8 {
        match self {
            FecMode::Off => 0,
            FecMode::On => 1,
            FecMode::Adaptive => 2,
        }
    }

    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => FecMode::On,
            2 => FecMode::Adaptive,
            _ => FecMode::Off,
        }
    }
}

/// Error-correction settings for a receiving session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorCorrectionConfig {
    /// Upper bound between arrival and delivery of any packet
    pub max_latency: Duration,
    pub latency_mode: LatencyMode,
    pub fec_mode: FecMode,
    /// Retransmission requests for missing packets
    pub arq: bool,
    /// Parity overhead in percent of source packets
    pub fec_overhead: u8,
    /// Duration covered by one FEC block
    pub fec_block: Duration,
    pub content_aware: bool,
    /// Replace unrecovered packets with null filler instead of flagging a gap
    pub stuff_null_on_unrecovered: bool,
    /// Maximum pacing delay added to smooth output; zero releases immediately
    pub max_output_jitter: Duration,
    /// Deliver every packet at exactly its send time plus `max_latency`
    pub fixed_end_to_end_delay: bool,
}

impl Default for ErrorCorrectionConfig {
    fn default() -> Self {
        ErrorCorrectionConfig {
            max_latency: Duration::from_millis(1000),
            latency_mode: LatencyMode::Static,
            fec_mode: FecMode::Off,
            arq: true,
            fec_overhead: 30,
            fec_block: Duration::from_millis(50),
            content_aware: false,
            stuff_null_on_unrecovered: false,
            max_output_jitter: Duration::ZERO,
            fixed_end_to_end_delay: false,
        }
    }
}

impl ErrorCorrectionConfig {
    pub fn validate(&self) -> Result<(), crate::ErrorCode> {
        if self.max_latency.is_zero() || self.fec_overhead > 100 {
            return Err(crate::ErrorCode::InvalidParameter);
        }
        if self.fec_mode != FecMode::Off && self.fec_block.is_zero() {
            return Err(crate::ErrorCode::InvalidParameter);
        }
        Ok(())
    }

    pub fn recovery_mode(&self) -> RecoveryMode {
        match (self.fec_mode, self.arq) {
            (FecMode::Off, false) => RecoveryMode::Off,
            (FecMode::Off, true) => RecoveryMode::Arq,
            (FecMode::On, false) => RecoveryMode::Fec,
            (FecMode::On, true) => RecoveryMode::FecArq,
            (FecMode::Adaptive, _) => RecoveryMode::Adaptive,
        }
    }

    /// Parameters announced to the sender in the handshake
    pub fn fec_params(&self) -> FecParams {
        FecParams {
            mode: self.fec_mode.as_u8(),
            arq: self.arq,
            overhead: self.fec_overhead,
            block_ms: self.fec_block.as_millis().min(u16::MAX as u128) as u16,
            content_aware: self.content_aware,
        }
    }
}

/// Recovery strategy derived from the configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryMode {
    Off,
    Arq,
    Fec,
    FecArq,
    /// FEC with tuned overhead plus retransmission
    Adaptive,
}

impl RecoveryMode {
    pub fn uses_fec(self) -> bool {
        matches!(
            self,
            RecoveryMode::Fec | RecoveryMode::FecArq | RecoveryMode::Adaptive
        )
    }

    pub fn uses_arq(self) -> bool {
        matches!(
            self,
            RecoveryMode::Arq | RecoveryMode::FecArq | RecoveryMode::Adaptive
        )
    }
}
