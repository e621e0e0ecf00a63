//! `CaptureSession` and `CaptureChannel`: the mutable value-types a caller
//! hands to a driver and gets back filled with samples.

use serde::{Deserialize, Serialize};

use super::error::{CaptureError, CaptureResult};
use super::wire::TriggerType;

/// Channel packing mode; determines the byte divisor applied to a
/// device's raw buffer size when computing the max total sample count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CaptureMode {
    Channels8,
    Channels16,
    Channels24,
}

impl CaptureMode {
    pub fn divisor(self) -> u32 {
        match self {
            CaptureMode::Channels8 => 1,
            CaptureMode::Channels16 => 2,
            CaptureMode::Channels24 => 4,
        }
    }

    /// Infer the tightest mode that fits `channel_count` channels.
    pub fn for_channel_count(channel_count: usize) -> Self {
        if channel_count <= 8 {
            CaptureMode::Channels8
        } else if channel_count <= 16 {
            CaptureMode::Channels16
        } else {
            CaptureMode::Channels24
        }
    }
}

/// Wire format the network driver should request/parse capture data in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataFormat {
    Binary,
    Json,
    Csv,
    Raw,
}

/// A single logic channel, owned by its session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureChannel {
    pub channel_number: u8,
    pub name: String,
    /// One byte (0/1) per sample index, filled in by the driver after a
    /// successful capture. Empty until capture completes.
    pub samples: Vec<u8>,
}

impl CaptureChannel {
    pub fn new(channel_number: u8, name: impl Into<String>) -> Self {
        Self {
            channel_number,
            name: name.into(),
            samples: Vec::new(),
        }
    }
}

/// A capture request/result: created by the caller, mutated only by the
/// driver (to fill `channels[*].samples`), and owned by the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureSession {
    pub frequency: u32,
    pub pre_trigger_samples: u32,
    pub post_trigger_samples: u32,
    pub trigger_type: TriggerType,
    pub trigger_channel: u8,
    pub trigger_inverted: bool,
    pub trigger_pattern: u16,
    pub trigger_bit_count: u8,
    pub loop_count: u8,
    pub measure_bursts: bool,
    pub data_format: DataFormat,
    pub channels: Vec<CaptureChannel>,
}

impl CaptureSession {
    pub fn total_samples(&self) -> u32 {
        self.pre_trigger_samples + self.post_trigger_samples
    }

    /// Validate the session against a device's buffer size, per §3's
    /// invariants: total ≤ buffer/divisor, pre ∈ [2, total/10], post ∈
    /// [2, total-2].
    pub fn validate(&self, device_buffer_size: u32) -> CaptureResult<()> {
        if self.channels.is_empty() {
            return Err(CaptureError::BadParams("no channels selected".into()));
        }
        let mode = CaptureMode::for_channel_count(self.channels.len());
        let max_total = device_buffer_size / mode.divisor();
        let total = self.total_samples();

        if total == 0 || total > max_total {
            return Err(CaptureError::BadParams(format!(
                "total_samples {total} exceeds device limit {max_total}"
            )));
        }
        if self.pre_trigger_samples < 2 || self.pre_trigger_samples > total / 10 {
            return Err(CaptureError::BadParams(format!(
                "pre_trigger_samples {} out of range [2, {}]",
                self.pre_trigger_samples,
                total / 10
            )));
        }
        if self.post_trigger_samples < 2 || self.post_trigger_samples > total.saturating_sub(2) {
            return Err(CaptureError::BadParams(format!(
                "post_trigger_samples {} out of range [2, {}]",
                self.post_trigger_samples,
                total.saturating_sub(2)
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(pre: u32, post: u32, channels: usize) -> CaptureSession {
        CaptureSession {
            frequency: 1_000_000,
            pre_trigger_samples: pre,
            post_trigger_samples: post,
            trigger_type: TriggerType::Edge,
            trigger_channel: 0,
            trigger_inverted: false,
            trigger_pattern: 0,
            trigger_bit_count: 0,
            loop_count: 0,
            measure_bursts: false,
            data_format: DataFormat::Binary,
            channels: (0..channels as u8).map(|c| CaptureChannel::new(c, format!("CH{c}"))).collect(),
        }
    }

    #[test]
    fn validates_sane_session() {
        let s = session(1000, 9000, 8);
        assert!(s.validate(1_000_000).is_ok());
    }

    #[test]
    fn rejects_oversized_total() {
        let s = session(1000, 9000, 8);
        assert!(s.validate(5000).is_err());
    }

    #[test]
    fn rejects_pre_out_of_range() {
        let s = session(1, 9000, 8);
        assert!(s.validate(1_000_000).is_err());
    }

    #[test]
    fn mode_divisor_matches_channel_count() {
        assert_eq!(CaptureMode::for_channel_count(4).divisor(), 1);
        assert_eq!(CaptureMode::for_channel_count(16).divisor(), 2);
        assert_eq!(CaptureMode::for_channel_count(24).divisor(), 4);
    }
}
