//! Sample format and channel layout metadata

use serde::{Deserialize, Serialize};
use std::fmt;

use super::error::{AudioError, AudioResult};

/// Speaker arrangement of interleaved channels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelLayout {
    /// Single channel
    Monaural,
    /// Left, right
    StereoLR,
    /// Right, left
    StereoRL,
    /// Left, center, right
    LeftCenterRight,
    /// Front left, front right, rear left, rear right
    Quadraphonic,
    /// FL, FR, C, LFE, RL, RR
    Surround5_1,
    /// FL, FR, C, LFE, RL, RR, SL, SR
    Surround7_1,
    /// Channels carry independent signals with no spatial meaning
    Packed,
    /// Layout was not declared
    Unknown,
}

impl ChannelLayout {
    /// Channel count implied by the layout, if fixed
    pub fn channel_count(&self) -> Option<usize> {
        match self {
            Self::Monaural => Some(1),
            Self::StereoLR | Self::StereoRL => Some(2),
            Self::LeftCenterRight => Some(3),
            Self::Quadraphonic => Some(4),
            Self::Surround5_1 => Some(6),
            Self::Surround7_1 => Some(8),
            Self::Packed | Self::Unknown => None,
        }
    }
}

impl fmt::Display for ChannelLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Monaural => "Monaural",
            Self::StereoLR => "StereoLR",
            Self::StereoRL => "StereoRL",
            Self::LeftCenterRight => "LeftCenterRight",
            Self::Quadraphonic => "Quadraphonic",
            Self::Surround5_1 => "Surround5_1",
            Self::Surround7_1 => "Surround7_1",
            Self::Packed => "Packed",
            Self::Unknown => "Unknown",
        };
        f.write_str(name)
    }
}

/// Immutable description of an interleaved sample stream.
///
/// Two endpoints may only be connected when their formats are equal in all three fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AudioSampleFormat {
    sample_rate_hz: u32,
    num_channels: usize,
    layout: ChannelLayout,
}

impl AudioSampleFormat {
    /// Create a format, validating that the channel count agrees with the layout
    pub fn new(sample_rate_hz: u32, num_channels: usize, layout: ChannelLayout) -> AudioResult<Self> {
        if sample_rate_hz == 0 {
            return Err(AudioError::InvalidFormat("sample rate must be positive".into()));
        }
        if num_channels == 0 {
            return Err(AudioError::InvalidFormat("channel count must be positive".into()));
        }
        if let Some(expected) = layout.channel_count() {
            if expected != num_channels {
                return Err(AudioError::InvalidFormat(format!(
                    "layout {layout} requires {expected} channels, got {num_channels}"
                )));
            }
        }

        Ok(Self {
            sample_rate_hz,
            num_channels,
            layout,
        })
    }

    /// Single channel format
    pub fn mono(sample_rate_hz: u32) -> AudioResult<Self> {
        Self::new(sample_rate_hz, 1, ChannelLayout::Monaural)
    }

    /// Left/right stereo format
    pub fn stereo(sample_rate_hz: u32) -> AudioResult<Self> {
        Self::new(sample_rate_hz, 2, ChannelLayout::StereoLR)
    }

    /// Packed format with an arbitrary channel count
    pub fn packed(sample_rate_hz: u32, num_channels: usize) -> AudioResult<Self> {
        Self::new(sample_rate_hz, num_channels, ChannelLayout::Packed)
    }

    pub fn sample_rate_hz(&self) -> u32 {
        self.sample_rate_hz
    }

    pub fn num_channels(&self) -> usize {
        self.num_channels
    }

    pub fn layout(&self) -> ChannelLayout {
        self.layout
    }

    /// Fail with [`AudioError::FormatMismatch`] unless both formats are equal
    pub fn ensure_equal(expected: &Self, actual: &Self) -> AudioResult<()> {
        if expected != actual {
            return Err(AudioError::format_mismatch(expected, actual));
        }
        Ok(())
    }
}

impl fmt::Display for AudioSampleFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}Hz {}ch {}",
            self.sample_rate_hz, self.num_channels, self.layout
        )
    }
}
