//! Channel remapping tables for the channel fan-in mixer and fan-out splitter

use std::sync::Arc;

use super::error::{AudioError, AudioResult};
use super::format::{AudioSampleFormat, ChannelLayout};

/// Maps each destination channel to a source channel.
///
/// Entry `i` names the source channel copied into destination channel `i`; a negative
/// entry fills destination channel `i` with silence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSwizzle {
    map: Arc<[i8]>,
    source_channels: usize,
}

impl ChannelSwizzle {
    /// Build a remap from `source` channels into `destination` channels.
    ///
    /// The table length must equal the destination channel count and every non-negative
    /// entry must address a source channel.
    pub fn new(
        map: &[i8],
        source: &AudioSampleFormat,
        destination: &AudioSampleFormat,
    ) -> AudioResult<Self> {
        if source.sample_rate_hz() != destination.sample_rate_hz() {
            return Err(AudioError::InvalidSwizzle(format!(
                "sample rates differ: {} vs {}",
                source.sample_rate_hz(),
                destination.sample_rate_hz()
            )));
        }
        if source.layout() == ChannelLayout::Unknown || destination.layout() == ChannelLayout::Unknown {
            return Err(AudioError::InvalidSwizzle(
                "cannot remap channels of an unknown layout".into(),
            ));
        }
        if map.len() != destination.num_channels() {
            return Err(AudioError::InvalidSwizzle(format!(
                "swizzle has {} entries but destination has {} channels",
                map.len(),
                destination.num_channels()
            )));
        }
        if let Some(entry) = map
            .iter()
            .find(|&&entry| entry >= 0 && entry as usize >= source.num_channels())
        {
            return Err(AudioError::InvalidSwizzle(format!(
                "entry {} addresses a channel outside the {}-channel source",
                entry,
                source.num_channels()
            )));
        }

        Ok(Self {
            map: map.into(),
            source_channels: source.num_channels(),
        })
    }

    pub fn source_channels(&self) -> usize {
        self.source_channels
    }

    pub fn destination_channels(&self) -> usize {
        self.map.len()
    }

    /// Remap `frames` interleaved frames from `source` into `destination`
    pub fn apply(&self, source: &[f32], destination: &mut [f32], frames: usize) {
        let src_ch = self.source_channels;
        let dst_ch = self.map.len();
        let source_frames = source[..frames * src_ch].chunks_exact(src_ch);
        let destination_frames = destination[..frames * dst_ch].chunks_exact_mut(dst_ch);

        for (src, dst) in source_frames.zip(destination_frames) {
            for (out, &entry) in dst.iter_mut().zip(self.map.iter()) {
                *out = if entry < 0 { 0.0 } else { src[entry as usize] };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stereo() -> AudioSampleFormat {
        AudioSampleFormat::stereo(16000).unwrap()
    }

    fn mono() -> AudioSampleFormat {
        AudioSampleFormat::mono(16000).unwrap()
    }

    #[test]
    fn test_swizzle_validation() {
        assert!(ChannelSwizzle::new(&[0, 1], &stereo(), &stereo()).is_ok());
        assert!(ChannelSwizzle::new(&[0], &stereo(), &stereo()).is_err());
        assert!(ChannelSwizzle::new(&[0, 2], &stereo(), &stereo()).is_err());
        assert!(ChannelSwizzle::new(&[-1, 1], &stereo(), &stereo()).is_ok());

        let unknown = AudioSampleFormat::new(16000, 2, ChannelLayout::Unknown).unwrap();
        assert!(ChannelSwizzle::new(&[0, 1], &unknown, &stereo()).is_err());

        let other_rate = AudioSampleFormat::stereo(48000).unwrap();
        assert!(ChannelSwizzle::new(&[0, 1], &other_rate, &stereo()).is_err());
    }

    #[test]
    fn test_swizzle_apply() {
        let swap = ChannelSwizzle::new(&[1, 0], &stereo(), &stereo()).unwrap();
        let source = [1.0, 2.0, 3.0, 4.0];
        let mut destination = [0.0; 4];
        swap.apply(&source, &mut destination, 2);
        assert_eq!(destination, [2.0, 1.0, 4.0, 3.0]);

        let upmix = ChannelSwizzle::new(&[0, -1], &mono(), &stereo()).unwrap();
        let mut destination = [9.0; 4];
        upmix.apply(&[0.5, 0.25], &mut destination, 2);
        assert_eq!(destination, [0.5, 0.0, 0.25, 0.0]);
    }
}
