//! Sample arithmetic shared by the streaming components
//!
//! All lengths are in samples per channel unless a name says otherwise.

use std::time::Duration;

const NANOS_PER_SECOND: u128 = 1_000_000_000;

/// Lanes processed per unrolled step; lets the compiler vectorize the loop body
const MIX_LANES: usize = 8;

/// Number of samples per channel covering `duration` at `sample_rate_hz` (rounded down)
pub fn samples_per_channel_for_duration(sample_rate_hz: u32, duration: Duration) -> usize {
    (duration.as_nanos() * sample_rate_hz as u128 / NANOS_PER_SECOND) as usize
}

/// Playback time of `samples_per_channel` samples at `sample_rate_hz`
pub fn duration_for_samples_per_channel(sample_rate_hz: u32, samples_per_channel: usize) -> Duration {
    if sample_rate_hz == 0 {
        return Duration::ZERO;
    }
    let nanos = samples_per_channel as u128 * NANOS_PER_SECOND / sample_rate_hz as u128;
    Duration::from_nanos(nanos.min(u64::MAX as u128) as u64)
}

/// Add `source` into `target` element-wise. Both slices must be the same length.
pub fn mix_add(target: &mut [f32], source: &[f32]) {
    debug_assert_eq!(target.len(), source.len());

    let mut target_chunks = target.chunks_exact_mut(MIX_LANES);
    let mut source_chunks = source.chunks_exact(MIX_LANES);
    for (t, s) in (&mut target_chunks).zip(&mut source_chunks) {
        for lane in 0..MIX_LANES {
            t[lane] += s[lane];
        }
    }

    for (t, s) in target_chunks
        .into_remainder()
        .iter_mut()
        .zip(source_chunks.remainder())
    {
        *t += *s;
    }
}

/// Values required in an interleaved buffer holding `samples_per_channel` frames
#[inline]
pub fn interleaved_len(samples_per_channel: usize, num_channels: usize) -> usize {
    samples_per_channel * num_channels
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duration_conversions() {
        assert_eq!(
            samples_per_channel_for_duration(16000, Duration::from_millis(100)),
            1600
        );
        assert_eq!(
            samples_per_channel_for_duration(48000, Duration::from_millis(200)),
            9600
        );
        assert_eq!(
            samples_per_channel_for_duration(44100, Duration::from_micros(10)),
            0
        );
        assert_eq!(
            duration_for_samples_per_channel(16000, 8000),
            Duration::from_millis(500)
        );
        assert_eq!(duration_for_samples_per_channel(0, 10), Duration::ZERO);
    }

    #[test]
    fn test_mix_add_handles_remainder() {
        let mut target: Vec<f32> = (0..19).map(|i| i as f32).collect();
        let source = vec![0.5f32; 19];

        mix_add(&mut target, &source);

        for (i, value) in target.iter().enumerate() {
            assert_eq!(*value, i as f32 + 0.5);
        }
    }

    #[test]
    fn test_interleaved_len() {
        assert_eq!(interleaved_len(480, 2), 960);
        assert_eq!(interleaved_len(0, 6), 0);
    }
}
