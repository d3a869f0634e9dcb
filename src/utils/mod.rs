pub mod audio_math;
pub use audio_math::{duration_for_samples_per_channel, mix_add, samples_per_channel_for_duration};
