//! Audio graph components
//!
//! - Boundary components decoupling two independently paced graphs:
//!   [`AsyncAudioReadBuffer`], [`AsyncAudioWriteBuffer`] and [`PushPullBuffer`]
//! - Fan components: [`LinearMixer`] and [`ChannelFaninMixer`] (N:1),
//!   [`AudioSplitter`] and [`ChannelFanoutSplitter`] (1:N), [`AudioConcatenator`]
//!   (N:1, sequential)
//! - Basic endpoints for wiring and testing: [`FixedAudioSampleSource`],
//!   [`SilenceAudioSampleSource`], [`BucketAudioSampleTarget`] and
//!   [`NullAudioSampleTarget`]

pub mod async_read_buffer;
pub mod async_write_buffer;
pub mod bucket_target;
pub mod channel_fanin_mixer;
pub mod channel_fanout_splitter;
pub mod concatenator;
pub mod fixed_source;
pub mod mixer;
pub mod null_target;
pub mod push_pull_buffer;
pub mod silence_source;
pub mod splitter;

pub use async_read_buffer::AsyncAudioReadBuffer;
pub use async_write_buffer::AsyncAudioWriteBuffer;
pub use bucket_target::BucketAudioSampleTarget;
pub use channel_fanin_mixer::ChannelFaninMixer;
pub use channel_fanout_splitter::ChannelFanoutSplitter;
pub use concatenator::AudioConcatenator;
pub use fixed_source::FixedAudioSampleSource;
pub use mixer::LinearMixer;
pub use null_target::NullAudioSampleTarget;
pub use push_pull_buffer::PushPullBuffer;
pub use silence_source::SilenceAudioSampleSource;
pub use splitter::AudioSplitter;
