pub mod components;
pub mod config;
pub mod graph;
pub mod utils;

// Re-export commonly used items for convenience
pub use components::{
    AsyncAudioReadBuffer, AsyncAudioWriteBuffer, AudioConcatenator, AudioSplitter,
    BucketAudioSampleTarget, ChannelFaninMixer, ChannelFanoutSplitter, FixedAudioSampleSource,
    LinearMixer, NullAudioSampleTarget, PushPullBuffer, SilenceAudioSampleSource,
};
pub use config::StreamingConfig;
pub use graph::{
    AudioError, AudioGraph, AudioMetrics, AudioNode, AudioResult, AudioSampleFormat,
    AudioSampleSource, AudioSampleTarget, ChannelLayout, ChannelToken, NodeOptions, ReadOutcome,
    connect, disconnect_input, disconnect_output,
};
