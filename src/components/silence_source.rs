use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio_util::sync::CancellationToken;

use crate::graph::node::ensure_not_disposed;
use crate::graph::{
    AudioGraph, AudioNode, AudioResult, AudioSampleFormat, AudioSampleSource, NodeIdentity,
    NodeOptions, OutputPort, ReadOutcome, ensure_buffer_len,
};
use crate::utils::audio_math::interleaved_len;

/// Endless source of zeros
pub struct SilenceAudioSampleSource {
    identity: NodeIdentity,
    output: OutputPort,
    disposed: AtomicBool,
}

impl SilenceAudioSampleSource {
    pub fn new(graph: Arc<AudioGraph>, format: AudioSampleFormat, options: NodeOptions) -> Arc<Self> {
        Arc::new(Self {
            identity: options.identity("SilenceAudioSampleSource"),
            output: OutputPort::new(graph, format),
            disposed: AtomicBool::new(false),
        })
    }
}

impl AudioNode for SilenceAudioSampleSource {
    fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    fn dispose(&self) {
        self.disposed.store(true, Ordering::Release);
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}

#[async_trait]
impl AudioSampleSource for SilenceAudioSampleSource {
    fn output_port(&self) -> &OutputPort {
        &self.output
    }

    fn playback_finished(&self) -> bool {
        false
    }

    async fn read(
        &self,
        buffer: &mut [f32],
        count: usize,
        _cancel: &CancellationToken,
    ) -> AudioResult<ReadOutcome> {
        ensure_not_disposed(self)?;
        let channels = self.output.format().num_channels();
        ensure_buffer_len(buffer.len(), count, channels)?;
        buffer[..interleaved_len(count, channels)].fill(0.0);
        Ok(ReadOutcome::Samples(count))
    }
}
