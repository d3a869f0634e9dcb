//! Fan-out splitter that remaps channels per output
//!
//! Every output has its own swizzle from the splitter's input channels to the target's
//! channels, so one multichannel stream can feed targets of different channel layouts.

use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::splitter::SplitterCore;
use crate::graph::node::ensure_not_disposed;
use crate::graph::{
    AudioGraph, AudioNode, AudioResult, AudioSampleFormat, AudioSampleTarget, ChannelSwizzle,
    InputPort, NodeIdentity, NodeOptions, SharedTarget, ensure_buffer_len,
};
use crate::utils::audio_math::interleaved_len;

pub struct ChannelFanoutSplitter {
    core: Arc<SplitterCore>,
}

impl ChannelFanoutSplitter {
    pub fn new(graph: Arc<AudioGraph>, format: AudioSampleFormat, options: NodeOptions) -> Arc<Self> {
        Arc::new(Self {
            core: SplitterCore::new("ChannelFanoutSplitter", graph, format, &options),
        })
    }

    /// Feed `target` through `swizzle`.
    ///
    /// `swizzle[i]` is the input channel copied into the target's channel `i` (negative for
    /// silence); its length must equal the target's channel count.
    pub async fn add_output(&self, target: SharedTarget, swizzle: &[i8]) -> AudioResult<()> {
        let remap = ChannelSwizzle::new(swizzle, self.core.input_port().format(), target.input_format())?;
        self.core.add_output(target, Some(remap)).await
    }

    pub fn output_count(&self) -> usize {
        self.core.output_count()
    }
}

impl AudioNode for ChannelFanoutSplitter {
    fn identity(&self) -> &NodeIdentity {
        self.core.identity()
    }

    fn dispose(&self) {
        self.core.dispose();
    }

    fn is_disposed(&self) -> bool {
        self.core.is_disposed()
    }
}

#[async_trait]
impl AudioSampleTarget for ChannelFanoutSplitter {
    fn input_port(&self) -> &InputPort {
        self.core.input_port()
    }

    async fn write(&self, buffer: &[f32], count: usize, cancel: &CancellationToken) -> AudioResult<()> {
        ensure_not_disposed(self)?;
        let channels = self.core.input_port().format().num_channels();
        ensure_buffer_len(buffer.len(), count, channels)?;
        self.core
            .broadcast(None, &buffer[..interleaved_len(count, channels)], count, cancel)
            .await
    }

    async fn flush(&self, cancel: &CancellationToken) -> AudioResult<()> {
        self.core.flush_outputs(cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::BucketAudioSampleTarget;
    use crate::graph::{AudioError, ChannelLayout};

    #[tokio::test]
    async fn test_push_remaps_each_output() {
        let graph = AudioGraph::new("fanout");
        let splitter = ChannelFanoutSplitter::new(
            graph.clone(),
            AudioSampleFormat::stereo(16000).unwrap(),
            NodeOptions::default(),
        );
        let left = BucketAudioSampleTarget::new(
            graph.clone(),
            AudioSampleFormat::mono(16000).unwrap(),
            NodeOptions::named("left"),
        );
        let swapped = BucketAudioSampleTarget::new(
            graph,
            AudioSampleFormat::stereo(16000).unwrap(),
            NodeOptions::named("swapped"),
        );
        splitter.add_output(left.clone(), &[0]).await.unwrap();
        splitter.add_output(swapped.clone(), &[1, 0]).await.unwrap();

        let cancel = CancellationToken::new();
        splitter
            .write(&[0.1, 0.9, 0.2, 0.8], 2, &cancel)
            .await
            .unwrap();

        assert_eq!(left.samples(), vec![0.1, 0.2]);
        assert_eq!(swapped.samples(), vec![0.9, 0.1, 0.8, 0.2]);
    }

    #[tokio::test]
    async fn test_rejects_invalid_swizzles() {
        let graph = AudioGraph::new("fanout");
        let splitter = ChannelFanoutSplitter::new(
            graph.clone(),
            AudioSampleFormat::stereo(16000).unwrap(),
            NodeOptions::default(),
        );
        let mono = BucketAudioSampleTarget::new(
            graph.clone(),
            AudioSampleFormat::mono(16000).unwrap(),
            NodeOptions::default(),
        );
        let resampled = BucketAudioSampleTarget::new(
            graph.clone(),
            AudioSampleFormat::mono(8000).unwrap(),
            NodeOptions::default(),
        );
        let unknown = BucketAudioSampleTarget::new(
            graph,
            AudioSampleFormat::new(16000, 1, ChannelLayout::Unknown).unwrap(),
            NodeOptions::default(),
        );

        let too_long = splitter.add_output(mono.clone(), &[0, 1]).await;
        assert!(matches!(too_long, Err(AudioError::InvalidSwizzle(_))));
        let out_of_range = splitter.add_output(mono, &[2]).await;
        assert!(matches!(out_of_range, Err(AudioError::InvalidSwizzle(_))));
        let rate = splitter.add_output(resampled, &[0]).await;
        assert!(matches!(rate, Err(AudioError::InvalidSwizzle(_))));
        let layout = splitter.add_output(unknown, &[0]).await;
        assert!(matches!(layout, Err(AudioError::InvalidSwizzle(_))));
        assert_eq!(splitter.output_count(), 0);
    }
}
