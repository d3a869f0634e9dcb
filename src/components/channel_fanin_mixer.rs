//! Fan-in mixer that remaps each input's channels before mixing
//!
//! Inputs may have any channel count and layout (except an unknown layout) as long as
//! the sample rate matches the output. Each input carries a swizzle naming, for every
//! output channel, the input channel it contributes (negative for silence).

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use super::mixer::MixerCore;
use crate::config::MixerConfig;
use crate::graph::{
    AudioGraph, AudioNode, AudioResult, AudioSampleFormat, AudioSampleSource, ChannelFinishedEvent,
    ChannelSwizzle, ChannelToken, NodeIdentity, NodeOptions, OutputPort, ReadOutcome, SharedSource,
};

pub struct ChannelFaninMixer {
    core: Arc<MixerCore>,
}

impl ChannelFaninMixer {
    pub fn new(
        graph: Arc<AudioGraph>,
        format: AudioSampleFormat,
        config: &MixerConfig,
        options: NodeOptions,
    ) -> AudioResult<Arc<Self>> {
        let core = MixerCore::new("ChannelFaninMixer", graph, format, config, &options)?;
        Ok(Arc::new(Self { core }))
    }

    /// Mix `source` in through `swizzle`.
    ///
    /// `swizzle[i]` is the source channel feeding output channel `i`; its length must
    /// equal the output channel count.
    pub async fn add_input(
        &self,
        source: SharedSource,
        swizzle: &[i8],
        token: Option<ChannelToken>,
        take_ownership: bool,
    ) -> AudioResult<()> {
        let input_format = *source.output_format();
        let remap = ChannelSwizzle::new(swizzle, &input_format, self.core.output_port().format())?;
        self.core
            .add_input(source, input_format, token, take_ownership, Some(remap))
            .await
    }

    pub async fn disconnect_all_inputs(&self) {
        self.core.disconnect_all_inputs().await;
    }

    pub async fn input_count(&self) -> usize {
        self.core.input_count().await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChannelFinishedEvent> {
        self.core.subscribe()
    }
}

impl AudioNode for ChannelFaninMixer {
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
impl AudioSampleSource for ChannelFaninMixer {
    fn output_port(&self) -> &OutputPort {
        self.core.output_port()
    }

    fn playback_finished(&self) -> bool {
        self.core.playback_finished()
    }

    async fn read(
        &self,
        buffer: &mut [f32],
        count: usize,
        cancel: &CancellationToken,
    ) -> AudioResult<ReadOutcome> {
        self.core.read(buffer, count, cancel).await
    }
}
