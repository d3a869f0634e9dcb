//! Fan-out splitting
//!
//! Each output is a pull source of its own. Reading any output pulls the shared upstream
//! once and broadcasts the same block to every other output's downstream, so all
//! outputs observe identical data. Pushing into the splitter broadcasts to all outputs.
//! Outputs remove themselves when their downstream disconnects.

use arc_swap::ArcSwap;
use async_trait::async_trait;
use futures::future::join_all;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::graph::node::ensure_not_disposed;
use crate::graph::pool;
use crate::graph::{
    AudioError, AudioGraph, AudioNode, AudioResult, AudioSampleFormat, AudioSampleSource,
    AudioSampleTarget, ChannelSwizzle, InputPort, NodeIdentity, NodeOptions, OutputPort,
    ReadOutcome, SharedSource, SharedTarget, connect, ensure_buffer_len,
};
use crate::utils::audio_math::interleaved_len;

/// Broadcast engine shared by [`AudioSplitter`] and
/// [`ChannelFanoutSplitter`](crate::components::ChannelFanoutSplitter)
pub(crate) struct SplitterCore {
    identity: NodeIdentity,
    input: InputPort,
    outputs: ArcSwap<Vec<Arc<SplitterOutput>>>,
    disposed: AtomicBool,
}

impl SplitterCore {
    pub(crate) fn new(
        type_name: &str,
        graph: Arc<AudioGraph>,
        format: AudioSampleFormat,
        options: &NodeOptions,
    ) -> Arc<Self> {
        Arc::new(Self {
            identity: options.identity(type_name),
            input: InputPort::new(graph, format),
            outputs: ArcSwap::from_pointee(Vec::new()),
            disposed: AtomicBool::new(false),
        })
    }

    pub(crate) fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    pub(crate) fn input_port(&self) -> &InputPort {
        &self.input
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    pub(crate) fn output_count(&self) -> usize {
        self.outputs.load().len()
    }

    /// Register a new output feeding `target`, remapped through `remap` if given
    pub(crate) async fn add_output(
        self: &Arc<Self>,
        target: SharedTarget,
        remap: Option<ChannelSwizzle>,
    ) -> AudioResult<()> {
        if self.is_disposed() {
            return Err(AudioError::Disposed(self.identity.full_name().to_string()));
        }

        let format = match remap {
            Some(_) => *target.input_format(),
            None => *self.input.format(),
        };
        let output = SplitterOutput::new(
            Arc::clone(self.input.graph()),
            format,
            Arc::downgrade(self),
            remap,
            self.identity.name(),
        );
        connect(output.clone() as SharedSource, target).await?;

        self.outputs.rcu(|outputs| {
            let mut next = Vec::with_capacity(outputs.len() + 1);
            next.extend(outputs.iter().cloned());
            next.push(Arc::clone(&output));
            next
        });
        debug!(node = %self.identity.full_name(), outputs = self.output_count(), "Splitter output added");
        Ok(())
    }

    fn remove_output(&self, id: Uuid) {
        self.outputs.rcu(|outputs| {
            outputs
                .iter()
                .filter(|output| output.node_id() != id)
                .cloned()
                .collect::<Vec<_>>()
        });
        debug!(node = %self.identity.full_name(), outputs = self.output_count(), "Splitter output removed");
    }

    pub(crate) fn playback_finished(&self) -> bool {
        self.input
            .source()
            .is_some_and(|source| source.playback_finished())
    }

    /// Pull once on behalf of `origin`, then hand the block to every other output
    async fn read_for(
        &self,
        origin: &SplitterOutput,
        buffer: &mut [f32],
        count: usize,
        cancel: &CancellationToken,
    ) -> AudioResult<ReadOutcome> {
        ensure_buffer_len(buffer.len(), count, origin.output.format().num_channels())?;
        let Some(upstream) = self.input.source() else {
            return Ok(ReadOutcome::Samples(0));
        };
        let input_channels = self.input.format().num_channels();

        match &origin.remap {
            None => {
                let outcome = upstream.read(buffer, count, cancel).await?;
                if let ReadOutcome::Samples(read) = outcome {
                    let block = &buffer[..interleaved_len(read, input_channels)];
                    self.broadcast(Some(origin.node_id()), block, read, cancel)
                        .await?;
                }
                Ok(outcome)
            }
            Some(remap) => {
                let mut scratch = pool::rent(interleaved_len(count, input_channels));
                let outcome = upstream.read(&mut scratch, count, cancel).await?;
                if let ReadOutcome::Samples(read) = outcome {
                    remap.apply(&scratch, buffer, read);
                    let block = &scratch[..interleaved_len(read, input_channels)];
                    self.broadcast(Some(origin.node_id()), block, read, cancel)
                        .await?;
                }
                Ok(outcome)
            }
        }
    }

    /// Write `block` (input format) to every output except `exclude`, in parallel
    pub(crate) async fn broadcast(
        &self,
        exclude: Option<Uuid>,
        block: &[f32],
        count: usize,
        cancel: &CancellationToken,
    ) -> AudioResult<()> {
        if count == 0 {
            return Ok(());
        }
        let peers: Vec<Arc<SplitterOutput>> = self
            .outputs
            .load_full()
            .iter()
            .filter(|output| Some(output.node_id()) != exclude)
            .cloned()
            .collect();

        match peers.as_slice() {
            [] => Ok(()),
            [only] => only.deliver(block, count, cancel).await,
            _ => {
                let deliveries = peers.iter().map(|output| output.deliver(block, count, cancel));
                for result in join_all(deliveries).await {
                    result?;
                }
                Ok(())
            }
        }
    }

    pub(crate) async fn flush_outputs(&self, cancel: &CancellationToken) -> AudioResult<()> {
        let outputs = self.outputs.load_full();
        let flushes = outputs.iter().filter_map(|output| output.output.target()).collect::<Vec<_>>();
        for result in join_all(flushes.iter().map(|target| target.flush(cancel))).await {
            result?;
        }
        Ok(())
    }

    pub(crate) fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let outputs = self.outputs.swap(Arc::new(Vec::new()));
        for output in outputs.iter() {
            output.dispose();
        }
        debug!(node = %self.identity.full_name(), "Splitter disposed");
    }
}

/// One downstream branch of a splitter
pub(crate) struct SplitterOutput {
    identity: NodeIdentity,
    output: OutputPort,
    splitter: Weak<SplitterCore>,
    remap: Option<ChannelSwizzle>,
    disposed: AtomicBool,
}

impl SplitterOutput {
    fn new(
        graph: Arc<AudioGraph>,
        format: AudioSampleFormat,
        splitter: Weak<SplitterCore>,
        remap: Option<ChannelSwizzle>,
        splitter_name: &str,
    ) -> Arc<Self> {
        let name = format!("{splitter_name}-output");
        Arc::new(Self {
            identity: NodeIdentity::new("SplitterOutput", Some(&name)),
            output: OutputPort::new(graph, format),
            splitter,
            remap,
            disposed: AtomicBool::new(false),
        })
    }

    /// Write a block in the splitter's input format to this branch's downstream
    async fn deliver(&self, block: &[f32], count: usize, cancel: &CancellationToken) -> AudioResult<()> {
        let Some(target) = self.output.target() else {
            return Ok(());
        };
        match &self.remap {
            None => target.write(block, count, cancel).await,
            Some(remap) => {
                let mut scratch =
                    pool::rent(interleaved_len(count, remap.destination_channels()));
                remap.apply(block, &mut scratch, count);
                target.write(&scratch, count, cancel).await
            }
        }
    }
}

impl AudioNode for SplitterOutput {
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
impl AudioSampleSource for SplitterOutput {
    fn output_port(&self) -> &OutputPort {
        &self.output
    }

    fn playback_finished(&self) -> bool {
        self.splitter
            .upgrade()
            .is_some_and(|splitter| splitter.playback_finished())
    }

    async fn read(
        &self,
        buffer: &mut [f32],
        count: usize,
        cancel: &CancellationToken,
    ) -> AudioResult<ReadOutcome> {
        ensure_not_disposed(self)?;
        match self.splitter.upgrade() {
            Some(splitter) => splitter.read_for(self, buffer, count, cancel).await,
            None => Ok(ReadOutcome::Finished),
        }
    }

    fn on_output_disconnected(&self) {
        if let Some(splitter) = self.splitter.upgrade() {
            splitter.remove_output(self.node_id());
        }
        self.dispose();
    }
}

/// Copies one input to any number of same-format outputs
pub struct AudioSplitter {
    core: Arc<SplitterCore>,
}

impl AudioSplitter {
    pub fn new(graph: Arc<AudioGraph>, format: AudioSampleFormat, options: NodeOptions) -> Arc<Self> {
        Arc::new(Self {
            core: SplitterCore::new("AudioSplitter", graph, format, &options),
        })
    }

    /// Feed `target` from this splitter. Its format must equal the splitter's.
    pub async fn add_output(&self, target: SharedTarget) -> AudioResult<()> {
        self.core.add_output(target, None).await
    }

    pub fn output_count(&self) -> usize {
        self.core.output_count()
    }
}

impl AudioNode for AudioSplitter {
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
impl AudioSampleTarget for AudioSplitter {
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
    use crate::graph::disconnect_input;

    #[tokio::test]
    async fn test_output_removed_when_downstream_disconnects() {
        let graph = AudioGraph::new("split");
        let format = AudioSampleFormat::mono(16000).unwrap();
        let splitter = AudioSplitter::new(graph.clone(), format, NodeOptions::default());
        let a = BucketAudioSampleTarget::new(graph.clone(), format, NodeOptions::default());
        let b = BucketAudioSampleTarget::new(graph, format, NodeOptions::default());

        splitter.add_output(a.clone()).await.unwrap();
        splitter.add_output(b.clone()).await.unwrap();
        assert_eq!(splitter.output_count(), 2);

        disconnect_input(a.as_ref()).await;
        assert_eq!(splitter.output_count(), 1);
        assert!(a.input().is_none());
        assert!(b.input().is_some());
    }

    #[tokio::test]
    async fn test_rejects_mismatched_output_format() {
        let graph = AudioGraph::new("split");
        let splitter = AudioSplitter::new(
            graph.clone(),
            AudioSampleFormat::mono(16000).unwrap(),
            NodeOptions::default(),
        );
        let stereo = BucketAudioSampleTarget::new(
            graph,
            AudioSampleFormat::stereo(16000).unwrap(),
            NodeOptions::default(),
        );

        let result = splitter.add_output(stereo).await;
        assert!(matches!(result, Err(AudioError::FormatMismatch { .. })));
        assert_eq!(splitter.output_count(), 0);
    }

    #[tokio::test]
    async fn test_push_without_outputs_is_a_no_op() {
        let graph = AudioGraph::new("split");
        let splitter = AudioSplitter::new(
            graph,
            AudioSampleFormat::mono(16000).unwrap(),
            NodeOptions::default(),
        );
        let cancel = CancellationToken::new();
        splitter.write(&[1.0; 16], 16, &cancel).await.unwrap();
        splitter.flush(&cancel).await.unwrap();
    }
}
