//! Relay between a push-driven and a pull-driven domain
//!
//! Writes are always accepted and queued; if an upper bound is configured the oldest
//! frames are pruned once it is exceeded. Reads drain the queue and never pull from
//! upstream: an empty queue yields zero frames until the upstream source reports that it
//! finished, at which point the buffer finishes too.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::PushPullBufferConfig;
use crate::graph::node::ensure_not_disposed;
use crate::graph::segment::SegmentQueue;
use crate::graph::{
    AudioError, AudioGraph, AudioMetrics, AudioNode, AudioResult, AudioSampleFormat,
    AudioSampleSource, AudioSampleTarget, DelayingFilter, InputPort, MetricKey, NodeIdentity,
    NodeOptions, OutputPort, ReadOutcome, ensure_buffer_len,
};
use crate::utils::audio_math::{duration_for_samples_per_channel, samples_per_channel_for_duration};

pub struct PushPullBuffer {
    identity: NodeIdentity,
    input: InputPort,
    output: OutputPort,
    /// One lock for every public operation, independent of either graph lock
    queue: Mutex<SegmentQueue>,
    max_samples: Option<usize>,
    /// Set once, while holding `queue`
    playback_finished: AtomicBool,
    metrics: Arc<AudioMetrics>,
    disposed: AtomicBool,
}

impl PushPullBuffer {
    /// Both sides may share a graph
    pub fn new(
        input_graph: Arc<AudioGraph>,
        output_graph: Arc<AudioGraph>,
        format: AudioSampleFormat,
        config: &PushPullBufferConfig,
        options: NodeOptions,
    ) -> AudioResult<Arc<Self>> {
        config.validate()?;
        let max_samples = match config.max_buffer_length() {
            Some(length) => {
                let samples = samples_per_channel_for_duration(format.sample_rate_hz(), length);
                if samples == 0 {
                    return Err(AudioError::buffer_length(
                        "max_buffer_length",
                        "must hold at least one frame",
                    ));
                }
                Some(samples)
            }
            None => None,
        };

        Ok(Arc::new(Self {
            identity: options.identity("PushPullBuffer"),
            input: InputPort::new(input_graph, format),
            output: OutputPort::new(output_graph, format),
            queue: Mutex::new(SegmentQueue::new(format.num_channels())),
            max_samples,
            playback_finished: AtomicBool::new(false),
            metrics: options.metrics(),
            disposed: AtomicBool::new(false),
        }))
    }

    /// Overflow bound in frames, if any
    pub fn max_buffer_samples(&self) -> Option<usize> {
        self.max_samples
    }

    pub fn buffered_samples(&self) -> usize {
        self.queue.lock().len()
    }

    /// Drop everything queued
    pub fn clear_buffer(&self) {
        self.queue.lock().clear();
    }

    #[cfg(test)]
    fn queue_invariant_holds(&self) -> bool {
        self.queue.lock().invariant_holds()
    }
}

impl AudioNode for PushPullBuffer {
    fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.queue.lock().clear();
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}

#[async_trait]
impl AudioSampleSource for PushPullBuffer {
    fn output_port(&self) -> &OutputPort {
        &self.output
    }

    fn playback_finished(&self) -> bool {
        self.playback_finished.load(Ordering::Acquire)
    }

    async fn read(
        &self,
        buffer: &mut [f32],
        count: usize,
        _cancel: &CancellationToken,
    ) -> AudioResult<ReadOutcome> {
        ensure_not_disposed(self)?;
        ensure_buffer_len(buffer.len(), count, self.output.format().num_channels())?;
        let _scope = self.output.graph().begin_scope(self.node_full_name());

        let mut queue = self.queue.lock();
        if self.playback_finished() {
            return Ok(ReadOutcome::Finished);
        }

        if queue.is_empty() {
            let Some(upstream) = self.input.source() else {
                return Ok(ReadOutcome::Samples(0));
            };
            if upstream.playback_finished() {
                self.playback_finished.store(true, Ordering::Release);
                debug!(node = %self.node_full_name(), "Upstream finished, relay drained");
                return Ok(ReadOutcome::Finished);
            }

            if count > 0 {
                debug!(node = %self.node_full_name(), samples = count, "Push-pull buffer underflow");
                self.metrics.report(
                    MetricKey::PushPullBufferUnderflowSamples,
                    self.node_full_name(),
                    count as u64,
                );
            }
            return Ok(ReadOutcome::Samples(0));
        }

        Ok(ReadOutcome::Samples(queue.drain_into(buffer, count)))
    }
}

#[async_trait]
impl AudioSampleTarget for PushPullBuffer {
    fn input_port(&self) -> &InputPort {
        &self.input
    }

    async fn write(&self, buffer: &[f32], count: usize, _cancel: &CancellationToken) -> AudioResult<()> {
        ensure_not_disposed(self)?;
        ensure_buffer_len(buffer.len(), count, self.input.format().num_channels())?;
        let _scope = self.input.graph().begin_scope(self.node_full_name());

        let mut queue = self.queue.lock();
        queue.push_copy(buffer, count);

        if let Some(max) = self.max_samples {
            let excess = queue.len().saturating_sub(max);
            if excess > 0 {
                let pruned = queue.discard_oldest(excess);
                warn!(node = %self.node_full_name(), samples = pruned, "Push-pull buffer overflow");
                self.metrics.report(
                    MetricKey::PushPullBufferOverflowSamples,
                    self.node_full_name(),
                    pruned as u64,
                );
            }
        }
        Ok(())
    }

    async fn flush(&self, _cancel: &CancellationToken) -> AudioResult<()> {
        Ok(())
    }

    fn check_accepts_input(&self) -> AudioResult<()> {
        if self.playback_finished() {
            return Err(AudioError::PlaybackFinished(self.node_full_name().to_string()));
        }
        Ok(())
    }
}

impl DelayingFilter for PushPullBuffer {
    fn algorithmic_delay(&self) -> Duration {
        duration_for_samples_per_channel(self.output.format().sample_rate_hz(), self.buffered_samples())
    }
}
