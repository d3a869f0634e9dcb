//! Push decoupler between two graphs
//!
//! A fast producer in the input graph writes into this buffer without waiting on the
//! (possibly slow) target in the output graph. Writes beyond the configured maximum are
//! dropped and counted. A single background drain moves queued segments downstream one
//! at a time under the output graph's lock.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::config::AsyncWriteBufferConfig;
use crate::graph::node::ensure_not_disposed;
use crate::graph::segment::SegmentQueue;
use crate::graph::{
    AudioError, AudioGraph, AudioMetrics, AudioNode, AudioResult, AudioSampleFormat,
    AudioSampleSource, AudioSampleTarget, DelayingFilter, GatePermit, InputPort, MetricKey,
    NodeIdentity, NodeOptions, OutputPort, ReadOutcome, SingleFlightGate, ensure_buffer_len,
};
use crate::utils::audio_math::{duration_for_samples_per_channel, samples_per_channel_for_duration};

#[derive(Debug)]
struct WriteBufferState {
    queue: SegmentQueue,
    /// Frames dequeued by the drain but not yet delivered
    in_flight: usize,
}

impl WriteBufferState {
    fn buffered(&self) -> usize {
        self.queue.len() + self.in_flight
    }
}

pub struct AsyncAudioWriteBuffer {
    identity: NodeIdentity,
    me: Weak<Self>,
    input: InputPort,
    output: OutputPort,
    state: Mutex<WriteBufferState>,
    max_samples: usize,
    gate: Arc<SingleFlightGate>,
    background_cancel: CancellationToken,
    metrics: Arc<AudioMetrics>,
    last_background_error: Mutex<Option<AudioError>>,
    disposed: AtomicBool,
}

impl AsyncAudioWriteBuffer {
    pub fn new(
        input_graph: Arc<AudioGraph>,
        output_graph: Arc<AudioGraph>,
        format: AudioSampleFormat,
        config: &AsyncWriteBufferConfig,
        options: NodeOptions,
    ) -> AudioResult<Arc<Self>> {
        let identity = options.identity("AsyncAudioWriteBuffer");
        if Arc::ptr_eq(&input_graph, &output_graph) {
            return Err(AudioError::SameGraph(identity.full_name().to_string()));
        }
        config.validate()?;
        let max_samples =
            samples_per_channel_for_duration(format.sample_rate_hz(), config.max_buffer_length());
        if max_samples == 0 {
            return Err(AudioError::buffer_length(
                "max_buffer_length",
                "must hold at least one frame",
            ));
        }

        Ok(Arc::new_cyclic(|me| Self {
            identity,
            me: me.clone(),
            input: InputPort::new(input_graph, format),
            output: OutputPort::new(output_graph, format),
            state: Mutex::new(WriteBufferState {
                queue: SegmentQueue::new(format.num_channels()),
                in_flight: 0,
            }),
            max_samples,
            gate: SingleFlightGate::new(),
            background_cancel: CancellationToken::new(),
            metrics: options.metrics(),
            last_background_error: Mutex::new(None),
            disposed: AtomicBool::new(false),
        }))
    }

    /// Backpressure bound in frames
    pub fn max_buffer_samples(&self) -> usize {
        self.max_samples
    }

    /// Frames accepted but not yet delivered downstream
    pub fn buffered_samples(&self) -> usize {
        self.state.lock().buffered()
    }

    /// Most recent failure of a background drain, if any
    pub fn last_background_error(&self) -> Option<AudioError> {
        self.last_background_error.lock().clone()
    }

    /// Start a drain unless one is in flight or there is nothing to deliver
    fn start_drain(&self) {
        if self.is_disposed() || self.state.lock().queue.is_empty() {
            return;
        }
        let Some(permit) = self.gate.try_claim() else {
            return;
        };
        let Some(buffer) = self.me.upgrade() else {
            return;
        };
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(e) => {
                error!(node = %self.node_full_name(), error = %e, "No runtime available for background drain");
                return;
            }
        };

        let task = DrainTask {
            buffer,
            permit,
            cancel: self.background_cancel.child_token(),
        };
        handle.spawn(task.run());
    }

    /// Deliver queued segments until the queue is empty
    async fn drain(&self, cancel: &CancellationToken) -> AudioResult<()> {
        let graph = Arc::clone(self.output.graph());
        loop {
            let segment = {
                let mut state = self.state.lock();
                match state.queue.pop_segment() {
                    Some(segment) => {
                        state.in_flight = segment.remaining();
                        segment
                    }
                    None => return Ok(()),
                }
            };

            {
                let _guard = graph.lock_cancellable(cancel).await?;
                let _scope = graph.begin_scope(self.node_full_name());
                match self.output.target() {
                    Some(target) => {
                        target
                            .write(segment.unread(), segment.remaining(), cancel)
                            .await?
                    }
                    None => {
                        debug!(
                            node = %self.node_full_name(),
                            samples = segment.remaining(),
                            "No output connected, dropping segment"
                        );
                    }
                }
            }

            self.state.lock().in_flight = 0;
        }
    }
}

/// A background drain; loops until the queue is empty
struct DrainTask {
    buffer: Arc<AsyncAudioWriteBuffer>,
    permit: GatePermit,
    cancel: CancellationToken,
}

impl DrainTask {
    async fn run(self) {
        let DrainTask {
            buffer,
            permit,
            cancel,
        } = self;

        let result = buffer.drain(&cancel).await;
        buffer.state.lock().in_flight = 0;
        drop(permit);

        match result {
            // A write may have queued data after the last dequeue but before the release
            Ok(()) if !cancel.is_cancelled() => buffer.start_drain(),
            Ok(()) => {}
            // No retry; the next write starts a fresh drain
            Err(e) => {
                error!(node = %buffer.node_full_name(), error = %e, "Background drain failed");
                buffer
                    .metrics
                    .report(MetricKey::BackgroundTaskFailures, buffer.node_full_name(), 1);
                *buffer.last_background_error.lock() = Some(e);
            }
        }
    }
}

impl AudioNode for AsyncAudioWriteBuffer {
    fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.background_cancel.cancel();
        self.state.lock().queue.clear();
        debug!(node = %self.node_full_name(), "Async write buffer disposed");
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}

#[async_trait]
impl AudioSampleTarget for AsyncAudioWriteBuffer {
    fn input_port(&self) -> &InputPort {
        &self.input
    }

    async fn write(&self, buffer: &[f32], count: usize, _cancel: &CancellationToken) -> AudioResult<()> {
        ensure_not_disposed(self)?;
        ensure_buffer_len(buffer.len(), count, self.input.format().num_channels())?;
        let _scope = self.input.graph().begin_scope(self.node_full_name());

        let accepted = {
            let mut state = self.state.lock();
            let accepted = count.min(self.max_samples.saturating_sub(state.buffered()));
            state.queue.push_copy(buffer, accepted);
            accepted
        };

        if accepted < count {
            let dropped = count - accepted;
            warn!(node = %self.node_full_name(), samples = dropped, "Async write buffer overflow");
            self.metrics.report(
                MetricKey::AsyncWriteBufferOverflowSamples,
                self.node_full_name(),
                dropped as u64,
            );
        }

        if accepted > 0 {
            self.start_drain();
        }
        Ok(())
    }

    /// Wait for the current drain to finish
    async fn flush(&self, cancel: &CancellationToken) -> AudioResult<()> {
        self.gate.wait_until_free(cancel).await
    }
}

#[async_trait]
impl AudioSampleSource for AsyncAudioWriteBuffer {
    fn output_port(&self) -> &OutputPort {
        &self.output
    }

    fn playback_finished(&self) -> bool {
        let upstream_finished = self
            .input
            .source()
            .is_some_and(|source| source.playback_finished());
        upstream_finished && self.buffered_samples() == 0
    }

    async fn read(
        &self,
        _buffer: &mut [f32],
        _count: usize,
        _cancel: &CancellationToken,
    ) -> AudioResult<ReadOutcome> {
        Err(AudioError::unsupported(self.node_full_name(), "read"))
    }
}

impl DelayingFilter for AsyncAudioWriteBuffer {
    fn algorithmic_delay(&self) -> Duration {
        duration_for_samples_per_channel(self.input.format().sample_rate_hz(), self.buffered_samples())
    }
}
