//! Pull decoupler between two graphs
//!
//! A fast consumer in the output graph reads from this buffer without ever waiting on
//! the (possibly slow) source in the input graph. Each read drains whatever is queued
//! and then kicks a background refill that tops the queue up to the desired prefetch
//! depth. At most one refill is in flight at a time.
//!
//! ```text
//!   input graph                       output graph
//!   source ──(refill task)──► queue ──► read()
//! ```

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

use crate::config::AsyncReadBufferConfig;
use crate::graph::node::ensure_not_disposed;
use crate::graph::pool;
use crate::graph::segment::SegmentQueue;
use crate::graph::{
    AudioError, AudioGraph, AudioMetrics, AudioNode, AudioResult, AudioSampleFormat,
    AudioSampleSource, AudioSampleTarget, DelayingFilter, GatePermit, InputPort, MetricKey,
    NodeIdentity, NodeOptions, OutputPort, ReadOutcome, SingleFlightGate, ensure_buffer_len,
};
use crate::utils::audio_math::{
    duration_for_samples_per_channel, interleaved_len, samples_per_channel_for_duration,
};

pub struct AsyncAudioReadBuffer {
    identity: NodeIdentity,
    me: Weak<Self>,
    input: InputPort,
    output: OutputPort,
    queue: Mutex<SegmentQueue>,
    desired_samples: AtomicUsize,
    playback_finished: AtomicBool,
    gate: Arc<SingleFlightGate>,
    background_cancel: CancellationToken,
    metrics: Arc<AudioMetrics>,
    last_background_error: Mutex<Option<AudioError>>,
    disposed: AtomicBool,
}

impl AsyncAudioReadBuffer {
    pub fn new(
        input_graph: Arc<AudioGraph>,
        output_graph: Arc<AudioGraph>,
        format: AudioSampleFormat,
        config: &AsyncReadBufferConfig,
        options: NodeOptions,
    ) -> AudioResult<Arc<Self>> {
        let identity = options.identity("AsyncAudioReadBuffer");
        if Arc::ptr_eq(&input_graph, &output_graph) {
            return Err(AudioError::SameGraph(identity.full_name().to_string()));
        }
        config.validate()?;
        let desired = Self::desired_samples_for(&format, config.desired_buffer_length())?;

        Ok(Arc::new_cyclic(|me| Self {
            identity,
            me: me.clone(),
            input: InputPort::new(input_graph, format),
            output: OutputPort::new(output_graph, format),
            queue: Mutex::new(SegmentQueue::new(format.num_channels())),
            desired_samples: AtomicUsize::new(desired),
            playback_finished: AtomicBool::new(false),
            gate: SingleFlightGate::new(),
            background_cancel: CancellationToken::new(),
            metrics: options.metrics(),
            last_background_error: Mutex::new(None),
            disposed: AtomicBool::new(false),
        }))
    }

    /// Prefetch depth in frames
    pub fn desired_buffer_samples(&self) -> usize {
        self.desired_samples.load(Ordering::Relaxed)
    }

    pub fn desired_buffer_length(&self) -> Duration {
        duration_for_samples_per_channel(
            self.output.format().sample_rate_hz(),
            self.desired_buffer_samples(),
        )
    }

    /// Change the prefetch depth; takes effect on the next read
    pub fn set_desired_buffer_length(&self, length: Duration) -> AudioResult<()> {
        let desired = Self::desired_samples_for(self.output.format(), length)?;
        self.desired_samples.store(desired, Ordering::Relaxed);
        Ok(())
    }

    /// Frames currently queued
    pub fn buffered_samples(&self) -> usize {
        self.queue.lock().len()
    }

    /// Most recent failure of a background refill, if any
    pub fn last_background_error(&self) -> Option<AudioError> {
        self.last_background_error.lock().clone()
    }

    /// Start a background refill of `samples` frames, or of whatever is missing from the
    /// desired depth when `None`. Does nothing if a refill is already in flight, the
    /// request is empty or playback has finished.
    pub fn fill_buffer_in_background(&self, samples: Option<usize>) {
        let read_len = match samples {
            Some(samples) => samples,
            None => self
                .desired_buffer_samples()
                .saturating_sub(self.buffered_samples()),
        };
        if read_len == 0 || self.playback_finished() || self.is_disposed() {
            return;
        }

        let Some(permit) = self.gate.try_claim() else {
            trace!(node = %self.node_full_name(), "Refill already in flight");
            return;
        };
        let Some(buffer) = self.me.upgrade() else {
            return;
        };
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(e) => {
                error!(node = %self.node_full_name(), error = %e, "No runtime available for background refill");
                return;
            }
        };

        let task = RefillTask {
            buffer,
            permit,
            read_len,
            cancel: self.background_cancel.child_token(),
        };
        handle.spawn(task.run());
    }

    /// Wait until no background refill is in flight
    pub async fn wait_for_current_read_to_finish(&self, cancel: &CancellationToken) -> AudioResult<()> {
        self.gate.wait_until_free(cancel).await
    }

    fn desired_samples_for(format: &AudioSampleFormat, length: Duration) -> AudioResult<usize> {
        let samples = samples_per_channel_for_duration(format.sample_rate_hz(), length);
        if samples == 0 {
            return Err(AudioError::buffer_length(
                "desired_buffer_length",
                "must be greater than zero",
            ));
        }
        Ok(samples)
    }

    /// One refill: read from upstream under the input graph's lock, then queue the
    /// result under the buffer lock. The two locks are never held together.
    async fn refill(&self, read_len: usize, cancel: &CancellationToken) -> AudioResult<()> {
        let graph = Arc::clone(self.input.graph());
        let (segment, outcome, upstream) = {
            let _guard = graph.lock_cancellable(cancel).await?;
            let _scope = graph.begin_scope(self.node_full_name());
            let Some(upstream) = self.input.source() else {
                return Ok(());
            };

            let channels = self.input.format().num_channels();
            let mut segment = pool::rent(interleaved_len(read_len, channels));
            let outcome = upstream.read(&mut segment, read_len, cancel).await?;
            (segment, outcome, upstream)
        };

        let mut queue = self.queue.lock();
        if let ReadOutcome::Samples(read) = outcome {
            queue.push(segment, read);
        }
        if queue.is_empty() && (outcome.is_finished() || upstream.playback_finished()) {
            self.playback_finished.store(true, Ordering::Release);
            debug!(node = %self.node_full_name(), "Upstream finished, read buffer drained");
        }
        Ok(())
    }
}

/// A single background refill
struct RefillTask {
    buffer: Arc<AsyncAudioReadBuffer>,
    permit: GatePermit,
    read_len: usize,
    cancel: CancellationToken,
}

impl RefillTask {
    async fn run(self) {
        let RefillTask {
            buffer,
            permit,
            read_len,
            cancel,
        } = self;

        if let Err(e) = buffer.refill(read_len, &cancel).await {
            error!(node = %buffer.node_full_name(), error = %e, "Background refill failed");
            buffer
                .metrics
                .report(MetricKey::BackgroundTaskFailures, buffer.node_full_name(), 1);
            *buffer.last_background_error.lock() = Some(e);
        }
        drop(permit);
    }
}

impl AudioNode for AsyncAudioReadBuffer {
    fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.background_cancel.cancel();
        self.queue.lock().clear();
        debug!(node = %self.node_full_name(), "Async read buffer disposed");
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}

#[async_trait]
impl AudioSampleSource for AsyncAudioReadBuffer {
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
        if self.playback_finished() {
            return Ok(ReadOutcome::Finished);
        }

        let _scope = self.output.graph().begin_scope(self.node_full_name());
        let (read, missing) = {
            let mut queue = self.queue.lock();
            let read = queue.drain_into(buffer, count);
            (read, self.desired_buffer_samples().saturating_sub(queue.len()))
        };

        if read == 0 && count > 0 {
            debug!(node = %self.node_full_name(), samples = count, "Async read buffer underflow");
            self.metrics.report(
                MetricKey::AsyncReadBufferUnderflowSamples,
                self.node_full_name(),
                count as u64,
            );
        }

        self.fill_buffer_in_background(Some(missing));
        Ok(ReadOutcome::Samples(read))
    }
}

#[async_trait]
impl AudioSampleTarget for AsyncAudioReadBuffer {
    fn input_port(&self) -> &InputPort {
        &self.input
    }

    async fn write(&self, _buffer: &[f32], _count: usize, _cancel: &CancellationToken) -> AudioResult<()> {
        Err(AudioError::unsupported(self.node_full_name(), "write"))
    }

    async fn flush(&self, _cancel: &CancellationToken) -> AudioResult<()> {
        Err(AudioError::unsupported(self.node_full_name(), "flush"))
    }

    fn check_accepts_input(&self) -> AudioResult<()> {
        if self.playback_finished() {
            return Err(AudioError::PlaybackFinished(self.node_full_name().to_string()));
        }
        Ok(())
    }
}

impl DelayingFilter for AsyncAudioReadBuffer {
    fn algorithmic_delay(&self) -> Duration {
        duration_for_samples_per_channel(self.output.format().sample_rate_hz(), self.buffered_samples())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graphs() -> (Arc<AudioGraph>, Arc<AudioGraph>) {
        (AudioGraph::new("input"), AudioGraph::new("output"))
    }

    #[test]
    fn test_rejects_same_graph() {
        let graph = AudioGraph::new("shared");
        let format = AudioSampleFormat::mono(16000).unwrap();
        let result = AsyncAudioReadBuffer::new(
            graph.clone(),
            graph,
            format,
            &AsyncReadBufferConfig::default(),
            NodeOptions::default(),
        );
        assert!(matches!(result, Err(AudioError::SameGraph(_))));
    }

    #[test]
    fn test_rejects_zero_length() {
        let (input, output) = graphs();
        let format = AudioSampleFormat::mono(16000).unwrap();
        let buffer = AsyncAudioReadBuffer::new(
            input,
            output,
            format,
            &AsyncReadBufferConfig::default(),
            NodeOptions::default(),
        )
        .unwrap();

        assert_eq!(buffer.desired_buffer_samples(), 1600);
        assert!(buffer.set_desired_buffer_length(Duration::ZERO).is_err());
        buffer
            .set_desired_buffer_length(Duration::from_millis(250))
            .unwrap();
        assert_eq!(buffer.desired_buffer_samples(), 4000);
        assert_eq!(buffer.desired_buffer_length(), Duration::from_millis(250));
    }

    #[tokio::test]
    async fn test_write_is_unsupported() {
        let (input, output) = graphs();
        let format = AudioSampleFormat::mono(16000).unwrap();
        let buffer = AsyncAudioReadBuffer::new(
            input,
            output,
            format,
            &AsyncReadBufferConfig::default(),
            NodeOptions::default(),
        )
        .unwrap();

        let result = buffer.write(&[0.0; 4], 4, &CancellationToken::new()).await;
        assert!(matches!(result, Err(AudioError::Unsupported { .. })));
    }

    #[tokio::test]
    async fn test_read_without_input_underflows() {
        let (input, output) = graphs();
        let format = AudioSampleFormat::mono(16000).unwrap();
        let metrics = Arc::new(AudioMetrics::new());
        let buffer = AsyncAudioReadBuffer::new(
            input,
            output,
            format,
            &AsyncReadBufferConfig::default(),
            NodeOptions::default().with_metrics(metrics.clone()),
        )
        .unwrap();
        let cancel = CancellationToken::new();

        let mut samples = vec![0.0; 100];
        let outcome = buffer.read(&mut samples, 100, &cancel).await.unwrap();
        assert_eq!(outcome, ReadOutcome::Samples(0));
        buffer.wait_for_current_read_to_finish(&cancel).await.unwrap();

        assert_eq!(metrics.counter(MetricKey::AsyncReadBufferUnderflowSamples), 100);
        assert!(!buffer.playback_finished());
        assert_eq!(buffer.algorithmic_delay(), Duration::ZERO);
    }
}
