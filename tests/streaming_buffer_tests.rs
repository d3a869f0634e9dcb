//! Streaming Buffer Tests
//!
//! Exercises the boundary components that decouple independently paced graphs:
//! - AsyncAudioReadBuffer prefetching, single-flight refills and lossless relay
//! - AsyncAudioWriteBuffer bounded acceptance and background drain
//! - PushPullBuffer overflow pruning and lazy end of stream
//!
//! Run: cargo test --test streaming_buffer_tests -- --nocapture

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use waav_audio_graph::config::{
    AsyncReadBufferConfig, AsyncWriteBufferConfig, PushPullBufferConfig,
};
use waav_audio_graph::graph::{DelayingFilter, InputPort, MetricKey, NodeIdentity, OutputPort};
use waav_audio_graph::{
    AsyncAudioReadBuffer, AsyncAudioWriteBuffer, AudioError, AudioGraph, AudioMetrics, AudioNode,
    AudioResult, AudioSampleFormat, AudioSampleSource, AudioSampleTarget, BucketAudioSampleTarget,
    FixedAudioSampleSource, NodeOptions, PushPullBuffer, ReadOutcome, connect,
};

mod common {
    use super::*;

    pub fn mono(rate: u32) -> AudioSampleFormat {
        AudioSampleFormat::mono(rate).unwrap()
    }

    pub fn ramp(frames: usize) -> Vec<f32> {
        (0..frames).map(|i| i as f32).collect()
    }

    /// Source that counts reads and blocks each one until a permit is released
    pub struct GatedSource {
        identity: NodeIdentity,
        output: OutputPort,
        pub reads: AtomicUsize,
        pub permits: Semaphore,
        disposed: AtomicBool,
    }

    impl GatedSource {
        pub fn new(graph: Arc<AudioGraph>, format: AudioSampleFormat) -> Arc<Self> {
            Arc::new(Self {
                identity: NodeIdentity::new("GatedSource", None),
                output: OutputPort::new(graph, format),
                reads: AtomicUsize::new(0),
                permits: Semaphore::new(0),
                disposed: AtomicBool::new(false),
            })
        }
    }

    impl AudioNode for GatedSource {
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
    impl AudioSampleSource for GatedSource {
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
            self.reads.fetch_add(1, Ordering::SeqCst);
            let permit = self
                .permits
                .acquire()
                .await
                .map_err(|e| AudioError::Internal(e.to_string()))?;
            permit.forget();
            buffer[..count].fill(1.0);
            Ok(ReadOutcome::Samples(count))
        }
    }

    /// Source whose every read fails
    pub struct FailingSource {
        identity: NodeIdentity,
        output: OutputPort,
    }

    impl FailingSource {
        pub fn new(graph: Arc<AudioGraph>, format: AudioSampleFormat) -> Arc<Self> {
            Arc::new(Self {
                identity: NodeIdentity::new("FailingSource", None),
                output: OutputPort::new(graph, format),
            })
        }
    }

    impl AudioNode for FailingSource {
        fn identity(&self) -> &NodeIdentity {
            &self.identity
        }

        fn dispose(&self) {}

        fn is_disposed(&self) -> bool {
            false
        }
    }

    #[async_trait]
    impl AudioSampleSource for FailingSource {
        fn output_port(&self) -> &OutputPort {
            &self.output
        }

        fn playback_finished(&self) -> bool {
            false
        }

        async fn read(
            &self,
            _buffer: &mut [f32],
            _count: usize,
            _cancel: &CancellationToken,
        ) -> AudioResult<ReadOutcome> {
            Err(AudioError::Internal("device unplugged".into()))
        }
    }

    /// Target that counts write attempts and fails every one
    pub struct FailingTarget {
        identity: NodeIdentity,
        input: InputPort,
        pub attempts: AtomicUsize,
    }

    impl FailingTarget {
        pub fn new(graph: Arc<AudioGraph>, format: AudioSampleFormat) -> Arc<Self> {
            Arc::new(Self {
                identity: NodeIdentity::new("FailingTarget", None),
                input: InputPort::new(graph, format),
                attempts: AtomicUsize::new(0),
            })
        }
    }

    impl AudioNode for FailingTarget {
        fn identity(&self) -> &NodeIdentity {
            &self.identity
        }

        fn dispose(&self) {}

        fn is_disposed(&self) -> bool {
            false
        }
    }

    #[async_trait]
    impl AudioSampleTarget for FailingTarget {
        fn input_port(&self) -> &InputPort {
            &self.input
        }

        async fn write(&self, _buffer: &[f32], _count: usize, _cancel: &CancellationToken) -> AudioResult<()> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(AudioError::Internal("speaker gone".into()))
        }

        async fn flush(&self, _cancel: &CancellationToken) -> AudioResult<()> {
            Ok(())
        }
    }
}

use common::*;

// =============================================================================
// AsyncAudioReadBuffer
// =============================================================================

#[tokio::test]
async fn test_read_buffer_prefetch_scenario() {
    let producer = AudioGraph::new("producer");
    let consumer = AudioGraph::new("consumer");
    let metrics = Arc::new(AudioMetrics::new());
    let format = mono(16000);

    let source = FixedAudioSampleSource::new(
        producer.clone(),
        format,
        ramp(16000),
        NodeOptions::default(),
    )
    .unwrap();
    let buffer = AsyncAudioReadBuffer::new(
        producer,
        consumer,
        format,
        &AsyncReadBufferConfig::new(Duration::from_millis(100)),
        NodeOptions::named("prefetch").with_metrics(metrics.clone()),
    )
    .unwrap();
    connect(source.clone(), buffer.clone()).await.unwrap();
    assert_eq!(buffer.desired_buffer_samples(), 1600);

    let cancel = CancellationToken::new();
    let mut out = vec![0.0; 500];

    // Nothing queued yet: zero frames, and a full-depth fill starts
    let outcome = buffer.read(&mut out, 500, &cancel).await.unwrap();
    assert_eq!(outcome, ReadOutcome::Samples(0));
    buffer.wait_for_current_read_to_finish(&cancel).await.unwrap();
    assert_eq!(buffer.buffered_samples(), 1600);
    assert_eq!(source.remaining(), 16000 - 1600);
    assert_eq!(metrics.counter(MetricKey::AsyncReadBufferUnderflowSamples), 500);

    // Real data now, and only the consumed 500 frames are fetched again
    let outcome = buffer.read(&mut out, 500, &cancel).await.unwrap();
    assert_eq!(outcome, ReadOutcome::Samples(500));
    assert_eq!(out, ramp(500));
    buffer.wait_for_current_read_to_finish(&cancel).await.unwrap();
    assert_eq!(buffer.buffered_samples(), 1600);
    assert_eq!(source.remaining(), 16000 - 2100);
    assert_eq!(
        buffer.algorithmic_delay(),
        Duration::from_millis(100)
    );
}

#[tokio::test]
async fn test_read_buffer_lossless_relay() {
    let producer = AudioGraph::new("producer");
    let consumer = AudioGraph::new("consumer");
    let format = mono(16000);
    let expected = ramp(5000);

    let source =
        FixedAudioSampleSource::new(producer.clone(), format, expected.clone(), NodeOptions::default())
            .unwrap();
    let buffer = AsyncAudioReadBuffer::new(
        producer,
        consumer.clone(),
        format,
        &AsyncReadBufferConfig::new(Duration::from_millis(50)),
        NodeOptions::default().with_metrics(Arc::new(AudioMetrics::new())),
    )
    .unwrap();
    let bucket = BucketAudioSampleTarget::new(consumer, format, NodeOptions::default());
    connect(source.clone(), buffer.clone()).await.unwrap();
    connect(buffer.clone(), bucket.clone()).await.unwrap();

    let cancel = CancellationToken::new();
    let mut finished = false;
    for _ in 0..1000 {
        match bucket.read_from_input(700, &cancel).await.unwrap() {
            ReadOutcome::Finished => {
                finished = true;
                break;
            }
            ReadOutcome::Samples(0) => {
                buffer.wait_for_current_read_to_finish(&cancel).await.unwrap();
            }
            ReadOutcome::Samples(_) => {}
        }
    }

    assert!(finished);
    assert_eq!(bucket.samples(), expected);
    assert!(buffer.playback_finished());

    // Finished is cached
    let mut out = vec![0.0; 10];
    let outcome = buffer.read(&mut out, 10, &cancel).await.unwrap();
    assert_eq!(outcome, ReadOutcome::Finished);
}

#[tokio::test]
async fn test_read_buffer_refill_is_single_flight() {
    let producer = AudioGraph::new("producer");
    let consumer = AudioGraph::new("consumer");
    let format = mono(16000);

    let source = GatedSource::new(producer.clone(), format);
    let buffer = AsyncAudioReadBuffer::new(
        producer,
        consumer,
        format,
        &AsyncReadBufferConfig::new(Duration::from_millis(10)),
        NodeOptions::default().with_metrics(Arc::new(AudioMetrics::new())),
    )
    .unwrap();
    connect(source.clone(), buffer.clone()).await.unwrap();

    buffer.fill_buffer_in_background(Some(100));
    buffer.fill_buffer_in_background(Some(100));
    while source.reads.load(Ordering::SeqCst) == 0 {
        tokio::task::yield_now().await;
    }

    // A read while the refill is blocked must not start another one
    let cancel = CancellationToken::new();
    let mut out = vec![0.0; 50];
    let outcome = buffer.read(&mut out, 50, &cancel).await.unwrap();
    assert_eq!(outcome, ReadOutcome::Samples(0));
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    assert_eq!(source.reads.load(Ordering::SeqCst), 1);

    source.permits.add_permits(1);
    buffer.wait_for_current_read_to_finish(&cancel).await.unwrap();
    assert_eq!(source.reads.load(Ordering::SeqCst), 1);
    assert_eq!(buffer.buffered_samples(), 100);
}

#[tokio::test]
async fn test_read_buffer_records_background_failure() {
    let producer = AudioGraph::new("producer");
    let consumer = AudioGraph::new("consumer");
    let metrics = Arc::new(AudioMetrics::new());
    let format = mono(16000);

    let source = FailingSource::new(producer.clone(), format);
    let buffer = AsyncAudioReadBuffer::new(
        producer,
        consumer,
        format,
        &AsyncReadBufferConfig::default(),
        NodeOptions::default().with_metrics(metrics.clone()),
    )
    .unwrap();
    connect(source.clone(), buffer.clone()).await.unwrap();

    let cancel = CancellationToken::new();
    let mut out = vec![0.0; 160];
    let outcome = buffer.read(&mut out, 160, &cancel).await.unwrap();
    assert_eq!(outcome, ReadOutcome::Samples(0));
    buffer.wait_for_current_read_to_finish(&cancel).await.unwrap();

    assert_eq!(
        buffer.last_background_error(),
        Some(AudioError::Internal("device unplugged".into()))
    );
    assert_eq!(metrics.counter(MetricKey::BackgroundTaskFailures), 1);

    // The failure stays in the background; the next read still succeeds
    let outcome = buffer.read(&mut out, 160, &cancel).await.unwrap();
    assert_eq!(outcome, ReadOutcome::Samples(0));
}

#[tokio::test]
async fn test_read_buffer_rejects_input_after_finish() {
    let producer = AudioGraph::new("producer");
    let consumer = AudioGraph::new("consumer");
    let format = mono(8000);

    let source =
        FixedAudioSampleSource::new(producer.clone(), format, vec![0.5; 10], NodeOptions::default())
            .unwrap();
    let buffer = AsyncAudioReadBuffer::new(
        producer.clone(),
        consumer,
        format,
        &AsyncReadBufferConfig::default(),
        NodeOptions::default().with_metrics(Arc::new(AudioMetrics::new())),
    )
    .unwrap();
    connect(source.clone(), buffer.clone()).await.unwrap();

    let cancel = CancellationToken::new();
    let mut out = vec![0.0; 800];
    for _ in 0..10 {
        if buffer.read(&mut out, 800, &cancel).await.unwrap().is_finished() {
            break;
        }
        buffer.wait_for_current_read_to_finish(&cancel).await.unwrap();
    }
    assert!(buffer.playback_finished());

    let another =
        FixedAudioSampleSource::new(producer, format, vec![0.5; 10], NodeOptions::default()).unwrap();
    let result = connect(another, buffer.clone()).await;
    assert!(matches!(result, Err(AudioError::PlaybackFinished(_))));
}

// =============================================================================
// AsyncAudioWriteBuffer
// =============================================================================

#[tokio::test]
async fn test_write_buffer_bounded_loss() {
    let producer = AudioGraph::new("producer");
    let consumer = AudioGraph::new("consumer");
    let metrics = Arc::new(AudioMetrics::new());
    let format = mono(10000);

    let buffer = AsyncAudioWriteBuffer::new(
        producer,
        consumer.clone(),
        format,
        &AsyncWriteBufferConfig::new(Duration::from_millis(100)),
        NodeOptions::named("decoupler").with_metrics(metrics.clone()),
    )
    .unwrap();
    let bucket = BucketAudioSampleTarget::new(consumer, format, NodeOptions::default());
    connect(buffer.clone(), bucket.clone()).await.unwrap();
    assert_eq!(buffer.max_buffer_samples(), 1000);

    let cancel = CancellationToken::new();
    buffer.write(&ramp(1500), 1500, &cancel).await.unwrap();
    assert_eq!(buffer.buffered_samples(), 1000);
    assert_eq!(metrics.counter(MetricKey::AsyncWriteBufferOverflowSamples), 500);

    // The drain has not run yet, so nothing more fits
    buffer.write(&ramp(200), 200, &cancel).await.unwrap();
    assert!(buffer.buffered_samples() <= 1000);
    assert_eq!(metrics.counter(MetricKey::AsyncWriteBufferOverflowSamples), 700);

    buffer.flush(&cancel).await.unwrap();
    assert_eq!(buffer.buffered_samples(), 0);
    assert_eq!(bucket.samples(), ramp(1000));
}

#[tokio::test]
async fn test_write_buffer_relays_pushed_stream() {
    let producer = AudioGraph::new("producer");
    let consumer = AudioGraph::new("consumer");
    let format = mono(16000);
    let expected = ramp(3200);

    let source =
        FixedAudioSampleSource::new(producer.clone(), format, expected.clone(), NodeOptions::default())
            .unwrap();
    let buffer = AsyncAudioWriteBuffer::new(
        producer,
        consumer.clone(),
        format,
        &AsyncWriteBufferConfig::new(Duration::from_millis(500)),
        NodeOptions::default().with_metrics(Arc::new(AudioMetrics::new())),
    )
    .unwrap();
    let bucket = BucketAudioSampleTarget::new(consumer, format, NodeOptions::default());
    connect(source.clone(), buffer.clone()).await.unwrap();
    connect(buffer.clone(), bucket.clone()).await.unwrap();

    let cancel = CancellationToken::new();
    let sent = source.write_all_to_output(320, &cancel).await.unwrap();
    assert_eq!(sent, 3200);
    buffer.flush(&cancel).await.unwrap();

    assert_eq!(bucket.samples(), expected);
    assert!(buffer.playback_finished());
    assert_eq!(buffer.algorithmic_delay(), Duration::ZERO);
}

#[tokio::test]
async fn test_write_buffer_failed_drain_is_not_retried() {
    let producer = AudioGraph::new("producer");
    let consumer = AudioGraph::new("consumer");
    let metrics = Arc::new(AudioMetrics::new());
    let format = mono(16000);

    let buffer = AsyncAudioWriteBuffer::new(
        producer,
        consumer.clone(),
        format,
        &AsyncWriteBufferConfig::new(Duration::from_millis(100)),
        NodeOptions::named("decoupler").with_metrics(metrics.clone()),
    )
    .unwrap();
    let target = FailingTarget::new(consumer, format);
    connect(buffer.clone(), target.clone()).await.unwrap();

    let cancel = CancellationToken::new();
    for _ in 0..3 {
        buffer.write(&ramp(100), 100, &cancel).await.unwrap();
    }
    buffer.flush(&cancel).await.unwrap();

    // One unit, one attempt; the undelivered segments stay queued
    assert_eq!(target.attempts.load(Ordering::SeqCst), 1);
    assert_eq!(metrics.counter(MetricKey::BackgroundTaskFailures), 1);
    assert!(matches!(buffer.last_background_error(), Some(AudioError::Internal(_))));
    assert_eq!(buffer.buffered_samples(), 200);

    // The next write starts a fresh drain
    buffer.write(&ramp(100), 100, &cancel).await.unwrap();
    buffer.flush(&cancel).await.unwrap();
    assert_eq!(target.attempts.load(Ordering::SeqCst), 2);
    assert_eq!(metrics.counter(MetricKey::BackgroundTaskFailures), 2);
}

// =============================================================================
// PushPullBuffer
// =============================================================================

#[tokio::test]
async fn test_push_pull_overflow_prunes_oldest() {
    let producer = AudioGraph::new("producer");
    let consumer = AudioGraph::new("consumer");
    let metrics = Arc::new(AudioMetrics::new());
    let format = mono(10000);

    let relay = PushPullBuffer::new(
        producer,
        consumer,
        format,
        &PushPullBufferConfig::bounded(Duration::from_millis(100)),
        NodeOptions::named("relay").with_metrics(metrics.clone()),
    )
    .unwrap();
    assert_eq!(relay.max_buffer_samples(), Some(1000));

    let cancel = CancellationToken::new();
    for value in [1.0, 2.0, 3.0] {
        relay.write(&[value; 500], 500, &cancel).await.unwrap();
    }
    assert_eq!(relay.buffered_samples(), 1000);
    assert_eq!(metrics.counter(MetricKey::PushPullBufferOverflowSamples), 500);
    assert_eq!(
        metrics.node_counter(relay.node_full_name(), MetricKey::PushPullBufferOverflowSamples),
        500
    );

    let mut out = vec![0.0; 1000];
    let outcome = relay.read(&mut out, 1000, &cancel).await.unwrap();
    assert_eq!(outcome, ReadOutcome::Samples(1000));
    assert!(out[..500].iter().all(|&v| v == 2.0));
    assert!(out[500..].iter().all(|&v| v == 3.0));
}

#[tokio::test]
async fn test_push_pull_underflow_then_finish() {
    let producer = AudioGraph::new("producer");
    let consumer = AudioGraph::new("consumer");
    let metrics = Arc::new(AudioMetrics::new());
    let format = mono(16000);

    let source =
        FixedAudioSampleSource::new(producer.clone(), format, ramp(640), NodeOptions::default())
            .unwrap();
    let relay = PushPullBuffer::new(
        producer.clone(),
        consumer.clone(),
        format,
        &PushPullBufferConfig::unbounded(),
        NodeOptions::default().with_metrics(metrics.clone()),
    )
    .unwrap();
    let bucket = BucketAudioSampleTarget::new(consumer, format, NodeOptions::default());
    connect(source.clone(), relay.clone()).await.unwrap();
    connect(relay.clone(), bucket.clone()).await.unwrap();

    let cancel = CancellationToken::new();

    // Nothing pushed yet and upstream still live
    let outcome = bucket.read_from_input(160, &cancel).await.unwrap();
    assert_eq!(outcome, ReadOutcome::Samples(0));
    assert_eq!(metrics.counter(MetricKey::PushPullBufferUnderflowSamples), 160);

    source.write_all_to_output(320, &cancel).await.unwrap();
    assert_eq!(relay.buffered_samples(), 640);

    assert_eq!(bucket.read_from_input(400, &cancel).await.unwrap(), ReadOutcome::Samples(400));
    assert_eq!(bucket.read_from_input(400, &cancel).await.unwrap(), ReadOutcome::Samples(240));
    assert_eq!(bucket.read_from_input(400, &cancel).await.unwrap(), ReadOutcome::Finished);
    assert_eq!(bucket.samples(), ramp(640));
    assert!(relay.playback_finished());

    // No reconnecting a finished relay
    let late =
        FixedAudioSampleSource::new(producer, format, ramp(10), NodeOptions::default()).unwrap();
    let result = connect(late, relay.clone()).await;
    assert!(matches!(result, Err(AudioError::PlaybackFinished(_))));
}

#[tokio::test]
async fn test_push_pull_without_input_reads_nothing() {
    let graph = AudioGraph::new("shared");
    let relay = PushPullBuffer::new(
        graph.clone(),
        graph,
        mono(16000),
        &PushPullBufferConfig::unbounded(),
        NodeOptions::default().with_metrics(Arc::new(AudioMetrics::new())),
    )
    .unwrap();

    let mut out = vec![0.0; 64];
    let outcome = relay.read(&mut out, 64, &CancellationToken::new()).await.unwrap();
    assert_eq!(outcome, ReadOutcome::Samples(0));
    assert!(!relay.playback_finished());
}
