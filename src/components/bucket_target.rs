//! Target that keeps everything it receives

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio_util::sync::CancellationToken;

use crate::graph::node::ensure_not_disposed;
use crate::graph::pool;
use crate::graph::{
    AudioGraph, AudioNode, AudioResult, AudioSampleFormat, AudioSampleTarget, InputPort,
    NodeIdentity, NodeOptions, ReadOutcome, ensure_buffer_len,
};
use crate::utils::audio_math::interleaved_len;

/// Collects written or pulled frames in memory
pub struct BucketAudioSampleTarget {
    identity: NodeIdentity,
    input: InputPort,
    samples: Mutex<Vec<f32>>,
    writes: Mutex<Vec<usize>>,
    disposed: AtomicBool,
}

impl BucketAudioSampleTarget {
    pub fn new(graph: Arc<AudioGraph>, format: AudioSampleFormat, options: NodeOptions) -> Arc<Self> {
        Arc::new(Self {
            identity: options.identity("BucketAudioSampleTarget"),
            input: InputPort::new(graph, format),
            samples: Mutex::new(Vec::new()),
            writes: Mutex::new(Vec::new()),
            disposed: AtomicBool::new(false),
        })
    }

    /// Pull up to `count` frames from the connected source and keep them.
    ///
    /// Takes the input graph's lock for the duration of the read.
    pub async fn read_from_input(&self, count: usize, cancel: &CancellationToken) -> AudioResult<ReadOutcome> {
        ensure_not_disposed(self)?;
        let graph = Arc::clone(self.input.graph());
        let _guard = graph.lock_cancellable(cancel).await?;
        let Some(source) = self.input.source() else {
            return Ok(ReadOutcome::Samples(0));
        };

        let channels = self.input.format().num_channels();
        let mut scratch = pool::rent(interleaved_len(count, channels));
        let outcome = source.read(&mut scratch, count, cancel).await?;
        if let ReadOutcome::Samples(read) = outcome {
            self.samples
                .lock()
                .extend_from_slice(&scratch[..interleaved_len(read, channels)]);
        }
        Ok(outcome)
    }

    /// Copy of every value received so far
    pub fn samples(&self) -> Vec<f32> {
        self.samples.lock().clone()
    }

    /// Frames received so far
    pub fn frames(&self) -> usize {
        self.samples.lock().len() / self.input.format().num_channels()
    }

    /// Frame counts of each `write` call, in order
    pub fn write_sizes(&self) -> Vec<usize> {
        self.writes.lock().clone()
    }

    pub fn clear(&self) {
        self.samples.lock().clear();
        self.writes.lock().clear();
    }
}

impl AudioNode for BucketAudioSampleTarget {
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
impl AudioSampleTarget for BucketAudioSampleTarget {
    fn input_port(&self) -> &InputPort {
        &self.input
    }

    async fn write(&self, buffer: &[f32], count: usize, _cancel: &CancellationToken) -> AudioResult<()> {
        ensure_not_disposed(self)?;
        let channels = self.input.format().num_channels();
        ensure_buffer_len(buffer.len(), count, channels)?;
        self.samples
            .lock()
            .extend_from_slice(&buffer[..interleaved_len(count, channels)]);
        self.writes.lock().push(count);
        Ok(())
    }

    async fn flush(&self, _cancel: &CancellationToken) -> AudioResult<()> {
        Ok(())
    }
}
