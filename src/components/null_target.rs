use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio_util::sync::CancellationToken;

use crate::graph::node::ensure_not_disposed;
use crate::graph::{
    AudioGraph, AudioNode, AudioResult, AudioSampleFormat, AudioSampleTarget, InputPort,
    NodeIdentity, NodeOptions,
};

/// Discards everything written to it, counting frames
pub struct NullAudioSampleTarget {
    identity: NodeIdentity,
    input: InputPort,
    frames: AtomicU64,
    disposed: AtomicBool,
}

impl NullAudioSampleTarget {
    pub fn new(graph: Arc<AudioGraph>, format: AudioSampleFormat, options: NodeOptions) -> Arc<Self> {
        Arc::new(Self {
            identity: options.identity("NullAudioSampleTarget"),
            input: InputPort::new(graph, format),
            frames: AtomicU64::new(0),
            disposed: AtomicBool::new(false),
        })
    }

    pub fn frames_discarded(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }
}

impl AudioNode for NullAudioSampleTarget {
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
impl AudioSampleTarget for NullAudioSampleTarget {
    fn input_port(&self) -> &InputPort {
        &self.input
    }

    async fn write(&self, _buffer: &[f32], count: usize, _cancel: &CancellationToken) -> AudioResult<()> {
        ensure_not_disposed(self)?;
        self.frames.fetch_add(count as u64, Ordering::Relaxed);
        Ok(())
    }

    async fn flush(&self, _cancel: &CancellationToken) -> AudioResult<()> {
        Ok(())
    }
}
