//! Endpoint contract shared by every audio node
//!
//! A node exposes a pull side ([`AudioSampleSource`]), a push side
//! ([`AudioSampleTarget`]) or both. Each side owns a port holding the graph it lives in,
//! its sample format and a weak reference to the connected peer, so wiring never creates a
//! strong reference cycle.
//!
//! Buffers are interleaved `f32` frames; every `count` is in samples per channel and the
//! caller's slice must hold at least `count * channels` values.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use super::error::{AudioError, AudioResult};
use super::format::AudioSampleFormat;
use super::graph::AudioGraph;
use super::metrics::AudioMetrics;
use crate::utils::audio_math::interleaved_len;

pub type SharedSource = Arc<dyn AudioSampleSource>;
pub type SharedTarget = Arc<dyn AudioSampleTarget>;

/// Result of a pull
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Frames written into the caller's buffer; zero means nothing is available yet
    Samples(usize),
    /// The stream ended permanently
    Finished,
}

impl ReadOutcome {
    /// Frames produced, zero for [`ReadOutcome::Finished`]
    pub fn samples(self) -> usize {
        match self {
            Self::Samples(count) => count,
            Self::Finished => 0,
        }
    }

    pub fn is_finished(self) -> bool {
        matches!(self, Self::Finished)
    }
}

/// Stable identity and display names of a node
#[derive(Debug, Clone)]
pub struct NodeIdentity {
    id: Uuid,
    name: String,
    full_name: String,
}

impl NodeIdentity {
    /// `name` is the custom name if given, otherwise the type name. `full_name` is always
    /// unique within the process.
    pub fn new(type_name: &str, custom_name: Option<&str>) -> Self {
        let id = Uuid::new_v4();
        let name = custom_name.unwrap_or(type_name).to_string();
        let full_name = match custom_name {
            Some(custom) => format!("{type_name}:{custom}:{}", &id.simple().to_string()[..8]),
            None => format!("{type_name}:{}", &id.simple().to_string()[..8]),
        };
        Self {
            id,
            name,
            full_name,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn full_name(&self) -> &str {
        &self.full_name
    }
}

/// Optional construction parameters shared by all components
#[derive(Debug, Clone, Default)]
pub struct NodeOptions {
    pub name: Option<String>,
    pub metrics: Option<Arc<AudioMetrics>>,
}

impl NodeOptions {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<AudioMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub(crate) fn identity(&self, type_name: &str) -> NodeIdentity {
        NodeIdentity::new(type_name, self.name.as_deref())
    }

    pub(crate) fn metrics(&self) -> Arc<AudioMetrics> {
        self.metrics.clone().unwrap_or_else(AudioMetrics::global)
    }
}

/// Pull side of a node
#[derive(Debug)]
pub struct OutputPort {
    graph: Arc<AudioGraph>,
    format: AudioSampleFormat,
    target: RwLock<Option<Weak<dyn AudioSampleTarget>>>,
}

impl OutputPort {
    pub fn new(graph: Arc<AudioGraph>, format: AudioSampleFormat) -> Self {
        Self {
            graph,
            format,
            target: RwLock::new(None),
        }
    }

    pub fn graph(&self) -> &Arc<AudioGraph> {
        &self.graph
    }

    pub fn format(&self) -> &AudioSampleFormat {
        &self.format
    }

    /// Connected downstream node, if it is still alive
    pub fn target(&self) -> Option<SharedTarget> {
        self.target.read().as_ref().and_then(Weak::upgrade)
    }

    pub fn is_connected(&self) -> bool {
        self.target().is_some()
    }

    fn attach(&self, target: &SharedTarget) {
        *self.target.write() = Some(Arc::downgrade(target));
    }

    fn detach(&self) -> Option<SharedTarget> {
        self.target.write().take().and_then(|weak| weak.upgrade())
    }
}

/// Push side of a node
#[derive(Debug)]
pub struct InputPort {
    graph: Arc<AudioGraph>,
    format: AudioSampleFormat,
    source: RwLock<Option<Weak<dyn AudioSampleSource>>>,
}

impl InputPort {
    pub fn new(graph: Arc<AudioGraph>, format: AudioSampleFormat) -> Self {
        Self {
            graph,
            format,
            source: RwLock::new(None),
        }
    }

    pub fn graph(&self) -> &Arc<AudioGraph> {
        &self.graph
    }

    pub fn format(&self) -> &AudioSampleFormat {
        &self.format
    }

    /// Connected upstream node, if it is still alive
    pub fn source(&self) -> Option<SharedSource> {
        self.source.read().as_ref().and_then(Weak::upgrade)
    }

    pub fn is_connected(&self) -> bool {
        self.source().is_some()
    }

    fn attach(&self, source: &SharedSource) {
        *self.source.write() = Some(Arc::downgrade(source));
    }

    fn detach(&self) -> Option<SharedSource> {
        self.source.write().take().and_then(|weak| weak.upgrade())
    }
}

pub trait AudioNode: Send + Sync {
    fn identity(&self) -> &NodeIdentity;

    /// Release buffers and stop background work. Idempotent.
    fn dispose(&self);

    fn is_disposed(&self) -> bool;

    fn node_id(&self) -> Uuid {
        self.identity().id()
    }

    fn node_name(&self) -> &str {
        self.identity().name()
    }

    fn node_full_name(&self) -> &str {
        self.identity().full_name()
    }
}

#[async_trait]
pub trait AudioSampleSource: AudioNode {
    fn output_port(&self) -> &OutputPort;

    /// True once the stream has ended for good
    fn playback_finished(&self) -> bool;

    /// Pull up to `count` frames into `buffer`.
    ///
    /// The caller holds the output graph's lock.
    async fn read(
        &self,
        buffer: &mut [f32],
        count: usize,
        cancel: &CancellationToken,
    ) -> AudioResult<ReadOutcome>;

    /// Called under the graph lock after the downstream peer went away
    fn on_output_disconnected(&self) {}

    fn output_format(&self) -> &AudioSampleFormat {
        self.output_port().format()
    }

    fn output_graph(&self) -> &Arc<AudioGraph> {
        self.output_port().graph()
    }

    fn output(&self) -> Option<SharedTarget> {
        self.output_port().target()
    }
}

#[async_trait]
pub trait AudioSampleTarget: AudioNode {
    fn input_port(&self) -> &InputPort;

    /// Push `count` frames from `buffer`.
    ///
    /// The caller holds the input graph's lock.
    async fn write(&self, buffer: &[f32], count: usize, cancel: &CancellationToken) -> AudioResult<()>;

    /// Push any internally buffered data downstream
    async fn flush(&self, cancel: &CancellationToken) -> AudioResult<()>;

    /// Reject new upstream connections, e.g. once playback finished
    fn check_accepts_input(&self) -> AudioResult<()> {
        Ok(())
    }

    /// Called under the graph lock after the upstream peer went away
    fn on_input_disconnected(&self) {}

    fn input_format(&self) -> &AudioSampleFormat {
        self.input_port().format()
    }

    fn input_graph(&self) -> &Arc<AudioGraph> {
        self.input_port().graph()
    }

    fn input(&self) -> Option<SharedSource> {
        self.input_port().source()
    }
}

/// Nodes that hold audio back and so add latency
pub trait DelayingFilter {
    fn algorithmic_delay(&self) -> Duration;
}

/// Fail unless `buffer_len` values hold `count` frames of `num_channels`
pub fn ensure_buffer_len(buffer_len: usize, count: usize, num_channels: usize) -> AudioResult<()> {
    let required = interleaved_len(count, num_channels);
    if buffer_len < required {
        return Err(AudioError::BufferTooSmall {
            required,
            actual: buffer_len,
        });
    }
    Ok(())
}

pub(crate) fn ensure_not_disposed(node: &dyn AudioNode) -> AudioResult<()> {
    if node.is_disposed() {
        return Err(AudioError::Disposed(node.node_full_name().to_string()));
    }
    Ok(())
}

/// Connect `source` to `target`, replacing any existing link on either side.
///
/// Formats must be equal and both sides must belong to the same graph.
pub async fn connect(source: SharedSource, target: SharedTarget) -> AudioResult<()> {
    ensure_not_disposed(source.as_ref())?;
    ensure_not_disposed(target.as_ref())?;
    AudioSampleFormat::ensure_equal(source.output_format(), target.input_format())?;
    if !Arc::ptr_eq(source.output_graph(), target.input_graph()) {
        return Err(AudioError::GraphMismatch {
            source_node: source.node_full_name().to_string(),
            target_node: target.node_full_name().to_string(),
        });
    }
    target.check_accepts_input()?;

    let graph = Arc::clone(source.output_graph());
    let _guard = graph.lock().await;
    link_locked(&source, &target);
    Ok(())
}

/// Disconnect whatever `source` feeds
pub async fn disconnect_output(source: &dyn AudioSampleSource) {
    let graph = Arc::clone(source.output_graph());
    let _guard = graph.lock().await;
    unlink_output_locked(source);
}

/// Disconnect whatever feeds `target`
pub async fn disconnect_input(target: &dyn AudioSampleTarget) {
    let graph = Arc::clone(target.input_graph());
    let _guard = graph.lock().await;
    unlink_input_locked(target);
}

fn link_locked(source: &SharedSource, target: &SharedTarget) {
    if let Some(current) = source.output() {
        if current.node_id() == target.node_id() {
            return;
        }
        current.input_port().detach();
        current.on_input_disconnected();
    }
    if let Some(previous) = target.input() {
        previous.output_port().detach();
        previous.on_output_disconnected();
    }

    source.output_port().attach(target);
    target.input_port().attach(source);
    debug!(
        source = %source.node_full_name(),
        target = %target.node_full_name(),
        "Audio nodes connected"
    );
}

/// Break the link on the output side of `source`; the caller holds the graph lock
pub(crate) fn unlink_output_locked(source: &dyn AudioSampleSource) {
    let target = source.output_port().detach();
    if let Some(target) = target {
        target.input_port().detach();
        debug!(
            source = %source.node_full_name(),
            target = %target.node_full_name(),
            "Audio nodes disconnected"
        );
        target.on_input_disconnected();
    }
    source.on_output_disconnected();
}

/// Break the link on the input side of `target`; the caller holds the graph lock
pub(crate) fn unlink_input_locked(target: &dyn AudioSampleTarget) {
    let source = target.input_port().detach();
    if let Some(source) = source {
        source.output_port().detach();
        debug!(
            source = %source.node_full_name(),
            target = %target.node_full_name(),
            "Audio nodes disconnected"
        );
        source.on_output_disconnected();
    }
    target.on_input_disconnected();
}
