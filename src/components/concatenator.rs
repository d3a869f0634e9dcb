//! Sequential N:1 merge
//!
//! Inputs play one after another in the order they were added. A read keeps pulling the
//! head input until it reports the end of its stream, then moves to the next one. A
//! partial read from the head ends the call so the head is never skipped while it is
//! merely slow.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, broadcast};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::ConcatenatorConfig;
use crate::graph::node::{ensure_not_disposed, unlink_output_locked};
use crate::graph::{
    AudioError, AudioGraph, AudioNode, AudioResult, AudioSampleFormat, AudioSampleSource,
    AudioSampleTarget, ChannelEvents, ChannelFinishedEvent, ChannelToken, InputPort, NodeIdentity,
    NodeOptions, OutputPort, ReadOutcome, SharedSource, SharedTarget, connect, ensure_buffer_len,
};
use crate::utils::audio_math::interleaved_len;

struct ConcatSlot {
    endpoint: Arc<ConcatenatorInput>,
    token: Option<ChannelToken>,
    source: SharedSource,
    owns_source: bool,
}

struct ConcatState {
    queue: VecDeque<ConcatSlot>,
    any_input_attached: bool,
}

pub struct AudioConcatenator {
    identity: NodeIdentity,
    output: OutputPort,
    state: Mutex<ConcatState>,
    read_forever: bool,
    playback_finished: AtomicBool,
    events: ChannelEvents,
    disposed: AtomicBool,
}

impl AudioConcatenator {
    pub fn new(
        graph: Arc<AudioGraph>,
        format: AudioSampleFormat,
        config: &ConcatenatorConfig,
        options: NodeOptions,
    ) -> Arc<Self> {
        Arc::new(Self {
            identity: options.identity("AudioConcatenator"),
            output: OutputPort::new(graph, format),
            state: Mutex::new(ConcatState {
                queue: VecDeque::new(),
                any_input_attached: false,
            }),
            read_forever: config.read_forever,
            playback_finished: AtomicBool::new(false),
            events: ChannelEvents::new(),
            disposed: AtomicBool::new(false),
        })
    }

    /// Queue `source` behind every input added so far.
    ///
    /// `token` is published to [`subscribe`](Self::subscribe) receivers once the source
    /// finishes; with `take_ownership` the source is disposed at that point too.
    pub async fn add_input(
        &self,
        source: SharedSource,
        token: Option<ChannelToken>,
        take_ownership: bool,
    ) -> AudioResult<()> {
        ensure_not_disposed(self)?;
        if self.playback_finished() {
            return Err(AudioError::PlaybackFinished(self.node_full_name().to_string()));
        }

        let endpoint = ConcatenatorInput::new(
            Arc::clone(self.output.graph()),
            *self.output.format(),
            self.node_name(),
        );
        connect(Arc::clone(&source), endpoint.clone() as SharedTarget).await?;

        let graph = Arc::clone(self.output.graph());
        let _guard = graph.lock().await;
        let mut state = self.state.lock().await;
        state.queue.push_back(ConcatSlot {
            endpoint,
            token,
            source,
            owns_source: take_ownership,
        });
        state.any_input_attached = true;
        if self.is_disposed() {
            drop(state);
            self.release_after_dispose();
            return Err(AudioError::Disposed(self.node_full_name().to_string()));
        }
        debug!(node = %self.node_full_name(), queued = state.queue.len(), "Concatenator input queued");
        Ok(())
    }

    /// Drop every queued input without firing completion events
    pub async fn disconnect_all_inputs(&self) {
        let graph = Arc::clone(self.output.graph());
        let _guard = graph.lock().await;
        let mut state = self.state.lock().await;
        for slot in state.queue.drain(..) {
            Self::release_slot(slot);
        }
    }

    pub async fn input_count(&self) -> usize {
        self.state.lock().await.queue.len()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChannelFinishedEvent> {
        self.events.subscribe()
    }

    /// Remove the head input; the caller holds the graph lock
    fn advance(&self, state: &mut ConcatState, finished: bool) {
        let Some(slot) = state.queue.pop_front() else {
            return;
        };
        if finished {
            if let Some(token) = slot.token.clone() {
                self.events.publish(self.node_full_name(), token);
            }
        }
        debug!(node = %self.node_full_name(), finished, "Concatenator advanced to next input");
        Self::release_slot(slot);
    }

    fn release_slot(slot: ConcatSlot) {
        if let Some(source) = slot.endpoint.input() {
            unlink_output_locked(source.as_ref());
        }
        if slot.owns_source {
            slot.source.dispose();
        }
        slot.endpoint.dispose();
    }

    /// Release the queue once disposed; a read in progress calls this after unlocking
    fn release_after_dispose(&self) {
        if !self.disposed.load(Ordering::SeqCst) {
            return;
        }
        if let Ok(mut state) = self.state.try_lock() {
            for slot in state.queue.drain(..) {
                Self::release_slot(slot);
            }
        }
    }

    async fn read_locked(
        &self,
        state: &mut ConcatState,
        buffer: &mut [f32],
        count: usize,
        channels: usize,
        cancel: &CancellationToken,
    ) -> AudioResult<ReadOutcome> {
        let mut written = 0;

        while written < count {
            let Some(head) = state.queue.front() else {
                return Ok(self.read_without_inputs(state, buffer, written, count, channels));
            };
            let Some(source) = head.endpoint.input() else {
                self.advance(state, false);
                continue;
            };

            let wanted = count - written;
            let target = &mut buffer[interleaved_len(written, channels)..];
            match source.read(target, wanted, cancel).await? {
                ReadOutcome::Finished => self.advance(state, true),
                ReadOutcome::Samples(read) => {
                    written += read;
                    if read < wanted {
                        break;
                    }
                }
            }
        }

        Ok(ReadOutcome::Samples(written))
    }

    fn read_without_inputs(
        &self,
        state: &ConcatState,
        buffer: &mut [f32],
        written: usize,
        count: usize,
        channels: usize,
    ) -> ReadOutcome {
        if written > 0 {
            return ReadOutcome::Samples(written);
        }
        if self.read_forever {
            buffer[..interleaved_len(count, channels)].fill(0.0);
            return ReadOutcome::Samples(count);
        }
        if state.any_input_attached {
            self.playback_finished.store(true, Ordering::Release);
            debug!(node = %self.node_full_name(), "Concatenator exhausted");
            return ReadOutcome::Finished;
        }
        ReadOutcome::Samples(0)
    }
}

impl AudioNode for AudioConcatenator {
    fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.release_after_dispose();
        debug!(node = %self.node_full_name(), "Concatenator disposed");
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AudioSampleSource for AudioConcatenator {
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
        cancel: &CancellationToken,
    ) -> AudioResult<ReadOutcome> {
        ensure_not_disposed(self)?;
        let channels = self.output.format().num_channels();
        ensure_buffer_len(buffer.len(), count, channels)?;
        if self.playback_finished() {
            return Ok(ReadOutcome::Finished);
        }

        let _scope = self.output.graph().begin_scope(self.node_full_name());
        let result = {
            let mut state = tokio::select! {
                guard = self.state.lock() => guard,
                _ = cancel.cancelled() => return Err(AudioError::Cancelled),
            };
            self.read_locked(&mut state, buffer, count, channels, cancel).await
        };
        self.release_after_dispose();
        result
    }
}

/// Target endpoint through which one queued source feeds the concatenator
struct ConcatenatorInput {
    identity: NodeIdentity,
    input: InputPort,
    disposed: AtomicBool,
}

impl ConcatenatorInput {
    fn new(
        graph: Arc<AudioGraph>,
        format: AudioSampleFormat,
        concatenator_name: &str,
    ) -> Arc<Self> {
        let name = format!("{concatenator_name}-input");
        Arc::new(Self {
            identity: NodeIdentity::new("ConcatenatorInput", Some(&name)),
            input: InputPort::new(graph, format),
            disposed: AtomicBool::new(false),
        })
    }
}

impl AudioNode for ConcatenatorInput {
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

/// Inputs are strictly pulled; pushing into one is a direction error
#[async_trait]
impl AudioSampleTarget for ConcatenatorInput {
    fn input_port(&self) -> &InputPort {
        &self.input
    }

    async fn write(&self, _buffer: &[f32], _count: usize, _cancel: &CancellationToken) -> AudioResult<()> {
        Err(AudioError::unsupported(self.node_full_name(), "write"))
    }

    async fn flush(&self, _cancel: &CancellationToken) -> AudioResult<()> {
        Err(AudioError::unsupported(self.node_full_name(), "flush"))
    }
}
