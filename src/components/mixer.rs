//! Fan-in mixing
//!
//! Every input gets its own endpoint and a staging buffer that reconciles uneven batch
//! sizes across inputs. Output is only produced for frames that every live input has
//! contributed; inputs that disconnect, or drain after their source finished, are pruned
//! (firing their completion token and disposing them if the mixer owns them).
//!
//! Pull mode: [`LinearMixer::read`] tops up all staging buffers in parallel, then mixes.
//! Push mode: a write into any input endpoint stages the data and pulls the other
//! inputs up to the same fill level before pushing the mix downstream.

use async_trait::async_trait;
use futures::future::join_all;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex, broadcast};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::MixerConfig;
use crate::graph::node::{ensure_not_disposed, unlink_output_locked};
use crate::graph::pool::{self, PooledBuffer};
use crate::graph::{
    AudioError, AudioGraph, AudioMetrics, AudioNode, AudioResult, AudioSampleFormat,
    AudioSampleSource, AudioSampleTarget, ChannelEvents, ChannelFinishedEvent, ChannelSwizzle,
    ChannelToken, InputPort, MetricKey, NodeIdentity, NodeOptions, OutputPort, ReadOutcome,
    SharedSource, SharedTarget, connect, ensure_buffer_len,
};
use crate::utils::audio_math::{interleaved_len, mix_add, samples_per_channel_for_duration};

/// Per-input staging state, owned by the mixer
struct MixerSlot {
    endpoint: Arc<MixerInputEndpoint>,
    staging: PooledBuffer,
    capacity: usize,
    queued: usize,
    finished: bool,
    token: Option<ChannelToken>,
    /// Kept alive for as long as the slot exists; disposed on release only when owned
    source: SharedSource,
    owns_source: bool,
    remap: Option<ChannelSwizzle>,
}

impl MixerSlot {
    fn should_prune(&mut self) -> bool {
        match self.endpoint.input() {
            None => true,
            Some(source) => {
                if source.playback_finished() {
                    self.finished = true;
                }
                self.queued == 0 && self.finished
            }
        }
    }

    /// Pull from the source until `target_fill` frames are staged or it has nothing more
    async fn top_up(&mut self, target_fill: usize, channels: usize, cancel: &CancellationToken) -> AudioResult<()> {
        let want = target_fill.min(self.capacity).saturating_sub(self.queued);
        if want == 0 || self.finished {
            return Ok(());
        }
        let Some(source) = self.endpoint.input() else {
            return Ok(());
        };

        let start = interleaved_len(self.queued, channels);
        let outcome = match &self.remap {
            None => {
                let end = start + interleaved_len(want, channels);
                source.read(&mut self.staging[start..end], want, cancel).await?
            }
            Some(remap) => {
                let mut scratch = pool::rent(interleaved_len(want, remap.source_channels()));
                let outcome = source.read(&mut scratch, want, cancel).await?;
                if let ReadOutcome::Samples(read) = outcome {
                    remap.apply(&scratch, &mut self.staging[start..], read);
                }
                outcome
            }
        };

        match outcome {
            ReadOutcome::Samples(read) => self.queued += read,
            ReadOutcome::Finished => self.finished = true,
        }
        Ok(())
    }

    /// Stage pushed frames; returns how many fit
    fn stage(&mut self, buffer: &[f32], count: usize, channels: usize) -> usize {
        let take = count.min(self.capacity - self.queued);
        if take == 0 {
            return 0;
        }
        let start = interleaved_len(self.queued, channels);
        match &self.remap {
            None => {
                let len = interleaved_len(take, channels);
                self.staging[start..start + len].copy_from_slice(&buffer[..len]);
            }
            Some(remap) => remap.apply(buffer, &mut self.staging[start..], take),
        }
        self.queued += take;
        take
    }

    /// Copy (first input) or add (later inputs) `frames` staged frames into `target`,
    /// then move the leftovers to the front
    fn mix_into(&mut self, target: &mut [f32], frames: usize, channels: usize, first: bool) {
        let len = interleaved_len(frames, channels);
        if first {
            target[..len].copy_from_slice(&self.staging[..len]);
        } else {
            mix_add(&mut target[..len], &self.staging[..len]);
        }
        let queued_len = interleaved_len(self.queued, channels);
        self.staging.copy_within(len..queued_len, 0);
        self.queued -= frames;
    }

    fn input_channels(&self, output_channels: usize) -> usize {
        self.remap
            .as_ref()
            .map_or(output_channels, ChannelSwizzle::source_channels)
    }
}

struct MixerState {
    slots: Vec<MixerSlot>,
    any_input_attached: bool,
}

/// Mixing engine shared by [`LinearMixer`] and
/// [`ChannelFaninMixer`](crate::components::ChannelFaninMixer)
pub(crate) struct MixerCore {
    identity: NodeIdentity,
    output: OutputPort,
    state: Mutex<MixerState>,
    read_forever: bool,
    input_capacity: usize,
    playback_finished: AtomicBool,
    events: ChannelEvents,
    metrics: Arc<AudioMetrics>,
    disposed: AtomicBool,
}

impl MixerCore {
    pub(crate) fn new(
        type_name: &str,
        graph: Arc<AudioGraph>,
        format: AudioSampleFormat,
        config: &MixerConfig,
        options: &NodeOptions,
    ) -> AudioResult<Arc<Self>> {
        config.validate()?;
        let input_capacity =
            samples_per_channel_for_duration(format.sample_rate_hz(), config.input_buffer_length());
        if input_capacity == 0 {
            return Err(AudioError::buffer_length(
                "input_buffer_length",
                "must hold at least one frame",
            ));
        }

        Ok(Arc::new(Self {
            identity: options.identity(type_name),
            output: OutputPort::new(graph, format),
            state: Mutex::new(MixerState {
                slots: Vec::new(),
                any_input_attached: false,
            }),
            read_forever: config.read_forever,
            input_capacity,
            playback_finished: AtomicBool::new(false),
            events: ChannelEvents::new(),
            metrics: options.metrics(),
            disposed: AtomicBool::new(false),
        }))
    }

    pub(crate) fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    pub(crate) fn output_port(&self) -> &OutputPort {
        &self.output
    }

    pub(crate) fn playback_finished(&self) -> bool {
        self.playback_finished.load(Ordering::Acquire)
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<ChannelFinishedEvent> {
        self.events.subscribe()
    }

    pub(crate) async fn input_count(&self) -> usize {
        self.state.lock().await.slots.len()
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Attach `source` through a new input endpoint whose format is `input_format`
    pub(crate) async fn add_input(
        self: &Arc<Self>,
        source: SharedSource,
        input_format: AudioSampleFormat,
        token: Option<ChannelToken>,
        take_ownership: bool,
        remap: Option<ChannelSwizzle>,
    ) -> AudioResult<()> {
        if self.is_disposed() {
            return Err(AudioError::Disposed(self.identity.full_name().to_string()));
        }
        if self.playback_finished() {
            return Err(AudioError::PlaybackFinished(self.identity.full_name().to_string()));
        }

        let endpoint = MixerInputEndpoint::new(
            Arc::clone(self.output.graph()),
            input_format,
            Arc::downgrade(self),
            self.identity.name(),
        );
        connect(Arc::clone(&source), endpoint.clone() as SharedTarget).await?;

        let graph = Arc::clone(self.output.graph());
        let _guard = graph.lock().await;
        let mut state = self.state.lock().await;
        let channels = self.output.format().num_channels();
        state.slots.push(MixerSlot {
            endpoint,
            staging: pool::rent(interleaved_len(self.input_capacity, channels)),
            capacity: self.input_capacity,
            queued: 0,
            finished: false,
            token,
            source,
            owns_source: take_ownership,
            remap,
        });
        state.any_input_attached = true;
        if self.is_disposed() {
            drop(state);
            self.release_after_dispose();
            return Err(AudioError::Disposed(self.identity.full_name().to_string()));
        }
        debug!(node = %self.identity.full_name(), inputs = state.slots.len(), "Mixer input added");
        Ok(())
    }

    /// Detach every input without firing completion events
    pub(crate) async fn disconnect_all_inputs(&self) {
        let graph = Arc::clone(self.output.graph());
        let _guard = graph.lock().await;
        let mut state = self.state.lock().await;
        for slot in state.slots.drain(..) {
            Self::release_slot(slot);
        }
    }

    pub(crate) async fn read(
        &self,
        buffer: &mut [f32],
        count: usize,
        cancel: &CancellationToken,
    ) -> AudioResult<ReadOutcome> {
        if self.is_disposed() {
            return Err(AudioError::Disposed(self.identity.full_name().to_string()));
        }
        let channels = self.output.format().num_channels();
        ensure_buffer_len(buffer.len(), count, channels)?;
        if self.playback_finished() {
            return Ok(ReadOutcome::Finished);
        }

        let _scope = self.output.graph().begin_scope(self.identity.full_name());
        let result = {
            let mut state = self.lock_state(cancel).await?;
            self.read_locked(&mut state, buffer, count, channels, cancel).await
        };
        self.release_after_dispose();
        result
    }

    async fn read_locked(
        &self,
        state: &mut MixerState,
        buffer: &mut [f32],
        count: usize,
        channels: usize,
        cancel: &CancellationToken,
    ) -> AudioResult<ReadOutcome> {
        let mut written = 0;

        while written < count {
            if state.slots.is_empty() {
                return Ok(self.read_without_inputs(state, buffer, written, count, channels));
            }

            let remaining = count - written;
            if state.slots.len() == 1 {
                state.slots[0].top_up(remaining, channels, cancel).await?;
            } else {
                let pending = state
                    .slots
                    .iter_mut()
                    .map(|slot| slot.top_up(remaining, channels, cancel));
                for result in join_all(pending).await {
                    result?;
                }
            }

            self.prune(state);
            if state.slots.is_empty() {
                continue;
            }

            let frames = remaining.min(Self::min_queued(&state.slots));
            if frames == 0 {
                break;
            }
            let target = &mut buffer[interleaved_len(written, channels)..];
            for (index, slot) in state.slots.iter_mut().enumerate() {
                slot.mix_into(target, frames, channels, index == 0);
            }
            written += frames;
        }

        Ok(ReadOutcome::Samples(written))
    }

    /// Push-mode step triggered by a write into the input `origin`
    pub(crate) async fn drive(
        &self,
        origin: Uuid,
        buffer: &[f32],
        count: usize,
        cancel: &CancellationToken,
    ) -> AudioResult<()> {
        let result = {
            let mut state = self.lock_state(cancel).await?;
            self.drive_locked(&mut state, origin, buffer, count, cancel).await
        };
        self.release_after_dispose();
        result
    }

    async fn drive_locked(
        &self,
        state: &mut MixerState,
        origin: Uuid,
        buffer: &[f32],
        count: usize,
        cancel: &CancellationToken,
    ) -> AudioResult<()> {
        let channels = self.output.format().num_channels();
        if Self::slot_index(&state.slots, origin).is_none() {
            return Ok(());
        }

        let mut mix = pool::rent(interleaved_len(self.input_capacity, channels));
        let mut consumed = 0;
        let mut first_pass = true;

        while consumed < count || first_pass {
            first_pass = false;
            let Some(index) = Self::slot_index(&state.slots, origin) else {
                break;
            };

            if consumed < count {
                let slot = &mut state.slots[index];
                let input_channels = slot.input_channels(channels);
                if slot.queued == slot.capacity {
                    let dropped = count - consumed;
                    warn!(node = %self.identity.full_name(), samples = dropped, "Mixer input overflow");
                    self.metrics.report(
                        MetricKey::MixerOverflowSamples,
                        self.identity.full_name(),
                        dropped as u64,
                    );
                    break;
                }
                consumed += slot.stage(
                    &buffer[interleaved_len(consumed, input_channels)..],
                    count - consumed,
                    channels,
                );
            }

            let target_fill = state.slots[index].queued;
            let others = state
                .slots
                .iter_mut()
                .enumerate()
                .filter(|(i, _)| *i != index)
                .map(|(_, slot)| slot.top_up(target_fill, channels, cancel));
            for result in join_all(others).await {
                result?;
            }

            self.prune(state);
            if state.slots.is_empty() {
                break;
            }

            let frames = Self::min_queued(&state.slots);
            if frames == 0 {
                continue;
            }
            for (i, slot) in state.slots.iter_mut().enumerate() {
                slot.mix_into(&mut mix, frames, channels, i == 0);
            }
            if let Some(target) = self.output.target() {
                target
                    .write(&mix[..interleaved_len(frames, channels)], frames, cancel)
                    .await?;
            }
        }
        Ok(())
    }

    /// Drive a zero-length step for `origin`, then flush downstream
    pub(crate) async fn flush_from(&self, origin: Uuid, cancel: &CancellationToken) -> AudioResult<()> {
        self.drive(origin, &[], 0, cancel).await?;
        if let Some(target) = self.output.target() {
            target.flush(cancel).await?;
        }
        Ok(())
    }

    pub(crate) fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.release_after_dispose();
        debug!(node = %self.identity.full_name(), "Mixer disposed");
    }

    /// Release every slot once disposed. A read or drive holding the state calls this
    /// after unlocking, so disposal during a call is completed by that call.
    fn release_after_dispose(&self) {
        if !self.disposed.load(Ordering::SeqCst) {
            return;
        }
        if let Ok(mut state) = self.state.try_lock() {
            for slot in state.slots.drain(..) {
                Self::release_slot(slot);
            }
        }
    }

    async fn lock_state(&self, cancel: &CancellationToken) -> AudioResult<tokio::sync::MutexGuard<'_, MixerState>> {
        tokio::select! {
            guard = self.state.lock() => Ok(guard),
            _ = cancel.cancelled() => Err(AudioError::Cancelled),
        }
    }

    fn read_without_inputs(
        &self,
        state: &MixerState,
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
            debug!(node = %self.identity.full_name(), "All mixer inputs finished");
            return ReadOutcome::Finished;
        }
        ReadOutcome::Samples(0)
    }

    /// Remove disconnected and exhausted inputs. The caller holds the graph lock.
    fn prune(&self, state: &mut MixerState) {
        let mut index = 0;
        while index < state.slots.len() {
            if !state.slots[index].should_prune() {
                index += 1;
                continue;
            }

            let slot = state.slots.remove(index);
            if slot.finished {
                if let Some(token) = slot.token.clone() {
                    self.events.publish(self.identity.full_name(), token);
                }
            }
            debug!(
                node = %self.identity.full_name(),
                finished = slot.finished,
                "Mixer input pruned"
            );
            Self::release_slot(slot);
        }
    }

    fn release_slot(slot: MixerSlot) {
        if let Some(source) = slot.endpoint.input() {
            unlink_output_locked(source.as_ref());
        }
        if slot.owns_source {
            slot.source.dispose();
        }
        slot.endpoint.dispose();
    }

    fn min_queued(slots: &[MixerSlot]) -> usize {
        slots.iter().map(|slot| slot.queued).min().unwrap_or(0)
    }

    fn slot_index(slots: &[MixerSlot], origin: Uuid) -> Option<usize> {
        slots.iter().position(|slot| slot.endpoint.node_id() == origin)
    }
}

/// Target endpoint through which one upstream source feeds a mixer
pub(crate) struct MixerInputEndpoint {
    identity: NodeIdentity,
    input: InputPort,
    mixer: Weak<MixerCore>,
    disposed: AtomicBool,
}

impl MixerInputEndpoint {
    fn new(
        graph: Arc<AudioGraph>,
        format: AudioSampleFormat,
        mixer: Weak<MixerCore>,
        mixer_name: &str,
    ) -> Arc<Self> {
        let name = format!("{mixer_name}-input");
        Arc::new(Self {
            identity: NodeIdentity::new("MixerInput", Some(&name)),
            input: InputPort::new(graph, format),
            mixer,
            disposed: AtomicBool::new(false),
        })
    }
}

impl AudioNode for MixerInputEndpoint {
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
impl AudioSampleTarget for MixerInputEndpoint {
    fn input_port(&self) -> &InputPort {
        &self.input
    }

    async fn write(&self, buffer: &[f32], count: usize, cancel: &CancellationToken) -> AudioResult<()> {
        ensure_not_disposed(self)?;
        ensure_buffer_len(buffer.len(), count, self.input.format().num_channels())?;
        match self.mixer.upgrade() {
            Some(mixer) => mixer.drive(self.node_id(), buffer, count, cancel).await,
            None => Ok(()),
        }
    }

    async fn flush(&self, cancel: &CancellationToken) -> AudioResult<()> {
        match self.mixer.upgrade() {
            Some(mixer) => mixer.flush_from(self.node_id(), cancel).await,
            None => Ok(()),
        }
    }
}

/// Sums any number of same-format inputs into one output
pub struct LinearMixer {
    core: Arc<MixerCore>,
}

impl LinearMixer {
    pub fn new(
        graph: Arc<AudioGraph>,
        format: AudioSampleFormat,
        config: &MixerConfig,
        options: NodeOptions,
    ) -> AudioResult<Arc<Self>> {
        let core = MixerCore::new("LinearMixer", graph, format, config, &options)?;
        Ok(Arc::new(Self { core }))
    }

    /// Mix `source` in. Its format must equal the mixer's.
    ///
    /// With `take_ownership` the mixer disposes the source once it is pruned. `token` is
    /// published to [`subscribe`](Self::subscribe) receivers when the source finishes.
    pub async fn add_input(
        &self,
        source: SharedSource,
        token: Option<ChannelToken>,
        take_ownership: bool,
    ) -> AudioResult<()> {
        let format = *self.core.output_port().format();
        self.core
            .add_input(source, format, token, take_ownership, None)
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

impl AudioNode for LinearMixer {
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
impl AudioSampleSource for LinearMixer {
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
