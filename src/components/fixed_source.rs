//! Finite in-memory source
//!
//! Plays a fixed block of interleaved frames once, either pulled by a downstream node or
//! pushed with [`FixedAudioSampleSource::write_to_output`].

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio_util::sync::CancellationToken;

use crate::graph::node::ensure_not_disposed;
use crate::graph::{
    AudioError, AudioGraph, AudioNode, AudioResult, AudioSampleFormat, AudioSampleSource,
    NodeIdentity, NodeOptions, OutputPort, ReadOutcome, ensure_buffer_len,
};
use crate::utils::audio_math::interleaved_len;

pub struct FixedAudioSampleSource {
    identity: NodeIdentity,
    output: OutputPort,
    samples: Arc<[f32]>,
    frames: usize,
    cursor: Mutex<usize>,
    disposed: AtomicBool,
}

impl FixedAudioSampleSource {
    pub fn new(
        graph: Arc<AudioGraph>,
        format: AudioSampleFormat,
        samples: Vec<f32>,
        options: NodeOptions,
    ) -> AudioResult<Arc<Self>> {
        if samples.len() % format.num_channels() != 0 {
            return Err(AudioError::InvalidFormat(format!(
                "{} values do not divide into {} channels",
                samples.len(),
                format.num_channels()
            )));
        }

        Ok(Arc::new(Self {
            identity: options.identity("FixedAudioSampleSource"),
            output: OutputPort::new(graph, format),
            frames: samples.len() / format.num_channels(),
            samples: samples.into(),
            cursor: Mutex::new(0),
            disposed: AtomicBool::new(false),
        }))
    }

    /// Total frames this source plays
    pub fn frames(&self) -> usize {
        self.frames
    }

    pub fn remaining(&self) -> usize {
        self.frames - *self.cursor.lock()
    }

    /// Push up to `count` frames to the connected target, returning how many were sent.
    ///
    /// Takes the output graph's lock for the duration of the write. Nothing is consumed
    /// while no target is connected.
    pub async fn write_to_output(&self, count: usize, cancel: &CancellationToken) -> AudioResult<usize> {
        ensure_not_disposed(self)?;
        let graph = Arc::clone(self.output.graph());
        let _guard = graph.lock_cancellable(cancel).await?;
        let Some(target) = self.output.target() else {
            return Ok(0);
        };

        let Some((start, take)) = self.advance(count) else {
            return Ok(0);
        };
        let channels = self.output.format().num_channels();
        let range = interleaved_len(start, channels)..interleaved_len(start + take, channels);
        target.write(&self.samples[range], take, cancel).await?;
        Ok(take)
    }

    /// Push everything that is left in chunks of `chunk` frames, then flush the target
    pub async fn write_all_to_output(&self, chunk: usize, cancel: &CancellationToken) -> AudioResult<usize> {
        let mut total = 0;
        while self.remaining() > 0 {
            let sent = self.write_to_output(chunk.max(1), cancel).await?;
            if sent == 0 {
                break;
            }
            total += sent;
        }

        if let Some(target) = self.output.target() {
            let graph = Arc::clone(self.output.graph());
            let _guard = graph.lock_cancellable(cancel).await?;
            target.flush(cancel).await?;
        }
        Ok(total)
    }

    fn advance(&self, count: usize) -> Option<(usize, usize)> {
        let mut cursor = self.cursor.lock();
        let take = count.min(self.frames - *cursor);
        if take == 0 {
            return None;
        }
        let start = *cursor;
        *cursor += take;
        Some((start, take))
    }
}

impl AudioNode for FixedAudioSampleSource {
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
impl AudioSampleSource for FixedAudioSampleSource {
    fn output_port(&self) -> &OutputPort {
        &self.output
    }

    fn playback_finished(&self) -> bool {
        self.remaining() == 0
    }

    async fn read(
        &self,
        buffer: &mut [f32],
        count: usize,
        _cancel: &CancellationToken,
    ) -> AudioResult<ReadOutcome> {
        ensure_not_disposed(self)?;
        let channels = self.output.format().num_channels();
        ensure_buffer_len(buffer.len(), count, channels)?;

        if self.playback_finished() {
            return Ok(ReadOutcome::Finished);
        }
        let Some((start, take)) = self.advance(count) else {
            return Ok(ReadOutcome::Samples(0));
        };

        let len = interleaved_len(take, channels);
        let offset = interleaved_len(start, channels);
        buffer[..len].copy_from_slice(&self.samples[offset..offset + len]);
        Ok(ReadOutcome::Samples(take))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_until_finished() {
        let graph = AudioGraph::new("test");
        let format = AudioSampleFormat::stereo(16000).unwrap();
        let source = FixedAudioSampleSource::new(
            graph,
            format,
            vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0],
            NodeOptions::default(),
        )
        .unwrap();
        let cancel = CancellationToken::new();
        let mut buffer = [0.0; 4];

        assert_eq!(source.frames(), 3);
        assert_eq!(
            source.read(&mut buffer, 2, &cancel).await.unwrap(),
            ReadOutcome::Samples(2)
        );
        assert_eq!(buffer, [1.0, 2.0, 3.0, 4.0]);
        assert_eq!(
            source.read(&mut buffer, 2, &cancel).await.unwrap(),
            ReadOutcome::Samples(1)
        );
        assert_eq!(&buffer[..2], &[5.0, 6.0]);
        assert!(source.playback_finished());
        assert_eq!(
            source.read(&mut buffer, 2, &cancel).await.unwrap(),
            ReadOutcome::Finished
        );
    }

    #[test]
    fn test_rejects_partial_frames() {
        let graph = AudioGraph::new("test");
        let format = AudioSampleFormat::stereo(16000).unwrap();
        let result = FixedAudioSampleSource::new(graph, format, vec![0.0; 3], NodeOptions::default());
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_disposed_source_rejects_reads() {
        let graph = AudioGraph::new("test");
        let format = AudioSampleFormat::mono(16000).unwrap();
        let source =
            FixedAudioSampleSource::new(graph, format, vec![0.0; 8], NodeOptions::default()).unwrap();
        source.dispose();
        source.dispose();

        let mut buffer = [0.0; 8];
        let result = source.read(&mut buffer, 8, &CancellationToken::new()).await;
        assert!(matches!(result, Err(AudioError::Disposed(_))));
    }
}
