//! FIFO of pooled sample segments used by the boundary buffers
//!
//! A segment is a rented buffer plus the number of valid frames it holds and a read
//! cursor. The queue keeps a running total equal to the unread frames across all
//! segments and drops a segment (returning its buffer to the pool) as soon as it has been
//! fully consumed.

use std::collections::VecDeque;

use super::pool::{self, PooledBuffer};
use crate::utils::audio_math::interleaved_len;

const INITIAL_SEGMENT_CAPACITY: usize = 16;

/// A pooled buffer holding `count` frames, of which the first `cursor` were consumed
#[derive(Debug)]
pub(crate) struct BufferSegment {
    buffer: PooledBuffer,
    count: usize,
    cursor: usize,
    num_channels: usize,
}

impl BufferSegment {
    /// Unread frames
    pub(crate) fn remaining(&self) -> usize {
        self.count - self.cursor
    }

    /// Interleaved unread values
    pub(crate) fn unread(&self) -> &[f32] {
        &self.buffer[interleaved_len(self.cursor, self.num_channels)
            ..interleaved_len(self.count, self.num_channels)]
    }
}

/// Ordered segments plus a running total of unread frames
#[derive(Debug)]
pub(crate) struct SegmentQueue {
    segments: VecDeque<BufferSegment>,
    queued: usize,
    num_channels: usize,
}

impl SegmentQueue {
    pub(crate) fn new(num_channels: usize) -> Self {
        Self {
            segments: VecDeque::with_capacity(INITIAL_SEGMENT_CAPACITY),
            queued: 0,
            num_channels,
        }
    }

    /// Unread frames across all segments
    pub(crate) fn len(&self) -> usize {
        self.queued
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.queued == 0
    }

    /// Take ownership of `buffer`, whose first `count` frames are valid
    pub(crate) fn push(&mut self, buffer: PooledBuffer, count: usize) {
        if count == 0 {
            return;
        }
        debug_assert!(buffer.len() >= interleaved_len(count, self.num_channels));
        self.segments.push_back(BufferSegment {
            buffer,
            count,
            cursor: 0,
            num_channels: self.num_channels,
        });
        self.queued += count;
        debug_assert!(self.invariant_holds());
    }

    /// Copy `count` frames from `samples` into a freshly rented segment
    pub(crate) fn push_copy(&mut self, samples: &[f32], count: usize) {
        if count == 0 {
            return;
        }
        let len = interleaved_len(count, self.num_channels);
        let mut buffer = pool::rent(len);
        buffer.copy_from_slice(&samples[..len]);
        self.push(buffer, count);
    }

    /// Move up to `count` frames from the head of the queue into `target`
    pub(crate) fn drain_into(&mut self, target: &mut [f32], count: usize) -> usize {
        let mut written = 0;
        while written < count {
            let Some(head) = self.segments.front_mut() else {
                break;
            };

            let take = (count - written).min(head.remaining());
            let src = interleaved_len(head.cursor, self.num_channels);
            let dst = interleaved_len(written, self.num_channels);
            let len = interleaved_len(take, self.num_channels);
            target[dst..dst + len].copy_from_slice(&head.buffer[src..src + len]);

            head.cursor += take;
            written += take;
            self.queued -= take;
            if head.cursor == head.count {
                self.segments.pop_front();
            }
        }

        debug_assert!(self.invariant_holds());
        written
    }

    /// Drop up to `count` of the oldest frames, returning how many were dropped
    pub(crate) fn discard_oldest(&mut self, count: usize) -> usize {
        let mut dropped = 0;
        while dropped < count {
            let Some(head) = self.segments.front_mut() else {
                break;
            };

            let take = (count - dropped).min(head.remaining());
            head.cursor += take;
            dropped += take;
            self.queued -= take;
            if head.cursor == head.count {
                self.segments.pop_front();
            }
        }

        debug_assert!(self.invariant_holds());
        dropped
    }

    /// Remove the head segment as a whole
    pub(crate) fn pop_segment(&mut self) -> Option<BufferSegment> {
        let segment = self.segments.pop_front()?;
        self.queued -= segment.remaining();
        debug_assert!(self.invariant_holds());
        Some(segment)
    }

    pub(crate) fn clear(&mut self) {
        self.segments.clear();
        self.queued = 0;
    }

    /// Running total equals the unread frames of all segments, and no segment is spent
    pub(crate) fn invariant_holds(&self) -> bool {
        let unread: usize = self.segments.iter().map(BufferSegment::remaining).sum();
        unread == self.queued
            && self
                .segments
                .iter()
                .all(|segment| segment.cursor < segment.count)
    }
}
