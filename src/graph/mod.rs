//! Core audio graph primitives
//!
//! Nodes exchange interleaved `f32` frames through pull (`read`) and push (`write`)
//! calls. Each node side lives in an [`AudioGraph`] whose lock serializes wiring changes
//! with data flow; components that bridge two graphs (see [`crate::components`]) run
//! their cross-graph transfers as single-flight background tasks.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │  graph A (producer pace)            │  graph B (consumer pace)        │
//! │                                     │                                 │
//! │  source ──► AsyncAudioReadBuffer ───┼──► mixer ──► bucket             │
//! │                 ▲ background refill │      ▲                          │
//! │                 └── single-flight   │      └── staging per input      │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Building blocks
//!
//! - [`AudioSampleFormat`]: rate, channel count and layout; must match per connection
//! - [`AudioSampleSource`] / [`AudioSampleTarget`]: pull and push contracts
//! - [`connect`] / [`disconnect_output`] / [`disconnect_input`]: symmetric wiring
//! - [`BufferPool`]: size-classed pooled buffers with lock-free free lists
//! - [`SingleFlightGate`]: at most one background unit per endpoint
//! - [`AudioMetrics`]: overflow and underflow counters

pub mod error;
pub mod events;
pub mod format;
pub mod gate;
#[allow(clippy::module_inception)]
pub mod graph;
pub mod metrics;
pub mod node;
pub mod pool;
pub(crate) mod segment;
pub mod swizzle;

pub use error::{AudioError, AudioResult};
pub use events::{ChannelEvents, ChannelFinishedEvent, ChannelToken};
pub use format::{AudioSampleFormat, ChannelLayout};
pub use gate::{GatePermit, SingleFlightGate};
pub use graph::{AudioGraph, GraphGuard, GraphStats, InstrumentedScope};
pub use metrics::{AudioMetrics, MetricKey, MetricsSnapshot};
pub use node::{
    AudioNode, AudioSampleSource, AudioSampleTarget, DelayingFilter, InputPort, NodeIdentity,
    NodeOptions, OutputPort, ReadOutcome, SharedSource, SharedTarget, connect, disconnect_input,
    disconnect_output, ensure_buffer_len,
};
pub use pool::{BufferPool, PoolStats, PooledBuffer};
pub use swizzle::ChannelSwizzle;
