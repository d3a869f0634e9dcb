//! Overflow and underflow accounting for streaming components
//!
//! Data loss and starvation are never errors; they are counted here, per buffer kind and
//! direction, with a per-node breakdown for diagnostics.

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

static GLOBAL_METRICS: Lazy<Arc<AudioMetrics>> = Lazy::new(|| Arc::new(AudioMetrics::new()));

/// Counter identity: buffer kind plus direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKey {
    /// Frames requested from an empty async read buffer
    AsyncReadBufferUnderflowSamples,
    /// Frames dropped by a full async write buffer
    AsyncWriteBufferOverflowSamples,
    /// Oldest frames pruned from a push-pull buffer beyond its maximum
    PushPullBufferOverflowSamples,
    /// Frames requested from an empty push-pull buffer
    PushPullBufferUnderflowSamples,
    /// Frames dropped because a mixer input's staging buffer was full
    MixerOverflowSamples,
    /// Background refill or drain units that failed
    BackgroundTaskFailures,
}

impl MetricKey {
    pub const ALL: [MetricKey; 6] = [
        MetricKey::AsyncReadBufferUnderflowSamples,
        MetricKey::AsyncWriteBufferOverflowSamples,
        MetricKey::PushPullBufferOverflowSamples,
        MetricKey::PushPullBufferUnderflowSamples,
        MetricKey::MixerOverflowSamples,
        MetricKey::BackgroundTaskFailures,
    ];

    fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AsyncReadBufferUnderflowSamples => "async_read_buffer_underflow_samples",
            Self::AsyncWriteBufferOverflowSamples => "async_write_buffer_overflow_samples",
            Self::PushPullBufferOverflowSamples => "push_pull_buffer_overflow_samples",
            Self::PushPullBufferUnderflowSamples => "push_pull_buffer_underflow_samples",
            Self::MixerOverflowSamples => "mixer_overflow_samples",
            Self::BackgroundTaskFailures => "background_task_failures",
        }
    }
}

impl fmt::Display for MetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Counter sink shared by the components of one or more graphs
#[derive(Debug)]
pub struct AudioMetrics {
    counters: [AtomicU64; MetricKey::ALL.len()],
    per_node: RwLock<HashMap<String, HashMap<MetricKey, u64>>>,
}

impl AudioMetrics {
    pub fn new() -> Self {
        Self {
            counters: Default::default(),
            per_node: RwLock::new(HashMap::new()),
        }
    }

    /// Process-wide default sink
    pub fn global() -> Arc<AudioMetrics> {
        Arc::clone(&GLOBAL_METRICS)
    }

    /// Add `value` to `key`, attributed to `node`
    pub fn report(&self, key: MetricKey, node: &str, value: u64) {
        if value == 0 {
            return;
        }
        self.counters[key.index()].fetch_add(value, Ordering::Relaxed);
        *self
            .per_node
            .write()
            .entry(node.to_string())
            .or_default()
            .entry(key)
            .or_insert(0) += value;
    }

    pub fn counter(&self, key: MetricKey) -> u64 {
        self.counters[key.index()].load(Ordering::Relaxed)
    }

    pub fn node_counter(&self, node: &str, key: MetricKey) -> u64 {
        self.per_node
            .read()
            .get(node)
            .and_then(|counters| counters.get(&key))
            .copied()
            .unwrap_or(0)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let totals = MetricKey::ALL
            .iter()
            .map(|key| (key.as_str().to_string(), self.counter(*key)))
            .collect();

        let nodes = self
            .per_node
            .read()
            .iter()
            .map(|(node, counters)| {
                let counters = counters
                    .iter()
                    .map(|(key, value)| (key.as_str().to_string(), *value))
                    .collect();
                (node.clone(), counters)
            })
            .collect();

        MetricsSnapshot { totals, nodes }
    }

    pub fn reset(&self) {
        for counter in &self.counters {
            counter.store(0, Ordering::Relaxed);
        }
        self.per_node.write().clear();
    }
}

impl Default for AudioMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Serializable point-in-time view of [`AudioMetrics`]
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub totals: HashMap<String, u64>,
    pub nodes: HashMap<String, HashMap<String, u64>>,
}
