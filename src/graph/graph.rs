//! Audio graph handle: topology lock plus instrumentation
//!
//! Every node belongs to one graph per side. The graph lock serializes connect and
//! disconnect with data flow: whoever drives a read or write through the graph holds it
//! for the duration of the call, and topology changes wait for it.

use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::trace;
use uuid::Uuid;

use super::error::{AudioError, AudioResult};

/// Held graph lock; released on drop
pub type GraphGuard<'a> = MutexGuard<'a, ()>;

/// Timing totals of instrumented scopes
#[derive(Debug, Clone, Default, Serialize)]
pub struct GraphStats {
    pub scopes: u64,
    pub total_scope_time_us: u64,
    pub max_scope_time_us: u64,
}

#[derive(Debug)]
pub struct AudioGraph {
    id: Uuid,
    name: String,
    lock: Mutex<()>,
    scopes: AtomicU64,
    total_scope_time_us: AtomicU64,
    max_scope_time_us: AtomicU64,
}

impl AudioGraph {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            name: name.into(),
            lock: Mutex::new(()),
            scopes: AtomicU64::new(0),
            total_scope_time_us: AtomicU64::new(0),
            max_scope_time_us: AtomicU64::new(0),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Acquire the graph lock, suspending while it is held elsewhere
    pub async fn lock(&self) -> GraphGuard<'_> {
        self.lock.lock().await
    }

    /// Acquire the graph lock unless `cancel` fires first
    pub async fn lock_cancellable(&self, cancel: &CancellationToken) -> AudioResult<GraphGuard<'_>> {
        tokio::select! {
            guard = self.lock.lock() => Ok(guard),
            _ = cancel.cancelled() => Err(AudioError::Cancelled),
        }
    }

    /// Acquire the graph lock from synchronous code.
    ///
    /// Must not be called from within an async execution context.
    pub fn blocking_lock(&self) -> GraphGuard<'_> {
        self.lock.blocking_lock()
    }

    pub fn try_lock(&self) -> Option<GraphGuard<'_>> {
        self.lock.try_lock().ok()
    }

    /// Start timing work done by `component`; the scope ends when the guard drops
    pub fn begin_scope<'a>(&'a self, component: &'a str) -> InstrumentedScope<'a> {
        InstrumentedScope {
            graph: self,
            component,
            started: Instant::now(),
        }
    }

    pub fn stats(&self) -> GraphStats {
        GraphStats {
            scopes: self.scopes.load(Ordering::Relaxed),
            total_scope_time_us: self.total_scope_time_us.load(Ordering::Relaxed),
            max_scope_time_us: self.max_scope_time_us.load(Ordering::Relaxed),
        }
    }

    fn end_scope(&self, component: &str, elapsed_us: u64) {
        self.scopes.fetch_add(1, Ordering::Relaxed);
        self.total_scope_time_us
            .fetch_add(elapsed_us, Ordering::Relaxed);
        self.max_scope_time_us
            .fetch_max(elapsed_us, Ordering::Relaxed);
        trace!(graph = %self.name, component, elapsed_us, "Audio component scope ended");
    }
}

/// Running instrumentation scope
pub struct InstrumentedScope<'a> {
    graph: &'a AudioGraph,
    component: &'a str,
    started: Instant,
}

impl Drop for InstrumentedScope<'_> {
    fn drop(&mut self) {
        let elapsed_us = self.started.elapsed().as_micros() as u64;
        self.graph.end_scope(self.component, elapsed_us);
    }
}
