//! Single-flight gate for background refill and drain units
//!
//! The gate starts free. Claiming is a test-and-clear; a failed claim means a unit is
//! already in flight and the caller does nothing. The returned [`GatePermit`] sets the
//! gate free again when dropped, so a unit that errors, panics or is cancelled still
//! releases it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use super::error::{AudioError, AudioResult};

#[derive(Debug)]
pub struct SingleFlightGate {
    free: AtomicBool,
    released: Notify,
}

impl SingleFlightGate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            free: AtomicBool::new(true),
            released: Notify::new(),
        })
    }

    /// Claim the gate if it is free
    pub fn try_claim(self: &Arc<Self>) -> Option<GatePermit> {
        if self.claim() {
            Some(GatePermit {
                gate: Arc::clone(self),
            })
        } else {
            None
        }
    }

    pub fn is_free(&self) -> bool {
        self.free.load(Ordering::Acquire)
    }

    /// Wait until no unit is in flight.
    ///
    /// Claims the gate once it becomes free and immediately releases it again.
    pub async fn wait_until_free(&self, cancel: &CancellationToken) -> AudioResult<()> {
        loop {
            let released = self.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            if self.claim() {
                self.release();
                return Ok(());
            }

            tokio::select! {
                _ = &mut released => {}
                _ = cancel.cancelled() => return Err(AudioError::Cancelled),
            }
        }
    }

    fn claim(&self) -> bool {
        self.free
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn release(&self) {
        self.free.store(true, Ordering::Release);
        self.released.notify_waiters();
    }
}

/// Proof of a successful claim; releases the gate on drop
#[derive(Debug)]
pub struct GatePermit {
    gate: Arc<SingleFlightGate>,
}

impl Drop for GatePermit {
    fn drop(&mut self) {
        self.gate.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, assert_ready_ok, task};

    #[test]
    fn test_claim_is_exclusive() {
        let gate = SingleFlightGate::new();
        let permit = gate.try_claim();
        assert!(permit.is_some());
        assert!(gate.try_claim().is_none());
        assert!(!gate.is_free());

        drop(permit);
        assert!(gate.is_free());
        assert!(gate.try_claim().is_some());
    }

    #[test]
    fn test_wait_blocks_until_release() {
        let gate = SingleFlightGate::new();
        let cancel = CancellationToken::new();
        let permit = gate.try_claim().unwrap();

        let mut wait = task::spawn(gate.wait_until_free(&cancel));
        assert_pending!(wait.poll());

        drop(permit);
        assert!(wait.is_woken());
        assert_ready_ok!(wait.poll());
        assert!(gate.is_free());
    }

    #[tokio::test]
    async fn test_wait_on_free_gate_returns_immediately() {
        let gate = SingleFlightGate::new();
        gate.wait_until_free(&CancellationToken::new()).await.unwrap();
        assert!(gate.is_free());
    }

    #[tokio::test]
    async fn test_wait_is_cancellable() {
        let gate = SingleFlightGate::new();
        let _permit = gate.try_claim().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = gate.wait_until_free(&cancel).await;
        assert_eq!(result, Err(AudioError::Cancelled));
    }
}
