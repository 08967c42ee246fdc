//! Counting gate capping concurrent remote operations. Waiters are served FIFO.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::error::{GatewayError, Result};

#[derive(Debug, Default)]
struct GateState {
    active: usize,
    waiters: VecDeque<oneshot::Sender<()>>,
}

/// Point-in-time gate counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GateStatus {
    pub limit: usize,
    pub active: usize,
    pub queued: usize,
}

#[derive(Debug)]
pub struct ConcurrencyGate {
    limit: usize,
    state: Mutex<GateState>,
}

/// Held slot. Dropping it hands the slot to the oldest waiter or frees it.
#[derive(Debug)]
pub struct Permit {
    gate: Arc<ConcurrencyGate>,
}

impl Drop for Permit {
    fn drop(&mut self) {
        self.gate.release();
    }
}

/// Pending acquisition. If cancelled after a slot was handed over, the slot is passed on.
struct Waiting {
    rx: Option<oneshot::Receiver<()>>,
    gate: Arc<ConcurrencyGate>,
}

impl Drop for Waiting {
    fn drop(&mut self) {
        if let Some(mut rx) = self.rx.take() {
            rx.close();
            if rx.try_recv().is_ok() {
                self.gate.release();
            }
        }
    }
}

impl ConcurrencyGate {
    pub fn new(limit: usize) -> Arc<Self> {
        Arc::new(Self {
            limit: limit.max(1),
            state: Mutex::new(GateState::default()),
        })
    }

    /// Wait for a slot. Fails only if the queue is drained by [`ConcurrencyGate::drain`].
    pub async fn acquire(self: &Arc<Self>) -> Result<Permit> {
        let rx = {
            let mut state = self.state.lock();
            if state.active < self.limit && state.waiters.is_empty() {
                state.active += 1;
                return Ok(Permit { gate: self.clone() });
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(tx);
            tracing::debug!(queued = state.waiters.len(), "waiting for connection slot");
            rx
        };

        let mut waiting = Waiting {
            rx: Some(rx),
            gate: self.clone(),
        };
        let received = match waiting.rx.as_mut() {
            Some(rx) => rx.await,
            None => return Err(GatewayError::ShutDown),
        };
        waiting.rx = None;
        match received {
            Ok(()) => Ok(Permit { gate: self.clone() }),
            Err(_) => Err(GatewayError::ShutDown),
        }
    }

    fn release(&self) {
        let mut state = self.state.lock();
        while let Some(tx) = state.waiters.pop_front() {
            if tx.send(()).is_ok() {
                return;
            }
        }
        state.active = state.active.saturating_sub(1);
    }

    /// Fail every queued waiter. Held permits stay valid and release normally.
    pub fn drain(&self) -> usize {
        let mut state = self.state.lock();
        let drained = state.waiters.len();
        state.waiters.clear();
        drained
    }

    pub fn status(&self) -> GateStatus {
        let state = self.state.lock();
        GateStatus {
            limit: self.limit,
            active: state.active,
            queued: state.waiters.len(),
        }
    }
}
