// src/ingest/gate.rs
//! Process-wide concurrency gate shared by every provider invocation.

use std::sync::Arc;

use metrics::gauge;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Counting semaphore bounding simultaneous ingestion runs.
///
/// Waiters are queued FIFO by tokio's semaphore. The slot is released when the
/// returned [`GatePermit`] drops, which covers every exit path.
#[derive(Debug, Clone)]
pub struct ConcurrencyGate {
    sem: Arc<Semaphore>,
    capacity: usize,
}

/// RAII slot; dropping it frees the slot for the next waiter.
#[derive(Debug)]
pub struct GatePermit {
    _permit: OwnedSemaphorePermit,
    gate: ConcurrencyGate,
}

impl ConcurrencyGate {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            sem: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    pub async fn acquire(&self) -> GatePermit {
        // never closed, so acquire_owned cannot fail
        let permit = match self.sem.clone().acquire_owned().await {
            Ok(p) => p,
            Err(_) => unreachable!("ingest gate semaphore is never closed"),
        };
        gauge!("ingest_gate_active").set(self.active() as f64);
        GatePermit {
            _permit: permit,
            gate: self.clone(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of slots currently held.
    pub fn active(&self) -> usize {
        self.capacity - self.sem.available_permits()
    }
}

impl Drop for GatePermit {
    fn drop(&mut self) {
        // permit field drops after this body runs, hence the -1
        gauge!("ingest_gate_active").set(self.gate.active().saturating_sub(1) as f64);
    }
}
