use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::core::{cancel::CancelSignal, domain::Failure};

/// The system-wide execution budget shared by script runs and install steps.
#[derive(Debug)]
pub struct ConcurrencyGate {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    active: AtomicUsize,
    peak: AtomicUsize,
}

/// One held execution slot. Dropping it releases the slot on every exit path.
#[derive(Debug)]
pub struct Slot {
    gate: Arc<ConcurrencyGate>,
    _permit: OwnedSemaphorePermit,
}

impl ConcurrencyGate {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        })
    }

    /// Waits for a free slot, giving up as soon as `cancel` fires.
    pub async fn admit(self: &Arc<Self>, cancel: &CancelSignal) -> Result<Slot, Failure> {
        if cancel.is_cancelled() {
            return Err(Failure::CancelledWhileQueued);
        }

        let permit = tokio::select! {
            permit = self.semaphore.clone().acquire_owned() => permit.map_err(|_| Failure::Internal {
                reason: "concurrency gate closed".to_string(),
            })?,
            _ = cancel.cancelled() => return Err(Failure::CancelledWhileQueued),
        };

        let active = self.active.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak.fetch_max(active, Ordering::AcqRel);

        Ok(Slot {
            gate: self.clone(),
            _permit: permit,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Highest number of slots ever held at once.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::Acquire)
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        self.gate.active.fetch_sub(1, Ordering::AcqRel);
    }
}
