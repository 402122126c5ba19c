//! Admission control for concurrently executing run loops.
//!
//! A run loop holds an `OwnedSemaphorePermit` for its whole lifetime. New
//! loops are admitted with `try_acquire_owned`; there is no waiting queue.
//! Each orchestrator gets its own `AdmissionControl`, so independent
//! orchestrators do not share a ceiling unless they share the instance.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[derive(Debug, Clone)]
pub struct AdmissionControl {
    semaphore: Arc<Semaphore>,
    limit: usize,
}

impl AdmissionControl {
    /// Limits above `Semaphore::MAX_PERMITS` are clamped to it.
    pub fn new(limit: usize) -> Self {
        let limit = limit.min(Semaphore::MAX_PERMITS);
        Self {
            semaphore: Arc::new(Semaphore::new(limit)),
            limit,
        }
    }

    /// Take a slot, or `None` when the ceiling is reached.
    pub fn try_admit(&self) -> Option<OwnedSemaphorePermit> {
        Arc::clone(&self.semaphore).try_acquire_owned().ok()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Number of loops currently holding a slot.
    pub fn active(&self) -> usize {
        self.limit - self.semaphore.available_permits()
    }
}
