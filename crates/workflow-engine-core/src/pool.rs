/*!
# Worker pool

Bounds concurrently running stages across the whole engine, grounded on the `Arc<Semaphore>` capacity guard the workflow
extension's `WorkflowEngine` holds for its own concurrent-task limit.
*/

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::error::{EngineError, EngineResult};

/// Bounded pool of execution slots. Does not own a thread pool itself;
/// it gates how many `tokio::spawn`ed stage tasks may be mid-flight at
/// once, exactly like a connection pool gates concurrent connections.
pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

/// A held slot; the slot is released when this guard is dropped.
pub struct WorkerSlot {
    _permit: OwnedSemaphorePermit,
}

impl WorkerPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity.max(1))),
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Waits for a free slot, or returns `Cancelled` if `cancel` fires
    /// first. Never returns `PoolFull`; that variant is reserved for the
    /// non-blocking `try_acquire`.
    pub async fn acquire(&self, cancel: &CancellationToken) -> EngineResult<WorkerSlot> {
        tokio::select! {
            permit = self.semaphore.clone().acquire_owned() => {
                let permit = permit.map_err(|_| EngineError::ShutdownTimeout)?;
                Ok(WorkerSlot { _permit: permit })
            }
            _ = cancel.cancelled() => Err(EngineError::Cancelled),
        }
    }

    /// Non-blocking acquisition: fails immediately with `PoolFull` rather
    /// than waiting.
    pub fn try_acquire(&self) -> EngineResult<WorkerSlot> {
        self.semaphore
            .clone()
            .try_acquire_owned()
            .map(|permit| WorkerSlot { _permit: permit })
            .map_err(|_| EngineError::PoolFull)
    }

    /// Waits for every outstanding slot to be released, or times out.
    pub async fn shutdown_with_timeout(&self, timeout: Duration) -> EngineResult<()> {
        let wait_for_all = self.semaphore.clone().acquire_many_owned(self.capacity as u32);
        match tokio::time::timeout(timeout, wait_for_all).await {
            Ok(Ok(_permit)) => Ok(()),
            Ok(Err(_)) => Err(EngineError::ShutdownTimeout),
            Err(_) => Err(EngineError::ShutdownTimeout),
        }
    }
}
