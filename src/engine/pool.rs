//! Bounded direct-handoff worker pool for guest invocations.
//!
//! Invocations are bursty and short: capacity is `max(CPU count, 2)` with
//! zero resident workers. Submission waits until a slot frees (direct
//! hand-off, no queue depth), then runs the task on a blocking worker thread
//! the runtime spawns on demand and retires when idle. Workers never prevent
//! process shutdown.
//!
//! On timeout the task's [`InterruptHandle`] is triggered and
//! [`Error::InvocationTimeout`] is raised immediately; the worker keeps the
//! slot until the guest reaches a yield point and unwinds, which caps
//! concurrency at pool capacity even with stuck guests.

use crate::constants::MIN_POOL_WORKERS;
use crate::engine::InterruptHandle;
use crate::error::{Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

/// Slot-bounded executor for blocking guest work.
pub struct WorkerPool {
    slots: Arc<Semaphore>,
    capacity: usize,
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerPool {
    /// Creates a pool sized to the host: `max(CPU count, 2)`.
    pub fn new() -> Self {
        Self::with_capacity(num_cpus::get().max(MIN_POOL_WORKERS))
    }

    /// Creates a pool with an explicit slot count.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Maximum concurrent invocations.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Runs `task` on a worker, waiting up to `timeout_millis` for the
    /// result. A non-positive timeout waits indefinitely.
    ///
    /// Errors from the task bubble with their original kind. If the caller's
    /// future is dropped mid-wait, the interrupt fires so the abandoned guest
    /// can unwind.
    pub async fn run<T>(
        &self,
        timeout_millis: i64,
        interrupt: InterruptHandle,
        task: impl FnOnce() -> Result<T> + Send + 'static,
    ) -> Result<T>
    where
        T: Send + 'static,
    {
        let permit = Arc::clone(&self.slots)
            .acquire_owned()
            .await
            .map_err(|_| Error::Internal("worker pool closed".to_string()))?;

        let handle = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            task()
        });

        let mut guard = InterruptOnDrop {
            interrupt: interrupt.clone(),
            armed: true,
        };

        let joined = if timeout_millis > 0 {
            match tokio::time::timeout(Duration::from_millis(timeout_millis as u64), handle).await {
                Ok(joined) => joined,
                Err(_) => {
                    interrupt.trigger();
                    guard.armed = false;
                    debug!(timeout_millis, "invocation timed out, interrupt requested");
                    return Err(Error::InvocationTimeout {
                        millis: timeout_millis,
                    });
                }
            }
        } else {
            handle.await
        };
        guard.armed = false;

        match joined {
            Ok(result) => result,
            Err(join_error) => {
                warn!(error = %join_error, "invocation worker failed");
                Err(Error::Internal(format!("worker failed: {join_error}")))
            }
        }
    }
}

/// Fires the interrupt when the submitting future is abandoned mid-wait.
struct InterruptOnDrop {
    interrupt: InterruptHandle,
    armed: bool,
}

impl Drop for InterruptOnDrop {
    fn drop(&mut self) {
        if self.armed {
            self.interrupt.trigger();
        }
    }
}
