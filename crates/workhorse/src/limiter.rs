use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[derive(Debug, PartialEq, Eq)]
pub enum LimitError {
    QueueFull,
    QueueTimeout,
}

impl std::fmt::Display for LimitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LimitError::QueueFull => write!(f, "request queue is full"),
            LimitError::QueueTimeout => write!(f, "request timed out in queue"),
        }
    }
}

impl std::error::Error for LimitError {}

/// Bounds concurrent API requests. Requests beyond the limit wait in a
/// bounded queue; a full queue rejects immediately and a stale queue entry
/// gives up after the configured duration.
#[derive(Clone)]
pub struct QueueLimiter {
    running: Option<Arc<Semaphore>>,
    queued: Option<Arc<Semaphore>>,
    queue_timeout: Duration,
}

impl QueueLimiter {
    pub fn new(limit: usize, queue_limit: usize, queue_timeout: Duration) -> Self {
        Self {
            running: (limit > 0).then(|| Arc::new(Semaphore::new(limit))),
            queued: (limit > 0 && queue_limit > 0).then(|| Arc::new(Semaphore::new(queue_limit))),
            queue_timeout,
        }
    }

    /// Returns a permit that must be held for the duration of the request,
    /// or `None` when limiting is disabled.
    pub async fn acquire(&self) -> Result<Option<OwnedSemaphorePermit>, LimitError> {
        let Some(running) = &self.running else {
            return Ok(None);
        };

        // The queue slot is held while waiting and released once running.
        let queue_slot = match &self.queued {
            Some(queued) => match queued.clone().try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => return Err(LimitError::QueueFull),
            },
            None => None,
        };

        let permit = tokio::time::timeout(self.queue_timeout, running.clone().acquire_owned())
            .await
            .map_err(|_| LimitError::QueueTimeout)?
            .map_err(|_| LimitError::QueueFull)?;
        drop(queue_slot);
        Ok(Some(permit))
    }
}
