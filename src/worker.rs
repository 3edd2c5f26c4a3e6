//! Best-effort background worker queues.
//!
//! Side effects that must not delay a response (audit writes, detection
//! persistence, session activity refresh) are handed to a [`WorkerQueue`].
//! Delivery is at-most-once: [`WorkerQueue::dispatch`] never waits, a full or
//! closed queue drops the item with a warning, and a failing handler only
//! logs. The queue's consumer task ends when every sender is dropped.

use std::future::Future;

use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

/// Sending half of a bounded queue drained by one background task.
#[derive(Debug)]
pub struct WorkerQueue<T> {
    name: &'static str,
    tx: mpsc::Sender<T>,
}

impl<T> Clone for WorkerQueue<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            tx: self.tx.clone(),
        }
    }
}

impl<T: Send + 'static> WorkerQueue<T> {
    /// Spawn the consumer task and return the queue handle.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn<F, Fut>(name: &'static str, capacity: usize, handler: F) -> Self
    where
        F: Fn(T) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let (tx, mut rx) = mpsc::channel::<T>(capacity.max(1));
        tokio::spawn(async move {
            while let Some(item) = rx.recv().await {
                handler(item).await;
            }
            debug!(queue = name, "Worker queue drained, consumer exiting");
        });
        Self { name, tx }
    }

    /// Enqueue `item` without waiting. Returns `false` if it was dropped.
    pub fn dispatch(&self, item: T) -> bool {
        match self.tx.try_send(item) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(queue = self.name, "Worker queue full, dropping item");
                false
            }
            Err(TrySendError::Closed(_)) => {
                warn!(queue = self.name, "Worker queue closed, dropping item");
                false
            }
        }
    }

    /// Queue name used in logs
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }
}
