//! Ordered send queue.
//!
//! A FIFO queue drained by exactly one background task. Producers post from
//! any task without blocking; the consumer applies an async action to each
//! item strictly in post order, so one item's transport write always
//! completes before the next one starts.
//!
//! ```text
//! Producer 1 ─┐
//! Producer 2 ─┼─► mpsc::UnboundedSender<T> ─► Consumer Task ─► action(item).await
//! Producer N ─┘
//! ```

use parking_lot::Mutex;
use std::fmt::Display;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Single-consumer ordered queue.
pub struct SendQueue<T> {
    name: &'static str,
    tx: Mutex<Option<mpsc::UnboundedSender<T>>>,
    pending: Arc<AtomicUsize>,
    cancel: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
    shutdown_timeout: Duration,
}

impl<T: Send + 'static> SendQueue<T> {
    /// Creates the queue and spawns its consumer task.
    ///
    /// Must be called from within a tokio runtime. A failing action is
    /// logged and the loop moves on to the next item.
    pub fn new<F, Fut, E>(name: &'static str, action: F, shutdown_timeout: Duration) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<T>();
        let pending = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();

        let worker = {
            let pending = pending.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tracing::debug!(queue = name, "send queue consumer started");
                loop {
                    let item = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        item = rx.recv() => match item {
                            Some(item) => item,
                            None => break,
                        },
                    };

                    if let Err(e) = action(item).await {
                        tracing::warn!(queue = name, error = %e, "send action failed");
                    }
                    pending.fetch_sub(1, Ordering::AcqRel);
                }
                tracing::debug!(queue = name, "send queue consumer stopped");
            })
        };

        Self {
            name,
            tx: Mutex::new(Some(tx)),
            pending,
            cancel,
            worker: Mutex::new(Some(worker)),
            shutdown_timeout,
        }
    }

    /// Enqueues an item without blocking.
    ///
    /// Returns the item back if the queue has been closed.
    pub fn post(&self, item: T) -> Result<(), T> {
        let guard = self.tx.lock();
        let Some(tx) = guard.as_ref() else {
            return Err(item);
        };
        self.pending.fetch_add(1, Ordering::AcqRel);
        tx.send(item).map_err(|e| {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            e.0
        })
    }

    /// Returns the number of items posted but not yet applied.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Returns whether the queue still accepts items.
    pub fn is_open(&self) -> bool {
        self.tx.lock().is_some() && !self.cancel.is_cancelled()
    }

    /// Stops accepting items, lets the consumer drain what is already queued,
    /// and waits for it up to the shutdown timeout. A consumer that is still
    /// busy after the timeout is cancelled.
    pub async fn close(&self) {
        drop(self.tx.lock().take());

        let worker = self.worker.lock().take();
        let Some(mut worker) = worker else {
            return;
        };

        match tokio::time::timeout(self.shutdown_timeout, &mut worker).await {
            Ok(_) => {}
            Err(_) => {
                tracing::warn!(
                    queue = self.name,
                    pending = self.pending(),
                    "send queue did not drain in time, cancelling"
                );
                self.cancel.cancel();
                worker.abort();
                let _ = worker.await;
            }
        }
    }

    /// Cancels the consumer without draining queued items, including the
    /// item it is applying right now, and waits for it to stop.
    pub async fn abort(&self) {
        drop(self.tx.lock().take());
        self.cancel.cancel();

        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            worker.abort();
            let _ = worker.await;
        }
    }
}

impl<T> Drop for SendQueue<T> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
