//! Pending-response table keyed by request id.

use crate::error::{Result, StreamingError};
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

type Reply<T> = Result<Option<T>>;

struct Pending<T> {
    token: u64,
    tx: oneshot::Sender<Reply<T>>,
}

/// Table of outstanding requests awaiting a response.
pub struct CorrelationTable<T> {
    pending: Arc<DashMap<Uuid, Pending<T>>>,
    next_token: AtomicU64,
    closed: AtomicBool,
}

impl<T: Send + 'static> Default for CorrelationTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> CorrelationTable<T> {
    pub fn new() -> Self {
        Self {
            pending: Arc::new(DashMap::new()),
            next_token: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }
    }

    /// Registers a pending entry for `id`.
    ///
    /// Fails with `DuplicateRequest` if an entry for `id` already exists (the
    /// existing entry is left untouched), and with `Disconnected` once the
    /// table has been failed.
    pub fn register(&self, id: Uuid) -> Result<PendingResponse<T>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(closed_error());
        }
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        match self.pending.entry(id) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(StreamingError::DuplicateRequest(id));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Pending { token, tx });
            }
        }
        let pending = PendingResponse {
            id,
            token,
            rx: Some(rx),
            pending: self.pending.clone(),
        };

        // `fail_all` may have run between the check above and the insert.
        if self.closed.load(Ordering::SeqCst) {
            return Err(closed_error());
        }
        Ok(pending)
    }

    /// Registers `id` and waits for its response.
    ///
    /// Resolves to `Ok(None)` when `id` is already being awaited elsewhere.
    pub async fn await_response(&self, id: Uuid, cancel: &CancellationToken) -> Reply<T> {
        match self.register(id) {
            Ok(pending) => pending.wait(cancel).await,
            Err(StreamingError::DuplicateRequest(_)) => {
                tracing::debug!(request = %id, "response already awaited");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Resolves the entry for `id`. Returns whether one existed.
    pub fn signal(&self, id: &Uuid, response: Option<T>) -> bool {
        match self.pending.remove(id) {
            Some((_, entry)) => {
                let _ = entry.tx.send(Ok(response));
                true
            }
            None => false,
        }
    }

    /// Fails every outstanding entry with a disconnect error. Later
    /// registrations fail straight away.
    pub fn fail_all(&self, reason: &str) -> usize {
        self.closed.store(true, Ordering::SeqCst);
        let ids: Vec<Uuid> = self.pending.iter().map(|entry| *entry.key()).collect();
        let mut failed = 0;
        for id in ids {
            if let Some((_, entry)) = self.pending.remove(&id) {
                let _ = entry
                    .tx
                    .send(Err(StreamingError::Disconnected(reason.to_string())));
                failed += 1;
            }
        }
        if failed > 0 {
            tracing::debug!(count = failed, reason, "failed pending requests");
        }
        failed
    }

    /// Returns whether `fail_all` has run.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.pending.contains_key(id)
    }
}

fn closed_error() -> StreamingError {
    StreamingError::Disconnected("connection closed".to_string())
}

/// A registered entry. Dropping it unregisters the id.
pub struct PendingResponse<T> {
    id: Uuid,
    token: u64,
    rx: Option<oneshot::Receiver<Reply<T>>>,
    pending: Arc<DashMap<Uuid, Pending<T>>>,
}

impl<T> PendingResponse<T> {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Waits for the response, or fails with `Cancelled` when `cancel` fires.
    pub async fn wait(mut self, cancel: &CancellationToken) -> Reply<T> {
        let Some(rx) = self.rx.take() else {
            return Ok(None);
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(StreamingError::Cancelled),
            reply = rx => match reply {
                Ok(reply) => reply,
                Err(_) => Err(StreamingError::Disconnected(
                    "correlation table dropped".to_string(),
                )),
            },
        }
    }
}

impl<T> Drop for PendingResponse<T> {
    fn drop(&mut self) {
        let token = self.token;
        self.pending.remove_if(&self.id, |_, entry| entry.token == token);
    }
}
