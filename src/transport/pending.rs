use super::ToolResponse;
use crate::error::TransportError;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::oneshot;

type Responder = oneshot::Sender<Result<ToolResponse, TransportError>>;

/// In-flight requests keyed by correlation id.
///
/// Completion, timeout eviction and bulk failure all remove the entry under
/// one lock; whichever path removes it is the only one that resolves the
/// caller, so a request settles exactly once.
#[derive(Debug, Default)]
pub struct RequestTable {
    entries: Mutex<HashMap<String, Responder>>,
}

/// Receiving half of a registered request.
#[derive(Debug)]
pub struct PendingRequest {
    id: String,
    rx: oneshot::Receiver<Result<ToolResponse, TransportError>>,
}

impl PendingRequest {
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl RequestTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: &str) -> Result<PendingRequest, TransportError> {
        let mut entries = self.lock();
        if entries.contains_key(id) {
            return Err(TransportError::DuplicateId(id.to_string()));
        }
        let (tx, rx) = oneshot::channel();
        entries.insert(id.to_string(), tx);
        Ok(PendingRequest {
            id: id.to_string(),
            rx,
        })
    }

    /// Deliver a response. Unknown ids (never sent, or already evicted) are
    /// dropped and `false` is returned.
    pub fn complete(&self, response: ToolResponse) -> bool {
        let Some(tx) = self.lock().remove(&response.id) else {
            tracing::debug!(id = %response.id, "dropping response for unknown request id");
            return false;
        };
        // The caller may have stopped waiting; that is not an error here.
        let _ = tx.send(Ok(response));
        true
    }

    pub fn evict(&self, id: &str) -> bool {
        self.lock().remove(id).is_some()
    }

    pub fn fail(&self, id: &str, error: TransportError) -> bool {
        let Some(tx) = self.lock().remove(id) else {
            return false;
        };
        let _ = tx.send(Err(error));
        true
    }

    /// Reject every pending request. Returns how many were rejected.
    pub fn fail_all(&self, error: &TransportError) -> usize {
        let drained: Vec<Responder> = self.lock().drain().map(|(_, tx)| tx).collect();
        let count = drained.len();
        for tx in drained {
            let _ = tx.send(Err(error.clone()));
        }
        if count > 0 {
            tracing::debug!(count, %error, "rejected pending requests");
        }
        count
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Wait for a registered request, evicting it on timeout.
    pub async fn wait(
        &self,
        pending: PendingRequest,
        timeout: Duration,
    ) -> Result<ToolResponse, TransportError> {
        let PendingRequest { id, mut rx } = pending;

        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(TransportError::ConnectionClosed),
            Err(_) => {
                if self.evict(&id) {
                    Err(TransportError::Timeout {
                        id,
                        timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                    })
                } else {
                    // A completion removed the entry first; its value is already in flight.
                    rx.await.unwrap_or(Err(TransportError::ConnectionClosed))
                }
            }
        }
    }

    /// Register, write with `write`, then wait. A failed write evicts the
    /// entry before the error is returned.
    pub async fn round_trip<F>(
        &self,
        id: &str,
        timeout: Duration,
        write: F,
    ) -> Result<ToolResponse, TransportError>
    where
        F: Future<Output = Result<(), TransportError>>,
    {
        let pending = self.register(id)?;
        if let Err(error) = write.await {
            self.evict(id);
            return Err(error);
        }
        self.wait(pending, timeout).await
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Responder>> {
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
