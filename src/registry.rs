//! Correlation registry: exactly-once settlement of correlated calls.
//!
//! DESIGN
//! ======
//! Pending entries live in a `HashMap<String, PendingEntry>` behind a mutex.
//! Every settlement path (response, cancel, timeout, disconnect, supersede,
//! overflow) starts by removing the entry; whoever removes it settles the
//! caller's oneshot, and every later path finds nothing and becomes a no-op.
//!
//! Each entry owns a timer task that expires it after its window. The timer
//! is aborted when the entry settles by any other path.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use frames::Frame;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::ClientError;

type Settlement = Result<Frame, ClientError>;

/// Per-registration settings.
#[derive(Debug, Clone, Copy)]
pub struct Registration {
    pub timeout: Duration,
    /// Connection generation the request frame is written under.
    pub generation: u64,
    /// Settle with `Disconnected` when that connection closes.
    pub notify_disconnect: bool,
}

struct PendingEntry {
    created_at: Instant,
    timeout: Duration,
    generation: u64,
    notify_disconnect: bool,
    timer: Option<JoinHandle<()>>,
    tx: oneshot::Sender<Settlement>,
}

#[derive(Clone, Default)]
pub struct CorrelationRegistry {
    inner: Arc<Mutex<HashMap<String, PendingEntry>>>,
}

impl CorrelationRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<String, PendingEntry>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocate a fresh identifier and start its timeout.
    ///
    /// The timer needs a Tokio runtime; outside one the entry only settles
    /// through a response, a cancel, or a connection event.
    pub fn register(&self, registration: Registration) -> PendingCall {
        let (tx, rx) = oneshot::channel();
        let id = {
            let mut pending = self.pending();
            let mut id = Uuid::new_v4().to_string();
            while pending.contains_key(&id) {
                id = Uuid::new_v4().to_string();
            }
            pending.insert(
                id.clone(),
                PendingEntry {
                    created_at: Instant::now(),
                    timeout: registration.timeout,
                    generation: registration.generation,
                    notify_disconnect: registration.notify_disconnect,
                    timer: None,
                    tx,
                },
            );
            id
        };

        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let timer = runtime.spawn(expire_after(
                Arc::downgrade(&self.inner),
                id.clone(),
                registration.timeout,
            ));
            match self.pending().get_mut(&id) {
                Some(entry) => entry.timer = Some(timer),
                None => timer.abort(),
            }
        } else {
            warn!(request_id = %id, "registry: no runtime; request has no timeout");
        }

        debug!(
            request_id = %id,
            timeout_ms = duration_ms(registration.timeout),
            generation = registration.generation,
            "registry: registered"
        );

        PendingCall {
            id,
            rx,
            registry: self.clone(),
            settled: false,
        }
    }

    /// Settle the request with a response frame.
    ///
    /// A frame carrying `error` settles it with [`ClientError::Remote`].
    /// Unknown, late and duplicate identifiers are logged and ignored.
    pub fn resolve(&self, id: &str, frame: Frame) -> bool {
        let settled = self.settle(id, |_| match frame.error.clone() {
            Some(message) => Err(ClientError::Remote {
                kind: frame.kind.clone(),
                message,
            }),
            None => Ok(frame),
        });
        if !settled {
            let err = ClientError::DuplicateResponse {
                request_id: id.to_owned(),
            };
            warn!(error = %err, "registry: ignoring response");
        }
        settled
    }

    /// Cancel locally. The remote side is not told to stop.
    pub fn cancel(&self, id: &str) -> bool {
        self.settle(id, |_| {
            Err(ClientError::Cancelled {
                request_id: id.to_owned(),
            })
        })
    }

    /// Settle with an arbitrary error.
    pub fn reject(&self, id: &str, err: ClientError) -> bool {
        self.settle(id, |_| Err(err))
    }

    fn expire(&self, id: &str) -> bool {
        self.settle(id, |entry| {
            Err(ClientError::Timeout {
                request_id: id.to_owned(),
                timeout_ms: duration_ms(entry.timeout),
            })
        })
    }

    /// Settle every request that asked for disconnect notification on the
    /// connection that just closed. Returns how many were settled.
    pub fn disconnect(&self, generation: u64) -> usize {
        self.settle_where(
            |entry| entry.notify_disconnect && entry.generation == generation,
            |id, _| ClientError::Disconnected {
                request_id: id.to_owned(),
            },
        )
    }

    /// Settle every request written under a connection older than
    /// `generation`. Returns how many were settled.
    pub fn invalidate_before(&self, generation: u64) -> usize {
        self.settle_where(
            |entry| entry.generation < generation,
            |id, entry| ClientError::Superseded {
                request_id: id.to_owned(),
                generation: entry.generation,
            },
        )
    }

    /// Move a pending request to the generation its frame will actually be
    /// written under.
    pub fn retag(&self, id: &str, generation: u64) -> bool {
        let retagged = match self.pending().get_mut(id) {
            Some(entry) => {
                entry.generation = generation;
                true
            }
            None => false,
        };
        if retagged {
            debug!(request_id = %id, generation, "registry: retagged");
        }
        retagged
    }

    #[must_use]
    pub fn is_pending(&self, id: &str) -> bool {
        self.pending().contains_key(id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pending().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending().is_empty()
    }

    fn settle(&self, id: &str, outcome: impl FnOnce(&PendingEntry) -> Settlement) -> bool {
        let Some(entry) = self.pending().remove(id) else {
            return false;
        };
        finish(id, entry, outcome);
        true
    }

    fn settle_where(
        &self,
        matches: impl Fn(&PendingEntry) -> bool,
        error: impl Fn(&str, &PendingEntry) -> ClientError,
    ) -> usize {
        let drained: Vec<(String, PendingEntry)> = {
            let mut pending = self.pending();
            let ids: Vec<String> = pending
                .iter()
                .filter(|(_, entry)| matches(entry))
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| pending.remove(&id).map(|entry| (id, entry)))
                .collect()
        };

        let count = drained.len();
        for (id, entry) in drained {
            let err = error(&id, &entry);
            finish(&id, entry, |_| Err(err));
        }
        count
    }
}

fn finish(id: &str, mut entry: PendingEntry, outcome: impl FnOnce(&PendingEntry) -> Settlement) {
    if let Some(timer) = entry.timer.take() {
        timer.abort();
    }
    let settlement = outcome(&entry);
    match &settlement {
        Ok(_) => debug!(
            request_id = %id,
            elapsed_ms = duration_ms(entry.created_at.elapsed()),
            "registry: resolved"
        ),
        Err(err) => debug!(
            request_id = %id,
            elapsed_ms = duration_ms(entry.created_at.elapsed()),
            error = %err,
            "registry: rejected"
        ),
    }
    // The caller may have stopped waiting; nothing left to deliver to.
    let _ = entry.tx.send(settlement);
}

async fn expire_after(registry: Weak<Mutex<HashMap<String, PendingEntry>>>, id: String, timeout: Duration) {
    tokio::time::sleep(timeout).await;
    if let Some(inner) = registry.upgrade() {
        CorrelationRegistry { inner }.expire(&id);
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

// =============================================================================
// PENDING CALL
// =============================================================================

/// Caller-side handle of one outstanding request.
///
/// Dropping it before it settles cancels the request.
#[must_use = "dropping a PendingCall cancels the request"]
pub struct PendingCall {
    id: String,
    rx: oneshot::Receiver<Settlement>,
    registry: CorrelationRegistry,
    settled: bool,
}

impl PendingCall {
    /// Correlation identifier embedded in the outgoing frame.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Wait for the request to settle.
    ///
    /// # Errors
    ///
    /// Returns the error the request was settled with: timeout,
    /// cancellation, disconnect, supersede, overflow, or a remote error.
    pub async fn wait(mut self) -> Result<Frame, ClientError> {
        let received = (&mut self.rx).await;
        self.settled = true;
        match received {
            Ok(settlement) => settlement,
            // Sender gone without a settlement: the registry itself was torn down.
            Err(_) => Err(ClientError::Cancelled {
                request_id: self.id.clone(),
            }),
        }
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        if !self.settled && self.registry.cancel(&self.id) {
            debug!(request_id = %self.id, "registry: call dropped before settlement");
        }
    }
}

#[cfg(test)]
#[path = "registry_test.rs"]
mod tests;
