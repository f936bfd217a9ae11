//! In-flight request bookkeeping.
//!
//! Every client keeps one [`PendingMap`] tracking which request ids have
//! been issued and whether the server has acknowledged them yet. The map is
//! where the protocol's ordering rules are enforced: an ACK must precede
//! the RESULT for the same id, duplicate ACKs are tolerated, and a RESULT
//! for an unacknowledged or unknown id is a fatal violation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use nimbus_common::{NimbusError, RequestId, Result};

/// State of one outstanding request.
#[derive(Debug, Default)]
struct PendingRequest {
    ack_received: bool,
}

/// Outcome of recording an ACK frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// First ACK for a known pending id.
    Acked,
    /// ACK for an id this client never issued. Anomalous but harmless.
    UnknownId,
    /// Repeated ACK for an id already acknowledged. Anomalous but harmless.
    AlreadyAcked,
}

/// Tracks issued request ids and their acknowledgment state.
///
/// Ids are allocated from a per-client counter starting at zero, so two
/// clients may reuse the same numbers; ids only need to be unique within
/// one client's open connections.
#[derive(Debug, Default)]
pub struct PendingMap {
    next_id: AtomicU64,
    pending: Mutex<HashMap<RequestId, PendingRequest>>,
}

impl PendingMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates the next request id and registers it as pending.
    pub fn allocate(&self) -> RequestId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.lock().insert(id, PendingRequest::default());
        id
    }

    /// Records an ACK for `id`.
    ///
    /// Never fails: stray and duplicate ACKs are reported so the caller can
    /// log them, but they do not poison the connection.
    pub fn record_ack(&self, id: RequestId) -> AckOutcome {
        let mut pending = self.lock();
        match pending.get_mut(&id) {
            None => AckOutcome::UnknownId,
            Some(request) if request.ack_received => AckOutcome::AlreadyAcked,
            Some(request) => {
                request.ack_received = true;
                AckOutcome::Acked
            }
        }
    }

    /// Records the RESULT for `id`, removing it from the map.
    ///
    /// # Errors
    ///
    /// Returns [`NimbusError::Protocol`] when the id is unknown or its ACK
    /// never arrived. Either way the exchange ordering is broken and the
    /// connection must be abandoned.
    pub fn complete(&self, id: RequestId) -> Result<()> {
        let mut pending = self.lock();
        match pending.remove(&id) {
            None => Err(NimbusError::Protocol(format!(
                "result for unknown request id {}",
                id
            ))),
            Some(request) if !request.ack_received => Err(NimbusError::Protocol(format!(
                "result for request id {} arrived before its ack",
                id
            ))),
            Some(_) => Ok(()),
        }
    }

    /// Number of requests still awaiting a result.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<RequestId, PendingRequest>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }
}
