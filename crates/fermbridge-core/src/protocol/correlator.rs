//! Request/response correlation
//!
//! Responses carry no request identifier, so correlation is by the kind of
//! response a request expects. The table holds at most one pending request
//! per [`ResponseKind`]; setters share the single [`ResponseKind::Ack`] slot.

use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

use super::{ProtocolError, ResponseKind, ResponseRecord};

/// Result delivered to the issuer of a request
pub type Reply = Result<ResponseRecord, ProtocolError>;

/// One outstanding request
#[derive(Debug)]
struct PendingRequest {
    issued_at: Instant,
    deadline: Instant,
    /// `None` for internal requests nobody waits on (resync)
    responder: Option<oneshot::Sender<Reply>>,
}

impl PendingRequest {
    fn resolve(self, reply: Reply) {
        if let Some(tx) = self.responder {
            // The issuer may have stopped waiting
            let _ = tx.send(reply);
        }
    }
}

/// What happened to an incoming record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Resolved the pending request of this kind
    Matched(ResponseKind),
    /// Nothing was waiting; the record is an unsolicited push
    Unsolicited,
}

/// Single-slot-per-kind correlation table
#[derive(Debug)]
pub struct Correlator {
    pending: HashMap<ResponseKind, PendingRequest>,
    timeout: Duration,
}

impl Correlator {
    pub fn new(timeout: Duration) -> Self {
        Self {
            pending: HashMap::new(),
            timeout,
        }
    }

    /// Per-request deadline
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Claim the slot for `kind`
    ///
    /// Fails with [`ProtocolError::RequestAlreadyInFlight`] while another
    /// request of the same kind is unresolved. The rejected responder is
    /// handed back so the caller can report the error on it.
    pub fn register(
        &mut self,
        kind: ResponseKind,
        responder: Option<oneshot::Sender<Reply>>,
        now: Instant,
    ) -> Result<(), (ProtocolError, Option<oneshot::Sender<Reply>>)> {
        if self.pending.contains_key(&kind) {
            return Err((ProtocolError::RequestAlreadyInFlight(kind), responder));
        }
        self.pending.insert(
            kind,
            PendingRequest {
                issued_at: now,
                deadline: now + self.timeout,
                responder,
            },
        );
        Ok(())
    }

    /// Offer a decoded record to the table
    pub fn resolve(&mut self, record: &ResponseRecord) -> Resolution {
        let Some(kind) = record.kind() else {
            return Resolution::Unsolicited;
        };
        let Some(pending) = self.pending.remove(&kind) else {
            return Resolution::Unsolicited;
        };

        tracing::trace!(
            %kind,
            elapsed_ms = pending.issued_at.elapsed().as_millis() as u64,
            "response matched"
        );
        let reply = match record {
            ResponseRecord::Failure(message) => Err(ProtocolError::Rejected(message.clone())),
            other => Ok(other.clone()),
        };
        pending.resolve(reply);
        Resolution::Matched(kind)
    }

    /// Resolve every request whose deadline has passed with a timeout
    pub fn expire(&mut self, now: Instant) -> Vec<ResponseKind> {
        let expired: Vec<ResponseKind> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(kind, _)| *kind)
            .collect();
        for kind in &expired {
            if let Some(pending) = self.pending.remove(kind) {
                pending.resolve(Err(ProtocolError::Timeout(*kind)));
            }
        }
        expired
    }

    /// Earliest pending deadline
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|p| p.deadline).min()
    }

    /// Release one slot, resolving it as cancelled
    pub fn cancel(&mut self, kind: ResponseKind) -> bool {
        match self.pending.remove(&kind) {
            Some(pending) => {
                pending.resolve(Err(ProtocolError::Cancelled));
                true
            }
            None => false,
        }
    }

    /// Release every slot, resolving each with `error`
    pub fn fail_all(&mut self, error: ProtocolError) {
        for (_, pending) in self.pending.drain() {
            pending.resolve(Err(error.clone()));
        }
    }

    /// Release every slot as cancelled
    pub fn cancel_all(&mut self) {
        self.fail_all(ProtocolError::Cancelled);
    }

    pub fn is_pending(&self, kind: ResponseKind) -> bool {
        self.pending.contains_key(&kind)
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }
}
