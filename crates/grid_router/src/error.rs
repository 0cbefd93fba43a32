//! Structured routing errors.
//!
//! `RoutingError` is the error payload that travels with batch replies. The
//! router classifies errors by their `ErrorDetail`: some are local to one
//! replica (try the next), some indicate stale routing metadata (evict and
//! re-resolve), and the rest surface to the caller unchanged.

use serde::{Deserialize, Serialize};

use crate::batch::Transaction;
use crate::descriptor::{RangeDescriptor, RangeId, ReplicaDescriptor, StoreId};
use crate::hlc::Timestamp;
use crate::keys::KeySpan;

/// Typed error payload distinguishing the failure classes the router reacts
/// to differently.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ErrorDetail {
    /// The first-range descriptor has not arrived via gossip yet.
    FirstRangeMissing,
    /// The batch contained no requests.
    EmptyBatch,
    /// The batch mixed request kinds that cannot be dispatched together.
    IllegalMixture,
    /// A multi-range operation needs a transaction or an inconsistent read.
    OpRequiresTxn,
    /// Sentinel: the batch cannot commit in one phase because it spans
    /// ranges; the splitter retries with EndTransaction isolated.
    NoOnePhaseCommit,
    /// All replicas of a range failed at the transport level.
    Send,
    /// The contacted store does not know the range.
    RangeNotFound { range_id: RangeId },
    /// The contacted range does not own the requested span; carries the
    /// server's view of the surrounding descriptors when available.
    RangeKeyMismatch {
        requested: KeySpan,
        mismatched: Option<RangeDescriptor>,
        suggested: Option<RangeDescriptor>,
    },
    /// The contacted replica does not hold the lease; `lease_holder` is its
    /// best guess at who does.
    NotLeaseHolder {
        range_id: RangeId,
        replica: ReplicaDescriptor,
        lease_holder: Option<ReplicaDescriptor>,
    },
    /// The addressed store does not exist on the contacted node.
    StoreNotFound { store_id: StoreId },
    /// The contacted node is draining or shutting down.
    NodeUnavailable,
    /// A commit may or may not have been applied; the caller must not assume
    /// either outcome.
    AmbiguousResult,
    /// The caller cancelled the request.
    ContextCanceled,
}

/// Error payload carried alongside batch replies.
///
/// In addition to the classification detail, it transports the most recent
/// transaction record and the responding node's clock reading so neither is
/// lost when an error interrupts a batch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RoutingError {
    pub message: String,
    pub txn: Option<Transaction>,
    pub now: Timestamp,
    pub detail: Option<ErrorDetail>,
}

impl RoutingError {
    pub fn new(detail: ErrorDetail) -> Self {
        let message = match &detail {
            ErrorDetail::FirstRangeMissing => {
                "the descriptor for the first range is not available via gossip".to_string()
            }
            ErrorDetail::EmptyBatch => "empty batch".to_string(),
            ErrorDetail::IllegalMixture => "illegal request mixture in batch".to_string(),
            ErrorDetail::OpRequiresTxn => {
                "multi-range operation requires a transaction or inconsistent reads".to_string()
            }
            ErrorDetail::NoOnePhaseCommit => {
                "cannot send 1PC txn to multiple ranges".to_string()
            }
            ErrorDetail::Send => "failed to send to any replica".to_string(),
            ErrorDetail::RangeNotFound { range_id } => {
                format!("r{range_id} was not found")
            }
            ErrorDetail::RangeKeyMismatch { requested, .. } => {
                format!("key range {requested} outside of bounds of contacted range")
            }
            ErrorDetail::NotLeaseHolder { range_id, .. } => {
                format!("replica of r{range_id} does not hold the lease")
            }
            ErrorDetail::StoreNotFound { store_id } => {
                format!("store {store_id} was not found")
            }
            ErrorDetail::NodeUnavailable => "node unavailable; try another peer".to_string(),
            ErrorDetail::AmbiguousResult => "result is ambiguous".to_string(),
            ErrorDetail::ContextCanceled => "request canceled".to_string(),
        };
        Self {
            message,
            txn: None,
            now: Timestamp::ZERO,
            detail: Some(detail),
        }
    }

    /// An error with a free-form message and no classification detail.
    pub fn from_msg(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            txn: None,
            now: Timestamp::ZERO,
            detail: None,
        }
    }

    /// A transport-level send failure with context in the message.
    pub fn send_error(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            txn: None,
            now: Timestamp::ZERO,
            detail: Some(ErrorDetail::Send),
        }
    }

    /// An ambiguous-commit failure with the underlying error in the message.
    pub fn ambiguous_result(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            txn: None,
            now: Timestamp::ZERO,
            detail: Some(ErrorDetail::AmbiguousResult),
        }
    }

    /// Fold a newer transaction record into the error payload.
    pub fn update_txn(&mut self, txn: &Transaction) {
        match &mut self.txn {
            Some(existing) => existing.update(txn),
            None => self.txn = Some(txn.clone()),
        }
    }

    pub fn is_detail(&self, detail: &ErrorDetail) -> bool {
        self.detail.as_ref() == Some(detail)
    }
}

impl std::fmt::Display for RoutingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for RoutingError {}
