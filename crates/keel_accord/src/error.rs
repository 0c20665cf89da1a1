//! Error sums for coordination outcomes.
//!
//! Protocol failures are ordinary values returned to the submitting callback;
//! nothing is raised asynchronously across tasks. Embedding-edge failures
//! (transport wiring, journal IO) use `anyhow` instead.

use thiserror::Error;

use crate::txn::{Ballot, TxnId};

/// Why a topology mismatch is unrecoverable or not.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MismatchReason {
    /// The home key is no longer owned under the required epoch; retry with
    /// a fresh topology.
    HomeKey,
    /// The requested keys or ranges are themselves invalid for the epoch.
    /// Fatal: no amount of retrying produces a valid scope.
    KeysOrRanges,
}

/// Terminal and transient failures of a coordination attempt.
#[derive(Clone, Debug, Error)]
pub enum CoordinateError {
    /// A tracker exhausted its shards without reaching quorum.
    #[error("timed out coordinating {txn_id:?}")]
    Timeout { txn_id: TxnId },

    /// A higher ballot was observed for the same transaction; the observer
    /// must yield to the newer coordinator.
    #[error("preempted coordinating {txn_id:?} by ballot {by:?}")]
    Preempted { txn_id: TxnId, by: Ballot },

    /// A quorum agreed the transaction will never commit.
    #[error("transaction {txn_id:?} invalidated")]
    Invalidated { txn_id: TxnId },

    /// The transaction is already beyond the phase this coordination was
    /// attempting to drive.
    #[error("transaction {txn_id:?} already progressed past this attempt")]
    Redundant { txn_id: TxnId },

    /// State required for the operation has been garbage collected.
    #[error("state for {txn_id:?} has been truncated")]
    Truncated { txn_id: TxnId },

    /// Not enough non-faulty replicas remain to attempt the operation.
    #[error("insufficient live replicas for {txn_id:?}")]
    Exhausted { txn_id: TxnId },

    /// The required range or home key is no longer valid under the epochs in
    /// play. Retryable with a fresh topology unless the reason is
    /// `KeysOrRanges`.
    #[error("topology mismatch for {txn_id:?}: {reason:?}")]
    TopologyMismatch { txn_id: TxnId, reason: MismatchReason },

    /// Deterministic injected fault; treated as transient by callers.
    #[error("simulated fault during {txn_id:?}")]
    SimulatedFault { txn_id: TxnId },
}

impl CoordinateError {
    /// Transient errors may be retried (with backoff) by the progress log;
    /// fatal errors terminate the coordination and surface to the client.
    pub fn is_transient(&self) -> bool {
        match self {
            CoordinateError::Timeout { .. }
            | CoordinateError::Preempted { .. }
            | CoordinateError::Truncated { .. }
            | CoordinateError::SimulatedFault { .. } => true,
            CoordinateError::TopologyMismatch { reason, .. } => {
                *reason == MismatchReason::HomeKey
            }
            CoordinateError::Invalidated { .. }
            | CoordinateError::Redundant { .. }
            | CoordinateError::Exhausted { .. } => false,
        }
    }
}

pub type CoordinateResult<T> = Result<T, CoordinateError>;
