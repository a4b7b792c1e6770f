use replicon_core::{ActionFailure, ReconcileOutcome, StoreError};

/// Why a reconciliation pass did not complete.
///
/// Already-applied creates and deletes are never rolled back; the outcome
/// carried by `Mutation` and `Cancelled` records how far the pass got.
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("{failure}")]
    Mutation { failure: ActionFailure, outcome: ReconcileOutcome },
    #[error("reconciliation pass cancelled")]
    Cancelled { outcome: ReconcileOutcome },
}

impl ReconcileError {
    pub fn outcome(&self) -> Option<&ReconcileOutcome> {
        match self {
            ReconcileError::Store(_) => None,
            ReconcileError::Mutation { outcome, .. } | ReconcileError::Cancelled { outcome } => Some(outcome),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ReconcileError::Store(_) => "store",
            ReconcileError::Mutation { .. } => "mutation",
            ReconcileError::Cancelled { .. } => "cancelled",
        }
    }
}
