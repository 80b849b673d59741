// Domain error taxonomy for the review workflow
//
// Caller errors (validation, insufficient funds, not-found, ownership,
// already-reviewed) are terminal and never retried. Storage and upstream
// failures are transient. MarkerSyncPending is the one mixed case: the
// contribution is already Approved and the reward paid, only the marker
// registry call still needs to happen.

use thiserror::Error;

use crate::contributions::ContributionStatus;

#[derive(Debug, Error)]
pub enum ReviewError {
    /// Action-specific fields missing or out of range; nothing was persisted.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Ledger amounts must be strictly positive.
    #[error("invalid amount: {0} (must be > 0)")]
    InvalidAmount(f64),

    #[error("insufficient funds for user {user_id}: requested {requested}, available {available}")]
    InsufficientFunds {
        user_id: String,
        requested: f64,
        available: f64,
    },

    /// Unknown contribution/marker/account/vote id.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Transition attempted on a contribution that already left Pending.
    #[error("contribution {contribution_id} already reviewed (status: {status})")]
    AlreadyReviewed {
        contribution_id: String,
        status: ContributionStatus,
    },

    /// Owner-only mutation attempted by a different user.
    #[error("user {user_id} does not own contribution {contribution_id}")]
    Forbidden {
        user_id: String,
        contribution_id: String,
    },

    /// Duplicate vote, or an owner edit on a record that is no longer Pending.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The contribution is durably Approved and the reward paid, but the
    /// marker registry mutation failed afterwards. Retryable via
    /// `ReviewCoordinator::retry_marker_sync`.
    #[error("contribution {contribution_id} approved with pending marker sync: {source_msg}")]
    MarkerSyncPending {
        contribution_id: String,
        source_msg: String,
    },

    /// A collaborator could not be reached or returned an error.
    #[error("upstream unavailable: {0}")]
    Upstream(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),
}

impl ReviewError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        ReviewError::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Whether the caller may retry the operation (or its remaining part).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ReviewError::MarkerSyncPending { .. }
                | ReviewError::Upstream(_)
                | ReviewError::Storage(_)
        )
    }
}

pub type ReviewResult<T> = Result<T, ReviewError>;
