use emendare_common::diff::PatchError;
use emendare_common::types::{AmendmentId, DocumentId, UserId, VoteStance};
use thiserror::Error;
use uuid::Uuid;

use crate::store::{EntityKind, StoreError};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{kind} {id} not found")]
    NotFound { kind: EntityKind, id: Uuid },
    #[error("user {user_id} does not follow document {document_id}")]
    NotEligible { user_id: UserId, document_id: DocumentId },
    #[error("amendment {0} is closed")]
    AlreadyClosed(AmendmentId),
    #[error("vote `{}` already cast on amendment {amendment_id}", .stance.as_str())]
    AlreadyVoted { amendment_id: AmendmentId, stance: VoteStance },
    #[error("base version {base_version} is ahead of current version {current_version}")]
    StaleVersion { base_version: usize, current_version: usize },
    /// Not returned to callers: a conflicted merge is recorded on the
    /// amendment and carried in its closure notification.
    #[error("amendment {0} could not be merged into its document")]
    MergeConflict(AmendmentId),
    #[error("user {user_id} already follows document {document_id}")]
    AlreadyFollowing { user_id: UserId, document_id: DocumentId },
    #[error("user {user_id} does not follow document {document_id}")]
    NotFollowing { user_id: UserId, document_id: DocumentId },
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error(transparent)]
    History(#[from] PatchError),
    #[error("storage failure: {0}")]
    Storage(StoreError),
}

impl From<StoreError> for EngineError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::NotFound { kind, id } => Self::NotFound { kind, id },
            other => Self::Storage(other),
        }
    }
}

impl EngineError {
    /// Stable machine-readable code surfaced to RPC clients.
    pub const fn code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "NOT_FOUND",
            Self::NotEligible { .. } => "NOT_ELIGIBLE",
            Self::AlreadyClosed(_) => "ALREADY_CLOSED",
            Self::AlreadyVoted { .. } => "ALREADY_VOTED",
            Self::StaleVersion { .. } => "STALE_VERSION",
            Self::MergeConflict(_) => "MERGE_CONFLICT",
            Self::AlreadyFollowing { .. } => "ALREADY_FOLLOWING",
            Self::NotFollowing { .. } => "NOT_FOLLOWING",
            Self::InvalidRequest(_) => "INVALID_REQUEST",
            Self::History(_) => "HISTORY_UNAVAILABLE",
            Self::Storage(_) => "STORAGE_ERROR",
        }
    }

    /// Whether the same request may succeed if simply repeated.
    pub const fn retryable(&self) -> bool {
        matches!(self, Self::Storage(_))
    }

    /// Revision conflict that outlived the retry budget.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Storage(error) if error.is_conflict())
    }
}
