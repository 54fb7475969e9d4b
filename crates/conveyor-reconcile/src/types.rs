use std::fmt;

use conveyor_schemas::{RequestDetails, RequestId, RequestState, RseId};

use crate::notice::NotificationKind;
use crate::ports::{CatalogError, EmitError};

/// A normalized transfer-tool report that carries a state transition.
///
/// Reports without a transition never become an `Outcome`; the normalizer
/// returns `None` for them, so `reconcile` cannot be called with a no-op.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Outcome {
    pub new_state: RequestState,
    /// Remote job identifier assigned by the transfer tool.
    pub transfer_id: String,
    /// Diagnostics reported by the transfer tool (URLs, timestamps, reason).
    pub details: RequestDetails,
}

/// Commit intent: the caller must commit its transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Committed {
    /// Non-terminal transition; only the request state changed.
    StateRecorded,
    /// Lock resolved, replica AVAILABLE, request archived, transfer-done emitted.
    Done,
    /// Lock resolved and request archived, but the replica had been deleted
    /// concurrently so no replica update and no notification happened.
    DoneReplicaMissing,
    /// Failed attempt replaced by a successor request.
    Requeued { successor: RequestId, retry_count: u32 },
    /// Failed with no attempts left: transfer-failed emitted, lock failed.
    RetriesExceeded,
    /// Lock failed, transfer-lost emitted.
    Lost,
    /// The persisted state already equalled this terminal outcome.
    AlreadyObserved,
}

/// Which lock resolution was attempted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockResolution {
    Success,
    Failure,
}

/// Catalog step that failed, for abort reasons without a dedicated variant.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
    EndpointLookup,
    DidMetadata,
    SetState,
    Archive,
    RequeueAndArchive,
}

impl Step {
    pub fn as_str(&self) -> &'static str {
        match self {
            Step::EndpointLookup => "endpoint-lookup",
            Step::DidMetadata => "did-metadata",
            Step::SetState => "set-state",
            Step::Archive => "archive",
            Step::RequeueAndArchive => "requeue-and-archive",
        }
    }
}

/// Why a reconciliation aborted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AbortReason {
    /// Destination RSE unknown to the catalog. Skip and log; no automatic retry.
    EndpointNotFound { rse_id: RseId },
    /// The request is archived or never existed.
    RequestNotLive,
    LockResolution {
        resolution: LockResolution,
        error: CatalogError,
    },
    ReplicaUpdate { error: CatalogError },
    Emit {
        kind: NotificationKind,
        error: EmitError,
    },
    Catalog { step: Step, error: CatalogError },
}

impl AbortReason {
    /// `true` when re-delivering the same outcome later may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            AbortReason::EndpointNotFound { .. } | AbortReason::RequestNotLive => false,
            AbortReason::LockResolution { .. }
            | AbortReason::ReplicaUpdate { .. }
            | AbortReason::Emit { .. } => true,
            AbortReason::Catalog { error, .. } => !matches!(error, CatalogError::NotFound(_)),
        }
    }
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::EndpointNotFound { rse_id } => write!(f, "RSE ID {rse_id} not found"),
            AbortReason::RequestNotLive => write!(f, "request is not live"),
            AbortReason::LockResolution { resolution, error } => {
                write!(f, "lock resolution ({resolution:?}) failed: {error}")
            }
            AbortReason::ReplicaUpdate { error } => write!(f, "replica update failed: {error}"),
            AbortReason::Emit { kind, error } => {
                write!(f, "emit {} failed: {error}", kind.as_str())
            }
            AbortReason::Catalog { step, error } => {
                write!(f, "catalog step {} failed: {error}", step.as_str())
            }
        }
    }
}

/// Abort intent: the caller must roll its transaction back.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("reconciliation of request {request_id} aborted: {reason}")]
pub struct Aborted {
    pub request_id: RequestId,
    pub reason: AbortReason,
}

impl Aborted {
    pub fn is_retryable(&self) -> bool {
        self.reason.is_retryable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_not_found_is_not_retried() {
        let r = AbortReason::EndpointNotFound {
            rse_id: RseId::new_v4(),
        };
        assert!(!r.is_retryable());
    }

    #[test]
    fn lock_failures_are_retried() {
        let r = AbortReason::LockResolution {
            resolution: LockResolution::Failure,
            error: CatalogError::Backend("constraint".into()),
        };
        assert!(r.is_retryable());
    }

    #[test]
    fn catalog_not_found_is_not_retried() {
        let r = AbortReason::Catalog {
            step: Step::DidMetadata,
            error: CatalogError::NotFound("did".into()),
        };
        assert!(!r.is_retryable());
        let r = AbortReason::Catalog {
            step: Step::Archive,
            error: CatalogError::Transient("deadlock".into()),
        };
        assert!(r.is_retryable());
    }
}
