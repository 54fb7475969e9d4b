//! Side-effect ports injected into the reconciliation engine.
//!
//! ```text
//! ReconcileEngine
//!     ├── Catalog               (requests, replicas, locks, DID metadata, RSEs)
//!     ├── NotificationEmitter   (transfer-done / -failed / -lost messages)
//!     ├── MetricsRecorder       (timers; never gates control flow)
//!     └── ReconcileLog          (operator-facing log lines)
//! ```
//!
//! Every catalog call receives the caller's transaction handle (`Catalog::Tx`)
//! explicitly. The engine never begins, commits or rolls back; the daemon does
//! that through [`WorkQueue`].

use std::time::Duration;

use async_trait::async_trait;
use conveyor_schemas::{
    DidMeta, ReplicaState, Request, RequestDetails, RequestId, RequestState, RseId,
};

use crate::notice::Notification;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failure reported by the catalog access layer.
///
/// The variant is the error *kind*; the engine branches on it instead of
/// treating every failure alike.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CatalogError {
    /// The addressed row does not exist (unknown RSE, archived request, ...).
    #[error("not found: {0}")]
    NotFound(String),
    /// The operation does not apply to the current catalog content, e.g. a
    /// replica state update for a replica that was deleted in the meantime.
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),
    /// Infrastructure hiccup (connection loss, deadlock, serialization failure).
    #[error("transient catalog failure: {0}")]
    Transient(String),
    /// Anything else the backend reported.
    #[error("catalog backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatalogErrorKind {
    NotFound,
    UnsupportedOperation,
    Transient,
    Backend,
}

impl CatalogError {
    pub fn kind(&self) -> CatalogErrorKind {
        match self {
            CatalogError::NotFound(_) => CatalogErrorKind::NotFound,
            CatalogError::UnsupportedOperation(_) => CatalogErrorKind::UnsupportedOperation,
            CatalogError::Transient(_) => CatalogErrorKind::Transient,
            CatalogError::Backend(_) => CatalogErrorKind::Backend,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind() == CatalogErrorKind::Transient
    }
}

/// Failure reported by a notification emitter.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EmitError {
    #[error("notification rejected: {0}")]
    Rejected(String),
    #[error("notification backend unavailable: {0}")]
    Unavailable(String),
}

// ---------------------------------------------------------------------------
// Catalog
// ---------------------------------------------------------------------------

/// Typed catalog operations consumed by the engine.
#[async_trait]
pub trait Catalog: Send + Sync {
    /// Caller-owned transactional scope threaded through every call.
    type Tx: Send + 'static;

    async fn get_endpoint_name(&self, tx: &mut Self::Tx, rse_id: RseId)
        -> Result<String, CatalogError>;

    async fn get_did_meta(
        &self,
        tx: &mut Self::Tx,
        scope: &str,
        name: &str,
    ) -> Result<DidMeta, CatalogError>;

    /// Persist `state` on a live request and return the state it replaced.
    ///
    /// Must fail with [`CatalogError::NotFound`] when the request is not live
    /// (never existed or already archived).
    async fn set_request_state(
        &self,
        tx: &mut Self::Tx,
        request_id: RequestId,
        state: RequestState,
    ) -> Result<RequestState, CatalogError>;

    /// Detail rows for a request. Exactly one row is expected.
    async fn get_request_details(
        &self,
        tx: &mut Self::Tx,
        request_id: RequestId,
    ) -> Result<Vec<RequestDetails>, CatalogError>;

    /// Move a request out of the live set into history.
    async fn archive_request(&self, tx: &mut Self::Tx, request_id: RequestId)
        -> Result<(), CatalogError>;

    /// Archive the request and, if the retry policy allows another attempt,
    /// create and return its successor.
    async fn requeue_and_archive(
        &self,
        tx: &mut Self::Tx,
        request_id: RequestId,
    ) -> Result<Option<Request>, CatalogError>;

    async fn resolve_lock_success(
        &self,
        tx: &mut Self::Tx,
        scope: &str,
        name: &str,
        rse_id: RseId,
    ) -> Result<(), CatalogError>;

    async fn resolve_lock_failure(
        &self,
        tx: &mut Self::Tx,
        scope: &str,
        name: &str,
        rse_id: RseId,
    ) -> Result<(), CatalogError>;

    /// Fails with [`CatalogError::UnsupportedOperation`] when the replica no
    /// longer exists.
    async fn update_replica_state(
        &self,
        tx: &mut Self::Tx,
        scope: &str,
        name: &str,
        rse: &str,
        state: ReplicaState,
    ) -> Result<(), CatalogError>;
}

/// Transaction control and work discovery for the daemon loop.
///
/// Not used by the engine itself.
#[async_trait]
pub trait WorkQueue: Catalog {
    async fn begin(&self) -> Result<Self::Tx, CatalogError>;

    async fn commit(&self, tx: Self::Tx) -> Result<(), CatalogError>;

    async fn rollback(&self, tx: Self::Tx) -> Result<(), CatalogError>;

    /// Up to `limit` submitted requests that are not deferred, least recently
    /// touched first. Not locked.
    async fn fetch_pending(&self, limit: usize) -> Result<Vec<Request>, CatalogError>;

    /// Lock one request row for the lifetime of `tx` and return its current
    /// content. `None` when the row is locked by another worker or is no
    /// longer live.
    async fn claim(
        &self,
        tx: &mut Self::Tx,
        request_id: RequestId,
    ) -> Result<Option<Request>, CatalogError>;

    /// Hold a submitted request back from `fetch_pending` for `delay` and move
    /// it to the back of the queue. Runs outside any caller transaction so it
    /// survives the rollback of the attempt that triggered it.
    async fn defer(&self, request_id: RequestId, delay: Duration) -> Result<(), CatalogError>;
}

// ---------------------------------------------------------------------------
// Notification emitter
// ---------------------------------------------------------------------------

/// Durable enqueue of notification messages.
///
/// The transaction handle is passed so that catalog-backed emitters can write
/// inside the caller's transaction; external brokers may ignore it.
#[async_trait]
pub trait NotificationEmitter<Tx: Send>: Send + Sync {
    async fn emit(&self, tx: &mut Tx, notification: &Notification) -> Result<(), EmitError>;
}

// ---------------------------------------------------------------------------
// Metrics / log
// ---------------------------------------------------------------------------

/// Timing side channel.
pub trait MetricsRecorder: Send + Sync {
    fn record_timer(&self, metric: &str, elapsed: Duration);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Debug,
    Info,
    Warning,
    /// Alert-worthy: lost transfers and exhausted retries.
    Critical,
}

/// Operator-facing log sink.
pub trait ReconcileLog: Send + Sync {
    fn log(&self, severity: Severity, request_id: RequestId, message: &str);
}

impl<T: MetricsRecorder + ?Sized> MetricsRecorder for std::sync::Arc<T> {
    fn record_timer(&self, metric: &str, elapsed: Duration) {
        (**self).record_timer(metric, elapsed)
    }
}

impl<T: ReconcileLog + ?Sized> ReconcileLog for std::sync::Arc<T> {
    fn log(&self, severity: Severity, request_id: RequestId, message: &str) {
        (**self).log(severity, request_id, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_is_transient() {
        assert!(CatalogError::Transient("deadlock".into()).is_transient());
        assert!(!CatalogError::NotFound("rse".into()).is_transient());
        assert!(!CatalogError::Backend("boom".into()).is_transient());
        assert_eq!(
            CatalogError::UnsupportedOperation("gone".into()).kind(),
            CatalogErrorKind::UnsupportedOperation
        );
    }

    #[test]
    fn catalog_error_display() {
        assert_eq!(
            CatalogError::NotFound("rse 42".into()).to_string(),
            "not found: rse 42"
        );
    }
}
