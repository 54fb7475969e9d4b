//! conveyor-reconcile
//!
//! Transfer-request reconciliation: applies one reported transfer outcome to
//! the catalog (request state, lock, replica, archive/requeue) and emits the
//! matching downstream notification.
//!
//! Architectural decisions:
//! - Request state is persisted before any lock or replica mutation
//! - Lock and replica move together on DONE; a lock failure aborts before the replica is touched
//! - FAILED requeues while the retry policy allows, otherwise notifies and fails the lock
//! - LOST always fails the lock and notifies; never requeues
//! - The caller owns the transaction; the engine only returns a commit/abort intent
//!
//! Every side effect (catalog, notification, metrics, logging) goes through an
//! injected port, see [`ports`].

mod engine;
pub mod normalizer;
pub mod notice;
pub mod observe;
pub mod ports;
mod types;

pub use engine::ReconcileEngine;
pub use normalizer::{normalize, normalize_json, NormalizeError, RawTransferResponse};
pub use notice::{NoticeSettings, Notification, NotificationKind};
pub use observe::{NoopMetrics, TracingLog, TracingMetrics};
pub use ports::{
    Catalog, CatalogError, CatalogErrorKind, EmitError, MetricsRecorder, NotificationEmitter,
    ReconcileLog, Severity, WorkQueue,
};
pub use types::*;
