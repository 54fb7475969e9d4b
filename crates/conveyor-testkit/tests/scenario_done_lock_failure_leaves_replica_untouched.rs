//! Scenario: DONE Lock Failure Leaves Replica Untouched
//!
//! # Invariant under test
//! On DONE, lock resolution and the replica update move together. If the
//! lock cannot be resolved the engine aborts before touching the replica,
//! and rolling back leaves the request SUBMITTED so the outcome is retried.
//!
//! All tests are pure in-process; no DB or network required.

use conveyor_reconcile::{AbortReason, CatalogError, LockResolution, Severity};
use conveyor_schemas::{LockState, ReplicaState, RequestState};
use conveyor_testkit::fixtures::DST_RSE;
use conveyor_testkit::{outcome, seed_transfer, Harness, InMemoryCatalog, Op};

#[tokio::test]
async fn lock_failure_aborts_before_replica_update() {
    let h = Harness::new(InMemoryCatalog::new(3));
    let seeded = seed_transfer(&h.catalog, "file.root", 0).await;
    let req = &seeded.request;
    h.catalog.inject(
        Op::ResolveLockSuccess,
        CatalogError::Backend("lock row constraint".into()),
    );

    let aborted = h
        .settle(req, &outcome(RequestState::Done))
        .await
        .unwrap_err();

    assert_eq!(aborted.request_id, req.request_id);
    assert!(matches!(
        aborted.reason,
        AbortReason::LockResolution {
            resolution: LockResolution::Success,
            ..
        }
    ));
    assert!(aborted.is_retryable());
    assert!(
        !h.catalog.calls().contains(&Op::UpdateReplicaState),
        "replica must not be touched after a lock failure"
    );
    assert!(h.emitter.sent().is_empty());
    assert!(h.log.contains(Severity::Warning, "could not update lock"));
}

#[tokio::test]
async fn rollback_restores_submitted_request() {
    let h = Harness::new(InMemoryCatalog::new(3));
    let seeded = seed_transfer(&h.catalog, "file.root", 0).await;
    let req = &seeded.request;
    h.catalog.inject(
        Op::ResolveLockSuccess,
        CatalogError::Transient("deadlock detected".into()),
    );

    h.settle(req, &outcome(RequestState::Done))
        .await
        .unwrap_err();

    let snap = h.catalog.snapshot().await;
    assert_eq!(snap.requests[&req.request_id].state, RequestState::Submitted);
    assert_eq!(
        snap.replica(&req.scope, &req.name, DST_RSE),
        Some(ReplicaState::Copying)
    );
    assert_eq!(
        snap.lock(&req.scope, &req.name, seeded.dst_rse_id),
        Some(LockState::Replicating)
    );

    // Same outcome redelivered once the catalog recovers.
    h.catalog.clear_faults();
    h.settle(req, &outcome(RequestState::Done)).await.unwrap();
    let snap = h.catalog.snapshot().await;
    assert_eq!(
        snap.replica(&req.scope, &req.name, DST_RSE),
        Some(ReplicaState::Available)
    );
    assert_eq!(h.emitter.sent().len(), 1);
}
