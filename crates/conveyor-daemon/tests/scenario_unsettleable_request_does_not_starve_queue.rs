//! Scenario: Unsettleable Request Does Not Starve Queue
//!
//! # Invariants under test
//!
//! 1. A request whose abort is not retryable is deferred, so healthy requests
//!    behind it are reconciled even with a batch of one.
//! 2. An unreadable report is deferred the same way.
//! 3. A retryable abort is not deferred; the request is tried on the next poll.
//! 4. An in-flight request moves to the back of the queue.
//!
//! All tests are pure in-process; no DB or network required.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use conveyor_daemon::{Poller, PollerSettings};
use conveyor_reconcile::{CatalogError, NotificationKind, RawTransferResponse, ReconcileEngine};
use conveyor_schemas::RequestState;
use conveyor_testkit::fixtures::{notice_settings, MemEngine, DEST_URL, SOURCE_URL};
use conveyor_testkit::{
    seed_transfer, InMemoryCatalog, Op, RecordingEmitter, RecordingLog, RecordingMetrics, Seeded,
};
use conveyor_transfertool::{TransferTool, TransferToolError};

// ---------------------------------------------------------------------------
// Stub transfer tool
// ---------------------------------------------------------------------------

#[derive(Default)]
struct StubTool {
    reports: Mutex<HashMap<String, RawTransferResponse>>,
}

impl StubTool {
    fn report(&self, seeded: &Seeded, state: &str) {
        let job_id = seeded.request.external_id.clone().unwrap();
        let raw = RawTransferResponse {
            job_id: job_id.clone(),
            file_state: Some(state.to_string()),
            source_surl: Some(SOURCE_URL.to_string()),
            dest_surl: Some(DEST_URL.to_string()),
            start_time: Some("2024-01-01T00:00:00".to_string()),
            finish_time: Some("2024-01-01T00:01:00".to_string()),
            ..Default::default()
        };
        self.reports.lock().unwrap().insert(job_id, raw);
    }
}

#[async_trait]
impl TransferTool for StubTool {
    fn name(&self) -> &'static str {
        "stub"
    }

    async fn query(&self, external_id: &str) -> Result<RawTransferResponse, TransferToolError> {
        self.reports
            .lock()
            .unwrap()
            .get(external_id)
            .cloned()
            .ok_or_else(|| TransferToolError::Api {
                status: 500,
                message: format!("no stubbed report for {external_id}"),
            })
    }
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

type MemPoller =
    Poller<InMemoryCatalog, RecordingEmitter, RecordingMetrics, RecordingLog, StubTool>;

struct Rig {
    poller: Arc<MemPoller>,
    catalog: InMemoryCatalog,
    emitter: RecordingEmitter,
    tool: Arc<StubTool>,
}

/// One request per poll, one at a time: whatever sits at the head of the
/// queue is the only thing a poll looks at.
fn rig() -> Rig {
    let catalog = InMemoryCatalog::new(3);
    let emitter = RecordingEmitter::new();
    let engine: MemEngine = ReconcileEngine::new(
        catalog.clone(),
        emitter.clone(),
        RecordingMetrics::new(),
        RecordingLog::new(),
        notice_settings(),
    );
    let tool = Arc::new(StubTool::default());
    let poller = Arc::new(Poller::new(
        Arc::new(engine),
        Arc::clone(&tool),
        PollerSettings {
            batch_size: 1,
            max_in_flight: 1,
            poll_interval: Duration::from_millis(10),
            defer_for: Duration::from_secs(3600),
        },
    ));
    Rig {
        poller,
        catalog,
        emitter,
        tool,
    }
}

async fn poll_times(r: &Rig, n: usize) {
    for _ in 0..n {
        r.poller.run_once().await.unwrap();
    }
}

// ---------------------------------------------------------------------------
// 1. Non-retryable abort
// ---------------------------------------------------------------------------

#[tokio::test]
async fn removed_destination_does_not_block_healthy_request() {
    let r = rig();
    let poisoned = seed_transfer(&r.catalog, "poisoned.root", 0).await;
    let healthy = seed_transfer(&r.catalog, "healthy.root", 0).await;
    let dst = poisoned.dst_rse_id;
    r.catalog
        .seed(move |s| {
            s.rses.remove(&dst);
        })
        .await;
    r.tool.report(&poisoned, "FINISHED");
    r.tool.report(&healthy, "FINISHED");

    let first = r.poller.run_once().await.unwrap();
    assert_eq!(first.aborted, 1);
    poll_times(&r, 2).await;

    let snap = r.catalog.snapshot().await;
    assert!(snap.archived(healthy.request.request_id).is_some());
    assert_eq!(
        snap.requests[&poisoned.request.request_id].state,
        RequestState::Submitted
    );
    assert!(snap.deferred_until.contains_key(&poisoned.request.request_id));
    assert_eq!(r.emitter.count(NotificationKind::TransferDone), 1);

    // Deferred and nothing else pending: later polls are empty.
    let idle = r.poller.run_once().await.unwrap();
    assert_eq!(idle.total(), 0);
}

// ---------------------------------------------------------------------------
// 2. Unreadable report
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unreadable_report_does_not_block_healthy_request() {
    let r = rig();
    let garbled = seed_transfer(&r.catalog, "garbled.root", 0).await;
    let healthy = seed_transfer(&r.catalog, "healthy.root", 0).await;
    r.tool.report(&garbled, "EXPLODED");
    r.tool.report(&healthy, "FINISHED");

    let first = r.poller.run_once().await.unwrap();
    assert_eq!(first.errors, 1);
    poll_times(&r, 2).await;

    let snap = r.catalog.snapshot().await;
    assert!(snap.archived(healthy.request.request_id).is_some());
    assert_eq!(
        snap.requests[&garbled.request.request_id].state,
        RequestState::Submitted
    );
    assert!(snap.deferred_until.contains_key(&garbled.request.request_id));
}

// ---------------------------------------------------------------------------
// 3. Retryable abort stays put
// ---------------------------------------------------------------------------

#[tokio::test]
async fn retryable_abort_is_not_deferred() {
    let r = rig();
    let seeded = seed_transfer(&r.catalog, "flaky.root", 0).await;
    r.tool.report(&seeded, "FINISHED");
    r.catalog.inject(
        Op::UpdateReplicaState,
        CatalogError::Transient("deadlock detected".to_string()),
    );

    let summary = r.poller.run_once().await.unwrap();
    assert_eq!(summary.aborted, 1);
    assert!(!r.catalog.calls().contains(&Op::Defer));
    assert!(r.catalog.snapshot().await.deferred_until.is_empty());

    r.catalog.clear_faults();
    let summary = r.poller.run_once().await.unwrap();
    assert_eq!(summary.committed, 1);
}

// ---------------------------------------------------------------------------
// 4. In-flight rotates
// ---------------------------------------------------------------------------

#[tokio::test]
async fn in_flight_request_rotates_to_the_back() {
    let r = rig();
    let active = seed_transfer(&r.catalog, "active.root", 0).await;
    let done = seed_transfer(&r.catalog, "done.root", 0).await;
    r.tool.report(&active, "ACTIVE");
    r.tool.report(&done, "FINISHED");

    let first = r.poller.run_once().await.unwrap();
    assert_eq!(first.skipped, 1);
    let second = r.poller.run_once().await.unwrap();
    assert_eq!(second.committed, 1);

    let snap = r.catalog.snapshot().await;
    assert!(snap.archived(done.request.request_id).is_some());

    // Zero delay: the in-flight request is eligible again straight away.
    let pending = snap.requests[&active.request.request_id].clone();
    assert_eq!(pending.state, RequestState::Submitted);
    let third = r.poller.run_once().await.unwrap();
    assert_eq!(third.skipped, 1);
}
