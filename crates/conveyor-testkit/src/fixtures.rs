//! Seed data and engine wiring shared by scenario tests.

use chrono::NaiveDateTime;
use conveyor_reconcile::{
    Aborted, Committed, NoticeSettings, Outcome, ReconcileEngine, WorkQueue,
};
use conveyor_schemas::{
    DidMeta, LockState, ReplicaState, Request, RequestDetails, RequestId, RequestState, RseId,
};

use crate::{InMemoryCatalog, RecordingEmitter, RecordingLog, RecordingMetrics};

pub const DST_RSE: &str = "DST_DISK";
pub const SRC_RSE: &str = "SRC_DISK";
pub const SCOPE: &str = "data24";
pub const TRANSFER_ENDPOINT: &str = "https://fts.example:8449";
pub const DEST_URL: &str = "https://dst.example:443/data24/file.root";
pub const SOURCE_URL: &str = "root://src.example:1094//data24/file.root";

pub type MemEngine = ReconcileEngine<InMemoryCatalog, RecordingEmitter, RecordingMetrics, RecordingLog>;

/// Engine plus shared handles to every double it was built with.
pub struct Harness {
    pub engine: MemEngine,
    pub catalog: InMemoryCatalog,
    pub emitter: RecordingEmitter,
    pub metrics: RecordingMetrics,
    pub log: RecordingLog,
}

impl Harness {
    pub fn new(catalog: InMemoryCatalog) -> Self {
        let emitter = RecordingEmitter::new();
        let metrics = RecordingMetrics::new();
        let log = RecordingLog::new();
        let engine = ReconcileEngine::new(
            catalog.clone(),
            emitter.clone(),
            metrics.clone(),
            log.clone(),
            notice_settings(),
        );
        Self {
            engine,
            catalog,
            emitter,
            metrics,
            log,
        }
    }

    /// One reconciliation in its own transaction, committed or rolled back
    /// according to the engine's answer.
    pub async fn settle(
        &self,
        request: &Request,
        outcome: &Outcome,
    ) -> Result<Committed, Aborted> {
        let mut tx = self.catalog.begin().await.expect("begin");
        let result = self.engine.reconcile(&mut tx, request, outcome).await;
        match result {
            Ok(_) => self.catalog.commit(tx).await.expect("commit"),
            Err(_) => self.catalog.rollback(tx).await.expect("rollback"),
        }
        result
    }
}

pub fn notice_settings() -> NoticeSettings {
    NoticeSettings {
        activity: "default".to_string(),
        tool_id: "conveyor-test".to_string(),
        transfer_endpoint: TRANSFER_ENDPOINT.to_string(),
    }
}

pub fn ts(s: &str) -> NaiveDateTime {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S").expect("fixture timestamp")
}

/// Outcome as the normalizer would produce it: 330 s transfer to [`DEST_URL`].
pub fn outcome(new_state: RequestState) -> Outcome {
    Outcome {
        new_state,
        transfer_id: "job-0001".to_string(),
        details: RequestDetails {
            source_surl: Some(SOURCE_URL.to_string()),
            dest_surl: Some(DEST_URL.to_string()),
            start_time: Some(ts("2024-01-01T00:00:00")),
            finish_time: Some(ts("2024-01-01T00:05:30")),
            reason: match new_state {
                RequestState::Failed => Some("TRANSFER checksum mismatch".to_string()),
                _ => None,
            },
        },
    }
}

/// Identifiers of a seeded transfer.
#[derive(Clone, Debug)]
pub struct Seeded {
    pub request: Request,
    pub dst_rse_id: RseId,
    pub src_rse_id: RseId,
}

/// Seed one SUBMITTED request for `SCOPE:name` from SRC to DST with the
/// usual surroundings: both RSEs, DID metadata, one detail row, a COPYING
/// replica and a REPLICATING lock at the destination.
pub async fn seed_transfer(catalog: &InMemoryCatalog, name: &str, retry_count: u32) -> Seeded {
    let dst_rse_id = RseId::new_v4();
    let src_rse_id = RseId::new_v4();
    let request = Request {
        request_id: RequestId::new_v4(),
        scope: SCOPE.to_string(),
        name: name.to_string(),
        dest_rse_id: dst_rse_id,
        source_rse_id: Some(src_rse_id),
        retry_count,
        previous_attempt_id: None,
        state: RequestState::Submitted,
        external_id: Some(format!("job-{name}")),
        activity: Some("User Subscriptions".to_string()),
    };

    let req = request.clone();
    catalog
        .seed(move |s| {
            s.rses.insert(dst_rse_id, DST_RSE.to_string());
            s.rses.insert(src_rse_id, SRC_RSE.to_string());
            s.dids.insert(
                (req.scope.clone(), req.name.clone()),
                DidMeta {
                    bytes: Some(2_048),
                    guid: Some("a1b2c3".to_string()),
                    adler32: Some("0badc0de".to_string()),
                    md5: Some("d41d8cd98f00b204e9800998ecf8427e".to_string()),
                },
            );
            s.details.insert(
                req.request_id,
                vec![RequestDetails {
                    source_surl: Some(SOURCE_URL.to_string()),
                    dest_surl: Some(DEST_URL.to_string()),
                    ..Default::default()
                }],
            );
            s.replicas.insert(
                (req.scope.clone(), req.name.clone(), DST_RSE.to_string()),
                ReplicaState::Copying,
            );
            s.locks.insert(
                (req.scope.clone(), req.name.clone(), dst_rse_id),
                LockState::Replicating,
            );
            s.touch(req.request_id);
            s.requests.insert(req.request_id, req);
        })
        .await;

    Seeded {
        request,
        dst_rse_id,
        src_rse_id,
    }
}
