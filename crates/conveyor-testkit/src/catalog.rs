//! In-memory catalog with transaction staging and fault injection.
//!
//! `begin` takes the single writer lock and clones the committed state into
//! the transaction; every catalog call works on that staged copy; `commit`
//! writes it back and `rollback` drops it. Transactions are therefore fully
//! serialized, which is stricter than Postgres but yields the same observable
//! commit/rollback behaviour for one request at a time.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conveyor_reconcile::{Catalog, CatalogError, Notification, WorkQueue};
use conveyor_schemas::{
    DidMeta, LockState, ReplicaState, Request, RequestDetails, RequestId, RequestState, RseId,
};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Catalog operations, used for call recording and fault injection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Op {
    GetEndpointName,
    GetDidMeta,
    SetRequestState,
    GetRequestDetails,
    ArchiveRequest,
    RequeueAndArchive,
    ResolveLockSuccess,
    ResolveLockFailure,
    UpdateReplicaState,
    Begin,
    Commit,
    FetchPending,
    Claim,
    Defer,
}

/// Full catalog content. Public so tests can seed and inspect it directly.
#[derive(Clone, Debug, Default)]
pub struct CatalogState {
    pub rses: BTreeMap<RseId, String>,
    pub dids: BTreeMap<(String, String), DidMeta>,
    pub requests: BTreeMap<RequestId, Request>,
    pub history: Vec<Request>,
    pub details: BTreeMap<RequestId, Vec<RequestDetails>>,
    /// Keyed by (scope, name, RSE name).
    pub replicas: BTreeMap<(String, String, String), ReplicaState>,
    /// Keyed by (scope, name, RSE id).
    pub locks: BTreeMap<(String, String, RseId), LockState>,
    /// Transactional outbox, see [`crate::MemOutbox`].
    pub messages: Vec<Notification>,
    /// Queue position (lower polls first); stands in for `updated_at`.
    pub touched: BTreeMap<RequestId, u64>,
    /// Requests held back from `fetch_pending` until the given instant.
    pub deferred_until: BTreeMap<RequestId, DateTime<Utc>>,
}

impl CatalogState {
    pub fn replica(&self, scope: &str, name: &str, rse: &str) -> Option<ReplicaState> {
        self.replicas
            .get(&(scope.to_string(), name.to_string(), rse.to_string()))
            .copied()
    }

    pub fn lock(&self, scope: &str, name: &str, rse_id: RseId) -> Option<LockState> {
        self.locks
            .get(&(scope.to_string(), name.to_string(), rse_id))
            .copied()
    }

    pub fn archived(&self, id: RequestId) -> Option<&Request> {
        self.history.iter().find(|r| r.request_id == id)
    }

    /// Move `id` to the back of the queue.
    pub fn touch(&mut self, id: RequestId) {
        let next = self.touched.values().max().map_or(1, |v| v + 1);
        self.touched.insert(id, next);
    }

    fn archive(&mut self, id: RequestId) -> Result<Request, CatalogError> {
        let req = self
            .requests
            .remove(&id)
            .ok_or_else(|| CatalogError::NotFound(format!("request {id}")))?;
        self.history.push(req.clone());
        Ok(req)
    }
}

/// Staged transaction. Holds the writer lock until commit or rollback.
pub struct MemTx {
    guard: OwnedMutexGuard<CatalogState>,
    pub staged: CatalogState,
}

#[derive(Clone)]
pub struct InMemoryCatalog {
    state: Arc<AsyncMutex<CatalogState>>,
    max_retries: u32,
    faults: Arc<Mutex<BTreeMap<Op, CatalogError>>>,
    calls: Arc<Mutex<Vec<Op>>>,
    /// Rows "locked by another worker": `claim` skips them.
    held: Arc<Mutex<BTreeSet<RequestId>>>,
}

impl InMemoryCatalog {
    pub fn new(max_retries: u32) -> Self {
        Self::with_state(CatalogState::default(), max_retries)
    }

    pub fn with_state(state: CatalogState, max_retries: u32) -> Self {
        Self {
            state: Arc::new(AsyncMutex::new(state)),
            max_retries,
            faults: Arc::new(Mutex::new(BTreeMap::new())),
            calls: Arc::new(Mutex::new(Vec::new())),
            held: Arc::new(Mutex::new(BTreeSet::new())),
        }
    }

    /// Committed state. Must not be called while a transaction is open on the
    /// same task.
    pub async fn snapshot(&self) -> CatalogState {
        self.state.lock().await.clone()
    }

    /// Mutate committed state outside any transaction.
    pub async fn seed<F: FnOnce(&mut CatalogState)>(&self, f: F) {
        f(&mut *self.state.lock().await)
    }

    /// Every call to `op` fails with `err` until [`clear_faults`](Self::clear_faults).
    pub fn inject(&self, op: Op, err: CatalogError) {
        self.faults.lock().unwrap().insert(op, err);
    }

    pub fn clear_faults(&self) {
        self.faults.lock().unwrap().clear();
    }

    pub fn calls(&self) -> Vec<Op> {
        self.calls.lock().unwrap().clone()
    }

    pub fn reset_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    pub fn hold_row(&self, id: RequestId) {
        self.held.lock().unwrap().insert(id);
    }

    pub fn release_row(&self, id: RequestId) {
        self.held.lock().unwrap().remove(&id);
    }

    fn enter(&self, op: Op) -> Result<(), CatalogError> {
        self.calls.lock().unwrap().push(op);
        match self.faults.lock().unwrap().get(&op) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

fn key(scope: &str, name: &str) -> (String, String) {
    (scope.to_string(), name.to_string())
}

#[async_trait]
impl Catalog for InMemoryCatalog {
    type Tx = MemTx;

    async fn get_endpoint_name(
        &self,
        tx: &mut MemTx,
        rse_id: RseId,
    ) -> Result<String, CatalogError> {
        self.enter(Op::GetEndpointName)?;
        tx.staged
            .rses
            .get(&rse_id)
            .cloned()
            .ok_or_else(|| CatalogError::NotFound(format!("RSE {rse_id}")))
    }

    async fn get_did_meta(
        &self,
        tx: &mut MemTx,
        scope: &str,
        name: &str,
    ) -> Result<DidMeta, CatalogError> {
        self.enter(Op::GetDidMeta)?;
        tx.staged
            .dids
            .get(&key(scope, name))
            .cloned()
            .ok_or_else(|| CatalogError::NotFound(format!("DID {scope}:{name}")))
    }

    async fn set_request_state(
        &self,
        tx: &mut MemTx,
        request_id: RequestId,
        state: RequestState,
    ) -> Result<RequestState, CatalogError> {
        self.enter(Op::SetRequestState)?;
        let req = tx
            .staged
            .requests
            .get_mut(&request_id)
            .ok_or_else(|| CatalogError::NotFound(format!("request {request_id}")))?;
        Ok(std::mem::replace(&mut req.state, state))
    }

    async fn get_request_details(
        &self,
        tx: &mut MemTx,
        request_id: RequestId,
    ) -> Result<Vec<RequestDetails>, CatalogError> {
        self.enter(Op::GetRequestDetails)?;
        Ok(tx
            .staged
            .details
            .get(&request_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn archive_request(
        &self,
        tx: &mut MemTx,
        request_id: RequestId,
    ) -> Result<(), CatalogError> {
        self.enter(Op::ArchiveRequest)?;
        tx.staged.archive(request_id).map(|_| ())
    }

    async fn requeue_and_archive(
        &self,
        tx: &mut MemTx,
        request_id: RequestId,
    ) -> Result<Option<Request>, CatalogError> {
        self.enter(Op::RequeueAndArchive)?;
        let old = tx.staged.archive(request_id)?;
        if old.retry_count >= self.max_retries {
            return Ok(None);
        }
        let next = Request {
            request_id: RequestId::new_v4(),
            retry_count: old.retry_count + 1,
            previous_attempt_id: Some(old.request_id),
            state: RequestState::Queued,
            external_id: None,
            ..old
        };
        tx.staged.touch(next.request_id);
        tx.staged.requests.insert(next.request_id, next.clone());
        Ok(Some(next))
    }

    async fn resolve_lock_success(
        &self,
        tx: &mut MemTx,
        scope: &str,
        name: &str,
        rse_id: RseId,
    ) -> Result<(), CatalogError> {
        self.enter(Op::ResolveLockSuccess)?;
        if let Some(lock) = tx
            .staged
            .locks
            .get_mut(&(scope.to_string(), name.to_string(), rse_id))
        {
            *lock = LockState::Ok;
        }
        Ok(())
    }

    async fn resolve_lock_failure(
        &self,
        tx: &mut MemTx,
        scope: &str,
        name: &str,
        rse_id: RseId,
    ) -> Result<(), CatalogError> {
        self.enter(Op::ResolveLockFailure)?;
        if let Some(lock) = tx
            .staged
            .locks
            .get_mut(&(scope.to_string(), name.to_string(), rse_id))
        {
            *lock = LockState::Stuck;
        }
        Ok(())
    }

    async fn update_replica_state(
        &self,
        tx: &mut MemTx,
        scope: &str,
        name: &str,
        rse: &str,
        state: ReplicaState,
    ) -> Result<(), CatalogError> {
        self.enter(Op::UpdateReplicaState)?;
        match tx
            .staged
            .replicas
            .get_mut(&(scope.to_string(), name.to_string(), rse.to_string()))
        {
            Some(replica) => {
                *replica = state;
                Ok(())
            }
            None => Err(CatalogError::UnsupportedOperation(format!(
                "replica {scope}:{name} at {rse} does not exist"
            ))),
        }
    }
}

#[async_trait]
impl WorkQueue for InMemoryCatalog {
    async fn begin(&self) -> Result<MemTx, CatalogError> {
        self.enter(Op::Begin)?;
        let guard = self.state.clone().lock_owned().await;
        let staged = guard.clone();
        Ok(MemTx { guard, staged })
    }

    async fn commit(&self, tx: MemTx) -> Result<(), CatalogError> {
        self.enter(Op::Commit)?;
        let MemTx { mut guard, staged } = tx;
        *guard = staged;
        Ok(())
    }

    async fn rollback(&self, tx: MemTx) -> Result<(), CatalogError> {
        drop(tx);
        Ok(())
    }

    async fn fetch_pending(&self, limit: usize) -> Result<Vec<Request>, CatalogError> {
        self.enter(Op::FetchPending)?;
        let state = self.state.lock().await;
        let now = Utc::now();
        let mut pending: Vec<&Request> = state
            .requests
            .values()
            .filter(|r| r.state == RequestState::Submitted && r.external_id.is_some())
            .filter(|r| {
                state
                    .deferred_until
                    .get(&r.request_id)
                    .map_or(true, |until| *until <= now)
            })
            .collect();
        pending.sort_by_key(|r| {
            let touched = state.touched.get(&r.request_id).copied().unwrap_or(0);
            (touched, r.request_id)
        });
        Ok(pending.into_iter().take(limit).cloned().collect())
    }

    async fn claim(
        &self,
        tx: &mut MemTx,
        request_id: RequestId,
    ) -> Result<Option<Request>, CatalogError> {
        self.enter(Op::Claim)?;
        if self.held.lock().unwrap().contains(&request_id) {
            return Ok(None);
        }
        Ok(tx
            .staged
            .requests
            .get(&request_id)
            .filter(|r| r.state == RequestState::Submitted)
            .cloned())
    }

    async fn defer(&self, request_id: RequestId, delay: Duration) -> Result<(), CatalogError> {
        self.enter(Op::Defer)?;
        let mut state = self.state.lock().await;
        let submitted = state
            .requests
            .get(&request_id)
            .is_some_and(|r| r.state == RequestState::Submitted);
        if submitted {
            let delay = chrono::Duration::from_std(delay)
                .unwrap_or_else(|_| chrono::Duration::days(36_500));
            state.deferred_until.insert(request_id, Utc::now() + delay);
            state.touch(request_id);
        }
        Ok(())
    }
}
