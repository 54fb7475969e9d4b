//! Poll loop: discover submitted requests, ask the transfer tool for their
//! status and reconcile every report that carries a transition.
//!
//! One request is one transaction:
//!
//! ```text
//! query tool ─► normalize ─► begin ─► claim ─► reconcile ─► commit | rollback
//! ```
//!
//! The tool is queried before the row is claimed so no row lock is held across
//! network IO. `claim` re-reads the row under lock, so a request that another
//! worker settled in the meantime is skipped rather than reconciled twice.
//!
//! Requests that cannot settle this poll are moved out of the head of the
//! queue through [`WorkQueue::defer`]: in-flight ones to the back, unreadable
//! reports and non-retryable aborts for `defer_for`. Retryable aborts stay put
//! and are tried again on the next poll.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use conveyor_reconcile::{
    normalize, MetricsRecorder, NotificationEmitter, ReconcileEngine, ReconcileLog, WorkQueue,
};
use conveyor_schemas::{Request, RequestId};
use conveyor_transfertool::TransferTool;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Settings / results
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PollerSettings {
    /// Requests fetched per poll.
    pub batch_size: usize,
    /// Reconciliations running at once.
    pub max_in_flight: usize,
    pub poll_interval: Duration,
    /// How long a request that cannot be settled without intervention is
    /// held back from polling.
    pub defer_for: Duration,
}

impl Default for PollerSettings {
    fn default() -> Self {
        Self {
            batch_size: 100,
            max_in_flight: 8,
            poll_interval: Duration::from_secs(30),
            defer_for: Duration::from_secs(3600),
        }
    }
}

/// What happened to one fetched request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ItemResult {
    /// Reconciled and committed.
    Committed,
    /// The engine asked for a rollback.
    Aborted,
    /// Still in flight, claimed elsewhere or no longer live.
    Skipped,
    /// Tool, normalizer or transaction failure before a decision was made.
    Error,
}

/// Per-poll counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PollSummary {
    pub committed: usize,
    pub aborted: usize,
    pub skipped: usize,
    pub errors: usize,
}

impl PollSummary {
    pub fn total(&self) -> usize {
        self.committed + self.aborted + self.skipped + self.errors
    }

    fn record(&mut self, result: ItemResult) {
        match result {
            ItemResult::Committed => self.committed += 1,
            ItemResult::Aborted => self.aborted += 1,
            ItemResult::Skipped => self.skipped += 1,
            ItemResult::Error => self.errors += 1,
        }
    }
}

// ---------------------------------------------------------------------------
// Poller
// ---------------------------------------------------------------------------

pub struct Poller<C, E, M, L, T> {
    engine: Arc<ReconcileEngine<C, E, M, L>>,
    tool: Arc<T>,
    settings: PollerSettings,
}

impl<C, E, M, L, T> Poller<C, E, M, L, T>
where
    C: WorkQueue + 'static,
    E: NotificationEmitter<C::Tx> + 'static,
    M: MetricsRecorder + 'static,
    L: ReconcileLog + 'static,
    T: TransferTool + 'static,
{
    pub fn new(
        engine: Arc<ReconcileEngine<C, E, M, L>>,
        tool: Arc<T>,
        settings: PollerSettings,
    ) -> Self {
        Self {
            engine,
            tool,
            settings,
        }
    }

    pub fn settings(&self) -> &PollerSettings {
        &self.settings
    }

    /// One poll: fetch up to `batch_size` submitted requests and process them
    /// with at most `max_in_flight` running at once.
    ///
    /// Only a failed fetch is an error; per-request failures are counted.
    pub async fn run_once(self: &Arc<Self>) -> Result<PollSummary> {
        let pending = self
            .engine
            .catalog()
            .fetch_pending(self.settings.batch_size)
            .await
            .context("fetch pending requests failed")?;

        let mut summary = PollSummary::default();
        if pending.is_empty() {
            return Ok(summary);
        }

        let permits = Arc::new(Semaphore::new(self.settings.max_in_flight.max(1)));
        let mut tasks = JoinSet::new();
        for request in pending {
            let permit = Arc::clone(&permits)
                .acquire_owned()
                .await
                .context("poll semaphore closed")?;
            let this = Arc::clone(self);
            tasks.spawn(async move {
                let result = this.process(request).await;
                drop(permit);
                result
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(result) => summary.record(result),
                Err(e) => {
                    warn!(error = %e, "reconcile task panicked or was cancelled");
                    summary.record(ItemResult::Error);
                }
            }
        }

        info!(
            committed = summary.committed,
            aborted = summary.aborted,
            skipped = summary.skipped,
            errors = summary.errors,
            "poll complete"
        );
        Ok(summary)
    }

    /// Poll every `poll_interval` until `shutdown` resolves. A poll in
    /// progress is finished before returning.
    pub async fn run<F>(self: Arc<Self>, shutdown: F)
    where
        F: std::future::Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut ticker = tokio::time::interval(self.settings.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("shutdown requested, poll loop stopping");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.run_once().await {
                        warn!(error = %format!("{e:#}"), "poll failed");
                    }
                }
            }
        }
    }

    async fn process(&self, request: Request) -> ItemResult {
        let id = request.request_id;
        let Some(external_id) = request.external_id.as_deref() else {
            debug!(request_id = %id, "request has no transfer id yet");
            return ItemResult::Skipped;
        };

        let raw = match self.tool.query(external_id).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(request_id = %id, external_id, tool = self.tool.name(), error = %e, "transfer status query failed");
                return ItemResult::Error;
            }
        };

        let outcome = match normalize(&raw) {
            Ok(Some(outcome)) => outcome,
            Ok(None) => return self.defer(id, Duration::ZERO, ItemResult::Skipped).await,
            Err(e) => {
                warn!(request_id = %id, external_id, error = %e, "transfer report rejected");
                return self.defer(id, self.settings.defer_for, ItemResult::Error).await;
            }
        };

        let catalog = self.engine.catalog();
        let mut tx = match catalog.begin().await {
            Ok(tx) => tx,
            Err(e) => {
                warn!(request_id = %id, error = %e, "begin failed");
                return ItemResult::Error;
            }
        };

        let claimed = match catalog.claim(&mut tx, id).await {
            Ok(Some(claimed)) => claimed,
            Ok(None) => {
                debug!(request_id = %id, "request claimed elsewhere or no longer live");
                return self.rollback(tx, ItemResult::Skipped).await;
            }
            Err(e) => {
                warn!(request_id = %id, error = %e, "claim failed");
                return self.rollback(tx, ItemResult::Error).await;
            }
        };

        match self.engine.reconcile(&mut tx, &claimed, &outcome).await {
            Ok(committed) => match catalog.commit(tx).await {
                Ok(()) => {
                    debug!(request_id = %id, ?committed, "reconciliation committed");
                    ItemResult::Committed
                }
                Err(e) => {
                    warn!(request_id = %id, error = %e, "commit failed");
                    ItemResult::Error
                }
            },
            Err(aborted) => {
                warn!(
                    request_id = %id,
                    retryable = aborted.is_retryable(),
                    reason = %aborted.reason,
                    "reconciliation aborted"
                );
                let result = self.rollback(tx, ItemResult::Aborted).await;
                if aborted.is_retryable() {
                    result
                } else {
                    self.defer(id, self.settings.defer_for, result).await
                }
            }
        }
    }

    async fn defer(&self, id: RequestId, delay: Duration, result: ItemResult) -> ItemResult {
        match self.engine.catalog().defer(id, delay).await {
            Ok(()) => {
                if !delay.is_zero() {
                    info!(request_id = %id, defer_secs = delay.as_secs(), "request deferred");
                }
                result
            }
            Err(e) => {
                warn!(request_id = %id, error = %e, "defer failed");
                ItemResult::Error
            }
        }
    }

    async fn rollback(&self, tx: C::Tx, result: ItemResult) -> ItemResult {
        if let Err(e) = self.engine.catalog().rollback(tx).await {
            warn!(error = %e, "rollback failed");
            return ItemResult::Error;
        }
        result
    }
}
