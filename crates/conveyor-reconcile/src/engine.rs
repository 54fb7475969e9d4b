use std::time::Instant;

use conveyor_schemas::{ReplicaState, Request, RequestDetails, RequestId, RequestState};

use crate::notice::{NoticeContext, NoticeSettings, Notification, NotificationKind};
use crate::ports::{
    Catalog, CatalogError, MetricsRecorder, NotificationEmitter, ReconcileLog, Severity,
};
use crate::{AbortReason, Aborted, Committed, LockResolution, Outcome, Step};

const METRIC_PREFIX: &str = "conveyor.reconcile";

/// Applies normalized transfer outcomes to the catalog.
///
/// Holds no per-request state; one engine may serve many concurrent
/// reconciliations as long as the caller serializes work on the same request.
pub struct ReconcileEngine<C, E, M, L> {
    catalog: C,
    emitter: E,
    metrics: M,
    log: L,
    settings: NoticeSettings,
}

impl<C, E, M, L> ReconcileEngine<C, E, M, L>
where
    C: Catalog,
    E: NotificationEmitter<C::Tx>,
    M: MetricsRecorder,
    L: ReconcileLog,
{
    pub fn new(catalog: C, emitter: E, metrics: M, log: L, settings: NoticeSettings) -> Self {
        Self {
            catalog,
            emitter,
            metrics,
            log,
            settings,
        }
    }

    pub fn catalog(&self) -> &C {
        &self.catalog
    }

    pub fn settings(&self) -> &NoticeSettings {
        &self.settings
    }

    /// Reconcile one outcome inside the caller's transaction `tx`.
    ///
    /// `Ok` means commit `tx`; `Err` means roll it back. Catalog and emitter
    /// failures never escape as errors of their own: each is logged and
    /// turned into an [`Aborted`] carrying its [`AbortReason`].
    ///
    /// Precondition: `request` is live and nobody else is reconciling it.
    pub async fn reconcile(
        &self,
        tx: &mut C::Tx,
        request: &Request,
        outcome: &Outcome,
    ) -> Result<Committed, Aborted> {
        let id = request.request_id;
        self.log.log(
            Severity::Debug,
            id,
            &format!(
                "updating request {id} DID {} to {}",
                request.did(),
                outcome.new_state
            ),
        );

        // Destination name first: every later step needs it.
        let started = Instant::now();
        let dst_rse = match self.catalog.get_endpoint_name(tx, request.dest_rse_id).await {
            Ok(name) => name,
            Err(CatalogError::NotFound(_)) => {
                return Err(self.abort(
                    id,
                    Severity::Warning,
                    "cannot proceed updating the state for this request",
                    AbortReason::EndpointNotFound {
                        rse_id: request.dest_rse_id,
                    },
                ))
            }
            Err(error) => {
                return Err(self.abort(
                    id,
                    Severity::Warning,
                    "destination RSE lookup failed",
                    AbortReason::Catalog {
                        step: Step::EndpointLookup,
                        error,
                    },
                ))
            }
        };
        self.timer("rse-get_endpoint_name", started);

        let started = Instant::now();
        let meta = self
            .catalog
            .get_did_meta(tx, &request.scope, &request.name)
            .await
            .map_err(|error| {
                self.abort(
                    id,
                    Severity::Warning,
                    "could not read DID metadata",
                    AbortReason::Catalog {
                        step: Step::DidMetadata,
                        error,
                    },
                )
            })?;
        self.timer("did-get_metadata", started);

        // The persisted state is the record of "this outcome was observed".
        let started = Instant::now();
        let previous = match self
            .catalog
            .set_request_state(tx, id, outcome.new_state)
            .await
        {
            Ok(previous) => previous,
            Err(CatalogError::NotFound(_)) => {
                return Err(self.abort(
                    id,
                    Severity::Warning,
                    "cannot set request state",
                    AbortReason::RequestNotLive,
                ))
            }
            Err(error) => {
                return Err(self.abort(
                    id,
                    Severity::Warning,
                    "cannot set request state",
                    AbortReason::Catalog {
                        step: Step::SetState,
                        error,
                    },
                ))
            }
        };
        self.timer("request-set_request_state", started);

        // Only LOST can repeat here: DONE and FAILED archive the row in this transaction.
        if previous == outcome.new_state && previous.is_terminal() {
            self.log.log(
                Severity::Info,
                id,
                &format!("request {id} already {previous}, outcome ignored"),
            );
            return Ok(Committed::AlreadyObserved);
        }

        let details = outcome
            .details
            .clone()
            .or(self.request_details(tx, id).await);
        let src_rse = self.source_rse_name(tx, request).await;

        let ctx = NoticeContext {
            settings: &self.settings,
            request,
            dst_rse: &dst_rse,
            src_rse: src_rse.as_deref(),
            meta: &meta,
            details: &details,
            transfer_id: &outcome.transfer_id,
        };

        let committed = match outcome.new_state {
            RequestState::Done => self.on_done(tx, request, &ctx).await?,
            RequestState::Failed => self.on_failed(tx, request, &ctx).await?,
            RequestState::Lost => self.on_lost(tx, request, &ctx).await?,
            RequestState::Queued | RequestState::Submitted => Committed::StateRecorded,
        };

        self.log.log(
            Severity::Info,
            id,
            &format!(
                "updated request {id} DID {} at {dst_rse} to {}",
                request.did(),
                outcome.new_state
            ),
        );
        Ok(committed)
    }

    // -----------------------------------------------------------------------
    // Terminal branches
    // -----------------------------------------------------------------------

    async fn on_done(
        &self,
        tx: &mut C::Tx,
        request: &Request,
        ctx: &NoticeContext<'_>,
    ) -> Result<Committed, Aborted> {
        let id = request.request_id;

        // Lock and replica move together: no replica update without the lock.
        let started = Instant::now();
        if let Err(error) = self
            .catalog
            .resolve_lock_success(tx, &request.scope, &request.name, request.dest_rse_id)
            .await
        {
            return Err(self.abort(
                id,
                Severity::Warning,
                &format!(
                    "could not update lock for successful transfer {} at {}",
                    request.did(),
                    ctx.dst_rse
                ),
                AbortReason::LockResolution {
                    resolution: LockResolution::Success,
                    error,
                },
            ));
        }
        self.timer("lock-successful_transfer", started);

        let started = Instant::now();
        match self
            .catalog
            .update_replica_state(
                tx,
                &request.scope,
                &request.name,
                ctx.dst_rse,
                ReplicaState::Available,
            )
            .await
        {
            Ok(()) => self.timer("replica-update_replicas_states", started),
            Err(CatalogError::UnsupportedOperation(msg)) => {
                // Replica deleted concurrently: archive and commit.
                self.archive(tx, request).await?;
                self.log.log(
                    Severity::Warning,
                    id,
                    &format!(
                        "replica {} at {} no longer exists, request archived without replica update: {msg}",
                        request.did(),
                        ctx.dst_rse
                    ),
                );
                return Ok(Committed::DoneReplicaMissing);
            }
            Err(error) => {
                return Err(self.abort(
                    id,
                    Severity::Warning,
                    &format!(
                        "could not mark replica {} available at {}",
                        request.did(),
                        ctx.dst_rse
                    ),
                    AbortReason::ReplicaUpdate { error },
                ))
            }
        }

        self.archive(tx, request).await?;
        self.emit(tx, id, &ctx.done()).await?;
        Ok(Committed::Done)
    }

    async fn on_failed(
        &self,
        tx: &mut C::Tx,
        request: &Request,
        ctx: &NoticeContext<'_>,
    ) -> Result<Committed, Aborted> {
        let id = request.request_id;

        let started = Instant::now();
        let successor = self
            .catalog
            .requeue_and_archive(tx, id)
            .await
            .map_err(|error| {
                self.abort(
                    id,
                    Severity::Warning,
                    "requeue failed",
                    AbortReason::Catalog {
                        step: Step::RequeueAndArchive,
                        error,
                    },
                )
            })?;
        self.timer("request-requeue_and_archive", started);

        match successor {
            Some(next) => {
                self.log.log(
                    Severity::Warning,
                    id,
                    &format!(
                        "requeued DID {} request {id} as {} try {}",
                        request.did(),
                        next.request_id,
                        next.retry_count
                    ),
                );
                Ok(Committed::Requeued {
                    successor: next.request_id,
                    retry_count: next.retry_count,
                })
            }
            None => {
                self.log.log(
                    Severity::Critical,
                    id,
                    &format!("exceeded retries DID {} request {id}", request.did()),
                );
                // Emitted before the lock: a lock failure below aborts with
                // the message already out, so delivery is at-least-once.
                self.emit(tx, id, &ctx.failure(NotificationKind::TransferFailed))
                    .await?;
                self.fail_lock(tx, request, ctx.dst_rse).await?;
                Ok(Committed::RetriesExceeded)
            }
        }
    }

    async fn on_lost(
        &self,
        tx: &mut C::Tx,
        request: &Request,
        ctx: &NoticeContext<'_>,
    ) -> Result<Committed, Aborted> {
        let id = request.request_id;
        self.fail_lock(tx, request, ctx.dst_rse).await?;
        self.emit(tx, id, &ctx.failure(NotificationKind::TransferLost))
            .await?;
        self.log.log(
            Severity::Critical,
            id,
            &format!("lost DID {} request {id}", request.did()),
        );
        Ok(Committed::Lost)
    }

    // -----------------------------------------------------------------------
    // Steps
    // -----------------------------------------------------------------------

    async fn fail_lock(
        &self,
        tx: &mut C::Tx,
        request: &Request,
        dst_rse: &str,
    ) -> Result<(), Aborted> {
        let started = Instant::now();
        self.catalog
            .resolve_lock_failure(tx, &request.scope, &request.name, request.dest_rse_id)
            .await
            .map_err(|error| {
                self.abort(
                    request.request_id,
                    Severity::Warning,
                    &format!(
                        "could not update lock for failed transfer {} at {dst_rse}",
                        request.did()
                    ),
                    AbortReason::LockResolution {
                        resolution: LockResolution::Failure,
                        error,
                    },
                )
            })?;
        self.timer("lock-failed_transfer", started);
        Ok(())
    }

    async fn archive(&self, tx: &mut C::Tx, request: &Request) -> Result<(), Aborted> {
        let started = Instant::now();
        self.catalog
            .archive_request(tx, request.request_id)
            .await
            .map_err(|error| {
                self.abort(
                    request.request_id,
                    Severity::Warning,
                    "archive failed",
                    AbortReason::Catalog {
                        step: Step::Archive,
                        error,
                    },
                )
            })?;
        self.timer("request-archive_request", started);
        Ok(())
    }

    async fn emit(
        &self,
        tx: &mut C::Tx,
        id: RequestId,
        notification: &Notification,
    ) -> Result<(), Aborted> {
        let started = Instant::now();
        self.emitter
            .emit(tx, notification)
            .await
            .map_err(|error| {
                self.abort(
                    id,
                    Severity::Warning,
                    "notification not enqueued",
                    AbortReason::Emit {
                        kind: notification.kind,
                        error,
                    },
                )
            })?;
        self.timer(&format!("message-{}", notification.kind.as_str()), started);
        Ok(())
    }

    /// Detail row for reporting. Missing rows degrade the notification, they
    /// do not abort.
    async fn request_details(&self, tx: &mut C::Tx, id: RequestId) -> RequestDetails {
        match self.catalog.get_request_details(tx, id).await {
            Ok(rows) => {
                if rows.len() != 1 {
                    self.log.log(
                        Severity::Warning,
                        id,
                        &format!(
                            "expected one transfer detail row, found {} - reporting will be missing values",
                            rows.len()
                        ),
                    );
                }
                rows.into_iter().next().unwrap_or_default()
            }
            Err(error) => {
                self.log.log(
                    Severity::Warning,
                    id,
                    &format!(
                        "could not read transfer details - reporting will be missing values: {error}"
                    ),
                );
                RequestDetails::default()
            }
        }
    }

    async fn source_rse_name(&self, tx: &mut C::Tx, request: &Request) -> Option<String> {
        let rse_id = request.source_rse_id?;
        match self.catalog.get_endpoint_name(tx, rse_id).await {
            Ok(name) => Some(name),
            Err(error) => {
                self.log.log(
                    Severity::Warning,
                    request.request_id,
                    &format!("source RSE ID {rse_id} not resolvable: {error}"),
                );
                None
            }
        }
    }

    fn timer(&self, step: &str, started: Instant) {
        self.metrics
            .record_timer(&format!("{METRIC_PREFIX}.{step}"), started.elapsed());
    }

    fn abort(
        &self,
        request_id: RequestId,
        severity: Severity,
        context: &str,
        reason: AbortReason,
    ) -> Aborted {
        self.log
            .log(severity, request_id, &format!("{context}: {reason}"));
        Aborted { request_id, reason }
    }
}
