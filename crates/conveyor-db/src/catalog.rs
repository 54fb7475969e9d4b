use std::time::Duration;

use async_trait::async_trait;
use conveyor_reconcile::{Catalog, CatalogError, WorkQueue};
use conveyor_schemas::{
    DidMeta, ReplicaState, Request, RequestDetails, RequestId, RequestState, RseId,
};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::debug;
use uuid::Uuid;

use crate::PgTx;

const REQUEST_COLUMNS: &str = "request_id, scope, name, dest_rse_id, source_rse_id, retry_count, \
     previous_attempt_id, state, external_id, activity";

/// Postgres catalog. Every method runs on the caller's transaction.
#[derive(Debug, Clone)]
pub struct PgCatalog {
    pool: PgPool,
    max_retries: u32,
}

impl PgCatalog {
    /// `max_retries`: a failed request with `retry_count >= max_retries` is
    /// archived without a successor.
    pub fn new(pool: PgPool, max_retries: u32) -> Self {
        Self { pool, max_retries }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// Postgres SQLSTATEs worth retrying: serialization failure, deadlock.
const RETRYABLE_SQLSTATES: &[&str] = &["40001", "40P01"];

pub(crate) fn catalog_err(op: &str, err: sqlx::Error) -> CatalogError {
    match &err {
        sqlx::Error::RowNotFound => CatalogError::NotFound(op.to_string()),
        sqlx::Error::Io(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => CatalogError::Transient(format!("{op}: {err}")),
        sqlx::Error::Database(db_err)
            if db_err
                .code()
                .as_deref()
                .is_some_and(|code| RETRYABLE_SQLSTATES.contains(&code)) =>
        {
            CatalogError::Transient(format!("{op}: {err}"))
        }
        _ => CatalogError::Backend(format!("{op}: {err}")),
    }
}

fn decode_err(op: &str, err: impl std::fmt::Display) -> CatalogError {
    CatalogError::Backend(format!("{op}: decode failed: {err}"))
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn request_from_row(row: &PgRow) -> Result<Request, CatalogError> {
    let op = "request row";
    let state: String = row.try_get("state").map_err(|e| decode_err(op, e))?;
    let retry_count: i32 = row.try_get("retry_count").map_err(|e| decode_err(op, e))?;
    Ok(Request {
        request_id: RequestId(row.try_get("request_id").map_err(|e| decode_err(op, e))?),
        scope: row.try_get("scope").map_err(|e| decode_err(op, e))?,
        name: row.try_get("name").map_err(|e| decode_err(op, e))?,
        dest_rse_id: RseId(row.try_get("dest_rse_id").map_err(|e| decode_err(op, e))?),
        source_rse_id: row
            .try_get::<Option<Uuid>, _>("source_rse_id")
            .map_err(|e| decode_err(op, e))?
            .map(RseId),
        retry_count: u32::try_from(retry_count).map_err(|e| decode_err(op, e))?,
        previous_attempt_id: row
            .try_get::<Option<Uuid>, _>("previous_attempt_id")
            .map_err(|e| decode_err(op, e))?
            .map(RequestId),
        state: RequestState::parse(&state).map_err(|e| decode_err(op, e))?,
        external_id: row.try_get("external_id").map_err(|e| decode_err(op, e))?,
        activity: row.try_get("activity").map_err(|e| decode_err(op, e))?,
    })
}

/// Remove a live request and copy it into history. `NotFound` if not live.
async fn archive_row(tx: &mut PgTx, request_id: RequestId) -> Result<Request, CatalogError> {
    let op = "archive request";
    let row = sqlx::query(&format!(
        r#"
        delete from requests
        where request_id = $1
        returning {REQUEST_COLUMNS}, created_at, updated_at
        "#
    ))
    .bind(request_id.0)
    .fetch_optional(&mut **tx)
    .await
    .map_err(|e| catalog_err(op, e))?
    .ok_or_else(|| CatalogError::NotFound(format!("request {request_id}")))?;

    let req = request_from_row(&row)?;
    let created_at: chrono::DateTime<chrono::Utc> =
        row.try_get("created_at").map_err(|e| decode_err(op, e))?;

    sqlx::query(
        r#"
        insert into requests_history (
          request_id, scope, name, dest_rse_id, source_rse_id, retry_count,
          previous_attempt_id, state, external_id, activity, created_at, updated_at
        ) values (
          $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, now()
        )
        "#,
    )
    .bind(req.request_id.0)
    .bind(&req.scope)
    .bind(&req.name)
    .bind(req.dest_rse_id.0)
    .bind(req.source_rse_id.map(|r| r.0))
    .bind(req.retry_count as i32)
    .bind(req.previous_attempt_id.map(|r| r.0))
    .bind(req.state.as_str())
    .bind(&req.external_id)
    .bind(&req.activity)
    .bind(created_at)
    .execute(&mut **tx)
    .await
    .map_err(|e| catalog_err(op, e))?;

    Ok(req)
}

// ---------------------------------------------------------------------------
// Catalog
// ---------------------------------------------------------------------------

#[async_trait]
impl Catalog for PgCatalog {
    type Tx = PgTx;

    async fn get_endpoint_name(&self, tx: &mut PgTx, rse_id: RseId) -> Result<String, CatalogError> {
        let row = sqlx::query("select rse from rses where rse_id = $1 and not deleted")
            .bind(rse_id.0)
            .fetch_optional(&mut **tx)
            .await
            .map_err(|e| catalog_err("get endpoint name", e))?
            .ok_or_else(|| CatalogError::NotFound(format!("RSE {rse_id}")))?;
        row.try_get("rse").map_err(|e| decode_err("get endpoint name", e))
    }

    async fn get_did_meta(
        &self,
        tx: &mut PgTx,
        scope: &str,
        name: &str,
    ) -> Result<DidMeta, CatalogError> {
        let op = "get did meta";
        let row = sqlx::query(
            "select bytes, guid, adler32, md5 from dids where scope = $1 and name = $2",
        )
        .bind(scope)
        .bind(name)
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| catalog_err(op, e))?
        .ok_or_else(|| CatalogError::NotFound(format!("DID {scope}:{name}")))?;

        Ok(DidMeta {
            bytes: row.try_get("bytes").map_err(|e| decode_err(op, e))?,
            guid: row.try_get("guid").map_err(|e| decode_err(op, e))?,
            adler32: row.try_get("adler32").map_err(|e| decode_err(op, e))?,
            md5: row.try_get("md5").map_err(|e| decode_err(op, e))?,
        })
    }

    async fn set_request_state(
        &self,
        tx: &mut PgTx,
        request_id: RequestId,
        state: RequestState,
    ) -> Result<RequestState, CatalogError> {
        let op = "set request state";
        let (previous,): (String,) =
            sqlx::query_as("select state from requests where request_id = $1 for update")
                .bind(request_id.0)
                .fetch_optional(&mut **tx)
                .await
                .map_err(|e| catalog_err(op, e))?
                .ok_or_else(|| CatalogError::NotFound(format!("request {request_id}")))?;

        sqlx::query("update requests set state = $2, updated_at = now() where request_id = $1")
            .bind(request_id.0)
            .bind(state.as_str())
            .execute(&mut **tx)
            .await
            .map_err(|e| catalog_err(op, e))?;

        RequestState::parse(&previous).map_err(|e| decode_err(op, e))
    }

    async fn get_request_details(
        &self,
        tx: &mut PgTx,
        request_id: RequestId,
    ) -> Result<Vec<RequestDetails>, CatalogError> {
        let op = "get request details";
        let rows = sqlx::query(
            r#"
            select source_surl, dest_surl, start_time, finish_time, reason
            from request_details
            where request_id = $1
            order by detail_id
            "#,
        )
        .bind(request_id.0)
        .fetch_all(&mut **tx)
        .await
        .map_err(|e| catalog_err(op, e))?;

        rows.iter()
            .map(|row| {
                Ok(RequestDetails {
                    source_surl: row.try_get("source_surl").map_err(|e| decode_err(op, e))?,
                    dest_surl: row.try_get("dest_surl").map_err(|e| decode_err(op, e))?,
                    start_time: row.try_get("start_time").map_err(|e| decode_err(op, e))?,
                    finish_time: row.try_get("finish_time").map_err(|e| decode_err(op, e))?,
                    reason: row.try_get("reason").map_err(|e| decode_err(op, e))?,
                })
            })
            .collect()
    }

    async fn archive_request(&self, tx: &mut PgTx, request_id: RequestId) -> Result<(), CatalogError> {
        archive_row(tx, request_id).await.map(|_| ())
    }

    async fn requeue_and_archive(
        &self,
        tx: &mut PgTx,
        request_id: RequestId,
    ) -> Result<Option<Request>, CatalogError> {
        let old = archive_row(tx, request_id).await?;
        if old.retry_count >= self.max_retries {
            debug!(%request_id, retry_count = old.retry_count, "retry budget exhausted");
            return Ok(None);
        }

        let row = sqlx::query(&format!(
            r#"
            insert into requests (
              request_id, scope, name, dest_rse_id, source_rse_id, retry_count,
              previous_attempt_id, state, external_id, activity
            ) values (
              $1, $2, $3, $4, $5, $6, $7, 'QUEUED', null, $8
            )
            returning {REQUEST_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(&old.scope)
        .bind(&old.name)
        .bind(old.dest_rse_id.0)
        .bind(old.source_rse_id.map(|r| r.0))
        .bind((old.retry_count + 1) as i32)
        .bind(old.request_id.0)
        .bind(&old.activity)
        .fetch_one(&mut **tx)
        .await
        .map_err(|e| catalog_err("requeue request", e))?;

        request_from_row(&row).map(Some)
    }

    async fn resolve_lock_success(
        &self,
        tx: &mut PgTx,
        scope: &str,
        name: &str,
        rse_id: RseId,
    ) -> Result<(), CatalogError> {
        set_lock_state(tx, scope, name, rse_id, "OK", &["REPLICATING", "STUCK"]).await
    }

    async fn resolve_lock_failure(
        &self,
        tx: &mut PgTx,
        scope: &str,
        name: &str,
        rse_id: RseId,
    ) -> Result<(), CatalogError> {
        set_lock_state(tx, scope, name, rse_id, "STUCK", &["REPLICATING"]).await
    }

    async fn update_replica_state(
        &self,
        tx: &mut PgTx,
        scope: &str,
        name: &str,
        rse: &str,
        state: ReplicaState,
    ) -> Result<(), CatalogError> {
        let res = sqlx::query(
            r#"
            update replicas r
            set state = $4, updated_at = now()
            from rses e
            where r.rse_id = e.rse_id
              and r.scope = $1 and r.name = $2 and e.rse = $3
            "#,
        )
        .bind(scope)
        .bind(name)
        .bind(rse)
        .bind(state.as_str())
        .execute(&mut **tx)
        .await
        .map_err(|e| catalog_err("update replica state", e))?;

        if res.rows_affected() == 0 {
            return Err(CatalogError::UnsupportedOperation(format!(
                "replica {scope}:{name} at {rse} does not exist"
            )));
        }
        Ok(())
    }
}

/// Move the locks on one replica to `state`. Only locks currently in one of
/// `from` are touched; a missing lock is not an error.
async fn set_lock_state(
    tx: &mut PgTx,
    scope: &str,
    name: &str,
    rse_id: RseId,
    state: &str,
    from: &[&str],
) -> Result<(), CatalogError> {
    let res = sqlx::query(
        r#"
        update locks
        set state = $4, updated_at = now()
        where scope = $1 and name = $2 and rse_id = $3 and state = any($5)
        "#,
    )
    .bind(scope)
    .bind(name)
    .bind(rse_id.0)
    .bind(state)
    .bind(from)
    .execute(&mut **tx)
    .await
    .map_err(|e| catalog_err("resolve lock", e))?;

    debug!(scope, name, %rse_id, state, locks = res.rows_affected(), "locks resolved");
    Ok(())
}

// ---------------------------------------------------------------------------
// Work queue
// ---------------------------------------------------------------------------

#[async_trait]
impl WorkQueue for PgCatalog {
    async fn begin(&self) -> Result<PgTx, CatalogError> {
        self.pool.begin().await.map_err(|e| catalog_err("begin", e))
    }

    async fn commit(&self, tx: PgTx) -> Result<(), CatalogError> {
        tx.commit().await.map_err(|e| catalog_err("commit", e))
    }

    async fn rollback(&self, tx: PgTx) -> Result<(), CatalogError> {
        tx.rollback().await.map_err(|e| catalog_err("rollback", e))
    }

    async fn fetch_pending(&self, limit: usize) -> Result<Vec<Request>, CatalogError> {
        let rows = sqlx::query(&format!(
            r#"
            select {REQUEST_COLUMNS}
            from requests
            where state = 'SUBMITTED' and external_id is not null
              and (next_attempt_at is null or next_attempt_at <= now())
            order by updated_at, request_id
            limit $1
            "#
        ))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| catalog_err("fetch pending", e))?;

        rows.iter().map(request_from_row).collect()
    }

    async fn claim(&self, tx: &mut PgTx, request_id: RequestId) -> Result<Option<Request>, CatalogError> {
        let row = sqlx::query(&format!(
            r#"
            select {REQUEST_COLUMNS}
            from requests
            where request_id = $1 and state = 'SUBMITTED'
            for update skip locked
            "#
        ))
        .bind(request_id.0)
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| catalog_err("claim request", e))?;

        row.as_ref().map(request_from_row).transpose()
    }

    async fn defer(&self, request_id: RequestId, delay: Duration) -> Result<(), CatalogError> {
        let result = sqlx::query(
            r#"
            update requests
            set next_attempt_at = now() + make_interval(secs => $2),
                updated_at = now()
            where request_id = $1 and state = 'SUBMITTED'
            "#,
        )
        .bind(request_id.0)
        .bind(delay.as_secs_f64())
        .execute(&self.pool)
        .await
        .map_err(|e| catalog_err("defer request", e))?;

        debug!(request_id = %request_id, rows = result.rows_affected(), "request deferred");
        Ok(())
    }
}
