//! Direct row access for operators and DB-backed tests: seeding rows that
//! other catalog components own, and reading back state for inspection.

use anyhow::{anyhow, Context, Result};
use chrono::NaiveDateTime;
use conveyor_schemas::{
    DidMeta, LockState, ReplicaState, Request, RequestId, RequestState, RseId,
};
use serde_json::Value;
use sqlx::{PgPool, Row};
use uuid::Uuid;

pub async fn insert_rse(pool: &PgPool, rse_id: RseId, rse: &str) -> Result<()> {
    sqlx::query("insert into rses (rse_id, rse) values ($1, $2)")
        .bind(rse_id.0)
        .bind(rse)
        .execute(pool)
        .await
        .context("insert_rse failed")?;
    Ok(())
}

pub async fn insert_did(pool: &PgPool, scope: &str, name: &str, meta: &DidMeta) -> Result<()> {
    sqlx::query(
        r#"
        insert into dids (scope, name, bytes, guid, adler32, md5)
        values ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(scope)
    .bind(name)
    .bind(meta.bytes)
    .bind(&meta.guid)
    .bind(&meta.adler32)
    .bind(&meta.md5)
    .execute(pool)
    .await
    .context("insert_did failed")?;
    Ok(())
}

pub async fn insert_request(pool: &PgPool, req: &Request) -> Result<()> {
    sqlx::query(
        r#"
        insert into requests (
          request_id, scope, name, dest_rse_id, source_rse_id, retry_count,
          previous_attempt_id, state, external_id, activity
        ) values (
          $1, $2, $3, $4, $5, $6, $7, $8, $9, $10
        )
        "#,
    )
    .bind(req.request_id.0)
    .bind(&req.scope)
    .bind(&req.name)
    .bind(req.dest_rse_id.0)
    .bind(req.source_rse_id.map(|r| r.0))
    .bind(i32::try_from(req.retry_count).context("retry_count out of range")?)
    .bind(req.previous_attempt_id.map(|r| r.0))
    .bind(req.state.as_str())
    .bind(&req.external_id)
    .bind(&req.activity)
    .execute(pool)
    .await
    .context("insert_request failed")?;
    Ok(())
}

pub async fn insert_request_details(
    pool: &PgPool,
    request_id: RequestId,
    source_surl: Option<&str>,
    dest_surl: Option<&str>,
    start_time: Option<NaiveDateTime>,
    finish_time: Option<NaiveDateTime>,
    reason: Option<&str>,
) -> Result<()> {
    sqlx::query(
        r#"
        insert into request_details (
          request_id, source_surl, dest_surl, start_time, finish_time, reason
        ) values (
          $1, $2, $3, $4, $5, $6
        )
        "#,
    )
    .bind(request_id.0)
    .bind(source_surl)
    .bind(dest_surl)
    .bind(start_time)
    .bind(finish_time)
    .bind(reason)
    .execute(pool)
    .await
    .context("insert_request_details failed")?;
    Ok(())
}

pub async fn insert_replica(
    pool: &PgPool,
    scope: &str,
    name: &str,
    rse_id: RseId,
    state: ReplicaState,
) -> Result<()> {
    sqlx::query("insert into replicas (scope, name, rse_id, state) values ($1, $2, $3, $4)")
        .bind(scope)
        .bind(name)
        .bind(rse_id.0)
        .bind(state.as_str())
        .execute(pool)
        .await
        .context("insert_replica failed")?;
    Ok(())
}

pub async fn delete_replica(pool: &PgPool, scope: &str, name: &str, rse_id: RseId) -> Result<()> {
    sqlx::query("delete from replicas where scope = $1 and name = $2 and rse_id = $3")
        .bind(scope)
        .bind(name)
        .bind(rse_id.0)
        .execute(pool)
        .await
        .context("delete_replica failed")?;
    Ok(())
}

/// Insert a lock for a fresh rule; returns the rule id.
pub async fn insert_lock(
    pool: &PgPool,
    scope: &str,
    name: &str,
    rse_id: RseId,
    state: LockState,
) -> Result<Uuid> {
    let rule_id = Uuid::new_v4();
    sqlx::query(
        "insert into locks (rule_id, scope, name, rse_id, state) values ($1, $2, $3, $4, $5)",
    )
    .bind(rule_id)
    .bind(scope)
    .bind(name)
    .bind(rse_id.0)
    .bind(state.as_str())
    .execute(pool)
    .await
    .context("insert_lock failed")?;
    Ok(rule_id)
}

// ---------------------------------------------------------------------------
// Reads
// ---------------------------------------------------------------------------

/// State of a live request, `None` if not live.
pub async fn fetch_request_state(pool: &PgPool, request_id: RequestId) -> Result<Option<RequestState>> {
    let row = sqlx::query("select state from requests where request_id = $1")
        .bind(request_id.0)
        .fetch_optional(pool)
        .await
        .context("fetch_request_state failed")?;
    row.map(|r| -> Result<RequestState> {
        let s: String = r.try_get("state")?;
        RequestState::parse(&s).map_err(|e| anyhow!(e))
    })
    .transpose()
}

/// State recorded in history, `None` if never archived.
pub async fn fetch_archived_state(pool: &PgPool, request_id: RequestId) -> Result<Option<RequestState>> {
    let row = sqlx::query("select state from requests_history where request_id = $1")
        .bind(request_id.0)
        .fetch_optional(pool)
        .await
        .context("fetch_archived_state failed")?;
    row.map(|r| -> Result<RequestState> {
        let s: String = r.try_get("state")?;
        RequestState::parse(&s).map_err(|e| anyhow!(e))
    })
    .transpose()
}

/// Live successors of `request_id`.
pub async fn fetch_successors(pool: &PgPool, request_id: RequestId) -> Result<Vec<(RequestId, u32)>> {
    let rows = sqlx::query(
        "select request_id, retry_count from requests where previous_attempt_id = $1",
    )
    .bind(request_id.0)
    .fetch_all(pool)
    .await
    .context("fetch_successors failed")?;

    rows.iter()
        .map(|r| -> Result<(RequestId, u32)> {
            let id: Uuid = r.try_get("request_id")?;
            let n: i32 = r.try_get("retry_count")?;
            Ok((RequestId(id), u32::try_from(n).context("negative retry_count")?))
        })
        .collect()
}

pub async fn fetch_replica_state(
    pool: &PgPool,
    scope: &str,
    name: &str,
    rse_id: RseId,
) -> Result<Option<ReplicaState>> {
    let row = sqlx::query("select state from replicas where scope = $1 and name = $2 and rse_id = $3")
        .bind(scope)
        .bind(name)
        .bind(rse_id.0)
        .fetch_optional(pool)
        .await
        .context("fetch_replica_state failed")?;
    row.map(|r| -> Result<ReplicaState> {
        let s: String = r.try_get("state")?;
        ReplicaState::parse(&s).map_err(|e| anyhow!(e))
    })
    .transpose()
}

pub async fn fetch_lock_state(pool: &PgPool, rule_id: Uuid) -> Result<Option<LockState>> {
    let row = sqlx::query("select state from locks where rule_id = $1")
        .bind(rule_id)
        .fetch_optional(pool)
        .await
        .context("fetch_lock_state failed")?;
    row.map(|r| -> Result<LockState> {
        let s: String = r.try_get("state")?;
        LockState::parse(&s).map_err(|e| anyhow!(e))
    })
    .transpose()
}

/// Enqueued messages as (event_type, payload), oldest first.
pub async fn fetch_messages(pool: &PgPool) -> Result<Vec<(String, Value)>> {
    let rows = sqlx::query("select event_type, payload from messages order by message_id")
        .fetch_all(pool)
        .await
        .context("fetch_messages failed")?;
    rows.iter()
        .map(|r| -> Result<(String, Value)> {
            Ok((r.try_get("event_type")?, r.try_get("payload")?))
        })
        .collect()
}
