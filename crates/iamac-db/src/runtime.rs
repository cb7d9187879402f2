//! Durable event log + outbox-style run queue backing `iamac-runtime`.
//!
//! An outbox-style claim (`FOR UPDATE SKIP LOCKED`): a `workflow_runs`
//! row is claimed exclusively by one worker, its `workflow_events` form the
//! deterministic replay log, and `workflow_signals` are delivered at-least-
//! once and consumed idempotently.

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;

#[derive(Debug, Clone)]
pub struct NewWorkflowRun<'a> {
    pub run_id: &'a str,
    pub workflow_type: &'a str,
    pub task_queue: &'a str,
    pub input: Value,
}

/// Enqueues a PENDING `workflow_runs` row. Idempotent on `run_id`.
pub async fn enqueue_workflow_run(pool: &PgPool, run: &NewWorkflowRun<'_>) -> Result<bool> {
    let result = sqlx::query(
        r#"
        insert into workflow_runs (run_id, workflow_type, task_queue, input)
        values ($1, $2, $3, $4)
        on conflict (run_id) do nothing
        "#,
    )
    .bind(run.run_id)
    .bind(run.workflow_type)
    .bind(run.task_queue)
    .bind(&run.input)
    .execute(pool)
    .await
    .context("enqueue_workflow_run failed")?;

    Ok(result.rows_affected() == 1)
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ClaimedWorkflowRun {
    pub run_id: String,
    pub workflow_type: String,
    pub task_queue: String,
    pub input: Value,
    pub status: String,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Claims up to `limit` PENDING rows for `task_queue`, transitioning them to
/// CLAIMED under `FOR UPDATE SKIP LOCKED` so concurrent workers never claim
/// the same run twice.
pub async fn workflow_claim_batch(
    pool: &PgPool,
    task_queue: &str,
    limit: i64,
    worker_id: &str,
) -> Result<Vec<ClaimedWorkflowRun>> {
    let mut tx = pool.begin().await.context("begin claim tx failed")?;

    let candidates: Vec<(String,)> = sqlx::query_as(
        r#"
        select run_id
          from workflow_runs
         where task_queue = $1 and status = 'PENDING'
         order by created_at
         limit $2
           for update skip locked
        "#,
    )
    .bind(task_queue)
    .bind(limit)
    .fetch_all(&mut *tx)
    .await
    .context("workflow_claim_batch select failed")?;

    if candidates.is_empty() {
        tx.commit().await.ok();
        return Ok(Vec::new());
    }

    let ids: Vec<String> = candidates.into_iter().map(|(id,)| id).collect();

    let claimed = sqlx::query_as::<_, ClaimedWorkflowRun>(
        r#"
        update workflow_runs
           set status = 'CLAIMED', claimed_by = $1, claimed_at = now(), updated_at = now()
         where run_id = any($2)
        returning run_id, workflow_type, task_queue, input, status, claimed_by, claimed_at, created_at, updated_at
        "#,
    )
    .bind(worker_id)
    .bind(&ids)
    .fetch_all(&mut *tx)
    .await
    .context("workflow_claim_batch update failed")?;

    tx.commit().await.context("commit claim tx failed")?;
    Ok(claimed)
}

pub async fn workflow_set_status(pool: &PgPool, run_id: &str, status: &str) -> Result<()> {
    sqlx::query("update workflow_runs set status = $1, updated_at = now() where run_id = $2")
        .bind(status)
        .bind(run_id)
        .execute(pool)
        .await
        .context("workflow_set_status failed")?;
    Ok(())
}

/// Marks a run COMPLETED and records the workflow body's return value.
pub async fn workflow_complete(pool: &PgPool, run_id: &str, result: &Value) -> Result<()> {
    sqlx::query(
        "update workflow_runs set status = 'COMPLETED', result = $1, updated_at = now() where run_id = $2",
    )
    .bind(result)
    .bind(run_id)
    .execute(pool)
    .await
    .context("workflow_complete failed")?;
    Ok(())
}

/// Reclaims CLAIMED/RUNNING rows whose claim has outlived `lease`, putting
/// them back to PENDING so a worker that crashed mid-run doesn't orphan it
/// forever — the counterpart to `workflow_claim_batch`'s exclusive claim.
pub async fn workflow_reclaim_stale(pool: &PgPool, task_queue: &str, lease: Duration) -> Result<u64> {
    let result = sqlx::query(
        r#"
        update workflow_runs
           set status = 'PENDING', claimed_by = null, claimed_at = null, updated_at = now()
         where task_queue = $1
           and status in ('CLAIMED', 'RUNNING')
           and claimed_at is not null
           and claimed_at < now() - (interval '1 second' * $2)
        "#,
    )
    .bind(task_queue)
    .bind(lease.as_secs_f64())
    .execute(pool)
    .await
    .context("workflow_reclaim_stale failed")?;

    Ok(result.rows_affected())
}

#[derive(Debug, Clone, sqlx::FromRow, serde::Serialize)]
pub struct WorkflowEventRow {
    pub run_id: String,
    pub seq: i64,
    pub event_type: String,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

/// Appends the next event in the run's log. `seq` is assigned as
/// `max(seq)+1` for the run inside the same statement, so concurrent
/// appenders for *different* runs never contend, and a single workflow task
/// (which holds the claim) never double-assigns a sequence number.
pub async fn workflow_record_event(
    pool: &PgPool,
    run_id: &str,
    event_type: &str,
    payload: &Value,
) -> Result<i64> {
    let row: (i64,) = sqlx::query_as(
        r#"
        insert into workflow_events (run_id, seq, event_type, payload)
        select $1, coalesce(max(seq), 0) + 1, $2, $3
          from workflow_events where run_id = $1
        returning seq
        "#,
    )
    .bind(run_id)
    .bind(event_type)
    .bind(payload)
    .fetch_one(pool)
    .await
    .context("workflow_record_event failed")?;

    Ok(row.0)
}

/// Loads the full deterministic replay log for a run, in sequence order.
pub async fn workflow_load_events(pool: &PgPool, run_id: &str) -> Result<Vec<WorkflowEventRow>> {
    let rows = sqlx::query_as::<_, WorkflowEventRow>(
        "select run_id, seq, event_type, payload, created_at from workflow_events where run_id = $1 order by seq",
    )
    .bind(run_id)
    .fetch_all(pool)
    .await
    .context("workflow_load_events failed")?;
    Ok(rows)
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct WorkflowSignalRow {
    pub id: i64,
    pub run_id: String,
    pub signal_name: String,
    pub payload: Value,
    pub received_at: DateTime<Utc>,
    pub consumed_at: Option<DateTime<Utc>>,
}

pub async fn workflow_send_signal(
    pool: &PgPool,
    run_id: &str,
    signal_name: &str,
    payload: &Value,
) -> Result<()> {
    sqlx::query("insert into workflow_signals (run_id, signal_name, payload) values ($1, $2, $3)")
        .bind(run_id)
        .bind(signal_name)
        .bind(payload)
        .execute(pool)
        .await
        .context("workflow_send_signal failed")?;
    Ok(())
}

/// Returns unconsumed signals for a run, oldest first.
pub async fn workflow_unconsumed_signals(pool: &PgPool, run_id: &str) -> Result<Vec<WorkflowSignalRow>> {
    let rows = sqlx::query_as::<_, WorkflowSignalRow>(
        r#"
        select id, run_id, signal_name, payload, received_at, consumed_at
          from workflow_signals
         where run_id = $1 and consumed_at is null
         order by received_at, id
        "#,
    )
    .bind(run_id)
    .fetch_all(pool)
    .await
    .context("workflow_unconsumed_signals failed")?;
    Ok(rows)
}

pub async fn workflow_consume_signal(pool: &PgPool, signal_id: i64) -> Result<()> {
    sqlx::query("update workflow_signals set consumed_at = now() where id = $1 and consumed_at is null")
        .bind(signal_id)
        .execute(pool)
        .await
        .context("workflow_consume_signal failed")?;
    Ok(())
}
