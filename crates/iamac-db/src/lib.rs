// crates/iamac-db/src/lib.rs
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{postgres::PgPoolOptions, PgPool, Row};
use uuid::Uuid;

pub mod runtime;

pub use runtime::{
    enqueue_workflow_run, workflow_claim_batch, workflow_complete, workflow_reclaim_stale,
    workflow_record_event, workflow_load_events, workflow_send_signal, workflow_unconsumed_signals,
    workflow_consume_signal, workflow_set_status, ClaimedWorkflowRun, WorkflowEventRow,
    WorkflowSignalRow,
};

pub const ENV_DB_URL: &str = "IAMAC_DATABASE_URL";

/// Connect to Postgres using `IAMAC_DATABASE_URL`.
pub async fn connect_from_env() -> Result<PgPool> {
    let url = std::env::var(ENV_DB_URL).with_context(|| format!("missing env var {ENV_DB_URL}"))?;
    connect(&url).await
}

pub async fn connect(url: &str) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(url)
        .await
        .context("failed to connect to Postgres")?;
    Ok(pool)
}

/// Test helper: connect using `IAMAC_DATABASE_URL` and ensure migrations are applied.
pub async fn testkit_db_pool() -> Result<PgPool> {
    let pool = connect_from_env().await?;
    migrate(&pool).await?;
    Ok(pool)
}

/// Run embedded SQLx migrations.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("db migrate failed")?;
    Ok(())
}

// ---------------------------------------------------------------------------
// refactor_jobs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct NewJob {
    pub job_id: String,
    pub owner_id: String,
    pub execution_mode: String,
}

/// Insert the initial `refactor_jobs` row. Idempotent: a second insert for
/// the same `job_id` is a silent no-op (conflict-ignore), matching invariant
/// #4-style idempotency elsewhere in this schema.
pub async fn insert_job(pool: &PgPool, job: &NewJob) -> Result<()> {
    sqlx::query(
        r#"
        insert into refactor_jobs (id, owner_id, status, execution_mode)
        values ($1, $2, 'PENDING', $3)
        on conflict (id) do nothing
        "#,
    )
    .bind(&job.job_id)
    .bind(&job.owner_id)
    .bind(&job.execution_mode)
    .execute(pool)
    .await
    .context("insert_job failed")?;
    Ok(())
}

#[derive(Debug, Clone, sqlx::FromRow, serde::Serialize)]
pub struct JobRow {
    pub id: String,
    pub owner_id: String,
    pub status: String,
    pub attempt_count: i32,
    pub identical_failure_count: i32,
    pub failure_pattern_fingerprint: Option<String>,
    pub failure_reason: Option<String>,
    pub execution_mode: String,
    pub phase: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

pub async fn fetch_job(pool: &PgPool, job_id: &str) -> Result<Option<JobRow>> {
    let row = sqlx::query_as::<_, JobRow>(
        r#"
        select id, owner_id, status, attempt_count, identical_failure_count,
               failure_pattern_fingerprint, failure_reason, execution_mode, phase,
               created_at, updated_at, completed_at
        from refactor_jobs where id = $1
        "#,
    )
    .bind(job_id)
    .fetch_optional(pool)
    .await
    .context("fetch_job failed")?;
    Ok(row)
}

// ---------------------------------------------------------------------------
// write_audit_event (§4.1)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct NewAuditEvent<'a> {
    pub job_id: &'a str,
    pub event_type: &'a str,
    pub old_state: Option<&'a str>,
    pub new_state: Option<&'a str>,
    pub surface: &'a str,
    pub metadata: Value,
}

/// Inserts one `audit_events` row. If `event_type = "job.state_change"` and
/// `new_state` is present, also updates `refactor_jobs.status` in the same
/// targeted `UPDATE` — no read-modify-write, per invariant #2.
pub async fn write_audit_event(pool: &PgPool, ev: &NewAuditEvent<'_>) -> Result<()> {
    sqlx::query(
        r#"
        insert into audit_events (job_id, event_type, old_state, new_state, surface, metadata)
        values ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(ev.job_id)
    .bind(ev.event_type)
    .bind(ev.old_state)
    .bind(ev.new_state)
    .bind(ev.surface)
    .bind(&ev.metadata)
    .execute(pool)
    .await
    .context("insert audit_events failed")?;

    if ev.event_type == "job.state_change" {
        if let Some(new_state) = ev.new_state {
            let is_terminal = matches!(new_state, "DELIVERED" | "FAILED" | "FALLBACK_REQUIRED");
            let failure_reason = if new_state == "FAILED" {
                ev.metadata.get("reason").and_then(Value::as_str)
            } else {
                None
            };

            sqlx::query(
                r#"
                update refactor_jobs
                   set status = $1,
                       updated_at = now(),
                       completed_at = case when $2 then now() else completed_at end,
                       failure_reason = coalesce($3, failure_reason)
                 where id = $4
                "#,
            )
            .bind(new_state)
            .bind(is_terminal)
            .bind(failure_reason)
            .bind(ev.job_id)
            .execute(pool)
            .await
            .context("update refactor_jobs.status failed")?;
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// record_usage (§4.1)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct CounterUpdate {
    pub attempt_count: i32,
    pub identical_failure_count: i32,
    pub failure_pattern_fingerprint: Option<String>,
    pub phase: i32,
}

/// `counter_update` events update `refactor_jobs` counters directly (no-op if
/// the job row is absent); everything else is a billable/non-billable
/// `usage_ledger` insert, conflict-ignored on `idempotency_key`.
pub async fn record_counter_update(pool: &PgPool, job_id: &str, update: &CounterUpdate) -> Result<()> {
    sqlx::query(
        r#"
        update refactor_jobs
           set attempt_count = $1,
               identical_failure_count = $2,
               failure_pattern_fingerprint = $3,
               phase = $4,
               updated_at = now()
         where id = $5
        "#,
    )
    .bind(update.attempt_count)
    .bind(update.identical_failure_count)
    .bind(&update.failure_pattern_fingerprint)
    .bind(update.phase)
    .bind(job_id)
    .execute(pool)
    .await
    .context("record_counter_update failed")?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct UsageEvent<'a> {
    pub job_id: &'a str,
    pub event_type: &'a str,
    pub quantity: i32,
    pub billable: bool,
    pub idempotency_key: Option<&'a str>,
}

/// Records one billable/non-billable usage event. No-op if
/// `idempotency_key` is absent (invariant #5) or the job's owner cannot be
/// resolved.
pub async fn record_usage(pool: &PgPool, ev: &UsageEvent<'_>) -> Result<()> {
    let Some(idempotency_key) = ev.idempotency_key else {
        return Ok(());
    };

    let owner: Option<(String,)> =
        sqlx::query_as("select owner_id from refactor_jobs where id = $1")
            .bind(ev.job_id)
            .fetch_optional(pool)
            .await
            .context("lookup owner_id for usage event failed")?;

    let Some((owner_id,)) = owner else {
        return Ok(());
    };

    sqlx::query(
        r#"
        insert into usage_ledger (user_id, job_id, event_type, quantity, billable, idempotency_key)
        values ($1, $2, $3, $4, $5, $6)
        on conflict (idempotency_key) do nothing
        "#,
    )
    .bind(&owner_id)
    .bind(ev.job_id)
    .bind(ev.event_type)
    .bind(ev.quantity)
    .bind(ev.billable)
    .bind(idempotency_key)
    .execute(pool)
    .await
    .context("insert usage_ledger failed")?;

    Ok(())
}

// ---------------------------------------------------------------------------
// write_entitlement_snapshot (§4.1, invariant #3)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct EntitlementDefaults {
    pub tier: &'static str,
    pub operating_mode: &'static str,
    pub context_cap: i32,
}

impl Default for EntitlementDefaults {
    fn default() -> Self {
        Self {
            tier: "FREE",
            operating_mode: "SIMPLE",
            context_cap: 128_000,
        }
    }
}

/// Reads the job's owner and the owner's most recent ACTIVE
/// `subscription_tiers` row (defaulting per [`EntitlementDefaults`] when
/// absent), then inserts one conflict-ignored `entitlement_snapshots` row.
/// `web_github_enabled` is true iff `tier = ENTERPRISE`.
pub async fn write_entitlement_snapshot(pool: &PgPool, job_id: &str) -> Result<()> {
    let job: Option<(String, String)> =
        sqlx::query_as("select owner_id, execution_mode from refactor_jobs where id = $1")
            .bind(job_id)
            .fetch_optional(pool)
            .await
            .context("lookup job for entitlement snapshot failed")?;

    let Some((owner_id, execution_mode)) = job else {
        return Ok(());
    };

    let sub: Option<(String, String, i32)> = sqlx::query_as(
        r#"
        select tier, operating_mode, context_cap
          from subscription_tiers
         where user_id = $1 and status = 'ACTIVE'
         order by created_at desc
         limit 1
        "#,
    )
    .bind(&owner_id)
    .fetch_optional(pool)
    .await
    .context("lookup subscription_tiers failed")?;

    let defaults = EntitlementDefaults::default();
    let (tier, operating_mode, context_cap) = match sub {
        Some((tier, operating_mode, context_cap)) => (tier, operating_mode, context_cap),
        None => (
            defaults.tier.to_string(),
            defaults.operating_mode.to_string(),
            defaults.context_cap,
        ),
    };

    let web_github_enabled = tier == "ENTERPRISE";
    let phase_limits = serde_json::json!({"phase1": null, "phase2": null, "phase3": null});

    sqlx::query(
        r#"
        insert into entitlement_snapshots
          (job_id, user_id, tier, operating_mode, execution_mode, phase_limits, web_github_enabled, context_cap)
        values ($1, $2, $3, $4, $5, $6, $7, $8)
        on conflict (job_id) do nothing
        "#,
    )
    .bind(job_id)
    .bind(&owner_id)
    .bind(&tier)
    .bind(&operating_mode)
    .bind(&execution_mode)
    .bind(&phase_limits)
    .bind(web_github_enabled)
    .bind(context_cap)
    .execute(pool)
    .await
    .context("insert entitlement_snapshots failed")?;

    Ok(())
}

pub async fn has_entitlement_snapshot(pool: &PgPool, job_id: &str) -> Result<bool> {
    let row: Option<(i32,)> =
        sqlx::query_as("select 1 from entitlement_snapshots where job_id = $1")
            .bind(job_id)
            .fetch_optional(pool)
            .await
            .context("has_entitlement_snapshot failed")?;
    Ok(row.is_some())
}

// ---------------------------------------------------------------------------
// apply_patch — persistence half (§4.1)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct NewPatchAttempt<'a> {
    pub job_id: &'a str,
    pub attempt_number: i32,
    pub phase: i32,
    pub model_class: &'a str,
    pub outcome: &'a str,
}

/// Inserts a `patch_attempts` row (conflict-ignore on `(job_id,
/// attempt_number)`), then records the billable usage event keyed
/// `"{job_id}:L{phase}:{attempt_number}"`.
pub async fn apply_patch_persist(pool: &PgPool, attempt: &NewPatchAttempt<'_>) -> Result<()> {
    sqlx::query(
        r#"
        insert into patch_attempts (id, job_id, attempt_number, phase, model_class, outcome)
        values ($1, $2, $3, $4, $5, $6)
        on conflict (job_id, attempt_number) do nothing
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(attempt.job_id)
    .bind(attempt.attempt_number)
    .bind(attempt.phase)
    .bind(attempt.model_class)
    .bind(attempt.outcome)
    .execute(pool)
    .await
    .context("insert patch_attempts failed")?;

    let idempotency_key = format!("{}:L{}:{}", attempt.job_id, attempt.phase, attempt.attempt_number);
    record_usage(
        pool,
        &UsageEvent {
            job_id: attempt.job_id,
            event_type: "phase_call",
            quantity: 1,
            billable: true,
            idempotency_key: Some(&idempotency_key),
        },
    )
    .await
}

// ---------------------------------------------------------------------------
// run_tests — persistence half (§4.1, §4.3)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct NewTestRun<'a> {
    pub job_id: &'a str,
    pub attempt_number: i32,
    pub phase: i32,
    pub run_type: &'a str,
    pub execution_mode: &'a str,
    pub spec_revision_id: Option<Uuid>,
}

/// Inserts a `test_runs` row in status RUNNING (conflict-ignore on
/// `(job_id, attempt_number, run_type)`), linking to the most recent
/// `spec_revisions` row for the job (fabricating an opaque id if none).
/// Returns the row's `id` (either the one just inserted, or the pre-existing
/// row's id on a conflict — callers always get a stable id to complete with).
pub async fn run_tests_start(pool: &PgPool, run: &NewTestRun<'_>) -> Result<Uuid> {
    let spec_revision_id = match run.spec_revision_id {
        Some(id) => id,
        None => {
            let existing: Option<(Uuid,)> = sqlx::query_as(
                "select id from spec_revisions where job_id = $1 order by created_at desc limit 1",
            )
            .bind(run.job_id)
            .fetch_optional(pool)
            .await
            .context("lookup spec_revisions failed")?;
            existing.map(|(id,)| id).unwrap_or_else(Uuid::new_v4)
        }
    };

    let test_run_id = Uuid::new_v4();

    let inserted: Option<(Uuid,)> = sqlx::query_as(
        r#"
        insert into test_runs
          (id, job_id, spec_revision_id, attempt_number, phase, run_type, status, execution_mode)
        values ($1, $2, $3, $4, $5, $6, 'RUNNING', $7)
        on conflict (job_id, attempt_number, run_type) do nothing
        returning id
        "#,
    )
    .bind(test_run_id)
    .bind(run.job_id)
    .bind(spec_revision_id)
    .bind(run.attempt_number)
    .bind(run.phase)
    .bind(run.run_type)
    .bind(run.execution_mode)
    .fetch_optional(pool)
    .await
    .context("insert test_runs failed")?;

    let id = match inserted {
        Some((id,)) => id,
        None => {
            let row: (Uuid,) = sqlx::query_as(
                "select id from test_runs where job_id = $1 and attempt_number = $2 and run_type = $3",
            )
            .bind(run.job_id)
            .bind(run.attempt_number)
            .bind(run.run_type)
            .fetch_one(pool)
            .await
            .context("lookup pre-existing test_runs row failed")?;
            row.0
        }
    };

    Ok(id)
}

/// Updates the `test_runs` row to its terminal status and stamps
/// `completed_at`.
pub async fn run_tests_complete(
    pool: &PgPool,
    test_run_id: Uuid,
    passed: bool,
    failure_pattern_fingerprint: Option<&str>,
) -> Result<()> {
    let status = if passed { "PASSED" } else { "FAILED" };
    sqlx::query(
        r#"
        update test_runs
           set status = $1, failure_pattern_fingerprint = $2, completed_at = now()
         where id = $3
        "#,
    )
    .bind(status)
    .bind(failure_pattern_fingerprint)
    .bind(test_run_id)
    .execute(pool)
    .await
    .context("update test_runs terminal status failed")?;
    Ok(())
}

/// Simple connectivity/schema check.
pub async fn status(pool: &PgPool) -> Result<DbStatus> {
    let (one,): (i32,) = sqlx::query_as("select 1")
        .fetch_one(pool)
        .await
        .context("status connectivity query failed")?;

    let exists: bool = sqlx::query(
        r#"
        select exists (
            select 1 from information_schema.tables
            where table_schema = 'public' and table_name = 'refactor_jobs'
        )
        "#,
    )
    .fetch_one(pool)
    .await
    .context("status table-exists query failed")?
    .try_get(0)
    .context("status table-exists decode failed")?;

    Ok(DbStatus {
        ok: one == 1,
        has_refactor_jobs_table: exists,
    })
}

#[derive(Debug, Clone)]
pub struct DbStatus {
    pub ok: bool,
    pub has_refactor_jobs_table: bool,
}
