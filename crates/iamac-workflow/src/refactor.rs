//! `RefactorJobWorkflow` (§4.4): the durable prologue + repair loop.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use iamac_activities::IdeExecutor;
use iamac_db::CounterUpdate;
use iamac_llm::LlmGateway;
use iamac_runtime::{ActivityCtx, RetryPolicy, WorkflowCtx};
use iamac_schemas::{phase_cap, InterventionAction, JobInput, JobState, Phase, RunType, TestRunResult};
use serde_json::Value;
use sqlx::PgPool;

use crate::job::{is_legal_edge, IllegalTransition, Job};

mod signal_names {
    pub const PROPOSAL_SELECTED: &str = "proposalSelected";
    pub const SPEC_APPROVED: &str = "specApproved";
    pub const INTERVENTION_ACTION: &str = "interventionAction";
    pub const SPEC_UPDATED: &str = "specUpdatedDuringExecution";
    /// Captured but not observably wired into the repair loop — reserved.
    pub const HEARTBEAT_RECEIVED: &str = "heartbeatReceived";
    /// Stores its payload; no state in the repair loop consumes it.
    pub const NL_CONVERT_REQUESTED: &str = "nlConvertRequested";
}

const DAY: Duration = Duration::from_secs(24 * 3600);
const HOUR: Duration = Duration::from_secs(3600);
const SIGNAL_POLL: Duration = Duration::from_millis(500);

/// Truncates an error's display string to 200 chars (spec §4.4 termination
/// clause), splitting on a char boundary.
fn truncated_error_string(err: &anyhow::Error) -> String {
    let s = err.to_string();
    match s.char_indices().nth(200) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s,
    }
}

/// Entry point registered with `iamac_runtime::Runner`. Has nothing to
/// report back beyond success/failure, so its `result` payload is always
/// `Value::Null`.
pub async fn run_refactor_job(
    mut ctx: WorkflowCtx,
    input: Value,
    pool: PgPool,
    gateway: Arc<LlmGateway>,
    executor: Arc<dyn IdeExecutor>,
) -> Result<Value> {
    let job_input: JobInput =
        serde_json::from_value(input).context("RefactorJobWorkflow: invalid JobInput")?;
    let mut job = Job::from_input(job_input);

    let outcome = drive(&mut ctx, &mut job, &pool, &gateway, executor.as_ref()).await;

    match outcome {
        Ok(()) => Ok(Value::Null),
        Err(err) => {
            if !job.state.is_terminal() {
                let reason = if ctx.is_cancelled() {
                    "USER_CANCELLED".to_string()
                } else {
                    truncated_error_string(&err)
                };
                // Best-effort: failing to record the failure doesn't change
                // which error gets re-raised.
                let _ = fail(&mut ctx, &pool, &mut job, &reason).await;
            }
            Err(err)
        }
    }
}

/// Records the transition in both the replay-local history
/// (`ctx.record_transition`) and durable storage (`write_audit_event`,
/// invariant #2 — must complete before the workflow proceeds). Checked
/// against the §4.4 edge table first.
async fn transition(
    ctx: &mut WorkflowCtx,
    pool: &PgPool,
    job: &mut Job,
    to: JobState,
    metadata: Value,
) -> Result<()> {
    if !is_legal_edge(job.state, to) {
        return Err(IllegalTransition {
            from: job.state,
            to,
        }
        .into());
    }
    transition_unchecked(ctx, pool, job, to, metadata).await
}

/// Bypasses the edge-legality check — only `fail()` (a crash/cancellation
/// path, which can legitimately originate from any state) should use this.
async fn transition_unchecked(
    ctx: &mut WorkflowCtx,
    pool: &PgPool,
    job: &mut Job,
    to: JobState,
    metadata: Value,
) -> Result<()> {
    let old = job.state;
    job.state = to;
    ctx.record_transition(old.as_str(), to.as_str()).await?;

    let pool = pool.clone();
    let job_id = job.job_id.clone();
    let old_str = old.as_str().to_string();
    let new_str = to.as_str().to_string();

    ctx.execute_activity(
        "write_audit_event",
        RetryPolicy::fixed(5, Duration::from_secs(1)),
        Duration::from_secs(10),
        move |actx: ActivityCtx| {
            let pool = pool.clone();
            let job_id = job_id.clone();
            let old_str = old_str.clone();
            let new_str = new_str.clone();
            let metadata = metadata.clone();
            async move {
                iamac_activities::write_audit_event(
                    actx,
                    pool,
                    job_id,
                    "job.state_change".to_string(),
                    Some(old_str),
                    Some(new_str),
                    "SYSTEM".to_string(),
                    metadata,
                )
                .await
            }
        },
    )
    .await
}

async fn fail(ctx: &mut WorkflowCtx, pool: &PgPool, job: &mut Job, reason: &str) -> Result<()> {
    transition_unchecked(
        ctx,
        pool,
        job,
        JobState::Failed,
        serde_json::json!({ "reason": reason }),
    )
    .await
}

/// Persists `job.counters`/`job.phase` via the `record_usage` activity's
/// `counter_update` path (§4.1).
async fn persist_counters(ctx: &mut WorkflowCtx, pool: &PgPool, job: &Job) -> Result<()> {
    let pool = pool.clone();
    let job_id = job.job_id.clone();
    let update = CounterUpdate {
        attempt_count: job.counters.attempt_count as i32,
        identical_failure_count: job.counters.identical_failure_count as i32,
        failure_pattern_fingerprint: job.counters.last_fingerprint.clone(),
        phase: job.phase as i32,
    };

    ctx.execute_activity(
        "record_usage:counter_update",
        RetryPolicy::no_retry(),
        Duration::from_secs(10),
        move |actx: ActivityCtx| {
            let pool = pool.clone();
            let job_id = job_id.clone();
            let update = update.clone();
            async move {
                iamac_activities::record_usage(
                    actx,
                    pool,
                    job_id,
                    "counter_update".to_string(),
                    0,
                    false,
                    None,
                    Some(update),
                )
                .await
            }
        },
    )
    .await
}

/// Waits for a named signal with a bounded deadline, returning `None` on
/// timeout. Thin wrapper over `WorkflowCtx::wait_for_signal`.
async fn await_signal(ctx: &mut WorkflowCtx, name: &str, deadline: Duration) -> Result<Option<Value>> {
    ctx.wait_for_signal(name, SIGNAL_POLL, Some(deadline)).await
}

/// Non-blocking check for a signal that may already be pending — used for
/// `spec_updated`, which per §3's data model can arrive asynchronously
/// mid-patch-generation without the workflow ever explicitly awaiting it.
async fn poll_signal_now(ctx: &mut WorkflowCtx, name: &str) -> Result<Option<Value>> {
    ctx.wait_for_signal(name, SIGNAL_POLL, Some(Duration::ZERO)).await
}

async fn do_run_tests(
    ctx: &mut WorkflowCtx,
    pool: &PgPool,
    executor: &dyn IdeExecutor,
    job: &Job,
    attempt_number: u32,
    phase: Phase,
    run_type: RunType,
    activity_name: &str,
) -> Result<TestRunResult> {
    let pool = pool.clone();
    let job_id = job.job_id.clone();
    let execution_mode = job.execution_mode.clone();

    ctx.execute_activity(
        activity_name,
        RetryPolicy::no_retry(),
        Duration::from_secs(20 * 60),
        move |actx: ActivityCtx| {
            let pool = pool.clone();
            let job_id = job_id.clone();
            let execution_mode = execution_mode.clone();
            async move {
                iamac_activities::run_tests(
                    actx,
                    pool,
                    executor,
                    job_id,
                    attempt_number,
                    phase,
                    run_type,
                    execution_mode,
                    None,
                )
                .await
            }
        },
    )
    .await
}

async fn drive(
    ctx: &mut WorkflowCtx,
    job: &mut Job,
    pool: &PgPool,
    gateway: &Arc<LlmGateway>,
    executor: &dyn IdeExecutor,
) -> Result<()> {
    run_prologue(ctx, job, pool, gateway).await?;
    run_baseline_loop(ctx, job, pool, gateway, executor).await?;
    run_repair_loop(ctx, job, pool, gateway, executor).await
}

/// Steps 1-3 of §4.4's prologue algorithm: ANALYZING through the first
/// entry into WAITING_SPEC_APPROVAL. Runs exactly once per job (unlike the
/// baseline loop, which can repeat).
async fn run_prologue(
    ctx: &mut WorkflowCtx,
    job: &mut Job,
    pool: &PgPool,
    gateway: &Arc<LlmGateway>,
) -> Result<()> {
    // Invariant #3: the entitlement snapshot must exist before ANALYZING.
    {
        let pool = pool.clone();
        let job_id = job.job_id.clone();
        ctx.execute_activity(
            "write_entitlement_snapshot",
            RetryPolicy::fixed(3, Duration::from_secs(1)),
            Duration::from_secs(30),
            move |actx: ActivityCtx| {
                let pool = pool.clone();
                let job_id = job_id.clone();
                async move { iamac_activities::write_entitlement_snapshot(actx, pool, job_id).await }
            },
        )
        .await?;
    }

    transition(ctx, pool, job, JobState::Analyzing, Value::Null).await?;
    {
        let job_id = job.job_id.clone();
        let tier = job.tier;
        ctx.execute_activity(
            "assemble_context",
            RetryPolicy {
                max_attempts: 3,
                initial_interval: Duration::from_secs(1),
                backoff_coefficient: 2.0,
            },
            Duration::from_secs(5 * 60),
            move |actx: ActivityCtx| {
                let job_id = job_id.clone();
                async move { iamac_activities::assemble_context(actx, job_id, tier).await }
            },
        )
        .await?;
    }

    transition(ctx, pool, job, JobState::WaitingStrategy, Value::Null).await?;
    {
        let gateway = gateway.clone();
        let job_id = job.job_id.clone();
        ctx.execute_activity(
            "generate_proposals",
            RetryPolicy::no_retry(),
            Duration::from_secs(30 * 60),
            move |actx: ActivityCtx| {
                let gateway = gateway.clone();
                let job_id = job_id.clone();
                async move { iamac_activities::generate_proposals(actx, &gateway, job_id).await }
            },
        )
        .await?;
    }

    let selected = await_signal(ctx, signal_names::PROPOSAL_SELECTED, DAY).await?;
    let Some(selected) = selected else {
        return Err(anyhow!("timed out waiting for proposalSelected signal"));
    };
    job.proposal_selected = selected
        .get("proposalId")
        .and_then(Value::as_str)
        .map(str::to_string);

    Ok(())
}

/// Steps 3-5: WAITING_SPEC_APPROVAL → GENERATING_TESTS → BASELINE_VALIDATION,
/// looping back through BASELINE_VALIDATION_FAILED on a failed baseline run
/// (invariant-driven reset of all three repair counters on each loop-back).
async fn run_baseline_loop(
    ctx: &mut WorkflowCtx,
    job: &mut Job,
    pool: &PgPool,
    gateway: &Arc<LlmGateway>,
    executor: &dyn IdeExecutor,
) -> Result<()> {
    loop {
        transition(ctx, pool, job, JobState::WaitingSpecApproval, Value::Null).await?;
        job.spec_approved = false;
        let approved = await_signal(ctx, signal_names::SPEC_APPROVED, DAY).await?;
        if approved.is_none() {
            return Err(anyhow!("timed out waiting for specApproved signal"));
        }
        job.spec_approved = true;

        transition(ctx, pool, job, JobState::GeneratingTests, Value::Null).await?;
        {
            let gateway = gateway.clone();
            let job_id = job.job_id.clone();
            ctx.execute_activity(
                "generate_tests",
                RetryPolicy::fixed(3, Duration::from_secs(1)),
                Duration::from_secs(30 * 60),
                move |actx: ActivityCtx| {
                    let gateway = gateway.clone();
                    let job_id = job_id.clone();
                    async move { iamac_activities::generate_tests(actx, &gateway, job_id).await }
                },
            )
            .await?;
        }

        transition(ctx, pool, job, JobState::BaselineValidation, Value::Null).await?;
        let baseline = do_run_tests(
            ctx,
            pool,
            executor,
            job,
            0,
            1,
            RunType::Baseline,
            "run_tests:BASELINE",
        )
        .await?;

        if baseline.passed {
            transition(ctx, pool, job, JobState::Refactoring, Value::Null).await?;
            return Ok(());
        }

        transition(
            ctx,
            pool,
            job,
            JobState::BaselineValidationFailed,
            serde_json::json!({ "failure_pattern_fingerprint": baseline.failure_pattern_fingerprint }),
        )
        .await?;
        job.reset_counters();
        job.phase = 1;
        persist_counters(ctx, pool, job).await?;
    }
}

/// The repair loop (§4.4): entered at REFACTORING with `phase = 1`.
async fn run_repair_loop(
    ctx: &mut WorkflowCtx,
    job: &mut Job,
    pool: &PgPool,
    gateway: &Arc<LlmGateway>,
    executor: &dyn IdeExecutor,
) -> Result<()> {
    loop {
        if job.state != JobState::Refactoring {
            transition(ctx, pool, job, JobState::Refactoring, Value::Null).await?;
        }

        job.counters.attempt_count += 1;
        job.spec_updated = false;

        let is_deep_fix = job.intervention_action == Some(InterventionAction::DeepFix);
        let patch_phase = job.phase;
        let attempt_number = job.counters.attempt_count;

        let patch_result = {
            let gateway = gateway.clone();
            let job_id = job.job_id.clone();
            let tier = job.tier;
            ctx.execute_activity(
                "generate_patch",
                RetryPolicy::no_retry(),
                Duration::from_secs(30 * 60),
                move |actx: ActivityCtx| {
                    let gateway = gateway.clone();
                    let job_id = job_id.clone();
                    async move {
                        iamac_activities::generate_patch(
                            actx,
                            &gateway,
                            job_id,
                            attempt_number,
                            patch_phase,
                            tier,
                            is_deep_fix,
                        )
                        .await
                    }
                },
            )
            .await?
        };

        if poll_signal_now(ctx, signal_names::SPEC_UPDATED).await?.is_some() {
            job.spec_updated = true;
        }
        if poll_signal_now(ctx, signal_names::HEARTBEAT_RECEIVED).await?.is_some() {
            job.heartbeat_received = true;
        }
        if let Some(payload) = poll_signal_now(ctx, signal_names::NL_CONVERT_REQUESTED).await? {
            job.nl_convert_requested = Some(payload);
        }

        if job.spec_updated {
            job.reset_counters();
            persist_counters(ctx, pool, job).await?;
            transition(ctx, pool, job, JobState::WaitingSpecApproval, Value::Null).await?;
            job.spec_approved = false;
            let approved = await_signal(ctx, signal_names::SPEC_APPROVED, DAY).await?;
            if approved.is_none() {
                return Err(anyhow!(
                    "timed out waiting for specApproved signal (mid-repair spec update)"
                ));
            }
            job.spec_approved = true;
            transition(ctx, pool, job, JobState::Refactoring, Value::Null).await?;
            continue;
        }

        {
            let pool = pool.clone();
            let job_id = job.job_id.clone();
            let model_class = patch_result.model_class;
            let phase = patch_result.phase;
            ctx.execute_activity(
                "apply_patch",
                RetryPolicy::fixed(2, Duration::from_secs(1)),
                Duration::from_secs(10 * 60),
                move |actx: ActivityCtx| {
                    let pool = pool.clone();
                    let job_id = job_id.clone();
                    async move {
                        iamac_activities::apply_patch(actx, pool, job_id, attempt_number, phase, model_class)
                            .await
                    }
                },
            )
            .await?;
        }

        let test_result = do_run_tests(
            ctx,
            pool,
            executor,
            job,
            attempt_number,
            patch_result.phase,
            RunType::Repair,
            "run_tests:REPAIR",
        )
        .await?;

        if test_result.passed {
            transition(ctx, pool, job, JobState::Delivered, Value::Null).await?;
            return Ok(());
        }

        let fingerprint = test_result.failure_pattern_fingerprint;
        if fingerprint.is_some() && fingerprint == job.counters.last_fingerprint {
            job.counters.identical_failure_count += 1;
        } else {
            job.counters.identical_failure_count = 1;
            job.counters.last_fingerprint = fingerprint;
        }
        persist_counters(ctx, pool, job).await?;

        if job.counters.identical_failure_count >= 3 {
            match dispatch_intervention(ctx, job, pool).await? {
                InterventionOutcome::Continue => continue,
                InterventionOutcome::Terminated => return Ok(()),
            }
        }

        if job.counters.attempt_count >= phase_cap(job.phase) {
            match dispatch_escalation(ctx, job, pool).await? {
                InterventionOutcome::Continue => continue,
                InterventionOutcome::Terminated => return Ok(()),
            }
        }

        transition(ctx, pool, job, JobState::SelfHealing, Value::Null).await?;
    }
}

enum InterventionOutcome {
    Continue,
    Terminated,
}

/// §4.4 step 8: `identical_failure_count >= 3`.
async fn dispatch_intervention(
    ctx: &mut WorkflowCtx,
    job: &mut Job,
    pool: &PgPool,
) -> Result<InterventionOutcome> {
    transition(ctx, pool, job, JobState::WaitingIntervention, Value::Null).await?;
    job.intervention_action = None;

    let payload = await_signal(ctx, signal_names::INTERVENTION_ACTION, Duration::from_secs(30 * 60)).await?;
    let Some(payload) = payload else {
        fail(ctx, pool, job, "INTERVENTION_TIMEOUT").await?;
        return Ok(InterventionOutcome::Terminated);
    };

    let action = payload
        .get("action")
        .and_then(Value::as_str)
        .and_then(InterventionAction::from_str_loose);
    job.intervention_action = action;

    match action {
        Some(InterventionAction::DeepFix) => {
            transition(ctx, pool, job, JobState::DeepFixActive, Value::Null).await?;
            job.reset_counters();
            job.phase = (job.phase + 1).min(3);
            persist_counters(ctx, pool, job).await?;
            transition(ctx, pool, job, JobState::SelfHealing, Value::Null).await?;
            Ok(InterventionOutcome::Continue)
        }
        Some(InterventionAction::Command) => {
            transition(ctx, pool, job, JobState::UserIntervening, Value::Null).await?;
            let confirmation = await_signal(ctx, signal_names::INTERVENTION_ACTION, 4 * HOUR).await?;
            let confirmed = confirmation
                .and_then(|p| p.get("action").and_then(Value::as_str).map(str::to_string))
                .map(|s| InterventionAction::from_str_loose(&s) == Some(InterventionAction::TestsPassed))
                .unwrap_or(false);
            if !confirmed {
                fail(ctx, pool, job, "USER_INTERVENTION_TIMEOUT").await?;
                return Ok(InterventionOutcome::Terminated);
            }
            transition(ctx, pool, job, JobState::Delivered, Value::Null).await?;
            Ok(InterventionOutcome::Terminated)
        }
        // CONTINUE, and any unrecognized/missing action, degrades to CONTINUE —
        // counters are left untouched either way.
        _ => {
            transition(ctx, pool, job, JobState::SelfHealing, Value::Null).await?;
            Ok(InterventionOutcome::Continue)
        }
    }
}

/// §4.4 step 9: `attempt_count >= cap(phase)`.
async fn dispatch_escalation(
    ctx: &mut WorkflowCtx,
    job: &mut Job,
    pool: &PgPool,
) -> Result<InterventionOutcome> {
    if job.phase >= 3 {
        transition(ctx, pool, job, JobState::RecoveryPending, Value::Null).await?;
        transition(ctx, pool, job, JobState::FallbackRequired, Value::Null).await?;
        return Ok(InterventionOutcome::Terminated);
    }

    transition(ctx, pool, job, JobState::WaitingEscalationDecision, Value::Null).await?;
    job.intervention_action = None;

    let payload = await_signal(ctx, signal_names::INTERVENTION_ACTION, HOUR).await?;
    let Some(payload) = payload else {
        fail(ctx, pool, job, "ESCALATION_CONFIRMATION_TIMEOUT").await?;
        return Ok(InterventionOutcome::Terminated);
    };

    let action = payload
        .get("action")
        .and_then(Value::as_str)
        .and_then(InterventionAction::from_str_loose);

    match action {
        Some(InterventionAction::Escalate) => {
            job.phase += 1;
            job.counters.attempt_count = 0;
            persist_counters(ctx, pool, job).await?;
            transition(ctx, pool, job, JobState::SelfHealing, Value::Null).await?;
            Ok(InterventionOutcome::Continue)
        }
        // CANCEL — "treated as FAILED (no other terminal path is defined for
        // CANCEL)" per spec §4.4 step 9. Any other/missing action is treated
        // the same way: the decision window closed without an escalation.
        _ => {
            fail(ctx, pool, job, "ESCALATION_CANCELLED").await?;
            Ok(InterventionOutcome::Terminated)
        }
    }
}
