use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::Value;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::ctx::WorkflowCtx;

/// A registered workflow body: takes ownership of its `WorkflowCtx` and the
/// run's decoded input, and drives the run to completion (or an error,
/// which marks the run FAILED). The `Ok` payload is persisted as the run's
/// `result` — most workflows have nothing to say and return `Value::Null`.
pub type WorkflowFn =
    Arc<dyn Fn(WorkflowCtx, Value) -> Pin<Box<dyn Future<Output = Result<Value>> + Send>> + Send + Sync>;

/// Default lease: how long a CLAIMED/RUNNING run can go without completing
/// before `reclaim_stale` assumes its worker died and puts it back to
/// PENDING for someone else to pick up.
pub const DEFAULT_CLAIM_LEASE: Duration = Duration::from_secs(5 * 60);

/// Claims and executes `workflow_runs` for one task queue.
///
/// Each claimed run executes on its own Tokio task, so one slow or hung
/// workflow cannot block others claimed in the same batch.
pub struct Runner {
    pool: PgPool,
    task_queue: String,
    worker_id: String,
    registry: HashMap<String, WorkflowFn>,
}

impl Runner {
    pub fn new(pool: PgPool, task_queue: impl Into<String>, worker_id: impl Into<String>) -> Self {
        Self {
            pool,
            task_queue: task_queue.into(),
            worker_id: worker_id.into(),
            registry: HashMap::new(),
        }
    }

    pub fn register(&mut self, workflow_type: impl Into<String>, f: WorkflowFn) {
        self.registry.insert(workflow_type.into(), f);
    }

    /// Puts CLAIMED/RUNNING runs whose claim has outlived `lease` back to
    /// PENDING. Safe to call repeatedly — each call only touches runs that
    /// are still past the deadline, so a worker racing its own live runs
    /// (claimed well within the lease) never reclaims its own work.
    pub async fn reclaim_stale(&self, lease: Duration) -> Result<u64> {
        let reclaimed = iamac_db::workflow_reclaim_stale(&self.pool, &self.task_queue, lease)
            .await
            .context("workflow_reclaim_stale failed")?;
        if reclaimed > 0 {
            warn!(reclaimed, task_queue = %self.task_queue, "reclaimed stale workflow runs");
        }
        Ok(reclaimed)
    }

    /// Claims up to `batch_size` PENDING runs and spawns each on its own
    /// task. Returns the number of runs claimed (not necessarily completed
    /// by the time this returns — this does not await the spawned tasks).
    pub async fn claim_and_dispatch(&self, batch_size: i64) -> Result<usize> {
        let claimed =
            iamac_db::workflow_claim_batch(&self.pool, &self.task_queue, batch_size, &self.worker_id)
                .await
                .context("workflow_claim_batch failed")?;

        let count = claimed.len();

        for run in claimed {
            let Some(workflow_fn) = self.registry.get(&run.workflow_type).cloned() else {
                warn!(
                    run_id = %run.run_id,
                    workflow_type = %run.workflow_type,
                    "no registered workflow for this type; marking run FAILED"
                );
                iamac_db::workflow_set_status(&self.pool, &run.run_id, "FAILED").await?;
                continue;
            };

            let pool = self.pool.clone();
            let run_id = run.run_id.clone();

            tokio::spawn(async move {
                let events = match iamac_db::workflow_load_events(&pool, &run_id).await {
                    Ok(events) => events,
                    Err(err) => {
                        error!(run_id = %run_id, error = %err, "failed to load workflow event log");
                        let _ = iamac_db::workflow_set_status(&pool, &run_id, "FAILED").await;
                        return;
                    }
                };

                let cancel = CancellationToken::new();
                let wf_ctx = WorkflowCtx::new(pool.clone(), run_id.clone(), events, cancel);

                let _ = iamac_db::workflow_set_status(&pool, &run_id, "RUNNING").await;

                let outcome = workflow_fn(wf_ctx, run.input.clone()).await;

                let persisted = match outcome {
                    Ok(result) => iamac_db::workflow_complete(&pool, &run_id, &result).await,
                    Err(err) => {
                        error!(run_id = %run_id, error = %err, "workflow run failed");
                        iamac_db::workflow_set_status(&pool, &run_id, "FAILED").await
                    }
                };

                if let Err(err) = persisted {
                    error!(run_id = %run_id, error = %err, "failed to persist terminal workflow status");
                }
            });
        }

        Ok(count)
    }

    /// Polls `claim_and_dispatch` forever at `poll_interval`, reclaiming
    /// stale claims once per iteration first (so this also covers the
    /// startup-recovery case — the first iteration runs before anything
    /// else does). Never returns under normal operation. Intended to be
    /// spawned as its own background task by `iamac-worker`.
    pub async fn run_forever(&self, batch_size: i64, poll_interval: Duration, lease: Duration) -> Result<()> {
        loop {
            self.reclaim_stale(lease).await?;

            let claimed = self.claim_and_dispatch(batch_size).await?;
            if claimed == 0 {
                tokio::time::sleep(poll_interval).await;
            } else {
                info!(claimed, task_queue = %self.task_queue, "dispatched workflow runs");
            }
        }
    }
}
