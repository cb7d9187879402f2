//! Workflow bodies and their `Runner` registration glue.

mod job;
mod refactor;
mod revert;

pub use job::{is_legal_edge, IllegalTransition, Job};
pub use refactor::run_refactor_job;
pub use revert::{run_revert_job, RevertInput, RevertOutput};

use std::sync::Arc;

use iamac_activities::IdeExecutor;
use iamac_llm::LlmGateway;
use iamac_runtime::WorkflowFn;
use sqlx::PgPool;

pub const REFACTOR_JOB_WORKFLOW: &str = "RefactorJobWorkflow";
pub const REVERT_WORKFLOW: &str = "RevertWorkflow";

/// Builds the `WorkflowFn` closures `iamac-worker` registers with its
/// `Runner`, closing over the shared pool/gateway/executor each workflow
/// type needs.
pub fn workflow_registrations(
    pool: PgPool,
    gateway: Arc<LlmGateway>,
    executor: Arc<dyn IdeExecutor>,
) -> Vec<(&'static str, WorkflowFn)> {
    let refactor_pool = pool.clone();
    let refactor_fn: WorkflowFn = Arc::new(move |ctx, input| {
        let pool = refactor_pool.clone();
        let gateway = gateway.clone();
        let executor = executor.clone();
        Box::pin(async move { run_refactor_job(ctx, input, pool, gateway, executor).await })
    });

    let revert_pool = pool;
    let revert_fn: WorkflowFn = Arc::new(move |ctx, input| {
        let pool = revert_pool.clone();
        Box::pin(async move { run_revert_job(ctx, input, pool).await })
    });

    vec![
        (REFACTOR_JOB_WORKFLOW, refactor_fn),
        (REVERT_WORKFLOW, revert_fn),
    ]
}
