//! Worker host binary (§4.5): connects to Postgres, registers the workflow
//! bodies against one task queue, and serves a small axum control plane
//! alongside the polling loop — an HTTP surface fronting the durable
//! dispatch loop, with `Runner::run_forever` as the claim-and-execute side.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use iamac_activities::HttpIdeExecutor;
use iamac_config::Settings;
use iamac_llm::live::ReqwestLlmBackend;
use iamac_llm::LlmGateway;
use iamac_runtime::Runner;
use iamac_worker::routes::build_router;
use iamac_worker::state::AppState;

fn init_tracing(log_level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::from_env().context("loading settings")?;
    init_tracing(&settings.log_level);

    tracing::info!(
        task_queue = %settings.temporal_task_queue,
        bind_addr = %settings.worker_bind_addr,
        "starting iamac-worker"
    );

    let pool = iamac_db::connect(&settings.database_url)
        .await
        .context("connecting to database")?;
    iamac_db::migrate(&pool).await.context("running migrations")?;

    let gateway = Arc::new(LlmGateway::new(Arc::new(ReqwestLlmBackend::new(
        settings.litellm_api_base.clone(),
    ))));
    let executor: Arc<dyn iamac_activities::IdeExecutor> =
        Arc::new(HttpIdeExecutor::new(settings.ide_extension_base.clone()));

    let mut runner = Runner::new(
        pool.clone(),
        settings.temporal_task_queue.clone(),
        format!("iamac-worker-{}", uuid::Uuid::new_v4()),
    );
    for (workflow_type, workflow_fn) in
        iamac_workflow::workflow_registrations(pool.clone(), gateway, executor)
    {
        runner.register(workflow_type, workflow_fn);
    }

    let poll_interval = Duration::from_millis(500);
    let batch_size = settings.max_concurrent_workflow_tasks as i64;
    tokio::spawn(async move {
        if let Err(err) = runner
            .run_forever(batch_size, poll_interval, iamac_runtime::DEFAULT_CLAIM_LEASE)
            .await
        {
            tracing::error!(error = %err, "workflow runner loop exited");
        }
    });

    let state = Arc::new(AppState::new(pool, settings.temporal_task_queue.clone()));
    let router = build_router(state);

    let listener = tokio::net::TcpListener::bind(&settings.worker_bind_addr)
        .await
        .with_context(|| format!("binding {}", settings.worker_bind_addr))?;

    axum::serve(listener, router)
        .await
        .context("axum server exited")?;

    Ok(())
}
