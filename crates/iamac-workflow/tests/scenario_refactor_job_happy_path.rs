//! Drives `run_refactor_job` end to end against a real Postgres instance
//! with a fake LLM backend and a fake, always-passing IDE executor — the
//! happy path through the prologue straight to DELIVERED on the first
//! repair attempt.
//!
//! Requires `IAMAC_DATABASE_URL`; skipped otherwise, same convention as
//! `iamac-activities`'s DB-backed scenario test.

use std::sync::Arc;
use std::time::Duration;

use iamac_activities::fake_ide::FakeIdeExecutor;
use iamac_activities::IdeTestOutcome;
use iamac_llm::fake::FakeLlmBackend;
use iamac_llm::LlmGateway;
use iamac_runtime::WorkflowCtx;
use iamac_workflow::run_refactor_job;
use tokio_util::sync::CancellationToken;

#[tokio::test]
#[ignore = "requires IAMAC_DATABASE_URL"]
async fn happy_path_delivers_on_first_repair_attempt() {
    let Ok(db_url) = std::env::var(iamac_db::ENV_DB_URL) else {
        eprintln!("skipping: {} not set", iamac_db::ENV_DB_URL);
        return;
    };

    let pool = iamac_db::connect(&db_url).await.expect("connect");
    iamac_db::migrate(&pool).await.expect("migrate");

    let job_id = format!("job_{}", uuid::Uuid::new_v4());
    let run_id = format!("run_{}", uuid::Uuid::new_v4());

    iamac_db::insert_job(
        &pool,
        &iamac_db::NewJob {
            job_id: job_id.clone(),
            owner_id: "user_1".to_string(),
            execution_mode: "IDE_LOCAL".to_string(),
        },
    )
    .await
    .expect("insert_job");

    let input = serde_json::json!({
        "job_id": job_id,
        "user_id": "user_1",
        "tier": "PRO",
        "execution_mode": "IDE_LOCAL",
    });

    let signal_pool = pool.clone();
    let signal_run_id = run_id.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        iamac_db::workflow_send_signal(
            &signal_pool,
            &signal_run_id,
            "proposalSelected",
            &serde_json::json!({ "proposalId": "p1" }),
        )
        .await
        .expect("send proposalSelected");

        tokio::time::sleep(Duration::from_millis(200)).await;
        iamac_db::workflow_send_signal(
            &signal_pool,
            &signal_run_id,
            "specApproved",
            &serde_json::json!({}),
        )
        .await
        .expect("send specApproved");
    });

    let ctx = WorkflowCtx::new(pool.clone(), run_id, Vec::new(), CancellationToken::new());
    let gateway = Arc::new(LlmGateway::new(Arc::new(FakeLlmBackend::single_patch_op())));
    // One passing outcome for the BASELINE run, one for the first REPAIR
    // attempt — the happy path reaches DELIVERED without ever failing.
    let executor: Arc<dyn iamac_activities::IdeExecutor> = Arc::new(FakeIdeExecutor::new(vec![
        IdeTestOutcome {
            passed: true,
            failure_pattern_fingerprint: None,
        },
        IdeTestOutcome {
            passed: true,
            failure_pattern_fingerprint: None,
        },
    ]));

    run_refactor_job(ctx, input, pool.clone(), gateway, executor)
        .await
        .expect("workflow run succeeds");

    let row = iamac_db::fetch_job(&pool, &job_id)
        .await
        .expect("fetch_job")
        .expect("job row exists");
    assert_eq!(row.status, "DELIVERED");
}
