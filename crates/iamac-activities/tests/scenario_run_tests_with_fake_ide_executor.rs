//! Exercises `run_tests` against the deterministic `FakeIdeExecutor`
//! instead of a live IDE extension sandbox. Needs a real Postgres
//! (`IAMAC_DATABASE_URL`) for the persistence half — skips otherwise, same
//! convention as the `iamac-db` scenario tests.

use iamac_activities::{fake_ide::FakeIdeExecutor, run_tests};
use iamac_runtime::ActivityCtx;
use iamac_schemas::RunType;
use tokio_util::sync::CancellationToken;

#[tokio::test]
#[ignore = "requires IAMAC_DATABASE_URL; run with `cargo test -- --ignored`"]
async fn run_tests_records_a_passing_baseline_run() {
    let Ok(database_url) = std::env::var(iamac_db::ENV_DB_URL) else {
        eprintln!("skipping: {} not set", iamac_db::ENV_DB_URL);
        return;
    };
    let pool = iamac_db::connect(&database_url).await.unwrap();
    iamac_db::migrate(&pool).await.unwrap();

    let job_id = format!("job_{}", uuid::Uuid::new_v4());
    iamac_db::insert_job(
        &pool,
        &iamac_db::NewJob {
            job_id: job_id.clone(),
            owner_id: format!("user_{}", uuid::Uuid::new_v4()),
            execution_mode: "LOCAL_NATIVE".to_string(),
        },
    )
    .await
    .unwrap();

    let executor = FakeIdeExecutor::always_passes();
    let actx = ActivityCtx::new(CancellationToken::new());

    let result = run_tests(
        actx,
        pool,
        &executor,
        job_id,
        0,
        1,
        RunType::Baseline,
        "LOCAL_NATIVE".to_string(),
        None,
    )
    .await
    .expect("run_tests activity succeeds");

    assert!(result.passed);
    assert!(result.failure_pattern_fingerprint.is_none());
}
