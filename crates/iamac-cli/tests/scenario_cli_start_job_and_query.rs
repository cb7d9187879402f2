//! `iamac start-job` followed by `iamac query` round-trips through the
//! same Postgres-backed queue the worker polls.
//!
//! DB-backed and skipped if `IAMAC_DATABASE_URL` is not set.

use uuid::Uuid;

#[tokio::test]
async fn start_job_then_query_reports_pending() -> anyhow::Result<()> {
    let url = match std::env::var(iamac_db::ENV_DB_URL) {
        Ok(v) => v,
        Err(_) => {
            eprintln!("SKIP: {} not set", iamac_db::ENV_DB_URL);
            return Ok(());
        }
    };

    let pool = match sqlx::postgres::PgPoolOptions::new()
        .max_connections(2)
        .connect(&url)
        .await
    {
        Ok(p) => p,
        Err(e) => {
            eprintln!("SKIP: cannot connect to DB: {e}");
            return Ok(());
        }
    };
    if let Err(e) = iamac_db::migrate(&pool).await {
        eprintln!("SKIP: cannot migrate DB: {e}");
        return Ok(());
    }

    let job_id = format!("job_{}", Uuid::new_v4());

    let mut start = assert_cmd::Command::cargo_bin("iamac")?;
    start
        .env("DATABASE_URL", &url)
        .args([
            "start-job",
            "--user-id",
            "user_1",
            "--tier",
            "PRO",
            "--job-id",
            &job_id,
        ]);
    start
        .assert()
        .success()
        .stdout(predicates::str::contains(format!("job_id={job_id}")));

    let mut query = assert_cmd::Command::cargo_bin("iamac")?;
    query.env("DATABASE_URL", &url).args(["query", &job_id]);
    query
        .assert()
        .success()
        .stdout(predicates::str::contains("state=PENDING"));

    Ok(())
}
