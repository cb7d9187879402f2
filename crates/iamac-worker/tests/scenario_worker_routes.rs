//! In-process scenario tests for `iamac-worker`'s HTTP endpoints, driven via
//! `tower::ServiceExt::oneshot` with no bound TCP socket — no network I/O
//! required.
//!
//! DB-backed (the router's handlers hit Postgres directly) and skipped if
//! `IAMAC_DATABASE_URL` is not set.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use iamac_worker::{routes, state};
use tower::ServiceExt;

async fn connect() -> Option<sqlx::PgPool> {
    let url = std::env::var(iamac_db::ENV_DB_URL).ok()?;
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(2)
        .connect(&url)
        .await
        .ok()?;
    iamac_db::migrate(&pool).await.ok()?;
    Some(pool)
}

async fn call(router: axum::Router, req: Request<Body>) -> (StatusCode, serde_json::Value) {
    let resp = router.oneshot(req).await.expect("oneshot failed");
    let status = resp.status();
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    let json = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).expect("body is not valid JSON")
    };
    (status, json)
}

#[tokio::test]
async fn health_returns_200_ok_true() {
    let Some(pool) = connect().await else {
        eprintln!("SKIP: {} not set", iamac_db::ENV_DB_URL);
        return;
    };
    let st = Arc::new(state::AppState::new(pool, "iama-test-queue"));
    let router = routes::build_router(st);

    let req = Request::builder()
        .method("GET")
        .uri("/health")
        .body(Body::empty())
        .unwrap();
    let (status, json) = call(router, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["ok"], true);
    assert_eq!(json["service"], "iamac-worker");
}

#[tokio::test]
async fn start_job_then_state_reports_pending() {
    let Some(pool) = connect().await else {
        eprintln!("SKIP: {} not set", iamac_db::ENV_DB_URL);
        return;
    };
    let st = Arc::new(state::AppState::new(pool, "iama-test-queue"));

    let job_id = format!("job_{}", uuid::Uuid::new_v4());
    let body = serde_json::json!({
        "job_id": job_id,
        "user_id": "user_1",
        "tier": "PRO",
        "execution_mode": "IDE_LOCAL",
    });

    let start_req = Request::builder()
        .method("POST")
        .uri("/v1/jobs")
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap();
    let (status, json) = call(routes::build_router(Arc::clone(&st)), start_req).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(json["job_id"], job_id);

    let state_req = Request::builder()
        .method("GET")
        .uri(format!("/v1/jobs/{job_id}/state"))
        .body(Body::empty())
        .unwrap();
    let (status, json) = call(routes::build_router(Arc::clone(&st)), state_req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "PENDING");
}

#[tokio::test]
async fn unknown_job_state_returns_404() {
    let Some(pool) = connect().await else {
        eprintln!("SKIP: {} not set", iamac_db::ENV_DB_URL);
        return;
    };
    let st = Arc::new(state::AppState::new(pool, "iama-test-queue"));
    let router = routes::build_router(st);

    let req = Request::builder()
        .method("GET")
        .uri("/v1/jobs/does-not-exist/state")
        .body(Body::empty())
        .unwrap();
    let (status, _) = call(router, req).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
