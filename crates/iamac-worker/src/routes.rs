//! The axum control plane: §4.5's five job routes plus `/health`. Handlers
//! take `State<Arc<AppState>>` and answer lookup/enqueue failures with a
//! JSON error body instead of a bare status code.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::api_types::{
    ErrorResponse, HealthResponse, RevertJobRequest, RevertJobResponse, SignalAcceptedResponse,
    SignalPayload, StartJobRequest, StartJobResponse,
};
use crate::state::AppState;

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/jobs", post(start_job))
        .route("/v1/jobs/:job_id/signals/:signal_name", post(send_signal))
        .route("/v1/jobs/:job_id/state", get(job_state))
        .route("/v1/jobs/:job_id/history", get(job_history))
        .route("/v1/jobs/:job_id/revert", post(revert_job))
        .layer(TraceLayer::new_for_http())
        .layer(cors_permissive())
        .with_state(state)
}

/// Localhost-facing control plane; no credentials cross this boundary, so
/// unlike a public-facing service there's nothing a permissive CORS policy
/// exposes here.
fn cors_permissive() -> CorsLayer {
    CorsLayer::permissive()
}

fn refactor_run_id(job_id: &str) -> String {
    format!("refactor-{job_id}")
}

fn revert_run_id(job_id: &str) -> String {
    format!("revert-{job_id}")
}

fn internal_error(context: &str, err: anyhow::Error) -> (StatusCode, Json<ErrorResponse>) {
    tracing::error!(error = %err, context, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse {
            error: format!("{context}: {err}"),
        }),
    )
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        ok: true,
        service: state.build.service,
        version: state.build.version,
    })
}

async fn start_job(
    State(state): State<Arc<AppState>>,
    Json(req): Json<StartJobRequest>,
) -> impl IntoResponse {
    let job_id = req
        .job_id
        .unwrap_or_else(|| format!("job_{}", uuid::Uuid::new_v4()));

    if let Err(err) = iamac_db::insert_job(
        &state.pool,
        &iamac_db::NewJob {
            job_id: job_id.clone(),
            owner_id: req.user_id.clone(),
            execution_mode: req.execution_mode.clone(),
        },
    )
    .await
    {
        return internal_error("insert_job failed", err).into_response();
    }

    let run_id = refactor_run_id(&job_id);
    let input = serde_json::json!({
        "job_id": job_id,
        "user_id": req.user_id,
        "tier": req.tier,
        "execution_mode": req.execution_mode,
    });

    let enqueued = iamac_db::enqueue_workflow_run(
        &state.pool,
        &iamac_db::NewWorkflowRun {
            run_id: &run_id,
            workflow_type: iamac_workflow::REFACTOR_JOB_WORKFLOW,
            task_queue: &state.task_queue,
            input,
        },
    )
    .await;

    match enqueued {
        Ok(_) => (
            StatusCode::ACCEPTED,
            Json(StartJobResponse { job_id, run_id }),
        )
            .into_response(),
        Err(err) => internal_error("enqueue_workflow_run failed", err).into_response(),
    }
}

async fn send_signal(
    State(state): State<Arc<AppState>>,
    Path((job_id, signal_name)): Path<(String, String)>,
    Json(payload): Json<SignalPayload>,
) -> impl IntoResponse {
    let run_id = refactor_run_id(&job_id);

    match iamac_db::workflow_send_signal(&state.pool, &run_id, &signal_name, &payload).await {
        Ok(()) => (
            StatusCode::ACCEPTED,
            Json(SignalAcceptedResponse { job_id, signal_name }),
        )
            .into_response(),
        Err(err) => internal_error("workflow_send_signal failed", err).into_response(),
    }
}

async fn job_state(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> impl IntoResponse {
    match iamac_db::fetch_job(&state.pool, &job_id).await {
        Ok(Some(row)) => Json(row).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: format!("no job {job_id}"),
            }),
        )
            .into_response(),
        Err(err) => internal_error("fetch_job failed", err).into_response(),
    }
}

async fn job_history(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> impl IntoResponse {
    let run_id = refactor_run_id(&job_id);
    match iamac_db::workflow_load_events(&state.pool, &run_id).await {
        Ok(events) => Json(events).into_response(),
        Err(err) => internal_error("workflow_load_events failed", err).into_response(),
    }
}

async fn revert_job(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
    Json(req): Json<RevertJobRequest>,
) -> impl IntoResponse {
    let run_id = revert_run_id(&job_id);
    let input = serde_json::json!({
        "job_id": job_id,
        "user_id": req.user_id,
    });

    let enqueued = iamac_db::enqueue_workflow_run(
        &state.pool,
        &iamac_db::NewWorkflowRun {
            run_id: &run_id,
            workflow_type: iamac_workflow::REVERT_WORKFLOW,
            task_queue: &state.task_queue,
            input,
        },
    )
    .await;

    match enqueued {
        Ok(_) => (
            StatusCode::ACCEPTED,
            Json(RevertJobResponse { job_id, run_id }),
        )
            .into_response(),
        Err(err) => internal_error("enqueue_workflow_run failed", err).into_response(),
    }
}
