//! Request and response types for every `iamac-worker` HTTP endpoint.
//!
//! `Serialize + Deserialize` so axum can JSON-encode/decode them directly;
//! no business logic lives here.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// GET /health
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub ok: bool,
    pub service: &'static str,
    pub version: &'static str,
}

// ---------------------------------------------------------------------------
// POST /v1/jobs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct StartJobRequest {
    /// Caller-assigned id. Generated if omitted.
    pub job_id: Option<String>,
    pub user_id: String,
    pub tier: String,
    pub execution_mode: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct StartJobResponse {
    pub job_id: String,
    pub run_id: String,
}

// ---------------------------------------------------------------------------
// POST /v1/jobs/:job_id/signals/:signal_name
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct SignalAcceptedResponse {
    pub job_id: String,
    pub signal_name: String,
}

/// The signal payload body. Any JSON object — its shape is signal-specific
/// (`proposalSelected` carries `proposalId`, `interventionAction` carries
/// `action`, and so on), so `run_refactor_job` is the only thing that
/// interprets it.
pub type SignalPayload = Value;

// ---------------------------------------------------------------------------
// POST /v1/jobs/:job_id/revert
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct RevertJobRequest {
    pub user_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RevertJobResponse {
    pub job_id: String,
    pub run_id: String,
}

// ---------------------------------------------------------------------------
// Error body shared by all routes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}
