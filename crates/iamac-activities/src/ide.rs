//! The IDE extension sandbox is an external collaborator (spec §1,
//! "out of scope"): it owns file reads, sandboxed test execution, and
//! reverse-patch application. `IdeExecutor` is the seam `run_tests` calls
//! through so the workflow layer never depends on a concrete transport.

use anyhow::{Context, Result};
use iamac_schemas::RunType;

/// Result of delegating one test run to the IDE extension.
#[derive(Debug, Clone)]
pub struct IdeTestOutcome {
    pub passed: bool,
    /// `None` disables identical-failure accumulation for this attempt
    /// (§4.3).
    pub failure_pattern_fingerprint: Option<String>,
}

#[async_trait::async_trait]
pub trait IdeExecutor: Send + Sync {
    async fn run_tests(
        &self,
        job_id: &str,
        run_type: RunType,
        attempt_number: u32,
    ) -> Result<IdeTestOutcome>;
}

/// Delegates to the IDE extension over HTTP, mirroring
/// `iamac_llm::live::ReqwestLlmBackend`'s shape for the other external
/// collaborator this workspace talks to: one `reqwest::Client`, one base
/// URL, a single POST per call.
pub struct HttpIdeExecutor {
    client: reqwest::Client,
    base_url: String,
}

impl HttpIdeExecutor {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

#[derive(serde::Deserialize)]
struct RunTestsResponse {
    passed: bool,
    failure_pattern_fingerprint: Option<String>,
}

#[async_trait::async_trait]
impl IdeExecutor for HttpIdeExecutor {
    async fn run_tests(
        &self,
        job_id: &str,
        run_type: RunType,
        attempt_number: u32,
    ) -> Result<IdeTestOutcome> {
        let payload = serde_json::json!({
            "job_id": job_id,
            "run_type": run_type,
            "attempt_number": attempt_number,
        });

        let response = self
            .client
            .post(format!("{}/run-tests", self.base_url))
            .json(&payload)
            .send()
            .await
            .context("ide extension request failed")?
            .error_for_status()
            .context("ide extension returned an error status")?;

        let body: RunTestsResponse = response
            .json()
            .await
            .context("ide extension response was not valid JSON")?;

        Ok(IdeTestOutcome {
            passed: body.passed,
            failure_pattern_fingerprint: body.failure_pattern_fingerprint,
        })
    }
}
