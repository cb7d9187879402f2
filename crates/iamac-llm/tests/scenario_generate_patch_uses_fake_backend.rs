//! End-to-end exercise of `LlmGateway::generate_patch` against the
//! deterministic fake backend, with no network access.

use std::sync::Arc;

use iamac_llm::fake::FakeLlmBackend;
use iamac_llm::LlmGateway;
use iamac_schemas::Tier;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn generate_patch_returns_a_single_patch_edit_schema_operation() {
    let gateway = LlmGateway::new(Arc::new(FakeLlmBackend::single_patch_op()));

    let mut heartbeats = 0;
    let outcome = gateway
        .generate_patch(
            "job_e2e",
            1,
            1,
            Tier::Pro,
            false,
            CancellationToken::new(),
            move || heartbeats += 1,
        )
        .await
        .expect("fake backend never errors");

    assert_eq!(outcome.model_class, "iama-router-l1");
    let parsed: serde_json::Value =
        serde_json::from_str(&outcome.raw_text).expect("fake chunk is valid JSON");
    assert_eq!(parsed["op"], "exact_search_replace");
}
