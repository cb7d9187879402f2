//! End-to-end through the activity wrapper (not just `LlmGateway` directly):
//! fake backend -> `generate_patch` activity -> parsed `PatchResult`.

use std::sync::Arc;

use iamac_activities::generate_patch;
use iamac_llm::{fake::FakeLlmBackend, LlmGateway};
use iamac_runtime::ActivityCtx;
use iamac_schemas::{PatchOp, Tier};
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn generate_patch_activity_downgrades_l3_for_free_tier_and_parses_one_op() {
    let backend = Arc::new(FakeLlmBackend::single_patch_op());
    let gateway = LlmGateway::new(backend);
    let actx = ActivityCtx::new(CancellationToken::new());

    let result = generate_patch(
        actx,
        &gateway,
        "job_42".to_string(),
        1,
        3,
        Tier::Free,
        false,
    )
    .await
    .expect("generate_patch activity succeeds");

    assert_eq!(result.model_class, "iama-router-l2");
    assert_eq!(result.phase, 2);
    assert_eq!(result.patch_ops.len(), 1);
    assert!(matches!(result.patch_ops[0], PatchOp::ExactSearchReplace { .. }));
}

#[tokio::test]
async fn generate_patch_activity_keeps_l3_for_enterprise_tier() {
    let backend = Arc::new(FakeLlmBackend::single_patch_op());
    let gateway = LlmGateway::new(backend);
    let actx = ActivityCtx::new(CancellationToken::new());

    let result = generate_patch(
        actx,
        &gateway,
        "job_43".to_string(),
        1,
        3,
        Tier::Enterprise,
        true,
    )
    .await
    .expect("generate_patch activity succeeds");

    assert_eq!(result.model_class, "iama-router-l3");
    assert_eq!(result.phase, 3);
}
