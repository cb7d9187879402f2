//! Deterministic `IdeExecutor` fake for tests that exercise `run_tests`
//! without a live IDE extension sandbox. No randomness, no I/O — outcomes
//! are queued up front and played back in call order.

use std::sync::Mutex;

use anyhow::{anyhow, Result};
use iamac_schemas::RunType;

use crate::ide::{IdeExecutor, IdeTestOutcome};

/// Plays back a fixed queue of outcomes, one per call to `run_tests`.
pub struct FakeIdeExecutor {
    outcomes: Mutex<Vec<IdeTestOutcome>>,
}

impl FakeIdeExecutor {
    /// Outcomes are consumed in order (first call gets `outcomes[0]`, etc).
    pub fn new(outcomes: Vec<IdeTestOutcome>) -> Self {
        Self {
            outcomes: Mutex::new(outcomes.into_iter().rev().collect()),
        }
    }

    /// Always passes, with no fingerprint.
    pub fn always_passes() -> Self {
        Self::new(vec![IdeTestOutcome {
            passed: true,
            failure_pattern_fingerprint: None,
        }])
    }

    /// Fails `n` times with the same fingerprint (to drive identical-failure
    /// accumulation), then passes.
    pub fn fails_then_passes(n: usize, fingerprint: &str) -> Self {
        let mut outcomes: Vec<IdeTestOutcome> = (0..n)
            .map(|_| IdeTestOutcome {
                passed: false,
                failure_pattern_fingerprint: Some(fingerprint.to_string()),
            })
            .collect();
        outcomes.push(IdeTestOutcome {
            passed: true,
            failure_pattern_fingerprint: None,
        });
        Self::new(outcomes)
    }
}

#[async_trait::async_trait]
impl IdeExecutor for FakeIdeExecutor {
    async fn run_tests(
        &self,
        _job_id: &str,
        _run_type: RunType,
        _attempt_number: u32,
    ) -> Result<IdeTestOutcome> {
        self.outcomes
            .lock()
            .unwrap()
            .pop()
            .ok_or_else(|| anyhow!("FakeIdeExecutor ran out of queued outcomes"))
    }
}
