//! The authoritative in-memory job record (spec §3) and the legal-edge
//! table its transition helper checks against.

use std::fmt;

use iamac_schemas::{Counters, ExecutionMode, InterventionAction, JobInput, JobState, Phase, Tier};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    pub user_id: String,
    pub tier: Tier,
    pub execution_mode: ExecutionMode,
    pub state: JobState,
    pub proposal_selected: Option<String>,
    pub spec_approved: bool,
    pub intervention_action: Option<InterventionAction>,
    pub spec_updated: bool,
    pub nl_convert_requested: Option<Value>,
    pub heartbeat_received: bool,
    pub counters: Counters,
    pub phase: Phase,
}

impl Job {
    pub fn from_input(input: JobInput) -> Self {
        Self {
            job_id: input.job_id,
            user_id: input.user_id,
            tier: input.tier,
            execution_mode: input.execution_mode,
            state: JobState::Pending,
            proposal_selected: None,
            spec_approved: false,
            intervention_action: None,
            spec_updated: false,
            nl_convert_requested: None,
            heartbeat_received: false,
            counters: Counters::default(),
            phase: 1,
        }
    }

    /// Invariant #7: reset atomically on DEEP_FIX or spec update.
    pub fn reset_counters(&mut self) {
        self.counters = Counters::default();
    }
}

/// Returned by [`transition`][crate::refactor::transition] when the
/// requested edge isn't one of §4.4's transitions. Callers MUST treat this
/// as a halt/alert condition — it indicates the workflow's own control flow
/// has drifted from the state diagram it's specified against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IllegalTransition {
    pub from: JobState,
    pub to: JobState,
}

impl fmt::Display for IllegalTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "illegal job transition: {} -> {}",
            self.from.as_str(),
            self.to.as_str()
        )
    }
}

impl std::error::Error for IllegalTransition {}

/// The §4.4 state diagram's edge set. `fail()` (uncaught-error / cancellation
/// termination) bypasses this check entirely — a crash can legitimately
/// happen from any state.
pub fn is_legal_edge(from: JobState, to: JobState) -> bool {
    use JobState::*;
    matches!(
        (from, to),
        (Pending, Analyzing)
            | (Analyzing, WaitingStrategy)
            | (WaitingStrategy, WaitingSpecApproval)
            | (WaitingSpecApproval, GeneratingTests)
            | (GeneratingTests, BaselineValidation)
            | (BaselineValidation, BaselineValidationFailed)
            | (BaselineValidation, Refactoring)
            | (BaselineValidationFailed, WaitingSpecApproval)
            | (Refactoring, SelfHealing)
            | (SelfHealing, Refactoring)
            | (Refactoring, Delivered)
            | (Refactoring, WaitingIntervention)
            | (Refactoring, WaitingEscalationDecision)
            | (Refactoring, RecoveryPending)
            | (Refactoring, WaitingSpecApproval)
            | (WaitingSpecApproval, Refactoring)
            | (WaitingIntervention, DeepFixActive)
            | (WaitingIntervention, SelfHealing)
            | (WaitingIntervention, UserIntervening)
            | (DeepFixActive, SelfHealing)
            | (UserIntervening, Delivered)
            | (WaitingEscalationDecision, SelfHealing)
            | (RecoveryPending, FallbackRequired)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use iamac_schemas::JobState::*;

    #[test]
    fn prologue_and_baseline_edges_are_legal() {
        assert!(is_legal_edge(Pending, Analyzing));
        assert!(is_legal_edge(Analyzing, WaitingStrategy));
        assert!(is_legal_edge(WaitingStrategy, WaitingSpecApproval));
        assert!(is_legal_edge(WaitingSpecApproval, GeneratingTests));
        assert!(is_legal_edge(GeneratingTests, BaselineValidation));
        assert!(is_legal_edge(BaselineValidation, BaselineValidationFailed));
        assert!(is_legal_edge(BaselineValidationFailed, WaitingSpecApproval));
        assert!(is_legal_edge(BaselineValidation, Refactoring));
    }

    #[test]
    fn repair_loop_edges_are_legal() {
        assert!(is_legal_edge(Refactoring, SelfHealing));
        assert!(is_legal_edge(SelfHealing, Refactoring));
        assert!(is_legal_edge(Refactoring, Delivered));
        assert!(is_legal_edge(Refactoring, WaitingIntervention));
        assert!(is_legal_edge(Refactoring, WaitingEscalationDecision));
        assert!(is_legal_edge(Refactoring, RecoveryPending));
        assert!(is_legal_edge(WaitingIntervention, DeepFixActive));
        assert!(is_legal_edge(WaitingIntervention, SelfHealing));
        assert!(is_legal_edge(WaitingIntervention, UserIntervening));
        assert!(is_legal_edge(DeepFixActive, SelfHealing));
        assert!(is_legal_edge(UserIntervening, Delivered));
        assert!(is_legal_edge(WaitingEscalationDecision, SelfHealing));
        assert!(is_legal_edge(RecoveryPending, FallbackRequired));
    }

    #[test]
    fn mid_repair_spec_update_round_trip_is_legal() {
        assert!(is_legal_edge(Refactoring, WaitingSpecApproval));
        assert!(is_legal_edge(WaitingSpecApproval, Refactoring));
    }

    #[test]
    fn skipping_states_is_illegal() {
        assert!(!is_legal_edge(Pending, Delivered));
        assert!(!is_legal_edge(WaitingStrategy, BaselineValidation));
        assert!(!is_legal_edge(Refactoring, Failed));
        assert!(!is_legal_edge(Delivered, Refactoring));
    }

    #[test]
    fn job_from_input_starts_pending_with_phase_one() {
        let job = Job::from_input(JobInput {
            job_id: "job_1".to_string(),
            user_id: "user_1".to_string(),
            tier: Tier::Pro,
            execution_mode: "IDE_LOCAL".to_string(),
        });
        assert_eq!(job.state, Pending);
        assert_eq!(job.phase, 1);
        assert!(!job.spec_approved);
        assert!(job.proposal_selected.is_none());
    }

    #[test]
    fn reset_counters_clears_all_three_repair_counters() {
        let mut job = Job::from_input(JobInput {
            job_id: "job_1".to_string(),
            user_id: "user_1".to_string(),
            tier: Tier::Free,
            execution_mode: "IDE_LOCAL".to_string(),
        });
        job.counters.attempt_count = 3;
        job.counters.identical_failure_count = 2;
        job.counters.last_fingerprint = Some("fp".to_string());

        job.reset_counters();

        assert_eq!(job.counters.attempt_count, 0);
        assert_eq!(job.counters.identical_failure_count, 0);
        assert!(job.counters.last_fingerprint.is_none());
    }
}
