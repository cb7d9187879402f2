//! iamac-schemas
//!
//! Shared wire/data types for the IAMA orchestration core. Pure data, no
//! I/O, no logic beyond simple derivations (phase caps, tier gating).

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// JobState
// ---------------------------------------------------------------------------

/// Every state a `RefactorJobWorkflow` can occupy. Mutated only through the
/// workflow's transition helper (`iamac-workflow::transition`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobState {
    Pending,
    Analyzing,
    WaitingStrategy,
    WaitingSpecApproval,
    GeneratingTests,
    BaselineValidation,
    BaselineValidationFailed,
    Refactoring,
    SelfHealing,
    WaitingIntervention,
    DeepFixActive,
    UserIntervening,
    WaitingEscalationDecision,
    RecoveryPending,
    Delivered,
    Failed,
    FallbackRequired,
}

impl JobState {
    /// `true` for the three terminal states the job may never leave.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Delivered | Self::Failed | Self::FallbackRequired)
    }

    /// Canonical string form stored in `refactor_jobs.status` and
    /// `audit_events.old_state`/`new_state`.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Analyzing => "ANALYZING",
            Self::WaitingStrategy => "WAITING_STRATEGY",
            Self::WaitingSpecApproval => "WAITING_SPEC_APPROVAL",
            Self::GeneratingTests => "GENERATING_TESTS",
            Self::BaselineValidation => "BASELINE_VALIDATION",
            Self::BaselineValidationFailed => "BASELINE_VALIDATION_FAILED",
            Self::Refactoring => "REFACTORING",
            Self::SelfHealing => "SELF_HEALING",
            Self::WaitingIntervention => "WAITING_INTERVENTION",
            Self::DeepFixActive => "DEEP_FIX_ACTIVE",
            Self::UserIntervening => "USER_INTERVENING",
            Self::WaitingEscalationDecision => "WAITING_ESCALATION_DECISION",
            Self::RecoveryPending => "RECOVERY_PENDING",
            Self::Delivered => "DELIVERED",
            Self::Failed => "FAILED",
            Self::FallbackRequired => "FALLBACK_REQUIRED",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Tier / ExecutionMode
// ---------------------------------------------------------------------------

/// Subscription tier. Gates L3 patch generation and entitlement fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Tier {
    Free,
    Pro,
    Max,
    Enterprise,
}

impl Tier {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Free => "FREE",
            Self::Pro => "PRO",
            Self::Max => "MAX",
            Self::Enterprise => "ENTERPRISE",
        }
    }

    /// §4.2 tier gating: L3 model class reachable only for MAX/ENTERPRISE.
    pub fn allows_phase_3(self) -> bool {
        matches!(self, Self::Max | Self::Enterprise)
    }

    pub fn web_github_enabled(self) -> bool {
        matches!(self, Self::Enterprise)
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Execution surface the job is running against (IDE-local, web, etc.).
/// Opaque to the core beyond carrying it through to `entitlement_snapshots`
/// and `test_runs.execution_mode`.
pub type ExecutionMode = String;

// ---------------------------------------------------------------------------
// InterventionAction
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InterventionAction {
    DeepFix,
    Continue,
    Command,
    Escalate,
    Cancel,
    TestsPassed,
}

impl InterventionAction {
    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s {
            "DEEP_FIX" => Some(Self::DeepFix),
            "CONTINUE" => Some(Self::Continue),
            "COMMAND" => Some(Self::Command),
            "ESCALATE" => Some(Self::Escalate),
            "CANCEL" => Some(Self::Cancel),
            "TESTS_PASSED" => Some(Self::TestsPassed),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::DeepFix => "DEEP_FIX",
            Self::Continue => "CONTINUE",
            Self::Command => "COMMAND",
            Self::Escalate => "ESCALATE",
            Self::Cancel => "CANCEL",
            Self::TestsPassed => "TESTS_PASSED",
        }
    }
}

// ---------------------------------------------------------------------------
// BaselineMode
// ---------------------------------------------------------------------------

/// Chosen by `assemble_context` from the AST confidence score (§4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BaselineMode {
    AstSymbolic,
    BlackBox,
    ExactSearchReplace,
}

impl BaselineMode {
    /// `ast_score = round(100 * (0.40*parse_rate + 0.35*symbol_rate + 0.25*snippet_completeness))`
    /// `>= 40` AST_SYMBOLIC, `20..=39` BLACK_BOX, `< 20` EXACT_SEARCH_REPLACE.
    pub fn from_ast_score(ast_score: i32) -> Self {
        if ast_score >= 40 {
            Self::AstSymbolic
        } else if ast_score >= 20 {
            Self::BlackBox
        } else {
            Self::ExactSearchReplace
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::AstSymbolic => "AST_SYMBOLIC",
            Self::BlackBox => "BLACK_BOX",
            Self::ExactSearchReplace => "EXACT_SEARCH_REPLACE",
        }
    }
}

/// `round(100 * (0.40*parse_rate + 0.35*symbol_rate + 0.25*snippet_completeness))`.
/// Rates are expected in `[0.0, 1.0]`; the result is clamped to `[0, 100]`.
pub fn ast_confidence_score(parse_rate: f64, symbol_rate: f64, snippet_completeness: f64) -> i32 {
    let raw = 100.0 * (0.40 * parse_rate + 0.35 * symbol_rate + 0.25 * snippet_completeness);
    raw.round().clamp(0.0, 100.0) as i32
}

// ---------------------------------------------------------------------------
// Patch-edit-schema operations
// ---------------------------------------------------------------------------

/// The only operations `generate_patch` is allowed to emit. Never a
/// line-number unified diff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum PatchOp {
    SymbolicReplace {
        symbol: String,
        new_body: String,
    },
    ExactSearchReplace {
        search: String,
        replace: String,
        max_occurrences: u32,
    },
    InsertAfterSymbol {
        symbol: String,
        insertion: String,
    },
    DeleteSymbol {
        symbol: String,
    },
    CreateFile {
        path: String,
        contents: String,
    },
    DeleteFile {
        path: String,
    },
}

// ---------------------------------------------------------------------------
// Phase
// ---------------------------------------------------------------------------

/// Escalation tier selecting the LLM model class for patch generation.
pub type Phase = u8;

/// Per-phase attempt caps: `{1: 3, 2: 2, 3: 1}`.
pub fn phase_cap(phase: Phase) -> u32 {
    match phase {
        1 => 3,
        2 => 2,
        _ => 1,
    }
}

/// `model` ∈ {iama-router-l1, iama-router-l2, iama-router-l3}, gated by tier.
pub fn model_for_phase(phase: Phase, tier: Tier) -> (&'static str, Phase) {
    let effective_phase = if phase == 3 && !tier.allows_phase_3() {
        2
    } else {
        phase
    };
    let model = match effective_phase {
        1 => "iama-router-l1",
        2 => "iama-router-l2",
        _ => "iama-router-l3",
    };
    (model, effective_phase)
}

// ---------------------------------------------------------------------------
// JobInput / Counters
// ---------------------------------------------------------------------------

/// Input to start a `RefactorJobWorkflow`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobInput {
    pub job_id: String,
    pub user_id: String,
    pub tier: Tier,
    pub execution_mode: ExecutionMode,
}

/// Repair-loop counters, reset atomically on DEEP_FIX or spec update.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Counters {
    pub attempt_count: u32,
    pub identical_failure_count: u32,
    pub last_fingerprint: Option<String>,
}

// ---------------------------------------------------------------------------
// Context / test / patch activity payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssembledContext {
    pub job_id: String,
    pub tier: Tier,
    pub file_count: u32,
    pub total_tokens: u64,
    pub ast_score: i32,
    pub baseline_mode: BaselineMode,
    pub target_files: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proposal {
    pub id: String,
    pub title: String,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NlToSpecResult {
    pub bdd_items: Vec<Value>,
    pub sdd_items: Vec<Value>,
    pub model_class_used: &'static str,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatchResult {
    pub job_id: String,
    pub attempt_number: u32,
    pub model_class: &'static str,
    pub phase: Phase,
    pub patch_ops: Vec<PatchOp>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunType {
    Baseline,
    Repair,
}

impl RunType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Baseline => "BASELINE",
            Self::Repair => "REPAIR",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestRunResult {
    pub passed: bool,
    pub test_run_id: Uuid,
    pub failure_pattern_fingerprint: Option<String>,
}

/// `refactor_jobs` projection row, as read back by `iamac-cli`/`iamac-worker`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRow {
    pub id: String,
    pub owner_id: String,
    pub status: String,
    pub attempt_count: i32,
    pub identical_failure_count: i32,
    pub failure_pattern_fingerprint: Option<String>,
    pub failure_reason: Option<String>,
    pub execution_mode: String,
    pub phase: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ast_score_thresholds_pick_the_right_baseline_mode() {
        assert_eq!(BaselineMode::from_ast_score(40), BaselineMode::AstSymbolic);
        assert_eq!(BaselineMode::from_ast_score(39), BaselineMode::BlackBox);
        assert_eq!(BaselineMode::from_ast_score(20), BaselineMode::BlackBox);
        assert_eq!(
            BaselineMode::from_ast_score(19),
            BaselineMode::ExactSearchReplace
        );
    }

    #[test]
    fn ast_confidence_formula_matches_spec() {
        // parse_rate=1.0, symbol_rate=1.0, snippet_completeness=1.0 -> 100
        assert_eq!(ast_confidence_score(1.0, 1.0, 1.0), 100);
        // all zero -> 0
        assert_eq!(ast_confidence_score(0.0, 0.0, 0.0), 0);
        // 0.40*0.5 + 0.35*0.5 + 0.25*0.5 = 0.5 -> 50
        assert_eq!(ast_confidence_score(0.5, 0.5, 0.5), 50);
    }

    #[test]
    fn phase_caps_match_spec() {
        assert_eq!(phase_cap(1), 3);
        assert_eq!(phase_cap(2), 2);
        assert_eq!(phase_cap(3), 1);
    }

    #[test]
    fn phase_3_is_downgraded_for_non_max_tiers() {
        let (model, effective) = model_for_phase(3, Tier::Pro);
        assert_eq!(model, "iama-router-l2");
        assert_eq!(effective, 2);

        let (model, effective) = model_for_phase(3, Tier::Max);
        assert_eq!(model, "iama-router-l3");
        assert_eq!(effective, 3);

        let (model, effective) = model_for_phase(3, Tier::Enterprise);
        assert_eq!(model, "iama-router-l3");
        assert_eq!(effective, 3);
    }

    #[test]
    fn tier_gating_flags() {
        assert!(!Tier::Free.allows_phase_3());
        assert!(!Tier::Pro.allows_phase_3());
        assert!(Tier::Max.allows_phase_3());
        assert!(Tier::Enterprise.allows_phase_3());

        assert!(Tier::Enterprise.web_github_enabled());
        assert!(!Tier::Max.web_github_enabled());
    }
}
