use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// WorkflowMode
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowMode {
    #[default]
    Greenfield,
    Brownfield,
}

impl WorkflowMode {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkflowMode::Greenfield => "greenfield",
            WorkflowMode::Brownfield => "brownfield",
        }
    }
}

impl fmt::Display for WorkflowMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WorkflowMode {
    type Err = crate::error::FlowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "greenfield" => Ok(WorkflowMode::Greenfield),
            "brownfield" => Ok(WorkflowMode::Brownfield),
            _ => Err(crate::error::FlowError::InvalidMode(s.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// PhaseKind
// ---------------------------------------------------------------------------

/// Payload-free discriminant of a [`FlowPhase`]. Used for sequences, hook
/// bindings and display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PhaseKind {
    Initializing,
    RequirementsGenerating,
    RequirementsApproval,
    GapAnalysis,
    GapReview,
    DesignGenerating,
    DesignApproval,
    DesignValidation,
    DesignValidationReview,
    TasksGenerating,
    TasksApproval,
    Implementing,
    Validation,
    Pr,
    MergeDecision,
    Complete,
    Aborted,
    Error,
}

impl PhaseKind {
    pub fn all() -> &'static [PhaseKind] {
        &[
            PhaseKind::Initializing,
            PhaseKind::RequirementsGenerating,
            PhaseKind::RequirementsApproval,
            PhaseKind::GapAnalysis,
            PhaseKind::GapReview,
            PhaseKind::DesignGenerating,
            PhaseKind::DesignApproval,
            PhaseKind::DesignValidation,
            PhaseKind::DesignValidationReview,
            PhaseKind::TasksGenerating,
            PhaseKind::TasksApproval,
            PhaseKind::Implementing,
            PhaseKind::Validation,
            PhaseKind::Pr,
            PhaseKind::MergeDecision,
            PhaseKind::Complete,
            PhaseKind::Aborted,
            PhaseKind::Error,
        ]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PhaseKind::Initializing => "initializing",
            PhaseKind::RequirementsGenerating => "requirements-generating",
            PhaseKind::RequirementsApproval => "requirements-approval",
            PhaseKind::GapAnalysis => "gap-analysis",
            PhaseKind::GapReview => "gap-review",
            PhaseKind::DesignGenerating => "design-generating",
            PhaseKind::DesignApproval => "design-approval",
            PhaseKind::DesignValidation => "design-validation",
            PhaseKind::DesignValidationReview => "design-validation-review",
            PhaseKind::TasksGenerating => "tasks-generating",
            PhaseKind::TasksApproval => "tasks-approval",
            PhaseKind::Implementing => "implementing",
            PhaseKind::Validation => "validation",
            PhaseKind::Pr => "pr",
            PhaseKind::MergeDecision => "merge-decision",
            PhaseKind::Complete => "complete",
            PhaseKind::Aborted => "aborted",
            PhaseKind::Error => "error",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PhaseKind::Complete | PhaseKind::Aborted | PhaseKind::Error
        )
    }

    /// Phases whose work produces an artifact via the external agent.
    pub fn is_generating(self) -> bool {
        matches!(
            self,
            PhaseKind::RequirementsGenerating
                | PhaseKind::GapAnalysis
                | PhaseKind::DesignGenerating
                | PhaseKind::DesignValidation
                | PhaseKind::TasksGenerating
        )
    }

    /// Phases that wait for an accept/reject decision.
    pub fn is_review(self) -> bool {
        matches!(
            self,
            PhaseKind::RequirementsApproval
                | PhaseKind::GapReview
                | PhaseKind::DesignApproval
                | PhaseKind::DesignValidationReview
                | PhaseKind::TasksApproval
        )
    }
}

impl fmt::Display for PhaseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PhaseKind {
    type Err = crate::error::FlowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PhaseKind::all()
            .iter()
            .copied()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| crate::error::FlowError::InvalidPhase(s.to_string()))
    }
}

// ---------------------------------------------------------------------------
// FlowPhase
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum FlowPhase {
    Initializing,
    RequirementsGenerating,
    RequirementsApproval,
    GapAnalysis,
    GapReview,
    DesignGenerating,
    DesignApproval,
    DesignValidation,
    DesignValidationReview,
    TasksGenerating,
    TasksApproval,
    Implementing {
        /// Index of the next task to execute; equals the number completed.
        current_task: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        paused_at: Option<usize>,
    },
    Validation,
    Pr,
    MergeDecision {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pr_url: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pr_number: Option<u64>,
    },
    Complete,
    Aborted {
        reason: String,
    },
    Error {
        message: String,
        /// Phase that was active when the failure happened; `RESUME` returns here.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        failed_phase: Option<Box<FlowPhase>>,
    },
}

impl FlowPhase {
    pub fn kind(&self) -> PhaseKind {
        match self {
            FlowPhase::Initializing => PhaseKind::Initializing,
            FlowPhase::RequirementsGenerating => PhaseKind::RequirementsGenerating,
            FlowPhase::RequirementsApproval => PhaseKind::RequirementsApproval,
            FlowPhase::GapAnalysis => PhaseKind::GapAnalysis,
            FlowPhase::GapReview => PhaseKind::GapReview,
            FlowPhase::DesignGenerating => PhaseKind::DesignGenerating,
            FlowPhase::DesignApproval => PhaseKind::DesignApproval,
            FlowPhase::DesignValidation => PhaseKind::DesignValidation,
            FlowPhase::DesignValidationReview => PhaseKind::DesignValidationReview,
            FlowPhase::TasksGenerating => PhaseKind::TasksGenerating,
            FlowPhase::TasksApproval => PhaseKind::TasksApproval,
            FlowPhase::Implementing { .. } => PhaseKind::Implementing,
            FlowPhase::Validation => PhaseKind::Validation,
            FlowPhase::Pr => PhaseKind::Pr,
            FlowPhase::MergeDecision { .. } => PhaseKind::MergeDecision,
            FlowPhase::Complete => PhaseKind::Complete,
            FlowPhase::Aborted { .. } => PhaseKind::Aborted,
            FlowPhase::Error { .. } => PhaseKind::Error,
        }
    }

    /// Fresh phase value for entering `kind` with an empty payload.
    pub fn enter(kind: PhaseKind) -> FlowPhase {
        match kind {
            PhaseKind::Initializing => FlowPhase::Initializing,
            PhaseKind::RequirementsGenerating => FlowPhase::RequirementsGenerating,
            PhaseKind::RequirementsApproval => FlowPhase::RequirementsApproval,
            PhaseKind::GapAnalysis => FlowPhase::GapAnalysis,
            PhaseKind::GapReview => FlowPhase::GapReview,
            PhaseKind::DesignGenerating => FlowPhase::DesignGenerating,
            PhaseKind::DesignApproval => FlowPhase::DesignApproval,
            PhaseKind::DesignValidation => FlowPhase::DesignValidation,
            PhaseKind::DesignValidationReview => FlowPhase::DesignValidationReview,
            PhaseKind::TasksGenerating => FlowPhase::TasksGenerating,
            PhaseKind::TasksApproval => FlowPhase::TasksApproval,
            PhaseKind::Implementing => FlowPhase::Implementing {
                current_task: 0,
                paused_at: None,
            },
            PhaseKind::Validation => FlowPhase::Validation,
            PhaseKind::Pr => FlowPhase::Pr,
            PhaseKind::MergeDecision => FlowPhase::MergeDecision {
                pr_url: None,
                pr_number: None,
            },
            PhaseKind::Complete => FlowPhase::Complete,
            PhaseKind::Aborted => FlowPhase::Aborted {
                reason: String::new(),
            },
            PhaseKind::Error => FlowPhase::Error {
                message: String::new(),
                failed_phase: None,
            },
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.kind().is_terminal()
    }

    pub fn paused_at(&self) -> Option<usize> {
        match self {
            FlowPhase::Implementing { paused_at, .. } => *paused_at,
            _ => None,
        }
    }
}

impl fmt::Display for FlowPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlowPhase::Implementing {
                current_task,
                paused_at: Some(at),
            } => write!(f, "implementing (task {current_task}, paused at {at})"),
            FlowPhase::Implementing { current_task, .. } => {
                write!(f, "implementing (task {current_task})")
            }
            FlowPhase::Aborted { reason } => write!(f, "aborted: {reason}"),
            FlowPhase::Error { message, .. } => write!(f, "error: {message}"),
            other => f.write_str(other.kind().as_str()),
        }
    }
}

// ---------------------------------------------------------------------------
// FlowEvent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum FlowEvent {
    Start {
        feature: String,
        description: String,
        mode: WorkflowMode,
    },
    Resume {
        feature: String,
    },
    PhaseComplete {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<serde_json::Value>,
    },
    Approve,
    Reject,
    TaskComplete {
        task_index: usize,
    },
    Pause,
    Abort {
        reason: String,
    },
    Error {
        message: String,
    },
    PrCreated {
        url: String,
    },
    Merge,
    SkipMerge,
}

impl FlowEvent {
    pub fn phase_complete() -> Self {
        FlowEvent::PhaseComplete { data: None }
    }

    pub fn name(&self) -> &'static str {
        match self {
            FlowEvent::Start { .. } => "START",
            FlowEvent::Resume { .. } => "RESUME",
            FlowEvent::PhaseComplete { .. } => "PHASE_COMPLETE",
            FlowEvent::Approve => "APPROVE",
            FlowEvent::Reject => "REJECT",
            FlowEvent::TaskComplete { .. } => "TASK_COMPLETE",
            FlowEvent::Pause => "PAUSE",
            FlowEvent::Abort { .. } => "ABORT",
            FlowEvent::Error { .. } => "ERROR",
            FlowEvent::PrCreated { .. } => "PR_CREATED",
            FlowEvent::Merge => "MERGE",
            FlowEvent::SkipMerge => "SKIP_MERGE",
        }
    }
}

impl fmt::Display for FlowEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
