//! Pure phase-transition function.
//!
//! `transition` never consults files, clocks or the network: the next phase is
//! a function of `(current phase, event, locked mode)` only. Illegal edges
//! produce an `error` phase carrying a diagnostic instead of panicking.

use crate::types::{FlowEvent, FlowPhase, PhaseKind, WorkflowMode};
use std::fmt;

// ---------------------------------------------------------------------------
// Sequences
// ---------------------------------------------------------------------------

const GREENFIELD: &[PhaseKind] = &[
    PhaseKind::Initializing,
    PhaseKind::RequirementsGenerating,
    PhaseKind::RequirementsApproval,
    PhaseKind::DesignGenerating,
    PhaseKind::DesignApproval,
    PhaseKind::TasksGenerating,
    PhaseKind::TasksApproval,
    PhaseKind::Implementing,
    PhaseKind::Validation,
    PhaseKind::Pr,
    PhaseKind::MergeDecision,
    PhaseKind::Complete,
];

const BROWNFIELD: &[PhaseKind] = &[
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
];

/// Ordered phase sequence for a mode. Both end in `complete`; `aborted` and
/// `error` are reachable from any non-terminal phase and are not listed.
pub fn sequence(mode: WorkflowMode) -> &'static [PhaseKind] {
    match mode {
        WorkflowMode::Greenfield => GREENFIELD,
        WorkflowMode::Brownfield => BROWNFIELD,
    }
}

fn position(mode: WorkflowMode, kind: PhaseKind) -> Option<usize> {
    sequence(mode).iter().position(|k| *k == kind)
}

pub fn next_in(mode: WorkflowMode, kind: PhaseKind) -> Option<PhaseKind> {
    let i = position(mode, kind)?;
    sequence(mode).get(i + 1).copied()
}

/// The generating phase whose artifact a review phase examines.
pub fn producer_of(mode: WorkflowMode, review: PhaseKind) -> Option<PhaseKind> {
    if !review.is_review() {
        return None;
    }
    let i = position(mode, review)?;
    i.checked_sub(1).and_then(|p| sequence(mode).get(p).copied())
}

// ---------------------------------------------------------------------------
// TransitionError
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionError {
    pub from: PhaseKind,
    pub event: &'static str,
    pub reason: String,
}

impl fmt::Display for TransitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "illegal event {} in phase {}: {}",
            self.event, self.from, self.reason
        )
    }
}

impl std::error::Error for TransitionError {}

// ---------------------------------------------------------------------------
// Transition
// ---------------------------------------------------------------------------

/// Compute the next phase. Illegal edges yield `FlowPhase::Error` with a
/// diagnostic message; the caller's state is never touched.
pub fn transition(current: &FlowPhase, event: &FlowEvent, mode: WorkflowMode) -> FlowPhase {
    try_transition(current, event, mode).unwrap_or_else(|e| FlowPhase::Error {
        message: e.to_string(),
        failed_phase: None,
    })
}

/// Like [`transition`] but reports illegal edges as `Err`, so callers can tell
/// a rejected event apart from a legitimate `ERROR` event.
pub fn try_transition(
    current: &FlowPhase,
    event: &FlowEvent,
    mode: WorkflowMode,
) -> Result<FlowPhase, TransitionError> {
    let kind = current.kind();
    let reject = |reason: String| TransitionError {
        from: kind,
        event: event.name(),
        reason,
    };

    if kind.is_terminal() {
        return match (current, event) {
            (
                FlowPhase::Error {
                    failed_phase: Some(failed),
                    ..
                },
                FlowEvent::Resume { .. },
            ) => Ok((**failed).clone()),
            _ => Err(reject(format!("flow is in terminal phase '{kind}'"))),
        };
    }

    if position(mode, kind).is_none() {
        return Err(reject(format!(
            "phase '{kind}' is not part of the {mode} workflow"
        )));
    }

    match event {
        FlowEvent::Abort { reason } => Ok(FlowPhase::Aborted {
            reason: reason.clone(),
        }),

        FlowEvent::Error { message } => Ok(FlowPhase::Error {
            message: message.clone(),
            failed_phase: Some(Box::new(current.clone())),
        }),

        FlowEvent::Start {
            mode: requested, ..
        } => {
            if *requested != mode {
                return Err(reject(format!(
                    "workflow mode is locked to {mode}; cannot change it to {requested}"
                )));
            }
            if kind != PhaseKind::Initializing {
                return Err(reject("flow has already started".to_string()));
            }
            advance(mode, kind).map_err(reject)
        }

        FlowEvent::Resume { .. } => match current {
            FlowPhase::Implementing {
                paused_at: Some(at),
                ..
            } => Ok(FlowPhase::Implementing {
                current_task: *at,
                paused_at: None,
            }),
            other => Ok(other.clone()),
        },

        FlowEvent::PhaseComplete { .. } => match current {
            FlowPhase::Implementing {
                paused_at: Some(_), ..
            } => Err(reject("implementation is paused; RESUME first".to_string())),
            _ if kind.is_generating()
                || matches!(
                    kind,
                    PhaseKind::Implementing | PhaseKind::Validation | PhaseKind::Pr
                ) =>
            {
                advance(mode, kind).map_err(reject)
            }
            _ => Err(reject("phase has no completion edge".to_string())),
        },

        FlowEvent::Approve => {
            if !kind.is_review() {
                return Err(reject("only approval and review phases accept APPROVE".into()));
            }
            advance(mode, kind).map_err(reject)
        }

        FlowEvent::Reject => {
            let producer = producer_of(mode, kind).ok_or_else(|| {
                reject("only approval and review phases accept REJECT".to_string())
            })?;
            Ok(FlowPhase::enter(producer))
        }

        FlowEvent::TaskComplete { task_index } => match current {
            FlowPhase::Implementing {
                current_task,
                paused_at: None,
            } => {
                if *task_index != *current_task {
                    return Err(reject(format!(
                        "expected completion of task {current_task}, got {task_index}"
                    )));
                }
                Ok(FlowPhase::Implementing {
                    current_task: current_task + 1,
                    paused_at: None,
                })
            }
            FlowPhase::Implementing { .. } => {
                Err(reject("implementation is paused; RESUME first".to_string()))
            }
            _ => Err(reject("tasks complete only while implementing".to_string())),
        },

        FlowEvent::Pause => match current {
            FlowPhase::Implementing {
                current_task,
                paused_at: None,
            } => Ok(FlowPhase::Implementing {
                current_task: *current_task,
                paused_at: Some(*current_task),
            }),
            FlowPhase::Implementing { .. } => Err(reject("already paused".to_string())),
            _ => Err(reject("only the implementing phase can pause".to_string())),
        },

        FlowEvent::PrCreated { url } => {
            if kind != PhaseKind::Pr {
                return Err(reject("pull requests are created in the pr phase".into()));
            }
            Ok(FlowPhase::MergeDecision {
                pr_url: Some(url.clone()),
                pr_number: pr_number_from_url(url),
            })
        }

        FlowEvent::Merge | FlowEvent::SkipMerge => {
            if kind != PhaseKind::MergeDecision {
                return Err(reject("merge decisions happen in merge-decision".into()));
            }
            Ok(FlowPhase::Complete)
        }
    }
}

fn advance(mode: WorkflowMode, kind: PhaseKind) -> Result<FlowPhase, String> {
    next_in(mode, kind)
        .map(FlowPhase::enter)
        .ok_or_else(|| format!("phase '{kind}' has no successor in the {mode} workflow"))
}

/// Trailing numeric path segment of a PR URL, e.g. `.../pull/42` → 42.
pub fn pr_number_from_url(url: &str) -> Option<u64> {
    url.trim_end_matches('/')
        .rsplit('/')
        .next()
        .and_then(|s| s.parse().ok())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
