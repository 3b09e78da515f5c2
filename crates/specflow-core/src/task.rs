//! Sequential task execution for the `implementing` phase.
//!
//! Each task moves through a small state machine:
//!
//! ```text
//! pending → running → succeeded → (checkpoint-pending)
//!              ↓
//!           failed → retrying → running …   (until attempts run out)
//! ```
//!
//! The runner never edits agent output; an exhausted task is reported and the
//! engine moves the flow to `error`.

use crate::error::Result;
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub completed: bool,
}

impl Task {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            completed: false,
        }
    }
}

/// "3/5 tasks complete"
pub fn summarize(tasks: &[Task]) -> String {
    let done = tasks.iter().filter(|t| t.completed).count();
    format!("{done}/{} tasks complete", tasks.len())
}

/// Parse a markdown checklist (`- [ ] title`, `- [x] title`, `* [X] title`)
/// into tasks numbered `1..` in document order. Other lines are ignored.
pub fn parse_checklist(markdown: &str) -> Vec<Task> {
    static ITEM: OnceLock<Regex> = OnceLock::new();
    let re = ITEM.get_or_init(|| {
        Regex::new(r"^\s*[-*]\s+\[([ xX])\]\s+(.+?)\s*$").expect("valid regex")
    });

    markdown
        .lines()
        .filter_map(|line| re.captures(line))
        .enumerate()
        .map(|(i, caps)| Task {
            id: (i + 1).to_string(),
            title: caps[2].to_string(),
            completed: !caps[1].trim().is_empty(),
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Collaborators
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct TaskContext {
    pub feature: String,
    pub index: usize,
    pub total: usize,
    pub attempt: u32,
    pub tier: Option<String>,
}

/// Produces the task list for a feature (parses the tasks document).
pub trait TaskSource: Send + Sync {
    fn tasks(&self, feature: &str) -> anyhow::Result<Vec<Task>>;
}

/// Invokes the external code-generation agent for one task.
#[async_trait]
pub trait TaskAgent: Send + Sync {
    async fn implement(&self, task: &Task, ctx: &TaskContext) -> anyhow::Result<()>;
}

/// Records the change set produced by a task.
#[async_trait]
pub trait ChangeCommitter: Send + Sync {
    async fn commit(&self, task: &Task, ctx: &TaskContext) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    pub feature: String,
    /// Tasks finished so far, which is also the index the run would resume at.
    pub completed: usize,
    pub total: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointDecision {
    Continue,
    Pause,
    Abort,
}

#[async_trait]
pub trait CheckpointDecider: Send + Sync {
    async fn decide(&self, checkpoint: &Checkpoint) -> CheckpointDecision;
}

/// Always continues. Used for unattended runs.
pub struct AutoContinue;

#[async_trait]
impl CheckpointDecider for AutoContinue {
    async fn decide(&self, _checkpoint: &Checkpoint) -> CheckpointDecision {
        CheckpointDecision::Continue
    }
}

// ---------------------------------------------------------------------------
// Per-task state machine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Running { attempt: u32 },
    Retrying {
        attempt: u32,
        delay: Duration,
        error: String,
    },
    Succeeded,
    Failed { attempts: u32, error: String },
    CheckpointPending,
}

impl TaskState {
    /// State after attempt number `attempt` (1-based) finished with `outcome`.
    pub fn after_attempt(
        attempt: u32,
        outcome: std::result::Result<(), String>,
        policy: &RetryPolicy,
    ) -> TaskState {
        match outcome {
            Ok(()) => TaskState::Succeeded,
            Err(error) if attempt < policy.attempts() => TaskState::Retrying {
                attempt,
                delay: policy.delay_after(attempt),
                error,
            },
            Err(error) => TaskState::Failed {
                attempts: attempt,
                error,
            },
        }
    }
}

/// True when finishing the task at `index` should stop for a checkpoint.
/// Checkpoints fall after every `interval`-th task by list position and are
/// skipped once nothing is left to run.
pub fn is_checkpoint(index: usize, total: usize, interval: usize) -> bool {
    let position = index + 1;
    interval > 0 && position % interval == 0 && position < total
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed { total: usize },
    /// Paused at a checkpoint; `at` is the index to resume from.
    Paused { at: usize },
    Aborted { at: usize },
    Failed {
        index: usize,
        task_id: String,
        attempts: u32,
        error: String,
    },
}

/// Cooperative cancellation flag, observed between suspension points.
#[derive(Debug, Clone, Default)]
pub struct AbortHandle(Arc<AtomicBool>);

impl AbortHandle {
    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct TaskRunner {
    agent: Arc<dyn TaskAgent>,
    committer: Arc<dyn ChangeCommitter>,
    decider: Arc<dyn CheckpointDecider>,
    retry: RetryPolicy,
    checkpoint_interval: usize,
    abort: AbortHandle,
}

impl TaskRunner {
    pub fn new(
        agent: Arc<dyn TaskAgent>,
        committer: Arc<dyn ChangeCommitter>,
        decider: Arc<dyn CheckpointDecider>,
    ) -> Self {
        Self {
            agent,
            committer,
            decider,
            retry: RetryPolicy::default(),
            checkpoint_interval: 3,
            abort: AbortHandle::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_checkpoint_interval(mut self, interval: usize) -> Self {
        self.checkpoint_interval = interval;
        self
    }

    pub fn with_abort_handle(mut self, abort: AbortHandle) -> Self {
        self.abort = abort;
        self
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    pub fn abort(&self) {
        self.abort.abort();
    }

    /// Run `tasks` in order starting at `start`. `on_complete(index, total)`
    /// fires after each task is committed; an error from it (e.g. a failed
    /// state write) stops the run and is returned.
    pub async fn run(
        &self,
        feature: &str,
        tier: Option<&str>,
        tasks: &[Task],
        start: usize,
        on_complete: &mut dyn FnMut(usize, usize) -> Result<()>,
    ) -> Result<RunOutcome> {
        let total = tasks.len();
        tracing::info!(feature = %feature, start, total, "task run starting");

        for (index, task) in tasks.iter().enumerate().skip(start) {
            if self.abort.is_aborted() {
                return Ok(RunOutcome::Aborted { at: index });
            }

            let mut ctx = TaskContext {
                feature: feature.to_string(),
                index,
                total,
                attempt: 0,
                tier: tier.map(str::to_string),
            };

            if task.completed {
                tracing::debug!(task = %task.id, "task already complete, skipping");
                on_complete(index, total)?;
                continue;
            }

            match self.execute(task, &mut ctx).await {
                TaskState::Succeeded => {}
                TaskState::Failed { attempts, error } => {
                    tracing::warn!(task = %task.id, attempts, error = %error, "task failed");
                    return Ok(RunOutcome::Failed {
                        index,
                        task_id: task.id.clone(),
                        attempts,
                        error,
                    });
                }
                _ => return Ok(RunOutcome::Aborted { at: index }),
            }

            if let Err(e) = self.committer.commit(task, &ctx).await {
                return Ok(RunOutcome::Failed {
                    index,
                    task_id: task.id.clone(),
                    attempts: ctx.attempt,
                    error: format!("commit failed: {e:#}"),
                });
            }
            on_complete(index, total)?;

            if is_checkpoint(index, total, self.checkpoint_interval) {
                let checkpoint = Checkpoint {
                    feature: feature.to_string(),
                    completed: index + 1,
                    total,
                };
                tracing::debug!(state = ?TaskState::CheckpointPending, completed = index + 1, "checkpoint");
                match self.decider.decide(&checkpoint).await {
                    CheckpointDecision::Continue => {}
                    CheckpointDecision::Pause => return Ok(RunOutcome::Paused { at: index + 1 }),
                    CheckpointDecision::Abort => return Ok(RunOutcome::Aborted { at: index + 1 }),
                }
            }
        }

        Ok(RunOutcome::Completed { total })
    }

    /// Drive one task to `Succeeded` or `Failed`. Returns `Pending` when an
    /// abort was observed before the change set could be committed.
    async fn execute(&self, task: &Task, ctx: &mut TaskContext) -> TaskState {
        let mut state = TaskState::Running { attempt: 1 };
        loop {
            match state {
                TaskState::Running { attempt } => {
                    ctx.attempt = attempt;
                    tracing::info!(task = %task.id, attempt, "invoking agent");
                    let outcome = self
                        .agent
                        .implement(task, ctx)
                        .await
                        .map_err(|e| format!("{e:#}"));
                    if self.abort.is_aborted() {
                        return TaskState::Pending;
                    }
                    state = TaskState::after_attempt(attempt, outcome, &self.retry);
                }
                TaskState::Retrying {
                    attempt,
                    delay,
                    ref error,
                } => {
                    tracing::warn!(task = %task.id, attempt, error = %error, ?delay, "agent failed, retrying");
                    tokio::time::sleep(delay).await;
                    if self.abort.is_aborted() {
                        return TaskState::Pending;
                    }
                    state = TaskState::Running {
                        attempt: attempt + 1,
                    };
                }
                done => return done,
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
