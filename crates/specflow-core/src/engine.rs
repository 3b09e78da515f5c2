//! Workflow engine: the composition root.
//!
//! The engine is the only writer of flow state. Each step asks the state
//! machine for the next phase, brackets the phase's work with pre/post hooks,
//! persists the result atomically, then notifies observers.

use crate::config::Config;
use crate::error::{FlowError, Result};
use crate::machine;
use crate::observer::{PhaseChange, PhaseObservers, Subscription};
use crate::paths;
use crate::plugin::{HookContext, HookTiming, PluginRuntime};
use crate::retry::RetryPolicy;
use crate::state::{self, FlowState, StateStore};
use crate::task::{
    AbortHandle, ChangeCommitter, CheckpointDecider, RunOutcome, TaskAgent, TaskRunner, TaskSource,
};
use crate::types::{FlowEvent, FlowPhase, PhaseKind, WorkflowMode};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;

// ---------------------------------------------------------------------------
// Collaborators
// ---------------------------------------------------------------------------

/// Work order for a generating or validation phase.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseRequest {
    pub feature: String,
    pub phase: PhaseKind,
    pub description: String,
    pub mode: WorkflowMode,
    pub tier: Option<String>,
}

impl PhaseRequest {
    fn new(state: &FlowState, phase: PhaseKind) -> Self {
        Self {
            feature: state.feature.clone(),
            phase,
            description: state.metadata.description.clone(),
            mode: state.metadata.mode,
            tier: state.metadata.tier.clone(),
        }
    }
}

/// Produces the artifact for a generating phase, or checks the result in
/// `validation`. The returned value rides along on `PHASE_COMPLETE`.
#[async_trait]
pub trait PhaseAgent: Send + Sync {
    async fn run_phase(&self, request: &PhaseRequest) -> anyhow::Result<Option<serde_json::Value>>;
}

/// Opens a pull request. `Ok(None)` means the flow proceeds without one.
#[async_trait]
pub trait PrPublisher: Send + Sync {
    async fn create_pr(&self, state: &FlowState) -> anyhow::Result<Option<String>>;
}

pub struct Collaborators {
    pub phase_agent: Arc<dyn PhaseAgent>,
    pub tasks: Arc<dyn TaskSource>,
    pub task_agent: Arc<dyn TaskAgent>,
    pub committer: Arc<dyn ChangeCommitter>,
    pub checkpoints: Arc<dyn CheckpointDecider>,
    pub publisher: Arc<dyn PrPublisher>,
}

// ---------------------------------------------------------------------------
// StepOutcome
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StepOutcome {
    /// The phase's work finished and the flow moved on.
    Advanced { from: PhaseKind, to: FlowPhase },
    /// A pre-phase hook blocked the phase. Nothing was persisted.
    Vetoed {
        phase: PhaseKind,
        plugin: String,
        reason: String,
    },
    /// An approval, review or merge decision is needed.
    AwaitingDecision { phase: PhaseKind },
    /// Implementation paused; `at` is the next task index.
    Paused { at: usize },
    /// The phase failed and the flow is now in `error`.
    Failed { phase: PhaseKind, message: String },
    /// The flow is in a terminal phase.
    Finished { phase: FlowPhase },
}

// ---------------------------------------------------------------------------
// WorkflowEngine
// ---------------------------------------------------------------------------

pub struct WorkflowEngine {
    store: Box<dyn StateStore>,
    plugins: PluginRuntime,
    observers: PhaseObservers,
    collab: Collaborators,
    retry: RetryPolicy,
    checkpoint_interval: usize,
    abort: AbortHandle,
}

impl WorkflowEngine {
    pub fn new(store: Box<dyn StateStore>, plugins: PluginRuntime, collab: Collaborators) -> Self {
        Self {
            store,
            plugins,
            observers: PhaseObservers::new(),
            collab,
            retry: RetryPolicy::default(),
            checkpoint_interval: 3,
            abort: AbortHandle::default(),
        }
    }

    pub fn with_config(mut self, config: &Config) -> Self {
        self.retry = config.retry.clone();
        self.checkpoint_interval = config.workflow.checkpoint_interval;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_checkpoint_interval(mut self, interval: usize) -> Self {
        self.checkpoint_interval = interval;
        self
    }

    pub fn plugins(&self) -> &PluginRuntime {
        &self.plugins
    }

    pub fn store(&self) -> &dyn StateStore {
        self.store.as_ref()
    }

    /// Register for committed phase changes.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&PhaseChange) + Send + Sync + 'static,
    {
        self.observers.subscribe(listener)
    }

    /// Cooperative cancellation, observed at the next suspension boundary.
    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    pub fn load(&self, feature: &str) -> Result<FlowState> {
        state::require(self.store.as_ref(), feature)
    }

    // -----------------------------------------------------------------------
    // Transitions
    // -----------------------------------------------------------------------

    /// Create a flow and apply `START`. The mode is bound here for good.
    pub fn start(
        &self,
        feature: &str,
        description: &str,
        mode: WorkflowMode,
        tier: Option<String>,
    ) -> Result<FlowState> {
        paths::validate_slug(feature)?;
        if self.store.load(feature)?.is_some() {
            return Err(FlowError::FlowExists(feature.to_string()));
        }
        let mut state = FlowState::new(feature, description, mode, tier);
        self.apply(
            &mut state,
            FlowEvent::Start {
                feature: feature.to_string(),
                description: description.to_string(),
                mode,
            },
        )?;
        Ok(state)
    }

    /// Apply `event` to a persisted flow. Illegal events are rejected before
    /// anything is written.
    pub fn dispatch(&self, feature: &str, event: FlowEvent) -> Result<FlowState> {
        let mut state = self.load(feature)?;
        self.apply(&mut state, event)?;
        Ok(state)
    }

    pub fn abort(&self, feature: &str, reason: &str) -> Result<FlowState> {
        self.abort.abort();
        self.dispatch(
            feature,
            FlowEvent::Abort {
                reason: reason.to_string(),
            },
        )
    }

    fn apply(&self, state: &mut FlowState, event: FlowEvent) -> Result<()> {
        let next = machine::try_transition(&state.phase, &event, state.mode()).map_err(|e| {
            FlowError::InvalidTransition {
                from: e.from.to_string(),
                event: e.event.to_string(),
                reason: e.reason,
            }
        })?;

        let previous = state.phase.clone();
        state.enter(next, &event);
        self.store.save(state)?;
        tracing::info!(
            feature = %state.feature,
            event = %event,
            from = %previous.kind(),
            to = %state.phase.kind(),
            "phase transition"
        );
        self.observers.notify(&PhaseChange {
            feature: state.feature.clone(),
            previous,
            state: state.clone(),
        });
        Ok(())
    }

    fn fail(
        &self,
        state: &mut FlowState,
        phase: PhaseKind,
        message: String,
    ) -> Result<StepOutcome> {
        tracing::warn!(feature = %state.feature, phase = %phase, error = %message, "phase failed");
        self.apply(
            state,
            FlowEvent::Error {
                message: message.clone(),
            },
        )?;
        Ok(StepOutcome::Failed { phase, message })
    }

    fn interrupted(&self, state: &mut FlowState) -> Result<StepOutcome> {
        self.apply(
            state,
            FlowEvent::Abort {
                reason: "interrupted".to_string(),
            },
        )?;
        Ok(StepOutcome::Finished {
            phase: state.phase.clone(),
        })
    }

    // -----------------------------------------------------------------------
    // Phase work
    // -----------------------------------------------------------------------

    /// Perform one phase's work and move the flow forward.
    pub async fn advance(&self, feature: &str) -> Result<StepOutcome> {
        let mut state = self.load(feature)?;
        let kind = state.phase.kind();

        if state.phase.is_terminal() {
            return Ok(StepOutcome::Finished { phase: state.phase });
        }
        if self.abort.is_aborted() {
            return self.interrupted(&mut state);
        }
        if let Some(at) = state.phase.paused_at() {
            return Ok(StepOutcome::Paused { at });
        }

        match kind {
            PhaseKind::Implementing => self.run_implementing(&mut state).await,
            PhaseKind::Pr => self.run_pr(&mut state).await,
            k if k.is_generating() || k == PhaseKind::Validation => {
                self.run_generating(&mut state, k).await
            }
            k => Ok(StepOutcome::AwaitingDecision { phase: k }),
        }
    }

    /// Repeat [`advance`](Self::advance) until a human is needed or the flow
    /// stops.
    pub async fn run(&self, feature: &str) -> Result<StepOutcome> {
        loop {
            match self.advance(feature).await? {
                StepOutcome::Advanced { from, to } => {
                    tracing::debug!(feature = %feature, from = %from, to = %to.kind(), "step done");
                }
                other => return Ok(other),
            }
        }
    }

    async fn pre_hooks(&self, state: &FlowState, phase: PhaseKind) -> Option<StepOutcome> {
        let ctx = HookContext::snapshot(phase, HookTiming::Pre, state);
        let result = self.plugins.hooks.run_pre_phase_hooks(phase, &ctx).await;
        if !result.vetoed {
            return None;
        }
        let plugin = result.veto_plugin.unwrap_or_default();
        let reason = result.veto_reason.unwrap_or_default();
        tracing::warn!(feature = %state.feature, phase = %phase, plugin = %plugin, reason = %reason, "phase vetoed");
        Some(StepOutcome::Vetoed {
            phase,
            plugin,
            reason,
        })
    }

    async fn post_hooks(&self, state: &FlowState, phase: PhaseKind) {
        let ctx = HookContext::snapshot(phase, HookTiming::Post, state);
        let result = self.plugins.hooks.run_post_phase_hooks(phase, &ctx).await;
        if !result.errors.is_empty() {
            tracing::debug!(phase = %phase, failed = result.errors.len(), "post-phase hooks reported errors");
        }
    }

    async fn run_generating(&self, state: &mut FlowState, phase: PhaseKind) -> Result<StepOutcome> {
        if let Some(vetoed) = self.pre_hooks(state, phase).await {
            return Ok(vetoed);
        }

        let request = PhaseRequest::new(state, phase);
        let data = match self.collab.phase_agent.run_phase(&request).await {
            Ok(data) => data,
            Err(e) => return self.fail(state, phase, format!("{phase} failed: {e:#}")),
        };
        if self.abort.is_aborted() {
            return self.interrupted(state);
        }

        self.post_hooks(state, phase).await;
        self.apply(state, FlowEvent::PhaseComplete { data })?;
        Ok(StepOutcome::Advanced {
            from: phase,
            to: state.phase.clone(),
        })
    }

    async fn run_implementing(&self, state: &mut FlowState) -> Result<StepOutcome> {
        let phase = PhaseKind::Implementing;
        if let Some(vetoed) = self.pre_hooks(state, phase).await {
            return Ok(vetoed);
        }

        let tasks = match self.collab.tasks.tasks(&state.feature) {
            Ok(tasks) => tasks,
            Err(e) => return self.fail(state, phase, format!("cannot load tasks: {e:#}")),
        };
        let start = match state.phase {
            FlowPhase::Implementing { current_task, .. } => current_task,
            _ => 0,
        };

        let runner = TaskRunner::new(
            Arc::clone(&self.collab.task_agent),
            Arc::clone(&self.collab.committer),
            Arc::clone(&self.collab.checkpoints),
        )
        .with_retry(self.retry.clone())
        .with_checkpoint_interval(self.checkpoint_interval)
        .with_abort_handle(self.abort.clone());

        let feature = state.feature.clone();
        let tier = state.metadata.tier.clone();
        let outcome = {
            let mut on_complete = |index: usize, total: usize| {
                tracing::info!(feature = %feature, task = index + 1, total, "task complete");
                self.apply(state, FlowEvent::TaskComplete { task_index: index })
            };
            runner
                .run(&feature, tier.as_deref(), &tasks, start, &mut on_complete)
                .await?
        };

        match outcome {
            RunOutcome::Completed { .. } => {
                self.post_hooks(state, phase).await;
                self.apply(state, FlowEvent::phase_complete())?;
                Ok(StepOutcome::Advanced {
                    from: phase,
                    to: state.phase.clone(),
                })
            }
            RunOutcome::Paused { at } => {
                self.apply(state, FlowEvent::Pause)?;
                Ok(StepOutcome::Paused { at })
            }
            RunOutcome::Aborted { at } => {
                self.apply(
                    state,
                    FlowEvent::Abort {
                        reason: format!("aborted before task {}", at + 1),
                    },
                )?;
                Ok(StepOutcome::Finished {
                    phase: state.phase.clone(),
                })
            }
            RunOutcome::Failed {
                task_id,
                attempts,
                error,
                ..
            } => self.fail(
                state,
                phase,
                format!("task {task_id} failed after {attempts} attempt(s): {error}"),
            ),
        }
    }

    async fn run_pr(&self, state: &mut FlowState) -> Result<StepOutcome> {
        let phase = PhaseKind::Pr;
        if let Some(vetoed) = self.pre_hooks(state, phase).await {
            return Ok(vetoed);
        }

        let url = match self.collab.publisher.create_pr(state).await {
            Ok(url) => url,
            Err(e) => return self.fail(state, phase, format!("pull request failed: {e:#}")),
        };

        self.post_hooks(state, phase).await;
        let event = match url {
            Some(url) => FlowEvent::PrCreated { url },
            None => FlowEvent::phase_complete(),
        };
        self.apply(state, event)?;
        Ok(StepOutcome::Advanced {
            from: phase,
            to: state.phase.clone(),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
