use crate::collab;
use crate::output::{print_flow, print_json, print_table};
use anyhow::Context;
use specflow_core::{
    config::Config,
    engine::StepOutcome,
    error::FlowError,
    state::{FileStateStore, FlowState, StateStore},
    task::{summarize, TaskSource},
    types::{FlowEvent, WorkflowMode},
};
use std::path::Path;

fn runtime() -> anyhow::Result<tokio::runtime::Runtime> {
    tokio::runtime::Runtime::new().context("failed to start async runtime")
}

fn report(state: &FlowState, json: bool) -> anyhow::Result<()> {
    if json {
        print_json(state)
    } else {
        print_flow(state);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// start / status / list
// ---------------------------------------------------------------------------

pub fn start(
    root: &Path,
    feature: &str,
    description: &str,
    mode: Option<WorkflowMode>,
    tier: Option<String>,
    json: bool,
) -> anyhow::Result<()> {
    let config = Config::load(root).context("failed to load config")?;
    let mode = mode.unwrap_or(config.workflow.default_mode);
    let tier = tier.or_else(|| config.agent.tier.clone());

    let engine = collab::engine(root, true)?;
    let state = engine.start(feature, description, mode, tier)?;
    if !json {
        println!("Started '{feature}' ({mode}). Next: specflow run {feature}\n");
    }
    report(&state, json)
}

pub fn status(root: &Path, feature: &str, json: bool) -> anyhow::Result<()> {
    let store = FileStateStore::new(root);
    let state = specflow_core::state::require(&store, feature)?;
    if json {
        return print_json(&serde_json::json!({
            "flow": state,
            "recovery": state.recovery_suggestions(),
        }));
    }

    print_flow(&state);
    if let Ok(tasks) = collab::ChecklistTasks::new(root).tasks(feature) {
        if !tasks.is_empty() {
            println!("Tasks:    {}", summarize(&tasks));
        }
    }
    Ok(())
}

pub fn list(root: &Path, json: bool) -> anyhow::Result<()> {
    let flows = FileStateStore::new(root).list()?;
    if json {
        return print_json(&flows);
    }
    if flows.is_empty() {
        println!("No flows. Start one with: specflow start <feature> --description <text>");
        return Ok(());
    }
    let rows = flows
        .iter()
        .map(|f| {
            vec![
                f.feature.clone(),
                f.phase.kind().to_string(),
                f.metadata.mode.to_string(),
                f.updated_at.format("%Y-%m-%d %H:%M").to_string(),
            ]
        })
        .collect();
    print_table(&["FEATURE", "PHASE", "MODE", "UPDATED"], rows);
    Ok(())
}

// ---------------------------------------------------------------------------
// Decisions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub enum Decision {
    Approve,
    Reject,
    Pause,
    Resume,
}

pub fn decide(root: &Path, feature: &str, decision: Decision, json: bool) -> anyhow::Result<()> {
    let event = match decision {
        Decision::Approve => FlowEvent::Approve,
        Decision::Reject => FlowEvent::Reject,
        Decision::Pause => FlowEvent::Pause,
        Decision::Resume => FlowEvent::Resume {
            feature: feature.to_string(),
        },
    };
    let engine = collab::engine(root, true)?;
    let state = engine.dispatch(feature, event)?;
    report(&state, json)
}

pub fn abort(root: &Path, feature: &str, reason: &str, json: bool) -> anyhow::Result<()> {
    let engine = collab::engine(root, true)?;
    let state = engine.abort(feature, reason)?;
    report(&state, json)
}

pub fn merge(root: &Path, feature: &str, skip: bool, json: bool) -> anyhow::Result<()> {
    let event = if skip { FlowEvent::SkipMerge } else { FlowEvent::Merge };
    let engine = collab::engine(root, true)?;
    let state = engine.dispatch(feature, event)?;
    report(&state, json)
}

// ---------------------------------------------------------------------------
// advance / run
// ---------------------------------------------------------------------------

pub fn advance(
    root: &Path,
    feature: &str,
    yes: bool,
    repeat: bool,
    json: bool,
) -> anyhow::Result<()> {
    let engine = collab::engine(root, yes)?;
    let _progress = if json {
        None
    } else {
        Some(engine.subscribe(|change| {
            println!("  {} -> {}", change.previous.kind(), change.state.phase);
        }))
    };

    let rt = runtime()?;
    let outcome = rt.block_on(async {
        let abort = engine.abort_handle();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupt received, stopping after the current step");
                abort.abort();
            }
        });
        if repeat {
            engine.run(feature).await
        } else {
            engine.advance(feature).await
        }
    })?;

    let state = engine.load(feature)?;
    if json {
        print_json(&serde_json::json!({ "outcome": outcome, "flow": state }))?;
    } else {
        print_outcome(&outcome, &state);
    }

    match outcome {
        StepOutcome::Vetoed {
            phase,
            plugin,
            reason,
        } => Err(FlowError::Vetoed {
            phase: phase.to_string(),
            plugin,
            reason,
        }
        .into()),
        StepOutcome::Failed { message, .. } => anyhow::bail!("{message}"),
        _ => Ok(()),
    }
}

fn print_outcome(outcome: &StepOutcome, state: &FlowState) {
    let feature = &state.feature;
    match outcome {
        StepOutcome::Advanced { to, .. } => {
            println!("\nNow in {to}. Next: specflow advance {feature}")
        }
        StepOutcome::AwaitingDecision { phase } => {
            if phase.is_review() {
                println!("\nWaiting for review of {phase}: specflow approve|reject {feature}");
            } else {
                println!("\nWaiting for merge decision: specflow merge {feature} [--skip]");
            }
        }
        StepOutcome::Paused { at } => println!(
            "\nPaused before task {}. Resume with: specflow resume {feature}",
            at + 1
        ),
        StepOutcome::Vetoed { .. } => {}
        StepOutcome::Failed { .. } | StepOutcome::Finished { .. } => {
            println!();
            print_flow(state);
        }
    }
}
