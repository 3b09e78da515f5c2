use crate::error::{FlowError, Result};
use crate::paths;
use crate::types::{FlowEvent, FlowPhase, WorkflowMode};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// FlowMetadata
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowMetadata {
    pub description: String,
    /// Bound by START; never rewritten afterwards.
    pub mode: WorkflowMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tier: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worktree_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_number: Option<u64>,
}

// ---------------------------------------------------------------------------
// FlowState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowState {
    pub feature: String,
    pub phase: FlowPhase,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Every phase the flow has entered, oldest first. Append-only.
    pub history: Vec<FlowPhase>,
    pub metadata: FlowMetadata,
}

impl FlowState {
    pub fn new(
        feature: impl Into<String>,
        description: impl Into<String>,
        mode: WorkflowMode,
        tier: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            feature: feature.into(),
            phase: FlowPhase::Initializing,
            created_at: now,
            updated_at: now,
            history: vec![FlowPhase::Initializing],
            metadata: FlowMetadata {
                description: description.into(),
                mode,
                tier,
                worktree_path: None,
                pr_url: None,
                pr_number: None,
            },
        }
    }

    /// Enter `next`, recording it in history. `event` lets PR details flow
    /// into metadata; the mode is left untouched.
    pub fn enter(&mut self, next: FlowPhase, event: &FlowEvent) {
        if let FlowEvent::PrCreated { url } = event {
            self.metadata.pr_url = Some(url.clone());
            if let FlowPhase::MergeDecision { pr_number, .. } = &next {
                self.metadata.pr_number = *pr_number;
            }
        }
        self.phase = next.clone();
        self.history.push(next);
        self.updated_at = Utc::now();
    }

    pub fn mode(&self) -> WorkflowMode {
        self.metadata.mode
    }

    /// Recovery commands worth offering for the current phase.
    pub fn recovery_suggestions(&self) -> Vec<String> {
        let f = &self.feature;
        match &self.phase {
            FlowPhase::Error { failed_phase, .. } => {
                let mut out = Vec::new();
                if let Some(p) = failed_phase {
                    out.push(format!("specflow resume {f}    # retry from {}", p.kind()));
                }
                out.push(format!("specflow abort {f}     # discard this flow"));
                out.push(format!("specflow status {f}    # inspect history"));
                out
            }
            FlowPhase::Implementing {
                paused_at: Some(at),
                ..
            } => vec![
                format!("specflow resume {f}    # continue from task {at}"),
                format!("specflow abort {f}     # discard this flow"),
            ],
            _ => Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// StateStore
// ---------------------------------------------------------------------------

/// Persistence seam for flow state. Only the engine writes through it.
pub trait StateStore: Send + Sync {
    /// `Ok(None)` when no flow exists for `feature`.
    fn load(&self, feature: &str) -> Result<Option<FlowState>>;
    fn save(&self, state: &FlowState) -> Result<()>;
    fn list(&self) -> Result<Vec<FlowState>>;
    fn delete(&self, feature: &str) -> Result<bool>;
}

/// JSON files under `.specflow/flows/<feature>/flow-state.json`.
pub struct FileStateStore {
    root: PathBuf,
}

impl FileStateStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl StateStore for FileStateStore {
    fn load(&self, feature: &str) -> Result<Option<FlowState>> {
        paths::validate_slug(feature)?;
        let path = paths::flow_state_path(&self.root, feature);
        if !path.exists() {
            return Ok(None);
        }
        let data = std::fs::read_to_string(&path)?;
        let state: FlowState = serde_json::from_str(&data)?;
        Ok(Some(state))
    }

    fn save(&self, state: &FlowState) -> Result<()> {
        paths::validate_slug(&state.feature)?;
        let path = paths::flow_state_path(&self.root, &state.feature);
        let data = serde_json::to_string_pretty(state)?;
        crate::io::atomic_write(&path, data.as_bytes())
    }

    fn list(&self) -> Result<Vec<FlowState>> {
        let flows_dir = self.root.join(paths::FLOWS_DIR);
        if !flows_dir.exists() {
            return Ok(Vec::new());
        }

        let mut flows = Vec::new();
        for entry in std::fs::read_dir(&flows_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let feature = entry.file_name().to_string_lossy().into_owned();
            if !paths::is_valid_slug(&feature) {
                continue;
            }
            if let Some(state) = self.load(&feature)? {
                flows.push(state);
            }
        }
        flows.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(flows)
    }

    fn delete(&self, feature: &str) -> Result<bool> {
        paths::validate_slug(feature)?;
        let path = paths::flow_state_path(&self.root, feature);
        if !path.exists() {
            return Ok(false);
        }
        std::fs::remove_file(&path)?;
        Ok(true)
    }
}

/// Load a flow that must exist.
pub fn require(store: &dyn StateStore, feature: &str) -> Result<FlowState> {
    store
        .load(feature)?
        .ok_or_else(|| FlowError::FlowNotFound(feature.to_string()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
