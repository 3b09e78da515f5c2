use crate::error::{FlowError, Result};
use crate::paths;
use crate::retry::RetryPolicy;
use crate::types::WorkflowMode;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    #[serde(default)]
    pub default_mode: WorkflowMode,
    /// Completed tasks between checkpoints. 0 disables checkpoints.
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval: usize,
}

fn default_checkpoint_interval() -> usize {
    3
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            default_mode: WorkflowMode::default(),
            checkpoint_interval: default_checkpoint_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HooksConfig {
    #[serde(default = "default_hook_timeout")]
    pub timeout_secs: u64,
}

fn default_hook_timeout() -> u64 {
    30
}

impl Default for HooksConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_hook_timeout(),
        }
    }
}

/// External code-generation agent, run as a subprocess.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_agent_command")]
    pub command: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tier: Option<String>,
}

fn default_agent_command() -> String {
    "claude".to_string()
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: default_agent_command(),
            args: vec!["-p".to_string()],
            tier: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

impl Default for CommitConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PrConfig {
    /// Shell command that opens a PR and prints its URL on stdout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PluginsConfig {
    /// Local directory searched by `plugin install <name>`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry_dir: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Config (top-level)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_version")]
    pub version: u32,
    pub project: ProjectConfig,
    #[serde(default)]
    pub workflow: WorkflowConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub hooks: HooksConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub commit: CommitConfig,
    #[serde(default)]
    pub pr: PrConfig,
    #[serde(default)]
    pub plugins: PluginsConfig,
}

fn default_version() -> u32 {
    1
}

impl Config {
    pub fn new(project_name: impl Into<String>) -> Self {
        Self {
            version: 1,
            project: ProjectConfig {
                name: project_name.into(),
                description: None,
            },
            workflow: WorkflowConfig::default(),
            retry: RetryPolicy::default(),
            hooks: HooksConfig::default(),
            agent: AgentConfig::default(),
            commit: CommitConfig::default(),
            pr: PrConfig::default(),
            plugins: PluginsConfig::default(),
        }
    }

    pub fn load(root: &Path) -> Result<Self> {
        let path = paths::config_path(root);
        if !path.exists() {
            return Err(FlowError::NotInitialized);
        }
        let data = std::fs::read_to_string(&path)?;
        let cfg: Config = serde_yaml::from_str(&data)?;
        Ok(cfg)
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        let path = paths::config_path(root);
        let data = serde_yaml::to_string(self)?;
        crate::io::atomic_write(&path, data.as_bytes())
    }

    pub fn hook_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.hooks.timeout_secs)
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();
        let mut warn = |level: WarnLevel, message: String| {
            warnings.push(ConfigWarning { level, message })
        };

        if self.project.name.trim().is_empty() {
            warn(WarnLevel::Error, "project.name is empty".to_string());
        }

        if self.retry.max_attempts == 0 {
            warn(
                WarnLevel::Warning,
                "retry.max_attempts is 0; tasks will run once with no retries".to_string(),
            );
        } else if self.retry.max_attempts > 10 {
            warn(
                WarnLevel::Warning,
                format!(
                    "retry.max_attempts={} (>10 is unusual)",
                    self.retry.max_attempts
                ),
            );
        }

        if self.retry.initial_delay_ms > self.retry.max_delay_ms {
            warn(
                WarnLevel::Warning,
                format!(
                    "retry.initial_delay_ms ({}) exceeds retry.max_delay_ms ({})",
                    self.retry.initial_delay_ms, self.retry.max_delay_ms
                ),
            );
        }

        if self.hooks.timeout_secs == 0 {
            warn(
                WarnLevel::Error,
                "hooks.timeout_secs is 0; every hook would time out".to_string(),
            );
        }

        if self.agent.command.trim().is_empty() {
            warn(WarnLevel::Error, "agent.command is empty".to_string());
        }

        if let Some(tier) = &self.agent.tier {
            if !paths::is_valid_slug(tier) {
                warn(
                    WarnLevel::Warning,
                    format!("agent.tier '{tier}' is not a valid directory suffix"),
                );
            }
        }

        if let Some(cmd) = &self.pr.command {
            if cmd.trim().is_empty() {
                warn(WarnLevel::Warning, "pr.command is empty".to_string());
            }
        }

        if let Some(dir) = &self.plugins.registry_dir {
            if !dir.is_dir() {
                warn(
                    WarnLevel::Warning,
                    format!("plugins.registry_dir '{}' does not exist", dir.display()),
                );
            }
        }

        warnings
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
