//! Process-backed collaborators wired into the engine by the CLI.

use anyhow::Context;
use async_trait::async_trait;
use specflow_core::{
    config::Config,
    engine::{Collaborators, PhaseAgent, PhaseRequest, PrPublisher, WorkflowEngine},
    paths,
    plugin::{PluginManager, PluginRuntime},
    state::{FileStateStore, FlowState},
    task::{
        parse_checklist, AutoContinue, ChangeCommitter, Checkpoint, CheckpointDecider,
        CheckpointDecision, Task, TaskAgent, TaskContext, TaskSource,
    },
    types::PhaseKind,
};
use std::io::{BufRead, IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::process::Output;
use std::sync::Arc;
use tokio::process::Command;

// ---------------------------------------------------------------------------
// Composition
// ---------------------------------------------------------------------------

/// Plugin runtime with every enabled plugin activated. Failures are logged
/// and the plugin is left out.
pub fn plugin_runtime(
    root: &Path,
    config: &Config,
) -> anyhow::Result<(PluginManager, PluginRuntime)> {
    let manager = PluginManager::open(root, config.plugins.registry_dir.clone())
        .context("failed to read plugin index")?;
    let runtime = PluginRuntime::new(config.hook_timeout());
    for (name, err) in manager.activate_all(&runtime) {
        tracing::warn!(plugin = %name, error = %err, "plugin not activated");
    }
    Ok((manager, runtime))
}

/// Build the engine for `root`. `auto_continue` answers every checkpoint
/// with continue; otherwise the user is asked when stdin is a terminal.
pub fn engine(root: &Path, auto_continue: bool) -> anyhow::Result<WorkflowEngine> {
    let config = Config::load(root).context("failed to load config")?;
    let (_, runtime) = plugin_runtime(root, &config)?;

    let agent = Arc::new(ProcessAgent::new(root, &config));
    let interactive = !auto_continue && std::io::stdin().is_terminal();
    let checkpoints: Arc<dyn CheckpointDecider> = if interactive {
        Arc::new(PromptDecider)
    } else {
        Arc::new(AutoContinue)
    };
    let collab = Collaborators {
        phase_agent: agent.clone(),
        tasks: Arc::new(ChecklistTasks::new(root)),
        task_agent: agent,
        committer: Arc::new(GitCommitter::new(root, config.commit.enabled)),
        checkpoints,
        publisher: Arc::new(CommandPublisher::new(root, config.pr.command.clone())),
    };

    let store = Box::new(FileStateStore::new(root));
    Ok(WorkflowEngine::new(store, runtime, collab).with_config(&config))
}

async fn checked(mut cmd: Command, what: &str) -> anyhow::Result<Output> {
    let output = cmd
        .kill_on_drop(true)
        .output()
        .await
        .with_context(|| format!("failed to spawn {what}"))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!("{what} exited with {}: {}", output.status, stderr.trim());
    }
    Ok(output)
}

// ---------------------------------------------------------------------------
// ProcessAgent
// ---------------------------------------------------------------------------

/// Runs the configured agent command with the prompt as its last argument.
pub struct ProcessAgent {
    root: PathBuf,
    command: String,
    args: Vec<String>,
    default_tier: Option<String>,
}

impl ProcessAgent {
    pub fn new(root: &Path, config: &Config) -> Self {
        Self {
            root: root.to_path_buf(),
            command: config.agent.command.clone(),
            args: config.agent.args.clone(),
            default_tier: config.agent.tier.clone(),
        }
    }

    async fn invoke(&self, prompt: &str, tier: Option<&str>) -> anyhow::Result<String> {
        let program = which::which(&self.command)
            .with_context(|| format!("agent command '{}' not found on PATH", self.command))?;

        let mut cmd = Command::new(program);
        cmd.args(&self.args).arg(prompt).current_dir(&self.root);
        if let Some(tier) = tier.or(self.default_tier.as_deref()) {
            cmd.env("CLAUDE_CONFIG_DIR", paths::tier_config_dir(tier)?);
        }

        let output = checked(cmd, "agent").await?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

fn artifact_name(phase: PhaseKind) -> &'static str {
    match phase {
        PhaseKind::RequirementsGenerating => "requirements.md",
        PhaseKind::GapAnalysis => "gap-analysis.md",
        PhaseKind::DesignGenerating => "design.md",
        PhaseKind::DesignValidation => "design-validation.md",
        PhaseKind::TasksGenerating => paths::TASKS_FILE,
        _ => "validation.md",
    }
}

fn phase_prompt(root: &Path, request: &PhaseRequest) -> String {
    let dir = paths::flow_dir(root, &request.feature);
    let artifact = dir.join(artifact_name(request.phase));
    let instruction = match request.phase {
        PhaseKind::RequirementsGenerating => {
            "Write the requirements for this feature as numbered, testable statements."
        }
        PhaseKind::GapAnalysis => {
            "Compare the requirements with the existing codebase \
             and list what is missing or must change."
        }
        PhaseKind::DesignGenerating => "Write a technical design that satisfies the requirements.",
        PhaseKind::DesignValidation => {
            "Check the design against the existing architecture and list any conflicts."
        }
        PhaseKind::TasksGenerating => {
            "Break the design into small implementation tasks, \
             written as a markdown checklist (`- [ ] task`)."
        }
        _ => "Verify the implementation meets every requirement. Fix what does not.",
    };
    format!(
        "Feature: {}\nDescription: {}\nWorkflow: {}\nArtifacts: {}\n\n{}\nWrite the result to {}.",
        request.feature,
        request.description,
        request.mode,
        dir.display(),
        instruction,
        artifact.display(),
    )
}

#[async_trait]
impl PhaseAgent for ProcessAgent {
    async fn run_phase(&self, request: &PhaseRequest) -> anyhow::Result<Option<serde_json::Value>> {
        let prompt = phase_prompt(&self.root, request);
        let output = self.invoke(&prompt, request.tier.as_deref()).await?;
        tracing::debug!(phase = %request.phase, bytes = output.len(), "agent finished");
        Ok(None)
    }
}

#[async_trait]
impl TaskAgent for ProcessAgent {
    async fn implement(&self, task: &Task, ctx: &TaskContext) -> anyhow::Result<()> {
        let dir = paths::flow_dir(&self.root, &ctx.feature);
        let prompt = format!(
            "Feature: {}\nTask {} of {}: {}\n\n\
             Implement this task only. The design and task list are in {}.",
            ctx.feature,
            ctx.index + 1,
            ctx.total,
            task.title,
            dir.display(),
        );
        self.invoke(&prompt, ctx.tier.as_deref()).await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ChecklistTasks
// ---------------------------------------------------------------------------

/// Tasks from `.specflow/flows/<feature>/tasks.md`.
pub struct ChecklistTasks {
    root: PathBuf,
}

impl ChecklistTasks {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }
}

impl TaskSource for ChecklistTasks {
    fn tasks(&self, feature: &str) -> anyhow::Result<Vec<Task>> {
        let path = paths::tasks_path(&self.root, feature);
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Ok(parse_checklist(&text))
    }
}

// ---------------------------------------------------------------------------
// GitCommitter
// ---------------------------------------------------------------------------

/// Commits the working tree after each task.
pub struct GitCommitter {
    root: PathBuf,
    enabled: bool,
}

impl GitCommitter {
    pub fn new(root: &Path, enabled: bool) -> Self {
        Self {
            root: root.to_path_buf(),
            enabled,
        }
    }

    fn git(&self) -> anyhow::Result<Command> {
        let git = which::which("git").context("git not found on PATH")?;
        let mut cmd = Command::new(git);
        cmd.current_dir(&self.root);
        Ok(cmd)
    }
}

#[async_trait]
impl ChangeCommitter for GitCommitter {
    async fn commit(&self, task: &Task, ctx: &TaskContext) -> anyhow::Result<()> {
        if !self.enabled {
            return Ok(());
        }

        let mut add = self.git()?;
        add.args(["add", "-A"]);
        checked(add, "git add").await?;

        let mut diff = self.git()?;
        diff.args(["diff", "--cached", "--quiet"]);
        let staged = diff.kill_on_drop(true).status().await?;
        if staged.success() {
            tracing::debug!(task = %task.id, "nothing to commit");
            return Ok(());
        }

        let message = format!(
            "{}: {} (task {}/{})",
            ctx.feature,
            task.title,
            ctx.index + 1,
            ctx.total
        );
        let mut commit = self.git()?;
        commit.args(["commit", "-m", message.as_str()]);
        checked(commit, "git commit").await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// PromptDecider
// ---------------------------------------------------------------------------

/// Asks on the terminal at each checkpoint.
pub struct PromptDecider;

fn parse_decision(answer: &str) -> Option<CheckpointDecision> {
    match answer.trim().to_ascii_lowercase().as_str() {
        "" | "c" | "continue" => Some(CheckpointDecision::Continue),
        "p" | "pause" => Some(CheckpointDecision::Pause),
        "a" | "abort" => Some(CheckpointDecision::Abort),
        _ => None,
    }
}

fn ask(checkpoint: &Checkpoint) -> CheckpointDecision {
    let stdin = std::io::stdin();
    loop {
        eprint!(
            "Checkpoint: {}/{} tasks complete for '{}'. [c]ontinue, [p]ause, [a]bort? ",
            checkpoint.completed, checkpoint.total, checkpoint.feature
        );
        let _ = std::io::stderr().flush();
        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) | Err(_) => return CheckpointDecision::Pause,
            Ok(_) => {
                if let Some(decision) = parse_decision(&line) {
                    return decision;
                }
            }
        }
    }
}

#[async_trait]
impl CheckpointDecider for PromptDecider {
    async fn decide(&self, checkpoint: &Checkpoint) -> CheckpointDecision {
        let checkpoint = checkpoint.clone();
        tokio::task::spawn_blocking(move || ask(&checkpoint))
            .await
            .unwrap_or(CheckpointDecision::Pause)
    }
}

// ---------------------------------------------------------------------------
// CommandPublisher
// ---------------------------------------------------------------------------

/// Runs `pr.command` through `sh -c`; the last URL printed is the PR.
pub struct CommandPublisher {
    root: PathBuf,
    command: Option<String>,
}

impl CommandPublisher {
    pub fn new(root: &Path, command: Option<String>) -> Self {
        Self {
            root: root.to_path_buf(),
            command,
        }
    }
}

fn last_url(stdout: &str) -> Option<String> {
    stdout
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| l.starts_with("https://") || l.starts_with("http://"))
        .map(str::to_string)
}

#[async_trait]
impl PrPublisher for CommandPublisher {
    async fn create_pr(&self, state: &FlowState) -> anyhow::Result<Option<String>> {
        let Some(command) = &self.command else {
            tracing::info!(feature = %state.feature, "no pr.command configured, skipping pull request");
            return Ok(None);
        };
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .current_dir(&self.root)
            .env("SPECFLOW_FEATURE", &state.feature)
            .env("SPECFLOW_DESCRIPTION", &state.metadata.description);
        let output = checked(cmd, "pr command").await?;
        Ok(last_url(&String::from_utf8_lossy(&output.stdout)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use specflow_core::types::WorkflowMode;
    use tempfile::TempDir;

    #[test]
    fn decision_answers() {
        assert_eq!(parse_decision("\n"), Some(CheckpointDecision::Continue));
        assert_eq!(parse_decision("P\n"), Some(CheckpointDecision::Pause));
        assert_eq!(parse_decision("abort"), Some(CheckpointDecision::Abort));
        assert_eq!(parse_decision("maybe"), None);
    }

    #[test]
    fn pr_url_is_last_url_line() {
        let out = "Creating pull request...\nhttps://github.com/acme/shop/pull/7\n";
        assert_eq!(last_url(out).as_deref(), Some("https://github.com/acme/shop/pull/7"));
        assert_eq!(last_url("no url here"), None);
    }

    #[test]
    fn checklist_tasks_read_from_flow_dir() {
        let dir = TempDir::new().unwrap();
        let path = paths::tasks_path(dir.path(), "coupon");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "# Tasks\n- [x] schema\n- [ ] endpoint\n").unwrap();

        let tasks = ChecklistTasks::new(dir.path()).tasks("coupon").unwrap();
        assert_eq!(tasks.len(), 2);
        assert!(tasks[0].completed);
        assert_eq!(tasks[1].title, "endpoint");
        assert!(ChecklistTasks::new(dir.path()).tasks("missing").is_err());
    }

    #[test]
    fn phase_prompt_names_artifact() {
        let request = PhaseRequest {
            feature: "coupon".into(),
            phase: PhaseKind::DesignGenerating,
            description: "apply a coupon at checkout".into(),
            mode: WorkflowMode::Greenfield,
            tier: None,
        };
        let prompt = phase_prompt(Path::new("/repo"), &request);
        assert!(prompt.contains("apply a coupon at checkout"));
        assert!(prompt.contains("design.md"));
    }

    #[tokio::test]
    async fn publisher_without_command_skips() {
        let dir = TempDir::new().unwrap();
        let state = FlowState::new("coupon", "d", WorkflowMode::Greenfield, None);
        let publisher = CommandPublisher::new(dir.path(), None);
        assert_eq!(publisher.create_pr(&state).await.unwrap(), None);
    }

    #[tokio::test]
    async fn publisher_reads_url_from_command() {
        let dir = TempDir::new().unwrap();
        let state = FlowState::new("coupon", "d", WorkflowMode::Greenfield, None);
        let publisher = CommandPublisher::new(
            dir.path(),
            Some("echo opened; echo https://example.com/pull/$SPECFLOW_FEATURE".into()),
        );
        assert_eq!(
            publisher.create_pr(&state).await.unwrap().as_deref(),
            Some("https://example.com/pull/coupon")
        );
    }
}
