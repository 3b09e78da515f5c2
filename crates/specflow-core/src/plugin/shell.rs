//! Plugins installed from a directory.
//!
//! `plugin.json` names an entry point: a JSON contributions file declaring
//! commands, hooks and agents backed by shell commands, static services, and
//! template files. Shell handlers run through `sh -c` with the plugin
//! directory as the default working directory.

use super::agent::{AgentAdapter, AgentCapabilities, AgentRegistration, AgentRequest};
use super::command::{
    CommandArg, CommandHandler, CommandInvocation, CommandOption, CommandRegistration,
};
use super::context::PluginContext;
use super::hook::{
    HookContext, HookHandler, HookPhase, HookPriority, HookRegistration, HookResponse, HookTiming,
};
use super::manifest::PluginManifest;
use super::service::{ServiceInstance, ServiceRegistration};
use super::template::{SpecSubType, TemplateCategory, TemplateRegistration};
use super::{Plugin, PluginError, PluginResult};
use anyhow::Context as _;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

// ---------------------------------------------------------------------------
// Contributions file
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contributions {
    #[serde(default)]
    pub commands: Vec<ShellCommandSpec>,
    #[serde(default)]
    pub hooks: Vec<ShellHookSpec>,
    #[serde(default)]
    pub agents: Vec<ShellAgentSpec>,
    #[serde(default)]
    pub services: Vec<StaticServiceSpec>,
    #[serde(default)]
    pub templates: Vec<TemplateSpec>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ShellCommandSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub run: String,
    #[serde(default)]
    pub args: Vec<CommandArg>,
    #[serde(default)]
    pub options: Vec<CommandOption>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ShellHookSpec {
    pub phase: HookPhase,
    pub timing: HookTiming,
    #[serde(default)]
    pub priority: HookPriority,
    pub run: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ShellAgentSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub run: String,
    #[serde(default)]
    pub capabilities: AgentCapabilities,
}

/// A service whose instance is a fixed JSON value.
#[derive(Debug, Clone, Deserialize)]
pub struct StaticServiceSpec {
    pub name: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub value: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateSpec {
    pub category: TemplateCategory,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub source_path: PathBuf,
    #[serde(default)]
    pub sub_type: Option<SpecSubType>,
}

// ---------------------------------------------------------------------------
// ManifestPlugin
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ManifestPlugin {
    manifest: PluginManifest,
    dir: PathBuf,
    contributions: Contributions,
}

impl ManifestPlugin {
    /// Load and validate a plugin directory.
    pub fn load(dir: &Path) -> PluginResult<Self> {
        let manifest = PluginManifest::from_dir(dir)?;
        manifest.validate()?;

        let entry = dir.join(&manifest.entry_point);
        if !entry.is_file() {
            return Err(PluginError::InvalidManifest(format!(
                "entryPoint '{}' not found in {}",
                manifest.entry_point,
                dir.display()
            )));
        }
        let contributions: Contributions = serde_json::from_str(&std::fs::read_to_string(&entry)?)
            .map_err(|e| PluginError::InvalidManifest(format!("{}: {e}", manifest.entry_point)))?;

        for t in &contributions.templates {
            if !is_contained(&t.source_path) {
                return Err(PluginError::InvalidManifest(format!(
                    "template '{}' source '{}' must be a relative path inside the plugin",
                    t.name,
                    t.source_path.display()
                )));
            }
            if !dir.join(&t.source_path).exists() {
                return Err(PluginError::InvalidManifest(format!(
                    "template '{}' source '{}' not found",
                    t.name,
                    t.source_path.display()
                )));
            }
        }

        Ok(Self {
            manifest,
            dir: dir.to_path_buf(),
            contributions,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn contributions(&self) -> &Contributions {
        &self.contributions
    }

    fn shell(&self, run: &str, config: &serde_json::Value) -> ShellScript {
        ShellScript {
            plugin: self.manifest.name.clone(),
            run: run.to_string(),
            dir: self.dir.clone(),
            config: config.to_string(),
        }
    }
}

impl Plugin for ManifestPlugin {
    fn manifest(&self) -> &PluginManifest {
        &self.manifest
    }

    fn activate(&self, ctx: &mut PluginContext<'_>) -> anyhow::Result<()> {
        let config = ctx.config().clone();
        let c = &self.contributions;

        for spec in &c.commands {
            let mut reg = CommandRegistration::new(
                &spec.name,
                &spec.description,
                Arc::new(self.shell(&spec.run, &config)),
            );
            reg.args = spec.args.clone();
            reg.options = spec.options.clone();
            ctx.register_command(reg)?;
        }

        for spec in &c.hooks {
            ctx.register_hook(HookRegistration::new(
                spec.phase,
                spec.timing,
                spec.priority,
                Arc::new(self.shell(&spec.run, &config)),
            ))?;
        }

        for spec in &c.agents {
            ctx.register_agent(AgentRegistration {
                name: spec.name.clone(),
                description: spec.description.clone(),
                adapter: Arc::new(ShellAgent {
                    script: self.shell(&spec.run, &config),
                    capabilities: spec.capabilities.clone(),
                    options: Mutex::new(serde_json::Value::Null),
                }),
            })?;
        }

        for spec in &c.services {
            let value = Arc::new(spec.value.clone());
            ctx.register_service(
                ServiceRegistration::new(&spec.name, move |_| {
                    Ok(Arc::clone(&value) as ServiceInstance)
                })
                .with_dependencies(spec.dependencies.clone()),
            )?;
        }

        for spec in &c.templates {
            ctx.register_template(TemplateRegistration {
                category: spec.category,
                name: spec.name.clone(),
                description: spec.description.clone(),
                source_path: self.dir.join(&spec.source_path),
                sub_type: spec.sub_type,
            })?;
        }

        Ok(())
    }
}

/// True for a relative path made only of normal components (no `..`, root or
/// drive prefix).
fn is_contained(path: &Path) -> bool {
    path.components().next().is_some()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

// ---------------------------------------------------------------------------
// Shell execution
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct ShellScript {
    plugin: String,
    run: String,
    dir: PathBuf,
    config: String,
}

impl ShellScript {
    /// Run the script, feeding `stdin`, and return trimmed stdout. A non-zero
    /// exit is an error carrying stderr. The child is killed if the future is
    /// dropped (e.g. by a hook timeout).
    async fn exec(
        &self,
        args: &[String],
        cwd: Option<&Path>,
        env: &BTreeMap<String, String>,
        stdin: Option<&[u8]>,
    ) -> anyhow::Result<String> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&self.run)
            .arg(&self.plugin)
            .args(args)
            .current_dir(cwd.unwrap_or(&self.dir))
            .env("SPECFLOW_PLUGIN", &self.plugin)
            .env("SPECFLOW_PLUGIN_DIR", &self.dir)
            .env("SPECFLOW_PLUGIN_CONFIG", &self.config)
            .envs(env)
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn `{}`", self.run))?;
        let pipe = child.stdin.take();
        // Feed stdin while stdout and stderr drain.
        let feed = async move {
            let (Some(input), Some(mut pipe)) = (stdin, pipe) else {
                return Ok(());
            };
            match pipe.write_all(input).await {
                // Scripts that ignore stdin may exit before reading it.
                Err(e) if e.kind() != std::io::ErrorKind::BrokenPipe => Err(e),
                _ => Ok(()),
            }
        };
        let (fed, output) = tokio::join!(feed, child.wait_with_output());
        let output = output?;
        fed?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let hint: String = stderr.trim().chars().take(500).collect();
            anyhow::bail!("`{}` exited with {}: {hint}", self.run, output.status);
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[async_trait]
impl CommandHandler for ShellScript {
    async fn execute(&self, invocation: &CommandInvocation) -> anyhow::Result<serde_json::Value> {
        let env = invocation
            .options
            .iter()
            .map(|(k, v)| {
                let key = format!("SPECFLOW_OPT_{}", k.to_uppercase().replace('-', "_"));
                (key, v.clone())
            })
            .collect();
        let out = self
            .exec(&invocation.args, invocation.cwd.as_deref(), &env, None)
            .await?;
        Ok(serde_json::from_str(&out).unwrap_or(serde_json::Value::String(out)))
    }
}

#[async_trait]
impl HookHandler for ShellScript {
    async fn handle(&self, ctx: &HookContext) -> anyhow::Result<HookResponse> {
        let env = BTreeMap::from([
            ("SPECFLOW_PHASE".to_string(), ctx.phase.to_string()),
            ("SPECFLOW_TIMING".to_string(), ctx.timing.to_string()),
            ("SPECFLOW_FEATURE".to_string(), ctx.feature.clone()),
        ]);
        let input = serde_json::to_vec(ctx)?;
        let out = self.exec(&[], None, &env, Some(&input)).await?;
        if out.is_empty() {
            return Ok(HookResponse::Continue);
        }
        Ok(serde_json::from_str(&out).unwrap_or_else(|_| {
            tracing::debug!(plugin = %self.plugin, "hook output is not a hook response, continuing");
            HookResponse::Continue
        }))
    }
}

struct ShellAgent {
    script: ShellScript,
    capabilities: AgentCapabilities,
    options: Mutex<serde_json::Value>,
}

#[async_trait]
impl AgentAdapter for ShellAgent {
    async fn invoke(&self, request: &AgentRequest) -> anyhow::Result<String> {
        let mut env = request.env.clone();
        env.insert(
            "SPECFLOW_AGENT_OPTIONS".to_string(),
            self.options.lock().to_string(),
        );
        self.script
            .exec(&[], request.cwd.as_deref(), &env, Some(request.prompt.as_bytes()))
            .await
    }

    fn capabilities(&self) -> AgentCapabilities {
        self.capabilities.clone()
    }

    fn configure(&self, options: &serde_json::Value) -> anyhow::Result<()> {
        if !options.is_object() {
            anyhow::bail!("agent options must be a JSON object");
        }
        *self.options.lock() = options.clone();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::plugin::{PluginRuntime, TemplateCategory};
    use crate::state::FlowState;
    use crate::types::{PhaseKind, WorkflowMode};
    use serde_json::json;
    use tempfile::TempDir;

    /// Write a plugin directory with the given manifest fields and contributions.
    pub(crate) fn write_plugin(
        root: &Path,
        name: &str,
        points: &[&str],
        contributions: serde_json::Value,
    ) -> PathBuf {
        write_plugin_with(root, name, points, &[], contributions)
    }

    pub(crate) fn write_plugin_with(
        root: &Path,
        name: &str,
        points: &[&str],
        deps: &[&str],
        contributions: serde_json::Value,
    ) -> PathBuf {
        let dir = root.join(name);
        std::fs::create_dir_all(dir.join("templates")).unwrap();
        let manifest = json!({
            "name": name,
            "version": "1.0.0",
            "description": format!("{name} plugin"),
            "author": "tests",
            "entryPoint": "contributions.json",
            "compatibleCliVersion": "*",
            "extensionPoints": points,
            "dependencies": deps,
            "configSchema": {"properties": {"greeting": {"type": "string"}}}
        });
        std::fs::write(dir.join("plugin.json"), manifest.to_string()).unwrap();
        std::fs::write(dir.join("contributions.json"), contributions.to_string()).unwrap();
        std::fs::write(dir.join("templates/design.md"), "# Design\n").unwrap();
        dir
    }

    fn ctx() -> HookContext {
        let state = FlowState::new("coupons", "add coupons", WorkflowMode::Greenfield, None);
        HookContext::snapshot(PhaseKind::DesignGenerating, HookTiming::Pre, &state)
    }

    #[test]
    fn load_rejects_missing_entry_point_and_templates() {
        let tmp = TempDir::new().unwrap();
        let dir = write_plugin(tmp.path(), "p", &["commands"], json!({}));
        std::fs::remove_file(dir.join("contributions.json")).unwrap();
        assert!(ManifestPlugin::load(&dir).is_err());

        let dir = write_plugin(
            tmp.path(),
            "q",
            &["templates"],
            json!({"templates": [{"category": "stack", "name": "x", "sourcePath": "missing.md"}]}),
        );
        assert!(ManifestPlugin::load(&dir).is_err());
    }

    #[test]
    fn load_rejects_template_paths_outside_the_plugin() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("secret.md"), "outside").unwrap();
        for (name, source) in [("up", "../secret.md"), ("abs", "/etc/hostname")] {
            let dir = write_plugin(
                tmp.path(),
                name,
                &["templates"],
                json!({"templates": [{"category": "stack", "name": "x", "sourcePath": source}]}),
            );
            let err = ManifestPlugin::load(&dir).unwrap_err();
            assert!(matches!(err, PluginError::InvalidManifest(_)), "{source}: {err}");
        }
        assert!(is_contained(Path::new("templates/design.md")));
        assert!(is_contained(Path::new("./design.md")));
        assert!(!is_contained(Path::new("templates/../../x.md")));
        assert!(!is_contained(Path::new("")));
    }

    #[tokio::test]
    async fn large_input_is_echoed_without_stalling() {
        let tmp = TempDir::new().unwrap();
        let script = ShellScript {
            plugin: "echo".into(),
            run: "cat".into(),
            dir: tmp.path().to_path_buf(),
            config: "null".into(),
        };
        let input = vec![b'x'; 1 << 20];
        let out = tokio::time::timeout(
            std::time::Duration::from_secs(30),
            script.exec(&[], None, &BTreeMap::new(), Some(&input)),
        )
        .await
        .expect("exec stalled on a large echoed input")
        .unwrap();
        assert_eq!(out.len(), input.len());
    }

    #[tokio::test]
    async fn shell_agent_echoes_a_long_prompt() {
        let tmp = TempDir::new().unwrap();
        let dir = write_plugin(
            tmp.path(),
            "parrot",
            &["agents"],
            json!({"agents": [{"name": "parrot", "run": "cat"}]}),
        );
        let rt = PluginRuntime::default();
        rt.activate(&ManifestPlugin::load(&dir).unwrap(), &json!(null))
            .unwrap();
        let prompt = "spec ".repeat(50_000);
        let result = tokio::time::timeout(
            std::time::Duration::from_secs(30),
            rt.agents.invoke_agent("parrot", &AgentRequest::new(&prompt)),
        )
        .await
        .unwrap();
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.output.as_deref(), Some(prompt.trim()));
    }

    #[tokio::test]
    async fn shell_command_runs_with_args_and_config() {
        let tmp = TempDir::new().unwrap();
        let dir = write_plugin(
            tmp.path(),
            "greeter",
            &["commands"],
            json!({"commands": [{
                "name": "greet",
                "description": "say hello",
                "run": "echo \"hello $1 from $SPECFLOW_PLUGIN\""
            }]}),
        );
        let plugin = ManifestPlugin::load(&dir).unwrap();
        let rt = PluginRuntime::default();
        rt.activate(&plugin, &json!({"greeting": "hi"})).unwrap();

        let result = rt
            .commands
            .execute_command(
                "greet",
                &CommandInvocation {
                    args: vec!["world".into()],
                    ..Default::default()
                },
            )
            .await;
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.output, Some(json!("hello world from greeter")));
    }

    #[tokio::test]
    async fn failing_shell_command_reports_stderr() {
        let tmp = TempDir::new().unwrap();
        let dir = write_plugin(
            tmp.path(),
            "broken",
            &["commands"],
            json!({"commands": [{"name": "explode", "run": "echo nope >&2; exit 3"}]}),
        );
        let rt = PluginRuntime::default();
        rt.activate(&ManifestPlugin::load(&dir).unwrap(), &json!(null))
            .unwrap();
        let result = rt
            .commands
            .execute_command("explode", &CommandInvocation::default())
            .await;
        assert!(!result.success);
        assert_eq!(result.plugin_name.as_deref(), Some("broken"));
        assert!(result.error.unwrap().contains("nope"));
    }

    #[tokio::test]
    async fn shell_hook_can_veto_via_json() {
        let tmp = TempDir::new().unwrap();
        let dir = write_plugin(
            tmp.path(),
            "gate",
            &["hooks"],
            json!({"hooks": [{
                "phase": "design-generating",
                "timing": "pre",
                "run": concat!(
                    "cat >/dev/null; ",
                    "echo '{\"action\":\"veto\",\"reason\":\"blocked '\"$SPECFLOW_FEATURE\"'\"}'"
                )
            }]}),
        );
        let rt = PluginRuntime::default();
        rt.activate(&ManifestPlugin::load(&dir).unwrap(), &json!(null))
            .unwrap();
        let result = rt
            .hooks
            .run_pre_phase_hooks(PhaseKind::DesignGenerating, &ctx())
            .await;
        assert!(result.vetoed);
        assert_eq!(result.veto_plugin.as_deref(), Some("gate"));
        assert_eq!(result.veto_reason.as_deref(), Some("blocked coupons"));
    }

    #[tokio::test]
    async fn shell_agent_reads_prompt_from_stdin() {
        let tmp = TempDir::new().unwrap();
        let dir = write_plugin(
            tmp.path(),
            "rev",
            &["agents"],
            json!({"agents": [{
                "name": "shout",
                "run": "tr a-z A-Z",
                "capabilities": {"supportsTools": true}
            }]}),
        );
        let rt = PluginRuntime::default();
        rt.activate(&ManifestPlugin::load(&dir).unwrap(), &json!(null))
            .unwrap();
        let result = rt
            .agents
            .invoke_agent("shout", &AgentRequest::new("build it"))
            .await;
        assert_eq!(result.output.as_deref(), Some("BUILD IT"));
        assert!(rt.agents.capabilities("shout").unwrap().supports_tools);
    }

    #[test]
    fn services_and_templates_are_registered() {
        let tmp = TempDir::new().unwrap();
        let dir = write_plugin(
            tmp.path(),
            "kit",
            &["services", "templates"],
            json!({
                "services": [{"name": "endpoints", "value": {"api": "https://example.test"}}],
                "templates": [{
                    "category": "spec",
                    "name": "design",
                    "sourcePath": "templates/design.md",
                    "subType": "design"
                }]
            }),
        );
        let rt = PluginRuntime::default();
        rt.activate(&ManifestPlugin::load(&dir).unwrap(), &json!(null))
            .unwrap();

        let value = rt.services.resolve_as::<serde_json::Value>("endpoints").unwrap();
        assert_eq!(value["api"], "https://example.test");
        let templates = rt.templates.get_templates(TemplateCategory::Spec);
        assert_eq!(templates[0].template.name, "kit/design");
        assert!(templates[0].template.source_path.is_absolute());
    }

    #[test]
    fn contributions_must_match_declared_points() {
        let tmp = TempDir::new().unwrap();
        let dir = write_plugin(
            tmp.path(),
            "liar",
            &["commands", "hooks"],
            json!({"commands": [{"name": "x", "run": "true"}]}),
        );
        let rt = PluginRuntime::default();
        let err = rt
            .activate(&ManifestPlugin::load(&dir).unwrap(), &json!(null))
            .unwrap_err();
        assert!(matches!(err, PluginError::ExtensionPointMismatch { .. }));
        assert!(!rt.commands.has_command("x"));
    }
}
