use super::registry::SharedRegistry;
use super::{check_name, PluginResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Built-in CLI verbs a plugin command may not shadow.
pub const RESERVED_COMMANDS: &[&str] = &[
    "init", "start", "status", "list", "approve", "reject", "pause", "resume", "abort",
    "advance", "run", "merge", "plugin", "config", "help", "version",
];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandArg {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub required: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandOption {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub takes_value: bool,
}

#[derive(Debug, Clone, Default)]
pub struct CommandInvocation {
    pub args: Vec<String>,
    pub options: BTreeMap<String, String>,
    pub cwd: Option<PathBuf>,
}

#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn execute(&self, invocation: &CommandInvocation) -> anyhow::Result<serde_json::Value>;
}

/// Adapts a synchronous closure into a [`CommandHandler`].
pub struct FnCommand<F>(pub F);

#[async_trait]
impl<F> CommandHandler for FnCommand<F>
where
    F: Fn(&CommandInvocation) -> anyhow::Result<serde_json::Value> + Send + Sync,
{
    async fn execute(&self, invocation: &CommandInvocation) -> anyhow::Result<serde_json::Value> {
        (self.0)(invocation)
    }
}

/// Wrap `f` as a shareable handler.
pub fn command_fn<F>(f: F) -> Arc<dyn CommandHandler>
where
    F: Fn(&CommandInvocation) -> anyhow::Result<serde_json::Value> + Send + Sync + 'static,
{
    Arc::new(FnCommand(f))
}

#[derive(Clone)]
pub struct CommandRegistration {
    pub name: String,
    pub description: String,
    pub args: Vec<CommandArg>,
    pub options: Vec<CommandOption>,
    pub handler: Arc<dyn CommandHandler>,
}

impl CommandRegistration {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        handler: Arc<dyn CommandHandler>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            args: Vec::new(),
            options: Vec::new(),
            handler,
        }
    }
}

impl fmt::Debug for CommandRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandRegistration")
            .field("name", &self.name)
            .field("args", &self.args)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// Outcome of a plugin command. Failures are data, never errors.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plugin_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CommandSummary {
    pub name: String,
    pub description: String,
    pub plugin: String,
}

#[derive(Clone)]
pub struct CommandExtension {
    registry: SharedRegistry,
}

impl CommandExtension {
    pub fn new(registry: SharedRegistry) -> Self {
        Self { registry }
    }

    pub fn register_command(
        &self,
        plugin: &str,
        registration: CommandRegistration,
    ) -> PluginResult<()> {
        let mut reg = self.registry.write();
        let owner = reg.get_command(&registration.name).map(|o| o.plugin.as_str());
        check_name("command", plugin, &registration.name, RESERVED_COMMANDS, owner)?;
        tracing::debug!(plugin = %plugin, command = %registration.name, "command registered");
        reg.insert_command(plugin, registration);
        Ok(())
    }

    pub fn has_command(&self, name: &str) -> bool {
        self.registry.read().get_command(name).is_some()
    }

    pub fn list_commands(&self) -> Vec<CommandSummary> {
        self.registry
            .read()
            .commands()
            .map(|o| CommandSummary {
                name: o.registration.name.clone(),
                description: o.registration.description.clone(),
                plugin: o.plugin.clone(),
            })
            .collect()
    }

    pub async fn execute_command(
        &self,
        name: &str,
        invocation: &CommandInvocation,
    ) -> CommandResult {
        let found = self
            .registry
            .read()
            .get_command(name)
            .map(|o| (o.plugin.clone(), o.registration.clone()));

        let Some((plugin, registration)) = found else {
            return CommandResult {
                success: false,
                plugin_name: None,
                output: None,
                error: Some(format!("unknown command: {name}")),
            };
        };

        let missing: Vec<&str> = registration
            .args
            .iter()
            .skip(invocation.args.len())
            .filter(|a| a.required)
            .map(|a| a.name.as_str())
            .collect();
        if !missing.is_empty() {
            return CommandResult {
                success: false,
                plugin_name: Some(plugin),
                output: None,
                error: Some(format!("missing required argument(s): {}", missing.join(", "))),
            };
        }

        match super::guarded(registration.handler.execute(invocation)).await {
            Ok(output) => CommandResult {
                success: true,
                plugin_name: Some(plugin),
                output: Some(output),
                error: None,
            },
            Err(e) => {
                tracing::warn!(plugin = %plugin, command = %name, error = %format!("{e:#}"), "plugin command failed");
                CommandResult {
                    success: false,
                    plugin_name: Some(plugin),
                    output: None,
                    error: Some(format!("{e:#}")),
                }
            }
        }
    }
}
