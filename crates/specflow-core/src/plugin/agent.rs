use super::registry::SharedRegistry;
use super::{check_name, PluginResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Names of the agents the host ships with.
pub const RESERVED_AGENTS: &[&str] = &["default", "claude"];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentCapabilities {
    #[serde(default)]
    pub supports_streaming: bool,
    #[serde(default)]
    pub supports_tools: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_context_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub models: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AgentRequest {
    pub prompt: String,
    pub cwd: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
}

impl AgentRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }
}

#[async_trait]
pub trait AgentAdapter: Send + Sync {
    /// Run the agent and return its textual output.
    async fn invoke(&self, request: &AgentRequest) -> anyhow::Result<String>;
    fn capabilities(&self) -> AgentCapabilities;
    fn configure(&self, options: &serde_json::Value) -> anyhow::Result<()>;
}

#[derive(Clone)]
pub struct AgentRegistration {
    pub name: String,
    pub description: String,
    pub adapter: Arc<dyn AgentAdapter>,
}

impl fmt::Debug for AgentRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentRegistration")
            .field("name", &self.name)
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plugin_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AgentResult {
    fn failed(plugin: Option<String>, error: String) -> Self {
        Self {
            success: false,
            plugin_name: plugin,
            output: None,
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentSummary {
    pub name: String,
    pub description: String,
    pub plugin: String,
    pub capabilities: AgentCapabilities,
}

#[derive(Clone)]
pub struct AgentExtension {
    registry: SharedRegistry,
}

impl AgentExtension {
    pub fn new(registry: SharedRegistry) -> Self {
        Self { registry }
    }

    pub fn register_agent(
        &self,
        plugin: &str,
        registration: AgentRegistration,
    ) -> PluginResult<()> {
        let mut reg = self.registry.write();
        let owner = reg.get_agent(&registration.name).map(|o| o.plugin.as_str());
        check_name("agent", plugin, &registration.name, RESERVED_AGENTS, owner)?;
        tracing::debug!(plugin = %plugin, agent = %registration.name, "agent registered");
        reg.insert_agent(plugin, registration);
        Ok(())
    }

    pub fn has_agent(&self, name: &str) -> bool {
        self.registry.read().get_agent(name).is_some()
    }

    pub fn capabilities(&self, name: &str) -> Option<AgentCapabilities> {
        self.lookup(name).map(|(_, r)| r.adapter.capabilities())
    }

    pub fn list_agents(&self) -> Vec<AgentSummary> {
        self.registry
            .read()
            .agents()
            .map(|o| AgentSummary {
                name: o.registration.name.clone(),
                description: o.registration.description.clone(),
                plugin: o.plugin.clone(),
                capabilities: o.registration.adapter.capabilities(),
            })
            .collect()
    }

    pub async fn invoke_agent(&self, name: &str, request: &AgentRequest) -> AgentResult {
        let Some((plugin, registration)) = self.lookup(name) else {
            return AgentResult::failed(None, format!("unknown agent: {name}"));
        };
        match super::guarded(registration.adapter.invoke(request)).await {
            Ok(output) => AgentResult {
                success: true,
                plugin_name: Some(plugin),
                output: Some(output),
                error: None,
            },
            Err(e) => {
                tracing::warn!(plugin = %plugin, agent = %name, error = %format!("{e:#}"), "agent invocation failed");
                AgentResult::failed(Some(plugin), format!("{e:#}"))
            }
        }
    }

    pub fn configure_agent(&self, name: &str, options: &serde_json::Value) -> AgentResult {
        let Some((plugin, registration)) = self.lookup(name) else {
            return AgentResult::failed(None, format!("unknown agent: {name}"));
        };
        match registration.adapter.configure(options) {
            Ok(()) => AgentResult {
                success: true,
                plugin_name: Some(plugin),
                output: None,
                error: None,
            },
            Err(e) => {
                tracing::warn!(plugin = %plugin, agent = %name, error = %format!("{e:#}"), "agent configuration rejected");
                AgentResult::failed(Some(plugin), format!("{e:#}"))
            }
        }
    }

    fn lookup(&self, name: &str) -> Option<(String, AgentRegistration)> {
        self.registry
            .read()
            .get_agent(name)
            .map(|o| (o.plugin.clone(), o.registration.clone()))
    }
}
