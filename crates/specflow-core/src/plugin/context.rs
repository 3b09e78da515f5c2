use super::agent::AgentRegistration;
use super::command::CommandRegistration;
use super::hook::HookRegistration;
use super::service::{ServiceInstance, ServiceRegistration};
use super::template::TemplateRegistration;
use super::{ExtensionPoint, PluginResult, PluginRuntime};
use std::collections::BTreeSet;

/// The only handle a plugin gets during activation. Every registration is
/// attributed to the plugin and the extension point it used is recorded.
pub struct PluginContext<'a> {
    runtime: &'a PluginRuntime,
    plugin: String,
    config: &'a serde_json::Value,
    used: BTreeSet<ExtensionPoint>,
}

impl<'a> PluginContext<'a> {
    pub(crate) fn new(
        runtime: &'a PluginRuntime,
        plugin: &str,
        config: &'a serde_json::Value,
    ) -> Self {
        Self {
            runtime,
            plugin: plugin.to_string(),
            config,
            used: BTreeSet::new(),
        }
    }

    pub fn plugin_name(&self) -> &str {
        &self.plugin
    }

    /// The plugin's stored configuration (`Null` when none was set).
    pub fn config(&self) -> &serde_json::Value {
        self.config
    }

    pub fn register_command(&mut self, registration: CommandRegistration) -> PluginResult<()> {
        self.runtime.commands.register_command(&self.plugin, registration)?;
        self.used.insert(ExtensionPoint::Commands);
        Ok(())
    }

    pub fn register_agent(&mut self, registration: AgentRegistration) -> PluginResult<()> {
        self.runtime.agents.register_agent(&self.plugin, registration)?;
        self.used.insert(ExtensionPoint::Agents);
        Ok(())
    }

    pub fn register_hook(&mut self, registration: HookRegistration) -> PluginResult<()> {
        self.runtime.hooks.register_hook(&self.plugin, registration)?;
        self.used.insert(ExtensionPoint::Hooks);
        Ok(())
    }

    pub fn register_service(&mut self, registration: ServiceRegistration) -> PluginResult<()> {
        self.runtime.services.register_service(&self.plugin, registration)?;
        self.used.insert(ExtensionPoint::Services);
        Ok(())
    }

    pub fn register_template(
        &mut self,
        registration: TemplateRegistration,
    ) -> PluginResult<String> {
        let qualified = self.runtime.templates.register_template(&self.plugin, registration)?;
        self.used.insert(ExtensionPoint::Templates);
        Ok(qualified)
    }

    /// Resolve a service registered by this or another plugin.
    pub fn resolve_service(&self, name: &str) -> PluginResult<ServiceInstance> {
        self.runtime.services.resolve_service(name)
    }

    pub(crate) fn into_used(self) -> BTreeSet<ExtensionPoint> {
        self.used
    }
}
