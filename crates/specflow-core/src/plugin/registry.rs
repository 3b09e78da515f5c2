//! Storage for plugin registrations.
//!
//! The registry answers lookups and namespaces templates. It applies no
//! policy: conflict rules and execution order live in the extension-point
//! services that wrap it.

use super::agent::AgentRegistration;
use super::command::CommandRegistration;
use super::hook::{HookPhase, HookRegistration, HookTiming};
use super::service::ServiceRegistration;
use super::template::{TemplateCategory, TemplateRegistration};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

/// A registration together with the plugin that made it. `seq` increases
/// monotonically across all kinds and records registration order.
#[derive(Debug, Clone)]
pub struct Owned<T> {
    pub plugin: String,
    pub seq: u64,
    pub registration: T,
}

#[derive(Default)]
pub struct PluginRegistry {
    next_seq: u64,
    active: BTreeSet<String>,
    commands: BTreeMap<String, Owned<CommandRegistration>>,
    agents: BTreeMap<String, Owned<AgentRegistration>>,
    hooks: Vec<Owned<HookRegistration>>,
    services: BTreeMap<String, Owned<ServiceRegistration>>,
    templates: BTreeMap<String, Owned<TemplateRegistration>>,
}

/// `plugin/template`
pub fn qualified_template_name(plugin: &str, name: &str) -> String {
    format!("{plugin}/{name}")
}

impl PluginRegistry {
    fn own<T>(&mut self, plugin: &str, registration: T) -> Owned<T> {
        let seq = self.next_seq;
        self.next_seq += 1;
        Owned {
            plugin: plugin.to_string(),
            seq,
            registration,
        }
    }

    // -- plugins ------------------------------------------------------------

    pub fn mark_active(&mut self, plugin: &str) {
        self.active.insert(plugin.to_string());
    }

    pub fn is_active(&self, plugin: &str) -> bool {
        self.active.contains(plugin)
    }

    pub fn active_plugins(&self) -> impl Iterator<Item = &str> {
        self.active.iter().map(String::as_str)
    }

    /// Drop every registration owned by `plugin`. Returns how many were removed.
    pub fn unregister_plugin(&mut self, plugin: &str) -> usize {
        let before = self.len();
        self.active.remove(plugin);
        self.commands.retain(|_, o| o.plugin != plugin);
        self.agents.retain(|_, o| o.plugin != plugin);
        self.hooks.retain(|o| o.plugin != plugin);
        self.services.retain(|_, o| o.plugin != plugin);
        self.templates.retain(|_, o| o.plugin != plugin);
        before - self.len()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
            + self.agents.len()
            + self.hooks.len()
            + self.services.len()
            + self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // -- commands -----------------------------------------------------------

    pub fn insert_command(&mut self, plugin: &str, registration: CommandRegistration) {
        let name = registration.name.clone();
        let owned = self.own(plugin, registration);
        self.commands.insert(name, owned);
    }

    pub fn get_command(&self, name: &str) -> Option<&Owned<CommandRegistration>> {
        self.commands.get(name)
    }

    pub fn commands(&self) -> impl Iterator<Item = &Owned<CommandRegistration>> {
        self.commands.values()
    }

    // -- agents -------------------------------------------------------------

    pub fn insert_agent(&mut self, plugin: &str, registration: AgentRegistration) {
        let name = registration.name.clone();
        let owned = self.own(plugin, registration);
        self.agents.insert(name, owned);
    }

    pub fn get_agent(&self, name: &str) -> Option<&Owned<AgentRegistration>> {
        self.agents.get(name)
    }

    pub fn agents(&self) -> impl Iterator<Item = &Owned<AgentRegistration>> {
        self.agents.values()
    }

    // -- hooks --------------------------------------------------------------

    pub fn add_hook(&mut self, plugin: &str, registration: HookRegistration) {
        let owned = self.own(plugin, registration);
        self.hooks.push(owned);
    }

    /// Hooks bound exactly to `(phase, timing)`, in registration order.
    /// Wildcard hooks are only returned when `phase` is [`HookPhase::Any`].
    pub fn get_hooks(&self, phase: HookPhase, timing: HookTiming) -> Vec<&Owned<HookRegistration>> {
        self.hooks
            .iter()
            .filter(|o| o.registration.phase == phase && o.registration.timing == timing)
            .collect()
    }

    pub fn hook_count(&self) -> usize {
        self.hooks.len()
    }

    // -- services -----------------------------------------------------------

    pub fn insert_service(&mut self, plugin: &str, registration: ServiceRegistration) {
        let name = registration.name.clone();
        let owned = self.own(plugin, registration);
        self.services.insert(name, owned);
    }

    pub fn get_service(&self, name: &str) -> Option<&Owned<ServiceRegistration>> {
        self.services.get(name)
    }

    pub fn has_service(&self, name: &str) -> bool {
        self.services.contains_key(name)
    }

    pub fn services(&self) -> impl Iterator<Item = &Owned<ServiceRegistration>> {
        self.services.values()
    }

    // -- templates ----------------------------------------------------------

    /// Store a template under `plugin/name` and return that qualified name.
    pub fn insert_template(
        &mut self,
        plugin: &str,
        mut registration: TemplateRegistration,
    ) -> String {
        let qualified = qualified_template_name(plugin, &registration.name);
        registration.name = qualified.clone();
        let owned = self.own(plugin, registration);
        self.templates.insert(qualified.clone(), owned);
        qualified
    }

    pub fn get_template(&self, qualified: &str) -> Option<&Owned<TemplateRegistration>> {
        self.templates.get(qualified)
    }

    pub fn get_templates(&self, category: TemplateCategory) -> Vec<&Owned<TemplateRegistration>> {
        self.templates
            .values()
            .filter(|o| o.registration.category == category)
            .collect()
    }
}

impl fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("active", &self.active)
            .field("commands", &self.commands.len())
            .field("agents", &self.agents.len())
            .field("hooks", &self.hooks.len())
            .field("services", &self.services.len())
            .field("templates", &self.templates.len())
            .finish()
    }
}

/// Cloneable handle to one registry, shared by the extension-point services.
#[derive(Clone, Default)]
pub struct SharedRegistry(Arc<RwLock<PluginRegistry>>);

impl SharedRegistry {
    pub fn read(&self) -> RwLockReadGuard<'_, PluginRegistry> {
        self.0.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, PluginRegistry> {
        self.0.write()
    }
}
