//! Plugin extension runtime.
//!
//! A [`PluginRegistry`] stores every registration. Five extension-point
//! services layer policy over it (name conflicts, ordering, timeouts, lazy
//! instantiation). Plugins reach them only through a [`PluginContext`] handed
//! out by [`PluginRuntime::activate`].

pub mod agent;
pub mod command;
pub mod context;
pub mod hook;
pub mod manager;
pub mod manifest;
pub mod registry;
pub mod service;
pub mod shell;
pub mod template;

pub use agent::{
    AgentAdapter, AgentCapabilities, AgentExtension, AgentRegistration, AgentRequest, AgentResult,
};
pub use command::{
    CommandExtension, CommandHandler, CommandInvocation, CommandRegistration, CommandResult,
};
pub use context::PluginContext;
pub use hook::{
    HookContext, HookHandler, HookPhase, HookPriority, HookRegistration, HookResponse,
    HookRunResult, HookRunner, HookTiming,
};
pub use manager::{InstalledPlugin, PluginManager};
pub use manifest::PluginManifest;
pub use registry::{PluginRegistry, SharedRegistry};
pub use service::{ResolvedDeps, ServiceExtension, ServiceInstance, ServiceRegistration};
pub use template::{SpecSubType, TemplateCategory, TemplateExtension, TemplateRegistration};

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use thiserror::Error;

/// Version of the host that plugins declare compatibility against.
pub const HOST_VERSION: &str = env!("CARGO_PKG_VERSION");

pub type PluginResult<T> = Result<T, PluginError>;

#[derive(Debug, Error)]
pub enum PluginError {
    #[error("{kind} '{name}' is already registered by plugin '{owner}'")]
    NameConflict {
        kind: &'static str,
        name: String,
        owner: String,
    },

    #[error("{kind} name '{name}' is reserved by the core")]
    ReservedName { kind: &'static str, name: String },

    #[error("invalid plugin manifest: {0}")]
    InvalidManifest(String),

    #[error("plugin '{name}' requires host {required}, but this host is {available}")]
    IncompatibleVersion {
        name: String,
        required: String,
        available: String,
    },

    #[error("plugin '{name}' declares extension points [{declared}] but registers [{used}]")]
    ExtensionPointMismatch {
        name: String,
        declared: String,
        used: String,
    },

    #[error("plugin '{plugin}' depends on '{dependency}', which is not installed or not enabled")]
    MissingDependency { plugin: String, dependency: String },

    #[error("dependency cycle: {0}")]
    DependencyCycle(String),

    #[error("service not found: {0}")]
    ServiceNotFound(String),

    #[error("service '{name}' failed to initialize: {message}")]
    ServiceFactory { name: String, message: String },

    #[error("plugin '{name}' failed to activate: {message}")]
    Activation { name: String, message: String },

    #[error("plugin source not found: {0}")]
    SourceNotFound(String),

    #[error("plugin not installed: {0}")]
    NotInstalled(String),

    #[error("plugin '{0}' is already installed")]
    AlreadyInstalled(String),

    #[error("plugin '{plugin}' has no config key '{key}'")]
    UnknownConfigKey { plugin: String, key: String },

    #[error("invalid value for '{plugin}' config key '{key}': {message}")]
    InvalidConfig {
        plugin: String,
        key: String,
        message: String,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// ExtensionPoint
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtensionPoint {
    Commands,
    Agents,
    Hooks,
    Services,
    Templates,
}

impl ExtensionPoint {
    pub fn as_str(self) -> &'static str {
        match self {
            ExtensionPoint::Commands => "commands",
            ExtensionPoint::Agents => "agents",
            ExtensionPoint::Hooks => "hooks",
            ExtensionPoint::Services => "services",
            ExtensionPoint::Templates => "templates",
        }
    }
}

impl fmt::Display for ExtensionPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub(crate) fn join_points(points: &BTreeSet<ExtensionPoint>) -> String {
    points
        .iter()
        .map(|p| p.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Shared name policy for commands, agents and services: reject reserved
/// names and names another plugin already owns, logging the conflict first.
pub(crate) fn check_name(
    kind: &'static str,
    plugin: &str,
    name: &str,
    reserved: &[&str],
    owner: Option<&str>,
) -> PluginResult<()> {
    if name.trim().is_empty() {
        return Err(PluginError::InvalidManifest(format!(
            "plugin '{plugin}' registered a {kind} with an empty name"
        )));
    }
    if reserved.contains(&name) {
        tracing::warn!(plugin = %plugin, kind, name = %name, "registration uses a reserved name");
        return Err(PluginError::ReservedName {
            kind,
            name: name.to_string(),
        });
    }
    if let Some(owner) = owner {
        tracing::warn!(plugin = %plugin, owner = %owner, kind, name = %name, "registration name conflict");
        return Err(PluginError::NameConflict {
            kind,
            name: name.to_string(),
            owner: owner.to_string(),
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Plugin
// ---------------------------------------------------------------------------

/// A unit of extension. Implemented by in-process plugins and by
/// [`shell::ManifestPlugin`] for plugins installed from a directory.
pub trait Plugin: Send + Sync {
    fn manifest(&self) -> &PluginManifest;

    /// Register everything the plugin contributes.
    fn activate(&self, ctx: &mut PluginContext<'_>) -> anyhow::Result<()>;
}

// ---------------------------------------------------------------------------
// PluginRuntime
// ---------------------------------------------------------------------------

/// Owns the registry and the extension-point services. Built once by the
/// composition root and passed to whatever needs it.
#[derive(Clone)]
pub struct PluginRuntime {
    pub registry: SharedRegistry,
    pub commands: CommandExtension,
    pub agents: AgentExtension,
    pub hooks: HookRunner,
    pub services: ServiceExtension,
    pub templates: TemplateExtension,
}

impl Default for PluginRuntime {
    fn default() -> Self {
        Self::new(hook::DEFAULT_HOOK_TIMEOUT)
    }
}

impl PluginRuntime {
    pub fn new(hook_timeout: Duration) -> Self {
        let registry = SharedRegistry::default();
        Self {
            commands: CommandExtension::new(registry.clone()),
            agents: AgentExtension::new(registry.clone()),
            hooks: HookRunner::new(registry.clone()).with_timeout(hook_timeout),
            services: ServiceExtension::new(registry.clone()),
            templates: TemplateExtension::new(registry.clone()),
            registry,
        }
    }

    /// Validate `plugin`'s manifest against the host, run its activation, and
    /// check that what it registered matches its declared extension points.
    /// Any failure leaves no registration of the plugin behind.
    pub fn activate(&self, plugin: &dyn Plugin, config: &serde_json::Value) -> PluginResult<()> {
        let manifest = plugin.manifest();
        manifest.validate()?;
        manifest.check_host(HOST_VERSION)?;

        let name = manifest.name.clone();
        if self.registry.read().is_active(&name) {
            return Err(PluginError::AlreadyInstalled(name));
        }

        let mut ctx = PluginContext::new(self, &name, config);
        let activated = plugin.activate(&mut ctx);
        let used = ctx.into_used();

        let checked = match activated {
            Err(e) => Err(PluginError::Activation {
                name: name.clone(),
                message: format!("{e:#}"),
            }),
            Ok(()) => manifest.check_extension_points(&used),
        };

        if let Err(e) = checked {
            tracing::warn!(plugin = %name, error = %e, "plugin activation rolled back");
            self.deactivate(&name);
            return Err(e);
        }

        self.registry.write().mark_active(&name);
        tracing::info!(plugin = %name, points = %join_points(&used), "plugin activated");
        Ok(())
    }

    /// Dispose the plugin's instantiated services, then drop its registrations.
    pub fn deactivate(&self, name: &str) {
        self.services.dispose_plugin_services(name);
        self.registry.write().unregister_plugin(name);
    }

    /// Reload = unregister + dispose + re-register.
    pub fn reload(&self, plugin: &dyn Plugin, config: &serde_json::Value) -> PluginResult<()> {
        self.deactivate(&plugin.manifest().name);
        self.activate(plugin, config)
    }
}

impl fmt::Debug for PluginRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginRuntime")
            .field("registry", &*self.registry.read())
            .finish()
    }
}

/// Await a plugin handler, turning a panic inside it into an error so it
/// surfaces as a failed result instead of unwinding through the host.
pub(crate) async fn guarded<T>(
    handler: impl Future<Output = anyhow::Result<T>>,
) -> anyhow::Result<T> {
    match AssertUnwindSafe(handler).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            Err(anyhow::anyhow!("handler panicked: {message}"))
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::plugin::service::ServiceInstance;
    use std::sync::Arc;

    pub(crate) struct TestPlugin {
        pub manifest: PluginManifest,
        pub activate: Box<dyn Fn(&mut PluginContext<'_>) -> anyhow::Result<()> + Send + Sync>,
    }

    impl Plugin for TestPlugin {
        fn manifest(&self) -> &PluginManifest {
            &self.manifest
        }

        fn activate(&self, ctx: &mut PluginContext<'_>) -> anyhow::Result<()> {
            (self.activate)(ctx)
        }
    }

    pub(crate) fn manifest(name: &str, points: &[ExtensionPoint]) -> PluginManifest {
        PluginManifest {
            name: name.to_string(),
            version: "1.0.0".into(),
            description: format!("{name} test plugin"),
            author: "tests".into(),
            entry_point: "contributions.json".into(),
            compatible_cli_version: "*".into(),
            extension_points: points.to_vec(),
            dependencies: Vec::new(),
            config_schema: None,
        }
    }

    fn service_plugin(name: &str, service: &'static str) -> TestPlugin {
        TestPlugin {
            manifest: manifest(name, &[ExtensionPoint::Services]),
            activate: Box::new(move |ctx| {
                ctx.register_service(ServiceRegistration::new(service, |_| {
                    Ok(Arc::new(1u32) as ServiceInstance)
                }))?;
                Ok(())
            }),
        }
    }

    #[test]
    fn activate_registers_and_marks_active() {
        let rt = PluginRuntime::default();
        rt.activate(&service_plugin("p", "cache"), &serde_json::Value::Null)
            .unwrap();
        assert!(rt.services.has_service("cache"));
        assert!(rt.registry.read().is_active("p"));
    }

    #[test]
    fn undeclared_extension_point_rolls_back() {
        let rt = PluginRuntime::default();
        let mut plugin = service_plugin("p", "cache");
        plugin.manifest.extension_points = vec![ExtensionPoint::Commands];
        let err = rt.activate(&plugin, &serde_json::Value::Null).unwrap_err();
        assert!(matches!(err, PluginError::ExtensionPointMismatch { .. }));
        assert!(!rt.services.has_service("cache"));
        assert!(!rt.registry.read().is_active("p"));
    }

    #[test]
    fn failed_activation_leaves_nothing_behind() {
        let rt = PluginRuntime::default();
        let plugin = TestPlugin {
            manifest: manifest("p", &[ExtensionPoint::Services]),
            activate: Box::new(|ctx| {
                ctx.register_service(ServiceRegistration::new("half", |_| {
                    Ok(Arc::new(()) as ServiceInstance)
                }))?;
                anyhow::bail!("boom")
            }),
        };
        let err = rt.activate(&plugin, &serde_json::Value::Null).unwrap_err();
        assert!(err.to_string().contains("boom"));
        assert!(!rt.services.has_service("half"));
    }

    #[test]
    fn incompatible_host_version_is_rejected() {
        let rt = PluginRuntime::default();
        let mut plugin = service_plugin("p", "cache");
        plugin.manifest.compatible_cli_version = ">=99.0.0".into();
        assert!(matches!(
            rt.activate(&plugin, &serde_json::Value::Null),
            Err(PluginError::IncompatibleVersion { .. })
        ));
    }

    #[test]
    fn reload_replaces_registrations() {
        let rt = PluginRuntime::default();
        let plugin = service_plugin("p", "cache");
        rt.activate(&plugin, &serde_json::Value::Null).unwrap();
        rt.services.resolve_service("cache").unwrap();
        rt.reload(&plugin, &serde_json::Value::Null).unwrap();
        assert!(rt.services.has_service("cache"));
        assert!(!rt.services.is_instantiated("cache"));
    }
}
