//! Lazily instantiated plugin services.
//!
//! Registering a service stores its factory; nothing runs until the first
//! `resolve_service`. Resolution walks declared dependencies through the same
//! path, calls the factory once, and memoizes the instance. A single
//! resolution lock guarantees one instantiation at a time, so no caller can
//! observe a half-built service.

use super::registry::SharedRegistry;
use super::{check_name, PluginError, PluginResult};
use parking_lot::Mutex;
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Names held by core services.
pub const RESERVED_SERVICES: &[&str] = &[
    "config",
    "hook-runner",
    "logger",
    "plugin-registry",
    "state-store",
    "workflow-engine",
];

pub type ServiceInstance = Arc<dyn Any + Send + Sync>;

type Factory = Arc<dyn Fn(&ResolvedDeps) -> anyhow::Result<ServiceInstance> + Send + Sync>;
type Disposer = Arc<dyn Fn(&ServiceInstance) -> anyhow::Result<()> + Send + Sync>;

/// Dependencies handed to a factory, keyed by service name.
#[derive(Clone, Default)]
pub struct ResolvedDeps(BTreeMap<String, ServiceInstance>);

impl ResolvedDeps {
    pub fn get<T: Any + Send + Sync>(&self, name: &str) -> Option<Arc<T>> {
        self.0.get(name).cloned()?.downcast::<T>().ok()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Clone)]
pub struct ServiceRegistration {
    pub name: String,
    pub dependencies: Vec<String>,
    factory: Factory,
    dispose: Option<Disposer>,
}

impl ServiceRegistration {
    pub fn new<F>(name: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&ResolvedDeps) -> anyhow::Result<ServiceInstance> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            dependencies: Vec::new(),
            factory: Arc::new(factory),
            dispose: None,
        }
    }

    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_dispose<F>(mut self, dispose: F) -> Self
    where
        F: Fn(&ServiceInstance) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.dispose = Some(Arc::new(dispose));
        self
    }
}

impl fmt::Debug for ServiceRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceRegistration")
            .field("name", &self.name)
            .field("dependencies", &self.dependencies)
            .field("dispose", &self.dispose.is_some())
            .finish_non_exhaustive()
    }
}

struct Instantiated {
    plugin: String,
    order: u64,
    instance: ServiceInstance,
    dispose: Option<Disposer>,
}

#[derive(Default)]
struct Instances {
    next_order: u64,
    live: BTreeMap<String, Instantiated>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DisposeSummary {
    pub disposed: Vec<String>,
    pub failed: Vec<String>,
}

#[derive(Clone)]
pub struct ServiceExtension {
    registry: SharedRegistry,
    instances: Arc<Mutex<Instances>>,
}

impl ServiceExtension {
    pub fn new(registry: SharedRegistry) -> Self {
        Self {
            registry,
            instances: Arc::default(),
        }
    }

    pub fn register_service(
        &self,
        plugin: &str,
        registration: ServiceRegistration,
    ) -> PluginResult<()> {
        let mut reg = self.registry.write();
        let owner = reg.get_service(&registration.name).map(|o| o.plugin.as_str());
        check_name("service", plugin, &registration.name, RESERVED_SERVICES, owner)?;
        tracing::debug!(plugin = %plugin, service = %registration.name, "service registered");
        reg.insert_service(plugin, registration);
        Ok(())
    }

    pub fn has_service(&self, name: &str) -> bool {
        self.registry.read().has_service(name)
    }

    pub fn is_instantiated(&self, name: &str) -> bool {
        self.instances.lock().live.contains_key(name)
    }

    /// Resolve `name`, instantiating it (and its dependencies) on first use.
    pub fn resolve_service(&self, name: &str) -> PluginResult<ServiceInstance> {
        let mut instances = self.instances.lock();
        let mut stack = Vec::new();
        self.resolve_locked(&mut instances, name, &mut stack)
    }

    /// Resolve `name` and downcast it to `T`.
    pub fn resolve_as<T: Any + Send + Sync>(&self, name: &str) -> PluginResult<Arc<T>> {
        self.resolve_service(name)?
            .downcast::<T>()
            .map_err(|_| PluginError::ServiceNotFound(format!("{name} (unexpected type)")))
    }

    fn resolve_locked(
        &self,
        instances: &mut Instances,
        name: &str,
        stack: &mut Vec<String>,
    ) -> PluginResult<ServiceInstance> {
        if let Some(live) = instances.live.get(name) {
            return Ok(Arc::clone(&live.instance));
        }
        if stack.iter().any(|s| s == name) {
            let mut cycle = stack.clone();
            cycle.push(name.to_string());
            return Err(PluginError::DependencyCycle(cycle.join(" -> ")));
        }

        let (plugin, registration) = self
            .registry
            .read()
            .get_service(name)
            .map(|o| (o.plugin.clone(), o.registration.clone()))
            .ok_or_else(|| PluginError::ServiceNotFound(name.to_string()))?;

        stack.push(name.to_string());
        let mut deps = BTreeMap::new();
        for dep in &registration.dependencies {
            match self.resolve_locked(instances, dep, stack) {
                Ok(instance) => {
                    deps.insert(dep.clone(), instance);
                }
                Err(e) => {
                    stack.pop();
                    return Err(e);
                }
            }
        }
        stack.pop();

        let instance = (registration.factory)(&ResolvedDeps(deps)).map_err(|e| {
            tracing::warn!(plugin = %plugin, service = %name, error = %format!("{e:#}"), "service factory failed");
            PluginError::ServiceFactory {
                name: name.to_string(),
                message: format!("{e:#}"),
            }
        })?;

        let order = instances.next_order;
        instances.next_order += 1;
        instances.live.insert(
            name.to_string(),
            Instantiated {
                plugin: plugin.clone(),
                order,
                instance: Arc::clone(&instance),
                dispose: registration.dispose.clone(),
            },
        );
        tracing::debug!(plugin = %plugin, service = %name, "service instantiated");
        Ok(instance)
    }

    /// Dispose every instantiated service owned by `plugin`, newest first.
    /// Services that were never resolved are skipped. A failing disposer is
    /// logged and the rest still run.
    pub fn dispose_plugin_services(&self, plugin: &str) -> DisposeSummary {
        let mut owned: Vec<(String, Instantiated)> = {
            let mut instances = self.instances.lock();
            let names: Vec<String> = instances
                .live
                .iter()
                .filter(|(_, i)| i.plugin == plugin)
                .map(|(n, _)| n.clone())
                .collect();
            names
                .into_iter()
                .filter_map(|n| instances.live.remove(&n).map(|i| (n, i)))
                .collect()
        };
        owned.sort_by_key(|(_, i)| std::cmp::Reverse(i.order));

        let mut summary = DisposeSummary::default();
        for (name, inst) in owned {
            let Some(dispose) = inst.dispose else {
                summary.disposed.push(name);
                continue;
            };
            match dispose(&inst.instance) {
                Ok(()) => summary.disposed.push(name),
                Err(e) => {
                    tracing::warn!(plugin = %plugin, service = %name, error = %format!("{e:#}"), "service dispose failed");
                    summary.failed.push(name);
                }
            }
        }
        summary
    }
}
