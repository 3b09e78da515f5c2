//! Installed-plugin lifecycle backed by `.specflow/plugins/plugins.json`.
//!
//! Installing copies the plugin directory under `.specflow/plugins/<name>/`
//! and records it in the index. Activation happens separately, in dependency
//! order, against a [`PluginRuntime`].

use super::manifest::PluginManifest;
use super::shell::ManifestPlugin;
use super::{Plugin, PluginError, PluginResult, PluginRuntime, HOST_VERSION};
use crate::error::Result;
use crate::{io, paths};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginState {
    #[default]
    Enabled,
    Disabled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstalledPlugin {
    pub manifest: PluginManifest,
    /// Where the plugin was installed from; `update` reads it again.
    pub source: PathBuf,
    #[serde(default)]
    pub state: PluginState,
    pub installed_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub config: serde_json::Map<String, serde_json::Value>,
}

impl InstalledPlugin {
    pub fn is_enabled(&self) -> bool {
        self.state == PluginState::Enabled
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PluginIndex {
    #[serde(default)]
    plugins: BTreeMap<String, InstalledPlugin>,
}

pub struct PluginManager {
    root: PathBuf,
    registry_dir: Option<PathBuf>,
    index: PluginIndex,
}

impl PluginManager {
    pub fn open(root: &Path, registry_dir: Option<PathBuf>) -> Result<Self> {
        let path = paths::plugin_index_path(root);
        let index = if path.exists() {
            serde_json::from_str(&std::fs::read_to_string(&path)?)?
        } else {
            PluginIndex::default()
        };
        Ok(Self {
            root: root.to_path_buf(),
            registry_dir,
            index,
        })
    }

    fn save(&self) -> Result<()> {
        let data = serde_json::to_string_pretty(&self.index)?;
        io::atomic_write(&paths::plugin_index_path(&self.root), data.as_bytes())
    }

    /// A path to a plugin directory, or a name looked up in the registry dir.
    pub fn resolve_source(&self, spec: &str) -> Result<PathBuf> {
        let direct = PathBuf::from(spec);
        if direct.join(paths::PLUGIN_MANIFEST_FILE).is_file() {
            return Ok(std::fs::canonicalize(direct)?);
        }
        if let Some(dir) = &self.registry_dir {
            let candidate = dir.join(spec);
            if candidate.join(paths::PLUGIN_MANIFEST_FILE).is_file() {
                return Ok(candidate);
            }
        }
        Err(PluginError::SourceNotFound(spec.to_string()).into())
    }

    pub fn list(&self) -> Vec<&InstalledPlugin> {
        self.index.plugins.values().collect()
    }

    pub fn info(&self, name: &str) -> Result<&InstalledPlugin> {
        self.index
            .plugins
            .get(name)
            .ok_or_else(|| PluginError::NotInstalled(name.to_string()).into())
    }

    fn entry_mut(&mut self, name: &str) -> Result<&mut InstalledPlugin> {
        self.index
            .plugins
            .get_mut(name)
            .ok_or_else(|| PluginError::NotInstalled(name.to_string()).into())
    }

    /// Full check of a plugin directory: manifest, host version, and a dry-run
    /// activation in a scratch runtime to compare registered extension points.
    pub fn validate(dir: &Path) -> Result<PluginManifest> {
        let plugin = ManifestPlugin::load(dir)?;
        let scratch = PluginRuntime::default();
        scratch.activate(&plugin, &serde_json::Value::Null)?;
        scratch.deactivate(&plugin.manifest().name);
        Ok(plugin.manifest().clone())
    }

    pub fn install(&mut self, spec: &str) -> Result<InstalledPlugin> {
        let source = self.resolve_source(spec)?;
        let manifest = Self::validate(&source)?;
        let name = manifest.name.clone();
        if self.index.plugins.contains_key(&name) {
            return Err(PluginError::AlreadyInstalled(name).into());
        }

        let target = paths::plugin_dir(&self.root, &name);
        if target.exists() {
            std::fs::remove_dir_all(&target)?;
        }
        io::copy_dir(&source, &target)?;

        let now = Utc::now();
        let entry = InstalledPlugin {
            config: manifest.config_defaults(),
            manifest,
            source,
            state: PluginState::Enabled,
            installed_at: now,
            updated_at: now,
        };
        self.index.plugins.insert(name.clone(), entry.clone());
        self.save()?;
        tracing::info!(plugin = %name, version = %entry.manifest.version, "plugin installed");
        Ok(entry)
    }

    pub fn uninstall(&mut self, name: &str, runtime: &PluginRuntime) -> Result<()> {
        self.info(name)?;
        let dependents = self.deactivate_dependents(name, runtime);
        if !dependents.is_empty() {
            tracing::warn!(plugin = %name, dependents = %dependents.join(", "), "uninstalling a plugin other plugins depend on");
        }
        runtime.deactivate(name);
        self.index.plugins.remove(name);
        let dir = paths::plugin_dir(&self.root, name);
        if dir.exists() {
            std::fs::remove_dir_all(dir)?;
        }
        self.save()?;
        tracing::info!(plugin = %name, "plugin uninstalled");
        Ok(())
    }

    /// Mark enabled and activate now. On activation failure the plugin is
    /// left disabled.
    pub fn enable(&mut self, name: &str, runtime: &PluginRuntime) -> Result<()> {
        let entry = self.entry_mut(name)?;
        entry.state = PluginState::Enabled;
        entry.updated_at = Utc::now();
        let entry = entry.clone();
        if runtime.registry.read().is_active(name) {
            return self.save();
        }

        let missing = entry.manifest.dependencies.iter().find(|dep| {
            !self.index.plugins.get(*dep).is_some_and(InstalledPlugin::is_enabled)
                || !runtime.registry.read().is_active(dep)
        });
        let activated = match missing {
            Some(dep) => Err(PluginError::MissingDependency {
                plugin: name.to_string(),
                dependency: dep.clone(),
            }),
            None => self.activate_installed(runtime, name, &entry),
        };

        if let Err(e) = activated {
            self.entry_mut(name)?.state = PluginState::Disabled;
            return Err(e.into());
        }
        self.save()
    }

    /// Mark disabled and deactivate now, along with every active plugin that
    /// depends on it. Dependents stay enabled in the index; they activate again
    /// on the next `activate_all` once the dependency is back.
    pub fn disable(&mut self, name: &str, runtime: &PluginRuntime) -> Result<()> {
        let entry = self.entry_mut(name)?;
        entry.state = PluginState::Disabled;
        entry.updated_at = Utc::now();
        let dependents = self.deactivate_dependents(name, runtime);
        if !dependents.is_empty() {
            tracing::warn!(plugin = %name, dependents = %dependents.join(", "), "deactivated plugins depending on a disabled plugin");
        }
        runtime.deactivate(name);
        self.save()?;
        tracing::info!(plugin = %name, "plugin disabled");
        Ok(())
    }

    /// Re-read the plugin from its source. If it is enabled, its registrations
    /// are replaced: unregister, dispose, re-register.
    pub fn update(&mut self, name: &str, runtime: &PluginRuntime) -> Result<InstalledPlugin> {
        let current = self.info(name)?.clone();
        let manifest = Self::validate(&current.source)?;
        if manifest.name != name {
            return Err(PluginError::InvalidManifest(format!(
                "source now declares plugin '{}', expected '{name}'",
                manifest.name
            ))
            .into());
        }

        runtime.deactivate(name);
        let target = paths::plugin_dir(&self.root, name);
        if target.exists() {
            std::fs::remove_dir_all(&target)?;
        }
        io::copy_dir(&current.source, &target)?;

        let mut config = manifest.config_defaults();
        config.extend(current.config.clone());
        let entry = InstalledPlugin {
            manifest,
            config,
            updated_at: Utc::now(),
            ..current
        };
        self.index.plugins.insert(name.to_string(), entry.clone());
        self.save()?;

        if entry.is_enabled() {
            self.activate_installed(runtime, name, &entry)?;
        }
        tracing::info!(plugin = %name, version = %entry.manifest.version, "plugin updated");
        Ok(entry)
    }

    // -----------------------------------------------------------------------
    // Config
    // -----------------------------------------------------------------------

    pub fn config_get(&self, name: &str, key: Option<&str>) -> Result<serde_json::Value> {
        let entry = self.info(name)?;
        match key {
            None => Ok(serde_json::Value::Object(entry.config.clone())),
            Some(k) => entry.config.get(k).cloned().ok_or_else(|| {
                PluginError::UnknownConfigKey {
                    plugin: name.to_string(),
                    key: k.to_string(),
                }
                .into()
            }),
        }
    }

    pub fn config_set(&mut self, name: &str, key: &str, value: serde_json::Value) -> Result<()> {
        let entry = self.entry_mut(name)?;
        entry.manifest.validate_config_value(key, &value)?;
        entry.config.insert(key.to_string(), value);
        entry.updated_at = Utc::now();
        self.save()
    }

    // -----------------------------------------------------------------------
    // Activation
    // -----------------------------------------------------------------------

    fn dependents_of(&self, name: &str) -> Vec<String> {
        self.index
            .plugins
            .values()
            .filter(|p| p.manifest.dependencies.iter().any(|d| d == name))
            .map(|p| p.manifest.name.clone())
            .collect()
    }

    /// Deactivate active plugins that depend on `name`, directly or
    /// transitively, dependents first. Returns the names deactivated.
    fn deactivate_dependents(&self, name: &str, runtime: &PluginRuntime) -> Vec<String> {
        let mut order = Vec::new();
        let mut pending = vec![name.to_string()];
        while let Some(current) = pending.pop() {
            for dependent in self.dependents_of(&current) {
                if dependent != name && !order.contains(&dependent) {
                    order.push(dependent.clone());
                    pending.push(dependent);
                }
            }
        }

        let active: Vec<String> = {
            let registry = runtime.registry.read();
            order.into_iter().filter(|p| registry.is_active(p)).collect()
        };
        for plugin in active.iter().rev() {
            runtime.deactivate(plugin);
        }
        active
    }

    fn activate_installed(
        &self,
        runtime: &PluginRuntime,
        name: &str,
        entry: &InstalledPlugin,
    ) -> PluginResult<()> {
        let plugin = ManifestPlugin::load(&paths::plugin_dir(&self.root, name))?;
        runtime.activate(&plugin, &serde_json::Value::Object(entry.config.clone()))
    }

    /// Activate every enabled plugin, dependencies first. A plugin whose
    /// dependency is missing, disabled, failed or cyclic is skipped; the
    /// rest still activate. Returns the failures.
    pub fn activate_all(&self, runtime: &PluginRuntime) -> Vec<(String, PluginError)> {
        let mut outcome = BTreeMap::new();
        let mut failures = Vec::new();
        let enabled: Vec<String> = self
            .index
            .plugins
            .values()
            .filter(|p| p.is_enabled())
            .map(|p| p.manifest.name.clone())
            .collect();
        for name in enabled {
            let mut stack = Vec::new();
            self.visit(runtime, &name, &mut stack, &mut outcome, &mut failures);
        }
        failures
    }

    fn visit(
        &self,
        runtime: &PluginRuntime,
        name: &str,
        stack: &mut Vec<String>,
        outcome: &mut BTreeMap<String, bool>,
        failures: &mut Vec<(String, PluginError)>,
    ) -> bool {
        if let Some(ok) = outcome.get(name) {
            return *ok;
        }
        if let Some(pos) = stack.iter().position(|s| s == name) {
            let mut cycle = stack[pos..].to_vec();
            cycle.push(name.to_string());
            let path = cycle.join(" -> ");
            for member in &stack[pos..] {
                if outcome.insert(member.clone(), false).is_none() {
                    failures.push((member.clone(), PluginError::DependencyCycle(path.clone())));
                }
            }
            return false;
        }
        let Some(entry) = self.index.plugins.get(name) else {
            return false;
        };

        stack.push(name.to_string());
        let mut result = Ok(());
        for dep in &entry.manifest.dependencies {
            let dep_ok = match self.index.plugins.get(dep) {
                Some(d) if d.is_enabled() => self.visit(runtime, dep, stack, outcome, failures),
                _ => false,
            };
            if !dep_ok {
                result = Err(PluginError::MissingDependency {
                    plugin: name.to_string(),
                    dependency: dep.clone(),
                });
                break;
            }
        }
        stack.pop();

        // Already marked as part of a cycle while visiting dependencies.
        if outcome.contains_key(name) {
            return false;
        }

        let ok = match result.and_then(|()| self.activate_installed(runtime, name, entry)) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(plugin = %name, error = %e, "plugin not activated");
                failures.push((name.to_string(), e));
                false
            }
        };
        outcome.insert(name.to_string(), ok);
        ok
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::shell::tests::{write_plugin, write_plugin_with};
    use crate::plugin::command::CommandInvocation;
    use crate::FlowError;
    use serde_json::json;
    use tempfile::TempDir;

    struct Fixture {
        project: TempDir,
        sources: TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            let project = TempDir::new().unwrap();
            std::fs::create_dir_all(project.path().join(paths::SPECFLOW_DIR)).unwrap();
            Self {
                project,
                sources: TempDir::new().unwrap(),
            }
        }

        fn manager(&self) -> PluginManager {
            let registry = Some(self.sources.path().to_path_buf());
            PluginManager::open(self.project.path(), registry).unwrap()
        }

        fn command_plugin(&self, name: &str, command: &str, deps: &[&str]) -> PathBuf {
            write_plugin_with(
                self.sources.path(),
                name,
                &["commands"],
                deps,
                json!({"commands": [{"name": command, "run": format!("echo {command}")}]}),
            )
        }
    }

    #[test]
    fn install_copies_and_persists() {
        let fx = Fixture::new();
        fx.command_plugin("lint-kit", "lint", &[]);
        let mut mgr = fx.manager();
        let installed = mgr.install("lint-kit").unwrap();
        assert_eq!(installed.manifest.name, "lint-kit");
        assert!(paths::plugin_dir(fx.project.path(), "lint-kit")
            .join("plugin.json")
            .exists());

        let reopened = fx.manager();
        assert_eq!(reopened.list().len(), 1);
        assert!(reopened.info("lint-kit").unwrap().is_enabled());
    }

    #[test]
    fn install_by_path_and_reject_duplicates() {
        let fx = Fixture::new();
        let dir = fx.command_plugin("fmt-kit", "fmt", &[]);
        let mut mgr = fx.manager();
        mgr.install(dir.to_str().unwrap()).unwrap();
        assert!(matches!(
            mgr.install("fmt-kit"),
            Err(FlowError::Plugin(PluginError::AlreadyInstalled(_)))
        ));
        assert!(matches!(
            mgr.install("nowhere"),
            Err(FlowError::Plugin(PluginError::SourceNotFound(_)))
        ));
    }

    #[test]
    fn install_rejects_extension_point_mismatch() {
        let fx = Fixture::new();
        write_plugin(
            fx.sources.path(),
            "liar",
            &["hooks"],
            json!({"commands": [{"name": "x", "run": "true"}]}),
        );
        let mut mgr = fx.manager();
        assert!(mgr.install("liar").is_err());
        assert!(mgr.list().is_empty());
    }

    #[tokio::test]
    async fn activate_all_respects_dependencies() {
        let fx = Fixture::new();
        fx.command_plugin("base", "base-cmd", &[]);
        fx.command_plugin("child", "child-cmd", &["base"]);
        fx.command_plugin("orphan", "orphan-cmd", &["ghost"]);
        let mut mgr = fx.manager();
        for p in ["child", "base", "orphan"] {
            mgr.install(p).unwrap();
        }

        let rt = PluginRuntime::default();
        let failures = mgr.activate_all(&rt);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, "orphan");
        assert!(matches!(failures[0].1, PluginError::MissingDependency { .. }));

        let result = rt
            .commands
            .execute_command("child-cmd", &CommandInvocation::default())
            .await;
        assert_eq!(result.output, Some(json!("child-cmd")));
        assert!(rt.registry.read().is_active("base"));
    }

    #[test]
    fn dependency_cycles_are_reported() {
        let fx = Fixture::new();
        fx.command_plugin("a", "a-cmd", &["b"]);
        fx.command_plugin("b", "b-cmd", &["a"]);
        fx.command_plugin("solo", "solo-cmd", &[]);
        let mut mgr = fx.manager();
        for p in ["a", "b", "solo"] {
            mgr.install(p).unwrap();
        }
        let rt = PluginRuntime::default();
        let failures = mgr.activate_all(&rt);
        let names: Vec<&str> = failures.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names.len(), 2);
        assert!(names.contains(&"a") && names.contains(&"b"));
        assert!(failures
            .iter()
            .all(|(_, e)| matches!(e, PluginError::DependencyCycle(_))));
        assert!(rt.commands.has_command("solo-cmd"));
    }

    #[test]
    fn disable_deactivates_and_enable_reactivates() {
        let fx = Fixture::new();
        fx.command_plugin("kit", "kit-cmd", &[]);
        let mut mgr = fx.manager();
        mgr.install("kit").unwrap();
        let rt = PluginRuntime::default();
        assert!(mgr.activate_all(&rt).is_empty());

        mgr.disable("kit", &rt).unwrap();
        assert!(!rt.commands.has_command("kit-cmd"));
        assert!(!fx.manager().info("kit").unwrap().is_enabled());
        assert!(mgr.activate_all(&rt).is_empty());
        assert!(!rt.commands.has_command("kit-cmd"));

        mgr.enable("kit", &rt).unwrap();
        assert!(rt.commands.has_command("kit-cmd"));
    }

    #[test]
    fn disable_deactivates_dependents_in_the_same_runtime() {
        let fx = Fixture::new();
        fx.command_plugin("base", "base-cmd", &[]);
        fx.command_plugin("child", "child-cmd", &["base"]);
        fx.command_plugin("grandchild", "grandchild-cmd", &["child"]);
        fx.command_plugin("other", "other-cmd", &[]);
        let mut mgr = fx.manager();
        for p in ["base", "child", "grandchild", "other"] {
            mgr.install(p).unwrap();
        }
        let rt = PluginRuntime::default();
        assert!(mgr.activate_all(&rt).is_empty());

        mgr.disable("base", &rt).unwrap();
        for cmd in ["base-cmd", "child-cmd", "grandchild-cmd"] {
            assert!(!rt.commands.has_command(cmd), "{cmd} still registered");
        }
        assert!(rt.commands.has_command("other-cmd"));
        assert!(mgr.info("child").unwrap().is_enabled());

        let failures = mgr.activate_all(&PluginRuntime::default());
        let names: Vec<&str> = failures.iter().map(|(n, _)| n.as_str()).collect();
        assert!(names.contains(&"child") && names.contains(&"grandchild"));
    }

    #[test]
    fn enable_without_active_dependency_stays_disabled() {
        let fx = Fixture::new();
        fx.command_plugin("base", "base-cmd", &[]);
        fx.command_plugin("child", "child-cmd", &["base"]);
        let mut mgr = fx.manager();
        mgr.install("base").unwrap();
        mgr.install("child").unwrap();
        let rt = PluginRuntime::default();
        mgr.disable("base", &rt).unwrap();
        mgr.disable("child", &rt).unwrap();

        assert!(mgr.enable("child", &rt).is_err());
        assert!(!mgr.info("child").unwrap().is_enabled());
    }

    #[test]
    fn uninstall_removes_files_and_registrations() {
        let fx = Fixture::new();
        fx.command_plugin("kit", "kit-cmd", &[]);
        let mut mgr = fx.manager();
        mgr.install("kit").unwrap();
        let rt = PluginRuntime::default();
        mgr.activate_all(&rt);

        mgr.uninstall("kit", &rt).unwrap();
        assert!(!rt.commands.has_command("kit-cmd"));
        assert!(!paths::plugin_dir(fx.project.path(), "kit").exists());
        assert!(fx.manager().list().is_empty());
        assert!(mgr.uninstall("kit", &rt).is_err());
    }

    #[tokio::test]
    async fn update_reloads_from_source() {
        let fx = Fixture::new();
        let src = fx.command_plugin("kit", "kit-cmd", &[]);
        let mut mgr = fx.manager();
        mgr.install("kit").unwrap();
        let rt = PluginRuntime::default();
        mgr.activate_all(&rt);

        std::fs::write(
            src.join("contributions.json"),
            json!({"commands": [{"name": "kit-cmd", "run": "echo v2"}]}).to_string(),
        )
        .unwrap();
        mgr.update("kit", &rt).unwrap();

        let result = rt
            .commands
            .execute_command("kit-cmd", &CommandInvocation::default())
            .await;
        assert_eq!(result.output, Some(json!("v2")));
    }

    #[test]
    fn config_get_set_validates_against_schema() {
        let fx = Fixture::new();
        fx.command_plugin("kit", "kit-cmd", &[]);
        let mut mgr = fx.manager();
        mgr.install("kit").unwrap();

        mgr.config_set("kit", "greeting", json!("hola")).unwrap();
        assert_eq!(mgr.config_get("kit", Some("greeting")).unwrap(), json!("hola"));
        assert!(mgr.config_set("kit", "greeting", json!(3)).is_err());
        assert!(mgr.config_set("kit", "colour", json!("red")).is_err());
        assert_eq!(
            fx.manager().config_get("kit", None).unwrap(),
            json!({"greeting": "hola"})
        );
    }
}
