use super::registry::{qualified_template_name, SharedRegistry};
use super::{PluginError, PluginResult};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TemplateCategory {
    Stack,
    Spec,
    Steering,
}

/// Which spec document a `spec` template produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpecSubType {
    Requirements,
    Design,
    Tasks,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateRegistration {
    pub category: TemplateCategory,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub source_path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_type: Option<SpecSubType>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TemplateEntry {
    pub plugin: String,
    #[serde(flatten)]
    pub template: TemplateRegistration,
}

#[derive(Clone)]
pub struct TemplateExtension {
    registry: SharedRegistry,
}

impl TemplateExtension {
    pub fn new(registry: SharedRegistry) -> Self {
        Self { registry }
    }

    /// Register under `plugin/name`; returns the qualified name.
    pub fn register_template(
        &self,
        plugin: &str,
        registration: TemplateRegistration,
    ) -> PluginResult<String> {
        if registration.name.trim().is_empty() || registration.name.contains('/') {
            return Err(PluginError::InvalidManifest(format!(
                "plugin '{plugin}' registered template with invalid name '{}'",
                registration.name
            )));
        }
        if registration.sub_type.is_some() && registration.category != TemplateCategory::Spec {
            return Err(PluginError::InvalidManifest(format!(
                "template '{}' sets a spec sub-type outside the spec category",
                registration.name
            )));
        }

        let mut reg = self.registry.write();
        let qualified = qualified_template_name(plugin, &registration.name);
        if reg.get_template(&qualified).is_some() {
            tracing::warn!(plugin = %plugin, template = %qualified, "template registered twice");
            return Err(PluginError::NameConflict {
                kind: "template",
                name: qualified,
                owner: plugin.to_string(),
            });
        }
        Ok(reg.insert_template(plugin, registration))
    }

    pub fn get_template(&self, qualified: &str) -> Option<TemplateEntry> {
        self.registry.read().get_template(qualified).map(|o| TemplateEntry {
            plugin: o.plugin.clone(),
            template: o.registration.clone(),
        })
    }

    pub fn get_templates(&self, category: TemplateCategory) -> Vec<TemplateEntry> {
        self.registry
            .read()
            .get_templates(category)
            .into_iter()
            .map(|o| TemplateEntry {
                plugin: o.plugin.clone(),
                template: o.registration.clone(),
            })
            .collect()
    }

    /// Spec templates for one document kind.
    pub fn get_spec_templates(&self, sub_type: SpecSubType) -> Vec<TemplateEntry> {
        self.get_templates(TemplateCategory::Spec)
            .into_iter()
            .filter(|e| e.template.sub_type == Some(sub_type))
            .collect()
    }
}
