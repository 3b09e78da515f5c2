//! `plugin.json` parsing and validation, including the host version check.

use super::{join_points, ExtensionPoint, PluginError, PluginResult};
use crate::paths;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Component, Path};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginManifest {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub author: String,
    /// Contributions file, relative to the plugin directory.
    pub entry_point: String,
    /// Host version range, e.g. `^0.1.0` or `>=0.1.0 <1.0.0`.
    pub compatible_cli_version: String,
    pub extension_points: Vec<ExtensionPoint>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_schema: Option<serde_json::Value>,
}

impl PluginManifest {
    pub fn from_json(content: &str) -> PluginResult<Self> {
        serde_json::from_str(content).map_err(|e| PluginError::InvalidManifest(e.to_string()))
    }

    /// Read `plugin.json` from a plugin directory.
    pub fn from_dir(dir: &Path) -> PluginResult<Self> {
        let path = dir.join(paths::PLUGIN_MANIFEST_FILE);
        if !path.exists() {
            return Err(PluginError::InvalidManifest(format!(
                "{} not found in {}",
                paths::PLUGIN_MANIFEST_FILE,
                dir.display()
            )));
        }
        Self::from_json(&std::fs::read_to_string(path)?)
    }

    pub fn validate(&self) -> PluginResult<()> {
        let invalid = |msg: String| Err(PluginError::InvalidManifest(msg));

        if !paths::is_valid_slug(&self.name) {
            return invalid(format!(
                "plugin name '{}' must be lowercase alphanumeric with hyphens",
                self.name
            ));
        }
        if Version::parse(&self.version).is_none() {
            return invalid(format!(
                "version '{}' must be in semver format (e.g., 1.0.0)",
                self.version
            ));
        }
        if VersionReq::parse(&self.compatible_cli_version).is_none() {
            return invalid(format!(
                "compatibleCliVersion '{}' is not a valid version range",
                self.compatible_cli_version
            ));
        }

        let entry = Path::new(&self.entry_point);
        if self.entry_point.trim().is_empty()
            || entry.is_absolute()
            || entry.components().any(|c| matches!(c, Component::ParentDir))
        {
            return invalid(format!(
                "entryPoint '{}' must be a relative path inside the plugin",
                self.entry_point
            ));
        }

        if self.extension_points.is_empty() {
            return invalid("extensionPoints must list at least one extension point".into());
        }
        let unique: BTreeSet<_> = self.extension_points.iter().collect();
        if unique.len() != self.extension_points.len() {
            return invalid("extensionPoints contains duplicates".into());
        }

        if self.dependencies.iter().any(|d| d == &self.name) {
            return invalid(format!("plugin '{}' depends on itself", self.name));
        }

        if let Some(schema) = &self.config_schema {
            let props_ok = schema
                .get("properties")
                .map_or(true, serde_json::Value::is_object);
            if !schema.is_object() || !props_ok {
                return invalid("configSchema must be an object with object 'properties'".into());
            }
        }

        Ok(())
    }

    pub fn check_host(&self, host_version: &str) -> PluginResult<()> {
        let compatible = match (
            VersionReq::parse(&self.compatible_cli_version),
            Version::parse(host_version),
        ) {
            (Some(req), Some(host)) => req.matches(&host),
            _ => false,
        };
        if compatible {
            Ok(())
        } else {
            Err(PluginError::IncompatibleVersion {
                name: self.name.clone(),
                required: self.compatible_cli_version.clone(),
                available: host_version.to_string(),
            })
        }
    }

    /// What the plugin registered must equal what it declared.
    pub fn check_extension_points(&self, used: &BTreeSet<ExtensionPoint>) -> PluginResult<()> {
        let declared: BTreeSet<ExtensionPoint> = self.extension_points.iter().copied().collect();
        if &declared == used {
            return Ok(());
        }
        Err(PluginError::ExtensionPointMismatch {
            name: self.name.clone(),
            declared: join_points(&declared),
            used: join_points(used),
        })
    }

    /// Check `value` for `key` against `configSchema.properties`. Plugins
    /// without a schema accept any key.
    pub fn validate_config_value(&self, key: &str, value: &serde_json::Value) -> PluginResult<()> {
        let Some(props) = self
            .config_schema
            .as_ref()
            .and_then(|s| s.get("properties"))
            .and_then(serde_json::Value::as_object)
        else {
            return Ok(());
        };

        let Some(prop) = props.get(key) else {
            return Err(PluginError::UnknownConfigKey {
                plugin: self.name.clone(),
                key: key.to_string(),
            });
        };

        if let Some(expected) = prop.get("type").and_then(serde_json::Value::as_str) {
            let ok = match expected {
                "string" => value.is_string(),
                "number" => value.is_number(),
                "integer" => value.is_i64() || value.is_u64(),
                "boolean" => value.is_boolean(),
                "object" => value.is_object(),
                "array" => value.is_array(),
                _ => true,
            };
            if !ok {
                return Err(PluginError::InvalidConfig {
                    plugin: self.name.clone(),
                    key: key.to_string(),
                    message: format!("expected {expected}, got {value}"),
                });
            }
        }

        if let Some(choices) = prop.get("enum").and_then(serde_json::Value::as_array) {
            if !choices.contains(value) {
                return Err(PluginError::InvalidConfig {
                    plugin: self.name.clone(),
                    key: key.to_string(),
                    message: format!(
                        "must be one of {}",
                        serde_json::Value::Array(choices.clone())
                    ),
                });
            }
        }
        Ok(())
    }

    /// Defaults declared in `configSchema.properties.*.default`.
    pub fn config_defaults(&self) -> serde_json::Map<String, serde_json::Value> {
        self.config_schema
            .as_ref()
            .and_then(|s| s.get("properties"))
            .and_then(serde_json::Value::as_object)
            .map(|props| {
                props
                    .iter()
                    .filter_map(|(k, p)| p.get("default").map(|d| (k.clone(), d.clone())))
                    .collect()
            })
            .unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// Versions
// ---------------------------------------------------------------------------

/// `major.minor.patch`; missing parts are zero, pre-release and build
/// suffixes are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl Version {
    pub fn parse(s: &str) -> Option<Self> {
        let core = s.trim().trim_start_matches('v');
        let core = core.split(&['-', '+'][..]).next()?;
        let mut parts = core.split('.');
        let major = parts.next()?.parse().ok()?;
        let minor = parts.next().map_or(Some(0), |p| p.parse().ok())?;
        let patch = parts.next().map_or(Some(0), |p| p.parse().ok())?;
        if parts.next().is_some() {
            return None;
        }
        Some(Self { major, minor, patch })
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Exact,
    Gt,
    Gte,
    Lt,
    Lte,
    Caret,
    Tilde,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Comparator {
    op: Op,
    version: Version,
}

impl Comparator {
    fn parse(s: &str) -> Option<Self> {
        let (op, rest) = [
            (">=", Op::Gte),
            ("<=", Op::Lte),
            (">", Op::Gt),
            ("<", Op::Lt),
            ("=", Op::Exact),
            ("^", Op::Caret),
            ("~", Op::Tilde),
        ]
        .iter()
        .find_map(|(prefix, op)| s.strip_prefix(*prefix).map(|r| (*op, r)))
        .unwrap_or((Op::Exact, s));
        Some(Self {
            op,
            version: Version::parse(rest)?,
        })
    }

    fn matches(&self, v: &Version) -> bool {
        let base = self.version;
        let cmp = v.cmp(&base);
        match self.op {
            Op::Exact => cmp == Ordering::Equal,
            Op::Gt => cmp == Ordering::Greater,
            Op::Gte => cmp != Ordering::Less,
            Op::Lt => cmp == Ordering::Less,
            Op::Lte => cmp != Ordering::Greater,
            Op::Tilde => {
                cmp != Ordering::Less
                    && *v
                        < Version {
                            major: base.major,
                            minor: base.minor + 1,
                            patch: 0,
                        }
            }
            Op::Caret => {
                let upper = if base.major > 0 {
                    Version {
                        major: base.major + 1,
                        minor: 0,
                        patch: 0,
                    }
                } else if base.minor > 0 {
                    Version {
                        major: 0,
                        minor: base.minor + 1,
                        patch: 0,
                    }
                } else {
                    Version {
                        major: 0,
                        minor: 0,
                        patch: base.patch + 1,
                    }
                };
                cmp != Ordering::Less && *v < upper
            }
        }
    }
}

/// A version range: `||`-separated alternatives of space-separated
/// comparators. `*` (or an empty string) matches everything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionReq {
    alternatives: Vec<Vec<Comparator>>,
}

impl VersionReq {
    pub fn parse(s: &str) -> Option<Self> {
        let mut alternatives = Vec::new();
        for alt in s.split("||") {
            let mut set = Vec::new();
            for token in alt.split_whitespace() {
                if matches!(token, "*" | "x" | "X") {
                    continue;
                }
                set.push(Comparator::parse(token)?);
            }
            alternatives.push(set);
        }
        Some(Self { alternatives })
    }

    pub fn matches(&self, v: &Version) -> bool {
        self.alternatives
            .iter()
            .any(|set| set.iter().all(|c| c.matches(v)))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
