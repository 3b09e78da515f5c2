use crate::error::{FlowError, Result};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

// ---------------------------------------------------------------------------
// Directory constants
// ---------------------------------------------------------------------------

pub const SPECFLOW_DIR: &str = ".specflow";
pub const FLOWS_DIR: &str = ".specflow/flows";
pub const PLUGINS_DIR: &str = ".specflow/plugins";

pub const CONFIG_FILE: &str = ".specflow/config.yaml";
pub const PLUGIN_INDEX_FILE: &str = ".specflow/plugins/plugins.json";

pub const FLOW_STATE_FILE: &str = "flow-state.json";
pub const TASKS_FILE: &str = "tasks.md";
pub const PLUGIN_MANIFEST_FILE: &str = "plugin.json";

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

pub fn config_path(root: &Path) -> PathBuf {
    root.join(CONFIG_FILE)
}

pub fn flow_dir(root: &Path, feature: &str) -> PathBuf {
    root.join(FLOWS_DIR).join(feature)
}

pub fn flow_state_path(root: &Path, feature: &str) -> PathBuf {
    flow_dir(root, feature).join(FLOW_STATE_FILE)
}

pub fn tasks_path(root: &Path, feature: &str) -> PathBuf {
    flow_dir(root, feature).join(TASKS_FILE)
}

pub fn plugins_dir(root: &Path) -> PathBuf {
    root.join(PLUGINS_DIR)
}

pub fn plugin_dir(root: &Path, name: &str) -> PathBuf {
    plugins_dir(root).join(name)
}

pub fn plugin_index_path(root: &Path) -> PathBuf {
    root.join(PLUGIN_INDEX_FILE)
}

/// Configuration directory handed to the agent subprocess for a tier.
pub fn tier_config_dir(tier: &str) -> Result<PathBuf> {
    let home = home::home_dir().ok_or(FlowError::HomeNotFound)?;
    Ok(home.join(format!(".claude-{tier}")))
}

// ---------------------------------------------------------------------------
// Slug validation
// ---------------------------------------------------------------------------

static SLUG_RE: OnceLock<Regex> = OnceLock::new();

fn slug_re() -> &'static Regex {
    SLUG_RE.get_or_init(|| {
        Regex::new(r"^[a-z0-9][a-z0-9\-]*[a-z0-9]$|^[a-z0-9]$").expect("slug pattern is valid")
    })
}

pub fn is_valid_slug(slug: &str) -> bool {
    !slug.is_empty() && slug.len() <= 64 && slug_re().is_match(slug)
}

pub fn validate_slug(slug: &str) -> Result<()> {
    if !is_valid_slug(slug) {
        return Err(FlowError::InvalidSlug(slug.to_string()));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
