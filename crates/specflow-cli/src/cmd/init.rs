use crate::output::print_json;
use anyhow::Context;
use specflow_core::{config::Config, io, paths};
use std::path::Path;

pub fn run(root: &Path, json: bool) -> anyhow::Result<()> {
    let project_name = root
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "project".to_string());

    for dir in [paths::SPECFLOW_DIR, paths::FLOWS_DIR, paths::PLUGINS_DIR] {
        let p = root.join(dir);
        io::ensure_dir(&p).with_context(|| format!("failed to create {}", p.display()))?;
    }

    let created = !paths::config_path(root).exists();
    if created {
        Config::new(&project_name)
            .save(root)
            .context("failed to write config.yaml")?;
    }

    if json {
        print_json(&serde_json::json!({
            "root": root.display().to_string(),
            "project": project_name,
            "configCreated": created,
        }))?;
    } else {
        println!("Initialized specflow in: {}", root.display());
        if created {
            println!("  created: {}", paths::CONFIG_FILE);
        } else {
            println!("  exists:  {}", paths::CONFIG_FILE);
        }
    }
    Ok(())
}
