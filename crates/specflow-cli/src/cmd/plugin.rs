use crate::collab;
use crate::output::{print_json, print_table};
use anyhow::Context;
use clap::Subcommand;
use regex::Regex;
use specflow_core::{
    config::Config,
    plugin::{CommandInvocation, InstalledPlugin, PluginManager, PluginRuntime},
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

// ---------------------------------------------------------------------------
// Subcommand types
// ---------------------------------------------------------------------------

#[derive(Subcommand)]
pub enum PluginSubcommand {
    /// Install a plugin from a directory or the local registry
    Install {
        /// Plugin directory, or a name in plugins.registry_dir
        source: String,
    },

    /// Remove an installed plugin
    Uninstall { name: String },

    /// Enable and activate a plugin
    Enable { name: String },

    /// Disable a plugin without removing it
    Disable { name: String },

    /// Reload a plugin from its install source
    Update { name: String },

    /// List installed plugins
    List,

    /// Show a plugin's manifest and state
    Info { name: String },

    /// Check a plugin directory without installing it
    Validate { path: PathBuf },

    /// List commands and agents contributed by active plugins
    Commands,

    /// Read or write plugin configuration
    Config {
        #[command(subcommand)]
        subcommand: PluginConfigSubcommand,
    },
}

#[derive(Subcommand)]
pub enum PluginConfigSubcommand {
    /// Print one key, or the whole config
    Get { name: String, key: Option<String> },

    /// Set a key; the value is parsed as JSON, falling back to a string
    Set {
        name: String,
        key: String,
        value: String,
    },
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub fn run(root: &Path, subcmd: PluginSubcommand, json: bool) -> anyhow::Result<()> {
    // Validation works outside an initialized project.
    if let PluginSubcommand::Validate { path } = &subcmd {
        return validate(path, json);
    }

    let config = Config::load(root).context("failed to load config")?;
    let (mut manager, runtime) = collab::plugin_runtime(root, &config)?;

    match subcmd {
        PluginSubcommand::Install { source } => {
            let entry = manager.install(&source)?;
            // Activation failures surface on the next run; install already validated.
            if let Err(e) = manager.enable(&entry.manifest.name, &runtime) {
                tracing::warn!(plugin = %entry.manifest.name, error = %e, "installed but not activated");
            }
            report(&entry, "Installed", json)
        }
        PluginSubcommand::Uninstall { name } => {
            manager.uninstall(&name, &runtime)?;
            done(&name, "uninstalled", json)
        }
        PluginSubcommand::Enable { name } => {
            manager.enable(&name, &runtime)?;
            done(&name, "enabled", json)
        }
        PluginSubcommand::Disable { name } => {
            manager.disable(&name, &runtime)?;
            done(&name, "disabled", json)
        }
        PluginSubcommand::Update { name } => {
            let entry = manager.update(&name, &runtime)?;
            report(&entry, "Updated", json)
        }
        PluginSubcommand::List => list(&manager, json),
        PluginSubcommand::Info { name } => info(manager.info(&name)?, json),
        PluginSubcommand::Commands => commands(&runtime, json),
        PluginSubcommand::Config { subcommand } => run_config(&mut manager, subcommand, json),
        PluginSubcommand::Validate { path } => validate(&path, json),
    }
}

fn done(name: &str, what: &str, json: bool) -> anyhow::Result<()> {
    if json {
        print_json(&serde_json::json!({ "plugin": name, "status": what }))
    } else {
        println!("Plugin '{name}' {what}.");
        Ok(())
    }
}

fn report(entry: &InstalledPlugin, verb: &str, json: bool) -> anyhow::Result<()> {
    if json {
        return print_json(entry);
    }
    println!("{verb} {} {}", entry.manifest.name, entry.manifest.version);
    Ok(())
}

fn validate(path: &Path, json: bool) -> anyhow::Result<()> {
    let manifest = PluginManager::validate(path)?;
    if json {
        print_json(&serde_json::json!({ "valid": true, "manifest": manifest }))
    } else {
        println!("Plugin '{}' {} is valid.", manifest.name, manifest.version);
        Ok(())
    }
}

fn points(entry: &InstalledPlugin) -> String {
    entry
        .manifest
        .extension_points
        .iter()
        .map(|p| p.as_str())
        .collect::<Vec<_>>()
        .join(",")
}

fn list(manager: &PluginManager, json: bool) -> anyhow::Result<()> {
    let plugins = manager.list();
    if json {
        return print_json(&plugins);
    }
    if plugins.is_empty() {
        println!("No plugins installed.");
        return Ok(());
    }
    let rows = plugins
        .iter()
        .map(|p| {
            vec![
                p.manifest.name.clone(),
                p.manifest.version.clone(),
                if p.is_enabled() { "enabled" } else { "disabled" }.to_string(),
                points(p),
            ]
        })
        .collect();
    print_table(&["NAME", "VERSION", "STATE", "EXTENSION POINTS"], rows);
    Ok(())
}

fn info(entry: &InstalledPlugin, json: bool) -> anyhow::Result<()> {
    if json {
        return print_json(entry);
    }
    let m = &entry.manifest;
    println!("Name:        {}", m.name);
    println!("Version:     {}", m.version);
    if !m.description.is_empty() {
        println!("Description: {}", m.description);
    }
    if !m.author.is_empty() {
        println!("Author:      {}", m.author);
    }
    println!("State:       {}", if entry.is_enabled() { "enabled" } else { "disabled" });
    println!("Requires:    specflow {}", m.compatible_cli_version);
    println!("Provides:    {}", points(entry));
    if !m.dependencies.is_empty() {
        println!("Depends on:  {}", m.dependencies.join(", "));
    }
    println!("Source:      {}", entry.source.display());
    println!("Installed:   {}", entry.installed_at.format("%Y-%m-%d %H:%M"));
    Ok(())
}

fn commands(runtime: &PluginRuntime, json: bool) -> anyhow::Result<()> {
    let commands = runtime.commands.list_commands();
    let agents = runtime.agents.list_agents();
    if json {
        return print_json(&serde_json::json!({ "commands": commands, "agents": agents }));
    }
    if commands.is_empty() && agents.is_empty() {
        println!("No plugin commands or agents registered.");
        return Ok(());
    }
    let mut rows: Vec<Vec<String>> = commands
        .into_iter()
        .map(|c| vec!["command".into(), c.name, c.plugin, c.description])
        .collect();
    rows.extend(
        agents
            .into_iter()
            .map(|a| vec!["agent".into(), a.name, a.plugin, a.description]),
    );
    print_table(&["KIND", "NAME", "PLUGIN", "DESCRIPTION"], rows);
    Ok(())
}

fn run_config(
    manager: &mut PluginManager,
    subcmd: PluginConfigSubcommand,
    json: bool,
) -> anyhow::Result<()> {
    match subcmd {
        PluginConfigSubcommand::Get { name, key } => {
            let value = manager.config_get(&name, key.as_deref())?;
            match (&value, json) {
                (serde_json::Value::String(s), false) => println!("{s}"),
                _ => print_json(&value)?,
            }
            Ok(())
        }
        PluginConfigSubcommand::Set { name, key, value } => {
            let parsed = serde_json::from_str(&value).unwrap_or(serde_json::Value::String(value));
            manager.config_set(&name, &key, parsed)?;
            done(&name, "configured", json)
        }
    }
}

// ---------------------------------------------------------------------------
// Plugin-contributed commands
// ---------------------------------------------------------------------------

static OPTION_RE: OnceLock<Regex> = OnceLock::new();

fn option_re() -> &'static Regex {
    OPTION_RE.get_or_init(|| {
        Regex::new(r"^--([a-z0-9][a-z0-9\-]*)(?:=(.*))?$").expect("valid regex")
    })
}

/// `--key=value` and bare `--flag` become options; everything else is a
/// positional argument.
fn invocation(args: &[String], cwd: PathBuf) -> CommandInvocation {
    let mut options = BTreeMap::new();
    let mut positional = Vec::new();
    for arg in args {
        match option_re().captures(arg) {
            Some(caps) => {
                let value = caps.get(2).map_or("true", |m| m.as_str());
                options.insert(caps[1].to_string(), value.to_string());
            }
            None => positional.push(arg.clone()),
        }
    }
    CommandInvocation {
        args: positional,
        options,
        cwd: Some(cwd),
    }
}

pub fn run_external(root: &Path, args: Vec<String>, json: bool) -> anyhow::Result<()> {
    let Some((name, rest)) = args.split_first() else {
        anyhow::bail!("no command given");
    };
    let config = Config::load(root).context("failed to load config")?;
    let (_, runtime) = collab::plugin_runtime(root, &config)?;
    if !runtime.commands.has_command(name) {
        anyhow::bail!(
            "unknown command '{name}'. Run 'specflow --help' or 'specflow plugin commands'"
        );
    }

    let cwd = std::env::current_dir().unwrap_or_else(|_| root.to_path_buf());
    let inv = invocation(rest, cwd);
    let rt = tokio::runtime::Runtime::new().context("failed to start async runtime")?;
    let result = rt.block_on(runtime.commands.execute_command(name, &inv));

    if json {
        print_json(&result)?;
    } else if let Some(output) = &result.output {
        match output {
            serde_json::Value::String(s) => println!("{s}"),
            serde_json::Value::Null => {}
            other => print_json(other)?,
        }
    }
    if !result.success {
        anyhow::bail!(
            "{}",
            result.error.unwrap_or_else(|| format!("command '{name}' failed"))
        );
    }
    Ok(())
}
