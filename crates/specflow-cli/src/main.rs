mod collab;
mod cmd;
mod output;
mod root;

use clap::{Parser, Subcommand};
use cmd::{config::ConfigSubcommand, flow::Decision, plugin::PluginSubcommand};
use specflow_core::types::WorkflowMode;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "specflow",
    about = "Spec-driven development workflow: requirements, design, tasks, implementation",
    version,
    propagate_version = true
)]
struct Cli {
    /// Project root (default: auto-detect from .specflow/ or .git/)
    #[arg(long, global = true, env = "SPECFLOW_ROOT")]
    root: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize specflow in the current project
    Init,

    /// Start a new feature flow
    Start {
        feature: String,
        /// What the feature should do
        #[arg(long, short = 'd')]
        description: String,
        /// greenfield or brownfield (default from config)
        #[arg(long)]
        mode: Option<WorkflowMode>,
        /// Agent configuration tier
        #[arg(long)]
        tier: Option<String>,
    },

    /// Show a flow's phase, history and recovery options
    Status { feature: String },

    /// List all flows
    List,

    /// Approve the artifact under review
    Approve { feature: String },

    /// Reject the artifact under review and regenerate it
    Reject { feature: String },

    /// Pause implementation at the current task
    Pause { feature: String },

    /// Resume a paused flow, or retry the phase that failed
    Resume { feature: String },

    /// Abort a flow
    Abort {
        feature: String,
        #[arg(long, default_value = "aborted by user")]
        reason: String,
    },

    /// Perform the current phase's work once
    Advance {
        feature: String,
        /// Continue at every checkpoint without asking
        #[arg(long, short = 'y')]
        yes: bool,
    },

    /// Advance until a decision is needed or the flow stops
    Run {
        feature: String,
        /// Continue at every checkpoint without asking
        #[arg(long, short = 'y')]
        yes: bool,
    },

    /// Record the merge decision
    Merge {
        feature: String,
        /// Finish without merging
        #[arg(long)]
        skip: bool,
    },

    /// Manage plugins
    Plugin {
        #[command(subcommand)]
        subcommand: PluginSubcommand,
    },

    /// Show or validate the project configuration
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },

    /// Commands contributed by plugins
    #[command(external_subcommand)]
    External(Vec<String>),
}

fn main() {
    let cli = Cli::parse();

    let default_level = match &cli.command {
        Commands::Advance { .. } | Commands::Run { .. } => tracing::Level::INFO,
        _ => tracing::Level::WARN,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let root = root::resolve_root(cli.root.as_deref());
    let json = cli.json;

    let result = match cli.command {
        Commands::Init => cmd::init::run(&root, json),
        Commands::Start {
            feature,
            description,
            mode,
            tier,
        } => cmd::flow::start(&root, &feature, &description, mode, tier, json),
        Commands::Status { feature } => cmd::flow::status(&root, &feature, json),
        Commands::List => cmd::flow::list(&root, json),
        Commands::Approve { feature } => {
            cmd::flow::decide(&root, &feature, Decision::Approve, json)
        }
        Commands::Reject { feature } => cmd::flow::decide(&root, &feature, Decision::Reject, json),
        Commands::Pause { feature } => cmd::flow::decide(&root, &feature, Decision::Pause, json),
        Commands::Resume { feature } => cmd::flow::decide(&root, &feature, Decision::Resume, json),
        Commands::Abort { feature, reason } => cmd::flow::abort(&root, &feature, &reason, json),
        Commands::Advance { feature, yes } => cmd::flow::advance(&root, &feature, yes, false, json),
        Commands::Run { feature, yes } => cmd::flow::advance(&root, &feature, yes, true, json),
        Commands::Merge { feature, skip } => cmd::flow::merge(&root, &feature, skip, json),
        Commands::Plugin { subcommand } => cmd::plugin::run(&root, subcommand, json),
        Commands::Config { subcommand } => cmd::config::run(&root, subcommand, json),
        Commands::External(args) => cmd::plugin::run_external(&root, args, json),
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
