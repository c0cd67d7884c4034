use clap::{Args, Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "keel")]
#[command(author = "Alberto Cavalcante")]
#[command(version)]
#[command(about = "Declarative, dependency-aware provisioning", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Declaration file (TOML or JSON)
    #[arg(short, long, global = true, env = "KEEL_FILE", default_value = "keel.toml")]
    pub file: PathBuf,

    /// State file (defaults to ~/.local/state/keel/<name>.json)
    #[arg(long, global = true, env = "KEEL_STATE")]
    pub state: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Check the declaration: names, references, cycles, providers
    Validate,

    /// Show the dependency graph as provisioning levels
    Graph,

    /// Preview what apply would change
    Plan,

    /// Converge resources to the declaration
    Apply(ApplyArgs),

    /// Delete every resource recorded in state
    Destroy(DestroyArgs),

    /// Show exported values from the last apply
    Outputs(OutputsArgs),

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Args)]
pub struct ApplyArgs {
    /// Skip the confirmation prompt
    #[arg(short, long)]
    pub yes: bool,

    /// Number of concurrent provider calls
    #[arg(short, long)]
    pub jobs: Option<usize>,

    /// Attempts per provider call before a transient error fails the node
    #[arg(long)]
    pub max_attempts: Option<u32>,

    /// Delete resources whose create failed
    #[arg(long)]
    pub rollback: bool,

    /// Keep resources that are in state but no longer declared
    #[arg(long)]
    pub no_prune: bool,
}

#[derive(Args)]
pub struct DestroyArgs {
    /// Skip the confirmation prompt
    #[arg(short, long)]
    pub yes: bool,

    /// Number of concurrent provider calls
    #[arg(short, long)]
    pub jobs: Option<usize>,
}

#[derive(Args)]
pub struct OutputsArgs {
    /// Print a single export
    pub name: Option<String>,

    /// Print as JSON
    #[arg(long)]
    pub json: bool,
}
