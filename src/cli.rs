use clap::{Args, Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "terrace")]
#[command(author = "Alberto Cavalcante")]
#[command(version)]
#[command(about = "Plan and apply declarative resource graphs", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// State file (overrides the config file)
    #[arg(long, global = true, env = "TERRACE_STATE")]
    pub state: Option<PathBuf>,

    /// Config file (default: ./terrace.toml, then the user config directory)
    #[arg(long, global = true, env = "TERRACE_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Build the dependency graph and report problems
    Validate {
        /// Graph document (JSON)
        graph: PathBuf,
    },

    /// Print the graph in dependency order
    Graph {
        /// Graph document (JSON)
        graph: PathBuf,

        /// Emit Graphviz DOT instead
        #[arg(long)]
        dot: bool,
    },

    /// Show what apply (or destroy) would change
    Plan(PlanArgs),

    /// Converge recorded state to the graph
    Apply(ApplyArgs),

    /// Tear down everything recorded in state
    Destroy(DestroyArgs),

    /// Re-read managed resources and record drift
    Refresh,

    /// Inspect and edit recorded state
    #[command(subcommand)]
    State(StateCommand),

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

// ============================================================================
// Plan / Apply / Destroy
// ============================================================================

#[derive(Args)]
pub struct PlanArgs {
    /// Graph document (JSON); not read for destroy plans
    #[arg(required_unless_present = "destroy")]
    pub graph: Option<PathBuf>,

    /// Limit the plan to these nodes, module prefixes or resource types
    #[arg(short, long = "target")]
    pub targets: Vec<String>,

    /// Plan a full teardown instead
    #[arg(long)]
    pub destroy: bool,

    /// Save the plan for `apply --plan`
    #[arg(short, long)]
    pub out: Option<PathBuf>,
}

#[derive(Args)]
pub struct ApplyArgs {
    /// Graph document (JSON)
    #[arg(required_unless_present = "plan")]
    pub graph: Option<PathBuf>,

    /// Apply a plan saved by `plan --out`
    #[arg(long, conflicts_with_all = ["graph", "targets"])]
    pub plan: Option<PathBuf>,

    /// Limit the run to these nodes, module prefixes or resource types
    #[arg(short, long = "target")]
    pub targets: Vec<String>,

    /// Number of parallel jobs
    #[arg(short, long)]
    pub jobs: Option<usize>,

    /// Skip confirmation prompt
    #[arg(short, long)]
    pub yes: bool,

    /// Show what would run without running it
    #[arg(long)]
    pub dry_run: bool,
}

#[derive(Args)]
pub struct DestroyArgs {
    /// Limit teardown to these nodes (and everything depending on them)
    #[arg(short, long = "target")]
    pub targets: Vec<String>,

    /// Number of parallel jobs
    #[arg(short, long)]
    pub jobs: Option<usize>,

    /// Skip confirmation prompt
    #[arg(short, long)]
    pub yes: bool,

    /// Show what would run without running it
    #[arg(long)]
    pub dry_run: bool,
}

// ============================================================================
// State Commands
// ============================================================================

#[derive(Subcommand)]
pub enum StateCommand {
    /// List recorded nodes
    List,

    /// Show one record in full
    Show {
        /// Node key
        key: String,
    },

    /// Forget a record without destroying anything
    Rm {
        /// Node key
        key: String,
    },

    /// Force the next apply to update a node
    Taint {
        /// Node key
        key: String,
    },

    /// Clear a taint
    Untaint {
        /// Node key
        key: String,
    },

    /// Remove a lock left behind by a crashed run
    Unlock,
}
