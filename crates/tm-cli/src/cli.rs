//! CLI argument definitions using clap derive API

use clap::{Args, Parser, Subcommand, ValueEnum};

/// Tidemark - versioned up/down SQL migrations
#[derive(Parser, Debug)]
#[command(name = "tm")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Global options
    #[command(flatten)]
    pub global: GlobalArgs,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Global arguments available to all commands
#[derive(Args, Debug, Clone)]
pub struct GlobalArgs {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to project directory
    #[arg(short = 'p', long, global = true, default_value = ".")]
    pub project_dir: String,

    /// Override config file path
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Override database path (":memory:" for a throwaway database)
    #[arg(short, long, global = true)]
    pub database: Option<String>,

    /// Override the migrations directory
    #[arg(long, global = true, env = "MIGRATIONS_PATH")]
    pub migrations_path: Option<String>,

    /// Override the per-step deadline in seconds (0 disables it)
    #[arg(long, global = true)]
    pub timeout: Option<u64>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Apply pending migrations
    Up(UpArgs),

    /// Revert the latest migration, or all of them
    Down(DownArgs),

    /// Print the current schema version and dirty flag
    Version,

    /// Set the schema version without running scripts
    Force(ForceArgs),

    /// Check migration files against the applied history
    Validate,

    /// Create a new empty up/down migration pair
    Create(CreateArgs),

    /// List migrations with their applied state
    Status(StatusArgs),
}

/// Arguments for the up command
#[derive(Args, Debug)]
pub struct UpArgs {
    /// Apply at most N migrations (0 applies all; defaults to migrations.steps)
    #[arg(short = 'n', long)]
    pub steps: Option<usize>,
}

/// Arguments for the down command
#[derive(Args, Debug)]
pub struct DownArgs {
    /// Revert every applied migration
    #[arg(short, long)]
    pub all: bool,
}

/// Arguments for the force command
#[derive(Args, Debug)]
pub struct ForceArgs {
    /// Version to record as cleanly applied (0 means nothing applied)
    pub version: u64,
}

/// Arguments for the create command
#[derive(Args, Debug)]
pub struct CreateArgs {
    /// Descriptive name, normalized to snake_case
    pub name: String,

    /// Number the migration sequentially instead of by timestamp
    #[arg(long)]
    pub seq: bool,
}

/// Arguments for the status command
#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Output format
    #[arg(short, long, value_enum, default_value = "table")]
    pub output: StatusOutput,
}

/// Status output formats
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusOutput {
    /// Table format
    Table,
    /// JSON output
    Json,
}

#[cfg(test)]
#[path = "cli_test.rs"]
mod tests;
