use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "gdefs")]
#[command(about = "Global definition index. Search code symbols across every repository.")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Output as JSON
    #[arg(long, global = true)]
    pub json: bool,

    /// Config file (default: ./gdefs.toml if present)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Actor name used for access checks
    #[arg(long, global = true, default_value = "local")]
    pub actor: String,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Re-index repositories at their current HEAD
    Update {
        /// Repositories to update
        #[arg(required_unless_present = "all", conflicts_with = "all")]
        repos: Vec<String>,

        /// Update every repository found in the graph directory
        #[arg(long)]
        all: bool,
    },

    /// Ranked search over indexed definitions
    Search {
        /// Query tokens; the last one is matched against symbol names
        #[arg(required = true)]
        tokens: Vec<String>,

        /// Restrict to one repository
        #[arg(long)]
        repo: Option<String>,

        /// Restrict to one source unit
        #[arg(long)]
        unit: Option<String>,

        /// Restrict to one unit type (case-insensitive)
        #[arg(long)]
        unit_type: Option<String>,

        /// Maximum results to return (default from config, max: 100)
        #[arg(long)]
        limit: Option<u32>,
    },

    /// Recompute reference counts from global_refs (admin only)
    RefreshRefs {
        /// Repositories whose definitions get fresh counts
        #[arg(required = true)]
        repos: Vec<String>,
    },

    /// List the indexed definitions of a repository
    Defs {
        /// Repository name
        repo: String,
    },

    /// Index statistics summary
    Stats,

    /// Poll repositories and re-index them when HEAD moves
    Watch {
        /// Repositories to watch (default: watch.repos from config)
        repos: Vec<String>,

        /// Poll interval in seconds (default from config)
        #[arg(long)]
        interval: Option<u64>,
    },

    /// Start MCP server over stdio
    Serve,
}
