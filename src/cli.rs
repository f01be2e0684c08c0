use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "vigil",
    about = "Classification-driven service lifecycle manager",
    version
)]
pub struct Cli {
    /// Additional catalog sources (TOML or YAML), highest precedence
    /// last.
    #[arg(short, long, global = true)]
    pub config: Vec<PathBuf>,

    /// Deployment profile selecting which classifications participate.
    #[arg(short, long, global = true, default_value = "production")]
    pub profile: String,

    /// Enable debug logging.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON.
    #[arg(long, global = true)]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start services and run until interrupted.
    Start {
        /// Startup mode: essential, fast, normal, or full.
        #[arg(short, long, default_value = "normal")]
        mode: String,

        /// Exit after this many seconds instead of waiting for ctrl-c.
        #[arg(long)]
        duration_secs: Option<u64>,

        /// Total budget for the final shutdown sweep.
        #[arg(long, default_value_t = 30)]
        shutdown_timeout_secs: u64,
    },

    /// Print the engine snapshot report as JSON without starting
    /// services.
    Report,

    /// Validate the catalog and dependency graph.
    Validate,

    /// Start essential services, sample resources, and print a
    /// bottleneck audit as JSON.
    Audit {
        /// Resource samples to collect before auditing.
        #[arg(long, default_value_t = 3)]
        samples: u32,
    },

    /// Benchmark the service access path against a load profile.
    Bench {
        /// Load profile: light, moderate, heavy, or burst.
        #[arg(long, default_value = "light")]
        load: String,

        #[arg(long, default_value_t = 5)]
        duration_secs: u64,

        #[arg(long, default_value_t = 1)]
        warmup_secs: u64,
    },
}
