use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "nlm-lockd")]
#[command(about = "Network Lock Manager server core", long_about = None)]
pub struct Cli {
    /// Output results in JSON format
    #[arg(long, global = true)]
    pub json: bool,

    /// Enable debug logging (RUST_LOG still takes precedence)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show the per-procedure dispatch policy
    Policy,

    /// Print a configuration preset or write it to a file
    Config {
        /// Preset: production, development or testing
        #[arg(short, long, default_value = "production")]
        preset: String,

        /// Write to this file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Validate a configuration file
    CheckConfig {
        /// Configuration file (JSON)
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Run scripted client scenarios against an in-process server
    Simulate {
        /// Scenario name or letter (a-d), or "all"
        #[arg(short, long, default_value = "all")]
        scenario: String,

        /// Preset to run with when no config file is given
        #[arg(short, long, default_value = "testing")]
        preset: String,

        /// Configuration file (JSON)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Include diagnostics trace in the output
        #[arg(long, default_value_t = false)]
        trace: bool,
    },
}
