use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "audrey")]
#[command(about = "Feed to disc: download new podcast episodes and burn them to CD", long_about = None)]
pub struct Cli {
    /// Configuration file (defaults to $AUDREY_CONFIG or config/audrey.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the pipeline and report drive status until interrupted
    Run(RunArgs),

    /// Register a feed endpoint in the working directory
    AddFeed(AddFeedArgs),

    /// Print the effective configuration as TOML
    Config,
}

#[derive(clap::Args, Debug)]
pub struct RunArgs {
    /// Default tracing filter when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

#[derive(clap::Args, Debug)]
pub struct AddFeedArgs {
    /// Endpoint name, used in queue file names
    pub name: String,

    /// Feed URL
    pub url: String,
}
