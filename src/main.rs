mod cli;
mod service;

use audrey::config::Config;
use audrey::observability::init_tracing;
use clap::Parser;
use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let cli = Cli::parse();

    let log_level = match &cli.command {
        Commands::Run(args) => args.log_level.as_str(),
        _ => "warn",
    };
    init_tracing(log_level);

    let config = match cli.config {
        Some(path) => Config::load_from_path(path)?,
        None => Config::load()?,
    };

    match cli.command {
        Commands::Run(_) => service::run(config).await?,
        Commands::AddFeed(args) => service::add_feed(&config, &args.name, &args.url)?,
        Commands::Config => print!("{}", config.to_toml()?),
    }

    Ok(())
}
