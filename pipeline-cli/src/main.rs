// Pipeline Run CLI
// Validate and simulate pipeline documents from the terminal

mod commands;
mod loader;
mod output;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "pipeline-run", version, about = "Validate and simulate Tekton-style pipelines")]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Check a pipeline document without running it
    Validate(commands::validate::ValidateArgs),

    /// Run a pipeline document against a scripted executor
    Simulate(commands::simulate::SimulateArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();

    let default_level = match cli.verbose {
        0 => "warn",
        1 => "pipeline_engine=info,warn",
        _ => "pipeline_engine=debug,info",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let code = match cli.command {
        Commands::Validate(args) => commands::validate::execute(args)?,
        Commands::Simulate(args) => commands::simulate::execute(args).await?,
    };
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
