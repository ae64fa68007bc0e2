// rewind CLI entry point.

use std::path::PathBuf;

use clap::Parser;

mod commands;
mod output;

#[derive(Parser)]
#[command(name = "rewind", about = "Inspect and navigate checkpointed agent edits")]
struct Cli {
    /// Config file to use instead of ~/.rewind/config.toml
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: commands::Command,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = commands::load_config(cli.config.as_deref())?;
    commands::run(cli.command, config)
}
