use anyhow::Result;
use clap::Parser;
use flow_vae::cli::{forward, Cli, Commands};

fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Forward(args) => {
            forward::run(args)?;
        }
    }

    Ok(())
}
