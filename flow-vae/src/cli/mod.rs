pub mod forward;

use clap::{Parser, Subcommand};

pub use forward::ForwardArgs;

#[derive(Parser)]
#[command(name = "flow-vae")]
#[command(about = "Flow-augmented variational autoencoder on candle")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run one forward pass of a freshly initialized model on synthetic data
    Forward(ForwardArgs),
}
