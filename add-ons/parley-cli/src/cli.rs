//! Argument parsing and logging setup.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Parley - live voice conversations with a remote agent
#[derive(Parser, Debug)]
#[command(name = "parley")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Increase logging verbosity (-v = debug, -vv = trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Config file (defaults to PARLEY_CONFIG or config/parley)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Hold a live session until Ctrl-C or the agent hangs up
    Live,
    /// Play a narration script: a JSON array of {"role", "text"} segments
    Narrate { script: PathBuf },
    /// List capture devices
    Devices,
}

impl Args {
    /// Default filter when RUST_LOG is unset.
    pub fn default_filter(&self) -> &'static str {
        match self.verbose {
            0 => "info",
            1 => "info,parley_voice=debug,parley=debug",
            _ => "trace",
        }
    }
}

/// Install the tracing subscriber. RUST_LOG wins over `-v`.
pub fn init_logging(args: &Args) {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| args.default_filter().into());
    tracing_subscriber::registry()
        .with(EnvFilter::new(filter))
        .with(tracing_subscriber::fmt::layer())
        .init();
}
