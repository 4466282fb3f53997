//! CLI interface for tick-ingest
//!
//! Provides subcommands for:
//! - `run`: Stream the feed into the tick store
//! - `decode`: Decode a captured binary packet
//! - `verify`: Query what the store holds
//! - `config`: Show the effective configuration

mod decode;
mod run;
mod verify;

pub use decode::DecodeArgs;
pub use run::RunArgs;
pub use verify::VerifyArgs;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "tick-ingest")]
#[command(about = "Ingest a binary market-data feed into a columnar tick store")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    pub config: String,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Stream the feed until Ctrl-C
    Run(RunArgs),
    /// Decode a binary packet file and print it as JSON
    Decode(DecodeArgs),
    /// Show the last stored tick and daily aggregates
    Verify(VerifyArgs),
    /// Show the effective configuration
    Config,
}
