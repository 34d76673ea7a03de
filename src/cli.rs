//! Command line interface for the `wellstream` binary.

use std::{net::SocketAddr, path::PathBuf};

use clap::{Args, Parser, Subcommand};

/// Command line arguments for the `wellstream` binary.
#[derive(Debug, Parser)]
#[command(
    name = "wellstream",
    version,
    about = "ETP channel-streaming endpoint for well data stores"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Accept ETP sessions and consume streamed channel data.
    Serve(ServeArgs),
    /// Validate a JSON configuration file and print the effective settings.
    CheckConfig {
        /// Configuration file to check.
        path: PathBuf,
    },
}

#[derive(Debug, Args)]
pub struct ServeArgs {
    /// Address to listen on.
    #[arg(short, long, default_value = "127.0.0.1:9000")]
    pub bind: SocketAddr,
    /// JSON configuration file.
    #[arg(short, long)]
    pub config: Option<PathBuf>,
    /// Serve Prometheus metrics on this address.
    #[arg(long)]
    pub metrics: Option<SocketAddr>,
    /// Start framing without reading a transport preamble.
    #[arg(long)]
    pub no_preamble: bool,
}
