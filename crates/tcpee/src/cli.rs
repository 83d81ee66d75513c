use std::path::PathBuf;

use clap::{ArgAction, Parser};

/// Default configuration file location.
pub const DEFAULT_CONFIG: &str = "/etc/tcpee.conf";

#[derive(Parser)]
#[command(
    name = "tcpee",
    about = "Multi-instance TCP reverse proxy with PROXY protocol support",
    version
)]
pub struct Cli {
    /// Path to the TOML configuration file
    #[arg(short = 'c', long = "config", value_name = "FILE", default_value = DEFAULT_CONFIG)]
    pub config: PathBuf,

    /// Increase log verbosity (-v, -vv)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,
}
