//! Command-line interface definitions.

use std::net::IpAddr;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// Perun - DMR network server.
#[derive(Parser)]
#[command(name = "perun", version, about = "Self-contained DMR network server")]
pub struct Cli {
    /// Path to the configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    pub log_level: String,

    /// Disable colored output
    #[arg(long, global = true)]
    pub no_color: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the DMR server
    Run(RunArgs),
    /// Print or write an example configuration
    Config(ConfigArgs),
    /// Manage registered repeaters
    Repeater(RepeaterArgs),
    /// Query the lastheard call archive
    Lastheard(LastheardArgs),
}

#[derive(Args)]
pub struct RunArgs {
    /// Override the listen address
    #[arg(long)]
    pub listen: Option<IpAddr>,

    /// Override the DMR port
    #[arg(long)]
    pub port: Option<u16>,
}

#[derive(Args)]
pub struct ConfigArgs {
    /// Write to a file instead of stdout
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

#[derive(Args)]
pub struct RepeaterArgs {
    #[command(subcommand)]
    pub command: RepeaterCommands,
}

#[derive(Subcommand)]
pub enum RepeaterCommands {
    /// Register a repeater
    Add {
        /// 7-digit radio id
        radio_id: u32,

        /// Shared secret for the login challenge
        password: String,

        /// Radio id of the owning user
        #[arg(long, default_value_t = 0)]
        owner: u32,

        /// Static talkgroups on timeslot 1 (comma separated)
        #[arg(long, value_delimiter = ',')]
        ts1: Vec<u32>,

        /// Static talkgroups on timeslot 2 (comma separated)
        #[arg(long, value_delimiter = ',')]
        ts2: Vec<u32>,

        /// Mark as a personal hotspot
        #[arg(long)]
        hotspot: bool,
    },
    /// List registered repeaters
    List,
    /// Remove a repeater
    Remove {
        /// 7-digit radio id
        radio_id: u32,
    },
}

#[derive(Args)]
pub struct LastheardArgs {
    /// Limit the number of records
    #[arg(short = 'n', long, default_value_t = 20)]
    pub limit: usize,

    /// Filter by source user id
    #[arg(long)]
    pub user: Option<u32>,

    /// Filter by repeater id
    #[arg(long)]
    pub repeater: Option<u32>,

    /// Filter by talkgroup
    #[arg(long)]
    pub talkgroup: Option<u32>,
}
