//! CLI interface for evolverd
//!
//! This module provides the command-line interface using clap's derive API.
//! `serve` runs the daemon; every other command talks to a running daemon
//! over the operator socket.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// eVOLVER fleet daemon
///
/// Runs chemostat, turbidostat and morbidostat experiments on networked
/// eVOLVER units and keeps track of the fluids they consume.
#[derive(Parser, Debug)]
#[command(name = "evolverd")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Output in JSON format
    #[arg(long, global = true)]
    pub json: bool,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, global = true, value_name = "LEVEL")]
    pub log: Option<String>,

    /// Specify alternate configuration file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the daemon in the foreground
    Serve,

    /// Announce an experiment and how many fragments it will stage
    Initialize {
        /// Experiment name
        name: String,

        /// Number of fragments to expect
        fragments: u32,
    },

    /// Set remaining fluid volumes
    Refill {
        /// Volumes as FLUID=ML
        #[arg(value_name = "FLUID=ML", required = true, value_parser = parse_volume)]
        volumes: Vec<(String, f64)>,
    },

    /// Lock the pumps on every device
    Pause,

    /// Release the pump lock
    Unpause,

    /// End a running experiment
    Stop {
        /// Experiment name
        name: String,
    },

    /// Copy an experiment fragment into the staging directory
    Stage {
        /// Experiment name
        name: String,

        /// Control mode (chemostat, turbidostat, morbidostat)
        mode: String,

        /// Fragment JSON file
        file: PathBuf,
    },
}

fn parse_volume(arg: &str) -> Result<(String, f64), String> {
    let (fluid, volume) = arg
        .split_once('=')
        .ok_or_else(|| format!("expected FLUID=ML, got '{}'", arg))?;
    if fluid.is_empty() {
        return Err(format!("missing fluid name in '{}'", arg));
    }
    let volume: f64 = volume
        .parse()
        .map_err(|_| format!("'{}' is not a volume", volume))?;
    Ok((fluid.to_string(), volume))
}
