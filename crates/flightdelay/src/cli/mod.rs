//! Command-line interface for flightdelay.
//!
//! This module provides the CLI structure for the `fltdelay` binary.

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::logging::Verbosity;

pub use commands::{
    ConfigCommand, ExportCommand, FlightArgs, ObserveCommand, OutcomeCommand, PredictCommand,
    PruneCommand, RegisterCommand, StatusArg, StatusCommand, WatchCommand,
};

/// fltdelay - Flight delay probability engine
///
/// Registers flights, applies live status observations and answers delay
/// probability queries from a local cache backed by SQLite.
#[derive(Debug, Parser)]
#[command(name = "fltdelay")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to custom configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Increase verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// The command to execute
    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Register flights from a JSON file
    Register(RegisterCommand),

    /// Record a live status observation
    Observe(ObserveCommand),

    /// Predict the delay probability of a flight
    Predict(PredictCommand),

    /// Record the actual delay of a flight
    Outcome(OutcomeCommand),

    /// Show engine and storage status
    Status(StatusCommand),

    /// Delete data older than the configured age
    Prune(PruneCommand),

    /// Poll a status file and apply new observations
    Watch(WatchCommand),

    /// Export recorded outcomes as JSON
    Export(ExportCommand),

    /// View or validate configuration
    #[command(subcommand)]
    Config(ConfigCommand),
}

impl Cli {
    /// Get the verbosity level based on flags.
    #[must_use]
    pub fn verbosity(&self) -> Verbosity {
        Verbosity::from_flags(self.quiet, self.verbose)
    }
}
