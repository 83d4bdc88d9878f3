//! CLI command definitions.
//!
//! This module defines the structure of all CLI subcommands.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use clap::{Args, Subcommand, ValueEnum};

use crate::error::PredictionError;
use crate::flight::FlightKey;
use crate::live_status::FlightStatus;
use crate::normalizer::Normalizer;

/// Identity of a flight on the command line.
#[derive(Debug, Clone, Args)]
pub struct FlightArgs {
    /// Flight designator, e.g. CA1234
    pub flight: String,

    /// Departure date (YYYY-MM-DD)
    #[arg(short, long)]
    pub date: String,

    /// Origin airport code
    #[arg(long = "from", value_name = "IATA")]
    pub origin: String,

    /// Destination airport code
    #[arg(long = "to", value_name = "IATA")]
    pub destination: String,
}

impl FlightArgs {
    /// Validate the arguments into a key.
    ///
    /// # Errors
    ///
    /// Returns a validation error for a malformed identity.
    pub fn key(&self, normalizer: &Normalizer) -> Result<FlightKey, PredictionError> {
        normalizer.key(&self.flight, &self.date, &self.origin, &self.destination)
    }
}

/// Register command arguments.
#[derive(Debug, Args)]
pub struct RegisterCommand {
    /// JSON file holding one flight record or an array of them
    pub file: PathBuf,
}

/// Observe command arguments.
#[derive(Debug, Args)]
pub struct ObserveCommand {
    /// The flight
    #[command(flatten)]
    pub flight: FlightArgs,

    /// Reported status
    #[arg(short, long, value_enum)]
    pub status: StatusArg,

    /// Reported delay in minutes
    #[arg(long)]
    pub delay: Option<i64>,

    /// Source confidence between 0 and 1
    #[arg(long, default_value = "1.0")]
    pub confidence: f64,

    /// When the status was observed (RFC 3339), defaults to now
    #[arg(long)]
    pub at: Option<DateTime<Utc>>,
}

/// Predict command arguments.
#[derive(Debug, Args)]
pub struct PredictCommand {
    /// The flight
    #[command(flatten)]
    pub flight: FlightArgs,

    /// Accept a stale cached prediction instead of recomputing
    #[arg(long)]
    pub allow_stale: bool,

    /// Give up waiting after this many milliseconds
    #[arg(long, value_name = "MS")]
    pub wait_ms: Option<u64>,

    /// Output as JSON
    #[arg(short, long)]
    pub json: bool,
}

/// Outcome command arguments.
#[derive(Debug, Args)]
pub struct OutcomeCommand {
    /// The flight
    #[command(flatten)]
    pub flight: FlightArgs,

    /// Actual departure delay in minutes
    #[arg(long, default_value = "0")]
    pub delay: i64,

    /// The flight was cancelled
    #[arg(long)]
    pub cancelled: bool,
}

/// Status command arguments.
#[derive(Debug, Args)]
pub struct StatusCommand {
    /// Output as JSON
    #[arg(short, long)]
    pub json: bool,
}

/// Prune command arguments.
#[derive(Debug, Args)]
pub struct PruneCommand {
    /// Prune data older than this many days, overriding the configured age
    #[arg(long)]
    pub days: Option<u32>,
}

/// Watch command arguments.
#[derive(Debug, Args)]
pub struct WatchCommand {
    /// JSON file of observations, re-read every round
    #[arg(short, long)]
    pub source: PathBuf,

    /// Stop after this many rounds
    #[arg(short, long)]
    pub rounds: Option<u64>,

    /// Seconds between rounds, overriding the configured interval
    #[arg(short, long, value_parser = clap::value_parser!(u64).range(1..))]
    pub interval: Option<u64>,
}

/// Export command arguments.
#[derive(Debug, Args)]
pub struct ExportCommand {
    /// Write to this file instead of stdout
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Export the log of served predictions instead of outcomes
    #[arg(long)]
    pub history: bool,
}

/// Configuration commands.
#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Show current configuration
    Show {
        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },

    /// Show the configuration file path
    Path,

    /// Validate configuration
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
}

/// Flight status argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StatusArg {
    /// Not yet boarding
    Scheduled,
    /// Boarding in progress
    Boarding,
    /// Pushed back from the gate
    Departed,
    /// In the air
    Airborne,
    /// Arrived
    Landed,
    /// Will not operate
    Cancelled,
}

impl From<StatusArg> for FlightStatus {
    fn from(arg: StatusArg) -> Self {
        match arg {
            StatusArg::Scheduled => Self::Scheduled,
            StatusArg::Boarding => Self::Boarding,
            StatusArg::Departed => Self::Departed,
            StatusArg::Airborne => Self::Airborne,
            StatusArg::Landed => Self::Landed,
            StatusArg::Cancelled => Self::Cancelled,
        }
    }
}
