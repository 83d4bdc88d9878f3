//! `flightdelay` - Flight delay probability engine
//!
//! This library estimates the probability that a scheduled flight departs
//! late. It combines static features derived from the flight record with the
//! latest live status observation, caches each prediction against the live
//! observation it was computed from, and recomputes at most once per flight
//! at a time when that observation changes.
//!
//! The pieces, bottom up:
//!
//! - [`normalizer`] validates raw records into [`FlightFeatures`].
//! - [`live_status`] keeps the newest observation per flight.
//! - [`scoring`] wraps a pluggable [`ScoringModel`] and guards its output.
//! - [`coordinator`] deduplicates concurrent computations under a budget.
//! - [`cache`] holds predictions with bounded, stale-first LRU eviction.
//! - [`engine`] ties them together behind [`DelayEngine`].
//! - [`poller`] and [`storage`] feed and persist the engine.

#![warn(missing_docs)]
#![warn(missing_debug_implementations)]
#![deny(unsafe_code)]

pub mod cache;
pub mod cli;
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod flight;
pub mod live_status;
pub mod logging;
pub mod normalizer;
pub mod poller;
pub mod scoring;
pub mod storage;

pub use config::Config;
pub use engine::{
    ConfidenceBand, DelayEngine, EngineStats, EntryState, PredictionOptions, PredictionResult,
    RiskLevel,
};
pub use error::{Error, PredictionError, Result};
pub use flight::{FlightFeatures, FlightKey, RawFlightRecord};
pub use live_status::{FlightStatus, LiveStatus, ObservationRecord};
pub use logging::init_logging;
pub use scoring::{RuleBasedModel, ScoringAdapter, ScoringModel};
pub use storage::{Storage, StorageStats};
