//! Most recent live status per flight.
//!
//! The cache is written by a poller and read by the engine. Writes are
//! last-writer-by-timestamp-wins: an observation is applied only if it is
//! strictly newer than the stored one, so late or duplicated deliveries can
//! never move a flight's status backwards in time.
//!
//! Reported confidence decays with observation age, computed at read time;
//! the stored raw confidence never changes.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::flight::FlightKey;

/// Operational status reported for a flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlightStatus {
    /// Not yet boarding.
    Scheduled,
    /// Boarding in progress.
    Boarding,
    /// Pushed back from the gate.
    Departed,
    /// In the air.
    Airborne,
    /// On the ground at the destination.
    Landed,
    /// Will not operate.
    Cancelled,
}

impl FlightStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [FlightStatus; 6] = [
        Self::Scheduled,
        Self::Boarding,
        Self::Departed,
        Self::Airborne,
        Self::Landed,
        Self::Cancelled,
    ];

    /// Parse a status name as produced by [`fmt::Display`].
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim().to_ascii_lowercase();
        Self::ALL.into_iter().find(|s| s.to_string() == value)
    }

    /// Position in the lifecycle, used as a model feature.
    #[must_use]
    pub fn ordinal(self) -> u8 {
        match self {
            Self::Scheduled => 0,
            Self::Boarding => 1,
            Self::Departed => 2,
            Self::Airborne => 3,
            Self::Landed => 4,
            Self::Cancelled => 5,
        }
    }
}

impl fmt::Display for FlightStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scheduled => write!(f, "scheduled"),
            Self::Boarding => write!(f, "boarding"),
            Self::Departed => write!(f, "departed"),
            Self::Airborne => write!(f, "airborne"),
            Self::Landed => write!(f, "landed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// One live status observation for a flight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveStatus {
    /// Reported status.
    pub status: FlightStatus,
    /// Last known delay in minutes, if the source reported one.
    pub delay_minutes: Option<i64>,
    /// When the source observed this status.
    pub observed_at: DateTime<Utc>,
    /// Raw source confidence in `[0, 1]`.
    pub confidence: f64,
}

impl LiveStatus {
    /// Create an observation. Confidence is clamped into `[0, 1]`; a NaN
    /// confidence is treated as zero.
    #[must_use]
    pub fn new(
        status: FlightStatus,
        delay_minutes: Option<i64>,
        observed_at: DateTime<Utc>,
        confidence: f64,
    ) -> Self {
        let confidence = if confidence.is_nan() {
            0.0
        } else {
            confidence.clamp(0.0, 1.0)
        };
        Self {
            status,
            delay_minutes,
            observed_at,
            confidence,
        }
    }

    /// Confidence as reported at `as_of`.
    ///
    /// Full raw confidence while the observation is within `freshness_window`
    /// of `as_of`; past that it halves with every further window. Observations
    /// from the future relative to `as_of` count as age zero.
    #[must_use]
    pub fn effective_confidence(&self, as_of: DateTime<Utc>, freshness_window: Duration) -> f64 {
        let age = (as_of - self.observed_at).to_std().unwrap_or(Duration::ZERO);
        if age <= freshness_window || freshness_window.is_zero() {
            return self.confidence;
        }
        let overdue = (age - freshness_window).as_secs_f64() / freshness_window.as_secs_f64();
        self.confidence * 0.5_f64.powf(overdue)
    }
}

/// One observation tagged with the flight it belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservationRecord {
    /// The observed flight.
    pub key: FlightKey,
    /// The observation.
    #[serde(flatten)]
    pub status: LiveStatus,
}

/// Concurrent map of the latest applied observation per flight.
///
/// Backed by a sharded map: writers hold one shard lock for a comparison and
/// a store, and readers of other shards never wait on them.
#[derive(Debug, Default)]
pub struct LiveStatusCache {
    entries: DashMap<FlightKey, LiveStatus>,
    freshness_window: Duration,
}

impl LiveStatusCache {
    /// Create an empty cache with the given freshness window.
    #[must_use]
    pub fn new(freshness_window: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            freshness_window,
        }
    }

    /// The configured freshness window.
    #[must_use]
    pub fn freshness_window(&self) -> Duration {
        self.freshness_window
    }

    /// Apply an observation if it is strictly newer than the stored one.
    ///
    /// Returns whether it was applied. Older or same-timestamp observations
    /// are dropped without error.
    pub fn update(&self, key: &FlightKey, observation: LiveStatus) -> bool {
        match self.entries.entry(key.clone()) {
            Entry::Occupied(mut stored) => {
                if observation.observed_at > stored.get().observed_at {
                    trace!(
                        "{}: {} -> {} at {}",
                        key,
                        stored.get().status,
                        observation.status,
                        observation.observed_at
                    );
                    stored.insert(observation);
                    true
                } else {
                    debug!(
                        "{}: dropping observation at {} (stored {})",
                        key,
                        observation.observed_at,
                        stored.get().observed_at
                    );
                    false
                }
            }
            Entry::Vacant(slot) => {
                trace!("{}: first observation at {}", key, observation.observed_at);
                slot.insert(observation);
                true
            }
        }
    }

    /// The latest applied observation, if any.
    #[must_use]
    pub fn get(&self, key: &FlightKey) -> Option<LiveStatus> {
        self.entries.get(key).map(|s| s.value().clone())
    }

    /// Timestamp of the latest applied observation, if any.
    #[must_use]
    pub fn observed_at(&self, key: &FlightKey) -> Option<DateTime<Utc>> {
        self.entries.get(key).map(|s| s.observed_at)
    }

    /// Confidence of the stored observation as reported at `as_of`.
    #[must_use]
    pub fn effective_confidence(&self, key: &FlightKey, as_of: DateTime<Utc>) -> Option<f64> {
        self.entries
            .get(key)
            .map(|s| s.effective_confidence(as_of, self.freshness_window))
    }

    /// Number of flights with a live status.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no live status is held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Keys of all flights with a live status.
    #[must_use]
    pub fn keys(&self) -> Vec<FlightKey> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }
}
