//! Storage layer for flightdelay.
//!
//! `SQLite` persistence for registered flights, applied live observations,
//! the prediction cache, a log of served predictions and actual-delay
//! outcomes. Loading it back into a fresh engine reproduces the same
//! Fresh/Stale classification, since both observation and basis timestamps
//! round-trip exactly.

pub mod migrations;
pub mod schema;

use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::engine::{ConfidenceBand, DelayEngine, PredictionResult, RiskLevel};
use crate::error::{Error, Result};
use crate::flight::{FlightKey, RawFlightRecord};
use crate::live_status::{FlightStatus, LiveStatus, ObservationRecord};

/// Actual delay of a flight, reported after the fact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    /// Row id, once stored.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    /// The flight.
    pub key: FlightKey,
    /// Actual departure delay in minutes.
    pub actual_delay_minutes: i64,
    /// Whether the flight was cancelled.
    pub cancelled: bool,
    /// The cached prediction at the time the outcome was recorded, if any.
    pub predicted_probability: Option<f64>,
    /// When the outcome was recorded.
    pub recorded_at: DateTime<Utc>,
}

impl Outcome {
    /// Delay in minutes from which a flight counts as delayed.
    pub const DELAY_THRESHOLD_MINUTES: i64 = 15;

    /// Create an outcome recorded now.
    #[must_use]
    pub fn new(key: FlightKey, actual_delay_minutes: i64, cancelled: bool) -> Self {
        Self {
            id: None,
            key,
            actual_delay_minutes,
            cancelled,
            predicted_probability: None,
            recorded_at: Utc::now(),
        }
    }

    /// Whether the flight counts as delayed.
    #[must_use]
    pub fn delayed(&self) -> bool {
        self.cancelled || self.actual_delay_minutes >= Self::DELAY_THRESHOLD_MINUTES
    }
}

/// Rows removed by a prune.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneReport {
    /// Flights departing before the cutoff date.
    pub flights: usize,
    /// Observations made before the cutoff.
    pub observations: usize,
    /// Predictions computed before the cutoff.
    pub predictions: usize,
    /// Prediction log rows served before the cutoff.
    pub history: usize,
}

impl PruneReport {
    /// Total rows removed.
    #[must_use]
    pub fn total(&self) -> usize {
        self.flights + self.observations + self.predictions + self.history
    }
}

/// One served prediction from the prediction log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggedPrediction {
    /// Row id.
    pub id: i64,
    /// The flight.
    pub key: FlightKey,
    /// Delay probability as served.
    pub probability: f64,
    /// Confidence as served.
    pub confidence: f64,
    /// Confidence band as served.
    pub band: ConfidenceBand,
    /// Model that scored the flight.
    pub model: String,
    /// Whether it was served marked stale.
    pub stale: bool,
    /// Live observation the prediction was computed against.
    pub basis_timestamp: Option<DateTime<Utc>>,
    /// When it was served.
    pub served_at: DateTime<Utc>,
}

/// A name and how often it occurs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tally {
    /// Airline code or `ORIGIN-DESTINATION` route.
    pub name: String,
    /// Number of predictions.
    pub count: i64,
}

/// Aggregates over the prediction log and recorded outcomes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PredictionStats {
    /// Predictions served.
    pub total: i64,
    /// Predictions above [`PredictionStats::DELAYED_PROBABILITY`].
    pub delayed: i64,
    /// The remaining predictions.
    pub on_time: i64,
    /// Mean served probability, `None` when nothing was served.
    pub average_probability: Option<f64>,
    /// Most predicted airlines, most frequent first.
    pub top_airlines: Vec<Tally>,
    /// Most predicted routes, most frequent first.
    pub top_routes: Vec<Tally>,
    /// Outcomes that carry the probability predicted for them.
    pub scored_outcomes: i64,
    /// Scored outcomes whose predicted side of the threshold matched.
    pub correct_outcomes: i64,
}

impl PredictionStats {
    /// Probability above which a prediction counts as a delay call.
    pub const DELAYED_PROBABILITY: f64 = 0.5;

    /// Airlines listed in [`PredictionStats::top_airlines`].
    pub const TOP_AIRLINES: usize = 3;

    /// Routes listed in [`PredictionStats::top_routes`].
    pub const TOP_ROUTES: usize = 5;

    /// Share of scored outcomes that were called correctly.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_rate(&self) -> Option<f64> {
        (self.scored_outcomes > 0)
            .then(|| self.correct_outcomes as f64 / self.scored_outcomes as f64)
    }
}

/// What a warm start loaded into an engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestoreReport {
    /// Flights registered.
    pub flights: usize,
    /// Stored flights that no longer validate.
    pub skipped_flights: usize,
    /// Observations applied.
    pub observations: usize,
    /// Cached predictions restored.
    pub predictions: usize,
}

/// Statistics about the storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageStats {
    /// Registered flights.
    pub flights: i64,
    /// Stored observations.
    pub observations: i64,
    /// Stored predictions.
    pub predictions: i64,
    /// Recorded outcomes.
    pub outcomes: i64,
    /// Rows in the prediction log.
    pub logged_predictions: i64,
    /// Timestamp of the oldest observation.
    pub oldest_observation: Option<DateTime<Utc>>,
    /// Timestamp of the newest observation.
    pub newest_observation: Option<DateTime<Utc>>,
    /// Schema version of the database.
    pub schema_version: i32,
    /// Size of the database file in bytes.
    pub db_size_bytes: u64,
}

/// Key columns as read from a row.
type KeyColumns = (String, String, String, String, String);

/// Storage engine for flights, observations, predictions and outcomes.
#[derive(Debug)]
pub struct Storage {
    /// Path to the database file.
    path: PathBuf,
    /// Database connection.
    conn: Connection,
}

impl Storage {
    /// Open or create a storage database at the given path.
    ///
    /// Creates the parent directories and database file if they don't exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or schema initialization fails.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|source| Error::DirectoryCreate {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }

        debug!("Opening database at {}", path.display());
        let conn = Connection::open(&path).map_err(|source| Error::DatabaseOpen {
            path: path.clone(),
            source,
        })?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        migrations::initialize_schema(&conn)?;

        info!("Database opened at {}", path.display());
        Ok(Self { path, conn })
    }

    /// Create an in-memory storage instance.
    ///
    /// # Errors
    ///
    /// Returns an error if the in-memory database cannot be created.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|source| Error::DatabaseOpen {
            path: PathBuf::from(":memory:"),
            source,
        })?;

        migrations::initialize_schema(&conn)?;

        Ok(Self {
            path: PathBuf::from(":memory:"),
            conn,
        })
    }

    /// Get the path to the database file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Store the raw record a flight was registered from, replacing any
    /// earlier record for the same key.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn save_flight(&self, key: &FlightKey, raw: &RawFlightRecord) -> Result<()> {
        let record = serde_json::to_string(raw)?;
        self.conn.execute(
            r"
            INSERT OR REPLACE INTO flights
                (fingerprint, carrier, flight_number, departure_date, origin, destination,
                 record, registered_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ",
            params![
                key.fingerprint(),
                key.carrier,
                key.flight_number,
                key.departure_date.to_string(),
                key.origin,
                key.destination,
                record,
                format_timestamp(Utc::now()),
            ],
        )?;
        debug!("{}: flight saved", key);
        Ok(())
    }

    /// All stored flight records, in registration order.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or a record cannot be decoded.
    pub fn load_flights(&self) -> Result<Vec<RawFlightRecord>> {
        let mut stmt = self
            .conn
            .prepare("SELECT record FROM flights ORDER BY registered_at ASC, rowid ASC")?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        rows.iter()
            .map(|record| {
                serde_json::from_str(record).map_err(|e| Error::corrupt("flights", e.to_string()))
            })
            .collect()
    }

    /// Store an applied observation. Returns `false` if one with the same
    /// timestamp was already stored for the flight.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn save_observation(&self, record: &ObservationRecord) -> Result<bool> {
        let key = &record.key;
        let status = &record.status;
        let affected = self.conn.execute(
            r"
            INSERT OR IGNORE INTO observations
                (fingerprint, carrier, flight_number, departure_date, origin, destination,
                 status, delay_minutes, confidence, observed_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ",
            params![
                key.fingerprint(),
                key.carrier,
                key.flight_number,
                key.departure_date.to_string(),
                key.origin,
                key.destination,
                status.status.to_string(),
                status.delay_minutes,
                status.confidence,
                format_timestamp(status.observed_at),
            ],
        )?;
        Ok(affected > 0)
    }

    /// All stored observations in ascending time order.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or a row cannot be decoded.
    pub fn load_observations(&self) -> Result<Vec<ObservationRecord>> {
        let mut stmt = self.conn.prepare(
            r"
            SELECT carrier, flight_number, departure_date, origin, destination,
                   status, delay_minutes, confidence, observed_at
            FROM observations ORDER BY observed_at ASC, id ASC
            ",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    key_columns(row, 0)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, Option<i64>>(6)?,
                    row.get::<_, f64>(7)?,
                    row.get::<_, String>(8)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(key, status, delay, confidence, observed_at)| {
                let status = FlightStatus::parse(&status).ok_or_else(|| {
                    Error::corrupt("observations", format!("unknown status {status:?}"))
                })?;
                Ok(ObservationRecord {
                    key: decode_key("observations", key)?,
                    status: LiveStatus::new(
                        status,
                        delay,
                        parse_timestamp("observations", &observed_at)?,
                        confidence,
                    ),
                })
            })
            .collect()
    }

    /// Replace the stored prediction cache with `results`, given least
    /// recently used first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn save_predictions(&self, results: &[PredictionResult]) -> Result<usize> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute("DELETE FROM predictions", [])?;
        let saved_at = format_timestamp(Utc::now());
        {
            let mut stmt = tx.prepare(
                r"
                INSERT OR REPLACE INTO predictions
                    (fingerprint, carrier, flight_number, departure_date, origin, destination,
                     probability, raw_probability, confidence, band, risk, factors, model,
                     computed_at, basis_timestamp, position, saved_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
                ",
            )?;
            for (position, result) in results.iter().enumerate() {
                let key = &result.key;
                let position = i64::try_from(position).unwrap_or(i64::MAX);
                stmt.execute(params![
                    key.fingerprint(),
                    key.carrier,
                    key.flight_number,
                    key.departure_date.to_string(),
                    key.origin,
                    key.destination,
                    result.probability,
                    result.raw_probability,
                    result.confidence,
                    result.band.to_string(),
                    result.risk.to_string(),
                    serde_json::to_string(&result.factors)?,
                    result.model,
                    format_timestamp(result.computed_at),
                    result.basis_timestamp.map(format_timestamp),
                    position,
                    saved_at,
                ])?;
            }
        }
        tx.commit()?;
        debug!("Saved {} predictions", results.len());
        Ok(results.len())
    }

    /// The stored prediction cache, least recently used first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or a row cannot be decoded.
    pub fn load_predictions(&self) -> Result<Vec<PredictionResult>> {
        let mut stmt = self.conn.prepare(
            r"
            SELECT carrier, flight_number, departure_date, origin, destination,
                   probability, raw_probability, confidence, band, risk, factors, model,
                   computed_at, basis_timestamp
            FROM predictions ORDER BY position ASC
            ",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(PredictionRow {
                    key: key_columns(row, 0)?,
                    probability: row.get(5)?,
                    raw_probability: row.get(6)?,
                    confidence: row.get(7)?,
                    band: row.get(8)?,
                    risk: row.get(9)?,
                    factors: row.get(10)?,
                    model: row.get(11)?,
                    computed_at: row.get(12)?,
                    basis_timestamp: row.get(13)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        rows.into_iter().map(PredictionRow::decode).collect()
    }

    /// Record an actual delay. Returns the new row id.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn record_outcome(&self, outcome: &Outcome) -> Result<i64> {
        let key = &outcome.key;
        self.conn.execute(
            r"
            INSERT INTO outcomes
                (fingerprint, carrier, flight_number, departure_date, origin, destination,
                 actual_delay_minutes, cancelled, predicted_probability, recorded_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ",
            params![
                key.fingerprint(),
                key.carrier,
                key.flight_number,
                key.departure_date.to_string(),
                key.origin,
                key.destination,
                outcome.actual_delay_minutes,
                outcome.cancelled,
                outcome.predicted_probability,
                format_timestamp(outcome.recorded_at),
            ],
        )?;
        let id = self.conn.last_insert_rowid();
        info!(
            "{}: recorded outcome of {} min (id {})",
            key, outcome.actual_delay_minutes, id
        );
        Ok(id)
    }

    /// All recorded outcomes, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or a row cannot be decoded.
    pub fn outcomes(&self) -> Result<Vec<Outcome>> {
        let mut stmt = self.conn.prepare(
            r"
            SELECT carrier, flight_number, departure_date, origin, destination,
                   id, actual_delay_minutes, cancelled, predicted_probability, recorded_at
            FROM outcomes ORDER BY recorded_at ASC, id ASC
            ",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    key_columns(row, 0)?,
                    row.get::<_, i64>(5)?,
                    row.get::<_, i64>(6)?,
                    row.get::<_, bool>(7)?,
                    row.get::<_, Option<f64>>(8)?,
                    row.get::<_, String>(9)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(key, id, delay, cancelled, predicted, recorded_at)| {
                Ok(Outcome {
                    id: Some(id),
                    key: decode_key("outcomes", key)?,
                    actual_delay_minutes: delay,
                    cancelled,
                    predicted_probability: predicted,
                    recorded_at: parse_timestamp("outcomes", &recorded_at)?,
                })
            })
            .collect()
    }

    /// Append a served prediction to the prediction log. Returns the new
    /// row id.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn log_prediction(
        &self,
        result: &PredictionResult,
        served_at: DateTime<Utc>,
    ) -> Result<i64> {
        let key = &result.key;
        self.conn.execute(
            r"
            INSERT INTO prediction_log
                (fingerprint, carrier, flight_number, departure_date, origin, destination,
                 probability, confidence, band, model, stale, basis_timestamp, served_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            ",
            params![
                key.fingerprint(),
                key.carrier,
                key.flight_number,
                key.departure_date.to_string(),
                key.origin,
                key.destination,
                result.probability,
                result.confidence,
                result.band.to_string(),
                result.model,
                result.stale,
                result.basis_timestamp.map(format_timestamp),
                format_timestamp(served_at),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Served predictions, most recent first, at most `limit` of them.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or a row cannot be decoded.
    pub fn prediction_history(&self, limit: Option<usize>) -> Result<Vec<LoggedPrediction>> {
        const TABLE: &str = "prediction_log";
        let limit = limit.map_or(-1, |n| i64::try_from(n).unwrap_or(i64::MAX));
        let mut stmt = self.conn.prepare(
            r"
            SELECT carrier, flight_number, departure_date, origin, destination,
                   id, probability, confidence, band, model, stale, basis_timestamp, served_at
            FROM prediction_log ORDER BY served_at DESC, id DESC LIMIT ?1
            ",
        )?;
        let rows = stmt
            .query_map([limit], |row| {
                Ok((
                    key_columns(row, 0)?,
                    row.get::<_, i64>(5)?,
                    row.get::<_, f64>(6)?,
                    row.get::<_, f64>(7)?,
                    row.get::<_, String>(8)?,
                    row.get::<_, String>(9)?,
                    row.get::<_, bool>(10)?,
                    row.get::<_, Option<String>>(11)?,
                    row.get::<_, String>(12)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(
                |(key, id, probability, confidence, band, model, stale, basis, served_at)| {
                    Ok(LoggedPrediction {
                        id,
                        key: decode_key(TABLE, key)?,
                        probability,
                        confidence,
                        band: ConfidenceBand::parse(&band).ok_or_else(|| {
                            Error::corrupt(TABLE, format!("unknown band {band:?}"))
                        })?,
                        model,
                        stale,
                        basis_timestamp: basis
                            .map(|s| parse_timestamp(TABLE, &s))
                            .transpose()?,
                        served_at: parse_timestamp(TABLE, &served_at)?,
                    })
                },
            )
            .collect()
    }

    /// Aggregate the prediction log and scored outcomes, over everything
    /// or only rows from `since` on.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn prediction_stats(&self, since: Option<DateTime<Utc>>) -> Result<PredictionStats> {
        // Every stored timestamp sorts after the empty string.
        let since = since.map(format_timestamp).unwrap_or_default();

        let (total, delayed, average_probability): (i64, i64, Option<f64>) =
            self.conn.query_row(
                r"
                SELECT COUNT(*), COALESCE(SUM(probability > ?2), 0), AVG(probability)
                FROM prediction_log WHERE served_at >= ?1
                ",
                params![since, PredictionStats::DELAYED_PROBABILITY],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )?;

        let top_airlines = self.tally(
            r"
            SELECT carrier, COUNT(*) AS n FROM prediction_log WHERE served_at >= ?1
            GROUP BY carrier ORDER BY n DESC, carrier ASC LIMIT ?2
            ",
            &since,
            PredictionStats::TOP_AIRLINES,
        )?;
        let top_routes = self.tally(
            r"
            SELECT origin || '-' || destination AS route, COUNT(*) AS n
            FROM prediction_log WHERE served_at >= ?1
            GROUP BY origin, destination ORDER BY n DESC, route ASC LIMIT ?2
            ",
            &since,
            PredictionStats::TOP_ROUTES,
        )?;

        let mut stmt = self.conn.prepare(
            r"
            SELECT predicted_probability, actual_delay_minutes, cancelled FROM outcomes
            WHERE predicted_probability IS NOT NULL AND recorded_at >= ?1
            ",
        )?;
        let scored = stmt
            .query_map([&since], |row| {
                Ok((
                    row.get::<_, f64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, bool>(2)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let correct = scored
            .iter()
            .filter(|(predicted, delay, cancelled)| {
                let delayed = *cancelled || *delay >= Outcome::DELAY_THRESHOLD_MINUTES;
                (*predicted > PredictionStats::DELAYED_PROBABILITY) == delayed
            })
            .count();

        Ok(PredictionStats {
            total,
            delayed,
            on_time: total - delayed,
            average_probability,
            top_airlines,
            top_routes,
            scored_outcomes: i64::try_from(scored.len()).unwrap_or(i64::MAX),
            correct_outcomes: i64::try_from(correct).unwrap_or(i64::MAX),
        })
    }

    fn tally(&self, sql: &str, since: &str, limit: usize) -> Result<Vec<Tally>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt
            .query_map(params![since, limit], |row| {
                Ok(Tally {
                    name: row.get(0)?,
                    count: row.get(1)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Prune flights, observations, predictions and the prediction log
    /// older than `max_age`. Outcomes are kept.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn prune_older_than(&self, max_age: std::time::Duration) -> Result<PruneReport> {
        let cutoff = chrono::Duration::from_std(max_age)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        self.prune_before(cutoff)
    }

    /// Prune everything older than `cutoff`, the prediction log included.
    /// Flights are pruned by departure date.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<PruneReport> {
        let cutoff_str = format_timestamp(cutoff);
        let cutoff_date = cutoff.date_naive().to_string();

        let tx = self.conn.unchecked_transaction()?;
        let report = PruneReport {
            flights: tx.execute(
                "DELETE FROM flights WHERE departure_date < ?1",
                [&cutoff_date],
            )?,
            observations: tx.execute(
                "DELETE FROM observations WHERE observed_at < ?1",
                [&cutoff_str],
            )?,
            predictions: tx.execute(
                "DELETE FROM predictions WHERE computed_at < ?1",
                [&cutoff_str],
            )?,
            history: tx.execute(
                "DELETE FROM prediction_log WHERE served_at < ?1",
                [&cutoff_str],
            )?,
        };
        tx.commit()?;

        if report.total() > 0 {
            info!(
                "Pruned {} flights, {} observations, {} predictions, {} log rows",
                report.flights, report.observations, report.predictions, report.history
            );
        }
        Ok(report)
    }

    /// Load stored state into `engine`: flights first, then observations
    /// in time order, then the prediction cache.
    ///
    /// Flights whose stored record no longer validates are skipped with a
    /// warning.
    ///
    /// # Errors
    ///
    /// Returns an error if stored data cannot be read.
    pub fn restore_engine(&self, engine: &DelayEngine) -> Result<RestoreReport> {
        let mut report = RestoreReport::default();

        for raw in self.load_flights()? {
            match engine.register_flight(&raw) {
                Ok(_) => report.flights += 1,
                Err(e) => {
                    warn!("Skipping stored flight: {}", e);
                    report.skipped_flights += 1;
                }
            }
        }
        for record in self.load_observations()? {
            if engine.ingest(&record.key, record.status) {
                report.observations += 1;
            }
        }
        report.predictions = engine.restore(self.load_predictions()?);

        debug!(
            "Warm start: {} flights, {} observations, {} predictions",
            report.flights, report.observations, report.predictions
        );
        Ok(report)
    }

    fn count(&self, table: &str) -> Result<i64> {
        let count: i64 =
            self.conn
                .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))?;
        Ok(count)
    }

    /// Get database statistics.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn stats(&self) -> Result<StorageStats> {
        let oldest: Option<String> = self
            .conn
            .query_row(
                "SELECT observed_at FROM observations ORDER BY observed_at ASC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        let newest: Option<String> = self
            .conn
            .query_row(
                "SELECT observed_at FROM observations ORDER BY observed_at DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;

        let db_size_bytes = if self.path.to_string_lossy() == ":memory:" {
            0
        } else {
            std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0)
        };

        Ok(StorageStats {
            flights: self.count("flights")?,
            observations: self.count("observations")?,
            predictions: self.count("predictions")?,
            outcomes: self.count("outcomes")?,
            logged_predictions: self.count("prediction_log")?,
            oldest_observation: oldest
                .map(|s| parse_timestamp("observations", &s))
                .transpose()?,
            newest_observation: newest
                .map(|s| parse_timestamp("observations", &s))
                .transpose()?,
            schema_version: migrations::get_schema_version(&self.conn)?,
            db_size_bytes,
        })
    }
}

struct PredictionRow {
    key: KeyColumns,
    probability: f64,
    raw_probability: f64,
    confidence: f64,
    band: String,
    risk: String,
    factors: String,
    model: String,
    computed_at: String,
    basis_timestamp: Option<String>,
}

impl PredictionRow {
    fn decode(self) -> Result<PredictionResult> {
        const TABLE: &str = "predictions";
        Ok(PredictionResult {
            key: decode_key(TABLE, self.key)?,
            probability: self.probability,
            raw_probability: self.raw_probability,
            confidence: self.confidence,
            band: ConfidenceBand::parse(&self.band)
                .ok_or_else(|| Error::corrupt(TABLE, format!("unknown band {:?}", self.band)))?,
            risk: RiskLevel::parse(&self.risk)
                .ok_or_else(|| Error::corrupt(TABLE, format!("unknown risk {:?}", self.risk)))?,
            factors: serde_json::from_str(&self.factors)
                .map_err(|e| Error::corrupt(TABLE, e.to_string()))?,
            model: self.model,
            computed_at: parse_timestamp(TABLE, &self.computed_at)?,
            basis_timestamp: self
                .basis_timestamp
                .map(|s| parse_timestamp(TABLE, &s))
                .transpose()?,
            stale: false,
        })
    }
}

fn key_columns(row: &rusqlite::Row, offset: usize) -> rusqlite::Result<KeyColumns> {
    Ok((
        row.get(offset)?,
        row.get(offset + 1)?,
        row.get(offset + 2)?,
        row.get(offset + 3)?,
        row.get(offset + 4)?,
    ))
}

fn decode_key(table: &'static str, columns: KeyColumns) -> Result<FlightKey> {
    let (carrier, flight_number, date, origin, destination) = columns;
    let departure_date = NaiveDate::parse_from_str(&date, "%Y-%m-%d")
        .map_err(|e| Error::corrupt(table, format!("bad departure date {date:?}: {e}")))?;
    Ok(FlightKey::new(
        carrier,
        flight_number,
        departure_date,
        origin,
        destination,
    ))
}

/// RFC 3339 in UTC with nanoseconds, so stored values sort as text and
/// parse back to the identical instant.
fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_timestamp(table: &'static str, value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::corrupt(table, format!("bad timestamp {value:?}: {e}")))
}
