//! `SQLite` schema definitions for flightdelay.
//!
//! Every table that refers to a flight carries the key's BLAKE3 fingerprint
//! plus the key columns themselves, so rows can be decoded without a join.
//! Timestamps are RFC 3339 UTC with nanosecond precision, which keeps them
//! both exact and lexically ordered.

/// SQL statement to create the flights table.
pub const CREATE_FLIGHTS_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS flights (
    fingerprint TEXT PRIMARY KEY,
    carrier TEXT NOT NULL,
    flight_number TEXT NOT NULL,
    departure_date TEXT NOT NULL,
    origin TEXT NOT NULL,
    destination TEXT NOT NULL,
    record TEXT NOT NULL,
    registered_at TEXT NOT NULL
)
";

/// SQL statement to create the observations table.
pub const CREATE_OBSERVATIONS_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS observations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    fingerprint TEXT NOT NULL,
    carrier TEXT NOT NULL,
    flight_number TEXT NOT NULL,
    departure_date TEXT NOT NULL,
    origin TEXT NOT NULL,
    destination TEXT NOT NULL,
    status TEXT NOT NULL,
    delay_minutes INTEGER,
    confidence REAL NOT NULL,
    observed_at TEXT NOT NULL,
    UNIQUE (fingerprint, observed_at)
)
";

/// SQL statement to index observations by time, for replay and pruning.
pub const CREATE_OBSERVED_AT_INDEX: &str = r"
CREATE INDEX IF NOT EXISTS idx_observations_observed_at ON observations(observed_at)
";

/// SQL statement to create the predictions table.
///
/// `position` is the recency rank within the saved snapshot, least recently
/// used first.
pub const CREATE_PREDICTIONS_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS predictions (
    fingerprint TEXT PRIMARY KEY,
    carrier TEXT NOT NULL,
    flight_number TEXT NOT NULL,
    departure_date TEXT NOT NULL,
    origin TEXT NOT NULL,
    destination TEXT NOT NULL,
    probability REAL NOT NULL,
    raw_probability REAL NOT NULL,
    confidence REAL NOT NULL,
    band TEXT NOT NULL,
    risk TEXT NOT NULL,
    factors TEXT NOT NULL,
    model TEXT NOT NULL,
    computed_at TEXT NOT NULL,
    basis_timestamp TEXT,
    position INTEGER NOT NULL,
    saved_at TEXT NOT NULL
)
";

/// SQL statement to create the metadata table for storing key-value pairs.
pub const CREATE_METADATA_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS metadata (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
)
";

/// SQL statement to create the outcomes table (schema version 2).
///
/// Actual delays reported after the fact, kept for model training.
pub const CREATE_OUTCOMES_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS outcomes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    fingerprint TEXT NOT NULL,
    carrier TEXT NOT NULL,
    flight_number TEXT NOT NULL,
    departure_date TEXT NOT NULL,
    origin TEXT NOT NULL,
    destination TEXT NOT NULL,
    actual_delay_minutes INTEGER NOT NULL,
    cancelled INTEGER NOT NULL DEFAULT 0,
    predicted_probability REAL,
    recorded_at TEXT NOT NULL
)
";

/// SQL statement to index outcomes by flight.
pub const CREATE_OUTCOMES_FLIGHT_INDEX: &str = r"
CREATE INDEX IF NOT EXISTS idx_outcomes_fingerprint ON outcomes(fingerprint)
";

/// SQL statement to create the prediction log (schema version 3).
///
/// One row per prediction served, kept for history and aggregate
/// statistics. Unlike `predictions`, rows are only ever appended.
pub const CREATE_PREDICTION_LOG_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS prediction_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    fingerprint TEXT NOT NULL,
    carrier TEXT NOT NULL,
    flight_number TEXT NOT NULL,
    departure_date TEXT NOT NULL,
    origin TEXT NOT NULL,
    destination TEXT NOT NULL,
    probability REAL NOT NULL,
    confidence REAL NOT NULL,
    band TEXT NOT NULL,
    model TEXT NOT NULL,
    stale INTEGER NOT NULL DEFAULT 0,
    basis_timestamp TEXT,
    served_at TEXT NOT NULL
)
";

/// SQL statement to index the prediction log by time, for recent history,
/// daily statistics and pruning.
pub const CREATE_PREDICTION_LOG_SERVED_AT_INDEX: &str = r"
CREATE INDEX IF NOT EXISTS idx_prediction_log_served_at ON prediction_log(served_at)
";

/// Base schema (version 1) creation statements in order.
pub const SCHEMA_STATEMENTS: &[&str] = &[
    CREATE_FLIGHTS_TABLE,
    CREATE_OBSERVATIONS_TABLE,
    CREATE_OBSERVED_AT_INDEX,
    CREATE_PREDICTIONS_TABLE,
    CREATE_METADATA_TABLE,
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_statements_not_empty() {
        assert!(!SCHEMA_STATEMENTS.is_empty());
        for stmt in SCHEMA_STATEMENTS {
            assert!(!stmt.trim().is_empty());
        }
    }

    #[test]
    fn test_observations_unique_per_timestamp() {
        assert!(CREATE_OBSERVATIONS_TABLE.contains("UNIQUE (fingerprint, observed_at)"));
    }

    #[test]
    fn test_basis_timestamp_nullable() {
        assert!(CREATE_PREDICTIONS_TABLE.contains("basis_timestamp TEXT,"));
        assert!(CREATE_PREDICTION_LOG_TABLE.contains("basis_timestamp TEXT,"));
    }
}
