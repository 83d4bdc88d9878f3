//! Database schema versioning for flightdelay.
//!
//! The base schema is created idempotently on every open; numbered
//! migrations then bring older databases forward. The applied version is
//! kept in the `metadata` table.

use rusqlite::Connection;

use crate::error::{Error, Result};

use super::schema::{
    CREATE_OUTCOMES_FLIGHT_INDEX, CREATE_OUTCOMES_TABLE, CREATE_PREDICTION_LOG_SERVED_AT_INDEX,
    CREATE_PREDICTION_LOG_TABLE, SCHEMA_STATEMENTS,
};

/// The current schema version.
pub const CURRENT_VERSION: i32 = 3;

/// Key used to store the schema version in the metadata table.
const VERSION_KEY: &str = "schema_version";

/// Initialize the database schema.
///
/// Creates the base tables if they don't exist, then runs any pending
/// migrations.
///
/// # Errors
///
/// Returns an error if schema creation or migration fails, or if the
/// database was written by a newer version.
pub fn initialize_schema(conn: &Connection) -> Result<()> {
    for statement in SCHEMA_STATEMENTS {
        conn.execute(statement, [])?;
    }

    let version = get_schema_version(conn)?;
    if version > CURRENT_VERSION {
        return Err(Error::DatabaseMigration {
            message: format!(
                "database schema version {version} is newer than supported version {CURRENT_VERSION}"
            ),
        });
    }
    if version < CURRENT_VERSION {
        run_migrations(conn, version)?;
    }

    Ok(())
}

/// Get the current schema version from the database.
///
/// Returns 0 if no version is set (fresh database).
pub fn get_schema_version(conn: &Connection) -> Result<i32> {
    let result: std::result::Result<String, rusqlite::Error> = conn.query_row(
        "SELECT value FROM metadata WHERE key = ?1",
        [VERSION_KEY],
        |row| row.get(0),
    );

    match result {
        Ok(value) => value.parse().map_err(|_| Error::DatabaseMigration {
            message: format!("invalid schema version: {value}"),
        }),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(0),
        Err(e) => Err(e.into()),
    }
}

fn set_schema_version(conn: &Connection, version: i32) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO metadata (key, value) VALUES (?1, ?2)",
        (VERSION_KEY, version.to_string()),
    )?;
    Ok(())
}

fn run_migrations(conn: &Connection, from_version: i32) -> Result<()> {
    let mut current = from_version;

    while current < CURRENT_VERSION {
        current += 1;
        run_migration(conn, current)?;
        set_schema_version(conn, current)?;
    }

    Ok(())
}

fn run_migration(conn: &Connection, version: i32) -> Result<()> {
    match version {
        1 => Ok(()),
        2 => migrate_v2(conn),
        3 => migrate_v3(conn),
        _ => Err(Error::DatabaseMigration {
            message: format!("unknown migration version: {version}"),
        }),
    }
}

/// Version 2 adds the outcomes table.
fn migrate_v2(conn: &Connection) -> Result<()> {
    conn.execute(CREATE_OUTCOMES_TABLE, [])?;
    conn.execute(CREATE_OUTCOMES_FLIGHT_INDEX, [])?;
    Ok(())
}

/// Version 3 adds the prediction log.
fn migrate_v3(conn: &Connection) -> Result<()> {
    conn.execute(CREATE_PREDICTION_LOG_TABLE, [])?;
    conn.execute(CREATE_PREDICTION_LOG_SERVED_AT_INDEX, [])?;
    Ok(())
}
