// src/db/mod.rs

//! Database layer for Entropy
//!
//! Every repository store (one per repository, product and branch), the
//! installed packages store and the system database share one SQLite schema.
//! This module handles:
//! - Database initialization and schema creation
//! - Connection management
//! - Transaction handling with lock contention reporting

pub mod models;
pub mod schema;

use crate::error::{Error, Result};
use rusqlite::{Connection, ErrorCode, Transaction, TransactionBehavior};
use std::path::Path;
use tracing::{debug, info};

/// Milliseconds SQLite waits on a locked database before giving up
pub const BUSY_TIMEOUT_MS: u32 = 5000;

/// Initialize a new Entropy database at the specified path
///
/// Creates the database file and brings the schema up to date.
/// This is idempotent - calling it on an existing database is safe.
///
/// # Arguments
///
/// * `db_path` - Path where the database should be created
pub fn init(db_path: &Path) -> Result<()> {
    debug!("Initializing database at: {}", db_path.display());

    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| Error::InitError(format!("Failed to create database directory: {}", e)))?;
    }

    let conn = Connection::open(db_path)?;

    conn.execute_batch(&format!(
        "
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA foreign_keys = ON;
        PRAGMA busy_timeout = {};
        ",
        BUSY_TIMEOUT_MS
    ))?;

    schema::migrate(&conn)?;

    info!("Database initialized at {}", db_path.display());
    Ok(())
}

/// Open an existing Entropy database
///
/// # Arguments
///
/// * `db_path` - Path to the database file
pub fn open(db_path: &Path) -> Result<Connection> {
    if !db_path.exists() {
        return Err(Error::DatabaseNotFound(db_path.display().to_string()));
    }

    let conn = Connection::open(db_path)?;

    conn.execute_batch(&format!(
        "
        PRAGMA foreign_keys = ON;
        PRAGMA busy_timeout = {};
        ",
        BUSY_TIMEOUT_MS
    ))?;

    Ok(conn)
}

/// Open a database, creating and migrating it first when missing
pub fn open_or_init(db_path: &Path) -> Result<Connection> {
    if !db_path.exists() {
        init(db_path)?;
    }
    let conn = open(db_path)?;
    schema::migrate(&conn)?;
    Ok(conn)
}

/// Whether a SQLite error means another connection holds the write lock
pub fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == ErrorCode::DatabaseBusy || e.code == ErrorCode::DatabaseLocked
    )
}

/// Run `f` inside an immediate (write-locking) transaction
///
/// The transaction commits when `f` returns `Ok` and rolls back otherwise.
/// A busy database surfaces as `Error::LockContention`.
pub fn transaction<T, F>(conn: &mut Connection, f: F) -> Result<T>
where
    F: FnOnce(&Transaction) -> Result<T>,
{
    let name = conn.path().unwrap_or("memory").to_string();
    let busy = |e: rusqlite::Error| {
        if is_busy(&e) {
            Error::LockContention {
                repository: name.clone(),
            }
        } else {
            Error::Database(e)
        }
    };

    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(busy)?;

    let value = f(&tx)?;
    tx.commit().map_err(busy)?;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_init_creates_database() {
        let temp_file = NamedTempFile::new().unwrap();
        let db_path = temp_file.path().to_path_buf();

        // Remove the temp file so init can create it
        drop(temp_file);

        let result = init(&db_path);
        assert!(result.is_ok());
        assert!(db_path.exists());
    }

    #[test]
    fn test_open_existing_database() {
        let temp_file = NamedTempFile::new().unwrap();

        init(temp_file.path()).unwrap();

        let result = open(temp_file.path());
        assert!(result.is_ok());
    }

    #[test]
    fn test_open_nonexistent_database() {
        let result = open(Path::new("/nonexistent/path/db.sqlite"));
        assert!(result.is_err());
        assert!(matches!(result.unwrap_err(), Error::DatabaseNotFound(_)));
    }

    #[test]
    fn test_transaction_rolls_back_on_error() {
        let temp_file = NamedTempFile::new().unwrap();
        init(temp_file.path()).unwrap();
        let mut conn = open(temp_file.path()).unwrap();

        let result: Result<()> = transaction(&mut conn, |tx| {
            tx.execute(
                "INSERT INTO store_metadata (key, value) VALUES ('checksum', 'abc')",
                [],
            )?;
            Err(Error::Cancelled)
        });
        assert!(matches!(result, Err(Error::Cancelled)));

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM store_metadata", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }
}
