// src/db/schema.rs

//! Database schema definitions and migrations for Entropy
//!
//! This module defines the SQLite schema for all core tables and provides
//! a migration system to evolve the schema over time.

use crate::error::{Error, Result};
use rusqlite::Connection;
use tracing::{debug, info};

/// Current schema version
pub const SCHEMA_VERSION: i32 = 5;

/// Initialize the schema version tracking table
fn init_schema_version(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;
    Ok(())
}

/// Get the current schema version from the database
pub fn get_schema_version(conn: &Connection) -> Result<i32> {
    init_schema_version(conn)?;

    let version = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )?;

    Ok(version)
}

/// Set the schema version
fn set_schema_version(conn: &Connection, version: i32) -> Result<()> {
    conn.execute(
        "INSERT INTO schema_version (version) VALUES (?1)",
        [version],
    )?;
    Ok(())
}

/// Apply all pending migrations to bring the database up to date
pub fn migrate(conn: &Connection) -> Result<()> {
    let current_version = get_schema_version(conn)?;
    debug!("Current schema version: {}", current_version);

    if current_version >= SCHEMA_VERSION {
        return Ok(());
    }

    for version in (current_version + 1)..=SCHEMA_VERSION {
        info!("Applying migration to version {}", version);
        apply_migration(conn, version)?;
        set_schema_version(conn, version)?;
    }

    info!(
        "Schema migration complete. Now at version {}",
        SCHEMA_VERSION
    );
    Ok(())
}

/// Apply a specific migration version
fn apply_migration(conn: &Connection, version: i32) -> Result<()> {
    match version {
        1 => migrate_v1(conn),
        2 => migrate_v2(conn),
        3 => migrate_v3(conn),
        4 => migrate_v4(conn),
        5 => migrate_v5(conn),
        _ => Err(Error::InitError(format!(
            "Unknown migration version: {}",
            version
        ))),
    }
}

/// Initial schema - Version 1
///
/// Creates the package metadata tables:
/// - store_metadata: Store-wide key/value facts (checksum, branch, EAPI)
/// - packages: Atoms with slot, tag and download information
/// - dependencies: Runtime, build and conflict edges
/// - provided_libs / needed_libs: Shared library linkage
/// - package_sets: Named collections of dependency specs
fn migrate_v1(conn: &Connection) -> Result<()> {
    debug!("Creating schema version 1");

    conn.execute_batch(
        "
        CREATE TABLE store_metadata (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        CREATE TABLE packages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            atom TEXT NOT NULL,
            category TEXT NOT NULL,
            name TEXT NOT NULL,
            version TEXT NOT NULL,
            revision INTEGER NOT NULL DEFAULT 0,
            slot TEXT NOT NULL DEFAULT '0',
            tag TEXT NOT NULL DEFAULT '',
            branch TEXT NOT NULL,
            description TEXT,
            download_path TEXT,
            checksum TEXT,
            size INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            UNIQUE(category, name, version, revision, slot, tag)
        );

        CREATE INDEX idx_packages_key ON packages(category, name);
        CREATE INDEX idx_packages_atom ON packages(atom);
        CREATE INDEX idx_packages_tag ON packages(tag);

        CREATE TABLE dependencies (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            package_id INTEGER NOT NULL,
            spec TEXT NOT NULL,
            dep_key TEXT NOT NULL,
            kind TEXT NOT NULL CHECK(kind IN ('runtime', 'build', 'conflict')),
            FOREIGN KEY (package_id) REFERENCES packages(id) ON DELETE CASCADE
        );

        CREATE INDEX idx_dependencies_package ON dependencies(package_id);
        CREATE INDEX idx_dependencies_key ON dependencies(dep_key);

        CREATE TABLE provided_libs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            package_id INTEGER NOT NULL,
            soname TEXT NOT NULL,
            elfclass INTEGER NOT NULL,
            path TEXT NOT NULL,
            FOREIGN KEY (package_id) REFERENCES packages(id) ON DELETE CASCADE
        );

        CREATE INDEX idx_provided_libs_package ON provided_libs(package_id);
        CREATE INDEX idx_provided_libs_soname ON provided_libs(soname, elfclass);

        CREATE TABLE needed_libs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            package_id INTEGER NOT NULL,
            soname TEXT NOT NULL,
            elfclass INTEGER NOT NULL,
            FOREIGN KEY (package_id) REFERENCES packages(id) ON DELETE CASCADE
        );

        CREATE INDEX idx_needed_libs_package ON needed_libs(package_id);
        CREATE INDEX idx_needed_libs_soname ON needed_libs(soname, elfclass);

        CREATE TABLE package_sets (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            set_name TEXT NOT NULL,
            spec TEXT NOT NULL,
            UNIQUE(set_name, spec)
        );
        ",
    )?;

    info!("Schema version 1 created successfully");
    Ok(())
}

/// Schema Version 2: Repository notice board
///
/// Notice ids are AUTOINCREMENT so removed ids are never handed out again.
fn migrate_v2(conn: &Connection) -> Result<()> {
    debug!("Migrating to schema version 2");

    conn.execute_batch(
        "
        CREATE TABLE notices (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            title TEXT NOT NULL,
            body TEXT NOT NULL,
            link TEXT,
            created_at TEXT NOT NULL
        );
        ",
    )?;

    info!("Schema version 2 applied successfully");
    Ok(())
}

/// Schema Version 3: Preserved libraries registry
fn migrate_v3(conn: &Connection) -> Result<()> {
    debug!("Migrating to schema version 3");

    conn.execute_batch(
        "
        CREATE TABLE preserved_libs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            soname TEXT NOT NULL,
            elfclass INTEGER NOT NULL,
            path TEXT NOT NULL UNIQUE,
            atom TEXT NOT NULL,
            preserved_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        );

        CREATE INDEX idx_preserved_libs_soname ON preserved_libs(soname, elfclass);
        ",
    )?;

    info!("Schema version 3 applied successfully");
    Ok(())
}

/// Schema Version 4: Expired package files awaiting cleanup
fn migrate_v4(conn: &Connection) -> Result<()> {
    debug!("Migrating to schema version 4");

    conn.execute_batch(
        "
        CREATE TABLE expired_packages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            atom TEXT NOT NULL,
            download_path TEXT NOT NULL UNIQUE,
            expired_at TEXT NOT NULL
        );

        CREATE INDEX idx_expired_packages_at ON expired_packages(expired_at);
        ",
    )?;

    info!("Schema version 4 applied successfully");
    Ok(())
}

/// Schema Version 5: Repository configuration and client state
///
/// Adds tables only the system database uses:
/// - repositories: Remote sources with current branch and sync state
/// - notice_marks: Client high-water mark per repository notice board
fn migrate_v5(conn: &Connection) -> Result<()> {
    debug!("Migrating to schema version 5");

    conn.execute_batch(
        "
        CREATE TABLE repositories (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            url TEXT NOT NULL,
            enabled INTEGER NOT NULL DEFAULT 1,
            priority INTEGER NOT NULL DEFAULT 0,
            differential_update INTEGER NOT NULL DEFAULT 1,
            branch TEXT NOT NULL,
            checksum TEXT,
            eapi INTEGER,
            last_sync TEXT,
            created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        );

        CREATE INDEX idx_repositories_enabled ON repositories(enabled);
        CREATE INDEX idx_repositories_priority ON repositories(priority);

        CREATE TABLE notice_marks (
            repository TEXT PRIMARY KEY,
            last_read_id INTEGER NOT NULL DEFAULT 0
        );
        ",
    )?;

    info!("Schema version 5 applied successfully");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn create_test_db() -> (NamedTempFile, Connection) {
        let temp_file = NamedTempFile::new().unwrap();
        let conn = Connection::open(temp_file.path()).unwrap();
        (temp_file, conn)
    }

    #[test]
    fn test_schema_version_tracking() {
        let (_temp, conn) = create_test_db();

        let version = get_schema_version(&conn).unwrap();
        assert_eq!(version, 0);

        set_schema_version(&conn, 1).unwrap();
        let version = get_schema_version(&conn).unwrap();
        assert_eq!(version, 1);
    }

    #[test]
    fn test_migrate_creates_all_tables() {
        let (_temp, conn) = create_test_db();

        migrate(&conn).unwrap();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<std::result::Result<Vec<_>, _>>()
            .unwrap();

        for table in [
            "store_metadata",
            "packages",
            "dependencies",
            "provided_libs",
            "needed_libs",
            "package_sets",
            "notices",
            "preserved_libs",
            "expired_packages",
            "repositories",
            "notice_marks",
            "schema_version",
        ] {
            assert!(tables.contains(&table.to_string()), "missing table {}", table);
        }
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let (_temp, conn) = create_test_db();

        migrate(&conn).unwrap();
        let version1 = get_schema_version(&conn).unwrap();

        migrate(&conn).unwrap();
        let version2 = get_schema_version(&conn).unwrap();

        assert_eq!(version1, version2);
        assert_eq!(version1, SCHEMA_VERSION);
    }

    #[test]
    fn test_packages_unique_constraint() {
        let (_temp, conn) = create_test_db();
        migrate(&conn).unwrap();

        let insert = "INSERT INTO packages (atom, category, name, version, branch)
                      VALUES ('app-misc/foo-1.0', 'app-misc', 'foo', '1.0', '5')";
        conn.execute(insert, []).unwrap();
        assert!(conn.execute(insert, []).is_err());
    }

    #[test]
    fn test_dependency_kind_check() {
        let (_temp, conn) = create_test_db();
        conn.execute("PRAGMA foreign_keys = ON", []).unwrap();
        migrate(&conn).unwrap();

        conn.execute(
            "INSERT INTO packages (atom, category, name, version, branch)
             VALUES ('app-misc/foo-1.0', 'app-misc', 'foo', '1.0', '5')",
            [],
        )
        .unwrap();

        let result = conn.execute(
            "INSERT INTO dependencies (package_id, spec, dep_key, kind)
             VALUES (1, 'app-misc/bar', 'app-misc/bar', 'optional')",
            [],
        );
        assert!(result.is_err());

        // Foreign key: no such package
        let result = conn.execute(
            "INSERT INTO dependencies (package_id, spec, dep_key, kind)
             VALUES (999, 'app-misc/bar', 'app-misc/bar', 'runtime')",
            [],
        );
        assert!(result.is_err());
    }
}
