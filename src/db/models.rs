// src/db/models.rs

//! Data models for Entropy database entities
//!
//! This module defines Rust structs that correspond to database tables
//! and provides methods for creating, reading, updating, and deleting records.

use crate::atom::{Atom, DepSpec};
use crate::error::{Error, Result};
use crate::version::Version;
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::str::FromStr;

/// Build the error rusqlite expects from a row conversion failure
fn conversion_error(column: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        column,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

/// Current time as an RFC 3339 string
pub fn current_timestamp() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Store-wide key/value facts (checksum, branch, EAPI of the last update)
pub struct StoreMetadata;

impl StoreMetadata {
    pub const CHECKSUM: &'static str = "checksum";
    pub const BRANCH: &'static str = "branch";
    pub const EAPI: &'static str = "eapi";

    /// Read a metadata value
    pub fn get(conn: &Connection, key: &str) -> Result<Option<String>> {
        let value = conn
            .query_row(
                "SELECT value FROM store_metadata WHERE key = ?1",
                [key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    /// Write a metadata value, replacing any previous one
    pub fn set(conn: &Connection, key: &str, value: &str) -> Result<()> {
        conn.execute(
            "INSERT INTO store_metadata (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    /// Remove a metadata value
    pub fn remove(conn: &Connection, key: &str) -> Result<()> {
        conn.execute("DELETE FROM store_metadata WHERE key = ?1", [key])?;
        Ok(())
    }
}

const PACKAGE_COLUMNS: &str = "id, category, name, version, revision, slot, tag, branch, \
                               description, download_path, checksum, size, created_at";

/// A package stored in a repository (or installed packages) store
#[derive(Debug, Clone)]
pub struct Package {
    pub id: Option<i64>,
    pub atom: Atom,
    pub branch: String,
    pub description: Option<String>,
    pub download_path: Option<String>,
    pub checksum: Option<String>,
    pub size: i64,
    pub created_at: Option<String>,
}

/// Substring LIKE pattern matching `text` literally
fn like_pattern(text: &str) -> String {
    let mut pattern = String::with_capacity(text.len() + 2);
    pattern.push('%');
    for c in text.chars() {
        if matches!(c, '%' | '_' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}

impl Package {
    /// Create a new Package
    pub fn new(atom: Atom, branch: String) -> Self {
        Self {
            id: None,
            atom,
            branch,
            description: None,
            download_path: None,
            checksum: None,
            size: 0,
            created_at: None,
        }
    }

    /// Insert this package into the database
    pub fn insert(&mut self, conn: &Connection) -> Result<i64> {
        conn.execute(
            "INSERT INTO packages
             (atom, category, name, version, revision, slot, tag, branch, description, download_path, checksum, size)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                self.atom.to_string(),
                &self.atom.category,
                &self.atom.name,
                self.atom.version.as_str(),
                self.atom.revision,
                &self.atom.slot,
                self.atom.tag.as_deref().unwrap_or(""),
                &self.branch,
                &self.description,
                &self.download_path,
                &self.checksum,
                &self.size,
            ],
        )?;

        let id = conn.last_insert_rowid();
        self.id = Some(id);
        Ok(id)
    }

    /// Find a package by ID
    pub fn find_by_id(conn: &Connection, id: i64) -> Result<Option<Self>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM packages WHERE id = ?1",
            PACKAGE_COLUMNS
        ))?;

        let package = stmt.query_row([id], Self::from_row).optional()?;

        Ok(package)
    }

    /// Find all packages sharing a key (`category/name`), any version
    pub fn find_by_key(conn: &Connection, key: &str) -> Result<Vec<Self>> {
        let (category, name) = key
            .split_once('/')
            .ok_or_else(|| Error::ParseError(format!("Invalid package key: {}", key)))?;

        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM packages WHERE category = ?1 AND name = ?2 ORDER BY id",
            PACKAGE_COLUMNS
        ))?;

        let packages = stmt
            .query_map([category, name], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(packages)
    }

    /// Find the package matching an atom exactly (version, revision, slot and tag)
    pub fn find_by_atom(conn: &Connection, atom: &Atom) -> Result<Option<Self>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM packages
             WHERE category = ?1 AND name = ?2 AND version = ?3 AND revision = ?4
               AND slot = ?5 AND tag = ?6",
            PACKAGE_COLUMNS
        ))?;

        let package = stmt
            .query_row(
                params![
                    &atom.category,
                    &atom.name,
                    atom.version.as_str(),
                    atom.revision,
                    &atom.slot,
                    atom.tag.as_deref().unwrap_or(""),
                ],
                Self::from_row,
            )
            .optional()?;

        Ok(package)
    }

    /// Find packages carrying the given tag
    pub fn find_by_tag(conn: &Connection, tag: &str) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM packages WHERE tag = ?1 ORDER BY category, name",
            PACKAGE_COLUMNS
        ))?;

        let packages = stmt
            .query_map([tag], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(packages)
    }

    /// List all packages
    pub fn list_all(conn: &Connection) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM packages ORDER BY category, name, id",
            PACKAGE_COLUMNS
        ))?;

        let packages = stmt
            .query_map([], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(packages)
    }

    /// Search packages whose atom contains the pattern
    pub fn search(conn: &Connection, pattern: &str) -> Result<Vec<Self>> {
        let search_pattern = like_pattern(pattern);
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM packages WHERE atom LIKE ?1 ESCAPE '\\' ORDER BY category, name, id",
            PACKAGE_COLUMNS
        ))?;

        let packages = stmt
            .query_map([&search_pattern], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(packages)
    }

    /// Search packages whose description contains the pattern
    pub fn search_description(conn: &Connection, pattern: &str) -> Result<Vec<Self>> {
        let search_pattern = like_pattern(pattern);
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM packages WHERE description LIKE ?1 ESCAPE '\\' ORDER BY category, name, id",
            PACKAGE_COLUMNS
        ))?;

        let packages = stmt
            .query_map([&search_pattern], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(packages)
    }

    /// Number of packages in the store
    pub fn count(conn: &Connection) -> Result<i64> {
        let count = conn.query_row("SELECT COUNT(*) FROM packages", [], |row| row.get(0))?;
        Ok(count)
    }

    /// Whether any package still ships the given download path
    pub fn has_download_path(conn: &Connection, download_path: &str) -> Result<bool> {
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM packages WHERE download_path = ?1",
            [download_path],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Re-tag every package with a new branch (used after a branch copy)
    pub fn set_branch_all(conn: &Connection, branch: &str) -> Result<usize> {
        let changed = conn.execute("UPDATE packages SET branch = ?1", [branch])?;
        Ok(changed)
    }

    /// Delete a package by ID
    pub fn delete(conn: &Connection, id: i64) -> Result<()> {
        conn.execute("DELETE FROM packages WHERE id = ?1", [id])?;
        Ok(())
    }

    /// Convert a database row to a Package
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        let version_str: String = row.get(3)?;
        let version = Version::parse(&version_str).map_err(|e| conversion_error(3, e.to_string()))?;
        let tag: String = row.get(6)?;

        Ok(Self {
            id: Some(row.get(0)?),
            atom: Atom {
                category: row.get(1)?,
                name: row.get(2)?,
                version,
                revision: row.get(4)?,
                slot: row.get(5)?,
                tag: if tag.is_empty() { None } else { Some(tag) },
            },
            branch: row.get(7)?,
            description: row.get(8)?,
            download_path: row.get(9)?,
            checksum: row.get(10)?,
            size: row.get(11)?,
            created_at: row.get(12)?,
        })
    }
}

/// Kind of dependency edge
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum DependencyKind {
    Runtime,
    Build,
    Conflict,
}

impl DependencyKind {
    pub fn as_str(&self) -> &str {
        match self {
            DependencyKind::Runtime => "runtime",
            DependencyKind::Build => "build",
            DependencyKind::Conflict => "conflict",
        }
    }
}

impl FromStr for DependencyKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "runtime" => Ok(DependencyKind::Runtime),
            "build" => Ok(DependencyKind::Build),
            "conflict" => Ok(DependencyKind::Conflict),
            _ => Err(format!("Invalid dependency kind: {}", s)),
        }
    }
}

/// Dependency entry linking a package to a dependency specification
#[derive(Debug, Clone)]
pub struct DependencyEntry {
    pub id: Option<i64>,
    pub package_id: i64,
    pub spec: String,
    pub dep_key: String,
    pub kind: DependencyKind,
}

impl DependencyEntry {
    /// Create a new DependencyEntry
    pub fn new(package_id: i64, spec: &DepSpec, kind: DependencyKind) -> Self {
        Self {
            id: None,
            package_id,
            spec: spec.to_string(),
            dep_key: spec.key.clone(),
            kind,
        }
    }

    /// Parse the stored specification
    pub fn dep_spec(&self) -> Result<DepSpec> {
        DepSpec::parse(&self.spec)
    }

    /// Insert this dependency into the database
    pub fn insert(&mut self, conn: &Connection) -> Result<i64> {
        conn.execute(
            "INSERT INTO dependencies (package_id, spec, dep_key, kind) VALUES (?1, ?2, ?3, ?4)",
            params![
                &self.package_id,
                &self.spec,
                &self.dep_key,
                self.kind.as_str(),
            ],
        )?;

        let id = conn.last_insert_rowid();
        self.id = Some(id);
        Ok(id)
    }

    /// Find all dependencies for a package
    pub fn find_by_package(conn: &Connection, package_id: i64) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(
            "SELECT id, package_id, spec, dep_key, kind FROM dependencies
             WHERE package_id = ?1 ORDER BY id",
        )?;

        let deps = stmt
            .query_map([package_id], Self::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(deps)
    }

    /// Find all non-conflict edges pointing at a package key (reverse dependencies)
    pub fn find_dependents(conn: &Connection, key: &str) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(
            "SELECT id, package_id, spec, dep_key, kind FROM dependencies
             WHERE dep_key = ?1 AND kind != 'conflict' ORDER BY package_id, id",
        )?;

        let deps = stmt
            .query_map([key], Self::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(deps)
    }

    /// Convert a database row to a DependencyEntry
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        let kind_str: String = row.get(4)?;
        let kind = kind_str
            .parse::<DependencyKind>()
            .map_err(|e| conversion_error(4, e))?;

        Ok(Self {
            id: Some(row.get(0)?),
            package_id: row.get(1)?,
            spec: row.get(2)?,
            dep_key: row.get(3)?,
            kind,
        })
    }
}

/// A shared library a package ships
#[derive(Debug, Clone)]
pub struct ProvidedLibrary {
    pub id: Option<i64>,
    pub package_id: i64,
    pub soname: String,
    pub elfclass: i32,
    pub path: String,
}

impl ProvidedLibrary {
    /// Create a new ProvidedLibrary
    pub fn new(package_id: i64, soname: String, elfclass: i32, path: String) -> Self {
        Self {
            id: None,
            package_id,
            soname,
            elfclass,
            path,
        }
    }

    /// Insert this library into the database
    pub fn insert(&mut self, conn: &Connection) -> Result<i64> {
        conn.execute(
            "INSERT INTO provided_libs (package_id, soname, elfclass, path) VALUES (?1, ?2, ?3, ?4)",
            params![&self.package_id, &self.soname, &self.elfclass, &self.path],
        )?;

        let id = conn.last_insert_rowid();
        self.id = Some(id);
        Ok(id)
    }

    /// Libraries shipped by a package
    pub fn find_by_package(conn: &Connection, package_id: i64) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(
            "SELECT id, package_id, soname, elfclass, path FROM provided_libs
             WHERE package_id = ?1 ORDER BY path",
        )?;

        let libs = stmt
            .query_map([package_id], Self::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(libs)
    }

    /// Every package providing a soname for an ELF class
    pub fn find_providers(conn: &Connection, soname: &str, elfclass: i32) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(
            "SELECT id, package_id, soname, elfclass, path FROM provided_libs
             WHERE soname = ?1 AND elfclass = ?2 ORDER BY package_id",
        )?;

        let libs = stmt
            .query_map(params![soname, elfclass], Self::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(libs)
    }

    /// Convert a database row to a ProvidedLibrary
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: Some(row.get(0)?),
            package_id: row.get(1)?,
            soname: row.get(2)?,
            elfclass: row.get(3)?,
            path: row.get(4)?,
        })
    }
}

/// A shared library a package links against
#[derive(Debug, Clone)]
pub struct NeededLibrary {
    pub id: Option<i64>,
    pub package_id: i64,
    pub soname: String,
    pub elfclass: i32,
}

impl NeededLibrary {
    /// Create a new NeededLibrary
    pub fn new(package_id: i64, soname: String, elfclass: i32) -> Self {
        Self {
            id: None,
            package_id,
            soname,
            elfclass,
        }
    }

    /// Insert this library requirement into the database
    pub fn insert(&mut self, conn: &Connection) -> Result<i64> {
        conn.execute(
            "INSERT INTO needed_libs (package_id, soname, elfclass) VALUES (?1, ?2, ?3)",
            params![&self.package_id, &self.soname, &self.elfclass],
        )?;

        let id = conn.last_insert_rowid();
        self.id = Some(id);
        Ok(id)
    }

    /// Sonames a package requires
    pub fn find_by_package(conn: &Connection, package_id: i64) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(
            "SELECT id, package_id, soname, elfclass FROM needed_libs
             WHERE package_id = ?1 ORDER BY soname, elfclass",
        )?;

        let libs = stmt
            .query_map([package_id], Self::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(libs)
    }

    /// Package ids needing a soname; `elfclass` of `None` matches any class
    pub fn find_consumers(
        conn: &Connection,
        soname: &str,
        elfclass: Option<i32>,
    ) -> Result<Vec<i64>> {
        let mut stmt = conn.prepare(
            "SELECT DISTINCT package_id FROM needed_libs
             WHERE soname = ?1 AND (?2 IS NULL OR elfclass = ?2) ORDER BY package_id",
        )?;

        let ids = stmt
            .query_map(params![soname, elfclass], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<i64>>>()?;

        Ok(ids)
    }

    /// Every requirement in the store
    pub fn list_all(conn: &Connection) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(
            "SELECT id, package_id, soname, elfclass FROM needed_libs
             ORDER BY package_id, soname, elfclass",
        )?;

        let libs = stmt
            .query_map([], Self::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(libs)
    }

    /// Convert a database row to a NeededLibrary
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: Some(row.get(0)?),
            package_id: row.get(1)?,
            soname: row.get(2)?,
            elfclass: row.get(3)?,
        })
    }
}

/// Member of a named package set
#[derive(Debug, Clone)]
pub struct PackageSet {
    pub id: Option<i64>,
    pub set_name: String,
    pub spec: String,
}

impl PackageSet {
    /// Create a new PackageSet member
    pub fn new(set_name: String, spec: String) -> Self {
        Self {
            id: None,
            set_name,
            spec,
        }
    }

    /// Insert this set member, ignoring duplicates
    pub fn insert(&mut self, conn: &Connection) -> Result<i64> {
        conn.execute(
            "INSERT OR IGNORE INTO package_sets (set_name, spec) VALUES (?1, ?2)",
            params![&self.set_name, &self.spec],
        )?;

        let id = conn.query_row(
            "SELECT id FROM package_sets WHERE set_name = ?1 AND spec = ?2",
            params![&self.set_name, &self.spec],
            |row| row.get(0),
        )?;
        self.id = Some(id);
        Ok(id)
    }

    /// Members of a set
    pub fn find_by_name(conn: &Connection, set_name: &str) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(
            "SELECT id, set_name, spec FROM package_sets WHERE set_name = ?1 ORDER BY spec",
        )?;

        let members = stmt
            .query_map([set_name], Self::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(members)
    }

    /// Every set member in the store
    pub fn list_all(conn: &Connection) -> Result<Vec<Self>> {
        let mut stmt =
            conn.prepare("SELECT id, set_name, spec FROM package_sets ORDER BY set_name, spec")?;

        let members = stmt
            .query_map([], Self::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(members)
    }

    /// Remove every set
    pub fn delete_all(conn: &Connection) -> Result<()> {
        conn.execute("DELETE FROM package_sets", [])?;
        Ok(())
    }

    /// Convert a database row to a PackageSet
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: Some(row.get(0)?),
            set_name: row.get(1)?,
            spec: row.get(2)?,
        })
    }
}

/// An operator message published on a repository notice board
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Notice {
    pub id: Option<i64>,
    pub title: String,
    pub body: String,
    pub link: Option<String>,
    pub created_at: String,
}

impl Notice {
    /// Create a new Notice stamped with the current time
    pub fn new(title: String, body: String, link: Option<String>) -> Self {
        Self {
            id: None,
            title,
            body,
            link,
            created_at: current_timestamp(),
        }
    }

    /// Insert this notice, letting the store assign the next id
    pub fn insert(&mut self, conn: &Connection) -> Result<i64> {
        conn.execute(
            "INSERT INTO notices (title, body, link, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![&self.title, &self.body, &self.link, &self.created_at],
        )?;

        let id = conn.last_insert_rowid();
        self.id = Some(id);
        Ok(id)
    }

    /// Insert or replace this notice keeping its id (mirrors a remote board)
    pub fn upsert(&self, conn: &Connection) -> Result<()> {
        let id = self
            .id
            .ok_or_else(|| Error::InitError("Cannot upsert notice without ID".to_string()))?;

        conn.execute(
            "INSERT INTO notices (id, title, body, link, created_at) VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET title = excluded.title, body = excluded.body,
                 link = excluded.link, created_at = excluded.created_at",
            params![id, &self.title, &self.body, &self.link, &self.created_at],
        )?;
        Ok(())
    }

    /// Find a notice by ID
    pub fn find_by_id(conn: &Connection, id: i64) -> Result<Option<Self>> {
        let mut stmt = conn.prepare(
            "SELECT id, title, body, link, created_at FROM notices WHERE id = ?1",
        )?;

        let notice = stmt.query_row([id], Self::from_row).optional()?;

        Ok(notice)
    }

    /// List all notices, oldest first
    pub fn list_all(conn: &Connection) -> Result<Vec<Self>> {
        Self::list_after(conn, 0)
    }

    /// List notices with an id greater than `id`
    pub fn list_after(conn: &Connection, id: i64) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(
            "SELECT id, title, body, link, created_at FROM notices WHERE id > ?1 ORDER BY id",
        )?;

        let notices = stmt
            .query_map([id], Self::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(notices)
    }

    /// Delete a notice; returns whether it existed
    pub fn delete(conn: &Connection, id: i64) -> Result<bool> {
        let removed = conn.execute("DELETE FROM notices WHERE id = ?1", [id])?;
        Ok(removed > 0)
    }

    /// Convert a database row to a Notice
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: Some(row.get(0)?),
            title: row.get(1)?,
            body: row.get(2)?,
            link: row.get(3)?,
            created_at: row.get(4)?,
        })
    }
}

/// A library kept on disk after its owner went away
#[derive(Debug, Clone)]
pub struct PreservedLibrary {
    pub id: Option<i64>,
    pub soname: String,
    pub elfclass: i32,
    pub path: String,
    pub atom: String,
    pub preserved_at: Option<String>,
}

impl PreservedLibrary {
    /// Create a new PreservedLibrary
    pub fn new(soname: String, elfclass: i32, path: String, atom: String) -> Self {
        Self {
            id: None,
            soname,
            elfclass,
            path,
            atom,
            preserved_at: None,
        }
    }

    /// Register this library; an existing entry for the same path is replaced
    pub fn insert(&mut self, conn: &Connection) -> Result<i64> {
        conn.execute(
            "INSERT INTO preserved_libs (soname, elfclass, path, atom) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(path) DO UPDATE SET soname = excluded.soname,
                 elfclass = excluded.elfclass, atom = excluded.atom",
            params![&self.soname, &self.elfclass, &self.path, &self.atom],
        )?;

        let id = conn.query_row(
            "SELECT id FROM preserved_libs WHERE path = ?1",
            [&self.path],
            |row| row.get(0),
        )?;
        self.id = Some(id);
        Ok(id)
    }

    /// Every preserved library
    pub fn list_all(conn: &Connection) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(
            "SELECT id, soname, elfclass, path, atom, preserved_at FROM preserved_libs
             ORDER BY soname, elfclass, path",
        )?;

        let libs = stmt
            .query_map([], Self::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(libs)
    }

    /// Preserved libraries providing a soname for an ELF class
    pub fn find_by_soname(conn: &Connection, soname: &str, elfclass: i32) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(
            "SELECT id, soname, elfclass, path, atom, preserved_at FROM preserved_libs
             WHERE soname = ?1 AND elfclass = ?2 ORDER BY path",
        )?;

        let libs = stmt
            .query_map(params![soname, elfclass], Self::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(libs)
    }

    /// Drop the registry entry for a path
    pub fn delete_by_path(conn: &Connection, path: &str) -> Result<()> {
        conn.execute("DELETE FROM preserved_libs WHERE path = ?1", [path])?;
        Ok(())
    }

    /// Convert a database row to a PreservedLibrary
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: Some(row.get(0)?),
            soname: row.get(1)?,
            elfclass: row.get(2)?,
            path: row.get(3)?,
            atom: row.get(4)?,
            preserved_at: row.get(5)?,
        })
    }
}

/// A package file dropped from a repository, awaiting cleanup
#[derive(Debug, Clone)]
pub struct ExpiredPackage {
    pub id: Option<i64>,
    pub atom: String,
    pub download_path: String,
    pub expired_at: String,
}

impl ExpiredPackage {
    /// Create a new ExpiredPackage stamped with the current time
    pub fn new(atom: String, download_path: String) -> Self {
        Self {
            id: None,
            atom,
            download_path,
            expired_at: current_timestamp(),
        }
    }

    /// Record the expiry; the first recorded time for a path wins
    pub fn insert(&mut self, conn: &Connection) -> Result<i64> {
        conn.execute(
            "INSERT INTO expired_packages (atom, download_path, expired_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(download_path) DO NOTHING",
            params![&self.atom, &self.download_path, &self.expired_at],
        )?;

        let (id, expired_at) = conn.query_row(
            "SELECT id, expired_at FROM expired_packages WHERE download_path = ?1",
            [&self.download_path],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        self.id = Some(id);
        self.expired_at = expired_at;
        Ok(id)
    }

    /// Every expiry record, oldest first
    pub fn list_all(conn: &Connection) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(
            "SELECT id, atom, download_path, expired_at FROM expired_packages
             ORDER BY expired_at, id",
        )?;

        let expired = stmt
            .query_map([], Self::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(expired)
    }

    /// Forget an expiry record (the package came back or was cleaned up)
    pub fn delete_by_path(conn: &Connection, download_path: &str) -> Result<()> {
        conn.execute(
            "DELETE FROM expired_packages WHERE download_path = ?1",
            [download_path],
        )?;
        Ok(())
    }

    /// Convert a database row to an ExpiredPackage
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: Some(row.get(0)?),
            atom: row.get(1)?,
            download_path: row.get(2)?,
            expired_at: row.get(3)?,
        })
    }
}

const REPOSITORY_COLUMNS: &str = "id, name, url, enabled, priority, differential_update, branch, \
                                  checksum, eapi, last_sync, created_at";

/// Repository represents a configured remote package source
#[derive(Debug, Clone)]
pub struct Repository {
    pub id: Option<i64>,
    pub name: String,
    pub url: String,
    pub enabled: bool,
    pub priority: i32,
    pub differential_update: bool,
    pub branch: String,
    pub checksum: Option<String>,
    pub eapi: Option<i32>,
    pub last_sync: Option<String>,
    pub created_at: Option<String>,
}

impl Repository {
    /// Create a new Repository on the given branch
    pub fn new(name: String, url: String, branch: String) -> Self {
        Self {
            id: None,
            name,
            url,
            enabled: true,
            priority: 0,
            differential_update: true,
            branch,
            checksum: None,
            eapi: None,
            last_sync: None,
            created_at: None,
        }
    }

    /// Insert this repository into the database
    pub fn insert(&mut self, conn: &Connection) -> Result<i64> {
        conn.execute(
            "INSERT INTO repositories (name, url, enabled, priority, differential_update, branch)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                &self.name,
                &self.url,
                self.enabled as i32,
                &self.priority,
                self.differential_update as i32,
                &self.branch,
            ],
        )?;

        let id = conn.last_insert_rowid();
        self.id = Some(id);
        Ok(id)
    }

    /// Find a repository by name
    pub fn find_by_name(conn: &Connection, name: &str) -> Result<Option<Self>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM repositories WHERE name = ?1",
            REPOSITORY_COLUMNS
        ))?;

        let repo = stmt.query_row([name], Self::from_row).optional()?;

        Ok(repo)
    }

    /// List all repositories
    pub fn list_all(conn: &Connection) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM repositories ORDER BY priority DESC, name",
            REPOSITORY_COLUMNS
        ))?;

        let repos = stmt
            .query_map([], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(repos)
    }

    /// List enabled repositories
    pub fn list_enabled(conn: &Connection) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM repositories WHERE enabled = 1 ORDER BY priority DESC, name",
            REPOSITORY_COLUMNS
        ))?;

        let repos = stmt
            .query_map([], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(repos)
    }

    /// Update repository metadata
    pub fn update(&self, conn: &Connection) -> Result<()> {
        let id = self.id.ok_or_else(|| {
            Error::InitError("Cannot update repository without ID".to_string())
        })?;

        conn.execute(
            "UPDATE repositories SET name = ?1, url = ?2, enabled = ?3, priority = ?4,
             differential_update = ?5, branch = ?6, checksum = ?7, eapi = ?8, last_sync = ?9
             WHERE id = ?10",
            params![
                &self.name,
                &self.url,
                self.enabled as i32,
                &self.priority,
                self.differential_update as i32,
                &self.branch,
                &self.checksum,
                &self.eapi,
                &self.last_sync,
                id,
            ],
        )?;

        Ok(())
    }

    /// Delete a repository by ID
    pub fn delete(conn: &Connection, id: i64) -> Result<()> {
        conn.execute("DELETE FROM repositories WHERE id = ?1", [id])?;
        Ok(())
    }

    /// Convert a database row to a Repository
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: Some(row.get(0)?),
            name: row.get(1)?,
            url: row.get(2)?,
            enabled: row.get::<_, i32>(3)? != 0,
            priority: row.get(4)?,
            differential_update: row.get::<_, i32>(5)? != 0,
            branch: row.get(6)?,
            checksum: row.get(7)?,
            eapi: row.get(8)?,
            last_sync: row.get(9)?,
            created_at: row.get(10)?,
        })
    }
}

/// Client-side notice board high-water marks
pub struct NoticeMark;

impl NoticeMark {
    /// Highest notice id the client has read for a repository
    pub fn get(conn: &Connection, repository: &str) -> Result<i64> {
        let mark = conn
            .query_row(
                "SELECT last_read_id FROM notice_marks WHERE repository = ?1",
                [repository],
                |row| row.get(0),
            )
            .optional()?;
        Ok(mark.unwrap_or(0))
    }

    /// Move the mark forward to `id`; it never moves backwards
    pub fn advance(conn: &Connection, repository: &str, id: i64) -> Result<i64> {
        conn.execute(
            "INSERT INTO notice_marks (repository, last_read_id) VALUES (?1, ?2)
             ON CONFLICT(repository) DO UPDATE
                 SET last_read_id = MAX(last_read_id, excluded.last_read_id)",
            params![repository, id],
        )?;
        Self::get(conn, repository)
    }
}
