// src/store.rs

//! Repository store contents
//!
//! A store is one SQLite database holding the packages of a repository on a
//! branch (or the installed packages of a system). This module moves whole
//! packages in and out of a store and produces the canonical snapshot that
//! repository checksums, full downloads and deltas are computed from.

use crate::atom::{Atom, DepSpec};
use crate::db::models::{
    DependencyEntry, DependencyKind, NeededLibrary, Notice, Package, PackageSet, ProvidedLibrary,
    StoreMetadata,
};
use crate::error::Result;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Dependency edge as exchanged in snapshots and deltas
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DependencyRecord {
    pub spec: String,
    pub kind: DependencyKind,
}

/// A library shipped by a package
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProvidedLibraryRecord {
    pub soname: String,
    pub elfclass: i32,
    pub path: String,
}

/// A library a package links against
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NeededLibraryRecord {
    pub soname: String,
    pub elfclass: i32,
}

/// A package with everything attached to it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageRecord {
    /// Qualified atom (`category/name-version[-rN]:slot[#tag]`)
    pub atom: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub download_path: Option<String>,
    #[serde(default)]
    pub checksum: Option<String>,
    #[serde(default)]
    pub size: i64,
    #[serde(default)]
    pub dependencies: Vec<DependencyRecord>,
    #[serde(default)]
    pub provided_libs: Vec<ProvidedLibraryRecord>,
    #[serde(default)]
    pub needed_libs: Vec<NeededLibraryRecord>,
}

impl PackageRecord {
    /// Create a record with no metadata besides its atom
    pub fn new(atom: &str) -> Self {
        Self {
            atom: atom.to_string(),
            description: None,
            download_path: None,
            checksum: None,
            size: 0,
            dependencies: Vec::new(),
            provided_libs: Vec::new(),
            needed_libs: Vec::new(),
        }
    }

    /// Add a dependency edge
    pub fn depends(mut self, spec: &str, kind: DependencyKind) -> Self {
        self.dependencies.push(DependencyRecord {
            spec: spec.to_string(),
            kind,
        });
        self
    }

    /// Add a provided library
    pub fn provides(mut self, soname: &str, elfclass: i32, path: &str) -> Self {
        self.provided_libs.push(ProvidedLibraryRecord {
            soname: soname.to_string(),
            elfclass,
            path: path.to_string(),
        });
        self
    }

    /// Add a needed library
    pub fn needs(mut self, soname: &str, elfclass: i32) -> Self {
        self.needed_libs.push(NeededLibraryRecord {
            soname: soname.to_string(),
            elfclass,
        });
        self
    }

    /// Normalize atom and spec spelling and sort attached lists so equal
    /// packages serialize identically
    fn canonicalize(&mut self) {
        if let Ok(atom) = Atom::parse(&self.atom) {
            self.atom = atom.qualified();
        }
        for dep in &mut self.dependencies {
            if let Ok(spec) = DepSpec::parse(&dep.spec) {
                dep.spec = spec.to_string();
            }
        }
        self.dependencies.sort();
        self.dependencies.dedup();
        self.provided_libs.sort();
        self.provided_libs.dedup();
        self.needed_libs.sort();
        self.needed_libs.dedup();
    }
}

/// Everything a repository store publishes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub packages: Vec<PackageRecord>,
    #[serde(default)]
    pub notices: Vec<Notice>,
    #[serde(default)]
    pub sets: BTreeMap<String, Vec<String>>,
}

impl StoreSnapshot {
    /// Put packages, notices and set members in canonical order
    pub fn canonicalize(&mut self) {
        for package in &mut self.packages {
            package.canonicalize();
        }
        self.packages.sort_by(|a, b| a.atom.cmp(&b.atom));
        self.packages.dedup_by(|a, b| a.atom == b.atom);
        self.notices.sort_by_key(|n| n.id);
        for members in self.sets.values_mut() {
            members.sort();
            members.dedup();
        }
    }

    /// Hex SHA-256 of the canonical JSON form
    pub fn checksum(&self) -> String {
        let mut canonical = self.clone();
        canonical.canonicalize();

        // Serializing plain data into a Vec cannot fail
        let bytes = serde_json::to_vec(&canonical).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        format!("{:x}", hasher.finalize())
    }
}

/// Insert a package and all its edges and libraries
pub fn add_package(conn: &Connection, branch: &str, record: &PackageRecord) -> Result<i64> {
    let atom = Atom::parse(&record.atom)?;

    let mut package = Package::new(atom, branch.to_string());
    package.description = record.description.clone();
    package.download_path = record.download_path.clone();
    package.checksum = record.checksum.clone();
    package.size = record.size;
    let package_id = package.insert(conn)?;

    for dep in &record.dependencies {
        let spec = DepSpec::parse(&dep.spec)?;
        DependencyEntry::new(package_id, &spec, dep.kind).insert(conn)?;
    }
    for lib in &record.provided_libs {
        ProvidedLibrary::new(package_id, lib.soname.clone(), lib.elfclass, lib.path.clone())
            .insert(conn)?;
    }
    for lib in &record.needed_libs {
        NeededLibrary::new(package_id, lib.soname.clone(), lib.elfclass).insert(conn)?;
    }

    debug!("Added package {} (id {})", record.atom, package_id);
    Ok(package_id)
}

/// Rebuild the full record of a stored package
pub fn package_record(conn: &Connection, package: &Package) -> Result<PackageRecord> {
    let package_id = package.id.unwrap_or_default();

    let dependencies = DependencyEntry::find_by_package(conn, package_id)?
        .into_iter()
        .map(|d| DependencyRecord {
            spec: d.spec,
            kind: d.kind,
        })
        .collect();
    let provided_libs = ProvidedLibrary::find_by_package(conn, package_id)?
        .into_iter()
        .map(|l| ProvidedLibraryRecord {
            soname: l.soname,
            elfclass: l.elfclass,
            path: l.path,
        })
        .collect();
    let needed_libs = NeededLibrary::find_by_package(conn, package_id)?
        .into_iter()
        .map(|l| NeededLibraryRecord {
            soname: l.soname,
            elfclass: l.elfclass,
        })
        .collect();

    let mut record = PackageRecord {
        atom: package.atom.qualified(),
        description: package.description.clone(),
        download_path: package.download_path.clone(),
        checksum: package.checksum.clone(),
        size: package.size,
        dependencies,
        provided_libs,
        needed_libs,
    };
    record.canonicalize();
    Ok(record)
}

/// Remove the package with this qualified atom, if present
///
/// Returns the removed package.
pub fn remove_by_atom(conn: &Connection, qualified: &str) -> Result<Option<Package>> {
    let atom = Atom::parse(qualified)?;
    let Some(package) = Package::find_by_atom(conn, &atom)? else {
        return Ok(None);
    };
    if let Some(id) = package.id {
        Package::delete(conn, id)?;
    }
    Ok(Some(package))
}

/// Insert or replace a package keyed by its qualified atom
pub fn upsert_package(conn: &Connection, branch: &str, record: &PackageRecord) -> Result<i64> {
    remove_by_atom(conn, &record.atom)?;
    add_package(conn, branch, record)
}

/// Canonical snapshot of a store
pub fn snapshot(conn: &Connection) -> Result<StoreSnapshot> {
    let packages = Package::list_all(conn)?
        .iter()
        .map(|p| package_record(conn, p))
        .collect::<Result<Vec<_>>>()?;

    let mut sets: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for member in PackageSet::list_all(conn)? {
        sets.entry(member.set_name).or_default().push(member.spec);
    }

    let mut snapshot = StoreSnapshot {
        packages,
        notices: Notice::list_all(conn)?,
        sets,
    };
    snapshot.canonicalize();
    Ok(snapshot)
}

/// Replace the whole store content with a snapshot
///
/// Returns the packages present before but absent afterwards.
pub fn import_snapshot(
    conn: &Connection,
    branch: &str,
    snapshot: &StoreSnapshot,
) -> Result<Vec<Package>> {
    let mut canonical = snapshot.clone();
    canonical.canonicalize();
    let incoming: BTreeSet<&str> = canonical.packages.iter().map(|p| p.atom.as_str()).collect();
    let dropped: Vec<Package> = Package::list_all(conn)?
        .into_iter()
        .filter(|p| !incoming.contains(p.atom.qualified().as_str()))
        .collect();

    conn.execute("DELETE FROM packages", [])?;
    conn.execute("DELETE FROM notices", [])?;
    PackageSet::delete_all(conn)?;

    // Write exactly what the checksum covers
    for record in &canonical.packages {
        add_package(conn, branch, record)?;
    }
    for notice in &canonical.notices {
        notice.upsert(conn)?;
    }
    for (name, members) in &canonical.sets {
        for spec in members {
            PackageSet::new(name.clone(), spec.clone()).insert(conn)?;
        }
    }

    StoreMetadata::set(conn, StoreMetadata::CHECKSUM, &canonical.checksum())?;
    StoreMetadata::set(conn, StoreMetadata::BRANCH, branch)?;
    Ok(dropped)
}

/// Checksum recorded at the last import or update, if any
pub fn recorded_checksum(conn: &Connection) -> Result<Option<String>> {
    StoreMetadata::get(conn, StoreMetadata::CHECKSUM)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema;
    use tempfile::NamedTempFile;

    fn create_test_db() -> (NamedTempFile, Connection) {
        let temp_file = NamedTempFile::new().unwrap();
        let conn = Connection::open(temp_file.path()).unwrap();
        conn.execute("PRAGMA foreign_keys = ON", []).unwrap();
        schema::migrate(&conn).unwrap();
        (temp_file, conn)
    }

    fn sample() -> PackageRecord {
        PackageRecord::new("media-libs/libpng-1.6.43:0")
            .depends("sys-libs/zlib", DependencyKind::Runtime)
            .depends("dev-build/cmake", DependencyKind::Build)
            .provides("libpng16.so.16", 2, "/usr/lib64/libpng16.so.16")
            .needs("libz.so.1", 2)
    }

    #[test]
    fn test_add_and_read_back_package() {
        let (_temp, conn) = create_test_db();

        add_package(&conn, "5", &sample()).unwrap();

        let snap = snapshot(&conn).unwrap();
        assert_eq!(snap.packages.len(), 1);

        let mut expected = sample();
        expected.canonicalize();
        assert_eq!(snap.packages[0], expected);
    }

    #[test]
    fn test_checksum_ignores_ordering() {
        let a = StoreSnapshot {
            packages: vec![PackageRecord::new("app-misc/a-1:0"), PackageRecord::new("app-misc/b-1:0")],
            ..Default::default()
        };
        let b = StoreSnapshot {
            packages: vec![PackageRecord::new("app-misc/b-1:0"), PackageRecord::new("app-misc/a-1:0")],
            ..Default::default()
        };
        assert_eq!(a.checksum(), b.checksum());
        assert_ne!(a.checksum(), StoreSnapshot::default().checksum());
    }

    #[test]
    fn test_import_reports_dropped_packages() {
        let (_temp, conn) = create_test_db();
        add_package(&conn, "5", &sample()).unwrap();
        add_package(&conn, "5", &PackageRecord::new("sys-libs/zlib-1.3:0")).unwrap();

        let next = StoreSnapshot {
            packages: vec![PackageRecord::new("sys-libs/zlib-1.3:0")],
            ..Default::default()
        };
        let dropped = import_snapshot(&conn, "5", &next).unwrap();

        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0].atom.key(), "media-libs/libpng");
        assert_eq!(Package::count(&conn).unwrap(), 1);
        assert_eq!(recorded_checksum(&conn).unwrap(), Some(next.checksum()));
        assert_eq!(snapshot(&conn).unwrap().checksum(), next.checksum());
    }

    #[test]
    fn test_import_skips_duplicate_atoms() {
        let (_temp, conn) = create_test_db();
        let mut dup = sample();
        dup.description = Some("shadowed".to_string());
        let next = StoreSnapshot {
            packages: vec![sample(), dup],
            ..Default::default()
        };

        import_snapshot(&conn, "5", &next).unwrap();
        assert_eq!(Package::count(&conn).unwrap(), 1);
        assert_eq!(snapshot(&conn).unwrap().checksum(), next.checksum());
    }

    #[test]
    fn test_upsert_replaces_existing_package() {
        let (_temp, conn) = create_test_db();
        add_package(&conn, "5", &sample()).unwrap();

        let mut updated = sample();
        updated.description = Some("PNG reference library".to_string());
        upsert_package(&conn, "5", &updated).unwrap();

        let snap = snapshot(&conn).unwrap();
        assert_eq!(snap.packages.len(), 1);
        assert_eq!(snap.packages[0].description.as_deref(), Some("PNG reference library"));
    }
}
