// src/preserved.rs

//! Preserved shared libraries
//!
//! When a package is removed or upgraded, libraries it ships that other
//! installed packages still link against are kept on disk and recorded in
//! the installed store. Library paths are stored without the install root.
//! Locking of the installed store is the caller's job.

use crate::atom::Atom;
use crate::db::models::{NeededLibrary, Package, PreservedLibrary, ProvidedLibrary};
use crate::error::Result;
use rusqlite::Connection;
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info, warn};

/// Symlink hops followed before giving up on a chain
pub const MAX_SYMLINK_HOPS: usize = 128;

/// A registry entry with its computed reference count
#[derive(Debug, Clone)]
pub struct PreservedEntry {
    pub library: PreservedLibrary,
    /// Installed packages still needing the soname, owner excluded
    pub consumers: Vec<i64>,
    /// Another installed package provides the soname again
    pub provided_again: bool,
}

impl PreservedEntry {
    pub fn references(&self) -> usize {
        self.consumers.len()
    }
}

/// Why a preserved library may be collected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcReason {
    /// Path no longer exists
    Vanished,
    /// Path is a symlink to nothing
    Dangling,
    /// No installed package needs the soname anymore
    Unreferenced,
    /// Another installed package provides the soname again
    Provided,
}

impl GcReason {
    pub fn as_str(&self) -> &str {
        match self {
            GcReason::Vanished => "path vanished",
            GcReason::Dangling => "dangling symlink",
            GcReason::Unreferenced => "no consumers",
            GcReason::Provided => "provided by an installed package",
        }
    }
}

#[derive(Debug, Clone)]
pub struct GcCandidate {
    pub library: PreservedLibrary,
    pub reason: GcReason,
}

/// Files handled by `remove_package_files`
#[derive(Debug, Default, Clone)]
pub struct RemovalOutcome {
    pub preserved: Vec<String>,
    pub removed: Vec<String>,
}

/// Lexically resolve `.` and `..` components
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Preserved-library bookkeeping for one installed store and install root
pub struct PreservedLibraries<'c> {
    conn: &'c Connection,
    root: PathBuf,
    package_id: Option<i64>,
    /// path -> (soname, elfclass) of libraries the package being removed ships
    provided: HashMap<String, (String, i32)>,
}

impl<'c> PreservedLibraries<'c> {
    /// Tracker not bound to a package, for `list`, `gc` and `collect`
    pub fn new(conn: &'c Connection, root: impl Into<PathBuf>) -> Self {
        Self {
            conn,
            root: root.into(),
            package_id: None,
            provided: HashMap::new(),
        }
    }

    /// Tracker for the removal or upgrade of one installed package
    pub fn for_package(
        conn: &'c Connection,
        root: impl Into<PathBuf>,
        package: &Package,
    ) -> Result<Self> {
        let package_id = package.id.unwrap_or_default();
        let provided = ProvidedLibrary::find_by_package(conn, package_id)?
            .into_iter()
            .map(|lib| (lib.path, (lib.soname, lib.elfclass)))
            .collect();

        Ok(Self {
            conn,
            root: root.into(),
            package_id: Some(package_id),
            provided,
        })
    }

    fn rooted(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }

    /// Soname and ELF class of a path the package ships, if it is a library
    pub fn resolve(&self, library_path: &str) -> Option<&(String, i32)> {
        self.provided.get(library_path)
    }

    /// Installed packages other than the owner needing the library at a path
    pub fn needed(&self, library_path: &str) -> Result<Vec<i64>> {
        let Some((soname, elfclass)) = self.resolve(library_path) else {
            return Ok(Vec::new());
        };
        let mut ids = NeededLibrary::find_consumers(self.conn, soname, Some(*elfclass))?;
        ids.retain(|id| Some(*id) != self.package_id);
        Ok(ids)
    }

    /// Paths to protect if `library_path` were removed
    ///
    /// Empty unless the path is a library the package ships and another
    /// installed package still needs it.
    pub fn determine(&self, library_path: &str) -> Result<Vec<String>> {
        if self.needed(library_path)?.is_empty() {
            return Ok(Vec::new());
        }
        self.follow(library_path)
    }

    /// Walk a symlink chain to its regular file
    ///
    /// Returns the regular file and every symlink in the chain that points
    /// directly at it. A chain that ends nowhere or exceeds
    /// `MAX_SYMLINK_HOPS` protects nothing.
    pub fn follow(&self, library_path: &str) -> Result<Vec<String>> {
        let mut current = normalize(Path::new(library_path));
        let mut links: Vec<(PathBuf, PathBuf)> = Vec::new();

        for _ in 0..MAX_SYMLINK_HOPS {
            let on_disk = self.rooted(&current.to_string_lossy());
            let meta = match fs::symlink_metadata(&on_disk) {
                Ok(meta) => meta,
                Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
                Err(e) => return Err(e.into()),
            };

            if meta.file_type().is_symlink() {
                let target = fs::read_link(&on_disk)?;
                let parent = current.parent().unwrap_or(Path::new("/")).to_path_buf();
                let next = if target.is_absolute() {
                    normalize(&target)
                } else {
                    normalize(&parent.join(&target))
                };
                links.push((current, next.clone()));
                current = next;
                continue;
            }

            if !meta.is_file() {
                return Ok(Vec::new());
            }

            let mut paths = vec![current.to_string_lossy().into_owned()];
            for (link, target) in links {
                if target == current {
                    paths.push(link.to_string_lossy().into_owned());
                }
            }
            return Ok(paths);
        }

        warn!("Too many symlink hops resolving {}", library_path);
        Ok(Vec::new())
    }

    /// Delete the files of the package being removed, keeping protected ones
    ///
    /// Protected libraries are registered under `atom` and stay on disk.
    pub fn remove_package_files(&self, files: &[String], atom: &str) -> Result<RemovalOutcome> {
        let mut protected: BTreeSet<String> = BTreeSet::new();
        for file in files {
            let Some((soname, elfclass)) = self.resolve(file) else {
                continue;
            };
            for path in self.determine(file)? {
                PreservedLibrary::new(soname.clone(), *elfclass, path.clone(), atom.to_string())
                    .insert(self.conn)?;
                info!("Preserving {} ({}) from {}", path, soname, atom);
                protected.insert(path);
            }
        }

        let mut outcome = RemovalOutcome::default();
        for file in files {
            if protected.contains(file) {
                continue;
            }
            match fs::remove_file(self.rooted(file)) {
                Ok(()) => outcome.removed.push(file.clone()),
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    debug!("{} already gone", file);
                }
                Err(e) => return Err(e.into()),
            }
        }
        outcome.preserved = protected.into_iter().collect();
        Ok(outcome)
    }

    /// Installed package id of the atom that registered `library`
    fn owner(&self, library: &PreservedLibrary) -> Result<Option<i64>> {
        match Atom::parse(&library.atom) {
            Ok(atom) => Ok(Package::find_by_atom(self.conn, &atom)?.and_then(|p| p.id)),
            Err(_) => Ok(None),
        }
    }

    /// Registry entries with their consumers
    ///
    /// Consumers of a soname that another installed package provides again
    /// link against that package, so such entries have no references.
    pub fn list(&self) -> Result<Vec<PreservedEntry>> {
        let mut entries = Vec::new();
        for library in PreservedLibrary::list_all(self.conn)? {
            let providers = self.providers(&library)?;
            let consumers = if providers.is_empty() {
                let owner = self.owner(&library)?;
                let mut consumers = NeededLibrary::find_consumers(
                    self.conn,
                    &library.soname,
                    Some(library.elfclass),
                )?;
                consumers.retain(|id| Some(*id) != owner);
                consumers
            } else {
                Vec::new()
            };
            entries.push(PreservedEntry {
                library,
                consumers,
                provided_again: !providers.is_empty(),
            });
        }
        Ok(entries)
    }

    /// Installed libraries other than the owner's providing the entry's soname
    fn providers(&self, library: &PreservedLibrary) -> Result<Vec<ProvidedLibrary>> {
        let owner = self.owner(library)?;
        let mut providers =
            ProvidedLibrary::find_providers(self.conn, &library.soname, library.elfclass)?;
        providers.retain(|p| Some(p.package_id) != owner);
        Ok(providers)
    }

    /// Whether a provider's library or its symlink chain covers the entry's path
    fn reowned(&self, library: &PreservedLibrary) -> Result<bool> {
        for provider in self.providers(library)? {
            if provider.path == library.path || self.follow(&provider.path)?.contains(&library.path) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Entries that may be collected; nothing is deleted
    pub fn gc(&self) -> Result<Vec<GcCandidate>> {
        let mut candidates = Vec::new();
        for entry in self.list()? {
            let path = self.rooted(&entry.library.path);
            let reason = if fs::symlink_metadata(&path).is_err() {
                GcReason::Vanished
            } else if !path.exists() {
                GcReason::Dangling
            } else if entry.provided_again {
                GcReason::Provided
            } else if entry.consumers.is_empty() {
                GcReason::Unreferenced
            } else {
                continue;
            };
            debug!("{} is collectable: {}", entry.library.path, reason.as_str());
            candidates.push(GcCandidate {
                library: entry.library,
                reason,
            });
        }
        Ok(candidates)
    }

    /// Delete candidates from disk and from the registry
    ///
    /// Returns the paths that could not be deleted; their entries stay.
    pub fn collect(&self, candidates: &[GcCandidate]) -> Result<Vec<String>> {
        let mut failed = Vec::new();
        for candidate in candidates {
            let path = &candidate.library.path;
            // A reinstalled package owns the file again; only the entry goes
            if candidate.reason == GcReason::Provided && self.reowned(&candidate.library)? {
                PreservedLibrary::delete_by_path(self.conn, path)?;
                info!("Unregistered preserved library {}, now provided again", path);
                continue;
            }
            match fs::remove_file(self.rooted(path)) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    warn!("Cannot remove preserved library {}: {}", path, e);
                    failed.push(path.clone());
                    continue;
                }
            }
            PreservedLibrary::delete_by_path(self.conn, path)?;
            info!("Collected preserved library {}", path);
        }
        Ok(failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema;
    use crate::store::{PackageRecord, add_package};
    use std::os::unix::fs::symlink;
    use tempfile::TempDir;

    fn memory_store() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute("PRAGMA foreign_keys = ON", []).unwrap();
        schema::migrate(&conn).unwrap();
        conn
    }

    fn write(root: &Path, path: &str) {
        let full = root.join(path.trim_start_matches('/'));
        fs::create_dir_all(full.parent().unwrap()).unwrap();
        fs::write(full, b"\x7fELF").unwrap();
    }

    /// zlib ships libz.so.1 -> libz.so.1.3 and app-misc/a needs it
    fn setup() -> (TempDir, Connection, Package) {
        let root = TempDir::new().unwrap();
        write(root.path(), "/usr/lib64/libz.so.1.3");
        symlink("libz.so.1.3", root.path().join("usr/lib64/libz.so.1")).unwrap();

        let conn = memory_store();
        let zlib = add_package(
            &conn,
            "5",
            &PackageRecord::new("sys-libs/zlib-1.3").provides("libz.so.1", 2, "/usr/lib64/libz.so.1"),
        )
        .unwrap();
        add_package(&conn, "5", &PackageRecord::new("app-misc/a-1").needs("libz.so.1", 2)).unwrap();

        let package = Package::find_by_id(&conn, zlib).unwrap().unwrap();
        (root, conn, package)
    }

    #[test]
    fn test_determine_follows_symlinks() {
        let (root, conn, zlib) = setup();
        let tracker = PreservedLibraries::for_package(&conn, root.path(), &zlib).unwrap();

        let paths = tracker.determine("/usr/lib64/libz.so.1").unwrap();
        assert_eq!(paths, vec!["/usr/lib64/libz.so.1.3", "/usr/lib64/libz.so.1"]);

        // Not a library the package ships
        assert!(tracker.determine("/usr/share/doc/zlib").unwrap().is_empty());
    }

    #[test]
    fn test_determine_without_consumers() {
        let root = TempDir::new().unwrap();
        write(root.path(), "/usr/lib64/libfoo.so.1");
        let conn = memory_store();
        let id = add_package(
            &conn,
            "5",
            &PackageRecord::new("dev-libs/foo-1")
                .provides("libfoo.so.1", 2, "/usr/lib64/libfoo.so.1")
                .needs("libfoo.so.1", 2),
        )
        .unwrap();
        let package = Package::find_by_id(&conn, id).unwrap().unwrap();
        let tracker = PreservedLibraries::for_package(&conn, root.path(), &package).unwrap();

        // The owner needing its own library does not count
        assert!(tracker.determine("/usr/lib64/libfoo.so.1").unwrap().is_empty());
    }

    #[test]
    fn test_follow_gives_up_on_loops() {
        let root = TempDir::new().unwrap();
        fs::create_dir_all(root.path().join("lib")).unwrap();
        symlink("b.so", root.path().join("lib/a.so")).unwrap();
        symlink("a.so", root.path().join("lib/b.so")).unwrap();

        let conn = memory_store();
        let tracker = PreservedLibraries::new(&conn, root.path());
        assert!(tracker.follow("/lib/a.so").unwrap().is_empty());
    }

    #[test]
    fn test_remove_package_files_preserves_needed() {
        let (root, conn, zlib) = setup();
        write(root.path(), "/usr/include/zlib.h");
        let tracker = PreservedLibraries::for_package(&conn, root.path(), &zlib).unwrap();

        let files = vec![
            "/usr/lib64/libz.so.1".to_string(),
            "/usr/lib64/libz.so.1.3".to_string(),
            "/usr/include/zlib.h".to_string(),
        ];
        let outcome = tracker
            .remove_package_files(&files, "sys-libs/zlib-1.3:0")
            .unwrap();

        assert_eq!(outcome.removed, vec!["/usr/include/zlib.h"]);
        assert_eq!(outcome.preserved.len(), 2);
        assert!(root.path().join("usr/lib64/libz.so.1.3").exists());
        assert!(!root.path().join("usr/include/zlib.h").exists());
        assert_eq!(PreservedLibrary::list_all(&conn).unwrap().len(), 2);
    }

    #[test]
    fn test_list_counts_and_gc() {
        let (root, conn, zlib) = setup();
        let tracker = PreservedLibraries::for_package(&conn, root.path(), &zlib).unwrap();
        tracker
            .remove_package_files(&["/usr/lib64/libz.so.1".to_string()], "sys-libs/zlib-1.3:0")
            .unwrap();

        let general = PreservedLibraries::new(&conn, root.path());
        let entries = general.list().unwrap();
        assert!(entries.iter().all(|e| e.references() == 1));

        // Still referenced and present: never a candidate
        assert!(general.gc().unwrap().is_empty());

        // Consumer goes away
        conn.execute("DELETE FROM packages WHERE name = 'a'", []).unwrap();
        let candidates = general.gc().unwrap();
        assert_eq!(candidates.len(), 2);
        assert!(candidates.iter().all(|c| c.reason == GcReason::Unreferenced));

        // gc never deletes
        assert!(root.path().join("usr/lib64/libz.so.1.3").exists());

        let failed = general.collect(&candidates).unwrap();
        assert!(failed.is_empty());
        assert!(!root.path().join("usr/lib64/libz.so.1.3").exists());
        assert!(PreservedLibrary::list_all(&conn).unwrap().is_empty());
    }

    /// Preserve zlib's libraries, then drop the zlib package
    fn preserve_and_remove_zlib(root: &TempDir, conn: &Connection, zlib: &Package) {
        let tracker = PreservedLibraries::for_package(conn, root.path(), zlib).unwrap();
        tracker
            .remove_package_files(&["/usr/lib64/libz.so.1".to_string()], "sys-libs/zlib-1.3:0")
            .unwrap();
        Package::delete(conn, zlib.id.unwrap()).unwrap();
    }

    #[test]
    fn test_gc_library_moved_to_another_package() {
        let (root, conn, zlib) = setup();
        preserve_and_remove_zlib(&root, &conn, &zlib);
        write(root.path(), "/lib64/libz.so.1");
        add_package(
            &conn,
            "5",
            &PackageRecord::new("sys-libs/zlib-ng-2.1").provides("libz.so.1", 2, "/lib64/libz.so.1"),
        )
        .unwrap();

        let tracker = PreservedLibraries::new(&conn, root.path());
        assert!(tracker.list().unwrap().iter().all(|e| e.references() == 0));
        let candidates = tracker.gc().unwrap();
        assert_eq!(candidates.len(), 2);
        assert!(candidates.iter().all(|c| c.reason == GcReason::Provided));

        assert!(tracker.collect(&candidates).unwrap().is_empty());
        assert!(!root.path().join("usr/lib64/libz.so.1.3").exists());
        assert!(root.path().join("lib64/libz.so.1").exists());
        assert!(PreservedLibrary::list_all(&conn).unwrap().is_empty());
    }

    #[test]
    fn test_gc_reinstalled_library_keeps_file() {
        let (root, conn, zlib) = setup();
        preserve_and_remove_zlib(&root, &conn, &zlib);
        add_package(
            &conn,
            "5",
            &PackageRecord::new("sys-libs/zlib-1.3-r1")
                .provides("libz.so.1", 2, "/usr/lib64/libz.so.1"),
        )
        .unwrap();

        let tracker = PreservedLibraries::new(&conn, root.path());
        let candidates = tracker.gc().unwrap();
        assert_eq!(candidates.len(), 2);
        assert!(candidates.iter().all(|c| c.reason == GcReason::Provided));

        tracker.collect(&candidates).unwrap();
        assert!(root.path().join("usr/lib64/libz.so.1").exists());
        assert!(root.path().join("usr/lib64/libz.so.1.3").exists());
        assert!(PreservedLibrary::list_all(&conn).unwrap().is_empty());
    }

    #[test]
    fn test_gc_vanished_and_dangling() {
        let (root, conn, _zlib) = setup();
        for path in ["/usr/lib64/libz.so.1", "/usr/lib64/libz.so.1.3"] {
            PreservedLibrary::new("libz.so.1".into(), 2, path.into(), "sys-libs/zlib-1.3:0".into())
                .insert(&conn)
                .unwrap();
        }
        fs::remove_file(root.path().join("usr/lib64/libz.so.1.3")).unwrap();

        let tracker = PreservedLibraries::new(&conn, root.path());
        let mut reasons: Vec<(String, GcReason)> = tracker
            .gc()
            .unwrap()
            .into_iter()
            .map(|c| (c.library.path, c.reason))
            .collect();
        reasons.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(
            reasons,
            vec![
                ("/usr/lib64/libz.so.1".to_string(), GcReason::Dangling),
                ("/usr/lib64/libz.so.1.3".to_string(), GcReason::Vanished),
            ]
        );
    }
}
