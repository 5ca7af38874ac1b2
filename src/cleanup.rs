// src/cleanup.rs

//! Removal of expired package files
//!
//! Updates record every package file that disappeared from a repository.
//! Once such a record is older than the expiration period the file is
//! deleted from the branch's package directory. A record whose path is
//! shipped again by a current package is dropped without touching the file.

use crate::context::RepositoryContext;
use crate::db;
use crate::db::models::{ExpiredPackage, Package};
use crate::error::{Error, Result};
use crate::lock::LockMode;
use chrono::{DateTime, Duration, Utc};
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info, warn};

/// Suffix of the marker left next to files waiting for expiry
pub const WEAK_SUFFIX: &str = ".weak";

#[derive(Debug, Default)]
pub struct CleanupReport {
    pub repository: String,
    /// Files past the expiration period (removed unless pretending)
    pub removed: Vec<ExpiredPackage>,
    /// Records still inside the expiration period
    pub pending: Vec<ExpiredPackage>,
    /// Records dropped because a current package ships the file again
    pub revived: Vec<String>,
    pub pretend: bool,
}

impl CleanupReport {
    pub fn is_empty(&self) -> bool {
        self.removed.is_empty() && self.pending.is_empty() && self.revived.is_empty()
    }
}

/// Remove package files expired for more than `days` (settings default)
pub fn cleanup(
    ctx: &RepositoryContext,
    repository: &str,
    days: Option<u32>,
    pretend: bool,
    mode: LockMode,
) -> Result<CleanupReport> {
    cleanup_at(ctx, repository, days, pretend, mode, Utc::now())
}

/// Deprecated spelling of [`cleanup`]
pub fn vacuum(
    ctx: &RepositoryContext,
    repository: &str,
    days: Option<u32>,
    pretend: bool,
    mode: LockMode,
) -> Result<CleanupReport> {
    warn!("'vacuum' is deprecated, use 'cleanup' instead");
    cleanup(ctx, repository, days, pretend, mode)
}

fn is_expired(record: &ExpiredPackage, cutoff: DateTime<Utc>) -> Result<bool> {
    let expired_at = DateTime::parse_from_rfc3339(&record.expired_at).map_err(|e| {
        Error::ParseError(format!(
            "Invalid expiry time for {}: {}",
            record.download_path, e
        ))
    })?;
    Ok(expired_at.with_timezone(&Utc) <= cutoff)
}

/// Whether a download path stays inside the directory it is joined to
///
/// Download paths come from remote metadata; absolute paths and `..`
/// components are refused.
pub fn is_contained(download_path: &str) -> bool {
    !download_path.is_empty()
        && Path::new(download_path)
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

/// Resolve a download path below `base`, `None` if it would leave it
pub fn package_file(base: &Path, download_path: &str) -> Option<PathBuf> {
    is_contained(download_path).then(|| base.join(download_path))
}

fn remove_file(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn cleanup_at(
    ctx: &RepositoryContext,
    repository: &str,
    days: Option<u32>,
    pretend: bool,
    mode: LockMode,
    now: DateTime<Utc>,
) -> Result<CleanupReport> {
    let days = days.unwrap_or(ctx.settings().expiration_days);
    let cutoff = now - Duration::days(i64::from(days));
    let repo = ctx.repository(repository)?;
    let base = ctx.branch_dir(&repo.name, &repo.branch);
    let weak_files = ctx.settings().weak_package_files;

    let mut report = CleanupReport {
        repository: repo.name.clone(),
        pretend,
        ..CleanupReport::default()
    };

    // Pretend runs only read, so a shared guard is enough
    let _shared = if pretend {
        Some(ctx.locks().shared(&repo.name, mode)?)
    } else {
        None
    };
    let _exclusive = if pretend {
        None
    } else {
        Some(ctx.locks().exclusive(&repo.name, mode)?)
    };

    let mut conn = ctx.open_current_store(&repo.name)?;
    for record in ExpiredPackage::list_all(&conn)? {
        if package_file(&base, &record.download_path).is_none() {
            warn!(
                "{}: ignoring expired file outside the package directory: {}",
                repo.name, record.download_path
            );
        } else if Package::has_download_path(&conn, &record.download_path)? {
            report.revived.push(record.download_path);
        } else if is_expired(&record, cutoff)? {
            report.removed.push(record);
        } else {
            report.pending.push(record);
        }
    }

    if pretend {
        info!(
            "{}: {} files would be removed, {} pending",
            repo.name,
            report.removed.len(),
            report.pending.len()
        );
        return Ok(report);
    }

    let weak_marker = |record: &ExpiredPackage| {
        package_file(&base, &format!("{}{}", record.download_path, WEAK_SUFFIX))
    };

    for record in &report.removed {
        if let Some(path) = package_file(&base, &record.download_path) {
            debug!("Removing expired {}", path.display());
            remove_file(&path)?;
        }
        if let Some(marker) = weak_marker(record) {
            remove_file(&marker)?;
        }
    }

    if weak_files {
        for record in &report.pending {
            let file = package_file(&base, &record.download_path);
            if let (Some(file), Some(marker)) = (file, weak_marker(record)) {
                if file.exists() {
                    fs::write(marker, b"")?;
                }
            }
        }
    }

    db::transaction(&mut conn, |tx| {
        for path in report
            .removed
            .iter()
            .map(|r| &r.download_path)
            .chain(report.revived.iter())
        {
            ExpiredPackage::delete_by_path(tx, path)?;
        }
        Ok(())
    })?;

    info!(
        "{}: removed {} expired files, {} pending",
        repo.name,
        report.removed.len(),
        report.pending.len()
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::add_repository;
    use crate::settings::Settings;
    use crate::store::{PackageRecord, add_package};
    use tempfile::TempDir;

    fn context(settings: Settings) -> (TempDir, RepositoryContext) {
        let root = TempDir::new().unwrap();
        let ctx = RepositoryContext::new(root.path(), settings).unwrap();
        let sys = ctx.open_system().unwrap();
        add_repository(&sys, "main".into(), "/srv/mirror".into(), "5".into(), 0).unwrap();
        (root, ctx)
    }

    fn expire(ctx: &RepositoryContext, path: &str, age_days: i64) {
        let base = ctx.branch_dir("main", "5");
        let file = base.join(path);
        fs::create_dir_all(file.parent().unwrap()).unwrap();
        fs::write(&file, b"pkg").unwrap();

        let conn = ctx.open_current_store("main").unwrap();
        let mut record = ExpiredPackage::new("app-misc/x-1:0".into(), path.into());
        record.expired_at = (Utc::now() - Duration::days(age_days)).to_rfc3339();
        record.insert(&conn).unwrap();
    }

    fn exists(ctx: &RepositoryContext, path: &str) -> bool {
        Path::new(&ctx.branch_dir("main", "5")).join(path).exists()
    }

    #[test]
    fn test_removes_only_expired() {
        let (_root, ctx) = context(Settings::default());
        expire(&ctx, "packages/old-1.tbz2", 20);
        expire(&ctx, "packages/new-1.tbz2", 2);

        let report = cleanup(&ctx, "main", None, false, LockMode::NoWait).unwrap();
        assert_eq!(report.removed.len(), 1);
        assert_eq!(report.pending.len(), 1);
        assert!(!exists(&ctx, "packages/old-1.tbz2"));
        assert!(exists(&ctx, "packages/new-1.tbz2"));

        let conn = ctx.open_current_store("main").unwrap();
        let left = ExpiredPackage::list_all(&conn).unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].download_path, "packages/new-1.tbz2");
    }

    #[test]
    fn test_pretend_changes_nothing() {
        let (_root, ctx) = context(Settings::default());
        expire(&ctx, "packages/old-1.tbz2", 20);

        let report = cleanup(&ctx, "main", Some(1), true, LockMode::NoWait).unwrap();
        assert!(report.pretend);
        assert_eq!(report.removed.len(), 1);
        assert!(exists(&ctx, "packages/old-1.tbz2"));

        let conn = ctx.open_current_store("main").unwrap();
        assert_eq!(ExpiredPackage::list_all(&conn).unwrap().len(), 1);
    }

    #[test]
    fn test_days_override() {
        let (_root, ctx) = context(Settings::default());
        expire(&ctx, "packages/a-1.tbz2", 2);

        let report = cleanup(&ctx, "main", Some(1), false, LockMode::NoWait).unwrap();
        assert_eq!(report.removed.len(), 1);
        assert!(!exists(&ctx, "packages/a-1.tbz2"));
    }

    #[test]
    fn test_revived_package_is_kept() {
        let (_root, ctx) = context(Settings::default());
        expire(&ctx, "packages/back-1.tbz2", 30);
        {
            let conn = ctx.open_current_store("main").unwrap();
            let mut record = PackageRecord::new("app-misc/back-1");
            record.download_path = Some("packages/back-1.tbz2".into());
            add_package(&conn, "5", &record).unwrap();
        }

        let report = cleanup(&ctx, "main", None, false, LockMode::NoWait).unwrap();
        assert!(report.removed.is_empty());
        assert_eq!(report.revived, vec!["packages/back-1.tbz2"]);
        assert!(exists(&ctx, "packages/back-1.tbz2"));

        let conn = ctx.open_current_store("main").unwrap();
        assert!(ExpiredPackage::list_all(&conn).unwrap().is_empty());
    }

    #[test]
    fn test_weak_markers_for_pending() {
        let settings = Settings {
            weak_package_files: true,
            ..Settings::default()
        };
        let (_root, ctx) = context(settings);
        expire(&ctx, "packages/soon-1.tbz2", 1);

        cleanup(&ctx, "main", None, false, LockMode::NoWait).unwrap();
        assert!(exists(&ctx, "packages/soon-1.tbz2"));
        assert!(exists(&ctx, "packages/soon-1.tbz2.weak"));
    }

    #[test]
    fn test_vacuum_alias_and_lock() {
        let (_root, ctx) = context(Settings::default());
        expire(&ctx, "packages/old-1.tbz2", 20);

        {
            let _held = ctx.locks().shared("main", LockMode::NoWait).unwrap();
            let err = vacuum(&ctx, "main", None, false, LockMode::NoWait).unwrap_err();
            assert!(matches!(err, Error::LockContention { .. }));
        }

        let report = vacuum(&ctx, "main", None, false, LockMode::NoWait).unwrap();
        assert_eq!(report.removed.len(), 1);
    }

    #[test]
    fn test_paths_outside_branch_are_ignored() {
        let (_root, ctx) = context(Settings::default());
        let outside = TempDir::new().unwrap();
        let victim = outside.path().join("victim.txt");
        fs::write(&victim, b"keep me").unwrap();

        let conn = ctx.open_current_store("main").unwrap();
        for path in [victim.display().to_string(), "../../victim.txt".to_string()] {
            let mut record = ExpiredPackage::new("app-misc/evil-1:0".into(), path);
            record.expired_at = (Utc::now() - Duration::days(20)).to_rfc3339();
            record.insert(&conn).unwrap();
        }

        let report = cleanup(&ctx, "main", None, false, LockMode::NoWait).unwrap();
        assert!(report.removed.is_empty());
        assert!(report.is_empty());
        assert!(victim.exists());
    }

    #[test]
    fn test_package_file_containment() {
        let base = Path::new("/srv/main/5");
        assert_eq!(
            package_file(base, "packages/a-1.tbz2"),
            Some(base.join("packages/a-1.tbz2"))
        );
        assert_eq!(package_file(base, "/etc/passwd"), None);
        assert_eq!(package_file(base, "packages/../../x"), None);
        assert_eq!(package_file(base, ""), None);
    }
}
