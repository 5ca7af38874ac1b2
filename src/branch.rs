// src/branch.rs

//! Repository branches
//!
//! Each branch of a repository is a directory holding its own store and
//! package files. Switching to a new branch stages the copy in a temporary
//! sibling directory, renames it into place and only then flips the current
//! branch in the system database. A failure at any step leaves the previous
//! branch current and intact.

use crate::context::{PACKAGES_DIR, RepositoryContext, STORE_DB};
use crate::db;
use crate::db::models::{Package, StoreMetadata};
use crate::error::{Error, Result};
use crate::lock::LockMode;
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};

/// Check a branch name against `[A-Za-z0-9][A-Za-z0-9._-]*`
pub fn validate_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) => {
            first.is_ascii_alphanumeric()
                && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        }
        None => false,
    };
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidBranch(name.to_string()))
    }
}

/// Result of a branch switch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwitchOutcome {
    pub from: String,
    pub to: String,
    /// A new branch directory was created
    pub created: bool,
    /// Packages carried over from the parent branch
    pub copied: usize,
}

/// Copy a branch store and its package files into `dest`
///
/// Returns the number of packages copied.
pub fn copy_branch(source: &Path, dest: &Path) -> Result<usize> {
    let source_db = source.join(STORE_DB);
    let conn = db::open(&source_db)?;
    let dest_db = dest.join(STORE_DB);
    conn.execute("VACUUM INTO ?1", [dest_db.to_string_lossy()])?;
    let copied = Package::count(&conn)? as usize;

    let packages = source.join(PACKAGES_DIR);
    if packages.is_dir() {
        copy_dir_all(&packages, &dest.join(PACKAGES_DIR))?;
    }
    Ok(copied)
}

fn copy_dir_all(source: &Path, dest: &Path) -> Result<()> {
    fs::create_dir_all(dest)?;
    for entry in fs::read_dir(source)? {
        let entry = entry?;
        let target = dest.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_all(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), target)?;
        }
    }
    Ok(())
}

pub struct BranchManager<'a> {
    ctx: &'a RepositoryContext,
}

impl<'a> BranchManager<'a> {
    pub fn new(ctx: &'a RepositoryContext) -> Self {
        Self { ctx }
    }

    /// Branches present on disk for a repository, sorted
    pub fn branches(&self, repository: &str) -> Result<Vec<String>> {
        let dir = self.ctx.repository_dir(repository);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut branches = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if entry.file_type()?.is_dir() && validate_name(&name).is_ok() {
                branches.push(name);
            }
        }
        branches.sort();
        Ok(branches)
    }

    /// Current branch of a repository
    pub fn current(&self, repository: &str) -> Result<String> {
        Ok(self.ctx.repository(repository)?.branch)
    }

    /// Make `to` the current branch of `repository`
    ///
    /// A branch that does not exist yet is created from `from` (default:
    /// the current branch), copying its packages unless `copy` is false.
    pub fn switch(
        &self,
        repository: &str,
        to: &str,
        from: Option<&str>,
        copy: bool,
        mode: LockMode,
    ) -> Result<SwitchOutcome> {
        self.switch_with(repository, to, from, copy, mode, copy_branch)
    }

    fn switch_with<F>(
        &self,
        repository: &str,
        to: &str,
        from: Option<&str>,
        copy: bool,
        mode: LockMode,
        copier: F,
    ) -> Result<SwitchOutcome>
    where
        F: FnOnce(&Path, &Path) -> Result<usize>,
    {
        validate_name(to)?;
        if let Some(from) = from {
            validate_name(from)?;
        }

        let _guard = self.ctx.locks().exclusive(repository, mode)?;
        let mut repo = self.ctx.repository(repository)?;
        let from = from.unwrap_or(&repo.branch).to_string();

        let target = self.ctx.branch_dir(repository, to);
        let mut outcome = SwitchOutcome {
            from: repo.branch.clone(),
            to: to.to_string(),
            created: false,
            copied: 0,
        };

        if repo.branch == to && target.join(STORE_DB).exists() {
            debug!("{} already on branch {}", repository, to);
            return Ok(outcome);
        }

        if !target.exists() {
            outcome.copied = self.stage_branch(repository, to, &from, copy, copier)?;
            outcome.created = true;
        }

        let mut sys = self.ctx.open_system()?;
        repo.branch = to.to_string();
        let flipped = db::transaction(&mut sys, |tx| repo.update(tx));
        if let Err(e) = flipped {
            if outcome.created {
                if let Err(cleanup) = fs::remove_dir_all(&target) {
                    warn!("Cannot remove {}: {}", target.display(), cleanup);
                }
            }
            return Err(e);
        }

        info!(
            "[{}] switched from branch {} to {}",
            repository, outcome.from, outcome.to
        );
        Ok(outcome)
    }

    /// Build the new branch next to its final place and rename it in
    fn stage_branch<F>(
        &self,
        repository: &str,
        to: &str,
        from: &str,
        copy: bool,
        copier: F,
    ) -> Result<usize>
    where
        F: FnOnce(&Path, &Path) -> Result<usize>,
    {
        let parent = self.ctx.repository_dir(repository);
        fs::create_dir_all(&parent)?;
        // Removed on drop unless renamed away
        let staging = tempfile::Builder::new()
            .prefix(".branch-")
            .tempdir_in(&parent)?;

        let source = self.ctx.branch_dir(repository, from);
        let copied = if copy && source.join(STORE_DB).exists() {
            copier(&source, staging.path())?
        } else {
            if copy {
                warn!("[{}] branch {} has no store, nothing to copy", repository, from);
            }
            db::init(&staging.path().join(STORE_DB))?;
            0
        };

        {
            let mut conn = db::open(&staging.path().join(STORE_DB))?;
            db::transaction(&mut conn, |tx| {
                Package::set_branch_all(tx, to)?;
                StoreMetadata::set(tx, StoreMetadata::BRANCH, to)?;
                StoreMetadata::remove(tx, StoreMetadata::CHECKSUM)?;
                Ok(())
            })?;
        }

        fs::rename(staging.path(), self.ctx.branch_dir(repository, to))?;
        debug!("Staged branch {} for {} ({} packages)", to, repository, copied);
        Ok(copied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::Repository;
    use crate::settings::Settings;
    use crate::store::{PackageRecord, add_package};
    use tempfile::TempDir;

    fn setup() -> (TempDir, RepositoryContext) {
        let dir = TempDir::new().unwrap();
        let ctx = RepositoryContext::new(dir.path(), Settings::default()).unwrap();

        let sys = ctx.open_system().unwrap();
        Repository::new("main".into(), "file:///nowhere".into(), "5".into())
            .insert(&sys)
            .unwrap();

        let store = db::open_or_init(&ctx.store_path("main", "5")).unwrap();
        add_package(&store, "5", &PackageRecord::new("app-misc/a-1")).unwrap();
        add_package(&store, "5", &PackageRecord::new("app-misc/b-2")).unwrap();
        StoreMetadata::set(&store, StoreMetadata::BRANCH, "5").unwrap();

        let packages = ctx.packages_dir("main", "5");
        fs::create_dir_all(&packages).unwrap();
        fs::write(packages.join("a-1.tbz2"), b"a").unwrap();

        (dir, ctx)
    }

    fn staging_leftovers(ctx: &RepositoryContext) -> usize {
        fs::read_dir(ctx.repository_dir("main"))
            .unwrap()
            .filter(|e| {
                e.as_ref()
                    .unwrap()
                    .file_name()
                    .to_string_lossy()
                    .starts_with(".branch-")
            })
            .count()
    }

    #[test]
    fn test_validate_name() {
        for ok in ["5", "next", "v1.2_beta-3", "A"] {
            assert!(validate_name(ok).is_ok(), "{}", ok);
        }
        for bad in ["", "-5", ".hidden", "a/b", "a b", "../5"] {
            assert!(matches!(validate_name(bad), Err(Error::InvalidBranch(_))), "{}", bad);
        }
    }

    #[test]
    fn test_switch_copies_and_retags() {
        let (_dir, ctx) = setup();
        let manager = BranchManager::new(&ctx);

        let outcome = manager
            .switch("main", "6", None, true, LockMode::NoWait)
            .unwrap();
        assert_eq!(outcome.from, "5");
        assert!(outcome.created);
        assert_eq!(outcome.copied, 2);

        assert_eq!(manager.current("main").unwrap(), "6");
        assert_eq!(manager.branches("main").unwrap(), vec!["5", "6"]);
        assert!(ctx.packages_dir("main", "6").join("a-1.tbz2").exists());

        let store = db::open(&ctx.store_path("main", "6")).unwrap();
        assert!(Package::list_all(&store).unwrap().iter().all(|p| p.branch == "6"));
        assert_eq!(
            StoreMetadata::get(&store, StoreMetadata::BRANCH).unwrap().as_deref(),
            Some("6")
        );

        // Parent branch untouched
        let old = db::open(&ctx.store_path("main", "5")).unwrap();
        assert!(Package::list_all(&old).unwrap().iter().all(|p| p.branch == "5"));
        assert_eq!(staging_leftovers(&ctx), 0);
    }

    #[test]
    fn test_switch_without_copy_creates_empty_store() {
        let (_dir, ctx) = setup();
        let manager = BranchManager::new(&ctx);

        let outcome = manager
            .switch("main", "6", None, false, LockMode::NoWait)
            .unwrap();
        assert_eq!(outcome.copied, 0);

        let store = db::open(&ctx.store_path("main", "6")).unwrap();
        assert_eq!(Package::count(&store).unwrap(), 0);
    }

    #[test]
    fn test_switch_back_only_flips_pointer() {
        let (_dir, ctx) = setup();
        let manager = BranchManager::new(&ctx);
        manager.switch("main", "6", None, true, LockMode::NoWait).unwrap();

        let outcome = manager
            .switch("main", "5", None, true, LockMode::NoWait)
            .unwrap();
        assert!(!outcome.created);
        assert_eq!(manager.current("main").unwrap(), "5");

        let again = manager
            .switch("main", "5", None, true, LockMode::NoWait)
            .unwrap();
        assert_eq!(again.from, "5");
        assert!(!again.created);
    }

    #[test]
    fn test_failed_copy_leaves_previous_branch() {
        let (_dir, ctx) = setup();
        let manager = BranchManager::new(&ctx);

        let err = manager
            .switch_with("main", "6", None, true, LockMode::NoWait, |_, dest| {
                fs::write(dest.join("partial"), b"half a store")?;
                Err(Error::IoError("disk full".to_string()))
            })
            .unwrap_err();
        assert!(matches!(err, Error::IoError(_)));

        assert_eq!(manager.current("main").unwrap(), "5");
        assert!(!ctx.branch_dir("main", "6").exists());
        assert_eq!(staging_leftovers(&ctx), 0);
        assert_eq!(manager.branches("main").unwrap(), vec!["5"]);

        let store = db::open(&ctx.store_path("main", "5")).unwrap();
        assert_eq!(Package::count(&store).unwrap(), 2);
    }

    #[test]
    fn test_switch_requires_lock() {
        let (_dir, ctx) = setup();
        let _held = ctx.locks().shared("main", LockMode::NoWait).unwrap();

        let err = BranchManager::new(&ctx)
            .switch("main", "6", None, true, LockMode::NoWait)
            .unwrap_err();
        assert!(matches!(err, Error::LockContention { .. }));
    }

    #[test]
    fn test_invalid_branch_rejected() {
        let (_dir, ctx) = setup();
        let err = BranchManager::new(&ctx)
            .switch("main", "../escape", None, true, LockMode::NoWait)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidBranch(_)));
    }
}
