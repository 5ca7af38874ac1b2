// src/repository/sync.rs

//! Repository update engine
//!
//! Updating a repository happens in two phases. The fetch phase talks to
//! the remote without holding any lock. The commit phase takes the
//! repository's exclusive lock and writes the fetched data in one SQLite
//! transaction. Repositories are updated in parallel and a failure in one
//! never stops the others.
//!
//! Format levels are tried from the highest the repository allows:
//! EAPI 3 (delta), then 2 (compressed snapshot), then 1 (plain snapshot).

use super::delta::Delta;
use super::{
    CHECKSUM_FILE, CancelToken, RemoteSource, SNAPSHOT_FILE, SNAPSHOT_ZST_FILE, delta_file,
    open_source, remote_path,
};
use crate::cleanup;
use crate::context::RepositoryContext;
use crate::db;
use crate::db::models::{ExpiredPackage, Package, Repository, current_timestamp};
use crate::error::{Error, Result};
use crate::lock::LockMode;
use crate::store::{self, PackageRecord, StoreSnapshot};
use rayon::prelude::*;
use rusqlite::Connection;
use tracing::{debug, info, warn};

/// Knobs of an update run
#[derive(Debug, Clone, Copy, Default)]
pub struct UpdateOptions {
    /// Fetch even when the remote checksum matches the local one
    pub force: bool,
    pub lock_mode: LockMode,
}

/// How one repository ended up
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateStatus {
    UpToDate,
    Updated {
        eapi: u32,
        checksum: String,
        packages: usize,
        expired: usize,
    },
}

#[derive(Debug)]
pub struct RepositoryUpdate {
    pub repository: String,
    pub result: Result<UpdateStatus>,
}

/// Per-repository outcome of an update run
#[derive(Debug, Default)]
pub struct UpdateReport {
    pub outcomes: Vec<RepositoryUpdate>,
}

impl UpdateReport {
    pub fn failed(&self) -> impl Iterator<Item = &RepositoryUpdate> {
        self.outcomes.iter().filter(|o| o.result.is_err())
    }

    pub fn is_success(&self) -> bool {
        self.failed().next().is_none()
    }

    pub fn get(&self, repository: &str) -> Option<&RepositoryUpdate> {
        self.outcomes.iter().find(|o| o.repository == repository)
    }
}

/// Data fetched for one format level
enum Payload {
    Delta(Delta),
    Snapshot(StoreSnapshot),
}

pub struct UpdateEngine<'a> {
    ctx: &'a RepositoryContext,
    cancel: CancelToken,
}

impl<'a> UpdateEngine<'a> {
    pub fn new(ctx: &'a RepositoryContext) -> Self {
        Self {
            ctx,
            cancel: CancelToken::new(),
        }
    }

    /// Use an externally controlled cancellation token
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Update the named repositories, or every enabled one
    pub fn update(&self, names: &[String], options: UpdateOptions) -> Result<UpdateReport> {
        let repositories = self.ctx.select_repositories(names)?;
        info!("Updating {} repositories", repositories.len());

        let outcomes = repositories
            .par_iter()
            .map(|repo| {
                let result = self.update_one(repo, options);
                match &result {
                    Ok(status) => debug!("{}: {:?}", repo.name, status),
                    Err(e) => warn!("{}: update failed: {}", repo.name, e),
                }
                RepositoryUpdate {
                    repository: repo.name.clone(),
                    result,
                }
            })
            .collect();

        Ok(UpdateReport { outcomes })
    }

    fn update_one(&self, repo: &Repository, options: UpdateOptions) -> Result<UpdateStatus> {
        self.cancel.check()?;
        let settings = self.ctx.settings();
        let source = open_source(&repo.url, settings, self.cancel.clone())?;
        self.update_from(repo, source.as_ref(), options)
    }

    /// Update one repository from an already opened source
    pub fn update_from(
        &self,
        repo: &Repository,
        source: &dyn RemoteSource,
        options: UpdateOptions,
    ) -> Result<UpdateStatus> {
        let product = &self.ctx.settings().product;
        let remote = |file: &str| remote_path(product, &repo.branch, file);

        let checksum_bytes = source.fetch(&remote(CHECKSUM_FILE))?.ok_or_else(|| {
            Error::NotFoundError(format!(
                "{} has no {} for branch {}",
                source.describe(),
                CHECKSUM_FILE,
                repo.branch
            ))
        })?;
        let remote_checksum = String::from_utf8_lossy(&checksum_bytes).trim().to_string();

        let local_checksum = {
            let _guard = self.ctx.locks().shared(&repo.name, options.lock_mode)?;
            let store_path = self.ctx.store_path(&repo.name, &repo.branch);
            if store_path.exists() {
                store::recorded_checksum(&db::open(&store_path)?)?
            } else {
                None
            }
        };

        if !options.force && local_checksum.as_deref() == Some(remote_checksum.as_str()) {
            info!("{} is up to date", repo.name);
            return Ok(UpdateStatus::UpToDate);
        }

        let mut last_error = None;
        for eapi in self.ctx.settings().eapi_order(repo.differential_update) {
            self.cancel.check()?;

            let payload = match self.fetch_payload(
                repo,
                source,
                eapi,
                &remote_checksum,
                local_checksum.as_deref(),
            ) {
                Ok(Some(payload)) => payload,
                Ok(None) => {
                    debug!("{}: EAPI {} not available", repo.name, eapi);
                    continue;
                }
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => {
                    warn!("{}: EAPI {} fetch failed: {}, falling back", repo.name, eapi, e);
                    last_error = Some(e);
                    continue;
                }
            };

            match self.commit(repo, eapi, payload, options) {
                Ok((packages, expired)) => {
                    info!(
                        "{} updated to {} (EAPI {}, {} packages)",
                        repo.name, remote_checksum, eapi, packages
                    );
                    return Ok(UpdateStatus::Updated {
                        eapi,
                        checksum: remote_checksum,
                        packages,
                        expired,
                    });
                }
                // A delta that does not fit the local store is retried as a full download
                Err(e @ (Error::CorruptRepository { .. } | Error::ChecksumMismatch { .. })) => {
                    warn!("{}: EAPI {} rejected: {}, falling back", repo.name, eapi, e);
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| {
            Error::NotFoundError(format!(
                "{} offers no usable repository format",
                source.describe()
            ))
        }))
    }

    fn fetch_payload(
        &self,
        repo: &Repository,
        source: &dyn RemoteSource,
        eapi: u32,
        remote_checksum: &str,
        local_checksum: Option<&str>,
    ) -> Result<Option<Payload>> {
        let product = &self.ctx.settings().product;
        let remote = |file: &str| remote_path(product, &repo.branch, file);
        let corrupt = |reason: String| Error::CorruptRepository {
            repository: repo.name.clone(),
            reason,
        };

        match eapi {
            3 => {
                let Some(base) = local_checksum else {
                    return Ok(None);
                };
                let Some(bytes) = source.fetch(&remote(&delta_file(base)))? else {
                    return Ok(None);
                };
                let delta = Delta::decode(&repo.name, &bytes)?;
                if delta.target != remote_checksum {
                    return Err(corrupt(format!(
                        "delta targets {} but remote is at {}",
                        delta.target, remote_checksum
                    )));
                }
                check_download_paths(&repo.name, &delta.upserted)?;
                Ok(Some(Payload::Delta(delta)))
            }
            2 | 1 => {
                let file = if eapi == 2 { SNAPSHOT_ZST_FILE } else { SNAPSHOT_FILE };
                let Some(bytes) = source.fetch(&remote(file))? else {
                    return Ok(None);
                };
                let json = if eapi == 2 {
                    zstd::decode_all(bytes.as_slice())
                        .map_err(|e| corrupt(format!("{}: {}", file, e)))?
                } else {
                    bytes
                };
                let snapshot: StoreSnapshot = serde_json::from_slice(&json)
                    .map_err(|e| corrupt(format!("{}: {}", file, e)))?;

                let actual = snapshot.checksum();
                if actual != remote_checksum {
                    return Err(Error::ChecksumMismatch {
                        expected: remote_checksum.to_string(),
                        actual,
                    });
                }
                check_download_paths(&repo.name, &snapshot.packages)?;
                Ok(Some(Payload::Snapshot(snapshot)))
            }
            other => Err(Error::ParseError(format!("Unsupported EAPI {}", other))),
        }
    }

    /// Write a payload under the exclusive lock; returns (packages, expired)
    fn commit(
        &self,
        repo: &Repository,
        eapi: u32,
        payload: Payload,
        options: UpdateOptions,
    ) -> Result<(usize, usize)> {
        let _guard = self.ctx.locks().exclusive(&repo.name, options.lock_mode)?;
        self.cancel.check()?;

        let store_path = self.ctx.store_path(&repo.name, &repo.branch);
        let mut conn = db::open_or_init(&store_path)?;

        let (target, expired) = db::transaction(&mut conn, |tx| {
            let (target, dropped) = match &payload {
                Payload::Delta(delta) => {
                    let outcome = delta.apply(tx, &repo.name, &repo.branch)?;
                    (delta.target.clone(), outcome.dropped)
                }
                Payload::Snapshot(snapshot) => (
                    snapshot.checksum(),
                    store::import_snapshot(tx, &repo.branch, snapshot)?,
                ),
            };
            let expired = record_expired(tx, &dropped)?;
            Ok((target, expired))
        })?;
        let packages = Package::count(&conn)? as usize;

        let mut sys = self.ctx.open_system()?;
        db::transaction(&mut sys, |tx| {
            let Some(mut current) = Repository::find_by_name(tx, &repo.name)? else {
                return Ok(());
            };
            current.checksum = Some(target.clone());
            current.eapi = Some(eapi as i32);
            current.last_sync = Some(current_timestamp());
            current.update(tx)
        })?;

        Ok((packages, expired))
    }
}

/// Refuse metadata whose download paths would leave the package directory
fn check_download_paths(repository: &str, records: &[PackageRecord]) -> Result<()> {
    match records
        .iter()
        .filter_map(|r| r.download_path.as_deref())
        .find(|path| !cleanup::is_contained(path))
    {
        Some(path) => Err(Error::CorruptRepository {
            repository: repository.to_string(),
            reason: format!("download path {} leaves the package directory", path),
        }),
        None => Ok(()),
    }
}

/// Record package files dropped from a store for later cleanup
fn record_expired(conn: &Connection, dropped: &[Package]) -> Result<usize> {
    let mut count = 0;
    for package in dropped {
        let Some(path) = &package.download_path else {
            continue;
        };
        if !cleanup::is_contained(path) {
            warn!("Not recording expiry of {}: unsafe path {}", package.atom, path);
            continue;
        }
        ExpiredPackage::new(package.atom.qualified(), path.clone()).insert(conn)?;
        count += 1;
    }
    Ok(count)
}
