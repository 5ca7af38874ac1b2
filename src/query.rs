// src/query.rs

//! Read-only queries over repository stores
//!
//! Every query runs against a set of repositories (all enabled ones when no
//! names are given) and tags each hit with the repository it came from.
//! Stores are read under the repository's shared lock.

use crate::atom::DepSpec;
use crate::context::RepositoryContext;
use crate::db;
use crate::db::models::{NeededLibrary, Notice, NoticeMark, Package, PackageSet, Repository};
use crate::error::Result;
use crate::lock::LockMode;
use crate::resolver;
use rusqlite::Connection;
use std::collections::BTreeMap;
use tracing::debug;

/// A package found in a repository
#[derive(Debug, Clone)]
pub struct Hit {
    pub repository: String,
    pub package: Package,
}

#[derive(Debug, Clone)]
pub struct NeededHit {
    pub hit: Hit,
    pub libraries: Vec<NeededLibrary>,
}

#[derive(Debug, Clone)]
pub struct RevdepsHit {
    pub hit: Hit,
    pub dependents: Vec<Package>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetHit {
    pub repository: String,
    pub name: String,
    pub specs: Vec<String>,
}

/// State of one configured repository
#[derive(Debug, Clone)]
pub struct RepositoryStatus {
    pub repository: Repository,
    /// `None` until the first successful update
    pub packages: Option<i64>,
    pub unread_notices: usize,
}

pub struct Query<'a> {
    ctx: &'a RepositoryContext,
    repositories: Vec<Repository>,
    mode: LockMode,
}

impl<'a> Query<'a> {
    /// Query the named repositories, or every enabled one
    pub fn new(ctx: &'a RepositoryContext, names: &[String], mode: LockMode) -> Result<Self> {
        Ok(Self {
            ctx,
            repositories: ctx.select_repositories(names)?,
            mode,
        })
    }

    pub fn repositories(&self) -> &[Repository] {
        &self.repositories
    }

    /// Run `f` against every selected store that exists
    fn each_store<T>(
        &self,
        mut f: impl FnMut(&Repository, &Connection) -> Result<Vec<T>>,
    ) -> Result<Vec<T>> {
        let mut results = Vec::new();
        for repo in &self.repositories {
            let _guard = self.ctx.locks().shared(&repo.name, self.mode)?;
            let path = self.ctx.store_path(&repo.name, &repo.branch);
            if !path.exists() {
                debug!("{} has no store on branch {}", repo.name, repo.branch);
                continue;
            }
            let conn = db::open(&path)?;
            results.extend(f(repo, &conn)?);
        }
        Ok(results)
    }

    fn hits(repo: &Repository, packages: Vec<Package>) -> Vec<Hit> {
        packages
            .into_iter()
            .map(|package| Hit {
                repository: repo.name.clone(),
                package,
            })
            .collect()
    }

    /// Packages matching any of the dependency specs
    pub fn matching(&self, specs: &[DepSpec]) -> Result<Vec<Hit>> {
        self.each_store(|repo, conn| {
            let mut packages = Vec::new();
            for spec in specs {
                packages.extend(
                    Package::find_by_key(conn, &spec.key)?
                        .into_iter()
                        .filter(|p| spec.matches(&p.atom)),
                );
            }
            Ok(Self::hits(repo, packages))
        })
    }

    /// Packages carrying one of the tags
    pub fn tags(&self, tags: &[String]) -> Result<Vec<Hit>> {
        self.each_store(|repo, conn| {
            let mut packages = Vec::new();
            for tag in tags {
                packages.extend(Package::find_by_tag(conn, tag)?);
            }
            Ok(Self::hits(repo, packages))
        })
    }

    /// Libraries needed by each package matching the specs
    pub fn needed(&self, specs: &[DepSpec]) -> Result<Vec<NeededHit>> {
        self.each_store(|repo, conn| {
            let mut results = Vec::new();
            for spec in specs {
                for package in Package::find_by_key(conn, &spec.key)? {
                    if !spec.matches(&package.atom) {
                        continue;
                    }
                    let libraries = resolver::needed(conn, &package)?;
                    results.push(NeededHit {
                        hit: Hit {
                            repository: repo.name.clone(),
                            package,
                        },
                        libraries,
                    });
                }
            }
            Ok(results)
        })
    }

    /// Packages linking against any of the sonames
    pub fn required(&self, sonames: &[String], elfclass: Option<i32>) -> Result<Vec<Hit>> {
        self.each_store(|repo, conn| {
            let mut packages = Vec::new();
            for soname in sonames {
                packages.extend(resolver::required(conn, soname, elfclass)?);
            }
            Ok(Self::hits(repo, packages))
        })
    }

    /// Reverse dependencies of each package matching the specs
    pub fn revdeps(&self, specs: &[DepSpec], include_build: bool) -> Result<Vec<RevdepsHit>> {
        self.each_store(|repo, conn| {
            let mut results = Vec::new();
            for spec in specs {
                for package in Package::find_by_key(conn, &spec.key)? {
                    if !spec.matches(&package.atom) {
                        continue;
                    }
                    let dependents = resolver::revdeps(conn, &package)
                        .include_build(include_build)
                        .collect::<Result<Vec<_>>>()?;
                    results.push(RevdepsHit {
                        hit: Hit {
                            repository: repo.name.clone(),
                            package,
                        },
                        dependents,
                    });
                }
            }
            Ok(results)
        })
    }

    /// Package sets by name, or all of them when `names` is empty
    pub fn sets(&self, names: &[String]) -> Result<Vec<SetHit>> {
        self.each_store(|repo, conn| {
            let mut sets: BTreeMap<String, Vec<String>> = BTreeMap::new();
            for member in PackageSet::list_all(conn)? {
                let wanted = names.is_empty()
                    || names
                        .iter()
                        .any(|n| n.trim_start_matches('@') == member.set_name.trim_start_matches('@'));
                if wanted {
                    sets.entry(member.set_name).or_default().push(member.spec);
                }
            }
            Ok(sets
                .into_iter()
                .map(|(name, specs)| SetHit {
                    repository: repo.name.clone(),
                    name,
                    specs,
                })
                .collect())
        })
    }

    /// Packages whose description contains any of the patterns
    pub fn desc(&self, patterns: &[String]) -> Result<Vec<Hit>> {
        self.each_store(|repo, conn| {
            let mut packages = Vec::new();
            for pattern in patterns {
                packages.extend(Package::search_description(conn, pattern)?);
            }
            Ok(Self::hits(repo, packages))
        })
    }

    /// Packages whose atom contains any of the patterns
    pub fn search(&self, patterns: &[String]) -> Result<Vec<Hit>> {
        self.each_store(|repo, conn| {
            let mut packages = Vec::new();
            for pattern in patterns {
                for package in Package::search(conn, pattern)? {
                    if !packages.iter().any(|p: &Package| p.id == package.id) {
                        packages.push(package);
                    }
                }
            }
            Ok(Self::hits(repo, packages))
        })
    }

    /// Status of every selected repository, including ones never synced
    pub fn status(&self) -> Result<Vec<RepositoryStatus>> {
        let sys = self.ctx.open_system()?;
        let mut statuses = Vec::new();
        for repo in &self.repositories {
            let _guard = self.ctx.locks().shared(&repo.name, self.mode)?;
            let path = self.ctx.store_path(&repo.name, &repo.branch);

            let (packages, unread_notices) = if path.exists() {
                let conn = db::open(&path)?;
                let mark = NoticeMark::get(&sys, &repo.name)?;
                (
                    Some(Package::count(&conn)?),
                    Notice::list_after(&conn, mark)?.len(),
                )
            } else {
                (None, 0)
            };

            statuses.push(RepositoryStatus {
                repository: repo.clone(),
                packages,
                unread_notices,
            });
        }
        Ok(statuses)
    }
}
