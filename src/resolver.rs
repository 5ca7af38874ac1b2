// src/resolver.rs

//! Dependency resolution over a repository store
//!
//! Install plans are computed on a petgraph `DiGraph` whose edges run from a
//! dependency to its dependent, so a topological order installs every atom
//! after what it needs. Removal plans walk reverse dependencies lazily and
//! order the result dependents first. `deptest` and `libtest` are advisory
//! QA checks over an installed store.

use crate::atom::{Atom, DepSpec};
use crate::db::models::{
    DependencyEntry, DependencyKind, NeededLibrary, Package, PreservedLibrary, ProvidedLibrary,
};
use crate::error::{Error, Result};
use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use rusqlite::Connection;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use tracing::{debug, warn};

/// Knobs for install plan computation
#[derive(Debug, Clone, Default)]
pub struct ResolveOptions {
    /// Expand build dependencies as well as runtime ones
    pub include_build: bool,
}

/// Pick the highest version in `conn` matching `spec`
pub fn best_candidate(conn: &Connection, spec: &DepSpec) -> Result<Option<Package>> {
    let best = Package::find_by_key(conn, &spec.key)?
        .into_iter()
        .filter(|p| spec.matches(&p.atom))
        .max_by(|a, b| a.atom.cmp_version(&b.atom).then(a.id.cmp(&b.id)));
    Ok(best)
}

/// Whether any package in `conn` satisfies `spec`
pub fn is_satisfied(conn: &Connection, spec: &DepSpec) -> Result<bool> {
    Ok(Package::find_by_key(conn, &spec.key)?
        .iter()
        .any(|p| spec.matches(&p.atom)))
}

fn package_id(package: &Package) -> i64 {
    package.id.unwrap_or_default()
}

/// Compute the ordered list of packages to install for `targets`
///
/// Every returned package appears after all of its runtime dependencies.
/// Dependencies already satisfied by `installed` are not expanded; explicit
/// targets are always planned.
pub fn install_plan(
    repo: &Connection,
    installed: Option<&Connection>,
    targets: &[DepSpec],
    options: &ResolveOptions,
) -> Result<Vec<Package>> {
    let mut selected: BTreeMap<String, Package> = BTreeMap::new();
    let mut edges: Vec<(String, String)> = Vec::new();
    let mut conflicts: Vec<(String, DepSpec)> = Vec::new();
    let mut missing: Vec<(String, DepSpec)> = Vec::new();

    let mut queue: VecDeque<(DepSpec, Option<String>)> =
        targets.iter().cloned().map(|s| (s, None)).collect();

    while let Some((spec, requested_by)) = queue.pop_front() {
        if spec.blocker {
            if let Some(owner) = requested_by {
                conflicts.push((owner, spec));
            }
            continue;
        }

        if let Some(existing) = selected.values().find(|p| spec.matches(&p.atom)) {
            let dep = existing.atom.qualified();
            if let Some(owner) = requested_by {
                if owner != dep {
                    edges.push((dep, owner));
                }
            }
            continue;
        }

        if let (Some(owner), Some(installed)) = (&requested_by, installed) {
            if is_satisfied(installed, &spec)? {
                debug!("{} already satisfied for {}", spec, owner);
                continue;
            }
        }

        let Some(candidate) = best_candidate(repo, &spec)? else {
            missing.push((requested_by.unwrap_or_else(|| "<target>".to_string()), spec));
            continue;
        };

        let qualified = candidate.atom.qualified();
        debug!("Selected {} for {}", qualified, spec);

        for entry in DependencyEntry::find_by_package(repo, package_id(&candidate))? {
            let dep_spec = entry.dep_spec()?;
            match entry.kind {
                DependencyKind::Conflict => conflicts.push((qualified.clone(), dep_spec)),
                DependencyKind::Build if !options.include_build => {}
                _ => queue.push_back((dep_spec, Some(qualified.clone()))),
            }
        }

        if let Some(owner) = requested_by {
            if owner != qualified {
                edges.push((qualified.clone(), owner));
            }
        }
        selected.insert(qualified, candidate);
    }

    let order = order_selection(&selected, &edges)?;

    if let Some((atom, spec)) = missing.into_iter().next() {
        return Err(Error::UnsatisfiedDependency {
            atom,
            missing: spec.to_string(),
        });
    }

    check_conflicts(&selected, installed, &conflicts)?;

    Ok(order
        .into_iter()
        .filter_map(|atom| selected.remove(&atom))
        .collect())
}

/// Topologically order selected atoms; edges run dependency -> dependent
fn order_selection(
    selected: &BTreeMap<String, Package>,
    edges: &[(String, String)],
) -> Result<Vec<String>> {
    let mut graph: DiGraph<String, ()> = DiGraph::new();
    let mut nodes: HashMap<&str, NodeIndex> = HashMap::new();
    for atom in selected.keys() {
        nodes.insert(atom.as_str(), graph.add_node(atom.clone()));
    }
    for (from, to) in edges {
        if let (Some(&a), Some(&b)) = (nodes.get(from.as_str()), nodes.get(to.as_str())) {
            graph.update_edge(a, b, ());
        }
    }

    match toposort(&graph, None) {
        Ok(order) => Ok(order.into_iter().map(|idx| graph[idx].clone()).collect()),
        Err(cycle) => {
            let culprit = cycle.node_id();
            let mut members = tarjan_scc(&graph)
                .into_iter()
                .find(|scc| scc.contains(&culprit))
                .unwrap_or_else(|| vec![culprit])
                .into_iter()
                .map(|idx| graph[idx].clone())
                .collect::<Vec<_>>();
            members.sort();
            warn!("Dependency cycle detected: {}", members.join(" -> "));
            Err(Error::CyclicDependency(members))
        }
    }
}

fn check_conflicts(
    selected: &BTreeMap<String, Package>,
    installed: Option<&Connection>,
    conflicts: &[(String, DepSpec)],
) -> Result<()> {
    let selected_keys: HashSet<String> = selected.values().map(|p| p.atom.key()).collect();

    for (owner, spec) in conflicts {
        if let Some(clash) = selected
            .iter()
            .find(|(atom, p)| *atom != owner && spec.matches(&p.atom))
        {
            return Err(Error::ConflictError(format!(
                "{} conflicts with {}",
                owner, clash.0
            )));
        }

        // Installed packages that the plan replaces no longer count
        if let Some(installed) = installed {
            if selected_keys.contains(&spec.key) {
                continue;
            }
            if let Some(clash) = Package::find_by_key(installed, &spec.key)?
                .into_iter()
                .find(|p| spec.matches(&p.atom))
            {
                return Err(Error::ConflictError(format!(
                    "{} conflicts with installed {}",
                    owner,
                    clash.atom.qualified()
                )));
            }
        }
    }
    Ok(())
}

/// Compute the packages to remove for `targets`, dependents first
///
/// The plan holds every installed package matching a target plus all of
/// their reverse dependencies. Cycles among installed packages are allowed.
pub fn removal_plan(installed: &Connection, targets: &[DepSpec]) -> Result<Vec<Package>> {
    let mut members: BTreeMap<i64, Package> = BTreeMap::new();

    for spec in targets {
        let matched: Vec<Package> = Package::find_by_key(installed, &spec.key)?
            .into_iter()
            .filter(|p| spec.matches(&p.atom))
            .collect();
        if matched.is_empty() {
            return Err(Error::NotFoundError(format!("No installed package matches {}", spec)));
        }
        for package in matched {
            for dependent in revdeps(installed, &package) {
                let dependent = dependent?;
                members.insert(package_id(&dependent), dependent);
            }
            members.insert(package_id(&package), package);
        }
    }

    let mut graph: DiGraph<i64, ()> = DiGraph::new();
    let nodes: HashMap<i64, NodeIndex> = members
        .keys()
        .map(|&id| (id, graph.add_node(id)))
        .collect();

    for (&id, package) in &members {
        for entry in DependencyEntry::find_dependents(installed, &package.atom.key())? {
            if entry.kind != DependencyKind::Runtime || entry.package_id == id {
                continue;
            }
            let Some(&dependent) = nodes.get(&entry.package_id) else {
                continue;
            };
            if entry.dep_spec()?.matches(&package.atom) {
                graph.update_edge(nodes[&id], dependent, ());
            }
        }
    }

    // Tarjan yields components in reverse topological order: dependents first
    let mut plan = Vec::with_capacity(members.len());
    for mut scc in tarjan_scc(&graph) {
        scc.sort_by_key(|idx| graph[*idx]);
        for idx in scc {
            if let Some(package) = members.remove(&graph[idx]) {
                plan.push(package);
            }
        }
    }
    Ok(plan)
}

/// Lazy breadth-first walk over the reverse dependencies of a package
///
/// Each step queries the store for the direct dependents of one package.
/// The start package is never yielded and no package is yielded twice.
/// Clone the iterator before consuming it (or call `restart`) to walk again.
#[derive(Clone)]
pub struct RevDeps<'c> {
    conn: &'c Connection,
    start: Package,
    include_build: bool,
    ready: VecDeque<Package>,
    frontier: VecDeque<Package>,
    seen: HashSet<i64>,
    failed: bool,
}

/// Reverse runtime dependencies of `package` in `conn`
pub fn revdeps<'c>(conn: &'c Connection, package: &Package) -> RevDeps<'c> {
    let mut walk = RevDeps {
        conn,
        start: package.clone(),
        include_build: false,
        ready: VecDeque::new(),
        frontier: VecDeque::new(),
        seen: HashSet::new(),
        failed: false,
    };
    walk.restart();
    walk
}

impl<'c> RevDeps<'c> {
    /// Follow build dependency edges too
    pub fn include_build(mut self, include: bool) -> Self {
        self.include_build = include;
        self.restart();
        self
    }

    /// Rewind to the start package
    pub fn restart(&mut self) {
        self.ready.clear();
        self.frontier.clear();
        self.seen.clear();
        self.failed = false;
        self.seen.insert(package_id(&self.start));
        self.frontier.push_back(self.start.clone());
    }

    fn expand(&mut self, package: &Package) -> Result<()> {
        for entry in DependencyEntry::find_dependents(self.conn, &package.atom.key())? {
            if entry.kind == DependencyKind::Build && !self.include_build {
                continue;
            }
            if self.seen.contains(&entry.package_id) {
                continue;
            }
            if !entry.dep_spec()?.matches(&package.atom) {
                continue;
            }
            if let Some(dependent) = Package::find_by_id(self.conn, entry.package_id)? {
                self.seen.insert(entry.package_id);
                self.ready.push_back(dependent);
            }
        }
        Ok(())
    }
}

impl Iterator for RevDeps<'_> {
    type Item = Result<Package>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            if let Some(package) = self.ready.pop_front() {
                self.frontier.push_back(package.clone());
                return Some(Ok(package));
            }
            let package = self.frontier.pop_front()?;
            if let Err(e) = self.expand(&package) {
                self.failed = true;
                return Some(Err(e));
            }
        }
    }
}

/// Libraries a package links against
pub fn needed(conn: &Connection, package: &Package) -> Result<Vec<NeededLibrary>> {
    NeededLibrary::find_by_package(conn, package_id(package))
}

/// Packages linking against `soname`, optionally restricted to one ELF class
pub fn required(conn: &Connection, soname: &str, elfclass: Option<i32>) -> Result<Vec<Package>> {
    let mut packages = Vec::new();
    for id in NeededLibrary::find_consumers(conn, soname, elfclass)? {
        if let Some(package) = Package::find_by_id(conn, id)? {
            packages.push(package);
        }
    }
    Ok(packages)
}

/// A runtime dependency no installed package satisfies
#[derive(Debug, Clone)]
pub struct MissingDependency {
    pub atom: Atom,
    pub spec: DepSpec,
}

impl MissingDependency {
    pub fn into_error(self) -> Error {
        Error::UnsatisfiedDependency {
            atom: self.atom.qualified(),
            missing: self.spec.to_string(),
        }
    }
}

/// Unsatisfied runtime dependencies across an installed store
pub fn deptest(installed: &Connection) -> Result<Vec<MissingDependency>> {
    let mut report = Vec::new();
    for package in Package::list_all(installed)? {
        for entry in DependencyEntry::find_by_package(installed, package_id(&package))? {
            if entry.kind != DependencyKind::Runtime {
                continue;
            }
            let spec = entry.dep_spec()?;
            if spec.blocker {
                continue;
            }
            if !is_satisfied(installed, &spec)? {
                debug!("{} misses {}", package.atom.qualified(), spec);
                report.push(MissingDependency {
                    atom: package.atom.clone(),
                    spec,
                });
            }
        }
    }
    Ok(report)
}

/// Why a soname does not resolve
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkageProblem {
    /// No installed package or preserved library provides it
    Missing,
    /// More than one installed package provides it
    Ambiguous(Vec<String>),
}

/// One broken soname of one installed package
#[derive(Debug, Clone)]
pub struct LinkageReport {
    pub atom: Atom,
    pub soname: String,
    pub elfclass: i32,
    pub problem: LinkageProblem,
}

impl LinkageReport {
    pub fn into_error(self) -> Error {
        let reason = match &self.problem {
            LinkageProblem::Missing => format!("no provider for elfclass {}", self.elfclass),
            LinkageProblem::Ambiguous(providers) => {
                format!("provided by {}", providers.join(", "))
            }
        };
        Error::BrokenLinkage {
            atom: self.atom.qualified(),
            soname: self.soname,
            reason,
        }
    }
}

/// Needed sonames that do not resolve to exactly one provider
///
/// Preserved libraries stand in for a provider only when no installed
/// package ships the soname.
pub fn libtest(installed: &Connection) -> Result<Vec<LinkageReport>> {
    let mut owners: HashMap<i64, Package> = HashMap::new();
    for package in Package::list_all(installed)? {
        owners.insert(package_id(&package), package);
    }

    let mut report = Vec::new();
    for need in NeededLibrary::list_all(installed)? {
        let Some(consumer) = owners.get(&need.package_id) else {
            continue;
        };

        let mut providers: Vec<i64> =
            ProvidedLibrary::find_providers(installed, &need.soname, need.elfclass)?
                .into_iter()
                .map(|p| p.package_id)
                .collect();
        providers.sort_unstable();
        providers.dedup();

        let problem = match providers.len() {
            1 => continue,
            0 => {
                if !PreservedLibrary::find_by_soname(installed, &need.soname, need.elfclass)?
                    .is_empty()
                {
                    continue;
                }
                LinkageProblem::Missing
            }
            _ => LinkageProblem::Ambiguous(
                providers
                    .iter()
                    .filter_map(|id| owners.get(id))
                    .map(|p| p.atom.qualified())
                    .collect(),
            ),
        };

        report.push(LinkageReport {
            atom: consumer.atom.clone(),
            soname: need.soname,
            elfclass: need.elfclass,
            problem,
        });
    }
    Ok(report)
}
