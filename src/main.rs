// src/main.rs

use anyhow::{Result, bail};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use entropy::atom::DepSpec;
use entropy::branch::BranchManager;
use entropy::cleanup;
use entropy::context::SETTINGS_FILE;
use entropy::db::models::Repository;
use entropy::lock::LockMode;
use entropy::notice::NoticeBoard;
use entropy::preserved::PreservedLibraries;
use entropy::query::{Hit, Query};
use entropy::repository::mirror;
use entropy::repository::sync::{UpdateEngine, UpdateOptions, UpdateStatus};
use entropy::resolver::{self, ResolveOptions};
use entropy::settings::Settings;
use entropy::{RepositoryContext, db, repository};
use std::fs;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "entropy")]
#[command(author, version, about = "Binary package repository management", long_about = None)]
struct Cli {
    /// Root directory holding settings and databases
    #[arg(long, global = true, default_value = "/var/lib/entropy")]
    root: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the settings file and databases under the root
    Init,
    /// Manage configured repositories
    Repo {
        #[command(subcommand)]
        command: RepoCommands,
    },
    /// Fetch repository metadata
    Update {
        /// Download even when the repository looks unchanged
        #[arg(long)]
        force: bool,
        /// Repositories to update (default: all enabled)
        repos: Vec<String>,
    },
    /// Show branches or switch a repository to another branch
    Branch {
        /// Do not wait for the repository lock
        #[arg(long)]
        quick: bool,
        /// Branch to copy a new branch from (default: current)
        #[arg(long)]
        from: Option<String>,
        /// Create a new branch empty instead of copying packages
        #[arg(long)]
        no_copy: bool,
        /// Branch to switch to; lists branches when omitted
        branch: Option<String>,
        /// Repository (default: the official one)
        repo: Option<String>,
    },
    /// Query repository metadata
    Query {
        #[command(subcommand)]
        command: QueryCommands,
    },
    /// Manage repository notice boards
    Notice {
        #[command(subcommand)]
        command: NoticeCommands,
    },
    /// Manage preserved shared libraries
    Preservedlibs {
        #[command(subcommand)]
        command: PreservedCommands,
    },
    /// Look for unsatisfied dependencies of installed packages
    Deptest {
        /// Ask before printing the packages that would fix them
        #[arg(long)]
        ask: bool,
        /// Only print atoms
        #[arg(short, long)]
        quiet: bool,
        /// Show the packages that would fix them
        #[arg(long)]
        pretend: bool,
    },
    /// Look for broken library linkage of installed packages
    Libtest {
        /// Only print atoms
        #[arg(short, long)]
        quiet: bool,
    },
    /// Remove package files expired from a repository
    Cleanup {
        #[arg(long)]
        quick: bool,
        /// Only report what would be removed
        #[arg(long)]
        pretend: bool,
        /// Days after which an expired package is removed
        #[arg(long)]
        days: Option<u32>,
        repo: Option<String>,
    },
    /// Deprecated, use `cleanup`
    #[command(hide = true)]
    Vacuum {
        #[arg(long)]
        quick: bool,
        #[arg(long)]
        pretend: bool,
        #[arg(long)]
        days: Option<u32>,
        repo: Option<String>,
    },
    /// Show repository status
    Status { repo: Option<String> },
    /// Search packages by atom
    Search {
        /// Restrict to a repository (repeatable)
        #[arg(long = "in")]
        repos: Vec<String>,
        #[arg(short, long)]
        quiet: bool,
        #[arg(required = true)]
        packages: Vec<String>,
    },
    /// Publish a repository store as a mirror directory
    Publish {
        /// Destination directory
        dest: PathBuf,
        repo: Option<String>,
    },
    /// Generate shell completions
    Completions { shell: Shell },
}

#[derive(Subcommand)]
enum RepoCommands {
    /// Add a repository
    Add {
        name: String,
        url: String,
        /// Branch to track (default: the configured branch)
        #[arg(long)]
        branch: Option<String>,
        #[arg(long, default_value = "0")]
        priority: i32,
    },
    /// Remove a repository
    Remove { name: String },
    /// Enable a repository
    Enable { name: String },
    /// Disable a repository
    Disable { name: String },
    /// List repositories
    List,
}

#[derive(Subcommand)]
enum QueryCommands {
    /// Packages carrying a tag
    Tags {
        #[arg(long = "in")]
        repos: Vec<String>,
        #[arg(short, long)]
        quiet: bool,
        #[arg(required = true)]
        tags: Vec<String>,
    },
    /// Libraries needed by packages
    Needed {
        #[arg(long = "in")]
        repos: Vec<String>,
        #[arg(short, long)]
        quiet: bool,
        #[arg(required = true)]
        packages: Vec<String>,
    },
    /// Packages needing a library
    Required {
        #[arg(long = "in")]
        repos: Vec<String>,
        #[arg(short, long)]
        quiet: bool,
        /// Only match this ELF class
        #[arg(long)]
        elfclass: Option<i32>,
        #[arg(required = true)]
        libraries: Vec<String>,
    },
    /// Reverse dependencies of packages
    Revdeps {
        #[arg(long = "in")]
        repos: Vec<String>,
        #[arg(short, long)]
        quiet: bool,
        /// Follow build dependencies too
        #[arg(long)]
        build: bool,
        #[arg(required = true)]
        packages: Vec<String>,
    },
    /// Package sets
    Sets {
        #[arg(long = "in")]
        repos: Vec<String>,
        #[arg(short, long)]
        quiet: bool,
        sets: Vec<String>,
    },
    /// Search package descriptions
    Desc {
        #[arg(long = "in")]
        repos: Vec<String>,
        #[arg(short, long)]
        quiet: bool,
        #[arg(required = true)]
        patterns: Vec<String>,
    },
}

#[derive(Subcommand)]
enum NoticeCommands {
    /// Post a notice
    Add {
        #[arg(long)]
        title: String,
        #[arg(long, default_value = "")]
        body: String,
        #[arg(long)]
        link: Option<String>,
        repo: Option<String>,
    },
    /// Remove a notice
    Remove { id: i64, repo: Option<String> },
    /// Show notices
    Show {
        /// Only unread notices; marks them read
        #[arg(long)]
        unread: bool,
        repo: Option<String>,
    },
}

#[derive(Subcommand)]
enum PreservedCommands {
    /// List preserved libraries
    List,
    /// List preserved libraries that can be removed
    Gc,
    /// Remove the libraries `gc` lists
    Collect {
        #[arg(long)]
        pretend: bool,
    },
}

fn parse_specs(specs: &[String]) -> Result<Vec<DepSpec>> {
    Ok(specs
        .iter()
        .map(|s| DepSpec::parse(s))
        .collect::<entropy::Result<Vec<_>>>()?)
}

fn repo_or_default(ctx: &RepositoryContext, repo: Option<String>) -> String {
    repo.unwrap_or_else(|| ctx.settings().official_repository_id.clone())
}

fn print_hits(hits: &[Hit], quiet: bool) {
    for hit in hits {
        if quiet {
            println!("{}", hit.package.atom.qualified());
        } else {
            println!(
                "[{}] {}  {}",
                hit.repository,
                hit.package.atom.qualified(),
                hit.package.description.as_deref().unwrap_or("")
            );
        }
    }
    if !quiet {
        println!("{} packages found", hits.len());
    }
}

fn confirm(question: &str) -> Result<bool> {
    print!("{} [y/N] ", question);
    io::stdout().flush()?;
    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer)?;
    Ok(matches!(answer.trim(), "y" | "Y" | "yes"))
}

fn cmd_init(root: &Path) -> Result<()> {
    fs::create_dir_all(root)?;
    let settings_path = root.join(SETTINGS_FILE);
    if !settings_path.exists() {
        Settings::default().save(&settings_path)?;
    }
    let ctx = RepositoryContext::load(root)?;
    ctx.open_system()?;
    ctx.open_installed()?;
    println!("Initialized entropy root at {}", root.display());
    Ok(())
}

fn cmd_repo(ctx: &RepositoryContext, command: RepoCommands) -> Result<()> {
    let conn = ctx.open_system()?;
    match command {
        RepoCommands::Add {
            name,
            url,
            branch,
            priority,
        } => {
            let branch = branch.unwrap_or_else(|| ctx.settings().branch.clone());
            let mut repo = repository::add_repository(&conn, name, url, branch, priority)?;
            repo.differential_update = ctx.settings().differential_update;
            repo.update(&conn)?;
            println!("Added repository {} on branch {}", repo.name, repo.branch);
        }
        RepoCommands::Remove { name } => {
            let repo = repository::remove_repository(&conn, &name)?;
            println!("Removed repository {}", repo.name);
        }
        RepoCommands::Enable { name } => {
            repository::set_repository_enabled(&conn, &name, true)?;
            println!("Enabled repository {}", name);
        }
        RepoCommands::Disable { name } => {
            repository::set_repository_enabled(&conn, &name, false)?;
            println!("Disabled repository {}", name);
        }
        RepoCommands::List => {
            let repos = Repository::list_all(&conn)?;
            if repos.is_empty() {
                println!("No repositories configured");
            }
            for repo in repos {
                println!(
                    "{:<16} {:<8} branch={} priority={} {}",
                    repo.name,
                    if repo.enabled { "enabled" } else { "disabled" },
                    repo.branch,
                    repo.priority,
                    repo.url
                );
            }
        }
    }
    Ok(())
}

fn cmd_update(ctx: &RepositoryContext, force: bool, repos: &[String]) -> Result<()> {
    let engine = UpdateEngine::new(ctx);
    let report = engine.update(
        repos,
        UpdateOptions {
            force,
            ..UpdateOptions::default()
        },
    )?;

    for outcome in &report.outcomes {
        match &outcome.result {
            Ok(UpdateStatus::UpToDate) => println!("{}: already up to date", outcome.repository),
            Ok(UpdateStatus::Updated {
                eapi,
                checksum,
                packages,
                expired,
            }) => println!(
                "{}: updated to {} via EAPI {} ({} packages, {} expired)",
                outcome.repository, checksum, eapi, packages, expired
            ),
            Err(e) => println!("{}: FAILED: {}", outcome.repository, e),
        }
    }

    let failed = report.failed().count();
    if failed > 0 {
        bail!("{} of {} repositories failed to update", failed, report.outcomes.len());
    }
    Ok(())
}

fn cmd_branch(
    ctx: &RepositoryContext,
    quick: bool,
    from: Option<String>,
    no_copy: bool,
    branch: Option<String>,
    repo: Option<String>,
) -> Result<()> {
    let repo = repo_or_default(ctx, repo);
    let manager = BranchManager::new(ctx);

    let Some(branch) = branch else {
        let current = manager.current(&repo)?;
        for name in manager.branches(&repo)? {
            let marker = if name == current { "*" } else { " " };
            println!("{} {}", marker, name);
        }
        return Ok(());
    };

    let outcome = manager.switch(
        &repo,
        &branch,
        from.as_deref(),
        !no_copy,
        LockMode::quick(quick),
    )?;
    if outcome.created {
        println!(
            "[{}] created branch {} ({} package files copied)",
            repo, outcome.to, outcome.copied
        );
    }
    println!("[{}] switched from {} to {}", repo, outcome.from, outcome.to);
    Ok(())
}

fn cmd_query(ctx: &RepositoryContext, command: QueryCommands) -> Result<()> {
    let mode = LockMode::default();
    match command {
        QueryCommands::Tags { repos, quiet, tags } => {
            print_hits(&Query::new(ctx, &repos, mode)?.tags(&tags)?, quiet);
        }
        QueryCommands::Needed {
            repos,
            quiet,
            packages,
        } => {
            for found in Query::new(ctx, &repos, mode)?.needed(&parse_specs(&packages)?)? {
                if !quiet {
                    println!("[{}] {}", found.hit.repository, found.hit.package.atom.qualified());
                }
                for lib in found.libraries {
                    if quiet {
                        println!("{}", lib.soname);
                    } else {
                        println!("    {} (elfclass {})", lib.soname, lib.elfclass);
                    }
                }
            }
        }
        QueryCommands::Required {
            repos,
            quiet,
            elfclass,
            libraries,
        } => {
            print_hits(
                &Query::new(ctx, &repos, mode)?.required(&libraries, elfclass)?,
                quiet,
            );
        }
        QueryCommands::Revdeps {
            repos,
            quiet,
            build,
            packages,
        } => {
            for found in Query::new(ctx, &repos, mode)?.revdeps(&parse_specs(&packages)?, build)? {
                if !quiet {
                    println!(
                        "[{}] {} ({} reverse dependencies)",
                        found.hit.repository,
                        found.hit.package.atom.qualified(),
                        found.dependents.len()
                    );
                }
                for dependent in found.dependents {
                    if quiet {
                        println!("{}", dependent.atom.qualified());
                    } else {
                        println!("    {}", dependent.atom.qualified());
                    }
                }
            }
        }
        QueryCommands::Sets { repos, quiet, sets } => {
            for set in Query::new(ctx, &repos, mode)?.sets(&sets)? {
                if quiet {
                    println!("{}", set.name);
                    continue;
                }
                println!("[{}] {}", set.repository, set.name);
                for spec in set.specs {
                    println!("    {}", spec);
                }
            }
        }
        QueryCommands::Desc {
            repos,
            quiet,
            patterns,
        } => {
            print_hits(&Query::new(ctx, &repos, mode)?.desc(&patterns)?, quiet);
        }
    }
    Ok(())
}

fn cmd_notice(ctx: &RepositoryContext, command: NoticeCommands) -> Result<()> {
    let mode = LockMode::default();
    match command {
        NoticeCommands::Add {
            title,
            body,
            link,
            repo,
        } => {
            let repo = repo_or_default(ctx, repo);
            let id = NoticeBoard::new(ctx, &repo).add(&title, &body, link.as_deref(), mode)?;
            println!("[{}] added notice {}", repo, id);
        }
        NoticeCommands::Remove { id, repo } => {
            let repo = repo_or_default(ctx, repo);
            NoticeBoard::new(ctx, &repo).remove(id, mode)?;
            println!("[{}] removed notice {}", repo, id);
        }
        NoticeCommands::Show { unread, repo } => {
            let repo = repo_or_default(ctx, repo);
            let board = NoticeBoard::new(ctx, &repo);
            let notices = if unread {
                board.unread(mode)?
            } else {
                board.show(mode)?
            };
            for notice in &notices {
                println!(
                    "#{} {} ({})",
                    notice.id.unwrap_or_default(),
                    notice.title,
                    notice.created_at
                );
                if !notice.body.is_empty() {
                    println!("    {}", notice.body);
                }
                if let Some(link) = &notice.link {
                    println!("    {}", link);
                }
            }
            if let Some(newest) = notices.iter().filter_map(|n| n.id).max() {
                board.mark_read(newest)?;
            }
            if notices.is_empty() {
                println!("[{}] no notices", repo);
            }
        }
    }
    Ok(())
}

fn cmd_preserved(ctx: &RepositoryContext, command: PreservedCommands) -> Result<()> {
    let conn = ctx.open_installed()?;
    let tracker = PreservedLibraries::new(&conn, &ctx.settings().install_root);
    match command {
        PreservedCommands::List => {
            for entry in tracker.list()? {
                println!(
                    "{} ({}, elfclass {}) from {}: {} consumers",
                    entry.library.path,
                    entry.library.soname,
                    entry.library.elfclass,
                    entry.library.atom,
                    entry.references()
                );
            }
        }
        PreservedCommands::Gc => {
            let candidates = tracker.gc()?;
            for candidate in &candidates {
                println!("{}: {}", candidate.library.path, candidate.reason.as_str());
            }
            if candidates.is_empty() {
                println!("No preserved libraries to remove");
            }
        }
        PreservedCommands::Collect { pretend } => {
            let candidates = tracker.gc()?;
            if pretend {
                for candidate in &candidates {
                    println!("would remove {}", candidate.library.path);
                }
                return Ok(());
            }
            let failed = tracker.collect(&candidates)?;
            println!("Removed {} preserved libraries", candidates.len() - failed.len());
            if !failed.is_empty() {
                bail!("Could not remove: {}", failed.join(", "));
            }
        }
    }
    Ok(())
}

/// Plan installing `specs` from the first enabled repository able to
/// satisfy all of them, in priority order
fn fix_plan(ctx: &RepositoryContext, installed: &rusqlite::Connection, specs: &[DepSpec]) -> Result<()> {
    let mut repos = ctx.select_repositories(&[])?;
    repos.sort_by_key(|r| r.priority);

    for repo in repos {
        let path = ctx.store_path(&repo.name, &repo.branch);
        if !path.exists() {
            continue;
        }
        let store = db::open(&path)?;
        match resolver::install_plan(&store, Some(installed), specs, &ResolveOptions::default()) {
            Ok(plan) => {
                println!("Packages from {} that would fix them:", repo.name);
                for package in plan {
                    println!("    {}", package.atom.qualified());
                }
                return Ok(());
            }
            Err(e) => warn!("{} cannot satisfy: {}", repo.name, e),
        }
    }
    bail!("No repository can satisfy the missing dependencies")
}

fn cmd_deptest(ctx: &RepositoryContext, ask: bool, quiet: bool, pretend: bool) -> Result<()> {
    let installed = ctx.open_installed()?;
    let missing = resolver::deptest(&installed)?;
    if missing.is_empty() {
        if !quiet {
            println!("All dependencies are satisfied");
        }
        return Ok(());
    }

    for entry in &missing {
        if quiet {
            println!("{}", entry.spec);
        } else {
            println!("{} needs {}", entry.atom.qualified(), entry.spec);
        }
    }

    if pretend || (ask && confirm("Look for packages satisfying them?")?) {
        let mut specs: Vec<DepSpec> = Vec::new();
        for entry in &missing {
            if !specs.contains(&entry.spec) {
                specs.push(entry.spec.clone());
            }
        }
        fix_plan(ctx, &installed, &specs)?;
    }
    bail!("{} unsatisfied dependencies", missing.len())
}

fn cmd_libtest(ctx: &RepositoryContext, quiet: bool) -> Result<()> {
    let installed = ctx.open_installed()?;
    let reports = resolver::libtest(&installed)?;
    if reports.is_empty() {
        if !quiet {
            println!("No broken libraries found");
        }
        return Ok(());
    }
    let count = reports.len();
    for report in reports {
        if quiet {
            println!("{}", report.atom.qualified());
        } else {
            println!("{}", report.into_error());
        }
    }
    bail!("{} broken library links", count)
}

fn cmd_cleanup(
    ctx: &RepositoryContext,
    quick: bool,
    pretend: bool,
    days: Option<u32>,
    repo: Option<String>,
    deprecated: bool,
) -> Result<()> {
    let repo = repo_or_default(ctx, repo);
    let mode = LockMode::quick(quick || pretend);
    let report = if deprecated {
        cleanup::vacuum(ctx, &repo, days, pretend, mode)?
    } else {
        cleanup::cleanup(ctx, &repo, days, pretend, mode)?
    };

    if report.is_empty() {
        println!("[{}] nothing to clean up", repo);
        return Ok(());
    }

    let verb = if pretend { "would remove" } else { "removed" };
    for record in &report.removed {
        println!("[{}] {} {}", repo, verb, record.download_path);
    }
    println!(
        "[{}] {} {} files, {} still within the expiration period",
        repo,
        verb,
        report.removed.len(),
        report.pending.len()
    );
    Ok(())
}

fn cmd_status(ctx: &RepositoryContext, repo: Option<String>) -> Result<()> {
    let names: Vec<String> = repo.into_iter().collect();
    let sys = ctx.open_system()?;
    let repos = if names.is_empty() {
        Repository::list_all(&sys)?
    } else {
        ctx.select_repositories(&names)?
    };
    let names: Vec<String> = repos.into_iter().map(|r| r.name).collect();

    for status in Query::new(ctx, &names, LockMode::default())?.status()? {
        let repo = &status.repository;
        println!("{}", repo.name);
        println!("    url:        {}", repo.url);
        println!("    enabled:    {}", repo.enabled);
        println!("    branch:     {}", repo.branch);
        println!(
            "    revision:   {}",
            repo.checksum.as_deref().unwrap_or("never updated")
        );
        if let Some(eapi) = repo.eapi {
            println!("    eapi:       {}", eapi);
        }
        if let Some(last_sync) = &repo.last_sync {
            println!("    last sync:  {}", last_sync);
        }
        match status.packages {
            Some(count) => println!("    packages:   {}", count),
            None => println!("    packages:   -"),
        }
        if status.unread_notices > 0 {
            println!("    notices:    {} unread", status.unread_notices);
        }
    }
    Ok(())
}

fn cmd_publish(ctx: &RepositoryContext, dest: &Path, repo: Option<String>) -> Result<()> {
    let repo = ctx.repository(&repo_or_default(ctx, repo))?;
    let _guard = ctx.locks().shared(&repo.name, LockMode::default())?;
    let conn = ctx.open_current_store(&repo.name)?;
    let outcome = mirror::publish(&conn, dest, &ctx.settings().product, &repo.branch)?;
    println!(
        "[{}] published {} packages at {} ({} deltas)",
        repo.name, outcome.packages, outcome.checksum, outcome.deltas
    );
    Ok(())
}

fn main() -> Result<()> {
    // Initialize tracing subscriber for logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let command = match cli.command {
        Some(command) => command,
        None => {
            println!("entropy v{}", env!("CARGO_PKG_VERSION"));
            println!("Run 'entropy --help' for usage information");
            return Ok(());
        }
    };

    match command {
        Commands::Init => return cmd_init(&cli.root),
        Commands::Completions { shell } => {
            clap_complete::generate(shell, &mut Cli::command(), "entropy", &mut io::stdout());
            return Ok(());
        }
        _ => {}
    }

    let ctx = RepositoryContext::load(&cli.root)?;
    info!("Using entropy root {}", cli.root.display());

    match command {
        Commands::Repo { command } => cmd_repo(&ctx, command),
        Commands::Update { force, repos } => cmd_update(&ctx, force, &repos),
        Commands::Branch {
            quick,
            from,
            no_copy,
            branch,
            repo,
        } => cmd_branch(&ctx, quick, from, no_copy, branch, repo),
        Commands::Query { command } => cmd_query(&ctx, command),
        Commands::Notice { command } => cmd_notice(&ctx, command),
        Commands::Preservedlibs { command } => cmd_preserved(&ctx, command),
        Commands::Deptest {
            ask,
            quiet,
            pretend,
        } => cmd_deptest(&ctx, ask, quiet, pretend),
        Commands::Libtest { quiet } => cmd_libtest(&ctx, quiet),
        Commands::Cleanup {
            quick,
            pretend,
            days,
            repo,
        } => cmd_cleanup(&ctx, quick, pretend, days, repo, false),
        Commands::Vacuum {
            quick,
            pretend,
            days,
            repo,
        } => cmd_cleanup(&ctx, quick, pretend, days, repo, true),
        Commands::Status { repo } => cmd_status(&ctx, repo),
        Commands::Search {
            repos,
            quiet,
            packages,
        } => {
            print_hits(&Query::new(&ctx, &repos, LockMode::default())?.search(&packages)?, quiet);
            Ok(())
        }
        Commands::Publish { dest, repo } => cmd_publish(&ctx, &dest, repo),
        Commands::Init | Commands::Completions { .. } => Ok(()),
    }
}
