// src/context.rs

//! Repository context
//!
//! Everything an operation needs to find its data is carried explicitly:
//! the root directory, the settings, the lock table and the plugin data.
//!
//! On-disk layout under the root:
//! - `settings.json`
//! - `system.db`: configured repositories and client state
//! - `installed.db`: installed packages store
//! - `repositories/<repo>/<product>/<branch>/packages.db`
//! - `repositories/<repo>/<product>/<branch>/packages/`: package files

use crate::db;
use crate::db::models::Repository;
use crate::error::{Error, Result};
use crate::lock::LockTable;
use crate::settings::Settings;
use crate::settings::plugins::PluginRegistry;
use rusqlite::Connection;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

pub const SETTINGS_FILE: &str = "settings.json";
pub const SYSTEM_DB: &str = "system.db";
pub const INSTALLED_DB: &str = "installed.db";
pub const STORE_DB: &str = "packages.db";
pub const PACKAGES_DIR: &str = "packages";

pub struct RepositoryContext {
    root: PathBuf,
    settings: Settings,
    locks: LockTable,
    plugin_data: BTreeMap<String, Value>,
}

impl RepositoryContext {
    /// Context with the built-in settings plugins
    pub fn new(root: impl Into<PathBuf>, settings: Settings) -> Result<Self> {
        Self::with_plugins(root, settings, PluginRegistry::with_builtins())
    }

    pub fn with_plugins(
        root: impl Into<PathBuf>,
        settings: Settings,
        plugins: PluginRegistry,
    ) -> Result<Self> {
        settings.validate()?;
        let plugin_data = plugins.aggregate(&settings)?;
        Ok(Self {
            root: root.into(),
            settings,
            locks: LockTable::new(),
            plugin_data,
        })
    }

    /// Context for a root, reading `<root>/settings.json` and the environment
    pub fn load(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let settings = Settings::load(&root.join(SETTINGS_FILE))?;
        debug!("Loaded context at {}", root.display());
        Self::new(root, settings)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn locks(&self) -> &LockTable {
        &self.locks
    }

    /// Output of one settings plugin
    pub fn plugin_data(&self, id: &str) -> Option<&Value> {
        self.plugin_data.get(id)
    }

    pub fn system_db_path(&self) -> PathBuf {
        self.root.join(SYSTEM_DB)
    }

    pub fn installed_db_path(&self) -> PathBuf {
        self.root.join(INSTALLED_DB)
    }

    /// Directory holding every branch of a repository for the current product
    pub fn repository_dir(&self, repository: &str) -> PathBuf {
        self.root
            .join("repositories")
            .join(repository)
            .join(&self.settings.product)
    }

    pub fn branch_dir(&self, repository: &str, branch: &str) -> PathBuf {
        self.repository_dir(repository).join(branch)
    }

    pub fn store_path(&self, repository: &str, branch: &str) -> PathBuf {
        self.branch_dir(repository, branch).join(STORE_DB)
    }

    pub fn packages_dir(&self, repository: &str, branch: &str) -> PathBuf {
        self.branch_dir(repository, branch).join(PACKAGES_DIR)
    }

    pub fn open_system(&self) -> Result<Connection> {
        db::open_or_init(&self.system_db_path())
    }

    pub fn open_installed(&self) -> Result<Connection> {
        db::open_or_init(&self.installed_db_path())
    }

    /// Configured repository by name
    pub fn repository(&self, name: &str) -> Result<Repository> {
        let conn = self.open_system()?;
        Repository::find_by_name(&conn, name)?
            .ok_or_else(|| Error::NotFoundError(format!("Repository not configured: {}", name)))
    }

    /// Store of a repository on its current branch
    pub fn open_current_store(&self, repository: &str) -> Result<Connection> {
        let repo = self.repository(repository)?;
        db::open_or_init(&self.store_path(&repo.name, &repo.branch))
    }

    /// Repositories to act on: the named ones, or every enabled one
    pub fn select_repositories(&self, names: &[String]) -> Result<Vec<Repository>> {
        let conn = self.open_system()?;
        if names.is_empty() {
            return Repository::list_enabled(&conn);
        }
        names
            .iter()
            .map(|name| {
                Repository::find_by_name(&conn, name)?.ok_or_else(|| {
                    Error::NotFoundError(format!("Repository not configured: {}", name))
                })
            })
            .collect()
    }
}
