// src/settings/mod.rs

//! Typed settings for Entropy
//!
//! Settings are read from `<root>/settings.json` (every field optional),
//! then environment overrides are applied:
//! - `ETP_BRANCH`
//! - `ETP_EXPIRATION_DAYS`
//! - `ETP_DOWNLOAD_TIMEOUT` (seconds)
//! - `ETP_DOWNLOAD_SPEED_LIMIT` (KiB/s, `0` disables the limit)

pub mod plugins;

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Highest repository format level this client understands
pub const MAX_EAPI: u32 = 3;

/// Global and server-side settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Branch new repositories start on
    pub branch: String,
    pub product: String,
    pub official_repository_id: String,
    /// KiB/s; `None` means unlimited
    pub download_speed_limit: Option<u64>,
    /// Seconds before a fetch is abandoned
    pub download_timeout: u64,
    pub download_retries: u32,
    /// Default for repositories added without an explicit choice
    pub differential_update: bool,
    /// Supported repository format levels, highest first
    pub eapi_levels: Vec<u32>,
    /// Days an expired package file is kept before cleanup
    pub expiration_days: u32,
    pub community_mode: bool,
    pub weak_package_files: bool,
    /// Install root used for preserved library paths
    pub install_root: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            branch: "5".to_string(),
            product: "standard".to_string(),
            official_repository_id: "main".to_string(),
            download_speed_limit: None,
            download_timeout: 30,
            download_retries: 3,
            differential_update: true,
            eapi_levels: vec![3, 2, 1],
            expiration_days: 15,
            community_mode: false,
            weak_package_files: false,
            install_root: PathBuf::from("/"),
        }
    }
}

fn env_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::ParseError(format!("{} is not a number: {}", key, value)))
}

impl Settings {
    /// Load settings from a JSON file (defaults when missing) plus the process environment
    pub fn load(path: &Path) -> Result<Self> {
        let mut settings = Self::from_file(path)?;
        settings.apply_env(|key| std::env::var(key).ok())?;
        settings.validate()?;
        Ok(settings)
    }

    /// Read a settings file; a missing file yields defaults
    pub fn from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("No settings at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map_err(|e| Error::ParseError(format!("{}: {}", path.display(), e)))
    }

    /// Persist settings as pretty JSON
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| Error::ParseError(format!("Cannot serialize settings: {}", e)))?;
        std::fs::write(path, json)?;
        info!("Settings written to {}", path.display());
        Ok(())
    }

    /// Apply overrides from an environment lookup
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(branch) = lookup("ETP_BRANCH") {
            self.branch = branch;
        }
        if let Some(days) = lookup("ETP_EXPIRATION_DAYS") {
            self.expiration_days = env_number("ETP_EXPIRATION_DAYS", &days)?;
        }
        if let Some(timeout) = lookup("ETP_DOWNLOAD_TIMEOUT") {
            self.download_timeout = env_number("ETP_DOWNLOAD_TIMEOUT", &timeout)?;
        }
        if let Some(limit) = lookup("ETP_DOWNLOAD_SPEED_LIMIT") {
            let limit: u64 = env_number("ETP_DOWNLOAD_SPEED_LIMIT", &limit)?;
            self.download_speed_limit = (limit > 0).then_some(limit);
        }
        Ok(())
    }

    /// Reject values no operation can work with
    pub fn validate(&self) -> Result<()> {
        crate::branch::validate_name(&self.branch)?;
        if self.product.is_empty() || self.product.contains('/') {
            return Err(Error::ParseError(format!("Invalid product: {}", self.product)));
        }
        if self.download_timeout == 0 {
            return Err(Error::ParseError("download_timeout must be positive".to_string()));
        }
        if self.eapi_levels.is_empty()
            || self.eapi_levels.iter().any(|l| *l == 0 || *l > MAX_EAPI)
        {
            return Err(Error::ParseError(format!(
                "eapi_levels must be within 1..={}: {:?}",
                MAX_EAPI, self.eapi_levels
            )));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout)
    }

    /// Format levels to try for a repository, highest first
    ///
    /// Level 3 (differential) is only offered when the repository allows it.
    pub fn eapi_order(&self, differential: bool) -> Vec<u32> {
        let mut levels: Vec<u32> = self
            .eapi_levels
            .iter()
            .copied()
            .filter(|l| differential || *l < 3)
            .collect();
        levels.sort_unstable_by(|a, b| b.cmp(a));
        levels.dedup();
        levels
    }
}
