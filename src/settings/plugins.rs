// src/settings/plugins.rs

//! Settings plugins
//!
//! A plugin derives extra configuration from the base `Settings` under its
//! own id. The registry runs every plugin once at context setup and keeps
//! the results keyed by plugin id.

use super::Settings;
use crate::error::{Error, Result};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use tracing::debug;

/// Contributes derived settings under a unique id
pub trait SettingsPlugin: Send + Sync {
    fn id(&self) -> &str;

    /// Compute this plugin's settings from the base settings
    fn produce(&self, settings: &Settings) -> Result<Value>;
}

/// Ordered set of plugins with unique ids
#[derive(Default)]
pub struct PluginRegistry {
    plugins: Vec<Box<dyn SettingsPlugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the built-in plugins
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.plugins.push(Box::new(ServerPlugin));
        registry.plugins.push(Box::new(ClientPlugin));
        registry
    }

    /// Add a plugin; a second plugin with the same id is rejected
    pub fn register(&mut self, plugin: Box<dyn SettingsPlugin>) -> Result<()> {
        if self.plugins.iter().any(|p| p.id() == plugin.id()) {
            return Err(Error::ConflictError(format!(
                "Settings plugin already registered: {}",
                plugin.id()
            )));
        }
        debug!("Registered settings plugin {}", plugin.id());
        self.plugins.push(plugin);
        Ok(())
    }

    pub fn ids(&self) -> Vec<&str> {
        self.plugins.iter().map(|p| p.id()).collect()
    }

    /// Run every plugin against `settings`
    pub fn aggregate(&self, settings: &Settings) -> Result<BTreeMap<String, Value>> {
        self.plugins
            .iter()
            .map(|p| Ok((p.id().to_string(), p.produce(settings)?)))
            .collect()
    }
}

/// Repository server knobs
pub struct ServerPlugin;

impl SettingsPlugin for ServerPlugin {
    fn id(&self) -> &str {
        "server"
    }

    fn produce(&self, settings: &Settings) -> Result<Value> {
        Ok(json!({
            "expiration_days": settings.expiration_days,
            "community_mode": settings.community_mode,
            "weak_package_files": settings.weak_package_files,
        }))
    }
}

/// Client transfer knobs
pub struct ClientPlugin;

impl SettingsPlugin for ClientPlugin {
    fn id(&self) -> &str {
        "client"
    }

    fn produce(&self, settings: &Settings) -> Result<Value> {
        Ok(json!({
            "download_timeout": settings.download_timeout,
            "download_speed_limit": settings.download_speed_limit,
            "download_retries": settings.download_retries,
            "eapi_levels": settings.eapi_levels,
        }))
    }
}
