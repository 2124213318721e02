use std::{
    collections::BTreeMap,
    path::PathBuf,
    sync::{Arc, RwLock},
};

use serde::{Deserialize, Serialize};

use crate::error::CatalogError;
use crate::strategy::PortStrategy;

pub const DEFAULT_COMMAND: &str = "uvicorn app.main:app --reload";

fn default_command() -> String {
    DEFAULT_COMMAND.to_string()
}

/// Static configuration of a registered app.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppConfig {
    pub name: String,
    pub path: PathBuf,
    #[serde(default = "default_command")]
    pub command: String,
    #[serde(default)]
    pub strategy: PortStrategy,
}

impl AppConfig {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            command: default_command(),
            strategy: PortStrategy::Any,
        }
    }

    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = command.into();
        self
    }

    pub fn with_strategy(mut self, strategy: PortStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Renders the run command for an instance bound to `port`.
    ///
    /// An existing `--port N` / `--port=N` is rewritten, otherwise `--port N` is appended.
    /// With `reload` off every `--reload` flag is dropped.
    pub fn command_for_port(&self, port: u16, reload: bool) -> String {
        let mut out: Vec<String> = Vec::new();
        let mut replaced = false;
        let mut tokens = self.command.split_whitespace();
        while let Some(tok) = tokens.next() {
            if tok == "--reload" && !reload {
                continue;
            }
            if tok == "--port" {
                out.push(tok.to_string());
                out.push(port.to_string());
                tokens.next();
                replaced = true;
                continue;
            }
            if tok.starts_with("--port=") {
                out.push(format!("--port={port}"));
                replaced = true;
                continue;
            }
            out.push(tok.to_string());
        }
        if !replaced {
            out.push("--port".to_string());
            out.push(port.to_string());
        }
        out.join(" ")
    }
}

fn validate_name(name: &str) -> Result<(), CatalogError> {
    let bad = name.is_empty()
        || name.len() > 128
        || name
            .chars()
            .any(|c| c.is_whitespace() || c.is_control() || matches!(c, '/' | '\\'));
    if bad {
        return Err(CatalogError::InvalidAppName(name.to_string()));
    }
    Ok(())
}

/// Full registration check: name, strategy and an existing path.
pub fn validate(app: &AppConfig) -> Result<(), CatalogError> {
    validate_name(&app.name)?;
    app.strategy.validate()?;
    if !app.path.exists() {
        return Err(CatalogError::PathNotFound(app.path.clone()));
    }
    Ok(())
}

/// App name → configuration. Mutations are rare; a single lock is enough.
#[derive(Debug, Default)]
pub struct Catalog {
    apps: RwLock<BTreeMap<String, Arc<AppConfig>>>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `app`, or replaces an existing entry when `replace` is set.
    ///
    /// Returns the replaced configuration, if any.
    pub fn register(
        &self,
        app: AppConfig,
        replace: bool,
    ) -> Result<Option<Arc<AppConfig>>, CatalogError> {
        validate(&app)?;
        let mut apps = self.apps.write().unwrap_or_else(|e| e.into_inner());
        if apps.contains_key(&app.name) && !replace {
            return Err(CatalogError::DuplicateApp(app.name));
        }
        Ok(apps.insert(app.name.clone(), Arc::new(app)))
    }

    /// Loads a persisted entry. The path is not required to exist any more.
    pub(crate) fn restore(&self, app: AppConfig) -> Result<(), CatalogError> {
        validate_name(&app.name)?;
        app.strategy.validate()?;
        let mut apps = self.apps.write().unwrap_or_else(|e| e.into_inner());
        apps.insert(app.name.clone(), Arc::new(app));
        Ok(())
    }

    pub fn set_strategy(
        &self,
        name: &str,
        strategy: PortStrategy,
    ) -> Result<Arc<AppConfig>, CatalogError> {
        strategy.validate()?;
        let mut apps = self.apps.write().unwrap_or_else(|e| e.into_inner());
        let current = apps
            .get(name)
            .ok_or_else(|| CatalogError::AppNotFound(name.to_string()))?;
        let updated = Arc::new(AppConfig {
            strategy,
            ..AppConfig::clone(current)
        });
        apps.insert(name.to_string(), updated.clone());
        Ok(updated)
    }

    pub fn remove(&self, name: &str) -> Option<Arc<AppConfig>> {
        self.apps
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name)
    }

    pub fn get(&self, name: &str) -> Option<Arc<AppConfig>> {
        self.apps
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.apps
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(name)
    }

    /// All apps, sorted by name.
    pub fn list(&self) -> Vec<AppConfig> {
        self.apps
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(|a| AppConfig::clone(a))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.apps.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
