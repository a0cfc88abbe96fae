//! Configuration for sectorflow paths and pipeline defaults.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (SECTORFLOW_HOME)
//! 2. Config file (.sectorflow/config.yaml)
//! 3. Defaults (~/.sectorflow)
//!
//! Config file discovery:
//! - Searches current directory and parents for .sectorflow/config.yaml
//! - Paths in config file are relative to the .sectorflow/ directory

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::core::definition::ConfigOverrides;

/// Environment variable overriding the state directory
pub const HOME_ENV: &str = "SECTORFLOW_HOME";

const CONFIG_DIR: &str = ".sectorflow";
const CONFIG_FILE: &str = "config.yaml";

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    pub version: String,
    #[serde(default)]
    pub paths: PathsConfig,
    /// Applied to every pipeline before its own overrides
    #[serde(default)]
    pub defaults: ConfigOverrides,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// State directory (relative to .sectorflow/)
    pub home: Option<String>,
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// State directory: cache, checkpoints and run logs
    pub home: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    /// Pipeline config defaults
    pub defaults: ConfigOverrides,
}

impl ResolvedConfig {
    /// Extraction cache snapshots
    pub fn cache_dir(&self) -> PathBuf {
        self.home.join("cache")
    }

    /// Pre-step checkpoints
    pub fn checkpoints_dir(&self) -> PathBuf {
        self.home.join("checkpoints")
    }

    /// One event log directory per run
    pub fn runs_dir(&self) -> PathBuf {
        self.home.join("runs")
    }
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(CONFIG_DIR).join(CONFIG_FILE);
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to `base`
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

/// Combine the sources in priority order
fn resolve(
    config_file: Option<PathBuf>,
    env_home: Option<PathBuf>,
    default_home: PathBuf,
) -> Result<ResolvedConfig> {
    let Some(config_path) = config_file else {
        return Ok(ResolvedConfig {
            home: env_home.unwrap_or(default_home),
            config_file: None,
            defaults: ConfigOverrides::default(),
        });
    };

    let file = load_config_file(&config_path)?;
    let config_dir = config_path.parent().unwrap_or(Path::new("."));

    let home = match (env_home, &file.paths.home) {
        (Some(env_home), _) => env_home,
        (None, Some(home)) => resolve_path(config_dir, home),
        (None, None) => default_home,
    };

    Ok(ResolvedConfig {
        home,
        config_file: Some(config_path),
        defaults: file.defaults,
    })
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(CONFIG_DIR);
    let env_home = std::env::var(HOME_ENV).ok().map(PathBuf::from);

    resolve(find_config_file(), env_home, default_home)
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| format!("{:#}", e)));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Get the runs directory ($SECTORFLOW_HOME/runs)
pub fn runs_dir() -> Result<PathBuf> {
    Ok(config()?.runs_dir())
}
