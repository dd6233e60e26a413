//! Engine settings for strata.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (STRATA_HOME, STRATA_TRANSPORT)
//! 2. Config file (.strata/config.yaml)
//! 3. Defaults (~/.strata, s3am transport, 4 attempts)
//!
//! Config file discovery:
//! - Searches current directory and parents for .strata/config.yaml
//! - Paths in config file are relative to the .strata/ directory
//!
//! These settings describe the machine running the engine. The pipeline
//! configuration (units, shared options, tool sections) is a separate file
//! handled by [`crate::core::resolver`].

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, OnceLock};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::adapters::{HttpTransport, S3amTransport};
use crate::core::context::RetryPolicy;
use crate::core::fetch::{OfflineTransport, Transport};

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<EngineConfig, String>> = OnceLock::new();

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    pub version: String,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub fetch: Option<FetchConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// Engine state directory (relative to .strata/)
    pub home: Option<String>,
    /// Artifact store directory (relative to .strata/)
    pub store: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FetchConfig {
    pub transport: Option<TransportKind>,
    /// Helper binary for the s3am transport
    pub helper: Option<String>,
    pub max_attempts: Option<u32>,
    pub initial_delay_ms: Option<u64>,
}

/// Which transport moves remote objects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    S3am,
    Http,
    Offline,
}

impl FromStr for TransportKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "s3am" => Ok(TransportKind::S3am),
            "http" | "https" => Ok(TransportKind::Http),
            "offline" => Ok(TransportKind::Offline),
            other => anyhow::bail!("unknown transport '{}' (expected s3am, http or offline)", other),
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TransportKind::S3am => "s3am",
            TransportKind::Http => "http",
            TransportKind::Offline => "offline",
        })
    }
}

/// Fetch settings after defaults are applied
#[derive(Debug, Clone)]
pub struct FetchSettings {
    pub transport: TransportKind,
    pub helper: String,
    pub retry: RetryPolicy,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            transport: TransportKind::default(),
            helper: "s3am".to_string(),
            retry: RetryPolicy::default(),
        }
    }
}

impl FetchSettings {
    fn from_file(config: Option<&FetchConfig>) -> Self {
        let defaults = Self::default();
        let Some(config) = config else {
            return defaults;
        };
        let mut retry = defaults.retry;
        if let Some(attempts) = config.max_attempts {
            retry.max_attempts = attempts.max(1);
        }
        if let Some(delay) = config.initial_delay_ms {
            retry.initial_delay_ms = delay;
        }
        Self {
            transport: config.transport.unwrap_or(defaults.transport),
            helper: config.helper.clone().unwrap_or(defaults.helper),
            retry,
        }
    }

    /// Build the configured transport
    pub fn transport(&self) -> Arc<dyn Transport> {
        match self.transport {
            TransportKind::S3am => Arc::new(S3amTransport::with_binary_path(self.helper.clone())),
            TransportKind::Http => Arc::new(HttpTransport::new()),
            TransportKind::Offline => Arc::new(OfflineTransport),
        }
    }
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Absolute path to strata home (engine state)
    pub home: PathBuf,
    /// Absolute path to the artifact store
    pub store: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    pub fetch: FetchSettings,
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(".strata").join("config.yaml");
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

    serde_yaml::from_str(&content).with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to the config file's parent
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

/// Load configuration from all sources
fn load_config() -> Result<EngineConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(".strata");

    let config_file = find_config_file();
    let env_home = std::env::var("STRATA_HOME").ok().map(PathBuf::from);

    let (home, store, mut fetch) = if let Some(ref config_path) = config_file {
        let config = load_config_file(config_path)?;
        let strata_dir = config_path.parent().unwrap_or(Path::new("."));

        let home = match (env_home, &config.paths.home) {
            (Some(home), _) => home,
            (None, Some(home_path)) => resolve_path(strata_dir, home_path),
            (None, None) => default_home,
        };
        let store = config
            .paths
            .store
            .as_ref()
            .map(|p| resolve_path(strata_dir, p))
            .unwrap_or_else(|| home.join("store"));

        (home, store, FetchSettings::from_file(config.fetch.as_ref()))
    } else {
        let home = env_home.unwrap_or(default_home);
        let store = home.join("store");
        (home, store, FetchSettings::default())
    };

    if let Ok(transport) = std::env::var("STRATA_TRANSPORT") {
        fetch.transport = transport.parse()?;
    }

    Ok(EngineConfig {
        home,
        store,
        config_file,
        fetch,
    })
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static EngineConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| e.to_string()));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Get the runs directory ($STRATA_HOME/runs)
pub fn runs_dir() -> Result<PathBuf> {
    Ok(config()?.home.join("runs"))
}
