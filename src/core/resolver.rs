//! Pipeline configuration resolution.
//!
//! A pipeline configuration is a YAML mapping with two mandatory sections:
//!
//! ```yaml
//! units:                 # one entry per unit of work
//!   case-1:
//!     tumor_dna: s3://bucket/case-1/dna.fq.gz
//! shared:
//!   storage_location: aws:results-bucket   # or Local
//!   output_folder: /data/results
//!   encryption_key: /secrets/master.key    # required for remote storage
//!   key_is_master: true                    # optional, default false
//!   max_cores: 8                           # optional
//! ```
//!
//! Every other top-level key is a tool section. Tool options whose name ends
//! in a file-like suffix (`reference_fasta`, `dbsnp_vcf`, ...) are fetched
//! concurrently and replaced by artifact handles.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument};

use super::context::available_cores;
use super::fetch::{Credentials, FetchError, RemoteFetcher};
use super::task::Input;

/// Option name suffixes (after the last `_`) that name files to fetch
pub const FILE_OPTION_SUFFIXES: [&str; 9] = [
    "file", "vcf", "index", "fasta", "fai", "idx", "dict", "tbi", "config",
];

const UNITS: &str = "units";
const SHARED: &str = "shared";

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("configuration is not valid YAML: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("{section} is missing required keys: {}", .keys.join(", "))]
    MissingKeys { section: String, keys: Vec<String> },

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("failed to fetch {tool}.{option}: {source}")]
    Fetch {
        tool: String,
        option: String,
        #[source]
        source: FetchError,
    },
}

impl ConfigError {
    /// Whether this is a validation failure (as opposed to I/O or fetching)
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            ConfigError::Parse(_) | ConfigError::MissingKeys { .. } | ConfigError::Invalid(_)
        )
    }

    fn invalid(message: impl Into<String>) -> Self {
        ConfigError::Invalid(message.into())
    }
}

/// Where results are stored
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageMode {
    Local,
    Remote,
}

impl StorageMode {
    /// Normalise a `storage_location` value (`Local...`, `aws:...`, `s3://...`)
    pub fn normalize(raw: &str) -> Option<Self> {
        let lowered = raw.trim().to_ascii_lowercase();
        if lowered.starts_with("local") {
            Some(StorageMode::Local)
        } else if lowered.starts_with("aws") || lowered.starts_with("s3") {
            Some(StorageMode::Remote)
        } else {
            None
        }
    }
}

/// Options shared by every unit
#[derive(Debug, Clone, PartialEq)]
pub struct SharedOptions {
    /// The configured location, as written
    pub storage_location: String,
    pub storage_mode: StorageMode,
    pub output_folder: PathBuf,
    pub encryption_key: Option<PathBuf>,
    pub key_is_master: bool,
    pub max_cores: u32,
    /// Remaining keys, passed through to task bodies
    pub extra: Map<String, Value>,
}

impl SharedOptions {
    /// Credentials for fetching encrypted unit inputs
    pub fn credentials(&self) -> Option<Credentials> {
        self.encryption_key
            .as_ref()
            .map(|key| Credentials::new(key.clone(), self.key_is_master))
    }

    /// Serialisable view handed to task bodies
    pub fn to_value(&self) -> Value {
        let mut fields = self.extra.clone();
        fields.insert("storage_location".into(), Value::from(self.storage_location.clone()));
        fields.insert(
            "output_folder".into(),
            Value::from(self.output_folder.display().to_string()),
        );
        fields.insert("max_cores".into(), Value::from(self.max_cores));
        Value::Object(fields)
    }
}

/// One unit of work: input category to location reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitConfig {
    pub id: String,
    pub inputs: BTreeMap<String, String>,
}

/// Tool options after file-typed values have been fetched
pub type ToolOptions = BTreeMap<String, BTreeMap<String, Input>>;

/// Fully resolved pipeline configuration
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub units: Vec<UnitConfig>,
    pub shared: SharedOptions,
    pub tools: ToolOptions,
}

#[derive(Deserialize)]
struct RawShared {
    storage_location: String,
    output_folder: PathBuf,
    #[serde(default)]
    encryption_key: Option<PathBuf>,
    #[serde(default)]
    key_is_master: bool,
    #[serde(default)]
    max_cores: Option<u32>,
    #[serde(flatten)]
    extra: BTreeMap<String, serde_yaml::Value>,
}

/// Configuration checked for shape, before any fetching
#[derive(Debug, Clone)]
pub struct ValidatedConfig {
    pub units: Vec<UnitConfig>,
    pub shared: SharedOptions,
    pub tools: BTreeMap<String, Map<String, Value>>,
}

/// Validates configuration and expands it into per-unit entries
pub struct ConfigResolver {
    fetcher: RemoteFetcher,
    required_tools: Vec<String>,
    max_cores_override: Option<u32>,
}

impl ConfigResolver {
    pub fn new(fetcher: RemoteFetcher) -> Self {
        Self {
            fetcher,
            required_tools: Vec::new(),
            max_cores_override: None,
        }
    }

    /// Tool sections that must be present
    pub fn require_tools<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_tools = tools.into_iter().map(Into::into).collect();
        self
    }

    /// Per-job core limit that takes precedence over `shared.max_cores`
    pub fn max_cores(mut self, max_cores: Option<u32>) -> Self {
        self.max_cores_override = max_cores;
        self
    }

    /// Read, validate and resolve a configuration file
    pub async fn resolve_file(&self, path: &Path) -> Result<ResolvedConfig, ConfigError> {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        self.resolve_str(&text).await
    }

    pub async fn resolve_str(&self, yaml: &str) -> Result<ResolvedConfig, ConfigError> {
        let raw: serde_yaml::Value = serde_yaml::from_str(yaml)?;
        self.resolve(&raw).await
    }

    /// Validate, then fetch every file-typed tool option concurrently
    #[instrument(skip_all)]
    pub async fn resolve(&self, raw: &serde_yaml::Value) -> Result<ResolvedConfig, ConfigError> {
        let validated = self.validate(raw)?;
        info!(
            units = validated.units.len(),
            tools = validated.tools.len(),
            storage = ?validated.shared.storage_mode,
            max_cores = validated.shared.max_cores,
            "Configuration validated"
        );

        let tools = self.fetch_tool_inputs(validated.tools).await?;
        Ok(ResolvedConfig {
            units: validated.units,
            shared: validated.shared,
            tools,
        })
    }

    /// Shape checks only; nothing is fetched
    pub fn validate(&self, raw: &serde_yaml::Value) -> Result<ValidatedConfig, ConfigError> {
        let top = raw
            .as_mapping()
            .ok_or_else(|| ConfigError::invalid("configuration must be a mapping"))?;

        let missing: Vec<String> = [UNITS, SHARED]
            .iter()
            .filter(|key| !top.contains_key(**key))
            .map(|key| key.to_string())
            .collect();
        if !missing.is_empty() {
            return Err(ConfigError::MissingKeys {
                section: "configuration".into(),
                keys: missing,
            });
        }

        let mut units = Vec::new();
        let mut shared = None;
        let mut tools = BTreeMap::new();
        for (key, value) in top {
            let key = scalar_to_string(key)
                .ok_or_else(|| ConfigError::invalid("top-level keys must be strings"))?;
            match key.as_str() {
                UNITS => units = parse_units(value)?,
                SHARED => shared = Some(self.parse_shared(value)?),
                _ => {
                    tools.insert(key.clone(), parse_tool(&key, value)?);
                }
            }
        }

        let missing_tools: Vec<String> = self
            .required_tools
            .iter()
            .filter(|tool| !tools.contains_key(*tool))
            .cloned()
            .collect();
        if !missing_tools.is_empty() {
            return Err(ConfigError::MissingKeys {
                section: "tool sections".into(),
                keys: missing_tools,
            });
        }

        let shared = shared.ok_or_else(|| ConfigError::invalid("shared section is empty"))?;
        Ok(ValidatedConfig {
            units,
            shared,
            tools,
        })
    }

    fn parse_shared(&self, value: &serde_yaml::Value) -> Result<SharedOptions, ConfigError> {
        let mapping = value
            .as_mapping()
            .ok_or_else(|| ConfigError::invalid("shared must be a mapping"))?;

        let missing: Vec<String> = ["storage_location", "output_folder"]
            .iter()
            .filter(|key| !mapping.contains_key(**key))
            .map(|key| key.to_string())
            .collect();
        if !missing.is_empty() {
            return Err(ConfigError::MissingKeys {
                section: SHARED.into(),
                keys: missing,
            });
        }

        let raw: RawShared = serde_yaml::from_value(value.clone())
            .map_err(|e| ConfigError::invalid(format!("shared: {}", e)))?;

        let storage_mode = StorageMode::normalize(&raw.storage_location).ok_or_else(|| {
            ConfigError::invalid(format!(
                "storage_location '{}' must start with 'Local' or 'aws'",
                raw.storage_location
            ))
        })?;
        if storage_mode == StorageMode::Remote && raw.encryption_key.is_none() {
            return Err(ConfigError::invalid(format!(
                "storage_location '{}' is remote and requires encryption_key",
                raw.storage_location
            )));
        }

        let max_cores = self
            .max_cores_override
            .or(raw.max_cores)
            .unwrap_or_else(available_cores);
        if max_cores == 0 {
            return Err(ConfigError::invalid("max_cores must be at least 1"));
        }

        let extra = serde_json::to_value(&raw.extra)
            .map_err(|e| ConfigError::invalid(format!("shared: {}", e)))?;
        let Value::Object(extra) = extra else {
            return Err(ConfigError::invalid("shared must be a mapping"));
        };

        Ok(SharedOptions {
            storage_location: raw.storage_location,
            storage_mode,
            output_folder: raw.output_folder,
            encryption_key: raw.encryption_key,
            key_is_master: raw.key_is_master,
            max_cores,
            extra,
        })
    }

    async fn fetch_tool_inputs(
        &self,
        tools: BTreeMap<String, Map<String, Value>>,
    ) -> Result<ToolOptions, ConfigError> {
        let mut resolved: ToolOptions = BTreeMap::new();
        let mut fetches = JoinSet::new();

        for (tool, options) in tools {
            let entry = resolved.entry(tool.clone()).or_default();
            for (option, value) in options {
                if !is_file_option(&option) {
                    entry.insert(option, Input::Value(value));
                    continue;
                }
                let reference = value.as_str().map(str::to_string).ok_or_else(|| {
                    ConfigError::invalid(format!("{}.{} must be a path or URL", tool, option))
                })?;

                debug!(%tool, %option, %reference, "Fetching tool input");
                let fetcher = self.fetcher.clone();
                let tool = tool.clone();
                fetches.spawn(async move {
                    let result = fetcher.fetch(&reference, None).await;
                    (tool, option, result)
                });
            }
        }

        while let Some(joined) = fetches.join_next().await {
            let (tool, option, result) =
                joined.map_err(|e| ConfigError::invalid(format!("tool input fetch aborted: {}", e)))?;
            let handle = result.map_err(|source| ConfigError::Fetch {
                tool: tool.clone(),
                option: option.clone(),
                source,
            })?;
            resolved
                .entry(tool)
                .or_default()
                .insert(option, Input::Artifact(handle));
        }

        Ok(resolved)
    }
}

/// Whether a tool option names a file to fetch
pub fn is_file_option(option: &str) -> bool {
    option
        .rsplit('_')
        .next()
        .map_or(false, |suffix| FILE_OPTION_SUFFIXES.contains(&suffix))
}

fn scalar_to_string(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::String(s) => Some(s.clone()),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        serde_yaml::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn parse_units(value: &serde_yaml::Value) -> Result<Vec<UnitConfig>, ConfigError> {
    let mapping = value
        .as_mapping()
        .ok_or_else(|| ConfigError::invalid("units must be a mapping of unit id to inputs"))?;
    if mapping.is_empty() {
        return Err(ConfigError::invalid("units is empty"));
    }

    let mut units = Vec::with_capacity(mapping.len());
    for (id, inputs) in mapping {
        let id = scalar_to_string(id).ok_or_else(|| ConfigError::invalid("unit ids must be scalars"))?;
        let inputs = inputs
            .as_mapping()
            .ok_or_else(|| ConfigError::invalid(format!("unit '{}' must map input categories to locations", id)))?;

        let mut parsed = BTreeMap::new();
        for (category, location) in inputs {
            let category = scalar_to_string(category)
                .ok_or_else(|| ConfigError::invalid(format!("unit '{}' has a non-scalar input name", id)))?;
            let location = scalar_to_string(location).ok_or_else(|| {
                ConfigError::invalid(format!("unit '{}' input '{}' must be a path or URL", id, category))
            })?;
            parsed.insert(category, location);
        }
        units.push(UnitConfig { id, inputs: parsed });
    }
    Ok(units)
}

fn parse_tool(tool: &str, value: &serde_yaml::Value) -> Result<Map<String, Value>, ConfigError> {
    if value.is_null() {
        return Ok(Map::new());
    }
    match serde_json::to_value(value) {
        Ok(Value::Object(options)) => Ok(options),
        Ok(_) => Err(ConfigError::invalid(format!("tool section '{}' must be a mapping", tool))),
        Err(e) => Err(ConfigError::invalid(format!("tool section '{}': {}", tool, e))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::context::RunContext;
    use crate::core::store::MemoryArtifactStore;
    use std::sync::Arc;

    fn resolver() -> ConfigResolver {
        let context = RunContext::offline(Arc::new(MemoryArtifactStore::new()));
        ConfigResolver::new(context.fetcher())
    }

    fn parse(yaml: &str) -> serde_yaml::Value {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_storage_mode_normalisation() {
        assert_eq!(StorageMode::normalize("Local"), Some(StorageMode::Local));
        assert_eq!(StorageMode::normalize("local_disk"), Some(StorageMode::Local));
        assert_eq!(StorageMode::normalize("aws:bucket"), Some(StorageMode::Remote));
        assert_eq!(StorageMode::normalize("S3://bucket"), Some(StorageMode::Remote));
        assert_eq!(StorageMode::normalize("gcs://bucket"), None);
    }

    #[test]
    fn test_file_option_suffixes() {
        assert!(is_file_option("genome_fasta"));
        assert!(is_file_option("dbsnp_vcf"));
        assert!(is_file_option("config"));
        assert!(!is_file_option("n"));
        assert!(!is_file_option("fasta_version"));
    }

    #[test]
    fn test_missing_sections_are_named() {
        let err = resolver().validate(&parse("other: {}")).unwrap_err();
        assert!(err.is_validation());
        match err {
            ConfigError::MissingKeys { keys, .. } => assert_eq!(keys, vec!["units", "shared"]),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_unit_ids_and_defaults() {
        let config = resolver()
            .max_cores(Some(3))
            .validate(&parse(
                "units:\n  17:\n    tumor: /tmp/a.fq\nshared:\n  storage_location: Local\n  output_folder: /out\n  java_Xmx: 20G\n",
            ))
            .unwrap();

        assert_eq!(config.units[0].id, "17");
        assert_eq!(config.shared.storage_mode, StorageMode::Local);
        assert!(!config.shared.key_is_master);
        assert_eq!(config.shared.max_cores, 3);
        assert_eq!(config.shared.extra["java_Xmx"], "20G");
        assert!(config.shared.credentials().is_none());
    }

    #[test]
    fn test_required_tools() {
        let err = resolver()
            .require_tools(["pipeline", "rank"])
            .validate(&parse(
                "units: {u: {a: b}}\nshared: {storage_location: Local, output_folder: /o}\npipeline: {}\n",
            ))
            .unwrap_err();
        match err {
            ConfigError::MissingKeys { keys, .. } => assert_eq!(keys, vec!["rank"]),
            other => panic!("unexpected error: {other}"),
        }
    }
}
