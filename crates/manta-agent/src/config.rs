//! Agent configuration
//!
//! Loaded once from a TOML file, then overridden from the environment
//! (`.env` is honoured through `dotenvy`). The resulting [`AgentConfig`] is
//! shared read-only for the rest of the run.
//!
//! ```toml
//! root_dir = "/var/lib/manta"
//! endpoint = "https://ingest.example.com/upload"
//! history_size = 5
//!
//! [upload]
//! auth_token = "secret"
//! num_workers = 15
//!
//! [sql]
//! command_template = "COPY ({command}) TO STDOUT WITH CSV HEADER"
//! exec_template = "psql -X -q -f {statement} -o {output}"
//!
//! [[sql.commands]]
//! name = "people"
//! command = "SELECT id, name FROM people"
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::delta::DeltaOptions;
use crate::upload::UploadSettings;

// ============================================================================
// Configuration Constants
// ============================================================================

/// Config file read when `--config` is not given
pub const DEFAULT_CONFIG_FILE: &str = "manta.toml";

/// Archived snapshots kept after a successful run
pub const DEFAULT_HISTORY_SIZE: usize = 5;

/// Concurrent upload workers per file
pub const DEFAULT_NUM_WORKERS: usize = 15;

/// Data lines per upload request
pub const DEFAULT_CHUNK_SIZE: usize = 30;

/// Attempts per chunk before the file upload is abandoned
pub const DEFAULT_MAX_RETRIES: u32 = 10;

pub const DEFAULT_RETRY_DELAY_MS: u64 = 2_000;

pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 15;

/// Time without upload progress after which a file upload is abandoned
pub const DEFAULT_MAX_IDLE_SECS: u64 = 60;

pub const DEFAULT_PROGRESS_INTERVAL_MS: u64 = 5_000;

/// Statement template that runs the configured command unchanged
pub const DEFAULT_COMMAND_TEMPLATE: &str = "{command}";

const INPROGRESS_DIR: &str = "inprogress";
const ARCHIVE_DIR: &str = "archive";

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid value '{value}' for {var}: {reason}")]
    InvalidEnv {
        var: &'static str,
        value: String,
        reason: String,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl ConfigError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::Invalid(msg.into())
    }
}

/// Run-wide configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Holds the `inprogress` and `archive` roots
    #[serde(default)]
    pub root_dir: PathBuf,

    /// Base URL of the ingestion endpoint; each kind posts to `<endpoint>/<kind>`
    #[serde(default)]
    pub endpoint: String,

    #[serde(default = "default_history_size")]
    pub history_size: usize,

    #[serde(default)]
    pub upload: UploadConfig,

    #[serde(default)]
    pub sql: SqlConfig,
}

fn default_history_size() -> usize {
    DEFAULT_HISTORY_SIZE
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::new(),
            endpoint: String::new(),
            history_size: DEFAULT_HISTORY_SIZE,
            upload: UploadConfig::default(),
            sql: SqlConfig::default(),
        }
    }
}

impl AgentConfig {
    /// Read `path`, apply environment overrides and validate
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        // A missing .env file is normal
        dotenvy::dotenv().ok();

        let config = Self::from_file(path)?.with_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse `path` without overrides or validation
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.to_path_buf()));
        }

        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply `MANTA_*` environment variables
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides(|var| std::env::var(var).ok())
    }

    /// Apply overrides from `lookup`, which maps a variable name to its value
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(root) = lookup("MANTA_ROOT_DIR") {
            self.root_dir = PathBuf::from(root);
        }
        if let Some(endpoint) = lookup("MANTA_ENDPOINT") {
            self.endpoint = endpoint;
        }
        if let Some(token) = lookup("MANTA_AUTH_TOKEN") {
            self.upload.auth_token = Some(token);
        }
        if let Some(workers) = lookup("MANTA_NUM_WORKERS") {
            self.upload.num_workers = parse_env("MANTA_NUM_WORKERS", workers)?;
        }
        if let Some(history) = lookup("MANTA_HISTORY_SIZE") {
            self.history_size = parse_env("MANTA_HISTORY_SIZE", history)?;
        }
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.root_dir.as_os_str().is_empty() {
            return Err(ConfigError::invalid("root_dir must be set"));
        }
        if self.endpoint.trim().is_empty() {
            return Err(ConfigError::invalid("endpoint must be set"));
        }
        if self.history_size == 0 {
            return Err(ConfigError::invalid("history_size must be at least 1"));
        }
        self.upload.validate()?;
        self.sql.validate()
    }

    pub fn inprogress_dir(&self) -> PathBuf {
        self.root_dir.join(INPROGRESS_DIR)
    }

    pub fn archive_dir(&self) -> PathBuf {
        self.root_dir.join(ARCHIVE_DIR)
    }

    /// Upload URL for one kind
    pub fn kind_url(&self, kind: &str) -> String {
        format!("{}/{}", self.endpoint.trim_end_matches('/'), kind)
    }
}

fn parse_env<T>(var: &'static str, value: String) -> Result<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e: T::Err| ConfigError::InvalidEnv {
            var,
            reason: e.to_string(),
            value,
        })
}

/// `[upload]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// Sent as the `Auth-Token` header
    pub auth_token: Option<String>,
    pub num_workers: usize,
    pub chunk_size: usize,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub request_timeout_secs: u64,
    pub max_idle_secs: u64,
    pub progress_interval_ms: u64,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            auth_token: None,
            num_workers: DEFAULT_NUM_WORKERS,
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            max_idle_secs: DEFAULT_MAX_IDLE_SECS,
            progress_interval_ms: DEFAULT_PROGRESS_INTERVAL_MS,
        }
    }
}

impl UploadConfig {
    pub fn validate(&self) -> Result<()> {
        if self.num_workers == 0 {
            return Err(ConfigError::invalid("upload.num_workers must be at least 1"));
        }
        if self.chunk_size == 0 {
            return Err(ConfigError::invalid("upload.chunk_size must be at least 1"));
        }
        if self.max_retries == 0 {
            return Err(ConfigError::invalid("upload.max_retries must be at least 1"));
        }
        if self.progress_interval_ms == 0 {
            return Err(ConfigError::invalid(
                "upload.progress_interval_ms must be positive",
            ));
        }
        Ok(())
    }

    pub fn settings(&self) -> UploadSettings {
        UploadSettings {
            auth_token: self.auth_token.clone(),
            num_workers: self.num_workers,
            chunk_size: self.chunk_size,
            max_retries: self.max_retries,
            retry_delay: Duration::from_millis(self.retry_delay_ms),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            max_idle: Duration::from_secs(self.max_idle_secs),
            progress_interval: Duration::from_millis(self.progress_interval_ms),
        }
    }
}

/// `[sql]` section: how dumps are produced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SqlConfig {
    /// Wraps each command; `{command}` is replaced by the command text
    pub command_template: String,
    /// Shell command run per kind; `{statement}` and `{output}` are file paths
    pub exec_template: String,
    /// Optional transformation of the raw output; `{input}` and `{output}`
    pub post_command: Option<String>,
    /// Keep only the header and lines containing this text
    pub match_lines: Option<String>,
    pub commands: Vec<SqlCommandConfig>,
}

impl Default for SqlConfig {
    fn default() -> Self {
        Self {
            command_template: DEFAULT_COMMAND_TEMPLATE.to_string(),
            exec_template: String::new(),
            post_command: None,
            match_lines: None,
            commands: Vec::new(),
        }
    }
}

impl SqlConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.commands.is_empty() && self.exec_template.trim().is_empty() {
            return Err(ConfigError::invalid(
                "sql.exec_template must be set when sql.commands are configured",
            ));
        }

        let mut seen = BTreeSet::new();
        for command in &self.commands {
            if command.name.is_empty() || command.name.contains(['/', '\\']) {
                return Err(ConfigError::invalid(format!(
                    "Invalid sql command name '{}'",
                    command.name
                )));
            }
            if !seen.insert(command.name.as_str()) {
                return Err(ConfigError::invalid(format!(
                    "Duplicate sql command name '{}'",
                    command.name
                )));
            }
        }
        Ok(())
    }
}

/// One extraction: produces `<name>.csv`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SqlCommandConfig {
    pub name: String,
    pub command: String,
}

/// Which kinds a run uploads
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum KindFilter {
    #[default]
    All,
    Only(BTreeSet<String>),
}

impl KindFilter {
    pub fn includes(&self, kind: &str) -> bool {
        match self {
            KindFilter::All => true,
            KindFilter::Only(kinds) => kinds.contains(kind),
        }
    }
}

impl FromStr for KindFilter {
    type Err = ConfigError;

    /// `*` selects every kind, otherwise a comma-separated list of names
    fn from_str(s: &str) -> Result<Self> {
        let kinds: BTreeSet<String> = s
            .split(',')
            .map(str::trim)
            .filter(|kind| !kind.is_empty())
            .map(str::to_string)
            .collect();

        if kinds.is_empty() {
            return Err(ConfigError::invalid("No kinds given"));
        }
        if kinds.contains("*") {
            return Ok(KindFilter::All);
        }
        Ok(KindFilter::Only(kinds))
    }
}

impl fmt::Display for KindFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KindFilter::All => write!(f, "*"),
            KindFilter::Only(kinds) => {
                let names: Vec<&str> = kinds.iter().map(String::as_str).collect();
                write!(f, "{}", names.join(","))
            },
        }
    }
}

/// Per-invocation switches taken from the command line
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOptions {
    pub kinds: KindFilter,
    pub delta: DeltaOptions,
}
