//! Configuration management for alog
//!
//! Every section can be omitted; missing fields and zero values fall back to
//! the defaults below.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::item::Level;
use crate::store::{ConsoleOptions, FileStoreOptions};

/// Tag used when the caller does not provide one
pub const DEFAULT_TAG: &str = "alog";

pub const DEFAULT_FILE_PATH: &str = "logs";
/// Rotation threshold (2 MiB)
pub const DEFAULT_FILE_MAX_BYTES: u64 = 2 * 1024 * 1024;
pub const DEFAULT_GC_INTERVAL_MINS: u64 = 60;
pub const DEFAULT_FILE_NAME_TEMPLATE: &str = "{date}.log";
pub const DEFAULT_FILE_TIME_TEMPLATE: &str = "{time:%Y-%m-%d %H:%M:%S%.3f}";
pub const DEFAULT_FILE_TEMPLATE: &str = "[{time}] [{level}] [{tag}] {message}";

pub const DEFAULT_CONSOLE_TIME_TEMPLATE: &str = "{time:%H:%M:%S%.3f}";
pub const DEFAULT_CONSOLE_TEMPLATE: &str = "{time} {level_short} [{tag}] {message}";

pub const DEFAULT_DOCUMENT_URL: &str = "memory://";
pub const DEFAULT_DATABASE_TEMPLATE: &str = "alog";
pub const DEFAULT_COLLECTION_TEMPLATE: &str = "{tag}";

pub const DEFAULT_BATCH_SIZE: usize = 256;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 200;

pub const DEFAULT_INGEST_PORT: u16 = 7070;

/// How `log` calls reach the stores
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchMode {
    /// Queue in the buffer; a background worker writes to the stores
    #[default]
    Buffered,
    /// Write to every store in the calling thread
    Direct,
}

/// Buffer and dispatch settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    pub mode: DispatchMode,

    /// Maximum queued items, 0 for unbounded. When full the oldest item is dropped.
    pub capacity: usize,

    /// Items written per worker wake-up (default: 256)
    pub batch_size: usize,

    /// Worker poll interval when idle (default: 200ms)
    pub poll_interval_ms: u64,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            mode: DispatchMode::Buffered,
            capacity: 0,
            batch_size: DEFAULT_BATCH_SIZE,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
        }
    }
}

impl BufferConfig {
    /// Batch size with the default applied for 0
    pub fn effective_batch_size(&self) -> usize {
        if self.batch_size == 0 {
            DEFAULT_BATCH_SIZE
        } else {
            self.batch_size
        }
    }

    /// Poll interval with the default applied for 0
    pub fn poll_interval(&self) -> Duration {
        let ms = if self.poll_interval_ms == 0 {
            DEFAULT_POLL_INTERVAL_MS
        } else {
            self.poll_interval_ms
        };
        Duration::from_millis(ms)
    }
}

/// Console output settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsoleConfig {
    pub enabled: bool,
    pub color: bool,
    pub time_template: String,
    pub template: String,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            color: true,
            time_template: DEFAULT_CONSOLE_TIME_TEMPLATE.to_string(),
            template: DEFAULT_CONSOLE_TEMPLATE.to_string(),
        }
    }
}

impl ConsoleConfig {
    /// Sink options with defaults applied to empty templates
    pub fn options(&self) -> ConsoleOptions {
        ConsoleOptions {
            color: self.color,
            time_template: non_empty(&self.time_template, DEFAULT_CONSOLE_TIME_TEMPLATE),
            template: non_empty(&self.template, DEFAULT_CONSOLE_TEMPLATE),
        }
    }
}

/// Rotating file store settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Store root; `~` is expanded, relative paths resolve against the working directory
    #[serde(default = "default_file_path")]
    pub path: PathBuf,

    /// Rotation threshold in bytes (default: 2 MiB)
    #[serde(default = "default_max_bytes")]
    pub max_bytes: u64,

    /// Delete files older than this many days; 0 keeps everything
    #[serde(default)]
    pub retain_days: u64,

    /// Minutes between retention sweeps (default: 60)
    #[serde(default = "default_gc_interval_mins")]
    pub gc_interval_mins: u64,

    /// Sub-directory template, empty for none
    #[serde(default)]
    pub child_template: String,

    #[serde(default = "default_name_template")]
    pub name_template: String,

    #[serde(default = "default_file_time_template")]
    pub time_template: String,

    #[serde(default = "default_file_template")]
    pub template: String,
}

fn default_true() -> bool {
    true
}

fn default_file_path() -> PathBuf {
    PathBuf::from(DEFAULT_FILE_PATH)
}

fn default_max_bytes() -> u64 {
    DEFAULT_FILE_MAX_BYTES
}

fn default_gc_interval_mins() -> u64 {
    DEFAULT_GC_INTERVAL_MINS
}

fn default_name_template() -> String {
    DEFAULT_FILE_NAME_TEMPLATE.to_string()
}

fn default_file_time_template() -> String {
    DEFAULT_FILE_TIME_TEMPLATE.to_string()
}

fn default_file_template() -> String {
    DEFAULT_FILE_TEMPLATE.to_string()
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: default_file_path(),
            max_bytes: default_max_bytes(),
            retain_days: 0,
            gc_interval_mins: default_gc_interval_mins(),
            child_template: String::new(),
            name_template: default_name_template(),
            time_template: default_file_time_template(),
            template: default_file_template(),
        }
    }
}

impl FileConfig {
    /// Store options with defaults applied to zero and empty values
    pub fn options(&self) -> FileStoreOptions {
        let path = if self.path.as_os_str().is_empty() {
            default_file_path()
        } else {
            self.path.clone()
        };
        let max_bytes = if self.max_bytes == 0 {
            DEFAULT_FILE_MAX_BYTES
        } else {
            self.max_bytes
        };
        let gc_mins = if self.gc_interval_mins == 0 {
            DEFAULT_GC_INTERVAL_MINS
        } else {
            self.gc_interval_mins
        };

        FileStoreOptions {
            root: path,
            max_bytes,
            retain_days: self.retain_days,
            gc_interval: Duration::from_secs(gc_mins.saturating_mul(60)),
            child_template: self.child_template.clone(),
            name_template: non_empty(&self.name_template, DEFAULT_FILE_NAME_TEMPLATE),
            time_template: non_empty(&self.time_template, DEFAULT_FILE_TIME_TEMPLATE),
            template: non_empty(&self.template, DEFAULT_FILE_TEMPLATE),
        }
    }
}

/// Document store settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DocumentConfig {
    pub enabled: bool,
    pub url: String,
    pub database_template: String,
    pub collection_template: String,
}

impl Default for DocumentConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: DEFAULT_DOCUMENT_URL.to_string(),
            database_template: DEFAULT_DATABASE_TEMPLATE.to_string(),
            collection_template: DEFAULT_COLLECTION_TEMPLATE.to_string(),
        }
    }
}

impl DocumentConfig {
    /// Connection URL with the default applied when empty
    pub fn effective_url(&self) -> &str {
        if self.url.is_empty() {
            DEFAULT_DOCUMENT_URL
        } else {
            &self.url
        }
    }
}

/// HTTP ingestion endpoint settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    pub enabled: bool,
    /// Port on 127.0.0.1 (default: 7070)
    pub port: u16,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: DEFAULT_INGEST_PORT,
        }
    }
}

/// Pipeline configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Default tag for items logged without one
    #[serde(default = "default_tag")]
    pub tag: String,

    /// Items below this level are discarded
    #[serde(default = "default_min_level")]
    pub min_level: Level,

    /// Forward `tracing` events from other crates into the pipeline
    #[serde(default)]
    pub bridge_tracing: bool,

    #[serde(default)]
    pub buffer: BufferConfig,

    #[serde(default)]
    pub console: ConsoleConfig,

    #[serde(default)]
    pub file: FileConfig,

    #[serde(default)]
    pub document: DocumentConfig,

    #[serde(default)]
    pub ingest: IngestConfig,
}

fn default_tag() -> String {
    DEFAULT_TAG.to_string()
}

fn default_min_level() -> Level {
    Level::Debug
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tag: default_tag(),
            min_level: default_min_level(),
            bridge_tracing: false,
            buffer: BufferConfig::default(),
            console: ConsoleConfig::default(),
            file: FileConfig::default(),
            document: DocumentConfig::default(),
            ingest: IngestConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from the default path, or return default if not found
    pub fn load() -> Result<Self> {
        Self::load_from(&config_file_path())
    }

    /// Load configuration from a file, or return default if it does not exist
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            Self::parse(&content)
        } else {
            Ok(Self::default())
        }
    }

    /// Parse configuration from TOML text
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse config file")
    }

    /// Save configuration to a file
    pub fn save_to(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create config directory")?;
        }
        std::fs::write(path, content).context("Failed to write config file")?;
        Ok(())
    }

    /// Tag with the default applied when empty
    pub fn effective_tag(&self) -> &str {
        if self.tag.is_empty() {
            DEFAULT_TAG
        } else {
            &self.tag
        }
    }
}

fn non_empty(value: &str, default: &str) -> String {
    if value.is_empty() {
        default.to_string()
    } else {
        value.to_string()
    }
}

/// Get the base configuration directory (~/.alog)
/// Falls back to ./.alog if home directory cannot be determined
pub fn config_dir() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".alog"))
        .unwrap_or_else(|| {
            tracing::warn!("Could not determine home directory, using current directory for config");
            PathBuf::from(".alog")
        })
}

/// Get the path to the config file
pub fn config_file_path() -> PathBuf {
    config_dir().join("config.toml")
}
