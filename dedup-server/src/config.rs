use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;

use dedup_storage::{DedupStore, Durability, StorageEngine, StoreConfig};

use crate::metrics::SharedMetrics;

const DEFAULT_HOST: &str = "localhost";
const DEFAULT_PORT: u16 = 8014;
const DEFAULT_METRIC_PORT: u16 = 9100;
const DEFAULT_LOG_LEVEL: &str = "info";

/// Flags of the `server` command. Unset flags fall back to the config file,
/// then to the built-in defaults.
#[derive(Parser, Debug, Clone, Default)]
pub struct ServerArgs {
    #[arg(long, help = "TOML config file; explicit flags take precedence")]
    pub config: Option<PathBuf>,

    #[arg(long, help = "Blob storage root [default: .]")]
    pub fs_root: Option<PathBuf>,

    #[arg(long, help = "Metadata storage root [default: .]")]
    pub meta_root: Option<PathBuf>,

    #[arg(long, help = "API listen host [default: localhost]")]
    pub host: Option<String>,

    #[arg(long, help = "API listen port [default: 8014]")]
    pub port: Option<u16>,

    #[arg(long, help = "Metrics listen host [default: localhost]")]
    pub metric_host: Option<String>,

    #[arg(long, help = "Metrics listen port [default: 9100]")]
    pub metric_port: Option<u16>,

    #[arg(long, help = "Metadata DB (fjall, memory) [default: fjall]")]
    pub metadata_db: Option<StorageEngine>,

    #[arg(long, help = "Durability level (buffer, fsync, fdatasync) [default: fdatasync]")]
    pub durability: Option<Durability>,

    #[arg(long, help = "Largest accepted upload in bytes; unlimited if unset")]
    pub max_upload_size: Option<u64>,

    #[arg(
        long,
        help = "Log level (error, warn, info, debug, trace). Can also be set via RUST_LOG env var [default: info]"
    )]
    pub log_level: Option<String>,
}

/// Layout of the optional TOML config file.
///
/// ```toml
/// [server]
/// host = "0.0.0.0"
/// port = 8014
///
/// [storage]
/// fs_root = "/var/lib/dedup/fs"
/// metadata_db = "fjall"
/// max_upload_size = 104857600
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub storage: StorageSection,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerSection {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub metric_host: Option<String>,
    pub metric_port: Option<u16>,
    pub log_level: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StorageSection {
    pub fs_root: Option<PathBuf>,
    pub meta_root: Option<PathBuf>,
    pub metadata_db: Option<String>,
    pub durability: Option<String>,
    pub max_upload_size: Option<u64>,
}

impl FileConfig {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }
}

/// Fully resolved server settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub fs_root: PathBuf,
    pub meta_root: PathBuf,
    pub host: String,
    pub port: u16,
    pub metric_host: String,
    pub metric_port: u16,
    pub engine: StorageEngine,
    pub durability: Durability,
    pub max_upload_size: Option<u64>,
    pub log_level: String,
}

impl ServerConfig {
    /// Reads the config file named by `args`, if any, and merges it with the
    /// flags.
    pub fn from_args(args: ServerArgs) -> Result<Self> {
        let file = match &args.config {
            Some(path) => FileConfig::load_from_file(path)?,
            None => FileConfig::default(),
        };
        Self::resolve(args, file)
    }

    pub fn resolve(args: ServerArgs, file: FileConfig) -> Result<Self> {
        let engine = match (args.metadata_db, file.storage.metadata_db) {
            (Some(engine), _) => engine,
            (None, Some(raw)) => raw.parse().map_err(anyhow::Error::msg)?,
            (None, None) => StorageEngine::Fjall,
        };
        let durability = match (args.durability, file.storage.durability) {
            (Some(durability), _) => durability,
            (None, Some(raw)) => raw.parse().map_err(anyhow::Error::msg)?,
            (None, None) => Durability::Fdatasync,
        };

        Ok(Self {
            fs_root: args
                .fs_root
                .or(file.storage.fs_root)
                .unwrap_or_else(|| PathBuf::from(".")),
            meta_root: args
                .meta_root
                .or(file.storage.meta_root)
                .unwrap_or_else(|| PathBuf::from(".")),
            host: args
                .host
                .or(file.server.host)
                .unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port: args.port.or(file.server.port).unwrap_or(DEFAULT_PORT),
            metric_host: args
                .metric_host
                .or(file.server.metric_host)
                .unwrap_or_else(|| DEFAULT_HOST.to_string()),
            metric_port: args
                .metric_port
                .or(file.server.metric_port)
                .unwrap_or(DEFAULT_METRIC_PORT),
            engine,
            durability,
            max_upload_size: args.max_upload_size.or(file.storage.max_upload_size),
            log_level: args
                .log_level
                .or(file.server.log_level)
                .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string()),
        })
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            fs_root: self.fs_root.clone(),
            meta_root: self.meta_root.clone(),
            engine: self.engine,
            durability: Some(self.durability),
            max_upload_size: self.max_upload_size,
        }
    }
}

/// Store location shared by the offline commands.
#[derive(Parser, Debug, Clone)]
pub struct StoreArgs {
    #[arg(long, default_value = ".")]
    pub meta_root: PathBuf,

    #[arg(long, default_value = ".")]
    pub fs_root: PathBuf,

    #[arg(long, default_value = "fjall", help = "Metadata DB (fjall, memory)")]
    pub metadata_db: StorageEngine,
}

impl StoreArgs {
    pub fn open(&self) -> Result<DedupStore> {
        let config = StoreConfig {
            fs_root: self.fs_root.clone(),
            meta_root: self.meta_root.clone(),
            engine: self.metadata_db,
            durability: None,
            max_upload_size: None,
        };
        DedupStore::open(&config, SharedMetrics::new().to_storage_metrics()).with_context(|| {
            format!(
                "Failed to open store at {} / {}",
                self.meta_root.display(),
                self.fs_root.display()
            )
        })
    }
}

/// Creates `path` if needed and makes it absolute.
pub fn canonical_root(path: &Path) -> Result<PathBuf> {
    fs::create_dir_all(path).with_context(|| format!("Failed to create {}", path.display()))?;
    path.canonicalize()
        .with_context(|| format!("Failed to resolve {}", path.display()))
}
